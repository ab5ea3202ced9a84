//! Channel URI grammar: `sluice(:scheme)?:media?key=value|key=value`.
//!
//! `sluice:ipc` addresses the in-process shared-memory path,
//! `sluice:udp?endpoint=host:port` the network path, and the
//! `sluice-spy:` prefix attaches a local reader directly to a network
//! publication's log.

use sluice_logbuffer::{descriptor, frame};
use sluice_timing::Nanos;

use crate::{
    config::{DriverConfig, parse_bool, parse_size},
    error::DriverError,
};

pub const SCHEME: &str = "sluice:";
pub const SPY_PREFIX: &str = "sluice-spy:";
pub const IPC_MEDIA: &str = "ipc";
pub const UDP_MEDIA: &str = "udp";

const RECOGNIZED_KEYS: &[&str] = &[
    "endpoint",
    "control",
    "control-mode",
    "term-length",
    "mtu",
    "init-term-id",
    "term-id",
    "term-offset",
    "session-id",
    "linger",
    "sparse",
    "eos",
    "tether",
    "group",
    "rejoin",
    "ssc",
    "so-sndbuf",
    "so-rcvbuf",
    "rcv-wnd",
    "reliable",
    "ttl",
    "cc",
    "fc",
    "gtag",
    "alias",
    "tags",
    "response-correlation-id",
    "nak-delay",
    "untethered-window-limit-timeout",
    "untethered-linger-timeout",
    "untethered-resting-timeout",
    "max-resend",
    "stream-id",
    "pub-wnd",
    "channel-rcv-ts-offset",
    "channel-snd-ts-offset",
    "media-rcv-ts-offset",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Media {
    Udp,
    Ipc,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ControlMode {
    #[default]
    None,
    Manual,
    Dynamic,
    Response,
}

#[derive(Clone, Debug)]
pub struct ChannelUri {
    raw: String,
    pub is_spy: bool,
    pub media: Media,
    params: Vec<(String, String)>,
}

impl ChannelUri {
    pub fn parse(raw: &str) -> Result<Self, DriverError> {
        let raw = raw.trim();
        let invalid = || DriverError::InvalidChannel(raw.to_string());

        let (is_spy, rest) = match raw.strip_prefix(SPY_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let rest = rest.strip_prefix(SCHEME).ok_or_else(invalid)?;

        let (media_str, query) = match rest.split_once('?') {
            Some((m, q)) => (m, Some(q)),
            None => (rest, None),
        };
        let media = match media_str {
            UDP_MEDIA => Media::Udp,
            IPC_MEDIA => Media::Ipc,
            _ => return Err(invalid()),
        };
        if is_spy && media != Media::Udp {
            return Err(invalid());
        }

        let mut params = Vec::new();
        if let Some(query) = query {
            if query.is_empty() {
                return Err(invalid());
            }
            for pair in query.split('|') {
                let (key, value) = pair.split_once('=').ok_or_else(invalid)?;
                if key.is_empty() || value.is_empty() {
                    return Err(invalid());
                }
                if !RECOGNIZED_KEYS.contains(&key) {
                    return Err(DriverError::InvalidChannel(format!(
                        "{raw}: unrecognized param '{key}'"
                    )));
                }
                if params.iter().any(|(k, _)| k == key) {
                    return Err(DriverError::InvalidChannel(format!(
                        "{raw}: duplicate param '{key}'"
                    )));
                }
                params.push((key.to_string(), value.to_string()));
            }
        }

        Ok(Self { raw: raw.to_string(), is_spy, media, params })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Identity used to match publications with subscriptions and to share
    /// endpoints: media plus the addressing params, everything else
    /// (windows, timeouts, session filters) stripped.
    pub fn canonical(&self) -> String {
        match self.media {
            Media::Ipc => format!("{SCHEME}{IPC_MEDIA}"),
            Media::Udp => {
                let mut out = format!("{SCHEME}{UDP_MEDIA}");
                let mut separator = '?';
                for key in ["endpoint", "control", "tags"] {
                    if let Some(value) = self.get(key) {
                        out.push(separator);
                        out.push_str(key);
                        out.push('=');
                        out.push_str(value);
                        separator = '|';
                    }
                }
                out
            }
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool, DriverError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => parse_bool(v)
                .ok_or_else(|| DriverError::InvalidChannel(format!("{}: bad bool {key}={v}", self.raw))),
        }
    }

    fn get_duration(&self, key: &str) -> Result<Option<Nanos>, DriverError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|e| DriverError::InvalidChannel(format!("{}: bad {key}={v}: {e}", self.raw))),
        }
    }

    fn get_size(&self, key: &str) -> Result<Option<usize>, DriverError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => parse_size(v)
                .map(Some)
                .ok_or_else(|| DriverError::InvalidChannel(format!("{}: bad {key}={v}", self.raw))),
        }
    }

    fn get_i32(&self, key: &str) -> Result<Option<i32>, DriverError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| DriverError::InvalidChannel(format!("{}: bad {key}={v}", self.raw))),
        }
    }

    fn get_i64(&self, key: &str) -> Result<Option<i64>, DriverError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| DriverError::InvalidChannel(format!("{}: bad {key}={v}", self.raw))),
        }
    }

    fn control_mode(&self) -> Result<ControlMode, DriverError> {
        match self.get("control-mode") {
            None => Ok(ControlMode::None),
            Some("manual") => Ok(ControlMode::Manual),
            Some("dynamic") => Ok(ControlMode::Dynamic),
            Some("response") => Ok(ControlMode::Response),
            Some(v) => {
                Err(DriverError::InvalidChannel(format!("{}: bad control-mode={v}", self.raw)))
            }
        }
    }

    /// `reserved` requests stamping into the header's reserved slot; any
    /// non-negative integer is an explicit payload offset.
    fn timestamp_offset(&self, key: &str) -> Result<Option<i32>, DriverError> {
        match self.get(key) {
            None => Ok(None),
            Some("reserved") => Ok(Some(-1)),
            Some(v) => match v.parse::<i32>() {
                Ok(offset) if offset >= 0 => Ok(Some(offset)),
                _ => Err(DriverError::InvalidChannel(format!("{}: bad {key}={v}", self.raw))),
            },
        }
    }

    fn response_correlation_id(&self) -> Result<Option<i64>, DriverError> {
        match self.get("response-correlation-id") {
            None => Ok(None),
            Some("prototype") => Ok(Some(-1)),
            Some(v) => match v.parse::<i64>() {
                Ok(id) if id >= -1 => Ok(Some(id)),
                _ => Err(DriverError::InvalidChannel(format!(
                    "{}: bad response-correlation-id={v}",
                    self.raw
                ))),
            },
        }
    }
}

/// Flow-control strategy selection from the `fc` param:
/// `fc=max|min|tagged,g:<tag>[,t:<timeout>]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FcOptions {
    pub strategy: FcStrategy,
    pub group_tag: Option<i64>,
    pub receiver_timeout: Option<Nanos>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FcStrategy {
    #[default]
    Max,
    Min,
    Tagged,
}

impl FcOptions {
    fn parse(raw: &str, uri: &str) -> Result<Self, DriverError> {
        let invalid = |detail: &str| {
            DriverError::InvalidChannel(format!("{uri}: bad fc={raw}: {detail}"))
        };
        let mut parts = raw.split(',');
        let strategy = match parts.next() {
            Some("max") => FcStrategy::Max,
            Some("min") => FcStrategy::Min,
            Some("tagged") => FcStrategy::Tagged,
            _ => return Err(invalid("unknown strategy")),
        };
        let mut options = Self { strategy, group_tag: None, receiver_timeout: None };
        for part in parts {
            if let Some(tag) = part.strip_prefix("g:") {
                options.group_tag =
                    Some(tag.parse().map_err(|_| invalid("bad group tag"))?);
            } else if let Some(timeout) = part.strip_prefix("t:") {
                options.receiver_timeout =
                    Some(timeout.parse().map_err(|_| invalid("bad timeout"))?);
            } else {
                return Err(invalid("unknown option"));
            }
        }
        if options.strategy == FcStrategy::Tagged && options.group_tag.is_none() {
            return Err(invalid("tagged requires g:<tag>"));
        }
        Ok(options)
    }
}

/// Typed view of the publication-relevant params, validated.
#[derive(Clone, Debug)]
pub struct PublicationParams {
    pub term_length: usize,
    pub mtu_length: usize,
    pub publication_window: usize,
    pub session_id: Option<i32>,
    /// `(initialTermId, termId, termOffset)`; only valid for exclusive
    /// publications and only as a full triple.
    pub starting_term: Option<(i32, i32, i32)>,
    pub linger: Option<Nanos>,
    pub signal_eos: bool,
    pub is_sparse: bool,
    pub spies_simulate_connection: Option<bool>,
    pub flow_control: FcOptions,
    pub untethered_window_limit_timeout: Option<Nanos>,
    pub untethered_linger_timeout: Option<Nanos>,
    pub untethered_resting_timeout: Option<Nanos>,
    pub max_resend: usize,
    pub control_mode: ControlMode,
    pub endpoint: Option<String>,
    pub control: Option<String>,
}

impl PublicationParams {
    pub fn resolve(
        uri: &ChannelUri,
        config: &DriverConfig,
        is_exclusive: bool,
    ) -> Result<Self, DriverError> {
        let default_term = match uri.media {
            Media::Ipc => config.ipc_term_buffer_length,
            Media::Udp => config.term_buffer_length,
        };
        let term_length = uri.get_size("term-length")?.unwrap_or(default_term);
        descriptor::check_term_length(term_length).map_err(DriverError::LogBuffer)?;

        let mtu_length = uri.get_size("mtu")?.unwrap_or(config.mtu_length);
        if mtu_length % frame::FRAME_ALIGNMENT != 0 || mtu_length < frame::HEADER_LENGTH * 2 {
            return Err(DriverError::InvalidChannel(format!(
                "{}: mtu {mtu_length} must be a multiple of {}",
                uri.as_str(),
                frame::FRAME_ALIGNMENT
            )));
        }

        let initial_term_id = uri.get_i32("init-term-id")?;
        let term_id = uri.get_i32("term-id")?;
        let term_offset = uri.get_i32("term-offset")?;
        let starting_term = match (initial_term_id, term_id, term_offset) {
            (None, None, None) => None,
            (Some(initial), Some(id), Some(offset)) => {
                if !is_exclusive {
                    return Err(DriverError::InvalidChannel(format!(
                        "{}: explicit term position requires an exclusive publication",
                        uri.as_str()
                    )));
                }
                if offset < 0
                    || offset as usize > term_length
                    || offset as usize % frame::FRAME_ALIGNMENT != 0
                {
                    return Err(DriverError::InvalidChannel(format!(
                        "{}: bad term-offset {offset}",
                        uri.as_str()
                    )));
                }
                if descriptor::term_count(id, initial) < 0 {
                    return Err(DriverError::InvalidChannel(format!(
                        "{}: term-id {id} is before init-term-id {initial}",
                        uri.as_str()
                    )));
                }
                Some((initial, id, offset))
            }
            _ => {
                return Err(DriverError::InvalidChannel(format!(
                    "{}: init-term-id, term-id and term-offset must be supplied together",
                    uri.as_str()
                )));
            }
        };

        let window = uri
            .get_size("pub-wnd")?
            .unwrap_or_else(|| config.term_window_length(term_length));
        if window > term_length / 2 {
            return Err(DriverError::InvalidChannel(format!(
                "{}: pub-wnd {window} exceeds half the term",
                uri.as_str()
            )));
        }

        let flow_control = match uri.get("fc") {
            Some(raw) => FcOptions::parse(raw, uri.as_str())?,
            None => FcOptions::default(),
        };
        if let Some(cc) = uri.get("cc") {
            if cc != "static" {
                return Err(DriverError::InvalidChannel(format!(
                    "{}: unsupported cc={cc}",
                    uri.as_str()
                )));
            }
        }

        // parsed for validity; consumers are outside the core
        uri.timestamp_offset("channel-snd-ts-offset")?;
        uri.timestamp_offset("channel-rcv-ts-offset")?;
        uri.timestamp_offset("media-rcv-ts-offset")?;
        uri.response_correlation_id()?;
        uri.get_size("so-sndbuf")?;
        uri.get_size("so-rcvbuf")?;
        uri.get_i32("ttl")?;

        Ok(Self {
            term_length,
            mtu_length,
            publication_window: window,
            session_id: uri.get_i32("session-id")?,
            starting_term,
            linger: uri.get_duration("linger")?,
            signal_eos: uri.get_bool("eos", true)?,
            is_sparse: uri.get_bool("sparse", false)?,
            spies_simulate_connection: match uri.get("ssc") {
                None => None,
                Some(v) => Some(parse_bool(v).ok_or_else(|| {
                    DriverError::InvalidChannel(format!("{}: bad ssc={v}", uri.as_str()))
                })?),
            },
            flow_control,
            untethered_window_limit_timeout: uri.get_duration("untethered-window-limit-timeout")?,
            untethered_linger_timeout: uri.get_duration("untethered-linger-timeout")?,
            untethered_resting_timeout: uri.get_duration("untethered-resting-timeout")?,
            max_resend: uri
                .get_i32("max-resend")?
                .map_or(config.max_resend, |v| v.max(1) as usize),
            control_mode: uri.control_mode()?,
            endpoint: uri.get("endpoint").map(str::to_string),
            control: uri.get("control").map(str::to_string),
        })
    }
}

/// Typed view of the subscription-relevant params, validated.
#[derive(Clone, Debug)]
pub struct SubscriptionParams {
    pub is_reliable: bool,
    pub is_rejoin: bool,
    pub is_tether: bool,
    pub group: Option<bool>,
    pub session_id: Option<i32>,
    pub receiver_window: Option<usize>,
    pub group_tag: Option<i64>,
    pub nak_delay: Option<Nanos>,
    pub untethered_window_limit_timeout: Option<Nanos>,
    pub untethered_linger_timeout: Option<Nanos>,
    pub untethered_resting_timeout: Option<Nanos>,
    pub control_mode: ControlMode,
    pub endpoint: Option<String>,
    pub control: Option<String>,
}

impl SubscriptionParams {
    pub fn resolve(uri: &ChannelUri, _config: &DriverConfig) -> Result<Self, DriverError> {
        if let Some(window) = uri.get_size("rcv-wnd")? {
            if !window.is_power_of_two() {
                return Err(DriverError::InvalidChannel(format!(
                    "{}: rcv-wnd {window} must be a power of two",
                    uri.as_str()
                )));
            }
        }
        uri.timestamp_offset("channel-rcv-ts-offset")?;
        uri.response_correlation_id()?;

        Ok(Self {
            is_reliable: uri.get_bool("reliable", true)?,
            is_rejoin: uri.get_bool("rejoin", true)?,
            is_tether: uri.get_bool("tether", true)?,
            group: match uri.get("group") {
                None => None,
                Some(v) => Some(parse_bool(v).ok_or_else(|| {
                    DriverError::InvalidChannel(format!("{}: bad group={v}", uri.as_str()))
                })?),
            },
            session_id: uri.get_i32("session-id")?,
            receiver_window: uri.get_size("rcv-wnd")?,
            group_tag: uri.get_i64("gtag")?,
            nak_delay: uri.get_duration("nak-delay")?,
            untethered_window_limit_timeout: uri.get_duration("untethered-window-limit-timeout")?,
            untethered_linger_timeout: uri.get_duration("untethered-linger-timeout")?,
            untethered_resting_timeout: uri.get_duration("untethered-resting-timeout")?,
            control_mode: uri.control_mode()?,
            endpoint: uri.get("endpoint").map(str::to_string),
            control: uri.get("control").map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DriverConfig {
        DriverConfig::default()
    }

    #[test]
    fn parses_ipc() {
        let uri = ChannelUri::parse("sluice:ipc").unwrap();
        assert_eq!(uri.media, Media::Ipc);
        assert!(!uri.is_spy);
        assert!(uri.get("endpoint").is_none());
    }

    #[test]
    fn parses_udp_with_params() {
        let uri = ChannelUri::parse(
            "sluice:udp?endpoint=localhost:40123|term-length=64k|mtu=1408|fc=tagged,g:7,t:2s",
        )
        .unwrap();
        assert_eq!(uri.media, Media::Udp);
        assert_eq!(uri.get("endpoint"), Some("localhost:40123"));
        let params = PublicationParams::resolve(&uri, &config(), false).unwrap();
        assert_eq!(params.term_length, 64 * 1024);
        assert_eq!(params.mtu_length, 1408);
        assert_eq!(params.flow_control.strategy, FcStrategy::Tagged);
        assert_eq!(params.flow_control.group_tag, Some(7));
        assert_eq!(params.flow_control.receiver_timeout, Some(Nanos::from_secs(2)));
    }

    #[test]
    fn parses_spy() {
        let uri = ChannelUri::parse("sluice-spy:sluice:udp?endpoint=h:1").unwrap();
        assert!(uri.is_spy);
        assert_eq!(uri.canonical(), "sluice:udp?endpoint=h:1");
        assert!(ChannelUri::parse("sluice-spy:sluice:ipc").is_err());
    }

    #[test]
    fn canonical_strips_non_identity_params() {
        let a = ChannelUri::parse("sluice:udp?endpoint=h:1|term-length=64k|mtu=1408").unwrap();
        let b = ChannelUri::parse("sluice:udp?endpoint=h:1|rcv-wnd=64k").unwrap();
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(
            ChannelUri::parse("sluice:ipc?term-length=64k").unwrap().canonical(),
            "sluice:ipc"
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(ChannelUri::parse("udp://h:1").is_err());
        assert!(ChannelUri::parse("sluice:tcp").is_err());
        assert!(ChannelUri::parse("sluice:udp?endpoint").is_err());
        assert!(ChannelUri::parse("sluice:udp?bogus-key=1").is_err());
        assert!(ChannelUri::parse("sluice:udp?mtu=1408|mtu=1408").is_err());
    }

    #[test]
    fn term_position_triple() {
        let uri = ChannelUri::parse(
            "sluice:ipc?init-term-id=5|term-id=7|term-offset=96",
        )
        .unwrap();
        let params = PublicationParams::resolve(&uri, &config(), true).unwrap();
        assert_eq!(params.starting_term, Some((5, 7, 96)));

        // non-exclusive publications may not pin the term position
        assert!(PublicationParams::resolve(&uri, &config(), false).is_err());

        let partial = ChannelUri::parse("sluice:ipc?term-id=7").unwrap();
        assert!(PublicationParams::resolve(&partial, &config(), true).is_err());

        let unaligned =
            ChannelUri::parse("sluice:ipc?init-term-id=5|term-id=7|term-offset=33").unwrap();
        assert!(PublicationParams::resolve(&unaligned, &config(), true).is_err());
    }

    #[test]
    fn durations_accept_units_and_bare_nanos() {
        let uri =
            ChannelUri::parse("sluice:udp?endpoint=h:1|nak-delay=100us|linger=5s").unwrap();
        let sub = SubscriptionParams::resolve(&uri, &config()).unwrap();
        assert_eq!(sub.nak_delay, Some(Nanos::from_micros(100)));
        let publication = PublicationParams::resolve(&uri, &config(), false).unwrap();
        assert_eq!(publication.linger, Some(Nanos::from_secs(5)));

        let uri = ChannelUri::parse("sluice:udp?endpoint=h:1|nak-delay=1500").unwrap();
        let sub = SubscriptionParams::resolve(&uri, &config()).unwrap();
        assert_eq!(sub.nak_delay, Some(Nanos(1500)));
    }

    #[test]
    fn timestamp_offsets() {
        let uri = ChannelUri::parse(
            "sluice:udp?endpoint=h:1|channel-rcv-ts-offset=reserved|channel-snd-ts-offset=8",
        )
        .unwrap();
        PublicationParams::resolve(&uri, &config(), false).unwrap();

        let bad =
            ChannelUri::parse("sluice:udp?endpoint=h:1|channel-snd-ts-offset=-3").unwrap();
        assert!(PublicationParams::resolve(&bad, &config(), false).is_err());
    }

    #[test]
    fn response_correlation_id_values() {
        for raw in ["prototype", "-1", "42"] {
            let uri = ChannelUri::parse(&format!(
                "sluice:udp?endpoint=h:1|control-mode=response|response-correlation-id={raw}"
            ))
            .unwrap();
            SubscriptionParams::resolve(&uri, &config()).unwrap();
        }
        let bad = ChannelUri::parse(
            "sluice:udp?endpoint=h:1|response-correlation-id=-2",
        )
        .unwrap();
        assert!(SubscriptionParams::resolve(&bad, &config()).is_err());
    }

    #[test]
    fn subscription_flags_default_on() {
        let uri = ChannelUri::parse("sluice:udp?endpoint=h:1|tether=false").unwrap();
        let sub = SubscriptionParams::resolve(&uri, &config()).unwrap();
        assert!(!sub.is_tether);
        assert!(sub.is_reliable);
        assert!(sub.is_rejoin);
    }
}
