//! Immutable driver configuration, built once at startup from environment
//! variables layered over defaults. Durations accept a bare integer
//! (nanoseconds) or humantime (`5ms`); sizes accept `k`/`m`/`g` suffixes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sluice_timing::Nanos;
use sluice_utils::directories::default_driver_dir;

use crate::error::DriverError;

pub const APP_NAME: &str = "sluice";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadingMode {
    /// Conductor, sender and receiver on one thread.
    Shared,
    /// Conductor on one thread, sender + receiver on another.
    #[default]
    SharedNetwork,
    /// One thread each.
    Dedicated,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverConfig {
    pub dir: PathBuf,
    pub threading_mode: ThreadingMode,

    pub publication_unblock_timeout: Nanos,
    pub image_liveness_timeout: Nanos,
    pub client_liveness_timeout: Nanos,
    pub status_message_timeout: Nanos,
    pub publication_linger_timeout: Nanos,
    pub nak_unicast_delay: Nanos,
    pub nak_multicast_max_backoff: Nanos,
    pub untethered_window_limit_timeout: Nanos,
    pub untethered_linger_timeout: Nanos,
    pub untethered_resting_timeout: Nanos,
    pub counter_free_to_reuse_timeout: Nanos,
    pub retransmit_action_linger_timeout: Nanos,
    pub flow_control_receiver_timeout: Nanos,

    pub mtu_length: usize,
    pub term_buffer_length: usize,
    pub ipc_term_buffer_length: usize,
    pub initial_window_length: usize,
    pub file_page_size: usize,
    pub publication_window_length: usize,

    pub error_buffer_length: usize,
    pub loss_report_buffer_length: usize,
    pub counter_values_buffer_length: usize,
    pub conductor_buffer_length: usize,
    pub to_clients_buffer_length: usize,

    pub max_resend: usize,
    pub async_task_executor_threads: usize,
    pub spies_simulate_connection: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            dir: default_driver_dir(APP_NAME),
            threading_mode: ThreadingMode::default(),

            publication_unblock_timeout: Nanos::from_secs(15),
            image_liveness_timeout: Nanos::from_secs(10),
            client_liveness_timeout: Nanos::from_secs(10),
            status_message_timeout: Nanos::from_millis(200),
            publication_linger_timeout: Nanos::from_secs(5),
            nak_unicast_delay: Nanos::from_micros(100),
            nak_multicast_max_backoff: Nanos::from_millis(10),
            untethered_window_limit_timeout: Nanos::from_secs(5),
            untethered_linger_timeout: Nanos::from_secs(5),
            untethered_resting_timeout: Nanos::from_secs(10),
            counter_free_to_reuse_timeout: Nanos::from_secs(1),
            retransmit_action_linger_timeout: Nanos::from_millis(60),
            flow_control_receiver_timeout: Nanos::from_secs(5),

            mtu_length: 1408,
            term_buffer_length: 16 * 1024 * 1024,
            ipc_term_buffer_length: 64 * 1024 * 1024,
            initial_window_length: 128 * 1024,
            file_page_size: 4 * 1024,
            publication_window_length: 0, // 0 = half the term

            error_buffer_length: 1024 * 1024,
            loss_report_buffer_length: 1024 * 1024,
            counter_values_buffer_length: 1024 * 1024,
            conductor_buffer_length: 1024 * 1024 + 768,
            to_clients_buffer_length: 1024 * 1024 + 768,

            max_resend: 16,
            async_task_executor_threads: 1,
            spies_simulate_connection: false,
        }
    }
}

impl DriverConfig {
    /// Layer `SLUICE_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, DriverError> {
        let mut config = Self::default();
        if let Some(dir) = read_env("SLUICE_DIR") {
            config.dir = PathBuf::from(dir);
        }
        if let Some(mode) = read_env("SLUICE_THREADING_MODE") {
            config.threading_mode = match mode.as_str() {
                "shared" => ThreadingMode::Shared,
                "shared-network" => ThreadingMode::SharedNetwork,
                "dedicated" => ThreadingMode::Dedicated,
                other => {
                    return Err(DriverError::Generic(format!("unknown threading mode: {other}")));
                }
            };
        }

        duration_env("SLUICE_PUBLICATION_UNBLOCK_TIMEOUT", &mut config.publication_unblock_timeout)?;
        duration_env("SLUICE_IMAGE_LIVENESS_TIMEOUT", &mut config.image_liveness_timeout)?;
        duration_env("SLUICE_CLIENT_LIVENESS_TIMEOUT", &mut config.client_liveness_timeout)?;
        duration_env("SLUICE_STATUS_MESSAGE_TIMEOUT", &mut config.status_message_timeout)?;
        duration_env("SLUICE_PUBLICATION_LINGER_TIMEOUT", &mut config.publication_linger_timeout)?;
        duration_env("SLUICE_NAK_UNICAST_DELAY", &mut config.nak_unicast_delay)?;
        duration_env("SLUICE_NAK_MULTICAST_MAX_BACKOFF", &mut config.nak_multicast_max_backoff)?;
        duration_env(
            "SLUICE_UNTETHERED_WINDOW_LIMIT_TIMEOUT",
            &mut config.untethered_window_limit_timeout,
        )?;
        duration_env("SLUICE_UNTETHERED_LINGER_TIMEOUT", &mut config.untethered_linger_timeout)?;
        duration_env("SLUICE_UNTETHERED_RESTING_TIMEOUT", &mut config.untethered_resting_timeout)?;
        duration_env(
            "SLUICE_COUNTER_FREE_TO_REUSE_TIMEOUT",
            &mut config.counter_free_to_reuse_timeout,
        )?;
        duration_env(
            "SLUICE_FLOW_CONTROL_RECEIVER_TIMEOUT",
            &mut config.flow_control_receiver_timeout,
        )?;

        size_env("SLUICE_MTU_LENGTH", &mut config.mtu_length)?;
        size_env("SLUICE_TERM_BUFFER_LENGTH", &mut config.term_buffer_length)?;
        size_env("SLUICE_IPC_TERM_BUFFER_LENGTH", &mut config.ipc_term_buffer_length)?;
        size_env("SLUICE_INITIAL_WINDOW_LENGTH", &mut config.initial_window_length)?;
        size_env("SLUICE_FILE_PAGE_SIZE", &mut config.file_page_size)?;
        size_env("SLUICE_ERROR_BUFFER_LENGTH", &mut config.error_buffer_length)?;
        size_env("SLUICE_LOSS_REPORT_BUFFER_LENGTH", &mut config.loss_report_buffer_length)?;
        size_env("SLUICE_COUNTER_VALUES_BUFFER_LENGTH", &mut config.counter_values_buffer_length)?;
        size_env("SLUICE_CONDUCTOR_BUFFER_LENGTH", &mut config.conductor_buffer_length)?;
        size_env("SLUICE_TO_CLIENTS_BUFFER_LENGTH", &mut config.to_clients_buffer_length)?;

        if let Some(v) = read_env("SLUICE_MAX_RESEND") {
            config.max_resend = v
                .parse()
                .map_err(|e| DriverError::Generic(format!("bad SLUICE_MAX_RESEND: {e}")))?;
        }
        if let Some(v) = read_env("SLUICE_ASYNC_TASK_EXECUTOR_THREADS") {
            config.async_task_executor_threads = v.parse().map_err(|e| {
                DriverError::Generic(format!("bad SLUICE_ASYNC_TASK_EXECUTOR_THREADS: {e}"))
            })?;
        }
        if let Some(v) = read_env("SLUICE_SPIES_SIMULATE_CONNECTION") {
            config.spies_simulate_connection = parse_bool(&v)
                .ok_or_else(|| DriverError::Generic(format!("bad bool: {v}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DriverError> {
        sluice_logbuffer::descriptor::check_term_length(self.term_buffer_length)
            .map_err(DriverError::LogBuffer)?;
        sluice_logbuffer::descriptor::check_term_length(self.ipc_term_buffer_length)
            .map_err(DriverError::LogBuffer)?;
        sluice_logbuffer::descriptor::check_page_size(self.file_page_size)
            .map_err(DriverError::LogBuffer)?;
        if self.mtu_length < 64 || self.mtu_length > 64 * 1024 || self.mtu_length % 32 != 0 {
            return Err(DriverError::Generic(format!("mtu {} out of range", self.mtu_length)));
        }
        if !self.initial_window_length.is_power_of_two() {
            return Err(DriverError::Generic(format!(
                "initial window {} must be a power of two",
                self.initial_window_length
            )));
        }
        Ok(())
    }

    /// Publisher flow-control window for a given term length.
    pub fn term_window_length(&self, term_length: usize) -> usize {
        if self.publication_window_length > 0 {
            self.publication_window_length.min(term_length / 2)
        } else {
            term_length / 2
        }
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn duration_env(key: &str, slot: &mut Nanos) -> Result<(), DriverError> {
    if let Some(v) = read_env(key) {
        *slot = v.parse().map_err(|e| DriverError::Generic(format!("bad {key}: {e}")))?;
    }
    Ok(())
}

fn size_env(key: &str, slot: &mut usize) -> Result<(), DriverError> {
    if let Some(v) = read_env(key) {
        *slot = parse_size(&v).ok_or_else(|| DriverError::Generic(format!("bad {key}: {v}")))?;
    }
    Ok(())
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// `64k`, `4m`, `1g` or a bare byte count.
pub fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, multiplier) = match value.as_bytes().last()? {
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits.parse::<usize>().ok().map(|n| n * multiplier)
}
