//! The driver conductor: a single-threaded event loop owning every
//! publication, image, subscription, client session and counter. One duty
//! cycle drains the command ring, runs time events and position/limit
//! updates, processes receiver requests, ages out clients and flushes
//! events to the broadcast ring. Errors are surfaced to the requesting
//! client and recorded; the loop itself never fails.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use rand::Rng;
use sluice_logbuffer::{
    CounterTable, DistinctErrorLog, LogBuffers, LossReport, MappedRegion, Position, RecvError,
    descriptor,
    ring::{RingConsumer, RingProducer},
};
use sluice_timing::Nanos;
use tracing::{info, warn};

use crate::{
    agent::Agent,
    channel::{ChannelUri, ControlMode, Media, PublicationParams, SubscriptionParams},
    cnc::CncFile,
    command::{ChannelStr, ClientEvent, DriverCommand, LabelStr},
    config::DriverConfig,
    counters::{
        PUBLISHER_LIMIT_TYPE_ID, PUBLISHER_POSITION_TYPE_ID, RECEIVER_HWM_TYPE_ID,
        RECEIVER_POSITION_TYPE_ID, SENDER_LIMIT_TYPE_ID, SENDER_POSITION_TYPE_ID,
        SUBSCRIBER_POSITION_TYPE_ID, SystemCounters,
    },
    error::{DriverError, ErrorCode},
    feedback::FeedbackDelay,
    flow_control::FlowControl,
    image::{ImageConnection, ImageLifecycle, ImageState, PublicationImage},
    protocol::SetupMessage,
    publication::{
        PubLifecycle,
        ipc::IpcPublication,
        network::{NetworkPublication, PubState, RetransmitHandler, SenderPublication},
    },
    receiver::{ConductorCmd, ConductorProxy, ReceiverCmd, ReceiverProxy},
    sender::{SenderCmd, SenderProxy},
    subscribable::{UntetheredEvent, UntetheredTimeouts},
    transport::{TransportFactory, resolve_endpoint},
};

const COMMANDS_PER_CYCLE: usize = 64;
const CONDUCTOR_SERVICE_INTERVAL: Nanos = Nanos::from_secs(1);
const IPC_SOURCE_IDENTITY: &str = "sluice:ipc";

struct ClientSession {
    client_id: i64,
    time_of_last_activity: Nanos,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubKind {
    Ipc,
    Spy,
    Network { endpoint_id: i64 },
}

struct SubscriptionLink {
    registration_id: i64,
    client_id: i64,
    stream_id: i32,
    canonical_channel: String,
    params: SubscriptionParams,
    kind: SubKind,
}

#[derive(Clone, Copy, Debug)]
enum PubTarget {
    Ipc(i64),
    Network(i64),
}

struct PubAttachment {
    registration_id: i64,
    client_id: i64,
    target: PubTarget,
}

struct EndpointRecord {
    endpoint_id: i64,
    canonical_channel: String,
    transport: Arc<dyn crate::transport::ChannelTransport>,
    /// (stream id, subscription count) interest on this endpoint.
    streams: Vec<(i32, usize)>,
}

pub struct DriverConductor {
    config: DriverConfig,
    cnc: CncFile,
    commands: RingConsumer<DriverCommand>,
    events_out: RingProducer<ClientEvent>,
    system: SystemCounters,
    error_log: DistinctErrorLog,
    _loss_region: MappedRegion,
    loss_report: LossReport,
    transport_factory: Arc<dyn TransportFactory>,
    sender_proxy: SenderProxy,
    receiver_proxy: ReceiverProxy,
    from_receiver: ConductorProxy,
    stop: Arc<AtomicBool>,

    clients: Vec<ClientSession>,
    subscriptions: Vec<SubscriptionLink>,
    attachments: Vec<PubAttachment>,
    ipc_publications: Vec<IpcPublication>,
    network_publications: Vec<NetworkPublication>,
    sender_release_requested: Vec<i64>,
    images: Vec<PublicationImage>,
    endpoints: Vec<EndpointRecord>,

    next_id: i64,
    next_session_id: i32,
    last_tick: Nanos,
    events: Vec<ClientEvent>,
    untethered_scratch: Vec<UntetheredEvent>,
}

impl DriverConductor {
    pub fn new(
        config: DriverConfig,
        cnc: CncFile,
        system: SystemCounters,
        transport_factory: Arc<dyn TransportFactory>,
        sender_proxy: SenderProxy,
        receiver_proxy: ReceiverProxy,
        from_receiver: ConductorProxy,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, DriverError> {
        let commands = RingConsumer::from(cnc.to_driver);
        let events_out = RingProducer::from(cnc.to_clients);
        let error_log = DistinctErrorLog::new(cnc.error_log_buffer());
        let loss_region = MappedRegion::create(
            &config.dir.join("loss-report.dat"),
            config.loss_report_buffer_length,
        )?;
        let loss_report =
            LossReport::new(loss_region.buffer(0, config.loss_report_buffer_length));
        let next_session_id = rand::rng().random();

        Ok(Self {
            config,
            cnc,
            commands,
            events_out,
            system,
            error_log,
            _loss_region: loss_region,
            loss_report,
            transport_factory,
            sender_proxy,
            receiver_proxy,
            from_receiver,
            stop,
            clients: Vec::new(),
            subscriptions: Vec::new(),
            attachments: Vec::new(),
            ipc_publications: Vec::new(),
            network_publications: Vec::new(),
            sender_release_requested: Vec::new(),
            images: Vec::new(),
            endpoints: Vec::new(),
            next_id: 1,
            next_session_id,
            last_tick: Nanos::ZERO,
            events: Vec::new(),
            untethered_scratch: Vec::new(),
        })
    }

    #[inline]
    pub fn counters(&self) -> &CounterTable {
        &self.cnc.counters
    }

    #[inline]
    pub fn loss_report(&self) -> &LossReport {
        &self.loss_report
    }

    #[inline]
    pub fn error_log(&self) -> &DistinctErrorLog {
        &self.error_log
    }

    fn next_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn next_session_id(&mut self) -> i32 {
        loop {
            let candidate = self.next_session_id;
            self.next_session_id = self.next_session_id.wrapping_add(1);
            let in_use = self.ipc_publications.iter().any(|p| p.session_id == candidate)
                || self
                    .network_publications
                    .iter()
                    .any(|p| p.session_id() == candidate);
            if !in_use {
                return candidate;
            }
        }
    }

    fn touch_client(&mut self, client_id: i64, now: Nanos) {
        match self.clients.iter_mut().find(|c| c.client_id == client_id) {
            Some(client) => client.time_of_last_activity = now,
            None => {
                self.clients.push(ClientSession { client_id, time_of_last_activity: now });
            }
        }
    }

    fn untethered_timeouts(config: &DriverConfig, params: &SubscriptionParams) -> UntetheredTimeouts {
        UntetheredTimeouts {
            window_limit: params
                .untethered_window_limit_timeout
                .unwrap_or(config.untethered_window_limit_timeout),
            linger: params
                .untethered_linger_timeout
                .unwrap_or(config.untethered_linger_timeout),
            resting: params
                .untethered_resting_timeout
                .unwrap_or(config.untethered_resting_timeout),
        }
    }

    fn on_error(&mut self, correlation_id: i64, error: &DriverError, now: Nanos) {
        let code = error.code();
        let message = error.to_string();
        warn!(correlation_id, %error, "command failed");
        self.error_log.record(code as i32, &message, now);
        self.system.errors.increment();
        self.events.push(ClientEvent::Error {
            correlation_id,
            code,
            message: LabelStr::from_str_truncate(&message),
        });
    }

    fn flush_events(&mut self) {
        for event in self.events.drain(..) {
            let _ = self.events_out.produce(&event);
        }
    }

    fn check_service_interval(&mut self, now: Nanos) {
        if self.last_tick != Nanos::ZERO {
            let elapsed = now.saturating_sub(self.last_tick);
            if elapsed > CONDUCTOR_SERVICE_INTERVAL {
                warn!(%elapsed, "conductor overran its service interval");
                self.system.conductor_cycle_overruns.increment();
                self.error_log.record(
                    ErrorCode::ConductorServiceTimeout as i32,
                    "conductor overran its service interval",
                    now,
                );
            }
        }
        self.last_tick = now;
    }

    // --- command handling ---

    fn drain_commands(&mut self, now: Nanos) -> usize {
        let mut work = 0;
        let mut cmd = DriverCommand::default();
        while work < COMMANDS_PER_CYCLE {
            match self.commands.try_consume(&mut cmd) {
                Ok(()) => {
                    self.dispatch(cmd, now);
                    work += 1;
                }
                Err(RecvError::Lapped) => {
                    self.commands.recover_after_lap();
                    self.error_log.record(
                        ErrorCode::GenericError as i32,
                        "conductor lapped on the command ring, commands lost",
                        now,
                    );
                    self.system.errors.increment();
                }
                Err(RecvError::Empty) => break,
            }
        }
        work
    }

    fn dispatch(&mut self, cmd: DriverCommand, now: Nanos) {
        match cmd {
            DriverCommand::Noop => {}
            DriverCommand::AddPublication {
                client_id,
                correlation_id,
                stream_id,
                channel,
                is_exclusive,
            } => {
                self.touch_client(client_id, now);
                if let Err(e) =
                    self.on_add_publication(client_id, correlation_id, stream_id, &channel, is_exclusive, now)
                {
                    self.on_error(correlation_id, &e, now);
                }
            }
            DriverCommand::RemovePublication { client_id, correlation_id, registration_id } => {
                self.touch_client(client_id, now);
                if let Err(e) = self.on_remove_publication(client_id, registration_id, now) {
                    self.on_error(correlation_id, &e, now);
                } else {
                    self.events.push(ClientEvent::OperationSuccess { correlation_id });
                }
            }
            DriverCommand::AddSubscription { client_id, correlation_id, stream_id, channel } => {
                self.touch_client(client_id, now);
                if let Err(e) =
                    self.on_add_subscription(client_id, correlation_id, stream_id, &channel, now)
                {
                    self.on_error(correlation_id, &e, now);
                }
            }
            DriverCommand::RemoveSubscription { client_id, correlation_id, registration_id } => {
                self.touch_client(client_id, now);
                if let Err(e) = self.on_remove_subscription(client_id, registration_id, now) {
                    self.on_error(correlation_id, &e, now);
                } else {
                    self.events.push(ClientEvent::OperationSuccess { correlation_id });
                }
            }
            DriverCommand::AddCounter { client_id, correlation_id, type_id, key, label } => {
                self.touch_client(client_id, now);
                match self.cnc.counters.allocate(
                    type_id,
                    key.as_slice(),
                    label.as_str(),
                    correlation_id,
                    client_id,
                    now,
                ) {
                    Ok(counter_id) => {
                        self.events.push(ClientEvent::CounterReady { correlation_id, counter_id });
                    }
                    Err(e) => self.on_error(correlation_id, &DriverError::Counters(e), now),
                }
            }
            DriverCommand::AddStaticCounter {
                client_id,
                correlation_id,
                type_id,
                registration_id,
                key,
                label,
            } => {
                self.touch_client(client_id, now);
                match self.cnc.counters.allocate_static(
                    type_id,
                    key.as_slice(),
                    label.as_str(),
                    registration_id,
                    now,
                ) {
                    Ok(counter_id) => {
                        self.events.push(ClientEvent::CounterReady { correlation_id, counter_id });
                    }
                    Err(e) => self.on_error(correlation_id, &DriverError::Counters(e), now),
                }
            }
            DriverCommand::RemoveCounter { client_id, correlation_id, registration_id } => {
                self.touch_client(client_id, now);
                if let Err(e) = self.on_remove_counter(client_id, registration_id, now) {
                    self.on_error(correlation_id, &e, now);
                } else {
                    self.events.push(ClientEvent::OperationSuccess { correlation_id });
                }
            }
            DriverCommand::ClientKeepalive { client_id } => {
                self.touch_client(client_id, now);
            }
            DriverCommand::ClientClose { client_id } => {
                self.cleanup_client(client_id, now);
            }
            DriverCommand::RejectImage {
                client_id,
                correlation_id,
                image_correlation_id,
                position,
                reason,
            } => {
                self.touch_client(client_id, now);
                if let Err(e) = self.on_reject_image(image_correlation_id, position, &reason, now) {
                    self.on_error(correlation_id, &e, now);
                } else {
                    self.events.push(ClientEvent::OperationSuccess { correlation_id });
                }
            }
            DriverCommand::AddDestination { client_id, correlation_id, registration_id, destination } => {
                self.touch_client(client_id, now);
                if let Err(e) = self.on_destination(registration_id, &destination, true) {
                    self.on_error(correlation_id, &e, now);
                } else {
                    self.events.push(ClientEvent::OperationSuccess { correlation_id });
                }
            }
            DriverCommand::RemoveDestination {
                client_id,
                correlation_id,
                registration_id,
                destination,
            } => {
                self.touch_client(client_id, now);
                if let Err(e) = self.on_destination(registration_id, &destination, false) {
                    self.on_error(correlation_id, &e, now);
                } else {
                    self.events.push(ClientEvent::OperationSuccess { correlation_id });
                }
            }
            DriverCommand::TerminateDriver { client_id, correlation_id } => {
                self.touch_client(client_id, now);
                info!(client_id, "driver termination requested");
                self.events.push(ClientEvent::OperationSuccess { correlation_id });
                self.stop.store(true, Ordering::Release);
            }
        }
    }

    fn on_add_publication(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        channel: &ChannelStr,
        is_exclusive: bool,
        now: Nanos,
    ) -> Result<(), DriverError> {
        let uri = ChannelUri::parse(channel.as_str())?;
        if uri.is_spy {
            return Err(DriverError::InvalidChannel(format!(
                "{channel}: cannot publish on a spy channel"
            )));
        }
        let params = PublicationParams::resolve(&uri, &self.config, is_exclusive)?;

        match uri.media {
            Media::Ipc => {
                if !is_exclusive {
                    if let Some(existing) = self.ipc_publications.iter_mut().find(|p| {
                        !p.is_exclusive
                            && p.stream_id == stream_id
                            && p.channel == uri.canonical()
                            && p.state() == PubLifecycle::Active
                            && p.accepting_subscribers(now)
                    }) {
                        existing.inc_ref();
                        let registration_id = existing.registration_id;
                        let session_id = existing.session_id;
                        let counter_id = existing.publisher_limit_counter_id();
                        let log_file = existing.log.path().map(|p| p.display().to_string());
                        self.attachments.push(PubAttachment {
                            registration_id: correlation_id,
                            client_id,
                            target: PubTarget::Ipc(registration_id),
                        });
                        self.events.push(ClientEvent::PublicationReady {
                            correlation_id,
                            registration_id,
                            session_id,
                            stream_id,
                            position_limit_counter_id: counter_id,
                            log_file: ChannelStr::from_str_truncate(
                                log_file.as_deref().unwrap_or(""),
                            ),
                            is_exclusive: false,
                        });
                        return Ok(());
                    }
                }
                self.create_ipc_publication(client_id, correlation_id, stream_id, &uri, &params, is_exclusive, now)
            }
            Media::Udp => self.create_network_publication(
                client_id,
                correlation_id,
                stream_id,
                &uri,
                &params,
                is_exclusive,
                now,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_ipc_publication(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        uri: &ChannelUri,
        params: &PublicationParams,
        is_exclusive: bool,
        now: Nanos,
    ) -> Result<(), DriverError> {
        let registration_id = correlation_id;
        let session_id = params.session_id.unwrap_or_else(|| self.next_session_id());
        let (initial_term_id, starting_term_id, starting_term_offset) =
            params.starting_term.unwrap_or_else(|| {
                let initial = rand::rng().random();
                (initial, initial, 0)
            });

        let path = self.config.dir.join("logs").join(format!("pub-{registration_id}.logbuffer"));
        let log = Arc::new(LogBuffers::create(&path, params.term_length)?);
        log.initialize(
            initial_term_id,
            starting_term_id,
            starting_term_offset,
            params.mtu_length,
            self.config.file_page_size,
            session_id,
            stream_id,
            registration_id,
        );

        let pub_pos = self.allocate_counter(
            PUBLISHER_POSITION_TYPE_ID,
            "pub-pos",
            &uri.canonical(),
            registration_id,
            client_id,
            now,
        )?;
        let pub_lmt = self.allocate_counter(
            PUBLISHER_LIMIT_TYPE_ID,
            "pub-lmt",
            &uri.canonical(),
            registration_id,
            client_id,
            now,
        )?;

        let mut publication = IpcPublication::new(
            registration_id,
            uri.canonical(),
            is_exclusive,
            log,
            pub_pos,
            pub_lmt,
            params.publication_window,
            self.config.publication_unblock_timeout,
            params.linger.unwrap_or(self.config.publication_linger_timeout),
            self.config.image_liveness_timeout,
            now,
        );

        let log_file = publication.log.path().map(|p| p.display().to_string()).unwrap_or_default();
        self.events.push(ClientEvent::PublicationReady {
            correlation_id,
            registration_id,
            session_id,
            stream_id,
            position_limit_counter_id: publication.publisher_limit_counter_id(),
            log_file: ChannelStr::from_str_truncate(&log_file),
            is_exclusive,
        });

        self.link_subscribers_to_ipc(&mut publication, now)?;
        self.attachments.push(PubAttachment {
            registration_id: correlation_id,
            client_id,
            target: PubTarget::Ipc(registration_id),
        });
        self.ipc_publications.push(publication);
        Ok(())
    }

    fn link_subscribers_to_ipc(
        &mut self,
        publication: &mut IpcPublication,
        now: Nanos,
    ) -> Result<(), DriverError> {
        let join_position = publication.join_position();
        let log_file = publication.log.path().map(|p| p.display().to_string()).unwrap_or_default();
        let (stream_id, session_id) = (publication.stream_id, publication.session_id);
        let channel = publication.channel.clone();
        let registration_id = publication.registration_id;
        for link in self.subscriptions.iter().filter(|l| {
            l.kind == SubKind::Ipc
                && l.stream_id == stream_id
                && l.canonical_channel == channel
                && l.params.session_id.is_none_or(|s| s == session_id)
        }) {
            let position = self.cnc.counters.allocate(
                SUBSCRIBER_POSITION_TYPE_ID,
                &link.registration_id.to_le_bytes(),
                &format!("sub-pos {channel} @{stream_id}"),
                link.registration_id,
                link.client_id,
                now,
            )?;
            let position = self.cnc.counters.position(position);
            position.set_ordered(join_position);
            publication.subscribable.add_subscriber(
                link.registration_id,
                position,
                link.params.is_tether,
                link.params.is_rejoin,
                Self::untethered_timeouts(&self.config, &link.params),
                now,
            );
            self.events.push(ClientEvent::AvailableImage {
                correlation_id: registration_id,
                session_id,
                stream_id,
                subscription_registration_id: link.registration_id,
                subscriber_position_id: position.id(),
                log_file: ChannelStr::from_str_truncate(&log_file),
                source_identity: LabelStr::from_str_truncate(IPC_SOURCE_IDENTITY),
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn create_network_publication(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        uri: &ChannelUri,
        params: &PublicationParams,
        is_exclusive: bool,
        now: Nanos,
    ) -> Result<(), DriverError> {
        if params.endpoint.is_none() && params.control_mode != ControlMode::Manual {
            return Err(DriverError::InvalidChannel(format!(
                "{}: publication requires an endpoint or control-mode=manual",
                uri.as_str()
            )));
        }
        if !is_exclusive {
            if let Some(existing) = self.network_publications.iter_mut().find(|p| {
                !p.is_exclusive
                    && p.stream_id() == stream_id
                    && p.channel == uri.canonical()
                    && p.state() == PubLifecycle::Active
            }) {
                existing.inc_ref();
                let registration_id = existing.registration_id;
                let session_id = existing.session_id();
                let counter_id = existing.shared.pub_lmt.id();
                let log_file =
                    existing.log().path().map(|p| p.display().to_string()).unwrap_or_default();
                self.attachments.push(PubAttachment {
                    registration_id: correlation_id,
                    client_id,
                    target: PubTarget::Network(registration_id),
                });
                self.events.push(ClientEvent::PublicationReady {
                    correlation_id,
                    registration_id,
                    session_id,
                    stream_id,
                    position_limit_counter_id: counter_id,
                    log_file: ChannelStr::from_str_truncate(&log_file),
                    is_exclusive: false,
                });
                return Ok(());
            }
        }

        let registration_id = correlation_id;
        let session_id = params.session_id.unwrap_or_else(|| self.next_session_id());
        let (initial_term_id, starting_term_id, starting_term_offset) =
            params.starting_term.unwrap_or_else(|| {
                let initial = rand::rng().random();
                (initial, initial, 0)
            });

        let path = self.config.dir.join("logs").join(format!("pub-{registration_id}.logbuffer"));
        let log = Arc::new(LogBuffers::create(&path, params.term_length)?);
        log.initialize(
            initial_term_id,
            starting_term_id,
            starting_term_offset,
            params.mtu_length,
            self.config.file_page_size,
            session_id,
            stream_id,
            registration_id,
        );

        let pub_pos = self.allocate_counter(
            PUBLISHER_POSITION_TYPE_ID,
            "pub-pos",
            &uri.canonical(),
            registration_id,
            client_id,
            now,
        )?;
        let pub_lmt = self.allocate_counter(
            PUBLISHER_LIMIT_TYPE_ID,
            "pub-lmt",
            &uri.canonical(),
            registration_id,
            client_id,
            now,
        )?;
        let snd_pos = self.allocate_counter(
            SENDER_POSITION_TYPE_ID,
            "snd-pos",
            &uri.canonical(),
            registration_id,
            client_id,
            now,
        )?;
        let snd_lmt = self.allocate_counter(
            SENDER_LIMIT_TYPE_ID,
            "snd-lmt",
            &uri.canonical(),
            registration_id,
            client_id,
            now,
        )?;

        let shared = PubState::new(log, pub_pos, pub_lmt, snd_pos, snd_lmt);
        let transport = self.transport_factory.create(uri, None)?;
        let destination = match &params.endpoint {
            Some(endpoint) => Some(resolve_endpoint(endpoint)?),
            None => None,
        };
        let flow_control = FlowControl::from_options(
            &params.flow_control,
            self.config.flow_control_receiver_timeout,
        );
        let retransmit = RetransmitHandler::new(
            FeedbackDelay::immediate(),
            self.config.retransmit_action_linger_timeout,
            params.max_resend,
        );
        let sender_publication = SenderPublication::new(
            registration_id,
            shared.clone(),
            transport,
            destination,
            flow_control,
            retransmit,
            self.config.initial_window_length,
            self.system,
        );

        let mut publication = NetworkPublication::new(
            registration_id,
            uri.canonical(),
            is_exclusive,
            shared,
            params.publication_window,
            params
                .spies_simulate_connection
                .unwrap_or(self.config.spies_simulate_connection),
            self.config.publication_unblock_timeout,
            params.linger.unwrap_or(self.config.publication_linger_timeout),
            now,
        );

        let log_file =
            publication.log().path().map(|p| p.display().to_string()).unwrap_or_default();
        self.events.push(ClientEvent::PublicationReady {
            correlation_id,
            registration_id,
            session_id,
            stream_id,
            position_limit_counter_id: publication.shared.pub_lmt.id(),
            log_file: ChannelStr::from_str_truncate(&log_file),
            is_exclusive,
        });

        self.link_spies_to_network(&mut publication, now)?;
        self.sender_proxy.send(SenderCmd::NewPublication(Box::new(sender_publication)));
        self.attachments.push(PubAttachment {
            registration_id: correlation_id,
            client_id,
            target: PubTarget::Network(registration_id),
        });
        self.network_publications.push(publication);
        Ok(())
    }

    fn link_spies_to_network(
        &mut self,
        publication: &mut NetworkPublication,
        now: Nanos,
    ) -> Result<(), DriverError> {
        let join_position = publication.join_position();
        let log_file =
            publication.log().path().map(|p| p.display().to_string()).unwrap_or_default();
        let (stream_id, session_id) = (publication.stream_id(), publication.session_id());
        let channel = publication.channel.clone();
        let registration_id = publication.registration_id;
        for link in self.subscriptions.iter().filter(|l| {
            l.kind == SubKind::Spy
                && l.stream_id == stream_id
                && l.canonical_channel == channel
                && l.params.session_id.is_none_or(|s| s == session_id)
        }) {
            let position = self.cnc.counters.allocate(
                SUBSCRIBER_POSITION_TYPE_ID,
                &link.registration_id.to_le_bytes(),
                &format!("spy-pos {channel} @{stream_id}"),
                link.registration_id,
                link.client_id,
                now,
            )?;
            let position = self.cnc.counters.position(position);
            position.set_ordered(join_position);
            publication.spy_subscribable.add_subscriber(
                link.registration_id,
                position,
                link.params.is_tether,
                link.params.is_rejoin,
                Self::untethered_timeouts(&self.config, &link.params),
                now,
            );
            self.events.push(ClientEvent::AvailableImage {
                correlation_id: registration_id,
                session_id,
                stream_id,
                subscription_registration_id: link.registration_id,
                subscriber_position_id: position.id(),
                log_file: ChannelStr::from_str_truncate(&log_file),
                source_identity: LabelStr::from_str_truncate(&channel),
            });
        }
        Ok(())
    }

    fn on_remove_publication(
        &mut self,
        client_id: i64,
        registration_id: i64,
        now: Nanos,
    ) -> Result<(), DriverError> {
        let index = self
            .attachments
            .iter()
            .position(|a| a.registration_id == registration_id && a.client_id == client_id)
            .ok_or(DriverError::UnknownPublication(registration_id))?;
        let attachment = self.attachments.remove(index);
        self.dec_ref(attachment.target, now);
        Ok(())
    }

    fn dec_ref(&mut self, target: PubTarget, now: Nanos) {
        match target {
            PubTarget::Ipc(id) => {
                if let Some(p) = self.ipc_publications.iter_mut().find(|p| p.registration_id == id)
                {
                    p.dec_ref();
                }
            }
            PubTarget::Network(id) => {
                if let Some(p) =
                    self.network_publications.iter_mut().find(|p| p.registration_id == id)
                {
                    p.dec_ref(now);
                }
            }
        }
    }

    fn on_add_subscription(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        channel: &ChannelStr,
        now: Nanos,
    ) -> Result<(), DriverError> {
        let uri = ChannelUri::parse(channel.as_str())?;
        let params = SubscriptionParams::resolve(&uri, &self.config)?;
        let registration_id = correlation_id;

        let kind = match (uri.is_spy, uri.media) {
            (true, _) => SubKind::Spy,
            (false, Media::Ipc) => SubKind::Ipc,
            (false, Media::Udp) => {
                let endpoint = params.endpoint.clone().ok_or_else(|| {
                    DriverError::InvalidChannel(format!(
                        "{}: subscription requires an endpoint",
                        uri.as_str()
                    ))
                })?;
                let endpoint_id = self.ensure_endpoint(&uri, &endpoint, stream_id)?;
                SubKind::Network { endpoint_id }
            }
        };

        self.events.push(ClientEvent::SubscriptionReady { correlation_id });
        let link = SubscriptionLink {
            registration_id,
            client_id,
            stream_id,
            canonical_channel: uri.canonical(),
            params,
            kind,
        };
        self.link_new_subscription(&link, now)?;
        self.subscriptions.push(link);
        Ok(())
    }

    fn ensure_endpoint(
        &mut self,
        uri: &ChannelUri,
        endpoint: &str,
        stream_id: i32,
    ) -> Result<i64, DriverError> {
        if let Some(record) = self
            .endpoints
            .iter_mut()
            .find(|e| e.canonical_channel == uri.canonical())
        {
            match record.streams.iter_mut().find(|(s, _)| *s == stream_id) {
                Some((_, count)) => *count += 1,
                None => {
                    record.streams.push((stream_id, 1));
                    self.receiver_proxy.send(ReceiverCmd::AddSubscription {
                        endpoint_id: record.endpoint_id,
                        stream_id,
                    });
                }
            }
            return Ok(record.endpoint_id);
        }

        let transport = self.transport_factory.create(uri, Some(endpoint))?;
        let endpoint_id = self.next_id();
        self.receiver_proxy
            .send(ReceiverCmd::AddEndpoint { endpoint_id, transport: transport.clone() });
        self.receiver_proxy.send(ReceiverCmd::AddSubscription { endpoint_id, stream_id });
        self.endpoints.push(EndpointRecord {
            endpoint_id,
            canonical_channel: uri.canonical(),
            transport,
            streams: vec![(stream_id, 1)],
        });
        Ok(endpoint_id)
    }

    /// Attach a brand-new subscription to everything it matches.
    fn link_new_subscription(
        &mut self,
        link: &SubscriptionLink,
        now: Nanos,
    ) -> Result<(), DriverError> {
        match link.kind {
            SubKind::Ipc => {
                let mut publications = std::mem::take(&mut self.ipc_publications);
                let mut result = Ok(());
                for publication in publications.iter_mut().filter(|p| {
                    p.stream_id == link.stream_id
                        && p.channel == link.canonical_channel
                        && p.state() == PubLifecycle::Active
                        && p.accepting_subscribers(now)
                        && link.params.session_id.is_none_or(|s| s == p.session_id)
                }) {
                    result = self.attach_link_to_ipc(link, publication, now);
                    if result.is_err() {
                        break;
                    }
                }
                self.ipc_publications = publications;
                result
            }
            SubKind::Spy => {
                let mut publications = std::mem::take(&mut self.network_publications);
                let mut result = Ok(());
                for publication in publications.iter_mut().filter(|p| {
                    p.stream_id() == link.stream_id
                        && p.channel == link.canonical_channel
                        && p.state() == PubLifecycle::Active
                        && link.params.session_id.is_none_or(|s| s == p.session_id())
                }) {
                    result = self.attach_link_to_spy(link, publication, now);
                    if result.is_err() {
                        break;
                    }
                }
                self.network_publications = publications;
                result
            }
            SubKind::Network { endpoint_id: _ } => {
                let mut images = std::mem::take(&mut self.images);
                let mut result = Ok(());
                for image in images.iter_mut().filter(|i| {
                    i.stream_id() == link.stream_id
                        && i.channel == link.canonical_channel
                        && i.accepting_subscribers()
                        && link.params.session_id.is_none_or(|s| s == i.session_id())
                }) {
                    result = self.attach_link_to_image(link, image, now);
                    if result.is_err() {
                        break;
                    }
                }
                self.images = images;
                result
            }
        }
    }

    fn attach_link_to_ipc(
        &mut self,
        link: &SubscriptionLink,
        publication: &mut IpcPublication,
        now: Nanos,
    ) -> Result<(), DriverError> {
        let position = self.subscriber_position(link, publication.join_position(), now)?;
        publication.subscribable.add_subscriber(
            link.registration_id,
            position,
            link.params.is_tether,
            link.params.is_rejoin,
            Self::untethered_timeouts(&self.config, &link.params),
            now,
        );
        let log_file = publication.log.path().map(|p| p.display().to_string()).unwrap_or_default();
        self.events.push(ClientEvent::AvailableImage {
            correlation_id: publication.registration_id,
            session_id: publication.session_id,
            stream_id: publication.stream_id,
            subscription_registration_id: link.registration_id,
            subscriber_position_id: position.id(),
            log_file: ChannelStr::from_str_truncate(&log_file),
            source_identity: LabelStr::from_str_truncate(IPC_SOURCE_IDENTITY),
        });
        Ok(())
    }

    fn attach_link_to_spy(
        &mut self,
        link: &SubscriptionLink,
        publication: &mut NetworkPublication,
        now: Nanos,
    ) -> Result<(), DriverError> {
        let position = self.subscriber_position(link, publication.join_position(), now)?;
        publication.spy_subscribable.add_subscriber(
            link.registration_id,
            position,
            link.params.is_tether,
            link.params.is_rejoin,
            Self::untethered_timeouts(&self.config, &link.params),
            now,
        );
        let log_file =
            publication.log().path().map(|p| p.display().to_string()).unwrap_or_default();
        self.events.push(ClientEvent::AvailableImage {
            correlation_id: publication.registration_id,
            session_id: publication.session_id(),
            stream_id: publication.stream_id(),
            subscription_registration_id: link.registration_id,
            subscriber_position_id: position.id(),
            log_file: ChannelStr::from_str_truncate(&log_file),
            source_identity: LabelStr::from_str_truncate(&publication.channel),
        });
        Ok(())
    }

    fn attach_link_to_image(
        &mut self,
        link: &SubscriptionLink,
        image: &mut PublicationImage,
        now: Nanos,
    ) -> Result<(), DriverError> {
        let position = self.subscriber_position(link, image.join_position(), now)?;
        image.subscribable.add_subscriber(
            link.registration_id,
            position,
            link.params.is_tether,
            link.params.is_rejoin,
            Self::untethered_timeouts(&self.config, &link.params),
            now,
        );
        let log_file =
            image.shared.log.path().map(|p| p.display().to_string()).unwrap_or_default();
        self.events.push(ClientEvent::AvailableImage {
            correlation_id: image.correlation_id,
            session_id: image.session_id(),
            stream_id: image.stream_id(),
            subscription_registration_id: link.registration_id,
            subscriber_position_id: position.id(),
            log_file: ChannelStr::from_str_truncate(&log_file),
            source_identity: LabelStr::from_str_truncate(&image.source_identity),
        });
        Ok(())
    }

    fn subscriber_position(
        &mut self,
        link: &SubscriptionLink,
        join_position: i64,
        now: Nanos,
    ) -> Result<Position, DriverError> {
        let id = self.cnc.counters.allocate(
            SUBSCRIBER_POSITION_TYPE_ID,
            &link.registration_id.to_le_bytes(),
            &format!("sub-pos {} @{}", link.canonical_channel, link.stream_id),
            link.registration_id,
            link.client_id,
            now,
        )?;
        let position = self.cnc.counters.position(id);
        position.set_ordered(join_position);
        Ok(position)
    }

    fn on_remove_subscription(
        &mut self,
        client_id: i64,
        registration_id: i64,
        now: Nanos,
    ) -> Result<(), DriverError> {
        let index = self
            .subscriptions
            .iter()
            .position(|l| l.registration_id == registration_id && l.client_id == client_id)
            .ok_or(DriverError::UnknownSubscription(registration_id))?;
        let link = self.subscriptions.remove(index);
        self.unlink_subscription(&link, now);
        Ok(())
    }

    fn unlink_subscription(&mut self, link: &SubscriptionLink, now: Nanos) {
        let mut freed: Vec<Position> = Vec::new();
        for publication in &mut self.ipc_publications {
            freed.extend(publication.subscribable.remove_subscriber(link.registration_id));
        }
        for publication in &mut self.network_publications {
            freed.extend(publication.spy_subscribable.remove_subscriber(link.registration_id));
        }
        for image in &mut self.images {
            freed.extend(image.subscribable.remove_subscriber(link.registration_id));
        }
        for position in freed {
            let _ = self.cnc.counters.free(position.id(), now);
        }

        if let SubKind::Network { endpoint_id } = link.kind {
            let mut remove_endpoint = false;
            if let Some(record) =
                self.endpoints.iter_mut().find(|e| e.endpoint_id == endpoint_id)
            {
                if let Some(slot) =
                    record.streams.iter_mut().find(|(s, _)| *s == link.stream_id)
                {
                    slot.1 -= 1;
                    if slot.1 == 0 {
                        record.streams.retain(|(s, _)| *s != link.stream_id);
                        self.receiver_proxy.send(ReceiverCmd::RemoveSubscription {
                            endpoint_id,
                            stream_id: link.stream_id,
                        });
                    }
                }
                remove_endpoint = record.streams.is_empty();
            }
            if remove_endpoint {
                self.endpoints.retain(|e| e.endpoint_id != endpoint_id);
                self.receiver_proxy.send(ReceiverCmd::RemoveEndpoint { endpoint_id });
            }
        }
    }

    fn on_remove_counter(
        &mut self,
        client_id: i64,
        registration_id: i64,
        now: Nanos,
    ) -> Result<(), DriverError> {
        let counters = &self.cnc.counters;
        for id in 0..counters.capacity() as i32 {
            if counters.state(id) == sluice_logbuffer::CounterState::Allocated
                && counters.registration_id(id) == registration_id
                && counters.owner_id(id) == client_id
            {
                counters.free(id, now).map_err(DriverError::Counters)?;
                self.events
                    .push(ClientEvent::UnavailableCounter { registration_id, counter_id: id });
                return Ok(());
            }
        }
        Err(DriverError::UnknownCounter(registration_id))
    }

    fn on_reject_image(
        &mut self,
        image_correlation_id: i64,
        position: i64,
        reason: &str,
        now: Nanos,
    ) -> Result<(), DriverError> {
        let mut images = std::mem::take(&mut self.images);
        let result = if let Some(image) = images
            .iter_mut()
            .find(|i| i.correlation_id == image_correlation_id)
        {
            let freed = image.reject(reason, now, &mut self.events);
            self.receiver_proxy
                .send(ReceiverCmd::RemoveImage { correlation_id: image_correlation_id });
            for p in freed {
                let _ = self.cnc.counters.free(p.id(), now);
            }
            Ok(())
        } else if let Some(publication) = self
            .ipc_publications
            .iter_mut()
            .position(|p| p.registration_id == image_correlation_id)
        {
            let mut publication = self.ipc_publications.remove(publication);
            let freed =
                publication.reject(position, reason, now, &mut self.events, &self.system);
            for p in freed {
                let _ = self.cnc.counters.free(p.id(), now);
            }
            self.ipc_publications.push(publication);
            Ok(())
        } else {
            Err(DriverError::Generic(format!("unknown image {image_correlation_id}")))
        };
        self.images = images;
        result
    }

    fn on_destination(
        &mut self,
        registration_id: i64,
        destination: &ChannelStr,
        add: bool,
    ) -> Result<(), DriverError> {
        let attachment = self
            .attachments
            .iter()
            .find(|a| a.registration_id == registration_id)
            .ok_or(DriverError::UnknownPublication(registration_id))?;
        let PubTarget::Network(target) = attachment.target else {
            return Err(DriverError::Generic(
                "destinations only apply to network publications".to_string(),
            ));
        };
        let uri = ChannelUri::parse(destination.as_str())?;
        let endpoint = uri.get("endpoint").ok_or_else(|| {
            DriverError::InvalidChannel(format!("{destination}: destination requires an endpoint"))
        })?;
        let addr = resolve_endpoint(endpoint)?;
        self.sender_proxy.send(if add {
            SenderCmd::AddDestination { registration_id: target, destination: addr }
        } else {
            SenderCmd::RemoveDestination { registration_id: target, destination: addr }
        });
        Ok(())
    }

    // --- receiver requests ---

    fn drain_receiver_requests(&mut self, now: Nanos) -> usize {
        let requests = self.from_receiver.drain();
        let work = requests.len();
        for request in requests {
            match request {
                ConductorCmd::CreateImage { endpoint_id, setup, src } => {
                    if let Err(e) = self.create_image(endpoint_id, &setup, src, now) {
                        warn!(%e, session_id = setup.session_id, "image setup refused");
                        self.error_log.record(e.code() as i32, &e.to_string(), now);
                        self.system.errors.increment();
                    }
                }
            }
        }
        work
    }

    fn create_image(
        &mut self,
        endpoint_id: i64,
        setup: &SetupMessage,
        src: std::net::SocketAddr,
        now: Nanos,
    ) -> Result<(), DriverError> {
        // one image per (session, stream) per endpoint; cooldown after a
        // rejection blocks re-creation until the image ages out
        if self.images.iter().any(|i| {
            i.session_id() == setup.session_id && i.stream_id() == setup.stream_id
        }) {
            return Ok(());
        }
        let record = self
            .endpoints
            .iter()
            .find(|e| e.endpoint_id == endpoint_id)
            .ok_or_else(|| DriverError::Generic(format!("unknown endpoint {endpoint_id}")))?;
        let channel = record.canonical_channel.clone();
        let transport = record.transport.clone();

        descriptor::check_term_length(setup.term_length as usize)?;
        let links: Vec<usize> = self
            .subscriptions
            .iter()
            .enumerate()
            .filter(|(_, l)| {
                matches!(l.kind, SubKind::Network { endpoint_id: e } if e == endpoint_id)
                    && l.stream_id == setup.stream_id
                    && l.params.session_id.is_none_or(|s| s == setup.session_id)
            })
            .map(|(i, _)| i)
            .collect();
        if links.is_empty() {
            return Ok(());
        }

        let correlation_id = self.next_id();
        let path = self.config.dir.join("logs").join(format!("img-{correlation_id}.logbuffer"));
        let log = Arc::new(LogBuffers::create(&path, setup.term_length as usize)?);
        log.initialize(
            setup.initial_term_id,
            setup.active_term_id,
            setup.term_offset & !(sluice_logbuffer::frame::FRAME_ALIGNMENT as i32 - 1),
            setup.mtu_length as usize,
            self.config.file_page_size,
            setup.session_id,
            setup.stream_id,
            correlation_id,
        );
        let join_position = log.producer_position();

        let hwm = self.allocate_counter(
            RECEIVER_HWM_TYPE_ID,
            "rcv-hwm",
            &channel,
            correlation_id,
            sluice_logbuffer::NULL_OWNER_ID,
            now,
        )?;
        let rcv_pos = self.allocate_counter(
            RECEIVER_POSITION_TYPE_ID,
            "rcv-pos",
            &channel,
            correlation_id,
            sluice_logbuffer::NULL_OWNER_ID,
            now,
        )?;
        let state = ImageState::new(log, hwm, rcv_pos, join_position);

        let first = &self.subscriptions[links[0]];
        let window_length = first
            .params
            .receiver_window
            .unwrap_or(self.config.initial_window_length)
            .min(setup.term_length as usize / 2);
        let nak_delay = match first.params.nak_delay {
            Some(delay) => FeedbackDelay::Static { delay },
            None if first.params.group == Some(true) => FeedbackDelay::Exponential {
                min: self.config.nak_unicast_delay,
                max: self.config.nak_multicast_max_backoff,
            },
            None => FeedbackDelay::Static { delay: self.config.nak_unicast_delay },
        };

        let mut image = PublicationImage::new(
            correlation_id,
            channel,
            src.to_string(),
            state.clone(),
            transport,
            src,
            rand::rng().random(),
            window_length,
            self.config.status_message_timeout,
            nak_delay,
            self.config.image_liveness_timeout,
            first.params.is_reliable,
            self.system,
            now,
        );

        let link_refs: Vec<(i64, i64, bool, bool, UntetheredTimeouts, String, i32)> = links
            .iter()
            .map(|&i| {
                let l = &self.subscriptions[i];
                (
                    l.registration_id,
                    l.client_id,
                    l.params.is_tether,
                    l.params.is_rejoin,
                    Self::untethered_timeouts(&self.config, &l.params),
                    l.canonical_channel.clone(),
                    l.stream_id,
                )
            })
            .collect();
        let log_file =
            image.shared.log.path().map(|p| p.display().to_string()).unwrap_or_default();
        for (registration_id, link_client, tether, rejoin, timeouts, chan, stream) in link_refs {
            let id = self.cnc.counters.allocate(
                SUBSCRIBER_POSITION_TYPE_ID,
                &registration_id.to_le_bytes(),
                &format!("sub-pos {chan} @{stream}"),
                registration_id,
                link_client,
                now,
            )?;
            let position = self.cnc.counters.position(id);
            position.set_ordered(join_position);
            image.subscribable.add_subscriber(
                registration_id,
                position,
                tether,
                rejoin,
                timeouts,
                now,
            );
            self.events.push(ClientEvent::AvailableImage {
                correlation_id,
                session_id: setup.session_id,
                stream_id: setup.stream_id,
                subscription_registration_id: registration_id,
                subscriber_position_id: position.id(),
                log_file: ChannelStr::from_str_truncate(&log_file),
                source_identity: LabelStr::from_str_truncate(&image.source_identity),
            });
        }

        self.receiver_proxy.send(ReceiverCmd::NewImage {
            endpoint_id,
            connection: Box::new(ImageConnection::new(
                correlation_id,
                state,
                window_length,
                self.system,
            )),
        });
        info!(
            correlation_id,
            session_id = setup.session_id,
            stream_id = setup.stream_id,
            source = %src,
            "image created"
        );
        self.images.push(image);
        Ok(())
    }

    fn allocate_counter(
        &self,
        type_id: i32,
        prefix: &str,
        channel: &str,
        registration_id: i64,
        owner_id: i64,
        now: Nanos,
    ) -> Result<Position, DriverError> {
        let id = self.cnc.counters.allocate(
            type_id,
            &registration_id.to_le_bytes(),
            &format!("{prefix} {channel}"),
            registration_id,
            owner_id,
            now,
        )?;
        Ok(self.cnc.counters.position(id))
    }

    // --- periodic work ---

    fn process_ipc_publications(&mut self, now: Nanos) -> usize {
        let mut work = 0;
        let mut publications = std::mem::take(&mut self.ipc_publications);
        for publication in &mut publications {
            publication.on_time_event(now, &mut self.events, &self.system);
            work += publication.update_publisher_position_and_limit(now);
            if publication.state() == PubLifecycle::Active {
                let consumer = publication.consumer_position();
                let window = publication.term_window_length();
                let rejoin = publication.rejoin_position();
                self.sweep_untethered_generic(
                    SweepTarget::Ipc(publication),
                    consumer,
                    window,
                    rejoin,
                    now,
                );
            }
        }

        // retire anything that finished its lifecycle
        for publication in &mut publications {
            if publication.reached_end_of_life() {
                let (pub_pos, pub_lmt) = publication.position_counters();
                for p in publication.drain_subscriber_positions() {
                    let _ = self.cnc.counters.free(p.id(), now);
                }
                let _ = self.cnc.counters.free(pub_pos.id(), now);
                let _ = self.cnc.counters.free(pub_lmt.id(), now);
                info!(registration_id = publication.registration_id, "ipc publication closed");
            }
        }
        publications.retain(|p| !p.reached_end_of_life());
        self.ipc_publications = publications;
        work
    }

    fn process_network_publications(&mut self, now: Nanos) -> usize {
        let mut work = 0;
        let mut publications = std::mem::take(&mut self.network_publications);
        for publication in &mut publications {
            publication.on_time_event(now, &mut self.events, &self.system);
            work += publication.update_publisher_position_and_limit(now);
            if publication.state() == PubLifecycle::Active {
                let consumer = publication.shared.snd_pos.get_volatile();
                let window = publication.term_window_length();
                let rejoin = publication.rejoin_position();
                self.sweep_untethered_generic(
                    SweepTarget::Spy(publication),
                    consumer,
                    window,
                    rejoin,
                    now,
                );
            }
            if publication.state() == PubLifecycle::Done
                && !self.sender_release_requested.contains(&publication.registration_id)
            {
                self.sender_proxy.send(SenderCmd::RemovePublication {
                    registration_id: publication.registration_id,
                });
                self.sender_release_requested.push(publication.registration_id);
            }
        }

        for publication in &mut publications {
            if publication.reached_end_of_life() {
                for p in publication.drain_spy_positions() {
                    let _ = self.cnc.counters.free(p.id(), now);
                }
                for p in [
                    &publication.shared.pub_pos,
                    &publication.shared.pub_lmt,
                    &publication.shared.snd_pos,
                    &publication.shared.snd_lmt,
                ] {
                    let _ = self.cnc.counters.free(p.id(), now);
                }
                self.sender_release_requested
                    .retain(|id| *id != publication.registration_id);
                info!(
                    registration_id = publication.registration_id,
                    "network publication closed"
                );
            }
        }
        publications.retain(|p| !p.reached_end_of_life());
        self.network_publications = publications;
        work
    }

    fn process_images(&mut self, now: Nanos) -> usize {
        let mut work = 0;
        let mut images = std::mem::take(&mut self.images);
        for image in &mut images {
            image.on_time_event(now, &mut self.events);
            work += image.track_rebuild(now, &mut self.loss_report);
            work += image.send_pending_status_message(now);
            if image.lifecycle() == ImageLifecycle::Active {
                let consumer = image.shared.rcv_pos.get_volatile();
                let window = image.window_length();
                let rejoin = image.rejoin_position();
                self.sweep_untethered_generic(
                    SweepTarget::Image(image),
                    consumer,
                    window,
                    rejoin,
                    now,
                );
            }
        }

        for image in &mut images {
            if image.lifecycle() == ImageLifecycle::Done {
                self.receiver_proxy
                    .send(ReceiverCmd::RemoveImage { correlation_id: image.correlation_id });
                for p in image.drain_subscriber_positions() {
                    let _ = self.cnc.counters.free(p.id(), now);
                }
                let _ = self.cnc.counters.free(image.shared.hwm.id(), now);
                let _ = self.cnc.counters.free(image.shared.rcv_pos.id(), now);
                info!(correlation_id = image.correlation_id, "image closed");
            }
        }
        images.retain(|i| i.lifecycle() != ImageLifecycle::Done);
        self.images = images;
        work
    }

    fn sweep_untethered_generic(
        &mut self,
        target: SweepTarget<'_>,
        consumer_position: i64,
        window: usize,
        rejoin_position: i64,
        now: Nanos,
    ) {
        let (subscribable, correlation_id, session_id, stream_id, log_file, source) = match target {
            SweepTarget::Ipc(p) => {
                let log_file =
                    p.log.path().map(|path| path.display().to_string()).unwrap_or_default();
                let registration_id = p.registration_id;
                let session_id = p.session_id;
                let stream_id = p.stream_id;
                (
                    &mut p.subscribable,
                    registration_id,
                    session_id,
                    stream_id,
                    log_file,
                    IPC_SOURCE_IDENTITY.to_string(),
                )
            }
            SweepTarget::Spy(p) => {
                let log_file =
                    p.log().path().map(|path| path.display().to_string()).unwrap_or_default();
                let channel = p.channel.clone();
                let registration_id = p.registration_id;
                let session_id = p.session_id();
                let stream_id = p.stream_id();
                (&mut p.spy_subscribable, registration_id, session_id, stream_id, log_file, channel)
            }
            SweepTarget::Image(i) => {
                let log_file = i
                    .shared
                    .log
                    .path()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                let source = i.source_identity.clone();
                let correlation_id = i.correlation_id;
                let session_id = i.shared.session_id;
                let stream_id = i.shared.stream_id;
                (&mut i.subscribable, correlation_id, session_id, stream_id, log_file, source)
            }
        };

        self.untethered_scratch.clear();
        subscribable.check_untethered(now, consumer_position, window, &mut self.untethered_scratch);
        for event in self.untethered_scratch.drain(..) {
            match event {
                UntetheredEvent::Unavailable { link_registration_id, position } => {
                    let _ = self.cnc.counters.free(position.id(), now);
                    self.events.push(ClientEvent::UnavailableImage {
                        correlation_id,
                        subscription_registration_id: link_registration_id,
                        stream_id,
                    });
                }
                UntetheredEvent::Remove { link_registration_id } => {
                    tracing::debug!(link_registration_id, "untethered subscriber dropped");
                }
                UntetheredEvent::Rejoin { link_registration_id } => {
                    let Some(link) = self
                        .subscriptions
                        .iter()
                        .find(|l| l.registration_id == link_registration_id)
                    else {
                        continue;
                    };
                    let Ok(id) = self.cnc.counters.allocate(
                        SUBSCRIBER_POSITION_TYPE_ID,
                        &link.registration_id.to_le_bytes(),
                        &format!("sub-pos {} @{}", link.canonical_channel, link.stream_id),
                        link.registration_id,
                        link.client_id,
                        now,
                    ) else {
                        continue;
                    };
                    let position = self.cnc.counters.position(id);
                    position.set_ordered(rejoin_position);
                    subscribable.rejoin_subscriber(link_registration_id, position, now);
                    self.events.push(ClientEvent::AvailableImage {
                        correlation_id,
                        session_id,
                        stream_id,
                        subscription_registration_id: link_registration_id,
                        subscriber_position_id: position.id(),
                        log_file: ChannelStr::from_str_truncate(&log_file),
                        source_identity: LabelStr::from_str_truncate(&source),
                    });
                }
            }
        }
    }

    fn check_clients(&mut self, now: Nanos) {
        let timeout = self.config.client_liveness_timeout;
        let expired: Vec<i64> = self
            .clients
            .iter()
            .filter(|c| now.saturating_sub(c.time_of_last_activity) >= timeout)
            .map(|c| c.client_id)
            .collect();
        for client_id in expired {
            warn!(client_id, "client timed out");
            self.system.client_timeouts.increment();
            self.events.push(ClientEvent::ClientTimeout { client_id });
            self.cleanup_client(client_id, now);
        }
    }

    /// Release everything a departed client held: publication refs,
    /// subscription links and owned (non-static) counters.
    fn cleanup_client(&mut self, client_id: i64, now: Nanos) {
        let targets: Vec<PubTarget> = self
            .attachments
            .iter()
            .filter(|a| a.client_id == client_id)
            .map(|a| a.target)
            .collect();
        self.attachments.retain(|a| a.client_id != client_id);
        for target in targets {
            self.dec_ref(target, now);
        }

        let links: Vec<SubscriptionLink> = {
            let mut kept = Vec::new();
            let mut removed = Vec::new();
            for link in self.subscriptions.drain(..) {
                if link.client_id == client_id {
                    removed.push(link);
                } else {
                    kept.push(link);
                }
            }
            self.subscriptions = kept;
            removed
        };
        for link in &links {
            self.unlink_subscription(link, now);
        }

        for counter_id in self.cnc.counters.free_for_owner(client_id, now) {
            self.events.push(ClientEvent::UnavailableCounter {
                registration_id: self.cnc.counters.registration_id(counter_id),
                counter_id,
            });
        }
        self.clients.retain(|c| c.client_id != client_id);
    }
}

enum SweepTarget<'a> {
    Ipc(&'a mut IpcPublication),
    Spy(&'a mut NetworkPublication),
    Image(&'a mut PublicationImage),
}

impl Agent for DriverConductor {
    fn name(&self) -> &'static str {
        "conductor"
    }

    fn do_work(&mut self, now: Nanos) -> usize {
        self.check_service_interval(now);
        self.cnc.update_heartbeat(now);

        let mut work = self.drain_commands(now);
        work += self.drain_receiver_requests(now);
        work += self.process_ipc_publications(now);
        work += self.process_network_publications(now);
        work += self.process_images(now);
        self.check_clients(now);
        self.flush_events();
        work
    }

    fn on_close(&mut self) {
        info!("conductor closing");
    }
}
