//! Receiver agent: polls the subscription endpoints, dispatches data into
//! image term buffers, answers RTT probes and elicits SETUP for unknown
//! streams. Image creation itself is a conductor decision, requested
//! through the conductor proxy on first SETUP from a new (session, stream,
//! source) triple.

use std::{collections::VecDeque, net::SocketAddr, sync::Arc};

use sluice_logbuffer::frame::{self, FrameType, SEND_SETUP_FLAG};
use sluice_timing::Nanos;
use tracing::debug;

use crate::{
    agent::Agent,
    image::ImageConnection,
    protocol::{self, RttMeasurement, SetupMessage, StatusMessage},
    transport::ChannelTransport,
};

const RECEIVE_POLL_LIMIT: usize = 16;

pub enum ReceiverCmd {
    AddEndpoint { endpoint_id: i64, transport: Arc<dyn ChannelTransport> },
    RemoveEndpoint { endpoint_id: i64 },
    AddSubscription { endpoint_id: i64, stream_id: i32 },
    RemoveSubscription { endpoint_id: i64, stream_id: i32 },
    NewImage { endpoint_id: i64, connection: Box<ImageConnection> },
    RemoveImage { correlation_id: i64 },
}

#[derive(Clone, Default)]
pub struct ReceiverProxy {
    queue: Arc<spin::Mutex<VecDeque<ReceiverCmd>>>,
}

impl ReceiverProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, cmd: ReceiverCmd) {
        self.queue.lock().push_back(cmd);
    }
}

/// Receiver-to-conductor requests.
pub enum ConductorCmd {
    CreateImage { endpoint_id: i64, setup: SetupMessage, src: SocketAddr },
}

#[derive(Clone, Default)]
pub struct ConductorProxy {
    queue: Arc<spin::Mutex<VecDeque<ConductorCmd>>>,
}

impl ConductorProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, cmd: ConductorCmd) {
        self.queue.lock().push_back(cmd);
    }

    pub fn drain(&self) -> Vec<ConductorCmd> {
        let mut queue = self.queue.lock();
        queue.drain(..).collect()
    }
}

struct ReceiveEndpoint {
    endpoint_id: i64,
    transport: Arc<dyn ChannelTransport>,
    receiver_id: i64,
    streams: Vec<i32>,
    images: Vec<ImageConnection>,
}

pub struct Receiver {
    proxy: ReceiverProxy,
    conductor: ConductorProxy,
    endpoints: Vec<ReceiveEndpoint>,
}

impl Receiver {
    pub fn new(proxy: ReceiverProxy, conductor: ConductorProxy) -> Self {
        Self { proxy, conductor, endpoints: Vec::new() }
    }

    fn drain_commands(&mut self) -> usize {
        let mut work = 0;
        loop {
            let Some(cmd) = self.proxy.queue.lock().pop_front() else { break };
            work += 1;
            match cmd {
                ReceiverCmd::AddEndpoint { endpoint_id, transport } => {
                    debug!(endpoint_id, addr = %transport.local_addr(), "receiver endpoint up");
                    self.endpoints.push(ReceiveEndpoint {
                        endpoint_id,
                        transport,
                        receiver_id: rand::random(),
                        streams: Vec::new(),
                        images: Vec::new(),
                    });
                }
                ReceiverCmd::RemoveEndpoint { endpoint_id } => {
                    self.endpoints.retain(|e| e.endpoint_id != endpoint_id);
                }
                ReceiverCmd::AddSubscription { endpoint_id, stream_id } => {
                    if let Some(endpoint) = self.endpoint_mut(endpoint_id) {
                        if !endpoint.streams.contains(&stream_id) {
                            endpoint.streams.push(stream_id);
                        }
                    }
                }
                ReceiverCmd::RemoveSubscription { endpoint_id, stream_id } => {
                    if let Some(endpoint) = self.endpoint_mut(endpoint_id) {
                        endpoint.streams.retain(|s| *s != stream_id);
                    }
                }
                ReceiverCmd::NewImage { endpoint_id, connection } => {
                    if let Some(endpoint) = self.endpoint_mut(endpoint_id) {
                        endpoint.images.push(*connection);
                    }
                }
                ReceiverCmd::RemoveImage { correlation_id } => {
                    for endpoint in &mut self.endpoints {
                        endpoint.images.retain(|i| i.correlation_id != correlation_id);
                    }
                }
            }
        }
        work
    }

    fn endpoint_mut(&mut self, endpoint_id: i64) -> Option<&mut ReceiveEndpoint> {
        self.endpoints.iter_mut().find(|e| e.endpoint_id == endpoint_id)
    }
}

impl Agent for Receiver {
    fn name(&self) -> &'static str {
        "receiver"
    }

    fn do_work(&mut self, now: Nanos) -> usize {
        let mut work = self.drain_commands();
        let conductor = &self.conductor;
        for endpoint in &mut self.endpoints {
            let transport = endpoint.transport.clone();
            let endpoint_id = endpoint.endpoint_id;
            let receiver_id = endpoint.receiver_id;
            let streams = &endpoint.streams;
            let images = &endpoint.images;

            work += transport.poll(RECEIVE_POLL_LIMIT, &mut |datagram, src| {
                match protocol::classify(datagram) {
                    Some(FrameType::Data | FrameType::Pad) => {
                        on_data(datagram, src, &transport, receiver_id, streams, images, now);
                    }
                    Some(FrameType::Setup) => {
                        if let Some(setup) = SetupMessage::decode(datagram) {
                            // the conductor dedupes repeats while creation
                            // or a rejection cooldown is in flight
                            if streams.contains(&setup.stream_id)
                                && !images.iter().any(|i| {
                                    i.session_id() == setup.session_id
                                        && i.stream_id() == setup.stream_id
                                })
                            {
                                conductor.send(ConductorCmd::CreateImage {
                                    endpoint_id,
                                    setup,
                                    src,
                                });
                            }
                        }
                    }
                    Some(FrameType::Rtt) => {
                        if let Some(rtt) = RttMeasurement::decode(datagram) {
                            if !rtt.is_reply {
                                let reply = RttMeasurement {
                                    session_id: rtt.session_id,
                                    stream_id: rtt.stream_id,
                                    echo_timestamp_ns: rtt.echo_timestamp_ns,
                                    reception_delay_ns: 0,
                                    receiver_id,
                                    is_reply: true,
                                };
                                let mut buf = [0u8; protocol::RTT_LENGTH];
                                let len = reply.encode(&mut buf);
                                transport.send_to(&buf[..len], src);
                            }
                        }
                    }
                    _ => {}
                }
            });
        }
        work
    }
}

/// Route a data or padding frame to its image, or ask the sender for a
/// SETUP when the stream is subscribed but the session is unknown.
fn on_data(
    datagram: &[u8],
    src: SocketAddr,
    transport: &Arc<dyn ChannelTransport>,
    receiver_id: i64,
    streams: &[i32],
    images: &[ImageConnection],
    now: Nanos,
) {
    if datagram.len() < frame::HEADER_LENGTH {
        return;
    }
    let get = |offset: usize| i32::from_le_bytes(datagram[offset..offset + 4].try_into().unwrap());
    let term_offset = get(frame::TERM_OFFSET_OFFSET);
    let session_id = get(frame::SESSION_ID_OFFSET);
    let stream_id = get(frame::STREAM_ID_OFFSET);
    let term_id = get(frame::TERM_ID_OFFSET);

    if let Some(image) = images
        .iter()
        .find(|i| i.session_id() == session_id && i.stream_id() == stream_id)
    {
        image.insert_packet(term_id, term_offset, datagram, now);
    } else if streams.contains(&stream_id) {
        // data before any SETUP: ask for one, echoing the frame's own term
        // position so the sender's flow control sees a sane value
        let elicit = StatusMessage {
            session_id,
            stream_id,
            consumption_term_id: term_id,
            consumption_term_offset: term_offset,
            receiver_window: 0,
            receiver_id,
            group_tag: None,
            flags: SEND_SETUP_FLAG,
        };
        let mut buf = [0u8; protocol::STATUS_MESSAGE_WITH_GTAG_LENGTH];
        let len = elicit.encode(&mut buf);
        transport.send_to(&buf[..len], src);
    }
}
