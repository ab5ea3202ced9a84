//! Transport seam. OS sockets live outside the core: the driver talks to a
//! `ChannelTransport`, and tests (and the loopback demo) wire endpoints
//! together through an in-memory hub with bounded queues so short sends and
//! back-pressure are observable.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
};

use crate::{channel::ChannelUri, error::DriverError};

/// One datagram endpoint. `send_to` is best-effort and returns the bytes
/// accepted (0 = refused, try again next duty cycle). `poll` drains up to
/// `limit` inbound datagrams into the callback.
pub trait ChannelTransport: Send + Sync {
    fn send_to(&self, frame: &[u8], dst: SocketAddr) -> usize;
    fn poll(&self, limit: usize, f: &mut dyn FnMut(&[u8], SocketAddr)) -> usize;
    fn local_addr(&self) -> SocketAddr;
}

/// Hands a transport to each endpoint the conductor opens.
pub trait TransportFactory: Send + Sync {
    fn create(&self, uri: &ChannelUri, bind: Option<&str>) -> Result<Arc<dyn ChannelTransport>, DriverError>;
}

/// Factory for drivers with no network media configured; IPC still works.
pub struct NoMediaFactory;

impl TransportFactory for NoMediaFactory {
    fn create(&self, uri: &ChannelUri, _bind: Option<&str>) -> Result<Arc<dyn ChannelTransport>, DriverError> {
        Err(DriverError::InvalidChannel(format!(
            "{}: no network media configured for this driver",
            uri.as_str()
        )))
    }
}

type Mailbox = Arc<spin::Mutex<VecDeque<(Vec<u8>, SocketAddr)>>>;

struct HubInner {
    mailboxes: HashMap<SocketAddr, Mailbox>,
    next_port: u16,
}

/// In-memory datagram switch: every endpoint gets a mailbox keyed by its
/// address, sends enqueue into the destination mailbox.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<spin::Mutex<HubInner>>,
    capacity: usize,
}

impl LoopbackHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(spin::Mutex::new(HubInner {
                mailboxes: HashMap::new(),
                next_port: 20000,
            })),
            capacity,
        }
    }

    /// Bind a named endpoint, e.g. `127.0.0.1:40123`.
    pub fn bind(&self, addr: &str) -> Result<Arc<dyn ChannelTransport>, DriverError> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| DriverError::InvalidChannel(format!("bad endpoint address: {addr}")))?;
        self.attach(addr)
    }

    /// Bind an ephemeral endpoint, the loopback stand-in for an
    /// unconnected sending socket.
    pub fn bind_ephemeral(&self) -> Arc<dyn ChannelTransport> {
        let addr = {
            let mut inner = self.inner.lock();
            inner.next_port += 1;
            SocketAddr::from(([127, 0, 0, 1], inner.next_port))
        };
        self.attach(addr).expect("ephemeral port collision")
    }

    fn attach(&self, addr: SocketAddr) -> Result<Arc<dyn ChannelTransport>, DriverError> {
        let mailbox: Mailbox = Arc::new(spin::Mutex::new(VecDeque::new()));
        {
            let mut inner = self.inner.lock();
            if inner.mailboxes.contains_key(&addr) {
                return Err(DriverError::InvalidChannel(format!("address in use: {addr}")));
            }
            inner.mailboxes.insert(addr, mailbox.clone());
        }
        Ok(Arc::new(LoopbackTransport {
            hub: self.inner.clone(),
            mailbox,
            addr,
            capacity: self.capacity,
        }))
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub struct LoopbackTransport {
    hub: Arc<spin::Mutex<HubInner>>,
    mailbox: Mailbox,
    addr: SocketAddr,
    capacity: usize,
}

impl ChannelTransport for LoopbackTransport {
    fn send_to(&self, frame: &[u8], dst: SocketAddr) -> usize {
        let mailbox = {
            let inner = self.hub.lock();
            inner.mailboxes.get(&dst).cloned()
        };
        let Some(mailbox) = mailbox else {
            // unroutable datagrams vanish, as on a real network
            return frame.len();
        };
        let mut queue = mailbox.lock();
        if queue.len() >= self.capacity {
            return 0;
        }
        queue.push_back((frame.to_vec(), self.addr));
        frame.len()
    }

    fn poll(&self, limit: usize, f: &mut dyn FnMut(&[u8], SocketAddr)) -> usize {
        let mut polled = 0;
        while polled < limit {
            let Some((frame, src)) = self.mailbox.lock().pop_front() else {
                break;
            };
            f(&frame, src);
            polled += 1;
        }
        polled
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// `TransportFactory` over a `LoopbackHub`: publications bind ephemeral
/// ports, subscriptions bind their `endpoint` param.
pub struct LoopbackFactory {
    pub hub: LoopbackHub,
}

impl TransportFactory for LoopbackFactory {
    fn create(&self, uri: &ChannelUri, bind: Option<&str>) -> Result<Arc<dyn ChannelTransport>, DriverError> {
        match bind {
            Some(endpoint) => self.hub.bind(endpoint),
            None => {
                let _ = uri;
                Ok(self.hub.bind_ephemeral())
            }
        }
    }
}

/// Resolve an `endpoint`/`control` param to a socket address. Supports
/// `localhost` as the only name; real resolution is out of scope.
pub fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, DriverError> {
    let resolved = endpoint.replace("localhost", "127.0.0.1");
    resolved
        .parse()
        .map_err(|_| DriverError::InvalidChannel(format!("cannot resolve endpoint: {endpoint}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagrams_route_between_endpoints() {
        let hub = LoopbackHub::default();
        let a = hub.bind("127.0.0.1:40123").unwrap();
        let b = hub.bind_ephemeral();

        assert_eq!(b.send_to(b"hello", a.local_addr()), 5);
        let mut got = Vec::new();
        a.poll(8, &mut |frame, src| {
            got.push((frame.to_vec(), src));
        });
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, b"hello");
        assert_eq!(got[0].1, b.local_addr());
    }

    #[test]
    fn full_mailbox_refuses() {
        let hub = LoopbackHub::new(1);
        let a = hub.bind("127.0.0.1:40124").unwrap();
        let b = hub.bind_ephemeral();

        assert_eq!(b.send_to(b"one", a.local_addr()), 3);
        assert_eq!(b.send_to(b"two", a.local_addr()), 0);
    }

    #[test]
    fn unroutable_disappears() {
        let hub = LoopbackHub::default();
        let a = hub.bind_ephemeral();
        assert_eq!(a.send_to(b"gone", "127.0.0.1:1".parse().unwrap()), 4);
    }

    #[test]
    fn endpoint_resolution() {
        assert!(resolve_endpoint("localhost:40123").is_ok());
        assert!(resolve_endpoint("127.0.0.1:40123").is_ok());
        assert!(resolve_endpoint("not-an-endpoint").is_err());
    }
}
