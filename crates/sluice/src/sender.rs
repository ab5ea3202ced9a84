//! Sender agent: drives the send loop of every network publication and
//! processes inbound feedback (status messages, NAKs, RTT replies) from
//! their endpoints. Receives ownership changes from the conductor through
//! a proxy queue; never parks on the data path.

use std::{collections::VecDeque, net::SocketAddr, sync::Arc};

use sluice_timing::Nanos;
use tracing::debug;

use crate::{agent::Agent, publication::network::SenderPublication};

pub enum SenderCmd {
    NewPublication(Box<SenderPublication>),
    RemovePublication { registration_id: i64 },
    AddDestination { registration_id: i64, destination: SocketAddr },
    RemoveDestination { registration_id: i64, destination: SocketAddr },
}

#[derive(Clone, Default)]
pub struct SenderProxy {
    queue: Arc<spin::Mutex<VecDeque<SenderCmd>>>,
}

impl SenderProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, cmd: SenderCmd) {
        self.queue.lock().push_back(cmd);
    }
}

pub struct Sender {
    proxy: SenderProxy,
    publications: Vec<SenderPublication>,
}

impl Sender {
    pub fn new(proxy: SenderProxy) -> Self {
        Self { proxy, publications: Vec::new() }
    }

    fn drain_commands(&mut self) -> usize {
        let mut work = 0;
        loop {
            let Some(cmd) = self.proxy.queue.lock().pop_front() else { break };
            work += 1;
            match cmd {
                SenderCmd::NewPublication(publication) => {
                    debug!(registration_id = publication.registration_id, "sender took publication");
                    self.publications.push(*publication);
                }
                SenderCmd::RemovePublication { registration_id } => {
                    self.publications.retain(|p| {
                        if p.registration_id == registration_id {
                            p.release();
                            false
                        } else {
                            true
                        }
                    });
                }
                SenderCmd::AddDestination { registration_id, destination } => {
                    if let Some(p) = self.publication_mut(registration_id) {
                        p.add_destination(destination);
                    }
                }
                SenderCmd::RemoveDestination { registration_id, destination } => {
                    if let Some(p) = self.publication_mut(registration_id) {
                        p.remove_destination(destination);
                    }
                }
            }
        }
        work
    }

    fn publication_mut(&mut self, registration_id: i64) -> Option<&mut SenderPublication> {
        self.publications.iter_mut().find(|p| p.registration_id == registration_id)
    }
}

impl Agent for Sender {
    fn name(&self) -> &'static str {
        "sender"
    }

    fn do_work(&mut self, now: Nanos) -> usize {
        let mut work = self.drain_commands();
        for publication in &mut self.publications {
            work += publication.do_work(now);
        }
        work
    }

    fn on_close(&mut self) {
        for publication in &self.publications {
            publication.release();
        }
        self.publications.clear();
    }
}
