//! Driver assembly: builds the cnc file and counters, wires the three
//! agents together and boots them according to the threading mode.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use sluice_timing::Nanos;
use tracing::info;

use crate::{
    agent::{Agent, AgentClass, spawn_agents},
    cnc::CncFile,
    conductor::DriverConductor,
    config::{DriverConfig, ThreadingMode},
    counters::SystemCounters,
    error::DriverError,
    receiver::{ConductorProxy, Receiver, ReceiverProxy},
    sender::{Sender, SenderProxy},
    transport::TransportFactory,
};

pub struct DriverHandle {
    stop: Arc<AtomicBool>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl DriverHandle {
    #[inline]
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }

    /// Block until every agent thread has drained and exited.
    pub fn await_shutdown(self) {
        for thread in self.threads {
            let _ = thread.join();
        }
    }

    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Release);
        self.await_shutdown();
    }
}

pub struct Driver;

impl Driver {
    pub fn launch(
        config: DriverConfig,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Result<DriverHandle, DriverError> {
        config.validate()?;
        std::fs::create_dir_all(config.dir.join("logs"))
            .map_err(|e| DriverError::Generic(format!("cannot create driver dir: {e}")))?;

        let cnc = CncFile::create(&config)?;
        let system = SystemCounters::allocate(&cnc.counters, Nanos::now())?;
        let stop = Arc::new(AtomicBool::new(false));

        let sender_proxy = SenderProxy::new();
        let receiver_proxy = ReceiverProxy::new();
        let from_receiver = ConductorProxy::new();

        let conductor = DriverConductor::new(
            config.clone(),
            cnc,
            system,
            transport_factory,
            sender_proxy.clone(),
            receiver_proxy.clone(),
            from_receiver.clone(),
            stop.clone(),
        )?;
        let sender = Sender::new(sender_proxy);
        let receiver = Receiver::new(receiver_proxy, from_receiver);

        info!(dir = %config.dir.display(), mode = ?config.threading_mode, "driver launching");

        // threads hosting the conductor run as Control; only threads left
        // entirely to the data path ask for realtime scheduling
        let threads = match config.threading_mode {
            ThreadingMode::Shared => vec![spawn_agents(
                "sluice-driver",
                vec![
                    Box::new(conductor) as Box<dyn Agent>,
                    Box::new(sender),
                    Box::new(receiver),
                ],
                None,
                AgentClass::Control,
                stop.clone(),
            )],
            ThreadingMode::SharedNetwork => vec![
                spawn_agents(
                    "sluice-conductor",
                    vec![Box::new(conductor) as Box<dyn Agent>],
                    None,
                    AgentClass::Control,
                    stop.clone(),
                ),
                spawn_agents(
                    "sluice-network",
                    vec![Box::new(sender) as Box<dyn Agent>, Box::new(receiver)],
                    None,
                    AgentClass::DataPath,
                    stop.clone(),
                ),
            ],
            ThreadingMode::Dedicated => vec![
                spawn_agents(
                    "sluice-conductor",
                    vec![Box::new(conductor) as Box<dyn Agent>],
                    None,
                    AgentClass::Control,
                    stop.clone(),
                ),
                spawn_agents(
                    "sluice-sender",
                    vec![Box::new(sender) as Box<dyn Agent>],
                    None,
                    AgentClass::DataPath,
                    stop.clone(),
                ),
                spawn_agents(
                    "sluice-receiver",
                    vec![Box::new(receiver) as Box<dyn Agent>],
                    None,
                    AgentClass::DataPath,
                    stop.clone(),
                ),
            ],
        };

        Ok(DriverHandle { stop, threads })
    }
}
