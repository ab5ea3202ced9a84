//! Cooperative agent loops. Each agent is a `do_work` slice invoked from a
//! pinned thread; threading modes compose the three driver agents onto
//! one, two or three threads. Between cycles an idle strategy spins,
//! yields, then parks with an increasing bound.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use core_affinity::CoreId;
use sluice_timing::Nanos;
use tracing::{Level, info, span, warn};

pub trait Agent: Send {
    fn name(&self) -> &'static str;
    /// One duty cycle; returns how much work was done.
    fn do_work(&mut self, now: Nanos) -> usize;
    fn on_close(&mut self) {}
}

/// How a driver thread is scheduled, derived from which agents it hosts.
/// A thread carrying only the data path (a dedicated sender or receiver)
/// asks for realtime scheduling; any thread hosting the conductor stays on
/// the OS scheduler, since lifecycle work parks between duty cycles and
/// must not hog a core it shares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentClass {
    /// Conductor alone, or any mix of agents on one thread.
    Control,
    /// Sender and/or receiver with the whole thread to themselves.
    DataPath,
}

/// `SCHED_FIFO` priority for dedicated data-path threads. Needs
/// CAP_SYS_NICE; without it the thread degrades to the default scheduler.
const DATA_PATH_FIFO_PRIORITY: i32 = 50;

fn boot_agent_thread(core: Option<usize>, class: AgentClass) {
    if let Some(core) = core {
        if !core_affinity::set_for_current(CoreId { id: core }) {
            warn!(core, "couldn't pin agent thread");
        }
    }
    if class == AgentClass::DataPath {
        request_data_path_scheduling();
    }
}

#[cfg(target_os = "linux")]
fn request_data_path_scheduling() {
    let param = libc::sched_param { sched_priority: DATA_PATH_FIFO_PRIORITY };
    let code = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if code != 0 {
        warn!(%code, "couldn't raise data-path thread to SCHED_FIFO");
    }
}

#[cfg(not(target_os = "linux"))]
fn request_data_path_scheduling() {
    warn!("data-path realtime scheduling only supported on linux");
}

#[derive(Clone, Copy, Debug)]
pub struct BackoffIdle {
    max_spins: u32,
    max_yields: u32,
    min_park: Nanos,
    max_park: Nanos,
    spins: u32,
    yields: u32,
    park: Nanos,
}

impl BackoffIdle {
    pub fn new(max_spins: u32, max_yields: u32, min_park: Nanos, max_park: Nanos) -> Self {
        Self { max_spins, max_yields, min_park, max_park, spins: 0, yields: 0, park: min_park }
    }

    pub fn idle(&mut self, work: usize) {
        if work > 0 {
            self.reset();
            return;
        }
        if self.spins < self.max_spins {
            self.spins += 1;
            std::hint::spin_loop();
        } else if self.yields < self.max_yields {
            self.yields += 1;
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.park.into());
            self.park = (self.park * 2u64).min(self.max_park);
        }
    }

    fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park = self.min_park;
    }
}

impl Default for BackoffIdle {
    fn default() -> Self {
        Self::new(10, 20, Nanos::from_micros(50), Nanos::from_millis(1))
    }
}

/// Boot a thread running the given agents until the stop flag flips.
pub fn spawn_agents(
    thread_name: &str,
    mut agents: Vec<Box<dyn Agent>>,
    core: Option<usize>,
    class: AgentClass,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let thread_name = thread_name.to_string();
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let _span = span!(Level::INFO, "", agent_thread = %thread_name).entered();
            boot_agent_thread(core, class);
            info!("agent thread booted");

            let mut idle = BackoffIdle::default();
            loop {
                let now = Nanos::now();
                let mut work = 0;
                for agent in &mut agents {
                    work += agent.do_work(now);
                }
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                idle.idle(work);
            }

            for agent in &mut agents {
                agent.on_close();
                info!(agent = agent.name(), "agent closed");
            }
        })
        .expect("failed to spawn agent thread")
}
