use std::sync::Arc;

use sluice::{
    config::DriverConfig,
    driver::Driver,
    transport::NoMediaFactory,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match DriverConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("bad configuration: {e}");
            std::process::exit(1);
        }
    };

    let handle = match Driver::launch(config, Arc::new(NoMediaFactory)) {
        Ok(handle) => handle,
        Err(e) => {
            error!("driver failed to launch: {e}");
            std::process::exit(1);
        }
    };

    let stop = handle.stop_flag();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, stop.clone()) {
            error!("couldn't register signal handler: {e}");
        }
    }

    info!("driver running, ctrl-c to stop");
    handle.await_shutdown();
    info!("driver stopped");
}
