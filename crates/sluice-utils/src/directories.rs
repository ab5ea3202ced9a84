use std::path::PathBuf;

use directories::BaseDirs;
use tracing::warn;

/// Default top-level directory for a driver instance.
///
/// Linux prefers `/dev/shm` so flink files and the memory they describe live
/// on the same tmpfs. Elsewhere we fall back to the platform data dir.
pub fn default_driver_dir(app_name: &str) -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        PathBuf::from(format!("/dev/shm/{app_name}-{user}"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        local_share_dir(app_name)
    }
}

pub fn local_share_dir(app_name: &str) -> PathBuf {
    let Some(base_dirs) = BaseDirs::new() else {
        warn!("couldn't find basedirs, storing data in /tmp/{app_name}");
        return PathBuf::from(format!("/tmp/{app_name}"));
    };
    base_dirs.data_dir().join(app_name)
}

/// Directory holding the per-publication and per-image log buffer files.
pub fn logs_dir(driver_dir: impl Into<PathBuf>) -> PathBuf {
    driver_dir.into().join("logs")
}
