use std::{env, path::PathBuf, time::Duration};

use snafu::ResultExt;
use trace_store_ipc::Version;

use crate::{
    cli::CommonArgs,
    error::{IoSnafu, LaunchError},
};

pub const APP_DIR: &str = "trace-store";

/// Sleep between liveness probes while waiting for a daemon to exit.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resolved configuration shared by every verb.
#[derive(Debug, Clone)]
pub struct Settings {
    pub namespace: String,
    /// Version this binary publishes and compares against.
    pub version: Version,
    /// Binary that gets staged and launched.
    pub source_exe: PathBuf,
    pub cache_dir: PathBuf,
    pub store_dir: PathBuf,
    pub port: u16,
    pub begun_timeout: Duration,
    pub quit_timeout: Duration,
    pub poll_interval: Duration,
}

impl Settings {
    pub fn from_args(args: &CommonArgs) -> Result<Self, LaunchError> {
        let source_exe = env::current_exe().context(IoSnafu {
            what: "unable to locate the running binary",
        })?;
        Ok(Self {
            namespace: args.namespace.clone(),
            version: Version::CURRENT,
            source_exe,
            cache_dir: args.cache_dir.clone().unwrap_or_else(default_cache_dir),
            store_dir: args.store_dir.clone().unwrap_or_else(default_store_dir),
            port: args.port,
            begun_timeout: Duration::from_millis(args.begun_timeout_ms),
            quit_timeout: Duration::from_millis(args.quit_timeout_ms),
            poll_interval: POLL_INTERVAL,
        })
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir().unwrap_or_else(env::temp_dir).join(APP_DIR)
}

fn default_store_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join(APP_DIR)
        .join("store")
}
