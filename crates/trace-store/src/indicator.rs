use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use trace_store_ipc::Version;

pub const INDICATOR_FILE: &str = "instance.json";

/// What `instance.json` says about the running daemon. Purely informational:
/// nothing in the launch protocol reads it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub version: String,
    pub version_raw: u32,
    pub pid: u32,
    pub port: u16,
    pub started_unix_ms: u64,
}

impl InstanceStatus {
    #[must_use]
    pub fn now(version: Version, pid: u32, port: u16) -> Self {
        let started_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self {
            version: version.to_string(),
            version_raw: version.raw(),
            pid,
            port,
            started_unix_ms,
        }
    }
}

/// The on-disk "daemon is up" marker, removed again on drop.
#[derive(Debug)]
pub struct LivenessIndicator {
    path: PathBuf,
}

impl LivenessIndicator {
    pub fn show(dir: &Path, status: &InstanceStatus) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(INDICATOR_FILE);
        let tmp = dir.join(format!("{INDICATOR_FILE}.{}", status.pid));
        fs::write(&tmp, serde_json::to_vec_pretty(status)?)?;
        fs::rename(&tmp, &path)?;
        Ok(Self { path })
    }

    pub fn read(dir: &Path) -> io::Result<Option<InstanceStatus>> {
        match fs::read(dir.join(INDICATOR_FILE)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for LivenessIndicator {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
