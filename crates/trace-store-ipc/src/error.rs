use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("named object `{name}` already exists")]
    AlreadyExists { name: String },

    #[error("unable to create `{name}`: {source}")]
    Create { name: String, source: io::Error },

    #[error("unable to size `{name}`: {source}")]
    Truncate { name: String, source: io::Error },

    #[error("unable to map `{name}`: {source}")]
    Map { name: String, source: io::Error },

    #[error("unable to open `{name}`: {source}")]
    Open { name: String, source: io::Error },

    #[error("signal `{name}` failed: {source}")]
    Signal { name: String, source: io::Error },

    #[error("unable to reach process {pid}: {source}")]
    Process { pid: u32, source: io::Error },

    #[error("instance record was never published")]
    NotPublished,
}

impl IpcError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, IpcError::AlreadyExists { .. })
    }
}
