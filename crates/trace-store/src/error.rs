use std::{backtrace::Backtrace, io, path::PathBuf, time::Duration};

use snafu::Snafu;
use trace_store_ipc::IpcError;

use crate::exit_code::ExitCode;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LaunchError {
    #[snafu(display("unable to create the begun signal: {source}"))]
    BegunCreate { source: IpcError },

    #[snafu(display(
        "another launcher is starting the daemon and it never published"
    ))]
    BegunExists,

    #[snafu(display("daemon did not report begun within {timeout:?}"))]
    BegunTimeout { timeout: Duration },

    #[snafu(display(
        "unable to copy {} to {}: {source}",
        from.display(),
        to.display()
    ))]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("unable to detach the daemon: {source}"))]
    Fork { source: io::Error },

    #[snafu(display("unable to launch {}: {source}", binary.display()))]
    Launch { binary: PathBuf, source: io::Error },

    #[snafu(display("running daemon has no quit signal"))]
    NoQuitEvent,

    #[snafu(display("unable to reach daemon process: {source}"))]
    ProcessOpen { source: IpcError },

    #[snafu(display("a daemon already owns the quit signal"))]
    QuitExists,

    #[snafu(display("unable to create the quit signal: {source}"))]
    QuitCreate { source: IpcError },

    #[snafu(display(
        "unable to move staged binary into place at {}: {source}",
        to.display()
    ))]
    Rename {
        to: PathBuf,
        source: io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("unable to create the instance segment: {source}"))]
    SharedMem { source: IpcError },

    #[snafu(display("unable to size the instance segment: {source}"))]
    SharedMemTrunc { source: IpcError },

    #[snafu(display("{what}: {source}"))]
    Ipc {
        what: &'static str,
        source: IpcError,
    },

    #[snafu(display("{what}: {source}"))]
    Io {
        what: String,
        source: io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("self check failed: {message}"))]
    SelfCheck { message: String },
}

impl LaunchError {
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            LaunchError::BegunCreate { .. } => ExitCode::BegunCreateFail,
            LaunchError::BegunExists => ExitCode::BegunExists,
            LaunchError::BegunTimeout { .. } => ExitCode::BegunTimeout,
            LaunchError::Copy { .. } => ExitCode::CopyFail,
            LaunchError::Fork { .. } => ExitCode::ForkFail,
            LaunchError::Launch { .. } => ExitCode::LaunchFail,
            LaunchError::NoQuitEvent => ExitCode::NoQuitEvent,
            LaunchError::ProcessOpen { .. } => ExitCode::ProcessOpenFail,
            LaunchError::QuitExists => ExitCode::QuitExists,
            LaunchError::Rename { .. } => ExitCode::RenameFail,
            LaunchError::SharedMem { .. } => ExitCode::SharedMemFail,
            LaunchError::SharedMemTrunc { .. } => ExitCode::SharedMemTruncFail,
            LaunchError::QuitCreate { .. }
            | LaunchError::Ipc { .. }
            | LaunchError::Io { .. }
            | LaunchError::SelfCheck { .. } => ExitCode::UnexpectedError,
        }
    }
}
