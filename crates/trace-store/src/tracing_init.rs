use std::{
    env,
    fs::File,
    io,
    path::{Path, PathBuf},
};

use tracing_subscriber::{
    EnvFilter, fmt::MakeWriter, layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::cli::{Args, Verb};

/// Log file of a daemon that was given no explicit path.
#[must_use]
pub fn default_daemon_log_path(pid: u32) -> PathBuf {
    env::temp_dir().join(format!("trace-store-daemon-{pid}.log"))
}

/// The daemon has no terminal once detached, so it always logs to a file.
/// Everything else is short-lived and logs to stderr unless told otherwise.
pub fn init_tracing(args: &Args) -> io::Result<()> {
    let log_path = match (&args.verb(), &args.common.log_path) {
        (_, Some(path)) => Some(path.clone()),
        (Verb::Daemon { .. }, None) => {
            Some(default_daemon_log_path(std::process::id()))
        }
        _ => None,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    match log_path {
        Some(path) => install(env_filter, create_log(&path)?),
        None => install(env_filter, io::stderr),
    }
    Ok(())
}

fn create_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    File::create(path)
}

fn install<W>(env_filter: EnvFilter, writer: W)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(false);

    #[cfg(tokio_unstable)]
    {
        // runs its own server thread; honors TOKIO_CONSOLE_* env vars
        let console_layer = console_subscriber::ConsoleLayer::builder()
            .with_default_env()
            .spawn();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(fmt_layer)
            .init();
    }

    #[cfg(not(tokio_unstable))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }
}
