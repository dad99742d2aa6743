use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{Mutex, PoisonError},
    thread::{self, JoinHandle},
};

use snafu::ResultExt;
use tracing::{debug, info};
use trace_store_ipc::Platform;

use crate::{
    cli::CommonArgs,
    daemon::{Daemon, DaemonOptions},
    error::{ForkSnafu, LaunchError, LaunchSnafu},
    store::RecorderService,
};

/// How `fork` gets a daemon started once it has won the right to.
pub trait Launch {
    /// Start a daemon from `staged`. Returning `Ok` only means the start was
    /// attempted; the caller learns about success through Begun.
    fn launch(&self, staged: &Path) -> Result<(), LaunchError>;
}

/// Runs `<staged> daemon --detach` as an independent process.
#[derive(Debug, Clone)]
pub struct DetachedProcess {
    forwarded: Vec<String>,
}

impl DetachedProcess {
    /// Forward the options that decide which daemon we are talking about and
    /// where it keeps its data.
    #[must_use]
    pub fn new(args: &CommonArgs) -> Self {
        let mut forwarded = vec![
            "--namespace".to_owned(),
            args.namespace.clone(),
            "--port".to_owned(),
            args.port.to_string(),
        ];
        if let Some(dir) = &args.store_dir {
            forwarded.push("--store-dir".to_owned());
            forwarded.push(dir.display().to_string());
        }
        if let Some(path) = &args.log_path {
            forwarded.push("--log-path".to_owned());
            forwarded.push(path.display().to_string());
        }
        Self { forwarded }
    }

    fn command(&self, staged: &Path) -> Command {
        let mut cmd = Command::new(staged);
        cmd.arg("daemon")
            .arg("--detach")
            .args(&self.forwarded)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl Launch for DetachedProcess {
    /// The child double-forks and its first half exits straight away, so
    /// waiting on it is short and leaves no zombie behind.
    #[cfg(unix)]
    fn launch(&self, staged: &Path) -> Result<(), LaunchError> {
        let status = self.command(staged).status().context(LaunchSnafu {
            binary: staged,
        })?;
        if !status.success() {
            return Err(std::io::Error::other(format!(
                "detaching daemon exited with {status}"
            )))
            .context(ForkSnafu);
        }
        info!("launched {}", staged.display());
        Ok(())
    }

    #[cfg(windows)]
    fn launch(&self, staged: &Path) -> Result<(), LaunchError> {
        use std::os::windows::process::CommandExt;

        use windows_sys::Win32::System::Threading::{
            CREATE_NEW_PROCESS_GROUP, DETACHED_PROCESS,
        };

        let child = self
            .command(staged)
            .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP)
            .spawn()
            .context(LaunchSnafu { binary: staged })?;
        info!("launched {} as pid {}", staged.display(), child.id());
        Ok(())
    }
}

/// Debug mode: the daemon runs on a thread of the launching process, which
/// then has to stay alive for as long as the daemon does.
pub struct InProcess<P> {
    platform: P,
    store_dir: PathBuf,
    port: u16,
    options: DaemonOptions,
    handle: Mutex<Option<JoinHandle<Result<(), LaunchError>>>>,
}

impl<P> InProcess<P>
where
    P: Platform + Clone + 'static,
{
    #[must_use]
    pub fn new(
        platform: P,
        options: DaemonOptions,
        store_dir: PathBuf,
        port: u16,
    ) -> Self {
        Self {
            platform,
            store_dir,
            port,
            options,
            handle: Mutex::new(None),
        }
    }

    /// Block until the daemon thread returns. `Ok` if it was never launched.
    pub fn join(&self) -> Result<(), LaunchError> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::other("daemon thread panicked"))
                .context(LaunchSnafu {
                    binary: "in-process",
                }),
        }
    }
}

impl<P> Launch for InProcess<P>
where
    P: Platform + Clone + 'static,
{
    fn launch(&self, staged: &Path) -> Result<(), LaunchError> {
        debug!("ignoring staged {} in process", staged.display());
        let platform = self.platform.clone();
        let options = self.options.clone();
        let store_dir = self.store_dir.clone();
        let port = self.port;

        let handle = thread::Builder::new()
            .name("daemon".into())
            .spawn(move || {
                Daemon::new(&platform, options)
                    .run(|| RecorderService::start(&store_dir, port))
            })
            .context(LaunchSnafu {
                binary: "in-process",
            })?;
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(handle);
        info!("daemon running in process");
        Ok(())
    }
}
