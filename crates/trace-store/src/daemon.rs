//! The long-lived singleton. It claims the machine-wide names, publishes
//! itself, hosts the store service and then sleeps on Quit until someone
//! wants it gone.

use std::path::PathBuf;

use snafu::{IntoError, ResultExt};
use strum::Display;
use tracing::{debug, error, info, warn};
use trace_store_ipc::{
    InstanceRegistry, InstanceSlot, IpcError, Platform, SignalPair, Version,
};

use crate::{
    error::{
        IpcSnafu, LaunchError, QuitCreateSnafu, QuitExistsSnafu,
        SharedMemSnafu, SharedMemTruncSnafu,
    },
    indicator::{InstanceStatus, LivenessIndicator},
    store::StoreService,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DaemonState {
    Uninitialized,
    Registering,
    Publishing,
    Running,
    Quitting,
    TornDown,
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub version: Version,
    pub pid: u32,
    /// Where `instance.json` goes; `None` skips it.
    pub indicator_dir: Option<PathBuf>,
}

struct Registered<S, Q> {
    slot: InstanceSlot<S>,
    quit: Q,
}

struct Running<S, Q, T> {
    _registry: InstanceRegistry<S>,
    quit: Q,
    store: T,
    indicator: Option<LivenessIndicator>,
}

pub struct Daemon<'p, P> {
    platform: &'p P,
    options: DaemonOptions,
    state: DaemonState,
}

impl<'p, P: Platform> Daemon<'p, P> {
    #[must_use]
    pub fn new(platform: &'p P, options: DaemonOptions) -> Self {
        Self {
            platform,
            options,
            state: DaemonState::Uninitialized,
        }
    }

    fn transition(&mut self, next: DaemonState) {
        info!(from = %self.state, to = %next, "daemon state");
        self.state = next;
    }

    /// Run the whole lifecycle and return once Quit has been honoured and
    /// everything is torn down. `start_store` runs after publication; if it
    /// fails the names are released again and its error is returned.
    pub fn run<T, F>(mut self, start_store: F) -> Result<(), LaunchError>
    where
        T: StoreService,
        F: FnOnce() -> Result<T, LaunchError>,
    {
        let registered = self.register()?;
        let running = match self.start(registered, start_store) {
            Ok(running) => running,
            Err(e) => {
                error!("daemon failed to start: {e}");
                self.release_names();
                self.transition(DaemonState::TornDown);
                return Err(e);
            }
        };

        info!(
            "daemon {} (pid {}) running, waiting for quit",
            self.options.version, self.options.pid
        );
        if let Err(e) = SignalPair::<P>::wait_quit(&running.quit) {
            // nothing left to wait on; tear down rather than spin
            error!("waiting on quit failed: {e}");
        }

        self.tear_down(running);
        Ok(())
    }

    fn register(
        &mut self,
    ) -> Result<Registered<P::Segment, P::Signal>, LaunchError> {
        self.transition(DaemonState::Registering);

        let slot = InstanceSlot::create(self.platform).map_err(|e| match e {
            e @ IpcError::Truncate { .. } => SharedMemTruncSnafu.into_error(e),
            e => SharedMemSnafu.into_error(e),
        })?;
        debug!("claimed {}", self.platform.names().segment);

        let quit = match SignalPair::new(self.platform).create_quit() {
            Ok(quit) => quit,
            Err(e) => {
                // the segment is ours; don't leave it behind unpublished
                drop(slot);
                let _ = InstanceRegistry::remove(self.platform);
                self.transition(DaemonState::TornDown);
                return Err(if e.is_already_exists() {
                    QuitExistsSnafu.build()
                } else {
                    QuitCreateSnafu.into_error(e)
                });
            }
        };
        Ok(Registered { slot, quit })
    }

    fn start<T, F>(
        &mut self,
        registered: Registered<P::Segment, P::Signal>,
        start_store: F,
    ) -> Result<Running<P::Segment, P::Signal, T>, LaunchError>
    where
        T: StoreService,
        F: FnOnce() -> Result<T, LaunchError>,
    {
        self.transition(DaemonState::Publishing);
        let Registered { slot, quit } = registered;
        let registry = slot.publish(self.options.version, self.options.pid);

        let store = start_store()?;
        self.transition(DaemonState::Running);

        let indicator = self.options.indicator_dir.as_deref().and_then(|dir| {
            let status = InstanceStatus::now(
                self.options.version,
                self.options.pid,
                store.port(),
            );
            LivenessIndicator::show(dir, &status)
                .inspect_err(|e| warn!("unable to write instance.json: {e}"))
                .ok()
        });

        if let Err(e) = self.raise_begun() {
            drop(indicator);
            store.stop();
            return Err(e);
        }

        Ok(Running {
            _registry: registry,
            quit,
            store,
            indicator,
        })
    }

    /// Tell whoever launched us that we are up. Nobody waiting is fine.
    fn raise_begun(&self) -> Result<(), LaunchError> {
        let raised = SignalPair::new(self.platform).raise_begun().context(
            IpcSnafu {
                what: "unable to raise the begun signal",
            },
        )?;
        if raised {
            debug!("raised begun");
        } else {
            debug!("nobody is waiting for begun");
        }
        Ok(())
    }

    fn tear_down<T: StoreService>(
        &mut self,
        running: Running<P::Segment, P::Signal, T>,
    ) {
        self.transition(DaemonState::Quitting);
        let Running {
            _registry: registry,
            quit,
            store,
            indicator,
        } = running;

        drop(indicator);
        store.stop();
        drop(quit);
        drop(registry);
        self.release_names();
        self.transition(DaemonState::TornDown);
    }

    /// Quit goes first: a killer that still finds the segment but no Quit
    /// treats the daemon as already on its way out.
    fn release_names(&self) {
        if let Err(e) = SignalPair::new(self.platform).remove_quit() {
            warn!("unable to remove the quit signal: {e}");
        }
        if let Err(e) = InstanceRegistry::remove(self.platform) {
            warn!("unable to remove the instance segment: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::Duration,
    };

    use trace_store_ipc::{
        EventKind, ObjectNames, Signal, WaitOutcome,
        mem::{MemPlatform, MemSegment, MemSignal},
    };

    use super::*;
    use crate::exit_code::ExitCode;

    struct FlagStore(Arc<AtomicBool>);

    impl StoreService for FlagStore {
        fn port(&self) -> u16 {
            0
        }

        fn stop(self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn options(pid: u32) -> DaemonOptions {
        DaemonOptions {
            version: Version::new(1, 0),
            pid,
            indicator_dir: None,
        }
    }

    #[test]
    fn publishes_raises_begun_and_cleans_up_on_quit() {
        let platform = MemPlatform::new("daemon-unit");
        let begun = platform.create_signal(EventKind::Begun).unwrap();
        let stopped = Arc::new(AtomicBool::new(false));

        let daemon_platform = platform.clone();
        let flag = Arc::clone(&stopped);
        let daemon = thread::spawn(move || {
            Daemon::new(&daemon_platform, options(77))
                .run(|| Ok(FlagStore(flag)))
        });

        assert_eq!(
            begun.wait(Some(Duration::from_secs(5))).unwrap(),
            WaitOutcome::Signaled
        );
        let registry = InstanceRegistry::try_open_existing(&platform)
            .unwrap()
            .unwrap();
        registry.wait_for_ready().unwrap();
        assert_eq!(registry.pid(), 77);
        drop(registry);

        platform
            .open_signal(EventKind::Quit)
            .unwrap()
            .unwrap()
            .raise()
            .unwrap();
        daemon.join().unwrap().unwrap();

        assert!(stopped.load(Ordering::SeqCst));
        assert!(!platform.segment_exists());
        assert!(!platform.signal_exists(EventKind::Quit));
    }

    #[test]
    fn second_daemon_cannot_claim_the_segment() {
        let platform = MemPlatform::new("daemon-twice");
        let _held = platform.create_segment().unwrap();
        let err = Daemon::new(&platform, options(1))
            .run(|| Ok(FlagStore(Arc::default())))
            .unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::SharedMemFail);
    }

    #[test]
    fn stale_quit_refuses_startup_and_releases_segment() {
        let platform = MemPlatform::new("daemon-quit");
        let _stale = platform.create_signal(EventKind::Quit).unwrap();
        let err = Daemon::new(&platform, options(1))
            .run(|| Ok(FlagStore(Arc::default())))
            .unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::QuitExists);
        assert!(!platform.segment_exists());
    }

    /// Opening Begun by name always fails.
    #[derive(Clone)]
    struct BrokenBegun(MemPlatform);

    impl Platform for BrokenBegun {
        type Segment = MemSegment;
        type Signal = MemSignal;

        fn names(&self) -> &ObjectNames {
            self.0.names()
        }

        fn create_segment(&self) -> Result<MemSegment, IpcError> {
            self.0.create_segment()
        }

        fn open_segment(&self) -> Result<Option<MemSegment>, IpcError> {
            self.0.open_segment()
        }

        fn remove_segment(&self) -> Result<(), IpcError> {
            self.0.remove_segment()
        }

        fn create_signal(
            &self,
            kind: EventKind,
        ) -> Result<MemSignal, IpcError> {
            self.0.create_signal(kind)
        }

        fn open_signal(
            &self,
            kind: EventKind,
        ) -> Result<Option<MemSignal>, IpcError> {
            match kind {
                EventKind::Begun => Err(IpcError::Open {
                    name: self.names().event(kind).to_owned(),
                    source: io::Error::other("denied"),
                }),
                EventKind::Quit => self.0.open_signal(kind),
            }
        }

        fn remove_signal(&self, kind: EventKind) -> Result<(), IpcError> {
            self.0.remove_signal(kind)
        }

        fn is_alive(&self, pid: u32) -> Result<bool, IpcError> {
            self.0.is_alive(pid)
        }

        fn terminate(&self, pid: u32) -> Result<(), IpcError> {
            self.0.terminate(pid)
        }
    }

    #[test]
    fn failed_begun_stops_store_and_releases_names() {
        let mem = MemPlatform::new("daemon-begun");
        let platform = BrokenBegun(mem.clone());
        let stopped = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&stopped);
        let err = Daemon::new(&platform, options(1))
            .run(|| Ok(FlagStore(flag)))
            .unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::UnexpectedError);
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!mem.segment_exists());
        assert!(!mem.signal_exists(EventKind::Quit));
    }

    #[test]
    fn failed_store_releases_names() {
        let platform = MemPlatform::new("daemon-store");
        let err = Daemon::new(&platform, options(1))
            .run(|| -> Result<FlagStore, LaunchError> {
                Err(LaunchError::SelfCheck {
                    message: "no store".into(),
                })
            })
            .unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::UnexpectedError);
        assert!(!platform.segment_exists());
        assert!(!platform.signal_exists(EventKind::Quit));
    }
}
