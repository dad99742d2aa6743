//! `fork`: make sure a daemon at least as new as this binary is running.
//!
//! 1. Look for a registered daemon. Wait for its record to be published;
//!    clear it if it never is or if its process is gone.
//! 2. A daemon that is not older than us satisfies the request.
//! 3. An older one is asked to quit and killed if it doesn't.
//! 4. Stage our binary under the cache directory.
//! 5. Create Begun. Whoever creates it launches; everyone else waits for
//!    that launch to publish.
//! 6. Launch, and wait for the daemon to raise Begun.

use std::{
    path::PathBuf,
    thread,
    time::Instant,
};

use snafu::{IntoError, ResultExt};
use strum::Display;
use tracing::{debug, info, warn};
use trace_store_ipc::{
    InstanceRegistry, IpcError, Platform, SignalPair, Version, WaitOutcome,
};

use crate::{
    error::{
        BegunCreateSnafu, BegunExistsSnafu, BegunTimeoutSnafu, IpcSnafu,
        LaunchError, ProcessOpenSnafu,
    },
    killer::{self, KillOutcome, KillTiming},
    launch::Launch,
    settings::Settings,
    staging::Staging,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ForkOutcome {
    /// A daemon at least as new as us was already running.
    AlreadyRunning { version: Version, pid: u32 },
    /// We launched a daemon and it reported begun.
    Launched,
    /// Another launcher was mid-launch; its daemon published in time.
    JoinedPeer { version: Version, pid: u32 },
}

/// What step 1-3 left us with.
enum Arbitration {
    Satisfied(ForkOutcome),
    /// Nobody usable is registered any more.
    Vacant,
}

pub struct Supervisor<'a, P, L> {
    platform: &'a P,
    settings: &'a Settings,
    launcher: &'a L,
}

impl<'a, P: Platform, L: Launch> Supervisor<'a, P, L> {
    #[must_use]
    pub fn new(platform: &'a P, settings: &'a Settings, launcher: &'a L) -> Self {
        Self {
            platform,
            settings,
            launcher,
        }
    }

    fn signals(&self) -> SignalPair<'a, P> {
        SignalPair::new(self.platform)
    }

    fn ours(&self) -> Version {
        self.settings.version
    }

    fn kill_timing(&self) -> KillTiming {
        KillTiming {
            timeout: self.settings.quit_timeout,
            poll_interval: self.settings.poll_interval,
        }
    }

    pub fn fork(&self) -> Result<ForkOutcome, LaunchError> {
        if let Arbitration::Satisfied(outcome) = self.arbitrate()? {
            return Ok(outcome);
        }

        let staged = Staging::new(
            &self.settings.source_exe,
            &self.settings.cache_dir,
            self.ours(),
        )
        .stage()?;

        let begun = match self.signals().create_begun() {
            Ok(begun) => begun,
            Err(e) if e.is_already_exists() => return self.join_peer(),
            Err(e) => return Err(BegunCreateSnafu.into_error(e)),
        };

        let result = self.launch_and_wait(&begun, staged);
        drop(begun);
        if let Err(e) = self.signals().remove_begun() {
            warn!("unable to remove the begun signal: {e}");
        }
        result
    }

    /// Steps 1-3. Returns `Vacant` once no registered daemon stands in the
    /// way of launching ours.
    fn arbitrate(&self) -> Result<Arbitration, LaunchError> {
        let Some(existing) = killer::open_published(self.platform)? else {
            debug!("no daemon registered");
            return Ok(Arbitration::Vacant);
        };

        let (version, pid) = (existing.version(), existing.pid());
        drop(existing);

        if !self.platform.is_alive(pid).context(ProcessOpenSnafu)? {
            warn!("daemon {version} (pid {pid}) is gone; clearing its names");
            killer::clear_leftovers(self.platform, Some(pid));
            return Ok(Arbitration::Vacant);
        }

        if !version.is_older_than(self.ours()) {
            info!("daemon {version} (pid {pid}) already running");
            return Ok(Arbitration::Satisfied(ForkOutcome::AlreadyRunning {
                version,
                pid,
            }));
        }

        info!("evicting daemon {version} (pid {pid}) for {}", self.ours());
        self.evict(pid)?;
        Ok(Arbitration::Vacant)
    }

    /// A missing Quit means it is already on its way out; it still gets the
    /// same deadline and escalation.
    fn evict(&self, pid: u32) -> Result<(), LaunchError> {
        killer::raise_quit(self.platform, pid)?;
        match killer::stop_instance(self.platform, pid, self.kill_timing())? {
            KillOutcome::Killed { .. } => warn!("daemon {pid} had to be killed"),
            outcome => debug!("eviction of {pid}: {outcome}"),
        }
        Ok(())
    }

    fn launch_and_wait(
        &self,
        begun: &P::Signal,
        staged: PathBuf,
    ) -> Result<ForkOutcome, LaunchError> {
        // someone may have finished a launch while we were staging
        if let Arbitration::Satisfied(outcome) = self.arbitrate()? {
            return Ok(outcome);
        }

        // with no daemon registered and Begun held by us, any Quit is stale
        if let Err(e) = self.signals().remove_quit() {
            warn!("unable to remove stale quit signal: {e}");
        }

        self.launcher.launch(&staged)?;

        let timeout = self.settings.begun_timeout;
        match SignalPair::<P>::wait_begun(begun, timeout).context(IpcSnafu {
            what: "unable to wait on the begun signal",
        })? {
            WaitOutcome::Signaled => {
                info!("daemon {} has begun", self.ours());
                Ok(ForkOutcome::Launched)
            }
            WaitOutcome::TimedOut => BegunTimeoutSnafu { timeout }.fail(),
        }
    }

    /// Unlink a Begun whose launch left nothing registered, so the next
    /// attempt gets through. While a segment exists its owner may still be
    /// on the way to raising Begun, and the launcher holding it is left to
    /// clean up.
    fn release_abandoned_begun(&self) -> Result<(), LaunchError> {
        let registered =
            match InstanceRegistry::try_open_existing(self.platform) {
                Ok(existing) => existing.is_some(),
                Err(IpcError::NotPublished) => true,
                Err(source) => {
                    return Err(IpcSnafu {
                        what: "unable to open the instance segment",
                    }
                    .into_error(source));
                }
            };
        if registered {
            debug!("a daemon is registering; leaving begun to its launcher");
            return Ok(());
        }

        warn!("begun signal looks abandoned; removing it");
        if let Err(e) = self.signals().remove_begun() {
            warn!("unable to remove the begun signal: {e}");
        }
        Ok(())
    }

    /// Begun already exists: another launcher is mid-launch. Its daemon
    /// publishing in time is as good as ours doing so.
    fn join_peer(&self) -> Result<ForkOutcome, LaunchError> {
        info!("another launcher is starting the daemon; waiting for it");
        let deadline = Instant::now() + self.settings.begun_timeout;
        loop {
            if let Some(registry) =
                InstanceRegistry::try_open_existing(self.platform).context(
                    IpcSnafu {
                        what: "unable to open the instance segment",
                    },
                )?
                && registry.wait_for_ready().is_ok()
                && !registry.is_older(self.ours())
            {
                return Ok(ForkOutcome::JoinedPeer {
                    version: registry.version(),
                    pid: registry.pid(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                self.release_abandoned_begun()?;
                return BegunExistsSnafu.fail();
            }
            thread::sleep(self.settings.poll_interval.min(deadline - now));
        }
    }
}
