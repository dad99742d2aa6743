//! Stopping a running daemon: ask through Quit, wait, and escalate to a
//! forced kill. `kill` uses it directly and `fork` uses it to evict an older
//! daemon.

use std::{
    thread,
    time::{Duration, Instant},
};

use snafu::{IntoError, ResultExt};
use strum::Display;
use tracing::{debug, info, warn};
use trace_store_ipc::{InstanceRegistry, IpcError, Platform, SignalPair};

use crate::error::{
    IpcSnafu, LaunchError, NoQuitEventSnafu, ProcessOpenSnafu,
};

#[derive(Debug, Clone, Copy)]
pub struct KillTiming {
    /// How long the daemon gets to honour Quit.
    pub timeout: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum KillOutcome {
    /// No daemon was registered, or its record was abandoned mid-publish.
    NotRunning,
    /// It exited on its own after Quit.
    Stopped { pid: u32 },
    /// It ignored Quit and was terminated.
    Killed { pid: u32 },
}

/// The `kill` verb: stop whatever daemon is registered.
pub fn kill<P: Platform>(
    platform: &P,
    timing: KillTiming,
) -> Result<KillOutcome, LaunchError> {
    let Some(registry) = open_published(platform)? else {
        info!("no daemon is running");
        return Ok(KillOutcome::NotRunning);
    };
    let pid = registry.pid();
    info!("stopping daemon {} (pid {pid})", registry.version());
    drop(registry);

    if !raise_quit(platform, pid)? {
        return NoQuitEventSnafu.fail();
    }
    stop_instance(platform, pid, timing)
}

/// Open the registered daemon's record once it is published.
///
/// A segment that never reaches its full size or whose record is never
/// published was abandoned by a daemon that died while registering; its
/// names are cleared and `None` is returned as if nothing was registered.
pub(crate) fn open_published<P: Platform>(
    platform: &P,
) -> Result<Option<InstanceRegistry<P::Segment>>, LaunchError> {
    let registry = match InstanceRegistry::try_open_existing(platform) {
        Ok(Some(registry)) => registry,
        Ok(None) => return Ok(None),
        Err(IpcError::NotPublished) => {
            warn!("instance segment never reached its full size; clearing it");
            clear_leftovers(platform, None);
            return Ok(None);
        }
        Err(source) => {
            return Err(IpcSnafu {
                what: "unable to open the instance segment",
            }
            .into_error(source));
        }
    };

    match registry.wait_for_ready() {
        Ok(()) => Ok(Some(registry)),
        Err(IpcError::NotPublished) => {
            warn!("instance segment was never published; clearing it");
            drop(registry);
            clear_leftovers(platform, None);
            Ok(None)
        }
        Err(source) => Err(IpcSnafu {
            what: "unable to read the instance segment",
        }
        .into_error(source)),
    }
}

/// Raise Quit by name. `false` (logged) when the daemon no longer has one.
pub(crate) fn raise_quit<P: Platform>(
    platform: &P,
    pid: u32,
) -> Result<bool, LaunchError> {
    let raised = SignalPair::new(platform).raise_quit().context(IpcSnafu {
        what: "unable to raise the quit signal",
    })?;
    if raised {
        debug!("raised quit for {pid}");
    } else {
        warn!("daemon {pid} has no quit signal; someone already closed it");
    }
    Ok(raised)
}

/// Give `pid` `timing.timeout` to exit, then terminate it and clear the
/// names it left behind.
pub(crate) fn stop_instance<P: Platform>(
    platform: &P,
    pid: u32,
    timing: KillTiming,
) -> Result<KillOutcome, LaunchError> {
    if wait_for_exit(platform, pid, timing)? {
        info!("daemon {pid} exited");
        return Ok(KillOutcome::Stopped { pid });
    }

    warn!(
        "daemon {pid} still alive after {:?}; terminating it",
        timing.timeout
    );
    platform.terminate(pid).context(ProcessOpenSnafu)?;
    clear_leftovers(platform, Some(pid));
    Ok(KillOutcome::Killed { pid })
}

/// Poll liveness until `pid` is gone (true) or the timeout runs out (false).
pub(crate) fn wait_for_exit<P: Platform>(
    platform: &P,
    pid: u32,
    timing: KillTiming,
) -> Result<bool, LaunchError> {
    let deadline = Instant::now() + timing.timeout;
    loop {
        if !platform.is_alive(pid).context(ProcessOpenSnafu)? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        thread::sleep(timing.poll_interval.min(deadline - now));
    }
}

/// Unlink the segment and Quit of a daemon that can no longer do it itself.
///
/// With `Some(pid)` the names are only removed while the segment still
/// belongs to that pid, so a successor that registered in the meantime is
/// left alone. `None` means the record was never published, which includes
/// a segment too short to hold one.
pub(crate) fn clear_leftovers<P: Platform>(platform: &P, owner: Option<u32>) {
    let still_ours = match InstanceRegistry::try_open_existing(platform) {
        Ok(Some(registry)) => {
            let info = registry.info();
            match owner {
                Some(pid) => info.is_published() && info.pid() == pid,
                None => !info.is_published(),
            }
        }
        Ok(None) => false,
        Err(IpcError::NotPublished) => owner.is_none(),
        Err(e) => {
            warn!("unable to inspect leftover segment: {e}");
            false
        }
    };
    if !still_ours {
        debug!("nothing to clear");
        return;
    }

    if let Err(e) = SignalPair::new(platform).remove_quit() {
        warn!("unable to remove leftover quit signal: {e}");
    }
    if let Err(e) = InstanceRegistry::remove(platform) {
        warn!("unable to remove leftover instance segment: {e}");
    }
    info!("cleared names left behind by {owner:?}");
}

#[cfg(test)]
mod tests {
    use trace_store_ipc::{InstanceSlot, Version, mem::MemPlatform};

    use super::*;
    use crate::exit_code::ExitCode;

    const FAST: KillTiming = KillTiming {
        timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(5),
    };

    #[test]
    fn nothing_registered_is_a_no_op() {
        let platform = MemPlatform::new("kill-none");
        assert_eq!(kill(&platform, FAST).unwrap(), KillOutcome::NotRunning);
        assert_eq!(platform.process_ops(), 0);
    }

    #[test]
    fn missing_quit_is_reported() {
        let platform = MemPlatform::new("kill-noquit");
        let pid = platform.spawn_process();
        let _registry = InstanceSlot::create(&platform)
            .unwrap()
            .publish(Version::new(1, 0), pid);
        let err = kill(&platform, FAST).unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::NoQuitEvent);
        assert_eq!(platform.live_processes(), vec![pid]);
    }

    #[test]
    fn unpublished_segment_is_cleared() {
        let platform = MemPlatform::new("kill-unpublished");
        let slot = InstanceSlot::create(&platform).unwrap();
        assert_eq!(kill(&platform, FAST).unwrap(), KillOutcome::NotRunning);
        assert!(!platform.segment_exists());
        drop(slot);
    }

    #[test]
    fn leftovers_of_a_successor_are_kept() {
        let platform = MemPlatform::new("kill-successor");
        let _registry = InstanceSlot::create(&platform)
            .unwrap()
            .publish(Version::new(1, 0), 9);
        clear_leftovers(&platform, Some(8));
        assert!(platform.segment_exists());
        clear_leftovers(&platform, Some(9));
        assert!(!platform.segment_exists());
    }
}
