use std::{
    fs,
    path::Path,
    sync::{
        Barrier, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tempfile::TempDir;
use trace_store::{
    daemon::{Daemon, DaemonOptions},
    error::LaunchError,
    exit_code::ExitCode,
    killer::{KillOutcome, KillTiming, kill},
    launch::Launch,
    settings::Settings,
    staging::Staging,
    store::StoreService,
    supervisor::{ForkOutcome, Supervisor},
};
use trace_store_ipc::{
    EventKind, InstanceRegistry, InstanceSlot, Platform, Version,
    mem::MemPlatform,
};

const V1: Version = Version::new(1, 0);
const V2: Version = Version::new(1, 1);

struct NullStore;

impl StoreService for NullStore {
    fn port(&self) -> u16 {
        0
    }

    fn stop(self) {}
}

/// Runs each launched daemon on a thread posing as its own process.
struct ThreadLauncher {
    platform: MemPlatform,
    version: Version,
    launches: AtomicUsize,
    daemons: Mutex<Vec<JoinHandle<Result<(), LaunchError>>>>,
}

impl ThreadLauncher {
    fn new(platform: &MemPlatform, version: Version) -> Self {
        Self {
            platform: platform.clone(),
            version,
            launches: AtomicUsize::new(0),
            daemons: Mutex::new(Vec::new()),
        }
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn join(&self) {
        for daemon in self.daemons.lock().unwrap().drain(..) {
            daemon.join().unwrap().unwrap();
        }
    }
}

impl Launch for ThreadLauncher {
    fn launch(&self, staged: &Path) -> Result<(), LaunchError> {
        assert!(staged.is_file(), "launching an unstaged binary");
        self.launches.fetch_add(1, Ordering::SeqCst);

        let platform = self.platform.clone();
        let pid = platform.spawn_process();
        let options = DaemonOptions {
            version: self.version,
            pid,
            indicator_dir: None,
        };
        let handle = thread::spawn(move || {
            let result = Daemon::new(&platform, options).run(|| Ok(NullStore));
            platform.exit_process(pid);
            result
        });
        self.daemons.lock().unwrap().push(handle);
        Ok(())
    }
}

/// A launch that never produces a daemon.
struct DudLauncher;

impl Launch for DudLauncher {
    fn launch(&self, _staged: &Path) -> Result<(), LaunchError> {
        Ok(())
    }
}

fn settings(dir: &TempDir, version: Version) -> Settings {
    let _ = color_eyre::install();
    let source_exe = dir.path().join("trace-store");
    if !source_exe.exists() {
        fs::write(&source_exe, b"not really a binary").unwrap();
    }
    Settings {
        namespace: "lifecycle".into(),
        version,
        source_exe,
        cache_dir: dir.path().join("cache"),
        store_dir: dir.path().join("store"),
        port: 0,
        begun_timeout: Duration::from_secs(5),
        quit_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(5),
    }
}

fn timing(settings: &Settings) -> KillTiming {
    KillTiming {
        timeout: settings.quit_timeout,
        poll_interval: settings.poll_interval,
    }
}

fn registered(platform: &MemPlatform) -> eyre::Result<(Version, u32)> {
    let registry = InstanceRegistry::try_open_existing(platform)?
        .ok_or_else(|| eyre::eyre!("no daemon registered"))?;
    registry.wait_for_ready()?;
    Ok((registry.version(), registry.pid()))
}

#[test]
fn fork_is_idempotent() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings(&dir, V1);
    let platform = MemPlatform::new("idempotent");
    let launcher = ThreadLauncher::new(&platform, V1);
    let supervisor = Supervisor::new(&platform, &settings, &launcher);

    assert_eq!(supervisor.fork()?, ForkOutcome::Launched);
    let (version, pid) = registered(&platform)?;
    assert_eq!(version, V1);

    for _ in 0..3 {
        assert_eq!(
            supervisor.fork()?,
            ForkOutcome::AlreadyRunning { version: V1, pid }
        );
    }
    assert_eq!(launcher.launches(), 1);
    assert_eq!(platform.live_processes(), vec![pid]);
    assert!(!platform.signal_exists(EventKind::Begun));

    assert_eq!(kill(&platform, timing(&settings))?, KillOutcome::Stopped {
        pid
    });
    launcher.join();
    Ok(())
}

#[test]
fn newer_binary_replaces_older_daemon() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = MemPlatform::new("upgrade");
    let old_settings = settings(&dir, V1);
    let new_settings = settings(&dir, V2);
    let old = ThreadLauncher::new(&platform, V1);
    let new = ThreadLauncher::new(&platform, V2);

    Supervisor::new(&platform, &old_settings, &old).fork()?;
    let (_, old_pid) = registered(&platform)?;

    assert_eq!(
        Supervisor::new(&platform, &new_settings, &new).fork()?,
        ForkOutcome::Launched
    );
    // the old daemon honoured quit and cleaned up after itself
    old.join();
    let (version, new_pid) = registered(&platform)?;
    assert_eq!(version, V2);
    assert_ne!(new_pid, old_pid);
    assert!(platform.terminated().is_empty());
    assert_eq!(platform.live_processes(), vec![new_pid]);

    kill(&platform, timing(&new_settings))?;
    new.join();
    Ok(())
}

#[test]
fn older_or_same_version_leaves_daemon_alone() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = MemPlatform::new("downgrade");
    let new_settings = settings(&dir, V2);
    let launcher = ThreadLauncher::new(&platform, V2);
    Supervisor::new(&platform, &new_settings, &launcher).fork()?;
    let (_, pid) = registered(&platform)?;

    let older = settings(&dir, V1);
    assert_eq!(
        Supervisor::new(&platform, &older, &DudLauncher).fork()?,
        ForkOutcome::AlreadyRunning { version: V2, pid }
    );

    // a debug build of the same version does not evict a release build
    let debug = settings(&dir, V2.with_debug());
    assert_eq!(
        Supervisor::new(&platform, &debug, &DudLauncher).fork()?,
        ForkOutcome::AlreadyRunning { version: V2, pid }
    );
    assert_eq!(launcher.launches(), 1);
    assert_eq!(platform.live_processes(), vec![pid]);

    kill(&platform, timing(&new_settings))?;
    launcher.join();
    Ok(())
}

#[test]
fn kill_stops_running_daemon() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings(&dir, V1);
    let platform = MemPlatform::new("kill");
    let launcher = ThreadLauncher::new(&platform, V1);
    Supervisor::new(&platform, &settings, &launcher).fork()?;
    let (_, pid) = registered(&platform)?;

    assert_eq!(kill(&platform, timing(&settings))?, KillOutcome::Stopped {
        pid
    });
    launcher.join();
    assert!(!platform.segment_exists());
    assert!(!platform.signal_exists(EventKind::Quit));
    assert!(platform.live_processes().is_empty());

    // nothing left: a second kill is a no-op
    assert_eq!(
        kill(&platform, timing(&settings))?,
        KillOutcome::NotRunning
    );
    Ok(())
}

#[test]
fn kill_without_daemon_touches_no_process() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings(&dir, V1);
    let platform = MemPlatform::new("kill-empty");
    assert_eq!(
        kill(&platform, timing(&settings))?,
        KillOutcome::NotRunning
    );
    assert_eq!(platform.process_ops(), 0);
    Ok(())
}

/// Registered and holding Quit, but never waiting on it.
fn unresponsive_daemon(platform: &MemPlatform, version: Version) -> u32 {
    let pid = platform.spawn_process();
    let registry = InstanceSlot::create(platform).unwrap().publish(version, pid);
    let quit = platform.create_signal(EventKind::Quit).unwrap();
    // a stuck process keeps its handles; the names outlive them anyway
    drop((registry, quit));
    pid
}

#[test]
fn kill_escalates_for_unresponsive_daemon() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut settings = settings(&dir, V1);
    settings.quit_timeout = Duration::from_millis(50);
    let platform = MemPlatform::new("kill-stuck");
    let pid = unresponsive_daemon(&platform, V1);

    assert_eq!(kill(&platform, timing(&settings))?, KillOutcome::Killed {
        pid
    });
    assert_eq!(platform.terminated(), vec![pid]);
    assert!(!platform.segment_exists());
    assert!(!platform.signal_exists(EventKind::Quit));
    Ok(())
}

#[test]
fn eviction_escalates_for_unresponsive_daemon() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut settings = settings(&dir, V2);
    settings.quit_timeout = Duration::from_millis(50);
    let platform = MemPlatform::new("evict-stuck");
    let stuck = unresponsive_daemon(&platform, V1);
    let launcher = ThreadLauncher::new(&platform, V2);

    assert_eq!(
        Supervisor::new(&platform, &settings, &launcher).fork()?,
        ForkOutcome::Launched
    );
    assert_eq!(platform.terminated(), vec![stuck]);
    assert_eq!(registered(&platform)?.0, V2);

    settings.quit_timeout = Duration::from_secs(2);
    kill(&platform, timing(&settings))?;
    launcher.join();
    Ok(())
}

#[test]
fn eviction_without_quit_still_replaces_older_daemon() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut settings = settings(&dir, V2);
    settings.quit_timeout = Duration::from_millis(50);
    let platform = MemPlatform::new("evict-noquit");
    // registered but already past removing its Quit
    let old = platform.spawn_process();
    drop(InstanceSlot::create(&platform)?.publish(V1, old));
    let launcher = ThreadLauncher::new(&platform, V2);

    assert_eq!(
        Supervisor::new(&platform, &settings, &launcher).fork()?,
        ForkOutcome::Launched
    );
    assert_eq!(platform.terminated(), vec![old]);
    assert_eq!(launcher.launches(), 1);
    assert_eq!(registered(&platform)?.0, V2);

    settings.quit_timeout = Duration::from_secs(2);
    kill(&platform, timing(&settings))?;
    launcher.join();
    Ok(())
}

#[test]
fn concurrent_forks_start_one_daemon() -> eyre::Result<()> {
    const RACERS: usize = 8;

    let dir = tempfile::tempdir()?;
    let settings = settings(&dir, V1);
    let platform = MemPlatform::new("race");
    let launcher = ThreadLauncher::new(&platform, V1);
    let barrier = Barrier::new(RACERS);

    let outcomes: Vec<_> = thread::scope(|s| {
        let racers: Vec<_> = (0..RACERS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    Supervisor::new(&platform, &settings, &launcher).fork()
                })
            })
            .collect();
        racers.into_iter().map(|r| r.join().unwrap()).collect()
    });

    for outcome in &outcomes {
        assert!(outcome.is_ok(), "fork failed: {outcome:?}");
    }
    assert_eq!(launcher.launches(), 1);
    assert_eq!(platform.live_processes().len(), 1);
    assert!(!platform.signal_exists(EventKind::Begun));

    kill(&platform, timing(&settings))?;
    launcher.join();
    Ok(())
}

#[test]
fn daemon_that_never_begins_times_out() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut settings = settings(&dir, V1);
    settings.begun_timeout = Duration::from_millis(50);
    let platform = MemPlatform::new("dud");

    let err = Supervisor::new(&platform, &settings, &DudLauncher)
        .fork()
        .unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::BegunTimeout);
    assert!(!platform.signal_exists(EventKind::Begun));
    Ok(())
}

#[test]
fn abandoned_begun_is_reported_then_cleared() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut settings = settings(&dir, V1);
    settings.begun_timeout = Duration::from_millis(50);
    let platform = MemPlatform::new("stale-begun");
    drop(platform.create_signal(EventKind::Begun)?);
    let launcher = ThreadLauncher::new(&platform, V1);

    let err = Supervisor::new(&platform, &settings, &launcher)
        .fork()
        .unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::BegunExists);
    assert_eq!(launcher.launches(), 0);

    settings.begun_timeout = Duration::from_secs(5);
    assert_eq!(
        Supervisor::new(&platform, &settings, &launcher).fork()?,
        ForkOutcome::Launched
    );
    kill(&platform, timing(&settings))?;
    launcher.join();
    Ok(())
}

#[test]
fn begun_of_a_registering_daemon_is_kept() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut settings = settings(&dir, V1);
    settings.begun_timeout = Duration::from_millis(300);
    let platform = MemPlatform::new("peer-registering");
    // a peer launcher holds Begun; its daemon registers once we are past
    // arbitration and staging
    drop(platform.create_signal(EventKind::Begun)?);
    let staged =
        Staging::new(&settings.source_exe, &settings.cache_dir, V1).target();

    let slot = thread::scope(|s| {
        let peer = s.spawn(|| {
            while !staged.exists() {
                thread::sleep(Duration::from_millis(1));
            }
            InstanceSlot::create(&platform)
        });
        let err = Supervisor::new(&platform, &settings, &DudLauncher)
            .fork()
            .unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::BegunExists);
        peer.join().unwrap()
    })?;
    assert!(platform.signal_exists(EventKind::Begun));

    let pid = platform.spawn_process();
    let _registry = slot.publish(V1, pid);
    assert_eq!(
        Supervisor::new(&platform, &settings, &DudLauncher).fork()?,
        ForkOutcome::AlreadyRunning { version: V1, pid }
    );
    Ok(())
}

#[test]
fn dead_daemon_is_replaced() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings(&dir, V2);
    let platform = MemPlatform::new("dead");
    // a newer daemon that crashed without tearing down
    let crashed = unresponsive_daemon(&platform, Version::new(9, 0));
    platform.exit_process(crashed);
    let launcher = ThreadLauncher::new(&platform, V2);

    assert_eq!(
        Supervisor::new(&platform, &settings, &launcher).fork()?,
        ForkOutcome::Launched
    );
    let (version, pid) = registered(&platform)?;
    assert_eq!(version, V2);
    assert_ne!(pid, crashed);
    assert!(platform.terminated().is_empty());

    kill(&platform, timing(&settings))?;
    launcher.join();
    Ok(())
}

#[test]
fn stale_quit_without_daemon_is_cleared() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings(&dir, V1);
    let platform = MemPlatform::new("stale-quit");
    drop(platform.create_signal(EventKind::Quit)?);
    let launcher = ThreadLauncher::new(&platform, V1);

    assert_eq!(
        Supervisor::new(&platform, &settings, &launcher).fork()?,
        ForkOutcome::Launched
    );
    kill(&platform, timing(&settings))?;
    launcher.join();
    Ok(())
}
