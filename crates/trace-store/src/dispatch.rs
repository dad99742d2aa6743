use tracing::{debug, error, info, warn};
use trace_store_ipc::{SignalPair, sys::SystemPlatform};

use crate::{
    cli::{Args, Verb},
    daemon::{Daemon, DaemonOptions},
    error::LaunchError,
    exit_code::ExitCode,
    indicator::{INDICATOR_FILE, LivenessIndicator},
    killer::{self, KillTiming},
    launch::{DetachedProcess, InProcess},
    self_check,
    settings::Settings,
    store::RecorderService,
    supervisor::{ForkOutcome, Supervisor},
};

/// Run the requested verb and map the result onto an exit code.
pub fn dispatch(args: &Args) -> ExitCode {
    let verb = args.verb();
    let result = Settings::from_args(&args.common)
        .and_then(|settings| run_verb(&verb, args, &settings));

    let code = match result {
        Ok(()) => ExitCode::Ok,
        Err(e) => {
            error!("{verb:?} failed: {e}");
            e.exit_code()
        }
    };
    if code.is_ok() {
        info!("exiting with {code}");
    } else {
        warn!("exiting with {code} ({})", u8::from(code));
    }
    code
}

fn run_verb(
    verb: &Verb,
    args: &Args,
    settings: &Settings,
) -> Result<(), LaunchError> {
    let platform = SystemPlatform::new(&settings.namespace);
    match verb {
        Verb::Fork { in_process: false } => {
            let launcher = DetachedProcess::new(&args.common);
            let outcome =
                Supervisor::new(&platform, settings, &launcher).fork()?;
            info!("fork: {outcome:?}");
            log_instance_status(settings);
            Ok(())
        }
        Verb::Fork { in_process: true } => fork_in_process(platform, settings),
        Verb::Daemon { .. } => run_daemon(&platform, settings),
        Verb::Kill => {
            let outcome = killer::kill(
                &platform,
                KillTiming {
                    timeout: settings.quit_timeout,
                    poll_interval: settings.poll_interval,
                },
            )?;
            info!("kill: {outcome}");
            Ok(())
        }
        Verb::Test => self_check::run(&settings.namespace),
    }
}

fn fork_in_process(
    platform: SystemPlatform,
    settings: &Settings,
) -> Result<(), LaunchError> {
    raise_quit_on_ctrlc(&settings.namespace);
    let launcher = InProcess::new(
        platform.clone(),
        daemon_options(settings),
        settings.store_dir.clone(),
        settings.port,
    );
    let outcome = Supervisor::new(&platform, settings, &launcher).fork()?;
    info!("fork: {outcome:?}");
    log_instance_status(settings);
    if outcome == ForkOutcome::Launched {
        info!("staying in the foreground until the daemon quits");
        launcher.join()?;
    }
    Ok(())
}

fn run_daemon(
    platform: &SystemPlatform,
    settings: &Settings,
) -> Result<(), LaunchError> {
    raise_quit_on_ctrlc(&settings.namespace);
    let store_dir = settings.store_dir.as_path();
    Daemon::new(platform, daemon_options(settings))
        .run(|| RecorderService::start(store_dir, settings.port))
}

/// Where the running daemon's store can be reached, as it reported it.
fn log_instance_status(settings: &Settings) {
    match LivenessIndicator::read(&settings.store_dir) {
        Ok(Some(status)) => info!(
            "trace store {} (pid {}) listening on port {}",
            status.version, status.pid, status.port
        ),
        Ok(None) => debug!(
            "no {INDICATOR_FILE} in {}",
            settings.store_dir.display()
        ),
        Err(e) => warn!("unable to read {INDICATOR_FILE}: {e}"),
    }
}

fn daemon_options(settings: &Settings) -> DaemonOptions {
    DaemonOptions {
        version: settings.version,
        pid: std::process::id(),
        indicator_dir: Some(settings.store_dir.clone()),
    }
}

/// Interrupting a foreground daemon goes through Quit like everything else,
/// so it still tears down.
fn raise_quit_on_ctrlc(namespace: &str) {
    let platform = SystemPlatform::new(namespace);
    let installed = ctrlc::set_handler(move || {
        match SignalPair::new(&platform).raise_quit() {
            Ok(true) => {}
            // nothing to tear down yet
            Ok(false) => {
                warn!("interrupted before quit existed");
                std::process::exit(u8::from(ExitCode::UnexpectedError).into());
            }
            Err(e) => error!("unable to raise quit: {e}"),
        }
    });
    if let Err(e) = installed {
        warn!("unable to install interrupt handler: {e}");
    }
}
