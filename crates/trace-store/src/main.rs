use clap::Parser;
use mimalloc::MiMalloc;
use trace_store::{
    cli::Args, dispatch::dispatch, exit_code::ExitCode,
    tracing_init::init_tracing,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> std::process::ExitCode {
    let args = Args::parse();

    // detach before anything spawns a thread
    #[cfg(unix)]
    if matches!(args.verb(), trace_store::cli::Verb::Daemon { detach: true }) {
        if let Err(e) = trace_store::double_fork::daemon_double_fork() {
            eprintln!("unable to detach: {e}");
            return ExitCode::ForkFail.into();
        }
    }

    if let Err(e) = init_tracing(&args) {
        eprintln!("unable to initialize logging: {e}");
        return ExitCode::UnexpectedError.into();
    }

    dispatch(&args).into()
}
