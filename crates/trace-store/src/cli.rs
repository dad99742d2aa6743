use std::path::PathBuf;

use trace_store_ipc::DEFAULT_NAMESPACE;

pub const DEFAULT_PORT: u16 = 1981;
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

static HELP_STR_NAMESPACE: &str = "
    Prefix of the machine-wide object names (<NAMESPACE>.Instance, \
                                   <NAMESPACE>.Quit, <NAMESPACE>.Begun). \
                                   Every launcher and daemon that should \
                                   agree on a single instance must use the \
                                   same value. Example value: \"TraceStore\"
";

#[derive(clap::Parser, Debug)]
#[command(
    name = "trace-store",
    version,
    about = "trace-store",
    long_about = "Starts, replaces and stops the single per-machine trace \
                  store daemon. Without a verb it behaves like `fork`: make \
                  sure a daemon at least as new as this binary is running, \
                  then exit."
)]
pub struct Args {
    #[command(subcommand)]
    pub verb: Option<Verb>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
    #[arg(
        long,
        global = true,
        env = "TRACE_STORE_NAMESPACE",
        value_name = "NAMESPACE",
        help = HELP_STR_NAMESPACE,
        default_value = DEFAULT_NAMESPACE
    )]
    pub namespace: String,

    #[arg(
        long,
        global = true,
        env = "TRACE_STORE_CACHE_DIR",
        value_name = "CACHE_DIR",
        help = "Where versioned copies of the binary are staged before \
                launch. Defaults to <user cache dir>/trace-store"
    )]
    pub cache_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "TRACE_STORE_STORE_DIR",
        value_name = "STORE_DIR",
        help = "Where the daemon writes recorded traces and instance.json. \
                Defaults to <user local data dir>/trace-store/store"
    )]
    pub store_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "TRACE_STORE_PORT",
        value_name = "PORT",
        help = "TCP port the daemon records traces on",
        default_value_t = DEFAULT_PORT
    )]
    pub port: u16,

    #[arg(
        long,
        short = 'l',
        global = true,
        env = "TRACE_STORE_LOG",
        value_name = "LOG_PATH",
        help = "Optional log path value. If not provided, the daemon logs \
                to <temp dir>/trace-store-daemon-$PID.log and every other \
                verb logs to stderr"
    )]
    pub log_path: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "MILLIS",
        help = "How long `fork` waits for a freshly launched daemon to \
                report that it has begun",
        default_value_t = DEFAULT_TIMEOUT_MS
    )]
    pub begun_timeout_ms: u64,

    #[arg(
        long,
        global = true,
        value_name = "MILLIS",
        help = "How long to wait for a daemon to honour quit before it is \
                killed",
        default_value_t = DEFAULT_TIMEOUT_MS
    )]
    pub quit_timeout_ms: u64,
}

#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    /// Ensure a daemon at least as new as this binary is running
    Fork {
        #[arg(
            long,
            help = "Run the daemon on a thread of this process instead of \
                    launching a detached copy, and stay in the foreground \
                    until it quits. Meant for debugging"
        )]
        in_process: bool,
    },
    /// Run the daemon itself
    Daemon {
        #[arg(
            long,
            short = 'f',
            help = "Detach from the launching process and terminal first"
        )]
        detach: bool,
    },
    /// Ask the running daemon to quit, killing it if it does not
    Kill,
    /// Check the build's shared record layout and exit codes
    #[command(hide = true)]
    Test,
}

impl Args {
    /// The requested verb; `fork` when none was given.
    #[must_use]
    pub fn verb(&self) -> Verb {
        self.verb
            .clone()
            .unwrap_or(Verb::Fork { in_process: false })
    }
}
