use tokio::task::JoinHandle;

pub mod cli;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod exit_code;
pub mod indicator;
pub mod killer;
pub mod launch;
pub mod self_check;
pub mod settings;
pub mod staging;
pub mod store;
pub mod supervisor;
pub mod tracing_init;

// Only POSIX daemons detach by forking; Windows launches them detached.
#[cfg(unix)]
pub mod double_fork;

use tracing::Instrument;

#[allow(unexpected_cfgs)]
pub fn spawn_named<F>(name: &str, fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let span = tracing::info_span!("task", task_name = %name);

    let fut = fut.instrument(span);
    use futures::FutureExt;

    #[cfg(tokio_unstable)]
    {
        match tokio::task::Builder::new().name(name).spawn(fut.boxed()) {
            Ok(handle) => handle,
            Err(e) => panic!("failed to spawn task {name}: {e}"),
        }
    }

    #[cfg(not(tokio_unstable))]
    {
        tokio::spawn(fut.boxed())
    }
}
