//! The store service the daemon hosts while it is running: a TCP recorder
//! that spools every incoming trace stream into its own file under the
//! store directory.

use std::{
    io,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{SystemTime, UNIX_EPOCH},
};

use futures::future::join_all;
use snafu::ResultExt;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Notify,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{IoSnafu, LaunchError},
    spawn_named,
};

pub const TRACE_EXTENSION: &str = "utrace";
const READ_CHUNK: usize = 64 * 1024;
const WORKER_THREADS: usize = 2;

/// Whatever the daemon runs between publishing and quitting.
pub trait StoreService: Send {
    /// Port the service is reachable on, 0 if it has none.
    fn port(&self) -> u16;

    /// Stop accepting work, finish what is in flight and release resources.
    fn stop(self);
}

/// Stop flag for the recorder's tasks.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

struct Inner {
    notified: Notify,
    is_shutdown: AtomicBool,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                notified: Notify::new(),
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Returns true for the call that actually flipped the flag.
    pub fn trigger(&self) -> bool {
        let first = !self.inner.is_shutdown.swap(true, Ordering::SeqCst);
        if first {
            self.inner.notified.notify_waiters();
        }
        first
    }

    /// Resolves once triggered, immediately if that already happened.
    pub async fn wait(&self) {
        // register before checking the flag so a concurrent trigger is seen
        let notified = self.inner.notified.notified();
        if self.is_shutdown() {
            return;
        }
        notified.await;
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::SeqCst)
    }
}

/// Records raw trace streams from TCP clients.
pub struct RecorderService {
    port: u16,
    shutdown: Shutdown,
    thread: Option<JoinHandle<()>>,
}

impl RecorderService {
    /// Bind `port` (0 picks a free one) and start accepting on a dedicated
    /// runtime thread. Fails before returning if the port cannot be bound.
    pub fn start(store_dir: &Path, port: u16) -> Result<Self, LaunchError> {
        std::fs::create_dir_all(store_dir).context(IoSnafu {
            what: format!("unable to create {}", store_dir.display()),
        })?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("store-worker")
            .enable_all()
            .build()
            .context(IoSnafu {
                what: "unable to initialize tokio runtime",
            })?;

        let listener = runtime
            .block_on(TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)))
            .context(IoSnafu {
                what: format!("unable to bind recorder port {port}"),
            })?;
        let port = listener
            .local_addr()
            .context(IoSnafu {
                what: "recorder socket has no address",
            })?
            .port();
        info!("recording traces on port {port} into {}", store_dir.display());

        let shutdown = Shutdown::new();
        let task_shutdown = shutdown.clone();
        let store_dir = store_dir.to_path_buf();
        let thread = thread::Builder::new()
            .name("store-service".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let accept = spawn_named(
                        "recorder accept loop",
                        accept_loop(listener, store_dir, task_shutdown),
                    );
                    if let Err(e) = accept.await {
                        error!("recorder accept loop failed: {e}");
                    }
                });
            })
            .context(IoSnafu {
                what: "unable to spawn the store service thread",
            })?;

        Ok(Self {
            port,
            shutdown,
            thread: Some(thread),
        })
    }
}

impl StoreService for RecorderService {
    fn port(&self) -> u16 {
        self.port
    }

    fn stop(mut self) {
        self.shutdown.trigger();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("store service thread panicked");
        }
        info!("recorder stopped");
    }
}

impl Drop for RecorderService {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// `<unix-ms>-<n>.utrace`, unique within the process.
fn trace_path(store_dir: &Path) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    let n = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
    store_dir.join(format!("{millis}-{n}.{TRACE_EXTENSION}"))
}

async fn accept_loop(
    listener: TcpListener,
    store_dir: PathBuf,
    shutdown: Shutdown,
) {
    let mut sessions = Vec::new();
    loop {
        let accepted = tokio::select! {
            () = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                sessions.retain(|s: &tokio::task::JoinHandle<()>| {
                    !s.is_finished()
                });
                let path = trace_path(&store_dir);
                let shutdown = shutdown.clone();
                sessions.push(spawn_named("trace session", async move {
                    match record_session(stream, &path, shutdown).await {
                        Ok(bytes) => info!(
                            "recorded {bytes} bytes from {peer} into {}",
                            path.display()
                        ),
                        Err(e) => warn!("session from {peer} failed: {e}"),
                    }
                }));
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }
    drop(listener);
    debug!("waiting on {} trace sessions", sessions.len());
    join_all(sessions).await;
}

async fn record_session(
    mut stream: TcpStream,
    path: &Path,
    shutdown: Shutdown,
) -> io::Result<u64> {
    let mut file = File::create(path).await?;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0u64;
    loop {
        let n = tokio::select! {
            () = shutdown.wait() => break,
            read = stream.read(&mut buf) => read?,
        };
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(total)
}
