use std::time::Duration;

use crate::{error::IpcError, instance::InstanceInfo};

pub const DEFAULT_NAMESPACE: &str = "TraceStore";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Raised by the daemon once it is up
    Begun,
    /// Raised by anyone who wants the daemon gone
    Quit,
}

/// Machine-wide names of the three objects, derived from a namespace so
/// tests can run side by side with a real daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNames {
    pub segment: String,
    pub quit: String,
    pub begun: String,
}

impl ObjectNames {
    #[must_use]
    pub fn new(namespace: &str) -> Self {
        Self {
            segment: format!("{namespace}.Instance"),
            quit: format!("{namespace}.Quit"),
            begun: format!("{namespace}.Begun"),
        }
    }

    #[must_use]
    pub fn event(&self, kind: EventKind) -> &str {
        match kind {
            EventKind::Begun => &self.begun,
            EventKind::Quit => &self.quit,
        }
    }
}

impl Default for ObjectNames {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

/// A mapping of the instance segment.
pub trait Segment: Send {
    fn info(&self) -> &InstanceInfo;
}

/// A named one-shot cross-process signal.
pub trait Signal: Send + Sync {
    /// Set the signal. Raising an already raised signal is a no-op.
    fn raise(&self) -> Result<(), IpcError>;

    /// Block until raised, or until `timeout` elapses if one is given.
    fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome, IpcError>;
}

/// Everything the launcher needs from the OS: the named segment, the two
/// named signals, and liveness/termination of foreign processes.
///
/// `create_*` fails with [`IpcError::AlreadyExists`] when someone else
/// already owns the name; `open_*` returns `None` when nobody does.
/// `remove_*` forgets the name (POSIX unlink); it is a no-op where the OS
/// reference-counts named objects.
pub trait Platform: Send + Sync {
    type Segment: Segment;
    type Signal: Signal;

    fn names(&self) -> &ObjectNames;

    fn create_segment(&self) -> Result<Self::Segment, IpcError>;
    fn open_segment(&self) -> Result<Option<Self::Segment>, IpcError>;
    fn remove_segment(&self) -> Result<(), IpcError>;

    fn create_signal(&self, kind: EventKind) -> Result<Self::Signal, IpcError>;
    fn open_signal(
        &self,
        kind: EventKind,
    ) -> Result<Option<Self::Signal>, IpcError>;
    fn remove_signal(&self, kind: EventKind) -> Result<(), IpcError>;

    fn is_alive(&self, pid: u32) -> Result<bool, IpcError>;
    fn terminate(&self, pid: u32) -> Result<(), IpcError>;
}
