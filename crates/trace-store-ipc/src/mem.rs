//! In-process stand-in for the OS named objects.
//!
//! Names live in a table shared by every clone of a [`MemPlatform`], so
//! threads holding clones behave like separate processes looking at the same
//! machine. Processes are plain pids; what "running" means is up to the
//! caller, usually a thread that calls [`MemPlatform::exit_process`] when it
//! returns. Like POSIX, nothing is cleaned up when a pid dies.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytemuck::Zeroable;

use crate::{
    error::IpcError,
    instance::InstanceInfo,
    platform::{
        EventKind, ObjectNames, Platform, Segment, Signal, WaitOutcome,
    },
};

const FIRST_PID: u32 = 4000;

#[derive(Clone)]
pub struct MemPlatform {
    names: ObjectNames,
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<MemState>,
    process_ops: AtomicUsize,
}

struct MemState {
    segment: Option<Arc<InstanceInfo>>,
    signals: HashMap<EventKind, Arc<SignalCell>>,
    alive: HashSet<u32>,
    terminated: Vec<u32>,
    next_pid: u32,
}

impl MemPlatform {
    #[must_use]
    pub fn new(namespace: &str) -> Self {
        Self {
            names: ObjectNames::new(namespace),
            shared: Arc::new(Shared {
                state: Mutex::new(MemState {
                    segment: None,
                    signals: HashMap::new(),
                    alive: HashSet::new(),
                    terminated: Vec::new(),
                    next_pid: FIRST_PID,
                }),
                process_ops: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a pid and mark it alive.
    pub fn spawn_process(&self) -> u32 {
        let mut state = self.state();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.alive.insert(pid);
        pid
    }

    /// Mark a pid as having exited on its own.
    pub fn exit_process(&self, pid: u32) {
        self.state().alive.remove(&pid);
    }

    /// Pids that were forcibly terminated, in order.
    #[must_use]
    pub fn terminated(&self) -> Vec<u32> {
        self.state().terminated.clone()
    }

    #[must_use]
    pub fn live_processes(&self) -> Vec<u32> {
        let mut pids: Vec<_> = self.state().alive.iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Number of liveness checks and terminations performed so far.
    #[must_use]
    pub fn process_ops(&self) -> usize {
        self.shared.process_ops.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn segment_exists(&self) -> bool {
        self.state().segment.is_some()
    }

    #[must_use]
    pub fn signal_exists(&self, kind: EventKind) -> bool {
        self.state().signals.contains_key(&kind)
    }
}

pub struct MemSegment(Arc<InstanceInfo>);

impl Segment for MemSegment {
    fn info(&self) -> &InstanceInfo {
        &self.0
    }
}

#[derive(Debug)]
struct SignalCell {
    raised: Mutex<bool>,
    cond: Condvar,
}

#[derive(Debug)]
pub struct MemSignal(Arc<SignalCell>);

impl Signal for MemSignal {
    fn raise(&self) -> Result<(), IpcError> {
        let mut raised =
            self.0.raised.lock().unwrap_or_else(PoisonError::into_inner);
        *raised = true;
        self.0.cond.notify_all();
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome, IpcError> {
        let raised =
            self.0.raised.lock().unwrap_or_else(PoisonError::into_inner);
        let raised = match timeout {
            None => self
                .0
                .cond
                .wait_while(raised, |r| !*r)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                self.0
                    .cond
                    .wait_timeout_while(raised, timeout, |r| !*r)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
        Ok(if *raised {
            WaitOutcome::Signaled
        } else {
            WaitOutcome::TimedOut
        })
    }
}

impl Platform for MemPlatform {
    type Segment = MemSegment;
    type Signal = MemSignal;

    fn names(&self) -> &ObjectNames {
        &self.names
    }

    fn create_segment(&self) -> Result<MemSegment, IpcError> {
        let mut state = self.state();
        if state.segment.is_some() {
            return Err(IpcError::AlreadyExists {
                name: self.names.segment.clone(),
            });
        }
        let info = Arc::new(InstanceInfo::zeroed());
        state.segment = Some(Arc::clone(&info));
        Ok(MemSegment(info))
    }

    fn open_segment(&self) -> Result<Option<MemSegment>, IpcError> {
        Ok(self.state().segment.clone().map(MemSegment))
    }

    fn remove_segment(&self) -> Result<(), IpcError> {
        self.state().segment = None;
        Ok(())
    }

    fn create_signal(&self, kind: EventKind) -> Result<MemSignal, IpcError> {
        let mut state = self.state();
        if state.signals.contains_key(&kind) {
            return Err(IpcError::AlreadyExists {
                name: self.names.event(kind).to_owned(),
            });
        }
        let cell = Arc::new(SignalCell {
            raised: Mutex::new(false),
            cond: Condvar::new(),
        });
        state.signals.insert(kind, Arc::clone(&cell));
        Ok(MemSignal(cell))
    }

    fn open_signal(
        &self,
        kind: EventKind,
    ) -> Result<Option<MemSignal>, IpcError> {
        Ok(self.state().signals.get(&kind).cloned().map(MemSignal))
    }

    fn remove_signal(&self, kind: EventKind) -> Result<(), IpcError> {
        self.state().signals.remove(&kind);
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> Result<bool, IpcError> {
        self.shared.process_ops.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().alive.contains(&pid))
    }

    fn terminate(&self, pid: u32) -> Result<(), IpcError> {
        self.shared.process_ops.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.alive.remove(&pid) {
            state.terminated.push(pid);
        }
        Ok(())
    }
}
