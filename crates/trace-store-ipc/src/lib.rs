//! Named shared memory and named signals used to keep exactly one trace-store
//! daemon alive per machine.
//!
//! Everything the launcher needs from the operating system goes through the
//! [`Platform`] trait. [`sys::SystemPlatform`] is the real thing (POSIX
//! shared memory + named semaphores, or Win32 file mappings + events) and
//! [`mem::MemPlatform`] is an in-process stand-in for tests.

pub mod error;
pub mod instance;
pub mod mem;
pub mod platform;
pub mod signals;
pub mod sys;

pub use error::IpcError;
pub use instance::{
    InstanceInfo, InstanceRegistry, InstanceSlot, InstanceSnapshot, Version,
};
pub use platform::{
    DEFAULT_NAMESPACE, EventKind, ObjectNames, Platform, Segment, Signal,
    WaitOutcome,
};
pub use signals::SignalPair;
