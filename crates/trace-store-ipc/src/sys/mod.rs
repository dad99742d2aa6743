//! The operating system's named objects, one implementation per platform.
//!
//! - Unix: POSIX shared memory (`shm_open` + `mmap`) and named semaphores
//! - Windows: pagefile-backed file mappings and named kernel events

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{ShmSegment, SystemPlatform, SystemSignal};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::{SystemPlatform, SystemSignal, ViewSegment};
