use std::{
    fmt, hint,
    sync::atomic::{AtomicU32, Ordering},
    thread,
    time::{Duration, Instant},
};

use bytemuck::{Pod, Zeroable};

use crate::{
    error::IpcError,
    platform::{Platform, Segment},
};

pub const VERSION_PROTOCOL: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Set on versions published by debug builds. Not part of the ordering.
const DEBUG_BIT: u32 = 0x8000;
const MINOR_MASK: u32 = 0x7fff;

/// Publication takes microseconds; anything slower means the writer died
/// between creating the segment and publishing into it.
const READY_DEADLINE: Duration = Duration::from_secs(1);
const SPIN_BURST: u32 = 1 << 10;

/// `protocol << 16 | minor`, with bit 15 flagging a debug build.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version(u32);

impl Version {
    pub const CURRENT: Version = Version::current();

    #[must_use]
    pub const fn new(protocol: u16, minor: u16) -> Self {
        Self(((protocol as u32) << 16) | (minor as u32 & MINOR_MASK))
    }

    const fn current() -> Self {
        let v = Self::new(VERSION_PROTOCOL, VERSION_MINOR);
        if cfg!(debug_assertions) { v.with_debug() } else { v }
    }

    #[must_use]
    pub const fn with_debug(self) -> Self {
        Self(self.0 | DEBUG_BIT)
    }

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn protocol(self) -> u16 {
        (self.0 >> 16) as u16
    }

    #[must_use]
    pub const fn minor(self) -> u16 {
        (self.0 & MINOR_MASK) as u16
    }

    #[must_use]
    pub const fn is_debug(self) -> bool {
        self.0 & DEBUG_BIT != 0
    }

    /// The value versions are ordered by: build flavour is ignored, so a
    /// debug and a release build of the same version never evict each other.
    #[must_use]
    pub const fn ordinal(self) -> u32 {
        self.0 & !DEBUG_BIT
    }

    #[must_use]
    pub const fn is_older_than(self, other: Version) -> bool {
        self.ordinal() < other.ordinal()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.protocol(), self.minor())?;
        if self.is_debug() {
            f.write_str("-debug")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({self} = {:#010x})", self.0)
    }
}

/// The record living in the well-known shared memory segment.
///
/// `version` and `pid` are written before `published` is released, and
/// readers acquire `published` before looking at them. There is one writer
/// and it publishes exactly once, so no lock is needed.
#[repr(C)]
#[derive(Debug, Zeroable)]
pub struct InstanceInfo {
    published: AtomicU32,
    version: AtomicU32,
    pid: AtomicU32,
}

/// Plain copy of an [`InstanceInfo`], same layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable, Pod)]
pub struct InstanceSnapshot {
    pub published: u32,
    pub version: u32,
    pub pid: u32,
}

impl InstanceInfo {
    pub const SIZE: usize = size_of::<InstanceInfo>();

    pub(crate) fn publish(&self, version: Version, pid: u32) {
        self.version.store(version.raw(), Ordering::Relaxed);
        self.pid.store(pid, Ordering::Relaxed);
        self.published.fetch_add(1, Ordering::Release);
    }

    #[must_use]
    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire) != 0
    }

    /// Spin until the writer has published. Never sleeps; yields between
    /// bursts and gives up after [`READY_DEADLINE`].
    pub fn wait_for_ready(&self) -> Result<(), IpcError> {
        let deadline = Instant::now() + READY_DEADLINE;
        let mut spins: u32 = 0;
        while !self.is_published() {
            spins = spins.wrapping_add(1);
            if spins % SPIN_BURST == 0 {
                if Instant::now() >= deadline {
                    return Err(IpcError::NotPublished);
                }
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn version(&self) -> Version {
        Version::from_raw(self.version.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn snapshot(&self) -> InstanceSnapshot {
        let published = self.published.load(Ordering::Acquire);
        InstanceSnapshot {
            published,
            version: self.version.load(Ordering::Relaxed),
            pid: self.pid.load(Ordering::Relaxed),
        }
    }
}

/// A freshly created, not yet published segment. Only the daemon holds one,
/// and publishing consumes it so it can only happen once.
pub struct InstanceSlot<S> {
    segment: S,
}

impl<S: Segment> InstanceSlot<S> {
    /// Exclusively create the well-known segment.
    pub fn create<P>(platform: &P) -> Result<Self, IpcError>
    where
        P: Platform<Segment = S>,
    {
        let segment = platform.create_segment()?;
        Ok(Self { segment })
    }

    pub fn publish(self, version: Version, pid: u32) -> InstanceRegistry<S> {
        self.segment.info().publish(version, pid);
        InstanceRegistry {
            segment: self.segment,
        }
    }
}

/// A view onto the segment of a published (or publishing) daemon.
pub struct InstanceRegistry<S> {
    segment: S,
}

impl<S: Segment> InstanceRegistry<S> {
    /// Open the well-known segment without ever creating it. `None` means no
    /// daemon is registered.
    pub fn try_open_existing<P>(platform: &P) -> Result<Option<Self>, IpcError>
    where
        P: Platform<Segment = S>,
    {
        Ok(platform.open_segment()?.map(|segment| Self { segment }))
    }

    /// Forget the well-known name. Existing mappings stay valid; the next
    /// `try_open_existing` finds nothing.
    pub fn remove<P>(platform: &P) -> Result<(), IpcError>
    where
        P: Platform<Segment = S>,
    {
        platform.remove_segment()
    }

    pub fn wait_for_ready(&self) -> Result<(), IpcError> {
        self.info().wait_for_ready()
    }

    /// True iff the registered daemon is strictly older than `ours`.
    #[must_use]
    pub fn is_older(&self, ours: Version) -> bool {
        self.version().is_older_than(ours)
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.info().version()
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.info().pid()
    }

    #[must_use]
    pub fn info(&self) -> &InstanceInfo {
        self.segment.info()
    }
}
