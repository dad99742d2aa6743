use std::{
    ffi::CString,
    io,
    os::fd::AsRawFd,
    thread,
    time::{Duration, Instant},
};

use memmap2::{Mmap, MmapMut};
use nix::{
    errno::Errno,
    sys::signal::{Signal as UnixSignal, kill},
    unistd::Pid,
};
use psx_shm::Shm;
use rustix::{
    fs::{Mode, fstat},
    shm::OFlags,
};
use tracing::debug;

use crate::{
    error::IpcError,
    instance::InstanceInfo,
    platform::{
        EventKind, ObjectNames, Platform, Segment, Signal, WaitOutcome,
    },
};

const RW_MODE: Mode = Mode::from_bits_retain(0o600);
const SEM_MODE: libc::c_uint = 0o600;

/// The creator sizes the segment right after creating it; a reader that
/// opens in between sees a zero length file for a moment.
const SIZE_DEADLINE: Duration = Duration::from_secs(1);

#[cfg(not(target_os = "linux"))]
const TRYWAIT_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SystemPlatform {
    names: ObjectNames,
}

impl SystemPlatform {
    #[must_use]
    pub fn new(namespace: &str) -> Self {
        Self {
            names: ObjectNames::new(namespace),
        }
    }
}

enum Mapping {
    Owner(MmapMut),
    Reader(Mmap),
}

pub struct ShmSegment {
    _shm: Shm,
    map: Mapping,
}

impl Segment for ShmSegment {
    fn info(&self) -> &InstanceInfo {
        let base = match &self.map {
            Mapping::Owner(map) => map.as_ptr(),
            Mapping::Reader(map) => map.as_ptr(),
        };
        // SAFETY: the mapping is page aligned, at least `InstanceInfo::SIZE`
        // bytes long and lives as long as `self`. The record is only ever
        // accessed through atomics.
        unsafe { &*base.cast::<InstanceInfo>() }
    }
}

fn wait_for_size(shm: &Shm, name: &str) -> Result<(), IpcError> {
    let deadline = Instant::now() + SIZE_DEADLINE;
    loop {
        let st = fstat(shm.as_fd()).map_err(|errno| IpcError::Open {
            name: name.to_owned(),
            source: errno.into(),
        })?;
        if usize::try_from(st.st_size).unwrap_or(0) >= InstanceInfo::SIZE {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(IpcError::NotPublished);
        }
        thread::yield_now();
    }
}

pub struct SystemSignal {
    sem: *mut libc::sem_t,
    name: String,
}

// SAFETY: named semaphores are process-shared by construction and every
// operation on them is thread safe.
unsafe impl Send for SystemSignal {}
unsafe impl Sync for SystemSignal {}

impl Drop for SystemSignal {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

fn sem_name(name: &str) -> Result<CString, IpcError> {
    CString::new(format!("/{name}")).map_err(|e| IpcError::Create {
        name: name.to_owned(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl SystemSignal {
    fn signal_err(&self) -> IpcError {
        IpcError::Signal {
            name: self.name.clone(),
            source: io::Error::last_os_error(),
        }
    }

    fn wait_forever(&self) -> Result<WaitOutcome, IpcError> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(WaitOutcome::Signaled);
            }
            if last_errno() != libc::EINTR {
                return Err(self.signal_err());
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn wait_timeout(&self, timeout: Duration) -> Result<WaitOutcome, IpcError> {
        const NANOS_PER_SEC: i64 = 1_000_000_000;

        // sem_timedwait wants an absolute CLOCK_REALTIME deadline
        let mut now: libc::timespec = unsafe { std::mem::zeroed() };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &raw mut now);
        }
        let nanos = i64::from(now.tv_nsec) + i64::from(timeout.subsec_nanos());
        let secs = i64::from(now.tv_sec)
            + i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX / 2)
            + nanos / NANOS_PER_SEC;
        let mut deadline: libc::timespec = unsafe { std::mem::zeroed() };
        deadline.tv_sec = secs as libc::time_t;
        deadline.tv_nsec = (nanos % NANOS_PER_SEC) as _;

        loop {
            if unsafe { libc::sem_timedwait(self.sem, &raw const deadline) }
                == 0
            {
                return Ok(WaitOutcome::Signaled);
            }
            match last_errno() {
                libc::EINTR => {}
                libc::ETIMEDOUT => return Ok(WaitOutcome::TimedOut),
                _ => return Err(self.signal_err()),
            }
        }
    }

    // no sem_timedwait on macOS
    #[cfg(not(target_os = "linux"))]
    fn wait_timeout(&self, timeout: Duration) -> Result<WaitOutcome, IpcError> {
        let deadline = Instant::now() + timeout;
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(WaitOutcome::Signaled);
            }
            match last_errno() {
                libc::EAGAIN | libc::EINTR => {}
                _ => return Err(self.signal_err()),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            thread::sleep(TRYWAIT_INTERVAL.min(deadline - now));
        }
    }
}

impl Signal for SystemSignal {
    fn raise(&self) -> Result<(), IpcError> {
        #[cfg(target_os = "linux")]
        {
            let mut value: libc::c_int = 0;
            if unsafe { libc::sem_getvalue(self.sem, &raw mut value) } == 0
                && value > 0
            {
                return Ok(());
            }
        }
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(self.signal_err());
        }
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome, IpcError> {
        match timeout {
            None => self.wait_forever(),
            Some(timeout) => self.wait_timeout(timeout),
        }
    }
}

fn unix_pid(pid: u32) -> Result<Pid, IpcError> {
    match i32::try_from(pid) {
        // 0 and negative pids address process groups
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(IpcError::Process {
            pid,
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a process id",
            ),
        }),
    }
}

impl Platform for SystemPlatform {
    type Segment = ShmSegment;
    type Signal = SystemSignal;

    fn names(&self) -> &ObjectNames {
        &self.names
    }

    fn create_segment(&self) -> Result<ShmSegment, IpcError> {
        let name = &self.names.segment;
        let mut shm = Shm::open(
            name,
            OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
            RW_MODE,
        )
        .map_err(|source| {
            if source.kind() == io::ErrorKind::AlreadyExists {
                IpcError::AlreadyExists { name: name.clone() }
            } else {
                IpcError::Create {
                    name: name.clone(),
                    source,
                }
            }
        })?;

        if let Err(source) = shm.set_size(InstanceInfo::SIZE) {
            let _ = self.remove_segment();
            return Err(IpcError::Truncate {
                name: name.clone(),
                source,
            });
        }

        let map = match unsafe { shm.map(0) } {
            Ok(borrowed) => unsafe { borrowed.into_map() },
            Err(source) => {
                let _ = self.remove_segment();
                return Err(IpcError::Map {
                    name: name.clone(),
                    source,
                });
            }
        };
        debug!("created shared memory segment {name}");

        Ok(ShmSegment {
            _shm: shm,
            map: Mapping::Owner(map),
        })
    }

    fn open_segment(&self) -> Result<Option<ShmSegment>, IpcError> {
        let name = &self.names.segment;
        let shm = match Shm::open(name, OFlags::RDONLY, RW_MODE) {
            Ok(shm) => shm,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(IpcError::Open {
                    name: name.clone(),
                    source,
                });
            }
        };
        wait_for_size(&shm, name)?;

        let fd = shm.as_fd();
        let map = unsafe { Mmap::map(fd.as_raw_fd()) }.map_err(|source| {
            IpcError::Map {
                name: name.clone(),
                source,
            }
        })?;

        Ok(Some(ShmSegment {
            _shm: shm,
            map: Mapping::Reader(map),
        }))
    }

    fn remove_segment(&self) -> Result<(), IpcError> {
        let name = &self.names.segment;
        match rustix::shm::unlink(name.as_str()) {
            Ok(()) | Err(rustix::io::Errno::NOENT) => Ok(()),
            Err(errno) => Err(IpcError::Open {
                name: name.clone(),
                source: errno.into(),
            }),
        }
    }

    fn create_signal(&self, kind: EventKind) -> Result<SystemSignal, IpcError> {
        let name = self.names.event(kind);
        let c_name = sem_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                SEM_MODE,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            let source = io::Error::last_os_error();
            return Err(if source.kind() == io::ErrorKind::AlreadyExists {
                IpcError::AlreadyExists {
                    name: name.to_owned(),
                }
            } else {
                IpcError::Create {
                    name: name.to_owned(),
                    source,
                }
            });
        }
        debug!("created semaphore {name}");
        Ok(SystemSignal {
            sem,
            name: name.to_owned(),
        })
    }

    fn open_signal(
        &self,
        kind: EventKind,
    ) -> Result<Option<SystemSignal>, IpcError> {
        let name = self.names.event(kind);
        let c_name = sem_name(name)?;
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            let source = io::Error::last_os_error();
            if source.kind() == io::ErrorKind::NotFound {
                return Ok(None);
            }
            return Err(IpcError::Open {
                name: name.to_owned(),
                source,
            });
        }
        Ok(Some(SystemSignal {
            sem,
            name: name.to_owned(),
        }))
    }

    fn remove_signal(&self, kind: EventKind) -> Result<(), IpcError> {
        let name = self.names.event(kind);
        let c_name = sem_name(name)?;
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0
            && last_errno() != libc::ENOENT
        {
            return Err(IpcError::Open {
                name: name.to_owned(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> Result<bool, IpcError> {
        match kill(unix_pid(pid)?, None) {
            // EPERM: it exists, it just isn't ours
            Ok(()) | Err(Errno::EPERM) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(IpcError::Process {
                pid,
                source: errno.into(),
            }),
        }
    }

    fn terminate(&self, pid: u32) -> Result<(), IpcError> {
        match kill(unix_pid(pid)?, UnixSignal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(IpcError::Process {
                pid,
                source: errno.into(),
            }),
        }
    }
}
