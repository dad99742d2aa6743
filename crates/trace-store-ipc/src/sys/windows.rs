use std::{ffi::c_void, io, iter, ptr, time::Duration};

use tracing::debug;
use windows_sys::Win32::{
    Foundation::{
        CloseHandle, ERROR_ALREADY_EXISTS, ERROR_FILE_NOT_FOUND,
        ERROR_INVALID_PARAMETER, GetLastError, HANDLE, INVALID_HANDLE_VALUE,
        WAIT_OBJECT_0, WAIT_TIMEOUT,
    },
    System::{
        Memory::{
            CreateFileMappingW, FILE_MAP_ALL_ACCESS, FILE_MAP_READ,
            MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile, OpenFileMappingW,
            PAGE_READWRITE, UnmapViewOfFile,
        },
        Threading::{
            CreateEventW, EVENT_MODIFY_STATE, INFINITE, OpenEventW,
            OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
            PROCESS_SYNCHRONIZE, PROCESS_TERMINATE, SYNCHRONIZATION_SYNCHRONIZE,
            SetEvent, TerminateProcess, WaitForSingleObject,
        },
    },
};

use crate::{
    error::IpcError,
    instance::InstanceInfo,
    platform::{
        EventKind, ObjectNames, Platform, Segment, Signal, WaitOutcome,
    },
};

/// Session-local kernel object namespace.
const OBJECT_PREFIX: &str = "Local\\";

fn wide(name: &str) -> Vec<u16> {
    OBJECT_PREFIX
        .encode_utf16()
        .chain(name.encode_utf16())
        .chain(iter::once(0))
        .collect()
}

struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

// SAFETY: kernel handles may be used and closed from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

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

pub struct ViewSegment {
    view: *mut c_void,
    _mapping: OwnedHandle,
}

// SAFETY: the view stays mapped until drop and is only touched through
// atomics.
unsafe impl Send for ViewSegment {}

impl Drop for ViewSegment {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS { Value: self.view });
        }
    }
}

impl Segment for ViewSegment {
    fn info(&self) -> &InstanceInfo {
        // SAFETY: see the Send impl; views are page aligned and at least
        // `InstanceInfo::SIZE` long.
        unsafe { &*self.view.cast::<InstanceInfo>() }
    }
}

fn map_view(
    mapping: OwnedHandle,
    access: u32,
    name: &str,
) -> Result<ViewSegment, IpcError> {
    let view =
        unsafe { MapViewOfFile(mapping.0, access, 0, 0, InstanceInfo::SIZE) };
    if view.Value.is_null() {
        return Err(IpcError::Map {
            name: name.to_owned(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(ViewSegment {
        view: view.Value,
        _mapping: mapping,
    })
}

pub struct SystemSignal {
    event: OwnedHandle,
    name: String,
}

impl Signal for SystemSignal {
    fn raise(&self) -> Result<(), IpcError> {
        if unsafe { SetEvent(self.event.0) } == 0 {
            return Err(IpcError::Signal {
                name: self.name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome, IpcError> {
        let millis = timeout.map_or(INFINITE, |t| {
            u32::try_from(t.as_millis()).unwrap_or(INFINITE - 1)
        });
        match unsafe { WaitForSingleObject(self.event.0, millis) } {
            WAIT_OBJECT_0 => Ok(WaitOutcome::Signaled),
            WAIT_TIMEOUT => Ok(WaitOutcome::TimedOut),
            _ => Err(IpcError::Signal {
                name: self.name.clone(),
                source: io::Error::last_os_error(),
            }),
        }
    }
}

impl Platform for SystemPlatform {
    type Segment = ViewSegment;
    type Signal = SystemSignal;

    fn names(&self) -> &ObjectNames {
        &self.names
    }

    fn create_segment(&self) -> Result<ViewSegment, IpcError> {
        let name = &self.names.segment;
        let wname = wide(name);
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                ptr::null(),
                PAGE_READWRITE,
                0,
                InstanceInfo::SIZE as u32,
                wname.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(IpcError::Create {
                name: name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        let mapping = OwnedHandle(handle);
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            return Err(IpcError::AlreadyExists { name: name.clone() });
        }
        debug!("created file mapping {name}");
        map_view(mapping, FILE_MAP_ALL_ACCESS, name)
    }

    fn open_segment(&self) -> Result<Option<ViewSegment>, IpcError> {
        let name = &self.names.segment;
        let wname = wide(name);
        let handle =
            unsafe { OpenFileMappingW(FILE_MAP_READ, 0, wname.as_ptr()) };
        if handle.is_null() {
            if unsafe { GetLastError() } == ERROR_FILE_NOT_FOUND {
                return Ok(None);
            }
            return Err(IpcError::Open {
                name: name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        map_view(OwnedHandle(handle), FILE_MAP_READ, name).map(Some)
    }

    // the mapping goes away with its last handle
    fn remove_segment(&self) -> Result<(), IpcError> {
        Ok(())
    }

    fn create_signal(&self, kind: EventKind) -> Result<SystemSignal, IpcError> {
        let name = self.names.event(kind);
        let wname = wide(name);
        // manual reset: raising twice is the same as raising once
        let handle =
            unsafe { CreateEventW(ptr::null(), 1, 0, wname.as_ptr()) };
        if handle.is_null() {
            return Err(IpcError::Create {
                name: name.to_owned(),
                source: io::Error::last_os_error(),
            });
        }
        let event = OwnedHandle(handle);
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            return Err(IpcError::AlreadyExists {
                name: name.to_owned(),
            });
        }
        Ok(SystemSignal {
            event,
            name: name.to_owned(),
        })
    }

    fn open_signal(
        &self,
        kind: EventKind,
    ) -> Result<Option<SystemSignal>, IpcError> {
        let name = self.names.event(kind);
        let wname = wide(name);
        let handle = unsafe {
            OpenEventW(
                EVENT_MODIFY_STATE | SYNCHRONIZATION_SYNCHRONIZE,
                0,
                wname.as_ptr(),
            )
        };
        if handle.is_null() {
            if unsafe { GetLastError() } == ERROR_FILE_NOT_FOUND {
                return Ok(None);
            }
            return Err(IpcError::Open {
                name: name.to_owned(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(Some(SystemSignal {
            event: OwnedHandle(handle),
            name: name.to_owned(),
        }))
    }

    fn remove_signal(&self, _kind: EventKind) -> Result<(), IpcError> {
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> Result<bool, IpcError> {
        let handle = unsafe {
            OpenProcess(
                PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_SYNCHRONIZE,
                0,
                pid,
            )
        };
        if handle.is_null() {
            if unsafe { GetLastError() } == ERROR_INVALID_PARAMETER {
                return Ok(false);
            }
            return Err(IpcError::Process {
                pid,
                source: io::Error::last_os_error(),
            });
        }
        let process = OwnedHandle(handle);
        Ok(unsafe { WaitForSingleObject(process.0, 0) } == WAIT_TIMEOUT)
    }

    fn terminate(&self, pid: u32) -> Result<(), IpcError> {
        let handle = unsafe { OpenProcess(PROCESS_TERMINATE, 0, pid) };
        if handle.is_null() {
            if unsafe { GetLastError() } == ERROR_INVALID_PARAMETER {
                return Ok(());
            }
            return Err(IpcError::Process {
                pid,
                source: io::Error::last_os_error(),
            });
        }
        let process = OwnedHandle(handle);
        if unsafe { TerminateProcess(process.0, 1) } == 0 {
            return Err(IpcError::Process {
                pid,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}
