use std::time::Duration;

use crate::{
    error::IpcError,
    platform::{EventKind, Platform, Signal, WaitOutcome},
};

/// Quit and Begun of one namespace.
///
/// The daemon creates Quit and waits on it; the launcher that wins a launch
/// creates Begun and waits on it. Everyone else only raises them by name.
pub struct SignalPair<'p, P> {
    platform: &'p P,
}

impl<'p, P: Platform> SignalPair<'p, P> {
    #[must_use]
    pub fn new(platform: &'p P) -> Self {
        Self { platform }
    }

    /// Fails with [`IpcError::AlreadyExists`] if a daemon already owns it.
    pub fn create_quit(&self) -> Result<P::Signal, IpcError> {
        self.platform.create_signal(EventKind::Quit)
    }

    /// Block until someone raises `quit`. No timeout and no polling.
    pub fn wait_quit(quit: &P::Signal) -> Result<(), IpcError> {
        quit.wait(None).map(|_| ())
    }

    /// Raise Quit by name. `false` when nobody owns it.
    pub fn raise_quit(&self) -> Result<bool, IpcError> {
        self.raise(EventKind::Quit)
    }

    pub fn remove_quit(&self) -> Result<(), IpcError> {
        self.platform.remove_signal(EventKind::Quit)
    }

    /// Fails with [`IpcError::AlreadyExists`] while another launch is in
    /// flight.
    pub fn create_begun(&self) -> Result<P::Signal, IpcError> {
        self.platform.create_signal(EventKind::Begun)
    }

    pub fn wait_begun(
        begun: &P::Signal,
        timeout: Duration,
    ) -> Result<WaitOutcome, IpcError> {
        begun.wait(Some(timeout))
    }

    /// Raise Begun by name. `false` when nobody is waiting for it.
    pub fn raise_begun(&self) -> Result<bool, IpcError> {
        self.raise(EventKind::Begun)
    }

    pub fn remove_begun(&self) -> Result<(), IpcError> {
        self.platform.remove_signal(EventKind::Begun)
    }

    fn raise(&self, kind: EventKind) -> Result<bool, IpcError> {
        match self.platform.open_signal(kind)? {
            Some(signal) => signal.raise().map(|()| true),
            None => Ok(false),
        }
    }
}
