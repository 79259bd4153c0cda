//! Binary gate that stops writers during rollover.

use crate::error::{ArchiveError, Result};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Open,
    Closed,
    Shutdown,
}

/// Open/closed gate with parked waiters.
///
/// ```text
///        close()            open()
///  Open ────────▶ Closed ────────▶ Open
///    │               │
///    └── shutdown() ─┴──▶ Shutdown ── reset() ──▶ Open
/// ```
#[derive(Debug)]
pub struct RolloverGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Default for RolloverGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RolloverGate {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Open),
            changed: Condvar::new(),
        }
    }

    /// Blocks new passage until [`open`](Self::open).
    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state == GateState::Open {
            *state = GateState::Closed;
        }
    }

    /// Lets waiters through.
    pub fn open(&self) {
        let mut state = self.state.lock();
        if *state == GateState::Closed {
            *state = GateState::Open;
            self.changed.notify_all();
        }
    }

    /// Closes the gate for good and releases every waiter with an error.
    pub fn shutdown(&self) {
        *self.state.lock() = GateState::Shutdown;
        self.changed.notify_all();
    }

    /// Reopens a gate after shutdown, for an archive that is opened again.
    pub fn reset(&self) {
        *self.state.lock() = GateState::Open;
        self.changed.notify_all();
    }

    /// Returns true while the gate is open.
    pub fn is_open(&self) -> bool {
        *self.state.lock() == GateState::Open
    }

    /// Parks the caller until the gate is open.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::Closed` once the gate has been shut down.
    pub fn wait_open(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            match *state {
                GateState::Open => return Ok(()),
                GateState::Shutdown => return Err(ArchiveError::Closed),
                GateState::Closed => self.changed.wait(&mut state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_closed_gate_parks_until_open() {
        let gate = Arc::new(RolloverGate::new());
        gate.close();
        assert!(!gate.is_open());

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait_open())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        gate.open();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_releases_waiters() {
        let gate = Arc::new(RolloverGate::new());
        gate.close();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait_open())
        };
        gate.shutdown();
        assert!(matches!(waiter.join().unwrap(), Err(ArchiveError::Closed)));

        // Only reset() undoes a shutdown.
        gate.open();
        assert!(gate.wait_open().is_err());

        gate.reset();
        gate.wait_open().unwrap();
    }
}
