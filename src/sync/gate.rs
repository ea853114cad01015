//! gate.rs
//! Tick gate between the simulator exchange loop and the control loop.

use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};

/// Binary semaphore on a capacity-1 channel.
///
/// Releases while already released coalesce, so a slow control loop runs at
/// most one step per observed release, never a backlog of them.
#[derive(Debug, Clone)]
pub struct SimGate {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for SimGate {
    fn default() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }
}

impl SimGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal one completed exchange tick. Returns false if the gate was already open.
    pub fn release(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => false,
            // both ends live in `self`
            Err(TrySendError::Disconnected(())) => false,
        }
    }

    /// Non-blocking acquire; true means one control step may run.
    pub fn try_acquire(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    pub fn is_open(&self) -> bool {
        !self.rx.is_empty()
    }
}
