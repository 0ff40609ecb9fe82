//! Cooperative cancellation.
//!
//! A [`ShutdownTrigger`] owns the only sender of a zero-capacity channel.
//! Triggering drops that sender, which disconnects the channel and wakes
//! every [`ShutdownSignal`] blocked in `wait_timeout` or a `select!` on
//! [`ShutdownSignal::receiver`].

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Fires a shutdown signal. Dropping the last clone also fires it.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    sender: Arc<Mutex<Option<Sender<()>>>>,
}

/// Observes a shutdown trigger.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: Receiver<()>,
}

/// Create a connected trigger/signal pair.
pub fn shutdown_pair() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = bounded(0);
    (
        ShutdownTrigger {
            sender: Arc::new(Mutex::new(Some(tx))),
        },
        ShutdownSignal { receiver: rx },
    )
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.sender.lock().take();
    }

    pub fn is_triggered(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl ShutdownSignal {
    /// Signal that never fires.
    pub fn never() -> Self {
        // The sender is leaked into a never-dropped channel so the
        // receiver stays connected.
        let (tx, rx) = bounded(0);
        std::mem::forget(tx);
        Self { receiver: rx }
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for up to `timeout`; returns true as soon as the signal fires.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.receiver.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Receiver for use in `crossbeam_channel::select!`. A receive on it
    /// completes with an error once the signal fires.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}
