//! In-flight operation bookkeeping.
//!
//! Every pending operation keeps the oneshot senders of all callers waiting
//! on it. Taking the entry out of its map is the only way to reach those
//! senders, so whoever removes it (confirmation, rollback, timer, shutdown)
//! resolves it exactly once.

use std::sync::Arc;

use tokio::sync::oneshot;

use devmux_core::{DeviceDescriptor, Mode};

use super::SessionError;
use crate::resource::ClaimedResource;

type Waiter<T> = oneshot::Sender<Result<T, SessionError>>;

/// Waiters of one attempt.
pub(crate) struct Pending<T> {
    attempt: u64,
    waiters: Vec<Waiter<T>>,
}

impl<T: Clone> Pending<T> {
    pub(crate) fn new(attempt: u64) -> Self {
        Self {
            attempt,
            waiters: Vec::new(),
        }
    }

    pub(crate) fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Adds a caller to this attempt.
    pub(crate) fn join(&mut self) -> oneshot::Receiver<Result<T, SessionError>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Delivers `result` to every caller. Callers that gave up are skipped.
    pub(crate) fn resolve(self, result: Result<T, SessionError>) {
        for waiter in self.waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Claim sent to the hardware daemon, awaiting confirmation.
pub(crate) struct PendingClaim {
    pub(crate) pending: Pending<Arc<ClaimedResource>>,
    /// Optimistic local object, registered globally only on confirmation
    pub(crate) resource: Arc<ClaimedResource>,
    pub(crate) mode: Mode,
}

impl PendingClaim {
    pub(crate) fn new(attempt: u64, resource: Arc<ClaimedResource>, mode: Mode) -> Self {
        Self {
            pending: Pending::new(attempt),
            resource,
            mode,
        }
    }
}

/// Release sent to the hardware daemon, local teardown already done.
pub(crate) struct PendingRelease {
    pub(crate) pending: Pending<()>,
    pub(crate) resource: Arc<ClaimedResource>,
}

impl PendingRelease {
    pub(crate) fn new(attempt: u64, resource: Arc<ClaimedResource>) -> Self {
        Self {
            pending: Pending::new(attempt),
            resource,
        }
    }
}

pub(crate) type PendingDiscovery = Pending<Vec<DeviceDescriptor>>;

/// Waits for the outcome of an attempt. A dropped sender means the session
/// went away without resolving it.
pub(crate) async fn outcome<T>(rx: oneshot::Receiver<Result<T, SessionError>>) -> Result<T, SessionError> {
    rx.await.unwrap_or(Err(SessionError::SessionTerminated))
}

/// Result of looking for an attempt to join before starting a new one.
pub(crate) enum Start<T> {
    /// An attempt was already in flight
    Joined(oneshot::Receiver<Result<T, SessionError>>),
    /// A new attempt was registered
    Started {
        rx: oneshot::Receiver<Result<T, SessionError>>,
        attempt: u64,
    },
}
