//! Reactive session flag set.
//!
//! A session's state is a set of independent boolean flags rather than a
//! single enum: a session can be connected, authenticated, waiting for a
//! heartbeat pong and under backpressure all at once. [`ReactiveFlagSet`]
//! stores those flags and lets callers register listeners that fire on the
//! transitions of a flag, which is how cascades such as
//! "heartbeat timeout puts the session in the error state" are wired.
//!
//! # Transition Discipline
//!
//! ```text
//!   add(F) / remove(F)
//!          │
//!          ▼
//!   ┌──────────────┐   commit prev → next under the state lock
//!   │ state mutex  │   (no-op if nothing changed)
//!   └──────┬───────┘
//!          │ lock released
//!          ▼
//!   listeners for the bits that changed run with the committed
//!   (previous, current) pair; they may call add/remove again
//! ```
//!
//! Listeners never run while the state lock is held, so a cascading
//! `add`/`remove` from inside a listener cannot deadlock.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

bitflags::bitflags! {
    /// State flags of a client session. The empty set is the idle state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SessionFlags: u32 {
        /// Transport to the client is up
        const CONNECTED = 1 << 0;
        /// Client completed the handshake
        const AUTHENTICATED = 1 << 1;
        /// A device discovery round-trip is outstanding
        const DISCOVERING = 1 << 2;
        /// Session owns at least one claimed device
        const HAS_CLAIMED_RESOURCES = 1 << 3;
        /// Heartbeat checks are live for this session
        const HEARTBEAT_ENABLED = 1 << 4;
        /// A ping was sent and no pong has arrived yet
        const HEARTBEAT_WAITING = 1 << 5;
        /// Too many consecutive pongs were missed
        const HEARTBEAT_TIMEOUT = 1 << 6;
        /// Too many messages are unacknowledged
        const BACKPRESSURE_ACTIVE = 1 << 7;
        /// Event pushes to the client are withheld
        const FLOW_CONTROL_PAUSED = 1 << 8;
        /// Session is tearing down
        const DISCONNECTING = 1 << 9;
        /// Session is unusable until it is shut down
        const ERROR_STATE = 1 << 10;
        /// Session finished shutting down
        const CLOSED = 1 << 11;
    }
}

/// Wire/display names for each flag, in bit order.
const FLAG_NAMES: &[(SessionFlags, &str)] = &[
    (SessionFlags::CONNECTED, "connected"),
    (SessionFlags::AUTHENTICATED, "authenticated"),
    (SessionFlags::DISCOVERING, "discovering"),
    (SessionFlags::HAS_CLAIMED_RESOURCES, "has_claimed_resources"),
    (SessionFlags::HEARTBEAT_ENABLED, "heartbeat_enabled"),
    (SessionFlags::HEARTBEAT_WAITING, "heartbeat_waiting"),
    (SessionFlags::HEARTBEAT_TIMEOUT, "heartbeat_timeout"),
    (SessionFlags::BACKPRESSURE_ACTIVE, "backpressure_active"),
    (SessionFlags::FLOW_CONTROL_PAUSED, "flow_control_paused"),
    (SessionFlags::DISCONNECTING, "disconnecting"),
    (SessionFlags::ERROR_STATE, "error_state"),
    (SessionFlags::CLOSED, "closed"),
];

impl SessionFlags {
    /// Returns the lowercase names of the flags set, in bit order.
    pub fn names(&self) -> Vec<String> {
        FLAG_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| (*name).to_string())
            .collect()
    }
}

impl fmt::Display for SessionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "idle");
        }
        write!(f, "{}", self.names().join("|"))
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// A committed flag transition, as seen by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagTransition {
    /// Flags before the transition
    pub previous: SessionFlags,
    /// Flags right after the transition was committed
    pub current: SessionFlags,
    /// The flag(s) of the registration that changed
    pub flag: SessionFlags,
}

/// Callback invoked on a flag transition.
///
/// Receives the set itself so cascades can call `add`/`remove` without
/// holding a reference back to their owner.
pub type FlagListener = Arc<dyn Fn(&ReactiveFlagSet, &FlagTransition) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Set,
    Cleared,
}

struct Registration {
    flag: SessionFlags,
    edge: Edge,
    listener: FlagListener,
}

// ============================================================================
// Reactive Flag Set
// ============================================================================

/// Thread-safe set of [`SessionFlags`] with transition listeners.
///
/// `add` and `remove` are idempotent: if every requested flag is already in
/// the requested state nothing is committed and no listener fires.
pub struct ReactiveFlagSet {
    state: Mutex<SessionFlags>,
    listeners: RwLock<Vec<Registration>>,
}

impl ReactiveFlagSet {
    /// Creates an idle (empty) flag set with no listeners.
    pub fn new() -> Self {
        Self::with_flags(SessionFlags::empty())
    }

    /// Creates a flag set starting from `initial`. No listener fires for
    /// the initial flags.
    pub fn with_flags(initial: SessionFlags) -> Self {
        Self {
            state: Mutex::new(initial),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Sets `flags`. Returns true if any flag changed.
    pub fn add(&self, flags: SessionFlags) -> bool {
        self.apply(flags, Edge::Set)
    }

    /// Clears `flags`. Returns true if any flag changed.
    pub fn remove(&self, flags: SessionFlags) -> bool {
        self.apply(flags, Edge::Cleared)
    }

    /// Returns true if every flag in `flags` is set.
    pub fn has(&self, flags: SessionFlags) -> bool {
        self.state.lock().contains(flags)
    }

    /// Returns true if at least one flag in `flags` is set.
    pub fn has_any(&self, flags: SessionFlags) -> bool {
        self.state.lock().intersects(flags)
    }

    /// Atomic read of all flags, for compound queries.
    pub fn snapshot(&self) -> SessionFlags {
        *self.state.lock()
    }

    /// Registers a listener fired when any flag in `flag` goes from clear to set.
    pub fn on_set<F>(&self, flag: SessionFlags, listener: F)
    where
        F: Fn(&ReactiveFlagSet, &FlagTransition) + Send + Sync + 'static,
    {
        self.register(flag, Edge::Set, Arc::new(listener));
    }

    /// Registers a listener fired when any flag in `flag` goes from set to clear.
    pub fn on_cleared<F>(&self, flag: SessionFlags, listener: F)
    where
        F: Fn(&ReactiveFlagSet, &FlagTransition) + Send + Sync + 'static,
    {
        self.register(flag, Edge::Cleared, Arc::new(listener));
    }

    fn register(&self, flag: SessionFlags, edge: Edge, listener: FlagListener) {
        self.listeners.write().push(Registration {
            flag,
            edge,
            listener,
        });
    }

    /// Commits the transition, then notifies outside the state lock.
    fn apply(&self, flags: SessionFlags, edge: Edge) -> bool {
        let (previous, current) = {
            let mut state = self.state.lock();
            let previous = *state;
            let current = match edge {
                Edge::Set => previous | flags,
                Edge::Cleared => previous - flags,
            };
            if current == previous {
                return false;
            }
            *state = current;
            (previous, current)
        };

        let changed = previous ^ current;
        trace!(%previous, %current, edge = ?edge, "Flag transition committed");
        self.notify(edge, previous, current, changed);
        true
    }

    fn notify(&self, edge: Edge, previous: SessionFlags, current: SessionFlags, changed: SessionFlags) {
        // Collect first so listeners may register further listeners.
        let to_fire: Vec<(SessionFlags, FlagListener)> = self
            .listeners
            .read()
            .iter()
            .filter(|r| r.edge == edge && r.flag.intersects(changed))
            .map(|r| (r.flag & changed, Arc::clone(&r.listener)))
            .collect();

        for (flag, listener) in to_fire {
            let transition = FlagTransition {
                previous,
                current,
                flag,
            };
            listener(self, &transition);
        }
    }
}

impl Default for ReactiveFlagSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReactiveFlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveFlagSet")
            .field("state", &self.snapshot())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
