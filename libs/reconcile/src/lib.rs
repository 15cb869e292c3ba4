//! Port-forward reconciliation primitives.
//!
//! This library holds the I/O-free half of the forwarding engine: it turns a
//! snapshot of the guest's listening sockets plus static configuration into
//! an ordered list of add/remove actions against the recorded forward table.
//!
//! - **Desired state**: pinned static forwards plus discovered guest sockets
//!   that survive the ignore rules, remapped to their host endpoints.
//! - **Actual state**: the [`ForwardTable`], updated only from confirmed
//!   control-connection mutations.
//! - **Convergence**: repeated [`Reconciler::plan`] calls until the plan is
//!   empty.
//!
//! # Invariants
//!
//! - Planning is deterministic given the same inputs
//! - An unchanged desired set produces an empty plan
//! - At most one forward holds a host endpoint; the lower configuration
//!   order wins
//! - Discovered forwards are removed only after the grace period; pinned
//!   forwards never by discovery absence

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use thiserror::Error;

pub mod health;
pub mod plan;
pub mod store;
pub mod table;
pub mod types;

pub use health::{InstanceHealth, UnavailableReason};
pub use plan::{Action, Conflict, ConflictKind, DesiredSet, ReconcilePlan, Reconciler, ReconcilerConfig};
pub use store::{AddressPattern, DesiredStateStore, PortRange, PortRule, RuleAction};
pub use table::{ForwardPhase, ForwardState, ForwardTable};
pub use types::{
    ForwardKey, ForwardRule, GuestSocket, GuestSocketSnapshot, HostEndpoint, Origin, PortSpec,
    Protocol, SocketTarget,
};

/// Errors parsing configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown protocol: {0}")]
    Protocol(String),

    #[error("invalid address pattern: {0}")]
    Address(String),
}

/// Failure tracker for repeated operations.
///
/// Counts failures per key inside a sliding window. Used to decide when
/// repeated control-connection re-establishment failures mean the instance
/// is persistently unavailable.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Failures tolerated inside the window.
    max_retries: u32,

    window: Duration,

    /// key -> (count, first failure in the current window).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure. Returns true once the key is exhausted.
    pub fn record_failure(&mut self, key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(key.to_string())
            .or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count >= self.max_retries
    }

    pub fn is_exhausted(&self, key: &str) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count >= self.max_retries
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|(c, _)| *c).unwrap_or(0)
    }

    /// Forget failures for a key (on success).
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

/// Default tick interval of the reconciliation loop.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(3);

/// Default number of fresh ticks a discovered forward may be missing.
pub const DEFAULT_GRACE_TICKS: u32 = 2;

/// Default retry bound for a transient mutation failure.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default consecutive re-establishment failures before reporting the
/// control connection as lost.
pub const DEFAULT_REESTABLISH_LIMIT: u32 = 3;

/// Default window for counting re-establishment failures.
pub const DEFAULT_REESTABLISH_WINDOW: Duration = Duration::from_secs(5 * 60);
