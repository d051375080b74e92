//! This is a library for letting a browser app keep working while offline.
//! State changes are applied immediately ("optimistically") before the server
//! confirms them, queued durably while disconnected, and reconciled once
//! connectivity returns. Open tabs of the same app converge without a shared
//! process.
//!
//! How it fits together:
//! 1. A user action produces an optimistic update in the [`OptimisticLedger`]:
//!    rendered immediately, reversible, unconfirmed until the server round
//!    trip succeeds.
//! 2. If the action needs network persistence, it is also queued in the
//!    [`OfflineQueue`], which persists it before acknowledging and drains it
//!    when the connectivity signal says we are online.
//! 3. The [`SyncScheduler`] is the single choke point to the network: it
//!    orders ready requests by priority, caps concurrent in-flight requests,
//!    and retries retryable failures with exponential backoff. Terminal
//!    outcomes confirm or roll back the matching ledger entry.
//! 4. The [`TabCoordinator`] mirrors every locally-visible transition to
//!    sibling tabs over a broadcast channel and ingests theirs, so all tabs
//!    converge without a server round trip.
//!
//! Sounds simple, but there are a few tricky parts this library handles:
//! late confirmation racing a timeout rollback, retry budgets, echo
//! suppression between tabs, and storage that can fail at any time.
//!
//! The engine never touches the browser directly. It consumes four narrow
//! capabilities ([`platform::KeyValueStore`], [`platform::BroadcastTransport`],
//! [`platform::ConnectivitySource`], [`platform::TimerHost`]) so a
//! non-browser host (tests, a different runtime) can supply in-memory
//! implementations without code changes. Browser-backed implementations live
//! behind the `web` feature.

pub mod engine;
pub mod error;
pub mod events;
pub mod platform;

pub use engine::{
    Conflict, ConflictKind, CrossTabInfo, FailedUpdate, LedgerStatus, MessageKind, OfflineQueue,
    OperationStats, OperationStatus, OptimisticLedger, OptimisticUpdate, Priority, QueuedOperation,
    RemoteApi, ResolutionStrategy, SyncEngine, SyncOutcome, SyncRequest, SyncScheduler,
    TabCoordinator, TabLifecycle, TabMessage, TabState, UpdateKind,
};
pub use error::{EngineError, PlatformError, SyncError};
pub use events::{EngineEvent, FeedbackAction, FeedbackSeverity, ListenerKey, UserFeedback};
pub use platform::Platform;

use std::cell::Cell;
use std::time::Duration;

/// Every tunable in one place. The defaults are what the engine ships with;
/// hosts override individual fields.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Upper bound on unconfirmed optimistic updates before `apply` starts
    /// rejecting with a capacity error.
    pub max_pending_updates: usize,
    /// How long an applied update may wait for confirmation before it is
    /// force-rolled-back.
    pub confirmation_timeout: Duration,
    /// Confirmed entries older than this are purged on the next sweep.
    pub confirmed_retention: Duration,
    /// Interval between garbage-collection sweeps of confirmed entries.
    pub gc_interval: Duration,
    /// Retry budget used when the caller does not specify one.
    pub default_max_retries: u32,
    /// First retry delay; doubles per failed attempt.
    pub backoff_base: Duration,
    /// Cap on concurrent in-flight requests at the scheduler.
    pub max_concurrent: usize,
    /// How often a tab re-announces itself to its siblings.
    pub heartbeat_interval: Duration,
    /// A sibling tab unseen for longer than this is considered gone.
    pub active_window: Duration,
    /// Failed-history entries kept for inspection.
    pub failed_history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pending_updates: 50,
            confirmation_timeout: Duration::from_secs(5),
            confirmed_retention: Duration::from_secs(60),
            gc_interval: Duration::from_secs(30),
            default_max_retries: 3,
            backoff_base: Duration::from_secs(1),
            max_concurrent: 3,
            heartbeat_interval: Duration::from_secs(5),
            active_window: Duration::from_secs(15),
            failed_history_limit: 50,
        }
    }
}

thread_local! {
    static ID_COUNTER: Cell<u64> = const { Cell::new(0) };
}

/// Generate an id that is monotonic-ish and collision-free within a tab:
/// wall-clock millis plus a per-tab counter.
pub(crate) fn next_id(prefix: &str, now: chrono::DateTime<chrono::Utc>) -> String {
    let seq = ID_COUNTER.with(|c| {
        let v = c.get();
        c.set(v + 1);
        v
    });
    format!("{prefix}-{}-{seq}", now.timestamp_millis())
}

/// Entropy for tab ids, which must not collide across tabs opened in the
/// same millisecond. `RandomState` seeds from the host's randomness without
/// pulling in a dependency.
pub(crate) fn tab_entropy() -> u64 {
    use std::hash::{BuildHasher, Hasher};
    std::collections::hash_map::RandomState::new()
        .build_hasher()
        .finish()
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}
