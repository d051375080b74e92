//! The engine's four components, built bottom-up: the ledger records
//! applied-but-unconfirmed changes, the queue makes network-bound work
//! durable, the scheduler moves it to the server, and the tab coordinator
//! keeps sibling tabs convergent. `5-engine.rs` wires them together.

#[path = "1-ledger.rs"]
mod ledger;
#[path = "2-queue.rs"]
mod queue;
#[path = "3-scheduler.rs"]
mod scheduler;
#[path = "4-tabs.rs"]
mod tabs;
#[path = "5-engine.rs"]
mod facade;

pub use facade::SyncEngine;
pub use ledger::{
    Conflict, ConflictKind, ConfirmedUpdate, FailedUpdate, LedgerStatus, OptimisticLedger,
    OptimisticUpdate, ResolutionStrategy, UpdateKind,
};
pub use queue::{OfflineQueue, OperationStats, OperationStatus, QueuedOperation};
pub use scheduler::{
    OutcomeKey, Priority, RemoteApi, SyncOutcome, SyncRequest, SyncScheduler,
};
pub use tabs::{CrossTabInfo, MessageKind, TabCoordinator, TabLifecycle, TabMessage, TabState};
