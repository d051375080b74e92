//! # SyncEngine
//! The facade the app talks to. Construction wires the four components
//! together; the facade's own job is the glue the components deliberately
//! don't know about: mirroring locally originated ledger events to sibling
//! tabs (with echo suppression) and exposing one coherent public surface.

use std::cell::Cell;
use std::rc::Rc;

use serde_json::Value;

use crate::engine::ledger::{
    Conflict, LedgerStatus, OptimisticLedger, OptimisticUpdate, UpdateKind,
};
use crate::engine::queue::{OfflineQueue, OperationStats, QueuedOperation};
use crate::engine::scheduler::{Priority, RemoteApi, SyncScheduler};
use crate::engine::tabs::{CrossTabInfo, TabCoordinator};
use crate::error::EngineError;
use crate::events::{EngineEvent, ListenerKey};
use crate::platform::Platform;
use crate::EngineConfig;

pub struct SyncEngine {
    ledger: OptimisticLedger,
    queue: OfflineQueue,
    scheduler: SyncScheduler,
    tabs: TabCoordinator,
    platform: Platform,
    destroyed: Cell<bool>,
}

impl SyncEngine {
    pub fn new(platform: Platform, api: Rc<dyn RemoteApi>, config: EngineConfig) -> Self {
        let ledger = OptimisticLedger::new(
            platform.store.clone(),
            platform.timers.clone(),
            config.clone(),
        );
        let scheduler = SyncScheduler::new(
            api,
            platform.timers.clone(),
            platform.spawner.clone(),
            config.clone(),
        );
        let queue = OfflineQueue::new(
            platform.store.clone(),
            platform.connectivity.clone(),
            platform.timers.clone(),
            scheduler.clone(),
            Some(ledger.clone()),
            config.clone(),
        );
        let tabs = TabCoordinator::new(
            platform.transport.clone(),
            platform.timers.clone(),
            ledger.clone(),
            config,
        );

        // Locally originated ledger transitions go out to the siblings.
        // Transitions the coordinator is itself applying from a sibling do
        // not, or two tabs would ping-pong forever.
        let weak_tabs = tabs.downgrade();
        ledger.on_event(move |event| {
            if let Some(tabs) = weak_tabs.upgrade() {
                if !tabs.is_applying_remote() {
                    tabs.broadcast_ledger_event(event);
                }
            }
        });

        Self {
            ledger,
            queue,
            scheduler,
            tabs,
            platform,
            destroyed: Cell::new(false),
        }
    }

    /// Join the cross-tab channel and attach request attribution. Safe to
    /// call more than once; only the first call does anything.
    pub fn initialize(&self, user_id: Option<&str>) {
        if self.destroyed.get() {
            return;
        }
        let session_id = crate::next_id("session", self.platform.timers.now());
        self.queue
            .set_identity(user_id.map(str::to_string), Some(session_id));
        self.tabs.initialize(user_id.map(str::to_string));
        // Work left over from a previous page load can go out right away.
        self.queue.sync_pending_operations();
    }

    /// Apply an optimistic update only: rendered now, confirmed or rolled
    /// back later by whoever owns the server round trip.
    pub fn apply_update(
        &self,
        section: &str,
        kind: UpdateKind,
        data: Value,
        rollback_data: Option<Value>,
    ) -> Result<OptimisticUpdate, EngineError> {
        self.ledger.apply(section, kind, data, rollback_data)
    }

    /// Queue a network-bound operation only, with no linked ledger entry.
    pub fn queue_operation(&self, op_type: &str, data: Value) -> String {
        self.queue.queue_operation(op_type, data, None)
    }

    /// The common path: apply optimistically and queue the server write,
    /// linked so the operation's outcome confirms or rolls back the update.
    pub fn apply_and_queue(
        &self,
        section: &str,
        kind: UpdateKind,
        data: Value,
        rollback_data: Option<Value>,
        op_type: &str,
    ) -> Result<OptimisticUpdate, EngineError> {
        self.apply_and_queue_with_priority(
            section,
            kind,
            data,
            rollback_data,
            op_type,
            Priority::Normal,
        )
    }

    pub fn apply_and_queue_with_priority(
        &self,
        section: &str,
        kind: UpdateKind,
        data: Value,
        rollback_data: Option<Value>,
        op_type: &str,
        priority: Priority,
    ) -> Result<OptimisticUpdate, EngineError> {
        let update = self
            .ledger
            .apply(section, kind, data.clone(), rollback_data)?;
        self.queue
            .queue_operation_with_priority(op_type, data, Some(&update.id), priority);
        Ok(update)
    }

    /// Push application-level section data to sibling tabs.
    pub fn set_section_data(&self, section: &str, data: Value) {
        self.tabs.broadcast_section_data(section, data);
    }

    /// Ask the queue to drain now instead of waiting for a connectivity
    /// transition. No-op while offline.
    pub fn sync_now(&self) {
        self.queue.sync_pending_operations();
    }

    pub fn on_event(&self, callback: impl Fn(&EngineEvent) + 'static) -> ListenerKey {
        self.ledger.on_event(callback)
    }

    pub fn remove_listener(&self, key: ListenerKey) {
        self.ledger.listeners().unsubscribe(key);
    }

    pub fn is_online(&self) -> bool {
        self.platform.connectivity.is_online()
    }

    pub fn status(&self) -> LedgerStatus {
        self.ledger.status()
    }

    pub fn operation_stats(&self) -> OperationStats {
        self.queue.get_operation_stats()
    }

    pub fn pending_operations(&self) -> Vec<QueuedOperation> {
        self.queue.get_pending_operations()
    }

    pub fn detect_conflicts(&self) -> Vec<Conflict> {
        self.ledger.detect_conflicts()
    }

    pub fn cross_tab_info(&self) -> CrossTabInfo {
        self.tabs.get_cross_tab_info()
    }

    pub fn ledger(&self) -> &OptimisticLedger {
        &self.ledger
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn tabs(&self) -> &TabCoordinator {
        &self.tabs
    }

    /// Tear everything down, outermost first: the coordinator says goodbye
    /// while the ledger still answers, then the queue, scheduler, and ledger
    /// unhook their timers and listeners. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        self.tabs.destroy();
        self.queue.destroy();
        self.scheduler.destroy();
        self.ledger.destroy();
        log::info!("sync engine destroyed");
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("ledger", &self.ledger)
            .field("scheduler", &self.scheduler)
            .field("tabs", &self.tabs)
            .finish()
    }
}
