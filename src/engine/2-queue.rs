//! # OfflineQueue
//! Durable FIFO-ish queue of operations that must eventually reach the
//! server. An operation is persisted before `queue_operation` returns and
//! only leaves the durable store once the scheduler reports a definitive
//! success or the retry budget is exhausted (`failed` is terminal but kept
//! for inspection). The queue subscribes to the connectivity signal and
//! drains itself whenever the app comes back online.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::ledger::OptimisticLedger;
use crate::engine::scheduler::{OutcomeKey, Priority, SyncOutcome, SyncRequest, SyncScheduler};
use crate::platform::{ConnectivitySource, KeyValueStore, SubscriptionHandle, TimerHost};
use crate::EngineConfig;

const QUEUE_STORAGE_KEY: &str = "offbeat.queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: String,
    pub data: Value,
    /// The optimistic update this operation settles, when there is one.
    pub update_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub status: OperationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperationStats {
    pub total: usize,
    pub pending: usize,
    pub syncing: usize,
    pub completed: usize,
    pub failed: usize,
}

struct QueueInner {
    store: Rc<dyn KeyValueStore>,
    connectivity: Rc<dyn ConnectivitySource>,
    timers: Rc<dyn TimerHost>,
    scheduler: SyncScheduler,
    /// Loose coupling: when present, drained operations are marked
    /// processing on the ledger so its status stays truthful.
    ledger: Option<OptimisticLedger>,
    config: EngineConfig,
    operations: Vec<QueuedOperation>,
    online_callbacks: Vec<(u64, Rc<dyn Fn()>)>,
    offline_callbacks: Vec<(u64, Rc<dyn Fn()>)>,
    next_callback: u64,
    user_id: Option<String>,
    session_id: Option<String>,
    _connectivity_sub: Option<SubscriptionHandle>,
    outcome_key: Option<OutcomeKey>,
    destroyed: bool,
}

impl QueueInner {
    fn save(&self) {
        match serde_json::to_string(&self.operations) {
            Ok(json) => {
                if let Err(e) = self.store.set(QUEUE_STORAGE_KEY, &json) {
                    log::warn!("queue persistence unavailable: {e}");
                }
            }
            Err(e) => log::error!("failed to serialize operation queue: {e}"),
        }
    }
}

/// Handle to the queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Rc<RefCell<QueueInner>>,
}

impl OfflineQueue {
    pub fn new(
        store: Rc<dyn KeyValueStore>,
        connectivity: Rc<dyn ConnectivitySource>,
        timers: Rc<dyn TimerHost>,
        scheduler: SyncScheduler,
        ledger: Option<OptimisticLedger>,
        config: EngineConfig,
    ) -> Self {
        // Operations persisted by a prior page load come back; anything
        // that was mid-sync when the page died restarts from pending.
        let mut operations = load_operations(store.as_ref());
        for op in &mut operations {
            if op.status == OperationStatus::Syncing {
                op.status = OperationStatus::Pending;
            }
        }
        if !operations.is_empty() {
            log::info!("recovered {} queued operations", operations.len());
        }

        let queue = Self {
            inner: Rc::new(RefCell::new(QueueInner {
                store,
                connectivity,
                timers,
                scheduler,
                ledger,
                config,
                operations,
                online_callbacks: Vec::new(),
                offline_callbacks: Vec::new(),
                next_callback: 0,
                user_id: None,
                session_id: None,
                _connectivity_sub: None,
                outcome_key: None,
                destroyed: false,
            })),
        };

        let weak = Rc::downgrade(&queue.inner);
        let sub = queue
            .inner
            .borrow()
            .connectivity
            .subscribe(Box::new(move |online| {
                if let Some(inner) = weak.upgrade() {
                    OfflineQueue { inner }.connectivity_changed(online);
                }
            }));

        let weak = Rc::downgrade(&queue.inner);
        let outcome_key = queue
            .inner
            .borrow()
            .scheduler
            .on_outcome(move |outcome| {
                if let Some(inner) = weak.upgrade() {
                    OfflineQueue { inner }.outcome_received(outcome);
                }
            });

        {
            let mut inner = queue.inner.borrow_mut();
            inner._connectivity_sub = Some(sub);
            inner.outcome_key = Some(outcome_key);
        }
        queue
    }

    /// Attribution carried on every request this queue hands the scheduler.
    pub fn set_identity(&self, user_id: Option<String>, session_id: Option<String>) {
        let mut inner = self.inner.borrow_mut();
        inner.user_id = user_id;
        inner.session_id = session_id;
    }

    /// Persist the operation, then drain immediately if online. Never
    /// throws: a storage fault degrades to memory-only queueing.
    pub fn queue_operation(
        &self,
        op_type: &str,
        data: Value,
        update_id: Option<&str>,
    ) -> String {
        self.queue_operation_with_priority(op_type, data, update_id, Priority::Normal)
    }

    pub fn queue_operation_with_priority(
        &self,
        op_type: &str,
        data: Value,
        update_id: Option<&str>,
        priority: Priority,
    ) -> String {
        let (id, online) = {
            let mut inner = self.inner.borrow_mut();
            let now = inner.timers.now();
            let op = QueuedOperation {
                id: crate::next_id("op", now),
                op_type: op_type.to_string(),
                data,
                update_id: update_id.map(str::to_string),
                priority,
                timestamp: now,
                retry_count: 0,
                status: OperationStatus::Pending,
            };
            let id = op.id.clone();
            inner.operations.push(op);
            inner.save();
            (id, inner.connectivity.is_online())
        };
        log::info!("queued operation {id} ({op_type})");
        if online {
            self.sync_pending_operations();
        }
        id
    }

    /// Hand every pending operation to the scheduler, in enqueue order.
    /// No-op while offline or after destruction.
    pub fn sync_pending_operations(&self) {
        let requests = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed || !inner.connectivity.is_online() {
                return;
            }
            let user_id = inner.user_id.clone();
            let session_id = inner.session_id.clone();
            let default_max_retries = inner.config.default_max_retries;
            let mut requests = Vec::new();
            for op in &mut inner.operations {
                if op.status != OperationStatus::Pending {
                    continue;
                }
                op.status = OperationStatus::Syncing;
                requests.push((
                    SyncRequest {
                        operation_id: op.id.clone(),
                        op_type: op.op_type.clone(),
                        payload: op.data.clone(),
                        priority: op.priority,
                        max_retries: default_max_retries,
                        user_id: user_id.clone(),
                        session_id: session_id.clone(),
                    },
                    op.update_id.clone(),
                ));
            }
            if requests.is_empty() {
                return;
            }
            inner.save();
            requests
        };

        log::info!("draining {} pending operations", requests.len());
        let (scheduler, ledger) = {
            let inner = self.inner.borrow();
            (inner.scheduler.clone(), inner.ledger.clone())
        };
        for (request, update_id) in requests {
            if let (Some(ledger), Some(update_id)) = (&ledger, &update_id) {
                ledger.set_in_flight(update_id, true);
            }
            scheduler.schedule_sync(request);
        }
    }

    pub fn get_pending_operations(&self) -> Vec<QueuedOperation> {
        self.inner
            .borrow()
            .operations
            .iter()
            .filter(|op| {
                matches!(
                    op.status,
                    OperationStatus::Pending | OperationStatus::Syncing
                )
            })
            .cloned()
            .collect()
    }

    pub fn operation(&self, id: &str) -> Option<QueuedOperation> {
        self.inner
            .borrow()
            .operations
            .iter()
            .find(|op| op.id == id)
            .cloned()
    }

    pub fn get_operation_stats(&self) -> OperationStats {
        let inner = self.inner.borrow();
        let mut stats = OperationStats {
            total: inner.operations.len(),
            ..Default::default()
        };
        for op in &inner.operations {
            match op.status {
                OperationStatus::Pending => stats.pending += 1,
                OperationStatus::Syncing => stats.syncing += 1,
                OperationStatus::Completed => stats.completed += 1,
                OperationStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Drop completed operations from memory and storage. Never throws.
    pub fn clear_completed_operations(&self) {
        let mut inner = self.inner.borrow_mut();
        let before = inner.operations.len();
        inner
            .operations
            .retain(|op| op.status != OperationStatus::Completed);
        if inner.operations.len() != before {
            inner.save();
        }
    }

    /// Registration never throws; duplicate callbacks are fine. Remove with
    /// [`OfflineQueue::remove_callback`].
    pub fn on_online(&self, callback: impl Fn() + 'static) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let key = inner.next_callback;
        inner.next_callback += 1;
        inner.online_callbacks.push((key, Rc::new(callback)));
        key
    }

    pub fn on_offline(&self, callback: impl Fn() + 'static) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let key = inner.next_callback;
        inner.next_callback += 1;
        inner.offline_callbacks.push((key, Rc::new(callback)));
        key
    }

    pub fn remove_callback(&self, key: u64) {
        let mut inner = self.inner.borrow_mut();
        inner.online_callbacks.retain(|(k, _)| *k != key);
        inner.offline_callbacks.retain(|(k, _)| *k != key);
    }

    /// Idempotent teardown: unhooks the connectivity signal and the
    /// scheduler outcome handler synchronously.
    pub fn destroy(&self) {
        let (sub, outcome) = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            inner.online_callbacks.clear();
            inner.offline_callbacks.clear();
            (
                inner._connectivity_sub.take(),
                inner.outcome_key.take().map(|k| (inner.scheduler.clone(), k)),
            )
        };
        drop(sub);
        if let Some((scheduler, key)) = outcome {
            scheduler.remove_outcome_handler(key);
        }
    }

    fn connectivity_changed(&self, online: bool) {
        let callbacks: Vec<Rc<dyn Fn()>> = {
            let inner = self.inner.borrow();
            if inner.destroyed {
                return;
            }
            let list = if online {
                &inner.online_callbacks
            } else {
                &inner.offline_callbacks
            };
            list.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in callbacks {
            callback();
        }
        if online {
            log::info!("connection restored; draining queue");
            self.sync_pending_operations();
        } else {
            log::info!("connection lost; queueing locally");
        }
    }

    /// A definitive result came back from the scheduler: record it on the
    /// operation, then settle the linked ledger entry. Settlement runs
    /// outside the borrow because confirm/rollback emit events.
    fn outcome_received(&self, outcome: &SyncOutcome) {
        let settle = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return;
            }
            let ledger = inner.ledger.clone();
            let Some(op) = inner
                .operations
                .iter_mut()
                .find(|op| op.id == outcome.operation_id)
            else {
                return;
            };
            op.retry_count = outcome.attempts.saturating_sub(1);
            op.status = match outcome.result {
                Ok(_) => OperationStatus::Completed,
                Err(_) => OperationStatus::Failed,
            };
            let update_id = op.update_id.clone();
            inner.save();
            ledger.zip(update_id)
        };
        if let Some((ledger, update_id)) = settle {
            match &outcome.result {
                Ok(value) => ledger.confirm(&update_id, Some(value.clone())),
                // Errors surfacing here are terminal (the scheduler spent
                // the network retry budget), so this rollback is final.
                Err(error) => ledger.rollback(&update_id, "sync failed", Some(error.clone())),
            }
        }
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("stats", &self.get_operation_stats())
            .finish()
    }
}

fn load_operations(store: &dyn KeyValueStore) -> Vec<QueuedOperation> {
    let Some(json) = store.get(QUEUE_STORAGE_KEY) else {
        return Vec::new();
    };
    serde_json::from_str(&json).unwrap_or_else(|e| {
        log::warn!("discarding unreadable operation queue: {e}");
        Vec::new()
    })
}
