//! # OptimisticLedger
//! The record of every state change that was applied locally before the
//! server confirmed it. Each entry has a bounded lifecycle: applied →
//! confirmed, rolled back, or retried under a fresh id. The ledger owns the
//! confirmation-timeout timers and the garbage collection of confirmed
//! entries; it persists pending and failed state so a reload does not lose
//! track of unconfirmed work.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, SyncError};
use crate::events::{
    EngineEvent, FeedbackAction, FeedbackSeverity, ListenerKey, Listeners, UserFeedback,
};
use crate::platform::{KeyValueStore, TimerHandle, TimerHost};
use crate::EngineConfig;

const LEDGER_STORAGE_KEY: &str = "offbeat.ledger";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Add,
    Update,
    Delete,
}

/// A local state mutation applied before server confirmation, rendered
/// immediately and reversible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimisticUpdate {
    pub id: String,
    /// Logical domain the update belongs to ("favorites", "cart", ...);
    /// conflicts are grouped per section.
    pub section: String,
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    /// The optimistic payload, rendered immediately.
    pub data: Value,
    /// Payload to restore on revert. Absent means "remove" on rollback.
    pub rollback_data: Option<Value>,
    pub confirmed: bool,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedUpdate {
    pub update: OptimisticUpdate,
    pub confirmed_at: DateTime<Utc>,
}

/// Terminal state retained for inspection; never re-attempted automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedUpdate {
    pub update: OptimisticUpdate,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    ConcurrentUpdate,
}

/// Two or more unconfirmed updates targeting the same section at once. The
/// engine surfaces the conflict and resolution strategies rather than
/// silently reordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub section: String,
    pub kind: ConflictKind,
    pub updates: Vec<OptimisticUpdate>,
    /// Candidate resolutions, most recommended first. `server_wins` always
    /// leads: discard all but the most recently confirmed.
    pub strategies: Vec<ResolutionStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    ServerWins,
    LastWriteWins,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerStatus {
    /// Pending and not currently in flight at the scheduler.
    pub pending: usize,
    /// Pending with a sync attempt in flight.
    pub processing: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub total_pending: usize,
    pub can_add_more: bool,
}

/// Persisted shape. Confirmed entries are transient display state and are
/// not worth carrying across reloads; pending and failed are.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerSnapshot {
    pending: Vec<OptimisticUpdate>,
    failed: Vec<FailedUpdate>,
}

struct ArmedTimer {
    epoch: u64,
    _handle: TimerHandle,
}

struct LedgerInner {
    config: EngineConfig,
    store: Rc<dyn KeyValueStore>,
    timers: Rc<dyn TimerHost>,
    listeners: Listeners,
    pending: Vec<OptimisticUpdate>,
    confirmed: Vec<ConfirmedUpdate>,
    failed: Vec<FailedUpdate>,
    in_flight: BTreeSet<String>,
    /// Ids learned from sibling tabs. Each tab persists only its own work,
    /// so these are filtered out of every snapshot; they also get no
    /// confirmation timer (only the originating tab owns the timeout).
    remote_ids: BTreeSet<String>,
    /// Confirmation-timeout timers keyed by update id. The epoch makes a
    /// late fire a no-op even if cancellation raced the callback.
    armed: HashMap<String, ArmedTimer>,
    epoch_counter: u64,
    gc_timer: Option<TimerHandle>,
    destroyed: bool,
}

impl LedgerInner {
    /// Best-effort persistence: a storage fault degrades to in-memory-only
    /// operation and is never surfaced to the caller.
    fn save(&self) {
        let snapshot = LedgerSnapshot {
            pending: self
                .pending
                .iter()
                .filter(|u| !self.remote_ids.contains(&u.id))
                .cloned()
                .collect(),
            failed: self
                .failed
                .iter()
                .filter(|f| !self.remote_ids.contains(&f.update.id))
                .cloned()
                .collect(),
        };
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                if let Err(e) = self.store.set(LEDGER_STORAGE_KEY, &json) {
                    log::warn!("ledger persistence unavailable: {e}");
                }
            }
            Err(e) => log::error!("failed to serialize ledger snapshot: {e}"),
        }
    }

    fn push_failed(&mut self, entry: FailedUpdate) {
        if self.failed.len() >= self.config.failed_history_limit {
            self.failed.remove(0);
        }
        self.failed.push(entry);
    }
}

/// Handle to the ledger. Cheap to clone; clones share state. All methods run
/// to completion on the single-threaded event loop, so bookkeeping needs no
/// locks.
#[derive(Clone)]
pub struct OptimisticLedger {
    inner: Rc<RefCell<LedgerInner>>,
}

impl OptimisticLedger {
    pub fn new(
        store: Rc<dyn KeyValueStore>,
        timers: Rc<dyn TimerHost>,
        config: EngineConfig,
    ) -> Self {
        let snapshot = load_snapshot(store.as_ref());
        let ledger = Self {
            inner: Rc::new(RefCell::new(LedgerInner {
                config,
                store,
                timers,
                listeners: Listeners::new(),
                pending: Vec::new(),
                confirmed: Vec::new(),
                failed: snapshot.failed,
                in_flight: BTreeSet::new(),
                remote_ids: BTreeSet::new(),
                armed: HashMap::new(),
                epoch_counter: 0,
                gc_timer: None,
                destroyed: false,
            })),
        };
        // Updates recovered from a prior page load were never confirmed;
        // they re-enter pending with a fresh countdown.
        for update in snapshot.pending {
            let mut inner = ledger.inner.borrow_mut();
            let timer = ledger.arm_confirmation_timer(&mut inner, update.id.clone());
            inner.armed.insert(update.id.clone(), timer);
            inner.pending.push(update);
        }
        ledger.arm_gc(&mut ledger.inner.borrow_mut());
        ledger
    }

    /// Subscribe to the ledger's event stream. The same registry carries
    /// remote transitions ingested by the tab coordinator.
    pub fn listeners(&self) -> Listeners {
        self.inner.borrow().listeners.clone()
    }

    pub fn on_event(&self, callback: impl Fn(&EngineEvent) + 'static) -> ListenerKey {
        self.listeners().subscribe(callback)
    }

    /// Apply an optimistic update: render-now, confirm-later.
    ///
    /// Fails with a capacity error when too many updates are already
    /// awaiting confirmation, and with a destroyed error after `destroy` —
    /// both are caller bugs worth surfacing loudly.
    pub fn apply(
        &self,
        section: &str,
        kind: UpdateKind,
        data: Value,
        rollback_data: Option<Value>,
    ) -> Result<OptimisticUpdate, EngineError> {
        let max_retries = self.inner.borrow().config.default_max_retries;
        self.apply_with_retries(section, kind, data, rollback_data, max_retries)
    }

    pub fn apply_with_retries(
        &self,
        section: &str,
        kind: UpdateKind,
        data: Value,
        rollback_data: Option<Value>,
        max_retries: u32,
    ) -> Result<OptimisticUpdate, EngineError> {
        let (update, listeners) = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return Err(EngineError::Destroyed {
                    component: "optimistic ledger",
                });
            }
            if inner.pending.len() >= inner.config.max_pending_updates {
                return Err(EngineError::CapacityExceeded {
                    limit: inner.config.max_pending_updates,
                });
            }
            let now = inner.timers.now();
            let update = OptimisticUpdate {
                id: crate::next_id("opt", now),
                section: section.to_string(),
                kind,
                data,
                rollback_data,
                confirmed: false,
                timestamp: now,
                retry_count: 0,
                max_retries,
            };
            let timer = self.arm_confirmation_timer(&mut inner, update.id.clone());
            inner.armed.insert(update.id.clone(), timer);
            inner.pending.push(update.clone());
            inner.save();
            (update, inner.listeners.clone())
        };
        log::info!(
            "optimistic update {} applied to section {}",
            update.id,
            update.section
        );
        listeners.emit(&EngineEvent::Applied(update.clone()));
        Ok(update)
    }

    /// Confirm a pending update, optionally merging the authoritative server
    /// payload into its data. Unknown ids are a no-op, never an error —
    /// confirmations can legitimately arrive after a timeout rollback.
    pub fn confirm(&self, id: &str, server_data: Option<Value>) {
        let emit = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return;
            }
            let Some(pos) = inner.pending.iter().position(|u| u.id == id) else {
                return;
            };
            let mut update = inner.pending.remove(pos);
            // Cancel-then-confirm: dropping the armed timer cancels it
            // before the confirmed entry exists.
            inner.armed.remove(id);
            inner.in_flight.remove(id);
            if let Some(server) = server_data {
                merge_server_data(&mut update.data, server);
            }
            update.confirmed = true;
            let confirmed_at = inner.timers.now();
            inner.confirmed.push(ConfirmedUpdate {
                update: update.clone(),
                confirmed_at,
            });
            inner.save();
            (inner.listeners.clone(), update)
        };
        log::info!("optimistic update {id} confirmed");
        emit.0.emit(&EngineEvent::Confirmed { update: emit.1 });
    }

    /// Roll back a pending update. When `error` is retryable and budget
    /// remains, the rollback is converted into a fresh attempt under a new
    /// id instead of being treated as final. Unknown ids are a no-op.
    pub fn rollback(&self, id: &str, reason: &str, error: Option<SyncError>) {
        enum Outcome {
            Retried {
                listeners: Listeners,
                previous_id: String,
                update: OptimisticUpdate,
            },
            Final {
                listeners: Listeners,
                id: String,
            },
            Nothing,
        }

        let outcome = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                Outcome::Nothing
            } else if let Some(pos) = inner.pending.iter().position(|u| u.id == id) {
                let retryable = error.as_ref().is_some_and(|e| e.retryable);
                let budget_left =
                    inner.pending[pos].retry_count < inner.pending[pos].max_retries;
                if retryable && budget_left {
                    let update = self.retry_locked(&mut inner, pos, reason);
                    inner.save();
                    Outcome::Retried {
                        listeners: inner.listeners.clone(),
                        previous_id: id.to_string(),
                        update,
                    }
                } else {
                    let update = inner.pending.remove(pos);
                    inner.armed.remove(id);
                    inner.in_flight.remove(id);
                    let failed_at = inner.timers.now();
                    inner.push_failed(FailedUpdate {
                        update,
                        reason: reason.to_string(),
                        failed_at,
                    });
                    inner.save();
                    Outcome::Final {
                        listeners: inner.listeners.clone(),
                        id: id.to_string(),
                    }
                }
            } else {
                Outcome::Nothing
            }
        };

        match outcome {
            Outcome::Retried {
                listeners,
                previous_id,
                update,
            } => {
                log::info!(
                    "optimistic update {previous_id} retrying as {} ({reason})",
                    update.id
                );
                listeners.emit(&EngineEvent::Retry {
                    previous_id,
                    update,
                });
            }
            Outcome::Final { listeners, id } => {
                log::warn!("optimistic update {id} rolled back: {reason}");
                listeners.emit(&EngineEvent::RolledBack {
                    id: id.clone(),
                    reason: reason.to_string(),
                    error,
                });
                listeners.emit(&EngineEvent::UserFeedback(UserFeedback {
                    message: format!("A change could not be saved: {reason}"),
                    severity: FeedbackSeverity::Error,
                    actions: vec![
                        FeedbackAction::Retry { update_id: id },
                        FeedbackAction::Dismiss,
                    ],
                }));
            }
            Outcome::Nothing => {}
        }
    }

    /// Re-attempt a pending or failed update under a new id. Returns `None`
    /// when the id is unknown or the retry budget is exhausted. The identity
    /// changes; callers must track the returned id.
    pub fn retry(&self, id: &str) -> Option<OptimisticUpdate> {
        let (listeners, update) = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return None;
            }
            if let Some(pos) = inner.pending.iter().position(|u| u.id == id) {
                if inner.pending[pos].retry_count >= inner.pending[pos].max_retries {
                    return None;
                }
                let update = self.retry_locked(&mut inner, pos, "superseded by retry");
                inner.save();
                (inner.listeners.clone(), update)
            } else {
                // Retrying out of failed history leaves the history record
                // in place; the retry is a fresh entrant.
                let source = inner
                    .failed
                    .iter()
                    .rev()
                    .find(|f| f.update.id == id)?
                    .update
                    .clone();
                if source.retry_count >= source.max_retries {
                    return None;
                }
                let update = self.respawn_locked(&mut inner, source);
                inner.save();
                (inner.listeners.clone(), update)
            }
        };
        listeners.emit(&EngineEvent::Retry {
            previous_id: id.to_string(),
            update: update.clone(),
        });
        Some(update)
    }

    /// Group pending updates by section; any section with more than one
    /// concurrent pending update is a conflict.
    pub fn detect_conflicts(&self) -> Vec<Conflict> {
        let inner = self.inner.borrow();
        let mut by_section: Vec<(String, Vec<OptimisticUpdate>)> = Vec::new();
        for update in &inner.pending {
            match by_section.iter_mut().find(|(s, _)| *s == update.section) {
                Some((_, updates)) => updates.push(update.clone()),
                None => by_section.push((update.section.clone(), vec![update.clone()])),
            }
        }
        by_section
            .into_iter()
            .filter(|(_, updates)| updates.len() > 1)
            .map(|(section, updates)| Conflict {
                section,
                kind: ConflictKind::ConcurrentUpdate,
                updates,
                strategies: vec![
                    ResolutionStrategy::ServerWins,
                    ResolutionStrategy::LastWriteWins,
                    ResolutionStrategy::Manual,
                ],
            })
            .collect()
    }

    pub fn status(&self) -> LedgerStatus {
        let inner = self.inner.borrow();
        let processing = inner.in_flight.len();
        LedgerStatus {
            pending: inner.pending.len().saturating_sub(processing),
            processing,
            confirmed: inner.confirmed.len(),
            failed: inner.failed.len(),
            total_pending: inner.pending.len(),
            can_add_more: inner.pending.len() < inner.config.max_pending_updates,
        }
    }

    pub fn pending_updates(&self) -> Vec<OptimisticUpdate> {
        self.inner.borrow().pending.clone()
    }

    pub fn confirmed_updates(&self) -> Vec<ConfirmedUpdate> {
        self.inner.borrow().confirmed.clone()
    }

    pub fn failed_updates(&self) -> Vec<FailedUpdate> {
        self.inner.borrow().failed.clone()
    }

    /// Ingest an update applied by a sibling tab: it enters pending locally
    /// but gets no confirmation timer (only the originating tab owns the
    /// timeout) and is not persisted (each tab persists only its own work).
    pub(crate) fn ingest_remote(&self, update: OptimisticUpdate) {
        let emit = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed || inner.pending.iter().any(|u| u.id == update.id) {
                return;
            }
            inner.remote_ids.insert(update.id.clone());
            inner.pending.push(update.clone());
            inner.listeners.clone()
        };
        emit.emit(&EngineEvent::Applied(update));
    }

    /// Silently drop a pending entry that a sibling tab superseded (its
    /// retry lives under a new id there). No events, no persistence.
    pub(crate) fn remove_remote(&self, id: &str) {
        let mut inner = self.inner.borrow_mut();
        if let Some(pos) = inner.pending.iter().position(|u| u.id == id) {
            inner.pending.remove(pos);
            inner.armed.remove(id);
            inner.in_flight.remove(id);
            inner.remote_ids.remove(id);
        }
    }

    pub(crate) fn set_in_flight(&self, id: &str, in_flight: bool) {
        let mut inner = self.inner.borrow_mut();
        if in_flight {
            if inner.pending.iter().any(|u| u.id == id) {
                inner.in_flight.insert(id.to_string());
            }
        } else {
            inner.in_flight.remove(id);
        }
    }

    /// Purge confirmed entries older than the retention window. Runs on a
    /// periodic timer; callable directly by hosts that manage their own
    /// cadence.
    pub fn sweep(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.destroyed {
            return;
        }
        let cutoff = inner.timers.now() - crate::chrono_duration(inner.config.confirmed_retention);
        let before = inner.confirmed.len();
        inner.confirmed.retain(|c| c.confirmed_at > cutoff);
        let purged = before - inner.confirmed.len();
        if purged > 0 {
            log::debug!("garbage-collected {purged} confirmed updates");
        }
        self.arm_gc(&mut inner);
    }

    /// Idempotent. Cancels every timer synchronously; later `apply` calls
    /// fail with a destroyed error.
    pub fn destroy(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        inner.armed.clear();
        inner.gc_timer = None;
        inner.in_flight.clear();
        inner.remote_ids.clear();
        inner.listeners.clear();
    }

    /// Move `pending[pos]` to failed history and install a successor with a
    /// fresh id and an incremented retry count.
    fn retry_locked(
        &self,
        inner: &mut LedgerInner,
        pos: usize,
        reason: &str,
    ) -> OptimisticUpdate {
        let old = inner.pending.remove(pos);
        inner.armed.remove(&old.id);
        inner.in_flight.remove(&old.id);
        let failed_at = inner.timers.now();
        let source = old.clone();
        inner.push_failed(FailedUpdate {
            update: old,
            reason: reason.to_string(),
            failed_at,
        });
        self.respawn_locked(inner, source)
    }

    fn respawn_locked(&self, inner: &mut LedgerInner, source: OptimisticUpdate) -> OptimisticUpdate {
        let now = inner.timers.now();
        let update = OptimisticUpdate {
            id: crate::next_id("opt", now),
            timestamp: now,
            confirmed: false,
            retry_count: source.retry_count + 1,
            ..source
        };
        let timer = self.arm_confirmation_timer(inner, update.id.clone());
        inner.armed.insert(update.id.clone(), timer);
        inner.pending.push(update.clone());
        update
    }

    fn arm_confirmation_timer(&self, inner: &mut LedgerInner, id: String) -> ArmedTimer {
        inner.epoch_counter += 1;
        let epoch = inner.epoch_counter;
        let weak = Rc::downgrade(&self.inner);
        let timer_id = id.clone();
        let handle = inner.timers.set_timeout(
            inner.config.confirmation_timeout,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let ledger = OptimisticLedger { inner };
                    ledger.confirmation_timed_out(&timer_id, epoch);
                }
            }),
        );
        ArmedTimer {
            epoch,
            _handle: handle,
        }
    }

    fn confirmation_timed_out(&self, id: &str, epoch: u64) {
        {
            let inner = self.inner.borrow();
            if inner.destroyed {
                return;
            }
            // A stale epoch means the entry was confirmed/retried and the
            // cancellation raced this callback; treat as already handled.
            match inner.armed.get(id) {
                Some(armed) if armed.epoch == epoch => {}
                _ => return,
            }
        }
        self.rollback(id, "confirmation timeout", None);
    }

    fn arm_gc(&self, inner: &mut LedgerInner) {
        let weak = Rc::downgrade(&self.inner);
        inner.gc_timer = Some(inner.timers.set_timeout(
            inner.config.gc_interval,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    OptimisticLedger { inner }.sweep();
                }
            }),
        ));
    }
}

impl std::fmt::Debug for OptimisticLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("OptimisticLedger")
            .field("status", &status)
            .finish()
    }
}

fn load_snapshot(store: &dyn KeyValueStore) -> LedgerSnapshot {
    let Some(json) = store.get(LEDGER_STORAGE_KEY) else {
        return LedgerSnapshot::default();
    };
    serde_json::from_str(&json).unwrap_or_else(|e| {
        // Corrupt storage degrades to an empty ledger rather than failing
        // construction.
        log::warn!("discarding unreadable ledger snapshot: {e}");
        LedgerSnapshot::default()
    })
}

/// Replace `data` with the server payload, field-merging when both sides are
/// objects so server-supplied fields (ids, syncedAt) land on top of the
/// optimistic ones.
fn merge_server_data(data: &mut Value, server: Value) {
    match (data.as_object_mut(), server) {
        (Some(target), Value::Object(fields)) => {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }
        (_, server) => *data = server,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::{ManualTimers, MemoryStore};
    use serde_json::json;

    fn ledger() -> (OptimisticLedger, Rc<ManualTimers>) {
        let timers = Rc::new(ManualTimers::new());
        let store = Rc::new(MemoryStore::new());
        let ledger = OptimisticLedger::new(store, timers.clone(), EngineConfig::default());
        (ledger, timers)
    }

    #[test]
    fn apply_generates_unique_ids() {
        let (ledger, _timers) = ledger();
        let a = ledger
            .apply("favorites", UpdateKind::Add, json!({"id": 1}), None)
            .unwrap();
        let b = ledger
            .apply("favorites", UpdateKind::Add, json!({"id": 2}), None)
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn merge_prefers_server_fields() {
        let mut data = json!({"id": "fav-1", "name": "local"});
        merge_server_data(&mut data, json!({"name": "server", "synced_at": 7}));
        assert_eq!(data, json!({"id": "fav-1", "name": "server", "synced_at": 7}));
    }

    #[test]
    fn merge_replaces_non_object_payloads() {
        let mut data = json!([1, 2, 3]);
        merge_server_data(&mut data, json!({"ok": true}));
        assert_eq!(data, json!({"ok": true}));
    }

    #[test]
    fn recovered_pending_updates_get_fresh_timers() {
        let timers = Rc::new(ManualTimers::new());
        let store = Rc::new(MemoryStore::new());
        {
            let ledger = OptimisticLedger::new(
                store.clone(),
                timers.clone(),
                EngineConfig::default(),
            );
            ledger
                .apply("cart", UpdateKind::Add, json!({"sku": "b1"}), None)
                .unwrap();
        }
        let revived = OptimisticLedger::new(store, timers, EngineConfig::default());
        assert_eq!(revived.status().total_pending, 1);
    }

    #[test]
    fn snapshots_exclude_entries_learned_from_siblings() {
        let timers = Rc::new(ManualTimers::new());
        let store = Rc::new(MemoryStore::new());
        let ledger =
            OptimisticLedger::new(store.clone(), timers.clone(), EngineConfig::default());
        ledger
            .apply("cart", UpdateKind::Add, json!({"sku": "b1"}), None)
            .unwrap();
        ledger.ingest_remote(OptimisticUpdate {
            id: "opt-foreign-0".to_string(),
            section: "cart".to_string(),
            kind: UpdateKind::Add,
            data: json!({"sku": "b2"}),
            rollback_data: None,
            confirmed: false,
            timestamp: timers.now(),
            retry_count: 0,
            max_retries: 3,
        });
        // A later local transition persists the ledger while the foreign
        // entry is still live.
        ledger
            .apply("cart", UpdateKind::Add, json!({"sku": "b3"}), None)
            .unwrap();
        assert_eq!(ledger.status().total_pending, 3);
        drop(ledger);

        // Only this tab's own work comes back on reload.
        let revived = OptimisticLedger::new(store, timers, EngineConfig::default());
        let pending = revived.pending_updates();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|u| u.id != "opt-foreign-0"));
    }
}
