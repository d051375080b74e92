//! End-to-end tests over the in-memory platform: a virtual clock drives
//! timers, a hand-flipped flag drives connectivity, a local hub stands in
//! for the broadcast channel, and a `LocalPool` executes sync attempts.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use futures::executor::LocalPool;
use futures::future::{FutureExt, LocalBoxFuture};
use serde_json::{json, Value};

use offbeat::platform::memory::{ManualConnectivity, ManualTimers, MemoryHub, MemoryStore};
use offbeat::{
    EngineConfig, EngineError, EngineEvent, FeedbackSeverity, MessageKind, OperationStatus,
    Platform, Priority, RemoteApi, ResolutionStrategy, SyncEngine, SyncError, SyncRequest,
    UpdateKind,
};

/// A scripted server. Results are consumed in order; once the script runs
/// out, every call succeeds with `{"ok": true}`.
struct FakeRemoteApi {
    script: RefCell<VecDeque<Result<Value, SyncError>>>,
    calls: RefCell<Vec<SyncRequest>>,
}

impl FakeRemoteApi {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            script: RefCell::new(VecDeque::new()),
            calls: RefCell::new(Vec::new()),
        })
    }

    fn push(&self, result: Result<Value, SyncError>) {
        self.script.borrow_mut().push_back(result);
    }

    fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }

    fn call_types(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|r| r.op_type.clone()).collect()
    }
}

impl RemoteApi for FakeRemoteApi {
    fn execute(&self, request: &SyncRequest) -> LocalBoxFuture<'static, Result<Value, SyncError>> {
        self.calls.borrow_mut().push(request.clone());
        let result = self
            .script
            .borrow_mut()
            .pop_front()
            .unwrap_or(Ok(json!({"ok": true})));
        futures::future::ready(result).boxed_local()
    }
}

/// Shared test world: one clock, one connectivity flag, one broadcast hub,
/// one executor. Each [`World::tab`] gets its own storage and server script,
/// like a real browser tab.
struct World {
    hub: MemoryHub,
    timers: Rc<ManualTimers>,
    connectivity: ManualConnectivity,
    pool: RefCell<LocalPool>,
}

struct Tab {
    engine: SyncEngine,
    api: Rc<FakeRemoteApi>,
    store: Rc<MemoryStore>,
    endpoint: u64,
}

impl World {
    fn new(online: bool) -> Self {
        Self {
            hub: MemoryHub::new(),
            timers: Rc::new(ManualTimers::new()),
            connectivity: ManualConnectivity::new(online),
            pool: RefCell::new(LocalPool::new()),
        }
    }

    fn tab(&self) -> Tab {
        self.tab_with(EngineConfig::default(), Rc::new(MemoryStore::new()))
    }

    fn tab_with(&self, config: EngineConfig, store: Rc<MemoryStore>) -> Tab {
        let transport = self.hub.endpoint();
        let endpoint = transport.endpoint_id();
        let api = FakeRemoteApi::new();
        let platform = Platform {
            store: store.clone(),
            transport: Rc::new(transport),
            connectivity: Rc::new(self.connectivity.clone()),
            timers: self.timers.clone(),
            spawner: Rc::new(self.pool.borrow().spawner()),
        };
        Tab {
            engine: SyncEngine::new(platform, api.clone(), config),
            api,
            store,
            endpoint,
        }
    }

    /// Drive every spawned sync attempt to completion.
    fn run(&self) {
        self.pool.borrow_mut().run_until_stalled();
    }
}

fn collect_events(engine: &SyncEngine) -> Rc<RefCell<Vec<EngineEvent>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    engine.on_event(move |event| sink.borrow_mut().push(event.clone()));
    events
}

fn rollback_count(events: &RefCell<Vec<EngineEvent>>) -> usize {
    events
        .borrow()
        .iter()
        .filter(|e| matches!(e, EngineEvent::RolledBack { .. }))
        .count()
}

#[test]
fn apply_rejects_past_capacity() {
    let world = World::new(false);
    let tab = world.tab_with(
        EngineConfig {
            max_pending_updates: 3,
            ..Default::default()
        },
        Rc::new(MemoryStore::new()),
    );
    for i in 0..3 {
        tab.engine
            .apply_update("favorites", UpdateKind::Add, json!({"id": i}), None)
            .unwrap();
    }
    let err = tab
        .engine
        .apply_update("favorites", UpdateKind::Add, json!({"id": 3}), None)
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { limit: 3 }));
    assert!(!tab.engine.status().can_add_more);
}

#[test]
fn confirm_settles_exactly_once() {
    let world = World::new(false);
    let tab = world.tab();
    let update = tab
        .engine
        .apply_update("favorites", UpdateKind::Add, json!({"name": "a"}), None)
        .unwrap();
    tab.engine.ledger().confirm(&update.id, None);
    assert_eq!(tab.engine.status().total_pending, 0);
    assert_eq!(tab.engine.status().confirmed, 1);

    // A duplicate confirmation is a harmless no-op.
    tab.engine.ledger().confirm(&update.id, None);
    assert_eq!(tab.engine.status().confirmed, 1);
}

#[test]
fn rollback_of_unknown_id_is_a_no_op() {
    let world = World::new(false);
    let tab = world.tab();
    let events = collect_events(&tab.engine);
    tab.engine.ledger().rollback("opt-nope", "whatever", None);
    assert_eq!(rollback_count(&events), 0);
    assert_eq!(tab.engine.status().failed, 0);
}

#[test]
fn confirmation_timeout_rolls_back_exactly_once() {
    let world = World::new(false);
    let tab = world.tab();
    let events = collect_events(&tab.engine);
    tab.engine
        .apply_update("cart", UpdateKind::Add, json!({"sku": "b1"}), None)
        .unwrap();

    // Just short of the deadline nothing happens.
    world.timers.advance(Duration::from_millis(4_999));
    assert_eq!(rollback_count(&events), 0);

    world.timers.advance(Duration::from_millis(1));
    assert_eq!(rollback_count(&events), 1);
    assert_eq!(tab.engine.status().failed, 1);

    // More time produces no second rollback.
    world.timers.advance(Duration::from_secs(60));
    assert_eq!(rollback_count(&events), 1);
}

#[test]
fn late_confirmation_after_timeout_is_ignored() {
    let world = World::new(false);
    let tab = world.tab();
    let update = tab
        .engine
        .apply_update("cart", UpdateKind::Add, json!({"sku": "b1"}), None)
        .unwrap();
    world.timers.advance(Duration::from_secs(6));
    assert_eq!(tab.engine.status().failed, 1);

    tab.engine.ledger().confirm(&update.id, None);
    assert_eq!(tab.engine.status().confirmed, 0);
    assert_eq!(tab.engine.status().failed, 1);
}

#[test]
fn retryable_rollback_respawns_until_budget_is_spent() {
    let world = World::new(false);
    let tab = world.tab();
    let events = collect_events(&tab.engine);
    let update = tab
        .engine
        .apply_update("favorites", UpdateKind::Add, json!({"name": "a"}), None)
        .unwrap();
    assert_eq!(update.max_retries, 3);

    let mut current = update.id.clone();
    for _ in 0..3 {
        tab.engine
            .ledger()
            .rollback(&current, "flaky network", Some(SyncError::network("boom")));
        let retried = events
            .borrow()
            .iter()
            .rev()
            .find_map(|e| match e {
                EngineEvent::Retry { update, .. } => Some(update.clone()),
                _ => None,
            })
            .expect("budget remained, so the rollback should retry");
        assert_ne!(retried.id, current);
        current = retried.id;
    }

    // Budget spent: the fourth failure is final.
    tab.engine
        .ledger()
        .rollback(&current, "flaky network", Some(SyncError::network("boom")));
    assert_eq!(rollback_count(&events), 1);
    assert!(tab.engine.ledger().retry(&current).is_none());
}

#[test]
fn concurrent_updates_in_one_section_are_a_conflict() {
    let world = World::new(false);
    let tab = world.tab();
    for i in 0..3 {
        tab.engine
            .apply_update("favorites", UpdateKind::Update, json!({"rank": i}), None)
            .unwrap();
    }
    tab.engine
        .apply_update("cart", UpdateKind::Add, json!({"sku": "lonely"}), None)
        .unwrap();

    let conflicts = tab.engine.detect_conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].section, "favorites");
    assert_eq!(conflicts[0].updates.len(), 3);
    assert_eq!(conflicts[0].strategies[0], ResolutionStrategy::ServerWins);
}

#[test]
fn offline_operations_never_touch_the_network() {
    let world = World::new(false);
    let tab = world.tab();
    tab.engine
        .apply_and_queue(
            "cart",
            UpdateKind::Add,
            json!({"sku": "b1"}),
            None,
            "cart_add",
        )
        .unwrap();
    world.run();

    assert_eq!(tab.api.call_count(), 0);
    assert_eq!(tab.engine.operation_stats().pending, 1);
    assert_eq!(tab.engine.status().total_pending, 1);
}

#[test]
fn reconnect_drains_each_operation_exactly_once() {
    let world = World::new(false);
    let tab = world.tab();
    tab.engine
        .apply_and_queue(
            "cart",
            UpdateKind::Add,
            json!({"sku": "b1"}),
            None,
            "cart_add",
        )
        .unwrap();

    world.connectivity.set_online(true);
    world.run();
    assert_eq!(tab.api.call_count(), 1);
    assert_eq!(tab.engine.operation_stats().completed, 1);
    assert_eq!(tab.engine.status().confirmed, 1);
    assert_eq!(tab.engine.status().total_pending, 0);

    // Flapping connectivity must not resend settled work.
    world.connectivity.set_online(false);
    world.connectivity.set_online(true);
    world.run();
    assert_eq!(tab.api.call_count(), 1);
}

#[test]
fn server_response_merges_into_confirmed_data() {
    let world = World::new(true);
    let tab = world.tab();
    tab.api
        .push(Ok(json!({"id": "srv-9", "syncedAt": "2026-08-30T00:00:00Z"})));
    tab.engine
        .apply_and_queue(
            "favorites",
            UpdateKind::Add,
            json!({"id": "tmp", "name": "espresso"}),
            None,
            "favorite_add",
        )
        .unwrap();
    world.run();

    let confirmed = tab.engine.ledger().confirmed_updates();
    assert_eq!(confirmed.len(), 1);
    let data = &confirmed[0].update.data;
    assert_eq!(data["id"], "srv-9");
    assert_eq!(data["name"], "espresso");
    assert_eq!(data["syncedAt"], "2026-08-30T00:00:00Z");
}

#[test]
fn scheduler_caps_concurrency_and_orders_by_priority() {
    let world = World::new(false);
    let tab = world.tab_with(
        EngineConfig {
            max_concurrent: 1,
            ..Default::default()
        },
        Rc::new(MemoryStore::new()),
    );
    let queue = tab.engine.queue();
    queue.queue_operation_with_priority("low_op", json!({}), None, Priority::Low);
    queue.queue_operation_with_priority("high_op", json!({}), None, Priority::High);
    queue.queue_operation_with_priority("normal_op", json!({}), None, Priority::Normal);

    world.connectivity.set_online(true);
    // One slot: the first drained request occupies it, the rest wait.
    assert_eq!(tab.engine.scheduler().in_flight(), 1);
    assert_eq!(tab.engine.scheduler().ready_len(), 2);

    world.run();
    // The waiting requests were picked by priority once the slot freed up.
    assert_eq!(tab.api.call_types(), vec!["low_op", "high_op", "normal_op"]);
    assert_eq!(tab.engine.operation_stats().completed, 3);
}

#[test]
fn retryable_failure_backs_off_then_succeeds() {
    let world = World::new(true);
    let tab = world.tab();
    tab.api.push(Err(SyncError::network("connection reset")));
    tab.api.push(Ok(json!({"ok": true})));
    let id = tab.engine.queue_operation("cart_add", json!({"sku": "b1"}));
    world.run();
    assert_eq!(tab.api.call_count(), 1);
    assert_eq!(tab.engine.operation_stats().syncing, 1);

    // Nothing new until the backoff delay elapses.
    world.run();
    assert_eq!(tab.api.call_count(), 1);

    world.timers.advance(Duration::from_secs(1));
    world.run();
    assert_eq!(tab.api.call_count(), 2);
    assert_eq!(tab.engine.operation_stats().completed, 1);
    let op = tab.engine.queue().operation(&id).unwrap();
    assert_eq!(op.retry_count, 1);
    assert_eq!(op.status, OperationStatus::Completed);
}

#[test]
fn server_rejection_fails_without_retry_and_surfaces_feedback() {
    let world = World::new(true);
    let tab = world.tab();
    let events = collect_events(&tab.engine);
    tab.api.push(Err(SyncError::rejected(422, "invalid favorite")));
    tab.engine
        .apply_and_queue(
            "favorites",
            UpdateKind::Add,
            json!({"name": ""}),
            None,
            "favorite_add",
        )
        .unwrap();
    world.run();
    world.timers.advance(Duration::from_secs(30));
    world.run();

    assert_eq!(tab.api.call_count(), 1);
    assert_eq!(tab.engine.operation_stats().failed, 1);
    assert_eq!(tab.engine.status().failed, 1);
    let feedback = events
        .borrow()
        .iter()
        .find_map(|e| match e {
            EngineEvent::UserFeedback(f) => Some(f.clone()),
            _ => None,
        })
        .expect("a final rollback surfaces user feedback");
    assert_eq!(feedback.severity, FeedbackSeverity::Error);
    assert!(!feedback.actions.is_empty());
}

#[test]
fn retry_budget_exhaustion_at_the_scheduler_is_terminal() {
    let world = World::new(true);
    // A confirmation timeout longer than the whole backoff ladder, so the
    // terminal outcome is the scheduler's, not the ledger timer's.
    let tab = world.tab_with(
        EngineConfig {
            confirmation_timeout: Duration::from_secs(300),
            ..Default::default()
        },
        Rc::new(MemoryStore::new()),
    );
    let events = collect_events(&tab.engine);
    for _ in 0..4 {
        tab.api.push(Err(SyncError::network("down")));
    }
    tab.engine
        .apply_and_queue(
            "cart",
            UpdateKind::Add,
            json!({"sku": "b1"}),
            None,
            "cart_add",
        )
        .unwrap();

    // Initial attempt plus three retries at 1s, 2s, 4s.
    world.run();
    for _ in 0..3 {
        world.timers.advance(Duration::from_secs(8));
        world.run();
    }

    assert_eq!(tab.api.call_count(), 4);
    assert_eq!(tab.engine.operation_stats().failed, 1);
    let terminal = events
        .borrow()
        .iter()
        .find_map(|e| match e {
            EngineEvent::RolledBack {
                error: Some(error), ..
            } => Some(error.clone()),
            _ => None,
        })
        .expect("exhausted budget rolls the update back");
    assert!(!terminal.retryable);
}

#[test]
fn storage_faults_degrade_to_memory_only() {
    let world = World::new(false);
    let tab = world.tab();
    tab.store.set_fail_writes(true);

    tab.engine
        .apply_update("cart", UpdateKind::Add, json!({"sku": "b1"}), None)
        .unwrap();
    tab.engine.queue_operation("cart_add", json!({"sku": "b1"}));

    assert_eq!(tab.engine.status().total_pending, 1);
    assert_eq!(tab.engine.operation_stats().pending, 1);
}

#[test]
fn corrupt_storage_yields_an_empty_engine() {
    let world = World::new(false);
    let store = Rc::new(MemoryStore::new());
    store.seed("offbeat.ledger", "{not json");
    store.seed("offbeat.queue", "[1, 2, oops");
    let tab = world.tab_with(EngineConfig::default(), store);

    assert_eq!(tab.engine.status().total_pending, 0);
    assert_eq!(tab.engine.operation_stats().total, 0);
}

#[test]
fn queued_work_survives_a_reload() {
    let world = World::new(false);
    let store = Rc::new(MemoryStore::new());
    {
        let tab = world.tab_with(EngineConfig::default(), store.clone());
        tab.engine
            .apply_and_queue(
                "cart",
                UpdateKind::Add,
                json!({"sku": "b1"}),
                None,
                "cart_add",
            )
            .unwrap();
        tab.engine.destroy();
    }

    let revived = world.tab_with(EngineConfig::default(), store);
    assert_eq!(revived.engine.status().total_pending, 1);
    assert_eq!(revived.engine.operation_stats().pending, 1);

    // The recovered work drains once we are back online.
    world.connectivity.set_online(true);
    world.run();
    assert_eq!(revived.api.call_count(), 1);
    assert_eq!(revived.engine.operation_stats().completed, 1);
}

#[test]
fn connectivity_callbacks_fire_on_transitions_only() {
    let world = World::new(true);
    let tab = world.tab();
    let ups = Rc::new(RefCell::new(0));
    let downs = Rc::new(RefCell::new(0));
    {
        let ups = ups.clone();
        tab.engine.queue().on_online(move || *ups.borrow_mut() += 1);
    }
    {
        let downs = downs.clone();
        tab.engine.queue().on_offline(move || *downs.borrow_mut() += 1);
    }

    world.connectivity.set_online(true); // no transition
    world.connectivity.set_online(false);
    world.connectivity.set_online(false); // no transition
    world.connectivity.set_online(true);
    assert_eq!(*ups.borrow(), 1);
    assert_eq!(*downs.borrow(), 1);
}

#[test]
fn sibling_tabs_converge_without_echo() {
    let world = World::new(false);
    let a = world.tab();
    let b = world.tab();
    a.engine.initialize(Some("user-1"));
    b.engine.initialize(Some("user-1"));

    let update = a
        .engine
        .apply_update("favorites", UpdateKind::Add, json!({"name": "a"}), None)
        .unwrap();

    // B ingested the update without re-broadcasting it.
    assert!(b
        .engine
        .ledger()
        .pending_updates()
        .iter()
        .any(|u| u.id == update.id));
    let echoed = world
        .hub
        .published_by(b.endpoint)
        .iter()
        .filter(|m| m.kind == MessageKind::Update)
        .count();
    assert_eq!(echoed, 0);

    // Confirmation converges the same way.
    a.engine.ledger().confirm(&update.id, Some(json!({"id": "srv-1"})));
    assert_eq!(b.engine.status().confirmed, 1);
    assert_eq!(b.engine.status().total_pending, 0);
}

#[test]
fn sibling_updates_never_reach_local_storage() {
    let world = World::new(false);
    let a = world.tab();
    let b = world.tab();
    a.engine.initialize(None);
    b.engine.initialize(None);

    let foreign = b
        .engine
        .apply_update("favorites", UpdateKind::Add, json!({"name": "b"}), None)
        .unwrap();
    // A now holds the foreign entry in memory; this local apply persists
    // A's ledger while it is there.
    let local = a
        .engine
        .apply_update("favorites", UpdateKind::Add, json!({"name": "a"}), None)
        .unwrap();
    assert_eq!(a.engine.status().total_pending, 2);

    use offbeat::platform::KeyValueStore;
    let snapshot = a.store.get("offbeat.ledger").unwrap();
    assert!(snapshot.contains(local.id.as_str()));
    assert!(!snapshot.contains(foreign.id.as_str()));

    // A reload revives only this tab's own work, so no confirmation timer
    // ever gets armed for the sibling's update.
    a.engine.destroy();
    let revived = world.tab_with(EngineConfig::default(), a.store.clone());
    let pending = revived.engine.ledger().pending_updates();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, local.id);
}

#[test]
fn operation_timestamps_follow_the_injected_clock() {
    let world = World::new(false);
    let tab = world.tab();
    use offbeat::platform::TimerHost;
    world.timers.advance(Duration::from_secs(40));

    let id = tab.engine.queue_operation("cart_add", json!({"sku": "b1"}));
    let op = tab.engine.queue().operation(&id).unwrap();
    assert_eq!(op.timestamp, world.timers.now());
}

#[test]
fn newcomer_tab_receives_a_pending_snapshot() {
    let world = World::new(false);
    let a = world.tab();
    a.engine.initialize(None);
    a.engine
        .apply_update("cart", UpdateKind::Add, json!({"sku": "b1"}), None)
        .unwrap();

    let b = world.tab();
    b.engine.initialize(None);

    assert_eq!(b.engine.status().total_pending, 1);
    assert_eq!(b.engine.cross_tab_info().active_tabs, 2);
    assert_eq!(a.engine.cross_tab_info().active_tabs, 2);
}

#[test]
fn departure_and_silence_both_shrink_the_tab_count() {
    let world = World::new(false);
    let a = world.tab();
    let b = world.tab();
    a.engine.initialize(None);
    b.engine.initialize(None);
    // A learns of B from B's announce; B learns of A on A's next heartbeat.
    world.timers.advance(Duration::from_secs(5));
    assert_eq!(a.engine.cross_tab_info().active_tabs, 2);

    b.engine.destroy();
    assert_eq!(a.engine.cross_tab_info().active_tabs, 1);
    // A destroyed coordinator reports a lone focused tab.
    assert_eq!(b.engine.cross_tab_info().active_tabs, 1);
    assert!(b.engine.cross_tab_info().current_tab_focused);
}

#[test]
fn stale_tabs_are_pruned_after_the_liveness_window() {
    let world = World::new(false);
    let a = world.tab();
    a.engine.initialize(None);

    // A ghost sibling announces once and is never heard from again.
    let ghost = world.hub.endpoint();
    use offbeat::platform::{BroadcastTransport, TimerHost};
    ghost
        .publish(&offbeat::TabMessage {
            kind: MessageKind::Announce,
            tab_id: "tab-ghost".to_string(),
            payload: json!({"focused": false, "user_id": null}),
            timestamp: world.timers.now(),
        })
        .unwrap();
    assert_eq!(a.engine.cross_tab_info().active_tabs, 2);

    world.timers.advance(Duration::from_secs(16));
    assert_eq!(a.engine.cross_tab_info().active_tabs, 1);
}

#[test]
fn section_data_reaches_sibling_tabs() {
    let world = World::new(false);
    let a = world.tab();
    let b = world.tab();
    a.engine.initialize(None);
    b.engine.initialize(None);

    let received = Rc::new(RefCell::new(Vec::new()));
    {
        let received = received.clone();
        b.engine.tabs().on_section_data(move |section, data| {
            received.borrow_mut().push((section.to_string(), data.clone()));
        });
    }
    a.engine.set_section_data("favorites", json!([{"name": "espresso"}]));

    let received = received.borrow();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "favorites");
}

#[test]
fn destroy_is_idempotent_and_stops_accepting_updates() {
    let world = World::new(true);
    let tab = world.tab();
    tab.engine.initialize(None);
    tab.engine.destroy();
    tab.engine.destroy();

    let err = tab
        .engine
        .apply_update("cart", UpdateKind::Add, json!({}), None)
        .unwrap_err();
    assert!(matches!(err, EngineError::Destroyed { .. }));

    // Timers armed before destruction no longer do anything.
    world.timers.advance(Duration::from_secs(120));
    assert_eq!(tab.engine.status().failed, 0);
}

#[test]
fn confirmed_entries_are_garbage_collected_after_retention() {
    let world = World::new(false);
    let tab = world.tab();
    let update = tab
        .engine
        .apply_update("favorites", UpdateKind::Add, json!({"name": "a"}), None)
        .unwrap();
    tab.engine.ledger().confirm(&update.id, None);
    assert_eq!(tab.engine.status().confirmed, 1);

    // Retention is 60s, sweeps run every 30s.
    world.timers.advance(Duration::from_secs(30));
    assert_eq!(tab.engine.status().confirmed, 1);
    world.timers.advance(Duration::from_secs(61));
    assert_eq!(tab.engine.status().confirmed, 0);
}
