//! # TabCoordinator
//! Keeps every open tab of the same app convergent without a shared worker.
//! Each tab announces itself on a broadcast channel, heartbeats while alive,
//! mirrors its ledger transitions to its siblings, and ingests theirs. The
//! channel is advisory: messages may be lost, and a tab that misses one
//! converges on the next snapshot or server round trip.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::ledger::{OptimisticLedger, OptimisticUpdate};
use crate::events::EngineEvent;
use crate::platform::{BroadcastTransport, SubscriptionHandle, TimerHandle, TimerHost};
use crate::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// "I exist (still)": sent on startup, on focus changes, and as a
    /// periodic heartbeat.
    Announce,
    /// Best-effort goodbye; liveness never depends on receiving it.
    Departure,
    /// A ledger transition mirrored to siblings.
    Update,
    /// Application or snapshot data pushed to siblings.
    Data,
}

/// The wire envelope. `payload` is kind-specific JSON so hosts can relay it
/// through `BroadcastChannel` or anything else that moves strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabMessage {
    pub kind: MessageKind,
    pub tab_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// What this tab knows about one sibling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabState {
    pub tab_id: String,
    pub last_seen: DateTime<Utc>,
    pub focused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabLifecycle {
    Initializing,
    Active,
    Background,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossTabInfo {
    /// Siblings seen within the liveness window, plus this tab.
    pub active_tabs: usize,
    pub current_tab_focused: bool,
}

/// Payload of a [`MessageKind::Update`] message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum UpdateBroadcast {
    Applied { update: OptimisticUpdate },
    Confirmed { update: OptimisticUpdate },
    RolledBack { id: String, reason: String },
    Retry { previous_id: String, update: OptimisticUpdate },
}

/// Payload of a [`MessageKind::Data`] message. The tag must not collide
/// with any variant field name, so it cannot be `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "payload", rename_all = "snake_case")]
enum DataBroadcast {
    /// Full pending state, sent to a newly announced tab so it starts from
    /// what its siblings already know.
    Snapshot { updates: Vec<OptimisticUpdate> },
    Section { section: String, data: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnnouncePayload {
    focused: bool,
    user_id: Option<String>,
}

struct TabsInner {
    transport: Rc<dyn BroadcastTransport>,
    timers: Rc<dyn TimerHost>,
    ledger: OptimisticLedger,
    config: EngineConfig,
    tab_id: String,
    user_id: Option<String>,
    lifecycle: TabLifecycle,
    focused: bool,
    siblings: HashMap<String, TabState>,
    section_callbacks: Vec<(u64, Rc<dyn Fn(&str, &Value)>)>,
    next_callback: u64,
    _subscription: Option<SubscriptionHandle>,
    heartbeat: Option<TimerHandle>,
}

impl TabsInner {
    fn prune(&mut self) {
        let cutoff = self.timers.now() - crate::chrono_duration(self.config.active_window);
        self.siblings.retain(|_, tab| tab.last_seen > cutoff);
    }

    fn message(&self, kind: MessageKind, payload: Value) -> TabMessage {
        TabMessage {
            kind,
            tab_id: self.tab_id.clone(),
            payload,
            timestamp: self.timers.now(),
        }
    }
}

/// Handle to the coordinator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TabCoordinator {
    inner: Rc<RefCell<TabsInner>>,
    /// True while a sibling's transition is being applied to the local
    /// ledger. The facade consults this to suppress re-broadcast echo.
    applying_remote: Rc<Cell<bool>>,
}

impl TabCoordinator {
    pub fn new(
        transport: Rc<dyn BroadcastTransport>,
        timers: Rc<dyn TimerHost>,
        ledger: OptimisticLedger,
        config: EngineConfig,
    ) -> Self {
        // Millis plus counter plus per-process entropy: two tabs opened in
        // the same millisecond still get distinct ids.
        let tab_id = format!(
            "{}-{:08x}",
            crate::next_id("tab", timers.now()),
            crate::tab_entropy() as u32
        );
        Self {
            inner: Rc::new(RefCell::new(TabsInner {
                transport,
                timers,
                ledger,
                config,
                tab_id,
                user_id: None,
                lifecycle: TabLifecycle::Initializing,
                focused: true,
                siblings: HashMap::new(),
                section_callbacks: Vec::new(),
                next_callback: 0,
                _subscription: None,
                heartbeat: None,
            })),
            applying_remote: Rc::new(Cell::new(false)),
        }
    }

    /// A non-owning handle, for listener closures that must not keep the
    /// coordinator alive.
    pub(crate) fn downgrade(&self) -> WeakTabCoordinator {
        WeakTabCoordinator {
            inner: Rc::downgrade(&self.inner),
            applying_remote: Rc::downgrade(&self.applying_remote),
        }
    }

    pub fn tab_id(&self) -> String {
        self.inner.borrow().tab_id.clone()
    }

    pub fn lifecycle(&self) -> TabLifecycle {
        self.inner.borrow().lifecycle
    }

    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote.get()
    }

    /// Join the channel: subscribe, announce this tab, start the heartbeat.
    /// Idempotent; only the first call does anything.
    pub fn initialize(&self, user_id: Option<String>) {
        let announce = {
            let mut inner = self.inner.borrow_mut();
            if inner.lifecycle != TabLifecycle::Initializing {
                return;
            }
            inner.user_id = user_id;
            inner.lifecycle = TabLifecycle::Active;

            let weak = Rc::downgrade(&self.inner);
            let applying = self.applying_remote.clone();
            inner._subscription = Some(inner.transport.subscribe(Box::new(move |message| {
                if let Some(inner) = weak.upgrade() {
                    TabCoordinator {
                        inner,
                        applying_remote: applying.clone(),
                    }
                    .on_message(message);
                }
            })));
            self.arm_heartbeat(&mut inner);
            self.announce_message(&inner)
        };
        log::info!("tab {} joined the broadcast channel", announce.tab_id);
        self.publish(announce);
    }

    /// Mirror a ledger transition to siblings. Called by the facade for
    /// locally originated events only; `UserFeedback` stays local.
    pub fn broadcast_ledger_event(&self, event: &EngineEvent) {
        let broadcast = match event {
            EngineEvent::Applied(update) => UpdateBroadcast::Applied {
                update: update.clone(),
            },
            EngineEvent::Confirmed { update } => UpdateBroadcast::Confirmed {
                update: update.clone(),
            },
            EngineEvent::RolledBack { id, reason, .. } => UpdateBroadcast::RolledBack {
                id: id.clone(),
                reason: reason.clone(),
            },
            EngineEvent::Retry {
                previous_id,
                update,
            } => UpdateBroadcast::Retry {
                previous_id: previous_id.clone(),
                update: update.clone(),
            },
            EngineEvent::UserFeedback(_) => return,
        };
        let message = {
            let inner = self.inner.borrow();
            if inner.lifecycle == TabLifecycle::Initializing
                || inner.lifecycle == TabLifecycle::Terminated
            {
                return;
            }
            match serde_json::to_value(&broadcast) {
                Ok(payload) => inner.message(MessageKind::Update, payload),
                Err(e) => {
                    log::error!("failed to encode update broadcast: {e}");
                    return;
                }
            }
        };
        self.publish(message);
    }

    /// Push application-level section data to siblings.
    pub fn broadcast_section_data(&self, section: &str, data: Value) {
        let broadcast = DataBroadcast::Section {
            section: section.to_string(),
            data,
        };
        let message = {
            let inner = self.inner.borrow();
            if inner.lifecycle == TabLifecycle::Initializing
                || inner.lifecycle == TabLifecycle::Terminated
            {
                return;
            }
            match serde_json::to_value(&broadcast) {
                Ok(payload) => inner.message(MessageKind::Data, payload),
                Err(e) => {
                    log::error!("failed to encode section broadcast: {e}");
                    return;
                }
            }
        };
        self.publish(message);
    }

    /// Receive section data pushed by siblings. Registration never throws;
    /// remove with [`TabCoordinator::remove_section_callback`].
    pub fn on_section_data(&self, callback: impl Fn(&str, &Value) + 'static) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let key = inner.next_callback;
        inner.next_callback += 1;
        inner.section_callbacks.push((key, Rc::new(callback)));
        key
    }

    pub fn remove_section_callback(&self, key: u64) {
        self.inner
            .borrow_mut()
            .section_callbacks
            .retain(|(k, _)| *k != key);
    }

    /// Focus moves the tab between `Active` and `Background` and tells the
    /// siblings, so they can avoid duplicate foreground work.
    pub fn set_focused(&self, focused: bool) {
        let announce = {
            let mut inner = self.inner.borrow_mut();
            if inner.lifecycle == TabLifecycle::Terminated {
                return;
            }
            inner.focused = focused;
            if inner.lifecycle != TabLifecycle::Initializing {
                inner.lifecycle = if focused {
                    TabLifecycle::Active
                } else {
                    TabLifecycle::Background
                };
                Some(self.announce_message(&inner))
            } else {
                None
            }
        };
        if let Some(message) = announce {
            self.publish(message);
        }
    }

    pub fn get_cross_tab_info(&self) -> CrossTabInfo {
        let mut inner = self.inner.borrow_mut();
        if inner.lifecycle == TabLifecycle::Terminated {
            // A torn-down coordinator reports a lone focused tab.
            return CrossTabInfo {
                active_tabs: 1,
                current_tab_focused: true,
            };
        }
        inner.prune();
        CrossTabInfo {
            active_tabs: inner.siblings.len() + 1,
            current_tab_focused: inner.focused,
        }
    }

    /// Idempotent teardown: best-effort goodbye, then unhook everything.
    pub fn destroy(&self) {
        let departure = {
            let mut inner = self.inner.borrow_mut();
            if inner.lifecycle == TabLifecycle::Terminated {
                return;
            }
            let departure = if inner.lifecycle == TabLifecycle::Initializing {
                None
            } else {
                Some(inner.message(MessageKind::Departure, Value::Null))
            };
            inner.lifecycle = TabLifecycle::Terminated;
            inner.heartbeat = None;
            inner._subscription = None;
            inner.siblings.clear();
            inner.section_callbacks.clear();
            departure
        };
        if let Some(message) = departure {
            self.publish(message);
        }
    }

    fn announce_message(&self, inner: &TabsInner) -> TabMessage {
        let payload = serde_json::to_value(AnnouncePayload {
            focused: inner.focused,
            user_id: inner.user_id.clone(),
        })
        .unwrap_or(Value::Null);
        inner.message(MessageKind::Announce, payload)
    }

    /// The transport is advisory: a failed publish is logged and forgotten.
    fn publish(&self, message: TabMessage) {
        let transport = self.inner.borrow().transport.clone();
        if let Err(e) = transport.publish(&message) {
            log::warn!("broadcast publish failed: {e}");
        }
    }

    fn arm_heartbeat(&self, inner: &mut TabsInner) {
        let weak = Rc::downgrade(&self.inner);
        let applying = self.applying_remote.clone();
        inner.heartbeat = Some(inner.timers.set_timeout(
            inner.config.heartbeat_interval,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    TabCoordinator {
                        inner,
                        applying_remote: applying.clone(),
                    }
                    .heartbeat_fired();
                }
            }),
        ));
    }

    fn heartbeat_fired(&self) {
        let announce = {
            let mut inner = self.inner.borrow_mut();
            if inner.lifecycle == TabLifecycle::Terminated {
                return;
            }
            inner.prune();
            self.arm_heartbeat(&mut inner);
            self.announce_message(&inner)
        };
        self.publish(announce);
    }

    fn on_message(&self, message: TabMessage) {
        enum Action {
            None,
            SendSnapshot,
            ApplyUpdate(UpdateBroadcast),
            ApplyData(DataBroadcast),
        }

        let action = {
            let mut inner = self.inner.borrow_mut();
            if inner.lifecycle == TabLifecycle::Terminated || message.tab_id == inner.tab_id {
                return;
            }
            inner.prune();
            let newcomer = !inner.siblings.contains_key(&message.tab_id);
            match message.kind {
                MessageKind::Departure => {
                    inner.siblings.remove(&message.tab_id);
                    Action::None
                }
                kind => {
                    // Any message proves the sender is alive.
                    let focused = match kind {
                        MessageKind::Announce => {
                            serde_json::from_value::<AnnouncePayload>(message.payload.clone())
                                .map(|p| p.focused)
                                .unwrap_or(false)
                        }
                        _ => inner
                            .siblings
                            .get(&message.tab_id)
                            .map(|t| t.focused)
                            .unwrap_or(false),
                    };
                    let last_seen = inner.timers.now();
                    inner.siblings.insert(
                        message.tab_id.clone(),
                        TabState {
                            tab_id: message.tab_id.clone(),
                            last_seen,
                            focused,
                        },
                    );
                    match kind {
                        MessageKind::Announce if newcomer => Action::SendSnapshot,
                        MessageKind::Announce => Action::None,
                        MessageKind::Update => {
                            match serde_json::from_value(message.payload.clone()) {
                                Ok(broadcast) => Action::ApplyUpdate(broadcast),
                                Err(e) => {
                                    log::warn!("ignoring malformed update broadcast: {e}");
                                    Action::None
                                }
                            }
                        }
                        MessageKind::Data => {
                            match serde_json::from_value(message.payload.clone()) {
                                Ok(broadcast) => Action::ApplyData(broadcast),
                                Err(e) => {
                                    log::warn!("ignoring malformed data broadcast: {e}");
                                    Action::None
                                }
                            }
                        }
                        MessageKind::Departure => unreachable!(),
                    }
                }
            }
        };

        match action {
            Action::None => {}
            Action::SendSnapshot => self.send_snapshot(),
            Action::ApplyUpdate(broadcast) => self.apply_remote_update(broadcast),
            Action::ApplyData(broadcast) => self.apply_remote_data(broadcast),
        }
    }

    /// Bring a newly announced tab up to date with our pending state.
    fn send_snapshot(&self) {
        let message = {
            let inner = self.inner.borrow();
            let updates = inner.ledger.pending_updates();
            if updates.is_empty() {
                return;
            }
            match serde_json::to_value(DataBroadcast::Snapshot { updates }) {
                Ok(payload) => inner.message(MessageKind::Data, payload),
                Err(e) => {
                    log::error!("failed to encode snapshot: {e}");
                    return;
                }
            }
        };
        self.publish(message);
    }

    fn apply_remote_update(&self, broadcast: UpdateBroadcast) {
        let ledger = self.inner.borrow().ledger.clone();
        self.applying_remote.set(true);
        match broadcast {
            UpdateBroadcast::Applied { update } => ledger.ingest_remote(update),
            UpdateBroadcast::Confirmed { update } => {
                // The originating tab already merged the server payload;
                // adopting its data keeps both tabs byte-identical.
                ledger.confirm(&update.id, Some(update.data));
            }
            UpdateBroadcast::RolledBack { id, reason } => {
                ledger.rollback(&id, &reason, None);
            }
            UpdateBroadcast::Retry {
                previous_id,
                update,
            } => {
                ledger.remove_remote(&previous_id);
                ledger.ingest_remote(update);
            }
        }
        self.applying_remote.set(false);
    }

    fn apply_remote_data(&self, broadcast: DataBroadcast) {
        match broadcast {
            DataBroadcast::Snapshot { updates } => {
                let ledger = self.inner.borrow().ledger.clone();
                self.applying_remote.set(true);
                for update in updates {
                    ledger.ingest_remote(update);
                }
                self.applying_remote.set(false);
            }
            DataBroadcast::Section { section, data } => {
                let callbacks: Vec<Rc<dyn Fn(&str, &Value)>> = self
                    .inner
                    .borrow()
                    .section_callbacks
                    .iter()
                    .map(|(_, cb)| cb.clone())
                    .collect();
                for callback in callbacks {
                    callback(&section, &data);
                }
            }
        }
    }
}

pub(crate) struct WeakTabCoordinator {
    inner: std::rc::Weak<RefCell<TabsInner>>,
    applying_remote: std::rc::Weak<Cell<bool>>,
}

impl WeakTabCoordinator {
    pub(crate) fn upgrade(&self) -> Option<TabCoordinator> {
        Some(TabCoordinator {
            inner: self.inner.upgrade()?,
            applying_remote: self.applying_remote.upgrade()?,
        })
    }
}

impl std::fmt::Debug for TabCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("TabCoordinator")
            .field("tab_id", &inner.tab_id)
            .field("lifecycle", &inner.lifecycle)
            .field("siblings", &inner.siblings.len())
            .finish()
    }
}
