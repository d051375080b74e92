//! Event emission for UI and telemetry collaborators.
//!
//! Everything user-visible the engine does is announced through one
//! registry: applies, confirmations, rollbacks, retries, and the actionable
//! feedback that accompanies a final rollback. Registration returns a key;
//! dropping a subscription is an explicit `unsubscribe`, so teardown is not
//! tied to value lifetimes.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::engine::OptimisticUpdate;
use crate::error::SyncError;

slotmap::new_key_type! {
    /// Handle returned from [`Listeners::subscribe`].
    pub struct ListenerKey;
}

/// A state transition observed by the engine, in the order it happened.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An optimistic update was applied and is now pending confirmation.
    Applied(OptimisticUpdate),
    /// The server round trip succeeded; `update.data` carries any
    /// server-merged payload.
    Confirmed { update: OptimisticUpdate },
    /// The update was reverted, either by a classified failure or by the
    /// confirmation timeout.
    RolledBack {
        id: String,
        reason: String,
        error: Option<SyncError>,
    },
    /// A rollback was converted into a fresh attempt under a new id.
    /// `update.id` is the new identity; callers must track it.
    Retry {
        previous_id: String,
        update: OptimisticUpdate,
    },
    /// Recovery choices for the user after a final rollback.
    UserFeedback(UserFeedback),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFeedback {
    pub message: String,
    pub severity: FeedbackSeverity,
    pub actions: Vec<FeedbackAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FeedbackAction {
    /// Re-attempt the rolled-back update (subject to its remaining budget).
    Retry { update_id: String },
    Dismiss,
}

/// Publish/subscribe registry keyed by [`ListenerKey`].
///
/// Cheap to clone; clones share the same registry. Emission snapshots the
/// callback list first so a listener may subscribe or unsubscribe from
/// within its own callback.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Rc<RefCell<SlotMap<ListenerKey, Rc<dyn Fn(&EngineEvent)>>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: impl Fn(&EngineEvent) + 'static) -> ListenerKey {
        self.inner.borrow_mut().insert(Rc::new(callback))
    }

    /// Unknown or already-removed keys are a no-op.
    pub fn unsubscribe(&self, key: ListenerKey) {
        self.inner.borrow_mut().remove(key);
    }

    pub fn emit(&self, event: &EngineEvent) {
        let callbacks: Vec<Rc<dyn Fn(&EngineEvent)>> =
            self.inner.borrow().values().cloned().collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn clear(&self) {
        self.inner.borrow_mut().clear();
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.inner.borrow().len())
            .finish()
    }
}
