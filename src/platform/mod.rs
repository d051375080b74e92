//! The narrow capability seams between the engine and its host.
//!
//! The engine reasons about storage, broadcast, connectivity, and timers
//! through these traits only. A browser host wires the `web`
//! implementations; tests and other runtimes use [`memory`]. All traits are
//! single-threaded (`Rc`, no `Send` bounds) to match the cooperative
//! event-loop model the engine runs under.

pub mod memory;

#[cfg(all(target_arch = "wasm32", feature = "web"))]
pub mod web;

use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::task::LocalSpawn;

use crate::engine::TabMessage;
use crate::error::PlatformError;

/// Durable key-value persistence (`localStorage`-shaped). `set` may fail
/// (quota, private browsing); callers catch and degrade to in-memory-only
/// operation.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), PlatformError>;
    fn remove(&self, key: &str);
}

/// Broadcast-style pub/sub between same-origin windows. At-most-once,
/// unordered, no delivery guarantee; the engine treats every message as
/// advisory.
pub trait BroadcastTransport {
    fn publish(&self, message: &TabMessage) -> Result<(), PlatformError>;
    fn subscribe(&self, callback: Box<dyn Fn(TabMessage)>) -> SubscriptionHandle;
}

/// The online/offline signal. The engine subscribes but does not control it.
pub trait ConnectivitySource {
    fn is_online(&self) -> bool;
    /// The callback receives the new state on every transition.
    fn subscribe(&self, callback: Box<dyn Fn(bool)>) -> SubscriptionHandle;
}

/// One-shot timers plus the clock they run against.
///
/// `now` lives here so a manual implementation can advance virtual time and
/// have timestamps, timeouts, and liveness windows all agree.
pub trait TimerHost {
    fn now(&self) -> DateTime<Utc>;
    /// Schedule `callback` to run once after `delay`. Dropping the returned
    /// handle cancels the timer.
    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerHandle;
}

/// Cancels its timer when dropped.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TimerHandle")
    }
}

/// Unregisters its callback when dropped. Returned from every registration
/// so teardown cannot leak listeners.
pub struct SubscriptionHandle {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl SubscriptionHandle {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SubscriptionHandle")
    }
}

/// Everything the engine needs from its host, bundled for construction.
#[derive(Clone)]
pub struct Platform {
    pub store: Rc<dyn KeyValueStore>,
    pub transport: Rc<dyn BroadcastTransport>,
    pub connectivity: Rc<dyn ConnectivitySource>,
    pub timers: Rc<dyn TimerHost>,
    /// Executor for the scheduler's network attempts. On the web this wraps
    /// `wasm_bindgen_futures::spawn_local`; natively a
    /// `futures::executor::LocalPool` spawner works.
    pub spawner: Rc<dyn LocalSpawn>,
}
