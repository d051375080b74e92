//! In-memory platform implementations.
//!
//! These are the reference hosts for tests and non-browser runtimes: a
//! `HashMap`-backed store, a hub that delivers broadcasts between endpoints
//! in the same process, a connectivity flag flipped by hand, and a virtual
//! clock whose timers fire when the test advances time.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::engine::TabMessage;
use crate::error::PlatformError;
use crate::platform::{
    BroadcastTransport, ConnectivitySource, KeyValueStore, SubscriptionHandle, TimerHandle,
    TimerHost,
};

/// `KeyValueStore` over a `HashMap`. `fail_writes` simulates a full or
/// unavailable store so degradation paths can be exercised.
#[derive(Default)]
pub struct MemoryStore {
    data: RefCell<HashMap<String, String>>,
    fail_writes: Cell<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    /// Seed a value directly, bypassing `fail_writes`. For arranging
    /// recovery scenarios.
    pub fn seed(&self, key: &str, value: &str) {
        self.data
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
    }

    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.borrow().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.data.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PlatformError> {
        if self.fail_writes.get() {
            return Err(PlatformError::StorageUnavailable(
                "simulated write failure".to_string(),
            ));
        }
        self.data
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.data.borrow_mut().remove(key);
    }
}

struct HubSubscriber {
    endpoint: u64,
    key: u64,
    callback: Rc<dyn Fn(TabMessage)>,
}

#[derive(Default)]
struct HubInner {
    next_endpoint: u64,
    next_subscription: u64,
    subscribers: Vec<HubSubscriber>,
    log: Vec<(u64, TabMessage)>,
}

/// A same-process broadcast hub. Each [`MemoryTransport`] endpoint stands in
/// for one tab's `BroadcastChannel`: publishes are delivered synchronously
/// to every *other* endpoint, never echoed back to the publisher.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Rc<RefCell<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self) -> MemoryTransport {
        let mut inner = self.inner.borrow_mut();
        let endpoint = inner.next_endpoint;
        inner.next_endpoint += 1;
        MemoryTransport {
            hub: self.inner.clone(),
            endpoint,
        }
    }

    /// Every message published on the hub, with the publishing endpoint id.
    pub fn published(&self) -> Vec<(u64, TabMessage)> {
        self.inner.borrow().log.clone()
    }

    pub fn published_by(&self, endpoint: u64) -> Vec<TabMessage> {
        self.inner
            .borrow()
            .log
            .iter()
            .filter(|(from, _)| *from == endpoint)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

pub struct MemoryTransport {
    hub: Rc<RefCell<HubInner>>,
    endpoint: u64,
}

impl MemoryTransport {
    pub fn endpoint_id(&self) -> u64 {
        self.endpoint
    }
}

impl BroadcastTransport for MemoryTransport {
    fn publish(&self, message: &TabMessage) -> Result<(), PlatformError> {
        // Snapshot the recipients before invoking any callback: a recipient
        // may publish a reply from within its handler.
        let callbacks: Vec<Rc<dyn Fn(TabMessage)>> = {
            let mut inner = self.hub.borrow_mut();
            inner.log.push((self.endpoint, message.clone()));
            inner
                .subscribers
                .iter()
                .filter(|s| s.endpoint != self.endpoint)
                .map(|s| s.callback.clone())
                .collect()
        };
        for callback in callbacks {
            callback(message.clone());
        }
        Ok(())
    }

    fn subscribe(&self, callback: Box<dyn Fn(TabMessage)>) -> SubscriptionHandle {
        let key = {
            let mut inner = self.hub.borrow_mut();
            let key = inner.next_subscription;
            inner.next_subscription += 1;
            inner.subscribers.push(HubSubscriber {
                endpoint: self.endpoint,
                key,
                callback: Rc::from(callback),
            });
            key
        };
        let hub: Weak<RefCell<HubInner>> = Rc::downgrade(&self.hub);
        SubscriptionHandle::new(move || {
            if let Some(hub) = hub.upgrade() {
                hub.borrow_mut().subscribers.retain(|s| s.key != key);
            }
        })
    }
}

#[derive(Default)]
struct ConnectivityInner {
    online: bool,
    next_key: u64,
    subscribers: Vec<(u64, Rc<dyn Fn(bool)>)>,
}

/// A connectivity signal flipped by hand with [`ManualConnectivity::set_online`].
#[derive(Clone)]
pub struct ManualConnectivity {
    inner: Rc<RefCell<ConnectivityInner>>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ConnectivityInner {
                online,
                ..Default::default()
            })),
        }
    }

    /// Transitions (and only transitions) notify subscribers, matching the
    /// browser's online/offline events.
    pub fn set_online(&self, online: bool) {
        let callbacks: Vec<Rc<dyn Fn(bool)>> = {
            let mut inner = self.inner.borrow_mut();
            if inner.online == online {
                return;
            }
            inner.online = online;
            inner.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in callbacks {
            callback(online);
        }
    }
}

impl ConnectivitySource for ManualConnectivity {
    fn is_online(&self) -> bool {
        self.inner.borrow().online
    }

    fn subscribe(&self, callback: Box<dyn Fn(bool)>) -> SubscriptionHandle {
        let key = {
            let mut inner = self.inner.borrow_mut();
            let key = inner.next_key;
            inner.next_key += 1;
            inner.subscribers.push((key, Rc::from(callback)));
            key
        };
        let weak = Rc::downgrade(&self.inner);
        SubscriptionHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().subscribers.retain(|(k, _)| *k != key);
            }
        })
    }
}

struct TimersInner {
    now: DateTime<Utc>,
    next_seq: u64,
    timers: BTreeMap<(DateTime<Utc>, u64), Box<dyn FnOnce()>>,
}

/// A virtual clock. Timers fire, in deadline order, only when the test calls
/// [`ManualTimers::advance`]; `now()` reports virtual time so timestamps and
/// liveness windows agree with the timers.
#[derive(Clone)]
pub struct ManualTimers {
    inner: Rc<RefCell<TimersInner>>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(TimersInner {
                now: Utc::now(),
                next_seq: 0,
                timers: BTreeMap::new(),
            })),
        }
    }

    /// Move virtual time forward, firing every timer whose deadline is
    /// reached. Callbacks run outside the internal borrow, so a callback may
    /// schedule (or cancel) further timers; newly scheduled timers fire in
    /// the same call if they land within the window.
    pub fn advance(&self, delta: Duration) {
        let target = self.inner.borrow().now + crate::chrono_duration(delta);
        loop {
            let due = {
                let mut inner = self.inner.borrow_mut();
                let key = match inner.timers.keys().next() {
                    Some(key) if key.0 <= target => *key,
                    _ => break,
                };
                inner.now = key.0;
                inner.timers.remove(&key)
            };
            if let Some(callback) = due {
                callback();
            }
        }
        self.inner.borrow_mut().now = target;
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.borrow().timers.len()
    }
}

impl Default for ManualTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerHost for ManualTimers {
    fn now(&self) -> DateTime<Utc> {
        self.inner.borrow().now
    }

    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerHandle {
        let key = {
            let mut inner = self.inner.borrow_mut();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let deadline = inner.now + crate::chrono_duration(delay);
            inner.timers.insert((deadline, seq), callback);
            (deadline, seq)
        };
        let weak = Rc::downgrade(&self.inner);
        TimerHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().timers.remove(&key);
            }
        })
    }
}
