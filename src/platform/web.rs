//! Browser-backed platform implementations, behind the `web` feature.
//!
//! `localStorage` for persistence, `BroadcastChannel` for cross-tab
//! messaging, `navigator.onLine` plus the window online/offline events for
//! connectivity, and `setTimeout` (via gloo) for timers. Everything here is
//! a thin shim; the engine's semantics live on the other side of the traits.

use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::task::{LocalFutureObj, LocalSpawn, SpawnError};
use gloo_timers::callback::Timeout;
use wasm_bindgen::closure::Closure;
use wasm_bindgen::JsCast;
use web_sys::{BroadcastChannel, MessageEvent, Storage, Window};

use crate::engine::TabMessage;
use crate::error::PlatformError;
use crate::platform::{
    BroadcastTransport, ConnectivitySource, KeyValueStore, Platform, SubscriptionHandle,
    TimerHandle, TimerHost,
};

fn window() -> Result<Window, PlatformError> {
    web_sys::window()
        .ok_or_else(|| PlatformError::StorageUnavailable("no window object".to_string()))
}

/// `KeyValueStore` over `window.localStorage`. Construction fails outside a
/// window context or when storage is disabled (private browsing).
pub struct LocalStorageStore {
    storage: Storage,
}

impl LocalStorageStore {
    pub fn new() -> Result<Self, PlatformError> {
        let storage = window()?
            .local_storage()
            .ok()
            .flatten()
            .ok_or_else(|| PlatformError::StorageUnavailable("localStorage disabled".to_string()))?;
        Ok(Self { storage })
    }
}

impl KeyValueStore for LocalStorageStore {
    fn get(&self, key: &str) -> Option<String> {
        self.storage.get_item(key).ok().flatten()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PlatformError> {
        // Quota errors land here; the engine degrades to memory-only.
        self.storage
            .set_item(key, value)
            .map_err(|e| PlatformError::StorageUnavailable(format!("{e:?}")))
    }

    fn remove(&self, key: &str) {
        let _ = self.storage.remove_item(key);
    }
}

/// `BroadcastTransport` over a named `BroadcastChannel`. The channel is
/// closed when the transport is dropped.
pub struct BroadcastChannelTransport {
    channel: BroadcastChannel,
}

impl BroadcastChannelTransport {
    pub fn new(name: &str) -> Result<Self, PlatformError> {
        let channel = BroadcastChannel::new(name)
            .map_err(|e| PlatformError::TransportUnavailable(format!("{e:?}")))?;
        Ok(Self { channel })
    }
}

impl BroadcastTransport for BroadcastChannelTransport {
    fn publish(&self, message: &TabMessage) -> Result<(), PlatformError> {
        let value = serde_wasm_bindgen::to_value(message)
            .map_err(|e| PlatformError::TransportUnavailable(e.to_string()))?;
        self.channel
            .post_message(&value)
            .map_err(|e| PlatformError::TransportUnavailable(format!("{e:?}")))
    }

    fn subscribe(&self, callback: Box<dyn Fn(TabMessage)>) -> SubscriptionHandle {
        let closure = Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
            match serde_wasm_bindgen::from_value::<TabMessage>(event.data()) {
                Ok(message) => callback(message),
                Err(e) => log::warn!("dropping undecodable broadcast message: {e}"),
            }
        });
        let channel = self.channel.clone();
        if channel
            .add_event_listener_with_callback("message", closure.as_ref().unchecked_ref())
            .is_err()
        {
            log::warn!("failed to attach broadcast listener");
        }
        // The closure must outlive the subscription; the cancel callback
        // owns it and unhooks it on drop.
        SubscriptionHandle::new(move || {
            let _ = channel
                .remove_event_listener_with_callback("message", closure.as_ref().unchecked_ref());
            drop(closure);
        })
    }
}

impl Drop for BroadcastChannelTransport {
    fn drop(&mut self) {
        self.channel.close();
    }
}

/// `ConnectivitySource` over `navigator.onLine` and the window's
/// online/offline events.
pub struct NavigatorConnectivity {
    window: Window,
}

impl NavigatorConnectivity {
    pub fn new() -> Result<Self, PlatformError> {
        Ok(Self { window: window()? })
    }
}

impl ConnectivitySource for NavigatorConnectivity {
    fn is_online(&self) -> bool {
        self.window.navigator().on_line()
    }

    fn subscribe(&self, callback: Box<dyn Fn(bool)>) -> SubscriptionHandle {
        let callback: Rc<dyn Fn(bool)> = Rc::from(callback);
        let on_online = {
            let callback = callback.clone();
            Closure::<dyn FnMut()>::new(move || callback(true))
        };
        let on_offline = Closure::<dyn FnMut()>::new(move || callback(false));
        let window = self.window.clone();
        let hooked = window
            .add_event_listener_with_callback("online", on_online.as_ref().unchecked_ref())
            .and_then(|()| {
                window
                    .add_event_listener_with_callback("offline", on_offline.as_ref().unchecked_ref())
            });
        if hooked.is_err() {
            log::warn!("failed to attach connectivity listeners");
        }
        SubscriptionHandle::new(move || {
            let _ = window
                .remove_event_listener_with_callback("online", on_online.as_ref().unchecked_ref());
            let _ = window.remove_event_listener_with_callback(
                "offline",
                on_offline.as_ref().unchecked_ref(),
            );
            drop(on_online);
            drop(on_offline);
        })
    }
}

/// `TimerHost` over `setTimeout`, wall clock from chrono.
#[derive(Default)]
pub struct WebTimers;

impl WebTimers {
    pub fn new() -> Self {
        Self
    }
}

impl TimerHost for WebTimers {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerHandle {
        let millis = delay.as_millis().min(u32::MAX as u128) as u32;
        let timeout = Timeout::new(millis, move || callback());
        // Dropping a `Timeout` clears it; the handle owning it is exactly
        // the cancel-on-drop contract.
        TimerHandle::new(move || drop(timeout))
    }
}

/// Executor shim over `wasm_bindgen_futures::spawn_local`.
#[derive(Default)]
pub struct WasmSpawner;

impl WasmSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl LocalSpawn for WasmSpawner {
    fn spawn_local_obj(&self, future: LocalFutureObj<'static, ()>) -> Result<(), SpawnError> {
        wasm_bindgen_futures::spawn_local(future);
        Ok(())
    }
}

/// Assemble the full browser platform. `channel_name` scopes the broadcast
/// channel; tabs of the same app must agree on it.
pub fn browser_platform(channel_name: &str) -> Result<Platform, PlatformError> {
    Ok(Platform {
        store: Rc::new(LocalStorageStore::new()?),
        transport: Rc::new(BroadcastChannelTransport::new(channel_name)?),
        connectivity: Rc::new(NavigatorConnectivity::new()?),
        timers: Rc::new(WebTimers::new()),
        spawner: Rc::new(WasmSpawner::new()),
    })
}
