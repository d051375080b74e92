//! # SyncScheduler
//! The single choke point through which queued operations reach the remote
//! mutation API. Ready requests are picked by priority (high before normal
//! before low, FIFO within a class), concurrent in-flight requests are
//! capped, and retryable failures back off exponentially until the retry
//! budget runs out. Terminal outcomes are reported to registered handlers;
//! the scheduler itself never mutates the queue or the ledger.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures::future::{LocalBoxFuture, LocalFutureObj};
use futures::task::LocalSpawn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use slotmap::SlotMap;

use crate::error::SyncError;
use crate::platform::{TimerHandle, TimerHost};
use crate::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// One trip to the network. A queued operation maps to exactly one
/// `SyncRequest` per attempt; a failed attempt with remaining budget
/// produces a new attempt referencing the same `operation_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub operation_id: String,
    #[serde(rename = "type")]
    pub op_type: String,
    pub payload: Value,
    pub priority: Priority,
    pub max_retries: u32,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

/// The remote mutation API, as a black box. Implementations classify their
/// failures: transport problems are retryable, server rejections are not.
pub trait RemoteApi {
    fn execute(&self, request: &SyncRequest) -> LocalBoxFuture<'static, Result<Value, SyncError>>;
}

/// A definitive result for one scheduled request: either the server's
/// response payload or a terminal, no-longer-retryable error.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub sync_id: String,
    pub operation_id: String,
    /// Attempts actually made, including the final one.
    pub attempts: u32,
    pub result: Result<Value, SyncError>,
}

slotmap::new_key_type! {
    pub struct OutcomeKey;
}

struct ReadyRequest {
    sync_id: String,
    request: SyncRequest,
    /// Completed attempts so far; the next attempt is number `attempt + 1`.
    attempt: u32,
    seq: u64,
}

struct SchedulerInner {
    api: Rc<dyn RemoteApi>,
    timers: Rc<dyn TimerHost>,
    spawner: Rc<dyn LocalSpawn>,
    config: EngineConfig,
    ready: Vec<ReadyRequest>,
    in_flight: usize,
    next_seq: u64,
    handlers: SlotMap<OutcomeKey, Rc<dyn Fn(&SyncOutcome)>>,
    backoff: HashMap<u64, TimerHandle>,
    destroyed: bool,
}

#[derive(Clone)]
pub struct SyncScheduler {
    inner: Rc<RefCell<SchedulerInner>>,
}

impl SyncScheduler {
    pub fn new(
        api: Rc<dyn RemoteApi>,
        timers: Rc<dyn TimerHost>,
        spawner: Rc<dyn LocalSpawn>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SchedulerInner {
                api,
                timers,
                spawner,
                config,
                ready: Vec::new(),
                in_flight: 0,
                next_seq: 0,
                handlers: SlotMap::with_key(),
                backoff: HashMap::new(),
                destroyed: false,
            })),
        }
    }

    /// Accept a request and return its sync id immediately. Execution is
    /// asynchronous; the definitive result arrives at the outcome handlers.
    pub fn schedule_sync(&self, request: SyncRequest) -> String {
        let sync_id = {
            let mut inner = self.inner.borrow_mut();
            let now = inner.timers.now();
            let sync_id = crate::next_id("sync", now);
            if inner.destroyed {
                log::warn!("sync scheduler destroyed; dropping request {sync_id}");
                return sync_id;
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.ready.push(ReadyRequest {
                sync_id: sync_id.clone(),
                request,
                attempt: 0,
                seq,
            });
            sync_id
        };
        self.pump();
        sync_id
    }

    /// Register for definitive outcomes. Handlers stay until removed.
    pub fn on_outcome(&self, handler: impl Fn(&SyncOutcome) + 'static) -> OutcomeKey {
        self.inner.borrow_mut().handlers.insert(Rc::new(handler))
    }

    pub fn remove_outcome_handler(&self, key: OutcomeKey) {
        self.inner.borrow_mut().handlers.remove(key);
    }

    pub fn in_flight(&self) -> usize {
        self.inner.borrow().in_flight
    }

    pub fn ready_len(&self) -> usize {
        self.inner.borrow().ready.len()
    }

    /// Idempotent. Pending backoff timers are cancelled synchronously;
    /// requests already in flight are abandoned on completion.
    pub fn destroy(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        inner.ready.clear();
        inner.backoff.clear();
        inner.handlers.clear();
    }

    /// Start attempts while a slot is free and something is ready.
    fn pump(&self) {
        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                if inner.destroyed || inner.in_flight >= inner.config.max_concurrent {
                    None
                } else {
                    let best = inner
                        .ready
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, r)| (r.request.priority.rank(), r.seq))
                        .map(|(idx, _)| idx);
                    best.map(|idx| {
                        inner.in_flight += 1;
                        inner.ready.remove(idx)
                    })
                }
            };
            let Some(ready) = next else { break };
            self.spawn_attempt(ready);
        }
    }

    fn spawn_attempt(&self, ready: ReadyRequest) {
        let (api, spawner) = {
            let inner = self.inner.borrow();
            (inner.api.clone(), inner.spawner.clone())
        };
        let weak = Rc::downgrade(&self.inner);
        let sync_id = ready.sync_id.clone();
        let future = async move {
            let result = api.execute(&ready.request).await;
            if let Some(inner) = weak.upgrade() {
                SyncScheduler { inner }.attempt_finished(ready, result);
            }
        };
        let spawned = spawner.spawn_local_obj(LocalFutureObj::new(Box::new(future)));
        if spawned.is_err() {
            log::error!("executor rejected sync attempt {sync_id}");
            self.inner.borrow_mut().in_flight -= 1;
        }
    }

    fn attempt_finished(&self, ready: ReadyRequest, result: Result<Value, SyncError>) {
        let attempts = ready.attempt + 1;
        let sync_id = ready.sync_id.clone();
        let operation_id = ready.request.operation_id.clone();
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return;
            }
            inner.in_flight -= 1;
            match result {
                Ok(value) => Some(Ok(value)),
                Err(error) if error.retryable && ready.attempt < ready.request.max_retries => {
                    let delay =
                        inner.config.backoff_base * 2u32.saturating_pow(ready.attempt.min(16));
                    log::info!(
                        "sync {sync_id} attempt {attempts} failed ({error}); retrying in {delay:?}"
                    );
                    self.arm_backoff(&mut inner, ready, delay);
                    None
                }
                Err(error) => {
                    // Either never retryable, or the budget just ran out.
                    // Both are terminal, and terminal errors carry
                    // retryable = false downstream.
                    let error = if error.retryable {
                        error.into_terminal(attempts)
                    } else {
                        error
                    };
                    log::warn!("sync {sync_id} failed terminally: {error}");
                    Some(Err(error))
                }
            }
            .map(|result| SyncOutcome {
                sync_id: sync_id.clone(),
                operation_id: operation_id.clone(),
                attempts,
                result,
            })
        };
        self.pump();
        if let Some(outcome) = outcome {
            self.emit(&outcome);
        }
    }

    fn arm_backoff(
        &self,
        inner: &mut SchedulerInner,
        mut ready: ReadyRequest,
        delay: std::time::Duration,
    ) {
        ready.attempt += 1;
        let seq = ready.seq;
        let weak = Rc::downgrade(&self.inner);
        let handle = inner.timers.set_timeout(
            delay,
            Box::new(move || {
                if let Some(rc) = weak.upgrade() {
                    let scheduler = SyncScheduler { inner: rc };
                    {
                        let mut inner = scheduler.inner.borrow_mut();
                        if inner.destroyed {
                            return;
                        }
                        inner.backoff.remove(&seq);
                        inner.ready.push(ready);
                    }
                    scheduler.pump();
                }
            }),
        );
        inner.backoff.insert(seq, handle);
    }

    fn emit(&self, outcome: &SyncOutcome) {
        let handlers: Vec<Rc<dyn Fn(&SyncOutcome)>> =
            self.inner.borrow().handlers.values().cloned().collect();
        for handler in handlers {
            handler(outcome);
        }
    }
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SyncScheduler")
            .field("ready", &inner.ready.len())
            .field("in_flight", &inner.in_flight)
            .finish()
    }
}
