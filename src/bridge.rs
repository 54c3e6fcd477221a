//! Simulation-side handle to a learner running on its own thread.
//!
//! ```text
//!   simulation thread                 dqn-learner                 dqn-persistence
//!     observe() --try_send--> [requests: bounded] --> Engine
//!                                                      |  snapshot_due
//!                                                      +--try_send--> [jobs: bounded] --> SnapshotStore
//!     pump()  <--try_recv-- [responses: bounded] <----+                     |
//!                                  ^                                        |
//!                                  +-------- SnapshotLoaded ----------------+
//! ```
//!
//! The simulation never blocks on training: observations are dropped (and
//! counted) when the request queue is full, and actions are read from a
//! per-entity cache refreshed by [`AgentBridge::pump`]. The learner never
//! blocks on persistence: jobs are offered with `try_send` and loads come back
//! as an ordinary request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use ndarray::Array1;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::SampleMode;
use crate::config::{AgentConfig, PersistenceMode};
use crate::engine::Engine;
use crate::error::{Result, TankRlError};
use crate::persistence::{store_from_config, ModelSnapshot, SnapshotStore};

/// One observation of one entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservePayload {
    pub entity_id: String,
    pub observation: Vec<f32>,
    /// Reward earned by the action chosen on the previous observation.
    pub reward: f32,
    pub done: bool,
}

/// Messages consumed by the learner thread, in arrival order.
#[derive(Debug)]
pub enum Request {
    Init {
        observation_size: usize,
        action_count: usize,
        config: Box<AgentConfig>,
    },
    /// Warm-start from the store; `None` uses the configured key.
    LoadSnapshot { storage_key: Option<String> },
    /// Posted by the persistence worker when a load finishes.
    SnapshotLoaded {
        storage_key: String,
        allocated_key: Option<String>,
        result: Result<Option<ModelSnapshot>>,
    },
    Observe(ObservePayload),
    Release,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Action {
        entity_id: String,
        action: Option<usize>,
        epsilon: f32,
        step: u64,
        episode: u64,
        reward: f32,
        loss: Option<f32>,
    },
    Allocated { model_key: String },
    Error { message: String },
}

/// Last action received for an entity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActionRecord {
    pub action: usize,
    pub received_at: Instant,
}

impl ActionRecord {
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.received_at) > timeout
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionSource {
    Cached,
    Missing,
    Stale,
    StuckOverride,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedAction {
    pub action: usize,
    pub source: ActionSource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    BuiltState,
    SentObserve,
}

/// Read-only telemetry, refreshed on every `Action` response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugSnapshot {
    pub entity_id: Option<String>,
    pub action: Option<usize>,
    pub reward: f32,
    pub epsilon: f32,
    pub loss: Option<f32>,
    pub step: u64,
    pub episode: u64,
    pub built_state: bool,
    pub sent_observe: bool,
    pub dropped_observations: u64,
    /// Learner responses lost to a full response queue.
    pub dropped_responses: u64,
    pub model_key: Option<String>,
    pub last_error: Option<String>,
}

enum PersistenceJob {
    Load {
        storage_key: String,
        allocate_for: Option<String>,
    },
    Save {
        storage_key: String,
        snapshot: Box<ModelSnapshot>,
    },
    ReleaseKey {
        map_key: String,
        model_key: String,
    },
}

pub struct AgentBridge {
    config: AgentConfig,
    store: Option<Box<dyn SnapshotStore>>,
    requests: Option<Sender<Request>>,
    responses: Option<Receiver<Response>>,
    learner: Option<JoinHandle<()>>,
    actions: HashMap<String, ActionRecord>,
    debug: DebugSnapshot,
    dropped_responses: Arc<AtomicU64>,
    rng: Box<dyn RngCore + Send>,
    initialized: bool,
    released: bool,
}

impl AgentBridge {
    /// Bridge whose store is chosen by `config.persistence`.
    pub fn new(config: AgentConfig) -> Self {
        let store = match store_from_config(&config.persistence) {
            Ok(store) => store,
            Err(err) => {
                warn!(error = %err, "persistence unavailable, running without a store");
                None
            }
        };
        Self::with_store(config, store)
    }

    pub fn with_store(config: AgentConfig, store: Option<Box<dyn SnapshotStore>>) -> Self {
        let rng: Box<dyn RngCore + Send> = match config.seed {
            Some(seed) => Box::new(ChaCha8Rng::seed_from_u64(seed.wrapping_add(1))),
            None => Box::new(ChaCha8Rng::from_entropy()),
        };
        AgentBridge {
            config,
            store,
            requests: None,
            responses: None,
            learner: None,
            actions: HashMap::new(),
            debug: DebugSnapshot::default(),
            dropped_responses: Arc::new(AtomicU64::new(0)),
            rng,
            initialized: false,
            released: false,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized && !self.released
    }

    /// Start the learner and ask it for a warm start. Only the first call
    /// does anything; it returns `true` when the learner is running.
    pub fn init(&mut self, observation_size: usize, action_count: usize) -> bool {
        if self.initialized || self.released {
            debug!("bridge already initialized");
            return false;
        }
        match self.start(observation_size, action_count) {
            Ok(()) => {
                self.initialized = true;
                info!(observation_size, action_count, "learner started");
                true
            }
            Err(err) => {
                warn!(error = %err, "learner failed to start");
                self.debug.last_error = Some(err.to_string());
                false
            }
        }
    }

    fn start(&mut self, observation_size: usize, action_count: usize) -> Result<()> {
        let capacity = self.config.request_queue_capacity.max(1);
        let (request_tx, request_rx) = bounded(capacity);
        let (response_tx, response_rx) = bounded(capacity);

        let outbox = Outbox {
            responses: response_tx,
            dropped: Arc::clone(&self.dropped_responses),
        };

        let jobs = match self.store.take() {
            Some(store) => Some(spawn_persistence(
                store,
                self.config.persistence.base_model_storage_key.clone(),
                capacity,
                request_tx.clone(),
                outbox.clone(),
            )?),
            None => None,
        };

        let map_key = match self.config.persistence.mode {
            PersistenceMode::Remote => self.config.persistence.map_key.clone(),
            _ => None,
        };
        // With a store attached, saves wait for the warm-start load to settle
        // the key, which may be a per-map key handed out by the backend.
        let default_key = self.config.storage_key().to_string();
        let storage_key = match jobs {
            Some(_) => None,
            None => Some(default_key.clone()),
        };
        let learner = Learner {
            engine: Engine::new(),
            inbox: request_rx,
            outbox,
            jobs,
            default_key,
            storage_key,
            save_pending: false,
            map_key,
            allocated_key: None,
        };
        let handle = thread::Builder::new()
            .name("dqn-learner".into())
            .spawn(move || learner.run())?;

        request_tx
            .send(Request::Init {
                observation_size,
                action_count,
                config: Box::new(self.config.clone()),
            })
            .map_err(|_| TankRlError::ChannelClosed("learner exited during init".to_string()))?;
        request_tx
            .send(Request::LoadSnapshot { storage_key: None })
            .map_err(|_| TankRlError::ChannelClosed("learner exited during init".to_string()))?;

        self.requests = Some(request_tx);
        self.responses = Some(response_rx);
        self.learner = Some(handle);
        Ok(())
    }

    /// Forward an observation without blocking. Returns `false` when it was
    /// not queued: bridge not running, queue full (counted) or learner gone.
    pub fn observe(&mut self, payload: ObservePayload) -> bool {
        if !self.is_initialized() {
            return false;
        }
        let Some(requests) = self.requests.as_ref() else {
            return false;
        };
        match requests.try_send(Request::Observe(payload)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.debug.dropped_observations += 1;
                debug!(dropped = self.debug.dropped_observations, "request queue full, observation dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.debug.last_error = Some("learner thread is gone".to_string());
                false
            }
        }
    }

    /// Drain every pending response into the action cache and telemetry.
    pub fn pump(&mut self) -> usize {
        let Some(responses) = self.responses.as_ref() else {
            return 0;
        };
        let drained: Vec<Response> = responses.try_iter().collect();
        let count = drained.len();
        for response in drained {
            self.apply(response);
        }
        count
    }

    fn apply(&mut self, response: Response) {
        match response {
            Response::Action {
                entity_id,
                action,
                epsilon,
                step,
                episode,
                reward,
                loss,
            } => {
                match action {
                    Some(action) => {
                        self.actions.insert(
                            entity_id.clone(),
                            ActionRecord {
                                action,
                                received_at: Instant::now(),
                            },
                        );
                    }
                    None => {
                        self.actions.remove(&entity_id);
                    }
                }
                self.debug.entity_id = Some(entity_id);
                self.debug.action = action;
                self.debug.epsilon = epsilon;
                self.debug.step = step;
                self.debug.episode = episode;
                self.debug.reward = reward;
                if loss.is_some() {
                    self.debug.loss = loss;
                }
            }
            Response::Allocated { model_key } => {
                info!(model_key = %model_key, "model key allocated");
                self.debug.model_key = Some(model_key);
            }
            Response::Error { message } => {
                warn!(message = %message, "learner reported an error");
                self.debug.last_error = Some(message);
            }
        }
    }

    /// Cached action for the entity, or 0 (idle) when there is none.
    pub fn get_action(&mut self, entity_id: &str) -> usize {
        self.pump();
        self.actions.get(entity_id).map(|record| record.action).unwrap_or(0)
    }

    pub fn action_record(&mut self, entity_id: &str) -> Option<ActionRecord> {
        self.pump();
        self.actions.get(entity_id).copied()
    }

    /// Action to apply this tick. Entities idle for `stuck_action_threshold`
    /// ticks get a random one from `stuck_action_mode`; missing or stale
    /// cached actions fall back to a uniform random one.
    pub fn resolve_action(&mut self, entity_id: &str, idle_ticks: u32, now: Instant) -> ResolvedAction {
        self.pump();
        let table = &self.config.action_table;

        if self.config.stuck_action_threshold > 0 && idle_ticks >= self.config.stuck_action_threshold {
            return ResolvedAction {
                action: table.sample(self.config.stuck_action_mode, self.rng.as_mut()),
                source: ActionSource::StuckOverride,
            };
        }

        let timeout = Duration::from_millis(self.config.action_response_timeout_ms);
        match self.actions.get(entity_id) {
            Some(record) if !record.is_stale(now, timeout) => ResolvedAction {
                action: record.action,
                source: ActionSource::Cached,
            },
            Some(_) => ResolvedAction {
                action: table.sample(SampleMode::Any, self.rng.as_mut()),
                source: ActionSource::Stale,
            },
            None => ResolvedAction {
                action: table.sample(SampleMode::Any, self.rng.as_mut()),
                source: ActionSource::Missing,
            },
        }
    }

    pub fn reset_episode(&mut self) {
        self.actions.clear();
    }

    pub fn mark_stage(&mut self, stage: Stage) {
        match stage {
            Stage::BuiltState => self.debug.built_state = true,
            Stage::SentObserve => self.debug.sent_observe = true,
        }
    }

    pub fn debug_snapshot(&mut self) -> DebugSnapshot {
        self.pump();
        self.debug.dropped_responses = self.dropped_responses();
        self.debug.clone()
    }

    pub fn dropped_observations(&self) -> u64 {
        self.debug.dropped_observations
    }

    pub fn dropped_responses(&self) -> u64 {
        self.dropped_responses.load(Ordering::Relaxed)
    }

    /// Stop the learner and wait for it. Any allocated model key is handed
    /// back by the persistence worker, which is left to finish on its own.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        if let Some(requests) = self.requests.take() {
            if requests.send(Request::Release).is_err() {
                debug!("learner already gone at release");
            }
        }
        let joined = match self.learner.take() {
            Some(handle) => handle.join().is_ok(),
            None => true,
        };
        self.pump();
        self.responses = None;
        self.actions.clear();
        info!(joined, "learner released");
        joined
    }
}

impl Drop for AgentBridge {
    fn drop(&mut self) {
        if self.initialized && !self.released {
            self.release();
        }
    }
}

/// Non-blocking sender for learner responses that counts what it drops.
#[derive(Clone)]
struct Outbox {
    responses: Sender<Response>,
    dropped: Arc<AtomicU64>,
}

impl Outbox {
    fn send(&self, response: Response) {
        if let Err(TrySendError::Full(response)) = self.responses.try_send(response) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(?response, dropped, "response queue full, response dropped");
        }
    }
}

struct Learner {
    engine: Engine,
    inbox: Receiver<Request>,
    outbox: Outbox,
    jobs: Option<Sender<PersistenceJob>>,
    default_key: String,
    /// `None` until the warm-start load has resolved the key to write to.
    storage_key: Option<String>,
    /// A save came due while `storage_key` was unresolved.
    save_pending: bool,
    map_key: Option<String>,
    allocated_key: Option<String>,
}

impl Learner {
    fn run(mut self) {
        while let Ok(request) = self.inbox.recv() {
            match request {
                Request::Init {
                    observation_size,
                    action_count,
                    config,
                } => {
                    if !self.engine.init(observation_size, action_count, *config) {
                        self.respond(Response::Error {
                            message: "learner init ignored".to_string(),
                        });
                    }
                }
                Request::LoadSnapshot { storage_key } => {
                    let storage_key = storage_key
                        .or_else(|| self.storage_key.clone())
                        .unwrap_or_else(|| self.default_key.clone());
                    let submitted = self.submit(PersistenceJob::Load {
                        storage_key,
                        allocate_for: self.map_key.clone(),
                    });
                    if !submitted && self.storage_key.is_none() {
                        self.resolve_storage_key(self.default_key.clone());
                    }
                }
                Request::SnapshotLoaded {
                    storage_key,
                    allocated_key,
                    result,
                } => self.on_loaded(storage_key, allocated_key, result),
                Request::Observe(payload) => self.on_observe(payload),
                Request::Release => break,
            }
        }

        if let (Some(map_key), Some(model_key)) = (self.map_key.take(), self.allocated_key.take()) {
            self.submit(PersistenceJob::ReleaseKey { map_key, model_key });
        }
        debug!("learner loop finished");
    }

    fn on_loaded(&mut self, storage_key: String, allocated_key: Option<String>, result: Result<Option<ModelSnapshot>>) {
        if let Some(model_key) = allocated_key {
            self.allocated_key = Some(model_key.clone());
            self.respond(Response::Allocated { model_key });
        }

        if let Some(state) = self.engine.state_mut() {
            match result {
                Ok(Some(snapshot)) => {
                    state.restore_loaded(&storage_key, &snapshot);
                }
                Ok(None) => info!(key = %storage_key, "no stored model, starting fresh"),
                Err(err) => warn!(key = %storage_key, error = %err, "model load failed, starting fresh"),
            }
        }
        self.resolve_storage_key(storage_key);
    }

    /// Settle the key saves go to and flush a save deferred until now.
    fn resolve_storage_key(&mut self, storage_key: String) {
        self.storage_key = Some(storage_key);
        if std::mem::take(&mut self.save_pending) {
            self.save_snapshot();
        }
    }

    fn save_snapshot(&mut self) {
        let Some(storage_key) = self.storage_key.clone() else {
            debug!("model key not resolved yet, deferring save");
            self.save_pending = true;
            return;
        };
        if let Some(state) = self.engine.state() {
            let snapshot = Box::new(state.snapshot());
            self.submit(PersistenceJob::Save { storage_key, snapshot });
        }
    }

    fn on_observe(&mut self, payload: ObservePayload) {
        let ObservePayload {
            entity_id,
            observation,
            reward,
            done,
        } = payload;

        match self.engine.observe(&entity_id, Array1::from_vec(observation), reward, done) {
            Ok(Some(report)) => {
                if report.snapshot_due {
                    self.save_snapshot();
                }
                self.respond(Response::Action {
                    entity_id: report.entity_id,
                    action: report.action,
                    epsilon: report.epsilon,
                    step: report.step,
                    episode: report.episode,
                    reward: report.reward,
                    loss: report.loss,
                });
            }
            Ok(None) => debug!(entity_id = %entity_id, "observation before init ignored"),
            Err(err) => self.respond(Response::Error {
                message: format!("observation from {} rejected: {}", entity_id, err),
            }),
        }
    }

    /// Offer a job to the persistence worker; `false` when it was not queued.
    fn submit(&self, job: PersistenceJob) -> bool {
        let Some(jobs) = self.jobs.as_ref() else {
            return false;
        };
        match jobs.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.respond(Response::Error {
                    message: "persistence queue full, job dropped".to_string(),
                });
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.respond(Response::Error {
                    message: "persistence worker is gone".to_string(),
                });
                false
            }
        }
    }

    fn respond(&self, response: Response) {
        self.outbox.send(response);
    }
}

fn spawn_persistence(
    store: Box<dyn SnapshotStore>,
    base_key: String,
    capacity: usize,
    inbox: Sender<Request>,
    outbox: Outbox,
) -> Result<Sender<PersistenceJob>> {
    let (job_tx, job_rx) = bounded::<PersistenceJob>(capacity);
    thread::Builder::new().name("dqn-persistence".into()).spawn(move || {
        for job in job_rx.iter() {
            match job {
                PersistenceJob::Load {
                    storage_key,
                    allocate_for,
                } => {
                    let allocated_key = allocate_for.and_then(|map_key| match store.allocate_key(&map_key, &base_key) {
                        Ok(key) => key,
                        Err(err) => {
                            warn!(map_key = %map_key, error = %err, "model key allocation failed");
                            None
                        }
                    });
                    let storage_key = allocated_key.clone().unwrap_or(storage_key);
                    let result = store.load(&storage_key);
                    let loaded = Request::SnapshotLoaded {
                        storage_key,
                        allocated_key,
                        result,
                    };
                    if inbox.send(loaded).is_err() {
                        break;
                    }
                }
                PersistenceJob::Save { storage_key, snapshot } => match store.save(&storage_key, &snapshot) {
                    Ok(()) => info!(key = %storage_key, "model saved"),
                    Err(err) => {
                        let message = format!("model save to {} failed: {}", storage_key, err);
                        warn!(message = %message);
                        outbox.send(Response::Error { message });
                    }
                },
                PersistenceJob::ReleaseKey { map_key, model_key } => match store.release_key(&map_key, &model_key) {
                    Ok(()) => info!(model_key = %model_key, "model key released"),
                    Err(err) => warn!(model_key = %model_key, error = %err, "model key release failed"),
                },
            }
        }
    })?;
    Ok(job_tx)
}
