//! Learner/actor engine: one DQN agent, its replay store and the per-entity
//! pending `(state, action)` pairs that turn consecutive observations into
//! transitions.
//!
//! [`EngineState`] only exists once initialized; [`Engine`] wraps it in the
//! `Uninitialized -> Ready` lifecycle where every operation before `init` is
//! a no-op.

use std::collections::{BTreeMap, HashMap};

use ndarray::{Array1, ArrayView1};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agent::DqnAgent;
use crate::config::AgentConfig;
use crate::error::{Result, TankRlError};
use crate::persistence::{ModelSnapshot, SnapshotStore, TrainingConfig};
use crate::replay_buffer::{ExperienceStore, Transition};

/// Outcome of one processed observation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub entity_id: String,
    /// `None` when the observation ended the entity's episode.
    pub action: Option<usize>,
    pub epsilon: f32,
    pub step: u64,
    pub episode: u64,
    pub reward: f32,
    /// Loss of the gradient step run on this observation, if any.
    pub loss: Option<f32>,
    /// A snapshot of the online network should be written now.
    pub snapshot_due: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    pub steps: u64,
    pub episodes: u64,
    pub epsilon: f32,
    pub last_loss: Option<f32>,
    pub train_steps: u64,
    pub skipped_updates: u64,
    pub replay_len: usize,
    pub tracked_entities: usize,
}

/// Random source for a config: seeded when `seed` is set, else from the OS.
pub fn rng_from_config(config: &AgentConfig) -> Box<dyn RngCore + Send> {
    match config.seed {
        Some(seed) => Box::new(ChaCha8Rng::seed_from_u64(seed)),
        None => Box::new(ChaCha8Rng::from_entropy()),
    }
}

/// An initialized learner.
pub struct EngineState {
    pub agent: DqnAgent,
    pub store: ExperienceStore,
    pending: HashMap<String, (Array1<f32>, usize)>,
    config: AgentConfig,
    rng: Box<dyn RngCore + Send>,
    steps: u64,
    episodes: u64,
    last_loss: Option<f32>,
}

impl EngineState {
    pub fn new(observation_size: usize, action_count: usize, config: AgentConfig) -> Result<Self> {
        let rng = rng_from_config(&config);
        Self::with_rng(observation_size, action_count, config, rng)
    }

    /// Build with an explicit random source; network initialization draws from it too.
    pub fn with_rng(
        observation_size: usize,
        action_count: usize,
        config: AgentConfig,
        mut rng: Box<dyn RngCore + Send>,
    ) -> Result<Self> {
        config.validate()?;
        let agent = DqnAgent::new(observation_size, action_count, &config, rng.as_mut())?;
        let store = ExperienceStore::new(config.replay_capacity);

        Ok(EngineState {
            agent,
            store,
            pending: HashMap::new(),
            config,
            rng,
            steps: 0,
            episodes: 0,
            last_loss: None,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn observation_size(&self) -> usize {
        self.agent.observation_size()
    }

    pub fn action_count(&self) -> usize {
        self.agent.action_count()
    }

    pub fn epsilon(&self) -> f32 {
        self.agent.epsilon
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    pub fn pending_action(&self, entity_id: &str) -> Option<usize> {
        self.pending.get(entity_id).map(|(_, action)| *action)
    }

    pub fn select_action(&mut self, observation: ArrayView1<f32>) -> usize {
        self.agent.act(observation, self.rng.as_mut())
    }

    fn check_observation(&self, observation: &Array1<f32>) -> Result<()> {
        if observation.len() != self.observation_size() {
            return Err(TankRlError::dimension_mismatch(
                format!("{} observation features", self.observation_size()),
                format!("{} observation features", observation.len()),
            ));
        }
        if observation.iter().any(|v| !v.is_finite()) {
            return Err(TankRlError::Numerical("observation contains non-finite values".to_string()));
        }
        Ok(())
    }

    /// Process one observation for `entity_id`.
    ///
    /// `reward` and `done` belong to the action chosen on this entity's
    /// previous observation; they complete that transition. Unless `done`, a
    /// new action is chosen and remembered for the next call.
    pub fn observe(&mut self, entity_id: &str, observation: Array1<f32>, reward: f32, done: bool) -> Result<StepReport> {
        self.check_observation(&observation)?;
        if !reward.is_finite() {
            return Err(TankRlError::Numerical(format!("non-finite reward {}", reward)));
        }
        if !done && !self.pending.contains_key(entity_id) && self.pending.len() >= self.config.max_tracked_entities {
            return Err(TankRlError::invalid_parameter(
                "entity_id".to_string(),
                format!("{} not admitted, {} entities already tracked", entity_id, self.pending.len()),
            ));
        }

        if let Some((state, action)) = self.pending.remove(entity_id) {
            self.store.add(Transition {
                state,
                action,
                reward,
                next_state: observation.clone(),
                done,
            });
        }

        let action = if done {
            self.episodes += 1;
            debug!(entity_id, episodes = self.episodes, "episode finished");
            None
        } else {
            let action = self.select_action(observation.view());
            self.pending.insert(entity_id.to_string(), (observation, action));
            Some(action)
        };

        self.steps += 1;
        self.agent.decay_epsilon();

        let mut loss = None;
        if self.steps % self.config.train_every == 0 && self.store.len() >= self.config.batch_size {
            loss = self.train_step()?;
        }
        if self.steps % self.config.target_sync_every == 0 {
            self.sync()?;
        }

        let snapshot_due = (self.config.save_every_steps > 0 && self.steps % self.config.save_every_steps == 0)
            || (done && self.config.save_every_episodes > 0 && self.episodes % self.config.save_every_episodes == 0);

        Ok(StepReport {
            entity_id: entity_id.to_string(),
            action,
            epsilon: self.agent.epsilon,
            step: self.steps,
            episode: self.episodes,
            reward,
            loss,
            snapshot_due,
        })
    }

    /// One gradient step on a uniformly sampled batch. `Ok(None)` when the
    /// store is empty or the update was rolled back.
    pub fn train_step(&mut self) -> Result<Option<f32>> {
        let batch_size = self.config.batch_size.min(self.store.len());
        if batch_size == 0 {
            return Ok(None);
        }
        let batch = self.store.sample(batch_size, self.rng.as_mut());
        let loss = self.agent.train_on_batch(&batch)?;
        if loss.is_some() {
            self.last_loss = loss;
        }
        Ok(loss)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.agent.update_target_network()?;
        debug!(step = self.steps, "target network synced");
        Ok(())
    }

    /// Capture the online network as it is right now.
    pub fn snapshot(&self) -> ModelSnapshot {
        let training_config = TrainingConfig {
            optimizer: self.agent.networks.online.optimizer.name().to_string(),
            loss: "meanSquaredError".to_string(),
            learning_rate: self.agent.learning_rate,
            gamma: self.agent.gamma,
        };
        let mut metadata = BTreeMap::new();
        metadata.insert("steps".to_string(), self.steps.to_string());
        metadata.insert("episodes".to_string(), self.episodes.to_string());
        metadata.insert("epsilon".to_string(), self.agent.epsilon.to_string());

        ModelSnapshot::from_network(&self.agent.networks.online, Some(training_config)).with_metadata(metadata)
    }

    /// Replace the online network with the snapshot's and rebuild the target from it.
    pub fn restore_snapshot(&mut self, snapshot: &ModelSnapshot) -> Result<()> {
        let network = snapshot.to_network(self.agent.networks.online.optimizer.fresh())?;
        if network.input_size() != self.observation_size() || network.output_size() != self.action_count() {
            return Err(TankRlError::dimension_mismatch(
                format!("{} -> {}", self.observation_size(), self.action_count()),
                format!("{} -> {}", network.input_size(), network.output_size()),
            ));
        }
        self.agent.networks.replace_online(network);
        Ok(())
    }

    /// Best-effort warm start. Any failure keeps the fresh network and returns `false`.
    pub fn load_snapshot(&mut self, store: &dyn SnapshotStore, key: &str) -> bool {
        match store.load(key) {
            Ok(Some(snapshot)) => self.restore_loaded(key, &snapshot),
            Ok(None) => {
                info!(key, "no stored model, starting fresh");
                false
            }
            Err(err) => {
                warn!(key, error = %err, "model load failed, starting fresh");
                false
            }
        }
    }

    /// Apply a snapshot fetched elsewhere, logging instead of failing.
    pub fn restore_loaded(&mut self, key: &str, snapshot: &ModelSnapshot) -> bool {
        match self.restore_snapshot(snapshot) {
            Ok(()) => {
                info!(key, "loaded stored model");
                true
            }
            Err(err) => {
                warn!(key, error = %err, "stored model rejected, starting fresh");
                false
            }
        }
    }

    pub fn save_snapshot(&self, store: &dyn SnapshotStore, key: &str) -> Result<()> {
        store.save(key, &self.snapshot())?;
        info!(key, step = self.steps, "model saved");
        Ok(())
    }

    /// Forget the pending pair of one entity without recording a transition.
    pub fn forget(&mut self, entity_id: &str) -> bool {
        self.pending.remove(entity_id).is_some()
    }

    pub fn stats(&self) -> TrainingStats {
        TrainingStats {
            steps: self.steps,
            episodes: self.episodes,
            epsilon: self.agent.epsilon,
            last_loss: self.last_loss,
            train_steps: self.agent.train_steps,
            skipped_updates: self.agent.skipped_updates,
            replay_len: self.store.len(),
            tracked_entities: self.pending.len(),
        }
    }
}

/// `Uninitialized -> Ready` lifecycle around [`EngineState`].
#[derive(Default)]
pub struct Engine {
    state: Option<EngineState>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when this call initialized the engine. A second call,
    /// or one with unusable sizes, is logged and changes nothing.
    pub fn init(&mut self, observation_size: usize, action_count: usize, config: AgentConfig) -> bool {
        let rng = rng_from_config(&config);
        self.init_with_rng(observation_size, action_count, config, rng)
    }

    pub fn init_with_rng(
        &mut self,
        observation_size: usize,
        action_count: usize,
        config: AgentConfig,
        rng: Box<dyn RngCore + Send>,
    ) -> bool {
        if self.state.is_some() {
            warn!("engine already initialized, ignoring init");
            return false;
        }
        match EngineState::with_rng(observation_size, action_count, config, rng) {
            Ok(state) => {
                info!(observation_size, action_count, "engine initialized");
                self.state = Some(state);
                true
            }
            Err(err) => {
                warn!(error = %err, "engine init rejected");
                false
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&EngineState> {
        self.state.as_ref()
    }

    pub fn state_mut(&mut self) -> Option<&mut EngineState> {
        self.state.as_mut()
    }

    pub fn select_action(&mut self, observation: ArrayView1<f32>) -> Option<usize> {
        self.state.as_mut().map(|state| state.select_action(observation))
    }

    pub fn observe(&mut self, entity_id: &str, observation: Array1<f32>, reward: f32, done: bool) -> Result<Option<StepReport>> {
        match self.state.as_mut() {
            Some(state) => state.observe(entity_id, observation, reward, done).map(Some),
            None => Ok(None),
        }
    }

    pub fn train_step(&mut self) -> Result<Option<f32>> {
        match self.state.as_mut() {
            Some(state) => state.train_step(),
            None => Ok(None),
        }
    }

    pub fn sync(&mut self) -> bool {
        match self.state.as_mut() {
            Some(state) => state.sync().is_ok(),
            None => false,
        }
    }

    pub fn load_snapshot(&mut self, store: &dyn SnapshotStore, key: &str) -> bool {
        match self.state.as_mut() {
            Some(state) => state.load_snapshot(store, key),
            None => false,
        }
    }

    pub fn snapshot(&self) -> Option<ModelSnapshot> {
        self.state.as_ref().map(EngineState::snapshot)
    }

    pub fn stats(&self) -> Option<TrainingStats> {
        self.state.as_ref().map(EngineState::stats)
    }
}
