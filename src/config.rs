//! Learner configuration, resolved once when an engine is built.
//!
//! Every field has a default, so a config file only needs the values it
//! changes. Files may be TOML or JSON; keys are camelCase.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::action::{ActionTable, SampleMode};
use crate::encoder::EncoderScale;
use crate::error::{Result, TankRlError};
use crate::layers::WeightInit;
use crate::optimizer::OptimizerKind;
use crate::reward::{RewardShaper, RewardWeights};

/// Multiplicative epsilon decay toward a floor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EpsilonSchedule {
    pub start: f32,
    pub min: f32,
    pub decay_rate: f32,
}

impl Default for EpsilonSchedule {
    fn default() -> Self {
        EpsilonSchedule {
            start: 1.0,
            min: 0.1,
            decay_rate: 0.9995,
        }
    }
}

impl EpsilonSchedule {
    /// Next epsilon after one processed observation.
    pub fn step(&self, epsilon: f32) -> f32 {
        (epsilon * self.decay_rate).max(self.min)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    #[default]
    Disabled,
    /// Snapshot files under `local_dir`.
    Local,
    /// HTTP key-value backend at `backend_url`.
    Remote,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistenceConfig {
    pub mode: PersistenceMode,
    pub backend_url: String,
    pub local_dir: String,
    pub model_storage_key: String,
    /// Prefix for keys handed out by the backend's allocator.
    pub base_model_storage_key: String,
    /// When set (remote mode), a per-map model key is allocated before loading.
    pub map_key: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            mode: PersistenceMode::Disabled,
            backend_url: "http://127.0.0.1:5050/api/rl".to_string(),
            local_dir: "models".to_string(),
            model_storage_key: "tank-ai-dqn".to_string(),
            base_model_storage_key: "tank-ai-dqn".to_string(),
            map_key: None,
            request_timeout_ms: 5000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub hidden_layers: Vec<usize>,
    pub optimizer: OptimizerKind,
    pub weight_init: WeightInit,
    pub learning_rate: f32,
    pub gamma: f32,
    pub batch_size: usize,
    pub replay_capacity: usize,
    pub train_every: u64,
    pub target_sync_every: u64,
    pub epsilon: EpsilonSchedule,
    /// 0 disables step-based saving.
    pub save_every_steps: u64,
    /// 0 disables episode-based saving.
    pub save_every_episodes: u64,
    pub action_table: ActionTable,
    pub aim_dot_threshold: f32,
    pub idle_tick_threshold: u32,
    pub direction_change_cooldown: u32,
    pub reward_weights: RewardWeights,
    pub action_response_timeout_ms: u64,
    pub stuck_action_threshold: u32,
    pub stuck_action_mode: SampleMode,
    /// Ticks between two observations of the same entity.
    pub transition_interval: u32,
    pub max_tracked_entities: usize,
    pub request_queue_capacity: usize,
    pub max_speed: f32,
    pub max_tile_id: u8,
    pub type_labels: Vec<String>,
    pub persistence: PersistenceConfig,
    /// Seed for the learner's random source; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            hidden_layers: vec![64, 64],
            optimizer: OptimizerKind::Adam,
            weight_init: WeightInit::GlorotUniform,
            learning_rate: 0.001,
            gamma: 0.95,
            batch_size: 32,
            replay_capacity: 10_000,
            train_every: 3,
            target_sync_every: 200,
            epsilon: EpsilonSchedule::default(),
            save_every_steps: 2000,
            save_every_episodes: 3,
            action_table: ActionTable::default(),
            aim_dot_threshold: 0.85,
            idle_tick_threshold: 20,
            direction_change_cooldown: 6,
            reward_weights: RewardWeights::default(),
            action_response_timeout_ms: 200,
            stuck_action_threshold: 40,
            stuck_action_mode: SampleMode::Movement,
            transition_interval: 1,
            max_tracked_entities: 256,
            request_queue_capacity: 1024,
            max_speed: 4.0,
            max_tile_id: 7,
            type_labels: vec!["normal".to_string()],
            persistence: PersistenceConfig::default(),
            seed: None,
        }
    }
}

impl AgentConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: AgentConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a `.toml` or `.json` file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("toml") => Self::from_toml_str(&text),
            other => Err(TankRlError::invalid_parameter(
                "config path".to_string(),
                format!("unsupported extension {:?}", other),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, name: &str, reason: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(TankRlError::invalid_parameter(name, reason))
            }
        }

        check(!self.hidden_layers.is_empty(), "hiddenLayers", "at least one hidden layer is required")?;
        check(self.hidden_layers.iter().all(|&n| n > 0), "hiddenLayers", "layer sizes must be positive")?;
        check(self.weight_init.is_valid(), "weightInit", "uniform range must be finite with min <= max")?;
        check(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            "learningRate",
            "must be a positive number",
        )?;
        check((0.0..=1.0).contains(&self.gamma), "gamma", "must be within [0, 1]")?;
        check(self.batch_size > 0, "batchSize", "must be positive")?;
        check(self.replay_capacity > 0, "replayCapacity", "must be positive")?;
        check(self.train_every > 0, "trainEvery", "must be positive")?;
        check(self.target_sync_every > 0, "targetSyncEvery", "must be positive")?;
        check((0.0..=1.0).contains(&self.epsilon.start), "epsilon.start", "must be within [0, 1]")?;
        check((0.0..=1.0).contains(&self.epsilon.min), "epsilon.min", "must be within [0, 1]")?;
        check(self.epsilon.min <= self.epsilon.start, "epsilon.min", "must not exceed epsilon.start")?;
        check(
            self.epsilon.decay_rate > 0.0 && self.epsilon.decay_rate <= 1.0,
            "epsilon.decayRate",
            "must be within (0, 1]",
        )?;
        check(!self.action_table.is_empty(), "actionTable", "must contain at least one action")?;
        check(self.transition_interval > 0, "transitionInterval", "must be positive")?;
        check(self.max_tracked_entities > 0, "maxTrackedEntities", "must be positive")?;
        check(self.request_queue_capacity > 0, "requestQueueCapacity", "must be positive")?;
        Ok(())
    }

    pub fn action_count(&self) -> usize {
        self.action_table.len()
    }

    pub fn reward_shaper(&self) -> RewardShaper {
        RewardShaper::new(
            self.reward_weights.clone(),
            self.aim_dot_threshold,
            self.idle_tick_threshold,
            self.direction_change_cooldown,
        )
    }

    pub fn encoder_scale(&self, map_size: f32) -> EncoderScale {
        EncoderScale {
            map_size,
            max_speed: self.max_speed,
            idle_tick_threshold: self.idle_tick_threshold,
            type_count: self.type_labels.len().max(1),
            max_tile_id: self.max_tile_id,
        }
    }

    /// Storage key used when no key was allocated by the backend.
    pub fn storage_key(&self) -> &str {
        &self.persistence.model_storage_key
    }
}
