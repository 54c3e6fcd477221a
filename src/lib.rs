//! # tank-rl - Online Deep Q-Learning for arena agents
//!
//! tank-rl learns a policy for game entities while the game runs. The
//! simulation encodes each entity's view into a fixed-length observation,
//! shapes a reward, and hands both to a learner on its own thread; the learner
//! answers with a discrete action id that the simulation decodes into a
//! movement/fire intent.
//!
//! ## Key Features
//!
//! - **Feature encoding**: 27 normalized features per entity
//! - **Reward shaping**: dense approach/aim/idle terms plus named sparse events
//! - **DQN**: epsilon-greedy acting, replay store, masked target update, target network
//! - **Non-blocking bridge**: bounded queues, per-entity action cache with staleness fallback
//! - **Persistence**: model snapshots to a local directory or a remote key-value backend
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tank_rl::bridge::{AgentBridge, ObservePayload};
//! use tank_rl::config::AgentConfig;
//! use tank_rl::encoder::OBSERVATION_SIZE;
//!
//! let config = AgentConfig::default();
//! let action_count = config.action_count();
//! let mut bridge = AgentBridge::new(config);
//! bridge.init(OBSERVATION_SIZE, action_count);
//!
//! bridge.observe(ObservePayload {
//!     entity_id: "tank-1".to_string(),
//!     observation: vec![0.0; OBSERVATION_SIZE],
//!     reward: 0.0,
//!     done: false,
//! });
//! let action = bridge.get_action("tank-1");
//! let intent = bridge.config().action_table.decode(action);
//! # let _ = intent;
//! bridge.release();
//! ```
//!
//! ## Module Organization
//!
//! - [`action`] - Action table and decoding into control intents
//! - [`activations`] - Activation functions
//! - [`agent`] - DQN agent and its online/target network pair
//! - [`bridge`] - Learner thread, request/response protocol, action cache
//! - [`config`] - Learner configuration
//! - [`encoder`] - Observation encoding
//! - [`engine`] - Learner/actor engine and its lifecycle
//! - [`environment`] - What the learner needs to know about the game world
//! - [`error`] - Error types and result handling
//! - [`layers`] - Dense layers and weight initialization
//! - [`loss`] - Loss functions for training
//! - [`network`] - Core neural network implementation
//! - [`optimizer`] - Optimization algorithms
//! - [`persistence`] - Model snapshots and snapshot stores
//! - [`replay_buffer`] - Experience store
//! - [`reward`] - Reward shaping and reward weights
//! - [`tracking`] - Per-entity counters on the simulation side

pub mod action;
pub mod activations;
pub mod agent;
pub mod bridge;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod environment;
pub mod error;
pub mod layers;
pub mod loss;
pub mod network;
pub mod optimizer;
pub mod persistence;
pub mod replay_buffer;
pub mod reward;
pub mod tracking;

#[cfg(test)]
mod tests;
