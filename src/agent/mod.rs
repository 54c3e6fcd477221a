//! # Deep Q-Network agent
//!
//! `DqnAgent` holds the online/target [`NetworkPair`], the exploration rate and
//! the masked Q-learning update. Episode bookkeeping, the replay store and the
//! periodic schedule live one level up in [`crate::engine`].
//!
//! ```rust,no_run
//! use tank_rl::agent::DqnAgent;
//! use tank_rl::config::AgentConfig;
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//! use ndarray::Array1;
//!
//! let config = AgentConfig::default();
//! let mut rng = ChaCha8Rng::seed_from_u64(7);
//! let agent = DqnAgent::new(27, config.action_count(), &config, &mut rng).unwrap();
//! let action = agent.act(Array1::zeros(27).view(), &mut rng);
//! assert!(action < config.action_count());
//! ```

mod dqn;
pub use dqn::{DqnAgent, NetworkPair};
