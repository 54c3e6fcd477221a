use ndarray::{Array2, ArrayView1};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{AgentConfig, EpsilonSchedule};
use crate::error::{Result, TankRlError};
use crate::network::NeuralNetwork;
use crate::replay_buffer::Transition;

/// Online network plus the lagging copy used for bootstrap targets.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NetworkPair {
    pub online: NeuralNetwork,
    pub target: NeuralNetwork,
}

impl NetworkPair {
    /// Pair `online` with a value copy of itself.
    pub fn new(online: NeuralNetwork) -> Self {
        let target = online.clone();
        NetworkPair { online, target }
    }

    /// Copy online parameters into the target network by value.
    pub fn sync(&mut self) -> Result<()> {
        self.target.copy_weights_from(&self.online)
    }

    /// Replace the online network (e.g. from a snapshot) and rebuild the
    /// target from it.
    pub fn replace_online(&mut self, online: NeuralNetwork) {
        self.target = online.clone();
        self.online = online;
    }
}

/// Deep Q-Network learner: epsilon-greedy acting and masked batch updates.
///
/// The agent never owns a random source; the engine passes its own in so all
/// randomness in one learner comes from a single injectable generator.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DqnAgent {
    pub networks: NetworkPair,

    /// Exploration rate
    pub epsilon: f32,

    pub schedule: EpsilonSchedule,

    /// Discount factor
    pub gamma: f32,

    pub learning_rate: f32,

    /// Gradient steps applied
    pub train_steps: u64,

    /// Gradient steps rolled back because they produced non-finite values
    pub skipped_updates: u64,
}

impl DqnAgent {
    /// Build a fresh agent for `observation_size` inputs and `action_count` outputs.
    pub fn new<R: Rng + ?Sized>(observation_size: usize, action_count: usize, config: &AgentConfig, rng: &mut R) -> Result<Self> {
        if observation_size == 0 || action_count == 0 {
            return Err(TankRlError::invalid_parameter(
                "sizes".to_string(),
                format!("observation size {} and action count {} must be positive", observation_size, action_count),
            ));
        }

        let online = NeuralNetwork::q_network(
            observation_size,
            &config.hidden_layers,
            action_count,
            config.weight_init,
            config.optimizer.build(),
            rng,
        )?;

        Ok(DqnAgent {
            networks: NetworkPair::new(online),
            epsilon: config.epsilon.start,
            schedule: config.epsilon.clone(),
            gamma: config.gamma,
            learning_rate: config.learning_rate,
            train_steps: 0,
            skipped_updates: 0,
        })
    }

    pub fn observation_size(&self) -> usize {
        self.networks.online.input_size()
    }

    pub fn action_count(&self) -> usize {
        self.networks.online.output_size()
    }

    /// Index of the largest Q-value; ties and NaNs resolve to the lowest index.
    pub fn greedy_action(&self, state: ArrayView1<f32>) -> usize {
        let q_values = self.networks.online.forward(state);
        let mut best = 0;
        let mut best_value = f32::NEG_INFINITY;
        for (index, &value) in q_values.iter().enumerate() {
            if value > best_value {
                best = index;
                best_value = value;
            }
        }
        best
    }

    /// Select action using epsilon-greedy policy
    pub fn act(&self, state: ArrayView1<f32>, rng: &mut dyn RngCore) -> usize {
        if rng.gen::<f32>() < self.epsilon {
            rng.gen_range(0..self.action_count())
        } else {
            self.greedy_action(state)
        }
    }

    /// Apply one step of the multiplicative decay; never rises, never drops below the floor.
    pub fn decay_epsilon(&mut self) {
        self.epsilon = self.schedule.step(self.epsilon).min(self.epsilon);
    }

    /// Update target network weights from main network
    pub fn update_target_network(&mut self) -> Result<()> {
        self.networks.sync()
    }

    /// States of the batch and their masked training targets.
    ///
    /// Each row starts as the online network's prediction; only the slot of the
    /// action taken is replaced by `reward + (1 - done) * gamma * max_a target(next)`.
    pub fn compute_targets(&self, experiences: &[&Transition]) -> Result<(Array2<f32>, Array2<f32>)> {
        if experiences.is_empty() {
            return Err(TankRlError::EmptyBuffer("No experiences to train on".to_string()));
        }

        let batch_size = experiences.len();
        let state_size = self.observation_size();
        let action_count = self.action_count();

        let mut states = Array2::zeros((batch_size, state_size));
        let mut next_states = Array2::zeros((batch_size, state_size));
        for (i, exp) in experiences.iter().enumerate() {
            if exp.state.len() != state_size || exp.next_state.len() != state_size {
                return Err(TankRlError::dimension_mismatch(
                    format!("{} state features", state_size),
                    format!("{}/{} state features", exp.state.len(), exp.next_state.len()),
                ));
            }
            if exp.action >= action_count {
                return Err(TankRlError::InvalidAction {
                    action: exp.action,
                    max_actions: action_count,
                });
            }
            states.row_mut(i).assign(&exp.state);
            next_states.row_mut(i).assign(&exp.next_state);
        }

        let mut target_q_values = self.networks.online.forward_batch(states.view());
        let next_q_values = self.networks.target.forward_batch(next_states.view());

        for (i, exp) in experiences.iter().enumerate() {
            let max_next_q = next_q_values
                .row(i)
                .iter()
                .fold(f32::NEG_INFINITY, |max, &val| max.max(val));
            let continuation = if exp.done { 0.0 } else { 1.0 };
            target_q_values[[i, exp.action]] = exp.reward + continuation * self.gamma * max_next_q;
        }

        Ok((states, target_q_values))
    }

    /// Train the online network on a batch.
    ///
    /// Returns `Ok(None)` when the step was rolled back because it produced
    /// non-finite targets, loss, or parameters.
    pub fn train_on_batch(&mut self, experiences: &[&Transition]) -> Result<Option<f32>> {
        let (states, targets) = self.compute_targets(experiences)?;
        if targets.iter().any(|t| !t.is_finite()) {
            self.skipped_updates += 1;
            warn!(skipped = self.skipped_updates, "non-finite training targets, skipping update");
            return Ok(None);
        }

        let backup = self.networks.online.clone();
        match self.networks.online.train_minibatch(states.view(), targets.view(), self.learning_rate) {
            Ok(loss) if self.networks.online.is_finite() => {
                self.train_steps += 1;
                debug!(loss, train_steps = self.train_steps, "trained on batch");
                Ok(Some(loss))
            }
            Ok(_) | Err(TankRlError::Numerical(_)) => {
                self.networks.online = backup;
                self.skipped_updates += 1;
                warn!(skipped = self.skipped_updates, "numerically unstable update rolled back");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}
