//! # Activation Functions
//!
//! The value network only needs a small set of activations: ReLU for the
//! hidden layers, Linear for the Q-value head, and Tanh for experiments with
//! bounded hidden features.

pub mod functions;

pub use functions::Activation;
