use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_rand::rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::error::{Result, TankRlError};
use crate::layers::{DenseLayer, WeightInit};
use crate::loss::{Loss, MSE};
use crate::optimizer::{Optimizer, OptimizerWrapper};

/// A feed-forward network of dense layers with its own optimizer state.
///
/// Inference (`forward`, `forward_batch`) borrows the network immutably so the
/// target network can be evaluated while the online one is being trained.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NeuralNetwork {
    pub layers: Vec<DenseLayer>,
    pub optimizer: OptimizerWrapper,
}

impl NeuralNetwork {
    /// Create a new neural network with the given layer sizes, activations,
    /// weight initialization and optimizer.
    ///
    /// `layer_sizes` includes the input and output sizes; `activations` has one
    /// entry per layer (so `layer_sizes.len() - 1` entries).
    pub fn new<R: Rng + ?Sized>(
        layer_sizes: &[usize],
        activations: &[Activation],
        init: WeightInit,
        optimizer: OptimizerWrapper,
        rng: &mut R,
    ) -> Result<Self> {
        if layer_sizes.len() < 2 {
            return Err(TankRlError::invalid_parameter(
                "layer_sizes",
                "network needs at least an input and an output size",
            ));
        }
        if layer_sizes.iter().any(|&size| size == 0) {
            return Err(TankRlError::invalid_parameter("layer_sizes", "every layer size must be positive"));
        }
        if activations.len() != layer_sizes.len() - 1 {
            return Err(TankRlError::dimension_mismatch(
                format!("{} activations", layer_sizes.len() - 1),
                format!("{} activations", activations.len()),
            ));
        }
        if !init.is_valid() {
            return Err(TankRlError::invalid_parameter("weight_init", "uniform range must be finite with min <= max"));
        }

        let layers = layer_sizes
            .windows(2)
            .zip(activations.iter())
            .map(|(window, &activation)| DenseLayer::new(window[0], window[1], activation, init, rng))
            .collect::<Vec<_>>();

        Ok(NeuralNetwork { layers, optimizer })
    }

    /// ReLU hidden layers and a linear head, the usual Q-network shape.
    pub fn q_network<R: Rng + ?Sized>(
        input_size: usize,
        hidden_layers: &[usize],
        output_size: usize,
        init: WeightInit,
        optimizer: OptimizerWrapper,
        rng: &mut R,
    ) -> Result<Self> {
        let mut sizes = Vec::with_capacity(hidden_layers.len() + 2);
        sizes.push(input_size);
        sizes.extend_from_slice(hidden_layers);
        sizes.push(output_size);

        let mut activations = vec![Activation::Relu; sizes.len() - 2];
        activations.push(Activation::Linear);

        Self::new(&sizes, &activations, init, optimizer, rng)
    }

    pub fn input_size(&self) -> usize {
        self.layers.first().map(|layer| layer.input_size()).unwrap_or(0)
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map(|layer| layer.output_size()).unwrap_or(0)
    }

    /// `[input, hidden.., output]`
    pub fn layer_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![self.input_size()];
        sizes.extend(self.layers.iter().map(|layer| layer.output_size()));
        sizes
    }

    pub fn activations(&self) -> Vec<Activation> {
        self.layers.iter().map(|layer| layer.activation).collect()
    }

    /// Perform a forward pass for a single input vector.
    pub fn forward(&self, input: ArrayView1<f32>) -> Array1<f32> {
        let output = self.forward_batch(input.insert_axis(Axis(0)));
        output.index_axis_move(Axis(0), 0)
    }

    /// Perform a forward pass for a batch of input vectors.
    pub fn forward_batch(&self, inputs: ArrayView2<f32>) -> Array2<f32> {
        let mut current_output = inputs.to_owned();
        for layer in &self.layers {
            current_output = layer.predict_batch(current_output.view());
        }
        current_output
    }

    fn forward_training(&mut self, inputs: ArrayView2<f32>) -> Array2<f32> {
        let mut current_output = inputs.to_owned();
        for layer in &mut self.layers {
            current_output = layer.forward_batch(current_output.view());
        }
        current_output
    }

    fn backward_batch(&self, output_errors: ArrayView2<f32>) -> Result<Vec<(Array2<f32>, Array1<f32>)>> {
        let mut gradients = Vec::with_capacity(self.layers.len());
        let mut current_error = output_errors.to_owned();

        for i in (0..self.layers.len()).rev() {
            let layer = &self.layers[i];
            let (adjusted_error, weight_gradients, bias_gradients) = layer.backward_batch(current_error.view())?;
            gradients.push((weight_gradients, bias_gradients));

            if i != 0 {
                current_error = adjusted_error.dot(&layer.weights.t());
            }
        }

        gradients.reverse();
        Ok(gradients)
    }

    /// One gradient step of mean-squared error toward `targets`.
    ///
    /// Returns the loss measured on the forward pass that produced the
    /// gradients, i.e. before the parameters moved.
    pub fn train_minibatch(&mut self, inputs: ArrayView2<f32>, targets: ArrayView2<f32>, learning_rate: f32) -> Result<f32> {
        if inputs.ncols() != self.input_size() {
            return Err(TankRlError::dimension_mismatch(
                format!("{} input columns", self.input_size()),
                format!("{} input columns", inputs.ncols()),
            ));
        }
        if targets.dim() != (inputs.nrows(), self.output_size()) {
            return Err(TankRlError::dimension_mismatch(
                format!("{:?} targets", (inputs.nrows(), self.output_size())),
                format!("{:?} targets", targets.dim()),
            ));
        }

        let outputs = self.forward_training(inputs);
        let loss = MSE.compute_batch(outputs.view(), targets);
        if !loss.is_finite() {
            return Err(TankRlError::Numerical(format!("non-finite loss {}", loss)));
        }

        let output_errors = MSE.gradient_batch(outputs.view(), targets);
        let gradients = self.backward_batch(output_errors.view())?;

        self.optimizer.begin_step();
        for (index, (layer, (weight_gradients, bias_gradients))) in self.layers.iter_mut().zip(gradients).enumerate() {
            self.optimizer.update_weights(index, &mut layer.weights, &weight_gradients, learning_rate);
            self.optimizer.update_biases(index, &mut layer.biases, &bias_gradients, learning_rate);
        }

        Ok(loss)
    }

    /// Overwrite every parameter with a value copy of `other`'s.
    pub fn copy_weights_from(&mut self, other: &NeuralNetwork) -> Result<()> {
        if self.layer_sizes() != other.layer_sizes() {
            return Err(TankRlError::dimension_mismatch(
                format!("{:?}", self.layer_sizes()),
                format!("{:?}", other.layer_sizes()),
            ));
        }
        for (mine, theirs) in self.layers.iter_mut().zip(&other.layers) {
            mine.copy_parameters_from(theirs)?;
        }
        Ok(())
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|layer| layer.parameter_count()).sum()
    }

    pub fn is_finite(&self) -> bool {
        self.layers.iter().all(|layer| layer.is_finite())
    }
}
