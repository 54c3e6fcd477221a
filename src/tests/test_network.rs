use ndarray::{array, Array1, Array2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::activations::Activation;
use crate::layers::{DenseLayer, WeightInit};
use crate::network::NeuralNetwork;
use crate::optimizer::{Adam, OptimizerWrapper, SGD};

fn small_network(seed: u64) -> NeuralNetwork {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    NeuralNetwork::q_network(4, &[8, 8], 3, WeightInit::GlorotUniform, OptimizerWrapper::Adam(Adam::default()), &mut rng).unwrap()
}

#[test]
fn test_q_network_shape() {
    let network = small_network(0);
    assert_eq!(network.layer_sizes(), vec![4, 8, 8, 3]);
    assert_eq!(network.activations(), vec![Activation::Relu, Activation::Relu, Activation::Linear]);
    assert_eq!(network.parameter_count(), 4 * 8 + 8 + 8 * 8 + 8 + 8 * 3 + 3);

    let output = network.forward(Array1::zeros(4).view());
    assert_eq!(output.len(), 3);
}

#[test]
fn test_new_rejects_bad_sizes() {
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    assert!(NeuralNetwork::new(&[4], &[], WeightInit::GlorotUniform, OptimizerWrapper::SGD(SGD::new()), &mut rng).is_err());
    assert!(NeuralNetwork::new(&[4, 0, 2], &[Activation::Relu, Activation::Linear], WeightInit::GlorotUniform, OptimizerWrapper::SGD(SGD::new()), &mut rng).is_err());
    assert!(NeuralNetwork::new(&[4, 2], &[Activation::Relu, Activation::Linear], WeightInit::GlorotUniform, OptimizerWrapper::SGD(SGD::new()), &mut rng).is_err());
}

#[test]
fn test_copy_weights_gives_identical_outputs() {
    let online = small_network(1);
    let mut target = small_network(2);
    let input = array![0.3, -0.2, 0.9, 0.1];
    assert_ne!(online.forward(input.view()), target.forward(input.view()));

    target.copy_weights_from(&online).unwrap();
    assert_eq!(online.forward(input.view()), target.forward(input.view()));
}

#[test]
fn test_copy_weights_is_by_value() {
    let mut online = small_network(1);
    let mut target = small_network(2);
    target.copy_weights_from(&online).unwrap();

    online.layers[0].weights.fill(5.0);
    assert_ne!(target.layers[0].weights, online.layers[0].weights);
}

#[test]
fn test_copy_weights_rejects_other_architecture() {
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let mut network = small_network(0);
    let other = NeuralNetwork::q_network(4, &[5], 3, WeightInit::GlorotUniform, OptimizerWrapper::SGD(SGD::new()), &mut rng).unwrap();
    assert!(network.copy_weights_from(&other).is_err());
}

#[test]
fn test_training_reduces_loss() {
    let mut network = small_network(4);
    let inputs = Array2::from_shape_vec((2, 4), vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0]).unwrap();
    let targets = Array2::from_shape_vec((2, 3), vec![1.0, 0.0, -1.0, 0.0, 1.0, 0.5]).unwrap();

    let first = network.train_minibatch(inputs.view(), targets.view(), 0.01).unwrap();
    let mut last = first;
    for _ in 0..200 {
        last = network.train_minibatch(inputs.view(), targets.view(), 0.01).unwrap();
    }
    assert!(last < first);
    assert!(network.is_finite());
}

#[test]
fn test_train_rejects_wrong_target_shape() {
    let mut network = small_network(0);
    let inputs = Array2::zeros((2, 4));
    let targets = Array2::zeros((2, 2));
    assert!(network.train_minibatch(inputs.view(), targets.view(), 0.01).is_err());
}

#[test]
fn test_linear_layer_forward() {
    let layer = DenseLayer::from_parameters(array![[1.0, 2.0], [3.0, 4.0]], array![0.5, -0.5], Activation::Linear).unwrap();
    let network = NeuralNetwork {
        layers: vec![layer],
        optimizer: OptimizerWrapper::SGD(SGD::new()),
    };
    assert_eq!(network.forward(array![1.0, 1.0].view()), array![4.5, 5.5]);
}

#[test]
fn test_weight_init_bounds() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let glorot = DenseLayer::new(6, 4, Activation::Relu, WeightInit::GlorotUniform, &mut rng);
    let limit = (6.0f32 / 10.0).sqrt();
    assert!(glorot.weights.iter().all(|w| w.abs() <= limit));
    assert!(glorot.biases.iter().all(|&b| b == 0.0));

    let he = DenseLayer::new(6, 4, Activation::Relu, WeightInit::HeUniform, &mut rng);
    assert!(he.weights.iter().all(|w| w.abs() <= 1.0));

    let custom = DenseLayer::new(6, 4, Activation::Linear, WeightInit::Uniform { min: 0.2, max: 0.3 }, &mut rng);
    assert!(custom.weights.iter().all(|&w| (0.2..=0.3).contains(&w)));

    let zeros = DenseLayer::new(6, 4, Activation::Linear, WeightInit::Zeros, &mut rng);
    assert_eq!(zeros.weights, Array2::<f32>::zeros((6, 4)));
}
