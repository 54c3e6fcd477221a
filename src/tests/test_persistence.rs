use std::collections::BTreeMap;
use std::time::Duration;

use ndarray::array;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::{PersistenceConfig, PersistenceMode};
use crate::layers::WeightInit;
use crate::network::NeuralNetwork;
use crate::optimizer::{Adam, OptimizerWrapper};
use crate::persistence::{store_from_config, FileSnapshotStore, HttpSnapshotStore, MemorySnapshotStore, ModelSnapshot, SnapshotStore};

fn network(seed: u64) -> NeuralNetwork {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    NeuralNetwork::q_network(3, &[5], 2, WeightInit::GlorotUniform, OptimizerWrapper::Adam(Adam::default()), &mut rng).unwrap()
}

#[test]
fn test_snapshot_layout() {
    let snapshot = ModelSnapshot::from_network(&network(1), None);
    assert_eq!(snapshot.model_topology.input_size, 3);
    assert_eq!(snapshot.model_topology.output_size(), 2);
    assert_eq!(snapshot.weight_specs.len(), 4);
    assert_eq!(snapshot.weight_specs[0].shape, vec![3, 5]);
    assert_eq!(snapshot.weight_specs[1].shape, vec![5]);
    assert_eq!(snapshot.weight_specs[2].dtype, "float32");
    assert_eq!(snapshot.weight_data.len(), (3 * 5 + 5 + 5 * 2 + 2) * 4);
}

#[test]
fn test_snapshot_restores_same_outputs() {
    let original = network(2);
    let snapshot = ModelSnapshot::from_network(&original, None);
    let restored = snapshot.to_network(OptimizerWrapper::Adam(Adam::default())).unwrap();

    let input = array![0.2, -0.7, 0.4];
    assert_eq!(original.forward(input.view()), restored.forward(input.view()));
    assert_eq!(restored.activations(), original.activations());
}

#[test]
fn test_json_wire_format() {
    let mut metadata = BTreeMap::new();
    metadata.insert("steps".to_string(), "12".to_string());
    let snapshot = ModelSnapshot::from_network(&network(3), None).with_metadata(metadata);

    let json = snapshot.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(value["weightDataBase64"].is_string());
    assert_eq!(value["modelTopology"]["inputSize"], 3);
    assert_eq!(value["modelTopology"]["layers"][0]["activation"], "relu");

    assert_eq!(ModelSnapshot::from_json(&json).unwrap(), snapshot);
}

#[test]
fn test_json_without_weights_is_rejected() {
    assert!(ModelSnapshot::from_json(r#"{"modelTopology": {"inputSize": 3, "layers": []}}"#).is_err());
    assert!(ModelSnapshot::from_json("not json").is_err());
}

#[test]
fn test_truncated_blob_is_rejected() {
    let mut snapshot = ModelSnapshot::from_network(&network(4), None);
    snapshot.weight_data.truncate(snapshot.weight_data.len() - 4);
    assert!(snapshot.to_network(OptimizerWrapper::Adam(Adam::default())).is_err());

    snapshot.weight_data.push(0);
    assert!(snapshot.to_network(OptimizerWrapper::Adam(Adam::default())).is_err());
}

#[test]
fn test_mismatched_topology_is_rejected() {
    let mut snapshot = ModelSnapshot::from_network(&network(5), None);
    snapshot.model_topology.input_size = 4;
    assert!(snapshot.to_network(OptimizerWrapper::Adam(Adam::default())).is_err());
}

#[test]
fn test_non_finite_weights_are_rejected() {
    let mut broken = network(6);
    broken.layers[0].weights[[0, 0]] = f32::NAN;
    let snapshot = ModelSnapshot::from_network(&broken, None);
    assert!(snapshot.to_network(OptimizerWrapper::Adam(Adam::default())).is_err());
}

#[test]
fn test_memory_store() {
    let store = MemorySnapshotStore::new();
    let shared = store.clone();
    let snapshot = ModelSnapshot::from_network(&network(7), None);

    assert!(store.load("model").unwrap().is_none());
    store.save("model", &snapshot).unwrap();
    assert_eq!(shared.load("model").unwrap(), Some(snapshot));
    assert_eq!(shared.keys(), vec!["model".to_string()]);
    assert_eq!(store.allocate_key("map", "base").unwrap(), None);
}

#[test]
fn test_file_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path().join("models"));
    let snapshot = ModelSnapshot::from_network(&network(8), None);

    assert!(store.load("tank-ai-dqn").unwrap().is_none());
    store.save("tank-ai-dqn", &snapshot).unwrap();
    assert!(store.path_for("tank-ai-dqn").exists());
    assert_eq!(store.load("tank-ai-dqn").unwrap(), Some(snapshot));
}

#[test]
fn test_file_store_sanitizes_keys() {
    let store = FileSnapshotStore::new("models");
    let path = store.path_for("../maps/arena 1");
    assert_eq!(path.file_name().unwrap(), ".._maps_arena_1.bin");
    assert_eq!(path.parent().unwrap(), std::path::Path::new("models"));
}

#[test]
fn test_file_store_corrupt_file_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path());
    std::fs::write(store.path_for("broken"), b"\x01\x02\x03").unwrap();
    assert!(store.load("broken").is_err());
}

#[test]
fn test_http_endpoints_are_encoded() {
    let store = HttpSnapshotStore::new("http://127.0.0.1:5050/api/rl/", Duration::from_millis(100)).unwrap();
    assert_eq!(
        store.endpoint(&["model", "tank ai/dqn"]).unwrap().as_str(),
        "http://127.0.0.1:5050/api/rl/model/tank%20ai%2Fdqn"
    );
    assert!(HttpSnapshotStore::new("not a url", Duration::from_millis(100)).is_err());
}

#[test]
fn test_store_from_config() {
    let disabled = PersistenceConfig::default();
    assert!(store_from_config(&disabled).unwrap().is_none());

    let local = PersistenceConfig {
        mode: PersistenceMode::Local,
        ..PersistenceConfig::default()
    };
    assert!(store_from_config(&local).unwrap().is_some());
}
