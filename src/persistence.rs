//! Model snapshots and the stores they are written to.
//!
//! A [`ModelSnapshot`] is a topology descriptor, one spec per weight tensor,
//! and a single little-endian `f32` blob holding every tensor back to back in
//! spec order. Local snapshots are bincode files; the remote backend speaks
//! JSON with the blob base64-encoded in `weightDataBase64`.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ndarray::{Array1, Array2};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::activations::Activation;
use crate::config::{PersistenceConfig, PersistenceMode};
use crate::error::{Result, TankRlError};
use crate::layers::DenseLayer;
use crate::network::NeuralNetwork;
use crate::optimizer::OptimizerWrapper;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerTopology {
    pub units: usize,
    pub activation: Activation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTopology {
    pub input_size: usize,
    pub layers: Vec<LayerTopology>,
}

impl ModelTopology {
    pub fn output_size(&self) -> usize {
        self.layers.last().map(|layer| layer.units).unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
}

impl WeightSpec {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingConfig {
    pub optimizer: String,
    pub loss: String,
    pub learning_rate: f32,
    pub gamma: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub model_topology: ModelTopology,
    pub weight_specs: Vec<WeightSpec>,
    pub weight_data: Vec<u8>,
    pub training_config: Option<TrainingConfig>,
    pub user_defined_metadata: Option<BTreeMap<String, String>>,
}

/// JSON body exchanged with the remote backend
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSnapshot {
    model_topology: Option<ModelTopology>,
    weight_specs: Option<Vec<WeightSpec>>,
    weight_data_base64: Option<String>,
    #[serde(default)]
    training_config: Option<TrainingConfig>,
    #[serde(default)]
    user_defined_metadata: Option<BTreeMap<String, String>>,
}

impl ModelSnapshot {
    /// Capture the parameters of `network` as they are right now.
    pub fn from_network(network: &NeuralNetwork, training_config: Option<TrainingConfig>) -> Self {
        let model_topology = ModelTopology {
            input_size: network.input_size(),
            layers: network
                .layers
                .iter()
                .map(|layer| LayerTopology {
                    units: layer.output_size(),
                    activation: layer.activation,
                })
                .collect(),
        };

        let mut weight_specs = Vec::with_capacity(network.layers.len() * 2);
        let mut weight_data = Vec::with_capacity(network.parameter_count() * 4);
        for (index, layer) in network.layers.iter().enumerate() {
            weight_specs.push(WeightSpec {
                name: format!("dense_{}/kernel", index),
                shape: layer.weights.shape().to_vec(),
                dtype: "float32".to_string(),
            });
            weight_specs.push(WeightSpec {
                name: format!("dense_{}/bias", index),
                shape: vec![layer.biases.len()],
                dtype: "float32".to_string(),
            });
            for value in layer.weights.iter().chain(layer.biases.iter()) {
                weight_data.extend_from_slice(&value.to_le_bytes());
            }
        }

        ModelSnapshot {
            model_topology,
            weight_specs,
            weight_data,
            training_config,
            user_defined_metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.user_defined_metadata = Some(metadata);
        self
    }

    /// Rebuild a network from the snapshot, validating every shape against the topology.
    pub fn to_network(&self, optimizer: OptimizerWrapper) -> Result<NeuralNetwork> {
        let topology = &self.model_topology;
        if topology.layers.is_empty() || topology.input_size == 0 {
            return Err(TankRlError::Serialization("snapshot topology has no layers".to_string()));
        }
        if self.weight_specs.len() != topology.layers.len() * 2 {
            return Err(TankRlError::dimension_mismatch(
                format!("{} weight specs", topology.layers.len() * 2),
                format!("{} weight specs", self.weight_specs.len()),
            ));
        }
        if self.weight_data.len() % 4 != 0 {
            return Err(TankRlError::Serialization("weight blob is not a whole number of f32 values".to_string()));
        }

        let values: Vec<f32> = self
            .weight_data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        let expected: usize = self.weight_specs.iter().map(WeightSpec::element_count).sum();
        if values.len() != expected {
            return Err(TankRlError::dimension_mismatch(
                format!("{} weight values", expected),
                format!("{} weight values", values.len()),
            ));
        }

        let mut offset = 0;
        let mut fan_in = topology.input_size;
        let mut layers = Vec::with_capacity(topology.layers.len());
        for (layer_topology, specs) in topology.layers.iter().zip(self.weight_specs.chunks_exact(2)) {
            let (kernel, bias) = (&specs[0], &specs[1]);
            if kernel.shape != [fan_in, layer_topology.units] || bias.shape != [layer_topology.units] {
                return Err(TankRlError::dimension_mismatch(
                    format!("kernel [{}, {}]", fan_in, layer_topology.units),
                    format!("kernel {:?}, bias {:?}", kernel.shape, bias.shape),
                ));
            }

            let kernel_len = kernel.element_count();
            let weights = Array2::from_shape_vec((fan_in, layer_topology.units), values[offset..offset + kernel_len].to_vec())
                .map_err(|e| TankRlError::Serialization(e.to_string()))?;
            offset += kernel_len;
            let biases = Array1::from_vec(values[offset..offset + layer_topology.units].to_vec());
            offset += layer_topology.units;

            layers.push(DenseLayer::from_parameters(weights, biases, layer_topology.activation)?);
            fan_in = layer_topology.units;
        }

        let network = NeuralNetwork {
            layers,
            optimizer,
        };
        if !network.is_finite() {
            return Err(TankRlError::Numerical("snapshot contains non-finite weights".to_string()));
        }
        Ok(network)
    }

    pub fn to_json(&self) -> Result<String> {
        let wire = WireSnapshot {
            model_topology: Some(self.model_topology.clone()),
            weight_specs: Some(self.weight_specs.clone()),
            weight_data_base64: Some(BASE64.encode(&self.weight_data)),
            training_config: self.training_config.clone(),
            user_defined_metadata: self.user_defined_metadata.clone(),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let wire: WireSnapshot = serde_json::from_str(text)?;
        match (wire.model_topology, wire.weight_specs, wire.weight_data_base64) {
            (Some(model_topology), Some(weight_specs), Some(encoded)) if !encoded.is_empty() => Ok(ModelSnapshot {
                model_topology,
                weight_specs,
                weight_data: BASE64.decode(encoded.as_bytes())?,
                training_config: wire.training_config,
                user_defined_metadata: wire.user_defined_metadata,
            }),
            _ => Err(TankRlError::Serialization("snapshot payload is missing model data".to_string())),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Durable key-value storage for snapshots.
///
/// `load` returns `Ok(None)` when nothing is stored under `key`.
pub trait SnapshotStore: Send {
    fn load(&self, key: &str) -> Result<Option<ModelSnapshot>>;

    fn save(&self, key: &str, snapshot: &ModelSnapshot) -> Result<()>;

    /// Ask the store for a per-map model key. Stores without an allocator return `None`.
    fn allocate_key(&self, _map_key: &str, _base_key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    /// Hand an allocated key back to the store.
    fn release_key(&self, _map_key: &str, _model_key: &str) -> Result<()> {
        Ok(())
    }
}

/// Build the store selected by the persistence config.
pub fn store_from_config(config: &PersistenceConfig) -> Result<Option<Box<dyn SnapshotStore>>> {
    match config.mode {
        PersistenceMode::Disabled => Ok(None),
        PersistenceMode::Local => Ok(Some(Box::new(FileSnapshotStore::new(&config.local_dir)))),
        PersistenceMode::Remote => Ok(Some(Box::new(HttpSnapshotStore::new(
            &config.backend_url,
            Duration::from_millis(config.request_timeout_ms),
        )?))),
    }
}

/// Snapshots kept in process memory; clones share the same map.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    snapshots: Arc<Mutex<HashMap<String, ModelSnapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        match self.snapshots.lock() {
            Ok(map) => map.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<ModelSnapshot> {
        self.snapshots.lock().ok().and_then(|map| map.get(key).cloned())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, key: &str) -> Result<Option<ModelSnapshot>> {
        let map = self
            .snapshots
            .lock()
            .map_err(|_| TankRlError::Transport("snapshot map poisoned".to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn save(&self, key: &str, snapshot: &ModelSnapshot) -> Result<()> {
        let mut map = self
            .snapshots
            .lock()
            .map_err(|_| TankRlError::Transport("snapshot map poisoned".to_string()))?;
        map.insert(key.to_string(), snapshot.clone());
        Ok(())
    }
}

/// One bincode file per key under a directory
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        FileSnapshotStore { dir: dir.into() }
    }

    /// Keys become file names; anything outside `[A-Za-z0-9._-]` is replaced.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.bin", file_name))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, key: &str) -> Result<Option<ModelSnapshot>> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => ModelSnapshot::from_bytes(&bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, key: &str, snapshot: &ModelSnapshot) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, snapshot.to_bytes()?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "snapshot written");
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocateResponse {
    model_key: Option<String>,
}

/// Remote key-value backend:
/// `GET/POST {base}/model/{key}`, `GET {base}/allocate/{map}?baseKey=..`,
/// `POST {base}/release/{map}`.
pub struct HttpSnapshotStore {
    client: Client,
    base_url: Url,
}

impl HttpSnapshotStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| TankRlError::invalid_parameter("backendUrl".to_string(), e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(TankRlError::invalid_parameter("backendUrl", "URL cannot be a base"));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpSnapshotStore { client, base_url })
    }

    /// `{base}/{segments..}` with each segment percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| TankRlError::invalid_parameter("backendUrl", "URL cannot be a base"))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }
}

impl SnapshotStore for HttpSnapshotStore {
    fn load(&self, key: &str) -> Result<Option<ModelSnapshot>> {
        let response = self.client.get(self.endpoint(&["model", key])?).send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(TankRlError::Transport(format!("GET model returned {}", response.status())));
        }
        let body = response.text()?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        ModelSnapshot::from_json(&body).map(Some)
    }

    fn save(&self, key: &str, snapshot: &ModelSnapshot) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(&["model", key])?)
            .header("Content-Type", "application/json")
            .body(snapshot.to_json()?)
            .send()?;
        if !response.status().is_success() {
            return Err(TankRlError::Transport(format!("POST model returned {}", response.status())));
        }
        Ok(())
    }

    fn allocate_key(&self, map_key: &str, base_key: &str) -> Result<Option<String>> {
        let mut url = self.endpoint(&["allocate", map_key])?;
        url.query_pairs_mut().append_pair("baseKey", base_key);
        let response = self.client.get(url).send()?;
        if !response.status().is_success() {
            return Err(TankRlError::Transport(format!("allocate returned {}", response.status())));
        }
        let allocation: AllocateResponse = response.json()?;
        Ok(allocation.model_key.filter(|key| !key.is_empty()))
    }

    fn release_key(&self, map_key: &str, model_key: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(&["release", map_key])?)
            .json(&serde_json::json!({ "modelKey": model_key }))
            .send()?;
        if !response.status().is_success() {
            return Err(TankRlError::Transport(format!("release returned {}", response.status())));
        }
        Ok(())
    }
}
