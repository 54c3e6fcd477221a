use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tank_rl::{
    bridge::{ActionSource, AgentBridge, ObservePayload, Stage},
    config::{AgentConfig, PersistenceConfig, PersistenceMode},
    encoder::{EncoderInput, FeatureEncoder, OBSERVATION_SIZE},
    environment::{EntitySnapshot, GridTerrain, TilePos},
    error::{Result, TankRlError},
    persistence::{FileSnapshotStore, MemorySnapshotStore, ModelSnapshot, SnapshotStore},
    reward::{RewardEvent, RewardWeights, StepRewardInput},
    tracking::EntityTracker,
};

fn test_config() -> AgentConfig {
    AgentConfig {
        hidden_layers: vec![16],
        batch_size: 4,
        train_every: 2,
        target_sync_every: 10,
        save_every_steps: 0,
        save_every_episodes: 0,
        seed: Some(3),
        ..AgentConfig::default()
    }
}

fn payload(entity_id: &str, value: f32, reward: f32, done: bool) -> ObservePayload {
    ObservePayload {
        entity_id: entity_id.to_string(),
        observation: vec![value; OBSERVATION_SIZE],
        reward,
        done,
    }
}

fn wait_until<F: FnMut(&mut AgentBridge) -> bool>(bridge: &mut AgentBridge, mut ready: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if ready(bridge) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn poll<F: FnMut() -> bool>(mut ready: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if ready() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_observe_before_init_is_ignored() {
    let mut bridge = AgentBridge::with_store(test_config(), None);
    assert!(!bridge.observe(payload("tank-1", 0.1, 0.0, false)));
    assert_eq!(bridge.get_action("tank-1"), 0);
    assert_eq!(bridge.pump(), 0);
}

#[test]
fn test_end_to_end_actions() {
    let config = test_config();
    let action_count = config.action_count();
    let mut bridge = AgentBridge::with_store(config, None);
    assert!(bridge.init(OBSERVATION_SIZE, action_count));
    assert!(!bridge.init(OBSERVATION_SIZE, action_count));

    for i in 0..20 {
        assert!(bridge.observe(payload("tank-1", i as f32 / 20.0, 0.1, false)));
    }
    assert!(wait_until(&mut bridge, |b| b.debug_snapshot().step == 20));

    let record = bridge.action_record("tank-1").unwrap();
    assert!(record.action < action_count);
    assert_eq!(bridge.get_action("tank-1"), record.action);

    let debug = bridge.debug_snapshot();
    assert_eq!(debug.entity_id.as_deref(), Some("tank-1"));
    assert!(debug.epsilon < 1.0);
    assert!(debug.loss.is_some());

    assert!(bridge.release());
    assert!(!bridge.release());
    assert!(!bridge.observe(payload("tank-1", 0.0, 0.0, false)));
}

#[test]
fn test_resolve_action_fallbacks() {
    let config = AgentConfig {
        action_response_timeout_ms: 200,
        stuck_action_threshold: 40,
        ..test_config()
    };
    let table = config.action_table.clone();
    let mut bridge = AgentBridge::with_store(config, None);
    bridge.init(OBSERVATION_SIZE, table.len());
    bridge.observe(payload("tank-1", 0.2, 0.0, false));
    assert!(wait_until(&mut bridge, |b| b.action_record("tank-1").is_some()));

    let record = bridge.action_record("tank-1").unwrap();
    let fresh = bridge.resolve_action("tank-1", 0, record.received_at);
    assert_eq!(fresh.source, ActionSource::Cached);
    assert_eq!(fresh.action, record.action);

    let late = record.received_at + Duration::from_secs(1);
    let stale = bridge.resolve_action("tank-1", 0, late);
    assert_eq!(stale.source, ActionSource::Stale);
    assert!(stale.action < table.len());

    let missing = bridge.resolve_action("tank-9", 0, Instant::now());
    assert_eq!(missing.source, ActionSource::Missing);

    for _ in 0..50 {
        let stuck = bridge.resolve_action("tank-1", 40, record.received_at);
        assert_eq!(stuck.source, ActionSource::StuckOverride);
        assert!(table.decode(stuck.action).is_movement());
    }
}

#[test]
fn test_done_clears_cached_action() {
    let mut bridge = AgentBridge::with_store(test_config(), None);
    bridge.init(OBSERVATION_SIZE, 10);
    bridge.observe(payload("tank-1", 0.2, 0.0, false));
    assert!(wait_until(&mut bridge, |b| b.action_record("tank-1").is_some()));

    bridge.observe(payload("tank-1", 0.3, -1.0, true));
    assert!(wait_until(&mut bridge, |b| b.debug_snapshot().episode == 1));
    assert!(bridge.action_record("tank-1").is_none());

    bridge.observe(payload("tank-2", 0.3, 0.0, false));
    assert!(wait_until(&mut bridge, |b| b.action_record("tank-2").is_some()));
    bridge.reset_episode();
    assert!(bridge.action_record("tank-2").is_none());
}

#[test]
fn test_malformed_observation_reports_error() {
    let mut bridge = AgentBridge::with_store(test_config(), None);
    bridge.init(OBSERVATION_SIZE, 10);
    bridge.observe(ObservePayload {
        entity_id: "tank-1".to_string(),
        observation: vec![0.0; 3],
        reward: 0.0,
        done: false,
    });
    assert!(wait_until(&mut bridge, |b| b.debug_snapshot().last_error.is_some()));
    assert_eq!(bridge.debug_snapshot().step, 0);
}

#[test]
fn test_stage_flags() {
    let mut bridge = AgentBridge::with_store(test_config(), None);
    assert!(!bridge.debug_snapshot().built_state);
    bridge.mark_stage(Stage::BuiltState);
    bridge.mark_stage(Stage::SentObserve);
    let debug = bridge.debug_snapshot();
    assert!(debug.built_state);
    assert!(debug.sent_observe);
}

#[test]
fn test_full_queue_drops_and_counts() {
    let config = AgentConfig {
        request_queue_capacity: 1,
        ..test_config()
    };
    let mut bridge = AgentBridge::with_store(config, None);
    bridge.init(OBSERVATION_SIZE, 10);

    let mut accepted = 0;
    for i in 0..500 {
        if bridge.observe(payload("tank-1", (i % 7) as f32 / 7.0, 0.0, false)) {
            accepted += 1;
        }
    }
    assert_eq!(accepted + bridge.dropped_observations(), 500);
    assert!(bridge.release());
}

#[test]
fn test_periodic_save_to_memory_store() {
    let store = MemorySnapshotStore::new();
    let config = AgentConfig {
        save_every_steps: 5,
        persistence: PersistenceConfig {
            model_storage_key: "arena-model".to_string(),
            ..PersistenceConfig::default()
        },
        ..test_config()
    };
    let mut bridge = AgentBridge::with_store(config.clone(), Some(Box::new(store.clone())));
    bridge.init(OBSERVATION_SIZE, config.action_count());
    for i in 0..5 {
        bridge.observe(payload("tank-1", i as f32 / 5.0, 0.0, false));
    }
    assert!(poll(|| store.get("arena-model").is_some()));
    bridge.release();

    let snapshot = store.get("arena-model").unwrap();
    assert_eq!(snapshot.model_topology.input_size, OBSERVATION_SIZE);
    assert_eq!(snapshot.model_topology.output_size(), config.action_count());
    assert_eq!(snapshot.user_defined_metadata.unwrap()["steps"], "5");

    // A second bridge warm-starts from the stored model and keeps working.
    let mut second = AgentBridge::with_store(config.clone(), Some(Box::new(store.clone())));
    second.init(OBSERVATION_SIZE, config.action_count());
    second.observe(payload("tank-1", 0.5, 0.0, false));
    assert!(wait_until(&mut second, |b| b.action_record("tank-1").is_some()));
    assert!(second.release());
}

#[test]
fn test_incompatible_stored_model_is_ignored() {
    let store = MemorySnapshotStore::new();
    let config = test_config();
    let other = tank_rl::engine::EngineState::new(5, 2, config.clone()).unwrap();
    store.save(config.storage_key(), &other.snapshot()).unwrap();

    let mut bridge = AgentBridge::with_store(config, Some(Box::new(store)));
    bridge.init(OBSERVATION_SIZE, 10);
    bridge.observe(payload("tank-1", 0.5, 0.0, false));
    assert!(wait_until(&mut bridge, |b| b.action_record("tank-1").is_some()));
    assert!(bridge.action_record("tank-1").unwrap().action < 10);
}

#[test]
fn test_local_store_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        save_every_episodes: 1,
        persistence: PersistenceConfig {
            mode: PersistenceMode::Local,
            local_dir: dir.path().to_string_lossy().into_owned(),
            ..PersistenceConfig::default()
        },
        ..test_config()
    };
    let key = config.storage_key().to_string();
    let mut bridge = AgentBridge::new(config);
    bridge.init(OBSERVATION_SIZE, 10);
    bridge.observe(payload("tank-1", 0.1, 0.0, false));
    bridge.observe(payload("tank-1", 0.2, 1.0, true));

    let files = FileSnapshotStore::new(dir.path());
    assert!(poll(|| files.load(&key).ok().flatten().is_some()));
    bridge.release();
}

#[derive(Clone, Default)]
struct AllocatingStore {
    inner: MemorySnapshotStore,
    released: Arc<Mutex<Vec<(String, String)>>>,
    allocate_delay: Duration,
}

impl SnapshotStore for AllocatingStore {
    fn load(&self, key: &str) -> Result<Option<ModelSnapshot>> {
        self.inner.load(key)
    }

    fn save(&self, key: &str, snapshot: &ModelSnapshot) -> Result<()> {
        self.inner.save(key, snapshot)
    }

    fn allocate_key(&self, map_key: &str, base_key: &str) -> Result<Option<String>> {
        thread::sleep(self.allocate_delay);
        Ok(Some(format!("{}-{}-1", base_key, map_key)))
    }

    fn release_key(&self, map_key: &str, model_key: &str) -> Result<()> {
        if let Ok(mut released) = self.released.lock() {
            released.push((map_key.to_string(), model_key.to_string()));
        }
        Ok(())
    }
}

#[test]
fn test_allocated_key_is_used_and_released() {
    let store = AllocatingStore::default();
    let config = AgentConfig {
        save_every_steps: 2,
        persistence: PersistenceConfig {
            mode: PersistenceMode::Remote,
            base_model_storage_key: "tank".to_string(),
            map_key: Some("desert".to_string()),
            ..PersistenceConfig::default()
        },
        ..test_config()
    };
    let mut bridge = AgentBridge::with_store(config, Some(Box::new(store.clone())));
    bridge.init(OBSERVATION_SIZE, 10);
    assert!(wait_until(&mut bridge, |b| b.debug_snapshot().model_key.is_some()));
    assert_eq!(bridge.debug_snapshot().model_key.as_deref(), Some("tank-desert-1"));

    bridge.observe(payload("tank-1", 0.1, 0.0, false));
    bridge.observe(payload("tank-1", 0.2, 0.0, false));
    assert!(poll(|| store.inner.get("tank-desert-1").is_some()));

    assert!(bridge.release());
    let released = store.released.clone();
    assert!(poll(|| released.lock().map(|r| r.len() == 1).unwrap_or(false)));
    assert_eq!(
        released.lock().unwrap()[0],
        ("desert".to_string(), "tank-desert-1".to_string())
    );
}

#[test]
fn test_saves_wait_for_slow_key_allocation() {
    let store = AllocatingStore {
        allocate_delay: Duration::from_millis(300),
        ..AllocatingStore::default()
    };
    let config = AgentConfig {
        save_every_steps: 2,
        persistence: PersistenceConfig {
            mode: PersistenceMode::Remote,
            base_model_storage_key: "tank".to_string(),
            map_key: Some("desert".to_string()),
            ..PersistenceConfig::default()
        },
        ..test_config()
    };
    let shared_key = config.storage_key().to_string();
    let mut bridge = AgentBridge::with_store(config, Some(Box::new(store.clone())));
    bridge.init(OBSERVATION_SIZE, 10);
    for i in 0..4 {
        assert!(bridge.observe(payload("tank-1", i as f32 / 4.0, 0.0, false)));
    }
    assert!(wait_until(&mut bridge, |b| b.debug_snapshot().step == 4));

    assert!(poll(|| store.inner.get("tank-desert-1").is_some()));
    assert_eq!(bridge.debug_snapshot().model_key.as_deref(), Some("tank-desert-1"));
    assert!(store.inner.get(&shared_key).is_none());
    assert_eq!(store.inner.keys(), vec!["tank-desert-1".to_string()]);
    assert!(bridge.release());
}

struct FailingSaveStore;

impl SnapshotStore for FailingSaveStore {
    fn load(&self, _key: &str) -> Result<Option<ModelSnapshot>> {
        Ok(None)
    }

    fn save(&self, _key: &str, _snapshot: &ModelSnapshot) -> Result<()> {
        Err(TankRlError::Transport("503".to_string()))
    }
}

#[test]
fn test_failed_save_reports_error_and_training_continues() {
    let config = AgentConfig {
        save_every_steps: 2,
        ..test_config()
    };
    let key = config.storage_key().to_string();
    let mut bridge = AgentBridge::with_store(config, Some(Box::new(FailingSaveStore)));
    bridge.init(OBSERVATION_SIZE, 10);
    for i in 0..10 {
        assert!(bridge.observe(payload("tank-1", i as f32 / 10.0, 0.5, false)));
    }
    assert!(wait_until(&mut bridge, |b| {
        let debug = b.debug_snapshot();
        debug.step == 10 && debug.last_error.is_some()
    }));

    let debug = bridge.debug_snapshot();
    let message = debug.last_error.unwrap();
    assert!(message.contains(&format!("model save to {} failed", key)), "{}", message);
    assert!(message.contains("503"), "{}", message);
    assert!(debug.loss.is_some());
    assert!(bridge.action_record("tank-1").unwrap().action < 10);
    assert!(bridge.release());
}

#[test]
fn test_unread_responses_are_counted_when_dropped() {
    let config = AgentConfig {
        request_queue_capacity: 1,
        ..test_config()
    };
    let mut bridge = AgentBridge::with_store(config, None);
    bridge.init(OBSERVATION_SIZE, 10);

    let mut accepted = 0;
    let deadline = Instant::now() + Duration::from_secs(10);
    while accepted < 20 && Instant::now() < deadline {
        if bridge.observe(payload("tank-1", accepted as f32 / 20.0, 0.0, false)) {
            accepted += 1;
        } else {
            thread::sleep(Duration::from_millis(1));
        }
    }
    assert_eq!(accepted, 20);

    // One response fits in the queue; the rest are lost because nobody pumps.
    assert!(poll(|| bridge.dropped_responses() == 19));
    let debug = bridge.debug_snapshot();
    assert_eq!(debug.dropped_responses, 19);
    assert_eq!(debug.step, 1);
    assert!(bridge.release());
}

#[test]
fn test_simulation_side_pipeline() {
    let config = AgentConfig {
        reward_weights: RewardWeights::server_preset(),
        ..test_config()
    };
    let terrain = GridTerrain::open(10, 10, 32.0).with_blocking(&[1]);
    let encoder = FeatureEncoder::new(config.encoder_scale(terrain.width()));
    let shaper = config.reward_shaper();
    let mut tracker = EntityTracker::new(config.max_tracked_entities);
    let mut bridge = AgentBridge::with_store(config.clone(), None);
    bridge.init(encoder.observation_size(), config.action_count());

    let mut entity = EntitySnapshot {
        x: 48.0,
        y: 48.0,
        direction_x: 1.0,
        speed: 2.0,
        health: 3.0,
        max_health: 3.0,
        weapon_cooldown_max: 10.0,
        ..EntitySnapshot::default()
    };
    let opponent = EntitySnapshot {
        x: 240.0,
        y: 48.0,
        health: 3.0,
        max_health: 3.0,
        ..EntitySnapshot::default()
    };

    tracker.track("tank-1", 0).unwrap();
    for tick in 0..30 {
        let record = tracker.get("tank-1").cloned().unwrap();
        let intent = config.action_table.decode(bridge.get_action("tank-1"));
        if let Some(direction) = intent.direction {
            let (dx, dy) = direction.vector();
            entity.x = (entity.x + dx * entity.speed).clamp(16.0, 304.0);
            entity.y = (entity.y + dy * entity.speed).clamp(16.0, 304.0);
            entity.direction_x = dx;
            entity.direction_y = dy;
        }
        let motion = tracker.update_motion("tank-1", intent.is_movement(), intent.direction).unwrap();
        if tick == 10 {
            tracker.record_event("tank-1", RewardEvent::HitOpponent, &config.reward_weights);
        }

        let outcome = shaper.shape(&StepRewardInput {
            entity: &entity,
            opponent: Some(&opponent),
            objective: Some(TilePos::new(9, 5)),
            terrain: Some(&terrain),
            prev_opponent_distance: record.prev_opponent_distance,
            prev_objective_distance: record.prev_objective_distance,
            idle_ticks: motion.idle_ticks,
            direction_changed: motion.direction_changed,
            ticks_since_direction_change: motion.ticks_since_previous_change,
        });
        tracker.remember_distances("tank-1", &outcome);
        tracker.accumulate("tank-1", outcome.reward);

        if tracker.should_emit("tank-1", config.transition_interval) {
            let observation = encoder.encode(&EncoderInput {
                entity: &entity,
                opponent: Some(&opponent),
                objective: Some(TilePos::new(9, 5)),
                terrain: Some(&terrain),
                idle_ticks: motion.idle_ticks,
                type_index: 0,
            });
            bridge.mark_stage(Stage::BuiltState);
            let reward = tracker.take_reward("tank-1");
            bridge.observe(ObservePayload {
                entity_id: "tank-1".to_string(),
                observation: observation.to_vec(),
                reward,
                done: false,
            });
            bridge.mark_stage(Stage::SentObserve);
        }
    }

    assert!(wait_until(&mut bridge, |b| b.debug_snapshot().step == 30));
    let debug = bridge.debug_snapshot();
    assert!(debug.built_state && debug.sent_observe);
    assert!(debug.last_error.is_none());
    assert!(bridge.release());
}
