//! Headless arena trainer
//!
//! Drives a small walled grid with learning tanks, one static opponent and one
//! objective tile through the encoder, reward shaper and learner bridge, then
//! prints the learner telemetry as JSON.

use std::time::Instant;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tank_rl::action::ActionSpec;
use tank_rl::bridge::{AgentBridge, DebugSnapshot, ObservePayload, Stage};
use tank_rl::config::AgentConfig;
use tank_rl::encoder::{EncoderInput, FeatureEncoder};
use tank_rl::environment::{aim_dot, line_of_sight, EntitySnapshot, GridTerrain, TerrainMap, TilePos};
use tank_rl::error::Result;
use tank_rl::reward::{RewardEvent, StepRewardInput};
use tank_rl::tracking::EntityTracker;

const MAP_TILES: usize = 12;
const TILE_SIZE: f32 = 32.0;
const WALL: u8 = 1;
const OBJECTIVE: TilePos = TilePos { row: 10, col: 6 };

/// Headless arena trainer for the DQN learner
#[derive(Parser, Debug)]
#[command(name = "tank-rl-arena")]
#[command(about = "Train tank agents in a headless grid arena")]
struct Args {
    /// Learner config (.toml or .json); defaults are used when omitted
    #[arg(long)]
    config: Option<String>,

    /// Simulation ticks to run
    #[arg(long, default_value_t = 5000)]
    ticks: u64,

    /// Number of learning tanks
    #[arg(long, default_value_t = 2)]
    agents: usize,

    /// Ticks before an episode is cut off
    #[arg(long, default_value_t = 400)]
    episode_ticks: u32,

    /// Random seed for the arena and the learner
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Serialize)]
struct ArenaSummary {
    ticks: u64,
    agents: usize,
    objectives_destroyed: u64,
    opponent_hits: u64,
    dropped_observations: u64,
    elapsed_ms: u128,
    learner: DebugSnapshot,
}

struct Tank {
    id: String,
    snapshot: EntitySnapshot,
    episode_tick: u32,
}

fn build_terrain() -> GridTerrain {
    let mut terrain = GridTerrain::open(MAP_TILES, MAP_TILES, TILE_SIZE).with_blocking(&[WALL]);
    for i in 0..MAP_TILES {
        terrain.set(0, i, WALL);
        terrain.set(MAP_TILES - 1, i, WALL);
        terrain.set(i, 0, WALL);
        terrain.set(i, MAP_TILES - 1, WALL);
    }
    for col in 3..9 {
        terrain.set(6, col, WALL);
    }
    terrain.set(OBJECTIVE.row as usize, OBJECTIVE.col as usize, 2);
    terrain
}

fn spawn<R: Rng>(rng: &mut R, terrain: &GridTerrain) -> EntitySnapshot {
    loop {
        let row = rng.gen_range(1..5);
        let col = rng.gen_range(1..MAP_TILES as i32 - 1);
        if !terrain.is_blocking(row, col) {
            let (x, y) = terrain.tile_to_pixel(row, col);
            return EntitySnapshot {
                x: x + TILE_SIZE / 2.0,
                y: y + TILE_SIZE / 2.0,
                direction_x: 0.0,
                direction_y: 1.0,
                speed: 4.0,
                health: 3.0,
                max_health: 3.0,
                weapon_cooldown_ticks: 0.0,
                weapon_cooldown_max: 15.0,
            };
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tank_rl=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    let seed = args.seed.or(config.seed).unwrap_or_else(rand::random);
    config.seed = Some(seed);
    let mut rng = StdRng::seed_from_u64(seed);
    tracing::info!(seed, ticks = args.ticks, agents = args.agents, "starting arena");

    let terrain = build_terrain();
    let encoder = FeatureEncoder::new(config.encoder_scale(terrain.width()));
    let shaper = config.reward_shaper();
    for name in config.reward_weights.unknown_names() {
        tracing::warn!(name, "unknown reward weight ignored");
    }

    let mut tracker = EntityTracker::new(config.max_tracked_entities);
    let mut bridge = AgentBridge::new(config.clone());
    if !bridge.init(encoder.observation_size(), config.action_count()) {
        tracing::error!("learner did not start");
        return Ok(());
    }

    let mut opponent = EntitySnapshot {
        x: 6.5 * TILE_SIZE,
        y: 8.5 * TILE_SIZE,
        direction_x: 0.0,
        direction_y: -1.0,
        health: 3.0,
        max_health: 3.0,
        ..EntitySnapshot::default()
    };
    let mut tanks: Vec<Tank> = (0..args.agents)
        .map(|i| Tank {
            id: format!("tank-{}", i),
            snapshot: spawn(&mut rng, &terrain),
            episode_tick: 0,
        })
        .collect();
    for tank in &tanks {
        tracker.track(&tank.id, 0)?;
    }

    let started = Instant::now();
    let mut objectives_destroyed = 0;
    let mut opponent_hits = 0;

    for _ in 0..args.ticks {
        for tank in tanks.iter_mut() {
            let Some(record) = tracker.get(&tank.id).cloned() else {
                continue;
            };
            let resolved = bridge.resolve_action(&tank.id, record.idle_ticks, Instant::now());
            let intent: ActionSpec = config.action_table.decode(resolved.action);

            let mut moved = false;
            if let Some(direction) = intent.direction {
                let (dx, dy) = direction.vector();
                tank.snapshot.direction_x = dx;
                tank.snapshot.direction_y = dy;
                let next = (tank.snapshot.x + dx * tank.snapshot.speed, tank.snapshot.y + dy * tank.snapshot.speed);
                let tile = terrain.pixel_to_tile(next.0, next.1);
                if terrain.is_blocking(tile.row, tile.col) {
                    tracker.record_event(&tank.id, RewardEvent::Collision, &config.reward_weights);
                } else {
                    tank.snapshot.x = next.0;
                    tank.snapshot.y = next.1;
                    moved = true;
                }
            }

            tank.snapshot.weapon_cooldown_ticks = (tank.snapshot.weapon_cooldown_ticks - 1.0).max(0.0);
            let mut done = false;
            if intent.fire && tank.snapshot.weapon_cooldown_ticks <= 0.0 {
                tank.snapshot.weapon_cooldown_ticks = tank.snapshot.weapon_cooldown_max;
                let position = tank.snapshot.position();
                let aimed_at = |target: (f32, f32)| {
                    line_of_sight(Some(&terrain), position, target) > 0.0
                        && aim_dot(tank.snapshot.direction(), target.0 - position.0, target.1 - position.1) > 0.98
                };
                let objective_center = tank_rl::environment::tile_center(&terrain, OBJECTIVE);
                if aimed_at(opponent.position()) {
                    opponent_hits += 1;
                    opponent.health -= 1.0;
                    tracker.record_event(&tank.id, RewardEvent::HitOpponent, &config.reward_weights);
                    if opponent.health <= 0.0 {
                        opponent.health = opponent.max_health;
                    }
                } else if aimed_at(objective_center) {
                    objectives_destroyed += 1;
                    tracker.record_event(&tank.id, RewardEvent::DestroyObjective, &config.reward_weights);
                    done = true;
                } else {
                    tracker.record_event(&tank.id, RewardEvent::NonDestructiveShot, &config.reward_weights);
                }
            }

            let Some(motion) = tracker.update_motion(&tank.id, moved, intent.direction) else {
                continue;
            };
            let outcome = shaper.shape(&StepRewardInput {
                entity: &tank.snapshot,
                opponent: Some(&opponent),
                objective: Some(OBJECTIVE),
                terrain: Some(&terrain),
                prev_opponent_distance: record.prev_opponent_distance,
                prev_objective_distance: record.prev_objective_distance,
                idle_ticks: motion.idle_ticks,
                direction_changed: motion.direction_changed,
                ticks_since_direction_change: motion.ticks_since_previous_change,
            });
            tracker.remember_distances(&tank.id, &outcome);
            tracker.accumulate(&tank.id, outcome.reward);

            tank.episode_tick += 1;
            done |= tank.episode_tick >= args.episode_ticks;

            if done || tracker.should_emit(&tank.id, config.transition_interval) {
                let observation = encoder.encode(&EncoderInput {
                    entity: &tank.snapshot,
                    opponent: Some(&opponent),
                    objective: Some(OBJECTIVE),
                    terrain: Some(&terrain),
                    idle_ticks: motion.idle_ticks,
                    type_index: record.type_index,
                });
                bridge.mark_stage(Stage::BuiltState);
                bridge.observe(ObservePayload {
                    entity_id: tank.id.clone(),
                    observation: observation.to_vec(),
                    reward: tracker.take_reward(&tank.id),
                    done,
                });
                bridge.mark_stage(Stage::SentObserve);
            }

            if done {
                tank.snapshot = spawn(&mut rng, &terrain);
                tank.episode_tick = 0;
                tracker.remove(&tank.id);
                tracker.track(&tank.id, 0)?;
            }
        }
    }

    bridge.reset_episode();
    let summary = ArenaSummary {
        ticks: args.ticks,
        agents: args.agents,
        objectives_destroyed,
        opponent_hits,
        dropped_observations: bridge.dropped_observations(),
        elapsed_ms: started.elapsed().as_millis(),
        learner: bridge.debug_snapshot(),
    };
    bridge.release();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
