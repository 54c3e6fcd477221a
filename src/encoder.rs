//! Fixed-length observation vectors for the value network.
//!
//! Layout (27 values, every component clamped to `[-1, 1]`):
//!
//! | index  | feature                                             |
//! |--------|-----------------------------------------------------|
//! | 0..2   | position / map size                                 |
//! | 2..4   | facing direction                                    |
//! | 4      | speed / max speed                                   |
//! | 5      | health fraction                                     |
//! | 6      | weapon cooldown fraction                            |
//! | 7..10  | opponent dx, dy, distance / map size                |
//! | 10     | opponent line of sight                              |
//! | 11     | opponent health fraction                            |
//! | 12..15 | objective dx, dy, distance / map size               |
//! | 15     | objective line of sight                             |
//! | 16     | idle ticks / idle threshold                         |
//! | 17     | type index / (type count - 1)                       |
//! | 18..27 | 3x3 terrain ids around the entity, row-major        |

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::environment::{distance, line_of_sight, tile_center, EntitySnapshot, TerrainMap, TilePos};

pub const NEIGHBORHOOD_TILES: usize = 9;
pub const OBSERVATION_SIZE: usize = 18 + NEIGHBORHOOD_TILES;

/// Scales used to normalize raw world quantities
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EncoderScale {
    /// Map width in pixels.
    pub map_size: f32,
    pub max_speed: f32,
    pub idle_tick_threshold: u32,
    /// Number of distinct entity types sharing the model.
    pub type_count: usize,
    pub max_tile_id: u8,
}

impl Default for EncoderScale {
    fn default() -> Self {
        EncoderScale {
            map_size: 1.0,
            max_speed: 4.0,
            idle_tick_threshold: 20,
            type_count: 1,
            max_tile_id: 7,
        }
    }
}

/// Inputs for one observation
pub struct EncoderInput<'a> {
    pub entity: &'a EntitySnapshot,
    pub opponent: Option<&'a EntitySnapshot>,
    pub objective: Option<TilePos>,
    pub terrain: Option<&'a dyn TerrainMap>,
    pub idle_ticks: u32,
    pub type_index: usize,
}

#[derive(Clone, Debug, Default)]
pub struct FeatureEncoder {
    pub scale: EncoderScale,
}

fn normalize(value: f32, max: f32) -> f32 {
    if max == 0.0 || !max.is_finite() || !value.is_finite() {
        return 0.0;
    }
    (value / max).clamp(-1.0, 1.0)
}

impl FeatureEncoder {
    pub fn new(scale: EncoderScale) -> Self {
        FeatureEncoder { scale }
    }

    pub fn observation_size(&self) -> usize {
        OBSERVATION_SIZE
    }

    pub fn encode(&self, input: &EncoderInput<'_>) -> Array1<f32> {
        let mut features = Vec::with_capacity(OBSERVATION_SIZE);
        let entity = input.entity;
        let position = entity.position();
        let map_size = self.scale.map_size;

        features.push(normalize(entity.x, map_size));
        features.push(normalize(entity.y, map_size));
        features.push(entity.direction_x.clamp(-1.0, 1.0));
        features.push(entity.direction_y.clamp(-1.0, 1.0));
        features.push(normalize(entity.speed, self.scale.max_speed));
        features.push(normalize(entity.health, entity.max_health));
        features.push(normalize(entity.weapon_cooldown_ticks, entity.weapon_cooldown_max));

        match input.opponent {
            Some(opponent) => {
                let target = opponent.position();
                features.push(normalize(target.0 - position.0, map_size));
                features.push(normalize(target.1 - position.1, map_size));
                features.push(normalize(distance(position, target), map_size));
                features.push(line_of_sight(input.terrain, position, target));
                features.push(normalize(opponent.health, opponent.max_health));
            }
            None => features.extend_from_slice(&[0.0; 5]),
        }

        let objective_center = match (input.objective, input.terrain) {
            (Some(tile), Some(terrain)) => Some(tile_center(terrain, tile)),
            _ => None,
        };
        match objective_center {
            Some(target) => {
                features.push(normalize(target.0 - position.0, map_size));
                features.push(normalize(target.1 - position.1, map_size));
                features.push(normalize(distance(position, target), map_size));
                features.push(line_of_sight(input.terrain, position, target));
            }
            None => features.extend_from_slice(&[0.0; 4]),
        }

        features.push(normalize(input.idle_ticks as f32, self.scale.idle_tick_threshold.max(1) as f32));
        features.push(if self.scale.type_count > 1 {
            normalize(input.type_index as f32, (self.scale.type_count - 1) as f32)
        } else {
            0.0
        });

        match input.terrain {
            Some(terrain) => {
                let tile = terrain.pixel_to_tile(entity.x, entity.y);
                let tile_scale = self.scale.max_tile_id as f32 + 1.0;
                for row_offset in -1..=1 {
                    for col_offset in -1..=1 {
                        let id = terrain.tile_at(tile.row.saturating_add(row_offset), tile.col.saturating_add(col_offset));
                        features.push(id.map(|id| normalize(id as f32 + 1.0, tile_scale)).unwrap_or(0.0));
                    }
                }
            }
            None => features.extend_from_slice(&[0.0; NEIGHBORHOOD_TILES]),
        }

        debug_assert_eq!(features.len(), OBSERVATION_SIZE);
        Array1::from_vec(features)
    }
}
