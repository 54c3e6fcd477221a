//! Per-entity bookkeeping on the simulation side: idle and direction-change
//! counters, the distances the shaper needs from the previous step, and
//! reward accumulated between two observations.

use std::collections::HashMap;

use tracing::warn;

use crate::action::Direction;
use crate::error::{Result, TankRlError};
use crate::reward::{RewardEvent, RewardOutcome, RewardWeights};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntityTrackingRecord {
    pub type_index: usize,
    pub idle_ticks: u32,
    pub last_direction: Option<Direction>,
    pub ticks_since_direction_change: u32,
    /// Dense reward accumulated since the last observation.
    pub pending_reward: f32,
    /// Sparse event reward accumulated since the last observation.
    pub event_reward: f32,
    pub prev_opponent_distance: Option<f32>,
    pub prev_objective_distance: Option<f32>,
    ticks_until_emit: u32,
}

/// Result of one motion update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotionUpdate {
    pub idle_ticks: u32,
    pub direction_changed: bool,
    /// Ticks that had passed since the previous change when this one happened.
    pub ticks_since_previous_change: u32,
}

/// Map of tracked entities with a hard cap.
#[derive(Clone, Debug)]
pub struct EntityTracker {
    records: HashMap<String, EntityTrackingRecord>,
    capacity: usize,
}

impl EntityTracker {
    pub fn new(capacity: usize) -> Self {
        EntityTracker {
            records: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record for `entity_id`, inserting a fresh one if needed. New entities
    /// are refused once the tracker is full.
    pub fn track(&mut self, entity_id: &str, type_index: usize) -> Result<&mut EntityTrackingRecord> {
        if !self.records.contains_key(entity_id) {
            if self.records.len() >= self.capacity {
                warn!(entity_id, capacity = self.capacity, "entity tracker full, refusing entity");
                return Err(TankRlError::invalid_parameter(
                    "entity_id".to_string(),
                    format!("tracker is full ({} entities)", self.capacity),
                ));
            }
            self.records.insert(
                entity_id.to_string(),
                EntityTrackingRecord {
                    type_index,
                    ..EntityTrackingRecord::default()
                },
            );
        }
        self.records
            .get_mut(entity_id)
            .ok_or_else(|| TankRlError::Training(format!("record for {} vanished", entity_id)))
    }

    pub fn get(&self, entity_id: &str) -> Option<&EntityTrackingRecord> {
        self.records.get(entity_id)
    }

    pub fn get_mut(&mut self, entity_id: &str) -> Option<&mut EntityTrackingRecord> {
        self.records.get_mut(entity_id)
    }

    /// Advance the idle and direction counters by one tick.
    pub fn update_motion(&mut self, entity_id: &str, moved: bool, direction: Option<Direction>) -> Option<MotionUpdate> {
        let record = self.records.get_mut(entity_id)?;

        record.idle_ticks = if moved { 0 } else { record.idle_ticks.saturating_add(1) };

        let direction_changed = matches!((record.last_direction, direction), (Some(last), Some(next)) if last != next);
        let ticks_since_previous_change = record.ticks_since_direction_change;
        record.ticks_since_direction_change = if direction_changed {
            0
        } else {
            record.ticks_since_direction_change.saturating_add(1)
        };
        if direction.is_some() {
            record.last_direction = direction;
        }

        Some(MotionUpdate {
            idle_ticks: record.idle_ticks,
            direction_changed,
            ticks_since_previous_change,
        })
    }

    /// Store the distances the shaper reported so the next step can diff against them.
    pub fn remember_distances(&mut self, entity_id: &str, outcome: &RewardOutcome) {
        if let Some(record) = self.records.get_mut(entity_id) {
            record.prev_opponent_distance = Some(outcome.opponent_distance);
            record.prev_objective_distance = Some(outcome.objective_distance);
        }
    }

    /// Add the weight of a sparse event to the entity's event reward.
    pub fn record_event(&mut self, entity_id: &str, event: RewardEvent, weights: &RewardWeights) -> bool {
        match self.records.get_mut(entity_id) {
            Some(record) => {
                record.event_reward += weights.weight(event);
                true
            }
            None => false,
        }
    }

    pub fn accumulate(&mut self, entity_id: &str, reward: f32) -> bool {
        match self.records.get_mut(entity_id) {
            Some(record) => {
                record.pending_reward += reward;
                true
            }
            None => false,
        }
    }

    /// Dense plus event reward since the last observation; both are reset to zero.
    pub fn take_reward(&mut self, entity_id: &str) -> f32 {
        self.records
            .get_mut(entity_id)
            .map(|record| std::mem::take(&mut record.pending_reward) + std::mem::take(&mut record.event_reward))
            .unwrap_or(0.0)
    }

    /// `true` on the first tick and then once every `interval` ticks.
    pub fn should_emit(&mut self, entity_id: &str, interval: u32) -> bool {
        match self.records.get_mut(entity_id) {
            Some(record) if record.ticks_until_emit == 0 => {
                record.ticks_until_emit = interval.saturating_sub(1);
                true
            }
            Some(record) => {
                record.ticks_until_emit -= 1;
                false
            }
            None => false,
        }
    }

    pub fn remove(&mut self, entity_id: &str) -> Option<EntityTrackingRecord> {
        self.records.remove(entity_id)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
