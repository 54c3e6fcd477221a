//! Dense reward shaping and the named reward-weight table.
//!
//! The shaper is stateless: the caller passes the distances it stored from the
//! previous step and gets the new ones back alongside the reward. Sparse event
//! rewards (hits, kills, deaths) are accumulated by
//! [`EntityTracker`](crate::tracking::EntityTracker) and added on top.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::environment::{aim_dot, distance, line_of_sight, tile_center, EntitySnapshot, TerrainMap, TilePos};

/// Named reward terms. The dense shaper reads the first six, the rest are
/// sparse events reported by the environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RewardEvent {
    OpponentApproach,
    ObjectiveApproach,
    OpponentAim,
    ObjectiveAim,
    IdlePenalty,
    DirectionChangePenalty,
    HitOpponent,
    GotHit,
    DestroyObjective,
    Death,
    HitAlly,
    DestructiveShot,
    NonDestructiveShot,
    Collision,
    MapTileTouched,
    ExploreStall,
    StuckArea,
}

impl RewardEvent {
    pub const ALL: [RewardEvent; 17] = [
        RewardEvent::OpponentApproach,
        RewardEvent::ObjectiveApproach,
        RewardEvent::OpponentAim,
        RewardEvent::ObjectiveAim,
        RewardEvent::IdlePenalty,
        RewardEvent::DirectionChangePenalty,
        RewardEvent::HitOpponent,
        RewardEvent::GotHit,
        RewardEvent::DestroyObjective,
        RewardEvent::Death,
        RewardEvent::HitAlly,
        RewardEvent::DestructiveShot,
        RewardEvent::NonDestructiveShot,
        RewardEvent::Collision,
        RewardEvent::MapTileTouched,
        RewardEvent::ExploreStall,
        RewardEvent::StuckArea,
    ];

    /// Key used in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            RewardEvent::OpponentApproach => "opponentApproach",
            RewardEvent::ObjectiveApproach => "objectiveApproach",
            RewardEvent::OpponentAim => "opponentAim",
            RewardEvent::ObjectiveAim => "objectiveAim",
            RewardEvent::IdlePenalty => "idlePenalty",
            RewardEvent::DirectionChangePenalty => "directionChangePenalty",
            RewardEvent::HitOpponent => "hitOpponent",
            RewardEvent::GotHit => "gotHit",
            RewardEvent::DestroyObjective => "destroyObjective",
            RewardEvent::Death => "death",
            RewardEvent::HitAlly => "hitAlly",
            RewardEvent::DestructiveShot => "destructiveShot",
            RewardEvent::NonDestructiveShot => "nonDestructiveShot",
            RewardEvent::Collision => "collision",
            RewardEvent::MapTileTouched => "mapTileTouched",
            RewardEvent::ExploreStall => "exploreStall",
            RewardEvent::StuckArea => "stuckArea",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|event| event.name() == name)
    }
}

/// Reward weight table keyed by event name.
///
/// Missing entries weigh 0. The default table is empty; the two presets
/// reproduce the weightings the arena has shipped with.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RewardWeights {
    weights: BTreeMap<String, f32>,
}

impl RewardWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn weight(&self, event: RewardEvent) -> f32 {
        self.weight_by_name(event.name())
    }

    pub fn weight_by_name(&self, name: &str) -> f32 {
        self.weights.get(name).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, event: RewardEvent, weight: f32) -> &mut Self {
        self.weights.insert(event.name().to_string(), weight);
        self
    }

    pub fn with(mut self, event: RewardEvent, weight: f32) -> Self {
        self.set(event, weight);
        self
    }

    /// Names in the table that no [`RewardEvent`] reads.
    pub fn unknown_names(&self) -> Vec<&str> {
        self.weights
            .keys()
            .filter(|name| RewardEvent::from_name(name).is_none())
            .map(String::as_str)
            .collect()
    }

    /// Weighting used by the in-browser client build.
    pub fn client_preset() -> Self {
        use RewardEvent::*;
        RewardWeights::new()
            .with(HitOpponent, 2.0)
            .with(GotHit, -0.5)
            .with(DestroyObjective, 3.0)
            .with(Death, -1.0)
            .with(OpponentAim, 0.05)
            .with(ObjectiveAim, 0.1)
            .with(ExploreStall, -0.001)
            .with(MapTileTouched, 0.04)
            .with(IdlePenalty, -0.05)
            .with(DirectionChangePenalty, -0.05)
            .with(NonDestructiveShot, -0.03)
            .with(DestructiveShot, 0.1)
            .with(HitAlly, -1.0)
            .with(Collision, -0.03)
            .with(StuckArea, -0.05)
    }

    /// Weighting used by the authoritative game server.
    pub fn server_preset() -> Self {
        use RewardEvent::*;
        RewardWeights::new()
            .with(HitOpponent, 2.0)
            .with(GotHit, -2.0)
            .with(DestroyObjective, 5.0)
            .with(Death, -5.0)
            .with(OpponentAim, 0.01)
            .with(ObjectiveAim, 0.01)
            .with(MapTileTouched, 0.02)
            .with(ExploreStall, -0.001)
            .with(IdlePenalty, -0.05)
            .with(DirectionChangePenalty, -0.05)
            .with(NonDestructiveShot, -0.03)
            .with(DestructiveShot, 0.5)
            .with(Collision, -0.05)
            .with(HitAlly, -1.0)
            .with(StuckArea, -0.02)
    }
}

/// Everything the shaper reads for one entity at one step
pub struct StepRewardInput<'a> {
    pub entity: &'a EntitySnapshot,
    pub opponent: Option<&'a EntitySnapshot>,
    pub objective: Option<TilePos>,
    pub terrain: Option<&'a dyn TerrainMap>,
    pub prev_opponent_distance: Option<f32>,
    pub prev_objective_distance: Option<f32>,
    pub idle_ticks: u32,
    pub direction_changed: bool,
    /// Ticks between the previous direction change and this one.
    pub ticks_since_direction_change: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RewardOutcome {
    pub reward: f32,
    pub opponent_distance: f32,
    pub objective_distance: f32,
}

/// Thresholds and weights for the dense reward
#[derive(Clone, Debug)]
pub struct RewardShaper {
    pub weights: RewardWeights,
    pub aim_dot_threshold: f32,
    pub idle_tick_threshold: u32,
    pub direction_change_cooldown: u32,
}

impl RewardShaper {
    pub fn new(weights: RewardWeights, aim_dot_threshold: f32, idle_tick_threshold: u32, direction_change_cooldown: u32) -> Self {
        RewardShaper {
            weights,
            aim_dot_threshold,
            idle_tick_threshold,
            direction_change_cooldown,
        }
    }

    pub fn shape(&self, input: &StepRewardInput<'_>) -> RewardOutcome {
        let entity = input.entity;
        let position = entity.position();
        let objective_center = match (input.objective, input.terrain) {
            (Some(tile), Some(terrain)) => Some(tile_center(terrain, tile)),
            _ => None,
        };

        let opponent_distance = input.opponent.map(|o| distance(position, o.position())).unwrap_or(0.0);
        let objective_distance = objective_center.map(|c| distance(position, c)).unwrap_or(0.0);

        let opponent_delta = input.prev_opponent_distance.unwrap_or(opponent_distance) - opponent_distance;
        let objective_delta = input.prev_objective_distance.unwrap_or(objective_distance) - objective_distance;

        let mut reward = 0.0;
        reward += opponent_delta * self.weights.weight(RewardEvent::OpponentApproach);
        reward += objective_delta * self.weights.weight(RewardEvent::ObjectiveApproach);

        if let Some(opponent) = input.opponent {
            if self.is_aimed_at(input, opponent.position()) {
                reward += self.weights.weight(RewardEvent::OpponentAim);
            }
        }
        if let Some(center) = objective_center {
            if self.is_aimed_at(input, center) {
                reward += self.weights.weight(RewardEvent::ObjectiveAim);
            }
        }

        if self.idle_tick_threshold > 0 && input.idle_ticks >= self.idle_tick_threshold {
            reward += self.weights.weight(RewardEvent::IdlePenalty);
        }

        if input.direction_changed
            && (self.direction_change_cooldown == 0 || input.ticks_since_direction_change < self.direction_change_cooldown)
        {
            reward += self.weights.weight(RewardEvent::DirectionChangePenalty);
        }

        RewardOutcome {
            reward,
            opponent_distance,
            objective_distance,
        }
    }

    fn is_aimed_at(&self, input: &StepRewardInput<'_>, target: (f32, f32)) -> bool {
        let position = input.entity.position();
        if line_of_sight(input.terrain, position, target) == 0.0 {
            return false;
        }
        aim_dot(input.entity.direction(), target.0 - position.0, target.1 - position.1) >= self.aim_dot_threshold
    }
}
