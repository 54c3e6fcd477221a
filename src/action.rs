//! Discrete action ids and the control intents they stand for.
//!
//! The learner only ever sees `usize` ids in `[0, action_count)`; the table
//! here maps each id to a movement direction and a fire flag. Entry 0 is the
//! idle action and is also what unknown ids decode to.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Cardinal movement direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// Unit vector in screen coordinates (y grows downward).
    pub fn vector(&self) -> (f32, f32) {
        match self {
            Direction::Up => (0.0, -1.0),
            Direction::Down => (0.0, 1.0),
            Direction::Left => (-1.0, 0.0),
            Direction::Right => (1.0, 0.0),
        }
    }
}

/// One row of the action table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ActionSpec {
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub fire: bool,
}

impl ActionSpec {
    pub const IDLE: ActionSpec = ActionSpec { direction: None, fire: false };

    pub const fn new(direction: Option<Direction>, fire: bool) -> Self {
        ActionSpec { direction, fire }
    }

    pub fn is_movement(&self) -> bool {
        self.direction.is_some()
    }
}

/// What the environment should do this tick for one entity
pub type ControlIntent = ActionSpec;

/// Candidate filter for random action sampling
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SampleMode {
    #[default]
    Any,
    /// Only entries that move; used to break an entity out of a stall.
    Movement,
}

/// Ordered action table indexed by action id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionTable {
    entries: Vec<ActionSpec>,
}

impl ActionTable {
    pub fn new(entries: Vec<ActionSpec>) -> Self {
        ActionTable { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ActionSpec] {
        &self.entries
    }

    /// Decode an action id; out-of-range ids fall back to the first entry.
    pub fn decode(&self, action: usize) -> ControlIntent {
        self.entries
            .get(action)
            .or_else(|| self.entries.first())
            .copied()
            .unwrap_or(ActionSpec::IDLE)
    }

    /// Uniformly sample an action id from the entries allowed by `mode`.
    ///
    /// Returns 0 when the table is empty or nothing matches the filter.
    pub fn sample<R: Rng + ?Sized>(&self, mode: SampleMode, rng: &mut R) -> usize {
        let candidates: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, spec)| match mode {
                SampleMode::Any => true,
                SampleMode::Movement => spec.is_movement(),
            })
            .map(|(index, _)| index)
            .collect();

        if candidates.is_empty() {
            return 0;
        }
        candidates[rng.gen_range(0..candidates.len())]
    }
}

impl Default for ActionTable {
    /// Idle, four moves, fire in place, four moves while firing.
    fn default() -> Self {
        use Direction::*;
        let moves = [Up, Down, Left, Right];
        let mut entries = vec![ActionSpec::IDLE];
        entries.extend(moves.iter().map(|&d| ActionSpec::new(Some(d), false)));
        entries.push(ActionSpec::new(None, true));
        entries.extend(moves.iter().map(|&d| ActionSpec::new(Some(d), true)));
        ActionTable { entries }
    }
}
