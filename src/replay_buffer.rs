use ndarray::Array1;
use rand::Rng;

/// One step of one entity's episode
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub state: Array1<f32>,
    pub action: usize,
    pub reward: f32,
    pub next_state: Array1<f32>,
    pub done: bool,
}

/// Fixed-capacity ring of transitions.
///
/// Below capacity, `add` appends; once full it overwrites the slot under the
/// write cursor (the oldest transition) and advances the cursor, so the store
/// always holds the most recent `capacity` transitions.
#[derive(Clone, Debug)]
pub struct ExperienceStore {
    buffer: Vec<Transition>,
    capacity: usize,
    cursor: usize,
}

impl ExperienceStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ExperienceStore {
            buffer: Vec::with_capacity(capacity.min(4096)),
            capacity,
            cursor: 0,
        }
    }

    pub fn add(&mut self, transition: Transition) {
        if self.buffer.len() < self.capacity {
            self.buffer.push(transition);
        } else {
            self.buffer[self.cursor] = transition;
            self.cursor = (self.cursor + 1) % self.capacity;
        }
    }

    /// Draw `batch_size` transitions independently and uniformly, with
    /// replacement. An empty store yields an empty batch.
    pub fn sample<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<&Transition> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        (0..batch_size)
            .map(|_| &self.buffer[rng.gen_range(0..self.buffer.len())])
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Slots in storage order (not insertion order once the ring has wrapped).
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.buffer.iter()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
    }
}
