//! Contracts with the simulation that owns entities and terrain.
//!
//! Nothing in this module mutates the world: the encoder and the reward
//! shaper read entity snapshots and query terrain through [`TerrainMap`].

use serde::{Deserialize, Serialize};

/// Kinematic snapshot of one entity at the current tick
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct EntitySnapshot {
    pub x: f32,
    pub y: f32,
    pub direction_x: f32,
    pub direction_y: f32,
    pub speed: f32,
    pub health: f32,
    pub max_health: f32,
    pub weapon_cooldown_ticks: f32,
    pub weapon_cooldown_max: f32,
}

impl EntitySnapshot {
    pub fn position(&self) -> (f32, f32) {
        (self.x, self.y)
    }

    pub fn direction(&self) -> (f32, f32) {
        (self.direction_x, self.direction_y)
    }
}

/// Row/column address of a map tile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilePos {
    pub row: i32,
    pub col: i32,
}

impl TilePos {
    pub fn new(row: i32, col: i32) -> Self {
        TilePos { row, col }
    }
}

/// Terrain queries the learner's feature and reward code depend on.
pub trait TerrainMap {
    /// Edge length of a square tile in pixels.
    fn tile_size(&self) -> f32;

    /// Terrain type id at `(row, col)`, `None` outside the map.
    fn tile_at(&self, row: i32, col: i32) -> Option<u8>;

    fn pixel_to_tile(&self, x: f32, y: f32) -> TilePos {
        let size = self.tile_size();
        if size <= 0.0 {
            return TilePos::new(0, 0);
        }
        TilePos::new((y / size).floor() as i32, (x / size).floor() as i32)
    }

    /// Top-left pixel of a tile.
    fn tile_to_pixel(&self, row: i32, col: i32) -> (f32, f32) {
        let size = self.tile_size();
        (col as f32 * size, row as f32 * size)
    }

    /// Whether blocking terrain lies on the straight segment between two pixel points.
    fn is_path_blocked(&self, from: (f32, f32), to: (f32, f32)) -> bool;
}

/// Pixel center of a tile.
pub fn tile_center(terrain: &dyn TerrainMap, tile: TilePos) -> (f32, f32) {
    let (x, y) = terrain.tile_to_pixel(tile.row, tile.col);
    let half = terrain.tile_size() / 2.0;
    (x + half, y + half)
}

pub fn distance(from: (f32, f32), to: (f32, f32)) -> f32 {
    let dx = to.0 - from.0;
    let dy = to.1 - from.1;
    (dx * dx + dy * dy).sqrt()
}

/// Dot product of a facing direction with the normalized offset `(dx, dy)`.
///
/// Zero-length offsets give 0.
pub fn aim_dot(direction: (f32, f32), dx: f32, dy: f32) -> f32 {
    let magnitude = (dx * dx + dy * dy).sqrt();
    if magnitude == 0.0 || !magnitude.is_finite() {
        return 0.0;
    }
    (direction.0 * dx + direction.1 * dy) / magnitude
}

/// 1.0 when the straight path is clear, 0.0 when blocked, when no terrain is
/// known, or when either end is not a finite point.
pub fn line_of_sight(terrain: Option<&dyn TerrainMap>, from: (f32, f32), to: (f32, f32)) -> f32 {
    let finite = from.0.is_finite() && from.1.is_finite() && to.0.is_finite() && to.1.is_finite();
    match terrain {
        Some(terrain) if finite && !terrain.is_path_blocked(from, to) => 1.0,
        _ => 0.0,
    }
}

/// Row-major tile grid where some tile ids stop shots and sight lines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridTerrain {
    pub rows: usize,
    pub cols: usize,
    pub tile_size: f32,
    pub tiles: Vec<u8>,
    pub blocking: Vec<u8>,
}

impl GridTerrain {
    /// Grid filled with tile id 0.
    pub fn open(rows: usize, cols: usize, tile_size: f32) -> Self {
        GridTerrain {
            rows,
            cols,
            tile_size,
            tiles: vec![0; rows * cols],
            blocking: Vec::new(),
        }
    }

    pub fn with_blocking(mut self, blocking: &[u8]) -> Self {
        self.blocking = blocking.to_vec();
        self
    }

    pub fn set(&mut self, row: usize, col: usize, id: u8) {
        if row < self.rows && col < self.cols {
            self.tiles[row * self.cols + col] = id;
        }
    }

    pub fn width(&self) -> f32 {
        self.cols as f32 * self.tile_size
    }

    pub fn height(&self) -> f32 {
        self.rows as f32 * self.tile_size
    }

    pub fn is_blocking(&self, row: i32, col: i32) -> bool {
        self.tile_at(row, col).map(|id| self.blocking.contains(&id)).unwrap_or(true)
    }
}

impl TerrainMap for GridTerrain {
    fn tile_size(&self) -> f32 {
        self.tile_size
    }

    fn tile_at(&self, row: i32, col: i32) -> Option<u8> {
        if row < 0 || col < 0 || row as usize >= self.rows || col as usize >= self.cols {
            return None;
        }
        self.tiles.get(row as usize * self.cols + col as usize).copied()
    }

    /// Samples the segment every quarter tile.
    fn is_path_blocked(&self, from: (f32, f32), to: (f32, f32)) -> bool {
        if !(from.0.is_finite() && from.1.is_finite() && to.0.is_finite() && to.1.is_finite()) {
            return true;
        }
        if !(self.tile_size.is_finite() && self.tile_size > 0.0) {
            return true;
        }
        // A segment inside the grid crosses at most rows + cols tiles.
        let max_samples = 4 * (self.rows + self.cols).max(1);
        let step = self.tile_size / 4.0;
        let samples = ((distance(from, to) / step).ceil().max(1.0) as usize).min(max_samples);
        (0..=samples).any(|i| {
            let t = i as f32 / samples as f32;
            let tile = self.pixel_to_tile(from.0 + (to.0 - from.0) * t, from.1 + (to.1 - from.1) * t);
            self.is_blocking(tile.row, tile.col)
        })
    }
}
