//! Grid tiles - the floor and hull plating a grid is built from.
//!
//! Tiles are stored per grid in a row-major [`GridTiles`] component, in the
//! grid's local frame. Blasts degrade tiles; every type change is reported as
//! a [`TileChanged`] so same-origin negation can roll it back.

use crate::geometry::rotate;
use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};

/// Tile type at a grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TileType {
    /// Open space.
    #[default]
    Empty,
    /// Bare structural lattice.
    Lattice,
    /// Hull plating.
    Plating,
    /// Finished floor.
    Floor,
    /// Reinforced plating.
    Reinforced,
}

impl TileType {
    /// What the tile becomes after taking enough blast damage.
    pub fn degrade(&self) -> TileType {
        match self {
            TileType::Reinforced => TileType::Plating,
            TileType::Floor => TileType::Plating,
            TileType::Plating => TileType::Lattice,
            TileType::Lattice | TileType::Empty => TileType::Empty,
        }
    }

    /// Blast damage needed to degrade one step.
    pub fn strength(&self) -> f32 {
        match self {
            TileType::Empty => f32::INFINITY,
            TileType::Lattice => 5.0,
            TileType::Plating => 15.0,
            TileType::Floor => 10.0,
            TileType::Reinforced => 40.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, TileType::Empty)
    }
}

/// A single tile.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TileCell {
    pub tile_type: TileType,
    /// Blast damage accumulated since the last degrade.
    pub damage: f32,
}

/// A tile changed type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileChanged {
    pub grid: Entity,
    pub index: (usize, usize),
    pub old: TileType,
    pub new: TileType,
}

/// Tile layout of one grid, centered on the grid origin.
#[derive(Component, Debug, Clone, Serialize, Deserialize)]
pub struct GridTiles {
    /// Width of the grid in tiles.
    pub width: usize,
    /// Height of the grid in tiles.
    pub height: usize,
    /// Size of each tile in world units.
    pub tile_size: f32,
    /// Local position of tile (0, 0).
    pub origin_x: f32,
    pub origin_y: f32,
    /// Tiles (row-major order).
    pub cells: Vec<TileCell>,
}

impl GridTiles {
    /// Create a grid of `fill` tiles.
    pub fn new(width: usize, height: usize, tile_size: f32, fill: TileType) -> Self {
        Self {
            width,
            height,
            tile_size,
            origin_x: -(width as f32 * tile_size) / 2.0,
            origin_y: -(height as f32 * tile_size) / 2.0,
            cells: vec![
                TileCell {
                    tile_type: fill,
                    damage: 0.0
                };
                width * height
            ],
        }
    }

    fn cell_index(&self, x: usize, y: usize) -> Option<usize> {
        if x < self.width && y < self.height {
            Some(y * self.width + x)
        } else {
            None
        }
    }

    pub fn get(&self, x: usize, y: usize) -> Option<TileType> {
        self.cell_index(x, y).map(|i| self.cells[i].tile_type)
    }

    /// Overwrite a tile. Returns the previous type.
    pub fn set(&mut self, x: usize, y: usize, tile_type: TileType) -> Option<TileType> {
        let i = self.cell_index(x, y)?;
        let old = self.cells[i].tile_type;
        self.cells[i] = TileCell { tile_type, damage: 0.0 };
        Some(old)
    }

    /// Convert a grid-local position to tile coordinates, if on the grid.
    pub fn local_to_tile(&self, local_x: f32, local_y: f32) -> Option<(usize, usize)> {
        let tx = ((local_x - self.origin_x) / self.tile_size).floor();
        let ty = ((local_y - self.origin_y) / self.tile_size).floor();
        if tx < 0.0 || ty < 0.0 || tx as usize >= self.width || ty as usize >= self.height {
            return None;
        }
        Some((tx as usize, ty as usize))
    }

    /// Grid-local center of a tile.
    pub fn tile_to_local(&self, x: usize, y: usize) -> (f32, f32) {
        (
            self.origin_x + (x as f32 + 0.5) * self.tile_size,
            self.origin_y + (y as f32 + 0.5) * self.tile_size,
        )
    }

    /// Apply a blast centered at a grid-local position.
    ///
    /// Damage falls off quadratically with distance; tiles that exceed their
    /// strength degrade one step. Returns the type changes.
    pub fn apply_blast(&mut self, grid: Entity, local: (f32, f32), radius: f32, intensity: f32) -> Vec<TileChanged> {
        let mut changes = Vec::new();
        if radius <= 0.0 || self.tile_size <= 0.0 {
            return changes;
        }

        for y in 0..self.height {
            for x in 0..self.width {
                let (cx, cy) = self.tile_to_local(x, y);
                let dist = ((cx - local.0).powi(2) + (cy - local.1).powi(2)).sqrt();
                if dist > radius {
                    continue;
                }
                let falloff = 1.0 - dist / radius;
                let Some(i) = self.cell_index(x, y) else { continue };
                let cell = &mut self.cells[i];
                if cell.tile_type.is_empty() {
                    continue;
                }
                cell.damage += intensity * falloff * falloff;
                if cell.damage >= cell.tile_type.strength() {
                    let old = cell.tile_type;
                    cell.tile_type = old.degrade();
                    cell.damage = 0.0;
                    changes.push(TileChanged {
                        grid,
                        index: (x, y),
                        old,
                        new: cell.tile_type,
                    });
                }
            }
        }
        changes
    }
}

/// World position to grid-local, given the grid's pose.
pub fn world_to_grid_local(point: (f32, f32), grid_pos: (f32, f32), grid_rot: f32) -> (f32, f32) {
    rotate((point.0 - grid_pos.0, point.1 - grid_pos.1), -grid_rot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_to_tile_bounds() {
        let tiles = GridTiles::new(10, 10, 1.0, TileType::Floor);
        assert_eq!(tiles.local_to_tile(0.0, 0.0), Some((5, 5)));
        assert_eq!(tiles.local_to_tile(-5.0, -5.0), Some((0, 0)));
        assert_eq!(tiles.local_to_tile(5.0, 0.0), None);
    }

    #[test]
    fn test_blast_degrades_near_tiles_only() {
        let mut world = World::new();
        let grid = world.spawn_empty().id();
        let mut tiles = GridTiles::new(10, 10, 1.0, TileType::Floor);

        let changes = tiles.apply_blast(grid, (0.5, 0.5), 2.0, 20.0);
        assert!(!changes.is_empty());
        assert!(changes.iter().all(|c| c.old == TileType::Floor && c.new == TileType::Plating));
        assert_eq!(tiles.get(5, 5), Some(TileType::Plating));
        assert_eq!(tiles.get(0, 0), Some(TileType::Floor));
    }

    #[test]
    fn test_set_returns_previous() {
        let mut tiles = GridTiles::new(2, 2, 1.0, TileType::Lattice);
        assert_eq!(tiles.set(1, 1, TileType::Reinforced), Some(TileType::Lattice));
        assert_eq!(tiles.set(3, 3, TileType::Floor), None);
        assert_eq!(TileType::Reinforced.degrade().degrade().degrade(), TileType::Empty);
    }
}
