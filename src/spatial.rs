//! Spatial partitioning for collider broad-phase and ray queries.
//!
//! Provides O(1) cell lookup and O(k) neighbor queries where k is the number
//! of colliders in nearby cells, rather than O(n) for brute force.

use crate::components::{Collider, Position, Projectile};
use crate::geometry::ray_circle_intersection;
use bevy_ecs::prelude::*;
use std::collections::HashMap;

/// Grid-based spatial partitioning of static and moving colliders.
///
/// Projectiles are not indexed; they query the grid.
#[derive(Resource, Debug)]
pub struct SpatialGrid {
    /// Cell size in world units.
    pub cell_size: f32,
    cells: HashMap<(i32, i32), Vec<SpatialEntry>>,
    /// Reverse lookup: entity to cell.
    entity_cells: HashMap<Entity, (i32, i32)>,
    /// Largest collider radius indexed, used to widen searches.
    max_radius: f32,
}

/// Entry in a spatial cell.
#[derive(Debug, Clone, Copy)]
pub struct SpatialEntry {
    pub entity: Entity,
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub layer: u32,
    pub hard: bool,
}

/// A ray query result.
#[derive(Debug, Clone, Copy)]
pub struct RayHit {
    pub entity: Entity,
    pub distance: f32,
    pub point: (f32, f32),
}

impl Default for SpatialGrid {
    fn default() -> Self {
        Self::new(20.0)
    }
}

impl SpatialGrid {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            cells: HashMap::new(),
            entity_cells: HashMap::new(),
            max_radius: 0.0,
        }
    }

    #[inline]
    pub fn world_to_cell(&self, x: f32, y: f32) -> (i32, i32) {
        (
            (x / self.cell_size).floor() as i32,
            (y / self.cell_size).floor() as i32,
        )
    }

    /// Clear all entries (call at start of each frame before rebuilding).
    pub fn clear(&mut self) {
        self.cells.clear();
        self.entity_cells.clear();
        self.max_radius = 0.0;
    }

    pub fn insert(&mut self, entity: Entity, x: f32, y: f32, collider: &Collider) {
        let cell = self.world_to_cell(x, y);

        if let Some(&old_cell) = self.entity_cells.get(&entity) {
            if let Some(entries) = self.cells.get_mut(&old_cell) {
                entries.retain(|e| e.entity != entity);
            }
        }

        let entry = SpatialEntry {
            entity,
            x,
            y,
            radius: collider.radius,
            layer: collider.layer,
            hard: collider.hard,
        };
        self.cells.entry(cell).or_default().push(entry);
        self.entity_cells.insert(entity, cell);
        self.max_radius = self.max_radius.max(collider.radius);
    }

    pub fn remove(&mut self, entity: Entity) {
        if let Some(cell) = self.entity_cells.remove(&entity) {
            if let Some(entries) = self.cells.get_mut(&cell) {
                entries.retain(|e| e.entity != entity);
            }
        }
    }

    fn cells_in_box(&self, min: (f32, f32), max: (f32, f32)) -> impl Iterator<Item = &SpatialEntry> {
        let (cx0, cy0) = self.world_to_cell(min.0, min.1);
        let (cx1, cy1) = self.world_to_cell(max.0, max.1);
        (cx0..=cx1)
            .flat_map(move |cx| (cy0..=cy1).map(move |cy| (cx, cy)))
            .filter_map(move |cell| self.cells.get(&cell))
            .flatten()
    }

    /// Colliders whose circle overlaps the circle at (x, y) with `radius`.
    /// Returns entries sorted by center distance (closest first).
    pub fn query_overlapping(&self, x: f32, y: f32, radius: f32) -> Vec<SpatialEntry> {
        let reach = radius + self.max_radius;
        let mut results: Vec<SpatialEntry> = self
            .cells_in_box((x - reach, y - reach), (x + reach, y + reach))
            .filter(|entry| {
                let limit = radius + entry.radius;
                (entry.x - x).powi(2) + (entry.y - y).powi(2) <= limit * limit
            })
            .copied()
            .collect();

        results.sort_by(|a, b| {
            let dist_a = (a.x - x).powi(2) + (a.y - y).powi(2);
            let dist_b = (b.x - x).powi(2) + (b.y - y).powi(2);
            dist_a.partial_cmp(&dist_b).unwrap_or(std::cmp::Ordering::Equal)
        });
        results
    }

    /// Every collider on `mask` that the segment enters, nearest first.
    ///
    /// `dir` must be normalized. Colliders already containing the origin are
    /// skipped; that contact belongs to the narrow phase.
    pub fn raycast(
        &self,
        origin: (f32, f32),
        dir: (f32, f32),
        max_distance: f32,
        mask: u32,
    ) -> Vec<RayHit> {
        let end = (origin.0 + dir.0 * max_distance, origin.1 + dir.1 * max_distance);
        let pad = self.max_radius;
        let min = (origin.0.min(end.0) - pad, origin.1.min(end.1) - pad);
        let max = (origin.0.max(end.0) + pad, origin.1.max(end.1) + pad);

        let mut hits: Vec<RayHit> = self
            .cells_in_box(min, max)
            .filter(|entry| entry.layer & mask != 0)
            .filter_map(|entry| {
                ray_circle_intersection(origin, dir, max_distance, (entry.x, entry.y), entry.radius).map(
                    |distance| RayHit {
                        entity: entry.entity,
                        distance,
                        point: (origin.0 + dir.0 * distance, origin.1 + dir.1 * distance),
                    },
                )
            })
            .collect();

        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        hits
    }

    pub fn total_count(&self) -> usize {
        self.entity_cells.len()
    }
}

/// System that rebuilds the spatial grid each frame from non-projectile colliders.
pub fn spatial_grid_update_system(
    mut grid: ResMut<SpatialGrid>,
    query: Query<(Entity, &Position, &Collider), Without<Projectile>>,
) {
    grid.clear();
    for (entity, pos, collider) in query.iter() {
        grid.insert(entity, pos.x, pos.y, collider);
    }
}
