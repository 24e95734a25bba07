//! Simulation tuning, tick counter and clock.
//!
//! All thresholds the resolver, scheduler and negation use live in
//! [`SimConfig`]. Defaults match the values the combat balance was tuned
//! against; hosts may override them from JSON.

use crate::components::layers;
use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};

/// Configuration for simulation tuning.
#[derive(Resource, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Fixed timestep in seconds (e.g., 1/60 for 60 Hz).
    pub fixed_timestep: f32,
    /// Cell size of the collider broad-phase grid.
    pub spatial_cell_size: f32,
    /// Projectiles at or above this speed get a raycast sweep each tick.
    pub min_raycast_velocity: f32,
    /// Collision layers the sweep tests against.
    pub raycast_mask: u32,
    /// Contacts are resolved inline while pending load stays below this.
    pub immediate_floor: usize,
    /// Drained batches at or above this size go to the worker pool.
    pub min_parallel_batch: usize,
    /// Units of work per worker chunk.
    pub batch_chunk_size: usize,
    /// Seconds between time-based drains.
    pub drain_interval: f32,
    /// Queue length that forces a drain regardless of time.
    pub drain_size_threshold: usize,
    /// Global multiplier on every projectile payload.
    pub universal_projectile_damage_modifier: f32,
    /// Seconds a grid's tiles stay protected after a same-origin hit.
    pub protection_duration: f32,
    /// Padding used to separate released embedded entities.
    pub release_offset: f32,
    /// Padding multiplier when release ordering stalls on a cycle.
    pub release_cycle_multiplier: f32,
    /// Field count above which effect updates fan out to workers.
    pub parallel_field_update_threshold: usize,
    /// Tolerance added to a field's radius in membership tests.
    pub shield_membership_epsilon: f32,
    /// Minimum width (degrees) a field is clamped to when rebuilt.
    pub shield_min_width: f32,
    /// Seconds between grid shield protection sweeps.
    pub grid_shield_refresh_interval: f32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            fixed_timestep: 1.0 / 60.0,
            spatial_cell_size: 20.0,
            min_raycast_velocity: 100.0,
            raycast_mask: layers::RAYCAST_MASK,
            immediate_floor: 4,
            min_parallel_batch: 8,
            batch_chunk_size: 16,
            drain_interval: 0.016,
            drain_size_threshold: 16,
            universal_projectile_damage_modifier: 1.0,
            protection_duration: 10.0,
            release_offset: 0.01,
            release_cycle_multiplier: 5.0,
            parallel_field_update_threshold: 4,
            shield_membership_epsilon: 0.1,
            shield_min_width: 10.0,
            grid_shield_refresh_interval: 1.0,
        }
    }
}

impl SimConfig {
    /// Load a configuration from JSON. Missing fields keep their defaults.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// Global simulation tick counter.
#[derive(Resource, Debug, Clone, Copy, Default)]
pub struct SimTick(pub u64);

impl SimTick {
    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }
}

/// Elapsed simulation time in seconds.
#[derive(Resource, Debug, Clone, Copy, Default)]
pub struct SimClock {
    pub elapsed: f64,
}

impl SimClock {
    pub fn advance(&mut self, dt: f32) {
        self.elapsed += dt as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SimConfig::from_json(r#"{ "min_parallel_batch": 32, "drain_interval": 0.05 }"#).unwrap();
        assert_eq!(config.min_parallel_batch, 32);
        assert!((config.drain_interval - 0.05).abs() < 1e-6);
        assert_eq!(config.immediate_floor, 4);
        assert_eq!(config.min_raycast_velocity, 100.0);
    }

    #[test]
    fn test_tick_and_clock_advance() {
        let mut tick = SimTick::default();
        tick.increment();
        tick.increment();
        assert_eq!(tick.0, 2);

        let mut clock = SimClock::default();
        clock.advance(0.5);
        clock.advance(0.25);
        assert!((clock.elapsed - 0.75).abs() < 1e-9);
    }
}
