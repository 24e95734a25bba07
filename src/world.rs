//! Snapshot types.
//!
//! The `Snapshot` struct provides a serializable view of the combat state
//! that a host can render or log. Entities are identified by
//! `Entity::to_bits()`.

use crate::components::*;
use crate::damage::{Damageable, Destructible};
use crate::systems::collision::{CollisionScheduler, DrainPath};
use crate::systems::destruction::DeletionQueue;
use crate::systems::explosion::ExplosionQueue;
use crate::systems::negation::SameOriginNegation;
use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};

/// Snapshot of a single projectile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectileSnapshot {
    pub id: u64,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub state: String,
    pub penetration: f32,
    pub damage_total: f32,
    pub shooter: Option<u64>,
}

/// Snapshot of a shield field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub id: u64,
    pub enabled: bool,
    pub powered: bool,
    pub anchored: bool,
    pub angle: f32,
    pub width_degrees: f32,
    pub radius: f32,
    /// Power draw including surge.
    pub load: f32,
    pub surge_power: f32,
    pub occupants: usize,
    /// Outline in the owning grid's frame.
    pub vertices: Vec<(f32, f32)>,
}

/// Snapshot of anything that takes damage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DamageableSnapshot {
    pub id: u64,
    pub x: f32,
    pub y: f32,
    pub damage_total: f32,
    pub destroyed_at: Option<f32>,
}

/// Scheduler and cleanup bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queued_collisions: usize,
    pub pending_deletions: usize,
    pub pending_explosions: usize,
    pub last_drain_processed: usize,
    pub last_drain_parallel: bool,
    pub negation_cached_tiles: usize,
}

/// Complete combat state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Current simulation tick.
    pub tick: u64,
    /// Elapsed simulation time in seconds.
    pub time: f32,
    pub projectiles: Vec<ProjectileSnapshot>,
    pub fields: Vec<FieldSnapshot>,
    pub damageables: Vec<DamageableSnapshot>,
    pub queues: QueueSnapshot,
}

impl Snapshot {
    /// Create a snapshot from the ECS world.
    pub fn from_world(world: &mut World, tick: u64, time: f32) -> Self {
        let mut projectiles = Vec::new();
        let mut query = world.query::<(Entity, &Projectile, &Position, Option<&Velocity>)>();
        for (entity, projectile, pos, vel) in query.iter(world) {
            let vel = vel.copied().unwrap_or_default();
            projectiles.push(ProjectileSnapshot {
                id: entity.to_bits(),
                x: pos.x,
                y: pos.y,
                vx: vel.vx,
                vy: vel.vy,
                state: projectile.state.label().to_string(),
                penetration: projectile.penetration(),
                damage_total: projectile.damage.total(),
                shooter: projectile.shooter.map(|s| s.to_bits()),
            });
        }

        let mut fields = Vec::new();
        let mut field_query = world.query::<(Entity, &ShieldField)>();
        for (entity, field) in field_query.iter(world) {
            fields.push(FieldSnapshot {
                id: entity.to_bits(),
                enabled: field.enabled,
                powered: field.powered,
                anchored: field.anchored,
                angle: field.angle,
                width_degrees: field.width.to_degrees(),
                radius: field.radius,
                load: field.load,
                surge_power: field.current_surge_power,
                occupants: field.occupants.len(),
                vertices: field.geometry.vertices.clone(),
            });
        }

        let mut damageables = Vec::new();
        let mut damage_query = world.query::<(Entity, &Position, &Damageable, Option<&Destructible>)>();
        for (entity, pos, damageable, destructible) in damage_query.iter(world) {
            damageables.push(DamageableSnapshot {
                id: entity.to_bits(),
                x: pos.x,
                y: pos.y,
                damage_total: damageable.total(),
                destroyed_at: destructible.map(|d| d.destroyed_at),
            });
        }

        projectiles.sort_by_key(|p| p.id);
        fields.sort_by_key(|f| f.id);
        damageables.sort_by_key(|d| d.id);

        let last_drain = world
            .get_resource::<CollisionScheduler>()
            .and_then(|s| s.last_report());
        let queues = QueueSnapshot {
            queued_collisions: world.get_resource::<CollisionScheduler>().map(|s| s.queued()).unwrap_or(0),
            pending_deletions: world.get_resource::<DeletionQueue>().map(|q| q.len()).unwrap_or(0),
            pending_explosions: world.get_resource::<ExplosionQueue>().map(|q| q.len()).unwrap_or(0),
            last_drain_processed: last_drain.map(|r| r.processed).unwrap_or(0),
            last_drain_parallel: last_drain.is_some_and(|r| r.path == DrainPath::Parallel),
            negation_cached_tiles: world
                .get_resource::<SameOriginNegation>()
                .map(|n| n.cached_tile_count())
                .unwrap_or(0),
        };

        Self {
            tick,
            time,
            projectiles,
            fields,
            damageables,
            queues,
        }
    }

    /// Serialize snapshot to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Serialize snapshot to pretty JSON string.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damage::{DamageKind, DamageSpecifier};

    #[test]
    fn test_snapshot_lists_combat_entities() {
        let mut world = World::new();
        let shooter = world.spawn(TargetBundle::new(-5.0, 0.0, 1.0, 100.0)).id();
        let projectile = Projectile::new(DamageSpecifier::single(DamageKind::Heat, 7.0)).with_shooter(shooter, None);
        world.spawn(ProjectileBundle::new(projectile, 1.0, 2.0, 3.0, 0.0));
        world.spawn(ShieldField::new(15.0, 120.0));

        let snapshot = Snapshot::from_world(&mut world, 3, 0.05);
        assert_eq!(snapshot.projectiles.len(), 1);
        assert_eq!(snapshot.projectiles[0].state, "Flying");
        assert_eq!(snapshot.projectiles[0].shooter, Some(shooter.to_bits()));
        assert_eq!(snapshot.fields.len(), 1);
        assert!((snapshot.fields[0].width_degrees - 120.0).abs() < 1e-3);
        assert_eq!(snapshot.damageables.len(), 1);
        assert_eq!(snapshot.queues.queued_collisions, 0);

        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"state\":\"Flying\""));
        let restored = Snapshot::from_json(&json).unwrap();
        assert_eq!(restored.tick, 3);
    }
}
