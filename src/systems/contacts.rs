//! Narrow-phase contact detection for projectiles.
//!
//! Stands in for the physics layer: each tick every flying projectile is
//! tested against the broad-phase grid, and contacts that started this tick
//! are offered to the resolver. A pair that stays in contact is reported once.
//!
//! ## Data Access
//! - Reads: `Projectile`, `Position`, `Velocity`, `Collider`, `SpatialGrid`
//! - Writes: `ActiveContacts`, plus whatever resolution touches

use crate::components::*;
use crate::events::CandidateCollision;
use crate::spatial::SpatialGrid;
use crate::systems::collision::on_candidate_collision;
use bevy_ecs::prelude::*;
use std::collections::HashSet;
use tracing::debug;

/// Projectile/other pairs touching as of the last detection pass.
#[derive(Resource, Debug, Default)]
pub struct ActiveContacts {
    pairs: HashSet<(Entity, Entity)>,
}

impl ActiveContacts {
    pub fn contains(&self, projectile: Entity, other: Entity) -> bool {
        self.pairs.contains(&(projectile, other))
    }

    /// Mark a pair as already touching, so the next detection pass does not
    /// report it again.
    pub fn record(&mut self, projectile: Entity, other: Entity) {
        self.pairs.insert((projectile, other));
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Contacts overlapping right now, in projectile order.
fn overlapping(world: &mut World) -> Vec<CandidateCollision> {
    let mut query = world.query::<(Entity, &Projectile, &Position, Option<&Velocity>, &Collider)>();
    let world: &World = world;
    let Some(grid) = world.get_resource::<SpatialGrid>() else {
        return Vec::new();
    };

    let mut contacts = Vec::new();
    for (entity, projectile, pos, vel, collider) in query.iter(world) {
        if projectile.is_spent() {
            continue;
        }
        let vel = vel.copied().unwrap_or_default();
        for entry in grid.query_overlapping(pos.x, pos.y, collider.radius) {
            if entry.entity == entity {
                continue;
            }
            let other_vel = world.get::<Velocity>(entry.entity).copied().unwrap_or_default();
            contacts.push(CandidateCollision::discrete(
                entity,
                entry.entity,
                (pos.x, pos.y),
                (vel.vx - other_vel.vx, vel.vy - other_vel.vy),
            ));
        }
    }
    contacts.sort_by_key(|c| (c.projectile, c.other));
    contacts
}

/// System that reports newly started projectile contacts.
pub fn contact_detection_system(world: &mut World) {
    let contacts = overlapping(world);
    let current: HashSet<(Entity, Entity)> = contacts.iter().map(|c| (c.projectile, c.other)).collect();

    let previous = std::mem::replace(
        &mut world.get_resource_or_insert_with(ActiveContacts::default).pairs,
        current,
    );

    for contact in contacts {
        if previous.contains(&(contact.projectile, contact.other)) {
            continue;
        }
        if let Err(err) = on_candidate_collision(world, contact) {
            debug!(%err, "contact skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damage::{DamageKind, DamageSpecifier, Damageable};
    use crate::events::CombatEventBuffer;
    use crate::spatial::spatial_grid_update_system;
    use crate::systems::collision::CollisionScheduler;
    use crate::systems::destruction::DeletionQueue;
    use crate::systems::explosion::ExplosionQueue;
    use crate::systems::movement::DeltaTime;
    use crate::systems::performance::SimConfig;

    fn contact_world() -> World {
        let mut world = World::new();
        world.insert_resource(SimConfig::default());
        world.insert_resource(DeltaTime(1.0 / 60.0));
        world.init_resource::<SpatialGrid>();
        world.init_resource::<CombatEventBuffer>();
        world.init_resource::<DeletionQueue>();
        world.init_resource::<ExplosionQueue>();
        world.init_resource::<CollisionScheduler>();
        world
    }

    #[test]
    fn test_persistent_contact_reports_once() {
        let mut world = contact_world();
        let projectile = Projectile::new(DamageSpecifier::single(DamageKind::Blunt, 5.0)).with_penetration_threshold(1000.0);
        let ball = world.spawn(ProjectileBundle::new(projectile, 0.0, 0.0, 0.0, 0.0)).id();
        let wall = world.spawn(TargetBundle::new(0.5, 0.0, 1.0, 1.0)).id();

        let mut schedule = Schedule::default();
        schedule.add_systems((spatial_grid_update_system, contact_detection_system).chain());
        schedule.run(&mut world);
        schedule.run(&mut world);

        assert_eq!(world.get::<Damageable>(wall).unwrap().total(), 5.0);
        assert!(world.resource::<ActiveContacts>().contains(ball, wall));
    }

    #[test]
    fn test_distant_colliders_do_not_touch() {
        let mut world = contact_world();
        let projectile = Projectile::new(DamageSpecifier::single(DamageKind::Blunt, 5.0));
        world.spawn(ProjectileBundle::new(projectile, 0.0, 0.0, 1.0, 0.0));
        let wall = world.spawn(TargetBundle::new(5.0, 0.0, 1.0, 100.0)).id();

        let mut schedule = Schedule::default();
        schedule.add_systems((spatial_grid_update_system, contact_detection_system).chain());
        schedule.run(&mut world);

        assert_eq!(world.get::<Damageable>(wall).unwrap().total(), 0.0);
        assert!(world.resource::<ActiveContacts>().is_empty());
    }
}
