//! High-velocity raycast sweep.
//!
//! Fast projectiles can cross a thin collider inside one step. Once per tick,
//! every projectile at or above `min_raycast_velocity` casts a ray along its
//! next step; the nearest valid hit is fed through the normal resolution
//! path as a sweep contact.
//!
//! ## Data Access
//! - Reads: `Projectile`, `Position`, `Velocity`, `SpatialGrid`, `SimConfig`
//! - Writes: `Position`, `Velocity` of the sweeping projectile (via resolution)

use crate::components::*;
use crate::events::{CandidateCollision, ContactKind};
use crate::spatial::SpatialGrid;
use crate::systems::collision::{filter_contact, on_candidate_collision, ContactOutcome};
use crate::systems::contacts::ActiveContacts;
use crate::systems::movement::DeltaTime;
use crate::systems::performance::SimConfig;
use crate::systems::projectile::HitOutcome;
use bevy_ecs::prelude::*;
use tracing::{debug, trace};

/// A sweep that found something to hit.
#[derive(Debug, Clone, Copy)]
struct SweepHit {
    contact: CandidateCollision,
    velocity: Velocity,
}

/// Cast one projectile's next step. Returns the nearest hit that passes the
/// contact filter.
fn sweep(world: &World, grid: &SpatialGrid, entity: Entity, dt: f32, config: &SimConfig) -> Option<SweepHit> {
    let projectile = world.get::<Projectile>(entity)?;
    if projectile.is_spent() {
        return None;
    }
    let position = world.get::<Position>(entity)?.as_tuple();
    let velocity = *world.get::<Velocity>(entity)?;

    let speed = velocity.magnitude();
    if speed < config.min_raycast_velocity {
        return None;
    }
    let distance = speed * dt;
    if distance <= 0.0 {
        trace!(?entity, "zero-length sweep skipped");
        return None;
    }
    let dir = velocity.normalized();

    let shooter = projectile.shooter.filter(|_| projectile.ignore_shooter);
    grid.raycast(position, (dir.vx, dir.vy), distance, config.raycast_mask)
        .into_iter()
        .filter(|hit| hit.entity != entity && Some(hit.entity) != shooter)
        .map(|hit| CandidateCollision {
            projectile: entity,
            other: hit.entity,
            contact_point: hit.point,
            relative_velocity: (velocity.vx, velocity.vy),
            kind: ContactKind::Sweep {
                hit_point: hit.point,
                distance: hit.distance,
            },
        })
        .find(|contact| filter_contact(world, contact).is_none())
        .map(|contact| SweepHit { contact, velocity })
}

/// Sweep all fast projectiles and resolve their nearest hits.
///
/// The projectile is snapped to the hit point and stopped before resolution.
/// If it survives the hit with its course unchanged, its velocity is restored.
pub fn raycast_sweep_system(world: &mut World) {
    let dt = world.get_resource::<DeltaTime>().map(|d| d.0).unwrap_or(0.0);
    let config = world.get_resource::<SimConfig>().cloned().unwrap_or_default();

    let mut query = world.query_filtered::<Entity, (With<Projectile>, With<Velocity>)>();
    let hits: Vec<SweepHit> = {
        let world: &World = world;
        let Some(grid) = world.get_resource::<SpatialGrid>() else {
            return;
        };
        query
            .iter(world)
            .filter_map(|entity| sweep(world, grid, entity, dt, &config))
            .collect()
    };

    for hit in hits {
        let projectile = hit.contact.projectile;
        let ContactKind::Sweep { hit_point, .. } = hit.contact.kind else {
            continue;
        };
        if let Some(mut position) = world.get_mut::<Position>(projectile) {
            position.x = hit_point.0;
            position.y = hit_point.1;
        }
        if let Some(mut velocity) = world.get_mut::<Velocity>(projectile) {
            velocity.zero();
        }

        // The swept pair counts as touching; overlap detection after movement
        // must not resolve the same crossing again.
        world
            .get_resource_or_insert_with(ActiveContacts::default)
            .record(projectile, hit.contact.other);

        let outcome = match on_candidate_collision(world, hit.contact) {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(?projectile, %err, "sweep contact skipped");
                restore_velocity(world, projectile, hit.velocity);
                continue;
            }
        };
        trace!(?projectile, other = ?hit.contact.other, ?outcome, "sweep hit");

        match outcome {
            ContactOutcome::Resolved(HitOutcome::Reflected { .. }) => {}
            _ => restore_velocity(world, projectile, hit.velocity),
        }
    }
}

/// Give a still-flying projectile its velocity back.
fn restore_velocity(world: &mut World, projectile: Entity, velocity: Velocity) {
    let flying = world
        .get::<Projectile>(projectile)
        .is_some_and(|p| !p.is_spent());
    if !flying {
        return;
    }
    if let Some(mut current) = world.get_mut::<Velocity>(projectile) {
        if current.magnitude() == 0.0 {
            *current = velocity;
        }
    }
}
