//! Embedding - projectiles and thrown items that stick into targets.
//!
//! An embedded entity becomes a static body attached to its target at a
//! rotated offset. The target carries an [`EmbeddedContainer`] back-reference
//! so everything stuck in it can be released when it dies.
//!
//! ## Release Ordering
//!
//! When several containers die together, an embedded entity that itself hosts
//! other pending entities is released before them. Each pass releases every
//! entry with no pending host; a pass that makes no progress means a cycle, and
//! the remainder is forced through with a wider separation.

use crate::components::*;
use crate::error::{ensure_exists, CombatError, CombatResult};
use crate::events::{emit, EmbedChanged};
use crate::geometry::{length, rotate};
use crate::systems::destruction::{is_doomed, queue_deletion};
use crate::systems::movement::DeltaTime;
use crate::systems::performance::SimConfig;
use bevy_ecs::prelude::*;
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// Stick `entity` into `target`.
pub fn embed_attach(world: &mut World, entity: Entity, target: Entity) -> CombatResult<()> {
    ensure_exists(world, entity)?;
    ensure_exists(world, target)?;
    let embeddable = world
        .get::<EmbeddableProjectile>(entity)
        .cloned()
        .ok_or(CombatError::NotEmbeddable(entity))?;
    if embeddable.embedded_into == Some(target) {
        return Ok(());
    }

    let rotation = world.get::<Rotation>(entity).map(|r| r.0).unwrap_or(0.0);
    let mut position = world.get::<Position>(entity).copied().unwrap_or_default();
    if embeddable.offset != (0.0, 0.0) {
        let shift = rotate(embeddable.offset, rotation);
        position.x += shift.0;
        position.y += shift.1;
    }

    let parent_pos = world.get::<Position>(target).copied().unwrap_or_default();
    let parent_rot = world.get::<Rotation>(target).map(|r| r.0).unwrap_or(0.0);
    let local = rotate((position.x - parent_pos.x, position.y - parent_pos.y), -parent_rot);

    world.entity_mut(entity).insert((
        position,
        Velocity::default(),
        BodyKind::Static,
        AttachedTo {
            parent: target,
            offset: local,
        },
    ));
    if let Some(mut projectile) = world.get_mut::<Projectile>(entity) {
        projectile.state = ProjectileState::Embedded { target };
    }
    if let Some(mut embeddable) = world.get_mut::<EmbeddableProjectile>(entity) {
        embeddable.embedded_into = Some(target);
    }

    match world.get_mut::<EmbeddedContainer>(target) {
        Some(mut container) => {
            container.embedded.insert(entity);
        }
        None => {
            world.entity_mut(target).insert(EmbeddedContainer {
                embedded: HashSet::from([entity]),
            });
        }
    }

    trace!(?entity, ?target, "embedded");
    emit(world, |events| {
        events.embeds.push(EmbedChanged {
            projectile: entity,
            target,
            embedded: true,
        })
    });
    Ok(())
}

/// Pull `entity` out of whatever it is stuck in and return it to free flight.
///
/// Entities flagged delete-on-remove are queued for deletion instead.
pub fn embed_detach(world: &mut World, entity: Entity) -> CombatResult<()> {
    ensure_exists(world, entity)?;
    let embeddable = world
        .get::<EmbeddableProjectile>(entity)
        .cloned()
        .ok_or(CombatError::NotEmbeddable(entity))?;

    if embeddable.delete_on_remove {
        queue_deletion(world, entity);
        return Ok(());
    }

    if let Some(target) = embeddable.embedded_into {
        if let Some(mut container) = world.get_mut::<EmbeddedContainer>(target) {
            container.embedded.remove(&entity);
        }
        emit(world, |events| {
            events.embeds.push(EmbedChanged {
                projectile: entity,
                target,
                embedded: false,
            })
        });
    }

    let mut handle = world.entity_mut(entity);
    handle.remove::<(AttachedTo, EmbedRemoval)>();
    handle.insert(BodyKind::Dynamic);
    if let Some(mut embeddable) = handle.get_mut::<EmbeddableProjectile>() {
        embeddable.embedded_into = None;
    }
    if let Some(mut projectile) = handle.get_mut::<Projectile>() {
        projectile.reset_for_flight();
    }
    trace!(?entity, "released");
    Ok(())
}

/// A thrown item struck `target`. Returns whether it embedded.
pub fn on_throw_hit(world: &mut World, item: Entity, target: Entity) -> CombatResult<bool> {
    let embed_on_throw = world
        .get::<EmbeddableProjectile>(item)
        .map(|e| e.embed_on_throw)
        .ok_or(CombatError::NotEmbeddable(item))?;
    if !embed_on_throw {
        return Ok(false);
    }
    embed_attach(world, item, target)?;
    Ok(true)
}

/// Start the timed interaction that pulls an embedded entity out.
pub fn begin_embed_removal(world: &mut World, entity: Entity, user: Option<Entity>) -> CombatResult<()> {
    ensure_exists(world, entity)?;
    let embeddable = world
        .get::<EmbeddableProjectile>(entity)
        .ok_or(CombatError::NotEmbeddable(entity))?;
    let removal_time = embeddable.removal_time.ok_or(CombatError::Unremovable(entity))?;
    if embeddable.embedded_into.is_none() {
        return Err(CombatError::NotEmbeddable(entity));
    }

    world.entity_mut(entity).insert(EmbedRemoval {
        remaining: removal_time,
        user,
    });
    debug!(?entity, ?user, removal_time, "embed removal started");
    Ok(())
}

/// Count down removals and release the ones that finish.
pub fn embed_removal_system(world: &mut World) {
    let dt = world.get_resource::<DeltaTime>().map(|d| d.0).unwrap_or(0.0);

    let mut finished = Vec::new();
    let mut abandoned = Vec::new();
    let mut query = world.query::<(Entity, &mut EmbedRemoval, Option<&EmbeddableProjectile>)>();
    for (entity, mut removal, embeddable) in query.iter_mut(world) {
        if embeddable.and_then(|e| e.embedded_into).is_none() {
            abandoned.push(entity);
            continue;
        }
        removal.remaining -= dt;
        if removal.remaining <= 0.0 {
            finished.push(entity);
        }
    }

    for entity in abandoned {
        world.entity_mut(entity).remove::<EmbedRemoval>();
    }
    finished.sort();
    for entity in finished {
        if let Err(err) = embed_detach(world, entity) {
            debug!(?entity, %err, "embed removal dropped");
        }
    }
}

/// Outcome of releasing the contents of dying containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: usize,
    /// Entries pushed through after ordering stalled.
    pub forced: usize,
}

/// Release everything embedded in `containers`.
pub fn release_embedded(world: &mut World, containers: &[Entity]) -> ReleaseReport {
    let (offset, multiplier) = world
        .get_resource::<SimConfig>()
        .map(|c| (c.release_offset, c.release_cycle_multiplier))
        .unwrap_or((0.01, 5.0));

    let mut pending: Vec<(Entity, Entity)> = Vec::new();
    let mut seen = HashSet::new();
    for &container in containers {
        let Some(embedded) = world.get::<EmbeddedContainer>(container) else { continue };
        let mut children: Vec<Entity> = embedded.embedded.iter().copied().collect();
        children.sort();
        for child in children {
            if seen.insert(child) {
                pending.push((child, container));
            }
        }
    }

    let mut report = ReleaseReport::default();
    while !pending.is_empty() {
        let blocked: HashSet<Entity> = pending
            .iter()
            .filter_map(|(child, _)| world.get::<EmbeddedContainer>(*child))
            .flat_map(|container| container.embedded.iter().copied())
            .collect();

        let (ready, waiting): (Vec<_>, Vec<_>) = pending.into_iter().partition(|(child, _)| !blocked.contains(child));

        if ready.is_empty() {
            let err = CombatError::DependencyCycle {
                remaining: waiting.len(),
            };
            warn!(%err, "forcing embedded release");
            for (child, host) in waiting {
                release_one(world, child, host, offset * multiplier * (report.released + 1) as f32);
                report.released += 1;
                report.forced += 1;
            }
            break;
        }

        for (child, host) in ready {
            release_one(world, child, host, offset * (report.released + 1) as f32);
            report.released += 1;
        }
        pending = waiting;
    }

    if report.released > 0 {
        debug!(released = report.released, forced = report.forced, "released embedded entities");
    }
    report
}

fn release_one(world: &mut World, child: Entity, host: Entity, padding: f32) {
    if let Err(err) = embed_detach(world, child) {
        trace!(?child, %err, "skipping release");
        return;
    }
    if is_doomed(world, child) {
        return;
    }

    let host_pos = world.get::<Position>(host).copied().unwrap_or_default();
    if let Some(mut pos) = world.get_mut::<Position>(child) {
        let away = (pos.x - host_pos.x, pos.y - host_pos.y);
        let dist = length(away);
        let dir = if dist > f32::EPSILON {
            (away.0 / dist, away.1 / dist)
        } else {
            (1.0, 0.0)
        };
        pos.x += dir.0 * padding;
        pos.y += dir.1 * padding;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damage::{DamageKind, DamageSpecifier};
    use crate::events::CombatEventBuffer;
    use crate::systems::destruction::DeletionQueue;

    fn embed_world() -> World {
        let mut world = World::new();
        world.insert_resource(SimConfig::default());
        world.insert_resource(DeltaTime(1.0));
        world.init_resource::<CombatEventBuffer>();
        world.init_resource::<DeletionQueue>();
        world
    }

    fn spawn_dart(world: &mut World, x: f32, config: EmbeddableProjectile) -> Entity {
        let projectile = Projectile::new(DamageSpecifier::single(DamageKind::Piercing, 3.0));
        world
            .spawn((ProjectileBundle::new(projectile, x, 0.0, 10.0, 0.0), config))
            .id()
    }

    #[test]
    fn test_attach_then_timed_removal() {
        let mut world = embed_world();
        let target = world.spawn(TargetBundle::new(5.0, 0.0, 1.0, 100.0)).id();
        let dart = spawn_dart(
            &mut world,
            4.0,
            EmbeddableProjectile {
                offset: (0.5, 0.0),
                removal_time: Some(2.0),
                ..Default::default()
            },
        );

        embed_attach(&mut world, dart, target).unwrap();
        assert_eq!(*world.get::<BodyKind>(dart).unwrap(), BodyKind::Static);
        assert_eq!(world.get::<Velocity>(dart).unwrap().magnitude(), 0.0);
        assert!((world.get::<Position>(dart).unwrap().x - 4.5).abs() < 1e-4);
        assert!(world.get::<EmbeddedContainer>(target).unwrap().embedded.contains(&dart));
        assert!(world.get::<Projectile>(dart).unwrap().is_spent());

        begin_embed_removal(&mut world, dart, None).unwrap();
        embed_removal_system(&mut world);
        assert!(world.get::<AttachedTo>(dart).is_some());
        embed_removal_system(&mut world);

        assert!(world.get::<AttachedTo>(dart).is_none());
        assert_eq!(*world.get::<BodyKind>(dart).unwrap(), BodyKind::Dynamic);
        let projectile = world.get::<Projectile>(dart).unwrap();
        assert_eq!(projectile.state, ProjectileState::Flying);
        assert!(projectile.shooter.is_none());
        assert!(world.get::<EmbeddedContainer>(target).unwrap().embedded.is_empty());

        let events = world.resource_mut::<CombatEventBuffer>().take();
        assert_eq!(events.embeds.len(), 2);
        assert!(events.embeds[0].embedded && !events.embeds[1].embedded);
    }

    #[test]
    fn test_unremovable_and_not_embeddable() {
        let mut world = embed_world();
        let target = world.spawn(TargetBundle::new(5.0, 0.0, 1.0, 100.0)).id();
        let spike = spawn_dart(&mut world, 4.0, EmbeddableProjectile::default());
        let plain = world.spawn(Position::default()).id();

        embed_attach(&mut world, spike, target).unwrap();
        assert_eq!(begin_embed_removal(&mut world, spike, None), Err(CombatError::Unremovable(spike)));
        assert_eq!(embed_attach(&mut world, plain, target), Err(CombatError::NotEmbeddable(plain)));
    }

    #[test]
    fn test_throw_only_embeds_when_configured() {
        let mut world = embed_world();
        let target = world.spawn(TargetBundle::new(5.0, 0.0, 1.0, 100.0)).id();
        let knife = world
            .spawn((
                Position::new(4.0, 0.0),
                EmbeddableProjectile {
                    embed_on_throw: true,
                    ..Default::default()
                },
            ))
            .id();
        let brick = world
            .spawn((Position::new(4.0, 0.0), EmbeddableProjectile::default()))
            .id();

        assert_eq!(on_throw_hit(&mut world, knife, target), Ok(true));
        assert_eq!(on_throw_hit(&mut world, brick, target), Ok(false));
        assert_eq!(world.get::<EmbeddedContainer>(target).unwrap().embedded.len(), 1);
    }

    #[test]
    fn test_release_deletes_or_frees() {
        let mut world = embed_world();
        let target = world.spawn(TargetBundle::new(5.0, 0.0, 1.0, 100.0)).id();
        let keeper = spawn_dart(&mut world, 4.0, EmbeddableProjectile::default());
        let crumbler = spawn_dart(
            &mut world,
            6.0,
            EmbeddableProjectile {
                delete_on_remove: true,
                ..Default::default()
            },
        );
        embed_attach(&mut world, keeper, target).unwrap();
        embed_attach(&mut world, crumbler, target).unwrap();

        let report = release_embedded(&mut world, &[target]);
        assert_eq!(report.released, 2);
        assert_eq!(report.forced, 0);
        assert!(world.get::<AttachedTo>(keeper).is_none());
        assert!(world.resource::<DeletionQueue>().contains(crumbler));
        // Nudged away from the host.
        assert!(world.get::<Position>(keeper).unwrap().x < 4.0);
    }

    #[test]
    fn test_release_cycle_is_forced() {
        let mut world = embed_world();
        let host = world.spawn(Position::default()).id();
        let a = world
            .spawn((Position::new(1.0, 0.0), EmbeddableProjectile { embedded_into: Some(host), ..Default::default() }))
            .id();
        let b = world
            .spawn((Position::new(-1.0, 0.0), EmbeddableProjectile { embedded_into: Some(host), ..Default::default() }))
            .id();
        world.entity_mut(host).insert(EmbeddedContainer { embedded: HashSet::from([a, b]) });
        // Each hosts the other.
        world.entity_mut(a).insert(EmbeddedContainer { embedded: HashSet::from([b]) });
        world.entity_mut(b).insert(EmbeddedContainer { embedded: HashSet::from([a]) });

        let report = release_embedded(&mut world, &[host]);
        assert_eq!(report, ReleaseReport { released: 2, forced: 2 });
        assert!(world.get::<EmbeddableProjectile>(a).unwrap().embedded_into.is_none());
        assert!(world.get::<Position>(a).unwrap().x > 1.0);
    }

    #[test]
    fn test_release_orders_hosts_first() {
        let mut world = embed_world();
        let wall = world.spawn(Position::default()).id();
        let outer = world
            .spawn((Position::new(1.0, 0.0), EmbeddableProjectile { embedded_into: Some(wall), ..Default::default() }))
            .id();
        let inner = world
            .spawn((Position::new(2.0, 0.0), EmbeddableProjectile { embedded_into: Some(wall), ..Default::default() }))
            .id();
        world.entity_mut(wall).insert(EmbeddedContainer { embedded: HashSet::from([outer, inner]) });
        world.entity_mut(outer).insert(EmbeddedContainer { embedded: HashSet::from([inner]) });

        let report = release_embedded(&mut world, &[wall]);
        assert_eq!(report, ReleaseReport { released: 2, forced: 0 });
        // outer went first with the smaller separation.
        let outer_shift = world.get::<Position>(outer).unwrap().x - 1.0;
        let inner_shift = world.get::<Position>(inner).unwrap().x - 2.0;
        assert!(outer_shift < inner_shift);
    }
}
