//! Destruction system - threshold checks and deferred deletion.
//!
//! Nothing despawns mid-resolution. Hits, shields and negation queue entities
//! into [`DeletionQueue`]; `deletion_system` runs last in the tick, releases
//! anything embedded in the dying entities, shuts down their fields and grid
//! shield generators and only then despawns.

use crate::components::*;
use crate::damage::{Damageable, Destructible};
use crate::spatial::SpatialGrid;
use crate::systems::embedding::release_embedded;
use crate::systems::grid_shield::remove_generator;
use crate::systems::shield::shutdown_effects;
use bevy_ecs::prelude::*;
use std::collections::HashSet;
use tracing::{debug, trace};

/// Entities waiting to be despawned at the end of the tick.
#[derive(Resource, Debug, Default)]
pub struct DeletionQueue {
    pending: Vec<Entity>,
    queued: HashSet<Entity>,
}

impl DeletionQueue {
    /// Returns false if already queued.
    pub fn push(&mut self, entity: Entity) -> bool {
        if self.queued.insert(entity) {
            self.pending.push(entity);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.queued.contains(&entity)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn take(&mut self) -> Vec<Entity> {
        self.queued.clear();
        std::mem::take(&mut self.pending)
    }
}

/// Queue `entity` for deletion at the end of the tick.
pub fn queue_deletion(world: &mut World, entity: Entity) -> bool {
    world
        .get_resource_or_insert_with(DeletionQueue::default)
        .push(entity)
}

/// Whether `entity` is gone or about to be.
pub fn is_doomed(world: &World, entity: Entity) -> bool {
    !world.entities().contains(entity)
        || world
            .get_resource::<DeletionQueue>()
            .is_some_and(|queue| queue.contains(entity))
}

/// System that queues destructibles whose accumulated damage reached the threshold.
pub fn destroyed_check_system(
    mut queue: ResMut<DeletionQueue>,
    query: Query<(Entity, &Damageable, &Destructible), Changed<Damageable>>,
) {
    for (entity, damageable, destructible) in query.iter() {
        if damageable.total() >= destructible.destroyed_at && queue.push(entity) {
            debug!(?entity, total = damageable.total(), "destructible destroyed");
        }
    }
}

/// Despawn everything queued, releasing embedded entities and shutting
/// down fields first. Deletions triggered by the release run in the same pass.
pub fn deletion_system(world: &mut World) {
    loop {
        let batch: Vec<Entity> = match world.get_resource_mut::<DeletionQueue>() {
            Some(mut queue) if !queue.is_empty() => queue.take(),
            _ => break,
        };

        let alive: Vec<Entity> = batch
            .into_iter()
            .filter(|entity| world.entities().contains(*entity))
            .collect();

        let containers: Vec<Entity> = alive
            .iter()
            .copied()
            .filter(|entity| {
                world
                    .get::<EmbeddedContainer>(*entity)
                    .is_some_and(|container| !container.embedded.is_empty())
            })
            .collect();
        if !containers.is_empty() {
            release_embedded(world, &containers);
        }

        for entity in &alive {
            if world.get::<ShieldField>(*entity).is_some() {
                shutdown_effects(world, *entity);
            }
            if world.get::<GridShieldGenerator>(*entity).is_some() {
                remove_generator(world, *entity);
            }
            detach_from_container(world, *entity);
        }

        for entity in alive {
            if let Some(mut grid) = world.get_resource_mut::<SpatialGrid>() {
                grid.remove(entity);
            }
            if world.despawn(entity) {
                trace!(?entity, "despawned");
            }
        }
    }
}

/// Drop the back-reference a container holds to `entity`.
fn detach_from_container(world: &mut World, entity: Entity) {
    let Some(target) = world
        .get::<EmbeddableProjectile>(entity)
        .and_then(|embeddable| embeddable.embedded_into)
    else {
        return;
    };
    if let Some(mut container) = world.get_mut::<EmbeddedContainer>(target) {
        container.embedded.remove(&entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damage::{DamageKind, DamageSpecifier};

    #[test]
    fn test_threshold_queues_destruction() {
        let mut world = World::new();
        world.init_resource::<DeletionQueue>();
        let wall = world.spawn(TargetBundle::new(0.0, 0.0, 1.0, 30.0)).id();

        let mut schedule = Schedule::default();
        schedule.add_systems(destroyed_check_system);

        let hit = DamageSpecifier::single(DamageKind::Blunt, 20.0);
        world.get_mut::<Damageable>(wall).unwrap().damage.accumulate(&hit);
        schedule.run(&mut world);
        assert!(!world.resource::<DeletionQueue>().contains(wall));

        world.get_mut::<Damageable>(wall).unwrap().damage.accumulate(&hit);
        schedule.run(&mut world);
        assert!(world.resource::<DeletionQueue>().contains(wall));
    }

    #[test]
    fn test_deletion_despawns_once() {
        let mut world = World::new();
        let a = world.spawn(Position::default()).id();
        assert!(queue_deletion(&mut world, a));
        assert!(!queue_deletion(&mut world, a));
        assert!(is_doomed(&world, a));

        deletion_system(&mut world);
        assert!(!world.entities().contains(a));
        assert!(world.resource::<DeletionQueue>().is_empty());

        // Stale entries are ignored.
        queue_deletion(&mut world, a);
        deletion_system(&mut world);
    }

    #[test]
    fn test_deleting_embedded_entity_clears_container() {
        let mut world = World::new();
        let target = world.spawn(Position::default()).id();
        let dart = world
            .spawn((
                Position::default(),
                EmbeddableProjectile {
                    embedded_into: Some(target),
                    ..Default::default()
                },
            ))
            .id();
        world.entity_mut(target).insert(EmbeddedContainer {
            embedded: HashSet::from([dart]),
        });

        queue_deletion(&mut world, dart);
        deletion_system(&mut world);
        assert!(world.get::<EmbeddedContainer>(target).unwrap().embedded.is_empty());
    }
}
