//! Explosion system - blast damage to entities and grid tiles.
//!
//! Explosive projectiles detonate when spent or when their fuse runs out.
//! Detonations are queued and applied together once per tick, after
//! collision resolution.
//!
//! ## Data Access
//! - Reads: `Explosive`, `Position`, `Rotation`, `ExplosionImmune`, `GridShieldProtected`
//! - Writes: `Damageable`, `GridTiles`, `ExplosionQueue`

use crate::components::*;
use crate::damage::{change_damage, DamageKind, DamageSpecifier, Damageable};
use crate::events::{emit, ExplosionResistanceOverride};
use crate::systems::destruction::queue_deletion;
use crate::systems::movement::DeltaTime;
use crate::systems::negation;
use crate::tiles::{world_to_grid_local, GridTiles, TileChanged};
use bevy_ecs::prelude::*;
use std::collections::HashSet;
use tracing::{debug, trace};

/// A pending detonation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExplosionRequest {
    pub source: Entity,
    pub position: (f32, f32),
    pub radius: f32,
    pub intensity: f32,
}

/// Detonations waiting for this tick's explosion pass.
#[derive(Resource, Debug, Default)]
pub struct ExplosionQueue {
    pending: Vec<ExplosionRequest>,
    requested: HashSet<Entity>,
}

impl ExplosionQueue {
    /// Returns false if `request.source` already detonated.
    pub fn push(&mut self, request: ExplosionRequest) -> bool {
        if !self.requested.insert(request.source) {
            return false;
        }
        self.pending.push(request);
        true
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Sources still remembered as having detonated.
    pub fn detonated(&self) -> usize {
        self.requested.len()
    }

    fn take(&mut self) -> Vec<ExplosionRequest> {
        std::mem::take(&mut self.pending)
    }
}

/// Queue a detonation of `source` at its current position.
pub fn request_explosion(world: &mut World, source: Entity) -> bool {
    let Some(explosive) = world.get::<Explosive>(source).copied() else {
        return false;
    };
    let Some(position) = world.get::<Position>(source).map(|p| p.as_tuple()) else {
        return false;
    };
    world
        .get_resource_or_insert_with(ExplosionQueue::default)
        .push(ExplosionRequest {
            source,
            position,
            radius: explosive.radius,
            intensity: explosive.intensity,
        })
}

/// Blast payload at `falloff` (1 at the center, 0 at the edge).
pub fn blast_damage(intensity: f32, falloff: f32) -> DamageSpecifier {
    let amount = intensity * falloff * falloff;
    DamageSpecifier::new()
        .with(DamageKind::Blunt, amount * 0.5)
        .with(DamageKind::Heat, amount * 0.5)
}

/// System that counts down fuses and queues detonations.
pub fn explosive_fuse_system(
    dt: Res<DeltaTime>,
    mut queue: ResMut<ExplosionQueue>,
    mut query: Query<(Entity, &Position, &mut Explosive)>,
) {
    for (entity, pos, mut explosive) in query.iter_mut() {
        let Some(fuse) = explosive.fuse.as_mut() else {
            continue;
        };
        *fuse -= dt.0;
        if *fuse <= 0.0 {
            explosive.fuse = None;
            queue.push(ExplosionRequest {
                source: entity,
                position: pos.as_tuple(),
                radius: explosive.radius,
                intensity: explosive.intensity,
            });
        }
    }
}

/// Apply every queued detonation.
///
/// Sources deleted since the last pass are forgotten first; a despawned
/// entity can never be requested again.
pub fn explosion_system(world: &mut World) {
    let Some(mut queue) = world.remove_resource::<ExplosionQueue>() else {
        return;
    };
    queue.requested.retain(|source| world.entities().contains(*source));
    let requests = queue.take();
    world.insert_resource(queue);

    for request in requests {
        detonate(world, &request);
        queue_deletion(world, request.source);
    }
}

fn detonate(world: &mut World, request: &ExplosionRequest) {
    let coefficient = negation::before_explode(world, request.source);
    if coefficient == 0.0 || request.radius <= 0.0 {
        debug!(source = ?request.source, "explosion suppressed");
        return;
    }

    let center = Position::new(request.position.0, request.position.1);
    let mut query = world.query_filtered::<
        (Entity, &Position, Option<&ExplosionImmune>, Option<&GridShieldProtected>),
        With<Damageable>,
    >();
    let mut victims: Vec<(Entity, f32, bool)> = query
        .iter(world)
        .filter(|(entity, ..)| *entity != request.source)
        .filter_map(|(entity, pos, immune, shielded)| {
            let dist = pos.distance_to(&center);
            (dist <= request.radius).then_some((entity, dist, immune.is_some() || shielded.is_some()))
        })
        .collect();
    victims.sort_by_key(|(entity, _, _)| *entity);

    for (entity, dist, immune) in victims {
        if immune {
            emit(world, |events| {
                events.resistance_overrides.push(ExplosionResistanceOverride { entity, coefficient: 0.0 })
            });
            continue;
        }
        let falloff = 1.0 - dist / request.radius;
        let damage = blast_damage(request.intensity * coefficient, falloff);
        if let Some(change) = change_damage(world, entity, &damage, false, Some(request.source)) {
            negation::on_damage_changed(world, &change);
        }
    }

    let mut grids = world.query::<(Entity, &Position, Option<&Rotation>, &mut GridTiles)>();
    let mut changes: Vec<TileChanged> = Vec::new();
    for (grid, pos, rot, mut tiles) in grids.iter_mut(world) {
        let local = world_to_grid_local(request.position, pos.as_tuple(), rot.map(|r| r.0).unwrap_or(0.0));
        changes.extend(tiles.apply_blast(grid, local, request.radius, request.intensity * coefficient));
    }
    for change in &changes {
        negation::on_tile_changed(world, change);
    }

    trace!(source = ?request.source, tiles = changes.len(), "explosion applied");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CombatEventBuffer;
    use crate::systems::destruction::{deletion_system, DeletionQueue};
    use crate::tiles::TileType;

    fn blast_world() -> World {
        let mut world = World::new();
        world.insert_resource(DeltaTime(0.5));
        world.init_resource::<ExplosionQueue>();
        world.init_resource::<DeletionQueue>();
        world.init_resource::<CombatEventBuffer>();
        world
    }

    fn bomb(world: &mut World, fuse: Option<f32>) -> Entity {
        world
            .spawn((
                Position::new(0.0, 0.0),
                Explosive {
                    radius: 4.0,
                    intensity: 40.0,
                    fuse,
                },
            ))
            .id()
    }

    #[test]
    fn test_blast_falls_off_with_distance() {
        let mut world = blast_world();
        let source = bomb(&mut world, None);
        let near = world.spawn(TargetBundle::new(1.0, 0.0, 0.5, 1000.0)).id();
        let far = world.spawn(TargetBundle::new(3.0, 0.0, 0.5, 1000.0)).id();
        let outside = world.spawn(TargetBundle::new(9.0, 0.0, 0.5, 1000.0)).id();

        assert!(request_explosion(&mut world, source));
        assert!(!request_explosion(&mut world, source));
        explosion_system(&mut world);

        let near_total = world.get::<Damageable>(near).unwrap().total();
        let far_total = world.get::<Damageable>(far).unwrap().total();
        assert!((near_total - 40.0 * 0.75 * 0.75).abs() < 1e-3);
        assert!(far_total < near_total && far_total > 0.0);
        assert_eq!(world.get::<Damageable>(outside).unwrap().total(), 0.0);
        assert!(world.resource::<DeletionQueue>().contains(source));
    }

    #[test]
    fn test_immune_entities_get_override_instead_of_damage() {
        let mut world = blast_world();
        let source = bomb(&mut world, None);
        let crew = world
            .spawn((
                TargetBundle::new(1.0, 0.0, 0.5, 1000.0),
                ExplosionImmune { source_projectile: source },
            ))
            .id();

        request_explosion(&mut world, source);
        explosion_system(&mut world);

        assert_eq!(world.get::<Damageable>(crew).unwrap().total(), 0.0);
        let events = world.resource_mut::<CombatEventBuffer>().take();
        assert_eq!(events.resistance_overrides, vec![ExplosionResistanceOverride { entity: crew, coefficient: 0.0 }]);
    }

    #[test]
    fn test_grid_shield_marker_nullifies_blast() {
        let mut world = blast_world();
        let source = bomb(&mut world, None);
        let shielded = world
            .spawn((TargetBundle::new(1.0, 0.0, 0.5, 1000.0), GridShieldProtected))
            .id();
        let exposed = world.spawn(TargetBundle::new(-1.0, 0.0, 0.5, 1000.0)).id();

        request_explosion(&mut world, source);
        explosion_system(&mut world);

        assert_eq!(world.get::<Damageable>(shielded).unwrap().total(), 0.0);
        assert!(world.get::<Damageable>(exposed).unwrap().total() > 0.0);
        let events = world.resource_mut::<CombatEventBuffer>().take();
        assert_eq!(
            events.resistance_overrides,
            vec![ExplosionResistanceOverride { entity: shielded, coefficient: 0.0 }]
        );
    }

    #[test]
    fn test_fuse_detonates_and_degrades_tiles() {
        let mut world = blast_world();
        bomb(&mut world, Some(0.75));
        let grid = world
            .spawn((GridBundle::new(0.0, 0.0), GridTiles::new(8, 8, 1.0, TileType::Floor)))
            .id();

        let mut schedule = Schedule::default();
        schedule.add_systems((explosive_fuse_system, explosion_system).chain());
        schedule.run(&mut world);
        assert_eq!(world.get::<GridTiles>(grid).unwrap().get(4, 4), Some(TileType::Floor));

        schedule.run(&mut world);
        assert_eq!(world.get::<GridTiles>(grid).unwrap().get(4, 4), Some(TileType::Plating));
    }

    #[test]
    fn test_detonated_sources_are_forgotten_after_deletion() {
        let mut world = blast_world();
        let source = bomb(&mut world, None);

        request_explosion(&mut world, source);
        explosion_system(&mut world);
        assert_eq!(world.resource::<ExplosionQueue>().detonated(), 1);

        deletion_system(&mut world);
        assert!(!world.entities().contains(source));

        explosion_system(&mut world);
        let queue = world.resource::<ExplosionQueue>();
        assert_eq!(queue.detonated(), 0);
        assert!(queue.is_empty());
    }
}
