//! Typed messages exchanged with the host.
//!
//! Consumed signals arrive through `CombatSim` methods; produced signals are
//! collected in [`CombatEventBuffer`] and drained by the host once per frame.

use crate::components::{EmbeddableProjectile, Explosive, Projectile};
use crate::damage::DamageSpecifier;
use bevy_ecs::prelude::*;
use serde::Serialize;

/// How a candidate collision was detected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContactKind {
    /// Narrow-phase overlap began this tick.
    Discrete,
    /// Found by the high-velocity sweep at this point along the ray.
    Sweep { hit_point: (f32, f32), distance: f32 },
}

/// Two bodies began touching; not yet a resolved hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateCollision {
    pub projectile: Entity,
    pub other: Entity,
    pub contact_point: (f32, f32),
    pub relative_velocity: (f32, f32),
    pub kind: ContactKind,
}

impl CandidateCollision {
    pub fn discrete(projectile: Entity, other: Entity, contact_point: (f32, f32), relative_velocity: (f32, f32)) -> Self {
        Self {
            projectile,
            other,
            contact_point,
            relative_velocity,
            kind: ContactKind::Discrete,
        }
    }
}

/// Damage landed on a target.
#[derive(Debug, Clone, PartialEq)]
pub struct HitResolved {
    pub projectile: Entity,
    pub target: Entity,
    pub shooter: Option<Entity>,
    pub damage: DamageSpecifier,
}

/// Visual effect to broadcast to observers near a location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpactEffect {
    pub prototype: String,
    pub x: f32,
    pub y: f32,
}

/// Impact sound/flash on the target.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpactFeedback {
    pub target: Entity,
    pub sound: Option<String>,
    pub damage_total: f32,
}

/// Directional recoil applied to the target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetKicked {
    pub target: Entity,
    pub direction: (f32, f32),
}

/// Explosion damage coefficient forced for a protected entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExplosionResistanceOverride {
    pub entity: Entity,
    pub coefficient: f32,
}

/// An entity was embedded into, or released from, a target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmbedChanged {
    pub projectile: Entity,
    pub target: Entity,
    pub embedded: bool,
}

/// Produced signals accumulated since the last drain.
#[derive(Debug, Clone, Default)]
pub struct CombatEvents {
    pub hits: Vec<HitResolved>,
    pub impacts: Vec<ImpactEffect>,
    pub feedback: Vec<ImpactFeedback>,
    pub kicks: Vec<TargetKicked>,
    pub resistance_overrides: Vec<ExplosionResistanceOverride>,
    pub embeds: Vec<EmbedChanged>,
}

impl CombatEvents {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
            && self.impacts.is_empty()
            && self.feedback.is_empty()
            && self.kicks.is_empty()
            && self.resistance_overrides.is_empty()
            && self.embeds.is_empty()
    }
}

/// Resource collecting produced signals for the host.
#[derive(Resource, Default)]
pub struct CombatEventBuffer {
    pub events: CombatEvents,
}

impl CombatEventBuffer {
    pub fn take(&mut self) -> CombatEvents {
        std::mem::take(&mut self.events)
    }

    pub fn clear(&mut self) {
        self.events = CombatEvents::default();
    }
}

/// Push into the buffer if it exists.
pub(crate) fn emit(world: &mut World, f: impl FnOnce(&mut CombatEvents)) {
    if let Some(mut buffer) = world.get_resource_mut::<CombatEventBuffer>() {
        f(&mut buffer.events);
    }
}

/// Follow-up behavior a resolved hit triggers, picked from the projectile's
/// capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitHandler {
    /// Damage, penetration and feedback. Every projectile has this.
    Damage,
    /// Stick into the target.
    Embed,
    /// Detonate once spent.
    Explode,
}

impl HitHandler {
    /// Handlers for `projectile`, in dispatch order.
    pub fn for_entity(world: &World, projectile: Entity) -> Vec<HitHandler> {
        let mut handlers = Vec::with_capacity(3);
        if world.get::<Projectile>(projectile).is_some() {
            handlers.push(HitHandler::Damage);
        }
        if world.get::<EmbeddableProjectile>(projectile).is_some() {
            handlers.push(HitHandler::Embed);
        }
        if world.get::<Explosive>(projectile).is_some() {
            handlers.push(HitHandler::Explode);
        }
        handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damage::{DamageKind, DamageSpecifier};

    #[test]
    fn test_handlers_follow_capabilities() {
        let mut world = World::new();
        let plain = world
            .spawn(Projectile::new(DamageSpecifier::single(DamageKind::Piercing, 5.0)))
            .id();
        let dart = world
            .spawn((
                Projectile::new(DamageSpecifier::default()),
                EmbeddableProjectile::default(),
            ))
            .id();
        let shell = world
            .spawn((
                Projectile::new(DamageSpecifier::default()),
                Explosive { radius: 3.0, intensity: 10.0, fuse: None },
            ))
            .id();

        assert_eq!(HitHandler::for_entity(&world, plain), vec![HitHandler::Damage]);
        assert_eq!(HitHandler::for_entity(&world, dart), vec![HitHandler::Damage, HitHandler::Embed]);
        assert_eq!(HitHandler::for_entity(&world, shell), vec![HitHandler::Damage, HitHandler::Explode]);
    }

    #[test]
    fn test_buffer_take_empties() {
        let mut world = World::new();
        world.init_resource::<CombatEventBuffer>();
        emit(&mut world, |events| {
            events.impacts.push(ImpactEffect { prototype: "spark".into(), x: 1.0, y: 2.0 })
        });
        let taken = world.resource_mut::<CombatEventBuffer>().take();
        assert_eq!(taken.impacts.len(), 1);
        assert!(world.resource::<CombatEventBuffer>().events.is_empty());
    }
}
