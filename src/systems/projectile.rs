//! Projectile lifecycle - hit resolution, penetration and termination.
//!
//! [`resolve_hit`] is the single place a contact turns into damage. Both the
//! immediate path and the batch drain call it on the main thread, after the
//! shield check has had a chance to cancel the contact.
//!
//! ## Penetration
//!
//! Damage still needed to destroy the target is measured before the hit
//! lands. A hit that deals less than that "tanks" the projectile. Otherwise
//! the projectile pays that amount toward its penetration threshold and
//! keeps flying until the threshold is reached. A zero threshold spends the
//! projectile on its first hit.

use crate::components::*;
use crate::damage::{change_damage, damage_to_destroy, DamageChange, DamageSpecifier};
use crate::error::{ensure_exists, CombatResult};
use crate::events::{
    emit, CandidateCollision, ContactKind, HitHandler, HitResolved, ImpactEffect, ImpactFeedback, TargetKicked,
};
use crate::systems::destruction::{is_doomed, queue_deletion};
use crate::systems::embedding::embed_attach;
use crate::systems::explosion::request_explosion;
use crate::systems::movement::DeltaTime;
use crate::systems::negation;
use crate::systems::performance::SimConfig;
use bevy_ecs::prelude::*;
use std::f32::consts::PI;
use tracing::{debug, trace};

/// What happened when a contact was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum HitOutcome {
    /// Projectile was already spent, or nothing to do.
    Ignored,
    /// The target bounced the projectile and now owns it.
    Reflected { by: Entity },
    Hit(HitReport),
}

/// Details of a resolved hit.
#[derive(Debug, Clone, PartialEq)]
pub struct HitReport {
    pub target: Entity,
    /// Damage that landed after resistances, if the target is damageable.
    pub damage: Option<DamageSpecifier>,
    pub spent: bool,
    pub penetration: f32,
    /// Same-origin negation zeroed or rolled back the hit.
    pub negated: bool,
}

/// Per-hit penetration decision.
///
/// `required_types` lists damage kinds the landed damage must carry to keep
/// penetrating. Returns true if the projectile is spent.
pub fn apply_penetration(projectile: &mut Projectile, landed: Option<&DamageSpecifier>, damage_required: f32) -> bool {
    let Some(landed) = landed.filter(|_| projectile.penetration_threshold != 0.0) else {
        projectile.mark_spent();
        return true;
    };

    let mut spent = false;
    if let Some(required) = &projectile.penetration_damage_types {
        if required.iter().any(|kind| !landed.values.contains_key(kind)) {
            spent = true;
        }
    }
    if landed.total() < damage_required {
        spent = true;
    }
    if !spent {
        projectile.add_penetration(damage_required);
        if projectile.penetration() >= projectile.penetration_threshold {
            spent = true;
        }
    }

    if spent {
        projectile.mark_spent();
    }
    spent
}

/// Turn a contact into a hit.
///
/// Assumes the contact already passed the filter and shield check.
pub fn resolve_hit(world: &mut World, contact: &CandidateCollision) -> CombatResult<HitOutcome> {
    let (projectile_id, target) = (contact.projectile, contact.other);
    ensure_exists(world, projectile_id)?;
    ensure_exists(world, target)?;

    let Some(projectile) = world.get::<Projectile>(projectile_id).cloned() else {
        return Ok(HitOutcome::Ignored);
    };
    if projectile.is_spent() {
        return Ok(HitOutcome::Ignored);
    }

    let universal = world
        .get_resource::<SimConfig>()
        .map(|c| c.universal_projectile_damage_modifier)
        .unwrap_or(1.0);
    let mut payload = projectile.damage.scaled(universal);

    let velocity = world.get::<Velocity>(projectile_id).copied().unwrap_or_default();
    let travel = match contact.kind {
        ContactKind::Sweep { .. } => Velocity::new(contact.relative_velocity.0, contact.relative_velocity.1),
        ContactKind::Discrete => velocity,
    };

    if let Some(reflective) = world.get::<Reflective>(target) {
        if reflective.accepts(&payload) {
            if let Some(outcome) = reflect(world, projectile_id, target, contact, travel) {
                return Ok(outcome);
            }
        }
    }

    let negated_hit = negation::on_projectile_hit(world, projectile_id, target, &mut payload);
    let damage_required = damage_to_destroy(world, target);

    let change: Option<DamageChange> = change_damage(
        world,
        target,
        &payload,
        projectile.ignore_resistances,
        Some(projectile_id),
    );
    let rolled_back = change
        .as_ref()
        .is_some_and(|change| negation::on_damage_changed(world, change));
    let landed = change.map(|change| change.delta);

    let (spent, penetration, delete_on_collide) = match world.get_mut::<Projectile>(projectile_id) {
        Some(mut p) => {
            let spent = apply_penetration(&mut p, landed.as_ref(), damage_required);
            (spent, p.penetration(), p.delete_on_collide)
        }
        None => (true, projectile.penetration(), projectile.delete_on_collide),
    };

    let target_alive = !is_doomed(world, target);
    if target_alive {
        let damage_total = landed.as_ref().map(|d| d.total()).unwrap_or(0.0);
        let positive = landed.as_ref().is_some_and(|d| d.any_positive());
        let sound = projectile.sound_hit.clone();
        let kick = travel.normalized();
        emit(world, |events| {
            if positive || projectile.force_sound {
                events.feedback.push(ImpactFeedback {
                    target,
                    sound,
                    damage_total,
                });
            }
            if kick.magnitude() > 0.0 {
                events.kicks.push(TargetKicked {
                    target,
                    direction: (kick.vx, kick.vy),
                });
            }
        });
    }

    if let Some(landed) = landed.as_ref().filter(|d| d.any_positive()) {
        let shooter = projectile.shooter.filter(|s| world.entities().contains(*s));
        let damage = landed.clone();
        emit(world, |events| {
            events.hits.push(HitResolved {
                projectile: projectile_id,
                target,
                shooter,
                damage,
            })
        });
    }

    if let Some(prototype) = projectile.impact_effect.clone() {
        let at = world
            .get::<Position>(projectile_id)
            .map(|p| p.as_tuple())
            .unwrap_or(contact.contact_point);
        emit(world, |events| {
            events.impacts.push(ImpactEffect {
                prototype,
                x: at.0,
                y: at.1,
            })
        });
    }

    if spent && delete_on_collide {
        queue_deletion(world, projectile_id);
    }

    for handler in HitHandler::for_entity(world, projectile_id) {
        match handler {
            HitHandler::Damage => {}
            HitHandler::Embed => {
                if !is_doomed(world, projectile_id) && !is_doomed(world, target) {
                    if let Err(err) = embed_attach(world, projectile_id, target) {
                        debug!(projectile = ?projectile_id, %err, "embed skipped");
                    }
                }
            }
            HitHandler::Explode => {
                if spent {
                    request_explosion(world, projectile_id);
                }
            }
        }
    }

    trace!(
        projectile = ?projectile_id,
        ?target,
        spent,
        penetration,
        "hit resolved"
    );

    Ok(HitOutcome::Hit(HitReport {
        target,
        damage: landed,
        spent,
        penetration,
        negated: negated_hit || rolled_back,
    }))
}

/// Hand the projectile to `by`. Sweep reflections also reverse its flight.
fn reflect(
    world: &mut World,
    projectile: Entity,
    by: Entity,
    contact: &CandidateCollision,
    travel: Velocity,
) -> Option<HitOutcome> {
    let accepted = world
        .get_mut::<Projectile>(projectile)
        .map(|mut p| p.reflect(by))
        .unwrap_or(false);
    if !accepted {
        return None;
    }

    if matches!(contact.kind, ContactKind::Sweep { .. }) {
        if let Some(mut velocity) = world.get_mut::<Velocity>(projectile) {
            *velocity = travel.reversed();
        }
        if let Some(mut rotation) = world.get_mut::<Rotation>(projectile) {
            rotation.0 = travel.vy.atan2(travel.vx) + PI;
        }
    }
    debug!(?projectile, ?by, "projectile reflected");
    Some(HitOutcome::Reflected { by })
}

/// Count down projectile lifetimes and queue expired ones for deletion.
pub fn lifetime_system(
    dt: Res<DeltaTime>,
    mut queue: ResMut<crate::systems::destruction::DeletionQueue>,
    mut query: Query<(Entity, &mut Lifetime)>,
) {
    for (entity, mut lifetime) in query.iter_mut() {
        lifetime.remaining -= dt.0;
        if lifetime.remaining <= 0.0 && queue.push(entity) {
            trace!(?entity, "lifetime expired");
        }
    }
}
