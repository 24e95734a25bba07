//! Effects a shield field applies to entities crossing it.
//!
//! Effects never touch the world directly. Each hook reads what it needs from
//! an [`Entrant`] or a [`FieldLookup`] and pushes [`EffectAction`]s that the
//! field engine applies on the main thread. The only state an effect owns is
//! its [`TrackedSet`], which is shared with collision workers and therefore
//! lock-protected.

use bevy_ecs::prelude::*;
use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

/// Thread-safe set of entities an effect is currently holding.
#[derive(Debug, Clone, Default)]
pub struct TrackedSet(Arc<RwLock<HashSet<Entity>>>);

impl TrackedSet {
    fn read(&self) -> RwLockReadGuard<'_, HashSet<Entity>> {
        self.0.read().unwrap_or_else(|poisoned| {
            warn!("tracked set lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashSet<Entity>> {
        self.0.write().unwrap_or_else(|poisoned| {
            warn!("tracked set lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Returns true if the entity was not already tracked.
    pub fn insert(&self, entity: Entity) -> bool {
        self.write().insert(entity)
    }

    pub fn remove(&self, entity: Entity) -> bool {
        self.write().remove(&entity)
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.read().contains(&entity)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Current members in a stable order.
    pub fn members(&self) -> Vec<Entity> {
        let mut members: Vec<Entity> = self.read().iter().copied().collect();
        members.sort();
        members
    }

    /// Remove and return every member in a stable order.
    pub fn drain(&self) -> Vec<Entity> {
        let mut members: Vec<Entity> = self.write().drain().collect();
        members.sort();
        members
    }
}

/// Facts about an entity entering a field, gathered by the engine.
#[derive(Debug, Clone, Copy)]
pub struct Entrant {
    pub entity: Entity,
    /// Live (non-spent) projectile.
    pub is_projectile: bool,
    /// Fired by a ship-mounted weapon.
    pub ship_projectile: bool,
    /// Fired from the grid that owns the field.
    pub same_origin: bool,
    pub damage_total: f32,
}

/// Mutation an effect asks the engine to perform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EffectAction {
    ScaleVelocity { entity: Entity, factor: f32 },
    Destroy(Entity),
    /// Add `damage * watt_per_impact` to the field's surge.
    Surge { damage: f32 },
}

/// Read-only view of the world an effect consults during updates.
pub trait FieldLookup {
    fn exists(&self, entity: Entity) -> bool;
    fn inside(&self, entity: Entity) -> bool;
}

/// What a speed-change effect does with a new entrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDecision {
    Ignore,
    Destroy,
    Track,
}

/// Tuning for the speed-change/phasing effect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedChangeRule {
    pub speed_modifier: f32,
    pub projectiles_only: bool,
    /// Suppress collisions for tracked entities.
    pub phasing: bool,
    /// Destroy qualifying entrants instead of slowing them.
    pub destroy_projectiles: bool,
}

impl Default for SpeedChangeRule {
    fn default() -> Self {
        Self {
            speed_modifier: 0.5,
            projectiles_only: true,
            phasing: true,
            destroy_projectiles: true,
        }
    }
}

impl SpeedChangeRule {
    /// Pure entry decision, shared by the engine and collision workers.
    pub fn decide(&self, entrant: &Entrant) -> EntryDecision {
        if self.projectiles_only && !(entrant.is_projectile && entrant.ship_projectile) {
            return EntryDecision::Ignore;
        }
        if entrant.same_origin {
            return EntryDecision::Ignore;
        }
        if self.destroy_projectiles {
            EntryDecision::Destroy
        } else {
            EntryDecision::Track
        }
    }

    fn restore_factor(&self) -> Option<f32> {
        if self.speed_modifier.abs() <= f32::EPSILON {
            None
        } else {
            Some(1.0 / self.speed_modifier)
        }
    }
}

/// Slows (and optionally phases) entities while they stay inside the field.
#[derive(Debug, Clone, Default)]
pub struct TempSpeedChangeEffect {
    pub rule: SpeedChangeRule,
    pub tracked: TrackedSet,
}

impl TempSpeedChangeEffect {
    /// Phasing slow-down that never destroys.
    pub fn phasing(speed_modifier: f32) -> Self {
        Self {
            rule: SpeedChangeRule {
                speed_modifier,
                projectiles_only: true,
                phasing: true,
                destroy_projectiles: false,
            },
            tracked: TrackedSet::default(),
        }
    }

    /// Track `entity` and emit the slow-down once.
    pub fn admit(&self, entity: Entity, out: &mut Vec<EffectAction>) {
        if self.tracked.insert(entity) {
            out.push(EffectAction::ScaleVelocity {
                entity,
                factor: self.rule.speed_modifier,
            });
        }
    }

    fn release(&self, entity: Entity, out: &mut Vec<EffectAction>) {
        if self.tracked.remove(entity) {
            if let Some(factor) = self.rule.restore_factor() {
                out.push(EffectAction::ScaleVelocity { entity, factor });
            }
        }
    }

    pub fn is_phasing(&self, entity: Entity) -> bool {
        self.rule.phasing && self.tracked.contains(entity)
    }
}

/// Temporary power spike on foreign ship-weapon impacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct DamageSurgeEffect;

/// Outright deletion of foreign entrants.
#[derive(Debug, Clone, Copy)]
pub struct DestroyOnEntryEffect {
    pub projectiles_only: bool,
}

impl Default for DestroyOnEntryEffect {
    fn default() -> Self {
        Self { projectiles_only: true }
    }
}

/// Effect attached to a field. Dispatch is a plain match over variants.
#[derive(Debug, Clone)]
pub enum ShieldEffect {
    TempSpeedChange(TempSpeedChangeEffect),
    DamageSurge(DamageSurgeEffect),
    DestroyOnEntry(DestroyOnEntryEffect),
}

impl ShieldEffect {
    pub fn on_init(&mut self) {
        if let ShieldEffect::TempSpeedChange(effect) = self {
            effect.tracked.drain();
        }
    }

    pub fn on_enter(&mut self, entrant: &Entrant, out: &mut Vec<EffectAction>) {
        match self {
            ShieldEffect::TempSpeedChange(effect) => match effect.rule.decide(entrant) {
                EntryDecision::Ignore => {}
                EntryDecision::Destroy => out.push(EffectAction::Destroy(entrant.entity)),
                EntryDecision::Track => effect.admit(entrant.entity, out),
            },
            ShieldEffect::DamageSurge(_) => {
                if entrant.is_projectile && entrant.ship_projectile && !entrant.same_origin {
                    out.push(EffectAction::Surge {
                        damage: entrant.damage_total,
                    });
                }
            }
            ShieldEffect::DestroyOnEntry(effect) => {
                let qualifies = !effect.projectiles_only || (entrant.is_projectile && entrant.ship_projectile);
                if qualifies && !entrant.same_origin {
                    out.push(EffectAction::Destroy(entrant.entity));
                }
            }
        }
    }

    pub fn on_update(&mut self, lookup: &dyn FieldLookup, out: &mut Vec<EffectAction>) {
        if let ShieldEffect::TempSpeedChange(effect) = self {
            for entity in effect.tracked.members() {
                if !lookup.exists(entity) {
                    effect.tracked.remove(entity);
                } else if !lookup.inside(entity) {
                    effect.release(entity, out);
                }
            }
        }
    }

    /// Release all per-entity tracking.
    pub fn on_shutdown(&mut self, out: &mut Vec<EffectAction>) {
        if let ShieldEffect::TempSpeedChange(effect) = self {
            let restore = effect.rule.restore_factor();
            for entity in effect.tracked.drain() {
                if let Some(factor) = restore {
                    out.push(EffectAction::ScaleVelocity { entity, factor });
                }
            }
        }
    }

    pub fn as_speed_change(&self) -> Option<&TempSpeedChangeEffect> {
        match self {
            ShieldEffect::TempSpeedChange(effect) => Some(effect),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubLookup {
        alive: HashSet<Entity>,
        inside: HashSet<Entity>,
    }

    impl FieldLookup for StubLookup {
        fn exists(&self, entity: Entity) -> bool {
            self.alive.contains(&entity)
        }
        fn inside(&self, entity: Entity) -> bool {
            self.inside.contains(&entity)
        }
    }

    fn foreign(entity: Entity) -> Entrant {
        Entrant {
            entity,
            is_projectile: true,
            ship_projectile: true,
            same_origin: false,
            damage_total: 20.0,
        }
    }

    #[test]
    fn test_same_origin_is_exempt() {
        let e = Entity::from_raw(7);
        let rule = SpeedChangeRule {
            destroy_projectiles: false,
            ..Default::default()
        };
        assert_eq!(rule.decide(&foreign(e)), EntryDecision::Track);
        let own = Entrant { same_origin: true, ..foreign(e) };
        assert_eq!(rule.decide(&own), EntryDecision::Ignore);
        let stray = Entrant { ship_projectile: false, ..foreign(e) };
        assert_eq!(rule.decide(&stray), EntryDecision::Ignore);
    }

    #[test]
    fn test_enter_then_exit_restores_factor() {
        let e = Entity::from_raw(3);
        let mut effect = ShieldEffect::TempSpeedChange(TempSpeedChangeEffect::phasing(0.25));

        let mut out = Vec::new();
        effect.on_enter(&foreign(e), &mut out);
        // A repeated entry does not slow twice.
        effect.on_enter(&foreign(e), &mut out);
        assert_eq!(out, vec![EffectAction::ScaleVelocity { entity: e, factor: 0.25 }]);

        let mut lookup = StubLookup {
            alive: HashSet::from([e]),
            inside: HashSet::from([e]),
        };
        out.clear();
        effect.on_update(&lookup, &mut out);
        assert!(out.is_empty());

        lookup.inside.clear();
        effect.on_update(&lookup, &mut out);
        assert_eq!(out, vec![EffectAction::ScaleVelocity { entity: e, factor: 4.0 }]);
        assert!(effect.as_speed_change().unwrap().tracked.is_empty());
    }

    #[test]
    fn test_update_forgets_deleted_entities() {
        let e = Entity::from_raw(9);
        let mut effect = ShieldEffect::TempSpeedChange(TempSpeedChangeEffect::phasing(0.5));
        let mut out = Vec::new();
        effect.on_enter(&foreign(e), &mut out);

        let lookup = StubLookup {
            alive: HashSet::new(),
            inside: HashSet::new(),
        };
        out.clear();
        effect.on_update(&lookup, &mut out);
        assert!(out.is_empty());
        assert!(effect.as_speed_change().unwrap().tracked.is_empty());
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let a = Entity::from_raw(1);
        let b = Entity::from_raw(2);
        let mut effect = ShieldEffect::TempSpeedChange(TempSpeedChangeEffect::phasing(0.5));
        let mut out = Vec::new();
        effect.on_enter(&foreign(a), &mut out);
        effect.on_enter(&foreign(b), &mut out);

        out.clear();
        effect.on_shutdown(&mut out);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|a| matches!(a, EffectAction::ScaleVelocity { factor, .. } if *factor == 2.0)));
        assert!(effect.as_speed_change().unwrap().tracked.is_empty());
    }

    #[test]
    fn test_surge_and_destroy_skip_own_grid() {
        let e = Entity::from_raw(4);
        let mut surge = ShieldEffect::DamageSurge(DamageSurgeEffect);
        let mut destroy = ShieldEffect::DestroyOnEntry(DestroyOnEntryEffect::default());
        let mut out = Vec::new();

        let own = Entrant { same_origin: true, ..foreign(e) };
        surge.on_enter(&own, &mut out);
        destroy.on_enter(&own, &mut out);
        assert!(out.is_empty());

        surge.on_enter(&foreign(e), &mut out);
        destroy.on_enter(&foreign(e), &mut out);
        assert_eq!(out, vec![EffectAction::Surge { damage: 20.0 }, EffectAction::Destroy(e)]);
    }
}
