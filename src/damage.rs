//! Typed damage payloads and the damage pipeline.
//!
//! Damage is a mapping from [`DamageKind`] to magnitude. Targets carry a
//! [`Damageable`] accumulator with resistances, and optionally a
//! [`Destructible`] threshold used by penetration to work out how much damage
//! is still needed to destroy them.

use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Damage categories understood by resistances and penetration filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DamageKind {
    Blunt,
    Piercing,
    Slash,
    Heat,
    Cold,
    Shock,
    Radiation,
    Structural,
}

/// A damage payload: kind -> magnitude.
///
/// Backed by a `BTreeMap` so iteration order (and therefore totals and
/// serialized output) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DamageSpecifier {
    pub values: BTreeMap<DamageKind, f32>,
}

impl DamageSpecifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload with a single damage kind.
    pub fn single(kind: DamageKind, amount: f32) -> Self {
        Self::new().with(kind, amount)
    }

    /// Builder-style addition of one kind.
    pub fn with(mut self, kind: DamageKind, amount: f32) -> Self {
        *self.values.entry(kind).or_insert(0.0) += amount;
        self
    }

    pub fn get(&self, kind: DamageKind) -> f32 {
        self.values.get(&kind).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f32 {
        self.values.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(|v| *v == 0.0)
    }

    /// True if any single kind carries a positive amount.
    pub fn any_positive(&self) -> bool {
        self.values.values().any(|v| *v > 0.0)
    }

    /// True if the payload deals a positive amount of `kind`.
    pub fn has_kind(&self, kind: DamageKind) -> bool {
        self.get(kind) > 0.0
    }

    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            values: self.values.iter().map(|(k, v)| (*k, v * factor)).collect(),
        }
    }

    /// Add `other` into this payload, never letting a kind drop below zero.
    pub fn accumulate(&mut self, other: &DamageSpecifier) {
        for (kind, amount) in &other.values {
            let entry = self.values.entry(*kind).or_insert(0.0);
            *entry = (*entry + amount).max(0.0);
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Per-kind resistances: multiplicative coefficient then flat reduction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DamageModifierSet {
    pub coefficients: BTreeMap<DamageKind, f32>,
    pub flat_reduction: BTreeMap<DamageKind, f32>,
}

impl DamageModifierSet {
    pub fn with_coefficient(mut self, kind: DamageKind, coefficient: f32) -> Self {
        self.coefficients.insert(kind, coefficient);
        self
    }

    pub fn with_flat_reduction(mut self, kind: DamageKind, amount: f32) -> Self {
        self.flat_reduction.insert(kind, amount);
        self
    }

    /// Apply resistances to an incoming payload.
    pub fn apply(&self, incoming: &DamageSpecifier) -> DamageSpecifier {
        let mut out = DamageSpecifier::new();
        for (kind, amount) in &incoming.values {
            let mut value = *amount;
            if value > 0.0 {
                if let Some(coefficient) = self.coefficients.get(kind) {
                    value *= coefficient;
                }
                if let Some(flat) = self.flat_reduction.get(kind) {
                    value = (value - flat).max(0.0);
                }
            }
            out.values.insert(*kind, value);
        }
        out
    }
}

/// Accumulated damage on an entity.
#[derive(Component, Debug, Clone, Default, Serialize, Deserialize)]
pub struct Damageable {
    pub damage: DamageSpecifier,
    pub modifiers: DamageModifierSet,
}

impl Damageable {
    pub fn with_modifiers(modifiers: DamageModifierSet) -> Self {
        Self {
            damage: DamageSpecifier::new(),
            modifiers,
        }
    }

    pub fn total(&self) -> f32 {
        self.damage.total()
    }
}

/// Damage total at which the entity is destroyed.
#[derive(Component, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Destructible {
    pub destroyed_at: f32,
}

impl Destructible {
    pub fn new(destroyed_at: f32) -> Self {
        Self { destroyed_at }
    }
}

/// Record of one application of damage, used by interceptors that may roll it back.
#[derive(Debug, Clone, PartialEq)]
pub struct DamageChange {
    pub target: Entity,
    /// Damage that actually landed after resistances.
    pub delta: DamageSpecifier,
    /// Accumulated damage before this change.
    pub previous: DamageSpecifier,
    /// Projectile or blast source responsible, if any.
    pub origin: Option<Entity>,
}

impl DamageChange {
    pub fn increased(&self) -> bool {
        self.delta.any_positive()
    }
}

/// Damage still needed to destroy `target`, measured before any new hit lands.
///
/// Targets without a [`Destructible`] threshold can never be destroyed, so the
/// remaining amount is effectively unbounded.
pub fn damage_to_destroy(world: &World, target: Entity) -> f32 {
    let Some(threshold) = world.get::<Destructible>(target) else {
        return f32::MAX;
    };
    let current = world.get::<Damageable>(target).map(|d| d.total()).unwrap_or(0.0);
    (threshold.destroyed_at - current).max(0.0)
}

/// Run `incoming` through the target's resistances and add it.
///
/// Returns `None` when the target has no [`Damageable`] (or no longer exists).
pub fn change_damage(
    world: &mut World,
    target: Entity,
    incoming: &DamageSpecifier,
    ignore_resistances: bool,
    origin: Option<Entity>,
) -> Option<DamageChange> {
    let mut damageable = world.get_mut::<Damageable>(target)?;
    let delta = if ignore_resistances {
        incoming.clone()
    } else {
        damageable.modifiers.apply(incoming)
    };
    let previous = damageable.damage.clone();
    damageable.damage.accumulate(&delta);
    Some(DamageChange {
        target,
        delta,
        previous,
        origin,
    })
}

/// Overwrite accumulated damage. Used to roll back a change.
pub fn set_damage(world: &mut World, target: Entity, damage: DamageSpecifier) -> bool {
    match world.get_mut::<Damageable>(target) {
        Some(mut damageable) => {
            damageable.damage = damage;
            true
        }
        None => false,
    }
}
