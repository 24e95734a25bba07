//! ECS Components for the Aegis combat core.
//!
//! Components are pure data containers attached to entities.
//! All resolution logic lives in systems that query these components.

use crate::damage::{DamageKind, DamageSpecifier, Damageable, Destructible};
use crate::systems::shield_effects::ShieldEffect;
use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ============================================================================
// SPATIAL COMPONENTS
// ============================================================================

/// 2D world position.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn as_tuple(&self) -> (f32, f32) {
        (self.x, self.y)
    }
}

/// 2D linear velocity.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    pub vx: f32,
    pub vy: f32,
}

impl Velocity {
    pub fn new(vx: f32, vy: f32) -> Self {
        Self { vx, vy }
    }

    pub fn magnitude(&self) -> f32 {
        (self.vx * self.vx + self.vy * self.vy).sqrt()
    }

    pub fn normalized(&self) -> Self {
        let mag = self.magnitude();
        if mag < 0.0001 {
            Self::default()
        } else {
            Self {
                vx: self.vx / mag,
                vy: self.vy / mag,
            }
        }
    }

    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            vx: self.vx * factor,
            vy: self.vy * factor,
        }
    }

    pub fn reversed(&self) -> Self {
        self.scaled(-1.0)
    }

    pub fn zero(&mut self) {
        self.vx = 0.0;
        self.vy = 0.0;
    }
}

/// World rotation in radians.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rotation(pub f32);

// ============================================================================
// GRID / MAP COMPONENTS
// ============================================================================

/// A ship or station hull: a rigid body other entities are parented to.
#[derive(Component, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Grid {
    /// Physical center of mass in the grid's local frame.
    pub local_center_of_mass: (f32, f32),
}

/// The grid an entity currently sits on.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridMember(pub Entity);

/// Map (space) identifier. Entities on different maps never collide.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapId(pub u32);

// ============================================================================
// PHYSICS COMPONENTS
// ============================================================================

/// Collision layer bits.
pub mod layers {
    pub const IMPASSABLE: u32 = 1 << 0;
    pub const MOB: u32 = 1 << 1;
    pub const OPAQUE: u32 = 1 << 2;
    pub const SMALL: u32 = 1 << 3;
    pub const BULLET_IMPASSABLE: u32 = 1 << 4;

    /// Mask used by the high-velocity sweep.
    pub const RAYCAST_MASK: u32 = IMPASSABLE | MOB | OPAQUE;
}

/// How the physics layer integrates a body.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyKind {
    #[default]
    Dynamic,
    Static,
}

/// Circular collision shape.
#[derive(Component, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Collider {
    pub radius: f32,
    /// Soft colliders report contacts but never stop projectiles.
    pub hard: bool,
    pub layer: u32,
}

impl Collider {
    pub fn hard(radius: f32, layer: u32) -> Self {
        Self { radius, hard: true, layer }
    }

    pub fn soft(radius: f32, layer: u32) -> Self {
        Self { radius, hard: false, layer }
    }
}

impl Default for Collider {
    fn default() -> Self {
        Self::hard(0.5, layers::IMPASSABLE)
    }
}

/// Parent-relative placement; position follows the parent every tick.
#[derive(Component, Debug, Clone, Copy)]
pub struct AttachedTo {
    pub parent: Entity,
    pub offset: (f32, f32),
}

// ============================================================================
// PROJECTILE COMPONENTS
// ============================================================================

/// Where a projectile is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProjectileState {
    #[default]
    Flying,
    /// Redirected by a reflector, which is now the shooter.
    Reflected { by: Entity },
    /// Stuck in a target; no further hits.
    Embedded { target: Entity },
    /// Terminal; no further hits.
    Spent,
}

impl ProjectileState {
    pub fn is_spent(&self) -> bool {
        matches!(self, ProjectileState::Spent | ProjectileState::Embedded { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProjectileState::Flying => "Flying",
            ProjectileState::Reflected { .. } => "Reflected",
            ProjectileState::Embedded { .. } => "Embedded",
            ProjectileState::Spent => "Spent",
        }
    }
}

/// An in-flight kinetic projectile.
#[derive(Component, Debug, Clone)]
pub struct Projectile {
    pub damage: DamageSpecifier,
    /// Penetration needed before the projectile is spent. Zero means the
    /// first hit always spends it.
    pub penetration_threshold: f32,
    penetration: f32,
    /// Damage kinds the payload must carry to penetrate at all.
    pub penetration_damage_types: Option<Vec<DamageKind>>,
    pub state: ProjectileState,
    pub shooter: Option<Entity>,
    pub weapon: Option<Entity>,
    /// Grid the projectile was fired from.
    pub origin_grid: Option<Entity>,
    /// The entity the shooter aimed at, if any.
    pub intended_target: Option<Entity>,
    pub ignore_shooter: bool,
    pub ignore_resistances: bool,
    pub delete_on_collide: bool,
    pub only_collide_when_shot: bool,
    pub force_sound: bool,
    pub sound_hit: Option<String>,
    pub impact_effect: Option<String>,
}

impl Projectile {
    pub fn new(damage: DamageSpecifier) -> Self {
        Self {
            damage,
            penetration_threshold: 0.0,
            penetration: 0.0,
            penetration_damage_types: None,
            state: ProjectileState::Flying,
            shooter: None,
            weapon: None,
            origin_grid: None,
            intended_target: None,
            ignore_shooter: true,
            ignore_resistances: false,
            delete_on_collide: true,
            only_collide_when_shot: false,
            force_sound: false,
            sound_hit: None,
            impact_effect: None,
        }
    }

    pub fn with_penetration_threshold(mut self, threshold: f32) -> Self {
        self.penetration_threshold = threshold.max(0.0);
        self
    }

    pub fn with_shooter(mut self, shooter: Entity, weapon: Option<Entity>) -> Self {
        self.shooter = Some(shooter);
        self.weapon = weapon;
        self
    }

    pub fn with_origin_grid(mut self, grid: Entity) -> Self {
        self.origin_grid = Some(grid);
        self
    }

    pub fn with_impact_effect(mut self, prototype: impl Into<String>) -> Self {
        self.impact_effect = Some(prototype.into());
        self
    }

    /// Accumulated penetration paid so far.
    pub fn penetration(&self) -> f32 {
        self.penetration
    }

    /// Penetration only ever grows.
    pub fn add_penetration(&mut self, amount: f32) {
        if amount > 0.0 {
            self.penetration += amount;
        }
    }

    pub fn is_spent(&self) -> bool {
        self.state.is_spent()
    }

    pub fn mark_spent(&mut self) {
        if !matches!(self.state, ProjectileState::Embedded { .. }) {
            self.state = ProjectileState::Spent;
        }
    }

    /// Hand the projectile to its reflector. Returns false if `by` already owns it.
    pub fn reflect(&mut self, by: Entity) -> bool {
        if self.shooter == Some(by) {
            return false;
        }
        self.shooter = Some(by);
        self.state = ProjectileState::Reflected { by };
        true
    }

    /// Back to free flight with no owner.
    pub fn reset_for_flight(&mut self) {
        self.shooter = None;
        self.weapon = None;
        self.state = ProjectileState::Flying;
    }
}

/// Marker: fired by a ship-mounted weapon. Shields only act on these.
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct ShipWeaponProjectile;

/// Seconds until the entity is deleted.
#[derive(Component, Debug, Clone, Copy)]
pub struct Lifetime {
    pub remaining: f32,
}

/// Configuration for projectiles (or thrown items) that stick into targets.
#[derive(Component, Debug, Clone, Default)]
pub struct EmbeddableProjectile {
    /// Offset from the target, in the projectile's own frame.
    pub offset: (f32, f32),
    pub embed_on_throw: bool,
    /// Seconds needed to pull it out. `None` means it cannot be removed.
    pub removal_time: Option<f32>,
    pub delete_on_remove: bool,
    pub embedded_into: Option<Entity>,
}

/// Back-reference set on a target listing everything embedded in it.
#[derive(Component, Debug, Clone, Default)]
pub struct EmbeddedContainer {
    pub embedded: HashSet<Entity>,
}

/// In-progress timed removal of an embedded entity.
#[derive(Component, Debug, Clone, Copy)]
pub struct EmbedRemoval {
    pub remaining: f32,
    pub user: Option<Entity>,
}

/// Projectile (or blast source) that detonates.
#[derive(Component, Debug, Clone, Copy)]
pub struct Explosive {
    pub radius: f32,
    pub intensity: f32,
    /// Detonate after this many seconds even without a hit.
    pub fuse: Option<f32>,
}

/// Target that can bounce projectiles back.
#[derive(Component, Debug, Clone, Default)]
pub struct Reflective {
    pub active: bool,
    /// Damage kinds it reflects. Empty reflects everything.
    pub kinds: Vec<DamageKind>,
}

impl Reflective {
    pub fn accepts(&self, payload: &DamageSpecifier) -> bool {
        self.active && (self.kinds.is_empty() || self.kinds.iter().any(|k| payload.has_kind(*k)))
    }
}

/// Marker: a weapon operated remotely from a fire-control console.
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct RemoteControlled;

/// Incapacitated targets only stop projectiles aimed at them.
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct RequireProjectileTarget {
    pub active: bool,
}

/// Explosion damage coefficient is forced to zero while present.
#[derive(Component, Debug, Clone, Copy)]
pub struct ExplosionImmune {
    pub source_projectile: Entity,
}

// ============================================================================
// SHIELD COMPONENTS
// ============================================================================

/// Precomputed outline and center of a shield field.
#[derive(Debug, Clone, Default)]
pub struct ShieldGeometry {
    /// Center in the owning grid's local frame.
    pub center_offset: (f32, f32),
    pub vertices: Vec<(f32, f32)>,
}

/// A localized defensive volume projected by an anchored generator.
#[derive(Component, Debug, Clone)]
pub struct ShieldField {
    pub enabled: bool,
    pub powered: bool,
    pub anchored: bool,
    /// Sector center, relative to the owner's frame (radians).
    pub angle: f32,
    /// Sector width (radians).
    pub width: f32,
    pub radius: f32,
    pub max_radius: f32,
    /// Maximum width (degrees).
    pub max_width: f32,
    pub consumption_per_m2: f32,
    pub projectile_watt_per_impact: f32,
    pub surge_duration: f32,
    pub current_surge_power: f32,
    pub surge_time_remaining: f32,
    pub power_draw_limit: f32,
    pub reset_power: f32,
    /// Draw last reported to the power grid.
    pub load: f32,
    pub effects: Vec<ShieldEffect>,
    pub geometry: ShieldGeometry,
    pub geometry_dirty: bool,
    /// Entities currently inside, so enter callbacks fire once per entry.
    pub occupants: HashSet<Entity>,
}

impl ShieldField {
    pub fn new(radius: f32, width_degrees: f32) -> Self {
        Self {
            enabled: false,
            powered: true,
            anchored: true,
            angle: 0.0,
            width: width_degrees.to_radians(),
            radius,
            max_radius: 300.0,
            max_width: 360.0,
            consumption_per_m2: 0.5,
            projectile_watt_per_impact: 105.0,
            surge_duration: 25.0,
            current_surge_power: 0.0,
            surge_time_remaining: 0.0,
            power_draw_limit: 60_000_000.0,
            reset_power: 45_000_000.0,
            load: 0.0,
            effects: Vec::new(),
            geometry: ShieldGeometry::default(),
            geometry_dirty: true,
            occupants: HashSet::new(),
        }
    }

    pub fn with_effect(mut self, effect: ShieldEffect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    pub fn can_work(&self) -> bool {
        self.enabled && self.powered
    }

    /// Power the field asks the grid for, including any active surge.
    pub fn desired_draw(&self) -> f32 {
        if !self.enabled {
            return 0.0;
        }
        let base = self.radius * self.radius * self.width.to_degrees() * 0.5 * self.consumption_per_m2;
        (base + self.current_surge_power).floor()
    }
}

// ============================================================================
// GRID SHIELD COMPONENTS
// ============================================================================

/// A hull-wide shield generator. While its perimeter fields are up, every
/// other entity on its grid shrugs off explosions.
#[derive(Component, Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridShieldGenerator {
    /// Operator switch.
    pub enabled: bool,
    pub powered: bool,
    pub anchored: bool,
    /// Perimeter fields are up and protecting the grid.
    pub fields_active: bool,
    /// Perimeter field cells, in the grid's tile coordinates. May lie one
    /// tile outside the tile array.
    pub fields: Vec<(i32, i32)>,
}

impl GridShieldGenerator {
    /// An anchored, powered generator that is switched off.
    pub fn new() -> Self {
        Self {
            powered: true,
            anchored: true,
            ..Default::default()
        }
    }

    pub fn can_generate(&self) -> bool {
        self.enabled && self.powered && self.anchored
    }
}

/// Generators currently projecting fields around this grid.
#[derive(Component, Debug, Clone, Default)]
pub struct GridShieldProtection {
    pub active_generators: HashSet<Entity>,
}

/// Marker: the entity sits on a grid with active perimeter fields.
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct GridShieldProtected;

// ============================================================================
// BUNDLE HELPERS
// ============================================================================

/// Bundle for spawning a projectile.
#[derive(Bundle)]
pub struct ProjectileBundle {
    pub projectile: Projectile,
    pub position: Position,
    pub velocity: Velocity,
    pub rotation: Rotation,
    pub collider: Collider,
    pub body: BodyKind,
    pub lifetime: Lifetime,
}

impl ProjectileBundle {
    pub fn new(projectile: Projectile, x: f32, y: f32, vx: f32, vy: f32) -> Self {
        let velocity = Velocity::new(vx, vy);
        Self {
            projectile,
            position: Position::new(x, y),
            rotation: Rotation(vy.atan2(vx)),
            velocity,
            collider: Collider::soft(0.1, layers::SMALL),
            body: BodyKind::Dynamic,
            lifetime: Lifetime { remaining: 10.0 },
        }
    }
}

/// Bundle for a damageable, destructible obstacle.
#[derive(Bundle)]
pub struct TargetBundle {
    pub position: Position,
    pub rotation: Rotation,
    pub collider: Collider,
    pub body: BodyKind,
    pub damageable: Damageable,
    pub destructible: Destructible,
}

impl TargetBundle {
    pub fn new(x: f32, y: f32, radius: f32, destroyed_at: f32) -> Self {
        Self {
            position: Position::new(x, y),
            rotation: Rotation(0.0),
            collider: Collider::hard(radius, layers::IMPASSABLE | layers::OPAQUE),
            body: BodyKind::Static,
            damageable: Damageable::default(),
            destructible: Destructible::new(destroyed_at),
        }
    }
}

/// Bundle for a grid hull.
#[derive(Bundle, Default)]
pub struct GridBundle {
    pub grid: Grid,
    pub position: Position,
    pub rotation: Rotation,
}

impl GridBundle {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            grid: Grid::default(),
            position: Position::new(x, y),
            rotation: Rotation(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_penetration_never_decreases() {
        let mut p = Projectile::new(DamageSpecifier::single(DamageKind::Blunt, 10.0));
        p.add_penetration(5.0);
        p.add_penetration(-3.0);
        assert_eq!(p.penetration(), 5.0);
    }

    #[test]
    fn test_reflect_reassigns_shooter_once() {
        let mut world = World::new();
        let shooter = world.spawn_empty().id();
        let mirror = world.spawn_empty().id();

        let mut p = Projectile::new(DamageSpecifier::default()).with_shooter(shooter, None);
        assert!(p.reflect(mirror));
        assert_eq!(p.shooter, Some(mirror));
        assert_eq!(p.state, ProjectileState::Reflected { by: mirror });
        // The reflector already owns it; a second bounce off it is refused.
        assert!(!p.reflect(mirror));
    }

    #[test]
    fn test_embedded_counts_as_spent() {
        let mut world = World::new();
        let target = world.spawn_empty().id();
        let mut p = Projectile::new(DamageSpecifier::default());
        assert!(!p.is_spent());
        p.state = ProjectileState::Embedded { target };
        assert!(p.is_spent());
        p.mark_spent();
        assert_eq!(p.state, ProjectileState::Embedded { target });
    }

    #[test]
    fn test_desired_draw() {
        let mut field = ShieldField::new(10.0, 90.0);
        assert_eq!(field.desired_draw(), 0.0);
        field.enabled = true;
        field.consumption_per_m2 = 1.0;
        // 10^2 * 90 * 0.5
        assert!((field.desired_draw() - 4500.0).abs() < 1.0);
        field.current_surge_power = 500.0;
        assert!((field.desired_draw() - 5000.0).abs() < 1.0);
    }
}
