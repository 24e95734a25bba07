//! Shield field engine - geometry, power, surge and effect dispatch.
//!
//! A field moves through `Unpowered -> Powered/Disabled -> Powered/Enabled`
//! and back as power and anchoring change. While it can work, projectiles
//! crossing its sector receive enter callbacks from every attached effect;
//! every tick every effect is updated; when the field stops working or is
//! removed every effect is shut down and releases what it tracks.
//!
//! ## Data Access
//! - Reads: Position, Rotation, GridMember, Grid, Projectile, SimConfig
//! - Writes: ShieldField, Velocity (through effect actions), DeletionQueue
//!
//! ## Parallel Feature
//!
//! With `--features parallel` and more than
//! `SimConfig::parallel_field_update_threshold` fields, effect updates are
//! computed with rayon against a shared `&World` and applied sequentially.

use crate::components::*;
use crate::error::{CombatError, CombatResult};
use crate::geometry::{angle_in_sector, bearing, generate_cone_vertices_with_offset, length, normalize_angle, rotate};
use crate::systems::destruction::queue_deletion;
use crate::systems::movement::DeltaTime;
use crate::systems::performance::SimConfig;
use crate::systems::shield_effects::*;
use bevy_ecs::prelude::*;
use tracing::{debug, trace};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// World-space frame of a field, used for membership tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldFrame {
    pub origin: (f32, f32),
    /// Rotation of the owner's frame.
    pub rotation: f32,
    /// Sector start, relative to the owner's frame.
    pub start: f32,
    pub width: f32,
    /// Radius plus membership tolerance.
    pub reach: f32,
}

impl FieldFrame {
    /// Bearing in `[start, start + width)` and distance under the reach.
    pub fn contains(&self, point: (f32, f32)) -> bool {
        let delta = (point.0 - self.origin.0, point.1 - self.origin.1);
        let relative = normalize_angle(bearing(delta) - self.rotation);
        angle_in_sector(relative, self.start, self.width) && length(delta) < self.reach
    }
}

/// Resolve the world frame of `field`. Fails for zero-radius fields.
pub fn field_frame(world: &World, entity: Entity, field: &ShieldField, epsilon: f32) -> CombatResult<FieldFrame> {
    if field.radius <= 0.0 {
        return Err(CombatError::InvalidGeometry("zero shield radius"));
    }

    let owner = world
        .get::<GridMember>(entity)
        .map(|member| member.0)
        .filter(|grid| world.get::<Position>(*grid).is_some());

    let (origin, rotation) = match owner {
        Some(grid) => {
            let pos = world.get::<Position>(grid).copied().unwrap_or_default();
            let rot = world.get::<Rotation>(grid).map(|r| r.0).unwrap_or(0.0);
            let center = rotate(field.geometry.center_offset, rot);
            ((pos.x + center.0, pos.y + center.1), rot)
        }
        None => {
            let pos = world
                .get::<Position>(entity)
                .copied()
                .ok_or(CombatError::StaleReference(entity))?;
            let rot = world.get::<Rotation>(entity).map(|r| r.0).unwrap_or(0.0);
            ((pos.x, pos.y), rot)
        }
    };

    Ok(FieldFrame {
        origin,
        rotation,
        start: normalize_angle(field.angle - field.width / 2.0),
        width: field.width,
        reach: field.radius + epsilon,
    })
}

/// Grid that owns a field, if any.
pub fn field_grid(world: &World, entity: Entity) -> Option<Entity> {
    world.get::<GridMember>(entity).map(|member| member.0)
}

/// Facts about `entity` as seen from a field owned by `grid`.
pub fn entrant_for(world: &World, entity: Entity, grid: Option<Entity>) -> Entrant {
    let projectile = world.get::<Projectile>(entity);
    let shooter_grid = projectile
        .and_then(|p| p.shooter)
        .and_then(|shooter| world.get::<GridMember>(shooter))
        .map(|member| member.0);
    let same_origin = grid.is_some()
        && (projectile.and_then(|p| p.origin_grid) == grid || shooter_grid == grid);

    Entrant {
        entity,
        is_projectile: projectile.map(|p| !p.is_spent()).unwrap_or(false),
        ship_projectile: world.get::<ShipWeaponProjectile>(entity).is_some(),
        same_origin,
        damage_total: projectile.map(|p| p.damage.total()).unwrap_or(0.0),
    }
}

// ============================================================================
// POWER AND SURGE
// ============================================================================

/// Recompute draw and the powered flag from it.
///
/// Unanchored fields are always forced unpowered and disabled.
pub fn update_power_draw(field: &mut ShieldField) {
    if !field.anchored {
        field.powered = false;
        field.enabled = false;
        field.load = 0.0;
        return;
    }

    let draw = field.desired_draw();
    field.load = draw;
    if draw > field.power_draw_limit {
        field.powered = false;
    } else if draw < field.reset_power {
        field.powered = true;
    }
}

/// Add an impact's worth of surge and restart the countdown.
/// Harmless impacts leave both untouched.
pub fn apply_surge(field: &mut ShieldField, damage: f32) {
    if damage <= 0.0 {
        return;
    }
    field.current_surge_power += damage * field.projectile_watt_per_impact;
    field.surge_time_remaining = field.surge_duration;
    update_power_draw(field);
}

/// Advance the surge countdown. Surge and countdown always reach zero together.
/// Returns true if the surge expired this call.
pub fn decay_surge(field: &mut ShieldField, dt: f32) -> bool {
    if field.current_surge_power <= 0.0 || field.surge_time_remaining <= 0.0 {
        field.current_surge_power = 0.0;
        field.surge_time_remaining = 0.0;
        return false;
    }

    field.surge_time_remaining -= dt;
    if field.surge_time_remaining <= 0.0 {
        field.current_surge_power = 0.0;
        field.surge_time_remaining = 0.0;
        update_power_draw(field);
        return true;
    }
    false
}

// ============================================================================
// EFFECT DISPATCH
// ============================================================================

/// Apply actions requested by `field`'s effects.
pub fn apply_effect_actions(world: &mut World, field: Entity, actions: Vec<EffectAction>) {
    for action in actions {
        match action {
            EffectAction::ScaleVelocity { entity, factor } => {
                if let Some(mut velocity) = world.get_mut::<Velocity>(entity) {
                    *velocity = velocity.scaled(factor);
                }
            }
            EffectAction::Destroy(entity) => {
                if world.entities().contains(entity) {
                    debug!(?field, ?entity, "shield destroyed entrant");
                    queue_deletion(world, entity);
                }
            }
            EffectAction::Surge { damage } => {
                let was_working = world.get::<ShieldField>(field).map(|f| f.can_work()).unwrap_or(false);
                if let Some(mut shield) = world.get_mut::<ShieldField>(field) {
                    apply_surge(&mut shield, damage);
                    trace!(?field, surge = shield.current_surge_power, "shield surge");
                }
                if was_working {
                    shutdown_if_stopped(world, field);
                }
            }
        }
    }
}

/// Run `hook` over every effect of `field` with the effects taken out of the
/// component, then apply what they asked for.
fn dispatch<F>(world: &mut World, field: Entity, hook: F)
where
    F: FnOnce(&World, &mut Vec<ShieldEffect>, &mut Vec<EffectAction>),
{
    let Some(mut effects) = world
        .get_mut::<ShieldField>(field)
        .map(|mut shield| std::mem::take(&mut shield.effects))
    else {
        return;
    };

    let mut actions = Vec::new();
    hook(world, &mut effects, &mut actions);

    if let Some(mut shield) = world.get_mut::<ShieldField>(field) {
        shield.effects = effects;
    }
    apply_effect_actions(world, field, actions);
}

/// Shut down every effect and forget occupants.
pub fn shutdown_effects(world: &mut World, field: Entity) {
    if let Some(mut shield) = world.get_mut::<ShieldField>(field) {
        shield.occupants.clear();
    }
    dispatch(world, field, |_, effects, actions| {
        for effect in effects.iter_mut() {
            effect.on_shutdown(actions);
        }
    });
}

fn init_effects(world: &mut World, field: Entity) {
    dispatch(world, field, |_, effects, _| {
        for effect in effects.iter_mut() {
            effect.on_init();
        }
    });
}

fn shutdown_if_stopped(world: &mut World, field: Entity) {
    let stopped = world.get::<ShieldField>(field).map(|f| !f.can_work()).unwrap_or(false);
    if stopped {
        debug!(?field, "shield stopped working, shutting down effects");
        shutdown_effects(world, field);
    }
}

/// Deliver an enter callback for `entity` to every effect on `field`.
pub fn enter_field(world: &mut World, field: Entity, entity: Entity) {
    let grid = field_grid(world, field);
    dispatch(world, field, |world, effects, actions| {
        let entrant = entrant_for(world, entity, grid);
        for effect in effects.iter_mut() {
            effect.on_enter(&entrant, actions);
        }
    });
}

/// Remove a field, releasing everything its effects hold.
pub fn remove_field(world: &mut World, field: Entity) {
    shutdown_effects(world, field);
    if let Ok(mut entity) = world.get_entity_mut(field) {
        entity.remove::<ShieldField>();
    }
}

// ============================================================================
// HOST SIGNALS
// ============================================================================

/// Power-changed signal from the power grid.
pub fn set_powered(world: &mut World, field: Entity, powered: bool) -> CombatResult<()> {
    let mut shield = world
        .get_mut::<ShieldField>(field)
        .ok_or(CombatError::StaleReference(field))?;
    shield.powered = powered;
    if !powered {
        shutdown_effects(world, field);
    }
    Ok(())
}

/// Anchor-changed signal. Unanchoring disables, unpowers and shuts down.
pub fn set_anchored(world: &mut World, field: Entity, anchored: bool) -> CombatResult<()> {
    let mut shield = world
        .get_mut::<ShieldField>(field)
        .ok_or(CombatError::StaleReference(field))?;
    shield.anchored = anchored;
    shield.geometry_dirty = true;
    update_power_draw(&mut shield);
    if !anchored {
        shutdown_effects(world, field);
    }
    Ok(())
}

/// Flip the enabled flag. Returns the new state.
pub fn toggle(world: &mut World, field: Entity) -> CombatResult<bool> {
    let mut shield = world
        .get_mut::<ShieldField>(field)
        .ok_or(CombatError::StaleReference(field))?;

    if !shield.enabled && !shield.anchored {
        return Err(CombatError::FieldRejected { field, reason: "not anchored" });
    }
    if !shield.enabled && !shield.powered {
        return Err(CombatError::FieldRejected { field, reason: "not powered" });
    }

    shield.enabled = !shield.enabled;
    shield.geometry_dirty = true;
    update_power_draw(&mut shield);
    let enabled = shield.enabled;

    if enabled {
        init_effects(world, field);
    } else {
        shutdown_effects(world, field);
    }
    Ok(enabled)
}

/// Change sector angle (radians), width (degrees) and radius.
pub fn set_parameters(
    world: &mut World,
    field: Entity,
    angle: Option<f32>,
    width_degrees: Option<f32>,
    radius: Option<f32>,
) -> CombatResult<()> {
    let mut shield = world
        .get_mut::<ShieldField>(field)
        .ok_or(CombatError::StaleReference(field))?;

    if radius.is_some_and(|r| r > shield.max_radius) {
        return Err(CombatError::FieldRejected { field, reason: "radius above maximum" });
    }
    if width_degrees.is_some_and(|w| w > shield.max_width) {
        return Err(CombatError::FieldRejected { field, reason: "width above maximum" });
    }

    if let Some(angle) = angle {
        shield.angle = angle;
    }
    if let Some(width) = width_degrees {
        shield.width = width.to_radians();
    }
    if let Some(radius) = radius {
        shield.radius = radius;
    }
    shield.geometry_dirty = true;
    update_power_draw(&mut shield);
    let working = shield.can_work();
    if !working {
        shutdown_effects(world, field);
    }
    Ok(())
}

// ============================================================================
// SYSTEMS
// ============================================================================

/// Rebuild outlines for fields whose radius, width or anchoring changed.
pub fn shield_geometry_system(
    config: Res<SimConfig>,
    grids: Query<&Grid>,
    mut fields: Query<(Entity, &mut ShieldField, Option<&GridMember>)>,
) {
    for (entity, mut field, member) in fields.iter_mut() {
        if !field.geometry_dirty {
            continue;
        }

        let max_width = field.max_width.min(360.0).to_radians();
        field.radius = field.radius.clamp(0.0, field.max_radius.max(0.0));
        field.width = field.width.max(config.shield_min_width.to_radians()).min(max_width);

        let center_offset = member
            .and_then(|m| grids.get(m.0).ok())
            .map(|grid| grid.local_center_of_mass)
            .unwrap_or((0.0, 0.0));

        field.geometry.center_offset = center_offset;
        field.geometry.vertices = if field.radius > 0.0 {
            generate_cone_vertices_with_offset(field.radius, field.angle, field.width, center_offset, 0)
        } else {
            Vec::new()
        };
        field.geometry_dirty = false;
        update_power_draw(&mut field);
        trace!(?entity, radius = field.radius, "rebuilt shield geometry");
    }
}

/// Fire enter callbacks for entities that crossed into a working field.
pub fn shield_contact_system(world: &mut World) {
    let epsilon = world
        .get_resource::<SimConfig>()
        .map(|c| c.shield_membership_epsilon)
        .unwrap_or(0.1);

    let mut field_query = world.query::<(Entity, &ShieldField)>();
    let fields: Vec<(Entity, FieldFrame)> = field_query
        .iter(world)
        .filter(|(_, field)| field.can_work())
        .filter_map(|(entity, field)| match field_frame(world, entity, field, epsilon) {
            Ok(frame) => Some((entity, frame)),
            Err(err) => {
                trace!(?entity, %err, "skipping field this tick");
                None
            }
        })
        .collect();

    if fields.is_empty() {
        return;
    }

    let mut mover_query = world.query_filtered::<(Entity, &Position), (With<Velocity>, Without<ShieldField>, Without<Grid>)>();
    let movers: Vec<(Entity, (f32, f32))> = mover_query
        .iter(world)
        .map(|(entity, pos)| (entity, pos.as_tuple()))
        .collect();

    for (field, frame) in fields {
        let mut inside: Vec<Entity> = movers
            .iter()
            .filter(|(_, pos)| frame.contains(*pos))
            .map(|(entity, _)| *entity)
            .collect();
        inside.sort();

        let entering: Vec<Entity> = match world.get_mut::<ShieldField>(field) {
            Some(mut shield) => {
                let entering = inside.iter().copied().filter(|e| !shield.occupants.contains(e)).collect();
                shield.occupants = inside.into_iter().collect();
                entering
            }
            None => continue,
        };

        for entity in entering {
            trace!(?field, ?entity, "entered shield");
            enter_field(world, field, entity);
        }
    }
}

struct WorldLookup<'w> {
    world: &'w World,
    frame: Option<FieldFrame>,
}

impl FieldLookup for WorldLookup<'_> {
    fn exists(&self, entity: Entity) -> bool {
        self.world.entities().contains(entity)
    }

    fn inside(&self, entity: Entity) -> bool {
        match (self.frame, self.world.get::<Position>(entity)) {
            (Some(frame), Some(pos)) => frame.contains(pos.as_tuple()),
            _ => false,
        }
    }
}

/// Work item for one field's per-tick update.
struct FieldUpdate {
    entity: Entity,
    frame: Option<FieldFrame>,
    effects: Vec<ShieldEffect>,
    actions: Vec<EffectAction>,
}

fn run_field_update(world: &World, update: &mut FieldUpdate) {
    let lookup = WorldLookup {
        world,
        frame: update.frame,
    };
    for effect in update.effects.iter_mut() {
        effect.on_update(&lookup, &mut update.actions);
    }
}

/// Update every effect and decay surges.
pub fn shield_update_system(world: &mut World) {
    let dt = world.get_resource::<DeltaTime>().map(|d| d.0).unwrap_or(0.0);
    let (epsilon, parallel_threshold) = world
        .get_resource::<SimConfig>()
        .map(|c| (c.shield_membership_epsilon, c.parallel_field_update_threshold))
        .unwrap_or((0.1, 4));

    let mut field_query = world.query_filtered::<Entity, With<ShieldField>>();
    let entities: Vec<Entity> = field_query.iter(world).collect();

    let mut updates: Vec<FieldUpdate> = Vec::with_capacity(entities.len());
    for entity in entities {
        let Some(field) = world.get::<ShieldField>(entity) else { continue };
        let frame = field_frame(world, entity, field, epsilon).ok();
        let Some(mut field) = world.get_mut::<ShieldField>(entity) else { continue };
        let effects = std::mem::take(&mut field.effects);
        updates.push(FieldUpdate {
            entity,
            frame,
            effects,
            actions: Vec::new(),
        });
    }

    let world_ref: &World = world;
    #[cfg(feature = "parallel")]
    {
        if updates.len() > parallel_threshold {
            updates.par_iter_mut().for_each(|update| run_field_update(world_ref, update));
        } else {
            updates.iter_mut().for_each(|update| run_field_update(world_ref, update));
        }
    }
    #[cfg(not(feature = "parallel"))]
    {
        let _ = parallel_threshold;
        updates.iter_mut().for_each(|update| run_field_update(world_ref, update));
    }

    for update in updates {
        let FieldUpdate {
            entity,
            effects,
            actions,
            ..
        } = update;

        let mut stopped = false;
        if let Some(mut field) = world.get_mut::<ShieldField>(entity) {
            field.effects = effects;
            let was_working = field.can_work();
            if decay_surge(&mut field, dt) {
                debug!(?entity, "shield surge expired");
            }
            stopped = was_working && !field.can_work();
        }
        apply_effect_actions(world, entity, actions);
        if stopped {
            shutdown_effects(world, entity);
        }
    }
}

// ============================================================================
// RESOLVER VIEW
// ============================================================================

/// A phasing effect as seen by collision workers.
#[derive(Debug, Clone)]
pub struct PhaseView {
    pub effect_index: usize,
    pub rule: SpeedChangeRule,
    pub tracked: TrackedSet,
}

/// A working field as seen by collision workers.
#[derive(Debug, Clone)]
pub struct FieldView {
    pub entity: Entity,
    pub grid: Option<Entity>,
    pub frame: FieldFrame,
    pub phasers: Vec<PhaseView>,
}

/// Read-only copy of every working field with a speed-change effect, taken
/// once per drain so workers never touch the world.
#[derive(Debug, Clone, Default)]
pub struct ShieldSnapshot {
    pub fields: Vec<FieldView>,
}

impl ShieldSnapshot {
    pub fn capture(world: &mut World) -> Self {
        let epsilon = world
            .get_resource::<SimConfig>()
            .map(|c| c.shield_membership_epsilon)
            .unwrap_or(0.1);

        let mut query = world.query::<(Entity, &ShieldField)>();
        let fields = query
            .iter(world)
            .filter(|(_, field)| field.can_work())
            .filter_map(|(entity, field)| {
                let phasers: Vec<PhaseView> = field
                    .effects
                    .iter()
                    .enumerate()
                    .filter_map(|(effect_index, effect)| {
                        effect.as_speed_change().map(|speed| PhaseView {
                            effect_index,
                            rule: speed.rule,
                            tracked: speed.tracked.clone(),
                        })
                    })
                    .collect();
                if phasers.is_empty() {
                    return None;
                }
                let frame = field_frame(world, entity, field, epsilon).ok()?;
                Some(FieldView {
                    entity,
                    grid: field_grid(world, entity),
                    frame,
                    phasers,
                })
            })
            .collect();

        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Projectile facts needed for a shield check.
#[derive(Debug, Clone, Copy)]
pub struct ProjectileView {
    pub entity: Entity,
    pub position: (f32, f32),
    pub is_projectile: bool,
    pub ship_projectile: bool,
    pub origin_grid: Option<Entity>,
    pub shooter_grid: Option<Entity>,
    pub damage_total: f32,
}

impl ProjectileView {
    pub fn capture(world: &World, entity: Entity) -> Option<Self> {
        let projectile = world.get::<Projectile>(entity)?;
        let position = world.get::<Position>(entity)?.as_tuple();
        Some(Self {
            entity,
            position,
            is_projectile: !projectile.is_spent(),
            ship_projectile: world.get::<ShipWeaponProjectile>(entity).is_some(),
            origin_grid: projectile.origin_grid,
            shooter_grid: projectile
                .shooter
                .and_then(|shooter| world.get::<GridMember>(shooter))
                .map(|member| member.0),
            damage_total: projectile.damage.total(),
        })
    }

    fn entrant(&self, grid: Option<Entity>) -> Entrant {
        Entrant {
            entity: self.entity,
            is_projectile: self.is_projectile,
            ship_projectile: self.ship_projectile,
            same_origin: grid.is_some() && (self.origin_grid == grid || self.shooter_grid == grid),
            damage_total: self.damage_total,
        }
    }
}

/// Work a shield check asks the main thread to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShieldAdmission {
    Track {
        field: Entity,
        effect_index: usize,
        projectile: Entity,
    },
    Destroy {
        field: Entity,
        projectile: Entity,
    },
}

/// Outcome of consulting the fields for one contact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShieldVerdict {
    /// The collision must not resolve.
    pub cancel: bool,
    pub admissions: Vec<ShieldAdmission>,
}

/// Decide whether a contact passes through a field instead of resolving.
///
/// Pure over the snapshot; safe to call from collision workers.
pub fn check_shield_collision(snapshot: &ShieldSnapshot, view: &ProjectileView) -> ShieldVerdict {
    let mut verdict = ShieldVerdict::default();

    for field in &snapshot.fields {
        if field
            .phasers
            .iter()
            .any(|phaser| phaser.rule.phasing && phaser.tracked.contains(view.entity))
        {
            verdict.cancel = true;
            continue;
        }

        if !field.frame.contains(view.position) {
            continue;
        }

        let entrant = view.entrant(field.grid);
        for phaser in &field.phasers {
            match phaser.rule.decide(&entrant) {
                EntryDecision::Ignore => {}
                EntryDecision::Destroy => {
                    verdict.cancel = true;
                    verdict.admissions.push(ShieldAdmission::Destroy {
                        field: field.entity,
                        projectile: view.entity,
                    });
                }
                EntryDecision::Track => {
                    verdict.cancel |= phaser.rule.phasing;
                    verdict.admissions.push(ShieldAdmission::Track {
                        field: field.entity,
                        effect_index: phaser.effect_index,
                        projectile: view.entity,
                    });
                }
            }
        }
    }

    verdict
}

/// Apply admissions produced by [`check_shield_collision`].
pub fn apply_admissions(world: &mut World, admissions: &[ShieldAdmission]) {
    for admission in admissions {
        match *admission {
            ShieldAdmission::Track {
                field,
                effect_index,
                projectile,
            } => {
                let mut actions = Vec::new();
                if let Some(shield) = world.get::<ShieldField>(field) {
                    if let Some(speed) = shield.effects.get(effect_index).and_then(|e| e.as_speed_change()) {
                        speed.admit(projectile, &mut actions);
                    }
                }
                apply_effect_actions(world, field, actions);
            }
            ShieldAdmission::Destroy { field, projectile } => {
                apply_effect_actions(world, field, vec![EffectAction::Destroy(projectile)]);
            }
        }
    }
}

/// Immediate-path check: should this projectile pass through instead of hitting?
pub fn should_projectile_phase(world: &mut World, projectile: Entity) -> bool {
    let Some(view) = ProjectileView::capture(world, projectile) else {
        return false;
    };
    let snapshot = ShieldSnapshot::capture(world);
    if snapshot.is_empty() {
        return false;
    }
    let verdict = check_shield_collision(&snapshot, &view);
    apply_admissions(world, &verdict.admissions);
    verdict.cancel
}
