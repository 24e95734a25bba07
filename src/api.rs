//! Public API for the combat core.
//!
//! [`CombatSim`] owns the ECS world and the schedule. Hosts feed it signals
//! (contacts, power and anchor changes, field and generator controls, throws) through
//! ordinary methods and read back produced events with [`CombatSim::drain_events`].
//!
//! ## Fixed Timestep
//!
//! The simulation uses a fixed timestep internally (default 60 Hz). When `step(dt)` is called,
//! the simulation accumulates time and runs fixed updates as needed. This keeps resolution
//! deterministic regardless of frame rate.
//!
//! ## Tick Order
//!
//! Broad-phase rebuild and field geometry first, then the raycast sweep (which must see
//! positions before integration), movement, narrow-phase contacts, field occupancy, the
//! collision drain, effect updates, the grid shield sweep, explosions, negation rollback
//! and finally cleanup.
//! Nothing is despawned before `deletion_system` at the very end.

use crate::components::*;
use crate::error::CombatResult;
use crate::events::{CandidateCollision, CombatEventBuffer, CombatEvents};
use crate::spatial::{spatial_grid_update_system, SpatialGrid};
use crate::systems::collision::{collision_drain_system, drain_with, CollisionScheduler, ContactOutcome, DrainPath, DrainReport};
use crate::systems::contacts::{contact_detection_system, ActiveContacts};
use crate::systems::destruction::{deletion_system, destroyed_check_system, DeletionQueue};
use crate::systems::embedding::{begin_embed_removal, embed_removal_system, on_throw_hit};
use crate::systems::explosion::{explosion_system, explosive_fuse_system, ExplosionQueue};
use crate::systems::grid_shield::{
    grid_shield_system, set_generator_anchored, set_generator_powered, toggle_generator, GridShieldTimer,
};
use crate::systems::movement::{attachment_follow_system, movement_system, DeltaTime};
use crate::systems::negation::{negation_update_system, register_projectile, SameOriginNegation};
use crate::systems::performance::{SimClock, SimConfig, SimTick};
use crate::systems::projectile::lifetime_system;
use crate::systems::raycast::raycast_sweep_system;
use crate::systems::shield::{
    set_anchored, set_parameters, set_powered, shield_contact_system, shield_geometry_system, shield_update_system,
    shutdown_effects, toggle,
};
use crate::systems::collision::on_candidate_collision;
use crate::world::Snapshot;
use bevy_ecs::prelude::*;
use tracing::info;

/// The combat simulation context.
///
/// Holds the ECS world and schedule, providing a clean API for:
/// - Initializing and tearing down the simulation
/// - Stepping the simulation forward
/// - Delivering host signals
/// - Extracting state snapshots and produced events
pub struct CombatSim {
    world: World,
    schedule: Schedule,
    tick: u64,
    time: f32,
    /// Accumulated time for fixed timestep.
    time_accumulator: f32,
}

impl CombatSim {
    /// Create a new empty simulation.
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    /// Create a new simulation with custom configuration.
    pub fn with_config(config: SimConfig) -> Self {
        let mut world = World::new();

        world.insert_resource(DeltaTime(config.fixed_timestep));
        world.insert_resource(SpatialGrid::new(config.spatial_cell_size));
        world.insert_resource(SimTick(0));
        world.insert_resource(SimClock::default());
        world.init_resource::<CombatEventBuffer>();
        world.init_resource::<DeletionQueue>();
        world.init_resource::<ExplosionQueue>();
        world.init_resource::<CollisionScheduler>();
        world.init_resource::<ActiveContacts>();
        world.init_resource::<SameOriginNegation>();
        world.init_resource::<GridShieldTimer>();
        info!(
            timestep = config.fixed_timestep,
            immediate_floor = config.immediate_floor,
            min_parallel_batch = config.min_parallel_batch,
            "combat sim initialized"
        );
        world.insert_resource(config);

        let mut schedule = Schedule::default();
        schedule.add_systems(
            (
                spatial_grid_update_system,
                shield_geometry_system,
                raycast_sweep_system,
                movement_system,
                attachment_follow_system,
                contact_detection_system,
                shield_contact_system,
                collision_drain_system,
                shield_update_system,
                grid_shield_system,
                explosive_fuse_system,
                explosion_system,
                negation_update_system,
                embed_removal_system,
                lifetime_system,
                destroyed_check_system,
                deletion_system,
            )
                .chain(),
        );

        Self {
            world,
            schedule,
            tick: 0,
            time: 0.0,
            time_accumulator: 0.0,
        }
    }

    /// Step the simulation forward by `dt` seconds.
    ///
    /// Uses fixed timestep internally - accumulates time and runs fixed updates
    /// as needed.
    pub fn step(&mut self, dt: f32) {
        let fixed_dt = self.fixed_timestep();
        self.time_accumulator += dt;

        while self.time_accumulator >= fixed_dt {
            self.fixed_update(fixed_dt);
            self.time_accumulator -= fixed_dt;
        }
    }

    /// Run exactly one fixed update.
    pub fn tick(&mut self) {
        let fixed_dt = self.fixed_timestep();
        self.fixed_update(fixed_dt);
    }

    fn fixed_timestep(&self) -> f32 {
        self.world
            .get_resource::<SimConfig>()
            .map(|c| c.fixed_timestep)
            .unwrap_or(1.0 / 60.0)
    }

    /// Run a single fixed timestep update.
    fn fixed_update(&mut self, dt: f32) {
        if let Some(mut dt_res) = self.world.get_resource_mut::<DeltaTime>() {
            dt_res.0 = dt;
        }
        if let Some(mut tick_res) = self.world.get_resource_mut::<SimTick>() {
            tick_res.increment();
        }
        if let Some(mut clock) = self.world.get_resource_mut::<SimClock>() {
            clock.advance(dt);
        }

        self.schedule.run(&mut self.world);

        self.tick += 1;
        self.time += dt;
    }

    /// Shut down every field's effects and drop all pending work.
    pub fn teardown(&mut self) {
        let mut query = self.world.query_filtered::<Entity, With<ShieldField>>();
        let fields: Vec<Entity> = query.iter(&self.world).collect();
        for field in &fields {
            shutdown_effects(&mut self.world, *field);
        }

        self.world.insert_resource(CollisionScheduler::default());
        self.world.insert_resource(ExplosionQueue::default());
        self.world.insert_resource(ActiveContacts::default());
        self.world.insert_resource(SameOriginNegation::default());
        self.world.insert_resource(GridShieldTimer::default());
        self.world.resource_mut::<CombatEventBuffer>().clear();
        deletion_system(&mut self.world);
        info!(fields = fields.len(), tick = self.tick, "combat sim torn down");
    }

    // ========================================================================
    // HOST SIGNALS
    // ========================================================================

    /// Offer a physics contact to the resolver.
    pub fn on_candidate_collision(&mut self, contact: CandidateCollision) -> CombatResult<ContactOutcome> {
        on_candidate_collision(&mut self.world, contact)
    }

    /// Offer a batch of contacts in order.
    pub fn submit_contacts(
        &mut self,
        contacts: impl IntoIterator<Item = CandidateCollision>,
    ) -> Vec<CombatResult<ContactOutcome>> {
        contacts
            .into_iter()
            .map(|contact| on_candidate_collision(&mut self.world, contact))
            .collect()
    }

    /// Drain the deferred queue immediately.
    pub fn drain_collisions(&mut self, force: Option<DrainPath>) -> DrainReport {
        drain_with(&mut self.world, force)
    }

    pub fn on_power_changed(&mut self, field: Entity, powered: bool) -> CombatResult<()> {
        set_powered(&mut self.world, field, powered)
    }

    pub fn on_anchor_changed(&mut self, field: Entity, anchored: bool) -> CombatResult<()> {
        set_anchored(&mut self.world, field, anchored)
    }

    /// Toggle a field on or off. Returns the new enabled state.
    pub fn toggle_field(&mut self, field: Entity) -> CombatResult<bool> {
        toggle(&mut self.world, field)
    }

    /// Change a field's angle (radians), width (degrees) and radius.
    pub fn set_field_parameters(
        &mut self,
        field: Entity,
        angle: Option<f32>,
        width_degrees: Option<f32>,
        radius: Option<f32>,
    ) -> CombatResult<()> {
        set_parameters(&mut self.world, field, angle, width_degrees, radius)
    }

    /// Toggle a grid shield generator. Returns the new switch position.
    pub fn toggle_generator(&mut self, generator: Entity) -> CombatResult<bool> {
        toggle_generator(&mut self.world, generator)
    }

    pub fn on_generator_power_changed(&mut self, generator: Entity, powered: bool) -> CombatResult<()> {
        set_generator_powered(&mut self.world, generator, powered)
    }

    pub fn on_generator_anchor_changed(&mut self, generator: Entity, anchored: bool) -> CombatResult<()> {
        set_generator_anchored(&mut self.world, generator, anchored)
    }

    pub fn on_throw_hit(&mut self, item: Entity, target: Entity) -> CombatResult<bool> {
        on_throw_hit(&mut self.world, item, target)
    }

    pub fn begin_embed_removal(&mut self, entity: Entity, user: Option<Entity>) -> CombatResult<()> {
        begin_embed_removal(&mut self.world, entity, user)
    }

    /// Take every event produced since the last call.
    pub fn drain_events(&mut self) -> CombatEvents {
        self.world.resource_mut::<CombatEventBuffer>().take()
    }

    // ========================================================================
    // SPAWNING
    // ========================================================================

    /// Spawn a projectile and record its origin grid if fired remotely.
    pub fn spawn_projectile(&mut self, projectile: Projectile, x: f32, y: f32, vx: f32, vy: f32) -> Entity {
        let entity = self
            .world
            .spawn(ProjectileBundle::new(projectile, x, y, vx, vy))
            .id();
        register_projectile(&mut self.world, entity);
        entity
    }

    pub fn spawn_target(&mut self, x: f32, y: f32, radius: f32, destroyed_at: f32) -> Entity {
        self.world.spawn(TargetBundle::new(x, y, radius, destroyed_at)).id()
    }

    pub fn spawn_grid(&mut self, x: f32, y: f32) -> Entity {
        self.world.spawn(GridBundle::new(x, y)).id()
    }

    /// Spawn a switched-off grid shield generator on `grid`.
    pub fn spawn_generator(&mut self, grid: Entity) -> Entity {
        let position = self.world.get::<Position>(grid).copied().unwrap_or_default();
        self.world
            .spawn((GridShieldGenerator::new(), GridMember(grid), position))
            .id()
    }

    /// Spawn a field owned by `grid`.
    pub fn spawn_field(&mut self, grid: Entity, field: ShieldField) -> Entity {
        let position = self.world.get::<Position>(grid).copied().unwrap_or_default();
        self.world.spawn((field, GridMember(grid), position)).id()
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Get a snapshot of the current combat state.
    pub fn snapshot(&mut self) -> Snapshot {
        Snapshot::from_world(&mut self.world, self.tick, self.time)
    }

    /// Get the snapshot as a JSON string.
    pub fn snapshot_json(&mut self) -> String {
        self.snapshot().to_json().unwrap_or_else(|_| "{}".to_string())
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn current_time(&self) -> f32 {
        self.time
    }

    /// Get the spatial grid reference (for debugging/visualization).
    pub fn spatial_grid(&self) -> Option<&SpatialGrid> {
        self.world.get_resource::<SpatialGrid>()
    }

    /// Get direct access to the ECS world (for advanced usage).
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Get mutable access to the ECS world (for advanced usage).
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }
}

impl Default for CombatSim {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damage::{DamageKind, DamageSpecifier, Damageable};
    use crate::systems::projectile::{HitOutcome, HitReport};
    use crate::systems::shield_effects::{ShieldEffect, TempSpeedChangeEffect};
    use crate::tiles::{GridTiles, TileType};

    fn hit(sim: &mut CombatSim, projectile: Entity, target: Entity) -> ContactOutcome {
        sim.on_candidate_collision(CandidateCollision::discrete(projectile, target, (0.0, 0.0), (1.0, 0.0)))
            .unwrap()
    }

    #[test]
    fn test_step_advances_tick() {
        let mut sim = CombatSim::new();
        sim.step(1.0 / 60.0 + 0.0001);
        assert_eq!(sim.current_tick(), 1);
        sim.tick();
        assert_eq!(sim.current_tick(), 2);
        assert_eq!(sim.world().resource::<SimTick>().0, 2);
    }

    #[test]
    fn test_penetrate_then_tank_scenario() {
        let mut sim = CombatSim::new();
        let slug = Projectile::new(DamageSpecifier::single(DamageKind::Blunt, 50.0)).with_penetration_threshold(100.0);
        let slug = sim.spawn_projectile(slug, 0.0, 0.0, 10.0, 0.0);
        let first = sim.spawn_target(50.0, 0.0, 1.0, 30.0);
        let second = sim.spawn_target(60.0, 0.0, 1.0, 90.0);

        let ContactOutcome::Resolved(HitOutcome::Hit(report)) = hit(&mut sim, slug, first) else {
            panic!("expected a resolved hit");
        };
        assert_eq!(report.penetration, 30.0);
        assert!(!report.spent);
        assert_eq!(sim.world().get::<Damageable>(first).unwrap().total(), 50.0);

        assert!(matches!(
            hit(&mut sim, slug, second),
            ContactOutcome::Resolved(HitOutcome::Hit(HitReport { spent: true, penetration, .. })) if penetration == 30.0
        ));

        // Spent: further contacts do nothing.
        assert_eq!(hit(&mut sim, slug, second), ContactOutcome::Filtered(crate::systems::collision::FilterReason::Spent));
        assert_eq!(sim.world().get::<Damageable>(second).unwrap().total(), 50.0);
    }

    #[test]
    fn test_swept_crossing_resolves_once() {
        let mut sim = CombatSim::new();
        let slug = Projectile::new(DamageSpecifier::single(DamageKind::Piercing, 5.0)).with_penetration_threshold(1000.0);
        let slug = sim.spawn_projectile(slug, 3.0, 0.0, 150.0, 0.0);
        let target = sim.spawn_target(6.0, 0.0, 2.0, 5.0);

        // The sweep stops at the surface, then movement carries the slug
        // inside the collider before overlap detection runs.
        sim.tick();

        let events = sim.drain_events();
        assert_eq!(events.hits.len(), 1);
        assert_eq!(events.hits[0].target, target);
        assert_eq!(sim.world().get::<Projectile>(slug).unwrap().penetration(), 5.0);
        assert!(sim.world().get::<Position>(slug).unwrap().x > 6.0);

        sim.tick();
        assert!(sim.drain_events().hits.is_empty());
    }

    #[test]
    fn test_shield_exempts_same_origin_and_phases_foreign() {
        let mut sim = CombatSim::new();
        let home = sim.spawn_grid(0.0, 0.0);
        let field = ShieldField::new(20.0, 360.0).with_effect(ShieldEffect::TempSpeedChange(TempSpeedChangeEffect::phasing(0.5)));
        let field = sim.spawn_field(home, field);
        assert_eq!(sim.toggle_field(field), Ok(true));
        let target = sim.spawn_target(6.0, 0.0, 1.0, 1000.0);

        let ours = Projectile::new(DamageSpecifier::single(DamageKind::Piercing, 10.0)).with_origin_grid(home);
        let ours = sim.spawn_projectile(ours, 5.0, 0.0, 100.0, 0.0);
        sim.world_mut().entity_mut(ours).insert(ShipWeaponProjectile);
        assert!(matches!(hit(&mut sim, ours, target), ContactOutcome::Resolved(HitOutcome::Hit(_))));

        let theirs = Projectile::new(DamageSpecifier::single(DamageKind::Piercing, 10.0));
        let theirs = sim.spawn_projectile(theirs, 5.0, 1.0, 100.0, 0.0);
        sim.world_mut().entity_mut(theirs).insert(ShipWeaponProjectile);
        assert_eq!(hit(&mut sim, theirs, target), ContactOutcome::Cancelled);
        assert!((sim.world().get::<Velocity>(theirs).unwrap().vx - 50.0).abs() < 1e-4);
        // Still tracked: the next contact is cancelled too.
        assert_eq!(hit(&mut sim, theirs, target), ContactOutcome::Cancelled);
        assert_eq!(sim.world().get::<Damageable>(target).unwrap().total(), 10.0);
    }

    #[test]
    fn test_twenty_contacts_drain_in_parallel_once_each() {
        let config = SimConfig {
            immediate_floor: 0,
            ..Default::default()
        };
        let mut sim = CombatSim::with_config(config);
        let mut contacts = Vec::new();
        for i in 0..20 {
            let p = Projectile::new(DamageSpecifier::single(DamageKind::Blunt, 1.0));
            let p = sim.spawn_projectile(p, i as f32 * 10.0, 0.0, 1.0, 0.0);
            let t = sim.spawn_target(i as f32 * 10.0 + 1.0, 0.0, 0.5, 100.0);
            contacts.push(CandidateCollision::discrete(p, t, (0.0, 0.0), (1.0, 0.0)));
        }
        // Duplicate of the first contact in the same window.
        contacts.push(contacts[0]);
        let outcomes = sim.submit_contacts(contacts.clone());
        assert!(outcomes.iter().all(|o| matches!(o, Ok(ContactOutcome::Enqueued))));

        let report = sim.drain_collisions(None);
        assert_eq!(report.path, DrainPath::Parallel);
        assert_eq!(report.processed, 20);
        assert_eq!(report.duplicates, 1);
        for contact in &contacts[..20] {
            assert_eq!(sim.world().get::<Damageable>(contact.other).unwrap().total(), 1.0);
        }
    }

    #[test]
    fn test_grid_shield_generator_guards_crew_from_blasts() {
        let mut sim = CombatSim::new();
        let home = sim.spawn_grid(0.0, 0.0);
        sim.world_mut()
            .entity_mut(home)
            .insert(GridTiles::new(6, 6, 1.0, TileType::Floor));
        let generator = sim.spawn_generator(home);
        let crew = sim.spawn_target(1.0, 0.0, 0.5, 100.0);
        sim.world_mut().entity_mut(crew).insert(GridMember(home));

        assert_eq!(sim.toggle_generator(generator), Ok(true));
        let bomb = Explosive {
            radius: 4.0,
            intensity: 40.0,
            fuse: Some(0.0),
        };
        sim.world_mut().spawn((Position::new(0.0, 0.0), bomb));
        sim.tick();

        assert_eq!(sim.world().get::<Damageable>(crew).unwrap().total(), 0.0);
        let events = sim.drain_events();
        assert!(events.resistance_overrides.iter().any(|o| o.entity == crew && o.coefficient == 0.0));

        sim.on_generator_power_changed(generator, false).unwrap();
        sim.world_mut().spawn((Position::new(0.0, 0.0), bomb));
        sim.tick();
        assert!(sim.world().get::<Damageable>(crew).unwrap().total() > 0.0);
    }

    #[test]
    fn test_remote_explosive_over_own_grid_is_negated() {
        let mut sim = CombatSim::new();
        let home = sim.spawn_grid(0.0, 0.0);
        sim.world_mut()
            .entity_mut(home)
            .insert(GridTiles::new(8, 8, 1.0, TileType::Floor));
        let turret = sim
            .world_mut()
            .spawn((Position::new(-3.0, 0.0), GridMember(home), RemoteControlled))
            .id();
        let crew = sim.spawn_target(1.0, 0.0, 0.5, 100.0);
        sim.world_mut().entity_mut(crew).insert(GridMember(home));
        sim.world_mut()
            .get_mut::<Damageable>(crew)
            .unwrap()
            .damage
            .accumulate(&DamageSpecifier::single(DamageKind::Blunt, 12.0));

        let shell = Projectile::new(DamageSpecifier::single(DamageKind::Piercing, 40.0)).with_shooter(turret, Some(turret));
        let shell = sim.spawn_projectile(shell, 0.0, 0.0, 10.0, 0.0);
        sim.world_mut().entity_mut(shell).insert(Explosive {
            radius: 3.0,
            intensity: 60.0,
            fuse: None,
        });

        hit(&mut sim, shell, crew);
        assert_eq!(sim.world().get::<Damageable>(crew).unwrap().total(), 12.0);

        // Something else blasts the grid inside the protection window.
        sim.world_mut().spawn((
            Position::new(0.0, 0.0),
            Explosive {
                radius: 3.0,
                intensity: 60.0,
                fuse: Some(0.0),
            },
        ));
        sim.tick();

        assert_eq!(sim.world().get::<Damageable>(crew).unwrap().total(), 12.0);
        let tiles = sim.world().get::<GridTiles>(home).unwrap();
        assert!(tiles.cells.iter().all(|c| c.tile_type == TileType::Floor));
        assert!(!sim.world().entities().contains(shell));
    }

    #[test]
    fn test_snapshot_and_teardown() {
        let mut sim = CombatSim::new();
        let home = sim.spawn_grid(0.0, 0.0);
        let field = sim.spawn_field(home, ShieldField::new(10.0, 90.0));
        assert_eq!(sim.toggle_field(field), Ok(true));
        sim.spawn_projectile(Projectile::new(DamageSpecifier::single(DamageKind::Heat, 3.0)), 0.0, 0.0, 1.0, 0.0);
        sim.tick();

        let json = sim.snapshot_json();
        assert!(json.contains("projectiles"));
        assert!(json.contains("fields"));

        sim.teardown();
        assert!(sim.drain_events().is_empty());
        assert_eq!(sim.world().resource::<CollisionScheduler>().queued(), 0);
    }
}
