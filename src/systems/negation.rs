//! Same-origin damage negation.
//!
//! Projectiles fired by a remotely controlled, grid-mounted weapon must not
//! hurt the grid they were fired from. Hits and damage changes whose target
//! sits on the projectile's origin grid are zeroed or rolled back, explosive
//! projectiles are defused, every entity on the grid is marked explosion
//! immune, and the grid's tiles are protected for a bounded window during
//! which any tile change is undone.
//!
//! ## Tile Rollback
//!
//! Original tiles are cached per protection episode: an entry is recorded
//! the first time a tile changes while its grid is protected and is purged
//! when the grid's protection lapses or the entry outlives the protection
//! duration, whichever comes first. Re-protecting a grid before it lapses
//! extends the episode.
//!
//! ## Data Access
//! - Reads: Projectile, GridMember, Grid, RemoteControlled, Explosive, SimClock
//! - Writes: Damageable, GridTiles, ExplosionImmune, DeletionQueue

use crate::components::*;
use crate::damage::{set_damage, DamageChange, DamageSpecifier};
use crate::systems::destruction::queue_deletion;
use crate::systems::performance::{SimClock, SimConfig};
use crate::tiles::{GridTiles, TileChanged, TileType};
use bevy_ecs::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, trace, warn};

/// Cached pre-damage tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedTile {
    pub tile: TileType,
    pub recorded_at: f64,
}

/// A tile waiting to be put back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileRestore {
    pub grid: Entity,
    pub index: (usize, usize),
    pub original: TileType,
}

/// Bookkeeping for same-origin negation.
#[derive(Resource, Debug, Default)]
pub struct SameOriginNegation {
    /// Projectile -> grid of the weapon that fired it.
    sources: HashMap<Entity, Entity>,
    same_grid_hits: HashMap<Entity, u32>,
    /// Defused projectile -> grid it was defused over.
    defused: HashMap<Entity, Entity>,
    exempt: HashSet<Entity>,
    /// Grid -> protection expiry (seconds of sim time).
    protected_grids: HashMap<Entity, f64>,
    original_tiles: HashMap<(Entity, (usize, usize)), CachedTile>,
    tiles_to_restore: Mutex<Vec<TileRestore>>,
}

impl SameOriginNegation {
    pub fn source_of(&self, projectile: Entity) -> Option<Entity> {
        self.sources.get(&projectile).copied()
    }

    pub fn is_tracked(&self, projectile: Entity) -> bool {
        self.sources.contains_key(&projectile)
    }

    pub fn is_exempt(&self, entity: Entity) -> bool {
        self.exempt.contains(&entity)
    }

    pub fn is_defused(&self, projectile: Entity) -> bool {
        self.defused.contains_key(&projectile)
    }

    pub fn is_grid_protected(&self, grid: Entity, now: f64) -> bool {
        self.protected_grids.get(&grid).is_some_and(|expiry| now < *expiry)
    }

    pub fn cached_tile_count(&self) -> usize {
        self.original_tiles.len()
    }

    pub fn pending_restore_count(&self) -> usize {
        self.lock_restores().len()
    }

    fn lock_restores(&self) -> std::sync::MutexGuard<'_, Vec<TileRestore>> {
        self.tiles_to_restore.lock().unwrap_or_else(|poisoned| {
            warn!("tile restore list lock was poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn push_restore(&self, restore: TileRestore) {
        self.lock_restores().push(restore);
    }

    fn take_restores(&self) -> Vec<TileRestore> {
        std::mem::take(&mut *self.lock_restores())
    }

    /// Start or extend a protection episode.
    fn protect(&mut self, grid: Entity, now: f64, duration: f32) {
        if !self.is_grid_protected(grid, now) {
            self.original_tiles.retain(|(g, _), _| *g != grid);
        }
        self.protected_grids.insert(grid, now + duration as f64);
    }

    fn record_hit(&mut self, projectile: Entity) -> u32 {
        let count = self.same_grid_hits.entry(projectile).or_insert(0);
        *count += 1;
        *count
    }
}

fn negation(world: &mut World) -> Mut<'_, SameOriginNegation> {
    world.get_resource_or_insert_with(SameOriginNegation::default)
}

fn now(world: &World) -> f64 {
    world.get_resource::<SimClock>().map(|c| c.elapsed).unwrap_or(0.0)
}

fn protection_duration(world: &World) -> f32 {
    world
        .get_resource::<SimConfig>()
        .map(|c| c.protection_duration)
        .unwrap_or(10.0)
}

/// Grid an entity sits on; a grid is on itself.
pub fn grid_of(world: &World, entity: Entity) -> Option<Entity> {
    if world.get::<Grid>(entity).is_some() {
        return Some(entity);
    }
    world.get::<GridMember>(entity).map(|member| member.0)
}

/// Grid of the remotely controlled weapon that fired `projectile`.
///
/// Falls back to the shooter when no weapon is recorded and the shooter is
/// itself the remote weapon.
pub fn remote_weapon_grid(world: &World, projectile: Entity) -> Option<Entity> {
    let p = world.get::<Projectile>(projectile)?;
    let weapon = match (p.weapon, p.shooter) {
        (Some(weapon), _) => weapon,
        (None, Some(shooter)) => shooter,
        (None, None) => return None,
    };
    world.get::<RemoteControlled>(weapon)?;
    world.get::<GridMember>(weapon).map(|member| member.0)
}

/// Record a new projectile's origin grid if its weapon is remotely controlled.
pub fn register_projectile(world: &mut World, projectile: Entity) -> Option<Entity> {
    let grid = remote_weapon_grid(world, projectile)?;
    if let Some(mut p) = world.get_mut::<Projectile>(projectile) {
        p.origin_grid.get_or_insert(grid);
    }
    let mut state = negation(world);
    state.sources.insert(projectile, grid);
    state.same_grid_hits.entry(projectile).or_insert(0);
    trace!(?projectile, ?grid, "registered remote projectile");
    Some(grid)
}

/// Tracked source grid, registering lazily if creation-time registration was missed.
fn source_grid(world: &mut World, projectile: Entity) -> Option<Entity> {
    if let Some(grid) = world
        .get_resource::<SameOriginNegation>()
        .and_then(|state| state.source_of(projectile))
    {
        return Some(grid);
    }
    register_projectile(world, projectile)
}

fn mark_exempt(world: &mut World, entity: Entity, projectile: Entity) {
    if !world.entities().contains(entity) {
        return;
    }
    if world.get::<ExplosionImmune>(entity).is_none() {
        world.entity_mut(entity).insert(ExplosionImmune {
            source_projectile: projectile,
        });
    }
    negation(world).exempt.insert(entity);
}

fn protect_grid(world: &mut World, grid: Entity) {
    if world.get::<Grid>(grid).is_none() {
        return;
    }
    let (now, duration) = (now(world), protection_duration(world));
    negation(world).protect(grid, now, duration);
    trace!(?grid, "grid tiles protected");
}

/// Shared tail of a same-grid hit: defuse, count, exempt, protect.
fn negate_same_grid(world: &mut World, projectile: Entity, target: Entity, grid: Entity) {
    prevent_explosions(world, projectile, grid);
    if negation(world).record_hit(projectile) > 1 {
        debug!(?projectile, "repeat same-grid hit, deleting projectile");
        queue_deletion(world, projectile);
    }
    mark_exempt(world, target, projectile);
    protect_grid(world, grid);
}

/// Called before a hit's damage lands. Zeroes `payload` for same-grid hits.
/// Returns true if the hit was negated.
pub fn on_projectile_hit(world: &mut World, projectile: Entity, target: Entity, payload: &mut DamageSpecifier) -> bool {
    let Some(source) = source_grid(world, projectile) else {
        return false;
    };
    if grid_of(world, target) != Some(source) {
        return false;
    }

    debug!(?projectile, ?target, grid = ?source, "negating same-grid hit");
    payload.clear();
    negate_same_grid(world, projectile, target, source);
    true
}

/// Called after damage changed. Rolls back increases caused by a tracked
/// projectile on its own grid. Returns true if rolled back.
pub fn on_damage_changed(world: &mut World, change: &DamageChange) -> bool {
    let Some(origin) = change.origin else {
        return false;
    };
    if !change.increased() || !world.entities().contains(origin) || world.get::<Projectile>(origin).is_none() {
        return false;
    }
    let Some(source) = source_grid(world, origin) else {
        return false;
    };
    if grid_of(world, change.target) != Some(source) {
        return false;
    }

    debug!(target = ?change.target, projectile = ?origin, "rolling back same-grid damage");
    set_damage(world, change.target, change.previous.clone());
    negate_same_grid(world, origin, change.target, source);
    true
}

/// Defuse an explosive remote projectile over `grid`: immunize the whole
/// grid, clear the payload and queue the projectile for deletion.
pub fn prevent_explosions(world: &mut World, projectile: Entity, grid: Entity) {
    if world.get::<Explosive>(projectile).is_none() || remote_weapon_grid(world, projectile).is_none() {
        return;
    }

    negation(world).defused.insert(projectile, grid);
    protect_grid(world, grid);

    let mut query = world.query::<(Entity, &GridMember)>();
    let mut on_grid: Vec<Entity> = query
        .iter(world)
        .filter(|(_, member)| member.0 == grid)
        .map(|(entity, _)| entity)
        .collect();
    on_grid.sort();
    for entity in on_grid {
        mark_exempt(world, entity, projectile);
    }
    mark_exempt(world, projectile, projectile);

    if let Some(mut p) = world.get_mut::<Projectile>(projectile) {
        p.damage.clear();
    }
    queue_deletion(world, projectile);
    debug!(?projectile, ?grid, "defused same-grid explosive");
}

/// Blast damage coefficient for an explosion from `source`.
pub fn before_explode(world: &World, source: Entity) -> f32 {
    match world.get_resource::<SameOriginNegation>() {
        Some(state) if state.is_defused(source) || state.is_exempt(source) => 0.0,
        _ => 1.0,
    }
}

/// Cache and queue a rollback for tile changes on protected grids.
pub fn on_tile_changed(world: &mut World, change: &TileChanged) {
    let now = now(world);
    let mut state = negation(world);
    if !state.is_grid_protected(change.grid, now) {
        return;
    }

    let destroyed = !change.old.is_empty() && change.new.is_empty();
    let retyped = !change.old.is_empty() && !change.new.is_empty() && change.old != change.new;
    if !destroyed && !retyped {
        return;
    }

    let original = state
        .original_tiles
        .entry((change.grid, change.index))
        .or_insert(CachedTile {
            tile: change.old,
            recorded_at: now,
        })
        .tile;
    state.push_restore(TileRestore {
        grid: change.grid,
        index: change.index,
        original,
    });
}

/// Restore protected tiles, forget dead projectiles and expire protections.
pub fn negation_update_system(world: &mut World) {
    if world.get_resource::<SameOriginNegation>().is_none() {
        return;
    }
    let now = now(world);
    let duration = protection_duration(world) as f64;

    let restores = negation(world).take_restores();
    for restore in restores {
        if !negation(world).is_grid_protected(restore.grid, now) {
            continue;
        }
        let Some(mut tiles) = world.get_mut::<GridTiles>(restore.grid) else {
            continue;
        };
        let (x, y) = restore.index;
        if tiles.get(x, y).is_some_and(|current| current != restore.original) {
            tiles.set(x, y, restore.original);
            trace!(grid = ?restore.grid, x, y, "restored tile");
        }
    }

    let stale_immunity: Vec<Entity> = {
        let mut query = world.query::<(Entity, &ExplosionImmune)>();
        query
            .iter(world)
            .filter(|(_, immune)| !world.entities().contains(immune.source_projectile))
            .map(|(entity, _)| entity)
            .collect()
    };
    for entity in &stale_immunity {
        world.entity_mut(*entity).remove::<ExplosionImmune>();
    }

    let known: Vec<Entity> = {
        let state = negation(world);
        state
            .sources
            .keys()
            .chain(state.exempt.iter())
            .chain(state.defused.keys())
            .copied()
            .collect()
    };
    let alive: HashSet<Entity> = known
        .into_iter()
        .filter(|e| world.entities().contains(*e))
        .collect();

    let mut state = negation(world);
    state.sources.retain(|e, _| alive.contains(e));
    state.same_grid_hits.retain(|e, _| alive.contains(e));
    state.defused.retain(|e, _| alive.contains(e));
    for entity in &stale_immunity {
        state.exempt.remove(entity);
    }
    state.exempt.retain(|e| alive.contains(e));

    let expired: Vec<Entity> = state
        .protected_grids
        .iter()
        .filter(|(_, expiry)| **expiry <= now)
        .map(|(grid, _)| *grid)
        .collect();
    for grid in &expired {
        state.protected_grids.remove(grid);
        debug!(?grid, "tile protection expired");
    }
    state
        .original_tiles
        .retain(|(grid, _), cached| !expired.contains(grid) && now - cached.recorded_at < duration);
}
