//! Grid shield generators - hull-wide explosion protection.
//!
//! An enabled generator that is powered and anchored raises fields along its
//! grid's perimeter and registers itself in the grid's
//! [`GridShieldProtection`]. While at least one registered generator has its
//! fields up, every other entity on that grid carries [`GridShieldProtected`]
//! and takes no explosion damage.
//!
//! Markers are reconciled immediately on any generator change and again on a
//! fixed interval, which picks up entities that moved between grids.
//!
//! ## Data Access
//! - Reads: `GridMember`, `GridTiles`, `SimConfig`, `DeltaTime`
//! - Writes: `GridShieldGenerator`, `GridShieldProtection`, `GridShieldProtected`

use crate::components::*;
use crate::error::{CombatError, CombatResult};
use crate::systems::movement::DeltaTime;
use crate::systems::performance::SimConfig;
use crate::tiles::GridTiles;
use bevy_ecs::prelude::*;
use std::collections::HashSet;
use tracing::{debug, trace};

const ORTHOGONAL: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];
const DIAGONAL: [(i32, i32); 4] = [(1, 1), (1, -1), (-1, 1), (-1, -1)];

/// Time since the last protection sweep.
#[derive(Resource, Debug, Default)]
pub struct GridShieldTimer {
    since_refresh: f32,
}

/// Empty cells bordering the grid's built tiles, in row-major scan order.
///
/// Every empty orthogonal neighbour qualifies. An empty diagonal neighbour
/// qualifies only when one of the two cells between it and the tile is built.
pub fn perimeter_cells(tiles: &GridTiles) -> Vec<(i32, i32)> {
    let built: Vec<(i32, i32)> = (0..tiles.height)
        .flat_map(|y| (0..tiles.width).map(move |x| (x, y)))
        .filter(|&(x, y)| tiles.get(x, y).is_some_and(|t| !t.is_empty()))
        .map(|(x, y)| (x as i32, y as i32))
        .collect();
    let lookup: HashSet<(i32, i32)> = built.iter().copied().collect();

    let mut seen = HashSet::new();
    let mut cells = Vec::new();
    for &(x, y) in &built {
        for (dx, dy) in ORTHOGONAL {
            let cell = (x + dx, y + dy);
            if !lookup.contains(&cell) && seen.insert(cell) {
                cells.push(cell);
            }
        }
        for (dx, dy) in DIAGONAL {
            let cell = (x + dx, y + dy);
            if lookup.contains(&cell) || seen.contains(&cell) {
                continue;
            }
            if lookup.contains(&(cell.0, y)) || lookup.contains(&(x, cell.1)) {
                seen.insert(cell);
                cells.push(cell);
            }
        }
    }
    cells
}

fn generator_mut<'w>(world: &'w mut World, generator: Entity) -> CombatResult<Mut<'w, GridShieldGenerator>> {
    world
        .get_mut::<GridShieldGenerator>(generator)
        .ok_or(CombatError::StaleReference(generator))
}

/// Raise or drop the generator's fields to match its state, then update the
/// grid registration and entity markers. Returns whether fields are up.
fn sync_fields(world: &mut World, generator: Entity) -> CombatResult<bool> {
    let can_generate = world
        .get::<GridShieldGenerator>(generator)
        .ok_or(CombatError::StaleReference(generator))?
        .can_generate();
    let grid = world.get::<GridMember>(generator).map(|m| m.0);

    let fields = match grid {
        Some(grid) if can_generate => world.get::<GridTiles>(grid).map(perimeter_cells).unwrap_or_default(),
        _ => Vec::new(),
    };
    let active = !fields.is_empty();
    if can_generate && !active {
        debug!(?generator, "no perimeter to raise fields on");
    }

    let mut state = generator_mut(world, generator)?;
    trace!(?generator, fields = fields.len(), "generator fields synced");
    state.fields = fields;
    state.fields_active = active;

    if let Some(grid) = grid {
        if active {
            match world.get_mut::<GridShieldProtection>(grid) {
                Some(mut protection) => {
                    protection.active_generators.insert(generator);
                }
                None => {
                    world.entity_mut(grid).insert(GridShieldProtection {
                        active_generators: HashSet::from([generator]),
                    });
                }
            }
        } else {
            unregister(world, grid, generator);
        }
    }

    refresh_protection(world);
    Ok(active)
}

fn unregister(world: &mut World, grid: Entity, generator: Entity) {
    let empty = match world.get_mut::<GridShieldProtection>(grid) {
        Some(mut protection) => {
            protection.active_generators.remove(&generator);
            protection.active_generators.is_empty()
        }
        None => return,
    };
    if empty {
        world.entity_mut(grid).remove::<GridShieldProtection>();
    }
}

/// Flip the operator switch. Returns the new enabled state.
///
/// Switching on requires power and an anchor.
pub fn toggle_generator(world: &mut World, generator: Entity) -> CombatResult<bool> {
    let mut state = generator_mut(world, generator)?;
    if !state.enabled && !state.anchored {
        return Err(CombatError::FieldRejected { field: generator, reason: "not anchored" });
    }
    if !state.enabled && !state.powered {
        return Err(CombatError::FieldRejected { field: generator, reason: "not powered" });
    }
    state.enabled = !state.enabled;
    let enabled = state.enabled;
    sync_fields(world, generator)?;
    Ok(enabled)
}

/// Power-changed signal. The switch position survives an outage.
pub fn set_generator_powered(world: &mut World, generator: Entity, powered: bool) -> CombatResult<()> {
    generator_mut(world, generator)?.powered = powered;
    sync_fields(world, generator).map(|_| ())
}

/// Anchor-changed signal. Unanchoring drops the fields.
pub fn set_generator_anchored(world: &mut World, generator: Entity, anchored: bool) -> CombatResult<()> {
    generator_mut(world, generator)?.anchored = anchored;
    sync_fields(world, generator).map(|_| ())
}

/// Tear down a generator that is being removed.
pub fn remove_generator(world: &mut World, generator: Entity) {
    let Some(mut state) = world.get_mut::<GridShieldGenerator>(generator) else {
        return;
    };
    state.fields.clear();
    state.fields_active = false;
    if let Some(grid) = world.get::<GridMember>(generator).map(|m| m.0) {
        unregister(world, grid, generator);
    }
    refresh_protection(world);
}

/// Reconcile grid registrations and entity markers.
///
/// Registered generators that are gone, dark or moved to another grid are
/// dropped first; a grid left with none loses its protection component.
pub fn refresh_protection(world: &mut World) {
    let mut registrations = world.query::<(Entity, &GridShieldProtection)>();
    let registered: Vec<(Entity, Vec<Entity>)> = registrations
        .iter(world)
        .map(|(grid, protection)| (grid, protection.active_generators.iter().copied().collect()))
        .collect();

    let mut protected_grids = HashSet::new();
    for (grid, generators) in registered {
        let live: HashSet<Entity> = generators
            .into_iter()
            .filter(|generator| {
                world.get::<GridShieldGenerator>(*generator).is_some_and(|g| g.fields_active)
                    && world.get::<GridMember>(*generator).is_some_and(|m| m.0 == grid)
            })
            .collect();
        if live.is_empty() {
            world.entity_mut(grid).remove::<GridShieldProtection>();
            continue;
        }
        protected_grids.insert(grid);
        if let Some(mut protection) = world.get_mut::<GridShieldProtection>(grid) {
            protection.active_generators = live;
        }
    }

    let mut entities = world.query::<(
        Entity,
        Option<&GridMember>,
        Option<&GridShieldGenerator>,
        Option<&GridShieldProtected>,
    )>();
    let mut grant = Vec::new();
    let mut revoke = Vec::new();
    for (entity, member, generator, marker) in entities.iter(world) {
        let protect = generator.is_none() && member.is_some_and(|m| protected_grids.contains(&m.0));
        match (protect, marker.is_some()) {
            (true, false) => grant.push(entity),
            (false, true) => revoke.push(entity),
            _ => {}
        }
    }

    for entity in &grant {
        world.entity_mut(*entity).insert(GridShieldProtected);
    }
    for entity in &revoke {
        world.entity_mut(*entity).remove::<GridShieldProtected>();
    }
    if !grant.is_empty() || !revoke.is_empty() {
        debug!(granted = grant.len(), revoked = revoke.len(), grids = protected_grids.len(), "grid shield protection updated");
    }
}

/// System that re-marks protected entities every `grid_shield_refresh_interval`.
pub fn grid_shield_system(world: &mut World) {
    let dt = world.get_resource::<DeltaTime>().map(|d| d.0).unwrap_or(0.0);
    let interval = world
        .get_resource::<SimConfig>()
        .map(|c| c.grid_shield_refresh_interval)
        .unwrap_or(1.0);

    let due = {
        let mut timer = world.get_resource_or_insert_with(GridShieldTimer::default);
        timer.since_refresh += dt;
        if timer.since_refresh >= interval {
            timer.since_refresh = 0.0;
            true
        } else {
            false
        }
    };
    if due {
        refresh_protection(world);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::destruction::{deletion_system, queue_deletion, DeletionQueue};
    use crate::tiles::TileType;

    fn shield_world() -> World {
        let mut world = World::new();
        world.insert_resource(SimConfig::default());
        world.insert_resource(DeltaTime(0.5));
        world.init_resource::<DeletionQueue>();
        world
    }

    fn hull(world: &mut World, x: f32) -> Entity {
        world
            .spawn((GridBundle::new(x, 0.0), GridTiles::new(4, 4, 1.0, TileType::Floor)))
            .id()
    }

    fn generator(world: &mut World, grid: Entity) -> Entity {
        world.spawn((GridShieldGenerator::new(), GridMember(grid))).id()
    }

    fn crew(world: &mut World, grid: Entity) -> Entity {
        world.spawn((TargetBundle::new(0.0, 0.0, 0.5, 100.0), GridMember(grid))).id()
    }

    fn protected(world: &World, entity: Entity) -> bool {
        world.get::<GridShieldProtected>(entity).is_some()
    }

    #[test]
    fn test_single_tile_perimeter() {
        let tiles = GridTiles::new(1, 1, 1.0, TileType::Plating);
        let mut cells = perimeter_cells(&tiles);
        cells.sort();
        assert_eq!(cells, vec![(-1, 0), (0, -1), (0, 1), (1, 0)]);
    }

    #[test]
    fn test_inner_corner_gets_diagonal_field() {
        // L-shape: (0,0), (1,0), (0,1). (1,1) sits in the notch.
        let mut tiles = GridTiles::new(2, 2, 1.0, TileType::Floor);
        tiles.set(1, 1, TileType::Empty);
        let cells = perimeter_cells(&tiles);
        assert!(cells.contains(&(1, 1)));
        // Bare outer diagonal of the corner tile: no adjacent built cell.
        assert!(!cells.contains(&(-1, -1)));
        let unique: HashSet<_> = cells.iter().collect();
        assert_eq!(unique.len(), cells.len());
    }

    #[test]
    fn test_turn_on_protects_grid_members_only() {
        let mut world = shield_world();
        let home = hull(&mut world, 0.0);
        let other = hull(&mut world, 50.0);
        let gen = generator(&mut world, home);
        let ours = crew(&mut world, home);
        let theirs = crew(&mut world, other);
        let drifting = world.spawn(TargetBundle::new(20.0, 0.0, 0.5, 100.0)).id();

        assert_eq!(toggle_generator(&mut world, gen), Ok(true));

        let state = world.get::<GridShieldGenerator>(gen).unwrap();
        assert!(state.fields_active);
        assert_eq!(state.fields.len(), 16);
        assert!(world.get::<GridShieldProtection>(home).unwrap().active_generators.contains(&gen));
        assert!(protected(&world, ours));
        assert!(!protected(&world, gen));
        assert!(!protected(&world, theirs));
        assert!(!protected(&world, drifting));

        assert_eq!(toggle_generator(&mut world, gen), Ok(false));
        assert!(!protected(&world, ours));
        assert!(world.get::<GridShieldProtection>(home).is_none());
        assert!(world.get::<GridShieldGenerator>(gen).unwrap().fields.is_empty());
    }

    #[test]
    fn test_outage_drops_and_restores_protection() {
        let mut world = shield_world();
        let home = hull(&mut world, 0.0);
        let gen = generator(&mut world, home);
        let ours = crew(&mut world, home);
        toggle_generator(&mut world, gen).unwrap();

        set_generator_powered(&mut world, gen, false).unwrap();
        assert!(!protected(&world, ours));
        assert!(world.get::<GridShieldGenerator>(gen).unwrap().enabled);

        set_generator_powered(&mut world, gen, true).unwrap();
        assert!(protected(&world, ours));

        set_generator_anchored(&mut world, gen, false).unwrap();
        assert!(!protected(&world, ours));
    }

    #[test]
    fn test_switch_on_requires_anchor_and_power() {
        let mut world = shield_world();
        let home = hull(&mut world, 0.0);
        let gen = generator(&mut world, home);
        world.get_mut::<GridShieldGenerator>(gen).unwrap().anchored = false;
        assert!(matches!(
            toggle_generator(&mut world, gen),
            Err(CombatError::FieldRejected { reason: "not anchored", .. })
        ));

        set_generator_anchored(&mut world, gen, true).unwrap();
        set_generator_powered(&mut world, gen, false).unwrap();
        assert!(matches!(
            toggle_generator(&mut world, gen),
            Err(CombatError::FieldRejected { reason: "not powered", .. })
        ));
        assert!(!world.get::<GridShieldGenerator>(gen).unwrap().enabled);
    }

    #[test]
    fn test_grid_without_tiles_is_not_protected() {
        let mut world = shield_world();
        let bare = world.spawn(GridBundle::new(0.0, 0.0)).id();
        let gen = generator(&mut world, bare);
        let ours = crew(&mut world, bare);

        assert_eq!(toggle_generator(&mut world, gen), Ok(true));
        assert!(!world.get::<GridShieldGenerator>(gen).unwrap().fields_active);
        assert!(!protected(&world, ours));
    }

    #[test]
    fn test_periodic_sweep_follows_grid_changes() {
        let mut world = shield_world();
        let home = hull(&mut world, 0.0);
        let other = hull(&mut world, 50.0);
        let gen = generator(&mut world, home);
        let walker = crew(&mut world, other);
        toggle_generator(&mut world, gen).unwrap();
        assert!(!protected(&world, walker));

        world.entity_mut(walker).insert(GridMember(home));
        grid_shield_system(&mut world);
        assert!(!protected(&world, walker), "sweep runs on the interval");
        grid_shield_system(&mut world);
        assert!(protected(&world, walker));

        world.entity_mut(walker).remove::<GridMember>();
        grid_shield_system(&mut world);
        grid_shield_system(&mut world);
        assert!(!protected(&world, walker));
    }

    #[test]
    fn test_removed_generator_releases_grid() {
        let mut world = shield_world();
        let home = hull(&mut world, 0.0);
        let gen = generator(&mut world, home);
        let ours = crew(&mut world, home);
        toggle_generator(&mut world, gen).unwrap();
        assert!(protected(&world, ours));

        queue_deletion(&mut world, gen);
        deletion_system(&mut world);

        assert!(!world.entities().contains(gen));
        assert!(!protected(&world, ours));
        assert!(world.get::<GridShieldProtection>(home).is_none());
    }
}
