//! Collision resolver and batch scheduler.
//!
//! Every candidate contact goes through [`on_candidate_collision`]. While
//! the pending load is light the contact resolves inline; otherwise it is
//! queued and resolved by the next drain.
//!
//! ## Drain phases
//!
//! 1. **Gather** - dedupe by projectile, drop stale and filtered contacts,
//!    snapshot the working shield fields.
//! 2. **Compute** - shield verdicts per contact. Pure over the snapshot, so
//!    large batches fan out across rayon workers in fixed-size chunks.
//! 3. **Apply** - single-threaded, in queue order: cancellations first take
//!    effect, everything else goes to [`resolve_hit`].
//!
//! ## Parallel Feature
//!
//! With `--features parallel` (on by default) the compute phase uses
//! `par_chunks`. Without it the same chunks run sequentially; the verdicts
//! are identical either way.

use crate::components::*;
use crate::error::{CombatError, CombatResult};
use crate::events::CandidateCollision;
use crate::systems::movement::DeltaTime;
use crate::systems::performance::SimConfig;
use crate::systems::projectile::{resolve_hit, HitOutcome};
use crate::systems::shield::{
    apply_admissions, check_shield_collision, should_projectile_phase, ProjectileView, ShieldSnapshot, ShieldVerdict,
};
use bevy_ecs::prelude::*;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, trace};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// ============================================================================
// CONTACT FILTER
// ============================================================================

/// Why a contact never becomes a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    /// The other entity is the projectile's shooter or weapon.
    Shooter,
    /// Different maps.
    OtherMap,
    /// Thrown object that only collides when fired.
    NotShot,
    /// Non-hard collider.
    Soft,
    Spent,
    /// Incapacitated target the projectile was not aimed at.
    NotIntendedTarget,
    /// The entity carries no projectile behavior.
    NotAProjectile,
}

/// Check whether a contact should be ignored outright.
pub fn filter_contact(world: &World, contact: &CandidateCollision) -> Option<FilterReason> {
    let Some(projectile) = world.get::<Projectile>(contact.projectile) else {
        return Some(FilterReason::NotAProjectile);
    };
    let other = contact.other;

    if projectile.ignore_shooter && (projectile.shooter == Some(other) || projectile.weapon == Some(other)) {
        return Some(FilterReason::Shooter);
    }
    if let (Some(a), Some(b)) = (world.get::<MapId>(contact.projectile), world.get::<MapId>(other)) {
        if a != b {
            return Some(FilterReason::OtherMap);
        }
    }
    if projectile.only_collide_when_shot && projectile.weapon.is_none() {
        return Some(FilterReason::NotShot);
    }
    if world.get::<Collider>(other).is_some_and(|c| !c.hard) {
        return Some(FilterReason::Soft);
    }
    if projectile.is_spent() {
        return Some(FilterReason::Spent);
    }
    if world.get::<RequireProjectileTarget>(other).is_some_and(|r| r.active)
        && projectile.intended_target != Some(other)
    {
        return Some(FilterReason::NotIntendedTarget);
    }
    None
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// How a drained batch was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainPath {
    #[default]
    Sequential,
    Parallel,
}

/// Counters from one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub path: DrainPath,
    /// Contacts that reached the compute phase.
    pub processed: usize,
    pub cancelled: usize,
    pub duplicates: usize,
    pub stale: usize,
    pub filtered: usize,
}

/// Deferred contact queue.
#[derive(Resource, Debug, Default)]
pub struct CollisionScheduler {
    queue: VecDeque<CandidateCollision>,
    since_drain: f32,
    immediate_this_tick: usize,
    last_report: Option<DrainReport>,
}

impl CollisionScheduler {
    /// Queued plus inline-resolved contacts this tick.
    ///
    /// Inline resolutions count as load: once `immediate_floor` contacts have
    /// been handled in one tick, later contacts that tick are queued even if
    /// the queue itself is empty. The inline count resets at the start of
    /// each drain pass.
    pub fn pending_load(&self) -> usize {
        self.queue.len() + self.immediate_this_tick
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn last_report(&self) -> Option<DrainReport> {
        self.last_report
    }

    fn take_batch(&mut self) -> Vec<CandidateCollision> {
        self.since_drain = 0.0;
        self.queue.drain(..).collect()
    }
}

/// What happened to an offered contact.
#[derive(Debug, Clone, PartialEq)]
pub enum ContactOutcome {
    Filtered(FilterReason),
    /// A shield swallowed the contact.
    Cancelled,
    Enqueued,
    Resolved(HitOutcome),
}

/// Offer a contact to the resolver.
pub fn on_candidate_collision(world: &mut World, contact: CandidateCollision) -> CombatResult<ContactOutcome> {
    for entity in [contact.projectile, contact.other] {
        if !world.entities().contains(entity) {
            return Err(CombatError::StaleReference(entity));
        }
    }
    if let Some(reason) = filter_contact(world, &contact) {
        trace!(projectile = ?contact.projectile, other = ?contact.other, ?reason, "contact filtered");
        return Ok(ContactOutcome::Filtered(reason));
    }

    let floor = world
        .get_resource::<SimConfig>()
        .map(|c| c.immediate_floor)
        .unwrap_or(4);
    let mut scheduler = world.get_resource_or_insert_with(CollisionScheduler::default);
    if scheduler.pending_load() >= floor {
        scheduler.queue.push_back(contact);
        return Ok(ContactOutcome::Enqueued);
    }
    scheduler.immediate_this_tick += 1;

    if should_projectile_phase(world, contact.projectile) {
        trace!(projectile = ?contact.projectile, "contact phased");
        return Ok(ContactOutcome::Cancelled);
    }
    resolve_hit(world, &contact).map(ContactOutcome::Resolved)
}

/// Shield verdicts for a gathered batch, tagged with queue position.
#[derive(Debug, Default)]
struct DrainResults {
    verdicts: Vec<(usize, ShieldVerdict)>,
}

impl DrainResults {
    fn merge(&mut self, other: DrainResults) {
        self.verdicts.extend(other.verdicts);
    }
}

fn compute_chunk(snapshot: &ShieldSnapshot, chunk: &[(usize, ProjectileView)]) -> DrainResults {
    DrainResults {
        verdicts: chunk
            .iter()
            .map(|(index, view)| (*index, check_shield_collision(snapshot, view)))
            .collect(),
    }
}

/// Drain the queue now. `force` overrides the size-based path choice.
pub fn drain_with(world: &mut World, force: Option<DrainPath>) -> DrainReport {
    let config = world.get_resource::<SimConfig>().cloned().unwrap_or_default();
    let batch = world
        .get_resource_or_insert_with(CollisionScheduler::default)
        .take_batch();
    let mut report = DrainReport::default();

    // Gather
    let mut seen: HashSet<Entity> = HashSet::new();
    let mut contacts: Vec<CandidateCollision> = Vec::with_capacity(batch.len());
    let mut views: Vec<(usize, ProjectileView)> = Vec::with_capacity(batch.len());
    for contact in batch {
        if !seen.insert(contact.projectile) {
            report.duplicates += 1;
            continue;
        }
        if !world.entities().contains(contact.projectile) || !world.entities().contains(contact.other) {
            report.stale += 1;
            continue;
        }
        if filter_contact(world, &contact).is_some() {
            report.filtered += 1;
            continue;
        }
        let Some(view) = ProjectileView::capture(world, contact.projectile) else {
            report.stale += 1;
            continue;
        };
        views.push((contacts.len(), view));
        contacts.push(contact);
    }
    report.processed = contacts.len();
    report.path = force.unwrap_or(if contacts.len() >= config.min_parallel_batch {
        DrainPath::Parallel
    } else {
        DrainPath::Sequential
    });

    // Compute
    let snapshot = ShieldSnapshot::capture(world);
    let chunk_size = config.batch_chunk_size.max(1);
    let mut results = DrainResults::default();
    match report.path {
        DrainPath::Sequential => results.merge(compute_chunk(&snapshot, &views)),
        DrainPath::Parallel => {
            #[cfg(feature = "parallel")]
            {
                let partials: Vec<DrainResults> = views
                    .par_chunks(chunk_size)
                    .map(|chunk| compute_chunk(&snapshot, chunk))
                    .collect();
                for partial in partials {
                    results.merge(partial);
                }
            }

            #[cfg(not(feature = "parallel"))]
            for chunk in views.chunks(chunk_size) {
                results.merge(compute_chunk(&snapshot, chunk));
            }
        }
    }
    results.verdicts.sort_by_key(|(index, _)| *index);

    // Apply
    for (index, verdict) in results.verdicts {
        let contact = &contacts[index];
        if verdict.cancel {
            report.cancelled += 1;
            apply_admissions(world, &verdict.admissions);
            cancel_projectile(world, contact.projectile);
            continue;
        }
        apply_admissions(world, &verdict.admissions);
        if let Err(err) = resolve_hit(world, contact) {
            debug!(%err, "deferred hit skipped");
        }
    }

    debug!(
        path = ?report.path,
        processed = report.processed,
        cancelled = report.cancelled,
        duplicates = report.duplicates,
        stale = report.stale,
        "collision drain"
    );
    world.resource_mut::<CollisionScheduler>().last_report = Some(report);
    report
}

/// Stop a cancelled projectile: no velocity, no projectile behavior.
fn cancel_projectile(world: &mut World, projectile: Entity) {
    let Ok(mut entity) = world.get_entity_mut(projectile) else {
        return;
    };
    if let Some(mut velocity) = entity.get_mut::<Velocity>() {
        velocity.zero();
    }
    entity.remove::<Projectile>();
}

/// System that drains the queue on the time or size threshold, whichever
/// comes first.
pub fn collision_drain_system(world: &mut World) {
    let dt = world.get_resource::<DeltaTime>().map(|d| d.0).unwrap_or(0.0);
    let config = world.get_resource::<SimConfig>().cloned().unwrap_or_default();

    let due = {
        let mut scheduler = world.get_resource_or_insert_with(CollisionScheduler::default);
        scheduler.since_drain += dt;
        scheduler.immediate_this_tick = 0;
        !scheduler.queue.is_empty()
            && (scheduler.since_drain >= config.drain_interval || scheduler.queue.len() >= config.drain_size_threshold)
    };
    if due {
        drain_with(world, None);
    }
}
