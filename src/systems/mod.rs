//! ECS systems for the combat core.
//!
//! Systems contain the resolution logic that operates on components.
//!
//! ## Tick Order
//!
//! All systems run chained, in this order:
//!
//! **Group 1 (Spatial)** - Rebuild lookup data:
//! - `spatial_grid_update_system` - Rebuilds the collider grid
//! - `shield_geometry_system` - Rebuilds dirty field outlines
//!
//! **Group 2 (Motion)** - Sweep before integrating:
//! - `raycast_sweep_system` - Catches fast projectiles before they tunnel
//! - `movement_system` - Applies velocity to position
//! - `attachment_follow_system` - Carries embedded entities with their hosts
//!
//! **Group 3 (Resolution)** - Contacts to hits:
//! - `contact_detection_system` - Reports new projectile contacts
//! - `shield_contact_system` - Fires field enter callbacks
//! - `collision_drain_system` - Resolves the deferred batch
//! - `shield_update_system` - Runs effect updates, decays surge
//! - `grid_shield_system` - Re-marks entities on shielded grids
//!
//! **Group 4 (Aftermath)**:
//! - `explosive_fuse_system`, `explosion_system`
//! - `negation_update_system` - Restores protected tiles
//! - `embed_removal_system`, `lifetime_system`
//! - `destroyed_check_system`, `deletion_system` - Always last

pub mod collision;
pub mod contacts;
pub mod destruction;
pub mod embedding;
pub mod explosion;
pub mod grid_shield;
pub mod movement;
pub mod negation;
pub mod performance;
pub mod projectile;
pub mod raycast;
pub mod shield;
pub mod shield_effects;

pub use collision::{collision_drain_system, on_candidate_collision, CollisionScheduler, ContactOutcome, DrainPath, DrainReport};
pub use contacts::{contact_detection_system, ActiveContacts};
pub use destruction::{deletion_system, destroyed_check_system, queue_deletion, DeletionQueue};
pub use embedding::{embed_removal_system, release_embedded, ReleaseReport};
pub use explosion::{explosion_system, explosive_fuse_system, ExplosionQueue};
pub use grid_shield::{
    grid_shield_system, perimeter_cells, refresh_protection, set_generator_anchored, set_generator_powered,
    toggle_generator,
};
pub use movement::*;
pub use negation::{negation_update_system, SameOriginNegation};
pub use performance::*;
pub use projectile::{lifetime_system, resolve_hit, HitOutcome, HitReport};
pub use raycast::raycast_sweep_system;
pub use shield::{shield_contact_system, shield_geometry_system, shield_update_system, should_projectile_phase};
pub use shield_effects::{ShieldEffect, TempSpeedChangeEffect};
