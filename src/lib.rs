//! Aegis - Projectile and Shield Combat Core
//!
//! A deterministic, fixed-timestep ECS core that turns physics contacts into
//! hits: penetration, reflection, embedding, energy-shield interaction and
//! same-origin damage negation.
//! Uses `bevy_ecs` for the entity-component-system architecture.

pub mod api;
pub mod components;
pub mod damage;
pub mod error;
pub mod events;
pub mod geometry;
pub mod spatial;
pub mod systems;
pub mod tiles;
pub mod world;

pub use api::CombatSim;
pub use components::*;
pub use damage::{DamageKind, DamageModifierSet, DamageSpecifier, Damageable, Destructible};
pub use error::{CombatError, CombatResult};
pub use events::{CandidateCollision, CombatEvents, ContactKind};
pub use spatial::{SpatialEntry, SpatialGrid};
pub use systems::*;
pub use tiles::{GridTiles, TileType};
pub use world::Snapshot;
