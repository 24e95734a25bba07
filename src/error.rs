//! Recoverable error conditions raised inside the resolution core.
//!
//! None of these are fatal to a simulation step. Systems log them and drop the
//! unit of work; the next tick naturally retries anything still applicable.

use bevy_ecs::prelude::*;
use thiserror::Error;

/// Errors produced by projectile, shield and negation operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CombatError {
    /// An entity referenced by deferred work no longer exists.
    #[error("entity {0:?} no longer exists")]
    StaleReference(Entity),
    /// Geometry that cannot be evaluated this tick (zero ray, zero radius).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(&'static str),
    /// Ordered release work stalled and had to be forced through.
    #[error("dependency cycle left {remaining} entities unordered")]
    DependencyCycle { remaining: usize },
    /// The entity does not carry the embeddable configuration required.
    #[error("entity {0:?} is not an embeddable projectile")]
    NotEmbeddable(Entity),
    /// The embedded entity cannot be pulled out (no removal time).
    #[error("entity {0:?} cannot be removed")]
    Unremovable(Entity),
    /// A shield field refused a state or parameter change.
    #[error("shield field {field:?} rejected change: {reason}")]
    FieldRejected { field: Entity, reason: &'static str },
}

/// Convenience alias used across the systems.
pub type CombatResult<T> = Result<T, CombatError>;

/// Fail with [`CombatError::StaleReference`] unless `entity` is alive.
pub fn ensure_exists(world: &World, entity: Entity) -> CombatResult<()> {
    if world.entities().contains(entity) {
        Ok(())
    } else {
        Err(CombatError::StaleReference(entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_exists_tracks_despawn() {
        let mut world = World::new();
        let e = world.spawn_empty().id();
        assert!(ensure_exists(&world, e).is_ok());

        world.despawn(e);
        assert_eq!(ensure_exists(&world, e), Err(CombatError::StaleReference(e)));
    }

    #[test]
    fn test_error_messages() {
        let err = CombatError::DependencyCycle { remaining: 3 };
        assert_eq!(err.to_string(), "dependency cycle left 3 entities unordered");
        let err = CombatError::InvalidGeometry("zero radius");
        assert_eq!(err.to_string(), "invalid geometry: zero radius");
    }
}
