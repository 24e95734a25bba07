//! Movement system - integrates free bodies and carries attached ones.

use crate::components::*;
use crate::geometry::rotate;
use bevy_ecs::prelude::*;

/// Resource containing the delta time for the current tick.
#[derive(Resource, Default)]
pub struct DeltaTime(pub f32);

/// System that applies velocity to position for free dynamic bodies.
/// Static and attached bodies are left where they are.
pub fn movement_system(
    dt: Res<DeltaTime>,
    mut query: Query<(&mut Position, &Velocity, Option<&BodyKind>), Without<AttachedTo>>,
) {
    let delta = dt.0;
    for (mut pos, vel, body) in query.iter_mut() {
        if matches!(body, Some(BodyKind::Static)) {
            continue;
        }
        pos.x += vel.vx * delta;
        pos.y += vel.vy * delta;
    }
}

/// Keep attached entities at their offset in the parent's frame.
pub fn attachment_follow_system(
    parents: Query<(&Position, Option<&Rotation>), Without<AttachedTo>>,
    mut attached: Query<(&AttachedTo, &mut Position)>,
) {
    for (attachment, mut pos) in attached.iter_mut() {
        let Ok((parent_pos, parent_rot)) = parents.get(attachment.parent) else {
            continue;
        };
        let offset = rotate(attachment.offset, parent_rot.map(|r| r.0).unwrap_or(0.0));
        pos.x = parent_pos.x + offset.0;
        pos.y = parent_pos.y + offset.1;
    }
}
