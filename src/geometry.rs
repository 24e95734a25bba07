//! Planar geometry helpers: angles, sectors, rays and shield outlines.

use std::f32::consts::TAU;

/// Width (degrees) at or above which a field is treated as a full circle.
pub const FULL_CIRCLE_DEGREES: f32 = 359.0;
/// Minimum ring points generated for a full-circle outline.
pub const FULL_CIRCLE_MIN_POINTS: usize = 30;
/// Scale applied to the closing vertex so the loop has no zero-area seam.
pub const SEAM_SCALE: f32 = 0.999;

/// Wrap an angle into `[0, TAU)`.
#[inline]
pub fn normalize_angle(angle: f32) -> f32 {
    let wrapped = angle.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs
    if wrapped >= TAU {
        0.0
    } else {
        wrapped
    }
}

/// Whether `angle` lies in the half-open sector `[start, start + width)`.
pub fn angle_in_sector(angle: f32, start: f32, width: f32) -> bool {
    if width <= 0.0 {
        return false;
    }
    if width >= TAU {
        return true;
    }
    normalize_angle(angle - start) < width
}

#[inline]
pub fn rotate(v: (f32, f32), angle: f32) -> (f32, f32) {
    let (sin, cos) = angle.sin_cos();
    (v.0 * cos - v.1 * sin, v.0 * sin + v.1 * cos)
}

#[inline]
pub fn length(v: (f32, f32)) -> f32 {
    (v.0 * v.0 + v.1 * v.1).sqrt()
}

/// Bearing of a vector in radians.
#[inline]
pub fn bearing(v: (f32, f32)) -> f32 {
    v.1.atan2(v.0)
}

/// Distance along a ray at which it first enters a circle.
///
/// `dir` must be normalized. Returns `None` when the circle is missed, lies
/// beyond `max_distance`, or already contains the ray origin (an existing
/// contact, not a new one).
pub fn ray_circle_intersection(
    origin: (f32, f32),
    dir: (f32, f32),
    max_distance: f32,
    center: (f32, f32),
    radius: f32,
) -> Option<f32> {
    let m = (origin.0 - center.0, origin.1 - center.1);
    let c = m.0 * m.0 + m.1 * m.1 - radius * radius;
    if c <= 0.0 {
        return None;
    }
    let b = m.0 * dir.0 + m.1 * dir.1;
    if b > 0.0 {
        return None;
    }
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let t = -b - disc.sqrt();
    if t > max_distance {
        None
    } else {
        Some(t.max(0.0))
    }
}

/// Outline of a shield field as a looped triangle fan around the origin.
///
/// Full circles (width >= 359 degrees) get `max(30, extra_arc_points)` ring
/// points after the center vertex, closed by a copy of the first ring point
/// scaled by [`SEAM_SCALE`]. Sectors get the center, `2 + extra_arc_points`
/// points spanning `[angle - width/2, angle + width/2]`, and the center again.
pub fn generate_cone_vertices(
    radius: f32,
    angle: f32,
    width: f32,
    extra_arc_points: usize,
) -> Vec<(f32, f32)> {
    if width.to_degrees() >= FULL_CIRCLE_DEGREES {
        let total = FULL_CIRCLE_MIN_POINTS.max(extra_arc_points);
        let step = TAU / total as f32;
        let mut vertices = Vec::with_capacity(total + 2);
        vertices.push((0.0, 0.0));
        for i in 0..total {
            let a = step * i as f32;
            vertices.push((a.cos() * radius, a.sin() * radius));
        }
        let first = vertices[1];
        vertices.push((first.0 * SEAM_SCALE, first.1 * SEAM_SCALE));
        return vertices;
    }

    let arc_points = 2 + extra_arc_points;
    let start = angle - width / 2.0;
    let step = width / (arc_points - 1) as f32;
    let mut vertices = Vec::with_capacity(arc_points + 2);
    vertices.push((0.0, 0.0));
    for i in 0..arc_points {
        let a = start + step * i as f32;
        vertices.push((a.cos() * radius, a.sin() * radius));
    }
    vertices.push((0.0, 0.0));
    vertices
}

/// [`generate_cone_vertices`] translated by `center_offset`.
pub fn generate_cone_vertices_with_offset(
    radius: f32,
    angle: f32,
    width: f32,
    center_offset: (f32, f32),
    extra_arc_points: usize,
) -> Vec<(f32, f32)> {
    generate_cone_vertices(radius, angle, width, extra_arc_points)
        .into_iter()
        .map(|(x, y)| (x + center_offset.0, y + center_offset.1))
        .collect()
}
