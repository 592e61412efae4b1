//! Teleport destination probing.
//!
//! When the avatar is dropped at an arbitrary point it can end up inside
//! geometry, where physics will oscillate it forever. The probe casts rays
//! along the vertical line through the destination and answers either "safe"
//! or a better position with the feet placed on the nearest top surface.

use nalgebra::Vector3;
use tracing::warn;
use uuid::Uuid;

use crate::config::SafeLandingConfig;

/// A ray intersection against the scene.
#[derive(Debug, Clone, Copy)]
pub struct RayHit {
    pub entity: Uuid,
    pub intersection: Vector3<f32>,
    pub normal: Vector3<f32>,
}

/// Scene raycast interface. Implementations consider collidable, non-local
/// entities only.
pub trait RayScene: Send + Sync {
    /// Nearest hit along the ray, restricted to `include` when non-empty and
    /// never returning anything in `ignore`.
    fn cast_ray(
        &self,
        origin: Vector3<f32>,
        direction: Vector3<f32>,
        include: &[Uuid],
        ignore: &[Uuid],
    ) -> Option<RayHit>;
}

fn is_up(normal: &Vector3<f32>) -> bool {
    normal.dot(&Vector3::y()) > 0.0
}

fn is_down(normal: &Vector3<f32>) -> bool {
    normal.dot(&Vector3::y()) < 0.0
}

/// Decide whether `position` (the capsule center) risks getting the avatar
/// stuck, and if so compute a better position.
///
/// The algorithm, in four parts:
/// 1. Nothing above us: feet may be embedded but physics will push us out.
/// 2. Nothing below us: same reasoning, head-first.
/// 3. A ceiling above and a floor below with enough clearance between them:
///    walk upward past successive ceilings to check we are not contained
///    inside some entity; an up-facing surface on the way means we are, and
///    its top is the landing candidate.
/// 4. Otherwise the gap is too small; land on top of the entity above,
///    found by casting down from far above.
pub fn requires_safe_landing(
    scene: &dyn RayScene,
    cfg: &SafeLandingConfig,
    position: Vector3<f32>,
    avatar_height: f32,
) -> Option<Vector3<f32>> {
    let half_height = 0.5 * avatar_height;
    if half_height == 0.0 {
        return None; // zero height avatar
    }
    let up = Vector3::y();
    let down = -up;
    let capsule_center = position;
    let must_move = |upper_intersection: Vector3<f32>| Some(upper_intersection + up * half_height);

    let mut ignore: Vec<Uuid> = Vec::new();

    let mut upper = scene.cast_ray(capsule_center, up, &[], &ignore)?;
    let Some(lower) = scene.cast_ray(capsule_center, down, &[], &ignore) else {
        return None; // nothing below
    };

    if is_down(&upper.normal) && is_up(&lower.normal) {
        // A clearing between two objects. If it is tall enough, make sure we
        // are not also contained inside some larger entity.
        let space_between = (upper.intersection - lower.intersection).norm();
        if space_between > cfg.half_height_factor * half_height {
            for _ in 0..cfg.iteration_limit {
                ignore.push(upper.entity);
                match scene.cast_ray(upper.intersection, up, &[], &ignore) {
                    None => return None, // enough room
                    Some(hit) => {
                        if is_up(&hit.normal) {
                            // Top surface of an entity we have not seen yet:
                            // we are inside it. Land on top of it.
                            return must_move(hit.intersection);
                        }
                        // Another bottom surface; keep looking upward.
                        upper = hit;
                    }
                }
            }
            warn!("safe landing probe exhausted its iterations; floor/ceiling do not make sense");
        }
    }

    // Land on top of whatever is directly above, found from far overhead.
    let include = [upper.entity];
    let from_above = capsule_center + up * cfg.sky_cast_height;
    match scene.cast_ray(from_above, down, &include, &[]) {
        None => None, // unable to find a landing
        Some(hit) => must_move(hit.intersection),
    }
}
