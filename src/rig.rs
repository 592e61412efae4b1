//! Skeleton contract between the embodiment core and the animation system.
//!
//! The estimators only need joint lookups and default-pose offsets, so the
//! animation side is hidden behind `SkeletonRig`. `StandardRig` provides a
//! canonical humanoid T-pose for tests, the demo binary, and as a fallback
//! when an avatar model is missing joints.

use std::collections::HashMap;

use nalgebra::{UnitQuaternion, Vector3};

use crate::math::Transform;

/// Rig-space eye height of the canonical humanoid, in meters.
pub const DEFAULT_RIG_EYE_HEIGHT: f32 = 1.65;

pub trait SkeletonRig: Send + Sync {
    fn joint_count(&self) -> usize;

    /// Joint index by name, `None` when the model lacks the joint.
    fn index_of_joint(&self, name: &str) -> Option<usize>;

    /// Bind-pose joint transform in rig space.
    fn absolute_default_pose(&self, index: usize) -> Option<Transform>;

    /// Current animated joint transform in rig space.
    fn absolute_pose(&self, index: usize) -> Option<Transform>;

    /// Hand an IK target to the animation system.
    fn set_ik_target(&mut self, index: usize, target: Transform);

    /// Eye height above the feet in rig space.
    fn eye_height(&self) -> f32 {
        DEFAULT_RIG_EYE_HEIGHT
    }
}

/// Canonical humanoid with fixed T-pose joint positions.
pub struct StandardRig {
    names: Vec<&'static str>,
    default_poses: Vec<Transform>,
    ik_targets: HashMap<usize, Transform>,
}

const STANDARD_JOINTS: &[(&str, [f32; 3])] = &[
    ("Hips", [0.0, 0.98, 0.0]),
    ("Spine2", [0.0, 1.30, 0.0]),
    ("Neck", [0.0, 1.50, 0.0]),
    ("Head", [0.0, 1.58, 0.0]),
    ("LeftHand", [-0.75, 1.40, 0.0]),
    ("RightHand", [0.75, 1.40, 0.0]),
    ("RightFoot", [0.12, 0.05, 0.0]),
];

impl StandardRig {
    pub fn new() -> Self {
        let mut names = Vec::with_capacity(STANDARD_JOINTS.len());
        let mut default_poses = Vec::with_capacity(STANDARD_JOINTS.len());
        for (name, pos) in STANDARD_JOINTS {
            names.push(*name);
            default_poses.push(Transform::new(
                UnitQuaternion::identity(),
                Vector3::new(pos[0], pos[1], pos[2]),
            ));
        }
        Self {
            names,
            default_poses,
            ik_targets: HashMap::new(),
        }
    }
}

impl Default for StandardRig {
    fn default() -> Self {
        Self::new()
    }
}

impl SkeletonRig for StandardRig {
    fn joint_count(&self) -> usize {
        self.names.len()
    }

    fn index_of_joint(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| *n == name)
    }

    fn absolute_default_pose(&self, index: usize) -> Option<Transform> {
        self.default_poses.get(index).copied()
    }

    fn absolute_pose(&self, index: usize) -> Option<Transform> {
        // IKターゲットが来ていればそれが現在ポーズ
        if let Some(t) = self.ik_targets.get(&index) {
            return Some(*t);
        }
        self.default_poses.get(index).copied()
    }

    fn set_ik_target(&mut self, index: usize, target: Transform) {
        if index < self.names.len() {
            self.ik_targets.insert(index, target);
        }
    }
}

/// Rig-space head-to-neck and neck-to-hips offsets used by the HMD-derived
/// body estimate. Falls back to canonical positions when joints are missing.
pub fn head_neck_hips_offsets(rig: &dyn SkeletonRig) -> (Vector3<f32>, Vector3<f32>) {
    let fallback = StandardRig::new();
    let lookup = |name: &str| -> Vector3<f32> {
        rig.index_of_joint(name)
            .and_then(|i| rig.absolute_default_pose(i))
            .map(|t| t.translation)
            .unwrap_or_else(|| {
                let i = fallback.index_of_joint(name).unwrap();
                fallback.absolute_default_pose(i).unwrap().translation
            })
    };
    let head = lookup("Head");
    let neck = lookup("Neck");
    let hips = lookup("Hips");
    (neck - head, hips - neck)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_rig_joint_lookup() {
        let rig = StandardRig::new();
        assert!(rig.index_of_joint("Head").is_some());
        assert!(rig.index_of_joint("Tail").is_none());
        assert_eq!(rig.joint_count(), 7);
    }

    #[test]
    fn test_default_pose_head_above_hips() {
        let rig = StandardRig::new();
        let head = rig
            .absolute_default_pose(rig.index_of_joint("Head").unwrap())
            .unwrap();
        let hips = rig
            .absolute_default_pose(rig.index_of_joint("Hips").unwrap())
            .unwrap();
        assert!(head.translation.y > hips.translation.y);
    }

    #[test]
    fn test_ik_target_overrides_pose() {
        let mut rig = StandardRig::new();
        let idx = rig.index_of_joint("Hips").unwrap();
        let target = Transform::new(
            UnitQuaternion::identity(),
            Vector3::new(0.1, 0.9, -0.05),
        );
        rig.set_ik_target(idx, target);
        assert_eq!(rig.absolute_pose(idx).unwrap().translation, target.translation);
        // デフォルトポーズは影響を受けない
        assert_eq!(
            rig.absolute_default_pose(idx).unwrap().translation,
            Vector3::new(0.0, 0.98, 0.0)
        );
    }

    #[test]
    fn test_offsets_fall_back_when_missing() {
        struct EmptyRig;
        impl SkeletonRig for EmptyRig {
            fn joint_count(&self) -> usize {
                0
            }
            fn index_of_joint(&self, _name: &str) -> Option<usize> {
                None
            }
            fn absolute_default_pose(&self, _index: usize) -> Option<Transform> {
                None
            }
            fn absolute_pose(&self, _index: usize) -> Option<Transform> {
                None
            }
            fn set_ik_target(&mut self, _index: usize, _target: Transform) {}
        }
        let (head_to_neck, neck_to_hips) = head_neck_hips_offsets(&EmptyRig);
        assert!(head_to_neck.y < 0.0);
        assert!(neck_to_hips.y < 0.0);
    }
}
