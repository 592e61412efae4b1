//! トラッキングデバイス入力の共有表現。
//!
//! 入力スレッドが書き、シミュレーションスレッドが読む。
//! 無効ポーズは「データなし」を意味し、consumer側は必ず valid を確認する。

use nalgebra::{UnitQuaternion, Vector3};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// センサー空間の1デバイス分のポーズ
#[derive(Debug, Clone, Copy)]
pub struct TrackedPose {
    pub valid: bool,
    pub translation: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub velocity: Vector3<f32>,
    pub angular_velocity: Vector3<f32>,
}

impl TrackedPose {
    pub fn new(
        translation: Vector3<f32>,
        rotation: UnitQuaternion<f32>,
        velocity: Vector3<f32>,
        angular_velocity: Vector3<f32>,
    ) -> Self {
        Self {
            valid: true,
            translation,
            rotation,
            velocity,
            angular_velocity,
        }
    }

    pub fn invalid() -> Self {
        Self {
            valid: false,
            translation: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for TrackedPose {
    fn default() -> Self {
        Self::invalid()
    }
}

/// ポーズを提供するデバイスアクション
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoseAction {
    Head,
    LeftHand,
    RightHand,
}

/// ポーズ供給源（HMDランタイム、リプレイ、テスト用フェイク）
pub trait PoseSource: Send + Sync {
    /// センサー空間でのポーズを返す。データがなければ invalid。
    fn pose(&self, action: PoseAction) -> TrackedPose;
}

/// スレッド間共有のポーズテーブル。
/// クリティカルセクションはコピーのみで短い。
#[derive(Clone, Default)]
pub struct PoseMap {
    inner: Arc<Mutex<HashMap<PoseAction, TrackedPose>>>,
}

impl PoseMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, action: PoseAction, pose: TrackedPose) {
        let mut map = self.inner.lock().unwrap();
        map.insert(action, pose);
    }

    pub fn get(&self, action: PoseAction) -> TrackedPose {
        let map = self.inner.lock().unwrap();
        map.get(&action).copied().unwrap_or_default()
    }

    pub fn invalidate_all(&self) {
        let mut map = self.inner.lock().unwrap();
        for pose in map.values_mut() {
            *pose = TrackedPose::invalid();
        }
    }
}

impl PoseSource for PoseMap {
    fn pose(&self, action: PoseAction) -> TrackedPose {
        self.get(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_pose_is_invalid() {
        let map = PoseMap::new();
        assert!(!map.get(PoseAction::Head).is_valid());
    }

    #[test]
    fn test_set_and_get() {
        let map = PoseMap::new();
        let pose = TrackedPose::new(
            Vector3::new(0.0, 1.7, 0.0),
            UnitQuaternion::identity(),
            Vector3::zeros(),
            Vector3::zeros(),
        );
        map.set(PoseAction::Head, pose);
        let got = map.get(PoseAction::Head);
        assert!(got.is_valid());
        assert_eq!(got.translation, pose.translation);
    }

    #[test]
    fn test_invalidate_all() {
        let map = PoseMap::new();
        map.set(
            PoseAction::LeftHand,
            TrackedPose::new(
                Vector3::zeros(),
                UnitQuaternion::identity(),
                Vector3::zeros(),
                Vector3::zeros(),
            ),
        );
        map.invalidate_all();
        assert!(!map.get(PoseAction::LeftHand).is_valid());
    }

    #[test]
    fn test_shared_between_clones() {
        let map = PoseMap::new();
        let writer = map.clone();
        writer.set(
            PoseAction::RightHand,
            TrackedPose::new(
                Vector3::new(0.3, 1.2, -0.4),
                UnitQuaternion::identity(),
                Vector3::zeros(),
                Vector3::zeros(),
            ),
        );
        assert!(map.get(PoseAction::RightHand).is_valid());
    }
}
