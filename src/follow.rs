//! リセンタリング（follow）状態機械。
//!
//! HMDで体を傾けたり一歩踏み出したりしたとき、アバターの体をセンサー上の
//! 頭の下へ追従させる。回転・水平・垂直の3軸が独立したタイマーを持ち、
//! 起動されると 0.5 秒の追従ウィンドウの間、物理ステップが体を目標へ引き寄せる。
//!
//! 起動判定（lean recenter 有効時）と強制フラグ（スクリプト/テレポート用）の
//! 2系統があり、どちらも `pre_physics_update` で処理する。

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::character::{FollowParams, FollowResult};
use crate::config::RecenterConfig;
use crate::math::{facing_dir_2d, ScaledTransform, Transform, ALMOST_ZERO};
use crate::pose::TrackedPose;
use crate::sit_stand::SitStandClassifier;

/// 追従ウィンドウ（秒）
pub const FOLLOW_TIME: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowType {
    Rotation = 0,
    Horizontal = 1,
    Vertical = 2,
}

const NUM_FOLLOW_TYPES: usize = 3;

/// `pre_physics_update` に渡すフレームごとの入力。
/// desired/current の体行列はどちらもセンサー空間。
#[derive(Debug, Clone)]
pub struct RecenterInputs {
    pub desired_body: Transform,
    pub current_body: Transform,
    pub sensor_to_world: ScaledTransform,
    /// 頭の向きの移動平均（XZ平面）
    pub facing_average: Vector2<f32>,
    pub hmd_mode: bool,
    pub has_drive_input: bool,
    /// リーンリセンタリングの実効フラグ（設定とリセンタモデルの合成）
    pub lean_recenter_enabled: bool,
    pub cg_enabled: bool,
    pub head_sensor: TrackedPose,
    pub head_avatar: TrackedPose,
    pub left_hand_avatar: TrackedPose,
    pub right_hand_avatar: TrackedPose,
    pub average_head_rotation: UnitQuaternion<f32>,
    /// アバター空間のデフォルト頭・腰位置
    pub default_head: Vector3<f32>,
    pub default_hips: Vector3<f32>,
    pub sensor_to_world_scale: f32,
}

impl Default for RecenterInputs {
    fn default() -> Self {
        Self {
            desired_body: Transform::identity(),
            current_body: Transform::identity(),
            sensor_to_world: ScaledTransform::identity(),
            facing_average: Vector2::new(0.0, -1.0),
            hmd_mode: true,
            has_drive_input: false,
            lean_recenter_enabled: true,
            cg_enabled: false,
            head_sensor: TrackedPose::invalid(),
            head_avatar: TrackedPose::invalid(),
            left_hand_avatar: TrackedPose::invalid(),
            right_hand_avatar: TrackedPose::invalid(),
            average_head_rotation: UnitQuaternion::identity(),
            default_head: Vector3::new(0.0, 1.58, 0.0),
            default_hips: Vector3::new(0.0, 0.98, 0.0),
            sensor_to_world_scale: 1.0,
        }
    }
}

/// `pre_physics_update` の結果。
pub struct PrePhysicsOutcome {
    /// 物理へ渡す追従目標（ワールド空間）
    pub follow_params: FollowParams,
    /// 回転リセンタが起動した: 向きの移動平均を取り直すこと
    pub reset_facing_average: bool,
}

pub struct RecenterController {
    cfg: RecenterConfig,
    time_remaining: [f32; NUM_FOLLOW_TYPES],
    force_rotation: bool,
    force_horizontal: bool,
    force_vertical: bool,
}

impl RecenterController {
    pub fn new(cfg: RecenterConfig) -> Self {
        Self {
            cfg,
            time_remaining: [0.0; NUM_FOLLOW_TYPES],
            force_rotation: false,
            force_horizontal: false,
            force_vertical: false,
        }
    }

    pub fn activate(&mut self, follow_type: FollowType) {
        self.time_remaining[follow_type as usize] = FOLLOW_TIME;
    }

    pub fn deactivate(&mut self, follow_type: FollowType) {
        self.time_remaining[follow_type as usize] = 0.0;
    }

    pub fn deactivate_all(&mut self) {
        self.time_remaining = [0.0; NUM_FOLLOW_TYPES];
    }

    pub fn is_active(&self, follow_type: FollowType) -> bool {
        self.time_remaining[follow_type as usize] > 0.0
    }

    pub fn is_any_active(&self) -> bool {
        self.time_remaining.iter().any(|&t| t > 0.0)
    }

    pub fn max_time_remaining(&self) -> f32 {
        self.time_remaining.iter().fold(0.0f32, |a, &b| a.max(b))
    }

    fn decrement_time_remaining(&mut self, dt: f32) {
        for t in &mut self.time_remaining {
            *t = (*t - dt).max(0.0);
        }
    }

    /// テレポートやスクリプトから次フレームの強制起動を予約する
    pub fn force_activate_rotation(&mut self) {
        self.force_rotation = true;
    }

    pub fn force_activate_horizontal(&mut self) {
        self.force_horizontal = true;
    }

    pub fn force_activate_vertical(&mut self) {
        self.force_vertical = true;
    }

    pub fn set_config(&mut self, cfg: RecenterConfig) {
        self.cfg = cfg;
    }

    pub fn config(&self) -> &RecenterConfig {
        &self.cfg
    }

    /// 頭の向きの移動平均が体の向きから閾値以上ずれた
    pub fn should_activate_rotation(
        &self,
        facing_average: &Vector2<f32>,
        current_body: &Transform,
    ) -> bool {
        let body_facing = facing_dir_2d(&current_body.rotation);
        facing_average.dot(&body_facing) < self.cfg.rotation_threshold.cos()
    }

    /// 立位: 体の傾き（desired と current の水平差）が許容量を超えた
    pub fn should_activate_horizontal_standing(
        &self,
        desired_body: &Transform,
        current_body: &Transform,
    ) -> bool {
        let offset = desired_body.translation - current_body.translation;
        let forward = current_body.rotation * -Vector3::z();
        let right = current_body.rotation * Vector3::x();
        let forward_lean = forward.dot(&offset);
        let lateral_lean = right.dot(&offset);
        forward_lean > self.cfg.max_forward_lean
            || forward_lean < -self.cfg.max_backward_lean
            || lateral_lean.abs() > self.cfg.max_lateral_lean
    }

    /// 座位: 頭が支持基底面の外へ出た
    pub fn should_activate_horizontal_seated(&self, head_avatar: &TrackedPose) -> bool {
        !self.within_base_of_support(head_avatar)
    }

    /// 頭がステップ閾値の矩形内にあるか（アバター空間、前方は -Z）
    fn within_base_of_support(&self, head_avatar: &TrackedPose) -> bool {
        if !head_avatar.is_valid() {
            return false;
        }
        let p = head_avatar.translation;
        p.x.abs() <= self.cfg.lateral_stepping_threshold
            && p.z >= -self.cfg.anterior_stepping_threshold
            && p.z <= self.cfg.posterior_stepping_threshold
    }

    fn head_angular_velocity_below_threshold(&self, head: &TrackedPose) -> bool {
        let w = head.angular_velocity;
        Vector2::new(w.x, w.z).norm() < self.cfg.head_angular_velocity_threshold
    }

    fn within_threshold_height_mode(
        &self,
        head_sensor: &TrackedPose,
        standing_mode: f32,
        scale: f32,
    ) -> bool {
        head_sensor.is_valid()
            && (head_sensor.translation.y - standing_mode) > self.cfg.mode_height_threshold * scale
    }

    /// 両手の水平速度が頭と同じ向きに動いているか。
    /// 手が無効、またはほぼ静止していれば不成立。
    fn hand_direction_matches_head(
        &self,
        left: &TrackedPose,
        right: &TrackedPose,
        head: &TrackedPose,
    ) -> bool {
        const VELOCITY_EPSILON: f32 = 0.02;
        let head_xz = Vector2::new(head.velocity.x, head.velocity.z);
        if head_xz.norm() <= ALMOST_ZERO {
            return false;
        }
        let head_dir = head_xz.normalize();
        let matches = |hand: &TrackedPose| -> bool {
            if !hand.is_valid() {
                return false;
            }
            let v = Vector2::new(hand.velocity.x, hand.velocity.z);
            if v.norm() <= VELOCITY_EPSILON {
                return false;
            }
            v.normalize().dot(&head_dir) > self.cfg.hands_velocity_direction_threshold
        };
        matches(left) && matches(right)
    }

    fn hand_angular_velocity_below_threshold(
        &self,
        left: &TrackedPose,
        right: &TrackedPose,
    ) -> bool {
        let xz = |p: &TrackedPose| -> f32 {
            if p.is_valid() {
                Vector2::new(p.angular_velocity.x, p.angular_velocity.z).norm()
            } else {
                0.0
            }
        };
        xz(left) < self.cfg.hands_angular_velocity_threshold
            && xz(right) < self.cfg.hands_angular_velocity_threshold
    }

    fn head_velocity_greater_than_threshold(&self, head: &TrackedPose) -> bool {
        head.velocity.norm() > self.cfg.head_velocity_threshold
    }

    /// 頭のピッチ/ロールが移動平均から許容角度以内か
    fn head_level(&self, head: &TrackedPose, average: &UnitQuaternion<f32>) -> bool {
        let diff = average.inverse() * head.rotation;
        let (pitch, _yaw, roll) = diff.euler_angles();
        let tolerance = self.cfg.head_level_tolerance.to_radians();
        pitch.abs() < tolerance && roll.abs() < tolerance
    }

    /// 重心モデル時のステップ検出。
    ///
    /// 歩行中は常に真。それ以外は「頭が支持基底面を外れ、かつ頭と両手の
    /// 速度・姿勢が踏み出しらしい」複合条件。副経路として脊椎の伸び
    /// （頭と腰のデフォルト距離の超過）でも起動し、その場合は立ち高さの
    /// 最頻値を取り直す。
    pub fn should_activate_horizontal_cg(
        &self,
        inputs: &RecenterInputs,
        sit_stand: &mut SitStandClassifier,
    ) -> bool {
        if sit_stand.is_walking() {
            return true;
        }
        let head = &inputs.head_avatar;
        let step_detected = !self.within_base_of_support(head)
            && self.head_angular_velocity_below_threshold(head)
            && self.within_threshold_height_mode(
                &inputs.head_sensor,
                sit_stand.standing_height_mode(),
                inputs.sensor_to_world_scale,
            )
            && self.hand_direction_matches_head(
                &inputs.left_hand_avatar,
                &inputs.right_hand_avatar,
                head,
            )
            && self.hand_angular_velocity_below_threshold(
                &inputs.left_hand_avatar,
                &inputs.right_hand_avatar,
            )
            && self.head_velocity_greater_than_threshold(head)
            && self.head_level(head, &inputs.average_head_rotation);
        if step_detected {
            if head.velocity.norm() > sit_stand.walk_speed_threshold() {
                sit_stand.set_walking(true);
            }
            return true;
        }

        // 脊椎の伸び: 頭がデフォルトの頭-腰距離より遠くへ離れた
        let anatomical = (inputs.default_head - inputs.default_hips).norm();
        let stretched = (head.translation - inputs.default_hips).norm();
        if head.is_valid()
            && !self.is_active(FollowType::Horizontal)
            && !self.is_active(FollowType::Vertical)
            && stretched > anatomical * (1.0 + self.cfg.spine_stretch_limit)
        {
            sit_stand.request_height_reset();
            if head.velocity.norm() > sit_stand.walk_speed_threshold() {
                sit_stand.set_walking(true);
            }
            return true;
        }
        false
    }

    /// 垂直: 体が許容シリンダーを外れた、またはしゃがみ検出
    pub fn should_activate_vertical(
        &self,
        desired_body: &Transform,
        current_body: &Transform,
        sitting: bool,
        sit_stand_locked: bool,
        squat_detected: bool,
    ) -> bool {
        let offset_y = desired_body.translation.y - current_body.translation.y;
        if sitting {
            offset_y < self.cfg.sitting_bottom
                || (sit_stand_locked && offset_y > self.cfg.cylinder_top)
        } else {
            offset_y > self.cfg.cylinder_top
                || offset_y < self.cfg.cylinder_bottom
                || squat_detected
        }
    }

    /// 起動判定を実行し、物理へ渡す追従目標を組み立てる。
    pub fn pre_physics_update(
        &mut self,
        inputs: &RecenterInputs,
        sit_stand: &mut SitStandClassifier,
    ) -> PrePhysicsOutcome {
        let mut reset_facing_average = false;

        if inputs.lean_recenter_enabled && inputs.hmd_mode {
            if !self.is_active(FollowType::Rotation)
                && (self.should_activate_rotation(&inputs.facing_average, &inputs.current_body)
                    || inputs.has_drive_input)
            {
                self.activate(FollowType::Rotation);
                reset_facing_average = true;
            }

            let horizontal = if inputs.cg_enabled {
                self.should_activate_horizontal_cg(inputs, sit_stand)
            } else if sit_stand.is_sitting() {
                self.should_activate_horizontal_seated(&inputs.head_avatar)
            } else {
                self.should_activate_horizontal_standing(&inputs.desired_body, &inputs.current_body)
            };
            if !self.is_active(FollowType::Horizontal) && (horizontal || inputs.has_drive_input) {
                self.activate(FollowType::Horizontal);
                // ステップ時は向きも取り直す（非CGの座位は除く）
                if self.cfg.step_reset_rotation && (inputs.cg_enabled || !sit_stand.is_sitting()) {
                    self.activate(FollowType::Rotation);
                    reset_facing_average = true;
                }
            }

            let squat = sit_stand.squat_flag();
            if !self.is_active(FollowType::Vertical)
                && (self.should_activate_vertical(
                    &inputs.desired_body,
                    &inputs.current_body,
                    sit_stand.is_sitting(),
                    sit_stand.is_locked(),
                    squat,
                ) || inputs.has_drive_input)
            {
                self.activate(FollowType::Vertical);
                if squat {
                    sit_stand.take_squat_flag();
                }
            }
        } else {
            if !self.is_active(FollowType::Rotation) && self.force_rotation {
                self.activate(FollowType::Rotation);
                self.force_rotation = false;
                reset_facing_average = true;
            }
            if !self.is_active(FollowType::Horizontal) && self.force_horizontal {
                self.activate(FollowType::Horizontal);
                self.force_horizontal = false;
            }
            if !self.is_active(FollowType::Vertical) && self.force_vertical {
                self.activate(FollowType::Vertical);
                self.force_vertical = false;
            }
        }

        // 追従目標: 現在の体から出発し、起動中の軸だけ desired で上書きする
        let desired_world = inputs.sensor_to_world.compose_transform(&inputs.desired_body);
        let current_world = inputs.sensor_to_world.compose_transform(&inputs.current_body);
        let mut target = current_world.to_transform();
        if self.is_active(FollowType::Rotation) {
            target.rotation = desired_world.rotation;
        }
        if self.is_active(FollowType::Horizontal) {
            target.translation.x = desired_world.translation.x;
            target.translation.z = desired_world.translation.z;
        }
        if self.is_active(FollowType::Vertical) {
            target.translation.y = desired_world.translation.y;
        }

        PrePhysicsOutcome {
            follow_params: FollowParams {
                target,
                max_time_remaining: self.max_time_remaining(),
            },
            reset_facing_average,
        }
    }

    /// 物理で解決された追従変位をセンサー空間へ写し、体行列へ畳み込む。
    ///
    /// 座位/立位が切り替わったフレームでは垂直追従を打ち切り、
    /// 平行移動を新しいHMD由来の体推定へスナップする。
    pub fn post_physics_update(
        &mut self,
        current_body: &Transform,
        follow: &FollowResult,
        sensor_to_world_rotation: &UnitQuaternion<f32>,
        sit_stand_changed: bool,
        fresh_hmd_body: &Transform,
    ) -> Transform {
        if !self.is_any_active() {
            return *current_body;
        }
        self.decrement_time_remaining(follow.follow_time);

        let world_to_sensor = sensor_to_world_rotation.inverse();
        let sensor_linear = world_to_sensor * follow.linear_displacement;
        let sensor_angular =
            world_to_sensor * follow.angular_displacement * *sensor_to_world_rotation;
        let mut new_body = Transform::new(
            sensor_angular * current_body.rotation,
            sensor_linear + current_body.translation,
        );
        if sit_stand_changed {
            self.deactivate(FollowType::Vertical);
            new_body.translation = fresh_hmd_body.translation;
        }
        new_body
    }
}
