//! アバター本体の統合レイヤ。
//!
//! センサー入力（HMD・コントローラー）から体の推定・リセンタリング・
//! 移動モーター・安全な着地・アバターエンティティの同期までを
//! 1フレームのパイプラインとして束ねる。物理・アニメーション・シーンは
//! すべてトレイト越しに注入される。
//!
//! フレームの流れ:
//! 1. `update(dt)`       — センサー読み取り、統計、テレポート消化、向き
//! 2. `prepare_for_physics(dt)` — モーターと追従目標を物理へ渡す
//! 3. （物理ステップ）
//! 4. `harvest_physics_results()` — 解決済みの位置と追従変位を取り込む

use std::sync::{Arc, Mutex, MutexGuard};

use nalgebra::{UnitQuaternion, Vector2, Vector3};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::body_frame::{derive_body_from_cg, derive_body_from_hmd};
use crate::character::{CharacterController, CharacterState, FollowParams};
use crate::config::{Config, EYE_TO_TOP_OF_HEAD};
use crate::dispatch::TaskQueue;
use crate::entities::{AvatarEntityReconciler, SceneTree};
use crate::filter::{FacingAverage, QuatAverage};
use crate::follow::{RecenterController, RecenterInputs};
use crate::math::{
    body_facing_from_head, cancel_roll_and_pitch, facing_dir_2d, lerp_vec2, ScaledTransform,
    Transform, ALMOST_ZERO,
};
use crate::motor::{
    ControlScheme, DominantHand, DriveKeys, LocomotionMotor, MovementReference, RollTurnInputs,
    YawController,
};
use crate::pose::{PoseAction, PoseSource, TrackedPose};
use crate::rig::SkeletonRig;
use crate::safe_landing::{requires_safe_landing, RayScene};
use crate::sit_stand::SitStandClassifier;

/// センサー原点からこれ以上離れた頭位置は計測異常として捨てる（メートル）
const MAX_HMD_ORIGIN_DISTANCE: f32 = 1000.0;
/// 脊椎が「ほぼ垂直」とみなすコサイン閾値（約30°）
const SPINE_VERTICAL_COS: f32 = 0.866;
/// センサー→ワールドのスケール変化をログする閾値
const SCALE_CHANGE_EPSILON: f32 = 0.001;
/// 背面テレポートで相手の前に降りるときの距離（メートル）
const FACE_LOCATION_DISTANCE: f32 = 2.0;

/// リセンタリングの挙動モデル。
///
/// Auto は座位/立位を自動分類する。ForceSit/ForceStand は分類器を
/// ロックして固定し、DisableHmdLean はリーン起因のリセンタリングを
/// 止める（強制フラグ経路は生きる）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecenterModel {
    Auto,
    ForceSit,
    ForceStand,
    DisableHmdLean,
}

/// 次の `update` で消化するテレポート先
#[derive(Debug, Clone, Copy)]
struct GoToTarget {
    position: Vector3<f32>,
    orientation: UnitQuaternion<f32>,
    /// 指定位置に「足」を合わせる（アバター原点ではなく）
    feet_adjustment: bool,
}

/// 次tickへ持ち越す自己変異の仕事
enum DeferredOp {
    /// 衝突を切って退避した後、移動してから衝突を戻す
    GoToAndEnableCollisions(Vector3<f32>),
}

pub struct Avatar {
    config: Config,
    session_id: Uuid,

    poses: Box<dyn PoseSource>,
    rig: Box<dyn SkeletonRig>,
    character: Box<dyn CharacterController>,
    ray_scene: Arc<dyn RayScene>,
    scene: Box<dyn SceneTree>,

    entities: AvatarEntityReconciler,
    tasks: TaskQueue,
    recenter: RecenterController,
    sit_stand: SitStandClassifier,
    motor: LocomotionMotor,
    yaw: YawController,
    drive_keys: DriveKeys,

    head_sensor: TrackedPose,
    hmd_mode: bool,
    /// センサー空間の体行列（追従の基準）
    body_sensor_matrix: Transform,
    sensor_to_world: ScaledTransform,
    /// 頭から推定した現在の向き（XZ平面）
    facing: Vector2<f32>,
    facing_average: FacingAverage,
    hand_azimuth: Vector2<f32>,
    average_head_rotation: QuatAverage,

    world_position: Vector3<f32>,
    world_orientation: UnitQuaternion<f32>,
    velocity: Vector3<f32>,

    go_to: Option<GoToTarget>,
    physics_safety_pending: Option<Vector3<f32>>,
    deferred: Vec<DeferredOp>,
    sit_stand_change: bool,

    recenter_model: RecenterModel,
    character_enabled: bool,
    pushed_by_script: bool,
    away: bool,
}

impl Avatar {
    pub fn new(
        config: Config,
        poses: Box<dyn PoseSource>,
        rig: Box<dyn SkeletonRig>,
        character: Box<dyn CharacterController>,
        ray_scene: Arc<dyn RayScene>,
        scene: Box<dyn SceneTree>,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let user_height = config.user.height;
        let user_eye_height = config.user.eye_height();
        let body_sensor_matrix = derive_body_from_hmd(
            &TrackedPose::invalid(),
            rig.as_ref(),
            user_height,
            user_eye_height,
        );
        let mut motor = LocomotionMotor::new(config.locomotion.clone());
        if config.user.dominant_hand.eq_ignore_ascii_case("left") {
            motor.dominant_hand = DominantHand::Left;
        }
        let yaw = YawController::new(config.locomotion.smooth_orientation_time);
        let entities = AvatarEntityReconciler::new(session_id, config.entities.max_avatar_entities);

        let mut avatar = Self {
            recenter: RecenterController::new(config.recenter.clone()),
            sit_stand: SitStandClassifier::new(config.sit_stand.clone(), user_height),
            config,
            session_id,
            poses,
            rig,
            character,
            ray_scene,
            scene,
            entities,
            tasks: TaskQueue::new(),
            motor,
            yaw,
            drive_keys: DriveKeys::new(),
            head_sensor: TrackedPose::invalid(),
            hmd_mode: false,
            body_sensor_matrix,
            sensor_to_world: ScaledTransform::identity(),
            facing: Vector2::new(0.0, -1.0),
            facing_average: FacingAverage::new(0.0, Vector2::new(0.0, -1.0)),
            hand_azimuth: Vector2::new(0.0, -1.0),
            average_head_rotation: QuatAverage::new(QuatAverage::HEAD_ROTATION_RATE),
            world_position: Vector3::zeros(),
            world_orientation: UnitQuaternion::identity(),
            velocity: Vector3::zeros(),
            go_to: None,
            physics_safety_pending: None,
            deferred: Vec::new(),
            sit_stand_change: false,
            recenter_model: RecenterModel::Auto,
            character_enabled: true,
            pushed_by_script: false,
            away: false,
        };
        avatar.update_sensor_to_world();
        avatar
    }

    /// フレーム頭の更新。センサーを読み、統計を進め、保留中の
    /// テレポートと安全確認を消化する。
    pub fn update(&mut self, dt: f32) {
        for op in std::mem::take(&mut self.deferred) {
            match op {
                DeferredOp::GoToAndEnableCollisions(position) => {
                    self.go_to_location_and_enable_collisions(position);
                }
            }
        }

        let head = self.poses.pose(PoseAction::Head);
        self.update_from_hmd_sensor(head);

        self.update_facing_average(dt);

        let head_avatar = self.pose_in_avatar_frame(&self.head_sensor);
        if head_avatar.is_valid() {
            self.average_head_rotation.update(&head_avatar.rotation);
        }

        let head_sensor = self.head_sensor;
        if self.sit_stand.update(&head_sensor, self.away, dt) {
            self.sit_stand_change = true;
        }
        self.update_squat(&head_avatar, dt);

        // 先のtickで予約された安全確認を、今のtickで消化する
        if let Some(position) = self.physics_safety_pending.take() {
            self.safe_landing(position);
        }
        self.apply_pending_go_to();

        self.sit_stand
            .note_head_speed(self.head_sensor.velocity.norm());

        self.update_orientation(dt);

        self.entities.reconcile(self.scene.as_mut());

        self.update_sensor_to_world();
    }

    /// 頭のセンサーポーズを取り込む。原点から離れすぎた読みは捨てる。
    pub fn update_from_hmd_sensor(&mut self, head: TrackedPose) {
        if head.is_valid() && head.translation.norm() > MAX_HMD_ORIGIN_DISTANCE {
            warn!(
                distance = head.translation.norm(),
                "HMD sensor position out of range, ignoring"
            );
            return;
        }
        self.hmd_mode = head.is_valid();
        self.head_sensor = head;
        if head.is_valid() {
            let facing_q = body_facing_from_head(&head.rotation, &Vector3::y());
            self.facing = facing_dir_2d(&facing_q);
        }
    }

    /// 向きの移動平均。両手が有効なら手の方位を優先して混ぜる。
    fn update_facing_average(&mut self, dt: f32) {
        let left = self.poses.pose(PoseAction::LeftHand);
        let right = self.poses.pose(PoseAction::RightHand);
        let target = if left.is_valid() && right.is_valid() {
            self.update_hand_azimuth(&left, &right)
        } else {
            self.facing
        };
        let filter_length = self.config.recenter.rotation_filter_length.max(ALMOST_ZERO);
        let tau = (dt / filter_length).clamp(0.0, 1.0);
        self.facing_average.update_with(target, tau);
    }

    /// 両手の中点方向から体の方位を推定する。
    /// 180°反転して見える場合は前フレームへ巻き戻す（頭の向きと大きく
    /// 矛盾しない限り）。
    fn update_hand_azimuth(
        &mut self,
        left: &TrackedPose,
        right: &TrackedPose,
    ) -> Vector2<f32> {
        let to_local = self.body_sensor_matrix.inverse();
        let xz = |p: &Vector3<f32>| -> Vector2<f32> {
            let q = to_local.transform_point(p);
            let v = Vector2::new(q.x, q.z);
            if v.norm() > ALMOST_ZERO {
                v.normalize()
            } else {
                Vector2::new(0.0, -1.0)
            }
        };
        let mid = lerp_vec2(&xz(&left.translation), &xz(&right.translation), 0.5);
        let mut azimuth = if mid.norm() > ALMOST_ZERO {
            mid.normalize()
        } else {
            Vector2::new(0.0, -1.0)
        };
        if azimuth.dot(&self.hand_azimuth) < 0.0 && (-azimuth).dot(&self.facing) >= -0.2 {
            azimuth = -azimuth;
        }
        self.hand_azimuth = azimuth;
        azimuth
    }

    fn update_squat(&mut self, head_avatar: &TrackedPose, dt: f32) {
        if !head_avatar.is_valid() {
            return;
        }
        let default_head_y = self
            .rig
            .index_of_joint("Head")
            .and_then(|i| self.rig.absolute_default_pose(i))
            .map(|t| t.translation.y)
            .unwrap_or(1.58);
        let spine_vertical = self
            .rig
            .index_of_joint("Spine2")
            .and_then(|i| self.rig.absolute_pose(i))
            .map(|t| (t.rotation * Vector3::y()).dot(&Vector3::y()) > SPINE_VERTICAL_COS)
            .unwrap_or(true);
        let force_stand = self.recenter_model == RecenterModel::ForceStand;
        self.sit_stand.update_squat(
            head_avatar.translation.y,
            default_head_y,
            spine_vertical,
            force_stand,
            dt,
        );
    }

    fn apply_pending_go_to(&mut self) {
        let Some(go_to) = self.go_to.take() else {
            return;
        };
        let mut position = go_to.position;
        if go_to.feet_adjustment {
            position += self.world_position - self.feet_world_position();
        }
        self.world_position = position;
        self.world_orientation = go_to.orientation;
        self.velocity = Vector3::zeros();
        self.character
            .set_position_and_orientation(position, go_to.orientation);
        self.facing_average.reset(self.facing);
        self.update_sensor_to_world();
        if !self.character.is_collisionless() {
            // 着地の安全確認は次のtickで行う
            self.physics_safety_pending = Some(position);
        }
    }

    /// ヨー入力（アナログ・ステップ・HMDロール旋回）を消化する。
    fn update_orientation(&mut self, dt: f32) {
        let forward_speed = self
            .velocity
            .dot(&(self.world_orientation * -Vector3::z()));
        let roll_turn = RollTurnInputs {
            enabled: self.config.locomotion.hmd_roll_control_enabled,
            hovering: self.character.state() == CharacterState::Hover,
            has_drive_input: self.drive_keys.has_drive_input(),
            forward_speed,
            sensor_to_world_scale: self.sensor_to_world.scale,
            hmd_orientation: self.head_sensor.rotation,
            dead_zone_degrees: self.config.locomotion.hmd_roll_control_dead_zone,
            rate_degrees_per_sec: self.config.locomotion.hmd_roll_control_rate,
        };
        let update = self.yaw.update(
            dt,
            &self.drive_keys,
            self.config.locomotion.yaw_speed,
            &self.world_orientation,
            &roll_turn,
        );
        self.world_orientation = update.new_orientation;
        self.yaw.advance_smoothing(dt);
    }

    /// センサー→ワールド行列を取り直す。
    /// スケールはアバターの目の高さとユーザーの目の高さの比。
    pub fn update_sensor_to_world(&mut self) {
        let user_eye_height = self.config.user.eye_height();
        let scale = self.rig.eye_height() / user_eye_height.max(ALMOST_ZERO);
        let world = ScaledTransform::new(scale, self.world_orientation, self.world_position);
        let new = world.compose(&ScaledTransform::from_transform(&self.body_sensor_matrix).inverse());
        if (new.scale - self.sensor_to_world.scale).abs() > SCALE_CHANGE_EPSILON {
            debug!(scale = new.scale, "sensor-to-world scale changed");
        }
        self.sensor_to_world = new;
    }

    /// センサー空間のポーズをアバターローカルへ写す
    fn pose_in_avatar_frame(&self, pose: &TrackedPose) -> TrackedPose {
        if !pose.is_valid() {
            return TrackedPose::invalid();
        }
        let s2w_rot = self.sensor_to_world.rotation;
        let world_position = self.sensor_to_world.transform_point(&pose.translation);
        let world_rotation = s2w_rot * pose.rotation;
        let inverse = self.world_transform().inverse();
        TrackedPose::new(
            inverse.transform_point(&world_position),
            inverse.rotation * world_rotation,
            inverse.rotation * (s2w_rot * pose.velocity),
            inverse.rotation * (s2w_rot * pose.angular_velocity),
        )
    }

    fn world_transform(&self) -> Transform {
        Transform::new(self.world_orientation, self.world_position)
    }

    fn feet_world_position(&self) -> Vector3<f32> {
        let foot_y = self
            .rig
            .index_of_joint("RightFoot")
            .and_then(|i| self.rig.absolute_default_pose(i))
            .map(|t| t.translation.y)
            .unwrap_or(0.0);
        self.world_transform()
            .transform_point(&Vector3::new(0.0, foot_y, 0.0))
    }

    /// 望みの体（センサー空間）。重心モデルが有効で立位ならそちらを使う。
    fn derive_desired_body(&self) -> Transform {
        let head = &self.head_sensor;
        if self.config.balance.cg_model_enabled && head.is_valid() && !self.sit_stand.is_sitting()
        {
            let head_avatar = self.pose_in_avatar_frame(head);
            let left = self.pose_in_avatar_frame(&self.poses.pose(PoseAction::LeftHand));
            let right = self.pose_in_avatar_frame(&self.poses.pose(PoseAction::RightHand));
            let hips_avatar = derive_body_from_cg(
                &head_avatar,
                &left,
                &right,
                self.rig.as_ref(),
                &self.config.balance,
                self.config.user.eye_height(),
            );
            let avatar_to_world = ScaledTransform::from_transform(&self.world_transform());
            let world = avatar_to_world.compose_transform(&hips_avatar);
            self.sensor_to_world.inverse().compose(&world).to_transform()
        } else {
            derive_body_from_hmd(
                head,
                self.rig.as_ref(),
                self.config.user.height,
                self.config.user.eye_height(),
            )
        }
    }

    fn default_joint_position(&self, name: &str, fallback: Vector3<f32>) -> Vector3<f32> {
        self.rig
            .index_of_joint(name)
            .and_then(|i| self.rig.absolute_default_pose(i))
            .map(|t| t.translation)
            .unwrap_or(fallback)
    }

    /// 物理ステップの前処理。モーター・位置・追従目標を渡す。
    pub fn prepare_for_physics(&mut self, dt: f32) {
        if !self.character_enabled {
            return;
        }
        let state = self.character.state();
        let collisionless = self.character.is_collisionless();
        let scale = self.sensor_to_world.scale;
        let head_avatar = self.pose_in_avatar_frame(&self.head_sensor);
        let left_avatar = self.pose_in_avatar_frame(&self.poses.pose(PoseAction::LeftHand));
        let right_avatar = self.pose_in_avatar_frame(&self.poses.pose(PoseAction::RightHand));

        let direction = self.motor.scaled_direction(
            &self.drive_keys,
            &left_avatar,
            &right_avatar,
            self.hmd_mode,
            state,
            collisionless,
            scale,
        );
        self.motor
            .update_action_motor(dt, direction, state, self.hmd_mode, scale);
        self.character.clear_motors();
        let frame_motor = self.motor.motor_for_frame(
            state,
            collisionless,
            self.hmd_mode,
            scale,
            &self.world_orientation,
            &head_avatar.rotation,
            self.pushed_by_script,
        );
        self.character.add_motor(frame_motor);
        self.character
            .set_position_and_orientation(self.world_position, self.world_orientation);

        if !self.head_sensor.is_valid() {
            self.recenter.deactivate_all();
            self.character.set_follow_parameters(FollowParams::default());
            return;
        }

        let inputs = RecenterInputs {
            desired_body: self.derive_desired_body(),
            current_body: self.body_sensor_matrix,
            sensor_to_world: self.sensor_to_world,
            facing_average: self.facing_average.value(),
            hmd_mode: self.hmd_mode,
            has_drive_input: self.drive_keys.has_drive_input(),
            lean_recenter_enabled: self.config.recenter.lean_recenter_enabled
                && self.recenter_model != RecenterModel::DisableHmdLean,
            cg_enabled: self.config.balance.cg_model_enabled,
            head_sensor: self.head_sensor,
            head_avatar,
            left_hand_avatar: left_avatar,
            right_hand_avatar: right_avatar,
            average_head_rotation: self.average_head_rotation.value(),
            default_head: self.default_joint_position("Head", Vector3::new(0.0, 1.58, 0.0)),
            default_hips: self.default_joint_position("Hips", Vector3::new(0.0, 0.98, 0.0)),
            sensor_to_world_scale: scale,
        };
        let outcome = self.recenter.pre_physics_update(&inputs, &mut self.sit_stand);
        if outcome.reset_facing_average {
            self.facing_average.reset(self.facing);
        }
        self.character.set_follow_parameters(outcome.follow_params);
    }

    /// 物理ステップの後処理。位置の読み戻しと追従変位の取り込み。
    pub fn harvest_physics_results(&mut self) {
        if !self.character_enabled {
            return;
        }
        if self.character.is_stuck() {
            // めり込んだ: 位置は信用せず、次のtickで退避を試みる
            self.physics_safety_pending = Some(self.world_position);
        } else {
            self.world_position = self.character.position();
            self.world_orientation = self.character.orientation();
            self.velocity = self.character.velocity();
        }

        let fresh = derive_body_from_hmd(
            &self.head_sensor,
            self.rig.as_ref(),
            self.config.user.height,
            self.config.user.eye_height(),
        );
        let follow = self.character.follow_result();
        let changed = std::mem::take(&mut self.sit_stand_change);
        self.body_sensor_matrix = self.recenter.post_physics_update(
            &self.body_sensor_matrix,
            &follow,
            &self.sensor_to_world.rotation,
            changed,
            &fresh,
        );
        self.update_sensor_to_world();
    }

    /// テレポート。向きが与えられればロール/ピッチを落として採用する。
    /// `should_face_location` なら指定向きへ正対し、2m手前に降りる。
    pub fn go_to_location(
        &mut self,
        position: Vector3<f32>,
        orientation: Option<UnitQuaternion<f32>>,
        should_face_location: bool,
    ) {
        let mut target_position = position;
        let target_orientation = match orientation {
            Some(q) => {
                let level = cancel_roll_and_pitch(&q);
                if should_face_location {
                    let turned = level
                        * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), std::f32::consts::PI);
                    target_position -= turned * (-Vector3::z()) * FACE_LOCATION_DISTANCE;
                    turned
                } else {
                    level
                }
            }
            None => self.world_orientation,
        };
        self.go_to = Some(GoToTarget {
            position: target_position,
            orientation: target_orientation,
            feet_adjustment: false,
        });
    }

    /// 足元を指定位置へ合わせるテレポート
    pub fn go_to_feet_location(
        &mut self,
        position: Vector3<f32>,
        orientation: Option<UnitQuaternion<f32>>,
    ) {
        self.go_to_location(position, orientation, false);
        if let Some(go_to) = &mut self.go_to {
            go_to.feet_adjustment = true;
        }
    }

    /// 衝突を切ったまま退避した後の復帰。移動を予約し、衝突を戻す。
    pub fn go_to_location_and_enable_collisions(&mut self, position: Vector3<f32>) {
        self.go_to_location(position, None, false);
        self.set_collisions_enabled(true);
    }

    /// 指定位置が安全か調べ、危険なら退避を予約する。
    ///
    /// 衝突がすでに無効なら安全な位置へ直接移動する。有効なら一旦
    /// 衝突を切り、次のtickで移動してから衝突を戻す。戻り値は
    /// 「介入したかどうか」。
    pub fn safe_landing(&mut self, position: Vector3<f32>) -> bool {
        let better = requires_safe_landing(
            self.ray_scene.as_ref(),
            &self.config.safe_landing,
            position,
            self.avatar_height(),
        );
        match better {
            None => false,
            Some(better_position) => {
                if self.character.is_collisionless() {
                    self.go_to_location(better_position, None, false);
                } else {
                    self.character.set_collisionless(true);
                    self.deferred
                        .push(DeferredOp::GoToAndEnableCollisions(better_position));
                }
                true
            }
        }
    }

    pub fn avatar_height(&self) -> f32 {
        self.rig.eye_height() + EYE_TO_TOP_OF_HEAD
    }

    // ---- スクリプト向けの調整項目 ----

    pub fn set_walk_speed(&mut self, speed: f32) {
        let speed = speed.max(0.0);
        match self.motor.control_scheme {
            ControlScheme::AnalogPlus => self.config.locomotion.analog_plus_walk_speed = speed,
            _ => self.config.locomotion.walk_speed = speed,
        }
        self.motor.set_config(self.config.locomotion.clone());
    }

    pub fn walk_speed(&self) -> f32 {
        self.motor.walk_speed()
    }

    pub fn set_sprint_speed(&mut self, speed: f32) {
        let speed = speed.max(0.0);
        match self.motor.control_scheme {
            ControlScheme::AnalogPlus => self.config.locomotion.analog_plus_sprint_speed = speed,
            _ => self.config.locomotion.sprint_speed = speed,
        }
        self.motor.set_config(self.config.locomotion.clone());
    }

    pub fn sprint_speed(&self) -> f32 {
        self.motor.sprint_speed()
    }

    pub fn set_control_scheme(&mut self, scheme: ControlScheme) {
        self.motor.control_scheme = scheme;
    }

    pub fn set_movement_reference(&mut self, reference: MovementReference) {
        self.motor.movement_reference = reference;
    }

    pub fn set_dominant_hand(&mut self, hand: DominantHand) {
        self.motor.dominant_hand = hand;
    }

    /// ギアの変速点。[0,1] の外は拒否し、隣のギアとの順序が崩れる値も
    /// 黙って捨てる。
    pub fn set_drive_gear_1(&mut self, shift_point: f32) {
        if !(0.0..=1.0).contains(&shift_point) {
            return;
        }
        if shift_point < self.config.locomotion.gear_2 {
            self.config.locomotion.gear_1 = shift_point;
            self.motor.set_config(self.config.locomotion.clone());
        }
    }

    pub fn set_drive_gear_2(&mut self, shift_point: f32) {
        if !(0.0..=1.0).contains(&shift_point) {
            return;
        }
        if shift_point >= self.config.locomotion.gear_1
            && shift_point < self.config.locomotion.gear_3
        {
            self.config.locomotion.gear_2 = shift_point;
            self.motor.set_config(self.config.locomotion.clone());
        }
    }

    pub fn set_drive_gear_3(&mut self, shift_point: f32) {
        if !(0.0..=1.0).contains(&shift_point) {
            return;
        }
        if shift_point >= self.config.locomotion.gear_2
            && shift_point < self.config.locomotion.gear_4
        {
            self.config.locomotion.gear_3 = shift_point;
            self.motor.set_config(self.config.locomotion.clone());
        }
    }

    pub fn set_drive_gear_4(&mut self, shift_point: f32) {
        if !(0.0..=1.0).contains(&shift_point) {
            return;
        }
        if shift_point >= self.config.locomotion.gear_3
            && shift_point < self.config.locomotion.gear_5
        {
            self.config.locomotion.gear_4 = shift_point;
            self.motor.set_config(self.config.locomotion.clone());
        }
    }

    pub fn set_drive_gear_5(&mut self, shift_point: f32) {
        if !(0.0..=1.0).contains(&shift_point) {
            return;
        }
        if shift_point >= self.config.locomotion.gear_4 {
            self.config.locomotion.gear_5 = shift_point;
            self.motor.set_config(self.config.locomotion.clone());
        }
    }

    pub fn set_user_height(&mut self, height: f32) {
        let height = height.max(0.1);
        self.config.user.height = height;
        self.sit_stand.set_user_height(height);
        self.update_sensor_to_world();
    }

    pub fn user_height(&self) -> f32 {
        self.config.user.height
    }

    pub fn set_recenter_model(&mut self, model: RecenterModel) {
        self.recenter_model = model;
        let was_sitting = self.sit_stand.is_sitting();
        match model {
            RecenterModel::Auto | RecenterModel::DisableHmdLean => {
                self.sit_stand.set_locked(false);
            }
            RecenterModel::ForceSit => {
                self.sit_stand.set_sitting(true);
                self.sit_stand.set_locked(true);
            }
            RecenterModel::ForceStand => {
                self.sit_stand.set_sitting(false);
                self.sit_stand.set_locked(true);
            }
        }
        if was_sitting != self.sit_stand.is_sitting() {
            self.sit_stand_change = true;
        }
    }

    pub fn recenter_model(&self) -> RecenterModel {
        self.recenter_model
    }

    /// 座位/立位の自動分類を止めて現状で固定する
    pub fn set_sit_stand_locked(&mut self, locked: bool) {
        self.sit_stand.set_locked(locked);
    }

    pub fn is_sit_stand_locked(&self) -> bool {
        self.sit_stand.is_locked()
    }

    pub fn set_rotation_threshold(&mut self, radians: f32) {
        self.config.recenter.rotation_threshold = radians.max(0.0);
        self.recenter.set_config(self.config.recenter.clone());
    }

    pub fn set_rotation_filter_length(&mut self, length: f32) {
        self.config.recenter.rotation_filter_length = length.max(ALMOST_ZERO);
        self.recenter.set_config(self.config.recenter.clone());
    }

    pub fn set_collisions_enabled(&mut self, enabled: bool) {
        self.character.set_collisionless(!enabled);
    }

    pub fn collisions_enabled(&self) -> bool {
        !self.character.is_collisionless()
    }

    pub fn set_character_controller_enabled(&mut self, enabled: bool) {
        self.character_enabled = enabled;
    }

    pub fn set_sprint_mode(&mut self, sprint: bool) {
        self.motor.set_sprint_mode(sprint);
    }

    pub fn set_pushed_by_script(&mut self, pushed: bool) {
        self.pushed_by_script = pushed;
    }

    pub fn set_away(&mut self, away: bool) {
        self.away = away;
    }

    // ---- 参照用アクセサ ----

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn position(&self) -> Vector3<f32> {
        self.world_position
    }

    pub fn orientation(&self) -> UnitQuaternion<f32> {
        self.world_orientation
    }

    /// リモートへ送る向き（スナップターン直後は補間値）
    pub fn outbound_orientation(&self) -> UnitQuaternion<f32> {
        self.yaw.outbound_orientation(&self.world_orientation)
    }

    pub fn velocity(&self) -> Vector3<f32> {
        self.velocity
    }

    pub fn is_sitting(&self) -> bool {
        self.sit_stand.is_sitting()
    }

    pub fn is_in_hmd_mode(&self) -> bool {
        self.hmd_mode
    }

    pub fn head_sensor(&self) -> &TrackedPose {
        &self.head_sensor
    }

    pub fn sensor_to_world(&self) -> &ScaledTransform {
        &self.sensor_to_world
    }

    pub fn body_sensor_matrix(&self) -> &Transform {
        &self.body_sensor_matrix
    }

    pub fn facing_average(&self) -> Vector2<f32> {
        self.facing_average.value()
    }

    pub fn drive_keys_mut(&mut self) -> &mut DriveKeys {
        &mut self.drive_keys
    }

    pub fn drive_keys(&self) -> &DriveKeys {
        &self.drive_keys
    }

    pub fn entities(&self) -> &AvatarEntityReconciler {
        &self.entities
    }

    pub fn tasks(&self) -> TaskQueue {
        self.tasks.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// スレッドをまたいでアバターを操作するためのハンドル。
///
/// シミュレーションスレッド以外からの呼び出しはタスクキューに積まれ、
/// `update` の先頭で実行される。`safe_landing` だけは結果が要るので
/// ブロッキング呼び出しになる。
#[derive(Clone)]
pub struct AvatarHandle {
    avatar: Arc<Mutex<Avatar>>,
    tasks: TaskQueue,
}

impl AvatarHandle {
    pub fn new(avatar: Avatar) -> Self {
        let tasks = avatar.tasks.clone();
        Self {
            avatar: Arc::new(Mutex::new(avatar)),
            tasks,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Avatar> {
        self.avatar.lock().unwrap()
    }

    /// フレーム更新。積まれたタスクを先に消化する。
    pub fn update(&self, dt: f32) {
        self.tasks.run_pending();
        self.lock().update(dt);
    }

    pub fn go_to_location(
        &self,
        position: Vector3<f32>,
        orientation: Option<UnitQuaternion<f32>>,
        should_face_location: bool,
    ) {
        let avatar = self.avatar.clone();
        self.tasks.invoke(move || {
            avatar
                .lock()
                .unwrap()
                .go_to_location(position, orientation, should_face_location);
        });
    }

    /// どのスレッドからでも呼べる安全確認。オーナー以外からは
    /// シミュレーションスレッドで実行されるまで待つ。
    pub fn safe_landing(&self, position: Vector3<f32>) -> bool {
        if self.tasks.is_owner_thread() {
            return self.lock().safe_landing(position);
        }
        let avatar = self.avatar.clone();
        self.tasks
            .blocking_invoke(move || avatar.lock().unwrap().safe_landing(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::KinematicCharacterController;
    use crate::entities::EntityProperties;
    use crate::motor::DriveKey;
    use crate::pose::PoseMap;
    use crate::rig::StandardRig;
    use crate::safe_landing::RayHit;
    use approx::assert_relative_eq;
    use std::collections::HashMap;

    /// 何も当たらないシーン（どこでも安全）
    struct EmptyScene;
    impl RayScene for EmptyScene {
        fn cast_ray(
            &self,
            _origin: Vector3<f32>,
            _direction: Vector3<f32>,
            _include: &[Uuid],
            _ignore: &[Uuid],
        ) -> Option<RayHit> {
            None
        }
    }

    /// 床(+Y法線)と低い天井(-Y法線)に挟まれたシーン。
    /// 天井エンティティの上面は y=0.6 にある。
    struct CrampedScene {
        ceiling: Uuid,
        floor: Uuid,
    }
    impl RayScene for CrampedScene {
        fn cast_ray(
            &self,
            origin: Vector3<f32>,
            direction: Vector3<f32>,
            include: &[Uuid],
            _ignore: &[Uuid],
        ) -> Option<RayHit> {
            if !include.is_empty() {
                // 空から天井エンティティの上面へ
                return Some(RayHit {
                    entity: self.ceiling,
                    intersection: Vector3::new(origin.x, 0.6, origin.z),
                    normal: Vector3::y(),
                });
            }
            if direction.y > 0.0 {
                Some(RayHit {
                    entity: self.ceiling,
                    intersection: Vector3::new(origin.x, 0.5, origin.z),
                    normal: -Vector3::y(),
                })
            } else {
                Some(RayHit {
                    entity: self.floor,
                    intersection: Vector3::new(origin.x, -0.5, origin.z),
                    normal: Vector3::y(),
                })
            }
        }
    }

    #[derive(Default)]
    struct RecordingSceneTree {
        entities: HashMap<Uuid, EntityProperties>,
    }
    impl SceneTree for RecordingSceneTree {
        fn add_entity(&mut self, id: Uuid, properties: EntityProperties) -> bool {
            self.entities.insert(id, properties);
            true
        }
        fn update_entity(&mut self, id: Uuid, properties: EntityProperties) -> bool {
            self.entities.insert(id, properties);
            true
        }
        fn delete_entity(&mut self, id: Uuid) {
            self.entities.remove(&id);
        }
        fn entity_properties(&self, id: Uuid) -> Option<EntityProperties> {
            self.entities.get(&id).cloned()
        }
    }

    type SharedCharacter = Arc<Mutex<KinematicCharacterController>>;

    fn make_avatar(scene: Arc<dyn RayScene>) -> (Avatar, PoseMap, SharedCharacter) {
        let poses = PoseMap::new();
        let character: SharedCharacter = Arc::new(Mutex::new(KinematicCharacterController::new()));
        let avatar = Avatar::new(
            Config::default(),
            Box::new(poses.clone()),
            Box::new(StandardRig::new()),
            Box::new(character.clone()),
            scene,
            Box::new(RecordingSceneTree::default()),
        );
        (avatar, poses, character)
    }

    fn head_at(y: f32) -> TrackedPose {
        TrackedPose::new(
            Vector3::new(0.0, y, 0.0),
            UnitQuaternion::identity(),
            Vector3::zeros(),
            Vector3::zeros(),
        )
    }

    #[test]
    fn test_go_to_location_applies_on_next_update() {
        let (mut avatar, _poses, _cc) = make_avatar(Arc::new(EmptyScene));
        avatar.go_to_location(Vector3::new(3.0, 0.0, -5.0), None, false);
        assert_eq!(avatar.position(), Vector3::zeros());
        avatar.update(0.016);
        assert_relative_eq!(avatar.position().x, 3.0);
        assert_relative_eq!(avatar.position().z, -5.0);
    }

    #[test]
    fn test_go_to_location_cancels_roll_and_pitch() {
        let (mut avatar, _poses, _cc) = make_avatar(Arc::new(EmptyScene));
        let tilted = UnitQuaternion::from_euler_angles(0.4, 1.0, -0.3);
        avatar.go_to_location(Vector3::zeros(), Some(tilted), false);
        avatar.update(0.016);
        let up = avatar.orientation() * Vector3::y();
        assert_relative_eq!(up.dot(&Vector3::y()), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_go_to_face_location_backs_away() {
        let (mut avatar, _poses, _cc) = make_avatar(Arc::new(EmptyScene));
        let target = Vector3::new(0.0, 0.0, 0.0);
        avatar.go_to_location(target, Some(UnitQuaternion::identity()), true);
        avatar.update(0.016);
        // 相手に正対して2m手前に立つ
        assert_relative_eq!((avatar.position() - target).norm(), 2.0, epsilon = 1e-4);
        let fwd = avatar.orientation() * -Vector3::z();
        let to_target = (target - avatar.position()).normalize();
        assert_relative_eq!(fwd.dot(&to_target), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_hmd_position_out_of_range_rejected() {
        let (mut avatar, _poses, _cc) = make_avatar(Arc::new(EmptyScene));
        avatar.update_from_hmd_sensor(head_at(1.7));
        assert!(avatar.is_in_hmd_mode());
        let far = TrackedPose::new(
            Vector3::new(2000.0, 1.7, 0.0),
            UnitQuaternion::identity(),
            Vector3::zeros(),
            Vector3::zeros(),
        );
        avatar.update_from_hmd_sensor(far);
        // 異常値は無視され、前回の頭位置が残る
        assert_relative_eq!(avatar.head_sensor().translation.y, 1.7);
        assert!(avatar.head_sensor().translation.norm() < 100.0);
    }

    #[test]
    fn test_sit_stand_transition_through_avatar() {
        let (mut avatar, poses, _cc) = make_avatar(Arc::new(EmptyScene));
        for _ in 0..5 {
            poses.set(PoseAction::Head, head_at(1.64));
            avatar.update(1.0);
        }
        assert!(!avatar.is_sitting());
        for _ in 0..6 {
            poses.set(PoseAction::Head, head_at(1.1));
            avatar.update(1.0);
        }
        assert!(avatar.is_sitting());
    }

    #[test]
    fn test_recenter_model_force_sit_and_stand() {
        let (mut avatar, _poses, _cc) = make_avatar(Arc::new(EmptyScene));
        avatar.set_recenter_model(RecenterModel::ForceSit);
        assert!(avatar.is_sitting());
        avatar.set_recenter_model(RecenterModel::ForceStand);
        assert!(!avatar.is_sitting());
        // Autoへ戻すとロック解除され分類器が動く
        avatar.set_recenter_model(RecenterModel::Auto);
        assert!(!avatar.is_sitting());
    }

    #[test]
    fn test_drive_gear_ordering_preserved() {
        let (mut avatar, _poses, _cc) = make_avatar(Arc::new(EmptyScene));
        // gear_2(0.4) を跨ぐ値は拒否される
        avatar.set_drive_gear_1(0.95);
        assert_relative_eq!(avatar.config().locomotion.gear_1, 0.2);
        avatar.set_drive_gear_1(0.3);
        assert_relative_eq!(avatar.config().locomotion.gear_1, 0.3);
        // 範囲外も拒否
        avatar.set_drive_gear_5(1.5);
        assert_relative_eq!(avatar.config().locomotion.gear_5, 1.0);
    }

    #[test]
    fn test_walk_speed_setter_follows_control_scheme() {
        let (mut avatar, _poses, _cc) = make_avatar(Arc::new(EmptyScene));
        avatar.set_walk_speed(3.0);
        assert_relative_eq!(avatar.walk_speed(), 3.0);
        avatar.set_control_scheme(ControlScheme::AnalogPlus);
        avatar.set_walk_speed(7.5);
        assert_relative_eq!(avatar.walk_speed(), 7.5);
        // Default側の値は別に保持されている
        avatar.set_control_scheme(ControlScheme::Default);
        assert_relative_eq!(avatar.walk_speed(), 3.0);
    }

    #[test]
    fn test_drive_input_moves_avatar_through_physics() {
        let (mut avatar, _poses, cc) = make_avatar(Arc::new(EmptyScene));
        // デスクトップ入力で前進
        avatar.drive_keys_mut().set_key(DriveKey::TranslateZ, 1.0);
        let dt = 0.016;
        for _ in 0..60 {
            avatar.update(dt);
            avatar.prepare_for_physics(dt);
            cc.lock().unwrap().step(dt);
            avatar.harvest_physics_results();
        }
        assert!(avatar.position().z < -0.5);
        assert!(avatar.velocity().norm() > 0.0);
    }

    #[test]
    fn test_unsafe_landing_disables_collisions_then_recovers() {
        let scene = CrampedScene {
            ceiling: Uuid::from_u128(10),
            floor: Uuid::from_u128(11),
        };
        let (mut avatar, _poses, _cc) = make_avatar(Arc::new(scene));
        assert!(avatar.collisions_enabled());
        let intervened = avatar.safe_landing(Vector3::zeros());
        assert!(intervened);
        // 衝突を切って退避が予約される
        assert!(!avatar.collisions_enabled());
        avatar.update(0.016);
        // 天井エンティティの上 (0.6) + 半身長 (0.88) に着地し、衝突が戻る
        assert!(avatar.collisions_enabled());
        assert_relative_eq!(avatar.position().y, 0.6 + 0.5 * avatar.avatar_height(), epsilon = 1e-4);
    }

    #[test]
    fn test_safe_landing_noop_in_open_space() {
        let (mut avatar, _poses, _cc) = make_avatar(Arc::new(EmptyScene));
        assert!(!avatar.safe_landing(Vector3::new(0.0, 5.0, 0.0)));
        assert!(avatar.collisions_enabled());
        assert_eq!(avatar.position(), Vector3::zeros());
    }

    #[test]
    fn test_handle_queues_cross_thread_go_to() {
        let (avatar, _poses, _cc) = make_avatar(Arc::new(EmptyScene));
        let handle = AvatarHandle::new(avatar);
        let remote = handle.clone();
        std::thread::spawn(move || {
            remote.go_to_location(Vector3::new(1.0, 0.0, 0.0), None, false);
        })
        .join()
        .unwrap();
        // キューに積まれただけでまだ動いていない
        assert_eq!(handle.lock().position(), Vector3::zeros());
        handle.update(0.016);
        assert_relative_eq!(handle.lock().position().x, 1.0);
    }

    #[test]
    fn test_handle_safe_landing_inline_on_owner() {
        let (avatar, _poses, _cc) = make_avatar(Arc::new(EmptyScene));
        let handle = AvatarHandle::new(avatar);
        assert!(!handle.safe_landing(Vector3::zeros()));
    }

    #[test]
    fn test_facing_average_tracks_head() {
        let (mut avatar, poses, _cc) = make_avatar(Arc::new(EmptyScene));
        let turned = UnitQuaternion::from_axis_angle(
            &Vector3::y_axis(),
            std::f32::consts::FRAC_PI_2,
        );
        let head = TrackedPose::new(
            Vector3::new(0.0, 1.7, 0.0),
            turned,
            Vector3::zeros(),
            Vector3::zeros(),
        );
        for _ in 0..1500 {
            poses.set(PoseAction::Head, head);
            avatar.update(0.016);
        }
        let expected = facing_dir_2d(&turned);
        assert!((avatar.facing_average() - expected).norm() < 0.05);
    }

    #[test]
    fn test_user_height_rescales_sensor_to_world() {
        let (mut avatar, _poses, _cc) = make_avatar(Arc::new(EmptyScene));
        let before = avatar.sensor_to_world().scale;
        avatar.set_user_height(1.2);
        let after = avatar.sensor_to_world().scale;
        // 低いユーザーほどアバターへの拡大率が上がる
        assert!(after > before);
    }
}
