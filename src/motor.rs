//! 移動入力から物理モーターを組み立てる。
//!
//! 入力はドライブキー（軸ごとの生値）で届き、制御方式（Default/Analog/
//! AnalogPlus）と移動基準（HMD相対/手相対）に従って望みの速度ベクトルへ
//! 変換される。歩行・飛行でモーターの時定数が変わり、スクリプトが体を
//! 動かしている間は実質無限の時定数で譲る。
//!
//! ヨー入力（スムーズ回転・スナップターン・HMDロール旋回）もここで処理する。

use nalgebra::{UnitQuaternion, Vector3};
use tracing::error;

use crate::character::{CharacterState, Motor, INVALID_MOTOR_TIMESCALE};
use crate::config::LocomotionConfig;
use crate::math::{swing_twist_decomposition, ALMOST_ZERO};
use crate::pose::TrackedPose;

/// 移動入力の軸
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum DriveKey {
    TranslateX = 0,
    TranslateY,
    TranslateZ,
    Yaw,
    Pitch,
    StepTranslateX,
    StepTranslateY,
    StepTranslateZ,
    StepYaw,
    StepPitch,
    Zoom,
    DeltaYaw,
    DeltaPitch,
}

pub const NUM_DRIVE_KEYS: usize = 13;

/// ドライブキーの生値と無効化ビットマスク。
///
/// 範囲外インデックスはプログラミングバグなので error ログを出して
/// 何もしない（落とさない）。
#[derive(Debug, Clone, Copy)]
pub struct DriveKeys {
    values: [f32; NUM_DRIVE_KEYS],
    disabled: u16,
}

impl Default for DriveKeys {
    fn default() -> Self {
        Self {
            values: [0.0; NUM_DRIVE_KEYS],
            disabled: 0,
        }
    }
}

impl DriveKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, index: usize, value: f32) {
        if index >= NUM_DRIVE_KEYS {
            error!("drive key index {} out of range, ignoring", index);
            return;
        }
        self.values[index] = value;
    }

    pub fn set_key(&mut self, key: DriveKey, value: f32) {
        self.values[key as usize] = value;
    }

    /// 無効化された軸は 0 を返す
    pub fn get(&self, key: DriveKey) -> f32 {
        if self.is_disabled(key) {
            0.0
        } else {
            self.values[key as usize]
        }
    }

    pub fn raw(&self, index: usize) -> f32 {
        if index >= NUM_DRIVE_KEYS {
            error!("drive key index {} out of range, ignoring", index);
            return 0.0;
        }
        self.values[index]
    }

    pub fn disable(&mut self, key: DriveKey) {
        self.disabled |= 1 << (key as usize);
    }

    pub fn enable(&mut self, key: DriveKey) {
        self.disabled &= !(1 << (key as usize));
    }

    pub fn is_disabled(&self, key: DriveKey) -> bool {
        self.disabled & (1 << (key as usize)) != 0
    }

    pub fn clear(&mut self) {
        self.values = [0.0; NUM_DRIVE_KEYS];
    }

    /// 移動入力があるか（平行移動軸のいずれかが非ゼロ）
    pub fn has_drive_input(&self) -> bool {
        self.get(DriveKey::TranslateX).abs() > 0.0
            || self.get(DriveKey::TranslateY).abs() > 0.0
            || self.get(DriveKey::TranslateZ).abs() > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlScheme {
    Default,
    Analog,
    AnalogPlus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementReference {
    HmdRelative,
    HandRelative,
    HandRelativeLeveled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DominantHand {
    Left,
    Right,
}

/// 飛行中のブースト下限の増分（m/s）
const MIN_AVATAR_SPEED: f32 = 0.05;
/// 飛行の加速カーブの成長時定数（秒）
const SPEED_GROWTH_TIMESCALE: f32 = 2.0;
/// 飛行の加速係数
const SPEED_INCREASE_FACTOR: f32 = 1.8;
/// 飛行モーターの時定数（秒）
const FLYING_MOTOR_TIMESCALE: f32 = 0.05;
/// 歩行モーターの水平時定数（秒）
const WALKING_MOTOR_TIMESCALE: f32 = 0.2;

pub struct LocomotionMotor {
    cfg: LocomotionConfig,
    pub control_scheme: ControlScheme,
    pub movement_reference: MovementReference,
    pub dominant_hand: DominantHand,
    sprint_mode: bool,
    action_motor_velocity: Vector3<f32>,
    is_pushing: bool,
}

impl LocomotionMotor {
    pub fn new(cfg: LocomotionConfig) -> Self {
        Self {
            cfg,
            control_scheme: ControlScheme::Default,
            movement_reference: MovementReference::HmdRelative,
            dominant_hand: DominantHand::Right,
            sprint_mode: false,
            action_motor_velocity: Vector3::zeros(),
            is_pushing: false,
        }
    }

    pub fn set_config(&mut self, cfg: LocomotionConfig) {
        self.cfg = cfg;
    }

    pub fn config(&self) -> &LocomotionConfig {
        &self.cfg
    }

    pub fn set_sprint_mode(&mut self, sprint: bool) {
        self.sprint_mode = sprint;
    }

    pub fn is_pushing(&self) -> bool {
        self.is_pushing
    }

    pub fn action_motor_velocity(&self) -> Vector3<f32> {
        self.action_motor_velocity
    }

    /// スプリントキーによる速度倍率（デスクトップとHMDで異なる）
    pub fn walk_speed_scalar(&self, hmd_mode: bool) -> f32 {
        if self.sprint_mode {
            if hmd_mode {
                self.cfg.hmd_sprint_scalar
            } else {
                self.cfg.desktop_sprint_scalar
            }
        } else {
            1.0
        }
    }

    /// 制御方式ごとの歩行速度
    pub fn walk_speed(&self) -> f32 {
        match self.control_scheme {
            ControlScheme::AnalogPlus => self.cfg.analog_plus_walk_speed,
            _ => self.cfg.walk_speed,
        }
    }

    /// 制御方式ごとのスプリント速度
    pub fn sprint_speed(&self) -> f32 {
        match self.control_scheme {
            ControlScheme::AnalogPlus => self.cfg.analog_plus_sprint_speed,
            _ => self.cfg.sprint_speed,
        }
    }

    /// スティック値を5段ギアの離散倍率へ変換する（符号保存）。
    pub fn geared_speed(&self, drive_value: f32) -> f32 {
        let abs = drive_value.abs();
        let sign = if drive_value < 0.0 { -1.0 } else { 1.0 };
        let multiplier = if abs > self.cfg.gear_5 {
            1.0
        } else if abs > self.cfg.gear_4 {
            0.8
        } else if abs > self.cfg.gear_3 {
            0.6
        } else if abs > self.cfg.gear_2 {
            0.4
        } else if abs > self.cfg.gear_1 {
            0.2
        } else {
            0.0
        };
        sign * multiplier
    }

    /// ドライブキーの前後左右を望みの速度ベクトルへ変換する。
    ///
    /// Default方式は方向を正規化してスプリント速度一定、Analog系は
    /// ギア変速した大きさを軸ごとに持つ。デスクトップは正規化して歩行速度。
    pub fn scale_motor_speed(
        &self,
        forward: &Vector3<f32>,
        right: &Vector3<f32>,
        drive: &DriveKeys,
        hmd_mode: bool,
        sensor_to_world_scale: f32,
    ) -> Vector3<f32> {
        let z_speed = drive.get(DriveKey::TranslateZ);
        let x_speed = drive.get(DriveKey::TranslateX);
        let scalar = self.walk_speed_scalar(hmd_mode);

        if !hmd_mode {
            let direction = z_speed * forward + x_speed * right;
            let len = direction.norm();
            if len < ALMOST_ZERO {
                return Vector3::zeros();
            }
            return sensor_to_world_scale * (direction / len) * self.walk_speed() * scalar;
        }

        match self.control_scheme {
            ControlScheme::Default => {
                let direction = z_speed * forward + x_speed * right;
                let len = direction.norm();
                if len < ALMOST_ZERO {
                    return Vector3::zeros();
                }
                sensor_to_world_scale * (direction / len) * self.sprint_speed() * scalar
            }
            ControlScheme::Analog | ControlScheme::AnalogPlus => {
                if z_speed == 0.0 && x_speed == 0.0 {
                    return Vector3::zeros();
                }
                let z_top = if z_speed.abs() >= self.cfg.stick_full_on {
                    self.sprint_speed()
                } else {
                    self.walk_speed()
                };
                let x_top = if x_speed.abs() > self.cfg.stick_full_on {
                    self.sprint_speed()
                } else {
                    self.walk_speed()
                };
                let scaled_forward =
                    sensor_to_world_scale * self.geared_speed(z_speed) * scalar * z_top * forward;
                let scaled_right =
                    sensor_to_world_scale * self.geared_speed(x_speed) * scalar * x_top * right;
                scaled_forward + scaled_right
            }
        }
    }

    /// 移動基準に従って前/右の基底を決め、速度ベクトルを作る。
    /// ホバー中（または衝突無効中）は垂直ドライブも加える。
    #[allow(clippy::too_many_arguments)]
    pub fn scaled_direction(
        &self,
        drive: &DriveKeys,
        left_hand_avatar: &TrackedPose,
        right_hand_avatar: &TrackedPose,
        hmd_mode: bool,
        state: CharacterState,
        collisionless: bool,
        sensor_to_world_scale: f32,
    ) -> Vector3<f32> {
        let mut forward = -Vector3::z();
        let mut right = Vector3::x();

        let hand_relative = matches!(
            self.movement_reference,
            MovementReference::HandRelative | MovementReference::HandRelativeLeveled
        );
        if hand_relative && hmd_mode {
            let hand = match self.dominant_hand {
                DominantHand::Left => left_hand_avatar,
                DominantHand::Right => right_hand_avatar,
            };
            if hand.is_valid() {
                // コントローラーは前に倒して持つので、前方は手のY軸
                forward = hand.rotation * Vector3::y();
                right = hand.rotation
                    * match self.dominant_hand {
                        DominantHand::Right => Vector3::z(),
                        DominantHand::Left => -Vector3::z(),
                    };
                if self.movement_reference == MovementReference::HandRelativeLeveled {
                    forward.y = 0.0;
                    let len = forward.norm();
                    forward = if len > ALMOST_ZERO {
                        forward / len
                    } else {
                        Vector3::zeros()
                    };
                    right.y = 0.0;
                    let len = right.norm();
                    right = if len > ALMOST_ZERO {
                        right / len
                    } else {
                        Vector3::zeros()
                    };
                }
            }
        }

        let mut direction =
            self.scale_motor_speed(&forward, &right, drive, hmd_mode, sensor_to_world_scale);

        if state == CharacterState::Hover || collisionless {
            direction += drive.get(DriveKey::TranslateY) * Vector3::y();
        }
        direction
    }

    /// アクションモーターの速度を更新する。
    ///
    /// 飛行中は指数的な加速カーブに乗せ、入力がある限りブースト下限を
    /// 割らないよう持ち上げ、最大飛行速度で頭打ちにする。歩行中は
    /// 変換済みの速度ベクトルをそのまま使う。
    pub fn update_action_motor(
        &mut self,
        dt: f32,
        scaled_direction: Vector3<f32>,
        state: CharacterState,
        hmd_mode: bool,
        sensor_to_world_scale: f32,
    ) {
        let direction_length = scaled_direction.norm();
        self.is_pushing = direction_length > ALMOST_ZERO;
        let direction = if self.is_pushing {
            scaled_direction / direction_length
        } else {
            Vector3::zeros()
        };

        if state == CharacterState::Hover {
            let scalar = self.walk_speed_scalar(hmd_mode);
            let mut motor_speed = self.action_motor_velocity.norm();
            let max_motor_speed =
                sensor_to_world_scale * self.cfg.max_flying_speed * scalar;
            motor_speed *=
                1.0 + (dt / SPEED_GROWTH_TIMESCALE).clamp(0.0, 1.0) * SPEED_INCREASE_FACTOR * scalar;
            let max_boost_speed =
                sensor_to_world_scale * 0.5 * self.walk_speed() * scalar;
            if self.is_pushing {
                if motor_speed < max_boost_speed {
                    let boost_coefficient = (max_boost_speed - motor_speed) / max_boost_speed;
                    motor_speed += MIN_AVATAR_SPEED * boost_coefficient;
                } else if motor_speed > max_motor_speed {
                    motor_speed = max_motor_speed;
                }
            }
            self.action_motor_velocity = motor_speed * direction;
        } else {
            self.action_motor_velocity = scaled_direction;
        }
    }

    /// このフレームのモーターを組み立てる。
    ///
    /// 歩行中は垂直を実質無限の時定数で重力に任せ、モーター座標系は
    /// 体の向きに頭のヨー捻りを重ねたもの。スクリプトが押している間は
    /// 両軸とも無限にして譲る。
    #[allow(clippy::too_many_arguments)]
    pub fn motor_for_frame(
        &self,
        state: CharacterState,
        collisionless: bool,
        hmd_mode: bool,
        sensor_to_world_scale: f32,
        world_orientation: &UnitQuaternion<f32>,
        head_avatar_rotation: &UnitQuaternion<f32>,
        pushed_by_script: bool,
    ) -> Motor {
        let (horizontal, vertical) = if pushed_by_script {
            (INVALID_MOTOR_TIMESCALE, INVALID_MOTOR_TIMESCALE)
        } else if state == CharacterState::Hover || collisionless {
            (FLYING_MOTOR_TIMESCALE, FLYING_MOTOR_TIMESCALE)
        } else {
            (
                WALKING_MOTOR_TIMESCALE * sensor_to_world_scale,
                INVALID_MOTOR_TIMESCALE,
            )
        };

        let rotation = if hmd_mode {
            let (_, head_yaw) = swing_twist_decomposition(head_avatar_rotation, &Vector3::y());
            world_orientation * head_yaw
        } else {
            *world_orientation
        };

        Motor::new(self.action_motor_velocity, rotation, horizontal, vertical)
    }
}

/// ease-in-out の二次イージング
fn ease_in_out_quad(t: f32) -> f32 {
    if t < 0.5 {
        2.0 * t * t
    } else {
        let u = -2.0 * t + 2.0;
        1.0 - u * u / 2.0
    }
}

/// ヨー入力の出力。
pub struct YawUpdate {
    pub new_orientation: UnitQuaternion<f32>,
    pub snap_turned: bool,
}

/// ヨー回転パイプライン。
///
/// アナログヨーは 0.1 秒で目標角速度へ立ち上がり、入力が切れると 0.05 秒の
/// 時定数で減衰する（2 deg/s 未満は切り捨て）。ステップヨーは即時回転かつ
/// スナップターンとして向きの平滑化をやり直す。リモートへ送る向きは
/// スナップターン後 0.5 秒かけてイージング補間した値を使う。
pub struct YawController {
    /// 現在の角速度（度/秒）
    body_yaw_delta: f32,
    smooth_timer: f32,
    smooth_time: f32,
    smooth_initial: UnitQuaternion<f32>,
    smooth_target: UnitQuaternion<f32>,
}

/// ヨー減衰の最小角速度（度/秒）
const MINIMUM_ROTATION_RATE: f32 = 2.0;
const ROTATION_RAMP_TIMESCALE: f32 = 0.1;
const ROTATION_DECAY_TIMESCALE: f32 = 0.05;
/// DELTA_YAW の正規化基準（度/秒）
const YAW_SPEED_DEFAULT: f32 = 100.0;
/// ロール旋回が効く最小前進速度（m/s、スケール前）
const MIN_HMD_ROLL_CONTROL_SPEED: f32 = 2.0;
const MAX_ROLL_ANGLE_DEGREES: f32 = 90.0;

/// HMDロール旋回の入力
pub struct RollTurnInputs {
    pub enabled: bool,
    pub hovering: bool,
    pub has_drive_input: bool,
    /// 体の前方向の速度成分（m/s）
    pub forward_speed: f32,
    pub sensor_to_world_scale: f32,
    pub hmd_orientation: UnitQuaternion<f32>,
    pub dead_zone_degrees: f32,
    pub rate_degrees_per_sec: f32,
}

impl YawController {
    pub fn new(smooth_time: f32) -> Self {
        Self {
            body_yaw_delta: 0.0,
            smooth_timer: smooth_time,
            smooth_time,
            smooth_initial: UnitQuaternion::identity(),
            smooth_target: UnitQuaternion::identity(),
        }
    }

    pub fn set_smooth_time(&mut self, smooth_time: f32) {
        self.smooth_time = smooth_time.max(ALMOST_ZERO);
    }

    /// ヨー入力を消化して新しいワールド向きを返す。
    pub fn update(
        &mut self,
        dt: f32,
        drive: &DriveKeys,
        yaw_speed: f32,
        orientation: &UnitQuaternion<f32>,
        roll_turn: &RollTurnInputs,
    ) -> YawUpdate {
        let target_speed = drive.get(DriveKey::Yaw) * yaw_speed;
        if target_speed != 0.0 {
            let blend = (dt / ROTATION_RAMP_TIMESCALE).min(1.0);
            self.body_yaw_delta = (1.0 - blend) * self.body_yaw_delta + blend * target_speed;
        } else if self.body_yaw_delta != 0.0 {
            let attenuation = (1.0 - dt / ROTATION_DECAY_TIMESCALE).max(0.0);
            self.body_yaw_delta *= attenuation;
            if self.body_yaw_delta.abs() < MINIMUM_ROTATION_RATE {
                self.body_yaw_delta = 0.0;
            }
        }
        let mut total_body_yaw = self.body_yaw_delta * dt;

        total_body_yaw += drive.get(DriveKey::DeltaYaw) * yaw_speed / YAW_SPEED_DEFAULT;

        let mut snap_turned = false;
        let step_yaw = drive.get(DriveKey::StepYaw);
        if step_yaw != 0.0 {
            total_body_yaw += step_yaw;
            snap_turned = true;
        }

        // 飛行中の頭の傾きで旋回する（静止時は効かせない）
        if roll_turn.enabled && roll_turn.hovering && roll_turn.has_drive_input {
            let min_speed = MIN_HMD_ROLL_CONTROL_SPEED * roll_turn.sensor_to_world_scale;
            if roll_turn.forward_speed.abs() >= min_speed {
                let tilt = (roll_turn.hmd_orientation * Vector3::x()).dot(&Vector3::y());
                let mut roll_angle = tilt.clamp(-1.0, 1.0).asin().to_degrees();
                let roll_sign = if roll_angle < 0.0 { -1.0 } else { 1.0 };
                roll_angle = roll_angle.abs();
                roll_angle = if roll_angle > roll_turn.dead_zone_degrees {
                    roll_sign * (roll_angle - roll_turn.dead_zone_degrees)
                } else {
                    0.0
                };
                total_body_yaw +=
                    roll_angle / MAX_ROLL_ANGLE_DEGREES * roll_turn.rate_degrees_per_sec * dt;
            }
        }

        let initial = self.outbound_orientation(orientation);
        let new_orientation = orientation
            * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), total_body_yaw.to_radians());
        if snap_turned {
            self.smooth_initial = initial;
            self.smooth_target = new_orientation;
            self.smooth_timer = 0.0;
        }
        YawUpdate {
            new_orientation,
            snap_turned,
        }
    }

    /// 平滑化タイマーを進める（フレームごとに呼ぶ）
    pub fn advance_smoothing(&mut self, dt: f32) {
        if self.smooth_timer < self.smooth_time {
            self.smooth_timer += dt;
        }
    }

    /// リモートへ送る向き。スナップターン直後はイージング補間した値。
    pub fn outbound_orientation(
        &self,
        current: &UnitQuaternion<f32>,
    ) -> UnitQuaternion<f32> {
        if self.smooth_timer >= self.smooth_time {
            return *current;
        }
        let t = (self.smooth_timer / self.smooth_time).clamp(0.0, 1.0);
        self.smooth_initial
            .slerp(&self.smooth_target, ease_in_out_quad(t))
    }
}
