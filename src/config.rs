use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub user: UserConfig,
    #[serde(default)]
    pub locomotion: LocomotionConfig,
    #[serde(default)]
    pub recenter: RecenterConfig,
    #[serde(default)]
    pub sit_stand: SitStandConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default)]
    pub safe_landing: SafeLandingConfig,
    #[serde(default)]
    pub entities: EntityConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    /// ユーザーの身長（メートル）
    #[serde(default = "default_user_height")]
    pub height: f32,
    /// 利き手 ("left" / "right")
    #[serde(default = "default_dominant_hand")]
    pub dominant_hand: String,
}

fn default_user_height() -> f32 { 1.75 }
fn default_dominant_hand() -> String { "right".to_string() }

/// 頭頂から目までのオフセット（メートル）
pub const EYE_TO_TOP_OF_HEAD: f32 = 0.11;

impl UserConfig {
    /// 実ユーザーの目線高さ
    pub fn eye_height(&self) -> f32 {
        (self.height - EYE_TO_TOP_OF_HEAD).max(0.1)
    }
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            height: default_user_height(),
            dominant_hand: default_dominant_hand(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocomotionConfig {
    /// 歩行速度（m/s）
    #[serde(default = "default_walk_speed")]
    pub walk_speed: f32,
    /// スプリント速度（m/s）
    #[serde(default = "default_sprint_speed")]
    pub sprint_speed: f32,
    /// AnalogPlus時の歩行速度（m/s）
    #[serde(default = "default_analog_plus_walk_speed")]
    pub analog_plus_walk_speed: f32,
    /// AnalogPlus時のスプリント速度（m/s）
    #[serde(default = "default_analog_plus_sprint_speed")]
    pub analog_plus_sprint_speed: f32,
    /// 飛行時の最大速度（m/s）
    #[serde(default = "default_max_flying_speed")]
    pub max_flying_speed: f32,
    /// アナログ入力のギア変速点 1〜5（昇順）
    #[serde(default = "default_gear_1")]
    pub gear_1: f32,
    #[serde(default = "default_gear_2")]
    pub gear_2: f32,
    #[serde(default = "default_gear_3")]
    pub gear_3: f32,
    #[serde(default = "default_gear_4")]
    pub gear_4: f32,
    #[serde(default = "default_gear_5")]
    pub gear_5: f32,
    /// スティックほぼ全開とみなす閾値（スプリント切替）
    #[serde(default = "default_stick_full_on")]
    pub stick_full_on: f32,
    /// デスクトップのスプリント倍率
    #[serde(default = "default_desktop_sprint_scalar")]
    pub desktop_sprint_scalar: f32,
    /// HMDのスプリント倍率
    #[serde(default = "default_hmd_sprint_scalar")]
    pub hmd_sprint_scalar: f32,
    /// ヨー回転速度（度/秒）
    #[serde(default = "default_yaw_speed")]
    pub yaw_speed: f32,
    /// ピッチ回転速度（度/秒）
    #[serde(default = "default_pitch_speed")]
    pub pitch_speed: f32,
    /// HMDロール旋回の有効化
    #[serde(default = "default_true")]
    pub hmd_roll_control_enabled: bool,
    /// ロール旋回のデッドゾーン（度）
    #[serde(default = "default_hmd_roll_dead_zone")]
    pub hmd_roll_control_dead_zone: f32,
    /// ロール旋回の最大角速度（度/秒）
    #[serde(default = "default_hmd_roll_rate")]
    pub hmd_roll_control_rate: f32,
    /// スナップターン後の向き平滑化時間（秒）
    #[serde(default = "default_smooth_orientation_time")]
    pub smooth_orientation_time: f32,
}

fn default_walk_speed() -> f32 { 2.6 }
fn default_sprint_speed() -> f32 { 3.969 }
fn default_analog_plus_walk_speed() -> f32 { 6.0 }
fn default_analog_plus_sprint_speed() -> f32 { 12.0 }
fn default_max_flying_speed() -> f32 { 30.0 }
fn default_gear_1() -> f32 { 0.2 }
fn default_gear_2() -> f32 { 0.4 }
fn default_gear_3() -> f32 { 0.8 }
fn default_gear_4() -> f32 { 0.9 }
fn default_gear_5() -> f32 { 1.0 }
fn default_stick_full_on() -> f32 { 0.85 }
fn default_desktop_sprint_scalar() -> f32 { 3.0 }
fn default_hmd_sprint_scalar() -> f32 { 2.0 }
fn default_yaw_speed() -> f32 { 100.0 }
fn default_pitch_speed() -> f32 { 75.0 }
fn default_hmd_roll_dead_zone() -> f32 { 8.0 }
fn default_hmd_roll_rate() -> f32 { 114.0 }
fn default_smooth_orientation_time() -> f32 { 0.5 }
fn default_true() -> bool { true }

impl Default for LocomotionConfig {
    fn default() -> Self {
        Self {
            walk_speed: default_walk_speed(),
            sprint_speed: default_sprint_speed(),
            analog_plus_walk_speed: default_analog_plus_walk_speed(),
            analog_plus_sprint_speed: default_analog_plus_sprint_speed(),
            max_flying_speed: default_max_flying_speed(),
            gear_1: default_gear_1(),
            gear_2: default_gear_2(),
            gear_3: default_gear_3(),
            gear_4: default_gear_4(),
            gear_5: default_gear_5(),
            stick_full_on: default_stick_full_on(),
            desktop_sprint_scalar: default_desktop_sprint_scalar(),
            hmd_sprint_scalar: default_hmd_sprint_scalar(),
            yaw_speed: default_yaw_speed(),
            pitch_speed: default_pitch_speed(),
            hmd_roll_control_enabled: default_true(),
            hmd_roll_control_dead_zone: default_hmd_roll_dead_zone(),
            hmd_roll_control_rate: default_hmd_roll_rate(),
            smooth_orientation_time: default_smooth_orientation_time(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecenterConfig {
    /// リーンリセンタリングの有効化
    #[serde(default = "default_true")]
    pub lean_recenter_enabled: bool,
    /// ステップ検出時に回転もリセンタリングする
    #[serde(default = "default_true")]
    pub step_reset_rotation: bool,
    /// 回転リセンタリングの角度閾値（ラジアン）
    #[serde(default = "default_rotation_threshold")]
    pub rotation_threshold: f32,
    /// 頭の向き移動平均の時定数（秒）
    #[serde(default = "default_rotation_filter_length")]
    pub rotation_filter_length: f32,
    /// 許容する前傾（メートル）
    #[serde(default = "default_max_forward_lean")]
    pub max_forward_lean: f32,
    /// 許容する後傾（メートル）
    #[serde(default = "default_max_backward_lean")]
    pub max_backward_lean: f32,
    /// 許容する横傾（メートル）
    #[serde(default = "default_max_lateral_lean")]
    pub max_lateral_lean: f32,
    /// 立位の垂直許容シリンダー上限（メートル）
    #[serde(default = "default_cylinder_top")]
    pub cylinder_top: f32,
    /// 立位の垂直許容シリンダー下限（メートル）
    #[serde(default = "default_cylinder_bottom")]
    pub cylinder_bottom: f32,
    /// 座位の垂直許容下限（メートル）
    #[serde(default = "default_sitting_bottom")]
    pub sitting_bottom: f32,
    /// 支持基底面: 左右のステップ閾値（メートル）
    #[serde(default = "default_lateral_stepping")]
    pub lateral_stepping_threshold: f32,
    /// 支持基底面: 前方のステップ閾値（メートル）
    #[serde(default = "default_anterior_stepping")]
    pub anterior_stepping_threshold: f32,
    /// 支持基底面: 後方のステップ閾値（メートル）
    #[serde(default = "default_posterior_stepping")]
    pub posterior_stepping_threshold: f32,
    /// 頭の角速度がこの値未満ならステップ候補（rad/s）
    #[serde(default = "default_head_angular_velocity_threshold")]
    pub head_angular_velocity_threshold: f32,
    /// 頭の高さが最頻値からこの値以上下がっていないこと（メートル）
    #[serde(default = "default_mode_height_threshold")]
    pub mode_height_threshold: f32,
    /// 手と頭の速度方向の一致閾値（内積）
    #[serde(default = "default_hands_velocity_direction")]
    pub hands_velocity_direction_threshold: f32,
    /// 手の角速度閾値（rad/s）
    #[serde(default = "default_hands_angular_velocity")]
    pub hands_angular_velocity_threshold: f32,
    /// 頭の速度がこの値を超えたらステップ候補（m/s）
    #[serde(default = "default_head_velocity_threshold")]
    pub head_velocity_threshold: f32,
    /// 頭が水平とみなすピッチ/ロール許容差（度）
    #[serde(default = "default_head_level_tolerance")]
    pub head_level_tolerance: f32,
    /// 脊椎の伸び許容率（デフォルト距離比）
    #[serde(default = "default_spine_stretch_limit")]
    pub spine_stretch_limit: f32,
}

fn default_rotation_threshold() -> f32 { 0.5236 }
fn default_rotation_filter_length() -> f32 { 4.0 }
fn default_max_forward_lean() -> f32 { 0.15 }
fn default_max_backward_lean() -> f32 { 0.1 }
fn default_max_lateral_lean() -> f32 { 0.3 }
fn default_cylinder_top() -> f32 { 2.0 }
fn default_cylinder_bottom() -> f32 { -1.5 }
fn default_sitting_bottom() -> f32 { -0.02 }
fn default_lateral_stepping() -> f32 { 0.10 }
fn default_anterior_stepping() -> f32 { 0.04 }
fn default_posterior_stepping() -> f32 { 0.05 }
fn default_head_angular_velocity_threshold() -> f32 { 0.3 }
fn default_mode_height_threshold() -> f32 { -0.02 }
fn default_hands_velocity_direction() -> f32 { 0.4 }
fn default_hands_angular_velocity() -> f32 { 3.3 }
fn default_head_velocity_threshold() -> f32 { 0.18 }
fn default_head_level_tolerance() -> f32 { 7.0 }
fn default_spine_stretch_limit() -> f32 { 0.04 }

impl Default for RecenterConfig {
    fn default() -> Self {
        Self {
            lean_recenter_enabled: default_true(),
            step_reset_rotation: default_true(),
            rotation_threshold: default_rotation_threshold(),
            rotation_filter_length: default_rotation_filter_length(),
            max_forward_lean: default_max_forward_lean(),
            max_backward_lean: default_max_backward_lean(),
            max_lateral_lean: default_max_lateral_lean(),
            cylinder_top: default_cylinder_top(),
            cylinder_bottom: default_cylinder_bottom(),
            sitting_bottom: default_sitting_bottom(),
            lateral_stepping_threshold: default_lateral_stepping(),
            anterior_stepping_threshold: default_anterior_stepping(),
            posterior_stepping_threshold: default_posterior_stepping(),
            head_angular_velocity_threshold: default_head_angular_velocity_threshold(),
            mode_height_threshold: default_mode_height_threshold(),
            hands_velocity_direction_threshold: default_hands_velocity_direction(),
            hands_angular_velocity_threshold: default_hands_angular_velocity(),
            head_velocity_threshold: default_head_velocity_threshold(),
            head_level_tolerance: default_head_level_tolerance(),
            spine_stretch_limit: default_spine_stretch_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SitStandConfig {
    /// 転換点に対する起立判定倍率
    #[serde(default = "default_standing_multiple")]
    pub standing_multiple: f32,
    /// 転換点に対する着座判定倍率
    #[serde(default = "default_sitting_multiple")]
    pub sitting_multiple: f32,
    /// 着座確定までの時間（秒）
    #[serde(default = "default_sitting_timeout")]
    pub sitting_timeout: f32,
    /// 起立確定までの時間（秒）
    #[serde(default = "default_standing_timeout")]
    pub standing_timeout: f32,
    /// 座っているとみなせる平均高さの上限（メートル）
    #[serde(default = "default_sitting_upper_bound")]
    pub sitting_upper_bound: f32,
    /// 平均高さEMAの係数
    #[serde(default = "default_height_filter_coefficient")]
    pub height_filter_coefficient: f32,
    /// しゃがみ判定の頭の降下量（メートル）
    #[serde(default = "default_squat_threshold")]
    pub squat_threshold: f32,
    /// しゃがみ確定までの時間（秒）
    #[serde(default = "default_squat_timeout")]
    pub squat_timeout: f32,
    /// 歩行解除の頭速度閾値（m/s）
    #[serde(default = "default_walk_speed_threshold")]
    pub walk_speed_threshold: f32,
}

fn default_standing_multiple() -> f32 { 1.2 }
fn default_sitting_multiple() -> f32 { 0.833 }
fn default_sitting_timeout() -> f32 { 4.0 }
fn default_standing_timeout() -> f32 { 0.3333 }
fn default_sitting_upper_bound() -> f32 { 1.52 }
fn default_height_filter_coefficient() -> f32 { 0.01 }
fn default_squat_threshold() -> f32 { 0.05 }
fn default_squat_timeout() -> f32 { 30.0 }
fn default_walk_speed_threshold() -> f32 { 0.15 }

impl Default for SitStandConfig {
    fn default() -> Self {
        Self {
            standing_multiple: default_standing_multiple(),
            sitting_multiple: default_sitting_multiple(),
            sitting_timeout: default_sitting_timeout(),
            standing_timeout: default_standing_timeout(),
            sitting_upper_bound: default_sitting_upper_bound(),
            height_filter_coefficient: default_height_filter_coefficient(),
            squat_threshold: default_squat_threshold(),
            squat_timeout: default_squat_timeout(),
            walk_speed_threshold: default_walk_speed_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BalanceConfig {
    /// 重心モデルの有効化
    #[serde(default)]
    pub cg_model_enabled: bool,
    /// 頭の質量（相対値）
    #[serde(default = "default_head_mass")]
    pub head_mass: f32,
    /// 片手の質量（相対値）
    #[serde(default = "default_hand_mass")]
    pub hand_mass: f32,
    /// 腰の質量（相対値）
    #[serde(default = "default_hips_mass")]
    pub hips_mass: f32,
    /// 支持基底面: 前端（-Z方向、メートル）
    #[serde(default = "default_support_base_front")]
    pub support_base_front: f32,
    /// 支持基底面: 後端（メートル）
    #[serde(default = "default_support_base_back")]
    pub support_base_back: f32,
    /// 支持基底面: 左端（メートル）
    #[serde(default = "default_support_base_left")]
    pub support_base_left: f32,
    /// 支持基底面: 右端（メートル）
    #[serde(default = "default_support_base_right")]
    pub support_base_right: f32,
    /// 前方向のダンピング係数（股関節の屈曲を考慮して小さめ）
    #[serde(default = "default_forward_dampening")]
    pub forward_dampening_factor: f32,
    /// 横方向のダンピング係数
    #[serde(default = "default_lateral_dampening")]
    pub lateral_dampening_factor: f32,
    /// 腰の向きを頭の向きへ寄せる混合率
    #[serde(default = "default_hips_facing_mix")]
    pub hips_facing_mix: f32,
    /// つま先立ちで許す腰の上昇（メートル）
    #[serde(default = "default_toes_allowance")]
    pub toes_allowance: f32,
}

fn default_head_mass() -> f32 { 20.0 }
fn default_hand_mass() -> f32 { 2.0 }
fn default_hips_mass() -> f32 { 40.0 }
fn default_support_base_front() -> f32 { -0.20 }
fn default_support_base_back() -> f32 { 0.12 }
fn default_support_base_left() -> f32 { -0.25 }
fn default_support_base_right() -> f32 { 0.25 }
fn default_forward_dampening() -> f32 { 0.5 }
fn default_lateral_dampening() -> f32 { 2.0 }
fn default_hips_facing_mix() -> f32 { 0.3 }
fn default_toes_allowance() -> f32 { 0.05 }

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            cg_model_enabled: false,
            head_mass: default_head_mass(),
            hand_mass: default_hand_mass(),
            hips_mass: default_hips_mass(),
            support_base_front: default_support_base_front(),
            support_base_back: default_support_base_back(),
            support_base_left: default_support_base_left(),
            support_base_right: default_support_base_right(),
            forward_dampening_factor: default_forward_dampening(),
            lateral_dampening_factor: default_lateral_dampening(),
            hips_facing_mix: default_hips_facing_mix(),
            toes_allowance: default_toes_allowance(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SafeLandingConfig {
    /// 天井と床の間に必要な空間（半身長に対する倍率）
    #[serde(default = "default_half_height_factor")]
    pub half_height_factor: f32,
    /// 天井を遡る探索の反復上限
    #[serde(default = "default_iteration_limit")]
    pub iteration_limit: usize,
    /// 上空からのレイキャスト開始高度（メートル）
    #[serde(default = "default_sky_cast_height")]
    pub sky_cast_height: f32,
}

fn default_half_height_factor() -> f32 { 2.25 }
fn default_iteration_limit() -> usize { 1000 }
fn default_sky_cast_height() -> f32 { 16384.0 }

impl Default for SafeLandingConfig {
    fn default() -> Self {
        Self {
            half_height_factor: default_half_height_factor(),
            iteration_limit: default_iteration_limit(),
            sky_cast_height: default_sky_cast_height(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EntityConfig {
    /// 同時に保持できるアバターエンティティ数の上限
    #[serde(default = "default_max_avatar_entities")]
    pub max_avatar_entities: usize,
}

fn default_max_avatar_entities() -> usize { 42 }

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            max_avatar_entities: default_max_avatar_entities(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "config load failed ({}), using defaults: {}",
                    path.as_ref().display(),
                    e
                );
                Config::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sit_stand.sitting_timeout, 4.0);
        assert_eq!(config.locomotion.gear_5, 1.0);
        assert_eq!(config.entities.max_avatar_entities, 42);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml_str = r#"
            [user]
            height = 1.6

            [locomotion]
            walk_speed = 3.0
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.user.height, 1.6);
        assert_eq!(config.locomotion.walk_speed, 3.0);
        // 未指定のフィールドはデフォルト
        assert_eq!(config.locomotion.sprint_speed, 3.969);
        assert_eq!(config.recenter.max_forward_lean, 0.15);
    }

    #[test]
    fn test_gears_ascending_by_default() {
        let c = LocomotionConfig::default();
        assert!(c.gear_1 < c.gear_2);
        assert!(c.gear_2 < c.gear_3);
        assert!(c.gear_3 < c.gear_4);
        assert!(c.gear_4 < c.gear_5);
    }

    #[test]
    fn test_user_eye_height() {
        let user = UserConfig::default();
        assert!((user.eye_height() - 1.64).abs() < 1e-5);
    }
}
