//! 頭（と手）のトラッキングから胴体（腰）の位置と向きを推定する。
//!
//! 2つの戦略がある:
//! - 首オフセット法: 頭のポーズからリグの頭→首→腰オフセットで腰を求める（センサー空間）
//! - 重心(CG)法: 頭と両手の質量バランスから腰の位置を解く（アバター空間）
//!
//! どちらも縮退入力で NaN を返してはならない。

use nalgebra::{UnitQuaternion, Vector3};

use crate::config::BalanceConfig;
use crate::math::{
    body_facing_from_head, cancel_roll_and_pitch, generate_basis_vectors, nlerp,
    rotation_from_up_and_facing, safe_normalize, Transform,
};
use crate::pose::TrackedPose;
use crate::rig::{head_neck_hips_offsets, SkeletonRig, StandardRig};

/// 頭のセンサーポーズから腰の変換を推定する（首オフセット法）。
///
/// 頭が無効なら (0, user_height, 0)・無回転の決定的フォールバック。
/// eyeToNeck は頭のフル回転、neckToRoot はヨー成分のみで回す。
pub fn derive_body_from_hmd(
    head: &TrackedPose,
    rig: &dyn SkeletonRig,
    user_height: f32,
    user_eye_height: f32,
) -> Transform {
    let (head_position, head_orientation) = if head.is_valid() {
        (head.translation, head.rotation)
    } else {
        (Vector3::new(0.0, user_height, 0.0), UnitQuaternion::identity())
    };
    let yaw_only = cancel_roll_and_pitch(&head_orientation);

    let (head_to_neck_local, neck_to_root_local) = head_neck_hips_offsets(rig);

    let head_to_neck = head_orientation * head_to_neck_local;
    let neck_to_root = yaw_only * neck_to_root_local;

    // センサー空間はユーザー実寸なので、リグ空間のオフセットを
    // 実目線高さ/リグ目線高さ で縮尺する
    let inv_sensor_to_world_scale = user_eye_height / rig.eye_height().max(0.1);
    let body_position = head_position + inv_sensor_to_world_scale * (head_to_neck + neck_to_root);

    Transform::new(yaw_only, body_position)
}

/// 支持基底面の縁の手前で効き始めるソフトクランプ
fn slope(num: f32) -> f32 {
    if num > 0.0 {
        1.0 - 1.0 / (1.0 + num)
    } else {
        1.0
    }
}

/// 重心を支持基底面の内側へ減衰させる（アバター空間）。
/// base_of_support_scale はユーザー身長に基づく縮尺。
fn dampen_cg_movement(
    cg_avatar_space: Vector3<f32>,
    base_of_support_scale: f32,
    cfg: &BalanceConfig,
) -> Vector3<f32> {
    // 前方向は股関節の屈曲があるため縁より手前で効かせる
    let clamp_front = cfg.support_base_front * cfg.forward_dampening_factor * base_of_support_scale;
    let clamp_back = cfg.support_base_back * cfg.lateral_dampening_factor * base_of_support_scale;
    let clamp_left = cfg.support_base_left * cfg.lateral_dampening_factor * base_of_support_scale;
    let clamp_right = cfg.support_base_right * cfg.lateral_dampening_factor * base_of_support_scale;

    let mut damped = Vector3::zeros();
    if cg_avatar_space.z < 0.0 {
        // 前方へ
        damped.z = slope((cg_avatar_space.z / clamp_front).abs()) * clamp_front;
    } else {
        damped.z = slope((cg_avatar_space.z / clamp_back).abs()) * clamp_back;
    }
    if cg_avatar_space.x > 0.0 {
        // 右へ
        damped.x = slope((cg_avatar_space.x / clamp_right).abs()) * clamp_right;
    } else {
        damped.x = slope((cg_avatar_space.x / clamp_left).abs()) * clamp_left;
    }
    damped
}

/// 頭・両手のアバター空間位置（無効ならリグのフォールバック位置）
struct MassPoints {
    head: Vector3<f32>,
    left_hand: Vector3<f32>,
    right_hand: Vector3<f32>,
    tpose_head: Vector3<f32>,
    tpose_hips: Vector3<f32>,
}

fn gather_mass_points(
    head: &TrackedPose,
    left_hand: &TrackedPose,
    right_hand: &TrackedPose,
    rig: &dyn SkeletonRig,
) -> MassPoints {
    let fallback = StandardRig::new();
    let default_of = |name: &str| -> Vector3<f32> {
        rig.index_of_joint(name)
            .and_then(|i| rig.absolute_default_pose(i))
            .map(|t| t.translation)
            .unwrap_or_else(|| {
                let i = fallback.index_of_joint(name).unwrap();
                fallback.absolute_default_pose(i).unwrap().translation
            })
    };
    let current_of = |name: &str, pose: &TrackedPose| -> Vector3<f32> {
        if pose.is_valid() {
            pose.translation
        } else {
            rig.index_of_joint(name)
                .and_then(|i| rig.absolute_pose(i))
                .map(|t| t.translation)
                .unwrap_or_else(|| default_of(name))
        }
    };
    MassPoints {
        head: current_of("Head", head),
        left_hand: current_of("LeftHand", left_hand),
        right_hand: current_of("RightHand", right_hand),
        tpose_head: default_of("Head"),
        tpose_hips: default_of("Hips"),
    }
}

/// 頭と両手の釣り合いから腰の位置を求める（アバター空間）。
pub fn compute_counter_balance(
    head: &TrackedPose,
    left_hand: &TrackedPose,
    right_hand: &TrackedPose,
    rig: &dyn SkeletonRig,
    cfg: &BalanceConfig,
    user_eye_height: f32,
) -> Vector3<f32> {
    let points = gather_mass_points(head, left_hand, right_hand, rig);

    // 頭と両手のモーメント和から現在の重心を求める
    let sum_of_moments = cfg.head_mass * points.head
        + cfg.hand_mass * points.left_hand
        + cfg.hand_mass * points.right_hand;
    let total_mass = cfg.head_mass + 2.0 * cfg.hand_mass;
    let mut current_cg = sum_of_moments / total_mass;
    current_cg.y = 0.0;

    let base_scale = if user_eye_height > 0.0 {
        user_eye_height / crate::rig::DEFAULT_RIG_EYE_HEIGHT
    } else {
        1.0
    };
    let desired_cg = dampen_cg_movement(current_cg, base_scale, cfg);

    // desired_cg を保つような腰の位置を逆算する
    let counter_balanced_for_head = (total_mass + cfg.hips_mass) * desired_cg - sum_of_moments;
    let mut counter_balanced_cg = counter_balanced_for_head / cfg.hips_mass;

    // 頭と腰の距離がデフォルトの解剖学的距離になる高さを解く
    let xz_diff = Vector3::new(
        points.head.x - counter_balanced_cg.x,
        0.0,
        points.head.z - counter_balanced_cg.z,
    );
    let head_minus_hip_xz = xz_diff.norm();
    let head_hip_default = (points.tpose_head - points.tpose_hips).norm();
    let hip_height = if head_hip_default > head_minus_hip_xz {
        (head_hip_default * head_hip_default - head_minus_hip_xz * head_minus_hip_xz).sqrt()
    } else {
        0.0
    };
    counter_balanced_cg.y = points.head.y - hip_height;

    // 足が床から浮かないように。つま先立ちのぶんだけ上を許す
    let ceiling = points.tpose_hips.y + cfg.toes_allowance;
    if counter_balanced_cg.y > ceiling {
        counter_balanced_cg.y = ceiling;
    }
    counter_balanced_cg
}

/// 新しい腰の行列を作る。up軸は腰→頭、向きは頭の向きを mix 率で混ぜたもの。
pub fn compute_new_hips_transform(
    head_orientation: &UnitQuaternion<f32>,
    head_position: &Vector3<f32>,
    hips_position: &Vector3<f32>,
    hips_facing_mix: f32,
) -> Transform {
    let body_orientation = body_facing_from_head(head_orientation, &Vector3::y());
    let hips_rot = nlerp(&UnitQuaternion::identity(), &body_orientation, hips_facing_mix);
    let hips_facing = hips_rot * Vector3::z();

    let spine = safe_normalize(head_position - hips_position, Vector3::y());
    let (_, _, _) = generate_basis_vectors(&spine, &hips_facing);
    let rotation = rotation_from_up_and_facing(&spine, &hips_facing);
    Transform::new(rotation, *hips_position)
}

/// 重心モデルで腰の変換を推定する（アバター空間）。
///
/// ポーズはすべてアバター空間。結果は常に有限。
pub fn derive_body_from_cg(
    head: &TrackedPose,
    left_hand: &TrackedPose,
    right_hand: &TrackedPose,
    rig: &dyn SkeletonRig,
    cfg: &BalanceConfig,
    user_eye_height: f32,
) -> Transform {
    let cg_hips_position =
        compute_counter_balance(head, left_hand, right_hand, rig, cfg, user_eye_height);

    let (head_orientation, head_position) = if head.is_valid() {
        (head.rotation, head.translation)
    } else {
        let points = gather_mass_points(head, left_hand, right_hand, rig);
        (UnitQuaternion::identity(), points.tpose_head)
    };

    compute_new_hips_transform(
        &head_orientation,
        &head_position,
        &cg_hips_position,
        cfg.hips_facing_mix,
    )
}
