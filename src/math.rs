//! アバター空間計算の基礎部品。
//!
//! 座標系: Y上、-Z前方（HMD前方と一致）。
//! センサー空間 → ワールド空間の変換は一様スケール付き剛体変換で表す。

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector2, Vector3};

/// ほぼゼロ判定の閾値
pub const ALMOST_ZERO: f32 = 1.0e-4;

/// 回転 + 平行移動（スケールなし）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub rotation: UnitQuaternion<f32>,
    pub translation: Vector3<f32>,
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f32>, translation: Vector3<f32>) -> Self {
        Self { rotation, translation }
    }

    pub fn transform_point(&self, p: &Vector3<f32>) -> Vector3<f32> {
        self.rotation * p + self.translation
    }

    pub fn transform_vector(&self, v: &Vector3<f32>) -> Vector3<f32> {
        self.rotation * v
    }

    pub fn inverse(&self) -> Self {
        let inv_rot = self.rotation.inverse();
        Self {
            rotation: inv_rot,
            translation: -(inv_rot * self.translation),
        }
    }

    /// self ∘ other （other を先に適用）
    pub fn compose(&self, other: &Transform) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.transform_point(&other.translation),
        }
    }

    /// 全成分が有限か
    pub fn is_finite(&self) -> bool {
        self.translation.iter().all(|c| c.is_finite())
            && self.rotation.coords.iter().all(|c| c.is_finite())
    }
}

/// 一様スケール付き剛体変換: p' = R * (s * p) + t
///
/// センサー→ワールド変換に使う。スケールは
/// (アバター目線高さ / ユーザー実目線高さ)。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledTransform {
    pub scale: f32,
    pub rotation: UnitQuaternion<f32>,
    pub translation: Vector3<f32>,
}

impl ScaledTransform {
    pub fn identity() -> Self {
        Self {
            scale: 1.0,
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(scale: f32, rotation: UnitQuaternion<f32>, translation: Vector3<f32>) -> Self {
        Self { scale, rotation, translation }
    }

    pub fn from_transform(t: &Transform) -> Self {
        Self::new(1.0, t.rotation, t.translation)
    }

    pub fn transform_point(&self, p: &Vector3<f32>) -> Vector3<f32> {
        self.rotation * (self.scale * p) + self.translation
    }

    /// 方向ベクトルの変換（スケール込み、平行移動なし）
    pub fn transform_vector(&self, v: &Vector3<f32>) -> Vector3<f32> {
        self.rotation * (self.scale * v)
    }

    pub fn inverse(&self) -> Self {
        let inv_scale = 1.0 / self.scale;
        let inv_rot = self.rotation.inverse();
        Self {
            scale: inv_scale,
            rotation: inv_rot,
            translation: -(inv_rot * (inv_scale * self.translation)),
        }
    }

    /// self ∘ other （other を先に適用）
    pub fn compose(&self, other: &ScaledTransform) -> Self {
        Self {
            scale: self.scale * other.scale,
            rotation: self.rotation * other.rotation,
            translation: self.transform_point(&other.translation),
        }
    }

    pub fn compose_transform(&self, other: &Transform) -> Self {
        self.compose(&ScaledTransform::from_transform(other))
    }

    /// スケールを捨てて剛体変換として取り出す
    pub fn to_transform(&self) -> Transform {
        Transform::new(self.rotation, self.translation)
    }
}

/// ゼロ長なら fallback を返す正規化
pub fn safe_normalize(v: Vector3<f32>, fallback: Vector3<f32>) -> Vector3<f32> {
    let len = v.norm();
    if len > ALMOST_ZERO {
        v / len
    } else {
        fallback
    }
}

/// 回転 q を「axis まわりの捻り(twist)」と「残りの振り(swing)」に分解する。
/// q = swing * twist が成り立つ。
pub fn swing_twist_decomposition(
    q: &UnitQuaternion<f32>,
    axis: &Vector3<f32>,
) -> (UnitQuaternion<f32>, UnitQuaternion<f32>) {
    let axis = safe_normalize(*axis, Vector3::y());
    let rot_axis = q.vector();
    let projected = axis * rot_axis.dot(&axis);
    let twist_raw = nalgebra::Quaternion::new(q.w, projected.x, projected.y, projected.z);
    let twist = if twist_raw.norm() > ALMOST_ZERO {
        UnitQuaternion::from_quaternion(twist_raw)
    } else {
        // 回転軸が axis と直交 → 捻り成分なし
        UnitQuaternion::identity()
    };
    let swing = q * twist.inverse();
    (swing, twist)
}

/// ロールとピッチを打ち消し、ヨー成分だけ残した回転を返す。
/// 前方ベクトルが真上/真下を向く縮退時は X 軸を前方の代替にする。
pub fn cancel_roll_and_pitch(q: &UnitQuaternion<f32>) -> UnitQuaternion<f32> {
    let z_axis = q * Vector3::z();
    let flat = Vector3::new(z_axis.x, 0.0, z_axis.z);
    let new_z = safe_normalize(flat, Vector3::x());
    let new_x = Vector3::y().cross(&new_z);
    let new_y = new_z.cross(&new_x);
    quat_from_axes(&new_x, &new_y, &new_z)
}

/// 直交基底（列ベクトル）からクォータニオンを構築
fn quat_from_axes(
    x: &Vector3<f32>,
    y: &Vector3<f32>,
    z: &Vector3<f32>,
) -> UnitQuaternion<f32> {
    let m = Matrix3::from_columns(&[*x, *y, *z]);
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(m))
}

/// 頭の回転から胴体の向きを推定する。
/// 頭が大きくうなずいている（前方が上下に近い）場合は頭の上方向を前方の代わりに使う。
pub fn body_facing_from_head(head: &UnitQuaternion<f32>, up: &Vector3<f32>) -> UnitQuaternion<f32> {
    let up = safe_normalize(*up, Vector3::y());
    let head_forward = head * -Vector3::z();
    // 前方が up に 30°以内まで平行なら、頭の上ベクトルで代用
    const COSINE_THIRTY_DEGREES: f32 = 0.866;
    let forward = if head_forward.dot(&up).abs() > COSINE_THIRTY_DEGREES {
        let head_up = head * Vector3::y();
        // 見下ろし時は head_up が前方へ、見上げ時は後方へ倒れる
        if head_forward.dot(&up) < 0.0 {
            -head_up
        } else {
            head_up
        }
    } else {
        head_forward
    };
    let flat = forward - up * forward.dot(&up);
    let new_neg_z = safe_normalize(flat, -Vector3::z());
    let new_z = -new_neg_z;
    let new_x = up.cross(&new_z);
    quat_from_axes(&new_x, &up, &new_z)
}

/// XZ平面上の前方向き（-Z前方）。縮退時は (1, 0)。
pub fn facing_dir_2d(q: &UnitQuaternion<f32>) -> Vector2<f32> {
    let facing = q * -Vector3::z();
    let flat = Vector2::new(facing.x, facing.z);
    if flat.norm() > ALMOST_ZERO {
        flat.normalize()
    } else {
        Vector2::new(1.0, 0.0)
    }
}

/// primary/secondary 軸から正規直交基底 (u, v, w) を生成する。
/// u = primary 正規化, w = u × secondary, v = w × u。
/// secondary が u と平行な縮退時は標準軸へフォールバックし、NaN を返さない。
pub fn generate_basis_vectors(
    primary: &Vector3<f32>,
    secondary: &Vector3<f32>,
) -> (Vector3<f32>, Vector3<f32>, Vector3<f32>) {
    let u = safe_normalize(*primary, Vector3::y());
    let norm_secondary = safe_normalize(*secondary, Vector3::z());
    let mut w = u.cross(&norm_secondary);
    if w.norm() < ALMOST_ZERO {
        // u と平行 → u に直交する標準軸を選ぶ
        let candidate = if u.x.abs() < 0.9 { Vector3::x() } else { Vector3::z() };
        w = u.cross(&candidate);
    }
    let w = w.normalize();
    let v = w.cross(&u);
    (u, v, w)
}

/// up軸(u=y) と前方(v=z) から回転を作る。computeNewHipsMatrix相当の基底構築。
pub fn rotation_from_up_and_facing(
    up: &Vector3<f32>,
    facing: &Vector3<f32>,
) -> UnitQuaternion<f32> {
    let (u, v, w) = generate_basis_vectors(up, facing);
    quat_from_axes(&w, &u, &v)
}

/// クォータニオンNLERP（最短経路、正規化つき）
pub fn nlerp(a: &UnitQuaternion<f32>, b: &UnitQuaternion<f32>, t: f32) -> UnitQuaternion<f32> {
    let mut bq = b.into_inner();
    if a.coords.dot(&b.coords) < 0.0 {
        bq = -bq;
    }
    let mixed = a.into_inner().lerp(&bq, t);
    if mixed.norm() > ALMOST_ZERO {
        UnitQuaternion::from_quaternion(mixed)
    } else {
        *a
    }
}

pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

pub fn lerp_vec2(a: &Vector2<f32>, b: &Vector2<f32>, t: f32) -> Vector2<f32> {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::{FRAC_PI_2, PI};

    #[test]
    fn test_scaled_transform_round_trip() {
        let t = ScaledTransform::new(
            2.0,
            UnitQuaternion::from_euler_angles(0.1, 0.7, -0.2),
            Vector3::new(1.0, 2.0, 3.0),
        );
        let p = Vector3::new(-0.5, 1.25, 4.0);
        let back = t.inverse().transform_point(&t.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-5);
    }

    #[test]
    fn test_scaled_transform_compose_matches_sequential() {
        let a = ScaledTransform::new(
            1.5,
            UnitQuaternion::from_euler_angles(0.0, 0.3, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        );
        let b = ScaledTransform::new(
            0.5,
            UnitQuaternion::from_euler_angles(0.2, 0.0, 0.1),
            Vector3::new(2.0, 0.0, -1.0),
        );
        let p = Vector3::new(1.0, 1.0, 1.0);
        let composed = a.compose(&b).transform_point(&p);
        let sequential = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(composed, sequential, epsilon = 1e-5);
    }

    #[test]
    fn test_swing_twist_recomposes() {
        let q = UnitQuaternion::from_euler_angles(0.4, 1.1, -0.3);
        let (swing, twist) = swing_twist_decomposition(&q, &Vector3::y());
        let recomposed = swing * twist;
        assert_relative_eq!(recomposed.coords.dot(&q.coords).abs(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_twist_is_pure_yaw_for_y_axis() {
        let q = UnitQuaternion::from_euler_angles(0.3, 0.8, 0.1);
        let (_, twist) = swing_twist_decomposition(&q, &Vector3::y());
        // Y軸捻りは回転軸がY方向のみ
        assert!(twist.vector().x.abs() < 1e-5);
        assert!(twist.vector().z.abs() < 1e-5);
    }

    #[test]
    fn test_cancel_roll_and_pitch_keeps_yaw() {
        let yaw_only = UnitQuaternion::from_euler_angles(0.0, 1.2, 0.0);
        let with_tilt = UnitQuaternion::from_euler_angles(0.5, 1.2, -0.4);
        let cancelled = cancel_roll_and_pitch(&with_tilt);
        let fwd_expected = yaw_only * Vector3::z();
        let fwd_actual = cancelled * Vector3::z();
        assert_relative_eq!(fwd_actual.x, fwd_expected.x, epsilon = 1e-4);
        assert_relative_eq!(fwd_actual.z, fwd_expected.z, epsilon = 1e-4);
        assert!(fwd_actual.y.abs() < 1e-4);
    }

    #[test]
    fn test_cancel_roll_and_pitch_degenerate_straight_down() {
        // 真下を向いた回転: Z軸が真上/真下に写る
        let q = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), FRAC_PI_2);
        let cancelled = cancel_roll_and_pitch(&q);
        assert!(cancelled.coords.iter().all(|c| c.is_finite()));
    }

    #[test]
    fn test_facing_dir_2d_identity() {
        let f = facing_dir_2d(&UnitQuaternion::identity());
        assert_relative_eq!(f.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(f.y, -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_facing_dir_2d_half_turn() {
        let q = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), PI);
        let f = facing_dir_2d(&q);
        assert_relative_eq!(f.y, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_generate_basis_orthonormal() {
        let (u, v, w) = generate_basis_vectors(
            &Vector3::new(0.1, 1.0, 0.05),
            &Vector3::new(0.0, 0.2, 1.0),
        );
        assert_relative_eq!(u.norm(), 1.0, epsilon = 1e-5);
        assert_relative_eq!(v.norm(), 1.0, epsilon = 1e-5);
        assert_relative_eq!(w.norm(), 1.0, epsilon = 1e-5);
        assert!(u.dot(&v).abs() < 1e-5);
        assert!(u.dot(&w).abs() < 1e-5);
        assert!(v.dot(&w).abs() < 1e-5);
    }

    #[test]
    fn test_generate_basis_degenerate_parallel() {
        // secondary が primary と平行でも有限な基底が返る
        let (u, v, w) = generate_basis_vectors(&Vector3::y(), &Vector3::y());
        for axis in [u, v, w] {
            assert!(axis.iter().all(|c| c.is_finite()));
            assert_relative_eq!(axis.norm(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_generate_basis_zero_vectors() {
        let (u, v, w) = generate_basis_vectors(&Vector3::zeros(), &Vector3::zeros());
        for axis in [u, v, w] {
            assert!(axis.iter().all(|c| c.is_finite()));
        }
    }

    #[test]
    fn test_body_facing_from_head_level() {
        // 水平な頭 → 胴体の向きは頭のヨーと一致
        let head = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.9);
        let body = body_facing_from_head(&head, &Vector3::y());
        let head_f = facing_dir_2d(&head);
        let body_f = facing_dir_2d(&body);
        assert_relative_eq!(head_f.dot(&body_f), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_body_facing_from_head_looking_down() {
        // 真下を向いても有限で、上方向はworld-up
        let head = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -FRAC_PI_2);
        let body = body_facing_from_head(&head, &Vector3::y());
        assert!(body.coords.iter().all(|c| c.is_finite()));
        let up = body * Vector3::y();
        assert_relative_eq!(up.dot(&Vector3::y()), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_nlerp_shortest_path() {
        let a = UnitQuaternion::identity();
        let b = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.5);
        let neg_b = UnitQuaternion::from_quaternion(-b.into_inner());
        let via_pos = nlerp(&a, &b, 0.5);
        let via_neg = nlerp(&a, &neg_b, 0.5);
        // 符号反転しても同じ回転に収束する
        assert_relative_eq!(via_pos.coords.dot(&via_neg.coords).abs(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_rotation_from_up_and_facing_identity() {
        let q = rotation_from_up_and_facing(&Vector3::y(), &Vector3::z());
        assert_relative_eq!(q.angle(), 0.0, epsilon = 1e-5);
    }
}
