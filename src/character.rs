//! Physics character-controller contract.
//!
//! The embodiment core never talks to a physics engine directly: it pushes
//! motors and follow targets through `CharacterController` and reads back the
//! resolved state. `KinematicCharacterController` is a collision-free
//! implementation of the same contract for tests and the demo binary.

use std::sync::{Arc, Mutex};

use nalgebra::{UnitQuaternion, Vector3};

use crate::math::{nlerp, Transform};

/// Timescale treated as "infinite": the motor holds its current velocity.
pub const INVALID_MOTOR_TIMESCALE: f32 = 1.0e6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterState {
    Ground,
    InAir,
    Hover,
}

/// A desired-velocity request with per-axis reaction timescales.
#[derive(Debug, Clone, Copy)]
pub struct Motor {
    pub velocity: Vector3<f32>,
    /// Frame the velocity is expressed in.
    pub rotation: UnitQuaternion<f32>,
    pub horizontal_timescale: f32,
    pub vertical_timescale: f32,
}

impl Motor {
    pub fn new(
        velocity: Vector3<f32>,
        rotation: UnitQuaternion<f32>,
        horizontal_timescale: f32,
        vertical_timescale: f32,
    ) -> Self {
        Self {
            velocity,
            rotation,
            horizontal_timescale,
            vertical_timescale,
        }
    }
}

/// Follow target handed to the physics step.
#[derive(Debug, Clone, Copy)]
pub struct FollowParams {
    pub target: Transform,
    pub max_time_remaining: f32,
}

/// Physically-resolved follow displacement, read back after the step.
#[derive(Debug, Clone, Copy, Default)]
pub struct FollowResult {
    pub linear_displacement: Vector3<f32>,
    pub angular_displacement: UnitQuaternion<f32>,
    pub follow_time: f32,
}

impl Default for FollowParams {
    fn default() -> Self {
        Self {
            target: Transform::identity(),
            max_time_remaining: 0.0,
        }
    }
}

pub trait CharacterController: Send {
    fn set_position_and_orientation(
        &mut self,
        position: Vector3<f32>,
        orientation: UnitQuaternion<f32>,
    );
    fn position(&self) -> Vector3<f32>;
    fn orientation(&self) -> UnitQuaternion<f32>;

    fn add_motor(&mut self, motor: Motor);
    fn clear_motors(&mut self);

    fn set_follow_parameters(&mut self, params: FollowParams);
    fn follow_result(&self) -> FollowResult;

    fn state(&self) -> CharacterState;
    fn is_stuck(&self) -> bool;
    fn velocity(&self) -> Vector3<f32>;

    fn set_collisionless(&mut self, collisionless: bool);
    fn is_collisionless(&self) -> bool;

    /// Coarse walkability probe: casts a fan of rays a step ahead and
    /// reports whether the ground there is standable.
    fn test_ray_shotgun(&self, start: Vector3<f32>, step: Vector3<f32>) -> bool;
}

/// Collision-free reference controller.
///
/// Motors are blended by inverse timescale; the follow target is approached
/// at a rate that converges within `max_time_remaining`.
pub struct KinematicCharacterController {
    position: Vector3<f32>,
    orientation: UnitQuaternion<f32>,
    velocity: Vector3<f32>,
    motors: Vec<Motor>,
    follow_params: Option<FollowParams>,
    follow_result: FollowResult,
    state: CharacterState,
    collisionless: bool,
}

impl KinematicCharacterController {
    pub fn new() -> Self {
        Self {
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            velocity: Vector3::zeros(),
            motors: Vec::new(),
            follow_params: None,
            follow_result: FollowResult::default(),
            state: CharacterState::Ground,
            collisionless: false,
        }
    }

    pub fn set_state(&mut self, state: CharacterState) {
        self.state = state;
    }

    /// Blend motors into a target velocity. Weight is 1/timescale, so an
    /// invalid timescale contributes (almost) nothing.
    fn blended_velocity(&self) -> Vector3<f32> {
        let mut horizontal = Vector3::zeros();
        let mut vertical = 0.0f32;
        let mut h_weight = 0.0f32;
        let mut v_weight = 0.0f32;
        for motor in &self.motors {
            let world_velocity = motor.rotation * motor.velocity;
            let wh = 1.0 / motor.horizontal_timescale.max(1.0e-3);
            let wv = 1.0 / motor.vertical_timescale.max(1.0e-3);
            horizontal += wh * Vector3::new(world_velocity.x, 0.0, world_velocity.z);
            vertical += wv * world_velocity.y;
            h_weight += wh;
            v_weight += wv;
        }
        let mut out = self.velocity;
        if h_weight > 1.0 / INVALID_MOTOR_TIMESCALE * 2.0 {
            let h = horizontal / h_weight;
            out.x = h.x;
            out.z = h.z;
        }
        if v_weight > 1.0 / INVALID_MOTOR_TIMESCALE * 2.0 {
            out.y = vertical / v_weight;
        }
        out
    }

    /// Advance one simulation step.
    pub fn step(&mut self, dt: f32) {
        self.velocity = self.blended_velocity();
        self.position += self.velocity * dt;

        self.follow_result = FollowResult::default();
        if let Some(params) = self.follow_params {
            if params.max_time_remaining > 0.0 {
                let fraction = (dt / params.max_time_remaining).min(1.0);
                let delta = params.target.translation - self.position;
                let linear = delta * fraction;
                self.position += linear;
                let target_rot = nlerp(&self.orientation, &params.target.rotation, fraction);
                let angular = target_rot * self.orientation.inverse();
                self.orientation = target_rot;
                self.follow_result = FollowResult {
                    linear_displacement: linear,
                    angular_displacement: angular,
                    follow_time: dt.min(params.max_time_remaining),
                };
            }
        }
    }
}

impl Default for KinematicCharacterController {
    fn default() -> Self {
        Self::new()
    }
}

impl CharacterController for KinematicCharacterController {
    fn set_position_and_orientation(
        &mut self,
        position: Vector3<f32>,
        orientation: UnitQuaternion<f32>,
    ) {
        self.position = position;
        self.orientation = orientation;
    }

    fn position(&self) -> Vector3<f32> {
        self.position
    }

    fn orientation(&self) -> UnitQuaternion<f32> {
        self.orientation
    }

    fn add_motor(&mut self, motor: Motor) {
        self.motors.push(motor);
    }

    fn clear_motors(&mut self) {
        self.motors.clear();
    }

    fn set_follow_parameters(&mut self, params: FollowParams) {
        self.follow_params = if params.max_time_remaining > 0.0 {
            Some(params)
        } else {
            None
        };
    }

    fn follow_result(&self) -> FollowResult {
        self.follow_result
    }

    fn state(&self) -> CharacterState {
        self.state
    }

    fn is_stuck(&self) -> bool {
        false
    }

    fn velocity(&self) -> Vector3<f32> {
        self.velocity
    }

    fn set_collisionless(&mut self, collisionless: bool) {
        self.collisionless = collisionless;
    }

    fn is_collisionless(&self) -> bool {
        self.collisionless
    }

    fn test_ray_shotgun(&self, _start: Vector3<f32>, _step: Vector3<f32>) -> bool {
        // 衝突のない世界では常に歩行可能
        true
    }
}

/// Shared handle so the owner of the simulation loop can keep stepping the
/// controller while the avatar drives it through the trait.
impl CharacterController for Arc<Mutex<KinematicCharacterController>> {
    fn set_position_and_orientation(
        &mut self,
        position: Vector3<f32>,
        orientation: UnitQuaternion<f32>,
    ) {
        self.lock()
            .unwrap()
            .set_position_and_orientation(position, orientation);
    }

    fn position(&self) -> Vector3<f32> {
        self.lock().unwrap().position()
    }

    fn orientation(&self) -> UnitQuaternion<f32> {
        self.lock().unwrap().orientation()
    }

    fn add_motor(&mut self, motor: Motor) {
        self.lock().unwrap().add_motor(motor);
    }

    fn clear_motors(&mut self) {
        self.lock().unwrap().clear_motors();
    }

    fn set_follow_parameters(&mut self, params: FollowParams) {
        self.lock().unwrap().set_follow_parameters(params);
    }

    fn follow_result(&self) -> FollowResult {
        self.lock().unwrap().follow_result()
    }

    fn state(&self) -> CharacterState {
        self.lock().unwrap().state()
    }

    fn is_stuck(&self) -> bool {
        self.lock().unwrap().is_stuck()
    }

    fn velocity(&self) -> Vector3<f32> {
        self.lock().unwrap().velocity()
    }

    fn set_collisionless(&mut self, collisionless: bool) {
        self.lock().unwrap().set_collisionless(collisionless);
    }

    fn is_collisionless(&self) -> bool {
        self.lock().unwrap().is_collisionless()
    }

    fn test_ray_shotgun(&self, start: Vector3<f32>, step: Vector3<f32>) -> bool {
        self.lock().unwrap().test_ray_shotgun(start, step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_motor_moves_character() {
        let mut cc = KinematicCharacterController::new();
        cc.add_motor(Motor::new(
            Vector3::new(1.0, 0.0, 0.0),
            UnitQuaternion::identity(),
            0.2,
            INVALID_MOTOR_TIMESCALE,
        ));
        cc.step(0.5);
        assert_relative_eq!(cc.position().x, 0.5, epsilon = 1e-4);
        assert_relative_eq!(cc.position().y, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_motor_rotation_frame() {
        let mut cc = KinematicCharacterController::new();
        let quarter = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), std::f32::consts::FRAC_PI_2);
        cc.add_motor(Motor::new(
            Vector3::new(0.0, 0.0, -1.0),
            quarter,
            0.2,
            INVALID_MOTOR_TIMESCALE,
        ));
        cc.step(1.0);
        // -Z をY軸90°回転すると -X
        assert_relative_eq!(cc.position().x, -1.0, epsilon = 1e-4);
        assert_relative_eq!(cc.position().z, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_follow_converges_within_window() {
        let mut cc = KinematicCharacterController::new();
        let target = Transform::new(
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 1.0),
            Vector3::new(2.0, 0.0, -1.0),
        );
        let mut remaining = 0.5;
        let dt = 0.1;
        while remaining > 0.0 {
            cc.set_follow_parameters(FollowParams {
                target,
                max_time_remaining: remaining,
            });
            cc.step(dt);
            remaining -= dt;
        }
        assert_relative_eq!(cc.position(), target.translation, epsilon = 1e-3);
        assert!(cc.orientation().angle_to(&target.rotation) < 1e-2);
    }

    #[test]
    fn test_follow_result_reports_displacement() {
        let mut cc = KinematicCharacterController::new();
        cc.set_follow_parameters(FollowParams {
            target: Transform::new(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0)),
            max_time_remaining: 1.0,
        });
        cc.step(0.25);
        let result = cc.follow_result();
        assert_relative_eq!(result.linear_displacement.x, 0.25, epsilon = 1e-4);
        assert_relative_eq!(result.follow_time, 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_window_disables_follow() {
        let mut cc = KinematicCharacterController::new();
        cc.set_follow_parameters(FollowParams {
            target: Transform::new(UnitQuaternion::identity(), Vector3::new(5.0, 0.0, 0.0)),
            max_time_remaining: 0.0,
        });
        cc.step(0.1);
        assert_relative_eq!(cc.position().x, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_invalid_timescale_motor_holds_velocity() {
        let mut cc = KinematicCharacterController::new();
        cc.add_motor(Motor::new(
            Vector3::new(3.0, 0.0, 0.0),
            UnitQuaternion::identity(),
            INVALID_MOTOR_TIMESCALE,
            INVALID_MOTOR_TIMESCALE,
        ));
        cc.step(1.0);
        // ほぼ動かない（実効的に∞タイムスケール）
        assert!(cc.position().x.abs() < 0.01);
    }
}
