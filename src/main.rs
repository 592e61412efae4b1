use std::sync::{Arc, Mutex};

use anyhow::Result;
use nalgebra::{UnitQuaternion, Vector3};
use tracing::info;
use uuid::Uuid;

use kagura_avatar::avatar::Avatar;
use kagura_avatar::character::KinematicCharacterController;
use kagura_avatar::config::Config;
use kagura_avatar::entities::{EntityProperties, SceneTree};
use kagura_avatar::motor::DriveKey;
use kagura_avatar::pose::{PoseAction, PoseMap, TrackedPose};
use kagura_avatar::rig::StandardRig;
use kagura_avatar::safe_landing::{RayHit, RayScene};

const CONFIG_PATH: &str = "config.toml";

/// 遮蔽物のない開けたシーン
struct OpenScene;

impl RayScene for OpenScene {
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

#[derive(Default)]
struct MemorySceneTree {
    entities: std::collections::HashMap<Uuid, EntityProperties>,
}

impl SceneTree for MemorySceneTree {
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

/// 立つ→前傾→座る→立つ、のシナリオを1人で再生するデモ。
/// HMDの代わりにスクリプト化した頭ポーズを流し込む。
fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    info!(version = env!("GIT_VERSION"), "avatar-sim starting");

    let config = Config::load_or_default(CONFIG_PATH);
    let eye_height = config.user.eye_height();

    let poses = PoseMap::new();
    let character = Arc::new(Mutex::new(KinematicCharacterController::new()));
    let mut avatar = Avatar::new(
        config,
        Box::new(poses.clone()),
        Box::new(StandardRig::new()),
        Box::new(character.clone()),
        Arc::new(OpenScene),
        Box::new(MemorySceneTree::default()),
    );

    let dt = 1.0 / 90.0;
    let total_seconds = 12.0;
    let mut t = 0.0f32;
    let mut was_sitting = avatar.is_sitting();
    let mut next_report = 0.0f32;

    while t < total_seconds {
        let head_y = match t {
            t if t < 3.0 => eye_height,
            // ゆっくり座り込む
            t if t < 4.0 => eye_height - (t - 3.0) * (eye_height - 1.1),
            t if t < 9.0 => 1.1,
            // 立ち上がる
            t if t < 9.5 => 1.1 + (t - 9.0) / 0.5 * (eye_height - 1.1),
            _ => eye_height,
        };
        // 6秒あたりで軽く前へ歩く入力も混ぜる
        let drive = if (6.0..7.0).contains(&t) { 1.0 } else { 0.0 };
        avatar.drive_keys_mut().set_key(DriveKey::TranslateZ, drive);

        poses.set(
            PoseAction::Head,
            TrackedPose::new(
                Vector3::new(0.0, head_y, 0.0),
                UnitQuaternion::identity(),
                Vector3::zeros(),
                Vector3::zeros(),
            ),
        );

        avatar.update(dt);
        avatar.prepare_for_physics(dt);
        character.lock().unwrap().step(dt);
        avatar.harvest_physics_results();

        if avatar.is_sitting() != was_sitting {
            was_sitting = avatar.is_sitting();
            info!(t, sitting = was_sitting, "sit/stand transition");
        }
        if t >= next_report {
            let p = avatar.position();
            info!(
                t,
                x = p.x,
                y = p.y,
                z = p.z,
                sitting = avatar.is_sitting(),
                "frame"
            );
            next_report += 1.0;
        }
        t += dt;
    }

    info!("avatar-sim done");
    Ok(())
}
