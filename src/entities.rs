//! Avatar-entity bookkeeping.
//!
//! Entities attached to the avatar live in two places: as blobs (the
//! serialized form that travels with the avatar and gets persisted) and as
//! live entities in the scene tree. Changes arrive from both sides on
//! different threads, so every mutation lands in a queue under one lock and
//! `reconcile` applies the whole batch once per frame on the simulation
//! thread. Serialization of dirty entities is deferred until the blobs are
//! actually needed (`update_stale_blobs`).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Simulation priority claimed for entities owned by the avatar.
pub const AVATAR_ENTITY_PRIORITY: u8 = 0x80;

/// Sentinel parent id meaning "my own avatar", replaced with the real
/// session id during sanitization.
pub fn avatar_self_sentinel() -> Uuid {
    Uuid::from_u128(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityHostType {
    Domain,
    Avatar,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationOwner {
    pub id: Uuid,
    pub priority: u8,
}

/// The decoded form of an avatar-entity blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProperties {
    pub host_type: EntityHostType,
    pub owning_avatar_id: Uuid,
    pub simulation_owner: SimulationOwner,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub position: [f32; 3],
    #[serde(default = "default_rotation")]
    pub rotation: [f32; 4],
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user_data: Option<serde_json::Value>,
}

fn default_rotation() -> [f32; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

/// Scene-tree operations the reconciler needs. The actual tree lives
/// outside this crate.
pub trait SceneTree: Send {
    fn add_entity(&mut self, id: Uuid, properties: EntityProperties) -> bool;
    fn update_entity(&mut self, id: Uuid, properties: EntityProperties) -> bool;
    fn delete_entity(&mut self, id: Uuid);
    /// Live properties for serialization back into a blob.
    fn entity_properties(&self, id: Uuid) -> Option<EntityProperties>;
}

#[derive(Default)]
struct Store {
    /// Serialized entity state, keyed by entity id.
    cached_blobs: HashMap<Uuid, Vec<u8>>,
    /// Wire-format shadow of the blobs; an empty value marks a pending delete.
    packed_data: HashMap<Uuid, Vec<u8>>,
    // Blob-authoritative queues: the blob changed, the scene must follow.
    entities_to_delete: Vec<Uuid>,
    entities_to_add: Vec<Uuid>,
    entities_to_update: Vec<Uuid>,
    // Scene-authoritative queues: the scene changed, the blob must follow.
    blobs_to_delete: Vec<Uuid>,
    blobs_to_add_or_update: Vec<Uuid>,
    /// Entities whose next scene-side change notification must not mark the
    /// blob stale (the blob itself was the source of the change).
    blob_updates_to_skip: Vec<Uuid>,
    /// Blobs that no longer match the live entity.
    stale_blobs: HashSet<Uuid>,
}

pub struct AvatarEntityReconciler {
    session_id: Uuid,
    max_entities: usize,
    store: Mutex<Store>,
}

impl AvatarEntityReconciler {
    pub fn new(session_id: Uuid, max_entities: usize) -> Self {
        Self {
            session_id,
            max_entities,
            store: Mutex::new(Store::default()),
        }
    }

    pub fn set_session_id(&mut self, session_id: Uuid) {
        self.session_id = session_id;
    }

    /// Number of cached blobs.
    pub fn blob_count(&self) -> usize {
        self.store.lock().unwrap().cached_blobs.len()
    }

    pub fn cached_blob(&self, id: Uuid) -> Option<Vec<u8>> {
        self.store.lock().unwrap().cached_blobs.get(&id).cloned()
    }

    /// Wholesale replacement of the avatar-entity set, e.g. from settings.
    /// Oversized sets are rejected outright.
    pub fn set_avatar_entity_data(&self, data: HashMap<Uuid, Vec<u8>>) -> bool {
        if data.len() > self.max_entities {
            warn!(
                count = data.len(),
                limit = self.max_entities,
                "ignoring suspiciously large avatar entity set"
            );
            return false;
        }
        let mut store = self.store.lock().unwrap();
        let existing: Vec<Uuid> = store.cached_blobs.keys().copied().collect();
        for id in existing {
            if !data.contains_key(&id) {
                store.entities_to_delete.push(id);
                store.blobs_to_delete.push(id);
            }
        }
        for (id, blob) in data {
            match store.cached_blobs.get(&id) {
                Some(old) if *old == blob => {}
                Some(_) => {
                    store.cached_blobs.insert(id, blob);
                    store.entities_to_update.push(id);
                    store.blob_updates_to_skip.push(id);
                }
                None => {
                    store.cached_blobs.insert(id, blob);
                    store.entities_to_add.push(id);
                    store.blob_updates_to_skip.push(id);
                }
            }
        }
        true
    }

    /// Single blob update from outside (script or network). The payload must
    /// be valid JSON for `EntityProperties`; anything else is logged and
    /// dropped here rather than poisoning the queues.
    pub fn update_avatar_entity(&self, id: Uuid, blob: Vec<u8>) {
        if let Err(e) = serde_json::from_slice::<EntityProperties>(&blob) {
            warn!(entity = %id, "rejecting invalid avatar entity data: {}", e);
            return;
        }
        let mut store = self.store.lock().unwrap();
        let is_new = !store.cached_blobs.contains_key(&id);
        store.cached_blobs.insert(id, blob);
        if is_new {
            store.entities_to_add.push(id);
        } else {
            store.entities_to_update.push(id);
        }
        // The scene change produced by this blob must not re-mark it stale.
        store.blob_updates_to_skip.push(id);
    }

    /// Queue removal of an entity and its blob.
    pub fn clear_avatar_entity(&self, id: Uuid) {
        let mut store = self.store.lock().unwrap();
        store.entities_to_delete.push(id);
        store.blobs_to_delete.push(id);
    }

    /// Scene-side notification: a live avatar entity changed.
    pub fn mark_entity_changed(&self, id: Uuid) {
        self.store.lock().unwrap().blobs_to_add_or_update.push(id);
    }

    /// Scene-side notification: a live avatar entity was deleted.
    pub fn mark_entity_removed(&self, id: Uuid) {
        self.store.lock().unwrap().blobs_to_delete.push(id);
    }

    /// Force every blob attribute into a self-owned shape. Blobs can come
    /// from settings files or scripts and must not claim other hosts or
    /// owners.
    fn sanitize(&self, properties: &mut EntityProperties) {
        properties.host_type = EntityHostType::Avatar;
        properties.owning_avatar_id = self.session_id;
        properties.simulation_owner = SimulationOwner {
            id: self.session_id,
            priority: AVATAR_ENTITY_PRIORITY,
        };
        if properties.parent_id == Some(avatar_self_sentinel()) {
            properties.parent_id = Some(self.session_id);
        }
    }

    /// Apply all queued changes to the scene tree and the blob cache.
    /// Runs once per frame on the simulation thread.
    pub fn reconcile(&self, scene: &mut dyn SceneTree) {
        // Move the queues out to keep the critical section short.
        let (to_delete, mut to_add, mut to_update, blobs_to_delete, mut blobs_to_add_or_update) = {
            let mut store = self.store.lock().unwrap();
            (
                std::mem::take(&mut store.entities_to_delete),
                std::mem::take(&mut store.entities_to_add),
                std::mem::take(&mut store.entities_to_update),
                std::mem::take(&mut store.blobs_to_delete),
                std::mem::take(&mut store.blobs_to_add_or_update),
            )
        };

        // Deletes dominate: a queued delete cancels adds and updates for the
        // same id in both directions, and adds cancel redundant updates.
        for id in &blobs_to_delete {
            blobs_to_add_or_update.retain(|x| x != id);
        }
        for id in &to_delete {
            to_add.retain(|x| x != id);
            to_update.retain(|x| x != id);
        }
        for id in &to_add {
            to_update.retain(|x| x != id);
        }

        for id in to_delete {
            scene.delete_entity(id);
        }
        for id in to_add {
            if let Some(mut properties) = self.decode_blob(id) {
                self.sanitize(&mut properties);
                scene.add_entity(id, properties);
            }
        }
        for id in to_update {
            if let Some(mut properties) = self.decode_blob(id) {
                self.sanitize(&mut properties);
                scene.update_entity(id, properties);
            }
        }

        let mut store = self.store.lock().unwrap();
        for id in blobs_to_delete {
            store.cached_blobs.remove(&id);
            store.stale_blobs.remove(&id);
            store.blob_updates_to_skip.retain(|x| *x != id);
            // empty payload marks a delete for the wire-format consumer
            store.packed_data.insert(id, Vec::new());
        }
        for id in blobs_to_add_or_update {
            if let Some(pos) = store.blob_updates_to_skip.iter().position(|x| *x == id) {
                store.blob_updates_to_skip.remove(pos);
            } else {
                store.stale_blobs.insert(id);
            }
        }
    }

    fn decode_blob(&self, id: Uuid) -> Option<EntityProperties> {
        let blob = {
            let store = self.store.lock().unwrap();
            store.cached_blobs.get(&id).cloned()
        }?;
        match serde_json::from_slice::<EntityProperties>(&blob) {
            Ok(properties) => Some(properties),
            Err(e) => {
                warn!(entity = %id, "skipping undecodable avatar entity blob: {}", e);
                let mut store = self.store.lock().unwrap();
                store.blob_updates_to_skip.retain(|x| *x != id);
                None
            }
        }
    }

    /// Serialize every stale live entity back into its blob. Called lazily
    /// right before the blobs are saved or read out.
    pub fn update_stale_blobs(&self, scene: &dyn SceneTree) {
        let stale: Vec<Uuid> = {
            let mut store = self.store.lock().unwrap();
            std::mem::take(&mut store.stale_blobs).into_iter().collect()
        };
        for id in stale {
            let Some(properties) = scene.entity_properties(id) else {
                continue;
            };
            match serde_json::to_vec(&properties) {
                Ok(blob) => {
                    let mut store = self.store.lock().unwrap();
                    store.cached_blobs.insert(id, blob);
                }
                Err(e) => warn!(entity = %id, "failed to serialize avatar entity: {}", e),
            }
        }
    }

    /// Snapshot of all blobs, with stale ones freshly serialized.
    pub fn avatar_entity_data(&self, scene: &dyn SceneTree) -> HashMap<Uuid, Vec<u8>> {
        self.update_stale_blobs(scene);
        self.store.lock().unwrap().cached_blobs.clone()
    }

    /// Drain the packed-map delete marks (ids whose wire entry is empty).
    pub fn take_packed_deletes(&self) -> Vec<Uuid> {
        let mut store = self.store.lock().unwrap();
        let ids: Vec<Uuid> = store
            .packed_data
            .iter()
            .filter(|(_, v)| v.is_empty())
            .map(|(k, _)| *k)
            .collect();
        for id in &ids {
            store.packed_data.remove(id);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeScene {
        entities: HashMap<Uuid, EntityProperties>,
        deletes: Vec<Uuid>,
        adds: Vec<Uuid>,
        updates: Vec<Uuid>,
    }

    impl SceneTree for FakeScene {
        fn add_entity(&mut self, id: Uuid, properties: EntityProperties) -> bool {
            self.adds.push(id);
            self.entities.insert(id, properties);
            true
        }
        fn update_entity(&mut self, id: Uuid, properties: EntityProperties) -> bool {
            self.updates.push(id);
            self.entities.insert(id, properties).is_some()
        }
        fn delete_entity(&mut self, id: Uuid) {
            self.deletes.push(id);
            self.entities.remove(&id);
        }
        fn entity_properties(&self, id: Uuid) -> Option<EntityProperties> {
            self.entities.get(&id).cloned()
        }
    }

    fn properties() -> EntityProperties {
        EntityProperties {
            host_type: EntityHostType::Domain,
            owning_avatar_id: Uuid::new_v4(),
            simulation_owner: SimulationOwner {
                id: Uuid::new_v4(),
                priority: 0,
            },
            parent_id: None,
            position: [1.0, 2.0, 3.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
            name: Some("hat".to_string()),
            user_data: None,
        }
    }

    fn blob(p: &EntityProperties) -> Vec<u8> {
        serde_json::to_vec(p).unwrap()
    }

    #[test]
    fn test_add_decodes_and_sanitizes() {
        let session = Uuid::new_v4();
        let reconciler = AvatarEntityReconciler::new(session, 42);
        let id = Uuid::new_v4();
        let mut p = properties();
        p.parent_id = Some(avatar_self_sentinel());
        reconciler.update_avatar_entity(id, blob(&p));

        let mut scene = FakeScene::default();
        reconciler.reconcile(&mut scene);
        let stored = scene.entities.get(&id).unwrap();
        assert_eq!(stored.host_type, EntityHostType::Avatar);
        assert_eq!(stored.owning_avatar_id, session);
        assert_eq!(stored.simulation_owner.id, session);
        assert_eq!(stored.simulation_owner.priority, AVATAR_ENTITY_PRIORITY);
        // the self-parent sentinel resolves to the real session id
        assert_eq!(stored.parent_id, Some(session));
    }

    #[test]
    fn test_delete_dominates_add_and_update() {
        let reconciler = AvatarEntityReconciler::new(Uuid::new_v4(), 42);
        let id = Uuid::new_v4();
        reconciler.update_avatar_entity(id, blob(&properties()));
        reconciler.update_avatar_entity(id, blob(&properties()));
        reconciler.clear_avatar_entity(id);

        let mut scene = FakeScene::default();
        reconciler.reconcile(&mut scene);
        assert_eq!(scene.deletes, vec![id]);
        assert!(scene.adds.is_empty());
        assert!(scene.updates.is_empty());
        assert_eq!(reconciler.blob_count(), 0);
    }

    #[test]
    fn test_invalid_json_rejected_at_entry() {
        let reconciler = AvatarEntityReconciler::new(Uuid::new_v4(), 42);
        reconciler.update_avatar_entity(Uuid::new_v4(), b"not json".to_vec());
        assert_eq!(reconciler.blob_count(), 0);
        let mut scene = FakeScene::default();
        reconciler.reconcile(&mut scene);
        assert!(scene.adds.is_empty());
    }

    #[test]
    fn test_oversized_set_rejected() {
        let reconciler = AvatarEntityReconciler::new(Uuid::new_v4(), 2);
        let mut data = HashMap::new();
        for _ in 0..3 {
            data.insert(Uuid::new_v4(), blob(&properties()));
        }
        assert!(!reconciler.set_avatar_entity_data(data));
        assert_eq!(reconciler.blob_count(), 0);
    }

    #[test]
    fn test_wholesale_replace_computes_sets() {
        let reconciler = AvatarEntityReconciler::new(Uuid::new_v4(), 42);
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();
        let mut initial = HashMap::new();
        initial.insert(keep, blob(&properties()));
        initial.insert(drop, blob(&properties()));
        assert!(reconciler.set_avatar_entity_data(initial));
        let mut scene = FakeScene::default();
        reconciler.reconcile(&mut scene);
        assert_eq!(scene.adds.len(), 2);

        // replace: keep gets new content, drop disappears, fresh appears
        let fresh = Uuid::new_v4();
        let mut changed = properties();
        changed.name = Some("scarf".to_string());
        let mut next = HashMap::new();
        next.insert(keep, blob(&changed));
        next.insert(fresh, blob(&properties()));
        assert!(reconciler.set_avatar_entity_data(next));
        let mut scene = FakeScene::default();
        reconciler.reconcile(&mut scene);
        assert_eq!(scene.deletes, vec![drop]);
        assert_eq!(scene.adds, vec![fresh]);
        assert_eq!(scene.updates, vec![keep]);
    }

    #[test]
    fn test_scene_change_marks_blob_stale_lazily() {
        let reconciler = AvatarEntityReconciler::new(Uuid::new_v4(), 42);
        let id = Uuid::new_v4();
        reconciler.update_avatar_entity(id, blob(&properties()));
        let mut scene = FakeScene::default();
        reconciler.reconcile(&mut scene);

        // mutate the live entity, then notify
        let mut live = scene.entities.get(&id).cloned().unwrap();
        live.position = [9.0, 9.0, 9.0];
        scene.entities.insert(id, live);
        reconciler.mark_entity_changed(id);
        reconciler.reconcile(&mut scene);

        // blob still holds the old position until someone asks for it
        let old: EntityProperties =
            serde_json::from_slice(&reconciler.cached_blob(id).unwrap()).unwrap();
        assert_ne!(old.position, [9.0, 9.0, 9.0]);
        let data = reconciler.avatar_entity_data(&scene);
        let new: EntityProperties = serde_json::from_slice(&data[&id]).unwrap();
        assert_eq!(new.position, [9.0, 9.0, 9.0]);
    }

    #[test]
    fn test_blob_sourced_change_not_marked_stale() {
        let reconciler = AvatarEntityReconciler::new(Uuid::new_v4(), 42);
        let id = Uuid::new_v4();
        reconciler.update_avatar_entity(id, blob(&properties()));
        // the scene echoes the change back in the same frame
        reconciler.mark_entity_changed(id);
        let mut scene = FakeScene::default();
        reconciler.reconcile(&mut scene);
        let store = reconciler.store.lock().unwrap();
        assert!(store.stale_blobs.is_empty());
        assert!(store.blob_updates_to_skip.is_empty());
    }

    #[test]
    fn test_wholesale_set_change_not_marked_stale() {
        let reconciler = AvatarEntityReconciler::new(Uuid::new_v4(), 42);
        let id = Uuid::new_v4();
        let mut data = HashMap::new();
        data.insert(id, blob(&properties()));
        assert!(reconciler.set_avatar_entity_data(data));
        // the scene echoes the write back in the same frame
        reconciler.mark_entity_changed(id);
        let mut scene = FakeScene::default();
        reconciler.reconcile(&mut scene);
        let store = reconciler.store.lock().unwrap();
        assert!(store.stale_blobs.is_empty());
        assert!(store.blob_updates_to_skip.is_empty());
    }

    #[test]
    fn test_removed_entity_leaves_packed_delete_mark() {
        let reconciler = AvatarEntityReconciler::new(Uuid::new_v4(), 42);
        let id = Uuid::new_v4();
        reconciler.update_avatar_entity(id, blob(&properties()));
        let mut scene = FakeScene::default();
        reconciler.reconcile(&mut scene);
        reconciler.clear_avatar_entity(id);
        reconciler.reconcile(&mut scene);
        assert_eq!(reconciler.take_packed_deletes(), vec![id]);
        assert!(reconciler.take_packed_deletes().is_empty());
    }
}
