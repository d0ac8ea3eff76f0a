// Scene context: owns the ECS world and every derived structure that depends
// on it. All entity mutations go through here so the object-set cache, the
// visibility states and the worker mirror are updated in the same call.

use std::sync::Arc;
use std::time::Instant;

use bevy_ecs::prelude::*;
use glam::Vec3;

use super::components::{
    BlockingTags, DoorState, Flying, Layer, LayerVisibility, SceneMesh, Transform, Visible,
};
use super::config::VisionConfig;
use super::error::SightError;
use super::mesh::MeshNode;
use super::raycast::{BvhRaycaster, RaycastHit, RaycastQuery};
use super::scene_index::{is_entity_visible, ObjectSets, Rect, SceneIndexBuilder, SetKind};
use super::visibility::{PolygonConfig, SetCaster, SourceId, VisibilityPolygon};
use super::vision::VisionService;

pub struct SceneContext {
    world: World,
    config: VisionConfig,
    index: SceneIndexBuilder,
    raycaster: BvhRaycaster,
    vision: VisionService,
}

impl SceneContext {
    pub fn new(config: VisionConfig) -> Result<Self, SightError> {
        config.validate()?;
        let mut world = World::new();
        world.insert_resource(LayerVisibility::default());
        Ok(Self {
            world,
            index: SceneIndexBuilder::new(&config),
            raycaster: BvhRaycaster::new(config.near_distance),
            vision: VisionService::new(config.clone()),
            config,
        })
    }

    pub fn world(&self) -> &World { &self.world }

    pub fn config(&self) -> &VisionConfig { &self.config }

    pub fn index(&self) -> &SceneIndexBuilder { &self.index }

    pub fn raycaster(&self) -> &BvhRaycaster { &self.raycaster }

    pub fn vision(&self) -> &VisionService { &self.vision }

    pub fn vision_mut(&mut self) -> &mut VisionService { &mut self.vision }

    // ------------------------------------------------------------------------
    // Entity lifecycle
    // ------------------------------------------------------------------------

    pub fn spawn_blocker(&mut self, mesh: Arc<MeshNode>, transform: Transform, tags: BlockingTags) -> Entity {
        let entity = self
            .world
            .spawn((transform, SceneMesh(mesh), tags, Visible(true), DoorState::default()))
            .id();
        self.entity_changed(entity);
        entity
    }

    /// Remove the entity from every derived set and the worker mirror, then despawn it.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        if self.world.get_entity(entity).is_err() {
            return false;
        }
        self.index.untrack(entity);
        self.raycaster.forget(entity);
        self.vision.sync_remove(entity);
        self.vision.invalidate();
        self.world.despawn(entity)
    }

    pub fn set_visible(&mut self, entity: Entity, visible: bool) {
        if let Some(mut v) = self.world.get_mut::<Visible>(entity) {
            if v.0 == visible {
                return;
            }
            v.0 = visible;
        } else {
            return;
        }
        self.entity_changed(entity);
    }

    pub fn set_door_open(&mut self, entity: Entity, door_id: u32, open: bool) {
        let Some(mut doors) = self.world.get_mut::<DoorState>(entity) else {
            return;
        };
        let changed = if open { doors.open.insert(door_id) } else { doors.open.remove(&door_id) };
        if changed {
            log::debug!("door {} on {:?} {}", door_id, entity, if open { "opened" } else { "closed" });
            self.entity_changed(entity);
        }
    }

    pub fn set_tags(&mut self, entity: Entity, tags: BlockingTags) {
        if self.insert(entity, tags) {
            self.entity_changed(entity);
        }
    }

    pub fn set_transform(&mut self, entity: Entity, transform: Transform) {
        if let Some(mut t) = self.world.get_mut::<Transform>(entity) {
            *t = transform;
            if self.blocks_sight(entity) {
                self.entity_changed(entity);
            } else {
                // tokens and other see-through movers leave visibility untouched
                self.index.track(&self.world, entity);
            }
        }
    }

    /// Swap the entity's geometry. Its cached BVHs rebuild on the next cast.
    pub fn set_mesh(&mut self, entity: Entity, mesh: Arc<MeshNode>) {
        if self.insert(entity, SceneMesh(mesh)) {
            self.raycaster.forget(entity);
            self.entity_changed(entity);
        }
    }

    pub fn set_layer(&mut self, entity: Entity, layer: Option<u32>) {
        let found = match layer {
            Some(l) => self.insert(entity, Layer(l)),
            None => self.remove::<Layer>(entity),
        };
        if found {
            self.entity_changed(entity);
        }
    }

    pub fn set_flying(&mut self, entity: Entity, flying: bool) {
        if flying {
            self.insert(entity, Flying);
        } else {
            self.remove::<Flying>(entity);
        }
    }

    pub fn is_flying(&self, entity: Entity) -> bool {
        self.world.get::<Flying>(entity).is_some()
    }

    /// Show or hide every entity on `layer`.
    pub fn set_layer_hidden(&mut self, layer: u32, hidden: bool) {
        let changed = {
            let mut layers = self.world.resource_mut::<LayerVisibility>();
            if hidden { layers.hidden.insert(layer) } else { layers.hidden.remove(&layer) }
        };
        if !changed {
            return;
        }
        let members: Vec<Entity> = self
            .world
            .iter_entities()
            .filter(|e| e.get::<Layer>().is_some_and(|l| l.0 == layer))
            .map(|e| e.id())
            .collect();
        for entity in members {
            self.entity_changed(entity);
        }
        self.index.invalidate();
        self.vision.invalidate();
    }

    /// Drop every entity and all derived state.
    pub fn clear(&mut self) {
        self.world.clear_entities();
        self.index.clear();
        self.raycaster.clear();
        self.vision.sync_clear();
        self.vision.invalidate();
    }

    fn insert<B: Bundle>(&mut self, entity: Entity, bundle: B) -> bool {
        match self.world.get_entity_mut(entity) {
            Ok(mut e) => {
                e.insert(bundle);
                true
            }
            Err(_) => false,
        }
    }

    fn remove<B: Bundle>(&mut self, entity: Entity) -> bool {
        match self.world.get_entity_mut(entity) {
            Ok(mut e) => {
                e.remove::<B>();
                true
            }
            Err(_) => false,
        }
    }

    /// True when any part of the entity can block sight in some door state.
    fn blocks_sight(&self, entity: Entity) -> bool {
        let tags = self.world.get::<BlockingTags>(entity).is_some_and(|t| t.sight);
        tags || self.world.get::<SceneMesh>(entity).is_some_and(|m| m.0.has_tags())
    }

    fn entity_changed(&mut self, entity: Entity) {
        self.index.track(&self.world, entity);
        self.vision.invalidate();
        self.sync_worker(entity);
    }

    fn sync_worker(&mut self, entity: Entity) {
        if !self.vision.uses_worker() {
            return;
        }
        let mirrored = is_entity_visible(&self.world, entity)
            .then(|| {
                let transform = self.world.get::<Transform>(entity)?;
                let mesh = self.world.get::<SceneMesh>(entity)?;
                let tags = self.world.get::<BlockingTags>(entity).copied().unwrap_or(BlockingTags::NONE);
                let open_doors = self
                    .world
                    .get::<DoorState>(entity)
                    .map(|d| d.open.iter().copied().collect())
                    .unwrap_or_default();
                Some((mesh.0.clone(), transform.matrix(), tags.sight, open_doors))
            })
            .flatten();
        match mirrored {
            Some((node, matrix, sight, open_doors)) => {
                self.vision.sync_add(entity, &node, matrix, sight, open_doors)
            }
            None => self.vision.sync_remove(entity),
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Object sets, optionally narrowed to `region`.
    pub fn object_sets(&mut self, region: Option<Rect>) -> Arc<ObjectSets> {
        self.index.build_sets(&self.world, region)
    }

    /// Cast against one object set, skipping `exclude`.
    pub fn cast(&mut self, query: &RaycastQuery, kind: SetKind, exclude: Option<Entity>) -> Vec<RaycastHit> {
        let sets = self.index.build_sets(&self.world, None);
        let objects = sets.get(kind);
        match exclude {
            None => self.raycaster.cast(query, objects),
            Some(skip) => {
                let kept: Vec<_> = objects.iter().filter(|o| o.entity != skip).cloned().collect();
                self.raycaster.cast(query, &kept)
            }
        }
    }

    /// Nearest collision surface under a pointer ray.
    pub fn pick(&mut self, origin: Vec3, direction: Vec3) -> Option<RaycastHit> {
        let query = RaycastQuery::nearest(origin, direction, f32::INFINITY);
        self.cast(&query, SetKind::Collision, None).into_iter().next()
    }

    pub fn visibility_polygon(
        &mut self,
        source: SourceId,
        params: &PolygonConfig,
        now: Instant,
    ) -> VisibilityPolygon {
        let sets = self.index.build_sets(&self.world, None);
        let mut caster = SetCaster::new(&mut self.raycaster, &sets.sight);
        self.vision.polygon(source, params, &mut caster, now)
    }

    pub fn forget_source(&mut self, source: SourceId) {
        self.vision.forget_source(source);
    }
}
