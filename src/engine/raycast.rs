// Ray queries against scene object sets.
//
// BvhRaycaster keeps one MeshBvh per mesh node part, shared by every entity
// spawned from the same Arc<MeshNode> and rebuilt when an entity's mesh is
// swapped. Rays are tested in each part's local space, and hits go through a
// pluggable HitFilter before they are returned.

use std::collections::HashMap;
use std::sync::Arc;

use bevy_ecs::entity::Entity;
use glam::{Mat4, Vec3};

use super::bvh::{MeshBvh, Ray, TriangleHit};
use super::mesh::{MeshNode, MeshPart};
use super::scene_index::SceneObject;

const MIN_DIRECTION_LENGTH_SQ: f32 = 1e-12;
const MIN_DETERMINANT: f32 = 1e-12;

/// One ray query. Constructed per call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaycastQuery {
    pub origin: Vec3,
    /// Normalized internally; need not be unit length.
    pub direction: Vec3,
    /// Maximum hit distance, possibly `f32::INFINITY`.
    pub far: f32,
    pub first_hit_only: bool,
}

impl RaycastQuery {
    pub fn nearest(origin: Vec3, direction: Vec3, far: f32) -> Self {
        Self { origin, direction, far, first_hit_only: true }
    }

    pub fn all(origin: Vec3, direction: Vec3, far: f32) -> Self {
        Self { origin, direction, far, first_hit_only: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaycastHit {
    pub point: Vec3,
    pub distance: f32,
    /// Unit surface normal, facing the ray origin.
    pub normal: Vec3,
    pub entity: Entity,
    /// Index of the hit part within the entity's mesh.
    pub part: usize,
}

// ============================================================================
// HIT FILTERS
// ============================================================================

/// Post-filter applied to every candidate hit.
pub trait HitFilter: Send {
    fn keep(&self, hit: &RaycastHit, part: &MeshPart) -> bool;
}

/// Near-plane and clip-height filter.
///
/// A hit closer than `near` is dropped only when the part has no clip
/// height; a hit above a part's clip height is always dropped.
#[derive(Debug, Clone, Copy)]
pub struct ClipFilter {
    pub near: f32,
}

impl HitFilter for ClipFilter {
    fn keep(&self, hit: &RaycastHit, part: &MeshPart) -> bool {
        match part.clip_height {
            Some(height) => hit.point.y <= height,
            None => hit.distance >= self.near,
        }
    }
}

/// Keeps every hit.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAll;

impl HitFilter for KeepAll {
    fn keep(&self, _hit: &RaycastHit, _part: &MeshPart) -> bool { true }
}

// ============================================================================
// RAYCASTER
// ============================================================================

/// Address of a shared `MeshNode`; entities spawned from one `Arc` share a key.
type NodeKey = usize;

struct CachedBvh {
    /// Held so the node's address stays unique while the entry lives.
    node: Arc<MeshNode>,
    bvh: Arc<MeshBvh>,
}

pub struct BvhRaycaster {
    cache: HashMap<(NodeKey, usize), CachedBvh>,
    /// Node each entity was last cast with, for eviction.
    owners: HashMap<Entity, NodeKey>,
    filter: Box<dyn HitFilter>,
    rebuilds: u64,
}

impl BvhRaycaster {
    pub fn new(near: f32) -> Self {
        Self::with_filter(Box::new(ClipFilter { near }))
    }

    pub fn with_filter(filter: Box<dyn HitFilter>) -> Self {
        Self { cache: HashMap::new(), owners: HashMap::new(), filter, rebuilds: 0 }
    }

    pub fn set_filter(&mut self, filter: Box<dyn HitFilter>) {
        self.filter = filter;
    }

    /// Total BVH builds so far.
    pub fn rebuilds(&self) -> u64 { self.rebuilds }

    /// Number of distinct (node, part) BVHs held.
    pub fn cached(&self) -> usize { self.cache.len() }

    /// Drop a destroyed entity; its BVHs go once no other entity shares the node.
    pub fn forget(&mut self, entity: Entity) {
        if let Some(key) = self.owners.remove(&entity) {
            self.release(key);
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.owners.clear();
    }

    fn release(&mut self, key: NodeKey) {
        if !self.owners.values().any(|k| *k == key) {
            self.cache.retain(|(k, _), _| *k != key);
        }
    }

    fn bvh_for(&mut self, entity: Entity, part: usize, node: &Arc<MeshNode>) -> Arc<MeshBvh> {
        let key = Arc::as_ptr(node) as NodeKey;
        match self.owners.insert(entity, key) {
            Some(previous) if previous != key => self.release(previous),
            _ => {}
        }
        if let Some(cached) = self.cache.get(&(key, part)) {
            return cached.bvh.clone();
        }
        let bvh = Arc::new(MeshBvh::build(&node.parts[part].mesh));
        log::debug!(
            "built BVH for {:?} part {} ({} triangles)",
            entity,
            part,
            bvh.triangle_count()
        );
        self.rebuilds += 1;
        self.cache.insert((key, part), CachedBvh { node: node.clone(), bvh: bvh.clone() });
        bvh
    }

    /// Cast `query` against `objects`. Hits are sorted by ascending distance;
    /// with `first_hit_only` at most one is returned.
    pub fn cast(&mut self, query: &RaycastQuery, objects: &[SceneObject]) -> Vec<RaycastHit> {
        if objects.is_empty()
            || query.direction.length_squared() < MIN_DIRECTION_LENGTH_SQ
            || !(query.far > 0.0)
        {
            return Vec::new();
        }
        let dir = query.direction.normalize();
        let mut hits = Vec::new();
        let mut far = query.far;

        for object in objects {
            for (index, part) in object.parts() {
                let bvh = self.bvh_for(object.entity, index, &object.node);
                for to_world in part_transforms(object.world, part) {
                    if to_world.determinant().abs() < MIN_DETERMINANT {
                        continue;
                    }
                    let to_local = to_world.inverse();
                    // Local direction stays unnormalized so `t` is a world distance
                    let ray = Ray::new(
                        to_local.transform_point3(query.origin),
                        to_local.transform_vector3(dir),
                    );
                    let make_hit = |h: TriangleHit| RaycastHit {
                        point: query.origin + dir * h.t,
                        distance: h.t,
                        normal: to_local
                            .transpose()
                            .transform_vector3(h.normal)
                            .normalize_or_zero(),
                        entity: object.entity,
                        part: index,
                    };

                    if query.first_hit_only {
                        let nearest = bvh.intersect_nearest(&part.mesh, &ray, far).map(make_hit);
                        let kept = match nearest {
                            Some(hit) if self.filter.keep(&hit, part) => Some(hit),
                            Some(_) => bvh
                                .intersect_all(&part.mesh, &ray, far)
                                .into_iter()
                                .map(make_hit)
                                .find(|hit| self.filter.keep(hit, part)),
                            None => None,
                        };
                        if let Some(hit) = kept {
                            far = hit.distance;
                            hits.push(hit);
                        }
                    } else {
                        hits.extend(
                            bvh.intersect_all(&part.mesh, &ray, far)
                                .into_iter()
                                .map(make_hit)
                                .filter(|hit| self.filter.keep(hit, part)),
                        );
                    }
                }
            }
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        if query.first_hit_only {
            hits.truncate(1);
        }
        hits
    }
}

/// World transform of every placement of `part` under `world`.
pub fn part_transforms(world: Mat4, part: &MeshPart) -> impl Iterator<Item = Mat4> + '_ {
    part.placements().into_iter().map(move |m| world * m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mesh::{cuboid, PartTags};
    use crate::engine::scene_index::PartSelection;
    use approx::assert_relative_eq;
    use bevy_ecs::world::World;
    use glam::Quat;

    fn object(entity: Entity, node: MeshNode, world: Mat4) -> SceneObject {
        SceneObject { entity, selection: PartSelection::Whole, world, node: Arc::new(node) }
    }

    fn block(entity: Entity, x: f32) -> SceneObject {
        object(
            entity,
            MeshNode::single(cuboid(Vec3::new(-0.5, -1.0, -2.0), Vec3::new(0.5, 1.0, 2.0))),
            Mat4::from_translation(Vec3::X * x),
        )
    }

    fn entities(n: usize) -> Vec<Entity> {
        let mut world = World::new();
        (0..n).map(|_| world.spawn_empty().id()).collect()
    }

    #[test]
    fn empty_inputs_return_no_hits() {
        let e = entities(1);
        let mut rc = BvhRaycaster::new(0.0);
        let q = RaycastQuery::all(Vec3::ZERO, Vec3::X, f32::INFINITY);
        assert!(rc.cast(&q, &[]).is_empty());
        let zero = RaycastQuery::all(Vec3::ZERO, Vec3::ZERO, 10.0);
        assert!(rc.cast(&zero, &[block(e[0], 5.0)]).is_empty());
        let miss = RaycastQuery::all(Vec3::ZERO, -Vec3::X, 10.0);
        assert!(rc.cast(&miss, &[block(e[0], 5.0)]).is_empty());
    }

    #[test]
    fn all_hits_sorted_and_first_hit_short_circuits() {
        let e = entities(2);
        let objects = [block(e[1], 9.0), block(e[0], 5.0)];
        let mut rc = BvhRaycaster::new(0.0);

        let origin = Vec3::new(0.0, 0.3, 0.1);
        let all = rc.cast(&RaycastQuery::all(origin, Vec3::X, 100.0), &objects);
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert_eq!(all[0].entity, e[0]);

        let first = rc.cast(&RaycastQuery::nearest(origin, Vec3::X * 3.0, 100.0), &objects);
        assert_eq!(first.len(), 1);
        assert_relative_eq!(first[0].distance, 4.5, epsilon = 1e-4);
        assert_relative_eq!(first[0].point.x, 4.5, epsilon = 1e-4);
        assert_relative_eq!(first[0].normal.x, -1.0, epsilon = 1e-4);
    }

    #[test]
    fn transformed_objects_report_world_distances() {
        let e = entities(1);
        let world = Mat4::from_scale_rotation_translation(
            Vec3::new(2.0, 1.0, 1.0),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
            Vec3::new(0.0, 0.0, 10.0),
        );
        // unit cube scaled along local X, which is world -Z after the rotation
        let obj = object(e[0], MeshNode::single(cuboid(Vec3::splat(-0.5), Vec3::splat(0.5))), world);
        let mut rc = BvhRaycaster::new(0.0);
        let hit = rc.cast(&RaycastQuery::nearest(Vec3::ZERO, Vec3::Z, 100.0), &[obj]);
        assert_relative_eq!(hit[0].distance, 9.0, epsilon = 1e-4);
        assert_relative_eq!(hit[0].normal.z, -1.0, epsilon = 1e-4);
    }

    #[test]
    fn near_plane_skips_close_hits_without_clip_height() {
        let e = entities(2);
        let objects = [block(e[0], 1.0), block(e[1], 6.0)];
        let mut rc = BvhRaycaster::new(1.0);
        let hit = rc.cast(&RaycastQuery::nearest(Vec3::ZERO, Vec3::X, 100.0), &objects);
        // 0.5 is inside the near plane; the far face of the first block at 1.5 is kept
        assert_relative_eq!(hit[0].distance, 1.5, epsilon = 1e-4);
        assert_eq!(hit[0].entity, e[0]);
    }

    #[test]
    fn clip_height_discards_hits_above_it() {
        let e = entities(1);
        let mut part = MeshPart::new("roof", cuboid(Vec3::new(4.0, 0.0, -1.0), Vec3::new(5.0, 3.0, 1.0)))
            .with_clip_height(2.0);
        part.tags = Some(PartTags::solid());
        let obj = object(e[0], MeshNode::from_parts(vec![part]), Mat4::IDENTITY);
        let mut rc = BvhRaycaster::new(10.0);

        let low = rc.cast(&RaycastQuery::nearest(Vec3::new(0.0, 1.0, 0.0), Vec3::X, 100.0), &[obj.clone()]);
        // clip height overrides the near plane
        assert_eq!(low.len(), 1);
        let high = rc.cast(&RaycastQuery::nearest(Vec3::new(0.0, 2.5, 0.0), Vec3::X, 100.0), &[obj]);
        assert!(high.is_empty());
    }

    #[test]
    fn instances_expand_to_separate_targets() {
        let e = entities(1);
        let part = MeshPart::new("post", cuboid(Vec3::splat(-0.5), Vec3::splat(0.5))).with_instances(vec![
            Mat4::from_translation(Vec3::X * 3.0),
            Mat4::from_translation(Vec3::X * 7.0),
        ]);
        let obj = object(e[0], MeshNode::from_parts(vec![part]), Mat4::IDENTITY);
        let mut rc = BvhRaycaster::new(0.0);
        let hits = rc.cast(&RaycastQuery::all(Vec3::new(0.0, 0.1, 0.2), Vec3::X, 100.0), &[obj]);
        assert_eq!(hits.len(), 4);
        assert_relative_eq!(hits[2].distance, 6.5, epsilon = 1e-4);
    }

    #[test]
    fn bvh_is_rebuilt_only_when_mesh_changes() {
        let e = entities(1);
        let obj = block(e[0], 5.0);
        let mut rc = BvhRaycaster::new(0.0);
        let q = RaycastQuery::nearest(Vec3::ZERO, Vec3::X, 100.0);
        rc.cast(&q, &[obj.clone()]);
        rc.cast(&q, &[obj.clone()]);
        assert_eq!(rc.rebuilds(), 1);

        let swapped = block(e[0], 5.0);
        rc.cast(&q, &[swapped]);
        assert_eq!(rc.rebuilds(), 2);

        rc.forget(e[0]);
        rc.cast(&q, &[obj]);
        assert_eq!(rc.rebuilds(), 3);
    }

    #[test]
    fn entities_sharing_a_node_share_its_bvh() {
        let e = entities(3);
        let node = Arc::new(MeshNode::single(cuboid(Vec3::new(-0.5, -1.0, -2.0), Vec3::new(0.5, 1.0, 2.0))));
        let placed = |entity, x: f32| SceneObject {
            entity,
            selection: PartSelection::Whole,
            world: Mat4::from_translation(Vec3::X * x),
            node: node.clone(),
        };
        let objects = [placed(e[0], 3.0), placed(e[1], 6.0), placed(e[2], 9.0)];
        let mut rc = BvhRaycaster::new(0.0);
        let q = RaycastQuery::all(Vec3::new(0.0, 0.2, 0.1), Vec3::X, 100.0);
        assert_eq!(rc.cast(&q, &objects).len(), 6);
        assert_eq!(rc.rebuilds(), 1);
        assert_eq!(rc.cached(), 1);

        rc.forget(e[0]);
        rc.forget(e[1]);
        // e[2] still holds the node
        assert_eq!(rc.cached(), 1);
        rc.cast(&q, &objects[2..]);
        assert_eq!(rc.rebuilds(), 1);

        rc.forget(e[2]);
        assert_eq!(rc.cached(), 0);
    }
}
