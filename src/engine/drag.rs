// Drag placement: snaps a dragged object onto the nearest collision surface
// under the pointer ray, or onto a horizontal plane at its last stable height.

use bevy_ecs::entity::Entity;
use glam::Vec3;

use super::raycast::RaycastQuery;
use super::scene::SceneContext;
use super::scene_index::SetKind;

const MIN_PLANE_DOT: f32 = 1e-6;

pub struct DragCollisionResolver {
    /// Ignore collision surfaces and slide on the reference plane only.
    pub free_mode: bool,
    elevation: f32,
    last_point: Vec3,
}

impl DragCollisionResolver {
    /// Start a drag from the object's current position.
    pub fn new(start: Vec3) -> Self {
        Self { free_mode: false, elevation: start.y, last_point: start }
    }

    /// Height of the fallback plane.
    pub fn elevation(&self) -> f32 { self.elevation }

    pub fn last_point(&self) -> Vec3 { self.last_point }

    /// Placement point for a pointer ray. `dragged` is left out of the
    /// collision set; a flying `dragged` entity behaves as free mode.
    pub fn resolve(
        &mut self,
        scene: &mut SceneContext,
        origin: Vec3,
        direction: Vec3,
        dragged: Option<Entity>,
    ) -> Vec3 {
        let free = self.free_mode || dragged.is_some_and(|e| scene.is_flying(e));
        if !free {
            let query = RaycastQuery::nearest(origin, direction, f32::INFINITY);
            if let Some(hit) = scene.cast(&query, SetKind::Collision, dragged).first() {
                self.elevation = hit.point.y;
                self.last_point = hit.point;
                return hit.point;
            }
        }
        if let Some(point) = self.plane_point(origin, direction) {
            self.last_point = point;
        }
        self.last_point
    }

    fn plane_point(&self, origin: Vec3, direction: Vec3) -> Option<Vec3> {
        let dir = direction.normalize_or_zero();
        if dir.y.abs() < MIN_PLANE_DOT {
            return None;
        }
        let t = (self.elevation - origin.y) / dir.y;
        (t >= 0.0).then(|| origin + dir * t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::components::{BlockingTags, Transform};
    use crate::engine::config::VisionConfig;
    use crate::engine::mesh::{cuboid, MeshNode};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn scene_with_table() -> (SceneContext, Entity) {
        let mut scene = SceneContext::new(VisionConfig::default()).unwrap();
        let table = Arc::new(MeshNode::single(cuboid(Vec3::new(-1.0, 0.0, -1.0), Vec3::new(1.0, 1.0, 1.0))));
        let e = scene.spawn_blocker(table, Transform::default(), BlockingTags::WALL);
        (scene, e)
    }

    #[test]
    fn snaps_onto_surface_then_keeps_its_height() {
        let (mut scene, _) = scene_with_table();
        let mut drag = DragCollisionResolver::new(Vec3::new(5.0, 0.0, 0.0));

        let on_table = drag.resolve(&mut scene, Vec3::new(0.1, 10.0, 0.1), -Vec3::Y, None);
        assert_relative_eq!(on_table.y, 1.0, epsilon = 1e-4);
        assert_eq!(drag.elevation(), on_table.y);

        // off the table edge: no hit, falls onto the plane at the table height
        let off = drag.resolve(&mut scene, Vec3::new(4.0, 10.0, 0.0), Vec3::new(0.0, -1.0, 0.0), None);
        assert_relative_eq!(off.y, 1.0, epsilon = 1e-4);
        assert_relative_eq!(off.x, 4.0, epsilon = 1e-4);
    }

    #[test]
    fn dragged_entity_never_blocks_itself() {
        let (mut scene, table) = scene_with_table();
        let mut drag = DragCollisionResolver::new(Vec3::ZERO);
        let point = drag.resolve(&mut scene, Vec3::new(0.1, 10.0, 0.1), -Vec3::Y, Some(table));
        assert_relative_eq!(point.y, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn free_mode_and_flying_ignore_collision() {
        let (mut scene, table) = scene_with_table();
        let token = scene.spawn_blocker(
            Arc::new(MeshNode::single(cuboid(Vec3::splat(-0.2), Vec3::splat(0.2)))),
            Transform::from_position(Vec3::new(8.0, 3.0, 8.0)),
            BlockingTags::NONE,
        );
        scene.set_flying(token, true);

        let mut drag = DragCollisionResolver::new(Vec3::new(8.0, 3.0, 8.0));
        let point = drag.resolve(&mut scene, Vec3::new(0.1, 10.0, 0.1), -Vec3::Y, Some(token));
        assert_relative_eq!(point.y, 3.0, epsilon = 1e-4);

        let mut drag = DragCollisionResolver::new(Vec3::ZERO);
        drag.free_mode = true;
        let point = drag.resolve(&mut scene, Vec3::new(0.1, 10.0, 0.1), -Vec3::Y, None);
        assert_relative_eq!(point.y, 0.0, epsilon = 1e-4);
        assert!(scene.object_sets(None).collision.iter().any(|o| o.entity == table));
    }

    #[test]
    fn parallel_ray_keeps_last_point() {
        let (mut scene, _) = scene_with_table();
        let mut drag = DragCollisionResolver::new(Vec3::new(5.0, 0.0, 5.0));
        let point = drag.resolve(&mut scene, Vec3::new(20.0, 0.5, 20.0), Vec3::X, None);
        assert_eq!(point, Vec3::new(5.0, 0.0, 5.0));
    }
}
