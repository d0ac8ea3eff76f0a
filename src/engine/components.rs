// Core ECS components for scene entities that take part in sight and collision.
// An entity is raycastable when it has Transform + SceneMesh.

use std::collections::HashSet;
use std::sync::Arc;

use bevy_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3};

use super::mesh::{MeshNode, MeshPart, PartTags};

/// Placement of an entity in 3D space
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self { position, ..Default::default() }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }
}

/// Shared, immutable geometry. Replace the Arc to change vertex data;
/// raycast caches rebuild when the pointer changes.
#[derive(Component, Debug, Clone)]
pub struct SceneMesh(pub Arc<MeshNode>);

/// Whether the entity is rendered at all
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visible(pub bool);

impl Default for Visible {
    fn default() -> Self { Self(true) }
}

/// Entity-level blocking flags, used by every part without explicit tags
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingTags {
    pub sight: bool,
    pub collision: bool,
    pub camera_blocking: bool,
}

impl BlockingTags {
    pub const WALL: Self = Self { sight: true, collision: true, camera_blocking: true };
    pub const NONE: Self = Self { sight: false, collision: false, camera_blocking: false };

    pub fn as_part_tags(self) -> PartTags {
        PartTags {
            sight: self.sight,
            collision: self.collision,
            camera_blocking: self.camera_blocking,
            door_id: None,
        }
    }
}

/// Open doors on a composite entity, by door id
#[derive(Component, Debug, Clone, Default, PartialEq, Eq)]
pub struct DoorState {
    pub open: HashSet<u32>,
}

impl DoorState {
    pub fn is_open(&self, door_id: u32) -> bool {
        self.open.contains(&door_id)
    }
}

/// Layer the entity is drawn on. Hidden layers hide all their entities.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layer(pub u32);

/// Marks a flying token; dragging it ignores collision surfaces
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct Flying;

/// Layers currently hidden
#[derive(Resource, Debug, Clone, Default)]
pub struct LayerVisibility {
    pub hidden: HashSet<u32>,
}

/// Effective tags for one part of an entity: explicit part tags win over
/// entity flags, then door state is applied.
pub fn effective_tags(part: &MeshPart, entity: BlockingTags, doors: Option<&DoorState>) -> PartTags {
    let tags = part.tags.unwrap_or_else(|| entity.as_part_tags());
    tags.resolve(|id| doors.is_some_and(|d| d.is_open(id)))
}
