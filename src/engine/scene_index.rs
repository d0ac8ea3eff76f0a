// Scene index: derives the collision / sight / camera-blocking object sets
// from the ECS world.
//
// Layer 1: FootprintGrid, a uniform XZ grid of entity footprints for region queries.
// Layer 2: SceneIndexBuilder, which filters candidates by visibility and tags into ObjectSets,
//          caching the unrestricted result until the scene changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bevy_ecs::prelude::*;
use glam::{Mat4, UVec2, Vec2};

use super::components::*;
use super::config::VisionConfig;
use super::mesh::{MeshNode, MeshPart};

// ============================================================================
// RECT
// ============================================================================

/// Axis-aligned rectangle on the XZ plane (`x` = world X, `y` = world Z).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min: Vec2,
    pub max: Vec2,
}

impl Rect {
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min: min.min(max), max: min.max(max) }
    }

    pub fn around(center: Vec2, half_extent: f32) -> Self {
        Self::new(center - Vec2::splat(half_extent), center + Vec2::splat(half_extent))
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }
}

// ============================================================================
// FOOTPRINT GRID
// ============================================================================

/// Uniform grid of entity footprints on the XZ plane.
///
/// An entity is stored in every cell its footprint overlaps. Footprints
/// outside the grid bounds are clamped into the border cells, so nothing is
/// ever dropped; queries return a superset that callers filter by rect.
pub struct FootprintGrid {
    cells: Vec<Vec<Entity>>,
    cell_size: f32,
    width: u32,
    height: u32,
    world_min: Vec2,
    footprints: HashMap<Entity, Rect>,
}

impl FootprintGrid {
    pub fn new(world_min: Vec2, world_max: Vec2, cell_size: f32) -> Self {
        let span = world_max - world_min;
        let width  = ((span.x / cell_size).ceil() as u32).max(1);
        let height = ((span.y / cell_size).ceil() as u32).max(1);
        Self {
            cells: vec![Vec::new(); (width * height) as usize],
            cell_size,
            width,
            height,
            world_min,
            footprints: HashMap::new(),
        }
    }

    fn cell_clamped(&self, pos: Vec2) -> UVec2 {
        let c = ((pos - self.world_min) / self.cell_size).floor();
        UVec2::new(
            (c.x.max(0.0) as u32).min(self.width - 1),
            (c.y.max(0.0) as u32).min(self.height - 1),
        )
    }

    fn cell_range(&self, rect: &Rect) -> (UVec2, UVec2) {
        (self.cell_clamped(rect.min), self.cell_clamped(rect.max))
    }

    /// Insert or move `entity` to `footprint`.
    pub fn insert(&mut self, entity: Entity, footprint: Rect) {
        self.remove(entity);
        let (lo, hi) = self.cell_range(&footprint);
        for cy in lo.y..=hi.y {
            for cx in lo.x..=hi.x {
                self.cells[(cy * self.width + cx) as usize].push(entity);
            }
        }
        self.footprints.insert(entity, footprint);
    }

    pub fn remove(&mut self, entity: Entity) {
        let Some(old) = self.footprints.remove(&entity) else { return };
        let (lo, hi) = self.cell_range(&old);
        for cy in lo.y..=hi.y {
            for cx in lo.x..=hi.x {
                self.cells[(cy * self.width + cx) as usize].retain(|e| *e != entity);
            }
        }
    }

    pub fn clear(&mut self) {
        for c in &mut self.cells { c.clear(); }
        self.footprints.clear();
    }

    pub fn len(&self) -> usize { self.footprints.len() }

    pub fn is_empty(&self) -> bool { self.footprints.is_empty() }

    /// Entities whose footprint intersects `rect`, in ascending entity order.
    pub fn query_rect(&self, rect: &Rect) -> Vec<Entity> {
        let (lo, hi) = self.cell_range(rect);
        let mut seen = HashSet::new();
        for cy in lo.y..=hi.y {
            for cx in lo.x..=hi.x {
                for e in &self.cells[(cy * self.width + cx) as usize] {
                    if self.footprints[e].intersects(rect) {
                        seen.insert(*e);
                    }
                }
            }
        }
        let mut out: Vec<Entity> = seen.into_iter().collect();
        out.sort();
        out
    }
}

// ============================================================================
// OBJECT SETS
// ============================================================================

/// Which parts of an entity's mesh an object covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartSelection {
    /// All raycastable parts; used for entities without per-part tags.
    Whole,
    /// A single tagged part.
    Part(usize),
}

/// One raycast target: an entity's geometry (or one of its parts) placed in the world.
#[derive(Debug, Clone)]
pub struct SceneObject {
    pub entity: Entity,
    pub selection: PartSelection,
    pub world: Mat4,
    pub node: Arc<MeshNode>,
}

impl SceneObject {
    /// Selected parts that can be hit, with their index in the node.
    pub fn parts(&self) -> impl Iterator<Item = (usize, &MeshPart)> + '_ {
        let range = match self.selection {
            PartSelection::Whole => 0..self.node.parts.len(),
            PartSelection::Part(i) => i..(i + 1).min(self.node.parts.len()),
        };
        range
            .map(|i| (i, &self.node.parts[i]))
            .filter(|(_, p)| p.is_raycastable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    Collision,
    Sight,
    CameraBlocking,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectSets {
    pub collision: Vec<SceneObject>,
    pub sight: Vec<SceneObject>,
    pub camera_blocking: Vec<SceneObject>,
}

impl ObjectSets {
    pub fn get(&self, kind: SetKind) -> &[SceneObject] {
        match kind {
            SetKind::Collision => &self.collision,
            SetKind::Sight => &self.sight,
            SetKind::CameraBlocking => &self.camera_blocking,
        }
    }
}

// ============================================================================
// SCENE INDEX BUILDER
// ============================================================================

pub struct SceneIndexBuilder {
    grid: FootprintGrid,
    /// Entities known to the index, including ones without a footprint yet.
    tracked: HashSet<Entity>,
    cached: Option<Arc<ObjectSets>>,
}

impl SceneIndexBuilder {
    pub fn new(config: &VisionConfig) -> Self {
        Self {
            grid: FootprintGrid::new(
                config.index_bounds_min,
                config.index_bounds_max,
                config.index_cell_size,
            ),
            tracked: HashSet::new(),
            cached: None,
        }
    }

    /// Register or refresh an entity after creation or a transform/mesh change.
    pub fn track(&mut self, world: &World, entity: Entity) {
        self.tracked.insert(entity);
        let footprint = match (world.get::<Transform>(entity), world.get::<SceneMesh>(entity)) {
            (Some(t), Some(m)) => m.0.bounds(t.matrix()),
            _ => None,
        };
        match footprint {
            Some((lo, hi)) => self.grid.insert(
                entity,
                Rect::new(Vec2::new(lo.x, lo.z), Vec2::new(hi.x, hi.z)),
            ),
            None => self.grid.remove(entity),
        }
        self.invalidate();
    }

    pub fn untrack(&mut self, entity: Entity) {
        self.tracked.remove(&entity);
        self.grid.remove(entity);
        self.invalidate();
    }

    pub fn clear(&mut self) {
        self.tracked.clear();
        self.grid.clear();
        self.invalidate();
    }

    /// Drop the cached sets. Call on any visibility, tag or door change.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Build the three object sets, optionally restricted to `region`.
    /// Unrestricted results are cached until the next invalidation.
    pub fn build_sets(&mut self, world: &World, region: Option<Rect>) -> Arc<ObjectSets> {
        match region {
            Some(rect) => {
                let candidates = self.grid.query_rect(&rect);
                Arc::new(collect_sets(world, &candidates))
            }
            None => {
                if let Some(sets) = &self.cached {
                    return sets.clone();
                }
                let mut candidates: Vec<Entity> = self.tracked.iter().copied().collect();
                candidates.sort();
                let sets = Arc::new(collect_sets(world, &candidates));
                log::debug!(
                    "scene index rebuilt: {} collision, {} sight, {} camera-blocking",
                    sets.collision.len(),
                    sets.sight.len(),
                    sets.camera_blocking.len()
                );
                self.cached = Some(sets.clone());
                sets
            }
        }
    }
}

/// True when the entity is rendered and its layer is shown.
pub fn is_entity_visible(world: &World, entity: Entity) -> bool {
    if world.get::<Visible>(entity).is_some_and(|v| !v.0) {
        return false;
    }
    match (world.get::<Layer>(entity), world.get_resource::<LayerVisibility>()) {
        (Some(layer), Some(layers)) => !layers.hidden.contains(&layer.0),
        _ => true,
    }
}

fn collect_sets(world: &World, candidates: &[Entity]) -> ObjectSets {
    let mut sets = ObjectSets::default();

    for &entity in candidates {
        let (Some(transform), Some(mesh)) =
            (world.get::<Transform>(entity), world.get::<SceneMesh>(entity))
        else {
            continue;
        };
        if !is_entity_visible(world, entity) {
            continue;
        }
        let flags = world.get::<BlockingTags>(entity).copied().unwrap_or(BlockingTags::NONE);
        let doors = world.get::<DoorState>(entity);
        let object = |selection| SceneObject {
            entity,
            selection,
            world: transform.matrix(),
            node: mesh.0.clone(),
        };

        if mesh.0.has_tags() {
            // Composite: every qualifying part goes in on its own
            for (i, part) in mesh.0.parts.iter().enumerate() {
                if !part.is_raycastable() {
                    continue;
                }
                let tags = effective_tags(part, flags, doors);
                if tags.collision { sets.collision.push(object(PartSelection::Part(i))); }
                if tags.sight { sets.sight.push(object(PartSelection::Part(i))); }
                if tags.camera_blocking { sets.camera_blocking.push(object(PartSelection::Part(i))); }
            }
        } else {
            if flags.collision { sets.collision.push(object(PartSelection::Whole)); }
            if flags.sight { sets.sight.push(object(PartSelection::Whole)); }
            if flags.camera_blocking { sets.camera_blocking.push(object(PartSelection::Whole)); }
        }
    }

    sets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mesh::{cuboid, MeshPart, PartTags};
    use glam::Vec3;

    fn wall(world: &mut World, at: Vec3, tags: BlockingTags) -> Entity {
        world
            .spawn((
                Transform::from_position(at),
                SceneMesh(Arc::new(MeshNode::single(cuboid(Vec3::ZERO, Vec3::ONE)))),
                Visible(true),
                tags,
            ))
            .id()
    }

    fn builder_for(world: &World, entities: &[Entity]) -> SceneIndexBuilder {
        let mut index = SceneIndexBuilder::new(&VisionConfig::default());
        for &e in entities {
            index.track(world, e);
        }
        index
    }

    #[test]
    fn flags_route_entities_into_sets() {
        let mut world = World::new();
        let a = wall(&mut world, Vec3::ZERO, BlockingTags::WALL);
        let b = wall(
            &mut world,
            Vec3::X * 5.0,
            BlockingTags { sight: true, collision: false, camera_blocking: false },
        );
        let mut index = builder_for(&world, &[a, b]);
        let sets = index.build_sets(&world, None);
        assert_eq!(sets.sight.len(), 2);
        assert_eq!(sets.collision.len(), 1);
        assert_eq!(sets.collision[0].entity, a);
        assert_eq!(sets.camera_blocking.len(), 1);
    }

    #[test]
    fn hidden_entities_and_layers_are_excluded() {
        let mut world = World::new();
        let a = wall(&mut world, Vec3::ZERO, BlockingTags::WALL);
        let b = wall(&mut world, Vec3::X * 5.0, BlockingTags::WALL);
        let c = wall(&mut world, Vec3::X * 9.0, BlockingTags::WALL);
        world.entity_mut(a).insert(Visible(false));
        world.entity_mut(b).insert(Layer(3));
        world.insert_resource(LayerVisibility { hidden: [3].into_iter().collect() });

        let mut index = builder_for(&world, &[a, b, c]);
        let sets = index.build_sets(&world, None);
        assert_eq!(sets.sight.len(), 1);
        assert_eq!(sets.sight[0].entity, c);
    }

    #[test]
    fn tagged_parts_are_split_and_doors_open() {
        let mut world = World::new();
        let node = MeshNode::from_parts(vec![
            MeshPart::new("frame", cuboid(Vec3::ZERO, Vec3::ONE)).with_tags(PartTags::solid()),
            MeshPart::new("leaf", cuboid(Vec3::ZERO, Vec3::ONE)).with_tags(PartTags::door(1)),
        ]);
        let door = world
            .spawn((
                Transform::default(),
                SceneMesh(Arc::new(node)),
                BlockingTags::WALL,
                DoorState::default(),
            ))
            .id();
        let mut index = builder_for(&world, &[door]);

        let closed = index.build_sets(&world, None);
        assert_eq!(closed.sight.len(), 2);
        assert_eq!(closed.collision.len(), 2);

        world.get_mut::<DoorState>(door).unwrap().open.insert(1);
        index.invalidate();
        let open = index.build_sets(&world, None);
        assert_eq!(open.sight.len(), 1);
        assert_eq!(open.sight[0].selection, PartSelection::Part(0));
        assert_eq!(open.collision.len(), 1);
    }

    #[test]
    fn unrestricted_sets_are_cached_until_invalidated() {
        let mut world = World::new();
        let a = wall(&mut world, Vec3::ZERO, BlockingTags::WALL);
        let mut index = builder_for(&world, &[a]);
        let first = index.build_sets(&world, None);
        let second = index.build_sets(&world, None);
        assert!(Arc::ptr_eq(&first, &second));

        index.invalidate();
        assert!(!index.is_cached());
        let third = index.build_sets(&world, None);
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn region_narrows_candidates() {
        let mut world = World::new();
        let near = wall(&mut world, Vec3::new(1.0, 0.0, 1.0), BlockingTags::WALL);
        let far = wall(&mut world, Vec3::new(60.0, 0.0, 60.0), BlockingTags::WALL);
        let mut index = builder_for(&world, &[near, far]);

        let sets = index.build_sets(&world, Some(Rect::around(Vec2::ZERO, 5.0)));
        assert_eq!(sets.sight.len(), 1);
        assert_eq!(sets.sight[0].entity, near);
        // region queries never populate the cache
        assert!(!index.is_cached());
    }

    #[test]
    fn grid_moves_and_removes_footprints() {
        let mut world = World::new();
        let e = world.spawn_empty().id();
        let mut grid = FootprintGrid::new(Vec2::splat(-10.0), Vec2::splat(10.0), 2.0);
        grid.insert(e, Rect::around(Vec2::ZERO, 1.0));
        assert_eq!(grid.query_rect(&Rect::around(Vec2::ZERO, 0.5)), vec![e]);

        grid.insert(e, Rect::around(Vec2::splat(8.0), 1.0));
        assert!(grid.query_rect(&Rect::around(Vec2::ZERO, 0.5)).is_empty());
        // out-of-bounds queries clamp to the border cells
        assert_eq!(grid.query_rect(&Rect::around(Vec2::splat(9.5), 3.0)), vec![e]);

        grid.remove(e);
        assert!(grid.is_empty());
        assert!(grid.query_rect(&Rect::around(Vec2::splat(8.0), 2.0)).is_empty());
    }
}
