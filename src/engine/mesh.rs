// Scene mesh model: triangle soups grouped into tagged parts.
//
// Three-layer architecture:
//   PolyMesh (n-gon faces) → triangulate() → TriMesh → MeshPart (tags, transform) → MeshNode
//
// MeshNode is also the payload the raycast worker receives, serialized with serde_json.

use glam::{Mat4, Vec2, Vec3};
use serde::{Deserialize, Serialize};

use super::error::SightError;

// ============================================================================
// CAPABILITY TAGS
// ============================================================================

/// Per-part blocking capabilities.
///
/// `door_id` links the part to a door on the owning entity. While that door
/// is open the part neither blocks sight nor collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartTags {
    pub sight: bool,
    pub collision: bool,
    pub camera_blocking: bool,
    pub door_id: Option<u32>,
}

impl PartTags {
    pub const fn solid() -> Self {
        Self { sight: true, collision: true, camera_blocking: true, door_id: None }
    }

    pub const fn door(door_id: u32) -> Self {
        Self { sight: true, collision: true, camera_blocking: false, door_id: Some(door_id) }
    }

    /// Tags after applying the open/closed state of the linked door.
    pub fn resolve(self, is_open: impl Fn(u32) -> bool) -> Self {
        match self.door_id {
            Some(id) if is_open(id) => Self { sight: false, collision: false, ..self },
            _ => self,
        }
    }
}

// ============================================================================
// TRIANGLE MESH
// ============================================================================

/// Indexed triangle mesh in local space.
/// `normals` and `uvs` are either empty or one per position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriMesh {
    pub positions: Vec<Vec3>,
    #[serde(default)]
    pub normals: Vec<Vec3>,
    #[serde(default)]
    pub uvs: Vec<Vec2>,
    pub indices: Vec<u32>,
}

impl TriMesh {
    pub fn triangle_count(&self) -> usize { self.indices.len() / 3 }

    pub fn is_empty(&self) -> bool { self.indices.len() < 3 }

    /// Vertex indices of triangle `tri`.
    #[inline]
    pub fn triangle_indices(&self, tri: usize) -> [usize; 3] {
        let i = tri * 3;
        [
            self.indices[i] as usize,
            self.indices[i + 1] as usize,
            self.indices[i + 2] as usize,
        ]
    }

    #[inline]
    pub fn triangle(&self, tri: usize) -> [Vec3; 3] {
        let [a, b, c] = self.triangle_indices(tri);
        [self.positions[a], self.positions[b], self.positions[c]]
    }

    /// Rejects index buffers that point past the vertex arrays.
    /// Everything downstream indexes without bounds checks of its own.
    pub fn validate(&self) -> Result<(), SightError> {
        if self.indices.len() % 3 != 0 {
            return Err(SightError::InvalidMesh("index count is not a multiple of 3".into()));
        }
        let n = self.positions.len();
        if let Some(bad) = self.indices.iter().find(|&&i| i as usize >= n) {
            return Err(SightError::InvalidMesh(format!("index {bad} out of range for {n} vertices")));
        }
        if !self.normals.is_empty() && self.normals.len() != n {
            return Err(SightError::InvalidMesh("normal count does not match positions".into()));
        }
        if !self.uvs.is_empty() && self.uvs.len() != n {
            return Err(SightError::InvalidMesh("uv count does not match positions".into()));
        }
        Ok(())
    }

    /// Axis-aligned bounds of the positions after applying `transform`.
    pub fn bounds(&self, transform: Mat4) -> Option<(Vec3, Vec3)> {
        let mut it = self.positions.iter().map(|p| transform.transform_point3(*p));
        let first = it.next()?;
        Some(it.fold((first, first), |(lo, hi), p| (lo.min(p), hi.max(p))))
    }
}

// ============================================================================
// PARTS AND NODES
// ============================================================================

/// One renderable sub-part of a scene entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshPart {
    pub name: String,
    pub mesh: TriMesh,
    /// Transform from part space to entity space.
    pub local: Mat4,
    /// Explicit tags. `None` means the part inherits the entity-level flags.
    pub tags: Option<PartTags>,
    pub visible: bool,
    /// Helper volumes (selection boxes, bounds proxies) never take part in raycasts.
    pub bounding: bool,
    /// Per-instance transforms applied after `local`. Empty for a plain mesh.
    #[serde(default)]
    pub instances: Vec<Mat4>,
    /// World-space height above which hits on this part are discarded.
    #[serde(default)]
    pub clip_height: Option<f32>,
}

impl MeshPart {
    pub fn new(name: impl Into<String>, mesh: TriMesh) -> Self {
        Self {
            name: name.into(),
            mesh,
            local: Mat4::IDENTITY,
            tags: None,
            visible: true,
            bounding: false,
            instances: Vec::new(),
            clip_height: None,
        }
    }

    pub fn with_tags(mut self, tags: PartTags) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_local(mut self, local: Mat4) -> Self {
        self.local = local;
        self
    }

    pub fn with_instances(mut self, instances: Vec<Mat4>) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_clip_height(mut self, height: f32) -> Self {
        self.clip_height = Some(height);
        self
    }

    /// Parts that can ever be hit by a ray.
    pub fn is_raycastable(&self) -> bool {
        self.visible && !self.bounding && !self.mesh.is_empty()
    }

    /// Entity-space transforms this part is drawn with: `local` once, or
    /// `local * instance` for every instance.
    pub fn placements(&self) -> Vec<Mat4> {
        if self.instances.is_empty() {
            vec![self.local]
        } else {
            self.instances.iter().map(|inst| self.local * *inst).collect()
        }
    }
}

/// Full geometry of one scene entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshNode {
    pub parts: Vec<MeshPart>,
}

impl MeshNode {
    pub fn single(mesh: TriMesh) -> Self {
        Self { parts: vec![MeshPart::new("body", mesh)] }
    }

    pub fn from_parts(parts: Vec<MeshPart>) -> Self {
        Self { parts }
    }

    /// True when any part carries its own tags (a composite such as a door frame).
    pub fn has_tags(&self) -> bool {
        self.parts.iter().any(|p| p.tags.is_some())
    }

    /// World-space footprint of every raycastable part.
    pub fn bounds(&self, world: Mat4) -> Option<(Vec3, Vec3)> {
        self.parts
            .iter()
            .filter(|p| p.is_raycastable())
            .flat_map(|p| p.placements().into_iter().filter_map(|m| p.mesh.bounds(world * m)))
            .reduce(|(lo, hi), (l, h)| (lo.min(l), hi.max(h)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SightError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SightError> {
        let node: Self = serde_json::from_slice(bytes)?;
        for part in &node.parts {
            part.mesh.validate()?;
        }
        Ok(node)
    }
}

// ============================================================================
// POLY MESH
// ============================================================================

/// Polygon mesh with n-gon faces, used to author blockers before triangulation.
/// Faces use CCW winding when viewed from outside.
pub struct PolyMesh {
    pub positions: Vec<Vec3>,
    pub faces:     Vec<Vec<usize>>,  // each face = CCW-ordered vertex index list
}

impl PolyMesh {
    pub fn new() -> Self {
        Self {
            positions: Vec::new(),
            faces:     Vec::new(),
        }
    }

    /// Add a vertex and return its index.
    pub fn add_vertex(&mut self, pos: Vec3) -> usize {
        let idx = self.positions.len();
        self.positions.push(pos);
        idx
    }

    /// Add a face by vertex indices (CCW order).
    pub fn add_face(&mut self, indices: Vec<usize>) {
        debug_assert!(indices.len() >= 3, "Face must have at least 3 vertices");
        self.faces.push(indices);
    }

    pub fn vertex_count(&self) -> usize { self.positions.len() }
}

impl Default for PolyMesh {
    fn default() -> Self { Self::new() }
}

// ============================================================================
// TRIANGULATION
// ============================================================================

/// Fan-triangulate a PolyMesh into a TriMesh with area-weighted vertex normals.
/// UVs are a planar XZ projection, which is all the merged sight buffer needs.
pub fn triangulate(poly: &PolyMesh) -> TriMesh {
    let n_verts = poly.vertex_count();
    let mut normal_accum: Vec<Vec3> = vec![Vec3::ZERO; n_verts];
    let mut indices: Vec<u32> = Vec::new();

    for face in &poly.faces {
        let n = face.len();
        for i in 1..(n - 1) {
            let a = poly.positions[face[0]];
            let b = poly.positions[face[i]];
            let c = poly.positions[face[i + 1]];
            // Magnitude encodes 2×area, so larger faces weigh more
            let weighted_normal = (b - a).cross(c - a);
            normal_accum[face[0]]     += weighted_normal;
            normal_accum[face[i]]     += weighted_normal;
            normal_accum[face[i + 1]] += weighted_normal;

            indices.push(face[0]     as u32);
            indices.push(face[i]     as u32);
            indices.push(face[i + 1] as u32);
        }
    }

    TriMesh {
        positions: poly.positions.clone(),
        normals: normal_accum.iter().map(|n| n.normalize_or_zero()).collect(),
        uvs: poly.positions.iter().map(|p| Vec2::new(p.x, p.z)).collect(),
        indices,
    }
}

/// Axis-aligned box spanning `min..max`, CCW winding from outside.
///
/// Vertex layout:
///   0: (min.x, min.y, max.z)  front-bottom-left
///   1: (max.x, min.y, max.z)  front-bottom-right
///   2: (max.x, max.y, max.z)  front-top-right
///   3: (min.x, max.y, max.z)  front-top-left
///   4: (max.x, min.y, min.z)  back-bottom-right
///   5: (min.x, min.y, min.z)  back-bottom-left
///   6: (min.x, max.y, min.z)  back-top-left
///   7: (max.x, max.y, min.z)  back-top-right
pub fn cuboid(min: Vec3, max: Vec3) -> TriMesh {
    let mut mesh = PolyMesh::new();
    mesh.add_vertex(Vec3::new(min.x, min.y, max.z));
    mesh.add_vertex(Vec3::new(max.x, min.y, max.z));
    mesh.add_vertex(Vec3::new(max.x, max.y, max.z));
    mesh.add_vertex(Vec3::new(min.x, max.y, max.z));
    mesh.add_vertex(Vec3::new(max.x, min.y, min.z));
    mesh.add_vertex(Vec3::new(min.x, min.y, min.z));
    mesh.add_vertex(Vec3::new(min.x, max.y, min.z));
    mesh.add_vertex(Vec3::new(max.x, max.y, min.z));

    mesh.add_face(vec![0, 1, 2, 3]); // front  (+Z)
    mesh.add_face(vec![4, 5, 6, 7]); // back   (-Z)
    mesh.add_face(vec![5, 0, 3, 6]); // left   (-X)
    mesh.add_face(vec![1, 4, 7, 2]); // right  (+X)
    mesh.add_face(vec![3, 2, 7, 6]); // top    (+Y)
    mesh.add_face(vec![5, 4, 1, 0]); // bottom (-Y)

    triangulate(&mesh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cuboid_has_twelve_outward_triangles() {
        let mesh = cuboid(Vec3::splat(-1.0), Vec3::splat(1.0));
        assert_eq!(mesh.triangle_count(), 12);
        for tri in 0..mesh.triangle_count() {
            let [a, b, c] = mesh.triangle(tri);
            let normal = (b - a).cross(c - a);
            let centroid = (a + b + c) / 3.0;
            assert!(normal.dot(centroid) > 0.0, "triangle {tri} faces inward");
        }
    }

    #[test]
    fn door_tags_follow_open_state() {
        let tags = PartTags::door(7);
        let open = tags.resolve(|id| id == 7);
        assert!(!open.sight && !open.collision);
        let closed = tags.resolve(|_| false);
        assert!(closed.sight && closed.collision);
        assert_eq!(PartTags::solid().resolve(|_| true), PartTags::solid());
    }

    #[test]
    fn node_survives_wire_format() {
        let node = MeshNode::from_parts(vec![
            MeshPart::new("frame", cuboid(Vec3::ZERO, Vec3::ONE)),
            MeshPart::new("leaf", cuboid(Vec3::ZERO, Vec3::ONE)).with_tags(PartTags::door(1)),
        ]);
        let bytes = node.to_bytes().unwrap();
        assert_eq!(MeshNode::from_bytes(&bytes).unwrap(), node);
    }

    #[test]
    fn decode_rejects_garbage_and_bad_indices() {
        assert!(matches!(MeshNode::from_bytes(b"not json"), Err(SightError::MeshDecode(_))));

        let mut mesh = cuboid(Vec3::ZERO, Vec3::ONE);
        mesh.indices[0] = 99;
        let bytes = MeshNode::single(mesh).to_bytes().unwrap();
        assert!(matches!(MeshNode::from_bytes(&bytes), Err(SightError::InvalidMesh(_))));
    }

    #[test]
    fn bounds_skip_helper_parts() {
        let mut helper = MeshPart::new("bbox", cuboid(Vec3::splat(-50.0), Vec3::splat(50.0)));
        helper.bounding = true;
        let node = MeshNode::from_parts(vec![
            MeshPart::new("body", cuboid(Vec3::ZERO, Vec3::ONE)),
            helper,
        ]);
        let (lo, hi) = node.bounds(Mat4::from_translation(Vec3::X * 2.0)).unwrap();
        assert_eq!(lo, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(hi, Vec3::new(3.0, 1.0, 1.0));
    }
}
