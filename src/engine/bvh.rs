// Bounding volume hierarchy over the triangles of a TriMesh.
//
// Nodes are stored flat in a Vec and reference a reordered triangle index
// array; the mesh itself is never copied or mutated. Built once per mesh
// revision and queried many times per frame.

use glam::Vec3;

use super::mesh::TriMesh;

/// Triangles per leaf before a node is split.
const MAX_LEAF_SIZE: usize = 4;
const EPSILON: f32 = 1e-7;
const EDGE_DEDUP: f32 = 1e-5;

// ============================================================================
// RAY + AABB
// ============================================================================

/// A ray with an arbitrary (not necessarily unit) direction.
/// Hit distances are expressed in multiples of `dir`.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vec3,
    pub dir: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, dir: Vec3) -> Self {
        Self { origin, dir }
    }

    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.dir * t
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Self = Self { min: Vec3::INFINITY, max: Vec3::NEG_INFINITY };

    pub fn from_triangle(tri: [Vec3; 3]) -> Self {
        Self {
            min: tri[0].min(tri[1]).min(tri[2]),
            max: tri[0].max(tri[1]).max(tri[2]),
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self { min: self.min.min(other.min), max: self.max.max(other.max) }
    }

    pub fn center(&self) -> Vec3 { (self.min + self.max) * 0.5 }

    /// Slab test. Returns the entry distance if the ray reaches the box before `far`.
    #[inline]
    pub fn ray_entry(&self, ray: &Ray, inv_dir: Vec3, far: f32) -> Option<f32> {
        // 0 * inf is NaN when the origin lies on a slab plane of an axis the
        // ray does not move along; such a ray is inside that slab
        let t1 = (self.min - ray.origin) * inv_dir;
        let t1 = Vec3::select(t1.is_nan_mask(), Vec3::NEG_INFINITY, t1);
        let t2 = (self.max - ray.origin) * inv_dir;
        let t2 = Vec3::select(t2.is_nan_mask(), Vec3::INFINITY, t2);
        let t_near = t1.min(t2).max_element().max(0.0);
        let t_far = t1.max(t2).min_element().min(far);
        (t_near <= t_far).then_some(t_near)
    }
}

// ============================================================================
// TRIANGLE TEST
// ============================================================================

/// Intersection of a ray with one triangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleHit {
    /// Distance along the ray in multiples of `ray.dir`.
    pub t: f32,
    /// Index of the triangle in the source mesh.
    pub triangle: usize,
    /// Geometric normal, facing the ray origin.
    pub normal: Vec3,
}

/// Möller–Trumbore, double-sided.
#[inline]
pub fn intersect_triangle(ray: &Ray, tri: [Vec3; 3]) -> Option<(f32, Vec3)> {
    let e1 = tri[1] - tri[0];
    let e2 = tri[2] - tri[0];
    let p = ray.dir.cross(e2);
    let det = e1.dot(p);
    if det.abs() < EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = ray.origin - tri[0];
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = ray.dir.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    if t < 0.0 {
        return None;
    }
    let n = e1.cross(e2).normalize_or_zero();
    let normal = if n.dot(ray.dir) > 0.0 { -n } else { n };
    Some((t, normal))
}

// ============================================================================
// BVH
// ============================================================================

#[derive(Debug, Clone)]
enum BvhNode {
    Leaf { bounds: Aabb, first: usize, count: usize },
    Internal { bounds: Aabb, left: usize, right: usize },
}

impl BvhNode {
    fn bounds(&self) -> &Aabb {
        match self {
            BvhNode::Leaf { bounds, .. } | BvhNode::Internal { bounds, .. } => bounds,
        }
    }
}

/// BVH over one mesh's triangles. Holds indices only; pass the same mesh to queries.
#[derive(Debug, Clone)]
pub struct MeshBvh {
    nodes: Vec<BvhNode>,
    indices: Vec<usize>,
}

impl MeshBvh {
    pub fn build(mesh: &TriMesh) -> Self {
        let n = mesh.triangle_count();
        if n == 0 {
            return Self { nodes: Vec::new(), indices: Vec::new() };
        }

        let boxes: Vec<Aabb> = (0..n).map(|i| Aabb::from_triangle(mesh.triangle(i))).collect();
        let mut indices: Vec<usize> = (0..n).collect();
        let mut nodes = Vec::with_capacity(2 * n / MAX_LEAF_SIZE + 1);
        build_recursive(&boxes, &mut indices, 0, n, &mut nodes);
        Self { nodes, indices }
    }

    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    pub fn triangle_count(&self) -> usize { self.indices.len() }

    pub fn bounds(&self) -> Option<Aabb> {
        self.nodes.first().map(|n| *n.bounds())
    }

    /// Nearest triangle hit within `far`.
    pub fn intersect_nearest(&self, mesh: &TriMesh, ray: &Ray, far: f32) -> Option<TriangleHit> {
        let mut best: Option<TriangleHit> = None;
        self.traverse(mesh, ray, far, &mut |hit| {
            if best.map_or(true, |b| hit.t < b.t) {
                best = Some(hit);
            }
            // shrink the search interval to the current best
            hit.t
        });
        best
    }

    /// Every triangle hit within `far`, sorted by ascending distance.
    pub fn intersect_all(&self, mesh: &TriMesh, ray: &Ray, far: f32) -> Vec<TriangleHit> {
        let mut hits = Vec::new();
        self.traverse(mesh, ray, far, &mut |hit| {
            hits.push(hit);
            far
        });
        hits.sort_by(|a, b| a.t.total_cmp(&b.t));
        // a ray through a shared edge reports both triangles
        hits.dedup_by(|a, b| (a.t - b.t).abs() <= EDGE_DEDUP);
        hits
    }

    // `visit` returns the new far limit for the remaining traversal.
    fn traverse(
        &self,
        mesh: &TriMesh,
        ray: &Ray,
        far: f32,
        visit: &mut dyn FnMut(TriangleHit) -> f32,
    ) {
        if self.nodes.is_empty() || ray.dir == Vec3::ZERO {
            return;
        }
        let inv_dir = ray.dir.recip();
        let mut far = far;
        let mut stack: Vec<usize> = Vec::with_capacity(64);
        stack.push(0);

        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if node.bounds().ray_entry(ray, inv_dir, far).is_none() {
                continue;
            }
            match node {
                BvhNode::Leaf { first, count, .. } => {
                    for &tri in &self.indices[*first..*first + *count] {
                        if let Some((t, normal)) = intersect_triangle(ray, mesh.triangle(tri)) {
                            if t <= far {
                                far = visit(TriangleHit { t, triangle: tri, normal });
                            }
                        }
                    }
                }
                BvhNode::Internal { left, right, .. } => {
                    // Push the farther child first so the closer one is popped next
                    let dl = self.nodes[*left].bounds().ray_entry(ray, inv_dir, far);
                    let dr = self.nodes[*right].bounds().ray_entry(ray, inv_dir, far);
                    match (dl, dr) {
                        (Some(l), Some(r)) if l <= r => {
                            stack.push(*right);
                            stack.push(*left);
                        }
                        (Some(_), Some(_)) => {
                            stack.push(*left);
                            stack.push(*right);
                        }
                        (Some(_), None) => stack.push(*left),
                        (None, Some(_)) => stack.push(*right),
                        (None, None) => {}
                    }
                }
            }
        }
    }
}

/// Builds the subtree over `indices[start..end]`, returning its node index.
fn build_recursive(
    boxes: &[Aabb],
    indices: &mut [usize],
    start: usize,
    end: usize,
    nodes: &mut Vec<BvhNode>,
) -> usize {
    let count = end - start;
    let bounds = indices[start..end]
        .iter()
        .fold(Aabb::EMPTY, |acc, &i| acc.union(boxes[i]));

    if count <= MAX_LEAF_SIZE {
        let node_idx = nodes.len();
        nodes.push(BvhNode::Leaf { bounds, first: start, count });
        return node_idx;
    }

    // Split at the median centroid along the widest centroid axis
    let centroid_bounds = indices[start..end].iter().fold(Aabb::EMPTY, |acc, &i| {
        let c = boxes[i].center();
        acc.union(Aabb { min: c, max: c })
    });
    let extent = centroid_bounds.max - centroid_bounds.min;
    let axis = if extent.x >= extent.y && extent.x >= extent.z {
        0
    } else if extent.y >= extent.z {
        1
    } else {
        2
    };

    let mid = start + count / 2;
    indices[start..end].select_nth_unstable_by(count / 2, |&a, &b| {
        boxes[a].center()[axis].total_cmp(&boxes[b].center()[axis])
    });

    let node_idx = nodes.len();
    nodes.push(BvhNode::Internal { bounds, left: 0, right: 0 });

    let left = build_recursive(boxes, indices, start, mid, nodes);
    let right = build_recursive(boxes, indices, mid, end, nodes);
    nodes[node_idx] = BvhNode::Internal { bounds, left, right };

    node_idx
}
