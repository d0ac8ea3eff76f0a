// Background raycast worker.
// See engine/visibility.rs for the sampling it runs.
//
// Host side:   RaycastWorker owns the channels and thread, caches one
//              polygon per source, matches replies by request id.
// Worker side: WorkerState keeps a mirror of sight-blocking meshes plus one merged
//              world-space triangle buffer, rebuilt on a debounce.
//
// The worker is reached only through its message queue. Messages are handled
// in arrival order, so an add always lands in the mirror before a later
// raycast; the merged buffer may still lag by one debounce window.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use glam::{Mat4, Vec2, Vec3};

use super::bvh::{MeshBvh, Ray, TriangleHit};
use super::config::VisionConfig;
use super::debounce::Debouncer;
use super::error::SightError;
use super::mesh::{MeshNode, MeshPart, TriMesh};
use super::raycast::part_transforms;
use super::visibility::{Fan, PolygonConfig, SightCaster, SourceId};

// ============================================================================
// MESSAGES
// ============================================================================

#[derive(Debug, Clone)]
pub enum HostMessage {
    /// Register or replace the mesh of entity `id`.
    Add {
        id: u64,
        /// `MeshNode` wire bytes.
        mesh: Vec<u8>,
        /// Entity-to-world transform.
        transform: Mat4,
        /// Sight flag for parts without their own tags.
        sight: bool,
        has_tags: bool,
        open_doors: Vec<u32>,
    },
    Remove { id: u64 },
    Clear,
    Raycast { config: PolygonConfig, id: SourceId, request_id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Connected { greeting: String },
    /// The merged buffer was rebuilt; earlier polygons may be outdated.
    Refresh,
    MergedGeometry { triangles: usize },
    Polygon { points: Vec<Vec2>, elapsed: Duration, id: SourceId, request_id: u64 },
    Error { detail: String },
}

// ============================================================================
// MERGED GEOMETRY
// ============================================================================

/// Interleaved vertex of the merged buffer. Only position, uv and normal survive the merge.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MergedVertex {
    pub position: [f32; 3],
    pub uv:       [f32; 2],
    pub normal:   [f32; 3],
}

/// Merged vertices plus the clip height of the part each triangle came from.
#[derive(Default)]
struct Soup {
    vertices: Vec<MergedVertex>,
    clip_heights: Vec<Option<f32>>,
}

/// Union of all sight-blocking geometry in world space, as an unindexed triangle soup.
/// Replaced wholesale on every rebuild.
pub struct MergedGeometry {
    vertices: Vec<MergedVertex>,
    /// One entry per triangle.
    clip_heights: Vec<Option<f32>>,
    mesh: TriMesh,
    bvh: MeshBvh,
}

impl MergedGeometry {
    pub fn empty() -> Self {
        Self::from_soup(Soup::default())
    }

    fn from_soup(soup: Soup) -> Self {
        let Soup { vertices, clip_heights } = soup;
        let mesh = TriMesh {
            positions: vertices.iter().map(|v| Vec3::from_array(v.position)).collect(),
            normals: Vec::new(),
            uvs: Vec::new(),
            indices: (0..vertices.len() as u32).collect(),
        };
        let bvh = MeshBvh::build(&mesh);
        Self { vertices, clip_heights, mesh, bvh }
    }

    pub fn triangle_count(&self) -> usize { self.vertices.len() / 3 }

    pub fn vertices(&self) -> &[MergedVertex] { &self.vertices }

    pub fn clip_height(&self, triangle: usize) -> Option<f32> {
        self.clip_heights.get(triangle).copied().flatten()
    }

    /// Raw bytes of the vertex buffer.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Sight caster over the buffer that drops hits closer than `near`,
    /// or above the clip height of the triangle they land on.
    pub fn caster(&self, near: f32) -> MergedCaster<'_> {
        MergedCaster { geometry: self, near }
    }
}

pub struct MergedCaster<'a> {
    geometry: &'a MergedGeometry,
    near: f32,
}

impl MergedCaster<'_> {
    // same rule as ClipFilter: a clip height replaces the near plane
    fn keep(&self, hit: &TriangleHit, point: Vec3) -> bool {
        match self.geometry.clip_height(hit.triangle) {
            Some(height) => point.y <= height,
            None => hit.t >= self.near,
        }
    }
}

impl SightCaster for MergedCaster<'_> {
    fn cast_sight(&mut self, origin: Vec3, dir: Vec3, far: f32) -> Option<Vec3> {
        let MergedGeometry { mesh, bvh, .. } = self.geometry;
        let ray = Ray::new(origin, dir);
        let kept = match bvh.intersect_nearest(mesh, &ray, far) {
            Some(hit) if self.keep(&hit, ray.at(hit.t)) => Some(hit),
            Some(_) => bvh
                .intersect_all(mesh, &ray, far)
                .into_iter()
                .find(|hit| self.keep(hit, ray.at(hit.t))),
            None => None,
        };
        kept.map(|hit| ray.at(hit.t))
    }
}

/// Append `part` placed by `world` to the soup, one copy per instance.
fn append_part(soup: &mut Soup, world: Mat4, part: &MeshPart) {
    let mesh = &part.mesh;
    for m in part_transforms(world, part) {
        let normal_matrix = m.inverse().transpose();
        for tri in 0..mesh.triangle_count() {
            soup.clip_heights.push(part.clip_height);
            let idx = mesh.triangle_indices(tri);
            let [a, b, c] = idx.map(|i| m.transform_point3(mesh.positions[i]));
            let face_normal = (b - a).cross(c - a).normalize_or_zero();
            for (corner, i) in [a, b, c].into_iter().zip(idx) {
                let normal = mesh
                    .normals
                    .get(i)
                    .map(|n| normal_matrix.transform_vector3(*n).normalize_or_zero())
                    .unwrap_or(face_normal);
                soup.vertices.push(MergedVertex {
                    position: corner.to_array(),
                    uv: mesh.uvs.get(i).copied().unwrap_or(Vec2::ZERO).to_array(),
                    normal: normal.to_array(),
                });
            }
        }
    }
}

// ============================================================================
// WORKER STATE
// ============================================================================

/// Sight-blocking parts of one mirrored entity.
struct MirroredMesh {
    parts: Vec<MeshPart>,
    transform: Mat4,
}

/// Message handler of the worker thread. Pure state, no I/O.
pub struct WorkerState {
    resolution: u32,
    near: f32,
    splits: Option<u32>,
    mirror: BTreeMap<u64, MirroredMesh>,
    merged: MergedGeometry,
    debounce: Debouncer,
}

impl WorkerState {
    pub fn new(config: &VisionConfig) -> Self {
        Self {
            resolution: config.resolution,
            near: config.near_distance,
            splits: (config.time_slicing && config.splits > 1).then_some(config.splits),
            mirror: BTreeMap::new(),
            merged: MergedGeometry::empty(),
            debounce: Debouncer::new(config.merge_debounce()),
        }
    }

    pub fn merged(&self) -> &MergedGeometry { &self.merged }

    pub fn mirrored_count(&self) -> usize { self.mirror.len() }

    pub fn merge_pending(&self) -> bool { self.debounce.is_armed() }

    pub fn time_until_merge(&self, now: Instant) -> Option<Duration> {
        self.debounce.time_until_due(now)
    }

    pub fn handle(&mut self, msg: HostMessage, now: Instant) -> Vec<WorkerMessage> {
        match msg {
            HostMessage::Add { id, mesh, transform, sight, has_tags, open_doors } => {
                let node = match MeshNode::from_bytes(&mesh) {
                    Ok(node) => node,
                    Err(e) => {
                        return vec![WorkerMessage::Error {
                            detail: format!("mesh {id} rejected: {e}"),
                        }];
                    }
                };
                let parts: Vec<MeshPart> = node
                    .parts
                    .into_iter()
                    .filter(|p| p.is_raycastable())
                    .filter(|p| match p.tags.filter(|_| has_tags) {
                        Some(tags) => tags.resolve(|d| open_doors.contains(&d)).sight,
                        None => sight,
                    })
                    .collect();
                self.mirror.insert(id, MirroredMesh { parts, transform });
                self.debounce.arm(now);
                Vec::new()
            }
            HostMessage::Remove { id } => {
                if self.mirror.remove(&id).is_some() {
                    self.debounce.arm(now);
                }
                Vec::new()
            }
            HostMessage::Clear => {
                self.mirror.clear();
                self.merged = MergedGeometry::empty();
                self.debounce.cancel();
                vec![WorkerMessage::Refresh, WorkerMessage::MergedGeometry { triangles: 0 }]
            }
            HostMessage::Raycast { config, id, request_id } => {
                let started = Instant::now();
                let fan = Fan::new(&config, self.resolution, self.splits);
                let mut caster = self.merged.caster(self.near);
                let batch = fan.sample(0..fan.len(), &mut caster, Duration::MAX);
                vec![WorkerMessage::Polygon {
                    points: fan.finish(batch.points),
                    elapsed: started.elapsed(),
                    id,
                    request_id,
                }]
            }
        }
    }

    /// Run the merge if its debounce window has passed.
    pub fn poll(&mut self, now: Instant) -> Vec<WorkerMessage> {
        if self.debounce.take_due(now) {
            self.rebuild()
        } else {
            Vec::new()
        }
    }

    /// Run a pending merge immediately.
    pub fn flush(&mut self) -> Vec<WorkerMessage> {
        if self.debounce.is_armed() {
            self.debounce.cancel();
            self.rebuild()
        } else {
            Vec::new()
        }
    }

    fn rebuild(&mut self) -> Vec<WorkerMessage> {
        let started = Instant::now();
        let mut soup = Soup::default();
        for entry in self.mirror.values() {
            for part in &entry.parts {
                append_part(&mut soup, entry.transform, part);
            }
        }
        self.merged = MergedGeometry::from_soup(soup);
        let triangles = self.merged.triangle_count();
        log::debug!(
            "merged {} meshes into {} triangles in {:.2} ms",
            self.mirror.len(),
            triangles,
            started.elapsed().as_secs_f32() * 1000.0
        );
        vec![WorkerMessage::Refresh, WorkerMessage::MergedGeometry { triangles }]
    }
}

fn run_worker(mut state: WorkerState, inbox: Receiver<HostMessage>, outbox: Sender<WorkerMessage>) {
    let greeting = WorkerMessage::Connected { greeting: "sight worker ready".to_string() };
    if outbox.send(greeting).is_err() {
        return;
    }
    loop {
        for reply in state.poll(Instant::now()) {
            if outbox.send(reply).is_err() {
                return;
            }
        }
        let msg = match state.time_until_merge(Instant::now()) {
            Some(wait) => match inbox.recv_timeout(wait) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match inbox.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            },
        };
        for reply in state.handle(msg, Instant::now()) {
            if outbox.send(reply).is_err() {
                return;
            }
        }
    }
    log::debug!("sight worker inbox closed, exiting");
}

// ============================================================================
// HOST HANDLE
// ============================================================================

/// Latest accepted worker polygon for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPolygon {
    pub points: Vec<Vec2>,
    pub elapsed: Duration,
    pub request_id: u64,
    pub config: PolygonConfig,
    /// Geometry epoch the request was issued in.
    pub epoch: u64,
}

struct PendingRequest {
    source: SourceId,
    config: PolygonConfig,
    epoch: u64,
}

pub struct RaycastWorker {
    outbox: Option<Sender<HostMessage>>,
    inbox: Receiver<WorkerMessage>,
    thread: Option<JoinHandle<()>>,
    alive: bool,
    connected: bool,
    next_request_id: u64,
    pending: HashMap<u64, PendingRequest>,
    responses: HashMap<SourceId, WorkerPolygon>,
    /// Bumped on every Refresh; responses from older epochs are stale.
    geometry_epoch: u64,
    merged_triangles: usize,
}

impl RaycastWorker {
    pub fn spawn(config: &VisionConfig) -> Result<Self, SightError> {
        let (host_tx, worker_rx) = mpsc::channel();
        let (worker_tx, host_rx) = mpsc::channel();
        let state = WorkerState::new(config);
        let thread = std::thread::Builder::new()
            .name("sight-worker".to_string())
            .spawn(move || run_worker(state, worker_rx, worker_tx))?;
        log::info!("sight worker started");
        Ok(Self {
            outbox: Some(host_tx),
            inbox: host_rx,
            thread: Some(thread),
            alive: true,
            connected: false,
            next_request_id: 1,
            pending: HashMap::new(),
            responses: HashMap::new(),
            geometry_epoch: 0,
            merged_triangles: 0,
        })
    }

    pub fn is_alive(&self) -> bool { self.alive }

    pub fn is_connected(&self) -> bool { self.connected }

    pub fn geometry_epoch(&self) -> u64 { self.geometry_epoch }

    pub fn merged_triangles(&self) -> usize { self.merged_triangles }

    pub fn send(&mut self, msg: HostMessage) -> Result<(), SightError> {
        let sent = self.outbox.as_ref().is_some_and(|tx| tx.send(msg).is_ok());
        if sent {
            Ok(())
        } else {
            self.mark_dead();
            Err(SightError::WorkerDisconnected)
        }
    }

    pub fn add(
        &mut self,
        id: u64,
        node: &MeshNode,
        transform: Mat4,
        sight: bool,
        open_doors: Vec<u32>,
    ) -> Result<(), SightError> {
        let mesh = node.to_bytes()?;
        self.send(HostMessage::Add { id, mesh, transform, sight, has_tags: node.has_tags(), open_doors })
    }

    pub fn remove(&mut self, id: u64) -> Result<(), SightError> {
        self.send(HostMessage::Remove { id })
    }

    pub fn clear(&mut self) -> Result<(), SightError> {
        self.send(HostMessage::Clear)
    }

    /// Ask for a polygon. Returns the request id the reply will carry.
    pub fn request(&mut self, source: SourceId, config: &PolygonConfig) -> Result<u64, SightError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.send(HostMessage::Raycast { config: *config, id: source, request_id })?;
        self.pending.insert(
            request_id,
            PendingRequest { source, config: *config, epoch: self.geometry_epoch },
        );
        Ok(request_id)
    }

    /// True when nothing for `source` is in flight and no current-epoch reply
    /// for `config` is cached. A source has at most one request queued at a
    /// time whatever its config; a moving source asks again once the reply lands.
    pub fn needs_request(&self, source: SourceId, config: &PolygonConfig) -> bool {
        if self.pending.values().any(|p| p.source == source) {
            return false;
        }
        !self
            .responses
            .get(&source)
            .is_some_and(|r| r.config == *config && r.epoch == self.geometry_epoch)
    }

    /// Requests sent and not yet answered.
    pub fn in_flight(&self) -> usize { self.pending.len() }

    pub fn latest(&self, source: SourceId) -> Option<&WorkerPolygon> {
        self.responses.get(&source)
    }

    pub fn forget(&mut self, source: SourceId) {
        self.responses.remove(&source);
        self.pending.retain(|_, p| p.source != source);
    }

    /// Drain every reply that has arrived. Never blocks.
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        loop {
            match self.inbox.try_recv() {
                Ok(msg) => {
                    self.handle_message(msg);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.mark_dead();
                    break;
                }
            }
        }
        handled
    }

    /// Block until the reply to `request_id` arrives or `timeout` passes.
    pub fn wait_for_response(&mut self, request_id: u64, timeout: Duration) -> bool {
        self.pump_until(timeout, |msg| {
            matches!(msg, WorkerMessage::Polygon { request_id: r, .. } if *r == request_id)
        })
    }

    /// Block until the next merge completes or `timeout` passes.
    pub fn wait_for_merge(&mut self, timeout: Duration) -> bool {
        self.pump_until(timeout, |msg| matches!(msg, WorkerMessage::MergedGeometry { .. }))
    }

    fn pump_until(&mut self, timeout: Duration, done: impl Fn(&WorkerMessage) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.inbox.recv_timeout(left) {
                Ok(msg) => {
                    let finished = done(&msg);
                    self.handle_message(msg);
                    if finished {
                        return true;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => {
                    self.mark_dead();
                    return false;
                }
            }
        }
    }

    fn handle_message(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Connected { greeting } => {
                log::info!("sight worker connected: {}", greeting);
                self.connected = true;
            }
            WorkerMessage::Refresh => {
                self.geometry_epoch += 1;
            }
            WorkerMessage::MergedGeometry { triangles } => {
                log::debug!("sight worker merged geometry: {} triangles", triangles);
                self.merged_triangles = triangles;
            }
            WorkerMessage::Polygon { points, elapsed, id, request_id } => {
                let Some(pending) = self.pending.remove(&request_id) else {
                    // source was forgotten while the request was in flight
                    return;
                };
                let newer = self.responses.get(&id).map_or(true, |r| r.request_id < request_id);
                if newer {
                    self.responses.insert(
                        id,
                        WorkerPolygon {
                            points,
                            elapsed,
                            request_id,
                            config: pending.config,
                            epoch: pending.epoch,
                        },
                    );
                }
            }
            WorkerMessage::Error { detail } => {
                log::warn!("sight worker error: {}", detail);
            }
        }
    }

    /// End the worker thread as a crash would, leaving the host side in place.
    #[cfg(test)]
    pub(crate) fn stop_thread(&mut self) {
        let (dead, _) = mpsc::channel();
        // swapping out the live sender closes the worker's inbox
        self.outbox = Some(dead);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn mark_dead(&mut self) {
        if self.alive {
            log::warn!("sight worker disconnected; falling back to local raycasting");
        }
        self.alive = false;
    }
}

impl Drop for RaycastWorker {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        self.outbox.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("sight worker panicked");
            }
        }
    }
}
