// Polygon dispatch: serves visibility polygons from the background worker when
// it is enabled and alive, otherwise from the local time-sliced computer.
// Callers get a VisibilityPolygon either way.

use std::time::Instant;

use bevy_ecs::entity::Entity;
use glam::Mat4;

use super::config::VisionConfig;
use super::mesh::MeshNode;
use super::visibility::{
    PolygonConfig, SightCaster, SourceId, VisibilityPolygon, VisibilityPolygonComputer,
};
use super::worker::RaycastWorker;

pub struct VisionService {
    local: VisibilityPolygonComputer,
    worker: Option<RaycastWorker>,
}

impl VisionService {
    pub fn new(config: VisionConfig) -> Self {
        let worker = if config.use_worker {
            match RaycastWorker::spawn(&config) {
                Ok(worker) => Some(worker),
                Err(e) => {
                    log::warn!("could not start sight worker, raycasting locally: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self { local: VisibilityPolygonComputer::new(config), worker }
    }

    pub fn computer(&self) -> &VisibilityPolygonComputer { &self.local }

    pub fn computer_mut(&mut self) -> &mut VisibilityPolygonComputer { &mut self.local }

    pub fn worker(&self) -> Option<&RaycastWorker> { self.worker.as_ref() }

    pub fn worker_mut(&mut self) -> Option<&mut RaycastWorker> { self.worker.as_mut() }

    /// True while polygons are served by a live worker.
    pub fn uses_worker(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.is_alive())
    }

    /// Most recent polygon for `source`. The worker path falls back to the
    /// local computer until the first reply for the source arrives.
    pub fn polygon(
        &mut self,
        source: SourceId,
        params: &PolygonConfig,
        caster: &mut dyn SightCaster,
        now: Instant,
    ) -> VisibilityPolygon {
        if let Some(worker) = self.worker.as_mut().filter(|w| w.is_alive()) {
            worker.poll();
            if worker.needs_request(source, params) {
                if let Err(e) = worker.request(source, params) {
                    log::debug!("polygon request for source {} not sent: {}", source, e);
                }
            }
            if let Some(reply) = worker.latest(source) {
                return VisibilityPolygon::new(&reply.config, reply.points.clone(), reply.request_id, 0);
            }
        }
        self.local.compute(source, params, caster, now)
    }

    /// Geometry changed; local states recompute in full on their next call.
    pub fn invalidate(&mut self) {
        self.local.invalidate_all();
    }

    pub fn forget_source(&mut self, source: SourceId) {
        self.local.forget(source);
        if let Some(worker) = self.worker.as_mut() {
            worker.forget(source);
        }
    }

    /// Mirror an entity's sight geometry into the worker.
    pub fn sync_add(
        &mut self,
        entity: Entity,
        node: &MeshNode,
        transform: Mat4,
        sight: bool,
        open_doors: Vec<u32>,
    ) {
        if let Some(worker) = self.worker.as_mut().filter(|w| w.is_alive()) {
            if let Err(e) = worker.add(entity.to_bits(), node, transform, sight, open_doors) {
                log::warn!("could not mirror {:?} into sight worker: {}", entity, e);
            }
        }
    }

    pub fn sync_remove(&mut self, entity: Entity) {
        if let Some(worker) = self.worker.as_mut().filter(|w| w.is_alive()) {
            // a send failure marks the worker dead; nothing else to undo
            let _ = worker.remove(entity.to_bits());
        }
    }

    pub fn sync_clear(&mut self) {
        if let Some(worker) = self.worker.as_mut().filter(|w| w.is_alive()) {
            let _ = worker.clear();
        }
    }
}
