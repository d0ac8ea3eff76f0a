// Visibility polygons: an angular fan of sight rays from a source,
// with optional time-slicing across frames.
//
// Full recompute:   every sample in one call.
// Time-sliced:      one split (1/splits of the samples) per call; the polygon
//                   is swapped in once the last split lands. Until then the
//                   previous complete polygon is returned.
//
// Samples that run past the per-batch wall-clock budget are not raycast; they
// take the unobstructed point and are marked tentative. Splits holding
// tentative samples are scheduled first in the next cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::f32::consts::TAU;
use std::ops::Range;
use std::time::{Duration, Instant};

use glam::{Vec2, Vec3};

use super::config::VisionConfig;
use super::raycast::{BvhRaycaster, RaycastQuery};
use super::scene_index::SceneObject;

/// Stable id of a vision or light source.
pub type SourceId = u64;

// ============================================================================
// SOURCE PARAMETERS + RESULT
// ============================================================================

/// Geometry of one visibility source. Angles are in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolygonConfig {
    /// Source position on the XZ plane.
    pub origin: Vec2,
    pub rotation: f32,
    pub angle: f32,
    pub has_limited_angle: bool,
    pub radius: f32,
    /// World height sight rays are cast at.
    pub elevation: f32,
}

impl PolygonConfig {
    /// Full 360° source.
    pub fn omni(origin: Vec2, radius: f32, elevation: f32) -> Self {
        Self {
            origin,
            rotation: 0.0,
            angle: 360.0,
            has_limited_angle: false,
            radius,
            elevation,
        }
    }

    /// Cone of `angle` degrees centred on `rotation`.
    pub fn cone(origin: Vec2, radius: f32, elevation: f32, rotation: f32, angle: f32) -> Self {
        Self {
            origin,
            rotation,
            angle,
            has_limited_angle: true,
            radius,
            elevation,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityPolygon {
    /// Points in sample order; a limited fan ends with the origin.
    pub points: Vec<Vec2>,
    pub origin: Vec2,
    pub radius: f32,
    pub rotation: f32,
    pub angle: f32,
    pub has_limited_angle: bool,
    /// Changes every time a new polygon is assembled.
    pub cache_id: u64,
    /// Points that were not raycast because the batch ran out of budget.
    pub tentative: usize,
}

impl VisibilityPolygon {
    pub fn new(config: &PolygonConfig, points: Vec<Vec2>, cache_id: u64, tentative: usize) -> Self {
        Self {
            points,
            origin: config.origin,
            radius: config.radius,
            rotation: config.rotation,
            angle: config.angle,
            has_limited_angle: config.has_limited_angle,
            cache_id,
            tentative,
        }
    }
}

// ============================================================================
// SIGHT CASTER
// ============================================================================

/// Source of sight-blocking hits for the sampler.
pub trait SightCaster {
    /// Nearest blocking hit along unit `dir` within `far`, if any.
    fn cast_sight(&mut self, origin: Vec3, dir: Vec3, far: f32) -> Option<Vec3>;
}

/// Casts against an object set through a [`BvhRaycaster`].
pub struct SetCaster<'a> {
    raycaster: &'a mut BvhRaycaster,
    objects: &'a [SceneObject],
}

impl<'a> SetCaster<'a> {
    pub fn new(raycaster: &'a mut BvhRaycaster, objects: &'a [SceneObject]) -> Self {
        Self { raycaster, objects }
    }
}

impl SightCaster for SetCaster<'_> {
    fn cast_sight(&mut self, origin: Vec3, dir: Vec3, far: f32) -> Option<Vec3> {
        self.raycaster
            .cast(&RaycastQuery::nearest(origin, dir, far), self.objects)
            .first()
            .map(|hit| hit.point)
    }
}

// ============================================================================
// FAN SAMPLING
// ============================================================================

/// Samples of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub points: Vec<Vec2>,
    /// Offset of the first sample that skipped raycasting. Everything after
    /// it was skipped too, since elapsed time only grows.
    pub degraded_from: Option<usize>,
}

impl Batch {
    pub fn tentative(&self) -> usize {
        self.degraded_from.map_or(0, |i| self.points.len() - i)
    }
}

/// Angular layout of a source's samples.
#[derive(Debug, Clone, Copy)]
pub struct Fan {
    a_min: f32,
    step: f32,
    count: usize,
    origin: Vec2,
    elevation: f32,
    radius: f32,
    limited: bool,
}

impl Fan {
    /// `splits` rounds the sample count up to a multiple of it.
    pub fn new(config: &PolygonConfig, resolution: u32, splits: Option<u32>) -> Self {
        let a_min = (config.rotation + 90.0 - config.angle / 2.0).to_radians().rem_euclid(TAU);
        let span = if config.has_limited_angle {
            config.angle.clamp(0.0, 360.0).to_radians()
        } else {
            TAU
        };
        let min_count = if config.has_limited_angle { 2 } else { 3 };
        let mut count = ((resolution as f32 * span / TAU).ceil() as usize).max(min_count);
        if let Some(s) = splits.filter(|s| *s > 0) {
            count = count.div_ceil(s as usize) * s as usize;
        }
        // a limited fan includes both edges; a full circle must not repeat its start
        let step = if config.has_limited_angle {
            span / (count - 1) as f32
        } else {
            TAU / count as f32
        };
        Self {
            a_min,
            step,
            count,
            origin: config.origin,
            elevation: config.elevation,
            radius: config.radius,
            limited: config.has_limited_angle,
        }
    }

    pub fn len(&self) -> usize { self.count }

    pub fn is_empty(&self) -> bool { self.count == 0 }

    pub fn angle(&self, i: usize) -> f32 {
        self.a_min + self.step * i as f32
    }

    /// Sample indices belonging to `split` of `splits`.
    pub fn split_range(&self, split: usize, splits: usize) -> Range<usize> {
        (split * self.count / splits)..((split + 1) * self.count / splits)
    }

    /// Raycast the samples in `range`. Once `budget` has elapsed the rest of
    /// the batch uses unobstructed points.
    pub fn sample(&self, range: Range<usize>, caster: &mut dyn SightCaster, budget: Duration) -> Batch {
        let started = Instant::now();
        let origin3 = Vec3::new(self.origin.x, self.elevation, self.origin.y);
        let mut batch = Batch { points: Vec::with_capacity(range.len()), degraded_from: None };

        for (offset, i) in range.enumerate() {
            let a = self.angle(i);
            let dir = Vec2::new(a.cos(), a.sin());
            let free = self.origin + dir * self.radius;

            if batch.degraded_from.is_none() && started.elapsed() >= budget {
                batch.degraded_from = Some(offset);
            }
            if batch.degraded_from.is_some() {
                batch.points.push(free);
                continue;
            }

            let point = caster
                .cast_sight(origin3, Vec3::new(dir.x, 0.0, dir.y), self.radius)
                .map_or(free, |hit| Vec2::new(hit.x, hit.z));
            batch.points.push(point);
        }
        batch
    }

    /// Close the point list: a limited fan gets the origin appended.
    pub fn finish(&self, mut points: Vec<Vec2>) -> Vec<Vec2> {
        if self.limited {
            points.push(self.origin);
        }
        points
    }
}

// ============================================================================
// COMPUTATION STATE
// ============================================================================

/// Per-source progress of a time-sliced recompute.
#[derive(Debug, Clone)]
pub struct PolygonComputationState {
    params: PolygonConfig,
    /// Position within `order` of the next split to process.
    split: usize,
    order: Vec<usize>,
    batches: BTreeMap<usize, Batch>,
    last_compute: Instant,
    complete: bool,
    stale: bool,
    tentative_splits: BTreeSet<usize>,
    polygon: VisibilityPolygon,
}

impl PolygonComputationState {
    pub fn split(&self) -> usize { self.split }

    pub fn is_complete(&self) -> bool { self.complete }

    pub fn cache_id(&self) -> u64 { self.polygon.cache_id }

    pub fn last_compute(&self) -> Instant { self.last_compute }

    pub fn polygon(&self) -> &VisibilityPolygon { &self.polygon }

    /// Split indices stored in the current cycle, ascending.
    pub fn completed_splits(&self) -> Vec<usize> {
        self.batches.keys().copied().collect()
    }

    /// Splits whose last computed samples are tentative.
    pub fn tentative_splits(&self) -> Vec<usize> {
        self.tentative_splits.iter().copied().collect()
    }
}

// ============================================================================
// COMPUTER
// ============================================================================

pub struct VisibilityPolygonComputer {
    config: VisionConfig,
    states: HashMap<SourceId, PolygonComputationState>,
    next_cache_id: u64,
}

impl VisibilityPolygonComputer {
    pub fn new(config: VisionConfig) -> Self {
        Self { config, states: HashMap::new(), next_cache_id: 1 }
    }

    pub fn config(&self) -> &VisionConfig { &self.config }

    pub fn set_frame_budget(&mut self, budget_ms: f32) {
        self.config.frame_budget_ms = budget_ms;
    }

    fn splits(&self) -> Option<u32> {
        (self.config.time_slicing && self.config.splits > 1).then_some(self.config.splits)
    }

    /// Sample layout used for `params` under the current configuration.
    pub fn fan(&self, params: &PolygonConfig) -> Fan {
        Fan::new(params, self.config.resolution, self.splits())
    }

    pub fn state(&self, source: SourceId) -> Option<&PolygonComputationState> {
        self.states.get(&source)
    }

    /// Scene geometry changed: every source recomputes in full on its next call.
    pub fn invalidate_all(&mut self) {
        for state in self.states.values_mut() {
            state.stale = true;
        }
    }

    pub fn forget(&mut self, source: SourceId) {
        self.states.remove(&source);
    }

    pub fn source_count(&self) -> usize { self.states.len() }

    /// Best currently available polygon for `source`. Never empty.
    pub fn compute(
        &mut self,
        source: SourceId,
        params: &PolygonConfig,
        caster: &mut dyn SightCaster,
        now: Instant,
    ) -> VisibilityPolygon {
        let timeout = self.config.recompute_timeout();
        let sliced = self.splits().is_some();

        let reusable = self.states.get(&source).is_some_and(|s| {
            !s.stale
                && s.params == *params
                && now.saturating_duration_since(s.last_compute) <= timeout
        });

        if !reusable {
            return self.full_recompute(source, params, caster, now);
        }
        if !sliced {
            // No slicing: a fresh, fully raycast polygon stays valid until invalidated
            match self.states.get(&source) {
                Some(state) if state.polygon.tentative == 0 => return state.polygon.clone(),
                _ => return self.full_recompute(source, params, caster, now),
            }
        }
        self.advance_split(source, params, caster, now)
    }

    fn full_recompute(
        &mut self,
        source: SourceId,
        params: &PolygonConfig,
        caster: &mut dyn SightCaster,
        now: Instant,
    ) -> VisibilityPolygon {
        let fan = self.fan(params);
        let batch = fan.sample(0..fan.len(), caster, self.config.frame_budget());

        let mut tentative_splits = BTreeSet::new();
        if let (Some(splits), Some(from)) = (self.splits(), batch.degraded_from) {
            let splits = splits as usize;
            tentative_splits.extend((0..splits).filter(|s| fan.split_range(*s, splits).end > from));
        }
        if batch.degraded_from.is_some() {
            log::debug!(
                "source {}: {} of {} samples over budget",
                source,
                batch.tentative(),
                fan.len()
            );
        }

        let cache_id = self.take_cache_id();
        let tentative = batch.tentative();
        let polygon = VisibilityPolygon::new(params, fan.finish(batch.points), cache_id, tentative);
        self.states.insert(
            source,
            PolygonComputationState {
                params: *params,
                split: 0,
                order: Vec::new(),
                batches: BTreeMap::new(),
                last_compute: now,
                complete: true,
                stale: false,
                tentative_splits,
                polygon: polygon.clone(),
            },
        );
        polygon
    }

    fn advance_split(
        &mut self,
        source: SourceId,
        params: &PolygonConfig,
        caster: &mut dyn SightCaster,
        now: Instant,
    ) -> VisibilityPolygon {
        let fan = self.fan(params);
        let splits = self.config.splits as usize;
        let budget = self.config.frame_budget();
        let next_cache_id = self.next_cache_id;

        let Some(state) = self.states.get_mut(&source) else {
            return self.full_recompute(source, params, caster, now);
        };

        if state.split == 0 {
            // New cycle: refine tentative splits before the rest
            state.batches.clear();
            let mut order: Vec<usize> = state.tentative_splits.iter().copied().collect();
            order.extend((0..splits).filter(|s| !state.tentative_splits.contains(s)));
            state.order = order;
        }

        let split = state.order[state.split];
        let batch = fan.sample(fan.split_range(split, splits), caster, budget);
        state.batches.insert(split, batch);
        state.split += 1;
        state.last_compute = now;
        state.complete = false;

        if state.split == splits {
            let mut points = Vec::with_capacity(fan.len() + 1);
            let mut tentative = 0;
            state.tentative_splits.clear();
            for (s, batch) in &state.batches {
                points.extend_from_slice(&batch.points);
                tentative += batch.tentative();
                if batch.degraded_from.is_some() {
                    state.tentative_splits.insert(*s);
                }
            }
            state.polygon = VisibilityPolygon::new(params, fan.finish(points), next_cache_id, tentative);
            state.complete = true;
            state.split = 0;
            self.next_cache_id += 1;
        }

        state.polygon.clone()
    }

    fn take_cache_id(&mut self) -> u64 {
        let id = self.next_cache_id;
        self.next_cache_id += 1;
        id
    }
}
