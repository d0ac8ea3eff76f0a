// Engine configuration.
// Every field has a default, so a TOML file only needs the values it changes:
//
//   resolution = 512
//   use_worker = true

use std::time::Duration;

use glam::Vec2;
use serde::Deserialize;

use super::error::SightError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    /// Ray samples for a full 360° sweep. Limited fans use a proportional share.
    pub resolution: u32,

    /// Number of batches a time-sliced recompute is spread over.
    pub splits: u32,

    /// Spread recomputes over `splits` calls instead of raycasting every sample at once.
    pub time_slicing: bool,

    /// Wall-clock budget for one batch of samples, in milliseconds.
    /// Samples past the budget fall back to the unobstructed point.
    pub frame_budget_ms: f32,

    /// Allowed gap between two split calls, in milliseconds per split.
    /// A cycle idle for longer than `splits * split_timeout_ms` restarts from scratch.
    pub split_timeout_ms: f32,

    /// Hits closer than this are ignored unless the surface has a clip height.
    pub near_distance: f32,

    /// Offload visibility polygons to the background raycast worker.
    pub use_worker: bool,

    /// Quiet period before the worker rebuilds its merged geometry.
    pub merge_debounce_ms: u64,

    /// XZ bounds covered by the footprint grid.
    pub index_bounds_min: Vec2,
    pub index_bounds_max: Vec2,

    /// Footprint grid cell size in world units.
    pub index_cell_size: f32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            resolution: 256,
            splits: 8,
            time_slicing: true,
            frame_budget_ms: 16.0,
            split_timeout_ms: 64.0,
            near_distance: 0.05,
            use_worker: false,
            merge_debounce_ms: 100,
            index_bounds_min: Vec2::new(-100.0, -100.0),
            index_bounds_max: Vec2::new(100.0, 100.0),
            index_cell_size: 8.0,
        }
    }
}

impl VisionConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, SightError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SightError> {
        if self.splits == 0 {
            return Err(SightError::Config("splits must be at least 1".into()));
        }
        if self.resolution < 3 {
            return Err(SightError::Config("resolution must be at least 3".into()));
        }
        if !(self.index_cell_size > 0.0) {
            return Err(SightError::Config("index_cell_size must be positive".into()));
        }
        if self.index_bounds_max.cmple(self.index_bounds_min).any() {
            return Err(SightError::Config("index bounds are empty".into()));
        }
        if self.frame_budget_ms < 0.0 || self.split_timeout_ms < 0.0 {
            return Err(SightError::Config("durations must not be negative".into()));
        }
        Ok(())
    }

    pub fn frame_budget(&self) -> Duration {
        millis(self.frame_budget_ms as f64)
    }

    /// Age after which a partial time-sliced state is abandoned.
    pub fn recompute_timeout(&self) -> Duration {
        millis(self.splits as f64 * self.split_timeout_ms as f64)
    }

    pub fn merge_debounce(&self) -> Duration {
        Duration::from_millis(self.merge_debounce_ms)
    }
}

fn millis(ms: f64) -> Duration {
    Duration::from_micros((ms * 1000.0).round().max(0.0) as u64)
}
