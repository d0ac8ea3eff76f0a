// Engine module - spatial index, raycasting and visibility for a live scene

pub mod bvh;
pub mod camera;
pub mod components;
pub mod config;
pub mod debounce;
pub mod drag;
pub mod error;
pub mod mesh;
pub mod raycast;
pub mod scene;
pub mod scene_index;
pub mod visibility;
pub mod vision;
pub mod worker;

// Re-export commonly used items
pub use components::*;
pub use config::VisionConfig;
pub use error::SightError;
pub use scene::SceneContext;
