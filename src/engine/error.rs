// Error types for the sight engine.
//
// A ray that hits nothing is not an error. These cover malformed input,
// bad configuration and a lost worker.

use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

/// Errors surfaced by the sight engine.
#[derive(Debug, Error)]
pub enum SightError {
    /// A serialized mesh could not be encoded or decoded.
    #[error("mesh payload could not be decoded: {0}")]
    MeshDecode(#[from] serde_json::Error),

    /// Mesh data decoded but is internally inconsistent.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),

    /// The raycast worker thread could not be started.
    #[error("failed to spawn raycast worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// The raycast worker has shut down or panicked.
    #[error("raycast worker is not reachable")]
    WorkerDisconnected,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A configuration file is not valid TOML for [`VisionConfig`](super::config::VisionConfig).
    #[error("configuration could not be parsed: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
