use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The acquisition tool (or the network behind it) failed.
    #[error("acquisition failed for {uri}: {reason}")]
    AcquisitionFailed { uri: String, reason: String },

    #[error("track {track_id} not staged after {attempts} attempts")]
    StagingTimeout { track_id: String, attempts: u32 },

    #[error("rotation requested with an empty catalog")]
    EmptyCatalog,

    /// Unreadable sidecar. Callers treat this as a cache miss.
    #[error("metadata sidecar {path} is corrupt: {reason}")]
    MetadataCorrupt { path: String, reason: String },

    #[error("staging queue is full")]
    QueueFull,

    #[error("staging cache is shut down")]
    ShutDown,

    #[error("track has no usable id: {0}")]
    InvalidTrackId(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
