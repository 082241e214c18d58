//! Error types for maptile_core.

use thiserror::Error;

use crate::tile::{BindingSlot, TileId, ZoomLevel};

/// Failure reported by a data provider.
///
/// Every provider error is treated as transient: the entry is forgotten and
/// the tile is fetched again the next time it is needed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider is no longer bound")]
    Unbound,

    #[error("provider request failed: {0}")]
    RequestFailed(String),
}

/// Failure reported by the device capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("texture allocation failed: {0}")]
    Allocation(String),

    #[error("region upload failed: {0}")]
    Upload(String),
}

/// Error types for resource operations.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Atlas texture of {texture_size}px cannot hold a {slot_size}px slot")]
    AtlasTooSmall { texture_size: u32, slot_size: u32 },

    #[error("Invalid payload for tile {tile}@{zoom}: {reason}")]
    InvalidPayload {
        tile: TileId,
        zoom: ZoomLevel,
        reason: String,
    },

    #[error("No source data to upload")]
    MissingSourceData,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Provider cannot serve binding slot {slot}")]
    ProviderMismatch { slot: BindingSlot },

    #[error("Binding slot {slot} is out of range")]
    SlotOutOfRange { slot: BindingSlot },

    #[error("Resources manager is shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Report a broken internal invariant.
///
/// These indicate leaked or double-freed device memory, so debug builds stop
/// right here while release builds log and keep rendering.
#[track_caller]
pub(crate) fn consistency_violation(message: &str) {
    tracing::error!(location = %std::panic::Location::caller(), "{message}");
    debug_assert!(false, "internal consistency violation: {message}");
}
