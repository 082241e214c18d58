//! Maptile Core - resource cache and GPU upload pipeline for tiled map rendering.
//!
//! This crate provides:
//! - Per-tile resource entries driven by a lock-free state machine
//! - Cancellable background fetching on a rayon worker pool
//! - Budgeted uploads into shared atlas textures, per frame or on a dedicated thread
//! - Eviction of tiles that leave the active zone
//!
//! Usage:
//! ```no_run
//! use std::sync::Arc;
//! use maptile_core::{
//!     BindingSlot, NeededTiles, NoSignals, ResourcesConfig, ResourcesManager, TileId, ZoomLevel,
//! };
//! # fn demo(
//! #     device: Arc<dyn maptile_core::Device>,
//! #     provider: Arc<dyn maptile_core::TiledDataProvider>,
//! # ) -> maptile_core::ResourceResult<()> {
//! let manager = ResourcesManager::new(ResourcesConfig::default(), device, Arc::new(NoSignals))?;
//! manager.bind_tiled_provider(BindingSlot::raster(0), provider)?;
//!
//! let zoom = ZoomLevel::new(12).unwrap();
//! manager.update_active_zone(NeededTiles::new(zoom, [TileId::new(3, 5)]));
//! manager.upload_resources();
//! # Ok(())
//! # }
//! ```

pub mod atlas;
pub mod collection;
pub mod config;
pub mod device;
pub mod entry;
pub mod error;
pub mod manager;
pub mod payload;
pub mod provider;
pub mod scheduler;
pub mod signals;
pub mod state;
pub mod symbols;
pub mod tile;
pub mod upload;
pub mod worker;
#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{AtlasConfig, ResourcesConfig, UploadBudget, UploadConfig, UploadTrigger};
pub use device::{AtlasTextureDesc, Device, SlotRegion, TextureHandle};
pub use entry::GpuTile;
pub use error::{DeviceError, ProviderError, ResourceError, ResourceResult};
pub use manager::{ResourcesManager, ResourcesStats, SyncOutcome, TileTexture};
pub use payload::{ImageRef, PixelFormat, SymbolId, SymbolImage, SymbolSet, TilePayload};
pub use provider::{SymbolsProvider, TiledDataProvider};
pub use signals::{NoSignals, RenderSignals};
pub use state::ResourceState;
pub use tile::{BindingSlot, NeededTiles, ResourceType, TileId, ZoomLevel};
