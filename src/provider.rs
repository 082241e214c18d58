//! Data providers bound to collections.

use std::sync::Arc;

use crate::error::ProviderError;
use crate::payload::{SourceData, SymbolSet, TilePayload};
use crate::tile::{ResourceType, TileId, ZoomLevel};

/// Source of raster or elevation tiles.
///
/// Called from worker threads and may block on I/O or decoding.
/// `Ok(None)` confirms the tile does not exist.
pub trait TiledDataProvider: Send + Sync {
    fn obtain_tile(
        &self,
        tile: TileId,
        zoom: ZoomLevel,
    ) -> Result<Option<TilePayload>, ProviderError>;
}

/// Source of per-tile symbol sets.
pub trait SymbolsProvider: Send + Sync {
    fn obtain_symbols(
        &self,
        tile: TileId,
        zoom: ZoomLevel,
    ) -> Result<Option<SymbolSet>, ProviderError>;
}

/// A provider as bound to a slot.
#[derive(Clone)]
pub enum BoundProvider {
    Tiled(Arc<dyn TiledDataProvider>),
    Symbols(Arc<dyn SymbolsProvider>),
}

impl BoundProvider {
    /// Whether both refer to the same provider object.
    pub fn same_as(&self, other: &BoundProvider) -> bool {
        match (self, other) {
            (BoundProvider::Tiled(a), BoundProvider::Tiled(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (BoundProvider::Symbols(a), BoundProvider::Symbols(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }

    /// Whether this provider can serve collections of `resource_type`.
    pub fn serves(&self, resource_type: ResourceType) -> bool {
        match self {
            BoundProvider::Tiled(_) => resource_type != ResourceType::Symbols,
            BoundProvider::Symbols(_) => resource_type == ResourceType::Symbols,
        }
    }

    pub fn obtain(
        &self,
        tile: TileId,
        zoom: ZoomLevel,
    ) -> Result<Option<SourceData>, ProviderError> {
        match self {
            BoundProvider::Tiled(provider) => {
                Ok(provider.obtain_tile(tile, zoom)?.map(SourceData::Tile))
            }
            BoundProvider::Symbols(provider) => {
                Ok(provider.obtain_symbols(tile, zoom)?.map(SourceData::Symbols))
            }
        }
    }
}

impl std::fmt::Debug for BoundProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoundProvider::Tiled(p) => write!(f, "Tiled({:p})", Arc::as_ptr(p)),
            BoundProvider::Symbols(p) => write!(f, "Symbols({:p})", Arc::as_ptr(p)),
        }
    }
}
