//! Tile addressing and resource kinds.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest supported zoom level.
pub const MAX_ZOOM: u8 = 31;

/// Integer tile coordinate at some zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId {
    pub x: i32,
    pub y: i32,
}

impl TileId {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// Zoom level in `0..=MAX_ZOOM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ZoomLevel(u8);

impl ZoomLevel {
    /// Returns `None` above `MAX_ZOOM`.
    pub fn new(level: u8) -> Option<Self> {
        (level <= MAX_ZOOM).then_some(Self(level))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for ZoomLevel {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level).ok_or_else(|| format!("zoom level {level} exceeds {MAX_ZOOM}"))
    }
}

impl From<ZoomLevel> for u8 {
    fn from(zoom: ZoomLevel) -> u8 {
        zoom.0
    }
}

impl fmt::Display for ZoomLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of resource a collection caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    ElevationData,
    RasterMap,
    Symbols,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] = [
        ResourceType::ElevationData,
        ResourceType::RasterMap,
        ResourceType::Symbols,
    ];

    /// Bit used in the invalidation mask.
    pub(crate) fn mask_bit(self) -> u32 {
        match self {
            ResourceType::ElevationData => 1 << 0,
            ResourceType::RasterMap => 1 << 1,
            ResourceType::Symbols => 1 << 2,
        }
    }
}

/// Where a provider is bound: the resource type plus a layer index.
///
/// Only `RasterMap` uses more than one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindingSlot {
    pub resource_type: ResourceType,
    pub layer: u32,
}

impl BindingSlot {
    pub fn raster(layer: u32) -> Self {
        Self {
            resource_type: ResourceType::RasterMap,
            layer,
        }
    }

    pub fn elevation() -> Self {
        Self {
            resource_type: ResourceType::ElevationData,
            layer: 0,
        }
    }

    pub fn symbols() -> Self {
        Self {
            resource_type: ResourceType::Symbols,
            layer: 0,
        }
    }
}

impl fmt::Display for BindingSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.resource_type, self.layer)
    }
}

/// The de-duplicated set of tiles the current view requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeededTiles {
    pub zoom: ZoomLevel,
    pub tiles: HashSet<TileId>,
}

impl NeededTiles {
    pub fn new(zoom: ZoomLevel, tiles: impl IntoIterator<Item = TileId>) -> Self {
        Self {
            zoom,
            tiles: tiles.into_iter().collect(),
        }
    }

    /// Nothing is needed; every cached entry becomes junk.
    pub fn empty(zoom: ZoomLevel) -> Self {
        Self {
            zoom,
            tiles: HashSet::new(),
        }
    }

    pub fn contains(&self, tile: TileId, zoom: ZoomLevel) -> bool {
        zoom == self.zoom && self.tiles.contains(&tile)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}
