//! Decoded data handed over by providers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque pixel format tag; only its byte width matters here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgba8888,
    Rgb565,
    Alpha8,
    /// Single-channel float heights.
    R32Float,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8888 | PixelFormat::R32Float => 4,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Alpha8 => 1,
        }
    }
}

/// Decoded raster or elevation tile.
#[derive(Debug, Clone)]
pub struct TilePayload {
    /// Pixel data, `tile_size * tile_size` texels.
    pub pixels: Bytes,
    pub format: PixelFormat,
    /// Tile side length in pixels.
    pub tile_size: u32,
    /// Border texels on each side reserved for filtering.
    pub padding: u32,
    /// Small provider-specific data kept after the pixels are uploaded.
    pub retainable_metadata: Option<Bytes>,
}

impl TilePayload {
    pub fn new(pixels: impl Into<Bytes>, format: PixelFormat, tile_size: u32) -> Self {
        Self {
            pixels: pixels.into(),
            format,
            tile_size,
            padding: 0,
            retainable_metadata: None,
        }
    }

    pub fn with_padding(mut self, padding: u32) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_retainable_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.retainable_metadata = Some(metadata.into());
        self
    }

    /// Expected pixel byte count for the declared size and format.
    pub fn expected_len(&self) -> usize {
        let side = self.tile_size as usize;
        side * side * self.format.bytes_per_pixel()
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.pixels.len() + self.retainable_metadata.as_ref().map_or(0, Bytes::len)
    }
}

/// Stable identity of a symbol across tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolId(pub u64);

/// One symbol bitmap of a symbol set.
#[derive(Debug, Clone)]
pub struct SymbolImage {
    pub id: SymbolId,
    /// Draw order; lower orders are drawn first.
    pub order: i32,
    pub pixels: Bytes,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

/// All symbols of one tile.
#[derive(Debug, Clone, Default)]
pub struct SymbolSet {
    pub symbols: Vec<SymbolImage>,
}

impl SymbolSet {
    pub fn new(symbols: Vec<SymbolImage>) -> Self {
        Self { symbols }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.symbols.iter().map(|s| s.pixels.len()).sum()
    }
}

/// Fetched data held by an entry between `obtain_data` and upload.
#[derive(Debug, Clone)]
pub enum SourceData {
    Tile(TilePayload),
    Symbols(SymbolSet),
}

impl SourceData {
    pub fn size_bytes(&self) -> usize {
        match self {
            SourceData::Tile(tile) => tile.size_bytes(),
            SourceData::Symbols(set) => set.size_bytes(),
        }
    }
}

/// Pixel data for a single standalone device texture.
#[derive(Debug, Clone, Copy)]
pub struct ImageRef<'a> {
    pub pixels: &'a [u8],
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl<'a> From<&'a TilePayload> for ImageRef<'a> {
    fn from(tile: &'a TilePayload) -> Self {
        Self {
            pixels: &tile.pixels,
            format: tile.format,
            width: tile.tile_size,
            height: tile.tile_size,
        }
    }
}

impl<'a> From<&'a SymbolImage> for ImageRef<'a> {
    fn from(symbol: &'a SymbolImage) -> Self {
        Self {
            pixels: &symbol.pixels,
            format: symbol.format,
            width: symbol.width,
            height: symbol.height,
        }
    }
}
