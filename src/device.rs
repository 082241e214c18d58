//! Device capability consumed by the upload pipeline.
//!
//! Every method may only be called from the device-owning thread.

use std::fmt;
use std::sync::Arc;

use crate::error::DeviceError;
use crate::payload::{ImageRef, PixelFormat};

/// Opaque device texture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u64);

impl fmt::Display for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tex#{}", self.0)
    }
}

/// Parameters of a new atlas texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasTextureDesc {
    pub format: PixelFormat,
    /// Side length in texels; atlases are square.
    pub size: u32,
    pub mip_levels: u32,
}

/// Sub-region of an atlas texture occupied by one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRegion {
    /// Left edge of the slot including padding.
    pub x: u32,
    /// Top edge of the slot including padding.
    pub y: u32,
    pub tile_size: u32,
    pub padding: u32,
}

/// Graphics device operations.
pub trait Device: Send + Sync {
    fn allocate_atlas(&self, desc: &AtlasTextureDesc) -> Result<TextureHandle, DeviceError>;

    fn upload_region(
        &self,
        texture: TextureHandle,
        region: SlotRegion,
        pixels: &[u8],
    ) -> Result<(), DeviceError>;

    fn allocate_standalone(&self, image: ImageRef<'_>) -> Result<TextureHandle, DeviceError>;

    fn free(&self, texture: TextureHandle);

    /// Largest texture side the device supports.
    fn max_texture_size(&self) -> u32;
}

/// A device texture owned by exactly one holder, freed on drop.
pub struct StandaloneTexture {
    handle: TextureHandle,
    width: u32,
    height: u32,
    device: Arc<dyn Device>,
}

impl StandaloneTexture {
    pub fn upload(device: &Arc<dyn Device>, image: ImageRef<'_>) -> Result<Self, DeviceError> {
        let handle = device.allocate_standalone(image)?;
        Ok(Self {
            handle,
            width: image.width,
            height: image.height,
            device: Arc::clone(device),
        })
    }

    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl fmt::Debug for StandaloneTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandaloneTexture")
            .field("handle", &self.handle)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl Drop for StandaloneTexture {
    fn drop(&mut self) {
        self.device.free(self.handle);
    }
}
