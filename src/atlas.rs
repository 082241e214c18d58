//! Atlas texture slot allocator.
//!
//! Tiles of the same shape (format, size, padding) share square atlas
//! textures. Each [`AtlasPool`] hands out slots of its current texture
//! sequentially, recycles slots published back by dropped [`TileOnAtlas`]
//! values, and allocates a new texture only when neither is available.
//!
//! Ownership runs one way: tiles hold `Arc<AtlasTexture>`, pools only hold
//! `Weak` references. A texture is therefore destroyed as soon as its last
//! tile is released, and its handle is freed on the thread that released it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AtlasConfig;
use crate::device::{AtlasTextureDesc, Device, SlotRegion, TextureHandle};
use crate::error::{consistency_violation, ResourceError, ResourceResult};
use crate::payload::{PixelFormat, TilePayload};

/// Oversize tolerance before the next power of two is halved.
const OVERSIZE_TOLERANCE: f64 = 1.15;

/// Key under which same-shaped tiles share atlas textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AtlasShape {
    pub format: PixelFormat,
    pub tile_size: u32,
    pub padding: u32,
}

impl AtlasShape {
    pub fn of(tile: &TilePayload) -> Self {
        Self {
            format: tile.format,
            tile_size: tile.tile_size,
            padding: tile.padding,
        }
    }

    /// Side length of one slot including padding on both edges.
    ///
    /// Saturates, so an absurd padding yields a slot no texture can hold.
    pub fn slot_stride(&self) -> u32 {
        self.tile_size.saturating_add(self.padding.saturating_mul(2))
    }
}

/// Side length of a new atlas texture for `shape`.
///
/// Aims at `tiles_per_atlas_side` tiles per side (padding grown for every mip
/// level), rounds up to a power of two and falls back to half of that when the
/// rounding overshoots by more than 15%. Returns `None` when the sizes do
/// not fit in `u32`.
pub fn atlas_texture_size(
    shape: &AtlasShape,
    config: &AtlasConfig,
    max_texture_size: u32,
) -> Option<u32> {
    let border = shape
        .padding
        .checked_mul(2)?
        .checked_mul(config.max_mip_levels.max(1))?;
    let padded_tile = shape.tile_size.checked_add(border)?;
    if config.tiles_per_atlas_side <= 1 {
        return Some(padded_tile.checked_next_power_of_two()?.min(max_texture_size));
    }

    let ideal = config.tiles_per_atlas_side.checked_mul(padded_tile)?;
    let larger = ideal.checked_next_power_of_two()?;
    let size = if f64::from(larger) > f64::from(ideal) * OVERSIZE_TOLERANCE {
        larger >> 1
    } else {
        larger
    };
    Some(size.min(max_texture_size))
}

/// Mipmap level count for a texture of side `size`.
pub fn mip_levels_for(size: u32, config: &AtlasConfig) -> u32 {
    if !config.generate_mipmaps || size == 0 {
        return 1;
    }
    (1 + size.ilog2()).min(config.max_mip_levels.max(1))
}

/// A square device texture split into equally sized slots.
pub struct AtlasTexture {
    handle: TextureHandle,
    size: u32,
    mip_levels: u32,
    slots_per_side: u32,
    shape: AtlasShape,
    outstanding: AtomicU32,
    pool: Arc<AtlasPool>,
    device: Arc<dyn Device>,
}

impl AtlasTexture {
    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn slots_per_side(&self) -> u32 {
        self.slots_per_side
    }

    pub fn capacity(&self) -> u32 {
        self.slots_per_side * self.slots_per_side
    }

    /// Slots issued and not yet released.
    pub fn outstanding_slots(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Texel region of `slot`.
    pub fn region(&self, slot: u32) -> SlotRegion {
        let stride = self.shape.slot_stride();
        SlotRegion {
            x: (slot % self.slots_per_side) * stride,
            y: (slot / self.slots_per_side) * stride,
            tile_size: self.shape.tile_size,
            padding: self.shape.padding,
        }
    }
}

impl fmt::Debug for AtlasTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtlasTexture")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("slots_per_side", &self.slots_per_side)
            .field("outstanding", &self.outstanding_slots())
            .finish()
    }
}

impl Drop for AtlasTexture {
    fn drop(&mut self) {
        let remaining = self.outstanding_slots();
        if remaining > 0 {
            consistency_violation(&format!(
                "atlas texture {} destroyed with {remaining} allocated slots",
                self.handle
            ));
        }

        // Stale free-list entries point at this texture and can never be reused.
        let me: *const AtlasTexture = self;
        self.pool
            .freed
            .lock()
            .retain(|freed| !std::ptr::eq(freed.texture.as_ptr(), me));

        self.pool.live_textures.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(texture = %self.handle, "atlas texture released");
        self.device.free(self.handle);
    }
}

/// One occupied slot; returns the slot to its pool on drop.
pub struct TileOnAtlas {
    texture: Arc<AtlasTexture>,
    slot: u32,
}

impl TileOnAtlas {
    fn new(texture: Arc<AtlasTexture>, slot: u32) -> Self {
        texture.outstanding.fetch_add(1, Ordering::AcqRel);
        texture.pool.outstanding.fetch_add(1, Ordering::AcqRel);
        Self { texture, slot }
    }

    pub fn texture(&self) -> &Arc<AtlasTexture> {
        &self.texture
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn region(&self) -> SlotRegion {
        self.texture.region(self.slot)
    }
}

impl fmt::Debug for TileOnAtlas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileOnAtlas")
            .field("texture", &self.texture.handle)
            .field("slot", &self.slot)
            .finish()
    }
}

impl Drop for TileOnAtlas {
    fn drop(&mut self) {
        let pool = &self.texture.pool;
        self.texture.outstanding.fetch_sub(1, Ordering::AcqRel);
        pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        // May run on any thread, hence the lock.
        pool.freed.lock().push(FreedSlot {
            texture: Arc::downgrade(&self.texture),
            slot: self.slot,
        });
    }
}

struct FreedSlot {
    texture: Weak<AtlasTexture>,
    slot: u32,
}

struct CurrentTexture {
    texture: Weak<AtlasTexture>,
    first_unused: u32,
}

/// Statistics for one atlas pool.
#[derive(Debug, Clone, Serialize)]
pub struct AtlasPoolStats {
    pub shape: AtlasShape,
    pub live_textures: usize,
    pub textures_created: u64,
    pub outstanding_slots: usize,
    pub free_slots: usize,
}

/// Atlas textures of one shape.
pub struct AtlasPool {
    shape: AtlasShape,
    freed: Mutex<Vec<FreedSlot>>,
    current: Mutex<CurrentTexture>,
    live_textures: AtomicUsize,
    textures_created: AtomicU64,
    outstanding: AtomicUsize,
}

impl AtlasPool {
    fn new(shape: AtlasShape) -> Self {
        Self {
            shape,
            freed: Mutex::new(Vec::new()),
            current: Mutex::new(CurrentTexture {
                texture: Weak::new(),
                first_unused: 0,
            }),
            live_textures: AtomicUsize::new(0),
            textures_created: AtomicU64::new(0),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn shape(&self) -> AtlasShape {
        self.shape
    }

    /// Take a slot: recycled first, then the next unused one of the current
    /// texture, then slot 0 of a texture produced by `create_texture`.
    pub fn allocate_slot<F>(self: &Arc<Self>, create_texture: F) -> ResourceResult<TileOnAtlas>
    where
        F: FnOnce(&Arc<AtlasPool>) -> ResourceResult<AtlasTexture>,
    {
        {
            let mut freed = self.freed.lock();
            while let Some(entry) = freed.pop() {
                if let Some(texture) = entry.texture.upgrade() {
                    return Ok(TileOnAtlas::new(texture, entry.slot));
                }
            }
        }

        let mut current = self.current.lock();
        if let Some(texture) = current.texture.upgrade() {
            if current.first_unused < texture.capacity() {
                let slot = current.first_unused;
                current.first_unused += 1;
                return Ok(TileOnAtlas::new(texture, slot));
            }
        }

        let texture = Arc::new(create_texture(self)?);
        self.live_textures.fetch_add(1, Ordering::AcqRel);
        self.textures_created.fetch_add(1, Ordering::AcqRel);
        current.texture = Arc::downgrade(&texture);
        current.first_unused = 1;
        Ok(TileOnAtlas::new(texture, 0))
    }

    pub fn stats(&self) -> AtlasPoolStats {
        AtlasPoolStats {
            shape: self.shape,
            live_textures: self.live_textures.load(Ordering::Acquire),
            textures_created: self.textures_created.load(Ordering::Acquire),
            outstanding_slots: self.outstanding.load(Ordering::Acquire),
            free_slots: self.freed.lock().len(),
        }
    }
}

/// Pools of atlas textures, one per [`AtlasShape`].
pub struct AtlasAllocator {
    device: Arc<dyn Device>,
    config: AtlasConfig,
    pools: Mutex<HashMap<AtlasShape, Arc<AtlasPool>>>,
}

impl AtlasAllocator {
    pub fn new(device: Arc<dyn Device>, config: AtlasConfig) -> Self {
        Self {
            device,
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AtlasConfig {
        &self.config
    }

    /// Pool for `shape`, created on first use.
    pub fn obtain_pool(&self, shape: AtlasShape) -> Arc<AtlasPool> {
        let mut pools = self.pools.lock();
        Arc::clone(
            pools
                .entry(shape)
                .or_insert_with(|| Arc::new(AtlasPool::new(shape))),
        )
    }

    /// Reserve a slot for a tile of `shape`, creating a texture if needed.
    pub fn allocate_tile(&self, shape: AtlasShape) -> ResourceResult<TileOnAtlas> {
        let pool = self.obtain_pool(shape);
        pool.allocate_slot(|pool| self.create_texture(pool))
    }

    /// Reserve a slot and upload `tile` into it.
    ///
    /// On upload failure the slot is returned to the pool.
    pub fn upload_tile(&self, tile: &TilePayload) -> ResourceResult<TileOnAtlas> {
        let slot = self.allocate_tile(AtlasShape::of(tile))?;
        self.device
            .upload_region(slot.texture().handle(), slot.region(), &tile.pixels)?;
        Ok(slot)
    }

    fn create_texture(&self, pool: &Arc<AtlasPool>) -> ResourceResult<AtlasTexture> {
        let shape = pool.shape();
        let max_texture_size = self.device.max_texture_size();
        let Some(size) = atlas_texture_size(&shape, &self.config, max_texture_size) else {
            return Err(ResourceError::AtlasTooSmall {
                texture_size: max_texture_size,
                slot_size: shape.slot_stride(),
            });
        };
        let slots_per_side = size / shape.slot_stride().max(1);
        if slots_per_side == 0 {
            return Err(ResourceError::AtlasTooSmall {
                texture_size: size,
                slot_size: shape.slot_stride(),
            });
        }

        let mip_levels = mip_levels_for(size, &self.config);
        let handle = self.device.allocate_atlas(&AtlasTextureDesc {
            format: shape.format,
            size,
            mip_levels,
        })?;
        tracing::debug!(
            texture = %handle,
            size,
            mip_levels,
            slots = slots_per_side * slots_per_side,
            "atlas texture allocated"
        );

        Ok(AtlasTexture {
            handle,
            size,
            mip_levels,
            slots_per_side,
            shape,
            outstanding: AtomicU32::new(0),
            pool: Arc::clone(pool),
            device: Arc::clone(&self.device),
        })
    }

    pub fn stats(&self) -> Vec<AtlasPoolStats> {
        let mut stats: Vec<_> = self.pools.lock().values().map(|p| p.stats()).collect();
        stats.sort_by_key(|s| s.shape);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockDevice;
    use std::collections::HashSet;

    fn config(tiles_per_side: u32) -> AtlasConfig {
        AtlasConfig {
            tiles_per_atlas_side: tiles_per_side,
            max_mip_levels: 1,
            generate_mipmaps: false,
        }
    }

    fn shape(tile_size: u32, padding: u32) -> AtlasShape {
        AtlasShape {
            format: PixelFormat::Rgba8888,
            tile_size,
            padding,
        }
    }

    fn allocator(tiles_per_side: u32) -> (Arc<MockDevice>, AtlasAllocator) {
        let mock = Arc::new(MockDevice::new());
        let allocator = AtlasAllocator::new(mock.clone(), config(tiles_per_side));
        (mock, allocator)
    }

    #[test]
    fn test_texture_size_exact_power_of_two() {
        assert_eq!(atlas_texture_size(&shape(256, 0), &config(4), 16384), Some(1024));
    }

    #[test]
    fn test_texture_size_halves_when_far_over_ideal() {
        // ideal = 4 * 260 = 1040 -> 2048 is ~97% over, so 1024 is used.
        assert_eq!(atlas_texture_size(&shape(256, 2), &config(4), 16384), Some(1024));
    }

    #[test]
    fn test_texture_size_keeps_power_within_tolerance() {
        // ideal = 4 * 240 = 960 -> 1024 is under 15% over.
        assert_eq!(atlas_texture_size(&shape(240, 0), &config(4), 16384), Some(1024));
    }

    #[test]
    fn test_texture_size_clamped_to_device_max() {
        assert_eq!(atlas_texture_size(&shape(256, 0), &config(16), 2048), Some(2048));
    }

    #[test]
    fn test_texture_size_single_tile_per_side() {
        assert_eq!(atlas_texture_size(&shape(200, 2), &config(1), 16384), Some(256));
    }

    #[test]
    fn test_padding_scales_with_mip_levels() {
        let cfg = AtlasConfig {
            tiles_per_atlas_side: 4,
            max_mip_levels: 4,
            generate_mipmaps: true,
        };
        // ideal = 4 * (256 + 2*2*4) = 1088 -> 2048 is too far over -> 1024
        assert_eq!(atlas_texture_size(&shape(256, 2), &cfg, 16384), Some(1024));
        assert_eq!(mip_levels_for(1024, &cfg), 4);
        assert_eq!(mip_levels_for(1024, &config(4)), 1);
    }

    #[test]
    fn test_sequential_slots_then_new_texture() {
        let (mock, allocator) = allocator(2);
        let tiles: Vec<_> = (0..5)
            .map(|_| allocator.allocate_tile(shape(64, 0)).unwrap())
            .collect();

        let slots: Vec<_> = tiles.iter().map(TileOnAtlas::slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 0]);
        assert_eq!(mock.live_textures(), 2);
        assert!(!Arc::ptr_eq(tiles[0].texture(), tiles[4].texture()));
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let (mock, allocator) = allocator(2);
        let a = allocator.allocate_tile(shape(64, 0)).unwrap();
        let b = allocator.allocate_tile(shape(64, 0)).unwrap();
        let b_slot = b.slot();
        drop(b);

        let c = allocator.allocate_tile(shape(64, 0)).unwrap();
        assert_eq!(c.slot(), b_slot);
        assert!(Arc::ptr_eq(a.texture(), c.texture()));
        assert_eq!(mock.live_textures(), 1);
    }

    #[test]
    fn test_slot_regions_do_not_overlap() {
        let (_mock, allocator) = allocator(4);
        let tiles: Vec<_> = (0..16)
            .map(|_| allocator.allocate_tile(shape(60, 2)).unwrap())
            .collect();
        let origins: HashSet<_> = tiles.iter().map(|t| (t.region().x, t.region().y)).collect();
        assert_eq!(origins.len(), 16);
        for tile in &tiles {
            let region = tile.region();
            assert!(region.x + 64 <= tile.texture().size());
            assert!(region.y + 64 <= tile.texture().size());
        }
    }

    #[test]
    fn test_shapes_use_separate_pools() {
        let (mock, allocator) = allocator(4);
        let _a = allocator.allocate_tile(shape(64, 0)).unwrap();
        let _b = allocator.allocate_tile(shape(128, 0)).unwrap();
        assert_eq!(mock.live_textures(), 2);
        assert_eq!(allocator.stats().len(), 2);
        assert!(Arc::ptr_eq(
            &allocator.obtain_pool(shape(64, 0)),
            &allocator.obtain_pool(shape(64, 0))
        ));
    }

    #[test]
    fn test_slot_conservation() {
        let (_mock, allocator) = allocator(4);
        let mut tiles: Vec<_> = (0..10)
            .map(|_| allocator.allocate_tile(shape(64, 0)).unwrap())
            .collect();
        let texture = Arc::clone(tiles[0].texture());
        assert_eq!(texture.outstanding_slots(), 10);

        for expected in (0..10).rev() {
            tiles.pop();
            assert_eq!(texture.outstanding_slots(), expected);
        }
        let stats = &allocator.stats()[0];
        assert_eq!(stats.outstanding_slots, 0);
    }

    #[test]
    fn test_texture_destroyed_when_last_slot_released() {
        let (mock, allocator) = allocator(2);
        let tiles: Vec<_> = (0..3)
            .map(|_| allocator.allocate_tile(shape(64, 0)).unwrap())
            .collect();
        let handle = tiles[0].texture().handle();
        drop(tiles);

        assert_eq!(mock.live_textures(), 0);
        assert!(mock.was_freed(handle));
        let stats = &allocator.stats()[0];
        assert_eq!(stats.live_textures, 0);
        assert_eq!(stats.free_slots, 0);
    }

    #[test]
    fn test_three_hundred_tiles_sixteen_slots() {
        let (mock, allocator) = allocator(4);
        let tiles: Vec<_> = (0..300)
            .map(|_| allocator.allocate_tile(shape(256, 0)).unwrap())
            .collect();
        assert_eq!(tiles[0].texture().capacity(), 16);
        assert_eq!(mock.live_textures(), 19);

        let victim = tiles[16].texture().handle();
        let (released, kept): (Vec<_>, Vec<_>) = tiles
            .into_iter()
            .partition(|t| t.texture().handle() == victim);
        assert_eq!(released.len(), 16);
        assert_eq!(released[0].texture().outstanding_slots(), 16);
        drop(released);

        assert_eq!(mock.live_textures(), 18);
        assert!(mock.was_freed(victim));
        assert_eq!(mock.total_freed(), 1);
        assert!(kept.iter().all(|t| t.texture().outstanding_slots() > 0));
    }

    #[test]
    fn test_release_from_other_thread() {
        let (mock, allocator) = allocator(2);
        let keep = allocator.allocate_tile(shape(64, 0)).unwrap();
        let moved = allocator.allocate_tile(shape(64, 0)).unwrap();
        std::thread::spawn(move || drop(moved)).join().unwrap();

        assert_eq!(allocator.stats()[0].free_slots, 1);
        let reused = allocator.allocate_tile(shape(64, 0)).unwrap();
        assert!(Arc::ptr_eq(keep.texture(), reused.texture()));
        assert_eq!(mock.live_textures(), 1);
    }

    #[test]
    fn test_too_small_device() {
        let mock = Arc::new(MockDevice::with_max_texture_size(32));
        let allocator = AtlasAllocator::new(mock.clone(), config(4));
        let result = allocator.allocate_tile(shape(64, 0));
        assert!(matches!(result, Err(ResourceError::AtlasTooSmall { .. })));
        assert_eq!(mock.live_textures(), 0);
    }

    #[test]
    fn test_failed_upload_returns_slot() {
        let (mock, allocator) = allocator(2);
        let keep = allocator.allocate_tile(shape(4, 0)).unwrap();
        mock.fail_uploads(true);
        let tile = TilePayload::new(vec![0u8; 4 * 4 * 4], PixelFormat::Rgba8888, 4);
        assert!(allocator.upload_tile(&tile).is_err());
        assert_eq!(allocator.stats()[0].outstanding_slots, 1);
        assert_eq!(allocator.stats()[0].free_slots, 1);
        drop(keep);
    }

    #[test]
    fn test_texture_size_overflow_is_none() {
        assert_eq!(atlas_texture_size(&shape(4, 1 << 30), &config(4), 16384), None);
        assert_eq!(atlas_texture_size(&shape(4, u32::MAX / 2), &config(1), 16384), None);
        assert_eq!(atlas_texture_size(&shape(256, 0), &config(1 << 24), 16384), None);
    }

    #[test]
    fn test_oversized_padding_is_an_error() {
        let (mock, allocator) = allocator(4);
        let tile = TilePayload::new(vec![0u8; 4 * 4 * 4], PixelFormat::Rgba8888, 4)
            .with_padding(1 << 30);
        assert!(matches!(
            allocator.upload_tile(&tile),
            Err(ResourceError::AtlasTooSmall { .. })
        ));
        assert_eq!(mock.live_textures(), 0);
    }

    #[test]
    fn test_huge_tiles_per_side_is_an_error() {
        let mock = Arc::new(MockDevice::new());
        let allocator = AtlasAllocator::new(mock.clone(), config(1 << 24));
        assert!(matches!(
            allocator.allocate_tile(shape(256, 0)),
            Err(ResourceError::AtlasTooSmall { .. })
        ));
        assert_eq!(mock.live_textures(), 0);
    }
}
