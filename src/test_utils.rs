//! Shared test doubles: a recording device, scripted providers and signals.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::device::{AtlasTextureDesc, Device, SlotRegion, TextureHandle};
use crate::error::{DeviceError, ProviderError};
use crate::payload::{ImageRef, PixelFormat, SymbolId, SymbolImage, SymbolSet, TilePayload};
use crate::provider::{SymbolsProvider, TiledDataProvider};
use crate::signals::RenderSignals;
use crate::tile::{TileId, ZoomLevel};

pub fn zoom(level: u8) -> ZoomLevel {
    ZoomLevel::new(level).unwrap()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Device double that tracks every live handle.
pub struct MockDevice {
    next_handle: AtomicU64,
    live: Mutex<HashSet<TextureHandle>>,
    atlases: Mutex<HashSet<TextureHandle>>,
    freed: Mutex<Vec<TextureHandle>>,
    double_frees: AtomicUsize,
    fail_allocations: AtomicBool,
    /// Allocations allowed before failing; negative means unlimited.
    allocations_left: AtomicI64,
    fail_uploads: AtomicBool,
    max_texture_size: u32,
    threads: Mutex<HashSet<ThreadId>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_max_texture_size(16384)
    }

    pub fn with_max_texture_size(max_texture_size: u32) -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            live: Mutex::new(HashSet::new()),
            atlases: Mutex::new(HashSet::new()),
            freed: Mutex::new(Vec::new()),
            double_frees: AtomicUsize::new(0),
            fail_allocations: AtomicBool::new(false),
            allocations_left: AtomicI64::new(-1),
            fail_uploads: AtomicBool::new(false),
            max_texture_size,
            threads: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::SeqCst);
    }

    /// Let `count` more allocations succeed, then fail the rest.
    pub fn fail_allocations_after(&self, count: i64) {
        self.allocations_left.store(count, Ordering::SeqCst);
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn live_textures(&self) -> usize {
        self.live.lock().len()
    }

    pub fn live_atlases(&self) -> usize {
        let live = self.live.lock();
        self.atlases.lock().iter().filter(|h| live.contains(h)).count()
    }

    pub fn total_freed(&self) -> usize {
        self.freed.lock().len()
    }

    pub fn was_freed(&self, handle: TextureHandle) -> bool {
        self.freed.lock().contains(&handle)
    }

    pub fn double_frees(&self) -> usize {
        self.double_frees.load(Ordering::SeqCst)
    }

    /// Threads that have called into the device.
    pub fn device_threads(&self) -> HashSet<ThreadId> {
        self.threads.lock().clone()
    }

    fn record_thread(&self) {
        self.threads.lock().insert(std::thread::current().id());
    }

    fn allocate(&self) -> Result<TextureHandle, DeviceError> {
        self.record_thread();
        if self.fail_allocations.load(Ordering::SeqCst) {
            return Err(DeviceError::Allocation("out of device memory".into()));
        }
        let budget = self
            .allocations_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                n if n < 0 => Some(n),
                n => Some(n - 1),
            });
        if budget.is_err() {
            return Err(DeviceError::Allocation("allocation budget exhausted".into()));
        }

        let handle = TextureHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.live.lock().insert(handle);
        Ok(handle)
    }
}

impl Device for MockDevice {
    fn allocate_atlas(&self, desc: &AtlasTextureDesc) -> Result<TextureHandle, DeviceError> {
        assert!(desc.size <= self.max_texture_size);
        let handle = self.allocate()?;
        self.atlases.lock().insert(handle);
        Ok(handle)
    }

    fn upload_region(
        &self,
        texture: TextureHandle,
        region: SlotRegion,
        pixels: &[u8],
    ) -> Result<(), DeviceError> {
        self.record_thread();
        assert!(self.live.lock().contains(&texture), "upload into dead {texture}");
        assert!(!pixels.is_empty());
        let _ = region;
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(DeviceError::Upload("device lost".into()));
        }
        Ok(())
    }

    fn allocate_standalone(&self, image: ImageRef<'_>) -> Result<TextureHandle, DeviceError> {
        assert!(image.width > 0 && image.height > 0);
        self.allocate()
    }

    fn free(&self, texture: TextureHandle) {
        self.record_thread();
        if self.live.lock().remove(&texture) {
            self.freed.lock().push(texture);
        } else {
            self.double_frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn max_texture_size(&self) -> u32 {
        self.record_thread();
        self.max_texture_size
    }
}

/// Blocks callers until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }
}

/// Scripted raster/elevation provider.
pub struct MockTileProvider {
    tile_size: u32,
    missing: HashSet<TileId>,
    failing: HashSet<TileId>,
    bad_pixels: bool,
    metadata: bool,
    gate: Option<Arc<Gate>>,
    calls: AtomicUsize,
}

impl MockTileProvider {
    pub fn all_available(tile_size: u32) -> Self {
        Self {
            tile_size,
            missing: HashSet::new(),
            failing: HashSet::new(),
            bad_pixels: false,
            metadata: false,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// A provider that blocks every request until the gate opens.
    pub fn gated(tile_size: u32) -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        let mut provider = Self::all_available(tile_size);
        provider.gate = Some(Arc::clone(&gate));
        (provider, gate)
    }

    pub fn with_missing(mut self, tile: TileId) -> Self {
        self.missing.insert(tile);
        self
    }

    pub fn with_failing(mut self, tile: TileId) -> Self {
        self.failing.insert(tile);
        self
    }

    pub fn with_bad_pixels(mut self) -> Self {
        self.bad_pixels = true;
        self
    }

    pub fn with_metadata(mut self) -> Self {
        self.metadata = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TiledDataProvider for MockTileProvider {
    fn obtain_tile(
        &self,
        tile: TileId,
        zoom: ZoomLevel,
    ) -> Result<Option<TilePayload>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        if self.failing.contains(&tile) {
            return Err(ProviderError::RequestFailed(format!("{tile}@{zoom} timed out")));
        }
        if self.missing.contains(&tile) {
            return Ok(None);
        }

        let side = self.tile_size as usize;
        let len = if self.bad_pixels { 3 } else { side * side * 4 };
        let mut payload =
            TilePayload::new(vec![zoom.get(); len], PixelFormat::Rgba8888, self.tile_size);
        if self.metadata {
            payload = payload.with_retainable_metadata(Bytes::from(format!("{tile}@{zoom}")));
        }
        Ok(Some(payload))
    }
}

/// Provider returning the same `count` symbols for every tile.
pub struct MockSymbolsProvider {
    count: usize,
}

impl MockSymbolsProvider {
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

impl SymbolsProvider for MockSymbolsProvider {
    fn obtain_symbols(
        &self,
        _tile: TileId,
        _zoom: ZoomLevel,
    ) -> Result<Option<SymbolSet>, ProviderError> {
        let symbols = (0..self.count)
            .map(|i| SymbolImage {
                id: SymbolId(i as u64),
                order: i as i32,
                pixels: Bytes::from(vec![0xffu8; 8 * 8]),
                format: PixelFormat::Alpha8,
                width: 8,
                height: 8,
            })
            .collect();
        Ok(Some(SymbolSet::new(symbols)))
    }
}

#[derive(Default)]
pub struct RecordingSignals {
    redraws: AtomicUsize,
    upload_requests: AtomicUsize,
}

impl RecordingSignals {
    pub fn redraws(&self) -> usize {
        self.redraws.load(Ordering::SeqCst)
    }

    pub fn upload_requests(&self) -> usize {
        self.upload_requests.load(Ordering::SeqCst)
    }
}

impl RenderSignals for RecordingSignals {
    fn request_redraw(&self) {
        self.redraws.fetch_add(1, Ordering::SeqCst);
    }

    fn request_resources_upload(&self) {
        self.upload_requests.fetch_add(1, Ordering::SeqCst);
    }
}
