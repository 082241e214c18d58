//! Resources manager: the facade the renderer talks to.
//!
//! Owns provider bindings and their collections, the request scheduler and
//! the upload pipeline. In per-frame mode the caller's thread owns the device
//! and every method that touches it must be called from there. In wakeup mode
//! a dedicated upload thread owns the device for the manager's lifetime and
//! the public methods only record work and wake it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::atlas::{AtlasAllocator, AtlasPoolStats};
use crate::collection::ResourceCollection;
use crate::config::{ResourcesConfig, UploadTrigger};
use crate::device::{Device, StandaloneTexture, TextureHandle};
use crate::entry::GpuTile;
use crate::error::{ResourceError, ResourceResult};
use crate::payload::{ImageRef, PixelFormat};
use crate::provider::{BoundProvider, SymbolsProvider, TiledDataProvider};
use crate::scheduler::{RequestScheduler, RequestStats};
use crate::signals::RenderSignals;
use crate::state::ResourceState;
use crate::symbols::SymbolRegistry;
use crate::tile::{BindingSlot, NeededTiles, ResourceType, TileId, ZoomLevel};
use crate::upload::{
    CleanupOutcome, DevicePass, UploadOutcome, UploadPipeline, UploadWorker, WakeupSignal,
};
use crate::worker::WorkerPool;

const STUB_SIZE: u32 = 4;
const PROCESSING_STUB_TEXEL: [u8; 4] = [0x80, 0x80, 0x80, 0xff];
const UNAVAILABLE_STUB_TEXEL: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

/// What the renderer should draw for a tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileTexture {
    Uploaded(GpuTile),
    /// Still on its way; draw the processing stub.
    Processing(TextureHandle),
    /// Confirmed absent; draw the unavailable stub.
    Unavailable(TextureHandle),
    Missing,
}

/// Counts reported by [`ResourcesManager::sync_resources_in_gpu`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub unloaded: usize,
    pub removed: usize,
    pub uploaded: usize,
    pub more_available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub slot: BindingSlot,
    pub active: bool,
    pub entries: usize,
    pub states: BTreeMap<ResourceState, usize>,
}

/// Snapshot of everything the manager holds.
#[derive(Debug, Clone, Serialize)]
pub struct ResourcesStats {
    pub collections: Vec<CollectionStats>,
    pub retired_collections: usize,
    pub atlas_pools: Vec<AtlasPoolStats>,
    pub symbols: usize,
    pub requests: RequestStats,
    pub pending_tasks: usize,
}

struct StubTextures {
    processing: StandaloneTexture,
    unavailable: StandaloneTexture,
}

impl StubTextures {
    fn upload(device: &Arc<dyn Device>) -> ResourceResult<Self> {
        let texels = (STUB_SIZE * STUB_SIZE) as usize;
        let processing = PROCESSING_STUB_TEXEL.repeat(texels);
        let unavailable = UNAVAILABLE_STUB_TEXEL.repeat(texels);

        Ok(Self {
            processing: StandaloneTexture::upload(device, stub_image(&processing))?,
            unavailable: StandaloneTexture::upload(device, stub_image(&unavailable))?,
        })
    }
}

fn stub_image(pixels: &[u8]) -> ImageRef<'_> {
    ImageRef {
        pixels,
        format: PixelFormat::Rgba8888,
        width: STUB_SIZE,
        height: STUB_SIZE,
    }
}

/// Forwards to the renderer and wakes the upload thread when there is one.
struct ForwardingSignals {
    renderer: Arc<dyn RenderSignals>,
    wakeup: Option<Arc<WakeupSignal>>,
}

impl RenderSignals for ForwardingSignals {
    fn request_redraw(&self) {
        self.renderer.request_redraw();
    }

    fn request_resources_upload(&self) {
        if let Some(wakeup) = &self.wakeup {
            wakeup.notify();
        }
        self.renderer.request_resources_upload();
    }
}

struct ManagerCore {
    config: ResourcesConfig,
    signals: Arc<dyn RenderSignals>,
    scheduler: RequestScheduler,
    pipeline: UploadPipeline,
    bindings: RwLock<BTreeMap<BindingSlot, Arc<ResourceCollection>>>,
    /// Collections of replaced or unbound providers awaiting release.
    retired: Mutex<Vec<Arc<ResourceCollection>>>,
    active_zone: Mutex<Option<NeededTiles>>,
    /// `ResourceType::mask_bit`s awaiting `validate_resources`.
    invalidated: AtomicU32,
    stubs: Mutex<Option<StubTextures>>,
}

impl ManagerCore {
    fn collections(&self) -> Vec<Arc<ResourceCollection>> {
        self.bindings.read().values().cloned().collect()
    }

    /// Release retired collections; any not yet empty stay retired.
    fn drain_retired(&self) -> CleanupOutcome {
        let retired = std::mem::take(&mut *self.retired.lock());
        let mut outcome = CleanupOutcome::default();
        let mut pending = Vec::new();
        for collection in retired {
            let released = self.pipeline.release_resources_from(&collection);
            outcome.unloaded += released.unloaded;
            outcome.removed += released.removed;
            outcome.transient += released.transient;
            if !collection.is_empty() {
                pending.push(collection);
            }
        }
        if !pending.is_empty() {
            tracing::debug!(collections = pending.len(), "retired collections not yet empty");
            self.retired.lock().extend(pending);
        }
        outcome
    }

    /// Evict collections of invalidated types so they are fetched again.
    fn validate_resources(&self) -> CleanupOutcome {
        let mask = self.invalidated.swap(0, Ordering::AcqRel);
        let mut outcome = CleanupOutcome::default();
        if mask == 0 {
            return outcome;
        }
        for collection in self.collections() {
            if mask & collection.resource_type().mask_bit() != 0 {
                let evicted = self.pipeline.cleanup_collection(&collection, None);
                outcome.unloaded += evicted.unloaded;
                outcome.removed += evicted.removed;
                outcome.transient += evicted.transient;
            }
        }
        tracing::debug!(mask, removed = outcome.removed, "validated resources");
        outcome
    }

    /// Retired collections, invalidation, junk eviction and new requests.
    fn prepare(&self) -> CleanupOutcome {
        let mut outcome = self.drain_retired();
        let validated = self.validate_resources();
        outcome.unloaded += validated.unloaded;
        outcome.removed += validated.removed;
        outcome.transient += validated.transient;

        let zone = self.active_zone.lock().clone();
        if let Some(needed) = zone {
            let collections = self.collections();
            let cleaned = self.pipeline.cleanup_junk_resources(&collections, &needed);
            outcome.unloaded += cleaned.unloaded;
            outcome.removed += cleaned.removed;
            outcome.transient += cleaned.transient;
            self.scheduler.request_needed(&collections, &needed);
        }
        outcome
    }

    fn upload(&self) -> UploadOutcome {
        self.pipeline
            .upload_resources(&self.collections(), self.config.upload.budget)
    }

    fn ensure_stubs(&self) -> ResourceResult<()> {
        let mut stubs = self.stubs.lock();
        if stubs.is_none() {
            *stubs = Some(StubTextures::upload(self.pipeline.device())?);
        }
        Ok(())
    }

    fn teardown(&self) {
        let bound: Vec<_> = std::mem::take(&mut *self.bindings.write()).into_values().collect();
        self.retired.lock().extend(bound);
        let released = self.drain_retired();
        self.stubs.lock().take();
        tracing::info!(
            unloaded = released.unloaded,
            removed = released.removed,
            "resources released"
        );
    }
}

impl DevicePass for ManagerCore {
    fn on_start(&self) {
        if let Err(e) = self.ensure_stubs() {
            tracing::error!(error = %e, "failed to create stub textures");
        }
    }

    fn run_pass(&self) -> bool {
        self.prepare();
        let outcome = self.upload();
        outcome.uploaded > 0 && outcome.more_available
    }

    fn on_stop(&self) {
        self.teardown();
    }
}

pub struct ResourcesManager {
    core: Arc<ManagerCore>,
    upload_worker: Option<UploadWorker>,
    shut_down: AtomicBool,
}

impl ResourcesManager {
    /// Create a manager. In per-frame mode the stub textures are uploaded
    /// from the calling thread, which then owns the device.
    pub fn new(
        config: ResourcesConfig,
        device: Arc<dyn Device>,
        signals: Arc<dyn RenderSignals>,
    ) -> ResourceResult<Self> {
        config.validate()?;

        let wakeup = (config.upload.trigger == UploadTrigger::Wakeup)
            .then(|| Arc::new(WakeupSignal::default()));
        let signals: Arc<dyn RenderSignals> = Arc::new(ForwardingSignals {
            renderer: signals,
            wakeup: wakeup.clone(),
        });

        let workers = WorkerPool::new(config.effective_worker_threads());
        let atlas = AtlasAllocator::new(Arc::clone(&device), config.atlas);
        let pipeline = UploadPipeline::new(
            device,
            atlas,
            Arc::new(SymbolRegistry::new()),
            Arc::clone(&signals),
            config.transient_warning_passes,
        );
        tracing::info!(
            workers = workers.threads(),
            upload = ?config.upload,
            "resources manager started"
        );

        let core = Arc::new(ManagerCore {
            scheduler: RequestScheduler::new(workers, Arc::clone(&signals)),
            config,
            signals,
            pipeline,
            bindings: RwLock::new(BTreeMap::new()),
            retired: Mutex::new(Vec::new()),
            active_zone: Mutex::new(None),
            invalidated: AtomicU32::new(0),
            stubs: Mutex::new(None),
        });

        let upload_worker = match wakeup {
            Some(signal) => Some(UploadWorker::start(signal, core.clone())),
            None => {
                core.ensure_stubs()?;
                None
            }
        };

        Ok(Self {
            core,
            upload_worker,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ResourcesConfig {
        &self.core.config
    }

    fn ensure_running(&self) -> ResourceResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ResourceError::ShutDown);
        }
        Ok(())
    }

    /// Release retired collections now, or wake the upload thread to do it.
    fn after_binding_change(&self) {
        match &self.upload_worker {
            Some(worker) => worker.wake(),
            None => {
                self.core.drain_retired();
            }
        }
        self.core.signals.request_redraw();
    }

    /// Bind `provider` to `slot`.
    ///
    /// Returns `false` when the same provider is already bound there. A
    /// different provider replaces the old one, whose resources are released
    /// before anything is requested from the new one.
    pub fn bind_provider(
        &self,
        slot: BindingSlot,
        provider: BoundProvider,
    ) -> ResourceResult<bool> {
        self.ensure_running()?;
        if !provider.serves(slot.resource_type) {
            return Err(ResourceError::ProviderMismatch { slot });
        }
        let layers = match slot.resource_type {
            ResourceType::RasterMap => self.core.config.raster_layer_slots,
            ResourceType::ElevationData | ResourceType::Symbols => 1,
        };
        if slot.layer >= layers {
            return Err(ResourceError::SlotOutOfRange { slot });
        }

        {
            let mut bindings = self.core.bindings.write();
            if bindings.get(&slot).is_some_and(|c| c.provider().same_as(&provider)) {
                return Ok(false);
            }
            let collection = ResourceCollection::new(slot, provider);
            if let Some(old) = bindings.insert(slot, collection) {
                old.deactivate();
                self.core.retired.lock().push(old);
            }
        }

        tracing::debug!(%slot, "provider bound");
        self.after_binding_change();
        Ok(true)
    }

    pub fn bind_tiled_provider(
        &self,
        slot: BindingSlot,
        provider: Arc<dyn TiledDataProvider>,
    ) -> ResourceResult<bool> {
        self.bind_provider(slot, BoundProvider::Tiled(provider))
    }

    pub fn bind_symbols_provider(
        &self,
        provider: Arc<dyn SymbolsProvider>,
    ) -> ResourceResult<bool> {
        self.bind_provider(BindingSlot::symbols(), BoundProvider::Symbols(provider))
    }

    /// Returns `false` if nothing was bound to `slot`.
    pub fn unbind_provider(&self, slot: BindingSlot) -> bool {
        let Some(old) = self.core.bindings.write().remove(&slot) else {
            return false;
        };
        old.deactivate();
        self.core.retired.lock().push(old);
        tracing::debug!(%slot, "provider unbound");
        self.after_binding_change();
        true
    }

    pub fn collection(&self, slot: BindingSlot) -> Option<Arc<ResourceCollection>> {
        self.core.bindings.read().get(&slot).cloned()
    }

    /// Supply the tiles the current view needs.
    ///
    /// Per-frame mode evicts junk and issues requests right away.
    pub fn update_active_zone(&self, needed: NeededTiles) {
        *self.core.active_zone.lock() = Some(needed);
        match &self.upload_worker {
            Some(worker) => worker.wake(),
            None => {
                self.core.prepare();
            }
        }
    }

    /// Upload Ready entries within the configured budget.
    ///
    /// In wakeup mode this only wakes the upload thread.
    pub fn upload_resources(&self) -> UploadOutcome {
        match &self.upload_worker {
            Some(worker) => {
                worker.wake();
                UploadOutcome::default()
            }
            None => self.core.upload(),
        }
    }

    /// One full device-side frame step: release, evict, request and upload.
    pub fn sync_resources_in_gpu(&self) -> SyncOutcome {
        if let Some(worker) = &self.upload_worker {
            worker.wake();
            return SyncOutcome::default();
        }
        let cleaned = self.core.prepare();
        let uploaded = self.core.upload();
        SyncOutcome {
            unloaded: cleaned.unloaded,
            removed: cleaned.removed,
            uploaded: uploaded.uploaded,
            more_available: uploaded.more_available,
        }
    }

    /// Mark every resource of `resource_type` stale; they are evicted by the
    /// next device-side pass and requested again.
    pub fn invalidate_resources_of_type(&self, resource_type: ResourceType) {
        self.core
            .invalidated
            .fetch_or(resource_type.mask_bit(), Ordering::AcqRel);
        if let Some(worker) = &self.upload_worker {
            worker.wake();
        }
        self.core.signals.request_resources_upload();
    }

    /// Apply pending invalidations now (per-frame mode).
    pub fn validate_resources(&self) -> bool {
        if let Some(worker) = &self.upload_worker {
            worker.wake();
            return false;
        }
        self.core.validate_resources().removed > 0
    }

    /// What to draw for (tile, zoom) from the collection bound to `slot`.
    pub fn tile_texture(&self, slot: BindingSlot, tile: TileId, zoom: ZoomLevel) -> TileTexture {
        let Some(entry) = self.collection(slot).and_then(|c| c.get(tile, zoom)) else {
            return TileTexture::Missing;
        };

        let state = entry.state();
        if state == ResourceState::Uploaded {
            if let Some(gpu) = entry.gpu_tile() {
                return TileTexture::Uploaded(gpu);
            }
        }

        let stubs = self.core.stubs.lock();
        let Some(stubs) = stubs.as_ref() else {
            return TileTexture::Missing;
        };
        match state {
            ResourceState::Unavailable => TileTexture::Unavailable(stubs.unavailable.handle()),
            ResourceState::Requesting
            | ResourceState::Requested
            | ResourceState::ProcessingRequest
            | ResourceState::Ready
            | ResourceState::Uploading => TileTexture::Processing(stubs.processing.handle()),
            _ => TileTexture::Missing,
        }
    }

    pub fn symbols(&self) -> &Arc<SymbolRegistry> {
        self.core.pipeline.symbols()
    }

    /// Block until no fetch task is pending or `timeout` elapses.
    pub fn wait_for_requests(&self, timeout: Duration) -> bool {
        self.core.scheduler.workers().wait_idle(timeout)
    }

    pub fn stats(&self) -> ResourcesStats {
        let collections = self
            .core
            .collections()
            .iter()
            .map(|c| CollectionStats {
                slot: c.slot(),
                active: c.is_active(),
                entries: c.len(),
                states: c.state_histogram(),
            })
            .collect();

        ResourcesStats {
            collections,
            retired_collections: self.core.retired.lock().len(),
            atlas_pools: self.core.pipeline.atlas().stats(),
            symbols: self.symbols().len(),
            requests: self.core.scheduler.stats(),
            pending_tasks: self.core.scheduler.workers().pending(),
        }
    }

    /// Human-readable JSON dump of [`Self::stats`].
    pub fn dump_resources_info(&self) -> ResourceResult<String> {
        Ok(serde_json::to_string_pretty(&self.stats())?)
    }

    /// Release every resource and stop the upload thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.upload_worker {
            // The upload thread releases everything before it exits.
            Some(worker) => worker.stop(),
            None => self.core.teardown(),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_upload_thread_running(&self) -> bool {
        self.upload_worker.as_ref().is_some_and(UploadWorker::is_running)
    }
}

impl Drop for ResourcesManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
