//! One cached resource and its lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::atlas::{AtlasAllocator, TileOnAtlas};
use crate::collection::ResourceCollection;
use crate::device::{Device, SlotRegion, StandaloneTexture, TextureHandle};
use crate::error::{consistency_violation, ProviderError, ResourceError, ResourceResult};
use crate::payload::{SourceData, SymbolId, TilePayload};
use crate::state::{AtomicResourceState, ResourceState};
use crate::symbols::SymbolRegistry;
use crate::tile::{ResourceType, TileId, ZoomLevel};
use crate::worker::TaskHandle;

/// Device-side collaborators for upload and unload.
pub struct UploadContext<'a> {
    pub device: &'a Arc<dyn Device>,
    pub atlas: &'a AtlasAllocator,
    pub symbols: &'a SymbolRegistry,
}

/// Symbol texture owned by a Symbols entry.
#[derive(Debug)]
pub struct UploadedSymbol {
    pub id: SymbolId,
    pub order: i32,
    pub texture: StandaloneTexture,
}

/// Device data of an uploaded entry.
#[derive(Debug)]
pub enum DeviceResource {
    AtlasTile(TileOnAtlas),
    Standalone(StandaloneTexture),
    Symbols(Vec<UploadedSymbol>),
}

/// What the renderer needs to draw an uploaded tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuTile {
    pub texture: TextureHandle,
    /// Slot inside an atlas; `None` for a standalone texture.
    pub region: Option<SlotRegion>,
    pub retainable_metadata: Option<Bytes>,
}

fn validate_payload(tile: TileId, zoom: ZoomLevel, payload: &TilePayload) -> ResourceResult<()> {
    if payload.tile_size == 0 {
        return Err(ResourceError::InvalidPayload {
            tile,
            zoom,
            reason: "zero tile size".into(),
        });
    }
    if payload.padding > payload.tile_size {
        return Err(ResourceError::InvalidPayload {
            tile,
            zoom,
            reason: format!(
                "padding {} exceeds tile size {}",
                payload.padding, payload.tile_size
            ),
        });
    }
    if payload.pixels.len() != payload.expected_len() {
        return Err(ResourceError::InvalidPayload {
            tile,
            zoom,
            reason: format!(
                "{} pixel bytes, expected {}",
                payload.pixels.len(),
                payload.expected_len()
            ),
        });
    }
    Ok(())
}

pub struct ResourceEntry {
    resource_type: ResourceType,
    tile: TileId,
    zoom: ZoomLevel,
    state: AtomicResourceState,
    collection: Weak<ResourceCollection>,
    source_data: Mutex<Option<SourceData>>,
    device_resource: Mutex<Option<DeviceResource>>,
    retained_metadata: Mutex<Option<Bytes>>,
    request_task: Mutex<Option<TaskHandle>>,
    /// Consecutive cleanup passes that found this entry mid-transition.
    transient_passes: AtomicU32,
    #[cfg(test)]
    history: Mutex<Vec<ResourceState>>,
}

impl ResourceEntry {
    pub fn new(
        resource_type: ResourceType,
        tile: TileId,
        zoom: ZoomLevel,
        collection: Weak<ResourceCollection>,
    ) -> Self {
        Self {
            resource_type,
            tile,
            zoom,
            state: AtomicResourceState::new(ResourceState::Unknown),
            collection,
            source_data: Mutex::new(None),
            device_resource: Mutex::new(None),
            retained_metadata: Mutex::new(None),
            request_task: Mutex::new(None),
            transient_passes: AtomicU32::new(0),
            #[cfg(test)]
            history: Mutex::new(vec![ResourceState::Unknown]),
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn tile(&self) -> TileId {
        self.tile
    }

    pub fn zoom(&self) -> ZoomLevel {
        self.zoom
    }

    pub fn state(&self) -> ResourceState {
        self.state.load()
    }

    #[cfg(not(test))]
    pub fn try_transition(&self, expected: ResourceState, next: ResourceState) -> bool {
        self.state.try_transition(expected, next)
    }

    #[cfg(test)]
    pub fn try_transition(&self, expected: ResourceState, next: ResourceState) -> bool {
        // Held across the CAS so the history is in linearization order.
        let mut history = self.history.lock();
        let moved = self.state.try_transition(expected, next);
        if moved {
            history.push(next);
        }
        moved
    }

    #[cfg(test)]
    pub(crate) fn history(&self) -> Vec<ResourceState> {
        self.history.lock().clone()
    }

    pub fn collection(&self) -> Option<Arc<ResourceCollection>> {
        self.collection.upgrade()
    }

    /// Remove this exact entry from its collection, if still present.
    pub fn remove_from_collection(self: &Arc<Self>) -> bool {
        self.collection
            .upgrade()
            .is_some_and(|collection| collection.remove_entry(self))
    }

    pub(crate) fn set_request_task(&self, task: TaskHandle) {
        *self.request_task.lock() = Some(task);
    }

    pub(crate) fn clear_request_task(&self) {
        self.request_task.lock().take();
    }

    /// Ask the in-flight request, if any, to stop.
    pub(crate) fn cancel_request(&self) {
        if let Some(task) = self.request_task.lock().as_ref() {
            task.request_cancel();
        }
    }

    pub(crate) fn note_transient_pass(&self) -> u32 {
        self.transient_passes.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_transient_passes(&self) {
        self.transient_passes.store(0, Ordering::Release);
    }

    pub fn has_source_data(&self) -> bool {
        self.source_data.lock().is_some()
    }

    pub(crate) fn release_source_data(&self) {
        self.source_data.lock().take();
    }

    pub fn has_device_resource(&self) -> bool {
        self.device_resource.lock().is_some()
    }

    pub fn retained_metadata(&self) -> Option<Bytes> {
        self.retained_metadata.lock().clone()
    }

    /// Fetch data from the bound provider; runs on a worker thread.
    ///
    /// `Ok(false)` means the provider confirmed there is no usable data.
    pub fn obtain_data(&self) -> Result<bool, ProviderError> {
        let collection = self.collection.upgrade().ok_or(ProviderError::Unbound)?;
        if !collection.is_active() {
            return Err(ProviderError::Unbound);
        }

        let Some(data) = collection.provider().obtain(self.tile, self.zoom)? else {
            return Ok(false);
        };

        if let SourceData::Tile(payload) = &data {
            if let Err(e) = validate_payload(self.tile, self.zoom, payload) {
                tracing::warn!(error = %e, "discarding malformed tile");
                return Ok(false);
            }
        }

        *self.source_data.lock() = Some(data);
        Ok(true)
    }

    /// Move source data onto the device; only while `Uploading`.
    ///
    /// On failure the source data is kept for the next attempt.
    pub fn upload_to_gpu(&self, ctx: &UploadContext<'_>) -> ResourceResult<()> {
        let source = self
            .source_data
            .lock()
            .take()
            .ok_or(ResourceError::MissingSourceData)?;

        let uploaded = match &source {
            SourceData::Tile(payload) => upload_tile(ctx, payload),
            SourceData::Symbols(set) => set
                .symbols
                .iter()
                .map(|symbol| {
                    StandaloneTexture::upload(ctx.device, symbol.into()).map(|texture| {
                        UploadedSymbol {
                            id: symbol.id,
                            order: symbol.order,
                            texture,
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(DeviceResource::Symbols)
                .map_err(ResourceError::from),
        };

        let resource = match uploaded {
            Ok(resource) => resource,
            Err(e) => {
                *self.source_data.lock() = Some(source);
                return Err(e);
            }
        };

        if let DeviceResource::Symbols(symbols) = &resource {
            for symbol in symbols {
                ctx.symbols
                    .register(symbol.order, symbol.id, symbol.texture.handle());
            }
        }
        if let SourceData::Tile(payload) = source {
            *self.retained_metadata.lock() = payload.retainable_metadata;
        }

        let previous = self.device_resource.lock().replace(resource);
        if previous.is_some() {
            consistency_violation(&format!(
                "{:?} {}@{} uploaded twice",
                self.resource_type, self.tile, self.zoom
            ));
        }
        Ok(())
    }

    /// Release device data; only while `Unloading`.
    pub fn unload_from_gpu(&self, ctx: &UploadContext<'_>) {
        let Some(resource) = self.device_resource.lock().take() else {
            consistency_violation(&format!(
                "{:?} {}@{} unloaded without device resource",
                self.resource_type, self.tile, self.zoom
            ));
            return;
        };

        if let DeviceResource::Symbols(symbols) = &resource {
            for symbol in symbols {
                ctx.symbols
                    .unregister(symbol.order, symbol.id, symbol.texture.handle());
            }
        }
        drop(resource);
    }

    /// Texture to draw this entry with, when uploaded.
    pub fn gpu_tile(&self) -> Option<GpuTile> {
        if self.state() != ResourceState::Uploaded {
            return None;
        }
        let resource = self.device_resource.lock();
        let (texture, region) = match resource.as_ref()? {
            DeviceResource::AtlasTile(tile) => (tile.texture().handle(), Some(tile.region())),
            DeviceResource::Standalone(texture) => (texture.handle(), None),
            DeviceResource::Symbols(_) => return None,
        };
        Some(GpuTile {
            texture,
            region,
            retainable_metadata: self.retained_metadata(),
        })
    }
}

fn upload_tile(ctx: &UploadContext<'_>, payload: &TilePayload) -> ResourceResult<DeviceResource> {
    if ctx.atlas.config().tiles_per_atlas_side <= 1 {
        let texture = StandaloneTexture::upload(ctx.device, payload.into())?;
        return Ok(DeviceResource::Standalone(texture));
    }
    Ok(DeviceResource::AtlasTile(ctx.atlas.upload_tile(payload)?))
}

impl fmt::Debug for ResourceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceEntry")
            .field("type", &self.resource_type)
            .field("tile", &self.tile)
            .field("zoom", &self.zoom)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ResourceEntry {
    fn drop(&mut self) {
        if let Some(resource) = self.device_resource.get_mut().take() {
            consistency_violation(&format!(
                "{:?} {}@{} destroyed while holding device data",
                self.resource_type, self.tile, self.zoom
            ));
            drop(resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AtlasConfig;
    use crate::payload::PixelFormat;
    use crate::provider::BoundProvider;
    use crate::test_utils::{zoom, MockDevice, MockSymbolsProvider, MockTileProvider};
    use crate::tile::BindingSlot;

    struct Fixture {
        mock: Arc<MockDevice>,
        device: Arc<dyn Device>,
        atlas: AtlasAllocator,
        symbols: SymbolRegistry,
    }

    impl Fixture {
        fn new(tiles_per_side: u32) -> Self {
            let mock = Arc::new(MockDevice::new());
            let device: Arc<dyn Device> = mock.clone();
            let atlas = AtlasAllocator::new(
                Arc::clone(&device),
                AtlasConfig {
                    tiles_per_atlas_side: tiles_per_side,
                    ..AtlasConfig::default()
                },
            );
            Self {
                mock,
                device,
                atlas,
                symbols: SymbolRegistry::new(),
            }
        }

        fn ctx(&self) -> UploadContext<'_> {
            UploadContext {
                device: &self.device,
                atlas: &self.atlas,
                symbols: &self.symbols,
            }
        }
    }

    fn walk_to(entry: &ResourceEntry, path: &[ResourceState]) {
        let mut current = entry.state();
        for next in path {
            assert!(entry.try_transition(current, *next), "{current:?} -> {next:?}");
            current = *next;
        }
    }

    fn fetched(collection: &Arc<ResourceCollection>) -> Arc<ResourceEntry> {
        use ResourceState::*;
        let entry = collection.obtain_or_create(TileId::new(3, 5), zoom(8));
        walk_to(&entry, &[Requesting, Requested, ProcessingRequest]);
        assert_eq!(entry.obtain_data(), Ok(true));
        walk_to(&entry, &[Ready, Uploading]);
        entry
    }

    #[test]
    fn test_obtain_data_reports_absence() {
        let provider = MockTileProvider::all_available(4).with_missing(TileId::new(1, 1));
        let collection = ResourceCollection::new(
            BindingSlot::raster(0),
            BoundProvider::Tiled(Arc::new(provider)),
        );
        let entry = collection.obtain_or_create(TileId::new(1, 1), zoom(3));
        assert_eq!(entry.obtain_data(), Ok(false));
        assert!(!entry.has_source_data());
    }

    #[test]
    fn test_obtain_data_from_inactive_collection_fails() {
        let collection = ResourceCollection::new(
            BindingSlot::raster(0),
            BoundProvider::Tiled(Arc::new(MockTileProvider::all_available(4))),
        );
        let entry = collection.obtain_or_create(TileId::new(1, 1), zoom(3));
        collection.deactivate();
        assert_eq!(entry.obtain_data(), Err(ProviderError::Unbound));
    }

    #[test]
    fn test_malformed_tile_treated_as_absent() {
        let collection = ResourceCollection::new(
            BindingSlot::raster(0),
            BoundProvider::Tiled(Arc::new(MockTileProvider::all_available(4).with_bad_pixels())),
        );
        let entry = collection.obtain_or_create(TileId::new(1, 1), zoom(3));
        assert_eq!(entry.obtain_data(), Ok(false));
    }

    #[test]
    fn test_padding_larger_than_tile_rejected() {
        let tile = TilePayload::new(vec![0u8; 4 * 4 * 4], PixelFormat::Rgba8888, 4);
        let padded = tile.clone().with_padding(2);
        assert!(validate_payload(TileId::new(0, 0), zoom(2), &padded).is_ok());
        assert!(matches!(
            validate_payload(TileId::new(0, 0), zoom(2), &tile.with_padding(1 << 30)),
            Err(ResourceError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_upload_and_unload_atlas_tile() {
        use ResourceState::*;
        let fx = Fixture::new(4);
        let collection = ResourceCollection::new(
            BindingSlot::raster(0),
            BoundProvider::Tiled(Arc::new(MockTileProvider::all_available(4).with_metadata())),
        );
        let entry = fetched(&collection);

        entry.upload_to_gpu(&fx.ctx()).unwrap();
        walk_to(&entry, &[Uploaded]);
        assert!(!entry.has_source_data());
        let gpu = entry.gpu_tile().unwrap();
        assert!(gpu.region.is_some());
        assert!(gpu.retainable_metadata.is_some());
        assert_eq!(fx.mock.live_atlases(), 1);

        walk_to(&entry, &[Unloading]);
        entry.unload_from_gpu(&fx.ctx());
        walk_to(&entry, &[Unloaded, JustBeforeDeath]);
        assert!(!entry.has_device_resource());
        assert_eq!(fx.mock.live_textures(), 0);
        assert_eq!(
            entry.history(),
            vec![
                Unknown,
                Requesting,
                Requested,
                ProcessingRequest,
                Ready,
                Uploading,
                Uploaded,
                Unloading,
                Unloaded,
                JustBeforeDeath
            ]
        );
    }

    #[test]
    fn test_single_tile_per_side_uses_standalone() {
        let fx = Fixture::new(1);
        let collection = ResourceCollection::new(
            BindingSlot::elevation(),
            BoundProvider::Tiled(Arc::new(MockTileProvider::all_available(4))),
        );
        let entry = fetched(&collection);
        entry.upload_to_gpu(&fx.ctx()).unwrap();
        entry.try_transition(ResourceState::Uploading, ResourceState::Uploaded);

        assert_eq!(entry.gpu_tile().unwrap().region, None);
        assert_eq!(fx.mock.live_atlases(), 0);
        assert_eq!(fx.mock.live_textures(), 1);

        entry.try_transition(ResourceState::Uploaded, ResourceState::Unloading);
        entry.unload_from_gpu(&fx.ctx());
        assert_eq!(fx.mock.live_textures(), 0);
    }

    #[test]
    fn test_failed_upload_keeps_source_data() {
        let fx = Fixture::new(4);
        let collection = ResourceCollection::new(
            BindingSlot::raster(0),
            BoundProvider::Tiled(Arc::new(MockTileProvider::all_available(4))),
        );
        let entry = fetched(&collection);

        fx.mock.fail_allocations(true);
        assert!(entry.upload_to_gpu(&fx.ctx()).is_err());
        assert!(entry.has_source_data());
        assert!(!entry.has_device_resource());
        assert!(entry.try_transition(ResourceState::Uploading, ResourceState::Ready));
    }

    #[test]
    fn test_upload_without_data() {
        let fx = Fixture::new(4);
        let collection = ResourceCollection::new(
            BindingSlot::raster(0),
            BoundProvider::Tiled(Arc::new(MockTileProvider::all_available(4))),
        );
        let entry = collection.obtain_or_create(TileId::new(0, 0), zoom(1));
        assert!(matches!(
            entry.upload_to_gpu(&fx.ctx()),
            Err(ResourceError::MissingSourceData)
        ));
    }

    #[test]
    fn test_symbols_registered_and_unregistered() {
        let fx = Fixture::new(4);
        let collection = ResourceCollection::new(
            BindingSlot::symbols(),
            BoundProvider::Symbols(Arc::new(MockSymbolsProvider::new(3))),
        );
        let entry = fetched(&collection);

        entry.upload_to_gpu(&fx.ctx()).unwrap();
        assert_eq!(fx.symbols.len(), 3);
        assert_eq!(fx.mock.live_textures(), 3);
        entry.try_transition(ResourceState::Uploading, ResourceState::Uploaded);
        assert!(entry.gpu_tile().is_none());

        entry.try_transition(ResourceState::Uploaded, ResourceState::Unloading);
        entry.unload_from_gpu(&fx.ctx());
        assert!(fx.symbols.is_empty());
        assert_eq!(fx.mock.live_textures(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "internal consistency violation")]
    fn test_dropping_uploaded_entry_fails_loudly() {
        let fx = Fixture::new(1);
        let collection = ResourceCollection::new(
            BindingSlot::raster(0),
            BoundProvider::Tiled(Arc::new(MockTileProvider::all_available(4))),
        );
        let entry = fetched(&collection);
        entry.upload_to_gpu(&fx.ctx()).unwrap();

        assert!(collection.remove_entry(&entry));
        drop(entry);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "internal consistency violation")]
    fn test_unload_without_device_resource_fails_loudly() {
        let fx = Fixture::new(4);
        let collection = ResourceCollection::new(
            BindingSlot::raster(0),
            BoundProvider::Tiled(Arc::new(MockTileProvider::all_available(4))),
        );
        let entry = collection.obtain_or_create(TileId::new(0, 0), zoom(1));
        entry.unload_from_gpu(&fx.ctx());
    }

    #[test]
    fn test_partial_symbol_upload_frees_textures() {
        let fx = Fixture::new(4);
        let collection = ResourceCollection::new(
            BindingSlot::symbols(),
            BoundProvider::Symbols(Arc::new(MockSymbolsProvider::new(4))),
        );
        let entry = fetched(&collection);

        fx.mock.fail_allocations_after(2);
        assert!(entry.upload_to_gpu(&fx.ctx()).is_err());
        assert_eq!(fx.mock.live_textures(), 0);
        assert!(fx.symbols.is_empty());
        assert!(entry.has_source_data());
    }
}
