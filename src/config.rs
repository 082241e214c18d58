//! Runtime configuration for the resources manager.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ResourceError, ResourceResult};

/// Env var overriding `worker_threads`.
pub const WORKER_THREADS_ENV: &str = "MAPTILE_WORKER_THREADS";

/// Env var enabling per-upload timing logs.
pub const UPLOAD_TIMING_ENV: &str = "MAPTILE_UPLOAD_TIMING";

/// Check if per-upload timing instrumentation is enabled via env var.
pub(crate) fn upload_timing_enabled() -> bool {
    std::env::var(UPLOAD_TIMING_ENV).is_ok_and(|v| v == "1" || v == "true")
}

/// Upper bound for `AtlasConfig::tiles_per_atlas_side`.
pub const MAX_TILES_PER_ATLAS_SIDE: u32 = 256;

/// Upper bound for `AtlasConfig::max_mip_levels`; enough for a 32768px side.
pub const MAX_MIP_LEVELS: u32 = 16;

/// How many entries one `upload_resources` call may upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadBudget {
    PerCall(usize),
    Unbounded,
}

impl UploadBudget {
    /// Whether `uploaded` entries already exhaust the budget.
    pub fn is_exhausted(self, uploaded: usize) -> bool {
        match self {
            UploadBudget::PerCall(limit) => uploaded >= limit,
            UploadBudget::Unbounded => false,
        }
    }
}

/// What drives an upload pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadTrigger {
    /// The render thread calls into the pipeline once per frame.
    PerFrame,
    /// A dedicated upload thread owns the device and sleeps until signalled.
    Wakeup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    pub budget: UploadBudget,
    pub trigger: UploadTrigger,
}

impl UploadConfig {
    /// One tile per frame on the render thread.
    pub fn render_thread() -> Self {
        Self {
            budget: UploadBudget::PerCall(1),
            trigger: UploadTrigger::PerFrame,
        }
    }

    /// Drain everything from a dedicated upload thread.
    pub fn dedicated_thread() -> Self {
        Self {
            budget: UploadBudget::Unbounded,
            trigger: UploadTrigger::Wakeup,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self::render_thread()
    }
}

/// Atlas packing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Target tiles per atlas side; 1 disables atlasing.
    pub tiles_per_atlas_side: u32,
    pub max_mip_levels: u32,
    pub generate_mipmaps: bool,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            tiles_per_atlas_side: 16,
            max_mip_levels: 1,
            generate_mipmaps: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Worker threads; `None` means available cores minus two (at least one).
    pub worker_threads: Option<usize>,
    pub upload: UploadConfig,
    pub atlas: AtlasConfig,
    /// Consecutive cleanup passes an entry may stay transient before a warning.
    pub transient_warning_passes: u32,
    /// Number of raster layers that may be bound at once.
    pub raster_layer_slots: u32,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            upload: UploadConfig::default(),
            atlas: AtlasConfig::default(),
            transient_warning_passes: 8,
            raster_layer_slots: 4,
        }
    }
}

impl ResourcesConfig {
    /// Load a JSON config file and apply env overrides.
    pub fn load(path: &Path) -> ResourceResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Parse JSON config and apply env overrides.
    pub fn from_json_str(content: &str) -> ResourceResult<Self> {
        let mut config: ResourcesConfig = serde_json::from_str(content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> ResourceResult<()> {
        if let Ok(value) = std::env::var(WORKER_THREADS_ENV) {
            self.worker_threads = Some(parse_worker_threads(&value)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> ResourceResult<()> {
        if self.worker_threads == Some(0) {
            return Err(ResourceError::Config("worker_threads must be at least 1".into()));
        }
        if self.upload.budget == UploadBudget::PerCall(0) {
            return Err(ResourceError::Config("per-call upload budget must be at least 1".into()));
        }
        if !(1..=MAX_TILES_PER_ATLAS_SIDE).contains(&self.atlas.tiles_per_atlas_side) {
            return Err(ResourceError::Config(format!(
                "tiles_per_atlas_side must be in 1..={MAX_TILES_PER_ATLAS_SIDE}"
            )));
        }
        if self.atlas.max_mip_levels > MAX_MIP_LEVELS {
            return Err(ResourceError::Config(format!(
                "max_mip_levels must not exceed {MAX_MIP_LEVELS}"
            )));
        }
        if self.raster_layer_slots == 0 {
            return Err(ResourceError::Config("raster_layer_slots must be at least 1".into()));
        }
        Ok(())
    }

    /// Worker pool size after defaults.
    pub fn effective_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(2))
                .unwrap_or(1)
                .max(1)
        })
    }
}

fn parse_worker_threads(value: &str) -> ResourceResult<usize> {
    value.trim().parse::<usize>().map_err(|_| {
        ResourceError::Config(format!("{WORKER_THREADS_ENV}={value:?} is not a thread count"))
    })
}
