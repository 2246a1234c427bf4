use std::path::PathBuf;
use std::time::Duration;

use crate::foundation::error::{BackdropError, BackdropResult};

/// Disk-spill configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SpillOpts {
    /// Open a spill file for every page so eviction can page blocks to disk.
    pub enabled: bool,
    /// Directory for spill files. `None` uses the system temp directory.
    pub dir: Option<PathBuf>,
}

/// Cache configuration shared by every page created from one [`BackdropSystem`](crate::BackdropSystem).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BackdropOpts {
    /// Block width in pixels. Must be a power of two.
    pub block_width: u32,
    /// Upper bound for the derived block height.
    pub max_block_height: u32,
    /// Ceiling on block-storage resources per page (`nLimResources`).
    pub resource_limit: usize,
    /// Disk-spill settings.
    pub spill: SpillOpts,
    /// Isolated groups start from full-intensity color instead of zero.
    pub opaque_only: bool,
    /// Page-compositing layers keep 16-bit output tables instead of 8-bit.
    pub output_16bit: bool,
    /// Number of compositing contexts that may exist at once.
    pub max_workers: usize,
    /// How long a resource fix waits for other contexts before reporting exhaustion.
    pub fix_timeout_ms: u64,
    /// Chunk size used when forcing a memory reserve.
    pub reserve_chunk_bytes: usize,
}

impl Default for BackdropOpts {
    fn default() -> Self {
        Self {
            block_width: 64,
            max_block_height: 64,
            resource_limit: 256,
            spill: SpillOpts::default(),
            opaque_only: false,
            output_16bit: false,
            max_workers: 8,
            fix_timeout_ms: 250,
            reserve_chunk_bytes: 64 * 1024,
        }
    }
}

impl BackdropOpts {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `BACKDROP_*` environment overrides. Unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("BACKDROP_RESOURCE_LIMIT") {
            self.resource_limit = n;
        }
        if let Some(n) = env_parse::<u32>("BACKDROP_BLOCK_WIDTH").filter(|n| n.is_power_of_two()) {
            self.block_width = n;
        }
        if let Some(n) = env_parse::<u32>("BACKDROP_MAX_BLOCK_HEIGHT").filter(|&n| n > 0) {
            self.max_block_height = n;
        }
        if let Ok(dir) = std::env::var("BACKDROP_SPILL_DIR")
            && !dir.is_empty()
        {
            self.spill = SpillOpts {
                enabled: true,
                dir: Some(PathBuf::from(dir)),
            };
        }
        self
    }

    /// Parse options from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> BackdropResult<Self> {
        let opts: Self = serde_json::from_str(json)
            .map_err(|e| BackdropError::validation(format!("invalid backdrop options: {e}")))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Check invariants the cache relies on.
    pub fn validate(&self) -> BackdropResult<()> {
        if !self.block_width.is_power_of_two() {
            return Err(BackdropError::validation(format!(
                "block_width must be a power of two, got {}",
                self.block_width
            )));
        }
        if self.max_block_height == 0 {
            return Err(BackdropError::validation("max_block_height must be > 0"));
        }
        if self.max_workers == 0 {
            return Err(BackdropError::validation("max_workers must be >= 1"));
        }
        if self.reserve_chunk_bytes == 0 {
            return Err(BackdropError::validation("reserve_chunk_bytes must be > 0"));
        }
        Ok(())
    }

    pub(crate) fn fix_timeout(&self) -> Duration {
        Duration::from_millis(self.fix_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/opts.rs"]
mod tests;
