use std::sync::Arc;

use crate::evict::handler::{BackdropLowMemory, PageCache};
use crate::foundation::error::BackdropResult;
use crate::foundation::memory::{CostTier, LowMemoryHandler, MemoryArena, MemoryPool};
use crate::foundation::opts::BackdropOpts;
use crate::page::geometry::Geometry;
use crate::page::shared::SharedPageState;
use crate::resource::pool::ResourcePool;
use crate::spill::file::SpillFile;

/// Process-level owner of the backdrop cache: the cross-page resource pool and the low-memory
/// handler registration. Pages are created from it.
pub struct BackdropSystem {
    opts: BackdropOpts,
    arena: Arc<MemoryArena>,
    resources: Arc<ResourcePool>,
    handler: Arc<BackdropLowMemory>,
    registered: Arc<dyn LowMemoryHandler>,
}

impl std::fmt::Debug for BackdropSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackdropSystem")
            .field("opts", &self.opts)
            .field("arena", &self.arena)
            .finish_non_exhaustive()
    }
}

impl BackdropSystem {
    /// Validate `opts`, create the shared pool and register the low-memory handler.
    pub fn boot(opts: BackdropOpts, arena: Arc<MemoryArena>) -> BackdropResult<Self> {
        opts.validate()?;
        let resources = ResourcePool::new(Arc::clone(&arena));
        let handler = Arc::new(BackdropLowMemory::new());
        let registered: Arc<dyn LowMemoryHandler> = handler.clone();
        arena.register(&registered);
        tracing::debug!(limit = ?arena.limit(), "backdrop system booted");
        Ok(Self {
            opts,
            arena,
            resources,
            handler,
            registered,
        })
    }

    /// Options every page inherits.
    pub fn opts(&self) -> &BackdropOpts {
        &self.opts
    }

    /// Memory arena.
    pub fn arena(&self) -> &Arc<MemoryArena> {
        &self.arena
    }

    /// Cross-page resource pool.
    pub fn resources(&self) -> &Arc<ResourcePool> {
        &self.resources
    }

    /// Create the shared state for one page.
    ///
    /// The new page becomes the one the low-memory handler acts on. Pools already created are
    /// released again if a later step fails.
    #[tracing::instrument(skip(self))]
    pub fn create_shared(
        &self,
        width: u32,
        height: u32,
        region_height: u32,
        region_rows_per_band: u32,
        multi_threaded: bool,
    ) -> BackdropResult<SharedPageState> {
        let geometry = Geometry::new(
            width,
            height,
            region_height,
            region_rows_per_band,
            self.opts.block_width,
            self.opts.max_block_height,
        )?;
        let state_pool = MemoryPool::new(&self.arena, "backdrop-state", CostTier::Moderate)?;
        let data_pool = MemoryPool::new(&self.arena, "backdrop-data", CostTier::Moderate)?;
        let spill = if self.opts.spill.enabled {
            let dir = self
                .opts
                .spill
                .dir
                .clone()
                .unwrap_or_else(std::env::temp_dir);
            Some(SpillFile::open(&dir)?)
        } else {
            None
        };

        let cache = Arc::new(PageCache::new(spill));
        self.handler.attach(&cache);
        tracing::debug!(
            xblock = geometry.xblock,
            yblock = geometry.yblock,
            block_height = geometry.block_height,
            "backdrop page created"
        );
        Ok(SharedPageState::new(
            geometry,
            self.opts.clone(),
            multi_threaded,
            Arc::clone(&self.arena),
            Arc::clone(&self.resources),
            state_pool,
            data_pool,
            cache,
            Arc::clone(&self.handler),
        ))
    }

    /// Deregister the low-memory handler.
    pub fn shutdown(self) {
        self.arena.deregister(self.registered.name());
        tracing::debug!("backdrop system shut down");
    }
}

#[cfg(test)]
#[path = "../../tests/unit/page/system.rs"]
mod tests;
