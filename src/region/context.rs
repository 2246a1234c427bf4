use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backdrop::block::{BlockBody, BlockTable, Pixel};
use crate::backdrop::layer::LayerId;
use crate::evict::handler::PageCache;
use crate::evict::reserve::BackdropReserve;
use crate::foundation::core::DeviceBox;
use crate::foundation::error::{BackdropError, BackdropResult};
use crate::page::shared::SharedPageState;
use crate::resource::pool::{
    FixOutcome, OwnerId, ResourceClass, ResourceHandle, ResourceId, ResourcePool,
};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PendingSpan {
    pub(crate) layer: LayerId,
    pub(crate) y: i32,
    pub(crate) x1: i32,
    pub(crate) x2: i32,
    pub(crate) pixel: Pixel,
}

/// Merges adjacent identical spans on page layers into one write.
#[derive(Debug, Default)]
pub(crate) struct SpanCoalescer {
    pending: Option<PendingSpan>,
}

impl SpanCoalescer {
    /// Extend the pending span, or hand back the span that must be flushed first.
    pub(crate) fn push(&mut self, span: PendingSpan) -> Option<PendingSpan> {
        if let Some(p) = self.pending.as_mut()
            && p.layer == span.layer
            && p.y == span.y
            && p.x2 + 1 == span.x1
            && p.pixel == span.pixel
        {
            p.x2 = span.x2;
            return None;
        }
        self.pending.replace(span)
    }

    pub(crate) fn take(&mut self) -> Option<PendingSpan> {
        self.pending.take()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_none()
    }
}

pub(crate) struct ReadPin {
    pub(crate) table: Arc<BlockTable>,
    pub(crate) slot: usize,
}

#[derive(Default)]
pub(crate) struct ReaderState {
    pub(crate) bounds: Option<DeviceBox>,
    pub(crate) next: usize,
    pub(crate) current: Option<ReadPin>,
}

/// Per-worker compositing state: pinned resources, span coalescing, reader and reserves.
///
/// Dropping a context releases everything it still has pinned.
pub struct CompositeContext {
    pub(crate) owner: OwnerId,
    pub(crate) cache: Arc<PageCache>,
    pub(crate) resources: Arc<ResourcePool>,
    scratch: Option<ResourceHandle>,
    pub(crate) page_backdrop: LayerId,
    pub(crate) fixed: BTreeMap<ResourceId, ResourceHandle>,
    pub(crate) fixed_bounds: Option<DeviceBox>,
    pub(crate) fixed_depth: u32,
    pub(crate) coalesce: SpanCoalescer,
    pub(crate) band_bounds: Option<DeviceBox>,
    pub(crate) reader: ReaderState,
    pub(crate) reserves: Vec<BackdropReserve>,
}

impl std::fmt::Debug for CompositeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeContext")
            .field("owner", &self.owner)
            .field("page_backdrop", &self.page_backdrop)
            .field("fixed", &self.fixed.len())
            .field("fixed_bounds", &self.fixed_bounds)
            .field("fixed_depth", &self.fixed_depth)
            .finish_non_exhaustive()
    }
}

impl CompositeContext {
    /// Owner id under which this context pins resources.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Page layer this context composites into.
    pub fn page_backdrop(&self) -> LayerId {
        self.page_backdrop
    }

    /// Block-storage resources currently pinned.
    pub fn fixed_count(&self) -> usize {
        self.fixed.len()
    }

    /// Area the pinned resources cover.
    pub fn fixed_bounds(&self) -> Option<DeviceBox> {
        self.fixed_bounds
    }

    /// Resource levels per block the pin covers.
    pub fn fixed_depth(&self) -> u32 {
        self.fixed_depth
    }

    /// Area of the page layer initialized since the last `band_init`.
    pub fn band_bounds(&self) -> Option<DeviceBox> {
        self.band_bounds
    }

    /// Bytes held by forced reserves.
    pub fn reserved_bytes(&self) -> usize {
        self.reserves.iter().map(BackdropReserve::reserved).sum()
    }

    pub(crate) fn holds(&self, handle: &ResourceHandle) -> bool {
        self.fixed
            .get(&handle.id())
            .is_some_and(|h| h.same_buffer(handle))
    }

    pub(crate) fn free_reserves(&mut self) {
        self.reserves.clear();
    }

    pub(crate) fn release_fixed(&mut self) {
        for handle in self.fixed.values() {
            self.resources.release(handle);
        }
        self.fixed.clear();
        self.fixed_bounds = None;
        self.fixed_depth = 0;
    }

    /// Finish the block the reader handed out last.
    pub(crate) fn finish_read(&mut self) {
        let Some(pin) = self.reader.current.take() else {
            return;
        };
        let Ok(lock) = pin.table.slot(pin.slot) else {
            return;
        };
        let mut guard = lock.lock();
        let Some(block) = guard.as_mut() else {
            return;
        };
        block.read_pins = block.read_pins.saturating_sub(1);
        if let BlockBody::Loaded { slot, owner, .. } = block.body
            && owner == self.owner
        {
            let loaded = std::mem::replace(&mut block.body, BlockBody::Spilled(slot));
            if let BlockBody::Loaded { handle, .. } = loaded {
                self.resources.release(&handle);
            }
        }
    }
}

impl Drop for CompositeContext {
    fn drop(&mut self) {
        self.finish_read();
        self.release_fixed();
        if let Some(scratch) = self.scratch.take() {
            self.resources.release(&scratch);
        }
    }
}

impl SharedPageState {
    /// Create a compositing context for one worker, pinning its scratch resource.
    pub fn new_context(&self, page_backdrop: LayerId) -> BackdropResult<CompositeContext> {
        if !self.provision.is_ready() {
            return Err(BackdropError::validation(
                "provision resources before creating compositing contexts",
            ));
        }
        let page = self.layer(page_backdrop)?;
        if !page.composite_to_page() {
            return Err(BackdropError::validation(format!(
                "{page_backdrop:?} does not composite to the page"
            )));
        }

        let owner = OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed));
        let scratch = match self.resources.fix(
            ResourceClass::CompositeContext,
            owner,
            &[ResourceId(owner.0)],
            self.opts.fix_timeout(),
        )? {
            FixOutcome::Fixed(mut handles) => handles.pop(),
            FixOutcome::Exhausted => {
                return Err(BackdropError::allocation(format!(
                    "all {} compositing contexts are in use",
                    self.opts.max_workers
                )));
            }
        };

        Ok(CompositeContext {
            owner,
            cache: Arc::clone(&self.cache),
            resources: Arc::clone(&self.resources),
            scratch,
            page_backdrop,
            fixed: BTreeMap::new(),
            fixed_bounds: None,
            fixed_depth: 0,
            coalesce: SpanCoalescer::default(),
            band_bounds: None,
            reader: ReaderState::default(),
            reserves: Vec::new(),
        })
    }

    /// Release a context and everything it still pins.
    pub fn release_context(&self, ctx: CompositeContext) {
        if !ctx.fixed.is_empty() {
            tracing::warn!(
                owner = ctx.owner.0,
                fixed = ctx.fixed.len(),
                "releasing a context that still pins block resources"
            );
        }
        drop(ctx);
    }

    pub(crate) fn check_context(&self, ctx: &CompositeContext) -> BackdropResult<()> {
        if Arc::ptr_eq(&ctx.cache, &self.cache) {
            Ok(())
        } else {
            Err(BackdropError::validation(
                "compositing context belongs to another page",
            ))
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/region/context.rs"]
mod tests;
