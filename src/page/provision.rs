//! Sizing of the block-storage and compositing-context pools.
//!
//! Provisioning runs repeatedly while the page's transparency structure is still being
//! discovered (estimates) and once more after the layers exist (finalization). Estimates only
//! ever grow so that an unstable estimate does not thrash the pools.

use crate::backdrop::block::estimate_table_size;
use crate::foundation::error::{BackdropError, BackdropResult};
use crate::page::shared::SharedPageState;
use crate::resource::pool::ResourceClass;

/// Provisioned pool sizes for one page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Provisioning {
    /// Largest input colorant count.
    pub in_comps_max: usize,
    /// A non-isolated group exists (sticky while estimating).
    pub nonisolated: bool,
    /// Bytes per block-storage resource.
    pub table_size: usize,
    /// Configured ceiling on block-storage resources.
    pub n_lim: usize,
    /// Resources guaranteed to composite any single region.
    pub n_min: usize,
    /// Resources the pool may hold.
    pub n_max: usize,
    /// Bytes per compositing-context resource.
    pub context_size: usize,
    /// Set once finalized against the real layers.
    pub finalized: bool,
}

impl Provisioning {
    pub(crate) fn new(n_lim: usize) -> Self {
        Self {
            n_lim,
            ..Self::default()
        }
    }

    /// `true` once any provisioning call succeeded.
    pub fn is_ready(&self) -> bool {
        self.n_max > 0
    }
}

impl SharedPageState {
    /// Size the shared pools for this page.
    ///
    /// Before any layer exists the inputs are estimates: `in_comps_max` and the depth only
    /// raise the previous values and `nonisolated_present` sticks once seen. With layers
    /// present the call finalizes, using the exact values recorded at layer creation. Pool
    /// values are only committed once every resize succeeded.
    #[tracing::instrument(skip(self))]
    pub fn provision_resources(
        &mut self,
        in_comps_max: usize,
        nonisolated_present: bool,
        max_backdrop_depth: u32,
    ) -> BackdropResult<()> {
        if max_backdrop_depth == 0 {
            return Err(BackdropError::validation("backdrop depth must be >= 1"));
        }
        let prev = self.provision;
        let finalizing = !self.backdrops.is_empty();
        let geometry = self.geometry;
        let n_min_here = max_backdrop_depth as usize * geometry.block_rows_per_region as usize;

        let mut next = prev;
        if finalizing {
            next.in_comps_max = self.in_comps_max;
            next.nonisolated = self
                .live_layers()
                .any(|l| !l.is_isolated());
            next.table_size = self.layer_table_size;
            next.n_min = n_min_here;
            next.finalized = true;
        } else {
            next.in_comps_max = prev.in_comps_max.max(in_comps_max);
            next.nonisolated = prev.nonisolated || nonisolated_present;
            next.table_size = estimate_table_size(
                geometry.block_pixels(),
                next.in_comps_max,
                next.nonisolated,
            );
            next.n_min = prev.n_min.max(n_min_here);
        }

        next.n_max = next.n_min * geometry.region_rows_per_band as usize * geometry.xblock as usize;
        if next.n_lim > next.n_min && next.n_max > next.n_lim {
            next.n_max = next.n_lim;
        }

        if next.in_comps_max != prev.in_comps_max || next.n_max != prev.n_max {
            next.context_size = next.n_max * std::mem::size_of::<u64>()
                + next.in_comps_max * geometry.block_width as usize * std::mem::size_of::<f32>();
            self.resources
                .resize(ResourceClass::CompositeContext, next.context_size)?;
            self.resources
                .set_min_max(ResourceClass::CompositeContext, 0, self.opts.max_workers)?;
        }

        let mut force_bounds = false;
        if next.table_size != prev.table_size {
            self.resources
                .resize(ResourceClass::BlockStorage, next.table_size)?;
            force_bounds = true;
        }

        let bounds_changed = if finalizing {
            next.n_min != prev.n_min || next.n_max != prev.n_max
        } else {
            next.n_min > prev.n_min || next.n_max > prev.n_max
        };
        if force_bounds || bounds_changed {
            self.resources
                .set_min_max(ResourceClass::BlockStorage, next.n_min, next.n_max)?;
        }

        tracing::debug!(
            finalizing,
            in_comps = next.in_comps_max,
            table_size = next.table_size,
            n_min = next.n_min,
            n_max = next.n_max,
            "backdrop resources provisioned"
        );
        self.provision = next;
        Ok(())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/page/provision.rs"]
mod tests;
