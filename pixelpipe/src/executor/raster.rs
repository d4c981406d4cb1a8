//! Raster masks published by one node and consumed by a later one.

use crate::blend::RasterMask;
use crate::error::{PipeError, PipeResult};
use crate::module::resample_mask;
use crate::pipeline::Pipeline;

/// The mask `nodes[consumer]` blends with, carried into its output geometry.
///
/// A provider that ran but has no current mask (its output came from the
/// cache, or was computed for other ROIs) requests a re-run with the cache
/// flushed, owned by the consumer's mask hash.
pub(super) fn lookup(pipe: &Pipeline, consumer: usize) -> PipeResult<RasterMask> {
    let nodes = &pipe.nodes;
    let node = &nodes[consumer];
    let missing = || PipeError::MaskMissing {
        module: node.name().to_string(),
    };

    let Some(source) = node.blend().raster_source.as_ref() else {
        return Err(missing());
    };
    let Some(provider_idx) = nodes.iter().position(|n| n.name() == source.module) else {
        tracing::warn!(
            "[dev_pixelpipe] {} takes its mask from {}, which is not in the pipe",
            node.name(),
            source.module
        );
        return Err(missing());
    };
    let provider = &nodes[provider_idx];
    if provider_idx >= consumer || !provider.is_active() {
        tracing::warn!(
            "[dev_pixelpipe] mask source {} of {} is disabled or placed after it",
            provider.name(),
            node.name()
        );
        return Err(missing());
    }

    let mask = match provider.raster_mask(source.mask_id) {
        Some(mask) if mask.roi == provider.roi_out => mask,
        stale => {
            let owner = node.global_mask_hash;
            tracing::warn!(
                "[dev_pixelpipe] {} mask {} of {} for {}, re-running without cache",
                if stale.is_some() { "stale" } else { "no" },
                source.mask_id,
                provider.name(),
                node.name()
            );
            if pipe.reentry().set(owner) {
                pipe.request_flush_cache();
            }
            return Err(missing());
        }
    };
    pipe.reentry().clear(node.global_mask_hash);

    let mut roi = mask.roi;
    let mut data = mask.data.as_ref().clone();
    for step in nodes[provider_idx + 1..=consumer].iter().filter(|n| n.is_active()) {
        let module = step.module();
        data = if module.is_distorting() {
            module.distort_mask(step.params(), &data, &roi, &step.roi_out)
        } else {
            resample_mask(&data, &roi, &step.roi_out)
        };
        roi = step.roi_out;
    }
    Ok(RasterMask::new(roi, data))
}
