use crate::cache::EntryData;
use crate::error::{PipeError, PipeResult};
use crate::module::ModuleFlags;
use crate::node::Node;
use crate::roi::Roi;
use crate::tiling;

use super::{view, view_mut, Executor};

/// Runs `node` on the host, tiled when the whole buffers exceed the host
/// memory limit. Returns whether tiling was used.
pub(super) fn process(
    executor: &Executor<'_>,
    node: &Node,
    roi_in: &Roi,
    input: &EntryData,
    output: &mut EntryData,
) -> PipeResult<bool> {
    let module = node.module();
    let roi_out = node.roi_out;
    let in_bytes = input.dsc.buffer_size(roi_in);
    let out_bytes = output.dsc.buffer_size(&roi_out);
    let limit = executor.services.config.pipeline.host_memory_limit_bytes;
    let req = module.tiling_callback(node.params(), roi_in, &roi_out);

    if req.fits(in_bytes, out_bytes, limit) {
        module
            .process(node.params(), view(input, roi_in), view_mut(output, &roi_out))
            .map_err(|err| PipeError::module(node.name(), err))?;
        return Ok(false);
    }

    if module.flags().contains(ModuleFlags::SUPPORTS_TILING) {
        let rows = tiling::rows_per_tile(
            &req,
            roi_in,
            input.dsc.bpp(),
            &roi_out,
            output.dsc.bpp(),
            limit,
        );
        tracing::debug!(
            "[dev_pixelpipe] {} tiled in stripes of {} rows ({} bytes needed, {} allowed)",
            node.name(),
            rows,
            req.required_bytes(in_bytes, out_bytes),
            limit
        );
        module
            .process_tiling(node.params(), view(input, roi_in), view_mut(output, &roi_out), &req, rows)
            .map_err(|err| PipeError::module(node.name(), err))?;
        return Ok(true);
    }

    tracing::warn!(
        "[dev_pixelpipe] {}, processing anyway",
        PipeError::CpuOversize {
            module: node.name().to_string()
        }
    );
    module
        .process(node.params(), view(input, roi_in), view_mut(output, &roi_out))
        .map_err(|err| PipeError::module(node.name(), err))?;
    Ok(false)
}
