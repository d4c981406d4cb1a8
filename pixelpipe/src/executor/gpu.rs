use std::sync::Arc;

use crate::cache::{CacheEntry, EntryData};
use crate::device::{DeviceId, ImageFlags};
use crate::error::{DeviceError, PipeError, PipeResult};
use crate::module::{GpuImage, GpuTask};
use crate::node::Node;
use crate::sidecar::{Sidecar, Transfer};

use super::{Executor, NodeOutput};

/// Runs `node` on `device`, reading from the input entry and writing the
/// result back into `output`.
///
/// Both device images are pinned to their host buffers and parked in the
/// entries' sidecars afterwards, so a following run over the same buffers can
/// skip allocation and, when the colorspace still matches, the upload.
pub(super) fn process(
    executor: &Executor<'_>,
    device: DeviceId,
    node: &Node,
    input: &NodeOutput,
    in_data: &EntryData,
    out_entry: &Arc<CacheEntry>,
    output: &mut EntryData,
) -> PipeResult<()> {
    let services = executor.services;
    let Some(layer) = services.device.as_ref() else {
        return Err(DeviceError::Unavailable(device).into());
    };
    let sidecar = Sidecar::new(layer, &services.cache, device);
    let roi_in = input.roi;
    let roi_out = node.roi_out;
    let in_dsc = in_data.dsc;
    let out_dsc = output.dsc;
    let (in_bpp, out_bpp) = (in_dsc.bpp(), out_dsc.bpp());

    let in_host = in_data.host_ptr();
    let acquired = sidecar.acquire(
        Some(input.entry.as_ref()),
        in_host,
        roi_in.width,
        roi_in.height,
        in_bpp,
        ImageFlags::READ_ONLY,
    )?;
    if acquired.reused == Some(in_dsc.cst) {
        tracing::trace!("[opencl_pixelpipe] {} input already on device", node.name());
    } else if sidecar.is_true_zero_copy(&acquired.image, in_host, roi_in.width, roi_in.height, in_bpp) {
        // The device reads the host buffer in place; the input read lock stays
        // held until the kernel is done.
        tracing::trace!("[opencl_pixelpipe] {} input is zero-copy", node.name());
    } else {
        let size = in_dsc.buffer_size(&roi_in);
        sidecar.sync(
            &acquired.image,
            Transfer::HostToDevice(&in_data.bytes()[..size]),
            roi_in.width,
            roi_in.height,
            in_bpp,
        )?;
    }

    let out_host = output.host_ptr();
    let target = sidecar.acquire(
        Some(out_entry.as_ref()),
        out_host,
        roi_out.width,
        roi_out.height,
        out_bpp,
        ImageFlags::WRITE_ONLY,
    )?;

    let task = GpuTask { layer, device };
    node.module()
        .process_gpu(
            &task,
            node.params(),
            GpuImage {
                image: &acquired.image,
                dsc: in_dsc,
                roi: roi_in,
            },
            GpuImage {
                image: &target.image,
                dsc: out_dsc,
                roi: roi_out,
            },
        )
        .map_err(|err| PipeError::module(node.name(), err))?;

    let size = out_dsc.buffer_size(&roi_out);
    sidecar.sync(
        &target.image,
        Transfer::DeviceToHost(&mut output.bytes_mut()[..size]),
        roi_out.width,
        roi_out.height,
        out_bpp,
    )?;
    layer.finish(device)?;

    sidecar.release(acquired.image, Some(input.entry.as_ref()), in_host, in_dsc.cst);
    sidecar.release(target.image, Some(out_entry.as_ref()), out_host, out_dsc.cst);
    Ok(())
}
