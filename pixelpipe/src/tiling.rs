//! Row-stripe tiling for modules whose working set exceeds the host budget.
//!
//! Buffers are row-major without padding, so a stripe of rows is a plain
//! subslice of the buffer: tiles need no staging copies.

use crate::buffer::{PixelView, PixelViewMut};
use crate::error::{ModuleError, ModuleResult};
use crate::roi::Roi;

/// What a module needs in memory to run over a given ROI pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TilingRequirements {
    /// Total memory as a multiple of the larger of input and output buffer.
    pub factor: f32,
    /// Fixed memory on top of `factor`, in bytes.
    pub overhead: usize,
    /// Rows of context needed above and below each output row.
    pub overlap: usize,
    /// Largest single intermediate buffer as a multiple of the input buffer.
    pub maxbuf: f32,
}

impl Default for TilingRequirements {
    fn default() -> Self {
        Self {
            factor: 2.0,
            overhead: 0,
            overlap: 0,
            maxbuf: 1.0,
        }
    }
}

impl TilingRequirements {
    pub fn required_bytes(&self, in_bytes: usize, out_bytes: usize) -> usize {
        (in_bytes.max(out_bytes) as f64 * self.factor as f64) as usize + self.overhead
    }

    /// Whether the whole-buffer call fits `limit` bytes; 0 means no limit.
    pub fn fits(&self, in_bytes: usize, out_bytes: usize, limit: usize) -> bool {
        limit == 0 || self.required_bytes(in_bytes, out_bytes) <= limit
    }
}

/// Output rows per stripe so one stripe stays within `limit` bytes.
pub fn rows_per_tile(req: &TilingRequirements, input: &Roi, in_bpp: usize, output: &Roi, out_bpp: usize, limit: usize) -> usize {
    if limit == 0 || output.height == 0 {
        return output.height.max(1);
    }

    let in_row = (input.width * in_bpp) as f64;
    let out_row = (output.width * out_bpp) as f64;
    let in_rows_per_out = input.height as f64 / output.height as f64;
    let factor = req.factor.max(1.0) as f64;

    let per_row = (in_row * in_rows_per_out).max(out_row) * factor;
    let fixed = req.overhead as f64 + 2.0 * req.overlap as f64 * in_row * factor;
    let rows = ((limit as f64 - fixed) / per_row).floor();

    if rows < 1.0 {
        1
    } else {
        (rows as usize).min(output.height)
    }
}

/// Maps output row `row` (relative to `output`) onto an input row index.
fn input_row(input: &Roi, output: &Roi, row: usize) -> f64 {
    let absolute = (output.y as f64 + row as f64) / output.scale as f64 * input.scale as f64;
    absolute - input.y as f64
}

/// Runs `f` over horizontal stripes of `output`, each paired with the input
/// rows it depends on plus `overlap` rows of context.
pub fn process_tiled<F>(
    input: PixelView<'_>,
    output: PixelViewMut<'_>,
    overlap: usize,
    tile_rows: usize,
    mut f: F,
) -> ModuleResult<()>
where
    F: FnMut(PixelView<'_>, PixelViewMut<'_>) -> ModuleResult<()>,
{
    let (in_roi, out_roi) = (input.roi, output.roi);
    let in_stride = in_roi.width * input.dsc.bpp();
    let out_stride = out_roi.width * output.dsc.bpp();
    if input.data.len() < in_stride * in_roi.height || output.data.len() < out_stride * out_roi.height {
        return Err(ModuleError::Failed("tiling over a buffer smaller than its ROI".into()));
    }

    let tile_rows = tile_rows.clamp(1, out_roi.height.max(1));
    let out_data = &mut output.data[..out_stride * out_roi.height];
    tracing::trace!(
        "[pixelpipe] tiling {}x{} into stripes of {} rows",
        out_roi.width,
        out_roi.height,
        tile_rows
    );

    for (idx, out_tile) in out_data.chunks_mut(out_stride * tile_rows).enumerate() {
        let first = idx * tile_rows;
        let rows = out_tile.len() / out_stride.max(1);

        let start = input_row(&in_roi, &out_roi, first).floor() - overlap as f64;
        let end = input_row(&in_roi, &out_roi, first + rows).ceil() + overlap as f64;
        let start = start.clamp(0.0, in_roi.height as f64) as usize;
        let end = (end.clamp(0.0, in_roi.height as f64) as usize).max(start);

        let tile_in = PixelView::new(
            &input.data[start * in_stride..end * in_stride],
            input.dsc,
            Roi::new(in_roi.x, in_roi.y + start as i32, in_roi.width, end - start, in_roi.scale),
        );
        let tile_out = PixelViewMut::new(
            out_tile,
            output.dsc,
            Roi::new(out_roi.x, out_roi.y + first as i32, out_roi.width, rows, out_roi.scale),
        );
        f(tile_in, tile_out)?;
    }
    Ok(())
}
