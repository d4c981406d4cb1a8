//! Row-parallel helpers over interleaved pixel buffers.

use rayon::prelude::*;


/// Multiplier for number of chunks relative to CPU threads.
/// Using 3x threads gives good balance when some chunks finish faster.
const CHUNKS_PER_THREAD: usize = 3;

#[inline]
fn auto_chunk_size(len: usize) -> usize {
    let num_chunks = rayon::current_num_threads() * CHUNKS_PER_THREAD;
    (len / num_chunks).max(1)
}

/// Calls `f(first_row, rows)` in parallel over row-aligned chunks of `data`.
///
/// `row_len` is the number of elements per row. Trailing elements that do not
/// form a full row are handed to the last chunk.
pub fn for_each_row_chunk<T, F>(data: &mut [T], row_len: usize, f: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Send + Sync,
{
    if data.is_empty() || row_len == 0 {
        return;
    }

    let rows = data.len().div_ceil(row_len);
    let chunk_rows = auto_chunk_size(rows);
    data.par_chunks_mut(row_len * chunk_rows)
        .enumerate()
        .for_each(|(idx, chunk)| f(idx * chunk_rows, chunk));
}

/// Calls `f` on every `channels`-wide pixel of `data`, in parallel.
pub fn for_each_pixel<T, F>(data: &mut [T], channels: usize, f: F)
where
    T: Send,
    F: Fn(&mut [T]) + Send + Sync,
{
    if channels == 0 {
        return;
    }

    let pixels = data.len() / channels;
    let chunk_pixels = auto_chunk_size(pixels);
    data.par_chunks_mut(channels * chunk_pixels)
        .for_each(|chunk| chunk.chunks_exact_mut(channels).for_each(&f));
}
