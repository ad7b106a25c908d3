//! Scalar reference kernels and row packing helpers.
//!
//! These serve as:
//! 1. Golden reference for correctness testing of the generated code.
//! 2. Fallback path when neither AVX2 nor AVX-512 is available.
//!
//! Semantics match the generated kernels exactly: the same bounds checks,
//! the same `false` returns, the same treatment of absent rows and
//! positional weights.

use half::f16;

use crate::types::{ceil_div, elems_per_byte, fused_row_width, SlsIndex};

/// Sparse-length sum over an N-bit row-quantized table.
///
/// `out` is written row-major, one `block_size` row per segment. Returns
/// `false` (leaving `out` unspecified) when any index is out of
/// `[0, data_size)` or the lengths do not partition the index stream.
///
/// Panics if `input`/`out`/`weights` are shorter than the geometry implies;
/// the public kernel wrappers validate that before calling.
#[allow(clippy::too_many_arguments)]
pub fn embedding_sls_nbit_ref<I: SlsIndex>(
    bit_rate: u8,
    block_size: usize,
    data_size: usize,
    input: &[u8],
    indices: &[I],
    lengths: &[i32],
    weights: Option<&[f32]>,
    normalize_by_lengths: bool,
    is_weight_positional: bool,
    out: &mut [f32],
) -> bool {
    sls_nbit_ref_impl(
        bit_rate,
        block_size,
        data_size,
        input,
        indices,
        lengths,
        weights,
        normalize_by_lengths,
        is_weight_positional,
        out,
        None,
    )
}

/// Rowwise-sparse variant: indices address a `data_size`-row uncompressed
/// namespace and are redirected through `compressed_indices_table`, whose
/// entries are either compressed row indices into `input` or `-1` meaning
/// the row is absent and contributes nothing.
#[allow(clippy::too_many_arguments)]
pub fn embedding_sls_nbit_rowwise_sparse_ref<I: SlsIndex>(
    bit_rate: u8,
    block_size: usize,
    uncompressed_data_size: usize,
    input: &[u8],
    indices: &[I],
    compressed_indices_table: &[I],
    lengths: &[i32],
    weights: Option<&[f32]>,
    normalize_by_lengths: bool,
    is_weight_positional: bool,
    out: &mut [f32],
) -> bool {
    sls_nbit_ref_impl(
        bit_rate,
        block_size,
        uncompressed_data_size,
        input,
        indices,
        lengths,
        weights,
        normalize_by_lengths,
        is_weight_positional,
        out,
        Some(compressed_indices_table),
    )
}

#[allow(clippy::too_many_arguments)]
fn sls_nbit_ref_impl<I: SlsIndex>(
    bit_rate: u8,
    block_size: usize,
    data_size: usize,
    input: &[u8],
    indices: &[I],
    lengths: &[i32],
    weights: Option<&[f32]>,
    normalize_by_lengths: bool,
    is_weight_positional: bool,
    out: &mut [f32],
    compressed_indices_table: Option<&[I]>,
) -> bool {
    assert!(bit_rate == 2 || bit_rate == 4, "bit_rate must be 2 or 4");
    let epb = elems_per_byte(bit_rate);
    let packed_len = ceil_div(block_size, epb);
    let fused = fused_row_width(bit_rate, block_size);
    let lane_mask = (1u8 << bit_rate) - 1;

    let index_size = indices.len();
    let mut pos = 0usize;

    for (seg, &len) in lengths.iter().enumerate() {
        // A negative length cannot partition the index stream.
        if len < 0 || pos as i64 + len as i64 > index_size as i64 {
            return false;
        }
        let len = len as usize;

        let out_row = &mut out[seg * block_size..(seg + 1) * block_size];
        out_row.fill(0.0);

        for j in 0..len {
            let idx = indices[pos].to_i64();
            if idx < 0 || idx >= data_size as i64 {
                return false;
            }

            let w = weights.map(|ws| ws[if is_weight_positional { j } else { pos }]);
            pos += 1;

            let row_idx = match compressed_indices_table {
                Some(table) => {
                    let compressed = table[idx as usize].to_i64();
                    if compressed == -1 {
                        continue;
                    }
                    compressed as usize
                }
                None => idx as usize,
            };

            let row = &input[row_idx * fused..row_idx * fused + fused];
            let mut scale =
                f16::from_bits(u16::from_le_bytes([row[packed_len], row[packed_len + 1]]))
                    .to_f32();
            let mut bias =
                f16::from_bits(u16::from_le_bytes([row[packed_len + 2], row[packed_len + 3]]))
                    .to_f32();
            if let Some(w) = w {
                scale *= w;
                bias *= w;
            }

            for (d, o) in out_row.iter_mut().enumerate() {
                let q = (row[d / epb] >> ((d % epb) as u8 * bit_rate)) & lane_mask;
                *o += q as f32 * scale + bias;
            }
        }

        if normalize_by_lengths && len > 0 {
            let inv = 1.0 / len as f32;
            for o in out_row.iter_mut() {
                *o *= inv;
            }
        }
    }

    pos == index_size
}

/// Quantize one f32 row into the fused N-bit layout: packed lanes followed
/// by fp16 scale and bias. Scale and bias are rounded through fp16 before
/// quantizing so that dequantization with the stored trailer reproduces the
/// row as closely as the format allows.
pub fn quantize_row_nbit(bit_rate: u8, row: &[f32]) -> Vec<u8> {
    assert!(bit_rate == 2 || bit_rate == 4, "bit_rate must be 2 or 4");
    assert!(!row.is_empty());
    let epb = elems_per_byte(bit_rate);
    let packed_len = ceil_div(row.len(), epb);
    let qmax = ((1u32 << bit_rate) - 1) as f32;

    let min = row.iter().copied().fold(f32::INFINITY, f32::min);
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    let scale16 = f16::from_f32(if range > 0.0 { range / qmax } else { 1.0 });
    let bias16 = f16::from_f32(min);
    let scale = scale16.to_f32();
    let bias = bias16.to_f32();

    let mut fused = vec![0u8; packed_len + 4];
    for (i, &v) in row.iter().enumerate() {
        let q = (((v - bias) / scale).round()).clamp(0.0, qmax) as u8;
        fused[i / epb] |= q << ((i % epb) as u8 * bit_rate);
    }
    fused[packed_len..packed_len + 2].copy_from_slice(&scale16.to_bits().to_le_bytes());
    fused[packed_len + 2..packed_len + 4].copy_from_slice(&bias16.to_bits().to_le_bytes());
    fused
}

/// Quantize a row-major f32 table into a contiguous fused N-bit buffer.
pub fn quantize_table_nbit(bit_rate: u8, rows: usize, block_size: usize, data: &[f32]) -> Vec<u8> {
    assert_eq!(data.len(), rows * block_size);
    let fused = fused_row_width(bit_rate, block_size);
    let mut out = Vec::with_capacity(rows * fused);
    for r in 0..rows {
        out.extend_from_slice(&quantize_row_nbit(
            bit_rate,
            &data[r * block_size..(r + 1) * block_size],
        ));
    }
    out
}
