//! JIT-compiled sparse-length-sum (SLS) kernels over 2- and 4-bit
//! row-quantized embedding tables.
//!
//! Each table row stores packed low-bit unsigned lanes followed by an fp16
//! scale and bias. A generated kernel sums an optionally weighted,
//! optionally length-normalized selection of dequantized rows into one
//! fp32 output row per segment, bounds-checking every index and the
//! aggregate segment lengths.
//!
//! Kernels are specialized at runtime on
//! `{bit_rate, block_size, has_weight, is_weight_positional,
//! normalize_by_lengths, prefetch}` plus the index width and the
//! rowwise-sparse flag, emitted for AVX-512 or AVX2 with iced-x86, and
//! cached by signature for the lifetime of the process. Hosts without
//! AVX2 get the scalar reference kernel behind the same handle.
//!
//! ```
//! use sls_kernels::{generate_embedding_sls_nbit, quantize_table_nbit};
//!
//! let table: Vec<f32> = (0..3 * 8).map(|i| i as f32).collect();
//! let packed = quantize_table_nbit(4, 3, 8, &table);
//! let kernel = generate_embedding_sls_nbit::<i64>(4, 8, false, false, 0, false).unwrap();
//!
//! let mut out = vec![0f32; 8];
//! let ok = kernel
//!     .execute(3, &packed, &[0i64, 2], &[2], None, &mut out)
//!     .unwrap();
//! assert!(ok);
//! ```

pub mod cache;
#[cfg(target_arch = "x86_64")]
pub mod executable;
pub mod isa;
#[cfg(target_arch = "x86_64")]
mod jit;
pub mod kernel;
pub mod scalar;
pub mod types;

pub use isa::{detect_isa, IsaLevel};
pub use kernel::{
    generate_embedding_sls_nbit, generate_embedding_sls_nbit_rowwise_sparse, SlsKernel,
    SlsRowwiseKernel,
};
pub use scalar::{
    embedding_sls_nbit_ref, embedding_sls_nbit_rowwise_sparse_ref, quantize_row_nbit,
    quantize_table_nbit,
};
pub use types::{
    fused_row_width, KernelError, KernelSignature, RowwiseKernelFn, SlsIndex, StandardKernelFn,
};
