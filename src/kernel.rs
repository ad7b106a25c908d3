//! Kernel handles and the factory that builds them.
//!
//! The factory dispatches on the detected ISA (AVX-512 preferred, then
//! AVX2), compiles the requested kernel through the per-`(index width,
//! rowwise)` cache, and wraps the entry point in a handle that validates
//! buffer geometry before the call. Without AVX2 the handle runs the
//! scalar reference kernel with identical semantics.

use std::sync::OnceLock;

use crate::cache::KernelCache;
#[cfg(target_arch = "x86_64")]
use crate::cache::CodePtr;
use crate::scalar;
use crate::types::{
    fused_row_width, KernelError, KernelSignature, RowwiseKernelFn, SlsIndex, StandardKernelFn,
};

#[derive(Debug, Clone, Copy)]
struct KernelConfig {
    bit_rate: u8,
    block_size: usize,
    has_weight: bool,
    normalize_by_lengths: bool,
    is_weight_positional: bool,
}

enum StandardImpl<I: SlsIndex> {
    Jit(StandardKernelFn<I>),
    Reference,
}

enum RowwiseImpl<I: SlsIndex> {
    Jit(RowwiseKernelFn<I>),
    Reference,
}

/// A compiled (or scalar-fallback) standard SLS kernel.
pub struct SlsKernel<I: SlsIndex> {
    imp: StandardImpl<I>,
    cfg: KernelConfig,
}

/// A compiled (or scalar-fallback) rowwise-sparse SLS kernel.
pub struct SlsRowwiseKernel<I: SlsIndex> {
    imp: RowwiseImpl<I>,
    cfg: KernelConfig,
}

/// One cache instance per `(index_width, rowwise_sparse)` pair; the
/// signature tuple keys entries within an instance.
fn kernel_cache(wide_index: bool, rowwise_sparse: bool) -> &'static KernelCache {
    static STD_32: OnceLock<KernelCache> = OnceLock::new();
    static STD_64: OnceLock<KernelCache> = OnceLock::new();
    static RWS_32: OnceLock<KernelCache> = OnceLock::new();
    static RWS_64: OnceLock<KernelCache> = OnceLock::new();
    let cell = match (wide_index, rowwise_sparse) {
        (false, false) => &STD_32,
        (true, false) => &STD_64,
        (false, true) => &RWS_32,
        (true, true) => &RWS_64,
    };
    cell.get_or_init(KernelCache::new)
}

fn check_preconditions(bit_rate: u8, block_size: usize) {
    assert!(bit_rate == 2 || bit_rate == 4, "bit_rate must be 2 or 4");
    assert!(block_size > 0, "block_size must be positive");
}

#[cfg(target_arch = "x86_64")]
fn compiled_entry<I: SlsIndex>(
    sig: KernelSignature,
    rowwise_sparse: bool,
) -> Option<Result<CodePtr, KernelError>> {
    let isa = crate::isa::detect_isa()?;
    let entry = kernel_cache(I::IS_WIDE, rowwise_sparse).get_or_create(sig, || {
        match crate::jit::compile_and_install::<I>(isa, &sig, rowwise_sparse) {
            Ok(p) => Some(CodePtr(p)),
            Err(e) => {
                log::error!("sls kernel compilation failed: {e}");
                None
            }
        }
    });
    Some(entry.ok_or_else(|| {
        KernelError::CodegenFailed("compilation failed for this kernel signature".into())
    }))
}

/// Build a standard SLS kernel for a 2- or 4-bit quantized table.
///
/// Panics when `bit_rate` is not 2 or 4 or `block_size` is zero. Falls
/// back to the scalar reference kernel when neither AVX2 nor AVX-512 is
/// available.
pub fn generate_embedding_sls_nbit<I: SlsIndex>(
    bit_rate: u8,
    block_size: usize,
    has_weight: bool,
    normalize_by_lengths: bool,
    prefetch: usize,
    is_weight_positional: bool,
) -> Result<SlsKernel<I>, KernelError> {
    check_preconditions(bit_rate, block_size);
    let cfg = KernelConfig {
        bit_rate,
        block_size,
        has_weight,
        normalize_by_lengths,
        is_weight_positional,
    };

    #[cfg(target_arch = "x86_64")]
    {
        let sig = KernelSignature {
            bit_rate,
            block_size,
            has_weight,
            is_weight_positional,
            normalize_by_lengths,
            prefetch,
        };
        if let Some(entry) = compiled_entry::<I>(sig, false) {
            let entry = entry?;
            let f = unsafe { std::mem::transmute::<*const u8, StandardKernelFn<I>>(entry.0) };
            return Ok(SlsKernel {
                imp: StandardImpl::Jit(f),
                cfg,
            });
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = prefetch;

    log::warn!("AVX2/AVX-512 unavailable, using the scalar sparse-length-sum reference");
    Ok(SlsKernel {
        imp: StandardImpl::Reference,
        cfg,
    })
}

/// Build a rowwise-sparse SLS kernel: indices address an uncompressed row
/// namespace and are redirected through a compressed-index table whose
/// `-1` entries mark absent rows.
pub fn generate_embedding_sls_nbit_rowwise_sparse<I: SlsIndex>(
    bit_rate: u8,
    block_size: usize,
    has_weight: bool,
    normalize_by_lengths: bool,
    prefetch: usize,
    is_weight_positional: bool,
) -> Result<SlsRowwiseKernel<I>, KernelError> {
    check_preconditions(bit_rate, block_size);
    let cfg = KernelConfig {
        bit_rate,
        block_size,
        has_weight,
        normalize_by_lengths,
        is_weight_positional,
    };

    #[cfg(target_arch = "x86_64")]
    {
        let sig = KernelSignature {
            bit_rate,
            block_size,
            has_weight,
            is_weight_positional,
            normalize_by_lengths,
            prefetch,
        };
        if let Some(entry) = compiled_entry::<I>(sig, true) {
            let entry = entry?;
            let f = unsafe { std::mem::transmute::<*const u8, RowwiseKernelFn<I>>(entry.0) };
            return Ok(SlsRowwiseKernel {
                imp: RowwiseImpl::Jit(f),
                cfg,
            });
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = prefetch;

    log::warn!("AVX2/AVX-512 unavailable, using the scalar sparse-length-sum reference");
    Ok(SlsRowwiseKernel {
        imp: RowwiseImpl::Reference,
        cfg,
    })
}

impl KernelConfig {
    /// Shared geometry validation; returns the weights pointer to pass on.
    fn validate(
        &self,
        data_rows: usize,
        input: &[u8],
        indices_len: usize,
        lengths_len: usize,
        weights: Option<&[f32]>,
        out_len: usize,
    ) -> Result<*const f32, KernelError> {
        let fused = fused_row_width(self.bit_rate, self.block_size);
        if input.len() < data_rows * fused {
            return Err(KernelError::InvalidArgs(format!(
                "input holds {} bytes but {} rows of {} bytes were promised",
                input.len(),
                data_rows,
                fused
            )));
        }
        if out_len < lengths_len * self.block_size {
            return Err(KernelError::InvalidArgs(format!(
                "out holds {} floats, need {}",
                out_len,
                lengths_len * self.block_size
            )));
        }
        if self.has_weight {
            let w = weights.ok_or_else(|| {
                KernelError::InvalidArgs("kernel was built with weights but none were given".into())
            })?;
            if w.len() < indices_len {
                return Err(KernelError::InvalidArgs(format!(
                    "weights holds {} floats, need {}",
                    w.len(),
                    indices_len
                )));
            }
            Ok(w.as_ptr())
        } else {
            Ok(std::ptr::null())
        }
    }
}

impl<I: SlsIndex> SlsKernel<I> {
    pub fn block_size(&self) -> usize {
        self.cfg.block_size
    }

    /// True when this handle wraps generated code rather than the scalar
    /// reference.
    pub fn is_jit(&self) -> bool {
        matches!(self.imp, StandardImpl::Jit(_))
    }

    /// The raw entry point, when one was compiled.
    pub fn as_raw(&self) -> Option<StandardKernelFn<I>> {
        match self.imp {
            StandardImpl::Jit(f) => Some(f),
            StandardImpl::Reference => None,
        }
    }

    /// Run the kernel. `data_size` is the number of rows in `input`.
    ///
    /// Returns `Ok(false)` — with `out` contents unspecified — when an
    /// index is out of `[0, data_size)` or the lengths do not sum to
    /// `indices.len()`.
    pub fn execute(
        &self,
        data_size: usize,
        input: &[u8],
        indices: &[I],
        lengths: &[i32],
        weights: Option<&[f32]>,
        out: &mut [f32],
    ) -> Result<bool, KernelError> {
        let weights_ptr = self.cfg.validate(
            data_size,
            input,
            indices.len(),
            lengths.len(),
            weights,
            out.len(),
        )?;
        Ok(match &self.imp {
            StandardImpl::Jit(f) => unsafe {
                f(
                    lengths.len() as i64,
                    indices.len() as i64,
                    data_size as i64,
                    input.as_ptr(),
                    indices.as_ptr(),
                    lengths.as_ptr(),
                    weights_ptr,
                    out.as_mut_ptr(),
                )
            },
            StandardImpl::Reference => scalar::embedding_sls_nbit_ref(
                self.cfg.bit_rate,
                self.cfg.block_size,
                data_size,
                input,
                indices,
                lengths,
                if self.cfg.has_weight { weights } else { None },
                self.cfg.normalize_by_lengths,
                self.cfg.is_weight_positional,
                out,
            ),
        })
    }
}

impl<I: SlsIndex> SlsRowwiseKernel<I> {
    pub fn block_size(&self) -> usize {
        self.cfg.block_size
    }

    pub fn is_jit(&self) -> bool {
        matches!(self.imp, RowwiseImpl::Jit(_))
    }

    pub fn as_raw(&self) -> Option<RowwiseKernelFn<I>> {
        match self.imp {
            RowwiseImpl::Jit(f) => Some(f),
            RowwiseImpl::Reference => None,
        }
    }

    /// Run the kernel. The uncompressed table size is
    /// `compressed_indices_table.len()`; `compressed_rows` is the number of
    /// rows actually present in `input`.
    ///
    /// # Safety
    ///
    /// Every entry of `compressed_indices_table` must be `-1` or a row
    /// index `< compressed_rows`. The kernel bounds-checks the uncompressed
    /// indices against the table length but trusts the table's
    /// redirections, exactly like the scalar reference.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn execute(
        &self,
        compressed_rows: usize,
        input: &[u8],
        indices: &[I],
        compressed_indices_table: &[I],
        lengths: &[i32],
        weights: Option<&[f32]>,
        out: &mut [f32],
    ) -> Result<bool, KernelError> {
        let weights_ptr = self.cfg.validate(
            compressed_rows,
            input,
            indices.len(),
            lengths.len(),
            weights,
            out.len(),
        )?;
        Ok(match &self.imp {
            RowwiseImpl::Jit(f) => f(
                lengths.len() as i64,
                indices.len() as i64,
                compressed_indices_table.len() as i64,
                input.as_ptr(),
                indices.as_ptr(),
                lengths.as_ptr(),
                weights_ptr,
                out.as_mut_ptr(),
                compressed_indices_table.as_ptr(),
            ),
            RowwiseImpl::Reference => scalar::embedding_sls_nbit_rowwise_sparse_ref(
                self.cfg.bit_rate,
                self.cfg.block_size,
                compressed_indices_table.len(),
                input,
                indices,
                compressed_indices_table,
                lengths,
                if self.cfg.has_weight { weights } else { None },
                self.cfg.normalize_by_lengths,
                self.cfg.is_weight_positional,
                out,
            ),
        })
    }
}
