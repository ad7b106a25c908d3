//! JIT code generation for the sparse-length-sum kernels.
//!
//! `compile_and_install` drives one full compilation: emit machine code for
//! a signature (outside any lock), optionally dump its disassembly, then
//! install it into the process-wide runtime (serialized install step) and
//! hand back the entry point.

mod sls_nbit;
mod vregs;

use crate::executable::JitRuntime;
use crate::isa::IsaLevel;
use crate::types::{KernelError, KernelSignature, SlsIndex};

pub(crate) fn compile_and_install<I: SlsIndex>(
    isa: IsaLevel,
    sig: &KernelSignature,
    rowwise_sparse: bool,
) -> Result<*const u8, KernelError> {
    let code = sls_nbit::emit_kernel::<I>(isa, sig, rowwise_sparse)
        .map_err(|e| KernelError::CodegenFailed(e.to_string()))?;

    #[cfg(feature = "codegen-dump")]
    dump_code(&code, sig, rowwise_sparse, isa, I::IS_WIDE);

    let entry = JitRuntime::global().install(&code)?;
    log::debug!(
        "compiled {}-bit sls kernel: block_size={} isa={} index={}b rowwise_sparse={} ({} bytes)",
        sig.bit_rate,
        sig.block_size,
        isa.name(),
        I::BYTES * 8,
        rowwise_sparse,
        code.len()
    );
    Ok(entry)
}

/// Write the kernel's disassembly next to the working directory, one file
/// per signature.
#[cfg(feature = "codegen-dump")]
fn dump_code(
    code: &[u8],
    sig: &KernelSignature,
    rowwise_sparse: bool,
    isa: IsaLevel,
    wide_index: bool,
) {
    use iced_x86::{Decoder, DecoderOptions, Formatter, NasmFormatter};

    let mut name = format!(
        "embeddinglookup_{}bit__emd_dim_{}",
        sig.bit_rate, sig.block_size
    );
    if sig.prefetch != 0 {
        name.push_str("_prefetch");
    }
    if sig.has_weight {
        name.push_str("_hasweight");
    }
    if sig.normalize_by_lengths {
        name.push_str("_normalize_by_lengths");
    }
    if rowwise_sparse {
        name.push_str("_rowwise_sparse");
    }
    name.push_str(if wide_index { "_64bit_" } else { "_32bit_" });
    name.push_str(isa.name());
    name.push_str(".txt");

    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();
    let mut text = String::new();
    let mut line = String::new();
    for insn in &mut decoder {
        line.clear();
        formatter.format(&insn, &mut line);
        text.push_str(&line);
        text.push('\n');
    }
    if let Err(e) = std::fs::write(&name, text) {
        log::warn!("failed to write kernel dump {name}: {e}");
    }
}
