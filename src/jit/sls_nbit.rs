//! Emitter for the N-bit sparse-length-sum lookup kernel.
//!
//! One call produces the complete machine code for a single kernel
//! signature: outer loop over output segments, inner loop over the
//! segment's indices, dequantization of 4-bit nibbles or 2-bit crumbs
//! into fp32 and FMA accumulation, with bounds checking on every index
//! and on the aggregate segment lengths.
//!
//! Layout of the dequant schedule (why groups of four accumulators):
//! the packed data for four output vectors is loaded at once and widened
//! (u8->u16 for 4-bit, u8->u32 for 2-bit); a shift-or-mask sequence then
//! leaves one quantized value in the low byte of every 32-bit lane, and
//! each 128-bit quarter of that register is sign-extended to one
//! accumulator's worth of i32 lanes.

use iced_x86::code_asm::*;
use iced_x86::IcedError;

use crate::isa::IsaLevel;
use crate::types::{ceil_div, elems_per_byte, KernelSignature, SlsIndex};

use super::vregs::{VecInsts, VectorRegs, XMM, YMM, ZMM};

const CACHE_LINE_LEN: usize = 64;

/// Emit the kernel for `sig` and return its machine code.
///
/// GP register roles (System V AMD64):
///   rdi  output_size (counted down)
///   rsi  index_size, rewritten to the end address of the index stream
///   rdx  data_size (uncompressed table size in the rowwise-sparse variant)
///   rcx  input
///   r8   indices cursor
///   r9   lengths cursor
///   r10  weights cursor  (stack argument 7)
///   r11  out cursor      (stack argument 8)
///   rbx  compressed-index table (stack argument 9, rowwise-sparse only)
///   r12d current segment length, counted down
///   r13/r14/rax scratch
pub(crate) fn emit_kernel<I: SlsIndex>(
    isa: IsaLevel,
    sig: &KernelSignature,
    rowwise_sparse: bool,
) -> Result<Vec<u8>, IcedError> {
    let bit_rate = sig.bit_rate;
    let block_size = sig.block_size;
    let vlen = isa.vlen();
    let v = VecInsts::new(isa);

    let num_vec_regs_per_block = ceil_div(block_size, vlen);
    let remainder = block_size % vlen;

    // Packed data is loaded at 32-bit granularity; the trailing scale/bias
    // bytes mean the load mask only needs 32-bit resolution, not bit_rate
    // resolution.
    let num_elem_per_byte = elems_per_byte(bit_rate);
    let num_elem_per_32bit = 32 / bit_rate as usize;
    // Four vectors are unpacked per load.
    let num_of_32bit_per_vload = vlen * 4 / num_elem_per_32bit;
    let remainder_32bit =
        ceil_div(block_size, num_elem_per_32bit) % num_of_32bit_per_vload;

    let packed_len = ceil_div(block_size, num_elem_per_byte);
    let fused_block_size = (packed_len + 4) as i32;
    let bytes_per_vload = vlen / num_elem_per_byte;
    let vload_per_cache_line = CACHE_LINE_LEN / bytes_per_vload;
    let index_bytes = I::BYTES as i32;

    let regs = VectorRegs::allocate(
        isa,
        bit_rate,
        sig.has_weight,
        sig.normalize_by_lengths,
        remainder,
        remainder_32bit,
    );
    let unroll = regs.unroll;

    let mut a = CodeAssembler::new(64)?;

    // ── prologue: callee-saved spills and stack-argument binding ──────
    a.push(rbx)?;
    a.push(r12)?;
    a.push(r13)?;
    a.push(r14)?;
    a.mov(r10, qword_ptr(rsp + 0x28))?; // weights
    a.mov(r11, qword_ptr(rsp + 0x30))?; // out
    if rowwise_sparse {
        a.mov(rbx, qword_ptr(rsp + 0x38))?; // compressed-index table
    }

    // Mask that isolates the low bit_rate bits of every byte.
    a.sub(rsp, 4)?;
    if bit_rate == 4 {
        a.mov(word_ptr(rsp), 0x0f0f)?;
        v.broadcastw_full(&mut a, regs.extract_mask, ptr(rsp))?;
    } else {
        a.mov(dword_ptr(rsp), 0x0303_0303)?;
        v.broadcastd(&mut a, regs.extract_mask, ptr(rsp))?;
    }
    a.add(rsp, 4)?;

    // ── tail masks ────────────────────────────────────────────────────
    if remainder != 0 {
        match isa {
            IsaLevel::Avx2 => {
                let mask = regs.store_mask.unwrap() as usize;
                let bytes = (vlen * 4) as i32;
                a.sub(rsp, bytes)?;
                for i in 0..vlen {
                    let fill = if i < remainder { -1 } else { 0 };
                    a.mov(dword_ptr(rsp + (i * 4) as i32), fill)?;
                }
                a.vmovups(YMM[mask], ptr(rsp))?;
                a.add(rsp, bytes)?;
            }
            IsaLevel::Avx512 => {
                a.mov(r13d, ((1u32 << remainder) - 1) as i32)?;
                a.kmovw(k1, r13d)?;
            }
        }
    }
    if remainder_32bit != 0 {
        match isa {
            IsaLevel::Avx2 => {
                let mask = regs.load_mask.unwrap() as usize;
                let bytes = (vlen / 2 * 4) as i32;
                a.sub(rsp, bytes)?;
                for i in 0..vlen / 2 {
                    let fill = if i < remainder_32bit { -1 } else { 0 };
                    a.mov(dword_ptr(rsp + (i * 4) as i32), fill)?;
                }
                a.vmovups(XMM[mask], ptr(rsp))?;
                a.add(rsp, bytes)?;
            }
            IsaLevel::Avx512 => {
                a.mov(r13d, ((1u32 << remainder_32bit) - 1) as i32)?;
                a.kmovw(k2, r13d)?;
            }
        }
    }

    // rsi <- end address of the index stream; the per-segment bounds check
    // and the final cursor check both compare against it.
    a.imul_3(r13, rsi, index_bytes)?;
    a.add(r13, r8)?;
    a.mov(rsi, r13)?;

    let mut exit = a.create_label();
    let mut error = a.create_label();
    let mut range_begin = a.create_label();
    let mut range_end = a.create_label();

    // ── outer loop: one output row per segment ────────────────────────
    a.set_label(&mut range_begin)?;
    a.dec(rdi)?;
    a.jl(range_end)?;

    if sig.normalize_by_lengths {
        let vi = regs.vlen_inv.unwrap();
        let mut if_len_end = a.create_label();
        a.cmp(dword_ptr(r9), 1)?;
        // len <= 0 leaves 1/len as 0.0 (the inner loop then runs zero times).
        v.zero(&mut a, vi)?;
        a.jl(if_len_end)?;
        match isa {
            IsaLevel::Avx2 => {
                let vi = vi as usize;
                a.mov(r12d, 1)?;
                a.vcvtsi2ss(XMM[vi], XMM[vi], r12d)?;
                a.vcvtsi2ss(xmm0, xmm0, dword_ptr(r9))?;
                a.vdivss(XMM[vi], XMM[vi], xmm0)?;
                a.vpbroadcastd(YMM[vi], XMM[vi])?;
            }
            IsaLevel::Avx512 => {
                // zmm0 is free scratch here; accumulators are zeroed below.
                a.mov(r12d, 1)?;
                a.vcvtsi2ss(xmm0, xmm0, r12d)?;
                a.vpbroadcastd(ZMM[vi as usize], xmm0)?;
                a.vpbroadcastd(zmm0, dword_ptr(r9))?;
                a.vcvtdq2ps(zmm0, zmm0)?;
                a.vdivps(ZMM[vi as usize], ZMM[vi as usize], zmm0)?;
            }
        }
        a.set_label(&mut if_len_end)?;
    }

    // Register blocks cover the embedding dimension in strides of `unroll`
    // vectors; each block replays the segment's index list.
    let mut vec_idx = 0usize;
    while vec_idx < num_vec_regs_per_block {
        let cur_unroll = unroll.min(num_vec_regs_per_block - vec_idx);

        for r in 0..cur_unroll {
            v.zero(&mut a, r as u8)?;
        }

        a.mov(r12d, dword_ptr(r9))?;

        // This segment's slice of the index stream must stay in bounds.
        a.imul_3(r13, r12, index_bytes)?;
        a.add(r13, r8)?;
        a.cmp(r13, rsi)?;
        a.jg(error)?;

        let mut data_begin = a.create_label();
        let mut data_end = a.create_label();

        // ── inner loop: one table row per index ───────────────────────
        a.set_label(&mut data_begin)?;
        a.dec(r12d)?;
        a.jl(data_end)?;

        if I::IS_WIDE {
            a.mov(r13, qword_ptr(r8))?;
        } else {
            a.mov(r13d, dword_ptr(r8))?;
        }
        a.cmp(r13, 0)?;
        a.jl(error)?;
        a.cmp(r13, rdx)?;
        a.jge(error)?;

        if rowwise_sparse {
            if I::IS_WIDE {
                a.mov(r13, qword_ptr(rbx + r13 * 8))?;
            } else {
                a.mov(r13d, dword_ptr(rbx + r13 * 4))?;
            }
        }

        if sig.prefetch != 0 {
            let mut pref_reset = a.create_label();
            let mut pref_ready = a.create_label();
            let pref_disp = (sig.prefetch * I::BYTES) as i32;

            // Peek prefetch_distance indices ahead; clamp to the current
            // row when the peek runs off the stream or out of the table.
            a.mov(r14, r8)?;
            a.add(r14, pref_disp)?;
            a.cmp(r14, rsi)?;
            a.jge(pref_reset)?;
            if I::IS_WIDE {
                a.mov(r14, qword_ptr(r8 + pref_disp))?;
            } else {
                a.mov(r14d, dword_ptr(r8 + pref_disp))?;
            }
            a.cmp(r14, 0)?;
            a.jl(pref_reset)?;
            a.cmp(r14, rdx)?;
            a.jge(pref_reset)?;
            a.jmp(pref_ready)?;

            a.set_label(&mut pref_reset)?;
            if I::IS_WIDE {
                a.mov(r14, qword_ptr(r8))?;
            } else {
                a.mov(r14d, dword_ptr(r8))?;
            }

            a.set_label(&mut pref_ready)?;
            if rowwise_sparse {
                if I::IS_WIDE {
                    a.mov(r14, qword_ptr(rbx + r14 * 8))?;
                } else {
                    a.mov(r14d, dword_ptr(rbx + r14 * 4))?;
                }
            }
            a.imul_3(r14, r14, fused_block_size)?;
        }

        a.add(r8, index_bytes)?;

        if sig.has_weight {
            v.broadcastss(&mut a, regs.w.unwrap(), ptr(r10))?;
            a.add(r10, 4)?;
        }

        if rowwise_sparse {
            // Absent row: contributes nothing (the weight cursor has
            // already advanced past it).
            if I::IS_WIDE {
                a.cmp(r13, -1)?;
            } else {
                a.cmp(r13d, -1)?;
            }
            a.je(data_begin)?;
        }

        a.imul_3(r13, r13, fused_block_size)?;

        // fp16 scale and bias sit after the packed lanes; premultiply by
        // the weight so the FMA needs no extra operand.
        let scale_disp = packed_len as i32;
        v.broadcastw_half(&mut a, regs.scale, ptr(rcx + r13 + scale_disp))?;
        v.broadcastw_half(&mut a, regs.bias, ptr(rcx + r13 + scale_disp + 2))?;
        v.cvtph2ps(&mut a, regs.scale)?;
        v.cvtph2ps(&mut a, regs.bias)?;
        if sig.has_weight {
            let w = regs.w.unwrap();
            v.mulps(&mut a, regs.scale, regs.scale, w)?;
            v.mulps(&mut a, regs.bias, regs.bias, w)?;
        }

        let s = regs.src;
        let t = regs.temp;
        let mut grp = 0usize;
        while grp < cur_unroll {
            let block_base = vec_idx + grp;
            let src_disp = (block_base * bytes_per_vload) as i32;
            let src_addr = ptr(rcx + r13 + src_disp);
            // The row's final group masks its load whenever the packed
            // bytes stop short of a full vload, even if the group still
            // fills all four vectors; an unmasked load would run past the
            // end of the table's last row.
            let tail_group =
                num_vec_regs_per_block - block_base <= 4 && remainder_32bit != 0;

            // Load four vectors' worth of packed data and scatter the
            // bit-slices so each 32-bit lane holds one quantized value in
            // its low byte.
            if bit_rate == 4 {
                if tail_group {
                    match isa {
                        IsaLevel::Avx512 => {
                            a.vmovups(YMM[s as usize].k2(), src_addr)?;
                        }
                        IsaLevel::Avx2 => {
                            let m = regs.load_mask.unwrap() as usize;
                            a.vpmaskmovd(XMM[s as usize], XMM[m], src_addr)?;
                        }
                    }
                    v.pmovzxbw_half(&mut a, s)?;
                } else {
                    v.pmovzxbw_mem(&mut a, s, src_addr)?;
                }
                // Each u16 word holds hi:lo nibbles; replicate shifted by 4
                // and mask so each byte keeps exactly one nibble.
                v.pslld(&mut a, t, s, 4)?;
                v.por(&mut a, s, s, t)?;
                v.pand(&mut a, s, s, regs.extract_mask)?;
            } else {
                if tail_group {
                    match isa {
                        IsaLevel::Avx512 => {
                            a.vmovups(XMM[s as usize].k2(), src_addr)?;
                            v.pmovzxbd_xmm(&mut a, s, s)?;
                        }
                        IsaLevel::Avx2 => {
                            let m = regs.load_mask.unwrap() as usize;
                            a.vpmaskmovd(XMM[s as usize], XMM[m], src_addr)?;
                            v.pmovzxbd_xmm(&mut a, s, s)?;
                        }
                    }
                } else {
                    v.pmovzxbd_mem(&mut a, s, src_addr)?;
                }
                // Each u32 dword holds one byte of four crumbs; spread them
                // across the dword's four bytes and mask.
                let t2 = regs.temp2.unwrap();
                v.pslld(&mut a, t, s, 2 * 8 + 2)?;
                v.pslld(&mut a, t2, s, 8 + 4)?;
                v.por(&mut a, t, t, t2)?;
                v.pslld(&mut a, t2, s, 6)?;
                v.por(&mut a, t, t, t2)?;
                v.por(&mut a, s, t, s)?;
                v.pand(&mut a, s, s, regs.extract_mask)?;
            }

            // One 128-bit quarter of src per accumulator: sign-extend to
            // i32 (high bits are masked off, so this is a zero-extension),
            // convert, add bias, FMA with scale.
            let lanes = 4.min(num_vec_regs_per_block - block_base);
            for i in 0..lanes {
                let out_r = (grp + i) as u8;
                if i == 0 {
                    v.pmovsxbd_xmm(&mut a, t, s)?;
                } else {
                    match isa {
                        IsaLevel::Avx512 => {
                            a.vextracti32x4(XMM[t as usize], ZMM[s as usize], i as i32)?;
                            a.vpmovsxbd(ZMM[t as usize], XMM[t as usize])?;
                        }
                        IsaLevel::Avx2 => {
                            // No single-quarter extract below AVX-512; route
                            // odd quarters through a GP register.
                            if i == 1 {
                                a.vpextrq(rax, XMM[s as usize], 1)?;
                                a.vmovq(XMM[t as usize], rax)?;
                            } else {
                                a.vextractf128(
                                    XMM[t as usize],
                                    YMM[s as usize],
                                    (i >> 1) as i32,
                                )?;
                                if i == 3 {
                                    a.vpextrq(rax, XMM[t as usize], 1)?;
                                    a.vmovq(XMM[t as usize], rax)?;
                                }
                            }
                            a.vpmovsxbd(YMM[t as usize], XMM[t as usize])?;
                        }
                    }
                }
                v.cvtdq2ps(&mut a, t, t)?;
                v.addps(&mut a, out_r, out_r, regs.bias)?;
                v.fmadd231ps(&mut a, out_r, t, regs.scale)?;
            }

            if sig.prefetch != 0 && (block_base * 4) % vload_per_cache_line == 0 {
                a.prefetcht0(byte_ptr(rcx + r14 + src_disp))?;
            }

            grp += 4;
        }

        a.jmp(data_begin)?;
        a.set_label(&mut data_end)?;

        // ── write the block's accumulators back ───────────────────────
        for r in 0..cur_unroll {
            let dst_disp = ((vec_idx + r) * vlen * 4) as i32;
            if sig.normalize_by_lengths {
                v.mulps(&mut a, r as u8, r as u8, regs.vlen_inv.unwrap())?;
            }
            let tail = remainder != 0 && vec_idx + r == num_vec_regs_per_block - 1;
            match isa {
                IsaLevel::Avx512 => {
                    if tail {
                        a.vmovups(ptr(r11 + dst_disp).k1(), ZMM[r])?;
                    } else {
                        a.vmovups(ptr(r11 + dst_disp), ZMM[r])?;
                    }
                }
                IsaLevel::Avx2 => {
                    if tail {
                        let m = regs.store_mask.unwrap() as usize;
                        a.vmaskmovps(ptr(r11 + dst_disp), YMM[m], YMM[r])?;
                    } else {
                        a.vmovups(ptr(r11 + dst_disp), YMM[r])?;
                    }
                }
            }
        }

        // Rewind the cursors when this segment must be replayed: by the
        // next register block, or by the positional-weight pass (the
        // weight stream is indexed by offset within the segment, so its
        // cursor may never advance across segments).
        let more_blocks = vec_idx + unroll < num_vec_regs_per_block;
        if more_blocks || (sig.has_weight && sig.is_weight_positional) {
            a.mov(r12d, dword_ptr(r9))?;
            if sig.has_weight {
                a.imul_3(r13, r12, 4)?;
                a.sub(r10, r13)?;
                if more_blocks {
                    a.imul_3(r13, r13, (I::BYTES / 4) as i32)?;
                    a.sub(r8, r13)?;
                }
            } else {
                a.imul_3(r13, r12, index_bytes)?;
                a.sub(r8, r13)?;
            }
        }

        vec_idx += unroll;
    }

    a.add(r9, 4)?;
    a.add(r11, (block_size * 4) as i32)?;
    a.jmp(range_begin)?;
    a.set_label(&mut range_end)?;

    // Sum of lengths must have consumed the index stream exactly.
    a.cmp(r8, rsi)?;
    a.jne(error)?;
    a.mov(eax, 1)?;
    a.jmp(exit)?;
    a.set_label(&mut error)?;
    a.mov(eax, 0)?;
    a.set_label(&mut exit)?;

    a.vzeroupper()?;
    a.pop(r14)?;
    a.pop(r13)?;
    a.pop(r12)?;
    a.pop(rbx)?;
    a.ret()?;

    a.assemble(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(bit_rate: u8, block_size: usize) -> KernelSignature {
        KernelSignature {
            bit_rate,
            block_size,
            has_weight: false,
            is_weight_positional: false,
            normalize_by_lengths: false,
            prefetch: 0,
        }
    }

    #[test]
    fn emits_nonempty_code_for_every_shape() {
        for &isa in &[IsaLevel::Avx2, IsaLevel::Avx512] {
            for &bit_rate in &[2u8, 4] {
                for &block_size in &[1usize, 7, 8, 9, 16, 17, 64, 100] {
                    let code =
                        emit_kernel::<i64>(isa, &sig(bit_rate, block_size), false).unwrap();
                    assert!(
                        code.len() > 64,
                        "suspiciously small kernel: {} bytes ({} {}b block={})",
                        code.len(),
                        isa.name(),
                        bit_rate,
                        block_size
                    );
                    // push rbx prologue, ret somewhere near the end.
                    assert_eq!(code[0], 0x53);
                    assert!(code.contains(&0xC3));
                }
            }
        }
    }

    #[test]
    fn emission_is_deterministic() {
        let s = KernelSignature {
            bit_rate: 4,
            block_size: 100,
            has_weight: true,
            is_weight_positional: true,
            normalize_by_lengths: true,
            prefetch: 16,
        };
        let a = emit_kernel::<i32>(IsaLevel::Avx2, &s, true).unwrap();
        let b = emit_kernel::<i32>(IsaLevel::Avx2, &s, true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn variants_change_the_code() {
        let base = sig(4, 64);
        let a = emit_kernel::<i64>(IsaLevel::Avx2, &base, false).unwrap();
        let b = emit_kernel::<i64>(
            IsaLevel::Avx2,
            &KernelSignature {
                has_weight: true,
                ..base
            },
            false,
        )
        .unwrap();
        assert_ne!(a, b);
        let c = emit_kernel::<i32>(IsaLevel::Avx2, &base, false).unwrap();
        assert_ne!(a, c);
        let d = emit_kernel::<i64>(IsaLevel::Avx512, &base, false).unwrap();
        assert_ne!(a, d);
    }
}
