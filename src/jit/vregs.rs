//! Vector register roles and ISA-dispatching emit helpers.
//!
//! The generator works with register *numbers*; this module maps them onto
//! iced-x86's typed xmm/ymm/zmm constants and papers over the AVX2/AVX-512
//! differences (full-vector type, half-vector type for widening conversions,
//! `vpor` vs `vpord`). Instructions that differ structurally between the
//! ISAs — masked loads/stores, 128-bit extraction — stay in the emitter.

use iced_x86::code_asm::*;
use iced_x86::IcedError;

use crate::isa::IsaLevel;

#[rustfmt::skip]
pub(crate) const XMM: [AsmRegisterXmm; 32] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7,
    xmm8, xmm9, xmm10, xmm11, xmm12, xmm13, xmm14, xmm15,
    xmm16, xmm17, xmm18, xmm19, xmm20, xmm21, xmm22, xmm23,
    xmm24, xmm25, xmm26, xmm27, xmm28, xmm29, xmm30, xmm31,
];

#[rustfmt::skip]
pub(crate) const YMM: [AsmRegisterYmm; 32] = [
    ymm0, ymm1, ymm2, ymm3, ymm4, ymm5, ymm6, ymm7,
    ymm8, ymm9, ymm10, ymm11, ymm12, ymm13, ymm14, ymm15,
    ymm16, ymm17, ymm18, ymm19, ymm20, ymm21, ymm22, ymm23,
    ymm24, ymm25, ymm26, ymm27, ymm28, ymm29, ymm30, ymm31,
];

#[rustfmt::skip]
pub(crate) const ZMM: [AsmRegisterZmm; 32] = [
    zmm0, zmm1, zmm2, zmm3, zmm4, zmm5, zmm6, zmm7,
    zmm8, zmm9, zmm10, zmm11, zmm12, zmm13, zmm14, zmm15,
    zmm16, zmm17, zmm18, zmm19, zmm20, zmm21, zmm22, zmm23,
    zmm24, zmm25, zmm26, zmm27, zmm28, zmm29, zmm30, zmm31,
];

/// Fixed partition of the vector register file for one kernel signature.
///
/// Roles are reserved from the top of the file downward; whatever remains
/// at the bottom is the accumulator pool. The dequant schedule consumes
/// four accumulators per unpack step, so the unroll factor is the largest
/// multiple of 4 that fits the pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VectorRegs {
    pub scale: u8,
    pub bias: u8,
    pub src: u8,
    pub temp: u8,
    /// Second shift scratch; only the 2-bit scatter needs it.
    pub temp2: Option<u8>,
    pub extract_mask: u8,
    pub w: Option<u8>,
    /// Float-lane tail mask; AVX-512 keeps it in `k1` instead.
    pub store_mask: Option<u8>,
    /// 32-bit-granularity load tail mask; AVX-512 keeps it in `k2`.
    pub load_mask: Option<u8>,
    pub vlen_inv: Option<u8>,
    pub unroll: usize,
}

impl VectorRegs {
    pub fn allocate(
        isa: IsaLevel,
        bit_rate: u8,
        has_weight: bool,
        normalize_by_lengths: bool,
        remainder: usize,
        remainder_32bit: usize,
    ) -> Self {
        let mut next = isa.num_vec_regs() as u8;
        let mut take = || {
            next -= 1;
            next
        };

        let scale = take();
        let bias = take();
        let src = take();
        let temp = take();
        let temp2 = (bit_rate == 2).then(&mut take);
        let extract_mask = take();
        let w = has_weight.then(&mut take);
        let store_mask = (remainder != 0 && !isa.has_opmask()).then(&mut take);
        let load_mask = (remainder_32bit != 0 && !isa.has_opmask()).then(&mut take);
        let vlen_inv = normalize_by_lengths.then(&mut take);

        let unroll = (next as usize) / 4 * 4;
        debug_assert!(unroll >= 4);

        VectorRegs {
            scale,
            bias,
            src,
            temp,
            temp2,
            extract_mask,
            w,
            store_mask,
            load_mask,
            vlen_inv,
            unroll,
        }
    }
}

/// Emit helpers parameterized on the ISA's full/half vector register types.
pub(crate) struct VecInsts {
    isa: IsaLevel,
}

impl VecInsts {
    pub fn new(isa: IsaLevel) -> Self {
        VecInsts { isa }
    }

    /// vxorps v, v, v
    pub fn zero(&self, a: &mut CodeAssembler, r: u8) -> Result<(), IcedError> {
        let r = r as usize;
        match self.isa {
            IsaLevel::Avx2 => a.vxorps(YMM[r], YMM[r], YMM[r]),
            IsaLevel::Avx512 => a.vxorps(ZMM[r], ZMM[r], ZMM[r]),
        }
    }

    pub fn mulps(&self, a: &mut CodeAssembler, d: u8, s1: u8, s2: u8) -> Result<(), IcedError> {
        let (d, s1, s2) = (d as usize, s1 as usize, s2 as usize);
        match self.isa {
            IsaLevel::Avx2 => a.vmulps(YMM[d], YMM[s1], YMM[s2]),
            IsaLevel::Avx512 => a.vmulps(ZMM[d], ZMM[s1], ZMM[s2]),
        }
    }

    pub fn addps(&self, a: &mut CodeAssembler, d: u8, s1: u8, s2: u8) -> Result<(), IcedError> {
        let (d, s1, s2) = (d as usize, s1 as usize, s2 as usize);
        match self.isa {
            IsaLevel::Avx2 => a.vaddps(YMM[d], YMM[s1], YMM[s2]),
            IsaLevel::Avx512 => a.vaddps(ZMM[d], ZMM[s1], ZMM[s2]),
        }
    }

    /// vfmadd231ps d, m1, m2  (d += m1 * m2)
    pub fn fmadd231ps(
        &self,
        a: &mut CodeAssembler,
        d: u8,
        m1: u8,
        m2: u8,
    ) -> Result<(), IcedError> {
        let (d, m1, m2) = (d as usize, m1 as usize, m2 as usize);
        match self.isa {
            IsaLevel::Avx2 => a.vfmadd231ps(YMM[d], YMM[m1], YMM[m2]),
            IsaLevel::Avx512 => a.vfmadd231ps(ZMM[d], ZMM[m1], ZMM[m2]),
        }
    }

    pub fn cvtdq2ps(&self, a: &mut CodeAssembler, d: u8, s: u8) -> Result<(), IcedError> {
        let (d, s) = (d as usize, s as usize);
        match self.isa {
            IsaLevel::Avx2 => a.vcvtdq2ps(YMM[d], YMM[s]),
            IsaLevel::Avx512 => a.vcvtdq2ps(ZMM[d], ZMM[s]),
        }
    }

    /// Widen register `r`'s half-vector of fp16 into a full vector of fp32.
    pub fn cvtph2ps(&self, a: &mut CodeAssembler, r: u8) -> Result<(), IcedError> {
        let r = r as usize;
        match self.isa {
            IsaLevel::Avx2 => a.vcvtph2ps(YMM[r], XMM[r]),
            IsaLevel::Avx512 => a.vcvtph2ps(ZMM[r], YMM[r]),
        }
    }

    /// vpbroadcastw into the half vector of `r` (fp16 operand staging).
    pub fn broadcastw_half(
        &self,
        a: &mut CodeAssembler,
        r: u8,
        src: AsmMemoryOperand,
    ) -> Result<(), IcedError> {
        let r = r as usize;
        match self.isa {
            IsaLevel::Avx2 => a.vpbroadcastw(XMM[r], src),
            IsaLevel::Avx512 => a.vpbroadcastw(YMM[r], src),
        }
    }

    /// vpbroadcastw into the full vector of `r`.
    pub fn broadcastw_full(
        &self,
        a: &mut CodeAssembler,
        r: u8,
        src: AsmMemoryOperand,
    ) -> Result<(), IcedError> {
        let r = r as usize;
        match self.isa {
            IsaLevel::Avx2 => a.vpbroadcastw(YMM[r], src),
            IsaLevel::Avx512 => a.vpbroadcastw(ZMM[r], src),
        }
    }

    /// vpbroadcastd from memory into the full vector of `r`.
    pub fn broadcastd(
        &self,
        a: &mut CodeAssembler,
        r: u8,
        src: AsmMemoryOperand,
    ) -> Result<(), IcedError> {
        let r = r as usize;
        match self.isa {
            IsaLevel::Avx2 => a.vpbroadcastd(YMM[r], src),
            IsaLevel::Avx512 => a.vpbroadcastd(ZMM[r], src),
        }
    }

    /// vbroadcastss from memory into the full vector of `r`.
    pub fn broadcastss(
        &self,
        a: &mut CodeAssembler,
        r: u8,
        src: AsmMemoryOperand,
    ) -> Result<(), IcedError> {
        let r = r as usize;
        match self.isa {
            IsaLevel::Avx2 => a.vbroadcastss(YMM[r], src),
            IsaLevel::Avx512 => a.vbroadcastss(ZMM[r], src),
        }
    }

    pub fn pslld(
        &self,
        a: &mut CodeAssembler,
        d: u8,
        s: u8,
        imm: i32,
    ) -> Result<(), IcedError> {
        let (d, s) = (d as usize, s as usize);
        match self.isa {
            IsaLevel::Avx2 => a.vpslld(YMM[d], YMM[s], imm),
            IsaLevel::Avx512 => a.vpslld(ZMM[d], ZMM[s], imm),
        }
    }

    /// vpor (AVX2) / vpord (AVX-512).
    pub fn por(&self, a: &mut CodeAssembler, d: u8, s1: u8, s2: u8) -> Result<(), IcedError> {
        let (d, s1, s2) = (d as usize, s1 as usize, s2 as usize);
        match self.isa {
            IsaLevel::Avx2 => a.vpor(YMM[d], YMM[s1], YMM[s2]),
            IsaLevel::Avx512 => a.vpord(ZMM[d], ZMM[s1], ZMM[s2]),
        }
    }

    /// vpand (AVX2) / vpandd (AVX-512).
    pub fn pand(&self, a: &mut CodeAssembler, d: u8, s1: u8, s2: u8) -> Result<(), IcedError> {
        let (d, s1, s2) = (d as usize, s1 as usize, s2 as usize);
        match self.isa {
            IsaLevel::Avx2 => a.vpand(YMM[d], YMM[s1], YMM[s2]),
            IsaLevel::Avx512 => a.vpandd(ZMM[d], ZMM[s1], ZMM[s2]),
        }
    }

    /// u8 -> u16 widening load of one group's packed 4-bit data.
    pub fn pmovzxbw_mem(
        &self,
        a: &mut CodeAssembler,
        d: u8,
        src: AsmMemoryOperand,
    ) -> Result<(), IcedError> {
        let d = d as usize;
        match self.isa {
            IsaLevel::Avx2 => a.vpmovzxbw(YMM[d], src),
            IsaLevel::Avx512 => a.vpmovzxbw(ZMM[d], src),
        }
    }

    /// u8 -> u16 widening of register `r`'s own half vector (masked-load path).
    pub fn pmovzxbw_half(&self, a: &mut CodeAssembler, r: u8) -> Result<(), IcedError> {
        let r = r as usize;
        match self.isa {
            IsaLevel::Avx2 => a.vpmovzxbw(YMM[r], XMM[r]),
            IsaLevel::Avx512 => a.vpmovzxbw(ZMM[r], YMM[r]),
        }
    }

    /// u8 -> u32 widening load of one group's packed 2-bit data.
    pub fn pmovzxbd_mem(
        &self,
        a: &mut CodeAssembler,
        d: u8,
        src: AsmMemoryOperand,
    ) -> Result<(), IcedError> {
        let d = d as usize;
        match self.isa {
            IsaLevel::Avx2 => a.vpmovzxbd(YMM[d], src),
            IsaLevel::Avx512 => a.vpmovzxbd(ZMM[d], src),
        }
    }

    /// u8 -> u32 widening of the xmm view of `s` into the full vector of `d`.
    pub fn pmovzxbd_xmm(&self, a: &mut CodeAssembler, d: u8, s: u8) -> Result<(), IcedError> {
        let (d, s) = (d as usize, s as usize);
        match self.isa {
            IsaLevel::Avx2 => a.vpmovzxbd(YMM[d], XMM[s]),
            IsaLevel::Avx512 => a.vpmovzxbd(ZMM[d], XMM[s]),
        }
    }

    /// i8 -> i32 sign-extending widen of the xmm view of `s` into `d`.
    /// (The high bits of every byte are masked to zero, so this is a
    /// zero-extension of the quantized lane.)
    pub fn pmovsxbd_xmm(&self, a: &mut CodeAssembler, d: u8, s: u8) -> Result<(), IcedError> {
        let (d, s) = (d as usize, s as usize);
        match self.isa {
            IsaLevel::Avx2 => a.vpmovsxbd(YMM[d], XMM[s]),
            IsaLevel::Avx512 => a.vpmovsxbd(ZMM[d], XMM[s]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_order_and_unroll() {
        // AVX-512, 4-bit, plain sum: scale..extract_mask reserved, 28 regs
        // left, unroll 28.
        let r = VectorRegs::allocate(IsaLevel::Avx512, 4, false, false, 0, 0);
        assert_eq!(r.scale, 31);
        assert_eq!(r.bias, 30);
        assert_eq!(r.src, 29);
        assert_eq!(r.temp, 28);
        assert_eq!(r.temp2, None);
        assert_eq!(r.extract_mask, 27);
        assert_eq!(r.unroll, 24);

        // AVX2, 2-bit, everything on: 6 regs left -> unroll 4.
        let r = VectorRegs::allocate(IsaLevel::Avx2, 2, true, true, 3, 1);
        assert_eq!(r.temp2, Some(11));
        assert_eq!(r.extract_mask, 10);
        assert_eq!(r.w, Some(9));
        assert_eq!(r.store_mask, Some(8));
        assert_eq!(r.load_mask, Some(7));
        assert_eq!(r.vlen_inv, Some(6));
        assert_eq!(r.unroll, 4);

        // AVX-512 never burns vector registers on tail masks.
        let r = VectorRegs::allocate(IsaLevel::Avx512, 4, false, false, 3, 1);
        assert_eq!(r.store_mask, None);
        assert_eq!(r.load_mask, None);
        assert_eq!(r.unroll, 24);
    }
}
