//! Runtime ISA detection and the per-ISA vector traits the code generator
//! is parameterized on.

use std::sync::OnceLock;

/// Vector instruction set a kernel is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsaLevel {
    Avx2,
    Avx512,
}

impl IsaLevel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Avx2 => "avx2",
            Self::Avx512 => "avx512",
        }
    }

    /// Number of 32-bit lanes in one full vector register.
    pub const fn vlen(self) -> usize {
        match self {
            Self::Avx2 => 8,
            Self::Avx512 => 16,
        }
    }

    /// Architectural vector register count.
    pub const fn num_vec_regs(self) -> usize {
        match self {
            Self::Avx2 => 16,
            Self::Avx512 => 32,
        }
    }

    /// True when tail lanes are handled with opmask (`k`) registers rather
    /// than a mask held in a vector register.
    pub const fn has_opmask(self) -> bool {
        matches!(self, Self::Avx512)
    }
}

static DETECTED_ISA: OnceLock<Option<IsaLevel>> = OnceLock::new();

/// Detect the best supported ISA, once per process.
///
/// The AVX-512 level requires F+BW+DQ+VL (the generator uses `vpmovzxbw`
/// on zmm, `vxorps` on zmm, and masked xmm/ymm loads). The AVX2 level
/// additionally needs FMA and F16C for the dequant arithmetic and the
/// fp16 scale/bias broadcast. Returns `None` when neither is available;
/// callers fall back to the scalar reference kernel.
pub fn detect_isa() -> Option<IsaLevel> {
    *DETECTED_ISA.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("avx512f")
                && std::arch::is_x86_feature_detected!("avx512bw")
                && std::arch::is_x86_feature_detected!("avx512dq")
                && std::arch::is_x86_feature_detected!("avx512vl")
            {
                return Some(IsaLevel::Avx512);
            }
            if std::arch::is_x86_feature_detected!("avx2")
                && std::arch::is_x86_feature_detected!("fma")
                && std::arch::is_x86_feature_detected!("f16c")
            {
                return Some(IsaLevel::Avx2);
            }
            None
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isa_traits_are_consistent() {
        assert_eq!(IsaLevel::Avx2.vlen(), 8);
        assert_eq!(IsaLevel::Avx512.vlen(), 16);
        assert_eq!(IsaLevel::Avx2.num_vec_regs(), 16);
        assert_eq!(IsaLevel::Avx512.num_vec_regs(), 32);
        assert!(IsaLevel::Avx512.has_opmask());
        assert!(!IsaLevel::Avx2.has_opmask());
    }

    #[test]
    fn detection_is_stable() {
        let a = detect_isa();
        let b = detect_isa();
        assert_eq!(a, b);
        if let Some(isa) = a {
            println!("detected ISA level: {}", isa.name());
        } else {
            println!("WARNING: no AVX2/AVX-512, scalar path will be used");
        }
    }
}
