//! Guard-page tests: every kernel buffer is placed flush against a
//! PROT_NONE page, so any read or write past the declared end faults
//! instead of silently passing. This exercises the masked tail load
//! (packed data at 32-bit granularity) and the masked tail store
//! (float-lane granularity) on both ISAs.

#![cfg(all(target_arch = "x86_64", unix))]

use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sls_kernels::{
    embedding_sls_nbit_ref, fused_row_width, generate_embedding_sls_nbit,
};

/// An allocation whose last `len` usable bytes end exactly at a PROT_NONE
/// guard page.
struct GuardedBuf {
    base: *mut u8,
    total: usize,
    data: *mut u8,
    len: usize,
}

impl GuardedBuf {
    fn new(len: usize) -> Self {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let usable_pages = (len + page - 1) / page;
        let total = (usable_pages + 1) * page;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED, "mmap failed");
        let base = base as *mut u8;
        let guard = unsafe { base.add(usable_pages * page) };
        let rc = unsafe { libc::mprotect(guard as *mut _, page, libc::PROT_NONE) };
        assert_eq!(rc, 0, "mprotect failed");
        // Data region ends exactly at the guard page.
        let data = unsafe { guard.sub(len) };
        GuardedBuf {
            base,
            total,
            data,
            len,
        }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len) }
    }
}

impl Drop for GuardedBuf {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut _, self.total);
        }
    }
}

fn guarded_copy(bytes: &[u8]) -> GuardedBuf {
    let mut buf = GuardedBuf::new(bytes.len());
    buf.as_mut_slice().copy_from_slice(bytes);
    buf
}

fn cast_slice<T>(bytes: &[u8]) -> &[T] {
    assert_eq!(bytes.len() % std::mem::size_of::<T>(), 0);
    assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<T>(), 0);
    unsafe {
        std::slice::from_raw_parts(bytes.as_ptr() as *const T, bytes.len() / std::mem::size_of::<T>())
    }
}

fn cast_slice_mut<T>(bytes: &mut [u8]) -> &mut [T] {
    assert_eq!(bytes.len() % std::mem::size_of::<T>(), 0);
    assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<T>(), 0);
    unsafe {
        std::slice::from_raw_parts_mut(
            bytes.as_mut_ptr() as *mut T,
            bytes.len() / std::mem::size_of::<T>(),
        )
    }
}

/// Every buffer — packed input, indices, lengths, weights, output — sits
/// flush against its own guard page; a single lane of overrun faults.
#[test]
fn kernels_never_touch_past_buffer_ends() {
    let mut rng = StdRng::seed_from_u64(0xdead_9a9e);
    let data_size = 9usize;
    let output_size = 4usize;

    for &bit_rate in &[2u8, 4] {
        // Deliberately awkward blocks: sub-vector, off-by-one around both
        // vector widths, and a multi-register-block size.
        for &block_size in &[1usize, 3, 7, 8, 9, 15, 16, 17, 31, 33, 67, 113, 118, 129, 257] {
            let fused = fused_row_width(bit_rate, block_size);
            let packed_len = fused - 4;

            let mut table = vec![0u8; data_size * fused];
            for r in 0..data_size {
                let row = &mut table[r * fused..(r + 1) * fused];
                rng.fill(&mut row[..packed_len]);
                let scale = f16::from_f32(rng.gen_range(0.1f32..1.5));
                let bias = f16::from_f32(rng.gen_range(-0.5f32..0.5));
                row[packed_len..packed_len + 2]
                    .copy_from_slice(&scale.to_bits().to_le_bytes());
                row[packed_len + 2..packed_len + 4]
                    .copy_from_slice(&bias.to_bits().to_le_bytes());
            }

            let lengths: Vec<i32> = vec![2, 0, 3, 1];
            let index_size: usize = lengths.iter().map(|&l| l as usize).sum();
            let indices: Vec<i64> = (0..index_size)
                .map(|_| rng.gen_range(0..data_size as i64))
                .collect();
            let weights: Vec<f32> = (0..index_size).map(|_| rng.gen_range(0.5..1.5)).collect();

            let g_input = guarded_copy(&table);
            let g_indices = guarded_copy(cast_bytes(&indices));
            let g_lengths = guarded_copy(cast_bytes(&lengths));
            let g_weights = guarded_copy(cast_bytes(&weights));
            let mut g_out = GuardedBuf::new(output_size * block_size * 4);

            for &(has_weight, normalize, prefetch) in
                &[(false, false, 0usize), (true, true, 16)]
            {
                let kernel = generate_embedding_sls_nbit::<i64>(
                    bit_rate, block_size, has_weight, normalize, prefetch, false,
                )
                .unwrap();
                let weights_opt =
                    has_weight.then(|| cast_slice::<f32>(g_weights.as_slice()));
                let out = cast_slice_mut::<f32>(g_out.as_mut_slice());
                out.fill(f32::NAN);

                let ok = kernel
                    .execute(
                        data_size,
                        g_input.as_slice(),
                        cast_slice::<i64>(g_indices.as_slice()),
                        cast_slice::<i32>(g_lengths.as_slice()),
                        weights_opt,
                        out,
                    )
                    .unwrap();
                assert!(ok, "{bit_rate}-bit block={block_size} failed");

                let mut expected = vec![0f32; out.len()];
                let ref_ok = embedding_sls_nbit_ref(
                    bit_rate,
                    block_size,
                    data_size,
                    g_input.as_slice(),
                    cast_slice::<i64>(g_indices.as_slice()),
                    cast_slice::<i32>(g_lengths.as_slice()),
                    weights_opt,
                    normalize,
                    false,
                    &mut expected,
                );
                assert!(ref_ok);
                for (i, (a, b)) in out.iter().zip(expected.iter()).enumerate() {
                    assert!(
                        (a - b).abs() <= 1e-4 + 1e-5 * b.abs(),
                        "{bit_rate}-bit block={block_size} lane {i}: {a} vs {b}"
                    );
                }
            }
        }
    }
}

fn cast_bytes<T>(values: &[T]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            values.as_ptr() as *const u8,
            std::mem::size_of_val(values),
        )
    }
}
