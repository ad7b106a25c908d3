//! Generated kernels vs the scalar reference across embedding dimensions.
//!
//! Run with: RUSTFLAGS="-C target-cpu=native" cargo bench --bench sls_benchmark

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sls_kernels::{
    embedding_sls_nbit_ref, generate_embedding_sls_nbit, quantize_table_nbit,
};

struct Workload {
    input: Vec<u8>,
    indices: Vec<i64>,
    lengths: Vec<i32>,
    data_size: usize,
    block_size: usize,
    output_size: usize,
}

fn build_workload(bit_rate: u8, block_size: usize) -> Workload {
    let mut rng = StdRng::seed_from_u64(42);
    let data_size = 4000usize;
    let output_size = 256usize;
    let pooling = 20usize;

    let dense: Vec<f32> = (0..data_size * block_size)
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect();
    let input = quantize_table_nbit(bit_rate, data_size, block_size, &dense);

    let lengths = vec![pooling as i32; output_size];
    let indices: Vec<i64> = (0..output_size * pooling)
        .map(|_| rng.gen_range(0..data_size as i64))
        .collect();

    Workload {
        input,
        indices,
        lengths,
        data_size,
        block_size,
        output_size,
    }
}

fn bench_sls(c: &mut Criterion) {
    for &bit_rate in &[2u8, 4] {
        let mut group = c.benchmark_group(format!("sls_{bit_rate}bit"));
        for &block_size in &[32usize, 64, 128, 256] {
            let w = build_workload(bit_rate, block_size);
            let bytes = (w.indices.len() * w.block_size * 4) as u64;
            group.throughput(Throughput::Bytes(bytes));

            let kernel =
                generate_embedding_sls_nbit::<i64>(bit_rate, block_size, false, false, 16, false)
                    .unwrap();
            let mut out = vec![0f32; w.output_size * w.block_size];

            group.bench_with_input(BenchmarkId::new("jit", block_size), &w, |b, w| {
                b.iter(|| {
                    let ok = kernel
                        .execute(
                            w.data_size,
                            black_box(&w.input),
                            black_box(&w.indices),
                            &w.lengths,
                            None,
                            &mut out,
                        )
                        .unwrap();
                    assert!(ok);
                })
            });

            group.bench_with_input(BenchmarkId::new("scalar", block_size), &w, |b, w| {
                b.iter(|| {
                    let ok = embedding_sls_nbit_ref(
                        bit_rate,
                        w.block_size,
                        w.data_size,
                        black_box(&w.input),
                        black_box(&w.indices),
                        &w.lengths,
                        None,
                        false,
                        false,
                        &mut out,
                    );
                    assert!(ok);
                })
            });
        }
        group.finish();
    }
}

criterion_group!(benches, bench_sls);
criterion_main!(benches);
