//! Frame codec benchmarks.
//!
//! Measures the client-side hot path: masking and encoding relay payloads
//! of typical TCP read sizes.
//!
//! Run with: cargo bench --bench frame_encode
//! Results saved to: target/criterion/

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use wsbridge::protocol::{OpCode, apply_mask, apply_mask_bytewise, decode_frame, encode_frame};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const PAYLOAD_SIZES: &[usize] = &[64, 1024, 16 * 1024, 256 * 1024];
const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

// ============================================================================
// Benchmark: Masking
// ============================================================================

fn bench_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask");

    for &size in PAYLOAD_SIZES {
        let mut buf = vec![0xa5u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("word", size), &size, |b, _| {
            b.iter(|| apply_mask(black_box(&mut buf), MASK));
        });
        group.bench_with_input(BenchmarkId::new("bytewise", size), &size, |b, _| {
            b.iter(|| apply_mask_bytewise(black_box(&mut buf), MASK));
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Encoding and Decoding
// ============================================================================

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for &size in PAYLOAD_SIZES {
        let payload = vec![0x5au8; size];
        let encoded = encode_frame(OpCode::Binary, &payload);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &payload, |b, payload| {
            b.iter(|| encode_frame(OpCode::Binary, black_box(payload)));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| decode_frame(black_box(encoded)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_mask, bench_codec);
criterion_main!(benches);
