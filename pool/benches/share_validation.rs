//! Benchmarks for the hot, allocation-free pieces of the per-submit pipeline
//! (§4.4): blob assembly, nonce-format validation, and hashDiff extraction.
//! The RandomX hash itself is excluded — it is a fixed-cost call into the
//! oracle (§5: "treated as a blocking call"), not something this crate's
//! own code can speed up.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use xdagpool_pool::storage::compute_dividend_distribution;
use xdagpool_pool::template::assemble_blob;
use xdagpool_pool::validator::{extract_hash_diff, validate_nonce_hex};
use xdagpool_pool::config::RewardMode;

fn bench_assemble_blob(c: &mut Criterion) {
    let template_buffer = [0x11u8; 32];
    let instance_id = [0xAA, 0xBB, 0xCC, 0xDD];
    let pool_address = [0x42u8; 20];

    c.bench_function("assemble_blob", |b| {
        b.iter(|| assemble_blob(black_box(&template_buffer), black_box(7), black_box(&instance_id), black_box(&pool_address)))
    });
}

fn bench_validate_nonce_hex(c: &mut Criterion) {
    c.bench_function("validate_nonce_hex", |b| {
        b.iter(|| validate_nonce_hex(black_box("0badf00d")))
    });
}

fn bench_extract_hash_diff(c: &mut Criterion) {
    let mut hash = [0u8; 32];
    hash[24..32].copy_from_slice(&123_456_789u64.to_le_bytes());

    c.bench_function("extract_hash_diff", |b| {
        b.iter(|| extract_hash_diff(black_box(&hash)))
    });
}

fn bench_dividend_distribution(c: &mut Criterion) {
    let ratios: Vec<(String, f64)> = (0..64)
        .map(|i| (format!("miner{}", i), 1.0 / 64.0))
        .collect();

    c.bench_function("compute_dividend_distribution_equal_64_miners", |b| {
        b.iter(|| {
            compute_dividend_distribution(
                black_box(RewardMode::Equal),
                black_box(85_000_000_000),
                black_box(2_000_000_000),
                black_box(10_000_000_000),
                black_box(&ratios),
            )
        })
    });
}

criterion_group!(
    benches,
    bench_assemble_blob,
    bench_validate_nonce_hex,
    bench_extract_hash_diff,
    bench_dividend_distribution
);
criterion_main!(benches);
