//! Criterion benchmarks for the image-side hot paths on CPU: placeholder
//! merging, patch pooling and windowed mask construction.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{DType, Device, Tensor};
use vlm_core::layers::{avg_pool_1d, position_mask};
use vlm_core::multimodal::{merge_placeholders, Input, MultimodalPayload};

const HIDDEN: usize = 64;

fn payload(tokens: usize) -> MultimodalPayload {
    let embedding =
        Tensor::zeros((1, 1, tokens, HIDDEN), DType::F32, &Device::Cpu).expect("zeros failed");
    MultimodalPayload::new(embedding).expect("payload failed")
}

/// `runs` image runs of `images` placeholders each, separated by text.
fn prompt(runs: usize, images: usize, tokens: usize) -> Vec<Input> {
    let mut inputs = Vec::new();
    for r in 0..runs {
        inputs.push(Input::token(r as u32));
        for i in 0..images {
            inputs.push(Input::placeholder(payload(tokens), (r * images + i) as u64));
        }
    }
    inputs.push(Input::token(1));
    inputs
}

// ---------------------------------------------------------------------------
// Placeholder merging
// ---------------------------------------------------------------------------

fn bench_merge_placeholders(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_placeholders");

    for &images in &[1, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("images_per_run", images), &images, |b, &images| {
            b.iter_batched(
                || prompt(4, images, 256),
                |inputs| merge_placeholders(black_box(inputs)).expect("merge failed"),
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_merge_text_only(c: &mut Criterion) {
    c.bench_function("merge_text_only_4096", |b| {
        b.iter_batched(
            || (0..4096u32).map(Input::token).collect::<Vec<_>>(),
            |inputs| merge_placeholders(black_box(inputs)).expect("merge failed"),
            criterion::BatchSize::SmallInput,
        );
    });
}

// ---------------------------------------------------------------------------
// Patch pooling
// ---------------------------------------------------------------------------

fn bench_patch_pooling(c: &mut Criterion) {
    let mut group = c.benchmark_group("avg_pool_1d");

    // 896/14 -> 4096 patches pooled to 256; 448/14 -> 1024 pooled to 256
    for &(patches, kernel) in &[(4096usize, 16usize), (1024, 4)] {
        let xs = Tensor::ones((1, HIDDEN, patches), DType::F32, &Device::Cpu)
            .expect("ones failed");
        group.bench_with_input(BenchmarkId::new("patches", patches), &xs, |b, xs| {
            b.iter(|| avg_pool_1d(black_box(xs), kernel, kernel, 0).expect("pool failed"));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Attention masks
// ---------------------------------------------------------------------------

fn bench_position_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("position_mask");

    for &kv_len in &[512usize, 2048] {
        let keys: Vec<usize> = (0..kv_len).collect();
        let prefill: Vec<usize> = (0..kv_len).collect();
        let decode = vec![kv_len];

        group.bench_with_input(BenchmarkId::new("prefill_causal", kv_len), &kv_len, |b, _| {
            b.iter(|| {
                position_mask(black_box(&prefill), &keys, None, DType::F32, &Device::Cpu)
                    .expect("mask failed")
            });
        });
        group.bench_with_input(BenchmarkId::new("decode_window_512", kv_len), &kv_len, |b, _| {
            b.iter(|| {
                position_mask(black_box(&decode), &keys, Some(512), DType::F32, &Device::Cpu)
                    .expect("mask failed")
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_merge_placeholders,
    bench_merge_text_only,
    bench_patch_pooling,
    bench_position_mask,
);
criterion_main!(benches);
