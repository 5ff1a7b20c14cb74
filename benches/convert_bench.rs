// SPDX-License-Identifier: MPL-2.0

//! Conversion hot-path benchmarks.
//!
//! Compares the auto-dispatched backend against the forced scalar path for
//! the two conversions the capture pipeline hits most: NV12 → BGRA32 and
//! the 4-channel shuffle.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use framegrab::convert::{nv12_to_bgra32, rgba_to_bgra};
use framegrab::{set_convert_backend, ConvertBackend, ConvertFlag};

const WIDTH: i32 = 1920;
const HEIGHT: i32 = 1080;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

fn bench_nv12(c: &mut Criterion) {
    let y = pattern((WIDTH * HEIGHT) as usize);
    let uv = pattern((WIDTH * HEIGHT / 2) as usize);
    let mut dst = vec![0u8; (WIDTH * 4 * HEIGHT) as usize];
    let mut group = c.benchmark_group("nv12_to_bgra32_1080p");

    group.bench_function("auto", |b| {
        set_convert_backend(ConvertBackend::Auto);
        b.iter(|| {
            nv12_to_bgra32(
                black_box(&y),
                WIDTH as usize,
                black_box(&uv),
                WIDTH as usize,
                &mut dst,
                (WIDTH * 4) as usize,
                WIDTH,
                HEIGHT,
                ConvertFlag::DEFAULT,
            );
        });
    });
    group.bench_function("scalar", |b| {
        set_convert_backend(ConvertBackend::Cpu);
        b.iter(|| {
            nv12_to_bgra32(
                black_box(&y),
                WIDTH as usize,
                black_box(&uv),
                WIDTH as usize,
                &mut dst,
                (WIDTH * 4) as usize,
                WIDTH,
                HEIGHT,
                ConvertFlag::DEFAULT,
            );
        });
    });
    group.finish();
    set_convert_backend(ConvertBackend::Auto);
}

fn bench_shuffle(c: &mut Criterion) {
    let src = pattern((WIDTH * 4 * HEIGHT) as usize);
    let mut dst = vec![0u8; (WIDTH * 4 * HEIGHT) as usize];
    let mut group = c.benchmark_group("rgba_to_bgra_1080p");

    group.bench_function("auto", |b| {
        set_convert_backend(ConvertBackend::Auto);
        b.iter(|| {
            rgba_to_bgra(
                black_box(&src),
                (WIDTH * 4) as usize,
                &mut dst,
                (WIDTH * 4) as usize,
                WIDTH,
                HEIGHT,
            );
        });
    });
    group.bench_function("scalar", |b| {
        set_convert_backend(ConvertBackend::Cpu);
        b.iter(|| {
            rgba_to_bgra(
                black_box(&src),
                (WIDTH * 4) as usize,
                &mut dst,
                (WIDTH * 4) as usize,
                WIDTH,
                HEIGHT,
            );
        });
    });
    group.finish();
    set_convert_backend(ConvertBackend::Auto);
}

criterion_group!(benches, bench_nv12, bench_shuffle);
criterion_main!(benches);
