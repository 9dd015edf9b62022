//! Work-queue and host-backend throughput.
//!
//! Measures:
//! 1. `par_for` dispatch over empty bodies, by pool size
//! 2. `par_for` over a small fixed amount of work per iteration
//! 3. Realizing a 3x3 box blur, serial vs parallel rows

use std::sync::atomic::{AtomicU64, Ordering};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use prism::{Buffer, Expr, Image, Pipeline, Runtime, RuntimeConfig, Var, WorkQueue};

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("par_for_dispatch");
    for threads in [1, 2, 4, 8] {
        let queue = WorkQueue::new(threads);
        group.bench_with_input(BenchmarkId::from_parameter(threads), &queue, |b, queue| {
            b.iter(|| queue.par_for(0, black_box(1024), &|i| {
                black_box(i);
            }))
        });
    }
    group.finish();
}

fn bench_work(c: &mut Criterion) {
    let queue = WorkQueue::new(8);
    let total = AtomicU64::new(0);
    c.bench_function("par_for_work_4096", |b| {
        b.iter(|| {
            queue.par_for(0, 4096, &|i| {
                let mut h = i as u64;
                for _ in 0..64 {
                    h = h.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(7);
                }
                total.fetch_add(h & 1, Ordering::Relaxed);
            })
        })
    });
}

fn box_blur(parallel: bool) -> (Pipeline, prism::Func) {
    let (w, h) = (128, 64);
    let data: Vec<f32> = (0..(w + 2) * (h + 2)).map(|i| (i % 31) as f32).collect();
    let input = Image::new("input", Buffer::from_slice(&[w + 2, h + 2], &data).unwrap());
    let (x, y) = (Var::new("x"), Var::new("y"));

    let mut p = Pipeline::new();
    let f = p.func("box");
    let mut sum = Expr::float(0.0);
    for dy in 0..3 {
        for dx in 0..3 {
            sum = sum + input.at([&x + dx, &y + dy]);
        }
    }
    p.define(f, [&x, &y], sum / 9.0f32).unwrap();
    if parallel {
        p.schedule(f).parallel(&y).vectorize_by(&x, 8);
    }
    (p, f)
}

fn bench_realize(c: &mut Criterion) {
    let rt = Runtime::new(RuntimeConfig::default());
    let mut group = c.benchmark_group("box_blur_128x64");
    for (name, parallel) in [("serial", false), ("parallel", true)] {
        let (mut p, f) = box_blur(parallel);
        let mut out = p.realize(&rt, f, &[128, 64]).unwrap();
        group.bench_function(name, |b| b.iter(|| p.realize_into(&rt, f, &mut out).unwrap()));
    }
    group.finish();
}

criterion_group!(benches, bench_dispatch, bench_work, bench_realize);
criterion_main!(benches);
