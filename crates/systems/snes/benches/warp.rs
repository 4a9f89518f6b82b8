use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use framestep_core::{Button, Engine, InputVector};
use framestep_snes::SnesEngine;

#[allow(dead_code)]
#[path = "../src/testing.rs"]
mod testing;

fn engine() -> SnesEngine {
    let mut engine = SnesEngine::new();
    engine
        .load_rom(&testing::demo_rom())
        .expect("demo ROM loads");
    engine
}

fn bench_single_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("snes_frame");

    group.bench_function("rendered", |b| {
        let mut engine = engine();
        b.iter(|| {
            let frame = engine.step(InputVector::empty(), true).unwrap();
            black_box(frame.pixels[0]);
        });
    });

    group.bench_function("unrendered", |b| {
        let mut engine = engine();
        b.iter(|| {
            engine.step(InputVector::empty(), false).unwrap();
            black_box(engine.memory()[0]);
        });
    });

    group.finish();
}

/// Warp: many frames per call, picture only on the last one.
fn bench_warp(c: &mut Criterion) {
    let mut group = c.benchmark_group("snes_warp");
    let input = InputVector::from(Button::Right);

    for count in [10u32, 60, 300].iter() {
        group.bench_with_input(BenchmarkId::new("tick", count), count, |b, &count| {
            let mut engine = engine();
            b.iter(|| {
                black_box(engine.tick(count, true, input).unwrap());
            });
        });
        group.bench_with_input(BenchmarkId::new("step_loop", count), count, |b, &count| {
            let mut engine = engine();
            b.iter(|| {
                for i in 0..count {
                    engine.step(input, i + 1 == count).unwrap();
                }
                black_box(engine.memory()[0]);
            });
        });
    }

    group.finish();
}

fn bench_save_state(c: &mut Criterion) {
    let mut engine = engine();
    engine.tick(60, true, InputVector::empty()).unwrap();

    c.bench_function("snes_save_state", |b| {
        b.iter(|| black_box(engine.save_state().unwrap().len()));
    });

    let blob = engine.save_state().unwrap();
    c.bench_function("snes_load_state", |b| {
        b.iter(|| engine.load_state(black_box(&blob)).unwrap());
    });
}

criterion_group!(benches, bench_single_frame, bench_warp, bench_save_state);
criterion_main!(benches);
