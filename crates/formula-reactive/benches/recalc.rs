use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use formula_reactive::{
    extract_variables, Engine, EngineOptions, ManualClock, RawConfig, RawField,
};

/// `width` independent chains of `depth` derived fields hanging off one input each.
fn chains(width: usize, depth: usize) -> RawConfig {
    let mut raw = RawConfig::new();
    for w in 0..width {
        raw.push(format!("in{w}"), RawField::input(w as f64));
        for d in 0..depth {
            let prev = if d == 0 {
                format!("in{w}")
            } else {
                format!("c{w}_{}", d - 1)
            };
            raw.push(
                format!("c{w}_{d}"),
                RawField::derived(format!("{prev} * 1.01 + sqrt(abs({prev})) - 0.5")),
            );
        }
    }
    raw
}

fn engine(raw: RawConfig) -> Engine {
    Engine::initialize_with(raw, EngineOptions::default(), ManualClock::new())
        .expect("benchmark configuration is acyclic")
}

fn bench_recalc(c: &mut Criterion) {
    let mut group = c.benchmark_group("recalc");

    group.bench_function("initialize_64x32", |b| {
        b.iter_batched(
            || chains(64, 32),
            |raw| black_box(engine(raw)),
            BatchSize::SmallInput,
        )
    });

    let mut single = engine(chains(64, 32));
    let mut value = 0.0;
    group.bench_function("single_chain_pass", |b| {
        b.iter(|| {
            value += 1.0;
            single.set("in7", value).expect("input field");
            black_box(single.flush().expect("pass completes"))
        })
    });

    let mut burst = engine(chains(64, 32));
    let mut value = 0.0;
    group.bench_function("coalesced_burst_of_64_writes", |b| {
        b.iter(|| {
            for w in 0..64 {
                value += 1.0;
                burst.set(&format!("in{w}"), value).expect("input field");
            }
            black_box(burst.flush().expect("pass completes"))
        })
    });

    group.finish();
}

fn bench_parser(c: &mut Criterion) {
    let formula = "sqrt(pow(width, 2) + pow(height, 2)) * scale + max(offset_x, offset_y, 0) / 2";
    c.bench_function("extract_variables", |b| {
        b.iter(|| black_box(extract_variables(black_box(formula))))
    });
}

criterion_group!(benches, bench_recalc, bench_parser);
criterion_main!(benches);
