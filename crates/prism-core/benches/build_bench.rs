// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — S-Matrix Build Benchmark
// © 1998–2026 Miroslav Šotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use prism_core::backend::ExecutionMode;
use prism_core::potential::{ArrayPotential, FrozenPhonons, GaussianSite};
use prism_core::smatrix::{ChunkSpec, SMatrix};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use std::hint::black_box;
use std::sync::Arc;

fn random_potential(gpts: usize, extent: f64) -> Arc<ArrayPotential> {
    let mut rng = StdRng::seed_from_u64(42);
    let sites: Vec<GaussianSite> = (0..64)
        .map(|i| GaussianSite {
            x: rng.gen_range(0.0..extent),
            y: rng.gen_range(0.0..extent),
            slice: i % 8,
            amplitude: 30.0,
            width: 0.4,
        })
        .collect();
    let phonons = FrozenPhonons {
        num_configs: 1,
        sigma: 0.08,
        seed: 1,
    };
    Arc::new(
        ArrayPotential::from_gaussian_sites(&sites, (extent, extent), (gpts, gpts), vec![2.0; 8], Some(phonons))
            .expect("potential should build"),
    )
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("smatrix_build");
    group.sample_size(10);

    for &gpts in &[64usize, 128] {
        let potential = random_potential(gpts, 16.0);
        for &interpolation in &[1usize, 2] {
            let builder = SMatrix::new(200e3)
                .with_potential(potential.clone())
                .with_planewave_cutoff(20.0)
                .with_interpolation((interpolation, interpolation))
                .with_chunks(ChunkSpec::Waves(32));
            let label = format!("{gpts}x{gpts}_interp{interpolation}");
            group.bench_with_input(BenchmarkId::from_parameter(label), &builder, |b, builder| {
                b.iter(|| {
                    let s = builder.build(ExecutionMode::Eager).expect("build should succeed");
                    black_box(s.len());
                })
            });
        }
    }

    group.finish();
}

fn bench_partitioned_build(c: &mut Criterion) {
    let potential = random_potential(128, 16.0);
    let builder = SMatrix::new(200e3)
        .with_potential(potential)
        .with_planewave_cutoff(20.0)
        .with_interpolation((2, 2))
        .with_partitions(6);
    c.bench_function("smatrix_build_partitioned_128", |b| {
        b.iter(|| {
            let s = builder.build(ExecutionMode::Eager).expect("build should succeed");
            black_box(s.len());
        })
    });
}

criterion_group!(benches, bench_build, bench_partitioned_build);
criterion_main!(benches);
