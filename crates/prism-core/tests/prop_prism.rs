// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Property-Based Tests (proptest) for prism-core
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Property-based and end-to-end tests for the S-matrix engine.
//!
//! Covers: wave-vector sets, probe synthesis, batch invariance, scan
//! distribution, cropping, tilt removal, partitioned bases, deferred builds
//! and reductions, re-propagation, streaming, frozen-phonon ensembles.

use ndarray::{Array2, ArrayD, Axis};
use num_complex::Complex32;
use prism_core::backend::{ArrayBackend, ExecutionMode};
use prism_core::ctf::Ctf;
use prism_core::detector::{AnnularDetector, Detector, PixelatedDetector, WavesDetector};
use prism_core::measurement::{Measurement, Measurements};
use prism_core::multislice::FresnelMultislice;
use prism_core::plane_waves::normalized_plane_waves;
use prism_core::potential::{ArrayPotential, FrozenPhonons, GaussianSite, Potential, PotentialSlices};
use prism_core::scan::GridScan;
use prism_core::smatrix::{ChunkSpec, SMatrix};
use prism_core::smatrix_array::{ReduceOptions, SMatrixArray, Storage};
use prism_core::wave_vectors::prism_wave_vectors;
use prism_types::constants::energy_to_wavelength;
use prism_types::error::PrismResult;
use prism_types::state::{Device, Grid};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn vacuum(interpolation: (usize, usize)) -> SMatrix {
    SMatrix::new(100e3)
        .with_grid(Grid::new((8.0, 8.0), (32, 32)))
        .with_planewave_cutoff(20.0)
        .with_interpolation(interpolation)
}

fn crystal(phonons: Option<FrozenPhonons>) -> Arc<ArrayPotential> {
    let sites: Vec<GaussianSite> = (0..4)
        .map(|i| GaussianSite {
            x: 2.0 + 4.0 * (i / 2) as f64,
            y: 2.0 + 4.0 * (i % 2) as f64,
            slice: i % 3,
            amplitude: 40.0,
            width: 0.4,
        })
        .collect();
    Arc::new(
        ArrayPotential::from_gaussian_sites(&sites, (8.0, 8.0), (32, 32), vec![2.0; 3], phonons)
            .expect("potential"),
    )
}

fn detectors() -> Vec<Arc<dyn Detector>> {
    vec![
        Arc::new(AnnularDetector::new(10.0, 40.0).expect("annular")),
        Arc::new(WavesDetector),
    ]
}

fn reduce_now(s: &SMatrixArray, detectors: &[Arc<dyn Detector>], options: &ReduceOptions) -> Vec<Measurement> {
    s.reduce(detectors, options, ExecutionMode::Eager)
        .and_then(|m| m.compute())
        .expect("reduce")
}

fn complex_values(m: &Measurement) -> &ArrayD<Complex32> {
    m.array.as_complex().expect("complex measurement")
}

fn max_abs_diff<'a>(
    a: impl IntoIterator<Item = &'a Complex32>,
    b: impl IntoIterator<Item = &'a Complex32>,
) -> f32 {
    a.into_iter()
        .zip(b)
        .map(|(x, y)| (x - y).norm())
        .fold(0.0, f32::max)
}

fn max_abs<'a>(a: impl IntoIterator<Item = &'a Complex32>) -> f32 {
    a.into_iter().map(|v| v.norm()).fold(0.0, f32::max)
}

#[derive(Debug, Default)]
struct CountingBackend {
    downloads: AtomicUsize,
}

impl ArrayBackend for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }

    fn device(&self) -> Device {
        Device::Gpu
    }

    fn supports(&self, _device: Device) -> bool {
        true
    }

    fn to_device(
        &self,
        array: ndarray::Array3<Complex32>,
        device: Device,
    ) -> PrismResult<ndarray::Array3<Complex32>> {
        if device == Device::Cpu {
            self.downloads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(array)
    }
}

// ── Wave Vectors ─────────────────────────────────────────────────────

proptest! {
    /// Same inputs, same set; every vector inside the cutoff.
    #[test]
    fn wave_vectors_deterministic_and_bounded(
        cutoff in 5.0f64..40.0,
        ex in 4.0f64..20.0,
        ey in 4.0f64..20.0,
        energy in 60e3f64..300e3,
        ix in 1usize..4,
        iy in 1usize..4,
    ) {
        let a = prism_wave_vectors(cutoff, (ex, ey), energy, (ix, iy));
        let b = prism_wave_vectors(cutoff, (ex, ey), energy, (ix, iy));
        prop_assert_eq!(&a, &b);
        prop_assert!(!a.is_empty());
        prop_assert!(a.max_angle(energy_to_wavelength(energy)) <= cutoff * (1.0 + 1e-5));
    }
}

// ── Cropping ─────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Cropping twice to the same positions changes nothing.
    #[test]
    fn crop_is_idempotent(points in prop::collection::vec((0.0f64..8.0, 0.0f64..8.0), 1..4)) {
        let flat: Vec<f64> = points.iter().flat_map(|&(x, y)| [x, y]).collect();
        let positions = Array2::from_shape_vec((points.len(), 2), flat).expect("positions");
        let once = vacuum((2, 2))
            .build(ExecutionMode::Eager)
            .expect("build")
            .crop_to_positions(&positions)
            .expect("crop");
        let twice = once.clone().crop_to_positions(&positions).expect("crop again");
        prop_assert_eq!(once.metadata(), twice.metadata());
        prop_assert_eq!(once.array(), twice.array());
    }
}

// ── Probe Synthesis ──────────────────────────────────────────────────

#[test]
fn vacuum_reduction_matches_ctf_probe() {
    let s = vacuum((1, 1)).build(ExecutionMode::Eager).expect("build");
    let ctf = Ctf::new(20.0, 100e3);
    let options = ReduceOptions::default()
        .with_positions(&[(0.0, 0.0)])
        .expect("positions")
        .with_ctf(ctf.clone());
    let waves: Vec<Arc<dyn Detector>> = vec![Arc::new(WavesDetector)];
    let m = reduce_now(&s, &waves, &options);
    let reduced = complex_values(&m[0]).index_axis(Axis(0), 0).to_owned();
    let probe = ctf.probe((32, 32), (0.25, 0.25));
    let scale = max_abs(probe.iter());
    assert!(max_abs_diff(reduced.iter(), probe.iter()) < 1e-4 * scale);
}

#[test]
fn end_to_end_vacuum_probe() {
    let (extent, gpts, energy, cutoff) = (20.0, 256, 100e3, 20.0);
    let s = SMatrix::new(energy)
        .with_grid(Grid::new((extent, extent), (gpts, gpts)))
        .with_planewave_cutoff(cutoff)
        .build(ExecutionMode::Eager)
        .expect("build");

    let radius = cutoff * 1e-3 * extent / energy_to_wavelength(energy);
    let mut count = 0;
    for n in -11i64..=11 {
        for m in -11i64..=11 {
            if ((n * n + m * m) as f64) < radius * radius {
                count += 1;
            }
        }
    }
    assert_eq!(s.len(), count);

    let expected = normalized_plane_waves(
        s.wave_vectors().as_slice(),
        (extent, extent),
        (gpts, gpts),
        count,
        (1, 1),
        true,
    );
    assert_eq!(s.array().expect("eager").index_axis(Axis(0), 0), expected);

    // The window is placed around the probe, so a probe at the cell centre
    // peaks at the grid centre (a probe at (0, 0) peaks at pixel (0, 0)).
    let options = ReduceOptions::default()
        .with_positions(&[(extent / 2.0, extent / 2.0)])
        .expect("positions");
    let waves: Vec<Arc<dyn Detector>> = vec![Arc::new(WavesDetector)];
    let m = reduce_now(&s, &waves, &options);
    let (peak, _) = complex_values(&m[0])
        .iter()
        .enumerate()
        .fold((0, 0.0f32), |best, (i, v)| if v.norm_sqr() > best.1 { (i, v.norm_sqr()) } else { best });
    let (px, py) = ((peak / gpts) as i64, (peak % gpts) as i64);
    assert!((px - 128).abs() <= 1 && (py - 128).abs() <= 1, "peak at ({px}, {py})");
}

// ── Reduction ────────────────────────────────────────────────────────

#[test]
fn batch_size_does_not_change_results() {
    let s = vacuum((2, 2))
        .with_potential(crystal(None))
        .build(ExecutionMode::Eager)
        .expect("build");
    let scan = GridScan::new((0.0, 0.0), (8.0, 8.0), (12, 12), false).expect("scan");
    let detectors = detectors();
    let reduce = |n: usize| {
        let options = ReduceOptions::default()
            .with_scan(scan.clone())
            .with_probes_per_reduction(n);
        reduce_now(&s, &detectors, &options)
    };
    let all = reduce(144);
    assert_eq!(reduce(50), all);
    assert_eq!(reduce(300), all);
}

#[test]
fn distributed_reduction_matches_direct() {
    let s = vacuum((2, 2))
        .with_potential(crystal(None))
        .build(ExecutionMode::Eager)
        .expect("build");
    let scan = GridScan::new((0.0, 0.0), (4.0, 4.0), (8, 8), false).expect("scan");
    let detectors = detectors();
    let options = ReduceOptions::default().with_scan(scan);
    let direct = reduce_now(&s, &detectors, &options);
    let distributed = reduce_now(&s, &detectors, &options.clone().with_distribution((2, 2)));
    assert_eq!(direct, distributed);
}

#[test]
fn partitioned_vacuum_matches_dense() {
    let scan = GridScan::new((1.0, 1.0), (5.0, 5.0), (4, 4), false).expect("scan");
    let options = ReduceOptions::default().with_scan(scan);
    let waves: Vec<Arc<dyn Detector>> = vec![Arc::new(WavesDetector)];
    let dense = reduce_now(
        &vacuum((2, 2)).build(ExecutionMode::Eager).expect("dense"),
        &waves,
        &options,
    );
    let partitioned = reduce_now(
        &vacuum((2, 2)).with_partitions(4).build(ExecutionMode::Eager).expect("partitioned"),
        &waves,
        &options,
    );
    let (a, b) = (complex_values(&dense[0]), complex_values(&partitioned[0]));
    assert_eq!(a.shape(), b.shape());
    assert!(max_abs_diff(a.iter(), b.iter()) < 1e-3 * max_abs(a.iter()));
}

#[test]
fn partitioned_reduction_matches_interpolated_full_under_defocus() {
    let built = vacuum((2, 2))
        .with_potential(crystal(None))
        .with_partitions(3)
        .build(ExecutionMode::Eager)
        .expect("partitioned");
    assert!((built.metadata().accumulated_defocus - 6.0).abs() < 1e-12);
    let scan = GridScan::new((0.5, 0.5), (6.5, 6.5), (5, 5), false).expect("scan");
    let options = ReduceOptions::default()
        .with_scan(scan)
        .with_ctf(Ctf::new(20.0, 100e3).with_defocus(15.0));
    let waves: Vec<Arc<dyn Detector>> = vec![Arc::new(WavesDetector)];

    let partitioned = reduce_now(&built, &waves, &options);
    let full = built.interpolate_full(8).expect("interpolate");
    let dense = reduce_now(&full, &waves, &options);
    let (a, b) = (complex_values(&dense[0]), complex_values(&partitioned[0]));
    assert_eq!(a.shape(), b.shape());
    assert!(max_abs_diff(a.iter(), b.iter()) < 1e-4 * max_abs(a.iter()));
}

// ── Derived Views ────────────────────────────────────────────────────

#[test]
fn remove_tilt_applies_once() {
    let s = vacuum((2, 2))
        .with_potential(crystal(None))
        .build(ExecutionMode::Eager)
        .expect("build");
    let once = s.remove_tilt().expect("once");
    let twice = once.clone().remove_tilt().expect("twice");
    assert_eq!(once.array(), twice.array());
    assert!(twice.metadata().tilt_removed);
}

#[test]
fn interpolate_full_matches_dense_build() {
    let dense = vacuum((2, 2)).build(ExecutionMode::Eager).expect("dense");
    let full = vacuum((2, 2))
        .with_partitions(3)
        .build(ExecutionMode::Eager)
        .expect("partitioned")
        .interpolate_full(4)
        .expect("interpolate");
    assert_eq!(full.wave_vectors(), dense.wave_vectors());
    assert!(full.metadata().partitions.is_none());
    let (a, b) = (dense.array().expect("eager"), full.array().expect("eager"));
    assert!(max_abs_diff(a.iter(), b.iter()) < 1e-4 * max_abs(a.iter()));
    let power = |x: &ndarray::Array4<Complex32>| x.iter().map(|v| v.norm_sqr() as f64).sum::<f64>();
    assert!((power(a) / power(b) - 1.0).abs() < 1e-3);
}

#[test]
fn deferred_interpolate_full_matches_eager() {
    let builder = vacuum((2, 2)).with_partitions(3).with_chunks(ChunkSpec::Waves(4));
    let eager = builder
        .build(ExecutionMode::Eager)
        .expect("eager")
        .interpolate_full(5)
        .expect("eager interpolate");
    let deferred = builder
        .build(ExecutionMode::Deferred)
        .expect("deferred")
        .interpolate_full(5)
        .expect("deferred interpolate");
    assert_eq!(deferred.chunk_ranges().first().map(|r| r.len()), Some(5));
    assert_eq!(deferred.compute().expect("compute").array(), eager.array());
}

// ── Deferred Builds ──────────────────────────────────────────────────

#[test]
fn deferred_build_matches_eager() {
    let builder = vacuum((1, 1))
        .with_potential(crystal(None))
        .with_chunks(ChunkSpec::Waves(7));
    let eager = builder.build(ExecutionMode::Eager).expect("eager");
    let deferred = builder.build(ExecutionMode::Deferred).expect("deferred");
    assert!(deferred.is_deferred());
    assert_eq!(deferred.clone().compute().expect("compute").array(), eager.array());
    let rechunked = deferred.rechunk(5).expect("rechunk");
    assert!(rechunked.chunk_ranges().iter().all(|r| r.len() <= 5));
    assert_eq!(rechunked.compute().expect("compute").array(), eager.array());
}

#[test]
fn deferred_streaming_downloads_every_chunk() {
    let backend = Arc::new(CountingBackend::default());
    let s = vacuum((1, 1))
        .with_backend(backend.clone())
        .with_device(Device::Gpu)
        .with_store_on_host(true)
        .with_chunks(ChunkSpec::Waves(4))
        .build(ExecutionMode::Deferred)
        .expect("build");
    let chunks = s.chunk_ranges().len();
    assert_eq!(backend.downloads.load(Ordering::SeqCst), 0);
    s.compute().expect("compute");
    assert_eq!(backend.downloads.load(Ordering::SeqCst), chunks);
}

#[test]
fn deferred_reduce_matches_eager_and_waits_for_compute() {
    let phonons = FrozenPhonons {
        num_configs: 2,
        sigma: 0.1,
        seed: 11,
    };
    let builder = vacuum((2, 2))
        .with_potential(crystal(Some(phonons)))
        .with_chunks(ChunkSpec::Waves(7));
    let scan = GridScan::new((0.0, 0.0), (8.0, 8.0), (8, 8), false).expect("scan");
    let options = ReduceOptions::default().with_scan(scan).with_probes_per_reduction(16);
    let detectors: Vec<Arc<dyn Detector>> = vec![
        Arc::new(AnnularDetector::new(10.0, 40.0).expect("annular")),
        Arc::new(PixelatedDetector { ensemble_mean: false }),
    ];
    let eager = reduce_now(&builder.build(ExecutionMode::Eager).expect("eager"), &detectors, &options);

    let untouched = |s: &SMatrixArray| match s.storage() {
        Storage::Deferred(members) => members.iter().flatten().all(|c| !c.node.is_computed()),
        Storage::Eager(_) => false,
    };
    // 2 members times 4 batches, or times 4 tiles.
    for (opts, blocks) in [(options.clone(), 8), (options.clone().with_distribution((2, 2)), 8)] {
        let lazy = builder.build(ExecutionMode::Deferred).expect("deferred");
        let pending = lazy.reduce(&detectors, &opts, ExecutionMode::Deferred).expect("reduce");
        assert!(untouched(&lazy));
        match &pending {
            Measurements::Deferred(d) => {
                assert_eq!(d.num_members(), 2);
                assert_eq!(d.num_blocks(), blocks);
                assert!(!d.is_computed());
            }
            Measurements::Computed(_) => panic!("deferred reduce returned computed measurements"),
        }
        assert_eq!(pending.compute().expect("compute"), eager);
    }
}

#[test]
fn deferred_reduce_rejects_bad_options_immediately() {
    let lazy = vacuum((1, 1)).build(ExecutionMode::Deferred).expect("deferred");
    let options = ReduceOptions::default().with_probes_per_reduction(0);
    assert!(lazy.reduce(&detectors(), &options, ExecutionMode::Deferred).is_err());
}

// ── Re-propagation ───────────────────────────────────────────────────

fn slab(slices: &PotentialSlices, range: std::ops::Range<usize>) -> Arc<ArrayPotential> {
    let array = slices.array.slice(ndarray::s![range.clone(), .., ..]).to_owned();
    let part = PotentialSlices::new(array, slices.thickness[range].to_vec()).expect("slices");
    Arc::new(ArrayPotential::new(part, (8.0, 8.0)).expect("potential"))
}

#[test]
fn multislice_through_halves_matches_full_build() {
    let whole = crystal(None);
    let slices = whole.configuration(0).expect("configuration");
    let (top, bottom) = (slab(&slices, 0..2), slab(&slices, 2..3));

    let full = vacuum((2, 2))
        .with_potential(whole)
        .build(ExecutionMode::Eager)
        .expect("full");
    for mode in [ExecutionMode::Eager, ExecutionMode::Deferred] {
        let half = vacuum((2, 2))
            .with_potential(top.clone())
            .with_chunks(ChunkSpec::Waves(6))
            .build(mode)
            .expect("half");
        assert!((half.metadata().accumulated_defocus - 4.0).abs() < 1e-12);
        let stacked = half
            .multislice(bottom.clone(), Arc::new(FresnelMultislice), ChunkSpec::Waves(5))
            .expect("multislice")
            .compute()
            .expect("compute");
        assert_eq!(stacked.metadata(), full.metadata());
        let (a, b) = (full.array().expect("eager"), stacked.array().expect("eager"));
        assert!(max_abs_diff(a.iter(), b.iter()) < 1e-5 * max_abs(a.iter()));
    }
}

#[test]
fn multislice_broadcasts_single_member_over_configurations() {
    let phonons = FrozenPhonons {
        num_configs: 3,
        sigma: 0.1,
        seed: 3,
    };
    let s = vacuum((1, 1))
        .build(ExecutionMode::Eager)
        .expect("vacuum")
        .multislice(crystal(Some(phonons)), Arc::new(FresnelMultislice), ChunkSpec::Waves(8))
        .expect("multislice");
    assert_eq!(s.num_ensemble_members(), 3);
    assert!(s.metadata().has_ensemble_axis);
    assert!((s.metadata().accumulated_defocus - 6.0).abs() < 1e-12);
}

// ── Ensembles ────────────────────────────────────────────────────────

#[test]
fn frozen_phonon_scan_matches_build_then_reduce() {
    let phonons = FrozenPhonons {
        num_configs: 3,
        sigma: 0.1,
        seed: 7,
    };
    let builder = vacuum((2, 2)).with_potential(crystal(Some(phonons)));
    let scan = GridScan::new((0.0, 0.0), (4.0, 4.0), (4, 4), false).expect("scan");
    let options = ReduceOptions::default().with_scan(scan);
    let detectors: Vec<Arc<dyn Detector>> = vec![
        Arc::new(AnnularDetector::new(10.0, 40.0).expect("annular")),
        Arc::new(PixelatedDetector { ensemble_mean: false }),
    ];

    let built = builder.build(ExecutionMode::Eager).expect("build");
    assert_eq!(built.shape()[0], 3);
    let reduced = reduce_now(&built, &detectors, &options);
    let scanned = builder
        .scan(&detectors, &options, ExecutionMode::Eager)
        .expect("scan");
    assert!(!scanned.is_deferred());
    let scanned = scanned.compute().expect("scanned");
    let deferred = builder
        .scan(&detectors, &options, ExecutionMode::Deferred)
        .expect("deferred scan");
    assert!(deferred.is_deferred());
    let deferred = deferred.compute().expect("deferred");

    assert_eq!(reduced[0].shape(), &[4, 4]);
    assert_eq!(reduced[1].shape()[0], 3);
    assert!(reduced[1].has_ensemble_axis());
    assert_eq!(scanned, reduced);
    assert_eq!(deferred, reduced);
}
