// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Reduction
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Contraction of an S-matrix into probe exit waves.
//!
//! Every output pixel is a sum over the plane-wave axis in stored order,
//! evaluated independently per position. Results therefore do not depend on
//! how positions are batched.

use crate::ctf::Ctf;
use crate::detector::Detector;
use crate::measurement::{Measurement, MeasurementArray};
use crate::scan::{Scan, ScanBatch};
use crate::smatrix_array::SMatrixMetadata;
use crate::wave_vectors::{partition_layout, prism_wave_vectors};
use crate::waves::Waves;
use ndarray::{Array2, Array3, ArrayD, ArrayView3, ArrayViewD, Axis, IxDyn};
use num_complex::{Complex32, Complex64};
use prism_math::fft::Fft2Plan;
use prism_types::constants::DEFAULT_POINTS_PER_RING;
use prism_types::error::{PrismError, PrismResult};
use prism_types::state::AxisMetadata;
use rayon::prelude::*;
use std::f64::consts::PI;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Round to nearest, ties upward.
pub(crate) fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

fn to_c32(z: Complex64) -> Complex32 {
    Complex32::new(z.re as f32, z.im as f32)
}

/// Per-call state shared by all positions.
#[derive(Debug, Clone)]
pub enum Basis {
    /// CTF value of each stored wave vector.
    Dense(Vec<Complex64>),
    /// Beamlets `[partition, x, y]` on the probe window.
    Partitioned(Array3<Complex32>),
}

/// CTF coefficients (dense) or the beamlet basis (partitioned).
pub fn prism_basis(meta: &SMatrixMetadata, ctf: &Ctf) -> PrismResult<Basis> {
    match meta.partitions {
        None => {
            let wavelength = meta.wavelength();
            Ok(Basis::Dense(
                meta.wave_vectors
                    .iter()
                    .map(|k| {
                        let (kx, ky) = (k[0] as f64, k[1] as f64);
                        ctf.evaluate(kx.hypot(ky) * wavelength, ky.atan2(kx))
                    })
                    .collect(),
            ))
        }
        Some(partitions) => Ok(Basis::Partitioned(beamlet_basis(meta, partitions, ctf)?)),
    }
}

/// Beamlet `j`: the probe spectrum restricted by the ring weight of node `j`,
/// centred in the window.
///
/// The CTF defocus is reduced by the accumulated defocus, which restores the
/// propagation phase removed with the tilt.
pub fn beamlet_basis(meta: &SMatrixMetadata, partitions: usize, ctf: &Ctf) -> PrismResult<Array3<Complex32>> {
    let window = meta.interpolated_gpts();
    let window_extent = meta.window_extent();
    let layout = partition_layout(meta.planewave_cutoff, meta.energy, partitions, DEFAULT_POINTS_PER_RING)?;
    if layout.len() != meta.len() {
        return Err(PrismError::Invariant(format!(
            "{} ring nodes for {} stored waves",
            layout.len(),
            meta.len()
        )));
    }
    let lattice = prism_wave_vectors(meta.planewave_cutoff, window_extent, meta.energy, (1, 1));
    let ctf = ctf.clone().with_defocus(ctf.defocus - meta.accumulated_defocus);
    let wavelength = meta.wavelength();

    let mut basis = Array3::<Complex32>::zeros((layout.len(), window.0, window.1));
    for k in lattice.iter() {
        let (kx, ky) = (k[0] as f64, k[1] as f64);
        let value = ctf.evaluate(kx.hypot(ky) * wavelength, ky.atan2(kx));
        let i = (kx * window_extent.0).round() as i64;
        let j = (ky * window_extent.1).round() as i64;
        let (i, j) = (
            i.rem_euclid(window.0 as i64) as usize,
            j.rem_euclid(window.1 as i64) as usize,
        );
        for (node, w) in layout.weights(kx, ky) {
            basis[[node, i, j]] += to_c32(value * w);
        }
    }

    let plan = Fft2Plan::new(window);
    plan.inverse_batch(&mut basis);
    let scale = ((window.0 * window.1) as f64 * (layout.len() as f64 / lattice.len() as f64).sqrt()) as f32;
    let shift = (window.0 / 2, window.1 / 2);
    let mut centred = Array3::zeros(basis.raw_dim());
    centred
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(basis.axis_iter(Axis(0)).into_par_iter())
        .for_each(|(mut dst, src)| {
            for ((p, q), v) in dst.indexed_iter_mut() {
                let sp = (p + window.0 - shift.0) % window.0;
                let sq = (q + window.1 - shift.1) % window.1;
                *v = src[[sp, sq]] * scale;
            }
        });
    Ok(centred)
}

/// Stored-array indices of the window for one position.
///
/// Centred windows start `window / 2` pixels before the probe pixel on the
/// uncropped grid; absolute windows cover the stored grid from its origin.
fn window_indices(meta: &SMatrixMetadata, pixel: (i64, i64), centred: bool) -> PrismResult<(Vec<usize>, Vec<usize>)> {
    let window = meta.interpolated_gpts();
    let axis = |start: i64, n: usize, uncropped: usize, offset: usize, stored: usize| {
        (0..n)
            .map(|p| {
                let global = (start + p as i64).rem_euclid(uncropped as i64);
                let local = (global - offset as i64).rem_euclid(uncropped as i64) as usize;
                if local < stored {
                    Ok(local)
                } else {
                    Err(PrismError::Config(
                        "probe window leaves the cropped S-matrix".to_string(),
                    ))
                }
            })
            .collect::<PrismResult<Vec<usize>>>()
    };
    let (sx, sy) = if centred {
        (pixel.0 - (window.0 / 2) as i64, pixel.1 - (window.1 / 2) as i64)
    } else {
        (0, 0)
    };
    Ok((
        axis(sx, window.0, meta.uncropped_gpts.0, meta.crop_offset.0, meta.gpts.0)?,
        axis(sy, window.1, meta.uncropped_gpts.1, meta.crop_offset.1, meta.gpts.1)?,
    ))
}

fn reduce_dense_one(
    array: &ArrayView3<Complex32>,
    meta: &SMatrixMetadata,
    ctf_values: &[Complex64],
    position: (f64, f64),
) -> PrismResult<Array2<Complex32>> {
    let centred = meta.interpolation != (1, 1);
    let pixel = (
        round_half_up(position.0 / meta.sampling.0),
        round_half_up(position.1 / meta.sampling.1),
    );
    let (ix, iy) = window_indices(meta, pixel, centred)?;
    let mut out = Array2::<Complex32>::zeros((ix.len(), iy.len()));
    for ((k, c), wave) in meta
        .wave_vectors
        .iter()
        .zip(ctf_values)
        .zip(array.axis_iter(Axis(0)))
    {
        let phase = -2.0 * PI * (position.0 * k[0] as f64 + position.1 * k[1] as f64);
        let coefficient = to_c32(c * Complex64::from_polar(1.0, phase));
        for (p, &i) in ix.iter().enumerate() {
            for (q, &j) in iy.iter().enumerate() {
                out[[p, q]] += coefficient * wave[[i, j]];
            }
        }
    }
    Ok(out)
}

fn reduce_partitioned_one(
    array: &ArrayView3<Complex32>,
    meta: &SMatrixMetadata,
    beamlets: &Array3<Complex32>,
    position: (f64, f64),
) -> PrismResult<Array2<Complex32>> {
    let pixel = (
        round_half_up(position.0 / meta.sampling.0),
        round_half_up(position.1 / meta.sampling.1),
    );
    let (ix, iy) = window_indices(meta, pixel, true)?;
    let mut out = Array2::<Complex32>::zeros((ix.len(), iy.len()));
    for (beamlet, wave) in beamlets.axis_iter(Axis(0)).zip(array.axis_iter(Axis(0))) {
        for (p, &i) in ix.iter().enumerate() {
            for (q, &j) in iy.iter().enumerate() {
                out[[p, q]] += beamlet[[p, q]] * wave[[i, j]];
            }
        }
    }
    Ok(out)
}

/// Exit waves at `positions` (`[..., 2]`), one per position.
///
/// `axes_metadata` labels the leading position axes and must match their
/// count.
pub fn reduce_positions(
    array: ArrayView3<Complex32>,
    meta: &SMatrixMetadata,
    basis: &Basis,
    positions: ArrayViewD<f64>,
    axes_metadata: Vec<AxisMetadata>,
) -> PrismResult<Waves> {
    let shape = positions.shape();
    if shape.last() != Some(&2) || axes_metadata.len() + 1 != shape.len() {
        return Err(PrismError::Config(format!(
            "positions of shape {shape:?} need {} axis labels, got {}",
            shape.len().saturating_sub(1),
            axes_metadata.len()
        )));
    }
    if array.len_of(Axis(0)) != meta.len() {
        return Err(PrismError::Invariant(format!(
            "{} stored waves for {} wave vectors",
            array.len_of(Axis(0)),
            meta.len()
        )));
    }
    if meta.partitions.is_some() && !meta.tilt_removed {
        return Err(PrismError::Invariant(
            "partitioned reduction needs a tilt-removed S-matrix".to_string(),
        ));
    }
    let flat: Vec<f64> = positions.iter().copied().collect();
    let points: Vec<(f64, f64)> = flat.chunks_exact(2).map(|p| (p[0], p[1])).collect();

    let waves = points
        .par_iter()
        .map(|&position| match basis {
            Basis::Dense(ctf_values) => reduce_dense_one(&array, meta, ctf_values, position),
            Basis::Partitioned(beamlets) => reduce_partitioned_one(&array, meta, beamlets, position),
        })
        .collect::<PrismResult<Vec<_>>>()?;

    let window = meta.interpolated_gpts();
    let mut out_shape = shape[..shape.len() - 1].to_vec();
    out_shape.extend([window.0, window.1]);
    let mut out = ArrayD::<Complex32>::zeros(IxDyn(&out_shape));
    {
        let mut flat_out = out
            .view_mut()
            .into_shape_with_order((points.len(), window.0, window.1))
            .map_err(|e| PrismError::Invariant(format!("wave layout: {e}")))?;
        for (mut dst, src) in flat_out.axis_iter_mut(Axis(0)).zip(&waves) {
            dst.assign(src);
        }
    }
    let mut result = Waves::new(out, meta.sampling, meta.energy, axes_metadata)?;
    result.antialias_cutoff_gpts = meta.meta_waves().antialias_cutoff_gpts;
    Ok(result)
}

/// Detector values of one scan batch, one array per detector.
pub(crate) fn reduce_batch(
    array: ArrayView3<Complex32>,
    meta: &SMatrixMetadata,
    basis: &Basis,
    detectors: &[Arc<dyn Detector>],
    batch: &ScanBatch,
    axes: &[AxisMetadata],
) -> PrismResult<Vec<MeasurementArray>> {
    let mut shape = batch.shape.clone();
    shape.push(2);
    let positions = batch
        .positions
        .view()
        .into_dyn()
        .into_shape_with_order(IxDyn(&shape))
        .map_err(|e| PrismError::Invariant(format!("batch positions: {e}")))?;
    let waves = reduce_positions(array, meta, basis, positions, axes.to_vec())?;
    detectors.iter().map(|d| d.detect(&waves)).collect()
}

pub(crate) fn allocate_measurements(
    meta: &SMatrixMetadata,
    detectors: &[Arc<dyn Detector>],
    scan: &Scan,
) -> PrismResult<Vec<Measurement>> {
    let meta_waves = meta.meta_waves();
    detectors
        .iter()
        .map(|d| d.allocate_measurement(&meta_waves, scan))
        .collect()
}

/// Write one batch's detector values into its scan region.
pub(crate) fn write_batch(
    measurements: &mut [Measurement],
    index: &[Range<usize>],
    values: &[MeasurementArray],
) -> PrismResult<()> {
    if measurements.len() != values.len() {
        return Err(PrismError::Invariant(format!(
            "{} batch values for {} measurements",
            values.len(),
            measurements.len()
        )));
    }
    for (measurement, values) in measurements.iter_mut().zip(values) {
        measurement.array.put_region(None, index, values, false)?;
    }
    Ok(())
}

/// Reduce one ensemble member over a scan, batch by batch.
///
/// Measurements are allocated once the first batch is ready; each detector
/// then writes every batch into that batch's scan region.
#[instrument(skip_all, name = "reduce_member")]
pub fn reduce_member(
    array: ArrayView3<Complex32>,
    meta: &SMatrixMetadata,
    detectors: &[Arc<dyn Detector>],
    scan: &Scan,
    ctf: &Ctf,
    probes_per_reduction: usize,
) -> PrismResult<Vec<Measurement>> {
    if let Scan::Line(_) = scan {
        return Err(PrismError::Unimplemented(
            "line scans are not supported by S-matrix reduction".to_string(),
        ));
    }
    let basis = prism_basis(meta, ctf)?;
    let axes = scan.axes_metadata();
    let mut measurements: Vec<Measurement> = Vec::with_capacity(detectors.len());
    let batches = scan.batches(probes_per_reduction)?;
    let num_batches = batches.len();
    for (i, batch) in batches.enumerate() {
        let values = reduce_batch(array.view(), meta, &basis, detectors, &batch, &axes)?;
        if i == 0 {
            measurements = allocate_measurements(meta, detectors, scan)?;
        }
        write_batch(&mut measurements, &batch.index, &values)?;
    }
    debug!(
        batches = num_batches,
        positions = scan.num_positions(),
        "Reduced ensemble member."
    );
    Ok(measurements)
}
