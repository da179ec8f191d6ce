// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — S-Matrix Array
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! The propagated plane-wave basis and its derived views.
//!
//! Data is indexed `[ensemble, plane wave, x, y]`. Transforms take `self` by
//! value: eager storage is moved and mutated where possible, deferred storage
//! wraps the parent chunks in new task nodes and never mutates them.

use crate::backend::{
    materialize, rechunk as rechunk_chunks, ArrayBackend, ExecutionMode, HostBackend, LazyChunk, TaskNode, Transfers,
};
use crate::ctf::Ctf;
use crate::detector::Detector;
use crate::distribute::{distribute_reduction, plan_tiles, reduce_tile, stitch_tiles};
use crate::measurement::{stack_measurement_ensembles, DeferredMeasurements, Measurement, MeasurementArray, Measurements};
use crate::multislice::{Multislice, WaveContext};
use crate::potential::{Potential, PotentialSlices};
use crate::reduction::{
    allocate_measurements, prism_basis, reduce_batch, reduce_member, round_half_up, write_batch, Basis,
};
use crate::scan::{CustomScan, GridScan, Scan, ScanBatch};
use crate::smatrix::ChunkSpec;
use crate::wave_vectors::{partition_layout, prism_wave_vectors, WaveVectors};
use crate::waves::MetaWaves;
use ndarray::{stack, Array2, Array3, Array4, ArrayView3, ArrayViewMut3, Axis, CowArray, Ix3};
use num_complex::{Complex32, Complex64};
use prism_math::chunks::generate_chunks;
use prism_math::fft::{fft_interpolate_batch, FourierScaling};
use prism_math::interp::Weights;
use prism_types::config::SimulationConfig;
use prism_types::constants::{energy_to_wavelength, DEFAULT_POINTS_PER_RING, DEFAULT_PROBES_PER_REDUCTION};
use prism_types::error::{PrismError, PrismResult};
use prism_types::state::{BeamTilt, Device, Grid, Normalization, OpticalConfiguration};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Everything about an S-matrix except its values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SMatrixMetadata {
    pub energy: f64,
    pub sampling: (f64, f64),
    /// Stored grid, after any crop.
    pub gpts: (usize, usize),
    pub wave_vectors: WaveVectors,
    pub planewave_cutoff: f64,
    pub interpolation: (usize, usize),
    pub partitions: Option<usize>,
    pub crop_offset: (usize, usize),
    pub uncropped_gpts: (usize, usize),
    pub accumulated_defocus: f64,
    pub tilt_removed: bool,
    pub normalization: Normalization,
    pub tilt: BeamTilt,
    pub device: Device,
    pub has_ensemble_axis: bool,
    pub antialias_cutoff_gpts: Option<(usize, usize)>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SMatrixMetadata {
    pub fn len(&self) -> usize {
        self.wave_vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wave_vectors.is_empty()
    }

    pub fn wavelength(&self) -> f64 {
        energy_to_wavelength(self.energy)
    }

    /// Extent of the uncropped cell.
    pub fn extent(&self) -> (f64, f64) {
        (
            self.uncropped_gpts.0 as f64 * self.sampling.0,
            self.uncropped_gpts.1 as f64 * self.sampling.1,
        )
    }

    /// Probe window: the uncropped grid divided by the interpolation factor.
    pub fn interpolated_gpts(&self) -> (usize, usize) {
        (
            self.uncropped_gpts.0 / self.interpolation.0,
            self.uncropped_gpts.1 / self.interpolation.1,
        )
    }

    pub fn window_extent(&self) -> (f64, f64) {
        let g = self.interpolated_gpts();
        (g.0 as f64 * self.sampling.0, g.1 as f64 * self.sampling.1)
    }

    pub fn is_cropped(&self) -> bool {
        self.gpts != self.uncropped_gpts
    }

    pub fn optics(&self) -> OpticalConfiguration {
        OpticalConfiguration {
            grid: Grid::new(self.extent(), self.uncropped_gpts),
            energy: Some(self.energy),
            tilt: self.tilt,
        }
    }

    pub fn meta_waves(&self) -> MetaWaves {
        MetaWaves {
            gpts: self.interpolated_gpts(),
            sampling: self.sampling,
            energy: self.energy,
            antialias_cutoff_gpts: self
                .antialias_cutoff_gpts
                .map(|g| (g.0 / self.interpolation.0, g.1 / self.interpolation.1)),
            extra_axes_metadata: Vec::new(),
            device: self.device,
        }
    }

    /// Aperture-only CTF at the plane-wave cutoff.
    pub fn default_ctf(&self) -> Ctf {
        Ctf::new(self.planewave_cutoff, self.energy)
    }

    /// Grid scan over the whole cell at 0.9 of the CTF's Nyquist sampling.
    pub fn default_scan(&self, ctf: &Ctf) -> PrismResult<Scan> {
        Ok(GridScan::covering(self.extent(), 0.9 * ctf.nyquist_sampling())?.into())
    }

    fn tilt_geometry(&self) -> TiltGeometry {
        TiltGeometry {
            sampling: self.sampling,
            crop_offset: self.crop_offset,
            uncropped_gpts: self.uncropped_gpts,
            wavelength: self.wavelength(),
            defocus: self.accumulated_defocus,
        }
    }

    /// Stored-array indices of the minimal window covering `positions` along
    /// one axis, and the new crop offset.
    fn crop_axis(&self, axis: usize, positions: &Array2<f64>) -> PrismResult<(usize, Vec<usize>)> {
        let pick = |t: (usize, usize)| if axis == 0 { t.0 } else { t.1 };
        let stored = pick(self.gpts);
        if pick(self.interpolation) == 1 {
            return Ok((pick(self.crop_offset), (0..stored).collect()));
        }
        let uncropped = pick(self.uncropped_gpts) as i64;
        let window = pick(self.interpolated_gpts()) as i64;
        let d = if axis == 0 { self.sampling.0 } else { self.sampling.1 };
        let corners: Vec<i64> = positions
            .column(axis)
            .iter()
            .map(|&p| round_half_up(p / d) - window / 2)
            .collect();
        let lo = corners
            .iter()
            .copied()
            .min()
            .ok_or_else(|| PrismError::Config("cannot crop to an empty set of positions".to_string()))?;
        let hi = corners.iter().copied().max().unwrap_or(lo) + window;
        let (start, size) = if hi - lo >= uncropped { (0, uncropped) } else { (lo, hi - lo) };
        let old_offset = pick(self.crop_offset) as i64;
        let indices = (0..size)
            .map(|i| {
                let local = ((start + i).rem_euclid(uncropped) - old_offset).rem_euclid(uncropped) as usize;
                if local < stored {
                    Ok(local)
                } else {
                    Err(PrismError::Config(format!(
                        "positions leave the cropped region along axis {axis}"
                    )))
                }
            })
            .collect::<PrismResult<Vec<usize>>>()?;
        Ok((start.rem_euclid(uncropped) as usize, indices))
    }

    pub(crate) fn crop_plan(&self, positions: &Array2<f64>) -> PrismResult<CropPlan> {
        let (offset_x, ix) = self.crop_axis(0, positions)?;
        let (offset_y, iy) = self.crop_axis(1, positions)?;
        Ok(CropPlan {
            offset: (offset_x, offset_y),
            ix: Arc::new(ix),
            iy: Arc::new(iy),
        })
    }

    pub(crate) fn cropped(&self, plan: &CropPlan) -> SMatrixMetadata {
        SMatrixMetadata {
            gpts: (plan.ix.len(), plan.iy.len()),
            crop_offset: plan.offset,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CropPlan {
    pub offset: (usize, usize),
    pub ix: Arc<Vec<usize>>,
    pub iy: Arc<Vec<usize>>,
}

pub(crate) fn gather_window(values: ArrayView3<Complex32>, ix: &[usize], iy: &[usize]) -> Array3<Complex32> {
    let n = values.len_of(Axis(0));
    Array3::from_shape_fn((n, ix.len(), iy.len()), |(w, i, j)| values[[w, ix[i], iy[j]]])
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TiltGeometry {
    sampling: (f64, f64),
    crop_offset: (usize, usize),
    uncropped_gpts: (usize, usize),
    wavelength: f64,
    defocus: f64,
}

/// Multiply wave `j` by `exp(s 2πi k_j·r) exp(-s iπλΔf |k_j|²)` with `s = sign`,
/// `r` taken on the uncropped grid.
pub(crate) fn apply_tilt(mut waves: ArrayViewMut3<Complex32>, wave_vectors: &[[f32; 2]], geometry: &TiltGeometry, sign: f64) {
    let (_, nx, ny) = waves.dim();
    let x: Vec<f64> = (0..nx)
        .map(|i| ((geometry.crop_offset.0 + i) % geometry.uncropped_gpts.0) as f64 * geometry.sampling.0)
        .collect();
    let y: Vec<f64> = (0..ny)
        .map(|j| ((geometry.crop_offset.1 + j) % geometry.uncropped_gpts.1) as f64 * geometry.sampling.1)
        .collect();
    waves
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(wave_vectors.par_iter())
        .for_each(|(mut wave, k)| {
            let (kx, ky) = (k[0] as f64, k[1] as f64);
            let defocus = Complex64::from_polar(
                1.0,
                -sign * PI * geometry.wavelength * geometry.defocus * (kx * kx + ky * ky),
            );
            let ex: Vec<Complex64> = x
                .iter()
                .map(|&xi| Complex64::from_polar(1.0, sign * 2.0 * PI * kx * xi) * defocus)
                .collect();
            let ey: Vec<Complex64> = y
                .iter()
                .map(|&yj| Complex64::from_polar(1.0, sign * 2.0 * PI * ky * yj))
                .collect();
            for ((i, j), v) in wave.indexed_iter_mut() {
                let phase = ex[i] * ey[j];
                *v *= Complex32::new(phase.re as f32, phase.im as f32);
            }
        });
}

/// Weighted sums of tilt-removed partitioned waves, with the tilt of each
/// target vector re-applied.
fn interpolate_chunk(
    parent: ArrayView3<Complex32>,
    weights: &[Weights],
    targets: &[[f32; 2]],
    geometry: &TiltGeometry,
    scale: f32,
) -> Array3<Complex32> {
    let (_, nx, ny) = parent.dim();
    let mut out = Array3::zeros((targets.len(), nx, ny));
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(weights.par_iter())
        .for_each(|(mut wave, w)| {
            for &(j, weight) in w {
                let weight = weight as f32 * scale;
                wave.zip_mut_with(&parent.index_axis(Axis(0), j), |a, &b| *a += b * weight);
            }
        });
    apply_tilt(out.view_mut(), targets, geometry, 1.0);
    out
}

#[derive(Debug, Clone)]
pub enum Storage {
    /// `[ensemble, wave, x, y]`.
    Eager(Array4<Complex32>),
    /// Chunks along the wave axis, per ensemble member.
    Deferred(Vec<Vec<LazyChunk>>),
}

/// Options of [`SMatrixArray::reduce`].
#[derive(Debug, Clone)]
pub struct ReduceOptions {
    /// Defaults to a grid over the whole cell.
    pub scan: Option<Scan>,
    /// Defaults to an aperture at the plane-wave cutoff.
    pub ctf: Option<Ctf>,
    /// Reduce `(nx, ny)` scan tiles independently.
    pub distribute: Option<(usize, usize)>,
    pub probes_per_reduction: usize,
}

impl Default for ReduceOptions {
    fn default() -> Self {
        ReduceOptions {
            scan: None,
            ctf: None,
            distribute: None,
            probes_per_reduction: DEFAULT_PROBES_PER_REDUCTION,
        }
    }
}

impl ReduceOptions {
    /// CTF and batch size from a JSON configuration; the scan stays default.
    pub fn from_config(config: &SimulationConfig) -> Self {
        ReduceOptions {
            ctf: Some(Ctf::from_config(&config.ctf, config.energy, config.planewave_cutoff)),
            probes_per_reduction: config.probes_per_reduction,
            ..ReduceOptions::default()
        }
    }

    pub fn with_scan(mut self, scan: impl Into<Scan>) -> Self {
        self.scan = Some(scan.into());
        self
    }

    /// Reduce at a list of positions.
    pub fn with_positions(mut self, positions: &[(f64, f64)]) -> PrismResult<Self> {
        self.scan = Some(CustomScan::from_points(positions)?.into());
        Ok(self)
    }

    pub fn with_ctf(mut self, ctf: Ctf) -> Self {
        self.ctf = Some(ctf);
        self
    }

    pub fn with_distribution(mut self, divisions: (usize, usize)) -> Self {
        self.distribute = Some(divisions);
        self
    }

    pub fn with_probes_per_reduction(mut self, n: usize) -> Self {
        self.probes_per_reduction = n;
        self
    }
}

/// The S-matrix: propagated plane waves plus their metadata.
#[derive(Debug, Clone)]
pub struct SMatrixArray {
    storage: Storage,
    meta: SMatrixMetadata,
    backend: Arc<dyn ArrayBackend>,
}

impl SMatrixArray {
    pub fn from_array(array: Array4<Complex32>, meta: SMatrixMetadata) -> PrismResult<Self> {
        let (_, w, nx, ny) = array.dim();
        if w != meta.len() || (nx, ny) != meta.gpts {
            return Err(PrismError::Invariant(format!(
                "array {:?} does not match {} waves on {:?}",
                array.shape(),
                meta.len(),
                meta.gpts
            )));
        }
        Ok(SMatrixArray {
            storage: Storage::Eager(array),
            meta,
            backend: Arc::new(HostBackend),
        })
    }

    pub fn from_chunks(members: Vec<Vec<LazyChunk>>, meta: SMatrixMetadata) -> PrismResult<Self> {
        for chunks in &members {
            let mut next = 0;
            for chunk in chunks {
                if chunk.range.start != next {
                    return Err(PrismError::Invariant(format!(
                        "chunk {:?} does not continue at {next}",
                        chunk.range
                    )));
                }
                next = chunk.range.end;
            }
            if next != meta.len() {
                return Err(PrismError::Invariant(format!(
                    "chunks cover {next} of {} waves",
                    meta.len()
                )));
            }
        }
        Ok(SMatrixArray {
            storage: Storage::Deferred(members),
            meta,
            backend: Arc::new(HostBackend),
        })
    }

    pub fn with_backend(mut self, backend: Arc<dyn ArrayBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn metadata(&self) -> &SMatrixMetadata {
        &self.meta
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Materialized values, if eager.
    pub fn array(&self) -> Option<&Array4<Complex32>> {
        match &self.storage {
            Storage::Eager(a) => Some(a),
            Storage::Deferred(_) => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.storage, Storage::Deferred(_))
    }

    pub fn len(&self) -> usize {
        self.meta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }

    pub fn wave_vectors(&self) -> &WaveVectors {
        &self.meta.wave_vectors
    }

    pub fn gpts(&self) -> (usize, usize) {
        self.meta.gpts
    }

    pub fn interpolated_gpts(&self) -> (usize, usize) {
        self.meta.interpolated_gpts()
    }

    pub fn meta_waves(&self) -> MetaWaves {
        self.meta.meta_waves()
    }

    pub fn num_ensemble_members(&self) -> usize {
        match &self.storage {
            Storage::Eager(a) => a.len_of(Axis(0)),
            Storage::Deferred(m) => m.len(),
        }
    }

    /// `[ensemble, wave, x, y]`, or `[wave, x, y]` when the ensemble axis is hidden.
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = vec![self.len(), self.meta.gpts.0, self.meta.gpts.1];
        if self.meta.has_ensemble_axis {
            shape.insert(0, self.num_ensemble_members());
        }
        shape
    }

    /// Wave ranges of the deferred chunks of the first member.
    pub fn chunk_ranges(&self) -> Vec<std::ops::Range<usize>> {
        match &self.storage {
            Storage::Eager(_) => vec![0..self.len()],
            Storage::Deferred(m) => m
                .first()
                .map(|chunks| chunks.iter().map(|c| c.range.clone()).collect())
                .unwrap_or_default(),
        }
    }

    fn map_chunks<F>(members: &[Vec<LazyChunk>], f: F) -> Vec<Vec<LazyChunk>>
    where
        F: Fn(&Array3<Complex32>, std::ops::Range<usize>) -> PrismResult<Array3<Complex32>> + Clone + Send + Sync + 'static,
    {
        members
            .iter()
            .map(|chunks| chunks.iter().map(|c| c.map(f.clone())).collect())
            .collect()
    }

    /// Evaluate all deferred chunks.
    #[instrument(skip_all, name = "smatrix_compute")]
    pub fn compute(self) -> PrismResult<Self> {
        let members = match self.storage {
            Storage::Eager(_) => return Ok(self),
            Storage::Deferred(members) => members,
        };
        let arrays = members
            .iter()
            .map(|chunks| materialize(chunks))
            .collect::<PrismResult<Vec<_>>>()?;
        let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
        let array = stack(Axis(0), &views).map_err(|e| PrismError::Invariant(format!("members: {e}")))?;
        debug!(members = arrays.len(), waves = self.meta.len(), "Materialized S-matrix.");
        Ok(SMatrixArray {
            storage: Storage::Eager(array),
            meta: self.meta,
            backend: self.backend,
        })
    }

    /// One array per frozen-phonon configuration, ensemble axis hidden.
    pub fn ensemble_members(self) -> Vec<SMatrixArray> {
        let meta = SMatrixMetadata {
            has_ensemble_axis: false,
            ..self.meta
        };
        let backend = self.backend;
        match self.storage {
            Storage::Eager(array) => array
                .outer_iter()
                .map(|member| SMatrixArray {
                    storage: Storage::Eager(member.to_owned().insert_axis(Axis(0))),
                    meta: meta.clone(),
                    backend: Arc::clone(&backend),
                })
                .collect(),
            Storage::Deferred(members) => members
                .into_iter()
                .map(|chunks| SMatrixArray {
                    storage: Storage::Deferred(vec![chunks]),
                    meta: meta.clone(),
                    backend: Arc::clone(&backend),
                })
                .collect(),
        }
    }

    /// Values of one member, evaluated if deferred.
    pub fn member_array(&self, index: usize) -> PrismResult<CowArray<'_, Complex32, Ix3>> {
        let count = self.num_ensemble_members();
        if index >= count {
            return Err(PrismError::Invariant(format!(
                "member {index} of {count}"
            )));
        }
        match &self.storage {
            Storage::Eager(a) => Ok(CowArray::from(a.index_axis(Axis(0), index))),
            Storage::Deferred(m) => Ok(CowArray::from(materialize(&m[index])?)),
        }
    }

    /// Crop the stored grid to the smallest periodic window that serves
    /// every position. Only axes with interpolation above 1 are cropped.
    pub fn crop_to_positions(self, positions: &Array2<f64>) -> PrismResult<Self> {
        let plan = self.meta.crop_plan(positions)?;
        let meta = self.meta.cropped(&plan);
        let storage = match self.storage {
            Storage::Eager(array) => {
                let members: Vec<Array3<Complex32>> = array
                    .outer_iter()
                    .map(|m| gather_window(m, &plan.ix, &plan.iy))
                    .collect();
                let views: Vec<_> = members.iter().map(|m| m.view()).collect();
                Storage::Eager(stack(Axis(0), &views).map_err(|e| PrismError::Invariant(format!("crop: {e}")))?)
            }
            Storage::Deferred(members) => {
                let (ix, iy) = (plan.ix, plan.iy);
                Storage::Deferred(Self::map_chunks(&members, move |values, _| {
                    Ok(gather_window(values.view(), &ix, &iy))
                }))
            }
        };
        Ok(SMatrixArray {
            storage,
            meta,
            backend: self.backend,
        })
    }

    /// Crop to the limits of a scan.
    pub fn crop_to_scan(self, scan: &Scan) -> PrismResult<Self> {
        let (lo, hi) = scan.limits();
        let corners = Array2::from_shape_vec((2, 2), vec![lo.0, lo.1, hi.0, hi.1])
            .map_err(|e| PrismError::Invariant(format!("scan limits: {e}")))?;
        self.crop_to_positions(&corners)
    }

    /// Re-partition deferred chunks to `chunk` waves each.
    pub fn rechunk(self, chunk: usize) -> PrismResult<Self> {
        let members = match self.storage {
            Storage::Eager(_) => {
                return Err(PrismError::Unsupported(
                    "rechunk needs a deferred S-matrix".to_string(),
                ))
            }
            Storage::Deferred(members) => members,
        };
        let ranges = generate_chunks(self.meta.len(), chunk)?;
        let members = members
            .iter()
            .map(|chunks| rechunk_chunks(chunks, ranges.clone()))
            .collect();
        Ok(SMatrixArray {
            storage: Storage::Deferred(members),
            meta: self.meta,
            backend: self.backend,
        })
    }

    /// Divide out each wave's tilt and propagation phase. Applied at most once.
    pub fn remove_tilt(self) -> PrismResult<Self> {
        if self.meta.tilt_removed {
            return Ok(self);
        }
        let geometry = self.meta.tilt_geometry();
        let storage = match self.storage {
            Storage::Eager(mut array) => {
                for member in array.outer_iter_mut() {
                    apply_tilt(member, self.meta.wave_vectors.as_slice(), &geometry, -1.0);
                }
                Storage::Eager(array)
            }
            Storage::Deferred(members) => {
                let k = Arc::new(self.meta.wave_vectors.clone());
                Storage::Deferred(Self::map_chunks(&members, move |values, range| {
                    let mut out = values.clone();
                    apply_tilt(out.view_mut(), k.slice(range), &geometry, -1.0);
                    Ok(out)
                }))
            }
        };
        Ok(SMatrixArray {
            storage,
            meta: SMatrixMetadata {
                tilt_removed: true,
                ..self.meta
            },
            backend: self.backend,
        })
    }

    /// Expand a partitioned basis onto the full plane-wave lattice.
    #[instrument(skip_all, name = "interpolate_full")]
    pub fn interpolate_full(self, chunk: usize) -> PrismResult<Self> {
        let partitions = self.meta.partitions.ok_or_else(|| {
            PrismError::Unimplemented("interpolate_full needs a partitioned S-matrix".to_string())
        })?;
        let targets = prism_wave_vectors(
            self.meta.planewave_cutoff,
            self.meta.extent(),
            self.meta.energy,
            self.meta.interpolation,
        );
        let ranges = generate_chunks(targets.len(), chunk)?;
        let layout = partition_layout(
            self.meta.planewave_cutoff,
            self.meta.energy,
            partitions,
            DEFAULT_POINTS_PER_RING,
        )?;
        if layout.len() != self.meta.len() {
            return Err(PrismError::Invariant(format!(
                "{} ring nodes for {} stored waves",
                layout.len(),
                self.meta.len()
            )));
        }
        let weights: Arc<Vec<Weights>> = Arc::new(
            targets
                .iter()
                .map(|k| layout.weights(k[0] as f64, k[1] as f64))
                .collect(),
        );
        let scale = (self.meta.len() as f64 / targets.len() as f64).sqrt() as f32;
        info!(
            from = self.meta.len(),
            to = targets.len(),
            "Interpolating partitioned S-matrix onto the full basis."
        );

        let this = self.remove_tilt()?;
        let geometry = this.meta.tilt_geometry();
        let storage = match this.storage {
            Storage::Eager(array) => {
                let members: Vec<Array3<Complex32>> = array
                    .outer_iter()
                    .map(|m| interpolate_chunk(m, &weights, targets.as_slice(), &geometry, scale))
                    .collect();
                let views: Vec<_> = members.iter().map(|m| m.view()).collect();
                Storage::Eager(stack(Axis(0), &views).map_err(|e| PrismError::Invariant(format!("members: {e}")))?)
            }
            Storage::Deferred(members) => {
                let targets = Arc::new(targets.clone());
                Storage::Deferred(
                    members
                        .into_iter()
                        .map(|chunks| {
                            let whole = TaskNode::new(move || materialize(&chunks));
                            ranges
                                .iter()
                                .map(|range| {
                                    let (whole, weights, targets) =
                                        (Arc::clone(&whole), Arc::clone(&weights), Arc::clone(&targets));
                                    let r = range.clone();
                                    LazyChunk::new(
                                        range.clone(),
                                        TaskNode::new(move || {
                                            let parent = whole.get()?;
                                            Ok(interpolate_chunk(
                                                parent.view(),
                                                &weights[r.clone()],
                                                targets.slice(r.clone()),
                                                &geometry,
                                                scale,
                                            ))
                                        }),
                                    )
                                })
                                .collect()
                        })
                        .collect(),
                )
            }
        };
        Ok(SMatrixArray {
            storage,
            meta: SMatrixMetadata {
                wave_vectors: targets,
                partitions: None,
                tilt_removed: false,
                ..this.meta
            },
            backend: this.backend,
        })
    }

    /// Fourier-crop the stored basis to the frequencies within `angle` (mrad).
    pub fn downsample(self, angle: f64) -> PrismResult<Self> {
        if self.meta.is_cropped() {
            return Err(PrismError::Config(
                "downsample the S-matrix before cropping it".to_string(),
            ));
        }
        let new_gpts = self.meta.optics().gpts_within_angle(angle)?;
        let scaling = match self.meta.normalization {
            Normalization::Probe => FourierScaling::Amplitude,
            Normalization::PlaneWaves => FourierScaling::Values,
        };
        let extent = self.meta.extent();
        let meta = SMatrixMetadata {
            sampling: (extent.0 / new_gpts.0 as f64, extent.1 / new_gpts.1 as f64),
            gpts: new_gpts,
            uncropped_gpts: new_gpts,
            ..self.meta
        };
        let storage = match self.storage {
            Storage::Eager(array) => {
                let members: Vec<Array3<Complex32>> = array
                    .outer_iter()
                    .map(|m| fft_interpolate_batch(&m.to_owned(), new_gpts, scaling))
                    .collect();
                let views: Vec<_> = members.iter().map(|m| m.view()).collect();
                Storage::Eager(stack(Axis(0), &views).map_err(|e| PrismError::Invariant(format!("members: {e}")))?)
            }
            Storage::Deferred(members) => Storage::Deferred(Self::map_chunks(&members, move |values, _| {
                Ok(fft_interpolate_batch(values, new_gpts, scaling))
            })),
        };
        Ok(SMatrixArray {
            storage,
            meta,
            backend: self.backend,
        })
    }

    /// Move the values to `device` through the array's backend.
    pub fn to_device(self, device: Device) -> PrismResult<Self> {
        if !self.backend.supports(device) {
            return Err(PrismError::Device(format!(
                "backend '{}' cannot reach device '{device}'",
                self.backend.name()
            )));
        }
        let storage = match self.storage {
            Storage::Eager(array) => {
                let members = array
                    .outer_iter()
                    .map(|m| self.backend.to_device(m.to_owned(), device))
                    .collect::<PrismResult<Vec<_>>>()?;
                let views: Vec<_> = members.iter().map(|m| m.view()).collect();
                Storage::Eager(stack(Axis(0), &views).map_err(|e| PrismError::Invariant(format!("members: {e}")))?)
            }
            Storage::Deferred(members) => {
                let backend = Arc::clone(&self.backend);
                Storage::Deferred(Self::map_chunks(&members, move |values, _| {
                    backend.to_device(values.clone(), device)
                }))
            }
        };
        Ok(SMatrixArray {
            storage,
            meta: SMatrixMetadata { device, ..self.meta },
            backend: self.backend,
        })
    }

    /// Propagate the stored basis through a further potential, `chunks`
    /// waves at a time.
    ///
    /// A basis stored on the host while its backend computes on a device is
    /// streamed: each chunk is uploaded, propagated and downloaded again.
    /// A single member is broadcast over the configurations of the potential;
    /// otherwise members and configurations are paired.
    #[instrument(skip_all, name = "smatrix_multislice")]
    pub fn multislice(
        self,
        potential: Arc<dyn Potential>,
        multislice: Arc<dyn Multislice>,
        chunks: ChunkSpec,
    ) -> PrismResult<Self> {
        if self.meta.tilt_removed {
            return Err(PrismError::Config(
                "cannot propagate a tilt-removed S-matrix".to_string(),
            ));
        }
        if self.meta.is_cropped() {
            return Err(PrismError::Config(
                "cannot propagate a cropped S-matrix".to_string(),
            ));
        }
        let grid = Grid::new(self.meta.extent(), self.meta.gpts).matched(&potential.grid())?;
        let (extent, gpts, _) = grid.check_is_defined()?;
        let members = self.num_ensemble_members();
        let configurations = potential.num_configurations();
        if configurations == 0 {
            return Err(PrismError::Config(
                "potential has no configurations".to_string(),
            ));
        }
        if members != configurations && members != 1 && configurations != 1 {
            return Err(PrismError::Config(format!(
                "{members} ensemble members cannot be paired with {configurations} configurations"
            )));
        }
        let count = members.max(configurations);
        let ranges = generate_chunks(self.meta.len(), chunks.waves_per_chunk(gpts)?)?;
        let streaming = self.meta.device == Device::Cpu && self.backend.device() != Device::Cpu;
        let transfers = if streaming {
            Transfers::new(Arc::clone(&self.backend), self.backend.device(), true)
        } else {
            Transfers::resident(Arc::clone(&self.backend))
        };
        let context = WaveContext {
            extent,
            gpts,
            energy: self.meta.energy,
        };
        let stop = potential.num_slices();
        let angles = self.meta.optics().cutoff_angles()?;
        let cutoff = self.meta.optics().gpts_within_angle(angles.0.min(angles.1))?;
        let antialias = match self.meta.antialias_cutoff_gpts {
            Some(g) => (g.0.min(cutoff.0), g.1.min(cutoff.1)),
            None => cutoff,
        };
        let meta = SMatrixMetadata {
            accumulated_defocus: self.meta.accumulated_defocus + potential.thickness(),
            antialias_cutoff_gpts: Some(antialias),
            has_ensemble_axis: self.meta.has_ensemble_axis || count > 1,
            ..self.meta
        };
        info!(
            waves = meta.len(),
            chunks = ranges.len(),
            members = count,
            streaming,
            "Propagating S-matrix."
        );

        let member_of = |i: usize| if members == 1 { 0 } else { i };
        let configuration_of = |i: usize| if configurations == 1 { 0 } else { i };
        let propagate = move |values: Array3<Complex32>, slices: &PotentialSlices| -> PrismResult<Array3<Complex32>> {
            let values = transfers.upload(values)?;
            let values = multislice.multislice(values, slices, &context, 0, stop)?;
            transfers.download(values)
        };
        let storage = match self.storage {
            Storage::Eager(array) => {
                let mut out = Array4::zeros((count, meta.len(), gpts.0, gpts.1));
                for (i, mut member) in out.outer_iter_mut().enumerate() {
                    let slices = potential.configuration(configuration_of(i))?;
                    let parent = array.index_axis(Axis(0), member_of(i));
                    for range in &ranges {
                        let chunk = parent.slice(ndarray::s![range.clone(), .., ..]).to_owned();
                        member
                            .slice_mut(ndarray::s![range.clone(), .., ..])
                            .assign(&propagate(chunk, slices.as_ref())?);
                    }
                    debug!(member = i, of = count, "Propagated ensemble member.");
                }
                Storage::Eager(out)
            }
            Storage::Deferred(parents) => {
                let propagate = Arc::new(propagate);
                Storage::Deferred(
                    (0..count)
                        .map(|i| {
                            let (potential, c) = (Arc::clone(&potential), configuration_of(i));
                            let slices = TaskNode::new(move || potential.configuration(c));
                            rechunk_chunks(&parents[member_of(i)], ranges.clone())
                                .into_iter()
                                .map(|chunk| {
                                    let (slices, propagate) = (Arc::clone(&slices), Arc::clone(&propagate));
                                    chunk.map(move |values, _| {
                                        let slices = slices.get()?;
                                        let slices: &PotentialSlices = &slices;
                                        propagate(values.clone(), slices)
                                    })
                                })
                                .collect()
                        })
                        .collect(),
                )
            }
        };
        Ok(SMatrixArray {
            storage,
            meta,
            backend: self.backend,
        })
    }

    /// Write values to `path` (`.npy`) and metadata to the sibling `.json`.
    pub fn write_npy(&self, path: impl AsRef<Path>) -> PrismResult<()> {
        let path = path.as_ref();
        match &self.storage {
            Storage::Eager(array) => ndarray_npy::write_npy(path, array)?,
            Storage::Deferred(_) => {
                let computed = self.clone().compute()?;
                return computed.write_npy(path);
            }
        }
        std::fs::write(path.with_extension("json"), serde_json::to_string_pretty(&self.meta)?)?;
        Ok(())
    }

    pub fn read_npy(path: impl AsRef<Path>) -> PrismResult<Self> {
        let path = path.as_ref();
        let array: Array4<Complex32> = ndarray_npy::read_npy(path)?;
        let meta: SMatrixMetadata = serde_json::from_str(&std::fs::read_to_string(path.with_extension("json"))?)?;
        Self::from_array(array, meta)
    }

    /// Values of member `index` prepared for reduction: partitioned bases
    /// are returned tilt-removed.
    pub(crate) fn reduction_member(&self, index: usize) -> PrismResult<(CowArray<'_, Complex32, Ix3>, SMatrixMetadata)> {
        let array = self.member_array(index)?;
        let mut meta = SMatrixMetadata {
            has_ensemble_axis: false,
            ..self.meta.clone()
        };
        if meta.partitions.is_none() || meta.tilt_removed {
            return Ok((array, meta));
        }
        let mut owned = array.into_owned();
        apply_tilt(owned.view_mut(), meta.wave_vectors.as_slice(), &meta.tilt_geometry(), -1.0);
        meta.tilt_removed = true;
        Ok((CowArray::from(owned), meta))
    }

    /// Member `index` as a task node, prepared for reduction like
    /// [`Self::reduction_member`]. Nothing is evaluated here.
    fn reduction_member_node(&self, index: usize) -> PrismResult<(Arc<TaskNode<Array3<Complex32>>>, SMatrixMetadata)> {
        let count = self.num_ensemble_members();
        if index >= count {
            return Err(PrismError::Invariant(format!("member {index} of {count}")));
        }
        let mut meta = SMatrixMetadata {
            has_ensemble_axis: false,
            ..self.meta.clone()
        };
        let source = match &self.storage {
            Storage::Eager(a) => TaskNode::ready(a.index_axis(Axis(0), index).to_owned()),
            Storage::Deferred(m) => {
                let chunks = m[index].clone();
                TaskNode::new(move || materialize(&chunks))
            }
        };
        if meta.partitions.is_none() || meta.tilt_removed {
            return Ok((source, meta));
        }
        let k = Arc::new(meta.wave_vectors.clone());
        let geometry = meta.tilt_geometry();
        meta.tilt_removed = true;
        let node = TaskNode::new(move || {
            let mut values = source.get()?.as_ref().clone();
            apply_tilt(values.view_mut(), k.as_slice(), &geometry, -1.0);
            Ok(values)
        });
        Ok((node, meta))
    }

    /// Scan a probe over the basis and record one measurement per detector.
    ///
    /// Options are validated immediately in both modes. Deferred, every scan
    /// batch (or distributed tile) of every member becomes its own node and
    /// nothing is evaluated before [`Measurements::compute`].
    #[instrument(skip_all, name = "smatrix_reduce")]
    pub fn reduce(
        &self,
        detectors: &[Arc<dyn Detector>],
        options: &ReduceOptions,
        mode: ExecutionMode,
    ) -> PrismResult<Measurements> {
        let ctf = options.ctf.clone().unwrap_or_else(|| self.meta.default_ctf());
        let scan = match &options.scan {
            Some(scan) => scan.clone(),
            None => self.meta.default_scan(&ctf)?,
        };
        if let Scan::Line(_) = scan {
            return Err(PrismError::Unimplemented(
                "line scans are not supported by S-matrix reduction".to_string(),
            ));
        }
        if options.probes_per_reduction == 0 {
            return Err(PrismError::Config(
                "probes_per_reduction must be >= 1".to_string(),
            ));
        }
        let grid = match (&scan, options.distribute) {
            (Scan::Grid(grid), Some(divisions)) => Some((grid.clone(), divisions)),
            (_, Some(_)) => {
                return Err(PrismError::Unimplemented(
                    "only grid scans can be distributed".to_string(),
                ))
            }
            (_, None) => None,
        };
        info!(
            positions = scan.num_positions(),
            detectors = detectors.len(),
            members = self.num_ensemble_members(),
            partitioned = self.meta.partitions.is_some(),
            mode = ?mode,
            "Reducing S-matrix."
        );
        match mode {
            ExecutionMode::Eager => self
                .reduce_eager(detectors, &scan, &ctf, grid, options.probes_per_reduction)
                .map(Measurements::Computed),
            ExecutionMode::Deferred => self
                .reduce_deferred(detectors, scan, ctf, grid, options.probes_per_reduction)
                .map(Measurements::Deferred),
        }
    }

    fn reduce_eager(
        &self,
        detectors: &[Arc<dyn Detector>],
        scan: &Scan,
        ctf: &Ctf,
        grid: Option<(GridScan, (usize, usize))>,
        probes_per_reduction: usize,
    ) -> PrismResult<Vec<Measurement>> {
        let mut ensemble = Vec::with_capacity(self.num_ensemble_members());
        for index in 0..self.num_ensemble_members() {
            let (array, meta) = self.reduction_member(index)?;
            let measurements = match &grid {
                None => reduce_member(array.view(), &meta, detectors, scan, ctf, probes_per_reduction)?,
                Some((grid, divisions)) => distribute_reduction(
                    array.view(),
                    &meta,
                    detectors,
                    grid,
                    *divisions,
                    ctf,
                    probes_per_reduction,
                )?,
            };
            ensemble.push(measurements);
        }
        let means: Vec<bool> = detectors.iter().map(|d| d.ensemble_mean()).collect();
        if self.meta.has_ensemble_axis || ensemble.len() > 1 {
            stack_measurement_ensembles(ensemble, &means)
        } else {
            ensemble
                .pop()
                .ok_or_else(|| PrismError::Invariant("no ensemble members".to_string()))
        }
    }

    fn reduce_deferred(
        &self,
        detectors: &[Arc<dyn Detector>],
        scan: Scan,
        ctf: Ctf,
        grid: Option<(GridScan, (usize, usize))>,
        probes_per_reduction: usize,
    ) -> PrismResult<DeferredMeasurements> {
        let detectors: Arc<Vec<Arc<dyn Detector>>> = Arc::new(detectors.to_vec());
        let ctf = Arc::new(ctf);
        let scan = Arc::new(scan);
        let count = self.num_ensemble_members();
        let mut members = Vec::with_capacity(count);
        let mut blocks = 0;

        match grid {
            None => {
                let batches: Vec<ScanBatch> = scan.batches(probes_per_reduction)?.collect();
                let axes = Arc::new(scan.axes_metadata());
                let mut shared_basis: Option<Arc<TaskNode<Basis>>> = None;
                for index in 0..count {
                    let (array, meta) = self.reduction_member_node(index)?;
                    let meta = Arc::new(meta);
                    let basis = Arc::clone(shared_basis.get_or_insert_with(|| {
                        let (meta, ctf) = (Arc::clone(&meta), Arc::clone(&ctf));
                        TaskNode::new(move || prism_basis(&meta, &ctf))
                    }));
                    let nodes: Vec<(Vec<Range<usize>>, Arc<TaskNode<Vec<MeasurementArray>>>)> = batches
                        .iter()
                        .map(|batch| {
                            let (array, basis, meta, detectors, axes, batch) = (
                                Arc::clone(&array),
                                Arc::clone(&basis),
                                Arc::clone(&meta),
                                Arc::clone(&detectors),
                                Arc::clone(&axes),
                                batch.clone(),
                            );
                            let index = batch.index.clone();
                            let node = TaskNode::new(move || {
                                let values = array.get()?;
                                let basis = basis.get()?;
                                reduce_batch(values.view(), &meta, &basis, &detectors, &batch, &axes)
                            });
                            (index, node)
                        })
                        .collect();
                    blocks += nodes.len();
                    let (detectors, scan) = (Arc::clone(&detectors), Arc::clone(&scan));
                    members.push(TaskNode::new(move || {
                        let values = nodes
                            .par_iter()
                            .map(|(_, node)| node.get())
                            .collect::<PrismResult<Vec<_>>>()?;
                        if nodes.is_empty() {
                            return Ok(Vec::new());
                        }
                        let mut measurements = allocate_measurements(&meta, &detectors, &scan)?;
                        for ((index, _), values) in nodes.iter().zip(&values) {
                            write_batch(&mut measurements, index, values)?;
                        }
                        Ok(measurements)
                    }));
                }
            }
            Some((grid, divisions)) => {
                let grid = Arc::new(grid);
                for index in 0..count {
                    let (array, meta) = self.reduction_member_node(index)?;
                    let tiles = Arc::new(plan_tiles(&meta, &grid, divisions)?);
                    let meta = Arc::new(meta);
                    let nodes: Vec<Arc<TaskNode<Vec<Measurement>>>> = (0..tiles.len())
                        .map(|t| {
                            let (array, meta, tiles, detectors, ctf) = (
                                Arc::clone(&array),
                                Arc::clone(&meta),
                                Arc::clone(&tiles),
                                Arc::clone(&detectors),
                                Arc::clone(&ctf),
                            );
                            TaskNode::new(move || {
                                let values = array.get()?;
                                reduce_tile(values.view(), &meta, &tiles[t], &detectors, &ctf, probes_per_reduction)
                            })
                        })
                        .collect();
                    blocks += nodes.len();
                    let (grid, num_detectors) = (Arc::clone(&grid), detectors.len());
                    members.push(TaskNode::new(move || {
                        let per_tile = nodes
                            .par_iter()
                            .map(|node| node.get())
                            .collect::<PrismResult<Vec<_>>>()?;
                        let per_tile: Vec<&[Measurement]> = per_tile.iter().map(|m| m.as_slice()).collect();
                        stitch_tiles(&per_tile, &grid, divisions, num_detectors)
                    }));
                }
            }
        }
        debug!(members = members.len(), blocks, "Planned deferred reduction.");
        let means: Vec<bool> = detectors.iter().map(|d| d.ensemble_mean()).collect();
        Ok(DeferredMeasurements::new(members, means, blocks))
    }
}
