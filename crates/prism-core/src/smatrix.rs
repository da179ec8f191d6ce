// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — S-Matrix Builder
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Builds the propagated plane-wave basis.
//!
//! The wave vectors are split into chunks. Each chunk is synthesized,
//! propagated through the potential and optionally Fourier-cropped on its
//! own, so peak memory is one chunk of waves plus the assembled result.

use crate::backend::{ArrayBackend, ExecutionMode, HostBackend, LazyChunk, TaskNode, Transfers};
use crate::detector::Detector;
use crate::measurement::{Measurement, Measurements};
use crate::multislice::{FresnelMultislice, Multislice, WaveContext};
use crate::plane_waves::normalized_plane_waves;
use crate::potential::{Potential, PotentialSlices};
use crate::smatrix_array::{ReduceOptions, SMatrixArray, SMatrixMetadata};
use crate::wave_vectors::{partitioned_prism_wave_vectors, prism_wave_vectors, WaveVectors};
use ndarray::{concatenate, stack, Array3, Axis};
use num_complex::Complex32;
use prism_math::chunks::{chunk_size_from_bytes, generate_chunks};
use prism_math::fft::{fft_interpolate_batch, FourierScaling};
use prism_types::config::SimulationConfig;
use prism_types::constants::{DEFAULT_CHUNK_BYTES, DEFAULT_PLANEWAVE_CUTOFF, DEFAULT_POINTS_PER_RING};
use prism_types::error::{PrismError, PrismResult};
use prism_types::state::{BeamTilt, Device, Grid, Normalization, OpticalConfiguration};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// How many plane waves are synthesized and propagated together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSpec {
    Waves(usize),
    /// Byte budget per chunk, at 8 bytes per complex grid point.
    Bytes(usize),
}

impl Default for ChunkSpec {
    fn default() -> Self {
        ChunkSpec::Bytes(DEFAULT_CHUNK_BYTES)
    }
}

impl ChunkSpec {
    pub(crate) fn waves_per_chunk(self, gpts: (usize, usize)) -> PrismResult<usize> {
        match self {
            ChunkSpec::Waves(0) | ChunkSpec::Bytes(0) => Err(PrismError::Config(
                "chunk size must be >= 1".to_string(),
            )),
            ChunkSpec::Waves(n) => Ok(n),
            ChunkSpec::Bytes(budget) => Ok(chunk_size_from_bytes(
                budget,
                gpts.0 * gpts.1 * std::mem::size_of::<Complex32>(),
            )),
        }
    }
}

/// Configuration of a PRISM S-matrix.
#[derive(Clone)]
pub struct SMatrix {
    potential: Option<Arc<dyn Potential>>,
    multislice: Arc<dyn Multislice>,
    optics: OpticalConfiguration,
    planewave_cutoff: f64,
    interpolation: (usize, usize),
    partitions: Option<usize>,
    normalize: bool,
    normalization: Normalization,
    chunks: ChunkSpec,
    device: Device,
    backend: Arc<dyn ArrayBackend>,
    store_on_host: bool,
    downsample: Option<f64>,
    start: usize,
    stop: Option<usize>,
}

impl fmt::Debug for SMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SMatrix")
            .field("has_potential", &self.potential.is_some())
            .field("optics", &self.optics)
            .field("planewave_cutoff", &self.planewave_cutoff)
            .field("interpolation", &self.interpolation)
            .field("partitions", &self.partitions)
            .field("normalize", &self.normalize)
            .field("chunks", &self.chunks)
            .field("device", &self.device)
            .field("backend", &self.backend.name())
            .field("store_on_host", &self.store_on_host)
            .field("downsample", &self.downsample)
            .finish()
    }
}

impl SMatrix {
    pub fn new(energy: f64) -> Self {
        SMatrix {
            potential: None,
            multislice: Arc::new(FresnelMultislice),
            optics: OpticalConfiguration::new(Grid::default(), energy),
            planewave_cutoff: DEFAULT_PLANEWAVE_CUTOFF,
            interpolation: (1, 1),
            partitions: None,
            normalize: true,
            normalization: Normalization::Probe,
            chunks: ChunkSpec::default(),
            device: Device::Cpu,
            backend: Arc::new(HostBackend),
            store_on_host: false,
            downsample: None,
            start: 0,
            stop: None,
        }
    }

    /// Builder from a JSON configuration.
    pub fn from_config(config: &SimulationConfig) -> PrismResult<Self> {
        config.validate()?;
        let mut smatrix = SMatrix::new(config.energy)
            .with_grid(config.grid())
            .with_planewave_cutoff(config.planewave_cutoff)
            .with_interpolation((config.interpolation[0], config.interpolation[1]))
            .with_normalize(config.normalize)
            .with_normalization(config.normalization()?)
            .with_tilt(BeamTilt {
                x: config.tilt[0],
                y: config.tilt[1],
            })
            .with_device(config.device)
            .with_store_on_host(config.store_on_host)
            .with_chunks(match config.chunks {
                Some(n) => ChunkSpec::Waves(n),
                None => ChunkSpec::Bytes(config.chunk_bytes),
            });
        smatrix.partitions = config.partitions;
        smatrix.downsample = config.downsample;
        Ok(smatrix)
    }

    pub fn with_potential(mut self, potential: Arc<dyn Potential>) -> Self {
        self.potential = Some(potential);
        self
    }

    pub fn with_multislice(mut self, multislice: Arc<dyn Multislice>) -> Self {
        self.multislice = multislice;
        self
    }

    /// Grid fields left undefined are taken from the potential.
    pub fn with_grid(mut self, grid: Grid) -> Self {
        self.optics.grid = grid;
        self
    }

    pub fn with_planewave_cutoff(mut self, cutoff: f64) -> Self {
        self.planewave_cutoff = cutoff;
        self
    }

    pub fn with_interpolation(mut self, interpolation: (usize, usize)) -> Self {
        self.interpolation = interpolation;
        self
    }

    /// Use a ring-partitioned basis with `partitions` rings (centre included).
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = Some(partitions);
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_chunks(mut self, chunks: ChunkSpec) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn with_tilt(mut self, tilt: BeamTilt) -> Self {
        self.optics.tilt = tilt;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn ArrayBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Download each chunk to the host right after it is propagated.
    pub fn with_store_on_host(mut self, store_on_host: bool) -> Self {
        self.store_on_host = store_on_host;
        self
    }

    /// Keep only the frequencies within `angle` (mrad) in the stored basis.
    pub fn with_downsample(mut self, angle: f64) -> Self {
        self.downsample = Some(angle);
        self
    }

    /// Propagate through slices `start..stop` (backwards when `stop < start`).
    pub fn with_slice_range(mut self, start: usize, stop: Option<usize>) -> Self {
        self.start = start;
        self.stop = stop;
        self
    }

    pub fn optics(&self) -> &OpticalConfiguration {
        &self.optics
    }

    fn matched_grid(&self) -> PrismResult<Grid> {
        match &self.potential {
            Some(potential) => self.optics.grid.matched(&potential.grid()),
            None => Ok(self.optics.grid),
        }
    }

    /// The plane-wave basis this configuration builds.
    pub fn wave_vectors(&self) -> PrismResult<WaveVectors> {
        let energy = self.optics.check_energy()?;
        let (extent, _, _) = self.matched_grid()?.check_is_defined()?;
        match self.partitions {
            None => Ok(prism_wave_vectors(
                self.planewave_cutoff,
                extent,
                energy,
                self.interpolation,
            )),
            Some(rings) => partitioned_prism_wave_vectors(
                self.planewave_cutoff,
                extent,
                energy,
                rings,
                DEFAULT_POINTS_PER_RING,
            ),
        }
    }

    /// Grid points of the probe window.
    pub fn interpolated_gpts(&self) -> PrismResult<(usize, usize)> {
        let (_, gpts, _) = self.matched_grid()?.check_is_defined()?;
        Ok((gpts.0 / self.interpolation.0, gpts.1 / self.interpolation.1))
    }

    fn plan(&self) -> PrismResult<BuildPlan> {
        let energy = self.optics.check_energy()?;
        if !self.planewave_cutoff.is_finite() || self.planewave_cutoff <= 0.0 {
            return Err(PrismError::Config(format!(
                "planewave_cutoff must be > 0, got {}",
                self.planewave_cutoff
            )));
        }
        if self.interpolation.0 == 0 || self.interpolation.1 == 0 {
            return Err(PrismError::Config(format!(
                "interpolation factors must be >= 1, got {:?}",
                self.interpolation
            )));
        }
        let grid = self.matched_grid()?;
        let (extent, gpts, _) = grid.check_is_defined()?;
        if self.interpolation.0 > gpts.0 || self.interpolation.1 > gpts.1 {
            return Err(PrismError::Config(format!(
                "interpolation {:?} exceeds grid {gpts:?}",
                self.interpolation
            )));
        }
        if !self.backend.supports(self.device) {
            return Err(PrismError::Device(format!(
                "backend '{}' cannot reach device '{}'",
                self.backend.name(),
                self.device
            )));
        }
        let optics = OpticalConfiguration {
            grid,
            energy: Some(energy),
            tilt: self.optics.tilt,
        };
        let storage_gpts = match self.downsample {
            Some(angle) => optics.gpts_within_angle(angle)?,
            None => gpts,
        };
        let wave_vectors = Arc::new(self.wave_vectors()?);
        let chunk = self.chunks.waves_per_chunk(gpts)?;
        let ranges = generate_chunks(wave_vectors.len(), chunk)?;

        let (num_configurations, stop, antialias) = match &self.potential {
            Some(potential) => {
                let n = potential.num_slices();
                let stop = self.stop.unwrap_or(n);
                if self.start > n || stop > n {
                    return Err(PrismError::Config(format!(
                        "slice range {}..{stop} outside potential with {n} slices",
                        self.start
                    )));
                }
                let angles = optics.cutoff_angles()?;
                let cutoff = optics.gpts_within_angle(angles.0.min(angles.1))?;
                (
                    potential.num_configurations(),
                    stop,
                    Some((cutoff.0.min(storage_gpts.0), cutoff.1.min(storage_gpts.1))),
                )
            }
            None => (1, 0, None),
        };
        if num_configurations == 0 {
            return Err(PrismError::Config(
                "potential has no configurations".to_string(),
            ));
        }

        let meta = SMatrixMetadata {
            energy,
            sampling: (
                extent.0 / storage_gpts.0 as f64,
                extent.1 / storage_gpts.1 as f64,
            ),
            gpts: storage_gpts,
            wave_vectors: wave_vectors.as_ref().clone(),
            planewave_cutoff: self.planewave_cutoff,
            interpolation: self.interpolation,
            partitions: self.partitions,
            crop_offset: (0, 0),
            uncropped_gpts: storage_gpts,
            accumulated_defocus: self.potential.as_ref().map_or(0.0, |p| p.thickness()),
            tilt_removed: false,
            normalization: self.normalization,
            tilt: self.optics.tilt,
            device: if self.store_on_host { Device::Cpu } else { self.device },
            has_ensemble_axis: num_configurations > 1,
            antialias_cutoff_gpts: antialias,
            metadata: BTreeMap::new(),
        };
        debug!(
            ?gpts,
            ?storage_gpts,
            waves = wave_vectors.len(),
            chunks = ranges.len(),
            "Planned S-matrix build."
        );
        Ok(BuildPlan {
            context: WaveContext { extent, gpts, energy },
            wave_vectors,
            ranges,
            interpolation: self.interpolation,
            normalize: self.normalize,
            storage_gpts,
            scaling: match self.normalization {
                Normalization::Probe => FourierScaling::Amplitude,
                Normalization::PlaneWaves => FourierScaling::Values,
            },
            multislice: Arc::clone(&self.multislice),
            transfers: Transfers::new(Arc::clone(&self.backend), self.device, self.store_on_host),
            start: self.start,
            stop,
            num_configurations,
            meta,
        })
    }

    fn configuration(&self, index: usize) -> PrismResult<Option<Arc<PotentialSlices>>> {
        self.potential
            .as_ref()
            .map(|p| p.configuration(index))
            .transpose()
    }

    fn build_member_eager(&self, plan: &BuildPlan, index: usize) -> PrismResult<Array3<Complex32>> {
        let slices = self.configuration(index)?;
        let chunks = plan
            .ranges
            .iter()
            .map(|range| plan.build_chunk(slices.as_deref(), range.clone()))
            .collect::<PrismResult<Vec<_>>>()?;
        let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
        concatenate(Axis(0), &views).map_err(|e| PrismError::Invariant(format!("chunks: {e}")))
    }

    fn build_member_deferred(&self, plan: &Arc<BuildPlan>, index: usize) -> Vec<LazyChunk> {
        let potential = self.potential.clone();
        let slices = TaskNode::new(move || match &potential {
            Some(p) => p.configuration(index).map(Some),
            None => Ok(None),
        });
        plan.ranges
            .iter()
            .map(|range| {
                let (plan, slices, r) = (Arc::clone(plan), Arc::clone(&slices), range.clone());
                LazyChunk::new(
                    range.clone(),
                    TaskNode::new(move || {
                        let slices = slices.get()?;
                        plan.build_chunk(slices.as_deref(), r.clone())
                    }),
                )
            })
            .collect()
    }

    /// Build the S-matrix. All configuration errors are raised here, also
    /// in deferred mode.
    #[instrument(skip_all, name = "smatrix_build")]
    pub fn build(&self, mode: ExecutionMode) -> PrismResult<SMatrixArray> {
        let plan = Arc::new(self.plan()?);
        info!(
            waves = plan.wave_vectors.len(),
            chunks = plan.ranges.len(),
            members = plan.num_configurations,
            mode = ?mode,
            "Building S-matrix."
        );
        let array = match mode {
            ExecutionMode::Eager => {
                let members = (0..plan.num_configurations)
                    .map(|i| self.build_member_eager(&plan, i))
                    .collect::<PrismResult<Vec<_>>>()?;
                let views: Vec<_> = members.iter().map(|m| m.view()).collect();
                let array = stack(Axis(0), &views).map_err(|e| PrismError::Invariant(format!("members: {e}")))?;
                SMatrixArray::from_array(array, plan.meta.clone())?
            }
            ExecutionMode::Deferred => {
                let members = (0..plan.num_configurations)
                    .map(|i| self.build_member_deferred(&plan, i))
                    .collect();
                SMatrixArray::from_chunks(members, plan.meta.clone())?
            }
        };
        Ok(array.with_backend(Arc::clone(&self.backend)))
    }

    /// Build and reduce in one pass.
    ///
    /// Eagerly, each ensemble member is built, reduced and folded into the
    /// measurements before the next one is built. Deferred, the build and
    /// reduction graphs are chained and returned unevaluated.
    #[instrument(skip_all, name = "smatrix_scan")]
    pub fn scan(
        &self,
        detectors: &[Arc<dyn Detector>],
        options: &ReduceOptions,
        mode: ExecutionMode,
    ) -> PrismResult<Measurements> {
        if mode == ExecutionMode::Deferred {
            return self.build(mode)?.reduce(detectors, options, mode);
        }
        let plan = self.plan()?;
        let count = plan.num_configurations;
        let member_meta = SMatrixMetadata {
            has_ensemble_axis: false,
            ..plan.meta.clone()
        };
        let mut totals: Vec<Option<Measurement>> = (0..detectors.len()).map(|_| None).collect();
        let mut stacks: Vec<Vec<Measurement>> = (0..detectors.len()).map(|_| Vec::new()).collect();
        for index in 0..count {
            let values = self.build_member_eager(&plan, index)?.insert_axis(Axis(0));
            let member = SMatrixArray::from_array(values, member_meta.clone())?
                .with_backend(Arc::clone(&self.backend));
            let measurements = member.reduce(detectors, options, ExecutionMode::Eager)?.compute()?;
            for (d, measurement) in measurements.into_iter().enumerate() {
                if !detectors.get(d).is_some_and(|det| det.ensemble_mean()) {
                    stacks[d].push(measurement);
                    continue;
                }
                if let Some(total) = totals[d].as_mut() {
                    let full: Vec<Range<usize>> = total.shape().iter().map(|&n| 0..n).collect();
                    total.array.put_region(None, &full, &measurement.array, true)?;
                } else {
                    totals[d] = Some(measurement);
                }
            }
            debug!(member = index, of = count, "Accumulated ensemble member.");
        }

        let measurements = totals
            .into_iter()
            .zip(stacks)
            .map(|(total, mut stacked)| match total {
                Some(mut total) => {
                    total.array.scale(1.0 / count as f32);
                    Ok(total)
                }
                None if count > 1 => Measurement::stack(&stacked),
                None => stacked
                    .pop()
                    .ok_or_else(|| PrismError::Invariant("no ensemble members".to_string())),
            })
            .collect::<PrismResult<Vec<_>>>()?;
        Ok(Measurements::Computed(measurements))
    }
}

/// Everything a chunk task needs, resolved and validated once.
struct BuildPlan {
    context: WaveContext,
    wave_vectors: Arc<WaveVectors>,
    ranges: Vec<Range<usize>>,
    interpolation: (usize, usize),
    normalize: bool,
    storage_gpts: (usize, usize),
    scaling: FourierScaling,
    multislice: Arc<dyn Multislice>,
    transfers: Transfers,
    start: usize,
    stop: usize,
    num_configurations: usize,
    meta: SMatrixMetadata,
}

impl BuildPlan {
    fn build_chunk(&self, slices: Option<&PotentialSlices>, range: Range<usize>) -> PrismResult<Array3<Complex32>> {
        let mut waves = normalized_plane_waves(
            self.wave_vectors.slice(range),
            self.context.extent,
            self.context.gpts,
            self.wave_vectors.len(),
            self.interpolation,
            self.normalize,
        );
        waves = self.transfers.upload(waves)?;
        if let Some(slices) = slices {
            waves = self
                .multislice
                .multislice(waves, slices, &self.context, self.start, self.stop)?;
        }
        if self.storage_gpts != self.context.gpts {
            waves = fft_interpolate_batch(&waves, self.storage_gpts, self.scaling);
        }
        self.transfers.download(waves)
    }
}
