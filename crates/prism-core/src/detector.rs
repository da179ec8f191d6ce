// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Detectors
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Detectors turn a batch of exit waves into measurement values.
//!
//! The reduction allocates one measurement per detector from the first batch
//! and writes each batch's `detect` output into that batch's scan region.

use crate::measurement::{Measurement, MeasurementArray, MeasurementDtype, MeasurementKind};
use crate::scan::Scan;
use crate::waves::{scattering_angles, MetaWaves, Waves};
use ndarray::{ArrayD, Axis, IxDyn};
use prism_types::error::{PrismError, PrismResult};
use prism_types::state::AxisMetadata;

pub trait Detector: Send + Sync {
    fn measurement_kind(&self) -> MeasurementKind;

    /// Per-position shape of the detector output.
    fn detector_shape(&self, meta: &MetaWaves) -> Vec<usize>;

    fn detector_axes_metadata(&self, meta: &MetaWaves) -> Vec<AxisMetadata>;

    fn measurement_dtype(&self) -> MeasurementDtype;

    /// Full measurement shape: scan shape followed by the detector shape.
    fn measurement_shape(&self, meta: &MetaWaves, scan: &Scan) -> Vec<usize> {
        let mut shape = scan.shape();
        shape.extend(self.detector_shape(meta));
        shape
    }

    fn allocate_measurement(&self, meta: &MetaWaves, scan: &Scan) -> PrismResult<Measurement> {
        let shape = self.measurement_shape(meta, scan);
        let mut axes = scan.axes_metadata();
        axes.extend(self.detector_axes_metadata(meta));
        Measurement::new(
            MeasurementArray::zeros(self.measurement_dtype(), &shape),
            self.measurement_kind(),
            axes,
        )
    }

    /// Output shaped `waves.batch_shape() + detector_shape`.
    fn detect(&self, waves: &Waves) -> PrismResult<MeasurementArray>;

    /// Average frozen-phonon members instead of stacking them.
    fn ensemble_mean(&self) -> bool {
        true
    }
}

/// Integrated diffraction intensity between two scattering angles.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnularDetector {
    /// Inner angle (mrad), inclusive.
    pub inner: f64,
    /// Outer angle (mrad), exclusive.
    pub outer: f64,
    pub ensemble_mean: bool,
}

impl AnnularDetector {
    pub fn new(inner: f64, outer: f64) -> PrismResult<Self> {
        if !(inner >= 0.0 && outer > inner) {
            return Err(PrismError::Config(format!(
                "annular detector needs 0 <= inner < outer, got {inner}..{outer}"
            )));
        }
        Ok(AnnularDetector {
            inner,
            outer,
            ensemble_mean: true,
        })
    }
}

impl Detector for AnnularDetector {
    fn measurement_kind(&self) -> MeasurementKind {
        MeasurementKind::Images
    }

    fn detector_shape(&self, _meta: &MetaWaves) -> Vec<usize> {
        Vec::new()
    }

    fn detector_axes_metadata(&self, _meta: &MetaWaves) -> Vec<AxisMetadata> {
        Vec::new()
    }

    fn measurement_dtype(&self) -> MeasurementDtype {
        MeasurementDtype::Float32
    }

    fn detect(&self, waves: &Waves) -> PrismResult<MeasurementArray> {
        let patterns = waves.diffraction_patterns()?;
        let angles = waves.scattering_angles();
        let mask = angles.mapv(|a| if a >= self.inner && a < self.outer { 1.0f32 } else { 0.0 });
        let (nx, ny) = waves.gpts();
        let flat = patterns
            .view()
            .into_shape_with_order((waves.num_waves(), nx, ny))
            .map_err(|e| PrismError::Invariant(format!("pattern layout: {e}")))?;
        let sums: Vec<f32> = flat
            .axis_iter(Axis(0))
            .map(|p| (&p * &mask).sum())
            .collect();
        let array = ArrayD::from_shape_vec(IxDyn(waves.batch_shape()), sums)
            .map_err(|e| PrismError::Invariant(format!("annular output: {e}")))?;
        Ok(MeasurementArray::Real(array))
    }

    fn ensemble_mean(&self) -> bool {
        self.ensemble_mean
    }
}

/// Full diffraction patterns, zero frequency at the centre.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelatedDetector {
    pub ensemble_mean: bool,
}

impl Default for PixelatedDetector {
    fn default() -> Self {
        PixelatedDetector { ensemble_mean: true }
    }
}

impl Detector for PixelatedDetector {
    fn measurement_kind(&self) -> MeasurementKind {
        MeasurementKind::DiffractionPatterns
    }

    fn detector_shape(&self, meta: &MetaWaves) -> Vec<usize> {
        vec![meta.gpts.0, meta.gpts.1]
    }

    fn detector_axes_metadata(&self, meta: &MetaWaves) -> Vec<AxisMetadata> {
        let angular = meta.angular_sampling();
        let offset = |n: usize, d: f64| -((n / 2) as f64) * d;
        vec![
            AxisMetadata::reciprocal_space("alpha_x", angular.0, offset(meta.gpts.0, angular.0)),
            AxisMetadata::reciprocal_space("alpha_y", angular.1, offset(meta.gpts.1, angular.1)),
        ]
    }

    fn measurement_dtype(&self) -> MeasurementDtype {
        MeasurementDtype::Float32
    }

    fn detect(&self, waves: &Waves) -> PrismResult<MeasurementArray> {
        Ok(MeasurementArray::Real(waves.diffraction_patterns()?))
    }

    fn ensemble_mean(&self) -> bool {
        self.ensemble_mean
    }
}

/// The exit waves themselves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WavesDetector;

impl Detector for WavesDetector {
    fn measurement_kind(&self) -> MeasurementKind {
        MeasurementKind::Waves
    }

    fn detector_shape(&self, meta: &MetaWaves) -> Vec<usize> {
        vec![meta.gpts.0, meta.gpts.1]
    }

    fn detector_axes_metadata(&self, meta: &MetaWaves) -> Vec<AxisMetadata> {
        vec![
            AxisMetadata::real_space("x", meta.sampling.0),
            AxisMetadata::real_space("y", meta.sampling.1),
        ]
    }

    fn measurement_dtype(&self) -> MeasurementDtype {
        MeasurementDtype::Complex64
    }

    fn detect(&self, waves: &Waves) -> PrismResult<MeasurementArray> {
        Ok(MeasurementArray::Complex(waves.array.clone()))
    }

    fn ensemble_mean(&self) -> bool {
        false
    }
}

/// Pixels an annular detector integrates, zero frequency at the centre.
pub fn annular_mask(meta: &MetaWaves, inner: f64, outer: f64) -> ndarray::Array2<bool> {
    scattering_angles(meta.gpts, meta.sampling, meta.wavelength()).mapv(|a| a >= inner && a < outer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::GridScan;
    use num_complex::Complex32;
    use prism_types::state::Device;

    fn meta() -> MetaWaves {
        MetaWaves {
            gpts: (8, 8),
            sampling: (0.25, 0.25),
            energy: 100e3,
            antialias_cutoff_gpts: None,
            extra_axes_metadata: Vec::new(),
            device: Device::Cpu,
        }
    }

    fn flat_waves() -> Waves {
        let array = ArrayD::from_elem(IxDyn(&[2, 3, 8, 8]), Complex32::new(0.125, 0.0));
        Waves::new(
            array,
            (0.25, 0.25),
            100e3,
            vec![AxisMetadata::scan("x", 1.0, 0.0, false), AxisMetadata::scan("y", 1.0, 0.0, false)],
        )
        .expect("waves")
    }

    #[test]
    fn test_annular_bright_field_collects_unscattered_beam() {
        let detector = AnnularDetector::new(0.0, 1.0).expect("detector");
        let out = detector.detect(&flat_waves()).expect("detect");
        let image = out.as_real().expect("real");
        assert_eq!(image.shape(), &[2, 3]);
        for v in image.iter() {
            assert!((v - 1.0).abs() < 1e-5, "bright field = {v}");
        }
    }

    #[test]
    fn test_annular_dark_field_is_empty_for_plane_wave() {
        let detector = AnnularDetector::new(1.0, 1e4).expect("detector");
        let out = detector.detect(&flat_waves()).expect("detect");
        assert!(out.as_real().expect("real").iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_annular_rejects_inverted_angles() {
        assert!(AnnularDetector::new(50.0, 20.0).is_err());
    }

    #[test]
    fn test_allocation_shapes() {
        let scan: Scan = GridScan::new((0.0, 0.0), (1.0, 1.0), (4, 5), false)
            .expect("scan")
            .into();
        let m = PixelatedDetector::default()
            .allocate_measurement(&meta(), &scan)
            .expect("allocate");
        assert_eq!(m.shape(), &[4, 5, 8, 8]);
        assert_eq!(m.axes_metadata.len(), 4);
        let w = WavesDetector.allocate_measurement(&meta(), &scan).expect("allocate");
        assert_eq!(w.array.dtype(), MeasurementDtype::Complex64);
        let a = AnnularDetector::new(0.0, 10.0)
            .expect("detector")
            .allocate_measurement(&meta(), &scan)
            .expect("allocate");
        assert_eq!(a.shape(), &[4, 5]);
    }

    #[test]
    fn test_mask_matches_detector() {
        let mask = annular_mask(&meta(), 0.0, 1.0);
        assert_eq!(mask.iter().filter(|&&m| m).count(), 1);
        assert!(mask[[4, 4]]);
    }
}
