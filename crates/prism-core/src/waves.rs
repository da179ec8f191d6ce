// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Waves
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Batches of exit waves and their array-free description.

use ndarray::{ArrayD, ArrayView3, Axis, IxDyn};
use num_complex::Complex32;
use prism_math::fft::{fftfreq, fftshift2, Fft2Plan};
use prism_types::constants::{energy_to_wavelength, MRAD};
use prism_types::error::{PrismError, PrismResult};
use prism_types::state::{AxisMetadata, Device};
use rayon::prelude::*;

/// Exit waves shaped `batch_shape + [nx, ny]`.
#[derive(Debug, Clone)]
pub struct Waves {
    pub array: ArrayD<Complex32>,
    pub sampling: (f64, f64),
    pub energy: f64,
    /// One entry per batch axis.
    pub extra_axes_metadata: Vec<AxisMetadata>,
    pub antialias_cutoff_gpts: Option<(usize, usize)>,
}

impl Waves {
    pub fn new(
        array: ArrayD<Complex32>,
        sampling: (f64, f64),
        energy: f64,
        extra_axes_metadata: Vec<AxisMetadata>,
    ) -> PrismResult<Self> {
        if array.ndim() != extra_axes_metadata.len() + 2 {
            return Err(PrismError::Config(format!(
                "waves with {} dimensions need {} axis labels, got {}",
                array.ndim(),
                array.ndim().saturating_sub(2),
                extra_axes_metadata.len()
            )));
        }
        Ok(Waves {
            array,
            sampling,
            energy,
            extra_axes_metadata,
            antialias_cutoff_gpts: None,
        })
    }

    pub fn gpts(&self) -> (usize, usize) {
        let shape = self.array.shape();
        (shape[shape.len() - 2], shape[shape.len() - 1])
    }

    pub fn batch_shape(&self) -> &[usize] {
        let shape = self.array.shape();
        &shape[..shape.len() - 2]
    }

    pub fn num_waves(&self) -> usize {
        self.batch_shape().iter().product()
    }

    pub fn extent(&self) -> (f64, f64) {
        let gpts = self.gpts();
        (gpts.0 as f64 * self.sampling.0, gpts.1 as f64 * self.sampling.1)
    }

    pub fn wavelength(&self) -> f64 {
        energy_to_wavelength(self.energy)
    }

    /// Flattened `[num_waves, nx, ny]` view.
    pub fn flat_view(&self) -> PrismResult<ArrayView3<'_, Complex32>> {
        let (nx, ny) = self.gpts();
        self.array
            .view()
            .into_shape_with_order((self.num_waves(), nx, ny))
            .map_err(|e| PrismError::Invariant(format!("waves are not contiguous: {e}")))
    }

    /// `|ψ|²` per pixel.
    pub fn intensity(&self) -> ArrayD<f32> {
        self.array.mapv(|v| v.norm_sqr())
    }

    /// Diffraction intensities `|FFT ψ|² / N`, zero frequency at the centre.
    ///
    /// The 1/N factor makes the total equal the real-space intensity.
    pub fn diffraction_patterns(&self) -> PrismResult<ArrayD<f32>> {
        let (nx, ny) = self.gpts();
        let flat = self.flat_view()?;
        let plan = Fft2Plan::new((nx, ny));
        let norm = 1.0 / (nx * ny) as f32;
        let patterns: Vec<ndarray::Array2<f32>> = flat
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|wave| {
                let mut spectrum = wave.to_owned();
                plan.forward(spectrum.view_mut());
                fftshift2(&spectrum.mapv(|v| v.norm_sqr() * norm))
            })
            .collect();
        let mut out = ArrayD::zeros(IxDyn(self.array.shape()));
        {
            let mut out_flat = out
                .view_mut()
                .into_shape_with_order((patterns.len(), nx, ny))
                .map_err(|e| PrismError::Invariant(format!("pattern layout: {e}")))?;
            for (mut dst, src) in out_flat.axis_iter_mut(Axis(0)).zip(&patterns) {
                dst.assign(src);
            }
        }
        Ok(out)
    }

    /// Scattering angle (mrad) of each pixel of the unshifted spectrum.
    pub fn scattering_angles(&self) -> ndarray::Array2<f64> {
        scattering_angles(self.gpts(), self.sampling, self.wavelength())
    }
}

/// `|k| λ` in mrad on the FFT grid, zero frequency at the centre.
pub fn scattering_angles(gpts: (usize, usize), sampling: (f64, f64), wavelength: f64) -> ndarray::Array2<f64> {
    let kx = fftfreq(gpts.0, sampling.0);
    let ky = fftfreq(gpts.1, sampling.1);
    let angles = ndarray::Array2::from_shape_fn(gpts, |(i, j)| kx[i].hypot(ky[j]) * wavelength / MRAD);
    fftshift2(&angles)
}

/// Shape and calibration of the waves a reduction will produce.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaWaves {
    pub gpts: (usize, usize),
    pub sampling: (f64, f64),
    pub energy: f64,
    pub antialias_cutoff_gpts: Option<(usize, usize)>,
    pub extra_axes_metadata: Vec<AxisMetadata>,
    pub device: Device,
}

impl MetaWaves {
    pub fn extent(&self) -> (f64, f64) {
        (
            self.gpts.0 as f64 * self.sampling.0,
            self.gpts.1 as f64 * self.sampling.1,
        )
    }

    pub fn wavelength(&self) -> f64 {
        energy_to_wavelength(self.energy)
    }

    /// Reciprocal sampling as scattering angle (mrad).
    pub fn angular_sampling(&self) -> (f64, f64) {
        let extent = self.extent();
        let wavelength = self.wavelength();
        (wavelength / extent.0 / MRAD, wavelength / extent.1 / MRAD)
    }
}
