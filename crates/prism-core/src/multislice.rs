// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Multislice
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Multislice propagation of wave stacks.
//!
//! Each slice applies the transmission function `exp(iσV)` and then the
//! Fresnel propagator `exp(−iπλΔz k²)`, band-limited by the antialias
//! aperture. Running with `stop < start` undoes the forward run: slices are
//! visited in reverse with the conjugate operators applied in reverse order.

use crate::potential::PotentialSlices;
use ndarray::{Array2, Array3, ArrayViewMut2, Axis};
use num_complex::Complex32;
use prism_math::fft::{fftfreq, Fft2Plan};
use prism_types::constants::{energy_to_sigma, energy_to_wavelength, ANTIALIAS_APERTURE};
use prism_types::error::{PrismError, PrismResult};
use rayon::prelude::*;
use std::f64::consts::PI;

/// Grid and beam parameters of the waves being propagated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveContext {
    pub extent: (f64, f64),
    pub gpts: (usize, usize),
    pub energy: f64,
}

impl WaveContext {
    pub fn sampling(&self) -> (f64, f64) {
        (
            self.extent.0 / self.gpts.0 as f64,
            self.extent.1 / self.gpts.1 as f64,
        )
    }

    pub fn wavelength(&self) -> f64 {
        energy_to_wavelength(self.energy)
    }
}

pub trait Multislice: Send + Sync {
    /// Propagate `waves` (`[wave, x, y]`) through slices `start..stop`,
    /// or backwards through `stop..start` when `stop < start`.
    fn multislice(
        &self,
        waves: Array3<Complex32>,
        slices: &PotentialSlices,
        ctx: &WaveContext,
        start: usize,
        stop: usize,
    ) -> PrismResult<Array3<Complex32>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FresnelMultislice;

fn propagator(ctx: &WaveContext, dz: f64) -> Array2<Complex32> {
    let (dx, dy) = ctx.sampling();
    let kx = fftfreq(ctx.gpts.0, dx);
    let ky = fftfreq(ctx.gpts.1, dy);
    let wavelength = ctx.wavelength();
    let k_cut = ANTIALIAS_APERTURE * (1.0 / (2.0 * dx)).min(1.0 / (2.0 * dy));
    Array2::from_shape_fn(ctx.gpts, |(i, j)| {
        let k2 = kx[i] * kx[i] + ky[j] * ky[j];
        if k2.sqrt() > k_cut {
            return Complex32::new(0.0, 0.0);
        }
        let phase = -PI * wavelength * dz * k2;
        Complex32::new(phase.cos() as f32, phase.sin() as f32)
    })
}

fn transmission(slice: ndarray::ArrayView2<f32>, sigma: f64) -> Array2<Complex32> {
    slice.mapv(|v| {
        let phase = sigma * v as f64;
        Complex32::new(phase.cos() as f32, phase.sin() as f32)
    })
}

impl Multislice for FresnelMultislice {
    fn multislice(
        &self,
        mut waves: Array3<Complex32>,
        slices: &PotentialSlices,
        ctx: &WaveContext,
        start: usize,
        stop: usize,
    ) -> PrismResult<Array3<Complex32>> {
        let n = slices.num_slices();
        if start > n || stop > n {
            return Err(PrismError::Config(format!(
                "slice range {start}..{stop} outside potential with {n} slices"
            )));
        }
        if slices.gpts() != ctx.gpts || waves.dim().1 != ctx.gpts.0 || waves.dim().2 != ctx.gpts.1 {
            return Err(PrismError::Config(format!(
                "wave grid {:?} does not match potential grid {:?}",
                (waves.dim().1, waves.dim().2),
                slices.gpts()
            )));
        }
        let reverse = stop < start;
        let order: Vec<usize> = if reverse {
            (stop..start).rev().collect()
        } else {
            (start..stop).collect()
        };

        let sigma = energy_to_sigma(ctx.energy);
        let plan = Fft2Plan::new(ctx.gpts);
        // Operators are shared by every wave in the stack.
        let operators: Vec<(Array2<Complex32>, Array2<Complex32>)> = order
            .iter()
            .map(|&i| {
                let mut t = transmission(slices.array.index_axis(Axis(0), i), sigma);
                let mut p = propagator(ctx, slices.thickness[i]);
                if reverse {
                    t.mapv_inplace(|v| v.conj());
                    p.mapv_inplace(|v| v.conj());
                }
                (t, p)
            })
            .collect();

        waves
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|mut wave| {
                for (t, p) in &operators {
                    if reverse {
                        propagate(wave.view_mut(), p, &plan);
                        wave *= t;
                    } else {
                        wave *= t;
                        propagate(wave.view_mut(), p, &plan);
                    }
                }
            });

        if waves.iter().any(|v| !(v.re.is_finite() && v.im.is_finite())) {
            return Err(PrismError::Numerical(
                "multislice produced non-finite values".to_string(),
            ));
        }
        Ok(waves)
    }
}

fn propagate(mut wave: ArrayViewMut2<Complex32>, propagator: &Array2<Complex32>, plan: &Fft2Plan) {
    plan.forward(wave.view_mut());
    wave *= propagator;
    plan.inverse(wave);
}
