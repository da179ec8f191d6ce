// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Contrast Transfer Function
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Probe-forming aperture and aberrations.
//!
//! χ(α, φ) = 2π/λ · (½ α² (C10 + C12 cos 2(φ − φ12)) + ¼ α⁴ Cs), C10 = −defocus.
//! The aperture is a hard disk: α strictly below the semiangle cutoff.

use ndarray::Array2;
use num_complex::{Complex32, Complex64};
use prism_math::fft::{fftfreq, ifft2};
use prism_types::config::CtfConfig;
use prism_types::constants::{energy_to_wavelength, MRAD};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ctf {
    /// Aperture (mrad).
    pub semiangle_cutoff: f64,
    /// Defocus (Å), positive is underfocus.
    pub defocus: f64,
    /// Spherical aberration (Å).
    pub cs: f64,
    /// Twofold astigmatism (Å).
    #[serde(default)]
    pub astigmatism: f64,
    /// Twofold astigmatism angle (rad).
    #[serde(default)]
    pub astigmatism_angle: f64,
    /// Beam energy (eV).
    pub energy: f64,
}

impl Ctf {
    pub fn new(semiangle_cutoff: f64, energy: f64) -> Self {
        Ctf {
            semiangle_cutoff,
            defocus: 0.0,
            cs: 0.0,
            astigmatism: 0.0,
            astigmatism_angle: 0.0,
            energy,
        }
    }

    /// From configuration; an unset aperture falls back to `default_cutoff`.
    pub fn from_config(config: &CtfConfig, energy: f64, default_cutoff: f64) -> Self {
        Ctf {
            semiangle_cutoff: config.semiangle_cutoff.unwrap_or(default_cutoff),
            defocus: config.defocus,
            cs: config.cs,
            astigmatism: 0.0,
            astigmatism_angle: 0.0,
            energy,
        }
    }

    pub fn with_defocus(mut self, defocus: f64) -> Self {
        self.defocus = defocus;
        self
    }

    pub fn with_cs(mut self, cs: f64) -> Self {
        self.cs = cs;
        self
    }

    pub fn wavelength(&self) -> f64 {
        energy_to_wavelength(self.energy)
    }

    pub fn aperture(&self, alpha: f64) -> f64 {
        if alpha < self.semiangle_cutoff * MRAD {
            1.0
        } else {
            0.0
        }
    }

    /// Aberration phase χ (rad).
    pub fn chi(&self, alpha: f64, phi: f64) -> f64 {
        let alpha2 = alpha * alpha;
        let c10 = -self.defocus;
        let c12 = self.astigmatism * (2.0 * (phi - self.astigmatism_angle)).cos();
        2.0 * PI / self.wavelength() * (0.5 * alpha2 * (c10 + c12) + 0.25 * alpha2 * alpha2 * self.cs)
    }

    /// Complex transfer value at scattering angle `alpha` (rad), azimuth `phi`.
    pub fn evaluate(&self, alpha: f64, phi: f64) -> Complex64 {
        let a = self.aperture(alpha);
        if a == 0.0 {
            return Complex64::new(0.0, 0.0);
        }
        Complex64::from_polar(a, -self.chi(alpha, phi))
    }

    pub fn evaluate_many(&self, alpha: &[f64], phi: &[f64]) -> Vec<Complex64> {
        alpha
            .iter()
            .zip(phi)
            .map(|(&a, &p)| self.evaluate(a, p))
            .collect()
    }

    /// Transfer function on the FFT frequency grid of `gpts` at `sampling`.
    pub fn evaluate_on_grid(&self, gpts: (usize, usize), sampling: (f64, f64)) -> Array2<Complex64> {
        let wavelength = self.wavelength();
        let kx = fftfreq(gpts.0, sampling.0);
        let ky = fftfreq(gpts.1, sampling.1);
        Array2::from_shape_fn(gpts, |(i, j)| {
            let alpha = kx[i].hypot(ky[j]) * wavelength;
            self.evaluate(alpha, ky[j].atan2(kx[i]))
        })
    }

    /// Real-space probe at the origin with unit Fourier-space norm.
    pub fn probe(&self, gpts: (usize, usize), sampling: (f64, f64)) -> Array2<Complex32> {
        let spectrum = self.evaluate_on_grid(gpts, sampling);
        let norm = spectrum.iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt();
        let scale = if norm > 0.0 { 1.0 / norm } else { 0.0 };
        let spectrum32 = spectrum.mapv(|v| Complex32::new((v.re * scale) as f32, (v.im * scale) as f32));
        ifft2(&spectrum32)
    }

    /// Real-space sampling that resolves the aperture (Å).
    pub fn nyquist_sampling(&self) -> f64 {
        1.0 / (4.0 * self.semiangle_cutoff * MRAD / self.wavelength())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aperture_is_strict() {
        let ctf = Ctf::new(20.0, 100e3);
        assert_eq!(ctf.aperture(19.999e-3), 1.0);
        assert_eq!(ctf.aperture(20.0e-3), 0.0);
    }

    #[test]
    fn test_no_aberrations_is_real() {
        let ctf = Ctf::new(30.0, 200e3);
        let v = ctf.evaluate(10e-3, 0.3);
        assert!((v - Complex64::new(1.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_defocus_phase() {
        let ctf = Ctf::new(30.0, 100e3).with_defocus(50.0);
        let alpha = 10e-3;
        let expected = PI / ctf.wavelength() * alpha * alpha * 50.0;
        let v = ctf.evaluate(alpha, 0.0);
        assert!((v.arg() - expected).abs() < 1e-9, "{} vs {expected}", v.arg());
    }

    #[test]
    fn test_nyquist_sampling() {
        let ctf = Ctf::new(20.0, 100e3);
        let expected = ctf.wavelength() / (4.0 * 20e-3);
        assert!((ctf.nyquist_sampling() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_probe_peak_at_origin() {
        let ctf = Ctf::new(20.0, 100e3);
        let probe = ctf.probe((64, 64), (0.1, 0.1));
        let peak = probe
            .indexed_iter()
            .max_by(|a, b| a.1.norm().total_cmp(&b.1.norm()))
            .map(|(idx, _)| idx);
        assert_eq!(peak, Some((0, 0)));
        let total: f32 = probe.iter().map(|v| v.norm_sqr()).sum();
        assert!((total - 1.0 / 4096.0).abs() < 1e-6);
    }
}
