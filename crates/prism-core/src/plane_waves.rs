// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Plane Waves
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Plane-wave synthesis on a periodic real-space grid.

use ndarray::{Array3, Axis};
use num_complex::{Complex32, Complex64};
use rayon::prelude::*;
use std::f64::consts::PI;

/// Per-wave divisor applied after synthesis.
///
/// `total_waves` is the size of the whole basis, not of the chunk being
/// synthesized, so chunked builds share one normalization.
pub fn normalization_constant(
    gpts: (usize, usize),
    total_waves: usize,
    interpolation: (usize, usize),
    normalize: bool,
) -> f64 {
    let n = (gpts.0 * gpts.1) as f64;
    if normalize {
        n * (total_waves as f64).sqrt() / (interpolation.0 * interpolation.1) as f64
    } else {
        n.sqrt()
    }
}

/// Unnormalized `exp(2πi (kx x + ky y))` for each wave vector, with
/// `x = i * extent / gpts` (endpoint excluded).
pub fn plane_waves(wave_vectors: &[[f32; 2]], extent: (f64, f64), gpts: (usize, usize)) -> Array3<Complex32> {
    let dx = extent.0 / gpts.0 as f64;
    let dy = extent.1 / gpts.1 as f64;
    let mut out = Array3::zeros((wave_vectors.len(), gpts.0, gpts.1));
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(wave_vectors.par_iter())
        .for_each(|(mut wave, k)| {
            let ex: Vec<Complex64> = (0..gpts.0)
                .map(|i| Complex64::from_polar(1.0, 2.0 * PI * k[0] as f64 * i as f64 * dx))
                .collect();
            let ey: Vec<Complex64> = (0..gpts.1)
                .map(|j| Complex64::from_polar(1.0, 2.0 * PI * k[1] as f64 * j as f64 * dy))
                .collect();
            for ((i, j), v) in wave.indexed_iter_mut() {
                let z = ex[i] * ey[j];
                *v = Complex32::new(z.re as f32, z.im as f32);
            }
        });
    out
}

/// Plane waves divided by `normalization_constant`.
pub fn normalized_plane_waves(
    wave_vectors: &[[f32; 2]],
    extent: (f64, f64),
    gpts: (usize, usize),
    total_waves: usize,
    interpolation: (usize, usize),
    normalize: bool,
) -> Array3<Complex32> {
    let mut waves = plane_waves(wave_vectors, extent, gpts);
    let scale = (1.0 / normalization_constant(gpts, total_waves, interpolation, normalize)) as f32;
    waves.mapv_inplace(|v| v * scale);
    waves
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_vector_is_constant() {
        let waves = plane_waves(&[[0.0, 0.0]], (10.0, 10.0), (8, 8));
        for v in waves.iter() {
            assert!((v - Complex32::new(1.0, 0.0)).norm() < 1e-6);
        }
    }

    #[test]
    fn test_lattice_vector_is_periodic() {
        let extent = (10.0, 5.0);
        let k = [(3.0 / extent.0) as f32, (-2.0 / extent.1) as f32];
        let waves = plane_waves(&[k], extent, (30, 20));
        // One full period of the x-component spans 10 pixels.
        for j in 0..20 {
            assert!((waves[[0, 0, j]] - waves[[0, 10, j]]).norm() < 1e-4);
        }
    }

    #[test]
    fn test_normalized_probe_intensity() {
        // Unit Fourier-space norm: sum |ψ|^2 = 1/G over the whole basis.
        let ks = [[0.0f32, 0.0], [0.1, 0.0], [0.0, 0.1]];
        let gpts = (16, 16);
        let waves = normalized_plane_waves(&ks, (10.0, 10.0), gpts, ks.len(), (1, 1), true);
        let total: f32 = waves.iter().map(|v| v.norm_sqr()).sum();
        let g = (gpts.0 * gpts.1) as f32;
        assert!((total - 1.0 / g).abs() < 1e-7, "total {total}");
    }

    #[test]
    fn test_unnormalized_per_wave_unit_norm() {
        let waves = normalized_plane_waves(&[[0.2, 0.1]], (10.0, 10.0), (16, 16), 1, (1, 1), false);
        let total: f32 = waves.iter().map(|v| v.norm_sqr()).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }
}
