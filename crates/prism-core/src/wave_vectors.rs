// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Wave Vectors
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Plane-wave basis enumeration.
//!
//! The full basis is every reciprocal-lattice point of the (coarsened) cell
//! inside the cutoff disk. The partitioned basis is a centre point plus
//! concentric rings, see `prism_math::interp::RingLayout`.

use prism_math::interp::RingLayout;
use prism_types::constants::{energy_to_wavelength, MRAD};
use prism_types::error::{PrismError, PrismResult};
use serde::{Deserialize, Serialize};

/// Ordered, immutable set of spatial frequencies (Å⁻¹).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveVectors {
    k: Vec<[f32; 2]>,
}

impl WaveVectors {
    pub fn from_vec(k: Vec<[f32; 2]>) -> Self {
        WaveVectors { k }
    }

    pub fn len(&self) -> usize {
        self.k.len()
    }

    pub fn is_empty(&self) -> bool {
        self.k.is_empty()
    }

    pub fn as_slice(&self) -> &[[f32; 2]] {
        &self.k
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32; 2]> {
        self.k.iter()
    }

    pub fn slice(&self, range: std::ops::Range<usize>) -> &[[f32; 2]] {
        &self.k[range]
    }

    /// Largest scattering angle in the set (mrad).
    pub fn max_angle(&self, wavelength: f64) -> f64 {
        self.k
            .iter()
            .map(|k| (k[0] as f64).hypot(k[1] as f64) * wavelength / MRAD)
            .fold(0.0, f64::max)
    }
}

/// Full plane-wave basis within `cutoff` (mrad), x-major order.
///
/// Lattice spacing is `interpolation / extent` per axis, so a coarser
/// interpolation factor thins the basis.
pub fn prism_wave_vectors(
    cutoff: f64,
    extent: (f64, f64),
    energy: f64,
    interpolation: (usize, usize),
) -> WaveVectors {
    let wavelength = energy_to_wavelength(energy);
    let dkx = interpolation.0 as f64 / extent.0;
    let dky = interpolation.1 as f64 / extent.1;
    let n_max = (cutoff * MRAD / (wavelength / extent.0 * interpolation.0 as f64)).ceil() as i64;
    let m_max = (cutoff * MRAD / (wavelength / extent.1 * interpolation.1 as f64)).ceil() as i64;
    let k_max_sq = (cutoff * MRAD / wavelength).powi(2);

    let mut k = Vec::new();
    for n in -n_max..=n_max {
        let kx = n as f64 * dkx;
        for m in -m_max..=m_max {
            let ky = m as f64 * dky;
            if kx * kx + ky * ky < k_max_sq {
                k.push([kx as f32, ky as f32]);
            }
        }
    }
    WaveVectors { k }
}

/// Ring layout of the partitioned basis, radii in Å⁻¹.
pub fn partition_layout(
    cutoff: f64,
    energy: f64,
    num_rings: usize,
    points_per_ring: usize,
) -> PrismResult<RingLayout> {
    if num_rings < 2 {
        return Err(PrismError::Config(format!(
            "partitioned basis needs at least 2 rings, got {num_rings}"
        )));
    }
    if points_per_ring == 0 {
        return Err(PrismError::Config(
            "points_per_ring must be >= 1".to_string(),
        ));
    }
    let wavelength = energy_to_wavelength(energy);
    Ok(RingLayout::new(
        num_rings,
        points_per_ring,
        cutoff * MRAD / wavelength,
    ))
}

/// Partitioned basis: centre plus `num_rings - 1` rings out to `cutoff`.
///
/// The extent does not enter the ring geometry; it is accepted so both
/// generators share one call shape.
pub fn partitioned_prism_wave_vectors(
    cutoff: f64,
    _extent: (f64, f64),
    energy: f64,
    num_rings: usize,
    points_per_ring: usize,
) -> PrismResult<WaveVectors> {
    let layout = partition_layout(cutoff, energy, num_rings, points_per_ring)?;
    Ok(WaveVectors {
        k: layout
            .points()
            .into_iter()
            .map(|(kx, ky)| [kx as f32, ky as f32])
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_types::constants::DEFAULT_POINTS_PER_RING;

    #[test]
    fn test_full_basis_is_x_major_and_symmetric() {
        let k = prism_wave_vectors(20.0, (20.0, 20.0), 100e3, (1, 1));
        assert!(!k.is_empty());
        let first = k.as_slice()[0];
        let last = k.as_slice()[k.len() - 1];
        assert!((first[0] + last[0]).abs() < 1e-6, "kx must run from -max to +max");
        assert!(first[0] < 0.0);
        // Point symmetry: for every k, -k is present.
        for v in k.iter() {
            assert!(k.iter().any(|w| (w[0] + v[0]).abs() < 1e-6 && (w[1] + v[1]).abs() < 1e-6));
        }
    }

    #[test]
    fn test_full_basis_within_cutoff() {
        let energy = 80e3;
        let k = prism_wave_vectors(25.0, (15.0, 12.0), energy, (2, 1));
        let wavelength = energy_to_wavelength(energy);
        assert!(k.max_angle(wavelength) <= 25.0 * (1.0 + 1e-5));
    }

    #[test]
    fn test_interpolation_thins_basis() {
        let fine = prism_wave_vectors(20.0, (40.0, 40.0), 100e3, (1, 1));
        let coarse = prism_wave_vectors(20.0, (40.0, 40.0), 100e3, (2, 2));
        assert!(coarse.len() < fine.len());
        assert!((fine.len() as f64 / coarse.len() as f64 - 4.0).abs() < 0.5);
    }

    #[test]
    fn test_partitioned_counts() {
        let k = partitioned_prism_wave_vectors(20.0, (20.0, 20.0), 100e3, 4, DEFAULT_POINTS_PER_RING)
            .expect("valid rings");
        assert_eq!(k.len(), 1 + 6 + 12 + 18);
        assert_eq!(k.as_slice()[0], [0.0, 0.0]);
        let wavelength = energy_to_wavelength(100e3);
        assert!((k.max_angle(wavelength) - 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_partitioned_needs_two_rings() {
        let result = partitioned_prism_wave_vectors(20.0, (20.0, 20.0), 100e3, 1, 6);
        assert!(matches!(result, Err(PrismError::Config(_))));
    }
}
