// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Potential
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Sliced electrostatic potentials.
//!
//! `Potential` is the seam to a full potential pipeline. `ArrayPotential`
//! holds realized slices in memory; `ArrayPotential::from_gaussian_sites`
//! builds a toy crystal with seeded frozen-phonon displacements.

use ndarray::{Array3, Axis};
use prism_types::error::{PrismError, PrismResult};
use prism_types::state::Grid;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::sync::Arc;

/// Projected potential slices (V·Å) for one frozen-phonon configuration.
#[derive(Debug, Clone)]
pub struct PotentialSlices {
    /// `[slice, x, y]`.
    pub array: Array3<f32>,
    /// Thickness per slice (Å).
    pub thickness: Vec<f64>,
}

impl PotentialSlices {
    pub fn new(array: Array3<f32>, thickness: Vec<f64>) -> PrismResult<Self> {
        if array.len_of(Axis(0)) != thickness.len() {
            return Err(PrismError::Config(format!(
                "{} slices but {} thicknesses",
                array.len_of(Axis(0)),
                thickness.len()
            )));
        }
        if thickness.iter().any(|&dz| !dz.is_finite() || dz <= 0.0) {
            return Err(PrismError::Config(
                "slice thickness must be finite and > 0".to_string(),
            ));
        }
        Ok(PotentialSlices { array, thickness })
    }

    pub fn num_slices(&self) -> usize {
        self.thickness.len()
    }

    pub fn gpts(&self) -> (usize, usize) {
        let (_, nx, ny) = self.array.dim();
        (nx, ny)
    }
}

pub trait Potential: Send + Sync {
    fn grid(&self) -> Grid;
    fn num_slices(&self) -> usize;
    fn slice_thickness(&self, i: usize) -> f64;

    /// Total thickness (Å).
    fn thickness(&self) -> f64 {
        (0..self.num_slices()).map(|i| self.slice_thickness(i)).sum()
    }

    fn num_configurations(&self) -> usize;
    fn configuration(&self, i: usize) -> PrismResult<Arc<PotentialSlices>>;
}

/// A point scatterer: position (Å), slice index, peak projected potential
/// (V·Å) and Gaussian width (Å).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianSite {
    pub x: f64,
    pub y: f64,
    pub slice: usize,
    pub amplitude: f64,
    pub width: f64,
}

/// Seeded thermal displacements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrozenPhonons {
    pub num_configs: usize,
    /// Displacement standard deviation (Å).
    pub sigma: f64,
    pub seed: u64,
}

/// In-memory potential over one or more frozen-phonon configurations.
#[derive(Debug, Clone)]
pub struct ArrayPotential {
    extent: (f64, f64),
    configurations: Vec<Arc<PotentialSlices>>,
}

impl ArrayPotential {
    pub fn new(slices: PotentialSlices, extent: (f64, f64)) -> PrismResult<Self> {
        Self::from_configurations(vec![slices], extent)
    }

    pub fn from_configurations(configurations: Vec<PotentialSlices>, extent: (f64, f64)) -> PrismResult<Self> {
        let first = configurations
            .first()
            .ok_or_else(|| PrismError::Config("potential needs at least one configuration".to_string()))?;
        let (gpts, thickness) = (first.gpts(), first.thickness.clone());
        for (i, c) in configurations.iter().enumerate() {
            if c.gpts() != gpts || c.thickness != thickness {
                return Err(PrismError::Config(format!(
                    "configuration {i} does not match the slicing of configuration 0"
                )));
            }
        }
        Grid::new(extent, gpts).check_is_defined()?;
        Ok(ArrayPotential {
            extent,
            configurations: configurations.into_iter().map(Arc::new).collect(),
        })
    }

    /// Sum of periodic Gaussians per slice, one configuration per phonon draw.
    pub fn from_gaussian_sites(
        sites: &[GaussianSite],
        extent: (f64, f64),
        gpts: (usize, usize),
        slice_thickness: Vec<f64>,
        phonons: Option<FrozenPhonons>,
    ) -> PrismResult<Self> {
        let num_slices = slice_thickness.len();
        if let Some(site) = sites.iter().find(|s| s.slice >= num_slices) {
            return Err(PrismError::Config(format!(
                "site in slice {} but potential has {num_slices} slices",
                site.slice
            )));
        }
        let (num_configs, sigma, seed) = match phonons {
            Some(p) => (p.num_configs.max(1), p.sigma, p.seed),
            None => (1, 0.0, 0),
        };
        let mut rng = StdRng::seed_from_u64(seed);
        let jitter = Normal::new(0.0, sigma.max(0.0))
            .map_err(|e| PrismError::Config(format!("invalid phonon sigma {sigma}: {e}")))?;

        let mut configurations = Vec::with_capacity(num_configs);
        for _ in 0..num_configs {
            let displaced: Vec<GaussianSite> = sites
                .iter()
                .map(|s| GaussianSite {
                    x: s.x + jitter.sample(&mut rng),
                    y: s.y + jitter.sample(&mut rng),
                    ..*s
                })
                .collect();
            let array = gaussian_slices(&displaced, extent, gpts, num_slices);
            configurations.push(PotentialSlices::new(array, slice_thickness.clone())?);
        }
        Self::from_configurations(configurations, extent)
    }
}

fn gaussian_slices(sites: &[GaussianSite], extent: (f64, f64), gpts: (usize, usize), num_slices: usize) -> Array3<f32> {
    let dx = extent.0 / gpts.0 as f64;
    let dy = extent.1 / gpts.1 as f64;
    // Minimum-image distance on the periodic cell.
    let wrap = |d: f64, l: f64| d - l * (d / l).round();
    let mut array = Array3::zeros((num_slices, gpts.0, gpts.1));
    for site in sites {
        let mut slice = array.index_axis_mut(Axis(0), site.slice);
        for ((i, j), v) in slice.indexed_iter_mut() {
            let ddx = wrap(i as f64 * dx - site.x, extent.0);
            let ddy = wrap(j as f64 * dy - site.y, extent.1);
            let r2 = ddx * ddx + ddy * ddy;
            *v += (site.amplitude * (-r2 / (2.0 * site.width * site.width)).exp()) as f32;
        }
    }
    array
}

impl Potential for ArrayPotential {
    fn grid(&self) -> Grid {
        let gpts = self.configurations[0].gpts();
        Grid::new(self.extent, gpts)
    }

    fn num_slices(&self) -> usize {
        self.configurations[0].num_slices()
    }

    fn slice_thickness(&self, i: usize) -> f64 {
        self.configurations[0].thickness[i]
    }

    fn num_configurations(&self) -> usize {
        self.configurations.len()
    }

    fn configuration(&self, i: usize) -> PrismResult<Arc<PotentialSlices>> {
        self.configurations.get(i).cloned().ok_or_else(|| {
            PrismError::Invariant(format!(
                "configuration {i} out of range ({} configurations)",
                self.configurations.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> GaussianSite {
        GaussianSite {
            x: 5.0,
            y: 5.0,
            slice: 0,
            amplitude: 10.0,
            width: 0.5,
        }
    }

    #[test]
    fn test_gaussian_peak_location() {
        let pot = ArrayPotential::from_gaussian_sites(&[site()], (10.0, 10.0), (20, 20), vec![2.0], None)
            .expect("valid potential");
        let slices = pot.configuration(0).expect("config 0");
        let peak = slices
            .array
            .index_axis(Axis(0), 0)
            .indexed_iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(idx, _)| idx);
        assert_eq!(peak, Some((10, 10)));
        assert!((pot.thickness() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_frozen_phonons_seeded() {
        let phonons = FrozenPhonons {
            num_configs: 3,
            sigma: 0.1,
            seed: 7,
        };
        let build = || {
            ArrayPotential::from_gaussian_sites(&[site()], (10.0, 10.0), (16, 16), vec![1.0, 1.0], Some(phonons))
                .expect("valid potential")
        };
        let (a, b) = (build(), build());
        assert_eq!(a.num_configurations(), 3);
        let a0 = a.configuration(0).expect("config");
        let b0 = b.configuration(0).expect("config");
        assert_eq!(a0.array, b0.array);
        let a1 = a.configuration(1).expect("config");
        assert_ne!(a0.array, a1.array);
    }

    #[test]
    fn test_site_out_of_slices_rejected() {
        let mut s = site();
        s.slice = 3;
        let result = ArrayPotential::from_gaussian_sites(&[s], (10.0, 10.0), (8, 8), vec![1.0], None);
        assert!(matches!(result, Err(PrismError::Config(_))));
    }

    #[test]
    fn test_mismatched_configurations_rejected() {
        let a = PotentialSlices::new(Array3::zeros((1, 8, 8)), vec![1.0]).expect("slices");
        let b = PotentialSlices::new(Array3::zeros((1, 4, 8)), vec![1.0]).expect("slices");
        assert!(ArrayPotential::from_configurations(vec![a, b], (5.0, 5.0)).is_err());
    }
}
