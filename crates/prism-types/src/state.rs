// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — State
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use crate::constants::{energy_to_wavelength, ANTIALIAS_APERTURE, MRAD};
use crate::error::{PrismError, PrismResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tolerance used when comparing grids inherited from different sources.
const GRID_MATCH_TOL: f64 = 1e-9;

/// Real-space simulation grid: extent (Å) and number of grid points.
///
/// Either side may be undefined until the grid is matched against a
/// potential. Sampling is always derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Grid {
    pub extent: Option<(f64, f64)>,
    pub gpts: Option<(usize, usize)>,
}

impl Grid {
    pub fn new(extent: (f64, f64), gpts: (usize, usize)) -> Self {
        Grid {
            extent: Some(extent),
            gpts: Some(gpts),
        }
    }

    /// Grid with the number of points rounded up so the sampling is at most `sampling`.
    pub fn from_extent_sampling(extent: (f64, f64), sampling: (f64, f64)) -> Self {
        let gpts = (
            (extent.0 / sampling.0).ceil() as usize,
            (extent.1 / sampling.1).ceil() as usize,
        );
        Grid::new(extent, gpts)
    }

    pub fn from_gpts_sampling(gpts: (usize, usize), sampling: (f64, f64)) -> Self {
        Grid::new((gpts.0 as f64 * sampling.0, gpts.1 as f64 * sampling.1), gpts)
    }

    pub fn is_defined(&self) -> bool {
        self.extent.is_some() && self.gpts.is_some()
    }

    pub fn sampling(&self) -> Option<(f64, f64)> {
        match (self.extent, self.gpts) {
            (Some(e), Some(g)) => Some((e.0 / g.0 as f64, e.1 / g.1 as f64)),
            _ => None,
        }
    }

    /// Validated (extent, gpts, sampling), or a configuration error.
    pub fn check_is_defined(&self) -> PrismResult<((f64, f64), (usize, usize), (f64, f64))> {
        let extent = self
            .extent
            .ok_or_else(|| PrismError::Config("grid extent is not defined".to_string()))?;
        let gpts = self
            .gpts
            .ok_or_else(|| PrismError::Config("grid gpts are not defined".to_string()))?;
        if !(extent.0.is_finite() && extent.1.is_finite()) || extent.0 <= 0.0 || extent.1 <= 0.0 {
            return Err(PrismError::Config(format!(
                "grid extent must be finite and > 0, got {extent:?}"
            )));
        }
        if gpts.0 == 0 || gpts.1 == 0 {
            return Err(PrismError::Config(format!(
                "grid gpts must be >= 1, got {gpts:?}"
            )));
        }
        Ok((extent, gpts, (extent.0 / gpts.0 as f64, extent.1 / gpts.1 as f64)))
    }

    /// Adopt undefined fields from `other`; disagreeing defined fields are an error.
    pub fn matched(&self, other: &Grid) -> PrismResult<Grid> {
        let extent = match (self.extent, other.extent) {
            (Some(a), Some(b)) => {
                if (a.0 - b.0).abs() > GRID_MATCH_TOL || (a.1 - b.1).abs() > GRID_MATCH_TOL {
                    return Err(PrismError::Config(format!(
                        "grid extent mismatch: {a:?} vs {b:?}"
                    )));
                }
                Some(a)
            }
            (a, b) => a.or(b),
        };
        let gpts = match (self.gpts, other.gpts) {
            (Some(a), Some(b)) => {
                if a != b {
                    return Err(PrismError::Config(format!(
                        "grid gpts mismatch: {a:?} vs {b:?}"
                    )));
                }
                Some(a)
            }
            (a, b) => a.or(b),
        };
        Ok(Grid { extent, gpts })
    }

    pub fn num_points(&self) -> usize {
        self.gpts.map_or(0, |g| g.0 * g.1)
    }
}

/// Small-angle beam tilt (mrad).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BeamTilt {
    pub x: f64,
    pub y: f64,
}

/// Grid, energy and tilt shared by the S-matrix builder and its arrays.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OpticalConfiguration {
    pub grid: Grid,
    pub energy: Option<f64>,
    #[serde(default)]
    pub tilt: BeamTilt,
}

impl OpticalConfiguration {
    pub fn new(grid: Grid, energy: f64) -> Self {
        OpticalConfiguration {
            grid,
            energy: Some(energy),
            tilt: BeamTilt::default(),
        }
    }

    pub fn check_energy(&self) -> PrismResult<f64> {
        match self.energy {
            Some(e) if e.is_finite() && e > 0.0 => Ok(e),
            Some(e) => Err(PrismError::Config(format!(
                "energy must be finite and > 0, got {e}"
            ))),
            None => Err(PrismError::Config("energy is not defined".to_string())),
        }
    }

    /// Relativistic wavelength (Å).
    pub fn wavelength(&self) -> PrismResult<f64> {
        Ok(energy_to_wavelength(self.check_energy()?))
    }

    /// Reciprocal-space sampling expressed as scattering angle (mrad).
    pub fn angular_sampling(&self) -> PrismResult<(f64, f64)> {
        let (extent, _, _) = self.grid.check_is_defined()?;
        let wavelength = self.wavelength()?;
        Ok((wavelength / extent.0 / MRAD, wavelength / extent.1 / MRAD))
    }

    /// Largest scattering angle (mrad) passed by the antialias aperture.
    pub fn cutoff_angles(&self) -> PrismResult<(f64, f64)> {
        let (_, _, sampling) = self.grid.check_is_defined()?;
        let wavelength = self.wavelength()?;
        Ok((
            wavelength / (2.0 * sampling.0) * ANTIALIAS_APERTURE / MRAD,
            wavelength / (2.0 * sampling.1) * ANTIALIAS_APERTURE / MRAD,
        ))
    }

    /// Number of grid points needed to keep frequencies up to `angle` (mrad).
    pub fn gpts_within_angle(&self, angle: f64) -> PrismResult<(usize, usize)> {
        let (_, gpts, _) = self.grid.check_is_defined()?;
        if !angle.is_finite() || angle <= 0.0 {
            return Err(PrismError::Config(format!(
                "downsampling angle must be finite and > 0, got {angle}"
            )));
        }
        let angular = self.angular_sampling()?;
        let nx = 2 * (angle / angular.0).ceil() as usize + 1;
        let ny = 2 * (angle / angular.1).ceil() as usize + 1;
        Ok((nx.min(gpts.0), ny.min(gpts.1)))
    }
}

/// Residency of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
}

impl FromStr for Device {
    type Err = PrismError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "gpu" => Ok(Device::Gpu),
            other => Err(PrismError::Config(format!("unknown device '{other}'"))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu => write!(f, "gpu"),
        }
    }
}

/// Normalization convention of a stored plane-wave basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// Amplitude-preserving: the basis expands a unit-norm probe.
    #[default]
    Probe,
    /// Value-preserving: every plane wave keeps its pointwise values.
    PlaneWaves,
}

impl FromStr for Normalization {
    type Err = PrismError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "probe" => Ok(Normalization::Probe),
            "planewaves" => Ok(Normalization::PlaneWaves),
            other => Err(PrismError::Config(format!(
                "normalization must be 'probe' or 'planewaves', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisKind {
    Scan,
    Positions,
    FrozenPhonons,
    PlaneWaves,
    RealSpace,
    ReciprocalSpace,
    Ordinal,
}

/// Labeling for one axis of a wave or measurement array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisMetadata {
    pub label: String,
    pub kind: AxisKind,
    pub sampling: Option<f64>,
    pub offset: f64,
    pub units: String,
    pub endpoint: bool,
}

impl AxisMetadata {
    pub fn scan(label: &str, sampling: f64, offset: f64, endpoint: bool) -> Self {
        AxisMetadata {
            label: label.to_string(),
            kind: AxisKind::Scan,
            sampling: Some(sampling),
            offset,
            units: "Å".to_string(),
            endpoint,
        }
    }

    pub fn positions() -> Self {
        AxisMetadata::unitless("positions", AxisKind::Positions)
    }

    pub fn frozen_phonons() -> Self {
        AxisMetadata::unitless("frozen_phonons", AxisKind::FrozenPhonons)
    }

    pub fn plane_waves() -> Self {
        AxisMetadata::unitless("plane_waves", AxisKind::PlaneWaves)
    }

    pub fn real_space(label: &str, sampling: f64) -> Self {
        AxisMetadata {
            label: label.to_string(),
            kind: AxisKind::RealSpace,
            sampling: Some(sampling),
            offset: 0.0,
            units: "Å".to_string(),
            endpoint: false,
        }
    }

    pub fn reciprocal_space(label: &str, sampling: f64, offset: f64) -> Self {
        AxisMetadata {
            label: label.to_string(),
            kind: AxisKind::ReciprocalSpace,
            sampling: Some(sampling),
            offset,
            units: "mrad".to_string(),
            endpoint: false,
        }
    }

    fn unitless(label: &str, kind: AxisKind) -> Self {
        AxisMetadata {
            label: label.to_string(),
            kind,
            sampling: None,
            offset: 0.0,
            units: String::new(),
            endpoint: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_sampling() {
        let grid = Grid::new((20.0, 10.0), (200, 50));
        let sampling = grid.sampling().expect("defined grid");
        assert!((sampling.0 - 0.1).abs() < 1e-12);
        assert!((sampling.1 - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_grid_from_extent_sampling_rounds_up() {
        let grid = Grid::from_extent_sampling((10.0, 10.0), (0.3, 0.3));
        assert_eq!(grid.gpts, Some((34, 34)));
    }

    #[test]
    fn test_undefined_grid_is_config_error() {
        let grid = Grid {
            extent: Some((10.0, 10.0)),
            gpts: None,
        };
        match grid.check_is_defined() {
            Err(PrismError::Config(msg)) => assert!(msg.contains("gpts")),
            other => panic!("Unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_grid_match_adopts_missing_fields() {
        let partial = Grid {
            extent: None,
            gpts: Some((64, 64)),
        };
        let full = Grid::new((12.0, 12.0), (64, 64));
        let matched = partial.matched(&full).expect("compatible grids");
        assert_eq!(matched, full);
    }

    #[test]
    fn test_grid_match_rejects_conflict() {
        let a = Grid::new((12.0, 12.0), (64, 64));
        let b = Grid::new((12.0, 12.0), (32, 64));
        assert!(a.matched(&b).is_err());
    }

    #[test]
    fn test_gpts_within_angle_is_odd_and_capped() {
        let optics = OpticalConfiguration::new(Grid::new((20.0, 20.0), (256, 256)), 100e3);
        let gpts = optics.gpts_within_angle(20.0).expect("valid angle");
        assert_eq!(gpts.0 % 2, 1);
        assert!(gpts.0 < 256);
        let capped = optics.gpts_within_angle(1e4).expect("valid angle");
        assert_eq!(capped, (256, 256));
    }

    #[test]
    fn test_normalization_parse() {
        assert_eq!("probe".parse::<Normalization>().ok(), Some(Normalization::Probe));
        assert_eq!(
            "planewaves".parse::<Normalization>().ok(),
            Some(Normalization::PlaneWaves)
        );
        assert!("amplitude".parse::<Normalization>().is_err());
    }

    #[test]
    fn test_missing_energy_is_config_error() {
        let optics = OpticalConfiguration::default();
        assert!(matches!(optics.wavelength(), Err(PrismError::Config(_))));
    }
}
