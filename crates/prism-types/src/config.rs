// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Config
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use crate::constants::{DEFAULT_CHUNK_BYTES, DEFAULT_PLANEWAVE_CUTOFF, DEFAULT_PROBES_PER_REDUCTION};
use crate::error::{PrismError, PrismResult};
use crate::state::{BeamTilt, Device, Grid, Normalization, OpticalConfiguration};
use serde::{Deserialize, Serialize};

/// Top-level simulation configuration, loaded from JSON.
///
/// Any two of `extent`, `gpts` and `sampling` define the grid. The grid may
/// also be left undefined and inherited from the potential at build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Beam energy (eV).
    pub energy: f64,
    /// Plane-wave expansion cutoff (mrad).
    #[serde(default = "default_planewave_cutoff")]
    pub planewave_cutoff: f64,
    #[serde(default = "default_interpolation")]
    pub interpolation: [usize; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<usize>,
    #[serde(default = "default_normalize")]
    pub normalize: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extent: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpts: Option<[usize; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<[f64; 2]>,
    /// Plane waves per chunk. When absent the byte budget decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<usize>,
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
    /// Beam tilt (mrad).
    #[serde(default)]
    pub tilt: [f64; 2],
    #[serde(default)]
    pub device: Device,
    #[serde(default)]
    pub store_on_host: bool,
    /// Downsampling angle (mrad) applied to the stored basis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downsample: Option<f64>,
    /// Normalization label: "probe" or "planewaves".
    #[serde(default = "default_normalization")]
    pub normalization: String,
    #[serde(default = "default_probes_per_reduction")]
    pub probes_per_reduction: usize,
    #[serde(default)]
    pub ctf: CtfConfig,
}

/// Contrast transfer function parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CtfConfig {
    /// Aperture (mrad). Defaults to the plane-wave cutoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semiangle_cutoff: Option<f64>,
    /// Defocus (Å), positive is underfocus.
    #[serde(default)]
    pub defocus: f64,
    /// Spherical aberration (Å).
    #[serde(default)]
    pub cs: f64,
}

fn default_planewave_cutoff() -> f64 {
    DEFAULT_PLANEWAVE_CUTOFF
}
fn default_interpolation() -> [usize; 2] {
    [1, 1]
}
fn default_normalize() -> bool {
    true
}
fn default_chunk_bytes() -> usize {
    DEFAULT_CHUNK_BYTES
}
fn default_normalization() -> String {
    "probe".to_string()
}
fn default_probes_per_reduction() -> usize {
    DEFAULT_PROBES_PER_REDUCTION
}

impl SimulationConfig {
    /// Load from a JSON file.
    pub fn from_file(path: &str) -> PrismResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Grid from whichever pair of extent/gpts/sampling is present.
    pub fn grid(&self) -> Grid {
        let pair = |a: [f64; 2]| (a[0], a[1]);
        match (self.extent, self.gpts, self.sampling) {
            (Some(e), Some(g), _) => Grid::new(pair(e), (g[0], g[1])),
            (Some(e), None, Some(s)) => Grid::from_extent_sampling(pair(e), pair(s)),
            (None, Some(g), Some(s)) => Grid::from_gpts_sampling((g[0], g[1]), pair(s)),
            (extent, gpts, _) => Grid {
                extent: extent.map(pair),
                gpts: gpts.map(|g| (g[0], g[1])),
            },
        }
    }

    pub fn optics(&self) -> OpticalConfiguration {
        OpticalConfiguration {
            grid: self.grid(),
            energy: Some(self.energy),
            tilt: BeamTilt {
                x: self.tilt[0],
                y: self.tilt[1],
            },
        }
    }

    pub fn normalization(&self) -> PrismResult<Normalization> {
        self.normalization.parse()
    }

    /// Check the scalar parameters. Grid completeness is checked at build time.
    pub fn validate(&self) -> PrismResult<()> {
        if !self.energy.is_finite() || self.energy <= 0.0 {
            return Err(PrismError::Config(format!(
                "energy must be finite and > 0, got {}",
                self.energy
            )));
        }
        if !self.planewave_cutoff.is_finite() || self.planewave_cutoff <= 0.0 {
            return Err(PrismError::Config(format!(
                "planewave_cutoff must be > 0, got {}",
                self.planewave_cutoff
            )));
        }
        if self.interpolation.iter().any(|&f| f == 0) {
            return Err(PrismError::Config(format!(
                "interpolation factors must be >= 1, got {:?}",
                self.interpolation
            )));
        }
        if self.chunks == Some(0) || self.chunk_bytes == 0 {
            return Err(PrismError::Config(
                "chunk size must be >= 1".to_string(),
            ));
        }
        if self.probes_per_reduction == 0 {
            return Err(PrismError::Config(
                "probes_per_reduction must be >= 1".to_string(),
            ));
        }
        self.normalization()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{ "energy": 100000.0, "extent": [20.0, 20.0], "gpts": [256, 256] }"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn test_load_minimal_config_fills_defaults() {
        let file = write_config(MINIMAL);
        let cfg = SimulationConfig::from_file(&file.path().to_string_lossy())
            .expect("minimal config loads");
        assert!((cfg.planewave_cutoff - 30.0).abs() < 1e-12);
        assert_eq!(cfg.interpolation, [1, 1]);
        assert!(cfg.normalize);
        assert_eq!(cfg.device, Device::Cpu);
        assert_eq!(cfg.probes_per_reduction, 300);
        assert_eq!(cfg.chunk_bytes, 128 * 1024 * 1024);
        assert!(cfg.ctf.semiangle_cutoff.is_none());
        cfg.validate().expect("valid config");
    }

    #[test]
    fn test_grid_from_extent_and_sampling() {
        let json = r#"{ "energy": 200000.0, "extent": [10.0, 10.0], "sampling": [0.05, 0.05] }"#;
        let cfg: SimulationConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(cfg.grid().gpts, Some((200, 200)));
    }

    #[test]
    fn test_partial_grid_stays_partial() {
        let json = r#"{ "energy": 200000.0, "gpts": [64, 64] }"#;
        let cfg: SimulationConfig = serde_json::from_str(json).expect("parse");
        let grid = cfg.grid();
        assert!(grid.extent.is_none());
        assert_eq!(grid.gpts, Some((64, 64)));
    }

    #[test]
    fn test_unknown_normalization_rejected() {
        let json = r#"{ "energy": 100000.0, "normalization": "amplitude" }"#;
        let cfg: SimulationConfig = serde_json::from_str(json).expect("parse");
        assert!(matches!(cfg.validate(), Err(PrismError::Config(_))));
    }

    #[test]
    fn test_zero_interpolation_rejected() {
        let json = r#"{ "energy": 100000.0, "interpolation": [0, 2] }"#;
        let cfg: SimulationConfig = serde_json::from_str(json).expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = SimulationConfig::from_file("/nonexistent/prism_config.json");
        assert!(matches!(result, Err(PrismError::Io(_))));
    }

    #[test]
    fn test_roundtrip_serialization() {
        let cfg: SimulationConfig = serde_json::from_str(MINIMAL).expect("parse");
        let json = serde_json::to_string_pretty(&cfg).expect("serialize");
        let cfg2: SimulationConfig = serde_json::from_str(&json).expect("reparse");
        assert_eq!(cfg.extent, cfg2.extent);
        assert_eq!(cfg.gpts, cfg2.gpts);
        assert_eq!(cfg.normalization, cfg2.normalization);
    }
}
