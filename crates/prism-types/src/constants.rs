// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Constants
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use std::f64::consts::PI;

/// Planck constant times speed of light (eV·Å).
pub const HC_EV_ANGSTROM: f64 = 12398.419843320026;

/// Electron rest energy m_e c² (eV).
pub const ELECTRON_REST_ENERGY_EV: f64 = 510998.95;

/// Conversion from milliradians to radians.
pub const MRAD: f64 = 1e-3;

/// Default angular cutoff of the plane-wave expansion (mrad).
pub const DEFAULT_PLANEWAVE_CUTOFF: f64 = 30.0;

/// Default number of probe positions reduced per contraction.
pub const DEFAULT_PROBES_PER_REDUCTION: usize = 300;

/// Default azimuthal point increment per ring in a partitioned basis.
pub const DEFAULT_POINTS_PER_RING: usize = 6;

/// Default byte budget for one chunk of plane waves (128 MiB).
pub const DEFAULT_CHUNK_BYTES: usize = 128 * 1024 * 1024;

/// Fraction of the real-space Nyquist frequency passed by the antialias aperture.
pub const ANTIALIAS_APERTURE: f64 = 2.0 / 3.0;

/// Relativistic electron wavelength (Å) for a kinetic energy in eV.
pub fn energy_to_wavelength(energy: f64) -> f64 {
    HC_EV_ANGSTROM / (energy * (2.0 * ELECTRON_REST_ENERGY_EV + energy)).sqrt()
}

/// Interaction parameter σ (rad / (V·Å)) for a kinetic energy in eV.
pub fn energy_to_sigma(energy: f64) -> f64 {
    let wavelength = energy_to_wavelength(energy);
    2.0 * PI / (wavelength * energy) * (ELECTRON_REST_ENERGY_EV + energy)
        / (2.0 * ELECTRON_REST_ENERGY_EV + energy)
}
