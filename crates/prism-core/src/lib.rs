// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Core
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! PRISM S-matrix engine for STEM simulation.
//!
//! Stage 1: plane-wave basis, potentials, multislice
//! Stage 2: S-matrix build, derived views, deferred chunks
//! Stage 3: reduction, detectors, scan distribution

pub mod backend;
pub mod ctf;
pub mod detector;
pub mod distribute;
pub mod measurement;
pub mod multislice;
pub mod plane_waves;
pub mod potential;
pub mod reduction;
pub mod scan;
pub mod smatrix;
pub mod smatrix_array;
pub mod wave_vectors;
pub mod waves;

pub use backend::{ArrayBackend, ExecutionMode, HostBackend};
pub use measurement::{Measurement, Measurements};
pub use smatrix::{ChunkSpec, SMatrix};
pub use smatrix_array::{ReduceOptions, SMatrixArray, SMatrixMetadata};
