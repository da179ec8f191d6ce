// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Error
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrismError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not implemented: {0}")]
    Unimplemented(String),

    #[error("Internal invariant violated: {0}")]
    Invariant(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Numerical failure: {0}")]
    Numerical(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("NPY read error: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    #[error("NPY write error: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),
}

pub type PrismResult<T> = Result<T, PrismError>;
