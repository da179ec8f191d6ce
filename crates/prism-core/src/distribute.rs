// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Scan Distribution
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Tile a grid scan, reduce each tile against its own crop of the S-matrix,
//! and stitch the tiles back together.
//!
//! Tiles share nothing mutable and run in parallel via Rayon.

use crate::ctf::Ctf;
use crate::detector::Detector;
use crate::measurement::Measurement;
use crate::reduction::reduce_member;
use crate::scan::{GridScan, Scan};
use crate::smatrix_array::{gather_window, CropPlan, SMatrixMetadata};
use ndarray::{Array2, ArrayView3};
use num_complex::Complex32;
use prism_types::error::{PrismError, PrismResult};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Split a grid scan into `nx × ny` tiles, returned row-major
/// (`tile[ix * ny + iy]`), with remainders spread over the first tiles.
pub fn decompose_scan(scan: &GridScan, divisions: (usize, usize)) -> PrismResult<Vec<GridScan>> {
    let (nx, ny) = divisions;
    let gpts = scan.gpts();
    if nx == 0 || ny == 0 {
        return Err(PrismError::Config(
            "scan divisions must be >= 1".to_string(),
        ));
    }
    if nx > gpts.0 || ny > gpts.1 {
        return Err(PrismError::Config(format!(
            "cannot split a {}x{} scan into {nx}x{ny} tiles",
            gpts.0, gpts.1
        )));
    }
    scan.divide(divisions)
}

/// Corners of a tile's positions, for cropping.
fn tile_limits(tile: &GridScan) -> PrismResult<Array2<f64>> {
    let (lo, hi) = Scan::Grid(tile.clone()).limits();
    Array2::from_shape_vec((2, 2), vec![lo.0, lo.1, hi.0, hi.1])
        .map_err(|e| PrismError::Invariant(format!("tile limits: {e}")))
}

/// One scan tile and the crop of the S-matrix it needs.
#[derive(Debug, Clone)]
pub(crate) struct Tile {
    pub scan: GridScan,
    pub crop: CropPlan,
}

/// Tiles and crops for a distributed reduction. Every configuration error
/// of the tiling is raised here.
pub(crate) fn plan_tiles(meta: &SMatrixMetadata, scan: &GridScan, divisions: (usize, usize)) -> PrismResult<Vec<Tile>> {
    if divisions.0 > meta.interpolation.0 || divisions.1 > meta.interpolation.1 {
        debug!(
            interpolation = ?meta.interpolation,
            "Scan divisions exceed the interpolation factor."
        );
    }
    decompose_scan(scan, divisions)?
        .into_iter()
        .map(|tile| {
            let crop = meta.crop_plan(&tile_limits(&tile)?)?;
            Ok(Tile { scan: tile, crop })
        })
        .collect()
}

/// Reduce one tile against its own crop of the member.
pub(crate) fn reduce_tile(
    array: ArrayView3<Complex32>,
    meta: &SMatrixMetadata,
    tile: &Tile,
    detectors: &[Arc<dyn Detector>],
    ctf: &Ctf,
    probes_per_reduction: usize,
) -> PrismResult<Vec<Measurement>> {
    let cropped = gather_window(array, &tile.crop.ix, &tile.crop.iy);
    reduce_member(
        cropped.view(),
        &meta.cropped(&tile.crop),
        detectors,
        &Scan::Grid(tile.scan.clone()),
        ctf,
        probes_per_reduction,
    )
}

/// Stitch per-tile measurements (`per_tile[tile][detector]`) and label the
/// scan axes after the whole scan.
pub(crate) fn stitch_tiles<T: AsRef<[Measurement]>>(
    per_tile: &[T],
    scan: &GridScan,
    divisions: (usize, usize),
    num_detectors: usize,
) -> PrismResult<Vec<Measurement>> {
    let scan_axes = Scan::Grid(scan.clone()).axes_metadata();
    let mut stitched = Vec::with_capacity(num_detectors);
    for d in 0..num_detectors {
        let blocks: Vec<Measurement> = per_tile
            .iter()
            .map(|m| {
                m.as_ref()
                    .get(d)
                    .cloned()
                    .ok_or_else(|| PrismError::Invariant(format!("tile lacks detector {d}")))
            })
            .collect::<PrismResult<_>>()?;
        let mut measurement = Measurement::stitch(&blocks, divisions)?;
        measurement.axes_metadata.splice(0..scan_axes.len(), scan_axes.iter().cloned());
        stitched.push(measurement);
    }
    debug!(tiles = per_tile.len(), "Stitched distributed reduction.");
    Ok(stitched)
}

/// Reduce one ensemble member tile by tile and stitch the results.
///
/// Produces the same values as a single reduction over the whole scan.
#[instrument(skip_all, name = "distribute_reduction", fields(nx = divisions.0, ny = divisions.1))]
pub fn distribute_reduction(
    array: ArrayView3<Complex32>,
    meta: &SMatrixMetadata,
    detectors: &[Arc<dyn Detector>],
    scan: &GridScan,
    divisions: (usize, usize),
    ctf: &Ctf,
    probes_per_reduction: usize,
) -> PrismResult<Vec<Measurement>> {
    let tiles = plan_tiles(meta, scan, divisions)?;
    let per_tile: Vec<Vec<Measurement>> = tiles
        .par_iter()
        .map(|tile| reduce_tile(array.view(), meta, tile, detectors, ctf, probes_per_reduction))
        .collect::<PrismResult<_>>()?;
    stitch_tiles(&per_tile, scan, divisions, detectors.len())
}
