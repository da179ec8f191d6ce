// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Scans
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Probe position sets.
//!
//! Grid positions are always `origin + index * sampling` with the index taken
//! on the parent lattice, so sub-scans from `GridScan::divide` reproduce the
//! parent positions bit for bit.

use ndarray::Array2;
use prism_math::chunks::{generate_chunks, subdivide_into_chunks};
use prism_types::error::{PrismError, PrismResult};
use prism_types::state::AxisMetadata;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq)]
pub struct GridScan {
    origin: (f64, f64),
    sampling: (f64, f64),
    gpts: (usize, usize),
    endpoint: (bool, bool),
    index_offset: (usize, usize),
}

fn axis_sampling(start: f64, end: f64, n: usize, endpoint: bool) -> f64 {
    let intervals = if endpoint { n.saturating_sub(1) } else { n };
    if intervals == 0 {
        end - start
    } else {
        (end - start) / intervals as f64
    }
}

impl GridScan {
    /// `gpts` positions per axis between `start` and `end`.
    pub fn new(start: (f64, f64), end: (f64, f64), gpts: (usize, usize), endpoint: bool) -> PrismResult<Self> {
        if gpts.0 == 0 || gpts.1 == 0 {
            return Err(PrismError::Config(format!("scan gpts must be >= 1, got {gpts:?}")));
        }
        Ok(GridScan {
            origin: start,
            sampling: (
                axis_sampling(start.0, end.0, gpts.0, endpoint),
                axis_sampling(start.1, end.1, gpts.1, endpoint),
            ),
            gpts,
            endpoint: (endpoint, endpoint),
            index_offset: (0, 0),
        })
    }

    /// Positions at most `sampling` apart, the count rounded up.
    pub fn from_sampling(start: (f64, f64), end: (f64, f64), sampling: (f64, f64), endpoint: bool) -> PrismResult<Self> {
        if !(sampling.0 > 0.0 && sampling.1 > 0.0) {
            return Err(PrismError::Config(format!(
                "scan sampling must be > 0, got {sampling:?}"
            )));
        }
        let count = |extent: f64, s: f64| {
            let n = (extent.abs() / s).ceil() as usize;
            (n + usize::from(endpoint)).max(1)
        };
        let gpts = (count(end.0 - start.0, sampling.0), count(end.1 - start.1, sampling.1));
        Self::new(start, end, gpts, endpoint)
    }

    /// Scan over the whole cell at `sampling`.
    pub fn covering(extent: (f64, f64), sampling: f64) -> PrismResult<Self> {
        Self::from_sampling((0.0, 0.0), extent, (sampling, sampling), false)
    }

    pub fn gpts(&self) -> (usize, usize) {
        self.gpts
    }

    pub fn sampling(&self) -> (f64, f64) {
        self.sampling
    }

    pub fn start(&self) -> (f64, f64) {
        (
            self.origin.0 + self.index_offset.0 as f64 * self.sampling.0,
            self.origin.1 + self.index_offset.1 as f64 * self.sampling.1,
        )
    }

    pub fn end(&self) -> (f64, f64) {
        let span = |n: usize, endpoint: bool| {
            let intervals = if endpoint { n.saturating_sub(1) } else { n };
            intervals as f64
        };
        let start = self.start();
        (
            start.0 + span(self.gpts.0, self.endpoint.0) * self.sampling.0,
            start.1 + span(self.gpts.1, self.endpoint.1) * self.sampling.1,
        )
    }

    fn position(&self, i: usize, j: usize) -> (f64, f64) {
        (
            self.origin.0 + (self.index_offset.0 + i) as f64 * self.sampling.0,
            self.origin.1 + (self.index_offset.1 + j) as f64 * self.sampling.1,
        )
    }

    /// Row-major `nx × ny` blocks with balanced sizes.
    pub fn divide(&self, divisions: (usize, usize)) -> PrismResult<Vec<GridScan>> {
        let xs = subdivide_into_chunks(self.gpts.0, divisions.0)?;
        let ys = subdivide_into_chunks(self.gpts.1, divisions.1)?;
        let mut scans = Vec::with_capacity(xs.len() * ys.len());
        for (ix, rx) in xs.iter().enumerate() {
            for (iy, ry) in ys.iter().enumerate() {
                scans.push(GridScan {
                    origin: self.origin,
                    sampling: self.sampling,
                    gpts: (rx.len(), ry.len()),
                    endpoint: (
                        self.endpoint.0 && ix + 1 == xs.len(),
                        self.endpoint.1 && iy + 1 == ys.len(),
                    ),
                    index_offset: (self.index_offset.0 + rx.start, self.index_offset.1 + ry.start),
                });
            }
        }
        Ok(scans)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineScan {
    pub start: (f64, f64),
    pub end: (f64, f64),
    pub gpts: usize,
    pub endpoint: bool,
}

impl LineScan {
    pub fn new(start: (f64, f64), end: (f64, f64), gpts: usize, endpoint: bool) -> PrismResult<Self> {
        if gpts == 0 {
            return Err(PrismError::Config("line scan needs >= 1 position".to_string()));
        }
        Ok(LineScan {
            start,
            end,
            gpts,
            endpoint,
        })
    }

    fn step(&self) -> (f64, f64) {
        let intervals = if self.endpoint {
            self.gpts.saturating_sub(1)
        } else {
            self.gpts
        };
        let intervals = intervals.max(1) as f64;
        (
            (self.end.0 - self.start.0) / intervals,
            (self.end.1 - self.start.1) / intervals,
        )
    }

    fn position(&self, i: usize) -> (f64, f64) {
        let step = self.step();
        (self.start.0 + i as f64 * step.0, self.start.1 + i as f64 * step.1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomScan {
    positions: Array2<f64>,
}

impl CustomScan {
    /// Positions shaped `[n, 2]` (Å).
    pub fn new(positions: Array2<f64>) -> PrismResult<Self> {
        if positions.ncols() != 2 || positions.nrows() == 0 {
            return Err(PrismError::Config(format!(
                "custom scan needs positions shaped [n, 2], got {:?}",
                positions.dim()
            )));
        }
        Ok(CustomScan { positions })
    }

    pub fn from_points(points: &[(f64, f64)]) -> PrismResult<Self> {
        let flat: Vec<f64> = points.iter().flat_map(|&(x, y)| [x, y]).collect();
        let positions = Array2::from_shape_vec((points.len(), 2), flat)
            .map_err(|e| PrismError::Invariant(format!("position array: {e}")))?;
        Self::new(positions)
    }
}

/// A set of probe positions.
#[derive(Debug, Clone, PartialEq)]
pub enum Scan {
    Grid(GridScan),
    Line(LineScan),
    Custom(CustomScan),
}

/// One batch of positions and the index region it occupies.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanBatch {
    /// Range per scan axis.
    pub index: Vec<Range<usize>>,
    /// Batch shape, one entry per scan axis.
    pub shape: Vec<usize>,
    /// `[prod(shape), 2]`, row-major over `shape`.
    pub positions: Array2<f64>,
}

impl From<GridScan> for Scan {
    fn from(scan: GridScan) -> Self {
        Scan::Grid(scan)
    }
}

impl From<LineScan> for Scan {
    fn from(scan: LineScan) -> Self {
        Scan::Line(scan)
    }
}

impl From<CustomScan> for Scan {
    fn from(scan: CustomScan) -> Self {
        Scan::Custom(scan)
    }
}

impl Scan {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Scan::Grid(g) => vec![g.gpts.0, g.gpts.1],
            Scan::Line(l) => vec![l.gpts],
            Scan::Custom(c) => vec![c.positions.nrows()],
        }
    }

    pub fn num_positions(&self) -> usize {
        self.shape().iter().product()
    }

    /// Lower and upper corner of the positions.
    pub fn limits(&self) -> ((f64, f64), (f64, f64)) {
        match self {
            Scan::Grid(g) => (g.start(), g.end()),
            Scan::Line(l) => (l.start, l.end),
            Scan::Custom(c) => {
                let fold = |col: usize, f: fn(f64, f64) -> f64, init: f64| {
                    c.positions.column(col).iter().copied().fold(init, f)
                };
                (
                    (fold(0, f64::min, f64::INFINITY), fold(1, f64::min, f64::INFINITY)),
                    (fold(0, f64::max, f64::NEG_INFINITY), fold(1, f64::max, f64::NEG_INFINITY)),
                )
            }
        }
    }

    pub fn axes_metadata(&self) -> Vec<AxisMetadata> {
        match self {
            Scan::Grid(g) => {
                let start = g.start();
                vec![
                    AxisMetadata::scan("x", g.sampling.0, start.0, g.endpoint.0),
                    AxisMetadata::scan("y", g.sampling.1, start.1, g.endpoint.1),
                ]
            }
            Scan::Line(l) => {
                let step = l.step();
                vec![AxisMetadata::scan("r", step.0.hypot(step.1), 0.0, l.endpoint)]
            }
            Scan::Custom(_) => vec![AxisMetadata::positions()],
        }
    }

    /// All positions, `[num_positions, 2]`, row-major over `shape`.
    pub fn positions(&self) -> Array2<f64> {
        let ranges: Vec<Range<usize>> = self.shape().into_iter().map(|n| 0..n).collect();
        self.positions_in(&ranges)
    }

    fn positions_in(&self, index: &[Range<usize>]) -> Array2<f64> {
        match self {
            Scan::Grid(g) => {
                let (rx, ry) = (index[0].clone(), index[1].clone());
                let ny = ry.len();
                Array2::from_shape_fn((rx.len() * ny, 2), |(n, c)| {
                    let p = g.position(rx.start + n / ny, ry.start + n % ny);
                    if c == 0 {
                        p.0
                    } else {
                        p.1
                    }
                })
            }
            Scan::Line(l) => {
                let r = index[0].clone();
                Array2::from_shape_fn((r.len(), 2), |(n, c)| {
                    let p = l.position(r.start + n);
                    if c == 0 {
                        p.0
                    } else {
                        p.1
                    }
                })
            }
            Scan::Custom(c) => c.positions.slice(ndarray::s![index[0].clone(), ..]).to_owned(),
        }
    }

    /// Batches of at most `max_positions` positions.
    ///
    /// Grid scans use square `floor(sqrt(n))` blocks; the other scans batch
    /// along their single axis. The iterator can be recreated at will.
    pub fn batches(&self, max_positions: usize) -> PrismResult<ScanBatches<'_>> {
        if max_positions == 0 {
            return Err(PrismError::Config("batch size must be >= 1".to_string()));
        }
        let shape = self.shape();
        let regions: Vec<Vec<Range<usize>>> = match self {
            Scan::Grid(_) => {
                let side = ((max_positions as f64).sqrt().floor() as usize).max(1);
                let xs = generate_chunks(shape[0], side)?;
                let ys = generate_chunks(shape[1], side)?;
                xs.iter()
                    .flat_map(|rx| ys.iter().map(move |ry| vec![rx.clone(), ry.clone()]))
                    .collect()
            }
            Scan::Line(_) | Scan::Custom(_) => generate_chunks(shape[0], max_positions)?
                .into_iter()
                .map(|r| vec![r])
                .collect(),
        };
        Ok(ScanBatches {
            scan: self,
            regions: regions.into_iter(),
        })
    }
}

pub struct ScanBatches<'a> {
    scan: &'a Scan,
    regions: std::vec::IntoIter<Vec<Range<usize>>>,
}

impl Iterator for ScanBatches<'_> {
    type Item = ScanBatch;

    fn next(&mut self) -> Option<ScanBatch> {
        let index = self.regions.next()?;
        let positions = self.scan.positions_in(&index);
        Some(ScanBatch {
            shape: index.iter().map(|r| r.len()).collect(),
            index,
            positions,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.regions.size_hint()
    }
}

impl ExactSizeIterator for ScanBatches<'_> {}
