// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Measurements
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Detector output arrays: batch writes, ensemble stacking and block stitching.
//! Deferred reductions hand back [`Measurements::Deferred`] until computed.

use crate::backend::TaskNode;
use ndarray::{concatenate, stack, ArrayD, ArrayViewD, ArrayViewMutD, Axis, IxDyn, Slice};
use num_complex::Complex32;
use prism_types::error::{PrismError, PrismResult};
use prism_types::state::{AxisKind, AxisMetadata};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    Images,
    DiffractionPatterns,
    Waves,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementDtype {
    Float32,
    Complex64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementArray {
    Real(ArrayD<f32>),
    Complex(ArrayD<Complex32>),
}

fn region_mut<'a, T>(
    array: &'a mut ArrayD<T>,
    ensemble: Option<usize>,
    index: &[Range<usize>],
) -> PrismResult<ArrayViewMutD<'a, T>> {
    let mut view = array.view_mut();
    if let Some(e) = ensemble {
        if e >= view.len_of(Axis(0)) {
            return Err(PrismError::Invariant(format!("ensemble index {e} out of range")));
        }
        view = view.index_axis_move(Axis(0), e);
    }
    if index.len() > view.ndim() {
        return Err(PrismError::Invariant(format!(
            "{} index ranges for a {}-dimensional measurement",
            index.len(),
            view.ndim()
        )));
    }
    for (axis, r) in index.iter().enumerate() {
        if r.end > view.len_of(Axis(axis)) {
            return Err(PrismError::Invariant(format!(
                "range {r:?} exceeds axis {axis} of length {}",
                view.len_of(Axis(axis))
            )));
        }
    }
    view.slice_each_axis_inplace(|ax| match index.get(ax.axis.index()) {
        Some(r) => Slice::from(r.clone()),
        None => Slice::from(..),
    });
    Ok(view)
}

fn write_into<T>(dst: &mut ArrayViewMutD<T>, src: ArrayViewD<T>, accumulate: bool) -> PrismResult<()>
where
    T: Clone + std::ops::AddAssign,
{
    if dst.shape() != src.shape() {
        return Err(PrismError::Invariant(format!(
            "batch shape {:?} does not fit region {:?}",
            src.shape(),
            dst.shape()
        )));
    }
    if accumulate {
        dst.zip_mut_with(&src, |d, s| *d += s.clone());
    } else {
        dst.assign(&src);
    }
    Ok(())
}

impl MeasurementArray {
    pub fn zeros(dtype: MeasurementDtype, shape: &[usize]) -> Self {
        match dtype {
            MeasurementDtype::Float32 => MeasurementArray::Real(ArrayD::zeros(IxDyn(shape))),
            MeasurementDtype::Complex64 => MeasurementArray::Complex(ArrayD::zeros(IxDyn(shape))),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            MeasurementArray::Real(a) => a.shape(),
            MeasurementArray::Complex(a) => a.shape(),
        }
    }

    pub fn dtype(&self) -> MeasurementDtype {
        match self {
            MeasurementArray::Real(_) => MeasurementDtype::Float32,
            MeasurementArray::Complex(_) => MeasurementDtype::Complex64,
        }
    }

    pub fn as_real(&self) -> Option<&ArrayD<f32>> {
        match self {
            MeasurementArray::Real(a) => Some(a),
            MeasurementArray::Complex(_) => None,
        }
    }

    pub fn as_complex(&self) -> Option<&ArrayD<Complex32>> {
        match self {
            MeasurementArray::Complex(a) => Some(a),
            MeasurementArray::Real(_) => None,
        }
    }

    pub fn scale(&mut self, factor: f32) {
        match self {
            MeasurementArray::Real(a) => a.mapv_inplace(|v| v * factor),
            MeasurementArray::Complex(a) => a.mapv_inplace(|v| v * factor),
        }
    }

    /// Write (or add) `values` into the region `index`, optionally within one
    /// ensemble member.
    pub fn put_region(
        &mut self,
        ensemble: Option<usize>,
        index: &[Range<usize>],
        values: &MeasurementArray,
        accumulate: bool,
    ) -> PrismResult<()> {
        match (self, values) {
            (MeasurementArray::Real(dst), MeasurementArray::Real(src)) => {
                write_into(&mut region_mut(dst, ensemble, index)?, src.view(), accumulate)
            }
            (MeasurementArray::Complex(dst), MeasurementArray::Complex(src)) => {
                write_into(&mut region_mut(dst, ensemble, index)?, src.view(), accumulate)
            }
            _ => Err(PrismError::Invariant(
                "measurement dtype mismatch".to_string(),
            )),
        }
    }

    fn concatenate(axis: usize, parts: &[&MeasurementArray]) -> PrismResult<MeasurementArray> {
        let shape_err = |e: ndarray::ShapeError| PrismError::Invariant(format!("block shapes: {e}"));
        match parts.first() {
            Some(MeasurementArray::Real(_)) => {
                let views = parts
                    .iter()
                    .map(|p| p.as_real().map(|a| a.view()))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| PrismError::Invariant("mixed measurement dtypes".to_string()))?;
                Ok(MeasurementArray::Real(concatenate(Axis(axis), &views).map_err(shape_err)?))
            }
            Some(MeasurementArray::Complex(_)) => {
                let views = parts
                    .iter()
                    .map(|p| p.as_complex().map(|a| a.view()))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| PrismError::Invariant("mixed measurement dtypes".to_string()))?;
                Ok(MeasurementArray::Complex(concatenate(Axis(axis), &views).map_err(shape_err)?))
            }
            None => Err(PrismError::Invariant("nothing to concatenate".to_string())),
        }
    }

    fn stack(parts: &[&MeasurementArray]) -> PrismResult<MeasurementArray> {
        let shape_err = |e: ndarray::ShapeError| PrismError::Invariant(format!("member shapes: {e}"));
        let mixed = || PrismError::Invariant("mixed measurement dtypes".to_string());
        match parts.first() {
            Some(MeasurementArray::Real(_)) => {
                let views = parts
                    .iter()
                    .map(|p| p.as_real().map(|a| a.view()))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(mixed)?;
                Ok(MeasurementArray::Real(stack(Axis(0), &views).map_err(shape_err)?))
            }
            Some(MeasurementArray::Complex(_)) => {
                let views = parts
                    .iter()
                    .map(|p| p.as_complex().map(|a| a.view()))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(mixed)?;
                Ok(MeasurementArray::Complex(stack(Axis(0), &views).map_err(shape_err)?))
            }
            None => Err(PrismError::Invariant("nothing to stack".to_string())),
        }
    }
}

/// A detector's output over a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub array: MeasurementArray,
    pub kind: MeasurementKind,
    /// One entry per array axis.
    pub axes_metadata: Vec<AxisMetadata>,
}

impl Measurement {
    pub fn new(array: MeasurementArray, kind: MeasurementKind, axes_metadata: Vec<AxisMetadata>) -> PrismResult<Self> {
        if axes_metadata.len() != array.shape().len() {
            return Err(PrismError::Config(format!(
                "{} axis labels for a {}-dimensional measurement",
                axes_metadata.len(),
                array.shape().len()
            )));
        }
        Ok(Measurement {
            array,
            kind,
            axes_metadata,
        })
    }

    pub fn shape(&self) -> &[usize] {
        self.array.shape()
    }

    pub fn has_ensemble_axis(&self) -> bool {
        self.axes_metadata
            .first()
            .is_some_and(|a| a.kind == AxisKind::FrozenPhonons)
    }

    /// Stack members on a new leading frozen-phonon axis.
    pub fn stack(members: &[Measurement]) -> PrismResult<Measurement> {
        let first = members
            .first()
            .ok_or_else(|| PrismError::Invariant("no ensemble members".to_string()))?;
        let arrays: Vec<&MeasurementArray> = members.iter().map(|m| &m.array).collect();
        let mut axes = vec![AxisMetadata::frozen_phonons()];
        axes.extend(first.axes_metadata.iter().cloned());
        Measurement::new(MeasurementArray::stack(&arrays)?, first.kind, axes)
    }

    /// Average of the members.
    pub fn mean(members: &[Measurement]) -> PrismResult<Measurement> {
        let first = members
            .first()
            .ok_or_else(|| PrismError::Invariant("no ensemble members".to_string()))?;
        let mut sum = first.clone();
        let full: Vec<Range<usize>> = first.shape().iter().map(|&n| 0..n).collect();
        for m in &members[1..] {
            sum.array.put_region(None, &full, &m.array, true)?;
        }
        sum.array.scale(1.0 / members.len() as f32);
        Ok(sum)
    }

    /// Reassemble row-major `nx × ny` scan blocks along the first two axes.
    pub fn stitch(blocks: &[Measurement], divisions: (usize, usize)) -> PrismResult<Measurement> {
        if blocks.len() != divisions.0 * divisions.1 || blocks.is_empty() {
            return Err(PrismError::Invariant(format!(
                "{} blocks cannot tile a {}x{} division",
                blocks.len(),
                divisions.0,
                divisions.1
            )));
        }
        let rows = blocks
            .chunks(divisions.1)
            .map(|row| {
                let parts: Vec<&MeasurementArray> = row.iter().map(|m| &m.array).collect();
                MeasurementArray::concatenate(1, &parts)
            })
            .collect::<PrismResult<Vec<_>>>()?;
        let row_refs: Vec<&MeasurementArray> = rows.iter().collect();
        let array = MeasurementArray::concatenate(0, &row_refs)?;
        Measurement::new(array, blocks[0].kind, blocks[0].axes_metadata.clone())
    }
}

/// Combine per-member measurement lists (`members[member][detector]`) into
/// one measurement per detector, averaging where `ensemble_mean` is set and
/// stacking otherwise.
pub fn stack_measurement_ensembles(
    members: Vec<Vec<Measurement>>,
    ensemble_mean: &[bool],
) -> PrismResult<Vec<Measurement>> {
    if members.len() == 1 {
        return members
            .into_iter()
            .next()
            .ok_or_else(|| PrismError::Invariant("no ensemble members".to_string()));
    }
    let mut out = Vec::with_capacity(ensemble_mean.len());
    for (d, &mean) in ensemble_mean.iter().enumerate() {
        let per_detector: Vec<Measurement> = members
            .iter()
            .map(|m| {
                m.get(d)
                    .cloned()
                    .ok_or_else(|| PrismError::Invariant(format!("member lacks detector {d}")))
            })
            .collect::<PrismResult<_>>()?;
        out.push(if mean {
            Measurement::mean(&per_detector)?
        } else {
            Measurement::stack(&per_detector)?
        });
    }
    Ok(out)
}

/// Reduction output: computed measurements, or the graph that yields them.
#[derive(Debug)]
pub enum Measurements {
    Computed(Vec<Measurement>),
    Deferred(DeferredMeasurements),
}

impl Measurements {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Measurements::Deferred(_))
    }

    /// One measurement per detector, evaluating the graph if deferred.
    pub fn compute(self) -> PrismResult<Vec<Measurement>> {
        match self {
            Measurements::Computed(measurements) => Ok(measurements),
            Measurements::Deferred(deferred) => deferred.compute(),
        }
    }
}

/// Per-member reduction nodes, each assembling its own scan blocks.
#[derive(Debug)]
pub struct DeferredMeasurements {
    members: Vec<Arc<TaskNode<Vec<Measurement>>>>,
    ensemble_mean: Vec<bool>,
    blocks: usize,
}

impl DeferredMeasurements {
    pub(crate) fn new(members: Vec<Arc<TaskNode<Vec<Measurement>>>>, ensemble_mean: Vec<bool>, blocks: usize) -> Self {
        DeferredMeasurements {
            members,
            ensemble_mean,
            blocks,
        }
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// Scan-block nodes over all members.
    pub fn num_blocks(&self) -> usize {
        self.blocks
    }

    pub fn is_computed(&self) -> bool {
        self.members.iter().all(|m| m.is_computed())
    }

    pub fn compute(self) -> PrismResult<Vec<Measurement>> {
        let computed = self
            .members
            .par_iter()
            .map(|m| m.get())
            .collect::<PrismResult<Vec<_>>>()?;
        let members: Vec<Vec<Measurement>> = computed.iter().map(|m| m.as_ref().clone()).collect();
        stack_measurement_ensembles(members, &self.ensemble_mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(values: &[f32], shape: (usize, usize)) -> Measurement {
        let array = ArrayD::from_shape_vec(IxDyn(&[shape.0, shape.1]), values.to_vec()).expect("shape");
        Measurement::new(
            MeasurementArray::Real(array),
            MeasurementKind::Images,
            vec![AxisMetadata::scan("x", 1.0, 0.0, false), AxisMetadata::scan("y", 1.0, 0.0, false)],
        )
        .expect("measurement")
    }

    #[test]
    fn test_put_region_writes_block() {
        let mut m = MeasurementArray::zeros(MeasurementDtype::Float32, &[4, 4]);
        let block = MeasurementArray::Real(ArrayD::from_elem(IxDyn(&[2, 2]), 1.0));
        m.put_region(None, &[2..4, 0..2], &block, false).expect("write");
        let a = m.as_real().expect("real");
        assert_eq!(a.sum(), 4.0);
        assert_eq!(a[[3, 1]], 1.0);
        assert_eq!(a[[0, 0]], 0.0);
    }

    #[test]
    fn test_put_region_shape_mismatch() {
        let mut m = MeasurementArray::zeros(MeasurementDtype::Float32, &[4, 4]);
        let block = MeasurementArray::Real(ArrayD::from_elem(IxDyn(&[3, 2]), 1.0));
        assert!(m.put_region(None, &[0..2, 0..2], &block, false).is_err());
    }

    #[test]
    fn test_stitch_row_major() {
        let blocks = vec![
            image(&[1.0, 2.0], (1, 2)),
            image(&[3.0], (1, 1)),
            image(&[4.0, 5.0], (1, 2)),
            image(&[6.0], (1, 1)),
        ];
        let stitched = Measurement::stitch(&blocks, (2, 2)).expect("stitch");
        let a = stitched.array.as_real().expect("real");
        assert_eq!(a.shape(), &[2, 3]);
        assert_eq!(a.iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_stitch_wrong_count() {
        let blocks = vec![image(&[1.0], (1, 1))];
        assert!(matches!(Measurement::stitch(&blocks, (2, 1)), Err(PrismError::Invariant(_))));
    }

    #[test]
    fn test_ensemble_mean_and_stack() {
        let members = vec![vec![image(&[1.0, 3.0], (1, 2))], vec![image(&[3.0, 5.0], (1, 2))]];
        let mean = stack_measurement_ensembles(members.clone(), &[true]).expect("mean");
        assert_eq!(mean[0].array.as_real().expect("real").iter().copied().collect::<Vec<_>>(), vec![2.0, 4.0]);
        let stacked = stack_measurement_ensembles(members, &[false]).expect("stack");
        assert_eq!(stacked[0].shape(), &[2, 1, 2]);
        assert!(stacked[0].has_ensemble_axis());
    }
}
