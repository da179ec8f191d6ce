// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — FFT
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! 2D complex FFT wrappers around rustfft.
//!
//! Convention matches numpy:
//! - Forward FFT (fft2): unnormalized
//! - Inverse FFT (ifft2): normalized by 1/(nx*ny)
//!
//! Also provides `fftfreq`, `fftshift2` and Fourier-space cropping
//! (`fft_crop`, `fft_interpolate`) used to downsample wave functions.

use ndarray::{Array2, Array3, ArrayViewMut1, ArrayViewMut2, Axis};
use num_complex::Complex32;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Pre-planned 2D transforms for one grid shape.
#[derive(Clone)]
pub struct Fft2Plan {
    shape: (usize, usize),
    forward_rows: Arc<dyn Fft<f32>>,
    forward_cols: Arc<dyn Fft<f32>>,
    inverse_rows: Arc<dyn Fft<f32>>,
    inverse_cols: Arc<dyn Fft<f32>>,
}

impl Fft2Plan {
    pub fn new(shape: (usize, usize)) -> Self {
        let mut planner = FftPlanner::new();
        Fft2Plan {
            shape,
            forward_rows: planner.plan_fft_forward(shape.1),
            forward_cols: planner.plan_fft_forward(shape.0),
            inverse_rows: planner.plan_fft_inverse(shape.1),
            inverse_cols: planner.plan_fft_inverse(shape.0),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// In-place forward transform, unnormalized.
    pub fn forward(&self, mut data: ArrayViewMut2<Complex32>) {
        for row in data.rows_mut() {
            process_lane(row, self.forward_rows.as_ref());
        }
        for col in data.columns_mut() {
            process_lane(col, self.forward_cols.as_ref());
        }
    }

    /// In-place inverse transform, normalized by 1/(nx*ny).
    pub fn inverse(&self, mut data: ArrayViewMut2<Complex32>) {
        for row in data.rows_mut() {
            process_lane(row, self.inverse_rows.as_ref());
        }
        for col in data.columns_mut() {
            process_lane(col, self.inverse_cols.as_ref());
        }
        let norm = 1.0 / (self.shape.0 * self.shape.1) as f32;
        data.mapv_inplace(|c| c * norm);
    }

    /// Forward transform of every 2D slice along axis 0, in parallel.
    pub fn forward_batch(&self, data: &mut Array3<Complex32>) {
        data.axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|slice| self.forward(slice));
    }

    /// Inverse transform of every 2D slice along axis 0, in parallel.
    pub fn inverse_batch(&self, data: &mut Array3<Complex32>) {
        data.axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|slice| self.inverse(slice));
    }
}

fn process_lane(mut lane: ArrayViewMut1<Complex32>, fft: &dyn Fft<f32>) {
    if let Some(slice) = lane.as_slice_mut() {
        fft.process(slice);
        return;
    }
    // Strided lane (columns): copy out, transform, copy back.
    let mut buffer: Vec<Complex32> = lane.iter().copied().collect();
    fft.process(&mut buffer);
    for (dst, src) in lane.iter_mut().zip(buffer) {
        *dst = src;
    }
}

/// Forward 2D FFT. Matches `numpy.fft.fft2()`.
pub fn fft2(input: &Array2<Complex32>) -> Array2<Complex32> {
    let mut data = input.clone();
    Fft2Plan::new(data.dim()).forward(data.view_mut());
    data
}

/// Inverse 2D FFT. Matches `numpy.fft.ifft2()`.
pub fn ifft2(input: &Array2<Complex32>) -> Array2<Complex32> {
    let mut data = input.clone();
    Fft2Plan::new(data.dim()).inverse(data.view_mut());
    data
}

/// Sample frequencies. Matches `numpy.fft.fftfreq(n, d)`.
pub fn fftfreq(n: usize, d: f64) -> Vec<f64> {
    let scale = 1.0 / (n as f64 * d);
    (0..n).map(|i| fft_index_to_freq(i, n) as f64 * scale).collect()
}

/// Signed frequency index of position `i` in an FFT of length `n`.
pub fn fft_index_to_freq(i: usize, n: usize) -> isize {
    if i < n.div_ceil(2) {
        i as isize
    } else {
        i as isize - n as isize
    }
}

/// Matches `numpy.fft.fftshift` over both axes.
pub fn fftshift2<T: Clone>(input: &Array2<T>) -> Array2<T> {
    let (nx, ny) = input.dim();
    let (sx, sy) = (nx / 2, ny / 2);
    Array2::from_shape_fn((nx, ny), |(i, j)| {
        input[[(i + nx - sx) % nx, (j + ny - sy) % ny]].clone()
    })
}

/// Rescaling applied after a Fourier-space crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FourierScaling {
    /// Pointwise values are preserved.
    Values,
    /// Total intensity (sum of |ψ|²) is preserved.
    Amplitude,
}

impl FourierScaling {
    pub fn factor(self, old_len: usize, new_len: usize) -> f32 {
        let ratio = new_len as f64 / old_len as f64;
        match self {
            FourierScaling::Values => ratio as f32,
            FourierScaling::Amplitude => ratio.sqrt() as f32,
        }
    }
}

/// Crop (or zero-pad) a spectrum in FFT order to `new_shape`, keeping the
/// lowest frequencies.
pub fn fft_crop(spectrum: &Array2<Complex32>, new_shape: (usize, usize)) -> Array2<Complex32> {
    let (nx, ny) = spectrum.dim();
    let source = |i: usize, new_n: usize, old_n: usize| -> Option<usize> {
        let f = fft_index_to_freq(i, new_n);
        let lo = -((old_n / 2) as isize);
        let hi = ((old_n - 1) / 2) as isize;
        (f >= lo && f <= hi).then(|| f.rem_euclid(old_n as isize) as usize)
    };
    let rows: Vec<Option<usize>> = (0..new_shape.0).map(|i| source(i, new_shape.0, nx)).collect();
    let cols: Vec<Option<usize>> = (0..new_shape.1).map(|j| source(j, new_shape.1, ny)).collect();
    Array2::from_shape_fn(new_shape, |(i, j)| match (rows[i], cols[j]) {
        (Some(si), Some(sj)) => spectrum[[si, sj]],
        _ => Complex32::new(0.0, 0.0),
    })
}

/// Resample a real-space array to `new_shape` by cropping its spectrum.
pub fn fft_interpolate(
    array: &Array2<Complex32>,
    new_shape: (usize, usize),
    scaling: FourierScaling,
) -> Array2<Complex32> {
    let old_len = array.len();
    let spectrum = fft2(array);
    let mut out = ifft2(&fft_crop(&spectrum, new_shape));
    let factor = scaling.factor(old_len, new_shape.0 * new_shape.1);
    out.mapv_inplace(|c| c * factor);
    out
}

/// `fft_interpolate` over every slice of a stack, in parallel.
pub fn fft_interpolate_batch(
    array: &Array3<Complex32>,
    new_shape: (usize, usize),
    scaling: FourierScaling,
) -> Array3<Complex32> {
    let (n, nx, ny) = array.dim();
    if (nx, ny) == new_shape {
        return array.clone();
    }
    let forward = Fft2Plan::new((nx, ny));
    let inverse = Fft2Plan::new(new_shape);
    let factor = scaling.factor(nx * ny, new_shape.0 * new_shape.1);
    let mut out = Array3::zeros((n, new_shape.0, new_shape.1));
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(array.axis_iter(Axis(0)).into_par_iter())
        .for_each(|(mut dst, src)| {
            let mut spectrum = src.to_owned();
            forward.forward(spectrum.view_mut());
            let mut cropped = fft_crop(&spectrum, new_shape);
            inverse.inverse(cropped.view_mut());
            cropped.mapv_inplace(|c| c * factor);
            dst.assign(&cropped);
        });
    out
}
