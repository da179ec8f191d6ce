// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Ring Interpolation
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Interpolation on concentric rings of sample points.
//!
//! A `RingLayout` is a centre point followed by rings of increasing radius;
//! ring `i` (1-based) carries `i * points_per_ring` points starting at angle
//! π/2. Weights are linear in angle on each ring and linear in radius between
//! the two bracketing rings, so they are non-negative, sum to one and
//! reproduce the sample values exactly at the nodes.

use std::f64::consts::{FRAC_PI_2, PI};

/// Sparse interpolation weights: (node index, weight).
pub type Weights = Vec<(usize, f64)>;

#[derive(Debug, Clone, PartialEq)]
pub struct RingLayout {
    /// Radius per ring, the centre (radius 0) first.
    radii: Vec<f64>,
    /// Points per ring, the centre (1 point) first.
    counts: Vec<usize>,
    /// Index of the first node of each ring.
    offsets: Vec<usize>,
}

impl RingLayout {
    /// Centre plus `num_rings - 1` rings evenly spaced up to `outer_radius`.
    ///
    /// Requires `num_rings >= 2` and `points_per_ring >= 1`.
    pub fn new(num_rings: usize, points_per_ring: usize, outer_radius: f64) -> Self {
        let rings = num_rings.saturating_sub(1);
        let mut radii = vec![0.0];
        let mut counts = vec![1];
        for i in 1..=rings {
            // linspace(outer/rings, outer, rings)
            let r = if rings == 1 {
                outer_radius
            } else {
                let start = outer_radius / rings as f64;
                start + (outer_radius - start) * (i - 1) as f64 / (rings - 1) as f64
            };
            radii.push(r);
            counts.push(i * points_per_ring);
        }
        let mut offsets = Vec::with_capacity(counts.len());
        let mut acc = 0;
        for &n in &counts {
            offsets.push(acc);
            acc += n;
        }
        RingLayout {
            radii,
            counts,
            offsets,
        }
    }

    pub fn len(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn outer_radius(&self) -> f64 {
        self.radii.last().copied().unwrap_or(0.0)
    }

    /// Node coordinates in layout order.
    pub fn points(&self) -> Vec<(f64, f64)> {
        let mut points = Vec::with_capacity(self.len());
        for (&r, &n) in self.radii.iter().zip(&self.counts) {
            for j in 0..n {
                let angle = 2.0 * PI * j as f64 / n as f64 + FRAC_PI_2;
                points.push((r * angle.cos(), r * angle.sin()));
            }
        }
        points
    }

    fn ring_weights(&self, ring: usize, phi: f64, scale: f64, out: &mut Weights) {
        let n = self.counts[ring];
        let offset = self.offsets[ring];
        if n == 1 {
            out.push((offset, scale));
            return;
        }
        let step = 2.0 * PI / n as f64;
        let u = (phi - FRAC_PI_2).rem_euclid(2.0 * PI) / step;
        let j0 = (u.floor() as usize) % n;
        let frac = u - u.floor();
        let j1 = (j0 + 1) % n;
        out.push((offset + j0, scale * (1.0 - frac)));
        out.push((offset + j1, scale * frac));
    }

    /// Weights for the point `(kx, ky)`. Points beyond the outer ring are
    /// projected radially onto it.
    pub fn weights(&self, kx: f64, ky: f64) -> Weights {
        let mut out = Weights::with_capacity(4);
        let r = kx.hypot(ky);
        let phi = ky.atan2(kx);
        let last = self.radii.len() - 1;
        if last == 0 {
            out.push((0, 1.0));
            return out;
        }
        if r >= self.radii[last] {
            self.ring_weights(last, phi, 1.0, &mut out);
            return out;
        }
        let outer = self.radii.partition_point(|&radius| radius <= r).max(1);
        let inner = outer - 1;
        let t = (r - self.radii[inner]) / (self.radii[outer] - self.radii[inner]);
        self.ring_weights(inner, phi, 1.0 - t, &mut out);
        self.ring_weights(outer, phi, t, &mut out);
        out.retain(|&(_, w)| w != 0.0);
        out
    }

    /// Weights for many points.
    pub fn weights_many(&self, points: &[(f64, f64)]) -> Vec<Weights> {
        points.iter().map(|&(kx, ky)| self.weights(kx, ky)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_counts() {
        let layout = RingLayout::new(4, 6, 1.0);
        assert_eq!(layout.len(), 1 + 6 + 12 + 18);
        let points = layout.points();
        assert_eq!(points.len(), layout.len());
        assert_eq!(points[0], (0.0, 0.0));
        // First ring point sits at +π/2.
        assert!(points[1].0.abs() < 1e-12);
        assert!((points[1].1 - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_two_rings_is_centre_plus_outer() {
        let layout = RingLayout::new(2, 6, 0.5);
        assert_eq!(layout.len(), 7);
        assert!((layout.outer_radius() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_weights_reproduce_nodes() {
        let layout = RingLayout::new(3, 6, 2.0);
        for (idx, &(x, y)) in layout.points().iter().enumerate() {
            let w = layout.weights(x, y);
            let at_node: f64 = w.iter().filter(|(i, _)| *i == idx).map(|(_, w)| w).sum();
            assert!((at_node - 1.0).abs() < 1e-9, "node {idx}: {w:?}");
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let layout = RingLayout::new(5, 6, 1.0);
        for &(x, y) in &[(0.1, 0.2), (-0.7, 0.3), (0.0, -0.99), (3.0, 3.0)] {
            let total: f64 = layout.weights(x, y).iter().map(|(_, w)| w).sum();
            assert!((total - 1.0).abs() < 1e-12, "sum {total} at ({x},{y})");
        }
    }

    #[test]
    fn test_centre_weight_dominates_near_origin() {
        let layout = RingLayout::new(3, 6, 1.0);
        let w = layout.weights(1e-6, 0.0);
        let centre: f64 = w.iter().filter(|(i, _)| *i == 0).map(|(_, w)| w).sum();
        assert!(centre > 0.99);
    }
}
