use crate::config;
use crate::harmonics::{self, SphericalHarmonics};
use crate::neighbors::NeighborList;
use nalgebra::Vector3;
use num_complex::Complex64;
use rayon::prelude::*;
use std::f64::consts::PI;
use tracing::info_span;

/// Bonds shorter than this (squared) join coincident particles and carry no direction.
const MIN_BOND_LENGTH_SQ: f64 = 1e-24;

const ZERO: Complex64 = Complex64::new(0.0, 0.0);

/// Averages `Y_l^m` over the bond vectors `displacements` into `out`.
///
/// Returns `false`, leaving `out` zeroed, when no bond has a direction.
pub fn accumulate(
    basis: &SphericalHarmonics,
    displacements: &[Vector3<f64>],
    out: &mut [Complex64],
    scratch: &mut [Complex64],
) -> bool {
    out.fill(ZERO);
    let mut n_bonds = 0usize;
    for disp in displacements {
        if disp.norm_squared() < MIN_BOND_LENGTH_SQ {
            continue;
        }
        basis.accumulate(disp, out, scratch);
        n_bonds += 1;
    }
    if n_bonds == 0 {
        return false;
    }
    let inv = 1.0 / n_bonds as f64;
    for q in out.iter_mut() {
        *q *= inv;
    }
    true
}

/// Per-particle q_lm rows of width `2l + 1`, index `k ↦ m = k - l`.
///
/// Each row carries a validity tag; rows of flagged particles are zero and
/// never read.
#[derive(Clone, Debug)]
pub struct QlmTable {
    width: usize,
    values: Vec<Complex64>,
    valid: Vec<bool>,
}

impl QlmTable {
    /// Computes q_lm for every particle from its bonds.
    pub fn from_neighbors(basis: &SphericalHarmonics, neighbors: &NeighborList) -> Self {
        let n_particles = neighbors.num_particles();
        let _span = info_span!("QlmTable::from_neighbors", n_particles).entered();
        let width = basis.width();
        let mut values = vec![ZERO; n_particles * width];
        let mut valid = vec![false; n_particles];

        let fill_row = |scratch: &mut Vec<Complex64>, (i, (row, ok)): (usize, (&mut [Complex64], &mut bool))| {
            *ok = neighbors.is_valid(i)
                && accumulate(basis, neighbors.displacements(i), row, scratch);
        };

        if config::use_parallel(n_particles) {
            values
                .par_chunks_mut(width)
                .zip(valid.par_iter_mut())
                .enumerate()
                .for_each_init(|| vec![ZERO; width], fill_row);
        } else {
            let mut scratch = vec![ZERO; width];
            values
                .chunks_mut(width)
                .zip(valid.iter_mut())
                .enumerate()
                .for_each(|item| fill_row(&mut scratch, item));
        }

        Self {
            width,
            values,
            valid,
        }
    }

    /// Second-shell smoothing: each valid row becomes the mean of itself and
    /// the rows of its valid neighbors.
    pub fn neighbor_averaged(&self, neighbors: &NeighborList) -> Self {
        let n_particles = self.num_particles();
        let _span = info_span!("QlmTable::neighbor_averaged", n_particles).entered();
        let width = self.width;
        let mut values = vec![ZERO; n_particles * width];
        let valid = self.valid.clone();

        let average_row = |(i, row): (usize, &mut [Complex64])| {
            let Some(own) = self.row(i) else {
                return;
            };
            row.copy_from_slice(own);
            let mut count = 1usize;
            for &j in neighbors.neighbors(i) {
                if let Some(other) = self.row(j) {
                    for (acc, q) in row.iter_mut().zip(other) {
                        *acc += *q;
                    }
                    count += 1;
                }
            }
            let inv = 1.0 / count as f64;
            for q in row.iter_mut() {
                *q *= inv;
            }
        };

        if config::use_parallel(n_particles) {
            values
                .par_chunks_mut(width)
                .enumerate()
                .for_each(average_row);
        } else {
            values.chunks_mut(width).enumerate().for_each(average_row);
        }

        Self {
            width,
            values,
            valid,
        }
    }

    pub fn num_particles(&self) -> usize {
        self.valid.len()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn is_valid(&self, i: usize) -> bool {
        self.valid[i]
    }

    pub fn row(&self, i: usize) -> Option<&[Complex64]> {
        self.valid[i].then(|| &self.values[i * self.width..(i + 1) * self.width])
    }

    /// Indices of rows without a value.
    pub fn invalid_indices(&self) -> Vec<usize> {
        self.valid
            .iter()
            .enumerate()
            .filter(|&(_, &ok)| !ok)
            .map(|(i, _)| i)
            .collect()
    }

    /// Mean over valid rows, or `None` if there are none.
    pub fn mean(&self) -> Option<Vec<Complex64>> {
        let mut sum = vec![ZERO; self.width];
        let mut count = 0usize;
        for i in 0..self.num_particles() {
            if let Some(row) = self.row(i) {
                for (acc, q) in sum.iter_mut().zip(row) {
                    *acc += *q;
                }
                count += 1;
            }
        }
        (count > 0).then(|| {
            let inv = 1.0 / count as f64;
            sum.into_iter().map(|q| q * inv).collect()
        })
    }

    /// Rotation-invariant Ql of each row, NaN for invalid rows.
    pub fn invariants(&self) -> Vec<f64> {
        (0..self.num_particles())
            .map(|i| self.row(i).map_or(f64::NAN, harmonics::invariant))
            .collect()
    }

    /// Projection of each row onto `reference`, scaled like Ql:
    /// `sqrt(4π/(2l+1)) Re(Σ_m q_lm conj(r_lm)) / |r|`. NaN for invalid
    /// rows, zero for every valid row when `reference` vanishes.
    pub fn projections(&self, reference: &[Complex64]) -> Vec<f64> {
        debug_assert_eq!(reference.len(), self.width);
        let ref_norm = reference.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
        let scale = (4.0 * PI / self.width as f64).sqrt();
        (0..self.num_particles())
            .map(|i| match self.row(i) {
                None => f64::NAN,
                Some(_) if ref_norm == 0.0 => 0.0,
                Some(row) => {
                    let overlap: f64 = row
                        .iter()
                        .zip(reference)
                        .map(|(q, r)| (q * r.conj()).re)
                        .sum();
                    scale * overlap / ref_norm
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::PeriodicBox;
    use crate::neighbors::{NeighborFinder, NeighborMode};
    use approx::assert_relative_eq;

    fn octahedron() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(-1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, -1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.0, 0.0, -1.0),
        ]
    }

    #[test]
    fn test_accumulate_order_independent() {
        let basis = SphericalHarmonics::new(4);
        let mut bonds = octahedron();
        bonds.push(Vector3::new(0.3, -0.4, 0.8));

        let mut a = vec![ZERO; basis.width()];
        let mut b = vec![ZERO; basis.width()];
        let mut scratch = vec![ZERO; basis.width()];
        assert!(accumulate(&basis, &bonds, &mut a, &mut scratch));
        bonds.reverse();
        assert!(accumulate(&basis, &bonds, &mut b, &mut scratch));

        for (x, y) in a.iter().zip(&b) {
            assert_relative_eq!(x.re, y.re, epsilon = 1e-12);
            assert_relative_eq!(x.im, y.im, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_simple_cubic_q4_q6() {
        // Octahedral shell: Q4 = sqrt(7/12), Q6 = sqrt(13/32)
        let mut scratch = vec![ZERO; 13];
        let mut out = vec![ZERO; 9];
        let basis4 = SphericalHarmonics::new(4);
        assert!(accumulate(&basis4, &octahedron(), &mut out, &mut scratch[..9]));
        assert_relative_eq!(harmonics::invariant(&out), (7.0f64 / 12.0).sqrt(), epsilon = 1e-12);

        let mut out = vec![ZERO; 13];
        let basis6 = SphericalHarmonics::new(6);
        assert!(accumulate(&basis6, &octahedron(), &mut out, &mut scratch));
        assert_relative_eq!(harmonics::invariant(&out), (13.0f64 / 32.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_accumulate_skips_zero_bonds() {
        let basis = SphericalHarmonics::new(2);
        let mut out = vec![ZERO; 5];
        let mut scratch = vec![ZERO; 5];
        assert!(!accumulate(&basis, &[Vector3::zeros()], &mut out, &mut scratch));
        assert!(out.iter().all(|q| *q == ZERO));

        let bonds = [Vector3::zeros(), Vector3::new(0.0, 0.0, 2.0)];
        assert!(accumulate(&basis, &bonds, &mut out, &mut scratch));
        assert_relative_eq!(harmonics::invariant(&out), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_table_average_and_projection() {
        let cell = PeriodicBox::cube(4.0).unwrap();
        let positions: Vec<Vector3<f64>> = (0..4)
            .flat_map(|i| {
                (0..4).flat_map(move |j| {
                    (0..4).map(move |k| Vector3::new(i as f64, j as f64, k as f64))
                })
            })
            .collect();
        let neighbors = NeighborFinder::new(cell, NeighborMode::cutoff(1.1))
            .unwrap()
            .find(&positions)
            .unwrap();
        let basis = SphericalHarmonics::new(6);
        let table = QlmTable::from_neighbors(&basis, &neighbors);

        let ql = table.invariants();
        let expected = (13.0f64 / 32.0).sqrt();
        for q in &ql {
            assert_relative_eq!(*q, expected, epsilon = 1e-9);
        }

        // Identical environments: averaging and projection leave Ql unchanged
        let averaged = table.neighbor_averaged(&neighbors);
        for q in averaged.invariants() {
            assert_relative_eq!(q, expected, epsilon = 1e-9);
        }
        let mean = table.mean().unwrap();
        for q in table.projections(&mean) {
            assert_relative_eq!(q, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_projection_edge_cases() {
        let basis = SphericalHarmonics::new(2);
        let positions = vec![
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(1.0, 1.0, 2.0),
            Vector3::new(8.0, 8.0, 8.0),
        ];
        let neighbors = NeighborFinder::new(PeriodicBox::cube(10.0).unwrap(), NeighborMode::cutoff(1.5))
            .unwrap()
            .find(&positions)
            .unwrap();
        let table = QlmTable::from_neighbors(&basis, &neighbors);
        assert_eq!(table.invalid_indices(), vec![2]);
        assert!(table.row(2).is_none());

        let zeros = vec![ZERO; 5];
        let proj = table.projections(&zeros);
        assert_eq!(proj[0], 0.0);
        assert_eq!(proj[1], 0.0);
        assert!(proj[2].is_nan());

        // Particles 0 and 1 bond along ±z, which share the same even-l pattern
        let mean = table.mean().unwrap();
        let proj = table.projections(&mean);
        assert_relative_eq!(proj[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(proj[1], 1.0, epsilon = 1e-12);

        let averaged = table.neighbor_averaged(&neighbors);
        assert!(!averaged.is_valid(2));
        assert!(averaged.invariants()[2].is_nan());
    }
}
