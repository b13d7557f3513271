//! k-atic bond-orientational order in the xy plane.
//!
//! For each particle `i` with `k` nearest neighbors,
//! `ψ_k(i) = (1/k) Σ_j exp(i k θ_ij)`, where `θ_ij` is the angle of the
//! minimum-image bond `r_j - r_i` projected onto the xy plane. With `k = 6`
//! this is the hexatic order parameter, and a perfect triangular lattice
//! gives `|ψ_6| = 1` everywhere.

use crate::cell::PeriodicBox;
use crate::config;
use crate::error::OrderError;
use crate::neighbors::{NeighborFinder, NeighborList, NeighborMode};
use crate::positions::points_from_flat;
use nalgebra::Vector3;
use num_complex::Complex64;
use rayon::prelude::*;
use tracing::{debug, info_span};

/// Bonds shorter than this (squared) have no usable in-plane angle. They are
/// dropped from the sum but still count towards the `1/k` prefactor.
const MIN_PLANAR_BOND_SQ: f64 = 1e-6;

pub const DEFAULT_SYMMETRY: usize = 6;

#[derive(Clone, Debug)]
pub struct HexOrder {
    finder: NeighborFinder,
    k: usize,
    neighbors: NeighborList,
    psi: Option<Vec<Complex64>>,
}

impl HexOrder {
    /// `k`-fold order over the `k` nearest neighbors of each particle.
    pub fn new(cell: PeriodicBox, k: usize) -> Result<Self, OrderError> {
        Self::build(cell, NeighborMode::nearest(k), k)
    }

    /// Like [`new`](Self::new), with `search_radius` seeding the neighbor grid.
    pub fn with_search_radius(
        cell: PeriodicBox,
        search_radius: f64,
        k: usize,
    ) -> Result<Self, OrderError> {
        let mode = NeighborMode::Nearest {
            k,
            search_radius: Some(search_radius),
        };
        Self::build(cell, mode, k)
    }

    fn build(cell: PeriodicBox, mode: NeighborMode, k: usize) -> Result<Self, OrderError> {
        Ok(Self {
            finder: NeighborFinder::new(cell, mode)?,
            k,
            neighbors: NeighborList::default(),
            psi: None,
        })
    }

    /// Symmetry order, also the neighbor count.
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn periodic_box(&self) -> &PeriodicBox {
        self.finder.periodic_box()
    }

    pub fn num_particles(&self) -> usize {
        self.neighbors.num_particles()
    }

    /// `ψ_k` per particle from the last compute call; NaN for particles
    /// with fewer than `k` neighbors.
    pub fn psi(&self) -> Option<&[Complex64]> {
        self.psi.as_deref()
    }

    pub fn insufficient_neighbors(&self) -> Vec<usize> {
        self.neighbors.invalid_indices()
    }

    pub fn compute(&mut self, positions: &[Vector3<f64>]) -> Result<&[Complex64], OrderError> {
        let n_particles = positions.len();
        let _span = info_span!("HexOrder::compute", n_particles, k = self.k).entered();
        let neighbors = self.finder.find(positions)?;

        let k = self.k as f64;
        let psi_of = |i: usize| -> Complex64 {
            if !neighbors.is_valid(i) {
                return Complex64::new(f64::NAN, f64::NAN);
            }
            let sum: Complex64 = neighbors
                .displacements(i)
                .iter()
                .filter(|d| d.x * d.x + d.y * d.y > MIN_PLANAR_BOND_SQ)
                .map(|d| Complex64::from_polar(1.0, k * d.y.atan2(d.x)))
                .sum();
            sum / k
        };

        let psi: Vec<Complex64> = if config::use_parallel(n_particles) {
            (0..n_particles).into_par_iter().map(psi_of).collect()
        } else {
            (0..n_particles).map(psi_of).collect()
        };

        let n_invalid = neighbors.invalid_indices().len();
        if n_invalid > 0 {
            debug!(n_invalid, n_particles, "particles with fewer than k neighbors are NaN");
        }
        self.neighbors = neighbors;
        Ok(self.psi.insert(psi).as_slice())
    }

    /// [`compute`](Self::compute) on a row-major `N x dim` buffer.
    pub fn compute_flat(&mut self, coords: &[f64], dim: usize) -> Result<&[Complex64], OrderError> {
        let positions = points_from_flat(coords, dim)?;
        self.compute(&positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    /// Triangular lattice with unit spacing, `nx` by `ny` sites, `ny` even.
    fn triangular(nx: usize, ny: usize) -> (PeriodicBox, Vec<Vector3<f64>>) {
        let row = 3f64.sqrt() / 2.0;
        let positions = (0..ny)
            .flat_map(|j| {
                (0..nx).map(move |i| {
                    let shift = if j % 2 == 0 { 0.0 } else { 0.5 };
                    Vector3::new(i as f64 + shift, j as f64 * row, 0.0)
                })
            })
            .collect();
        let cell = PeriodicBox::rectangle(nx as f64, ny as f64 * row).unwrap();
        (cell, positions)
    }

    #[test]
    fn test_triangular_lattice_is_perfectly_hexatic() {
        let (cell, positions) = triangular(8, 8);
        let mut hex = HexOrder::new(cell, DEFAULT_SYMMETRY).unwrap();
        let psi = hex.compute(&positions).unwrap();
        assert_eq!(psi.len(), 64);
        for p in psi {
            assert_relative_eq!(p.norm(), 1.0, epsilon = 1e-9);
            // Bonds lie at multiples of 60 degrees from x
            assert_relative_eq!(p.re, 1.0, epsilon = 1e-9);
        }
        assert!(hex.insufficient_neighbors().is_empty());
    }

    #[test]
    fn test_large_triangular_lattice_uses_grid() {
        let (cell, positions) = triangular(40, 40);
        let mut hex = HexOrder::with_search_radius(cell, 1.0, 6).unwrap();
        let psi = hex.compute(&positions).unwrap();
        assert_eq!(psi.len(), 1600);
        for p in psi {
            assert_relative_eq!(p.norm(), 1.0, epsilon = 1e-9);
        }
        assert_eq!(hex.num_particles(), 1600);
    }

    #[test]
    fn test_square_lattice_fourfold() {
        let n = 6;
        let coords: Vec<f64> = (0..n * n)
            .flat_map(|idx| [(idx / n) as f64, (idx % n) as f64])
            .collect();
        let mut hex = HexOrder::new(PeriodicBox::square(n as f64).unwrap(), 4).unwrap();
        let psi = hex.compute_flat(&coords, 2).unwrap();
        for p in psi {
            assert_relative_eq!(p.re, 1.0, epsilon = 1e-9);
            assert_relative_eq!(p.im, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_rotated_bonds_pick_up_phase() {
        // A lone particle at the center of a rotated hexagon
        let angle = 0.1;
        let mut positions = vec![Vector3::new(5.0, 5.0, 0.0)];
        for n in 0..6 {
            let theta = angle + n as f64 * PI / 3.0;
            positions.push(Vector3::new(5.0 + theta.cos(), 5.0 + theta.sin(), 0.0));
        }
        let mut hex = HexOrder::new(PeriodicBox::square(10.0).unwrap(), 6).unwrap();
        let psi = hex.compute(&positions).unwrap();
        let expected = Complex64::from_polar(1.0, 6.0 * angle);
        assert_relative_eq!(psi[0].re, expected.re, epsilon = 1e-12);
        assert_relative_eq!(psi[0].im, expected.im, epsilon = 1e-12);
    }

    #[test]
    fn test_too_few_particles_is_nan() {
        let positions = vec![
            Vector3::new(1.0, 1.0, 0.0),
            Vector3::new(2.0, 1.0, 0.0),
            Vector3::new(1.0, 2.0, 0.0),
        ];
        let mut hex = HexOrder::new(PeriodicBox::square(10.0).unwrap(), 6).unwrap();
        assert!(hex.psi().is_none());
        let psi = hex.compute(&positions).unwrap();
        assert!(psi.iter().all(|p| p.re.is_nan() && p.im.is_nan()));
        assert_eq!(hex.insufficient_neighbors(), vec![0, 1, 2]);
    }

    #[test]
    fn test_coincident_neighbor_still_divides_by_k() {
        // Two bonds: one real, one to a coincident copy
        let positions = vec![
            Vector3::new(3.0, 3.0, 0.0),
            Vector3::new(3.0, 3.0, 0.0),
            Vector3::new(4.0, 3.0, 0.0),
        ];
        let mut hex = HexOrder::new(PeriodicBox::square(20.0).unwrap(), 2).unwrap();
        let psi = hex.compute(&positions).unwrap();
        assert_relative_eq!(psi[0].re, 0.5, epsilon = 1e-12);
        assert_relative_eq!(psi[0].im, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_configuration_errors() {
        let cell = PeriodicBox::square(10.0).unwrap();
        assert_eq!(
            HexOrder::new(cell.clone(), 0).unwrap_err(),
            OrderError::ZeroNeighborCount
        );
        assert_eq!(
            HexOrder::with_search_radius(cell, -1.0, 6).unwrap_err(),
            OrderError::InvalidSearchRadius(-1.0)
        );
    }
}
