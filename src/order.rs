//! Local Steinhardt order parameters.
//!
//! [`LocalQl`] locates each particle's neighbors, averages the spherical
//! harmonics of its bonds into a q_lm row and reduces the rows into one of
//! four per-particle scalars:
//!
//! * `Ql`: the rotation invariant of the particle's own q_lm.
//! * `ave_Ql`: the invariant after averaging q_lm over the particle and its
//!   valid neighbors.
//! * `norm_Ql`: the projection of q_lm onto the system-wide mean q_lm.
//! * `ave_norm_Ql`: the projection of the averaged q_lm onto their mean.
//!
//! Particles without a usable neighborhood are NaN in every output and are
//! listed by [`LocalQl::insufficient_neighbors`].

use crate::cell::PeriodicBox;
use crate::error::OrderError;
use crate::harmonics::SphericalHarmonics;
use crate::neighbors::{NeighborFinder, NeighborList, NeighborMode};
use crate::positions::points_from_flat;
use crate::qlm::QlmTable;
use nalgebra::Vector3;
use num_complex::Complex64;
use tracing::{debug, info_span, warn};

#[derive(Clone, Debug)]
pub struct LocalQl {
    finder: NeighborFinder,
    basis: SphericalHarmonics,
    n_particles: usize,
    neighbors: NeighborList,
    qlm: Option<QlmTable>,
    ql: Option<Vec<f64>>,
    ave_ql: Option<Vec<f64>>,
    norm_ql: Option<Vec<f64>>,
    ave_norm_ql: Option<Vec<f64>>,
}

impl LocalQl {
    pub fn new(cell: PeriodicBox, mode: NeighborMode, degree: usize) -> Result<Self, OrderError> {
        let finder = NeighborFinder::new(cell, mode)?;
        Ok(Self {
            finder,
            basis: SphericalHarmonics::new(degree),
            n_particles: 0,
            neighbors: NeighborList::default(),
            qlm: None,
            ql: None,
            ave_ql: None,
            norm_ql: None,
            ave_norm_ql: None,
        })
    }

    /// Neighbors are every particle within `r_max`.
    pub fn cutoff(cell: PeriodicBox, r_max: f64, degree: usize) -> Result<Self, OrderError> {
        Self::new(cell, NeighborMode::cutoff(r_max), degree)
    }

    /// Neighbors are the `k` closest particles.
    pub fn nearest(cell: PeriodicBox, k: usize, degree: usize) -> Result<Self, OrderError> {
        Self::new(cell, NeighborMode::nearest(k), degree)
    }

    pub fn degree(&self) -> usize {
        self.basis.degree()
    }

    pub fn neighbor_mode(&self) -> &NeighborMode {
        self.finder.mode()
    }

    pub fn periodic_box(&self) -> &PeriodicBox {
        self.finder.periodic_box()
    }

    /// Particle count of the last successful compute call.
    pub fn num_particles(&self) -> usize {
        self.n_particles
    }

    /// `Ql` from the last [`compute`](Self::compute) call.
    ///
    /// Each variant keeps its own output. A compute call with a different
    /// particle count drops the outputs of the other variants, so every
    /// `Some` result has [`num_particles`](Self::num_particles) entries.
    pub fn ql(&self) -> Option<&[f64]> {
        self.ql.as_deref()
    }

    pub fn ave_ql(&self) -> Option<&[f64]> {
        self.ave_ql.as_deref()
    }

    pub fn norm_ql(&self) -> Option<&[f64]> {
        self.norm_ql.as_deref()
    }

    pub fn ave_norm_ql(&self) -> Option<&[f64]> {
        self.ave_norm_ql.as_deref()
    }

    /// Neighbor list of the last successful compute call.
    pub fn neighbor_list(&self) -> &NeighborList {
        &self.neighbors
    }

    /// q_lm row of particle `i` from the last compute call, index `k ↦ m = k - l`.
    ///
    /// `None` before any compute call, for out-of-range indices and for
    /// particles without a usable neighborhood.
    pub fn qlm(&self, i: usize) -> Option<&[Complex64]> {
        let table = self.qlm.as_ref()?;
        if i >= table.num_particles() {
            return None;
        }
        table.row(i)
    }

    /// Particles whose outputs are NaN in the last compute call.
    pub fn insufficient_neighbors(&self) -> Vec<usize> {
        self.qlm
            .as_ref()
            .map(QlmTable::invalid_indices)
            .unwrap_or_default()
    }

    pub fn compute(&mut self, positions: &[Vector3<f64>]) -> Result<&[f64], OrderError> {
        let _span = info_span!("LocalQl::compute", n_particles = positions.len()).entered();
        let (neighbors, table) = self.prepare(positions)?;
        let values = table.invariants();
        self.store(neighbors, table);
        Ok(self.ql.insert(values).as_slice())
    }

    pub fn compute_ave(&mut self, positions: &[Vector3<f64>]) -> Result<&[f64], OrderError> {
        let _span = info_span!("LocalQl::compute_ave", n_particles = positions.len()).entered();
        let (neighbors, table) = self.prepare(positions)?;
        let values = table.neighbor_averaged(&neighbors).invariants();
        self.store(neighbors, table);
        Ok(self.ave_ql.insert(values).as_slice())
    }

    pub fn compute_norm(&mut self, positions: &[Vector3<f64>]) -> Result<&[f64], OrderError> {
        let _span = info_span!("LocalQl::compute_norm", n_particles = positions.len()).entered();
        let (neighbors, table) = self.prepare(positions)?;
        let values = normalized(&table);
        self.store(neighbors, table);
        Ok(self.norm_ql.insert(values).as_slice())
    }

    pub fn compute_ave_norm(&mut self, positions: &[Vector3<f64>]) -> Result<&[f64], OrderError> {
        let _span =
            info_span!("LocalQl::compute_ave_norm", n_particles = positions.len()).entered();
        let (neighbors, table) = self.prepare(positions)?;
        let values = normalized(&table.neighbor_averaged(&neighbors));
        self.store(neighbors, table);
        Ok(self.ave_norm_ql.insert(values).as_slice())
    }

    /// [`compute`](Self::compute) on a row-major `N x dim` buffer.
    pub fn compute_flat(&mut self, coords: &[f64], dim: usize) -> Result<&[f64], OrderError> {
        let positions = points_from_flat(coords, dim)?;
        self.compute(&positions)
    }

    pub fn compute_ave_flat(&mut self, coords: &[f64], dim: usize) -> Result<&[f64], OrderError> {
        let positions = points_from_flat(coords, dim)?;
        self.compute_ave(&positions)
    }

    pub fn compute_norm_flat(&mut self, coords: &[f64], dim: usize) -> Result<&[f64], OrderError> {
        let positions = points_from_flat(coords, dim)?;
        self.compute_norm(&positions)
    }

    pub fn compute_ave_norm_flat(
        &mut self,
        coords: &[f64],
        dim: usize,
    ) -> Result<&[f64], OrderError> {
        let positions = points_from_flat(coords, dim)?;
        self.compute_ave_norm(&positions)
    }

    /// Neighbors and q_lm rows of one snapshot. Fails before anything is
    /// stored when the positions are rejected.
    fn prepare(&self, positions: &[Vector3<f64>]) -> Result<(NeighborList, QlmTable), OrderError> {
        let neighbors = self.finder.find(positions)?;
        let table = QlmTable::from_neighbors(&self.basis, &neighbors);
        Ok((neighbors, table))
    }

    fn store(&mut self, neighbors: NeighborList, table: QlmTable) {
        let n_invalid = table.invalid_indices().len();
        if n_invalid > 0 {
            debug!(
                n_invalid,
                n_particles = table.num_particles(),
                "particles without a usable neighborhood are reported as NaN"
            );
        }
        if table.num_particles() != self.n_particles {
            // Results sized for an earlier snapshot cannot line up with this one
            self.ql = None;
            self.ave_ql = None;
            self.norm_ql = None;
            self.ave_norm_ql = None;
        }
        self.n_particles = table.num_particles();
        self.neighbors = neighbors;
        self.qlm = Some(table);
    }
}

/// Projects every row of `table` onto the mean over its valid rows.
fn normalized(table: &QlmTable) -> Vec<f64> {
    match table.mean() {
        Some(mean) => {
            if mean.iter().all(|q| q.norm_sqr() == 0.0) {
                warn!("global mean q_lm vanishes; normalized order parameters are zero");
            }
            table.projections(&mean)
        }
        None => vec![f64::NAN; table.num_particles()],
    }
}
