use crate::cell::PeriodicBox;
use crate::config;
use crate::error::OrderError;
use crate::positions::validate_positions;
use crate::search::{self, Bond, CellList};
use nalgebra::Vector3;
use rayon::prelude::*;
use std::f64::consts::PI;
use tracing::{debug, info_span};

/// Cutoffs beyond this multiple of the smallest periodic width are rejected.
pub const MAX_CUTOFF_WIDTH_RATIO: f64 = 2.0;
/// Slack applied to the density-estimated k-NN radius so one shell usually suffices.
const KNN_RADIUS_SLACK: f64 = 1.25;
const PARALLEL_TASKS_PER_THREAD: usize = 64;

/// How neighbors are selected.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NeighborMode {
    /// Every bond no longer than `r_max`. Particles with fewer than
    /// `min_neighbors` bonds are flagged.
    Cutoff { r_max: f64, min_neighbors: usize },
    /// Exactly the `k` closest particles. `search_radius` seeds the grid
    /// spacing; it is estimated from the number density when absent.
    Nearest {
        k: usize,
        search_radius: Option<f64>,
    },
}

impl NeighborMode {
    pub fn cutoff(r_max: f64) -> Self {
        Self::Cutoff {
            r_max,
            min_neighbors: 1,
        }
    }

    pub fn nearest(k: usize) -> Self {
        Self::Nearest {
            k,
            search_radius: None,
        }
    }

    fn validate(&self, cell: &PeriodicBox) -> Result<(), OrderError> {
        match *self {
            Self::Cutoff {
                r_max,
                min_neighbors,
            } => {
                if !r_max.is_finite() || r_max <= 0.0 {
                    return Err(OrderError::InvalidCutoff(r_max));
                }
                if min_neighbors == 0 {
                    return Err(OrderError::ZeroMinNeighbors);
                }
                let limit = MAX_CUTOFF_WIDTH_RATIO * cell.min_periodic_width();
                if r_max > limit {
                    return Err(OrderError::CutoffTooLarge {
                        cutoff: r_max,
                        limit,
                        ratio: MAX_CUTOFF_WIDTH_RATIO,
                    });
                }
            }
            Self::Nearest { k, search_radius } => {
                if k == 0 {
                    return Err(OrderError::ZeroNeighborCount);
                }
                if let Some(r) = search_radius
                    && (!r.is_finite() || r <= 0.0)
                {
                    return Err(OrderError::InvalidSearchRadius(r));
                }
            }
        }
        Ok(())
    }
}

/// Per-particle bonds in compressed row form.
///
/// Rows for flagged particles are empty and `is_valid` reports `false`.
#[derive(Clone, Debug, Default)]
pub struct NeighborList {
    offsets: Vec<usize>,
    neighbors: Vec<usize>,
    displacements: Vec<Vector3<f64>>,
    valid: Vec<bool>,
}

impl NeighborList {
    fn from_rows(rows: Vec<Option<Vec<Bond>>>) -> Self {
        let n_bonds: usize = rows.iter().flatten().map(Vec::len).sum();
        let mut offsets = Vec::with_capacity(rows.len() + 1);
        let mut neighbors = Vec::with_capacity(n_bonds);
        let mut displacements = Vec::with_capacity(n_bonds);
        let mut valid = Vec::with_capacity(rows.len());

        offsets.push(0);
        for row in rows {
            valid.push(row.is_some());
            for (j, disp) in row.into_iter().flatten() {
                neighbors.push(j);
                displacements.push(disp);
            }
            offsets.push(neighbors.len());
        }

        Self {
            offsets,
            neighbors,
            displacements,
            valid,
        }
    }

    pub fn num_particles(&self) -> usize {
        self.valid.len()
    }

    pub fn num_bonds(&self) -> usize {
        self.neighbors.len()
    }

    pub fn neighbors(&self, i: usize) -> &[usize] {
        &self.neighbors[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Bond vectors from `i` to each entry of `neighbors(i)`.
    pub fn displacements(&self, i: usize) -> &[Vector3<f64>] {
        &self.displacements[self.offsets[i]..self.offsets[i + 1]]
    }

    pub fn is_valid(&self, i: usize) -> bool {
        self.valid[i]
    }

    /// Indices of particles that lacked enough neighbors.
    pub fn invalid_indices(&self) -> Vec<usize> {
        self.valid
            .iter()
            .enumerate()
            .filter(|&(_, &ok)| !ok)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Locates neighbors under periodic boundary conditions.
#[derive(Clone, Debug)]
pub struct NeighborFinder {
    cell: PeriodicBox,
    mode: NeighborMode,
}

impl NeighborFinder {
    pub fn new(cell: PeriodicBox, mode: NeighborMode) -> Result<Self, OrderError> {
        mode.validate(&cell)?;
        Ok(Self { cell, mode })
    }

    pub fn mode(&self) -> &NeighborMode {
        &self.mode
    }

    pub fn periodic_box(&self) -> &PeriodicBox {
        &self.cell
    }

    /// Builds the neighbor list for one snapshot.
    pub fn find(&self, positions: &[Vector3<f64>]) -> Result<NeighborList, OrderError> {
        validate_positions(&self.cell, positions)?;
        let _span = info_span!("NeighborFinder::find", n_particles = positions.len()).entered();

        let strategy = if config::use_brute_force(positions.len()) && self.image_safe() {
            Strategy::BruteForce
        } else {
            Strategy::Grid
        };
        let list = self.find_with(positions, strategy);

        let n_invalid = list.valid.iter().filter(|&&ok| !ok).count();
        if n_invalid > 0 {
            debug!(n_invalid, "particles with insufficient neighbors");
        }
        Ok(list)
    }

    /// The O(N^2) scan only sees minimum images, so it is only used when a
    /// bond can never reach a second image.
    fn image_safe(&self) -> bool {
        match self.mode {
            NeighborMode::Cutoff { r_max, .. } => 2.0 * r_max < self.cell.min_periodic_width(),
            NeighborMode::Nearest { .. } => true,
        }
    }

    fn grid_spacing(&self, n_particles: usize) -> f64 {
        match self.mode {
            NeighborMode::Cutoff { r_max, .. } => r_max,
            NeighborMode::Nearest {
                search_radius: Some(r),
                ..
            } => r,
            NeighborMode::Nearest { k, .. } => {
                let density = n_particles.max(1) as f64 / self.cell.volume();
                let radius = if self.cell.is_2d() {
                    (k as f64 / (PI * density)).sqrt()
                } else {
                    (3.0 * k as f64 / (4.0 * PI * density)).cbrt()
                };
                radius * KNN_RADIUS_SLACK
            }
        }
    }

    fn find_with(&self, positions: &[Vector3<f64>], strategy: Strategy) -> NeighborList {
        let n_particles = positions.len();
        let grid = match strategy {
            Strategy::Grid => Some(CellList::build(
                &self.cell,
                positions,
                self.grid_spacing(n_particles),
            )),
            Strategy::BruteForce => None,
        };

        let search_row = |candidates: &mut Vec<(f64, usize, Vector3<f64>)>, i: usize| {
            let mut bonds = Vec::new();
            let ok = match (self.mode, &grid) {
                (
                    NeighborMode::Cutoff {
                        r_max,
                        min_neighbors,
                    },
                    grid,
                ) => {
                    match grid {
                        Some(cl) => cl.bonds_within(&self.cell, i, r_max, &mut bonds),
                        None => {
                            search::brute_force_within(&self.cell, positions, i, r_max, &mut bonds)
                        }
                    }
                    bonds.len() >= min_neighbors
                }
                (NeighborMode::Nearest { k, .. }, Some(cl)) => {
                    cl.nearest(&self.cell, positions, i, k, candidates, &mut bonds)
                }
                (NeighborMode::Nearest { k, .. }, None) => search::brute_force_nearest(
                    &self.cell,
                    positions,
                    i,
                    k,
                    candidates,
                    &mut bonds,
                ),
            };
            ok.then_some(bonds)
        };

        let rows: Vec<Option<Vec<Bond>>> = if config::use_parallel(n_particles) {
            let _s = info_span!("par_neighbor_search").entered();
            let num_threads = rayon::current_num_threads();
            let min_len = (n_particles / (num_threads * PARALLEL_TASKS_PER_THREAD)).max(1);
            (0..n_particles)
                .into_par_iter()
                .with_min_len(min_len)
                .map_init(Vec::new, search_row)
                .collect()
        } else {
            let _s = info_span!("neighbor_search").entered();
            let mut candidates = Vec::new();
            (0..n_particles)
                .map(|i| search_row(&mut candidates, i))
                .collect()
        };

        NeighborList::from_rows(rows)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    BruteForce,
    Grid,
}
