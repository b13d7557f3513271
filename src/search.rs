use crate::cell::PeriodicBox;
use nalgebra::Vector3;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::ops::Range;
use tracing::info_span;

// Internal tuning parameters
const Z_ORDER_BITS: u32 = 21;
const Z_ORDER_CLAMP_MAX: f64 = 0.999999;
/// Upper bound on bins per particle before the grid is coarsened.
const MAX_BINS_PER_PARTICLE: usize = 4;
const MIN_BIN_BUDGET: usize = 64;
/// Relative slack under the squared covered radius in the k-NN stop test.
const COVERED_RADIUS_SQ_MARGIN: f64 = 1.0 - 1e-9;

/// A bond from particle `i` to an image of particle `j`.
pub type Bond = (usize, Vector3<f64>);

/// Uniform spatial grid over a periodic box.
///
/// Built once per query batch and only read afterwards. Particles are stored
/// bin by bin, with bins laid out in Morton order so that spatially close
/// bins are also close in memory.
pub struct CellList {
    /// particles[sorted_idx] = original_idx
    particles: Vec<usize>,
    /// sorted_of[original_idx] = sorted_idx
    sorted_of: Vec<usize>,
    /// cell_starts[bin_rank] = start index in particles
    cell_starts: Vec<usize>,
    /// Maps linear bin index (bx + nx*(by + ny*bz)) to Morton rank
    bin_ranks: Vec<usize>,
    /// Positions mapped into the primary image, in sorted order.
    pos_wrapped: Vec<Vector3<f64>>,
    /// Bin coordinates in sorted order.
    bins: Vec<Vector3<usize>>,
    num_bins: Vector3<usize>,
    /// Perpendicular extent of one bin along each axis.
    bin_widths: Vector3<f64>,
    pbc: Vector3<bool>,
}

impl CellList {
    /// Builds a grid whose bins are at least `bin_size` wide where the box allows.
    pub fn build(cell: &PeriodicBox, positions: &[Vector3<f64>], bin_size: f64) -> Self {
        let _span = info_span!("CellList::build", n_particles = positions.len()).entered();
        let n_particles = positions.len();
        let pbc = *cell.pbc();

        let perp_widths = cell.perpendicular_widths();
        let num_bins = bin_counts(&perp_widths, bin_size, n_particles, cell.is_2d());
        let total_bins = num_bins.x * num_bins.y * num_bins.z;
        let bin_widths = perp_widths.component_div(&num_bins.map(|n| n as f64));

        // 1. Wrap into the primary image and compute Z-order keys
        let atom_data: Vec<(u64, Vector3<f64>, Vector3<usize>)> = {
            let _s = info_span!("compute_z_order").entered();
            positions
                .par_iter()
                .map(|pos| {
                    let mut frac = cell.to_fractional(pos);
                    for axis in 0..3 {
                        if pbc[axis] {
                            frac[axis] -= frac[axis].floor();
                        }
                    }
                    let bin = Vector3::new(
                        bin_coord(frac.x, num_bins.x),
                        bin_coord(frac.y, num_bins.y),
                        bin_coord(frac.z, num_bins.z),
                    );
                    (compute_z_order(&frac), cell.to_cartesian(&frac), bin)
                })
                .collect()
        };

        // 2. Sort particles spatially by global Z-order
        let mut order: Vec<usize> = (0..n_particles).collect();
        {
            let _s = info_span!("spatial_sort").entered();
            order.sort_unstable_by_key(|&i| (atom_data[i].0, i));
        }

        // 3. Morton ranks for bins
        let mut bin_ranks = vec![0; total_bins];
        {
            let _s = info_span!("compute_bin_ranks").entered();
            let mut bin_morton: Vec<(u64, usize)> = (0..total_bins)
                .map(|i| {
                    let bx = i % num_bins.x;
                    let by = (i / num_bins.x) % num_bins.y;
                    let bz = i / (num_bins.x * num_bins.y);
                    (
                        interleave_3(bx as u64)
                            | (interleave_3(by as u64) << 1)
                            | (interleave_3(bz as u64) << 2),
                        i,
                    )
                })
                .collect();
            bin_morton.sort_unstable_by_key(|&(z, _)| z);
            for (rank, &(_z, linear_idx)) in bin_morton.iter().enumerate() {
                bin_ranks[linear_idx] = rank;
            }
        }

        let linear = |b: &Vector3<usize>| b.x + num_bins.x * (b.y + num_bins.y * b.z);

        // 4. Bin counts and prefix offsets
        let mut counts = vec![0; total_bins];
        for (_, _, bin) in &atom_data {
            counts[bin_ranks[linear(bin)]] += 1;
        }

        let mut cell_starts = vec![0; total_bins + 1];
        let mut accum = 0;
        for i in 0..total_bins {
            cell_starts[i] = accum;
            accum += counts[i];
        }
        cell_starts[total_bins] = accum;

        // 5. Fill final arrays
        let mut particles = vec![0; n_particles];
        let mut sorted_of = vec![0; n_particles];
        let mut pos_wrapped = vec![Vector3::zeros(); n_particles];
        let mut bins = vec![Vector3::zeros(); n_particles];
        let mut current_fill = cell_starts.clone();
        {
            let _s = info_span!("bin_fill").entered();
            for &original_idx in &order {
                let (_, wrapped, bin) = atom_data[original_idx];
                let rank = bin_ranks[linear(&bin)];
                let loc = current_fill[rank];
                particles[loc] = original_idx;
                sorted_of[original_idx] = loc;
                pos_wrapped[loc] = wrapped;
                bins[loc] = bin;
                current_fill[rank] += 1;
            }
        }

        Self {
            particles,
            sorted_of,
            cell_starts,
            bin_ranks,
            pos_wrapped,
            bins,
            num_bins,
            bin_widths,
            pbc,
        }
    }

    pub fn num_bins(&self) -> &Vector3<usize> {
        &self.num_bins
    }

    pub fn get_atoms_in_bin(&self, bx: usize, by: usize, bz: usize) -> &[usize] {
        if bx >= self.num_bins.x || by >= self.num_bins.y || bz >= self.num_bins.z {
            return &[];
        }
        let rank = self.bin_ranks[bx + self.num_bins.x * (by + self.num_bins.y * bz)];
        &self.particles[self.cell_starts[rank]..self.cell_starts[rank + 1]]
    }

    fn bin_range(&self, rank: usize) -> std::ops::Range<usize> {
        self.cell_starts[rank]..self.cell_starts[rank + 1]
    }

    /// Appends every bond from `i` with length at most `cutoff`, periodic
    /// replicas included. `i` itself only appears at non-zero image shifts.
    pub fn bonds_within(
        &self,
        cell: &PeriodicBox,
        i: usize,
        cutoff: f64,
        bonds: &mut Vec<Bond>,
    ) {
        let cutoff_sq = cutoff * cutoff;
        let loc_i = self.sorted_of[i];
        let pos_i = self.pos_wrapped[loc_i];
        let bin_i = self.bins[loc_i];
        let h_matrix = cell.h();

        let n_search = self
            .bin_widths
            .map(|w| (cutoff / w).ceil() as i32);

        for dx in -n_search.x..=n_search.x {
            let Some((nbx, sx)) = self.neighbor_bin(0, bin_i.x, dx) else {
                continue;
            };
            for dy in -n_search.y..=n_search.y {
                let Some((nby, sy)) = self.neighbor_bin(1, bin_i.y, dy) else {
                    continue;
                };
                for dz in -n_search.z..=n_search.z {
                    let Some((nbz, sz)) = self.neighbor_bin(2, bin_i.z, dz) else {
                        continue;
                    };

                    let linear_idx = nbx + self.num_bins.x * (nby + self.num_bins.y * nbz);
                    let range = self.bin_range(self.bin_ranks[linear_idx]);
                    if range.is_empty() {
                        continue;
                    }

                    let zero_shift = sx == 0 && sy == 0 && sz == 0;
                    let offset_vec = h_matrix * Vector3::new(sx as f64, sy as f64, sz as f64);

                    for sorted_idx_j in range {
                        if zero_shift && sorted_idx_j == loc_i {
                            continue;
                        }
                        let disp = (self.pos_wrapped[sorted_idx_j] - pos_i) + offset_vec;
                        if disp.norm_squared() <= cutoff_sq {
                            bonds.push((self.particles[sorted_idx_j], disp));
                        }
                    }
                }
            }
        }
    }

    /// Finds the `k` particles closest to `i` under the minimum-image
    /// convention, ordered by distance then index. Returns `false` when fewer
    /// than `k` other particles exist.
    ///
    /// `positions` must be the slice the grid was built from. The search window
    /// grows one shell of bins at a time until the k-th candidate lies inside
    /// the radius the visited shells are known to cover.
    pub fn nearest(
        &self,
        cell: &PeriodicBox,
        positions: &[Vector3<f64>],
        i: usize,
        k: usize,
        candidates: &mut Vec<(f64, usize, Vector3<f64>)>,
        bonds: &mut Vec<Bond>,
    ) -> bool {
        debug_assert!(k > 0);
        let loc_i = self.sorted_of[i];
        let bin_i = self.bins[loc_i];

        let mut shell = 1usize;
        loop {
            candidates.clear();
            let windows = [
                self.window(0, bin_i.x, shell),
                self.window(1, bin_i.y, shell),
                self.window(2, bin_i.z, shell),
            ];

            for raw_x in windows[0].0.clone() {
                let nbx = raw_x % self.num_bins.x;
                for raw_y in windows[1].0.clone() {
                    let nby = raw_y % self.num_bins.y;
                    for raw_z in windows[2].0.clone() {
                        let nbz = raw_z % self.num_bins.z;
                        let linear_idx = nbx + self.num_bins.x * (nby + self.num_bins.y * nbz);
                        for sorted_idx_j in self.bin_range(self.bin_ranks[linear_idx]) {
                            if sorted_idx_j == loc_i {
                                continue;
                            }
                            // Same arithmetic as the brute-force path so ties resolve identically
                            let j = self.particles[sorted_idx_j];
                            let disp = cell.minimum_image(&positions[i], &positions[j]);
                            candidates.push((disp.norm_squared(), j, disp));
                        }
                    }
                }
            }

            // Radius inside which every particle has been seen. One shell is
            // held back since a particle's bin can sit one off its exact
            // fractional offset after rounding.
            let covered = (0..3)
                .filter(|&axis| !windows[axis].1)
                .map(|axis| (shell - 1) as f64 * self.bin_widths[axis])
                .fold(f64::INFINITY, f64::min);
            let exhausted = covered.is_infinite();

            if candidates.len() >= k {
                candidates.select_nth_unstable_by(k - 1, compare_candidates);
                let kth = candidates[k - 1].0;
                // Strict, so a tie at the k-th distance is never left outside the window
                if exhausted || kth < covered * covered * COVERED_RADIUS_SQ_MARGIN {
                    candidates.truncate(k);
                    candidates.sort_unstable_by(compare_candidates);
                    bonds.extend(candidates.iter().map(|&(_, j, disp)| (j, disp)));
                    return true;
                }
            } else if exhausted {
                return false;
            }
            shell += 1;
        }
    }

    /// Bin index and image shift reached by stepping `delta` bins from `bin`.
    fn neighbor_bin(&self, axis: usize, bin: usize, delta: i32) -> Option<(usize, i32)> {
        let n = self.num_bins[axis] as i32;
        let target = bin as i32 + delta;
        if self.pbc[axis] {
            Some(div_mod(target, n))
        } else if (0..n).contains(&target) {
            Some((target as usize, 0))
        } else {
            None
        }
    }

    /// Bins within `shell` of `bin` along `axis`, as a range to be taken
    /// modulo the axis bin count, and whether that covers the whole axis.
    fn window(&self, axis: usize, bin: usize, shell: usize) -> (Range<usize>, bool) {
        let n = self.num_bins[axis];
        if self.pbc[axis] {
            if 2 * shell + 1 >= n {
                return (0..n, true);
            }
            (bin + n - shell..bin + n + shell + 1, false)
        } else {
            let lo = bin.saturating_sub(shell);
            let hi = (bin + shell).min(n - 1);
            (lo..hi + 1, lo == 0 && hi == n - 1)
        }
    }
}

fn compare_candidates(a: &(f64, usize, Vector3<f64>), b: &(f64, usize, Vector3<f64>)) -> Ordering {
    a.0.partial_cmp(&b.0)
        .unwrap_or(Ordering::Equal)
        .then(a.1.cmp(&b.1))
}

/// Bins per axis: as many as fit `bin_size`, coarsened so the grid never has
/// more than a few bins per particle.
fn bin_counts(
    perp_widths: &Vector3<f64>,
    bin_size: f64,
    n_particles: usize,
    is_2d: bool,
) -> Vector3<usize> {
    let mut num_bins = perp_widths.map(|w| ((w / bin_size).floor() as usize).max(1));
    if is_2d {
        num_bins.z = 1;
    }
    let budget = (n_particles * MAX_BINS_PER_PARTICLE).max(MIN_BIN_BUDGET);
    let total = num_bins.x as f64 * num_bins.y as f64 * num_bins.z as f64;
    if total > budget as f64 {
        let dims = if is_2d { 2.0 } else { 3.0 };
        let factor = (total / budget as f64).powf(1.0 / dims);
        num_bins = num_bins.map(|n| ((n as f64 / factor).floor() as usize).max(1));
        if is_2d {
            num_bins.z = 1;
        }
    }
    num_bins
}

/// Bin of a fractional coordinate; values outside [0, 1) on open axes clamp
/// to the edge bins.
fn bin_coord(frac: f64, n: usize) -> usize {
    if frac <= 0.0 {
        0
    } else {
        ((frac * n as f64) as usize).min(n - 1)
    }
}

fn div_mod(val: i32, max: i32) -> (usize, i32) {
    let rem = val.rem_euclid(max);
    let shift = val.div_euclid(max);
    (rem as usize, shift)
}

/// Computes a 64-bit Morton (Z-order) index for fractional coordinates [0, 1).
fn compute_z_order(frac: &Vector3<f64>) -> u64 {
    let x = (frac.x.clamp(0.0, Z_ORDER_CLAMP_MAX) * (1u64 << Z_ORDER_BITS) as f64) as u64;
    let y = (frac.y.clamp(0.0, Z_ORDER_CLAMP_MAX) * (1u64 << Z_ORDER_BITS) as f64) as u64;
    let z = (frac.z.clamp(0.0, Z_ORDER_CLAMP_MAX) * (1u64 << Z_ORDER_BITS) as f64) as u64;

    interleave_3(x) | (interleave_3(y) << 1) | (interleave_3(z) << 2)
}

fn interleave_3(mut x: u64) -> u64 {
    x &= 0x1fffff;
    x = (x | x << 32) & 0x1f00000000ffffu64;
    x = (x | x << 16) & 0x1f0000ff0000ffu64;
    x = (x | x << 8) & 0x100f00f00f00f00fu64;
    x = (x | x << 4) & 0x10c30c30c30c30c3u64;
    x = (x | x << 2) & 0x1249249249249249u64;
    x
}

/// O(N^2) reference: every bond from `i` within `cutoff` under the minimum
/// image. Only valid when `2 * cutoff` is below the smallest periodic width.
pub fn brute_force_within(
    cell: &PeriodicBox,
    positions: &[Vector3<f64>],
    i: usize,
    cutoff: f64,
    bonds: &mut Vec<Bond>,
) {
    let cutoff_sq = cutoff * cutoff;
    for (j, pos_j) in positions.iter().enumerate() {
        if j == i {
            continue;
        }
        let disp = cell.minimum_image(&positions[i], pos_j);
        if disp.norm_squared() <= cutoff_sq {
            bonds.push((j, disp));
        }
    }
}

/// O(N^2) reference for the k nearest neighbors of `i`.
pub fn brute_force_nearest(
    cell: &PeriodicBox,
    positions: &[Vector3<f64>],
    i: usize,
    k: usize,
    candidates: &mut Vec<(f64, usize, Vector3<f64>)>,
    bonds: &mut Vec<Bond>,
) -> bool {
    if positions.len() <= k {
        return false;
    }
    candidates.clear();
    for (j, pos_j) in positions.iter().enumerate() {
        if j == i {
            continue;
        }
        let disp = cell.minimum_image(&positions[i], pos_j);
        candidates.push((disp.norm_squared(), j, disp));
    }
    candidates.select_nth_unstable_by(k - 1, compare_candidates);
    candidates.truncate(k);
    candidates.sort_unstable_by(compare_candidates);
    bonds.extend(candidates.iter().map(|&(_, j, disp)| (j, disp)));
    true
}
