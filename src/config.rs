use std::sync::atomic::{AtomicUsize, Ordering};

// Default heuristic values; tune at runtime through the setters.
const DEFAULT_BRUTE_FORCE_THRESHOLD: usize = 1000;
const DEFAULT_PARALLEL_THRESHOLD: usize = 300;

/// Systems smaller than this use an O(N^2) scan when it is image-safe.
static BRUTE_FORCE_THRESHOLD: AtomicUsize = AtomicUsize::new(DEFAULT_BRUTE_FORCE_THRESHOLD);
/// Systems at least this large fan per-particle work out over rayon.
static PARALLEL_THRESHOLD: AtomicUsize = AtomicUsize::new(DEFAULT_PARALLEL_THRESHOLD);

pub fn get_brute_force_threshold() -> usize {
    BRUTE_FORCE_THRESHOLD.load(Ordering::Relaxed)
}

pub fn set_brute_force_threshold(val: usize) {
    BRUTE_FORCE_THRESHOLD.store(val, Ordering::Relaxed);
}

pub fn get_parallel_threshold() -> usize {
    PARALLEL_THRESHOLD.load(Ordering::Relaxed)
}

pub fn set_parallel_threshold(val: usize) {
    PARALLEL_THRESHOLD.store(val, Ordering::Relaxed);
}

pub(crate) fn use_parallel(n_particles: usize) -> bool {
    n_particles >= get_parallel_threshold()
}

pub(crate) fn use_brute_force(n_particles: usize) -> bool {
    n_particles < get_brute_force_threshold()
}
