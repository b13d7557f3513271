//! Periodic neighbor search and local Steinhardt bond-order parameters.
//!
//! The entry point is [`LocalQl`], which turns particle positions inside a
//! [`PeriodicBox`] into per-particle `Ql` values. [`HexOrder`] computes the
//! planar k-atic order `ψ_k`. The [`geometry`] module holds small standalone
//! vector helpers.

pub mod cell;
pub mod config;
pub mod error;
pub mod geometry;
pub mod harmonics;
pub mod hexatic;
pub mod neighbors;
pub mod order;
pub mod positions;
pub mod qlm;
pub mod search;

#[cfg(feature = "python")]
mod python_api;

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

pub use cell::{BoxError, PeriodicBox};
pub use error::{ErrorKind, OrderError};
pub use harmonics::SphericalHarmonics;
pub use hexatic::HexOrder;
pub use neighbors::{NeighborFinder, NeighborList, NeighborMode};
pub use order::LocalQl;
pub use qlm::QlmTable;

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber printing to stderr.
///
/// `RUST_LOG` takes precedence over `level`, which defaults to `info`. Calling
/// this more than once is harmless.
pub fn init_logging(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .with_thread_ids(true)
        .try_init();
}
