use crate::cell::PeriodicBox;
use crate::error::OrderError;
use nalgebra::Vector3;

/// Converts a row-major `N x dim` coordinate buffer into points.
///
/// Two-dimensional rows are placed in the `z = 0` plane.
pub fn points_from_flat(coords: &[f64], dim: usize) -> Result<Vec<Vector3<f64>>, OrderError> {
    if dim != 2 && dim != 3 {
        return Err(OrderError::UnsupportedDimension(dim));
    }
    if coords.len() % dim != 0 {
        return Err(OrderError::RaggedPositions {
            len: coords.len(),
            dim,
        });
    }
    Ok(coords
        .chunks_exact(dim)
        .map(|row| Vector3::new(row[0], row[1], row.get(2).copied().unwrap_or(0.0)))
        .collect())
}

/// Rejects non-finite coordinates, and points off the plane of a 2D box.
pub fn validate_positions(
    cell: &PeriodicBox,
    positions: &[Vector3<f64>],
) -> Result<(), OrderError> {
    for (index, p) in positions.iter().enumerate() {
        if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()) {
            return Err(OrderError::NonFinitePosition { index });
        }
        if cell.is_2d() && p.z != 0.0 {
            return Err(OrderError::OutOfPlane { index });
        }
    }
    Ok(())
}
