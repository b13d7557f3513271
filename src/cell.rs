use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

/// Determinants below this are treated as a collapsed cell.
const MIN_VOLUME: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BoxError {
    #[error("Cell matrix is not invertible")]
    NotInvertible,
    #[error("Box edge {axis} must be positive and finite, got {value}")]
    NonPositiveLength { axis: usize, value: f64 },
    #[error("Cell matrix contains non-finite entries")]
    NonFinite,
}

/// A simulation cell with per-axis periodicity.
///
/// The columns of `h` are the lattice vectors, so `cart = h * frac`. Two
/// dimensional boxes keep a unit, non-periodic z axis so that points with
/// `z == 0` stay inside the first layer of the grid.
#[derive(Clone, Debug, PartialEq)]
pub struct PeriodicBox {
    h: Matrix3<f64>,
    h_inv: Matrix3<f64>,
    pbc: Vector3<bool>,
    is_2d: bool,
}

impl PeriodicBox {
    pub fn new(h: Matrix3<f64>, pbc: Vector3<bool>) -> Result<Self, BoxError> {
        Self::with_dimensionality(h, pbc, false)
    }

    fn with_dimensionality(
        h: Matrix3<f64>,
        pbc: Vector3<bool>,
        is_2d: bool,
    ) -> Result<Self, BoxError> {
        if h.iter().any(|x| !x.is_finite()) {
            return Err(BoxError::NonFinite);
        }
        for axis in 0..3 {
            let len = h.column(axis).norm();
            if len <= 0.0 {
                return Err(BoxError::NonPositiveLength { axis, value: len });
            }
        }
        if h.determinant().abs() < MIN_VOLUME {
            return Err(BoxError::NotInvertible);
        }
        let h_inv = h.try_inverse().ok_or(BoxError::NotInvertible)?;
        Ok(Self {
            h,
            h_inv,
            pbc,
            is_2d,
        })
    }

    /// Fully periodic cube of side `l`.
    pub fn cube(l: f64) -> Result<Self, BoxError> {
        Self::orthorhombic(l, l, l)
    }

    pub fn orthorhombic(lx: f64, ly: f64, lz: f64) -> Result<Self, BoxError> {
        Self::triclinic(lx, ly, lz, 0.0, 0.0, 0.0)
    }

    /// Triclinic box from edge lengths and tilt factors:
    /// `a1 = (lx, 0, 0)`, `a2 = (xy*ly, ly, 0)`, `a3 = (xz*lz, yz*lz, lz)`.
    pub fn triclinic(
        lx: f64,
        ly: f64,
        lz: f64,
        xy: f64,
        xz: f64,
        yz: f64,
    ) -> Result<Self, BoxError> {
        check_lengths(&[lx, ly, lz])?;
        let h = Matrix3::new(lx, xy * ly, xz * lz, 0.0, ly, yz * lz, 0.0, 0.0, lz);
        Self::with_dimensionality(h, Vector3::new(true, true, true), false)
    }

    /// Periodic square in the xy plane.
    pub fn square(l: f64) -> Result<Self, BoxError> {
        Self::rectangle(l, l)
    }

    pub fn rectangle(lx: f64, ly: f64) -> Result<Self, BoxError> {
        check_lengths(&[lx, ly])?;
        let h = Matrix3::new(lx, 0.0, 0.0, 0.0, ly, 0.0, 0.0, 0.0, 1.0);
        Self::with_dimensionality(h, Vector3::new(true, true, false), true)
    }

    pub fn to_fractional(&self, cart: &Vector3<f64>) -> Vector3<f64> {
        self.h_inv * cart
    }

    pub fn to_cartesian(&self, frac: &Vector3<f64>) -> Vector3<f64> {
        self.h * frac
    }

    pub fn h(&self) -> &Matrix3<f64> {
        &self.h
    }

    pub fn h_inv(&self) -> &Matrix3<f64> {
        &self.h_inv
    }

    pub fn pbc(&self) -> &Vector3<bool> {
        &self.pbc
    }

    pub fn is_2d(&self) -> bool {
        self.is_2d
    }

    /// Number of spatial dimensions particles live in.
    pub fn dimensions(&self) -> usize {
        if self.is_2d { 2 } else { 3 }
    }

    /// Lengths of the three lattice vectors.
    pub fn lengths(&self) -> Vector3<f64> {
        Vector3::new(
            self.h.column(0).norm(),
            self.h.column(1).norm(),
            self.h.column(2).norm(),
        )
    }

    /// Volume of the cell, or its area for a 2D box.
    pub fn volume(&self) -> f64 {
        self.h.determinant().abs()
    }

    /// Returns the perpendicular widths of the cell (distances between parallel faces).
    /// d_i = 1 / |h_inv.row(i)|
    pub fn perpendicular_widths(&self) -> Vector3<f64> {
        Vector3::new(
            1.0 / self.h_inv.row(0).norm(),
            1.0 / self.h_inv.row(1).norm(),
            1.0 / self.h_inv.row(2).norm(),
        )
    }

    /// Smallest perpendicular width over periodic axes, infinite if no axis wraps.
    pub fn min_periodic_width(&self) -> f64 {
        let perp = self.perpendicular_widths();
        (0..3)
            .filter(|&a| self.pbc[a])
            .map(|a| perp[a])
            .fold(f64::INFINITY, f64::min)
    }

    pub fn wrap(&self, cart: &Vector3<f64>) -> Vector3<f64> {
        let mut frac = self.to_fractional(cart);
        for axis in 0..3 {
            if self.pbc[axis] {
                frac[axis] -= frac[axis].floor();
            }
        }
        self.to_cartesian(&frac)
    }

    /// Displacement from `r_i` to the nearest image of `r_j`.
    ///
    /// Each periodic fractional component lands in (-1/2, 1/2].
    pub fn minimum_image(&self, r_i: &Vector3<f64>, r_j: &Vector3<f64>) -> Vector3<f64> {
        let mut d_frac = self.to_fractional(&(r_j - r_i));
        for axis in 0..3 {
            if self.pbc[axis] {
                d_frac[axis] -= (d_frac[axis] - 0.5).ceil();
            }
        }
        self.h * d_frac
    }
}

fn check_lengths(lengths: &[f64]) -> Result<(), BoxError> {
    for (axis, &value) in lengths.iter().enumerate() {
        if !value.is_finite() || value <= 0.0 {
            return Err(BoxError::NonPositiveLength { axis, value });
        }
    }
    Ok(())
}
