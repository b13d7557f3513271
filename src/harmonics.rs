//! Complex spherical harmonics of a single degree.
//!
//! `Y_l^m(θ, φ) = P̄_l^m(cos θ) e^{imφ}` where `P̄` are the orthonormalized
//! associated Legendre functions with the Condon-Shortley phase, produced by
//! the three-term recurrence in `l` at fixed `m`.

use nalgebra::Vector3;
use num_complex::Complex64;
use std::f64::consts::PI;

/// Evaluates `Y_l^m` for one degree `l` and every order `m ∈ [-l, l]`.
///
/// Output slots follow `index = m + l`, so index 0 holds `m = -l`.
#[derive(Clone, Debug)]
pub struct SphericalHarmonics {
    degree: usize,
    /// `P̄_m^m / sin^m θ`, indexed by `m`.
    sectoral: Vec<f64>,
    /// Recurrence factors `a(l', m) = sqrt((4l'^2 - 1) / (l'^2 - m^2))`,
    /// stored row-major as `[m * (degree + 1) + l']` for `l' > m`.
    recurrence: Vec<f64>,
}

impl SphericalHarmonics {
    pub fn new(degree: usize) -> Self {
        let stride = degree + 1;

        let mut sectoral = Vec::with_capacity(stride);
        let mut pmm = (1.0 / (4.0 * PI)).sqrt();
        sectoral.push(pmm);
        for m in 1..=degree {
            let mf = m as f64;
            pmm *= -((2.0 * mf + 1.0) / (2.0 * mf)).sqrt();
            sectoral.push(pmm);
        }

        let mut recurrence = vec![0.0; stride * stride];
        for m in 0..=degree {
            for l in (m + 1)..=degree {
                let (lf, mf) = (l as f64, m as f64);
                recurrence[m * stride + l] =
                    ((4.0 * lf * lf - 1.0) / (lf * lf - mf * mf)).sqrt();
            }
        }

        Self {
            degree,
            sectoral,
            recurrence,
        }
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Number of orders, `2l + 1`.
    pub fn width(&self) -> usize {
        2 * self.degree + 1
    }

    /// Orthonormalized associated Legendre function `P̄_l^m(x)` for `m >= 0`,
    /// given `x = cos θ` and `s = sin θ >= 0`.
    fn legendre(&self, m: usize, x: f64, s: f64) -> f64 {
        let l = self.degree;
        let stride = l + 1;

        let mut p_mm = self.sectoral[m] * s.powi(m as i32);
        if l == m {
            return p_mm;
        }
        let a = &self.recurrence[m * stride..(m + 1) * stride];
        let mut p_m1m = a[m + 1] * x * p_mm;
        for ll in (m + 2)..=l {
            let p_llm = a[ll] * (x * p_m1m - p_mm / a[ll - 1]);
            p_mm = p_m1m;
            p_m1m = p_llm;
        }
        p_m1m
    }

    /// Writes `Y_l^m` of `direction` into `out[m + l]`.
    ///
    /// `direction` must be non-zero; it does not need to be normalized.
    pub fn evaluate(&self, direction: &Vector3<f64>, out: &mut [Complex64]) {
        let l = self.degree;
        debug_assert_eq!(out.len(), self.width());

        let r = direction.norm();
        debug_assert!(r > 0.0, "bond direction must be non-zero");
        let x = (direction.z / r).clamp(-1.0, 1.0);
        let rho = direction.x.hypot(direction.y);
        let s = rho / r;

        // e^{iφ}; on the polar axis every m != 0 term carries a zero sin factor
        let e_iphi = if rho > 0.0 {
            Complex64::new(direction.x / rho, direction.y / rho)
        } else {
            Complex64::new(1.0, 0.0)
        };

        let mut phase = Complex64::new(1.0, 0.0);
        for m in 0..=l {
            let y = phase * self.legendre(m, x, s);
            out[l + m] = y;
            if m > 0 {
                // Y_l^{-m} = (-1)^m conj(Y_l^m)
                let sign = if m % 2 == 0 { 1.0 } else { -1.0 };
                out[l - m] = y.conj() * sign;
            }
            phase *= e_iphi;
        }
    }

    /// Adds `Y_l^m` of `direction` onto `acc`, using `scratch` as workspace.
    pub fn accumulate(
        &self,
        direction: &Vector3<f64>,
        acc: &mut [Complex64],
        scratch: &mut [Complex64],
    ) {
        self.evaluate(direction, scratch);
        for (a, y) in acc.iter_mut().zip(scratch.iter()) {
            *a += *y;
        }
    }
}

/// Rotation-invariant norm `sqrt(4π/(2l+1) Σ_m |q_lm|^2)` of one q_lm row.
pub fn invariant(qlm: &[Complex64]) -> f64 {
    let sum_sq: f64 = qlm.iter().map(|c| c.norm_sqr()).sum();
    (4.0 * PI / qlm.len() as f64 * sum_sq).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn eval(l: usize, dir: Vector3<f64>) -> Vec<Complex64> {
        let basis = SphericalHarmonics::new(l);
        let mut out = vec![Complex64::new(0.0, 0.0); basis.width()];
        basis.evaluate(&dir, &mut out);
        out
    }

    #[test]
    fn test_degree_zero_is_constant() {
        let y = eval(0, Vector3::new(0.3, -0.2, 0.9));
        assert_eq!(y.len(), 1);
        assert_relative_eq!(y[0].re, (1.0 / (4.0 * PI)).sqrt(), epsilon = 1e-14);
        assert_relative_eq!(y[0].im, 0.0);
    }

    #[test]
    fn test_low_degree_closed_forms() {
        let (theta, phi): (f64, f64) = (0.7, 1.3);
        let dir = Vector3::new(
            theta.sin() * phi.cos(),
            theta.sin() * phi.sin(),
            theta.cos(),
        );

        let y1 = eval(1, dir);
        let y10 = (3.0 / (4.0 * PI)).sqrt() * theta.cos();
        let y11 = Complex64::from_polar(-(3.0 / (8.0 * PI)).sqrt() * theta.sin(), phi);
        assert_relative_eq!(y1[1].re, y10, epsilon = 1e-12);
        assert_relative_eq!(y1[2].re, y11.re, epsilon = 1e-12);
        assert_relative_eq!(y1[2].im, y11.im, epsilon = 1e-12);
        // Y_1^{-1} = -conj(Y_1^1)
        assert_relative_eq!(y1[0].re, -y11.re, epsilon = 1e-12);
        assert_relative_eq!(y1[0].im, y11.im, epsilon = 1e-12);

        let y2 = eval(2, dir);
        let x = theta.cos();
        let y20 = (5.0 / (16.0 * PI)).sqrt() * (3.0 * x * x - 1.0);
        let y22 = Complex64::from_polar(
            0.25 * (15.0 / (2.0 * PI)).sqrt() * theta.sin().powi(2),
            2.0 * phi,
        );
        assert_relative_eq!(y2[2].re, y20, epsilon = 1e-12);
        assert_relative_eq!(y2[4].re, y22.re, epsilon = 1e-12);
        assert_relative_eq!(y2[4].im, y22.im, epsilon = 1e-12);
    }

    #[test]
    fn test_y60_matches_polynomial() {
        let dir = Vector3::new(0.2f64, 0.4, 0.6);
        let x = dir.z / dir.norm();
        let expected = (13.0 / PI).sqrt() / 32.0
            * (231.0 * x.powi(6) - 315.0 * x.powi(4) + 105.0 * x.powi(2) - 5.0);
        let y = eval(6, dir);
        assert_relative_eq!(y[6].re, expected, epsilon = 1e-12);
        assert_relative_eq!(y[6].im, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_addition_theorem() {
        // Σ_m |Y_l^m|^2 = (2l + 1) / 4π for every direction
        let dirs = [
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.0, 0.0, -2.5),
            Vector3::new(-0.3, 0.8, 0.1),
            Vector3::new(1.0, 1.0, 1.0),
        ];
        for l in 0..=12 {
            let basis = SphericalHarmonics::new(l);
            let mut out = vec![Complex64::new(0.0, 0.0); basis.width()];
            for dir in &dirs {
                basis.evaluate(dir, &mut out);
                let sum: f64 = out.iter().map(|c| c.norm_sqr()).sum();
                assert_relative_eq!(
                    sum,
                    (2 * l + 1) as f64 / (4.0 * PI),
                    max_relative = 1e-10
                );
            }
        }
    }

    #[test]
    fn test_polar_axis() {
        // Only m = 0 survives on the z axis
        let y = eval(4, Vector3::new(0.0, 0.0, 3.0));
        for (idx, v) in y.iter().enumerate() {
            if idx == 4 {
                assert_relative_eq!(v.re, (9.0 / (4.0 * PI)).sqrt(), epsilon = 1e-12);
            } else {
                assert_relative_eq!(v.norm(), 0.0, epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn test_accumulate_adds() {
        let basis = SphericalHarmonics::new(3);
        let dir = Vector3::new(0.1, 0.5, -0.2);
        let mut acc = vec![Complex64::new(0.0, 0.0); basis.width()];
        let mut scratch = acc.clone();
        basis.accumulate(&dir, &mut acc, &mut scratch);
        basis.accumulate(&dir, &mut acc, &mut scratch);
        for (a, y) in acc.iter().zip(scratch.iter()) {
            assert_relative_eq!(a.re, 2.0 * y.re, epsilon = 1e-14);
            assert_relative_eq!(a.im, 2.0 * y.im, epsilon = 1e-14);
        }
    }

    #[test]
    fn test_invariant_single_bond() {
        // One bond: Ql = sqrt(4π/(2l+1) * (2l+1)/4π) = 1
        let basis = SphericalHarmonics::new(6);
        let mut out = vec![Complex64::new(0.0, 0.0); basis.width()];
        basis.evaluate(&Vector3::new(0.3, 0.1, -0.7), &mut out);
        assert_relative_eq!(invariant(&out), 1.0, epsilon = 1e-12);
    }
}
