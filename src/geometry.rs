//! Small vector helpers for shape-complementarity checks in the plane.

use nalgebra::{Point2, Rotation2, Vector2, Vector3};

/// Whether `r` and `p` lie on the same side of the line through `a` and `b`.
///
/// Points on the line count as being on both sides.
pub fn same_side(a: &Vector3<f64>, b: &Vector3<f64>, r: &Vector3<f64>, p: &Vector3<f64>) -> bool {
    let edge = b - a;
    let cr = edge.cross(&(r - a));
    let cp = edge.cross(&(p - a));
    cr.dot(&cp) >= 0.0
}

/// Whether `p` lies inside or on the boundary of `triangle`.
pub fn is_inside(triangle: &[Point2<f64>; 3], p: &Point2<f64>) -> bool {
    let lift = |q: &Point2<f64>| Vector3::new(q.x, q.y, 0.0);
    let [a, b, c] = triangle.map(|v| lift(&v));
    let p = lift(p);
    same_side(&a, &b, &c, &p) && same_side(&b, &c, &a, &p) && same_side(&c, &a, &b, &p)
}

pub fn dot(u: &Vector3<f64>, v: &Vector3<f64>) -> f64 {
    u.dot(v)
}

pub fn cross(u: &Vector3<f64>, v: &Vector3<f64>) -> Vector3<f64> {
    u.cross(v)
}

/// Rotates `p` counter-clockwise about the origin by `angle` radians.
pub fn rotate_2d(p: &Vector2<f64>, angle: f64) -> Vector2<f64> {
    Rotation2::new(angle) * p
}

/// Expresses `vertex`, given in the body frame of shape B, in the body frame
/// of shape A.
///
/// Each shape sits at its origin rotated by its angle; the vertex is first
/// placed in the lab frame through B and then brought back through A.
pub fn to_local_frame(
    origin_a: &Vector2<f64>,
    origin_b: &Vector2<f64>,
    vertex: &Vector2<f64>,
    angle_a: f64,
    angle_b: f64,
) -> Vector2<f64> {
    let lab = rotate_2d(vertex, angle_b) + origin_b;
    rotate_2d(&(lab - origin_a), -angle_a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn test_same_side() {
        let a = Vector3::new(-1.0, 0.0, 0.0);
        let b = Vector3::new(1.0, 0.0, 0.0);
        let p = Vector3::new(-1.0, 10.0, 0.0);

        assert!(same_side(&a, &b, &Vector3::new(0.0, 1.0, 0.0), &p));
        assert!(!same_side(&a, &b, &Vector3::new(0.0, -1.0, 0.0), &p));
        // Points on the line are on either side
        assert!(same_side(&a, &b, &Vector3::new(-2.0, 0.0, 0.0), &p));
        assert!(same_side(&a, &b, &Vector3::zeros(), &p));
    }

    #[test]
    fn test_is_inside() {
        let triangle = [
            Point2::new(-1.0, -1.0),
            Point2::new(1.0, -1.0),
            Point2::new(0.0, 1.0),
        ];
        assert!(is_inside(&triangle, &Point2::new(0.0, 0.0)));
        assert!(is_inside(&triangle, &Point2::new(-1.0, -1.0)));
        assert!(is_inside(&triangle, &Point2::new(0.0, -1.0)));
        assert!(!is_inside(&triangle, &Point2::new(-10.0, -10.0)));
        assert!(!is_inside(&triangle, &Point2::new(0.9, 0.9)));

        // Vertex order does not matter
        let reversed = [triangle[2], triangle[1], triangle[0]];
        assert!(is_inside(&reversed, &Point2::new(0.0, 0.0)));
        assert!(!is_inside(&reversed, &Point2::new(-10.0, -10.0)));
    }

    #[test]
    fn test_products() {
        assert_eq!(
            cross(&Vector3::new(1.0, 0.0, 0.0), &Vector3::new(0.0, 1.0, 0.0)),
            Vector3::new(0.0, 0.0, 1.0)
        );
        assert_eq!(
            dot(&Vector3::new(1.0, 1.0, 0.0), &Vector3::new(1.0, 1.0, 0.0)),
            2.0
        );
        assert_eq!(
            dot(&Vector3::new(1.0, 0.0, 0.0), &Vector3::new(0.0, 3.0, -2.0)),
            0.0
        );
    }

    #[test]
    fn test_rotate_2d() {
        let r = rotate_2d(&Vector2::new(1.0, 0.0), FRAC_PI_2);
        assert_relative_eq!(r.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(r.y, 1.0, epsilon = 1e-12);

        let r = rotate_2d(&Vector2::new(2.0, -1.0), PI);
        assert_relative_eq!(r.x, -2.0, epsilon = 1e-12);
        assert_relative_eq!(r.y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_to_local_frame() {
        // Same frame: identity
        let o = Vector2::new(3.0, 4.0);
        let v = Vector2::new(0.5, -0.25);
        let local = to_local_frame(&o, &o, &v, 0.7, 0.7);
        assert_relative_eq!(local, v, epsilon = 1e-12);

        // B rotated a quarter turn and shifted along x
        let local = to_local_frame(
            &Vector2::zeros(),
            &Vector2::new(2.0, 0.0),
            &Vector2::new(1.0, 0.0),
            0.0,
            FRAC_PI_2,
        );
        assert_relative_eq!(local, Vector2::new(2.0, 1.0), epsilon = 1e-12);

        // A rotated a quarter turn sees the lab +x axis as its -y axis
        let local = to_local_frame(
            &Vector2::zeros(),
            &Vector2::zeros(),
            &Vector2::new(1.0, 0.0),
            FRAC_PI_2,
            0.0,
        );
        assert_relative_eq!(local, Vector2::new(0.0, -1.0), epsilon = 1e-12);
    }

    proptest! {
        #[test]
        fn prop_local_frame_round_trip(
            ax in -5.0..5.0f64, ay in -5.0..5.0f64,
            bx in -5.0..5.0f64, by in -5.0..5.0f64,
            vx in -2.0..2.0f64, vy in -2.0..2.0f64,
            angle_a in -PI..PI, angle_b in -PI..PI,
        ) {
            let (oa, ob, v) = (Vector2::new(ax, ay), Vector2::new(bx, by), Vector2::new(vx, vy));
            let in_a = to_local_frame(&oa, &ob, &v, angle_a, angle_b);
            let back = to_local_frame(&ob, &oa, &in_a, angle_b, angle_a);
            prop_assert!((back - v).norm() < 1e-9);
        }
    }
}
