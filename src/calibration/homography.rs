// src/calibration/homography.rs
//
// Planar homography estimation for the table-to-camera mapping.
// Direct Linear Transform with Hartley normalization; four corner
// correspondences are enough for the table quad, but the estimator
// accepts any n >= 4.

use crate::error::PipelineError;
use crate::types::Point;
use nalgebra::{DMatrix, Matrix3, Vector3};

/// Project a 2D point through a 3x3 homography: H * [x, y, 1]^T -> [u, v].
pub fn project(h: &Matrix3<f64>, p: Point) -> Point {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    if v[2].abs() < 1e-15 {
        return Point::new(f64::NAN, f64::NAN);
    }
    Point::new(v[0] / v[2], v[1] / v[2])
}

/// Distance between project(H, src) and the expected destination.
pub fn reprojection_error(h: &Matrix3<f64>, src: Point, dst: Point) -> f64 {
    project(h, src).distance_to(&dst)
}

/// Mean reprojection error across a set of correspondences.
pub fn mean_reprojection_error(h: &Matrix3<f64>, src: &[Point], dst: &[Point]) -> f64 {
    if src.is_empty() {
        return f64::INFINITY;
    }
    src.iter()
        .zip(dst)
        .map(|(s, d)| reprojection_error(h, *s, *d))
        .sum::<f64>()
        / src.len() as f64
}

/// Translate the centroid to the origin and scale so the mean distance
/// from the origin is sqrt(2). Keeps the DLT system well conditioned.
fn normalize_points(pts: &[Point]) -> (Matrix3<f64>, Vec<Point>) {
    let n = pts.len() as f64;
    let cx: f64 = pts.iter().map(|p| p.x).sum::<f64>() / n;
    let cy: f64 = pts.iter().map(|p| p.y).sum::<f64>() / n;

    let mean_dist: f64 = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized: Vec<Point> = pts
        .iter()
        .map(|p| Point::new(s * (p.x - cx), s * (p.y - cy)))
        .collect();

    (t, normalized)
}

/// Estimate the homography H such that dst ~= project(H, src).
///
/// The solution is the eigenvector of the smallest eigenvalue of the
/// 9x9 normal matrix A^T A, which sidesteps thin-SVD dimension issues.
pub fn estimate_homography(src: &[Point], dst: &[Point]) -> Result<Matrix3<f64>, PipelineError> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return Err(PipelineError::Calibration(format!(
            "homography needs >= 4 matched correspondences, got {} / {}",
            n,
            dst.len()
        )));
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    let mut a = DMatrix::zeros(2 * n, 9);
    for i in 0..n {
        let (sx, sy) = (src_n[i].x, src_n[i].y);
        let (dx, dy) = (dst_n[i].x, dst_n[i].y);

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    let ata = a.transpose() * &a;
    let eig = nalgebra::SymmetricEigen::new(ata);

    let mut min_idx = 0;
    let mut min_val = eig.eigenvalues[0].abs();
    for i in 1..9 {
        let v = eig.eigenvalues[i].abs();
        if v < min_val {
            min_val = v;
            min_idx = i;
        }
    }

    let h_vec: Vec<f64> = (0..9).map(|j| eig.eigenvectors[(j, min_idx)]).collect();
    let h_norm = Matrix3::new(
        h_vec[0], h_vec[1], h_vec[2], h_vec[3], h_vec[4], h_vec[5], h_vec[6], h_vec[7], h_vec[8],
    );

    let t_dst_inv = t_dst.try_inverse().ok_or_else(|| {
        PipelineError::Calibration("destination normalization not invertible".into())
    })?;
    let h = t_dst_inv * h_norm * t_src;

    // Normalize so h[2][2] = 1 when possible.
    let scale = h[(2, 2)];
    if scale.abs() < 1e-15 {
        Ok(h)
    } else {
        Ok(h / scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn make_test_homography() -> Matrix3<f64> {
        // Scale + translate + mild perspective, like an elevated broadcast camera.
        Matrix3::new(3.5, 0.1, 640.0, -0.05, 3.3, 480.0, 0.0001, -0.00005, 1.0)
    }

    #[test]
    fn test_exact_four_corner_fit() {
        let h_true = make_test_homography();
        let src = [
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            Point::new(100.0, 100.0),
            Point::new(0.0, 100.0),
        ];
        let dst: Vec<Point> = src.iter().map(|s| project(&h_true, *s)).collect();

        let h_est = estimate_homography(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            let err = reprojection_error(&h_est, *s, *d);
            assert!(err < 1e-6, "reprojection error too large: {err}");
        }
    }

    #[test]
    fn test_overdetermined_fit() {
        let h_true = make_test_homography();
        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..5 {
            for j in 0..5 {
                let s = Point::new(i as f64 * 20.0, j as f64 * 20.0);
                src.push(s);
                dst.push(project(&h_true, s));
            }
        }

        let h_est = estimate_homography(&src, &dst).unwrap();
        assert!(mean_reprojection_error(&h_est, &src, &dst) < 1e-6);
    }

    #[test]
    fn test_roundtrip_through_inverse() {
        let h = make_test_homography();
        let h_inv = h.try_inverse().unwrap();

        let p = Point::new(50.0, 75.0);
        let q = project(&h, p);
        let back = project(&h_inv, q);

        assert_relative_eq!(p.x, back.x, epsilon = 1e-8);
        assert_relative_eq!(p.y, back.y, epsilon = 1e-8);
    }

    #[test]
    fn test_too_few_points_rejected() {
        let pts = [Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(1.0, 1.0)];
        assert!(estimate_homography(&pts, &pts).is_err());
    }
}
