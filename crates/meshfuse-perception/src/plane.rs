//! Least-squares plane fitting.
//!
//! The plane through a set of points minimising the sum of squared distances
//! passes through their centroid; its normal is the eigenvector of the
//! covariance matrix with the smallest eigenvalue.

use nalgebra::{Matrix3, Point3, Unit, Vector3};

/// Result of [`fit_plane`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneFit {
    pub centroid: Point3<f64>,
    pub normal: Unit<Vector3<f64>>,
    /// Covariance eigenvalues in ascending order. The first is the residual
    /// variance along the normal.
    pub eigenvalues: [f64; 3],
}

impl PlaneFit {
    /// Index (0 = x, 1 = y, 2 = z) of the axis the normal is most aligned with.
    pub fn dominant_axis(&self) -> usize {
        dominant_axis(&self.normal)
    }
}

/// Axis of the largest absolute component; ties resolve towards z.
pub fn dominant_axis(v: &Vector3<f64>) -> usize {
    let a = v.abs();
    if a.z >= a.x && a.z >= a.y {
        2
    } else if a.y >= a.x {
        1
    } else {
        0
    }
}

/// Fit a plane to `points`.
///
/// Returns `None` for fewer than three points, non-finite input, or a
/// neighbourhood with no spread in at least two directions (coincident or
/// collinear points), where the normal is undefined.
pub fn fit_plane<I>(points: I) -> Option<PlaneFit>
where
    I: IntoIterator<Item = Point3<f64>>,
{
    let points: Vec<Point3<f64>> = points.into_iter().collect();
    if points.len() < 3 {
        return None;
    }

    let n = points.len() as f64;
    let centroid = Point3::from(points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n);

    let covariance = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = *p - centroid;
        acc + d * d.transpose()
    }) / n;
    if !covariance.iter().all(|c| c.is_finite()) {
        return None;
    }

    let eigen = covariance.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    let eigenvalues = order.map(|i| eigen.eigenvalues[i].max(0.0));

    // Spread along the second axis must be meaningful relative to the largest.
    if eigenvalues[2] <= f64::EPSILON || eigenvalues[1] <= eigenvalues[2] * 1e-10 {
        return None;
    }

    let normal = Unit::try_new(eigen.eigenvectors.column(order[0]).into_owned(), 1e-12)?;
    Some(PlaneFit {
        centroid,
        normal,
        eigenvalues,
    })
}
