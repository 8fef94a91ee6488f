//! Orthonormal frames on a patch surface.

use nalgebra::{Matrix4, Point3, Vector3};

const DEGENERATE: f64 = 1e-12;

/// Position plus right-handed tangent, bitangent and normal axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TangentFrame {
    /// Surface point.
    pub origin: Point3<f64>,
    /// Unit `u` direction.
    pub tangent: Vector3<f64>,
    /// `normal x tangent`.
    pub bitangent: Vector3<f64>,
    /// Unit `dv x du`.
    pub normal: Vector3<f64>,
}

impl TangentFrame {
    /// World axes at `origin`.
    pub fn identity(origin: Point3<f64>) -> Self {
        Self {
            origin,
            tangent: Vector3::x(),
            bitangent: Vector3::y(),
            normal: Vector3::z(),
        }
    }

    /// Frame from a point and its partial derivatives.
    ///
    /// Falls back to [`TangentFrame::identity`] when either derivative
    /// vanishes or they are parallel.
    pub fn from_derivatives(origin: Point3<f64>, du: Vector3<f64>, dv: Vector3<f64>) -> Self {
        if du.norm() < DEGENERATE || dv.norm() < DEGENERATE {
            log::warn!(
                "degenerate patch derivatives at {:?} (|du| = {:e}, |dv| = {:e})",
                origin,
                du.norm(),
                dv.norm()
            );
            return Self::identity(origin);
        }
        let (Some(tangent), Some(normal)) = (
            du.try_normalize(DEGENERATE),
            dv.cross(&du).try_normalize(DEGENERATE),
        ) else {
            log::warn!("parallel patch derivatives at {:?}", origin);
            return Self::identity(origin);
        };
        Self {
            origin,
            tangent,
            bitangent: normal.cross(&tangent),
            normal,
        }
    }

    /// Homogeneous matrix with columns tangent, bitangent, normal, origin.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 1>(0, 0).copy_from(&self.tangent);
        m.fixed_view_mut::<3, 1>(0, 1).copy_from(&self.bitangent);
        m.fixed_view_mut::<3, 1>(0, 2).copy_from(&self.normal);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.origin.coords);
        m
    }

    /// Express a world point in frame coordinates.
    pub fn to_local(&self, p: &Point3<f64>) -> Vector3<f64> {
        let d = p - self.origin;
        Vector3::new(d.dot(&self.tangent), d.dot(&self.bitangent), d.dot(&self.normal))
    }

    /// Map frame coordinates back to a world point.
    pub fn to_global(&self, local: &Vector3<f64>) -> Point3<f64> {
        self.origin + self.tangent * local.x + self.bitangent * local.y + self.normal * local.z
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_frame_axes() {
        // dv x du = -z for du = x, dv = y
        let frame = TangentFrame::from_derivatives(Point3::origin(), Vector3::x() * 2.0, Vector3::y());
        assert_relative_eq!(frame.tangent, Vector3::x());
        assert_relative_eq!(frame.normal, -Vector3::z());
        assert_relative_eq!(frame.bitangent, frame.normal.cross(&frame.tangent));
        assert_relative_eq!(frame.tangent.cross(&frame.bitangent), frame.normal);
    }

    #[test]
    fn test_local_global_roundtrip() {
        let frame = TangentFrame::from_derivatives(
            Point3::new(1.0, 2.0, 3.0),
            Vector3::new(1.0, 1.0, 0.0),
            Vector3::new(-1.0, 1.0, 0.5),
        );
        let p = Point3::new(-0.5, 4.0, 2.25);
        let local = frame.to_local(&p);
        assert_relative_eq!(frame.to_global(&local), p, epsilon = 1e-12);

        let m = frame.to_matrix();
        let h = m * local.push(1.0);
        assert_relative_eq!(Point3::from(h.xyz()), p, epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_falls_back() {
        let o = Point3::new(0.0, 1.0, 0.0);
        assert_eq!(
            TangentFrame::from_derivatives(o, Vector3::zeros(), Vector3::y()),
            TangentFrame::identity(o)
        );
        assert_eq!(
            TangentFrame::from_derivatives(o, Vector3::x(), Vector3::x() * 3.0),
            TangentFrame::identity(o)
        );
    }
}
