//! Cubic basis functions.

/// Basis used to blend a 4x4 control net.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Basis {
    /// Uniform cubic B-spline. Approximating; adjacent patches on a regular
    /// lattice join with C2 continuity.
    BSpline,
    /// Cubic Bernstein (Bezier). Interpolates the corner control points.
    Bernstein,
}

impl Basis {
    /// The four weights at `t`.
    #[inline]
    pub fn weights(self, t: f64) -> [f64; 4] {
        let s = 1.0 - t;
        match self {
            Basis::BSpline => {
                let t2 = t * t;
                let t3 = t2 * t;
                [
                    s * s * s / 6.0,
                    (3.0 * t3 - 6.0 * t2 + 4.0) / 6.0,
                    (-3.0 * t3 + 3.0 * t2 + 3.0 * t + 1.0) / 6.0,
                    t3 / 6.0,
                ]
            }
            Basis::Bernstein => [s * s * s, 3.0 * t * s * s, 3.0 * t * t * s, t * t * t],
        }
    }

    /// Derivatives of the four weights at `t`.
    #[inline]
    pub fn derivatives(self, t: f64) -> [f64; 4] {
        let s = 1.0 - t;
        match self {
            Basis::BSpline => [
                -s * s / 2.0,
                (3.0 * t * t - 4.0 * t) / 2.0,
                (-3.0 * t * t + 2.0 * t + 1.0) / 2.0,
                t * t / 2.0,
            ],
            Basis::Bernstein => [
                -3.0 * s * s,
                3.0 * s * s - 6.0 * t * s,
                6.0 * t * s - 3.0 * t * t,
                3.0 * t * t,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_partition_of_unity() {
        for basis in [Basis::BSpline, Basis::Bernstein] {
            for i in 0..=10 {
                let t = i as f64 / 10.0;
                assert_relative_eq!(basis.weights(t).iter().sum::<f64>(), 1.0, epsilon = 1e-12);
                assert_relative_eq!(basis.derivatives(t).iter().sum::<f64>(), 0.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_derivatives_match_finite_differences() {
        let h = 1e-6;
        for basis in [Basis::BSpline, Basis::Bernstein] {
            let t = 0.37;
            let (a, b) = (basis.weights(t - h), basis.weights(t + h));
            let d = basis.derivatives(t);
            for k in 0..4 {
                assert_relative_eq!((b[k] - a[k]) / (2.0 * h), d[k], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_endpoint_values() {
        assert_eq!(Basis::Bernstein.weights(0.0), [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(Basis::Bernstein.weights(1.0), [0.0, 0.0, 0.0, 1.0]);

        let w = Basis::BSpline.weights(0.0);
        assert_relative_eq!(w[0], 1.0 / 6.0);
        assert_relative_eq!(w[1], 4.0 / 6.0);
        assert_relative_eq!(w[2], 1.0 / 6.0);
        assert_relative_eq!(w[3], 0.0);
    }
}
