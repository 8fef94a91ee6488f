//! Bicubic control nets.

use nalgebra::{Point3, Vector3};

use super::basis::Basis;
use super::frame::TangentFrame;

/// How a patch was built, which fixes the basis it is evaluated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    /// Around a valence-4 interior vertex; the 4x4 net is a piece of a
    /// uniform B-spline lattice.
    Regular,
    /// Around an extraordinary or boundary vertex; the net holds Bezier
    /// control points.
    Extraordinary,
}

impl PatchKind {
    /// Basis the control net is evaluated with.
    pub fn basis(self) -> Basis {
        match self {
            PatchKind::Regular => Basis::BSpline,
            PatchKind::Extraordinary => Basis::Bernstein,
        }
    }
}

/// Position, partial derivatives and unit normal at one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatchSample {
    /// Surface point.
    pub position: Point3<f64>,
    /// Derivative along `u`.
    pub du: Vector3<f64>,
    /// Derivative along `v`.
    pub dv: Vector3<f64>,
    /// Normalized `dv x du`, zero when the derivatives are parallel.
    pub normal: Vector3<f64>,
}

/// A 4x4 control net. Control point `(x, y)` is stored at `y * 4 + x` and
/// `u` runs along `x`.
#[derive(Debug, Clone, PartialEq)]
pub struct CubicPatch {
    kind: PatchKind,
    points: [Point3<f64>; 16],
}

impl CubicPatch {
    /// Patch from an explicit control net.
    pub fn new(kind: PatchKind, points: [Point3<f64>; 16]) -> Self {
        Self { kind, points }
    }

    /// Extraordinary patch whose net repeats each quad corner over the 2x2
    /// block nearest to it, with the quad itself in the center block.
    ///
    /// `quad` is in `(0,0)`, `(0,1)`, `(1,1)`, `(1,0)` order.
    pub fn blocky(quad: &[Point3<f64>; 4]) -> Self {
        let mut points = [Point3::origin(); 16];
        for y in 0..4 {
            for x in 0..4 {
                let corner = match (x >= 2, y >= 2) {
                    (false, false) => 0,
                    (false, true) => 1,
                    (true, true) => 2,
                    (true, false) => 3,
                };
                points[y * 4 + x] = quad[corner];
            }
        }
        Self {
            kind: PatchKind::Extraordinary,
            points,
        }
    }

    /// How the patch was built.
    pub fn kind(&self) -> PatchKind {
        self.kind
    }

    /// Control point at column `x`, row `y`.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Point3<f64> {
        self.points[y * 4 + x]
    }

    /// Replace control point `(x, y)`.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, p: Point3<f64>) {
        self.points[y * 4 + x] = p;
    }

    /// The control net in row-major order.
    pub fn points(&self) -> &[Point3<f64>; 16] {
        &self.points
    }

    fn blend(&self, wu: &[f64; 4], wv: &[f64; 4]) -> Vector3<f64> {
        let mut sum = Vector3::zeros();
        for (y, &b) in wv.iter().enumerate() {
            for (x, &a) in wu.iter().enumerate() {
                sum += self.points[y * 4 + x].coords * (a * b);
            }
        }
        sum
    }

    /// Surface point at `(u, v)` in `[0, 1]^2`.
    pub fn evaluate(&self, u: f64, v: f64) -> Point3<f64> {
        let basis = self.kind.basis();
        Point3::from(self.blend(&basis.weights(u), &basis.weights(v)))
    }

    /// Point, derivatives and normal at `(u, v)`.
    pub fn evaluate_full(&self, u: f64, v: f64) -> PatchSample {
        let basis = self.kind.basis();
        let (wu, wv) = (basis.weights(u), basis.weights(v));
        let (du, dv) = (basis.derivatives(u), basis.derivatives(v));

        PatchSample::new(
            Point3::from(self.blend(&wu, &wv)),
            self.blend(&du, &wv),
            self.blend(&wu, &dv),
        )
    }

    /// Orthonormal frame at `(u, v)`.
    pub fn tangent_frame(&self, u: f64, v: f64) -> TangentFrame {
        let s = self.evaluate_full(u, v);
        TangentFrame::from_derivatives(s.position, s.du, s.dv)
    }
}

impl PatchSample {
    /// Sample from a point and its derivatives.
    pub fn new(position: Point3<f64>, du: Vector3<f64>, dv: Vector3<f64>) -> Self {
        Self {
            position,
            du,
            dv,
            normal: dv.cross(&du).try_normalize(1e-12).unwrap_or_else(Vector3::zeros),
        }
    }
}
