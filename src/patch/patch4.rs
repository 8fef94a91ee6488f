//! Composite patch over one coarse face corner.

use std::sync::Arc;

use nalgebra::{Matrix4, Point3};

use super::cubic::{CubicPatch, PatchSample};
use super::frame::TangentFrame;

/// Four sub-patches covering the unit square of a coarse loop.
///
/// One Catmull-Clark step splits the coarse corner quad into four refined
/// corners. Sub-patch `a` sits at the coarse vertex, `b` at the edge point
/// toward the coarse `next`, `c` at the face point and `d` at the edge point
/// toward the coarse `prev`. Each is addressed in its own loop's
/// parameterization, so the incoming `(u, v)` is rotated into the quadrant
/// and the derivatives rotated back.
///
/// Sub-patches are shared with the [`Patches`](super::Patches) store and
/// can be referenced by several composites.
#[derive(Debug, Clone)]
pub struct Patch4 {
    quads: [Arc<CubicPatch>; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quadrant {
    A,
    B,
    C,
    D,
}

fn route(u: f64, v: f64) -> (Quadrant, f64, f64) {
    match (u > 0.5, v > 0.5) {
        (true, true) => (Quadrant::A, 2.0 * u - 1.0, 2.0 * v - 1.0),
        (true, false) => (Quadrant::B, 1.0 - 2.0 * v, 2.0 * u - 1.0),
        (false, false) => (Quadrant::C, 1.0 - 2.0 * u, 1.0 - 2.0 * v),
        (false, true) => (Quadrant::D, 2.0 * v - 1.0, 1.0 - 2.0 * u),
    }
}

impl Patch4 {
    /// Composite from sub-patches in `a`, `b`, `c`, `d` order.
    pub fn new(quads: [Arc<CubicPatch>; 4]) -> Self {
        Self { quads }
    }

    /// Sub-patch `i` in `a`, `b`, `c`, `d` order.
    pub fn sub_patch(&self, i: usize) -> Option<&CubicPatch> {
        self.quads.get(i).map(Arc::as_ref)
    }

    fn quadrant(&self, q: Quadrant) -> &CubicPatch {
        match q {
            Quadrant::A => &self.quads[0],
            Quadrant::B => &self.quads[1],
            Quadrant::C => &self.quads[2],
            Quadrant::D => &self.quads[3],
        }
    }

    /// Surface point at `(u, v)`.
    pub fn evaluate(&self, u: f64, v: f64) -> Point3<f64> {
        let (q, s, t) = route(u, v);
        self.quadrant(q).evaluate(s, t)
    }

    /// Point, derivatives and normal at `(u, v)`, with derivatives taken
    /// with respect to the coarse `u` and `v`.
    pub fn evaluate_full(&self, u: f64, v: f64) -> PatchSample {
        let (q, s, t) = route(u, v);
        let local = self.quadrant(q).evaluate_full(s, t);
        let (ps, pt) = (local.du * 2.0, local.dv * 2.0);
        let (du, dv) = match q {
            Quadrant::A => (ps, pt),
            Quadrant::B => (pt, -ps),
            Quadrant::C => (-ps, -pt),
            Quadrant::D => (-pt, ps),
        };
        PatchSample::new(local.position, du, dv)
    }

    /// Orthonormal frame at `(u, v)`.
    pub fn tangent_frame(&self, u: f64, v: f64) -> TangentFrame {
        let s = self.evaluate_full(u, v);
        TangentFrame::from_derivatives(s.position, s.du, s.dv)
    }

    /// Frame at `(u, v)` as a homogeneous matrix.
    pub fn tangent_matrix(&self, u: f64, v: f64) -> Matrix4<f64> {
        self.tangent_frame(u, v).to_matrix()
    }
}
