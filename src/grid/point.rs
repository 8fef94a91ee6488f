//! Grid points and boundary links.

use nalgebra::{Point3, Vector3};

use crate::mesh::HalfEdgeId;

/// Weak reference from a grid boundary point to the coincident point on an
/// adjacent grid.
///
/// A link never owns its target. If the target grid is rebuilt or removed the
/// lookup simply fails and the link is refreshed on the next neighbor pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryLink {
    /// Loop owning the target grid.
    pub grid: HalfEdgeId,

    /// Point index in the target grid.
    pub point: usize,

    /// For T-junctions: a second target point and the blend factor toward it.
    ///
    /// The linked position is `lerp(point, second.0, second.1)`.
    pub blend: Option<(usize, f64)>,
}

impl BoundaryLink {
    /// Link to a single coincident point.
    pub fn exact(grid: HalfEdgeId, point: usize) -> Self {
        Self {
            grid,
            point,
            blend: None,
        }
    }

    /// Link to a position interpolated between two points of the target grid.
    pub fn between(grid: HalfEdgeId, a: usize, b: usize, t: f64) -> Self {
        Self {
            grid,
            point: a,
            blend: Some((b, t)),
        }
    }

    /// Whether the link points to a single point rather than a blend of two.
    pub fn is_exact(&self) -> bool {
        self.blend.is_none()
    }

    /// Resolve the linked position against the target grid's points.
    ///
    /// Returns `None` if the link is stale.
    pub fn resolve(&self, points: &[GridPoint]) -> Option<Point3<f64>> {
        let a = points.get(self.point)?.co;
        match self.blend {
            None => Some(a),
            Some((second, t)) => {
                let b = points.get(second)?.co;
                Some(a + (b - a) * t)
            }
        }
    }
}

/// A single sample of a grid: position, normal, parametric coordinate, and an
/// optional link across the grid boundary.
///
/// Custom attribute values live in the owning grid's
/// [`GridAttributes`](super::GridAttributes), indexed by the point index.
#[derive(Debug, Clone, PartialEq)]
pub struct GridPoint {
    /// Position.
    pub co: Point3<f64>,

    /// Unit normal (zero until normals are computed).
    pub no: Vector3<f64>,

    /// Parametric coordinate within the face corner, `[0, 1]^2`.
    pub uv: [f64; 2],

    /// Link to the coincident point on an adjacent grid.
    pub link: Option<BoundaryLink>,

    /// Set while the point lies below a depth limit. `co` then holds the
    /// point's offset in the tangent frame of the coarser surface around it,
    /// not a position.
    pub hidden: bool,
}

impl GridPoint {
    /// Create a point with a zero normal and no link.
    pub fn new(co: Point3<f64>, uv: [f64; 2]) -> Self {
        Self {
            co,
            no: Vector3::zeros(),
            uv,
            link: None,
            hidden: false,
        }
    }
}

impl Default for GridPoint {
    fn default() -> Self {
        Self::new(Point3::origin(), [0.0, 0.0])
    }
}
