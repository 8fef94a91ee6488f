//! Per-loop multiresolution grids.
//!
//! Every face corner (loop) of the coarse mesh owns one grid covering the
//! quad spanned by the face center, the two adjacent edge midpoints and the
//! loop's vertex:
//!
//! | uv       | corner                          |
//! |----------|---------------------------------|
//! | `(0, 0)` | face centroid                   |
//! | `(1, 0)` | midpoint of the edge to `next`  |
//! | `(1, 1)` | the loop's vertex               |
//! | `(0, 1)` | midpoint of the edge to `prev`  |
//!
//! Two grid flavors share the [`Grid`] trait: [`UniformGrid`] stores a fixed
//! `N x N` array, [`QuadTreeGrid`] refines adaptively.

mod customdata;
mod neighbor;
mod point;
pub mod quadtree;
mod uniform;

pub use customdata::{AttrKind, CustomData, GridAttributes, GridLayer, Layer};
pub use neighbor::{
    BoundaryMap, Coord, LoopRelations, NeighborKey, NeighborResolver, Side, VertexCase,
};
pub use point::{BoundaryLink, GridPoint};
pub use quadtree::QuadTreeGrid;
pub use uniform::{UniformGrid, UniformGridRecord};

use bitflags::bitflags;
use nalgebra::Point3;

use crate::error::{MeshError, Result};
use crate::mesh::{HalfEdgeId, HalfEdgeMesh};

/// Largest depth limit accepted by [`GridSettings`].
pub const MAX_DEPTH_LIMIT: u32 = 10;

/// Settings shared by every grid of a mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSettings {
    /// Deepest quadtree level treated as a leaf when the limit is enabled.
    pub depth_limit: u32,

    /// Whether `depth_limit` applies.
    pub depth_limit_enabled: bool,

    /// Whether to use parallel execution (default: true).
    pub parallel: bool,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            depth_limit: MAX_DEPTH_LIMIT,
            depth_limit_enabled: false,
            parallel: true,
        }
    }
}

impl GridSettings {
    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the depth limit (clamped to [`MAX_DEPTH_LIMIT`]).
    pub fn with_depth_limit(mut self, depth: u32) -> Self {
        self.depth_limit = depth.min(MAX_DEPTH_LIMIT);
        self.depth_limit_enabled = true;
        self
    }

    /// Set whether to use parallel execution.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Create settings for single-threaded execution.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// The active depth limit, if any.
    pub fn effective_depth_limit(&self) -> Option<u32> {
        self.depth_limit_enabled.then_some(self.depth_limit)
    }
}

bitflags! {
    /// Work a grid still has to do before its caches can be read.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RecalcFlags: u8 {
        /// Triangle list.
        const POLYS = 1;
        /// Vertex/edge graph and UV hash.
        const TOPO = 2;
        /// Boundary links to adjacent grids.
        const NEIGHBORS = 4;
        /// Point normals.
        const NORMALS = 8;
        /// Everything.
        const ALL = Self::POLYS.bits() | Self::TOPO.bits() | Self::NEIGHBORS.bits() | Self::NORMALS.bits();
    }
}

/// Identifies the mesh state a grid cache was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CacheKey {
    /// Mesh update generation.
    pub generation: u64,
    /// Active custom-data layer.
    pub active_layer: Option<usize>,
}

/// Pending work and the key the caches were last built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GridCache {
    pending: RecalcFlags,
    key: Option<CacheKey>,
}

impl GridCache {
    /// Queue work.
    pub fn flag(&mut self, flags: RecalcFlags) {
        self.pending |= flags;
    }

    /// Work queued so far.
    pub fn pending(&self) -> RecalcFlags {
        self.pending
    }

    /// Take the queued work for `key`. A key change queues everything.
    pub fn refresh(&mut self, key: CacheKey) -> RecalcFlags {
        if self.key != Some(key) {
            self.pending = RecalcFlags::ALL;
            self.key = Some(key);
        }
        std::mem::take(&mut self.pending)
    }
}

/// The four corners of a loop's grid quad, plus the loops that feed their
/// custom data.
#[derive(Debug, Clone)]
pub struct LoopQuad {
    /// Corners in `(0,0)`, `(0,1)`, `(1,1)`, `(1,0)` order.
    pub corners: [Point3<f64>; 4],
    face_loops: Vec<usize>,
    l: usize,
    prev: usize,
    next: usize,
}

impl LoopQuad {
    /// Corner quad of a loop using raw vertex positions.
    pub fn new(mesh: &HalfEdgeMesh, l: HalfEdgeId) -> Result<Self> {
        if !mesh.is_loop(l) {
            return Err(MeshError::invalid_param("loop", l.index(), "half-edge has no face"));
        }
        let prev = mesh.prev(l);
        let next = mesh.next(l);
        let face = mesh.face_of(l);

        Ok(Self {
            corners: [
                mesh.face_centroid(face),
                mesh.edge_midpoint(prev),
                *mesh.position(mesh.loop_vertex(l)),
                mesh.edge_midpoint(l),
            ],
            face_loops: mesh.face_halfedges(face).map(|he| he.index()).collect(),
            l: l.index(),
            prev: prev.index(),
            next: next.index(),
        })
    }

    /// Bilinear position at `(u, v)`.
    pub fn eval(&self, u: f64, v: f64) -> Point3<f64> {
        bilinear(&self.corners, u, v)
    }

    /// Mesh loops and weights whose custom data blends to the value at `(u, v)`.
    pub fn loop_weights(&self, u: f64, v: f64) -> (Vec<usize>, Vec<f64>) {
        let w = corner_weights(u, v);
        let n = self.face_loops.len() as f64;

        let mut loops = Vec::with_capacity(self.face_loops.len() + 3);
        let mut weights = Vec::with_capacity(self.face_loops.len() + 3);
        let mut add = |l: usize, weight: f64| {
            if let Some(i) = loops.iter().position(|&x| x == l) {
                weights[i] += weight;
            } else {
                loops.push(l);
                weights.push(weight);
            }
        };

        for &fl in &self.face_loops {
            add(fl, w[0] / n);
        }
        add(self.l, w[1] * 0.5 + w[2] + w[3] * 0.5);
        add(self.prev, w[1] * 0.5);
        add(self.next, w[3] * 0.5);
        (loops, weights)
    }
}

/// Bilinear weights of corners `(0,0)`, `(0,1)`, `(1,1)`, `(1,0)` at `(u, v)`.
pub fn corner_weights(u: f64, v: f64) -> [f64; 4] {
    [(1.0 - u) * (1.0 - v), (1.0 - u) * v, u * v, u * (1.0 - v)]
}

/// Bilinear interpolation over corners in `(0,0)`, `(0,1)`, `(1,1)`, `(1,0)` order.
pub fn bilinear(c: &[Point3<f64>; 4], u: f64, v: f64) -> Point3<f64> {
    let a = c[0] + (c[1] - c[0]) * v;
    let b = c[3] + (c[2] - c[3]) * v;
    a + (b - a) * u
}

/// Check that a grid dimension has the form `2^k + 1`.
pub fn check_dimension(dimension: usize) -> Result<u32> {
    if dimension < 2 || !(dimension - 1).is_power_of_two() {
        return Err(MeshError::invalid_param(
            "dimension",
            dimension,
            "must be 2^k + 1",
        ));
    }
    Ok((dimension - 1).trailing_zeros())
}

/// Operations shared by uniform and adaptive grids.
pub trait Grid: Clone + Default + Send + Sync {
    /// (Re)build the grid from the loop's corner quad.
    ///
    /// Calling this twice with the same dimension on an unchanged loop yields
    /// identical points.
    fn init(
        &mut self,
        mesh: &HalfEdgeMesh,
        l: HalfEdgeId,
        dimension: usize,
        cd: &CustomData,
    ) -> Result<()>;

    /// Side length the grid was initialized with.
    fn dimension(&self) -> usize;

    /// All points.
    fn points(&self) -> &[GridPoint];

    /// All points, mutably.
    fn points_mut(&mut self) -> &mut [GridPoint];

    /// Per-point attributes.
    fn attributes(&self) -> &GridAttributes;

    /// Per-point attributes, mutably.
    fn attributes_mut(&mut self) -> &mut GridAttributes;

    /// Point at the loop's vertex corner `(1, 1)`.
    fn vertex_corner(&self) -> Option<usize>;

    /// Triangles over the points, rebuilt if stale.
    fn triangles(&mut self) -> &[[usize; 3]];

    /// Recompute point normals from the current positions.
    fn recalc_normals(&mut self);

    /// Link the points on one boundary line to the matching points of `other`.
    ///
    /// Returns the number of links set.
    fn link_boundary(&mut self, map: &BoundaryMap, other_loop: HalfEdgeId, other: &Self) -> usize;

    /// Apply mesh-wide settings. Grids that do not depend on them ignore this.
    fn apply_settings(&mut self, _settings: &GridSettings) {}

    /// Queue recalculation work.
    fn flag(&mut self, flags: RecalcFlags);

    /// Flush queued work for `key`.
    ///
    /// Returns the flags the grid cannot handle on its own (neighbor links need
    /// the adjacent grids).
    fn update(&mut self, key: CacheKey) -> RecalcFlags;

    /// Drop every boundary link.
    fn clear_links(&mut self) {
        for p in self.points_mut() {
            p.link = None;
        }
    }

    /// Re-associate attribute layers with the mesh layers after loading.
    fn relink_custom_data(&mut self, cd: &CustomData) {
        self.attributes_mut().relink(cd);
    }
}
