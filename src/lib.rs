//! # Multires
//!
//! Adaptive multiresolution grids on top of a polygon half-edge mesh.
//!
//! Every face corner (a *loop*) of a coarse cage owns a grid of points that
//! covers one quarter of its face. Grids come in two flavors:
//!
//! - [`UniformGrid`](grid::UniformGrid): a dense `dimension x dimension` lattice;
//! - [`QuadTreeGrid`](grid::QuadTreeGrid): an adaptive quadtree whose leaves can
//!   be refined and collapsed independently.
//!
//! Neighboring grids are welded along shared boundaries, and their points can
//! be projected onto a smooth limit surface built from bicubic patches.
//!
//! ## Features
//!
//! - **Half-edge data structure**: polygon faces with O(1) corner adjacency
//! - **Grid stitching**: boundary points linked across corners, edges and poles
//! - **Limit patches**: Catmull-Clark based bicubic patches with tangent frames
//! - **Multiple file formats**: OBJ, STL, PLY
//!
//! ## Quick Start
//!
//! ```no_run
//! use multires::prelude::*;
//!
//! let mesh = multires::io::load("cage.obj").unwrap();
//!
//! let mut multires = MultiresMesh::<QuadTreeGrid>::new(mesh, 9).unwrap();
//! multires.init_grids().unwrap();
//! multires.reproject().unwrap();
//!
//! let (positions, triangles) = multires.tessellate();
//! multires::io::save_triangles(&positions, &triangles, "limit.stl").unwrap();
//! ```
//!
//! ## Building Meshes Programmatically
//!
//! ```
//! use multires::prelude::*;
//! use nalgebra::Point3;
//!
//! let vertices = vec![
//!     Point3::new(0.0, 0.0, 0.0),
//!     Point3::new(1.0, 0.0, 0.0),
//!     Point3::new(1.0, 1.0, 0.0),
//!     Point3::new(0.0, 1.0, 0.0),
//! ];
//! let faces = vec![[0, 1, 2, 3]];
//!
//! let mesh = build_from_quads(&vertices, &faces).unwrap();
//! assert_eq!(mesh.num_faces(), 1);
//! assert_eq!(mesh.loop_ids().count(), 4);
//!
//! let mut multires = MultiresMesh::<UniformGrid>::new(mesh, 5).unwrap();
//! multires.init_grids().unwrap();
//! assert_eq!(multires.grids().count(), 4);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod algo;
pub mod error;
pub mod grid;
pub mod io;
pub mod mesh;
pub mod multires;
pub mod patch;

/// Prelude module for convenient imports.
///
/// This module re-exports the most commonly used types and functions:
///
/// ```
/// use multires::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{MeshError, Result};
    pub use crate::grid::{Grid, GridSettings, QuadTreeGrid, UniformGrid};
    pub use crate::mesh::{
        build_from_polygons, build_from_quads, build_from_triangles, to_polygons, Face, FaceId,
        HalfEdge, HalfEdgeId, HalfEdgeMesh, Vertex, VertexId,
    };
    pub use crate::multires::MultiresMesh;
    pub use crate::patch::{Patch4, PatchBuilder, PatchOptions, TangentFrame};
}

// Re-export nalgebra types for convenience
pub use nalgebra;
