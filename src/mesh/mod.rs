//! Core mesh data structures.
//!
//! This module provides the half-edge mesh representation that the grid engine
//! reads its topology from.
//!
//! # Overview
//!
//! [`HalfEdgeMesh`] represents a polygon mesh using a half-edge (doubly-connected
//! edge list) data structure. Grids attach to *loops*: half-edges that belong to a
//! face, one per face corner. The grid engine only reads loop adjacency
//! (`next`, `prev`, [`HalfEdgeMesh::radial_next`]), vertex positions and face
//! centroids; it never mutates topology.
//!
//! # Construction
//!
//! ```
//! use multires::mesh::build_from_quads;
//! use nalgebra::Point3;
//!
//! let vertices = vec![
//!     Point3::new(0.0, 0.0, 0.0),
//!     Point3::new(1.0, 0.0, 0.0),
//!     Point3::new(1.0, 1.0, 0.0),
//!     Point3::new(0.0, 1.0, 0.0),
//! ];
//! let mesh = build_from_quads(&vertices, &[[0, 1, 2, 3]]).unwrap();
//! assert_eq!(mesh.loop_ids().count(), 4);
//! ```

mod builder;
mod halfedge;
mod index;

pub use builder::{build_from_polygons, build_from_quads, build_from_triangles, to_polygons};
pub use halfedge::{Face, FaceHalfEdgeIter, HalfEdge, HalfEdgeMesh, Vertex, VertexHalfEdgeIter};
pub use index::{FaceId, HalfEdgeId, VertexId};

#[cfg(test)]
pub(crate) mod fixtures {
    //! Small meshes shared by tests across the crate.

    use nalgebra::Point3;

    use super::{build_from_polygons, build_from_quads, HalfEdgeMesh};

    /// Flat `n x n` grid of unit quads in the XY plane, counter-clockwise.
    pub fn flat_grid(n: usize) -> HalfEdgeMesh {
        let mut vertices = Vec::with_capacity((n + 1) * (n + 1));
        for j in 0..=n {
            for i in 0..=n {
                vertices.push(Point3::new(i as f64, j as f64, 0.0));
            }
        }
        let mut faces = Vec::with_capacity(n * n);
        for j in 0..n {
            for i in 0..n {
                let v00 = j * (n + 1) + i;
                faces.push([v00, v00 + 1, v00 + n + 2, v00 + n + 1]);
            }
        }
        build_from_quads(&vertices, &faces).unwrap()
    }

    /// Closed quad torus; every vertex has valence 4.
    pub fn torus(nu: usize, nv: usize, major: f64, minor: f64) -> HalfEdgeMesh {
        let mut vertices = Vec::with_capacity(nu * nv);
        for j in 0..nv {
            let phi = j as f64 / nv as f64 * std::f64::consts::TAU;
            for i in 0..nu {
                let theta = i as f64 / nu as f64 * std::f64::consts::TAU;
                let r = major + minor * phi.cos();
                vertices.push(Point3::new(r * theta.cos(), r * theta.sin(), minor * phi.sin()));
            }
        }
        let idx = |i: usize, j: usize| (j % nv) * nu + (i % nu);
        let mut faces = Vec::with_capacity(nu * nv);
        for j in 0..nv {
            for i in 0..nu {
                faces.push([idx(i, j), idx(i + 1, j), idx(i + 1, j + 1), idx(i, j + 1)]);
            }
        }
        build_from_quads(&vertices, &faces).unwrap()
    }

    /// Closed unit cube made of six quads; every vertex has valence 3.
    pub fn cube() -> HalfEdgeMesh {
        let vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(1.0, 0.0, 1.0),
            Point3::new(1.0, 1.0, 1.0),
            Point3::new(0.0, 1.0, 1.0),
        ];
        let faces = vec![
            [0, 3, 2, 1],
            [4, 5, 6, 7],
            [0, 1, 5, 4],
            [2, 3, 7, 6],
            [0, 4, 7, 3],
            [1, 2, 6, 5],
        ];
        build_from_quads(&vertices, &faces).unwrap()
    }

    /// A quad next to a triangle, sharing edge 1-2.
    pub fn quad_and_triangle() -> HalfEdgeMesh {
        let vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(2.0, 0.5, 0.0),
        ];
        let faces: Vec<Vec<usize>> = vec![vec![0, 1, 2, 3], vec![1, 4, 2]];
        build_from_polygons(&vertices, &faces).unwrap()
    }
}
