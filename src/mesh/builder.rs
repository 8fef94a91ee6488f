//! Mesh construction utilities.
//!
//! This module provides functions for building half-edge meshes from
//! face-vertex lists as commonly found in mesh file formats.
//!
//! Face half-edges are allocated face by face, corner by corner, so the `k`-th
//! corner of face `f` is always `face(f).halfedge` advanced `k` times with `next`.
//! Boundary half-edges are appended after every face half-edge.

use std::collections::HashMap;

use nalgebra::Point3;

use super::halfedge::{Face, HalfEdge, HalfEdgeMesh};
use super::index::{FaceId, HalfEdgeId, VertexId};
use crate::error::{MeshError, Result};

/// Build a half-edge mesh from vertices and polygon faces.
///
/// Faces are listed counter-clockwise and may have any number of corners (at
/// least three).
///
/// # Example
/// ```
/// use multires::mesh::build_from_polygons;
/// use nalgebra::Point3;
///
/// let vertices = vec![
///     Point3::new(0.0, 0.0, 0.0),
///     Point3::new(1.0, 0.0, 0.0),
///     Point3::new(1.0, 1.0, 0.0),
///     Point3::new(0.0, 1.0, 0.0),
///     Point3::new(2.0, 0.5, 0.0),
/// ];
/// let faces = vec![vec![0, 1, 2, 3], vec![1, 4, 2]];
///
/// let mesh = build_from_polygons(&vertices, &faces).unwrap();
/// assert_eq!(mesh.num_faces(), 2);
/// assert_eq!(mesh.loop_ids().count(), 7);
/// ```
pub fn build_from_polygons<F: AsRef<[usize]>>(
    vertices: &[Point3<f64>],
    faces: &[F],
) -> Result<HalfEdgeMesh> {
    if faces.is_empty() {
        return Err(MeshError::EmptyMesh);
    }

    let mut num_corners = 0;
    for (fi, face) in faces.iter().enumerate() {
        let face = face.as_ref();
        if face.len() < 3 {
            return Err(MeshError::DegenerateFace { face: fi });
        }
        for (k, &vi) in face.iter().enumerate() {
            if vi >= vertices.len() {
                return Err(MeshError::InvalidVertexIndex { face: fi, vertex: vi });
            }
            if face[k + 1..].contains(&vi) {
                return Err(MeshError::DegenerateFace { face: fi });
            }
        }
        num_corners += face.len();
    }

    let mut mesh = HalfEdgeMesh::with_capacity(vertices.len(), num_corners, faces.len());

    let vertex_ids: Vec<VertexId> = vertices.iter().map(|&pos| mesh.add_vertex(pos)).collect();

    // Directed edge (v0, v1) -> half-edge, used for twin linking
    let mut edge_map: HashMap<(usize, usize), HalfEdgeId> = HashMap::with_capacity(num_corners);
    let mut directed: Vec<(usize, usize)> = Vec::with_capacity(num_corners);

    for face in faces {
        let face = face.as_ref();
        let n = face.len();
        let first = mesh.num_halfedges();
        let face_id = FaceId::new(mesh.num_faces());
        mesh.faces.push(Face {
            halfedge: HalfEdgeId::new(first),
        });

        for k in 0..n {
            let v0 = face[k];
            let v1 = face[(k + 1) % n];
            let he = HalfEdgeId::new(first + k);
            mesh.halfedges.push(HalfEdge {
                origin: vertex_ids[v0],
                twin: HalfEdgeId::invalid(),
                next: HalfEdgeId::new(first + (k + 1) % n),
                prev: HalfEdgeId::new(first + (k + n - 1) % n),
                face: face_id,
            });
            mesh.vertex_mut(vertex_ids[v0]).halfedge = he;

            if edge_map.insert((v0, v1), he).is_some() {
                return Err(MeshError::NonManifoldEdge { v0, v1 });
            }
            directed.push((v0, v1));
        }
    }

    // Link twins; unmatched edges get a face-less boundary half-edge.
    // Iterate in insertion order so boundary ids are deterministic.
    for &(v0, v1) in &directed {
        let he = edge_map[&(v0, v1)];
        if mesh.twin(he).is_valid() {
            continue;
        }
        if let Some(&twin) = edge_map.get(&(v1, v0)) {
            mesh.halfedge_mut(he).twin = twin;
            mesh.halfedge_mut(twin).twin = he;
        } else {
            let boundary_he = HalfEdgeId::new(mesh.num_halfedges());
            mesh.halfedges.push(HalfEdge {
                origin: vertex_ids[v1],
                twin: he,
                ..HalfEdge::default()
            });
            mesh.halfedge_mut(he).twin = boundary_he;
        }
    }

    link_boundary_loops(&mut mesh);
    fix_boundary_vertex_halfedges(&mut mesh);

    Ok(mesh)
}

/// Build a half-edge mesh from vertices and triangle faces.
pub fn build_from_triangles(vertices: &[Point3<f64>], faces: &[[usize; 3]]) -> Result<HalfEdgeMesh> {
    build_from_polygons(vertices, faces)
}

/// Build a half-edge mesh from vertices and quad faces (counter-clockwise).
pub fn build_from_quads(vertices: &[Point3<f64>], faces: &[[usize; 4]]) -> Result<HalfEdgeMesh> {
    build_from_polygons(vertices, faces)
}

/// Link boundary half-edges into proper loops.
fn link_boundary_loops(mesh: &mut HalfEdgeMesh) {
    let boundary_hes: Vec<HalfEdgeId> = mesh
        .halfedge_ids()
        .filter(|&he| mesh.is_boundary_halfedge(he))
        .collect();

    let mut outgoing: HashMap<usize, HalfEdgeId> = HashMap::new();
    for &he in &boundary_hes {
        outgoing.insert(mesh.origin(he).index(), he);
    }

    for &he in &boundary_hes {
        // The next boundary half-edge starts where this one ends
        let dest = mesh.dest(he).index();
        if let Some(&next_he) = outgoing.get(&dest) {
            mesh.halfedge_mut(he).next = next_he;
            mesh.halfedge_mut(next_he).prev = he;
        }
    }
}

/// Ensure boundary vertices point to a boundary half-edge.
fn fix_boundary_vertex_halfedges(mesh: &mut HalfEdgeMesh) {
    for vid in mesh.vertex_ids().collect::<Vec<_>>() {
        let start_he = mesh.vertex(vid).halfedge;
        if !start_he.is_valid() {
            continue;
        }

        // Walk outgoing half-edges (twin -> next) until a boundary one shows up
        let mut he = start_he;
        loop {
            if mesh.is_boundary_halfedge(he) {
                mesh.vertex_mut(vid).halfedge = he;
                break;
            }
            he = mesh.next(mesh.twin(he));
            if he == start_he || !he.is_valid() {
                break;
            }
        }
    }
}

/// Convert a half-edge mesh back to a face-vertex representation.
///
/// Each face lists its corners starting at the face's first corner, so the
/// `k`-th entry corresponds to the `k`-th loop of [`HalfEdgeMesh::face_halfedges`].
pub fn to_polygons(mesh: &HalfEdgeMesh) -> (Vec<Point3<f64>>, Vec<Vec<usize>>) {
    let vertices: Vec<Point3<f64>> = mesh.vertex_ids().map(|v| *mesh.position(v)).collect();
    let faces: Vec<Vec<usize>> = mesh
        .face_ids()
        .map(|f| mesh.face_vertices(f).map(|v| v.index()).collect())
        .collect();
    (vertices, faces)
}
