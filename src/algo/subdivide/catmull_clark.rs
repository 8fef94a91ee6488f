//! Catmull-Clark subdivision for polygon meshes.

use std::collections::HashMap;

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;

use crate::error::Result;
use crate::mesh::{build_from_polygons, to_polygons, FaceId, HalfEdgeId, HalfEdgeMesh, VertexId};

use super::SubdivideOptions;

/// Result of a single Catmull-Clark step that remembers where each coarse corner went.
#[derive(Debug, Clone)]
pub struct Refinement {
    /// The refined, all-quad mesh.
    pub mesh: HalfEdgeMesh,

    /// For every coarse half-edge, the refined sub-face at that corner
    /// (invalid for boundary half-edges).
    ///
    /// The sub-face's first corner sits on the (smoothed) coarse vertex, followed by
    /// the edge point toward the coarse `next`, the face point and the edge point
    /// toward the coarse `prev`.
    pub corner_faces: Vec<FaceId>,
}

impl Refinement {
    /// The refined loop at the coarse loop's vertex, if the coarse loop has a face.
    pub fn corner_loop(&self, coarse: HalfEdgeId) -> Option<HalfEdgeId> {
        let f = self.corner_faces.get(coarse.index())?.valid()?;
        Some(self.mesh.face(f).halfedge)
    }
}

/// Performs Catmull-Clark subdivision on a polygon mesh.
///
/// Every face with `n` corners becomes `n` quads, so after one iteration the
/// mesh is all quads.
///
/// # Vertex Rules
///
/// - **Face point**: centroid of face vertices
/// - **Edge point**: average of (edge midpoint, adjacent face points)
/// - **Vertex point**: (Q + 2R + (n-3)S) / n where:
///   - Q = average of adjacent face points
///   - R = average of adjacent edge midpoints
///   - S = original position
///   - n = valence
pub fn catmull_clark_subdivide(mesh: &mut HalfEdgeMesh, options: &SubdivideOptions) -> Result<()> {
    for _ in 0..options.iterations {
        let refined = refine(mesh, options.preserve_boundary, options.parallel)?;
        *mesh = refined.mesh;
    }
    Ok(())
}

/// Perform one Catmull-Clark step and keep the coarse-corner to sub-face map.
pub fn catmull_clark_refine(mesh: &HalfEdgeMesh) -> Result<Refinement> {
    catmull_clark_refine_with(mesh, false)
}

/// [`catmull_clark_refine`], optionally computing face points in parallel.
pub fn catmull_clark_refine_with(mesh: &HalfEdgeMesh, parallel: bool) -> Result<Refinement> {
    refine(mesh, true, parallel)
}

fn refine(mesh: &HalfEdgeMesh, preserve_boundary: bool, parallel: bool) -> Result<Refinement> {
    let (vertices, faces) = to_polygons(mesh);

    // Step 1: Compute face points (centroids)
    let centroid = |face: &Vec<usize>| {
        let sum: Vector3<f64> = face.iter().map(|&vi| vertices[vi].coords).sum();
        Point3::from(sum / face.len() as f64)
    };
    let face_points: Vec<Point3<f64>> = if parallel {
        faces.par_iter().map(centroid).collect()
    } else {
        faces.iter().map(centroid).collect()
    };

    // Step 2: Build edge information and compute edge points
    let edge_info = build_edge_info(&faces);
    let edge_points = compute_edge_points(&vertices, &face_points, &edge_info);

    // Step 3: Compute updated vertex positions
    let updated_vertices =
        compute_vertex_points(&vertices, &faces, &face_points, &edge_info, preserve_boundary);

    // Step 4: Each corner of each face becomes one quad
    let num_original = updated_vertices.len();
    let num_face_points = face_points.len();

    let mut new_vertices = updated_vertices;
    new_vertices.extend(face_points.iter().cloned());
    new_vertices.extend(edge_points.iter().cloned());

    let edge_point = |v0: usize, v1: usize| -> usize {
        num_original + num_face_points + edge_info[&edge_key(v0, v1)].new_vertex_index
    };

    let mut new_faces: Vec<[usize; 4]> = Vec::with_capacity(faces.iter().map(Vec::len).sum());
    let mut corner_faces = vec![FaceId::invalid(); mesh.num_halfedges()];

    for (face_idx, face) in faces.iter().enumerate() {
        let n = face.len();
        let fp = num_original + face_idx;
        let corners = mesh.face_halfedges(FaceId::new(face_idx));
        for (k, he) in corners.enumerate() {
            let v = face[k];
            let v_next = face[(k + 1) % n];
            let v_prev = face[(k + n - 1) % n];
            corner_faces[he.index()] = FaceId::new(new_faces.len());
            new_faces.push([v, edge_point(v, v_next), fp, edge_point(v_prev, v)]);
        }
    }

    let refined = build_from_polygons(&new_vertices, &new_faces)?;

    Ok(Refinement {
        mesh: refined,
        corner_faces,
    })
}

/// Position of `v` after one Catmull-Clark step, computed in place on the mesh.
///
/// Boundary vertices with two boundary neighbors use the 1/8, 3/4, 1/8 rule.
/// Corners (boundary vertices touching a single face, or more than two boundary
/// edges) keep their position.
pub fn smoothed_vertex(mesh: &HalfEdgeMesh, v: VertexId) -> Point3<f64> {
    let pos = *mesh.position(v);

    let mut boundary_neighbors: Vec<Point3<f64>> = Vec::with_capacity(2);
    let mut q = Vector3::zeros();
    let mut r = Vector3::zeros();
    let mut num_faces = 0usize;
    let mut num_edges = 0usize;

    for he in mesh.vertex_halfedges(v) {
        let dest = *mesh.position(mesh.dest(he));
        r += (pos.coords + dest.coords) * 0.5;
        num_edges += 1;

        if mesh.is_boundary_edge(he) {
            boundary_neighbors.push(dest);
        }

        let f = mesh.face_of(he);
        if f.is_valid() {
            q += mesh.face_centroid(f).coords;
            num_faces += 1;
        }
    }

    if !boundary_neighbors.is_empty() {
        if boundary_neighbors.len() == 2 && num_faces > 1 {
            let (left, right) = (boundary_neighbors[0], boundary_neighbors[1]);
            return Point3::from(
                (left.coords + right.coords) * (1.0 / 8.0) + pos.coords * (3.0 / 4.0),
            );
        }
        return pos;
    }

    if num_faces == 0 || num_edges == 0 {
        return pos;
    }

    let n = num_faces as f64;
    let q = q / n;
    let r = r / num_edges as f64;
    Point3::from((q + r * 2.0 + pos.coords * (n - 3.0)) / n)
}

/// Information about an edge for Catmull-Clark subdivision.
#[derive(Debug, Clone)]
struct EdgeInfo {
    /// Index of the new vertex created for this edge.
    new_vertex_index: usize,
    /// Indices of faces sharing this edge (second is None for boundary).
    faces: (usize, Option<usize>),
}

#[inline]
fn edge_key(v0: usize, v1: usize) -> (usize, usize) {
    if v0 < v1 {
        (v0, v1)
    } else {
        (v1, v0)
    }
}

/// Build a map from edge (v0, v1) to edge information.
fn build_edge_info(faces: &[Vec<usize>]) -> HashMap<(usize, usize), EdgeInfo> {
    let mut edge_map: HashMap<(usize, usize), EdgeInfo> = HashMap::new();
    let mut next_edge_vertex = 0;

    for (face_idx, face) in faces.iter().enumerate() {
        let n = face.len();
        for i in 0..n {
            let key = edge_key(face[i], face[(i + 1) % n]);

            if let Some(info) = edge_map.get_mut(&key) {
                info.faces.1 = Some(face_idx);
            } else {
                edge_map.insert(
                    key,
                    EdgeInfo {
                        new_vertex_index: next_edge_vertex,
                        faces: (face_idx, None),
                    },
                );
                next_edge_vertex += 1;
            }
        }
    }

    edge_map
}

/// Compute edge points for Catmull-Clark subdivision.
fn compute_edge_points(
    vertices: &[Point3<f64>],
    face_points: &[Point3<f64>],
    edge_info: &HashMap<(usize, usize), EdgeInfo>,
) -> Vec<Point3<f64>> {
    let mut edge_points = vec![Point3::origin(); edge_info.len()];

    for (&(v0, v1), info) in edge_info {
        let midpoint = (vertices[v0].coords + vertices[v1].coords) * 0.5;

        let new_pos = match info.faces {
            (f0, Some(f1)) => {
                Point3::from((midpoint + face_points[f0].coords + face_points[f1].coords) / 3.0)
            }
            // Boundary edge: sharp, keep the midpoint
            (_, None) => Point3::from(midpoint),
        };

        edge_points[info.new_vertex_index] = new_pos;
    }

    edge_points
}

/// Compute updated vertex positions for Catmull-Clark subdivision.
fn compute_vertex_points(
    vertices: &[Point3<f64>],
    faces: &[Vec<usize>],
    face_points: &[Point3<f64>],
    edge_info: &HashMap<(usize, usize), EdgeInfo>,
    preserve_boundary: bool,
) -> Vec<Point3<f64>> {
    let n = vertices.len();

    let mut vertex_faces: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut vertex_edges: Vec<Vec<(usize, usize)>> = vec![Vec::new(); n];
    let mut boundary_neighbors: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (face_idx, face) in faces.iter().enumerate() {
        for &vi in face {
            vertex_faces[vi].push(face_idx);
        }
    }

    for (&(v0, v1), info) in edge_info {
        vertex_edges[v0].push((v0, v1));
        vertex_edges[v1].push((v0, v1));

        if info.faces.1.is_none() {
            boundary_neighbors[v0].push(v1);
            boundary_neighbors[v1].push(v0);
        }
    }

    vertices
        .iter()
        .enumerate()
        .map(|(i, pos)| {
            let is_boundary = !boundary_neighbors[i].is_empty();

            if is_boundary && preserve_boundary {
                return if boundary_neighbors[i].len() == 2 && vertex_faces[i].len() > 1 {
                    let left = &vertices[boundary_neighbors[i][0]];
                    let right = &vertices[boundary_neighbors[i][1]];
                    Point3::from(
                        (left.coords + right.coords) * (1.0 / 8.0) + pos.coords * (3.0 / 4.0),
                    )
                } else {
                    *pos
                };
            }

            let valence = vertex_faces[i].len();
            if valence == 0 || vertex_edges[i].is_empty() {
                return *pos;
            }

            let q: Vector3<f64> = vertex_faces[i]
                .iter()
                .map(|&fi| face_points[fi].coords)
                .sum::<Vector3<f64>>()
                / valence as f64;

            let r: Vector3<f64> = vertex_edges[i]
                .iter()
                .map(|&(v0, v1)| (vertices[v0].coords + vertices[v1].coords) * 0.5)
                .sum::<Vector3<f64>>()
                / vertex_edges[i].len() as f64;

            let n_f = valence as f64;
            Point3::from((q + r * 2.0 + pos.coords * (n_f - 3.0)) / n_f)
        })
        .collect()
}
