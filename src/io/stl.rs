//! STL (stereolithography) format support.
//!
//! STL stores independent triangles. Loading welds corners with identical
//! coordinates back into shared vertices; saving fan-triangulates polygons.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use nalgebra::Point3;

use crate::error::{MeshError, Result};
use crate::mesh::{build_from_triangles, to_polygons, HalfEdgeMesh};

use super::fan_triangulate;

/// Load a triangle mesh from an STL file.
///
/// Automatically detects binary vs ASCII format.
///
/// # Example
///
/// ```no_run
/// use multires::io::stl;
///
/// let mesh = stl::load("model.stl").unwrap();
/// ```
pub fn load<P: AsRef<Path>>(path: P) -> Result<HalfEdgeMesh> {
    let path = path.as_ref();
    let mut file = File::open(path)?;

    let stl = stl_io::read_stl(&mut file).map_err(|e| MeshError::LoadError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut welded: HashMap<[u32; 3], usize> = HashMap::new();
    let mut vertices: Vec<Point3<f64>> = Vec::new();
    let mut faces: Vec<[usize; 3]> = Vec::new();

    for tri in &stl.faces {
        let mut ids = [0usize; 3];
        for (id, &corner) in ids.iter_mut().zip(&tri.vertices) {
            let v = &stl.vertices[corner];
            let key = [v[0].to_bits(), v[1].to_bits(), v[2].to_bits()];
            *id = *welded.entry(key).or_insert_with(|| {
                vertices.push(Point3::new(v[0] as f64, v[1] as f64, v[2] as f64));
                vertices.len() - 1
            });
        }

        // Skip degenerate triangles
        if ids[0] != ids[1] && ids[1] != ids[2] && ids[0] != ids[2] {
            faces.push(ids);
        }
    }

    if faces.is_empty() {
        return Err(MeshError::LoadError {
            path: path.to_path_buf(),
            message: "STL file contains no valid triangles".to_string(),
        });
    }

    build_from_triangles(&vertices, &faces)
}

/// Save a mesh to a binary STL file.
pub fn save<P: AsRef<Path>>(mesh: &HalfEdgeMesh, path: P) -> Result<()> {
    let (vertices, faces) = to_polygons(mesh);
    write_triangles(path.as_ref(), &vertices, &fan_triangulate(&faces))
}

pub(crate) fn write_triangles(path: &Path, vertices: &[Point3<f64>], faces: &[[usize; 3]]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);

    let to_vertex = |p: &Point3<f64>| stl_io::Vertex::new([p.x as f32, p.y as f32, p.z as f32]);
    let triangles: Vec<stl_io::Triangle> = faces
        .iter()
        .map(|f| {
            let p0 = &vertices[f[0]];
            let p1 = &vertices[f[1]];
            let p2 = &vertices[f[2]];
            let n = (p1 - p0).cross(&(p2 - p0)).try_normalize(0.0).unwrap_or_default();

            stl_io::Triangle {
                normal: stl_io::Normal::new([n.x as f32, n.y as f32, n.z as f32]),
                vertices: [to_vertex(p0), to_vertex(p1), to_vertex(p2)],
            }
        })
        .collect();

    stl_io::write_stl(&mut writer, triangles.iter()).map_err(|e| MeshError::SaveError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    Ok(())
}
