//! Mesh file I/O.
//!
//! Cages are loaded as polygon meshes so quads survive. Grid tessellations
//! are written as plain triangle soups.
//!
//! # Supported Formats
//!
//! | Format | Extension | Load | Save | Notes |
//! |--------|-----------|------|------|-------|
//! | Wavefront OBJ | `.obj` | ✓ | ✓ | Polygon faces |
//! | STL | `.stl` | ✓ | ✓ | Binary and ASCII, vertices welded on load |
//! | PLY | `.ply` | ✓ | ✓ | Polygon faces, ASCII on save |
//!
//! # Usage
//!
//! ```no_run
//! use multires::io::{load, save};
//!
//! let mesh = load("cage.obj").unwrap();
//! save(&mesh, "cage.ply").unwrap();
//! ```

pub mod obj;
pub mod ply;
pub mod stl;

use std::path::Path;

use nalgebra::Point3;

use crate::error::{MeshError, Result};
use crate::mesh::HalfEdgeMesh;

/// Supported mesh file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Wavefront OBJ format.
    Obj,
    /// STL (stereolithography) format.
    Stl,
    /// PLY (Stanford polygon) format.
    Ply,
}

impl Format {
    /// Detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Format> {
        match ext.to_lowercase().as_str() {
            "obj" => Some(Format::Obj),
            "stl" => Some(Format::Stl),
            "ply" => Some(Format::Ply),
            _ => None,
        }
    }

    /// Detect format from file path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Option<Format> {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Format::from_extension)
    }
}

fn detect(path: &Path) -> Result<Format> {
    Format::from_path(path).ok_or_else(|| MeshError::UnsupportedFormat {
        extension: path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("(none)")
            .to_string(),
    })
}

/// Load a mesh from a file with automatic format detection.
///
/// The format is determined by the file extension.
pub fn load<P: AsRef<Path>>(path: P) -> Result<HalfEdgeMesh> {
    let path = path.as_ref();
    let mesh = match detect(path)? {
        Format::Obj => obj::load(path)?,
        Format::Stl => stl::load(path)?,
        Format::Ply => ply::load(path)?,
    };
    log::debug!(
        "loaded {}: {} vertices, {} faces",
        path.display(),
        mesh.num_vertices(),
        mesh.num_faces()
    );
    Ok(mesh)
}

/// Save a mesh to a file with automatic format detection.
///
/// STL output is fan-triangulated.
pub fn save<P: AsRef<Path>>(mesh: &HalfEdgeMesh, path: P) -> Result<()> {
    let path = path.as_ref();
    match detect(path)? {
        Format::Obj => obj::save(mesh, path),
        Format::Stl => stl::save(mesh, path),
        Format::Ply => ply::save(mesh, path),
    }
}

/// Save an indexed triangle soup with automatic format detection.
pub fn save_triangles<P: AsRef<Path>>(
    positions: &[Point3<f64>],
    triangles: &[[usize; 3]],
    path: P,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(bad) = triangles.iter().flatten().find(|&&i| i >= positions.len()) {
        return Err(MeshError::SaveError {
            path: path.to_path_buf(),
            message: format!("triangle index {} out of range ({} points)", bad, positions.len()),
        });
    }
    match detect(path)? {
        Format::Obj => obj::write_polygons(path, positions, triangles),
        Format::Stl => stl::write_triangles(path, positions, triangles),
        Format::Ply => ply::write_polygons(path, positions, triangles),
    }
}

/// Split polygons into triangle fans.
pub(crate) fn fan_triangulate<F: AsRef<[usize]>>(faces: &[F]) -> Vec<[usize; 3]> {
    let mut triangles = Vec::new();
    for face in faces {
        let face = face.as_ref();
        for i in 1..face.len().saturating_sub(1) {
            triangles.push([face[0], face[i], face[i + 1]]);
        }
    }
    triangles
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Unique scratch path in the system temp directory.
    pub fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("multires-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(Format::from_path("a/b/cage.OBJ"), Some(Format::Obj));
        assert_eq!(Format::from_path("x.ply"), Some(Format::Ply));
        assert_eq!(Format::from_path("x.glb"), None);
        assert!(matches!(
            load("model.fbx"),
            Err(MeshError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_fan_triangulate() {
        let faces: Vec<Vec<usize>> = vec![vec![0, 1, 2, 3], vec![4, 5, 6]];
        assert_eq!(fan_triangulate(&faces), vec![[0, 1, 2], [0, 2, 3], [4, 5, 6]]);
    }

    #[test]
    fn test_save_triangles_checks_indices() {
        let positions = vec![Point3::origin(); 2];
        let result = save_triangles(&positions, &[[0, 1, 2]], scratch("bad.obj"));
        assert!(matches!(result, Err(MeshError::SaveError { .. })));
    }
}
