//! Wavefront OBJ format support.
//!
//! Only geometry is read: `v` records and the vertex part of `f` records.
//! Texture and normal references (`f 1/2/3`) are accepted and ignored, and
//! negative indices count back from the last vertex.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::Point3;

use crate::error::{MeshError, Result};
use crate::mesh::{build_from_polygons, to_polygons, HalfEdgeMesh};

/// Load a polygon mesh from an OBJ file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<HalfEdgeMesh> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let (vertices, faces) = parse(reader).map_err(|message| MeshError::LoadError {
        path: path.to_path_buf(),
        message,
    })?;

    if faces.is_empty() {
        return Err(MeshError::LoadError {
            path: path.to_path_buf(),
            message: "OBJ file contains no faces".to_string(),
        });
    }
    build_from_polygons(&vertices, &faces)
}

fn parse<R: BufRead>(reader: R) -> std::result::Result<(Vec<Point3<f64>>, Vec<Vec<usize>>), String> {
    let mut vertices = Vec::new();
    let mut faces = Vec::new();

    for (n, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| e.to_string())?;
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("v") => {
                let mut co = [0.0; 3];
                for c in &mut co {
                    *c = tokens
                        .next()
                        .and_then(|t| t.parse().ok())
                        .ok_or_else(|| format!("line {}: malformed vertex", n + 1))?;
                }
                vertices.push(Point3::new(co[0], co[1], co[2]));
            }
            Some("f") => {
                let face = tokens
                    .map(|t| resolve_index(t, vertices.len()))
                    .collect::<Option<Vec<usize>>>()
                    .ok_or_else(|| format!("line {}: malformed face", n + 1))?;
                faces.push(face);
            }
            _ => {}
        }
    }
    Ok((vertices, faces))
}

fn resolve_index(token: &str, num_vertices: usize) -> Option<usize> {
    let index: i64 = token.split('/').next()?.parse().ok()?;
    match index {
        i if i > 0 => Some(i as usize - 1),
        i if i < 0 => num_vertices.checked_sub(i.unsigned_abs() as usize),
        _ => None,
    }
}

/// Save a polygon mesh to an OBJ file.
pub fn save<P: AsRef<Path>>(mesh: &HalfEdgeMesh, path: P) -> Result<()> {
    let (vertices, faces) = to_polygons(mesh);
    write_polygons(path.as_ref(), &vertices, &faces)
}

pub(crate) fn write_polygons<F: AsRef<[usize]>>(path: &Path, vertices: &[Point3<f64>], faces: &[F]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);

    writeln!(writer, "# multires")?;
    for v in vertices {
        writeln!(writer, "v {} {} {}", v.x, v.y, v.z)?;
    }
    for face in faces {
        write!(writer, "f")?;
        for &i in face.as_ref() {
            write!(writer, " {}", i + 1)?;
        }
        writeln!(writer)?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tests::scratch;
    use crate::mesh::fixtures;

    #[test]
    fn test_parse_face_variants() {
        let text = "# quad\nv 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nvt 0 0\nf 1/1 2/2 3/3 4/4\nf -4 -2 -1\n";
        let (vertices, faces) = parse(text.as_bytes()).unwrap();
        assert_eq!(vertices.len(), 4);
        assert_eq!(faces, vec![vec![0, 1, 2, 3], vec![0, 2, 3]]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("v 0 0\n".as_bytes()).is_err());
        assert!(parse("v 0 0 0\nf 1 2 x\n".as_bytes()).is_err());
        assert!(parse("v 0 0 0\nf 0 1 1\n".as_bytes()).is_err());
    }

    #[test]
    fn test_save_load_keeps_quads() {
        let mesh = fixtures::cube();
        let path = scratch("cube.obj");
        save(&mesh, &path).unwrap();
        let loaded = load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded.num_vertices(), 8);
        assert_eq!(loaded.num_faces(), 6);
        assert!(loaded.is_quad_mesh());
    }
}
