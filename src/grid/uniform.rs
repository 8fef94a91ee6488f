//! Fixed-resolution grids.

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use super::{
    bilinear, check_dimension, BoundaryLink, BoundaryMap, CacheKey, CustomData, Grid,
    GridAttributes, GridCache, GridPoint, LoopQuad, RecalcFlags,
};
use crate::error::{MeshError, Result};
use crate::mesh::{HalfEdgeId, HalfEdgeMesh};

/// An `N x N` grid of points over one face corner, `N = 2^k + 1`.
///
/// Point `(x, y)` is stored at `y * N + x` and sits at
/// `uv = (x / (N - 1), y / (N - 1))`.
#[derive(Debug, Clone, Default)]
pub struct UniformGrid {
    dimension: usize,
    points: Vec<GridPoint>,
    attrs: GridAttributes,
    polys: Vec<[usize; 3]>,
    cache: GridCache,
}

impl UniformGrid {
    /// Create an empty grid. Call [`Grid::init`] before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flat index of `(x, y)`.
    #[inline]
    pub fn index(&self, x: usize, y: usize) -> usize {
        y * self.dimension + x
    }

    /// Point at `(x, y)`.
    pub fn point(&self, x: usize, y: usize) -> &GridPoint {
        &self.points[self.index(x, y)]
    }

    /// Up to four axis-aligned neighbors of `(x, y)`.
    pub fn neighbors(&self, x: usize, y: usize) -> impl Iterator<Item = usize> + '_ {
        let n = self.dimension;
        let candidates = [
            (x > 0).then(|| (x - 1, y)),
            (x + 1 < n).then(|| (x + 1, y)),
            (y > 0).then(|| (x, y - 1)),
            (y + 1 < n).then(|| (x, y + 1)),
        ];
        candidates
            .into_iter()
            .flatten()
            .map(move |(x, y)| self.index(x, y))
    }

    /// Bilinear lookup of the grid surface at `(u, v)`.
    pub fn sample(&self, u: f64, v: f64) -> Option<Point3<f64>> {
        if self.points.is_empty() {
            return None;
        }
        let last = (self.dimension - 1) as f64;
        let fx = (u.clamp(0.0, 1.0) * last).min(last - 1.0).max(0.0);
        let fy = (v.clamp(0.0, 1.0) * last).min(last - 1.0).max(0.0);
        let (x, y) = (fx.floor() as usize, fy.floor() as usize);
        let corners = [
            self.point(x, y).co,
            self.point(x, y + 1).co,
            self.point(x + 1, y + 1).co,
            self.point(x + 1, y).co,
        ];
        Some(bilinear(&corners, fx - x as f64, fy - y as f64))
    }

    /// Change the resolution without a mesh, resampling the current surface.
    ///
    /// Attribute values of the new points are blended from the enclosing cell.
    pub fn resize(&mut self, dimension: usize) -> Result<()> {
        check_dimension(dimension)?;
        if self.points.is_empty() {
            return Err(MeshError::InvalidState("grid has not been initialized".into()));
        }
        if dimension == self.dimension {
            return Ok(());
        }

        let old = self.clone();
        let last = (dimension - 1) as f64;
        let old_last = (old.dimension - 1) as f64;

        self.dimension = dimension;
        self.points.clear();
        self.attrs.clear();
        for y in 0..dimension {
            for x in 0..dimension {
                let uv = [x as f64 / last, y as f64 / last];
                let co = old.sample(uv[0], uv[1]).unwrap_or_else(Point3::origin);
                self.points.push(GridPoint::new(co, uv));
                let p = self.attrs.push_point();

                let fx = (uv[0] * old_last).min(old_last - 1.0);
                let fy = (uv[1] * old_last).min(old_last - 1.0);
                let (ox, oy) = (fx.floor() as usize, fy.floor() as usize);
                let sources = [
                    old.index(ox, oy),
                    old.index(ox, oy + 1),
                    old.index(ox + 1, oy + 1),
                    old.index(ox + 1, oy),
                ];
                let weights = super::corner_weights(fx - ox as f64, fy - oy as f64);
                copy_blend(&old.attrs, &mut self.attrs, p, &sources, &weights);
            }
        }

        self.rebuild_polys();
        self.recalc_normals();
        self.cache.flag(RecalcFlags::NEIGHBORS);
        Ok(())
    }

    fn rebuild_polys(&mut self) {
        let n = self.dimension;
        self.polys.clear();
        self.polys.reserve((n - 1) * (n - 1) * 2);
        for y in 0..n - 1 {
            for x in 0..n - 1 {
                let i1 = self.index(x, y);
                let i2 = self.index(x, y + 1);
                let i3 = self.index(x + 1, y + 1);
                let i4 = self.index(x + 1, y);
                self.polys.push([i1, i2, i3]);
                self.polys.push([i1, i3, i4]);
            }
        }
    }

    /// Persistable form of the grid.
    pub fn to_record(&self) -> UniformGridRecord {
        UniformGridRecord {
            dimension: self.dimension,
            points: self.points.iter().map(|p| [p.co.x, p.co.y, p.co.z]).collect(),
            custom_data_layout: self.attrs.layout(),
            layers: self.attrs.layers().iter().map(|l| l.raw().to_vec()).collect(),
        }
    }

    /// Rebuild a grid from its record. Attribute layers must be relinked afterwards.
    pub fn from_record(record: UniformGridRecord) -> Result<Self> {
        let n = record.dimension;
        check_dimension(n).map_err(|e| MeshError::Migration(e.to_string()))?;
        if record.points.len() != n * n {
            return Err(MeshError::Migration(format!(
                "expected {} points for dimension {}, found {}",
                n * n,
                n,
                record.points.len()
            )));
        }

        let last = (n - 1) as f64;
        let points = record
            .points
            .iter()
            .enumerate()
            .map(|(i, co)| {
                let uv = [(i % n) as f64 / last, (i / n) as f64 / last];
                GridPoint::new(Point3::new(co[0], co[1], co[2]), uv)
            })
            .collect();

        let mut grid = Self {
            dimension: n,
            points,
            attrs: GridAttributes::from_layout(&record.custom_data_layout, record.layers, n * n)?,
            polys: Vec::new(),
            cache: GridCache::default(),
        };
        grid.rebuild_polys();
        grid.recalc_normals();
        Ok(grid)
    }
}

fn copy_blend(
    src: &GridAttributes,
    dst: &mut GridAttributes,
    target: usize,
    sources: &[usize],
    weights: &[f64],
) {
    for (li, layer) in src.layers().iter().enumerate() {
        let n = layer.kind.components();
        let mut out = vec![0.0; n];
        for (&s, &w) in sources.iter().zip(weights) {
            for (c, v) in out.iter_mut().zip(layer.get(s)) {
                *c += v * w;
            }
        }
        dst.set(li, target, &out);
    }
}

impl Grid for UniformGrid {
    fn init(
        &mut self,
        mesh: &HalfEdgeMesh,
        l: HalfEdgeId,
        dimension: usize,
        cd: &CustomData,
    ) -> Result<()> {
        check_dimension(dimension)?;
        let quad = LoopQuad::new(mesh, l)?;

        let n = dimension;
        let last = (n - 1) as f64;
        self.dimension = n;
        self.points.clear();
        self.points.reserve(n * n);
        self.attrs = GridAttributes::from_mesh(cd);

        for y in 0..n {
            for x in 0..n {
                let (u, v) = (x as f64 / last, y as f64 / last);
                self.points.push(GridPoint::new(quad.eval(u, v), [u, v]));
                let p = self.attrs.push_point();
                let (loops, weights) = quad.loop_weights(u, v);
                self.attrs.interpolate_from_mesh(p, cd, &loops, &weights);
            }
        }

        self.rebuild_polys();
        self.recalc_normals();
        self.cache.flag(RecalcFlags::NEIGHBORS);
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn points(&self) -> &[GridPoint] {
        &self.points
    }

    fn points_mut(&mut self) -> &mut [GridPoint] {
        &mut self.points
    }

    fn attributes(&self) -> &GridAttributes {
        &self.attrs
    }

    fn attributes_mut(&mut self) -> &mut GridAttributes {
        &mut self.attrs
    }

    fn vertex_corner(&self) -> Option<usize> {
        (!self.points.is_empty()).then(|| self.points.len() - 1)
    }

    fn triangles(&mut self) -> &[[usize; 3]] {
        if self.polys.is_empty() && self.dimension > 1 {
            self.rebuild_polys();
        }
        &self.polys
    }

    fn recalc_normals(&mut self) {
        for p in &mut self.points {
            p.no = Vector3::zeros();
        }

        for &[a, b, c] in &self.polys {
            let pa = self.points[a].co;
            let n = (self.points[b].co - pa).cross(&(self.points[c].co - pa));
            self.points[a].no += n;
            self.points[b].no += n;
            self.points[c].no += n;
        }

        for p in &mut self.points {
            p.no = p.no.try_normalize(1e-300).unwrap_or_else(Vector3::zeros);
        }
    }

    fn link_boundary(&mut self, map: &BoundaryMap, other_loop: HalfEdgeId, other: &Self) -> usize {
        if self.points.is_empty() || other.points.is_empty() {
            return 0;
        }
        let n = self.dimension;

        if other.dimension == n {
            for i in 0..n {
                let (own, theirs) = map.index(n, i);
                let p = self.index(own[0], own[1]);
                let q = other.index(theirs[0], theirs[1]);
                self.points[p].link = Some(BoundaryLink::exact(other_loop, q));
            }
            return n;
        }

        // Mismatched resolutions: land between the neighbor's points
        let side = map.other_side();
        let other_last = (other.dimension - 1) as f64;
        for i in 0..n {
            let t = i as f64 / (n - 1) as f64;
            let (own, _) = map.index(n, i);
            let p = self.index(own[0], own[1]);
            let s = side.param(map.uv(t).1) * other_last;
            let k = (s.floor() as usize).min(other.dimension - 2);
            let frac = s - k as f64;
            let a = other.index_on(side, k);
            let link = if frac.abs() < 1e-9 {
                BoundaryLink::exact(other_loop, a)
            } else if (1.0 - frac).abs() < 1e-9 {
                BoundaryLink::exact(other_loop, other.index_on(side, k + 1))
            } else {
                BoundaryLink::between(other_loop, a, other.index_on(side, k + 1), frac)
            };
            self.points[p].link = Some(link);
        }
        n
    }

    fn flag(&mut self, flags: RecalcFlags) {
        self.cache.flag(flags);
    }

    fn update(&mut self, key: CacheKey) -> RecalcFlags {
        let work = self.cache.refresh(key);
        if work.contains(RecalcFlags::POLYS) {
            self.rebuild_polys();
        }
        if work.contains(RecalcFlags::NORMALS) {
            self.recalc_normals();
        }
        work & RecalcFlags::NEIGHBORS
    }
}

impl UniformGrid {
    fn index_on(&self, side: super::Side, i: usize) -> usize {
        let [x, y] = side.index(self.dimension, i);
        self.index(x, y)
    }
}

/// Serialized form of a [`UniformGrid`].
///
/// UVs, normals and links are derived data and are rebuilt on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniformGridRecord {
    /// Side length.
    pub dimension: usize,
    /// Point positions in `y * N + x` order.
    pub points: Vec<[f64; 3]>,
    /// Attribute kind identifiers, in layer order.
    pub custom_data_layout: Vec<String>,
    /// Raw values per attribute layer.
    pub layers: Vec<Vec<f64>>,
}

impl UniformGridRecord {
    /// Encode with bincode.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from bincode.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{AttrKind, NeighborKey, NeighborResolver, VertexCase};
    use crate::mesh::{build_from_quads, fixtures, FaceId};
    use approx::assert_relative_eq;

    fn unit_quad() -> HalfEdgeMesh {
        let vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        build_from_quads(&vertices, &[[0, 1, 2, 3]]).unwrap()
    }

    fn two_quads() -> HalfEdgeMesh {
        let vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(2.0, 0.0, 0.3),
            Point3::new(2.0, 1.0, 0.1),
        ];
        build_from_quads(&vertices, &[[0, 1, 2, 3], [1, 4, 5, 2]]).unwrap()
    }

    #[test]
    fn test_unit_corners_scenario() {
        // A face whose corner quad for vertex (1,1) is exactly the unit square
        let vertices = vec![
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(1.0, -1.0, 0.0),
            Point3::new(-1.0, -1.0, 0.0),
            Point3::new(-1.0, 1.0, 0.0),
        ];
        let mesh = build_from_quads(&vertices, &[[0, 1, 2, 3]]).unwrap();
        let cd = CustomData::new(mesh.num_halfedges());
        let l = mesh.face(FaceId::new(0)).halfedge;

        let mut grid = UniformGrid::new();
        grid.init(&mesh, l, 5, &cd).unwrap();

        assert_eq!(grid.points().len(), 25);
        assert_eq!(grid.point(0, 0).co, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(grid.point(4, 0).co, Point3::new(1.0, 0.0, 0.0));
        assert_eq!(grid.point(4, 4).co, Point3::new(1.0, 1.0, 0.0));
        assert_eq!(grid.point(0, 4).co, Point3::new(0.0, 1.0, 0.0));
        assert_eq!(grid.point(2, 2).co, Point3::new(0.5, 0.5, 0.0));
    }

    #[test]
    fn test_corner_grid_of_unit_face() {
        let mesh = unit_quad();
        let cd = CustomData::new(mesh.num_halfedges());
        let l = mesh.face(FaceId::new(0)).halfedge;

        let mut grid = UniformGrid::new();
        grid.init(&mesh, l, 5, &cd).unwrap();

        assert_relative_eq!(grid.point(2, 2).co, Point3::new(0.25, 0.25, 0.0));
        assert_relative_eq!(grid.point(4, 4).co, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(grid.vertex_corner(), Some(24));
    }

    #[test]
    fn test_every_corner_grid_starts_at_face_center() {
        let mesh = unit_quad();
        let cd = CustomData::new(mesh.num_halfedges());
        for l in mesh.loop_ids() {
            let mut grid = UniformGrid::new();
            grid.init(&mesh, l, 5, &cd).unwrap();
            assert_relative_eq!(grid.point(0, 0).co, Point3::new(0.5, 0.5, 0.0));
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        let mesh = fixtures::quad_and_triangle();
        let mut cd = CustomData::new(mesh.num_halfedges());
        let uv = cd.add_layer(AttrKind::Uv, "UVMap");
        for l in mesh.loop_ids() {
            cd.set(uv, l.index(), &[l.index() as f64, 1.0]);
        }
        let l = mesh.face(FaceId::new(1)).halfedge;

        let mut grid = UniformGrid::new();
        grid.init(&mesh, l, 9, &cd).unwrap();
        let first = grid.points().to_vec();
        let first_attrs = grid.attributes().clone();

        grid.init(&mesh, l, 9, &cd).unwrap();
        assert_eq!(grid.points(), first.as_slice());
        assert_eq!(grid.attributes(), &first_attrs);
    }

    #[test]
    fn test_invalid_dimension() {
        let mesh = unit_quad();
        let cd = CustomData::new(mesh.num_halfedges());
        let mut grid = UniformGrid::new();
        let l = mesh.face(FaceId::new(0)).halfedge;
        assert!(grid.init(&mesh, l, 6, &cd).is_err());
    }

    #[test]
    fn test_normals_face_outward() {
        let mesh = unit_quad();
        let cd = CustomData::new(mesh.num_halfedges());
        for l in mesh.loop_ids() {
            let mut grid = UniformGrid::new();
            grid.init(&mesh, l, 5, &cd).unwrap();
            for p in grid.points() {
                assert_relative_eq!(p.no, Vector3::z(), epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_triangle_count() {
        let mesh = unit_quad();
        let cd = CustomData::new(mesh.num_halfedges());
        let mut grid = UniformGrid::new();
        grid.init(&mesh, mesh.face(FaceId::new(0)).halfedge, 9, &cd).unwrap();
        assert_eq!(grid.triangles().len(), 8 * 8 * 2);
    }

    #[test]
    fn test_neighbors() {
        let mesh = unit_quad();
        let cd = CustomData::new(mesh.num_halfedges());
        let mut grid = UniformGrid::new();
        grid.init(&mesh, mesh.face(FaceId::new(0)).halfedge, 5, &cd).unwrap();

        assert_eq!(grid.neighbors(0, 0).count(), 2);
        assert_eq!(grid.neighbors(2, 0).count(), 3);
        assert_eq!(grid.neighbors(2, 2).count(), 4);
    }

    #[test]
    fn test_welding_across_edge() {
        let mesh = two_quads();
        let cd = CustomData::new(mesh.num_halfedges());
        let n = 5;

        let grids: Vec<Option<UniformGrid>> = mesh
            .halfedge_ids()
            .map(|l| {
                mesh.is_loop(l).then(|| {
                    let mut g = UniformGrid::new();
                    g.init(&mesh, l, n, &cd).unwrap();
                    g
                })
            })
            .collect();

        let mut linked = grids.clone();
        for l in mesh.loop_ids() {
            let rel = mesh.loop_relations(l);
            for key in NeighborKey::BOUNDARY {
                let Some(other) = rel.get(key) else { continue };
                let case = VertexCase::of(&mesh, l, other);
                let map = NeighborResolver::lookup(NeighborKey::L, key, case).unwrap();
                let other_grid = grids[other.index()].as_ref().unwrap();
                let own = linked[l.index()].as_mut().unwrap();
                assert_eq!(own.link_boundary(&map, other, other_grid), n);
            }
        }

        for l in mesh.loop_ids() {
            let grid = linked[l.index()].as_ref().unwrap();
            for p in grid.points() {
                let Some(link) = p.link else { continue };
                let target = grids[link.grid.index()].as_ref().unwrap();
                let pos = link.resolve(target.points()).unwrap();
                assert_relative_eq!(pos, p.co, epsilon = 1e-12);
            }
        }

        // Loop at vertex 1 of face 0: its u = 1 side lies on the shared edge 1-2
        let l = mesh.face_halfedges(FaceId::new(0)).nth(1).unwrap();
        let right = linked[l.index()].as_ref().unwrap();
        let x = n - 1;
        assert!((0..n).all(|y| right.point(x, y).link.is_some()));
    }

    #[test]
    fn test_mismatched_dimensions_blend() {
        let mesh = fixtures::flat_grid(2);
        let cd = CustomData::new(mesh.num_halfedges());
        let l = mesh.face(FaceId::new(0)).halfedge;
        let ln = mesh.next(l);

        let mut fine = UniformGrid::new();
        fine.init(&mesh, l, 5, &cd).unwrap();
        let mut coarse = UniformGrid::new();
        coarse.init(&mesh, ln, 3, &cd).unwrap();

        let map = NeighborResolver::lookup(NeighborKey::L, NeighborKey::LN, VertexCase::Different)
            .unwrap();
        fine.link_boundary(&map, ln, &coarse);

        for i in 0..5 {
            let p = fine.point(i, 0);
            let link = p.link.unwrap();
            assert_eq!(link.is_exact(), i % 2 == 0);
            assert_relative_eq!(link.resolve(coarse.points()).unwrap(), p.co, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_resize_preserves_surface() {
        let mesh = unit_quad();
        let mut cd = CustomData::new(mesh.num_halfedges());
        cd.add_layer(AttrKind::Mask, "Mask");
        let mut grid = UniformGrid::new();
        grid.init(&mesh, mesh.face(FaceId::new(0)).halfedge, 3, &cd).unwrap();

        grid.resize(5).unwrap();
        assert_eq!(grid.dimension(), 5);
        assert_eq!(grid.points().len(), 25);
        assert_eq!(grid.attributes().len(), 25);
        assert_relative_eq!(grid.point(1, 1).co, Point3::new(0.375, 0.375, 0.0), epsilon = 1e-12);
        assert_relative_eq!(grid.attributes().values(0, 7)[0], 1.0);
    }

    #[test]
    fn test_record_roundtrip() {
        let mesh = two_quads();
        let mut cd = CustomData::new(mesh.num_halfedges());
        cd.add_layer(AttrKind::Color, "Col");
        let l = mesh.face(FaceId::new(1)).halfedge;
        let mut grid = UniformGrid::new();
        grid.init(&mesh, l, 5, &cd).unwrap();

        let bytes = grid.to_record().encode().unwrap();
        let mut loaded = UniformGrid::from_record(UniformGridRecord::decode(&bytes).unwrap()).unwrap();
        loaded.relink_custom_data(&cd);

        assert_eq!(loaded.dimension(), 5);
        for (a, b) in grid.points().iter().zip(loaded.points()) {
            assert_eq!(a.co, b.co);
            assert_eq!(a.uv, b.uv);
            assert_relative_eq!(a.no, b.no, epsilon = 1e-12);
        }
        assert_eq!(loaded.attributes().layers(), grid.attributes().layers());
    }

    #[test]
    fn test_bad_record_is_migration_error() {
        let record = UniformGridRecord {
            dimension: 3,
            points: vec![[0.0; 3]; 4],
            custom_data_layout: Vec::new(),
            layers: Vec::new(),
        };
        assert!(matches!(
            UniformGrid::from_record(record),
            Err(MeshError::Migration(_))
        ));
    }

    #[test]
    fn test_update_flushes_work() {
        let mesh = unit_quad();
        let cd = CustomData::new(mesh.num_halfedges());
        let mut grid = UniformGrid::new();
        grid.init(&mesh, mesh.face(FaceId::new(0)).halfedge, 3, &cd).unwrap();

        let key = CacheKey::default();
        assert_eq!(grid.update(key), RecalcFlags::NEIGHBORS);
        assert_eq!(grid.update(key), RecalcFlags::empty());
        grid.flag(RecalcFlags::NORMALS);
        assert_eq!(grid.update(key), RecalcFlags::empty());
    }
}
