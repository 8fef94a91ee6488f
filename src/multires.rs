//! Multiresolution data for a whole mesh.
//!
//! [`MultiresMesh`] owns the coarse mesh, its loop custom data and one grid
//! per loop. It keeps the grids welded along shared boundaries, invalidates
//! their caches through a generation counter and projects them onto the
//! Catmull-Clark limit surface. Once projected, grid points keep their offset
//! from the limit surface in its tangent frame, so sculpted detail rides along
//! when the coarse mesh moves.
//!
//! # Example
//!
//! ```no_run
//! use multires::grid::UniformGrid;
//! use multires::multires::MultiresMesh;
//!
//! let mesh = multires::io::load("cage.obj").unwrap();
//! let mut multires: MultiresMesh<UniformGrid> = MultiresMesh::new(mesh, 9).unwrap();
//! multires.init_grids().unwrap();
//! multires.reproject().unwrap();
//! let (points, triangles) = multires.tessellate();
//! multires::io::save_triangles(&points, &triangles, "limit.obj").unwrap();
//! ```

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;

use crate::error::{MeshError, Result};
use crate::grid::{
    check_dimension, AttrKind, BoundaryLink, CacheKey, CustomData, Grid, GridPoint, GridSettings,
    NeighborKey, NeighborResolver, RecalcFlags, VertexCase,
};
use crate::mesh::{HalfEdgeId, HalfEdgeMesh, VertexId};
use crate::patch::{PatchBuilder, PatchOptions, Patches, TangentFrame};

/// Coordinates are quantized to this many steps per unit before hashing.
const COORD_QUANTUM: f64 = 1e6;

/// Stitching moves below this distance are not counted.
const STITCH_EPS: f64 = 1e-12;

/// Identifies the coarse mesh state a set of limit patches was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubsurfKey {
    /// Mesh update generation.
    pub generation: u64,
    /// Number of vertices.
    pub num_vertices: usize,
    /// Number of faces.
    pub num_faces: usize,
    /// Hash of the quantized vertex positions.
    pub coords_hash: u64,
}

impl SubsurfKey {
    fn of(mesh: &HalfEdgeMesh, generation: u64) -> Self {
        let mut hasher = DefaultHasher::new();
        for v in mesh.vertex_ids() {
            for c in mesh.position(v).iter() {
                ((c * COORD_QUANTUM).round() as i64).hash(&mut hasher);
            }
        }
        Self {
            generation,
            num_vertices: mesh.num_vertices(),
            num_faces: mesh.num_faces(),
            coords_hash: hasher.finish(),
        }
    }
}

/// A coarse mesh with one grid of type `G` per loop.
#[derive(Debug, Clone)]
pub struct MultiresMesh<G: Grid> {
    mesh: HalfEdgeMesh,
    cd: CustomData,
    grids: Vec<Option<G>>,
    settings: GridSettings,
    patch_options: PatchOptions,
    dimension: usize,
    generation: u64,
    active_layer: Option<usize>,
    patches: Option<(SubsurfKey, Patches)>,
    projected: Option<Patches>,
}

impl<G: Grid> MultiresMesh<G> {
    /// Attach multiresolution data of the given grid dimension to a mesh.
    ///
    /// Grids are created by [`MultiresMesh::init_grids`].
    pub fn new(mesh: HalfEdgeMesh, dimension: usize) -> Result<Self> {
        check_dimension(dimension)?;
        if mesh.num_faces() == 0 {
            return Err(MeshError::EmptyMesh);
        }
        let n = mesh.num_halfedges();
        Ok(Self {
            cd: CustomData::new(n),
            grids: vec![None; n],
            mesh,
            settings: GridSettings::default(),
            patch_options: PatchOptions::default(),
            dimension,
            generation: 0,
            active_layer: None,
            patches: None,
            projected: None,
        })
    }

    /// Replace the grid settings before the grids are built.
    pub fn with_settings(mut self, settings: GridSettings) -> Self {
        self.set_settings(settings);
        self
    }

    /// Replace the options used to build limit patches.
    pub fn with_patch_options(mut self, options: PatchOptions) -> Self {
        self.patch_options = options;
        self.patches = None;
        self
    }

    /// The coarse mesh.
    pub fn mesh(&self) -> &HalfEdgeMesh {
        &self.mesh
    }

    /// Loop custom data of the coarse mesh.
    pub fn custom_data(&self) -> &CustomData {
        &self.cd
    }

    /// Loop custom data of the coarse mesh, mutably.
    ///
    /// Layer changes must go through [`MultiresMesh::add_layer`] and
    /// [`MultiresMesh::remove_layer`] so the grids follow.
    pub fn custom_data_mut(&mut self) -> &mut CustomData {
        &mut self.cd
    }

    /// Grid of a loop.
    pub fn grid(&self, l: HalfEdgeId) -> Option<&G> {
        self.grids.get(l.index())?.as_ref()
    }

    /// Grid of a loop, mutably.
    pub fn grid_mut(&mut self, l: HalfEdgeId) -> Option<&mut G> {
        self.grids.get_mut(l.index())?.as_mut()
    }

    /// Iterate `(loop, grid)` pairs.
    pub fn grids(&self) -> impl Iterator<Item = (HalfEdgeId, &G)> + '_ {
        self.grids
            .iter()
            .enumerate()
            .filter_map(|(i, g)| g.as_ref().map(|g| (HalfEdgeId::new(i), g)))
    }

    /// Current grid settings.
    pub fn settings(&self) -> &GridSettings {
        &self.settings
    }

    /// Grid dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Update generation; bumped by every change of the coarse mesh.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Active custom-data layer.
    pub fn active_layer(&self) -> Option<usize> {
        self.active_layer
    }

    /// Select the active custom-data layer. Every grid cache is refreshed on
    /// the next [`MultiresMesh::update`].
    pub fn set_active_layer(&mut self, layer: Option<usize>) -> Result<()> {
        if let Some(index) = layer {
            if index >= self.cd.layers().len() {
                log::error!("active layer {} out of range", index);
                return Err(MeshError::invalid_param("layer", index, "no such layer"));
            }
        }
        self.active_layer = layer;
        Ok(())
    }

    /// Mark the coarse mesh as changed.
    pub fn touch(&mut self) {
        self.generation += 1;
    }

    /// Move a coarse vertex.
    pub fn set_vertex_position(&mut self, v: VertexId, position: Point3<f64>) {
        self.mesh.set_position(v, position);
        self.touch();
    }

    /// Build every grid from the coarse mesh and link their boundaries.
    pub fn init_grids(&mut self) -> Result<()> {
        let mesh = &self.mesh;
        let cd = &self.cd;
        let settings = &self.settings;
        let dimension = self.dimension;

        let build = |i: usize| -> Result<Option<G>> {
            let l = HalfEdgeId::new(i);
            if !mesh.is_loop(l) {
                return Ok(None);
            }
            let mut grid = G::default();
            grid.apply_settings(settings);
            grid.init(mesh, l, dimension, cd)?;
            Ok(Some(grid))
        };

        let n = mesh.num_halfedges();
        self.grids = if settings.parallel {
            (0..n).into_par_iter().map(build).collect::<Result<_>>()?
        } else {
            (0..n).map(build).collect::<Result<_>>()?
        };
        self.projected = None;

        let links = self.recalc_neighbors();
        log::info!(
            "initialized {} grids of dimension {} ({} boundary links)",
            self.grids.iter().flatten().count(),
            dimension,
            links
        );
        Ok(())
    }

    /// Change the grid dimension and rebuild every grid.
    pub fn set_dimension(&mut self, dimension: usize) -> Result<()> {
        check_dimension(dimension)?;
        self.dimension = dimension;
        self.init_grids()
    }

    /// Add a loop attribute layer and mirror it in every grid.
    pub fn add_layer(&mut self, kind: AttrKind, name: impl Into<String>) -> usize {
        let index = self.cd.add_layer(kind, name);
        for grid in self.grids.iter_mut().flatten() {
            grid.attributes_mut().on_new_layer(kind, index);
        }
        index
    }

    /// Remove a loop attribute layer from the mesh and every grid.
    pub fn remove_layer(&mut self, index: usize) -> Result<()> {
        self.cd.remove_layer(index)?;
        for grid in self.grids.iter_mut().flatten() {
            grid.attributes_mut().on_remove_layer(index);
        }
        self.active_layer = match self.active_layer {
            Some(a) if a == index => None,
            Some(a) if a > index => Some(a - 1),
            other => other,
        };
        Ok(())
    }

    /// Re-associate every grid's attribute layers with the mesh layers.
    pub fn relink_custom_data(&mut self) {
        for grid in self.grids.iter_mut().flatten() {
            grid.relink_custom_data(&self.cd);
        }
    }

    /// Relink the boundaries of every grid. Returns the number of links set.
    pub fn recalc_neighbors(&mut self) -> usize {
        let loops: Vec<HalfEdgeId> = self.mesh.loop_ids().collect();
        loops
            .into_iter()
            .map(|l| match self.recalc_neighbors_for(l) {
                Ok(n) => n,
                Err(e) => {
                    log::debug!("neighbors of loop {} skipped: {}", l.index(), e);
                    0
                }
            })
            .sum()
    }

    /// Relink the boundaries of one loop's grid.
    ///
    /// Neighbors without a grid are skipped; they are picked up on the next pass.
    pub fn recalc_neighbors_for(&mut self, l: HalfEdgeId) -> Result<usize> {
        let mut grid = self
            .grids
            .get_mut(l.index())
            .and_then(Option::take)
            .ok_or(MeshError::MissingGrid(l.index()))?;
        grid.clear_links();

        let relations = self.mesh.loop_relations(l);
        let mut links = 0;
        for key in NeighborKey::BOUNDARY {
            let Some(other) = relations.get(key) else {
                continue;
            };
            if other == l {
                continue;
            }
            let case = VertexCase::of(&self.mesh, l, other);
            let map = match NeighborResolver::lookup(NeighborKey::L, key, case) {
                Ok(map) => map,
                Err(e) => {
                    log::debug!("loop {}: {}", l.index(), e);
                    continue;
                }
            };
            match self.grids[other.index()].as_ref() {
                Some(other_grid) => links += grid.link_boundary(&map, other, other_grid),
                None => log::debug!("loop {}: {}", l.index(), MeshError::MissingGrid(other.index())),
            }
        }

        self.grids[l.index()] = Some(grid);
        Ok(links)
    }

    /// Make linked boundary points coincide.
    ///
    /// Points with an exact link meet at the average of both positions.
    /// Points linked between two neighbor points (T-junctions) move onto the
    /// neighbor's boundary. Returns the number of points moved.
    pub fn stitch(&mut self) -> usize {
        let mut targets: HashMap<(usize, usize), (Vector3<f64>, usize)> = HashMap::new();
        let mut propose = |grid: usize, point: usize, co: Point3<f64>| {
            let entry = targets.entry((grid, point)).or_insert((Vector3::zeros(), 0));
            entry.0 += co.coords;
            entry.1 += 1;
        };

        for (l, grid) in self.grids.iter().enumerate() {
            let Some(grid) = grid else { continue };
            for (p, point) in grid.points().iter().enumerate() {
                let Some(link) = point.link.filter(|_| !point.hidden) else { continue };
                let Some(target) = self.grids.get(link.grid.index()).and_then(Option::as_ref) else {
                    continue;
                };
                if link_hidden(target.points(), &link) {
                    continue;
                }
                let Some(co) = link.resolve(target.points()) else {
                    log::debug!("stale link from loop {} point {}", l, p);
                    continue;
                };
                if link.is_exact() {
                    let mid = Point3::from((point.co.coords + co.coords) * 0.5);
                    propose(l, p, mid);
                    propose(link.grid.index(), link.point, mid);
                } else {
                    propose(l, p, co);
                }
            }
        }

        let mut moved = 0;
        for ((l, p), (sum, count)) in targets {
            let Some(grid) = self.grids[l].as_mut() else { continue };
            let co = Point3::from(sum / count as f64);
            let point = &mut grid.points_mut()[p];
            if (point.co - co).norm() > STITCH_EPS {
                moved += 1;
            }
            point.co = co;
            grid.flag(RecalcFlags::NORMALS);
        }
        moved
    }

    /// Write each grid's vertex corner back to the coarse mesh.
    ///
    /// A vertex shared by several loops receives the average of their corners.
    pub fn apply_base(&mut self) {
        let mut sums: Vec<(Vector3<f64>, usize)> = vec![(Vector3::zeros(), 0); self.mesh.num_vertices()];
        for (l, grid) in self.grids.iter().enumerate() {
            let Some(grid) = grid else { continue };
            let Some(corner) = grid.vertex_corner() else { continue };
            let v = self.mesh.loop_vertex(HalfEdgeId::new(l));
            let entry = &mut sums[v.index()];
            entry.0 += grid.points()[corner].co.coords;
            entry.1 += 1;
        }
        for (v, (sum, count)) in sums.into_iter().enumerate() {
            if count > 0 {
                self.mesh.set_position(VertexId::new(v), Point3::from(sum / count as f64));
            }
        }
        self.touch();
    }

    /// Key of the current coarse mesh state.
    pub fn subsurf_key(&self) -> SubsurfKey {
        SubsurfKey::of(&self.mesh, self.generation)
    }

    /// Rebuild the limit patches if the coarse mesh changed since the last build.
    pub fn update_patches(&mut self) -> Result<&Patches> {
        let key = self.subsurf_key();
        let stale = !matches!(&self.patches, Some((k, _)) if *k == key);
        if stale {
            let options = self.patch_options.clone().with_parallel(self.settings.parallel);
            let patches = PatchBuilder::new(options).build(&self.mesh)?;
            log::debug!("rebuilt limit patches for generation {}", self.generation);
            self.patches = Some((key, patches));
        }
        self.patches
            .as_ref()
            .map(|(_, p)| p)
            .ok_or_else(|| MeshError::InvalidState("limit patches missing after rebuild".into()))
    }

    /// The last built limit patches, if any.
    pub fn patches(&self) -> Option<&Patches> {
        self.patches.as_ref().map(|(_, p)| p)
    }

    /// Move every grid point onto the limit surface at its UV.
    ///
    /// The first projection snaps points onto the surface. Later ones keep
    /// each point's offset in the tangent frame of the surface it was last
    /// projected onto, so detail follows the coarse mesh. Hidden points are
    /// left to their grid. Loops without a patch keep their current points.
    /// Returns the number of grids projected.
    pub fn reproject(&mut self) -> Result<usize> {
        self.update_patches()?;
        let Some((_, patches)) = self.patches.as_ref() else {
            return Ok(0);
        };
        let previous = self.projected.as_ref();

        let project = |(i, grid): (usize, &mut Option<G>)| -> usize {
            let Some(grid) = grid.as_mut() else { return 0 };
            let l = HalfEdgeId::new(i);
            let patch = match patches.get(l) {
                Ok(patch) => patch,
                Err(e) => {
                    log::warn!("{}; grid left unprojected", e);
                    return 0;
                }
            };
            let before = previous.and_then(|p| p.get(l).ok());

            let mut displaced = false;
            for point in grid.points_mut().iter_mut().filter(|p| !p.hidden) {
                let [u, v] = point.uv;
                let sample = patch.evaluate_full(u, v);
                point.no = sample.normal;
                let Some(before) = before else {
                    point.co = sample.position;
                    continue;
                };
                let offset = before.tangent_frame(u, v).to_local(&point.co);
                point.co = TangentFrame::from_derivatives(sample.position, sample.du, sample.dv)
                    .to_global(&offset);
                displaced |= offset.norm() > STITCH_EPS;
            }
            if displaced {
                grid.flag(RecalcFlags::NORMALS);
            }
            1
        };

        let projected: usize = if self.settings.parallel {
            self.grids.par_iter_mut().enumerate().map(project).sum()
        } else {
            self.grids.iter_mut().enumerate().map(project).sum()
        };
        self.projected = Some(patches.clone());
        Ok(projected)
    }

    /// Flush the caches of every grid and relink the ones that ask for it.
    ///
    /// Returns the number of grids relinked.
    pub fn update(&mut self) -> usize {
        let key = CacheKey {
            generation: self.generation,
            active_layer: self.active_layer,
        };
        let relink: Vec<HalfEdgeId> = self
            .grids
            .iter_mut()
            .enumerate()
            .filter_map(|(i, grid)| {
                let grid = grid.as_mut()?;
                grid.update(key)
                    .contains(RecalcFlags::NEIGHBORS)
                    .then(|| HalfEdgeId::new(i))
            })
            .collect();

        for &l in &relink {
            if let Err(e) = self.recalc_neighbors_for(l) {
                log::debug!("relink of loop {} skipped: {}", l.index(), e);
            }
        }
        relink.len()
    }

    /// Replace the grid settings and forward them to every grid.
    pub fn set_settings(&mut self, settings: GridSettings) {
        for grid in self.grids.iter_mut().flatten() {
            grid.apply_settings(&settings);
        }
        self.settings = settings;
    }

    /// All visible grid points and triangles as one indexed triangle soup.
    pub fn tessellate(&mut self) -> (Vec<Point3<f64>>, Vec<[usize; 3]>) {
        let mut positions = Vec::new();
        let mut triangles = Vec::new();
        for grid in self.grids.iter_mut().flatten() {
            let mut remap = Vec::with_capacity(grid.points().len());
            for p in grid.points() {
                remap.push(positions.len());
                if !p.hidden {
                    positions.push(p.co);
                }
            }
            triangles.extend(grid.triangles().iter().map(|t| t.map(|i| remap[i])));
        }
        (positions, triangles)
    }
}

fn link_hidden(points: &[GridPoint], link: &BoundaryLink) -> bool {
    let hidden = |p: usize| points.get(p).is_some_and(|q| q.hidden);
    hidden(link.point) || link.blend.is_some_and(|(q, _)| hidden(q))
}
