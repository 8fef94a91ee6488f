//! Construction of limit patches from a once-refined mesh.

use std::sync::Arc;

use nalgebra::Point3;
use rayon::prelude::*;

use super::cubic::{CubicPatch, PatchKind};
use super::patch4::Patch4;
use crate::algo::subdivide::{catmull_clark_refine_with, smoothed_vertex};
use crate::error::{MeshError, Result};
use crate::grid::bilinear;
use crate::mesh::{HalfEdgeId, HalfEdgeMesh};

/// Options for patch construction.
#[derive(Debug, Clone)]
pub struct PatchOptions {
    /// Relative amount each corner quad is pushed away from its own center
    /// (default: 0.0).
    pub margin: f64,

    /// Whether to use parallel execution (default: true).
    pub parallel: bool,
}

impl PatchOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the quad margin.
    pub fn with_margin(mut self, margin: f64) -> Self {
        self.margin = margin;
        self
    }

    /// Set whether to use parallel execution.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Create options for single-threaded execution.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            margin: 0.0,
            parallel: true,
        }
    }
}

/// Limit patches of a coarse mesh, one [`Patch4`] per loop.
#[derive(Debug, Clone, Default)]
pub struct Patches {
    patches: Vec<Option<Patch4>>,
    regular: usize,
    extraordinary: usize,
}

impl Patches {
    /// The composite patch of a coarse loop.
    pub fn get(&self, l: HalfEdgeId) -> Result<&Patch4> {
        self.patches
            .get(l.index())
            .and_then(Option::as_ref)
            .ok_or(MeshError::MissingPatch(l.index()))
    }

    /// Number of half-edge slots, including boundary half-edges without a patch.
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Whether no slot exists.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Loops that have a patch.
    pub fn iter(&self) -> impl Iterator<Item = (HalfEdgeId, &Patch4)> + '_ {
        self.patches
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().map(|p| (HalfEdgeId::new(i), p)))
    }

    /// Number of refined patches built on a regular B-spline lattice.
    pub fn num_regular(&self) -> usize {
        self.regular
    }

    /// Number of refined patches built around extraordinary or boundary vertices.
    pub fn num_extraordinary(&self) -> usize {
        self.extraordinary
    }
}

type Quad = [Point3<f64>; 4];

/// Builds bicubic patches for every loop of a mesh.
///
/// The mesh is refined once with Catmull-Clark into a private copy. Every
/// refined loop gets a corner quad and a [`CubicPatch`]: regular vertices
/// borrow the quads of the surrounding loops to complete a uniform B-spline
/// net, every other vertex gets a Bezier net assembled from its neighbors.
/// Each coarse loop is then mapped to the four refined patches of its
/// corner sub-face.
#[derive(Debug, Clone, Default)]
pub struct PatchBuilder {
    options: PatchOptions,
}

impl PatchBuilder {
    /// Create a builder.
    pub fn new(options: PatchOptions) -> Self {
        Self { options }
    }

    /// The builder's options.
    pub fn options(&self) -> &PatchOptions {
        &self.options
    }

    /// Corner quad of a loop in `(0,0)`, `(0,1)`, `(1,1)`, `(1,0)` order.
    ///
    /// The vertex corner is the Catmull-Clark smoothed position; the edge
    /// corners are raw midpoints.
    pub fn build_quad(&self, mesh: &HalfEdgeMesh, l: HalfEdgeId) -> Result<Quad> {
        if !mesh.is_loop(l) {
            return Err(MeshError::invalid_param("loop", l.index(), "half-edge has no face"));
        }
        let v = mesh.loop_vertex(l);
        let co = *mesh.position(v);
        let mid = |other: HalfEdgeId| {
            let p = mesh.position(mesh.loop_vertex(other));
            Point3::from((co.coords + p.coords) * 0.5)
        };

        let mut quad = [
            mesh.face_centroid(mesh.face_of(l)),
            mid(mesh.prev(l)),
            smoothed_vertex(mesh, v),
            mid(mesh.next(l)),
        ];

        if self.options.margin != 0.0 {
            let center = Point3::from(quad.iter().map(|p| p.coords).sum::<nalgebra::Vector3<f64>>() / 4.0);
            let scale = 1.0 + self.options.margin;
            for p in &mut quad {
                *p = center + (*p - center) * scale;
            }
        }
        Ok(quad)
    }

    /// Initial patch of a loop, given the quads of every loop of `mesh`.
    ///
    /// Interior valence-4 vertices yield a regular net. Anything else, or a
    /// regular vertex whose neighborhood is incomplete, yields a blocky
    /// extraordinary net.
    pub fn build_patch(&self, mesh: &HalfEdgeMesh, l: HalfEdgeId, quads: &[Option<Quad>]) -> Result<CubicPatch> {
        let own = quads
            .get(l.index())
            .copied()
            .flatten()
            .ok_or(MeshError::MissingPatch(l.index()))?;

        let v = mesh.loop_vertex(l);
        if mesh.valence(v) != 4 || mesh.is_boundary_vertex(v) {
            return Ok(CubicPatch::blocky(&own));
        }
        match regular_net(mesh, l, quads) {
            Some(points) => Ok(CubicPatch::new(PatchKind::Regular, points)),
            None => {
                log::debug!("loop {} has an incomplete regular neighborhood", l.index());
                Ok(CubicPatch::blocky(&own))
            }
        }
    }

    /// Build the composite patches of every loop of `mesh`.
    pub fn build(&self, mesh: &HalfEdgeMesh) -> Result<Patches> {
        if mesh.num_faces() == 0 {
            return Err(MeshError::EmptyMesh);
        }

        let refinement = catmull_clark_refine_with(mesh, self.options.parallel)?;
        let refined = &refinement.mesh;
        let n = refined.num_halfedges();

        let quad_at = |i: usize| -> Result<Option<Quad>> {
            let l = HalfEdgeId::new(i);
            if !refined.is_loop(l) {
                return Ok(None);
            }
            self.build_quad(refined, l).map(Some)
        };
        let quads: Vec<Option<Quad>> = if self.options.parallel {
            (0..n).into_par_iter().map(quad_at).collect::<Result<_>>()?
        } else {
            (0..n).map(quad_at).collect::<Result<_>>()?
        };

        let patch_at = |i: usize| -> Result<Option<CubicPatch>> {
            let l = HalfEdgeId::new(i);
            if quads[i].is_none() {
                return Ok(None);
            }
            self.build_patch(refined, l, &quads).map(Some)
        };
        let mut patches: Vec<Option<CubicPatch>> = if self.options.parallel {
            (0..n).into_par_iter().map(patch_at).collect::<Result<_>>()?
        } else {
            (0..n).map(patch_at).collect::<Result<_>>()?
        };

        blend_extraordinary(refined, &mut patches);

        let mut regular = 0;
        let mut extraordinary = 0;
        for p in patches.iter().flatten() {
            match p.kind() {
                PatchKind::Regular => regular += 1,
                PatchKind::Extraordinary => extraordinary += 1,
            }
        }
        log::debug!(
            "built {} regular and {} extraordinary patches for {} faces",
            regular,
            extraordinary,
            mesh.num_faces()
        );

        let shared: Vec<Option<Arc<CubicPatch>>> = patches.into_iter().map(|p| p.map(Arc::new)).collect();
        let composite = |coarse: HalfEdgeId| -> Option<Patch4> {
            let a = refinement.corner_loop(coarse)?;
            let b = refined.next(a);
            let c = refined.next(b);
            let d = refined.prev(a);
            let get = |h: HalfEdgeId| shared.get(h.index()).cloned().flatten();
            Some(Patch4::new([get(a)?, get(b)?, get(c)?, get(d)?]))
        };

        Ok(Patches {
            patches: mesh.halfedge_ids().map(composite).collect(),
            regular,
            extraordinary,
        })
    }
}

/// Uniform B-spline net around an interior valence-4 loop.
///
/// With `l` at lattice point `(2, 2)`, `next` toward `(2, 0)` and `prev`
/// toward `(0, 2)`, the net collects quad corners of the three other loops
/// of the face and of the loops across both edges and the diagonal.
fn regular_net(mesh: &HalfEdgeMesh, l: HalfEdgeId, quads: &[Option<Quad>]) -> Option<[Point3<f64>; 16]> {
    let q = |h: HalfEdgeId| quads.get(h.index()).copied().flatten();

    let next = mesh.next(l);
    let prev = mesh.prev(l);
    let across = mesh.radial_next(l)?;
    let across_prev = mesh.radial_next(prev)?;
    let diagonal = mesh.next(mesh.radial_next(mesh.next(across))?);

    let own = q(l)?;
    let r = q(across)?;
    let rn = q(mesh.next(across))?;
    let n = q(next)?;
    let nn = q(mesh.next(next))?;
    let p = q(prev)?;
    let pr = q(across_prev)?;
    let prn = q(mesh.next(across_prev))?;
    let diag = q(diagonal)?;

    let mut net = CubicPatch::new(PatchKind::Regular, [Point3::origin(); 16]);
    net.set(1, 1, own[0]);
    net.set(1, 2, own[1]);
    net.set(2, 2, own[2]);
    net.set(2, 1, own[3]);

    net.set(3, 0, r[1]);
    net.set(3, 1, r[0]);
    net.set(3, 2, rn[3]);
    net.set(3, 3, diag[0]);

    net.set(1, 0, n[3]);
    net.set(2, 0, n[2]);
    net.set(0, 0, nn[2]);
    net.set(0, 1, nn[3]);
    net.set(0, 2, p[2]);

    net.set(0, 3, prn[3]);
    net.set(1, 3, pr[0]);
    net.set(2, 3, pr[1]);
    Some(*net.points())
}

fn is_extraordinary(patch: &Option<CubicPatch>) -> bool {
    matches!(patch, Some(p) if p.kind() == PatchKind::Extraordinary)
}

/// Loop across `l`'s edge that shares `l`'s vertex.
fn mirror_loop(mesh: &HalfEdgeMesh, l: HalfEdgeId) -> Option<usize> {
    mesh.radial_next(l).map(|r| mesh.next(r).index())
}

fn lerp(a: Point3<f64>, b: Point3<f64>, t: f64) -> Point3<f64> {
    a + (b - a) * t
}

/// Replace the blocky nets of extraordinary loops by Bezier nets.
///
/// Runs four passes, each over all extraordinary loops in loop order:
/// boundary rows from the neighboring patches of the same face, the vertex
/// column from the smoothed vertex (copied into the patch across the edge),
/// a bilinear interior, and finally a tangent correction that makes the
/// rows on both sides of each edge symmetric about it.
fn blend_extraordinary(mesh: &HalfEdgeMesh, patches: &mut [Option<CubicPatch>]) {
    let loops: Vec<HalfEdgeId> = mesh
        .loop_ids()
        .filter(|l| is_extraordinary(&patches[l.index()]))
        .collect();
    if loops.is_empty() {
        return;
    }

    let snapshot = patches.to_vec();
    for &l in &loops {
        if mesh.is_boundary_vertex(mesh.loop_vertex(l)) {
            continue;
        }
        let (Some(pn), Some(pp)) = (&snapshot[mesh.next(l).index()], &snapshot[mesh.prev(l).index()]) else {
            continue;
        };
        let Some(patch) = patches[l.index()].as_mut() else {
            continue;
        };
        patch.set(0, 0, lerp(pn.evaluate(0.0, 0.0), pp.evaluate(0.0, 0.0), 0.5));
        for (k, t) in [(1, 1.0 / 3.0), (2, 2.0 / 3.0), (3, 1.0)] {
            patch.set(k, 0, pn.evaluate(0.0, t));
            patch.set(0, k, pp.evaluate(t, 0.0));
        }
    }

    for &l in &loops {
        let lco = smoothed_vertex(mesh, mesh.loop_vertex(l));
        let Some(patch) = patches[l.index()].as_mut() else {
            continue;
        };
        let p30 = patch.get(3, 0);
        patch.set(3, 3, lco);
        patch.set(3, 1, lerp(lco, p30, 2.0 / 3.0));
        patch.set(3, 2, lerp(lco, p30, 1.0 / 3.0));
        let edge = [p30, patch.get(3, 1), patch.get(3, 2), lco];

        if let Some(other) = mirror_loop(mesh, l) {
            if let Some(p2) = patches[other].as_mut().filter(|p| p.kind() == PatchKind::Extraordinary) {
                for (k, &p) in edge.iter().enumerate() {
                    p2.set(k, 3, p);
                }
            }
        }
    }

    for &l in &loops {
        let Some(patch) = patches[l.index()].as_mut() else {
            continue;
        };
        let corners = [patch.get(0, 0), patch.get(0, 3), patch.get(3, 3), patch.get(3, 0)];
        patch.set(1, 1, bilinear(&corners, 1.0 / 3.0, 1.0 / 3.0));
        patch.set(1, 2, bilinear(&corners, 1.0 / 3.0, 2.0 / 3.0));
        patch.set(2, 2, bilinear(&corners, 2.0 / 3.0, 2.0 / 3.0));
        patch.set(2, 1, bilinear(&corners, 2.0 / 3.0, 1.0 / 3.0));
    }

    for &l in &loops {
        let Some(other) = mirror_loop(mesh, l) else {
            continue;
        };
        if other == l.index() || !is_extraordinary(&patches[other]) {
            continue;
        }
        let (Some(patch), Some(p2)) = (&patches[l.index()], &patches[other]) else {
            continue;
        };

        let mut rows = [(Point3::origin(), Point3::origin()); 2];
        for (slot, j) in rows.iter_mut().zip([1, 2]) {
            let a = patch.get(3, j);
            let d = (p2.get(j, 2) - patch.get(2, j)) * 0.75;
            *slot = (a - d, a + d);
        }

        for (j, (inner, outer)) in [1, 2].into_iter().zip(rows) {
            if let Some(patch) = patches[l.index()].as_mut() {
                patch.set(2, j, inner);
            }
            if let Some(p2) = patches[other].as_mut() {
                p2.set(j, 2, outer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::subdivide::catmull_clark_refine;
    use crate::grid::LoopQuad;
    use crate::mesh::fixtures::{cube, flat_grid, torus};
    use crate::mesh::FaceId;
    use approx::assert_relative_eq;

    #[test]
    fn test_build_quad_margin() {
        let mesh = flat_grid(2);
        let l = mesh.face_halfedges(FaceId::new(0)).next().unwrap();
        let plain = PatchBuilder::default().build_quad(&mesh, l).unwrap();
        let wide = PatchBuilder::new(PatchOptions::new().with_margin(0.5))
            .build_quad(&mesh, l)
            .unwrap();

        let center = Point3::from(plain.iter().map(|p| p.coords).sum::<nalgebra::Vector3<f64>>() / 4.0);
        for k in 0..4 {
            assert_relative_eq!(wide[k] - center, (plain[k] - center) * 1.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_flat_grid_matches_bilinear() {
        let mesh = flat_grid(6);
        let patches = PatchBuilder::default().build(&mesh).unwrap();

        for j in 1..5 {
            for i in 1..5 {
                for l in mesh.face_halfedges(FaceId::new(j * 6 + i)) {
                    let patch = patches.get(l).unwrap();
                    for sub in 0..4 {
                        assert_eq!(patch.sub_patch(sub).unwrap().kind(), PatchKind::Regular);
                    }
                    let quad = LoopQuad::new(&mesh, l).unwrap();
                    for &(u, v) in &[(0.1, 0.1), (0.3, 0.8), (0.75, 0.25), (0.9, 0.6), (1.0, 1.0)] {
                        let s = patch.evaluate_full(u, v);
                        assert_relative_eq!(s.position, quad.eval(u, v), epsilon = 1e-9);
                        assert_relative_eq!(s.normal, nalgebra::Vector3::z(), epsilon = 1e-9);
                    }
                }
            }
        }
    }

    #[test]
    fn test_regular_patches_are_continuous() {
        let mesh = torus(8, 8, 2.0, 0.5);
        let patches = PatchBuilder::new(PatchOptions::new().sequential()).build(&mesh).unwrap();
        assert_eq!(patches.num_extraordinary(), 0);
        assert_eq!(patches.num_regular(), mesh.num_halfedges() * 4);

        for (_, patch) in patches.iter() {
            let center = patch.sub_patch(0).unwrap().evaluate(0.0, 0.0);
            for sub in 1..4 {
                assert_relative_eq!(patch.sub_patch(sub).unwrap().evaluate(0.0, 0.0), center, epsilon = 1e-9);
            }
        }

        for v in mesh.vertex_ids() {
            let samples: Vec<_> = mesh
                .vertex_halfedges(v)
                .map(|l| patches.get(l).unwrap().evaluate_full(1.0, 1.0))
                .collect();
            assert_eq!(samples.len(), 4);
            for s in &samples[1..] {
                assert_relative_eq!(s.position, samples[0].position, epsilon = 1e-9);
                assert!(s.normal.dot(&samples[0].normal) > 0.999);
            }
        }
    }

    #[test]
    fn test_patch_seams_meet() {
        for mesh in [torus(6, 6, 2.0, 0.5), cube()] {
            let patches = PatchBuilder::new(PatchOptions::new().sequential()).build(&mesh).unwrap();
            for a in mesh.loop_ids() {
                let pa = patches.get(a).unwrap();
                let inner = patches.get(mesh.next(a)).unwrap();
                let across = patches.get(mesh.next(mesh.twin(a))).unwrap();
                for k in 0..=20 {
                    let t = k as f64 / 20.0;
                    // Face center to edge midpoint, then edge midpoint to vertex
                    assert_relative_eq!(pa.evaluate(t, 0.0), inner.evaluate(0.0, t), epsilon = 1e-9);
                    assert_relative_eq!(pa.evaluate(1.0, t), across.evaluate(t, 1.0), epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_extraordinary_vertices() {
        let mesh = cube();
        let patches = PatchBuilder::default().build(&mesh).unwrap();
        // 8 corners of valence 3, three refined loops each
        assert_eq!(patches.num_extraordinary(), 24);
        assert_eq!(patches.num_regular(), 72);

        let refined = catmull_clark_refine(&mesh).unwrap();
        for v in mesh.vertex_ids() {
            let expected = smoothed_vertex(&refined.mesh, v);
            for l in mesh.vertex_halfedges(v) {
                let patch = patches.get(l).unwrap();
                assert_eq!(patch.sub_patch(0).unwrap().kind(), PatchKind::Extraordinary);
                assert_relative_eq!(patch.evaluate(1.0, 1.0), expected, epsilon = 1e-12);

                for &(u, v) in &[(0.2, 0.2), (0.6, 0.4), (0.5, 0.9)] {
                    let s = patch.evaluate_full(u, v);
                    assert!(s.position.coords.iter().all(|c| c.is_finite()));
                    assert!((-0.5..=1.5).contains(&s.position.x));
                }
            }
        }
    }

    #[test]
    fn test_boundary_halfedges_have_no_patch() {
        let mesh = flat_grid(2);
        let patches = PatchBuilder::default().build(&mesh).unwrap();
        assert_eq!(patches.len(), mesh.num_halfedges());
        assert_eq!(patches.iter().count(), 16);

        let boundary = mesh.halfedge_ids().find(|&h| mesh.is_boundary_halfedge(h)).unwrap();
        assert!(matches!(patches.get(boundary), Err(MeshError::MissingPatch(_))));
    }

    #[test]
    fn test_empty_mesh() {
        assert!(matches!(
            PatchBuilder::default().build(&HalfEdgeMesh::new()),
            Err(MeshError::EmptyMesh)
        ));
    }
}
