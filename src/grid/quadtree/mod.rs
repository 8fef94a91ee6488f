//! Adaptive quadtree grids.
//!
//! A [`QuadTreeGrid`] covers the same unit square as a
//! [`UniformGrid`](super::UniformGrid) but refines it locally. Nodes live in a
//! flat `Vec<QuadNode>` and address each other by index; points live in a
//! separate array and are shared between the nodes that touch them.
//!
//! Points are welded on creation through a UV hash. Polygons are derived by
//! walking the edges of every effective leaf at the step size of the deepest
//! leaf and fanning around the leaf center, which absorbs differences in depth
//! between neighbors without ever producing a T-junction.
//!
//! Under a depth limit, points below the limit are hidden and stored as
//! offsets in the frame of the coarser bilinear surface around them, so edits
//! made at the limit carry the finer detail along when the limit is lifted.

mod node;
mod topo;

pub use node::{
    decode_nodes, encode_nodes, layout, NodeFlags, QuadNode, DOWN, LEFT, MAX_DEPTH, RIGHT, UP,
};
pub use topo::{uv_key, SideHit, TopoVertex, Topology};

use std::collections::HashMap;

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use super::{
    bilinear, check_dimension, corner_weights, BoundaryLink, BoundaryMap, CacheKey, CustomData,
    Grid, GridAttributes, GridCache, GridPoint, GridSettings, LoopQuad, RecalcFlags,
};
use crate::error::{MeshError, Result};
use crate::mesh::{HalfEdgeId, HalfEdgeMesh};
use crate::patch::TangentFrame;

/// Quantization of the point-welding hash. Fine enough for node centers at
/// [`MAX_DEPTH`].
const POINT_RESOLUTION: f64 = (1u64 << (MAX_DEPTH + 1)) as f64;

/// Root box corners followed by its center.
const ROOT_UVS: [[f64; 2]; 5] = [[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.5, 0.5]];

/// An adaptively refined grid over one face corner.
#[derive(Debug, Clone, Default)]
pub struct QuadTreeGrid {
    dimension: usize,
    nodes: Vec<QuadNode>,
    points: Vec<GridPoint>,
    attrs: GridAttributes,
    point_hash: HashMap<(i64, i64), usize>,
    topo: Option<Topology>,
    polys: Vec<[usize; 3]>,
    polys_valid: bool,
    depth_limit: Option<u32>,
    tangent: bool,
    cache: GridCache,
}

/// The parent box a new point is interpolated from.
struct Cell {
    min: [f64; 2],
    max: [f64; 2],
    points: [usize; 4],
    corners: [Point3<f64>; 4],
    normals: [Point3<f64>; 4],
}

impl Cell {
    fn local(&self, uv: [f64; 2]) -> (f64, f64) {
        (
            (uv[0] - self.min[0]) / (self.max[0] - self.min[0]),
            (uv[1] - self.min[1]) / (self.max[1] - self.min[1]),
        )
    }
}

impl QuadTreeGrid {
    /// Create an empty grid. Call [`Grid::init`] before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// All nodes, including dead ones that have not been compacted yet.
    pub fn nodes(&self) -> &[QuadNode] {
        &self.nodes
    }

    /// One node.
    pub fn node(&self, n: usize) -> Option<&QuadNode> {
        self.nodes.get(n)
    }

    /// Depth treated as a leaf, if limited.
    pub fn depth_limit(&self) -> Option<u32> {
        self.depth_limit
    }

    /// Change the depth limit. Invalidates topology when it changes.
    ///
    /// Hidden points are brought back to world space against the surface at
    /// the old limit, then stored relative to the surface at the new one.
    pub fn set_depth_limit(&mut self, limit: Option<u32>) {
        if limit != self.depth_limit {
            self.to_world_space();
            self.depth_limit = limit;
            self.to_tangent_space();
            self.invalidate();
        }
    }

    /// Point positions in world space, hidden points included.
    pub fn world_positions(&self) -> Vec<Point3<f64>> {
        let mut co: Vec<Point3<f64>> = self.points.iter().map(|p| p.co).collect();
        if self.tangent {
            for (p, frame) in self.hidden_order() {
                let node = &self.nodes[frame];
                let corners = node.points.map(|q| co[q]);
                let offset = co[p].coords;
                co[p] = surface_frame(node, &corners, self.points[p].uv).to_global(&offset);
            }
        }
        co
    }

    /// Points below the depth limit, coarsest first, each with the node whose
    /// surface frames it.
    ///
    /// A corner first appearing at depth `d` is framed by its parent; a center
    /// no child uses is framed by its own node. Frame corners always sit at a
    /// coarser level than the point.
    fn hidden_order(&self) -> Vec<(usize, usize)> {
        let Some(limit) = self.depth_limit else {
            return Vec::new();
        };

        let mut visible = vec![false; self.points.len()];
        for n in self.leaves() {
            let node = &self.nodes[n];
            for &p in node.points.iter().chain(&node.center) {
                visible[p] = true;
            }
        }

        let mut owner: Vec<Option<(u32, usize)>> = vec![None; self.points.len()];
        let mut offer = |p: usize, level: u32, frame: usize| {
            if owner[p].map_or(true, |(l, _)| level < l) {
                owner[p] = Some((level, frame));
            }
        };
        for (n, node) in self.nodes.iter().enumerate() {
            if node.is_dead() || node.depth <= limit {
                continue;
            }
            if let Some(parent) = node.parent {
                for &p in &node.points {
                    offer(p, node.depth, parent);
                }
            }
            if let Some(c) = node.center {
                offer(c, node.depth + 1, n);
            }
        }

        let mut order: Vec<(u32, usize, usize)> = owner
            .iter()
            .enumerate()
            .filter(|&(p, _)| !visible[p])
            .filter_map(|(p, o)| o.map(|(level, frame)| (level, p, frame)))
            .collect();
        order.sort_unstable();
        order.into_iter().map(|(_, p, frame)| (p, frame)).collect()
    }

    /// Store hidden points as offsets, finest first.
    fn to_tangent_space(&mut self) {
        if self.tangent || self.depth_limit.is_none() {
            return;
        }
        for (p, frame) in self.hidden_order().into_iter().rev() {
            let node = &self.nodes[frame];
            let corners = node.points.map(|q| self.points[q].co);
            let f = surface_frame(node, &corners, self.points[p].uv);
            let point = &mut self.points[p];
            point.co = Point3::from(f.to_local(&point.co));
            point.hidden = true;
        }
        self.tangent = true;
    }

    /// Turn hidden offsets back into positions, coarsest first.
    fn to_world_space(&mut self) {
        if !self.tangent {
            return;
        }
        let world = self.world_positions();
        for (point, co) in self.points.iter_mut().zip(world) {
            point.co = co;
            point.hidden = false;
        }
        self.tangent = false;
    }

    /// Run a structural edit with every point in world space.
    fn in_world_space<R>(&mut self, edit: impl FnOnce(&mut Self) -> R) -> R {
        self.to_world_space();
        let out = edit(self);
        self.to_tangent_space();
        out
    }

    /// Point handle at a UV, if one has been created there.
    pub fn point_at_uv(&self, uv: [f64; 2]) -> Option<usize> {
        self.point_hash.get(&uv_key(uv, POINT_RESOLUTION)).copied()
    }

    fn invalidate(&mut self) {
        self.topo = None;
        self.polys_valid = false;
        self.cache.flag(RecalcFlags::ALL);
    }

    fn is_limited(&self, node: &QuadNode) -> bool {
        self.depth_limit.is_some_and(|d| node.depth >= d)
    }

    fn add_point(&mut self, co: Point3<f64>, no: Vector3<f64>, uv: [f64; 2]) -> usize {
        let p = self.points.len();
        let mut point = GridPoint::new(co, uv);
        point.no = no;
        self.points.push(point);
        self.attrs.push_point();
        self.point_hash.insert(uv_key(uv, POINT_RESOLUTION), p);
        p
    }

    fn weld_or_create(&mut self, uv: [f64; 2], cell: &Cell) -> usize {
        if let Some(p) = self.point_at_uv(uv) {
            return p;
        }
        let (s, t) = cell.local(uv);
        let no = bilinear(&cell.normals, s, t).coords;
        let p = self.add_point(
            bilinear(&cell.corners, s, t),
            no.try_normalize(1e-300).unwrap_or_else(Vector3::zeros),
            uv,
        );
        self.attrs.interpolate(p, &cell.points, &corner_weights(s, t));
        p
    }

    fn live_node(&self, n: usize) -> Result<&QuadNode> {
        let Some(node) = self.nodes.get(n) else {
            log::error!("quadtree node {} does not exist ({} nodes)", n, self.nodes.len());
            return Err(MeshError::invalid_param("node", n, "no such node"));
        };
        if node.is_dead() {
            log::error!("quadtree node {} is dead", n);
            return Err(MeshError::DeadNode { node: n });
        }
        Ok(node)
    }

    fn refresh_subtree_depths(&mut self, from: usize) {
        let mut cur = Some(from);
        while let Some(n) = cur {
            let depth = match self.nodes[n].children {
                Some(children) => {
                    children
                        .iter()
                        .map(|&c| self.nodes[c].subtree_depth)
                        .max()
                        .unwrap_or(0)
                        + 1
                }
                None => 0,
            };
            self.nodes[n].subtree_depth = depth;
            cur = self.nodes[n].parent;
        }
    }

    /// Split a leaf into four children. Returns the child handles.
    ///
    /// Child corners that coincide with existing points reuse them; new points
    /// are bilinear blends of the parent's corners, attributes included.
    pub fn subdivide(&mut self, n: usize) -> Result<[usize; 4]> {
        if self.tangent && self.is_limited(self.live_node(n)?) {
            return self.in_world_space(|grid| grid.split(n));
        }
        self.split(n)
    }

    fn split(&mut self, n: usize) -> Result<[usize; 4]> {
        let node = self.live_node(n)?;
        if !node.is_leaf() {
            log::error!("cannot subdivide quadtree node {}: not a leaf", n);
            return Err(MeshError::NotALeaf { node: n });
        }
        if node.depth >= MAX_DEPTH {
            log::error!("cannot subdivide quadtree node {}: depth {}", n, node.depth);
            return Err(MeshError::MaxDepthExceeded {
                node: n,
                max: MAX_DEPTH,
            });
        }

        let cell = Cell {
            min: node.min,
            max: node.max,
            points: node.points,
            corners: node.points.map(|p| self.points[p].co),
            normals: node.points.map(|p| Point3::from(self.points[p].no)),
        };
        let depth = node.depth;
        let mid = node.center_uv();
        let us = [cell.min[0], mid[0], cell.max[0]];
        let vs = [cell.min[1], mid[1], cell.max[1]];

        let mut lattice = [[0usize; 3]; 3];
        for (i, &u) in us.iter().enumerate() {
            for (j, &v) in vs.iter().enumerate() {
                lattice[i][j] = self.weld_or_create([u, v], &cell);
            }
        }

        let mut children = [0usize; 4];
        for j in 0..2 {
            for i in 0..2 {
                let points = [
                    lattice[i][j],
                    lattice[i][j + 1],
                    lattice[i + 1][j + 1],
                    lattice[i + 1][j],
                ];
                let mut child =
                    QuadNode::leaf([us[i], vs[j]], [us[i + 1], vs[j + 1]], depth + 1, points);
                child.parent = Some(n);
                child.center = self.point_at_uv(child.center_uv());
                children[j * 2 + i] = self.nodes.len();
                self.nodes.push(child);
            }
        }

        let parent = &mut self.nodes[n];
        parent.children = Some(children);
        parent.flags.remove(NodeFlags::LEAF);
        parent.center = Some(lattice[1][1]);

        self.refresh_subtree_depths(n);
        self.invalidate();
        Ok(children)
    }

    /// Subdivide every current leaf once. Returns how many were split.
    pub fn subdivide_all(&mut self) -> Result<usize> {
        self.in_world_space(Self::split_leaves)
    }

    fn split_leaves(&mut self) -> Result<usize> {
        let leaves: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_leaf() && !node.is_dead())
            .map(|(n, _)| n)
            .collect();
        for &n in &leaves {
            self.split(n)?;
        }
        Ok(leaves.len())
    }

    /// Remove the subtree below `n`, turning it back into a leaf.
    ///
    /// Descendants are only marked dead; [`QuadTreeGrid::compact_nodes`]
    /// reclaims them. Returns the number of nodes killed.
    pub fn collapse(&mut self, n: usize) -> Result<usize> {
        if self.live_node(n)?.children.is_none() {
            return Ok(0);
        }
        self.in_world_space(|grid| grid.kill_subtree(n))
    }

    fn kill_subtree(&mut self, n: usize) -> Result<usize> {
        let Some(children) = self.live_node(n)?.children else {
            return Ok(0);
        };

        let mut stack = children.to_vec();
        let mut killed = 0;
        while let Some(c) = stack.pop() {
            let child = &mut self.nodes[c];
            if let Some(grand) = child.children.take() {
                stack.extend(grand);
            }
            child.flags = NodeFlags::DEAD;
            child.center = None;
            killed += 1;
        }

        let node = &mut self.nodes[n];
        node.children = None;
        node.flags.insert(NodeFlags::LEAF);
        self.refresh_subtree_depths(n);
        self.invalidate();
        Ok(killed)
    }

    /// Drop dead nodes and remap node handles. Returns the number removed.
    pub fn compact_nodes(&mut self) -> usize {
        let mut remap = vec![None; self.nodes.len()];
        let mut live = 0;
        for (i, node) in self.nodes.iter().enumerate() {
            if !node.is_dead() {
                remap[i] = Some(live);
                live += 1;
            }
        }
        let removed = self.nodes.len() - live;
        if removed == 0 {
            return 0;
        }

        let old = std::mem::take(&mut self.nodes);
        self.nodes = old
            .into_iter()
            .filter(|node| !node.is_dead())
            .map(|mut node| {
                node.parent = node.parent.and_then(|p| remap[p]);
                node.children = node.children.and_then(|c| {
                    Some([remap[c[0]]?, remap[c[1]]?, remap[c[2]]?, remap[c[3]]?])
                });
                node.neighbors = node.neighbors.map(|nb| nb.and_then(|k| remap[k]));
                node
            })
            .collect();

        log::debug!("compacted {} dead quadtree nodes", removed);
        self.invalidate();
        removed
    }

    /// Drop points no live node references and remap point handles.
    ///
    /// Compacts the nodes first. Boundary links on this grid are cleared, and
    /// links held by neighbors become stale until the next neighbor pass.
    /// Returns the number of points removed.
    pub fn prune_dead_points(&mut self) -> usize {
        self.compact_nodes();

        let mut used = vec![false; self.points.len()];
        for node in &self.nodes {
            for &p in &node.points {
                used[p] = true;
            }
            if let Some(c) = node.center {
                used[c] = true;
            }
        }

        let mut remap = vec![None; self.points.len()];
        let mut kept = 0;
        for (i, &u) in used.iter().enumerate() {
            if u {
                remap[i] = Some(kept);
                kept += 1;
            }
        }
        let removed = self.points.len() - kept;
        if removed == 0 {
            return 0;
        }

        let old = std::mem::take(&mut self.points);
        self.points = old
            .into_iter()
            .zip(&used)
            .filter_map(|(p, &u)| u.then_some(p))
            .collect();
        self.attrs.remap_points(&remap, kept);

        for node in &mut self.nodes {
            for p in &mut node.points {
                if let Some(q) = remap[*p] {
                    *p = q;
                }
            }
            node.center = node.center.and_then(|c| remap[c]);
        }

        self.point_hash = self
            .points
            .iter()
            .enumerate()
            .map(|(i, p)| (uv_key(p.uv, POINT_RESOLUTION), i))
            .collect();
        self.clear_links();

        log::debug!("pruned {} unreferenced grid points", removed);
        self.invalidate();
        removed
    }

    /// Give every live node a center point, the average of its corners.
    ///
    /// Returns the number of points created.
    pub fn ensure_centers(&mut self) -> usize {
        let missing = self
            .nodes
            .iter()
            .any(|node| node.center.is_none() && !node.is_dead());
        if !missing {
            return 0;
        }
        self.in_world_space(Self::create_centers)
    }

    fn create_centers(&mut self) -> usize {
        let mut created = 0;
        for n in 0..self.nodes.len() {
            let node = &self.nodes[n];
            if node.center.is_some() || node.is_dead() {
                continue;
            }
            let uv = node.center_uv();
            let sources = node.points;

            let p = match self.point_at_uv(uv) {
                Some(p) => p,
                None => {
                    let sum = sources
                        .iter()
                        .fold(Vector3::zeros(), |acc, &s| acc + self.points[s].co.coords);
                    let no = sources
                        .iter()
                        .fold(Vector3::zeros(), |acc, &s| acc + self.points[s].no);
                    let p = self.add_point(
                        Point3::from(sum * 0.25),
                        no.try_normalize(1e-300).unwrap_or_else(Vector3::zeros),
                        uv,
                    );
                    self.attrs.interpolate(p, &sources, &[0.25; 4]);
                    created += 1;
                    p
                }
            };
            self.nodes[n].center = Some(p);
        }
        created
    }

    /// Effective leaves in depth-first order.
    ///
    /// With a depth limit, nodes at the limit count as leaves even if they have
    /// children.
    pub fn leaves(&self) -> Vec<usize> {
        let mut out = Vec::new();
        if self.nodes.is_empty() {
            return out;
        }
        let mut stack = vec![0];
        while let Some(n) = stack.pop() {
            let node = &self.nodes[n];
            if node.is_dead() {
                continue;
            }
            match node.children {
                Some(children) if !self.is_limited(node) => stack.extend(children.iter().rev()),
                _ => out.push(n),
            }
        }
        out
    }

    /// Effective leaf containing `(u, v)`.
    pub fn leaf_at(&self, u: f64, v: f64) -> Option<usize> {
        let root = self.nodes.first()?;
        if root.is_dead() || !root.contains([u, v]) {
            return None;
        }
        let mut n = 0;
        loop {
            let node = &self.nodes[n];
            match node.children {
                Some(children) if !self.is_limited(node) => {
                    let mid = node.center_uv();
                    let i = (u >= mid[0]) as usize;
                    let j = (v >= mid[1]) as usize;
                    n = children[j * 2 + i];
                }
                _ => return Some(n),
            }
        }
    }

    /// Vertex/edge graph over the effective leaves, rebuilt if stale.
    pub fn topology(&mut self) -> &Topology {
        let topo = match self.topo.take() {
            Some(topo) => topo,
            None => {
                self.ensure_centers();
                Topology::build(&self.nodes, &self.points, self.leaves())
            }
        };
        self.topo.insert(topo)
    }

    /// The cached topology, if it is current.
    pub fn cached_topology(&self) -> Option<&Topology> {
        self.topo.as_ref()
    }

    /// Rebuild the triangle list and each leaf's triangle range.
    ///
    /// Leaves whose corners do not resolve to four distinct points contribute no
    /// triangles.
    pub fn rebuild_node_polys(&mut self) {
        self.topology();
        let Some(topo) = self.topo.as_ref() else {
            return;
        };

        for node in &mut self.nodes {
            node.poly_range = (0, 0);
            node.quad_index = None;
        }
        self.polys.clear();

        let step = 1.0 / (1u64 << topo.max_depth) as f64;
        let mut ring = Vec::new();
        let mut quad_index = 0;

        for &n in &topo.leaves {
            let node = &self.nodes[n];
            let start = self.polys.len();
            let uvs = node.corner_uvs();
            let ids = uvs.map(|uv| topo.lookup(uv));

            let (corners, center) = match (ids, topo.lookup(node.center_uv())) {
                ([Some(a), Some(b), Some(c), Some(d)], Some(center))
                    if a != b && a != c && a != d && b != c && b != d && c != d =>
                {
                    ([a, b, c, d], center)
                }
                _ => {
                    log::debug!("leaf {} does not map to four distinct points; skipped", n);
                    self.nodes[n].poly_range = (start, start);
                    continue;
                }
            };

            ring.clear();
            for k in 0..4 {
                let (a, b) = (uvs[k], uvs[(k + 1) % 4]);
                ring.push(corners[k]);
                let len = (b[0] - a[0]).abs().max((b[1] - a[1]).abs());
                let steps = (len / step).round() as usize;
                for s in 1..steps {
                    let t = s as f64 / steps as f64;
                    let uv = [a[0] + (b[0] - a[0]) * t, a[1] + (b[1] - a[1]) * t];
                    if let Some(p) = topo.lookup(uv) {
                        ring.push(p);
                    }
                }
            }
            for k in 0..ring.len() {
                self.polys.push([center, ring[k], ring[(k + 1) % ring.len()]]);
            }

            let node = &mut self.nodes[n];
            node.poly_range = (start, self.polys.len());
            node.quad_index = Some(quad_index);
            quad_index += 1;
        }

        // Informational neighbor pointers
        const EPS: f64 = 1e-9;
        for &n in &topo.leaves {
            let node = &self.nodes[n];
            let c = node.center_uv();
            let hu = (node.max[0] - node.min[0]) * 0.5 + EPS;
            let hv = (node.max[1] - node.min[1]) * 0.5 + EPS;
            let mut neighbors = [None; 4];
            neighbors[LEFT] = self.leaf_at(c[0] - hu, c[1]);
            neighbors[RIGHT] = self.leaf_at(c[0] + hu, c[1]);
            neighbors[UP] = self.leaf_at(c[0], c[1] + hv);
            neighbors[DOWN] = self.leaf_at(c[0], c[1] - hv);
            self.nodes[n].neighbors = neighbors;
        }

        self.polys_valid = true;
    }

    /// Persistable form of the grid.
    pub fn to_record(&self) -> QuadTreeRecord {
        QuadTreeRecord {
            version: layout::VERSION,
            stride: layout::NODE_FIELDS,
            dimension: self.dimension,
            nodes: encode_nodes(&self.nodes),
            points: self.world_positions().iter().map(|co| [co.x, co.y, co.z]).collect(),
            custom_data_layout: self.attrs.layout(),
            layers: self.attrs.layers().iter().map(|l| l.raw().to_vec()).collect(),
        }
    }

    /// Rebuild a grid from its record, migrating older node layouts.
    ///
    /// Point UVs are recovered from the node boxes. Attribute layers must be
    /// relinked afterwards.
    pub fn from_record(record: QuadTreeRecord) -> Result<Self> {
        check_dimension(record.dimension).map_err(|e| MeshError::Migration(e.to_string()))?;
        let nodes = decode_nodes(&record.nodes, record.version, record.stride)?;

        let len = record.points.len();
        let mut uvs: Vec<Option<[f64; 2]>> = vec![None; len];
        for (n, node) in nodes.iter().enumerate() {
            let center = node.center.map(|c| (c, node.center_uv()));
            for (p, uv) in node.points.iter().copied().zip(node.corner_uvs()).chain(center) {
                let Some(slot) = uvs.get_mut(p) else {
                    return Err(MeshError::Migration(format!(
                        "node {} references point {} of {}",
                        n, p, len
                    )));
                };
                *slot = Some(uv);
            }
        }

        let points = record
            .points
            .iter()
            .zip(&uvs)
            .map(|(co, uv)| GridPoint::new(Point3::new(co[0], co[1], co[2]), uv.unwrap_or([0.0; 2])))
            .collect();
        let point_hash = uvs
            .iter()
            .enumerate()
            .filter_map(|(i, uv)| uv.map(|uv| (uv_key(uv, POINT_RESOLUTION), i)))
            .collect();

        let mut grid = Self {
            dimension: record.dimension,
            nodes,
            points,
            attrs: GridAttributes::from_layout(&record.custom_data_layout, record.layers, len)?,
            point_hash,
            topo: None,
            polys: Vec::new(),
            polys_valid: false,
            depth_limit: None,
            tangent: false,
            cache: GridCache::default(),
        };
        grid.rebuild_node_polys();
        grid.recalc_normals();
        Ok(grid)
    }
}

impl Grid for QuadTreeGrid {
    fn init(
        &mut self,
        mesh: &HalfEdgeMesh,
        l: HalfEdgeId,
        dimension: usize,
        cd: &CustomData,
    ) -> Result<()> {
        let seed_depth = check_dimension(dimension)?;
        let quad = LoopQuad::new(mesh, l)?;

        self.dimension = dimension;
        self.nodes.clear();
        self.points.clear();
        self.point_hash.clear();
        self.polys.clear();
        self.attrs = GridAttributes::from_mesh(cd);
        self.tangent = false;
        self.invalidate();

        for uv in ROOT_UVS {
            let p = self.add_point(quad.eval(uv[0], uv[1]), Vector3::zeros(), uv);
            let (loops, weights) = quad.loop_weights(uv[0], uv[1]);
            self.attrs.interpolate_from_mesh(p, cd, &loops, &weights);
        }
        let mut root = QuadNode::leaf([0.0, 0.0], [1.0, 1.0], 0, [0, 1, 2, 3]);
        root.center = Some(4);
        self.nodes.push(root);

        for _ in 0..seed_depth {
            self.split_leaves()?;
        }
        self.to_tangent_space();

        self.rebuild_node_polys();
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
        self.nodes.first().map(|root| root.points[2])
    }

    fn triangles(&mut self) -> &[[usize; 3]] {
        if !self.polys_valid && !self.nodes.is_empty() {
            self.rebuild_node_polys();
        }
        &self.polys
    }

    /// Area-weighted point normals, plus each effective leaf's fan normal.
    ///
    /// Every effective leaf owns one contiguous range of the triangle list, so
    /// a single pass over the list visits each leaf's fan exactly once. That
    /// matches accumulating leaf by leaf from the bottom of the tree, without
    /// the descent. Interior nodes own no range and keep a zero normal.
    fn recalc_normals(&mut self) {
        if !self.polys_valid {
            self.rebuild_node_polys();
        }
        for p in &mut self.points {
            p.no = Vector3::zeros();
        }

        let face_normal = |points: &[GridPoint], [a, b, c]: [usize; 3]| {
            let pa = points[a].co;
            (points[b].co - pa).cross(&(points[c].co - pa))
        };

        for &tri in &self.polys {
            let n = face_normal(&self.points, tri);
            for p in tri {
                self.points[p].no += n;
            }
        }
        for p in &mut self.points {
            p.no = p.no.try_normalize(1e-300).unwrap_or_else(Vector3::zeros);
        }

        for node in &mut self.nodes {
            let (start, end) = node.poly_range;
            let sum = self.polys[start..end]
                .iter()
                .fold(Vector3::zeros(), |acc, &tri| acc + face_normal(&self.points, tri));
            node.normal = sum.try_normalize(1e-300).unwrap_or_else(Vector3::zeros);
        }
    }

    fn link_boundary(&mut self, map: &BoundaryMap, other_loop: HalfEdgeId, other: &Self) -> usize {
        let Some(theirs) = other.topo.as_ref() else {
            log::debug!("grid of loop {:?} has no topology yet; links skipped", other_loop);
            return 0;
        };
        if self.nodes.is_empty() {
            return 0;
        }

        self.topology();
        let Some(own) = self.topo.as_ref() else {
            return 0;
        };
        let other_side = map.other_side();

        let links: Vec<(usize, BoundaryLink)> = own
            .side(map.own_side())
            .iter()
            .filter_map(|&(_, p)| {
                let t = map.own_param(self.points[p].uv);
                let s = other_side.param(map.uv(t).1);
                let link = match theirs.locate_on_side(other_side, s)? {
                    SideHit::Exact(q) => BoundaryLink::exact(other_loop, q),
                    SideHit::Between(a, b, f) => BoundaryLink::between(other_loop, a, b, f),
                };
                Some((p, link))
            })
            .collect();

        for &(p, link) in &links {
            self.points[p].link = Some(link);
        }
        links.len()
    }

    fn apply_settings(&mut self, settings: &GridSettings) {
        self.set_depth_limit(settings.effective_depth_limit());
    }

    fn flag(&mut self, flags: RecalcFlags) {
        self.cache.flag(flags);
    }

    fn update(&mut self, key: CacheKey) -> RecalcFlags {
        let work = self.cache.refresh(key);
        if self.nodes.is_empty() {
            return work & RecalcFlags::NEIGHBORS;
        }
        if work.contains(RecalcFlags::TOPO) {
            self.topo = None;
            self.polys_valid = false;
        }
        if work.contains(RecalcFlags::POLYS) {
            self.polys_valid = false;
        }
        if !self.polys_valid {
            self.rebuild_node_polys();
        }
        if work.contains(RecalcFlags::NORMALS) {
            self.recalc_normals();
        }
        work & RecalcFlags::NEIGHBORS
    }
}

/// Frame of a node's bilinear surface at a UV inside it.
fn surface_frame(node: &QuadNode, c: &[Point3<f64>; 4], uv: [f64; 2]) -> TangentFrame {
    let (s, t) = node.local(uv);
    let du = (c[3] - c[0]) * (1.0 - t) + (c[2] - c[1]) * t;
    let dv = (c[1] - c[0]) * (1.0 - s) + (c[2] - c[3]) * s;
    TangentFrame::from_derivatives(bilinear(c, s, t), du, dv)
}

/// Serialized form of a [`QuadTreeGrid`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuadTreeRecord {
    /// Node layout version.
    pub version: u32,
    /// Values per node in `nodes`.
    pub stride: usize,
    /// Dimension the grid was initialized with.
    pub dimension: usize,
    /// Flat node array.
    pub nodes: Vec<f64>,
    /// Point positions.
    pub points: Vec<[f64; 3]>,
    /// Attribute kind identifiers, in layer order.
    pub custom_data_layout: Vec<String>,
    /// Raw values per attribute layer.
    pub layers: Vec<Vec<f64>>,
}

impl QuadTreeRecord {
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
    use crate::mesh::{build_from_quads, FaceId};
    use approx::assert_relative_eq;
    use std::collections::HashSet;

    /// A face whose first loop's grid is the unit square: `co = (u, v, 0)`.
    fn unit_square_loop() -> (HalfEdgeMesh, HalfEdgeId) {
        let vertices = vec![
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(1.0, -1.0, 0.0),
            Point3::new(-1.0, -1.0, 0.0),
            Point3::new(-1.0, 1.0, 0.0),
        ];
        let mesh = build_from_quads(&vertices, &[[0, 1, 2, 3]]).unwrap();
        let l = mesh.face(FaceId::new(0)).halfedge;
        (mesh, l)
    }

    fn grid(dimension: usize) -> QuadTreeGrid {
        let (mesh, l) = unit_square_loop();
        let cd = CustomData::new(mesh.num_halfedges());
        let mut grid = QuadTreeGrid::new();
        grid.init(&mesh, l, dimension, &cd).unwrap();
        grid
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
    fn test_fresh_root_subdivide() {
        let mut grid = grid(2);
        assert_eq!(grid.nodes().len(), 1);
        assert_eq!(grid.points().len(), 5);

        let children = grid.subdivide(0).unwrap();
        assert_eq!(children, [1, 2, 3, 4]);
        assert!(grid.points().len() - 5 <= 5);
        assert_eq!(grid.points().len(), 9);
        assert!(children.iter().all(|&c| grid.nodes()[c].is_leaf()));
        assert!(!grid.nodes()[0].is_leaf());
        assert_eq!(grid.nodes()[0].subtree_depth, 1);

        let p = grid.point_at_uv([0.5, 0.0]).unwrap();
        assert_relative_eq!(grid.points()[p].co, Point3::new(0.5, 0.0, 0.0));
        assert_eq!(grid.point_at_uv([0.5, 0.5]), Some(4));
    }

    #[test]
    fn test_point_indices_stay_valid() {
        let mut grid = grid(3);
        grid.subdivide(1).unwrap();
        let fine = grid.nodes()[1].children.unwrap();
        grid.subdivide(fine[3]).unwrap();
        grid.subdivide(4).unwrap();

        let n_points = grid.points().len();
        for node in grid.nodes() {
            assert!(node.points.iter().all(|&p| p < n_points));
        }

        let leaves = grid.leaves();
        let topo = grid.topology();
        assert_eq!(topo.leaves, leaves);
        let unique: HashSet<usize> = topo.leaves.iter().copied().collect();
        assert_eq!(unique.len(), topo.leaves.len());
        for vertex in topo.vertices.values() {
            let unique: HashSet<usize> = vertex.nodes.iter().copied().collect();
            assert_eq!(unique.len(), vertex.nodes.len());
        }
    }

    #[test]
    fn test_uniform_triangle_count() {
        for k in 0..4u32 {
            let mut grid = grid((1 << k) + 1);
            assert_eq!(grid.triangles().len(), 4 * (1 << k) * (1 << k));
            assert_eq!(grid.leaves().len(), 1 << (2 * k));
        }
    }

    #[test]
    fn test_t_junction_fan() {
        let mut grid = grid(3);
        grid.subdivide(1).unwrap();
        assert_eq!(grid.triangles().len(), 16 + 5 + 5 + 4);

        let span = |n: usize| grid.nodes()[n].poly_range.1 - grid.nodes()[n].poly_range.0;
        assert_eq!(span(2), 5);
        assert_eq!(span(3), 5);
        assert_eq!(span(4), 4);

        let junction = grid.point_at_uv([0.5, 0.25]).unwrap();
        let (start, end) = grid.nodes()[2].poly_range;
        assert!(grid.polys[start..end].iter().any(|t| t.contains(&junction)));
    }

    #[test]
    fn test_leaf_neighbors() {
        let mut grid = grid(3);
        grid.triangles();
        assert_eq!(grid.leaf_at(0.75, 0.25), Some(2));
        assert_eq!(grid.nodes()[1].neighbors[RIGHT], Some(2));
        assert_eq!(grid.nodes()[1].neighbors[UP], Some(3));
        assert_eq!(grid.nodes()[1].neighbors[LEFT], None);
        assert_eq!(grid.nodes()[4].neighbors[DOWN], Some(2));
        assert_eq!(grid.leaf_at(1.5, 0.0), None);
    }

    #[test]
    fn test_collapse_compact_prune() {
        let mut grid = grid(5);
        assert_eq!(grid.nodes().len(), 21);

        assert_eq!(grid.collapse(1).unwrap(), 4);
        assert!(grid.nodes()[1].is_leaf());
        assert_eq!(grid.nodes()[0].subtree_depth, 2);
        assert_eq!(grid.leaves().len(), 13);
        assert_eq!(grid.triangles().len(), 12 * 4 + 6);

        assert_eq!(grid.compact_nodes(), 4);
        assert_eq!(grid.nodes().len(), 17);
        for (n, node) in grid.nodes().iter().enumerate() {
            if let Some(children) = node.children {
                for c in children {
                    assert!(c < 17);
                    assert_eq!(grid.nodes()[c].parent, Some(n));
                }
            }
        }

        let before = grid.triangles().len();
        assert_eq!(grid.prune_dead_points(), 6);
        assert_eq!(grid.triangles().len(), before);
        for node in grid.nodes() {
            for &p in &node.points {
                assert_relative_eq!(grid.points()[p].uv[0], grid.points()[p].co.x);
            }
        }
    }

    #[test]
    fn test_depth_limit() {
        let mut grid = grid(9);
        assert_eq!(grid.triangles().len(), 256);

        grid.apply_settings(&GridSettings::new().with_depth_limit(1));
        assert_eq!(grid.leaves().len(), 4);
        assert_eq!(grid.triangles().len(), 16);
        assert_eq!(grid.leaf_at(0.1, 0.1), Some(1));

        grid.apply_settings(&GridSettings::default());
        assert_eq!(grid.triangles().len(), 256);
    }

    #[test]
    fn test_depth_limit_keeps_hidden_detail() {
        let at = |grid: &QuadTreeGrid, u: f64, v: f64| grid.point_at_uv([u, v]).unwrap();
        let mut grid = grid(9);
        let detail = at(&grid, 0.375, 0.375);
        grid.points_mut()[detail].co.z += 0.1;
        let before = grid.points().to_vec();

        grid.set_depth_limit(Some(1));
        assert!(grid.points()[detail].hidden);
        assert!(grid.points()[at(&grid, 0.5, 0.25)].hidden);
        // Effective leaf centers stay visible
        assert!(!grid.points()[at(&grid, 0.25, 0.25)].hidden);
        assert_relative_eq!(grid.world_positions()[detail], before[detail].co, epsilon = 1e-12);

        grid.set_depth_limit(None);
        for (a, b) in grid.points().iter().zip(&before) {
            assert_relative_eq!(a.co, b.co, epsilon = 1e-12);
            assert!(!a.hidden);
        }

        // Raise the root center at the limit; finer points follow the coarse surface
        grid.set_depth_limit(Some(1));
        let center = at(&grid, 0.5, 0.5);
        grid.points_mut()[center].co.z += 1.0;
        grid.set_depth_limit(None);

        let z = |u: f64, v: f64| grid.points()[at(&grid, u, v)].co.z;
        assert_relative_eq!(z(0.5, 0.25), 0.5, epsilon = 1e-12);
        assert_relative_eq!(z(0.25, 0.5), 0.5, epsilon = 1e-12);
        assert_relative_eq!(z(0.125, 0.125), 0.0, epsilon = 1e-12);
        let surface = Point3::new(0.375, 0.375, 0.5);
        assert_relative_eq!((grid.points()[detail].co - surface).norm(), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_edits_below_depth_limit() {
        let mut grid = grid(5);
        grid.set_depth_limit(Some(1));
        assert_eq!(grid.subdivide_all().unwrap(), 16);
        let deep = grid
            .nodes()
            .iter()
            .position(|n| n.is_leaf() && !n.is_dead() && n.depth == 3)
            .unwrap();
        grid.subdivide(deep).unwrap();
        grid.collapse(2).unwrap();
        assert_eq!(grid.triangles().len(), 16);

        grid.set_depth_limit(None);
        for node in grid.nodes().iter().filter(|n| !n.is_dead()) {
            for &p in node.points.iter().chain(&node.center) {
                let point = &grid.points()[p];
                assert!(!point.hidden);
                assert_relative_eq!(point.co, Point3::new(point.uv[0], point.uv[1], 0.0), epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_normals_face_outward() {
        let vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let mesh = build_from_quads(&vertices, &[[0, 1, 2, 3]]).unwrap();
        let cd = CustomData::new(mesh.num_halfedges());
        for l in mesh.loop_ids() {
            let mut grid = QuadTreeGrid::new();
            grid.init(&mesh, l, 3, &cd).unwrap();
            grid.subdivide(1).unwrap();
            grid.recalc_normals();
            for p in grid.points() {
                assert_relative_eq!(p.no, Vector3::z(), epsilon = 1e-12);
            }
            assert_relative_eq!(grid.nodes()[2].normal, Vector3::z(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_normals_sum_leaf_fans() {
        let mut grid = grid(3);
        grid.subdivide(1).unwrap();
        let bump = grid.point_at_uv([0.25, 0.25]).unwrap();
        grid.points_mut()[bump].co.z = 0.3;
        grid.recalc_normals();

        let polys = grid.polys.clone();
        let tri_normal = |t: &[usize; 3]| {
            let p = grid.points();
            (p[t[1]].co - p[t[0]].co).cross(&(p[t[2]].co - p[t[0]].co))
        };
        for n in grid.leaves() {
            let (start, end) = grid.nodes()[n].poly_range;
            let sum: Vector3<f64> = polys[start..end].iter().map(tri_normal).sum();
            assert_relative_eq!(grid.nodes()[n].normal, sum.normalize(), epsilon = 1e-12);
        }
        assert_eq!(grid.nodes()[0].normal, Vector3::zeros());
        assert_eq!(grid.nodes()[1].normal, Vector3::zeros());

        let sum: Vector3<f64> = polys
            .iter()
            .filter(|t| t.contains(&bump))
            .map(tri_normal)
            .sum();
        assert_relative_eq!(grid.points()[bump].no, sum.normalize(), epsilon = 1e-12);
    }

    #[test]
    fn test_precondition_errors() {
        let mut grid = grid(3);
        assert!(matches!(grid.subdivide(0), Err(MeshError::NotALeaf { node: 0 })));
        assert!(matches!(
            grid.subdivide(99),
            Err(MeshError::InvalidParameter { .. })
        ));

        grid.subdivide(1).unwrap();
        grid.collapse(1).unwrap();
        assert!(matches!(grid.subdivide(5), Err(MeshError::DeadNode { node: 5 })));

        let mut deep = self::grid(2);
        let mut n = 0;
        for _ in 0..MAX_DEPTH {
            n = deep.subdivide(n).unwrap()[0];
        }
        assert!(matches!(
            deep.subdivide(n),
            Err(MeshError::MaxDepthExceeded { .. })
        ));
    }

    #[test]
    fn test_init_is_idempotent() {
        let (mesh, l) = unit_square_loop();
        let mut cd = CustomData::new(mesh.num_halfedges());
        let mask = cd.add_layer(AttrKind::Mask, "Mask");
        cd.set(mask, l.index(), &[0.25]);

        let mut grid = QuadTreeGrid::new();
        grid.init(&mesh, l, 5, &cd).unwrap();
        let first = grid.points().to_vec();
        grid.init(&mesh, l, 5, &cd).unwrap();
        assert_eq!(grid.points(), first.as_slice());
        assert_relative_eq!(grid.attributes().values(0, 2)[0], 0.25);
    }

    #[test]
    fn test_record_roundtrip() {
        let (mesh, l) = unit_square_loop();
        let mut cd = CustomData::new(mesh.num_halfedges());
        cd.add_layer(AttrKind::Color, "Col");
        let mut grid = QuadTreeGrid::new();
        grid.init(&mesh, l, 3, &cd).unwrap();
        grid.subdivide(1).unwrap();
        let triangles = grid.triangles().to_vec();

        let bytes = grid.to_record().encode().unwrap();
        let mut loaded =
            QuadTreeGrid::from_record(QuadTreeRecord::decode(&bytes).unwrap()).unwrap();
        loaded.relink_custom_data(&cd);

        assert_eq!(loaded.triangles(), triangles.as_slice());
        assert_eq!(loaded.nodes().len(), grid.nodes().len());
        for (a, b) in grid.points().iter().zip(loaded.points()) {
            assert_eq!(a.co, b.co);
            assert_eq!(a.uv, b.uv);
        }
        assert_eq!(loaded.attributes().layers(), grid.attributes().layers());
    }

    #[test]
    fn test_legacy_record_migrates() {
        use layout::v1;

        // Root plus four children over a 3x3 lattice, stored with flat offsets
        let lattice = |i: usize, j: usize| j * 3 + i;
        let points: Vec<[f64; 3]> = (0..9)
            .map(|k| [(k % 3) as f64 * 0.5, (k / 3) as f64 * 0.5, 0.0])
            .collect();

        let mut flat = vec![-1.0; 5 * v1::NODE_FIELDS];
        let mut write = |n: usize, min: [f64; 2], max: [f64; 2], corner: [usize; 4]| {
            let rec = &mut flat[n * v1::NODE_FIELDS..(n + 1) * v1::NODE_FIELDS];
            rec[layout::MIN_U] = min[0];
            rec[layout::MIN_V] = min[1];
            rec[layout::MAX_U] = max[0];
            rec[layout::MAX_V] = max[1];
            rec[layout::CENT_U] = (min[0] + max[0]) * 0.5;
            rec[layout::CENT_V] = (min[1] + max[1]) * 0.5;
            for k in 0..4 {
                rec[layout::POINT + k] = corner[k] as f64;
            }
            rec[v1::ID] = n as f64;
            if n == 0 {
                rec[layout::FLAG] = 0.0;
                rec[layout::DEPTH] = 0.0;
                rec[v1::SUBTREE_DEPTH] = 1.0;
                for k in 0..4 {
                    rec[layout::CHILD + k] = ((k + 1) * v1::NODE_FIELDS) as f64;
                }
            } else {
                rec[layout::FLAG] = NodeFlags::LEAF.bits() as f64;
                rec[layout::DEPTH] = 1.0;
                rec[v1::SUBTREE_DEPTH] = 0.0;
                rec[v1::PARENT] = 0.0;
            }
        };
        write(0, [0.0, 0.0], [1.0, 1.0], [lattice(0, 0), lattice(0, 2), lattice(2, 2), lattice(2, 0)]);
        for j in 0..2 {
            for i in 0..2 {
                let min = [i as f64 * 0.5, j as f64 * 0.5];
                let max = [min[0] + 0.5, min[1] + 0.5];
                let corner = [
                    lattice(i, j),
                    lattice(i, j + 1),
                    lattice(i + 1, j + 1),
                    lattice(i + 1, j),
                ];
                write(1 + j * 2 + i, min, max, corner);
            }
        }

        let record = QuadTreeRecord {
            version: v1::VERSION,
            stride: v1::NODE_FIELDS,
            dimension: 3,
            nodes: flat,
            points,
            custom_data_layout: Vec::new(),
            layers: Vec::new(),
        };
        let mut grid = QuadTreeGrid::from_record(record).unwrap();

        assert_eq!(grid.nodes()[0].children, Some([1, 2, 3, 4]));
        assert_eq!(grid.nodes()[3].parent, Some(0));
        // The root center already exists on the lattice
        assert_eq!(grid.points().len(), 9 + 4);
        assert_eq!(grid.triangles().len(), 16);
        let c = grid.nodes()[4].center.unwrap();
        assert_relative_eq!(grid.points()[c].co, Point3::new(0.75, 0.75, 0.0));
    }

    #[test]
    fn test_links_weld_across_depths() {
        let mesh = two_quads();
        let cd = CustomData::new(mesh.num_halfedges());

        let mut grids: Vec<Option<QuadTreeGrid>> = mesh
            .halfedge_ids()
            .map(|l| {
                mesh.is_loop(l).then(|| {
                    let mut g = QuadTreeGrid::new();
                    g.init(&mesh, l, 3, &cd).unwrap();
                    g
                })
            })
            .collect();

        // Refine one grid next to its two in-face boundaries
        let refined = mesh.face(FaceId::new(0)).halfedge;
        let g = grids[refined.index()].as_mut().unwrap();
        g.subdivide(1).unwrap();
        g.update(CacheKey::default());

        let mut linked = grids.clone();
        let mut blended = 0;
        for l in mesh.loop_ids() {
            let rel = mesh.loop_relations(l);
            for key in NeighborKey::BOUNDARY {
                let Some(other) = rel.get(key) else { continue };
                let case = VertexCase::of(&mesh, l, other);
                let map = NeighborResolver::lookup(NeighborKey::L, key, case).unwrap();
                let other_grid = grids[other.index()].as_ref().unwrap();
                let own = linked[l.index()].as_mut().unwrap();
                assert!(own.link_boundary(&map, other, other_grid) > 0);
            }
        }

        for l in mesh.loop_ids() {
            let grid = linked[l.index()].as_ref().unwrap();
            for p in grid.points() {
                let Some(link) = p.link else { continue };
                if !link.is_exact() {
                    blended += 1;
                }
                let target = grids[link.grid.index()].as_ref().unwrap();
                let pos = link.resolve(target.points()).unwrap();
                assert_relative_eq!(pos, p.co, epsilon = 1e-12);
            }
        }
        // The refined grid's new points on two boundaries land between coarse points
        assert_eq!(blended, 2);
    }
}
