//! Vertex/edge graph over the effective leaves of a quadtree.
//!
//! Connectivity between leaves of different depth is never stored explicitly.
//! It is recovered from a UV hash quantized at twice the resolution of the
//! deepest leaf, so that both corners and centers get distinct integer keys.

use std::collections::HashMap;

use super::node::QuadNode;
use crate::grid::{GridPoint, Side};

const SIDE_EPS: f64 = 1e-9;

/// Quantize a UV to integer hash coordinates.
#[inline]
pub fn uv_key(uv: [f64; 2], resolution: f64) -> (i64, i64) {
    (
        (uv[0] * resolution).round() as i64,
        (uv[1] * resolution).round() as i64,
    )
}

/// A point that is a corner or center of at least one effective leaf.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopoVertex {
    /// Parametric position.
    pub uv: [f64; 2],
    /// Leaves touching the point, without duplicates.
    pub nodes: Vec<usize>,
    /// Points connected to this one by a leaf edge or spoke.
    pub edges: Vec<usize>,
}

/// Where a boundary parameter lands on a grid side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SideHit {
    /// On an existing point.
    Exact(usize),
    /// Between two consecutive points, `t` measured from the first.
    Between(usize, usize, f64),
}

/// Derived connectivity of a quadtree grid.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// Deepest effective leaf.
    pub max_depth: u32,
    /// Side length of a uniform grid at `max_depth`.
    pub dimension: usize,
    /// Effective leaves in depth-first order.
    pub leaves: Vec<usize>,
    /// Vertex records keyed by point handle.
    pub vertices: HashMap<usize, TopoVertex>,
    /// Leaves using each edge, keyed by the unordered point pair.
    pub edges: HashMap<(usize, usize), Vec<usize>>,
    resolution: f64,
    uv_hash: HashMap<(i64, i64), usize>,
    sides: [Vec<(f64, usize)>; 4],
}

fn side_slot(side: Side) -> usize {
    match side {
        Side::Bottom => 0,
        Side::Top => 1,
        Side::Left => 2,
        Side::Right => 3,
    }
}

fn edge_key(a: usize, b: usize) -> (usize, usize) {
    (a.min(b), a.max(b))
}

impl Topology {
    /// Build the graph over `leaves`. Every leaf must have its center set.
    pub fn build(nodes: &[QuadNode], points: &[GridPoint], leaves: Vec<usize>) -> Self {
        let max_depth = leaves.iter().map(|&n| nodes[n].depth).max().unwrap_or(0);
        let resolution = (1u64 << (max_depth + 1)) as f64;

        let mut topo = Self {
            max_depth,
            dimension: (1usize << max_depth) + 1,
            leaves: Vec::new(),
            vertices: HashMap::new(),
            edges: HashMap::new(),
            resolution,
            uv_hash: HashMap::new(),
            sides: Default::default(),
        };

        for &n in &leaves {
            let node = &nodes[n];
            let Some(center) = node.center else {
                log::debug!("leaf {} has no center point; skipped in topology", n);
                continue;
            };

            for p in node.points.iter().copied().chain(std::iter::once(center)) {
                let vertex = topo.vertices.entry(p).or_insert_with(|| TopoVertex {
                    uv: points[p].uv,
                    ..Default::default()
                });
                if !vertex.nodes.contains(&n) {
                    vertex.nodes.push(n);
                }
                topo.uv_hash.insert(uv_key(points[p].uv, resolution), p);
            }

            for k in 0..4 {
                let a = node.points[k];
                topo.add_edge(a, node.points[(k + 1) % 4], n);
                topo.add_edge(center, a, n);
            }
        }

        for (&p, vertex) in &topo.vertices {
            for side in Side::ALL {
                if side.contains(vertex.uv, SIDE_EPS) {
                    topo.sides[side_slot(side)].push((side.param(vertex.uv), p));
                }
            }
        }
        for list in &mut topo.sides {
            list.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            list.dedup_by(|a, b| (a.0 - b.0).abs() <= SIDE_EPS);
        }

        topo.leaves = leaves;
        topo
    }

    fn add_edge(&mut self, a: usize, b: usize, node: usize) {
        if a == b {
            return;
        }
        let users = self.edges.entry(edge_key(a, b)).or_default();
        if !users.contains(&node) {
            users.push(node);
        }
        for (from, to) in [(a, b), (b, a)] {
            if let Some(vertex) = self.vertices.get_mut(&from) {
                if !vertex.edges.contains(&to) {
                    vertex.edges.push(to);
                }
            }
        }
    }

    /// Quantization applied to UVs by [`Topology::lookup`].
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Point at a UV, if one of the leaves has a corner or center there.
    pub fn lookup(&self, uv: [f64; 2]) -> Option<usize> {
        self.uv_hash.get(&uv_key(uv, self.resolution)).copied()
    }

    /// Points on one grid side, sorted by their free coordinate.
    pub fn side(&self, side: Side) -> &[(f64, usize)] {
        &self.sides[side_slot(side)]
    }

    /// Locate free coordinate `s` along a side.
    pub fn locate_on_side(&self, side: Side, s: f64) -> Option<SideHit> {
        let list = self.side(side);
        let first = list.first()?;
        let after = list.partition_point(|&(param, _)| param < s - SIDE_EPS);

        if let Some(&(param, p)) = list.get(after) {
            if (param - s).abs() <= SIDE_EPS {
                return Some(SideHit::Exact(p));
            }
        }
        if after == 0 {
            return Some(SideHit::Exact(first.1));
        }
        match list.get(after) {
            Some(&(sb, b)) => {
                let (sa, a) = list[after - 1];
                Some(SideHit::Between(a, b, (s - sa) / (sb - sa)))
            }
            None => list.last().map(|&(_, p)| SideHit::Exact(p)),
        }
    }

    /// Number of vertices.
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Number of distinct edges.
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    fn single_leaf() -> (Vec<QuadNode>, Vec<GridPoint>) {
        let uvs = [[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.5, 0.5]];
        let points = uvs
            .iter()
            .map(|&uv| GridPoint::new(Point3::new(uv[0], uv[1], 0.0), uv))
            .collect();
        let mut root = QuadNode::leaf([0.0, 0.0], [1.0, 1.0], 0, [0, 1, 2, 3]);
        root.center = Some(4);
        (vec![root], points)
    }

    #[test]
    fn test_single_leaf_graph() {
        let (nodes, points) = single_leaf();
        let topo = Topology::build(&nodes, &points, vec![0]);

        assert_eq!(topo.max_depth, 0);
        assert_eq!(topo.dimension, 2);
        assert_eq!(topo.num_vertices(), 5);
        assert_eq!(topo.num_edges(), 8);
        assert_eq!(topo.vertices[&4].edges.len(), 4);
        assert_eq!(topo.vertices[&0].nodes, vec![0]);
        assert_eq!(topo.lookup([0.5, 0.5]), Some(4));
        assert_eq!(topo.lookup([0.25, 0.5]), None);
    }

    #[test]
    fn test_side_lists() {
        let (nodes, points) = single_leaf();
        let topo = Topology::build(&nodes, &points, vec![0]);

        assert_eq!(topo.side(Side::Bottom), &[(0.0, 0), (1.0, 3)]);
        assert_eq!(topo.side(Side::Right), &[(0.0, 3), (1.0, 2)]);
        assert_eq!(topo.locate_on_side(Side::Bottom, 1.0), Some(SideHit::Exact(3)));
        assert_eq!(
            topo.locate_on_side(Side::Left, 0.25),
            Some(SideHit::Between(0, 1, 0.25))
        );
    }

    #[test]
    fn test_missing_center_is_skipped() {
        let (mut nodes, points) = single_leaf();
        nodes[0].center = None;
        let topo = Topology::build(&nodes, &points, vec![0]);
        assert_eq!(topo.num_vertices(), 0);
        assert_eq!(topo.leaves, vec![0]);
    }
}
