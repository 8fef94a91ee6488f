//! Quadtree node records and their flat numeric layout.
//!
//! In memory the tree is a `Vec<QuadNode>` addressed by `usize` handles. On disk
//! every node is a fixed-size run of `f64` fields in one flat array, with `-1`
//! standing for "no node" / "no point".

use bitflags::bitflags;
use nalgebra::Vector3;

use crate::error::{MeshError, Result};

/// Deepest node that can still be subdivided is `MAX_DEPTH - 1`.
pub const MAX_DEPTH: u32 = 16;

bitflags! {
    /// Per-node state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NodeFlags: u32 {
        /// Selected by the user.
        const SELECT = 1;
        /// Has no children.
        const LEAF = 2;
        /// Removed by a collapse; kept until the arrays are compacted.
        const DEAD = 4;
    }
}

/// Index into [`QuadNode::neighbors`].
pub const LEFT: usize = 0;
/// Index into [`QuadNode::neighbors`].
pub const RIGHT: usize = 1;
/// Index into [`QuadNode::neighbors`].
pub const UP: usize = 2;
/// Index into [`QuadNode::neighbors`].
pub const DOWN: usize = 3;

/// One quadtree node.
///
/// Corner points are ordered `(min_u, min_v)`, `(min_u, max_v)`,
/// `(max_u, max_v)`, `(max_u, min_v)`. Children are ordered `j * 2 + i` where
/// `i` picks the u half and `j` the v half.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadNode {
    /// State bits.
    pub flags: NodeFlags,
    /// Child handles, if subdivided.
    pub children: Option<[usize; 4]>,
    /// Parent handle (`None` for the root).
    pub parent: Option<usize>,
    /// Lower UV corner.
    pub min: [f64; 2],
    /// Upper UV corner.
    pub max: [f64; 2],
    /// Depth below the root.
    pub depth: u32,
    /// Height of the subtree rooted here.
    pub subtree_depth: u32,
    /// Adjacent leaves (left, right, up, down); informational only.
    pub neighbors: [Option<usize>; 4],
    /// Corner point handles.
    pub points: [usize; 4],
    /// Center point handle, materialized lazily.
    pub center: Option<usize>,
    /// Position of the node in the last polygon rebuild.
    pub quad_index: Option<usize>,
    /// Triangle range `[start, end)` in the polygon list.
    pub poly_range: (usize, usize),
    /// Average fan normal.
    pub normal: Vector3<f64>,
}

impl QuadNode {
    /// A leaf covering `[min, max]`.
    pub fn leaf(min: [f64; 2], max: [f64; 2], depth: u32, points: [usize; 4]) -> Self {
        Self {
            flags: NodeFlags::LEAF,
            children: None,
            parent: None,
            min,
            max,
            depth,
            subtree_depth: 0,
            neighbors: [None; 4],
            points,
            center: None,
            quad_index: None,
            poly_range: (0, 0),
            normal: Vector3::zeros(),
        }
    }

    /// Whether the node has no children.
    pub fn is_leaf(&self) -> bool {
        self.flags.contains(NodeFlags::LEAF)
    }

    /// Whether the node was collapsed away.
    pub fn is_dead(&self) -> bool {
        self.flags.contains(NodeFlags::DEAD)
    }

    /// UV of the box center.
    pub fn center_uv(&self) -> [f64; 2] {
        [
            (self.min[0] + self.max[0]) * 0.5,
            (self.min[1] + self.max[1]) * 0.5,
        ]
    }

    /// UVs of the four corners, in point order.
    pub fn corner_uvs(&self) -> [[f64; 2]; 4] {
        [
            [self.min[0], self.min[1]],
            [self.min[0], self.max[1]],
            [self.max[0], self.max[1]],
            [self.max[0], self.min[1]],
        ]
    }

    /// Box-relative coordinates of a UV.
    pub fn local(&self, uv: [f64; 2]) -> (f64, f64) {
        (
            (uv[0] - self.min[0]) / (self.max[0] - self.min[0]),
            (uv[1] - self.min[1]) / (self.max[1] - self.min[1]),
        )
    }

    /// Whether a UV lies inside the (closed) box.
    pub fn contains(&self, uv: [f64; 2]) -> bool {
        uv[0] >= self.min[0] && uv[0] <= self.max[0] && uv[1] >= self.min[1] && uv[1] <= self.max[1]
    }
}

/// Field offsets of the current flat layout.
#[allow(missing_docs)]
pub mod layout {
    /// Current layout version.
    pub const VERSION: u32 = 2;
    /// Values per node.
    pub const NODE_FIELDS: usize = 32;

    pub const FLAG: usize = 0;
    pub const CHILD: usize = 1;
    pub const MIN_U: usize = 5;
    pub const MIN_V: usize = 6;
    pub const MAX_U: usize = 7;
    pub const MAX_V: usize = 8;
    pub const CENT_U: usize = 9;
    pub const CENT_V: usize = 10;
    pub const DEPTH: usize = 11;
    pub const LEFT: usize = 12;
    pub const RIGHT: usize = 13;
    pub const UP: usize = 14;
    pub const DOWN: usize = 15;
    pub const POINT: usize = 16;
    pub const CENTER: usize = 20;
    pub const PARENT: usize = 21;
    pub const SUBTREE_DEPTH: usize = 22;
    pub const QUAD_INDEX: usize = 23;
    pub const POLY_START: usize = 24;
    pub const POLY_END: usize = 25;
    pub const NX: usize = 26;
    pub const NY: usize = 27;
    pub const NZ: usize = 28;

    /// Version 1 layout: child and parent fields hold flat offsets.
    pub mod v1 {
        pub const VERSION: u32 = 1;
        pub const NODE_FIELDS: usize = 24;
        pub const ID: usize = 20;
        pub const PARENT: usize = 21;
        pub const SUBTREE_DEPTH: usize = 22;
        pub const QUAD_INDEX: usize = 23;
    }
}

fn handle(value: Option<usize>) -> f64 {
    value.map_or(-1.0, |v| v as f64)
}

/// Flatten nodes into the current layout.
pub fn encode_nodes(nodes: &[QuadNode]) -> Vec<f64> {
    use layout as f;

    let mut out = vec![0.0; nodes.len() * f::NODE_FIELDS];
    for (node, rec) in nodes.iter().zip(out.chunks_exact_mut(f::NODE_FIELDS)) {
        rec[f::FLAG] = node.flags.bits() as f64;
        for k in 0..4 {
            rec[f::CHILD + k] = handle(node.children.map(|c| c[k]));
            rec[f::POINT + k] = node.points[k] as f64;
        }
        rec[f::MIN_U] = node.min[0];
        rec[f::MIN_V] = node.min[1];
        rec[f::MAX_U] = node.max[0];
        rec[f::MAX_V] = node.max[1];
        let c = node.center_uv();
        rec[f::CENT_U] = c[0];
        rec[f::CENT_V] = c[1];
        rec[f::DEPTH] = node.depth as f64;
        rec[f::LEFT] = handle(node.neighbors[LEFT]);
        rec[f::RIGHT] = handle(node.neighbors[RIGHT]);
        rec[f::UP] = handle(node.neighbors[UP]);
        rec[f::DOWN] = handle(node.neighbors[DOWN]);
        rec[f::CENTER] = handle(node.center);
        rec[f::PARENT] = handle(node.parent);
        rec[f::SUBTREE_DEPTH] = node.subtree_depth as f64;
        rec[f::QUAD_INDEX] = handle(node.quad_index);
        rec[f::POLY_START] = node.poly_range.0 as f64;
        rec[f::POLY_END] = node.poly_range.1 as f64;
        rec[f::NX] = node.normal.x;
        rec[f::NY] = node.normal.y;
        rec[f::NZ] = node.normal.z;
    }
    out
}

struct Reader<'a> {
    rec: &'a [f64],
    node: usize,
}

impl Reader<'_> {
    fn count(&self, field: usize) -> Result<usize> {
        let v = self.rec[field];
        if v < 0.0 || v.fract() != 0.0 || !v.is_finite() {
            return Err(MeshError::Migration(format!(
                "node {}: field {} holds {} where a count was expected",
                self.node, field, v
            )));
        }
        Ok(v as usize)
    }

    fn handle(&self, field: usize, stride: usize, count: usize) -> Result<Option<usize>> {
        let v = self.rec[field];
        if v < 0.0 {
            return Ok(None);
        }
        let offset = self.count(field)?;
        if offset % stride != 0 || offset / stride >= count {
            return Err(MeshError::Migration(format!(
                "node {}: field {} points at {} which is not a node",
                self.node, field, offset
            )));
        }
        Ok(Some(offset / stride))
    }
}

/// Rebuild nodes from a flat array of the given layout version.
///
/// Version 1 arrays are migrated: flat offsets become handles and centers are
/// left to be materialized lazily.
pub fn decode_nodes(data: &[f64], version: u32, stride: usize) -> Result<Vec<QuadNode>> {
    use layout::{self as f, v1};

    let expected = match version {
        f::VERSION => f::NODE_FIELDS,
        v1::VERSION => v1::NODE_FIELDS,
        other => return Err(MeshError::Migration(format!("unknown layout version {}", other))),
    };
    if stride != expected {
        return Err(MeshError::Migration(format!(
            "layout version {} expects {} fields per node, record has {}",
            version, expected, stride
        )));
    }
    if data.is_empty() || data.len() % stride != 0 {
        return Err(MeshError::Migration(format!(
            "node array of length {} is not a whole number of {}-field records",
            data.len(),
            stride
        )));
    }

    let count = data.len() / stride;
    // Version 2 stores handles directly; version 1 stores flat offsets
    let link_stride = if version == v1::VERSION { stride } else { 1 };

    let mut nodes = Vec::with_capacity(count);
    for (i, rec) in data.chunks_exact(stride).enumerate() {
        let r = Reader { rec, node: i };

        let mut children = [0usize; 4];
        let mut has_children = true;
        for (k, child) in children.iter_mut().enumerate() {
            match r.handle(f::CHILD + k, link_stride, count)? {
                Some(c) => *child = c,
                None => has_children = false,
            }
        }

        let mut points = [0usize; 4];
        for (k, p) in points.iter_mut().enumerate() {
            *p = r.count(f::POINT + k)?;
        }

        let flags = NodeFlags::from_bits_truncate(r.count(f::FLAG)? as u32);
        let mut node = QuadNode::leaf(
            [rec[f::MIN_U], rec[f::MIN_V]],
            [rec[f::MAX_U], rec[f::MAX_V]],
            r.count(f::DEPTH)? as u32,
            points,
        );
        node.flags = flags;
        node.children = has_children.then_some(children);
        node.neighbors = [
            r.handle(f::LEFT, link_stride, count)?,
            r.handle(f::RIGHT, link_stride, count)?,
            r.handle(f::UP, link_stride, count)?,
            r.handle(f::DOWN, link_stride, count)?,
        ];

        if version == v1::VERSION {
            node.parent = r.handle(v1::PARENT, link_stride, count)?;
            node.subtree_depth = r.count(v1::SUBTREE_DEPTH)? as u32;
            node.quad_index = (rec[v1::QUAD_INDEX] >= 0.0)
                .then(|| r.count(v1::QUAD_INDEX))
                .transpose()?;
        } else {
            node.parent = r.handle(f::PARENT, 1, count)?;
            node.subtree_depth = r.count(f::SUBTREE_DEPTH)? as u32;
            node.center = (rec[f::CENTER] >= 0.0).then(|| r.count(f::CENTER)).transpose()?;
            node.quad_index = (rec[f::QUAD_INDEX] >= 0.0)
                .then(|| r.count(f::QUAD_INDEX))
                .transpose()?;
            node.poly_range = (r.count(f::POLY_START)?, r.count(f::POLY_END)?);
            node.normal = Vector3::new(rec[f::NX], rec[f::NY], rec[f::NZ]);
        }

        if node.is_leaf() == node.children.is_some() && !node.is_dead() {
            return Err(MeshError::Migration(format!(
                "node {} leaf flag disagrees with its children",
                i
            )));
        }
        nodes.push(node);
    }

    if nodes[0].parent.is_some() || nodes[0].is_dead() {
        return Err(MeshError::Migration("node 0 is not a live root".into()));
    }
    Ok(nodes)
}
