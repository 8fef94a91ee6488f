//! Boundary correspondence between grids of neighboring loops.
//!
//! A loop's grid has four boundary lines. Two of them lie inside the face and
//! are shared with the grids of `next` and `prev`; the other two lie on the
//! mesh edges and are shared with loops across those edges. Which coordinates
//! line up depends on whether the two loops sit on the same mesh vertex (the
//! shared line is traversed in the same direction from the vertex) or on
//! different vertices.
//!
//! ```text
//!   v
//!   1  mid(prev) ---- vertex        L(t, 1) <-> LPR(1, t)
//!      |                |           L(1, t) <-> LRN(t, 1)
//!      |                |           L(t, 0) <-> LN(0, t)
//!   0  center ------ mid(next)      L(0, t) <-> LP(t, 0)
//!      0                1  u
//! ```

use bitflags::bitflags;

use crate::error::{MeshError, Result};
use crate::mesh::{HalfEdgeId, HalfEdgeMesh};

bitflags! {
    /// Relation of a loop to the current loop `L`.
    ///
    /// Used as lookup keys only; each flag names one composition of
    /// `prev`, `next` and `radial_next`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NeighborKey: u8 {
        /// The loop itself.
        const L = 1;
        /// `prev`.
        const LP = 2;
        /// `next`.
        const LN = 4;
        /// `radial_next`.
        const LR = 8;
        /// `radial_next.prev`.
        const LRP = 16;
        /// `radial_next.next`.
        const LRN = 32;
        /// `prev.radial_next`.
        const LPR = 64;
        /// `next.radial_next`.
        const LNR = 128;
    }
}

impl NeighborKey {
    /// Every single relation, in bit order.
    pub const EACH: [NeighborKey; 8] = [
        NeighborKey::L,
        NeighborKey::LP,
        NeighborKey::LN,
        NeighborKey::LR,
        NeighborKey::LRP,
        NeighborKey::LRN,
        NeighborKey::LPR,
        NeighborKey::LNR,
    ];

    /// Relations whose grids share a boundary line with `L`'s grid.
    pub const BOUNDARY: [NeighborKey; 4] = [
        NeighborKey::LN,
        NeighborKey::LP,
        NeighborKey::LRN,
        NeighborKey::LPR,
    ];

    /// The relation under which `L` is seen from the neighbor.
    pub fn inverse(self) -> Option<NeighborKey> {
        match self {
            k if k == NeighborKey::L => Some(NeighborKey::L),
            k if k == NeighborKey::LN => Some(NeighborKey::LP),
            k if k == NeighborKey::LP => Some(NeighborKey::LN),
            k if k == NeighborKey::LRN => Some(NeighborKey::LPR),
            k if k == NeighborKey::LPR => Some(NeighborKey::LRN),
            k if k == NeighborKey::LR => Some(NeighborKey::LR),
            _ => None,
        }
    }
}

/// The eight related loops of one loop. Missing entries cross a mesh boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRelations {
    loops: [Option<HalfEdgeId>; 8],
}

impl LoopRelations {
    /// Loop for a single relation flag.
    pub fn get(&self, key: NeighborKey) -> Option<HalfEdgeId> {
        if key.bits().count_ones() != 1 {
            return None;
        }
        self.loops[key.bits().trailing_zeros() as usize]
    }

    /// Iterate `(relation, loop)` pairs that exist.
    pub fn iter(&self) -> impl Iterator<Item = (NeighborKey, HalfEdgeId)> + '_ {
        NeighborKey::EACH
            .iter()
            .zip(self.loops.iter())
            .filter_map(|(&k, l)| l.map(|l| (k, l)))
    }
}

impl HalfEdgeMesh {
    /// Resolve the eight neighbor relations of a loop.
    pub fn loop_relations(&self, l: HalfEdgeId) -> LoopRelations {
        let lp = self.prev(l);
        let ln = self.next(l);
        let lr = self.radial_next(l);
        LoopRelations {
            loops: [
                Some(l),
                Some(lp),
                Some(ln),
                lr,
                lr.map(|r| self.prev(r)),
                lr.map(|r| self.next(r)),
                self.radial_next(lp),
                self.radial_next(ln),
            ],
        }
    }
}

/// Whether two loops sit on the same mesh vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexCase {
    /// Both loops share their vertex.
    Same,
    /// The loops sit on different vertices.
    Different,
}

impl VertexCase {
    /// Classify two loops of a mesh.
    pub fn of(mesh: &HalfEdgeMesh, a: HalfEdgeId, b: HalfEdgeId) -> Self {
        if mesh.loop_vertex(a) == mesh.loop_vertex(b) {
            VertexCase::Same
        } else {
            VertexCase::Different
        }
    }
}

/// One grid coordinate as a function of the position along a boundary line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coord {
    /// Runs with the boundary parameter.
    Index,
    /// Runs against the boundary parameter.
    Reversed,
    /// Fixed at the low end (`0`).
    Min,
    /// Fixed at the high end (`dimension - 1`, or `1.0` in UV).
    Max,
}

impl Coord {
    fn index(self, dimension: usize, i: usize) -> usize {
        match self {
            Coord::Index => i,
            Coord::Reversed => dimension - 1 - i,
            Coord::Min => 0,
            Coord::Max => dimension - 1,
        }
    }

    fn uv(self, t: f64) -> f64 {
        match self {
            Coord::Index => t,
            Coord::Reversed => 1.0 - t,
            Coord::Min => 0.0,
            Coord::Max => 1.0,
        }
    }

    fn is_fixed(self) -> bool {
        matches!(self, Coord::Min | Coord::Max)
    }
}

/// One of the four boundary lines of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// `v = 0`, from the face center toward the `next` edge midpoint.
    Bottom,
    /// `v = 1`, from the `prev` edge midpoint toward the vertex.
    Top,
    /// `u = 0`, from the face center toward the `prev` edge midpoint.
    Left,
    /// `u = 1`, from the `next` edge midpoint toward the vertex.
    Right,
}

impl Side {
    /// All sides.
    pub const ALL: [Side; 4] = [Side::Bottom, Side::Top, Side::Left, Side::Right];

    fn of(coords: [Coord; 2]) -> Side {
        match coords {
            [_, Coord::Min] => Side::Bottom,
            [_, Coord::Max] => Side::Top,
            [Coord::Min, _] => Side::Left,
            _ => Side::Right,
        }
    }

    /// Whether a UV lies on this side.
    pub fn contains(self, uv: [f64; 2], eps: f64) -> bool {
        match self {
            Side::Bottom => uv[1].abs() <= eps,
            Side::Top => (uv[1] - 1.0).abs() <= eps,
            Side::Left => uv[0].abs() <= eps,
            Side::Right => (uv[0] - 1.0).abs() <= eps,
        }
    }

    /// The free coordinate of a UV along this side.
    pub fn param(self, uv: [f64; 2]) -> f64 {
        match self {
            Side::Bottom | Side::Top => uv[0],
            Side::Left | Side::Right => uv[1],
        }
    }

    /// UV at free coordinate `s` along this side.
    pub fn uv(self, s: f64) -> [f64; 2] {
        match self {
            Side::Bottom => [s, 0.0],
            Side::Top => [s, 1.0],
            Side::Left => [0.0, s],
            Side::Right => [1.0, s],
        }
    }

    /// Grid coordinate `(x, y)` of the `i`-th point along this side.
    pub fn index(self, dimension: usize, i: usize) -> [usize; 2] {
        let last = dimension - 1;
        match self {
            Side::Bottom => [i, 0],
            Side::Top => [i, last],
            Side::Left => [0, i],
            Side::Right => [last, i],
        }
    }
}

/// How a shared boundary line is addressed from both grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryMap {
    /// Coordinates on the current grid.
    pub own: [Coord; 2],
    /// Coordinates on the neighbor grid.
    pub other: [Coord; 2],
}

impl BoundaryMap {
    /// The same map seen from the neighbor.
    pub fn flipped(self) -> Self {
        Self {
            own: self.other,
            other: self.own,
        }
    }

    /// Boundary line of the current grid.
    pub fn own_side(&self) -> Side {
        Side::of(self.own)
    }

    /// Boundary line of the neighbor grid.
    pub fn other_side(&self) -> Side {
        Side::of(self.other)
    }

    /// Grid coordinates of boundary index `i` on both grids.
    pub fn index(&self, dimension: usize, i: usize) -> ([usize; 2], [usize; 2]) {
        (
            [self.own[0].index(dimension, i), self.own[1].index(dimension, i)],
            [self.other[0].index(dimension, i), self.other[1].index(dimension, i)],
        )
    }

    /// UVs of boundary parameter `t` on both grids.
    pub fn uv(&self, t: f64) -> ([f64; 2], [f64; 2]) {
        (
            [self.own[0].uv(t), self.own[1].uv(t)],
            [self.other[0].uv(t), self.other[1].uv(t)],
        )
    }

    /// Boundary parameter of a UV on the current grid's line.
    pub fn own_param(&self, uv: [f64; 2]) -> f64 {
        let axis = if self.own[0].is_fixed() { 1 } else { 0 };
        match self.own[axis] {
            Coord::Reversed => 1.0 - uv[axis],
            _ => uv[axis],
        }
    }
}

struct Entry {
    a: NeighborKey,
    b: NeighborKey,
    case: VertexCase,
    map: BoundaryMap,
}

const TABLE: [Entry; 4] = [
    Entry {
        a: NeighborKey::L,
        b: NeighborKey::LN,
        case: VertexCase::Different,
        map: BoundaryMap {
            own: [Coord::Index, Coord::Min],
            other: [Coord::Min, Coord::Index],
        },
    },
    Entry {
        a: NeighborKey::L,
        b: NeighborKey::LP,
        case: VertexCase::Different,
        map: BoundaryMap {
            own: [Coord::Min, Coord::Index],
            other: [Coord::Index, Coord::Min],
        },
    },
    Entry {
        a: NeighborKey::L,
        b: NeighborKey::LPR,
        case: VertexCase::Same,
        map: BoundaryMap {
            own: [Coord::Index, Coord::Max],
            other: [Coord::Max, Coord::Index],
        },
    },
    Entry {
        a: NeighborKey::L,
        b: NeighborKey::LRN,
        case: VertexCase::Same,
        map: BoundaryMap {
            own: [Coord::Max, Coord::Index],
            other: [Coord::Index, Coord::Max],
        },
    },
];

/// Maps boundary positions between the grids of two related loops.
///
/// The table is exhaustive: a pair of relations that cannot share a boundary is
/// reported as [`MeshError::UnmappedRelation`].
pub struct NeighborResolver;

impl NeighborResolver {
    /// Find the boundary map for an ordered relation pair.
    pub fn lookup(a: NeighborKey, b: NeighborKey, case: VertexCase) -> Result<BoundaryMap> {
        for entry in &TABLE {
            if entry.case != case {
                continue;
            }
            if entry.a == a && entry.b == b {
                return Ok(entry.map);
            }
            if entry.a == b && entry.b == a {
                return Ok(entry.map.flipped());
            }
        }
        Err(MeshError::UnmappedRelation {
            a: a.bits(),
            b: b.bits(),
        })
    }

    /// Grid coordinates of boundary index `i` on both sides of a shared line.
    pub fn resolve(
        dimension: usize,
        a: NeighborKey,
        b: NeighborKey,
        case: VertexCase,
        i: usize,
    ) -> Result<([usize; 2], [usize; 2])> {
        if i >= dimension {
            return Err(MeshError::invalid_param("i", i, "outside the grid"));
        }
        Ok(Self::lookup(a, b, case)?.index(dimension, i))
    }

    /// UVs of boundary parameter `t` on both sides of a shared line.
    pub fn resolve_uv(
        a: NeighborKey,
        b: NeighborKey,
        case: VertexCase,
        t: f64,
    ) -> Result<([f64; 2], [f64; 2])> {
        Ok(Self::lookup(a, b, case)?.uv(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::fixtures;

    #[test]
    fn test_next_is_straight_mapping() {
        let (own, other) =
            NeighborResolver::resolve(5, NeighborKey::L, NeighborKey::LN, VertexCase::Different, 3)
                .unwrap();
        assert_eq!(own, [3, 0]);
        assert_eq!(other, [0, 3]);
    }

    #[test]
    fn test_radial_lines_meet_at_vertex() {
        let (own, other) =
            NeighborResolver::resolve(5, NeighborKey::L, NeighborKey::LRN, VertexCase::Same, 4)
                .unwrap();
        // Index 4 is the shared vertex corner on both grids
        assert_eq!(own, [4, 4]);
        assert_eq!(other, [4, 4]);

        let (own, other) =
            NeighborResolver::resolve_uv(NeighborKey::L, NeighborKey::LPR, VertexCase::Same, 0.25)
                .unwrap();
        assert_eq!(own, [0.25, 1.0]);
        assert_eq!(other, [1.0, 0.25]);
    }

    #[test]
    fn test_unmapped_pairs_are_errors() {
        let err = NeighborResolver::lookup(NeighborKey::L, NeighborKey::LN, VertexCase::Same);
        assert!(matches!(err, Err(MeshError::UnmappedRelation { a: 1, b: 4 })));

        let err = NeighborResolver::lookup(NeighborKey::LP, NeighborKey::LNR, VertexCase::Different);
        assert!(err.unwrap_err().is_soft());
    }

    #[test]
    fn test_reversed_pair_is_flipped() {
        let forward =
            NeighborResolver::lookup(NeighborKey::L, NeighborKey::LN, VertexCase::Different).unwrap();
        let backward =
            NeighborResolver::lookup(NeighborKey::LN, NeighborKey::L, VertexCase::Different).unwrap();
        assert_eq!(backward, forward.flipped());
        assert_eq!(forward.own_side(), Side::Bottom);
        assert_eq!(forward.other_side(), Side::Left);
    }

    #[test]
    fn test_inverse_relation_maps_back() {
        // The LN map seen from the neighbor is the LP map
        let ln = NeighborResolver::lookup(NeighborKey::L, NeighborKey::LN, VertexCase::Different)
            .unwrap();
        let lp = NeighborResolver::lookup(NeighborKey::L, NeighborKey::LP, VertexCase::Different)
            .unwrap();
        assert_eq!(ln.flipped(), lp);
        assert_eq!(NeighborKey::LRN.inverse(), Some(NeighborKey::LPR));

        let lrn = NeighborResolver::lookup(NeighborKey::L, NeighborKey::LRN, VertexCase::Same)
            .unwrap();
        let lpr = NeighborResolver::lookup(NeighborKey::L, NeighborKey::LPR, VertexCase::Same)
            .unwrap();
        assert_eq!(lrn.flipped(), lpr);
    }

    #[test]
    fn test_own_param() {
        let map = BoundaryMap {
            own: [Coord::Max, Coord::Reversed],
            other: [Coord::Index, Coord::Min],
        };
        assert_eq!(map.own_side(), Side::Right);
        assert!((map.own_param([1.0, 0.25]) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_loop_relations_on_grid() {
        let mesh = fixtures::flat_grid(2);
        // Corner at vertex 4 (grid center) of face 0 is its third corner
        let l = mesh.next(mesh.next(mesh.face(crate::mesh::FaceId::new(0)).halfedge));
        assert_eq!(mesh.loop_vertex(l).index(), 4);

        let rel = mesh.loop_relations(l);
        // `next` runs along the outer boundary, so only LNR is missing
        assert_eq!(rel.iter().count(), 7);
        assert!(rel.get(NeighborKey::LNR).is_none());
        for key in NeighborKey::BOUNDARY {
            let other = rel.get(key).unwrap();
            let case = VertexCase::of(&mesh, l, other);
            assert!(NeighborResolver::lookup(NeighborKey::L, key, case).is_ok());
        }
        // Both edge-crossing neighbors sit on the same vertex
        assert_eq!(mesh.loop_vertex(rel.get(NeighborKey::LRN).unwrap()).index(), 4);
        assert_eq!(mesh.loop_vertex(rel.get(NeighborKey::LPR).unwrap()).index(), 4);
    }

    #[test]
    fn test_boundary_loop_has_missing_relations() {
        let mesh = fixtures::flat_grid(1);
        let l = mesh.face(crate::mesh::FaceId::new(0)).halfedge;
        let rel = mesh.loop_relations(l);
        assert!(rel.get(NeighborKey::LR).is_none());
        assert!(rel.get(NeighborKey::LPR).is_none());
        assert!(rel.get(NeighborKey::LN).is_some());
        assert!(rel.get(NeighborKey::LN | NeighborKey::LP).is_none());
    }
}
