//! Error types for multires.
//!
//! This module defines all error types used throughout the library.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`MeshError`].
pub type Result<T> = std::result::Result<T, MeshError>;

/// Errors that can occur during mesh and grid operations.
#[derive(Error, Debug)]
pub enum MeshError {
    /// The mesh has no faces.
    #[error("mesh has no faces")]
    EmptyMesh,

    /// A face references an invalid vertex index.
    #[error("face {face} references invalid vertex index {vertex}")]
    InvalidVertexIndex {
        /// The face index.
        face: usize,
        /// The invalid vertex index.
        vertex: usize,
    },

    /// A face has fewer than three corners or repeats a vertex.
    #[error("face {face} is degenerate (fewer than 3 corners or duplicate vertices)")]
    DegenerateFace {
        /// The face index.
        face: usize,
    },

    /// A directed edge is used by more than one face.
    #[error("edge ({v0}, {v1}) is used twice in the same direction")]
    NonManifoldEdge {
        /// First vertex of the edge.
        v0: usize,
        /// Second vertex of the edge.
        v1: usize,
    },

    /// Quadtree node is not a leaf and cannot be subdivided.
    #[error("quadtree node {node} is not a leaf")]
    NotALeaf {
        /// The node handle.
        node: usize,
    },

    /// Quadtree node was collapsed and is no longer part of the tree.
    #[error("quadtree node {node} is dead")]
    DeadNode {
        /// The node handle.
        node: usize,
    },

    /// Subdivision would exceed the addressable depth of the point hash.
    #[error("quadtree node {node} is already at the maximum depth {max}")]
    MaxDepthExceeded {
        /// The node handle.
        node: usize,
        /// The maximum supported depth.
        max: u32,
    },

    /// Two loop relations that never share a grid boundary were paired.
    #[error("no boundary mapping between loop relations {a:?} and {b:?}")]
    UnmappedRelation {
        /// First relation mask.
        a: u8,
        /// Second relation mask.
        b: u8,
    },

    /// A loop has no grid attached.
    #[error("loop {0} has no grid")]
    MissingGrid(usize),

    /// A loop has no limit patch.
    #[error("loop {0} has no patch")]
    MissingPatch(usize),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary encoding or decoding failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// A serialized grid could not be migrated to the current layout.
    #[error("cannot migrate grid record: {0}")]
    Migration(String),

    /// Error loading mesh from file.
    #[error("failed to load mesh from {path}: {message}")]
    LoadError {
        /// The file path.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Error saving mesh to file.
    #[error("failed to save mesh to {path}: {message}")]
    SaveError {
        /// The file path.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Unsupported file format.
    #[error("unsupported file format: {extension}")]
    UnsupportedFormat {
        /// The file extension.
        extension: String,
    },

    /// Invalid state for the requested operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Invalid parameter value.
    #[error("invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// The invalid value (as string).
        value: String,
        /// Reason the value is invalid.
        reason: &'static str,
    },
}

impl MeshError {
    /// Create an invalid parameter error.
    pub fn invalid_param<T: std::fmt::Display>(
        name: &'static str,
        value: T,
        reason: &'static str,
    ) -> Self {
        MeshError::InvalidParameter {
            name,
            value: value.to_string(),
            reason,
        }
    }

    /// Whether the error only reflects incomplete adjacency and can be retried later.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            MeshError::MissingGrid(_) | MeshError::MissingPatch(_) | MeshError::UnmappedRelation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_errors() {
        assert!(MeshError::MissingGrid(3).is_soft());
        assert!(MeshError::UnmappedRelation { a: 1, b: 8 }.is_soft());
        assert!(!MeshError::NotALeaf { node: 0 }.is_soft());
    }

    #[test]
    fn test_display() {
        let e = MeshError::invalid_param("dimension", 4, "must be 2^k+1");
        assert_eq!(e.to_string(), "invalid parameter: dimension = 4 (must be 2^k+1)");
    }
}
