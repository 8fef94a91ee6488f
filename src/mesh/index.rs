//! Index types for mesh elements.
//!
//! Vertices, half-edges and faces are addressed through distinct `u32` newtypes so
//! that a face handle can never be passed where a vertex handle is expected. Each
//! type reserves `u32::MAX` as an invalid sentinel.

use std::fmt::{self, Debug};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $display:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// The invalid/null handle.
            pub const INVALID: Self = Self(u32::MAX);

            /// Create a new index from a raw value.
            #[inline]
            pub fn new(index: usize) -> Self {
                debug_assert!(index < u32::MAX as usize, "index {} too large", index);
                Self(index as u32)
            }

            /// Create an invalid/null index.
            #[inline]
            pub fn invalid() -> Self {
                Self::INVALID
            }

            /// Get the raw index value.
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }

            /// Check if this is a valid (non-null) index.
            #[inline]
            pub fn is_valid(self) -> bool {
                self != Self::INVALID
            }

            /// Convert to `Option`, mapping the sentinel to `None`.
            #[inline]
            pub fn valid(self) -> Option<Self> {
                self.is_valid().then_some(self)
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, "{}({})", $display, self.0)
                } else {
                    write!(f, "{}(INVALID)", $display)
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::INVALID
            }
        }

        impl From<usize> for $name {
            fn from(v: usize) -> Self {
                Self::new(v)
            }
        }
    };
}

define_id!(
    /// A type-safe vertex index.
    VertexId,
    "V"
);
define_id!(
    /// A type-safe half-edge index. Half-edges with a face are also called loops.
    HalfEdgeId,
    "HE"
);
define_id!(
    /// A type-safe face index.
    FaceId,
    "F"
);
