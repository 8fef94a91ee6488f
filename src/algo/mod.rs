//! Mesh processing algorithms.
//!
//! - **Subdivision**: Catmull-Clark refinement used to seed the limit patches

pub mod subdivide;
