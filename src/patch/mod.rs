//! Smooth limit surface evaluation.
//!
//! A mesh is refined once with Catmull-Clark and every refined loop gets a
//! bicubic [`CubicPatch`]. Loops around an interior valence-4 vertex get a
//! uniform B-spline net assembled from their neighbors' corner quads. All
//! other loops get a Bezier net that is blended against the surrounding
//! patches; the surface is only approximately smooth across those vertices.
//!
//! Each coarse loop then owns a [`Patch4`]: the four refined patches inside
//! its corner sub-face, addressed through the coarse loop's own `(u, v)`.
//!
//! # Example
//!
//! ```no_run
//! use multires::patch::{PatchBuilder, PatchOptions};
//!
//! let mesh = multires::io::load("cage.obj").unwrap();
//! let patches = PatchBuilder::new(PatchOptions::default()).build(&mesh).unwrap();
//! for (l, patch) in patches.iter() {
//!     let frame = patch.tangent_frame(0.5, 0.5);
//!     println!("{:?}: {:?}", l, frame.normal);
//! }
//! ```

mod basis;
mod builder;
mod cubic;
mod frame;
mod patch4;

pub use basis::Basis;
pub use builder::{PatchBuilder, PatchOptions, Patches};
pub use cubic::{CubicPatch, PatchKind, PatchSample};
pub use frame::TangentFrame;
pub use patch4::Patch4;
