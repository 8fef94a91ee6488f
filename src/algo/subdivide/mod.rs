//! Catmull-Clark refinement of the coarse cage.
//!
//! Limit patches are built on a copy of the cage refined once, so every
//! coarse face corner maps onto exactly one refined quad. [`catmull_clark_refine`]
//! returns that corner map with the refined mesh, and [`smoothed_vertex`]
//! gives the refined position of a single vertex without building anything.
//! [`catmull_clark_subdivide`] repeats the step in place for callers that want
//! a denser cage.
//!
//! Boundaries are sharp by default: boundary edges keep their midpoints and
//! boundary vertices use the 1/8, 3/4, 1/8 curve rule.
//!
//! ```no_run
//! use multires::algo::subdivide::{catmull_clark_subdivide, SubdivideOptions};
//!
//! let mut mesh = multires::io::load("cage.obj").unwrap();
//! catmull_clark_subdivide(&mut mesh, &SubdivideOptions::new(2)).unwrap();
//! multires::io::save(&mesh, "dense.obj").unwrap();
//! ```

mod catmull_clark;

pub use catmull_clark::{
    catmull_clark_refine, catmull_clark_refine_with, catmull_clark_subdivide, smoothed_vertex,
    Refinement,
};

/// Options for [`catmull_clark_subdivide`].
#[derive(Debug, Clone)]
pub struct SubdivideOptions {
    /// Refinement steps.
    pub iterations: usize,

    /// Keep boundary vertices on the boundary curve. When off they are
    /// smoothed like interior vertices and the border shrinks.
    pub preserve_boundary: bool,

    /// Compute face points on the rayon pool.
    pub parallel: bool,
}

impl SubdivideOptions {
    /// Sharp boundaries, parallel.
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations,
            preserve_boundary: true,
            parallel: true,
        }
    }

    /// Toggle the boundary curve rule.
    pub fn with_preserve_boundary(mut self, preserve: bool) -> Self {
        self.preserve_boundary = preserve;
        self
    }

    /// Toggle parallel face points.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Run on the calling thread.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }
}

impl Default for SubdivideOptions {
    fn default() -> Self {
        Self::new(1)
    }
}
