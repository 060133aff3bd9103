//! Greedy thread-stringing optimizer: computes a sequence of chord
//! instructions on a circular loom that approximates a target image.
//!
//! The module layout mirrors the reference C implementation's file split:
//! [`color`] (color.c), [`raster`] (line_renderer.c), [`worker_pool`]
//! (worker_pool.c), [`shared_memory`] (shared_data.c), [`optimizer`]
//! (optimizer.c), [`debug`] (debug.h), [`error`] (error_handling.h).

pub mod color;
pub mod debug;
pub mod error;
pub mod optimizer;
pub mod raster;
pub mod shared_memory;
pub mod worker_pool;

pub use error::ThreadloomError;
