//! Test utilities
//!
//! Synthetic payload streams for exercising the checker and pipeline
//! without a camera.

pub mod stream_generator;

pub use stream_generator::*;
