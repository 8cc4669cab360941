//! Test utilities for `wifi-scope`
//!
//! Provides synthetic fragment generation, real JPEG fixtures and scripted
//! network doubles for exercising the pipeline without a camera.

pub mod doubles;
pub mod fragment_generator;

pub use doubles::*;
pub use fragment_generator::*;
