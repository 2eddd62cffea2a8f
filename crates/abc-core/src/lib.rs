#![deny(missing_docs)]

//! Core types shared across the ABC-SMC calibration crates: structured
//! errors, deterministic RNG handles, and hierarchical parameter trees.

pub mod errors;
pub mod params;
pub mod rng;

pub use errors::{AbcError, ErrorInfo};
pub use params::{ParamPath, ParamValues};
pub use rng::{derive_substream_seed, particle_seed, RngHandle};
