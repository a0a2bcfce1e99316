//! Utility types shared by every layer.
//!
//! - [`Error`] / [`Result`] / [`ErrorKind`] - Error handling
//! - [`Coords`] and [`GridIter`] - LOD/brick coordinate vectors
//! - [`ScalarType`] - Sample storage types

mod coords;
mod error;
mod scalar;

pub use coords::*;
pub use error::*;
pub use scalar::*;
