//! Mesh processing input types

pub mod vertex;

pub use vertex::{MeshVertex, convert_for_processor, convert_from_processor};
