//! Quadric-error edge-collapse simplification

pub mod quadric;
pub mod hash;
pub mod simplifier;

pub use hash::{EdgeHash, PositionHash, pos_key};
pub use quadric::AttrQuadric;
pub use simplifier::{MeshSimplifier, SimplifiedMesh, SimplifyTarget};
