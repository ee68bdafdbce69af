//! Trilod - virtual geometry: clustered LOD DAG building and GPU page streaming

pub mod core;
pub mod math;
pub mod mesh;
pub mod simplify;
pub mod partition;
pub mod cluster;
pub mod dag;
pub mod bvh;
pub mod page;
pub mod builder;
pub mod streaming;
