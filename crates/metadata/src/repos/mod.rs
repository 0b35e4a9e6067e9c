//! Repository traits for metadata operations.

pub mod builds;

pub use builds::BuildRepo;
