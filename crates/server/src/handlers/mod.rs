//! HTTP request handlers.

pub mod builds;
pub mod extract;
pub mod health;
pub mod uploads;

pub use builds::*;
pub use extract::BuildIdPath;
pub use health::*;
pub use uploads::*;
