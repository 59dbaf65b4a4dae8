//! Core types for Coffer

mod bucket;
mod multipart;
mod object;
mod storage;

pub use bucket::*;
pub use multipart::*;
pub use object::*;
pub use storage::*;
