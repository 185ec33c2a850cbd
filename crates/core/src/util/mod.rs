//! Small shared utilities.

pub mod arena;
pub mod ct;

pub use arena::{Arena, Handle};
