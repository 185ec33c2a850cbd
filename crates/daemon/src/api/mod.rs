//! Operator HTTP API: read-only views of channels and circuits, plus
//! circuit close.

pub mod handlers;
pub mod responses;
pub mod server;

pub use server::ApiServer;
