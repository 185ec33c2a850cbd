//! veil-daemon: runs a relay node around the `veil-core` state machine.

pub mod api;
pub mod runtime;
pub mod tls;

pub use api::ApiServer;
pub use runtime::{CoreCommand, CoreHandle, Runtime, StatusSnapshot};
pub use tls::TlsContext;
