//! The relay/stream engine: flow control, stream multiplexing, relay-cell
//! interpretation, and the edge bridge to real TCP and DNS.

pub mod edge;
pub mod engine;
pub mod flow;
pub mod stream;

pub use edge::{EdgeAction, EdgeEvent, EdgeId, EdgeOwner, EdgeRegistry};
pub use engine::{ExtendRequest, RelayOutcome};
pub use flow::{CircWindows, DeliverOutcome, StreamWindows};
pub use stream::{Stream, StreamMap, StreamState};
