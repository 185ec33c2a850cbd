//! veil-core: the onion-routing relay core.
//!
//! Channels carry fixed-size cells for many circuits; circuits onion-crypt
//! relay cells hop by hop; streams multiplex application bytes inside
//! circuits under two levels of flow control; a socket-aware scheduler
//! arbitrates which circuit's cell goes out next. Everything hangs off a
//! single [`Core`] value owned by one task.

pub mod cell;
pub mod channel;
pub mod circuit;
pub mod core;
pub mod crypto;
pub mod provider;
pub mod relay;
pub mod sched;
pub mod timeout;
pub mod util;

pub use crate::core::{Core, CoreAction, StreamNotice};
pub use cell::{
    Cell, CellBody, CellCodec, CellCommand, CircId, DestroyReason, EndReason, RelayCommand,
    StreamId,
};
pub use channel::{
    Channel, ChannelDirection, ChannelHandle, ChannelInfo, ChannelRegistry, HandshakeRole,
    HandshakeState, LinkContext, LinkHandshake, LinkInfo, PaddingTimer,
};
pub use circuit::{CircuitInfo, CircuitPurpose, GlobalCircId};
pub use crypto::{OnionKeypair, ResponderKeys};
pub use provider::{
    ExitPolicy, HopSpec, IdentityKeystore, LocalKeystore, NoPaths, OpenExitPolicy, PathProvider,
    RejectAllPolicy, Resolver, StaticPathProvider, SystemResolver,
};
pub use relay::{EdgeAction, EdgeEvent, EdgeId};
pub use timeout::BuildTimeEstimator;
