//! Onion cryptography: per-hop relay-cell crypt state, the circuit
//! extension handshakes, and the worker pool that keeps asymmetric work off
//! the event loop.

pub mod handshake;
pub mod layer;
pub mod workers;

pub use handshake::{
    fast_respond, respond, ClientHandshake, FastClientHandshake, HopKeyMaterial, KeySeed,
    OnionKeypair, ResponderKeys, HANDSHAKE_TYPE_NTOR, NTOR_ONIONSKIN_LEN, NTOR_REPLY_LEN,
};
pub use layer::{
    InboundClientCrypt, LayerKeys, OutboundClientCrypt, RelayCrypt, RelayLayerCrypt, SendmeTag,
    SENDME_TAG_LEN,
};
pub use workers::{CryptoCompletion, CryptoRequest, CryptoToken, CryptoWorkerPool};
