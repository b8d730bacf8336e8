//! Component G: the binary coder/decoder and the three RPC wire
//! formats a stub negotiates between (`spec.md` §4.6-4.7). Pure
//! encode/decode — no transport, no stub state, no knowledge of
//! `binder_core`'s data model; see `crates/binder-rpc` for the stub
//! built on top of these primitives.

pub mod coder;
pub mod decoder;
pub mod error;
pub mod globmatch;
pub mod stream_framing;
pub mod v0;
pub mod v1;
pub mod v3;

pub use coder::Coder;
pub use decoder::Decoder;
pub use error::{WireError, WireResult};
