//! Shared primitives for the pact consensus engine.
//!
//! This crate carries the two pieces every other layer agrees on:
//!
//! - [`Hash256`], the 32-byte SHA-256 value used for quorum-set hashes
//!   and statement digests.
//! - [`xdr`], an encode-only canonical XDR writer. Hashing and signing
//!   operate over these bytes; decoding network input is the host
//!   codec's job and deliberately lives outside this workspace.

mod hash;
pub mod xdr;

pub use hash::Hash256;
pub use xdr::WireEncode;
