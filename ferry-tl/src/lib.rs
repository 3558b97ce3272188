//! TL binary codec for the ferry MTProto engine.
//!
//! The engine never needs to know the shape of application-level objects;
//! it only requires that requests implement [`Serializable`] + [`RemoteCall`]
//! and that responses implement [`Deserializable`]. This crate provides
//! those traits, the primitive encodings, and the handful of MTProto
//! service constructors the engine itself speaks.
//!
//! # Overview
//!
//! | Module          | Contents                                                 |
//! |-----------------|----------------------------------------------------------|
//! | [`serialize`]   | [`Serializable`] and primitive encoders                  |
//! | [`deserialize`] | [`Deserializable`], [`Cursor`] and the decode error      |
//! | [`mtproto`]     | Service schema: key exchange, envelopes, acks, salts     |
//!
//! # Raw usage
//!
//! ```rust
//! use ferry_tl::{mtproto, Deserializable, Serializable};
//!
//! let ping = mtproto::Ping { ping_id: 42 };
//! let bytes = ping.to_bytes();
//! assert_eq!(mtproto::Ping::from_bytes(&bytes).unwrap(), ping);
//! ```

#![deny(unsafe_code)]

pub mod deserialize;
pub mod mtproto;
pub mod serialize;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;

/// Error returned when bytes cannot be decoded into the expected type.
pub type DecodeError = deserialize::Error;

/// Constructor ID of the boxed `Vector` type.
pub const VECTOR_ID: u32 = 0x1cb5c415;

/// Bare vector: `vector` (lowercase) as opposed to the boxed `Vector`.
///
/// Used in rare cases where Telegram sends a length-prefixed list without
/// the usual `0x1cb5c415` constructor ID header.
#[derive(Clone, Debug, PartialEq)]
pub struct RawVec<T>(pub Vec<T>);

/// Opaque blob of bytes that should be passed through without interpretation.
///
/// Returned by functions whose response type is generic (e.g. `X`), and used
/// to carry already-serialized application requests through the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct Blob(pub Vec<u8>);

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self { Self(v) }
}

// ─── Core traits ──────────────────────────────────────────────────────────────

/// Every schema type has a unique 32-bit constructor ID.
pub trait Identifiable {
    /// The constructor ID as specified in the TL schema.
    const CONSTRUCTOR_ID: u32;
}

/// Marks a function type that can be sent to the server as an RPC call.
///
/// `Return` is the type the server will respond with.
pub trait RemoteCall: Serializable {
    /// The deserialized response type.
    type Return: Deserializable;
}

/// An already-serialized request whose response is returned undecoded.
///
/// Lets callers that own their own schema push arbitrary bodies through
/// `Client::invoke`.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRequest(pub Vec<u8>);

impl Serializable for RawRequest {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        buf.extend(self.0.iter().copied());
    }
}

impl RemoteCall for RawRequest {
    type Return = Blob;
}

/// Read the leading constructor ID of a serialized object.
pub fn constructor_id(body: &[u8]) -> Result<u32, DecodeError> {
    Cursor::from_slice(body).peek_u32()
}
