//! MTProto session and transport abstractions.
//!
//! This crate handles:
//! * Message ids and plaintext framing for the key exchange
//! * The auth key exchange itself, as a sans-IO step machine
//! * Encrypted sessions: envelopes, containers, salts, service messages
//! * Packet framing for every MTProto transport
//!
//! It is intentionally transport-agnostic: bring your own TCP/WebSocket.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod authentication;
pub mod encrypted;
pub mod message;
pub mod session;
pub mod transport;

pub use encrypted::{DecryptError, EncryptedSession, Inbound};
pub use message::{Message, MessageId, MessageIdGenerator};
pub use session::Session;
