//! # ferry: MTProto 2.0 client engine
//!
//! `ferry` bundles the workspace crates for convenience:
//!
//! | Sub-crate       | Role                                                   |
//! |-----------------|--------------------------------------------------------|
//! | `ferry-tl`      | Binary codec and the MTProto service schema            |
//! | `ferry-crypto`  | AES-IGE/CTR, SHA, RSA, factorization, `AuthKey`        |
//! | `ferry-mtproto` | Key exchange, encrypted sessions, transport framings   |
//! | `ferry-client`  | Async multi-DC client (feature `client`, on by default)|
//!
//! ## Quick start: sans-IO
//!
//! ```rust
//! use ferry::mtproto::authentication::{self, KeyRequest};
//! use ferry::mtproto::Session;
//!
//! // First message of the key exchange, ready for any transport.
//! let (req, _state) = authentication::step1(KeyRequest::Permanent { dc_id: 2 });
//! let wire = Session::new().pack(&req).to_plaintext_bytes();
//! assert_eq!(&wire[..8], &[0; 8]);
//! ```
//!
//! ## Quick start: client
//!
//! ```rust,no_run
//! # #[cfg(feature = "client")]
//! # async fn run() -> Result<(), ferry::client::InvocationError> {
//! use ferry::client::{Client, Config};
//! use ferry::tl::mtproto::Ping;
//!
//! let client = Client::connect(Config::default()).await?;
//! client.invoke(&Ping { ping_id: 1 }).await?;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Re-export of [`ferry_tl`]: codec traits and the service schema.
pub use ferry_tl as tl;

/// Re-export of [`ferry_mtproto`]: sessions, key exchange and transports.
pub use ferry_mtproto as mtproto;

/// Re-export of [`ferry_crypto`]: primitives and `AuthKey`.
pub use ferry_crypto as crypto;

/// Re-export of [`ferry_client`] (requires `feature = "client"`).
#[cfg(feature = "client")]
pub use ferry_client as client;

// ─── Convenience re-exports ───────────────────────────────────────────────────

pub use ferry_tl::{Deserializable, Identifiable, RawRequest, RemoteCall, Serializable};

pub use ferry_mtproto::{EncryptedSession, Session};
pub use ferry_mtproto::authentication::{self, Finished, KeyRequest, finish, step1, step2, step3};
pub use ferry_crypto::{AuthKey, CryptoProvider, SoftwareCrypto};

#[cfg(feature = "client")]
pub use ferry_client::{Client, Config, InvocationError, TransportKind};
