//! Cryptographic primitives for Telegram MTProto.
//!
//! Provides:
//! - [`CryptoProvider`], the capability the engine is written against, and
//!   [`SoftwareCrypto`], its RustCrypto-based default
//! - AES-256-IGE and AES-256-CTR
//! - SHA-1 / SHA-256 hash macros
//! - Pollard-rho PQ factorization
//! - RSA padding (MTProto RSA-PAD scheme)
//! - `AuthKey`: the 256-byte session key, permanent or temporary
//! - MTProto 2.0 message encryption / decryption, in either direction
//! - MTProto 1.0 encryption (only used to bind temporary keys)
//! - DH nonce→key derivation

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
mod deque_buffer;
mod factorize;
mod provider;
pub mod rsa;
mod sha;

pub use auth_key::{AuthKey, KeyKind};
pub use deque_buffer::DequeBuffer;
pub use factorize::factorize;
pub use provider::{CryptoProvider, CtrCipher, SoftwareCrypto};

// ─── MTProto 2.0 encrypt / decrypt ───────────────────────────────────────────

/// Errors from [`decrypt_data_v2`] and [`decrypt_data_v1`].
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// Ciphertext too short or not block-aligned.
    InvalidBuffer,
    /// The `auth_key_id` in the ciphertext does not match our key.
    AuthKeyMismatch,
    /// The `msg_key` in the ciphertext does not match our computed value.
    MessageKeyMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBuffer => write!(f, "invalid ciphertext buffer length"),
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
        }
    }
}
impl std::error::Error for DecryptError {}

/// Which end of the connection produced a message.
///
/// Selects the slice of the auth key mixed into the message key, so a
/// client message can never be replayed as a server one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Messages sent by the client (`x = 0`).
    Client,
    /// Messages sent by the server (`x = 8`).
    Server,
}

impl Side {
    fn x(self) -> usize { match self { Side::Client => 0, Side::Server => 8 } }
}

fn calc_key(
    crypto: &dyn CryptoProvider,
    auth_key: &AuthKey,
    msg_key: &[u8; 16],
    side: Side,
) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let sha_a = crypto.sha256(&[&msg_key[..], &auth_key.data[x..x + 36]]);
    let sha_b = crypto.sha256(&[&auth_key.data[40 + x..40 + x + 36], &msg_key[..]]);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..24].copy_from_slice(&sha_b[8..24]);
    aes_key[24..].copy_from_slice(&sha_a[24..]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..8].copy_from_slice(&sha_b[..8]);
    aes_iv[8..24].copy_from_slice(&sha_a[8..24]);
    aes_iv[24..].copy_from_slice(&sha_b[24..]);

    (aes_key, aes_iv)
}

fn msg_key_v2(crypto: &dyn CryptoProvider, auth_key: &AuthKey, plaintext: &[u8], side: Side) -> [u8; 16] {
    let x = side.x();
    let large = crypto.sha256(&[&auth_key.data[88 + x..88 + x + 32], plaintext]);
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&large[8..24]);
    msg_key
}

// 17..=32 bytes: always at least the 12 the protocol requires, and
// the total is a multiple of 16.
fn padding_len(len: usize) -> usize {
    16 + (16 - (len % 16))
}

/// Encrypt `buffer` (in-place, with prepended header) using MTProto 2.0.
///
/// After this call `buffer` contains `key_id || msg_key || ciphertext`.
pub fn encrypt_data_v2(crypto: &dyn CryptoProvider, buffer: &mut DequeBuffer, auth_key: &AuthKey, side: Side) {
    let mut rnd = [0u8; 32];
    getrandom::getrandom(&mut rnd).expect("getrandom failed");
    do_encrypt_data_v2(crypto, buffer, auth_key, side, &rnd);
}

/// [`encrypt_data_v2`] with caller-supplied padding bytes.
pub fn do_encrypt_data_v2(
    crypto: &dyn CryptoProvider,
    buffer: &mut DequeBuffer,
    auth_key: &AuthKey,
    side: Side,
    rnd: &[u8; 32],
) {
    let pad = padding_len(buffer.len());
    buffer.extend(rnd.iter().take(pad).copied());

    let msg_key = msg_key_v2(crypto, auth_key, buffer.as_ref(), side);
    let (key, iv) = calc_key(crypto, auth_key, &msg_key, side);
    crypto.ige_encrypt(buffer.as_mut(), &key, &iv);

    buffer.extend_front(&msg_key);
    buffer.extend_front(&auth_key.key_id);
}

/// Decrypt an MTProto 2.0 ciphertext produced by `side`.
///
/// `buffer` must start with `key_id || msg_key || ciphertext`.
/// On success returns a slice of `buffer` containing the plaintext
/// (still carrying its random padding).
pub fn decrypt_data_v2<'a>(
    crypto: &dyn CryptoProvider,
    buffer: &'a mut [u8],
    auth_key: &AuthKey,
    side: Side,
) -> Result<&'a mut [u8], DecryptError> {
    if buffer.len() < 24 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = calc_key(crypto, auth_key, &msg_key, side);
    crypto.ige_decrypt(&mut buffer[24..], &key, &iv);

    if msg_key != msg_key_v2(crypto, auth_key, &buffer[24..], side) {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(&mut buffer[24..])
}

// ─── MTProto 1.0 ─────────────────────────────────────────────────────────────

fn calc_key_v1(crypto: &dyn CryptoProvider, auth_key: &AuthKey, msg_key: &[u8; 16]) -> ([u8; 32], [u8; 32]) {
    let data = &auth_key.data;
    let sha_a = crypto.sha1(&[&msg_key[..], &data[..32]]);
    let sha_b = crypto.sha1(&[&data[32..48], &msg_key[..], &data[48..64]]);
    let sha_c = crypto.sha1(&[&data[64..96], &msg_key[..]]);
    let sha_d = crypto.sha1(&[&msg_key[..], &data[96..128]]);

    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&sha_a[..8]);
    key[8..20].copy_from_slice(&sha_b[8..20]);
    key[20..].copy_from_slice(&sha_c[4..16]);

    let mut iv = [0u8; 32];
    iv[..12].copy_from_slice(&sha_a[8..20]);
    iv[12..20].copy_from_slice(&sha_b[..8]);
    iv[20..24].copy_from_slice(&sha_c[16..20]);
    iv[24..].copy_from_slice(&sha_d[..8]);

    (key, iv)
}

/// Encrypt `plaintext` with the legacy MTProto 1.0 scheme (client side).
///
/// Only `auth.bindTempAuthKey` still requires this: its inner message is
/// encrypted with the permanent key this way. Returns
/// `key_id || msg_key || ciphertext`.
pub fn encrypt_data_v1(crypto: &dyn CryptoProvider, plaintext: &[u8], auth_key: &AuthKey) -> Vec<u8> {
    let sha = crypto.sha1(&[plaintext]);
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&sha[4..20]);

    let mut padded = plaintext.to_vec();
    let pad = (16 - plaintext.len() % 16) % 16;
    let mut rnd = [0u8; 16];
    getrandom::getrandom(&mut rnd).expect("getrandom failed");
    padded.extend_from_slice(&rnd[..pad]);

    let (key, iv) = calc_key_v1(crypto, auth_key, &msg_key);
    crypto.ige_encrypt(&mut padded, &key, &iv);

    let mut out = Vec::with_capacity(24 + padded.len());
    out.extend_from_slice(&auth_key.key_id);
    out.extend_from_slice(&msg_key);
    out.extend_from_slice(&padded);
    out
}

/// Decrypt an MTProto 1.0 message whose unpadded length is `plaintext_len`.
///
/// Version 1 hashes the unpadded plaintext, so the length must be known
/// up front (for `bind_auth_key_inner` it is fixed).
pub fn decrypt_data_v1(
    crypto: &dyn CryptoProvider,
    buffer: &[u8],
    auth_key: &AuthKey,
    plaintext_len: usize,
) -> Result<Vec<u8>, DecryptError> {
    if buffer.len() < 24 || (buffer.len() - 24) % 16 != 0 || plaintext_len > buffer.len() - 24 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = calc_key_v1(crypto, auth_key, &msg_key);
    let mut plaintext = buffer[24..].to_vec();
    crypto.ige_decrypt(&mut plaintext, &key, &iv);
    plaintext.truncate(plaintext_len);

    if msg_key != crypto.sha1(&[&plaintext[..]])[4..20] {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(plaintext)
}

/// Derive `(key, iv)` from nonces for decrypting `ServerDhParams.encrypted_answer`.
pub fn generate_key_data_from_nonce(
    crypto: &dyn CryptoProvider,
    server_nonce: &[u8; 16],
    new_nonce: &[u8; 32],
) -> ([u8; 32], [u8; 32]) {
    let h1 = crypto.sha1(&[&new_nonce[..], &server_nonce[..]]);
    let h2 = crypto.sha1(&[&server_nonce[..], &new_nonce[..]]);
    let h3 = crypto.sha1(&[&new_nonce[..], &new_nonce[..]]);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&h1);
    key[20..].copy_from_slice(&h2[..12]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&h2[12..]);
    iv[8..28].copy_from_slice(&h3);
    iv[28..].copy_from_slice(&new_nonce[..4]);

    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AuthKey {
        AuthKey::new(&SoftwareCrypto::new(), std::array::from_fn(|i| (i * 7) as u8))
    }

    fn plaintext(len: usize) -> DequeBuffer {
        let mut buffer = DequeBuffer::with_capacity(len + 32, 24);
        buffer.extend((0..len).map(|i| i as u8));
        buffer
    }

    #[test]
    fn v2_roundtrip_in_both_directions() {
        let crypto = SoftwareCrypto::new();
        for side in [Side::Client, Side::Server] {
            let mut buffer = plaintext(40);
            encrypt_data_v2(&crypto, &mut buffer, &key(), side);
            assert_eq!(buffer.len() % 16, 8);
            assert_eq!(&buffer[..8], &key().key_id());

            let mut wire = buffer.as_ref().to_vec();
            let plain = decrypt_data_v2(&crypto, &mut wire, &key(), side).unwrap();
            assert_eq!(&plain[..40], &(0..40).collect::<Vec<u8>>()[..]);
            let pad = plain.len() - 40;
            assert!((12..=1024).contains(&pad), "padding {pad}");
        }
    }

    #[test]
    fn v2_direction_is_checked() {
        let crypto = SoftwareCrypto::new();
        let mut buffer = plaintext(32);
        encrypt_data_v2(&crypto, &mut buffer, &key(), Side::Client);
        let mut wire = buffer.as_ref().to_vec();
        assert_eq!(
            decrypt_data_v2(&crypto, &mut wire, &key(), Side::Server),
            Err(DecryptError::MessageKeyMismatch)
        );
    }

    #[test]
    fn v2_any_flipped_byte_is_detected() {
        let crypto = SoftwareCrypto::new();
        let mut buffer = plaintext(48);
        do_encrypt_data_v2(&crypto, &mut buffer, &key(), Side::Client, &[9; 32]);
        let wire = buffer.as_ref().to_vec();

        for i in 0..wire.len() {
            let mut tampered = wire.clone();
            tampered[i] ^= 0x01;
            let result = decrypt_data_v2(&crypto, &mut tampered, &key(), Side::Client);
            let expected = if i < 8 {
                DecryptError::AuthKeyMismatch
            } else {
                DecryptError::MessageKeyMismatch
            };
            assert_eq!(result, Err(expected), "byte {i}");
        }
    }

    #[test]
    fn v2_rejects_bad_lengths() {
        let crypto = SoftwareCrypto::new();
        assert_eq!(
            decrypt_data_v2(&crypto, &mut [0u8; 23], &key(), Side::Server),
            Err(DecryptError::InvalidBuffer)
        );
        assert_eq!(
            decrypt_data_v2(&crypto, &mut [0u8; 24 + 15], &key(), Side::Server),
            Err(DecryptError::InvalidBuffer)
        );
    }

    #[test]
    fn v1_roundtrip() {
        let crypto = SoftwareCrypto::new();
        let message: Vec<u8> = (0..40).collect();
        let wire = encrypt_data_v1(&crypto, &message, &key());
        assert_eq!(wire.len(), 24 + 48);
        assert_eq!(decrypt_data_v1(&crypto, &wire, &key(), 40).unwrap(), message);

        let mut tampered = wire.clone();
        tampered[30] ^= 0xff;
        assert_eq!(
            decrypt_data_v1(&crypto, &tampered, &key(), 40),
            Err(DecryptError::MessageKeyMismatch)
        );
    }

    #[test]
    fn nonce_key_data_layout() {
        let crypto = SoftwareCrypto::new();
        let server_nonce = [1u8; 16];
        let new_nonce = [2u8; 32];
        let (key, iv) = generate_key_data_from_nonce(&crypto, &server_nonce, &new_nonce);

        let h1 = crypto.sha1(&[&new_nonce[..], &server_nonce[..]]);
        let h2 = crypto.sha1(&[&server_nonce[..], &new_nonce[..]]);
        assert_eq!(&key[..20], &h1);
        assert_eq!(&key[20..], &h2[..12]);
        assert_eq!(&iv[..8], &h2[12..]);
        assert_eq!(&iv[28..], &new_nonce[..4]);
    }
}
