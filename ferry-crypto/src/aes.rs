//! AES-256 in the two modes MTProto uses: IGE for message envelopes and
//! CTR for transport obfuscation.

use ::aes::Aes256;
use ::aes::cipher::generic_array::GenericArray;
use ::aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};

type Ctr = ctr::Ctr128BE<Aes256>;

fn xor_block(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Encrypt `buffer` in place using AES-256-IGE.
///
/// `buffer.len()` must be a multiple of 16; a trailing partial block is left untouched.
pub fn ige_encrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut prev_cipher = [0u8; 16];
    let mut prev_plain = [0u8; 16];
    prev_cipher.copy_from_slice(&iv[..16]);
    prev_plain.copy_from_slice(&iv[16..]);

    for chunk in buffer.chunks_exact_mut(16) {
        let mut plain = [0u8; 16];
        plain.copy_from_slice(chunk);

        xor_block(chunk, &prev_cipher);
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        xor_block(chunk, &prev_plain);

        prev_cipher.copy_from_slice(chunk);
        prev_plain = plain;
    }
}

/// Decrypt `buffer` in place using AES-256-IGE.
pub fn ige_decrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut prev_cipher = [0u8; 16];
    let mut prev_plain = [0u8; 16];
    prev_cipher.copy_from_slice(&iv[..16]);
    prev_plain.copy_from_slice(&iv[16..]);

    for chunk in buffer.chunks_exact_mut(16) {
        let mut encrypted = [0u8; 16];
        encrypted.copy_from_slice(chunk);

        xor_block(chunk, &prev_plain);
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        xor_block(chunk, &prev_cipher);

        prev_plain.copy_from_slice(chunk);
        prev_cipher = encrypted;
    }
}

/// A running AES-256-CTR keystream.
///
/// Encryption and decryption are the same operation; the counter advances
/// across calls so a stream can be processed in arbitrary pieces.
pub struct AesCtr {
    inner: Ctr,
}

impl AesCtr {
    /// Start a keystream from a 256-bit key and 128-bit initial counter.
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self { inner: Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(iv)) }
    }

    /// XOR the next `data.len()` keystream bytes into `data`.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}
