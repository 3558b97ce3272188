//! The crypto capability the engine is written against.
//!
//! Everything above this crate touches primitives only through
//! `Arc<dyn CryptoProvider>`, so a hardware-backed or audited implementation
//! can be dropped in at construction time.

use std::fmt;

use crate::aes::{self, AesCtr};
use crate::{factorize, rsa};

/// A running AES-256-CTR keystream.
pub trait CtrCipher: Send {
    /// XOR the next `data.len()` keystream bytes into `data`.
    fn apply(&mut self, data: &mut [u8]);
}

impl CtrCipher for AesCtr {
    fn apply(&mut self, data: &mut [u8]) {
        AesCtr::apply(self, data);
    }
}

/// Cryptographic primitives needed by MTProto.
///
/// Every method is a pure function of its inputs (the RSA padding draws
/// fresh randomness, as the scheme requires).
pub trait CryptoProvider: Send + Sync {
    /// SHA-1 over the concatenation of `parts`.
    fn sha1(&self, parts: &[&[u8]]) -> [u8; 20];

    /// SHA-256 over the concatenation of `parts`.
    fn sha256(&self, parts: &[&[u8]]) -> [u8; 32];

    /// Fingerprints of the server public keys this provider can encrypt for.
    fn known_fingerprints(&self) -> Vec<i64>;

    /// RSA-PAD encrypt `data` (≤ 144 bytes) for the key with `fingerprint`.
    ///
    /// Returns `None` if the fingerprint is unknown or the data is too long.
    fn rsa_encrypt(&self, fingerprint: i64, data: &[u8]) -> Option<Vec<u8>>;

    /// AES-256-IGE encrypt whole 16-byte blocks in place.
    fn ige_encrypt(&self, buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]);

    /// AES-256-IGE decrypt whole 16-byte blocks in place.
    fn ige_decrypt(&self, buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]);

    /// Start an AES-256-CTR keystream.
    fn ctr_cipher(&self, key: &[u8; 32], iv: &[u8; 16]) -> Box<dyn CtrCipher>;

    /// Split `pq` into `(p, q)` with `p ≤ q`.
    fn factorize(&self, pq: u64) -> Option<(u64, u64)>;
}

// Production DC key (fingerprint -3414540481677951611).
const PRODUCTION_KEY_N: &str = "29379598170669337022986177149456128565388431120058863768162556424047512191330847455146576344487764408661701890505066208632169112269581063774293102577308490531282748465986139880977280302242772832972539403531316010870401287642763009136156734339538042419388722777357134487746169093539093850251243897188928735903389451772730245253062963384108812842079887538976360465290946139638691491496062099570836476454855996319192747663615955633778034897140982517446405334423701359108810182097749467210509584293428076654573384828809574217079944388301239431309115013843331317877374435868468779972014486325557807783825502498215169806323";

// Test DC key (fingerprint -5595554452916591101).
const TEST_KEY_N: &str = "25342889448840415564971689590713473206898847759084779052582026594546022463853940585885215951168491965708222649399180603818074200620463776135424884632162512403163793083921641631564740959529419359595852941166848940585952337613333022396096584117954892216031229237302943701877588456738335398602461675225081791820393153757504952636234951323237820036543581047826906120927972487366805292115792231423684261262330394324750785450942589751755390156647751460719351439969059949569615302809050721500330239005077889855323917509948255722081644689442127297605422579707142646660768825302832201908302295573257427896031830742328565032949";

const RSA_EXPONENT: &str = "65537";

/// Pure-software provider built on the RustCrypto crates and `num-bigint`.
#[derive(Clone)]
pub struct SoftwareCrypto {
    keys: Vec<(i64, rsa::Key)>,
}

impl SoftwareCrypto {
    /// A provider that knows the production and test DC keys.
    pub fn new() -> Self {
        [PRODUCTION_KEY_N, TEST_KEY_N]
            .into_iter()
            .filter_map(|n| rsa::Key::new(n, RSA_EXPONENT))
            .fold(Self::without_keys(), Self::with_rsa_key)
    }

    /// A provider with no server keys; add them with [`Self::with_rsa_key`].
    pub fn without_keys() -> Self {
        Self { keys: Vec::new() }
    }

    /// Register another server public key.
    pub fn with_rsa_key(mut self, key: rsa::Key) -> Self {
        let fingerprint = key.fingerprint();
        self.keys.retain(|(fp, _)| *fp != fingerprint);
        self.keys.push((fingerprint, key));
        self
    }
}

impl Default for SoftwareCrypto {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for SoftwareCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareCrypto")
            .field("fingerprints", &self.known_fingerprints())
            .finish()
    }
}

impl CryptoProvider for SoftwareCrypto {
    fn sha1(&self, parts: &[&[u8]]) -> [u8; 20] {
        use sha1::{Digest, Sha1};
        let mut h = Sha1::new();
        for part in parts { h.update(part); }
        h.finalize().into()
    }

    fn sha256(&self, parts: &[&[u8]]) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut h = Sha256::new();
        for part in parts { h.update(part); }
        h.finalize().into()
    }

    fn known_fingerprints(&self) -> Vec<i64> {
        self.keys.iter().map(|(fp, _)| *fp).collect()
    }

    fn rsa_encrypt(&self, fingerprint: i64, data: &[u8]) -> Option<Vec<u8>> {
        let (_, key) = self.keys.iter().find(|(fp, _)| *fp == fingerprint)?;
        let mut random = [0u8; 224];
        getrandom::getrandom(&mut random).ok()?;
        rsa::encrypt_hashed(data, key, &random)
    }

    fn ige_encrypt(&self, buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
        aes::ige_encrypt(buffer, key, iv);
    }

    fn ige_decrypt(&self, buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
        aes::ige_decrypt(buffer, key, iv);
    }

    fn ctr_cipher(&self, key: &[u8; 32], iv: &[u8; 16]) -> Box<dyn CtrCipher> {
        Box::new(AesCtr::new(key, iv))
    }

    fn factorize(&self, pq: u64) -> Option<(u64, u64)> {
        factorize(pq)
    }
}
