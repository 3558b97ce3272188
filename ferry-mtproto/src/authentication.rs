//! Sans-IO MTProto authorization key generation.
//!
//! # Flow
//!
//! ```text
//! let (req, s1) = authentication::step1(KeyRequest::Permanent { dc_id: 2 });
//! // send req, receive resp
//! let (req, s2) = authentication::step2(crypto, s1, resp)?;
//! // send req, receive resp
//! let (req, s3) = authentication::step3(crypto, s2, resp)?;
//! // send req, receive resp
//! let done = authentication::finish(crypto, s3, resp)?;
//! // done.auth_key is ready
//! ```
//!
//! Each step consumes the previous state, so a failed exchange can only be
//! restarted from [`step1`] with fresh nonces.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ferry_crypto::{AuthKey, CryptoProvider, KeyKind, encrypt_data_v1, generate_key_data_from_nonce};
use ferry_tl::mtproto::{
    BindAuthKeyInner, BindTempAuthKey, ClientDhInnerData, PQInnerDataDc, PQInnerDataTempDc,
    ReqDhParams, ReqPqMulti, ResPq, ServerDhInnerData, ServerDhParams, SetClientDhParams,
    SetClientDhParamsAnswer,
};
use ferry_tl::{Cursor, Deserializable, Serializable};
use num_bigint::BigUint;
use num_traits::One;

use crate::MessageId;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors that can occur during auth key generation.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidNonce         { got: [u8; 16], expected: [u8; 16] },
    InvalidPqSize        { size: usize },
    FactorizationFailed  { pq: u64 },
    UnknownFingerprints  { fingerprints: Vec<i64> },
    EncryptionFailed     { fingerprint: i64 },
    DhParamsFail,
    InvalidServerNonce   { got: [u8; 16], expected: [u8; 16] },
    EncryptedResponseNotPadded { len: usize },
    InvalidDhInnerData   { error: ferry_tl::DecodeError },
    InvalidDhPrime       { bits: u64 },
    GParameterOutOfRange { value: BigUint, low: BigUint, high: BigUint },
    DhGenRetry,
    DhGenFail,
    InvalidAnswerHash    { got: [u8; 20], expected: [u8; 20] },
    InvalidNewNonceHash  { got: [u8; 16], expected: [u8; 16] },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNonce { got, expected }
                => write!(f, "nonce mismatch: got {got:?}, expected {expected:?}"),
            Self::InvalidPqSize { size }
                => write!(f, "pq size {size} invalid (expected 8)"),
            Self::FactorizationFailed { pq }
                => write!(f, "could not factorize pq={pq}"),
            Self::UnknownFingerprints { fingerprints }
                => write!(f, "no known fingerprint in {fingerprints:?}"),
            Self::EncryptionFailed { fingerprint }
                => write!(f, "RSA encryption for fingerprint {fingerprint} failed"),
            Self::DhParamsFail
                => write!(f, "server returned DH params failure"),
            Self::InvalidServerNonce { got, expected }
                => write!(f, "server_nonce mismatch: got {got:?}, expected {expected:?}"),
            Self::EncryptedResponseNotPadded { len }
                => write!(f, "encrypted answer len {len} is not 16-byte aligned"),
            Self::InvalidDhInnerData { error }
                => write!(f, "DH inner data deserialization error: {error}"),
            Self::InvalidDhPrime { bits }
                => write!(f, "DH prime has {bits} bits (expected 2048)"),
            Self::GParameterOutOfRange { value, low, high }
                => write!(f, "g={value} not in range ({low}, {high})"),
            Self::DhGenRetry  => write!(f, "DH gen retry requested"),
            Self::DhGenFail   => write!(f, "DH gen failed"),
            Self::InvalidAnswerHash { got, expected }
                => write!(f, "answer hash mismatch: got {got:?}, expected {expected:?}"),
            Self::InvalidNewNonceHash { got, expected }
                => write!(f, "new nonce hash mismatch: got {got:?}, expected {expected:?}"),
        }
    }
}

// ─── Step state ──────────────────────────────────────────────────────────────

/// Which key the exchange should produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyRequest {
    /// A long-lived key for `dc_id`.
    Permanent { dc_id: i32 },
    /// A key the server forgets after `expires_in` seconds.
    Temporary { dc_id: i32, expires_in: i32 },
}

/// State after step 1.
#[derive(Debug)]
pub struct Step1 {
    nonce:   [u8; 16],
    request: KeyRequest,
}

/// State after step 2.
#[derive(Debug)]
pub struct Step2 {
    nonce:        [u8; 16],
    server_nonce: [u8; 16],
    new_nonce:    [u8; 32],
    request:      KeyRequest,
}

/// State after step 3.
#[derive(Debug)]
pub struct Step3 {
    nonce:        [u8; 16],
    server_nonce: [u8; 16],
    new_nonce:    [u8; 32],
    gab:          BigUint,
    time_offset:  i32,
    expires_at:   Option<i32>,
}

/// The final output of a successful auth key handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct Finished {
    /// The negotiated key, tagged permanent or temporary.
    pub auth_key:    AuthKey,
    /// Clock skew in seconds relative to the server.
    pub time_offset: i32,
    /// Initial server salt.
    pub first_salt:  i64,
}

// ─── Step 1: req_pq_multi ────────────────────────────────────────────────────

/// Generate a `req_pq_multi` request. Returns the request + opaque state.
pub fn step1(request: KeyRequest) -> (ReqPqMulti, Step1) {
    let mut buf = [0u8; 16];
    getrandom::getrandom(&mut buf).expect("getrandom");
    do_step1(request, &buf)
}

/// [`step1`] with a caller-chosen nonce.
pub fn do_step1(request: KeyRequest, random: &[u8; 16]) -> (ReqPqMulti, Step1) {
    let nonce = *random;
    (ReqPqMulti { nonce }, Step1 { nonce, request })
}

// ─── Step 2: req_DH_params ───────────────────────────────────────────────────

/// Process `ResPQ` and generate `req_DH_params`.
pub fn step2(
    crypto:   &dyn CryptoProvider,
    data:     Step1,
    response: ResPq,
) -> Result<(ReqDhParams, Step2), Error> {
    let mut new_nonce = [0u8; 32];
    getrandom::getrandom(&mut new_nonce).expect("getrandom");
    do_step2(crypto, data, response, &new_nonce)
}

/// [`step2`] with a caller-chosen `new_nonce`.
pub fn do_step2(
    crypto:    &dyn CryptoProvider,
    data:      Step1,
    res_pq:    ResPq,
    new_nonce: &[u8; 32],
) -> Result<(ReqDhParams, Step2), Error> {
    let Step1 { nonce, request } = data;
    let new_nonce = *new_nonce;

    check_nonce(&res_pq.nonce, &nonce)?;

    let pq_bytes: [u8; 8] = res_pq.pq.as_slice().try_into()
        .map_err(|_| Error::InvalidPqSize { size: res_pq.pq.len() })?;
    let pq = u64::from_be_bytes(pq_bytes);
    let (p, q) = crypto.factorize(pq).ok_or(Error::FactorizationFailed { pq })?;

    fn trim_be(v: u64) -> Vec<u8> {
        let b = v.to_be_bytes();
        let skip = b.iter().position(|&x| x != 0).unwrap_or(7);
        b[skip..].to_vec()
    }

    let p_bytes = trim_be(p);
    let q_bytes = trim_be(q);

    let pq_inner = match request {
        KeyRequest::Permanent { dc_id } => PQInnerDataDc {
            pq: pq_bytes.to_vec(),
            p: p_bytes.clone(),
            q: q_bytes.clone(),
            nonce,
            server_nonce: res_pq.server_nonce,
            new_nonce,
            dc: dc_id,
        }.to_bytes(),
        KeyRequest::Temporary { dc_id, expires_in } => PQInnerDataTempDc {
            pq: pq_bytes.to_vec(),
            p: p_bytes.clone(),
            q: q_bytes.clone(),
            nonce,
            server_nonce: res_pq.server_nonce,
            new_nonce,
            dc: dc_id,
            expires_in,
        }.to_bytes(),
    };

    let known = crypto.known_fingerprints();
    let fingerprint = res_pq.server_public_key_fingerprints
        .iter()
        .copied()
        .find(|fp| known.contains(fp))
        .ok_or_else(|| Error::UnknownFingerprints {
            fingerprints: res_pq.server_public_key_fingerprints.clone()
        })?;

    let ciphertext = crypto.rsa_encrypt(fingerprint, &pq_inner)
        .ok_or(Error::EncryptionFailed { fingerprint })?;

    log::debug!("[ferry] auth step2: pq factorized, using key fingerprint {fingerprint}");
    Ok((
        ReqDhParams {
            nonce,
            server_nonce: res_pq.server_nonce,
            p: p_bytes,
            q: q_bytes,
            public_key_fingerprint: fingerprint,
            encrypted_data: ciphertext,
        },
        Step2 { nonce, server_nonce: res_pq.server_nonce, new_nonce, request },
    ))
}

// ─── Step 3: set_client_DH_params ────────────────────────────────────────────

/// Process `ServerDhParams` and generate `set_client_DH_params`.
pub fn step3(
    crypto:   &dyn CryptoProvider,
    data:     Step2,
    response: ServerDhParams,
) -> Result<(SetClientDhParams, Step3), Error> {
    let mut rnd = [0u8; 272]; // 256 for DH b, 16 for padding
    getrandom::getrandom(&mut rnd).expect("getrandom");
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i32;
    do_step3(crypto, data, response, &rnd, now)
}

/// [`step3`] with caller-chosen randomness and local time.
pub fn do_step3(
    crypto:   &dyn CryptoProvider,
    data:     Step2,
    response: ServerDhParams,
    random:   &[u8; 272],
    now:      i32,
) -> Result<(SetClientDhParams, Step3), Error> {
    let Step2 { nonce, server_nonce, new_nonce, request } = data;

    let mut server_dh_ok = match response {
        ServerDhParams::Fail(f) => {
            check_nonce(&f.nonce, &nonce)?;
            check_server_nonce(&f.server_nonce, &server_nonce)?;
            let digest = crypto.sha1(&[&new_nonce[..]]);
            let mut expected_hash = [0u8; 16];
            expected_hash.copy_from_slice(&digest[4..]);
            check_new_nonce_hash(&f.new_nonce_hash, &expected_hash)?;
            return Err(Error::DhParamsFail);
        }
        ServerDhParams::Ok(x) => x,
    };

    check_nonce(&server_dh_ok.nonce, &nonce)?;
    check_server_nonce(&server_dh_ok.server_nonce, &server_nonce)?;

    let answer_len = server_dh_ok.encrypted_answer.len();
    if answer_len % 16 != 0 || answer_len < 32 {
        return Err(Error::EncryptedResponseNotPadded { len: answer_len });
    }

    let (key, iv) = generate_key_data_from_nonce(crypto, &server_nonce, &new_nonce);
    crypto.ige_decrypt(&mut server_dh_ok.encrypted_answer, &key, &iv);
    let plain = server_dh_ok.encrypted_answer;

    let mut got_hash = [0u8; 20];
    got_hash.copy_from_slice(&plain[..20]);
    let mut cursor = Cursor::from_slice(&plain[20..]);

    let inner = ServerDhInnerData::deserialize(&mut cursor)
        .map_err(|error| Error::InvalidDhInnerData { error })?;

    let expected_hash = crypto.sha1(&[&plain[20..20 + cursor.pos()]]);
    if got_hash != expected_hash {
        return Err(Error::InvalidAnswerHash { got: got_hash, expected: expected_hash });
    }

    check_nonce(&inner.nonce, &nonce)?;
    check_server_nonce(&inner.server_nonce, &server_nonce)?;

    let dh_prime = BigUint::from_bytes_be(&inner.dh_prime);
    if dh_prime.bits() != 2048 {
        return Err(Error::InvalidDhPrime { bits: dh_prime.bits() });
    }
    let g = BigUint::from(inner.g.max(0) as u32);
    let g_a = BigUint::from_bytes_be(&inner.g_a);
    let time_offset = inner.server_time.wrapping_sub(now);

    let b = BigUint::from_bytes_be(&random[..256]);
    let g_b = g.modpow(&b, &dh_prime);

    // Validate DH parameters
    let one = BigUint::one();
    let p_minus_one = &dh_prime - &one;
    check_g_in_range(&g,   &one, &p_minus_one)?;
    check_g_in_range(&g_a, &one, &p_minus_one)?;
    check_g_in_range(&g_b, &one, &p_minus_one)?;
    let safety = one.clone() << (2048 - 64);
    let upper = &dh_prime - &safety;
    check_g_in_range(&g_a, &safety, &upper)?;
    check_g_in_range(&g_b, &safety, &upper)?;

    let gab = g_a.modpow(&b, &dh_prime);

    let client_dh_inner = ClientDhInnerData {
        nonce,
        server_nonce,
        retry_id: 0,
        g_b: g_b.to_bytes_be(),
    }.to_bytes();

    let digest = crypto.sha1(&[&client_dh_inner]);

    let pad_len = (16 - ((20 + client_dh_inner.len()) % 16)) % 16;

    let mut hashed = Vec::with_capacity(20 + client_dh_inner.len() + pad_len);
    hashed.extend_from_slice(&digest);
    hashed.extend_from_slice(&client_dh_inner);
    hashed.extend_from_slice(&random[256..256 + pad_len]);

    crypto.ige_encrypt(&mut hashed, &key, &iv);

    let expires_at = match request {
        KeyRequest::Permanent { .. } => None,
        KeyRequest::Temporary { expires_in, .. } => Some(inner.server_time.saturating_add(expires_in)),
    };

    log::debug!("[ferry] auth step3: DH params accepted, server time offset {time_offset}s");
    Ok((
        SetClientDhParams {
            nonce,
            server_nonce,
            encrypted_data: hashed,
        },
        Step3 { nonce, server_nonce, new_nonce, gab, time_offset, expires_at },
    ))
}

// ─── finish: create_key ──────────────────────────────────────────────────────

/// Finalise the handshake. Returns the ready [`Finished`] on success.
pub fn finish(
    crypto:   &dyn CryptoProvider,
    data:     Step3,
    response: SetClientDhParamsAnswer,
) -> Result<Finished, Error> {
    let Step3 { nonce, server_nonce, new_nonce, gab, time_offset, expires_at } = data;

    struct DhData { nonce: [u8; 16], server_nonce: [u8; 16], hash: [u8; 16], num: u8 }

    let dh = match response {
        SetClientDhParamsAnswer::DhGenOk(x) =>
            DhData { nonce: x.nonce, server_nonce: x.server_nonce, hash: x.new_nonce_hash1, num: 1 },
        SetClientDhParamsAnswer::DhGenRetry(x) =>
            DhData { nonce: x.nonce, server_nonce: x.server_nonce, hash: x.new_nonce_hash2, num: 2 },
        SetClientDhParamsAnswer::DhGenFail(x) =>
            DhData { nonce: x.nonce, server_nonce: x.server_nonce, hash: x.new_nonce_hash3, num: 3 },
    };

    check_nonce(&dh.nonce, &nonce)?;
    check_server_nonce(&dh.server_nonce, &server_nonce)?;

    // gab < dh_prime, so it never exceeds 256 bytes.
    let mut key_bytes = [0u8; 256];
    let gab_bytes = gab.to_bytes_be();
    key_bytes[256 - gab_bytes.len()..].copy_from_slice(&gab_bytes);

    let mut auth_key = AuthKey::new(crypto, key_bytes);
    let expected_hash = auth_key.calc_new_nonce_hash(crypto, &new_nonce, dh.num);
    check_new_nonce_hash(&dh.hash, &expected_hash)?;

    let first_salt = {
        let mut buf = [0u8; 8];
        for ((dst, a), b) in buf.iter_mut().zip(&new_nonce[..8]).zip(&server_nonce[..8]) {
            *dst = a ^ b;
        }
        i64::from_le_bytes(buf)
    };

    if let Some(expires_at) = expires_at {
        auth_key = auth_key.with_kind(KeyKind::Temporary { expires_at, perm_key_id: 0 });
    }

    match dh.num {
        1 => {
            log::info!("[ferry] auth key negotiated: {auth_key:?}");
            Ok(Finished { auth_key, time_offset, first_salt })
        }
        2 => Err(Error::DhGenRetry),
        _ => Err(Error::DhGenFail),
    }
}

// ─── Temporary key binding ───────────────────────────────────────────────────

/// Build the `auth.bindTempAuthKey` call that binds `temp_key` to `perm_key`.
///
/// `msg_id` must be the id the call itself will be sent with, and the call
/// must be sent encrypted with `temp_key` in session `temp_session_id`.
pub fn bind_temp_key(
    crypto:          &dyn CryptoProvider,
    perm_key:        &AuthKey,
    temp_key:        &AuthKey,
    temp_session_id: i64,
    msg_id:          MessageId,
    expires_at:      i32,
) -> BindTempAuthKey {
    let mut random = [0u8; 24];
    getrandom::getrandom(&mut random).expect("getrandom");
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&random[16..]);
    let mut header = [0u8; 16];
    header.copy_from_slice(&random[..16]);
    do_bind_temp_key(
        crypto, perm_key, temp_key, temp_session_id, msg_id, expires_at,
        i64::from_le_bytes(nonce), &header,
    )
}

/// [`bind_temp_key`] with a caller-chosen nonce and message header.
#[allow(clippy::too_many_arguments)]
pub fn do_bind_temp_key(
    crypto:          &dyn CryptoProvider,
    perm_key:        &AuthKey,
    temp_key:        &AuthKey,
    temp_session_id: i64,
    msg_id:          MessageId,
    expires_at:      i32,
    nonce:           i64,
    random:          &[u8; 16],
) -> BindTempAuthKey {
    let inner = BindAuthKeyInner {
        nonce,
        temp_auth_key_id: temp_key.id(),
        perm_auth_key_id: perm_key.id(),
        temp_session_id,
        expires_at,
    }.to_bytes();

    // random:int128 takes the place of salt + session_id; seqno is 0.
    let mut plaintext = Vec::with_capacity(16 + 8 + 4 + 4 + inner.len());
    plaintext.extend_from_slice(random);
    plaintext.extend_from_slice(&msg_id.0.to_le_bytes());
    plaintext.extend_from_slice(&0i32.to_le_bytes());
    plaintext.extend_from_slice(&(inner.len() as i32).to_le_bytes());
    plaintext.extend_from_slice(&inner);

    BindTempAuthKey {
        perm_auth_key_id: perm_key.id(),
        nonce,
        expires_at,
        encrypted_message: encrypt_data_v1(crypto, &plaintext, perm_key),
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn check_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidNonce { got: *got, expected: *expected })
    }
}
fn check_server_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidServerNonce { got: *got, expected: *expected })
    }
}
fn check_new_nonce_hash(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidNewNonceHash { got: *got, expected: *expected })
    }
}
fn check_g_in_range(val: &BigUint, lo: &BigUint, hi: &BigUint) -> Result<(), Error> {
    if lo < val && val < hi { Ok(()) } else {
        Err(Error::GParameterOutOfRange { value: val.clone(), low: lo.clone(), high: hi.clone() })
    }
}
