//! Scripted key exchanges against an in-process fake server.

use ferry_crypto::{
    AuthKey, CryptoProvider, CtrCipher, KeyKind, SoftwareCrypto, decrypt_data_v1,
    generate_key_data_from_nonce,
};
use ferry_mtproto::MessageId;
use ferry_mtproto::authentication::{self, Error, Finished, KeyRequest};
use ferry_tl::mtproto::{
    BindAuthKeyInner, ClientDhInnerData, DhGenFail, DhGenOk, DhGenRetry, PQInnerDataKind,
    ReqDhParams, ResPq, ServerDhInnerData, ServerDhParams, ServerDhParamsFail, ServerDhParamsOk,
    SetClientDhParams, SetClientDhParamsAnswer,
};
use ferry_tl::{Cursor, Deserializable, Serializable};
use num_bigint::BigUint;

const DH_PRIME: &str = "c71caeb9c6b1c9048e6c522f70f13f73980d40238e3e21c14934d037563d930f48198a0aa7c14058229493d22530f4dbfa336f6e0ac925139543aed44cce7c3720fd51f69458705ac68cd4fe6b6b13abdc9746512969328454f18faf8c595f642477fe96bb2a941d5bcd1d4ac8cc49880708fa9b378e3c4f3a9060bee67cf9a4a4a695811051907e162753b56b0f6b410dba74d8a84b2a14b3144e0ef1284754fd17ed950d5965b4b9dd46582db1178d169c6bc465b0d6ff9ca3928fef5b9ae4e418fc15e83ebea0f87fa9ff5eed70050ded2849f47bf959d956850ce929851f0d8115f635b105ee2e4e15d04b2454bf6f4fadf034b10403119cd8e3b92fcc5b";

const PQ: u64 = 1470626929934143021;
const P: u64 = 1206429347;
const Q: u64 = 1218991343;
const FINGERPRINT: i64 = 0x1234_5678;
const NOW: i32 = 1_700_000_000;
const SERVER_NONCE: [u8; 16] = [0x5e; 16];

/// Software crypto whose "RSA" is the identity, so the fake server can
/// read `p_q_inner_data` without a private key.
struct TransparentRsa(SoftwareCrypto);

impl CryptoProvider for TransparentRsa {
    fn sha1(&self, parts: &[&[u8]]) -> [u8; 20] { self.0.sha1(parts) }
    fn sha256(&self, parts: &[&[u8]]) -> [u8; 32] { self.0.sha256(parts) }
    fn known_fingerprints(&self) -> Vec<i64> { vec![FINGERPRINT] }
    fn rsa_encrypt(&self, fingerprint: i64, data: &[u8]) -> Option<Vec<u8>> {
        (fingerprint == FINGERPRINT).then(|| data.to_vec())
    }
    fn ige_encrypt(&self, buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
        self.0.ige_encrypt(buffer, key, iv)
    }
    fn ige_decrypt(&self, buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
        self.0.ige_decrypt(buffer, key, iv)
    }
    fn ctr_cipher(&self, key: &[u8; 32], iv: &[u8; 16]) -> Box<dyn CtrCipher> {
        self.0.ctr_cipher(key, iv)
    }
    fn factorize(&self, pq: u64) -> Option<(u64, u64)> { self.0.factorize(pq) }
}

fn crypto() -> TransparentRsa {
    TransparentRsa(SoftwareCrypto::without_keys())
}

fn unhex(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}

fn dh_prime() -> BigUint {
    BigUint::from_bytes_be(&unhex(DH_PRIME))
}

fn server_secret() -> BigUint {
    BigUint::from_bytes_be(&(0..256).map(|i| (i * 5 + 7) as u8).collect::<Vec<_>>())
}

fn client_random() -> [u8; 272] {
    std::array::from_fn(|i| (i * 3 + 1) as u8)
}

fn res_pq(nonce: [u8; 16]) -> ResPq {
    ResPq {
        nonce,
        server_nonce: SERVER_NONCE,
        pq: PQ.to_be_bytes().to_vec(),
        server_public_key_fingerprints: vec![-1, FINGERPRINT],
    }
}

fn new_nonce_of(req: &ReqDhParams) -> ([u8; 32], PQInnerDataKind) {
    let inner = PQInnerDataKind::from_bytes(&req.encrypted_data).unwrap();
    let new_nonce = match &inner {
        PQInnerDataKind::Legacy(x) => x.new_nonce,
        PQInnerDataKind::Dc(x) => x.new_nonce,
        PQInnerDataKind::TempDc(x) => x.new_nonce,
    };
    (new_nonce, inner)
}

fn server_inner(nonce: [u8; 16]) -> ServerDhInnerData {
    let g_a = BigUint::from(3u32).modpow(&server_secret(), &dh_prime());
    ServerDhInnerData {
        nonce,
        server_nonce: SERVER_NONCE,
        g: 3,
        dh_prime: dh_prime().to_bytes_be(),
        g_a: g_a.to_bytes_be(),
        server_time: NOW + 10,
    }
}

fn dh_params_ok(new_nonce: &[u8; 32], inner: &ServerDhInnerData, tamper_hash: bool) -> ServerDhParams {
    let crypto = crypto();
    let inner_bytes = inner.to_bytes();
    let mut answer = crypto.sha1(&[&inner_bytes]).to_vec();
    if tamper_hash {
        answer[0] ^= 1;
    }
    answer.extend_from_slice(&inner_bytes);
    while answer.len() % 16 != 0 {
        answer.push(0);
    }
    let (key, iv) = generate_key_data_from_nonce(&crypto, &SERVER_NONCE, new_nonce);
    crypto.ige_encrypt(&mut answer, &key, &iv);
    ServerDhParams::Ok(ServerDhParamsOk {
        nonce: inner.nonce,
        server_nonce: SERVER_NONCE,
        encrypted_answer: answer,
    })
}

/// The server's view of the key, from the client's `set_client_DH_params`.
fn server_key(new_nonce: &[u8; 32], req: &SetClientDhParams) -> AuthKey {
    let crypto = crypto();
    let (key, iv) = generate_key_data_from_nonce(&crypto, &SERVER_NONCE, new_nonce);
    let mut plain = req.encrypted_data.clone();
    crypto.ige_decrypt(&mut plain, &key, &iv);
    let mut cursor = Cursor::from_slice(&plain[20..]);
    let inner = ClientDhInnerData::deserialize(&mut cursor).unwrap();
    assert_eq!(&plain[..20], &crypto.sha1(&[&plain[20..20 + cursor.pos()]])[..]);

    let g_b = BigUint::from_bytes_be(&inner.g_b);
    let gab = g_b.modpow(&server_secret(), &dh_prime()).to_bytes_be();
    let mut bytes = [0u8; 256];
    bytes[256 - gab.len()..].copy_from_slice(&gab);
    AuthKey::new(&crypto, bytes)
}

/// Drive a whole exchange; returns what the client produced.
fn run(request: KeyRequest) -> (Result<Finished, Error>, Option<PQInnerDataKind>) {
    let crypto = crypto();
    let (req, s1) = authentication::do_step1(request, &[0x01; 16]);
    let (req, s2) = authentication::do_step2(&crypto, s1, res_pq(req.nonce), &[0x02; 32]).unwrap();
    let (new_nonce, sent_inner) = new_nonce_of(&req);
    assert_eq!(req.p, P.to_be_bytes()[4..].to_vec());
    assert_eq!(req.q, Q.to_be_bytes()[4..].to_vec());
    assert_eq!(req.public_key_fingerprint, FINGERPRINT);

    let answer = dh_params_ok(&new_nonce, &server_inner(req.nonce), false);
    let (req, s3) = authentication::do_step3(&crypto, s2, answer, &client_random(), NOW).unwrap();

    let key = server_key(&new_nonce, &req);
    let ok = DhGenOk {
        nonce: req.nonce,
        server_nonce: SERVER_NONCE,
        new_nonce_hash1: key.calc_new_nonce_hash(&crypto, &new_nonce, 1),
    };
    (authentication::finish(&crypto, s3, SetClientDhParamsAnswer::DhGenOk(ok)), Some(sent_inner))
}

#[test]
fn transcript_produces_reference_key() {
    let (finished, inner) = run(KeyRequest::Permanent { dc_id: 2 });
    let finished = finished.unwrap();

    assert_eq!(finished.auth_key.id(), 7578118072869351857);
    assert_eq!(finished.auth_key.kind(), KeyKind::Permanent);
    assert_eq!(finished.time_offset, 10);
    assert_eq!(finished.first_salt, i64::from_le_bytes([0x02 ^ 0x5e; 8]));
    assert!(matches!(inner, Some(PQInnerDataKind::Dc(ref x)) if x.dc == 2));
}

#[test]
fn temporary_key_requests_temp_inner_data() {
    let (finished, inner) = run(KeyRequest::Temporary { dc_id: 4, expires_in: 3600 });
    let finished = finished.unwrap();

    assert_eq!(finished.auth_key.id(), 7578118072869351857);
    assert_eq!(
        finished.auth_key.kind(),
        KeyKind::Temporary { expires_at: NOW + 10 + 3600, perm_key_id: 0 }
    );
    assert!(matches!(
        inner,
        Some(PQInnerDataKind::TempDc(ref x)) if x.dc == 4 && x.expires_in == 3600
    ));
}

fn at_step2() -> authentication::Step1 {
    authentication::do_step1(KeyRequest::Permanent { dc_id: 2 }, &[0x01; 16]).1
}

#[test]
fn step2_rejects_bad_server_replies() {
    let crypto = crypto();

    let err = authentication::do_step2(&crypto, at_step2(), res_pq([9; 16]), &[2; 32]).unwrap_err();
    assert!(matches!(err, Error::InvalidNonce { .. }));

    let mut short = res_pq([1; 16]);
    short.pq = vec![1, 2, 3];
    let err = authentication::do_step2(&crypto, at_step2(), short, &[2; 32]).unwrap_err();
    assert_eq!(err, Error::InvalidPqSize { size: 3 });

    let mut foreign = res_pq([1; 16]);
    foreign.server_public_key_fingerprints = vec![7, 8];
    let err = authentication::do_step2(&crypto, at_step2(), foreign, &[2; 32]).unwrap_err();
    assert_eq!(err, Error::UnknownFingerprints { fingerprints: vec![7, 8] });
}

fn at_step3() -> (authentication::Step2, [u8; 32]) {
    let crypto = crypto();
    let (req, s2) = authentication::do_step2(&crypto, at_step2(), res_pq([1; 16]), &[2; 32]).unwrap();
    (s2, new_nonce_of(&req).0)
}

#[test]
fn step3_rejects_bad_dh_params() {
    let crypto = crypto();

    let (s2, new_nonce) = at_step3();
    let answer = dh_params_ok(&new_nonce, &server_inner([1; 16]), true);
    let err = authentication::do_step3(&crypto, s2, answer, &client_random(), NOW).unwrap_err();
    assert!(matches!(err, Error::InvalidAnswerHash { .. }));

    let (s2, new_nonce) = at_step3();
    let mut weak = server_inner([1; 16]);
    weak.g_a = vec![1];
    let answer = dh_params_ok(&new_nonce, &weak, false);
    let err = authentication::do_step3(&crypto, s2, answer, &client_random(), NOW).unwrap_err();
    assert!(matches!(err, Error::GParameterOutOfRange { .. }));

    let (s2, new_nonce) = at_step3();
    let mut small = server_inner([1; 16]);
    small.dh_prime = (dh_prime() >> 1usize).to_bytes_be();
    let answer = dh_params_ok(&new_nonce, &small, false);
    let err = authentication::do_step3(&crypto, s2, answer, &client_random(), NOW).unwrap_err();
    assert_eq!(err, Error::InvalidDhPrime { bits: 2047 });

    let (s2, new_nonce) = at_step3();
    let hash = crypto.sha1(&[&new_nonce[..]]);
    let fail = ServerDhParams::Fail(ServerDhParamsFail {
        nonce: [1; 16],
        server_nonce: SERVER_NONCE,
        new_nonce_hash: hash[4..].try_into().unwrap(),
    });
    let err = authentication::do_step3(&crypto, s2, fail, &client_random(), NOW).unwrap_err();
    assert_eq!(err, Error::DhParamsFail);
}

#[test]
fn finish_reports_retry_and_failure() {
    let crypto = crypto();
    let expected_key = {
        let (finished, _) = run(KeyRequest::Permanent { dc_id: 2 });
        finished.unwrap().auth_key
    };

    let step3 = || {
        let (s2, new_nonce) = at_step3();
        let answer = dh_params_ok(&new_nonce, &server_inner([1; 16]), false);
        let (_, s3) = authentication::do_step3(&crypto, s2, answer, &client_random(), NOW).unwrap();
        (s3, new_nonce)
    };

    let (s3, new_nonce) = step3();
    let retry = DhGenRetry {
        nonce: [1; 16],
        server_nonce: SERVER_NONCE,
        new_nonce_hash2: expected_key.calc_new_nonce_hash(&crypto, &new_nonce, 2),
    };
    assert_eq!(
        authentication::finish(&crypto, s3, SetClientDhParamsAnswer::DhGenRetry(retry)),
        Err(Error::DhGenRetry)
    );

    let (s3, new_nonce) = step3();
    let fail = DhGenFail {
        nonce: [1; 16],
        server_nonce: SERVER_NONCE,
        new_nonce_hash3: expected_key.calc_new_nonce_hash(&crypto, &new_nonce, 3),
    };
    assert_eq!(
        authentication::finish(&crypto, s3, SetClientDhParamsAnswer::DhGenFail(fail)),
        Err(Error::DhGenFail)
    );

    let (s3, _) = step3();
    let forged = DhGenOk { nonce: [1; 16], server_nonce: SERVER_NONCE, new_nonce_hash1: [0; 16] };
    assert!(matches!(
        authentication::finish(&crypto, s3, SetClientDhParamsAnswer::DhGenOk(forged)),
        Err(Error::InvalidNewNonceHash { .. })
    ));
}

#[test]
fn bind_message_is_readable_with_the_permanent_key() {
    let crypto = crypto();
    let perm = AuthKey::new(&crypto, [3; 256]);
    let temp = AuthKey::new(&crypto, [4; 256]);
    let msg_id = MessageId(0x6000_0000_0000_0004);

    let bind = authentication::do_bind_temp_key(
        &crypto, &perm, &temp, 99, msg_id, NOW + 3600, 0x0bad_cafe, &[7; 16],
    );
    assert_eq!(bind.perm_auth_key_id, perm.id());
    assert_eq!(bind.nonce, 0x0bad_cafe);
    assert_eq!(bind.expires_at, NOW + 3600);

    let plain = decrypt_data_v1(&crypto, &bind.encrypted_message, &perm, 72).unwrap();
    assert_eq!(&plain[..16], &[7; 16]);
    assert_eq!(&plain[16..24], &msg_id.0.to_le_bytes());
    assert_eq!(&plain[24..28], &[0; 4]);
    assert_eq!(&plain[28..32], &40u32.to_le_bytes());

    let inner = BindAuthKeyInner::from_bytes(&plain[32..]).unwrap();
    assert_eq!(inner.temp_auth_key_id, temp.id());
    assert_eq!(inner.perm_auth_key_id, perm.id());
    assert_eq!(inner.temp_session_id, 99);
    assert_eq!(inner.nonce, 0x0bad_cafe);
}
