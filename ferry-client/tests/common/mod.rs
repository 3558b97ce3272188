//! An in-memory DC network for driving a real `Client` end to end.
//!
//! Every connection is a `tokio::io::duplex` pipe whose far end is served by
//! a task that speaks intermediate framing, decrypts with the shared key,
//! answers pings itself and hands every other request to a handler. The
//! handler may also answer with service messages or hang up.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use ferry_client::{
    BoxStream, Client, Config, ConnectFuture, Connector, DcEntry, InMemoryBackend, PersistedSession,
    TransportKind,
};
use ferry_crypto::{AuthKey, DequeBuffer, Side, SoftwareCrypto, decrypt_data_v2, encrypt_data_v2};
use ferry_tl::mtproto::{
    BadMsgNotification, BadServerSalt, GetFutureSalts, Message, MsgContainer, MsgsAck, NewSessionCreated, Ping,
    PingDelayDisconnect, Pong, RpcError, RpcResult,
};
use ferry_tl::{Blob, Deserializable, Identifiable, Serializable, constructor_id};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const KEY: [u8; 256] = [0x5a; 256];

/// What a fake DC says to a request.
pub enum Reply {
    Ok(Vec<u8>),
    Err(i32, &'static str),
    /// Never answer.
    Silent,
    /// `bad_server_salt` carrying this salt.
    BadSalt(i64),
    /// `bad_msg_notification` with this code.
    BadMsg(i32),
    /// `new_session_created` starting after the request; nothing else.
    NewSession,
    /// Close the connection without answering.
    HangUp,
}

/// One request as the fake DC saw it.
#[derive(Clone, Debug)]
pub struct Seen {
    pub addr: String,
    pub salt: i64,
}

/// `(dc address, request body) -> reply`
pub type Handler = Arc<dyn Fn(&str, &[u8]) -> Reply + Send + Sync>;

pub struct FakeNetwork {
    handler:  Handler,
    /// Requests handed to the handler so far.
    pub seen: Arc<AtomicUsize>,
    log:      Arc<Mutex<Vec<Seen>>>,
    connects: AtomicUsize,
}

impl FakeNetwork {
    pub fn new(handler: impl Fn(&str, &[u8]) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler:  Arc::new(handler),
            seen:     Arc::new(AtomicUsize::new(0)),
            log:      Arc::new(Mutex::new(Vec::new())),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn seen(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }

    /// Every request handed to the handler, in order.
    pub fn log(&self) -> Vec<Seen> {
        self.log.lock().unwrap().clone()
    }

    /// Streams opened so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for FakeNetwork {
    fn connect<'a>(&'a self, addr: &'a str) -> ConnectFuture<'a> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(1 << 20);
        let dc = FakeDc {
            addr:    addr.to_string(),
            handler: self.handler.clone(),
            seen:    self.seen.clone(),
            log:     self.log.clone(),
            key:     AuthKey::new(&SoftwareCrypto::new(), KEY),
            next_id: 0,
            seq:     0,
        };
        tokio::spawn(dc.serve(server));
        Box::pin(async move { Ok(Box::new(client) as BoxStream) })
    }
}

struct FakeDc {
    addr:    String,
    handler: Handler,
    seen:    Arc<AtomicUsize>,
    log:     Arc<Mutex<Vec<Seen>>>,
    key:     AuthKey,
    next_id: i64,
    seq:     i32,
}

impl FakeDc {
    async fn serve(mut self, mut stream: DuplexStream) {
        let mut preamble = [0u8; 4];
        if stream.read_exact(&mut preamble).await.is_err() || preamble != [0xee; 4] {
            return;
        }
        loop {
            let mut len = [0u8; 4];
            if stream.read_exact(&mut len).await.is_err() {
                return;
            }
            let mut frame = vec![0u8; u32::from_le_bytes(len) as usize];
            if stream.read_exact(&mut frame).await.is_err() {
                return;
            }
            let Some(replies) = self.handle(&mut frame) else {
                return;
            };
            for reply in replies {
                let mut out = (reply.len() as u32).to_le_bytes().to_vec();
                out.extend_from_slice(&reply);
                if stream.write_all(&out).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Decrypt one client frame and produce the encrypted answers, or
    /// `None` to hang up.
    fn handle(&mut self, frame: &mut [u8]) -> Option<Vec<Vec<u8>>> {
        let crypto = SoftwareCrypto::new();
        let plain = decrypt_data_v2(&crypto, frame, &self.key, Side::Client)
            .expect("client frame decrypts")
            .to_vec();
        let salt = i64::from_le_bytes(plain[..8].try_into().unwrap());
        let session_id = i64::from_le_bytes(plain[8..16].try_into().unwrap());
        let msg_id = i64::from_le_bytes(plain[16..24].try_into().unwrap());
        let len = u32::from_le_bytes(plain[28..32].try_into().unwrap()) as usize;
        let body = plain[32..32 + len].to_vec();

        let messages = if constructor_id(&body).unwrap() == MsgContainer::CONSTRUCTOR_ID {
            MsgContainer::from_bytes(&body).unwrap().messages
        } else {
            vec![Message { msg_id, seqno: 0, body }]
        };

        let mut answers = Vec::new();
        for m in messages {
            let answer = match constructor_id(&m.body).unwrap() {
                MsgsAck::CONSTRUCTOR_ID | GetFutureSalts::CONSTRUCTOR_ID => continue,
                Ping::CONSTRUCTOR_ID => {
                    let ping = Ping::from_bytes(&m.body).unwrap();
                    Pong { msg_id: m.msg_id, ping_id: ping.ping_id }.to_bytes()
                }
                PingDelayDisconnect::CONSTRUCTOR_ID => {
                    let ping = PingDelayDisconnect::from_bytes(&m.body).unwrap();
                    Pong { msg_id: m.msg_id, ping_id: ping.ping_id }.to_bytes()
                }
                _ => {
                    self.seen.fetch_add(1, Ordering::SeqCst);
                    self.log.lock().unwrap().push(Seen { addr: self.addr.clone(), salt });
                    let result = match (self.handler)(&self.addr, &m.body) {
                        Reply::Ok(bytes) => bytes,
                        Reply::Err(code, message) => RpcError {
                            error_code:    code,
                            error_message: message.to_string(),
                        }
                        .to_bytes(),
                        Reply::Silent => continue,
                        Reply::BadSalt(new_server_salt) => {
                            let bad = BadServerSalt {
                                bad_msg_id: m.msg_id,
                                bad_msg_seqno: m.seqno,
                                error_code: 48,
                                new_server_salt,
                            };
                            answers.push(self.encrypt(salt, session_id, &bad.to_bytes()));
                            continue;
                        }
                        Reply::BadMsg(error_code) => {
                            let bad = BadMsgNotification { bad_msg_id: m.msg_id, bad_msg_seqno: m.seqno, error_code };
                            answers.push(self.encrypt(salt, session_id, &bad.to_bytes()));
                            continue;
                        }
                        Reply::NewSession => {
                            let created = NewSessionCreated {
                                first_msg_id: m.msg_id + 4,
                                unique_id:    7,
                                server_salt:  salt,
                            };
                            answers.push(self.encrypt(salt, session_id, &created.to_bytes()));
                            continue;
                        }
                        Reply::HangUp => return None,
                    };
                    RpcResult { req_msg_id: m.msg_id, result: Blob(result) }.to_bytes()
                }
            };
            answers.push(self.encrypt(salt, session_id, &answer));
        }
        Some(answers)
    }

    fn encrypt(&mut self, salt: i64, session_id: i64, body: &[u8]) -> Vec<u8> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        let msg_id = (now << 32) | (self.next_id << 2) | 1;
        self.next_id += 1;
        let seq_no = self.seq * 2 + 1;
        self.seq += 1;

        let mut buf = DequeBuffer::with_capacity(32 + body.len(), 24);
        buf.extend(salt.to_le_bytes());
        buf.extend(session_id.to_le_bytes());
        buf.extend(msg_id.to_le_bytes());
        buf.extend(seq_no.to_le_bytes());
        buf.extend((body.len() as u32).to_le_bytes());
        buf.extend(body.iter().copied());
        encrypt_data_v2(&SoftwareCrypto::new(), &mut buf, &self.key, Side::Server);
        buf.as_ref().to_vec()
    }
}

/// A session that already holds [`KEY`] for DCs 1 and 2, homed on DC1.
pub fn seeded_backend() -> Arc<InMemoryBackend> {
    seeded_backend_with_offset(0)
}

/// [`seeded_backend`] with a stored clock skew for every DC.
pub fn seeded_backend_with_offset(time_offset: i32) -> Arc<InMemoryBackend> {
    let dcs = [1, 2]
        .into_iter()
        .map(|id| {
            let mut dc = DcEntry::new(id, format!("dc{id}"));
            dc.auth_key = Some(KEY);
            dc.first_salt = 0x1234;
            dc.time_offset = time_offset;
            dc
        })
        .collect();
    Arc::new(InMemoryBackend::with_session(PersistedSession { home_dc_id: 1, dcs }))
}

pub async fn client(network: Arc<FakeNetwork>, backend: Arc<InMemoryBackend>) -> Client {
    client_with(network, backend, |_| {}).await
}

/// [`client`] with extra settings applied on top.
pub async fn client_with(
    network: Arc<FakeNetwork>,
    backend: Arc<InMemoryBackend>,
    tweak:   impl FnOnce(&mut Config),
) -> Client {
    let mut config = Config {
        dc_addresses: HashMap::from([(1, "dc1".to_string()), (2, "dc2".to_string())]),
        home_dc_id: 1,
        transport: TransportKind::Intermediate,
        connector: Some(network),
        session_backend: backend,
        ..Default::default()
    };
    tweak(&mut config);
    Client::connect(config).await.expect("client starts")
}
