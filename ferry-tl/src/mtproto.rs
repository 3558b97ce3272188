//! The MTProto service schema.
//!
//! Only the constructors the engine itself produces or consumes live here:
//! the key-exchange messages, the envelope structures (containers, results,
//! acks, pings) and the server's session notifications. Application objects
//! travel through the engine as opaque byte bodies.

use crate::deserialize::{Buffer, Error, Result};
use crate::{Blob, Deserializable, Identifiable, RawVec, RemoteCall, Serializable};

/// Declare a bare constructor with its fields in wire order.
macro_rules! tl_object {
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl Identifiable for $name {
            const CONSTRUCTOR_ID: u32 = $id;
        }

        impl Serializable for $name {
            #[allow(unused_variables)]
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                Self::CONSTRUCTOR_ID.serialize(buf);
                $( self.$field.serialize(buf); )*
            }
        }

        impl Deserializable for $name {
            fn deserialize(buf: Buffer) -> Result<Self> {
                let id = u32::deserialize(buf)?;
                if id != Self::CONSTRUCTOR_ID {
                    return Err(Error::UnexpectedConstructor { id });
                }
                Self::deserialize_bare(buf)
            }
        }

        impl $name {
            /// Read the fields, assuming the constructor ID was already consumed.
            #[allow(unused_variables)]
            pub fn deserialize_bare(buf: Buffer) -> Result<Self> {
                Ok(Self { $( $field: <$ty>::deserialize(buf)?, )* })
            }
        }
    };
}

/// Declare a boxed type as an enum over already-declared constructors.
macro_rules! tl_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $( $variant:ident($ty:ty) ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub enum $name {
            $( $variant($ty), )+
        }

        impl Serializable for $name {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                match self {
                    $( Self::$variant(x) => x.serialize(buf), )+
                }
            }
        }

        impl Deserializable for $name {
            fn deserialize(buf: Buffer) -> Result<Self> {
                let id = u32::deserialize(buf)?;
                $(
                    if id == <$ty as Identifiable>::CONSTRUCTOR_ID {
                        return Ok(Self::$variant(<$ty>::deserialize_bare(buf)?));
                    }
                )+
                Err(Error::UnexpectedConstructor { id })
            }
        }

        $(
            impl From<$ty> for $name {
                fn from(x: $ty) -> Self { Self::$variant(x) }
            }
        )+
    };
}

// ─── Key exchange ────────────────────────────────────────────────────────────

tl_object!(
    /// `req_pq_multi#be7e8ef1 nonce:int128 = ResPQ`
    ReqPqMulti = 0xbe7e8ef1 { nonce: [u8; 16] }
);

impl RemoteCall for ReqPqMulti {
    type Return = ResPq;
}

tl_object!(
    /// `resPQ#05162463`
    ResPq = 0x05162463 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        pq: Vec<u8>,
        server_public_key_fingerprints: Vec<i64>,
    }
);

tl_object!(
    /// `p_q_inner_data#83c95aec` (legacy, no DC).
    PQInnerData = 0x83c95aec {
        pq: Vec<u8>,
        p: Vec<u8>,
        q: Vec<u8>,
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce: [u8; 32],
    }
);

tl_object!(
    /// `p_q_inner_data_dc#a9f55f95`: permanent key for a given DC.
    PQInnerDataDc = 0xa9f55f95 {
        pq: Vec<u8>,
        p: Vec<u8>,
        q: Vec<u8>,
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce: [u8; 32],
        dc: i32,
    }
);

tl_object!(
    /// `p_q_inner_data_temp_dc#56fddf88`: temporary key valid for `expires_in` seconds.
    PQInnerDataTempDc = 0x56fddf88 {
        pq: Vec<u8>,
        p: Vec<u8>,
        q: Vec<u8>,
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce: [u8; 32],
        dc: i32,
        expires_in: i32,
    }
);

tl_enum!(
    /// Boxed `P_Q_inner_data`.
    PQInnerDataKind {
        Legacy(PQInnerData),
        Dc(PQInnerDataDc),
        TempDc(PQInnerDataTempDc),
    }
);

tl_object!(
    /// `req_DH_params#d712e4be ... = Server_DH_Params`
    ReqDhParams = 0xd712e4be {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        p: Vec<u8>,
        q: Vec<u8>,
        public_key_fingerprint: i64,
        encrypted_data: Vec<u8>,
    }
);

impl RemoteCall for ReqDhParams {
    type Return = ServerDhParams;
}

tl_object!(
    /// `server_DH_params_fail#79cb045d`
    ServerDhParamsFail = 0x79cb045d {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash: [u8; 16],
    }
);

tl_object!(
    /// `server_DH_params_ok#d0e8075c`
    ServerDhParamsOk = 0xd0e8075c {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_answer: Vec<u8>,
    }
);

tl_enum!(
    /// Boxed `Server_DH_Params`.
    ServerDhParams {
        Fail(ServerDhParamsFail),
        Ok(ServerDhParamsOk),
    }
);

tl_object!(
    /// `server_DH_inner_data#b5890dba`
    ServerDhInnerData = 0xb5890dba {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        g: i32,
        dh_prime: Vec<u8>,
        g_a: Vec<u8>,
        server_time: i32,
    }
);

tl_object!(
    /// `client_DH_inner_data#6643b654`
    ClientDhInnerData = 0x6643b654 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        retry_id: i64,
        g_b: Vec<u8>,
    }
);

tl_object!(
    /// `set_client_DH_params#f5045f1f ... = Set_client_DH_params_answer`
    SetClientDhParams = 0xf5045f1f {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_data: Vec<u8>,
    }
);

impl RemoteCall for SetClientDhParams {
    type Return = SetClientDhParamsAnswer;
}

tl_object!(
    /// `dh_gen_ok#3bcbf734`
    DhGenOk = 0x3bcbf734 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash1: [u8; 16],
    }
);

tl_object!(
    /// `dh_gen_retry#46dc1fb9`
    DhGenRetry = 0x46dc1fb9 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash2: [u8; 16],
    }
);

tl_object!(
    /// `dh_gen_fail#a69dae02`
    DhGenFail = 0xa69dae02 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash3: [u8; 16],
    }
);

tl_enum!(
    /// Boxed `Set_client_DH_params_answer`.
    SetClientDhParamsAnswer {
        DhGenOk(DhGenOk),
        DhGenRetry(DhGenRetry),
        DhGenFail(DhGenFail),
    }
);

tl_object!(
    /// `bind_auth_key_inner#75a3f765`, the payload proving ownership of a permanent key.
    BindAuthKeyInner = 0x75a3f765 {
        nonce: i64,
        temp_auth_key_id: i64,
        perm_auth_key_id: i64,
        temp_session_id: i64,
        expires_at: i32,
    }
);

tl_object!(
    /// `auth.bindTempAuthKey#cdd42a05 ... = Bool`
    BindTempAuthKey = 0xcdd42a05 {
        perm_auth_key_id: i64,
        nonce: i64,
        expires_at: i32,
        encrypted_message: Vec<u8>,
    }
);

impl RemoteCall for BindTempAuthKey {
    type Return = bool;
}

// ─── RPC envelope ────────────────────────────────────────────────────────────

tl_object!(
    /// `rpc_result#f35c6d01 req_msg_id:long result:Object`
    RpcResult = 0xf35c6d01 {
        req_msg_id: i64,
        result: Blob,
    }
);

tl_object!(
    /// `rpc_error#2144ca19 error_code:int error_message:string`
    RpcError = 0x2144ca19 {
        error_code: i32,
        error_message: String,
    }
);

tl_object!(
    /// `gzip_packed#3072cfa1 packed_data:bytes`
    GzipPacked = 0x3072cfa1 { packed_data: Vec<u8> }
);

tl_object!(
    /// `msgs_ack#62d6b459 msg_ids:Vector<long>`
    MsgsAck = 0x62d6b459 { msg_ids: Vec<i64> }
);

tl_object!(
    /// `bad_msg_notification#a7eff811`
    BadMsgNotification = 0xa7eff811 {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
    }
);

tl_object!(
    /// `bad_server_salt#edab447b`
    BadServerSalt = 0xedab447b {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
        new_server_salt: i64,
    }
);

tl_object!(
    /// `new_session_created#9ec20908`
    NewSessionCreated = 0x9ec20908 {
        first_msg_id: i64,
        unique_id: i64,
        server_salt: i64,
    }
);

tl_object!(
    /// `msg_detailed_info#276d3ec6`
    MsgDetailedInfo = 0x276d3ec6 {
        msg_id: i64,
        answer_msg_id: i64,
        bytes: i32,
        status: i32,
    }
);

tl_object!(
    /// `msg_new_detailed_info#809db6df`
    MsgNewDetailedInfo = 0x809db6df {
        answer_msg_id: i64,
        bytes: i32,
        status: i32,
    }
);

// ─── Ping ────────────────────────────────────────────────────────────────────

tl_object!(
    /// `ping#7abe77ec ping_id:long = Pong`
    Ping = 0x7abe77ec { ping_id: i64 }
);

impl RemoteCall for Ping {
    type Return = Pong;
}

tl_object!(
    /// `ping_delay_disconnect#f3427b8c ping_id:long disconnect_delay:int = Pong`
    PingDelayDisconnect = 0xf3427b8c {
        ping_id: i64,
        disconnect_delay: i32,
    }
);

impl RemoteCall for PingDelayDisconnect {
    type Return = Pong;
}

tl_object!(
    /// `pong#347773c5 msg_id:long ping_id:long`
    Pong = 0x347773c5 {
        msg_id: i64,
        ping_id: i64,
    }
);

// ─── Salts ───────────────────────────────────────────────────────────────────

tl_object!(
    /// `get_future_salts#b921bd04 num:int = FutureSalts`
    GetFutureSalts = 0xb921bd04 { num: i32 }
);

impl RemoteCall for GetFutureSalts {
    type Return = FutureSalts;
}

tl_object!(
    /// `future_salt#0949d9dc valid_since:int valid_until:int salt:long`
    FutureSalt = 0x0949d9dc {
        valid_since: i32,
        valid_until: i32,
        salt: i64,
    }
);

/// `future_salts#ae500895 req_msg_id:long now:int salts:vector<future_salt>`
///
/// The salts are a bare vector of bare constructors, so this one is written
/// out by hand.
#[derive(Clone, Debug, PartialEq)]
pub struct FutureSalts {
    pub req_msg_id: i64,
    pub now: i32,
    pub salts: Vec<FutureSalt>,
}

impl Identifiable for FutureSalts {
    const CONSTRUCTOR_ID: u32 = 0xae500895;
}

impl Serializable for FutureSalts {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.req_msg_id.serialize(buf);
        self.now.serialize(buf);
        (self.salts.len() as i32).serialize(buf);
        for salt in &self.salts {
            salt.valid_since.serialize(buf);
            salt.valid_until.serialize(buf);
            salt.salt.serialize(buf);
        }
    }
}

impl Deserializable for FutureSalts {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        if id != Self::CONSTRUCTOR_ID {
            return Err(Error::UnexpectedConstructor { id });
        }
        let req_msg_id = i64::deserialize(buf)?;
        let now = i32::deserialize(buf)?;
        let count = i32::deserialize(buf)?;
        if count < 0 || count as usize > buf.remaining() / 16 {
            return Err(Error::InvalidLength { len: count as i64 });
        }
        let salts = (0..count)
            .map(|_| FutureSalt::deserialize_bare(buf))
            .collect::<Result<_>>()?;
        Ok(Self { req_msg_id, now, salts })
    }
}

// ─── Containers ──────────────────────────────────────────────────────────────

/// One `message msg_id:long seqno:int bytes:int body:Object` inside a container.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub msg_id: i64,
    pub seqno: i32,
    pub body: Vec<u8>,
}

impl Message {
    /// Size of the per-message header inside a container.
    pub const HEADER_LEN: usize = 8 + 4 + 4;
}

impl Serializable for Message {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.msg_id.serialize(buf);
        self.seqno.serialize(buf);
        (self.body.len() as i32).serialize(buf);
        buf.extend(self.body.iter().copied());
    }
}

impl Deserializable for Message {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let msg_id = i64::deserialize(buf)?;
        let seqno = i32::deserialize(buf)?;
        let len = i32::deserialize(buf)?;
        if len < 0 || len % 4 != 0 {
            return Err(Error::InvalidLength { len: len as i64 });
        }
        let body = buf.read_slice(len as usize)?.to_vec();
        Ok(Self { msg_id, seqno, body })
    }
}

/// `msg_container#73f1f8dc messages:vector<%Message>`
#[derive(Clone, Debug, PartialEq)]
pub struct MsgContainer {
    pub messages: Vec<Message>,
}

impl MsgContainer {
    /// Size of the container header (constructor + count).
    pub const HEADER_LEN: usize = 4 + 4;
}

impl Identifiable for MsgContainer {
    const CONSTRUCTOR_ID: u32 = 0x73f1f8dc;
}

impl Serializable for MsgContainer {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        (self.messages.len() as i32).serialize(buf);
        for message in &self.messages {
            message.serialize(buf);
        }
    }
}

impl Deserializable for MsgContainer {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        if id != Self::CONSTRUCTOR_ID {
            return Err(Error::UnexpectedConstructor { id });
        }
        let RawVec(messages) = RawVec::<Message>::deserialize(buf)?;
        Ok(Self { messages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_id_leads_the_encoding() {
        let bytes = Ping { ping_id: 7 }.to_bytes();
        assert_eq!(&bytes[..4], &0x7abe77ecu32.to_le_bytes());
        assert_eq!(&bytes[4..], &7i64.to_le_bytes());
    }

    #[test]
    fn wrong_constructor_is_rejected() {
        let bytes = Ping { ping_id: 7 }.to_bytes();
        assert_eq!(
            Pong::from_bytes(&bytes),
            Err(Error::UnexpectedConstructor { id: 0x7abe77ec })
        );
    }

    #[test]
    fn enum_dispatches_on_constructor() {
        let fail = DhGenFail { nonce: [1; 16], server_nonce: [2; 16], new_nonce_hash3: [3; 16] };
        let decoded = SetClientDhParamsAnswer::from_bytes(&fail.to_bytes()).unwrap();
        assert_eq!(decoded, SetClientDhParamsAnswer::DhGenFail(fail));
    }

    #[test]
    fn rpc_result_keeps_the_raw_body() {
        let inner = Pong { msg_id: 1, ping_id: 2 }.to_bytes();
        let result = RpcResult { req_msg_id: 99, result: Blob(inner.clone()) };
        let decoded = RpcResult::from_bytes(&result.to_bytes()).unwrap();
        assert_eq!(decoded.req_msg_id, 99);
        assert_eq!(decoded.result.0, inner);
    }

    #[test]
    fn container_roundtrip() {
        let container = MsgContainer {
            messages: vec![
                Message { msg_id: 4, seqno: 1, body: Ping { ping_id: 1 }.to_bytes() },
                Message { msg_id: 8, seqno: 2, body: MsgsAck { msg_ids: vec![1, 3] }.to_bytes() },
            ],
        };
        assert_eq!(MsgContainer::from_bytes(&container.to_bytes()).unwrap(), container);
    }

    #[test]
    fn container_with_truncated_message_fails() {
        let container = MsgContainer {
            messages: vec![Message { msg_id: 4, seqno: 1, body: Ping { ping_id: 1 }.to_bytes() }],
        };
        let bytes = container.to_bytes();
        assert_eq!(
            MsgContainer::from_bytes(&bytes[..bytes.len() - 4]),
            Err(Error::UnexpectedEof)
        );
    }

    #[test]
    fn future_salts_use_bare_entries() {
        let salts = FutureSalts {
            req_msg_id: 5,
            now: 100,
            salts: vec![
                FutureSalt { valid_since: 100, valid_until: 1900, salt: 11 },
                FutureSalt { valid_since: 1800, valid_until: 3600, salt: 12 },
            ],
        };
        let bytes = salts.to_bytes();
        // constructor + req_msg_id + now + count + 2 × (int + int + long)
        assert_eq!(bytes.len(), 4 + 8 + 4 + 4 + 2 * 16);
        assert_eq!(FutureSalts::from_bytes(&bytes).unwrap(), salts);
    }
}
