//! Memcached binary protocol, the subset Couchbase data nodes need for `tacks`.
//!
//! Every packet is a 24 byte header followed by a body:
//! - Magic (u8): 0x80 request, 0x81 response
//! - Opcode (u8)
//! - Key length (u16 BE)
//! - Extras length (u8)
//! - Data type (u8)
//! - vBucket id (request) / Status (response) (u16 BE)
//! - Total body length (u32 BE): extras + key + value
//! - Opaque (u32 BE), echoed back by the server
//! - CAS (u64 BE)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::store::StoreError;

pub const HEADER_LEN: usize = 24;

const REQUEST_MAGIC: u8 = 0x80;
const RESPONSE_MAGIC: u8 = 0x81;

pub const DATATYPE_RAW: u8 = 0x00;
pub const DATATYPE_JSON: u8 = 0x01;

/// Common flags of a JSON document, shared by all Couchbase SDKs.
pub const JSON_COMMON_FLAGS: u32 = 0x0200_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Increment = 0x05,
    Hello = 0x1f,
    SaslAuth = 0x21,
    SelectBucket = 0x89,
    GetClusterConfig = 0xb5,
    GetCollectionId = 0xbb,
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Features negotiated with `HELLO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Feature {
    Xerror = 0x07,
    SelectBucket = 0x08,
    Json = 0x0b,
    Collections = 0x12,
}

impl Feature {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    KeyNotFound,
    KeyExists,
    DeltaBadValue,
    NotMyVbucket,
    NoBucket,
    AuthError,
    AccessDenied,
    UnknownCommand,
    Busy,
    TemporaryFailure,
    UnknownCollection,
    UnknownScope,
    Other(u16),
}

impl From<u16> for Status {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => Status::Success,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0006 => Status::DeltaBadValue,
            0x0007 => Status::NotMyVbucket,
            0x0008 => Status::NoBucket,
            0x0020 => Status::AuthError,
            0x0024 => Status::AccessDenied,
            0x0081 => Status::UnknownCommand,
            0x0085 => Status::Busy,
            0x0086 => Status::TemporaryFailure,
            0x0088 => Status::UnknownCollection,
            0x008c => Status::UnknownScope,
            other => Status::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub datatype: u8,
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Request {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            datatype: DATATYPE_RAW,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn with_key(self, key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            ..self
        }
    }

    pub fn with_extras(self, extras: impl Into<Bytes>) -> Self {
        Self {
            extras: extras.into(),
            ..self
        }
    }

    pub fn with_value(self, value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            ..self
        }
    }

    pub fn with_vbucket(self, vbucket: u16) -> Self {
        Self { vbucket, ..self }
    }

    pub fn with_datatype(self, datatype: u8) -> Self {
        Self { datatype, ..self }
    }

    pub fn encode(&self, buffer: &mut BytesMut) -> Result<(), StoreError> {
        let key_len = u16::try_from(self.key.len())
            .map_err(|_| StoreError::Protocol(format!("key of {} bytes", self.key.len())))?;
        let extras_len = u8::try_from(self.extras.len())
            .map_err(|_| StoreError::Protocol(format!("extras of {} bytes", self.extras.len())))?;
        let body_len = u32::try_from(self.extras.len() + self.key.len() + self.value.len())
            .map_err(|_| StoreError::Protocol("body too large".into()))?;

        buffer.reserve(HEADER_LEN + body_len as usize);
        buffer.put_u8(REQUEST_MAGIC);
        buffer.put_u8(self.opcode.as_u8());
        buffer.put_u16(key_len);
        buffer.put_u8(extras_len);
        buffer.put_u8(self.datatype);
        buffer.put_u16(self.vbucket);
        buffer.put_u32(body_len);
        buffer.put_u32(self.opaque);
        buffer.put_u64(self.cas);
        buffer.put_slice(&self.extras);
        buffer.put_slice(&self.key);
        buffer.put_slice(&self.value);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub datatype: u8,
    pub status: Status,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn decode(mut raw: &[u8]) -> Result<Self, StoreError> {
        if raw.len() < HEADER_LEN {
            return Err(StoreError::Protocol(format!(
                "header of {} bytes",
                raw.len()
            )));
        }
        let magic = raw.get_u8();
        if magic != RESPONSE_MAGIC {
            return Err(StoreError::Protocol(format!(
                "unexpected magic 0x{magic:02x}"
            )));
        }

        Ok(Self {
            opcode: raw.get_u8(),
            key_len: raw.get_u16(),
            extras_len: raw.get_u8(),
            datatype: raw.get_u8(),
            status: raw.get_u16().into(),
            body_len: raw.get_u32(),
            opaque: raw.get_u32(),
            cas: raw.get_u64(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: u8,
    pub status: Status,
    pub datatype: u8,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Response {
    pub fn decode(header: ResponseHeader, mut body: Bytes) -> Result<Self, StoreError> {
        let extras_len = header.extras_len as usize;
        let key_len = header.key_len as usize;
        if body.len() != header.body_len as usize || extras_len + key_len > body.len() {
            return Err(StoreError::Protocol(format!(
                "malformed body of {} bytes for header {header:?}",
                body.len()
            )));
        }

        let extras = body.split_to(extras_len);
        let key = body.split_to(key_len);
        Ok(Self {
            opcode: header.opcode,
            status: header.status,
            datatype: header.datatype,
            opaque: header.opaque,
            cas: header.cas,
            extras,
            key,
            value: body,
        })
    }

    /// Server supplied details of a failure, if any.
    pub fn error_context(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Collection-aware keys start with the collection id as unsigned LEB128.
pub fn collection_key(collection_id: u32, key: &str) -> Bytes {
    let mut buffer = BytesMut::with_capacity(5 + key.len());
    let mut value = collection_id;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buffer.put_u8(byte);
            break;
        }
        buffer.put_u8(byte | 0x80);
    }
    buffer.put_slice(key.as_bytes());
    buffer.freeze()
}

/// vBucket owning `key`, the same hash every Couchbase client uses.
pub fn vbucket_for(key: &str, vbuckets: u16) -> u16 {
    let crc = crc32fast::hash(key.as_bytes());
    (((crc >> 16) & 0x7fff) % u32::from(vbuckets.max(1))) as u16
}

pub fn increment_extras(delta: u64, initial: u64) -> Bytes {
    let mut extras = BytesMut::with_capacity(20);
    extras.put_u64(delta);
    extras.put_u64(initial);
    // Zero expiry creates the counter when it's missing and keeps it forever.
    extras.put_u32(0);
    extras.freeze()
}

pub fn store_extras(flags: u32) -> Bytes {
    let mut extras = BytesMut::with_capacity(8);
    extras.put_u32(flags);
    extras.put_u32(0);
    extras.freeze()
}

pub fn sasl_plain(username: &str, password: &str) -> Bytes {
    let mut value = BytesMut::with_capacity(2 + username.len() + password.len());
    value.put_u8(0);
    value.put_slice(username.as_bytes());
    value.put_u8(0);
    value.put_slice(password.as_bytes());
    value.freeze()
}

pub fn hello_value(features: &[Feature]) -> Bytes {
    let mut value = BytesMut::with_capacity(features.len() * 2);
    for feature in features {
        value.put_u16(feature.as_u16());
    }
    value.freeze()
}

pub fn decode_features(mut value: &[u8]) -> Vec<u16> {
    let mut features = Vec::with_capacity(value.len() / 2);
    while value.remaining() >= 2 {
        features.push(value.get_u16());
    }
    features
}
