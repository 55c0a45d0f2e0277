//! Frame-level encoding of `(header, body)` record pairs over one byte
//! stream, plus the process-wide registry that maps codec identifiers to
//! factories.
//!
//! A connection carries one `ConnectOption` (fixed JSON line) followed by an
//! unbounded sequence of record pairs in the negotiated codec. The codec
//! does not synchronize concurrent callers: the read side is owned by one
//! reader task and the write side lives behind a send lock.

mod record;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::net::{ConnReader, ConnWriter};

pub use record::{new_json_codec, new_msgpack_codec};

/// Per-record header. Encoded through the active body format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// `"Service.Method"`; the split happens on the last dot.
    pub service_method: String,
    /// Monotone per client, starting at 1. Zero is never a valid call.
    pub seq: u64,
    /// Empty means success. Only meaningfully set server to client.
    pub error: String,
}

/// Body serialization format of a codec. The registry identifier of each
/// built-in codec is the strum string of its format.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Format {
    /// Self-describing binary encoding, the default.
    #[strum(serialize = "application/msgpack")]
    Msgpack,
    #[strum(serialize = "application/json")]
    Json,
}

impl Format {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, RpcError> {
        match self {
            Format::Msgpack => rmp_serde::encode::to_vec_named(value)
                .map_err(|e| RpcError::Encode(e.to_string())),
            Format::Json => {
                serde_json::to_vec(value).map_err(|e| RpcError::Encode(e.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, RpcError> {
        match self {
            Format::Msgpack => {
                rmp_serde::decode::from_slice(buf).map_err(|e| RpcError::Decode(e.to_string()))
            }
            Format::Json => {
                serde_json::from_slice(buf).map_err(|e| RpcError::Decode(e.to_string()))
            }
        }
    }
}

/// Read side of a codec. `read_header` then `read_body` consume exactly one
/// record pair; `read_body` must be called after every successful
/// `read_header` so the stream never desynchronizes.
#[async_trait]
pub trait ReadCodec: Send {
    fn format(&self) -> Format;

    async fn read_header(&mut self) -> Result<Header, RpcError>;

    /// The raw body frame. Callers decode it with [`Format::decode`], or
    /// drop it to drain an orphan or error body.
    async fn read_body(&mut self) -> Result<Vec<u8>, RpcError>;
}

/// Write side of a codec. `write` emits header and body in one flush or
/// fails; a partial write forces the stream closed.
#[async_trait]
pub trait WriteCodec: Send {
    fn format(&self) -> Format;

    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), RpcError>;

    async fn close(&mut self) -> Result<(), RpcError>;
}

/// Wraps the two halves of a connection into a codec pair.
pub type CodecFactory = fn(ConnReader, ConnWriter) -> (Box<dyn ReadCodec>, Box<dyn WriteCodec>);

static CODECS: Lazy<RwLock<HashMap<String, CodecFactory>>> = Lazy::new(|| {
    let mut m: HashMap<String, CodecFactory> = HashMap::new();
    m.insert(Format::Msgpack.to_string(), new_msgpack_codec as CodecFactory);
    m.insert(Format::Json.to_string(), new_json_codec as CodecFactory);
    RwLock::new(m)
});

/// Register a codec factory under `codec_type`. Identifiers are taken once;
/// a duplicate registration fails.
pub fn register_codec(codec_type: &str, factory: CodecFactory) -> Result<(), RpcError> {
    let mut map = CODECS.write().unwrap();
    if map.contains_key(codec_type) {
        return Err(RpcError::DuplicateCodec(codec_type.to_string()));
    }
    map.insert(codec_type.to_string(), factory);
    Ok(())
}

pub fn lookup_codec(codec_type: &str) -> Option<CodecFactory> {
    CODECS.read().unwrap().get(codec_type).copied()
}
