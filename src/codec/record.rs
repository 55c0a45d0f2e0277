//! Length-prefixed record framing shared by the built-in codecs.
//!
//! One record pair on the wire is
//! `u32-be header_len, header, u32-be body_len, body`, both frames encoded
//! with the codec's body format. The length prefixes make the stream
//! self-delimiting, so a body can always be consumed (or discarded) even
//! when its header failed resolution.

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{Format, Header, ReadCodec, WriteCodec};
use crate::error::RpcError;
use crate::net::{ConnReader, ConnWriter};

/// Upper bound on a single frame. A length beyond this means the peer is
/// not speaking the protocol.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub fn new_msgpack_codec(r: ConnReader, w: ConnWriter) -> (Box<dyn ReadCodec>, Box<dyn WriteCodec>) {
    (
        Box::new(RecordReader::new(r, Format::Msgpack)),
        Box::new(RecordWriter::new(w, Format::Msgpack)),
    )
}

pub fn new_json_codec(r: ConnReader, w: ConnWriter) -> (Box<dyn ReadCodec>, Box<dyn WriteCodec>) {
    (
        Box::new(RecordReader::new(r, Format::Json)),
        Box::new(RecordWriter::new(w, Format::Json)),
    )
}

struct RecordReader {
    r: ConnReader,
    format: Format,
    // header frames are decoded in place, so the scratch is reused
    scratch: BytesMut,
}

impl RecordReader {
    fn new(r: ConnReader, format: Format) -> Self {
        Self { r, format, scratch: BytesMut::with_capacity(512) }
    }

    async fn read_frame_len(&mut self) -> Result<usize, RpcError> {
        let len = self.r.read_u32().await?;
        if len > MAX_FRAME_LEN {
            warn!("rpc codec: frame of {} bytes exceeds limit", len);
            return Err(RpcError::Decode(format!("frame of {} bytes exceeds limit", len)));
        }
        Ok(len as usize)
    }
}

#[async_trait]
impl ReadCodec for RecordReader {
    fn format(&self) -> Format {
        self.format
    }

    async fn read_header(&mut self) -> Result<Header, RpcError> {
        let len = self.read_frame_len().await?;
        self.scratch.resize(len, 0);
        self.r.read_exact(&mut self.scratch).await?;
        self.format.decode(&self.scratch)
    }

    async fn read_body(&mut self) -> Result<Vec<u8>, RpcError> {
        let len = self.read_frame_len().await?;
        // bodies move into dispatch tasks, so they get their own allocation
        let mut body = vec![0u8; len];
        self.r.read_exact(&mut body).await?;
        Ok(body)
    }
}

struct RecordWriter {
    w: ConnWriter,
    format: Format,
}

impl RecordWriter {
    fn new(w: ConnWriter, format: Format) -> Self {
        Self { w, format }
    }

    async fn write_record(&mut self, header: &Header, body: &[u8]) -> Result<(), RpcError> {
        let head = self.format.encode(header)?;
        self.w.write_u32(head.len() as u32).await?;
        self.w.write_all(&head).await?;
        self.w.write_u32(body.len() as u32).await?;
        self.w.write_all(body).await?;
        // the connection is buffered, so header and body leave in one flush
        self.w.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl WriteCodec for RecordWriter {
    fn format(&self) -> Format {
        self.format
    }

    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), RpcError> {
        let res = self.write_record(header, body).await;
        if let Err(ref e) = res {
            debug!("rpc codec: write failed, closing stream: {}", e);
            let _ = self.w.shutdown().await;
        }
        res
    }

    async fn close(&mut self) -> Result<(), RpcError> {
        self.w.shutdown().await?;
        Ok(())
    }
}
