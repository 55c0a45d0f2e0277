//! Client half: one connection, many concurrent calls.
//!
//! A client owns the write side of its codec behind an async send lock and
//! runs one reader task that demultiplexes responses back to their waiters
//! by sequence number. Call state lives in a pending table guarded by a
//! plain mutex; the state lock is only ever taken inside the send lock,
//! never the other way around.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use crossfire::{MAsyncRx, MTx};
use futures::{pin_mut, FutureExt};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::sync::Mutex;

use crate::codec::{lookup_codec, Format, Header, ReadCodec, WriteCodec};
use crate::config::{ConnectOption, MAGIC_NUMBER};
use crate::error::RpcError;
use crate::net::{self, BufConn, IoStream};

/// An active call. Travels through its done channel exactly once, after
/// which no field is mutated again.
pub struct Call {
    pub seq: u64,
    pub service_method: String,
    /// Encoded reply body on success; decode with [`Call::into_result`].
    pub reply: Option<Vec<u8>>,
    pub error: Option<RpcError>,
    done: Option<crossfire::Tx<Call>>,
}

impl Call {
    /// Fire the completion signal. Consumes the call so nothing can touch
    /// it afterwards.
    fn complete(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(self);
        }
    }

    /// Decode the reply into the caller's type, or surface the call error.
    pub fn into_result<R: DeserializeOwned>(self, format: Format) -> Result<R, RpcError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let body = self.reply.unwrap_or_default();
        format.decode(&body).map_err(|e| RpcError::ReadingBody(e.to_string()))
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "call {} seq={}", self.service_method, self.seq)
    }
}

struct ClientState {
    /// Next sequence number; starts at 1, 0 never names a call.
    seq: u64,
    pending: HashMap<u64, Call>,
    /// User called close.
    closing: bool,
    /// The connection told us to stop.
    shutdown: bool,
}

struct SendState {
    codec: Box<dyn WriteCodec>,
    /// Requests leave one at a time, so the request header is reusable.
    header: Header,
}

struct ClientInner {
    format: Format,
    send: Mutex<SendState>,
    state: StdMutex<ClientState>,
}

/// A connection-oriented RPC client. Share it with `Arc` to issue calls
/// from several tasks; the connection closes when it is dropped.
pub struct RpcClient {
    close_tx: Option<MTx<()>>,
    inner: Arc<ClientInner>,
}

/// Resolve the optional user option: the magic number is always overwritten
/// with the protocol constant and a missing codec type gets the default.
pub(crate) fn dial_options(opt: Option<ConnectOption>) -> ConnectOption {
    let mut opt = opt.unwrap_or_default();
    opt.magic_number = MAGIC_NUMBER;
    if opt.codec_type.is_empty() {
        opt.codec_type = Format::Msgpack.to_string();
    }
    opt
}

/// Connect to an RPC server at `address` over `network` (`"tcp"` or
/// `"unix"`) and perform the option handshake.
pub async fn dial(
    network: &str,
    address: &str,
    opt: Option<ConnectOption>,
) -> Result<RpcClient, RpcError> {
    let opt = dial_options(opt);
    let stream = net::connect(network, address, opt.connect_timeout).await?;
    RpcClient::with_conn(BufStream::new(stream), opt).await
}

impl RpcClient {
    /// Build a client on an already-open stream, trusting `opt` as given.
    /// [`dial`] is the usual entry point; this one exists for streams that
    /// were established some other way.
    pub async fn new(stream: Box<dyn IoStream>, opt: ConnectOption) -> Result<RpcClient, RpcError> {
        Self::with_conn(BufStream::new(stream), opt).await
    }

    pub(crate) async fn with_conn(
        mut conn: BufConn,
        opt: ConnectOption,
    ) -> Result<RpcClient, RpcError> {
        // an unknown codec fails the dial before any bytes are written
        let Some(factory) = lookup_codec(&opt.codec_type) else {
            warn!("rpc client: codec error: invalid codec type {}", opt.codec_type);
            return Err(RpcError::InvalidCodec(opt.codec_type.clone()));
        };
        let mut line =
            serde_json::to_string(&opt).map_err(|e| RpcError::Encode(e.to_string()))?;
        line.push('\n');
        if let Err(e) = conn.write_all(line.as_bytes()).await {
            warn!("rpc client: options error: {}", e);
            return Err(e.into());
        }
        conn.flush().await?;
        let (r, w) = tokio::io::split(conn);
        let (reader, writer) = factory(r, w);
        Ok(Self::start(reader, writer))
    }

    fn start(reader: Box<dyn ReadCodec>, writer: Box<dyn WriteCodec>) -> RpcClient {
        let (close_tx, close_rx) = crossfire::mpmc::unbounded_async::<()>();
        let inner = Arc::new(ClientInner {
            format: writer.format(),
            send: Mutex::new(SendState { codec: writer, header: Header::default() }),
            state: StdMutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });
        let receiver = inner.clone();
        tokio::spawn(async move { receiver.receive_loop(reader, close_rx).await });
        RpcClient { close_tx: Some(close_tx), inner }
    }

    /// Invoke asynchronously. The call is delivered through `done` when it
    /// completes, including when sending it failed. Returns the assigned
    /// sequence number (0 if the call failed before registration).
    pub async fn go<A: Serialize>(
        &self,
        service_method: &str,
        args: &A,
        done: crossfire::Tx<Call>,
    ) -> u64 {
        let mut call = Call {
            seq: 0,
            service_method: service_method.to_string(),
            reply: None,
            error: None,
            done: Some(done),
        };
        let body = match self.inner.format.encode(args) {
            Ok(body) => body,
            Err(e) => {
                call.error = Some(e);
                call.complete();
                return 0;
            }
        };
        self.inner.send_call(call, &body).await
    }

    /// Invoke synchronously: [`RpcClient::go`] plus waiting on the
    /// completion signal.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let (tx, rx) = crossfire::spsc::bounded_tx_blocking_rx_async::<Call>(1);
        self.go(service_method, args, tx).await;
        match rx.recv().await {
            Ok(call) => call.into_result(self.inner.format),
            Err(_) => Err(RpcError::Shutdown),
        }
    }

    /// Like [`RpcClient::call`], racing an arbitrary cancellation future.
    /// If it fires first the pending call is withdrawn and the server's
    /// eventual reply is drained as an orphan.
    pub async fn call_with_cancel<A, R, C>(
        &self,
        service_method: &str,
        args: &A,
        cancel: C,
    ) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
        C: Future<Output = ()>,
    {
        let (tx, rx) = crossfire::spsc::bounded_tx_blocking_rx_async::<Call>(1);
        let seq = self.go(service_method, args, tx).await;
        let recv = rx.recv().fuse();
        pin_mut!(recv);
        let cancel = cancel.fuse();
        pin_mut!(cancel);
        futures::select! {
            r = recv => match r {
                Ok(call) => call.into_result(self.inner.format),
                Err(_) => Err(RpcError::Shutdown),
            },
            _ = cancel => {
                self.inner.remove_call(seq);
                Err(RpcError::Canceled)
            }
        }
    }

    /// True while the client can still carry calls.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        !state.shutdown && !state.closing
    }

    /// Close the connection. A second close reports `connection is shut
    /// down`. Pending calls complete with the shutdown error once the
    /// reader observes the close.
    pub async fn close(&self) -> Result<(), RpcError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        {
            let mut send = self.inner.send.lock().await;
            let _ = send.codec.close().await;
        }
        if let Some(tx) = self.close_tx.as_ref() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        // releasing the close sender wakes the reader, which terminates any
        // calls still pending
        self.close_tx.take();
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        write!(
            f,
            "rpc client (pending={}, closing={}, shutdown={})",
            state.pending.len(),
            state.closing,
            state.shutdown
        )
    }
}

impl ClientInner {
    /// Register the call and write its request under the send lock. On a
    /// write failure the call is withdrawn and failed, unless the reader
    /// already answered it.
    async fn send_call(&self, mut call: Call, body: &[u8]) -> u64 {
        let service_method = call.service_method.clone();
        let mut send = self.send.lock().await;
        let seq = {
            let mut state = self.state.lock().unwrap();
            if state.closing || state.shutdown {
                drop(state);
                call.error = Some(RpcError::Shutdown);
                call.complete();
                return 0;
            }
            let seq = state.seq;
            call.seq = seq;
            state.pending.insert(seq, call);
            state.seq += 1;
            seq
        };
        let SendState { codec, header } = &mut *send;
        header.service_method = service_method;
        header.seq = seq;
        header.error.clear();
        if let Err(e) = codec.write(header, body).await {
            warn!("rpc client: write request error: {}", e);
            if let Some(mut call) = self.remove_call(seq) {
                call.error = Some(e);
                call.complete();
            }
        }
        seq
    }

    fn remove_call(&self, seq: u64) -> Option<Call> {
        self.state.lock().unwrap().pending.remove(&seq)
    }

    /// The one reader task. Exits on a read error or the close signal, then
    /// terminates every remaining pending call.
    async fn receive_loop(self: Arc<Self>, mut codec: Box<dyn ReadCodec>, close_rx: MAsyncRx<()>) {
        let err = loop {
            let header = {
                let read = codec.read_header().fuse();
                pin_mut!(read);
                let closed = close_rx.recv().fuse();
                pin_mut!(closed);
                futures::select! {
                    r = read => match r {
                        Ok(header) => header,
                        Err(e) => break e,
                    },
                    _ = closed => break RpcError::Shutdown,
                }
            };
            let call = self.remove_call(header.seq);
            let body = match codec.read_body().await {
                Ok(body) => body,
                Err(e) => {
                    if let Some(mut call) = call {
                        call.error = Some(RpcError::ReadingBody(e.to_string()));
                        call.complete();
                    }
                    break e;
                }
            };
            match call {
                // No such call: the send half failed and removed it, or the
                // waiter was canceled. The body was read and is dropped.
                None => {}
                Some(mut call) if !header.error.is_empty() => {
                    call.error = Some(RpcError::Remote(header.error));
                    call.complete();
                }
                Some(mut call) => {
                    call.reply = Some(body);
                    call.complete();
                }
            }
        };
        debug!("rpc client: receive loop exits: {}", err);
        self.terminate_calls(err).await;
    }

    /// Fail every pending call with `err`. Holds the send lock (then the
    /// state lock, in the usual order) so no new call can register while
    /// the table drains.
    async fn terminate_calls(&self, err: RpcError) {
        let _send = self.send.lock().await;
        let calls: Vec<Call> = {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
            state.pending.drain().map(|(_, call)| call).collect()
        };
        for mut call in calls {
            call.error = Some(err.clone());
            call.complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_options_fills_defaults() {
        let opt = dial_options(None);
        assert_eq!(opt.magic_number, MAGIC_NUMBER);
        assert_eq!(opt.codec_type, "application/msgpack");

        let mut custom = ConnectOption::default();
        custom.magic_number = 0; // always overwritten
        custom.codec_type = String::new();
        let opt = dial_options(Some(custom));
        assert_eq!(opt.magic_number, MAGIC_NUMBER);
        assert_eq!(opt.codec_type, "application/msgpack");

        let mut json = ConnectOption::default();
        json.codec_type = "application/json".to_string();
        assert_eq!(dial_options(Some(json)).codec_type, "application/json");
    }

    #[test]
    fn test_call_into_result() {
        let body = Format::Msgpack.encode(&7i64).expect("encode");
        let call = Call {
            seq: 1,
            service_method: "Foo.Sum".to_string(),
            reply: Some(body),
            error: None,
            done: None,
        };
        let reply: i64 = call.into_result(Format::Msgpack).expect("decode");
        assert_eq!(reply, 7);

        let call = Call {
            seq: 2,
            service_method: "Foo.Sum".to_string(),
            reply: None,
            error: Some(RpcError::Shutdown),
            done: None,
        };
        let err = call.into_result::<i64>(Format::Msgpack).expect_err("error wins");
        assert_eq!(err, RpcError::Shutdown);
    }
}
