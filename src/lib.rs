//! # gee-rpc
//!
//! A connection-oriented, codec-pluggable RPC framework. A server
//! multiplexes many concurrent calls over a single connection; a client
//! pipelines asynchronous calls and routes each completion back to its
//! waiter by sequence number. Both ends honor timeouts, and the wire
//! protocol can optionally traverse HTTP infrastructure through a CONNECT
//! tunnel.
//!
//! ## Wire protocol
//!
//! Each connection opens with one `ConnectOption` handshake record in a
//! fixed JSON line, then carries `(header, body)` record pairs in the codec
//! the option named:
//!
//! ```text
//! | Option (JSON line) | Header1 | Body1 | Header2 | Body2 | ...
//! ```
//!
//! Codecs are registered process-wide by identifier; the default is the
//! self-describing binary `application/msgpack`, with `application/json`
//! also built in.
//!
//! ## Components
//!
//! - [`codec`]: record framing, the `Format` body encodings, the registry.
//! - [`service`]: method descriptors and named services built from typed
//!   async closures.
//! - [`server`]: the service registry, connection acceptance, per-request
//!   dispatch with handle timeouts.
//! - [`client`]: `dial`/`go`/`call`, the pending-call table and the reader
//!   task.
//! - [`http`]: the CONNECT tunnel and the debug page.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gee_rpc::{dial, MethodError, RpcServer, Service, UnifyListener};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Arc::new(RpcServer::new());
//!     server.register(Service::new("Foo").method("Sum", |args: Args| async move {
//!         Ok::<i64, MethodError>(args.num1 + args.num2)
//!     }))?;
//!     let listener = UnifyListener::bind("tcp", "127.0.0.1:0").await?;
//!     let addr = listener.local_addr()?;
//!     tokio::spawn(server.clone().accept(listener));
//!
//!     let client = dial("tcp", &addr, None).await?;
//!     let reply: i64 = client.call("Foo.Sum", &Args { num1: 3, num2: 4 }).await?;
//!     assert_eq!(reply, 7);
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod server;
pub mod service;

// re-exported so callers of `go` don't need a second crate for the done
// channel types
pub use crossfire;

pub use client::{dial, Call, RpcClient};
pub use codec::{register_codec, Format, Header};
pub use config::{ConnectOption, MAGIC_NUMBER};
pub use error::{MethodError, RpcError};
pub use http::{dial_http, dial_http_path, CONNECTED, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};
pub use net::{IoStream, UnifyListener};
pub use server::RpcServer;
pub use service::{MethodSpec, Service};
