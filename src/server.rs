//! Server half: service registry, connection acceptance, per-connection
//! option negotiation and the codec loop.
//!
//! Each connection gets one reader loop. Requests are dispatched in their
//! own tasks; all responses on a connection funnel through one send lock,
//! so a response's header and body are never interleaved with another's.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{pin_mut, FutureExt};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::codec::{lookup_codec, Format, Header, ReadCodec, WriteCodec};
use crate::config::{ConnectOption, MAGIC_NUMBER};
use crate::error::RpcError;
use crate::net::{BufConn, IoStream, UnifyListener};
use crate::service::{MethodSpec, Service};

/// An RPC server: a registry of services plus the connection machinery.
///
/// Wrap it in an [`Arc`] to share between the accept loop and connections.
pub struct RpcServer {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

/// Everything known about one in-flight request. Lives for the duration of
/// one dispatch task.
struct Request {
    header: Header,
    body: Vec<u8>,
    format: Format,
    svc: Option<Arc<Service>>,
    method: Option<Arc<MethodSpec>>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self { services: RwLock::new(HashMap::new()) }
    }

    /// Publish a service. A second registration under the same name fails.
    pub fn register(&self, svc: Service) -> Result<(), RpcError> {
        let mut map = self.services.write().unwrap();
        match map.entry(svc.name().to_string()) {
            Entry::Occupied(_) => Err(RpcError::DuplicateService(svc.name().to_string())),
            Entry::Vacant(slot) => {
                info!("rpc server: register service {:?}", svc);
                slot.insert(Arc::new(svc));
                Ok(())
            }
        }
    }

    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.read().unwrap().get(name).cloned()
    }

    pub(crate) fn services_snapshot(&self) -> Vec<Arc<Service>> {
        let mut services: Vec<_> = self.services.read().unwrap().values().cloned().collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }

    /// Split `"Service.Method"` on the last dot and resolve both parts. The
    /// error string becomes the response header's error field.
    fn find_service(
        &self,
        service_method: &str,
    ) -> Result<(Arc<Service>, Arc<MethodSpec>), String> {
        let Some((service_name, method_name)) = service_method.rsplit_once('.') else {
            return Err(format!(
                "rpc server: service/method request ill-formed: {}",
                service_method
            ));
        };
        let svc = self
            .services
            .read()
            .unwrap()
            .get(service_name)
            .cloned()
            .ok_or_else(|| format!("rpc server: can't find service {}", service_name))?;
        let mt = svc
            .get_method(method_name)
            .ok_or_else(|| format!("rpc server: can't find method {}", method_name))?;
        Ok((svc, mt))
    }

    /// Accept connections until the listener errors, serving each in its
    /// own task.
    pub async fn accept(self: Arc<Self>, listener: UnifyListener) {
        debug!("rpc server: listening on {}", listener);
        loop {
            match listener.accept().await {
                Err(e) => {
                    warn!("rpc server: accept error: {}", e);
                    return;
                }
                Ok(stream) => {
                    let server = self.clone();
                    tokio::spawn(async move { server.serve_conn(stream).await });
                }
            }
        }
    }

    /// Serve one raw byte stream: negotiate the Option, then run the codec
    /// loop until the peer hangs up or the codec fails.
    pub async fn serve_conn(self: Arc<Self>, stream: Box<dyn IoStream>) {
        self.serve_stream(BufStream::new(stream)).await
    }

    pub(crate) async fn serve_stream(self: Arc<Self>, mut conn: BufConn) {
        let mut line = String::new();
        match conn.read_line(&mut line).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                debug!("rpc server: options error: {}", e);
                return;
            }
        }
        let opt: ConnectOption = match serde_json::from_str(line.trim_end()) {
            Ok(opt) => opt,
            Err(e) => {
                debug!("rpc server: options error: {}", e);
                return;
            }
        };
        if opt.magic_number != MAGIC_NUMBER {
            debug!("rpc server: invalid magic number {:#x}", opt.magic_number);
            return;
        }
        let Some(factory) = lookup_codec(&opt.codec_type) else {
            debug!("rpc server: invalid codec type {}", opt.codec_type);
            return;
        };
        let (r, w) = tokio::io::split(conn);
        let (reader, writer) = factory(r, w);
        self.serve_codec(reader, writer, opt.handle_timeout).await;
    }

    async fn serve_codec(
        self: Arc<Self>,
        mut reader: Box<dyn ReadCodec>,
        writer: Box<dyn WriteCodec>,
        handle_timeout: Duration,
    ) {
        let sending = Arc::new(Mutex::new(writer));
        let mut inflight = JoinSet::new();
        loop {
            let req = match self.read_request(reader.as_mut()).await {
                Ok(req) => req,
                Err(e) => {
                    if !e.is_eof() {
                        warn!("rpc server: read request error: {}", e);
                    }
                    break;
                }
            };
            if !req.header.error.is_empty() {
                // resolution failed; the body is already consumed, so just
                // answer with an error-only header and keep reading
                let body = req.format.encode(&()).unwrap_or_default();
                send_response(&sending, &req.header, &body).await;
                continue;
            }
            inflight.spawn(handle_request(req, sending.clone(), handle_timeout));
        }
        while inflight.join_next().await.is_some() {}
        let _ = sending.lock().await.close().await;
    }

    async fn read_request(&self, codec: &mut dyn ReadCodec) -> Result<Request, RpcError> {
        let header = codec.read_header().await?;
        // the body frame is consumed unconditionally, before resolution,
        // so a bad service/method can never desynchronize the stream
        let body = codec.read_body().await?;
        let mut req =
            Request { header, body, format: codec.format(), svc: None, method: None };
        match self.find_service(&req.header.service_method) {
            Ok((svc, mt)) => {
                req.svc = Some(svc);
                req.method = Some(mt);
            }
            Err(msg) => {
                debug!("{}", msg);
                req.header.error = msg;
            }
        }
        Ok(req)
    }
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch one resolved request, racing the invocation against the
/// connection's handle timeout when one is set.
async fn handle_request(
    mut req: Request,
    sending: Arc<Mutex<Box<dyn WriteCodec>>>,
    handle_timeout: Duration,
) {
    let svc = req.svc.take().expect("resolved service");
    let mt = req.method.take().expect("resolved method");
    let format = req.format;
    let header = req.header;
    let body = req.body;

    if handle_timeout.is_zero() {
        let result = svc.call(&mt, format, body).await;
        respond(&sending, header, format, result).await;
        return;
    }

    // The invocation runs in its own task so a timed-out method keeps
    // running without holding this dispatch slot. Whoever swaps the flag
    // first owns the one response; the loser's write is a no-op.
    let responded = Arc::new(AtomicBool::new(false));
    let claimed = responded.clone();
    let call_sending = sending.clone();
    let call_header = header.clone();
    let mut call_task = tokio::spawn(async move {
        let result = svc.call(&mt, format, body).await;
        if !claimed.swap(true, Ordering::SeqCst) {
            respond(&call_sending, call_header, format, result).await;
        }
    });

    let timer = tokio::time::sleep(handle_timeout).fuse();
    pin_mut!(timer);
    let mut done = (&mut call_task).fuse();
    futures::select! {
        _ = timer => {
            if !responded.swap(true, Ordering::SeqCst) {
                let msg = format!(
                    "rpc server: request handle timeout: expect within {:?}",
                    handle_timeout
                );
                respond(&sending, header, format, Err(msg)).await;
            } else {
                // the call claimed the flag right at the deadline; wait for
                // its response write to finish
                let _ = done.await;
            }
        },
        _ = done => {},
    }
}

async fn respond(
    sending: &Mutex<Box<dyn WriteCodec>>,
    mut header: Header,
    format: Format,
    result: Result<Vec<u8>, String>,
) {
    let body = match result {
        Ok(reply) => reply,
        Err(msg) => {
            header.error = msg;
            // error responses still carry a body frame: the encoded unit
            format.encode(&()).unwrap_or_default()
        }
    };
    send_response(sending, &header, &body).await;
}

/// One critical section per response keeps header and body adjacent on the
/// wire and serializes responses in claim order.
async fn send_response(sending: &Mutex<Box<dyn WriteCodec>>, header: &Header, body: &[u8]) {
    let mut writer = sending.lock().await;
    if let Err(e) = writer.write(header, body).await {
        warn!("rpc server: write response error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MethodError;

    fn test_server() -> RpcServer {
        let server = RpcServer::new();
        let svc = Service::new("Foo")
            .method("Sum", |args: (i64, i64)| async move { Ok::<i64, MethodError>(args.0 + args.1) });
        server.register(svc).expect("register");
        server
    }

    #[test]
    fn test_register_duplicate_fails() {
        let server = test_server();
        let err = server.register(Service::new("Foo")).expect_err("dup");
        assert_eq!(err, RpcError::DuplicateService("Foo".to_string()));
        // an empty service under another name is fine and discoverable
        server.register(Service::new("Empty")).expect("register empty");
        assert!(server.service("Empty").is_some());
    }

    #[test]
    fn test_find_service() {
        let server = test_server();
        assert!(server.find_service("Foo.Sum").is_ok());

        let err = server.find_service("FooSum").expect_err("ill-formed");
        assert!(err.contains("service/method request ill-formed"));

        let err = server.find_service("Bar.Sum").expect_err("no service");
        assert!(err.contains("can't find service Bar"));

        let err = server.find_service("Foo.Missing").expect_err("no method");
        assert!(err.contains("can't find method Missing"));
    }

    #[test]
    fn test_find_service_splits_on_last_dot() {
        let server = RpcServer::new();
        server
            .register(Service::new("Ns.Foo").method("Ping", |_: ()| async move {
                Ok::<(), MethodError>(())
            }))
            .expect("register");
        assert!(server.find_service("Ns.Foo.Ping").is_ok());
    }
}
