//! HTTP CONNECT tunnel: the server answers `CONNECT` on the RPC path by
//! taking over the byte stream and speaking the ordinary wire protocol on
//! it; the client sends the `CONNECT` preamble before handing the stream to
//! the regular handshake. The exchange is three fixed lines of HTTP/1.0, so
//! it is handled directly on the buffered connection.

use std::io;
use std::sync::Arc;

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};

use crate::client::{dial_options, RpcClient};
use crate::config::ConnectOption;
use crate::error::RpcError;
use crate::net::{self, BufConn, IoStream, UnifyListener};
use crate::server::RpcServer;

/// Status text the server answers a CONNECT with, and the client requires.
pub const CONNECTED: &str = "200 Connected to Gee RPC";

pub const DEFAULT_RPC_PATH: &str = "/_rpc_";
pub const DEFAULT_DEBUG_PATH: &str = "/debug/rpc";

impl RpcServer {
    /// Accept HTTP connections, upgrading `CONNECT` on the default RPC path
    /// and serving the debug page on the default debug path.
    pub async fn handle_http(self: Arc<Self>, listener: UnifyListener) {
        self.handle_http_on(listener, DEFAULT_RPC_PATH, DEFAULT_DEBUG_PATH).await
    }

    /// Same as [`RpcServer::handle_http`] with configurable paths.
    pub async fn handle_http_on(
        self: Arc<Self>,
        listener: UnifyListener,
        rpc_path: &str,
        debug_path: &str,
    ) {
        debug!("rpc server: http on {} (rpc {}, debug {})", listener, rpc_path, debug_path);
        loop {
            match listener.accept().await {
                Err(e) => {
                    warn!("rpc server: accept error: {}", e);
                    return;
                }
                Ok(stream) => {
                    let server = self.clone();
                    let rpc_path = rpc_path.to_string();
                    let debug_path = debug_path.to_string();
                    tokio::spawn(async move {
                        server.serve_http_conn(stream, rpc_path, debug_path).await
                    });
                }
            }
        }
    }

    async fn serve_http_conn(
        self: Arc<Self>,
        stream: Box<dyn IoStream>,
        rpc_path: String,
        debug_path: String,
    ) {
        let mut conn = BufStream::new(stream);
        let head = match read_http_head(&mut conn).await {
            Ok(Some(head)) => head,
            _ => return,
        };
        let (method, path) = head;
        if path == rpc_path {
            if method != "CONNECT" {
                let _ = write_response(
                    &mut conn,
                    "405 Method Not Allowed",
                    "text/plain; charset=utf-8",
                    "405 must CONNECT\n",
                )
                .await;
                return;
            }
            // hijack: from here on the stream speaks the RPC wire protocol
            let line = format!("HTTP/1.0 {}\n\n", CONNECTED);
            if conn.write_all(line.as_bytes()).await.is_err() || conn.flush().await.is_err() {
                return;
            }
            self.serve_stream(conn).await;
        } else if path == debug_path {
            let page = self.debug_html();
            let _ = write_response(&mut conn, "200 OK", "text/html; charset=utf-8", &page).await;
        } else {
            let _ = write_response(
                &mut conn,
                "404 Not Found",
                "text/plain; charset=utf-8",
                "404 page not found\n",
            )
            .await;
        }
    }

    /// Read-only page listing each service, its method signatures and their
    /// invocation counters.
    pub(crate) fn debug_html(&self) -> String {
        let mut page = String::new();
        page.push_str("<html>\n<body>\n<title>GeeRPC Services</title>\n");
        for svc in self.services_snapshot() {
            page.push_str(&format!(
                "<hr>\nService {}\n<hr>\n<table>\n\
                 <th align=center>Method</th><th align=center>Calls</th>\n",
                svc.name()
            ));
            let mut methods: Vec<_> = svc.methods().collect();
            methods.sort_by(|a, b| a.name().cmp(b.name()));
            for mt in methods {
                page.push_str(&format!(
                    "<tr>\n<td align=left font=fixed>{}({}, {}) error</td>\n\
                     <td align=center>{}</td>\n</tr>\n",
                    mt.name(),
                    mt.arg_type(),
                    mt.reply_type(),
                    mt.num_calls()
                ));
            }
            page.push_str("</table>\n");
        }
        page.push_str("</body>\n</html>");
        page
    }
}

/// Request line (method + path), with the remaining header lines drained.
async fn read_http_head(conn: &mut BufConn) -> io::Result<Option<(String, String)>> {
    let mut line = String::new();
    if conn.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    loop {
        let mut header = String::new();
        let n = conn.read_line(&mut header).await?;
        if n == 0 || header == "\r\n" || header == "\n" {
            break;
        }
    }
    Ok(Some((method, path)))
}

async fn write_response(
    conn: &mut BufConn,
    status: &str,
    content_type: &str,
    body: &str,
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.0 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        status,
        content_type,
        body.len()
    );
    conn.write_all(head.as_bytes()).await?;
    conn.write_all(body.as_bytes()).await?;
    conn.flush().await
}

/// Connect to an HTTP RPC server on the default RPC path.
pub async fn dial_http(
    network: &str,
    address: &str,
    opt: Option<ConnectOption>,
) -> Result<RpcClient, RpcError> {
    dial_http_path(network, address, DEFAULT_RPC_PATH, opt).await
}

/// Connect to an HTTP RPC server listening on `rpc_path`. The server must
/// answer with exactly `HTTP/1.0 200 Connected to Gee RPC`.
pub async fn dial_http_path(
    network: &str,
    address: &str,
    rpc_path: &str,
    opt: Option<ConnectOption>,
) -> Result<RpcClient, RpcError> {
    let opt = dial_options(opt);
    let stream = net::connect(network, address, opt.connect_timeout).await?;
    let mut conn = BufStream::new(stream);
    conn.write_all(format!("CONNECT {} HTTP/1.0\n\n", rpc_path).as_bytes()).await?;
    conn.flush().await?;

    let mut status = String::new();
    conn.read_line(&mut status).await?;
    let status = status.trim_end();
    if status != format!("HTTP/1.0 {}", CONNECTED) {
        return Err(RpcError::HttpConnect(status.to_string()));
    }
    // drain the rest of the head; the accept reply is a bare blank line
    loop {
        let mut line = String::new();
        let n = conn.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    RpcClient::with_conn(conn, opt).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MethodError;
    use crate::service::Service;

    #[test]
    fn test_debug_html_lists_services() {
        let server = RpcServer::new();
        server
            .register(Service::new("Foo").method("Sum", |args: (i64, i64)| async move {
                Ok::<i64, MethodError>(args.0 + args.1)
            }))
            .expect("register");
        let page = server.debug_html();
        assert!(page.contains("Service Foo"));
        assert!(page.contains("Sum("));
        assert!(page.contains("error</td>"));
    }
}
