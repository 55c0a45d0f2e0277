mod common;

use std::sync::Arc;

use common::*;
use gee_rpc::{dial_http, dial_http_path, RpcError, RpcServer, UnifyListener};
use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn start_http_server() -> (Arc<RpcServer>, String) {
    let server = Arc::new(RpcServer::new());
    server.register(foo_service()).expect("register");
    let listener = UnifyListener::bind("tcp", "127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(server.clone().handle_http(listener));
    (server, addr)
}

#[rstest]
fn test_call_over_connect_tunnel(runner: TestRunner) {
    runner.block_on(async move {
        let (_server, addr) = start_http_server().await;
        let client = dial_http("tcp", &addr, None).await.expect("dial http");
        let reply: i64 =
            client.call("Foo.Sum", &Args { num1: 1, num2: 1 }).await.expect("call");
        assert_eq!(reply, 2);
    });
}

#[rstest]
fn test_get_on_rpc_path_is_405(runner: TestRunner) {
    runner.block_on(async move {
        let (_server, addr) = start_http_server().await;
        let mut stream = tokio::net::TcpStream::connect(&addr).await.expect("connect");
        stream
            .write_all(b"GET /_rpc_ HTTP/1.0\r\n\r\n")
            .await
            .expect("write request");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read response");
        assert!(response.starts_with("HTTP/1.0 405"), "got: {}", response);
        assert!(response.ends_with("405 must CONNECT\n"), "got: {}", response);
    });
}

#[rstest]
fn test_debug_page(runner: TestRunner) {
    runner.block_on(async move {
        let (_server, addr) = start_http_server().await;

        // drive one call through the tunnel so the counter moves
        let client = dial_http("tcp", &addr, None).await.expect("dial http");
        let _: i64 = client.call("Foo.Sum", &Args { num1: 2, num2: 2 }).await.expect("call");

        let mut stream = tokio::net::TcpStream::connect(&addr).await.expect("connect");
        stream
            .write_all(b"GET /debug/rpc HTTP/1.0\r\n\r\n")
            .await
            .expect("write request");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read response");
        assert!(response.starts_with("HTTP/1.0 200"), "got: {}", response);
        assert!(response.contains("Service Foo"));
        assert!(response.contains("Sum("));
    });
}

#[rstest]
fn test_wrong_path_fails_dial(runner: TestRunner) {
    runner.block_on(async move {
        let (_server, addr) = start_http_server().await;
        let err = dial_http_path("tcp", &addr, "/nope", None)
            .await
            .expect_err("wrong path must fail");
        assert!(matches!(err, RpcError::HttpConnect(_)), "got: {}", err);
    });
}
