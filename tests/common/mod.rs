#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gee_rpc::{MethodError, RpcServer, Service, UnifyListener};
use rstest::fixture;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Args {
    pub num1: i64,
    pub num2: i64,
}

/// The scenario service: `Sum` adds, `Slow` sleeps for the given number of
/// milliseconds, `Fail` returns its argument as a method error.
pub fn foo_service() -> Service {
    Service::new("Foo")
        .method("Sum", |args: Args| async move {
            Ok::<i64, MethodError>(args.num1 + args.num2)
        })
        .method("Slow", |ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<u64, MethodError>(ms)
        })
        .method("Fail", |msg: String| async move { Err::<(), MethodError>(MethodError::from(msg)) })
}

/// Boot a server with the `Foo` service (and an empty `Empty` service) on
/// an ephemeral tcp port. Returns the server handle and the bound address.
pub async fn start_server() -> (Arc<RpcServer>, String) {
    let server = Arc::new(RpcServer::new());
    server.register(foo_service()).expect("register Foo");
    server.register(Service::new("Empty")).expect("register Empty");
    let listener = UnifyListener::bind("tcp", "127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(server.clone().accept(listener));
    (server, addr)
}

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

pub struct TestRunner {
    rt: Runtime,
}

impl TestRunner {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            rt: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(8)
                .enable_all()
                .build()
                .unwrap(),
        }
    }

    pub fn block_on<F: std::future::Future<Output = ()>>(&self, f: F) {
        self.rt.block_on(f);
    }
}

impl std::fmt::Debug for TestRunner {
    fn fmt(&self, _f: &mut std::fmt::Formatter) -> std::fmt::Result {
        Ok(())
    }
}
