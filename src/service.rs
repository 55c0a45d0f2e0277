//! A [`Service`] is a named group of remotely callable methods bound to the
//! state its handlers capture. Without runtime reflection, registration
//! takes typed async closures; the generic wrapper owns deserialization of
//! the argument and serialization of the reply, so the rest of the server
//! only ever moves raw body frames around.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Format;
use crate::error::{MethodError, RpcError};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, MethodError>> + Send>>;

/// Decodes the argument frame and, if that succeeds, yields the invocation
/// future. Splitting the two stages keeps `num_calls` honest: a request
/// whose body cannot be decoded never counts as an invocation.
type Handler = Box<dyn Fn(Format, Vec<u8>) -> Result<HandlerFuture, RpcError> + Send + Sync>;

/// Describes one callable method: argument type, reply type, invocation
/// counter, and the erased handler.
pub struct MethodSpec {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    handler: Handler,
}

impl MethodSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MethodSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}({}, {}) error", self.name, self.arg_type, self.reply_type)
    }
}

/// A named collection of method descriptors.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodSpec>>,
}

impl Service {
    /// Create an empty service. The name plays the role of an exported type
    /// name, so it must start with an ASCII uppercase letter; anything else
    /// is a registration bug and aborts, the way the original treats a
    /// non-exported receiver.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let exported = name.chars().next().is_some_and(|c| c.is_ascii_uppercase());
        assert!(exported, "rpc server: {} is not a valid service name", name);
        Self { name, methods: HashMap::new() }
    }

    /// Add a method. `f` receives the decoded argument and resolves to the
    /// reply or a [`MethodError`] that travels back in the response header.
    pub fn method<A, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, MethodError>> + Send + 'static,
    {
        let handler: Handler = Box::new(move |format: Format, argv: Vec<u8>| {
            let args: A = format.decode(&argv)?;
            let fut = f(args);
            let invocation: HandlerFuture = Box::pin(async move {
                let reply = fut.await?;
                format.encode(&reply).map_err(|e| MethodError::from(e.to_string()))
            });
            Ok(invocation)
        });
        let spec = MethodSpec {
            name: name.to_string(),
            arg_type: std::any::type_name::<A>(),
            reply_type: std::any::type_name::<R>(),
            num_calls: AtomicU64::new(0),
            handler,
        };
        debug!("rpc server: register {}.{}", self.name, name);
        self.methods.insert(name.to_string(), Arc::new(spec));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_method(&self, name: &str) -> Option<Arc<MethodSpec>> {
        self.methods.get(name).cloned()
    }

    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodSpec>> {
        self.methods.values()
    }

    /// Invocation count of one method, `None` if no such method.
    pub fn num_calls(&self, method: &str) -> Option<u64> {
        self.methods.get(method).map(|m| m.num_calls())
    }

    /// Decode the argument frame, invoke the method, encode the reply. The
    /// counter only moves once the invocation actually starts.
    pub(crate) async fn call(
        &self,
        mt: &MethodSpec,
        format: Format,
        argv: Vec<u8>,
    ) -> Result<Vec<u8>, String> {
        let fut = (mt.handler)(format, argv).map_err(|e| e.to_string())?;
        mt.num_calls.fetch_add(1, Ordering::SeqCst);
        fut.await.map_err(|e| e.to_string())
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "service {} ({} methods)", self.name, self.methods.len())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    fn sum_service() -> Service {
        Service::new("Foo").method("Sum", |args: Args| async move {
            Ok::<i64, MethodError>(args.num1 + args.num2)
        })
    }

    #[tokio::test]
    async fn test_call_and_counter() {
        let svc = sum_service();
        let mt = svc.get_method("Sum").expect("method");
        assert_eq!(mt.num_calls(), 0);

        let argv = Format::Msgpack.encode(&Args { num1: 3, num2: 4 }).expect("encode");
        let reply = svc.call(&mt, Format::Msgpack, argv).await.expect("call");
        let sum: i64 = Format::Msgpack.decode(&reply).expect("decode");
        assert_eq!(sum, 7);
        assert_eq!(svc.num_calls("Sum"), Some(1));
    }

    #[tokio::test]
    async fn test_method_error_surfaces_as_string() {
        let svc = Service::new("Foo").method("Fail", |_: Args| async move {
            Err::<i64, MethodError>("boom".into())
        });
        let mt = svc.get_method("Fail").expect("method");
        let argv = Format::Msgpack.encode(&Args { num1: 0, num2: 0 }).expect("encode");
        let err = svc.call(&mt, Format::Msgpack, argv).await.expect_err("must fail");
        assert_eq!(err, "boom");
        // a failed invocation still counts
        assert_eq!(svc.num_calls("Fail"), Some(1));
    }

    #[tokio::test]
    async fn test_undecodable_body_does_not_count() {
        let svc = sum_service();
        let mt = svc.get_method("Sum").expect("method");
        let err = svc.call(&mt, Format::Msgpack, b"\xc1garbage".to_vec()).await;
        assert!(err.is_err());
        assert_eq!(svc.num_calls("Sum"), Some(0));
    }

    #[test]
    fn test_empty_service_is_valid() {
        let svc = Service::new("Empty");
        assert_eq!(svc.name(), "Empty");
        assert!(svc.get_method("Anything").is_none());
        assert_eq!(svc.methods().count(), 0);
    }

    #[test]
    fn test_descriptor_types() {
        let svc = sum_service();
        let mt = svc.get_method("Sum").expect("method");
        assert!(mt.arg_type().ends_with("Args"));
        assert_eq!(mt.reply_type(), "i64");
    }

    #[test]
    #[should_panic(expected = "not a valid service name")]
    fn test_unexported_name_is_fatal() {
        let _ = Service::new("foo");
    }
}
