use std::fmt;
use std::io;

/// Error type shared by the client and server halves of the framework.
///
/// The enum is `Clone` on purpose: a single transport error on a connection
/// must be delivered to every pending call on that connection, so io errors
/// are captured as `(kind, message)` instead of carrying the original
/// `std::io::Error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The client has been closed, or the connection was torn down while
    /// calls were still pending.
    #[error("connection is shut down")]
    Shutdown,

    /// Opening the connection exceeded `ConnectOption::connect_timeout`.
    #[error("rpc client: connect timeout")]
    ConnectTimeout,

    /// The caller's cancellation handle fired before the reply arrived.
    #[error("rpc client: call canceled")]
    Canceled,

    /// An error string carried back in a response header. The message is
    /// produced by the server: method resolution failures, user method
    /// errors, or the handle-timeout template.
    #[error("{0}")]
    Remote(String),

    /// The reply body arrived but could not be decoded into the caller's
    /// reply type.
    #[error("reading body {0}")]
    ReadingBody(String),

    #[error("rpc codec: encode error: {0}")]
    Encode(String),

    #[error("rpc codec: decode error: {0}")]
    Decode(String),

    /// The codec identifier in an Option is not in the registry.
    #[error("invalid codec type {0}")]
    InvalidCodec(String),

    /// A second `register` under an already-taken service name.
    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),

    /// A second `register_codec` under an already-taken identifier.
    #[error("rpc: codec already registered: {0}")]
    DuplicateCodec(String),

    /// `dial_http` received something other than the expected status line.
    #[error("rpc client: unexpected HTTP response: {0}")]
    HttpConnect(String),

    #[error("rpc: io error: {1}")]
    Io(io::ErrorKind, String),
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        RpcError::Io(e.kind(), e.to_string())
    }
}

impl RpcError {
    /// True for the clean end-of-stream conditions that terminate a codec
    /// loop without logging.
    pub fn is_eof(&self) -> bool {
        matches!(self, RpcError::Io(io::ErrorKind::UnexpectedEof, _))
    }
}

/// Error returned by user method handlers. The message travels back to the
/// caller in the response header's error field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError(String);

impl MethodError {
    pub fn new(msg: impl Into<String>) -> Self {
        MethodError(msg.into())
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MethodError {}

impl From<String> for MethodError {
    fn from(msg: String) -> Self {
        MethodError(msg)
    }
}

impl From<&str> for MethodError {
    fn from(msg: &str) -> Self {
        MethodError(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_templates() {
        assert_eq!(RpcError::Shutdown.to_string(), "connection is shut down");
        assert_eq!(RpcError::ConnectTimeout.to_string(), "rpc client: connect timeout");
        let e = RpcError::Remote("rpc server: can't find method Missing".to_string());
        assert!(e.to_string().contains("can't find method Missing"));
        let e = RpcError::DuplicateService("Foo".to_string());
        assert_eq!(e.to_string(), "rpc: service already defined: Foo");
    }

    #[test]
    fn test_io_conversion() {
        let e: RpcError = io::Error::new(io::ErrorKind::UnexpectedEof, "early eof").into();
        assert!(e.is_eof());
        let e2 = e.clone();
        assert_eq!(e, e2);
        let e: RpcError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(!e.is_eof());
    }
}
