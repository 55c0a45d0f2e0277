use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::Format;

/// Marks a connection as speaking this protocol. The first record on every
/// connection must carry it.
pub const MAGIC_NUMBER: u64 = 0x3bef5c;

/// The connection-opening handshake record.
///
/// Always encoded as a single line of JSON regardless of the body codec the
/// rest of the connection uses, so the server can negotiate before any codec
/// exists. Durations travel as integer nanoseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOption {
    pub magic_number: u64,
    /// Identifier of a registered codec, e.g. `"application/msgpack"`.
    pub codec_type: String,
    /// Client-side limit on opening the connection. Zero means no limit.
    #[serde(with = "nanos")]
    pub connect_timeout: Duration,
    /// Server-side limit on producing a response per request. Zero means no
    /// limit. The method itself is not terminated when it fires.
    #[serde(with = "nanos")]
    pub handle_timeout: Duration,
}

impl Default for ConnectOption {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: Format::Msgpack.to_string(),
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::ZERO,
        }
    }
}

mod nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_option() {
        let opt = ConnectOption::default();
        assert_eq!(opt.magic_number, MAGIC_NUMBER);
        assert_eq!(opt.codec_type, "application/msgpack");
        assert_eq!(opt.connect_timeout, Duration::from_secs(10));
        assert!(opt.handle_timeout.is_zero());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut opt = ConnectOption::default();
        opt.handle_timeout = Duration::from_millis(100);
        let line = serde_json::to_string(&opt).expect("encode");
        // one line, newline-delimitable
        assert!(!line.contains('\n'));
        let back: ConnectOption = serde_json::from_str(&line).expect("decode");
        assert_eq!(back.magic_number, MAGIC_NUMBER);
        assert_eq!(back.codec_type, opt.codec_type);
        assert_eq!(back.connect_timeout, Duration::from_secs(10));
        assert_eq!(back.handle_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_durations_travel_as_nanos() {
        let opt = ConnectOption { handle_timeout: Duration::from_millis(1), ..Default::default() };
        let v: serde_json::Value = serde_json::to_value(&opt).expect("encode");
        assert_eq!(v["handle_timeout"], serde_json::json!(1_000_000u64));
        assert_eq!(v["connect_timeout"], serde_json::json!(10_000_000_000u64));
    }
}
