//! Payload codecs.
//!
//! The set is closed: [`RawCodec`] (bytes in, same bytes out), [`JsonCodec`],
//! [`MsgPackCodec`] and [`BincodeCodec`]. Bincode serializes arbitrary object graphs and must
//! not be used across a trust boundary, so method tables reject it unless
//! insecure codecs were enabled explicitly.

use crate::error::{Result, ShmRpcError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

mod sealed {
    pub trait Sealed {}
}

/// A serde-backed codec.
pub trait Codec: sealed::Sealed {
    const KIND: CodecKind;

    fn dumps<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>>;

    fn loads<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}

/// JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl sealed::Sealed for JsonCodec {}

impl Codec for JsonCodec {
    const KIND: CodecKind = CodecKind::Json;

    fn dumps<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| codec_error(Self::KIND, e))
    }

    fn loads<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| codec_error(Self::KIND, e))
    }
}

/// MessagePack via `rmp-serde`. Structs are written as maps with field names.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl sealed::Sealed for MsgPackCodec {}

impl Codec for MsgPackCodec {
    const KIND: CodecKind = CodecKind::MsgPack;

    fn dumps<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| codec_error(Self::KIND, e))
    }

    fn loads<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        rmp_serde::from_slice(bytes).map_err(|e| codec_error(Self::KIND, e))
    }
}

/// Compact binary encoding of any serde type via `bincode`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl sealed::Sealed for BincodeCodec {}

impl Codec for BincodeCodec {
    const KIND: CodecKind = CodecKind::Bincode;

    fn dumps<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| codec_error(Self::KIND, e))
    }

    fn loads<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| codec_error(Self::KIND, e))
    }
}

/// Byte-identity codec. Values must already be bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl RawCodec {
    pub fn dumps(value: &[u8]) -> Vec<u8> {
        value.to_vec()
    }

    pub fn loads(bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }
}

fn codec_error(kind: CodecKind, err: impl std::fmt::Display) -> ShmRpcError {
    ShmRpcError::Codec {
        codec: kind.name(),
        message: err.to_string(),
    }
}

/// Which codec a method uses for its parameters or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Raw,
    Json,
    #[serde(rename = "msgpack")]
    MsgPack,
    Bincode,
}

impl CodecKind {
    pub fn name(self) -> &'static str {
        match self {
            CodecKind::Raw => "raw",
            CodecKind::Json => "json",
            CodecKind::MsgPack => "msgpack",
            CodecKind::Bincode => "bincode",
        }
    }

    /// Codecs that can rebuild arbitrary object graphs from untrusted input.
    pub fn is_insecure(self) -> bool {
        matches!(self, CodecKind::Bincode)
    }

    /// Encode a typed value. Raw carries bytes only and is rejected here.
    pub fn dumps<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecKind::Json => JsonCodec::dumps(value),
            CodecKind::MsgPack => MsgPackCodec::dumps(value),
            CodecKind::Bincode => BincodeCodec::dumps(value),
            CodecKind::Raw => Err(raw_not_typed()),
        }
    }

    pub fn loads<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecKind::Json => JsonCodec::loads(bytes),
            CodecKind::MsgPack => MsgPackCodec::loads(bytes),
            CodecKind::Bincode => BincodeCodec::loads(bytes),
            CodecKind::Raw => Err(raw_not_typed()),
        }
    }
}

fn raw_not_typed() -> ShmRpcError {
    ShmRpcError::Codec {
        codec: CodecKind::Raw.name(),
        message: "raw codec carries bytes only; use the raw call path".into(),
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CodecKind {
    type Err = ShmRpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(CodecKind::Raw),
            "json" => Ok(CodecKind::Json),
            "msgpack" => Ok(CodecKind::MsgPack),
            "bincode" => Ok(CodecKind::Bincode),
            other => Err(ShmRpcError::Config {
                field: "codec".into(),
                message: format!("unknown codec {:?}", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i64,
        label: String,
        tags: BTreeMap<String, Vec<u8>>,
    }

    fn sample() -> Point {
        let mut tags = BTreeMap::new();
        tags.insert("a".to_string(), vec![1, 2, 3]);
        Point {
            x: -7,
            label: "p".into(),
            tags,
        }
    }

    #[test]
    fn test_typed_codecs_preserve_values() {
        for kind in [CodecKind::Json, CodecKind::MsgPack, CodecKind::Bincode] {
            let bytes = kind.dumps(&sample()).unwrap();
            let back: Point = kind.loads(&bytes).unwrap();
            assert_eq!(back, sample(), "codec {}", kind);
        }
    }

    #[test]
    fn test_json_is_plain_json() {
        let bytes = JsonCodec::dumps(&(1, "two")).unwrap();
        assert_eq!(bytes, br#"[1,"two"]"#);
    }

    #[test]
    fn test_msgpack_round_trip() {
        let bytes = MsgPackCodec::dumps(&sample()).unwrap();
        // Named encoding: a 3-entry fixmap keyed by field names
        assert_eq!(bytes[0], 0x83);
        assert!(bytes.windows(5).any(|w| w == b"label"));
        let back: Point = MsgPackCodec::loads(&bytes).unwrap();
        assert_eq!(back, sample());

        let bytes = MsgPackCodec::dumps(&(7u8, "x")).unwrap();
        let pair: (u8, String) = MsgPackCodec::loads(&bytes).unwrap();
        assert_eq!(pair, (7, "x".to_string()));

        let err = MsgPackCodec::loads::<Point>(b"\xc1").unwrap_err();
        assert!(matches!(err, ShmRpcError::Codec { codec: "msgpack", .. }));
    }

    #[test]
    fn test_raw_is_identity() {
        let data = b"\x00\xffbytes";
        assert_eq!(RawCodec::loads(&RawCodec::dumps(data)), data.to_vec());
        assert!(CodecKind::Raw.dumps(&1u8).is_err());
    }

    #[test]
    fn test_decode_failure_names_codec() {
        let err = CodecKind::Json.loads::<Point>(b"not json").unwrap_err();
        assert!(matches!(err, ShmRpcError::Codec { codec: "json", .. }));
    }

    #[test]
    fn test_only_bincode_is_insecure() {
        assert!(CodecKind::Bincode.is_insecure());
        assert!(!CodecKind::Json.is_insecure());
        assert!(!CodecKind::MsgPack.is_insecure());
        assert!(!CodecKind::Raw.is_insecure());
    }

    #[test]
    fn test_parse_codec_names() {
        assert_eq!("JSON".parse::<CodecKind>().unwrap(), CodecKind::Json);
        assert_eq!("msgpack".parse::<CodecKind>().unwrap(), CodecKind::MsgPack);
        assert!("pickle".parse::<CodecKind>().is_err());
    }
}
