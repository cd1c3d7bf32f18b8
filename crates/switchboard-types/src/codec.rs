//! [`WireCodec`] – JSON text framing for [`Frame`]s.
//!
//! One frame per WebSocket text message. Binary messages are accepted when
//! they carry UTF-8 JSON, which keeps the codec usable over raw byte
//! transports too.

use crate::{BridgeError, Frame};

/// Stateless encoder/decoder for [`Frame`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

impl WireCodec {
    /// Serialise `frame` to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Codec`] if serialisation fails.
    pub fn encode(frame: &Frame) -> Result<String, BridgeError> {
        serde_json::to_string(frame).map_err(|e| BridgeError::Codec(format!("encode: {e}")))
    }

    /// Parse one JSON text message into a [`Frame`].
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Codec`] for malformed JSON, unknown frame types
    /// or a missing `type` field.
    pub fn decode(text: &str) -> Result<Frame, BridgeError> {
        serde_json::from_str(text).map_err(|e| BridgeError::Codec(format!("decode: {e}")))
    }

    /// Parse a frame from raw bytes (UTF-8 JSON).
    pub fn decode_bytes(bytes: &[u8]) -> Result<Frame, BridgeError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| BridgeError::Codec(format!("frame is not UTF-8: {e}")))?;
        Self::decode(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameKind, RequestData};
    use serde_json::json;

    #[test]
    fn encode_then_decode_request() {
        let frame = Frame::request(
            Some(3),
            RequestData {
                op: "send".into(),
                args: vec![json!(123), json!("hi")],
                kwargs: Default::default(),
                wait: true,
            },
        );
        let text = WireCodec::encode(&frame).unwrap();
        let back = WireCodec::decode(&text).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = WireCodec::decode(r#"{"type":"launch","data":{}}"#).unwrap_err();
        assert!(matches!(err, BridgeError::Codec(_)));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(WireCodec::decode("not json at all").is_err());
        assert!(WireCodec::decode(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn decode_tolerates_missing_data() {
        let frame = WireCodec::decode(r#"{"type":"ok"}"#).unwrap();
        assert_eq!(frame.kind, FrameKind::Ok);
        assert!(frame.data.is_null());
    }

    #[test]
    fn decode_bytes_requires_utf8() {
        assert!(WireCodec::decode_bytes(&[0xff, 0xfe]).is_err());
        let frame = WireCodec::decode_bytes(br#"{"type":"end","id":1}"#).unwrap();
        assert_eq!(frame.id, Some(1));
    }
}
