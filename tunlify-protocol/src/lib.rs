//! # Tunlify Wire Protocol
//!
//! Defines everything both ends of a control channel must agree on:
//!
//! - [`WsMessage`] — the frame set exchanged over the WebSocket control
//!   channel. Frames are JSON text messages tagged with a `"type"` field
//!   (serde's internally-tagged representation).
//! - [`BodyEncoding`] — how HTTP bodies travel inside frames (`utf8` or
//!   `base64`), with encode/decode helpers.
//! - Header hygiene: the hop-by-hop header set stripped from proxied
//!   requests and responses in both directions.
//! - Binary classification for response bodies (content types that must
//!   not be treated as text).

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

// ─── Frames ─────────────────────────────────────────────────────

/// All frames in the tunnel protocol.
///
/// The `#[serde(tag = "type")]` attribute means each variant is serialized
/// as a JSON object with a `"type"` field whose value is the snake_case
/// variant name; payload fields are camelCase. For example,
/// `WsMessage::Heartbeat` serializes to `{"type": "heartbeat"}` and
/// `WsMessage::TcpConnect { .. }` to
/// `{"type": "tcp_connect", "connectionId": "..."}`.
///
/// Frames not in this set deserialize to [`WsMessage::Unknown`]; receivers
/// log and drop them, so the protocol can grow by adding variants.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    // ── Server → client ───────────────────────────────────────────

    /// Issued once after successful authentication.
    #[serde(rename_all = "camelCase")]
    Connected {
        tunnel_id: String,
        subdomain: String,
        region: String,
        public_url: String,
    },

    /// One HTTP request to be proxied to the local endpoint.
    /// `url` is the original path + query as received at the ingress;
    /// `body` is base64-encoded and omitted for bodiless requests.
    #[serde(rename_all = "camelCase")]
    Request {
        request_id: String,
        method: String,
        url: String,
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },

    /// Opens a new logical TCP stream for an inbound public connection.
    /// The client answers with `tcp_connect_ack` or `tcp_error`.
    #[serde(rename_all = "camelCase")]
    TcpConnect { connection_id: String },

    /// A datagram to relay. `source` is the public remote address, kept
    /// stable for the lifetime of the session so replies can route back.
    #[serde(rename_all = "camelCase")]
    UdpData {
        session_id: String,
        data: String,
        source: String,
    },

    /// Liveness probe. Sent periodically by the server; the client may
    /// also send it unsolicited, and the other side answers with
    /// `heartbeat_ack`.
    Heartbeat,

    // ── Client → server ───────────────────────────────────────────

    /// Advisory: the client's intended local target. Logging only.
    #[serde(rename_all = "camelCase")]
    SetLocalAddress { address: String },

    /// Correlates to a prior `request`. `status_code` is deliberately
    /// loose (any JSON value); the gateway falls back to 200 when it is
    /// not a valid integer status.
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: String,
        #[serde(default)]
        status_code: serde_json::Value,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        encoding: BodyEncoding,
        #[serde(default)]
        body: String,
    },

    /// The client accepted a `tcp_connect` and dialed the local endpoint.
    #[serde(rename_all = "camelCase")]
    TcpConnectAck { connection_id: String },

    /// Payload bytes for a logical TCP stream, base64-encoded. Travels in
    /// both directions; bytes are ordered per stream only.
    #[serde(rename_all = "camelCase")]
    TcpData { connection_id: String, data: String },

    /// Half-closes a logical TCP stream. Travels in both directions and is
    /// observed only after all `tcp_data` previously sent for the stream.
    #[serde(rename_all = "camelCase")]
    TcpClose { connection_id: String },

    /// Aborts a logical TCP stream (dial failure, mid-stream error).
    #[serde(rename_all = "camelCase")]
    TcpError {
        connection_id: String,
        message: String,
    },

    /// Return datagram for a UDP session. Zero or more per `udp_data`.
    #[serde(rename_all = "camelCase")]
    UdpResponse { session_id: String, data: String },

    /// Answer to a `heartbeat`.
    HeartbeatAck,

    /// Failure for a specific proxied request.
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },

    // ── Forward compatibility ─────────────────────────────────────

    /// Any frame with an unrecognized `"type"`. Logged and dropped.
    #[serde(other)]
    Unknown,
}

// ─── Body encodings ─────────────────────────────────────────────

/// How an HTTP body travels inside a `response` frame.
///
/// `utf8` bodies are carried verbatim as JSON strings; `base64` bodies are
/// byte sequences that must never be re-encoded as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    #[default]
    Utf8,
    Base64,
}

/// Failure to recover body bytes from a frame.
#[derive(Debug, thiserror::Error)]
#[error("invalid base64 body: {0}")]
pub struct BodyDecodeError(#[from] base64::DecodeError);

/// Encodes raw bytes for the `body` field of a `request` frame.
pub fn encode_body(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Recovers the bytes of a `request` body (always base64 on the wire).
pub fn decode_request_body(body: &str) -> Result<Vec<u8>, BodyDecodeError> {
    Ok(BASE64.decode(body)?)
}

/// Recovers the bytes of a `response` body according to its declared
/// encoding.
pub fn decode_response_body(
    encoding: BodyEncoding,
    body: &str,
) -> Result<Vec<u8>, BodyDecodeError> {
    match encoding {
        BodyEncoding::Utf8 => Ok(body.as_bytes().to_vec()),
        BodyEncoding::Base64 => Ok(BASE64.decode(body)?),
    }
}

// ─── Header hygiene ─────────────────────────────────────────────

/// Headers stripped from proxied requests and responses, in both
/// directions. Connection management and edge-trust headers must never
/// cross the tunnel; the gateway re-derives framing headers itself.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "x-forwarded-for",
    "x-real-ip",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-tunnel-subdomain",
    "x-tunnel-region",
    "server",
    "x-powered-by",
];

/// Case-insensitive membership test against [`HOP_BY_HOP_HEADERS`].
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Flattens header pairs into the wire map, dropping hop-by-hop headers
/// and empty values. Repeated headers are comma-joined in the order they
/// appear, which is the deterministic flattening the wire format requires.
pub fn sanitize_headers<'a, I>(pairs: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in pairs {
        if is_hop_by_hop(name) || value.is_empty() {
            continue;
        }
        let key = name.to_ascii_lowercase();
        match out.get_mut(&key) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                out.insert(key, value.to_string());
            }
        }
    }
    out
}

// ─── Binary classification ──────────────────────────────────────

const BINARY_CONTENT_MARKERS: &[&str] = &["image", "video", "audio", "octet-stream", "pdf"];

/// Whether a `Content-Type` value denotes a body that must travel base64.
pub fn is_binary_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    BINARY_CONTENT_MARKERS.iter().any(|m| ct.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_uses_camel_case_fields() {
        let frame = WsMessage::Request {
            request_id: "r1".into(),
            method: "POST".into(),
            url: "/api?x=1".into(),
            headers: HashMap::from([("accept".to_string(), "*/*".to_string())]),
            body: Some(encode_body(b"hello")),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["requestId"], "r1");
        assert_eq!(json["url"], "/api?x=1");
        assert!(json.get("request_id").is_none());
    }

    #[test]
    fn tcp_frames_round_trip() {
        let text = r#"{"type":"tcp_connect_ack","connectionId":"c-9"}"#;
        match serde_json::from_str::<WsMessage>(text).unwrap() {
            WsMessage::TcpConnectAck { connection_id } => assert_eq!(connection_id, "c-9"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let text = r#"{"type":"flux_capacitor","level":11}"#;
        assert!(matches!(
            serde_json::from_str::<WsMessage>(text).unwrap(),
            WsMessage::Unknown
        ));
    }

    #[test]
    fn response_defaults_are_lenient() {
        // A minimal response: no statusCode, no headers, no body.
        let text = r#"{"type":"response","requestId":"r2"}"#;
        match serde_json::from_str::<WsMessage>(text).unwrap() {
            WsMessage::Response {
                request_id,
                status_code,
                encoding,
                body,
                ..
            } => {
                assert_eq!(request_id, "r2");
                assert!(status_code.is_null());
                assert_eq!(encoding, BodyEncoding::Utf8);
                assert!(body.is_empty());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn body_round_trips() {
        let text = "grüße"; // valid utf8 stays verbatim
        assert_eq!(
            decode_response_body(BodyEncoding::Utf8, text).unwrap(),
            text.as_bytes()
        );

        let raw = [0u8, 159, 146, 150, 255];
        let encoded = encode_body(&raw);
        assert_eq!(
            decode_response_body(BodyEncoding::Base64, &encoded).unwrap(),
            raw
        );
        assert_eq!(decode_request_body(&encoded).unwrap(), raw);
    }

    #[test]
    fn hop_by_hop_is_case_insensitive() {
        assert!(is_hop_by_hop("Host"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("X-Powered-By"));
        assert!(!is_hop_by_hop("content-type"));
    }

    #[test]
    fn sanitize_strips_and_flattens() {
        let pairs = vec![
            ("Host", "myapp.id.tunlify.net"),
            ("Accept", "text/html"),
            ("Accept", "application/json"),
            ("X-Empty", ""),
            ("X-Tunnel-Subdomain", "myapp"),
        ];
        let map = sanitize_headers(pairs);
        assert_eq!(map.get("accept").unwrap(), "text/html, application/json");
        assert!(!map.contains_key("host"));
        assert!(!map.contains_key("x-empty"));
        assert!(!map.contains_key("x-tunnel-subdomain"));
    }

    #[test]
    fn binary_classification() {
        assert!(is_binary_content_type("image/png"));
        assert!(is_binary_content_type("application/octet-stream"));
        assert!(is_binary_content_type("Application/PDF"));
        assert!(!is_binary_content_type("text/html; charset=utf-8"));
        assert!(!is_binary_content_type("application/json"));
    }
}
