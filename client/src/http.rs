//! # Local HTTP Forwarding
//!
//! Turns a `request` frame into a request against the local endpoint
//! and the local response into a `response` frame. Hop-by-hop headers
//! are stripped again on this side, and the body is classified as text
//! or binary by content type before choosing its wire encoding.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::json;
use tunlify_protocol::{
    decode_request_body, is_binary_content_type, is_hop_by_hop, sanitize_headers, BodyEncoding,
    WsMessage,
};

use crate::target::LocalTarget;

/// Forwards one proxied request and always produces exactly one answer
/// frame: `response` on success, `error` otherwise.
pub async fn forward_request(
    client: &reqwest::Client,
    target: &LocalTarget,
    request_id: String,
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: Option<String>,
) -> WsMessage {
    match run(client, target, &method, &url, headers, body).await {
        Ok((status, headers, encoding, body)) => WsMessage::Response {
            request_id,
            status_code: json!(status),
            headers,
            encoding,
            body,
        },
        Err(message) => WsMessage::Error {
            request_id: Some(request_id),
            message,
        },
    }
}

async fn run(
    client: &reqwest::Client,
    target: &LocalTarget,
    method: &str,
    url: &str,
    headers: HashMap<String, String>,
    body: Option<String>,
) -> Result<(u16, HashMap<String, String>, BodyEncoding, String), String> {
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| format!("invalid method '{}'", method))?;
    let full_url = format!("{}{}", target.base_url(), url);

    let mut request = client.request(method, full_url.as_str());
    for (name, value) in &headers {
        if is_hop_by_hop(name) {
            continue;
        }
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(encoded) = body {
        let bytes = decode_request_body(&encoded).map_err(|e| e.to_string())?;
        request = request.body(bytes);
    }

    let response = request
        .send()
        .await
        .map_err(|e| format!("local endpoint unreachable: {}", e))?;

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let headers = sanitize_headers(
        response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );
    let bytes = response
        .bytes()
        .await
        .map_err(|e| format!("failed reading local response body: {}", e))?;

    let (encoding, body) = encode_response_body(&content_type, &bytes);
    Ok((status, headers, encoding, body))
}

/// Picks the wire encoding for a local response body. Binary content
/// types always go base64; declared-text bodies that are not valid
/// UTF-8 are demoted to base64 rather than re-encoded lossily.
pub fn encode_response_body(content_type: &str, bytes: &[u8]) -> (BodyEncoding, String) {
    if is_binary_content_type(content_type) {
        return (BodyEncoding::Base64, BASE64.encode(bytes));
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (BodyEncoding::Utf8, text.to_string()),
        Err(_) => (BodyEncoding::Base64, BASE64.encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_bodies_stay_utf8() {
        let (encoding, body) = encode_response_body("text/html; charset=utf-8", b"<h1>hi</h1>");
        assert_eq!(encoding, BodyEncoding::Utf8);
        assert_eq!(body, "<h1>hi</h1>");
    }

    #[test]
    fn binary_content_types_go_base64() {
        let raw = [0x89, 0x50, 0x4e, 0x47];
        let (encoding, body) = encode_response_body("image/png", &raw);
        assert_eq!(encoding, BodyEncoding::Base64);
        assert_eq!(BASE64.decode(body).unwrap(), raw);
    }

    #[test]
    fn invalid_utf8_text_is_demoted_to_base64() {
        let raw = [0xff, 0xfe, 0x00];
        let (encoding, body) = encode_response_body("text/plain", &raw);
        assert_eq!(encoding, BodyEncoding::Base64);
        assert_eq!(BASE64.decode(body).unwrap(), raw);
    }
}
