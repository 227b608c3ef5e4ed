//! JSON protocol frames exchanged between the tunnel client and the broker.
//!
//! Every frame is a JSON object whose `type` field selects the kind.
//! Bodies travel base64-encoded.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;

/// Status sent back when the local service cannot be reached
pub const STATUS_BAD_GATEWAY: u16 = 502;

/// Messages the broker sends to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BrokerMessage {
    /// Handshake complete, carries the public URL
    TunnelReady { url: String },
    /// An HTTP request to replay against the local service
    HttpRequest(InboundRequestFrame),
    /// Any kind this client does not understand
    #[serde(other)]
    Unknown,
}

impl BrokerMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Messages the client sends to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    HttpResponse(OutboundResponseFrame),
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One HTTP request relayed by the broker.
///
/// `request_id` is assigned by the broker and must be echoed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRequestFrame {
    pub request_id: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Path and query, not a full URL
    #[serde(rename = "url", default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub headers: HeaderMap,
    /// Base64 request body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

impl InboundRequestFrame {
    /// Decoded request body. An absent or empty `body` means no body at all.
    pub fn decode_body(&self) -> std::result::Result<Option<Vec<u8>>, base64::DecodeError> {
        match self.body.as_deref() {
            None | Some("") => Ok(None),
            Some(encoded) => STANDARD.decode(encoded).map(Some),
        }
    }
}

/// The reply to exactly one [`InboundRequestFrame`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundResponseFrame {
    pub request_id: String,
    pub status: u16,
    pub headers: HeaderMap,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
}

impl OutboundResponseFrame {
    /// Reply used when the local call failed
    pub fn bad_gateway(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: STATUS_BAD_GATEWAY,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn into_message(self) -> ClientMessage {
        ClientMessage::HttpResponse(self)
    }
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Value(s) of a single header name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            HeaderValues::One(value) => std::slice::from_ref(value),
            HeaderValues::Many(values) => values,
        };
        values.iter().map(String::as_str)
    }

    fn push(&mut self, value: String) {
        match self {
            HeaderValues::One(first) => {
                let first = std::mem::take(first);
                *self = HeaderValues::Many(vec![first, value]);
            }
            HeaderValues::Many(values) => values.push(value),
        }
    }

    /// Lenient conversion from a JSON header value; `null` carries nothing
    fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Array(items) => Some(HeaderValues::Many(
                items.into_iter().filter_map(json_scalar).collect(),
            )),
            other => json_scalar(other).map(HeaderValues::One),
        }
    }
}

fn json_scalar(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Header mapping that keeps wire order.
///
/// Encoded as a JSON object whose values are a string or a list of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, HeaderValues)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, grouping repeated names into a list
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((name, HeaderValues::One(value))),
        }
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValues> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, values)| values)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValues)> {
        self.entries.iter().map(|(name, values)| (name.as_str(), values))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in iter {
            map.append(name, value);
        }
        map
    }
}

impl Serialize for HeaderMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, values) in &self.entries {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct HeaderMapVisitor;

        impl<'de> Visitor<'de> for HeaderMapVisitor {
            type Value = HeaderMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of header names to values")
            }

            fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<HeaderMap, E> {
                Ok(HeaderMap::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<HeaderMap, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) = access.next_entry::<String, serde_json::Value>()? {
                    if let Some(values) = HeaderValues::from_json(value) {
                        entries.push((name, values));
                    }
                }
                Ok(HeaderMap { entries })
            }
        }

        deserializer.deserialize_any(HeaderMapVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tunnel_ready() {
        let msg = BrokerMessage::parse(br#"{"type":"tunnel-ready","url":"https://foo.tunnel.example"}"#).unwrap();
        assert_eq!(
            msg,
            BrokerMessage::TunnelReady { url: "https://foo.tunnel.example".to_string() }
        );
    }

    #[test]
    fn test_parse_http_request() {
        let raw = json!({
            "type": "http-request",
            "requestId": "r1",
            "method": "POST",
            "url": "/items?limit=2",
            "headers": { "content-type": "text/plain", "x-forwarded-for": ["1.1.1.1", "2.2.2.2"], "x-n": 5 },
            "body": "aGVsbG8="
        });
        let msg = BrokerMessage::parse(raw.to_string().as_bytes()).unwrap();
        let BrokerMessage::HttpRequest(frame) = msg else {
            panic!("expected http-request");
        };

        assert_eq!(frame.request_id, "r1");
        assert_eq!(frame.method, "POST");
        assert_eq!(frame.path, "/items?limit=2");
        let names: Vec<&str> = frame.headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["content-type", "x-forwarded-for", "x-n"]);
        assert_eq!(
            frame.headers.get("x-forwarded-for"),
            Some(&HeaderValues::Many(vec!["1.1.1.1".into(), "2.2.2.2".into()]))
        );
        assert_eq!(frame.headers.get("x-n"), Some(&HeaderValues::One("5".into())));
        assert_eq!(frame.decode_body().unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn test_missing_or_empty_body_means_no_body() {
        let mut frame: InboundRequestFrame = serde_json::from_value(json!({
            "requestId": "r2", "method": "GET", "url": "/", "headers": {}
        }))
        .unwrap();
        assert_eq!(frame.decode_body().unwrap(), None);

        frame.body = Some(String::new());
        assert_eq!(frame.decode_body().unwrap(), None);

        frame.body = Some("not base64!".into());
        assert!(frame.decode_body().is_err());
    }

    #[test]
    fn test_unknown_kind_is_not_an_error() {
        let msg = BrokerMessage::parse(br#"{"type":"heartbeat","at":12}"#).unwrap();
        assert_eq!(msg, BrokerMessage::Unknown);
    }

    #[test]
    fn test_missing_method_and_url_default_to_get_root() {
        let msg = BrokerMessage::parse(br#"{"type":"http-request","requestId":"r3","headers":{}}"#)
            .unwrap();
        let BrokerMessage::HttpRequest(frame) = msg else {
            panic!("expected http-request");
        };

        assert_eq!(frame.request_id, "r3");
        assert_eq!(frame.method, "GET");
        assert_eq!(frame.path, "/");
    }

    #[test]
    fn test_malformed_request_fails_to_parse() {
        assert!(BrokerMessage::parse(br#"{"type":"http-request","method":"GET"}"#).is_err());
        assert!(BrokerMessage::parse(b"not json").is_err());
    }

    #[test]
    fn test_encode_response() {
        let mut headers = HeaderMap::new();
        headers.append("content-type", "application/json");
        headers.append("set-cookie", "a=1");
        headers.append("set-cookie", "b=2");
        let frame = OutboundResponseFrame {
            request_id: "r1".into(),
            status: 200,
            headers,
            body: br#"{"ok":true}"#.to_vec(),
        };

        let encoded = frame.into_message().encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "http-response",
                "requestId": "r1",
                "status": 200,
                "headers": { "content-type": "application/json", "set-cookie": ["a=1", "b=2"] },
                "body": "eyJvayI6dHJ1ZX0="
            })
        );
    }

    #[test]
    fn test_bad_gateway_frame() {
        let encoded = OutboundResponseFrame::bad_gateway("r9").into_message().encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!({ "type": "http-response", "requestId": "r9", "status": 502, "headers": {}, "body": "" })
        );
    }
}
