use base64::Engine as _;
use http::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

pub const MASK_MARKER: &str = "*****";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferEncoding {
    Json,
    Base64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventRequest {
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub uri: String,
    pub verb: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub ip_address: String,
    pub headers: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    pub transfer_encoding: TransferEncoding,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventResponse {
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub status: u16,
    pub headers: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    pub transfer_encoding: TransferEncoding,
}

/// One fully-assembled observation handed to the delivery sink. Batching,
/// retry and the wire transport are the sink's problem.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventRecord {
    pub request: EventRequest,
    pub response: EventResponse,
    pub session_token: Option<String>,
    pub user_id: Option<String>,
    pub company_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub direction: Direction,
    pub weight: i32,
}

/// Mask every value whose key appears in the mask list, at any depth,
/// returning a new value. Arrays are descended, scalars pass through.
pub fn mask_value(value: &Value, masks: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    if masks.iter().any(|mask| mask == key) {
                        (key.clone(), Value::String(MASK_MARKER.to_string()))
                    } else {
                        (key.clone(), mask_value(inner, masks))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| mask_value(item, masks)).collect())
        }
        other => other.clone(),
    }
}

/// Render headers as a JSON object with masked entries replaced by the
/// mask marker. Header names compare case-insensitively against the mask
/// list.
pub fn headers_to_value(headers: &HeaderMap, masks: &[String]) -> Value {
    let mut map = serde_json::Map::new();
    for name in headers.keys() {
        let masked = masks.iter().any(|mask| mask.eq_ignore_ascii_case(name.as_str()));
        let rendered = if masked {
            Value::String(MASK_MARKER.to_string())
        } else {
            let joined = headers
                .get_all(name)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect::<Vec<_>>()
                .join(", ");
            Value::String(joined)
        };
        map.insert(name.as_str().to_string(), rendered);
    }
    Value::Object(map)
}

/// Capture a body for reporting: JSON bodies are parsed and masked,
/// anything else ships base64-encoded.
pub fn capture_body(body: &[u8], masks: &[String]) -> (Option<Value>, TransferEncoding) {
    if body.is_empty() {
        return (None, TransferEncoding::Json);
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => (Some(mask_value(&value, masks)), TransferEncoding::Json),
        Err(_) => (
            Some(Value::String(
                base64::engine::general_purpose::STANDARD.encode(body),
            )),
            TransferEncoding::Base64,
        ),
    }
}
