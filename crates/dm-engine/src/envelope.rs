//! Protocol envelope and response codes.
//!
//! Wire shape: `{"d": {...}, "reqId": "<token>"}` for requests and
//! notifications; responses also carry `"rc"` and optionally `"message"`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::codec::Codec;
use crate::error::{Error, Result};

/// Response codes carried in the `rc` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ResponseCode {
    Success,
    Accepted,
    UpdateSuccess,
    BadRequest,
    NotFound,
    InternalError,
    FunctionNotImplemented,
}

impl ResponseCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            ResponseCode::Success => 200,
            ResponseCode::Accepted => 202,
            ResponseCode::UpdateSuccess => 204,
            ResponseCode::BadRequest => 400,
            ResponseCode::NotFound => 404,
            ResponseCode::InternalError => 500,
            ResponseCode::FunctionNotImplemented => 501,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            200 => Some(ResponseCode::Success),
            202 => Some(ResponseCode::Accepted),
            204 => Some(ResponseCode::UpdateSuccess),
            400 => Some(ResponseCode::BadRequest),
            404 => Some(ResponseCode::NotFound),
            500 => Some(ResponseCode::InternalError),
            501 => Some(ResponseCode::FunctionNotImplemented),
            _ => None,
        }
    }

    /// 2xx codes.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.as_u16())
    }
}

impl From<ResponseCode> for u16 {
    fn from(rc: ResponseCode) -> Self {
        rc.as_u16()
    }
}

impl TryFrom<u16> for ResponseCode {
    type Error = String;

    fn try_from(code: u16) -> std::result::Result<Self, Self::Error> {
        ResponseCode::from_u16(code).ok_or_else(|| format!("unknown response code {}", code))
    }
}

/// Generate a fresh correlation token.
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// The unit of protocol exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Structured payload.
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Opaque correlation token, echoed by the responder.
    #[serde(rename = "reqId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Raw response code; unknown codes are kept as-is.
    #[serde(rename = "rc", default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,

    /// Human readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Envelope {
    /// Outbound request or notification with a fresh token.
    pub fn request(data: Option<Value>) -> Self {
        Self {
            data,
            request_id: Some(new_request_id()),
            ..Default::default()
        }
    }

    /// Response correlated with `request`.
    pub fn response_to(request: &Envelope, rc: ResponseCode) -> Self {
        Self::response(request.request_id.clone(), rc)
    }

    /// Response for an explicit token.
    pub fn response(request_id: Option<String>, rc: ResponseCode) -> Self {
        Self {
            data: None,
            request_id,
            response_code: Some(rc.as_u16()),
            message: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Typed response code, if present and known.
    pub fn rc(&self) -> Option<ResponseCode> {
        self.response_code.and_then(ResponseCode::from_u16)
    }

    /// `d` as a JSON object reference, when it is one.
    pub fn data_object(&self) -> Option<&serde_json::Map<String, Value>> {
        self.data.as_ref().and_then(Value::as_object)
    }

    /// Decode an envelope from raw bytes.
    pub fn decode(codec: &dyn Codec, bytes: &[u8]) -> Result<Self> {
        let value = codec.decode(bytes)?;
        Self::from_value(value)
    }

    /// Convert a decoded payload into an envelope.
    ///
    /// An empty payload is accepted as an envelope without data.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => serde_json::from_value(value).map_err(Error::from),
            other => Err(Error::Codec(format!(
                "envelope must be an object, got {}",
                kind_of(&other)
            ))),
        }
    }

    /// Best-effort extraction of the token from a payload that failed to decode.
    pub fn salvage_request_id(codec: &dyn Codec, bytes: &[u8]) -> Option<String> {
        codec
            .decode(bytes)
            .ok()?
            .get("reqId")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Encode with `codec`.
    pub fn encode(&self, codec: &dyn Codec) -> Result<Vec<u8>> {
        codec.encode(&serde_json::to_value(self)?)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde_json::json;

    #[test]
    fn test_response_wire_shape() {
        let request = Envelope {
            data: Some(json!({"fields": []})),
            request_id: Some("r1".into()),
            ..Default::default()
        };
        let response = Envelope::response_to(&request, ResponseCode::NotFound)
            .with_message("missing");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value, json!({"reqId": "r1", "rc": 404, "message": "missing"}));
    }

    #[test]
    fn test_decode_request() {
        let codec = JsonCodec;
        let env = Envelope::decode(&codec, br#"{"d":{"fields":[]},"reqId":"abc"}"#).unwrap();
        assert_eq!(env.request_id.as_deref(), Some("abc"));
        assert!(env.data_object().is_some());
        assert_eq!(env.rc(), None);
    }

    #[test]
    fn test_decode_rejects_non_object() {
        let codec = JsonCodec;
        assert!(Envelope::decode(&codec, b"[1,2]").is_err());
        assert!(Envelope::decode(&codec, b"not json").is_err());
        assert_eq!(
            Envelope::salvage_request_id(&codec, br#"{"reqId":"x","rc":"bad"}"#),
            Some("x".to_string())
        );
    }

    #[test]
    fn test_response_code_mapping() {
        assert_eq!(ResponseCode::from_u16(501), Some(ResponseCode::FunctionNotImplemented));
        assert_eq!(ResponseCode::from_u16(302), None);
        assert!(ResponseCode::UpdateSuccess.is_success());
        assert!(!ResponseCode::InternalError.is_success());
    }

    #[test]
    fn test_fresh_request_ids_differ() {
        let a = Envelope::request(None);
        let b = Envelope::request(None);
        assert_ne!(a.request_id, b.request_id);
    }
}
