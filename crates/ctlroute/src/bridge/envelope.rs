//! Message envelope for the control channel.
//!
//! Every frame carries exactly one envelope:
//!
//! ```json
//! {"id":"42","type":"request","category":"system","action":"ping"}
//! ```
//!
//! Decoding is two-phase. [`Envelope::from_document`] extracts only the fixed
//! fields (`id`, `type`, `category`, `action`) and keeps `payload` as raw JSON.
//! Handlers decode the payload into their own types with
//! [`Envelope::payload_as`] once the route is known.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// Whether a message expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    /// One-way notification, never answered.
    Event,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            "event" => Some(Self::Event),
            _ => None,
        }
    }

    pub fn expects_reply(&self) -> bool {
        matches!(self, Self::Request)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to turn bytes into an [`Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Not JSON, or JSON that is not an object. Nothing can be salvaged.
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    /// A required fixed field is absent.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// A fixed field is present with the wrong shape.
    #[error("field '{field}' {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl DecodeError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// The unit of exchange on the control channel.
///
/// A well-formed envelope never holds `Some(Value::Null)` as its payload; the
/// constructors normalise it away so that encoding omits the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub kind: MessageType,

    pub category: String,

    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn request(
        id: impl Into<String>,
        category: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            kind: MessageType::Request,
            category: category.into(),
            action: action.into(),
            payload: None,
            error: None,
        }
    }

    pub fn event(category: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: MessageType::Event,
            category: category.into(),
            action: action.into(),
            payload: None,
            error: None,
        }
    }

    /// Attach a payload. `null` clears it.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Null => None,
            other => Some(other),
        };
        self
    }

    /// Successful reply correlated to `request`.
    ///
    /// A `null` result becomes an empty object so the response always carries
    /// a payload.
    pub fn response_to(request: &Envelope, payload: Value) -> Self {
        let payload = match payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Self {
            id: request.id.clone(),
            kind: MessageType::Response,
            category: request.category.clone(),
            action: request.action.clone(),
            payload: Some(payload),
            error: None,
        }
    }

    /// Failed reply correlated to `request`.
    pub fn error_response_to(request: &Envelope, error: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            kind: MessageType::Response,
            category: request.category.clone(),
            action: request.action.clone(),
            payload: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Decode the payload into an action-specific type.
    ///
    /// An absent payload is presented as `{}`, so payload types whose fields
    /// are all optional accept it.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.payload {
            Some(value) => T::deserialize(value),
            None => serde_json::from_value(Value::Object(Map::new())),
        }
    }

    /// Extract the fixed fields from an already-parsed JSON document.
    ///
    /// Unknown keys are ignored.
    pub fn from_document(document: &Value) -> Result<Self, DecodeError> {
        let Some(fields) = document.as_object() else {
            return Err(DecodeError::MalformedJson(
                "expected a JSON object".to_string(),
            ));
        };

        let kind = required_str(fields, "type")?;
        let kind = MessageType::parse(kind).ok_or_else(|| {
            DecodeError::invalid(
                "type",
                format!("must be request, response or event (got '{kind}')"),
            )
        })?;
        let category = required_str(fields, "category")?.to_string();
        let action = required_str(fields, "action")?.to_string();

        let id = optional_str(fields, "id")?.map(str::to_string);
        let error = optional_str(fields, "error")?.map(str::to_string);
        let payload = match fields.get("payload") {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.clone()),
        };

        Ok(Self {
            id,
            kind,
            category,
            action,
            payload,
            error,
        })
    }

    /// Serialize to compact JSON.
    pub fn encode(&self) -> Vec<u8> {
        // Only strings and `serde_json::Value` are serialized, neither of
        // which can fail.
        serde_json::to_vec(self).expect("envelope serialization is infallible")
    }
}

/// Parse raw bytes into a JSON document without interpreting it.
pub fn parse_document(bytes: &[u8]) -> Result<Value, DecodeError> {
    serde_json::from_slice(bytes).map_err(|e| DecodeError::MalformedJson(e.to_string()))
}

/// Decode raw bytes into an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let document = parse_document(bytes)?;
    Envelope::from_document(&document)
}

/// Encode an envelope into raw bytes.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    envelope.encode()
}

fn required_str<'a>(
    fields: &'a Map<String, Value>,
    name: &'static str,
) -> Result<&'a str, DecodeError> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(name)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(DecodeError::invalid(name, "must be a string")),
    }
}

fn optional_str<'a>(
    fields: &'a Map<String, Value>,
    name: &'static str,
) -> Result<Option<&'a str>, DecodeError> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(DecodeError::invalid(name, "must be a string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_minimal_request() {
        let env = decode(br#"{"id":"42","type":"request","category":"system","action":"ping"}"#)
            .unwrap();
        assert_eq!(env.id.as_deref(), Some("42"));
        assert_eq!(env.kind, MessageType::Request);
        assert_eq!(env.category, "system");
        assert_eq!(env.action, "ping");
        assert!(env.payload.is_none());
        assert!(env.error.is_none());
    }

    #[test]
    fn decodes_event_without_id() {
        let env = decode(br#"{"type":"event","category":"system","action":"ready"}"#).unwrap();
        assert_eq!(env.kind, MessageType::Event);
        assert!(env.id.is_none());
    }

    #[test]
    fn ignores_unknown_fields() {
        let env = decode(
            br#"{"type":"event","category":"system","action":"ready","version":3,"extra":{"a":1}}"#,
        )
        .unwrap();
        assert_eq!(env.action, "ready");
    }

    #[test]
    fn rejects_invalid_json() {
        let err = decode(br#"{"id":"1","type":"req"#).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedJson(_)));
    }

    #[test]
    fn rejects_non_object_document() {
        let err = decode(b"[1,2,3]").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedJson(_)));
    }

    #[test]
    fn reports_each_missing_fixed_field() {
        let cases = [
            (json!({"category": "system", "action": "ping"}), "type"),
            (json!({"type": "request", "action": "ping"}), "category"),
            (json!({"type": "request", "category": "system"}), "action"),
        ];
        for (doc, field) in cases {
            match Envelope::from_document(&doc) {
                Err(DecodeError::MissingField(name)) => assert_eq!(name, field),
                other => panic!("expected missing {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_unknown_message_type() {
        let doc = json!({"id": "1", "type": "query", "category": "system", "action": "ping"});
        let err = Envelope::from_document(&doc).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { field: "type", .. }));
    }

    #[test]
    fn rejects_non_string_id() {
        let doc = json!({"id": 7, "type": "request", "category": "system", "action": "ping"});
        let err = Envelope::from_document(&doc).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { field: "id", .. }));
    }

    #[test]
    fn encodes_spec_request_exactly() {
        let env = Envelope::request("42", "system", "ping");
        assert_eq!(
            String::from_utf8(env.encode()).unwrap(),
            r#"{"id":"42","type":"request","category":"system","action":"ping"}"#
        );
    }

    #[test]
    fn encoding_omits_absent_fields() {
        let env = Envelope::event("system", "ready");
        let text = String::from_utf8(encode(&env)).unwrap();
        assert_eq!(text, r#"{"type":"event","category":"system","action":"ready"}"#);
        assert!(!text.contains("null"));
    }

    #[test]
    fn response_shape() {
        let req = Envelope::request("42", "system", "ping");
        let resp = Envelope::response_to(&req, json!({"timestamp": 1730000000}));
        insta::assert_json_snapshot!(resp, @r#"
        {
          "id": "42",
          "type": "response",
          "category": "system",
          "action": "ping",
          "payload": {
            "timestamp": 1730000000
          }
        }
        "#);
    }

    #[test]
    fn null_result_becomes_empty_payload() {
        let req = Envelope::request("1", "power", "allow_sleep");
        let resp = Envelope::response_to(&req, Value::Null);
        assert_eq!(resp.payload, Some(json!({})));
    }

    #[test]
    fn error_response_preserves_route() {
        let req = Envelope::request("42", "system", "ping");
        let resp = Envelope::error_response_to(&req, "Failed to process ping: boom");
        assert_eq!(
            String::from_utf8(resp.encode()).unwrap(),
            r#"{"id":"42","type":"response","category":"system","action":"ping","error":"Failed to process ping: boom"}"#
        );
    }

    #[test]
    fn round_trip_preserves_envelopes() {
        let req = Envelope::request("a-1", "worktree", "list")
            .with_payload(json!({"repo": "/src/app", "depth": 2}));
        let samples = vec![
            req.clone(),
            Envelope::event("system", "ready"),
            Envelope::event("power", "sessions").with_payload(json!({"count": 3})),
            Envelope::response_to(&req, json!(["main", "feature"])),
            Envelope::error_response_to(&req, "repository not found"),
        ];
        for env in samples {
            assert_eq!(decode(&env.encode()).unwrap(), env);
        }
    }

    #[test]
    fn with_payload_null_clears() {
        let env = Envelope::event("system", "ready").with_payload(Value::Null);
        assert!(env.payload.is_none());
    }

    #[test]
    fn payload_as_defaults_absent_payload_to_empty_object() {
        #[derive(Deserialize)]
        struct Optional {
            #[serde(default)]
            timestamp: Option<f64>,
        }

        let env = Envelope::request("1", "system", "ping");
        let decoded: Optional = env.payload_as().unwrap();
        assert!(decoded.timestamp.is_none());

        let env = env.with_payload(json!({"timestamp": 12.5}));
        let decoded: Optional = env.payload_as().unwrap();
        assert_eq!(decoded.timestamp, Some(12.5));
    }

    #[test]
    fn message_type_helpers() {
        assert!(MessageType::Request.expects_reply());
        assert!(!MessageType::Event.expects_reply());
        assert!(!MessageType::Response.expects_reply());
        assert_eq!(MessageType::parse("event"), Some(MessageType::Event));
        assert_eq!(MessageType::parse("EVENT"), None);
        assert_eq!(MessageType::Response.to_string(), "response");
    }
}
