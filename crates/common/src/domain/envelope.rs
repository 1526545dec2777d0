use crate::domain::result::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// API version every envelope must carry
pub const API_VERSION: &str = "v3";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

pub const ERROR_CODE_OK: i32 = 0;
pub const ERROR_CODE_FAILED: i32 = 1;

/// Canonical wrapper for every message crossing the internal bus or the external broker.
///
/// `received_topic` is stamped by the bus on receipt; senders leave it empty.
/// An envelope with `error_code == 1` carries a human readable message as payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,

    #[serde(rename = "receivedTopic", default)]
    pub received_topic: String,

    #[serde(rename = "correlationID", default)]
    pub correlation_id: String,

    #[serde(rename = "requestID", default)]
    pub request_id: String,

    #[serde(rename = "errorCode", default)]
    pub error_code: i32,

    #[serde(default, with = "payload_base64")]
    pub payload: Vec<u8>,

    #[serde(rename = "contentType", default)]
    pub content_type: String,

    #[serde(
        rename = "queryParams",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub query_params: HashMap<String, String>,
}

impl MessageEnvelope {
    /// New request envelope with fresh request and correlation ids
    pub fn for_request(payload: Vec<u8>, query_params: HashMap<String, String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            received_topic: String::new(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            error_code: ERROR_CODE_OK,
            payload,
            content_type: CONTENT_TYPE_JSON.to_string(),
            query_params,
        }
    }

    /// Successful response bearing the ids of the request it answers
    pub fn for_response(
        payload: Vec<u8>,
        request_id: &str,
        correlation_id: &str,
        content_type: &str,
    ) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            received_topic: String::new(),
            correlation_id: correlation_id.to_string(),
            request_id: request_id.to_string(),
            error_code: ERROR_CODE_OK,
            payload,
            content_type: content_type.to_string(),
            query_params: HashMap::new(),
        }
    }

    /// Error response: `error_code = 1` and the message as a text payload
    pub fn with_error(request_id: &str, correlation_id: &str, message: impl Into<String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            received_topic: String::new(),
            correlation_id: correlation_id.to_string(),
            request_id: request_id.to_string(),
            error_code: ERROR_CODE_FAILED,
            payload: message.into().into_bytes(),
            content_type: CONTENT_TYPE_TEXT.to_string(),
            query_params: HashMap::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code == ERROR_CODE_FAILED
    }

    /// True when the request id is missing or whitespace only
    pub fn has_request_id(&self) -> bool {
        !self.request_id.trim().is_empty()
    }

    /// Payload interpreted as text, used for error envelopes and logs
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Decode an envelope from its JSON wire form.
    ///
    /// Rejects envelopes whose api version differs from [`API_VERSION`].
    /// A missing correlation id is replaced with a fresh one.
    pub fn decode(bytes: &[u8]) -> DomainResult<Self> {
        let mut envelope: MessageEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| DomainError::EnvelopeDecode(e.to_string()))?;

        if envelope.api_version != API_VERSION {
            return Err(DomainError::EnvelopeDecode(format!(
                "api version '{}' is required, got '{}'",
                API_VERSION, envelope.api_version
            )));
        }

        if envelope.correlation_id.trim().is_empty() {
            envelope.correlation_id = uuid::Uuid::new_v4().to_string();
        }

        Ok(envelope)
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> DomainResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| DomainError::Serialization(e.to_string()))
    }
}

/// Payload bytes travel as a base64 string; `null` decodes to an empty payload.
mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
