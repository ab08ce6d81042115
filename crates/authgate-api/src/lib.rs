//! Platform-neutral request/response model shared by both invocation modes.
//!
//! The JSON shapes match a "method request passthrough" mapping template:
//! a request is `{"body-json", "params", "stage-variables", "context"}` and a
//! response is `{"status", "header", "body-json"}`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub type StageVariables = BTreeMap<String, String>;
pub type ParamMap = BTreeMap<String, String>;

pub const STAGE_JWT_PUBLIC_KEY: &str = "JWTPublicKey";
pub const STAGE_JWT_PRIVATE_KEY: &str = "JWTPrivateKey";
pub const STAGE_DB_USER: &str = "DBUser";
pub const STAGE_DB_PASS: &str = "DBPass";
pub const STAGE_DB_HOST: &str = "DBHost";
pub const STAGE_DB_PORT: &str = "DBPort";
pub const STAGE_DB_NAME: &str = "DBName";

/// HTTP status codes the gateway produces.
pub mod status {
    pub const OK: u16 = 200;
    pub const UNAUTHORIZED: u16 = 401;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestParams {
    #[serde(default, deserialize_with = "null_as_default")]
    pub path: ParamMap,
    #[serde(rename = "querystring", default, deserialize_with = "null_as_default")]
    pub query: ParamMap,
    #[serde(default, deserialize_with = "null_as_default")]
    pub header: ParamMap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Lowercase HTTP verb.
    #[serde(rename = "http-method", default)]
    pub method: String,
    /// The path template the request matched, not the concrete path.
    #[serde(rename = "resource-path", default)]
    pub path: String,
    #[serde(default)]
    pub stage: String,
    #[serde(rename = "source-ip", default)]
    pub source_ip: String,
}

/// An inbound API call, independent of how it arrived.
///
/// Every parameter map holds exactly one value per key. Adapters collapse
/// multi-valued inputs before building the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    /// Raw JSON text of the request body, never parsed implicitly.
    #[serde(rename = "body-json", default, with = "raw_body")]
    pub body: Vec<u8>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub params: RequestParams,
    #[serde(
        rename = "stage-variables",
        default,
        deserialize_with = "null_as_default"
    )]
    pub stage_variables: StageVariables,
    #[serde(default, deserialize_with = "null_as_default")]
    pub context: RequestContext,
}

impl CanonicalRequest {
    pub fn from_json(bytes: &[u8]) -> Result<Self, GatewayError> {
        serde_json::from_slice(bytes)
            .map_err(|e| GatewayError::Decode(format!("failed to deserialise request: {e}")))
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.params.path.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.params.query.get(name).map(String::as_str)
    }

    /// Header lookup ignoring ASCII case, so callers need not care how the
    /// hosting platform spelled the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        if let Some(v) = self.params.header.get(name) {
            return Some(v);
        }
        self.params
            .header
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The result of an API call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub status: u16,
    /// Always serialised as an object, never `null`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub header: BTreeMap<String, String>,
    #[serde(rename = "body-json", default)]
    pub body: Option<Value>,
}

impl CanonicalResponse {
    pub fn new(status: u16, body: impl Into<Value>) -> Self {
        Self {
            status,
            header: BTreeMap::new(),
            body: Some(body.into()),
        }
    }

    /// A response whose payload is `{"err": message}`.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let mut payload = serde_json::Map::new();
        payload.insert("err".to_string(), Value::String(message.into()));
        Self::new(status, Value::Object(payload))
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(name.into(), value.into());
        self
    }

    pub fn to_json(&self) -> Result<Vec<u8>, GatewayError> {
        serde_json::to_vec(self).map_err(|e| {
            GatewayError::Serialization(format!("failed to serialise response: {e}"))
        })
    }

    /// Encode only the body payload, as written to an HTTP response stream.
    pub fn body_json(&self) -> Result<Vec<u8>, GatewayError> {
        serde_json::to_vec(&self.body).map_err(|e| {
            GatewayError::Serialization(format!("failed to serialise response body: {e}"))
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("key material error: {0}")]
    KeyMaterial(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Fatal errors mean the process must stop serving.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::KeyMaterial(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialCheck {
    /// A matching row exists.
    Accepted,
    /// No matching row.
    Rejected,
}

/// The external credential collaborator.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn check(
        &self,
        stage: &StageVariables,
        username: &str,
        password: &str,
    ) -> Result<CredentialCheck, GatewayError>;
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

mod raw_body {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::value::RawValue;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<Box<RawValue>> = Option::deserialize(deserializer)?;
        Ok(raw.map(|r| r.get().as_bytes().to_vec()).unwrap_or_default())
    }

    pub fn serialize<S>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if body.is_empty() {
            return serializer.serialize_none();
        }
        let raw = std::str::from_utf8(body)
            .ok()
            .and_then(|text| RawValue::from_string(text.to_owned()).ok());
        match raw {
            Some(raw) => raw.serialize(serializer),
            // Non-JSON bodies (plain HTTP posts) travel as a JSON string.
            None => serializer.serialize_str(&String::from_utf8_lossy(body)),
        }
    }
}
