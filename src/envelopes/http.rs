//! API Gateway proxy integration envelopes.

use super::EnvelopeError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// HTTP method enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
            Method::Patch => write!(f, "PATCH"),
            Method::Head => write!(f, "HEAD"),
            Method::Options => write!(f, "OPTIONS"),
        }
    }
}

/// HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);

    /// Check if the status code indicates success (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.0)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.0)
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::OK
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        StatusCode(code)
    }
}

/// API Gateway REST proxy request.
///
/// `body_content` is not part of the wire shape; [`parse_body`](Self::parse_body)
/// fills it from `body`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGatewayRequest<T = serde_json::Value> {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub http_method: Method,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub query_string_parameters: Option<HashMap<String, String>>,
    #[serde(default)]
    pub path_parameters: Option<HashMap<String, String>>,
    #[serde(default)]
    pub stage_variables: Option<HashMap<String, String>>,
    /// Authorizer, identity and stage data, kept untyped.
    #[serde(default)]
    pub request_context: Option<serde_json::Value>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub is_base64_encoded: bool,
    #[serde(skip, default = "Option::default")]
    pub body_content: Option<T>,
}

impl<T> ApiGatewayRequest<T> {
    /// Header value, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.as_ref().and_then(|headers| {
            headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        })
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query_string_parameters
            .as_ref()
            .and_then(|params| params.get(name))
            .map(String::as_str)
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_parameters
            .as_ref()
            .and_then(|params| params.get(name))
            .map(String::as_str)
    }

    /// Raw body, base64-decoded when flagged.
    pub fn body_bytes(&self) -> Result<Bytes, EnvelopeError> {
        let body = self.body.as_deref().ok_or(EnvelopeError::MissingBody)?;
        if self.is_base64_encoded {
            Ok(Bytes::from(STANDARD.decode(body)?))
        } else {
            Ok(Bytes::copy_from_slice(body.as_bytes()))
        }
    }

    /// Parse the body as JSON of any type.
    pub fn body_as<U: DeserializeOwned>(&self) -> Result<U, EnvelopeError> {
        Ok(serde_json::from_slice(&self.body_bytes()?)?)
    }
}

impl<T: DeserializeOwned> ApiGatewayRequest<T> {
    /// Parse the body into `body_content` and return it.
    pub fn parse_body(&mut self) -> Result<&T, EnvelopeError> {
        let content = self.body_as::<T>()?;
        Ok(self.body_content.insert(content))
    }
}

/// API Gateway REST proxy response.
///
/// Set `body_content` and call [`pack_body`](Self::pack_body), or build one
/// directly with [`json`](Self::json).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGatewayResponse<T = serde_json::Value> {
    pub status_code: StatusCode,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub is_base64_encoded: bool,
    #[serde(skip, default = "Option::default")]
    pub body_content: Option<T>,
}

impl<T> ApiGatewayResponse<T> {
    /// Create a response with the given status and no body.
    pub fn new(status: impl Into<StatusCode>) -> Self {
        Self {
            status_code: status.into(),
            headers: HashMap::new(),
            body: None,
            is_base64_encoded: false,
            body_content: None,
        }
    }

    /// Create a text response.
    pub fn text(status: impl Into<StatusCode>, content: impl Into<String>) -> Self {
        let mut response = Self::new(status).header("Content-Type", "text/plain");
        response.body = Some(content.into());
        response
    }

    /// Create a binary response; the body is base64-encoded on the wire.
    pub fn binary(status: impl Into<StatusCode>, content: impl AsRef<[u8]>, content_type: &str) -> Self {
        let mut response = Self::new(status).header("Content-Type", content_type);
        response.body = Some(STANDARD.encode(content));
        response.is_base64_encoded = true;
        response
    }

    /// Add a header to the response.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

impl<T: Serialize> ApiGatewayResponse<T> {
    /// Create a JSON response from a typed body.
    pub fn json(status: impl Into<StatusCode>, content: T) -> Result<Self, EnvelopeError> {
        let mut response = Self::new(status).header("Content-Type", "application/json");
        response.body_content = Some(content);
        response.pack_body()?;
        Ok(response)
    }

    /// Serialize `body_content` into `body`. A missing content leaves `body` untouched.
    pub fn pack_body(&mut self) -> Result<(), EnvelopeError> {
        if let Some(content) = &self.body_content {
            self.body = Some(serde_json::to_string(content)?);
            self.is_base64_encoded = false;
        }
        Ok(())
    }
}
