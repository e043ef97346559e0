//! Event envelopes for common Lambda triggers.
//!
//! Each envelope mirrors the platform's JSON shape and extracts or packs a
//! typed payload from the string body it carries. Use them as the event and
//! response types of [`use_json`](crate::pipeline::InvocationBuilder::use_json).

pub mod http;
pub mod sqs;

use thiserror::Error;

/// Failure extracting or packing an envelope body.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope has no body")]
    MissingBody,

    #[error("invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

pub use http::{ApiGatewayRequest, ApiGatewayResponse, Method, StatusCode};
pub use sqs::{BatchItemFailure, SqsBatchResponse, SqsEvent, SqsMessage, SqsMessageAttribute};
