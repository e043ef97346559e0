//! SQS trigger envelopes and partial batch responses.

use super::EnvelopeError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Batch of SQS messages delivered to one invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqsEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<SqsMessage>,
}

impl SqsEvent {
    /// Parse every message body, keeping failures next to their message ID.
    pub fn bodies<T: DeserializeOwned>(&self) -> Vec<(&str, Result<T, EnvelopeError>)> {
        self.records
            .iter()
            .map(|message| (message.message_id.as_str(), message.body_as::<T>()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqsMessage {
    pub message_id: String,
    #[serde(default)]
    pub receipt_handle: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub md5_of_body: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub message_attributes: HashMap<String, SqsMessageAttribute>,
    #[serde(default)]
    pub event_source: Option<String>,
    #[serde(rename = "eventSourceARN", default)]
    pub event_source_arn: Option<String>,
    #[serde(default)]
    pub aws_region: Option<String>,
}

impl SqsMessage {
    /// Parse the body as JSON.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        let body = self.body.as_deref().ok_or(EnvelopeError::MissingBody)?;
        Ok(serde_json::from_str(body)?)
    }

    /// String value of a message attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.message_attributes
            .get(name)
            .and_then(|attr| attr.string_value.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqsMessageAttribute {
    #[serde(default)]
    pub string_value: Option<String>,
    #[serde(default)]
    pub binary_value: Option<String>,
    #[serde(default)]
    pub data_type: String,
}

/// Partial batch response: only the listed messages are retried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqsBatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl SqsBatchResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a message as failed.
    pub fn fail(&mut self, message_id: impl Into<String>) -> &mut Self {
        self.batch_item_failures.push(BatchItemFailure {
            item_identifier: message_id.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.batch_item_failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}
