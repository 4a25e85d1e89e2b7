//! Parsing of audit notification payloads into webhook events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Audit action emitted when an entity gets a new version.
pub const ACTION_ENTITY_UPDATE: &str = "entity.update.version";
/// Audit action emitted when a submission is created.
pub const ACTION_SUBMISSION_CREATE: &str = "submission.create";
/// Audit action emitted when a submission is updated (reviewed).
pub const ACTION_SUBMISSION_UPDATE: &str = "submission.update";

/// An audit log row as published by the notify trigger.
#[derive(Debug, Deserialize)]
pub struct AuditLog {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub action: String,
    #[serde(default, rename = "acteeId")]
    pub actee_id: Option<String>,
    #[serde(default, rename = "actorId")]
    pub actor_id: Option<i64>,
    /// Shape depends on the action; parsed per action in [`parse_event`].
    #[serde(default)]
    pub details: Value,
    /// Enrichment added by the trigger: entity data, wrapped submission XML
    /// or the submission details.
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
struct EntityRef {
    // Kept as a string, the value may be 'uuid:xxx-xxx'.
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct EntityDetails {
    entity: EntityRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionDetails {
    instance_id: String,
}

/// The event shape posted to webhook endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    /// The audit action the event came from.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Entity UUID or submission instance id.
    pub id: String,
    /// Entity data, wrapped submission XML or review details.
    pub data: Value,
}

/// Errors from turning a notification payload into a [`ProcessedEvent`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The notification carried no payload at all.
    #[error("empty notification payload")]
    EmptyPayload,
    /// The payload was not valid JSON for an audit log.
    #[error("invalid audit payload: {0}")]
    Json(#[from] serde_json::Error),
    /// The audit action has no webhook mapping.
    #[error("unsupported action '{0}'")]
    UnsupportedAction(String),
    /// The details field did not have the shape the action requires.
    #[error("malformed details for '{action}': {source}")]
    MalformedDetails {
        action: String,
        #[source]
        source: serde_json::Error,
    },
    /// A submission.create notification without a data object.
    #[error("submission.create carried no data object")]
    InvalidData,
}

/// Deserializes a raw notification payload into an [`AuditLog`].
pub fn parse_audit_log(payload: &[u8]) -> Result<AuditLog, ParseError> {
    if payload.is_empty() {
        return Err(ParseError::EmptyPayload);
    }
    Ok(serde_json::from_slice(payload)?)
}

fn parse_details<T: serde::de::DeserializeOwned>(log: &AuditLog) -> Result<T, ParseError> {
    serde_json::from_value(log.details.clone()).map_err(|source| ParseError::MalformedDetails {
        action: log.action.clone(),
        source,
    })
}

/// Parses a notification payload and extracts the event to forward.
pub fn parse_event(payload: &[u8]) -> Result<ProcessedEvent, ParseError> {
    let audit = parse_audit_log(payload)?;

    match audit.action.as_str() {
        ACTION_ENTITY_UPDATE => {
            let details: EntityDetails = parse_details(&audit)?;
            Ok(ProcessedEvent {
                event_type: audit.action,
                id: details.entity.uuid,
                data: audit.data,
            })
        }
        ACTION_SUBMISSION_CREATE => {
            let details: SubmissionDetails = parse_details(&audit)?;
            if !audit.data.is_object() {
                return Err(ParseError::InvalidData);
            }
            Ok(ProcessedEvent {
                event_type: audit.action,
                id: details.instance_id,
                data: audit.data,
            })
        }
        ACTION_SUBMISSION_UPDATE => {
            let details: SubmissionDetails = parse_details(&audit)?;
            Ok(ProcessedEvent {
                event_type: audit.action,
                id: details.instance_id,
                data: audit.data,
            })
        }
        other => Err(ParseError::UnsupportedAction(other.to_string())),
    }
}
