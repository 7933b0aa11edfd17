//! Wire Envelope
//!
//! The unit exchanged over the channel. The JSON encoding is bit-exact with
//! the message server's existing wire format: field names (`type`,
//! `fromUserId`, `toUserId`, `groupId`, `content`, `timestamp`) and the type
//! tag strings must be preserved verbatim. Absent optional fields are omitted
//! from the JSON, never serialized as null.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Envelope type tag. Serialized as the server's enum strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Presence announcement, sent exactly once per successful connection.
    #[serde(rename = "CONNECT")]
    Connect,
    /// Direct user-to-user message. Requires a recipient user id.
    #[serde(rename = "PRIVATE_MSG")]
    PrivateMsg,
    /// Message to a group. Requires a group id.
    #[serde(rename = "GROUP_MSG")]
    GroupMsg,
    /// Server-originated notice. No required recipient.
    #[serde(rename = "SYSTEM_MSG")]
    SystemMsg,
    /// Liveness probe, no payload.
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
}

/// One discrete unit of data exchanged over the channel.
///
/// Recipient fields are mutually exclusive: a private message carries
/// `to_user_id` and no `group_id`, a group message the converse. A user id
/// of 0 is treated as absent and fails validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Sender identity. Server-originated notices may omit it on the wire.
    #[serde(default)]
    pub from_user_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Sender-local send time, milliseconds.
    pub timestamp: i64,
}

impl Envelope {
    /// Presence announcement for `from_user_id`. Carries only the identity.
    pub fn connect(from_user_id: u64) -> Self {
        Self {
            kind: EnvelopeKind::Connect,
            from_user_id,
            to_user_id: None,
            group_id: None,
            content: None,
            timestamp: now_millis(),
        }
    }

    /// Direct message to a single user.
    pub fn private(from_user_id: u64, to_user_id: u64, content: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::PrivateMsg,
            from_user_id,
            to_user_id: Some(to_user_id),
            group_id: None,
            content: Some(content.into()),
            timestamp: now_millis(),
        }
    }

    /// Message to a group.
    pub fn group(from_user_id: u64, group_id: u64, content: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::GroupMsg,
            from_user_id,
            to_user_id: None,
            group_id: Some(group_id),
            content: Some(content.into()),
            timestamp: now_millis(),
        }
    }

    /// Liveness probe.
    pub fn heartbeat(from_user_id: u64) -> Self {
        Self {
            kind: EnvelopeKind::Heartbeat,
            from_user_id,
            to_user_id: None,
            group_id: None,
            content: None,
            timestamp: now_millis(),
        }
    }

    /// Structural validation, applied to every outbound envelope regardless
    /// of connection state. Envelopes failing validation are never queued
    /// or transmitted.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.from_user_id == 0 {
            return Err(ChannelError::Validation(
                "missing or invalid fromUserId".into(),
            ));
        }
        match self.kind {
            EnvelopeKind::PrivateMsg => {
                if !matches!(self.to_user_id, Some(id) if id != 0) {
                    return Err(ChannelError::Validation(
                        "private message requires a toUserId".into(),
                    ));
                }
                if self.group_id.is_some() {
                    return Err(ChannelError::Validation(
                        "private message must not carry a groupId".into(),
                    ));
                }
            }
            EnvelopeKind::GroupMsg => {
                if !matches!(self.group_id, Some(id) if id != 0) {
                    return Err(ChannelError::Validation(
                        "group message requires a groupId".into(),
                    ));
                }
                if self.to_user_id.is_some() {
                    return Err(ChannelError::Validation(
                        "group message must not carry a toUserId".into(),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
