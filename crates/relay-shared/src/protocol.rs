//! Decrypted payload schema.
//!
//! The session layer decrypts an envelope and hands this crate the sender,
//! device, timestamp and a JSON payload.  The payload is a versioned object
//! describing the target thread (`threadId`, `distribution`) and a `data`
//! blob whose shape depends on `messageType`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{keys, BODY_TYPE_HTML, BODY_TYPE_PLAIN, CALL_PROTOCOL_LEVEL, PAYLOAD_VERSION};
use crate::error::PayloadError;
use crate::types::{RecipientId, ThreadType};

/// A decrypted inbound message as delivered by the session layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Sender recipient id
    pub source: RecipientId,
    /// Sender device id
    pub source_device: u32,
    /// Sender-assigned timestamp (ms)
    pub timestamp: u64,
    /// Time the message spent on the server before delivery (ms)
    #[serde(default)]
    pub server_age_ms: Option<u64>,
    /// Plaintext payload
    pub payload: Value,
    /// Attachment pointers already fetched by the transport
    #[serde(default)]
    pub attachments: Vec<AttachmentPointer>,
}

/// Metadata for an attachment delivered alongside an envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPointer {
    pub id: String,
    pub content_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Content,
    Poll,
    PollResponse,
    Control,
    Receipt,
}

impl MessageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "content" => Some(Self::Content),
            "poll" => Some(Self::Poll),
            "pollResponse" => Some(Self::PollResponse),
            "control" => Some(Self::Control),
            "receipt" => Some(Self::Receipt),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Top-level view of a decrypted payload.
#[derive(Debug, Clone)]
pub struct Payload {
    pub message_id: Option<String>,
    pub message_type: MessageType,
    pub sender_id: Option<RecipientId>,
    pub message_ref: Option<String>,
    pub data: Map<String, Value>,
    raw: Value,
}

impl Payload {
    pub fn parse(value: &Value) -> Result<Self, PayloadError> {
        let obj = value.as_object().ok_or(PayloadError::NotAnObject)?;

        let version = obj
            .get(keys::VERSION)
            .and_then(Value::as_u64)
            .ok_or(PayloadError::MissingField(keys::VERSION))?;
        if version != PAYLOAD_VERSION {
            return Err(PayloadError::UnsupportedVersion(version));
        }

        let type_str = str_field(obj, keys::MESSAGE_TYPE)
            .ok_or(PayloadError::MissingField(keys::MESSAGE_TYPE))?;
        let message_type = MessageType::parse(type_str)
            .ok_or_else(|| PayloadError::UnknownMessageType(type_str.to_string()))?;

        let sender_id = obj
            .get(keys::SENDER)
            .and_then(Value::as_object)
            .and_then(|s| str_field(s, keys::USER_ID))
            .map(RecipientId::from);

        let data = obj
            .get(keys::DATA)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            message_id: str_field(obj, keys::MESSAGE_ID).map(str::to_string),
            message_type,
            sender_id,
            message_ref: str_field(obj, keys::MESSAGE_REF).map(str::to_string),
            data,
            raw: value.clone(),
        })
    }

    /// The payload as received, used for thread resolution.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn thread(&self) -> Result<ThreadPayload, PayloadError> {
        ThreadPayload::parse(&self.raw)
    }

    /// Message text, preferring the plain-text body part over HTML.
    pub fn body_text(&self) -> Option<String> {
        let parts = self.data.get(keys::BODY)?.as_array()?;
        let find = |mime: &str| {
            parts.iter().find_map(|p| {
                let p = p.as_object()?;
                if str_field(p, keys::BODY_TYPE)? == mime {
                    str_field(p, keys::BODY_VALUE).map(str::to_string)
                } else {
                    None
                }
            })
        };
        find(BODY_TYPE_PLAIN).or_else(|| find(BODY_TYPE_HTML))
    }

    pub fn expiration_secs(&self) -> u32 {
        self.data
            .get(keys::EXPIRATION)
            .and_then(Value::as_u64)
            .map(|v| v.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    pub fn control_type(&self) -> Option<ControlType> {
        self.data
            .get(keys::CONTROL)
            .and_then(Value::as_str)
            .and_then(ControlType::parse)
    }

    pub fn control_name(&self) -> Option<&str> {
        self.data.get(keys::CONTROL).and_then(Value::as_str)
    }

    pub fn read_mark(&self) -> Option<u64> {
        self.data.get(keys::READ_MARK).and_then(Value::as_u64)
    }

    pub fn snooze_until(&self) -> Option<u64> {
        self.data.get(keys::SNOOZE_UNTIL).and_then(Value::as_u64)
    }

    /// `threadUpdates` blob of a thread update control message.
    pub fn thread_updates(&self) -> Option<ThreadUpdates> {
        let updates = self.data.get(keys::THREAD_UPDATES)?.as_object()?;
        Some(ThreadUpdates {
            title: str_field(updates, keys::THREAD_TITLE).map(str::to_string),
            expression: str_field(updates, keys::EXPRESSION).map(str::to_string),
        })
    }
}

/// Thread attributes carried by every payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPayload {
    pub thread_id: String,
    pub participant_ids: Vec<RecipientId>,
    pub title: Option<String>,
    pub thread_type: ThreadType,
    pub expression: Option<String>,
    pub pretty_expression: Option<String>,
}

impl ThreadPayload {
    /// Extract the thread description.  `threadId` and
    /// `distribution.userIds` are required; anything else is optional.
    pub fn parse(value: &Value) -> Result<Self, PayloadError> {
        let obj = value.as_object().ok_or(PayloadError::NotAnObject)?;

        let thread_id = str_field(obj, keys::THREAD_ID)
            .filter(|s| !s.is_empty())
            .ok_or(PayloadError::MissingField(keys::THREAD_ID))?;

        let distribution = obj
            .get(keys::DISTRIBUTION)
            .and_then(Value::as_object)
            .ok_or(PayloadError::MissingField(keys::DISTRIBUTION))?;

        let user_ids = distribution
            .get(keys::USER_IDS)
            .and_then(Value::as_array)
            .ok_or(PayloadError::MissingField(keys::USER_IDS))?;
        let mut participant_ids = Vec::with_capacity(user_ids.len());
        for id in user_ids {
            let id = id
                .as_str()
                .filter(|s| !s.is_empty())
                .ok_or(PayloadError::MissingField(keys::USER_IDS))?;
            participant_ids.push(RecipientId::from(id));
        }

        let thread_type = match str_field(obj, keys::THREAD_TYPE) {
            Some(t) => {
                ThreadType::parse(t).ok_or_else(|| PayloadError::UnknownThreadType(t.to_string()))?
            }
            None => ThreadType::Conversation,
        };

        Ok(Self {
            thread_id: thread_id.to_string(),
            participant_ids,
            title: str_field(obj, keys::THREAD_TITLE)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            thread_type,
            expression: str_field(distribution, keys::EXPRESSION).map(str::to_string),
            pretty_expression: str_field(distribution, keys::PRETTY).map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadUpdates {
    pub title: Option<String>,
    pub expression: Option<String>,
}

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    ThreadUpdate,
    ThreadClear,
    ThreadClose,
    ThreadArchive,
    ThreadRestore,
    ThreadDelete,
    Snooze,
    ReadMark,
    CallJoin,
    CallOffer,
    CallAcceptOffer,
    CallLeave,
    CallIceCandidates,
}

impl ControlType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "threadUpdate" => Some(Self::ThreadUpdate),
            "threadClear" => Some(Self::ThreadClear),
            "threadClose" => Some(Self::ThreadClose),
            "threadArchive" => Some(Self::ThreadArchive),
            "threadRestore" => Some(Self::ThreadRestore),
            "threadDelete" => Some(Self::ThreadDelete),
            "snooze" => Some(Self::Snooze),
            "readMark" => Some(Self::ReadMark),
            "callJoin" => Some(Self::CallJoin),
            "callOffer" => Some(Self::CallOffer),
            "callAcceptOffer" => Some(Self::CallAcceptOffer),
            "callLeave" => Some(Self::CallLeave),
            "callICECandidates" => Some(Self::CallIceCandidates),
            _ => None,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Self::CallJoin
                | Self::CallOffer
                | Self::CallAcceptOffer
                | Self::CallLeave
                | Self::CallIceCandidates
        )
    }
}

/// Conference call signaling extracted from a call control payload.
#[derive(Debug, Clone, PartialEq)]
pub enum CallSignal {
    Join {
        call_id: String,
        originator: RecipientId,
        members: Vec<RecipientId>,
    },
    Offer {
        call_id: String,
        peer_id: String,
        sdp: String,
    },
    AcceptOffer {
        call_id: String,
        peer_id: String,
        sdp: String,
    },
    IceCandidates {
        call_id: String,
        peer_id: String,
        candidates: Vec<Value>,
    },
    Leave {
        call_id: String,
    },
}

impl CallSignal {
    pub fn parse(control: ControlType, data: &Map<String, Value>) -> Result<Self, PayloadError> {
        let level = data
            .get(keys::VERSION)
            .and_then(Value::as_i64)
            .ok_or(PayloadError::MissingField(keys::VERSION))?;
        if level != CALL_PROTOCOL_LEVEL {
            return Err(PayloadError::CallProtocolMismatch {
                expected: CALL_PROTOCOL_LEVEL,
                got: level,
            });
        }

        let call_id = required_str(data, keys::CALL_ID)?;

        let signal = match control {
            ControlType::CallJoin => {
                let members = data
                    .get(keys::MEMBERS)
                    .and_then(Value::as_array)
                    .ok_or(PayloadError::MissingField(keys::MEMBERS))?
                    .iter()
                    .filter_map(Value::as_str)
                    .map(RecipientId::from)
                    .collect();
                Self::Join {
                    call_id,
                    originator: RecipientId::from(required_str(data, keys::ORIGINATOR)?),
                    members,
                }
            }
            ControlType::CallOffer => Self::Offer {
                call_id,
                peer_id: required_str(data, keys::PEER_ID)?,
                sdp: nested_sdp(data, keys::OFFER)?,
            },
            ControlType::CallAcceptOffer => Self::AcceptOffer {
                call_id,
                peer_id: required_str(data, keys::PEER_ID)?,
                sdp: nested_sdp(data, keys::ANSWER)?,
            },
            ControlType::CallIceCandidates => Self::IceCandidates {
                call_id,
                peer_id: required_str(data, keys::PEER_ID)?,
                candidates: data
                    .get(keys::ICE_CANDIDATES)
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or(PayloadError::MissingField(keys::ICE_CANDIDATES))?,
            },
            ControlType::CallLeave => Self::Leave { call_id },
            _ => return Err(PayloadError::MissingField(keys::CONTROL)),
        };
        Ok(signal)
    }

    pub fn call_id(&self) -> &str {
        match self {
            Self::Join { call_id, .. }
            | Self::Offer { call_id, .. }
            | Self::AcceptOffer { call_id, .. }
            | Self::IceCandidates { call_id, .. }
            | Self::Leave { call_id } => call_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn required_str(obj: &Map<String, Value>, key: &'static str) -> Result<String, PayloadError> {
    str_field(obj, key)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(PayloadError::MissingField(key))
}

fn nested_sdp(obj: &Map<String, Value>, key: &'static str) -> Result<String, PayloadError> {
    obj.get(key)
        .and_then(Value::as_object)
        .and_then(|o| str_field(o, keys::SDP))
        .map(str::to_string)
        .ok_or(PayloadError::MissingField(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content_payload() -> Value {
        json!({
            "version": 1,
            "messageId": "m-1",
            "messageType": "content",
            "threadId": "t-1",
            "threadTitle": "Ops",
            "threadType": "conversation",
            "distribution": {
                "expression": "(<a>+<b>)",
                "userIds": ["a", "b"]
            },
            "sender": { "userId": "a" },
            "data": {
                "body": [
                    { "type": "text/html", "value": "<b>hi</b>" },
                    { "type": "text/plain", "value": "hi" }
                ],
                "expiration": 30
            }
        })
    }

    #[test]
    fn parses_content_payload() {
        let payload = Payload::parse(&content_payload()).unwrap();
        assert_eq!(payload.message_type, MessageType::Content);
        assert_eq!(payload.message_id.as_deref(), Some("m-1"));
        assert_eq!(payload.sender_id, Some(RecipientId::from("a")));
        assert_eq!(payload.body_text().as_deref(), Some("hi"));
        assert_eq!(payload.expiration_secs(), 30);

        let thread = payload.thread().unwrap();
        assert_eq!(thread.thread_id, "t-1");
        assert_eq!(thread.participant_ids.len(), 2);
        assert_eq!(thread.title.as_deref(), Some("Ops"));
        assert_eq!(thread.expression.as_deref(), Some("(<a>+<b>)"));
    }

    #[test]
    fn thread_payload_requires_id_and_participants() {
        let missing_id = json!({ "distribution": { "userIds": ["a"] } });
        assert!(matches!(
            ThreadPayload::parse(&missing_id),
            Err(PayloadError::MissingField(keys::THREAD_ID))
        ));

        let missing_users = json!({ "threadId": "t", "distribution": {} });
        assert!(matches!(
            ThreadPayload::parse(&missing_users),
            Err(PayloadError::MissingField(keys::USER_IDS))
        ));

        let bad_user = json!({ "threadId": "t", "distribution": { "userIds": ["a", 7] } });
        assert!(ThreadPayload::parse(&bad_user).is_err());

        let bad_type = json!({
            "threadId": "t",
            "threadType": "broadcast",
            "distribution": { "userIds": ["a"] }
        });
        assert!(matches!(
            ThreadPayload::parse(&bad_type),
            Err(PayloadError::UnknownThreadType(_))
        ));
    }

    #[test]
    fn rejects_other_versions() {
        let mut v = content_payload();
        v["version"] = json!(2);
        assert!(matches!(Payload::parse(&v), Err(PayloadError::UnsupportedVersion(2))));
    }

    #[test]
    fn parses_call_offer() {
        let data = json!({
            "control": "callOffer",
            "version": 1,
            "callId": "c-1",
            "peerId": "p-1",
            "offer": { "sdp": "v=0" }
        });
        let data = data.as_object().unwrap();
        let signal = CallSignal::parse(ControlType::CallOffer, data).unwrap();
        assert_eq!(
            signal,
            CallSignal::Offer {
                call_id: "c-1".into(),
                peer_id: "p-1".into(),
                sdp: "v=0".into()
            }
        );
    }

    #[test]
    fn call_signal_checks_protocol_level() {
        let data = json!({ "version": 9, "callId": "c" });
        let err = CallSignal::parse(ControlType::CallLeave, data.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, PayloadError::CallProtocolMismatch { got: 9, .. }));
    }

    #[test]
    fn envelope_deserializes_from_json_line() {
        let line = r#"{"source":"a","sourceDevice":2,"timestamp":5,"payload":{}}"#;
        let env: Envelope = serde_json::from_str(line).unwrap();
        assert_eq!(env.source_device, 2);
        assert!(env.attachments.is_empty());
        assert_eq!(env.server_age_ms, None);
    }
}
