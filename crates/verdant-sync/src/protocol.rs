//! Push channel wire protocol.
//!
//! Frames are JSON text messages. The client sends control messages
//! (`auth`, `subscribe:<topic>`, `unsubscribe:<topic>`); the server answers
//! the handshake with `auth:ok`/`auth:error` and then pushes events.

use std::borrow::Cow;

use serde::{Deserialize, Serialize, Serializer};

use crate::event::{Event, EventError};
use crate::topic::Topic;

/// Control message sent from client to server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Identity handshake, sent once per epoch before anything else.
    Auth { user_id: String, token: String },
    /// Start receiving events for a topic.
    Subscribe {
        topic: Topic,
        params: Option<serde_json::Value>,
    },
    /// Stop receiving events for a topic.
    Unsubscribe { topic: Topic },
}

/// Wire shape of a control message. The topic is part of the `type`
/// (`subscribe:plant:p1`), so the variant cannot be a fixed serde tag.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage<'a> {
    #[serde(rename = "type")]
    kind: Cow<'a, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Cow<'a, serde_json::Value>>,
}

impl<'a> From<&'a ClientMessage> for RawMessage<'a> {
    fn from(msg: &'a ClientMessage) -> Self {
        match msg {
            ClientMessage::Auth { user_id, token } => RawMessage {
                kind: Cow::Borrowed("auth"),
                user_id: Some(user_id.as_str()),
                token: Some(token.as_str()),
                params: None,
            },
            ClientMessage::Subscribe { topic, params } => RawMessage {
                kind: Cow::Owned(format!("subscribe:{}", topic)),
                user_id: None,
                token: None,
                params: Some(match params {
                    Some(params) => Cow::Borrowed(params),
                    None => Cow::Owned(serde_json::Value::Object(serde_json::Map::new())),
                }),
            },
            ClientMessage::Unsubscribe { topic } => RawMessage {
                kind: Cow::Owned(format!("unsubscribe:{}", topic)),
                user_id: None,
                token: None,
                params: None,
            },
        }
    }
}

impl Serialize for ClientMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawMessage::from(self).serialize(serializer)
    }
}

impl ClientMessage {
    /// Encode as a JSON text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The topic this message concerns, if any.
    pub fn topic(&self) -> Option<&Topic> {
        match self {
            ClientMessage::Auth { .. } => None,
            ClientMessage::Subscribe { topic, .. } | ClientMessage::Unsubscribe { topic } => {
                Some(topic)
            }
        }
    }
}

/// Frame received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Handshake accepted.
    AuthOk,
    /// Handshake rejected.
    AuthError { message: String },
    /// A pushed event.
    Event(Event),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    server_timestamp: Option<u64>,
}

impl ServerFrame {
    /// Decode a JSON text frame.
    pub fn parse(text: &str) -> Result<Self, EventError> {
        let raw: RawFrame = serde_json::from_str(text)?;

        match raw.kind.as_str() {
            "auth:ok" => Ok(ServerFrame::AuthOk),
            "auth:error" => {
                let message = raw
                    .payload
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("authentication rejected")
                    .to_string();
                Ok(ServerFrame::AuthError { message })
            }
            kind => Event::from_wire(
                kind,
                raw.topic.as_deref(),
                raw.payload,
                raw.server_timestamp,
            )
            .map(ServerFrame::Event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBody;
    use crate::types::Timestamp;
    use serde_json::json;

    #[test]
    fn test_auth_frame() {
        let msg = ClientMessage::Auth {
            user_id: "u1".to_string(),
            token: "tok".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "auth", "userId": "u1", "token": "tok"}));
        assert!(msg.topic().is_none());
    }

    #[test]
    fn test_subscribe_frame_names_topic_in_type() {
        let msg = ClientMessage::Subscribe {
            topic: Topic::Plant("p1".to_string()),
            params: Some(json!({"includeHistory": false})),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(value["type"], "subscribe:plant:p1");
        assert_eq!(value["params"]["includeHistory"], false);
    }

    #[test]
    fn test_subscribe_frame_defaults_params() {
        let msg = ClientMessage::Subscribe {
            topic: Topic::CareTasks,
            params: None,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(value["params"], json!({}));
    }

    #[test]
    fn test_unsubscribe_frame() {
        let msg = ClientMessage::Unsubscribe {
            topic: Topic::Weather("nyc".to_string()),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "unsubscribe:weather:nyc"}));
    }

    #[test]
    fn test_control_messages_serialize_in_a_batch() {
        let batch = vec![
            ClientMessage::Subscribe {
                topic: Topic::CareTasks,
                params: None,
            },
            ClientMessage::Unsubscribe {
                topic: Topic::User("u1".to_string()),
            },
        ];
        assert_eq!(
            serde_json::to_value(&batch).unwrap(),
            json!([
                {"type": "subscribe:care-tasks", "params": {}},
                {"type": "unsubscribe:user:u1"},
            ])
        );
    }

    #[test]
    fn test_parse_handshake_replies() {
        assert_eq!(
            ServerFrame::parse(r#"{"type":"auth:ok"}"#).unwrap(),
            ServerFrame::AuthOk
        );
        assert_eq!(
            ServerFrame::parse(r#"{"type":"auth:error","payload":{"message":"expired"}}"#)
                .unwrap(),
            ServerFrame::AuthError {
                message: "expired".to_string()
            }
        );
    }

    #[test]
    fn test_parse_event_frame() {
        let frame = ServerFrame::parse(
            r#"{"type":"task:deleted","topic":"care-tasks","payload":{"id":"t9"},"serverTimestamp":44}"#,
        )
        .unwrap();
        match frame {
            ServerFrame::Event(event) => {
                assert_eq!(event.timestamp, Timestamp(44));
                assert_eq!(
                    event.body,
                    EventBody::TaskDeleted {
                        id: "t9".to_string()
                    }
                );
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            ServerFrame::parse("not json"),
            Err(EventError::Malformed(_))
        ));
        assert!(matches!(
            ServerFrame::parse(r#"{"payload":{}}"#),
            Err(EventError::Malformed(_))
        ));
    }
}
