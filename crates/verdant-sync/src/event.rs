//! Typed server events.
//!
//! Every frame pushed by the server is decoded into an [`Event`] whose body is
//! the [`EventBody`] sum type. [`EventTag`] is the fieldless mirror of the body
//! used as the dispatcher's routing key; the tag table is generated by
//! `define_event_tags!` so the wire string, the tag and whether the event
//! feeds a timestamp-gated cache are declared in one place.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topic::Topic;
use crate::types::{
    CareTask, Comment, CommunityPost, HealthStatus, LikeChange, PlantHealthRecord, Timestamp,
};

/// Errors decoding a server frame. Never fatal: the frame is dropped.
#[derive(Debug, Error)]
pub enum EventError {
    /// The frame is not valid JSON or lacks a `type`.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The `type` tag is not part of the event taxonomy.
    #[error("unknown event type: {0}")]
    UnknownTag(String),

    /// A cache-feeding event arrived without `serverTimestamp`.
    #[error("event {0} is missing serverTimestamp")]
    MissingTimestamp(EventTag),

    /// The payload does not match the shape the tag requires.
    #[error("invalid payload for {tag}: {source}")]
    InvalidPayload {
        tag: EventTag,
        #[source]
        source: serde_json::Error,
    },

    /// The `topic` field is not a valid topic.
    #[error("invalid topic on event: {0}")]
    InvalidTopic(String),
}

/// Declares the event taxonomy.
///
/// ```ignore
/// define_event_tags! {
///     // Variant => "wire:tag", feeds_cache;
///     TaskCreated => "task:created", true;
/// }
/// ```
macro_rules! define_event_tags {
    ( $( $variant:ident => $tag:literal, $feeds_cache:literal; )* ) => {
        /// Routing key of an event, one per [`EventBody`] variant.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum EventTag {
            $( $variant, )*
        }

        impl EventTag {
            /// Every tag in the taxonomy.
            pub const ALL: &'static [EventTag] = &[ $( EventTag::$variant, )* ];

            /// The wire string of this tag.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( EventTag::$variant => $tag, )*
                }
            }

            /// Look up a tag by its wire string.
            pub fn from_wire(s: &str) -> Option<Self> {
                match s {
                    $( $tag => Some(EventTag::$variant), )*
                    _ => None,
                }
            }

            /// Whether events with this tag mutate a timestamp-gated cache and
            /// therefore must carry `serverTimestamp`.
            pub fn feeds_cache(self) -> bool {
                match self {
                    $( EventTag::$variant => $feeds_cache, )*
                }
            }
        }
    };
}

define_event_tags! {
    PlantCreated => "plant:created", false;
    PlantUpdated => "plant:updated", false;
    PlantDeleted => "plant:deleted", true;
    PlantImageAdded => "plant:image:added", false;
    HealthCheckStarted => "health:check:start", true;
    HealthCheckCompleted => "health:check:complete", true;
    HealthStatusUpdated => "health:status:updated", true;
    TaskCreated => "task:created", true;
    TaskUpdated => "task:updated", true;
    TaskCompleted => "task:completed", true;
    TaskSnoozed => "task:snoozed", true;
    TaskDeleted => "task:deleted", true;
    PostCreated => "community:post:created", true;
    PostLiked => "community:post:liked", true;
    PostUnliked => "community:post:unliked", true;
    CommentAdded => "community:comment:added", true;
    WeatherUpdated => "weather:updated", false;
    AiResponse => "ai:response", false;
    DiseaseDetected => "ai:disease:detection", false;
    UserOnline => "user:online", false;
    UserOffline => "user:offline", false;
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Plant summary carried by plant lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlantSummary {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub species: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlantImage {
    pub plant_id: String,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatusChange {
    pub plant_id: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_score: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherReport {
    pub location: String,
    pub temperature_c: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiReply {
    pub request_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiseaseDetection {
    pub plant_id: String,
    pub disease: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlantRef {
    plant_id: String,
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRef {
    user_id: String,
}

// =============================================================================
// Events
// =============================================================================

/// Decoded body of a server event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    PlantCreated(PlantSummary),
    PlantUpdated(PlantSummary),
    PlantDeleted { plant_id: String },
    PlantImageAdded(PlantImage),
    HealthCheckStarted { plant_id: String },
    HealthCheckCompleted(PlantHealthRecord),
    HealthStatusUpdated(HealthStatusChange),
    TaskCreated(CareTask),
    TaskUpdated(CareTask),
    TaskCompleted(CareTask),
    TaskSnoozed(CareTask),
    TaskDeleted { id: String },
    PostCreated(CommunityPost),
    PostLiked(LikeChange),
    PostUnliked(LikeChange),
    CommentAdded(Comment),
    WeatherUpdated(WeatherReport),
    AiResponse(AiReply),
    DiseaseDetected(DiseaseDetection),
    UserOnline { user_id: String },
    UserOffline { user_id: String },
}

impl EventBody {
    /// The routing tag of this body.
    pub fn tag(&self) -> EventTag {
        match self {
            EventBody::PlantCreated(_) => EventTag::PlantCreated,
            EventBody::PlantUpdated(_) => EventTag::PlantUpdated,
            EventBody::PlantDeleted { .. } => EventTag::PlantDeleted,
            EventBody::PlantImageAdded(_) => EventTag::PlantImageAdded,
            EventBody::HealthCheckStarted { .. } => EventTag::HealthCheckStarted,
            EventBody::HealthCheckCompleted(_) => EventTag::HealthCheckCompleted,
            EventBody::HealthStatusUpdated(_) => EventTag::HealthStatusUpdated,
            EventBody::TaskCreated(_) => EventTag::TaskCreated,
            EventBody::TaskUpdated(_) => EventTag::TaskUpdated,
            EventBody::TaskCompleted(_) => EventTag::TaskCompleted,
            EventBody::TaskSnoozed(_) => EventTag::TaskSnoozed,
            EventBody::TaskDeleted { .. } => EventTag::TaskDeleted,
            EventBody::PostCreated(_) => EventTag::PostCreated,
            EventBody::PostLiked(_) => EventTag::PostLiked,
            EventBody::PostUnliked(_) => EventTag::PostUnliked,
            EventBody::CommentAdded(_) => EventTag::CommentAdded,
            EventBody::WeatherUpdated(_) => EventTag::WeatherUpdated,
            EventBody::AiResponse(_) => EventTag::AiResponse,
            EventBody::DiseaseDetected(_) => EventTag::DiseaseDetected,
            EventBody::UserOnline { .. } => EventTag::UserOnline,
            EventBody::UserOffline { .. } => EventTag::UserOffline,
        }
    }

    fn decode(tag: EventTag, payload: serde_json::Value) -> Result<Self, serde_json::Error> {
        fn de<T: DeserializeOwned>(payload: serde_json::Value) -> Result<T, serde_json::Error> {
            serde_json::from_value(payload)
        }

        Ok(match tag {
            EventTag::PlantCreated => EventBody::PlantCreated(de(payload)?),
            EventTag::PlantUpdated => EventBody::PlantUpdated(de(payload)?),
            EventTag::PlantDeleted => EventBody::PlantDeleted {
                plant_id: de::<PlantRef>(payload)?.plant_id,
            },
            EventTag::PlantImageAdded => EventBody::PlantImageAdded(de(payload)?),
            EventTag::HealthCheckStarted => EventBody::HealthCheckStarted {
                plant_id: de::<PlantRef>(payload)?.plant_id,
            },
            EventTag::HealthCheckCompleted => EventBody::HealthCheckCompleted(de(payload)?),
            EventTag::HealthStatusUpdated => EventBody::HealthStatusUpdated(de(payload)?),
            EventTag::TaskCreated => EventBody::TaskCreated(de(payload)?),
            EventTag::TaskUpdated => EventBody::TaskUpdated(de(payload)?),
            EventTag::TaskCompleted => EventBody::TaskCompleted(de(payload)?),
            EventTag::TaskSnoozed => EventBody::TaskSnoozed(de(payload)?),
            EventTag::TaskDeleted => EventBody::TaskDeleted {
                id: de::<IdRef>(payload)?.id,
            },
            EventTag::PostCreated => EventBody::PostCreated(de(payload)?),
            EventTag::PostLiked => EventBody::PostLiked(de(payload)?),
            EventTag::PostUnliked => EventBody::PostUnliked(de(payload)?),
            EventTag::CommentAdded => EventBody::CommentAdded(de(payload)?),
            EventTag::WeatherUpdated => EventBody::WeatherUpdated(de(payload)?),
            EventTag::AiResponse => EventBody::AiResponse(de(payload)?),
            EventTag::DiseaseDetected => EventBody::DiseaseDetected(de(payload)?),
            EventTag::UserOnline => EventBody::UserOnline {
                user_id: de::<UserRef>(payload)?.user_id,
            },
            EventTag::UserOffline => EventBody::UserOffline {
                user_id: de::<UserRef>(payload)?.user_id,
            },
        })
    }
}

/// A decoded server event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Topic the event was published on, when the server names it.
    pub topic: Option<Topic>,
    /// Server sequence number. [`Timestamp::ZERO`] for events that do not
    /// feed a cache and arrived without one.
    pub timestamp: Timestamp,
    pub body: EventBody,
}

impl Event {
    pub fn new(timestamp: Timestamp, body: EventBody) -> Self {
        Self {
            topic: None,
            timestamp,
            body,
        }
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn tag(&self) -> EventTag {
        self.body.tag()
    }

    /// Decode an event from its wire fields.
    pub(crate) fn from_wire(
        kind: &str,
        topic: Option<&str>,
        payload: serde_json::Value,
        server_timestamp: Option<u64>,
    ) -> Result<Self, EventError> {
        let tag = EventTag::from_wire(kind).ok_or_else(|| EventError::UnknownTag(kind.to_string()))?;

        let timestamp = match server_timestamp {
            Some(ts) => Timestamp(ts),
            None if tag.feeds_cache() => return Err(EventError::MissingTimestamp(tag)),
            None => Timestamp::ZERO,
        };

        let topic = topic
            .map(|t| Topic::parse(t).map_err(|_| EventError::InvalidTopic(t.to_string())))
            .transpose()?;

        let body = EventBody::decode(tag, payload)
            .map_err(|source| EventError::InvalidPayload { tag, source })?;

        Ok(Self {
            topic,
            timestamp,
            body,
        })
    }
}
