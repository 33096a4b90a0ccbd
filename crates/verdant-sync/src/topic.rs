//! Subscription topic parsing.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error when parsing a topic string.
#[derive(Debug, Error)]
#[error("invalid topic: {0}")]
pub struct TopicError(String);

/// A named subscription channel on the push connection.
///
/// Topics have the string forms `care-tasks`, `community`, `plant:{id}`,
/// `weather:{location}` and `user:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// All care tasks of the authenticated user.
    CareTasks,
    /// The community feed.
    Community,
    /// Lifecycle and health events for a single plant.
    Plant(String),
    /// Weather updates for a location.
    Weather(String),
    /// Presence and AI replies addressed to a user.
    User(String),
}

impl Topic {
    /// Parse a topic string.
    ///
    /// # Example
    ///
    /// ```
    /// use verdant_sync::Topic;
    ///
    /// let topic = Topic::parse("plant:p42").unwrap();
    /// assert_eq!(topic, Topic::Plant("p42".to_string()));
    /// assert_eq!(topic.to_string(), "plant:p42");
    /// ```
    pub fn parse(s: &str) -> Result<Self, TopicError> {
        match s {
            "care-tasks" => return Ok(Topic::CareTasks),
            "community" => return Ok(Topic::Community),
            _ => {}
        }

        let (kind, arg) = s
            .split_once(':')
            .ok_or_else(|| TopicError(format!("unknown topic: {s}")))?;

        if arg.is_empty() {
            return Err(TopicError(format!("empty topic argument: {s}")));
        }

        match kind {
            "plant" => Ok(Topic::Plant(arg.to_string())),
            "weather" => Ok(Topic::Weather(arg.to_string())),
            "user" => Ok(Topic::User(arg.to_string())),
            _ => Err(TopicError(format!("unknown topic kind '{kind}': {s}"))),
        }
    }

    /// The topic kind without its argument (e.g. `plant` for `plant:p1`).
    pub fn kind(&self) -> &'static str {
        match self {
            Topic::CareTasks => "care-tasks",
            Topic::Community => "community",
            Topic::Plant(_) => "plant",
            Topic::Weather(_) => "weather",
            Topic::User(_) => "user",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::CareTasks | Topic::Community => f.write_str(self.kind()),
            Topic::Plant(arg) | Topic::Weather(arg) | Topic::User(arg) => {
                write!(f, "{}:{}", self.kind(), arg)
            }
        }
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Topic {
    type Error = TopicError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}
