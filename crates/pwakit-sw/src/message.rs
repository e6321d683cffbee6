//! Client ↔ worker message protocol.
//!
//! Messages are JSON objects discriminated by a `type` field:
//!
//! | direction       | type            | payload              |
//! |-----------------|-----------------|----------------------|
//! | client → worker | `SKIP_WAITING`  |                      |
//! | client → worker | `CLEAR_CACHE`   |                      |
//! | client → worker | `GET_VERSION`   |                      |
//! | worker → client | `CACHE_CLEARED` |                      |
//! | worker → client | `SW_VERSION`    | `version`            |
//! | worker → client | `SW_ACTIVATED`  | `version`            |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Message posted to the worker by a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Activate the waiting worker now.
    SkipWaiting,
    /// Delete every cache bucket.
    ClearCache,
    /// Ask for the current generation.
    GetVersion,
}

impl ClientMessage {
    /// Parse a message. Unknown types and malformed payloads yield `None`.
    pub fn parse(data: &Value) -> Option<Self> {
        match serde_json::from_value(data.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(error = %e, "Ignoring unrecognized message");
                None
            }
        }
    }
}

/// Message posted to a page by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Reply to `CLEAR_CACHE`.
    CacheCleared,
    /// Reply to `GET_VERSION`.
    SwVersion { version: String },
    /// Broadcast after a generation activates.
    SwActivated { version: String },
}

impl WorkerMessage {
    /// JSON form, as a page would receive it.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_messages() {
        assert_eq!(
            ClientMessage::parse(&json!({ "type": "SKIP_WAITING" })),
            Some(ClientMessage::SkipWaiting)
        );
        assert_eq!(
            ClientMessage::parse(&json!({ "type": "CLEAR_CACHE" })),
            Some(ClientMessage::ClearCache)
        );
        assert_eq!(
            ClientMessage::parse(&json!({ "type": "GET_VERSION" })),
            Some(ClientMessage::GetVersion)
        );
    }

    #[test]
    fn test_unknown_and_malformed_messages_ignored() {
        assert_eq!(ClientMessage::parse(&json!({ "type": "REBOOT" })), None);
        assert_eq!(ClientMessage::parse(&json!({ "kind": "GET_VERSION" })), None);
        assert_eq!(ClientMessage::parse(&json!("GET_VERSION")), None);
        assert_eq!(ClientMessage::parse(&Value::Null), None);
    }

    #[test]
    fn test_worker_messages_wire_format() {
        assert_eq!(
            WorkerMessage::CacheCleared.to_json(),
            json!({ "type": "CACHE_CLEARED" })
        );
        assert_eq!(
            WorkerMessage::SwVersion {
                version: "v1.2.0".into()
            }
            .to_json(),
            json!({ "type": "SW_VERSION", "version": "v1.2.0" })
        );
        assert_eq!(
            WorkerMessage::SwActivated {
                version: "v2".into()
            }
            .to_json(),
            json!({ "type": "SW_ACTIVATED", "version": "v2" })
        );
    }
}
