//! Wire types for the telephony platform: media-socket JSON events and the
//! answer/event webhook payloads.
//!
//! Binary frames on the media socket are raw PCM16 and never appear here.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// JSON text frames arriving on the telephony media websocket. The platform
/// runs voice activity detection and reports turn boundaries as events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelephonyEvent {
    /// The call is connected and media is flowing.
    Answered,
    /// The caller started speaking.
    SpeechStarted,
    /// The caller stopped speaking; their turn is over.
    SpeechStopped {
        /// Transcript of the caller's turn, when the platform provides one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcript: Option<String>,
    },
    /// The caller hung up.
    Hangup,
}

/// Query/body parameters of the answer webhook.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AnswerParams {
    pub uuid: Option<String>,
    pub conversation_uuid: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl AnswerParams {
    /// The id the call is registered under. Falls back to the conversation
    /// id when the leg uuid is absent.
    pub fn call_id(&self) -> Option<&str> {
        self.uuid
            .as_deref()
            .or(self.conversation_uuid.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// One action of the answer-webhook call-control response.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum NccoAction {
    Connect {
        from: String,
        endpoint: Vec<WebsocketEndpoint>,
    },
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WebsocketEndpoint {
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: String,
    #[serde(rename = "content-type")]
    pub content_type: String,
}

impl NccoAction {
    /// Connect the call to our media socket as 16 kHz linear PCM.
    pub fn connect_to_socket(public_host: &str, call_id: &str, from: &str) -> Self {
        NccoAction::Connect {
            from: from.to_string(),
            endpoint: vec![WebsocketEndpoint {
                kind: "websocket".to_string(),
                uri: format!("wss://{public_host}/socket/{call_id}"),
                content_type: "audio/l16;rate=16000".to_string(),
            }],
        }
    }
}

/// Status callback delivered to the events webhook.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CallEventPayload {
    pub uuid: Option<String>,
    pub conversation_uuid: Option<String>,
    pub status: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl CallEventPayload {
    pub fn call_id(&self) -> Option<&str> {
        self.uuid
            .as_deref()
            .or(self.conversation_uuid.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Statuses after which the platform will send no further media.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("completed")
                | Some("failed")
                | Some("rejected")
                | Some("timeout")
                | Some("cancelled")
                | Some("busy")
                | Some("unanswered")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telephony_events_deserialize() {
        let event: TelephonyEvent =
            serde_json::from_str(r#"{"event":"speech_started"}"#).expect("parse");
        assert_eq!(event, TelephonyEvent::SpeechStarted);

        let event: TelephonyEvent =
            serde_json::from_str(r#"{"event":"speech_stopped","transcript":"book a table"}"#)
                .expect("parse");
        assert_eq!(
            event,
            TelephonyEvent::SpeechStopped {
                transcript: Some("book a table".to_string())
            }
        );

        let event: TelephonyEvent =
            serde_json::from_str(r#"{"event":"speech_stopped"}"#).expect("parse");
        assert_eq!(event, TelephonyEvent::SpeechStopped { transcript: None });
    }

    #[test]
    fn unknown_event_is_an_error() {
        assert!(serde_json::from_str::<TelephonyEvent>(r#"{"event":"dtmf"}"#).is_err());
    }

    #[test]
    fn connect_action_serializes_with_content_type() {
        let action = NccoAction::connect_to_socket("gw.example.com", "abc123", "15550001111");
        let json = serde_json::to_value(&action).expect("serialize");
        assert_eq!(json["action"], "connect");
        assert_eq!(json["endpoint"][0]["type"], "websocket");
        assert_eq!(json["endpoint"][0]["uri"], "wss://gw.example.com/socket/abc123");
        assert_eq!(json["endpoint"][0]["content-type"], "audio/l16;rate=16000");
    }

    #[test]
    fn terminal_statuses() {
        for status in ["completed", "failed", "rejected", "timeout", "cancelled", "busy"] {
            let payload = CallEventPayload {
                uuid: Some("u1".to_string()),
                conversation_uuid: None,
                status: Some(status.to_string()),
                from: None,
                to: None,
            };
            assert!(payload.is_terminal(), "{status} should be terminal");
        }
        let ringing = CallEventPayload {
            uuid: Some("u1".to_string()),
            conversation_uuid: None,
            status: Some("ringing".to_string()),
            from: None,
            to: None,
        };
        assert!(!ringing.is_terminal());
    }

    #[test]
    fn call_id_prefers_leg_uuid() {
        let payload = CallEventPayload {
            uuid: Some("leg".to_string()),
            conversation_uuid: Some("conv".to_string()),
            status: None,
            from: None,
            to: None,
        };
        assert_eq!(payload.call_id(), Some("leg"));

        let params = AnswerParams {
            uuid: None,
            conversation_uuid: Some("conv".to_string()),
            from: None,
            to: None,
        };
        assert_eq!(params.call_id(), Some("conv"));
    }
}
