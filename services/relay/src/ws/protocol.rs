//! JSON message protocol between clients and the relay.
//!
//! Control frames ride alongside out-of-band binary payloads: clients send
//! raw PCM frames upward, the relay sends finished WAV buffers downward.

use serde::{Deserialize, Serialize};

/// Control messages sent by the client.
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Opens a session. `session_id` may be omitted, in which case the relay
    /// generates one and reports it in the `session-started` acknowledgment.
    #[serde(rename = "start", rename_all = "camelCase")]
    Start {
        session_id: Option<String>,
        sample_rate: Option<u32>,
    },
    /// Ends a session, flushing any final audio first.
    #[serde(rename = "end", rename_all = "camelCase")]
    End { session_id: String },
}

/// Messages sent from the relay to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session-started", rename_all = "camelCase")]
    SessionStarted { session_id: String },
    #[serde(rename = "session-ended", rename_all = "camelCase")]
    SessionEnded {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    /// Side-channel text produced by the model alongside its audio.
    #[serde(rename = "text")]
    Text { text: String },
    /// The model asked for a function to be executed; the relay has already
    /// acknowledged it upstream, this is informational for the client.
    #[serde(rename = "tool-call")]
    ToolCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        args: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_message_parses_camel_case_fields() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "start", "sessionId": "abc-123", "sampleRate": 44100}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Start {
                session_id,
                sample_rate,
            } => {
                assert_eq!(session_id.as_deref(), Some("abc-123"));
                assert_eq!(sample_rate, Some(44100));
            }
            other => panic!("expected Start, got {:?}", other),
        }
    }

    #[test]
    fn start_message_allows_missing_optionals() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "start"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Start {
                session_id: None,
                sample_rate: None
            }
        ));
    }

    #[test]
    fn end_message_requires_session_id() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "end", "sessionId": "abc-123"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::End { session_id } if session_id == "abc-123"));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "end"}"#).is_err());
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "bogus"}"#).is_err());
    }

    #[test]
    fn session_started_serializes_with_kebab_tag() {
        let value = serde_json::to_value(ServerMessage::SessionStarted {
            session_id: "abc-123".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "session-started", "sessionId": "abc-123"}));
    }

    #[test]
    fn error_omits_empty_details() {
        let value = serde_json::to_value(ServerMessage::Error {
            error: "boom".to_string(),
            details: None,
        })
        .unwrap();
        assert_eq!(value, json!({"type": "error", "error": "boom"}));
    }

    #[test]
    fn tool_call_carries_args_verbatim() {
        let value = serde_json::to_value(ServerMessage::ToolCall {
            id: Some("call-1".to_string()),
            name: "lookup".to_string(),
            args: json!({"question": "why"}),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "tool-call",
                "id": "call-1",
                "name": "lookup",
                "args": {"question": "why"}
            })
        );
    }
}
