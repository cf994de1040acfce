//! Realtime voice channel wire format
//!
//! One socket carries two kinds of frames: JSON control messages (text) and
//! raw audio (binary). Client frames are tagged by `event`; server frames are
//! loosely shaped, so they are decoded into a permissive [`ServerFrame`] and
//! then classified into a [`ServerEvent`].

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// `reason` sent with `ai_done` when the caller said goodbye.
pub const REASON_USER_GOODBYE: &str = "USER_GOODBYE";

/// Decision value announcing a handoff to a human agent.
pub const DECISION_AGENT: &str = "AGENT";

/// One discrete message on the realtime channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Client -> server control frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientFrame {
    RegisterClient {
        client_id: String,
        user_name: String,
        phone_number: String,
    },
    EndCall,
}

impl ClientFrame {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Human agent details attached to an escalation decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AgentInfo {
    pub fn display_name(&self) -> &str {
        self.agent_name.as_deref().unwrap_or("unknown agent")
    }
}

/// Raw server control frame. Every field is optional; unknown fields are
/// ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerFrame {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub confidence: Option<Value>,
    #[serde(default)]
    pub clarification_count: Option<u32>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub agent: Option<AgentInfo>,
    #[serde(default)]
    pub audio_stream: Option<Value>,
    #[serde(default)]
    pub audio_response: Option<Value>,
    #[serde(default)]
    pub call_id: Option<Value>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Decision metadata reported at the end of an AI turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnReport {
    pub decision: Option<String>,
    pub confidence: Option<f64>,
    pub clarification_count: Option<u32>,
    pub reason: Option<String>,
    pub summary: Option<String>,
}

impl TurnReport {
    pub fn is_goodbye(&self) -> bool {
        self.reason.as_deref() == Some(REASON_USER_GOODBYE)
    }
}

/// Where the escalation announcement comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnouncementSource {
    /// Audio bytes embedded in the control frame
    Inline(Vec<u8>),
    /// The next binary frame carries the announcement
    Streamed,
    /// Nothing supplied by the server
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub agent: AgentInfo,
    pub source: AnnouncementSource,
    pub summary: Option<String>,
}

/// Classified server control frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    AiSpeaking,
    AiDone(TurnReport),
    Escalate(Escalation),
    Other,
}

/// A decoded control frame plus the call id it may carry.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerMessage {
    pub call_id: Option<String>,
    pub event: ServerEvent,
}

impl ServerMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let frame: ServerFrame = serde_json::from_str(text)?;
        Ok(frame.into())
    }
}

impl From<ServerFrame> for ServerMessage {
    fn from(frame: ServerFrame) -> Self {
        let call_id = frame.call_id.as_ref().and_then(value_to_id);

        // Escalation takes precedence over whatever `event` the frame carries.
        if frame.decision.as_deref() == Some(DECISION_AGENT) {
            if let Some(agent) = frame.agent.clone() {
                let source = if is_truthy(frame.audio_stream.as_ref()) {
                    AnnouncementSource::Streamed
                } else if let Some(bytes) = frame.audio_response.as_ref().and_then(decode_audio) {
                    AnnouncementSource::Inline(bytes)
                } else {
                    AnnouncementSource::None
                };
                return Self {
                    call_id,
                    event: ServerEvent::Escalate(Escalation {
                        agent,
                        source,
                        summary: frame.summary,
                    }),
                };
            }
        }

        let event = match frame.event.as_deref() {
            Some("ai_speaking") => ServerEvent::AiSpeaking,
            Some("ai_done") => ServerEvent::AiDone(TurnReport {
                decision: frame.decision,
                confidence: frame.confidence.as_ref().and_then(value_to_f64),
                clarification_count: frame.clarification_count,
                reason: frame.reason,
                summary: frame.summary,
            }),
            _ => ServerEvent::Other,
        };

        Self { call_id, event }
    }
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(_) => true,
    }
}

/// Inline audio arrives either base64 encoded or as an array of byte values.
fn decode_audio(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => match base64::engine::general_purpose::STANDARD.decode(s) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(e) => {
                warn!("Ignoring undecodable inline audio: {}", e);
                None
            }
        },
        Value::Array(items) => {
            let bytes: Option<Vec<u8>> = items
                .iter()
                .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            bytes.filter(|b| !b.is_empty())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_serialization() {
        let frame = ClientFrame::RegisterClient {
            client_id: "c-1".to_string(),
            user_name: "Amina".to_string(),
            phone_number: "+212612345678".to_string(),
        };
        let parsed: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(parsed["event"], "register_client");
        assert_eq!(parsed["client_id"], "c-1");
        assert_eq!(parsed["user_name"], "Amina");
        assert_eq!(parsed["phone_number"], "+212612345678");

        let end: Value = serde_json::from_str(&ClientFrame::EndCall.to_json().unwrap()).unwrap();
        assert_eq!(end, json!({"event": "end_call"}));
    }

    #[test]
    fn test_ai_done_report() {
        let msg = ServerMessage::parse(
            &json!({
                "event": "ai_done",
                "decision": "AUTO_HANDLED",
                "confidence": 0.82,
                "clarification_count": 1
            })
            .to_string(),
        )
        .unwrap();

        match msg.event {
            ServerEvent::AiDone(report) => {
                assert_eq!(report.decision.as_deref(), Some("AUTO_HANDLED"));
                assert_eq!(report.confidence, Some(0.82));
                assert_eq!(report.clarification_count, Some(1));
                assert!(!report.is_goodbye());
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_goodbye_and_call_id() {
        let msg = ServerMessage::parse(
            r#"{"event":"ai_done","reason":"USER_GOODBYE","call_id":42}"#,
        )
        .unwrap();
        assert_eq!(msg.call_id.as_deref(), Some("42"));
        match msg.event {
            ServerEvent::AiDone(report) => assert!(report.is_goodbye()),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_escalation_sources() {
        let plain = ServerMessage::parse(r#"{"decision":"AGENT","agent":{"agent_name":"Sara"}}"#)
            .unwrap();
        match plain.event {
            ServerEvent::Escalate(esc) => {
                assert_eq!(esc.agent.display_name(), "Sara");
                assert_eq!(esc.source, AnnouncementSource::None);
            }
            other => panic!("Unexpected event: {:?}", other),
        }

        let streamed = ServerMessage::parse(
            r#"{"decision":"AGENT","agent":{"agent_name":"Sara"},"audio_stream":true}"#,
        )
        .unwrap();
        assert!(matches!(
            streamed.event,
            ServerEvent::Escalate(Escalation { source: AnnouncementSource::Streamed, .. })
        ));

        let data = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        let inline = ServerMessage::parse(
            &json!({"decision": "AGENT", "agent": {}, "audio_response": data}).to_string(),
        )
        .unwrap();
        assert!(matches!(
            inline.event,
            ServerEvent::Escalate(Escalation { source: AnnouncementSource::Inline(ref b), .. }) if b == &vec![1, 2, 3]
        ));
    }

    #[test]
    fn test_agent_decision_without_agent_is_not_escalation() {
        let msg = ServerMessage::parse(r#"{"event":"ai_done","decision":"AGENT"}"#).unwrap();
        assert!(matches!(msg.event, ServerEvent::AiDone(_)));
    }

    #[test]
    fn test_unknown_frames() {
        let msg = ServerMessage::parse(r#"{"event":"heartbeat"}"#).unwrap();
        assert_eq!(msg.event, ServerEvent::Other);
        assert!(ServerMessage::parse("not json").is_err());
    }
}
