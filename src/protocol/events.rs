//! Wire event types for the realtime control channel.
//!
//! ## Protocol Overview
//!
//! Both directions carry JSON objects discriminated by a `type` field.
//! Inbound (server → client), the events this crate reacts to:
//!
//! - `input_audio_buffer.speech_started` / `.speech_stopped` / `.committed`
//! - `conversation.item.input_audio_transcription` (partial user text)
//! - `conversation.item.input_audio_transcription.completed`
//! - `response.audio_transcript.delta` / `.done` (assistant text)
//! - `response.function_call_arguments.done` (tool invocation)
//!
//! Everything else deserializes to [`ServerEvent::Unknown`] and is
//! ignored by dispatch. Outbound (client → server):
//!
//! - `session.update` (modalities, tools, transcription model)
//! - `conversation.item.create` (typed user message or tool output)
//! - `response.create` (prompt the model to respond)

use serde::{Deserialize, Serialize};

use crate::tools::ToolDescriptor;

// ── Inbound ────────────────────────────────────────────────────────

/// Server-originated event, discriminated by the wire `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "input_audio_buffer.committed")]
    Committed,
    /// Interim user transcript. Some server builds put the text under
    /// `transcript`, others under `text`; both are accepted.
    #[serde(rename = "conversation.item.input_audio_transcription")]
    PartialTranscription {
        #[serde(default)]
        transcript: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        transcript: Option<String>,
    },
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone,
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallDone {
        name: String,
        call_id: String,
        /// JSON-encoded argument object, parsed at dispatch time.
        arguments: String,
    },
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Best-effort text of a partial transcription event.
    pub fn partial_text(transcript: &Option<String>, text: &Option<String>) -> String {
        transcript
            .as_deref()
            .or(text.as_deref())
            .unwrap_or_default()
            .to_string()
    }
}

// ── Outbound ───────────────────────────────────────────────────────

/// Client-originated event in its wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },
    #[serde(rename = "conversation.item.create")]
    ItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub tools: Vec<ToolDescriptor>,
    pub input_audio_transcription: TranscriptionSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionSettings {
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ConversationItem {
    #[serde(rename = "message")]
    Message {
        role: String,
        content: Vec<ContentPart>,
    },
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "input_text")]
    InputText { text: String },
}

impl ClientEvent {
    /// Session-configuration event built from the active config.
    pub fn session_update(
        modalities: Vec<String>,
        tools: Vec<ToolDescriptor>,
        transcription_model: impl Into<String>,
    ) -> Self {
        Self::SessionUpdate {
            session: SessionSettings {
                modalities,
                tools,
                input_audio_transcription: TranscriptionSettings {
                    model: transcription_model.into(),
                },
            },
        }
    }

    /// A typed user message as a conversation item.
    pub fn user_message(text: impl Into<String>) -> Self {
        Self::ItemCreate {
            item: ConversationItem::Message {
                role: "user".into(),
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        }
    }

    /// Tool output routed back to the originating call.
    pub fn function_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::ItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.into(),
            },
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_server_events() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"input_audio_buffer.speech_started"}"#).unwrap();
        assert!(matches!(event, ServerEvent::SpeechStarted));

        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"conversation.item.input_audio_transcription","transcript":"my knee"}"#,
        )
        .unwrap();
        match event {
            ServerEvent::PartialTranscription { transcript, text } => {
                assert_eq!(ServerEvent::partial_text(&transcript, &text), "my knee");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"response.function_call_arguments.done","name":"sendLabOrder","call_id":"c1","arguments":"{\"patientName\":\"Jane\"}"}"#,
        )
        .unwrap();
        match event {
            ServerEvent::FunctionCallDone { name, call_id, arguments } => {
                assert_eq!(name, "sendLabOrder");
                assert_eq!(call_id, "c1");
                assert!(arguments.contains("Jane"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_type_maps_to_unknown() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"rate_limits.updated","limits":[]}"#).unwrap();
        assert!(matches!(event, ServerEvent::Unknown));
    }

    #[test]
    fn partial_text_prefers_transcript_field() {
        let t = Some("from transcript".to_string());
        let x = Some("from text".to_string());
        assert_eq!(ServerEvent::partial_text(&t, &x), "from transcript");
        assert_eq!(ServerEvent::partial_text(&None, &x), "from text");
        assert_eq!(ServerEvent::partial_text(&None, &None), "");
    }

    #[test]
    fn session_update_wire_shape() {
        let event = ClientEvent::session_update(
            vec!["text".into(), "audio".into()],
            crate::tools::clinic::descriptors(),
            "whisper-1",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session.update");
        assert_eq!(json["session"]["modalities"][1], "audio");
        assert_eq!(json["session"]["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(json["session"]["tools"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn user_message_wire_shape() {
        let json = serde_json::to_value(ClientEvent::user_message("hello")).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "message",
                    "role": "user",
                    "content": [{"type": "input_text", "text": "hello"}]
                }
            })
        );
    }

    #[test]
    fn function_output_wire_shape() {
        let json = serde_json::to_value(ClientEvent::function_output("c1", "{\"success\":true}"))
            .unwrap();
        assert_eq!(json["type"], "conversation.item.create");
        assert_eq!(json["item"]["type"], "function_call_output");
        assert_eq!(json["item"]["call_id"], "c1");
    }

    #[test]
    fn response_create_is_bare() {
        let json = serde_json::to_value(ClientEvent::ResponseCreate).unwrap();
        assert_eq!(json, json!({"type": "response.create"}));
    }
}
