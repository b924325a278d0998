//! Inbound event dispatch: the protocol state machine.
//!
//! [`ProtocolHandler::handle_raw`] consumes one side-channel message at a
//! time, strictly in arrival order. There is no explicit state enum; the
//! state lives in the conversation store's ephemeral / trailing-turn
//! status. Outbound events go through a non-owning channel sender and
//! must tolerate the transport being torn down mid-flight: sends to a
//! closed channel are logged and dropped, never fatal.

pub mod events;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::convo::{ConversationStore, DetectedAction, MessageLanguage, Role, TurnStatus, TurnUpdate};
use crate::detect::DetectorConfig;
use crate::tools::clinic::GENERATE_SUMMARY;
use crate::tools::{FunctionResult, ToolRegistry};
use events::{ClientEvent, ServerEvent};

/// Dispatches inbound side-channel events into store mutations, tool
/// invocations, and outbound control events.
pub struct ProtocolHandler {
    detectors: DetectorConfig,
    store: Arc<Mutex<ConversationStore>>,
    registry: Arc<Mutex<ToolRegistry>>,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    /// Every inbound event, recognized or not, lands here for diagnostics.
    raw_log: Arc<Mutex<Vec<Value>>>,
    /// Most recent finalized assistant utterance classified as
    /// clinician speech; replayed on a patient repeat request.
    previous_clinician_message: Option<String>,
    on_conversation_end: Option<Arc<dyn Fn() + Send + Sync>>,
    end_fired: Arc<AtomicBool>,
    end_callback_delay: Duration,
    processing_label: String,
}

impl ProtocolHandler {
    pub fn new(
        detectors: DetectorConfig,
        store: Arc<Mutex<ConversationStore>>,
        registry: Arc<Mutex<ToolRegistry>>,
        outbound: mpsc::UnboundedSender<ClientEvent>,
        raw_log: Arc<Mutex<Vec<Value>>>,
        processing_label: impl Into<String>,
        end_callback_delay: Duration,
    ) -> Self {
        Self {
            detectors,
            store,
            registry,
            outbound,
            raw_log,
            previous_clinician_message: None,
            on_conversation_end: None,
            end_fired: Arc::new(AtomicBool::new(false)),
            end_callback_delay,
            processing_label: processing_label.into(),
        }
    }

    /// Install the callback fired (once, after a short delay) when the
    /// conversation is detected to be over.
    pub fn set_conversation_end_callback(&mut self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.on_conversation_end = Some(callback);
    }

    /// Process one raw side-channel message. Malformed JSON is logged
    /// and skipped; the channel stays open.
    pub async fn handle_raw(&mut self, raw: &str) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed inbound message");
                return;
            }
        };
        self.raw_log.lock().push(value.clone());

        let event: ServerEvent = match serde_json::from_value(value) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "Inbound event failed to decode");
                return;
            }
        };
        self.dispatch(event).await;
    }

    async fn dispatch(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SpeechStarted => {
                self.store.lock().begin_ephemeral_turn(Role::User);
            }
            // No terminal effect; the turn stays in `speaking` until the
            // buffer commits.
            ServerEvent::SpeechStopped => {}
            ServerEvent::Committed => {
                self.store.lock().update_ephemeral_turn(TurnUpdate {
                    text: Some(self.processing_label.clone()),
                    status: Some(TurnStatus::Processing),
                    is_final: None,
                });
            }
            ServerEvent::PartialTranscription { transcript, text } => {
                let partial = ServerEvent::partial_text(&transcript, &text);
                self.store.lock().update_ephemeral_turn(TurnUpdate {
                    text: Some(partial),
                    status: None,
                    is_final: Some(false),
                });
            }
            ServerEvent::TranscriptionCompleted { transcript } => {
                self.on_final_transcription(transcript.unwrap_or_default());
            }
            ServerEvent::AudioTranscriptDelta { delta } => {
                self.store.lock().append_assistant_delta(&delta);
            }
            ServerEvent::AudioTranscriptDone => {
                self.on_assistant_done();
            }
            ServerEvent::FunctionCallDone {
                name,
                call_id,
                arguments,
            } => {
                self.on_function_call(name, call_id, arguments).await;
            }
            ServerEvent::Unknown => {}
        }
    }

    fn on_final_transcription(&mut self, transcript: String) {
        let is_spanish = self.detectors.is_spanish(&transcript);
        {
            let mut store = self.store.lock();
            if let Some(id) = store.ephemeral_id() {
                let language = if is_spanish {
                    MessageLanguage::Spanish
                } else {
                    MessageLanguage::English
                };
                store.tag_language(id, language);
            }
        }

        if is_spanish && self.detectors.is_repeat_request(&transcript) {
            if let Some(previous) = self.previous_clinician_message.clone() {
                tracing::info!("Patient asked to repeat; replaying last clinician message");
                self.send(ClientEvent::user_message(format!(
                    "The patient asked you to repeat the last message. Please repeat \
                     this message in Spanish: \"{previous}\""
                )));
                self.send(ClientEvent::ResponseCreate);
            }
        }

        self.store.lock().finalize_ephemeral_turn(transcript);
    }

    fn on_assistant_done(&mut self) {
        let Some(text) = self.store.lock().finalize_last_assistant_turn() else {
            return;
        };

        if self.detectors.is_clinician_message(&text) {
            self.previous_clinician_message = Some(text.clone());
        }

        if self.detectors.is_summary_message(&text) {
            self.store.lock().set_summary(&text);
        }

        if self.detectors.is_conversation_ending(&text) {
            {
                let mut store = self.store.lock();
                if !store.has_summary() {
                    // Fallback so the summary view is never empty.
                    store.set_summary(&text);
                }
            }
            self.fire_conversation_end();
        }
    }

    /// Deferred, once-only end-of-conversation notification.
    fn fire_conversation_end(&self) {
        if self.end_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(callback) = self.on_conversation_end.clone() else {
            return;
        };
        let delay = self.end_callback_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
    }

    async fn on_function_call(&mut self, name: String, call_id: String, arguments: String) {
        let Some(handler) = self.registry.lock().get(&name) else {
            tracing::warn!(tool = %name, %call_id, "Tool not registered; ignoring call");
            return;
        };

        let args: Value = match serde_json::from_str(&arguments) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "Malformed tool arguments");
                return;
            }
        };

        // Recorded before the handler runs so user-visible evidence of
        // intent survives a downstream failure. Dedup keeps retried
        // calls from double-counting.
        self.store
            .lock()
            .record_action(DetectedAction::new(&name, args.clone()));

        tracing::info!(tool = %name, %call_id, "Invoking tool");
        let result = match handler.invoke(args).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(tool = %name, error = %e, "Tool handler failed");
                FunctionResult::failure("Tool execution failed", e.to_string())
            }
        };

        if name == GENERATE_SUMMARY {
            if let Some(summary) = result.summary.as_deref() {
                self.store.lock().set_summary(summary);
            }
        }

        match serde_json::to_string(&result) {
            Ok(output) => {
                self.send(ClientEvent::function_output(call_id, output));
                self.send(ClientEvent::ResponseCreate);
            }
            Err(e) => {
                tracing::error!(tool = %name, error = %e, "Tool result failed to serialize");
            }
        }
    }

    fn send(&self, event: ClientEvent) {
        if self.outbound.send(event).is_err() {
            tracing::debug!("Outbound channel closed; dropping event");
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FnTool;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn handler_with_channel() -> (ProtocolHandler, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = ProtocolHandler::new(
            DetectorConfig::default(),
            Arc::new(Mutex::new(ConversationStore::new())),
            Arc::new(Mutex::new(ToolRegistry::new())),
            tx,
            Arc::new(Mutex::new(Vec::new())),
            "Processing speech...",
            Duration::from_millis(10),
        );
        (handler, rx)
    }

    #[tokio::test]
    async fn speech_lifecycle_yields_one_final_turn() {
        let (mut handler, _rx) = handler_with_channel();

        handler
            .handle_raw(r#"{"type":"input_audio_buffer.speech_started"}"#)
            .await;
        handler
            .handle_raw(r#"{"type":"input_audio_buffer.speech_stopped"}"#)
            .await;
        handler
            .handle_raw(r#"{"type":"input_audio_buffer.committed"}"#)
            .await;
        {
            let store = handler.store.lock();
            assert_eq!(store.turns()[0].text, "Processing speech...");
            assert_eq!(store.turns()[0].status, TurnStatus::Processing);
        }
        handler
            .handle_raw(
                r#"{"type":"conversation.item.input_audio_transcription","transcript":"me duele"}"#,
            )
            .await;
        handler
            .handle_raw(
                r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"Me duele la rodilla"}"#,
            )
            .await;

        let store = handler.store.lock();
        assert_eq!(store.turns().len(), 1);
        let turn = &store.turns()[0];
        assert!(turn.is_final);
        assert_eq!(turn.text, "Me duele la rodilla");
        assert!(store.ephemeral_id().is_none());
        assert_eq!(store.language_of(turn.id), Some(MessageLanguage::Spanish));
    }

    #[tokio::test]
    async fn assistant_stream_concatenates_and_finalizes() {
        let (mut handler, _rx) = handler_with_channel();
        handler
            .handle_raw(r#"{"type":"response.audio_transcript.delta","delta":"A"}"#)
            .await;
        handler
            .handle_raw(r#"{"type":"response.audio_transcript.delta","delta":"B"}"#)
            .await;
        handler
            .handle_raw(r#"{"type":"response.audio_transcript.done"}"#)
            .await;

        let store = handler.store.lock();
        assert_eq!(store.turns().len(), 1);
        assert_eq!(store.turns()[0].text, "AB");
        assert!(store.turns()[0].is_final);
    }

    #[tokio::test]
    async fn malformed_json_is_skipped_and_not_logged() {
        let (mut handler, _rx) = handler_with_channel();
        handler.handle_raw("{not json").await;
        assert!(handler.raw_log.lock().is_empty());
        assert!(handler.store.lock().turns().is_empty());
    }

    #[tokio::test]
    async fn unknown_event_kind_is_retained_in_raw_log() {
        let (mut handler, _rx) = handler_with_channel();
        handler
            .handle_raw(r#"{"type":"rate_limits.updated","limits":[]}"#)
            .await;
        assert_eq!(handler.raw_log.lock().len(), 1);
        assert!(handler.store.lock().turns().is_empty());
    }

    #[tokio::test]
    async fn ending_phrase_fires_callback_once_and_sets_fallback_summary() {
        let (mut handler, _rx) = handler_with_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        handler.set_conversation_end_callback(Arc::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let ending = "Thank you for your time, have a great day";
        for _ in 0..2 {
            handler
                .handle_raw(&format!(
                    r#"{{"type":"response.audio_transcript.delta","delta":"{ending}"}}"#
                ))
                .await;
            handler
                .handle_raw(r#"{"type":"response.audio_transcript.done"}"#)
                .await;
        }

        assert_eq!(handler.store.lock().summary(), ending);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_summary_is_not_overwritten_by_ending_fallback() {
        let (mut handler, _rx) = handler_with_channel();
        handler.store.lock().set_summary("SUMMARY: real one");
        handler
            .handle_raw(r#"{"type":"response.audio_transcript.delta","delta":"Gracias por su tiempo"}"#)
            .await;
        handler
            .handle_raw(r#"{"type":"response.audio_transcript.done"}"#)
            .await;
        assert_eq!(handler.store.lock().summary(), "SUMMARY: real one");
    }

    #[tokio::test]
    async fn tool_call_records_action_and_emits_output_pair() {
        let (mut handler, mut rx) = handler_with_channel();
        handler.registry.lock().register(
            "sendLabOrder",
            Arc::new(FnTool(|_args| async {
                Ok(FunctionResult::ok("Lab order sent successfully"))
            })),
        );

        let raw = r#"{"type":"response.function_call_arguments.done","name":"sendLabOrder","call_id":"c1","arguments":"{\"patientName\":\"Jane\",\"testType\":\"CBC\"}"}"#;
        handler.handle_raw(raw).await;

        {
            let store = handler.store.lock();
            assert_eq!(store.actions().len(), 1);
            assert_eq!(store.actions()[0].action_type, "sendLabOrder");
            assert_eq!(store.actions()[0].data["patientName"], "Jane");
        }

        match rx.try_recv().unwrap() {
            ClientEvent::ItemCreate {
                item: events::ConversationItem::FunctionCallOutput { call_id, output },
            } => {
                assert_eq!(call_id, "c1");
                assert!(output.contains("\"success\":true"));
            }
            other => panic!("unexpected outbound event: {other:?}"),
        }
        assert!(matches!(rx.try_recv().unwrap(), ClientEvent::ResponseCreate));

        // Byte-identical retry deduplicates the action but still answers.
        handler.handle_raw(raw).await;
        assert_eq!(handler.store.lock().actions().len(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn failing_tool_reports_failure_result() {
        let (mut handler, mut rx) = handler_with_channel();
        handler.registry.lock().register(
            "sendLabOrder",
            Arc::new(FnTool(|_args| async { anyhow::bail!("printer jam") })),
        );

        handler
            .handle_raw(
                r#"{"type":"response.function_call_arguments.done","name":"sendLabOrder","call_id":"c2","arguments":"{}"}"#,
            )
            .await;

        match rx.try_recv().unwrap() {
            ClientEvent::ItemCreate {
                item: events::ConversationItem::FunctionCallOutput { output, .. },
            } => {
                assert!(output.contains("\"success\":false"));
                assert!(output.contains("printer jam"));
            }
            other => panic!("unexpected outbound event: {other:?}"),
        }
        // The action is not rolled back.
        assert_eq!(handler.store.lock().actions().len(), 1);
    }

    #[tokio::test]
    async fn unregistered_tool_is_ignored() {
        let (mut handler, mut rx) = handler_with_channel();
        handler
            .handle_raw(
                r#"{"type":"response.function_call_arguments.done","name":"nope","call_id":"c3","arguments":"{}"}"#,
            )
            .await;
        assert!(rx.try_recv().is_err());
        assert!(handler.store.lock().actions().is_empty());
    }

    #[tokio::test]
    async fn spanish_repeat_request_replays_cached_clinician_message() {
        let (mut handler, mut rx) = handler_with_channel();

        // Assistant delivers a clinician-voiced message first.
        handler
            .handle_raw(
                r#"{"type":"response.audio_transcript.delta","delta":"You should rest the knee and apply ice today"}"#,
            )
            .await;
        handler
            .handle_raw(r#"{"type":"response.audio_transcript.done"}"#)
            .await;

        handler
            .handle_raw(r#"{"type":"input_audio_buffer.speech_started"}"#)
            .await;
        handler
            .handle_raw(
                r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"No entendí, ¿puedes repetir?"}"#,
            )
            .await;

        match rx.try_recv().unwrap() {
            ClientEvent::ItemCreate {
                item: events::ConversationItem::Message { role, content },
            } => {
                assert_eq!(role, "user");
                let events::ContentPart::InputText { text } = &content[0];
                assert!(text.contains("rest the knee"));
                assert!(text.contains("Spanish"));
            }
            other => panic!("unexpected outbound event: {other:?}"),
        }
        assert!(matches!(rx.try_recv().unwrap(), ClientEvent::ResponseCreate));
    }

    #[tokio::test]
    async fn send_after_teardown_is_silent() {
        let (mut handler, rx) = handler_with_channel();
        handler.registry.lock().register(
            "sendLabOrder",
            Arc::new(FnTool(|_args| async { Ok(FunctionResult::ok("ok")) })),
        );
        drop(rx);

        // A tool resolving into a torn-down channel must not panic and
        // still records the action locally.
        handler
            .handle_raw(
                r#"{"type":"response.function_call_arguments.done","name":"sendLabOrder","call_id":"c5","arguments":"{}"}"#,
            )
            .await;
        assert_eq!(handler.store.lock().actions().len(), 1);
    }

    #[tokio::test]
    async fn summary_tool_result_updates_summary_slot() {
        let (mut handler, _rx) = handler_with_channel();
        handler.registry.lock().register(
            GENERATE_SUMMARY,
            Arc::new(FnTool(|_args| async {
                Ok(FunctionResult::ok("done").with_summary("SUMMARY: via tool"))
            })),
        );
        handler
            .handle_raw(&format!(
                r#"{{"type":"response.function_call_arguments.done","name":"{GENERATE_SUMMARY}","call_id":"c4","arguments":"{{}}"}}"#
            ))
            .await;
        assert_eq!(handler.store.lock().summary(), "SUMMARY: via tool");
    }
}
