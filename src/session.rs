//! Public-facing session orchestrator.
//!
//! [`SessionController`] composes the transport and the protocol handler
//! behind start / stop / toggle / send-text / register-tool operations
//! and exposes the aggregated observable state (status label, activity
//! flag, conversation snapshot, volume levels). One controller manages
//! at most one live session at a time; stop-then-start is always safe
//! because teardown is awaited, not fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::archive::{ConversationArchive, MemoryArchive};
use crate::config::SessionConfig;
use crate::convo::{ConversationStore, ConversationTurn, DetectedAction, Role};
use crate::detect::DetectorConfig;
use crate::error::{Result, SessionError};
use crate::protocol::events::ClientEvent;
use crate::protocol::ProtocolHandler;
use crate::tools::{clinic, ToolHandler, ToolRegistry};
use crate::transport::audio::{AudioSink, NullSink};
use crate::transport::SessionTransport;

/// UI-observable session state.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub status: String,
    pub is_active: bool,
}

pub struct SessionController {
    config: SessionConfig,
    detectors: DetectorConfig,
    store: Arc<Mutex<ConversationStore>>,
    registry: Arc<Mutex<ToolRegistry>>,
    state: Arc<Mutex<SessionState>>,
    raw_log: Arc<Mutex<Vec<Value>>>,
    archive: Arc<dyn ConversationArchive>,
    sink: Arc<dyn AudioSink>,
    on_conversation_end: Option<Arc<dyn Fn() + Send + Sync>>,
    transport: Option<SessionTransport>,
    outbound_tx: Option<mpsc::UnboundedSender<ClientEvent>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl SessionController {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            detectors: DetectorConfig::default(),
            store: Arc::new(Mutex::new(ConversationStore::new())),
            registry: Arc::new(Mutex::new(ToolRegistry::new())),
            state: Arc::new(Mutex::new(SessionState::default())),
            raw_log: Arc::new(Mutex::new(Vec::new())),
            archive: Arc::new(MemoryArchive::default()),
            sink: Arc::new(NullSink),
            on_conversation_end: None,
            transport: None,
            outbound_tx: None,
            dispatcher: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn ConversationArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_detectors(mut self, detectors: DetectorConfig) -> Self {
        self.detectors = detectors;
        self
    }

    /// Callback fired once when the conversation is detected to be over
    /// (ending phrase or the end-session tool).
    pub fn set_conversation_end_callback(&mut self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.on_conversation_end = Some(callback);
    }

    /// Insert or overwrite a tool handler.
    pub fn register_tool(&self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.registry.lock().register(name, handler);
    }

    /// Register the built-in clinic tool set against this controller's
    /// store and archive.
    pub fn register_clinic_tools(&self) {
        let on_end = self
            .on_conversation_end
            .clone()
            .unwrap_or_else(|| Arc::new(|| {}));
        clinic::register_all(
            &mut self.registry.lock(),
            Arc::clone(&self.store),
            Arc::clone(&self.archive),
            self.config.webhook_url.clone(),
            on_end,
            self.config.tool_followup_delay,
        );
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Establish a session. No-op when one is already active. On
    /// failure the status carries the error detail and every acquired
    /// resource has been released.
    pub async fn start(&mut self) -> Result<()> {
        if self.state.lock().is_active {
            tracing::debug!("Session already active; start ignored");
            return Ok(());
        }
        self.set_status("Starting session...");

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<String>();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ClientEvent>();

        let mut handler = ProtocolHandler::new(
            self.detectors.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            outbound_tx.clone(),
            Arc::clone(&self.raw_log),
            self.config.processing_label.clone(),
            self.config.end_callback_delay,
        );
        if let Some(callback) = &self.on_conversation_end {
            handler.set_conversation_end_callback(Arc::clone(callback));
        }
        // Inbound events are handled strictly in arrival order by this
        // single consumer task.
        let dispatcher = tokio::spawn(async move {
            while let Some(raw) = inbound_rx.recv().await {
                handler.handle_raw(&raw).await;
            }
        });

        let status_state = Arc::clone(&self.state);
        let on_status = move |label: &str| {
            tracing::info!(status = label, "Session status");
            status_state.lock().status = label.to_string();
        };

        match SessionTransport::connect(
            &self.config,
            inbound_tx,
            outbound_rx,
            Arc::clone(&self.sink),
            on_status,
        )
        .await
        {
            Ok(transport) => {
                self.transport = Some(transport);
                self.outbound_tx = Some(outbound_tx);
                self.dispatcher = Some(dispatcher);
                let mut state = self.state.lock();
                state.is_active = true;
                state.status = "Session established successfully!".to_string();
                Ok(())
            }
            Err(e) => {
                dispatcher.abort();
                let mut state = self.state.lock();
                state.is_active = false;
                state.status = format!("Error: {e}");
                drop(state);
                tracing::error!(error = %e, "Session start failed");
                Err(e)
            }
        }
    }

    /// Tear the session down. Idempotent; waits for the transport to
    /// finish releasing its resources. Conversation turns and the raw
    /// diagnostic log are cleared; detected actions and the summary
    /// survive into the post-session view.
    pub async fn stop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        self.outbound_tx = None;
        self.store.lock().reset();
        self.raw_log.lock().clear();

        let mut state = self.state.lock();
        state.is_active = false;
        state.status = "Session stopped".to_string();
    }

    /// Stop-then-start. Teardown is awaited before reconnecting; the
    /// settle delay gives device handles time to fully release.
    pub async fn toggle(&mut self) -> Result<()> {
        if self.state.lock().is_active {
            self.stop().await;
            tokio::time::sleep(self.config.settle_delay).await;
        }
        self.start().await
    }

    /// Drop accumulated actions and summary, then start fresh.
    pub async fn new_conversation(&mut self) -> Result<()> {
        self.stop().await;
        {
            let mut store = self.store.lock();
            store.clear_actions();
            store.clear_summary();
        }
        tokio::time::sleep(self.config.settle_delay).await;
        self.start().await
    }

    /// Send a typed user message. Requires the side channel to be open.
    /// The turn is echoed into the conversation immediately.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let open = self
            .transport
            .as_ref()
            .is_some_and(SessionTransport::is_channel_open);
        let Some(outbound) = self.outbound_tx.as_ref().filter(|_| open) else {
            return Err(SessionError::Protocol(
                "cannot send text: side channel not open".to_string(),
            ));
        };

        let text = text.into();
        self.store.lock().push_final_turn(Role::User, &text);
        outbound
            .send(ClientEvent::user_message(text))
            .and_then(|_| outbound.send(ClientEvent::ResponseCreate))
            .map_err(|_| SessionError::Protocol("side channel closed mid-send".to_string()))
    }

    // ── Observers ──────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().is_active
    }

    pub fn status(&self) -> String {
        self.state.lock().status.clone()
    }

    /// RMS level of the remote audio being played back.
    pub fn current_volume(&self) -> f32 {
        self.transport
            .as_ref()
            .map(SessionTransport::remote_volume)
            .unwrap_or(0.0)
    }

    /// RMS level of the captured microphone signal.
    pub fn local_volume(&self) -> f32 {
        self.transport
            .as_ref()
            .map(SessionTransport::local_volume)
            .unwrap_or(0.0)
    }

    pub fn conversation(&self) -> Vec<ConversationTurn> {
        self.store.lock().snapshot()
    }

    pub fn actions(&self) -> Vec<DetectedAction> {
        self.store.lock().actions().to_vec()
    }

    pub fn summary(&self) -> String {
        self.store.lock().summary().to_string()
    }

    /// Raw inbound events retained for diagnostics during the session.
    pub fn raw_event_count(&self) -> usize {
        self.raw_log.lock().len()
    }

    fn set_status(&self, status: &str) {
        self.state.lock().status = status.to_string();
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn stop_is_idempotent_without_start() {
        let mut controller = SessionController::new(SessionConfig::default());
        controller.stop().await;
        controller.stop().await;
        assert!(!controller.is_active());
        assert!(controller.conversation().is_empty());
        assert_eq!(controller.status(), "Session stopped");
    }

    #[tokio::test]
    async fn send_text_without_session_is_rejected() {
        let controller = SessionController::new(SessionConfig::default());
        let err = controller.send_text("hello").unwrap_err();
        assert!(err.to_string().contains("side channel"));
        assert!(controller.conversation().is_empty());
    }

    #[tokio::test]
    async fn failed_credential_fetch_reports_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut controller = SessionController::new(SessionConfig::new(server.uri()));
        let err = controller.start().await.unwrap_err();
        assert!(err.to_string().contains("500"));
        assert!(!controller.is_active());
        assert!(controller.status().starts_with("Error:"));
    }

    #[tokio::test]
    async fn failed_negotiation_tears_down_cleanly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"client_secret": {"value": "ek_test"}})),
            )
            .mount(&server)
            .await;

        let mut config = SessionConfig::new(format!("{}/api/session", server.uri()));
        // Point negotiation at a port nothing listens on.
        config.realtime_url = "http://127.0.0.1:9".to_string();

        let mut controller = SessionController::new(config);
        assert!(controller.start().await.is_err());
        assert!(!controller.is_active());
        assert!(controller.transport.is_none());

        // A second start attempt is still possible after the failure.
        assert!(controller.start().await.is_err());
    }

    #[tokio::test]
    async fn stop_preserves_actions_and_summary() {
        let mut controller = SessionController::new(SessionConfig::default());
        {
            let mut store = controller.store.lock();
            store.push_final_turn(Role::User, "hola");
            store.record_action(DetectedAction::new("sendLabOrder", json!({})));
            store.set_summary("SUMMARY: visit");
        }
        controller.raw_log.lock().push(json!({"type": "noise"}));

        controller.stop().await;
        assert!(controller.conversation().is_empty());
        assert_eq!(controller.raw_event_count(), 0);
        assert_eq!(controller.actions().len(), 1);
        assert_eq!(controller.summary(), "SUMMARY: visit");
    }

    #[tokio::test]
    async fn clinic_tools_register_against_controller() {
        let controller = SessionController::new(SessionConfig::default());
        controller.register_clinic_tools();
        let registry = controller.registry.lock();
        assert!(registry.get(clinic::SCHEDULE_FOLLOWUP).is_some());
        assert!(registry.get(clinic::SEND_LAB_ORDER).is_some());
        assert!(registry.get(clinic::GENERATE_SUMMARY).is_some());
        assert!(registry.get(clinic::END_SESSION).is_some());
    }

    #[tokio::test]
    async fn volume_is_zero_without_transport() {
        let controller = SessionController::new(SessionConfig::default());
        assert_eq!(controller.current_volume(), 0.0);
        assert_eq!(controller.local_volume(), 0.0);
    }
}
