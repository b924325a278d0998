//! Session configuration.
//!
//! Plain data with sensible defaults; the host overrides what it needs.
//! The credential endpoint is the only required deployment-specific
//! value: everything else defaults to the standard interpreter setup.

use std::time::Duration;

use crate::tools::ToolDescriptor;

/// Everything needed to establish and run an interpreter session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Endpoint that mints short-lived session credentials. The real
    /// API key never passes through this crate.
    pub credential_url: String,
    /// Base URL for the realtime signaling exchange.
    pub realtime_url: String,
    /// Model requested during signaling.
    pub model: String,
    /// Voice requested during signaling.
    pub voice: String,
    /// Transcription model declared in the session-configuration event.
    pub transcription_model: String,
    /// Session modalities declared to the remote service.
    pub modalities: Vec<String>,
    /// Instruction text sent once when the control channel opens.
    pub language_prompt: String,
    /// Placeholder shown on a user turn after speech stops but before
    /// the transcript arrives.
    pub processing_label: String,
    /// Tool declarations advertised to the remote service.
    pub tools: Vec<ToolDescriptor>,
    /// Delay before the conversation-end callback fires, so closing
    /// audio can play out.
    pub end_callback_delay: Duration,
    /// Settle delay between stop and start when restarting a session.
    pub settle_delay: Duration,
    /// Delay before the end-session tool's callback fires.
    pub tool_followup_delay: Duration,
    /// Optional clinic webhook receiving scheduling / lab-order payloads.
    pub webhook_url: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credential_url: "/api/session".into(),
            realtime_url: "https://api.openai.com/v1/realtime".into(),
            model: "gpt-4o-realtime-preview-2024-12-17".into(),
            voice: "ash".into(),
            transcription_model: "whisper-1".into(),
            modalities: vec!["text".into(), "audio".into()],
            language_prompt: "Speak and respond only in English. It is crucial that you \
                              maintain your responses in English. If the user speaks in \
                              other languages, you should still respond in English."
                .into(),
            processing_label: "Processing speech...".into(),
            tools: crate::tools::clinic::descriptors(),
            end_callback_delay: Duration::from_millis(1000),
            settle_delay: Duration::from_millis(150),
            tool_followup_delay: Duration::from_millis(500),
            webhook_url: None,
        }
    }
}

impl SessionConfig {
    pub fn new(credential_url: impl Into<String>) -> Self {
        Self {
            credential_url: credential_url.into(),
            ..Self::default()
        }
    }
}
