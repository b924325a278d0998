//! Built-in clinic tools: follow-up scheduling, lab orders, summary
//! generation, and session end.
//!
//! The scheduling and lab-order tools forward their payload to an
//! external webhook collaborator; the summary and end-session tools work
//! against the conversation store and archive. Action bookkeeping
//! (recording + dedup) happens in the protocol handler before the
//! handler runs, so these tools only perform their side effect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;

use super::{FunctionResult, ToolDescriptor, ToolHandler, ToolRegistry};
use crate::archive::ConversationArchive;
use crate::convo::{ConversationStore, ConversationTurn, DetectedAction, Role};

/// Tool names as the remote model invokes them.
pub const SCHEDULE_FOLLOWUP: &str = "scheduleFollowupAppointment";
pub const SEND_LAB_ORDER: &str = "sendLabOrder";
pub const GENERATE_SUMMARY: &str = "generateConversationSummary";
pub const END_SESSION: &str = "endSession";

/// Descriptor set declared to the remote service for the clinic tools.
pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::function(
            SCHEDULE_FOLLOWUP,
            "Schedule a follow-up appointment for the patient",
        )
        .property("patientName", "string", "The name of the patient", None)
        .property(
            "timeframe",
            "string",
            "When the appointment should be scheduled (e.g., '2 weeks', '3 months')",
            None,
        )
        .property(
            "reason",
            "string",
            "The reason for the follow-up appointment",
            None,
        )
        .required(&["patientName", "timeframe"]),
        ToolDescriptor::function(SEND_LAB_ORDER, "Send a lab order for the patient")
            .property("patientName", "string", "The name of the patient", None)
            .property("testType", "string", "The type of lab test to order", None)
            .property(
                "urgency",
                "string",
                "The urgency of the lab order",
                Some(vec!["routine".into(), "urgent".into(), "stat".into()]),
            )
            .required(&["patientName", "testType"]),
        ToolDescriptor::function(GENERATE_SUMMARY, "Generate a summary of the conversation")
            .property(
                "includeActions",
                "boolean",
                "Whether to include detected actions in the summary",
                None,
            ),
        ToolDescriptor::function(
            END_SESSION,
            "End the current session and redirect to the summary page",
        )
        .property(
            "reason",
            "string",
            "The reason for ending the session (e.g., 'conversation complete', 'all questions answered')",
            None,
        )
        .property(
            "autoGenerateSummary",
            "boolean",
            "Whether to automatically generate a summary before ending",
            None,
        )
        .required(&["reason"]),
    ]
}

/// Register all four clinic tools against the shared store and archive.
pub fn register_all(
    registry: &mut ToolRegistry,
    store: Arc<Mutex<ConversationStore>>,
    archive: Arc<dyn ConversationArchive>,
    webhook_url: Option<String>,
    on_session_end: Arc<dyn Fn() + Send + Sync>,
    end_delay: Duration,
) {
    let http = reqwest::Client::new();
    registry.register(
        SCHEDULE_FOLLOWUP,
        Arc::new(WebhookTool {
            action: SCHEDULE_FOLLOWUP,
            webhook_url: webhook_url.clone(),
            http: http.clone(),
            ok_message: "Follow-up appointment scheduled successfully",
            fail_message: "Failed to schedule appointment",
        }),
    );
    registry.register(
        SEND_LAB_ORDER,
        Arc::new(WebhookTool {
            action: SEND_LAB_ORDER,
            webhook_url,
            http,
            ok_message: "Lab order sent successfully",
            fail_message: "Failed to send lab order",
        }),
    );

    let core = SummaryCore {
        store: Arc::clone(&store),
        archive: Arc::clone(&archive),
    };
    registry.register(
        GENERATE_SUMMARY,
        Arc::new(SummaryTool { core: core.clone() }),
    );
    registry.register(
        END_SESSION,
        Arc::new(EndSessionTool {
            core,
            on_session_end,
            delay: end_delay,
        }),
    );
}

// ── Webhook-backed actions ─────────────────────────────────────────

/// Forwards the tool payload to the clinic webhook endpoint, keyed by
/// action name, mirroring the collaborator's `{ "<action>": args }`
/// envelope.
struct WebhookTool {
    action: &'static str,
    webhook_url: Option<String>,
    http: reqwest::Client,
    ok_message: &'static str,
    fail_message: &'static str,
}

#[async_trait]
impl ToolHandler for WebhookTool {
    async fn invoke(&self, args: Value) -> anyhow::Result<FunctionResult> {
        let Some(url) = self.webhook_url.as_deref() else {
            // No webhook configured; the action is still recorded upstream.
            return Ok(FunctionResult::ok(self.ok_message));
        };

        let body = serde_json::json!({ self.action: args });
        let response = self.http.post(url).json(&body).send().await;
        match response {
            Ok(resp) if resp.status().is_success() => Ok(FunctionResult::ok(self.ok_message)),
            Ok(resp) => {
                let status = resp.status();
                tracing::error!(action = self.action, %status, "Webhook rejected action");
                Ok(FunctionResult::failure(
                    self.fail_message,
                    format!("webhook returned {status}"),
                ))
            }
            Err(e) => {
                tracing::error!(action = self.action, error = %e, "Webhook request failed");
                Ok(FunctionResult::failure(self.fail_message, e.to_string()))
            }
        }
    }
}

// ── Summary generation ─────────────────────────────────────────────

#[derive(Clone)]
struct SummaryCore {
    store: Arc<Mutex<ConversationStore>>,
    archive: Arc<dyn ConversationArchive>,
}

impl SummaryCore {
    /// Generate (or reuse) the summary, persist the conversation, and
    /// return the result. A persistence failure still leaves a locally
    /// synthesized summary behind so the summary view is never empty.
    async fn generate_and_save(&self, include_actions: bool, force: bool) -> FunctionResult {
        let (turns, actions, existing) = {
            let store = self.store.lock();
            (
                store.snapshot(),
                store.actions().to_vec(),
                store.summary().to_string(),
            )
        };

        let summary = if existing.trim().is_empty() || force {
            let generated = compose_summary(&turns, &actions, include_actions);
            self.store.lock().set_summary(&generated);
            generated
        } else {
            existing
        };

        match self
            .archive
            .save(turns, summary.clone(), actions.clone())
            .await
        {
            Ok(id) => {
                tracing::info!(record_id = %id, "Conversation summary generated and saved");
                FunctionResult::ok("Conversation summary generated and conversation saved")
                    .with_summary(summary)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to save conversation");
                let fallback = format!(
                    "Summary of conversation (generated after an error occurred):\n\n\
                     Conversation between doctor and patient with {} detected actions.",
                    actions.len()
                );
                self.store.lock().set_summary(&fallback);
                FunctionResult::failure(
                    "Error generating detailed summary, basic summary created",
                    e.to_string(),
                )
                .with_summary(fallback)
            }
        }
    }

    /// Persist the conversation as-is, without generating a new summary.
    async fn save_current(&self) -> anyhow::Result<String> {
        let (turns, actions, summary) = {
            let store = self.store.lock();
            (
                store.snapshot(),
                store.actions().to_vec(),
                store.summary().to_string(),
            )
        };
        self.archive.save(turns, summary, actions).await
    }
}

/// Synthesize the plain-text consultation summary.
fn compose_summary(
    turns: &[ConversationTurn],
    actions: &[DetectedAction],
    include_actions: bool,
) -> String {
    let mut summary = String::from(
        "SUMMARY:\n\nThis conversation included a medical consultation between a doctor and patient. ",
    );

    if include_actions && !actions.is_empty() {
        summary.push_str("\n\nActions detected during the conversation:\n");
        for action in actions {
            let line = match action.action_type.as_str() {
                SCHEDULE_FOLLOWUP => format!(
                    "- Follow-up appointment scheduled for patient {} in {} for reason: {}\n",
                    field(&action.data, "patientName"),
                    field(&action.data, "timeframe"),
                    field_or(&action.data, "reason", "General follow-up"),
                ),
                SEND_LAB_ORDER => format!(
                    "- Lab order sent for patient {}, test type: {}, urgency: {}\n",
                    field(&action.data, "patientName"),
                    field(&action.data, "testType"),
                    field_or(&action.data, "urgency", "routine"),
                ),
                other => format!("- {other}: {}\n", action.data),
            };
            summary.push_str(&line);
        }
    }
    if actions.is_empty() {
        summary.push_str(
            "\nNo specific follow-up appointments or lab orders were detected during this conversation.",
        );
    }

    let patient_messages = turns.iter().filter(|t| t.role == Role::User && t.is_final).count();
    let doctor_messages = turns
        .iter()
        .filter(|t| t.role == Role::Assistant && t.is_final)
        .count();
    summary.push_str(&format!(
        "\n\nThe conversation consisted of {patient_messages} patient messages and \
         {doctor_messages} doctor/interpreter messages."
    ));
    summary
}

fn field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn field_or(data: &Value, key: &str, fallback: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct SummaryArgs {
    include_actions: Option<bool>,
    force_generate: bool,
}

struct SummaryTool {
    core: SummaryCore,
}

#[async_trait]
impl ToolHandler for SummaryTool {
    async fn invoke(&self, args: Value) -> anyhow::Result<FunctionResult> {
        let args: SummaryArgs = serde_json::from_value(args).unwrap_or_default();
        Ok(self
            .core
            .generate_and_save(args.include_actions.unwrap_or(true), args.force_generate)
            .await)
    }
}

// ── Session end ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EndSessionArgs {
    reason: String,
    auto_generate_summary: bool,
}

impl Default for EndSessionArgs {
    fn default() -> Self {
        Self {
            reason: "The conversation is complete".into(),
            auto_generate_summary: false,
        }
    }
}

struct EndSessionTool {
    core: SummaryCore,
    on_session_end: Arc<dyn Fn() + Send + Sync>,
    delay: Duration,
}

#[async_trait]
impl ToolHandler for EndSessionTool {
    async fn invoke(&self, args: Value) -> anyhow::Result<FunctionResult> {
        let args: EndSessionArgs = serde_json::from_value(args).unwrap_or_default();
        tracing::info!(reason = %args.reason, "Ending session by tool request");

        if args.auto_generate_summary {
            self.core.generate_and_save(true, false).await;
        } else if let Err(e) = self.core.save_current().await {
            tracing::error!(error = %e, "Failed to save conversation data");
            return Ok(FunctionResult::failure(
                "Failed to end session properly",
                e.to_string(),
            ));
        }

        // Deferred so the remote service can finish speaking its
        // confirmation before the host tears the view down.
        let callback = Arc::clone(&self.on_session_end);
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });

        Ok(FunctionResult::ok("Session ended successfully"))
    }
}

// ── Tests ──────────────────────────────────────────────────────────
