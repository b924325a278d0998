//! Tool registry: named, schema-described capabilities the remote model
//! can invoke.
//!
//! The registry maps tool names to async handlers supplied by the host
//! application. Descriptors (the declaration format the session
//! configuration event expects) are carried separately in
//! [`crate::config::SessionConfig`], matching the split between "what the
//! model sees" and "what runs locally".

pub mod clinic;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Descriptor schema ──────────────────────────────────────────────

/// Declaration of a tool in the wire format the remote service expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ToolParameters>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameters {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: HashMap<String, ToolProperty>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProperty {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
}

impl ToolDescriptor {
    /// Start a `type: "function"` descriptor with an empty object schema.
    pub fn function(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: "function".into(),
            name: name.into(),
            description: description.into(),
            parameters: Some(ToolParameters {
                kind: "object".into(),
                properties: HashMap::new(),
                required: Vec::new(),
            }),
        }
    }

    /// Add a string/boolean/... property to the parameter schema.
    pub fn property(
        mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
        description: impl Into<String>,
        allowed: Option<Vec<String>>,
    ) -> Self {
        if let Some(params) = self.parameters.as_mut() {
            params.properties.insert(
                name.into(),
                ToolProperty {
                    kind: kind.into(),
                    description: description.into(),
                    allowed,
                },
            );
        }
        self
    }

    /// Mark properties as required.
    pub fn required(mut self, names: &[&str]) -> Self {
        if let Some(params) = self.parameters.as_mut() {
            params.required = names.iter().map(|n| (*n).to_string()).collect();
        }
        self
    }
}

// ── Results and handlers ───────────────────────────────────────────

/// Outcome of a tool invocation, serialized back to the remote service
/// as the function-call output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl FunctionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            summary: None,
        }
    }

    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// An application-side handler backing a registered tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, args: Value) -> anyhow::Result<FunctionResult>;
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnTool<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<FunctionResult>> + Send,
{
    async fn invoke(&self, args: Value) -> anyhow::Result<FunctionResult> {
        (self.0)(args).await
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// Name → handler mapping. Last registration wins per name.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a handler under the given name.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        let name = name.into();
        tracing::debug!(tool = %name, "Registering tool handler");
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
