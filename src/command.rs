//! Per-submission metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries audit and correlation information without polluting the entity's
/// `Command` or `Event` types. Every event produced by the command is stamped
/// with this context in its journal record.
///
/// # Examples
///
/// ```
/// use eventfold_engine::CommandContext;
/// use serde_json::json;
///
/// let ctx = CommandContext::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_metadata(json!({"source": "api"}));
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert!(!ctx.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of whoever issued the command (e.g. a user ID).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Arbitrary metadata copied onto each journal record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl CommandContext {
    /// Set the actor identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set arbitrary metadata.
    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }

    /// Returns `true` if no field is set.
    ///
    /// Empty contexts are not written to the journal.
    pub fn is_empty(&self) -> bool {
        self.actor.is_none() && self.correlation_id.is_none() && self.metadata.is_none()
    }
}
