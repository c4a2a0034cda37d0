//! Audit sink for authorization decisions.
//!
//! Every authorization decision — allow and deny alike — is emitted as
//! an [`AuditEvent`]. Sinks are append-only and best-effort: a failed
//! write is logged and swallowed, never failing or delaying the
//! capability call that produced it. Sink implementations must not
//! block.

use crate::context::ContextHandle;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of an authorization decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// All required permission tags were granted
    Allowed,
    /// One or more required permission tags were missing
    Denied,
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditOutcome::Allowed => write!(f, "allowed"),
            AuditOutcome::Denied => write!(f, "denied"),
        }
    }
}

/// A single authorization decision record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unique event id
    pub id: Uuid,

    /// Decision time
    pub timestamp: DateTime<Utc>,

    /// Identity of the context the call targeted
    pub context: ContextHandle,

    /// Capability that was invoked
    pub capability: String,

    /// Decision outcome
    pub outcome: AuditOutcome,

    /// Missing permission tags (empty when allowed)
    pub missing: Vec<String>,
}

impl AuditEvent {
    /// Create an allowed-decision event
    pub fn allowed(context: ContextHandle, capability: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            context,
            capability: capability.into(),
            outcome: AuditOutcome::Allowed,
            missing: Vec::new(),
        }
    }

    /// Create a denied-decision event naming the missing tags
    pub fn denied(
        context: ContextHandle,
        capability: impl Into<String>,
        missing: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            context,
            capability: capability.into(),
            outcome: AuditOutcome::Denied,
            missing,
        }
    }
}

/// Append-only destination for audit events.
///
/// Implementations must be non-blocking; the enforcer emits on the
/// invocation path.
pub trait AuditSink: Send + Sync {
    /// Record one event. Errors are logged by the caller and otherwise
    /// ignored.
    fn record(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Default sink that writes decisions to the tracing subscriber
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        match event.outcome {
            AuditOutcome::Allowed => info!(
                context = %event.context,
                capability = %event.capability,
                outcome = %event.outcome,
                "capability authorized"
            ),
            AuditOutcome::Denied => warn!(
                context = %event.context,
                capability = %event.capability,
                outcome = %event.outcome,
                missing = ?event.missing,
                "capability denied"
            ),
        }
        Ok(())
    }
}

/// In-memory sink for tests and host integrations that inspect the
/// audit trail directly
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create a new, empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether no events have been recorded
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
