//! Sandbox policy enforcement.
//!
//! The enforcer sits between every binding invocation and the native
//! handler: a call is dispatched only after the context's active
//! [`PermissionPolicy`] grants every tag the capability requires.
//! Policies are immutable snapshots replaced wholesale, so concurrent
//! readers never observe a partially updated grant set.

use crate::audit::{AuditEvent, AuditSink};
use crate::context::ContextHandle;
use crate::registry::{Capability, PermissionTag};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Snapshot of granted permission tags for one context.
///
/// Replaced wholesale via [`PolicyEnforcer::set_policy`]; never patched
/// incrementally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionPolicy {
    granted: BTreeSet<PermissionTag>,
}

impl PermissionPolicy {
    /// Create an empty policy (denies every gated capability)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a policy from an iterator of tags
    pub fn from_tags<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<PermissionTag>,
    {
        Self {
            granted: tags.into_iter().map(Into::into).collect(),
        }
    }

    /// Grant a tag
    pub fn grant(mut self, tag: impl Into<PermissionTag>) -> Self {
        self.granted.insert(tag.into());
        self
    }

    /// Whether a tag is granted
    pub fn grants(&self, tag: &PermissionTag) -> bool {
        self.granted.contains(tag)
    }

    /// Number of granted tags
    pub fn len(&self) -> usize {
        self.granted.len()
    }

    /// Whether no tags are granted
    pub fn is_empty(&self) -> bool {
        self.granted.is_empty()
    }
}

/// Authorization decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Every required tag is granted
    Allowed,
    /// One or more required tags are missing
    Denied {
        /// The missing tags, in sorted order
        missing: Vec<PermissionTag>,
    },
}

impl Decision {
    /// Whether the decision permits dispatch
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Intercepts every capability invocation and checks it against the
/// context's active policy before dispatch.
pub struct PolicyEnforcer {
    policies: DashMap<ContextHandle, RwLock<Arc<PermissionPolicy>>>,
    sink: Arc<dyn AuditSink>,
}

impl PolicyEnforcer {
    /// Create an enforcer emitting decisions to the given sink
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            policies: DashMap::new(),
            sink,
        }
    }

    /// Replace a context's policy wholesale.
    ///
    /// Atomic with respect to concurrent [`authorize`](Self::authorize)
    /// calls: readers observe either the previous or the new snapshot,
    /// never a mixture.
    pub fn set_policy(&self, context: ContextHandle, policy: PermissionPolicy) {
        let policy = Arc::new(policy);
        match self.policies.entry(context) {
            Entry::Occupied(slot) => {
                *slot.get().write() = policy;
            }
            Entry::Vacant(slot) => {
                slot.insert(RwLock::new(policy));
            }
        }
        debug!(context = %context, "permission policy replaced");
    }

    /// The active policy snapshot for a context (empty if none was set)
    pub fn policy(&self, context: ContextHandle) -> Arc<PermissionPolicy> {
        self.policies
            .get(&context)
            .map(|slot| Arc::clone(&slot.value().read()))
            .unwrap_or_default()
    }

    /// Discard a context's policy on invalidation
    pub fn drop_context(&self, context: ContextHandle) {
        self.policies.remove(&context);
    }

    /// Check a capability invocation against the context's policy.
    ///
    /// All required tags must be granted (conjunctive). Both outcomes
    /// are recorded to the audit sink; a sink failure is logged and
    /// never delays the call.
    pub fn authorize(&self, context: ContextHandle, capability: &Capability) -> Decision {
        let snapshot = self.policy(context);

        let missing: Vec<PermissionTag> = capability
            .required_permissions()
            .iter()
            .filter(|tag| !snapshot.grants(tag))
            .cloned()
            .collect();

        let decision = if missing.is_empty() {
            Decision::Allowed
        } else {
            Decision::Denied {
                missing: missing.clone(),
            }
        };

        let event = match &decision {
            Decision::Allowed => AuditEvent::allowed(context, capability.name()),
            Decision::Denied { missing } => AuditEvent::denied(
                context,
                capability.name(),
                missing.iter().map(ToString::to_string).collect(),
            ),
        };
        if let Err(err) = self.sink.record(event) {
            warn!(
                context = %context,
                capability = %capability.name(),
                error = %err,
                "audit sink write failed"
            );
        }

        decision
    }
}
