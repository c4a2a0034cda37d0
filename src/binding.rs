//! Script-callable capability bindings.
//!
//! A [`CapabilityBinding`] is the wrapper the installer attaches under
//! the namespace root for each registered capability. Every invocation
//! runs the same pipeline: context liveness check, policy
//! authorization, argument marshalling, native dispatch, result
//! marshalling. All failures surface as catchable [`ScriptError`]s;
//! nothing thrown from a binding may tear down the context or the host.
//!
//! Long-running native work must not block the context's cooperative
//! thread: handlers defer via [`Invocation::defer`] and complete the
//! returned ticket from another thread, which resolves a pending value
//! on the script side. Completions for invalidated contexts are
//! dropped.

use crate::context::{ContextHandle, ContextTracker};
use crate::error::ScriptError;
use crate::metrics::BridgeMetrics;
use crate::policy::{Decision, PolicyEnforcer};
use crate::registry::{Capability, ParamSpec};
use crate::value::ScriptValue;
use anyhow::bail;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Result delivered to a pending-call subscriber
pub type PendingResult = std::result::Result<ScriptValue, ScriptError>;

/// Opaque ticket identifying one deferred capability call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingTicket(Uuid);

impl fmt::Display for PendingTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a native handler produced
#[derive(Debug)]
pub enum CapabilityOutcome {
    /// A script-representable value, returned synchronously
    Value(ScriptValue),
    /// The call was deferred; the ticket resolves later
    Pending(PendingTicket),
}

/// What a binding invocation returns to the engine integration
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeReply {
    /// Synchronous return value
    Value(ScriptValue),
    /// Deferred call; the engine resolves the script-side pending value
    /// when the ticket completes
    Pending(PendingTicket),
}

impl InvokeReply {
    /// The synchronous value, if any
    pub fn as_value(&self) -> Option<&ScriptValue> {
        match self {
            InvokeReply::Value(v) => Some(v),
            InvokeReply::Pending(_) => None,
        }
    }
}

/// One capability call as seen by the native handler
pub struct Invocation {
    context: ContextHandle,
    capability: String,
    args: Vec<ScriptValue>,
    pending: Arc<PendingCalls>,
    deferred: Mutex<Option<PendingTicket>>,
}

impl Invocation {
    pub(crate) fn new(
        context: ContextHandle,
        capability: impl Into<String>,
        args: Vec<ScriptValue>,
        pending: Arc<PendingCalls>,
    ) -> Self {
        Self {
            context,
            capability: capability.into(),
            args,
            pending,
            deferred: Mutex::new(None),
        }
    }

    /// Identity of the calling context
    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// Name of the invoked capability
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Marshalled script arguments
    pub fn args(&self) -> &[ScriptValue] {
        &self.args
    }

    /// One marshalled argument by position
    pub fn arg(&self, index: usize) -> Option<&ScriptValue> {
        self.args.get(index)
    }

    /// Defer this call.
    ///
    /// Registers a pending ticket and returns its completion handle.
    /// The handler moves the completion into whatever native work it
    /// dispatches and returns [`CapabilityOutcome::Pending`] with the
    /// completion's ticket.
    pub fn defer(&self) -> anyhow::Result<PendingCompletion> {
        let ticket = self.pending.reserve(self.context, &self.capability)?;
        *self.deferred.lock() = Some(ticket);
        Ok(PendingCompletion {
            ticket,
            pending: Arc::clone(&self.pending),
        })
    }

    pub(crate) fn deferred_ticket(&self) -> Option<PendingTicket> {
        *self.deferred.lock()
    }
}

/// Completion handle for a deferred capability call
pub struct PendingCompletion {
    ticket: PendingTicket,
    pending: Arc<PendingCalls>,
}

impl PendingCompletion {
    /// The ticket identifying this deferred call
    pub fn ticket(&self) -> PendingTicket {
        self.ticket
    }

    /// Resolve the deferred call.
    ///
    /// A no-op if the owning context has been invalidated since the
    /// call was deferred.
    pub fn complete(self, result: PendingResult) {
        self.pending.complete(self.ticket, result);
    }
}

struct PendingEntry {
    context: ContextHandle,
    capability: String,
    sender: Option<oneshot::Sender<PendingResult>>,
    receiver: Option<oneshot::Receiver<PendingResult>>,
}

/// Table of in-flight deferred capability calls.
///
/// Completions are checked against context liveness: a ticket whose
/// context was invalidated mid-call resolves to nothing, never to a
/// dangling script interaction.
pub struct PendingCalls {
    tracker: Arc<ContextTracker>,
    entries: DashMap<Uuid, PendingEntry>,
    capacity: usize,
}

impl PendingCalls {
    /// Create a table bounded at `capacity` in-flight calls
    pub fn new(tracker: Arc<ContextTracker>, capacity: usize) -> Self {
        Self {
            tracker,
            entries: DashMap::new(),
            capacity,
        }
    }

    pub(crate) fn reserve(
        &self,
        context: ContextHandle,
        capability: &str,
    ) -> anyhow::Result<PendingTicket> {
        if self.entries.len() >= self.capacity {
            bail!("pending call table at capacity ({})", self.capacity);
        }

        let (sender, receiver) = oneshot::channel();
        let id = Uuid::new_v4();
        self.entries.insert(
            id,
            PendingEntry {
                context,
                capability: capability.to_string(),
                sender: Some(sender),
                receiver: Some(receiver),
            },
        );
        debug!(context = %context, capability = %capability, ticket = %id, "call deferred");

        Ok(PendingTicket(id))
    }

    /// Take the receiver for a ticket.
    ///
    /// The engine integration awaits it to resolve the script-side
    /// pending value; a closed channel means the call was cancelled by
    /// context invalidation. A completion that raced ahead of the
    /// subscription is buffered in the returned receiver.
    pub fn subscribe(&self, ticket: PendingTicket) -> Option<oneshot::Receiver<PendingResult>> {
        let receiver = self
            .entries
            .get_mut(&ticket.0)
            .and_then(|mut entry| entry.receiver.take());

        if receiver.is_some() {
            let resolved = self
                .entries
                .get(&ticket.0)
                .map(|entry| entry.sender.is_none())
                .unwrap_or(false);
            if resolved {
                self.entries.remove(&ticket.0);
            }
        }

        receiver
    }

    /// Resolve a ticket. No-op if the owning context is no longer live.
    pub fn complete(&self, ticket: PendingTicket, result: PendingResult) {
        match self.entries.remove(&ticket.0) {
            Some((id, mut entry)) => {
                if !self.tracker.is_live(entry.context) {
                    debug!(
                        context = %entry.context,
                        capability = %entry.capability,
                        ticket = %ticket,
                        "completion dropped for invalidated context"
                    );
                    return;
                }
                if let Some(sender) = entry.sender.take() {
                    let _ = sender.send(result);
                }
                if entry.receiver.is_some() {
                    // Not subscribed yet; the value stays buffered in
                    // the stored receiver until the engine claims it.
                    self.entries.insert(id, entry);
                }
            }
            None => {
                warn!(ticket = %ticket, "completion for unknown ticket");
            }
        }
    }

    /// Cancel every in-flight call owned by a context.
    ///
    /// Dropped senders close the subscribed receivers, which observe
    /// cancellation instead of a value.
    pub fn cancel_context(&self, context: ContextHandle) {
        self.entries.retain(|_, entry| entry.context != context);
    }

    /// Number of in-flight deferred calls
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no calls are in flight
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Script-callable wrapper installed for one capability in one context
pub struct CapabilityBinding {
    capability: Arc<Capability>,
    context: ContextHandle,
    enforcer: Arc<PolicyEnforcer>,
    tracker: Arc<ContextTracker>,
    pending: Arc<PendingCalls>,
    metrics: Arc<BridgeMetrics>,
}

impl CapabilityBinding {
    pub(crate) fn new(
        capability: Arc<Capability>,
        context: ContextHandle,
        enforcer: Arc<PolicyEnforcer>,
        tracker: Arc<ContextTracker>,
        pending: Arc<PendingCalls>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            capability,
            context,
            enforcer,
            tracker,
            pending,
            metrics,
        }
    }

    /// The bound capability's name
    pub fn name(&self) -> &str {
        self.capability.name()
    }

    /// Identity of the context this binding was installed into
    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// Invoke the capability from script.
    ///
    /// Runs liveness, authorization and marshalling checks before the
    /// native handler; every failure is a catchable [`ScriptError`].
    pub fn invoke(&self, args: Vec<ScriptValue>) -> std::result::Result<InvokeReply, ScriptError> {
        if !self.tracker.is_live(self.context) {
            return self.fail(ScriptError::context_gone(self.context));
        }

        if let Decision::Denied { missing } = self.enforcer.authorize(self.context, &self.capability)
        {
            self.metrics.record_denial();
            return self.fail(ScriptError::permission_denied(
                self.capability.name(),
                missing.iter().map(ToString::to_string).collect(),
            ));
        }

        if let Err(err) = validate_args(self.capability.params(), &args) {
            return self.fail(err);
        }

        let invocation = Invocation::new(
            self.context,
            self.capability.name(),
            args,
            Arc::clone(&self.pending),
        );

        let outcome = match catch_unwind(AssertUnwindSafe(|| self.capability.call(&invocation))) {
            Err(_) => {
                error!(
                    context = %self.context,
                    capability = %self.capability.name(),
                    "native handler panicked"
                );
                return self.fail(ScriptError::internal());
            }
            Ok(Err(err)) => {
                error!(
                    context = %self.context,
                    capability = %self.capability.name(),
                    error = %err,
                    "native handler failed"
                );
                return self.fail(ScriptError::internal());
            }
            Ok(Ok(outcome)) => outcome,
        };

        // The context may have been invalidated while the handler ran;
        // its completion becomes a no-op rather than a context
        // interaction.
        if !self.tracker.is_live(self.context) {
            debug!(
                context = %self.context,
                capability = %self.capability.name(),
                "context invalidated mid-call; result dropped"
            );
            return self.fail(ScriptError::context_gone(self.context));
        }

        let reply = match outcome {
            CapabilityOutcome::Value(value) => InvokeReply::Value(value),
            CapabilityOutcome::Pending(ticket) => {
                if invocation.deferred_ticket() != Some(ticket) {
                    error!(
                        context = %self.context,
                        capability = %self.capability.name(),
                        "handler returned a pending outcome without deferring"
                    );
                    return self.fail(ScriptError::internal());
                }
                InvokeReply::Pending(ticket)
            }
        };

        self.metrics.record_invocation(true);
        Ok(reply)
    }

    fn fail(&self, err: ScriptError) -> std::result::Result<InvokeReply, ScriptError> {
        self.metrics.record_invocation(false);
        self.metrics.record_error(&err.code.to_string());
        Err(err)
    }
}

/// Validate marshalled arguments against the capability's declared
/// parameters
fn validate_args(
    params: &[ParamSpec],
    args: &[ScriptValue],
) -> std::result::Result<(), ScriptError> {
    if args.len() > params.len() {
        return Err(ScriptError::argument_type(format!(
            "expected at most {} argument(s), got {}",
            params.len(),
            args.len()
        )));
    }

    for (index, param) in params.iter().enumerate() {
        match args.get(index) {
            None => {
                if param.required {
                    return Err(ScriptError::argument_type(format!(
                        "missing required argument '{}'",
                        param.name
                    )));
                }
            }
            Some(ScriptValue::Null) if !param.required => {}
            Some(value) => {
                if value.type_of() != param.ty {
                    return Err(ScriptError::mismatch(&param.name, param.ty, value.type_of()));
                }
            }
        }
    }

    Ok(())
}
