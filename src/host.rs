//! Host adapter.
//!
//! The only component touching host-specific integration details. It
//! registers the bridge as a single discoverable module and converts
//! host-runtime lifecycle events (context creation, teardown, reload)
//! into calls on the [`LifecycleManager`].
//!
//! Hosts reach installation through one of two compatibility paths:
//! the automatic binding-installation hook ([`SandboxBridgeModule::install_hook`])
//! where the host runtime supports it, or the explicit legacy call
//! taking a [`BridgeSession`] ([`SandboxBridgeModule::install_with_session`]).
//! Both converge on the same idempotent `ensure_installed`; the split
//! is a capability-detection shim, not two behaviors.

use crate::audit::{AuditSink, TracingAuditSink};
use crate::binding::{PendingResult, PendingTicket};
use crate::config::BridgeConfig;
use crate::context::{ContextHandle, InstallOutcome, LifecycleManager};
use crate::error::Result;
use crate::installer::ScriptContext;
use crate::metrics::BridgeMetrics;
use crate::policy::{PermissionPolicy, PolicyEnforcer};
use crate::registry::CapabilityRegistry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Legacy bridge/session handle passed by hosts without an automatic
/// install hook
#[derive(Debug, Clone)]
pub struct BridgeSession {
    handle: ContextHandle,
    label: Option<String>,
}

impl BridgeSession {
    /// Create a session wrapping a context handle
    pub fn new(handle: ContextHandle) -> Self {
        Self {
            handle,
            label: None,
        }
    }

    /// Attach a host-side label for logs
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// The wrapped context handle
    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    /// The host-side label, if any
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

/// The discoverable bridge module exposed to the host.
///
/// One instance owns the lifecycle manager, mints generation-tagged
/// context handles, and exposes the installation entry points.
pub struct SandboxBridgeModule {
    lifecycle: Arc<LifecycleManager>,
    slots: DashMap<u64, u64>,
    config: BridgeConfig,
}

impl SandboxBridgeModule {
    /// Create a module over the process-wide capability registry with
    /// the default tracing audit sink
    pub fn new(config: BridgeConfig) -> Result<Self> {
        Self::with_parts(
            config,
            CapabilityRegistry::global(),
            Arc::new(TracingAuditSink),
        )
    }

    /// Create a module with an injected registry and audit sink
    pub fn with_parts(
        config: BridgeConfig,
        registry: Arc<CapabilityRegistry>,
        sink: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(BridgeMetrics::new());
        let enforcer = Arc::new(PolicyEnforcer::new(sink));
        let lifecycle = Arc::new(LifecycleManager::new(
            registry,
            enforcer,
            &config,
            metrics,
        ));

        info!(namespace = %config.namespace, "sandbox bridge module ready");

        Ok(Self {
            lifecycle,
            slots: DashMap::new(),
            config,
        })
    }

    /// The active configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The lifecycle manager driving installations
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Mint a handle for a newly created context slot.
    ///
    /// Re-creating a slot (e.g. after a host reload) yields a fresh
    /// generation, so stale handles from the previous lifetime miss
    /// every lookup.
    pub fn context_created(&self, slot_id: u64) -> ContextHandle {
        let generation = {
            let mut entry = self.slots.entry(slot_id).or_insert(0);
            *entry += 1;
            *entry
        };

        let handle = ContextHandle::new(slot_id, generation);
        info!(context = %handle, "context created");
        handle
    }

    /// Automatic install path, invoked by the host's binding
    /// installation hook
    pub fn install_hook(
        &self,
        handle: ContextHandle,
        ctx: &dyn ScriptContext,
    ) -> Result<InstallOutcome> {
        debug!(context = %handle, "install via automatic hook");
        self.lifecycle.ensure_installed(handle, ctx)
    }

    /// Legacy install path, invoked explicitly with a bridge session
    pub fn install_with_session(
        &self,
        session: &BridgeSession,
        ctx: &dyn ScriptContext,
    ) -> Result<InstallOutcome> {
        debug!(
            context = %session.handle(),
            label = session.label().unwrap_or("-"),
            "install via legacy session"
        );
        self.lifecycle.ensure_installed(session.handle(), ctx)
    }

    /// Host-delivered invalidation signal (context destroyed or
    /// replaced)
    pub fn context_invalidated(&self, handle: ContextHandle) {
        self.lifecycle.notify_invalidated(handle);
    }

    /// Availability probe: whether bindings are installed and live for
    /// this handle
    pub fn is_installed(&self, handle: ContextHandle) -> bool {
        self.lifecycle.is_installed(handle)
    }

    /// Replace the permission policy for a context
    pub fn set_policy(&self, handle: ContextHandle, policy: PermissionPolicy) {
        self.lifecycle.enforcer().set_policy(handle, policy);
    }

    /// Take the receiver for a deferred capability call
    pub fn subscribe_pending(
        &self,
        ticket: PendingTicket,
    ) -> Option<oneshot::Receiver<PendingResult>> {
        self.lifecycle.pending().subscribe(ticket)
    }

    /// Resolve a deferred capability call (no-op for invalidated
    /// contexts)
    pub fn complete_pending(&self, ticket: PendingTicket, result: PendingResult) {
        self.lifecycle.pending().complete(ticket, result);
    }

    /// The bridge metrics collector
    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        self.lifecycle.metrics()
    }

    /// Export Prometheus-format metrics
    pub fn prometheus_metrics(&self) -> String {
        self.lifecycle.metrics().to_prometheus()
    }
}

/// Initialize tracing for hosts that have no subscriber of their own.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditOutcome, MemoryAuditSink};
    use crate::binding::{CapabilityOutcome, InvokeReply};
    use crate::error::{BridgeError, ErrorCode};
    use crate::installer::MemoryScriptContext;
    use crate::registry::Capability;
    use crate::value::ScriptValue;
    use std::sync::atomic::{AtomicU32, Ordering};

    const NS: &str = "__sandboxBridge";

    fn create_module(registry: Arc<CapabilityRegistry>) -> (SandboxBridgeModule, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let module = SandboxBridgeModule::with_parts(
            BridgeConfig::default(),
            registry,
            Arc::clone(&sink) as Arc<dyn AuditSink>,
        )
        .unwrap();
        (module, sink)
    }

    fn clipboard_registry() -> Arc<CapabilityRegistry> {
        let registry = CapabilityRegistry::new();
        registry
            .register(
                Capability::new("readClipboard", |_inv| {
                    Ok(CapabilityOutcome::Value("clipboard contents".into()))
                })
                .with_permission("clipboard.read"),
            )
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = SandboxBridgeModule::with_parts(
            BridgeConfig::new().with_namespace(""),
            Arc::new(CapabilityRegistry::new()),
            Arc::new(TracingAuditSink),
        );
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_both_install_paths_converge() {
        let (module, _sink) = create_module(clipboard_registry());
        let ctx = MemoryScriptContext::new();

        let handle = module.context_created(1);
        let first = module.install_hook(handle, &ctx).unwrap();
        assert_eq!(first, InstallOutcome::Installed { count: 1 });

        // The legacy path on the same context is the idempotent no-op
        let session = BridgeSession::new(handle).with_label("legacy app");
        let second = module.install_with_session(&session, &ctx).unwrap();
        assert!(second.is_noop());
        assert_eq!(ctx.binding_count(NS), 1);
        assert!(module.is_installed(handle));
    }

    #[test]
    fn test_clipboard_deny_then_allow_scenario() {
        let (module, sink) = create_module(clipboard_registry());
        let ctx = MemoryScriptContext::new();

        let handle = module.context_created(1);
        module.install_hook(handle, &ctx).unwrap();

        // Policy is empty: the call is denied, loudly
        let err = ctx.call(NS, "readClipboard", vec![]).unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
        assert!(err.message.contains("clipboard.read"));

        // Grant the tag and the same call succeeds
        module.set_policy(handle, PermissionPolicy::new().grant("clipboard.read"));
        let reply = ctx.call(NS, "readClipboard", vec![]).unwrap();
        assert_eq!(
            reply.as_value(),
            Some(&ScriptValue::from("clipboard contents"))
        );

        // Exactly two audit records for this capability: denied, then
        // allowed
        let events: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| e.capability == "readClipboard")
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, AuditOutcome::Denied);
        assert_eq!(events[1].outcome, AuditOutcome::Allowed);
    }

    #[test]
    fn test_denied_call_never_reaches_handler() {
        let invocations = Arc::new(AtomicU32::new(0));
        let probe = Arc::clone(&invocations);

        let registry = CapabilityRegistry::new();
        registry
            .register(
                Capability::new("deleteEverything", move |_inv| {
                    probe.fetch_add(1, Ordering::SeqCst);
                    Ok(CapabilityOutcome::Value(ScriptValue::Null))
                })
                .with_permission("fs.write"),
            )
            .unwrap();

        let (module, _sink) = create_module(Arc::new(registry));
        let ctx = MemoryScriptContext::new();
        let handle = module.context_created(1);
        module.install_hook(handle, &ctx).unwrap();

        for _ in 0..3 {
            let err = ctx.call(NS, "deleteEverything", vec![]).unwrap_err();
            assert_eq!(err.code, ErrorCode::PermissionDenied);
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert_eq!(module.metrics().denials(), 3);
    }

    #[test]
    fn test_rollback_leaves_zero_bindings() {
        let registry = CapabilityRegistry::new();
        for name in ["alpha", "beta", "gamma"] {
            registry
                .register(Capability::new(name, |_inv| {
                    Ok(CapabilityOutcome::Value(ScriptValue::Null))
                }))
                .unwrap();
        }

        let (module, _sink) = create_module(Arc::new(registry));
        let ctx = MemoryScriptContext::new();
        let handle = module.context_created(1);

        ctx.fail_bind_on("gamma");
        let err = module.install_hook(handle, &ctx).unwrap_err();
        assert!(matches!(err, BridgeError::Install(_)));
        assert_eq!(ctx.binding_count(NS), 0);
        assert!(!ctx.has_root(NS));
        assert!(!module.is_installed(handle));

        // Retryable after the failure is cleared
        ctx.clear_fail();
        module.install_hook(handle, &ctx).unwrap();
        assert_eq!(ctx.binding_count(NS), 3);
    }

    #[test]
    fn test_invalidation_and_reload() {
        let (module, _sink) = create_module(clipboard_registry());

        let ctx_v1 = MemoryScriptContext::new();
        let handle_v1 = module.context_created(1);
        module.install_hook(handle_v1, &ctx_v1).unwrap();
        module.set_policy(handle_v1, PermissionPolicy::new().grant("clipboard.read"));

        module.context_invalidated(handle_v1);

        // Stale-handle invocation fails with a defined error
        let err = ctx_v1.call(NS, "readClipboard", vec![]).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);

        // Reinstall into the recreated slot under a new generation
        let ctx_v2 = MemoryScriptContext::new();
        let handle_v2 = module.context_created(1);
        assert_ne!(handle_v1, handle_v2);
        module.install_hook(handle_v2, &ctx_v2).unwrap();
        assert!(module.is_installed(handle_v2));
        assert!(!module.is_installed(handle_v1));

        // The old lifetime's policy did not leak into the new one
        let err = ctx_v2.call(NS, "readClipboard", vec![]).unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_pending_completion_through_module() {
        let registry = CapabilityRegistry::new();
        registry
            .register(Capability::new("fetchLater", |inv: &crate::binding::Invocation| {
                let completion = inv.defer()?;
                Ok(CapabilityOutcome::Pending(completion.ticket()))
            }))
            .unwrap();

        let (module, _sink) = create_module(Arc::new(registry));
        let ctx = MemoryScriptContext::new();
        let handle = module.context_created(1);
        module.install_hook(handle, &ctx).unwrap();

        let reply = ctx.call(NS, "fetchLater", vec![]).unwrap();
        let ticket = match reply {
            InvokeReply::Pending(t) => t,
            InvokeReply::Value(_) => panic!("expected pending reply"),
        };

        let receiver = module.subscribe_pending(ticket).unwrap();
        module.complete_pending(ticket, Ok("resolved".into()));
        assert_eq!(receiver.await.unwrap().unwrap(), ScriptValue::from("resolved"));
    }

    #[test]
    fn test_prometheus_export_through_module() {
        let (module, _sink) = create_module(clipboard_registry());
        let ctx = MemoryScriptContext::new();
        let handle = module.context_created(1);
        module.install_hook(handle, &ctx).unwrap();
        let _ = ctx.call(NS, "readClipboard", vec![]);

        let output = module.prometheus_metrics();
        assert!(output.contains("sandbox_bridge_installs_total 1"));
        assert!(output.contains("sandbox_bridge_denials_total 1"));
    }
}
