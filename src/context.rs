//! Context identity and lifecycle management.
//!
//! Execution contexts are tracked by generation-tagged [`ContextHandle`]
//! identity, never by engine pointers, so any use after invalidation is
//! a checked lookup failure. The [`LifecycleManager`] drives the
//! per-context state machine `Unbound -> Installing -> Installed ->
//! Invalidated` and guarantees idempotent installation.

use crate::binding::PendingCalls;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::installer::{BindingInstaller, ScriptContext};
use crate::metrics::BridgeMetrics;
use crate::policy::PolicyEnforcer;
use crate::registry::CapabilityRegistry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Opaque identity of a live execution context.
///
/// The id names a context slot in the host; the generation counter
/// distinguishes successive lifetimes of that slot (e.g. across a host
/// reload). Handles are compared for equality only and are never
/// dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextHandle {
    id: u64,
    generation: u64,
}

impl ContextHandle {
    /// Create a handle for a context slot and lifetime generation
    pub fn new(id: u64, generation: u64) -> Self {
        Self { id, generation }
    }

    /// The context slot id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The lifetime generation of the slot
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}.{}", self.id, self.generation)
    }
}

/// Per-context installation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// No bindings installed
    Unbound,
    /// An installation attempt is in flight
    Installing,
    /// Bindings installed and live
    Installed,
    /// Context destroyed or replaced (terminal)
    Invalidated,
}

/// Record of one successful installation into a live context
#[derive(Debug, Clone)]
pub struct InstallationRecord {
    /// Identity of the installed context
    pub handle: ContextHandle,

    /// Names of the capabilities bound into the context
    pub installed: Vec<String>,

    /// Installation generation counter, distinguishing successive
    /// independent installations
    pub install_generation: u64,
}

struct TrackedContext {
    generation: u64,
    state: ContextState,
    install_lock: Arc<Mutex<()>>,
}

impl TrackedContext {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            state: ContextState::Unbound,
            install_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Identity-keyed table of context lifetimes.
///
/// Shared between the lifecycle manager and the bindings it installs;
/// bindings consult it so that invocations against a dead context fail
/// with a defined error instead of touching the engine.
pub struct ContextTracker {
    slots: DashMap<u64, TrackedContext>,
}

impl ContextTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Start tracking a handle's lifetime.
    ///
    /// A handle with a newer generation supersedes the slot's previous
    /// lifetime; stale (older-generation) handles are ignored.
    pub fn observe(&self, handle: ContextHandle) {
        let mut slot = self
            .slots
            .entry(handle.id())
            .or_insert_with(|| TrackedContext::new(handle.generation()));
        if handle.generation() > slot.generation {
            if slot.state != ContextState::Invalidated {
                warn!(
                    context = %handle,
                    superseded = slot.generation,
                    "context lifetime superseded without invalidation notice"
                );
            }
            *slot = TrackedContext::new(handle.generation());
        }
    }

    /// The current state of a handle's lifetime, if it is the slot's
    /// current generation
    pub fn state(&self, handle: ContextHandle) -> Option<ContextState> {
        self.slots.get(&handle.id()).and_then(|slot| {
            (slot.generation == handle.generation()).then_some(slot.state)
        })
    }

    /// Whether the handle refers to the current, non-invalidated
    /// lifetime of its slot
    pub fn is_live(&self, handle: ContextHandle) -> bool {
        matches!(
            self.state(handle),
            Some(ContextState::Unbound | ContextState::Installing | ContextState::Installed)
        )
    }

    /// Whether bindings are installed and live for this handle
    pub fn is_installed(&self, handle: ContextHandle) -> bool {
        self.state(handle) == Some(ContextState::Installed)
    }

    fn install_lock(&self, handle: ContextHandle) -> Option<Arc<Mutex<()>>> {
        self.slots.get(&handle.id()).and_then(|slot| {
            (slot.generation == handle.generation()).then(|| Arc::clone(&slot.install_lock))
        })
    }

    // Never leaves the terminal state: a context invalidated while an
    // install was in flight stays invalidated.
    fn set_state(&self, handle: ContextHandle, state: ContextState) -> bool {
        match self.slots.get_mut(&handle.id()) {
            Some(mut slot)
                if slot.generation == handle.generation()
                    && slot.state != ContextState::Invalidated =>
            {
                slot.state = state;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn invalidate(&self, handle: ContextHandle) -> bool {
        match self.slots.get_mut(&handle.id()) {
            Some(mut slot)
                if slot.generation == handle.generation()
                    && slot.state != ContextState::Invalidated =>
            {
                slot.state = ContextState::Invalidated;
                true
            }
            _ => false,
        }
    }
}

impl Default for ContextTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of an `ensure_installed` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Bindings were installed by this call
    Installed {
        /// Number of capabilities bound
        count: usize,
    },
    /// The context already had live bindings; nothing was done
    AlreadyInstalled,
}

impl InstallOutcome {
    /// Whether this call performed no installation work
    pub fn is_noop(&self) -> bool {
        matches!(self, InstallOutcome::AlreadyInstalled)
    }
}

/// Tracks which contexts have bindings installed and drives idempotent
/// installation and invalidation.
pub struct LifecycleManager {
    registry: Arc<CapabilityRegistry>,
    enforcer: Arc<PolicyEnforcer>,
    installer: BindingInstaller,
    tracker: Arc<ContextTracker>,
    records: DashMap<ContextHandle, InstallationRecord>,
    pending: Arc<PendingCalls>,
    metrics: Arc<BridgeMetrics>,
    install_generation: AtomicU64,
}

impl LifecycleManager {
    /// Create a lifecycle manager wiring the installer to the given
    /// registry, enforcer and configuration
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        enforcer: Arc<PolicyEnforcer>,
        config: &BridgeConfig,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        let tracker = Arc::new(ContextTracker::new());
        let pending = Arc::new(PendingCalls::new(
            Arc::clone(&tracker),
            config.max_pending_calls,
        ));
        let installer = BindingInstaller::new(
            config.namespace.clone(),
            Arc::clone(&enforcer),
            Arc::clone(&tracker),
            Arc::clone(&pending),
            Arc::clone(&metrics),
        );

        Self {
            registry,
            enforcer,
            installer,
            tracker,
            records: DashMap::new(),
            pending,
            metrics,
            install_generation: AtomicU64::new(0),
        }
    }

    /// The context tracker shared with installed bindings
    pub fn tracker(&self) -> &Arc<ContextTracker> {
        &self.tracker
    }

    /// The policy enforcer routing every invocation
    pub fn enforcer(&self) -> &Arc<PolicyEnforcer> {
        &self.enforcer
    }

    /// The pending-call table for async capability completions
    pub fn pending(&self) -> &Arc<PendingCalls> {
        &self.pending
    }

    /// The bridge metrics collector
    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }

    /// The installation record for a context, if installed
    pub fn record(&self, handle: ContextHandle) -> Option<InstallationRecord> {
        self.records.get(&handle).map(|r| r.value().clone())
    }

    /// Install bindings into a context if they are not installed yet.
    ///
    /// Idempotent: calling on an installed, still-live context is a
    /// no-op success. Concurrent calls for the same context collapse
    /// into a single installation attempt. On failure the context is
    /// rolled back to `Unbound` and the call may be retried.
    #[instrument(skip(self, ctx), fields(context = %handle))]
    pub fn ensure_installed(
        &self,
        handle: ContextHandle,
        ctx: &dyn ScriptContext,
    ) -> Result<InstallOutcome> {
        self.tracker.observe(handle);

        let lock = self
            .tracker
            .install_lock(handle)
            .ok_or(BridgeError::ContextInvalidated(handle))?;
        let _guard = lock.lock();

        match self.tracker.state(handle) {
            None | Some(ContextState::Invalidated) => {
                return Err(BridgeError::ContextInvalidated(handle));
            }
            Some(ContextState::Installed) => {
                debug!("bindings already installed");
                return Ok(InstallOutcome::AlreadyInstalled);
            }
            Some(ContextState::Unbound | ContextState::Installing) => {}
        }

        self.tracker.set_state(handle, ContextState::Installing);

        // First installation closes the registration phase.
        self.registry.seal();

        match self.installer.install(handle, ctx, &self.registry) {
            Ok(count) => {
                if !self.tracker.set_state(handle, ContextState::Installed) {
                    warn!("context invalidated during installation");
                    return Err(BridgeError::ContextInvalidated(handle));
                }
                let install_generation = self.install_generation.fetch_add(1, Ordering::SeqCst) + 1;
                self.records.insert(
                    handle,
                    InstallationRecord {
                        handle,
                        installed: self.registry.all_names(),
                        install_generation,
                    },
                );
                self.metrics.record_install();
                info!(count = count, install_generation, "bindings installed");
                Ok(InstallOutcome::Installed { count })
            }
            Err(err) => {
                self.tracker.set_state(handle, ContextState::Unbound);
                warn!(error = %err, "installation failed; context left unbound");
                Err(BridgeError::Install(err))
            }
        }
    }

    /// Handle a host-delivered invalidation signal for a context.
    ///
    /// Discards the installation record and policy, cancels pending
    /// capability completions, and marks the lifetime terminal. Safe to
    /// call for unknown or already-invalidated handles.
    #[instrument(skip(self), fields(context = %handle))]
    pub fn notify_invalidated(&self, handle: ContextHandle) {
        if self.tracker.invalidate(handle) {
            info!("context invalidated");
            self.metrics.record_invalidation();
        } else {
            debug!("invalidation for unknown or stale context");
        }

        self.records.remove(&handle);
        self.enforcer.drop_context(handle);
        self.pending.cancel_context(handle);
    }

    /// Whether bindings are installed and live for this handle
    pub fn is_installed(&self, handle: ContextHandle) -> bool {
        self.tracker.is_installed(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::binding::CapabilityOutcome;
    use crate::installer::MemoryScriptContext;
    use crate::registry::Capability;
    use crate::value::ScriptValue;

    fn create_manager(registry: Arc<CapabilityRegistry>) -> LifecycleManager {
        let enforcer = Arc::new(PolicyEnforcer::new(Arc::new(TracingAuditSink)));
        LifecycleManager::new(
            registry,
            enforcer,
            &BridgeConfig::default(),
            Arc::new(BridgeMetrics::new()),
        )
    }

    fn registry_with(names: &[&str]) -> Arc<CapabilityRegistry> {
        let registry = CapabilityRegistry::new();
        for name in names {
            registry
                .register(Capability::new(*name, |_inv| {
                    Ok(CapabilityOutcome::Value(ScriptValue::Null))
                }))
                .unwrap();
        }
        Arc::new(registry)
    }

    #[test]
    fn test_handle_identity() {
        let a = ContextHandle::new(1, 1);
        let b = ContextHandle::new(1, 2);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "ctx-1.1");
    }

    #[test]
    fn test_install_and_record() {
        let manager = create_manager(registry_with(&["alpha", "beta"]));
        let ctx = MemoryScriptContext::new();
        let handle = ContextHandle::new(1, 1);

        let outcome = manager.ensure_installed(handle, &ctx).unwrap();
        assert_eq!(outcome, InstallOutcome::Installed { count: 2 });
        assert!(manager.is_installed(handle));

        let record = manager.record(handle).unwrap();
        assert_eq!(record.installed, vec!["alpha", "beta"]);
        assert_eq!(record.install_generation, 1);
    }

    #[test]
    fn test_ensure_installed_is_idempotent() {
        let manager = create_manager(registry_with(&["alpha"]));
        let ctx = MemoryScriptContext::new();
        let handle = ContextHandle::new(1, 1);

        manager.ensure_installed(handle, &ctx).unwrap();
        let second = manager.ensure_installed(handle, &ctx).unwrap();
        assert!(second.is_noop());
        assert_eq!(ctx.binding_count(BridgeConfig::default().namespace.as_str()), 1);
    }

    #[test]
    fn test_install_seals_registry() {
        let registry = registry_with(&["alpha"]);
        let manager = create_manager(Arc::clone(&registry));
        let ctx = MemoryScriptContext::new();

        assert!(!registry.is_sealed());
        manager
            .ensure_installed(ContextHandle::new(1, 1), &ctx)
            .unwrap();
        assert!(registry.is_sealed());
    }

    #[test]
    fn test_failed_install_leaves_context_unbound_and_retryable() {
        let manager = create_manager(registry_with(&["alpha", "beta", "gamma"]));
        let ctx = MemoryScriptContext::new();
        let handle = ContextHandle::new(1, 1);

        ctx.fail_bind_on("beta");
        let err = manager.ensure_installed(handle, &ctx).unwrap_err();
        assert!(matches!(err, BridgeError::Install(_)));
        assert_eq!(manager.tracker().state(handle), Some(ContextState::Unbound));
        assert!(manager.record(handle).is_none());

        ctx.clear_fail();
        let outcome = manager.ensure_installed(handle, &ctx).unwrap();
        assert_eq!(outcome, InstallOutcome::Installed { count: 3 });
    }

    #[test]
    fn test_invalidation_is_terminal() {
        let manager = create_manager(registry_with(&["alpha"]));
        let ctx = MemoryScriptContext::new();
        let handle = ContextHandle::new(1, 1);

        manager.ensure_installed(handle, &ctx).unwrap();
        manager.notify_invalidated(handle);

        assert!(!manager.is_installed(handle));
        assert!(manager.record(handle).is_none());
        let err = manager.ensure_installed(handle, &ctx).unwrap_err();
        assert!(matches!(err, BridgeError::ContextInvalidated(_)));
    }

    #[test]
    fn test_reinstall_into_new_generation() {
        let manager = create_manager(registry_with(&["alpha"]));
        let handle_v1 = ContextHandle::new(1, 1);
        let handle_v2 = ContextHandle::new(1, 2);

        let ctx_v1 = MemoryScriptContext::new();
        manager.ensure_installed(handle_v1, &ctx_v1).unwrap();
        manager.notify_invalidated(handle_v1);

        let ctx_v2 = MemoryScriptContext::new();
        let outcome = manager.ensure_installed(handle_v2, &ctx_v2).unwrap();
        assert_eq!(outcome, InstallOutcome::Installed { count: 1 });
        assert!(manager.is_installed(handle_v2));
        assert!(!manager.is_installed(handle_v1));
        assert_eq!(manager.record(handle_v2).unwrap().install_generation, 2);
    }

    #[test]
    fn test_invalidation_of_unknown_handle_is_safe() {
        let manager = create_manager(registry_with(&["alpha"]));
        manager.notify_invalidated(ContextHandle::new(9, 9));
    }

    #[test]
    fn test_concurrent_ensure_installed_collapses() {
        let manager = Arc::new(create_manager(registry_with(&["alpha"])));
        let ctx = Arc::new(MemoryScriptContext::new());
        let handle = ContextHandle::new(1, 1);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || manager.ensure_installed(handle, ctx.as_ref()).unwrap())
            })
            .collect();

        let outcomes: Vec<InstallOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let installs = outcomes
            .iter()
            .filter(|o| matches!(o, InstallOutcome::Installed { .. }))
            .count();
        assert_eq!(installs, 1);
        assert_eq!(ctx.binding_count(BridgeConfig::default().namespace.as_str()), 1);
    }
}
