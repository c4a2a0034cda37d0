//! Binding installation into live script contexts.
//!
//! The installer walks the capability registry and attaches one
//! [`CapabilityBinding`] per capability under a single namespaced root
//! object, never the bare global. Installation is atomic: if any
//! binding fails to attach, everything already attached to that context
//! is removed before the error is returned, so a context is never left
//! half-wired.
//!
//! The engine itself sits behind the [`ScriptContext`] trait; host
//! integrations implement it for their concrete engine, and
//! [`MemoryScriptContext`] provides an in-memory implementation for
//! tests.

use crate::binding::{CapabilityBinding, InvokeReply, PendingCalls};
use crate::context::{ContextHandle, ContextTracker};
use crate::error::ScriptError;
use crate::metrics::BridgeMetrics;
use crate::policy::PolicyEnforcer;
use crate::registry::CapabilityRegistry;
use crate::value::ScriptValue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Result of one engine-side bind operation; the error is the engine's
/// failure reason
pub type BindResult = std::result::Result<(), String>;

/// Engine-side surface the installer drives.
///
/// Implemented by the host integration for its concrete script engine.
/// The reference is borrowed for the duration of one installer call and
/// must never be retained.
pub trait ScriptContext: Send + Sync {
    /// Create (or reuse) the namespaced root object
    fn ensure_root(&self, root: &str) -> BindResult;

    /// Attach one callable binding under the root
    fn bind(&self, root: &str, name: &str, binding: CapabilityBinding) -> BindResult;

    /// Detach one binding from the root
    fn unbind(&self, root: &str, name: &str);

    /// Remove the root object and everything under it
    fn remove_root(&self, root: &str);
}

/// Installation failure; the context was rolled back to zero bindings
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// The namespace root object could not be created
    #[error("failed to create binding root '{root}': {reason}")]
    Root {
        /// The configured namespace root
        root: String,
        /// Engine-reported reason
        reason: String,
    },

    /// A capability binding could not be attached
    #[error("failed to bind capability '{name}': {reason}")]
    Binding {
        /// The capability that failed to bind
        name: String,
        /// Engine-reported reason
        reason: String,
    },
}

/// Walks the registry and injects capability bindings into a context
pub struct BindingInstaller {
    namespace: String,
    enforcer: Arc<PolicyEnforcer>,
    tracker: Arc<ContextTracker>,
    pending: Arc<PendingCalls>,
    metrics: Arc<BridgeMetrics>,
}

impl BindingInstaller {
    pub(crate) fn new(
        namespace: String,
        enforcer: Arc<PolicyEnforcer>,
        tracker: Arc<ContextTracker>,
        pending: Arc<PendingCalls>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            namespace,
            enforcer,
            tracker,
            pending,
            metrics,
        }
    }

    /// The namespace root bindings are installed under
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Install every registered capability into the context.
    ///
    /// Synchronous; completes fully or fails atomically. On failure all
    /// bindings already attached by this call are removed along with
    /// the namespace root.
    #[instrument(skip(self, ctx, registry), fields(context = %handle))]
    pub fn install(
        &self,
        handle: ContextHandle,
        ctx: &dyn ScriptContext,
        registry: &CapabilityRegistry,
    ) -> std::result::Result<usize, InstallError> {
        let names = registry.all_names();

        ctx.ensure_root(&self.namespace).map_err(|reason| {
            self.metrics.record_rollback();
            InstallError::Root {
                root: self.namespace.clone(),
                reason,
            }
        })?;

        let mut bound: Vec<String> = Vec::with_capacity(names.len());
        for name in &names {
            let capability = match registry.lookup(name) {
                Some(capability) => capability,
                None => {
                    // The registry is append-only; a miss here means the
                    // name list raced a registration that never happened.
                    warn!(capability = %name, "registered name missing from lookup");
                    continue;
                }
            };

            let binding = CapabilityBinding::new(
                capability,
                handle,
                Arc::clone(&self.enforcer),
                Arc::clone(&self.tracker),
                Arc::clone(&self.pending),
                Arc::clone(&self.metrics),
            );

            if let Err(reason) = ctx.bind(&self.namespace, name, binding) {
                warn!(
                    capability = %name,
                    reason = %reason,
                    attached = bound.len(),
                    "binding failed; rolling back installation"
                );
                for attached in &bound {
                    ctx.unbind(&self.namespace, attached);
                }
                ctx.remove_root(&self.namespace);
                self.metrics.record_rollback();
                return Err(InstallError::Binding {
                    name: name.clone(),
                    reason,
                });
            }

            bound.push(name.clone());
        }

        debug!(count = bound.len(), root = %self.namespace, "capabilities bound");
        Ok(bound.len())
    }
}

/// In-memory [`ScriptContext`] for tests and host-integration test
/// suites.
///
/// Stores bindings per root and lets callers invoke them the way script
/// would; a single capability name can be marked to fail binding, which
/// exercises the installer's rollback path.
#[derive(Default)]
pub struct MemoryScriptContext {
    roots: DashMap<String, DashMap<String, Arc<CapabilityBinding>>>,
    fail_bind: Mutex<Option<String>>,
}

impl MemoryScriptContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `bind` of this capability name fail
    pub fn fail_bind_on(&self, name: impl Into<String>) {
        *self.fail_bind.lock() = Some(name.into());
    }

    /// Clear a forced bind failure
    pub fn clear_fail(&self) {
        *self.fail_bind.lock() = None;
    }

    /// Whether the root object exists
    pub fn has_root(&self, root: &str) -> bool {
        self.roots.contains_key(root)
    }

    /// Whether a binding is reachable under the root
    pub fn has_binding(&self, root: &str, name: &str) -> bool {
        self.roots
            .get(root)
            .map(|bindings| bindings.contains_key(name))
            .unwrap_or(false)
    }

    /// Number of bindings reachable under the root
    pub fn binding_count(&self, root: &str) -> usize {
        self.roots.get(root).map(|bindings| bindings.len()).unwrap_or(0)
    }

    /// Invoke a binding the way script would
    pub fn call(
        &self,
        root: &str,
        name: &str,
        args: Vec<ScriptValue>,
    ) -> std::result::Result<InvokeReply, ScriptError> {
        let binding = self
            .roots
            .get(root)
            .and_then(|bindings| bindings.get(name).map(|b| Arc::clone(b.value())));

        match binding {
            Some(binding) => binding.invoke(args),
            None => Err(ScriptError::not_found(name)),
        }
    }
}

impl ScriptContext for MemoryScriptContext {
    fn ensure_root(&self, root: &str) -> BindResult {
        self.roots.entry(root.to_string()).or_default();
        Ok(())
    }

    fn bind(&self, root: &str, name: &str, binding: CapabilityBinding) -> BindResult {
        if self.fail_bind.lock().as_deref() == Some(name) {
            return Err("forced bind failure".to_string());
        }

        match self.roots.get(root) {
            Some(bindings) => {
                bindings.insert(name.to_string(), Arc::new(binding));
                Ok(())
            }
            None => Err(format!("root '{}' does not exist", root)),
        }
    }

    fn unbind(&self, root: &str, name: &str) {
        if let Some(bindings) = self.roots.get(root) {
            bindings.remove(name);
        }
    }

    fn remove_root(&self, root: &str) {
        self.roots.remove(root);
    }
}
