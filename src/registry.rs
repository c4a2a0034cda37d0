//! Capability registry.
//!
//! The registry is the process-wide table of named, permission-gated
//! native functions that installation exposes to script. Registration
//! is a startup-time phase; the table seals itself on the first
//! installation and is append-only for the life of the process, so
//! post-seal reads need no write coordination.

use crate::binding::{CapabilityOutcome, Invocation};
use crate::error::BridgeError;
use crate::value::ValueType;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A permission tag required by a capability and granted by a policy
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PermissionTag(String);

impl PermissionTag {
    /// Create a new permission tag
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The tag as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PermissionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PermissionTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PermissionTag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Declared parameter of a capability, used for argument marshalling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name, used in marshalling diagnostics
    pub name: String,

    /// Expected value type
    pub ty: ValueType,

    /// Whether script must supply this argument
    pub required: bool,
}

impl ParamSpec {
    /// Create a required parameter
    pub fn required(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
        }
    }

    /// Create an optional parameter (may be omitted or null)
    pub fn optional(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
        }
    }
}

/// Native handler signature for a capability.
///
/// Handlers return `anyhow::Result`; failure detail is retained in
/// native logs only and surfaced to script as a generic internal error.
pub type NativeHandler =
    Arc<dyn Fn(&Invocation) -> anyhow::Result<CapabilityOutcome> + Send + Sync>;

/// A named, permission-gated native function exposed to script.
///
/// Immutable once registered; owned by the registry for the process
/// lifetime.
pub struct Capability {
    name: String,
    required_permissions: BTreeSet<PermissionTag>,
    params: Vec<ParamSpec>,
    handler: NativeHandler,
}

impl Capability {
    /// Create a new capability with the given name and native handler
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Invocation) -> anyhow::Result<CapabilityOutcome> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            required_permissions: BTreeSet::new(),
            params: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    /// Require a permission tag (conjunctive with any others)
    pub fn with_permission(mut self, tag: impl Into<PermissionTag>) -> Self {
        self.required_permissions.insert(tag.into());
        self
    }

    /// Declare a parameter
    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// The capability name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Permission tags that must all be granted for invocation
    pub fn required_permissions(&self) -> &BTreeSet<PermissionTag> {
        &self.required_permissions
    }

    /// Declared parameters
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Dispatch the native handler
    pub fn call(&self, invocation: &Invocation) -> anyhow::Result<CapabilityOutcome> {
        (self.handler)(invocation)
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("required_permissions", &self.required_permissions)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Append-only table of capabilities.
///
/// The process-wide instance lives behind [`CapabilityRegistry::global`]
/// with an init-once/no-teardown lifecycle; it is injected into the
/// installer rather than reached for ambiently, so tests can substitute
/// a private registry.
pub struct CapabilityRegistry {
    capabilities: DashMap<String, Arc<Capability>>,
    sealed: AtomicBool,
}

impl CapabilityRegistry {
    /// Create a new, empty registry
    pub fn new() -> Self {
        Self {
            capabilities: DashMap::new(),
            sealed: AtomicBool::new(false),
        }
    }

    /// The process-wide registry
    pub fn global() -> Arc<CapabilityRegistry> {
        static GLOBAL: Lazy<Arc<CapabilityRegistry>> =
            Lazy::new(|| Arc::new(CapabilityRegistry::new()));
        Arc::clone(&GLOBAL)
    }

    /// Register a capability.
    ///
    /// Fails with `DuplicateCapability` if the name already exists and
    /// with `RegistrationClosed` once any context has installed
    /// bindings.
    pub fn register(&self, capability: Capability) -> Result<(), BridgeError> {
        if self.is_sealed() {
            return Err(BridgeError::RegistrationClosed);
        }

        let name = capability.name().to_string();
        match self.capabilities.entry(name.clone()) {
            Entry::Occupied(_) => Err(BridgeError::DuplicateCapability(name)),
            Entry::Vacant(slot) => {
                debug!(capability = %name, "capability registered");
                slot.insert(Arc::new(capability));
                Ok(())
            }
        }
    }

    /// Look up a capability by name
    pub fn lookup(&self, name: &str) -> Option<Arc<Capability>> {
        self.capabilities.get(name).map(|c| Arc::clone(c.value()))
    }

    /// All registered names, sorted for deterministic installation order
    pub fn all_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered capabilities
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Close the registration phase
    pub fn seal(&self) {
        if !self.sealed.swap(true, Ordering::SeqCst) {
            debug!(capabilities = self.len(), "capability registry sealed");
        }
    }

    /// Whether the registration phase has closed
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScriptValue;

    fn noop_capability(name: &str) -> Capability {
        Capability::new(name, |_inv| Ok(CapabilityOutcome::Value(ScriptValue::Null)))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = CapabilityRegistry::new();
        registry
            .register(noop_capability("readClipboard").with_permission("clipboard.read"))
            .unwrap();

        let cap = registry.lookup("readClipboard").unwrap();
        assert_eq!(cap.name(), "readClipboard");
        assert!(cap
            .required_permissions()
            .contains(&PermissionTag::from("clipboard.read")));
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = CapabilityRegistry::new();
        registry.register(noop_capability("readClipboard")).unwrap();

        let err = registry
            .register(noop_capability("readClipboard"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateCapability(name) if name == "readClipboard"));
    }

    #[test]
    fn test_register_after_seal_rejected() {
        let registry = CapabilityRegistry::new();
        registry.register(noop_capability("first")).unwrap();
        registry.seal();

        let err = registry.register(noop_capability("second")).unwrap_err();
        assert!(matches!(err, BridgeError::RegistrationClosed));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_all_names_sorted() {
        let registry = CapabilityRegistry::new();
        registry.register(noop_capability("zeta")).unwrap();
        registry.register(noop_capability("alpha")).unwrap();
        registry.register(noop_capability("mu")).unwrap();

        assert_eq!(registry.all_names(), vec!["alpha", "mu", "zeta"]);
    }

    #[test]
    fn test_param_spec_builders() {
        let cap = noop_capability("writeClipboard")
            .with_param(ParamSpec::required("text", ValueType::String))
            .with_param(ParamSpec::optional("label", ValueType::String));

        assert_eq!(cap.params().len(), 2);
        assert!(cap.params()[0].required);
        assert!(!cap.params()[1].required);
    }

    #[test]
    fn test_global_registry_is_shared() {
        let a = CapabilityRegistry::global();
        let b = CapabilityRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
