//! # Sandbox Bridge
//!
//! This library installs a restricted, capability-gated set of host
//! functions into embedded script contexts, directly at the
//! engine-binding layer. Capabilities are registered once at startup,
//! bound under a single namespaced root object per context, and every
//! invocation is checked against the context's permission policy before
//! any native code runs.
//!
//! ## Architecture
//!
//! ```text
//! Host Application
//!     │ lifecycle events
//!     ▼
//! Host Adapter (SandboxBridgeModule)
//!     │ ensure_installed / notify_invalidated
//!     ▼
//! Context Lifecycle Manager ──► Binding Installer ──► ScriptContext (engine seam)
//!                                       │
//!                                       ▼
//!                     Sandbox Policy Enforcer ──► Audit Sink
//!                                       │
//!                                       ▼
//!                             Capability Registry
//! ```
//!
//! ## Guarantees
//!
//! - **Idempotent installation**: installing twice into one live
//!   context is a no-op success, never a duplicate binding
//! - **Atomic installation**: a failed install rolls back every binding
//!   already attached; a context is never left half-wired
//! - **Fail loud**: a denied capability call surfaces a catchable
//!   script error naming the missing permissions
//! - **Checked identity**: contexts are tracked by generation-tagged
//!   handles; use after invalidation is a lookup failure, not a
//!   dangling dereference

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod audit;
pub mod binding;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod installer;
pub mod metrics;
pub mod policy;
pub mod registry;
pub mod value;

// Re-export commonly used types
pub use audit::{AuditEvent, AuditOutcome, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use binding::{
    CapabilityBinding, CapabilityOutcome, Invocation, InvokeReply, PendingCalls,
    PendingCompletion, PendingResult, PendingTicket,
};
pub use config::BridgeConfig;
pub use context::{
    ContextHandle, ContextState, ContextTracker, InstallOutcome, InstallationRecord,
    LifecycleManager,
};
pub use error::{BridgeError, ErrorCode, Result, ScriptError};
pub use host::{init_tracing, BridgeSession, SandboxBridgeModule};
pub use installer::{BindingInstaller, InstallError, MemoryScriptContext, ScriptContext};
pub use metrics::BridgeMetrics;
pub use policy::{Decision, PermissionPolicy, PolicyEnforcer};
pub use registry::{Capability, CapabilityRegistry, NativeHandler, ParamSpec, PermissionTag};
pub use value::{ScriptValue, ValueType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
