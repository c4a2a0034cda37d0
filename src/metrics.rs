//! Bridge metrics for monitoring and observability.
//!
//! Counters for installations, rollbacks, invocations and denials,
//! with a Prometheus text export. Collection is atomic and cheap; the
//! collector lives for the life of the bridge module.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated counters for one bridge module
pub struct BridgeMetrics {
    installs: AtomicU64,
    rollbacks: AtomicU64,
    invalidations: AtomicU64,
    invocations: AtomicU64,
    invocation_failures: AtomicU64,
    denials: AtomicU64,
    errors: Mutex<HashMap<String, u64>>,
}

impl BridgeMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            installs: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
            invocation_failures: AtomicU64::new(0),
            denials: AtomicU64::new(0),
            errors: Mutex::new(HashMap::new()),
        }
    }

    /// Record a successful installation
    pub fn record_install(&self) {
        self.installs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an installation rollback
    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a context invalidation
    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a binding invocation
    pub fn record_invocation(&self, success: bool) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.invocation_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a policy denial
    pub fn record_denial(&self) {
        self.denials.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a script-visible error by code
    pub fn record_error(&self, code: &str) {
        let mut errors = self.errors.lock();
        *errors.entry(code.to_string()).or_insert(0) += 1;
    }

    /// Total successful installations
    pub fn installs(&self) -> u64 {
        self.installs.load(Ordering::Relaxed)
    }

    /// Total installation rollbacks
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Total context invalidations
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Total binding invocations
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Total failed binding invocations
    pub fn invocation_failures(&self) -> u64 {
        self.invocation_failures.load(Ordering::Relaxed)
    }

    /// Total policy denials
    pub fn denials(&self) -> u64 {
        self.denials.load(Ordering::Relaxed)
    }

    /// Error counts by script-visible code
    pub fn errors(&self) -> HashMap<String, u64> {
        self.errors.lock().clone()
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.installs.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
        self.invocations.store(0, Ordering::Relaxed);
        self.invocation_failures.store(0, Ordering::Relaxed);
        self.denials.store(0, Ordering::Relaxed);
        self.errors.lock().clear();
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP sandbox_bridge_installs_total Successful binding installations\n");
        output.push_str("# TYPE sandbox_bridge_installs_total counter\n");
        output.push_str(&format!(
            "sandbox_bridge_installs_total {}\n",
            self.installs()
        ));

        output.push_str("\n# HELP sandbox_bridge_rollbacks_total Installation rollbacks\n");
        output.push_str("# TYPE sandbox_bridge_rollbacks_total counter\n");
        output.push_str(&format!(
            "sandbox_bridge_rollbacks_total {}\n",
            self.rollbacks()
        ));

        output.push_str("\n# HELP sandbox_bridge_invalidations_total Context invalidations\n");
        output.push_str("# TYPE sandbox_bridge_invalidations_total counter\n");
        output.push_str(&format!(
            "sandbox_bridge_invalidations_total {}\n",
            self.invalidations()
        ));

        output.push_str("\n# HELP sandbox_bridge_invocations_total Binding invocations\n");
        output.push_str("# TYPE sandbox_bridge_invocations_total counter\n");
        output.push_str(&format!(
            "sandbox_bridge_invocations_total{{status=\"success\"}} {}\n",
            self.invocations() - self.invocation_failures()
        ));
        output.push_str(&format!(
            "sandbox_bridge_invocations_total{{status=\"error\"}} {}\n",
            self.invocation_failures()
        ));

        output.push_str("\n# HELP sandbox_bridge_denials_total Policy denials\n");
        output.push_str("# TYPE sandbox_bridge_denials_total counter\n");
        output.push_str(&format!(
            "sandbox_bridge_denials_total {}\n",
            self.denials()
        ));

        output.push_str("\n# HELP sandbox_bridge_errors_total Script-visible errors by code\n");
        output.push_str("# TYPE sandbox_bridge_errors_total counter\n");
        for (code, count) in self.errors() {
            output.push_str(&format!(
                "sandbox_bridge_errors_total{{code=\"{}\"}} {}\n",
                code, count
            ));
        }

        output
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
