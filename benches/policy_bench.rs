//! Authorization hot-path benchmark.
//!
//! The enforcer sits on every capability invocation, so authorize must
//! stay cheap under both the allow and deny outcomes.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sandbox_bridge::{
    Capability, CapabilityOutcome, ContextHandle, PermissionPolicy, PolicyEnforcer, ScriptValue,
    TracingAuditSink,
};
use std::sync::Arc;

fn bench_authorize(c: &mut Criterion) {
    let enforcer = PolicyEnforcer::new(Arc::new(TracingAuditSink));
    let handle = ContextHandle::new(1, 1);

    let capability = Capability::new("readClipboard", |_inv| {
        Ok(CapabilityOutcome::Value(ScriptValue::Null))
    })
    .with_permission("clipboard.read");

    enforcer.set_policy(handle, PermissionPolicy::new().grant("clipboard.read"));
    c.bench_function("authorize_allowed", |b| {
        b.iter(|| black_box(enforcer.authorize(black_box(handle), black_box(&capability))))
    });

    enforcer.set_policy(handle, PermissionPolicy::new());
    c.bench_function("authorize_denied", |b| {
        b.iter(|| black_box(enforcer.authorize(black_box(handle), black_box(&capability))))
    });
}

criterion_group!(benches, bench_authorize);
criterion_main!(benches);
