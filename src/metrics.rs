//! Metrics instrumentation for dns-routes.
//!
//! All metrics are prefixed with `dns_routes.`

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::group::GroupId;

fn result_label(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

/// Record a kernel route install attempt.
pub fn record_route_install(ok: bool) {
    counter!("dns_routes.route.install.count", "result" => result_label(ok)).increment(1);
}

/// Record a kernel route delete attempt.
pub fn record_route_delete(ok: bool) {
    counter!("dns_routes.route.delete.count", "result" => result_label(ok)).increment(1);
}

/// Record the number of managed destinations.
pub fn record_table_size(entries: usize) {
    gauge!("dns_routes.route.table.entries").set(entries as f64);
}

/// Record the outcome of resolving one domain across all nameservers.
pub fn record_resolution(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!("dns_routes.resolve.count", "result" => result).increment(1);
}

/// Record one nameserver failing for one domain.
pub fn record_nameserver_failure() {
    counter!("dns_routes.resolve.nameserver_failure.count").increment(1);
}

/// Record a finished group update.
pub fn record_group_update(group: GroupId, addresses: usize, duration: Duration) {
    let group = group.index().to_string();
    counter!("dns_routes.group.update.count", "group" => group.clone()).increment(1);
    histogram!("dns_routes.group.update.duration.seconds", "group" => group.clone())
        .record(duration.as_secs_f64());
    gauge!("dns_routes.group.update.addresses", "group" => group).set(addresses as f64);
}

/// Record a group handed to the update queue.
pub fn record_dispatch() {
    counter!("dns_routes.scheduler.dispatch.count").increment(1);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
