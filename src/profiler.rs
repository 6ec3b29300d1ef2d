//! Per-request timing marks
//!
//! Opt-in profiling of the request path. When disabled, `begin` hands back
//! an empty handle and every `mark` is a no-op with no allocation, so the
//! hot path pays nothing. When enabled, each request records named phase
//! marks that are folded into per-phase aggregates on finish.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Aggregated timings per named phase.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PhaseStats {
    pub count: u64,
    pub total_us: u64,
    pub max_us: u64,
}

/// Process-wide profiler registry.
pub struct Profiler {
    enabled: bool,
    phases: Mutex<HashMap<&'static str, PhaseStats>>,
}

impl Profiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            phases: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Start profiling one request. Returns an inert handle when disabled.
    pub fn begin(&self) -> RequestProfile {
        RequestProfile {
            inner: self.enabled.then(|| ProfileInner {
                started: Instant::now(),
                last_mark: Instant::now(),
                marks: Vec::with_capacity(8),
            }),
        }
    }

    /// Fold a finished request's marks into the aggregates.
    fn absorb(&self, marks: &[(&'static str, u64)]) {
        let Ok(mut phases) = self.phases.lock() else {
            return;
        };
        for &(name, us) in marks {
            let stats = phases.entry(name).or_default();
            stats.count += 1;
            stats.total_us += us;
            stats.max_us = stats.max_us.max(us);
        }
    }

    /// Snapshot of per-phase aggregates for diagnostics.
    pub fn snapshot(&self) -> HashMap<&'static str, PhaseStats> {
        self.phases
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

struct ProfileInner {
    started: Instant,
    last_mark: Instant,
    marks: Vec<(&'static str, u64)>,
}

/// Timing handle for one request. All methods are no-ops when profiling is
/// disabled.
pub struct RequestProfile {
    inner: Option<ProfileInner>,
}

impl RequestProfile {
    /// Record the time since the previous mark under `name`.
    pub fn mark(&mut self, name: &'static str) {
        if let Some(inner) = &mut self.inner {
            let now = Instant::now();
            let us = now.duration_since(inner.last_mark).as_micros() as u64;
            inner.marks.push((name, us));
            inner.last_mark = now;
        }
    }

    /// Close out the request: fold marks into the registry and trace the
    /// total.
    pub fn finish(self, profiler: &Profiler, request_id: &str) {
        if let Some(inner) = self.inner {
            let total_us = inner.started.elapsed().as_micros() as u64;
            profiler.absorb(&inner.marks);
            tracing::trace!(request_id, total_us, marks = ?inner.marks, "request profile");
        }
    }
}
