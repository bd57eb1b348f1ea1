//! Per-instance self-telemetry: the counters netdata's `struct stats` tracks and
//! republishes as its own charts each iteration.
//!
//! Follows the accumulate-then-apply-then-clear pattern of
//! `metrics-exporter-dogstatsd`'s `Telemetry`/`TelemetryUpdate`: a cheap `Update`
//! accumulator is mutated inline during a tick, then folded into the long-lived
//! `Stats` counters and cleared, so the hot path never touches the published counters
//! directly.

/// Long-lived, monotonically increasing counters for one instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub buffered_metrics: u64,
    pub lost_metrics: u64,
    pub sent_metrics: u64,
    pub buffered_bytes: u64,
    pub lost_bytes: u64,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub transmission_successes: u64,
    pub data_lost_events: u64,
    pub reconnects: u64,
    pub transmission_failures: u64,
    pub receptions: u64,
}

impl Stats {
    /// Folds one tick's [`Update`] into the running totals.
    pub fn apply_update(&mut self, update: &Update) {
        self.buffered_metrics += update.buffered_metrics;
        self.lost_metrics += update.lost_metrics;
        self.sent_metrics += update.sent_metrics;
        self.buffered_bytes += update.buffered_bytes;
        self.lost_bytes += update.lost_bytes;
        self.sent_bytes += update.sent_bytes;
        self.received_bytes += update.received_bytes;
        self.transmission_successes += update.transmission_successes;
        self.data_lost_events += update.data_lost_events;
        self.reconnects += update.reconnects;
        self.transmission_failures += update.transmission_failures;
        self.receptions += update.receptions;
    }
}

/// A per-tick accumulator, reset at the start of every iteration.
#[derive(Debug, Default, Clone, Copy)]
pub struct Update {
    buffered_metrics: u64,
    lost_metrics: u64,
    sent_metrics: u64,
    buffered_bytes: u64,
    lost_bytes: u64,
    sent_bytes: u64,
    received_bytes: u64,
    transmission_successes: u64,
    data_lost_events: u64,
    reconnects: u64,
    transmission_failures: u64,
    receptions: u64,
}

impl Update {
    pub fn clear(&mut self) {
        *self = Update::default();
    }

    pub fn track_buffered(&mut self, metrics: usize, bytes: usize) {
        self.buffered_metrics += metrics as u64;
        self.buffered_bytes += bytes as u64;
    }

    pub fn track_lost(&mut self, metrics: usize, bytes: usize) {
        self.lost_metrics += metrics as u64;
        self.lost_bytes += bytes as u64;
        self.data_lost_events += 1;
    }

    pub fn track_send_success(&mut self, metrics: usize, bytes: usize) {
        self.sent_metrics += metrics as u64;
        self.sent_bytes += bytes as u64;
        self.transmission_successes += 1;
    }

    pub fn track_send_failure(&mut self) {
        self.transmission_failures += 1;
    }

    pub fn track_reconnect(&mut self) {
        self.reconnects += 1;
    }

    pub fn track_reception(&mut self, bytes: usize) {
        self.receptions += 1;
        self.received_bytes += bytes as u64;
    }
}

/// Chart id prefix + dimension names for the four self-telemetry charts published per
/// instance, mirroring `generate_charts_stats`'s `exporting_<name>_*` chart family.
fn metrics_chart_id(instance_name: &str) -> String {
    format!("exporting_{instance_name}_metrics")
}
fn bytes_chart_id(instance_name: &str) -> String {
    format!("exporting_{instance_name}_bytes")
}
fn ops_chart_id(instance_name: &str) -> String {
    format!("exporting_{instance_name}_ops")
}
fn thread_cpu_chart_id(instance_name: &str) -> String {
    format!("exporting_{instance_name}_thread_cpu")
}

/// Publishes one instance's cumulative counters back into the TSDB as its own
/// `netdata`-host charts, the Rust analogue of `generate_charts_stats`. The sink's
/// dimensions are cumulative counters (like `RRD_ALGORITHM_INCREMENTAL`); the TSDB is
/// responsible for turning consecutive absolute values into a rate, so this function
/// just reports `stats`'s running totals every call rather than tracking its own deltas.
pub fn publish(sink: &dyn crate::tsdb::TelemetrySink, instance_name: &str, stats: &Stats) {
    let metrics_id = metrics_chart_id(instance_name);
    sink.ensure_chart(&metrics_id, &["buffered", "lost", "sent"]);
    sink.set_dimension(&metrics_id, "buffered", stats.buffered_metrics as i64);
    sink.set_dimension(&metrics_id, "lost", stats.lost_metrics as i64);
    sink.set_dimension(&metrics_id, "sent", stats.sent_metrics as i64);
    sink.commit_chart(&metrics_id);

    let bytes_id = bytes_chart_id(instance_name);
    sink.ensure_chart(&bytes_id, &["buffered", "lost", "sent", "received"]);
    sink.set_dimension(&bytes_id, "buffered", stats.buffered_bytes as i64);
    sink.set_dimension(&bytes_id, "lost", stats.lost_bytes as i64);
    sink.set_dimension(&bytes_id, "sent", stats.sent_bytes as i64);
    sink.set_dimension(&bytes_id, "received", stats.received_bytes as i64);
    sink.commit_chart(&bytes_id);

    let ops_id = ops_chart_id(instance_name);
    sink.ensure_chart(&ops_id, &["write", "discard", "reconnect", "failure", "read"]);
    sink.set_dimension(&ops_id, "write", stats.transmission_successes as i64);
    sink.set_dimension(&ops_id, "discard", stats.data_lost_events as i64);
    sink.set_dimension(&ops_id, "reconnect", stats.reconnects as i64);
    sink.set_dimension(&ops_id, "failure", stats.transmission_failures as i64);
    sink.set_dimension(&ops_id, "read", stats.receptions as i64);
    sink.commit_chart(&ops_id);

    let (user_us, system_us) = thread_cpu_times();
    let cpu_id = thread_cpu_chart_id(instance_name);
    sink.ensure_chart(&cpu_id, &["user", "system"]);
    sink.set_dimension(&cpu_id, "user", user_us);
    sink.set_dimension(&cpu_id, "system", system_us);
    sink.commit_chart(&cpu_id);
}

/// The calling thread's user/system CPU time in microseconds, via `getrusage(RUSAGE_THREAD)`.
/// Returns `(0, 0)` if the platform call fails, rather than poisoning the chart.
fn thread_cpu_times() -> (i64, i64) {
    // SAFETY: `usage` is a plain-old-data struct fully initialized by `getrusage` on
    // success; we only read it back when the call returns 0.
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_THREAD, &mut usage) != 0 {
            return (0, 0);
        }
        let user_us = usage.ru_utime.tv_sec as i64 * 1_000_000 + usage.ru_utime.tv_usec as i64;
        let system_us = usage.ru_stime.tv_sec as i64 * 1_000_000 + usage.ru_stime.tv_usec as i64;
        (user_us, system_us)
    }
}
