//! The engine: owns the instance roster and drives the periodic pipeline tick that
//! walks the TSDB, reduces each dimension's window, and feeds the result through every
//! scheduled instance's formatter.
//!
//! Grounded on `struct engine` (`exporting_engine.h`): `instance_root`, `now`, and the
//! exit flag are carried over as an owned `Vec<Arc<Instance>>`, a `now` tick counter,
//! and a `tokio_util`-free shutdown `Notify`/flag (no separate crate needed for a
//! single bool).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::formatter::MetricContext;
use crate::instance::{Instance, Window};
use crate::reducer::reduce;
use crate::tsdb::TsdbHost;

/// The smallest `update_every` across every configured instance: the engine's own tick
/// period, per `rrdpush`'s "run the pipeline as often as the fastest instance needs"
/// policy. Instances with a larger `update_every` are simply skipped on ticks they're
/// not due for.
fn engine_tick_of(instances: &[Arc<Instance>], fallback: u32) -> i64 {
    instances.iter().map(|i| i.config.update_every.max(1) as i64).min().unwrap_or(fallback.max(1) as i64)
}

/// Top-level engine configuration, mirroring `struct engine_config`.
pub struct EngineOptions {
    pub hostname: String,
    pub update_every: u32,
}

/// Owns every configured instance and the periodic scheduler that feeds them.
pub struct Engine {
    pub config: EngineOptions,
    pub instances: Vec<Arc<Instance>>,
    now: AtomicI64,
    exit: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineOptions, instances: Vec<Arc<Instance>>) -> Self {
        Self { config, instances, now: AtomicI64::new(0), exit: AtomicBool::new(false) }
    }

    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    fn should_exit(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    /// Runs the periodic tick loop until [`Engine::request_exit`] is called.
    pub async fn run(self: Arc<Self>, hosts: impl Fn() -> Vec<Box<dyn TsdbHost>> + Send + Sync + 'static) {
        let engine_tick = engine_tick_of(&self.instances, self.config.update_every);
        let interval = Duration::from_secs(engine_tick.max(1) as u64);
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if self.should_exit() {
                return;
            }
            let now = self.now.fetch_add(engine_tick, Ordering::AcqRel) + engine_tick;
            self.tick(now, engine_tick, &hosts()).await;
        }
    }

    /// Runs exactly one pipeline tick at wall-clock second `now`, for the given
    /// `engine_tick` period. Exposed separately from [`Engine::run`] so tests can drive
    /// it without a real clock.
    ///
    /// Per §4.3, an instance is due this tick iff
    /// `now mod update_every >= update_every - engine_tick`; due instances are fed over
    /// `[instance.window_after, now)` and their window then advances to `now`.
    /// Instances not due this tick are left untouched, to be caught up by a later tick.
    pub async fn tick(&self, now: i64, engine_tick: i64, hosts: &[Box<dyn TsdbHost>]) {
        for instance in &self.instances {
            if instance.is_disabled() {
                continue;
            }
            let ue = instance.config.update_every.max(1) as i64;
            let due = now.rem_euclid(ue) >= ue - engine_tick;
            instance.scheduled.store(due, Ordering::Release);
            if !due {
                continue;
            }

            let after = instance.window_after.load(Ordering::Acquire);
            self.feed_instance(instance, Window { after, before: now }, hosts);
            instance.window_after.store(now, Ordering::Release);
        }
    }

    fn feed_instance(&self, instance: &Arc<Instance>, window: Window, hosts: &[Box<dyn TsdbHost>]) {
        let mode = instance.config.options.reduction_mode();

        let mut formatter = instance.formatter.lock();
        let mut buffers = instance.shared.buffers.lock();

        formatter.start_batch(buffers.current_mut());

        for host in hosts {
            if !instance.config.hosts_pattern.matches(host.hostname()) {
                continue;
            }
            formatter.start_host(buffers.current_mut(), host.as_ref());

            for chart in host.charts() {
                if !instance.config.charts_pattern.matches(chart.id()) {
                    continue;
                }
                formatter.start_chart(buffers.current_mut(), chart);

                let ue = chart.update_every();
                for dim in chart.dims() {
                    let oldest_latest = dim.oldest_and_latest();
                    let reduced = reduce(ue, window.after, window.before, oldest_latest, mode, |a, b| dim.points_in_range(a, b));
                    let Some(reduced) = reduced else { continue };
                    let ctx = MetricContext { chart, dim_id: dim.id(), dim_name: dim.name(), reduced };
                    formatter.metric(buffers.current_mut(), &ctx);
                }

                formatter.end_chart(buffers.current_mut(), chart);
            }

            if instance.config.options.contains(crate::config::ExportingOptions::SEND_VARIABLES) {
                formatter.variables(buffers.current_mut(), host.as_ref());
            }
            formatter.end_host(buffers.current_mut(), host.as_ref());
        }

        formatter.end_batch(buffers.current_mut());

        let mut update = crate::telemetry::Update::default();
        let metrics = buffers.current_mut().buffered_metrics;
        let bytes = buffers.current_mut().buffered_bytes;
        update.track_buffered(metrics, bytes);

        if let Some(dropped) = buffers.finish_current() {
            update.track_lost(dropped.metrics, dropped.bytes);
        }
        drop(buffers);
        drop(formatter);

        instance.shared.stats.lock().apply_update(&update);
        instance.notify_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SendBuffer;
    use crate::config::{ConnectorSpecificConfig, ConnectorType, ExportingOptions, InstanceConfig};
    use crate::formatter::Formatter;
    use crate::pattern::SimplePattern;
    use crate::tsdb::mock::{MockChart, MockDim, MockHost};
    use crate::tsdb::{LabelSource, Point};

    struct RecordingFormatter {
        lines: Vec<String>,
    }

    impl Formatter for RecordingFormatter {
        fn start_host(&mut self, _out: &mut SendBuffer, host: &dyn TsdbHost) {
            self.lines.push(format!("host:{}", host.hostname()));
        }
        fn metric(&mut self, out: &mut SendBuffer, ctx: &MetricContext<'_>) {
            self.lines.push(format!("{}.{}={}", ctx.chart.id(), ctx.dim_id, ctx.reduced.value));
            out.buffered_metrics += 1;
            out.buffered_bytes += 1;
        }
    }

    fn instance_config(pattern: &str) -> InstanceConfig {
        InstanceConfig {
            name: "test".into(),
            connector_type: ConnectorType::Graphite,
            destination: "127.0.0.1:0".into(),
            username: None,
            password: None,
            prefix: None,
            label_prefix: None,
            update_every: 1,
            buffer_on_failures: 3,
            timeout: Duration::from_secs(1),
            options: ExportingOptions::SOURCE_DATA_AVERAGE,
            charts_pattern: SimplePattern::parse(pattern).unwrap(),
            hosts_pattern: SimplePattern::parse("").unwrap(),
            connector_specific: ConnectorSpecificConfig::None,
        }
    }

    fn sample_host() -> Box<dyn TsdbHost> {
        Box::new(MockHost {
            hostname: "web01".into(),
            charts: vec![
                MockChart {
                    id: "system.cpu".into(),
                    context: "system.cpu".into(),
                    family: "cpu".into(),
                    units: "percentage".into(),
                    update_every: 1,
                    dims: vec![MockDim::new("user", vec![Point { timestamp: 5, value: 10.0 }])],
                },
                MockChart {
                    id: "disk.sda".into(),
                    context: "disk.io".into(),
                    family: "disk".into(),
                    units: "ops".into(),
                    update_every: 1,
                    dims: vec![MockDim::new("reads", vec![Point { timestamp: 5, value: 3.0 }])],
                },
            ],
            labels: vec![("env".to_string(), "prod".to_string(), LabelSource::Automatic)],
        })
    }

    #[tokio::test]
    async fn tick_filters_charts_by_pattern_and_feeds_matching_metrics() {
        let config = instance_config("system.*");
        let instance = Arc::new(Instance::new(config, Box::new(RecordingFormatter { lines: Vec::new() })));
        let engine = Engine::new(EngineOptions { hostname: "agent".into(), update_every: 1 }, vec![instance.clone()]);

        let hosts = vec![sample_host()];
        engine.tick(10, 1, &hosts).await;

        assert_eq!(instance.shared.buffers.lock().queued_len(), 1);
        let stats = instance.shared.stats.lock();
        assert_eq!(stats.buffered_metrics, 1);
        assert!(instance.scheduled.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn tick_skips_disabled_instances() {
        let config = instance_config("");
        let instance = Arc::new(Instance::new(config, Box::new(RecordingFormatter { lines: Vec::new() })));
        instance.disable();
        let engine = Engine::new(EngineOptions { hostname: "agent".into(), update_every: 1 }, vec![instance.clone()]);

        let hosts = vec![sample_host()];
        engine.tick(10, 1, &hosts).await;

        assert_eq!(instance.shared.buffers.lock().queued_len(), 0);
    }

    #[tokio::test]
    async fn instance_not_due_this_tick_is_left_unscheduled_and_unfed() {
        let mut config = instance_config("system.*");
        config.update_every = 10;
        let instance = Arc::new(Instance::new(config, Box::new(RecordingFormatter { lines: Vec::new() })));
        let engine = Engine::new(EngineOptions { hostname: "agent".into(), update_every: 1 }, vec![instance.clone()]);

        let hosts = vec![sample_host()];
        // ue=10, engine_tick=1: due iff now mod 10 >= 9. now=3 is not due.
        engine.tick(3, 1, &hosts).await;

        assert!(!instance.scheduled.load(Ordering::Acquire));
        assert_eq!(instance.shared.buffers.lock().queued_len(), 0);
    }

    #[tokio::test]
    async fn instance_due_this_tick_is_fed_and_window_advances() {
        let mut config = instance_config("system.*");
        config.update_every = 10;
        let instance = Arc::new(Instance::new(config, Box::new(RecordingFormatter { lines: Vec::new() })));
        let engine = Engine::new(EngineOptions { hostname: "agent".into(), update_every: 1 }, vec![instance.clone()]);

        let hosts = vec![sample_host()];
        // now=9: 9 mod 10 = 9 >= 10-1 -> due.
        engine.tick(9, 1, &hosts).await;

        assert!(instance.scheduled.load(Ordering::Acquire));
        assert_eq!(instance.window_after.load(Ordering::Acquire), 9);
    }
}
