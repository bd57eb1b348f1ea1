//! JSON array formatter: one object per metric, the whole batch wrapped in `[ ... ]`.

use std::fmt::Write as _;

use serde::Serialize;

use super::{host_labels_to_send, prefixed_name, Formatter, MetricContext};
use crate::buffer::SendBuffer;
use crate::config::InstanceConfig;
use crate::tsdb::TsdbHost;

#[derive(Serialize)]
struct JsonMetric<'a> {
    hostname: &'a str,
    chart: &'a str,
    dimension: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    labels: Vec<(String, String)>,
    value: f64,
    timestamp: i64,
}

pub struct JsonFormatter {
    prefix: Option<String>,
    current_host: String,
    current_labels: Vec<(String, String)>,
    any_written: bool,
}

impl JsonFormatter {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix, current_host: String::new(), current_labels: Vec::new(), any_written: false }
    }
}

impl Formatter for JsonFormatter {
    fn start_batch(&mut self, out: &mut SendBuffer) {
        out.body_as_string().write_str("[").ok();
        self.any_written = false;
    }

    fn start_host(&mut self, _out: &mut SendBuffer, host: &dyn TsdbHost) {
        self.current_host = host.hostname().to_string();
    }

    fn metric(&mut self, out: &mut SendBuffer, ctx: &MetricContext<'_>) {
        let chart_name = prefixed_name(self.prefix.as_deref(), ctx.chart.id());
        let entry = JsonMetric {
            hostname: &self.current_host,
            chart: &chart_name,
            dimension: ctx.dim_id,
            labels: self.current_labels.clone(),
            value: ctx.reduced.value,
            timestamp: ctx.reduced.last_timestamp,
        };

        let serialized = serde_json::to_string(&entry).unwrap_or_default();

        let mut w = out.body_as_string();
        if self.any_written {
            let _ = w.write_str(",");
        }
        let _ = w.write_str(&serialized);
        self.any_written = true;
        out.buffered_metrics += 1;
    }

    fn end_batch(&mut self, out: &mut SendBuffer) {
        out.body_as_string().write_str("]").ok();
    }
}

/// Computes the labels a host should carry for this tick, per the instance's
/// configured label-sending options, stashing them for subsequent `metric` calls.
pub fn prime_host_labels(formatter: &mut JsonFormatter, config: &InstanceConfig, host: &dyn TsdbHost) {
    formatter.current_labels = host_labels_to_send(config, host);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsdb::mock::{MockChart, MockHost};

    #[test]
    fn wraps_metrics_in_a_json_array_with_commas() {
        let mut fmt = JsonFormatter::new(None);
        let mut out = SendBuffer::default();
        fmt.start_batch(&mut out);

        let host = MockHost { hostname: "web01".into(), charts: vec![], labels: vec![] };
        fmt.start_host(&mut out, &host);

        let chart = MockChart {
            id: "system.cpu".into(),
            context: "system.cpu".into(),
            family: "cpu".into(),
            units: "percentage".into(),
            update_every: 1,
            dims: vec![],
        };
        for dim in ["user", "system"] {
            let ctx = super::MetricContext {
                chart: &chart,
                dim_id: dim,
                dim_name: dim,
                reduced: crate::reducer::Reduced { value: 1.0, last_timestamp: 1 },
            };
            fmt.metric(&mut out, &ctx);
        }
        fmt.end_batch(&mut out);

        let text = String::from_utf8(out.body.clone()).unwrap();
        assert!(text.starts_with('['));
        assert!(text.ends_with(']'));
        assert_eq!(text.matches(',').count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }
}
