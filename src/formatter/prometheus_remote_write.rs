//! Prometheus remote-write formatter: builds a `WriteRequest` protobuf message and
//! snappy-compresses it, per the [remote-write protocol].
//!
//! [remote-write protocol]: https://prometheus.io/docs/concepts/remote_write_spec/

use super::{host_labels_to_send, Formatter, MetricContext};
use crate::buffer::SendBuffer;
use crate::config::InstanceConfig;
use crate::prometheus_sanitize::{sanitize_label_key, sanitize_label_value, sanitize_metric_name};
use crate::tsdb::TsdbHost;

/// A single label, matching the wire shape of `prometheus.WriteRequest`'s
/// `TimeSeries.Label`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// A single sample point.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(int64, tag = "2")]
    pub timestamp_ms: i64,
}

/// One labeled time series carrying exactly one sample per tick (this engine never
/// batches multiple points for the same series into one remote-write request).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

/// The top-level remote-write request message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

pub struct PrometheusRemoteWriteFormatter {
    prefix: Option<String>,
    current_host: String,
    current_host_labels: Vec<(String, String)>,
    pending: Vec<TimeSeries>,
}

impl PrometheusRemoteWriteFormatter {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix, current_host: String::new(), current_host_labels: Vec::new(), pending: Vec::new() }
    }
}

impl Formatter for PrometheusRemoteWriteFormatter {
    fn start_batch(&mut self, _out: &mut SendBuffer) {
        self.pending.clear();
    }

    fn start_host(&mut self, _out: &mut SendBuffer, host: &dyn TsdbHost) {
        self.current_host = host.hostname().to_string();
    }

    fn metric(&mut self, _out: &mut SendBuffer, ctx: &MetricContext<'_>) {
        let raw_name = match &self.prefix {
            Some(p) => format!("{p}_{}_{}", ctx.chart.id(), ctx.dim_id),
            None => format!("{}_{}", ctx.chart.id(), ctx.dim_id),
        };
        let name = sanitize_metric_name(&raw_name.replace('.', "_"));

        let mut labels = vec![Label { name: "__name__".to_string(), value: name }];
        labels.push(Label { name: "instance".to_string(), value: sanitize_label_value(&self.current_host) });
        for (k, v) in &self.current_host_labels {
            labels.push(Label { name: sanitize_label_key(k), value: sanitize_label_value(v) });
        }

        self.pending.push(TimeSeries {
            labels,
            samples: vec![Sample { value: ctx.reduced.value, timestamp_ms: ctx.reduced.last_timestamp * 1000 }],
        });
    }

    fn end_batch(&mut self, out: &mut SendBuffer) {
        let series = std::mem::take(&mut self.pending);
        out.buffered_metrics = series.len();

        let request = WriteRequest { timeseries: series };
        let encoded = ::prost::Message::encode_to_vec(&request);

        match snap::raw::Encoder::new().compress_vec(&encoded) {
            Ok(compressed) => out.body = compressed,
            Err(_) => out.body = encoded,
        }
        out.buffered_bytes = out.body.len();

        out.header.push_str("Content-Type: application/x-protobuf\r\n");
        out.header.push_str("Content-Encoding: snappy\r\n");
        out.header.push_str("X-Prometheus-Remote-Write-Version: 0.1.0\r\n");
    }
}

/// Primes the formatter with the host labels it should attach to every series this
/// tick, per the instance's configured label-sending options.
pub fn prime_host_labels(formatter: &mut PrometheusRemoteWriteFormatter, config: &InstanceConfig, host: &dyn TsdbHost) {
    formatter.current_host_labels = host_labels_to_send(config, host);
}
