//! The pluggable formatter registry.
//!
//! Netdata's `struct instance` carries eight function pointers
//! (`start_batch_formatting` .. `end_batch_formatting`) that the pipeline driver calls
//! in a fixed order for each tick. This module models that as a `Formatter` trait with
//! one method per callback, object-safe so an `Instance` can hold a `Box<dyn
//! Formatter>` selected at configuration time.

pub mod graphite;
pub mod json;
pub mod opentsdb;
pub mod prometheus_remote_write;

use crate::buffer::SendBuffer;
use crate::config::InstanceConfig;
use crate::reducer::Reduced;
use crate::tsdb::{LabelSource, TsdbChart, TsdbHost};

/// One metric ready to be written out, already reduced to a single value.
pub struct MetricContext<'a> {
    pub chart: &'a dyn TsdbChart,
    pub dim_id: &'a str,
    pub dim_name: &'a str,
    pub reduced: Reduced,
}

/// The eight-callback formatter contract driven by the pipeline for every tick.
pub trait Formatter: Send {
    fn start_batch(&mut self, _out: &mut SendBuffer) {}

    fn start_host(&mut self, out: &mut SendBuffer, host: &dyn TsdbHost);

    fn start_chart(&mut self, _out: &mut SendBuffer, _chart: &dyn TsdbChart) {}

    fn metric(&mut self, out: &mut SendBuffer, ctx: &MetricContext<'_>);

    fn end_chart(&mut self, _out: &mut SendBuffer, _chart: &dyn TsdbChart) {}

    fn variables(&mut self, _out: &mut SendBuffer, _host: &dyn TsdbHost) {}

    fn end_host(&mut self, _out: &mut SendBuffer, _host: &dyn TsdbHost) {}

    fn end_batch(&mut self, _out: &mut SendBuffer) {}
}

/// Builds the configured labels iterator a formatter should emit for a host, honoring
/// `SEND_CONFIGURED_LABELS` / `SEND_AUTOMATIC_LABELS`.
pub fn host_labels_to_send<'a>(
    config: &InstanceConfig,
    host: &'a dyn TsdbHost,
) -> Vec<(String, String)> {
    use crate::config::ExportingOptions;

    host.labels()
        .into_iter()
        .filter(|(_, _, src)| match src {
            LabelSource::Configured => config.options.contains(ExportingOptions::SEND_CONFIGURED_LABELS),
            LabelSource::Automatic => config.options.contains(ExportingOptions::SEND_AUTOMATIC_LABELS),
        })
        .map(|(k, v, _)| (k, v))
        .collect()
}

/// Prefixes a metric name with the instance's configured `prefix`, if any, joined with
/// a single `.` the way netdata's `exporting_name_copy` concatenates prefix + name.
pub fn prefixed_name(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(p) if !p.is_empty() => format!("{p}.{name}"),
        _ => name.to_string(),
    }
}
