//! Plain-text Graphite line protocol formatter: `path value timestamp\n`.

use std::fmt::Write as _;

use super::{prefixed_name, Formatter, MetricContext};
use crate::buffer::SendBuffer;
use crate::tsdb::TsdbHost;

pub struct GraphiteFormatter {
    prefix: Option<String>,
    current_host: String,
}

impl GraphiteFormatter {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix, current_host: String::new() }
    }
}

impl Formatter for GraphiteFormatter {
    fn start_host(&mut self, _out: &mut SendBuffer, host: &dyn TsdbHost) {
        self.current_host = sanitize_path_segment(host.hostname());
    }

    fn metric(&mut self, out: &mut SendBuffer, ctx: &MetricContext<'_>) {
        let path = format!(
            "{}.{}.{}",
            self.current_host,
            sanitize_path_segment(ctx.chart.id()),
            sanitize_path_segment(ctx.dim_id)
        );
        let path = prefixed_name(self.prefix.as_deref(), &path);
        let _ = writeln!(out.body_as_string(), "{} {} {}", path, ctx.reduced.value, ctx.reduced.last_timestamp);
        out.buffered_metrics += 1;
    }
}

/// Graphite paths use `.` as a separator, so any literal dot in a name/id is replaced.
fn sanitize_path_segment(s: &str) -> String {
    s.chars().map(|c| if c == '.' || c.is_whitespace() { '_' } else { c }).collect()
}
