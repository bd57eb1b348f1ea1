//! OpenTSDB telnet line protocol formatter: `put metric timestamp value tag=val ...\n`.

use std::fmt::Write as _;

use super::{host_labels_to_send, prefixed_name, Formatter, MetricContext};
use crate::buffer::SendBuffer;
use crate::config::InstanceConfig;
use crate::tsdb::TsdbHost;

pub struct OpentsdbFormatter {
    prefix: Option<String>,
    host_tags: Vec<(String, String)>,
}

impl OpentsdbFormatter {
    pub fn new(config: &InstanceConfig) -> Self {
        Self { prefix: config.prefix.clone(), host_tags: Vec::new() }
    }
}

impl Formatter for OpentsdbFormatter {
    fn start_host(&mut self, _out: &mut SendBuffer, host: &dyn TsdbHost) {
        self.host_tags = vec![("host".to_string(), sanitize_tag(host.hostname()))];
    }

    fn metric(&mut self, out: &mut SendBuffer, ctx: &MetricContext<'_>) {
        let metric_name =
            prefixed_name(self.prefix.as_deref(), &format!("{}.{}", ctx.chart.id(), ctx.dim_id));

        let mut line = String::new();
        let _ = write!(line, "put {} {} {}", metric_name, ctx.reduced.last_timestamp, ctx.reduced.value);
        for (k, v) in &self.host_tags {
            let _ = write!(line, " {}={}", sanitize_tag(k), sanitize_tag(v));
        }
        line.push('\n');

        out.body_as_string().write_str(&line).ok();
        out.buffered_metrics += 1;
    }
}

/// OpenTSDB tag keys/values are restricted to `[a-zA-Z0-9-_./]`; anything else becomes
/// `_`, matching the defensive sanitization the netdata OpenTSDB connector performs
/// before writing tags.
fn sanitize_tag(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/') { c } else { '_' })
        .collect()
}

/// Registers extra labels (beyond `host`) as additional OpenTSDB tags, honoring the
/// instance's configured label-sending options.
pub fn host_label_tags(config: &InstanceConfig, host: &dyn TsdbHost) -> Vec<(String, String)> {
    host_labels_to_send(config, host).into_iter().map(|(k, v)| (sanitize_tag(&k), sanitize_tag(&v))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectorType, ConnectorSpecificConfig, ExportingOptions};
    use crate::pattern::SimplePattern;
    use crate::tsdb::mock::{MockChart, MockHost};

    fn cfg() -> InstanceConfig {
        InstanceConfig {
            name: "ot".into(),
            connector_type: ConnectorType::Opentsdb,
            destination: "localhost:4242".into(),
            username: None,
            password: None,
            prefix: Some("nd".into()),
            label_prefix: None,
            update_every: 10,
            buffer_on_failures: 10,
            timeout: std::time::Duration::from_secs(1),
            options: ExportingOptions::empty(),
            charts_pattern: SimplePattern::parse("").unwrap(),
            hosts_pattern: SimplePattern::parse("").unwrap(),
            connector_specific: ConnectorSpecificConfig::None,
        }
    }

    #[test]
    fn writes_put_line_with_host_tag() {
        let config = cfg();
        let mut fmt = OpentsdbFormatter::new(&config);
        let mut out = SendBuffer::default();
        let host = MockHost { hostname: "web 01".into(), charts: vec![], labels: vec![] };
        fmt.start_host(&mut out, &host);

        let chart = MockChart {
            id: "system.cpu".into(),
            context: "system.cpu".into(),
            family: "cpu".into(),
            units: "percentage".into(),
            update_every: 1,
            dims: vec![],
        };
        let ctx = super::MetricContext {
            chart: &chart,
            dim_id: "user",
            dim_name: "user",
            reduced: crate::reducer::Reduced { value: 1.0, last_timestamp: 42 },
        };
        fmt.metric(&mut out, &ctx);

        let text = String::from_utf8(out.body.clone()).unwrap();
        assert_eq!(text, "put nd.system.cpu.user 42 1 host=web_01\n");
    }

    #[test]
    fn sanitize_tag_replaces_disallowed_characters() {
        assert_eq!(sanitize_tag("a b/c-d_e.f"), "a_b/c-d_e.f");
    }
}
