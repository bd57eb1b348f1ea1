//! The pull-based Prometheus scrape endpoint: `/api/v1/allmetrics?format=prometheus`.
//!
//! Grounded on `prometheus.c`: a per-`(server_name, host)` last-access table guards the
//! reduction window for each independent scraper, `can_send_rrdset`'s chart-pattern
//! decision is cached per chart rather than re-evaluated every scrape, and charts
//! sharing a context are considered "homogeneous" (their dimensions share one metric
//! name, disambiguated only by a `dimension` label) versus "heterogeneous" (each
//! dimension gets its own metric name), mirroring the original's homogeneous-chart
//! detection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{ExportingOptions, InstanceConfig};
use crate::prometheus_sanitize::{sanitize_description, sanitize_label_key, sanitize_label_value, sanitize_metric_name};
use crate::reducer::reduce;
use crate::tsdb::{Algorithm, LabelSource, TsdbChart, TsdbHost};

/// The application name reported on `netdata_info`, independent of the connector's own
/// `name`.
const APPLICATION_NAME: &str = "netdata";

/// Key identifying one independent scraper: the client-supplied `server` name (from
/// `?server=` or the request's source address) paired with the host being scraped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScraperKey {
    pub server_name: String,
    pub host: String,
}

/// The scraper state table: `(server_name, host) -> last_access_time`, guarded by a
/// single mutex exactly as `prometheus_server_root_mutex` guards the original's linked
/// list.
#[derive(Default)]
pub struct ScraperTable {
    last_access: Mutex<HashMap<ScraperKey, i64>>,
}

impl ScraperTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `now` as the last access for `key` and returns the previous access
    /// time, if any — the reduction window for this scrape is `(previous, now]`.
    pub fn record_access(&self, key: ScraperKey, now: i64) -> Option<i64> {
        self.last_access.lock().insert(key, now)
    }

    /// Drops scraper entries that have not been seen in `max_age` seconds, mirroring
    /// `prometheus_clean_server_root`'s periodic sweep.
    pub fn clean(&self, now: i64, max_age: i64) {
        self.last_access.lock().retain(|_, &mut last| now - last <= max_age);
    }

    pub fn len(&self) -> usize {
        self.last_access.lock().len()
    }
}

/// Caches the per-chart send/ignore decision so repeated scrapes don't re-evaluate the
/// charts pattern against every chart every time, mirroring
/// `RRDSET_FLAG_EXPORTING_SEND`/`RRDSET_FLAG_EXPORTING_IGNORE`.
#[derive(Default)]
pub struct ChartDecisionCache {
    decisions: Mutex<HashMap<String, bool>>,
}

impl ChartDecisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_send(&self, config: &InstanceConfig, chart: &dyn TsdbChart) -> bool {
        if let Some(&decision) = self.decisions.lock().get(chart.id()) {
            return decision;
        }
        let decision = config.charts_pattern.matches(chart.id());
        self.decisions.lock().insert(chart.id().to_string(), decision);
        decision
    }

    pub fn invalidate(&self, chart_id: &str) {
        self.decisions.lock().remove(chart_id);
    }
}

/// Renders one scrape's worth of Prometheus exposition text for `hosts`: a
/// `netdata_info{...} 1` identity line and, if enabled, each host's custom variables,
/// followed by every chart's dimensions reduced over `(after, before]`. Writes one
/// `HELP`/`TYPE` pair per emitted metric name regardless of how many hosts/charts share
/// it (HELP/TYPE deduplication).
pub fn render(
    config: &InstanceConfig,
    cache: &ChartDecisionCache,
    hosts: &[Box<dyn TsdbHost>],
    after: i64,
    before: i64,
) -> String {
    let mode = config.options.reduction_mode();
    let mut out = String::new();
    let mut context_emitted: HashMap<String, ()> = HashMap::new();
    let ts = config.options.contains(ExportingOptions::SEND_TIMESTAMPS).then_some(before * 1000);

    for host in hosts {
        if !config.hosts_pattern.matches(host.hostname()) {
            continue;
        }

        write_info_line(&mut out, config, host.as_ref(), ts);

        if config.options.contains(ExportingOptions::SEND_VARIABLES) {
            for (name, value) in host.variables() {
                let metric_name = format!("netdata_{}", sanitize_metric_name(&name));
                write_metric_line(&mut out, &metric_name, &[], value, ts);
            }
        }

        for chart in host.charts() {
            if !cache.can_send(config, chart.as_ref()) {
                continue;
            }

            let homogeneous = is_homogeneous(chart.as_ref());
            let context_name = format!("netdata_{}", sanitize_metric_name(chart.context()));
            let units_suffix = unit_suffix(chart.units());
            let ue = chart.update_every();

            if homogeneous {
                let algorithm = chart.dims().first().map(|d| d.algorithm()).unwrap_or(Algorithm::Absolute);
                let (mode_suffix, metric_type) = metric_suffix_and_type(mode, algorithm);
                let metric_name = format!("{context_name}{units_suffix}{mode_suffix}");

                if !context_emitted.contains_key(&metric_name) {
                    write_help_line(&mut out, &metric_name, &format!("{} ({})", chart.context(), chart.units()));
                    write_type_line(&mut out, &metric_name, metric_type);
                    context_emitted.insert(metric_name.clone(), ());
                }

                for dim in chart.dims() {
                    let reduced = reduce(ue, after, before, dim.oldest_and_latest(), mode, |a, b| dim.points_in_range(a, b));
                    let Some(reduced) = reduced else { continue };

                    let labels = vec![
                        format!("{}=\"{}\"", sanitize_label_key("chart"), sanitize_label_value(chart.id())),
                        format!("{}=\"{}\"", sanitize_label_key("family"), sanitize_label_value(chart.family())),
                        format!("{}=\"{}\"", sanitize_label_key("dimension"), sanitize_label_value(dim.id())),
                    ];
                    write_metric_line(&mut out, &metric_name, &labels, reduced.value, ts);
                }
            } else {
                for dim in chart.dims() {
                    let (mode_suffix, metric_type) = metric_suffix_and_type(mode, dim.algorithm());
                    let full = format!("{}_{}", chart.context(), dim.id());
                    let metric_name = format!("netdata_{}{units_suffix}{mode_suffix}", sanitize_metric_name(&full));

                    if !context_emitted.contains_key(&metric_name) {
                        write_help_line(&mut out, &metric_name, &format!("{} ({})", chart.name(), chart.units()));
                        write_type_line(&mut out, &metric_name, metric_type);
                        context_emitted.insert(metric_name.clone(), ());
                    }

                    let reduced = reduce(ue, after, before, dim.oldest_and_latest(), mode, |a, b| dim.points_in_range(a, b));
                    let Some(reduced) = reduced else { continue };

                    let labels = vec![
                        format!("{}=\"{}\"", sanitize_label_key("chart"), sanitize_label_value(chart.id())),
                        format!("{}=\"{}\"", sanitize_label_key("family"), sanitize_label_value(chart.family())),
                    ];
                    write_metric_line(&mut out, &metric_name, &labels, reduced.value, ts);
                }
            }
        }
    }

    out
}

/// Writes the per-scrape identity line every other metric implicitly belongs to,
/// carrying the host's configured/automatic labels when the instance is set up to send
/// them.
fn write_info_line(out: &mut String, config: &InstanceConfig, host: &dyn TsdbHost, ts: Option<i64>) {
    let mut labels = vec![
        format!("{}=\"{}\"", sanitize_label_key("instance"), sanitize_label_value(host.hostname())),
        format!("{}=\"{}\"", sanitize_label_key("application"), sanitize_label_value(APPLICATION_NAME)),
        format!("{}=\"{}\"", sanitize_label_key("version"), sanitize_label_value(env!("CARGO_PKG_VERSION"))),
    ];
    for (key, value, source) in host.labels() {
        let send = match source {
            LabelSource::Configured => config.options.contains(ExportingOptions::SEND_CONFIGURED_LABELS),
            LabelSource::Automatic => config.options.contains(ExportingOptions::SEND_AUTOMATIC_LABELS),
        };
        if send {
            labels.push(format!("{}=\"{}\"", sanitize_label_key(&key), sanitize_label_value(&value)));
        }
    }
    write_metric_line(out, "netdata_info", &labels, 1.0, ts);
}

/// A chart is homogeneous when every dimension collects and scales its values the same
/// way: same algorithm, same multiplier, same divisor. Homogeneous dimensions share one
/// metric name disambiguated by a `dimension` label; heterogeneous charts give each
/// dimension its own metric name instead, to avoid silently merging incomparable series.
fn is_homogeneous(chart: &dyn TsdbChart) -> bool {
    let dims = chart.dims();
    let Some(first) = dims.first() else { return true };
    dims.iter().all(|d| d.algorithm() == first.algorithm() && d.multiplier() == first.multiplier() && d.divisor() == first.divisor())
}

/// The metric-name suffix and Prometheus type for one dimension's reduction mode and
/// collection algorithm. AS_COLLECTED dimensions whose algorithm is monotonically
/// increasing (INCREMENTAL, PCENT_OVER_DIFF_TOTAL) expose as Prometheus counters with a
/// `_total` suffix, matching the convention Prometheus client libraries use for
/// cumulative counters; every other combination is a gauge.
fn metric_suffix_and_type(mode: crate::reducer::ReductionMode, algorithm: Algorithm) -> (&'static str, &'static str) {
    use crate::reducer::ReductionMode;
    match mode {
        ReductionMode::AsCollected => match algorithm {
            Algorithm::Incremental | Algorithm::PcentOverDiffTotal => ("_total", "counter"),
            Algorithm::Absolute | Algorithm::PcentOverRowTotal => ("", "gauge"),
        },
        ReductionMode::Average => ("_average", "gauge"),
        ReductionMode::Sum => ("_sum", "gauge"),
    }
}

/// Maps a chart's unit string to the `_unitname` metric-name suffix, aliasing a few
/// common unit spellings (OLDUNITS) the way the original exposition does: `%` becomes
/// `_percent`, and a trailing `/s` becomes `_persec` rather than a literal `_ s`.
/// Charts with no meaningful unit (empty or `unknown`) get no suffix at all.
fn unit_suffix(units: &str) -> String {
    let units = units.trim();
    if units.is_empty() || units.eq_ignore_ascii_case("unknown") {
        return String::new();
    }
    if units == "%" {
        return "_percent".to_string();
    }
    if let Some(prefix) = units.strip_suffix("/s") {
        return format!("_{}_persec", sanitize_metric_name(prefix));
    }
    format!("_{}", sanitize_metric_name(units))
}

fn write_help_line(out: &mut String, name: &str, desc: &str) {
    out.push_str("# HELP ");
    out.push_str(name);
    out.push(' ');
    out.push_str(&sanitize_description(desc));
    out.push('\n');
}

fn write_type_line(out: &mut String, name: &str, metric_type: &str) {
    out.push_str("# TYPE ");
    out.push_str(name);
    out.push(' ');
    out.push_str(metric_type);
    out.push('\n');
}

/// Writes one sample line, filtering out non-finite values (`reduce` already excludes
/// these for stored-data reductions, but AS_COLLECTED values come straight from the
/// TSDB and may still be NaN/Inf if a dimension was never collected).
fn write_metric_line(out: &mut String, name: &str, labels: &[String], value: f64, ts: Option<i64>) {
    if !value.is_finite() {
        return;
    }
    out.push_str(name);
    if !labels.is_empty() {
        out.push('{');
        out.push_str(&labels.join(","));
        out.push('}');
    }
    out.push(' ');
    out.push_str(&value.to_string());
    if let Some(ts) = ts {
        out.push(' ');
        out.push_str(&ts.to_string());
    }
    out.push('\n');
}

/// Wraps a [`ScraperTable`] and [`ChartDecisionCache`] for a hyper service handler, the
/// way `http_listener.rs`'s `HttpListeningExporter` wraps its recorder handle.
pub struct ScrapeService {
    pub config: InstanceConfig,
    pub table: Arc<ScraperTable>,
    pub cache: Arc<ChartDecisionCache>,
    pub allowed_addresses: Option<Vec<ipnet::IpNet>>,
    pub host_provider: Box<dyn Fn() -> Vec<Box<dyn TsdbHost>> + Send + Sync>,
}

impl ScrapeService {
    /// Returns whether `addr` is allowed to scrape, per the configured allowlist.
    /// An empty/absent allowlist permits everyone, matching the default-open scrape
    /// endpoint behavior.
    pub fn is_allowed(&self, addr: std::net::IpAddr) -> bool {
        match &self.allowed_addresses {
            None => true,
            Some(nets) => nets.iter().any(|n| n.contains(&addr)),
        }
    }

    /// Serves one scrape request for `server_name`, advancing each selected host's
    /// scraper window and rendering its exposition text. `all_hosts` selects between
    /// `format=prometheus` (this agent's own host only) and `format=prometheus_all_hosts`
    /// (every host known to this agent, federated into one response).
    pub fn handle_scrape(&self, server_name: &str, now: i64, all_hosts: bool) -> String {
        let hosts = (self.host_provider)();
        let selected = if all_hosts { hosts.len() } else { hosts.len().min(1) };

        let mut out = String::new();
        for host in &hosts[..selected] {
            let key = ScraperKey { server_name: server_name.to_string(), host: host.hostname().to_string() };
            let after = self.table.record_access(key, now).unwrap_or(now - self.config.update_every as i64);
            out.push_str(&render(&self.config, &self.cache, std::slice::from_ref(host), after, now));
        }
        out
    }
}

/// Runs the hyper HTTP server for the scrape endpoint on `listener`, accepting
/// connections forever. Grounded on `http_listener.rs`'s `serve_tcp`/
/// `process_tcp_stream`: one spawned task per connection, each running hyper's
/// single-connection HTTP/1.1 loop over a `service_fn` closure.
pub async fn serve(listener: tokio::net::TcpListener, service: Arc<ScrapeService>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "error accepting scrape connection");
                continue;
            }
        };

        let service = service.clone();
        let allowed = service.is_allowed(peer_addr.ip());

        tokio::spawn(async move {
            let handler = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let service = service.clone();
                async move { Ok::<_, std::convert::Infallible>(respond(&service, allowed, &req)) }
            });

            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(hyper_util::rt::TokioIo::new(stream), handler)
                .await
            {
                tracing::warn!(error = %err, "error serving scrape connection");
            }
        });
    }
}

fn respond(
    service: &ScrapeService,
    allowed: bool,
    req: &hyper::Request<hyper::body::Incoming>,
) -> hyper::Response<http_body_util::Full<bytes::Bytes>> {
    use hyper::{Response, StatusCode};

    if !allowed {
        return Response::builder()
            .status(StatusCode::FORBIDDEN)
            .body(http_body_util::Full::new(bytes::Bytes::from_static(b"forbidden")))
            .unwrap_or_default();
    }

    if req.uri().path() != "/api/v1/allmetrics" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(http_body_util::Full::new(bytes::Bytes::from_static(b"not found")))
            .unwrap_or_default();
    }

    let query = req.uri().query().unwrap_or("");
    let server_name = url_decode_query_param(query, "server").unwrap_or_else(|| "default".to_string());
    let all_hosts = url_decode_query_param(query, "format").as_deref() == Some("prometheus_all_hosts");

    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
    let body = service.handle_scrape(&server_name, now, all_hosts);

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(http_body_util::Full::new(bytes::Bytes::from(body)))
        .unwrap_or_default()
}

/// Extracts one query parameter's value, without pulling in a full URL-encoding crate
/// for a single well-known, rarely-special-character parameter.
fn url_decode_query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.replace('+', " "))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectorSpecificConfig, ConnectorType, ExportingOptions};
    use crate::pattern::SimplePattern;
    use crate::tsdb::mock::{MockChart, MockDim, MockHost};
    use crate::tsdb::Point;

    fn cfg() -> InstanceConfig {
        InstanceConfig {
            name: "prom".into(),
            connector_type: ConnectorType::Graphite,
            destination: "".into(),
            username: None,
            password: None,
            prefix: None,
            label_prefix: None,
            update_every: 10,
            buffer_on_failures: 10,
            timeout: std::time::Duration::from_secs(1),
            options: ExportingOptions::SOURCE_DATA_AVERAGE,
            charts_pattern: SimplePattern::parse("").unwrap(),
            hosts_pattern: SimplePattern::parse("").unwrap(),
            connector_specific: ConnectorSpecificConfig::None,
        }
    }

    fn host_with(dims: Vec<MockDim>) -> Vec<Box<dyn TsdbHost>> {
        vec![Box::new(MockHost {
            hostname: "web01".into(),
            charts: vec![MockChart {
                id: "system.cpu".into(),
                context: "system.cpu".into(),
                family: "cpu".into(),
                units: "percentage".into(),
                update_every: 1,
                dims,
            }],
            labels: vec![],
        })]
    }

    #[test]
    fn single_dim_chart_is_homogeneous_and_gets_one_help_type_pair() {
        let config = cfg();
        let cache = ChartDecisionCache::new();
        let hosts = host_with(vec![MockDim::new("user", vec![Point { timestamp: 5, value: 1.0 }])]);
        let text = render(&config, &cache, &hosts, 0, 10);
        assert_eq!(text.matches("# HELP").count(), 2, "netdata_info plus the one chart metric");
        assert_eq!(text.matches("# TYPE").count(), 2);
        assert!(text.contains("netdata_system_cpu_percentage_average{"));
        assert!(text.contains("netdata_info{"));
    }

    #[test]
    fn homogeneous_multi_dim_chart_shares_one_metric_name_with_dimension_labels() {
        let config = cfg();
        let cache = ChartDecisionCache::new();
        let hosts = host_with(vec![
            MockDim::new("user", vec![Point { timestamp: 5, value: 1.0 }]),
            MockDim::new("system", vec![Point { timestamp: 5, value: 2.0 }]),
        ]);
        let text = render(&config, &cache, &hosts, 0, 10);
        assert_eq!(text.matches("# HELP netdata_system_cpu_percentage_average").count(), 1);
        assert!(text.contains("dimension=\"user\""));
        assert!(text.contains("dimension=\"system\""));
    }

    #[test]
    fn heterogeneous_dims_with_different_multipliers_get_separate_metric_names() {
        let mut config = cfg();
        config.options = ExportingOptions::SOURCE_DATA_AS_COLLECTED;
        let cache = ChartDecisionCache::new();
        let hosts = host_with(vec![
            MockDim::new("in", vec![Point { timestamp: 5, value: 10.0 }]).with_algorithm(Algorithm::Incremental),
            MockDim::new("out", vec![Point { timestamp: 5, value: 20.0 }]).with_multiplier(8),
        ]);
        let text = render(&config, &cache, &hosts, 0, 10);
        assert!(text.contains("# TYPE netdata_system_cpu_in_percentage_total counter"));
        assert!(text.contains("# TYPE netdata_system_cpu_out_percentage gauge"));
        assert!(text.contains("netdata_system_cpu_in_percentage_total{"));
        assert!(text.contains("netdata_system_cpu_out_percentage{"));
    }

    #[test]
    fn chart_decision_is_cached_after_first_lookup() {
        let config = cfg();
        let cache = ChartDecisionCache::new();
        let chart = MockChart {
            id: "system.cpu".into(),
            context: "system.cpu".into(),
            family: "cpu".into(),
            units: "percentage".into(),
            update_every: 1,
            dims: vec![],
        };
        assert!(cache.can_send(&config, &chart));
        assert!(cache.decisions.lock().contains_key("system.cpu"));
    }

    #[test]
    fn scraper_table_tracks_last_access_per_key() {
        let table = ScraperTable::new();
        let key = ScraperKey { server_name: "prometheus1".into(), host: "web01".into() };
        assert_eq!(table.record_access(key.clone(), 100), None);
        assert_eq!(table.record_access(key, 110), Some(100));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn scraper_table_clean_evicts_stale_entries() {
        let table = ScraperTable::new();
        table.record_access(ScraperKey { server_name: "p1".into(), host: "h".into() }, 0);
        table.clean(1000, 60);
        assert_eq!(table.len(), 0);
    }

    fn service_with_two_hosts() -> ScrapeService {
        let hostnames = vec!["web01".to_string(), "web02".to_string()];
        ScrapeService {
            config: cfg(),
            table: Arc::new(ScraperTable::new()),
            cache: Arc::new(ChartDecisionCache::new()),
            allowed_addresses: None,
            host_provider: Box::new(move || {
                hostnames
                    .iter()
                    .cloned()
                    .map(|hostname| Box::new(MockHost { hostname, charts: vec![], labels: vec![] }) as Box<dyn TsdbHost>)
                    .collect()
            }),
        }
    }

    #[test]
    fn handle_scrape_single_host_tracks_only_the_first_host() {
        let service = service_with_two_hosts();
        service.handle_scrape("prometheus1", 100, false);
        assert_eq!(service.table.len(), 1);
    }

    #[test]
    fn handle_scrape_all_hosts_tracks_every_host_independently() {
        let service = service_with_two_hosts();
        service.handle_scrape("prometheus1", 100, true);
        assert_eq!(service.table.len(), 2);
    }
}
