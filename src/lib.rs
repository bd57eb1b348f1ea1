//! The metrics exporting engine: a periodic scheduler that feeds samples from a
//! time-series database through a per-sink pipeline of pluggable formatters, a bounded
//! ring of send buffers, and a network transport core (TCP/TLS or an SDK-backed
//! backend), plus a pull-based Prometheus scrape endpoint.
//!
//! The TSDB itself, the chart/dimension registry, configuration file parsing, and the
//! owning daemon's supervisor/signal handling are external collaborators; see
//! [`tsdb`] for the contract this crate expects of the TSDB, and [`config`] for the
//! configuration data model an external loader populates.

pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod formatter;
pub mod instance;
pub mod pattern;
pub mod prometheus_exposition;
pub mod prometheus_sanitize;
pub mod reducer;
pub mod sdk;
pub mod telemetry;
pub mod transport;
pub mod tsdb;

pub use config::{ConnectorType, EngineConfig as RawEngineConfig, InstanceConfig};
pub use engine::{Engine, EngineOptions};
pub use error::{ConfigError, InstanceInitError, SdkError, TransportError};
pub use instance::Instance;

use std::sync::Arc;

use formatter::{
    graphite::GraphiteFormatter, json::JsonFormatter, opentsdb::OpentsdbFormatter,
    prometheus_remote_write::PrometheusRemoteWriteFormatter, Formatter,
};

/// Builds the formatter registered for a given connector type, the Rust analogue of
/// netdata's per-type function-pointer wiring in `init_connectors`.
pub fn build_formatter(instance_config: &InstanceConfig) -> Box<dyn Formatter> {
    match instance_config.connector_type {
        ConnectorType::Graphite | ConnectorType::GraphiteHttp => {
            Box::new(GraphiteFormatter::new(instance_config.prefix.clone()))
        }
        ConnectorType::Json | ConnectorType::JsonHttp => Box::new(JsonFormatter::new(instance_config.prefix.clone())),
        ConnectorType::Opentsdb | ConnectorType::OpentsdbHttp => {
            Box::new(OpentsdbFormatter::new(instance_config))
        }
        ConnectorType::PrometheusRemoteWrite => {
            Box::new(PrometheusRemoteWriteFormatter::new(instance_config.prefix.clone()))
        }
        // SDK-backed connectors format into JSON documents/records rather than a wire
        // protocol text buffer; they share the JSON formatter's shape.
        ConnectorType::Kinesis | ConnectorType::Pubsub | ConnectorType::Mongodb => {
            Box::new(JsonFormatter::new(instance_config.prefix.clone()))
        }
    }
}

/// Builds every configured, enabled instance (and its formatter) from validated
/// engine configuration, the Rust analogue of `init_connectors`/`mark_scheduled_instances`.
/// SDK-backed connector types (Kinesis, Pub/Sub, MongoDB) additionally connect their
/// backend here, since that requires `.await`. A configuration or init error drops only
/// the offending instance (logged); the engine still starts with the rest.
pub async fn build_instances(
    raw: &config::EngineConfig,
    telemetry_sink: Option<&Arc<dyn tsdb::TelemetrySink>>,
) -> Result<Vec<Arc<Instance>>, InstanceInitError> {
    let mut out = Vec::with_capacity(raw.instances.len());
    for raw_instance in raw.instances.iter().cloned() {
        let name = raw_instance.name.clone();
        match build_one_instance(raw_instance, telemetry_sink).await {
            Ok(instance) => out.push(Arc::new(instance)),
            Err(e) => tracing::error!(instance = %name, error = %e, "dropping instance: failed to initialize"),
        }
    }
    Ok(out)
}

async fn build_one_instance(
    raw_instance: config::RawInstanceConfig,
    telemetry_sink: Option<&Arc<dyn tsdb::TelemetrySink>>,
) -> Result<Instance, InstanceInitError> {
    let instance_config = InstanceConfig::from_raw(raw_instance)?;
    let formatter = build_formatter(&instance_config);
    let mut instance = Instance::new(instance_config.clone(), formatter);

    if instance_config.options.contains(config::ExportingOptions::USE_TLS) {
        let tls_config = transport::build_tls_client_config()
            .map_err(|e| InstanceInitError::TlsSetup(instance_config.name.clone(), e))?;
        instance = instance.with_tls_config(tls_config);
    }
    if let Some(sink) = telemetry_sink {
        instance = instance.with_telemetry_sink(sink.clone());
    }

    attach_sdk_sink(instance, &instance_config).await
}

/// Connects and attaches the SDK-backed sink for `config`'s connector type, a no-op for
/// connector types that send over the plain transport instead.
async fn attach_sdk_sink(instance: Instance, config: &InstanceConfig) -> Result<Instance, InstanceInitError> {
    use crate::config::ConnectorSpecificConfig;

    match (config.connector_type, &config.connector_specific) {
        #[cfg(feature = "kinesis")]
        (ConnectorType::Kinesis, ConnectorSpecificConfig::Kinesis { stream_name, auth_key_id, secure_key }) => {
            let sink = if auth_key_id.is_empty() {
                sdk::kinesis::KinesisSink::connect(stream_name.clone()).await
            } else {
                sdk::kinesis::KinesisSink::connect_with_keys(stream_name.clone(), auth_key_id, secure_key).await
            };
            Ok(instance.with_sdk_sink(Arc::new(sink)))
        }
        #[cfg(not(feature = "kinesis"))]
        (ConnectorType::Kinesis, _) => {
            Err(InstanceInitError::SdkSinkInit(config.name.clone(), SdkError::FeatureDisabled("kinesis")))
        }

        #[cfg(feature = "pubsub")]
        (ConnectorType::Pubsub, ConnectorSpecificConfig::Pubsub { project_id, topic_id, .. }) => {
            let sink = sdk::pubsub::PubsubSink::connect(project_id, topic_id, None)
                .await
                .map_err(|e| InstanceInitError::SdkSinkInit(config.name.clone(), e))?;
            Ok(instance.with_sdk_sink(Arc::new(sink)))
        }
        #[cfg(not(feature = "pubsub"))]
        (ConnectorType::Pubsub, _) => {
            Err(InstanceInitError::SdkSinkInit(config.name.clone(), SdkError::FeatureDisabled("pubsub")))
        }

        #[cfg(feature = "mongodb-sink")]
        (ConnectorType::Mongodb, ConnectorSpecificConfig::Mongodb { database, collection }) => {
            let sink = sdk::mongodb::MongoDbSink::connect(&config.destination, database, collection)
                .await
                .map_err(|e| InstanceInitError::SdkSinkInit(config.name.clone(), e))?;
            Ok(instance.with_sdk_sink(Arc::new(sink)))
        }
        #[cfg(not(feature = "mongodb-sink"))]
        (ConnectorType::Mongodb, _) => {
            Err(InstanceInitError::SdkSinkInit(config.name.clone(), SdkError::FeatureDisabled("mongodb-sink")))
        }

        _ => Ok(instance),
    }
}

/// Installs a `tracing` subscriber reading its filter from `RUST_LOG`, falling back to
/// `info`. Call once from the owning binary's `main`.
pub fn install_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Everything needed to run the engine: its scheduler and every instance's worker task,
/// plus (if bound) the Prometheus scrape listener. Dropping this does not stop the
/// spawned tasks; call [`Running::shutdown`] to request a clean stop.
pub struct Running {
    pub engine: Arc<engine::Engine>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
    scrape_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Running {
    /// Requests the scheduler loop to exit after its current tick and aborts the scrape
    /// listener (which otherwise blocks forever in its accept loop).
    pub fn shutdown(&self) {
        self.engine.request_exit();
        if let Some(handle) = &self.scrape_handle {
            handle.abort();
        }
    }

    /// Waits for every instance worker task to finish (normally only after their
    /// instance was disabled or the process is shutting down).
    pub async fn join_workers(self) {
        for handle in self.worker_handles {
            let _ = handle.await;
        }
    }
}

/// Wires together the pieces built from a loaded [`config::EngineConfig`]: constructs
/// every instance, spawns each instance's worker loop, spawns the scheduler's periodic
/// tick loop against `host_provider`, and (if `scrape_addr` is set) binds and spawns the
/// Prometheus scrape endpoint. This is the composition root an owning binary's `main`
/// would otherwise have to hand-assemble from the library's individual pieces.
pub async fn spawn(
    raw: &config::EngineConfig,
    host_provider: impl Fn() -> Vec<Box<dyn tsdb::TsdbHost>> + Send + Sync + 'static,
    scrape_addr: Option<std::net::SocketAddr>,
    telemetry_sink: Option<Arc<dyn tsdb::TelemetrySink>>,
) -> Result<Running, InstanceInitError> {
    let instances = build_instances(raw, telemetry_sink.as_ref()).await?;
    let host_provider = Arc::new(host_provider);

    let worker_handles = instances.iter().cloned().map(|instance| tokio::spawn(instance.run_worker())).collect();

    let engine_options = EngineOptions { hostname: raw.hostname.clone(), update_every: raw.update_every };
    let engine = Arc::new(Engine::new(engine_options, instances));

    let scrape_handle = if let Some(addr) = scrape_addr {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| InstanceInitError::DestinationResolution("prometheus_scrape".into(), e))?;
        let provider_for_scrape = host_provider.clone();
        let service = Arc::new(prometheus_exposition::ScrapeService {
            config: default_scrape_config(raw),
            table: Arc::new(prometheus_exposition::ScraperTable::new()),
            cache: Arc::new(prometheus_exposition::ChartDecisionCache::new()),
            allowed_addresses: None,
            host_provider: Box::new(move || provider_for_scrape()),
        });
        Some(tokio::spawn(prometheus_exposition::serve(listener, service)))
    } else {
        None
    };

    {
        let engine = engine.clone();
        let provider_for_tick = host_provider.clone();
        tokio::spawn(async move { engine.run(move || provider_for_tick()).await });
    }

    Ok(Running { engine, worker_handles, scrape_handle })
}

/// A permissive `InstanceConfig` for the scrape endpoint's own reduction/pattern
/// behavior, since a scrape target isn't one of the configured push instances.
fn default_scrape_config(raw: &config::EngineConfig) -> InstanceConfig {
    InstanceConfig {
        name: "prometheus_scrape".into(),
        // connector_type is unused by the scrape path (no push destination); any
        // variant works here, it only needs to exist to satisfy the struct.
        connector_type: ConnectorType::Graphite,
        destination: String::new(),
        username: None,
        password: None,
        prefix: None,
        label_prefix: None,
        update_every: raw.update_every,
        buffer_on_failures: 1,
        timeout: std::time::Duration::from_secs(1),
        options: config::ExportingOptions::SOURCE_DATA_AVERAGE,
        charts_pattern: pattern::SimplePattern::parse("").expect("empty pattern always parses"),
        hosts_pattern: pattern::SimplePattern::parse("").expect("empty pattern always parses"),
        connector_specific: config::ConnectorSpecificConfig::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectorType, RawInstanceConfig};

    #[tokio::test]
    async fn build_instances_drops_invalid_instance_without_panicking() {
        let raw = config::EngineConfig {
            hostname: "agent".into(),
            update_every: 10,
            instances: vec![RawInstanceConfig {
                name: "broken".into(),
                connector_type: ConnectorType::Graphite,
                destination: "".into(),
                username: None,
                password: None,
                prefix: None,
                label_prefix: None,
                update_every: 10,
                buffer_on_failures: 10,
                timeout_ms: 1000,
                data_source: None,
                send_configured_labels: false,
                send_automatic_labels: false,
                send_names: false,
                send_variables: false,
                send_timestamps: false,
                use_tls: false,
                charts_pattern: None,
                hosts_pattern: None,
                remote_write_path: None,
                kinesis_stream_name: None,
                kinesis_auth_key_id: None,
                kinesis_secure_key: None,
                pubsub_project_id: None,
                pubsub_topic_id: None,
                pubsub_credentials_file: None,
                mongodb_database: None,
                mongodb_collection: None,
            }],
        };

        let instances = build_instances(&raw, None).await.unwrap();
        assert!(instances.is_empty());
    }

    #[tokio::test]
    async fn use_tls_on_an_http_connector_builds_a_tls_aware_instance() {
        let raw = RawInstanceConfig {
            name: "tls1".into(),
            connector_type: ConnectorType::GraphiteHttp,
            destination: "metrics.example.com:443".into(),
            username: None,
            password: None,
            prefix: None,
            label_prefix: None,
            update_every: 10,
            buffer_on_failures: 10,
            timeout_ms: 1000,
            data_source: None,
            send_configured_labels: false,
            send_automatic_labels: false,
            send_names: false,
            send_variables: false,
            send_timestamps: false,
            use_tls: true,
            charts_pattern: None,
            hosts_pattern: None,
            remote_write_path: None,
            kinesis_stream_name: None,
            kinesis_auth_key_id: None,
            kinesis_secure_key: None,
            pubsub_project_id: None,
            pubsub_topic_id: None,
            pubsub_credentials_file: None,
            mongodb_database: None,
            mongodb_collection: None,
        };

        let instance = build_one_instance(raw, None).await.unwrap();
        assert!(instance.tls_config.is_some());
    }
}
