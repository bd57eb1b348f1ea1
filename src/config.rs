//! Configuration data model for the exporting engine.
//!
//! Parsing a config *file* is an external concern; this module owns the structs an
//! external loader populates and the bitflag-style `ExportingOptions` the rest of the
//! engine reads. A thin TOML loader is provided as a convenience for tests and small
//! standalone tools, not as the contract boundary itself.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::pattern::SimplePattern;

bitflags::bitflags! {
    /// Per-instance behavior flags, mirroring netdata's `EXPORTING_OPTIONS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExportingOptions: u32 {
        const SOURCE_DATA_AS_COLLECTED = 1 << 0;
        const SOURCE_DATA_AVERAGE      = 1 << 1;
        const SOURCE_DATA_SUM          = 1 << 2;
        const SEND_CONFIGURED_LABELS   = 1 << 3;
        const SEND_AUTOMATIC_LABELS    = 1 << 4;
        const USE_TLS                  = 1 << 5;
        const SEND_NAMES               = 1 << 16;
        const SEND_VARIABLES           = 1 << 17;
        const SEND_TIMESTAMPS          = 1 << 18;
    }
}

const SOURCE_BITS: ExportingOptions = ExportingOptions::from_bits_truncate(
    ExportingOptions::SOURCE_DATA_AS_COLLECTED.bits()
        | ExportingOptions::SOURCE_DATA_AVERAGE.bits()
        | ExportingOptions::SOURCE_DATA_SUM.bits(),
);

impl ExportingOptions {
    /// Returns the configured reduction mode, defaulting to AVERAGE if none of the
    /// source bits are set (netdata's own default for `data source`).
    pub fn reduction_mode(self) -> crate::reducer::ReductionMode {
        use crate::reducer::ReductionMode;
        match self & SOURCE_BITS {
            f if f.contains(ExportingOptions::SOURCE_DATA_AS_COLLECTED) => ReductionMode::AsCollected,
            f if f.contains(ExportingOptions::SOURCE_DATA_SUM) => ReductionMode::Sum,
            _ => ReductionMode::Average,
        }
    }
}

/// Parses the `data source` configuration string (`as collected`, `average`, `sum`)
/// into the corresponding option bit, defaulting to AVERAGE on an unrecognized value.
pub fn parse_data_source(source: &str, mut options: ExportingOptions) -> ExportingOptions {
    options.remove(SOURCE_BITS);
    options
        | match source.trim().to_ascii_lowercase().as_str() {
            "as collected" | "as-collected" | "raw" => ExportingOptions::SOURCE_DATA_AS_COLLECTED,
            "sum" => ExportingOptions::SOURCE_DATA_SUM,
            _ => ExportingOptions::SOURCE_DATA_AVERAGE,
        }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub hostname: String,
    #[serde(default = "default_update_every")]
    pub update_every: u32,
    #[serde(default)]
    pub instances: Vec<RawInstanceConfig>,
}

fn default_update_every() -> u32 {
    10
}

/// The connector type selected for an instance, mirroring
/// `EXPORTING_CONNECTOR_TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorType {
    Graphite,
    GraphiteHttp,
    Json,
    JsonHttp,
    Opentsdb,
    OpentsdbHttp,
    PrometheusRemoteWrite,
    Kinesis,
    Pubsub,
    Mongodb,
}

impl ConnectorType {
    /// Returns whether this connector type is HTTP-framed and therefore eligible for
    /// `USE_TLS`, matching `exporting_tls_is_enabled` in the original C transport.
    pub fn supports_tls(self) -> bool {
        matches!(
            self,
            ConnectorType::GraphiteHttp
                | ConnectorType::JsonHttp
                | ConnectorType::OpentsdbHttp
                | ConnectorType::PrometheusRemoteWrite
        )
    }
}

/// Raw, serde-facing instance configuration as read from a config file or built up in
/// tests.
#[derive(Debug, Clone, Deserialize)]
pub struct RawInstanceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub connector_type: ConnectorType,
    pub destination: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub label_prefix: Option<String>,
    #[serde(default = "default_update_every")]
    pub update_every: u32,
    #[serde(default = "default_buffer_on_failures")]
    pub buffer_on_failures: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default)]
    pub send_configured_labels: bool,
    #[serde(default)]
    pub send_automatic_labels: bool,
    #[serde(default)]
    pub send_names: bool,
    #[serde(default)]
    pub send_variables: bool,
    #[serde(default)]
    pub send_timestamps: bool,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub charts_pattern: Option<String>,
    #[serde(default)]
    pub hosts_pattern: Option<String>,

    #[serde(default)]
    pub remote_write_path: Option<String>,
    #[serde(default)]
    pub kinesis_stream_name: Option<String>,
    #[serde(default)]
    pub kinesis_auth_key_id: Option<String>,
    #[serde(default)]
    pub kinesis_secure_key: Option<String>,
    #[serde(default)]
    pub pubsub_project_id: Option<String>,
    #[serde(default)]
    pub pubsub_topic_id: Option<String>,
    #[serde(default)]
    pub pubsub_credentials_file: Option<String>,
    #[serde(default)]
    pub mongodb_database: Option<String>,
    #[serde(default)]
    pub mongodb_collection: Option<String>,
}

fn default_buffer_on_failures() -> u32 {
    10
}

fn default_timeout_ms() -> u64 {
    20_000
}

/// Validated, ready-to-use instance configuration.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub connector_type: ConnectorType,
    pub destination: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub prefix: Option<String>,
    pub label_prefix: Option<String>,
    pub update_every: u32,
    pub buffer_on_failures: u32,
    pub timeout: Duration,
    pub options: ExportingOptions,
    pub charts_pattern: SimplePattern,
    pub hosts_pattern: SimplePattern,
    pub connector_specific: ConnectorSpecificConfig,
}

/// Connector-specific configuration payloads, mirroring the netdata `*_specific_config`
/// structs.
#[derive(Debug, Clone)]
pub enum ConnectorSpecificConfig {
    None,
    PrometheusRemoteWrite { remote_write_path: String },
    Kinesis { stream_name: String, auth_key_id: String, secure_key: String },
    Pubsub { credentials_file: String, project_id: String, topic_id: String },
    Mongodb { database: String, collection: String },
}

impl InstanceConfig {
    /// Validates and converts a raw, serde-deserialized instance config.
    pub fn from_raw(raw: RawInstanceConfig) -> Result<Self, ConfigError> {
        if raw.destination.trim().is_empty() {
            return Err(ConfigError::MissingDestination(raw.name.clone()));
        }

        let charts_pattern = SimplePattern::parse(raw.charts_pattern.as_deref().unwrap_or(""))
            .map_err(|e| ConfigError::InvalidChartsPattern(raw.name.clone(), e))?;
        let hosts_pattern = SimplePattern::parse(raw.hosts_pattern.as_deref().unwrap_or(""))
            .map_err(|e| ConfigError::InvalidHostsPattern(raw.name.clone(), e))?;

        let mut options = ExportingOptions::empty();
        if raw.send_configured_labels {
            options |= ExportingOptions::SEND_CONFIGURED_LABELS;
        }
        if raw.send_automatic_labels {
            options |= ExportingOptions::SEND_AUTOMATIC_LABELS;
        }
        if raw.send_names {
            options |= ExportingOptions::SEND_NAMES;
        }
        if raw.send_variables {
            options |= ExportingOptions::SEND_VARIABLES;
        }
        if raw.send_timestamps {
            options |= ExportingOptions::SEND_TIMESTAMPS;
        }
        if raw.use_tls && raw.connector_type.supports_tls() {
            options |= ExportingOptions::USE_TLS;
        }
        options = parse_data_source(raw.data_source.as_deref().unwrap_or("average"), options);

        let connector_specific = match raw.connector_type {
            ConnectorType::PrometheusRemoteWrite => ConnectorSpecificConfig::PrometheusRemoteWrite {
                remote_write_path: raw.remote_write_path.clone().ok_or(
                    ConfigError::MissingConnectorField(raw.name.clone(), "remote_write_path"),
                )?,
            },
            ConnectorType::Kinesis => ConnectorSpecificConfig::Kinesis {
                stream_name: raw
                    .kinesis_stream_name
                    .clone()
                    .ok_or(ConfigError::MissingConnectorField(raw.name.clone(), "kinesis_stream_name"))?,
                auth_key_id: raw.kinesis_auth_key_id.clone().unwrap_or_default(),
                secure_key: raw.kinesis_secure_key.clone().unwrap_or_default(),
            },
            ConnectorType::Pubsub => ConnectorSpecificConfig::Pubsub {
                credentials_file: raw.pubsub_credentials_file.clone().unwrap_or_default(),
                project_id: raw
                    .pubsub_project_id
                    .clone()
                    .ok_or(ConfigError::MissingConnectorField(raw.name.clone(), "pubsub_project_id"))?,
                topic_id: raw
                    .pubsub_topic_id
                    .clone()
                    .ok_or(ConfigError::MissingConnectorField(raw.name.clone(), "pubsub_topic_id"))?,
            },
            ConnectorType::Mongodb => ConnectorSpecificConfig::Mongodb {
                database: raw
                    .mongodb_database
                    .clone()
                    .ok_or(ConfigError::MissingConnectorField(raw.name.clone(), "mongodb_database"))?,
                collection: raw
                    .mongodb_collection
                    .clone()
                    .ok_or(ConfigError::MissingConnectorField(raw.name.clone(), "mongodb_collection"))?,
            },
            _ => ConnectorSpecificConfig::None,
        };

        Ok(Self {
            name: raw.name,
            connector_type: raw.connector_type,
            destination: raw.destination,
            username: raw.username,
            password: raw.password,
            prefix: raw.prefix,
            label_prefix: raw.label_prefix,
            update_every: raw.update_every,
            buffer_on_failures: raw.buffer_on_failures,
            timeout: Duration::from_millis(raw.timeout_ms),
            options,
            charts_pattern,
            hosts_pattern,
            connector_specific,
        })
    }
}

/// Loads an [`EngineConfig`] from a TOML string.
pub fn load_str(text: &str) -> Result<EngineConfig, ConfigError> {
    Ok(toml::from_str(text)?)
}

/// Loads an [`EngineConfig`] from a file on disk.
pub fn load_path(path: &std::path::Path) -> Result<EngineConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    load_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduction_mode_defaults_to_average() {
        let opts = ExportingOptions::empty();
        assert!(matches!(opts.reduction_mode(), crate::reducer::ReductionMode::Average));
    }

    #[test]
    fn parse_data_source_recognizes_as_collected() {
        let opts = parse_data_source("as collected", ExportingOptions::empty());
        assert!(matches!(opts.reduction_mode(), crate::reducer::ReductionMode::AsCollected));
    }

    #[test]
    fn instance_config_requires_destination() {
        let raw = RawInstanceConfig {
            name: "g1".into(),
            connector_type: ConnectorType::Graphite,
            destination: "".into(),
            username: None,
            password: None,
            prefix: None,
            label_prefix: None,
            update_every: 10,
            buffer_on_failures: 10,
            timeout_ms: 20_000,
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
        };
        assert!(matches!(InstanceConfig::from_raw(raw), Err(ConfigError::MissingDestination(_))));
    }

    #[test]
    fn plain_graphite_never_supports_tls() {
        assert!(!ConnectorType::Graphite.supports_tls());
        assert!(ConnectorType::GraphiteHttp.supports_tls());
    }
}
