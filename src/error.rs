//! Error types for the exporting engine.

use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("instance '{0}' has no destination configured")]
    MissingDestination(String),

    #[error("instance '{0}' has an invalid charts pattern: {1}")]
    InvalidChartsPattern(String, String),

    #[error("instance '{0}' has an invalid hosts pattern: {1}")]
    InvalidHostsPattern(String, String),

    #[error("instance '{0}' selects an unknown connector type '{1}'")]
    UnknownConnectorType(String, String),

    #[error("instance '{0}' is missing required connector-specific field '{1}'")]
    MissingConnectorField(String, &'static str),
}

/// Errors surfaced while bringing up an instance.
#[derive(Debug, Error)]
pub enum InstanceInitError {
    #[error("instance '{0}' failed to resolve destination: {1}")]
    DestinationResolution(String, std::io::Error),

    #[error("instance '{0}' failed to initialize TLS: {1}")]
    TlsSetup(String, String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("instance '{0}' failed to initialize its SDK-backed sink: {1}")]
    SdkSinkInit(String, SdkError),
}

/// Errors from the simple connector transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {destination} failed: {source}")]
    Connect {
        destination: String,
        #[source]
        source: std::io::Error,
    },

    #[error("send to {destination} failed: {source}")]
    Send {
        destination: String,
        #[source]
        source: std::io::Error,
    },

    #[error("receive from {destination} failed: {source}")]
    Receive {
        destination: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {destination} failed: {source}")]
    TlsHandshake {
        destination: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {0} closed by peer")]
    ClosedByPeer(String),

    #[error("the send buffer was empty")]
    EmptyBuffer,
}

/// Errors from SDK-backed sink backends (Kinesis, Pub/Sub, MongoDB).
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("kinesis PutRecords failed: {0}")]
    Kinesis(String),

    #[error("pubsub publish failed: {0}")]
    PubSub(String),

    #[error("mongodb insert failed: {0}")]
    MongoDb(String),

    #[error("backend is not compiled in (feature disabled): {0}")]
    FeatureDisabled(&'static str),
}
