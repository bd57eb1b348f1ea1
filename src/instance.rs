//! A single exporting sink instance: its configuration, buffer ring, formatter,
//! transport, and the worker loop that drains queued buffers onto the wire.
//!
//! Grounded on `struct instance` in `exporting_engine.h`: the `scheduled`/`disabled`/
//! `skip_host`/`skip_chart` flags, the `after`/`before` window, and the
//! thread+mutex+cond_var wakeup are carried over, with the condvar translated to
//! `tokio::sync::Notify` (the async-idiomatic analogue used throughout
//! `metrics-exporter-dogstatsd`'s forwarder).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{error, warn};

use crate::buffer::BufferRing;
use crate::config::InstanceConfig;
use crate::formatter::Formatter;
use crate::sdk::{SdkRecordBatch, SdkSink};
use crate::telemetry::{Stats, Update};
use crate::transport::SimpleConnector;

/// The reduction window for one tick, mirroring `instance.after`/`instance.before`.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub after: i64,
    pub before: i64,
}

/// Mutable, lock-protected state shared between the pipeline driver (producer) and the
/// worker task (consumer).
pub struct InstanceShared {
    pub buffers: Mutex<BufferRing>,
    pub stats: Mutex<Stats>,
    pub notify: Notify,
    pub disabled: std::sync::atomic::AtomicBool,
}

/// One configured sink: its static config plus the shared runtime state the pipeline
/// and worker both touch.
pub struct Instance {
    pub config: InstanceConfig,
    pub formatter: Mutex<Box<dyn Formatter>>,
    pub shared: Arc<InstanceShared>,
    /// Whether this instance was due on the most recent engine tick, per §4.3's
    /// `now mod update_every >= update_every - engine_tick` check. Read by tests and by
    /// [`crate::engine::Engine::tick`] itself to decide whether to feed this instance.
    pub scheduled: std::sync::atomic::AtomicBool,
    /// The rolling `after` boundary for this instance's next reduction window: the
    /// `before` of its last fed tick, advanced only when the instance was actually due.
    pub window_after: std::sync::atomic::AtomicI64,
    /// Set for SDK-backed connector types (Kinesis, Pub/Sub, MongoDB); when present the
    /// worker publishes through it instead of the TCP/TLS [`SimpleConnector`].
    pub sdk_sink: Option<Arc<dyn SdkSink>>,
    /// Built once at init time when `USE_TLS` is set, so a broken trust store fails
    /// instance bring-up rather than silently falling back to plaintext.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// When set, the worker publishes this instance's self-telemetry charts through it
    /// after every drained buffer; see [`crate::telemetry::publish`].
    pub telemetry_sink: Option<Arc<dyn crate::tsdb::TelemetrySink>>,
}

impl Instance {
    pub fn new(config: InstanceConfig, formatter: Box<dyn Formatter>) -> Self {
        let ring_capacity = config.buffer_on_failures.max(1) as usize;
        let shared = Arc::new(InstanceShared {
            buffers: Mutex::new(BufferRing::new(ring_capacity)),
            stats: Mutex::new(Stats::default()),
            notify: Notify::new(),
            disabled: std::sync::atomic::AtomicBool::new(false),
        });
        Self {
            config,
            formatter: Mutex::new(formatter),
            shared,
            scheduled: std::sync::atomic::AtomicBool::new(false),
            window_after: std::sync::atomic::AtomicI64::new(0),
            sdk_sink: None,
            tls_config: None,
            telemetry_sink: None,
        }
    }

    /// Attaches an SDK-backed sink, routing this instance's worker through
    /// [`SdkSink::publish`] instead of the TCP/TLS transport.
    pub fn with_sdk_sink(mut self, sink: Arc<dyn SdkSink>) -> Self {
        self.sdk_sink = Some(sink);
        self
    }

    /// Attaches a pre-built TLS client config, routing this instance's worker through a
    /// TLS-negotiating [`SimpleConnector`] instead of a plaintext one.
    pub fn with_tls_config(mut self, tls_config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(tls_config);
        self
    }

    /// Attaches the sink this instance publishes its own self-telemetry charts through.
    pub fn with_telemetry_sink(mut self, sink: Arc<dyn crate::tsdb::TelemetrySink>) -> Self {
        self.telemetry_sink = Some(sink);
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.shared.disabled.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Disables the instance after repeated failures, matching `disable_instance`'s
    /// "stop scheduling and log" policy. Once disabled an instance is never
    /// re-enabled automatically.
    pub fn disable(&self) {
        self.shared.disabled.store(true, std::sync::atomic::Ordering::Release);
        error!(instance = %self.config.name, "instance disabled after repeated failures");
    }

    /// Signals the worker that a new buffer has been queued.
    pub fn notify_worker(&self) {
        self.shared.notify.notify_one();
    }

    /// The worker loop: waits for a signal, then drains whatever is queued, retrying a
    /// failed send by requeuing the buffer at the front before backing off.
    pub async fn run_worker(self: Arc<Self>) {
        let mut connector = match &self.tls_config {
            Some(tls_config) => SimpleConnector::new_tls(self.config.destination.clone(), self.config.timeout, tls_config.clone()),
            None => SimpleConnector::new(self.config.destination.clone(), self.config.timeout),
        };
        let mut consecutive_failures: u32 = 0;

        loop {
            if self.is_disabled() {
                return;
            }

            self.shared.notify.notified().await;

            loop {
                if self.is_disabled() {
                    return;
                }

                let buf = {
                    let mut buffers = self.shared.buffers.lock();
                    buffers.take_oldest()
                };
                let Some(mut buf) = buf else { break };

                if buf.header.is_empty() && crate::transport::is_http_framed(self.config.connector_type) {
                    buf.header = crate::transport::prepare_http_header(&self.config, self.content_type(), buf.body.len());
                }

                let is_sdk = self.sdk_sink.is_some();
                let mut update = Update::default();
                let outcome = if let Some(sink) = self.sdk_sink.clone() {
                    self.send_one_sdk(sink.as_ref(), &buf, &mut update).await
                } else {
                    self.send_one(&mut connector, &buf, &mut update).await
                };

                match outcome {
                    Ok(()) => {
                        consecutive_failures = 0;
                        self.shared.buffers.lock().recycle(buf);
                    }
                    Err(()) => {
                        if !is_sdk {
                            connector.disconnect();
                        }
                        consecutive_failures += 1;
                        if consecutive_failures > self.config.buffer_on_failures {
                            warn!(instance = %self.config.name, "buffer exceeded buffer_on_failures retries, dropping");
                            update.track_lost(buf.buffered_metrics, buf.buffered_bytes);
                            self.shared.buffers.lock().recycle(buf);
                            consecutive_failures = 0;
                        } else {
                            self.shared.buffers.lock().requeue_front(buf);
                        }
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
                self.shared.stats.lock().apply_update(&update);
                if let Some(sink) = &self.telemetry_sink {
                    let stats = self.shared.stats.lock();
                    crate::telemetry::publish(sink.as_ref(), &self.config.name, &stats);
                }
            }
        }
    }

    /// The `Content-Type` this instance's wire format is sent as, for HTTP-framed
    /// connectors' request header.
    fn content_type(&self) -> &'static str {
        use crate::config::ConnectorType;
        match self.config.connector_type {
            ConnectorType::GraphiteHttp | ConnectorType::OpentsdbHttp => "text/plain",
            ConnectorType::JsonHttp => "application/json",
            ConnectorType::PrometheusRemoteWrite => "application/x-protobuf",
            _ => "application/octet-stream",
        }
    }

    async fn send_one(&self, connector: &mut SimpleConnector, buf: &crate::buffer::SendBuffer, update: &mut Update) -> Result<(), ()> {
        let was_disconnected = !connector.is_connected();
        if connector.ensure_connected().await.is_err() {
            update.track_send_failure();
            return Err(());
        }
        if was_disconnected {
            update.track_reconnect();
        }

        match connector.send(buf).await {
            Ok(bytes) => {
                update.track_send_success(buf.buffered_metrics, bytes);
                if let Ok(received) = connector.receive_and_discard().await {
                    if received > 0 {
                        update.track_reception(received);
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!(instance = %self.config.name, error = %e, "send failed");
                update.track_send_failure();
                Err(())
            }
        }
    }

    /// Publishes one buffer through an SDK-backed sink instead of the TCP transport.
    /// The formatter writes a JSON array body for these connector types (see
    /// [`crate::build_formatter`]); each array element becomes one SDK record.
    async fn send_one_sdk(&self, sink: &dyn SdkSink, buf: &crate::buffer::SendBuffer, update: &mut Update) -> Result<(), ()> {
        let records = match split_json_records(&buf.body) {
            Ok(records) => records,
            Err(e) => {
                error!(instance = %self.config.name, error = %e, "formatted batch is not a JSON array, dropping");
                update.track_send_failure();
                return Err(());
            }
        };

        let batch = SdkRecordBatch { records };
        match sink.publish(&batch).await {
            Ok(published) => {
                update.track_send_success(published, buf.buffered_bytes);
                Ok(())
            }
            Err(e) => {
                warn!(instance = %self.config.name, error = %e, "sdk publish failed");
                update.track_send_failure();
                Err(())
            }
        }
    }
}

/// Splits a JSON-array-formatted buffer body into one owned record per array element.
fn split_json_records(body: &[u8]) -> Result<Vec<Vec<u8>>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    let array = value.as_array().cloned().unwrap_or_default();
    array.iter().map(serde_json::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SendBuffer;
    use crate::error::SdkError;
    use crate::sdk::SdkRecordBatch;

    #[test]
    fn split_json_records_returns_one_record_per_array_element() {
        let body = br#"[{"a":1},{"a":2},{"a":3}]"#;
        let records = split_json_records(body).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn split_json_records_rejects_non_json() {
        assert!(split_json_records(b"not json").is_err());
    }

    struct CountingSink {
        publishes: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SdkSink for CountingSink {
        async fn publish(&self, batch: &SdkRecordBatch) -> Result<usize, SdkError> {
            self.publishes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(batch.records.len())
        }
    }

    #[tokio::test]
    async fn send_one_sdk_publishes_each_array_element_and_counts_success() {
        use crate::config::{ConnectorSpecificConfig, ConnectorType, ExportingOptions};
        use crate::pattern::SimplePattern;
        use crate::formatter::json::JsonFormatter;

        let config = InstanceConfig {
            name: "kinesis1".into(),
            connector_type: ConnectorType::Kinesis,
            destination: "".into(),
            username: None,
            password: None,
            prefix: None,
            label_prefix: None,
            update_every: 10,
            buffer_on_failures: 10,
            timeout: Duration::from_secs(1),
            options: ExportingOptions::SOURCE_DATA_AVERAGE,
            charts_pattern: SimplePattern::parse("").unwrap(),
            hosts_pattern: SimplePattern::parse("").unwrap(),
            connector_specific: ConnectorSpecificConfig::Kinesis {
                stream_name: "s".into(),
                auth_key_id: "".into(),
                secure_key: "".into(),
            },
        };
        let sink = Arc::new(CountingSink { publishes: std::sync::atomic::AtomicUsize::new(0) });
        let instance = Instance::new(config, Box::new(JsonFormatter::new(None))).with_sdk_sink(sink.clone());

        let mut buf = SendBuffer::default();
        buf.body = br#"[{"v":1},{"v":2}]"#.to_vec();
        buf.buffered_metrics = 2;
        buf.buffered_bytes = buf.body.len();

        let mut update = Update::default();
        let result = instance.send_one_sdk(sink.as_ref(), &buf, &mut update).await;
        assert!(result.is_ok());
        assert_eq!(sink.publishes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_worker_drops_buffer_after_exceeding_retry_budget() {
        use crate::config::{ConnectorSpecificConfig, ConnectorType, ExportingOptions};
        use crate::formatter::graphite::GraphiteFormatter;
        use crate::pattern::SimplePattern;

        let config = InstanceConfig {
            name: "retry-test".into(),
            connector_type: ConnectorType::Graphite,
            // Nothing listens here; every connect attempt fails immediately.
            destination: "127.0.0.1:1".into(),
            username: None,
            password: None,
            prefix: None,
            label_prefix: None,
            update_every: 1,
            buffer_on_failures: 2,
            timeout: Duration::from_millis(50),
            options: ExportingOptions::SOURCE_DATA_AVERAGE,
            charts_pattern: SimplePattern::parse("").unwrap(),
            hosts_pattern: SimplePattern::parse("").unwrap(),
            connector_specific: ConnectorSpecificConfig::None,
        };

        let instance = Arc::new(Instance::new(config, Box::new(GraphiteFormatter::new(None))));
        {
            let mut buffers = instance.shared.buffers.lock();
            buffers.current_mut().buffered_metrics = 5;
            buffers.current_mut().buffered_bytes = 50;
            buffers.current_mut().body = b"some.metric 1 0\n".to_vec();
            buffers.finish_current();
        }

        let worker = tokio::spawn(instance.clone().run_worker());
        instance.notify_worker();

        tokio::time::sleep(Duration::from_secs(2)).await;
        worker.abort();

        let stats = instance.shared.stats.lock();
        assert_eq!(stats.data_lost_events, 1);
        assert_eq!(stats.lost_metrics, 5);
        assert_eq!(instance.shared.buffers.lock().queued_len(), 0);
        assert!(!instance.is_disabled());
    }
}
