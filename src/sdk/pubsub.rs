//! Google Cloud Pub/Sub sink via its gRPC publish API.
//!
//! Grounded on `struct pubsub_specific_config` (`exporting_engine.h`) for the
//! configuration surface; `tonic` + `prost` round out the gRPC/protobuf stack for this
//! sink.

use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, ClientTlsConfig};
use tonic::Request;

use super::{SdkRecordBatch, SdkSink};
use crate::error::SdkError;

/// Minimal request/response shapes for `google.pubsub.v1.Publisher/Publish`, modeling
/// only the fields this sink needs rather than vendoring the full Pub/Sub protobuf
/// schema.
pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PubsubMessage {
        #[prost(bytes = "vec", tag = "1")]
        pub data: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PublishRequest {
        #[prost(string, tag = "1")]
        pub topic: String,
        #[prost(message, repeated, tag = "2")]
        pub messages: Vec<PubsubMessage>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PublishResponse {
        #[prost(string, repeated, tag = "1")]
        pub message_ids: Vec<String>,
    }
}

pub struct PubsubSink {
    channel: Channel,
    topic: String,
    bearer_token: Option<String>,
}

impl PubsubSink {
    pub async fn connect(project_id: &str, topic_id: &str, bearer_token: Option<String>) -> Result<Self, SdkError> {
        let channel = Channel::from_static("https://pubsub.googleapis.com:443")
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(|e| SdkError::PubSub(e.to_string()))?
            .connect()
            .await
            .map_err(|e| SdkError::PubSub(e.to_string()))?;
        Ok(Self { channel, topic: format!("projects/{project_id}/topics/{topic_id}"), bearer_token })
    }
}

#[async_trait::async_trait]
impl SdkSink for PubsubSink {
    async fn publish(&self, batch: &SdkRecordBatch) -> Result<usize, SdkError> {
        if batch.records.is_empty() {
            return Ok(0);
        }

        let request_body = proto::PublishRequest {
            topic: self.topic.clone(),
            messages: batch.records.iter().map(|data| proto::PubsubMessage { data: data.clone() }).collect(),
        };

        let mut request = Request::new(request_body);
        if let Some(token) = &self.bearer_token {
            let value = MetadataValue::try_from(format!("Bearer {token}")).map_err(|e| SdkError::PubSub(e.to_string()))?;
            request.metadata_mut().insert("authorization", value);
        }

        let mut client = tonic::client::Grpc::new(self.channel.clone());
        client.ready().await.map_err(|e| SdkError::PubSub(e.to_string()))?;

        let path = tonic::codegen::http::uri::PathAndQuery::from_static("/google.pubsub.v1.Publisher/Publish");
        let codec = tonic::codec::ProstCodec::default();
        let response =
            client.unary(request, path, codec).await.map_err(|e| SdkError::PubSub(e.to_string()))?;

        Ok(response.into_inner().message_ids.len())
    }
}
