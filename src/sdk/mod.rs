//! SDK-backed sink backends: thin adapters from a filled [`SendBuffer`] to each
//! provider's put/publish/insert call. Only the contract the core engine needs is
//! modeled — full SDK feature coverage is an external concern.

#[cfg(feature = "kinesis")]
pub mod kinesis;
#[cfg(feature = "mongodb-sink")]
pub mod mongodb;
#[cfg(feature = "pubsub")]
pub mod pubsub;

use crate::error::SdkError;

/// One unit of work handed to an SDK backend: a batch of already-formatted JSON
/// records, one per exported metric, ready to publish as-is.
pub struct SdkRecordBatch {
    pub records: Vec<Vec<u8>>,
}

/// Common contract every SDK-backed sink implements, so the instance worker can treat
/// them uniformly alongside the simple-connector transport.
#[async_trait::async_trait]
pub trait SdkSink: Send + Sync {
    async fn publish(&self, batch: &SdkRecordBatch) -> Result<usize, SdkError>;
}
