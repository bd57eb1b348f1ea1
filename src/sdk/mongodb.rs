//! MongoDB sink: inserts one formatted JSON document per exported metric into a
//! configured database/collection.
//!
//! Grounded on `struct mongodb_specific_config` (`exporting_engine.h`); the `mongodb`
//! crate dependency choice is enrichment from `vectordotdev-vector`'s MongoDB sink.

use mongodb::bson::{self, Document};
use mongodb::{Client, Collection};

use super::{SdkRecordBatch, SdkSink};
use crate::error::SdkError;

pub struct MongoDbSink {
    collection: Collection<Document>,
}

impl MongoDbSink {
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self, SdkError> {
        let client = Client::with_uri_str(uri).await.map_err(|e| SdkError::MongoDb(e.to_string()))?;
        let collection = client.database(database).collection::<Document>(collection);
        Ok(Self { collection })
    }
}

#[async_trait::async_trait]
impl SdkSink for MongoDbSink {
    async fn publish(&self, batch: &SdkRecordBatch) -> Result<usize, SdkError> {
        if batch.records.is_empty() {
            return Ok(0);
        }

        let mut docs = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            let value: serde_json::Value =
                serde_json::from_slice(record).map_err(|e| SdkError::MongoDb(e.to_string()))?;
            let doc = bson::to_document(&value).map_err(|e| SdkError::MongoDb(e.to_string()))?;
            docs.push(doc);
        }

        let result = self.collection.insert_many(docs).await.map_err(|e| SdkError::MongoDb(e.to_string()))?;
        Ok(result.inserted_ids.len())
    }
}
