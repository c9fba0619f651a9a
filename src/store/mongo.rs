//! MongoDB implementation of the store ports.

use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{Client, Collection, Database};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AggregateSink, DimensionSource, EventSource, EventStream, StoreError};
use crate::rollup::buffer::AccumulatorEntry;
use crate::rollup::dimension::DimensionRecord;
use crate::rollup::event::{HeatmapPayload, RawEvent};
use crate::rollup::key::EntryId;

/// Server error code for a duplicate key on insert.
const DUPLICATE_KEY: i32 = 11000;

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        // The collection is filled in by the caller, see `StoreError::within`.
        if matches!(err.kind.as_ref(), ErrorKind::BsonDeserialization(_)) {
            return Self::decode(String::new(), err);
        }
        match err.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY => {
                Self::Conflict
            }
            _ => Self::Backend(err.to_string()),
        }
    }
}

impl From<bson::ser::Error> for StoreError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Backend(format!("encoding document: {err}"))
    }
}

/// Connects to `uri` and pings the server.
pub async fn connect(uri: &str) -> Result<Client, StoreError> {
    let client = Client::with_uri_str(uri).await?;
    client.database("admin").run_command(doc! { "ping": 1 }).await?;
    debug!("connected to mongodb");
    Ok(client)
}

/// Per-version raw event collections of one database.
#[derive(Clone)]
pub struct MongoEventSource {
    db: Database,
}

impl MongoEventSource {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl EventSource for MongoEventSource {
    async fn list_collections(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let names = self
            .db
            .list_collection_names()
            .filter(doc! { "name": { "$regex": pattern, "$options": "i" } })
            .await?;
        Ok(names)
    }

    async fn count_documents(&self, collection: &str) -> Result<u64, StoreError> {
        let count = self
            .db
            .collection::<Document>(collection)
            .count_documents(doc! {})
            .await?;
        Ok(count)
    }

    async fn scan(&self, collection: &str) -> Result<EventStream, StoreError> {
        let cursor = self.db.collection::<Document>(collection).find(doc! {}).await?;

        let name = collection.to_string();
        let stream = cursor.map(move |doc| -> Result<RawEvent, StoreError> {
            let doc = doc.map_err(|e| StoreError::from(e).within(&name))?;
            decode_event(&name, doc)
        });
        Ok(stream.boxed())
    }
}

/// The dimension collection holding `{_id: version, game, customer}` rows.
#[derive(Clone)]
pub struct MongoDimensionSource {
    collection: Collection<Document>,
}

impl MongoDimensionSource {
    pub fn new(collection: Collection<Document>) -> Self {
        Self { collection }
    }
}

impl DimensionSource for MongoDimensionSource {
    async fn load_dimensions(&self) -> Result<Vec<DimensionRecord>, StoreError> {
        let docs: Vec<Document> = self
            .collection
            .find(doc! {})
            .projection(doc! { "game": 1, "customer": 1, "_id": 1 })
            .await?
            .try_collect()
            .await?;

        let mut records = Vec::with_capacity(docs.len());
        for doc in docs {
            match decode_dimension(&doc) {
                Some(record) => records.push(record),
                None => warn!(id = ?doc.get("_id"), "skipping dimension row with unsupported _id"),
            }
        }
        Ok(records)
    }
}

/// Aggregate rows keyed by their composite `_id`.
#[derive(Clone)]
pub struct MongoAggregateSink {
    collection: Collection<Document>,
    name: String,
}

impl MongoAggregateSink {
    pub fn new(collection: Collection<Document>) -> Self {
        let name = format!("mongodb:{}", collection.name());
        Self { collection, name }
    }
}

impl AggregateSink for MongoAggregateSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert(&self, entry: &AccumulatorEntry) -> Result<(), StoreError> {
        let doc = bson::to_document(entry)?;
        self.collection.insert_one(doc).await?;
        Ok(())
    }

    async fn update(&self, id: &EntryId, entry: &AccumulatorEntry) -> Result<(), StoreError> {
        let filter = doc! { "_id": bson::to_bson(id)? };
        let update = doc! {
            "$set": {
                "customer": entry.customer.as_str(),
                "game": entry.game.as_str(),
                "value": bson::to_bson(&entry.value)?,
            }
        };
        let result = self.collection.update_one(filter, update).await?;
        if result.matched_count == 0 {
            return Err(StoreError::Backend(format!(
                "no aggregate row matched {}/{}/{}",
                id.version, id.event, id.timestamp
            )));
        }
        Ok(())
    }
}

/// Raw event document layout.
#[derive(Debug, Deserialize)]
struct EventDocument {
    #[serde(rename = "_id")]
    id: Option<Bson>,
    version: String,
    network: String,
    event: String,
    #[serde(default)]
    os: Option<String>,
    #[serde(default)]
    value: Option<Bson>,
    #[serde(default)]
    time: Option<Bson>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    timestamp: Option<bson::DateTime>,
    #[serde(default)]
    heatmap: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct HeatmapDocument {
    x: Bson,
    y: Bson,
    dim: Vec<Bson>,
}

/// Decodes one raw event document from `collection`.
pub fn decode_event(collection: &str, doc: Document) -> Result<RawEvent, StoreError> {
    let raw: EventDocument =
        bson::from_document(doc).map_err(|e| StoreError::decode(collection, e))?;

    let timestamp = match (raw.timestamp, &raw.id) {
        (Some(ts), _) => ts,
        (None, Some(Bson::ObjectId(oid))) => oid.timestamp(),
        (None, _) => {
            return Err(StoreError::decode(
                collection,
                "document has neither timestamp nor ObjectId _id",
            ))
        }
    };
    let timestamp = DateTime::<Utc>::from_timestamp_millis(timestamp.timestamp_millis())
        .ok_or_else(|| StoreError::decode(collection, "timestamp out of range"))?;

    // Clients send `heatmap: {}` when there was nothing to record.
    let heatmap = match raw.heatmap {
        Some(h) if !h.is_empty() => {
            let h: HeatmapDocument =
                bson::from_document(h).map_err(|e| StoreError::decode(collection, e))?;
            Some(decode_heatmap(&h).map_err(|reason| StoreError::decode(collection, reason))?)
        }
        _ => None,
    };

    Ok(RawEvent {
        version: raw.version,
        network: raw.network,
        os: raw.os.unwrap_or_default(),
        event: raw.event,
        value: number(raw.value.as_ref(), "value")
            .map_err(|reason| StoreError::decode(collection, reason))?,
        time: number(raw.time.as_ref(), "time")
            .map_err(|reason| StoreError::decode(collection, reason))?,
        session: raw.session.unwrap_or_default(),
        ip: raw.ip.unwrap_or_default(),
        timestamp,
        heatmap,
    })
}

fn decode_heatmap(h: &HeatmapDocument) -> Result<HeatmapPayload, String> {
    let [width, height, ..] = h.dim.as_slice() else {
        return Err(format!("heatmap dim has {} components, need 2", h.dim.len()));
    };
    Ok(HeatmapPayload::new(
        integer(&h.x, "heatmap.x")?,
        integer(&h.y, "heatmap.y")?,
        integer(width, "heatmap.dim[0]")?,
        integer(height, "heatmap.dim[1]")?,
    ))
}

/// Reads an optional numeric field; absent and null read as zero.
fn number(value: Option<&Bson>, field: &str) -> Result<f64, String> {
    match value {
        None | Some(Bson::Null) => Ok(0.0),
        Some(Bson::Double(v)) => Ok(*v),
        Some(Bson::Int32(v)) => Ok(f64::from(*v)),
        Some(Bson::Int64(v)) => Ok(*v as f64),
        Some(other) => Err(format!("{field} is not numeric: {other}")),
    }
}

fn integer(value: &Bson, field: &str) -> Result<i32, String> {
    number(Some(value), field).map(|v| v.trunc() as i32)
}

fn decode_dimension(doc: &Document) -> Option<DimensionRecord> {
    let id = match doc.get("_id")? {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        _ => return None,
    };
    let text = |field: &str| doc.get_str(field).unwrap_or_default().to_string();
    Some(DimensionRecord {
        id,
        game: text("game"),
        customer: text("customer"),
    })
}
