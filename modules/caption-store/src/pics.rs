use std::collections::HashMap;

use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::{Collection, Database};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::client::StoreClient;
use crate::error::Result;
use crate::record::{synthesize_url, ImageRecord, UrlResolution, UrlStatus};

const PICS_COLLECTION: &str = "pics";
const STATS_COLLECTION: &str = "character_stats";
const STATS_GENERAL_COLLECTION: &str = "character_stats.general";

/// Per-character statistics: ordered attributes plus series weights.
#[derive(Debug, Clone, Default)]
pub struct CharacterStats {
    pub attributes: Vec<String>,
    pub series: Vec<(String, f64)>,
}

impl CharacterStats {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.series.is_empty()
    }
}

/// Projection for the whole-shard URL scan: id, hash, and extension only.
#[derive(Debug, Deserialize)]
struct UrlProjection {
    #[serde(rename = "_id")]
    id: i64,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    file_ext: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsDoc {
    #[serde(default)]
    attribute: Vec<String>,
    #[serde(default)]
    series: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct FrequencyDoc {
    #[serde(default)]
    frequency: f64,
}

/// Gateway for image metadata: point reads, batched URL resolution, and
/// character-statistics lookups. Idempotent, no internal retries — the
/// store is local-reliable and callers retry at a higher level.
#[derive(Clone)]
pub struct PicsStore {
    db: Database,
}

impl PicsStore {
    pub fn new(client: &StoreClient) -> Self {
        Self { db: client.metadata_db() }
    }

    fn pics(&self) -> Collection<ImageRecord> {
        self.db.collection(PICS_COLLECTION)
    }

    /// Point read. A missing record returns the id sentinel (no URL, no tags)
    /// rather than an error.
    pub async fn record(&self, id: i64) -> Result<ImageRecord> {
        let found = self.pics().find_one(doc! { "_id": id }).await?;
        match found {
            Some(record) => Ok(record),
            None => {
                debug!(id, "No metadata record");
                Ok(ImageRecord::from_id(id))
            }
        }
    }

    /// Resolve a batch of ids to URLs in one projected query. URL synthesis
    /// itself is pure; only the projection touches the store. A storage
    /// failure maps every requested id to status 500.
    pub async fn resolve_urls(&self, ids: &[i64]) -> HashMap<i64, UrlResolution> {
        match self.try_resolve_urls(ids).await {
            Ok(map) => map,
            Err(e) => {
                error!(error = %e, count = ids.len(), "Batch URL resolution failed");
                ids.iter().map(|&id| (id, UrlResolution::store_error())).collect()
            }
        }
    }

    async fn try_resolve_urls(&self, ids: &[i64]) -> Result<HashMap<i64, UrlResolution>> {
        let mut result: HashMap<i64, UrlResolution> =
            ids.iter().map(|&id| (id, UrlResolution::not_found())).collect();

        let mut cursor = self
            .db
            .collection::<UrlProjection>(PICS_COLLECTION)
            .find(doc! { "_id": { "$in": ids.to_vec() } })
            .projection(doc! { "_id": 1, "md5": 1, "file_ext": 1 })
            .batch_size(1000)
            .await?;

        while let Some(row) = cursor.try_next().await? {
            result.insert(row.id, resolve_row(&row));
        }
        Ok(result)
    }

    /// Resolve every id in `[key·100000, (key+1)·100000)` with a single
    /// projected scan. Ids without a record are reported as 404, so the
    /// result always covers the whole span. Peak memory is one shard's
    /// projection.
    pub async fn resolve_urls_in_key(&self, key: i64) -> Result<HashMap<i64, UrlResolution>> {
        let start = key * 100_000;
        let end = (key + 1) * 100_000;
        info!(key, start, end, "Scanning shard for URL resolution");

        let mut result: HashMap<i64, UrlResolution> = HashMap::with_capacity(100_000);

        let mut cursor = self
            .db
            .collection::<UrlProjection>(PICS_COLLECTION)
            .find(doc! { "_id": { "$gte": start, "$lt": end } })
            .projection(doc! { "_id": 1, "md5": 1, "file_ext": 1 })
            .batch_size(1000)
            .await?;

        while let Some(row) = cursor.try_next().await? {
            result.insert(row.id, resolve_row(&row));
        }

        let found = result.len();
        for id in start..end {
            result.entry(id).or_insert_with(UrlResolution::not_found);
        }

        let mut ok = 0usize;
        let mut not_found = 0usize;
        let mut unusable = 0usize;
        for r in result.values() {
            match r.status {
                UrlStatus::Ok => ok += 1,
                UrlStatus::NotFound => not_found += 1,
                UrlStatus::Unusable => unusable += 1,
                UrlStatus::StoreError => {}
            }
        }
        info!(key, found, ok, not_found, unusable, "Shard URL scan complete");

        Ok(result)
    }

    /// Attributes and series weights for a character tag; missing ⇒ empty.
    pub async fn character_stats(&self, name: &str) -> Result<CharacterStats> {
        let found = self
            .db
            .collection::<StatsDoc>(STATS_COLLECTION)
            .find_one(doc! { "_id": name })
            .await?;

        let Some(stats) = found else {
            return Ok(CharacterStats::default());
        };

        let series = stats
            .series
            .map(|d| {
                d.into_iter()
                    .map(|(name, weight)| {
                        let weight = match weight {
                            mongodb::bson::Bson::Double(v) => v,
                            mongodb::bson::Bson::Int32(v) => v as f64,
                            mongodb::bson::Bson::Int64(v) => v as f64,
                            _ => 0.0,
                        };
                        (name, weight)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(CharacterStats { attributes: stats.attribute, series })
    }

    /// Global frequency of an attribute tag from the statistics
    /// sub-collection; `None` when the sub-collection has no entry.
    pub async fn attribute_frequency(&self, name: &str) -> Result<Option<f64>> {
        let found = self
            .db
            .collection::<FrequencyDoc>(STATS_GENERAL_COLLECTION)
            .find_one(doc! { "name": name })
            .await?;
        Ok(found.map(|d| d.frequency))
    }
}

fn resolve_row(row: &UrlProjection) -> UrlResolution {
    let md5 = row.md5.as_deref().unwrap_or("");
    let file_ext = row.file_ext.as_deref().unwrap_or("");
    match synthesize_url(md5, file_ext) {
        Some(url) => UrlResolution { url: Some(url), status: UrlStatus::Ok },
        None => UrlResolution { url: None, status: UrlStatus::Unusable },
    }
}
