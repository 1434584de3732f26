use std::collections::HashSet;
use std::path::Path;

use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{Collection, Database};
use serde::Deserialize;
use tracing::{debug, info};

use crate::client::StoreClient;
use crate::error::Result;
use crate::outcome::CaptionOutcome;

/// Ids per shard collection.
pub const SHARD_SIZE: i64 = 100_000;

/// Status codes that mark an outcome as final for idempotency purposes.
/// 998 is reserved for pre-classified skips and is never produced here.
pub const PROCESSED_STATUS_CODES: [i32; 6] = [200, 403, 404, 405, 998, 999];

/// Collection name for an id: decimal shard key, no leading zeros.
pub fn shard_name(id: i64) -> String {
    (id / SHARD_SIZE).to_string()
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    #[serde(rename = "_id")]
    id: i64,
}

/// Gateway for caption outcomes: shard-routed upserts, the processed-id
/// range scan, and optional per-item result files.
#[derive(Clone)]
pub struct CaptionStore {
    db: Database,
}

impl CaptionStore {
    pub fn new(client: &StoreClient) -> Self {
        Self { db: client.captions_db() }
    }

    fn shard(&self, id: i64) -> Collection<Document> {
        self.db.collection(&shard_name(id))
    }

    /// Upsert one outcome by id. `created_at` is set on first insert only.
    ///
    /// A failure outcome never overwrites a stored success: the filter
    /// excludes `success: true` documents, and the resulting duplicate-key
    /// insert attempt is treated as "existing success kept".
    pub async fn upsert(&self, outcome: &CaptionOutcome) -> Result<()> {
        let mut fields = mongodb::bson::to_document(outcome)?;
        fields.remove("created_at");

        let filter = if outcome.success {
            doc! { "_id": outcome.id }
        } else {
            doc! { "_id": outcome.id, "success": { "$ne": true } }
        };
        let update = doc! {
            "$set": fields,
            "$setOnInsert": { "created_at": epoch_seconds() },
        };

        match self.shard(outcome.id).update_one(filter, update).upsert(true).await {
            Ok(_) => {
                debug!(id = outcome.id, shard = %shard_name(outcome.id), "Outcome upserted");
                Ok(())
            }
            Err(e) if is_duplicate_key(&e) => {
                debug!(id = outcome.id, "Existing success kept, failure not recorded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ids in `[start, end)` whose stored outcome satisfies the processed
    /// predicate: a prompt was recorded, or the run succeeded, or the status
    /// code is terminal. The range scan decomposes into per-shard scans.
    pub async fn existing_in_range(&self, start: i64, end: i64) -> Result<HashSet<i64>> {
        let mut processed = HashSet::new();
        if end <= start {
            return Ok(processed);
        }

        info!(start, end, "Scanning for already-processed ids");

        for shard_key in start / SHARD_SIZE..=(end - 1) / SHARD_SIZE {
            let shard_start = start.max(shard_key * SHARD_SIZE);
            let shard_end = end.min((shard_key + 1) * SHARD_SIZE);

            let filter = doc! {
                "_id": { "$gte": shard_start, "$lt": shard_end },
                "$or": [
                    { "prompt": { "$exists": true } },
                    { "success": true },
                    { "status_code": { "$in": PROCESSED_STATUS_CODES.to_vec() } },
                ],
            };

            let mut cursor = self
                .db
                .collection::<IdOnly>(&shard_key.to_string())
                .find(filter)
                .projection(doc! { "_id": 1 })
                .batch_size(10_000)
                .await?;

            while let Some(row) = cursor.try_next().await? {
                processed.insert(row.id);
            }
        }

        info!(count = processed.len(), "Processed ids found");
        Ok(processed)
    }

    /// Point read of an outcome; `None` when the id was never recorded.
    pub async fn get(&self, id: i64) -> Result<Option<CaptionOutcome>> {
        let found = self
            .db
            .collection::<CaptionOutcome>(&shard_name(id))
            .find_one(doc! { "_id": id })
            .await?;
        Ok(found)
    }

    /// Optional side artifact: `<dir>/<id>_caption.json`.
    pub async fn save_result_file(
        &self,
        id: i64,
        outcome: &CaptionOutcome,
        dir: &Path,
    ) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{id}_caption.json"));
        let json = serde_json::to_vec_pretty(outcome)?;
        tokio::fs::write(&path, json).await?;
        debug!(id, path = %path.display(), "Result file written");
        Ok(())
    }
}

fn epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_names_have_no_leading_zeros() {
        assert_eq!(shard_name(0), "0");
        assert_eq!(shard_name(99_999), "0");
        assert_eq!(shard_name(100_000), "1");
        assert_eq!(shard_name(7_350_000), "73");
    }

    #[test]
    fn shard_boundary_splits_adjacent_ids() {
        assert_eq!(shard_name(99_999), "0");
        assert_ne!(shard_name(99_999), shard_name(100_000));
    }

    #[test]
    fn processed_codes_cover_the_terminal_set() {
        for code in [200, 403, 404, 405, 998, 999] {
            assert!(PROCESSED_STATUS_CODES.contains(&code));
        }
        assert!(!PROCESSED_STATUS_CODES.contains(&400));
        assert!(!PROCESSED_STATUS_CODES.contains(&500));
    }
}
