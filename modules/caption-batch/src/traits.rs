//! Gateway seams for the pipeline. The concrete store and model clients
//! implement these; tests substitute in-memory fakes.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use caption_store::{CaptionOutcome, CaptionStore, ImageRecord, PicsStore, TagStore, UrlResolution};
use caption_store::pics::CharacterStats;
use gemini_client::{GeminiVertex, ModelOutcome};

use crate::images::FetchedImage;

/// Image-metadata reads (C1): point reads, batched URL resolution, and
/// character statistics.
#[async_trait]
pub trait MetadataReader: Send + Sync {
    async fn record(&self, id: i64) -> Result<ImageRecord>;
    async fn resolve_urls(&self, ids: &[i64]) -> HashMap<i64, UrlResolution>;
    async fn resolve_urls_in_key(&self, key: i64) -> Result<HashMap<i64, UrlResolution>>;
    async fn character_stats(&self, name: &str) -> Result<CharacterStats>;
    async fn attribute_frequency(&self, name: &str) -> Result<Option<f64>>;
}

/// Caption-outcome persistence (C2).
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    async fn upsert(&self, outcome: &CaptionOutcome) -> Result<()>;
    async fn existing_in_range(&self, start: i64, end: i64) -> Result<HashSet<i64>>;
    async fn get(&self, id: i64) -> Result<Option<CaptionOutcome>>;
    async fn save_result_file(&self, id: i64, outcome: &CaptionOutcome, dir: &Path) -> Result<()>;
}

/// Tag-graph reads (C3) needed by the character-tree builder.
#[async_trait]
pub trait TagReader: Send + Sync {
    async fn is_root(&self, name: &str) -> Result<bool>;
    async fn children(&self, name: &str) -> Result<Vec<String>>;
}

/// One terminal model invocation (C7): retries happen inside.
#[async_trait]
pub trait CaptionModel: Send + Sync {
    async fn generate(&self, prompt: &str, image: &[u8], mime_type: &str) -> ModelOutcome;
}

/// Image acquisition (C4): retries happen inside.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn acquire(&self, id: i64, preferred_url: Option<&str>) -> Result<FetchedImage>;
}

// =============================================================================
// Implementations for the concrete gateways
// =============================================================================

#[async_trait]
impl MetadataReader for PicsStore {
    async fn record(&self, id: i64) -> Result<ImageRecord> {
        Ok(PicsStore::record(self, id).await?)
    }

    async fn resolve_urls(&self, ids: &[i64]) -> HashMap<i64, UrlResolution> {
        PicsStore::resolve_urls(self, ids).await
    }

    async fn resolve_urls_in_key(&self, key: i64) -> Result<HashMap<i64, UrlResolution>> {
        Ok(PicsStore::resolve_urls_in_key(self, key).await?)
    }

    async fn character_stats(&self, name: &str) -> Result<CharacterStats> {
        Ok(PicsStore::character_stats(self, name).await?)
    }

    async fn attribute_frequency(&self, name: &str) -> Result<Option<f64>> {
        Ok(PicsStore::attribute_frequency(self, name).await?)
    }
}

#[async_trait]
impl OutcomeStore for CaptionStore {
    async fn upsert(&self, outcome: &CaptionOutcome) -> Result<()> {
        Ok(CaptionStore::upsert(self, outcome).await?)
    }

    async fn existing_in_range(&self, start: i64, end: i64) -> Result<HashSet<i64>> {
        Ok(CaptionStore::existing_in_range(self, start, end).await?)
    }

    async fn get(&self, id: i64) -> Result<Option<CaptionOutcome>> {
        Ok(CaptionStore::get(self, id).await?)
    }

    async fn save_result_file(&self, id: i64, outcome: &CaptionOutcome, dir: &Path) -> Result<()> {
        Ok(CaptionStore::save_result_file(self, id, outcome, dir).await?)
    }
}

#[async_trait]
impl TagReader for TagStore {
    async fn is_root(&self, name: &str) -> Result<bool> {
        Ok(TagStore::is_root(self, name).await?)
    }

    async fn children(&self, name: &str) -> Result<Vec<String>> {
        Ok(TagStore::children(self, name).await?)
    }
}

#[async_trait]
impl CaptionModel for GeminiVertex {
    async fn generate(&self, prompt: &str, image: &[u8], mime_type: &str) -> ModelOutcome {
        GeminiVertex::generate(self, prompt, image, mime_type).await
    }
}
