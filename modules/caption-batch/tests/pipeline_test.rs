//! End-to-end tests for the worker and orchestrator against in-memory
//! fakes of the store gateways, the image source, and the model client.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use caption_batch::traits::{CaptionModel, ImageSource, MetadataReader, OutcomeStore, TagReader};
use caption_batch::{BatchRunner, CaptionWorker, FetchedImage, ProcessOptions, RunOptions};
use caption_common::{Caption, Language};
use caption_store::pics::CharacterStats;
use caption_store::{
    shard_name, CaptionOutcome, ImageRecord, UrlResolution, PROCESSED_STATUS_CODES, SHARD_SIZE,
};
use gemini_client::ModelOutcome;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeMetadata {
    records: HashMap<i64, ImageRecord>,
}

impl FakeMetadata {
    fn with_records(records: Vec<ImageRecord>) -> Self {
        Self { records: records.into_iter().map(|r| (r.id, r)).collect() }
    }
}

#[async_trait]
impl MetadataReader for FakeMetadata {
    async fn record(&self, id: i64) -> Result<ImageRecord> {
        Ok(self.records.get(&id).cloned().unwrap_or_else(|| ImageRecord::from_id(id)))
    }

    async fn resolve_urls(&self, ids: &[i64]) -> HashMap<i64, UrlResolution> {
        ids.iter()
            .map(|&id| {
                let resolution = self
                    .records
                    .get(&id)
                    .map(|r| r.resolution())
                    .unwrap_or_else(UrlResolution::not_found);
                (id, resolution)
            })
            .collect()
    }

    async fn resolve_urls_in_key(&self, key: i64) -> Result<HashMap<i64, UrlResolution>> {
        let start = key * SHARD_SIZE;
        let end = (key + 1) * SHARD_SIZE;
        Ok(self
            .records
            .values()
            .filter(|r| r.id >= start && r.id < end)
            .map(|r| (r.id, r.resolution()))
            .collect())
    }

    async fn character_stats(&self, _name: &str) -> Result<CharacterStats> {
        Ok(CharacterStats::default())
    }

    async fn attribute_frequency(&self, _name: &str) -> Result<Option<f64>> {
        Ok(None)
    }
}

#[derive(Default)]
struct FakeOutcomes {
    stored: Mutex<HashMap<i64, CaptionOutcome>>,
    upserts: AtomicUsize,
}

impl FakeOutcomes {
    fn outcome(&self, id: i64) -> Option<CaptionOutcome> {
        self.stored.lock().unwrap().get(&id).cloned()
    }

    fn count(&self) -> usize {
        self.stored.lock().unwrap().len()
    }

    fn seed(&self, outcome: CaptionOutcome) {
        self.stored.lock().unwrap().insert(outcome.id, outcome);
    }

    fn is_processed(outcome: &CaptionOutcome) -> bool {
        outcome.success
            || outcome.prompt.is_some()
            || PROCESSED_STATUS_CODES.contains(&outcome.status_code)
    }
}

#[async_trait]
impl OutcomeStore for FakeOutcomes {
    async fn upsert(&self, outcome: &CaptionOutcome) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let mut stored = self.stored.lock().unwrap();
        if let Some(existing) = stored.get(&outcome.id) {
            // A failure never overwrites a stored success.
            if existing.success && !outcome.success {
                return Ok(());
            }
        }
        stored.insert(outcome.id, outcome.clone());
        Ok(())
    }

    async fn existing_in_range(&self, start: i64, end: i64) -> Result<HashSet<i64>> {
        Ok(self
            .stored
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.id >= start && o.id < end && Self::is_processed(o))
            .map(|o| o.id)
            .collect())
    }

    async fn get(&self, id: i64) -> Result<Option<CaptionOutcome>> {
        Ok(self.outcome(id))
    }

    async fn save_result_file(
        &self,
        _id: i64,
        _outcome: &CaptionOutcome,
        _dir: &Path,
    ) -> Result<()> {
        Ok(())
    }
}

struct FakeTags;

#[async_trait]
impl TagReader for FakeTags {
    async fn is_root(&self, _name: &str) -> Result<bool> {
        Ok(false)
    }

    async fn children(&self, _name: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct FakeImages {
    calls: AtomicUsize,
}

#[async_trait]
impl ImageSource for FakeImages {
    async fn acquire(&self, _id: i64, _preferred_url: Option<&str>) -> Result<FetchedImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(FetchedImage {
            bytes: vec![0xFF, 0xD8, 0xFF],
            mime_type: "image/jpeg".to_string(),
            file_ext: "jpg".to_string(),
            source: caption_batch::images::FetchSource::Cdn,
        })
    }
}

enum ModelMode {
    Success,
    Refuse,
}

struct FakeModel {
    mode: ModelMode,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeModel {
    fn new(mode: ModelMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CaptionModel for FakeModel {
    async fn generate(&self, _prompt: &str, _image: &[u8], _mime_type: &str) -> ModelOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.mode {
            ModelMode::Success => ModelOutcome::Parsed {
                caption: sample_caption(),
                raw: "{}".to_string(),
            },
            ModelMode::Refuse => {
                ModelOutcome::Refused { reason: "PROHIBITED_CONTENT".to_string() }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sample_caption() -> Caption {
    Caption {
        regular_summary: "A sky full of clouds.".to_string(),
        midjourney_style_summary: "sky, drifting clouds".to_string(),
        short_summary: "Clouds in a blue sky.".to_string(),
        creation_instructional_summary: "Paint a blue sky, add clouds.".to_string(),
        deviantart_commission_request: "A wide blue sky with soft clouds.".to_string(),
    }
}

fn jpg_record(id: i64) -> ImageRecord {
    ImageRecord {
        id,
        md5: "abcdef0123456789".to_string(),
        file_ext: "jpg".to_string(),
        general_tags: vec!["sky".to_string(), "cloud".to_string()],
        artist_tags: vec!["alice".to_string()],
        ..Default::default()
    }
}

fn gif_record(id: i64) -> ImageRecord {
    ImageRecord {
        id,
        md5: "abcdef0123456789".to_string(),
        file_ext: "gif".to_string(),
        ..Default::default()
    }
}

struct Harness {
    pics: Arc<FakeMetadata>,
    outcomes: Arc<FakeOutcomes>,
    images: Arc<FakeImages>,
    model: Arc<FakeModel>,
    worker: Arc<CaptionWorker>,
}

impl Harness {
    fn new(records: Vec<ImageRecord>, mode: ModelMode) -> Self {
        let pics = Arc::new(FakeMetadata::with_records(records));
        let outcomes = Arc::new(FakeOutcomes::default());
        let images = Arc::new(FakeImages::default());
        let model = Arc::new(FakeModel::new(mode));

        let worker = Arc::new(CaptionWorker::new(
            pics.clone(),
            outcomes.clone(),
            Arc::new(FakeTags),
            images.clone(),
            model.clone(),
            Language::En,
        ));

        Self { pics, outcomes, images, model, worker }
    }

    fn runner(&self, max_concurrency: usize) -> BatchRunner {
        BatchRunner::new(
            self.worker.clone(),
            self.pics.clone(),
            self.outcomes.clone(),
            max_concurrency,
        )
    }
}

// ---------------------------------------------------------------------------
// Worker scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gif_url_short_circuits_before_fetch_and_model() {
    let harness = Harness::new(vec![], ModelMode::Success);
    let outcome = harness
        .worker
        .process(
            7,
            Some("https://cdn.donmai.us/original/ab/cd/abcd.gif".to_string()),
            &ProcessOptions::default(),
        )
        .await;

    assert_eq!(outcome.status_code, 405);
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("GIF not processed"));
    assert_eq!(harness.images.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.model.calls.load(Ordering::SeqCst), 0);
    // The terminal state was persisted before returning.
    assert_eq!(harness.outcomes.outcome(7).unwrap().status_code, 405);
}

#[tokio::test]
async fn existing_success_is_skipped_without_a_rewrite() {
    let harness = Harness::new(vec![jpg_record(9)], ModelMode::Success);
    let mut existing = CaptionOutcome::success(9, 200);
    existing.caption = Some(sample_caption());
    harness.outcomes.seed(existing);

    let outcome = harness.worker.process(9, None, &ProcessOptions::default()).await;

    assert!(outcome.success);
    assert_eq!(harness.outcomes.upserts.load(Ordering::SeqCst), 0);
    assert_eq!(harness.model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn refusal_is_terminal_with_status_999() {
    let harness = Harness::new(vec![jpg_record(11)], ModelMode::Refuse);
    let outcome = harness.worker.process(11, None, &ProcessOptions::default()).await;

    assert_eq!(outcome.status_code, 999);
    assert_eq!(
        outcome.error.as_deref(),
        Some("ContentPolicyViolation: PROHIBITED_CONTENT")
    );
    assert_eq!(outcome.error_type.as_deref(), Some("ContentPolicyViolation"));
    assert_eq!(harness.model.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.outcomes.outcome(11).unwrap().status_code, 999);
}

// ---------------------------------------------------------------------------
// Orchestrator scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_single_id() {
    let harness = Harness::new(vec![jpg_record(12345)], ModelMode::Success);
    let stats = harness.runner(4).run_range(12345, 12346, &RunOptions::default()).await.unwrap();

    assert_eq!(stats.total, 1);
    assert_eq!(stats.success, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.skipped, 0);

    let outcome = harness.outcomes.outcome(12345).unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.status_code, 200);
    assert_eq!(
        outcome.image_url.as_deref(),
        Some("https://cdn.donmai.us/original/ab/cd/abcdef0123456789.jpg")
    );
    assert!(!outcome.caption.as_ref().unwrap().short_summary.is_empty());
    assert!(outcome.prompt.as_ref().unwrap().contains("['alice']"));
    assert_eq!(outcome.artist.as_deref(), Some(&["alice".to_string()][..]));
    assert_eq!(harness.outcomes.count(), 1);
    assert_eq!(shard_name(12345), "0");
}

#[tokio::test]
async fn missing_record_is_recorded_by_the_bulk_path() {
    let harness = Harness::new(vec![], ModelMode::Success);
    let stats = harness.runner(4).run_range(5, 6, &RunOptions::default()).await.unwrap();

    assert_eq!(stats.total, 1);
    assert_eq!(stats.success, 0);
    assert_eq!(stats.failed, 1);

    let outcome = harness.outcomes.outcome(5).unwrap();
    assert_eq!(outcome.status_code, 404);
    assert_eq!(outcome.error.as_deref(), Some("no URL, status=404"));
    assert_eq!(outcome.processing_time, 0.0);
    // Recorded without ever entering a worker.
    assert_eq!(harness.images.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn gif_only_range_produces_405_outcomes_and_no_model_calls() {
    let harness = Harness::new(
        vec![gif_record(100), gif_record(101), gif_record(102)],
        ModelMode::Success,
    );
    let stats = harness.runner(4).run_range(100, 103, &RunOptions::default()).await.unwrap();

    assert_eq!(stats.failed, 3);
    assert_eq!(stats.success, 0);
    for id in 100..103 {
        assert_eq!(harness.outcomes.outcome(id).unwrap().status_code, 405);
    }
    assert_eq!(harness.model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rerun_skips_previous_successes() {
    let harness = Harness::new(vec![jpg_record(42)], ModelMode::Success);
    let runner = harness.runner(4);

    let first = runner.run_range(42, 43, &RunOptions::default()).await.unwrap();
    assert_eq!(first.success, 1);
    let calls_after_first = harness.model.calls.load(Ordering::SeqCst);

    let second = runner.run_range(42, 43, &RunOptions::default()).await.unwrap();
    assert_eq!(second.skipped, 1);
    assert_eq!(second.success, 0);
    assert_eq!(second.failed, 0);
    assert_eq!(harness.model.calls.load(Ordering::SeqCst), calls_after_first);
    // A status 200 outcome never flips to failure on a rerun.
    assert!(harness.outcomes.outcome(42).unwrap().success);
}

#[tokio::test]
async fn grandfathered_prompt_only_outcome_counts_as_processed() {
    let harness = Harness::new(vec![jpg_record(50)], ModelMode::Success);
    let mut old = CaptionOutcome::failure(50, 0, "legacy");
    old.prompt = Some("an old prompt".to_string());
    old.error = None;
    harness.outcomes.seed(old);

    let stats = harness.runner(4).run_range(50, 51, &RunOptions::default()).await.unwrap();
    assert_eq!(stats.skipped, 1);
    assert_eq!(harness.model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cross_shard_range_covers_every_id() {
    let records = (99_998..100_003).map(jpg_record).collect();
    let harness = Harness::new(records, ModelMode::Success);
    let stats = harness.runner(8).run_range(99_998, 100_003, &RunOptions::default()).await.unwrap();

    assert_eq!(stats.total, 5);
    assert_eq!(stats.success, 5);
    for id in 99_998..100_003 {
        let outcome = harness.outcomes.outcome(id).unwrap();
        assert_eq!(outcome.status_code, 200);
        let expected_shard = if id < 100_000 { "0" } else { "1" };
        assert_eq!(shard_name(outcome.id), expected_shard);
    }
}

#[tokio::test]
async fn empty_range_returns_zero_counters() {
    let harness = Harness::new(vec![jpg_record(7)], ModelMode::Success);
    let stats = harness.runner(4).run_range(7, 7, &RunOptions::default()).await.unwrap();

    assert_eq!(stats, caption_batch::BatchStats::default());
    assert_eq!(harness.outcomes.count(), 0);
}

#[tokio::test]
async fn run_list_restricts_work_to_the_given_ids() {
    let harness = Harness::new(
        vec![jpg_record(1), jpg_record(2), jpg_record(3)],
        ModelMode::Success,
    );
    let stats = harness.runner(4).run_list(&[1, 3], &RunOptions::default()).await.unwrap();

    assert_eq!(stats.total, 2);
    assert_eq!(stats.success, 2);
    assert!(harness.outcomes.outcome(1).is_some());
    assert!(harness.outcomes.outcome(2).is_none());
    assert!(harness.outcomes.outcome(3).is_some());
}

#[tokio::test]
async fn run_by_key_with_range_uses_the_shard_scan() {
    let harness = Harness::new(vec![jpg_record(10), jpg_record(11)], ModelMode::Success);
    let stats = harness
        .runner(4)
        .run_by_key_with_range(0, 10, 13, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(stats.total, 3);
    assert_eq!(stats.success, 2);
    // Id 12 has no record: picked up as 404 by the bulk path.
    assert_eq!(stats.failed, 1);
    assert_eq!(harness.outcomes.outcome(12).unwrap().status_code, 404);
}

#[tokio::test]
async fn fan_out_respects_the_concurrency_bound() {
    let records = (200..216).map(jpg_record).collect();
    let harness = Harness::new(records, ModelMode::Success);
    let stats = harness.runner(2).run_range(200, 216, &RunOptions::default()).await.unwrap();

    assert_eq!(stats.success, 16);
    assert!(
        harness.model.max_in_flight.load(Ordering::SeqCst) <= 2,
        "observed more than max_concurrency workers in flight"
    );
}
