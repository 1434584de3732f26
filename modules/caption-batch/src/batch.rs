//! Batch orchestrator: enumerate ids, pre-scan for already-processed and
//! no-URL ids, then fan the survivors out to workers under a semaphore.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use caption_store::{CaptionOutcome, UrlResolution, UrlStatus, SHARD_SIZE};
use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::traits::{MetadataReader, OutcomeStore};
use crate::worker::{CaptionWorker, ProcessOptions};

/// Sub-range width for the range/list pre-scan; caps peak memory when a
/// whole-shard projection is not available.
const PRESCAN_CHUNK: i64 = 10_000;

pub const DEFAULT_MAX_CONCURRENCY: usize = 100;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total_time: f64,
    pub avg_time_per_item: f64,
}

impl fmt::Display for BatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total: {}, success: {}, failed: {}, skipped: {}, total_time: {:.2}s, avg_time_per_item: {:.2}s",
            self.total, self.success, self.failed, self.skipped, self.total_time,
            self.avg_time_per_item
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub output_dir: Option<PathBuf>,
    pub save_image: bool,
}

/// Work remaining after the pre-scans.
#[derive(Debug, Default)]
struct WorkSet {
    to_process: Vec<(i64, String)>,
    no_url: Vec<(i64, i32)>,
}

impl WorkSet {
    fn add(&mut self, id: i64, resolution: Option<&UrlResolution>) {
        match resolution {
            Some(r) if r.status == UrlStatus::Ok && r.url.is_some() => {
                if let Some(url) = &r.url {
                    self.to_process.push((id, url.clone()));
                }
            }
            Some(r) => self.no_url.push((id, r.status.code())),
            // The resolvers cover every requested id; treat a hole as absent.
            None => self.no_url.push((id, UrlStatus::NotFound.code())),
        }
    }
}

/// Orchestrates one batch run. Per-id failures are converted to outcomes
/// inside the worker; only fatal initialization errors propagate from here.
pub struct BatchRunner {
    worker: Arc<CaptionWorker>,
    pics: Arc<dyn MetadataReader>,
    outcomes: Arc<dyn OutcomeStore>,
    max_concurrency: usize,
}

impl BatchRunner {
    pub fn new(
        worker: Arc<CaptionWorker>,
        pics: Arc<dyn MetadataReader>,
        outcomes: Arc<dyn OutcomeStore>,
        max_concurrency: usize,
    ) -> Self {
        Self { worker, pics, outcomes, max_concurrency: max_concurrency.max(1) }
    }

    /// Process the whole shard `[key·100000, (key+1)·100000)`.
    pub async fn run_by_key(&self, key: i64, opts: &RunOptions) -> Result<BatchStats> {
        self.run_keyed(key, 0, SHARD_SIZE, opts).await
    }

    /// Process `[key·100000 + start, key·100000 + end)`, still using the
    /// single whole-shard URL scan.
    pub async fn run_by_key_with_range(
        &self,
        key: i64,
        start: i64,
        end: i64,
        opts: &RunOptions,
    ) -> Result<BatchStats> {
        self.run_keyed(key, start, end, opts).await
    }

    async fn run_keyed(
        &self,
        key: i64,
        offset_start: i64,
        offset_end: i64,
        opts: &RunOptions,
    ) -> Result<BatchStats> {
        let start = key * SHARD_SIZE + offset_start;
        let end = key * SHARD_SIZE + offset_end;
        if end <= start {
            return Ok(BatchStats::default());
        }
        info!(key, start, end, "Batch run over shard key");

        let processed = self.outcomes.existing_in_range(start, end).await?;
        let resolved = self.pics.resolve_urls_in_key(key).await?;

        let mut work = WorkSet::default();
        for id in start..end {
            if processed.contains(&id) {
                continue;
            }
            work.add(id, resolved.get(&id));
        }

        Ok(self
            .execute((end - start) as u64, processed.len() as u64, work, opts)
            .await)
    }

    /// Process the closed-open range `[start, end)`, pre-scanning URLs in
    /// 10,000-id sub-ranges.
    pub async fn run_range(&self, start: i64, end: i64, opts: &RunOptions) -> Result<BatchStats> {
        if end <= start {
            return Ok(BatchStats::default());
        }
        info!(start, end, "Batch run over id range");

        let processed = self.outcomes.existing_in_range(start, end).await?;

        let mut work = WorkSet::default();
        let mut chunk_start = start;
        while chunk_start < end {
            let chunk_end = (chunk_start + PRESCAN_CHUNK).min(end);
            let candidates: Vec<i64> =
                (chunk_start..chunk_end).filter(|id| !processed.contains(id)).collect();

            if !candidates.is_empty() {
                let resolved = self.pics.resolve_urls(&candidates).await;
                for id in candidates {
                    work.add(id, resolved.get(&id));
                }
            }
            chunk_start = chunk_end;
        }

        Ok(self
            .execute((end - start) as u64, processed.len() as u64, work, opts)
            .await)
    }

    /// Process an explicit id list. The dedup pre-scan covers
    /// `[min, max + 1)`; the work set is restricted to the given ids.
    pub async fn run_list(&self, ids: &[i64], opts: &RunOptions) -> Result<BatchStats> {
        if ids.is_empty() {
            return Ok(BatchStats::default());
        }
        let min = ids.iter().copied().min().unwrap_or(0);
        let max = ids.iter().copied().max().unwrap_or(0);
        info!(count = ids.len(), min, max, "Batch run over id list");

        let processed = self.outcomes.existing_in_range(min, max + 1).await?;
        let skipped = ids.iter().filter(|id| processed.contains(id)).count() as u64;
        let candidates: Vec<i64> =
            ids.iter().copied().filter(|id| !processed.contains(id)).collect();

        let mut work = WorkSet::default();
        for chunk in candidates.chunks(PRESCAN_CHUNK as usize) {
            let resolved: HashMap<i64, UrlResolution> = self.pics.resolve_urls(chunk).await;
            for &id in chunk {
                work.add(id, resolved.get(&id));
            }
        }

        Ok(self.execute(ids.len() as u64, skipped, work, opts).await)
    }

    async fn execute(
        &self,
        total: u64,
        skipped: u64,
        work: WorkSet,
        opts: &RunOptions,
    ) -> BatchStats {
        let started = Instant::now();
        let pending = work.to_process.len();
        let no_url_count = work.no_url.len() as u64;
        info!(total, skipped, no_url = no_url_count, pending, "Batch work set");

        // Record an outcome for every id with no usable URL so the run
        // accounts for the whole range without burning worker slots.
        if !work.no_url.is_empty() {
            info!(count = no_url_count, "Recording no-URL outcomes");
            stream::iter(work.no_url.into_iter().map(|(id, code)| {
                let outcomes = self.outcomes.clone();
                async move {
                    let mut outcome =
                        CaptionOutcome::failure(id, code, format!("no URL, status={code}"));
                    outcome.processing_time = 0.0;
                    if let Err(e) = outcomes.upsert(&outcome).await {
                        warn!(id, error = %e, "Failed to record no-URL outcome");
                    }
                }
            }))
            .buffer_unordered(self.max_concurrency)
            .collect::<Vec<_>>()
            .await;
        }

        if pending == 0 {
            info!("Nothing to process");
            let total_time = started.elapsed().as_secs_f64();
            let stats = BatchStats {
                total,
                success: 0,
                failed: no_url_count,
                skipped,
                total_time,
                avg_time_per_item: 0.0,
            };
            info!(%stats, "Batch complete");
            return stats;
        }

        // Bounded fan-out: workers enter under the semaphore, completions
        // arrive unordered.
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let process_opts = ProcessOptions {
            output_dir: opts.output_dir.clone(),
            save_image: opts.save_image,
            skip_existing_check: false,
        };

        let mut success = 0u64;
        let mut failed = 0u64;

        let mut completions = stream::iter(work.to_process.into_iter().map(|(id, url)| {
            let semaphore = semaphore.clone();
            let worker = self.worker.clone();
            let process_opts = process_opts.clone();
            async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return CaptionOutcome::failure(id, 500, "worker pool closed"),
                };
                worker.process(id, Some(url), &process_opts).await
            }
        }))
        .buffer_unordered(self.max_concurrency);

        while let Some(outcome) = completions.next().await {
            if outcome.success {
                success += 1;
            } else {
                failed += 1;
            }
        }

        let total_time = started.elapsed().as_secs_f64();
        let stats = BatchStats {
            total,
            success,
            failed: failed + no_url_count,
            skipped,
            total_time,
            avg_time_per_item: total_time / pending as f64,
        };
        info!(%stats, "Batch complete");
        stats
    }
}
