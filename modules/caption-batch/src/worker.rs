//! Per-item state machine: dedup check, URL resolution, GIF gate, image
//! acquisition, context assembly, model invocation, and persistence.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use caption_common::Language;
use caption_store::{CaptionOutcome, UrlStatus};
use gemini_client::ModelOutcome;
use tracing::{debug, error, info, warn};

use crate::images::ImageAcquirer;
use crate::traits::{CaptionModel, ImageSource, MetadataReader, OutcomeStore, TagReader};
use crate::tree::character_reference;

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub output_dir: Option<PathBuf>,
    pub save_image: bool,
    /// Skip the existing-result check (the orchestrator pre-filters, but a
    /// direct single-id call wants the check on).
    pub skip_existing_check: bool,
}

/// Drives one id from lookup to a persisted outcome. Every terminal state
/// except "already done" writes to the outcome store before returning;
/// failures never propagate to the orchestrator.
pub struct CaptionWorker {
    pics: Arc<dyn MetadataReader>,
    outcomes: Arc<dyn OutcomeStore>,
    tags: Arc<dyn TagReader>,
    images: Arc<dyn ImageSource>,
    model: Arc<dyn CaptionModel>,
    language: Language,
}

impl CaptionWorker {
    pub fn new(
        pics: Arc<dyn MetadataReader>,
        outcomes: Arc<dyn OutcomeStore>,
        tags: Arc<dyn TagReader>,
        images: Arc<dyn ImageSource>,
        model: Arc<dyn CaptionModel>,
        language: Language,
    ) -> Self {
        Self { pics, outcomes, tags, images, model, language }
    }

    pub async fn process(
        &self,
        id: i64,
        preferred_url: Option<String>,
        opts: &ProcessOptions,
    ) -> CaptionOutcome {
        let started = Instant::now();
        info!(id, "Processing");

        // Already done? Only a stored success counts; failures are retried.
        if !opts.skip_existing_check {
            match self.outcomes.get(id).await {
                Ok(Some(existing)) if existing.success => {
                    info!(id, "Already processed, skipping");
                    return existing;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(id, error = %e, "Existing-result check failed, proceeding");
                }
            }
        }

        // URL resolution.
        let url = match preferred_url {
            Some(url) => url,
            None => {
                let resolved = self.pics.resolve_urls(&[id]).await;
                let resolution = resolved.get(&id);
                match resolution {
                    Some(r) if r.status == UrlStatus::Ok && r.url.is_some() => {
                        r.url.clone().unwrap_or_default()
                    }
                    Some(r) => {
                        let code = r.status.code();
                        warn!(id, status = code, "No URL for id");
                        let mut outcome =
                            CaptionOutcome::failure(id, code, format!("no URL, status={code}"));
                        outcome.processing_time = started.elapsed().as_secs_f64();
                        self.persist(&outcome).await;
                        return outcome;
                    }
                    None => {
                        let mut outcome =
                            CaptionOutcome::failure(id, 500, "no URL, status=500");
                        outcome.processing_time = started.elapsed().as_secs_f64();
                        self.persist(&outcome).await;
                        return outcome;
                    }
                }
            }
        };

        // GIF gate: animated sources are never sent to the model.
        if url.to_lowercase().contains(".gif") {
            warn!(id, url = %url, "GIF not processed");
            let mut outcome = CaptionOutcome::failure(id, 405, "GIF not processed");
            outcome.image_url = Some(url);
            outcome.processing_time = started.elapsed().as_secs_f64();
            self.persist(&outcome).await;
            return outcome;
        }

        // Fetch bytes.
        let image = match self.images.acquire(id, Some(&url)).await {
            Ok(image) => image,
            Err(e) => {
                error!(id, url = %url, error = %e, "Image acquisition failed");
                let mut outcome =
                    CaptionOutcome::failure(id, 500, format!("Image acquisition failed: {e:#}"));
                outcome.image_url = Some(url);
                outcome.processing_time = started.elapsed().as_secs_f64();
                self.persist(&outcome).await;
                return outcome;
            }
        };

        if opts.save_image {
            if let Some(dir) = &opts.output_dir {
                let path = dir.join(format!("{id}.{}", image.file_ext));
                if let Err(e) = ImageAcquirer::save_image(&image.bytes, &path).await {
                    warn!(id, error = %e, "Failed to save image bytes");
                }
            }
        }

        // Context: tags plus the best-effort character reference tree.
        let record = match self.pics.record(id).await {
            Ok(record) => record,
            Err(e) => {
                error!(id, error = %e, "Metadata read failed");
                let mut outcome =
                    CaptionOutcome::failure(id, 500, format!("Metadata read failed: {e:#}"));
                outcome.image_url = Some(url);
                outcome.processing_time = started.elapsed().as_secs_f64();
                self.persist(&outcome).await;
                return outcome;
            }
        };

        let reference = match character_reference(
            self.pics.as_ref(),
            self.tags.as_ref(),
            id,
            self.language,
        )
        .await
        {
            Ok(reference) => reference,
            Err(e) => {
                debug!(id, error = %e, "Character reference unavailable");
                None
            }
        };

        let prompt = crate::prompt::build_prompt(
            record.artists(),
            record.characters(),
            record.general(),
            self.language,
            reference.as_deref(),
        );

        // Model invocation. Retries and terminal classification live in C7.
        let verdict = self.model.generate(&prompt, &image.bytes, &image.mime_type).await;

        let outcome = match verdict {
            ModelOutcome::Parsed { caption, .. } => {
                let mut outcome = CaptionOutcome::success(id, 200);
                outcome.image_url = Some(url);
                outcome.prompt = Some(prompt);
                outcome.caption = Some(caption);
                outcome.artist = Some(record.artists().to_vec());
                outcome.character = Some(record.characters().to_vec());
                outcome.tags = Some(record.general().to_vec());
                outcome.processing_time = started.elapsed().as_secs_f64();
                outcome
            }
            ModelOutcome::Refused { reason } => {
                let mut outcome = CaptionOutcome::failure(
                    id,
                    999,
                    format!("ContentPolicyViolation: {reason}"),
                );
                outcome.error_type = Some("ContentPolicyViolation".to_string());
                outcome.image_url = Some(url);
                outcome.processing_time = started.elapsed().as_secs_f64();
                outcome
            }
            ModelOutcome::Unparsable { raw, error } => {
                let mut outcome =
                    CaptionOutcome::failure(id, 400, format!("JSON parse failed: {error}"));
                outcome.error_type = Some("JsonParseError".to_string());
                outcome.raw_response = Some(raw);
                outcome.image_url = Some(url);
                outcome.processing_time = started.elapsed().as_secs_f64();
                outcome
            }
            ModelOutcome::Exhausted { error, error_type, error_stack } => {
                let mut outcome = CaptionOutcome::failure(id, 500, error);
                outcome.error_type = Some(error_type);
                outcome.error_stack = Some(error_stack);
                outcome.image_url = Some(url);
                outcome.processing_time = started.elapsed().as_secs_f64();
                outcome
            }
        };

        self.persist(&outcome).await;

        if outcome.success {
            if let Some(dir) = &opts.output_dir {
                if let Err(e) = self.outcomes.save_result_file(id, &outcome, dir).await {
                    warn!(id, error = %e, "Failed to write result file");
                }
            }
            info!(id, elapsed_secs = outcome.processing_time, "Caption stored");
        } else {
            error!(
                id,
                status = outcome.status_code,
                error = outcome.error.as_deref().unwrap_or(""),
                "Processing failed"
            );
        }

        outcome
    }

    /// A failed outcome write must not abort the item; log and move on.
    async fn persist(&self, outcome: &CaptionOutcome) {
        if let Err(e) = self.outcomes.upsert(outcome).await {
            warn!(id = outcome.id, error = %e, "Failed to record outcome");
        }
    }
}
