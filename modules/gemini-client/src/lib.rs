mod client;
pub mod repair;
pub(crate) mod types;

pub use types::FinishReason;

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use caption_common::{Caption, Credentials};
use gcp_auth::{CustomServiceAccount, TokenProvider};
use rand::seq::IndexedRandom;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use client::VertexClient;
use types::GenerateRequest;

const SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];

/// Vertex regions the model is served from. A region is sampled uniformly
/// per attempt, so retries rotate away from a throttled endpoint.
pub const DEFAULT_REGIONS: [&str; 14] = [
    "us-east5",
    "us-south1",
    "us-central1",
    "us-west4",
    "us-east1",
    "us-east4",
    "us-west1",
    "europe-west4",
    "europe-west9",
    "europe-west1",
    "europe-southwest1",
    "europe-west8",
    "europe-north1",
    "europe-central2",
];

const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Vertex API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Authentication error: {0}")]
    Auth(#[from] gcp_auth::Error),

    #[error("Access token is not a valid header value")]
    InvalidToken,

    #[error("Empty model response")]
    EmptyResponse,
}

impl ModelError {
    pub fn kind(&self) -> &'static str {
        match self {
            ModelError::Transport(_) => "Transport",
            ModelError::Api { .. } => "Api",
            ModelError::Auth(_) => "Auth",
            ModelError::InvalidToken => "InvalidToken",
            ModelError::EmptyResponse => "EmptyResponse",
        }
    }
}

/// Terminal result of one model invocation, after internal retries.
#[derive(Debug, Clone)]
pub enum ModelOutcome {
    /// Text arrived and parsed into the caption schema.
    Parsed { caption: Caption, raw: String },
    /// Content-policy refusal. Never retried.
    Refused { reason: String },
    /// Text arrived but could not be repaired into the schema.
    Unparsable { raw: String, error: String },
    /// Every attempt failed on transport/shape/auth.
    Exhausted { error: String, error_type: String, error_stack: String },
}

impl ModelOutcome {
    pub fn status_code(&self) -> i32 {
        match self {
            ModelOutcome::Parsed { .. } => 200,
            ModelOutcome::Unparsable { .. } => 400,
            ModelOutcome::Exhausted { .. } => 500,
            ModelOutcome::Refused { .. } => 999,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ModelOutcome::Parsed { .. })
    }
}

/// Vision-captioning client for Gemini on Vertex AI.
///
/// A fresh single-region HTTP client is built per attempt; the underlying
/// SDK-equivalent state is therefore never shared across concurrent calls.
#[derive(Clone)]
pub struct GeminiVertex {
    model_id: String,
    project_id: String,
    regions: Vec<String>,
    retry_attempts: u32,
    retry_delay_secs: u64,
    token_provider: Arc<dyn TokenProvider>,
}

impl GeminiVertex {
    pub fn new(
        model_id: impl Into<String>,
        project_id: impl Into<String>,
        credentials: &Credentials,
    ) -> Result<Self, ModelError> {
        let account = CustomServiceAccount::from_file(credentials.path())?;
        Ok(Self::with_provider(model_id, project_id, Arc::new(account)))
    }

    pub fn with_provider(
        model_id: impl Into<String>,
        project_id: impl Into<String>,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            project_id: project_id.into(),
            regions: DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect(),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            token_provider,
        }
    }

    pub fn with_regions(mut self, regions: Vec<String>) -> Self {
        if !regions.is_empty() {
            self.regions = regions;
        }
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay_secs: u64) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_delay_secs = delay_secs;
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Caption one image. Retries transient failures with exponential
    /// backoff and a freshly sampled region per attempt; content-policy
    /// refusals and unparsable text are terminal immediately.
    pub async fn generate(&self, prompt: &str, image: &[u8], mime_type: &str) -> ModelOutcome {
        let task_id = short_task_id();
        let started = Instant::now();
        info!(task = %task_id, model = %self.model_id, bytes = image.len(), "Calling Gemini");

        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let request = GenerateRequest::vision(prompt, encoded, mime_type);

        let mut last_error: Option<ModelError> = None;

        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                let delay = backoff_delay(self.retry_delay_secs, attempt - 1);
                debug!(task = %task_id, delay_secs = delay.as_secs(), "Backing off before retry");
                tokio::time::sleep(delay).await;
            }

            let region = self
                .regions
                .choose(&mut rand::rng())
                .map(|r| r.as_str())
                .unwrap_or("us-central1");

            let token = match self.token_provider.token(SCOPES).await {
                Ok(token) => token,
                Err(e) => {
                    let auth_error = ModelError::Auth(e);
                    log_auth_hint(&task_id, &auth_error);
                    warn!(
                        task = %task_id,
                        attempt = attempt + 1,
                        max = self.retry_attempts,
                        error = %auth_error,
                        "Token acquisition failed"
                    );
                    last_error = Some(auth_error);
                    continue;
                }
            };

            let client = VertexClient::new(token.as_str().to_string(), region, &self.project_id);

            match client.generate(&self.model_id, &request).await {
                Ok(response) => {
                    let text = response.text();

                    if text.is_empty() {
                        if let Some(reason) = response.refusal() {
                            warn!(
                                task = %task_id,
                                reason = reason.as_str(),
                                "Refused by content policy, not retrying"
                            );
                            return ModelOutcome::Refused { reason: reason.as_str().to_string() };
                        }
                        warn!(
                            task = %task_id,
                            attempt = attempt + 1,
                            max = self.retry_attempts,
                            "Empty model response"
                        );
                        last_error = Some(ModelError::EmptyResponse);
                        continue;
                    }

                    info!(
                        task = %task_id,
                        region,
                        elapsed_secs = started.elapsed().as_secs_f64(),
                        "Gemini call succeeded"
                    );

                    return match repair::parse_lenient::<Caption>(&text) {
                        Ok(caption) => ModelOutcome::Parsed { caption, raw: text },
                        Err(e) => {
                            warn!(task = %task_id, error = %e, "Caption JSON could not be repaired");
                            ModelOutcome::Unparsable { raw: text, error: e.to_string() }
                        }
                    };
                }
                Err(e) => {
                    log_auth_hint(&task_id, &e);
                    warn!(
                        task = %task_id,
                        attempt = attempt + 1,
                        max = self.retry_attempts,
                        region,
                        error = %e,
                        "Model call failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let last = last_error.unwrap_or(ModelError::EmptyResponse);
        error!(
            task = %task_id,
            error = %last,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "All Gemini attempts failed"
        );
        ModelOutcome::Exhausted {
            error: format!("API call failed: {last}"),
            error_type: last.kind().to_string(),
            error_stack: format!("{last:?}"),
        }
    }
}

/// Delay before the attempt following `failed_attempt` (0-based).
fn backoff_delay(base_secs: u64, failed_attempt: u32) -> Duration {
    Duration::from_secs(base_secs << failed_attempt.min(16))
}

fn short_task_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn log_auth_hint(task_id: &str, error: &ModelError) {
    let scope_problem = match error {
        ModelError::Auth(e) => e.to_string().to_lowercase().contains("invalid_scope"),
        ModelError::Api { status, body } => {
            *status == 403 && body.to_lowercase().contains("scope")
        }
        _ => false,
    };
    if scope_problem {
        error!(
            task = %task_id,
            "OAuth scope rejected; check GOOGLE_APPLICATION_CREDENTIALS and the service account's Vertex AI permissions"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_base_times_two() {
        assert_eq!(backoff_delay(5, 0), Duration::from_secs(5));
        assert_eq!(backoff_delay(5, 1), Duration::from_secs(10));
        assert_eq!(backoff_delay(5, 2), Duration::from_secs(20));
    }

    #[test]
    fn status_codes_match_the_taxonomy() {
        let parsed = ModelOutcome::Parsed {
            caption: Caption {
                regular_summary: String::new(),
                midjourney_style_summary: String::new(),
                short_summary: String::new(),
                creation_instructional_summary: String::new(),
                deviantart_commission_request: String::new(),
            },
            raw: String::new(),
        };
        assert_eq!(parsed.status_code(), 200);
        assert!(parsed.is_success());

        let refused = ModelOutcome::Refused { reason: "SAFETY".into() };
        assert_eq!(refused.status_code(), 999);
        assert!(!refused.is_success());

        let unparsable = ModelOutcome::Unparsable { raw: "x".into(), error: "e".into() };
        assert_eq!(unparsable.status_code(), 400);

        let exhausted = ModelOutcome::Exhausted {
            error: "e".into(),
            error_type: "Transport".into(),
            error_stack: "stack".into(),
        };
        assert_eq!(exhausted.status_code(), 500);
    }

    #[test]
    fn task_ids_are_short() {
        assert_eq!(short_task_id().len(), 8);
    }

    #[test]
    fn default_region_pool_is_complete() {
        assert_eq!(DEFAULT_REGIONS.len(), 14);
        assert!(DEFAULT_REGIONS.contains(&"us-central1"));
    }
}
