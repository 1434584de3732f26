use std::env;

use crate::language::Language;

/// Application configuration loaded from environment variables.
///
/// CLI flags override these at the binary boundary; the env vars are the
/// authoritative defaults for unattended runs.
#[derive(Debug, Clone)]
pub struct Config {
    // Document store
    pub mongodb_uri: String,

    // Batch
    pub max_concurrency: usize,

    // Model
    pub model_id: String,
    pub language: Language,

    // Archive (HuggingFace-hosted image mirror)
    pub hf_repo: String,
    pub hf_cache_dir: Option<String>,
    pub use_hfpics_first: bool,

    // Logging
    pub log_level: String,
    pub log_file: Option<String>,

    // Google credentials
    pub google_credentials_path: String,
    pub google_credentials_content: Option<String>,
}

impl Config {
    /// Load configuration from environment variables. Every field has a
    /// usable default except the credential content, which is optional by
    /// design (a pre-existing credentials file is the common case).
    pub fn from_env() -> Self {
        Self {
            mongodb_uri: env::var("MONGODB_URI")
                .unwrap_or_else(|_| "mongodb://localhost:27017/".to_string()),
            max_concurrency: env::var("MAX_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            model_id: env::var("MODEL_ID")
                .unwrap_or_else(|_| "gemini-2.0-flash-lite-001".to_string()),
            language: Language::parse_or(
                &env::var("LANGUAGE").unwrap_or_default(),
                Language::Zh,
            ),
            hf_repo: env::var("HF_REPO").unwrap_or_else(|_| "picollect/danbooru".to_string()),
            hf_cache_dir: env::var("HF_CACHE_DIR").ok(),
            use_hfpics_first: env::var("USE_HFPICS_FIRST")
                .map(|v| v == "1")
                .unwrap_or(false),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_file: env::var("LOG_FILE").ok(),
            google_credentials_path: env::var("GOOGLE_APPLICATION_CREDENTIALS")
                .unwrap_or_else(|_| "/kaggle/working/credentials.json".to_string()),
            google_credentials_content: env::var("GOOGLE_APPLICATION_CREDENTIALS_CONTENT").ok(),
        }
    }

    /// Log the shape of sensitive settings without their values.
    pub fn log_redacted(&self) {
        tracing::info!("MONGODB_URI = ({} chars)", self.mongodb_uri.len());
        tracing::info!("GOOGLE_APPLICATION_CREDENTIALS = {}", self.google_credentials_path);
        match &self.google_credentials_content {
            Some(content) => {
                tracing::info!("GOOGLE_APPLICATION_CREDENTIALS_CONTENT = ({} chars)", content.len())
            }
            None => tracing::info!("GOOGLE_APPLICATION_CREDENTIALS_CONTENT = (unset)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // Only assert fields that have no env var set in a clean test run.
        let config = Config::from_env();
        assert!(config.max_concurrency > 0);
        assert!(!config.model_id.is_empty());
    }
}
