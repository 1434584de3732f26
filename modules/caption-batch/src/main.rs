use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use caption_batch::archive::HfArchive;
use caption_batch::traits::{CaptionModel, ImageSource, MetadataReader, OutcomeStore, TagReader};
use caption_batch::{BatchRunner, CaptionWorker, ImageAcquirer, RunOptions};
use caption_common::{Config, Credentials, Language};
use caption_store::{CaptionStore, PicsStore, StoreClient, TagStore};
use gemini_client::GeminiVertex;

/// Batch image captioning: resolve ids to images, prompt a vision model,
/// and persist one outcome per id.
#[derive(Parser, Debug)]
#[command(name = "gemini-caption", version)]
struct Cli {
    /// Process the shard [key*100000, (key+1)*100000).
    #[arg(long, conflicts_with_all = ["start_id", "end_id"])]
    key: Option<i64>,

    /// First id of a closed-open range; requires --end-id.
    #[arg(long, requires = "end_id")]
    start_id: Option<i64>,

    /// One past the last id of the range; requires --start-id.
    #[arg(long, requires = "start_id")]
    end_id: Option<i64>,

    /// Maximum concurrent per-item workers.
    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = 100)]
    max_concurrency: usize,

    /// Remote model identifier.
    #[arg(long, env = "MODEL_ID", default_value = "gemini-2.0-flash-lite-001")]
    model_id: String,

    /// Prompt language, zh or en. Anything else falls back to zh.
    #[arg(long, env = "LANGUAGE", default_value = "zh")]
    language: String,

    /// Document-store connection string.
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017/")]
    mongodb_uri: String,

    /// Directory for per-item JSON results (and images with --save-image).
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Persist fetched image bytes under --output-dir.
    #[arg(long)]
    save_image: bool,

    /// HuggingFace dataset repo mirroring the images.
    #[arg(long, env = "HF_REPO", default_value = "picollect/danbooru")]
    hf_repo: String,

    /// Cache directory for archive downloads.
    #[arg(long, env = "HF_CACHE_DIR")]
    hf_cache_dir: Option<String>,

    /// Prefer the archive over the CDN when no URL override is in play.
    #[arg(long)]
    use_hfpics_first: bool,

    /// debug, info, warning, or error.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write logs to this file.
    #[arg(long, env = "LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Google Cloud project hosting the model endpoint.
    #[arg(long, env = "PROJECT_ID", default_value = "poised-runner-402505")]
    project_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_file.as_deref())?;

    let config = Config::from_env();
    config.log_redacted();

    // Fatal initialization errors (credentials, store connectivity) are the
    // only non-zero exits besides argument validation; per-item failures are
    // recorded in the outcome collections and the run still exits 0.
    let credentials = Credentials::initialize(
        &config.google_credentials_path,
        config.google_credentials_content.as_deref(),
    )
    .context("Credential initialization failed")?;

    let language = Language::parse_or(&cli.language, Language::Zh);
    let archive_first = cli.use_hfpics_first || config.use_hfpics_first;

    let store = StoreClient::connect(&cli.mongodb_uri)
        .await
        .context("Document store connection failed")?;

    let archive = match HfArchive::new(&cli.hf_repo, cli.hf_cache_dir.as_deref()) {
        Ok(archive) => Some(archive),
        Err(e) => {
            warn!(error = %e, "Archive client unavailable, using the CDN only");
            None
        }
    };

    let acquirer = ImageAcquirer::new(archive, archive_first)?;
    let vertex = GeminiVertex::new(&cli.model_id, &cli.project_id, &credentials)
        .context("Model client initialization failed")?;

    let pics: Arc<dyn MetadataReader> = Arc::new(PicsStore::new(&store));
    let outcomes: Arc<dyn OutcomeStore> = Arc::new(CaptionStore::new(&store));
    let tags: Arc<dyn TagReader> = Arc::new(TagStore::new(&store));
    let images: Arc<dyn ImageSource> = Arc::new(acquirer);
    let model: Arc<dyn CaptionModel> = Arc::new(vertex);

    let worker = Arc::new(CaptionWorker::new(
        pics.clone(),
        outcomes.clone(),
        tags,
        images,
        model,
        language,
    ));
    let runner = BatchRunner::new(worker, pics, outcomes, cli.max_concurrency);

    let opts = RunOptions { output_dir: cli.output_dir.clone(), save_image: cli.save_image };

    info!(
        model = %cli.model_id,
        language = language.code(),
        max_concurrency = cli.max_concurrency,
        "Starting batch captioning"
    );

    let stats = match (cli.key, cli.start_id, cli.end_id) {
        (Some(key), _, _) => runner.run_by_key(key, &opts).await?,
        (None, Some(start), Some(end)) => runner.run_range(start, end, &opts).await?,
        _ => bail!("either --key or both --start-id and --end-id are required"),
    };

    println!("{stats}");
    Ok(())
}

fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let directive = match level {
        "debug" => "debug",
        "info" => "info",
        "warning" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let stdout = tracing_subscriber::fmt::layer();

    match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)?;
                }
            }
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file));
            tracing_subscriber::registry().with(filter).with(stdout).with(file_layer).init();
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
        }
    }
    Ok(())
}
