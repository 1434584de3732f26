use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use reqwest::header::{HeaderMap, HeaderValue, REFERER, USER_AGENT};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::archive::HfArchive;
use crate::traits::ImageSource;

/// Delays between download attempts. The CDN throttles aggressively, so the
/// ladder backs off far more steeply than the model client's.
const RETRY_DELAYS: [u64; 5] = [1, 5, 30, 60, 300];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const REFERER_URL: &str = "https://danbooru.donmai.us/";

/// Fixed pool of realistic browser User-Agents; one is sampled per attempt.
const USER_AGENTS: [&str; 8] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.6099.71 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.6778.85 Safari/537.36",
    "Mozilla/5.0 (Windows NT 11.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.6834.110 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.6099.109 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.6778.140 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.6778.69 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.6099.71 Safari/537.36 Edg/120.0.6099.71",
    "Mozilla/5.0 (Windows NT 11.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.6778.86 Safari/537.36 Edg/131.0.6778.86",
];

/// Extension → MIME type. Unknown extensions fall back to JPEG, which the
/// model accepts for the overwhelming majority of mislabeled files.
pub fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}

/// Lowercased extension of a URL or path, empty when there is none.
pub fn extension_from_url(url: &str) -> String {
    let name = url.rsplit('/').next().unwrap_or(url);
    match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_lowercase(),
        None => String::new(),
    }
}

/// Where the bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Archive,
    Cdn,
}

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub file_ext: String,
    pub source: FetchSource,
}

/// Two-source image fetcher: the HuggingFace archive when preferred and no
/// URL override is given, otherwise the CDN with a wget-preferred download
/// path and a fixed retry ladder.
pub struct ImageAcquirer {
    http: reqwest::Client,
    archive: Option<HfArchive>,
    archive_first: bool,
    use_wget: bool,
}

impl ImageAcquirer {
    pub fn new(archive: Option<HfArchive>, archive_first: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build image HTTP client")?;

        let use_wget = wget_available();
        if use_wget {
            info!("wget available, preferring it for image downloads");
        } else {
            info!("wget not available, using the internal HTTP client");
        }

        Ok(Self { http, archive, archive_first, use_wget })
    }

    /// Acquire image bytes for an id. The archive is consulted first only
    /// when configured so and no resolved URL was supplied; a URL download
    /// tries wget once, then walks the retry ladder with the internal
    /// client. Returns on the first successful byte read.
    pub async fn acquire(&self, id: i64, preferred_url: Option<&str>) -> Result<FetchedImage> {
        if self.archive_first && preferred_url.is_none() {
            if let Some(archive) = &self.archive {
                if let Some(image) = archive.fetch(id).await {
                    let mut ext = extension_from_url(&image.recorded_path);
                    if ext.is_empty() {
                        ext = "jpg".to_string();
                    }
                    return Ok(FetchedImage {
                        bytes: image.bytes,
                        mime_type: mime_for_extension(&ext).to_string(),
                        file_ext: ext,
                        source: FetchSource::Archive,
                    });
                }
                warn!(id, "Archive miss, falling back to the CDN");
            }
        }

        let Some(url) = preferred_url else {
            bail!("No URL available for image {id}");
        };

        let ext = extension_from_url(url);
        let mime_type = mime_for_extension(&ext).to_string();

        if self.use_wget {
            if let Some(bytes) = self.download_with_wget(url).await {
                info!(id, url, bytes = bytes.len(), "Image downloaded via wget");
                return Ok(FetchedImage {
                    bytes,
                    mime_type,
                    file_ext: ext,
                    source: FetchSource::Cdn,
                });
            }
        }

        let bytes = self.download_with_retries(url, id).await?;
        Ok(FetchedImage { bytes, mime_type, file_ext: ext, source: FetchSource::Cdn })
    }

    /// One external download attempt. wget brings its own retry/timeout
    /// flags; any failure falls back to the internal client.
    async fn download_with_wget(&self, url: &str) -> Option<Vec<u8>> {
        let temp = match tempfile::NamedTempFile::new() {
            Ok(temp) => temp,
            Err(e) => {
                warn!(error = %e, "Failed to create temp file for wget");
                return None;
            }
        };
        let temp_path = temp.path().to_path_buf();

        let user_agent = random_user_agent();
        let output = tokio::process::Command::new("wget")
            .arg("--quiet")
            .arg("--tries=3")
            .arg("--timeout=60")
            .arg(format!("--user-agent={user_agent}"))
            .arg(format!("--referer={REFERER_URL}"))
            .arg("-O")
            .arg(&temp_path)
            .arg(url)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                match tokio::fs::read(&temp_path).await {
                    Ok(bytes) if !bytes.is_empty() => Some(bytes),
                    Ok(_) => {
                        warn!(url, "wget wrote an empty file");
                        None
                    }
                    Err(e) => {
                        warn!(url, error = %e, "Failed to read wget output");
                        None
                    }
                }
            }
            Ok(output) => {
                warn!(
                    url,
                    code = output.status.code(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "wget exited with error"
                );
                None
            }
            Err(e) => {
                warn!(url, error = %e, "Failed to launch wget");
                None
            }
        }
    }

    /// Internal client download over the retry ladder: fresh random headers
    /// per attempt, sleep the scheduled delay between attempts.
    async fn download_with_retries(&self, url: &str, id: i64) -> Result<Vec<u8>> {
        let mut last_status: Option<u16> = None;

        for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
            debug!(id, url, attempt = attempt + 1, max = RETRY_DELAYS.len(), "Fetching image");

            match self.http.get(url).headers(random_headers()).send().await {
                Ok(response) if response.status() == reqwest::StatusCode::OK => {
                    match response.bytes().await {
                        Ok(bytes) => {
                            info!(id, url, bytes = bytes.len(), "Image downloaded");
                            return Ok(bytes.to_vec());
                        }
                        Err(e) => {
                            warn!(id, url, error = %e, "Failed to read image body");
                        }
                    }
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    warn!(id, url, status, "Image fetch rejected");
                    last_status = Some(status);
                }
                Err(e) => {
                    warn!(id, url, error = %e, "Image fetch failed");
                }
            }

            if attempt + 1 < RETRY_DELAYS.len() {
                debug!(id, delay_secs = delay, "Waiting before retry");
                tokio::time::sleep(Duration::from_secs(*delay)).await;
            }
        }

        match last_status {
            Some(status) => bail!(
                "Failed to download image after {} attempts, last status {status}",
                RETRY_DELAYS.len()
            ),
            None => bail!("Failed to download image after {} attempts", RETRY_DELAYS.len()),
        }
    }

    /// Write fetched bytes to disk (for `--save-image`).
    pub async fn save_image(bytes: &[u8], path: &std::path::Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(bytes).await?;
        debug!(path = %path.display(), "Image saved");
        Ok(())
    }
}

#[async_trait]
impl ImageSource for ImageAcquirer {
    async fn acquire(&self, id: i64, preferred_url: Option<&str>) -> Result<FetchedImage> {
        ImageAcquirer::acquire(self, id, preferred_url).await
    }
}

fn wget_available() -> bool {
    std::process::Command::new("wget")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok()
}

fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

fn random_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
    headers.insert(REFERER, HeaderValue::from_static(REFERER_URL));
    headers
}
