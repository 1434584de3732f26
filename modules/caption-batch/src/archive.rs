use hf_hub::api::tokio::{Api, ApiBuilder, ApiRepo};
use tracing::{debug, info, warn};

/// Bytes pulled from the archive, plus the repo path they came from so the
/// caller can derive the real file extension.
#[derive(Debug, Clone)]
pub struct ArchiveImage {
    pub bytes: Vec<u8>,
    pub recorded_path: String,
}

/// HuggingFace-hosted image archive. Files are bucketed by `id / 10000`;
/// the extension is probed in a fixed order since the archive mirrors
/// whatever the CDN stored.
pub struct HfArchive {
    repo: ApiRepo,
    repo_id: String,
}

const EXTENSION_CANDIDATES: [&str; 4] = ["jpg", "png", "webp", "jpeg"];

/// Repo-relative path of an archived image.
pub fn archive_path(id: i64, ext: &str) -> String {
    format!("{}/{}.{}", id / 10_000, id, ext)
}

impl HfArchive {
    pub fn new(repo_id: &str, cache_dir: Option<&str>) -> anyhow::Result<Self> {
        let api: Api = match cache_dir {
            Some(dir) => ApiBuilder::new().with_cache_dir(dir.into()).build()?,
            None => ApiBuilder::new().build()?,
        };
        info!(repo = repo_id, "Archive client ready");
        Ok(Self { repo: api.dataset(repo_id.to_string()), repo_id: repo_id.to_string() })
    }

    /// Fetch an image by id, downloading into the hub cache. `None` when the
    /// archive has no file for the id under any candidate extension.
    pub async fn fetch(&self, id: i64) -> Option<ArchiveImage> {
        for ext in EXTENSION_CANDIDATES {
            let path = archive_path(id, ext);
            match self.repo.get(&path).await {
                Ok(local) => match tokio::fs::read(&local).await {
                    Ok(bytes) if !bytes.is_empty() => {
                        info!(id, repo = %self.repo_id, path = %path, "Image fetched from archive");
                        return Some(ArchiveImage { bytes, recorded_path: path });
                    }
                    Ok(_) => {
                        warn!(id, path = %path, "Archive returned an empty file");
                    }
                    Err(e) => {
                        warn!(id, path = %path, error = %e, "Failed to read cached archive file");
                    }
                },
                Err(e) => {
                    debug!(id, path = %path, error = %e, "Archive miss");
                }
            }
        }
        None
    }
}
