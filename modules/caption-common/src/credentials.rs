use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::info;

/// Handle to the Google service-account credentials file.
///
/// Initialization is an explicit step: callers must obtain a `Credentials`
/// before constructing the model client, and initialization refuses to
/// proceed when neither an existing file nor inline content is available.
#[derive(Debug, Clone)]
pub struct Credentials {
    path: PathBuf,
}

impl Credentials {
    /// Materialize the credentials file.
    ///
    /// When `inline_content` is set it is written verbatim to `path`
    /// (creating parent directories). Otherwise `path` must already exist
    /// and be non-empty.
    pub fn initialize(path: &str, inline_content: Option<&str>) -> Result<Self> {
        let path = PathBuf::from(path);

        match inline_content {
            Some(content) => {
                if let Some(dir) = path.parent() {
                    if !dir.as_os_str().is_empty() {
                        std::fs::create_dir_all(dir).with_context(|| {
                            format!("Failed to create credentials directory {}", dir.display())
                        })?;
                    }
                }
                std::fs::write(&path, content).with_context(|| {
                    format!("Failed to write credentials to {}", path.display())
                })?;
                info!(path = %path.display(), "Credentials written from inline content");
            }
            None => {
                let meta = std::fs::metadata(&path).with_context(|| {
                    format!(
                        "Credentials file {} not found and GOOGLE_APPLICATION_CREDENTIALS_CONTENT is unset",
                        path.display()
                    )
                })?;
                if meta.len() == 0 {
                    bail!("Credentials file {} exists but is empty", path.display());
                }
                info!(path = %path.display(), "Using existing credentials file");
            }
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_content_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds/sa.json");
        let creds =
            Credentials::initialize(path.to_str().unwrap(), Some("{\"type\":\"service_account\"}"))
                .unwrap();
        assert_eq!(
            std::fs::read_to_string(creds.path()).unwrap(),
            "{\"type\":\"service_account\"}"
        );
    }

    #[test]
    fn missing_file_without_content_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(Credentials::initialize(path.to_str().unwrap(), None).is_err());
    }

    #[test]
    fn empty_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        std::fs::write(&path, "").unwrap();
        assert!(Credentials::initialize(path.to_str().unwrap(), None).is_err());
    }
}
