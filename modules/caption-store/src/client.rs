use mongodb::options::{ClientOptions, Compressor};
use mongodb::{Client, Database};

use crate::error::Result;

const METADATA_DB: &str = "danbooru";
const CAPTIONS_DB: &str = "gemini_captions_danbooru";

/// Thin wrapper around `mongodb::Client` providing connection setup.
///
/// One client is shared by every gateway; reads and upserts are independent
/// per key, so no further coordination is needed.
#[derive(Clone)]
pub struct StoreClient {
    client: Client,
}

impl StoreClient {
    /// Connect with zlib wire compression enabled. The tag and metadata
    /// scans move a lot of small documents, so compression pays for itself.
    pub async fn connect(uri: &str) -> Result<Self> {
        let mut options = ClientOptions::parse(uri).await?;
        options.app_name = Some("caption-batch".to_string());
        options.compressors = Some(vec![Compressor::Zlib { level: Some(9) }]);
        let client = Client::with_options(options)?;
        Ok(Self { client })
    }

    /// Database holding image metadata, the tag graph, and character stats.
    pub fn metadata_db(&self) -> Database {
        self.client.database(METADATA_DB)
    }

    /// Database holding the per-shard caption outcome collections.
    pub fn captions_db(&self) -> Database {
        self.client.database(CAPTIONS_DB)
    }
}
