use caption_common::tags::tag_list;
use serde::{Deserialize, Deserializer};

const CDN_BASE: &str = "https://cdn.donmai.us/original";

/// Resolution status for a single image URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlStatus {
    /// Record present and a URL could be synthesized.
    Ok,
    /// No metadata record for the id.
    NotFound,
    /// Record present but unusable (missing hash/extension, or a GIF).
    Unusable,
    /// Storage error while resolving.
    StoreError,
}

impl UrlStatus {
    pub fn code(&self) -> i32 {
        match self {
            UrlStatus::Ok => 200,
            UrlStatus::NotFound => 404,
            UrlStatus::Unusable => 405,
            UrlStatus::StoreError => 500,
        }
    }
}

/// Outcome of resolving one id to its CDN URL.
#[derive(Debug, Clone)]
pub struct UrlResolution {
    pub url: Option<String>,
    pub status: UrlStatus,
}

impl UrlResolution {
    pub fn not_found() -> Self {
        Self { url: None, status: UrlStatus::NotFound }
    }

    pub fn store_error() -> Self {
        Self { url: None, status: UrlStatus::StoreError }
    }
}

/// Synthesize the CDN URL from a content hash and file extension.
///
/// Pure: returns `Some` exactly when both parts are non-empty, the extension
/// is not `gif`, and the resulting URL carries no `gif` fragment.
pub fn synthesize_url(md5: &str, file_ext: &str) -> Option<String> {
    if md5.is_empty() || file_ext.is_empty() || file_ext == "gif" {
        return None;
    }
    let h2 = md5.get(0..2)?;
    let h4 = md5.get(2..4)?;
    let url = format!("{CDN_BASE}/{h2}/{h4}/{md5}.{file_ext}");
    if url.contains("gif") {
        return None;
    }
    Some(url)
}

/// Image metadata document from the `pics` collection. Read-only here;
/// ingestion jobs own the lifecycle.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageRecord {
    #[serde(rename = "_id")]
    pub id: i64,

    #[serde(default, deserialize_with = "nullable_string")]
    pub md5: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub file_ext: String,

    #[serde(default, deserialize_with = "tag_list")]
    pub general_tags: Vec<String>,
    #[serde(default, deserialize_with = "tag_list")]
    pub character_tags: Vec<String>,
    #[serde(default, deserialize_with = "tag_list")]
    pub artist_tags: Vec<String>,
    #[serde(default, deserialize_with = "tag_list")]
    pub copyright_tags: Vec<String>,
    #[serde(default, deserialize_with = "tag_list")]
    pub meta_tags: Vec<String>,

    /// Older records carry their tags only in this nested block.
    #[serde(default)]
    pub danbooru_meta: Option<MetaTags>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetaTags {
    #[serde(default, deserialize_with = "tag_list")]
    pub general: Vec<String>,
    #[serde(default, deserialize_with = "tag_list")]
    pub character: Vec<String>,
    #[serde(default, deserialize_with = "tag_list")]
    pub artist: Vec<String>,
    #[serde(default, deserialize_with = "tag_list")]
    pub series: Vec<String>,
}

impl ImageRecord {
    /// Sentinel for an id with no stored record.
    pub fn from_id(id: i64) -> Self {
        Self { id, ..Default::default() }
    }

    pub fn image_url(&self) -> Option<String> {
        synthesize_url(&self.md5, &self.file_ext)
    }

    pub fn resolution(&self) -> UrlResolution {
        match self.image_url() {
            Some(url) => UrlResolution { url: Some(url), status: UrlStatus::Ok },
            None => UrlResolution { url: None, status: UrlStatus::Unusable },
        }
    }

    // Root-level tag arrays are authoritative; the meta block is a fallback
    // for older records that never got the root-level fields backfilled.

    pub fn general(&self) -> &[String] {
        pick(&self.general_tags, self.danbooru_meta.as_ref().map(|m| &m.general))
    }

    pub fn characters(&self) -> &[String] {
        pick(&self.character_tags, self.danbooru_meta.as_ref().map(|m| &m.character))
    }

    pub fn artists(&self) -> &[String] {
        pick(&self.artist_tags, self.danbooru_meta.as_ref().map(|m| &m.artist))
    }

    pub fn copyrights(&self) -> &[String] {
        pick(&self.copyright_tags, self.danbooru_meta.as_ref().map(|m| &m.series))
    }
}

fn pick<'a>(root: &'a [String], meta: Option<&'a Vec<String>>) -> &'a [String] {
    if !root.is_empty() {
        root
    } else {
        meta.map(|v| v.as_slice()).unwrap_or(&[])
    }
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_synthesis_happy_path() {
        assert_eq!(
            synthesize_url("abcdef0123456789", "jpg").as_deref(),
            Some("https://cdn.donmai.us/original/ab/cd/abcdef0123456789.jpg")
        );
    }

    #[test]
    fn url_synthesis_rejects_missing_parts() {
        assert_eq!(synthesize_url("", "jpg"), None);
        assert_eq!(synthesize_url("abcdef0123456789", ""), None);
        assert_eq!(synthesize_url("ab", "jpg"), None);
    }

    #[test]
    fn url_synthesis_rejects_gif() {
        assert_eq!(synthesize_url("abcdef0123456789", "gif"), None);
        assert_eq!(synthesize_url("abcdef0123456789", "gifv"), None);
    }

    #[test]
    fn missing_record_is_unusable() {
        let record = ImageRecord::from_id(42);
        assert_eq!(record.resolution().status, UrlStatus::Unusable);
        assert!(record.image_url().is_none());
    }

    #[test]
    fn record_deserializes_with_null_fields() {
        let record: ImageRecord = serde_json::from_str(
            r#"{"_id": 7, "md5": null, "file_ext": null, "general_tags": null}"#,
        )
        .unwrap();
        assert_eq!(record.id, 7);
        assert!(record.md5.is_empty());
        assert!(record.general().is_empty());
    }

    #[test]
    fn meta_block_is_a_fallback_only() {
        let record: ImageRecord = serde_json::from_str(
            r#"{
                "_id": 7,
                "general_tags": ["sky"],
                "danbooru_meta": {"general": ["old_sky"], "artist": ["alice"]}
            }"#,
        )
        .unwrap();
        assert_eq!(record.general(), ["sky"]);
        assert_eq!(record.artists(), ["alice"]);
    }

    #[test]
    fn scalar_tag_values_are_coerced() {
        let record: ImageRecord =
            serde_json::from_str(r#"{"_id": 7, "artist_tags": "alice"}"#).unwrap();
        assert_eq!(record.artists(), ["alice"]);
    }
}
