use caption_common::Caption;
use serde::{Deserialize, Serialize};

/// One persisted outcome per image id. Upserted by `_id`; never deleted by
/// the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionOutcome {
    #[serde(rename = "_id")]
    pub id: i64,

    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub status_code: i32,
    #[serde(default)]
    pub processing_time: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<Caption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,

    /// Model text that failed caption parsing (status 400 keeps the raw
    /// response for later inspection).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,

    /// Set by the store on first insert; later upserts leave it untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<f64>,
}

impl CaptionOutcome {
    pub fn failure(id: i64, status_code: i32, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            status_code,
            processing_time: 0.0,
            image_url: None,
            prompt: None,
            caption: None,
            artist: None,
            character: None,
            tags: None,
            error: Some(error.into()),
            error_type: None,
            error_stack: None,
            raw_response: None,
            created_at: None,
        }
    }

    pub fn success(id: i64, status_code: i32) -> Self {
        Self {
            id,
            success: true,
            status_code,
            processing_time: 0.0,
            image_url: None,
            prompt: None,
            caption: None,
            artist: None,
            character: None,
            tags: None,
            error: None,
            error_type: None,
            error_stack: None,
            raw_response: None,
            created_at: None,
        }
    }
}
