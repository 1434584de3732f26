use serde::{Deserialize, Serialize};

// =============================================================================
// Request types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateRequest {
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
    pub safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Serialize)]
pub(crate) struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum Part {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    InlineData {
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationConfig {
    pub max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
pub(crate) struct SafetySetting {
    pub category: &'static str,
    pub threshold: &'static str,
}

/// All safety categories disabled: the pipeline's own status taxonomy
/// records the model-side refusals that still get through.
pub(crate) fn safety_off() -> Vec<SafetySetting> {
    const CATEGORIES: [&str; 5] = [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
        "HARM_CATEGORY_CIVIC_INTEGRITY",
    ];
    CATEGORIES
        .iter()
        .map(|category| SafetySetting { category, threshold: "OFF" })
        .collect()
}

impl GenerateRequest {
    pub fn vision(prompt: &str, image_base64: String, mime_type: &str) -> Self {
        Self {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![
                    Part::Text { text: prompt.to_string() },
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: mime_type.to_string(),
                            data: image_base64,
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig { max_output_tokens: 4096 },
            safety_settings: safety_off(),
        }
    }
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Candidate {
    #[serde(default)]
    pub content: Option<CandidateContent>,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<ResponsePart>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ResponsePart {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    ProhibitedContent,
    Recitation,
    #[serde(other)]
    Other,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "STOP",
            FinishReason::MaxTokens => "MAX_TOKENS",
            FinishReason::Safety => "SAFETY",
            FinishReason::ProhibitedContent => "PROHIBITED_CONTENT",
            FinishReason::Recitation => "RECITATION",
            FinishReason::Other => "OTHER",
        }
    }
}

impl GenerateResponse {
    /// Concatenated text of the first candidate's parts.
    pub fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }

    /// Content-policy refusal, if any candidate was stopped by the safety
    /// layer. Distinguishes the never-retried terminal case from a merely
    /// empty response.
    pub fn refusal(&self) -> Option<FinishReason> {
        self.candidates.iter().find_map(|c| match c.finish_reason {
            Some(reason @ (FinishReason::Safety | FinishReason::ProhibitedContent)) => {
                Some(reason)
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_to_camel_case() {
        let request = GenerateRequest::vision("describe", "QUJD".to_string(), "image/png");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 4096);
        assert_eq!(value["contents"][0]["parts"][0]["text"], "describe");
        assert_eq!(value["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/png");
        let safety = value["safetySettings"].as_array().unwrap();
        assert_eq!(safety.len(), 5);
        assert!(safety.iter().all(|s| s["threshold"] == "OFF"));
    }

    #[test]
    fn response_text_joins_parts() {
        let response: GenerateResponse = serde_json::from_str(
            r#"{"candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(response.text(), "ab");
    }

    #[test]
    fn refusal_is_detected_for_prohibited_content() {
        let response: GenerateResponse = serde_json::from_str(
            r#"{"candidates": [{"finishReason": "PROHIBITED_CONTENT"}]}"#,
        )
        .unwrap();
        assert_eq!(response.refusal(), Some(FinishReason::ProhibitedContent));
        assert!(response.text().is_empty());
    }

    #[test]
    fn unknown_finish_reason_is_tolerated() {
        let response: GenerateResponse =
            serde_json::from_str(r#"{"candidates": [{"finishReason": "SOMETHING_NEW"}]}"#)
                .unwrap();
        assert_eq!(response.candidates[0].finish_reason, Some(FinishReason::Other));
        assert!(response.refusal().is_none());
    }

    #[test]
    fn empty_response_has_no_text() {
        let response: GenerateResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(response.text().is_empty());
        assert!(response.refusal().is_none());
    }
}
