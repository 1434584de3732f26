use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tracing::debug;

use crate::types::{GenerateRequest, GenerateResponse};
use crate::ModelError;

/// One-shot client bound to a single region endpoint. Rebuilt per attempt so
/// each retry lands on a freshly sampled region.
pub(crate) struct VertexClient {
    http: reqwest::Client,
    token: String,
    region: String,
    project_id: String,
}

impl VertexClient {
    pub fn new(token: String, region: &str, project_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            region: region.to_string(),
            project_id: project_id.to_string(),
        }
    }

    fn headers(&self) -> Result<HeaderMap, ModelError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|_| ModelError::InvalidToken)?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    pub async fn generate(
        &self,
        model_id: &str,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, ModelError> {
        let url = format!(
            "https://{region}-aiplatform.googleapis.com/v1/projects/{project}/locations/{region}/publishers/google/models/{model}:generateContent",
            region = self.region,
            project = self.project_id,
            model = model_id,
        );

        debug!(region = %self.region, model = model_id, "Vertex generateContent request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api { status: status.as_u16(), body });
        }

        Ok(response.json().await?)
    }
}
