//! OpenAI 호환 임베딩 (`POST {base_url}/embeddings`)
//!
//! OpenAI, SiliconFlow, Ollama(/v1) 등 같은 스키마를 쓰는 엔드포인트에 사용합니다.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{backoff, get_api_key, http_client, EmbeddingProvider, INITIAL_BACKOFF, MAX_RETRIES};
use crate::config::EmbeddingConfig;
use crate::error::{LpmmError, Result};

const PROVIDER: &str = "openai";
const OPENAI_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "text-embedding-3-small";
const API_KEY_ENVS: &[&str] = &["OPENAI_API_KEY"];

/// OpenAI 호환 임베딩 구현체
#[derive(Debug)]
pub struct OpenAiEmbedding {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    initial_backoff: Duration,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

impl OpenAiEmbedding {
    pub fn new(api_key: String, model: impl Into<String>, dimension: usize) -> Result<Self> {
        Ok(Self {
            api_key,
            client: http_client(PROVIDER, 30)?,
            base_url: OPENAI_API_URL.to_string(),
            model: model.into(),
            dimension,
            initial_backoff: INITIAL_BACKOFF,
        })
    }

    /// `[embedding]` 설정으로 생성 (API 키: `api_key_env` > OPENAI_API_KEY)
    pub fn from_config(config: &EmbeddingConfig, dimension: usize) -> Result<Self> {
        let api_key = get_api_key(config.api_key_env.as_deref(), API_KEY_ENVS)?;
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let mut embedder = Self::new(api_key, model, dimension)?;
        embedder.client = http_client(PROVIDER, config.timeout_secs)?;
        if let Some(base_url) = &config.base_url {
            embedder = embedder.with_base_url(base_url);
        }
        Ok(embedder)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_initial_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    async fn request(&self, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: &self.model,
            input,
            dimensions: self.dimension,
            encoding_format: "float",
        };

        for attempt in 0..=MAX_RETRIES {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| LpmmError::unavailable(PROVIDER, e))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| LpmmError::unavailable(PROVIDER, format!("failed to read response body: {}", e)))?;

            if status.is_success() {
                let parsed: EmbeddingResponse = serde_json::from_str(&body)
                    .map_err(|e| LpmmError::response(PROVIDER, format!("failed to parse response: {}", e)))?;
                return reorder(parsed.data, input.len());
            }

            if status.as_u16() == 429 && attempt < MAX_RETRIES {
                let wait = backoff(self.initial_backoff, attempt);
                tracing::warn!(
                    "Rate limit hit (429), backing off {:?} (attempt {}/{})",
                    wait,
                    attempt + 1,
                    MAX_RETRIES
                );
                tokio::time::sleep(wait).await;
                continue;
            }
            if status.as_u16() == 429 {
                break;
            }

            let message = serde_json::from_str::<OpenAiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(LpmmError::response(PROVIDER, format!("{}: {}", status, message)));
        }

        Err(LpmmError::unavailable(
            PROVIDER,
            format!("rate limit exceeded after {} retries", MAX_RETRIES),
        ))
    }
}

/// 응답의 index 필드로 입력 순서 복원
fn reorder(mut data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>> {
    if data.len() != expected {
        return Err(LpmmError::response(
            PROVIDER,
            format!("returned {} embeddings for {} inputs", data.len(), expected),
        ));
    }
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| LpmmError::response(PROVIDER, "no embedding returned"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        tracing::debug!("Requesting {} embeddings from {}", texts.len(), self.model);
        self.request(texts).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        PROVIDER
    }
}
