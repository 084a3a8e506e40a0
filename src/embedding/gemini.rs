//! Google Gemini 임베딩 (gemini-embedding-001, MRL 차원 지정)
//!
//! source: https://ai.google.dev/gemini-api/docs/embeddings

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{backoff, get_api_key, http_client, EmbeddingProvider, INITIAL_BACKOFF, MAX_RETRIES};
use crate::config::EmbeddingConfig;
use crate::error::{LpmmError, Result};

const PROVIDER: &str = "gemini";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-embedding-001";
const API_KEY_ENVS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"];

/// Rate Limiter 설정 (Gemini 무료 티어: 60 RPM)
const RATE_LIMIT_RPM: u32 = 60;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// MRL로 지정 가능한 차원 범위
const MIN_DIMENSION: usize = 128;
const MAX_DIMENSION: usize = 3072;

/// Google Gemini 임베딩 구현체
#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    rate_limiter: Arc<Mutex<RateLimiter>>,
    initial_backoff: Duration,
}

/// Rate Limiter with minimum delay between requests
#[derive(Debug)]
struct RateLimiter {
    requests: Vec<Instant>,
    max_requests: u32,
    window: Duration,
    min_delay: Duration,
    last_request: Option<Instant>,
}

impl RateLimiter {
    fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            requests: Vec::new(),
            max_requests,
            window,
            min_delay: window / max_requests.max(1),
            last_request: None,
        }
    }

    /// 요청 가능 여부 확인 및 대기
    async fn acquire(&mut self) {
        // 1. 최소 딜레이 적용 (버스트 방지)
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                tracing::debug!("Min delay: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        let now = Instant::now();
        self.requests.retain(|&t| now.duration_since(t) < self.window);

        // 2. 윈도우 내 요청 수 초과 시 대기
        if self.requests.len() >= self.max_requests as usize {
            if let Some(&oldest) = self.requests.first() {
                let wait_time = self.window.saturating_sub(now.duration_since(oldest));
                if !wait_time.is_zero() {
                    tracing::debug!("Rate limit reached, waiting {:?}", wait_time);
                    tokio::time::sleep(wait_time).await;
                }
                let now = Instant::now();
                self.requests.retain(|&t| now.duration_since(t) < self.window);
            }
        }

        let now = Instant::now();
        self.requests.push(now);
        self.last_request = Some(now);
    }
}

// ============================================================================
// Request / Response
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    #[serde(rename = "taskType")]
    task_type: &'static str,
    #[serde(rename = "outputDimensionality")]
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct BatchEmbedRequest {
    requests: Vec<EmbedRequest>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    #[serde(default)]
    status: String,
}

// ============================================================================
// GeminiEmbedding
// ============================================================================

impl GeminiEmbedding {
    /// 차원을 지정하여 생성
    pub fn with_dimension(api_key: String, dimension: usize) -> Result<Self> {
        if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&dimension) {
            return Err(LpmmError::InvalidConfig(format!(
                "Invalid Gemini dimension: {}. Must be between {} and {}",
                dimension, MIN_DIMENSION, MAX_DIMENSION
            )));
        }

        Ok(Self {
            api_key,
            client: http_client(PROVIDER, 30)?,
            base_url: GEMINI_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            dimension,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(RATE_LIMIT_RPM, RATE_LIMIT_WINDOW))),
            initial_backoff: INITIAL_BACKOFF,
        })
    }

    /// `[embedding]` 설정으로 생성
    ///
    /// API 키 우선순위: `api_key_env` > GEMINI_API_KEY > GOOGLE_AI_API_KEY
    pub fn from_config(config: &EmbeddingConfig, dimension: usize) -> Result<Self> {
        let api_key = get_api_key(config.api_key_env.as_deref(), API_KEY_ENVS)?;
        let mut embedder = Self::with_dimension(api_key, dimension)?;
        embedder.client = http_client(PROVIDER, config.timeout_secs)?;
        if let Some(model) = &config.model {
            embedder.model = model.clone();
        }
        if let Some(base_url) = &config.base_url {
            embedder = embedder.with_base_url(base_url);
        }
        Ok(embedder)
    }

    /// API 엔드포인트 변경 (프록시, 테스트 서버)
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// 분당 요청 수 제한 변경
    pub fn with_rate_limit(mut self, rpm: u32) -> Self {
        self.rate_limiter = Arc::new(Mutex::new(RateLimiter::new(rpm, RATE_LIMIT_WINDOW)));
        self
    }

    /// 429 재시도 초기 백오프 변경
    pub fn with_initial_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    fn request_for(&self, text: &str) -> EmbedRequest {
        EmbedRequest {
            model: format!("models/{}", self.model),
            content: EmbedContent {
                parts: vec![EmbedPart {
                    text: text.to_string(),
                }],
            },
            task_type: "RETRIEVAL_DOCUMENT",
            output_dimensionality: self.dimension,
        }
    }

    /// POST + 429 재시도 루프
    async fn post_with_retry<B, R>(&self, method: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/models/{}:{}", self.base_url, self.model, method);
        let mut last_error: Option<LpmmError> = None;

        for attempt in 0..=MAX_RETRIES {
            {
                let mut limiter = self.rate_limiter.lock().await;
                limiter.acquire().await;
            }

            // API 키는 URL이 아닌 헤더로 전송
            let response = match self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(body)
                .send()
                .await
            {
                Ok(resp) => resp,
                // 연결 실패는 재시도하지 않음 (429만 백오프)
                Err(e) => return Err(LpmmError::unavailable(PROVIDER, e)),
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| LpmmError::unavailable(PROVIDER, format!("failed to read response body: {}", e)))?;

            if status.is_success() {
                return serde_json::from_str(&body)
                    .map_err(|e| LpmmError::response(PROVIDER, format!("failed to parse response: {}", e)));
            }

            if status.as_u16() == 429 {
                let wait = backoff(self.initial_backoff, attempt);
                tracing::warn!(
                    "Rate limit hit (429), backing off {:?} (attempt {}/{})",
                    wait,
                    attempt + 1,
                    MAX_RETRIES
                );
                last_error = Some(LpmmError::unavailable(PROVIDER, "rate limit exceeded (429)"));
                if attempt < MAX_RETRIES {
                    tokio::time::sleep(wait).await;
                    continue;
                }
                break;
            }

            if let Ok(error) = serde_json::from_str::<GeminiError>(&body) {
                return Err(LpmmError::response(
                    PROVIDER,
                    format!("{} {}: {}", status.as_u16(), error.error.status, error.error.message),
                ));
            }
            return Err(LpmmError::response(PROVIDER, format!("{}: {}", status, body)));
        }

        Err(last_error.unwrap_or_else(|| {
            LpmmError::unavailable(PROVIDER, format!("embedding failed after {} retries", MAX_RETRIES))
        }))
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let response: EmbedResponse = self.post_with_retry("embedContent", &self.request_for(text)).await?;
        Ok(response.embedding.values)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        // 빈 텍스트는 요청에서 빼고 영벡터로 채움
        let requests: Vec<EmbedRequest> = texts
            .iter()
            .filter(|t| !t.trim().is_empty())
            .map(|t| self.request_for(t))
            .collect();
        let expected = requests.len();

        let mut values = if expected > 0 {
            let response: BatchEmbedResponse = self
                .post_with_retry("batchEmbedContents", &BatchEmbedRequest { requests })
                .await?;
            if response.embeddings.len() != expected {
                return Err(LpmmError::response(
                    PROVIDER,
                    format!(
                        "batch returned {} embeddings for {} inputs",
                        response.embeddings.len(),
                        expected
                    ),
                ));
            }
            response.embeddings.into_iter()
        } else {
            Vec::new().into_iter()
        };

        tracing::debug!("Embedded batch of {} texts", texts.len());

        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            if text.trim().is_empty() {
                results.push(vec![0.0; self.dimension]);
            } else if let Some(embedding) = values.next() {
                results.push(embedding.values);
            }
        }
        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        PROVIDER
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn embedder(server: &MockServer) -> GeminiEmbedding {
        GeminiEmbedding::with_dimension("fake_key".to_string(), 128)
            .unwrap()
            .with_base_url(&server.base_url())
            .with_rate_limit(60_000)
            .with_initial_backoff(Duration::from_millis(1))
    }

    #[test]
    fn test_invalid_dimension() {
        let err = GeminiEmbedding::with_dimension("fake_key".to_string(), 64).unwrap_err();
        assert!(matches!(err, LpmmError::InvalidConfig(_)));
        assert!(err.to_string().contains("Invalid Gemini dimension"));

        for dim in [128, 768, 1024, 3072] {
            assert!(GeminiEmbedding::with_dimension("fake_key".to_string(), dim).is_ok());
        }
    }

    #[tokio::test]
    async fn test_embed_sends_key_header_and_dimension() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/models/gemini-embedding-001:embedContent")
                .header("x-goog-api-key", "fake_key")
                .is_true(|req| String::from_utf8_lossy(req.body().as_ref()).contains("\"outputDimensionality\":128"));
            then.status(200)
                .json_body(json!({ "embedding": { "values": [0.1, 0.2] } }));
        });

        let vector = embedder(&server).embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2]);
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_skips_blank() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/models/gemini-embedding-001:batchEmbedContents");
            then.status(200).json_body(json!({
                "embeddings": [ { "values": [1.0] }, { "values": [2.0] } ]
            }));
        });

        let texts = vec!["a".to_string(), " ".to_string(), "b".to_string()];
        let vectors = embedder(&server).embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vec![1.0]);
        assert_eq!(vectors[1], vec![0.0; 128]);
        assert_eq!(vectors[2], vec![2.0]);
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_then_unavailable() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/models/gemini-embedding-001:embedContent");
            then.status(429).body("slow down");
        });

        let err = embedder(&server).embed("hello").await.unwrap_err();
        assert!(matches!(err, LpmmError::ProviderUnavailable { .. }));
        mock.assert_calls(MAX_RETRIES as usize + 1);
    }

    #[tokio::test]
    async fn test_connection_failure_is_not_retried() {
        // 기본 백오프(2초)를 유지한 채 닫힌 포트로 요청
        let embedder = GeminiEmbedding::with_dimension("fake_key".to_string(), 128)
            .unwrap()
            .with_base_url("http://127.0.0.1:9")
            .with_rate_limit(60_000);

        let started = Instant::now();
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, LpmmError::ProviderUnavailable { .. }));
        assert!(started.elapsed() < INITIAL_BACKOFF);
    }

    #[tokio::test]
    async fn test_client_error_fails_fast() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/models/gemini-embedding-001:embedContent");
            then.status(400).json_body(json!({
                "error": { "message": "API key not valid", "status": "INVALID_ARGUMENT" }
            }));
        });

        let err = embedder(&server).embed("hello").await.unwrap_err();
        assert!(matches!(err, LpmmError::ProviderResponse { .. }));
        assert!(err.to_string().contains("API key not valid"));
        mock.assert_calls(1);
    }
}
