//! 임베딩 모듈 - 텍스트 → 고정 차원 벡터
//!
//! 임베딩 오라클은 교체 가능한 인터페이스(`EmbeddingProvider`)입니다.
//! 지식베이스 전체가 하나의 차원을 공유하므로 프로바이더 차원과
//! 설정의 `embedding_dimension`이 다르면 로드 시점에 실패합니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = create_embedder(&config.embedding, 1024)?;
//! let vector = embedder.embed("Hello, world!").await?;
//! ```

mod gemini;
mod hashing;
mod openai;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::{LpmmError, Result};

pub use gemini::GeminiEmbedding;
pub use hashing::HashingEmbedding;
pub use openai::OpenAiEmbedding;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 같은 입력에 대해 같은 벡터를 돌려준다고 가정합니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 배치 임베딩 (기본 구현: 순차 호출). 결과 순서 = 입력 순서
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Shared HTTP Helpers
// ============================================================================

/// 429 에러 시 최대 재시도 횟수
pub(crate) const MAX_RETRIES: u32 = 3;
/// 재시도 시 초기 백오프
pub(crate) const INITIAL_BACKOFF: Duration = Duration::from_millis(2000);

/// 타임아웃이 설정된 HTTP 클라이언트
pub(crate) fn http_client(provider: &str, timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| LpmmError::unavailable(provider, format!("failed to create HTTP client: {}", e)))
}

/// 지수 백오프 간격
pub(crate) fn backoff(initial: Duration, attempt: u32) -> Duration {
    initial * 2u32.pow(attempt)
}

// ============================================================================
// API Key Management
// ============================================================================

/// API 키 로드 (환경변수에서)
///
/// `override_env`가 있으면 그 변수만, 없으면 `defaults`를 순서대로 확인합니다.
pub fn get_api_key(override_env: Option<&str>, defaults: &[&str]) -> Result<String> {
    let candidates: Vec<&str> = match override_env {
        Some(name) => vec![name],
        None => defaults.to_vec(),
    };

    for name in &candidates {
        if let Ok(key) = std::env::var(name) {
            if !key.is_empty() {
                tracing::debug!("Using API key from {}", name);
                return Ok(key);
            }
        }
    }

    Err(LpmmError::InvalidConfig(format!(
        "API key not found. Set one of: {}",
        candidates.join(", ")
    )))
}

// ============================================================================
// Factory Function
// ============================================================================

/// 설정으로 임베딩 프로바이더 생성
///
/// `dimension`은 지식베이스의 `embedding_dimension`입니다.
pub fn create_embedder(config: &EmbeddingConfig, dimension: usize) -> Result<Arc<dyn EmbeddingProvider>> {
    let embedder: Arc<dyn EmbeddingProvider> = match config.provider {
        EmbeddingBackend::Gemini => Arc::new(GeminiEmbedding::from_config(config, dimension)?),
        EmbeddingBackend::Openai => Arc::new(OpenAiEmbedding::from_config(config, dimension)?),
        EmbeddingBackend::Hashing => Arc::new(HashingEmbedding::new(dimension)),
    };

    tracing::info!(
        "Using {} embedding (dimension: {})",
        embedder.name(),
        embedder.dimension()
    );
    Ok(embedder)
}

// ============================================================================
// Tests
// ============================================================================
