//! 에러 타입 - LPMM 지식베이스 공통 에러
//!
//! 라이브러리 내부는 `LpmmError`를 사용하고, CLI 계층에서는 anyhow로 감싸서 출력합니다.

use thiserror::Error;

/// LPMM 에러
#[derive(Error, Debug)]
pub enum LpmmError {
    /// 차원/모드 불일치 - 로드 시점에 치명적, 조용히 복구하지 않음
    #[error("Configuration mismatch: {0}")]
    ConfigMismatch(String),

    /// 설정 값 검증 실패
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// 설정 파일 파싱 실패
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// 임베딩/추출 오라클에 도달할 수 없음
    #[error("Provider unavailable ({provider}): {message}")]
    ProviderUnavailable { provider: String, message: String },

    /// 오라클이 응답했지만 결과를 사용할 수 없음 (4xx, 파싱 실패 등)
    #[error("Provider error ({provider}): {message}")]
    ProviderResponse { provider: String, message: String },

    /// 검색 불가 (쿼리 임베딩 실패) - 캐시된 벡터로 폴백하지 않음
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// 일부 TextUnit 처리 실패 (배치는 계속 진행됨)
    #[error("Partial import failure: {failed} of {total} work items failed")]
    PartialImportFailure { failed: usize, total: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl LpmmError {
    /// 프로바이더 연결 실패 헬퍼
    pub fn unavailable(provider: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    /// 프로바이더 응답 에러 헬퍼
    pub fn response(provider: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::ProviderResponse {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    /// 프로바이더 측 실패 여부 (연결 실패 또는 응답 에러)
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. } | Self::ProviderResponse { .. }
        )
    }
}

impl From<tokio::task::JoinError> for LpmmError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LpmmError>;
