//! 설정 모듈 - lpmm.toml 로드 및 검증
//!
//! 모든 지식베이스 파라미터는 `[lpmm_knowledge]` 섹션 하나에 모여 있습니다.
//! 설정 변경은 지식베이스를 다시 로드해야 반영됩니다 (부분 핫스왑 없음).
//!
//! ```toml
//! [lpmm_knowledge]
//! lpmm_mode = "agent"
//! embedding_dimension = 1024
//! qa_res_top_k = 3
//!
//! [embedding]
//! provider = "openai"
//! model = "BAAI/bge-m3"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LpmmError, Result};

/// 기본 설정 파일 이름
pub const DEFAULT_CONFIG_FILE: &str = "lpmm.toml";

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.lpmm-kb/)
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lpmm-kb")
}

// ============================================================================
// Mode
// ============================================================================

/// 검색 전략
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LpmmMode {
    /// 문단 벡터 검색만 사용
    Classic,
    /// 벡터 + 그래프(PPR) 하이브리드
    Agent,
}

impl std::fmt::Display for LpmmMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LpmmMode::Classic => write!(f, "classic"),
            LpmmMode::Agent => write!(f, "agent"),
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// `[lpmm_knowledge]` 섹션
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub lpmm_mode: LpmmMode,
    /// 벡터 차원 - 임베딩 프로바이더 출력과 정확히 일치해야 함
    pub embedding_dimension: usize,
    pub max_embedding_workers: usize,
    /// 임베딩 요청 1회당 텍스트 수
    pub embedding_chunk_size: usize,
    pub info_extraction_workers: usize,
    pub enable_ppr: bool,
    pub qa_relation_search_top_k: usize,
    pub qa_relation_threshold: f32,
    pub qa_paragraph_search_top_k: usize,
    /// 융합 시 문단 벡터 점수 가중치 (1.0이면 순수 벡터 검색)
    pub qa_paragraph_node_weight: f32,
    pub qa_ent_filter_top_k: usize,
    /// 랜덤 워크를 계속할 확률
    pub qa_ppr_damping: f32,
    pub qa_res_top_k: usize,
    pub qa_ppr_max_iterations: usize,
    /// L1 잔차가 이 값보다 작으면 수렴으로 판단
    pub qa_ppr_tolerance: f64,
    /// PPR 반복 시간 제한 (밀리초). 초과 시 현재 상태로 조기 종료
    pub qa_ppr_timeout_ms: Option<u64>,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            lpmm_mode: LpmmMode::Agent,
            embedding_dimension: 1024,
            max_embedding_workers: 3,
            embedding_chunk_size: 4,
            info_extraction_workers: 3,
            enable_ppr: true,
            qa_relation_search_top_k: 10,
            qa_relation_threshold: 0.5,
            qa_paragraph_search_top_k: 1000,
            qa_paragraph_node_weight: 0.05,
            qa_ent_filter_top_k: 10,
            qa_ppr_damping: 0.8,
            qa_res_top_k: 3,
            qa_ppr_max_iterations: 100,
            qa_ppr_tolerance: 1e-6,
            qa_ppr_timeout_ms: None,
        }
    }
}

/// `[chunking]` 섹션
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub min_characters: usize,
    pub max_characters: usize,
    pub overlap_characters: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_characters: 200,
            max_characters: 1200,
            overlap_characters: 0,
        }
    }
}

/// 임베딩 프로바이더 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    Gemini,
    /// OpenAI 호환 `/embeddings` 엔드포인트 (SiliconFlow, Ollama 등)
    Openai,
    /// 로컬 해싱 임베딩 (오프라인/테스트용)
    Hashing,
}

/// `[embedding]` 섹션
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingBackend,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// API 키를 읽을 환경변수 이름
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingBackend::Openai,
            model: None,
            base_url: None,
            api_key_env: None,
            timeout_secs: 30,
        }
    }
}

/// 추출 프로바이더 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionBackend {
    /// OpenAI 호환 chat completions
    Llm,
    /// 휴리스틱 (네트워크 호출 없음)
    Heuristic,
}

/// `[extraction]` 섹션
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub provider: ExtractionBackend,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: ExtractionBackend::Llm,
            model: None,
            base_url: None,
            api_key_env: None,
            temperature: 0.2,
            timeout_secs: 120,
        }
    }
}

/// `[storage]` 섹션
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// 백업 폴더 (없으면 `data_dir/backups`)
    pub backup_dir: Option<PathBuf>,
    /// 보관할 최대 백업 수 (0이면 무제한)
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backup_dir: None,
            max_backups: 30,
        }
    }
}

impl StorageConfig {
    /// SQLite 파일 경로
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("knowledge.db")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backups"))
    }
}

// ============================================================================
// LpmmConfig
// ============================================================================

/// 전체 설정
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LpmmConfig {
    pub lpmm_knowledge: KnowledgeConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub extraction: ExtractionConfig,
    pub storage: StorageConfig,
}

impl LpmmConfig {
    /// TOML 문자열에서 파싱 후 검증
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: LpmmConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 파일에서 로드
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// 파일이 있으면 로드, 없으면 기본값
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("Config file {:?} not found, using defaults", path);
            Ok(Self::default())
        }
    }

    /// 값 범위 검증
    pub fn validate(&self) -> Result<()> {
        let kb = &self.lpmm_knowledge;

        let positive = [
            ("embedding_dimension", kb.embedding_dimension),
            ("max_embedding_workers", kb.max_embedding_workers),
            ("embedding_chunk_size", kb.embedding_chunk_size),
            ("info_extraction_workers", kb.info_extraction_workers),
            ("qa_paragraph_search_top_k", kb.qa_paragraph_search_top_k),
            ("qa_res_top_k", kb.qa_res_top_k),
            ("qa_ppr_max_iterations", kb.qa_ppr_max_iterations),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(LpmmError::InvalidConfig(format!("{} must be > 0", name)));
            }
        }

        if !(kb.qa_ppr_damping > 0.0 && kb.qa_ppr_damping < 1.0) {
            return Err(LpmmError::InvalidConfig(format!(
                "qa_ppr_damping must be in (0, 1), got {}",
                kb.qa_ppr_damping
            )));
        }

        if !(0.0..=1.0).contains(&kb.qa_paragraph_node_weight) {
            return Err(LpmmError::InvalidConfig(format!(
                "qa_paragraph_node_weight must be in [0, 1], got {}",
                kb.qa_paragraph_node_weight
            )));
        }

        if !(-1.0..=1.0).contains(&kb.qa_relation_threshold) {
            return Err(LpmmError::InvalidConfig(format!(
                "qa_relation_threshold must be in [-1, 1], got {}",
                kb.qa_relation_threshold
            )));
        }

        if kb.qa_ppr_tolerance.is_nan() || kb.qa_ppr_tolerance <= 0.0 {
            return Err(LpmmError::InvalidConfig(
                "qa_ppr_tolerance must be > 0".to_string(),
            ));
        }

        let chunking = &self.chunking;
        // min_characters = 0 이면 작은 청크 병합 안 함
        if chunking.max_characters == 0 || chunking.min_characters > chunking.max_characters {
            return Err(LpmmError::InvalidConfig(format!(
                "chunking requires max_characters > 0 and min_characters <= max_characters (got {} / {})",
                chunking.min_characters, chunking.max_characters
            )));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
