//! lpmm-kb - LPMM 하이브리드 지식 검색
//!
//! 문단 벡터 검색과 엔티티/관계 지식 그래프(Personalized PageRank)를 결합한
//! 로컬 지식베이스입니다. classic 모드는 벡터 검색만, agent 모드는 두 신호를 융합합니다.

pub mod cli;
pub mod collector;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extraction;
pub mod knowledge;

// Re-exports
pub use config::{LpmmConfig, LpmmMode};
pub use embedding::{create_embedder, EmbeddingProvider};
pub use error::{LpmmError, Result};
pub use extraction::{create_extractor, Extraction, InfoExtractor, Triple};
pub use knowledge::{
    ImportReport, KnowledgeBase, KnowledgeHandle, RetrievalOutcome, RetrievedPassage, SourceDocument,
};
