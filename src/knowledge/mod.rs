//! Knowledge 모듈 - LPMM 하이브리드 지식 검색
//!
//! - Chunker: 문서 → TextUnit 분할
//! - Store: SQLite 영속 저장소 (TextUnit, 임베딩, 엔티티, 관계)
//! - Snapshot: 검색용 불변 인메모리 뷰 (벡터 인덱스 + 그래프)
//! - Pipeline: 임베딩/추출 워커 풀
//! - Hybrid: 관계 검색 + PPR + 문단 벡터 검색 융합
//! - Base: 모드 고정 인스턴스와 스냅샷 게시
//! - Backup: 백업 생성/목록/복원/삭제

mod backup;
mod base;
mod chunker;
mod graph;
mod hybrid;
mod model;
mod pipeline;
mod ppr;
mod snapshot;
mod store;
mod vector;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use backup::{BackupInfo, BackupManager};
pub use base::{KnowledgeBase, KnowledgeHandle, KnowledgeStats};
pub use chunker::{paragraph_chunker, split_document, ChunkConfig, Chunker, ParagraphChunker};
pub use graph::{GraphEdge, KnowledgeGraph};
pub use hybrid::{
    entity_filter, relation_seeds, GraphSkip, HybridRetriever, RetrievalOutcome, RetrievalTrace,
    RetrievedPassage,
};
pub use model::{normalize_entity, text_unit_id, Entity, RelationEdge, SourceDocument, TextUnit};
pub use pipeline::{FailureStage, ImportReport, IngestPipeline, PipelineSettings, UnitFailure};
pub use ppr::{personalized_pagerank, PprParams, PprResult};
pub use snapshot::{KnowledgeSnapshot, SnapshotData, StoredUnit};
pub use store::{
    DeleteReport, DocumentRecord, ExtractionCommit, KnowledgeStore, PendingStage, StoreStats, UnitSync,
};
pub use vector::{cosine_similarity, VectorHit, VectorIndex, VectorScope};
