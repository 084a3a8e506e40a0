//! Mode Controller - 지식베이스 인스턴스
//!
//! 저장소, 가져오기 파이프라인, 검색기를 묶고 현재 스냅샷을 게시합니다.
//!
//! - 쓰기 작업(가져오기/삭제/복구)이 끝날 때마다 새 스냅샷을 만들어 원자적으로 교체
//! - 검색은 시작 시점의 스냅샷 `Arc`를 잡고 진행하므로 중간 상태를 보지 않음
//! - 모드는 인스턴스 수명 동안 고정, 바꾸려면 [`KnowledgeHandle::reload`]

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{LpmmConfig, LpmmMode};
use crate::embedding::{create_embedder, EmbeddingProvider};
use crate::error::{LpmmError, Result};
use crate::extraction::{create_extractor, InfoExtractor};

use super::backup::{BackupInfo, BackupManager};
use super::chunker::paragraph_chunker;
use super::hybrid::{HybridRetriever, RetrievalOutcome, RetrievedPassage};
use super::model::SourceDocument;
use super::pipeline::{ImportReport, IngestPipeline, PipelineSettings};
use super::snapshot::KnowledgeSnapshot;
use super::store::{DeleteReport, DocumentRecord, KnowledgeStore, StoreStats};

/// 지식베이스 상태 요약
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeStats {
    pub mode: LpmmMode,
    pub snapshot_version: u64,
    pub graph_nodes: usize,
    pub graph_edges: usize,
    pub embedder: String,
    pub extractor: String,
    #[serde(flatten)]
    pub store: StoreStats,
}

// ============================================================================
// KnowledgeBase
// ============================================================================

/// LPMM 지식베이스
pub struct KnowledgeBase {
    config: LpmmConfig,
    store: Arc<KnowledgeStore>,
    pipeline: IngestPipeline,
    retriever: HybridRetriever,
    embedder_name: String,
    extractor_name: String,
    snapshot: RwLock<Arc<KnowledgeSnapshot>>,
    version: AtomicU64,
}

impl KnowledgeBase {
    /// 설정의 프로바이더로 생성
    pub fn open(config: LpmmConfig) -> Result<Self> {
        config.validate()?;
        let embedder = create_embedder(&config.embedding, config.lpmm_knowledge.embedding_dimension)?;
        let extractor = create_extractor(&config.extraction)?;
        Self::load(config, embedder, extractor)
    }

    /// 지식베이스 로드
    ///
    /// 설정 검증 → 임베더 차원 확인 → 저장소 열기(저장된 차원 확인) → 첫 스냅샷.
    pub fn load(
        config: LpmmConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn InfoExtractor>,
    ) -> Result<Self> {
        config.validate()?;

        let kb = &config.lpmm_knowledge;
        if embedder.dimension() != kb.embedding_dimension {
            return Err(LpmmError::ConfigMismatch(format!(
                "embedding provider '{}' produces dimension {}, configured dimension is {}",
                embedder.name(),
                embedder.dimension(),
                kb.embedding_dimension
            )));
        }

        let store = Arc::new(KnowledgeStore::open(&config.storage.db_path(), kb.embedding_dimension)?);
        let snapshot = store.load_snapshot(1)?;

        let pipeline = IngestPipeline::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            Arc::clone(&extractor),
            paragraph_chunker(&config.chunking),
            PipelineSettings::from(kb),
        );

        tracing::info!(
            "Knowledge base loaded: mode={}, units={}, entities={}, edges={}",
            kb.lpmm_mode,
            snapshot.units().len(),
            snapshot.entities().len(),
            snapshot.graph().edge_count()
        );

        Ok(Self {
            retriever: HybridRetriever::new(kb.clone(), Arc::clone(&embedder)),
            embedder_name: embedder.name().to_string(),
            extractor_name: extractor.name().to_string(),
            config,
            store,
            pipeline,
            snapshot: RwLock::new(Arc::new(snapshot)),
            version: AtomicU64::new(1),
        })
    }

    pub fn mode(&self) -> LpmmMode {
        self.retriever.mode()
    }

    pub fn config(&self) -> &LpmmConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }

    /// 현재 스냅샷
    pub fn snapshot(&self) -> Result<Arc<KnowledgeSnapshot>> {
        let guard = self
            .snapshot
            .read()
            .map_err(|e| LpmmError::Lock(e.to_string()))?;
        Ok(Arc::clone(&guard))
    }

    // ------------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------------

    /// 검색 (최대 `qa_res_top_k`개 문단)
    pub async fn query(&self, text: &str) -> Result<Vec<RetrievedPassage>> {
        Ok(self.query_detailed(text).await?.passages)
    }

    /// 검색 + 추적 정보
    pub async fn query_detailed(&self, text: &str) -> Result<RetrievalOutcome> {
        let snapshot = self.snapshot()?;
        let outcome = self.retriever.retrieve(snapshot, text).await?;
        tracing::debug!(
            "Query returned {} passages in {:?}",
            outcome.passages.len(),
            outcome.trace.total_time
        );
        Ok(outcome)
    }

    // ------------------------------------------------------------------------
    // Write Operations
    // ------------------------------------------------------------------------

    /// 문서 가져오기 후 스냅샷 갱신
    ///
    /// 오류로 중단되어도 이미 커밋된 TextUnit이 보이도록 스냅샷은 갱신합니다.
    pub async fn import_corpus(&self, documents: &[SourceDocument], cancel: &CancellationToken) -> Result<ImportReport> {
        let result = self.pipeline.import_corpus(documents, cancel).await;
        self.refresh_snapshot().await?;
        result
    }

    /// 미완료 TextUnit/엔티티 재처리 후 스냅샷 갱신
    pub async fn repair(&self, cancel: &CancellationToken) -> Result<ImportReport> {
        let result = self.pipeline.repair(cancel).await;
        self.refresh_snapshot().await?;
        result
    }

    /// 문서 삭제 후 스냅샷 갱신
    pub async fn delete_corpus(&self, document_ids: &[String]) -> Result<DeleteReport> {
        let store = Arc::clone(&self.store);
        let ids = document_ids.to_vec();
        let report = tokio::task::spawn_blocking(move || store.delete_documents(&ids)).await??;
        if !report.missing.is_empty() {
            tracing::warn!("Documents not found: {:?}", report.missing);
        }
        self.refresh_snapshot().await?;
        Ok(report)
    }

    /// 저장소에서 스냅샷을 다시 읽어 게시
    ///
    /// 동시에 갱신이 일어나면 더 높은 버전만 남습니다.
    pub async fn refresh_snapshot(&self) -> Result<u64> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let store = Arc::clone(&self.store);
        let snapshot = tokio::task::spawn_blocking(move || store.load_snapshot(version)).await??;

        let mut current = self
            .snapshot
            .write()
            .map_err(|e| LpmmError::Lock(e.to_string()))?;
        if snapshot.version() > current.version() {
            tracing::debug!(
                "Published snapshot v{}: {} units, {} entities",
                version,
                snapshot.units().len(),
                snapshot.entities().len()
            );
            *current = Arc::new(snapshot);
        }
        Ok(current.version())
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> Result<KnowledgeStats> {
        let snapshot = self.snapshot()?;
        Ok(KnowledgeStats {
            mode: self.mode(),
            snapshot_version: snapshot.version(),
            graph_nodes: snapshot.graph().node_count(),
            graph_edges: snapshot.graph().edge_count(),
            embedder: self.embedder_name.clone(),
            extractor: self.extractor_name.clone(),
            store: self.store.stats()?,
        })
    }

    pub fn list_documents(&self, limit: usize) -> Result<Vec<DocumentRecord>> {
        self.store.list_documents(limit)
    }

    /// 온라인 백업
    pub fn backup(&self, target: &Path) -> Result<()> {
        self.store.backup_to(target)?;
        tracing::info!("Backed up knowledge base to {:?}", target);
        Ok(())
    }

    /// `[storage]` 설정 기준 백업 관리자
    pub fn backups(&self) -> BackupManager {
        BackupManager::from_config(&self.config.storage)
    }

    /// 백업 폴더에 새 백업 생성
    pub fn create_backup(&self) -> Result<BackupInfo> {
        self.backups().create(&self.store)
    }

    /// 백업 복원 후 새 스냅샷 게시
    pub async fn restore_backup(&self, id: &str) -> Result<BackupInfo> {
        let info = self.backups().restore(&self.store, id)?;
        self.refresh_snapshot().await?;
        Ok(info)
    }
}

// ============================================================================
// KnowledgeHandle
// ============================================================================

/// 활성 지식베이스 핸들
///
/// `reload`는 새 인스턴스를 완전히 만든 뒤 교체합니다. 이미 `get()`으로 받은
/// 인스턴스에서 진행 중인 검색은 이전 인스턴스로 끝까지 수행됩니다.
pub struct KnowledgeHandle {
    current: RwLock<Arc<KnowledgeBase>>,
}

impl KnowledgeHandle {
    pub fn new(base: KnowledgeBase) -> Self {
        Self {
            current: RwLock::new(Arc::new(base)),
        }
    }

    pub fn get(&self) -> Result<Arc<KnowledgeBase>> {
        let guard = self
            .current
            .read()
            .map_err(|e| LpmmError::Lock(e.to_string()))?;
        Ok(Arc::clone(&guard))
    }

    /// 새 설정으로 다시 로드 (실패하면 기존 인스턴스 유지)
    pub fn reload(&self, config: LpmmConfig) -> Result<Arc<KnowledgeBase>> {
        self.replace(KnowledgeBase::open(config)?)
    }

    /// 프로바이더를 직접 지정해 다시 로드
    pub fn reload_with(
        &self,
        config: LpmmConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn InfoExtractor>,
    ) -> Result<Arc<KnowledgeBase>> {
        self.replace(KnowledgeBase::load(config, embedder, extractor)?)
    }

    fn replace(&self, base: KnowledgeBase) -> Result<Arc<KnowledgeBase>> {
        let base = Arc::new(base);
        let mut current = self
            .current
            .write()
            .map_err(|e| LpmmError::Lock(e.to_string()))?;
        let previous = std::mem::replace(&mut *current, Arc::clone(&base));
        tracing::info!("Knowledge base reloaded: mode {} -> {}", previous.mode(), base.mode());
        Ok(base)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::testing::{
        failing_embedder, keyword_embedder, world_triples, KeywordEmbedder, ScriptedExtractor, VOCABULARY,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir, mode: LpmmMode) -> LpmmConfig {
        let mut config = LpmmConfig::default();
        config.lpmm_knowledge.lpmm_mode = mode;
        config.lpmm_knowledge.embedding_dimension = VOCABULARY.len();
        config.storage.data_dir = dir.path().to_path_buf();
        config
    }

    fn extractor() -> Arc<dyn InfoExtractor> {
        Arc::new(ScriptedExtractor::new(world_triples()))
    }

    fn load(dir: &TempDir, mode: LpmmMode) -> KnowledgeBase {
        KnowledgeBase::load(config(dir, mode), keyword_embedder(), extractor()).unwrap()
    }

    fn corpus() -> Vec<SourceDocument> {
        vec![
            SourceDocument::new("doc-a", "Paris is the capital of France"),
            SourceDocument::new("doc-b", "France is in Europe"),
        ]
    }

    fn contents(passages: &[RetrievedPassage]) -> Vec<&str> {
        passages.iter().map(|p| p.unit.content.as_str()).collect()
    }

    #[tokio::test]
    async fn test_agent_mode_end_to_end() {
        let dir = TempDir::new().unwrap();
        let kb = load(&dir, LpmmMode::Agent);

        let report = kb.import_corpus(&corpus(), &CancellationToken::new()).await.unwrap();
        assert!(report.is_complete());

        let passages = kb.query("What continent is Paris in?").await.unwrap();
        let found = contents(&passages);
        assert!(found.contains(&"Paris is the capital of France"));
        assert!(found.contains(&"France is in Europe"));
        assert!(passages.len() <= kb.config().lpmm_knowledge.qa_res_top_k);
    }

    #[tokio::test]
    async fn test_classic_mode_end_to_end() {
        let dir = TempDir::new().unwrap();
        let kb = load(&dir, LpmmMode::Classic);
        kb.import_corpus(&corpus(), &CancellationToken::new()).await.unwrap();

        let passages = kb.query("What continent is Paris in?").await.unwrap();
        assert_eq!(contents(&passages), vec!["Paris is the capital of France"]);
    }

    #[tokio::test]
    async fn test_empty_knowledge_base_returns_nothing() {
        let dir = TempDir::new().unwrap();
        let kb = load(&dir, LpmmMode::Agent);
        assert!(kb.query("Paris").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_publishes_new_snapshot() {
        let dir = TempDir::new().unwrap();
        let kb = load(&dir, LpmmMode::Agent);
        kb.import_corpus(&corpus(), &CancellationToken::new()).await.unwrap();

        let before = kb.snapshot().unwrap();
        let report = kb.delete_corpus(&["doc-a".to_string()]).await.unwrap();
        assert_eq!(report.documents, 1);

        // 이전 스냅샷을 잡고 있던 읽기는 영향받지 않음
        assert_eq!(before.units().len(), 2);
        let after = kb.snapshot().unwrap();
        assert!(after.version() > before.version());
        assert_eq!(after.units().len(), 1);
        assert!(after.entity_index("paris").is_none());

        let passages = kb.query("Paris capital").await.unwrap();
        assert!(!contents(&passages).contains(&"Paris is the capital of France"));
    }

    #[tokio::test]
    async fn test_reopen_keeps_knowledge() {
        let dir = TempDir::new().unwrap();
        {
            let kb = load(&dir, LpmmMode::Agent);
            kb.import_corpus(&corpus(), &CancellationToken::new()).await.unwrap();
        }

        let kb = load(&dir, LpmmMode::Agent);
        let stats = kb.stats().unwrap();
        assert_eq!(stats.store.unit_count, 2);
        assert_eq!(stats.graph_nodes, 3);
        assert_eq!(stats.graph_edges, 2);
        assert_eq!(stats.embedder, "keyword");
        assert_eq!(stats.extractor, "scripted");
    }

    #[test]
    fn test_embedder_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, LpmmMode::Agent);
        config.lpmm_knowledge.embedding_dimension = VOCABULARY.len() + 1;

        let err = KnowledgeBase::load(config, keyword_embedder(), extractor())
            .err()
            .unwrap();
        assert!(matches!(err, LpmmError::ConfigMismatch(_)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, LpmmMode::Agent);
        config.lpmm_knowledge.qa_res_top_k = 0;

        let err = KnowledgeBase::load(config, keyword_embedder(), extractor())
            .err()
            .unwrap();
        assert!(matches!(err, LpmmError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_query_embedding_failure() {
        let dir = TempDir::new().unwrap();
        let kb = KnowledgeBase::load(config(&dir, LpmmMode::Agent), failing_embedder(), extractor()).unwrap();

        let err = kb.query("Paris").await.unwrap_err();
        assert!(matches!(err, LpmmError::RetrievalUnavailable(_)));
    }

    #[tokio::test]
    async fn test_handle_reload_switches_mode() {
        let dir = TempDir::new().unwrap();
        let handle = KnowledgeHandle::new(load(&dir, LpmmMode::Classic));
        let old = handle.get().unwrap();
        old.import_corpus(&corpus(), &CancellationToken::new()).await.unwrap();

        let new = handle
            .reload_with(config(&dir, LpmmMode::Agent), keyword_embedder(), extractor())
            .unwrap();
        assert_eq!(new.mode(), LpmmMode::Agent);
        assert_eq!(handle.get().unwrap().mode(), LpmmMode::Agent);

        // 이전 인스턴스는 계속 classic으로 동작
        assert_eq!(old.mode(), LpmmMode::Classic);
        assert_eq!(old.query("What continent is Paris in?").await.unwrap().len(), 1);
        assert_eq!(new.query("What continent is Paris in?").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_query_keeps_snapshot_across_delete() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(KeywordEmbedder {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let kb = KnowledgeBase::load(config(&dir, LpmmMode::Agent), embedder, extractor()).unwrap();
        kb.import_corpus(&corpus(), &CancellationToken::new()).await.unwrap();

        // 질의는 첫 poll에서 스냅샷을 잡고 임베딩 지연 동안 삭제가 끝남
        let delete = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            kb.delete_corpus(&["doc-a".to_string()]).await
        };
        let (passages, deleted) = tokio::join!(kb.query("What continent is Paris in?"), delete);

        assert_eq!(deleted.unwrap().documents, 1);
        let passages = passages.unwrap();
        assert!(contents(&passages).contains(&"Paris is the capital of France"));

        let after = kb.query("What continent is Paris in?").await.unwrap();
        assert!(!contents(&after).contains(&"Paris is the capital of France"));
    }

    #[tokio::test]
    async fn test_queries_during_import_see_published_snapshots() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(KeywordEmbedder {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let kb = KnowledgeBase::load(config(&dir, LpmmMode::Agent), embedder, extractor()).unwrap();
        kb.import_corpus(&corpus(), &CancellationToken::new()).await.unwrap();
        let before = kb.snapshot().unwrap().version();

        let berlin = vec![SourceDocument::new("doc-c", "Berlin is the capital of Germany")];
        let cancel = CancellationToken::new();
        let import = kb.import_corpus(&berlin, &cancel);
        let reads = async {
            let mut seen = Vec::new();
            for _ in 0..5 {
                let snapshot = kb.snapshot().unwrap();
                assert!((0..snapshot.units().len()).all(|i| snapshot.is_complete(i)));
                let passages = kb.query("Berlin capital of Germany").await.unwrap();
                seen.push(
                    passages
                        .iter()
                        .map(|p| p.unit.document_id.clone())
                        .collect::<Vec<_>>(),
                );
            }
            seen
        };
        let (report, seen) = tokio::join!(import, reads);
        assert!(report.unwrap().is_complete());

        // 가져오기가 게시되기 전 질의는 새 문서를 보지 못함
        assert!(!seen[0].contains(&"doc-c".to_string()));
        assert!(kb.snapshot().unwrap().version() > before);

        let passages = kb.query("Berlin capital of Germany").await.unwrap();
        assert_eq!(passages[0].unit.document_id, "doc-c");
    }

    #[tokio::test]
    async fn test_backup_restore_publishes_snapshot() {
        let dir = TempDir::new().unwrap();
        let kb = load(&dir, LpmmMode::Agent);
        kb.import_corpus(&corpus(), &CancellationToken::new()).await.unwrap();

        let info = kb.create_backup().unwrap();
        assert!(info.path.starts_with(dir.path().join("backups")));
        assert_eq!(kb.backups().list().unwrap().len(), 1);

        kb.delete_corpus(&["doc-a".to_string()]).await.unwrap();
        let deleted = kb.snapshot().unwrap();
        assert_eq!(deleted.units().len(), 1);

        kb.restore_backup(&info.id).await.unwrap();
        let restored = kb.snapshot().unwrap();
        assert!(restored.version() > deleted.version());
        assert_eq!(restored.units().len(), 2);
        assert!(restored.entity_index("paris").is_some());

        let passages = kb.query("What continent is Paris in?").await.unwrap();
        assert!(contents(&passages).contains(&"Paris is the capital of France"));

        let err = kb.restore_backup("20000101_000000_000").await.unwrap_err();
        assert!(matches!(err, LpmmError::NotFound(_)));
    }

    #[test]
    fn test_failed_reload_keeps_current() {
        let dir = TempDir::new().unwrap();
        let handle = KnowledgeHandle::new(load(&dir, LpmmMode::Classic));

        let mut bad = config(&dir, LpmmMode::Agent);
        bad.lpmm_knowledge.qa_ppr_damping = 1.5;
        assert!(handle.reload_with(bad, keyword_embedder(), extractor()).is_err());
        assert_eq!(handle.get().unwrap().mode(), LpmmMode::Classic);
    }
}
