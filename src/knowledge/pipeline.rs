//! Ingestion Pipeline - 문서 → TextUnit → 임베딩 + 엔티티/관계
//!
//! 1. 문서를 청킹하고 저장소의 TextUnit 집합을 동기화
//! 2. 임베딩 풀과 추출 풀을 동시에 실행 (각각 동시 실행 수 제한)
//! 3. 임베딩이 없는 엔티티에 임베딩 계산
//!
//! TextUnit 단위 실패는 보고서에 기록하고 배치는 계속 진행합니다 (자동 재시도 없음).
//! 차원 불일치(ConfigMismatch)만 전체 실행을 중단합니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::KnowledgeConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{LpmmError, Result};
use crate::extraction::InfoExtractor;

use super::chunker::{split_document, Chunker};
use super::model::{Entity, SourceDocument, TextUnit};
use super::store::{DeleteReport, KnowledgeStore, PendingStage};

// ============================================================================
// Report Types
// ============================================================================

/// 실패한 작업 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureStage {
    Embedding,
    Extraction,
    EntityEmbedding,
}

/// 작업 단위 실패 기록
#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    /// TextUnit ID (EntityEmbedding이면 엔티티 ID)
    pub id: String,
    pub stage: FailureStage,
    pub error: String,
}

/// 가져오기/복구 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub documents: usize,
    pub units_total: usize,
    pub units_created: usize,
    pub units_unchanged: usize,
    pub units_removed: usize,
    pub embedded: usize,
    pub extracted: usize,
    pub entities_embedded: usize,
    /// 예약된 작업 수 (임베딩 + 추출 + 엔티티 임베딩)
    pub work_items: usize,
    pub failures: Vec<UnitFailure>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl ImportReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// 실패가 하나라도 있으면 PartialImportFailure
    pub fn ensure_complete(self) -> Result<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(LpmmError::PartialImportFailure {
                failed: self.failures.len(),
                total: self.work_items,
            })
        }
    }

    pub fn failures_in(&self, stage: FailureStage) -> impl Iterator<Item = &UnitFailure> + '_ {
        self.failures.iter().filter(move |f| f.stage == stage)
    }
}

/// 단계별 결과
#[derive(Debug, Default)]
struct StageResult {
    scheduled: usize,
    completed: usize,
    failures: Vec<UnitFailure>,
}

// ============================================================================
// IngestPipeline
// ============================================================================

/// 워커 풀 설정
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub max_embedding_workers: usize,
    pub embedding_chunk_size: usize,
    pub info_extraction_workers: usize,
}

impl From<&KnowledgeConfig> for PipelineSettings {
    fn from(config: &KnowledgeConfig) -> Self {
        Self {
            max_embedding_workers: config.max_embedding_workers.max(1),
            embedding_chunk_size: config.embedding_chunk_size.max(1),
            info_extraction_workers: config.info_extraction_workers.max(1),
        }
    }
}

/// 가져오기 파이프라인
pub struct IngestPipeline {
    store: Arc<KnowledgeStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    extractor: Arc<dyn InfoExtractor>,
    chunker: Box<dyn Chunker>,
    settings: PipelineSettings,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<KnowledgeStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn InfoExtractor>,
        chunker: Box<dyn Chunker>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            extractor,
            chunker,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }

    /// 문서 묶음 가져오기
    ///
    /// 같은 문서를 다시 가져오면 바뀌지 않은 TextUnit은 다시 계산하지 않습니다.
    pub async fn import_corpus(&self, documents: &[SourceDocument], cancel: &CancellationToken) -> Result<ImportReport> {
        let started = Instant::now();
        let mut report = ImportReport::default();
        let mut document_ids = Vec::with_capacity(documents.len());

        for doc in documents {
            let units = split_document(doc, self.chunker.as_ref());
            if units.is_empty() {
                tracing::warn!("No text units generated for document: {}", doc.id);
            }
            let sync = self.store.sync_document_units(doc, &units)?;

            report.documents += 1;
            report.units_total += units.len();
            report.units_created += sync.created;
            report.units_unchanged += sync.unchanged;
            report.units_removed += sync.removed;
            document_ids.push(doc.id.clone());
        }

        tracing::info!(
            "Importing {} documents: {} units ({} new, {} unchanged, {} removed)",
            report.documents,
            report.units_total,
            report.units_created,
            report.units_unchanged,
            report.units_removed
        );

        let pending_embedding = self
            .store
            .pending_units(PendingStage::Embedding, Some(document_ids.as_slice()))?;
        let pending_extraction = self
            .store
            .pending_units(PendingStage::Extraction, Some(document_ids.as_slice()))?;

        self.process(pending_embedding, pending_extraction, cancel, &mut report)
            .await?;

        report.elapsed = started.elapsed();
        log_report("Import", &report);
        Ok(report)
    }

    /// 산출물이 빠진 모든 TextUnit과 엔티티를 다시 처리
    pub async fn repair(&self, cancel: &CancellationToken) -> Result<ImportReport> {
        let started = Instant::now();
        let mut report = ImportReport::default();

        let pending_embedding = self.store.pending_units(PendingStage::Embedding, None)?;
        let pending_extraction = self.store.pending_units(PendingStage::Extraction, None)?;
        tracing::info!(
            "Repairing {} units missing embeddings, {} units missing extraction",
            pending_embedding.len(),
            pending_extraction.len()
        );

        self.process(pending_embedding, pending_extraction, cancel, &mut report)
            .await?;

        report.elapsed = started.elapsed();
        log_report("Repair", &report);
        Ok(report)
    }

    /// 문서 삭제 (cascade + 고아 엔티티 정리)
    pub fn delete_corpus(&self, document_ids: &[String]) -> Result<DeleteReport> {
        let report = self.store.delete_documents(document_ids)?;
        if !report.missing.is_empty() {
            tracing::warn!("Documents not found: {:?}", report.missing);
        }
        Ok(report)
    }

    /// 임베딩/추출 동시 실행 후 엔티티 임베딩
    async fn process(
        &self,
        pending_embedding: Vec<TextUnit>,
        pending_extraction: Vec<TextUnit>,
        cancel: &CancellationToken,
        report: &mut ImportReport,
    ) -> Result<()> {
        let (embedding, extraction) = tokio::join!(
            self.embed_units(pending_embedding, cancel),
            self.extract_units(pending_extraction, cancel)
        );
        let embedding = embedding?;
        let extraction = extraction?;

        report.embedded += embedding.completed;
        report.extracted += extraction.completed;
        report.work_items += embedding.scheduled + extraction.scheduled;
        report.failures.extend(embedding.failures);
        report.failures.extend(extraction.failures);

        if cancel.is_cancelled() {
            tracing::warn!("Import cancelled; committed units are kept");
            report.cancelled = true;
            return Ok(());
        }

        let entities = self.embed_entities(cancel).await?;
        report.entities_embedded += entities.completed;
        report.work_items += entities.scheduled;
        report.failures.extend(entities.failures);
        report.cancelled = cancel.is_cancelled();

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------------

    /// 임베딩 풀: `embedding_chunk_size` 묶음을 최대 `max_embedding_workers`개 동시 요청
    async fn embed_units(&self, units: Vec<TextUnit>, cancel: &CancellationToken) -> Result<StageResult> {
        let mut result = StageResult {
            scheduled: units.len(),
            ..Default::default()
        };
        if units.is_empty() {
            return Ok(result);
        }

        let batches: Vec<Vec<TextUnit>> = units
            .chunks(self.settings.embedding_chunk_size)
            .map(<[TextUnit]>::to_vec)
            .collect();

        let mut responses = stream::iter(batches)
            .map(|batch| {
                let embedder = Arc::clone(&self.embedder);
                async move {
                    let texts: Vec<String> = batch.iter().map(|u| u.content.clone()).collect();
                    let vectors = embedder.embed_batch(&texts).await;
                    (batch, vectors)
                }
            })
            .buffer_unordered(self.settings.max_embedding_workers)
            .take_until(Box::pin(cancel.cancelled()));

        while let Some((batch, vectors)) = responses.next().await {
            let vectors = match vectors {
                Ok(v) if v.len() == batch.len() => v,
                Ok(v) => {
                    let error = format!("provider returned {} vectors for {} texts", v.len(), batch.len());
                    record_batch_failure(&mut result, &batch, FailureStage::Embedding, &error);
                    continue;
                }
                Err(e) => {
                    record_batch_failure(&mut result, &batch, FailureStage::Embedding, &e.to_string());
                    continue;
                }
            };

            for (unit, vector) in batch.iter().zip(vectors.iter()) {
                match self.store.commit_unit_embedding(&unit.id, vector) {
                    Ok(()) => result.completed += 1,
                    Err(e @ LpmmError::ConfigMismatch(_)) => return Err(e),
                    Err(LpmmError::NotFound(_)) => {
                        tracing::debug!("Unit {} was removed before its embedding committed", unit.id);
                    }
                    Err(e) => result.failures.push(UnitFailure {
                        id: unit.id.clone(),
                        stage: FailureStage::Embedding,
                        error: e.to_string(),
                    }),
                }
            }
        }

        Ok(result)
    }

    /// 추출 풀: 최대 `info_extraction_workers`개 TextUnit 동시 처리
    async fn extract_units(&self, units: Vec<TextUnit>, cancel: &CancellationToken) -> Result<StageResult> {
        let mut result = StageResult {
            scheduled: units.len(),
            ..Default::default()
        };
        if units.is_empty() {
            return Ok(result);
        }

        let mut responses = stream::iter(units)
            .map(|unit| {
                let extractor = Arc::clone(&self.extractor);
                async move {
                    let extraction = extractor.extract(&unit.content).await;
                    (unit, extraction)
                }
            })
            .buffer_unordered(self.settings.info_extraction_workers)
            .take_until(Box::pin(cancel.cancelled()));

        while let Some((unit, extraction)) = responses.next().await {
            let outcome = extraction.and_then(|ex| self.store.commit_unit_extraction(&unit.id, &ex));
            match outcome {
                Ok(commit) => {
                    result.completed += 1;
                    tracing::trace!(
                        "Unit {}: {} new entities, {} relations",
                        unit.id,
                        commit.entities_created,
                        commit.relations
                    );
                }
                Err(LpmmError::NotFound(_)) => {
                    tracing::debug!("Unit {} was removed before its extraction committed", unit.id);
                }
                Err(e) => result.failures.push(UnitFailure {
                    id: unit.id.clone(),
                    stage: FailureStage::Extraction,
                    error: e.to_string(),
                }),
            }
        }

        Ok(result)
    }

    /// 임베딩이 없는 엔티티 처리 (표시 이름을 임베딩)
    async fn embed_entities(&self, cancel: &CancellationToken) -> Result<StageResult> {
        let entities = self.store.entities_missing_embedding()?;
        let mut result = StageResult {
            scheduled: entities.len(),
            ..Default::default()
        };
        if entities.is_empty() {
            return Ok(result);
        }
        tracing::debug!("Embedding {} entities", entities.len());

        let batches: Vec<Vec<Entity>> = entities
            .chunks(self.settings.embedding_chunk_size)
            .map(<[Entity]>::to_vec)
            .collect();

        let mut responses = stream::iter(batches)
            .map(|batch| {
                let embedder = Arc::clone(&self.embedder);
                async move {
                    let names: Vec<String> = batch.iter().map(|e| e.name.clone()).collect();
                    let vectors = embedder.embed_batch(&names).await;
                    (batch, vectors)
                }
            })
            .buffer_unordered(self.settings.max_embedding_workers)
            .take_until(Box::pin(cancel.cancelled()));

        while let Some((batch, vectors)) = responses.next().await {
            let vectors = match vectors {
                Ok(v) if v.len() == batch.len() => v,
                Ok(v) => {
                    let error = format!("provider returned {} vectors for {} names", v.len(), batch.len());
                    for entity in &batch {
                        result.failures.push(entity_failure(entity, &error));
                    }
                    continue;
                }
                Err(e) => {
                    let error = e.to_string();
                    for entity in &batch {
                        result.failures.push(entity_failure(entity, &error));
                    }
                    continue;
                }
            };

            for (entity, vector) in batch.iter().zip(vectors.iter()) {
                match self.store.commit_entity_embedding(&entity.id, vector) {
                    Ok(()) => result.completed += 1,
                    Err(e @ LpmmError::ConfigMismatch(_)) => return Err(e),
                    Err(LpmmError::NotFound(_)) => {}
                    Err(e) => result.failures.push(entity_failure(entity, &e.to_string())),
                }
            }
        }

        Ok(result)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn record_batch_failure(result: &mut StageResult, batch: &[TextUnit], stage: FailureStage, error: &str) {
    tracing::warn!("{:?} failed for {} units: {}", stage, batch.len(), error);
    result.failures.extend(batch.iter().map(|unit| UnitFailure {
        id: unit.id.clone(),
        stage,
        error: error.to_string(),
    }));
}

fn entity_failure(entity: &Entity, error: &str) -> UnitFailure {
    UnitFailure {
        id: entity.id.clone(),
        stage: FailureStage::EntityEmbedding,
        error: error.to_string(),
    }
}

fn log_report(label: &str, report: &ImportReport) {
    tracing::info!(
        "{} finished in {:?}: {} embedded, {} extracted, {} entities embedded, {} failures{}",
        label,
        report.elapsed,
        report.embedded,
        report.extracted,
        report.entities_embedded,
        report.failures.len(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::knowledge::chunker::ParagraphChunker;
    use crate::knowledge::testing::{world_triples, KeywordEmbedder, ScriptedExtractor, VOCABULARY};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        pipeline: IngestPipeline,
        embedder: Arc<KeywordEmbedder>,
        extractor: Arc<ScriptedExtractor>,
    }

    fn fixture(embedder: KeywordEmbedder, extractor: ScriptedExtractor) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KnowledgeStore::open(&dir.path().join("kb.db"), VOCABULARY.len()).unwrap());
        let embedder = Arc::new(embedder);
        let extractor = Arc::new(extractor);
        let pipeline = IngestPipeline::new(
            store,
            embedder.clone(),
            extractor.clone(),
            Box::new(ParagraphChunker::with_defaults()),
            PipelineSettings::from(&KnowledgeConfig::default()),
        );
        Fixture {
            _dir: dir,
            pipeline,
            embedder,
            extractor,
        }
    }

    fn corpus() -> Vec<SourceDocument> {
        vec![
            SourceDocument::new("doc-a", "Paris is the capital of France"),
            SourceDocument::new("doc-b", "France is in Europe"),
            SourceDocument::new("doc-c", "Berlin is the capital of Germany"),
        ]
    }

    #[tokio::test]
    async fn test_import_commits_all_artifacts() {
        let f = fixture(KeywordEmbedder::default(), ScriptedExtractor::new(world_triples()));
        let report = f
            .pipeline
            .import_corpus(&corpus(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.units_created, 3);
        assert_eq!(report.embedded, 3);
        assert_eq!(report.extracted, 3);
        // paris, france, europe, berlin, germany
        assert_eq!(report.entities_embedded, 5);

        let stats = f.pipeline.store().stats().unwrap();
        assert_eq!(stats.complete_units, 3);
        assert_eq!(stats.relation_count, 3);
        assert_eq!(stats.embedded_entities, 5);
    }

    #[tokio::test]
    async fn test_reimport_is_idempotent() {
        let f = fixture(KeywordEmbedder::default(), ScriptedExtractor::new(world_triples()));
        let cancel = CancellationToken::new();
        f.pipeline.import_corpus(&corpus(), &cancel).await.unwrap();
        let before = f.pipeline.store().stats().unwrap();
        let embed_calls = f.embedder.calls.load(Ordering::SeqCst);
        let extract_calls = f.extractor.calls.load(Ordering::SeqCst);

        let report = f.pipeline.import_corpus(&corpus(), &cancel).await.unwrap();
        let after = f.pipeline.store().stats().unwrap();

        assert_eq!(report.units_created, 0);
        assert_eq!(report.units_unchanged, 3);
        assert_eq!(report.work_items, 0);
        assert_eq!(before.unit_count, after.unit_count);
        assert_eq!(before.entity_count, after.entity_count);
        assert_eq!(before.relation_count, after.relation_count);
        assert_eq!(f.embedder.calls.load(Ordering::SeqCst), embed_calls);
        assert_eq!(f.extractor.calls.load(Ordering::SeqCst), extract_calls);
    }

    #[tokio::test]
    async fn test_changed_document_replaces_units() {
        let f = fixture(KeywordEmbedder::default(), ScriptedExtractor::new(world_triples()));
        let cancel = CancellationToken::new();
        f.pipeline.import_corpus(&corpus(), &cancel).await.unwrap();

        let changed = vec![SourceDocument::new("doc-c", "Germany is in Europe")];
        let report = f.pipeline.import_corpus(&changed, &cancel).await.unwrap();
        assert_eq!(report.units_created, 1);
        assert_eq!(report.units_removed, 1);

        let stats = f.pipeline.store().stats().unwrap();
        assert_eq!(stats.unit_count, 3);
        // berlin은 더 이상 언급되지 않음
        assert_eq!(stats.entity_count, 4);
        assert!(f.pipeline.store().neighbors("berlin").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_then_repair() {
        let extractor = ScriptedExtractor {
            fail_on: Some("Berlin".to_string()),
            ..ScriptedExtractor::new(world_triples())
        };
        let f = fixture(KeywordEmbedder::default(), extractor);
        let cancel = CancellationToken::new();

        let report = f.pipeline.import_corpus(&corpus(), &cancel).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures_in(FailureStage::Extraction).count(), 1);
        assert_eq!(report.embedded, 3);
        assert_eq!(report.extracted, 2);

        let err = report.clone().ensure_complete().unwrap_err();
        assert!(matches!(err, LpmmError::PartialImportFailure { failed: 1, .. }));

        let stats = f.pipeline.store().stats().unwrap();
        assert_eq!(stats.complete_units, 2);

        // 실패한 TextUnit만 다시 처리 (여전히 실패)
        let calls = f.extractor.calls.load(Ordering::SeqCst);
        let repaired = f.pipeline.repair(&cancel).await.unwrap();
        assert_eq!(repaired.work_items, 1);
        assert_eq!(repaired.failures.len(), 1);
        assert_eq!(f.extractor.calls.load(Ordering::SeqCst), calls + 1);
    }

    #[tokio::test]
    async fn test_repair_completes_after_provider_recovers() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KnowledgeStore::open(&dir.path().join("kb.db"), VOCABULARY.len()).unwrap());
        let settings = PipelineSettings::from(&KnowledgeConfig::default());
        let cancel = CancellationToken::new();

        let broken = IngestPipeline::new(
            store.clone(),
            Arc::new(KeywordEmbedder {
                fail_on: Some("Europe".to_string()),
                ..Default::default()
            }),
            Arc::new(ScriptedExtractor::new(world_triples())),
            Box::new(ParagraphChunker::with_defaults()),
            settings,
        );
        let report = broken.import_corpus(&corpus()[..2], &cancel).await.unwrap();
        assert!(!report.is_complete());
        assert!(report.failures_in(FailureStage::Embedding).count() >= 1);

        let healthy = IngestPipeline::new(
            store.clone(),
            Arc::new(KeywordEmbedder::default()),
            Arc::new(ScriptedExtractor::new(world_triples())),
            Box::new(ParagraphChunker::with_defaults()),
            settings,
        );
        let repaired = healthy.repair(&cancel).await.unwrap();
        assert!(repaired.is_complete());

        let stats = store.stats().unwrap();
        assert_eq!(stats.complete_units, 2);
        assert_eq!(stats.embedded_entities, stats.entity_count);
    }

    #[tokio::test]
    async fn test_cancelled_import_keeps_nothing_half_done() {
        let embedder = KeywordEmbedder {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let f = fixture(embedder, ScriptedExtractor::new(world_triples()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = f.pipeline.import_corpus(&corpus(), &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.embedded, 0);
        assert_eq!(report.entities_embedded, 0);

        // 취소 후 복구하면 남은 작업이 모두 끝남
        let repaired = f.pipeline.repair(&CancellationToken::new()).await.unwrap();
        assert!(repaired.is_complete());
        assert_eq!(f.pipeline.store().stats().unwrap().complete_units, 3);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_aborts() {
        struct WrongDimension;

        #[async_trait::async_trait]
        impl EmbeddingProvider for WrongDimension {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
                Ok(vec![1.0; 3])
            }
            fn dimension(&self) -> usize {
                VOCABULARY.len()
            }
            fn name(&self) -> &str {
                "wrong"
            }
        }

        let dir = TempDir::new().unwrap();
        let store = Arc::new(KnowledgeStore::open(&dir.path().join("kb.db"), VOCABULARY.len()).unwrap());
        let pipeline = IngestPipeline::new(
            store.clone(),
            Arc::new(WrongDimension),
            Arc::new(ScriptedExtractor::new(world_triples())),
            Box::new(ParagraphChunker::with_defaults()),
            PipelineSettings::from(&KnowledgeConfig::default()),
        );

        let err = pipeline
            .import_corpus(&corpus(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LpmmError::ConfigMismatch(_)));
        assert_eq!(store.stats().unwrap().embedded_units, 0);
    }

    #[tokio::test]
    async fn test_delete_corpus() {
        let f = fixture(KeywordEmbedder::default(), ScriptedExtractor::new(world_triples()));
        f.pipeline
            .import_corpus(&corpus(), &CancellationToken::new())
            .await
            .unwrap();

        let report = f.pipeline.delete_corpus(&["doc-c".to_string()]).unwrap();
        assert_eq!(report.documents, 1);
        assert_eq!(report.entities, 2); // berlin, germany

        let stats = f.pipeline.store().stats().unwrap();
        assert_eq!(stats.document_count, 2);
        assert_eq!(stats.entity_count, 3);
    }
}
