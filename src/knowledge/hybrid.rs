//! 하이브리드 검색 - 벡터 유사도 + 지식 그래프(PPR) 통합
//!
//! - classic: 쿼리 임베딩 → 문단 벡터 검색
//! - agent: 쿼리 임베딩 → 관계/엔티티 시드 → Personalized PageRank →
//!   문단 그래프 점수와 벡터 점수를 가중 합산
//!
//! 최종 점수 = w · vector + (1 - w) · graph  (w = qa_paragraph_node_weight)
//!
//! 그래프 신호가 없으면(PPR 비활성, 빈 그래프, 시드 없음) 벡터 점수만 사용합니다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{KnowledgeConfig, LpmmMode};
use crate::embedding::EmbeddingProvider;
use crate::error::{LpmmError, Result};

use super::model::TextUnit;
use super::ppr::{personalized_pagerank, PprParams};
use super::snapshot::KnowledgeSnapshot;
use super::vector::{VectorHit, VectorScope};

// ============================================================================
// Types
// ============================================================================

/// 검색된 문단
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedPassage {
    pub unit: TextUnit,
    /// 최종 점수 (높을수록 관련도 높음)
    pub score: f32,
    /// 문단 벡터 유사도 (문단 검색에 포함된 경우)
    pub vector_score: Option<f32>,
    /// 정규화된 그래프 점수 (0.0 ~ 1.0)
    pub graph_score: Option<f32>,
}

/// 그래프 신호를 쓰지 못한 이유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GraphSkip {
    /// enable_ppr = false
    Disabled,
    /// 관계 엣지가 하나도 없음
    EmptyGraph,
    /// 관계/엔티티 시드가 없음
    NoSeeds,
}

/// 검색 과정 기록 (로그/테스트용)
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalTrace {
    pub mode: Option<LpmmMode>,
    pub relation_seeds: usize,
    pub entity_seeds: usize,
    /// 시드 엔티티 ID (중복 제거)
    pub seed_entities: Vec<String>,
    pub graph_used: bool,
    pub graph_skipped: Option<GraphSkip>,
    pub ppr_iterations: usize,
    pub ppr_converged: bool,
    pub ppr_timed_out: bool,
    pub paragraph_hits: usize,
    pub candidates: usize,
    pub embed_time: Duration,
    pub graph_time: Duration,
    pub total_time: Duration,
}

/// 검색 결과 + 기록
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalOutcome {
    pub passages: Vec<RetrievedPassage>,
    pub trace: RetrievalTrace,
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// 하이브리드 검색기
///
/// 모드와 파라미터는 생성 시점에 고정됩니다.
pub struct HybridRetriever {
    config: KnowledgeConfig,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl HybridRetriever {
    pub fn new(config: KnowledgeConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { config, embedder }
    }

    pub fn mode(&self) -> LpmmMode {
        self.config.lpmm_mode
    }

    pub fn config(&self) -> &KnowledgeConfig {
        &self.config
    }

    /// 설정된 모드로 검색
    pub async fn retrieve(&self, snapshot: Arc<KnowledgeSnapshot>, query: &str) -> Result<RetrievalOutcome> {
        match self.config.lpmm_mode {
            LpmmMode::Classic => self.retrieve_classic(&snapshot, query).await,
            LpmmMode::Agent => self.retrieve_agent(snapshot, query).await,
        }
    }

    /// 쿼리 임베딩. 실패하면 RetrievalUnavailable (폴백 없음)
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embedder
            .embed(query)
            .await
            .map_err(|e| LpmmError::RetrievalUnavailable(format!("query embedding failed: {}", e)))
    }

    /// classic 모드: 임베딩된 모든 문단 대상 벡터 검색
    pub async fn retrieve_classic(&self, snapshot: &KnowledgeSnapshot, query: &str) -> Result<RetrievalOutcome> {
        let started = Instant::now();
        let mut trace = RetrievalTrace {
            mode: Some(LpmmMode::Classic),
            ..Default::default()
        };

        let query_vec = self.embed_query(query).await?;
        trace.embed_time = started.elapsed();

        let hits = snapshot.vector_search(
            &query_vec,
            self.config.qa_paragraph_search_top_k,
            VectorScope::Paragraphs,
        )?;
        trace.paragraph_hits = hits.len();

        let candidates: Vec<Candidate> = hits
            .iter()
            .map(|hit| Candidate {
                unit: hit.index,
                score: hit.similarity,
                vector: Some(hit.similarity),
                graph: None,
            })
            .collect();
        trace.candidates = candidates.len();

        let passages = rank(snapshot, candidates, self.config.qa_res_top_k);
        trace.total_time = started.elapsed();

        tracing::debug!(
            "Classic retrieval: {} hits → {} passages in {:?}",
            trace.paragraph_hits,
            passages.len(),
            trace.total_time
        );
        Ok(RetrievalOutcome { passages, trace })
    }

    /// agent 모드: 벡터 + 그래프 통합
    pub async fn retrieve_agent(&self, snapshot: Arc<KnowledgeSnapshot>, query: &str) -> Result<RetrievalOutcome> {
        let started = Instant::now();
        let mut trace = RetrievalTrace {
            mode: Some(LpmmMode::Agent),
            ..Default::default()
        };

        // 1. 쿼리 임베딩
        let query_vec = self.embed_query(query).await?;
        trace.embed_time = started.elapsed();

        // 2-3. 시드 엔티티
        let relation_hits = relation_seeds(
            &snapshot,
            &query_vec,
            self.config.qa_relation_search_top_k,
            self.config.qa_relation_threshold,
        )?;
        let entity_hits = entity_filter(&snapshot, &query_vec, self.config.qa_ent_filter_top_k)?;
        trace.relation_seeds = relation_hits.len();
        trace.entity_seeds = entity_hits.len();

        let mut seeds: Vec<usize> = relation_hits
            .iter()
            .chain(entity_hits.iter())
            .map(|hit| hit.index)
            .collect();
        seeds.sort_unstable();
        seeds.dedup();
        trace.seed_entities = seeds
            .iter()
            .filter_map(|&i| snapshot.entity(i).map(|e| e.id.clone()))
            .collect();

        // 4. PPR → 문단 그래프 점수
        let graph_started = Instant::now();
        let skip = if !self.config.enable_ppr {
            Some(GraphSkip::Disabled)
        } else if snapshot.graph().is_empty() {
            Some(GraphSkip::EmptyGraph)
        } else if seeds.is_empty() {
            Some(GraphSkip::NoSeeds)
        } else {
            None
        };

        let graph_scores = match skip {
            Some(reason) => {
                tracing::info!("Graph signal unavailable ({:?}), using vector similarity only", reason);
                trace.graph_skipped = Some(reason);
                HashMap::new()
            }
            None => {
                let params = PprParams {
                    damping: f64::from(self.config.qa_ppr_damping),
                    max_iterations: self.config.qa_ppr_max_iterations,
                    tolerance: self.config.qa_ppr_tolerance,
                    deadline: self
                        .config
                        .qa_ppr_timeout_ms
                        .map(|ms| Instant::now() + Duration::from_millis(ms)),
                };

                let ppr_snapshot = Arc::clone(&snapshot);
                let ppr_seeds = seeds.clone();
                let (result, unit_scores) = tokio::task::spawn_blocking(move || {
                    let result = personalized_pagerank(ppr_snapshot.graph(), &ppr_seeds, &params);
                    let unit_scores = unit_graph_scores(&ppr_snapshot, &result.scores);
                    (result, unit_scores)
                })
                .await?;

                if result.timed_out {
                    tracing::warn!(
                        "PPR deadline reached after {} iterations (residual {:.2e}), using partial scores",
                        result.iterations,
                        result.residual
                    );
                }
                trace.graph_used = !unit_scores.is_empty();
                trace.ppr_iterations = result.iterations;
                trace.ppr_converged = result.converged;
                trace.ppr_timed_out = result.timed_out;
                unit_scores
            }
        };
        trace.graph_time = graph_started.elapsed();

        // 5. 완료된 문단 대상 벡터 검색
        let paragraph_hits = snapshot.vector_search(
            &query_vec,
            self.config.qa_paragraph_search_top_k,
            VectorScope::CompleteParagraphs,
        )?;
        trace.paragraph_hits = paragraph_hits.len();

        // 6. 점수 통합
        let candidates = fuse(
            &paragraph_hits,
            &graph_scores,
            self.config.qa_paragraph_node_weight,
        );
        trace.candidates = candidates.len();

        // 7. 정렬 + 자르기
        let passages = rank(&snapshot, candidates, self.config.qa_res_top_k);
        trace.total_time = started.elapsed();

        tracing::debug!(
            "Agent retrieval: {} relation seeds, {} entity seeds, graph_used={}, {} passages in {:?}",
            trace.relation_seeds,
            trace.entity_seeds,
            trace.graph_used,
            passages.len(),
            trace.total_time
        );
        Ok(RetrievalOutcome { passages, trace })
    }
}

// ============================================================================
// Seed Selection
// ============================================================================

/// 관계 시드: 엣지가 있는 엔티티 중 top-k, 유사도 ≥ threshold
///
/// threshold를 올리면 결과는 항상 부분집합이 됩니다.
pub fn relation_seeds(
    snapshot: &KnowledgeSnapshot,
    query: &[f32],
    top_k: usize,
    threshold: f32,
) -> Result<Vec<VectorHit>> {
    let hits = snapshot.vector_search(query, top_k, VectorScope::RelatedEntities)?;
    Ok(hits.into_iter().filter(|h| h.similarity >= threshold).collect())
}

/// 엔티티 필터: 모든 엔티티 중 top-k, 양의 유사도만
pub fn entity_filter(snapshot: &KnowledgeSnapshot, query: &[f32], top_k: usize) -> Result<Vec<VectorHit>> {
    let hits = snapshot.vector_search(query, top_k, VectorScope::Entities)?;
    Ok(hits.into_iter().filter(|h| h.similarity > 0.0).collect())
}

// ============================================================================
// Scoring
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Candidate {
    unit: usize,
    score: f32,
    vector: Option<f32>,
    graph: Option<f32>,
}

/// 문단 그래프 점수 = 언급된 엔티티 PPR 점수 합 / 최대값
///
/// 완료된 문단만 대상이며 점수가 0인 문단은 포함하지 않습니다.
fn unit_graph_scores(snapshot: &KnowledgeSnapshot, entity_scores: &[f64]) -> HashMap<usize, f32> {
    let mut raw: HashMap<usize, f64> = HashMap::new();
    for unit in 0..snapshot.units().len() {
        if !snapshot.is_complete(unit) {
            continue;
        }
        let total: f64 = snapshot
            .entities_in_unit(unit)
            .iter()
            .filter_map(|&e| entity_scores.get(e))
            .sum();
        if total > 0.0 {
            raw.insert(unit, total);
        }
    }

    let max = raw.values().copied().fold(0.0f64, f64::max);
    if max <= 0.0 {
        return HashMap::new();
    }
    raw.into_iter()
        .map(|(unit, score)| (unit, (score / max) as f32))
        .collect()
}

/// 벡터/그래프 점수 통합
fn fuse(paragraph_hits: &[VectorHit], graph_scores: &HashMap<usize, f32>, weight: f32) -> Vec<Candidate> {
    if graph_scores.is_empty() {
        return paragraph_hits
            .iter()
            .map(|hit| Candidate {
                unit: hit.index,
                score: hit.similarity,
                vector: Some(hit.similarity),
                graph: None,
            })
            .collect();
    }

    let mut merged: HashMap<usize, (Option<f32>, Option<f32>)> = HashMap::new();
    for hit in paragraph_hits {
        merged.entry(hit.index).or_default().0 = Some(hit.similarity);
    }
    for (&unit, &score) in graph_scores {
        merged.entry(unit).or_default().1 = Some(score);
    }

    merged
        .into_iter()
        .map(|(unit, (vector, graph))| Candidate {
            unit,
            score: weight * vector.unwrap_or(0.0) + (1.0 - weight) * graph.unwrap_or(0.0),
            vector,
            graph,
        })
        .collect()
}

/// 양수 점수만 남기고 내림차순 정렬 (동점은 삽입 순서), top-k
fn rank(snapshot: &KnowledgeSnapshot, mut candidates: Vec<Candidate>, top_k: usize) -> Vec<RetrievedPassage> {
    candidates.retain(|c| c.score > 0.0);
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.unit.cmp(&b.unit)));
    candidates.truncate(top_k);

    candidates
        .into_iter()
        .filter_map(|c| {
            snapshot.unit(c.unit).map(|unit| RetrievedPassage {
                unit: unit.clone(),
                score: c.score,
                vector_score: c.vector,
                graph_score: c.graph,
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
