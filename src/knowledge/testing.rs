//! 테스트용 오라클과 고정 데이터

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::{LpmmError, Result};
use crate::extraction::{Extraction, InfoExtractor, Triple};

use super::model::{Entity, RelationEdge, TextUnit};
use super::snapshot::{KnowledgeSnapshot, SnapshotData, StoredUnit};

/// 키워드 임베더 어휘 (차원 = 어휘 수)
pub const VOCABULARY: &[&str] = &["paris", "france", "europe", "capital", "continent", "berlin", "germany"];

// ============================================================================
// Embedders
// ============================================================================

/// 어휘 단어 출현 횟수를 차원별로 세는 임베더
#[derive(Debug, Default)]
pub struct KeywordEmbedder {
    pub calls: AtomicUsize,
    /// 이 문자열을 포함한 텍스트는 실패
    pub fail_on: Option<String>,
    pub delay: Option<Duration>,
}

impl KeywordEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; VOCABULARY.len()];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
        {
            if let Some(i) = VOCABULARY.iter().position(|w| *w == token) {
                vector[i] += 1.0;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(marker) = &self.fail_on {
            if text.contains(marker.as_str()) {
                return Err(LpmmError::unavailable("keyword", "scripted failure"));
            }
        }
        Ok(Self::vector(text))
    }

    fn dimension(&self) -> usize {
        VOCABULARY.len()
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

pub fn keyword_embedder() -> Arc<dyn EmbeddingProvider> {
    Arc::new(KeywordEmbedder::default())
}

/// 항상 실패하는 임베더
pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(LpmmError::unavailable("failing", "connection refused"))
    }

    fn dimension(&self) -> usize {
        VOCABULARY.len()
    }

    fn name(&self) -> &str {
        "failing"
    }
}

pub fn failing_embedder() -> Arc<dyn EmbeddingProvider> {
    Arc::new(FailingEmbedder)
}

// ============================================================================
// Extractor
// ============================================================================

/// 고정 트리플 중 양 끝이 모두 텍스트에 나오는 것만 돌려주는 추출기
#[derive(Debug, Default)]
pub struct ScriptedExtractor {
    pub triples: Vec<Triple>,
    pub calls: AtomicUsize,
    pub fail_on: Option<String>,
}

impl ScriptedExtractor {
    pub fn new(triples: Vec<Triple>) -> Self {
        Self {
            triples,
            ..Default::default()
        }
    }
}

#[async_trait]
impl InfoExtractor for ScriptedExtractor {
    async fn extract(&self, text: &str) -> Result<Extraction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_on {
            if text.contains(marker.as_str()) {
                return Err(LpmmError::response("scripted", "malformed output"));
            }
        }

        let lower = text.to_lowercase();
        let triples: Vec<Triple> = self
            .triples
            .iter()
            .filter(|t| lower.contains(&t.subject.to_lowercase()) && lower.contains(&t.object.to_lowercase()))
            .cloned()
            .collect();
        Ok(Extraction {
            entities: Vec::new(),
            triples,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn world_triples() -> Vec<Triple> {
    vec![
        Triple::new("Paris", "capital_of", "France"),
        Triple::new("France", "located_in", "Europe"),
        Triple::new("Berlin", "capital_of", "Germany"),
        Triple::new("Germany", "located_in", "Europe"),
    ]
}

// ============================================================================
// Fixtures
// ============================================================================

/// 문단 A "Paris is the capital of France", 문단 B "France is in Europe"
///
/// 엔티티 순서: paris, france, europe. 모든 문단이 완료 상태입니다.
pub fn paris_snapshot() -> KnowledgeSnapshot {
    let texts = ["Paris is the capital of France", "France is in Europe"];
    let units: Vec<StoredUnit> = texts
        .iter()
        .enumerate()
        .map(|(i, text)| StoredUnit {
            unit: TextUnit::new("doc", i, text.to_string()),
            seq: i as i64 + 1,
            embedded: true,
            extracted: true,
        })
        .collect();

    let entity = |name: &str| Entity {
        id: name.to_lowercase(),
        name: name.to_string(),
    };
    let entities = vec![entity("Paris"), entity("France"), entity("Europe")];

    let edge = |source: &str, relation: &str, target: &str, unit: usize| RelationEdge {
        source: source.to_string(),
        target: target.to_string(),
        relation: relation.to_string(),
        unit_id: units[unit].unit.id.clone(),
        confidence: 1.0,
    };

    let data = SnapshotData {
        unit_vectors: units
            .iter()
            .map(|u| (u.unit.id.clone(), KeywordEmbedder::vector(&u.unit.content)))
            .collect(),
        entity_vectors: entities
            .iter()
            .map(|e| (e.id.clone(), KeywordEmbedder::vector(&e.name)))
            .collect(),
        mentions: vec![
            (units[0].unit.id.clone(), "paris".to_string()),
            (units[0].unit.id.clone(), "france".to_string()),
            (units[1].unit.id.clone(), "france".to_string()),
            (units[1].unit.id.clone(), "europe".to_string()),
        ],
        relations: vec![
            edge("paris", "capital_of", "france", 0),
            edge("france", "located_in", "europe", 1),
        ],
        entities,
        units,
    };

    KnowledgeSnapshot::build(data, VOCABULARY.len(), 1).expect("paris fixture builds")
}
