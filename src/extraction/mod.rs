//! 정보 추출 모듈 - TextUnit → 엔티티 + (주어, 관계, 목적어) 트리플
//!
//! 추출 오라클은 교체 가능한 인터페이스입니다:
//! - `LlmExtractor`: OpenAI 호환 chat completions (NER → RDF 트리플 2단계)
//! - `HeuristicExtractor`: 네트워크 호출 없는 휴리스틱 (대문자 토큰, 동시 출현)

mod heuristic;
mod llm;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ExtractionBackend, ExtractionConfig};
use crate::error::Result;
use crate::knowledge::normalize_entity;

pub use heuristic::HeuristicExtractor;
pub use llm::LlmExtractor;

// ============================================================================
// Types
// ============================================================================

/// (주어, 관계, 목적어) 트리플
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    /// 신뢰도 (0.0, 1.0]
    pub confidence: f32,
}

impl Triple {
    pub fn new(subject: impl Into<String>, predicate: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            confidence: 1.0,
        }
    }
}

/// 하나의 TextUnit에 대한 추출 결과
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    /// 언급된 엔티티 (표시 이름)
    pub entities: Vec<String>,
    pub triples: Vec<Triple>,
}

impl Extraction {
    /// 저장 직전 정리
    ///
    /// - 정규화 키 기준 엔티티 중복 제거 (처음 나온 표시 이름 유지)
    /// - 트리플의 양 끝을 엔티티 목록에 추가
    /// - 빈 이름, 빈 관계, self-loop 트리플 제거
    /// - confidence는 (0, 1]로 보정
    pub fn normalized(self) -> Self {
        let mut seen = HashSet::new();
        let mut entities = Vec::new();
        let mut push_entity = |name: &str, entities: &mut Vec<String>| {
            let name = name.trim();
            let key = normalize_entity(name);
            if !key.is_empty() && seen.insert(key) {
                entities.push(name.to_string());
            }
        };

        for name in &self.entities {
            push_entity(name, &mut entities);
        }

        let mut triples = Vec::with_capacity(self.triples.len());
        for triple in self.triples {
            let subject = normalize_entity(&triple.subject);
            let object = normalize_entity(&triple.object);
            let predicate = triple.predicate.trim();
            if subject.is_empty() || object.is_empty() || predicate.is_empty() || subject == object {
                continue;
            }
            push_entity(&triple.subject, &mut entities);
            push_entity(&triple.object, &mut entities);

            let confidence = if triple.confidence.is_finite() && triple.confidence > 0.0 {
                triple.confidence.min(1.0)
            } else {
                1.0
            };
            triples.push(Triple {
                subject: triple.subject.trim().to_string(),
                predicate: predicate.to_string(),
                object: triple.object.trim().to_string(),
                confidence,
            });
        }

        Self { entities, triples }
    }
}

// ============================================================================
// InfoExtractor Trait
// ============================================================================

/// 추출 오라클 인터페이스
#[async_trait]
pub trait InfoExtractor: Send + Sync {
    /// 텍스트에서 엔티티/트리플 추출
    async fn extract(&self, text: &str) -> Result<Extraction>;

    fn name(&self) -> &str;
}

/// 설정으로 추출기 생성
pub fn create_extractor(config: &ExtractionConfig) -> Result<Arc<dyn InfoExtractor>> {
    let extractor: Arc<dyn InfoExtractor> = match config.provider {
        ExtractionBackend::Llm => Arc::new(LlmExtractor::from_config(config)?),
        ExtractionBackend::Heuristic => Arc::new(HeuristicExtractor::new()),
    };
    tracing::info!("Using extractor: {}", extractor.name());
    Ok(extractor)
}

// ============================================================================
// Tests
// ============================================================================
