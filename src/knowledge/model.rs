//! 지식베이스 데이터 모델
//!
//! SourceDocument → TextUnit → (EmbeddingVector, Entity, RelationEdge)

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// Documents & Text Units
// ============================================================================

/// 가져올 원본 문서
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    /// 호출자가 지정하는 안정적인 ID (예: file:// 경로)
    pub id: String,
    pub title: Option<String>,
    pub content: String,
}

impl SourceDocument {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            content: content.into(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// 콘텐츠 해시 (변경 감지용)
    pub fn content_hash(&self) -> String {
        format!("{:x}", Sha256::digest(self.content.as_bytes()))
    }
}

/// 문단 단위 텍스트 조각. 생성 후 변경되지 않음
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextUnit {
    pub id: String,
    pub document_id: String,
    /// 문서 내 순서 (0-based)
    pub ordinal: usize,
    pub content: String,
}

impl TextUnit {
    pub fn new(document_id: &str, ordinal: usize, content: String) -> Self {
        Self {
            id: text_unit_id(document_id, ordinal, &content),
            document_id: document_id.to_string(),
            ordinal,
            content,
        }
    }
}

/// TextUnit ID = sha256(document_id ␀ ordinal ␀ content)
///
/// 같은 문서를 같은 청커 설정으로 다시 가져오면 같은 ID가 나옵니다.
pub fn text_unit_id(document_id: &str, ordinal: usize, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(ordinal.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Entities & Relations
// ============================================================================

/// 엔티티 정규화 키: 앞뒤 공백 제거, 내부 공백 축약, 소문자화
pub fn normalize_entity(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// 그래프 노드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// 정규화된 표면형 (기본 키)
    pub id: String,
    /// 처음 관측된 표시 이름
    pub name: String,
}

/// 방향성 관계 엣지 (멀티그래프)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEdge {
    pub source: String,
    pub target: String,
    pub relation: String,
    /// 근거가 된 TextUnit
    pub unit_id: String,
    pub confidence: f32,
}

// ============================================================================
// Tests
// ============================================================================
