//! Vector Index - 코사인 유사도 기반 벡터 검색
//!
//! 스냅샷에 올라간 임베딩을 정규화된 행렬로 보관하고
//! 전수 탐색(brute-force)으로 top-k를 구합니다.

use crate::error::{LpmmError, Result};

// ============================================================================
// Types
// ============================================================================

/// 벡터 검색 범위
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorScope {
    /// 임베딩이 있는 모든 TextUnit
    Paragraphs,
    /// 임베딩과 추출이 모두 커밋된 TextUnit (agent 모드 대상)
    CompleteParagraphs,
    /// 임베딩이 있는 모든 엔티티
    Entities,
    /// 관계 엣지에 하나 이상 참여하는 엔티티
    RelatedEntities,
}

/// 검색 결과 (스냅샷 내부 위치 + 유사도)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorHit {
    /// 스냅샷 내 인덱스 (TextUnit 또는 Entity 위치)
    pub index: usize,
    /// 코사인 유사도 (-1.0 ~ 1.0)
    pub similarity: f32,
}

// ============================================================================
// VectorIndex
// ============================================================================

/// 고정 차원 벡터 인덱스
///
/// 각 행은 삽입 시 L2 정규화되므로 검색 시 내적이 곧 코사인 유사도입니다.
/// 영벡터는 정규화하지 않고 그대로 두며 모든 쿼리에 대해 유사도 0입니다.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    data: Vec<f32>,
    /// 행 번호 → 소유자 인덱스
    owners: Vec<usize>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
            owners: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// 벡터 추가. 차원이 다르면 ConfigMismatch
    pub fn push(&mut self, owner: usize, vector: &[f32]) -> Result<()> {
        check_dimension(vector, self.dimension)?;
        let norm = l2_norm(vector);
        if norm > 0.0 {
            self.data.extend(vector.iter().map(|v| v / norm));
        } else {
            self.data.extend_from_slice(vector);
        }
        self.owners.push(owner);
        Ok(())
    }

    /// top-k 검색
    ///
    /// 유사도 내림차순, 동점이면 소유자 인덱스(삽입 순서) 오름차순.
    /// `filter`가 false인 소유자는 건너뜁니다.
    pub fn search<F>(&self, query: &[f32], top_k: usize, filter: F) -> Result<Vec<VectorHit>>
    where
        F: Fn(usize) -> bool,
    {
        check_dimension(query, self.dimension)?;
        if top_k == 0 || self.is_empty() {
            return Ok(vec![]);
        }

        let norm = l2_norm(query);
        let mut hits: Vec<VectorHit> = self
            .owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| filter(**owner))
            .map(|(row, owner)| {
                let similarity = if norm > 0.0 {
                    let start = row * self.dimension;
                    let stored = &self.data[start..start + self.dimension];
                    dot(stored, query) / norm
                } else {
                    0.0
                };
                VectorHit {
                    index: *owner,
                    similarity,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(a.index.cmp(&b.index))
        });
        hits.truncate(top_k);

        Ok(hits)
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 벡터 차원 검사
pub fn check_dimension(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() != expected {
        return Err(LpmmError::ConfigMismatch(format!(
            "embedding dimension {} does not match configured dimension {}",
            vector.len(),
            expected
        )));
    }
    Ok(())
}

/// 코사인 유사도 (-1.0 ~ 1.0). 길이가 다르거나 영벡터면 0.0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot(a, b) / (norm_a * norm_b)
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[inline]
fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// f32 벡터 → little-endian BLOB
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// little-endian BLOB → f32 벡터
pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(LpmmError::ConfigMismatch(format!(
            "stored vector has {} bytes, not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

// ============================================================================
// Tests
// ============================================================================
