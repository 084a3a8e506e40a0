//! Knowledge Snapshot - 검색용 불변 인메모리 뷰
//!
//! SQLite 저장소의 한 시점을 읽어 벡터 인덱스와 그래프로 구성합니다.
//! 검색은 항상 하나의 스냅샷(`Arc`)만 보므로 쓰기 도중에도
//! TextUnit 하나의 산출물이 반쯤 보이는 일이 없습니다.

use std::collections::HashMap;

use crate::error::Result;

use super::graph::KnowledgeGraph;
use super::model::{Entity, RelationEdge, TextUnit};
use super::vector::{VectorHit, VectorIndex, VectorScope};

// ============================================================================
// Raw Data
// ============================================================================

/// 저장소에 기록된 TextUnit + 커밋 상태
#[derive(Debug, Clone, PartialEq)]
pub struct StoredUnit {
    pub unit: TextUnit,
    /// 삽입 순서 (동점 처리 기준)
    pub seq: i64,
    pub embedded: bool,
    pub extracted: bool,
}

impl StoredUnit {
    /// 임베딩과 추출이 모두 커밋되었는지
    pub fn is_complete(&self) -> bool {
        self.embedded && self.extracted
    }
}

/// 스냅샷 구성용 원시 데이터 (저장소가 한 트랜잭션에서 읽음)
#[derive(Debug, Default)]
pub struct SnapshotData {
    /// seq 오름차순
    pub units: Vec<StoredUnit>,
    pub unit_vectors: Vec<(String, Vec<f32>)>,
    pub entities: Vec<Entity>,
    pub entity_vectors: Vec<(String, Vec<f32>)>,
    /// (unit_id, entity_id)
    pub mentions: Vec<(String, String)>,
    pub relations: Vec<RelationEdge>,
}

// ============================================================================
// KnowledgeSnapshot
// ============================================================================

/// 불변 지식베이스 스냅샷
#[derive(Debug, Clone)]
pub struct KnowledgeSnapshot {
    version: u64,
    units: Vec<TextUnit>,
    complete: Vec<bool>,
    unit_lookup: HashMap<String, usize>,
    paragraph_index: VectorIndex,
    entities: Vec<Entity>,
    entity_lookup: HashMap<String, usize>,
    entity_index: VectorIndex,
    /// TextUnit 위치 → 언급된 엔티티 위치
    unit_entities: Vec<Vec<usize>>,
    graph: KnowledgeGraph,
}

impl KnowledgeSnapshot {
    /// 빈 스냅샷
    pub fn empty(dimension: usize) -> Self {
        Self {
            version: 0,
            units: Vec::new(),
            complete: Vec::new(),
            unit_lookup: HashMap::new(),
            paragraph_index: VectorIndex::new(dimension),
            entities: Vec::new(),
            entity_lookup: HashMap::new(),
            entity_index: VectorIndex::new(dimension),
            unit_entities: Vec::new(),
            graph: KnowledgeGraph::new(0),
        }
    }

    /// 원시 데이터로 스냅샷 구성
    pub fn build(data: SnapshotData, dimension: usize, version: u64) -> Result<Self> {
        let mut snapshot = Self::empty(dimension);
        snapshot.version = version;

        let mut extracted = Vec::with_capacity(data.units.len());
        for stored in data.units {
            snapshot
                .unit_lookup
                .insert(stored.unit.id.clone(), snapshot.units.len());
            extracted.push(stored.extracted);
            snapshot.units.push(stored.unit);
        }

        let mut embedded = vec![false; snapshot.units.len()];
        for (unit_id, vector) in &data.unit_vectors {
            if let Some(&pos) = snapshot.unit_lookup.get(unit_id) {
                snapshot.paragraph_index.push(pos, vector)?;
                embedded[pos] = true;
            }
        }
        snapshot.complete = embedded
            .iter()
            .zip(extracted.iter())
            .map(|(e, x)| *e && *x)
            .collect();

        for entity in data.entities {
            snapshot
                .entity_lookup
                .insert(entity.id.clone(), snapshot.entities.len());
            snapshot.entities.push(entity);
        }

        for (entity_id, vector) in &data.entity_vectors {
            if let Some(&pos) = snapshot.entity_lookup.get(entity_id) {
                snapshot.entity_index.push(pos, vector)?;
            }
        }

        snapshot.unit_entities = vec![Vec::new(); snapshot.units.len()];
        for (unit_id, entity_id) in &data.mentions {
            if let (Some(&u), Some(&e)) = (
                snapshot.unit_lookup.get(unit_id),
                snapshot.entity_lookup.get(entity_id),
            ) {
                snapshot.unit_entities[u].push(e);
            }
        }
        for list in &mut snapshot.unit_entities {
            list.sort_unstable();
            list.dedup();
        }

        let mut graph = KnowledgeGraph::new(snapshot.entities.len());
        for relation in data.relations {
            match (
                snapshot.entity_lookup.get(&relation.source).copied(),
                snapshot.entity_lookup.get(&relation.target).copied(),
            ) {
                (Some(source), Some(target)) => {
                    graph.add_edge(source, target, relation);
                }
                _ => tracing::warn!(
                    "Relation {} -[{}]-> {} references a missing entity",
                    relation.source,
                    relation.relation,
                    relation.target
                ),
            }
        }
        snapshot.graph = graph;

        tracing::debug!(
            "Built snapshot v{}: {} units, {} entities, {} edges",
            version,
            snapshot.units.len(),
            snapshot.entities.len(),
            snapshot.graph.edge_count()
        );

        Ok(snapshot)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn dimension(&self) -> usize {
        self.paragraph_index.dimension()
    }

    pub fn units(&self) -> &[TextUnit] {
        &self.units
    }

    pub fn unit(&self, index: usize) -> Option<&TextUnit> {
        self.units.get(index)
    }

    pub fn unit_by_id(&self, id: &str) -> Option<&TextUnit> {
        self.unit_lookup.get(id).map(|&i| &self.units[i])
    }

    pub fn unit_index(&self, id: &str) -> Option<usize> {
        self.unit_lookup.get(id).copied()
    }

    /// agent 모드 검색 대상인지 (임베딩 + 추출 완료)
    pub fn is_complete(&self, index: usize) -> bool {
        self.complete.get(index).copied().unwrap_or(false)
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, index: usize) -> Option<&Entity> {
        self.entities.get(index)
    }

    pub fn entity_index(&self, id: &str) -> Option<usize> {
        self.entity_lookup.get(id).copied()
    }

    /// TextUnit에 언급된 엔티티 위치 목록
    pub fn entities_in_unit(&self, unit_index: usize) -> &[usize] {
        self.unit_entities
            .get(unit_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn graph(&self) -> &KnowledgeGraph {
        &self.graph
    }

    pub fn paragraph_vector_count(&self) -> usize {
        self.paragraph_index.len()
    }

    pub fn entity_vector_count(&self) -> usize {
        self.entity_index.len()
    }

    /// 범위 내 top-k 벡터 검색 (코사인 유사도)
    pub fn vector_search(&self, query: &[f32], top_k: usize, scope: VectorScope) -> Result<Vec<VectorHit>> {
        match scope {
            VectorScope::Paragraphs => self.paragraph_index.search(query, top_k, |_| true),
            VectorScope::CompleteParagraphs => {
                self.paragraph_index
                    .search(query, top_k, |unit| self.is_complete(unit))
            }
            VectorScope::Entities => self.entity_index.search(query, top_k, |_| true),
            VectorScope::RelatedEntities => {
                self.entity_index
                    .search(query, top_k, |entity| self.graph.has_edges(entity))
            }
        }
    }

    /// 엔티티에 인접한 관계 엣지 (정규화 키로 조회)
    pub fn neighbors(&self, entity_id: &str) -> Vec<&RelationEdge> {
        match self.entity_lookup.get(entity_id) {
            Some(&node) => self.graph.neighbors(node).map(|e| &e.relation).collect(),
            None => Vec::new(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: &str, seq: i64, extracted: bool) -> StoredUnit {
        StoredUnit {
            unit: TextUnit {
                id: id.to_string(),
                document_id: "doc".to_string(),
                ordinal: seq as usize,
                content: format!("content {}", id),
            },
            seq,
            embedded: true,
            extracted,
        }
    }

    fn entity(id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            name: id.to_string(),
        }
    }

    fn sample() -> KnowledgeSnapshot {
        let data = SnapshotData {
            units: vec![stored("u1", 1, true), stored("u2", 2, false), stored("u3", 3, true)],
            unit_vectors: vec![
                ("u1".into(), vec![1.0, 0.0]),
                ("u2".into(), vec![0.9, 0.1]),
            ],
            entities: vec![entity("a"), entity("b"), entity("c")],
            entity_vectors: vec![
                ("a".into(), vec![1.0, 0.0]),
                ("b".into(), vec![0.0, 1.0]),
                ("c".into(), vec![0.7, 0.7]),
            ],
            mentions: vec![("u1".into(), "a".into()), ("u1".into(), "b".into())],
            relations: vec![RelationEdge {
                source: "a".into(),
                target: "b".into(),
                relation: "knows".into(),
                unit_id: "u1".into(),
                confidence: 1.0,
            }],
        };
        KnowledgeSnapshot::build(data, 2, 7).unwrap()
    }

    #[test]
    fn test_completeness_requires_vector_and_extraction() {
        let snapshot = sample();
        assert_eq!(snapshot.version(), 7);
        assert!(snapshot.is_complete(0));
        assert!(!snapshot.is_complete(1)); // 추출 미완료
        assert!(!snapshot.is_complete(2)); // 임베딩 없음
        assert_eq!(snapshot.paragraph_vector_count(), 2);
    }

    #[test]
    fn test_scoped_search() {
        let snapshot = sample();
        let query = [1.0, 0.0];

        let all = snapshot.vector_search(&query, 10, VectorScope::Paragraphs).unwrap();
        assert_eq!(all.len(), 2);

        let complete = snapshot
            .vector_search(&query, 10, VectorScope::CompleteParagraphs)
            .unwrap();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].index, 0);

        let related = snapshot
            .vector_search(&query, 10, VectorScope::RelatedEntities)
            .unwrap();
        let ids: Vec<&str> = related
            .iter()
            .map(|h| snapshot.entity(h.index).unwrap().id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]); // c는 엣지가 없음

        let entities = snapshot.vector_search(&query, 2, VectorScope::Entities).unwrap();
        assert_eq!(entities[0].index, 0);
        assert_eq!(entities[1].index, 2);
    }

    #[test]
    fn test_neighbors_and_mentions() {
        let snapshot = sample();
        let edges = snapshot.neighbors("b");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relation, "knows");
        assert!(snapshot.neighbors("missing").is_empty());

        assert_eq!(snapshot.entities_in_unit(0), &[0, 1]);
        assert!(snapshot.entities_in_unit(2).is_empty());
    }

    #[test]
    fn test_dimension_mismatch_fails_build() {
        let data = SnapshotData {
            units: vec![stored("u1", 1, true)],
            unit_vectors: vec![("u1".into(), vec![1.0, 0.0, 0.0])],
            ..Default::default()
        };
        assert!(KnowledgeSnapshot::build(data, 2, 1).is_err());
    }
}
