//! Knowledge Graph - 엔티티 + 관계 엣지 (멀티그래프, 인메모리)
//!
//! 노드는 스냅샷의 엔티티 인덱스입니다. 같은 엔티티 쌍 사이에
//! 타입/근거가 다른 엣지가 여러 개 공존할 수 있습니다.

use super::model::RelationEdge;

/// 인덱스로 해석된 엣지
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub source: usize,
    pub target: usize,
    pub relation: RelationEdge,
}

impl GraphEdge {
    /// `node`의 반대편 노드 (self-loop면 자기 자신)
    pub fn other(&self, node: usize) -> usize {
        if self.source == node {
            self.target
        } else {
            self.source
        }
    }
}

/// 엔티티 그래프
#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraph {
    edges: Vec<GraphEdge>,
    /// 노드 → 인접 엣지 번호 (방향 무관)
    adjacency: Vec<Vec<usize>>,
}

impl KnowledgeGraph {
    pub fn new(node_count: usize) -> Self {
        Self {
            edges: Vec::new(),
            adjacency: vec![Vec::new(); node_count],
        }
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// 엣지가 하나도 없으면 true
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// 엣지 추가. 노드 범위를 벗어나면 무시하고 false
    pub fn add_edge(&mut self, source: usize, target: usize, relation: RelationEdge) -> bool {
        let nodes = self.node_count();
        if source >= nodes || target >= nodes {
            tracing::warn!(
                "Skipping edge {} -[{}]-> {}: endpoint not in graph",
                relation.source,
                relation.relation,
                relation.target
            );
            return false;
        }

        let idx = self.edges.len();
        self.edges.push(GraphEdge {
            source,
            target,
            relation,
        });
        self.adjacency[source].push(idx);
        if target != source {
            self.adjacency[target].push(idx);
        }
        true
    }

    /// 인접 엣지 (나가는 + 들어오는). O(degree)
    pub fn neighbors(&self, node: usize) -> impl Iterator<Item = &GraphEdge> + '_ {
        self.adjacency
            .get(node)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.edges[idx])
    }

    pub fn degree(&self, node: usize) -> usize {
        self.adjacency.get(node).map(Vec::len).unwrap_or(0)
    }

    /// 관계 엣지에 하나 이상 참여하는지
    pub fn has_edges(&self, node: usize) -> bool {
        self.degree(node) > 0
    }

    /// 랜덤 워크용 가중 이웃 (방향 무시, 가중치 = confidence)
    pub fn weighted_neighbors(&self, node: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.neighbors(node)
            .map(move |edge| (edge.other(node), f64::from(edge.relation.confidence.max(0.0))))
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }
}
