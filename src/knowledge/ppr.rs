//! Personalized PageRank
//!
//! 시드 집합에 균등하게 재시작 확률을 배분한 랜덤 워크의 정상 분포를 구합니다.
//!
//! r' = (1 - d)·p + d·(Wᵀ·r) + d·(dangling)·p
//!
//! - p: 시드 균등 분포, d: damping
//! - 엣지가 없는 노드(dangling)의 질량은 시드로 되돌림
//! - L1 잔차 < tolerance 또는 최대 반복 도달 시 종료 (입력이 같으면 결과도 같음)
//! - deadline이 지나면 현재 상태를 반환 (timed_out = true)

use std::time::Instant;

use super::graph::KnowledgeGraph;

/// PPR 파라미터
#[derive(Debug, Clone)]
pub struct PprParams {
    pub damping: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub deadline: Option<Instant>,
}

/// PPR 결과
#[derive(Debug, Clone)]
pub struct PprResult {
    /// 노드별 점수 (합 ≈ 1.0)
    pub scores: Vec<f64>,
    pub iterations: usize,
    pub residual: f64,
    pub converged: bool,
    pub timed_out: bool,
}

/// Personalized PageRank 실행
///
/// 시드가 비어 있거나 범위를 벗어나면 모든 점수가 0입니다.
pub fn personalized_pagerank(graph: &KnowledgeGraph, seeds: &[usize], params: &PprParams) -> PprResult {
    let n = graph.node_count();
    let mut restart = vec![0.0f64; n];

    let mut valid_seeds: Vec<usize> = seeds.iter().copied().filter(|&s| s < n).collect();
    valid_seeds.sort_unstable();
    valid_seeds.dedup();

    if valid_seeds.is_empty() {
        return PprResult {
            scores: restart,
            iterations: 0,
            residual: 0.0,
            converged: true,
            timed_out: false,
        };
    }

    let share = 1.0 / valid_seeds.len() as f64;
    for &seed in &valid_seeds {
        restart[seed] = share;
    }

    let out_weight: Vec<f64> = (0..n)
        .map(|node| graph.weighted_neighbors(node).map(|(_, w)| w).sum())
        .collect();

    let d = params.damping;
    let mut scores = restart.clone();
    let mut next = vec![0.0f64; n];
    let mut iterations = 0;
    let mut residual = f64::INFINITY;
    let mut timed_out = false;

    while iterations < params.max_iterations {
        if let Some(deadline) = params.deadline {
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }
        }

        let dangling: f64 = (0..n)
            .filter(|&node| out_weight[node] <= 0.0)
            .map(|node| scores[node])
            .sum();

        for (node, value) in next.iter_mut().enumerate() {
            *value = (1.0 - d + d * dangling) * restart[node];
        }

        for node in 0..n {
            let total = out_weight[node];
            if total <= 0.0 || scores[node] == 0.0 {
                continue;
            }
            let mass = d * scores[node] / total;
            for (other, weight) in graph.weighted_neighbors(node) {
                next[other] += mass * weight;
            }
        }

        residual = scores
            .iter()
            .zip(next.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        std::mem::swap(&mut scores, &mut next);
        iterations += 1;

        if residual < params.tolerance {
            break;
        }
    }

    PprResult {
        converged: residual < params.tolerance,
        scores,
        iterations,
        residual,
        timed_out,
    }
}
