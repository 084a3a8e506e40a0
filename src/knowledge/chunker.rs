//! 문단 청킹 모듈
//!
//! 원본 문서를 문단 크기의 TextUnit으로 나눕니다.
//! 결정적(deterministic)이어야 합니다: 같은 문서 + 같은 설정 → 같은 경계.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::ChunkingConfig;

use super::model::{SourceDocument, TextUnit};

static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+").expect("header pattern is valid"));

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkConfig {
    /// 이보다 작은 청크는 다음 청크와 병합 (문자 수)
    pub min_characters: usize,
    /// 최대 청크 크기 (문자 수)
    pub max_characters: usize,
    /// 이전 청크 끝부분을 앞에 붙이는 길이 (0이면 사용 안 함)
    pub overlap_characters: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkingConfig::default().into()
    }
}

impl From<ChunkingConfig> for ChunkConfig {
    fn from(config: ChunkingConfig) -> Self {
        Self {
            min_characters: config.min_characters,
            max_characters: config.max_characters,
            overlap_characters: config.overlap_characters,
        }
    }
}

impl From<&ChunkingConfig> for ChunkConfig {
    fn from(config: &ChunkingConfig) -> Self {
        config.clone().into()
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크로 분할
    fn chunk(&self, text: &str) -> Vec<String>;

    fn name(&self) -> &'static str;
}

/// 문서를 TextUnit 목록으로 변환 (ordinal, ID 부여)
pub fn split_document(doc: &SourceDocument, chunker: &dyn Chunker) -> Vec<TextUnit> {
    chunker
        .chunk(&doc.content)
        .into_iter()
        .enumerate()
        .map(|(ordinal, content)| TextUnit::new(&doc.id, ordinal, content))
        .collect()
}

// ============================================================================
// ParagraphChunker
// ============================================================================

/// 문단 청커
///
/// 1. Markdown 헤더 경계로 섹션 분할 (코드 블록 내부 헤더는 무시)
/// 2. 긴 섹션은 빈 줄(문단) 경계, 그래도 길면 줄 단위로 분할
/// 3. 너무 작은 청크 병합
pub struct ParagraphChunker {
    config: ChunkConfig,
}

impl ParagraphChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    fn split_sections(&self, text: &str) -> Vec<String> {
        let mut sections = Vec::new();
        let mut current = String::new();
        let mut in_code_block = false;

        for line in text.lines() {
            if line.trim_start().starts_with("```") {
                in_code_block = !in_code_block;
            }

            if !in_code_block && HEADER_RE.is_match(line) && !current.trim().is_empty() {
                sections.push(current.trim().to_string());
                current.clear();
            }

            current.push_str(line);
            current.push('\n');
        }

        if !current.trim().is_empty() {
            sections.push(current.trim().to_string());
        }

        sections
    }

    fn split_long_section(&self, section: &str) -> Vec<String> {
        let max = self.config.max_characters;
        if section.len() <= max {
            return vec![section.to_string()];
        }

        let mut chunks = Vec::new();
        let mut current = String::new();

        for para in section.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            if !current.is_empty() && current.len() + para.len() + 2 > max {
                chunks.push(std::mem::take(&mut current));
            }

            if para.len() > max {
                for piece in split_lines(para, max) {
                    if !current.is_empty() {
                        chunks.push(std::mem::take(&mut current));
                    }
                    current = piece;
                }
                continue;
            }

            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(para);
        }

        if !current.is_empty() {
            chunks.push(current);
        }

        chunks
    }

    fn merge_small_chunks(&self, chunks: Vec<String>) -> Vec<String> {
        if self.config.min_characters == 0 {
            return chunks;
        }

        let mut result: Vec<String> = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            if let Some(last) = result.last_mut() {
                if last.len() < self.config.min_characters
                    && last.len() + chunk.len() + 2 <= self.config.max_characters
                {
                    last.push_str("\n\n");
                    last.push_str(&chunk);
                    continue;
                }
            }
            result.push(chunk);
        }

        result
    }

    fn apply_overlap(&self, chunks: Vec<String>) -> Vec<String> {
        let overlap = self.config.overlap_characters;
        if overlap == 0 || chunks.len() < 2 {
            return chunks;
        }

        let mut result = Vec::with_capacity(chunks.len());
        result.push(chunks[0].clone());

        for pair in chunks.windows(2) {
            let (prev, chunk) = (&pair[0], &pair[1]);
            let start = floor_char_boundary(prev, prev.len().saturating_sub(overlap));

            // 단어 중간에서 시작하지 않도록 다음 공백 이후부터
            let tail = &prev[start..];
            let word_start = tail
                .find(char::is_whitespace)
                .map(|p| start + p + 1)
                .unwrap_or(start);
            let tail = prev[word_start..].trim();

            if tail.len() > 20 {
                result.push(format!("...\n{}\n---\n{}", tail, chunk));
            } else {
                result.push(chunk.clone());
            }
        }

        result
    }
}

impl Chunker for ParagraphChunker {
    fn chunk(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return vec![];
        }

        let mut chunks: Vec<String> = self
            .split_sections(text)
            .into_iter()
            .flat_map(|s| self.split_long_section(&s))
            .collect();

        chunks.retain(|c| !c.trim().is_empty());
        let chunks = self.merge_small_chunks(chunks);

        self.apply_overlap(chunks)
    }

    fn name(&self) -> &'static str {
        "ParagraphChunker"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 한 문단을 줄 단위로 최대 길이 이하 조각으로 분할
fn split_lines(para: &str, max: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for line in para.lines() {
        if !current.is_empty() && current.len() + line.len() + 1 > max {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }

    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
}

/// UTF-8 경계 조정 (인덱스 이하로)
#[inline]
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// 설정으로 청커 생성
pub fn paragraph_chunker(config: &ChunkingConfig) -> Box<dyn Chunker> {
    Box::new(ParagraphChunker::new(config.into()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            min_characters: 10,
            max_characters: 200,
            overlap_characters: 0,
        }
    }

    #[test]
    fn test_chunker_empty() {
        let chunker = ParagraphChunker::with_defaults();
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("  \n\n ").is_empty());
    }

    #[test]
    fn test_chunker_splits_on_headers() {
        let chunker = ParagraphChunker::new(small_config());
        let text = "# Section 1\n\nContent for section 1.\n\n# Section 2\n\nContent for section 2.";
        let chunks = chunker.chunk(text);

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("# Section 1"));
        assert!(chunks[1].starts_with("# Section 2"));
    }

    #[test]
    fn test_header_inside_code_block_is_ignored() {
        let chunker = ParagraphChunker::new(small_config());
        let text = "# Intro\n\nSome text here.\n\n```sh\n# not a header\necho hi\n```\n";
        let chunks = chunker.chunk(text);

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("# not a header"));
    }

    #[test]
    fn test_long_section_respects_max() {
        let chunker = ParagraphChunker::new(ChunkConfig {
            min_characters: 0,
            max_characters: 60,
            overlap_characters: 0,
        });
        let para = "word ".repeat(10);
        let text = format!("{p}\n\n{p}\n\n{p}", p = para.trim());
        let chunks = chunker.chunk(&text);

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 60));
    }

    #[test]
    fn test_merge_small_chunks() {
        let chunker = ParagraphChunker::new(ChunkConfig {
            min_characters: 100,
            max_characters: 500,
            overlap_characters: 0,
        });
        let chunks = vec![
            "Short 1.".to_string(),
            "Short 2.".to_string(),
            "Short 3.".to_string(),
        ];
        let merged = chunker.merge_small_chunks(chunks);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].contains("Short 3."));
    }

    #[test]
    fn test_overlap_prefix() {
        let chunker = ParagraphChunker::new(ChunkConfig {
            min_characters: 0,
            max_characters: 80,
            overlap_characters: 40,
        });
        let first = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda";
        let second = "second paragraph body";
        let chunks = chunker.chunk(&format!("{}\n\n{}", first, second));

        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].starts_with("...\n"));
        assert!(chunks[1].ends_with(second));
    }

    #[test]
    fn test_split_document_is_deterministic() {
        let chunker = ParagraphChunker::new(small_config());
        let doc = SourceDocument::new("doc-1", "# A\n\nFirst part.\n\n# B\n\nSecond part.");

        let first = split_document(&doc, &chunker);
        let second = split_document(&doc, &chunker);

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].ordinal, 0);
        assert_eq!(first[1].ordinal, 1);
        assert!(first.iter().all(|u| u.document_id == "doc-1"));
    }

    #[test]
    fn test_floor_char_boundary() {
        let s = "Hello, 세계!";
        assert_eq!(floor_char_boundary(s, 5), 5);
        assert_eq!(floor_char_boundary(s, 8), 7);
        assert_eq!(floor_char_boundary(s, 100), s.len());
        assert_eq!(floor_char_boundary("", 0), 0);
    }
}
