//! 문서 수집 모듈
//!
//! 로컬 텍스트 파일과 폴더를 읽어 [`SourceDocument`]로 만듭니다.
//! 폴더는 .gitignore 패턴을 존중하고, 텍스트 확장자만 수집합니다.
//! 문서 ID는 `file://` + 절대 경로이므로 같은 파일을 다시 가져오면 같은 문서로 취급됩니다.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ignore::WalkBuilder;

use crate::knowledge::SourceDocument;

/// 텍스트로 읽는 확장자
const TEXT_EXTENSIONS: &[&str] = &[
    "md", "markdown", "txt", "text", "rst", "adoc", "org", "csv", "json", "toml", "yaml", "yml",
    "html", "xml", "rs", "py", "ts", "js", "go", "java", "c", "h", "cpp", "sql", "sh",
];

/// 파일 경로 → 문서 ID
pub fn document_id_for(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| TEXT_EXTENSIONS.iter().any(|t| t.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

// ============================================================================
// Collector
// ============================================================================

/// 수집기 설정
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// .gitignore 패턴 존중 여부
    pub respect_gitignore: bool,
    /// 숨김 파일 포함 여부
    pub include_hidden: bool,
    /// 최대 파일 크기 (바이트, 0이면 제한 없음)
    pub max_file_size: u64,
    /// 특정 확장자만 수집 (비어있으면 모든 텍스트 확장자)
    pub extensions: Vec<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            respect_gitignore: true,
            include_hidden: false,
            max_file_size: 10 * 1024 * 1024, // 10MB
            extensions: vec![],
        }
    }
}

/// 문서 수집기
pub struct DocumentCollector {
    config: CollectorConfig,
}

impl DocumentCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(CollectorConfig::default())
    }

    /// 단일 파일 → 문서
    pub fn collect_file(&self, path: &Path) -> Result<SourceDocument> {
        let abs_path = absolute(path)?;
        if !abs_path.is_file() {
            anyhow::bail!("Not a file: {:?}", abs_path);
        }
        read_document(&abs_path)
    }

    /// 폴더 재귀 수집 (읽기 실패한 파일은 경고 후 건너뜀)
    pub fn collect_directory(&self, path: &Path) -> Result<Vec<SourceDocument>> {
        let abs_path = absolute(path)?;
        if !abs_path.is_dir() {
            anyhow::bail!("Not a directory: {:?}", abs_path);
        }

        let walker = WalkBuilder::new(&abs_path)
            .hidden(!self.config.include_hidden)
            .git_ignore(self.config.respect_gitignore)
            .git_global(self.config.respect_gitignore)
            .git_exclude(self.config.respect_gitignore)
            .sort_by_file_path(|a, b| a.cmp(b))
            .build();

        let mut documents = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            if !self.should_include(entry.path()) {
                continue;
            }

            match read_document(entry.path()) {
                Ok(doc) if doc.content.trim().is_empty() => {
                    tracing::debug!("Skipping empty file: {:?}", entry.path());
                }
                Ok(doc) => documents.push(doc),
                Err(e) => tracing::warn!("Failed to collect file: {:#}", e),
            }
        }

        tracing::info!("Collected {} documents from {:?}", documents.len(), abs_path);
        Ok(documents)
    }

    fn should_include(&self, path: &Path) -> bool {
        if !is_text_file(path) {
            return false;
        }

        if !self.config.extensions.is_empty() {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !self.config.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
                return false;
            }
        }

        if self.config.max_file_size > 0 {
            if let Ok(metadata) = std::fs::metadata(path) {
                if metadata.len() > self.config.max_file_size {
                    tracing::debug!("Skipping large file: {:?} ({} bytes)", path, metadata.len());
                    return false;
                }
            }
        }

        true
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    if !abs_path.exists() {
        anyhow::bail!("Path not found: {:?}", abs_path);
    }
    Ok(abs_path)
}

fn read_document(path: &Path) -> Result<SourceDocument> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read file: {:?}", path))?;
    let mut doc = SourceDocument::new(document_id_for(path), content);
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        doc = doc.with_title(name);
    }
    Ok(doc)
}

// ============================================================================
// Tests
// ============================================================================
