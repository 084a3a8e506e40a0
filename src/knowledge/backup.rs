//! 백업 관리
//!
//! `backup_dir` 아래에 `backup_<id>.db` 파일로 스냅샷을 보관합니다.
//! ID는 생성 시각(UTC, 밀리초) 문자열이라 사전순 정렬이 곧 시간순입니다.
//! 새 백업을 만들 때마다 `max_backups`를 넘는 오래된 백업을 지웁니다.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::StorageConfig;
use crate::error::{LpmmError, Result};

use super::store::KnowledgeStore;

const PREFIX: &str = "backup_";
const EXTENSION: &str = ".db";

/// 백업 엔트리
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupInfo {
    pub id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// 백업 관리자
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
    max_backups: usize,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            dir: dir.into(),
            max_backups,
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(storage.backup_dir(), storage.max_backups)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 새 백업 생성 후 오래된 백업 정리
    pub fn create(&self, store: &KnowledgeStore) -> Result<BackupInfo> {
        std::fs::create_dir_all(&self.dir)?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f").to_string();
        let mut id = stamp.clone();
        let mut n = 1;
        while self.path_for(&id).exists() {
            id = format!("{}_{}", stamp, n);
            n += 1;
        }

        store.backup_to(&self.path_for(&id))?;
        let info = self.get(&id)?;
        tracing::info!("Created backup {} ({} bytes)", info.id, info.size_bytes);

        let removed = self.prune()?;
        if !removed.is_empty() {
            tracing::info!("Removed {} old backup(s)", removed.len());
        }
        Ok(info)
    }

    /// 백업 목록 (최신 순)
    pub fn list(&self) -> Result<Vec<BackupInfo>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(parse_backup_id) else {
                continue;
            };
            match describe(id, entry.path()) {
                Ok(info) => backups.push(info),
                Err(e) => tracing::warn!("Skipping unreadable backup {:?}: {}", entry.path(), e),
            }
        }

        backups.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(backups)
    }

    /// ID로 백업 조회
    pub fn get(&self, id: &str) -> Result<BackupInfo> {
        if !is_valid_id(id) {
            return Err(LpmmError::NotFound(format!("backup {}", id)));
        }
        let path = self.path_for(id);
        if !path.is_file() {
            return Err(LpmmError::NotFound(format!("backup {}", id)));
        }
        describe(id, path)
    }

    /// 백업 삭제
    pub fn delete(&self, id: &str) -> Result<()> {
        let info = self.get(id)?;
        std::fs::remove_file(&info.path)?;
        tracing::info!("Deleted backup {}", id);
        Ok(())
    }

    /// `max_backups`보다 오래된 백업 삭제, 지운 ID 반환
    pub fn prune(&self) -> Result<Vec<String>> {
        if self.max_backups == 0 {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        for old in self.list()?.into_iter().skip(self.max_backups) {
            std::fs::remove_file(&old.path)?;
            tracing::debug!("Pruned backup {}", old.id);
            removed.push(old.id);
        }
        Ok(removed)
    }

    /// 백업으로 저장소 내용 교체
    ///
    /// 차원이 다른 백업은 ConfigMismatch로 거부되고 저장소는 그대로입니다.
    pub fn restore(&self, store: &KnowledgeStore, id: &str) -> Result<BackupInfo> {
        let info = self.get(id)?;
        store.restore_from(&info.path)?;
        tracing::info!("Restored backup {}", id);
        Ok(info)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}{}", PREFIX, id, EXTENSION))
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// `backup_<id>.db` → `<id>`
fn parse_backup_id(file_name: &str) -> Option<&str> {
    let id = file_name.strip_prefix(PREFIX)?.strip_suffix(EXTENSION)?;
    is_valid_id(id).then_some(id)
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_')
}

fn describe(id: &str, path: PathBuf) -> Result<BackupInfo> {
    let metadata = std::fs::metadata(&path)?;
    let created_at = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(BackupInfo {
        id: id.to_string(),
        path,
        size_bytes: metadata.len(),
        created_at,
    })
}

// ============================================================================
// Tests
// ============================================================================
