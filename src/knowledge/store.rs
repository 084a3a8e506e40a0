//! Knowledge Store - rusqlite 기반 영속 지식 저장소
//!
//! 문서, TextUnit, 임베딩, 엔티티, 언급(mention), 관계 엣지를 저장합니다.
//! 저장 위치: `[storage] data_dir`/knowledge.db
//!
//! 모든 쓰기는 하나의 커넥션 락 아래 트랜잭션으로 수행되므로
//! TextUnit 하나의 산출물(임베딩 또는 추출 결과)은 전부 보이거나 전혀 보이지 않습니다.
//! 같은 엔티티를 건드리는 쓰기도 이 락으로 직렬화됩니다.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::backup::Progress;
use rusqlite::{params, Connection, DatabaseName, OpenFlags, OptionalExtension, Transaction};
use serde::Serialize;

use crate::error::{LpmmError, Result};
use crate::extraction::Extraction;

use super::model::{normalize_entity, Entity, RelationEdge, SourceDocument, TextUnit};
use super::snapshot::{KnowledgeSnapshot, SnapshotData, StoredUnit};
use super::vector::{check_dimension, decode_vector, encode_vector};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    title TEXT,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS text_units (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    content TEXT NOT NULL,
    embedded INTEGER NOT NULL DEFAULT 0,
    extracted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_text_units_document ON text_units(document_id);

CREATE TABLE IF NOT EXISTS unit_embeddings (
    unit_id TEXT PRIMARY KEY REFERENCES text_units(id) ON DELETE CASCADE,
    vector BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entity_embeddings (
    entity_id TEXT PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    vector BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS mentions (
    unit_id TEXT NOT NULL REFERENCES text_units(id) ON DELETE CASCADE,
    entity_id TEXT NOT NULL REFERENCES entities(id),
    PRIMARY KEY (unit_id, entity_id)
);
CREATE INDEX IF NOT EXISTS idx_mentions_entity ON mentions(entity_id);

CREATE TABLE IF NOT EXISTS relations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL REFERENCES entities(id),
    target TEXT NOT NULL REFERENCES entities(id),
    relation TEXT NOT NULL,
    unit_id TEXT NOT NULL REFERENCES text_units(id) ON DELETE CASCADE,
    confidence REAL NOT NULL,
    UNIQUE (source, relation, target, unit_id)
);
CREATE INDEX IF NOT EXISTS idx_relations_source ON relations(source);
CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(target);
CREATE INDEX IF NOT EXISTS idx_relations_unit ON relations(unit_id);
"#;

/// 어떤 mention/관계에도 참여하지 않는 엔티티 제거 (임베딩은 CASCADE)
const PRUNE_ENTITIES: &str = "DELETE FROM entities
     WHERE NOT EXISTS (SELECT 1 FROM mentions m WHERE m.entity_id = entities.id)
       AND NOT EXISTS (SELECT 1 FROM relations r
                       WHERE r.source = entities.id OR r.target = entities.id)";

// ============================================================================
// Types
// ============================================================================

/// 저장된 문서 엔트리
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: String,
    pub title: Option<String>,
    pub content_hash: String,
    pub unit_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 미완료 작업 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStage {
    Embedding,
    Extraction,
}

impl PendingStage {
    fn column(self) -> &'static str {
        match self {
            Self::Embedding => "embedded",
            Self::Extraction => "extracted",
        }
    }
}

/// 문서 TextUnit 동기화 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitSync {
    pub created: usize,
    pub unchanged: usize,
    pub removed: usize,
}

/// 추출 커밋 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionCommit {
    pub entities_created: usize,
    pub relations: usize,
}

/// 삭제 결과
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub documents: usize,
    pub units: usize,
    pub relations: usize,
    pub entities: usize,
    /// 저장소에 없던 문서 ID
    pub missing: Vec<String>,
}

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub document_count: usize,
    pub unit_count: usize,
    pub embedded_units: usize,
    pub complete_units: usize,
    pub entity_count: usize,
    pub embedded_entities: usize,
    pub relation_count: usize,
    pub embedding_dimension: usize,
    pub db_path: PathBuf,
}

// ============================================================================
// KnowledgeStore
// ============================================================================

/// Knowledge Store - 영속 지식 저장소
pub struct KnowledgeStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    dimension: usize,
}

impl KnowledgeStore {
    /// 저장소 열기 (없으면 생성)
    ///
    /// 처음 열 때 `dimension`을 기록하고, 이후 다른 차원으로 열면 ConfigMismatch입니다.
    pub fn open(path: &Path, dimension: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
            dimension,
        };

        store.initialize()?;
        Ok(store)
    }

    /// DB 경로 반환
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// 지식베이스 임베딩 차원
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| LpmmError::Lock(e.to_string()))
    }

    /// 스키마 초기화 + 차원 검사
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        tracing::trace!("journal_mode = {}", journal);

        match read_dimension(&conn)? {
            Some(stored_dim) => {
                if stored_dim != self.dimension {
                    return Err(LpmmError::ConfigMismatch(format!(
                        "knowledge base at {:?} was built with dimension {}, configured dimension is {}",
                        self.db_path, stored_dim, self.dimension
                    )));
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('embedding_dimension', ?1)",
                    params![self.dimension.to_string()],
                )?;
            }
        }

        tracing::debug!("Knowledge store initialized at {:?}", self.db_path);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Documents & Text Units
    // ------------------------------------------------------------------------

    /// 문서의 TextUnit 집합을 `units`와 일치시킴 (한 트랜잭션)
    ///
    /// - 같은 ID의 TextUnit은 그대로 둠 (기존 임베딩/추출 유지)
    /// - 새 ID는 미완료 상태로 삽입
    /// - 더 이상 없는 ID는 산출물과 함께 삭제
    pub fn sync_document_units(&self, doc: &SourceDocument, units: &[TextUnit]) -> Result<UnitSync> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO documents (id, title, content_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at",
            params![doc.id, doc.title, doc.content_hash(), now],
        )?;

        let existing: HashSet<String> = {
            let mut stmt = tx.prepare("SELECT id FROM text_units WHERE document_id = ?1")?;
            let rows = stmt.query_map(params![doc.id], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let wanted: HashSet<&str> = units.iter().map(|u| u.id.as_str()).collect();

        let mut sync = UnitSync::default();

        for stale in existing.iter().filter(|id| !wanted.contains(id.as_str())) {
            sync.removed += tx.execute("DELETE FROM text_units WHERE id = ?1", params![stale])?;
        }

        for unit in units {
            if existing.contains(&unit.id) {
                sync.unchanged += 1;
                continue;
            }
            sync.created += tx.execute(
                "INSERT OR IGNORE INTO text_units (id, document_id, ordinal, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![unit.id, unit.document_id, unit.ordinal as i64, unit.content, now],
            )?;
        }

        if sync.removed > 0 {
            tx.execute(PRUNE_ENTITIES, [])?;
        }
        tx.commit()?;

        tracing::debug!(
            "Synced document {}: {} new, {} unchanged, {} removed",
            doc.id,
            sync.created,
            sync.unchanged,
            sync.removed
        );
        Ok(sync)
    }

    /// ID로 문서 조회
    pub fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let conn = self.lock()?;
        let doc = conn
            .query_row(
                "SELECT d.id, d.title, d.content_hash, d.created_at, d.updated_at,
                        (SELECT COUNT(*) FROM text_units u WHERE u.document_id = d.id)
                 FROM documents d WHERE d.id = ?1",
                params![id],
                map_document,
            )
            .optional()?;
        Ok(doc)
    }

    /// 문서 목록 조회 (최근 갱신 순)
    pub fn list_documents(&self, limit: usize) -> Result<Vec<DocumentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT d.id, d.title, d.content_hash, d.created_at, d.updated_at,
                    (SELECT COUNT(*) FROM text_units u WHERE u.document_id = d.id)
             FROM documents d
             ORDER BY d.updated_at DESC, d.id
             LIMIT ?1",
        )?;
        let docs = stmt
            .query_map(params![limit as i64], map_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(docs)
    }

    /// 문서의 TextUnit 목록 (ordinal 순)
    pub fn document_units(&self, document_id: &str) -> Result<Vec<StoredUnit>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, id, document_id, ordinal, content, embedded, extracted
             FROM text_units WHERE document_id = ?1 ORDER BY ordinal",
        )?;
        let units = stmt
            .query_map(params![document_id], map_stored_unit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(units)
    }

    /// ID로 TextUnit 조회
    pub fn get_unit(&self, id: &str) -> Result<Option<StoredUnit>> {
        let conn = self.lock()?;
        let unit = conn
            .query_row(
                "SELECT seq, id, document_id, ordinal, content, embedded, extracted
                 FROM text_units WHERE id = ?1",
                params![id],
                map_stored_unit,
            )
            .optional()?;
        Ok(unit)
    }

    /// 단계가 끝나지 않은 TextUnit (seq 순)
    ///
    /// `documents`가 있으면 해당 문서로 범위를 좁힙니다.
    pub fn pending_units(&self, stage: PendingStage, documents: Option<&[String]>) -> Result<Vec<TextUnit>> {
        let conn = self.lock()?;
        let column = stage.column();
        let mut units = Vec::new();

        match documents {
            Some(ids) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT seq, id, document_id, ordinal, content, embedded, extracted
                     FROM text_units WHERE document_id = ?1 AND {} = 0 ORDER BY seq",
                    column
                ))?;
                for id in ids {
                    let rows = stmt.query_map(params![id], map_stored_unit)?;
                    for row in rows {
                        units.push(row?);
                    }
                }
                units.sort_by_key(|u: &StoredUnit| u.seq);
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT seq, id, document_id, ordinal, content, embedded, extracted
                     FROM text_units WHERE {} = 0 ORDER BY seq",
                    column
                ))?;
                let rows = stmt.query_map([], map_stored_unit)?;
                for row in rows {
                    units.push(row?);
                }
            }
        }

        Ok(units.into_iter().map(|u| u.unit).collect())
    }

    // ------------------------------------------------------------------------
    // Per-Unit Commits
    // ------------------------------------------------------------------------

    /// TextUnit 임베딩 커밋 (원자적)
    ///
    /// 차원이 다르면 ConfigMismatch, TextUnit이 그 사이 삭제되었으면 NotFound.
    pub fn commit_unit_embedding(&self, unit_id: &str, vector: &[f32]) -> Result<()> {
        check_dimension(vector, self.dimension)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        ensure_unit(&tx, unit_id)?;

        tx.execute(
            "INSERT OR REPLACE INTO unit_embeddings (unit_id, vector) VALUES (?1, ?2)",
            params![unit_id, encode_vector(vector)],
        )?;
        tx.execute("UPDATE text_units SET embedded = 1 WHERE id = ?1", params![unit_id])?;
        tx.commit()?;
        Ok(())
    }

    /// TextUnit 추출 결과 커밋 (원자적)
    ///
    /// 이전 추출 결과(mention, 관계)를 대체합니다. 엔티티는 정규화 키로 병합됩니다.
    pub fn commit_unit_extraction(&self, unit_id: &str, extraction: &Extraction) -> Result<ExtractionCommit> {
        let extraction = extraction.clone().normalized();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        ensure_unit(&tx, unit_id)?;

        tx.execute("DELETE FROM mentions WHERE unit_id = ?1", params![unit_id])?;
        tx.execute("DELETE FROM relations WHERE unit_id = ?1", params![unit_id])?;

        let mut commit = ExtractionCommit::default();
        for name in &extraction.entities {
            let key = normalize_entity(name);
            commit.entities_created += tx.execute(
                "INSERT OR IGNORE INTO entities (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![key, name, now],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO mentions (unit_id, entity_id) VALUES (?1, ?2)",
                params![unit_id, key],
            )?;
        }

        for triple in &extraction.triples {
            commit.relations += tx.execute(
                "INSERT OR IGNORE INTO relations (source, target, relation, unit_id, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    normalize_entity(&triple.subject),
                    normalize_entity(&triple.object),
                    triple.predicate,
                    unit_id,
                    f64::from(triple.confidence)
                ],
            )?;
        }

        tx.execute("UPDATE text_units SET extracted = 1 WHERE id = ?1", params![unit_id])?;
        tx.execute(PRUNE_ENTITIES, [])?;
        tx.commit()?;

        Ok(commit)
    }

    /// 임베딩이 없는 엔티티 (생성 순)
    pub fn entities_missing_embedding(&self) -> Result<Vec<Entity>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT e.id, e.name FROM entities e
             LEFT JOIN entity_embeddings x ON x.entity_id = e.id
             WHERE x.entity_id IS NULL
             ORDER BY e.rowid",
        )?;
        let entities = stmt
            .query_map([], |row| {
                Ok(Entity {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entities)
    }

    /// 엔티티 임베딩 커밋. 엔티티가 그 사이 정리되었으면 NotFound
    pub fn commit_entity_embedding(&self, entity_id: &str, vector: &[f32]) -> Result<()> {
        check_dimension(vector, self.dimension)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM entities WHERE id = ?1)",
            params![entity_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(LpmmError::NotFound(format!("entity {}", entity_id)));
        }

        tx.execute(
            "INSERT OR REPLACE INTO entity_embeddings (entity_id, vector) VALUES (?1, ?2)",
            params![entity_id, encode_vector(vector)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// 엔티티에 인접한 관계 엣지 (정규화 키)
    pub fn neighbors(&self, entity_id: &str) -> Result<Vec<RelationEdge>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT source, target, relation, unit_id, confidence FROM relations
             WHERE source = ?1 OR target = ?1 ORDER BY id",
        )?;
        let edges = stmt
            .query_map(params![entity_id], map_relation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    // ------------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------------

    /// 문서 삭제 (TextUnit, 임베딩, mention, 관계를 함께 삭제하고 고아 엔티티 정리)
    ///
    /// 문서 하나당 한 트랜잭션이므로 중간 상태가 보이지 않습니다.
    pub fn delete_documents(&self, ids: &[String]) -> Result<DeleteReport> {
        let mut conn = self.lock()?;
        let mut report = DeleteReport::default();

        for id in ids {
            let tx = conn.transaction()?;

            let units: i64 = tx.query_row(
                "SELECT COUNT(*) FROM text_units WHERE document_id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            let relations: i64 = tx.query_row(
                "SELECT COUNT(*) FROM relations
                 WHERE unit_id IN (SELECT id FROM text_units WHERE document_id = ?1)",
                params![id],
                |row| row.get(0),
            )?;

            let deleted = tx.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
            if deleted == 0 {
                report.missing.push(id.clone());
                continue;
            }

            let pruned = tx.execute(PRUNE_ENTITIES, [])?;
            tx.commit()?;

            report.documents += 1;
            report.units += units as usize;
            report.relations += relations as usize;
            report.entities += pruned;
            tracing::info!("Deleted document {} ({} units)", id, units);
        }

        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Snapshot, Stats, Backup
    // ------------------------------------------------------------------------

    /// 현재 상태를 한 읽기 트랜잭션에서 읽어 스냅샷 구성
    pub fn load_snapshot(&self, version: u64) -> Result<KnowledgeSnapshot> {
        let data = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let data = read_snapshot_data(&tx)?;
            tx.commit()?;
            data
        };
        KnowledgeSnapshot::build(data, self.dimension, version)
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        Ok(StoreStats {
            document_count: count("SELECT COUNT(*) FROM documents")?,
            unit_count: count("SELECT COUNT(*) FROM text_units")?,
            embedded_units: count("SELECT COUNT(*) FROM text_units WHERE embedded = 1")?,
            complete_units: count("SELECT COUNT(*) FROM text_units WHERE embedded = 1 AND extracted = 1")?,
            entity_count: count("SELECT COUNT(*) FROM entities")?,
            embedded_entities: count("SELECT COUNT(*) FROM entity_embeddings")?,
            relation_count: count("SELECT COUNT(*) FROM relations")?,
            embedding_dimension: self.dimension,
            db_path: self.db_path.clone(),
        })
    }

    /// 일관된 복사본을 `target`에 기록 (VACUUM INTO)
    ///
    /// 대상 파일이 이미 있으면 실패합니다.
    pub fn backup_to(&self, target: &Path) -> Result<()> {
        if target.exists() {
            return Err(LpmmError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("backup target {:?} already exists", target),
            )));
        }
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = self.lock()?;
        conn.execute("VACUUM INTO ?1", params![target.to_string_lossy().to_string()])?;
        tracing::info!("Backed up knowledge base to {:?}", target);
        Ok(())
    }

    /// DB 파일에 기록된 임베딩 차원 (열지 않은 파일 대상)
    pub fn recorded_dimension(path: &Path) -> Result<Option<usize>> {
        if !path.is_file() {
            return Err(LpmmError::NotFound(format!("database file {:?}", path)));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        read_dimension(&conn)
    }

    /// 백업 파일 내용으로 현재 DB를 교체 (SQLite backup API)
    ///
    /// 백업의 차원이 저장소 차원과 다르면 아무것도 바꾸지 않고 ConfigMismatch입니다.
    /// 열려 있는 커넥션을 통해 페이지를 덮어쓰므로 WAL 파일과 어긋나지 않습니다.
    pub fn restore_from(&self, source: &Path) -> Result<()> {
        match Self::recorded_dimension(source)? {
            Some(dim) if dim == self.dimension => {}
            Some(dim) => {
                return Err(LpmmError::ConfigMismatch(format!(
                    "backup {:?} was built with dimension {}, configured dimension is {}",
                    source, dim, self.dimension
                )));
            }
            None => {
                return Err(LpmmError::ConfigMismatch(format!(
                    "backup {:?} has no recorded embedding dimension",
                    source
                )));
            }
        }

        let mut conn = self.lock()?;
        conn.restore(DatabaseName::Main, source, None::<fn(Progress)>)?;
        tracing::info!("Restored knowledge base from {:?}", source);
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn read_dimension(conn: &Connection) -> Result<Option<usize>> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'embedding_dimension'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    stored
        .map(|value| {
            value.parse::<usize>().map_err(|_| {
                LpmmError::ConfigMismatch(format!("stored embedding dimension is invalid: {}", value))
            })
        })
        .transpose()
}

fn ensure_unit(tx: &Transaction<'_>, unit_id: &str) -> Result<()> {
    let exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM text_units WHERE id = ?1)",
        params![unit_id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(LpmmError::NotFound(format!("text unit {}", unit_id)))
    }
}

fn read_snapshot_data(tx: &Transaction<'_>) -> Result<SnapshotData> {
    let mut data = SnapshotData::default();

    let mut stmt = tx.prepare(
        "SELECT seq, id, document_id, ordinal, content, embedded, extracted
         FROM text_units ORDER BY seq",
    )?;
    data.units = stmt
        .query_map([], map_stored_unit)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    data.unit_vectors = read_vectors(
        tx,
        "SELECT e.unit_id, e.vector FROM unit_embeddings e
         JOIN text_units u ON u.id = e.unit_id ORDER BY u.seq",
    )?;

    let mut stmt = tx.prepare("SELECT id, name FROM entities ORDER BY rowid")?;
    data.entities = stmt
        .query_map([], |row| {
            Ok(Entity {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    data.entity_vectors = read_vectors(
        tx,
        "SELECT x.entity_id, x.vector FROM entity_embeddings x
         JOIN entities e ON e.id = x.entity_id ORDER BY e.rowid",
    )?;

    let mut stmt = tx.prepare("SELECT unit_id, entity_id FROM mentions")?;
    data.mentions = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = tx.prepare(
        "SELECT source, target, relation, unit_id, confidence FROM relations ORDER BY id",
    )?;
    data.relations = stmt
        .query_map([], map_relation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(data)
}

fn read_vectors(tx: &Transaction<'_>, sql: &str) -> Result<Vec<(String, Vec<f32>)>> {
    let mut stmt = tx.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(id, blob)| Ok((id, decode_vector(&blob)?)))
        .collect()
}

fn map_stored_unit(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredUnit> {
    Ok(StoredUnit {
        seq: row.get(0)?,
        unit: TextUnit {
            id: row.get(1)?,
            document_id: row.get(2)?,
            ordinal: row.get::<_, i64>(3)? as usize,
            content: row.get(4)?,
        },
        embedded: row.get(5)?,
        extracted: row.get(6)?,
    })
}

fn map_relation(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelationEdge> {
    Ok(RelationEdge {
        source: row.get(0)?,
        target: row.get(1)?,
        relation: row.get(2)?,
        unit_id: row.get(3)?,
        confidence: row.get::<_, f64>(4)? as f32,
    })
}

fn map_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRecord> {
    Ok(DocumentRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        content_hash: row.get(2)?,
        created_at: parse_datetime(row.get::<_, String>(3)?),
        updated_at: parse_datetime(row.get::<_, String>(4)?),
        unit_count: row.get::<_, i64>(5)? as usize,
    })
}

/// RFC3339 문자열을 DateTime<Utc>로 파싱
fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// Tests
// ============================================================================
