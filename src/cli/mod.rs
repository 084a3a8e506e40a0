//! CLI 모듈
//!
//! lpmm CLI 명령어 정의 및 구현

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::collector::{CollectorConfig, DocumentCollector};
use crate::config::{LpmmConfig, DEFAULT_CONFIG_FILE};
use crate::knowledge::{BackupManager, ImportReport, KnowledgeBase, KnowledgeStore, SourceDocument};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "lpmm")]
#[command(version, about = "LPMM 하이브리드 지식 검색 (벡터 + 지식 그래프)", long_about = None)]
pub struct Cli {
    /// 설정 파일 경로 (없으면 기본값 사용)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 기본 설정 파일 생성
    Init {
        /// 기존 파일 덮어쓰기
        #[arg(long)]
        force: bool,
    },

    /// 텍스트, 파일, 또는 폴더를 지식베이스로 가져오기
    Import {
        /// 직접 입력할 텍스트
        #[arg(short, long)]
        text: Option<String>,

        /// 텍스트 문서 ID (생략하면 내용 해시)
        #[arg(long, requires = "text")]
        id: Option<String>,

        /// 가져올 파일 경로
        #[arg(long)]
        file: Option<PathBuf>,

        /// 가져올 폴더 경로 (재귀)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// 특정 확장자만 가져오기 (쉼표 구분)
        #[arg(long, value_delimiter = ',')]
        ext: Vec<String>,

        /// 하나라도 실패하면 오류로 종료
        #[arg(long)]
        strict: bool,
    },

    /// 지식베이스 검색
    Query {
        /// 검색 쿼리
        query: String,

        /// 검색 과정 출력
        #[arg(long)]
        trace: bool,
    },

    /// 저장된 문서 목록
    List {
        /// 결과 개수 제한
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// 문서 삭제 (TextUnit, 관계, 고아 엔티티 포함)
    Delete {
        /// 삭제할 문서 ID
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// 임베딩/추출이 빠진 TextUnit 재처리
    Repair,

    /// 백업 관리
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// 상태 확인
    Status,
}

/// 백업 하위 명령어
#[derive(Subcommand)]
pub enum BackupAction {
    /// 백업 생성 (경로를 주면 그 파일로 내보내기)
    Create {
        /// 내보낼 파일 경로 (존재하면 안 됨)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// 백업 목록
    List,

    /// 백업으로 지식베이스 복원
    Restore {
        /// 백업 ID
        id: String,
    },

    /// 백업 삭제
    Delete {
        /// 백업 ID
        id: String,
    },
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Init { force } = cli.command {
        return cmd_init(&cli.config, force);
    }

    let config = LpmmConfig::load_or_default(&cli.config)
        .with_context(|| format!("설정 로드 실패: {:?}", cli.config))?;

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Import {
            text,
            id,
            file,
            dir,
            ext,
            strict,
        } => cmd_import(config, text, id, file, dir, ext, strict).await,
        Commands::Query { query, trace } => cmd_query(config, &query, trace).await,
        Commands::List { limit } => cmd_list(&config, limit),
        Commands::Delete { ids } => cmd_delete(&config, &ids),
        Commands::Repair => cmd_repair(config).await,
        Commands::Backup { action } => cmd_backup(&config, action),
        Commands::Status => cmd_status(&cli.config, &config),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 설정 파일 생성 (init)
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("설정 파일이 이미 존재합니다: {:?} (--force로 덮어쓰기)", path);
    }

    let content = toml::to_string_pretty(&LpmmConfig::default()).context("설정 직렬화 실패")?;
    std::fs::write(path, content).with_context(|| format!("설정 파일 쓰기 실패: {:?}", path))?;

    println!("[OK] 설정 파일 생성: {}", path.display());
    Ok(())
}

/// 가져오기 명령어 (import)
///
/// Ctrl-C를 누르면 새 작업 예약을 멈추고, 이미 커밋된 TextUnit은 유지합니다.
async fn cmd_import(
    config: LpmmConfig,
    text: Option<String>,
    id: Option<String>,
    file: Option<PathBuf>,
    dir: Option<PathBuf>,
    ext: Vec<String>,
    strict: bool,
) -> Result<()> {
    let documents = if let Some(text) = text {
        let doc = SourceDocument::new(String::new(), text);
        let id = id.unwrap_or_else(|| format!("text://{}", &doc.content_hash()[..16]));
        vec![SourceDocument { id, ..doc }]
    } else {
        let collector = DocumentCollector::new(CollectorConfig {
            extensions: ext,
            ..Default::default()
        });
        if let Some(ref file_path) = file {
            vec![collector.collect_file(file_path)?]
        } else if let Some(ref dir_path) = dir {
            collector.collect_directory(dir_path)?
        } else {
            bail!("--text, --file, --dir 중 하나를 지정해야 합니다");
        }
    };

    if documents.is_empty() {
        println!("[!] 가져올 문서가 없습니다.");
        return Ok(());
    }

    let kb = KnowledgeBase::open(config).context("지식베이스 초기화 실패")?;
    println!("[*] {} 문서 가져오는 중...", documents.len());

    let cancel = cancel_on_ctrl_c();
    let report = kb
        .import_corpus(&documents, &cancel)
        .await
        .context("가져오기 실패")?;

    print_report(&report);
    if strict {
        report.ensure_complete().context("일부 TextUnit 처리 실패")?;
    }
    Ok(())
}

/// 검색 명령어 (query)
async fn cmd_query(config: LpmmConfig, query: &str, trace: bool) -> Result<()> {
    let kb = KnowledgeBase::open(config).context("지식베이스 초기화 실패")?;
    println!("[*] 검색 중 ({} 모드): \"{}\"", kb.mode(), query);

    let outcome = kb.query_detailed(query).await.context("검색 실패")?;

    if trace {
        println!("{}", serde_json::to_string_pretty(&outcome.trace)?);
    }

    if outcome.passages.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", outcome.passages.len());
    for (i, passage) in outcome.passages.iter().enumerate() {
        println!(
            "{}. [점수: {:.4}] (벡터: {}, 그래프: {})",
            i + 1,
            passage.score,
            format_component(passage.vector_score),
            format_component(passage.graph_score)
        );
        println!("   문서: {} #{}", passage.unit.document_id, passage.unit.ordinal);
        println!("   내용: {}", truncate_text(&passage.unit.content, 200));
        println!();
    }

    Ok(())
}

/// 목록 명령어 (list)
fn cmd_list(config: &LpmmConfig, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let docs = store.list_documents(limit).context("문서 목록 조회 실패")?;

    if docs.is_empty() {
        println!("[!] 저장된 문서가 없습니다.");
        return Ok(());
    }

    println!("[OK] 저장된 문서 ({} 건):\n", docs.len());
    for doc in docs {
        let title = doc
            .title
            .as_ref()
            .map(|t| truncate_text(t, 40))
            .unwrap_or_else(|| "-".to_string());
        println!("  {}", doc.id);
        println!(
            "        {} | {} units | {}",
            title,
            doc.unit_count,
            doc.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

/// 삭제 명령어 (delete)
fn cmd_delete(config: &LpmmConfig, ids: &[String]) -> Result<()> {
    let store = open_store(config)?;
    let report = store.delete_documents(ids).context("문서 삭제 실패")?;

    println!(
        "[OK] 문서 {} 건 삭제 (TextUnit {}, 관계 {}, 엔티티 {})",
        report.documents, report.units, report.relations, report.entities
    );
    for id in &report.missing {
        println!("[!] 문서를 찾을 수 없습니다: {}", id);
    }
    Ok(())
}

/// 복구 명령어 (repair)
async fn cmd_repair(config: LpmmConfig) -> Result<()> {
    let kb = KnowledgeBase::open(config).context("지식베이스 초기화 실패")?;
    println!("[*] 미완료 TextUnit 재처리 중...");

    let report = kb.repair(&cancel_on_ctrl_c()).await.context("복구 실패")?;
    print_report(&report);
    Ok(())
}

/// 백업 명령어 (backup)
fn cmd_backup(config: &LpmmConfig, action: BackupAction) -> Result<()> {
    let manager = BackupManager::from_config(&config.storage);

    match action {
        BackupAction::Create { path: Some(path) } => {
            let store = open_store(config)?;
            store
                .backup_to(&path)
                .with_context(|| format!("백업 실패: {:?}", path))?;
            println!("[OK] 백업 완료: {}", path.display());
        }
        BackupAction::Create { path: None } => {
            let store = open_store(config)?;
            let info = manager.create(&store).context("백업 실패")?;
            println!("[OK] 백업 완료: {} ({})", info.id, format_bytes(info.size_bytes as usize));
            println!("     {}", info.path.display());
        }
        BackupAction::List => {
            let backups = manager.list().context("백업 목록 조회 실패")?;
            if backups.is_empty() {
                println!("[!] 백업이 없습니다: {}", manager.dir().display());
                return Ok(());
            }
            println!("[OK] 백업 ({} 건):\n", backups.len());
            for info in backups {
                println!(
                    "  {}  {}  {}",
                    info.id,
                    info.created_at.format("%Y-%m-%d %H:%M:%S"),
                    format_bytes(info.size_bytes as usize)
                );
            }
        }
        BackupAction::Restore { id } => {
            let store = open_store(config)?;
            manager
                .restore(&store, &id)
                .with_context(|| format!("복원 실패: {}", id))?;
            println!("[OK] 복원 완료: {}", id);
        }
        BackupAction::Delete { id } => {
            manager
                .delete(&id)
                .with_context(|| format!("백업 삭제 실패: {}", id))?;
            println!("[OK] 백업 삭제: {}", id);
        }
    }
    Ok(())
}

/// 상태 명령어 (status)
fn cmd_status(config_path: &Path, config: &LpmmConfig) -> Result<()> {
    println!("lpmm v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let kb = &config.lpmm_knowledge;
    if config_path.exists() {
        println!("[*] 설정 파일: {}", config_path.display());
    } else {
        println!("[*] 설정 파일: 없음 (기본값 사용)");
    }
    println!("[*] 모드: {} (PPR: {})", kb.lpmm_mode, if kb.enable_ppr { "on" } else { "off" });
    println!("[*] 임베딩: {:?}, 차원 {}", config.embedding.provider, kb.embedding_dimension);
    println!("[*] 추출: {:?}", config.extraction.provider);
    println!("[*] 데이터 디렉토리: {}", config.storage.data_dir.display());

    match open_store(config).and_then(|store| Ok(store.stats()?)) {
        Ok(stats) => {
            println!("[OK] 문서: {} 건", stats.document_count);
            println!(
                "     TextUnit: {} (임베딩 {}, 완료 {})",
                stats.unit_count, stats.embedded_units, stats.complete_units
            );
            println!(
                "     엔티티: {} (임베딩 {}), 관계: {}",
                stats.entity_count, stats.embedded_entities, stats.relation_count
            );
            if stats.complete_units < stats.unit_count {
                println!("[!] 미완료 TextUnit이 있습니다. `lpmm repair`로 재처리하세요.");
            }
            if let Ok(metadata) = std::fs::metadata(&stats.db_path) {
                println!("     DB 크기: {}", format_bytes(metadata.len() as usize));
            }
        }
        Err(e) => println!("[!] 저장소 열기 실패: {:#}", e),
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn open_store(config: &LpmmConfig) -> Result<KnowledgeStore> {
    let path = config.storage.db_path();
    KnowledgeStore::open(&path, config.lpmm_knowledge.embedding_dimension)
        .with_context(|| format!("저장소 열기 실패: {:?}", path))
}

/// Ctrl-C 수신 시 취소되는 토큰
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n[!] 취소 중... (커밋된 TextUnit은 유지됩니다)");
            token.cancel();
        }
    });
    cancel
}

fn print_report(report: &ImportReport) {
    println!();
    println!(
        "[OK] TextUnit {} 개 (신규 {}, 유지 {}, 제거 {})",
        report.units_total, report.units_created, report.units_unchanged, report.units_removed
    );
    println!(
        "     임베딩 {}, 추출 {}, 엔티티 임베딩 {} ({:.1}s)",
        report.embedded,
        report.extracted,
        report.entities_embedded,
        report.elapsed.as_secs_f64()
    );

    if report.cancelled {
        println!("[!] 취소됨. `lpmm repair`로 나머지를 처리할 수 있습니다.");
    }
    if !report.failures.is_empty() {
        println!("[!] 실패 {} 건:", report.failures.len());
        for failure in report.failures.iter().take(10) {
            println!("    [{:?}] {}: {}", failure.stage, failure.id, truncate_text(&failure.error, 120));
        }
        if report.failures.len() > 10 {
            println!("    ... 외 {} 건", report.failures.len() - 10);
        }
    }
}

fn format_component(value: Option<f32>) -> String {
    value.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".to_string())
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::TextUnit;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_import_and_delete() {
        let cli = Cli::parse_from(["lpmm", "--config", "kb.toml", "import", "--text", "Paris", "--id", "t1"]);
        assert_eq!(cli.config, PathBuf::from("kb.toml"));
        match cli.command {
            Commands::Import { text, id, strict, .. } => {
                assert_eq!(text.as_deref(), Some("Paris"));
                assert_eq!(id.as_deref(), Some("t1"));
                assert!(!strict);
            }
            _ => panic!("expected import"),
        }

        let cli = Cli::parse_from(["lpmm", "delete", "a", "b"]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        match cli.command {
            Commands::Delete { ids } => assert_eq!(ids, vec!["a", "b"]),
            _ => panic!("expected delete"),
        }

        assert!(Cli::try_parse_from(["lpmm", "delete"]).is_err());
        assert!(Cli::try_parse_from(["lpmm", "import", "--id", "x"]).is_err());
    }

    #[test]
    fn test_init_writes_loadable_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lpmm.toml");

        cmd_init(&path, false).unwrap();
        let loaded = LpmmConfig::load(&path).unwrap();
        assert_eq!(loaded, LpmmConfig::default());

        assert!(cmd_init(&path, false).is_err());
        cmd_init(&path, true).unwrap();
    }

    #[test]
    fn test_parse_backup_actions() {
        let cli = Cli::parse_from(["lpmm", "backup", "create"]);
        assert!(matches!(cli.command, Commands::Backup { action: BackupAction::Create { path: None } }));

        let cli = Cli::parse_from(["lpmm", "backup", "create", "--path", "out.db"]);
        match cli.command {
            Commands::Backup { action: BackupAction::Create { path } } => {
                assert_eq!(path, Some(PathBuf::from("out.db")));
            }
            _ => panic!("expected backup create"),
        }

        let cli = Cli::parse_from(["lpmm", "backup", "restore", "20261019_120000_000"]);
        match cli.command {
            Commands::Backup { action: BackupAction::Restore { id } } => assert_eq!(id, "20261019_120000_000"),
            _ => panic!("expected backup restore"),
        }

        assert!(Cli::try_parse_from(["lpmm", "backup", "delete"]).is_err());
    }

    #[test]
    fn test_backup_commands_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = LpmmConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.storage.max_backups = 1;

        let store = open_store(&config).unwrap();
        let doc = SourceDocument::new("doc-a", "Paris is the capital of France");
        let units = vec![TextUnit::new("doc-a", 0, doc.content.clone())];
        store.sync_document_units(&doc, &units).unwrap();
        drop(store);

        cmd_backup(&config, BackupAction::Create { path: None }).unwrap();
        cmd_backup(&config, BackupAction::Create { path: None }).unwrap();
        let manager = BackupManager::from_config(&config.storage);
        let backups = manager.list().unwrap();
        assert_eq!(backups.len(), 1);

        open_store(&config).unwrap().delete_documents(&["doc-a".to_string()]).unwrap();
        cmd_backup(&config, BackupAction::Restore { id: backups[0].id.clone() }).unwrap();
        assert_eq!(open_store(&config).unwrap().stats().unwrap().document_count, 1);

        let export = dir.path().join("export.db");
        cmd_backup(&config, BackupAction::Create { path: Some(export.clone()) }).unwrap();
        assert!(export.exists());

        cmd_backup(&config, BackupAction::Delete { id: backups[0].id.clone() }).unwrap();
        assert!(manager.list().unwrap().is_empty());
        assert!(cmd_backup(&config, BackupAction::Delete { id: backups[0].id.clone() }).is_err());
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
        assert_eq!(truncate_text("안녕하세요 세계", 5), "안녕하세요...");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_format_component() {
        assert_eq!(format_component(Some(0.5)), "0.5000");
        assert_eq!(format_component(None), "-");
    }
}
