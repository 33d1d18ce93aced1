use std::sync::Arc;

use warden_kernel::audit::{
    verify_chain, AuditEntry, AuditSink, ExecutionLogger, FsProbe, JsonlAuditLog, MemoryAuditLog, NullProbe,
    ResourceState, GENESIS_HASH,
};
use warden_kernel::executor::ActionOutcome;
use warden_kernel::{AuditError, Command};

async fn log_one(logger: &ExecutionLogger, command: &Command, outcome: &ActionOutcome) {
    let before = logger.capture_before(command).await.unwrap();
    let after = logger.capture_after(command, outcome).await.unwrap();
    logger
        .log_execution(command, before, after, outcome.success, 1)
        .await
        .unwrap();
}

async fn filled_memory_log(n: usize) -> Arc<MemoryAuditLog> {
    let (logger, audit) = ExecutionLogger::in_memory();
    for i in 0..n {
        let cmd = Command::new("create_file").with_entity("path", format!("file-{i}.txt"));
        log_one(&logger, &cmd, &ActionOutcome::success(serde_json::json!(i))).await;
    }
    audit
}

#[tokio::test]
async fn test_chain_links_every_entry() {
    let audit = filled_memory_log(3).await;
    let entries = audit.snapshot();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].prev_hash, GENESIS_HASH);
    for pair in entries.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].hash);
        assert_eq!(pair[1].sequence, pair[0].sequence + 1);
    }
    assert!(audit.verify_integrity().is_ok());
}

#[tokio::test]
async fn test_tampering_is_detected() {
    let audit = filled_memory_log(3).await;

    let mut edited = audit.snapshot();
    edited[1].record.success = false;
    assert_eq!(verify_chain(&edited), Err(AuditError::IntegrityViolation(1)));

    let mut dropped = audit.snapshot();
    dropped.remove(1);
    assert!(verify_chain(&dropped).is_err());

    let mut reordered = audit.snapshot();
    reordered.swap(0, 2);
    assert_eq!(verify_chain(&reordered), Err(AuditError::IntegrityViolation(2)));
}

#[tokio::test]
async fn test_jsonl_log_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");

    {
        let sink = Arc::new(JsonlAuditLog::open(&path).await.unwrap());
        let logger = ExecutionLogger::new(Arc::new(NullProbe), sink.clone());
        log_one(&logger, &Command::new("get_time"), &ActionOutcome::success("12:00")).await;
        log_one(&logger, &Command::new("status"), &ActionOutcome::failure("offline")).await;
        assert_eq!(sink.entries().await.unwrap().len(), 2);
    }

    let reopened = Arc::new(JsonlAuditLog::open(&path).await.unwrap());
    let logger = ExecutionLogger::new(Arc::new(NullProbe), reopened.clone());
    log_one(&logger, &Command::new("help"), &ActionOutcome::success("usage")).await;

    let entries = JsonlAuditLog::read_entries(&path).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2].sequence, 2);
    assert!(verify_chain(&entries).is_ok());
    assert!(!entries[1].record.success);
    assert_eq!(entries[1].record.error.as_deref(), Some("offline"));
}

#[tokio::test]
async fn test_jsonl_tampering_refuses_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    {
        let sink = Arc::new(JsonlAuditLog::open(&path).await.unwrap());
        let logger = ExecutionLogger::new(Arc::new(NullProbe), sink);
        log_one(&logger, &Command::new("get_time"), &ActionOutcome::success("12:00")).await;
        log_one(&logger, &Command::new("status"), &ActionOutcome::success("ok")).await;
    }

    let mut entries = JsonlAuditLog::read_entries(&path).await.unwrap();
    entries[0].record.intent = "shutdown_system".into();
    let body: String = entries
        .iter()
        .map(|e: &AuditEntry| format!("{}\n", serde_json::to_string(e).unwrap()))
        .collect();
    tokio::fs::write(&path, body).await.unwrap();

    assert!(matches!(
        JsonlAuditLog::open(&path).await,
        Err(AuditError::IntegrityViolation(0))
    ));
}

#[tokio::test]
async fn test_missing_jsonl_is_an_empty_log() {
    let dir = tempfile::tempdir().unwrap();
    let entries = JsonlAuditLog::read_entries(&dir.path().join("absent.jsonl")).await.unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn test_records_flag_irreversible_steps() {
    let (logger, audit) = ExecutionLogger::in_memory();
    let overwrite = Command::new("modify_file").with_entity("path", "notes.txt");
    log_one(&logger, &overwrite, &ActionOutcome::success("written")).await;
    let read = Command::new("read_file").with_entity("path", "notes.txt");
    log_one(&logger, &read, &ActionOutcome::success("contents")).await;

    let records = audit.records();
    assert!(records[0].rollback.irreversible);
    assert!(records[0].rollback.instructions.is_empty());
    assert!(records[0].rollback.note.is_some());
    assert!(!records[1].rollback.irreversible);
    assert!(records[1].rollback.instructions.is_empty());
}

#[tokio::test]
async fn test_fs_probe_sees_before_and_after() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("created.txt");
    let target_str = target.to_string_lossy().to_string();
    let logger = ExecutionLogger::new(Arc::new(FsProbe), Arc::new(MemoryAuditLog::new()));

    let cmd = Command::new("create_file").with_entity("path", target_str.clone());
    let before = logger.capture_before(&cmd).await.unwrap();
    assert_eq!(before.resources[&target_str], ResourceState::Absent);

    tokio::fs::write(&target, b"hello").await.unwrap();
    let after = logger.capture_after(&cmd, &ActionOutcome::success("ok")).await.unwrap();
    assert!(matches!(after.resources[&target_str], ResourceState::Present { .. }));

    let record = logger.log_execution(&cmd, before, after, true, 3).await.unwrap();
    assert_eq!(record.rollback.instructions[0].intent, "delete_file");
    assert_eq!(record.execution_time_ms, 3);
}
