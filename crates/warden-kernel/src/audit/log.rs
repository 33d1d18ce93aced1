use super::ExecutionRecord;
use crate::error::AuditError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One hash-chained audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub record: ExecutionRecord,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    fn chain(sequence: u64, record: ExecutionRecord, prev_hash: String) -> Result<Self, AuditError> {
        let hash = compute_hash(sequence, &record, &prev_hash)?;
        Ok(Self {
            sequence,
            record,
            prev_hash,
            hash,
        })
    }
}

fn compute_hash(sequence: u64, record: &ExecutionRecord, prev_hash: &str) -> Result<String, AuditError> {
    let body = serde_json::to_vec(record).map_err(|e| AuditError::WriteFailed(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(&body);
    hasher.update([0]);
    hasher.update(prev_hash.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Checks sequence numbers, back links and hashes of a full chain.
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), AuditError> {
    let mut prev = GENESIS_HASH.to_string();
    for (index, entry) in entries.iter().enumerate() {
        if entry.sequence != index as u64 || entry.prev_hash != prev {
            return Err(AuditError::IntegrityViolation(entry.sequence));
        }
        let expected = compute_hash(entry.sequence, &entry.record, &entry.prev_hash)
            .map_err(|_| AuditError::IntegrityViolation(entry.sequence))?;
        if entry.hash != expected {
            return Err(AuditError::IntegrityViolation(entry.sequence));
        }
        prev.clone_from(&entry.hash);
    }
    Ok(())
}

/// Append-only destination for execution records.
///
/// `append` returns only once the entry is durable for this sink.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: &ExecutionRecord) -> Result<AuditEntry, AuditError>;

    async fn entries(&self) -> Result<Vec<AuditEntry>, AuditError>;
}

/// In-process hash-chained log.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    inner: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.inner.lock().clone()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.inner.lock().iter().map(|e| e.record.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        verify_chain(&self.inner.lock())
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditLog {
    async fn append(&self, record: &ExecutionRecord) -> Result<AuditEntry, AuditError> {
        let mut guard = self.inner.lock();
        let prev_hash = guard
            .last()
            .map_or_else(|| GENESIS_HASH.to_string(), |e| e.hash.clone());
        let entry = AuditEntry::chain(guard.len() as u64, record.clone(), prev_hash)?;
        guard.push(entry.clone());
        Ok(entry)
    }

    async fn entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self.snapshot())
    }
}

/// Hash-chained JSON Lines file, one entry per line, fsynced per append.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    /// (next sequence, last hash)
    head: tokio::sync::Mutex<(u64, String)>,
}

impl JsonlAuditLog {
    /// Opens an existing log (verifying it) or starts a new one.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let entries = Self::read_entries(&path).await?;
        verify_chain(&entries)?;
        let head = entries.last().map_or_else(
            || (0, GENESIS_HASH.to_string()),
            |e| (e.sequence + 1, e.hash.clone()),
        );
        Ok(Self {
            path,
            head: tokio::sync::Mutex::new(head),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every entry; a missing file is an empty log.
    pub async fn read_entries(path: &Path) -> Result<Vec<AuditEntry>, AuditError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AuditError::WriteFailed(format!("{}: {e}", path.display()))),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|_| AuditError::IntegrityViolation(n as u64))
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl AuditSink for JsonlAuditLog {
    async fn append(&self, record: &ExecutionRecord) -> Result<AuditEntry, AuditError> {
        let mut head = self.head.lock().await;
        let entry = AuditEntry::chain(head.0, record.clone(), head.1.clone())?;
        let mut line = serde_json::to_vec(&entry).map_err(|e| AuditError::WriteFailed(e.to_string()))?;
        line.push(b'\n');

        let write_err = |e: std::io::Error| AuditError::WriteFailed(format!("{}: {e}", self.path.display()));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(write_err)?;
        append_or_rewind(&mut file, &line).await.map_err(write_err)?;

        // Only a durable line moves the head.
        *head = (entry.sequence + 1, entry.hash.clone());
        Ok(entry)
    }

    async fn entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        Self::read_entries(&self.path).await
    }
}

/// File operations one append needs.
#[async_trait::async_trait]
trait AppendTarget: Send {
    async fn len(&mut self) -> std::io::Result<u64>;
    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()>;
    async fn sync(&mut self) -> std::io::Result<()>;
    async fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

#[async_trait::async_trait]
impl AppendTarget for tokio::fs::File {
    async fn len(&mut self) -> std::io::Result<u64> {
        Ok(self.metadata().await?.len())
    }

    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.write_all(line).await?;
        self.flush().await
    }

    async fn sync(&mut self) -> std::io::Result<()> {
        self.sync_all().await
    }

    async fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len).await?;
        self.sync_all().await
    }
}

/// Writes and syncs `line`. On failure the file is cut back to its prior
/// length so no torn or unacknowledged line stays in the chain.
async fn append_or_rewind<T: AppendTarget>(target: &mut T, line: &[u8]) -> std::io::Result<()> {
    let len = target.len().await?;
    let written = match target.write_line(line).await {
        Ok(()) => target.sync().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        if let Err(rewind) = target.truncate(len).await {
            tracing::error!(error = %rewind, len, "could not rewind audit log after failed append");
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[derive(Default)]
    struct FlakyFile {
        bytes: Vec<u8>,
        /// Bytes accepted before the write fails
        tear_after: Option<usize>,
        fail_sync: bool,
    }

    #[async_trait::async_trait]
    impl AppendTarget for FlakyFile {
        async fn len(&mut self) -> std::io::Result<u64> {
            Ok(self.bytes.len() as u64)
        }

        async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
            match self.tear_after {
                Some(n) => {
                    self.bytes.extend_from_slice(&line[..n.min(line.len())]);
                    Err(Error::new(ErrorKind::WriteZero, "short write"))
                }
                None => {
                    self.bytes.extend_from_slice(line);
                    Ok(())
                }
            }
        }

        async fn sync(&mut self) -> std::io::Result<()> {
            if self.fail_sync {
                Err(Error::new(ErrorKind::Other, "fsync failed"))
            } else {
                Ok(())
            }
        }

        async fn truncate(&mut self, len: u64) -> std::io::Result<()> {
            self.bytes.truncate(usize::try_from(len).unwrap());
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_sync_removes_the_unacknowledged_line() {
        let mut file = FlakyFile {
            bytes: b"first\n".to_vec(),
            fail_sync: true,
            ..FlakyFile::default()
        };
        assert!(append_or_rewind(&mut file, b"second\n").await.is_err());
        assert_eq!(file.bytes, b"first\n");
    }

    #[tokio::test]
    async fn torn_write_is_cut_back() {
        let mut file = FlakyFile {
            bytes: b"first\n".to_vec(),
            tear_after: Some(3),
            ..FlakyFile::default()
        };
        assert!(append_or_rewind(&mut file, b"second\n").await.is_err());
        assert_eq!(file.bytes, b"first\n");

        file.tear_after = None;
        append_or_rewind(&mut file, b"second\n").await.unwrap();
        assert_eq!(file.bytes, b"first\nsecond\n");
    }
}
