//! Append-only, hash-chained evidence ledger.
//!
//! One JSON record per line. Each record carries a strictly increasing
//! sequence number and the SHA-256 of the previous record's canonical line
//! (64 zero characters for the first). Appends are durable before they
//! return; readers verify the whole chain on open and treat any break as a
//! fatal [`LedgerError::Corrupt`].
//!
//! Single-writer discipline: exactly one [`EvidenceLedger`] instance owns
//! the file; the verify worker serializes appends behind it.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use sightline_core::error::LedgerError;

/// `prev_hash` of the first record.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One verified-accept record.
///
/// Field order is the canonical serialization order; the chain hash is
/// computed over the exact serialized line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub label: String,
    pub embedding: Vec<f32>,
    pub accepted: bool,
    pub timestamp_ms: i64,
    pub sequence: u64,
    pub prev_hash: String,
}

/// SHA-256 hex of a record's canonical line bytes.
pub fn entry_hash(canonical_line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_line.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Writer handle over the ledger file.
pub struct EvidenceLedger {
    file: File,
    path: PathBuf,
    next_sequence: u64,
    last_hash: String,
}

impl std::fmt::Debug for EvidenceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceLedger")
            .field("path", &self.path)
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}

impl EvidenceLedger {
    /// Open (or create) the ledger, replaying and verifying the chain.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LedgerError::io("creating ledger directory", e))?;
            }
        }
        let entries = if path.exists() {
            read_entries(path)?
        } else {
            Vec::new()
        };
        let (next_sequence, last_hash) = match entries.last() {
            Some(last) => {
                let line = serde_json::to_string(last).map_err(|e| LedgerError::BadRecord {
                    line: entries.len(),
                    reason: e.to_string(),
                })?;
                (last.sequence + 1, entry_hash(&line))
            }
            None => (0, GENESIS_HASH.to_string()),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| LedgerError::io("opening ledger for append", e))?;

        info!(
            path = %path.display(),
            entries = entries.len(),
            "evidence ledger opened"
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
            next_sequence,
            last_hash,
        })
    }

    /// Append one record. The file is flushed and synced before return.
    pub fn append(
        &mut self,
        label: &str,
        embedding: Vec<f32>,
        accepted: bool,
        timestamp_ms: i64,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = LedgerEntry {
            label: label.to_string(),
            embedding,
            accepted,
            timestamp_ms,
            sequence: self.next_sequence,
            prev_hash: self.last_hash.clone(),
        };
        let line = serde_json::to_string(&entry).map_err(|e| LedgerError::BadRecord {
            line: self.next_sequence as usize,
            reason: e.to_string(),
        })?;

        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.write_all(b"\n"))
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_all())
            .map_err(|e| LedgerError::io("appending ledger record", e))?;

        self.last_hash = entry_hash(&line);
        self.next_sequence += 1;
        debug!(sequence = entry.sequence, label, "ledger append");
        Ok(entry)
    }

    pub fn len(&self) -> u64 {
        self.next_sequence
    }

    pub fn is_empty(&self) -> bool {
        self.next_sequence == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read and verify every record in the ledger.
///
/// A sequence gap or a `prev_hash` that does not match the previous line's
/// hash is reported against the record whose hashed content diverged.
pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
    let file = File::open(path).map_err(|e| LedgerError::io("opening ledger for read", e))?;
    let reader = BufReader::new(file);

    let mut entries: Vec<LedgerEntry> = Vec::new();
    let mut prev_hash = GENESIS_HASH.to_string();

    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| LedgerError::io("reading ledger line", e))?;
        if line.is_empty() {
            continue;
        }
        let entry: LedgerEntry =
            serde_json::from_str(&line).map_err(|e| LedgerError::BadRecord {
                line: idx,
                reason: e.to_string(),
            })?;

        let expected_seq = entries.len() as u64;
        if entry.sequence != expected_seq {
            return Err(LedgerError::Corrupt {
                sequence: entry.sequence,
                reason: format!("sequence {} where {} expected", entry.sequence, expected_seq),
            });
        }
        if entry.prev_hash != prev_hash {
            // The chain broke: the record whose canonical bytes were hashed
            // into `prev_hash` is the corrupt one.
            let bad_sequence = entry.sequence.saturating_sub(1);
            return Err(LedgerError::Corrupt {
                sequence: bad_sequence,
                reason: "prev_hash mismatch".to_string(),
            });
        }

        prev_hash = entry_hash(&line);
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vec3(a: f32) -> Vec<f32> {
        vec![a, 0.0, 0.0]
    }

    #[test]
    fn appends_chain_and_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let mut ledger = EvidenceLedger::open(&path).unwrap();
        let a = ledger.append("mug", vec3(1.0), true, 1_000).unwrap();
        let b = ledger.append("mug", vec3(0.9), true, 2_000).unwrap();
        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        assert_eq!(a.prev_hash, GENESIS_HASH);

        // b's prev_hash is the hash of a's canonical line.
        let a_line = serde_json::to_string(&a).unwrap();
        assert_eq!(b.prev_hash, entry_hash(&a_line));

        drop(ledger);
        let mut reopened = EvidenceLedger::open(&path).unwrap();
        let c = reopened.append("cup", vec3(0.8), true, 3_000).unwrap();
        assert_eq!(c.sequence, 2);

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].label, "cup");
    }

    #[test]
    fn corrupting_middle_record_is_detected_at_that_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let mut ledger = EvidenceLedger::open(&path).unwrap();
        ledger.append("a", vec3(1.0), true, 1).unwrap();
        ledger.append("b", vec3(0.5), true, 2).unwrap();
        ledger.append("c", vec3(0.25), true, 3).unwrap();
        drop(ledger);

        // Corrupt B's embedding on disk.
        let contents = std::fs::read_to_string(&path).unwrap();
        let tampered = contents.replace("0.5", "0.75");
        assert_ne!(contents, tampered);
        std::fs::write(&path, tampered).unwrap();

        match read_entries(&path) {
            Err(LedgerError::Corrupt { sequence, .. }) => assert_eq!(sequence, 1),
            other => panic!("expected corruption at sequence 1, got {other:?}"),
        }
    }

    #[test]
    fn sequence_gap_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let mut ledger = EvidenceLedger::open(&path).unwrap();
        let a = ledger.append("a", vec3(1.0), true, 1).unwrap();
        drop(ledger);

        // Re-number the only record.
        let mut forged = a.clone();
        forged.sequence = 5;
        std::fs::write(&path, serde_json::to_string(&forged).unwrap() + "\n").unwrap();

        assert!(matches!(
            read_entries(&path),
            Err(LedgerError::Corrupt { sequence: 5, .. })
        ));
    }

    #[test]
    fn garbage_line_is_bad_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        std::fs::write(&path, "not json\n").unwrap();
        assert!(matches!(
            read_entries(&path),
            Err(LedgerError::BadRecord { line: 0, .. })
        ));
    }
}
