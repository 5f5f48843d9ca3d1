use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use sg_core::types::{ApprovalRecord, GateKey, RunId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("record {seq} for run {run_id} is not after {last}")]
    OutOfOrder { run_id: RunId, seq: u64, last: u64 },
    #[error("history io: {0}")]
    Io(#[from] std::io::Error),
    #[error("history line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("history encode: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HistoryError>;

// ---------------------------------------------------------------------------
// ApprovalHistory
// ---------------------------------------------------------------------------

/// Append-only log of closed gates.
///
/// Within one run, records must arrive in strictly increasing sequence order.
/// When opened on a file, every append is written as one JSON line before it
/// becomes visible in memory.
#[derive(Debug, Default)]
pub struct ApprovalHistory {
    records: Vec<ApprovalRecord>,
    last_seq: HashMap<RunId, u64>,
    path: Option<PathBuf>,
}

impl ApprovalHistory {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or create) a JSON-lines history file and load what it holds.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        // Replayed records must not be written back, so the path is set last.
        let mut history = Self::default();
        if path.exists() {
            for record in Self::read_jsonl(&path)? {
                history.append(record)?;
            }
        } else if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        history.path = Some(path);
        Ok(history)
    }

    fn read_jsonl(path: &Path) -> Result<Vec<ApprovalRecord>> {
        let reader = BufReader::new(fs::File::open(path)?);
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| HistoryError::Parse {
                line: index + 1,
                source,
            })?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn append(&mut self, record: ApprovalRecord) -> Result<()> {
        let last = self.last_seq.get(&record.run_id).copied().unwrap_or(0);
        if record.seq <= last {
            return Err(HistoryError::OutOfOrder {
                run_id: record.run_id,
                seq: record.seq,
                last,
            });
        }
        if let Some(path) = &self.path {
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(line.as_bytes())?;
        }
        tracing::debug!(
            gate = %record.gate,
            run_id = %record.run_id,
            seq = record.seq,
            decision = %record.decision,
            "approval recorded"
        );
        self.last_seq.insert(record.run_id, record.seq);
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[ApprovalRecord] {
        &self.records
    }

    pub fn for_gate<'a>(&'a self, gate: &'a GateKey) -> impl Iterator<Item = &'a ApprovalRecord> {
        self.records.iter().filter(move |r| &r.gate == gate)
    }

    pub fn for_run(&self, run_id: RunId) -> impl Iterator<Item = &ApprovalRecord> {
        self.records.iter().filter(move |r| r.run_id == run_id)
    }

    /// Highest sequence number committed for `run_id`.
    pub fn last_seq(&self, run_id: RunId) -> u64 {
        self.last_seq.get(&run_id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
