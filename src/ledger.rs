//! Append-only CSV ledger of terminal outcomes, one row per work item.
//!
//! The whole file is read at open to build the skip-set used for resume;
//! afterwards rows are only appended, each flushed before `append` returns.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::brain::Metrics;
use crate::state_machine::{Candidate, FailureReason, JobOutcome};

/// Header of every ledger file; `alpha` is the key column.
pub const COLUMNS: [&str; 7] = [
    "alpha", "sharpe", "turnover", "fitness", "returns", "drawdown", "margin",
];

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One terminal record. `margin` carries a failure sentinel when the
/// numeric fields are unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    #[serde(rename = "alpha")]
    pub candidate: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub sharpe: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub turnover: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub fitness: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub returns: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub drawdown: Option<f64>,
    pub margin: Option<String>,
}

impl ResultRow {
    pub fn succeeded(candidate: &Candidate, metrics: &Metrics) -> Self {
        Self {
            candidate: candidate.as_str().to_string(),
            sharpe: metrics.sharpe,
            turnover: metrics.turnover,
            fitness: metrics.fitness,
            returns: metrics.returns,
            drawdown: metrics.drawdown,
            margin: metrics.margin.map(|m| m.to_string()),
        }
    }

    pub fn failed(candidate: &Candidate, reason: &FailureReason) -> Self {
        Self {
            candidate: candidate.as_str().to_string(),
            sharpe: None,
            turnover: None,
            fitness: None,
            returns: None,
            drawdown: None,
            margin: Some(reason.to_string()),
        }
    }

    pub fn from_outcome(candidate: &Candidate, outcome: &JobOutcome) -> Self {
        match outcome {
            JobOutcome::Succeeded(metrics) => Self::succeeded(candidate, metrics),
            JobOutcome::Failed(reason) => Self::failed(candidate, reason),
        }
    }

    /// The sentinel in `margin`, if this row records a failure.
    pub fn failure_sentinel(&self) -> Option<&str> {
        self.margin
            .as_deref()
            .filter(|m| m.starts_with("FAILED:") || m.starts_with("FIX_FAIL"))
    }
}

/// Ledger file for a source: `<output_dir>/<stem>_backtest.csv`.
pub fn ledger_path(output_dir: &Path, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "alphas".to_string());
    output_dir.join(format!("{stem}_backtest.csv"))
}

pub struct ResultLedger {
    path: PathBuf,
    finished: HashSet<String>,
    writer: csv::Writer<File>,
}

impl ResultLedger {
    /// Open (or create) a ledger, loading every recorded candidate.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let mut len = file.metadata()?.len();
        if len > 0 && !ends_with_newline(&mut file)? {
            // A row cut short by a crash is dropped so its candidate runs again.
            len = truncate_partial_tail(&mut file)?;
            warn!(path = %path.display(), "dropped an unterminated ledger row");
        }

        let finished = if len > 0 {
            read_recorded(&path)?
        } else {
            HashSet::new()
        };

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if len == 0 {
            writer.write_record(COLUMNS)?;
            writer.flush()?;
        }

        debug!(path = %path.display(), recorded = finished.len(), "ledger opened");
        Ok(Self {
            path,
            finished,
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, candidate: &Candidate) -> bool {
        self.finished.contains(candidate.as_str())
    }

    pub fn len(&self) -> usize {
        self.finished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finished.is_empty()
    }

    /// Append and flush a row. A candidate already on record is not written
    /// again and `false` is returned.
    pub fn append(&mut self, row: &ResultRow) -> Result<bool, LedgerError> {
        if self.finished.contains(&row.candidate) {
            warn!(candidate = %row.candidate, "ledger already holds a row for this candidate");
            return Ok(false);
        }
        self.writer.serialize(row)?;
        self.writer.flush()?;
        self.finished.insert(row.candidate.clone());
        Ok(true)
    }
}

fn ends_with_newline(file: &mut File) -> Result<bool, std::io::Error> {
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Cut the file back to its last newline; returns the new length.
fn truncate_partial_tail(file: &mut File) -> Result<u64, std::io::Error> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1) as u64;
    file.set_len(keep)?;
    Ok(keep)
}

fn read_recorded(path: &Path) -> Result<HashSet<String>, LedgerError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let key = reader
        .headers()?
        .iter()
        .position(|h| h == COLUMNS[0])
        .unwrap_or(0);

    let mut recorded = HashSet::new();
    for (line, record) in reader.records().enumerate() {
        match record {
            Ok(record) => {
                if let Some(candidate) = record.get(key).filter(|c| !c.is_empty()) {
                    recorded.insert(candidate.to_string());
                }
            }
            Err(e) => warn!(path = %path.display(), line = line + 2, error = %e, "skipping unreadable ledger row"),
        }
    }
    Ok(recorded)
}

/// Aggregate view of a ledger file.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSummary {
    pub path: PathBuf,
    pub rows: usize,
    pub succeeded: usize,
    pub failures: BTreeMap<String, usize>,
    pub best: Option<BestRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BestRow {
    pub alpha: String,
    pub fitness: f64,
    pub sharpe: Option<f64>,
}

pub fn summarize(path: &Path) -> Result<LedgerSummary, LedgerError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let mut summary = LedgerSummary {
        path: path.to_path_buf(),
        rows: 0,
        succeeded: 0,
        failures: BTreeMap::new(),
        best: None,
    };

    for row in reader.deserialize::<ResultRow>() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable ledger row");
                continue;
            }
        };
        summary.rows += 1;

        if let Some(sentinel) = row.failure_sentinel() {
            *summary.failures.entry(sentinel.to_string()).or_insert(0) += 1;
            continue;
        }
        summary.succeeded += 1;

        if let Some(fitness) = row.fitness {
            let better = summary.best.as_ref().is_none_or(|b| fitness > b.fitness);
            if better {
                summary.best = Some(BestRow {
                    alpha: row.candidate,
                    fitness,
                    sharpe: row.sharpe,
                });
            }
        }
    }
    Ok(summary)
}
