//! Durable engine state
//!
//! Two artifacts: the engine snapshot (position, pending signals, capital,
//! high-water candle time) and the append-only trade ledger. Snapshots are
//! written atomically (temp file + rename) and carry a monotonic sequence
//! number; on load the newest parseable generation wins, so a torn write
//! from a crash can never roll state back silently. The ledger is JSONL —
//! one trade per line — and tolerates a truncated final line from a crash
//! mid-append.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::capital::CapitalState;
use crate::engine::lifecycle::{Position, TradeRecord};
use crate::signal::PendingSignal;

/// One durable record per running bot instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Monotonic write counter; stale generations lose on recovery
    pub seq: u64,
    pub position: Option<Position>,
    pub pending: Vec<PendingSignal>,
    pub capital: CapitalState,
    /// Open time of the last processed candle
    pub last_open_time: Option<DateTime<Utc>>,
}

/// Atomic snapshot writer with one backup generation.
pub struct SnapshotStore {
    path: PathBuf,
    next_seq: u64,
}

impl SnapshotStore {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Resume the sequence from whatever survived on disk
        let next_seq = Self::load_from(path)
            .ok()
            .flatten()
            .map(|s| s.seq + 1)
            .unwrap_or(1);
        Ok(Self {
            path: path.to_path_buf(),
            next_seq,
        })
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".bak");
        PathBuf::from(p)
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".tmp");
        PathBuf::from(p)
    }

    /// Durably write a snapshot. The previous generation is kept as `.bak`
    /// so a crash between rename steps still leaves one valid file.
    pub fn save(&mut self, mut snapshot: EngineSnapshot) -> Result<u64> {
        snapshot.seq = self.next_seq;
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = Self::tmp_path(&self.path);
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        if self.path.exists() {
            fs::rename(&self.path, Self::backup_path(&self.path)).ok();
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to commit {}", self.path.display()))?;

        debug!(seq = snapshot.seq, path = %self.path.display(), "snapshot written");
        self.next_seq += 1;
        Ok(snapshot.seq)
    }

    /// Load the newest valid snapshot, preferring the higher sequence
    /// number between the main file and the backup.
    pub fn load(&self) -> Result<Option<EngineSnapshot>> {
        Self::load_from(&self.path)
    }

    fn load_from(path: &Path) -> Result<Option<EngineSnapshot>> {
        let main = Self::parse_file(path);
        let backup = Self::parse_file(&Self::backup_path(path));

        Ok(match (main, backup) {
            (Some(m), Some(b)) => {
                if b.seq > m.seq {
                    warn!(
                        main_seq = m.seq,
                        backup_seq = b.seq,
                        "main snapshot is stale, recovering from backup"
                    );
                    Some(b)
                } else {
                    Some(m)
                }
            }
            (Some(m), None) => Some(m),
            (None, Some(b)) => {
                warn!(seq = b.seq, "main snapshot unreadable, recovering from backup");
                Some(b)
            }
            (None, None) => None,
        })
    }

    fn parse_file(path: &Path) -> Option<EngineSnapshot> {
        let raw = fs::read(path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unparseable snapshot");
                None
            }
        }
    }
}

/// Append-only JSONL trade history.
pub struct TradeLedger {
    path: PathBuf,
}

impl TradeLedger {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn append(&self, trade: &TradeRecord) -> Result<()> {
        let mut line = serde_json::to_string(trade)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open ledger {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Replay the full ledger. A truncated final line (crash mid-append) is
    /// skipped with a warning; any earlier corruption is an error.
    pub fn replay(&self) -> Result<Vec<TradeRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut trades = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<TradeRecord>(line) {
                Ok(trade) => trades.push(trade),
                Err(e) if i == lines.len() - 1 => {
                    warn!(error = %e, "dropping truncated final ledger line");
                }
                Err(e) => {
                    anyhow::bail!("corrupt ledger line {}: {}", i + 1, e);
                }
            }
        }
        info!(trades = trades.len(), path = %self.path.display(), "ledger replayed");
        Ok(trades)
    }
}
