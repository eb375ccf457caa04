//! JSONL journal of received transfers, one record per file

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::Utc;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Interrupted,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub peer: String,
    pub file_name: String,
    pub bytes_received: u64,
    pub status: TransferStatus,
}

impl TransferLogEntry {
    pub fn new(peer: &str, file_name: &str, bytes_received: u64, status: TransferStatus) -> Self {
        TransferLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            peer: peer.to_string(),
            file_name: file_name.to_string(),
            bytes_received,
            status,
        }
    }
}

pub struct TransferLog {
    log_file_path: PathBuf,
}

impl TransferLog {
    pub fn new(root: &Path) -> Self {
        let log_file_path = root.join(".drift_transfers.jsonl");
        TransferLog { log_file_path }
    }

    pub fn add_entry(&self, entry: TransferLogEntry) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open transfer journal")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open transfer journal for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: TransferLogEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
