//! Append-only transaction log.
//!
//! One JSON object per line in `{data_dir}/version-2/log.1`. The log is a
//! write-only audit trail: it is never replayed on startup.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::tree::CreateMode;

/// Directory under the data dir that holds log files.
pub const LOG_DIR_NAME: &str = "version-2";

/// Log file name.
pub const LOG_FILE_NAME: &str = "log.1";

/// One logged mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnEntry {
    pub zxid: i64,
    pub session_id: i64,
    pub op: TxnOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TxnOp {
    CreateSession { timeout_ms: u64 },
    CloseSession { removed: Vec<String> },
    Create { path: String, data: String, mode: CreateMode },
    SetData { path: String, data: String, version: i32 },
    Delete { path: String },
}

/// Writer for the transaction log file.
#[derive(Debug)]
pub struct TxnLog {
    path: PathBuf,
    writer: BufWriter<File>,
    entries: u64,
}

impl TxnLog {
    /// Open (creating if needed) `{data_dir}/version-2/log.1` for appending.
    pub fn open(data_dir: &Path) -> io::Result<Self> {
        let dir = data_dir.join(LOG_DIR_NAME);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            entries: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries appended through this writer.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Append one entry and flush it to the OS.
    pub fn append(&mut self, entry: &TxnEntry) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.entries += 1;
        Ok(())
    }

    /// Flush and fsync.
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}

/// Read every entry of a log file (diagnostics and tests).
pub fn read_entries(path: &Path) -> io::Result<Vec<TxnEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_version_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log = TxnLog::open(dir.path()).unwrap();
        assert_eq!(log.path(), dir.path().join("version-2").join("log.1"));
        assert!(log.path().exists());
        assert_eq!(log.entries(), 0);
    }

    #[test]
    fn appended_entries_are_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TxnLog::open(dir.path()).unwrap();
        let create = TxnEntry {
            zxid: 1,
            session_id: 42,
            op: TxnOp::Create {
                path: "/brokers".to_owned(),
                data: String::new(),
                mode: CreateMode::Persistent,
            },
        };
        let delete = TxnEntry {
            zxid: 2,
            session_id: 42,
            op: TxnOp::Delete {
                path: "/brokers".to_owned(),
            },
        };
        log.append(&create).unwrap();
        log.append(&delete).unwrap();
        log.sync().unwrap();
        assert_eq!(log.entries(), 2);

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.lines().next().unwrap().contains(r#""type":"create""#));

        let entries = read_entries(log.path()).unwrap();
        assert_eq!(entries, vec![create, delete]);
    }

    #[test]
    fn reopen_appends_instead_of_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let entry = TxnEntry {
            zxid: 0,
            session_id: 1,
            op: TxnOp::CreateSession { timeout_ms: 6000 },
        };
        TxnLog::open(dir.path()).unwrap().append(&entry).unwrap();
        let mut log = TxnLog::open(dir.path()).unwrap();
        log.append(&entry).unwrap();
        assert_eq!(read_entries(log.path()).unwrap().len(), 2);
    }
}
