//! Append-only JSON-lines journal of alert manager transitions.

use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use tw_types::JournalError;

use crate::events::{AimEvent, JournalRecord};

/// Durable sink for state transitions. A failed append is fatal to the
/// alert manager.
pub trait Journal: Send {
    fn append(&mut self, record: &JournalRecord) -> Result<(), JournalError>;
}

/// Numbers events and hands them to the backing journal.
pub struct JournalWriter {
    inner: Box<dyn Journal>,
    next_seq: u64,
}

impl JournalWriter {
    pub fn new(inner: Box<dyn Journal>) -> Self {
        Self { inner, next_seq: 1 }
    }

    /// Continue numbering after the last replayed record.
    pub fn resume_after(&mut self, last_seq: u64) {
        self.next_seq = last_seq + 1;
    }

    pub fn write(&mut self, event: &AimEvent) -> Result<u64, JournalError> {
        let record = JournalRecord {
            seq: self.next_seq,
            written_at: Utc::now(),
            event: event.clone(),
        };
        self.inner.append(&record)?;
        self.next_seq += 1;
        Ok(record.seq)
    }
}

/// File journal, one JSON record per line, flushed per record.
pub struct FileJournal {
    path: PathBuf,
    writer: BufWriter<File>,
    fsync: bool,
}

impl FileJournal {
    pub fn open(path: &Path, fsync: bool) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), fsync, "journal opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            fsync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for FileJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<(), JournalError> {
        let line = serde_json::to_string(record)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        if self.fsync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

/// Reads every record of a journal file. A missing file is an empty journal.
/// A final line without its newline is a torn write from a crash and is
/// skipped; any other unreadable line is corruption.
pub fn read_journal(path: &Path) -> Result<Vec<JournalRecord>, JournalError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut line = String::new();
    let mut line_no = 0;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        line_no += 1;
        let complete = line.ends_with('\n');
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(text) {
            Ok(record) => records.push(record),
            Err(e) if !complete => {
                warn!(line = line_no, error = %e, "skipping torn final journal line");
                break;
            }
            Err(e) => {
                return Err(JournalError::Corrupt {
                    line: line_no,
                    message: e.to_string(),
                })
            }
        }
    }
    Ok(records)
}

/// In-memory journal. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryJournal {
    records: Arc<Mutex<Vec<JournalRecord>>>,
    fail: Arc<Mutex<bool>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<JournalRecord> {
        self.records.lock().clone()
    }

    /// Make every later append fail with an I/O error.
    pub fn fail_appends(&self) {
        *self.fail.lock() = true;
    }
}

impl Journal for MemoryJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<(), JournalError> {
        if *self.fail.lock() {
            return Err(JournalError::Io(std::io::Error::new(
                ErrorKind::Other,
                "journal device failed",
            )));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Used when no journal path is configured.
pub struct NullJournal;

impl Journal for NullJournal {
    fn append(&mut self, _record: &JournalRecord) -> Result<(), JournalError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event() -> AimEvent {
        AimEvent::NotificationFailed {
            alert_id: Uuid::new_v4(),
            sink: "stderr".into(),
        }
    }

    #[test]
    fn file_round_trip_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aim").join("journal.jsonl");
        let mut writer = JournalWriter::new(Box::new(FileJournal::open(&path, true).unwrap()));
        for _ in 0..3 {
            writer.write(&event()).unwrap();
        }
        let records = read_journal(&path).unwrap();
        assert_eq!(records.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_journal(&dir.path().join("none.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_skipped_but_corruption_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        {
            let mut writer = JournalWriter::new(Box::new(FileJournal::open(&path, false).unwrap()));
            writer.write(&event()).unwrap();
            writer.write(&event()).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"seq\":3,\"writ").unwrap();
        drop(f);
        assert_eq!(read_journal(&path).unwrap().len(), 2);

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"\n").unwrap();
        drop(f);
        assert!(matches!(
            read_journal(&path),
            Err(JournalError::Corrupt { line: 3, .. })
        ));
    }

    #[test]
    fn writer_resumes_numbering() {
        let journal = MemoryJournal::new();
        let mut writer = JournalWriter::new(Box::new(journal.clone()));
        writer.resume_after(41);
        assert_eq!(writer.write(&event()).unwrap(), 42);
        journal.fail_appends();
        assert!(writer.write(&event()).is_err());
        assert_eq!(journal.records().len(), 1);
    }
}
