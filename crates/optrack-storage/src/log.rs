//! Append-only record log for one source.
//!
//! The log is a sequence of codec lines addressed by byte offset. Existing bytes are never
//! rewritten; only the compactor replaces the file, and it does so with an atomic rename.
//!
//! A line missing its trailing delimiter is a torn write (the process died mid-append).
//! Readers skip it, and the next append first terminates it with a bare delimiter so the
//! new record starts on a clean line.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use optrack_core::OpportunityRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{self, LegacyLines, RECORD_DELIMITER};
use crate::error::{IoContext, StoreError, StoreResult};
use crate::fsutil;

/// Where one encoded record lives inside the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub offset: u64,
    /// Encoded length including the delimiter.
    pub len: u64,
}

#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    len: u64,
    torn_tail: bool,
    legacy: Option<LegacyLines>,
    writer: Option<File>,
}

impl AppendLog {
    /// Open the log at `path`. The file itself is only created by the first append.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let (len, torn_tail) = inspect_tail(&path)?;
        if torn_tail {
            warn!(path = %path.display(), len, "log ends with a torn record");
        }
        Ok(Self {
            path,
            len,
            torn_tail,
            legacy: None,
            writer: None,
        })
    }

    /// Also read bare grant lines from the earlier tracker as records of `source`.
    /// Lines without timestamps get the file's modification time.
    pub fn with_legacy_source(mut self, source: &str) -> Self {
        let recorded_at = fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        self.legacy = Some(LegacyLines {
            source: source.to_string(),
            recorded_at,
        });
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Byte length of the log.
    pub fn size(&self) -> u64 {
        self.len
    }

    /// Serialize `record` at the current end of file and return where it landed.
    pub fn append(&mut self, record: &OpportunityRecord) -> StoreResult<LogPosition> {
        let line = codec::encode(record)?;
        let mut buf = Vec::with_capacity(line.len() + 1);
        if self.torn_tail {
            buf.push(RECORD_DELIMITER);
        }
        let offset = self.len + buf.len() as u64;
        buf.extend_from_slice(&line);

        let path = self.path.clone();
        let writer = self.writer()?;
        writer
            .write_all(&buf)
            .io_context(|| format!("appending to {}", path.display()))?;
        writer
            .sync_data()
            .io_context(|| format!("syncing {}", path.display()))?;

        self.len += buf.len() as u64;
        self.torn_tail = false;
        debug!(offset, identifier = %record.identifier, "appended record");
        Ok(LogPosition {
            offset,
            len: line.len() as u64,
        })
    }

    /// Decode exactly one record starting at `offset`.
    pub fn read_at(&self, offset: u64) -> StoreResult<OpportunityRecord> {
        if offset >= self.len {
            return Err(StoreError::OffsetOutOfRange {
                offset,
                log_len: self.len,
            });
        }
        let file = File::open(&self.path)
            .io_context(|| format!("opening {}", self.path.display()))?;
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(offset))
            .io_context(|| format!("seeking {} to {offset}", self.path.display()))?;
        let mut line = Vec::new();
        reader
            .read_until(RECORD_DELIMITER, &mut line)
            .io_context(|| format!("reading {} at {offset}", self.path.display()))?;
        if line.last() != Some(&RECORD_DELIMITER) {
            return Err(StoreError::CorruptRecord {
                offset,
                reason: "truncated record (missing delimiter)".to_string(),
            });
        }
        codec::decode_with_legacy(&line, offset, self.legacy.as_ref()).map(|(record, _)| record)
    }

    /// Replay the whole log from offset 0. Each call starts a fresh pass.
    pub fn iterate(&self) -> StoreResult<LogIter> {
        let reader = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                return Err(StoreError::io(
                    format!("opening {}", self.path.display()),
                    err,
                ))
            }
        };
        Ok(LogIter {
            path: self.path.clone(),
            reader,
            offset: 0,
            line: Vec::new(),
            legacy: self.legacy.clone(),
            corrupt: 0,
            upgraded: 0,
        })
    }

    /// Drop the write handle and re-read the file's length, e.g. after the file was replaced.
    pub fn reopen(&mut self) -> StoreResult<()> {
        self.writer = None;
        let (len, torn_tail) = inspect_tail(&self.path)?;
        self.len = len;
        self.torn_tail = torn_tail;
        Ok(())
    }

    fn writer(&mut self) -> StoreResult<&mut File> {
        let file = match self.writer.take() {
            Some(file) => file,
            None => self.open_writer()?,
        };
        Ok(self.writer.insert(file))
    }

    fn open_writer(&self) -> StoreResult<File> {
        let created = !self.path.exists();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("creating directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .io_context(|| format!("opening {} for append", self.path.display()))?;
        if created {
            if let Some(parent) = self.path.parent() {
                fsutil::sync_dir(parent)?;
            }
        }
        Ok(file)
    }
}

/// Returns the file length and whether the final byte is not a delimiter.
fn inspect_tail(path: &Path) -> StoreResult<(u64, bool)> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok((0, false)),
        Err(err) => return Err(StoreError::io(format!("opening {}", path.display()), err)),
    };
    let len = file
        .metadata()
        .io_context(|| format!("reading metadata of {}", path.display()))?
        .len();
    if len == 0 {
        return Ok((0, false));
    }
    file.seek(SeekFrom::End(-1))
        .io_context(|| format!("seeking to tail of {}", path.display()))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)
        .io_context(|| format!("reading tail of {}", path.display()))?;
    Ok((len, last[0] != RECORD_DELIMITER))
}

/// Lazy forward pass over a log. Corrupt lines are skipped and counted; only I/O failures
/// are yielded as errors.
#[derive(Debug)]
pub struct LogIter {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    offset: u64,
    line: Vec<u8>,
    legacy: Option<LegacyLines>,
    corrupt: usize,
    upgraded: usize,
}

impl LogIter {
    /// Lines skipped so far because they did not decode.
    pub fn corrupt_count(&self) -> usize {
        self.corrupt
    }

    /// Lines so far that were read in the earlier tracker's layout.
    pub fn legacy_count(&self) -> usize {
        self.upgraded
    }
}

impl Iterator for LogIter {
    type Item = StoreResult<(LogPosition, OpportunityRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let reader = self.reader.as_mut()?;
            self.line.clear();
            let read = reader.read_until(RECORD_DELIMITER, &mut self.line);
            let read = match read {
                Ok(0) => {
                    self.reader = None;
                    return None;
                }
                Ok(read) => read as u64,
                Err(err) => {
                    self.reader = None;
                    return Some(Err(StoreError::io(
                        format!("reading {} at {}", self.path.display(), self.offset),
                        err,
                    )));
                }
            };
            let offset = self.offset;
            self.offset += read;

            if self.line.last() != Some(&RECORD_DELIMITER) {
                warn!(
                    path = %self.path.display(),
                    offset,
                    bytes = read,
                    "skipping torn trailing record"
                );
                self.corrupt += 1;
                self.reader = None;
                return None;
            }
            if self.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match codec::decode_with_legacy(&self.line, offset, self.legacy.as_ref()) {
                Ok((record, upgraded)) => {
                    self.upgraded += usize::from(upgraded);
                    return Some(Ok((LogPosition { offset, len: read }, record)));
                }
                Err(err) => {
                    warn!(path = %self.path.display(), offset, %err, "skipping corrupt record");
                    self.corrupt += 1;
                }
            }
        }
    }
}
