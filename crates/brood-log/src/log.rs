//! Append-only JSONL message log

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use brood_core::protocol::LogQuery;
use brood_core::{HelperId, LogRecord, Recipients, RecordKind, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

/// Filters applied while reading the log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub from_sequence: Option<u64>,
    pub sender: Option<HelperId>,
    pub last_n: Option<usize>,
    /// Ignore records appended after this sequence
    pub up_to: Option<u64>,
}

impl LogFilter {
    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(from) = self.from_sequence {
            if record.sequence < from {
                return false;
            }
        }
        if let Some(sender) = self.sender {
            if record.sender != sender {
                return false;
            }
        }
        true
    }

    pub fn up_to(mut self, sequence: u64) -> Self {
        self.up_to = Some(sequence);
        self
    }
}

impl From<&LogQuery> for LogFilter {
    fn from(query: &LogQuery) -> Self {
        Self {
            from_sequence: query.from_sequence,
            sender: query.sender,
            last_n: query.last_n,
            up_to: None,
        }
    }
}

/// Writer side of the log. Exactly one exists per log file, owned by the hub.
pub struct MessageLog {
    path: PathBuf,
    file: File,
    last_sequence: u64,
    torn_tail: bool,
}

impl MessageLog {
    /// Open (or create) the log and recover the last assigned sequence
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let (last_sequence, torn_tail) = recover(&mut file, &path)?;
        info!(
            "Opened message log {} (last sequence {})",
            path.display(),
            last_sequence
        );

        Ok(Self {
            path,
            file,
            last_sequence,
            torn_tail,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence of the most recent record, 0 when the log is empty
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Append one record and flush it before returning
    pub fn append(
        &mut self,
        kind: RecordKind,
        sender: HelperId,
        recipients: Recipients,
        content: impl Into<String>,
    ) -> Result<LogRecord> {
        let record = LogRecord {
            sequence: self.last_sequence + 1,
            timestamp: Utc::now(),
            kind,
            sender,
            recipients,
            content: content.into(),
        };

        let mut line = Vec::new();
        if self.torn_tail {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, &record)?;
        line.push(b'\n');

        self.file.write_all(&line)?;
        self.file.flush()?;

        self.torn_tail = false;
        self.last_sequence = record.sequence;
        debug!("Appended record {} from {}", record.sequence, record.sender);
        Ok(record)
    }

    /// Read records from a log file without holding the writer
    pub fn read(path: impl Into<PathBuf>, filter: LogFilter) -> Result<LogIter> {
        LogIter::new(path.into(), filter)
    }
}

/// Scan the whole file, returning the highest sequence and whether the final
/// line lacks its terminating newline.
fn recover(file: &mut File, path: &Path) -> Result<(u64, bool)> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&mut *file);
    let mut last_sequence = 0;
    let mut torn_tail = false;
    let mut line_no = 0usize;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            break;
        }
        line_no += 1;
        torn_tail = buf.last() != Some(&b'\n');

        let line = buf.trim_ascii();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<LogRecord>(line) {
            Ok(record) => last_sequence = last_sequence.max(record.sequence),
            Err(e) => warn!(
                "Skipping corrupt line {} in {}: {}",
                line_no,
                path.display(),
                e
            ),
        }
    }

    if torn_tail {
        warn!(
            "Message log {} ends with a partial line; it will be terminated",
            path.display()
        );
    }
    Ok((last_sequence, torn_tail))
}

/// Lazy iterator over log records matching a [`LogFilter`]
///
/// Finite: it stops at the end of the file as it was when reached, or at
/// `up_to`. Call [`LogIter::rewind`] to start over from the beginning.
pub struct LogIter {
    path: PathBuf,
    filter: LogFilter,
    reader: Option<BufReader<File>>,
    buf: Vec<u8>,
    tail: Option<VecDeque<LogRecord>>,
    done: bool,
}

impl LogIter {
    fn new(path: PathBuf, filter: LogFilter) -> Result<Self> {
        let mut iter = Self {
            path,
            filter,
            reader: None,
            buf: Vec::new(),
            tail: None,
            done: false,
        };
        iter.rewind()?;
        Ok(iter)
    }

    /// Restart from the first record
    pub fn rewind(&mut self) -> Result<()> {
        self.tail = None;
        self.done = false;
        self.reader = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(())
    }

    fn next_matching(&mut self) -> Option<Result<LogRecord>> {
        if self.done {
            return None;
        }
        let reader = self.reader.as_mut()?;
        loop {
            self.buf.clear();
            match reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
            let line = self.buf.trim_ascii();
            if line.is_empty() {
                continue;
            }
            let record: LogRecord = match serde_json::from_slice(line) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable line in {}: {}", self.path.display(), e);
                    continue;
                }
            };
            if let Some(bound) = self.filter.up_to {
                if record.sequence > bound {
                    self.done = true;
                    return None;
                }
            }
            if self.filter.matches(&record) {
                return Some(Ok(record));
            }
        }
        self.done = true;
        None
    }

    fn fill_tail(&mut self, n: usize) -> Result<VecDeque<LogRecord>> {
        let mut tail = VecDeque::with_capacity(n.min(1024));
        while let Some(record) = self.next_matching() {
            let record = record?;
            if n == 0 {
                continue;
            }
            if tail.len() == n {
                tail.pop_front();
            }
            tail.push_back(record);
        }
        Ok(tail)
    }
}

impl Iterator for LogIter {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let Some(n) = self.filter.last_n else {
            return self.next_matching();
        };
        if self.tail.is_none() {
            match self.fill_tail(n) {
                Ok(tail) => self.tail = Some(tail),
                Err(e) => return Some(Err(e)),
            }
        }
        self.tail.as_mut()?.pop_front().map(Ok)
    }
}

/// Read everything after `offset` in `path`, returning complete lines and the
/// new offset. A trailing partial line is left for the next call.
pub(crate) fn read_complete_lines(path: &Path, offset: u64) -> Result<(Vec<String>, u64)> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };

    let len = file.metadata()?.len();
    // Truncated or replaced underneath us
    let start = if len < offset { 0 } else { offset };
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
        return Ok((Vec::new(), start));
    };
    let complete = &buf[..=last_newline];
    let lines = String::from_utf8_lossy(complete)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect();

    Ok((lines, start + complete.len() as u64))
}
