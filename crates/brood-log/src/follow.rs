//! Tail the message log as the hub appends to it

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use brood_core::{BroodError, LogRecord, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::log::{read_complete_lines, LogFilter};

/// Re-read interval when no file event arrives
const POLL_FALLBACK: Duration = Duration::from_millis(500);

/// Follows a log file, yielding each new complete record once
///
/// Watches the containing directory so following may begin before the hub
/// has created the file.
pub struct LogFollower {
    path: PathBuf,
    filter: LogFilter,
    offset: u64,
    pending: VecDeque<LogRecord>,
    events: mpsc::Receiver<()>,
    _watcher: RecommendedWatcher,
}

impl LogFollower {
    /// Follow `path` from its beginning; `filter.last_n` applies to the
    /// backlog only
    pub fn new(path: impl Into<PathBuf>, filter: LogFilter) -> Result<Self> {
        let path = path.into();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;

        // Capacity 1: events only mean "look again", so they coalesce
        let (event_tx, event_rx) = mpsc::channel(1);
        let watched = path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                        && event.paths.iter().any(|p| p.file_name() == watched.file_name());
                    if relevant {
                        let _ = event_tx.try_send(());
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| BroodError::Watch(e.to_string()))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| BroodError::Watch(e.to_string()))?;
        debug!("Following {}", path.display());

        let mut follower = Self {
            path,
            filter: LogFilter {
                up_to: None,
                ..filter
            },
            offset: 0,
            pending: VecDeque::new(),
            events: event_rx,
            _watcher: watcher,
        };
        follower.load_backlog()?;
        Ok(follower)
    }

    /// Wait for and return the next record
    pub async fn next(&mut self) -> Result<LogRecord> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(record);
            }
            self.poll_file()?;
            if !self.pending.is_empty() {
                continue;
            }
            // A timeout just means re-check; notify can miss events on some platforms
            if let Ok(None) = tokio::time::timeout(POLL_FALLBACK, self.events.recv()).await {
                return Err(BroodError::Watch("file watcher stopped".to_string()));
            }
        }
    }

    fn load_backlog(&mut self) -> Result<()> {
        self.poll_file()?;
        if let Some(n) = self.filter.last_n.take() {
            while self.pending.len() > n {
                self.pending.pop_front();
            }
        }
        Ok(())
    }

    fn poll_file(&mut self) -> Result<()> {
        let (lines, offset) = read_complete_lines(&self.path, self.offset)?;
        if offset < self.offset {
            warn!("Log {} shrank; following from the start", self.path.display());
        }
        self.offset = offset;

        for line in lines {
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) if self.filter.matches(&record) => self.pending.push_back(record),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable log line: {}", e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageLog;
    use brood_core::{Recipients, RecordKind};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_follower_yields_backlog_then_new_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.jsonl");
        let mut log = MessageLog::open(&path).unwrap();
        for text in ["a", "b", "c"] {
            log.append(RecordKind::Message, 0, Recipients::one(1), text)
                .unwrap();
        }

        let mut follower = LogFollower::new(
            &path,
            LogFilter {
                last_n: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(follower.next().await.unwrap().content, "c");

        log.append(RecordKind::Message, 1, Recipients::All, "d")
            .unwrap();
        let record = tokio::time::timeout(Duration::from_secs(5), follower.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.sequence, 4);
        assert_eq!(record.content, "d");
    }

    #[tokio::test]
    async fn test_follower_waits_for_file_creation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("later.jsonl");
        let mut follower = LogFollower::new(&path, LogFilter::default()).unwrap();

        let mut log = MessageLog::open(&path).unwrap();
        log.append(RecordKind::Control, 2, Recipients::none(), "register")
            .unwrap();

        let record = tokio::time::timeout(Duration::from_secs(5), follower.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.sender, 2);
    }
}
