//! Resilient incremental log tailing.
//!
//! A [`LogTailer`] follows a single log file across rotation and
//! truncation, emitting complete lines exactly once. The byte-to-line
//! splitting lives in [`LineAssembler`] so tests can feed synthetic
//! chunks without touching a filesystem.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Which monitored log a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum LogSource {
    Auth,
    Fail2ban,
}

impl LogSource {
    pub fn label(self) -> &'static str {
        match self {
            LogSource::Auth => "auth",
            LogSource::Fail2ban => "f2b",
        }
    }
}

/// One unit of tailer output.
///
/// `Rotated` is the out-of-band marker telling downstream that file
/// history before this point is unreliable. It is not an event and
/// never reaches the counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailItem {
    Line(String),
    Rotated,
}

/// Message forwarded from a tailer task to the ingest task.
#[derive(Debug, Clone)]
pub struct TailMessage {
    pub source: LogSource,
    pub item: TailItem,
}

/// Splits an incoming byte stream into complete lines, buffering any
/// trailing partial line until the bytes that finish it arrive.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        LineAssembler { partial: Vec::new() }
    }

    /// Feed a chunk, returning every line completed by it. Lines are
    /// returned without their trailing newline; invalid UTF-8 is
    /// replaced rather than dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.partial);
                let mut line = String::from_utf8_lossy(&raw).into_owned();
                if line.ends_with('\r') {
                    line.pop();
                }
                lines.push(line);
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    /// Drop any buffered partial line. Used when the underlying file
    /// was rotated and the partial can never be completed.
    pub fn reset(&mut self) {
        self.partial.clear();
    }

    pub fn partial_len(&self) -> usize {
        self.partial.len()
    }
}

/// File identity as seen by the tailer: (device, inode).
type FileIdentity = (u64, u64);

#[cfg(unix)]
fn identity_of(meta: &std::fs::Metadata) -> FileIdentity {
    use std::os::unix::fs::MetadataExt;
    (meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn identity_of(_meta: &std::fs::Metadata) -> FileIdentity {
    (0, 0)
}

/// Follows one log file, surviving rotation, truncation and the file
/// being temporarily absent or unreadable.
pub struct LogTailer {
    path: PathBuf,
    identity: Option<FileIdentity>,
    offset: u64,
    assembler: LineAssembler,
    start_at_end: bool,
    opened_once: bool,
    error_reported: bool,
}

impl LogTailer {
    /// Create a tailer. With `start_at_end` the first successful open
    /// seeks to EOF so only activity after startup is ingested.
    pub fn new(path: PathBuf, start_at_end: bool) -> Self {
        LogTailer {
            path,
            identity: None,
            offset: 0,
            assembler: LineAssembler::new(),
            start_at_end,
            opened_once: false,
            error_reported: false,
        }
    }

    /// Poll the file once, returning any rotation marker followed by
    /// the complete lines that became available.
    ///
    /// A missing file yields no items and no error; the next poll
    /// retries. Read failures reset the tailer state and are logged
    /// once until a poll succeeds again.
    pub fn poll(&mut self) -> Vec<TailItem> {
        match self.poll_inner() {
            Ok(items) => {
                self.error_reported = false;
                items
            }
            Err(e) => {
                if !self.error_reported {
                    log::warn!("tail {}: {}", self.path.display(), e);
                    self.error_reported = true;
                }
                // Force a clean reopen on the next poll.
                self.identity = None;
                Vec::new()
            }
        }
    }

    fn poll_inner(&mut self) -> std::io::Result<Vec<TailItem>> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Log files appear and disappear across rotation;
                // keep state so a reappearing identical file resumes.
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let identity = identity_of(&meta);
        let len = meta.len();
        let mut items = Vec::new();

        let rotated = match self.identity {
            Some(known) if known != identity => true,
            Some(_) if len < self.offset => true,
            _ => false,
        };

        if rotated {
            self.offset = 0;
            self.assembler.reset();
            items.push(TailItem::Rotated);
        }

        if self.identity.is_none() || rotated {
            self.identity = Some(identity);
            if !self.opened_once {
                self.opened_once = true;
                if self.start_at_end {
                    self.offset = len;
                    return Ok(items);
                }
            }
        }

        if len > self.offset {
            let mut file = File::open(&self.path)?;
            file.seek(SeekFrom::Start(self.offset))?;
            let mut chunk = Vec::with_capacity((len - self.offset) as usize);
            let read = file.take(len - self.offset).read_to_end(&mut chunk)?;
            self.offset += read as u64;
            for line in self.assembler.push(&chunk[..read]) {
                items.push(TailItem::Line(line));
            }
        }

        Ok(items)
    }

    /// Run the tailer until shutdown, forwarding items over a bounded
    /// channel. A full channel pauses production (`send` waits); lines
    /// are never dropped to make room.
    pub async fn run(
        mut self,
        source: LogSource,
        tx: mpsc::Sender<TailMessage>,
        mut shutdown: watch::Receiver<bool>,
        poll_interval: Duration,
    ) {
        log::info!("tailer started for {} ({:?})", self.path.display(), source);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let items = self.poll();
            // Back off harder while the file is erroring.
            let interval = if self.error_reported {
                poll_interval * 8
            } else {
                poll_interval
            };
            for item in items {
                let mut pending = Some(TailMessage { source, item });
                // A full queue pauses production here; lines are
                // never dropped to make room. The timeout keeps the
                // task responsive to shutdown while paused.
                while let Some(msg) = pending.take() {
                    match tx.send_timeout(msg, SEND_TIMEOUT).await {
                        Ok(()) => {}
                        Err(mpsc::error::SendTimeoutError::Timeout(msg)) => {
                            if *shutdown.borrow() {
                                log::info!(
                                    "shutdown while queue full, stopping {}",
                                    self.path.display()
                                );
                                return;
                            }
                            log::debug!("ingest queue full, tailer pausing");
                            pending = Some(msg);
                        }
                        Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                            log::info!("tail channel closed, stopping {}", self.path.display());
                            return;
                        }
                    }
                }
            }
            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        log::info!("tailer stopped for {}", self.path.display());
    }
}
