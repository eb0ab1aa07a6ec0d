use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Bounded log of past command lines, oldest first.
///
/// When a backing file is attached every append is also written through to
/// it, `clear` truncates it and `flush` rewrites it from memory.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    entries: VecDeque<String>,
    capacity: usize,
    path: Option<PathBuf>,
}

impl HistoryLog {
    pub fn new(capacity: usize) -> Self {
        HistoryLog {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            path: None,
        }
    }

    /// Opens the log backed by `path`, keeping its most recent entries.
    /// A missing file is an empty log.
    pub fn load(path: &Path, capacity: usize) -> io::Result<Self> {
        let mut log = HistoryLog::new(capacity);
        match File::open(path) {
            Ok(f) => {
                for line in BufReader::new(f).lines() {
                    log.push(line?);
                }
                debug!(path = %path.display(), entries = log.len(), "loaded history");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        log.path = Some(path.to_path_buf());
        Ok(log)
    }

    /// Stops writing through to the backing file.
    pub fn detach(&mut self) {
        self.path = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(String::as_str)
    }

    pub fn contains(&self, line: &str) -> bool {
        self.entries.iter().any(|e| e == line)
    }

    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Appends `line`, evicting the oldest entry at capacity.
    pub fn append(&mut self, line: &str) {
        self.push(line.to_string());
        if let Some(path) = &self.path {
            let res = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut f| writeln!(f, "{}", line));
            if let Err(e) = res {
                warn!(path = %path.display(), error = %e, "cannot append history");
            }
        }
    }

    /// Appends `line` unless it is blank, contains control characters, or is
    /// already somewhere in the log. Returns whether it was recorded.
    pub fn record(&mut self, line: &str) -> bool {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            return false;
        }
        if trimmed
            .chars()
            .any(|c| c.is_control() && !c.is_whitespace())
        {
            return false;
        }
        if self.contains(line) {
            return false;
        }
        self.append(line);
        true
    }

    /// Empties the log and truncates the backing file.
    pub fn clear(&mut self) -> io::Result<()> {
        self.entries.clear();
        if let Some(path) = &self.path {
            File::create(path)?;
        }
        Ok(())
    }

    /// Rewrites the backing file from the in-memory log.
    pub fn flush(&self) -> io::Result<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(entry);
            out.push('\n');
        }
        fs::write(path, out)?;
        debug!(path = %path.display(), entries = self.len(), "flushed history");
        Ok(())
    }

    fn push(&mut self, line: String) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(line);
    }
}
