use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::common::*;

#[derive(Debug, Clone, PartialEq)]
pub struct AliasEntry {
    pub name: String,
    pub text: String,
}

/// User-defined first-word substitutions, in definition order.
///
/// Every mutation rewrites the backing file as `name='text'` lines.
#[derive(Debug, Clone)]
pub struct AliasTable {
    entries: Vec<AliasEntry>,
    capacity: usize,
    path: Option<PathBuf>,
}

impl AliasTable {
    pub fn new(capacity: usize) -> Self {
        AliasTable {
            entries: Vec::new(),
            capacity,
            path: None,
        }
    }

    pub fn load(path: &Path, capacity: usize) -> io::Result<Self> {
        let mut table = AliasTable::new(capacity);
        match File::open(path) {
            Ok(f) => {
                for line in BufReader::new(f).lines() {
                    let line = line?;
                    if let Some((name, text)) = split_definition(&line) {
                        if let Err(e) = table.insert(name, text) {
                            warn!(error = %e, "skipping alias");
                        }
                    }
                }
                debug!(path = %path.display(), entries = table.entries.len(), "loaded aliases");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        table.path = Some(path.to_path_buf());
        Ok(table)
    }

    pub fn detach(&mut self) {
        self.path = None;
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.text.as_str())
    }

    pub fn all(&self) -> &[AliasEntry] {
        &self.entries
    }

    /// Adds or overwrites `name`, then persists the table.
    pub fn define(&mut self, name: &str, text: &str) -> Result<()> {
        self.insert(name, text)?;
        self.persist()
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| state(format!("unalias: {}: not found", name)))?;
        self.entries.remove(idx);
        self.persist()
    }

    fn insert(&mut self, name: &str, text: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(state(format!("alias: invalid name '{}'", name)));
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.text = text.to_string();
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            return Err(state(format!(
                "alias: table full ({} entries)",
                self.capacity
            )));
        }
        self.entries.push(AliasEntry {
            name: name.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let mut out = String::new();
            for e in &self.entries {
                out.push_str(&format!("{}='{}'\n", e.name, e.text));
            }
            fs::write(path, out)?;
        }
        Ok(())
    }
}

/// Splits `name=text` at the first `=`, dropping one pair of surrounding
/// quotes from the text.
pub fn split_definition(def: &str) -> Option<(&str, &str)> {
    let eq = def.find('=')?;
    let name = def[..eq].trim();
    let text = unquote(def[eq + 1..].trim_end_matches(&['\n', '\r'][..]));
    Some((name, text))
}

fn unquote(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' || first == b'"') && first == last {
            return &s[1..s.len() - 1];
        }
    }
    s
}
