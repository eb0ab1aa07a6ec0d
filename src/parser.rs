use std::fs;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use thiserror::Error;

use crate::alias::AliasTable;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("`{0}` needs a file name")]
    MissingRedirectTarget(char),
    #[error("unexpected `|`")]
    EmptyStage,
}

/// One command of a pipeline with its own redirections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedStage {
    pub argv: Vec<String>,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

impl ParsedStage {
    pub fn name(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    pub stages: Vec<ParsedStage>,
    pub background: bool,
}

impl Pipeline {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Parses `line` with wildcards expanded against the working directory.
pub fn parse(line: &str, aliases: &AliasTable) -> Result<Pipeline, ParseError> {
    parse_in(line, aliases, Path::new("."))
}

pub fn parse_in(line: &str, aliases: &AliasTable, dir: &Path) -> Result<Pipeline, ParseError> {
    let line = expand_alias(line, aliases);
    let mut tokens = Vec::new();
    for word in line.split_whitespace() {
        tokens.extend(expand_wildcard(word, dir));
    }
    split_pipeline(tokens)
}

/// Replaces the first word with its alias text. Expansions are not
/// re-expanded.
pub fn expand_alias(line: &str, aliases: &AliasTable) -> String {
    let start = match line.find(|c: char| !c.is_whitespace()) {
        Some(i) => i,
        None => return String::new(),
    };
    let rest = &line[start..];
    let end = rest.find(char::is_whitespace).unwrap_or_else(|| rest.len());
    match aliases.resolve(&rest[..end]) {
        Some(text) => format!("{}{}", text, &rest[end..]),
        None => line.to_string(),
    }
}

pub fn has_wildcard(word: &str) -> bool {
    word.contains(|c: char| c == '*' || c == '?' || c == '[')
}

/// Does `name` match the shell pattern `pattern`?
pub fn matches(pattern: &str, name: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches_with(name, match_options()),
        Err(_) => false,
    }
}

/// Expands `word` against the entries of `dir`, in listing order. A word
/// that matches nothing is kept as is.
pub fn expand_wildcard(word: &str, dir: &Path) -> Vec<String> {
    if !has_wildcard(word) {
        return vec![word.to_string()];
    }
    let pattern = match Pattern::new(word) {
        Ok(p) => p,
        Err(_) => return vec![word.to_string()],
    };
    let mut found = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if pattern.matches_with(name, match_options()) {
                found.push(name.to_string());
            }
        }
    }
    if found.is_empty() {
        found.push(word.to_string());
    }
    found
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    }
}

fn split_pipeline(mut tokens: Vec<String>) -> Result<Pipeline, ParseError> {
    let mut pipeline = Pipeline::default();
    if tokens.last().map(String::as_str) == Some("&") {
        tokens.pop();
        pipeline.background = true;
    }
    if tokens.is_empty() {
        return Ok(pipeline);
    }

    let mut stage = ParsedStage::default();
    let mut iter = tokens.into_iter();
    while let Some(tok) = iter.next() {
        match tok.as_str() {
            "<" | ">" => {
                let op = if tok == "<" { '<' } else { '>' };
                let target = match iter.next() {
                    Some(t) if !is_operator(&t) => PathBuf::from(t),
                    _ => return Err(ParseError::MissingRedirectTarget(op)),
                };
                if op == '<' {
                    stage.input = Some(target);
                } else {
                    stage.output = Some(target);
                }
            }
            "|" => {
                if stage.argv.is_empty() {
                    return Err(ParseError::EmptyStage);
                }
                pipeline.stages.push(std::mem::take(&mut stage));
            }
            _ => stage.argv.push(tok),
        }
    }
    if stage.argv.is_empty() {
        return Err(ParseError::EmptyStage);
    }
    pipeline.stages.push(stage);
    Ok(pipeline)
}

fn is_operator(tok: &str) -> bool {
    matches!(tok, "<" | ">" | "|")
}
