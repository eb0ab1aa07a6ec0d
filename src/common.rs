extern crate nix;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::parser::ParseError;

pub type Result<T> = std::result::Result<T, ShellError>;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("syntax error: {0}")]
    Parse(#[from] ParseError),

    #[error("pipe: {0}")]
    Pipe(nix::Error),

    #[error("fork: {0}")]
    Fork(nix::Error),

    #[error("{}: {source}", path.display())]
    Redirect { path: PathBuf, source: io::Error },

    #[error("terminal: {0}")]
    Terminal(nix::Error),

    #[error("{0}")]
    State(String),

    #[error("command too long (limit {0} bytes)")]
    TooLong(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub fn state<T: ToString>(msg: T) -> ShellError {
    ShellError::State(msg.to_string())
}
