extern crate nix;

use nix::unistd::{self, AccessFlags};
use std::env;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::alias::AliasTable;
use crate::builtin;

/// What a command name refers to.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Builtin(&'static str),
    Alias(String),
    External(PathBuf),
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Builtin(_) => write!(f, "a shell builtin"),
            Resolution::Alias(text) => write!(f, "aliased to `{}'", text),
            Resolution::External(path) => write!(f, "{}", path.display()),
        }
    }
}

pub trait Resolver {
    fn resolve(&self, name: &str) -> Option<Resolution>;
}

pub struct BuiltinResolver;

impl Resolver for BuiltinResolver {
    fn resolve(&self, name: &str) -> Option<Resolution> {
        builtin::lookup(name).map(|b| Resolution::Builtin(b.name))
    }
}

pub struct AliasResolver<'a>(pub &'a AliasTable);

impl<'a> Resolver for AliasResolver<'a> {
    fn resolve(&self, name: &str) -> Option<Resolution> {
        self.0.resolve(name).map(|t| Resolution::Alias(t.to_string()))
    }
}

/// Outcome of searching for an external program.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(PathBuf),
    NotExecutable(PathBuf),
    NotFound,
}

pub struct PathResolver {
    search_paths: OsString,
}

impl PathResolver {
    pub fn new(search_paths: OsString) -> Self {
        PathResolver { search_paths }
    }

    pub fn from_env() -> Self {
        PathResolver::new(env::var_os("PATH").unwrap_or_default())
    }

    pub fn lookup(&self, name: &str) -> Lookup {
        find_command_path(&self.search_paths, name)
    }
}

impl Resolver for PathResolver {
    fn resolve(&self, name: &str) -> Option<Resolution> {
        match self.lookup(name) {
            Lookup::Found(path) => Some(Resolution::External(path)),
            _ => None,
        }
    }
}

/// First hit of the chain, tried in order.
pub fn resolve(chain: &[&dyn Resolver], name: &str) -> Option<Resolution> {
    let found = chain.iter().find_map(|r| r.resolve(name));
    debug!(command = name, ?found, "resolved");
    found
}

/// Names containing `/` are used as given; anything else is searched for in
/// the colon-separated `search_paths`.
pub fn find_command_path(search_paths: &OsStr, name: &str) -> Lookup {
    if name.is_empty() {
        return Lookup::NotFound;
    }
    if name.contains('/') {
        return check(Path::new(name));
    }
    let mut denied = None;
    for dir in env::split_paths(search_paths) {
        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir
        };
        match check(&dir.join(name)) {
            Lookup::Found(path) => return Lookup::Found(path),
            Lookup::NotExecutable(path) => {
                denied.get_or_insert(path);
            }
            Lookup::NotFound => {}
        }
    }
    match denied {
        Some(path) => Lookup::NotExecutable(path),
        None => Lookup::NotFound,
    }
}

fn check(path: &Path) -> Lookup {
    if !path.is_file() {
        return Lookup::NotFound;
    }
    if unistd::access(path, AccessFlags::X_OK).is_ok() {
        Lookup::Found(path.to_path_buf())
    } else {
        Lookup::NotExecutable(path.to_path_buf())
    }
}
