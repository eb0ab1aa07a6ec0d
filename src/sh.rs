extern crate nix;

use nix::unistd;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::alias::{self, AliasTable};
use crate::common::*;
use crate::config::Config;
use crate::history::HistoryLog;

/// Session state owned by the execution loop and handed to built-ins.
#[derive(Debug)]
pub struct Shell {
    pub config: Config,
    pub history: HistoryLog,
    pub aliases: AliasTable,
    pub should_exit: bool,
}

impl Shell {
    /// Loads history and aliases from the configured files. A store that
    /// cannot be read starts empty and stays in memory only.
    pub fn new(config: Config) -> Shell {
        let history = HistoryLog::load(&config.history_file, config.history_capacity)
            .unwrap_or_else(|e| {
                warn!(path = %config.history_file.display(), error = %e, "history not loaded");
                HistoryLog::new(config.history_capacity)
            });
        let aliases = AliasTable::load(&config.alias_file, config.alias_capacity)
            .unwrap_or_else(|e| {
                warn!(path = %config.alias_file.display(), error = %e, "aliases not loaded");
                AliasTable::new(config.alias_capacity)
            });
        Shell {
            config,
            history,
            aliases,
            should_exit: false,
        }
    }

    /// In-memory shell, nothing persisted.
    pub fn ephemeral(config: Config) -> Shell {
        Shell {
            history: HistoryLog::new(config.history_capacity),
            aliases: AliasTable::new(config.alias_capacity),
            config,
            should_exit: false,
        }
    }

    /// Cuts the stores off their files so a forked child cannot write them.
    pub fn detach_storage(&mut self) {
        self.history.detach();
        self.aliases.detach();
    }

    pub fn prompt(&self) -> String {
        if let Some(p) = &self.config.prompt {
            return p.clone();
        }
        let user = env::var("USER").unwrap_or_else(|_| "user".to_owned());
        let cwd = env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        if unistd::geteuid().is_root() {
            format!(
                "\x1b[1;31m{}\x1b[0m@\x1b[1;35m{}\x1b[0m:\x1b[1;34m{}\x1b[0m# ",
                user,
                hostname(),
                cwd
            )
        } else {
            format!(
                "\x1b[1;32m{}\x1b[0m@\x1b[1;36m{}\x1b[0m:\x1b[1;34m{}\x1b[0m$ ",
                user,
                hostname(),
                cwd
            )
        }
    }

    pub fn cd(&mut self, args: &[String]) -> Result<()> {
        if args.len() > 1 {
            return Err(state("cd: too many arguments"));
        }
        let path = match args.first() {
            None => dirs::home_dir().ok_or_else(|| state("cd: HOME not set"))?,
            Some(target) => {
                let cwd = env::current_dir()?;
                resolve_dir(&cwd, target)
            }
        };
        env::set_current_dir(&path)
            .map_err(|e| state(format!("cd: {}: {}", path.display(), e)))
    }

    /// `alias` lists; `alias name='text'` defines from the raw line, whose
    /// quoting survives only there.
    pub fn alias(&mut self, args: &[String], raw_line: &str, out: &mut dyn Write) -> Result<()> {
        if args.is_empty() {
            for e in self.aliases.all() {
                writeln!(out, "alias {}='{}'", e.name, e.text)?;
            }
            return Ok(());
        }
        let body = raw_line
            .trim_start()
            .splitn(2, char::is_whitespace)
            .nth(1)
            .unwrap_or("")
            .trim();
        match alias::split_definition(body) {
            Some((name, text)) => self.aliases.define(name, text),
            None => Err(state(
                "alias: invalid format. Usage: alias name='command'",
            )),
        }
    }

    pub fn unalias(&mut self, args: &[String]) -> Result<()> {
        match args.first() {
            Some(name) => self.aliases.remove(name),
            None => Err(state("unalias: missing alias name")),
        }
    }

    pub fn history(&self, args: &[String], out: &mut dyn Write) -> Result<()> {
        let len = self.history.len();
        let skip = match args.first() {
            None => 0,
            Some(arg) => match arg.parse::<usize>() {
                Ok(n) if n > 0 && n <= len => len - n,
                _ => return Err(state(format!("history: invalid number: {}", arg))),
            },
        };
        for (i, entry) in self.history.all().enumerate().skip(skip) {
            writeln!(out, "{} {}", i + 1, entry)?;
        }
        Ok(())
    }

    pub fn clear_history(&mut self, out: &mut dyn Write) -> Result<()> {
        self.history.clear()?;
        writeln!(out, "History cleared")?;
        Ok(())
    }
}

/// Joins `target` onto `cwd`, folding `.` and `..` lexically.
fn resolve_dir(cwd: &Path, target: &str) -> PathBuf {
    let mut path = if target.starts_with('/') {
        PathBuf::from("/")
    } else {
        cwd.to_path_buf()
    };
    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                path.pop();
            }
            _ => path.push(part),
        }
    }
    path
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    match unistd::gethostname(&mut buf) {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => "localhost".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> Shell {
        Shell::ephemeral(Config::default())
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolve_dir_folds_dots() {
        let cwd = Path::new("/home/user/src");
        assert_eq!(resolve_dir(cwd, ".."), PathBuf::from("/home/user"));
        assert_eq!(resolve_dir(cwd, "./a/../b"), PathBuf::from("/home/user/src/b"));
        assert_eq!(resolve_dir(cwd, "/tmp/x/.."), PathBuf::from("/tmp"));
        assert_eq!(resolve_dir(cwd, "/.."), PathBuf::from("/"));
    }

    #[test]
    fn alias_defines_from_raw_line() {
        let mut sh = shell();
        let mut out = Vec::new();
        sh.alias(&args(&["ll='ls", "-l'"]), "alias ll='ls -l'", &mut out)
            .unwrap();
        assert_eq!(sh.aliases.resolve("ll"), Some("ls -l"));

        sh.alias(&[], "alias", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "alias ll='ls -l'\n");

        let bad = sh.alias(&args(&["oops"]), "alias oops", &mut Vec::new());
        assert!(matches!(bad, Err(ShellError::State(_))));
    }

    #[test]
    fn unalias_reports_unknown_name() {
        let mut sh = shell();
        assert!(matches!(sh.unalias(&args(&["nope"])), Err(ShellError::State(_))));
        assert!(matches!(sh.unalias(&[]), Err(ShellError::State(_))));
    }

    #[test]
    fn history_lists_tail() {
        let mut sh = shell();
        for cmd in &["a", "b", "c"] {
            sh.history.append(cmd);
        }
        let mut out = Vec::new();
        sh.history(&args(&["2"]), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "2 b\n3 c\n");

        let mut out = Vec::new();
        sh.history(&[], &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1 a\n2 b\n3 c\n");

        for bad in &["0", "4", "x"] {
            let res = sh.history(&args(&[bad]), &mut Vec::new());
            assert!(matches!(res, Err(ShellError::State(_))));
        }
    }

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn clear_history_empties_log() {
        let mut sh = shell();
        sh.history.append("ls");
        let mut out = Vec::new();
        sh.clear_history(&mut out).unwrap();
        assert!(sh.history.is_empty());
        assert_eq!(String::from_utf8(out).unwrap(), "History cleared\n");
    }
}
