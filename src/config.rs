use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::Level;

const HISTORY_SIZE: usize = 100;
const MAX_ALIASES: usize = 100;
const MAX_INPUT: usize = 1024;
const MAX_COMMAND_LENGTH: usize = 2048;

/// Runtime knobs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub history_file: PathBuf,
    pub alias_file: PathBuf,
    pub history_capacity: usize,
    pub alias_capacity: usize,
    /// Longest line the editor will buffer, in characters.
    pub max_line: usize,
    /// Longest command after joining `\`-continued lines, in bytes.
    pub max_command: usize,
    /// Literal prompt text; `None` renders `user@host:cwd$ `.
    pub prompt: Option<String>,
    pub log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Config {
            history_file: home.join(".mysh_history"),
            alias_file: home.join(".mysh_aliases"),
            history_capacity: HISTORY_SIZE,
            alias_capacity: MAX_ALIASES,
            max_line: MAX_INPUT - 1,
            max_command: MAX_COMMAND_LENGTH,
            prompt: None,
            log_level: Level::WARN,
        }
    }
}

impl Config {
    /// Defaults overridden by `MYSH_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(path) = env::var_os("MYSH_HISTFILE") {
            config.history_file = PathBuf::from(path);
        }
        if let Some(path) = env::var_os("MYSH_ALIASFILE") {
            config.alias_file = PathBuf::from(path);
        }
        if let Some(n) = env::var("MYSH_HISTSIZE")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
        {
            config.history_capacity = n;
        }
        if let Ok(prompt) = env::var("MYSH_PROMPT") {
            config.prompt = Some(prompt);
        }
        if let Some(level) = env::var("MYSH_LOG")
            .ok()
            .and_then(|s| Level::from_str(s.trim()).ok())
        {
            config.log_level = level;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_store_limits() {
        let config = Config::default();
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.alias_capacity, 100);
        assert_eq!(config.max_line, 1023);
        assert!(config.history_file.ends_with(".mysh_history"));
        assert!(config.alias_file.ends_with(".mysh_aliases"));
        assert_eq!(config.log_level, Level::WARN);
    }
}
