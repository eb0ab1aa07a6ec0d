use std::env;
use std::fs;
use std::path::Path;

/// Completion candidates for the token under the cursor.
#[derive(Debug, Default, PartialEq)]
pub struct Completion {
    /// Byte offset in the buffer where the token starts.
    pub start: usize,
    /// Full replacement texts for the token, sorted.
    pub candidates: Vec<String>,
}

/// Collects candidates for the last token of `buffer`.
///
/// `$NAME` tokens complete against the environment, the first word against
/// `builtins`, anything else against directory entries under `cwd`. After
/// `cd` only directories qualify.
pub fn complete(buffer: &str, builtins: &[&str], cwd: &Path) -> Completion {
    let start = buffer
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let prefix = &buffer[start..];
    let first_word = buffer[..start].trim().is_empty();

    let mut candidates: Vec<String> = if let Some(var) = prefix.strip_prefix('$') {
        env::vars_os()
            .filter_map(|(k, _)| k.into_string().ok())
            .filter(|k| k.starts_with(var))
            .map(|k| format!("${}", k))
            .collect()
    } else if first_word {
        builtins
            .iter()
            .filter(|b| b.starts_with(prefix))
            .map(|b| b.to_string())
            .collect()
    } else {
        let dirs_only = buffer.split_whitespace().next() == Some("cd");
        entries(prefix, cwd, dirs_only)
    };
    candidates.sort();
    candidates.dedup();
    Completion { start, candidates }
}

fn entries(prefix: &str, cwd: &Path, dirs_only: bool) -> Vec<String> {
    let (dir_part, file_part) = match prefix.rfind('/') {
        Some(i) => (&prefix[..=i], &prefix[i + 1..]),
        None => ("", prefix),
    };
    let dir = if dir_part.is_empty() {
        cwd.to_path_buf()
    } else if Path::new(dir_part).is_absolute() {
        Path::new(dir_part).to_path_buf()
    } else {
        cwd.join(dir_part)
    };
    let read = match fs::read_dir(&dir) {
        Ok(r) => r,
        Err(_) => return Vec::new(),
    };
    let mut out = Vec::new();
    for entry in read.flatten() {
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            Err(_) => continue,
        };
        if !name.starts_with(file_part) {
            continue;
        }
        if name.starts_with('.') && !file_part.starts_with('.') {
            continue;
        }
        if dirs_only && !entry.path().is_dir() {
            continue;
        }
        out.push(format!("{}{}", dir_part, name));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    const BUILTINS: &[&str] = &["cat", "cd", "clearhistory", "echo", "history"];

    #[test]
    fn first_word_completes_builtins() {
        let c = complete("c", BUILTINS, Path::new("."));
        assert_eq!(c.start, 0);
        assert_eq!(c.candidates, vec!["cat", "cd", "clearhistory"]);

        let c = complete("his", BUILTINS, Path::new("."));
        assert_eq!(c.candidates, vec!["history"]);
    }

    #[test]
    fn dollar_prefix_completes_env_vars() {
        env::set_var("MYSH_COMPLETE_TEST_VAR", "1");
        let c = complete("echo $MYSH_COMPLETE_T", BUILTINS, Path::new("."));
        assert_eq!(c.start, 5);
        assert_eq!(c.candidates, vec!["$MYSH_COMPLETE_TEST_VAR"]);
    }

    #[test]
    fn later_words_complete_files() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("report.txt")).unwrap();
        File::create(dir.path().join("report2.txt")).unwrap();
        File::create(dir.path().join(".report")).unwrap();
        fs::create_dir(dir.path().join("reports")).unwrap();
        File::create(dir.path().join("reports").join("q1.csv")).unwrap();

        let c = complete("cat rep", BUILTINS, dir.path());
        assert_eq!(c.start, 4);
        assert_eq!(c.candidates, vec!["report.txt", "report2.txt", "reports"]);

        let c = complete("cat reports/q", BUILTINS, dir.path());
        assert_eq!(c.candidates, vec!["reports/q1.csv"]);

        let c = complete("cd rep", BUILTINS, dir.path());
        assert_eq!(c.candidates, vec!["reports"]);
    }

    #[test]
    fn trailing_space_completes_empty_prefix() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("only")).unwrap();
        let c = complete("cat ", BUILTINS, dir.path());
        assert_eq!(c.start, 4);
        assert_eq!(c.candidates, vec!["only"]);
    }

    #[test]
    fn wide_whitespace_splits_tokens() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("report.txt")).unwrap();
        let c = complete("cat\u{a0}rep", BUILTINS, dir.path());
        assert_eq!(c.start, "cat\u{a0}".len());
        assert_eq!(c.candidates, vec!["report.txt"]);

        let c = complete("cat\u{3000}", BUILTINS, dir.path());
        assert_eq!(c.start, "cat\u{3000}".len());
    }
}
