extern crate libc;
extern crate nix;

use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices, Termios};
use nix::unistd;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::common::*;
use crate::complete::complete;
use crate::history::HistoryLog;
use crate::signal;

const ESC: u8 = 0x1b;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;
const CTRL_D: u8 = 0x04;

/// Terminal switched to unbuffered, unechoed input for as long as the value
/// lives.
pub struct RawMode {
    fd: RawFd,
    saved: Termios,
}

impl RawMode {
    /// Returns `None` when `fd` is not a terminal.
    pub fn enable(fd: RawFd) -> Result<Option<RawMode>> {
        if !unistd::isatty(fd).unwrap_or(false) {
            return Ok(None);
        }
        let saved = termios::tcgetattr(fd).map_err(ShellError::Terminal)?;
        let mut raw = saved.clone();
        raw.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::tcsetattr(fd, SetArg::TCSANOW, &raw).map_err(ShellError::Terminal)?;
        Ok(Some(RawMode { fd, saved }))
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(self.fd, SetArg::TCSANOW, &self.saved);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum KeyState {
    Normal,
    SawEscape,
    SawEscapeBracket,
}

impl Default for KeyState {
    fn default() -> Self {
        KeyState::Normal
    }
}

/// Per-read state; rebuilt for every line.
#[derive(Debug, Default)]
struct EditorState {
    buffer: String,
    history_cursor: Option<usize>,
    tab_presses: u32,
    key: KeyState,
}

enum Step {
    Continue,
    Done(String),
    Eof,
}

pub struct LineEditor {
    max_len: usize,
    builtins: Vec<&'static str>,
}

impl LineEditor {
    pub fn new(max_len: usize, builtins: Vec<&'static str>) -> Self {
        LineEditor { max_len, builtins }
    }

    /// Reads one line from the terminal. `None` means end of input.
    pub fn read_line(&self, prompt: &str, history: &HistoryLog) -> Result<Option<String>> {
        let _raw = RawMode::enable(libc::STDIN_FILENO)?;
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut input = stdin.lock();
        let mut output = stdout.lock();
        self.read_from(&mut input, &mut output, prompt, history, Path::new("."))
    }

    pub fn read_from<R: Read, W: Write>(
        &self,
        input: &mut R,
        output: &mut W,
        prompt: &str,
        history: &HistoryLog,
        cwd: &Path,
    ) -> Result<Option<String>> {
        let mut state = EditorState::default();
        let mut byte = [0u8; 1];
        loop {
            let n = match input.read(&mut byte) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                if state.buffer.is_empty() {
                    return Ok(None);
                }
                writeln!(output)?;
                return Ok(Some(state.buffer));
            }
            if signal::take_interrupt() {
                // the handler already moved to a fresh prompt
                state = EditorState::default();
            }
            let step = self.feed(&mut state, byte[0], output, prompt, history, cwd)?;
            output.flush()?;
            match step {
                Step::Continue => {}
                Step::Done(line) => return Ok(Some(line)),
                Step::Eof => return Ok(None),
            }
        }
    }

    fn feed<W: Write>(
        &self,
        state: &mut EditorState,
        b: u8,
        out: &mut W,
        prompt: &str,
        history: &HistoryLog,
        cwd: &Path,
    ) -> Result<Step> {
        if b != b'\t' {
            state.tab_presses = 0;
        }
        match state.key {
            KeyState::SawEscape => {
                state.key = if b == b'[' {
                    KeyState::SawEscapeBracket
                } else {
                    KeyState::Normal
                };
                return Ok(Step::Continue);
            }
            KeyState::SawEscapeBracket => {
                state.key = KeyState::Normal;
                match b {
                    b'A' => self.history_up(state, history),
                    b'B' => self.history_down(state, history),
                    _ => return Ok(Step::Continue),
                }
                redraw(out, prompt, &state.buffer)?;
                return Ok(Step::Continue);
            }
            KeyState::Normal => {}
        }

        match b {
            b'\n' | b'\r' => {
                writeln!(out)?;
                return Ok(Step::Done(std::mem::take(&mut state.buffer)));
            }
            CTRL_D if state.buffer.is_empty() => {
                writeln!(out)?;
                return Ok(Step::Eof);
            }
            ESC => state.key = KeyState::SawEscape,
            DELETE | BACKSPACE => {
                if state.buffer.pop().is_some() {
                    out.write_all(b"\x08 \x08")?;
                }
            }
            b'\t' => self.tab(state, out, prompt, cwd)?,
            0x20..=0x7e => {
                if state.buffer.len() < self.max_len {
                    state.buffer.push(b as char);
                    out.write_all(&[b])?;
                }
            }
            _ => {}
        }
        Ok(Step::Continue)
    }

    fn history_up(&self, state: &mut EditorState, history: &HistoryLog) {
        if history.is_empty() {
            return;
        }
        let idx = match state.history_cursor {
            None => history.len() - 1,
            Some(i) if i > 0 => i - 1,
            Some(i) => i,
        };
        state.history_cursor = Some(idx);
        self.load_entry(state, history, idx);
    }

    fn history_down(&self, state: &mut EditorState, history: &HistoryLog) {
        match state.history_cursor {
            Some(i) if i + 1 < history.len() => {
                state.history_cursor = Some(i + 1);
                self.load_entry(state, history, i + 1);
            }
            Some(_) => {
                state.history_cursor = None;
                state.buffer.clear();
            }
            None => {}
        }
    }

    fn load_entry(&self, state: &mut EditorState, history: &HistoryLog, idx: usize) {
        state.buffer = history.get(idx).unwrap_or("").to_string();
        self.clip(&mut state.buffer);
    }

    fn tab<W: Write>(
        &self,
        state: &mut EditorState,
        out: &mut W,
        prompt: &str,
        cwd: &Path,
    ) -> Result<()> {
        let completion = complete(&state.buffer, &self.builtins, cwd);
        if completion.candidates.len() == 1 {
            state.buffer.truncate(completion.start);
            state.buffer.push_str(&completion.candidates[0]);
            self.clip(&mut state.buffer);
            state.tab_presses = 0;
            return redraw(out, prompt, &state.buffer);
        }
        state.tab_presses += 1;
        if completion.candidates.len() > 1 && state.tab_presses >= 2 {
            writeln!(out)?;
            writeln!(out, "{}", completion.candidates.join("  "))?;
            write!(out, "{}{}", prompt, state.buffer)?;
        }
        Ok(())
    }

    fn clip(&self, buffer: &mut String) {
        if buffer.len() > self.max_len {
            let mut end = self.max_len;
            while !buffer.is_char_boundary(end) {
                end -= 1;
            }
            buffer.truncate(end);
        }
    }
}

fn redraw<W: Write>(out: &mut W, prompt: &str, buffer: &str) -> Result<()> {
    write!(out, "\r\x1b[2K{}{}", prompt, buffer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Cursor;

    const BUILTINS: &[&str] = &["cat", "cd", "echo", "history"];

    fn editor() -> LineEditor {
        LineEditor::new(16, BUILTINS.to_vec())
    }

    fn run(keys: &[u8], history: &HistoryLog, cwd: &Path) -> (Option<String>, String) {
        let mut input = Cursor::new(keys.to_vec());
        let mut output = Vec::new();
        let line = editor()
            .read_from(&mut input, &mut output, "$ ", history, cwd)
            .unwrap();
        (line, String::from_utf8(output).unwrap())
    }

    fn history(entries: &[&str]) -> HistoryLog {
        let mut log = HistoryLog::new(10);
        for e in entries {
            log.append(e);
        }
        log
    }

    #[test]
    fn typing_and_backspace() {
        let (line, out) = run(b"lsx\x7f -l\n", &history(&[]), Path::new("."));
        assert_eq!(line.as_deref(), Some("ls -l"));
        assert!(out.starts_with("lsx\x08 \x08 -l"));
    }

    #[test]
    fn buffer_is_bounded() {
        let (line, _) = run(b"abcdefghijklmnopqrstuvwxyz\n", &history(&[]), Path::new("."));
        assert_eq!(line.as_deref(), Some("abcdefghijklmnop"));
    }

    #[test]
    fn eof_and_ctrl_d() {
        assert_eq!(run(b"", &history(&[]), Path::new(".")).0, None);
        assert_eq!(run(b"\x04", &history(&[]), Path::new(".")).0, None);
        assert_eq!(
            run(b"ab\x04c\n", &history(&[]), Path::new(".")).0.as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn arrows_browse_history() {
        let h = history(&["first", "second", "third"]);
        let (line, _) = run(b"\x1b[A\x1b[A\n", &h, Path::new("."));
        assert_eq!(line.as_deref(), Some("second"));

        // stops at the oldest entry
        let (line, _) = run(b"\x1b[A\x1b[A\x1b[A\x1b[A\n", &h, Path::new("."));
        assert_eq!(line.as_deref(), Some("first"));

        let (line, _) = run(b"\x1b[A\x1b[A\x1b[B\n", &h, Path::new("."));
        assert_eq!(line.as_deref(), Some("third"));

        // moving past the newest clears the buffer
        let (line, _) = run(b"\x1b[A\x1b[Bpwd\n", &h, Path::new("."));
        assert_eq!(line.as_deref(), Some("pwd"));
    }

    #[test]
    fn unknown_escape_is_discarded() {
        let (line, _) = run(b"a\x1b[Cb\x1bxc\n", &history(&[]), Path::new("."));
        assert_eq!(line.as_deref(), Some("abc"));
    }

    #[test]
    fn single_candidate_completes_in_place() {
        let (line, out) = run(b"hi\t\n", &history(&[]), Path::new("."));
        assert_eq!(line.as_deref(), Some("history"));
        assert!(out.contains("\r\x1b[2K$ history"));
    }

    #[test]
    fn second_tab_lists_candidates() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("report.txt")).unwrap();
        File::create(dir.path().join("report2.txt")).unwrap();
        let h = history(&[]);

        let mut input = Cursor::new(b"cat rep\t".to_vec());
        let mut output = Vec::new();
        editor()
            .read_from(&mut input, &mut output, "$ ", &h, dir.path())
            .unwrap();
        let once = String::from_utf8(output).unwrap();
        assert!(!once.contains("report2.txt"));

        let (line, twice) = run(b"cat rep\t\t\n", &h, dir.path());
        assert_eq!(line.as_deref(), Some("cat rep"));
        assert!(twice.contains("report.txt  report2.txt\n$ cat rep"));
    }

    #[test]
    fn other_key_resets_tab_counter() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("report.txt")).unwrap();
        File::create(dir.path().join("report2.txt")).unwrap();
        let (line, out) = run(b"cat rep\tx\x7f\t\n", &history(&[]), dir.path());
        assert_eq!(line.as_deref(), Some("cat rep"));
        assert!(!out.contains("report2.txt"));
    }

    #[test]
    fn tab_after_recalling_wide_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("report.txt")).unwrap();
        let h = history(&["cat\u{a0}rep"]);
        let (line, _) = run(b"\x1b[A\t\n", &h, dir.path());
        assert_eq!(line.as_deref(), Some("cat\u{a0}report.txt"));
    }
}
