use std::io::{self, Write};
use tracing::error;

use crate::builtin;
use crate::common::*;
use crate::config::Config;
use crate::editor::LineEditor;
use crate::history::HistoryLog;
use crate::job;
use crate::parser;
use crate::sh::Shell;
use crate::signal;

const CONTINUATION_PROMPT: &str = "> ";

/// Where the loop gets its lines from. `None` is end of input.
pub trait LineSource {
    fn next_line(&mut self, prompt: &str, history: &HistoryLog) -> Result<Option<String>>;
}

impl LineSource for LineEditor {
    fn next_line(&mut self, prompt: &str, history: &HistoryLog) -> Result<Option<String>> {
        signal::set_prompt(prompt);
        print!("{}", prompt);
        io::stdout().flush()?;
        self.read_line(prompt, history)
    }
}

#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Stop,
}

/// The read-parse-dispatch loop.
pub struct Cli {
    sh: Shell,
    editor: LineEditor,
}

impl Cli {
    pub fn new(config: Config) -> Result<Cli> {
        signal::install()?;
        let editor = LineEditor::new(config.max_line, builtin::names());
        Ok(Cli {
            sh: Shell::new(config),
            editor,
        })
    }

    pub fn go(&mut self) -> Result<()> {
        loop {
            signal::reap_zombies();
            if step(&mut self.sh, &mut self.editor) == Flow::Stop {
                break;
            }
        }
        self.sh.history.flush()?;
        Ok(())
    }
}

/// One turn of the loop: read a command and run it.
fn step<S: LineSource>(sh: &mut Shell, source: &mut S) -> Flow {
    let line = match read_command(sh, source) {
        Ok(Some(line)) => line,
        Ok(None) => return Flow::Stop,
        Err(e @ ShellError::TooLong(_)) => {
            eprintln!("mysh: {}", e);
            return Flow::Continue;
        }
        Err(e) => {
            error!(error = %e, "cannot read input");
            return Flow::Stop;
        }
    };
    dispatch(sh, &line);
    if sh.should_exit {
        Flow::Stop
    } else {
        Flow::Continue
    }
}

/// Reads one command, joining lines that end in `\`.
fn read_command<S: LineSource>(sh: &Shell, source: &mut S) -> Result<Option<String>> {
    let prompt = sh.prompt();
    let mut line = match source.next_line(&prompt, &sh.history)? {
        Some(l) => l,
        None => return Ok(None),
    };
    while line.ends_with('\\') {
        line.pop();
        let next = match source.next_line(CONTINUATION_PROMPT, &sh.history)? {
            Some(l) => l,
            None => break,
        };
        if line.len() + next.len() >= sh.config.max_command {
            return Err(ShellError::TooLong(sh.config.max_command));
        }
        line.push_str(&next);
    }
    Ok(Some(line))
}

fn dispatch(sh: &mut Shell, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    sh.history.record(line);

    let pipeline = match parser::parse(line, &sh.aliases) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("mysh: {}", ShellError::from(e));
            return;
        }
    };
    if pipeline.is_empty() {
        return;
    }

    // state changes must happen in this process, not a child
    if let [stage] = pipeline.stages.as_slice() {
        if builtin::lookup(stage.name()).map_or(false, |b| b.mutates) {
            if let Err(e) = job::run_here(stage, line, sh) {
                eprintln!("mysh: {}", e);
            }
            return;
        }
    }

    if let Err(e) = job::run(&pipeline, line, sh) {
        eprintln!("mysh: {}", e);
    }
}
