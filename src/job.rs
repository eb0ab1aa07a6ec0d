extern crate libc;
extern crate nix;

use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::wait::{self, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::*;
use std::path::Path;
use std::process;
use tracing::{debug, warn};

use crate::builtin;
use crate::common::*;
use crate::parser::{ParsedStage, Pipeline};
use crate::resolve::{Lookup, PathResolver};
use crate::sh::Shell;
use crate::signal;

pub const EXIT_NOT_FOUND: i32 = 127;
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
pub const EXIT_INPUT_FAILED: i32 = 125;
pub const EXIT_OUTPUT_FAILED: i32 = 124;

/// Processes spawned for one pipeline. `statuses` is filled only for
/// foreground jobs, in spawn order.
#[derive(Debug)]
pub struct Job {
    pub pids: Vec<Pid>,
    pub background: bool,
    pub statuses: Vec<WaitStatus>,
}

#[derive(Debug)]
enum Program {
    Builtin,
    External(CString),
    Missing(i32),
}

/// Everything a child needs, built before forking so the child only
/// rewires descriptors and execs.
#[derive(Debug)]
struct PreparedStage {
    words: Vec<String>,
    argv: Vec<CString>,
    program: Program,
    input: Option<CString>,
    output: Option<CString>,
}

/// Inter-stage pipes; pipe `i` joins stage `i` to stage `i + 1`.
struct Pipes {
    fds: Vec<(RawFd, RawFd)>,
}

impl Pipes {
    fn open(count: usize) -> Result<Pipes> {
        let mut pipes = Pipes { fds: Vec::with_capacity(count) };
        for _ in 0..count {
            // already-open pipes are closed by Drop
            let fds = unistd::pipe().map_err(ShellError::Pipe)?;
            pipes.fds.push(fds);
        }
        Ok(pipes)
    }

    fn read_end(&self, i: usize) -> RawFd {
        self.fds[i].0
    }

    fn write_end(&self, i: usize) -> RawFd {
        self.fds[i].1
    }

    fn close_all(&mut self) {
        for (read, write) in self.fds.drain(..) {
            let _ = unistd::close(read);
            let _ = unistd::close(write);
        }
    }
}

impl Drop for Pipes {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Spawns one process per stage, wired left to right. Foreground jobs are
/// waited for; background jobs are reported and left alone.
pub fn run(pipeline: &Pipeline, raw_line: &str, sh: &mut Shell) -> Result<Job> {
    let paths = PathResolver::from_env();
    let stages = pipeline
        .stages
        .iter()
        .map(|s| prepare(s, &paths))
        .collect::<Result<Vec<_>>>()?;
    let mut pipes = Pipes::open(stages.len().saturating_sub(1))?;
    let mut job = Job {
        pids: Vec::with_capacity(stages.len()),
        background: pipeline.background,
        statuses: Vec::new(),
    };

    for (i, stage) in stages.iter().enumerate() {
        // the shell is single-threaded and the child only rewires
        // descriptors before exec or a built-in
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                signal::reset_child();
                let code = child(i, stages.len(), stage, &mut pipes, raw_line, sh);
                let _ = io::stdout().flush();
                process::exit(code);
            }
            Ok(ForkResult::Parent { child, .. }) => job.pids.push(child),
            Err(e) => {
                warn!(spawned = ?job.pids, "fork failed; leaving spawned stages running");
                return Err(ShellError::Fork(e));
            }
        }
    }
    pipes.close_all();
    debug!(pids = ?job.pids, background = job.background, "spawned pipeline");

    if job.background {
        for pid in &job.pids {
            eprintln!("[PID {}] running in background", pid);
        }
        return Ok(job);
    }

    signal::set_foreground(true);
    for pid in &job.pids {
        if let Some(status) = wait_for(*pid) {
            job.statuses.push(status);
        }
    }
    signal::set_foreground(false);
    debug!(statuses = ?job.statuses, "pipeline finished");

    if let ([stage], [status]) = (stages.as_slice(), job.statuses.as_slice()) {
        if !matches!(stage.program, Program::Builtin) {
            let parsed = &pipeline.stages[0];
            let input = parsed.input.as_deref();
            if let Some(msg) = report_failure(stage, input, parsed.output.as_deref(), status) {
                eprintln!("{}", msg);
            }
        }
    }
    Ok(job)
}

/// Runs a sole state-mutating built-in in the shell itself, with its
/// redirections applied to the shell's descriptors for the call.
pub fn run_here(stage: &ParsedStage, raw_line: &str, sh: &mut Shell) -> Result<()> {
    let _redirect = Redirected::apply(stage)?;
    builtin::dispatch(sh, &stage.argv, raw_line)?;
    Ok(())
}

fn prepare(stage: &ParsedStage, paths: &PathResolver) -> Result<PreparedStage> {
    let argv = stage
        .argv
        .iter()
        .map(|w| cstring(w.as_bytes()))
        .collect::<Result<Vec<_>>>()?;
    let program = if builtin::lookup(stage.name()).is_some() {
        Program::Builtin
    } else {
        match paths.lookup(stage.name()) {
            Lookup::Found(path) => Program::External(cstring(path.as_os_str().as_bytes())?),
            Lookup::NotExecutable(_) => Program::Missing(EXIT_NOT_EXECUTABLE),
            Lookup::NotFound => Program::Missing(EXIT_NOT_FOUND),
        }
    };
    let input = match &stage.input {
        Some(p) => Some(cstring(p.as_os_str().as_bytes())?),
        None => None,
    };
    let output = match &stage.output {
        Some(p) => Some(cstring(p.as_os_str().as_bytes())?),
        None => None,
    };
    Ok(PreparedStage {
        words: stage.argv.clone(),
        argv,
        program,
        input,
        output,
    })
}

fn cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes)
        .map_err(|e| ShellError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))
}

/// Body of a forked stage. Returns the exit code when it cannot exec.
fn child(
    i: usize,
    count: usize,
    stage: &PreparedStage,
    pipes: &mut Pipes,
    raw_line: &str,
    sh: &mut Shell,
) -> i32 {
    if i > 0 && unistd::dup2(pipes.read_end(i - 1), libc::STDIN_FILENO).is_err() {
        return 1;
    }
    if i + 1 < count && unistd::dup2(pipes.write_end(i), libc::STDOUT_FILENO).is_err() {
        return 1;
    }
    pipes.close_all();

    if let Some(path) = &stage.input {
        if redirect(path, OFlag::O_RDONLY, libc::STDIN_FILENO).is_err() {
            return EXIT_INPUT_FAILED;
        }
    }
    if let Some(path) = &stage.output {
        let flags = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC;
        if redirect(path, flags, libc::STDOUT_FILENO).is_err() {
            return EXIT_OUTPUT_FAILED;
        }
    }

    match &stage.program {
        Program::Builtin => {
            sh.detach_storage();
            match builtin::dispatch(sh, &stage.words, raw_line) {
                Ok(_) => 0,
                Err(e) => {
                    eprintln!("mysh: {}", e);
                    1
                }
            }
        }
        Program::External(path) => {
            let argv: Vec<&CStr> = stage.argv.iter().map(|x| x.as_c_str()).collect();
            match unistd::execv(path, &argv) {
                Err(nix::Error::Sys(Errno::ENOENT)) => EXIT_NOT_FOUND,
                _ => EXIT_NOT_EXECUTABLE,
            }
        }
        Program::Missing(code) => *code,
    }
}

fn redirect(path: &CStr, flags: OFlag, target: RawFd) -> nix::Result<()> {
    let fd = fcntl::open(path, flags, Mode::from_bits_truncate(0o644))?;
    if fd != target {
        unistd::dup2(fd, target)?;
        unistd::close(fd)?;
    }
    Ok(())
}

fn wait_for(pid: Pid) -> Option<WaitStatus> {
    loop {
        match wait::waitpid(pid, None) {
            Ok(status) => return Some(status),
            Err(nix::Error::Sys(Errno::EINTR)) => continue,
            Err(e) => {
                warn!(pid = pid.as_raw(), error = %e, "waitpid failed");
                return None;
            }
        }
    }
}

/// Diagnostic for a sole foreground stage that did not exit cleanly.
fn report_failure(
    stage: &PreparedStage,
    input: Option<&Path>,
    output: Option<&Path>,
    status: &WaitStatus,
) -> Option<String> {
    let name = stage.words.first().map(String::as_str).unwrap_or("");
    let code = match status {
        WaitStatus::Exited(_, code) => *code,
        _ => return None,
    };
    let msg = match code {
        0 => return None,
        EXIT_NOT_FOUND if matches!(stage.program, Program::Missing(_)) => {
            format!("Unknown command: {}", name)
        }
        EXIT_NOT_EXECUTABLE => {
            format!("mysh: {}: permission denied", name)
        }
        EXIT_INPUT_FAILED if input.is_some() => {
            format!("mysh: cannot open {} for reading", display(input))
        }
        EXIT_OUTPUT_FAILED if output.is_some() => {
            format!("mysh: cannot open {} for writing", display(output))
        }
        _ => format!("mysh: {}: exited with status {}", name, code),
    };
    Some(msg)
}

fn display(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}

/// Standard descriptors of the shell itself pointed at files; restored on
/// drop.
struct Redirected {
    saved: Vec<(RawFd, RawFd)>,
}

impl Redirected {
    fn apply(stage: &ParsedStage) -> Result<Redirected> {
        let mut guard = Redirected { saved: Vec::new() };
        if let Some(path) = &stage.input {
            let f = File::open(path).map_err(|source| ShellError::Redirect {
                path: path.clone(),
                source,
            })?;
            guard.replace(libc::STDIN_FILENO, f.as_raw_fd())?;
        }
        if let Some(path) = &stage.output {
            let f = File::create(path).map_err(|source| ShellError::Redirect {
                path: path.clone(),
                source,
            })?;
            io::stdout().flush()?;
            guard.replace(libc::STDOUT_FILENO, f.as_raw_fd())?;
        }
        Ok(guard)
    }

    fn replace(&mut self, target: RawFd, fd: RawFd) -> Result<()> {
        let saved = unistd::dup(target).map_err(sys)?;
        self.saved.push((target, saved));
        unistd::dup2(fd, target).map_err(sys)?;
        Ok(())
    }
}

impl Drop for Redirected {
    fn drop(&mut self) {
        let _ = io::stdout().flush();
        for (target, saved) in self.saved.drain(..).rev() {
            let _ = unistd::dup2(saved, target);
            let _ = unistd::close(saved);
        }
    }
}

fn sys(e: nix::Error) -> ShellError {
    ShellError::Io(io::Error::new(io::ErrorKind::Other, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::AliasTable;
    use crate::config::Config;
    use crate::parser::parse_in;
    use nix::sys::signal::{self as nix_signal, Signal};
    use std::fs;
    use std::time::{Duration, Instant};

    fn shell() -> Shell {
        Shell::ephemeral(Config::default())
    }

    fn pipeline(line: &str) -> Pipeline {
        parse_in(line, &AliasTable::new(4), Path::new("/nonexistent-dir")).unwrap()
    }

    fn exited(job: &Job) -> Vec<i32> {
        job.statuses
            .iter()
            .map(|s| match s {
                WaitStatus::Exited(_, code) => *code,
                other => panic!("unexpected status {:?}", other),
            })
            .collect()
    }

    #[test]
    fn one_process_per_stage_all_awaited() {
        let p = pipeline("true | true | true");
        let job = run(&p, "true | true | true", &mut shell()).unwrap();
        assert_eq!(job.pids.len(), 3);
        assert_eq!(job.statuses.len(), 3);
        assert_eq!(exited(&job), vec![0, 0, 0]);
    }

    #[test]
    fn redirection_without_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        fs::write(&input, "pear\napple\nfig\n").unwrap();
        fs::write(&output, "stale contents that must be truncated\n").unwrap();

        let line = format!("sort < {} > {}", input.display(), output.display());
        let job = run(&pipeline(&line), &line, &mut shell()).unwrap();
        assert_eq!(job.pids.len(), 1);
        assert_eq!(exited(&job), vec![0]);
        assert_eq!(fs::read_to_string(&output).unwrap(), "apple\nfig\npear\n");
    }

    #[test]
    fn pipeline_with_redirection_at_both_ends() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "foo 1\nbar\nfoo 2\nbaz\n").unwrap();

        let line = format!("/bin/grep foo < {} | wc -l > {}", a.display(), b.display());
        let job = run(&pipeline(&line), &line, &mut shell()).unwrap();
        assert_eq!(exited(&job), vec![0, 0]);
        assert_eq!(fs::read_to_string(&b).unwrap().trim(), "2");
    }

    #[test]
    fn downstream_sees_end_of_stream() {
        // a leaked write end would keep `cat` blocked forever
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let line = format!("/bin/sh -c exit | /bin/cat | /bin/cat > {}", out.display());
        let job = run(&pipeline(&line), &line, &mut shell()).unwrap();
        assert_eq!(exited(&job), vec![0, 0, 0]);
        assert_eq!(fs::read_to_string(&out).unwrap(), "");
    }

    #[test]
    fn missing_command_exits_distinctly() {
        let p = pipeline("no-such-program-here --flag");
        let job = run(&p, "no-such-program-here --flag", &mut shell()).unwrap();
        assert_eq!(exited(&job), vec![EXIT_NOT_FOUND]);
    }

    #[test]
    fn failed_redirection_only_fails_its_stage() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let line = format!(
            "/bin/cat < {} | /bin/cat > {}",
            dir.path().join("missing.txt").display(),
            out.display()
        );
        let job = run(&pipeline(&line), &line, &mut shell()).unwrap();
        assert_eq!(job.pids.len(), 2);
        assert_eq!(exited(&job), vec![EXIT_INPUT_FAILED, 0]);
        assert_eq!(fs::read_to_string(&out).unwrap(), "");
    }

    #[test]
    fn background_returns_without_waiting() {
        let p = pipeline("sleep 5 &");
        let started = Instant::now();
        let job = run(&p, "sleep 5 &", &mut shell()).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(job.background);
        assert!(job.statuses.is_empty());
        assert_eq!(job.pids.len(), 1);

        let pid = job.pids[0];
        assert!(nix_signal::kill(pid, None).is_ok());
        nix_signal::kill(pid, Signal::SIGKILL).unwrap();
        wait::waitpid(pid, None).unwrap();
    }

    fn prepared(line: &str) -> (ParsedStage, PreparedStage) {
        let parsed = pipeline(line).stages.remove(0);
        let stage = prepare(&parsed, &PathResolver::from_env()).unwrap();
        (parsed, stage)
    }

    fn exit_with(code: i32) -> WaitStatus {
        WaitStatus::Exited(Pid::from_raw(1), code)
    }

    #[test]
    fn failure_messages_for_sole_stage() {
        let (_, missing) = prepared("no-such-program-here");
        assert_eq!(
            report_failure(&missing, None, None, &exit_with(EXIT_NOT_FOUND)).as_deref(),
            Some("Unknown command: no-such-program-here")
        );

        let (parsed, script) = prepared("/bin/sh -c exit < in.txt");
        let input = parsed.input.as_deref();
        assert_eq!(
            report_failure(&script, input, None, &exit_with(EXIT_INPUT_FAILED)).as_deref(),
            Some("mysh: cannot open in.txt for reading")
        );
        assert_eq!(
            report_failure(&script, None, None, &exit_with(3)).as_deref(),
            Some("mysh: /bin/sh: exited with status 3")
        );
        // a program that itself exits 127 is not "unknown"
        assert_eq!(
            report_failure(&script, None, None, &exit_with(EXIT_NOT_FOUND)).as_deref(),
            Some("mysh: /bin/sh: exited with status 127")
        );
        assert_eq!(report_failure(&script, None, None, &exit_with(0)), None);
    }

    #[test]
    fn run_here_redirects_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("aliases.txt");
        let mut sh = shell();
        sh.aliases.define("ll", "ls -l").unwrap();
        let line = format!("alias > {}", out.display());
        let p = pipeline(&line);
        run_here(&p.stages[0], &line, &mut sh).unwrap();
        // other test threads may write to the shared stdout meanwhile
        assert!(fs::read_to_string(&out)
            .unwrap()
            .contains("alias ll='ls -l'\n"));
    }

    #[test]
    fn run_here_reports_missing_input() {
        let line = "history < /nonexistent-dir/input.txt";
        let p = pipeline(line);
        let res = run_here(&p.stages[0], line, &mut shell());
        assert!(matches!(res, Err(ShellError::Redirect { .. })));
    }
}
