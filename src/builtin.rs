extern crate libc;
extern crate nix;

use nix::unistd::{self, Gid, Group, Uid, User};
use std::env;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use crate::common::*;
use crate::resolve::{self, AliasResolver, BuiltinResolver, PathResolver, Resolver};
use crate::sh::Shell;

type Handler = fn(&mut Shell, &[String], &str, &mut dyn Write) -> Result<()>;

pub struct Builtin {
    pub name: &'static str,
    /// Touches shell-global state, so it has to run in the shell process.
    pub mutates: bool,
    handler: Handler,
}

static BUILTINS: &[Builtin] = &[
    Builtin { name: "cd", mutates: true, handler: cd },
    Builtin { name: "alias", mutates: true, handler: alias },
    Builtin { name: "unalias", mutates: true, handler: unalias },
    Builtin { name: "history", mutates: true, handler: history },
    Builtin { name: "clearhistory", mutates: true, handler: clear_history },
    Builtin { name: "exit", mutates: true, handler: exit },
    Builtin { name: "ls", mutates: false, handler: ls },
    Builtin { name: "cat", mutates: false, handler: cat },
    Builtin { name: "grep", mutates: false, handler: grep },
    Builtin { name: "echo", mutates: false, handler: echo },
    Builtin { name: "type", mutates: false, handler: type_ },
];

pub fn lookup(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name == name)
}

pub fn names() -> Vec<&'static str> {
    BUILTINS.iter().map(|b| b.name).collect()
}

/// Runs `argv` as a built-in against the process's current stdout.
/// `Ok(false)` means the name is not a built-in; an error means it was one
/// and failed.
pub fn dispatch(sh: &mut Shell, argv: &[String], raw_line: &str) -> Result<bool> {
    let builtin = match argv.first().and_then(|name| lookup(name)) {
        Some(b) => b,
        None => return Ok(false),
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let res = (builtin.handler)(sh, &argv[1..], raw_line, &mut out);
    out.flush()?;
    res.map(|_| true)
}

fn cd(sh: &mut Shell, args: &[String], _: &str, _: &mut dyn Write) -> Result<()> {
    sh.cd(args)
}

fn alias(sh: &mut Shell, args: &[String], raw: &str, out: &mut dyn Write) -> Result<()> {
    sh.alias(args, raw, out)
}

fn unalias(sh: &mut Shell, args: &[String], _: &str, _: &mut dyn Write) -> Result<()> {
    sh.unalias(args)
}

fn history(sh: &mut Shell, args: &[String], _: &str, out: &mut dyn Write) -> Result<()> {
    sh.history(args, out)
}

fn clear_history(sh: &mut Shell, _: &[String], _: &str, out: &mut dyn Write) -> Result<()> {
    sh.clear_history(out)
}

fn exit(sh: &mut Shell, _: &[String], _: &str, _: &mut dyn Write) -> Result<()> {
    sh.should_exit = true;
    Ok(())
}

fn echo(_: &mut Shell, args: &[String], _: &str, out: &mut dyn Write) -> Result<()> {
    let words: Vec<String> = args
        .iter()
        .filter_map(|a| match a.strip_prefix('$') {
            Some(var) => env::var(var).ok(),
            None => Some(a.clone()),
        })
        .collect();
    writeln!(out, "{}", words.join(" "))?;
    Ok(())
}

fn type_(sh: &mut Shell, args: &[String], _: &str, out: &mut dyn Write) -> Result<()> {
    if args.is_empty() {
        return Err(state("type: missing argument"));
    }
    let path = PathResolver::from_env();
    let aliases = AliasResolver(&sh.aliases);
    let chain: [&dyn Resolver; 3] = [&BuiltinResolver, &aliases, &path];
    let mut missing = Vec::new();
    for name in args {
        match resolve::resolve(&chain, name) {
            Some(found) => writeln!(out, "{} is {}", name, found)?,
            None => missing.push(name.as_str()),
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(state(format!("type: {}: not found", missing.join(", "))))
    }
}

fn ls(_: &mut Shell, args: &[String], _: &str, out: &mut dyn Write) -> Result<()> {
    let long = args.iter().any(|a| a == "-l");
    let dirs: Vec<&str> = args
        .iter()
        .filter(|a| !a.starts_with('-'))
        .map(String::as_str)
        .collect();
    let dirs = if dirs.is_empty() { vec!["."] } else { dirs };
    for (i, dir) in dirs.iter().enumerate() {
        if dirs.len() > 1 {
            if i > 0 {
                writeln!(out)?;
            }
            writeln!(out, "{}:", dir)?;
        }
        list_dir(Path::new(dir), long, out)?;
    }
    Ok(())
}

fn list_dir(dir: &Path, long: bool, out: &mut dyn Write) -> Result<()> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map_err(|e| state(format!("ls: {}: {}", dir.display(), e)))?
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| !n.starts_with('.'))
        .collect();
    names.sort();
    if !long {
        if !names.is_empty() {
            writeln!(out, "{}", names.join("  "))?;
        }
        return Ok(());
    }
    for name in names {
        let meta = match fs::symlink_metadata(dir.join(&name)) {
            Ok(m) => m,
            Err(_) => continue,
        };
        writeln!(
            out,
            "{} {:>3} {:<8} {:<8} {:>8} {}",
            mode_string(meta.is_dir(), meta.permissions().mode()),
            meta.nlink(),
            user_name(meta.uid()),
            group_name(meta.gid()),
            meta.size(),
            name
        )?;
    }
    Ok(())
}

fn mode_string(is_dir: bool, mode: u32) -> String {
    let mut s = String::with_capacity(10);
    s.push(if is_dir { 'd' } else { '-' });
    for shift in &[6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    s
}

fn user_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(u)) => u.name,
        _ => uid.to_string(),
    }
}

fn group_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(g)) => g.name,
        _ => gid.to_string(),
    }
}

fn cat(_: &mut Shell, args: &[String], _: &str, out: &mut dyn Write) -> Result<()> {
    let (numbered, files) = match args.first().map(String::as_str) {
        Some("-n") => (true, &args[1..]),
        _ => (false, args),
    };
    let mut line_num = 1;
    if files.is_empty() {
        let stdin = io::stdin();
        return copy_lines(stdin.lock(), numbered, &mut line_num, out);
    }
    let mut failed = Vec::new();
    for name in files {
        match File::open(name) {
            Ok(f) => copy_lines(BufReader::new(f), numbered, &mut line_num, out)?,
            Err(e) => failed.push(format!("cat: {}: {}", name, e)),
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(state(failed.join("\n")))
    }
}

fn copy_lines<R: BufRead>(
    reader: R,
    numbered: bool,
    line_num: &mut usize,
    out: &mut dyn Write,
) -> Result<()> {
    for line in reader.lines() {
        let line = line?;
        if numbered {
            writeln!(out, "{:>6}  {}", line_num, line)?;
            *line_num += 1;
        } else {
            writeln!(out, "{}", line)?;
        }
    }
    Ok(())
}

fn grep(_: &mut Shell, args: &[String], _: &str, out: &mut dyn Write) -> Result<()> {
    let (ignore_case, rest) = match args.first().map(String::as_str) {
        Some("-i") => (true, &args[1..]),
        _ => (false, args),
    };
    let pattern = rest
        .first()
        .ok_or_else(|| state("Usage: grep [-i] pattern [file]"))?;
    let highlight = unistd::isatty(libc::STDOUT_FILENO).unwrap_or(false);
    match rest.get(1) {
        Some(name) => {
            let f = File::open(name).map_err(|e| state(format!("grep: {}: {}", name, e)))?;
            grep_lines(BufReader::new(f), pattern, ignore_case, highlight, out)
        }
        None => {
            let stdin = io::stdin();
            grep_lines(stdin.lock(), pattern, ignore_case, highlight, out)
        }
    }
}

fn grep_lines<R: BufRead>(
    reader: R,
    pattern: &str,
    ignore_case: bool,
    highlight: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let needle = if ignore_case {
        pattern.to_ascii_lowercase()
    } else {
        pattern.to_owned()
    };
    for line in reader.lines() {
        let line = line?;
        let hay = if ignore_case {
            line.to_ascii_lowercase()
        } else {
            line.clone()
        };
        if !hay.contains(&needle) {
            continue;
        }
        if !highlight || needle.is_empty() {
            writeln!(out, "{}", line)?;
            continue;
        }
        let mut last = 0;
        let mut marked = String::new();
        for (start, _) in hay.match_indices(&needle) {
            let end = start + needle.len();
            marked.push_str(&line[last..start]);
            marked.push_str("\x1b[1;31m");
            marked.push_str(&line[start..end]);
            marked.push_str("\x1b[0m");
            last = end;
        }
        marked.push_str(&line[last..]);
        writeln!(out, "{}", marked)?;
    }
    Ok(())
}
