extern crate libc;
extern crate nix;

use lazy_static::lazy_static;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::common::*;

lazy_static! {
    static ref PROMPT: Mutex<String> = Mutex::new(String::new());
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static FOREGROUND: AtomicBool = AtomicBool::new(false);

/// Remembers the prompt the SIGINT handler redraws.
pub fn set_prompt(prompt: &str) {
    if let Ok(mut p) = PROMPT.lock() {
        p.clear();
        p.push_str(prompt);
    }
}

/// Marks whether the shell is blocked on a foreground job.
pub fn set_foreground(active: bool) {
    FOREGROUND.store(active, Ordering::SeqCst);
}

/// True once per delivered SIGINT.
pub fn take_interrupt() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}

pub extern "C" fn handle_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    let _ = unistd::write(libc::STDOUT_FILENO, b"\n");
    if FOREGROUND.load(Ordering::SeqCst) {
        return;
    }
    // never block inside the handler
    if let Ok(prompt) = PROMPT.try_lock() {
        let _ = unistd::write(libc::STDOUT_FILENO, prompt.as_bytes());
    }
}

pub fn install() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_sigint),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGINT, &action) }
        .map_err(|e| state(format!("sigaction: {}", e)))?;
    Ok(())
}

/// Puts SIGINT back to its default disposition; used in forked children.
pub fn reset_child() {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    let _ = unsafe { signal::sigaction(Signal::SIGINT, &action) };
}

/// Collects any children that have already exited. Statuses are dropped:
/// background jobs are never reported on.
pub fn reap_zombies() {
    loop {
        match wait::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => {
                if let Some(pid) = status.pid() {
                    debug!(pid = pid.as_raw(), ?status, "reaped background child");
                }
            }
        }
    }
}
