//! Process table helpers built on `/proc`.

use std::fs;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Scheduler state and parent of a process, from `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub state: char,
    pub ppid: u32,
}

/// Parse the contents of a `stat` file. The command name may contain spaces
/// and parentheses, so fields are taken after the last `)`.
pub fn parse_stat(contents: &str) -> Option<ProcStat> {
    let rest = &contents[contents.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some(ProcStat { state, ppid })
}

pub fn stat(pid: u32) -> Option<ProcStat> {
    parse_stat(&fs::read_to_string(format!("/proc/{pid}/stat")).ok()?)
}

/// Whether `pid` exists and is not a zombie.
pub fn is_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => stat(pid).is_none_or(|s| s.state != 'Z'),
        Err(_) => false,
    }
}

/// Whether `pid` has exited but not been reaped.
pub fn is_zombie(pid: u32) -> bool {
    stat(pid).is_some_and(|s| s.state == 'Z')
}

/// Direct children of `pid`.
pub fn children_of(pid: u32) -> Vec<u32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u32>().ok())
        .filter(|&candidate| stat(candidate).is_some_and(|s| s.ppid == pid))
        .collect()
}

/// Signal `pid` and all its descendants.
///
/// Each process is stopped before its children are collected so none can
/// fork away, then signalled and continued.
pub fn kill_tree(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let target = Pid::from_raw(raw);
    let _ = kill(target, Signal::SIGSTOP);
    for child in children_of(pid) {
        kill_tree(child, signal);
    }
    if let Err(e) = kill(target, signal) {
        tracing::trace!(pid, error = %e, "Signal not delivered");
    }
    let _ = kill(target, Signal::SIGCONT);
}

/// Whether any process in the tree rooted at `pid` is a zombie.
pub fn tree_has_zombie(pid: u32) -> bool {
    is_zombie(pid) || children_of(pid).into_iter().any(tree_has_zombie)
}
