// Socket-to-process attribution
//
// Walks the process table and matches each process's `socket:[<inode>]`
// descriptors against the sockets reported by sock_diag. Processes that
// disappear halfway through, or whose descriptors we may not read, are part
// of normal life on a busy system and are not errors. An unreadable command
// line is.

use crate::service::ListeningSocket;
use anyhow::{Result, anyhow};
use std::collections::HashMap;

#[cfg(target_os = "linux")]
mod procfs;
#[cfg(target_os = "linux")]
pub use self::procfs::ProcfsTable;

/// Outcome of looking at one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Found(T),
    /// The process exited between listing and inspection
    NotFound,
    /// We are not allowed to look (someone else's process, no CAP_SYS_PTRACE)
    PermissionDenied,
}

/// Read access to a process table
///
/// Implementations return `Err` only for failures that make the whole
/// table untrustworthy; per-process trouble is a [`Probe`] outcome.
pub trait ProcessTable: Send + Sync {
    /// Backend name (e.g., "procfs")
    fn name(&self) -> &'static str;

    /// All process IDs currently listed
    fn pids(&self) -> Result<Vec<i32>>;

    /// Program path: the first NUL-terminated token of the command line.
    /// `None` for processes without one (kernel threads, zombies).
    /// Only descriptor listing may report `PermissionDenied`.
    fn command(&self, pid: i32) -> Result<Probe<Option<String>>>;

    /// Inodes of all socket descriptors the process holds
    fn socket_inodes(&self, pid: i32) -> Result<Probe<Vec<u64>>>;
}

/// Attach the owning program path to every socket some process holds.
///
/// Sockets nobody claims keep `command == None`.
pub fn attribute_processes(sockets: &mut [ListeningSocket], table: &dyn ProcessTable) -> Result<()> {
    let mut by_inode: HashMap<u64, Vec<usize>> = HashMap::with_capacity(sockets.len());
    for (idx, socket) in sockets.iter().enumerate() {
        by_inode.entry(u64::from(socket.inode)).or_default().push(idx);
    }
    if by_inode.is_empty() {
        return Ok(());
    }

    for pid in table.pids()? {
        let command = match table.command(pid)? {
            Probe::Found(Some(command)) => command,
            Probe::Found(None) => continue,
            Probe::NotFound => {
                log::trace!("PID {} vanished before its command line was read", pid);
                continue;
            }
            Probe::PermissionDenied => {
                return Err(anyhow!("Permission denied reading the command line of PID {}", pid));
            }
        };

        let inodes = match table.socket_inodes(pid)? {
            Probe::Found(inodes) => inodes,
            Probe::NotFound => {
                log::trace!("PID {} vanished before its descriptors were read", pid);
                continue;
            }
            Probe::PermissionDenied => {
                log::trace!("PID {} ({}): descriptors not readable, skipping", pid, command);
                continue;
            }
        };

        for inode in inodes {
            if let Some(indices) = by_inode.get(&inode) {
                for &idx in indices {
                    log::debug!("{} owned by PID {} ({})", sockets[idx], pid, command);
                    sockets[idx].command = Some(command.clone());
                }
            }
        }
    }

    Ok(())
}
