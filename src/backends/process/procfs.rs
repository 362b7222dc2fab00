// Linux procfs-based process table

use super::{ProcessTable, Probe};
use anyhow::{Context, Result};
use procfs::ProcError;
use procfs::process::{FDTarget, Process, all_processes_with_root};
use std::io;
use std::path::{Path, PathBuf};

/// Process table backed by the /proc filesystem
///
/// Reads:
/// - /proc/[pid]/cmdline - for the program path
/// - /proc/[pid]/fd/ - for `socket:[<inode>]` descriptors
pub struct ProcfsTable {
    root: PathBuf,
}

impl Default for ProcfsTable {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcfsTable {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn process_dir(&self, pid: i32) -> PathBuf {
        self.root.join(pid.to_string())
    }
}

/// Sort per-process failures into "gone", "not ours to read" and real errors
fn classify<T>(err: ProcError) -> Result<Probe<T>> {
    match err {
        ProcError::NotFound(_) => Ok(Probe::NotFound),
        ProcError::PermissionDenied(_) => Ok(Probe::PermissionDenied),
        ProcError::Io(e, _) if e.raw_os_error() == Some(libc::ESRCH) => Ok(Probe::NotFound),
        other => Err(other.into()),
    }
}

/// Command lines are world-readable, so only a vanished process is tolerated
fn classify_cmdline<T>(err: io::Error, path: &Path) -> Result<Probe<T>> {
    if err.raw_os_error() == Some(libc::ESRCH) || err.kind() == io::ErrorKind::NotFound {
        return Ok(Probe::NotFound);
    }
    Err(err).with_context(|| format!("Failed to read {}", path.display()))
}

/// First NUL-terminated token of a raw command line
fn program_path(cmdline: &[u8]) -> Option<String> {
    let end = cmdline
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(cmdline.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&cmdline[..end]).into_owned())
}

impl ProcessTable for ProcfsTable {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn pids(&self) -> Result<Vec<i32>> {
        let procs = all_processes_with_root(&self.root)
            .with_context(|| format!("Failed to list processes in {}", self.root.display()))?;

        let mut pids = Vec::new();
        for proc_result in procs {
            match proc_result {
                Ok(process) => pids.push(process.pid()),
                Err(err) => {
                    // Gone or hidden already; anything else is fatal
                    classify::<()>(err)?;
                }
            }
        }
        Ok(pids)
    }

    fn command(&self, pid: i32) -> Result<Probe<Option<String>>> {
        // Read raw bytes: argv is not guaranteed to be UTF-8
        let path = self.process_dir(pid).join("cmdline");
        match std::fs::read(&path) {
            Ok(cmdline) => Ok(Probe::Found(program_path(&cmdline))),
            Err(err) => classify_cmdline(err, &path),
        }
    }

    fn socket_inodes(&self, pid: i32) -> Result<Probe<Vec<u64>>> {
        let process = match Process::new_with_root(self.process_dir(pid)) {
            Ok(process) => process,
            Err(err) => return classify(err),
        };
        let fds = match process.fd() {
            Ok(fds) => fds,
            Err(err) => return classify(err),
        };

        let mut inodes = Vec::new();
        for fd_result in fds {
            match fd_result {
                Ok(fd_info) => {
                    if let FDTarget::Socket(inode) = fd_info.target {
                        inodes.push(inode);
                    }
                }
                // Descriptor closed while we were looking
                Err(ProcError::NotFound(_)) => continue,
                Err(err) => return classify(err),
            }
        }
        Ok(Probe::Found(inodes))
    }
}
