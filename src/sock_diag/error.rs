// Error types for socket diagnostics queries.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the `NETLINK_SOCK_DIAG` client.
///
/// Every variant is fatal to the discovery pass: a record that does not
/// decode means the stream is out of sync, not that one socket is odd.
#[derive(Debug, Error)]
pub enum SockDiagError {
    /// Creating or binding the netlink socket failed.
    #[error("Failed to open sock_diag channel: {0}")]
    Open(#[source] io::Error),

    /// Entering the requested network namespace failed.
    #[error("Failed to enter network namespace {path:?}: {source}")]
    Namespace {
        /// Namespace file we tried to join.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Sending the request or receiving a response failed.
    #[error("sock_diag I/O error: {0}")]
    Io(#[from] io::Error),

    /// The kernel answered with `NLMSG_ERROR`.
    #[error("Kernel rejected sock_diag request: {0}")]
    Kernel(#[source] io::Error),

    /// A header or record is shorter than its fixed layout.
    #[error("Truncated {what}: need {need} bytes, got {got}")]
    Truncated {
        what: &'static str,
        need: usize,
        got: usize,
    },

    /// A message that does not belong to our dump arrived.
    #[error("Unexpected netlink message type {kind} (seq {seq})")]
    Unexpected { kind: u16, seq: u32 },
}

/// Result type for sock_diag operations.
pub type SockDiagResult<T> = Result<T, SockDiagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_error() {
        let err = SockDiagError::Truncated {
            what: "inet_diag_msg",
            need: 72,
            got: 40,
        };
        let msg = err.to_string();
        assert!(msg.contains("inet_diag_msg"));
        assert!(msg.contains("72"));
        assert!(msg.contains("40"));
    }

    #[test]
    fn test_namespace_error() {
        let err = SockDiagError::Namespace {
            path: PathBuf::from("/run/netns/gdns0"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().contains("gdns0"));
    }
}
