// Raw NETLINK_SOCK_DIAG socket

use super::error::{SockDiagError, SockDiagResult};
use nix::sched::{CloneFlags, setns};
use std::fs::File;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

/// Upper bound for a single receive; the kernel never leaves us hanging
/// longer than this on a dump
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Netlink socket talking to the kernel's socket-diagnostics subsystem.
///
/// The descriptor is closed when the value is dropped.
pub struct SockDiagSocket {
    fd: OwnedFd,
}

fn kernel_addr() -> libc::sockaddr_nl {
    // SAFETY: sockaddr_nl is plain old data, all-zero is a valid value
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr
}

impl SockDiagSocket {
    /// Open a socket in the caller's network namespace
    pub fn open() -> SockDiagResult<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_SOCK_DIAG,
            )
        };
        if raw < 0 {
            return Err(SockDiagError::Open(io::Error::last_os_error()));
        }
        // SAFETY: `raw` is a freshly created descriptor nobody else owns
        let socket = Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        };

        socket.bind().map_err(SockDiagError::Open)?;
        socket
            .set_recv_timeout(RECV_TIMEOUT)
            .map_err(SockDiagError::Open)?;
        Ok(socket)
    }

    /// Open a socket inside the network namespace referenced by `path`.
    ///
    /// A helper thread joins the namespace and creates the socket there.
    /// The socket keeps talking to that namespace after the thread exits,
    /// and the caller's own threads never change namespace.
    pub fn open_in_namespace(path: &Path) -> SockDiagResult<Self> {
        let namespace_err = |source: io::Error| SockDiagError::Namespace {
            path: path.to_path_buf(),
            source,
        };
        let ns = File::open(path).map_err(namespace_err)?;

        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    setns(&ns, CloneFlags::CLONE_NEWNET)
                        .map_err(|errno| namespace_err(io::Error::from(errno)))?;
                    Self::open()
                })
                .join()
                .unwrap_or_else(|_| {
                    Err(namespace_err(io::Error::other(
                        "namespace helper thread panicked",
                    )))
                })
        })
    }

    fn bind(&self) -> io::Result<()> {
        let addr = kernel_addr();
        let ret = unsafe {
            libc::bind(
                self.fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Send one complete netlink message to the kernel
    pub fn send(&self, msg: &[u8]) -> SockDiagResult<()> {
        let addr = kernel_addr();
        let ret = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if ret as usize != msg.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short netlink send").into());
        }
        Ok(())
    }

    /// Receive one datagram into `buf`, returning its length.
    ///
    /// A datagram larger than `buf` is reported as truncated instead of
    /// being silently cut.
    pub fn recv(&self, buf: &mut [u8]) -> SockDiagResult<usize> {
        loop {
            let ret = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_TRUNC,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            let len = ret as usize;
            if len > buf.len() {
                return Err(SockDiagError::Truncated {
                    what: "netlink datagram",
                    need: len,
                    got: buf.len(),
                });
            }
            return Ok(len);
        }
    }
}
