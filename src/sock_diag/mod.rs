// Listening socket discovery over `NETLINK_SOCK_DIAG`.
//
// Asks the kernel for every TCP socket in LISTEN or CLOSE state, the same
// data `ss -tln` shows, without parsing `/proc/net/tcp6`.
//
// Only `AF_INET6` is queried. IPv4 records still decode correctly (see
// `wire::InetDiagMsg::local_addr`) should the family list ever grow.

pub mod error;
mod socket;
pub mod wire;

pub use error::{SockDiagError, SockDiagResult};

use crate::service::ListeningSocket;
use socket::SockDiagSocket;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

const RECV_BUFFER_LEN: usize = 64 * 1024;

/// Families queried on every discovery pass
const FAMILIES: &[u8] = &[wire::AF_INET6];

static NEXT_SEQ: AtomicU32 = AtomicU32::new(1);

/// Enumerate listening TCP sockets, optionally inside another network
/// namespace (`/proc/<pid>/ns/net`, `/run/netns/<name>`, ...).
///
/// The netlink channel only lives for the duration of this call.
pub fn discover_listening_sockets(namespace: Option<&Path>) -> SockDiagResult<Vec<ListeningSocket>> {
    let socket = match namespace {
        Some(path) => SockDiagSocket::open_in_namespace(path)?,
        None => SockDiagSocket::open()?,
    };

    let mut sockets = Vec::new();
    for &family in FAMILIES {
        dump_family(&socket, family, &mut sockets)?;
    }

    log::debug!(
        "sock_diag reported {} listening socket(s){}",
        sockets.len(),
        namespace
            .map(|p| format!(" in {}", p.display()))
            .unwrap_or_default()
    );
    Ok(sockets)
}

fn dump_family(
    socket: &SockDiagSocket,
    family: u8,
    out: &mut Vec<ListeningSocket>,
) -> SockDiagResult<()> {
    let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
    socket.send(&wire::dump_request(family, seq))?;

    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        let len = socket.recv(&mut buf)?;
        if len == 0 {
            return Err(SockDiagError::Truncated {
                what: "netlink dump",
                need: wire::NLMSG_HDR_LEN,
                got: 0,
            });
        }
        if wire::parse_dump(&buf[..len], seq, out)? {
            return Ok(());
        }
    }
}
