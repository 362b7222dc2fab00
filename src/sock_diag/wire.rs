// Binary layout of the `NETLINK_SOCK_DIAG` inet protocol.
//
// Mirrors `struct nlmsghdr`, `struct inet_diag_req_v2` and
// `struct inet_diag_msg` from the kernel UAPI headers. Everything here is
// plain byte shuffling so it can be tested without a kernel.

use super::error::{SockDiagError, SockDiagResult};
use crate::service::ListeningSocket;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const NLMSG_HDR_LEN: usize = 16;
pub const INET_DIAG_SOCKID_LEN: usize = 48;
pub const INET_DIAG_REQ_V2_LEN: usize = 8 + INET_DIAG_SOCKID_LEN;
pub const INET_DIAG_MSG_LEN: usize = 4 + INET_DIAG_SOCKID_LEN + 20;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const SOCK_DIAG_BY_FAMILY: u16 = 20;

pub const NLM_F_REQUEST: u16 = 0x1;
pub const NLM_F_DUMP: u16 = 0x100 | 0x200; // NLM_F_ROOT | NLM_F_MATCH

pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;
pub const IPPROTO_TCP: u8 = 6;

pub const TCP_CLOSE: u32 = 7;
pub const TCP_LISTEN: u32 = 10;

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// `struct nlmsghdr`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NlMsgHdr {
    pub len: u32,
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NlMsgHdr {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.len.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.pid.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> SockDiagResult<Self> {
        if buf.len() < NLMSG_HDR_LEN {
            return Err(SockDiagError::Truncated {
                what: "nlmsghdr",
                need: NLMSG_HDR_LEN,
                got: buf.len(),
            });
        }
        Ok(Self {
            len: u32_at(buf, 0),
            kind: u16_at(buf, 4),
            flags: u16_at(buf, 6),
            seq: u32_at(buf, 8),
            pid: u32_at(buf, 12),
        })
    }
}

/// `struct inet_diag_sockid`
///
/// Ports are kept in host order here; on the wire they are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InetDiagSockId {
    pub sport: u16,
    pub dport: u16,
    pub src: [u8; 16],
    pub dst: [u8; 16],
    pub interface: u32,
    pub cookie: [u32; 2],
}

impl InetDiagSockId {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.sport.to_be_bytes());
        buf.extend_from_slice(&self.dport.to_be_bytes());
        buf.extend_from_slice(&self.src);
        buf.extend_from_slice(&self.dst);
        buf.extend_from_slice(&self.interface.to_le_bytes());
        buf.extend_from_slice(&self.cookie[0].to_le_bytes());
        buf.extend_from_slice(&self.cookie[1].to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&buf[4..20]);
        dst.copy_from_slice(&buf[20..36]);
        Self {
            // Stored in network byte order: swap to host order
            sport: u16_at(buf, 0).swap_bytes(),
            dport: u16_at(buf, 2).swap_bytes(),
            src,
            dst,
            interface: u32_at(buf, 36),
            cookie: [u32_at(buf, 40), u32_at(buf, 44)],
        }
    }
}

/// `struct inet_diag_req_v2`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InetDiagReqV2 {
    pub family: u8,
    pub protocol: u8,
    pub ext: u8,
    pub states: u32,
    pub id: InetDiagSockId,
}

impl InetDiagReqV2 {
    /// Dump request for TCP sockets of `family` in LISTEN or CLOSE state
    pub fn listening(family: u8) -> Self {
        Self {
            family,
            protocol: IPPROTO_TCP,
            ext: 0,
            states: (1 << TCP_LISTEN) | (1 << TCP_CLOSE),
            id: InetDiagSockId::default(),
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.family);
        buf.push(self.protocol);
        buf.push(self.ext);
        buf.push(0); // pad
        buf.extend_from_slice(&self.states.to_le_bytes());
        self.id.encode(buf);
    }
}

/// `struct inet_diag_msg`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InetDiagMsg {
    pub family: u8,
    pub state: u8,
    pub timer: u8,
    pub retrans: u8,
    pub id: InetDiagSockId,
    pub expires: u32,
    pub rqueue: u32,
    pub wqueue: u32,
    pub uid: u32,
    pub inode: u32,
}

impl InetDiagMsg {
    pub fn decode(buf: &[u8]) -> SockDiagResult<Self> {
        if buf.len() < INET_DIAG_MSG_LEN {
            return Err(SockDiagError::Truncated {
                what: "inet_diag_msg",
                need: INET_DIAG_MSG_LEN,
                got: buf.len(),
            });
        }
        let tail = 4 + INET_DIAG_SOCKID_LEN;
        Ok(Self {
            family: buf[0],
            state: buf[1],
            timer: buf[2],
            retrans: buf[3],
            id: InetDiagSockId::decode(&buf[4..tail]),
            expires: u32_at(buf, tail),
            rqueue: u32_at(buf, tail + 4),
            wqueue: u32_at(buf, tail + 8),
            uid: u32_at(buf, tail + 12),
            inode: u32_at(buf, tail + 16),
        })
    }

    /// Local address; for `AF_INET` only the first four bytes are meaningful
    pub fn local_addr(&self) -> IpAddr {
        if self.family == AF_INET {
            let [a, b, c, d, ..] = self.id.src;
            IpAddr::V4(Ipv4Addr::new(a, b, c, d))
        } else {
            IpAddr::V6(Ipv6Addr::from(self.id.src))
        }
    }
}

impl From<InetDiagMsg> for ListeningSocket {
    fn from(msg: InetDiagMsg) -> Self {
        ListeningSocket::new(msg.local_addr(), msg.id.sport, msg.inode)
    }
}

/// Complete netlink message asking for a dump of listening TCP sockets
pub fn dump_request(family: u8, seq: u32) -> Vec<u8> {
    let len = NLMSG_HDR_LEN + INET_DIAG_REQ_V2_LEN;
    let mut buf = Vec::with_capacity(len);
    NlMsgHdr {
        len: len as u32,
        kind: SOCK_DIAG_BY_FAMILY,
        flags: NLM_F_REQUEST | NLM_F_DUMP,
        seq,
        pid: 0,
    }
    .encode(&mut buf);
    InetDiagReqV2::listening(family).encode(&mut buf);
    buf
}

fn kernel_status(payload: &[u8]) -> SockDiagResult<i32> {
    if payload.len() < 4 {
        return Err(SockDiagError::Truncated {
            what: "netlink status",
            need: 4,
            got: payload.len(),
        });
    }
    Ok(u32_at(payload, 0) as i32)
}

/// Decode one datagram of a dump response into `out`.
///
/// Returns `true` once `NLMSG_DONE` has been seen.
pub fn parse_dump(buf: &[u8], seq: u32, out: &mut Vec<ListeningSocket>) -> SockDiagResult<bool> {
    let mut offset = 0;
    while offset < buf.len() {
        let rest = &buf[offset..];
        let hdr = NlMsgHdr::decode(rest)?;
        let len = hdr.len as usize;
        if len < NLMSG_HDR_LEN || len > rest.len() {
            return Err(SockDiagError::Truncated {
                what: "netlink message",
                need: len.max(NLMSG_HDR_LEN),
                got: rest.len(),
            });
        }
        if hdr.seq != seq {
            return Err(SockDiagError::Unexpected {
                kind: hdr.kind,
                seq: hdr.seq,
            });
        }

        let payload = &rest[NLMSG_HDR_LEN..len];
        match hdr.kind {
            NLMSG_NOOP => {}
            NLMSG_DONE => {
                // Newer kernels carry the dump's final status here
                if payload.len() >= 4 {
                    let status = kernel_status(payload)?;
                    if status < 0 {
                        return Err(SockDiagError::Kernel(io::Error::from_raw_os_error(-status)));
                    }
                }
                return Ok(true);
            }
            NLMSG_ERROR => {
                let status = kernel_status(payload)?;
                if status != 0 {
                    return Err(SockDiagError::Kernel(io::Error::from_raw_os_error(-status)));
                }
            }
            SOCK_DIAG_BY_FAMILY => {
                let msg = InetDiagMsg::decode(payload)?;
                log::trace!(
                    "inet_diag: family={} state={} port={} inode={} uid={}",
                    msg.family,
                    msg.state,
                    msg.id.sport,
                    msg.inode,
                    msg.uid
                );
                out.push(msg.into());
            }
            kind => return Err(SockDiagError::Unexpected { kind, seq: hdr.seq }),
        }

        offset += nlmsg_align(len);
    }
    Ok(false)
}
