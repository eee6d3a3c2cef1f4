//! Kernel route and address shim.
//!
//! The gateway touches rtnetlink for exactly four things: installing
//! and removing the per-rule IPv6 route toward a tunnel device, and
//! assigning or removing a tunnel device address at startup. Each call
//! is one blocking request/ACK exchange on a `NETLINK_ROUTE` socket.
//!
//! Every request has the same tiny shape (header, a 12- or 8-byte
//! family struct, two attributes), so the wire image is assembled
//! inline by [`encode_request`] and the reply is expected to be a
//! single `NLMSG_ERROR` record carrying the ACK or an errno. There is
//! no dump support and no multipart handling; the shim never asks for
//! either.

use std::io;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::BytesMut;
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use tracing::debug;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Result type for shim operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures the four shim operations can produce.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket creation, send or receive failed.
    #[error("netlink I/O: {0}")]
    Io(#[from] io::Error),

    /// The kernel refused the request. For this shim that is in
    /// practice EEXIST on a duplicate add, ENOENT/ESRCH on removing
    /// something already gone, or EPERM without CAP_NET_ADMIN.
    #[error("{operation}: {message} (errno {errno})")]
    Kernel {
        operation: String,
        errno: i32,
        message: String,
    },

    /// The reply was not the single ACK record the shim sent for.
    #[error("unexpected netlink reply: {0}")]
    BadReply(&'static str),
}

impl Error {
    /// The errno of a kernel refusal.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// The route or address was already present (EEXIST).
    pub fn is_already_exists(&self) -> bool {
        self.errno() == Some(libc::EEXIST)
    }

    /// The route or address was not there to remove (ENOENT, ESRCH).
    pub fn is_not_found(&self) -> bool {
        matches!(self.errno(), Some(e) if e == libc::ENOENT || e == libc::ESRCH)
    }
}

// rtnetlink message types and flags the shim sends; the only type it
// ever receives is NLMSG_ERROR.
const NLMSG_ERROR: u16 = 2;
const RTM_NEWROUTE: u16 = 24;
const RTM_DELROUTE: u16 = 25;
const RTM_NEWADDR: u16 = 20;
const RTM_DELADDR: u16 = 21;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_MULTI: u16 = 0x02;
const NLM_F_ACK: u16 = 0x04;
const NLM_F_EXCL: u16 = 0x200;
const NLM_F_CREATE: u16 = 0x400;

const AF_INET6: u8 = 10;

// Attribute types per family struct.
const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

// Fixed rtmsg field values: device routes in the main table.
const RT_TABLE_MAIN: u8 = 254;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTPROT_STATIC: u8 = 4;
const RTN_UNICAST: u8 = 1;

/// struct nlmsghdr.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct MsgHdr {
    len: u32,
    kind: u16,
    flags: u16,
    seq: u32,
    pid: u32,
}

const MSG_HDR_LEN: usize = size_of::<MsgHdr>();

/// struct rtmsg, fixed for this shim: an IPv6 unicast device route in
/// the main table, static protocol, universe scope.
///
/// ```text
/// family dst_len src_len tos | table protocol scope type | flags(u32)
/// ```
fn route_body(prefix_len: u8) -> [u8; 12] {
    let mut body = [0u8; 12];
    body[0] = AF_INET6;
    body[1] = prefix_len;
    body[4] = RT_TABLE_MAIN;
    body[5] = RTPROT_STATIC;
    body[6] = RT_SCOPE_UNIVERSE;
    body[7] = RTN_UNICAST;
    body
}

/// struct ifaddrmsg.
///
/// ```text
/// family prefixlen flags scope | index(u32)
/// ```
fn addr_body(prefix_len: u8, ifindex: u32) -> [u8; 8] {
    let mut body = [0u8; 8];
    body[0] = AF_INET6;
    body[1] = prefix_len;
    body[4..8].copy_from_slice(&ifindex.to_ne_bytes());
    body
}

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Assemble one request: header, family struct, then each attribute
/// with its 4-byte header, everything padded to 4-byte boundaries.
/// The total length is patched into the header last.
fn encode_request(
    kind: u16,
    flags: u16,
    seq: u32,
    pid: u32,
    body: &[u8],
    attrs: &[(u16, &[u8])],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(96);
    let hdr = MsgHdr {
        len: 0,
        kind,
        flags,
        seq,
        pid,
    };
    buf.extend_from_slice(hdr.as_bytes());
    buf.extend_from_slice(body);
    pad4(&mut buf);
    for &(attr_type, payload) in attrs {
        let attr_len = (4 + payload.len()) as u16;
        buf.extend_from_slice(&attr_len.to_ne_bytes());
        buf.extend_from_slice(&attr_type.to_ne_bytes());
        buf.extend_from_slice(payload);
        pad4(&mut buf);
    }
    let total = buf.len() as u32;
    buf[..4].copy_from_slice(&total.to_ne_bytes());
    buf
}

/// What came back instead of a clean ACK.
enum AckError {
    Malformed(&'static str),
    Errno(i32),
}

/// Check the reply to an NLM_F_ACK request: one NLMSG_ERROR record
/// addressed to us, whose payload starts with 0 (ACK) or a negative
/// errno. Anything after the error code (the echoed request,
/// extended-ACK attributes) is irrelevant here.
fn expect_ack(reply: &[u8], seq: u32, pid: u32) -> std::result::Result<(), AckError> {
    let Ok((hdr, rest)) = MsgHdr::read_from_prefix(reply) else {
        return Err(AckError::Malformed("short header"));
    };
    if (hdr.len as usize) < MSG_HDR_LEN + 4 || hdr.len as usize > reply.len() {
        return Err(AckError::Malformed("bad record length"));
    }
    if hdr.seq != seq {
        return Err(AckError::Malformed("wrong sequence number"));
    }
    if hdr.pid != pid {
        return Err(AckError::Malformed("reply for another port"));
    }
    if hdr.flags & NLM_F_MULTI != 0 {
        return Err(AckError::Malformed("unexpected multipart reply"));
    }
    if hdr.kind != NLMSG_ERROR {
        return Err(AckError::Malformed("not an error/ACK record"));
    }
    let Ok((code, _)) = i32::read_from_prefix(rest) else {
        return Err(AckError::Malformed("short error payload"));
    };
    if code == 0 {
        Ok(())
    } else {
        Err(AckError::Errno(-code))
    }
}

/// A handle for route and address mutations.
pub struct RouteHandle {
    socket: Socket,
    seq: AtomicU32,
    pid: u32,
}

impl RouteHandle {
    /// Open and bind a route socket.
    pub fn new() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        let mut addr = SocketAddr::new(0, 0);
        socket.bind(&addr)?;
        socket.get_address(&mut addr)?;
        Ok(RouteHandle {
            socket,
            seq: AtomicU32::new(1),
            pid: addr.port_number(),
        })
    }

    /// Install the IPv6 route `dst/prefix_len` out of `ifindex`: main
    /// table, static unicast, no gateway. NLM_F_EXCL keeps a duplicate
    /// add visible as EEXIST instead of silently replacing.
    pub fn add_route(&self, ifindex: u32, dst: Ipv6Addr, prefix_len: u8) -> Result<()> {
        debug!(%dst, prefix_len, ifindex, "add route");
        self.route_op(
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_CREATE | NLM_F_EXCL | NLM_F_ACK,
            ifindex,
            dst,
            prefix_len,
            "adding route",
        )
    }

    /// Remove the route again.
    pub fn del_route(&self, ifindex: u32, dst: Ipv6Addr, prefix_len: u8) -> Result<()> {
        debug!(%dst, prefix_len, ifindex, "del route");
        self.route_op(
            RTM_DELROUTE,
            NLM_F_REQUEST | NLM_F_ACK,
            ifindex,
            dst,
            prefix_len,
            "removing route",
        )
    }

    /// Assign an IPv6 address to an interface.
    pub fn add_address(&self, ifindex: u32, addr: Ipv6Addr, prefix_len: u8) -> Result<()> {
        debug!(%addr, prefix_len, ifindex, "add address");
        self.addr_op(
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_CREATE | NLM_F_EXCL | NLM_F_ACK,
            ifindex,
            addr,
            prefix_len,
            "adding address",
        )
    }

    /// Remove an address from an interface.
    pub fn del_address(&self, ifindex: u32, addr: Ipv6Addr, prefix_len: u8) -> Result<()> {
        debug!(%addr, prefix_len, ifindex, "del address");
        self.addr_op(
            RTM_DELADDR,
            NLM_F_REQUEST | NLM_F_ACK,
            ifindex,
            addr,
            prefix_len,
            "removing address",
        )
    }

    fn route_op(
        &self,
        kind: u16,
        flags: u16,
        ifindex: u32,
        dst: Ipv6Addr,
        prefix_len: u8,
        what: &str,
    ) -> Result<()> {
        let dst_octets = dst.octets();
        let oif = ifindex.to_ne_bytes();
        self.transaction(
            kind,
            flags,
            &route_body(prefix_len),
            &[(RTA_DST, dst_octets.as_slice()), (RTA_OIF, oif.as_slice())],
            || format!("{what} {dst}/{prefix_len}"),
        )
    }

    fn addr_op(
        &self,
        kind: u16,
        flags: u16,
        ifindex: u32,
        addr: Ipv6Addr,
        prefix_len: u8,
        what: &str,
    ) -> Result<()> {
        let octets = addr.octets();
        self.transaction(
            kind,
            flags,
            &addr_body(prefix_len, ifindex),
            &[(IFA_LOCAL, octets.as_slice()), (IFA_ADDRESS, octets.as_slice())],
            || format!("{what} {addr}/{prefix_len}"),
        )
    }

    /// One request/ACK exchange.
    fn transaction(
        &self,
        kind: u16,
        flags: u16,
        body: &[u8],
        attrs: &[(u16, &[u8])],
        describe: impl Fn() -> String,
    ) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let request = encode_request(kind, flags, seq, self.pid, body, attrs);
        self.socket.send(&request, 0)?;

        let mut reply = BytesMut::with_capacity(4096);
        self.socket.recv(&mut reply, 0)?;

        match expect_ack(&reply, seq, self.pid) {
            Ok(()) => Ok(()),
            Err(AckError::Malformed(what)) => Err(Error::BadReply(what)),
            Err(AckError::Errno(errno)) => Err(Error::Kernel {
                operation: describe(),
                errno,
                message: io::Error::from_raw_os_error(errno).to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad4() {
        let mut buf = vec![1u8; 5];
        pad4(&mut buf);
        assert_eq!(buf.len(), 8);
        pad4(&mut buf);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_encode_route_request_layout() {
        let dst: Ipv6Addr = "2001:db8::".parse().unwrap();
        let dst_octets = dst.octets();
        let oif = 9u32.to_ne_bytes();
        let msg = encode_request(
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_CREATE | NLM_F_EXCL | NLM_F_ACK,
            7,
            42,
            &route_body(120),
            &[(RTA_DST, dst_octets.as_slice()), (RTA_OIF, oif.as_slice())],
        );

        // header(16) + rtmsg(12) + dst attr(4+16) + oif attr(4+4)
        assert_eq!(msg.len(), 16 + 12 + 20 + 8);

        let (hdr, rest) = MsgHdr::read_from_prefix(&msg).unwrap();
        assert_eq!(hdr.len as usize, msg.len());
        assert_eq!(hdr.kind, RTM_NEWROUTE);
        assert_eq!(hdr.seq, 7);
        assert_eq!(hdr.pid, 42);

        // rtmsg fields sit right after the header
        assert_eq!(rest[0], AF_INET6);
        assert_eq!(rest[1], 120);
        assert_eq!(rest[4], RT_TABLE_MAIN);

        // first attribute: RTA_DST with the 16 address bytes
        let attr = &msg[28..];
        assert_eq!(u16::from_ne_bytes([attr[0], attr[1]]), 20);
        assert_eq!(u16::from_ne_bytes([attr[2], attr[3]]), RTA_DST);
        assert_eq!(&attr[4..20], &dst.octets());

        // second attribute: RTA_OIF with the ifindex
        let attr = &msg[48..];
        assert_eq!(u16::from_ne_bytes([attr[0], attr[1]]), 8);
        assert_eq!(u16::from_ne_bytes([attr[2], attr[3]]), RTA_OIF);
        assert_eq!(u32::from_ne_bytes(attr[4..8].try_into().unwrap()), 9);
    }

    #[test]
    fn test_encode_pads_odd_attributes() {
        let payload = [0xabu8];
        let msg = encode_request(
            RTM_NEWADDR,
            NLM_F_REQUEST,
            1,
            1,
            &[0u8; 8],
            &[(1, payload.as_slice())],
        );
        // 8-byte body stays aligned; the 1-byte attribute pads to 8
        assert_eq!(msg.len(), 16 + 8 + 8);
        let (hdr, _) = MsgHdr::read_from_prefix(&msg).unwrap();
        assert_eq!(hdr.len as usize, msg.len());
    }

    fn ack_reply(seq: u32, code: i32) -> Vec<u8> {
        let hdr = MsgHdr {
            len: (MSG_HDR_LEN + 4 + MSG_HDR_LEN) as u32,
            kind: NLMSG_ERROR,
            flags: 0,
            seq,
            pid: 0,
        };
        let mut buf = hdr.as_bytes().to_vec();
        buf.extend_from_slice(&code.to_ne_bytes());
        // echoed request header follows; the parser ignores it
        buf.extend_from_slice(&[0u8; MSG_HDR_LEN]);
        buf
    }

    #[test]
    fn test_expect_ack_success() {
        assert!(expect_ack(&ack_reply(5, 0), 5, 0).is_ok());
    }

    #[test]
    fn test_expect_ack_errno() {
        match expect_ack(&ack_reply(5, -libc::EEXIST), 5, 0) {
            Err(AckError::Errno(e)) => assert_eq!(e, libc::EEXIST),
            _ => panic!("expected errno"),
        }
    }

    #[test]
    fn test_expect_ack_rejects_misaddressed_and_garbage() {
        // wrong sequence number
        assert!(matches!(
            expect_ack(&ack_reply(5, 0), 6, 0),
            Err(AckError::Malformed(_))
        ));
        // wrong port
        assert!(matches!(
            expect_ack(&ack_reply(5, 0), 5, 99),
            Err(AckError::Malformed(_))
        ));
        // truncated
        assert!(matches!(
            expect_ack(&[0u8; 4], 1, 0),
            Err(AckError::Malformed(_))
        ));
        // a data record where the ACK should be
        let mut not_error = ack_reply(5, 0);
        not_error[4..6].copy_from_slice(&RTM_NEWROUTE.to_ne_bytes());
        assert!(matches!(
            expect_ack(&not_error, 5, 0),
            Err(AckError::Malformed(_))
        ));
    }

    #[test]
    fn test_error_classification() {
        let err = Error::Kernel {
            operation: "adding route 2001:db8::/120".into(),
            errno: libc::EEXIST,
            message: "File exists".into(),
        };
        assert!(err.is_already_exists());
        assert!(!err.is_not_found());
        assert_eq!(err.errno(), Some(libc::EEXIST));
        let text = err.to_string();
        assert!(text.contains("adding route"));
        assert!(text.contains("File exists"));

        let err = Error::Kernel {
            operation: "removing route 2001:db8::/120".into(),
            errno: libc::ESRCH,
            message: "No such process".into(),
        };
        assert!(err.is_not_found());

        assert_eq!(Error::Io(io::Error::other("boom")).errno(), None);
    }
}
