//! Per-frame classification and rewriting.
//!
//! The whole bridge step is pure over the frame bytes: validate, swap
//! the outer Ethernet addresses for the TAP-to-TAP handoff, look the
//! destination up in the rule tables, and compose the rewritten outer
//! addresses through the rule's masks. The caller (the forwarding
//! worker) performs the actual TAP write and records the send outcome.
//!
//! No checksum is recomputed: the outer IPv6 header has none, and the
//! masks never touch bits participating in the inner payload's
//! checksums.

use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::addr::MacAddr;
use crate::rule::{Domain, RuleKind};
use crate::stats::Statistics;
use crate::table::TableSet;

/// EtherType for IPv6.
pub const ETH_P_IPV6: u16 = 0x86dd;

/// Receive buffer size; larger frames are truncated by the TAP read
/// and dropped.
pub const RECV_BUF_SIZE: usize = 65535;

/// Ethernet header as it sits at the front of a TAP frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct EtherHdr {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ethertype: U16,
}

/// Size of the Ethernet header.
pub const ETHER_HDR_LEN: usize = size_of::<EtherHdr>();

/// Fixed IPv6 header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct Ipv6Hdr {
    /// Version, traffic class and flow label.
    pub vtc_flow: U32,
    pub payload_len: U16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: [u8; 16],
    pub dst: [u8; 16],
}

/// Size of the fixed IPv6 header.
pub const IPV6_HDR_LEN: usize = size_of::<Ipv6Hdr>();

impl Ipv6Hdr {
    pub fn src_bits(&self) -> u128 {
        u128::from_be_bytes(self.src)
    }

    pub fn dst_bits(&self) -> u128 {
        u128::from_be_bytes(self.dst)
    }
}

/// Why a frame was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Frame too short for an Ethernet + IPv6 header, or truncated by
    /// the receive buffer.
    Malformed,
    /// Ethernet destination was the broadcast address.
    Broadcast,
    /// EtherType was not IPv6.
    OtherProto,
    /// Hop limit exhausted (1).
    HopLimit,
    /// Neither table covers the destination.
    NoMatch,
}

/// Result of the classification step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The frame was rewritten in place and should be written to the
    /// egress device.
    Forward(RuleKind),
    Drop(DropReason),
}

/// Classify one ingress frame and rewrite it in place.
///
/// Implements the bridge pipeline: broadcast drop, outer MAC rewrite
/// (destination takes the egress device's MAC, source the ingress
/// device's), EtherType and hop-limit validation, then an M46E lookup
/// followed by an ME6E lookup on the destination address. The lookup
/// deliberately ignores the IPv6 next header: encapsulated ICMP and
/// friends traverse the same rules as the tunnel payloads.
///
/// Drop-side counters are recorded here; the caller records the send
/// outcome (`record_ok` / `record_err`) after the egress write.
pub fn process_frame(
    frame: &mut [u8],
    domain: Domain,
    tables: &TableSet,
    ingress_mac: MacAddr,
    egress_mac: MacAddr,
    stats: &Statistics,
) -> Verdict {
    let dir = stats.dir(domain);
    dir.record_recv();

    if frame.len() < ETHER_HDR_LEN + IPV6_HDR_LEN {
        return Verdict::Drop(DropReason::Malformed);
    }

    let Ok((eth, payload)) = EtherHdr::mut_from_prefix(frame) else {
        return Verdict::Drop(DropReason::Malformed);
    };

    if MacAddr(eth.dst).is_broadcast() {
        dir.record_broadcast();
        return Verdict::Drop(DropReason::Broadcast);
    }

    // Intra-box bridge rewrite; the outer Ethernet only carries the
    // frame between the two TAPs.
    eth.dst = egress_mac.0;
    eth.src = ingress_mac.0;

    if eth.ethertype.get() != ETH_P_IPV6 {
        dir.record_other_proto();
        return Verdict::Drop(DropReason::OtherProto);
    }

    let Ok((ip6, _)) = Ipv6Hdr::mut_from_prefix(payload) else {
        return Verdict::Drop(DropReason::Malformed);
    };

    if ip6.hop_limit == 1 {
        dir.record_hoplimit();
        return Verdict::Drop(DropReason::HopLimit);
    }

    match tables.lookup(domain, ip6.dst_bits()) {
        Some((kind, tmpl)) => {
            ip6.dst = tmpl.rewrite_dst(ip6.dst_bits()).to_be_bytes();
            ip6.src = tmpl.rewrite_src(ip6.src_bits()).to_be_bytes();
            Verdict::Forward(kind)
        }
        None => {
            // Both tables missed; accounted against the ME6E table,
            // the last one consulted.
            dir.record_err(RuleKind::Me6e);
            Verdict::Drop(DropReason::NoMatch)
        }
    }
}
