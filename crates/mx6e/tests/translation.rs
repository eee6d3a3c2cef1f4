//! End-to-end translation scenarios over the rule tables and the
//! frame pipeline, without TAP devices: rules go in through the same
//! entry points the control loop uses, packets through the same
//! pipeline the workers run.

use std::io;
use std::net::Ipv6Addr;
use std::sync::Mutex;
use std::sync::atomic::Ordering;

use mx6e::addr::MacAddr;
use mx6e::packet::{self, ETHER_HDR_LEN, Ipv6Hdr, Verdict};
use mx6e::rule::{DeriveCtx, Domain, InnerSpec, RuleKeySpec, RuleKind, RuleSpec};
use mx6e::stats::Statistics;
use mx6e::table::{RouteControl, TableSet};
use zerocopy::{FromBytes, IntoBytes};
use zerocopy::byteorder::network_endian::{U16, U32};

const ETH_P_IPV6: u16 = 0x86dd;
const IPPROTO_IPIP: u8 = 4;
const IPPROTO_ETHERIP: u8 = 97;

/// Kernel-route stand-in that tracks the currently installed set.
#[derive(Default)]
struct FakeKernel {
    routes: Mutex<Vec<(Domain, u128, u8)>>,
}

impl FakeKernel {
    fn route_count(&self) -> usize {
        self.routes.lock().unwrap().len()
    }
}

impl RouteControl for FakeKernel {
    fn add_route(&self, domain: Domain, dst: u128, prefix_len: u8) -> io::Result<()> {
        let mut routes = self.routes.lock().unwrap();
        if routes.contains(&(domain, dst, prefix_len)) {
            return Err(io::Error::from_raw_os_error(libc_eexist()));
        }
        routes.push((domain, dst, prefix_len));
        Ok(())
    }

    fn del_route(&self, domain: Domain, dst: u128, prefix_len: u8) -> io::Result<()> {
        let mut routes = self.routes.lock().unwrap();
        match routes.iter().position(|r| *r == (domain, dst, prefix_len)) {
            Some(pos) => {
                routes.remove(pos);
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc_enoent())),
        }
    }
}

fn libc_eexist() -> i32 {
    17
}

fn libc_enoent() -> i32 {
    2
}

fn ctx() -> DeriveCtx {
    DeriveCtx {
        tunnel_pr_addr: "2001:db8:2::".parse().unwrap(),
        tunnel_pr_prefix_len: 48,
    }
}

fn pr_mac() -> MacAddr {
    "02:00:00:00:00:01".parse().unwrap()
}

fn fp_mac() -> MacAddr {
    "02:00:00:00:00:02".parse().unwrap()
}

fn frame(src: &str, dst: &str, next: u8, hop: u8) -> Vec<u8> {
    let mut buf = vec![0u8; ETHER_HDR_LEN + size_of::<Ipv6Hdr>()];
    let dst_mac: MacAddr = "11:22:33:44:55:66".parse().unwrap();
    let src_mac: MacAddr = "de:ad:be:ef:00:01".parse().unwrap();
    buf[..6].copy_from_slice(&dst_mac.0);
    buf[6..12].copy_from_slice(&src_mac.0);
    buf[12..14].copy_from_slice(&ETH_P_IPV6.to_be_bytes());

    let ip6 = Ipv6Hdr {
        vtc_flow: U32::new(6 << 28),
        payload_len: U16::new(0),
        next_header: next,
        hop_limit: hop,
        src: src.parse::<Ipv6Addr>().unwrap().octets(),
        dst: dst.parse::<Ipv6Addr>().unwrap().octets(),
    };
    buf[ETHER_HDR_LEN..].copy_from_slice(ip6.as_bytes());
    buf
}

fn addrs(frame: &[u8]) -> (String, String) {
    let (ip6, _) = Ipv6Hdr::ref_from_prefix(&frame[ETHER_HDR_LEN..]).unwrap();
    (
        Ipv6Addr::from(ip6.src).to_string(),
        Ipv6Addr::from(ip6.dst).to_string(),
    )
}

fn m46e_rule(domain: Domain, plane_in: &str, v4: &str, out_prefix: &str, plane_out: &str) -> RuleSpec {
    RuleSpec {
        key: RuleKeySpec {
            domain,
            section: match domain {
                Domain::Fp => Some(("3000::".parse().unwrap(), 48)),
                Domain::Pr => None,
            },
            in_plane_id: plane_in.to_string(),
            in_prefix_len: 64,
            inner: InnerSpec::V4 {
                addr: v4.parse().unwrap(),
                cidr: 24,
            },
        },
        out_prefix: out_prefix.parse().unwrap(),
        out_prefix_len: 48,
        out_plane_id: plane_out.to_string(),
        enable: true,
    }
}

fn me6e_rule(domain: Domain, plane_in: &str, prefix_len: u8, mac: &str, out_prefix: &str, plane_out: &str) -> RuleSpec {
    RuleSpec {
        key: RuleKeySpec {
            domain,
            section: match domain {
                Domain::Fp => Some(("3000::".parse().unwrap(), 48)),
                Domain::Pr => None,
            },
            in_plane_id: plane_in.to_string(),
            in_prefix_len: prefix_len,
            inner: InnerSpec::Mac(mac.parse().unwrap()),
        },
        out_prefix: out_prefix.parse().unwrap(),
        out_prefix_len: 48,
        out_plane_id: plane_out.to_string(),
        enable: true,
    }
}

#[test]
fn m46e_pr_to_fp_forward() {
    let tables = TableSet::new();
    let kernel = FakeKernel::default();
    let stats = Statistics::new();

    tables
        .m46e
        .insert(
            &m46e_rule(Domain::Pr, "1:2", "192.168.102.0", "f00d:1:1::", "8fff:ffff:ffff"),
            &ctx(),
            &kernel,
        )
        .unwrap();
    assert_eq!(kernel.route_count(), 1);

    let mut buf = frame("2000::1:2:c0a8:6601", "2000::1:2:c0a8:6602", IPPROTO_IPIP, 2);
    let verdict = packet::process_frame(&mut buf, Domain::Pr, &tables, pr_mac(), fp_mac(), &stats);
    assert_eq!(verdict, Verdict::Forward(RuleKind::M46e));

    let (src, dst) = addrs(&buf);
    assert_eq!(src, "f00d:1:1:8fff:ffff:ffff:c0a8:6601");
    assert_eq!(dst, "f00d:1:1:8fff:ffff:ffff:c0a8:6602");
    assert_eq!(buf[..6], fp_mac().0);
    assert_eq!(buf[6..12], pr_mac().0);

    // the worker records the send outcome after the egress write
    stats.dir(Domain::Pr).record_ok(RuleKind::M46e);
    assert_eq!(stats.pr.m46e_ok.load(Ordering::Relaxed), 1);
    assert_eq!(stats.pr.recv.load(Ordering::Relaxed), 1);
}

#[test]
fn me6e_fp_to_pr_forward() {
    let tables = TableSet::new();
    let kernel = FakeKernel::default();
    let stats = Statistics::new();

    tables
        .me6e
        .insert(
            &me6e_rule(Domain::Fp, "1", 16, "ab:cd:ef:01:23:45", "f00d:1:a::", "1:1"),
            &ctx(),
            &kernel,
        )
        .unwrap();

    let mut buf = frame(
        "2000::1:abcd:ef01:6789",
        "2000::1:abcd:ef01:2345",
        IPPROTO_ETHERIP,
        2,
    );
    let verdict = packet::process_frame(&mut buf, Domain::Fp, &tables, fp_mac(), pr_mac(), &stats);
    assert_eq!(verdict, Verdict::Forward(RuleKind::Me6e));

    let (src, dst) = addrs(&buf);
    assert_eq!(dst, "f00d:1:a:1:1:abcd:ef01:2345");
    // FP->PR traffic leaves with the PR tunnel prefix as source
    assert_eq!(src, "2001:db8:2:1:1:abcd:ef01:6789");
}

#[test]
fn multiple_plane_widths_disambiguate() {
    // same MAC embedded under plane IDs of different widths; each
    // destination picks its own rule
    let tables = TableSet::new();
    let kernel = FakeKernel::default();
    let stats = Statistics::new();

    for (plane, out_prefix, out_plane) in [
        ("1", "f00d:1:a::", "1:1"),
        ("1:1", "f00d:1:b::", "1:2"),
        ("1:1:1", "f00d:1:c::", "1:3"),
    ] {
        tables
            .me6e
            .insert(
                &me6e_rule(Domain::Fp, plane, 16, "ab:cd:ef:01:23:45", out_prefix, out_plane),
                &ctx(),
                &kernel,
            )
            .unwrap();
    }

    let cases = [
        ("2000::1:abcd:ef01:2345", "f00d:1:a:"),
        ("2000::1:1:abcd:ef01:2345", "f00d:1:b:"),
        ("2000:0:1:1:1:abcd:ef01:2345", "f00d:1:c:"),
    ];
    for (dst, expected_prefix) in cases {
        let mut buf = frame("2000::1:abcd:ef01:6789", dst, IPPROTO_ETHERIP, 2);
        let verdict =
            packet::process_frame(&mut buf, Domain::Fp, &tables, fp_mac(), pr_mac(), &stats);
        assert_eq!(verdict, Verdict::Forward(RuleKind::Me6e), "dst {dst}");
        let (_, out_dst) = addrs(&buf);
        assert!(
            out_dst.starts_with(expected_prefix),
            "dst {dst} rewrote to {out_dst}, expected prefix {expected_prefix}"
        );
    }
}

#[test]
fn hoplimit_and_no_match_drops() {
    let tables = TableSet::new();
    let kernel = FakeKernel::default();
    let stats = Statistics::new();
    tables
        .m46e
        .insert(
            &m46e_rule(Domain::Pr, "1:2", "192.168.102.0", "f00d:1:1::", "8fff:ffff:ffff"),
            &ctx(),
            &kernel,
        )
        .unwrap();

    // hop limit 1: dropped before lookup
    let mut buf = frame("2000::1:2:c0a8:6601", "2000::1:2:c0a8:6602", IPPROTO_IPIP, 1);
    assert!(matches!(
        packet::process_frame(&mut buf, Domain::Pr, &tables, pr_mac(), fp_mac(), &stats),
        Verdict::Drop(_)
    ));
    assert_eq!(stats.pr.err_hoplimit.load(Ordering::Relaxed), 1);

    // uncovered destination: dropped, miss accounted
    let mut buf = frame("2000::9:9:c0a8:6601", "2000::9:9:c0a8:6602", IPPROTO_IPIP, 2);
    assert!(matches!(
        packet::process_frame(&mut buf, Domain::Pr, &tables, pr_mac(), fp_mac(), &stats),
        Verdict::Drop(_)
    ));
    assert_eq!(stats.pr.me6e_err.load(Ordering::Relaxed), 1);
}

#[test]
fn disable_enable_cycle_with_routes() {
    let tables = TableSet::new();
    let kernel = FakeKernel::default();
    let stats = Statistics::new();

    let spec = m46e_rule(Domain::Pr, "1:2", "192.168.102.0", "f00d:1:1::", "8fff:ffff:ffff");
    tables.m46e.insert(&spec, &ctx(), &kernel).unwrap();
    assert_eq!(kernel.route_count(), 1);

    tables
        .m46e
        .set_enabled(&spec.key, &ctx(), false, &kernel)
        .unwrap();
    assert_eq!(kernel.route_count(), 0);

    let mut buf = frame("2000::1:2:c0a8:6601", "2000::1:2:c0a8:6602", IPPROTO_IPIP, 2);
    assert!(matches!(
        packet::process_frame(&mut buf, Domain::Pr, &tables, pr_mac(), fp_mac(), &stats),
        Verdict::Drop(_)
    ));

    tables
        .m46e
        .set_enabled(&spec.key, &ctx(), true, &kernel)
        .unwrap();
    assert_eq!(kernel.route_count(), 1);

    let mut buf = frame("2000::1:2:c0a8:6601", "2000::1:2:c0a8:6602", IPPROTO_IPIP, 2);
    assert_eq!(
        packet::process_frame(&mut buf, Domain::Pr, &tables, pr_mac(), fp_mac(), &stats),
        Verdict::Forward(RuleKind::M46e)
    );
}

#[test]
fn delete_removes_route_and_match() {
    let tables = TableSet::new();
    let kernel = FakeKernel::default();
    let stats = Statistics::new();

    let spec = m46e_rule(Domain::Pr, "1:2", "192.168.102.0", "f00d:1:1::", "8fff:ffff:ffff");
    tables.m46e.insert(&spec, &ctx(), &kernel).unwrap();
    tables.m46e.delete(&spec.key, &ctx(), &kernel).unwrap();

    assert_eq!(kernel.route_count(), 0);
    assert_eq!(tables.m46e.len(), 0);

    let mut buf = frame("2000::1:2:c0a8:6601", "2000::1:2:c0a8:6602", IPPROTO_IPIP, 2);
    assert!(matches!(
        packet::process_frame(&mut buf, Domain::Pr, &tables, pr_mac(), fp_mac(), &stats),
        Verdict::Drop(_)
    ));
}

#[test]
fn both_directions_independent() {
    // the same key fields in both domains translate independently
    let tables = TableSet::new();
    let kernel = FakeKernel::default();
    let stats = Statistics::new();

    tables
        .m46e
        .insert(
            &m46e_rule(Domain::Pr, "1:2", "192.168.102.0", "f00d:1:1::", "8fff:ffff:ffff"),
            &ctx(),
            &kernel,
        )
        .unwrap();
    tables
        .m46e
        .insert(
            &m46e_rule(Domain::Fp, "1:2", "192.168.102.0", "2000::", "1:2"),
            &ctx(),
            &kernel,
        )
        .unwrap();
    assert_eq!(kernel.route_count(), 2);

    // PR ingress
    let mut buf = frame("2000::1:2:c0a8:6601", "2000::1:2:c0a8:6602", IPPROTO_IPIP, 2);
    assert_eq!(
        packet::process_frame(&mut buf, Domain::Pr, &tables, pr_mac(), fp_mac(), &stats),
        Verdict::Forward(RuleKind::M46e)
    );
    let (_, dst) = addrs(&buf);
    assert!(dst.starts_with("f00d:1:1:"));

    // FP ingress with the same destination hits the FP partition and
    // emerges with the PR tunnel prefix as source
    let mut buf = frame("2000::1:2:c0a8:6601", "2000::1:2:c0a8:6602", IPPROTO_IPIP, 2);
    assert_eq!(
        packet::process_frame(&mut buf, Domain::Fp, &tables, fp_mac(), pr_mac(), &stats),
        Verdict::Forward(RuleKind::M46e)
    );
    let (src, _) = addrs(&buf);
    assert!(src.starts_with("2001:db8:2:"), "src {src}");
}
