//! Translation rules and their derivation.
//!
//! A rule is created from operator-facing fields (domain, plane IDs,
//! prefix lengths, an inner IPv4 network or MAC address, the egress
//! prefix) and carries precomputed match and rewrite material:
//!
//! - the `(match_addr, match_mask)` key a packet destination is tested
//!   against,
//! - the `(src, dst)` rewrite templates applied on egress,
//! - the kernel route installed toward the ingress tunnel device while
//!   the rule is enabled.
//!
//! Derivation happens once, at insert time; derived fields are
//! immutable afterwards. The address layout is
//!
//! ```text
//! |<------------------- 128 ------------------->|
//! |<- prefix_len ->|<- plane ID ->|<- 32 / 48 ->|
//! |     prefix     |   plane_id   | IPv4 / MAC  |
//! ```
//!
//! with 32 inner bits for M46E (the embedded IPv4 address) and 48 for
//! ME6E (the embedded MAC).

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::addr::{
    AddrError, MacAddr, apply_prefix, is_network_addr, mask_from_prefix, parse_plane_id,
    pid_width, v4_mask_from_cidr,
};

/// Ingress direction a rule matches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Domain {
    /// Fabric-facing side.
    Fp,
    /// Provider-facing side.
    Pr,
}

impl Domain {
    /// The opposite direction.
    pub fn opposite(self) -> Self {
        match self {
            Domain::Fp => Domain::Pr,
            Domain::Pr => Domain::Fp,
        }
    }

    /// Short display name, as used in table dumps and the CLI.
    pub fn name(self) -> &'static str {
        match self {
            Domain::Fp => "fp",
            Domain::Pr => "pr",
        }
    }
}

/// Translation kind: which inner payload is embedded in the low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    /// IPv4 over IPv6: low 32 bits carry the inner IPv4 address.
    M46e,
    /// Ethernet over IPv6: low 48 bits carry the inner MAC address.
    Me6e,
}

impl RuleKind {
    /// Width in bits of the embedded inner payload.
    pub fn inner_width(self) -> u8 {
        match self {
            RuleKind::M46e => 32,
            RuleKind::Me6e => 48,
        }
    }

    /// Table display name.
    pub fn name(self) -> &'static str {
        match self {
            RuleKind::M46e => "m46e",
            RuleKind::Me6e => "me6e",
        }
    }
}

/// The operator-supplied inner payload of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InnerSpec {
    /// An IPv4 network address with its CIDR prefix length.
    V4 { addr: Ipv4Addr, cidr: u8 },
    /// A tunnel-endpoint MAC address.
    Mac(MacAddr),
}

impl InnerSpec {
    /// The translation kind this inner payload implies.
    pub fn kind(&self) -> RuleKind {
        match self {
            InnerSpec::V4 { .. } => RuleKind::M46e,
            InnerSpec::Mac(_) => RuleKind::Me6e,
        }
    }
}

/// Fields identifying a rule: everything `del`, `enable` and `disable`
/// need to find the entry again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleKeySpec {
    pub domain: Domain,
    /// Section device prefix; required for FP-domain rules, ignored
    /// for PR-domain rules (those resolve it from the PR tunnel device).
    pub section: Option<(Ipv6Addr, u8)>,
    pub in_plane_id: String,
    pub in_prefix_len: u8,
    pub inner: InnerSpec,
}

/// A full rule as received from the CLI or a configuration load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub key: RuleKeySpec,
    pub out_prefix: Ipv6Addr,
    pub out_prefix_len: u8,
    pub out_plane_id: String,
    pub enable: bool,
}

/// Device-derived inputs to rule derivation.
#[derive(Debug, Clone, Copy)]
pub struct DeriveCtx {
    /// Prefix of the PR-side tunnel device. Supplies the section prefix
    /// for PR rules and the egress source prefix for FP rules.
    pub tunnel_pr_addr: Ipv6Addr,
    pub tunnel_pr_prefix_len: u8,
}

/// Rewrite templates applied to a matched packet, copied out of the
/// table under its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteTemplates {
    pub src_addr: u128,
    pub src_mask: u128,
    pub dst_addr: u128,
    pub dst_mask: u128,
}

impl RewriteTemplates {
    /// `(template & mask) | (original & !mask)` for the destination.
    #[inline]
    pub fn rewrite_dst(&self, dst: u128) -> u128 {
        (self.dst_addr & self.dst_mask) | (dst & !self.dst_mask)
    }

    /// Same composition for the source address.
    #[inline]
    pub fn rewrite_src(&self, src: u128) -> u128 {
        (self.src_addr & self.src_mask) | (src & !self.src_mask)
    }
}

/// Rule validation and derivation errors.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error("{addr}/{cidr} is not a network address")]
    NotNetworkAddr { addr: Ipv4Addr, cidr: u8 },

    #[error("prefix length {0} out of range")]
    PrefixLength(u8),

    #[error(
        "{side} side does not fit: prefix {prefix_len} + plane ID {pid_width} + inner {inner_width} > 128"
    )]
    BitBudget {
        side: &'static str,
        prefix_len: u8,
        pid_width: u8,
        inner_width: u8,
    },

    #[error("FP-domain rule requires a section device prefix")]
    MissingSection,

    #[error("rule kind does not match the table")]
    KindMismatch,
}

pub type Result<T> = std::result::Result<T, RuleError>;

/// A translation rule with all derived material.
///
/// Only `enable` ever changes after creation; everything else is
/// write-once.
#[derive(Debug, Clone)]
pub struct TranslationRule {
    pub enable: bool,
    pub domain: Domain,
    pub kind: RuleKind,

    /// Resolved section device prefix (user-supplied for FP, the PR
    /// tunnel device prefix for PR).
    pub section_addr: Ipv6Addr,
    pub section_prefix_len: u8,

    pub in_plane_id: String,
    pub in_prefix_len: u8,
    pub inner: InnerSpec,
    /// Subnet mask of the inner IPv4 network; all-ones equivalent for ME6E.
    pub inner_mask: u32,

    /// Canonical matching address: `match_addr & match_mask == match_addr`.
    pub match_addr: u128,
    /// Bits of the packet destination fixed by this rule.
    pub match_mask: u128,

    /// Route installed toward the ingress tunnel device while enabled.
    pub tunnel_route_addr: u128,
    pub tunnel_route_prefix_len: u8,

    /// Synthesized egress source for the rule's ingress device.
    pub tunnel_src: u128,
    pub tunnel_src_prefix_len: u8,

    pub out_plane_id: String,
    pub out_prefix: Ipv6Addr,
    pub out_prefix_len: u8,

    pub src_addr: u128,
    pub src_mask: u128,
    pub dst_addr: u128,
    pub dst_mask: u128,
}

/// Validated match material shared between full derivation and key-only
/// lookups (delete / enable / disable take only the key fields).
pub(crate) struct MatchMaterial {
    /// Plane ID and inner payload in place, before the prefix region is
    /// cleared. Input to the tunnel-route computation.
    pub body: u128,
    pub match_addr: u128,
    pub match_mask: u128,
    pub section_addr: Ipv6Addr,
    pub section_prefix_len: u8,
    pub inner_mask: u32,
}

pub(crate) fn derive_match(key: &RuleKeySpec, ctx: &DeriveCtx) -> Result<MatchMaterial> {
    if key.in_prefix_len > 128 {
        return Err(RuleError::PrefixLength(key.in_prefix_len));
    }

    let kind = key.inner.kind();
    let w = kind.inner_width();
    let pid = parse_plane_id(&key.in_plane_id)?;

    let total = key.in_prefix_len as u32 + pid_width(pid) as u32 + w as u32;
    if total > 128 {
        return Err(RuleError::BitBudget {
            side: "ingress",
            prefix_len: key.in_prefix_len,
            pid_width: pid_width(pid),
            inner_width: w,
        });
    }

    let (inner_bits, inner_mask) = match key.inner {
        InnerSpec::V4 { addr, cidr } => {
            if cidr > 32 {
                return Err(RuleError::PrefixLength(cidr));
            }
            if !is_network_addr(addr, cidr) {
                return Err(RuleError::NotNetworkAddr { addr, cidr });
            }
            (u32::from(addr) as u128, v4_mask_from_cidr(cidr))
        }
        InnerSpec::Mac(mac) => (mac.to_u128(), !0u32),
    };

    let (section_addr, section_prefix_len) = match key.domain {
        Domain::Fp => key.section.ok_or(RuleError::MissingSection)?,
        Domain::Pr => (ctx.tunnel_pr_addr, ctx.tunnel_pr_prefix_len),
    };

    let inner_full = inner_field_mask(kind);
    let body = (pid << w) | inner_bits;

    // Ones over the plane-ID region and the masked part of the inner
    // payload; zeros over the prefix region, which is supplied by the
    // query at lookup time.
    let low_mask = match kind {
        RuleKind::M46e => inner_mask as u128,
        RuleKind::Me6e => inner_full,
    };
    let match_mask = (!mask_from_prefix(key.in_prefix_len) & !inner_full) | low_mask;
    let match_addr = body & match_mask;

    Ok(MatchMaterial {
        body,
        match_addr,
        match_mask,
        section_addr,
        section_prefix_len,
        inner_mask,
    })
}

/// All-ones over the inner payload field of the given kind.
#[inline]
fn inner_field_mask(kind: RuleKind) -> u128 {
    (1u128 << kind.inner_width()) - 1
}

impl TranslationRule {
    /// Derive a rule from its operator-facing specification.
    ///
    /// Deterministic and total over valid inputs; equal inputs produce
    /// equal rules.
    pub fn derive(spec: &RuleSpec, ctx: &DeriveCtx) -> Result<TranslationRule> {
        let key = &spec.key;
        let kind = key.inner.kind();
        let w = kind.inner_width();

        let m = derive_match(key, ctx)?;

        if spec.out_prefix_len > 128 {
            return Err(RuleError::PrefixLength(spec.out_prefix_len));
        }
        let pid_out = parse_plane_id(&spec.out_plane_id)?;
        let total = spec.out_prefix_len as u32 + pid_width(pid_out) as u32 + w as u32;
        if total > 128 {
            return Err(RuleError::BitBudget {
                side: "egress",
                prefix_len: spec.out_prefix_len,
                pid_width: pid_width(pid_out),
                inner_width: w,
            });
        }

        // Route toward the ingress tunnel device: the match pattern
        // with the prefix region taken from the section device.
        let section_bits = u128::from(m.section_addr);
        let tunnel_route_addr = apply_prefix(m.body, section_bits, key.in_prefix_len);
        let tunnel_route_prefix_len = match key.inner {
            InnerSpec::V4 { cidr, .. } => 128 - (32 - cidr),
            InnerSpec::Mac(_) => 128,
        };

        // Rewrite templates. The destination keeps the packet's inner
        // host bits (M46E) or replaces the full MAC field (ME6E); the
        // source template clears the inner field entirely so the
        // packet's own low bits carry through.
        let inner_full = inner_field_mask(kind);
        let out_bits = u128::from(spec.out_prefix);

        let (inner_bits, dst_low_mask) = match key.inner {
            InnerSpec::V4 { addr, cidr } => {
                (u32::from(addr) as u128, v4_mask_from_cidr(cidr) as u128)
            }
            InnerSpec::Mac(mac) => (mac.to_u128(), inner_full),
        };

        let dst_mask = !inner_full | dst_low_mask;
        let dst_addr = apply_prefix((pid_out << w) | inner_bits, out_bits, spec.out_prefix_len);

        let src_mask = !inner_full;
        let mut src_addr = apply_prefix(pid_out << w, out_bits, spec.out_prefix_len);
        if key.domain == Domain::Fp {
            // FP->PR traffic leaves with the PR-side prefix as source.
            src_addr = apply_prefix(
                src_addr,
                u128::from(ctx.tunnel_pr_addr),
                ctx.tunnel_pr_prefix_len,
            );
        }

        let (tunnel_src, tunnel_src_prefix_len) = match key.inner {
            InnerSpec::V4 { addr, cidr } => (
                (src_addr & !inner_full) | u32::from(addr) as u128,
                128 - cidr,
            ),
            InnerSpec::Mac(mac) => ((src_addr & !inner_full) | mac.to_u128(), 128),
        };

        Ok(TranslationRule {
            enable: spec.enable,
            domain: key.domain,
            kind,
            section_addr: m.section_addr,
            section_prefix_len: m.section_prefix_len,
            in_plane_id: key.in_plane_id.clone(),
            in_prefix_len: key.in_prefix_len,
            inner: key.inner,
            inner_mask: m.inner_mask,
            match_addr: m.match_addr,
            match_mask: m.match_mask,
            tunnel_route_addr,
            tunnel_route_prefix_len,
            tunnel_src,
            tunnel_src_prefix_len,
            out_plane_id: spec.out_plane_id.clone(),
            out_prefix: spec.out_prefix,
            out_prefix_len: spec.out_prefix_len,
            src_addr,
            src_mask,
            dst_addr,
            dst_mask,
        })
    }

    /// The rewrite templates of this rule.
    pub fn templates(&self) -> RewriteTemplates {
        RewriteTemplates {
            src_addr: self.src_addr,
            src_mask: self.src_mask,
            dst_addr: self.dst_addr,
            dst_mask: self.dst_mask,
        }
    }

    /// Inner payload in display form (`a.b.c.d/len` or a MAC).
    pub fn inner_display(&self) -> String {
        match self.inner {
            InnerSpec::V4 { addr, cidr } => format!("{addr}/{cidr}"),
            InnerSpec::Mac(mac) => mac.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::format_v6;

    fn ctx() -> DeriveCtx {
        DeriveCtx {
            tunnel_pr_addr: "2001:db8:2::".parse().unwrap(),
            tunnel_pr_prefix_len: 48,
        }
    }

    fn m46e_spec(
        domain: Domain,
        plane_in: &str,
        prefix_len: u8,
        v4: &str,
        cidr: u8,
        out_prefix: &str,
        out_len: u8,
        plane_out: &str,
    ) -> RuleSpec {
        RuleSpec {
            key: RuleKeySpec {
                domain,
                section: match domain {
                    Domain::Fp => Some(("3000::".parse().unwrap(), 48)),
                    Domain::Pr => None,
                },
                in_plane_id: plane_in.to_string(),
                in_prefix_len: prefix_len,
                inner: InnerSpec::V4 {
                    addr: v4.parse().unwrap(),
                    cidr,
                },
            },
            out_prefix: out_prefix.parse().unwrap(),
            out_prefix_len: out_len,
            out_plane_id: plane_out.to_string(),
            enable: true,
        }
    }

    fn me6e_spec(
        domain: Domain,
        plane_in: &str,
        prefix_len: u8,
        mac: &str,
        out_prefix: &str,
        out_len: u8,
        plane_out: &str,
    ) -> RuleSpec {
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
            out_prefix_len: out_len,
            out_plane_id: plane_out.to_string(),
            enable: true,
        }
    }

    #[test]
    fn test_m46e_match_material() {
        let spec = m46e_spec(
            Domain::Pr,
            "1:2",
            64,
            "192.168.102.0",
            24,
            "f00d:1:1::",
            48,
            "8fff:ffff:ffff",
        );
        let rule = TranslationRule::derive(&spec, &ctx()).unwrap();

        assert_eq!(format_v6(rule.match_addr), "::1:2:c0a8:6600");
        assert_eq!(format_v6(rule.match_mask), "::ffff:ffff:ffff:ff00");
        // stored key is canonical
        assert_eq!(rule.match_addr & rule.match_mask, rule.match_addr);
        // PR rules resolve the section prefix from the PR tunnel device
        assert_eq!(rule.section_addr, ctx().tunnel_pr_addr);
        assert_eq!(rule.section_prefix_len, 48);
    }

    #[test]
    fn test_m46e_rewrite_templates() {
        let spec = m46e_spec(
            Domain::Pr,
            "1:2",
            64,
            "192.168.102.0",
            24,
            "f00d:1:1::",
            48,
            "8fff:ffff:ffff",
        );
        let rule = TranslationRule::derive(&spec, &ctx()).unwrap();
        let t = rule.templates();

        assert_eq!(
            format_v6(t.dst_addr),
            "f00d:1:1:8fff:ffff:ffff:c0a8:6600"
        );
        assert_eq!(format_v6(t.dst_mask), "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ff00");
        assert_eq!(format_v6(t.src_addr), "f00d:1:1:8fff:ffff:ffff::");
        assert_eq!(format_v6(t.src_mask), "ffff:ffff:ffff:ffff:ffff:ffff::");

        // host bits of the inner IPv4 carry through from the packet
        let dst = u128::from("2000::1:2:c0a8:6602".parse::<std::net::Ipv6Addr>().unwrap());
        let src = u128::from("2000::1:2:c0a8:6601".parse::<std::net::Ipv6Addr>().unwrap());
        assert_eq!(
            format_v6(t.rewrite_dst(dst)),
            "f00d:1:1:8fff:ffff:ffff:c0a8:6602"
        );
        assert_eq!(
            format_v6(t.rewrite_src(src)),
            "f00d:1:1:8fff:ffff:ffff:c0a8:6601"
        );
        // rewritten destination satisfies the template law
        assert_eq!(t.rewrite_dst(dst) & t.dst_mask, t.dst_addr & t.dst_mask);
    }

    #[test]
    fn test_me6e_match_and_rewrite() {
        let spec = me6e_spec(
            Domain::Fp,
            "1",
            16,
            "ab:cd:ef:01:23:45",
            "f00d:1:a::",
            48,
            "1:1",
        );
        let rule = TranslationRule::derive(&spec, &ctx()).unwrap();

        assert_eq!(format_v6(rule.match_addr), "::1:abcd:ef01:2345");
        assert_eq!(format_v6(rule.match_mask), "0:ffff:ffff:ffff:ffff:ffff:ffff:ffff");

        let t = rule.templates();
        // the MAC field is always rewritten in full
        assert_eq!(t.dst_mask, !0u128);
        assert_eq!(
            format_v6(t.dst_addr),
            "f00d:1:a:1:1:abcd:ef01:2345"
        );
        // FP rules source from the PR tunnel prefix
        assert_eq!(
            format_v6(t.src_addr),
            "2001:db8:2:1:1::"
        );

        let dst = u128::from("2000::1:abcd:ef01:2345".parse::<std::net::Ipv6Addr>().unwrap());
        assert_eq!(format_v6(t.rewrite_dst(dst)), "f00d:1:a:1:1:abcd:ef01:2345");
        let src = u128::from("2000::1:abcd:ef01:6789".parse::<std::net::Ipv6Addr>().unwrap());
        assert_eq!(format_v6(t.rewrite_src(src)), "2001:db8:2:1:1:abcd:ef01:6789");
    }

    #[test]
    fn test_tunnel_route() {
        let spec = m46e_spec(
            Domain::Pr,
            "1:2",
            64,
            "192.168.102.0",
            24,
            "f00d:1:1::",
            48,
            "8fff:ffff:ffff",
        );
        let rule = TranslationRule::derive(&spec, &ctx()).unwrap();
        // section prefix over the top 64 bits, plane ID + IPv4 below
        assert_eq!(format_v6(rule.tunnel_route_addr), "2001:db8:2:0:1:2:c0a8:6600");
        assert_eq!(rule.tunnel_route_prefix_len, 120);

        let spec = me6e_spec(
            Domain::Fp,
            "1",
            16,
            "ab:cd:ef:01:23:45",
            "f00d:1:a::",
            48,
            "1:1",
        );
        let rule = TranslationRule::derive(&spec, &ctx()).unwrap();
        assert_eq!(format_v6(rule.tunnel_route_addr), "3000::1:abcd:ef01:2345");
        assert_eq!(rule.tunnel_route_prefix_len, 128);
    }

    #[test]
    fn test_tunnel_src() {
        let spec = m46e_spec(
            Domain::Pr,
            "1:2",
            64,
            "192.168.102.0",
            24,
            "f00d:1:1::",
            48,
            "8fff:ffff:ffff",
        );
        let rule = TranslationRule::derive(&spec, &ctx()).unwrap();
        assert_eq!(
            format_v6(rule.tunnel_src),
            "f00d:1:1:8fff:ffff:ffff:c0a8:6600"
        );
        assert_eq!(rule.tunnel_src_prefix_len, 104);
    }

    #[test]
    fn test_bit_budget_ingress() {
        // ME6E: 80 + 1 + 48 = 129 rejected, 79 + 1 + 48 = 128 accepted
        assert!(TranslationRule::derive(
            &me6e_spec(Domain::Pr, "1", 80, "ab:cd:ef:01:23:45", "f00d:1:1::", 48, "e:b"),
            &ctx()
        )
        .is_err());
        assert!(TranslationRule::derive(
            &me6e_spec(Domain::Pr, "1", 79, "ab:cd:ef:01:23:45", "f00d:1:1::", 48, "e:a"),
            &ctx()
        )
        .is_ok());

        // M46E: 96 + 1 + 32 = 129 rejected, 95 accepted
        assert!(TranslationRule::derive(
            &m46e_spec(Domain::Pr, "1", 96, "192.168.100.0", 24, "f00d:1:1::", 48, "4:6"),
            &ctx()
        )
        .is_err());
        assert!(TranslationRule::derive(
            &m46e_spec(Domain::Pr, "1", 95, "192.168.100.0", 24, "f00d:1:1::", 48, "4:5"),
            &ctx()
        )
        .is_ok());

        // widest plane IDs at prefix length 1
        assert!(TranslationRule::derive(
            &me6e_spec(
                Domain::Fp,
                "7fff:ffff:ffff:ffff:ffff",
                1,
                "ab:cd:ef:01:23:45",
                "f00d:1:1::",
                48,
                "e:6"
            ),
            &ctx()
        )
        .is_ok());
        assert!(TranslationRule::derive(
            &me6e_spec(
                Domain::Fp,
                "ffff:ffff:ffff:ffff:ffff",
                1,
                "ab:cd:ef:01:23:45",
                "f00d:1:1::",
                48,
                "e:7"
            ),
            &ctx()
        )
        .is_err());
    }

    #[test]
    fn test_bit_budget_egress() {
        // out side: 48 + 48 + 32 = 128 accepted, 49-bit plane rejected
        assert!(TranslationRule::derive(
            &m46e_spec(Domain::Pr, "1:2", 64, "192.168.102.0", 24, "f00d:1:1::", 48, "8fff:ffff:ffff"),
            &ctx()
        )
        .is_ok());
        assert!(TranslationRule::derive(
            &m46e_spec(Domain::Pr, "1:2", 64, "192.168.103.0", 24, "f00d:1:1::", 48, "1:ffff:ffff:ffff"),
            &ctx()
        )
        .is_err());
    }

    #[test]
    fn test_m46e_requires_network_address() {
        let spec = m46e_spec(
            Domain::Pr,
            "1:2",
            64,
            "192.168.102.1",
            24,
            "f00d:1:1::",
            48,
            "4:4",
        );
        assert!(matches!(
            TranslationRule::derive(&spec, &ctx()),
            Err(RuleError::NotNetworkAddr { .. })
        ));
    }

    #[test]
    fn test_fp_rule_requires_section() {
        let mut spec = me6e_spec(
            Domain::Fp,
            "1",
            16,
            "ab:cd:ef:01:23:45",
            "f00d:1:a::",
            48,
            "1:1",
        );
        spec.key.section = None;
        assert!(matches!(
            TranslationRule::derive(&spec, &ctx()),
            Err(RuleError::MissingSection)
        ));
    }

    #[test]
    fn test_invalid_plane_id() {
        let spec = m46e_spec(
            Domain::Pr,
            "not-a-pid",
            64,
            "192.168.102.0",
            24,
            "f00d:1:1::",
            48,
            "4:4",
        );
        assert!(TranslationRule::derive(&spec, &ctx()).is_err());
    }

    #[test]
    fn test_zero_plane_id_is_wildcard() {
        // an all-zero plane ID is permitted and fixes no plane bits
        let spec = m46e_spec(Domain::Pr, "0", 64, "192.168.102.0", 24, "f00d:1:1::", 48, "0");
        let rule = TranslationRule::derive(&spec, &ctx()).unwrap();
        assert_eq!(format_v6(rule.match_addr), "::c0a8:6600");
    }

    #[test]
    fn test_prefix_len_extremes() {
        // both kinds accept /1 and /127 where the budget admits
        assert!(TranslationRule::derive(
            &m46e_spec(Domain::Pr, "1", 1, "10.0.0.0", 8, "f00d::", 1, "1"),
            &ctx()
        )
        .is_ok());
        assert!(TranslationRule::derive(
            &me6e_spec(Domain::Pr, "0", 79, "ab:cd:ef:01:23:45", "f00d::", 16, "0"),
            &ctx()
        )
        .is_ok());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let spec = m46e_spec(
            Domain::Fp,
            "1:3",
            78,
            "192.168.100.0",
            24,
            "f00d:1:5::",
            48,
            "5:1",
        );
        let a = TranslationRule::derive(&spec, &ctx()).unwrap();
        let b = TranslationRule::derive(&spec, &ctx()).unwrap();
        assert_eq!(a.match_addr, b.match_addr);
        assert_eq!(a.match_mask, b.match_mask);
        assert_eq!(a.templates(), b.templates());
        assert_eq!(a.tunnel_route_addr, b.tunnel_route_addr);
    }

    #[test]
    fn test_sub_byte_prefix_residue_in_match() {
        // /78 clears 78 bits including 6 bits of the straddling byte
        let spec = m46e_spec(
            Domain::Pr,
            "1:3",
            78,
            "192.168.100.0",
            24,
            "f00d:1:5::",
            48,
            "5:1",
        );
        let rule = TranslationRule::derive(&spec, &ctx()).unwrap();
        assert_eq!(rule.match_mask & mask_from_prefix(78), 0);
        assert_eq!(rule.match_addr & mask_from_prefix(78), 0);
        // plane bits below bit 78 survive
        assert_ne!(rule.match_addr & !mask_from_prefix(78) & !0xffff_ffffu128, 0);
    }
}
