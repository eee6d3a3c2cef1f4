//! Argument grammar for rule commands.
//!
//! The positional grammar is operational interface, shared between the
//! command line and `load` files:
//!
//! ```text
//! add     m46e pr -                  IN_PLANE IN_PREFIX_LEN V4NET/CIDR V6NET/LEN OUT_PLANE enable|disable
//! add     m46e fp SECTION_V6NET/LEN IN_PLANE IN_PREFIX_LEN V4NET/CIDR V6NET/LEN OUT_PLANE enable|disable
//! del     m46e pr|fp SECTION|- IN_PLANE IN_PREFIX_LEN V4NET/CIDR
//! enable  m46e pr|fp SECTION|- IN_PLANE IN_PREFIX_LEN V4NET/CIDR
//! disable m46e pr|fp SECTION|- IN_PLANE IN_PREFIX_LEN V4NET/CIDR
//! delall  m46e
//! ```
//!
//! and the same shapes for `me6e` with a MAC address as the inner
//! field. PR rules take `-` in the section position; FP rules must
//! supply the section device prefix there.

use anyhow::{Context, Result, bail};

use mx6e::addr::{MacAddr, parse_v4_prefix, parse_v6_prefix};
use mx6e::command::Request;
use mx6e::config::parse_bool;
use mx6e::rule::{Domain, InnerSpec, RuleKeySpec, RuleKind, RuleSpec};

/// Parse a table kind name (`m46e` / `me6e`).
pub fn parse_kind(s: &str) -> Result<RuleKind> {
    match s.to_ascii_lowercase().as_str() {
        "m46e" => Ok(RuleKind::M46e),
        "me6e" => Ok(RuleKind::Me6e),
        _ => bail!("unknown table {s:?} (expected m46e or me6e)"),
    }
}

fn parse_domain(s: &str) -> Result<Domain> {
    match s.to_ascii_lowercase().as_str() {
        "pr" => Ok(Domain::Pr),
        "fp" => Ok(Domain::Fp),
        _ => bail!("unknown domain {s:?} (expected pr or fp)"),
    }
}

fn parse_inner(kind: RuleKind, s: &str) -> Result<InnerSpec> {
    match kind {
        RuleKind::M46e => {
            let (addr, cidr) =
                parse_v4_prefix(s).context("expected ipv4_network_address/prefix_len")?;
            Ok(InnerSpec::V4 { addr, cidr })
        }
        RuleKind::Me6e => {
            let mac: MacAddr = s.parse().context("expected hwaddr")?;
            Ok(InnerSpec::Mac(mac))
        }
    }
}

/// Parse the key-field positionals shared by del/enable/disable.
pub fn parse_key(
    kind: RuleKind,
    domain: &str,
    section: &str,
    in_plane_id: &str,
    in_prefix_len: &str,
    inner: &str,
) -> Result<RuleKeySpec> {
    let domain = parse_domain(domain)?;
    let section = match domain {
        Domain::Pr => None,
        Domain::Fp => Some(
            parse_v6_prefix(section)
                .context("FP rules require section_device_ipv6_network_address/prefix_len")?,
        ),
    };
    let in_prefix_len: u8 = in_prefix_len
        .parse()
        .ok()
        .filter(|len| *len <= 128)
        .context("expected prefix_len_in in 0..=128")?;
    Ok(RuleKeySpec {
        domain,
        section,
        in_plane_id: in_plane_id.to_string(),
        in_prefix_len,
        inner: parse_inner(kind, inner)?,
    })
}

/// Parse the full `add` positionals.
#[allow(clippy::too_many_arguments)]
pub fn parse_add(
    kind: RuleKind,
    domain: &str,
    section: &str,
    in_plane_id: &str,
    in_prefix_len: &str,
    inner: &str,
    out_prefix: &str,
    out_plane_id: &str,
    mode: &str,
) -> Result<RuleSpec> {
    let key = parse_key(kind, domain, section, in_plane_id, in_prefix_len, inner)?;
    let (out_prefix, out_prefix_len) =
        parse_v6_prefix(out_prefix).context("expected ipv6_network_address/prefix_len")?;
    let enable = parse_bool(mode).context("expected enable or disable")?;
    Ok(RuleSpec {
        key,
        out_prefix,
        out_prefix_len,
        out_plane_id: out_plane_id.to_string(),
        enable,
    })
}

fn add_request(kind: RuleKind, spec: RuleSpec) -> Request {
    match kind {
        RuleKind::M46e => Request::AddM46e(spec),
        RuleKind::Me6e => Request::AddMe6e(spec),
    }
}

fn del_request(kind: RuleKind, key: RuleKeySpec) -> Request {
    match kind {
        RuleKind::M46e => Request::DelM46e(key),
        RuleKind::Me6e => Request::DelMe6e(key),
    }
}

fn enable_request(kind: RuleKind, key: RuleKeySpec, enable: bool) -> Request {
    match (kind, enable) {
        (RuleKind::M46e, true) => Request::EnableM46e(key),
        (RuleKind::M46e, false) => Request::DisableM46e(key),
        (RuleKind::Me6e, true) => Request::EnableMe6e(key),
        (RuleKind::Me6e, false) => Request::DisableMe6e(key),
    }
}

/// Build requests from command forms. Used by the subcommand handlers
/// and by `load` file replay, which carries one command per line.
pub fn request_from_tokens(tokens: &[&str]) -> Result<Request> {
    let expect = |n: usize| -> Result<()> {
        if tokens.len() != n {
            bail!(
                "wrong argument count for {:?}: got {}, expected {}",
                tokens[0],
                tokens.len() - 2,
                n - 2
            );
        }
        Ok(())
    };

    if tokens.len() < 2 {
        bail!("empty command");
    }
    let verb = tokens[0].to_ascii_lowercase();
    let kind = parse_kind(tokens[1])?;

    match verb.as_str() {
        "add" => {
            expect(10)?;
            let spec = parse_add(
                kind, tokens[2], tokens[3], tokens[4], tokens[5], tokens[6], tokens[7], tokens[8],
                tokens[9],
            )?;
            Ok(add_request(kind, spec))
        }
        "del" => {
            expect(7)?;
            let key = parse_key(kind, tokens[2], tokens[3], tokens[4], tokens[5], tokens[6])?;
            Ok(del_request(kind, key))
        }
        "enable" | "disable" => {
            expect(7)?;
            let key = parse_key(kind, tokens[2], tokens[3], tokens[4], tokens[5], tokens[6])?;
            Ok(enable_request(kind, key, verb == "enable"))
        }
        "delall" => {
            expect(2)?;
            Ok(match kind {
                RuleKind::M46e => Request::DelAllM46e,
                RuleKind::Me6e => Request::DelAllMe6e,
            })
        }
        "show" => {
            expect(2)?;
            Ok(match kind {
                RuleKind::M46e => Request::ShowM46e,
                RuleKind::Me6e => Request::ShowMe6e,
            })
        }
        _ => bail!("unknown command {verb:?}"),
    }
}
