//! Indexed translation-rule tables.
//!
//! One table per translation kind; the ingress domain is part of the
//! key, so each table effectively holds a PR and an FP partition.
//! Rules are ordered by `(domain, match_addr, match_mask)`. The
//! forwarding-path lookup probes per distinct mask: for each mask
//! registered under the packet's domain (most specific first) the
//! table is probed for `(domain, dst & mask, mask)`, which realizes
//! the masked-comparison lookup over an ordered container in
//! O(masks x log n).
//!
//! Kernel route side effects are tied to rule state transitions and
//! performed inside the table lock, so the datapath never observes a
//! rule whose route status disagrees with its enable flag.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::addr::format_v6;
use crate::rule::{
    Domain, DeriveCtx, RewriteTemplates, RuleError, RuleKeySpec, RuleKind, RuleSpec,
    TranslationRule, derive_match,
};

/// Capacity bound per table (each kind separately).
pub const MAX_RULES_PER_TABLE: usize = 4096;

/// Ordering key of a stored rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuleKey {
    pub domain: Domain,
    pub addr: u128,
    pub mask: u128,
}

/// Kernel route side effects invoked on rule state transitions.
///
/// The daemon backs this with the netlink shim; tests substitute a
/// recording mock. Failures are logged by the table and do not unwind
/// the in-memory transition.
pub trait RouteControl {
    /// Install the rule's route toward the domain's ingress tunnel device.
    fn add_route(&self, domain: Domain, dst: u128, prefix_len: u8) -> io::Result<()>;

    /// Remove it again.
    fn del_route(&self, domain: Domain, dst: u128, prefix_len: u8) -> io::Result<()>;
}

/// Table operation errors.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("table is full ({MAX_RULES_PER_TABLE} entries)")]
    Full,

    #[error("entry already exists")]
    Duplicate,

    #[error("entry not found")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, TableError>;

struct Inner {
    rules: BTreeMap<RuleKey, TranslationRule>,
    /// Reference-counted distinct masks per domain, probed by
    /// `find_for_packet` in descending (most-specific-first) order.
    masks: BTreeMap<(Domain, u128), usize>,
}

/// An ordered rule table for one translation kind.
pub struct RuleTable {
    kind: RuleKind,
    inner: Mutex<Inner>,
}

impl RuleTable {
    pub fn new(kind: RuleKind) -> Self {
        RuleTable {
            kind,
            inner: Mutex::new(Inner {
                rules: BTreeMap::new(),
                masks: BTreeMap::new(),
            }),
        }
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    /// Number of live rules.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Derive and insert a rule. Refuses duplicates, a full table and
    /// any derivation failure without side effects. If the rule is
    /// enabled, its route is installed before the lock is released.
    pub fn insert(
        &self,
        spec: &RuleSpec,
        ctx: &DeriveCtx,
        routes: &dyn RouteControl,
    ) -> Result<()> {
        if spec.key.inner.kind() != self.kind {
            return Err(RuleError::KindMismatch.into());
        }
        let rule = TranslationRule::derive(spec, ctx)?;
        let key = RuleKey {
            domain: rule.domain,
            addr: rule.match_addr,
            mask: rule.match_mask,
        };

        let mut inner = self.inner.lock().unwrap();
        if inner.rules.len() >= MAX_RULES_PER_TABLE {
            info!(kind = self.kind.name(), "table is full");
            return Err(TableError::Full);
        }
        if inner.rules.contains_key(&key) {
            info!(
                kind = self.kind.name(),
                addr = %format_v6(key.addr),
                "entry already exists"
            );
            return Err(TableError::Duplicate);
        }

        if rule.enable
            && let Err(e) = routes.add_route(
                rule.domain,
                rule.tunnel_route_addr,
                rule.tunnel_route_prefix_len,
            )
        {
            warn!(
                dst = %format_v6(rule.tunnel_route_addr),
                prefix_len = rule.tunnel_route_prefix_len,
                error = %e,
                "route install failed"
            );
        }

        *inner.masks.entry((key.domain, key.mask)).or_insert(0) += 1;
        inner.rules.insert(key, rule);
        Ok(())
    }

    /// Delete the rule identified by the key fields. The route is
    /// removed first when the rule was enabled. A missing entry is
    /// logged and reported as success, matching the command contract.
    pub fn delete(
        &self,
        key_spec: &RuleKeySpec,
        ctx: &DeriveCtx,
        routes: &dyn RouteControl,
    ) -> Result<()> {
        let key = self.key_of(key_spec, ctx)?;

        let mut inner = self.inner.lock().unwrap();
        let Some(rule) = inner.rules.get(&key) else {
            info!(
                kind = self.kind.name(),
                addr = %format_v6(key.addr),
                "no matching entry to delete"
            );
            return Ok(());
        };

        if rule.enable
            && let Err(e) = routes.del_route(
                rule.domain,
                rule.tunnel_route_addr,
                rule.tunnel_route_prefix_len,
            )
        {
            warn!(
                dst = %format_v6(rule.tunnel_route_addr),
                error = %e,
                "route removal failed"
            );
        }

        inner.rules.remove(&key);
        release_mask(&mut inner.masks, key.domain, key.mask);
        Ok(())
    }

    /// Enable or disable the rule identified by the key fields. The
    /// route is synchronized on actual transitions; the in-memory flag
    /// is updated even if the route call fails (the discrepancy is
    /// logged).
    pub fn set_enabled(
        &self,
        key_spec: &RuleKeySpec,
        ctx: &DeriveCtx,
        enable: bool,
        routes: &dyn RouteControl,
    ) -> Result<()> {
        let key = self.key_of(key_spec, ctx)?;

        let mut inner = self.inner.lock().unwrap();
        let Some(rule) = inner.rules.get_mut(&key) else {
            info!(
                kind = self.kind.name(),
                addr = %format_v6(key.addr),
                "no matching entry to toggle"
            );
            return Err(TableError::NotFound);
        };

        if rule.enable != enable {
            let res = if enable {
                routes.add_route(
                    rule.domain,
                    rule.tunnel_route_addr,
                    rule.tunnel_route_prefix_len,
                )
            } else {
                routes.del_route(
                    rule.domain,
                    rule.tunnel_route_addr,
                    rule.tunnel_route_prefix_len,
                )
            };
            if let Err(e) = res {
                warn!(
                    dst = %format_v6(rule.tunnel_route_addr),
                    enable,
                    error = %e,
                    "route update failed; flag updated anyway"
                );
            }
        }
        rule.enable = enable;
        Ok(())
    }

    /// Forwarding-path lookup: the enabled rule whose
    /// `(match_addr, match_mask)` footprint covers `dst` in the given
    /// domain. The query mask is implicitly zero, so the effective mask
    /// is exactly each candidate's stored mask.
    pub fn find_for_packet(&self, domain: Domain, dst: u128) -> Option<RewriteTemplates> {
        let inner = self.inner.lock().unwrap();
        for (&(_, mask), _) in inner
            .masks
            .range((domain, 0)..=(domain, u128::MAX))
            .rev()
        {
            let key = RuleKey {
                domain,
                addr: dst & mask,
                mask,
            };
            if let Some(rule) = inner.rules.get(&key) {
                if rule.enable {
                    return Some(rule.templates());
                }
                debug!(addr = %format_v6(key.addr), "matched entry is disabled");
                return None;
            }
        }
        None
    }

    /// Remove every rule, removing each enabled rule's route first.
    pub fn clear_all(&self, routes: &dyn RouteControl) {
        let mut inner = self.inner.lock().unwrap();
        for rule in inner.rules.values() {
            if rule.enable
                && let Err(e) = routes.del_route(
                    rule.domain,
                    rule.tunnel_route_addr,
                    rule.tunnel_route_prefix_len,
                )
            {
                warn!(
                    dst = %format_v6(rule.tunnel_route_addr),
                    error = %e,
                    "route removal failed"
                );
            }
        }
        inner.rules.clear();
        inner.masks.clear();
    }

    /// Ordered snapshot of the table for dumps and tests.
    pub fn snapshot(&self) -> Vec<TranslationRule> {
        self.inner.lock().unwrap().rules.values().cloned().collect()
    }

    /// Write the table in the operator-facing tabular form, in key order.
    pub fn dump(&self, w: &mut dyn Write) -> io::Result<()> {
        let title = match self.kind {
            RuleKind::M46e => "M46E Prefix Resolution Table",
            RuleKind::Me6e => "ME6E Prefix Resolution Table",
        };

        let header = format!(
            "|{:1}|{:6}|{:39}|{:7}|{:20}|{:10}|{:20}|{:7}|{:20}|{:39}|{:7}|",
            "*",
            "domain",
            "section device IPv6 Network Address",
            "Netmask",
            "plane_id(in)",
            "prefix_len",
            "IPv4/MAC Address",
            "Netmask",
            "plane_id(out)",
            "IPv6 Network Address",
            "Netmask",
        );
        let bar: String = header
            .chars()
            .map(|c| if c == '|' { '+' } else { '-' })
            .collect();

        writeln!(w, "{bar}")?;
        writeln!(w, "|{:1$}|", format!(" {title}"), bar.len() - 2)?;
        writeln!(w, "{bar}")?;
        writeln!(w, "{header}")?;
        writeln!(w, "{bar}")?;

        let inner = self.inner.lock().unwrap();
        for rule in inner.rules.values() {
            let (inner_addr, inner_mask) = match self.kind {
                RuleKind::M46e => {
                    let d = rule.inner_display();
                    let (a, m) = d.split_once('/').unwrap_or((d.as_str(), "-"));
                    (a.to_string(), m.to_string())
                }
                RuleKind::Me6e => (rule.inner_display(), "-".to_string()),
            };
            writeln!(
                w,
                "|{:1}|{:6}|{:39}|{:7}|{:20}|{:10}|{:20}|{:7}|{:20}|{:39}|{:7}|",
                if rule.enable { "*" } else { " " },
                rule.domain.name(),
                rule.section_addr.to_string(),
                rule.section_prefix_len,
                rule.in_plane_id,
                rule.in_prefix_len,
                inner_addr,
                inner_mask,
                rule.out_plane_id,
                rule.out_prefix.to_string(),
                rule.out_prefix_len,
            )?;
        }
        writeln!(w, "{bar}")?;
        writeln!(
            w,
            "  Note : [*] shows available entry for prefix resolution process."
        )?;
        Ok(())
    }

    fn key_of(&self, key_spec: &RuleKeySpec, ctx: &DeriveCtx) -> Result<RuleKey> {
        if key_spec.inner.kind() != self.kind {
            return Err(RuleError::KindMismatch.into());
        }
        let m = derive_match(key_spec, ctx)?;
        Ok(RuleKey {
            domain: key_spec.domain,
            addr: m.match_addr,
            mask: m.match_mask,
        })
    }
}

fn release_mask(masks: &mut BTreeMap<(Domain, u128), usize>, domain: Domain, mask: u128) {
    if let Some(count) = masks.get_mut(&(domain, mask)) {
        *count -= 1;
        if *count == 0 {
            masks.remove(&(domain, mask));
        }
    }
}

/// The two kind-tables of the gateway.
pub struct TableSet {
    pub m46e: RuleTable,
    pub me6e: RuleTable,
}

impl TableSet {
    pub fn new() -> Self {
        TableSet {
            m46e: RuleTable::new(RuleKind::M46e),
            me6e: RuleTable::new(RuleKind::Me6e),
        }
    }

    /// Packet-time lookup: M46E first, then ME6E, regardless of the
    /// packet's next header. Encapsulated ICMP and other protocols ride
    /// the same rules, so classification never branches on the
    /// transport.
    pub fn lookup(&self, domain: Domain, dst: u128) -> Option<(RuleKind, RewriteTemplates)> {
        if let Some(t) = self.m46e.find_for_packet(domain, dst) {
            return Some((RuleKind::M46e, t));
        }
        self.me6e
            .find_for_packet(domain, dst)
            .map(|t| (RuleKind::Me6e, t))
    }

    pub fn table(&self, kind: RuleKind) -> &RuleTable {
        match kind {
            RuleKind::M46e => &self.m46e,
            RuleKind::Me6e => &self.me6e,
        }
    }
}

impl Default for TableSet {
    fn default() -> Self {
        Self::new()
    }
}
