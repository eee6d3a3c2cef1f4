//! IPv6-over-IPv6 address translation gateway library.
//!
//! This crate implements the building blocks of an M46E/ME6E prefix
//! translation gateway that bridges a provider (PR) and a fabric (FP)
//! IPv6 domain. Encapsulated IPv4-in-IPv6 (M46E) and Ethernet-in-IPv6
//! (ME6E) tunnel packets entering on one side are rewritten so that
//! their outer source and destination addresses carry the opposite
//! domain's prefix and plane identifier.
//!
//! # Components
//!
//! - [`addr`] - 128-bit address arithmetic (prefix masks, sub-byte
//!   prefix copies, plane-ID parsing)
//! - [`rule`] - translation rules and the derivation of match keys and
//!   rewrite templates from operator-facing configuration
//! - [`table`] - the per-kind, per-domain indexed rule tables used on
//!   the forwarding path
//! - [`packet`] - the per-frame classification and rewrite pipeline
//! - [`stats`] - forwarding counters
//! - [`config`] - the daemon configuration file
//! - [`command`] - control-socket command records
//! - [`ctrlsock`] - the SEQPACKET control socket with peer credentials
//! - [`netlink`] - the kernel route/address shim
//! - [`tuntap`] - TAP device management
//!
//! # Example
//!
//! ```ignore
//! use mx6e::rule::{DeriveCtx, Domain, InnerSpec, RuleKind, RuleSpec};
//! use mx6e::table::TableSet;
//!
//! let ctx = DeriveCtx {
//!     tunnel_pr_addr: "2001:db8:2::".parse()?,
//!     tunnel_pr_prefix_len: 48,
//! };
//! let tables = TableSet::new();
//! tables.m46e.insert(&spec, &ctx, &routes)?;
//!
//! if let Some((kind, tmpl)) = tables.lookup(Domain::Pr, dst) {
//!     // rewrite the packet with tmpl
//! }
//! ```

pub mod addr;
pub mod command;
pub mod config;
pub mod ctrlsock;
pub mod netlink;
pub mod packet;
pub mod rule;
pub mod stats;
pub mod table;
pub mod tuntap;

pub use rule::{Domain, RuleKind};
pub use table::{MAX_RULES_PER_TABLE, TableSet};
