//! Forwarding counters.
//!
//! A fixed set of monotonic 32-bit counters, one block per ingress
//! direction. Workers and the control loop increment them concurrently;
//! relaxed atomics are sufficient because only monotonicity is
//! promised, not cross-counter consistency.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::rule::{Domain, RuleKind};

/// Counters for one ingress direction.
#[derive(Debug, Default)]
pub struct DirectionStats {
    pub recv: AtomicU32,
    pub send: AtomicU32,
    pub m46e_ok: AtomicU32,
    pub m46e_err: AtomicU32,
    pub me6e_ok: AtomicU32,
    pub me6e_err: AtomicU32,
    pub err_broadcast: AtomicU32,
    pub err_hoplimit: AtomicU32,
    pub err_other_proto: AtomicU32,
    pub err_nxthdr: AtomicU32,
}

impl DirectionStats {
    pub fn record_recv(&self) {
        self.recv.fetch_add(1, Ordering::Relaxed);
    }

    /// A successful forward also counts as a send attempt.
    pub fn record_ok(&self, kind: RuleKind) {
        self.send.fetch_add(1, Ordering::Relaxed);
        match kind {
            RuleKind::M46e => self.m46e_ok.fetch_add(1, Ordering::Relaxed),
            RuleKind::Me6e => self.me6e_ok.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// A failed forward (no match or write error) also counts as a
    /// send attempt.
    pub fn record_err(&self, kind: RuleKind) {
        self.send.fetch_add(1, Ordering::Relaxed);
        match kind {
            RuleKind::M46e => self.m46e_err.fetch_add(1, Ordering::Relaxed),
            RuleKind::Me6e => self.me6e_err.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_broadcast(&self) {
        self.err_broadcast.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hoplimit(&self) {
        self.err_hoplimit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_other_proto(&self) {
        self.err_other_proto.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nxthdr(&self) {
        self.err_nxthdr.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, c: &AtomicU32) -> u32 {
        c.load(Ordering::Relaxed)
    }
}

/// The statistics block shared by both workers and the control loop.
#[derive(Debug, Default)]
pub struct Statistics {
    pub fp: DirectionStats,
    pub pr: DirectionStats,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter block for an ingress direction.
    pub fn dir(&self, domain: Domain) -> &DirectionStats {
        match domain {
            Domain::Fp => &self.fp,
            Domain::Pr => &self.pr,
        }
    }

    /// Write the operator-facing report.
    pub fn write_report(&self, w: &mut dyn Write) -> io::Result<()> {
        let fp = &self.fp;
        let pr = &self.pr;

        let total_recv = fp.get(&fp.recv) + pr.get(&pr.recv);
        let total_send = fp.get(&fp.send) + pr.get(&pr.send);
        let total_drop = fp.get(&fp.err_broadcast)
            + fp.get(&fp.err_hoplimit)
            + fp.get(&fp.err_other_proto)
            + fp.get(&fp.err_nxthdr)
            + pr.get(&pr.err_broadcast)
            + pr.get(&pr.err_hoplimit)
            + pr.get(&pr.err_other_proto)
            + pr.get(&pr.err_nxthdr);
        let total_err = fp.get(&fp.m46e_err)
            + fp.get(&fp.me6e_err)
            + pr.get(&pr.m46e_err)
            + pr.get(&pr.me6e_err);

        writeln!(w, "packet count")?;
        writeln!(w, "  total receive count             : {total_recv}")?;
        writeln!(w, "  total send count                : {total_send}")?;
        writeln!(w, "  total drop count                : {total_drop}")?;
        writeln!(w, "  total error count               : {total_err}")?;
        writeln!(w)?;

        for (name, d) in [("fp", fp), ("pr", pr)] {
            writeln!(w, "[{name}]")?;
            writeln!(w, "  receive count                   : {}", d.get(&d.recv))?;
            writeln!(w, "  send count                      : {}", d.get(&d.send))?;
            writeln!(w, "  m46e send success count         : {}", d.get(&d.m46e_ok))?;
            writeln!(w, "  m46e send error count           : {}", d.get(&d.m46e_err))?;
            writeln!(w, "  me6e send success count         : {}", d.get(&d.me6e_ok))?;
            writeln!(w, "  me6e send error count           : {}", d.get(&d.me6e_err))?;
            writeln!(w, "  broadcast receive count         : {}", d.get(&d.err_broadcast))?;
            writeln!(w, "  hoplimit expired count          : {}", d.get(&d.err_hoplimit))?;
            writeln!(w, "  other protocol receive count    : {}", d.get(&d.err_other_proto))?;
            writeln!(w, "  next header error count         : {}", d.get(&d.err_nxthdr))?;
            writeln!(w)?;
        }
        Ok(())
    }
}
