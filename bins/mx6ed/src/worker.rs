//! Forwarding workers.
//!
//! One worker per ingress direction, each on its own OS thread. A
//! worker blocks in `poll` on its TAP descriptor and the process-wide
//! shutdown pipe, reads one frame at a time, runs the classification
//! and rewrite pipeline, and writes the result to the opposite TAP.
//! No queue sits in between; a failed write drops the frame and bumps
//! the error counter.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use mx6e::packet::{self, RECV_BUF_SIZE, Verdict};
use mx6e::rule::Domain;
use mx6e::stats::Statistics;
use mx6e::table::TableSet;
use mx6e::tuntap::TapDevice;

/// Process-wide shutdown notification.
///
/// The control loop holds the write end of a pipe; dropping it (or
/// calling [`raise`](Self::raise)) makes the read end readable, which
/// every worker polls alongside its TAP.
pub struct ShutdownSignal {
    read: Arc<OwnedFd>,
    write: Option<OwnedFd>,
}

impl ShutdownSignal {
    pub fn new() -> io::Result<ShutdownSignal> {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ShutdownSignal {
            read: Arc::new(unsafe { OwnedFd::from_raw_fd(fds[0]) }),
            write: Some(unsafe { OwnedFd::from_raw_fd(fds[1]) }),
        })
    }

    /// A handle for one worker to poll.
    pub fn watcher(&self) -> Arc<OwnedFd> {
        self.read.clone()
    }

    /// Request shutdown: closing the write end wakes all watchers.
    pub fn raise(mut self) {
        self.write.take();
    }
}

enum Wake {
    Frame,
    Shutdown,
    Interrupted,
}

/// One forwarding direction.
pub struct ForwardWorker {
    pub domain: Domain,
    pub ingress: Arc<TapDevice>,
    pub egress: Arc<TapDevice>,
    pub tables: Arc<TableSet>,
    pub stats: Arc<Statistics>,
    pub shutdown: Arc<OwnedFd>,
}

impl ForwardWorker {
    /// The worker main loop. Returns on shutdown.
    pub fn run(self) {
        let mut buf = vec![0u8; RECV_BUF_SIZE];

        // Discard anything that queued on the TAP while the rule
        // tables were still empty.
        let mut drained = 0usize;
        while self.ingress.readable_now().unwrap_or(false) {
            if self.ingress.read_frame(&mut buf).is_err() {
                break;
            }
            drained += 1;
        }
        if drained > 0 {
            debug!(domain = self.domain.name(), drained, "drained stale frames");
        }

        info!(
            domain = self.domain.name(),
            ingress = self.ingress.name(),
            egress = self.egress.name(),
            "forwarding loop start"
        );

        loop {
            match self.wait() {
                Wake::Shutdown => break,
                Wake::Interrupted => continue,
                Wake::Frame => {}
            }

            let len = match self.ingress.read_frame(&mut buf) {
                Ok(0) => continue,
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(domain = self.domain.name(), error = %e, "TAP read failed");
                    continue;
                }
            };
            if len >= buf.len() {
                // The kernel truncated the frame to our buffer.
                warn!(domain = self.domain.name(), len, "oversize frame dropped");
                continue;
            }

            let frame = &mut buf[..len];
            let verdict = packet::process_frame(
                frame,
                self.domain,
                &self.tables,
                self.ingress.hwaddr(),
                self.egress.hwaddr(),
                &self.stats,
            );
            match verdict {
                Verdict::Forward(kind) => match self.egress.write_frame(frame) {
                    Ok(_) => self.stats.dir(self.domain).record_ok(kind),
                    Err(e) => {
                        debug!(
                            domain = self.domain.name(),
                            kind = kind.name(),
                            error = %e,
                            "egress write failed"
                        );
                        self.stats.dir(self.domain).record_err(kind);
                    }
                },
                Verdict::Drop(reason) => {
                    trace!(domain = self.domain.name(), ?reason, "frame dropped");
                }
            }
        }

        info!(domain = self.domain.name(), "forwarding loop end");
    }

    fn wait(&self) -> Wake {
        let mut pfds = [
            libc::pollfd {
                fd: self.ingress.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.shutdown.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Wake::Interrupted;
            }
            warn!(domain = self.domain.name(), error = %err, "poll failed");
            return Wake::Shutdown;
        }
        if pfds[1].revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            return Wake::Shutdown;
        }
        Wake::Frame
    }
}
