//! The control loop.
//!
//! Single-threaded `poll` over the command-socket listener and a
//! signalfd. Table mutations and their route side effects run here,
//! under the table locks, so the forwarding workers always observe
//! rule and route state together.

use std::io::{self, Write};
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use tracing::{debug, info, warn};

use mx6e::command::{Request, Response};
use mx6e::config::Config;
use mx6e::ctrlsock::{CommandListener, CommandStream, MAX_RECORD};
use mx6e::netlink::RouteHandle;
use mx6e::rule::{Domain, DeriveCtx, RuleKind};
use mx6e::stats::Statistics;
use mx6e::table::{RouteControl, TableError, TableSet};

use crate::DebugLogHandle;

/// How the control loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Shutdown,
    Restart,
}

/// Route shim: rule transitions map to kernel routes toward the
/// domain's ingress tunnel device.
pub struct NetlinkRoutes {
    handle: RouteHandle,
    pr_ifindex: u32,
    fp_ifindex: u32,
}

impl NetlinkRoutes {
    pub fn new(pr_ifindex: u32, fp_ifindex: u32) -> mx6e::netlink::Result<NetlinkRoutes> {
        Ok(NetlinkRoutes {
            handle: RouteHandle::new()?,
            pr_ifindex,
            fp_ifindex,
        })
    }

    fn ifindex(&self, domain: Domain) -> u32 {
        match domain {
            Domain::Fp => self.fp_ifindex,
            Domain::Pr => self.pr_ifindex,
        }
    }
}

impl RouteControl for NetlinkRoutes {
    fn add_route(&self, domain: Domain, dst: u128, prefix_len: u8) -> io::Result<()> {
        self.handle
            .add_route(self.ifindex(domain), Ipv6Addr::from(dst), prefix_len)
            .map_err(io::Error::other)
    }

    fn del_route(&self, domain: Domain, dst: u128, prefix_len: u8) -> io::Result<()> {
        self.handle
            .del_route(self.ifindex(domain), Ipv6Addr::from(dst), prefix_len)
            .map_err(io::Error::other)
    }
}

/// Signals routed through the control loop's signalfd.
fn control_sigset() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        for sig in [
            libc::SIGINT,
            libc::SIGTERM,
            libc::SIGQUIT,
            libc::SIGHUP,
            libc::SIGCHLD,
        ] {
            libc::sigaddset(&mut set, sig);
        }
        set
    }
}

/// Block the signals the control loop handles via signalfd. Must run
/// before any thread is spawned so the mask is inherited everywhere.
pub fn block_signals() -> io::Result<()> {
    let set = control_sigset();
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// A signalfd carrying the blocked control signals.
pub struct SignalFd {
    fd: OwnedFd,
}

impl SignalFd {
    pub fn new() -> io::Result<SignalFd> {
        let set = control_sigset();
        let fd = unsafe { libc::signalfd(-1, &set, libc::SFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(SignalFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Read one pending signal number.
    pub fn read_signal(&self) -> io::Result<u32> {
        let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut info as *mut libc::signalfd_siginfo as *mut libc::c_void,
                size_of::<libc::signalfd_siginfo>(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if rc as usize != size_of::<libc::signalfd_siginfo>() {
            return Err(io::Error::other("short signalfd read"));
        }
        Ok(info.ssi_signo)
    }
}

impl AsRawFd for SignalFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.as_raw_fd()
    }
}

pub struct ControlLoop {
    pub config: Config,
    pub tables: Arc<TableSet>,
    pub stats: Arc<Statistics>,
    pub ctx: DeriveCtx,
    pub routes: NetlinkRoutes,
    pub listener: CommandListener,
    pub signal_fd: SignalFd,
    pub debug_log: DebugLogHandle,
}

impl ControlLoop {
    /// Run until a shutdown signal or command arrives.
    pub fn run(&mut self) -> ControlOutcome {
        info!("control loop start");
        loop {
            let mut pfds = [
                libc::pollfd {
                    fd: self.listener.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.signal_fd.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %err, "control loop poll failed");
                return ControlOutcome::Shutdown;
            }

            if pfds[1].revents & libc::POLLIN != 0
                && let Some(outcome) = self.handle_signal()
            {
                return outcome;
            }

            if pfds[0].revents & libc::POLLIN != 0
                && let Some(outcome) = self.handle_connection()
            {
                return outcome;
            }
        }
    }

    /// Returns `Some` when the signal requests termination.
    fn handle_signal(&mut self) -> Option<ControlOutcome> {
        let signo = match self.signal_fd.read_signal() {
            Ok(signo) => signo,
            Err(e) => {
                warn!(error = %e, "failed to read signal info");
                return None;
            }
        };
        match signo as i32 {
            libc::SIGCHLD => {
                // Reap whatever finished; the startup script mostly.
                loop {
                    let mut status = 0;
                    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
                    if pid <= 0 {
                        break;
                    }
                    debug!(pid, status, "child process reaped");
                }
                None
            }
            libc::SIGINT | libc::SIGTERM | libc::SIGQUIT | libc::SIGHUP => {
                info!(signal = signo, "termination signal");
                Some(ControlOutcome::Shutdown)
            }
            other => {
                debug!(signal = other, "signal ignored");
                None
            }
        }
    }

    /// Accept and serve one command connection. Returns `Some` when
    /// the command requests termination.
    fn handle_connection(&mut self) -> Option<ControlOutcome> {
        let stream = match self.listener.accept() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return None;
            }
        };

        let mut buf = vec![0u8; MAX_RECORD];
        let (len, cred) = match stream.recv_with_cred(&mut buf) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "command receive failed");
                return None;
            }
        };
        let Some(cred) = cred else {
            warn!("command without credentials refused");
            respond(&stream, &Response::error(libc::EACCES, "credentials required"));
            return None;
        };

        let request: Request = match serde_json::from_slice(&buf[..len]) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "malformed command record");
                respond(&stream, &Response::error(libc::EINVAL, "malformed command"));
                return None;
            }
        };
        debug!(
            command = request.name(),
            pid = cred.pid,
            uid = cred.uid,
            "command received"
        );

        self.dispatch(&stream, request)
    }

    fn dispatch(&mut self, stream: &CommandStream, request: Request) -> Option<ControlOutcome> {
        use Request::*;

        match request {
            AddM46e(spec) => {
                let result = self
                    .tables
                    .table(RuleKind::M46e)
                    .insert(&spec, &self.ctx, &self.routes);
                respond(stream, &table_response(result));
            }
            AddMe6e(spec) => {
                let result = self
                    .tables
                    .table(RuleKind::Me6e)
                    .insert(&spec, &self.ctx, &self.routes);
                respond(stream, &table_response(result));
            }
            DelM46e(key) => {
                let result = self
                    .tables
                    .table(RuleKind::M46e)
                    .delete(&key, &self.ctx, &self.routes);
                respond(stream, &table_response(result));
            }
            DelMe6e(key) => {
                let result = self
                    .tables
                    .table(RuleKind::Me6e)
                    .delete(&key, &self.ctx, &self.routes);
                respond(stream, &table_response(result));
            }
            DelAllM46e => {
                self.tables.table(RuleKind::M46e).clear_all(&self.routes);
                respond(stream, &Response::ok());
            }
            DelAllMe6e => {
                self.tables.table(RuleKind::Me6e).clear_all(&self.routes);
                respond(stream, &Response::ok());
            }
            EnableM46e(key) => {
                let result = self.tables.table(RuleKind::M46e).set_enabled(
                    &key,
                    &self.ctx,
                    true,
                    &self.routes,
                );
                respond(stream, &table_response(result));
            }
            EnableMe6e(key) => {
                let result = self.tables.table(RuleKind::Me6e).set_enabled(
                    &key,
                    &self.ctx,
                    true,
                    &self.routes,
                );
                respond(stream, &table_response(result));
            }
            DisableM46e(key) => {
                let result = self.tables.table(RuleKind::M46e).set_enabled(
                    &key,
                    &self.ctx,
                    false,
                    &self.routes,
                );
                respond(stream, &table_response(result));
            }
            DisableMe6e(key) => {
                let result = self.tables.table(RuleKind::Me6e).set_enabled(
                    &key,
                    &self.ctx,
                    false,
                    &self.routes,
                );
                respond(stream, &table_response(result));
            }
            ShowM46e => {
                self.show(stream, |tables, out| {
                    tables.table(RuleKind::M46e).dump(out)
                });
            }
            ShowMe6e => {
                self.show(stream, |tables, out| {
                    tables.table(RuleKind::Me6e).dump(out)
                });
            }
            ShowConfig => {
                let mut text = Vec::new();
                let result = self.config.dump(&mut text);
                respond_with_text(stream, result, &text);
            }
            ShowStatistics => {
                let mut text = Vec::new();
                let result = self.stats.write_report(&mut text);
                respond_with_text(stream, result, &text);
            }
            SetDebugLog(on) => {
                self.debug_log.set_debug(on);
                respond(stream, &Response::ok());
            }
            Shutdown => {
                respond(stream, &Response::ok());
                info!("shutdown command received");
                return Some(ControlOutcome::Shutdown);
            }
            Restart => {
                respond(stream, &Response::ok());
                info!("restart command received");
                return Some(ControlOutcome::Restart);
            }
        }
        None
    }

    fn show(
        &self,
        stream: &CommandStream,
        dump: impl FnOnce(&TableSet, &mut dyn Write) -> io::Result<()>,
    ) -> Option<ControlOutcome> {
        let mut text = Vec::new();
        let result = dump(&self.tables, &mut text);
        respond_with_text(stream, result, &text);
        None
    }
}

fn table_response(result: mx6e::table::Result<()>) -> Response {
    match result {
        Ok(()) => Response::ok(),
        Err(e) => {
            let code = match &e {
                TableError::Duplicate => libc::EEXIST,
                TableError::Full => libc::ENOSPC,
                TableError::NotFound => libc::ENOENT,
                TableError::Rule(_) => libc::EINVAL,
            };
            Response::error(code, e.to_string())
        }
    }
}

fn respond(stream: &CommandStream, response: &Response) {
    match serde_json::to_vec(response) {
        Ok(bytes) => {
            if let Err(e) = stream.send(&bytes) {
                warn!(error = %e, "response send failed");
            }
        }
        Err(e) => warn!(error = %e, "response encode failed"),
    }
}

/// Send the response record, then the body as raw-text datagrams.
fn respond_with_text(stream: &CommandStream, result: io::Result<()>, text: &[u8]) {
    match result {
        Ok(()) => {
            respond(stream, &Response::ok());
            for chunk in text.chunks(MAX_RECORD / 2) {
                if let Err(e) = stream.send(chunk) {
                    warn!(error = %e, "text send failed");
                    break;
                }
            }
        }
        Err(e) => respond(stream, &Response::error(libc::EIO, e.to_string())),
    }
}
