//! SEQPACKET control socket with peer credentials.
//!
//! The daemon listens on a `SOCK_SEQPACKET` UNIX socket in the
//! abstract namespace; the CLI connects, sends one request datagram
//! and reads the response plus any raw-text datagrams until EOF.
//! The daemon only honors requests whose first datagram carries
//! `SCM_CREDENTIALS` ancillary data (the kernel fills it in once
//! `SO_PASSCRED` is enabled on the accepted socket); a record without
//! credentials is refused.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::command::socket_name;

/// Maximum size of a single control datagram.
pub const MAX_RECORD: usize = 64 * 1024;

/// Peer identity delivered with a request.
#[derive(Debug, Clone, Copy)]
pub struct PeerCred {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

fn sockaddr_for(process_name: &str) -> (libc::sockaddr_un, libc::socklen_t) {
    let name = socket_name(process_name);
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let len = name.len().min(addr.sun_path.len());
    for (dst, src) in addr.sun_path.iter_mut().zip(name[..len].iter()) {
        *dst = *src as libc::c_char;
    }
    let addr_len = mem::offset_of!(libc::sockaddr_un, sun_path) + len;
    (addr, addr_len as libc::socklen_t)
}

fn seqpacket_socket() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_passcred(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            &on as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The daemon side of the control socket.
pub struct CommandListener {
    fd: OwnedFd,
}

impl CommandListener {
    /// Bind and listen on the abstract socket for a process name.
    /// Credential passing is enabled on the listener so accepted
    /// connections inherit it before any datagram can arrive.
    pub fn bind(process_name: &str) -> io::Result<CommandListener> {
        let fd = seqpacket_socket()?;
        set_passcred(fd.as_raw_fd())?;
        let (addr, addr_len) = sockaddr_for(process_name);
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                addr_len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::listen(fd.as_raw_fd(), 100) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(CommandListener { fd })
    }

    /// Accept one connection, credential passing already enabled.
    pub fn accept(&self) -> io::Result<CommandStream> {
        let fd = unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let stream = CommandStream {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };
        set_passcred(stream.fd.as_raw_fd())?;
        Ok(stream)
    }
}

impl AsRawFd for CommandListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// One control connection (either side).
pub struct CommandStream {
    fd: OwnedFd,
}

impl CommandStream {
    /// Connect to the daemon for a process name.
    pub fn connect(process_name: &str) -> io::Result<CommandStream> {
        let fd = seqpacket_socket()?;
        let (addr, addr_len) = sockaddr_for(process_name);
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                addr_len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(CommandStream { fd })
    }

    /// Send one datagram.
    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        let rc = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Receive one datagram. Returns 0 at EOF.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Receive one datagram along with the sender's credentials.
    ///
    /// Returns `None` for the credentials if the kernel attached no
    /// `SCM_CREDENTIALS` control message; the daemon refuses such
    /// records.
    pub fn recv_with_cred(&self, buf: &mut [u8]) -> io::Result<(usize, Option<PeerCred>)> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut cmsg_space = [0u8; 64];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space.len();

        let rc = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut cred = None;
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let hdr = unsafe { &*cmsg };
            if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_CREDENTIALS {
                let ucred = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::ucred) };
                cred = Some(PeerCred {
                    pid: ucred.pid,
                    uid: ucred.uid,
                    gid: ucred.gid,
                });
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }

        Ok((rc as usize, cred))
    }
}

impl AsRawFd for CommandStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
