//! TAP device management.
//!
//! The gateway owns two TAP devices, one per domain. Each is created
//! with `IFF_TAP | IFF_NO_PI`, marked NOARP and brought up; the MAC
//! address and interface index are captured at creation for the
//! bridge rewrite and the route shim. Frames are moved with plain
//! `read`/`write` on the shared descriptor: each device is read by
//! its owning worker and written by the opposite one, so the calls
//! take `&self`.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::addr::MacAddr;

// TUN/TAP ioctl constants
const TUNSETIFF: libc::c_ulong = 0x400454ca;

// TUN/TAP flags (from linux/if_tun.h)
/// TAP device (Layer 2).
const IFF_TAP: libc::c_short = 0x0002;
/// No protocol information.
const IFF_NO_PI: libc::c_short = 0x1000;

const TUN_DEVICE_PATH: &str = "/dev/net/tun";

/// Result type for TAP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during TAP operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Device name too long (max 15 characters).
    #[error("device name too long: {name} ({len} > 15 characters)")]
    NameTooLong {
        /// The name that was too long.
        name: String,
        /// The length of the name.
        len: usize,
    },

    /// Invalid device name.
    #[error("invalid device name: {0}")]
    InvalidName(String),

    /// Device not found.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// ioctl failed.
    #[error("ioctl {name} failed: {source}")]
    Ioctl {
        /// The ioctl name.
        name: &'static str,
        /// The underlying error.
        source: io::Error,
    },
}

impl Error {
    /// Create an ioctl error.
    pub fn ioctl(name: &'static str, source: io::Error) -> Self {
        Error::Ioctl { name, source }
    }
}

/// A TAP device owned by the gateway.
pub struct TapDevice {
    file: File,
    name: String,
    ifindex: u32,
    hwaddr: MacAddr,
}

impl TapDevice {
    /// Create a TAP device with the given name, mark it NOARP and
    /// bring it up.
    pub fn create(name: &str) -> Result<TapDevice> {
        if name.is_empty() {
            return Err(Error::InvalidName(name.to_string()));
        }
        if name.len() > libc::IFNAMSIZ - 1 {
            return Err(Error::NameTooLong {
                name: name.to_string(),
                len: name.len(),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(TUN_DEVICE_PATH)?;
        let fd = file.as_raw_fd();

        // Build ifreq
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        ifr.ifr_ifru.ifru_flags = IFF_TAP | IFF_NO_PI;
        let name_bytes = name.as_bytes();
        let name_slice = unsafe { &mut *(&mut ifr.ifr_name as *mut [libc::c_char] as *mut [u8]) };
        name_slice[..name_bytes.len()].copy_from_slice(name_bytes);

        let ret = unsafe { libc::ioctl(fd, TUNSETIFF, &ifr) };
        if ret < 0 {
            return Err(Error::ioctl("TUNSETIFF", io::Error::last_os_error()));
        }

        let ifindex = ifindex_by_name(name)?;
        let hwaddr = hwaddr_by_name(name)?;

        // NOARP: the gateway bridges frames itself, nothing resolves
        // addresses over these devices.
        add_flags_by_name(name, (libc::IFF_NOARP | libc::IFF_UP) as libc::c_short)?;

        Ok(TapDevice {
            file,
            name: name.to_string(),
            ifindex,
            hwaddr,
        })
    }

    /// Get the device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the interface index.
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Get the MAC address assigned by the kernel.
    pub fn hwaddr(&self) -> MacAddr {
        self.hwaddr
    }

    /// Read one frame. Blocks until a frame is available.
    pub fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::read(
                self.file.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Write one frame. TAP writes are atomic at frame granularity.
    pub fn write_frame(&self, buf: &[u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::write(
                self.file.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// True if a frame is ready to read right now.
    pub fn readable_now(&self) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc > 0 && pfd.revents & libc::POLLIN != 0)
    }
}

impl AsRawFd for TapDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Look up an interface index by name.
pub fn ifindex_by_name(name: &str) -> Result<u32> {
    let cname = CString::new(name).map_err(|_| Error::InvalidName(name.to_string()))?;
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        return Err(Error::DeviceNotFound(name.to_string()));
    }
    Ok(idx)
}

/// Query an interface's MAC address.
pub fn hwaddr_by_name(name: &str) -> Result<MacAddr> {
    let mut ifr = ifreq_for(name)?;
    with_dgram_socket(|fd| {
        let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut ifr) };
        if ret < 0 {
            return Err(Error::ioctl("SIOCGIFHWADDR", io::Error::last_os_error()));
        }
        let mut mac = [0u8; 6];
        let data = unsafe { &ifr.ifr_ifru.ifru_hwaddr.sa_data };
        for (dst, src) in mac.iter_mut().zip(data.iter()) {
            *dst = *src as u8;
        }
        Ok(MacAddr(mac))
    })
}

/// Add interface flags (keeps the existing ones).
pub fn add_flags_by_name(name: &str, flags: libc::c_short) -> Result<()> {
    let mut ifr = ifreq_for(name)?;
    with_dgram_socket(|fd| {
        let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut ifr) };
        if ret < 0 {
            return Err(Error::ioctl("SIOCGIFFLAGS", io::Error::last_os_error()));
        }
        unsafe { ifr.ifr_ifru.ifru_flags |= flags };
        let ret = unsafe { libc::ioctl(fd, libc::SIOCSIFFLAGS, &ifr) };
        if ret < 0 {
            return Err(Error::ioctl("SIOCSIFFLAGS", io::Error::last_os_error()));
        }
        Ok(())
    })
}

fn ifreq_for(name: &str) -> Result<libc::ifreq> {
    if name.len() > libc::IFNAMSIZ - 1 {
        return Err(Error::NameTooLong {
            name: name.to_string(),
            len: name.len(),
        });
    }
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let name_bytes = name.as_bytes();
    let name_slice = unsafe { &mut *(&mut ifr.ifr_name as *mut [libc::c_char] as *mut [u8]) };
    name_slice[..name_bytes.len()].copy_from_slice(name_bytes);
    Ok(ifr)
}

fn with_dgram_socket<T>(f: impl FnOnce(RawFd) -> Result<T>) -> Result<T> {
    let fd = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let result = f(fd);
    unsafe { libc::close(fd) };
    result
}
