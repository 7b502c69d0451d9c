//! Unix plumbing shared by the link backends.
//!
//! Everything in here is a thin, typed veneer over raw `libc` calls: the
//! errno representation, result interpretation for the various integer
//! conventions, the readiness wait and the packet read/write primitives that
//! both backends use unchanged. The ioctl constants specific to a backend
//! live next to that backend instead.
// Copyright (C) 2016 whitequark@whitequark.org
// Copyright (C) 2019 Andreas Molzer <andreas.molzer@tum.de>
//
// The errno and result plumbing in this file derives from `smoltcp`,
// originally distributed under 0-clause BSD.
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

mod disc;
pub mod ether;
mod inet;
mod stream;

pub use self::disc::DisciplineLink;
pub use self::stream::StreamLink;

/// The backend matching how this build's target kernel delivers packets.
#[cfg(feature = "stream")]
pub use self::stream::StreamLink as PlatformLink;

/// The backend matching how this build's target kernel delivers packets.
#[cfg(not(feature = "stream"))]
pub use self::disc::DisciplineLink as PlatformLink;

/// An errno value.
///
/// This is used as the error representation of raw libc calls. It can be
/// converted into a `std::io::Error` where it will consequently have much
/// more extensive error information.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Errno(pub libc::c_int);

#[derive(Clone, Copy)]
pub(crate) struct FdResult(pub libc::c_int);

#[derive(Clone, Copy)]
pub(crate) struct IoLenResult(pub libc::ssize_t);

pub(crate) type IoctlResult = FdResult;
#[allow(non_snake_case)] // Emulate type alias also importing constructor.
pub(crate) fn IoctlResult(val: libc::c_int) -> IoctlResult {
    FdResult(val)
}

/// Trait for interpreting integer return values.
///
/// Failure signals may vary between:
/// * `-1`
/// * arbitrary negative values
/// * non-zero
pub(crate) trait LibcResult: Copy {
    fn is_fail(self) -> bool;

    fn errno(self) -> Result<(), Errno> {
        if self.is_fail() {
            Err(Errno::new())
        } else {
            Ok(())
        }
    }
}

impl Errno {
    /// Read the calling thread's current errno value.
    pub fn new() -> Errno {
        Errno(unsafe { *libc::__errno_location() })
    }

    /// The device behind the descriptor no longer exists.
    ///
    /// Restoration paths run after the modem may have hung up and the kernel
    /// discarded the link; every teardown step treats this answer as "nothing
    /// left to undo" rather than as a failure.
    pub fn device_gone(self) -> bool {
        self.0 == libc::ENXIO || self.0 == libc::EIO
    }

    /// The driver does not implement the request at all.
    pub fn not_supported(self) -> bool {
        self.0 == libc::ENOTTY || self.0 == libc::EINVAL
    }

    /// The call was cut short by a delivered signal.
    pub fn interrupted(self) -> bool {
        self.0 == libc::EINTR
    }

    /// The descriptor has nothing ready right now.
    pub fn would_block(self) -> bool {
        self.0 == libc::EAGAIN || self.0 == libc::EWOULDBLOCK
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

impl std::error::Error for Errno {}

impl From<Errno> for io::Error {
    fn from(err: Errno) -> io::Error {
        io::Error::from_raw_os_error(err.0)
    }
}

impl LibcResult for FdResult {
    fn is_fail(self) -> bool {
        self.0 == -1
    }
}

impl LibcResult for IoLenResult {
    fn is_fail(self) -> bool {
        self.0 == -1
    }
}

/// Base for an if ioctl request.
///
/// Contains the name of the interface.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types)]
pub(crate) struct ifreq {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
}

impl ifreq {
    pub(crate) fn new(name: &str) -> Self {
        let mut ifr_name = [0; libc::IF_NAMESIZE];

        for (i, byte) in name.as_bytes().iter().take(libc::IF_NAMESIZE - 1).enumerate() {
            ifr_name[i] = *byte as libc::c_char
        }

        ifreq { ifr_name }
    }

    pub(crate) fn name(&self) -> String {
        self.ifr_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8 as char)
            .collect()
    }
}

/// Encode a read-direction ioctl request number, BSD style.
pub(crate) const fn ior(group: u8, num: u8, len: usize) -> libc::Ioctl {
    0x4000_0000 | (((len as libc::Ioctl) & 0x1fff) << 16) | ((group as libc::Ioctl) << 8) | num as libc::Ioctl
}

/// Encode a write-direction ioctl request number, BSD style.
pub(crate) const fn iow(group: u8, num: u8, len: usize) -> libc::Ioctl {
    0x8000_0000 | (((len as libc::Ioctl) & 0x1fff) << 16) | ((group as libc::Ioctl) << 8) | num as libc::Ioctl
}

/// Wait until the descriptor has data or an exceptional condition, but no
/// longer than the given timeout.
///
/// Returns normally on data, a priority event, hang-up, timeout or a
/// delivered signal; the caller's loop follows up with a non-blocking read
/// and finds out which. Any other polling failure is reported.
pub(crate) fn wait_input(fd: RawFd, timeout: Option<Duration>) -> Result<(), Errno> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN | libc::POLLPRI | libc::POLLHUP,
        revents: 0,
    };

    let timeout = match timeout {
        Some(timeout) => timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };

    let res = unsafe { libc::poll(&mut pfd, 1, timeout) };

    match FdResult(res).errno() {
        Err(errno) if !errno.interrupted() => Err(errno),
        _ => Ok(()),
    }
}

/// Send a single packet over the descriptor.
pub(crate) fn send(fd: RawFd, buffer: &[u8]) -> Result<usize, Errno> {
    let len = unsafe { libc::write(fd, buffer.as_ptr() as *const libc::c_void, buffer.len()) };
    IoLenResult(len).errno()?;
    Ok(len as usize)
}

/// Receive a single packet from the descriptor.
///
/// Returns `None` when the descriptor is non-blocking and nothing has
/// arrived yet.
pub(crate) fn recv(fd: RawFd, buffer: &mut [u8]) -> Result<Option<usize>, Errno> {
    let len = unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
    match IoLenResult(len).errno() {
        Ok(()) => Ok(Some(len as usize)),
        Err(errno) if errno.would_block() => Ok(None),
        Err(errno) => Err(errno),
    }
}

/// Owner of an auxiliary configuration socket.
///
/// All interface, route and arp configuration goes through an ordinary
/// datagram socket rather than the serial device itself. The daemon usually
/// opens one of these right after start-up and passes its descriptor into
/// the [`LinkHandle`][crate::link::LinkHandle] of every adapter it creates.
#[derive(Debug)]
pub struct ControlSocket {
    lower: RawFd,
}

impl ControlSocket {
    /// Open a fresh configuration socket.
    pub fn open() -> Result<Self, Errno> {
        let lower = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };

        FdResult(lower).errno()?;

        Ok(ControlSocket { lower })
    }
}

impl AsRawFd for ControlSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.lower
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.lower);
        }
    }
}

/// Close the standard descriptors, keeping the ones the link still needs.
///
/// Used once during establish when the serial device is also the controlling
/// terminal: anything still connected to it would otherwise scribble into
/// the packet stream.
pub(crate) fn close_stdio(keep: &[RawFd]) {
    for fd in 0..=2 {
        if !keep.contains(&fd) {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
