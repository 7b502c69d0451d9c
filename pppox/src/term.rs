//! Serial line discipline: capture, mutate, restore.
//!
//! A ppp link needs the tty in a very particular shape — eight bit
//! characters, no parity, raw input, no output processing — and the daemon
//! is expected to put everything back the way it found it when the session
//! ends. [`Terminal`] owns that obligation: the first
//! [`configure`][Terminal::configure] takes the restore snapshot, and
//! [`restore`][Terminal::restore] applies it exactly once.

use core::mem;
use std::os::unix::io::RawFd;

use thiserror::Error;
use tracing::warn;

use crate::link::sys::{Errno, FdResult, LibcResult};
use crate::speed;

/// How the serial line should pace the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// Leave the flow control bits as found.
    #[default]
    Unchanged,
    /// RTS/CTS handshaking in the modem lines.
    Hardware,
    /// In-band XON/XOFF using DC1/DC3.
    Software,
    /// Explicitly no flow control.
    Disabled,
}

/// What the caller negotiated for the serial line itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtyOptions {
    /// Requested rate in bits per second, or 0 to keep the current rate.
    pub speed: u32,
    /// Whether a modem is on the line and carrier detect is meaningful.
    pub modem: bool,
    /// Flow control style.
    pub flow: FlowControl,
    /// Force local mode regardless of the modem option.
    pub force_local: bool,
}

/// A terminal configuration failure.
#[derive(Debug, Error)]
pub enum TermError {
    /// An attribute read or write failed on a live device.
    #[error("{op}: {errno}")]
    Os {
        /// The libc call that failed.
        op: &'static str,
        /// The reported cause.
        #[source]
        errno: Errno,
    },
    /// No rate was requested and the line reports the disabled-line code;
    /// the operator must supply an explicit rate.
    #[error("line speed is 0; need explicit speed setting")]
    LineDisabled,
}

/// The terminal configurator.
///
/// Holds the attribute snapshot taken before the first mutation and the
/// resolved line rate. Whether the terminal has been munged is independent
/// of whether the link is established; the daemon drives both.
pub struct Terminal {
    saved: Option<libc::termios>,
    baud_rate: u32,
}

impl Terminal {
    /// A configurator that has not touched anything yet.
    pub fn new() -> Self {
        Terminal {
            saved: None,
            baud_rate: 0,
        }
    }

    /// Put the serial device into the shape the link needs.
    ///
    /// Clears size, parity, stop bit and local bits; sets 8-bit characters,
    /// receiver enable and hang-up-on-close; raw input with a read
    /// granularity of one character and no timeout; local mode when forced
    /// or when no modem is attached. The requested speed is applied if
    /// non-zero, otherwise the current speed is kept — unless the line turns
    /// out to be disabled, which is an error the operator has to fix.
    ///
    /// The first successful read of the attributes becomes the restore
    /// point; later calls reconfigure without disturbing it.
    pub fn configure(&mut self, fd: RawFd, options: &TtyOptions) -> Result<(), TermError> {
        let mut tios = unsafe {
            let mut tios = mem::MaybeUninit::<libc::termios>::uninit();
            let res = libc::tcgetattr(fd, tios.as_mut_ptr());
            FdResult(res)
                .errno()
                .map_err(|errno| TermError::Os { op: "tcgetattr", errno })?;
            tios.assume_init()
        };

        if self.saved.is_none() {
            self.saved = Some(tios);
        }

        tios.c_cflag &= !(libc::CSIZE | libc::CSTOPB | libc::PARENB | libc::CLOCAL);
        match options.flow {
            FlowControl::Unchanged => {}
            FlowControl::Hardware => tios.c_cflag |= libc::CRTSCTS,
            FlowControl::Software | FlowControl::Disabled => tios.c_cflag &= !libc::CRTSCTS,
        }

        tios.c_cflag |= libc::CS8 | libc::CREAD | libc::HUPCL;
        if options.force_local || !options.modem {
            tios.c_cflag |= libc::CLOCAL;
        }
        tios.c_iflag = libc::IGNBRK | libc::IGNPAR;
        tios.c_oflag = 0;
        tios.c_lflag = 0;
        tios.c_cc[libc::VMIN] = 1;
        tios.c_cc[libc::VTIME] = 0;

        if let FlowControl::Software = options.flow {
            tios.c_iflag |= libc::IXOFF;
            tios.c_cc[libc::VSTOP] = 0x13; // DC3 = XOFF = ^S
            tios.c_cc[libc::VSTART] = 0x11; // DC1 = XON  = ^Q
        }

        let code = match speed::line_code(options.speed) {
            Some(code) => {
                unsafe {
                    libc::cfsetospeed(&mut tios, code);
                    libc::cfsetispeed(&mut tios, code);
                }
                code
            }
            None => {
                // No usable request; stay at whatever the line runs now. A
                // disabled line has no rate to stay at.
                let code = unsafe { libc::cfgetospeed(&tios) };
                if code == libc::B0 {
                    return Err(TermError::LineDisabled);
                }
                code
            }
        };

        let res = unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &tios) };
        FdResult(res)
            .errno()
            .map_err(|errno| TermError::Os { op: "tcsetattr", errno })?;

        self.baud_rate = speed::bits_per_second(code);
        Ok(())
    }

    /// The rate the line ended up at, in bits per second.
    ///
    /// 0 until the first successful [`configure`][Self::configure].
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Re-apply the saved attributes.
    ///
    /// Only does anything if a prior configure succeeded, and only once; a
    /// second call is a no-op. Failure is a warning — and not even that when
    /// the device is already gone.
    pub fn restore(&mut self, fd: RawFd) {
        let saved = match self.saved.take() {
            Some(saved) => saved,
            None => return,
        };

        let res = unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &saved) };
        if let Err(errno) = FdResult(res).errno() {
            if !errno.device_gone() {
                warn!("tcsetattr: {}", errno);
            }
        }
    }

    /// Drop the snapshot without applying it.
    ///
    /// For the hang-up path: once the modem dropped the line there is no
    /// device left whose settings could be fixed up.
    pub fn forget(&mut self) {
        self.saved = None;
    }
}

impl Default for Terminal {
    fn default() -> Self {
        Terminal::new()
    }
}

/// Control the DTR line of the serial port.
///
/// Dropping DTR is how the daemon asks the modem to hang up. This runs on
/// cleanup paths and therefore never reports failure.
pub fn set_dtr(fd: RawFd, on: bool) {
    let bits: libc::c_int = libc::TIOCM_DTR;
    let request = if on { libc::TIOCMBIS } else { libc::TIOCMBIC };

    unsafe {
        libc::ioctl(fd, request, &bits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_before_configure_is_inert() {
        let mut term = Terminal::new();
        // No snapshot exists, so not even an invalid descriptor is touched.
        term.restore(-1);
        assert_eq!(term.baud_rate(), 0);
    }

    #[test]
    fn restore_applies_once() {
        let mut term = Terminal::new();
        term.saved = Some(unsafe { mem::zeroed() });

        term.restore(-1);
        assert!(term.saved.is_none());

        // Second call has nothing left to apply.
        term.restore(-1);
        assert!(term.saved.is_none());
    }

    #[test]
    fn forget_discards_the_snapshot() {
        let mut term = Terminal::new();
        term.saved = Some(unsafe { mem::zeroed() });
        term.forget();
        assert!(term.saved.is_none());
    }
}
