//! The line-discipline backend.
//!
//! Kernels of this family keep one discipline value per tty; installing the
//! ppp discipline reroutes the byte stream into the ppp driver and creates
//! the network interface in the same motion. There is no module chain to
//! rebuild afterwards — teardown is putting the old discipline number back.
use core::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::warn;

use super::ether;
use super::inet::{self, FlagsPort, Ifconfig};
use super::{ior, iow, Errno, FdResult, IoctlResult, LibcResult};
use crate::link::{
    ConfigError, Direction, ExtendedAccm, LinkAdapter, LinkError, LinkHandle, RecvConfig,
    SendConfig, Unit, VjConfig,
};

/// The ppp line discipline number.
const PPP_DISCIPLINE: libc::c_int = 3;

/// Driver flag word bits.
const SC_COMP_PROT: u32 = 0x0000_0001;
const SC_COMP_AC: u32 = 0x0000_0002;
const SC_COMP_TCP: u32 = 0x0000_0004;
const SC_NO_TCP_CCID: u32 = 0x0000_0008;
const SC_REJ_COMP_AC: u32 = 0x0000_0010;
const SC_CCP_OPEN: u32 = 0x0000_0040;
const SC_CCP_UP: u32 = 0x0000_0080;
const SC_ENABLE_IP: u32 = 0x0000_0100;
const SC_DEBUG: u32 = 0x0001_0000;
const SC_DC_FERROR: u32 = 0x0080_0000;

/// Receive quality bits; a bit still set at teardown means that pattern was
/// never seen on the wire.
const SC_RCV_B7_0: u32 = 0x0100_0000;
const SC_RCV_B7_1: u32 = 0x0200_0000;
const SC_RCV_EVNP: u32 = 0x0400_0000;
const SC_RCV_ODDP: u32 = 0x0800_0000;
const SC_RCV_MASK: u32 = SC_RCV_B7_0 | SC_RCV_B7_1 | SC_RCV_EVNP | SC_RCV_ODDP;

#[repr(C)]
struct OptionRequest {
    ptr: *const u8,
    length: libc::c_uint,
    transmit: libc::c_int,
}

/// Read-modify-write arithmetic for the driver flag word.
fn apply_bits(word: u32, set: u32, clear: u32) -> u32 {
    (word | set) & !clear
}

/// Decode the receive quality bits into a complaint, if they warrant one.
fn eight_bit_diagnostic(flags: u32) -> Option<&'static str> {
    match !flags & SC_RCV_MASK {
        SC_RCV_B7_0 => Some("bit 7 set to 1"),
        SC_RCV_B7_1 => Some("bit 7 set to 0"),
        SC_RCV_EVNP => Some("odd parity"),
        SC_RCV_ODDP => Some("even parity"),
        _ => None,
    }
}

/// The ppp driver's tty-side ioctls.
struct PppTty(RawFd);

impl PppTty {
    const PPPIOCSCOMPRESS: libc::Ioctl = iow(b't', 77, mem::size_of::<OptionRequest>());
    const PPPIOCSXASYNCMAP: libc::Ioctl = iow(b't', 79, mem::size_of::<ExtendedAccm>());
    const PPPIOCSMRU: libc::Ioctl = iow(b't', 82, mem::size_of::<libc::c_int>());
    const PPPIOCSMAXCID: libc::Ioctl = iow(b't', 83, mem::size_of::<libc::c_int>());
    const PPPIOCSRASYNCMAP: libc::Ioctl = iow(b't', 84, mem::size_of::<u32>());
    const PPPIOCGUNIT: libc::Ioctl = ior(b't', 86, mem::size_of::<libc::c_int>());
    const PPPIOCSASYNCMAP: libc::Ioctl = iow(b't', 87, mem::size_of::<u32>());
    const PPPIOCSFLAGS: libc::Ioctl = iow(b't', 89, mem::size_of::<libc::c_int>());
    const PPPIOCGFLAGS: libc::Ioctl = ior(b't', 90, mem::size_of::<libc::c_int>());

    fn int_read(&mut self, request: libc::Ioctl) -> Result<libc::c_int, Errno> {
        let mut value: libc::c_int = 0;
        let res = unsafe { libc::ioctl(self.0, request, &mut value as *mut _) };
        IoctlResult(res).errno()?;
        Ok(value)
    }

    fn int_write(&mut self, request: libc::Ioctl, value: libc::c_int) -> Result<(), Errno> {
        let mut value = value;
        let res = unsafe { libc::ioctl(self.0, request, &mut value as *mut _) };
        IoctlResult(res).errno()
    }

    fn discipline(&mut self) -> Result<libc::c_int, Errno> {
        let mut disc: libc::c_int = 0;
        let res = unsafe { libc::ioctl(self.0, libc::TIOCGETD, &mut disc as *mut _) };
        IoctlResult(res).errno()?;
        Ok(disc)
    }

    fn set_discipline(&mut self, disc: libc::c_int) -> Result<(), Errno> {
        let mut disc = disc;
        let res = unsafe { libc::ioctl(self.0, libc::TIOCSETD, &mut disc as *mut _) };
        IoctlResult(res).errno()
    }

    fn unit(&mut self) -> Result<u32, Errno> {
        self.int_read(Self::PPPIOCGUNIT).map(|unit| unit as u32)
    }

    fn flags(&mut self) -> Result<u32, Errno> {
        self.int_read(Self::PPPIOCGFLAGS).map(|flags| flags as u32)
    }

    fn set_flags(&mut self, flags: u32) -> Result<(), Errno> {
        self.int_write(Self::PPPIOCSFLAGS, flags as libc::c_int)
    }

    /// Read-modify-write the driver flag word.
    fn update_flags(&mut self, set: u32, clear: u32) -> Result<(), ConfigError> {
        let flags = self.flags().map_err(|errno| ConfigError {
            op: "ioctl(PPPIOCGFLAGS)",
            errno,
        })?;

        self.set_flags(apply_bits(flags, set, clear))
            .map_err(|errno| ConfigError {
                op: "ioctl(PPPIOCSFLAGS)",
                errno,
            })
    }

    fn set_transmit_accm(&mut self, accm: u32) -> Result<(), Errno> {
        let mut accm = accm;
        let res = unsafe { libc::ioctl(self.0, Self::PPPIOCSASYNCMAP, &mut accm as *mut _) };
        IoctlResult(res).errno()
    }

    fn set_receive_accm(&mut self, accm: u32) -> Result<(), Errno> {
        let mut accm = accm;
        let res = unsafe { libc::ioctl(self.0, Self::PPPIOCSRASYNCMAP, &mut accm as *mut _) };
        IoctlResult(res).errno()
    }

    fn set_extended_accm(&mut self, accm: &ExtendedAccm) -> Result<(), Errno> {
        let mut accm = *accm;
        let res = unsafe { libc::ioctl(self.0, Self::PPPIOCSXASYNCMAP, accm.as_mut_ptr()) };
        IoctlResult(res).errno()
    }

    fn compress_method(&mut self, options: &[u8], transmit: bool) -> Result<(), Errno> {
        let mut request = OptionRequest {
            ptr: options.as_ptr(),
            length: options.len() as libc::c_uint,
            transmit: transmit as libc::c_int,
        };

        let res = unsafe { libc::ioctl(self.0, Self::PPPIOCSCOMPRESS, &mut request as *mut _) };
        IoctlResult(res).errno()
    }
}

/// Link adapter for line-discipline kernels.
pub struct DisciplineLink {
    handle: LinkHandle,
    debug_flags: u32,
    unit: Option<Unit>,
    saved_discipline: Option<libc::c_int>,
    hung_up: bool,
}

impl DisciplineLink {
    /// An adapter for the given descriptors; nothing is touched yet.
    pub fn new(handle: LinkHandle) -> Self {
        DisciplineLink {
            handle,
            debug_flags: 0,
            unit: None,
            saved_discipline: None,
            hung_up: false,
        }
    }

    /// Debug bits to fold into the driver flag word during establish, 0 for
    /// none.
    pub fn set_driver_debug(&mut self, flags: u32) {
        self.debug_flags = flags;
    }

    /// Best-effort check whether this kernel has a ppp driver at all.
    ///
    /// Asks after the first ppp interface; when the answer cannot be
    /// determined (maybe we're not root) the benefit of the doubt goes to
    /// "supported" and establish produces the precise error.
    pub fn kernel_supported() -> bool {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if FdResult(fd).errno().is_err() {
            return true;
        }

        let ok = Ifconfig::new(fd, "ppp0").flags().is_ok();
        unsafe {
            libc::close(fd);
        }
        ok
    }

    fn require_unit(&self) -> Result<Unit, ConfigError> {
        self.unit.ok_or(ConfigError {
            op: "interface not established",
            errno: Errno(libc::ENODEV),
        })
    }

    fn ifconfig(&self) -> Result<Ifconfig, ConfigError> {
        let unit = self.require_unit()?;
        Ok(Ifconfig::new(self.handle.control, &unit.interface_name()))
    }

    fn tty(&self) -> PppTty {
        PppTty(self.handle.tty)
    }
}

impl LinkAdapter for DisciplineLink {
    fn establish(&mut self) -> Result<Unit, LinkError> {
        let mut tty = self.tty();

        let prior = tty.discipline().map_err(|errno| LinkError {
            op: "ioctl(TIOCGETD)",
            errno,
        })?;

        tty.set_discipline(PPP_DISCIPLINE)
            .map_err(|errno| LinkError {
                op: "ioctl(TIOCSETD)",
                errno,
            })?;
        self.saved_discipline = Some(prior);

        // Find out which interface we were given.
        let unit = tty.unit().map_err(|errno| LinkError {
            op: "ioctl(PPPIOCGUNIT)",
            errno,
        })?;

        // Enable debug in the driver if requested.
        if self.debug_flags != 0 {
            match tty.flags() {
                Ok(flags) => {
                    let flags = flags | (self.debug_flags & 0xff) * SC_DEBUG;
                    if let Err(errno) = tty.set_flags(flags) {
                        warn!("ioctl(PPPIOCSFLAGS): {}", errno);
                    }
                }
                Err(errno) => warn!("ioctl(PPPIOCGFLAGS): {}", errno),
            }
        }

        self.unit = Some(Unit(unit));
        Ok(Unit(unit))
    }

    fn disestablish(&mut self) {
        let prior = match self.saved_discipline.take() {
            Some(prior) => prior,
            None => return,
        };
        self.unit = None;

        if self.hung_up {
            // The tty is an ex-device; its discipline died with it.
            return;
        }

        let mut tty = self.tty();

        if let Ok(flags) = tty.flags() {
            if let Some(complaint) = eight_bit_diagnostic(flags) {
                warn!("serial link is not 8-bit clean:");
                warn!("all received characters had {}", complaint);
            }
        }

        if let Err(errno) = tty.set_discipline(prior) {
            if !errno.device_gone() {
                warn!("ioctl(TIOCSETD): {}", errno);
            }
        }
    }

    fn unit(&self) -> Option<Unit> {
        self.unit
    }

    fn set_hung_up(&mut self, hung_up: bool) {
        self.hung_up = hung_up;
    }

    fn send_config(&mut self, config: &SendConfig) -> Result<(), ConfigError> {
        self.ifconfig()?
            .set_mtu(config.mtu)
            .map_err(|errno| ConfigError {
                op: "ioctl(SIOCSIFMTU)",
                errno,
            })?;

        let mut tty = self.tty();
        tty.set_transmit_accm(config.accm)
            .map_err(|errno| ConfigError {
                op: "ioctl(PPPIOCSASYNCMAP)",
                errno,
            })?;

        let (set, clear) = if config.protocol_compression {
            (SC_COMP_PROT, 0)
        } else {
            (0, SC_COMP_PROT)
        };
        let (set, clear) = if config.address_compression {
            (set | SC_COMP_AC, clear)
        } else {
            (set, clear | SC_COMP_AC)
        };
        tty.update_flags(set, clear)
    }

    fn recv_config(&mut self, config: &RecvConfig) {
        let mut tty = self.tty();

        if let Err(errno) = tty.int_write(PppTty::PPPIOCSMRU, config.mru as libc::c_int) {
            warn!("ioctl(PPPIOCSMRU): {}", errno);
        }
        if let Err(errno) = tty.set_receive_accm(config.accm) {
            warn!("ioctl(PPPIOCSRASYNCMAP): {}", errno);
        }

        // Receive-side header compression is always decoded when present;
        // the flag word only tracks whether elided address fields are
        // acceptable.
        let result = if config.address_compression {
            tty.update_flags(0, SC_REJ_COMP_AC)
        } else {
            tty.update_flags(SC_REJ_COMP_AC, 0)
        };
        if let Err(err) = result {
            warn!("{}", err);
        }
    }

    fn set_extended_accm(&mut self, accm: &ExtendedAccm) {
        if let Err(errno) = self.tty().set_extended_accm(accm) {
            if !errno.not_supported() {
                warn!("ioctl(set extended ACCM): {}", errno);
            }
        }
    }

    fn set_vj_compression(&mut self, config: &VjConfig) -> bool {
        let mut tty = self.tty();

        let (set, clear) = if config.enabled {
            (SC_COMP_TCP, 0)
        } else {
            (0, SC_COMP_TCP)
        };
        let (set, clear) = if config.cid_compression {
            (set, clear | SC_NO_TCP_CCID)
        } else {
            (set | SC_NO_TCP_CCID, clear)
        };

        if let Err(err) = tty.update_flags(set, clear) {
            warn!("{}", err);
            return false;
        }

        if let Err(errno) =
            tty.int_write(PppTty::PPPIOCSMAXCID, config.max_slot_id as libc::c_int)
        {
            warn!("ioctl(PPPIOCSMAXCID): {}", errno);
            return false;
        }

        true
    }

    fn test_compression(&mut self, options: &[u8], direction: Direction) -> bool {
        self.tty()
            .compress_method(options, direction == Direction::Transmit)
            .is_ok()
    }

    fn set_ccp_state(&mut self, open: bool, up: bool) {
        let mut set = 0;
        let mut clear = 0;
        if open {
            set |= SC_CCP_OPEN;
        } else {
            clear |= SC_CCP_OPEN;
        }
        if up {
            set |= SC_CCP_UP;
        } else {
            clear |= SC_CCP_UP;
        }

        if let Err(err) = self.tty().update_flags(set, clear) {
            warn!("{}", err);
        }
    }

    fn fatal_decompression_error(&mut self) -> bool {
        match self.tty().flags() {
            Ok(flags) => flags & SC_DC_FERROR != 0,
            Err(errno) => {
                warn!("ioctl(PPPIOCGFLAGS): {}", errno);
                false
            }
        }
    }

    fn interface_up(&mut self) -> Result<(), ConfigError> {
        let mut ifconfig = self.ifconfig()?;
        inet::change_flags(&mut ifconfig, libc::IFF_UP as libc::c_short, 0)?;
        self.tty().update_flags(SC_ENABLE_IP, 0)
    }

    fn interface_down(&mut self) -> Result<(), ConfigError> {
        // Stop routing packets into a dying interface first; failure here
        // degrades but must not keep the interface up.
        if let Err(err) = self.tty().update_flags(0, SC_ENABLE_IP) {
            warn!("{}", err);
        }

        let mut ifconfig = self.ifconfig()?;
        inet::change_flags(&mut ifconfig, 0, libc::IFF_UP as libc::c_short)
    }

    fn set_addresses(&mut self, local: Ipv4Addr, peer: Ipv4Addr, mask: Option<Ipv4Addr>) -> bool {
        let mut ifconfig = match self.ifconfig() {
            Ok(ifconfig) => ifconfig,
            Err(err) => {
                warn!("{}", err);
                return false;
            }
        };
        inet::apply_addresses(&mut ifconfig, local, peer, mask)
    }

    fn clear_addresses(&mut self, local: Ipv4Addr, peer: Ipv4Addr) -> bool {
        match inet::delete_host_route(self.handle.control, peer, local) {
            Ok(()) => true,
            Err(errno) => {
                warn!("ioctl(SIOCDELRT): {}", errno);
                false
            }
        }
    }

    fn set_default_route(&mut self, gateway: Ipv4Addr) -> bool {
        match inet::add_default_route(self.handle.control, gateway) {
            Ok(()) => true,
            Err(errno) => {
                warn!("default route ioctl(SIOCADDRT): {}", errno);
                false
            }
        }
    }

    fn clear_default_route(&mut self, gateway: Ipv4Addr) -> bool {
        match inet::delete_default_route(self.handle.control, gateway) {
            Ok(()) => true,
            Err(errno) => {
                warn!("default route ioctl(SIOCDELRT): {}", errno);
                false
            }
        }
    }

    fn add_proxy_arp(&mut self, peer: Ipv4Addr) -> bool {
        let hardware = match ether::address_for_peer(self.handle.control, peer) {
            Some(hardware) => hardware,
            None => {
                warn!("cannot determine ethernet address for proxy ARP");
                return false;
            }
        };

        match inet::add_arp_entry(self.handle.control, peer, &hardware) {
            Ok(()) => true,
            Err(errno) => {
                warn!("ioctl(SIOCSARP): {}", errno);
                false
            }
        }
    }

    fn remove_proxy_arp(&mut self, peer: Ipv4Addr) -> bool {
        match inet::delete_arp_entry(self.handle.control, peer) {
            Ok(()) => true,
            Err(errno) => {
                warn!("ioctl(SIOCDARP): {}", errno);
                false
            }
        }
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<(), LinkError> {
        match super::send(self.handle.tty, packet) {
            Ok(_) => Ok(()),
            Err(errno) if errno.device_gone() => Ok(()),
            Err(errno) => Err(LinkError { op: "write", errno }),
        }
    }

    fn recv_packet(&mut self, buffer: &mut [u8]) -> Result<Option<usize>, LinkError> {
        super::recv(self.handle.tty, buffer).map_err(|errno| LinkError { op: "read", errno })
    }

    fn wait_input(&mut self, timeout: Option<Duration>) -> Result<(), LinkError> {
        super::wait_input(self.handle.tty, timeout).map_err(|errno| LinkError { op: "poll", errno })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_handle() -> LinkHandle {
        LinkHandle {
            tty: -1,
            control: -1,
            controlling_terminal: false,
        }
    }

    #[test]
    fn apply_bits_sets_and_clears() {
        assert_eq!(apply_bits(0, SC_COMP_PROT, 0), SC_COMP_PROT);
        assert_eq!(apply_bits(SC_COMP_PROT | SC_COMP_AC, 0, SC_COMP_AC), SC_COMP_PROT);
        assert_eq!(
            apply_bits(SC_CCP_OPEN, SC_CCP_UP, SC_CCP_OPEN),
            SC_CCP_UP
        );
    }

    #[test]
    fn diagnostic_decodes_stuck_bits() {
        assert_eq!(eight_bit_diagnostic(SC_RCV_MASK), None);
        assert_eq!(
            eight_bit_diagnostic(SC_RCV_MASK & !SC_RCV_B7_1),
            Some("bit 7 set to 0")
        );
        assert_eq!(
            eight_bit_diagnostic(SC_RCV_MASK & !SC_RCV_EVNP),
            Some("odd parity")
        );
        assert_eq!(eight_bit_diagnostic(0), None);
    }

    #[test]
    fn disestablish_without_establish_is_inert() {
        let mut link = DisciplineLink::new(closed_handle());
        link.disestablish();
        assert_eq!(link.unit(), None);
    }

    #[test]
    fn disestablish_applies_once() {
        let mut link = DisciplineLink::new(closed_handle());
        link.saved_discipline = Some(0);
        link.unit = Some(Unit(0));

        // The descriptor is invalid so the restore attempt only warns; what
        // matters is that the second call no longer has anything to restore.
        link.disestablish();
        assert!(link.saved_discipline.is_none());
        assert_eq!(link.unit(), None);

        link.disestablish();
        assert!(link.saved_discipline.is_none());
    }

    #[test]
    fn hang_up_skips_restoration() {
        let mut link = DisciplineLink::new(closed_handle());
        link.saved_discipline = Some(2);
        link.unit = Some(Unit(0));
        link.set_hung_up(true);

        link.disestablish();
        assert!(link.saved_discipline.is_none());
        assert_eq!(link.unit(), None);
    }
}
