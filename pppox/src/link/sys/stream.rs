//! The stream-stack backend.
//!
//! On kernels of this family a character device is a stack of processing
//! modules. Establishing the link means popping every module the tty had —
//! remembering them — and pushing the ppp framing, compression and
//! interface modules in their place; disestablishing means the exact
//! reverse. The stack juggling is written against the [`StreamPort`] trait
//! so the ordering contract can be tested without a stream device.
use core::mem;
use std::ffi::CString;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::{debug, warn};

use super::ether;
use super::inet::{self, Ifconfig};
use super::{ior, iow, Errno, FdResult, IoctlResult, LibcResult};
use crate::link::{
    ConfigError, Direction, ExtendedAccm, LinkAdapter, LinkError, LinkHandle, RecvConfig,
    SendConfig, Unit, VjConfig,
};

/// The framing module: escapes, checksums, packetization.
static FRAMING_MODULE: &str = "pppasync";
/// The packet compression module; optional, the link works uncompressed.
static COMPRESS_MODULE: &str = "pppcomp";
/// The module that ties the stream to a network interface.
static INTERFACE_MODULE: &str = "pppif";

/// Longest module name the kernel will report.
const FMNAMESZ: usize = 8;

/// Quality bits the framing module keeps about received characters. A bit
/// still set at teardown means that pattern was never seen.
const PAI_FLAGS_B7_0: u32 = 0x100;
const PAI_FLAGS_B7_1: u32 = 0x200;
const PAI_FLAGS_PAR_EVEN: u32 = 0x400;
const PAI_FLAGS_PAR_ODD: u32 = 0x800;
const PAI_FLAGS_HIBITS: u32 = 0xf00;

/// Compression state bits reported by the interface module.
const CCP_FATAL_ERROR: libc::c_int = 0x8;

const MAX_OPTION: usize = 64;

#[repr(C)]
struct OptionData {
    opt_data: [u8; MAX_OPTION],
    length: libc::c_int,
    transmit: libc::c_int,
}

/// The names popped off the device during establish, in pop order.
///
/// Replayed back in exact reverse order during disestablish. Unbounded: the
/// kernel decides how deep a stream gets, not us.
#[derive(Debug, Default)]
pub(crate) struct ModuleStack {
    names: Vec<String>,
}

impl ModuleStack {
    pub(crate) fn new() -> Self {
        ModuleStack { names: Vec::new() }
    }

    pub(crate) fn record(&mut self, name: String) {
        self.names.push(name);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.names.clear();
    }

    /// Empty the stack, yielding the names in replay (reverse) order.
    pub(crate) fn drain_reverse(&mut self) -> impl Iterator<Item = String> + '_ {
        self.names.drain(..).rev()
    }
}

/// The stream operations the establish/disestablish choreography needs.
pub(crate) trait StreamPort {
    /// Name of the topmost module, or `None` for a bare stream.
    fn look_top(&mut self) -> Result<Option<String>, Errno>;
    /// Remove the topmost module.
    fn pop(&mut self) -> Result<(), Errno>;
    /// Push the named module on top.
    fn push(&mut self, name: &str) -> Result<(), Errno>;
    /// Switch reads to message-non-discard mode.
    fn set_message_read_mode(&mut self) -> Result<(), Errno>;
    /// The interface unit the interface module picked for us.
    fn unit(&mut self) -> Result<u32, Errno>;
    /// Read the driver's debug/quality flag word.
    fn driver_flags(&mut self) -> Result<u32, Errno>;
    /// Write the driver's debug flag word.
    fn set_driver_flags(&mut self, flags: u32) -> Result<(), Errno>;
}

/// Rebuild the stream for ppp and find out which interface it became.
///
/// Progress is recorded in `saved` and `pushed` as it happens, so an abort
/// partway through leaves exactly the breadcrumbs [`lower`] needs to put
/// the device back together.
fn raise(
    port: &mut impl StreamPort,
    saved: &mut ModuleStack,
    pushed: &mut bool,
    debug_flags: u32,
) -> Result<Unit, LinkError> {
    // Save the name of every module on the stream, then pop them all.
    loop {
        let name = match port.look_top() {
            Ok(Some(name)) => name,
            _ => break,
        };
        if port.pop().is_err() {
            break;
        }
        debug!("popped stream module: {}", name);
        saved.record(name);
    }

    port.push(FRAMING_MODULE).map_err(|errno| LinkError {
        op: "ioctl(I_PUSH, pppasync)",
        errno,
    })?;
    *pushed = true;

    if let Err(errno) = port.push(COMPRESS_MODULE) {
        warn!("ioctl(I_PUSH, pppcomp): {}", errno);
    }

    port.push(INTERFACE_MODULE).map_err(|errno| LinkError {
        op: "ioctl(I_PUSH, pppif)",
        errno,
    })?;

    port.set_message_read_mode().map_err(|errno| LinkError {
        op: "ioctl(I_SRDOPT, RMSGN)",
        errno,
    })?;

    let unit = port.unit().map_err(|errno| LinkError {
        op: "ioctl(SIOCGETU)",
        errno,
    })?;

    if debug_flags != 0 {
        if let Err(errno) = port.set_driver_flags(debug_flags) {
            warn!("ioctl(SIOCSIFDEBUG): {}", errno);
        }
    }

    Ok(Unit(unit))
}

/// Take the ppp modules off the stream and replay the saved stack.
///
/// Runs from cleanup paths, so nothing in here fails outward. A call with
/// nothing of ours on the stream is a no-op.
fn lower(port: &mut impl StreamPort, saved: &mut ModuleStack, pushed: &mut bool) {
    if !*pushed && saved.is_empty() {
        return;
    }

    if *pushed {
        // One last look at the receive quality counters before the framing
        // module disappears.
        if let Ok(flags) = port.driver_flags() {
            if let Some(complaint) = eight_bit_diagnostic(flags) {
                warn!("serial link is not 8-bit clean:");
                warn!("all received characters had {}", complaint);
            }
        }
    }

    while port.pop().is_ok() {}
    *pushed = false;

    for name in saved.drain_reverse() {
        match port.push(&name) {
            Ok(()) => debug!("restored stream module: {}", name),
            Err(errno) if errno.device_gone() => {}
            Err(errno) => warn!("couldn't restore stream module {}: {}", name, errno),
        }
    }
}

/// Decode the receive quality bits into a complaint, if they warrant one.
fn eight_bit_diagnostic(flags: u32) -> Option<&'static str> {
    match !flags & PAI_FLAGS_HIBITS {
        PAI_FLAGS_B7_0 => Some("bit 7 set to 1"),
        PAI_FLAGS_B7_1 => Some("bit 7 set to 0"),
        PAI_FLAGS_PAR_EVEN => Some("odd parity"),
        PAI_FLAGS_PAR_ODD => Some("even parity"),
        _ => None,
    }
}

/// Pack the header compression parameters into the driver's request byte.
fn vj_request_byte(config: &VjConfig) -> u8 {
    let enabled = if config.enabled { 1 } else { 0 };
    let no_cid = if config.cid_compression { 0 } else { 2 };
    enabled + no_cid + ((config.max_slot_id & 0x0f) << 4)
}

/// The raw stream device operations, all ioctls on the serial descriptor.
pub(crate) struct StreamDevice(pub(crate) RawFd);

impl StreamDevice {
    const STR: libc::Ioctl = (b'S' as libc::Ioctl) << 8;
    const I_PUSH: libc::Ioctl = Self::STR | 2;
    const I_POP: libc::Ioctl = Self::STR | 3;
    const I_LOOK: libc::Ioctl = Self::STR | 4;
    const I_SRDOPT: libc::Ioctl = Self::STR | 6;
    const I_FIND: libc::Ioctl = Self::STR | 11;

    /// Message non-discard read mode.
    const RMSGN: libc::c_int = 2;

    const SIOCSIFCOMPAC: libc::Ioctl = iow(b'p', 130, 1);
    const SIOCSIFCOMPPROT: libc::Ioctl = iow(b'p', 131, 1);
    const SIOCSIFMRU: libc::Ioctl = iow(b'p', 132, mem::size_of::<libc::c_int>());
    const SIOCSIFASYNCMAP: libc::Ioctl = iow(b'p', 135, mem::size_of::<u32>());
    const SIOCGETU: libc::Ioctl = ior(b'p', 136, mem::size_of::<libc::c_int>());
    const SIOCSIFVJCOMP: libc::Ioctl = iow(b'p', 137, 1);
    const SIOCSIFDEBUG: libc::Ioctl = iow(b'p', 138, mem::size_of::<libc::c_int>());
    const SIOCGIFDEBUG: libc::Ioctl = ior(b'p', 139, mem::size_of::<libc::c_int>());
    const SIOCSIFRASYNCMAP: libc::Ioctl = iow(b'p', 141, mem::size_of::<u32>());
    const SIOCSIFXASYNCMAP: libc::Ioctl = iow(b'p', 142, mem::size_of::<ExtendedAccm>());
    const SIOCSCOMPRESS: libc::Ioctl = iow(b'p', 143, mem::size_of::<OptionData>());
    const SIOCSIFCOMP: libc::Ioctl = iow(b'p', 144, mem::size_of::<libc::c_int>());
    const SIOCGIFCOMP: libc::Ioctl = ior(b'p', 145, mem::size_of::<libc::c_int>());

    fn int_ioctl(&mut self, request: libc::Ioctl, value: libc::c_int) -> Result<(), Errno> {
        let mut value = value;
        let res = unsafe { libc::ioctl(self.0, request, &mut value as *mut _) };
        IoctlResult(res).errno()
    }

    fn byte_ioctl(&mut self, request: libc::Ioctl, value: u8) -> Result<(), Errno> {
        let mut value = value as libc::c_char;
        let res = unsafe { libc::ioctl(self.0, request, &mut value as *mut _) };
        IoctlResult(res).errno()
    }

    fn set_transmit_accm(&mut self, accm: u32) -> Result<(), Errno> {
        let mut accm = accm;
        let res = unsafe { libc::ioctl(self.0, Self::SIOCSIFASYNCMAP, &mut accm as *mut _) };
        IoctlResult(res).errno()
    }

    fn set_receive_accm(&mut self, accm: u32) -> Result<(), Errno> {
        let mut accm = accm;
        let res = unsafe { libc::ioctl(self.0, Self::SIOCSIFRASYNCMAP, &mut accm as *mut _) };
        IoctlResult(res).errno()
    }

    fn set_extended_accm(&mut self, accm: &ExtendedAccm) -> Result<(), Errno> {
        let mut accm = *accm;
        let res = unsafe { libc::ioctl(self.0, Self::SIOCSIFXASYNCMAP, accm.as_mut_ptr()) };
        IoctlResult(res).errno()
    }

    fn compress_method(&mut self, options: &[u8], transmit: bool) -> Result<(), Errno> {
        let mut data = OptionData {
            opt_data: [0; MAX_OPTION],
            length: options.len().min(MAX_OPTION) as libc::c_int,
            transmit: transmit as libc::c_int,
        };
        data.opt_data[..options.len().min(MAX_OPTION)]
            .copy_from_slice(&options[..options.len().min(MAX_OPTION)]);

        let res = unsafe { libc::ioctl(self.0, Self::SIOCSCOMPRESS, &mut data as *mut _) };
        IoctlResult(res).errno()
    }

    fn ccp_flags(&mut self) -> Result<libc::c_int, Errno> {
        let mut flags: libc::c_int = 0;
        let res = unsafe { libc::ioctl(self.0, Self::SIOCGIFCOMP, &mut flags as *mut _) };
        IoctlResult(res).errno()?;
        Ok(flags)
    }
}

impl StreamPort for StreamDevice {
    fn look_top(&mut self) -> Result<Option<String>, Errno> {
        let mut name = [0 as libc::c_char; FMNAMESZ + 1];
        let res = unsafe { libc::ioctl(self.0, Self::I_LOOK, name.as_mut_ptr()) };
        match IoctlResult(res).errno() {
            Ok(()) => Ok(Some(
                name.iter()
                    .take_while(|&&c| c != 0)
                    .map(|&c| c as u8 as char)
                    .collect(),
            )),
            // A bare stream answers with EINVAL; that is the loop exit, not
            // a failure.
            Err(errno) if errno.not_supported() => Ok(None),
            Err(errno) => Err(errno),
        }
    }

    fn pop(&mut self) -> Result<(), Errno> {
        let res = unsafe { libc::ioctl(self.0, Self::I_POP, 0) };
        IoctlResult(res).errno()
    }

    fn push(&mut self, name: &str) -> Result<(), Errno> {
        let name = CString::new(name).map_err(|_| Errno(libc::EINVAL))?;
        let res = unsafe { libc::ioctl(self.0, Self::I_PUSH, name.as_ptr()) };
        IoctlResult(res).errno()
    }

    fn set_message_read_mode(&mut self) -> Result<(), Errno> {
        let res = unsafe { libc::ioctl(self.0, Self::I_SRDOPT, Self::RMSGN) };
        IoctlResult(res).errno()
    }

    fn unit(&mut self) -> Result<u32, Errno> {
        let mut unit: libc::c_int = 0;
        let res = unsafe { libc::ioctl(self.0, Self::SIOCGETU, &mut unit as *mut _) };
        IoctlResult(res).errno()?;
        Ok(unit as u32)
    }

    fn driver_flags(&mut self) -> Result<u32, Errno> {
        let mut flags: libc::c_int = 0;
        let res = unsafe { libc::ioctl(self.0, Self::SIOCGIFDEBUG, &mut flags as *mut _) };
        IoctlResult(res).errno()?;
        Ok(flags as u32)
    }

    fn set_driver_flags(&mut self, flags: u32) -> Result<(), Errno> {
        self.int_ioctl(Self::SIOCSIFDEBUG, flags as libc::c_int)
    }
}

/// Link adapter for stream-stack kernels.
///
/// Tracks everything establish changed — the popped module names, whether
/// our modules are on the stream, whether stdio was silenced — as explicit
/// state, scoped to the establish/disestablish pair.
pub struct StreamLink {
    handle: LinkHandle,
    debug_flags: u32,
    unit: Option<Unit>,
    saved: ModuleStack,
    pushed: bool,
    stdio_closed: bool,
    hung_up: bool,
}

impl StreamLink {
    /// An adapter for the given descriptors; nothing is touched yet.
    pub fn new(handle: LinkHandle) -> Self {
        StreamLink {
            handle,
            debug_flags: 0,
            unit: None,
            saved: ModuleStack::new(),
            pushed: false,
            stdio_closed: false,
            hung_up: false,
        }
    }

    /// Debug bits to hand the driver during establish, 0 for none.
    pub fn set_driver_debug(&mut self, flags: u32) {
        self.debug_flags = flags;
    }

    /// Best-effort check whether this kernel has the ppp modules at all.
    ///
    /// When the answer cannot be determined the benefit of the doubt goes to
    /// "supported"; establish will produce the precise error.
    pub fn kernel_supported() -> bool {
        let fd = unsafe { libc::open(b"/dev/tty\0".as_ptr() as *const libc::c_char, libc::O_RDONLY) };
        if FdResult(fd).errno().is_err() {
            return true;
        }
        let res = unsafe { libc::ioctl(fd, StreamDevice::I_FIND, b"pppasync\0".as_ptr()) };
        unsafe {
            libc::close(fd);
        }
        res >= 0
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

    fn device(&self) -> StreamDevice {
        StreamDevice(self.handle.tty)
    }
}

impl LinkAdapter for StreamLink {
    fn establish(&mut self) -> Result<Unit, LinkError> {
        let mut device = self.device();
        let unit = raise(
            &mut device,
            &mut self.saved,
            &mut self.pushed,
            self.debug_flags,
        )?;

        // Close stdin, stdout, stderr if they might refer to the device.
        if self.handle.controlling_terminal && !self.stdio_closed {
            super::close_stdio(&[self.handle.tty, self.handle.control]);
            self.stdio_closed = true;
        }

        self.unit = Some(unit);
        Ok(unit)
    }

    fn disestablish(&mut self) {
        self.unit = None;

        if self.hung_up {
            // We can't push or pop modules after the stream has hung up.
            self.saved.clear();
            self.pushed = false;
            return;
        }

        let mut device = self.device();
        lower(&mut device, &mut self.saved, &mut self.pushed);
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

        let mut device = self.device();
        device
            .set_transmit_accm(config.accm)
            .map_err(|errno| ConfigError {
                op: "ioctl(SIOCSIFASYNCMAP)",
                errno,
            })?;

        device
            .byte_ioctl(
                StreamDevice::SIOCSIFCOMPPROT,
                config.protocol_compression as u8,
            )
            .map_err(|errno| ConfigError {
                op: "ioctl(SIOCSIFCOMPPROT)",
                errno,
            })?;

        device
            .byte_ioctl(
                StreamDevice::SIOCSIFCOMPAC,
                config.address_compression as u8,
            )
            .map_err(|errno| ConfigError {
                op: "ioctl(SIOCSIFCOMPAC)",
                errno,
            })
    }

    fn recv_config(&mut self, config: &RecvConfig) {
        let mut device = self.device();

        if let Err(errno) = device.int_ioctl(StreamDevice::SIOCSIFMRU, config.mru as libc::c_int) {
            warn!("ioctl(SIOCSIFMRU): {}", errno);
        }
        if let Err(errno) = device.set_receive_accm(config.accm) {
            warn!("ioctl(SIOCSIFRASYNCMAP): {}", errno);
        }
        // The receive-side settings share the compression requests with the
        // transmit side; bit 1 selects the direction.
        if let Err(errno) = device.byte_ioctl(
            StreamDevice::SIOCSIFCOMPPROT,
            2 + config.protocol_compression as u8,
        ) {
            warn!("ioctl(SIOCSIFCOMPPROT): {}", errno);
        }
        if let Err(errno) = device.byte_ioctl(
            StreamDevice::SIOCSIFCOMPAC,
            2 + config.address_compression as u8,
        ) {
            warn!("ioctl(SIOCSIFCOMPAC): {}", errno);
        }
    }

    fn set_extended_accm(&mut self, accm: &ExtendedAccm) {
        if let Err(errno) = self.device().set_extended_accm(accm) {
            if !errno.not_supported() {
                warn!("ioctl(set extended ACCM): {}", errno);
            }
        }
    }

    fn set_vj_compression(&mut self, config: &VjConfig) -> bool {
        match self
            .device()
            .byte_ioctl(StreamDevice::SIOCSIFVJCOMP, vj_request_byte(config))
        {
            Ok(()) => true,
            Err(errno) => {
                warn!("ioctl(SIOCSIFVJCOMP): {}", errno);
                false
            }
        }
    }

    fn test_compression(&mut self, options: &[u8], direction: Direction) -> bool {
        self.device()
            .compress_method(options, direction == Direction::Transmit)
            .is_ok()
    }

    fn set_ccp_state(&mut self, open: bool, up: bool) {
        let word = (open as libc::c_int) + 2 * (up as libc::c_int);
        if let Err(errno) = self.device().int_ioctl(StreamDevice::SIOCSIFCOMP, word) {
            if !errno.not_supported() {
                warn!("ioctl(SIOCSIFCOMP): {}", errno);
            }
        }
    }

    fn fatal_decompression_error(&mut self) -> bool {
        match self.device().ccp_flags() {
            Ok(flags) => flags & CCP_FATAL_ERROR != 0,
            Err(errno) => {
                warn!("ioctl(SIOCGIFCOMP): {}", errno);
                false
            }
        }
    }

    fn interface_up(&mut self) -> Result<(), ConfigError> {
        let mut ifconfig = self.ifconfig()?;
        inet::change_flags(&mut ifconfig, libc::IFF_UP as libc::c_short, 0)
    }

    fn interface_down(&mut self) -> Result<(), ConfigError> {
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
            // The stream vanishing underneath a send is part of hanging up.
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
    use std::collections::HashSet;

    /// A stream device modelled as a plain stack of module names.
    #[derive(Default)]
    struct FakeStream {
        /// Modules on the stream, topmost last.
        chain: Vec<String>,
        /// Pretend the device vanished: every push answers ENXIO.
        gone: bool,
        /// Module names whose push fails with EPERM.
        refuse: HashSet<&'static str>,
        pushes: Vec<String>,
        pops: usize,
        read_mode: bool,
        flags: u32,
    }

    impl StreamPort for FakeStream {
        fn look_top(&mut self) -> Result<Option<String>, Errno> {
            Ok(self.chain.last().cloned())
        }

        fn pop(&mut self) -> Result<(), Errno> {
            self.pops += 1;
            if self.chain.pop().is_some() {
                Ok(())
            } else {
                Err(Errno(libc::EINVAL))
            }
        }

        fn push(&mut self, name: &str) -> Result<(), Errno> {
            self.pushes.push(name.to_owned());
            if self.gone {
                return Err(Errno(libc::ENXIO));
            }
            if self.refuse.contains(name) {
                return Err(Errno(libc::EPERM));
            }
            self.chain.push(name.to_owned());
            Ok(())
        }

        fn set_message_read_mode(&mut self) -> Result<(), Errno> {
            self.read_mode = true;
            Ok(())
        }

        fn unit(&mut self) -> Result<u32, Errno> {
            Ok(3)
        }

        fn driver_flags(&mut self) -> Result<u32, Errno> {
            Ok(self.flags)
        }

        fn set_driver_flags(&mut self, flags: u32) -> Result<(), Errno> {
            self.flags = flags;
            Ok(())
        }
    }

    fn chain(names: &[&str]) -> Vec<String> {
        names.iter().map(|&n| n.to_owned()).collect()
    }

    #[test]
    fn raise_then_lower_restores_the_chain() {
        let mut port = FakeStream {
            chain: chain(&["ttcompat", "ldterm"]),
            flags: PAI_FLAGS_HIBITS,
            ..FakeStream::default()
        };
        let mut saved = ModuleStack::new();
        let mut pushed = false;

        let unit = raise(&mut port, &mut saved, &mut pushed, 0).unwrap();
        assert_eq!(unit, Unit(3));
        assert!(port.read_mode);
        assert_eq!(port.chain, chain(&["pppasync", "pppcomp", "pppif"]));

        lower(&mut port, &mut saved, &mut pushed);
        assert_eq!(port.chain, chain(&["ttcompat", "ldterm"]));
        assert!(saved.is_empty());
        assert!(!pushed);
    }

    #[test]
    fn saved_modules_replay_in_reverse() {
        let mut port = FakeStream::default();
        let mut saved = ModuleStack::new();
        saved.record("a".into());
        saved.record("b".into());
        saved.record("c".into());
        let mut pushed = false;

        lower(&mut port, &mut saved, &mut pushed);
        assert_eq!(port.pushes, chain(&["c", "b", "a"]));
    }

    #[test]
    fn lower_twice_touches_nothing_the_second_time() {
        let mut port = FakeStream {
            chain: chain(&["ldterm"]),
            flags: PAI_FLAGS_HIBITS,
            ..FakeStream::default()
        };
        let mut saved = ModuleStack::new();
        let mut pushed = false;

        raise(&mut port, &mut saved, &mut pushed, 0).unwrap();
        lower(&mut port, &mut saved, &mut pushed);
        assert_eq!(port.chain, chain(&["ldterm"]));

        let pops_before = port.pops;
        let pushes_before = port.pushes.len();
        lower(&mut port, &mut saved, &mut pushed);
        assert_eq!(port.chain, chain(&["ldterm"]));
        assert_eq!(port.pops, pops_before);
        assert_eq!(port.pushes.len(), pushes_before);
    }

    #[test]
    fn vanished_device_is_not_an_error() {
        let mut port = FakeStream {
            gone: true,
            ..FakeStream::default()
        };
        let mut saved = ModuleStack::new();
        saved.record("ldterm".into());
        let mut pushed = false;

        lower(&mut port, &mut saved, &mut pushed);
        assert!(saved.is_empty());
    }

    #[test]
    fn failed_establish_leaves_enough_to_unwind() {
        let mut refuse = HashSet::new();
        refuse.insert("pppif");
        let mut port = FakeStream {
            chain: chain(&["ldterm"]),
            refuse,
            flags: PAI_FLAGS_HIBITS,
            ..FakeStream::default()
        };
        let mut saved = ModuleStack::new();
        let mut pushed = false;

        let err = raise(&mut port, &mut saved, &mut pushed, 0).unwrap_err();
        assert_eq!(err.op, "ioctl(I_PUSH, pppif)");
        assert!(pushed);

        lower(&mut port, &mut saved, &mut pushed);
        assert_eq!(port.chain, chain(&["ldterm"]));
    }

    #[test]
    fn optional_compress_module_may_be_missing() {
        let mut refuse = HashSet::new();
        refuse.insert("pppcomp");
        let mut port = FakeStream {
            refuse,
            ..FakeStream::default()
        };
        let mut saved = ModuleStack::new();
        let mut pushed = false;

        let unit = raise(&mut port, &mut saved, &mut pushed, 0).unwrap();
        assert_eq!(unit, Unit(3));
        assert_eq!(port.chain, chain(&["pppasync", "pppif"]));
    }

    #[test]
    fn diagnostic_decodes_stuck_bits() {
        assert_eq!(eight_bit_diagnostic(PAI_FLAGS_HIBITS), None);
        assert_eq!(
            eight_bit_diagnostic(PAI_FLAGS_HIBITS & !PAI_FLAGS_B7_0),
            Some("bit 7 set to 1")
        );
        assert_eq!(
            eight_bit_diagnostic(PAI_FLAGS_HIBITS & !PAI_FLAGS_PAR_ODD),
            Some("even parity")
        );
        // Several patterns missing at once is unattributable noise.
        assert_eq!(eight_bit_diagnostic(0), None);
    }

    #[test]
    fn vj_byte_packs_all_three_fields() {
        let full = VjConfig {
            enabled: true,
            cid_compression: true,
            max_slot_id: 15,
        };
        assert_eq!(vj_request_byte(&full), 0xf1);

        let no_cid = VjConfig {
            enabled: true,
            cid_compression: false,
            max_slot_id: 3,
        };
        assert_eq!(vj_request_byte(&no_cid), 0x33);

        let off = VjConfig {
            enabled: false,
            cid_compression: false,
            max_slot_id: 0,
        };
        assert_eq!(vj_request_byte(&off), 0x02);
    }
}
