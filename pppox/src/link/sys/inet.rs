//! Interface addressing, routing and arp through the control socket.
//!
//! These requests are the same for both backends: they go to the generic
//! networking ioctls on the configuration socket, addressed by interface
//! name. The multi-step operations are written against small port traits so
//! their sequencing — every step attempted, no rollback — stays checkable
//! without a kernel.
use core::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use tracing::{info, warn};

use super::ether;
use super::{ifreq, Errno, IoctlResult, LibcResult};
use crate::link::ConfigError;

/// Interface configuration access, bound to one interface name.
pub(crate) struct Ifconfig {
    fd: RawFd,
    ifreq: ifreq,
}

#[repr(C)]
struct AddrRequest {
    interface: ifreq,
    addr: libc::sockaddr_in,
}

#[repr(C)]
struct FlagsRequest {
    interface: ifreq,
    flags: libc::c_short,
}

#[repr(C)]
struct MtuRequest {
    interface: ifreq,
    mtu: libc::c_int,
}

#[repr(C)]
struct HardwareRequest {
    interface: ifreq,
    addr: libc::sockaddr,
}

fn inet_sockaddr(addr: Ipv4Addr) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_addr.s_addr = u32::from(addr).to_be();
    sin
}

/// Write an internet address into a generic sockaddr slot, the way the
/// routing and arp request structures want it.
fn write_inet(dst: &mut libc::sockaddr, addr: Ipv4Addr) {
    let sin = dst as *mut libc::sockaddr as *mut libc::sockaddr_in;
    unsafe {
        *sin = inet_sockaddr(addr);
    }
}

fn read_inet(src: &libc::sockaddr_in) -> Ipv4Addr {
    Ipv4Addr::from(u32::from_be(src.sin_addr.s_addr))
}

impl Ifconfig {
    pub(crate) fn new(fd: RawFd, name: &str) -> Self {
        Ifconfig {
            fd,
            ifreq: ifreq::new(name),
        }
    }

    fn addr_ioctl(&mut self, request: libc::Ioctl, addr: Ipv4Addr) -> Result<(), Errno> {
        let mut req = AddrRequest {
            interface: self.ifreq,
            addr: inet_sockaddr(addr),
        };

        let res = unsafe { libc::ioctl(self.fd, request, &mut req as *mut _) };

        IoctlResult(res).errno()
    }

    pub(crate) fn set_mtu(&mut self, mtu: u16) -> Result<(), Errno> {
        let mut req = MtuRequest {
            interface: self.ifreq,
            mtu: mtu as libc::c_int,
        };

        let res = unsafe { libc::ioctl(self.fd, libc::SIOCSIFMTU, &mut req as *mut _) };

        IoctlResult(res).errno()
    }

    pub(crate) fn netmask(&mut self) -> Result<Ipv4Addr, Errno> {
        let mut req = AddrRequest {
            interface: self.ifreq,
            addr: unsafe { mem::zeroed() },
        };

        let res = unsafe { libc::ioctl(self.fd, libc::SIOCGIFNETMASK, &mut req as *mut _) };

        IoctlResult(res).errno()?;
        Ok(read_inet(&req.addr))
    }

    pub(crate) fn hardware_address(&mut self) -> Result<ether::Address, Errno> {
        let mut req = HardwareRequest {
            interface: self.ifreq,
            addr: unsafe { mem::zeroed() },
        };

        let res = unsafe { libc::ioctl(self.fd, libc::SIOCGIFHWADDR, &mut req as *mut _) };

        IoctlResult(res).errno()?;

        let mut octets = [0; 6];
        for (octet, data) in octets.iter_mut().zip(req.addr.sa_data.iter()) {
            *octet = *data as u8;
        }
        Ok(ether::Address(octets))
    }
}

/// The three address assignment steps, separated out for sequencing tests.
pub(crate) trait AddressPort {
    fn set_local(&mut self, addr: Ipv4Addr) -> Result<(), Errno>;
    fn set_peer(&mut self, addr: Ipv4Addr) -> Result<(), Errno>;
    fn set_mask(&mut self, mask: Ipv4Addr) -> Result<(), Errno>;
}

impl AddressPort for Ifconfig {
    fn set_local(&mut self, addr: Ipv4Addr) -> Result<(), Errno> {
        self.addr_ioctl(libc::SIOCSIFADDR, addr)
    }

    fn set_peer(&mut self, addr: Ipv4Addr) -> Result<(), Errno> {
        self.addr_ioctl(libc::SIOCSIFDSTADDR, addr)
    }

    fn set_mask(&mut self, mask: Ipv4Addr) -> Result<(), Errno> {
        self.addr_ioctl(libc::SIOCSIFNETMASK, mask)
    }
}

/// Assign local and peer addresses, and the netmask when one was negotiated.
///
/// Each step is attempted regardless of earlier failures; the kernel keeps
/// whatever subset stuck. The return value reports whether everything
/// succeeded.
pub(crate) fn apply_addresses(
    port: &mut impl AddressPort,
    local: Ipv4Addr,
    peer: Ipv4Addr,
    mask: Option<Ipv4Addr>,
) -> bool {
    let mut ok = true;

    if let Err(errno) = port.set_local(local) {
        warn!("ioctl(SIOCSIFADDR): {}", errno);
        ok = false;
    }
    if let Err(errno) = port.set_peer(peer) {
        warn!("ioctl(SIOCSIFDSTADDR): {}", errno);
        ok = false;
    }
    if let Some(mask) = mask {
        info!("setting interface mask to {}", mask);
        if let Err(errno) = port.set_mask(mask) {
            warn!("ioctl(SIOCSIFNETMASK): {}", errno);
            ok = false;
        }
    }

    ok
}

/// Interface flag word access, separated out for sequencing tests.
pub(crate) trait FlagsPort {
    fn flags(&mut self) -> Result<libc::c_short, Errno>;
    fn set_flags(&mut self, flags: libc::c_short) -> Result<(), Errno>;
}

impl FlagsPort for Ifconfig {
    fn flags(&mut self) -> Result<libc::c_short, Errno> {
        let mut req = FlagsRequest {
            interface: self.ifreq,
            flags: 0,
        };

        let res = unsafe { libc::ioctl(self.fd, libc::SIOCGIFFLAGS, &mut req as *mut _) };

        IoctlResult(res).errno()?;
        Ok(req.flags)
    }

    fn set_flags(&mut self, flags: libc::c_short) -> Result<(), Errno> {
        let mut req = FlagsRequest {
            interface: self.ifreq,
            flags,
        };

        let res = unsafe { libc::ioctl(self.fd, libc::SIOCSIFFLAGS, &mut req as *mut _) };

        IoctlResult(res).errno()
    }
}

/// Read-modify-write the interface flag word.
///
/// A failure at either step reports and aborts the operation; there is no
/// retry.
pub(crate) fn change_flags(
    port: &mut impl FlagsPort,
    set: libc::c_short,
    clear: libc::c_short,
) -> Result<(), ConfigError> {
    let flags = port.flags().map_err(|errno| ConfigError {
        op: "ioctl(SIOCGIFFLAGS)",
        errno,
    })?;

    port.set_flags((flags | set) & !clear)
        .map_err(|errno| ConfigError {
            op: "ioctl(SIOCSIFFLAGS)",
            errno,
        })
}

fn route_ioctl(
    fd: RawFd,
    request: libc::Ioctl,
    dst: Ipv4Addr,
    gateway: Ipv4Addr,
    flags: libc::c_ushort,
) -> Result<(), Errno> {
    let mut rt: libc::rtentry = unsafe { mem::zeroed() };
    write_inet(&mut rt.rt_dst, dst);
    write_inet(&mut rt.rt_gateway, gateway);
    write_inet(&mut rt.rt_genmask, Ipv4Addr::UNSPECIFIED);
    rt.rt_flags = flags;

    let res = unsafe { libc::ioctl(fd, request, &mut rt as *mut _) };

    IoctlResult(res).errno()
}

/// Install the default route through the peer.
pub(crate) fn add_default_route(fd: RawFd, gateway: Ipv4Addr) -> Result<(), Errno> {
    route_ioctl(
        fd,
        libc::SIOCADDRT,
        Ipv4Addr::UNSPECIFIED,
        gateway,
        libc::RTF_UP | libc::RTF_GATEWAY,
    )
}

/// Remove the default route through the peer.
pub(crate) fn delete_default_route(fd: RawFd, gateway: Ipv4Addr) -> Result<(), Errno> {
    route_ioctl(
        fd,
        libc::SIOCDELRT,
        Ipv4Addr::UNSPECIFIED,
        gateway,
        libc::RTF_UP | libc::RTF_GATEWAY,
    )
}

/// Remove the host route to the peer left over from the address assignment.
pub(crate) fn delete_host_route(fd: RawFd, dst: Ipv4Addr, gateway: Ipv4Addr) -> Result<(), Errno> {
    route_ioctl(fd, libc::SIOCDELRT, dst, gateway, libc::RTF_HOST)
}

/// Publish a permanent arp entry answering for `peer` with our hardware
/// address.
pub(crate) fn add_arp_entry(fd: RawFd, peer: Ipv4Addr, hardware: &ether::Address) -> Result<(), Errno> {
    let mut req: libc::arpreq = unsafe { mem::zeroed() };
    write_inet(&mut req.arp_pa, peer);
    req.arp_ha.sa_family = libc::AF_UNSPEC as libc::sa_family_t;
    for (data, octet) in req.arp_ha.sa_data.iter_mut().zip(hardware.0.iter()) {
        *data = *octet as libc::c_char;
    }
    req.arp_flags = libc::ATF_PERM | libc::ATF_PUBL;

    let res = unsafe { libc::ioctl(fd, libc::SIOCSARP, &mut req as *mut _) };

    IoctlResult(res).errno()
}

/// Withdraw the proxy entry for `peer`.
pub(crate) fn delete_arp_entry(fd: RawFd, peer: Ipv4Addr) -> Result<(), Errno> {
    let mut req: libc::arpreq = unsafe { mem::zeroed() };
    write_inet(&mut req.arp_pa, peer);

    let res = unsafe { libc::ioctl(fd, libc::SIOCDARP, &mut req as *mut _) };

    IoctlResult(res).errno()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeAddresses {
        steps: Vec<&'static str>,
        fail_local: bool,
        fail_peer: bool,
        fail_mask: bool,
    }

    impl AddressPort for FakeAddresses {
        fn set_local(&mut self, _: Ipv4Addr) -> Result<(), Errno> {
            self.steps.push("local");
            if self.fail_local {
                Err(Errno(libc::EPERM))
            } else {
                Ok(())
            }
        }

        fn set_peer(&mut self, _: Ipv4Addr) -> Result<(), Errno> {
            self.steps.push("peer");
            if self.fail_peer {
                Err(Errno(libc::EPERM))
            } else {
                Ok(())
            }
        }

        fn set_mask(&mut self, _: Ipv4Addr) -> Result<(), Errno> {
            self.steps.push("mask");
            if self.fail_mask {
                Err(Errno(libc::EPERM))
            } else {
                Ok(())
            }
        }
    }

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 2);
    const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    #[test]
    fn mask_makes_it_three_steps() {
        let mut port = FakeAddresses::default();
        assert!(apply_addresses(&mut port, LOCAL, PEER, Some(MASK)));
        assert_eq!(port.steps, ["local", "peer", "mask"]);
    }

    #[test]
    fn no_mask_makes_it_two_steps() {
        let mut port = FakeAddresses::default();
        assert!(apply_addresses(&mut port, LOCAL, PEER, None));
        assert_eq!(port.steps, ["local", "peer"]);
    }

    #[test]
    fn failed_step_does_not_block_the_next() {
        let mut port = FakeAddresses {
            fail_local: true,
            ..FakeAddresses::default()
        };
        assert!(!apply_addresses(&mut port, LOCAL, PEER, Some(MASK)));
        assert_eq!(port.steps, ["local", "peer", "mask"]);
    }

    #[derive(Default)]
    struct FakeFlags {
        flags: libc::c_short,
        fail_get: bool,
        fail_set: bool,
        writes: usize,
    }

    impl FlagsPort for FakeFlags {
        fn flags(&mut self) -> Result<libc::c_short, Errno> {
            if self.fail_get {
                Err(Errno(libc::ENODEV))
            } else {
                Ok(self.flags)
            }
        }

        fn set_flags(&mut self, flags: libc::c_short) -> Result<(), Errno> {
            self.writes += 1;
            if self.fail_set {
                Err(Errno(libc::ENODEV))
            } else {
                self.flags = flags;
                Ok(())
            }
        }
    }

    #[test]
    fn change_flags_preserves_unrelated_bits() {
        let mut port = FakeFlags {
            flags: 0x1000,
            ..FakeFlags::default()
        };
        let up = libc::IFF_UP as libc::c_short;

        change_flags(&mut port, up, 0).unwrap();
        assert_eq!(port.flags, 0x1000 | up);

        change_flags(&mut port, 0, up).unwrap();
        assert_eq!(port.flags, 0x1000);
    }

    #[test]
    fn failed_read_aborts_without_a_write() {
        let mut port = FakeFlags {
            fail_get: true,
            ..FakeFlags::default()
        };
        let err = change_flags(&mut port, libc::IFF_UP as libc::c_short, 0).unwrap_err();
        assert_eq!(err.op, "ioctl(SIOCGIFFLAGS)");
        assert_eq!(port.writes, 0);
    }
}
