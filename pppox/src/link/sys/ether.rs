//! Finding a local hardware address on the peer's subnet.
//!
//! Proxy arp means answering resolution requests for the peer on one of our
//! ethernet segments, and for that we need the hardware address of whichever
//! local interface shares the peer's subnet. The kernel is asked to
//! enumerate its interfaces through the generic configuration query; each
//! candidate is then checked for the right flags and netmask. (Older systems
//! without such a query used to walk the kernel's interface list through
//! `/dev/kmem` instead — that approach does not survive contact with memory
//! protection or kernel version bumps and is not offered here.)
use core::{fmt, mem};
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use tracing::{debug, warn};

use super::inet::{FlagsPort, Ifconfig};
use super::{ifreq, Errno, IoctlResult, LibcResult};

/// A six-octet ethernet address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Construct an ethernet address from a sequence of octets, in
    /// big-endian.
    ///
    /// # Panics
    /// The function panics if `data` is not six octets long.
    pub fn from_bytes(data: &[u8]) -> Address {
        let mut bytes = [0; 6];
        bytes.copy_from_slice(data);
        Address(bytes)
    }

    /// Return the address as a sequence of octets, in big-endian.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        write!(
            f,
            "{:02x}-{:02x}-{:02x}-{:02x}-{:02x}-{:02x}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
        )
    }
}

/// One interface returned by the enumeration, with its internet address.
pub(crate) struct Candidate {
    pub(crate) name: String,
    pub(crate) addr: Ipv4Addr,
}

/// What the second round of queries knows about a candidate.
pub(crate) struct Details {
    pub(crate) flags: libc::c_int,
    pub(crate) netmask: Ipv4Addr,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IfEntry {
    interface: ifreq,
    addr: libc::sockaddr,
}

#[repr(C)]
#[allow(non_camel_case_types)]
struct ifconf {
    ifc_len: libc::c_int,
    ifc_buf: *mut IfEntry,
}

/// The hardware address of a local interface sharing the peer's subnet.
///
/// The interface must be up, broadcast-capable, not loopback, not
/// point-to-point and answering arp itself. `None` means no such interface —
/// the caller treats that as "proxy arp unavailable", not as an error.
pub fn address_for_peer(control: RawFd, peer: Ipv4Addr) -> Option<Address> {
    let candidates = match enumerate(control) {
        Ok(candidates) => candidates,
        Err(errno) => {
            warn!("ioctl(SIOCGIFCONF): {}", errno);
            return None;
        }
    };

    let name = select_interface(peer, &candidates, |name| {
        let mut ifconfig = Ifconfig::new(control, name);
        let flags = ifconfig.flags().ok()?;
        let netmask = ifconfig.netmask().ok()?;
        Some(Details {
            flags: flags as libc::c_int,
            netmask,
        })
    })?;

    match Ifconfig::new(control, &name).hardware_address() {
        Ok(addr) => Some(addr),
        Err(errno) => {
            warn!("ioctl(SIOCGIFHWADDR): {}", errno);
            None
        }
    }
}

/// Scan the candidates for one on the peer's subnet.
///
/// `query` fetches the flags and netmask of a named interface; a candidate
/// it cannot answer for is skipped, exactly like one with the wrong flags.
pub(crate) fn select_interface(
    peer: Ipv4Addr,
    candidates: &[Candidate],
    mut query: impl FnMut(&str) -> Option<Details>,
) -> Option<String> {
    const WANTED: libc::c_int = libc::IFF_UP | libc::IFF_BROADCAST;
    const REJECTED: libc::c_int = libc::IFF_LOOPBACK | libc::IFF_POINTOPOINT | libc::IFF_NOARP;

    for candidate in candidates {
        let details = match query(&candidate.name) {
            Some(details) => details,
            None => continue,
        };

        if details.flags & (WANTED | REJECTED) != WANTED {
            continue;
        }

        let mask = u32::from(details.netmask);
        if u32::from(peer) & mask != u32::from(candidate.addr) & mask {
            continue;
        }

        debug!("found interface {} for proxy arp", candidate.name);
        return Some(candidate.name.clone());
    }

    None
}

/// Ask the kernel for every configured interface address.
///
/// The query writes as many entries as fit; a completely filled buffer may
/// have been truncated, so it is grown and retried until there is slack.
fn enumerate(fd: RawFd) -> Result<Vec<Candidate>, Errno> {
    let mut entries: Vec<IfEntry> = vec![unsafe { mem::zeroed() }; 16];

    loop {
        let mut request = ifconf {
            ifc_len: (entries.len() * mem::size_of::<IfEntry>()) as libc::c_int,
            ifc_buf: entries.as_mut_ptr(),
        };

        let res = unsafe { libc::ioctl(fd, libc::SIOCGIFCONF, &mut request as *mut _) };
        IoctlResult(res).errno()?;

        let used = request.ifc_len as usize / mem::size_of::<IfEntry>();
        if used < entries.len() {
            entries.truncate(used);
            break;
        }

        let grown = entries.len() * 2;
        entries = vec![unsafe { mem::zeroed() }; grown];
    }

    Ok(entries
        .iter()
        .filter_map(|entry| {
            if entry.addr.sa_family != libc::AF_INET as libc::sa_family_t {
                return None;
            }
            let sin = &entry.addr as *const libc::sockaddr as *const libc::sockaddr_in;
            let addr = Ipv4Addr::from(u32::from_be(unsafe { (*sin).sin_addr.s_addr }));
            Some(Candidate {
                name: entry.interface.name(),
                addr,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const PEER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 42);
    const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    const GOOD: libc::c_int = libc::IFF_UP | libc::IFF_BROADCAST;

    fn candidate(name: &str, addr: Ipv4Addr) -> Candidate {
        Candidate {
            name: name.into(),
            addr,
        }
    }

    #[test]
    fn no_shared_subnet_finds_nothing() {
        let candidates = [candidate("eth0", Ipv4Addr::new(198, 51, 100, 1))];
        let found = select_interface(PEER, &candidates, |_| {
            Some(Details {
                flags: GOOD,
                netmask: MASK,
            })
        });
        assert_eq!(found, None);
    }

    #[test]
    fn matching_subnet_is_found() {
        let candidates = [
            candidate("eth0", Ipv4Addr::new(198, 51, 100, 1)),
            candidate("eth1", Ipv4Addr::new(192, 0, 2, 7)),
        ];
        let found = select_interface(PEER, &candidates, |_| {
            Some(Details {
                flags: GOOD,
                netmask: MASK,
            })
        });
        assert_eq!(found.as_deref(), Some("eth1"));
    }

    #[test]
    fn unsuitable_interfaces_are_skipped() {
        let candidates = [
            candidate("lo", Ipv4Addr::new(192, 0, 2, 9)),
            candidate("sl0", Ipv4Addr::new(192, 0, 2, 10)),
            candidate("down0", Ipv4Addr::new(192, 0, 2, 11)),
            candidate("eth0", Ipv4Addr::new(192, 0, 2, 12)),
        ];
        let mut flags = HashMap::new();
        flags.insert("lo", GOOD | libc::IFF_LOOPBACK);
        flags.insert("sl0", GOOD | libc::IFF_POINTOPOINT);
        flags.insert("down0", libc::IFF_BROADCAST);
        flags.insert("eth0", GOOD);

        let found = select_interface(PEER, &candidates, |name| {
            Some(Details {
                flags: flags[name],
                netmask: MASK,
            })
        });
        assert_eq!(found.as_deref(), Some("eth0"));
    }

    #[test]
    fn unanswerable_candidates_are_skipped() {
        let candidates = [
            candidate("ghost0", Ipv4Addr::new(192, 0, 2, 3)),
            candidate("eth0", Ipv4Addr::new(192, 0, 2, 4)),
        ];
        let found = select_interface(PEER, &candidates, |name| {
            if name == "ghost0" {
                None
            } else {
                Some(Details {
                    flags: GOOD,
                    netmask: MASK,
                })
            }
        });
        assert_eq!(found.as_deref(), Some("eth0"));
    }
}
