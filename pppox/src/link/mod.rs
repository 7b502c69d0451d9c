//! The platform link contract.
//!
//! A [`LinkAdapter`] owns the platform-specific half of a ppp session: it
//! binds an already-open serial descriptor to the kernel's packet machinery,
//! pushes negotiated parameters down to the driver, moves addresses and
//! routes, carries packets, and undoes all of it on the way out. The two
//! implementations, [`StreamLink`] and [`DisciplineLink`], differ only in
//! which kernel architecture they talk to; callers pick one at start-up
//! (or take [`PlatformLink`], chosen at build time) and treat it uniformly.
//!
//! ## Lifecycle
//!
//! [`establish`][LinkAdapter::establish] is called once at session start and
//! [`disestablish`][LinkAdapter::disestablish] exactly once at the end — plus
//! possibly again from a fatal cleanup path, which is safe: disestablish is
//! idempotent, tolerates an establish that failed partway through, and
//! silently skips every restoration step once the device has disappeared.
//! Calling establish twice without a disestablish in between is not
//! supported.
//!
//! The configuration calls in between are driven by the negotiation engine
//! as options are agreed on; they carry already-validated primitive values
//! and do no parsing of their own.

use core::fmt;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::time::Duration;

use thiserror::Error;

pub mod sys;

pub use self::sys::{ControlSocket, DisciplineLink, Errno, PlatformLink, StreamLink};

/// Result alias for operations that can end the link.
pub type Result<T> = core::result::Result<T, LinkError>;

/// The interface unit number assigned by the driver during establish.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Unit(pub u32);

impl Unit {
    /// The kernel name of the network interface backing this unit.
    pub fn interface_name(self) -> String {
        format!("ppp{}", self.0)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ppp{}", self.0)
    }
}

/// The externally owned descriptors an adapter operates on.
///
/// The adapter never closes either descriptor. The single exception is the
/// stdio-silencing step during establish when `controlling_terminal` is set,
/// which closes the standard descriptors other than these two.
#[derive(Clone, Copy, Debug)]
pub struct LinkHandle {
    /// The serial device carrying the link.
    pub tty: RawFd,
    /// The configuration socket, see [`ControlSocket`].
    pub control: RawFd,
    /// Whether the serial device is also the process's controlling terminal.
    pub controlling_terminal: bool,
}

/// Transmit-side parameters pushed to the driver as negotiation settles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendConfig {
    /// Largest frame the driver may transmit.
    pub mtu: u16,
    /// Control characters to escape on the way out.
    pub accm: u32,
    /// Elide the protocol field where the peer allows it.
    pub protocol_compression: bool,
    /// Elide the address and control fields where the peer allows it.
    pub address_compression: bool,
}

/// Receive-side counterpart of [`SendConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvConfig {
    /// Largest frame the driver should accept.
    pub mru: u16,
    /// Control characters the peer escapes towards us.
    pub accm: u32,
    /// Accept frames with an elided protocol field.
    pub protocol_compression: bool,
    /// Accept frames with elided address and control fields.
    pub address_compression: bool,
}

/// Negotiated header compression parameters for the transport protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VjConfig {
    /// Whether header compression is on at all.
    pub enabled: bool,
    /// Whether the connection id byte may be elided too.
    pub cid_compression: bool,
    /// Highest connection slot id to use.
    pub max_slot_id: u8,
}

/// The extended transmit escape map covering all 256 characters.
pub type ExtendedAccm = [u32; 8];

/// Which direction of the link a query or setting concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// From us towards the peer.
    Transmit,
    /// From the peer towards us.
    Receive,
}

/// A failure that leaves the link unusable.
///
/// Continuing after one of these would leave interface or terminal state
/// inconsistent beyond what the negotiation engine can recover, so the
/// daemon is expected to tear the session down. The error names the syscall
/// that failed; the embedding process decides whether to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{op}: {errno}")]
pub struct LinkError {
    /// The operation that failed, in `ioctl(NAME)` notation.
    pub op: &'static str,
    /// The reported cause.
    #[source]
    pub errno: Errno,
}

/// A failure that dooms the current negotiation but not the process.
///
/// A requested parameter cannot be honored; operating system state is still
/// consistent and a fresh negotiation may try different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{op}: {errno}")]
pub struct ConfigError {
    /// The operation that failed, in `ioctl(NAME)` notation.
    pub op: &'static str,
    /// The reported cause.
    #[source]
    pub errno: Errno,
}

/// One platform's rendition of the link operations.
///
/// Implementations are single-threaded, synchronous and non-reentrant; no
/// operation is cancellable mid-flight. Cancellation is expressed by ceasing
/// further calls and invoking [`disestablish`][Self::disestablish]. Methods
/// that return nothing handle their failures internally as logged
/// degradations.
pub trait LinkAdapter {
    /// Turn the serial device into a network interface.
    ///
    /// On success the assigned unit number is returned and also retrievable
    /// through [`unit`][Self::unit]. On failure, partial establishment
    /// remains recorded in the adapter so that a defensive `disestablish`
    /// can unwind it.
    fn establish(&mut self) -> Result<Unit>;

    /// Restore the serial device to normal operation.
    ///
    /// Never fails and never panics; it is called from cleanup paths. A
    /// second consecutive call is a no-op. After a hang-up the kernel has
    /// already discarded the link and every restoration step is skipped.
    fn disestablish(&mut self);

    /// The unit assigned by the last successful establish, if still up.
    fn unit(&self) -> Option<Unit>;

    /// Record that the modem connection was lost.
    ///
    /// A hung-up link suppresses all device restoration during
    /// disestablish; the descriptors lead nowhere anymore.
    fn set_hung_up(&mut self, hung_up: bool);

    /// Configure the transmit characteristics of the interface.
    fn send_config(&mut self, config: &SendConfig) -> core::result::Result<(), ConfigError>;

    /// Configure the receive characteristics of the interface.
    ///
    /// Receive-side misconfiguration degrades the link rather than aborting
    /// the session, so failures here are logged and swallowed.
    fn recv_config(&mut self, config: &RecvConfig);

    /// Install the extended transmit escape map, where supported.
    fn set_extended_accm(&mut self, accm: &ExtendedAccm);

    /// Configure transport header compression. Returns whether the driver
    /// accepted the parameters.
    fn set_vj_compression(&mut self, config: &VjConfig) -> bool;

    /// Ask the driver whether it could use the given compression method.
    ///
    /// Purely a query: an ioctl failure means "no", never an error.
    fn test_compression(&mut self, options: &[u8], direction: Direction) -> bool;

    /// Tell the driver the current state of compression negotiation.
    fn set_ccp_state(&mut self, open: bool, up: bool);

    /// Whether decompression was shut down by an unrecoverable error.
    ///
    /// Same non-escalating contract as
    /// [`test_compression`][Self::test_compression].
    fn fatal_decompression_error(&mut self) -> bool;

    /// Mark the interface up.
    fn interface_up(&mut self) -> core::result::Result<(), ConfigError>;

    /// Mark the interface down.
    fn interface_down(&mut self) -> core::result::Result<(), ConfigError>;

    /// Assign the local and peer addresses, and the netmask if one was
    /// negotiated.
    ///
    /// Every step is attempted even when an earlier one failed; partial
    /// application is accepted and there is no rollback. Returns `false` if
    /// any step failed.
    fn set_addresses(&mut self, local: Ipv4Addr, peer: Ipv4Addr, mask: Option<Ipv4Addr>) -> bool;

    /// Undo [`set_addresses`][Self::set_addresses] as far as the kernel
    /// allows, dropping the route to the peer.
    fn clear_addresses(&mut self, local: Ipv4Addr, peer: Ipv4Addr) -> bool;

    /// Point the default route at the peer.
    fn set_default_route(&mut self, gateway: Ipv4Addr) -> bool;

    /// Remove the default route through the peer.
    fn clear_default_route(&mut self, gateway: Ipv4Addr) -> bool;

    /// Answer address resolution on the peer's behalf.
    ///
    /// Needs a local interface on the peer's subnet to borrow a hardware
    /// address from; when none is found the entry is not created and that is
    /// reported as `false`, not an error.
    fn add_proxy_arp(&mut self, peer: Ipv4Addr) -> bool;

    /// Remove the proxy entry for the peer.
    fn remove_proxy_arp(&mut self, peer: Ipv4Addr) -> bool;

    /// Transmit one framed packet.
    ///
    /// A vanished device swallows the packet silently: the session is on its
    /// way down and disestablish handles the rest.
    fn send_packet(&mut self, packet: &[u8]) -> Result<()>;

    /// Receive one framed packet, or `None` when nothing has arrived.
    fn recv_packet(&mut self, buffer: &mut [u8]) -> Result<Option<usize>>;

    /// Block until the device has input, an exceptional event, or the
    /// timeout elapses. Interruption by a signal returns normally; the
    /// caller's loop comes back around.
    fn wait_input(&mut self, timeout: Option<Duration>) -> Result<()>;
}
