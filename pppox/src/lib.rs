//! Platform link adapters for point-to-point serial networking.
//!
//! This library is the lowest layer of a ppp daemon: it takes a serial line
//! that the caller has already opened and negotiated nothing on, and turns it
//! into a network interface the kernel routes packets through. When the
//! session ends it reverses that transformation, restoring every piece of
//! operating system state it touched on the way up.
//!
//! Two kernel architectures for packet delivery are covered, behind one
//! contract:
//!
//! * a *stream-stack* backend ([`link::StreamLink`]) for kernels that build
//!   the character device out of pushable processing modules, and
//! * a *line-discipline* backend ([`link::DisciplineLink`]) for kernels that
//!   swap a single discipline value on the tty.
//!
//! The rest of a daemon — negotiation state machines, authentication, option
//! parsing — talks to the [`link::LinkAdapter`] trait and never learns which
//! one it got.
//!
//! ## Design and relevant core concepts
//!
//! Everything here is a direct syscall sequence on two descriptors the caller
//! owns: the serial device and an auxiliary configuration socket. Nothing is
//! spawned, nothing is cached, and the only blocking point is an explicit
//! wait for readiness. What the library does manage carefully is *restorable
//! state*: the terminal attribute snapshot, the chain of kernel modules
//! popped off the device, the previous line discipline. Each of those is
//! captured exactly once, restored exactly once, and silently skipped when
//! the device has already disappeared underneath us — tearing down a link
//! whose modem hung up must never fail.
//!
//! Failures are split into three severities and the split is part of the API:
//! errors that leave the link unusable are returned as [`link::LinkError`],
//! errors that only doom the current negotiation as [`link::ConfigError`],
//! and expected degradations (an ioctl the driver never implemented, a
//! feature the peer will live without) are logged through `tracing` and
//! swallowed. The library never terminates the process; that decision
//! belongs to the daemon.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod acct;
pub mod link;
pub mod speed;
pub mod term;
