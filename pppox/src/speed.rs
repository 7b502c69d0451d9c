//! Bidirectional lookup between bit rates and terminal speed codes.
//!
//! The terminal interface encodes line speeds as opaque `speed_t` codes. This
//! module translates between those codes and plain bits per second using a
//! fixed table; there is no interpolation and an unlisted rate is simply not
//! supported.

use tracing::warn;

/// Rates the serial driver can be asked for, in table order.
///
/// The reverse lookup returns the first matching entry, so aliased codes
/// would resolve to the canonical rate listed first.
static SPEEDS: &[(u32, libc::speed_t)] = &[
    (50, libc::B50),
    (75, libc::B75),
    (110, libc::B110),
    (134, libc::B134),
    (150, libc::B150),
    (200, libc::B200),
    (300, libc::B300),
    (600, libc::B600),
    (1200, libc::B1200),
    (1800, libc::B1800),
    (2400, libc::B2400),
    (4800, libc::B4800),
    (9600, libc::B9600),
    (19200, libc::B19200),
    (38400, libc::B38400),
    (57600, libc::B57600),
    (115200, libc::B115200),
];

/// Translate from bits per second to a terminal speed code.
///
/// A zero rate means "no explicit rate requested" and translates to `None`
/// without comment. Any other rate missing from the table is reported once
/// and also yields `None`; the caller falls back to whatever the line is
/// currently running at.
pub fn line_code(bps: u32) -> Option<libc::speed_t> {
    if bps == 0 {
        return None;
    }
    match SPEEDS.iter().find(|&&(rate, _)| rate == bps) {
        Some(&(_, code)) => Some(code),
        None => {
            warn!("speed {} not supported", bps);
            None
        }
    }
}

/// Translate from a terminal speed code back to bits per second.
///
/// Unknown codes, including the disabled-line code `B0`, come back as 0.
pub fn bits_per_second(code: libc::speed_t) -> u32 {
    SPEEDS
        .iter()
        .find(|&&(_, c)| c == code)
        .map(|&(rate, _)| rate)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_listed_rate() {
        for &(rate, _) in SPEEDS {
            let code = line_code(rate).expect("listed rate must translate");
            assert_eq!(bits_per_second(code), rate);
        }
    }

    #[test]
    fn unknown_rate_is_none() {
        assert_eq!(line_code(31337), None);
        assert_eq!(line_code(115201), None);
    }

    #[test]
    fn zero_rate_is_none() {
        assert_eq!(line_code(0), None);
    }

    #[test]
    fn unknown_code_is_zero() {
        assert_eq!(bits_per_second(libc::B0), 0);
    }
}
