//! Session accounting records.
//!
//! Login accounting for dial-up sessions: one fixed-width record appended to
//! the system's session log when a link comes up, and one with an empty user
//! to mark it going down again. The format matches what the login machinery
//! writes, so the usual tooling can report ppp sessions alongside ordinary
//! logins.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, NativeEndian};

/// Where session records go unless the daemon says otherwise.
pub const DEFAULT_PATH: &str = "/var/log/wtmp";

const LINE_LEN: usize = 8;
const NAME_LEN: usize = 8;
const HOST_LEN: usize = 16;

/// Size of one record on disk: the three NUL-padded text fields followed by
/// a four byte native-endian timestamp.
pub const RECORD_LEN: usize = LINE_LEN + NAME_LEN + HOST_LEN + 4;

/// Appender for the session log.
///
/// The log is owned by the system; this type only ever appends whole
/// records. When a write comes up short the file is truncated back to its
/// prior length so no torn record survives. A missing log file disables
/// accounting silently — not every system keeps one.
#[derive(Clone, Debug)]
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    /// Account to the log file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SessionLog { path: path.into() }
    }

    /// Account to the system default log.
    pub fn system() -> Self {
        SessionLog::new(DEFAULT_PATH)
    }

    /// Record a session starting on `line` for `user` dialing in from
    /// `host`.
    pub fn record_session_start(&self, line: &str, user: &str, host: &str) {
        self.append(line, user, host);
    }

    /// Record the session on `line` ending.
    pub fn record_session_end(&self, line: &str) {
        self.append(line, "", "");
    }

    fn append(&self, line: &str, name: &str, host: &str) {
        let mut file = match OpenOptions::new().append(true).open(&self.path) {
            Ok(file) => file,
            Err(_) => return,
        };
        let prior = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => return,
        };

        let mut record = [0u8; RECORD_LEN];
        fill_padded(&mut record[..LINE_LEN], line);
        fill_padded(&mut record[LINE_LEN..LINE_LEN + NAME_LEN], name);
        fill_padded(
            &mut record[LINE_LEN + NAME_LEN..LINE_LEN + NAME_LEN + HOST_LEN],
            host,
        );
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as u32)
            .unwrap_or(0);
        NativeEndian::write_u32(&mut record[RECORD_LEN - 4..], now);

        match file.write(&record) {
            Ok(written) if written == RECORD_LEN => (),
            _ => {
                // Half a record helps nobody; put the log back as it was.
                let _ = file.set_len(prior);
            }
        }
    }
}

fn fill_padded(dst: &mut [u8], src: &str) {
    for (d, s) in dst.iter_mut().zip(src.as_bytes()) {
        *d = *s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn start_and_end_append_two_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wtmp");
        fs::File::create(&path).unwrap();

        let log = SessionLog::new(&path);
        log.record_session_start("ttyS0", "alice", "remote.example");
        log.record_session_end("ttyS0");

        let data = fs::read(&path).unwrap();
        assert_eq!(data.len(), 2 * RECORD_LEN);

        let (start, end) = data.split_at(RECORD_LEN);
        assert_eq!(&start[..5], b"ttyS0");
        assert_eq!(&start[5..LINE_LEN], &[0, 0, 0]);
        assert_eq!(&start[LINE_LEN..LINE_LEN + 5], b"alice");
        assert_eq!(
            &start[LINE_LEN + NAME_LEN..LINE_LEN + NAME_LEN + 14],
            b"remote.example"
        );

        // The closing record clears user and host but keeps the line.
        assert_eq!(&end[..5], b"ttyS0");
        assert!(end[LINE_LEN..LINE_LEN + NAME_LEN].iter().all(|&b| b == 0));
        assert!(end[LINE_LEN + NAME_LEN..LINE_LEN + NAME_LEN + HOST_LEN]
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn long_fields_are_truncated_to_the_record_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wtmp");
        fs::File::create(&path).unwrap();

        let log = SessionLog::new(&path);
        log.record_session_start("ttyUSB12345", "a-very-long-user", "a.much.too.long.host.example");

        let data = fs::read(&path).unwrap();
        assert_eq!(data.len(), RECORD_LEN);
        assert_eq!(&data[..LINE_LEN], b"ttyUSB12");
        assert_eq!(&data[LINE_LEN..LINE_LEN + NAME_LEN], b"a-very-l");
        assert_eq!(
            &data[LINE_LEN + NAME_LEN..LINE_LEN + NAME_LEN + HOST_LEN],
            b"a.much.too.long."
        );
    }

    #[test]
    fn missing_log_file_disables_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");

        let log = SessionLog::new(&path);
        log.record_session_start("ttyS0", "alice", "remote.example");

        assert!(!path.exists());
    }
}
