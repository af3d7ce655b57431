//! Login accounting for interactive sessions (the records `who` and `w` read).

use std::path::{Path, PathBuf};

use tracing::debug;

/// What is recorded when an interactive session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginEntry {
    pub tty: PathBuf,
    pub user: String,
    pub remote_host: String,
    pub pid: u32,
}

/// Token returned by `session_start`, handed back to `session_end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRecord {
    pub entry: LoginEntry,
}

/// Sink for login-accounting records.
pub trait LoginAccounting: Send + Sync {
    fn session_start(&self, entry: LoginEntry) -> LoginRecord;
    fn session_end(&self, record: LoginRecord);
}

/// Accounting disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLoginAccounting;

impl LoginAccounting for NoLoginAccounting {
    fn session_start(&self, entry: LoginEntry) -> LoginRecord {
        LoginRecord { entry }
    }

    fn session_end(&self, _record: LoginRecord) {}
}

/// Writes `USER_PROCESS` / `DEAD_PROCESS` entries to the system utmp file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utmp;

/// Terminal name relative to `/dev`, as stored in `ut_line`.
pub fn tty_line(tty: &Path) -> String {
    tty.strip_prefix("/dev")
        .unwrap_or(tty)
        .to_string_lossy()
        .into_owned()
}

/// Short id stored in `ut_id`: the last four bytes of the line.
pub fn tty_id(line: &str) -> &str {
    let start = line.len().saturating_sub(4);
    line.get(start..).unwrap_or(line)
}

impl LoginAccounting for Utmp {
    fn session_start(&self, entry: LoginEntry) -> LoginRecord {
        write_entry(&entry, true);
        LoginRecord { entry }
    }

    fn session_end(&self, record: LoginRecord) {
        write_entry(&record.entry, false);
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn write_entry(entry: &LoginEntry, login: bool) {
    use nix::libc;

    fn fill(dst: &mut [libc::c_char], src: &str) {
        for (d, s) in dst.iter_mut().zip(src.bytes()) {
            *d = s as libc::c_char;
        }
    }

    let line = tty_line(&entry.tty);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

    // SAFETY: utmpx is plain old data; all-zero is a valid empty record.
    let mut ut: libc::utmpx = unsafe { std::mem::zeroed() };
    ut.ut_type = if login {
        libc::USER_PROCESS
    } else {
        libc::DEAD_PROCESS
    };
    ut.ut_pid = entry.pid as libc::pid_t;
    fill(&mut ut.ut_line, &line);
    fill(&mut ut.ut_id, tty_id(&line));
    if login {
        fill(&mut ut.ut_user, &entry.user);
        fill(&mut ut.ut_host, &entry.remote_host);
    }
    ut.ut_tv.tv_sec = now.as_secs() as _;
    ut.ut_tv.tv_usec = now.subsec_micros() as _;

    // SAFETY: the utmpx functions are called in sequence on a fully initialised record.
    let written = unsafe {
        libc::setutxent();
        let res = libc::pututxline(&ut);
        libc::endutxent();
        !res.is_null()
    };
    if !written {
        debug!(
            tty = %entry.tty.display(),
            error = %std::io::Error::last_os_error(),
            "utmp update failed"
        );
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn write_entry(entry: &LoginEntry, _login: bool) {
    debug!(tty = %entry.tty.display(), "utmp accounting not supported on this platform");
}
