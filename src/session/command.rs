//! Construction of the OS process behind a session.

use std::ffi::CString;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use nix::unistd::{getgrouplist, geteuid, setgid, setgroups, setsid, setuid, Gid, Uid};
use tokio::process::Command;

use super::HandlerContext;
use crate::os::pty;
use crate::os::users::LocalUser;

/// Search path given to every spawned process.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Terminal type used when the client sent none.
pub const DEFAULT_TERM: &str = "xterm";

/// Environment variable carrying the device name.
pub const DEVICE_ENV: &str = "FLEETSSHD_DEVICE";

/// Fully resolved description of a process to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    /// Acquire stdin as controlling terminal.
    pub controlling_tty: bool,
}

/// Login shell for `user`: the override when set, otherwise the account's shell.
pub fn resolve_shell(user: &LocalUser, shell_override: Option<&str>) -> String {
    match shell_override {
        Some(shell) if !shell.is_empty() => shell.to_string(),
        _ if !user.shell.is_empty() => user.shell.clone(),
        _ => "/bin/sh".to_string(),
    }
}

impl CommandSpec {
    /// Login shell under a terminal.
    pub fn login_shell(user: &LocalUser, ctx: &HandlerContext, term: &str) -> Self {
        let shell = resolve_shell(user, ctx.shell_override.as_deref());
        let term = if term.is_empty() { DEFAULT_TERM } else { term };
        let mut env = base_env(user, &shell, &ctx.device);
        env.push(("TERM".to_string(), term.to_string()));
        Self {
            program: shell,
            args: vec!["--login".to_string()],
            env,
            cwd: HandlerContext::home_or_root(&user.home),
            controlling_tty: true,
        }
    }

    /// Client-supplied argument vector without a terminal. An empty vector
    /// (a `shell` request without a PTY) runs the login shell.
    pub fn exec(user: &LocalUser, ctx: &HandlerContext, argv: &[String]) -> Self {
        let shell = resolve_shell(user, ctx.shell_override.as_deref());
        let env = base_env(user, &shell, &ctx.device);
        let (program, args) = match argv.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (shell, vec!["--login".to_string()]),
        };
        Self {
            program,
            args,
            env,
            cwd: HandlerContext::home_or_root(&user.home),
            controlling_tty: false,
        }
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Build the tokio command. Standard streams default to null and are set by the caller.
    pub fn build(&self, user: &LocalUser) -> io::Result<Command> {
        let credentials = Credentials::for_user(user)?;
        let controlling_tty = self.controlling_tty;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // SAFETY: the closure only issues async-signal-safe system calls on
        // data prepared before fork.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(creds) = &credentials {
                    setgroups(&creds.groups)?;
                    setgid(creds.gid)?;
                    setuid(creds.uid)?;
                }
                setsid()?;
                if controlling_tty {
                    pty::set_controlling_terminal(0)?;
                }
                Ok(())
            });
        }
        Ok(cmd)
    }
}

fn base_env(user: &LocalUser, shell: &str, device: &str) -> Vec<(String, String)> {
    vec![
        ("HOME".to_string(), user.home.to_string_lossy().into_owned()),
        ("USER".to_string(), user.name.clone()),
        ("LOGNAME".to_string(), user.name.clone()),
        ("SHELL".to_string(), shell.to_string()),
        ("PATH".to_string(), DEFAULT_PATH.to_string()),
        (DEVICE_ENV.to_string(), device.to_string()),
    ]
}

/// Identity the child switches to before exec.
#[derive(Debug, Clone)]
struct Credentials {
    uid: Uid,
    gid: Gid,
    groups: Vec<Gid>,
}

impl Credentials {
    /// `None` when no switch is needed (already that user) or possible (not root).
    fn for_user(user: &LocalUser) -> io::Result<Option<Self>> {
        let euid = geteuid();
        if !euid.is_root() || euid.as_raw() == user.uid {
            return Ok(None);
        }
        let gid = Gid::from_raw(user.gid);
        let name = CString::new(user.name.as_str())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let groups = getgrouplist(&name, gid).unwrap_or_else(|_| vec![gid]);
        Ok(Some(Self {
            uid: Uid::from_raw(user.uid),
            gid,
            groups,
        }))
    }
}

/// Exit code reported to the client; signal deaths map to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> u32 {
    match status.code() {
        Some(code) => code as u32,
        None => 128 + status.signal().unwrap_or(0) as u32,
    }
}
