pub mod command;
pub mod exec;
pub mod keepalive;
pub mod orchestrator;
pub mod registry;
pub mod terminal;

use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use crate::os::users::UserDirectory;
use crate::os::utmp::LoginAccounting;
use registry::{ProcessRegistry, RegistryError};

pub use orchestrator::SessionOrchestrator;

/// Opaque identifier of one connection and its session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh id for a newly accepted connection.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Terminal dimensions as negotiated by `pty-req` and `window-change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl WindowSize {
    /// Build from the 32-bit values carried on the wire, saturating at `u16::MAX`.
    pub fn from_wire(cols: u32, rows: u32, pixel_width: u32, pixel_height: u32) -> Self {
        let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
        Self {
            cols: clamp(cols),
            rows: clamp(rows),
            pixel_width: clamp(pixel_width),
            pixel_height: clamp(pixel_height),
        }
    }
}

/// Pseudo-terminal negotiation recorded before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub size: WindowSize,
}

/// One authenticated session, immutable once dispatched.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub user: String,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub pty: Option<PtyRequest>,
    /// Requested argument vector. Empty for a `shell` request.
    pub command: Vec<String>,
}

impl Session {
    pub fn wants_pty(&self) -> bool {
        self.pty.is_some()
    }

    pub fn terminal_type(&self) -> Option<&str> {
        self.pty.as_ref().map(|p| p.term.as_str())
    }
}

/// Lifecycle of a session as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    Authenticated,
    Dispatched(SessionMode),
    Running,
    Terminating,
    Closed,
}

impl SessionPhase {
    fn rank(&self) -> u8 {
        match self {
            SessionPhase::Created => 0,
            SessionPhase::Authenticated => 1,
            SessionPhase::Dispatched(_) => 2,
            SessionPhase::Running => 3,
            SessionPhase::Terminating => 4,
            SessionPhase::Closed => 5,
        }
    }

    /// Phases only move forward; a failed dispatch may skip straight to `Terminating`.
    pub fn can_advance_to(&self, next: SessionPhase) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Created => write!(f, "created"),
            SessionPhase::Authenticated => write!(f, "authenticated"),
            SessionPhase::Dispatched(mode) => write!(f, "dispatched({})", mode),
            SessionPhase::Running => write!(f, "running"),
            SessionPhase::Terminating => write!(f, "terminating"),
            SessionPhase::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Pty,
    Exec,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Pty => write!(f, "pty"),
            SessionMode::Exec => write!(f, "exec"),
        }
    }
}

/// The raw byte channel of a session, split into halves.
pub struct SessionIo<R, W> {
    pub input: R,
    pub output: W,
}

impl<R, W> SessionIo<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

/// Owns the channel's stream halves for the whole life of a session.
///
/// Dropping a russh channel stream tears the channel down, so the halves
/// must outlive the exit status and close. A handler takes them with
/// [`ChannelHold::take_io`] and hands its relays back; each relay task
/// returns the half it owned when it finishes.
pub struct ChannelHold<R, W> {
    io: Option<SessionIo<R, W>>,
    kept: Vec<Box<dyn Any + Send>>,
}

impl<R, W> ChannelHold<R, W>
where
    R: Send + 'static,
    W: Send + 'static,
{
    pub fn new(io: SessionIo<R, W>) -> Self {
        Self {
            io: Some(io),
            kept: Vec::new(),
        }
    }

    /// The stream halves, if no handler has taken them yet.
    pub fn take_io(&mut self) -> Option<SessionIo<R, W>> {
        self.io.take()
    }

    /// Keep a stream half returned by a finished relay.
    pub fn keep<T: Send + 'static>(&mut self, part: T) {
        self.kept.push(Box::new(part));
    }

    /// Keep a relay that may still own a stream half. It is aborted on release.
    pub fn keep_relay<T: Send + 'static>(&mut self, task: JoinHandle<T>) {
        self.kept.push(Box::new(AbortOnDrop(task)));
    }

    /// Number of halves and relays held.
    pub fn held(&self) -> usize {
        self.kept.len() + usize::from(self.io.is_some())
    }

    /// Drop everything. Only after the channel has been closed.
    pub fn release(self) {}
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Out-of-band operations on the session channel.
#[async_trait]
pub trait ChannelControl: Send + Sync {
    /// Check the transport; an error means the peer is gone.
    async fn keepalive(&self) -> anyhow::Result<()>;

    /// Write to the extended-data (stderr) stream.
    async fn write_stderr(&self, data: &[u8]) -> anyhow::Result<()>;

    async fn exit_status(&self, code: u32) -> anyhow::Result<()>;

    /// Send EOF and close the channel.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Failures that end a session before or while its process is started.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("user '{0}' does not exist on this device")]
    UnknownUser(String),

    #[error("session has no pseudo-terminal")]
    NoTerminal,

    #[error("pseudo-terminal allocation failed: {0}")]
    Pty(#[source] io::Error),

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to wait for process: {0}")]
    Wait(#[source] io::Error),

    #[error("session channel is no longer available")]
    ChannelUnavailable,
}

/// Collaborators shared by both session handlers.
pub struct HandlerContext {
    pub users: Arc<dyn UserDirectory>,
    pub registry: Arc<ProcessRegistry>,
    pub accounting: Arc<dyn LoginAccounting>,
    /// Shell used instead of the account's registered shell.
    pub shell_override: Option<String>,
    /// Device name exported to spawned processes.
    pub device: String,
    /// How long to keep draining output after the process exits.
    pub output_drain_timeout: Duration,
}

impl HandlerContext {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        registry: Arc<ProcessRegistry>,
        accounting: Arc<dyn LoginAccounting>,
        device: impl Into<String>,
    ) -> Self {
        Self {
            users,
            registry,
            accounting,
            shell_override: None,
            device: device.into(),
            output_drain_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_shell_override(mut self, shell: Option<String>) -> Self {
        self.shell_override = shell.filter(|s| !s.is_empty());
        self
    }

    pub fn with_output_drain_timeout(mut self, timeout: Duration) -> Self {
        self.output_drain_timeout = timeout;
        self
    }

    pub(crate) fn home_or_root(home: &std::path::Path) -> PathBuf {
        if home.is_dir() {
            home.to_path_buf()
        } else {
            PathBuf::from("/")
        }
    }
}
