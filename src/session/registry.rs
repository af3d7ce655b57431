//! Table of processes spawned for live sessions.
//!
//! Each connection owns one slot, opened when the connection is accepted and
//! removed by the close path. A process can only be registered into an open,
//! vacant slot, so a session that loses the race against its connection's
//! close is refused instead of left running. Both removal paths (the session
//! handler after `wait()` and the close path) go through the same lock, so
//! exactly one of them observes the entry. The lock is never held across an
//! await or a signal delivery.

use std::collections::HashMap;
use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::SessionId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} already has a registered process")]
    AlreadyRegistered(SessionId),

    #[error("connection for session {0} is closed")]
    Closed(SessionId),
}

/// Handle to a process the registry believes is running.
///
/// Termination is a request to the task that owns the `Child`; only that task
/// signals the process, and only while the child is still unreaped, so a
/// recycled pid is never hit.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: CancellationToken,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            kill: CancellationToken::new(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn terminate(&self) {
        self.kill.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.kill.is_cancelled()
    }

    fn kill_signal(&self) -> CancellationToken {
        self.kill.clone()
    }
}

/// Session id to process table. `None` marks an open connection with no process.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    table: Mutex<HashMap<SessionId, Option<ProcessHandle>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Option<ProcessHandle>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the slot of a newly accepted connection. No-op if already open.
    pub fn open_session(&self, id: SessionId) {
        self.lock().entry(id).or_insert(None);
    }

    pub fn is_open(&self, id: &SessionId) -> bool {
        self.lock().contains_key(id)
    }

    /// Insert a handle into an open, vacant slot.
    pub fn register(&self, id: SessionId, handle: ProcessHandle) -> Result<(), RegistryError> {
        let mut table = self.lock();
        match table.get_mut(&id) {
            None => Err(RegistryError::Closed(id)),
            Some(Some(_)) => Err(RegistryError::AlreadyRegistered(id)),
            Some(slot) => {
                *slot = Some(handle);
                Ok(())
            }
        }
    }

    /// Close the slot and ask its process, if any, to die. Later
    /// registrations for `id` are refused. Returns whether a process was signalled.
    pub fn kill_and_forget(&self, id: &SessionId) -> bool {
        let removed = self.lock().remove(id).flatten();
        match removed {
            Some(handle) => {
                debug!(session_id = %id, pid = ?handle.pid(), "Killing session process");
                handle.terminate();
                true
            }
            None => false,
        }
    }

    /// Vacate the slot without signalling. Returns whether a process was removed.
    pub fn unregister(&self, id: &SessionId) -> bool {
        self.lock()
            .get_mut(id)
            .and_then(Option::take)
            .is_some()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        matches!(self.lock().get(id), Some(Some(_)))
    }

    pub fn pid(&self, id: &SessionId) -> Option<u32> {
        self.lock().get(id).and_then(|slot| slot.as_ref()?.pid())
    }

    /// Number of registered processes.
    pub fn len(&self) -> usize {
        self.lock().values().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered sessions and their pids, in id order.
    pub fn snapshot(&self) -> Vec<(SessionId, Option<u32>)> {
        let mut entries: Vec<_> = self
            .lock()
            .iter()
            .filter_map(|(id, slot)| slot.as_ref().map(|handle| (id.clone(), handle.pid())))
            .collect();
        entries.sort();
        entries
    }

    /// Register a freshly spawned child and take over waiting on it.
    ///
    /// If the registration is refused the child's process group is killed
    /// before the error is returned.
    pub fn track(
        self: &Arc<Self>,
        id: SessionId,
        mut child: Child,
    ) -> Result<TrackedChild, RegistryError> {
        let handle = ProcessHandle::new(child.id());
        let kill = handle.kill_signal();
        if let Err(e) = self.register(id.clone(), handle) {
            warn!(session_id = %id, pid = ?child.id(), error = %e, "Refusing session process");
            kill_group(&mut child);
            reap_in_background(child);
            return Err(e);
        }
        Ok(TrackedChild {
            id,
            child,
            kill,
            registry: Arc::clone(self),
            released: false,
        })
    }
}

/// SIGKILL the child's process group, falling back to the child alone.
fn kill_group(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    // Spawned processes lead their own session, so the pgid is the pid.
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid, error = %e, "killpg failed, killing child directly");
        if let Err(e) = child.start_kill() {
            warn!(pid, error = %e, "Failed to kill session process");
        }
    }
}

fn reap_in_background(mut child: Child) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            let _ = child.wait().await;
        });
    }
}

/// A registered child process. Dropping it unregisters the session.
pub struct TrackedChild {
    id: SessionId,
    child: Child,
    kill: CancellationToken,
    registry: Arc<ProcessRegistry>,
    released: bool,
}

impl TrackedChild {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for exit. A kill request from the registry takes down the whole
    /// process group before the final wait.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        tokio::select! {
            status = self.child.wait() => return status,
            _ = self.kill.cancelled() => {}
        }
        kill_group(&mut self.child);
        self.child.wait().await
    }

    /// Remove the registry entry. No-op if the close path already removed it.
    pub fn release(mut self) {
        self.unregister();
    }

    fn unregister(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.unregister(&self.id);
        }
    }
}

impl Drop for TrackedChild {
    fn drop(&mut self) {
        self.unregister();
    }
}
