//! Machines and the sessions discovered on them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::process::HandleId;

/// Index of a machine inside the engine. Machines are never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineId(pub(crate) usize);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Refers to one incarnation of a session.
///
/// The generation changes every time a session is created, so a reference
/// taken before a session was removed never matches a later session that
/// happens to reuse the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionRef {
    /// Machine the session belongs to.
    pub machine: MachineId,
    /// Session id as reported by the list command.
    pub id: u32,
    /// Incarnation of the session.
    pub generation: u64,
}

/// Owner of a launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Machine(MachineId),
    Session(SessionRef),
}

/// A preview capture in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    /// Process writing the capture.
    pub handle: HandleId,
    /// File the capture writes into.
    pub path: PathBuf,
}

/// A remote desktop session.
#[derive(Debug)]
pub struct Session {
    pub(crate) machine_name: String,
    pub(crate) id: u32,
    pub(crate) generation: u64,
    pub(crate) preview_path: Option<PathBuf>,
    pub(crate) preview_available: bool,
    /// File left behind by a failed capture, deleted on the next attempt.
    pub(crate) orphaned_preview: Option<PathBuf>,
    pub(crate) outstanding_screenshot: Option<Capture>,
    pub(crate) outstanding_attach: Option<HandleId>,
}

impl Session {
    /// Creates a session with no preview and nothing outstanding.
    pub(crate) fn new(machine_name: &str, id: u32, generation: u64) -> Self {
        Self {
            machine_name: machine_name.to_string(),
            id,
            generation,
            preview_path: None,
            preview_available: false,
            orphaned_preview: None,
            outstanding_screenshot: None,
            outstanding_attach: None,
        }
    }

    /// Name of the machine the session runs on.
    pub fn machine_name(&self) -> &str {
        &self.machine_name
    }

    /// Session id as reported by the list command.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// File holding the last good preview, if any.
    pub fn preview_path(&self) -> Option<&PathBuf> {
        self.preview_path.as_ref()
    }

    /// Whether a preview has been captured successfully.
    pub fn preview_available(&self) -> bool {
        self.preview_available
    }

    /// Whether an attach is still running.
    pub fn attach_pending(&self) -> bool {
        self.outstanding_attach.is_some()
    }

    /// Whether a capture is still running.
    pub fn capture_pending(&self) -> bool {
        self.outstanding_screenshot.is_some()
    }

    /// Reference to this incarnation on `machine`.
    pub(crate) fn session_ref(&self, machine: MachineId) -> SessionRef {
        SessionRef {
            machine,
            id: self.id,
            generation: self.generation,
        }
    }

    /// Every preview file this session is responsible for.
    pub(crate) fn owned_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.preview_path
            .iter()
            .chain(self.orphaned_preview.iter())
            .chain(self.outstanding_screenshot.iter().map(|capture| &capture.path))
    }

    /// Presentation view of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        let attach_pending = self.attach_pending();
        SessionSnapshot {
            id: self.id,
            preview_available: self.preview_available,
            preview_path: self.preview_path.clone(),
            attach_pending,
            can_attach: !attach_pending,
            can_detach: attach_pending,
        }
    }
}

/// A machine and what was last learned about it.
#[derive(Debug)]
pub struct Machine {
    pub(crate) id: MachineId,
    pub(crate) name: String,
    pub(crate) sessions: BTreeMap<u32, Session>,
    pub(crate) output_buffer: Vec<u8>,
    pub(crate) outstanding_poll: Option<HandleId>,
    pub(crate) consecutive_failures: u32,
}

impl Machine {
    /// Creates a machine with no known sessions.
    pub(crate) fn new(id: MachineId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            sessions: BTreeMap::new(),
            output_buffer: Vec::new(),
            outstanding_poll: None,
            consecutive_failures: 0,
        }
    }

    /// Index of the machine in the engine.
    pub fn id(&self) -> MachineId {
        self.id
    }

    /// Configured machine name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up a session by id.
    pub fn session(&self, id: u32) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Known session ids, ascending.
    pub fn session_ids(&self) -> Vec<u32> {
        self.sessions.keys().copied().collect()
    }

    /// Whether a list command is running.
    pub fn poll_pending(&self) -> bool {
        self.outstanding_poll.is_some()
    }

    /// Looks up the session a reference points to, if it still exists.
    pub(crate) fn resolve(&self, session: SessionRef) -> Option<&Session> {
        self.sessions
            .get(&session.id)
            .filter(|s| s.generation == session.generation)
    }

    /// Mutable form of `resolve`.
    pub(crate) fn resolve_mut(&mut self, session: SessionRef) -> Option<&mut Session> {
        self.sessions
            .get_mut(&session.id)
            .filter(|s| s.generation == session.generation)
    }

    /// Presentation views of every session, ordered by id.
    pub fn session_snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions.values().map(Session::snapshot).collect()
    }

    /// Presentation view of the machine.
    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            name: self.name.clone(),
            poll_pending: self.poll_pending(),
            consecutive_failures: self.consecutive_failures,
            sessions: self.session_snapshots(),
        }
    }
}

/// What the presentation layer needs to show one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Session id.
    pub id: u32,
    /// Whether `preview_path` holds a captured image.
    pub preview_available: bool,
    /// Last good preview image.
    pub preview_path: Option<PathBuf>,
    /// Whether an attach is still running.
    pub attach_pending: bool,
    /// Whether attach should be offered.
    pub can_attach: bool,
    /// Whether detach should be offered.
    pub can_detach: bool,
}

/// What the presentation layer needs to show one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineSnapshot {
    /// Configured machine name.
    pub name: String,
    /// Whether a list command is running.
    pub poll_pending: bool,
    /// List commands that failed in a row.
    pub consecutive_failures: u32,
    /// Known sessions, ordered by id.
    pub sessions: Vec<SessionSnapshot>,
}
