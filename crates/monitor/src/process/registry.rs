//! Registry of launched processes.
//!
//! The registry assigns a [`HandleId`] to each command it launches and
//! remembers which operation it performs and who owns it. Events arriving
//! from the runner are resolved against that table. Once a handle has been
//! released, either on exit or because its owner went away, any further
//! event for it is dropped without reaching a handler.
//!
//! A handle can be released together with a file the process writes. The
//! file is deleted again when the process exits, since the process may
//! recreate it after its owner cleaned up.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use protocol::CommandLine;

use super::runner::{CommandRunner, ProcessEventSink, SpawnError};

/// Identifies one launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// Builds a handle from a raw number.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a launched process is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Poll,
    Screenshot,
    Attach,
    Detach,
    Kill,
}

impl OperationKind {
    /// Name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Poll => "poll",
            OperationKind::Screenshot => "screenshot",
            OperationKind::Attach => "attach",
            OperationKind::Detach => "detach",
            OperationKind::Kill => "kill",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something a process reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessPayload {
    /// A chunk of output.
    Output(Vec<u8>),
    /// The process ended with this exit code. Always the last event.
    Exited(i32),
}

/// An event reported by a runner for one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    /// Process the event belongs to.
    pub handle: HandleId,
    /// What happened.
    pub payload: ProcessPayload,
}

impl ProcessEvent {
    /// An output chunk for `handle`.
    pub fn output(handle: HandleId, bytes: Vec<u8>) -> Self {
        Self {
            handle,
            payload: ProcessPayload::Output(bytes),
        }
    }

    /// The exit of `handle` with `code`.
    pub fn exited(handle: HandleId, code: i32) -> Self {
        Self {
            handle,
            payload: ProcessPayload::Exited(code),
        }
    }
}

/// An event resolved to the operation and owner it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed<O> {
    /// Process the event belongs to.
    pub handle: HandleId,
    /// Operation the process performs.
    pub kind: OperationKind,
    /// Owner recorded at spawn time.
    pub owner: O,
    /// What happened.
    pub payload: ProcessPayload,
}

#[derive(Debug)]
struct Entry<O> {
    kind: OperationKind,
    owner: O,
}

/// Tracks launched processes and routes their events.
///
/// The owner type is opaque to the registry; it only needs to be copied
/// into routed events and compared when an owner releases its handles.
pub struct ProcessRegistry<O> {
    runner: Arc<dyn CommandRunner>,
    sink: ProcessEventSink,
    next_id: u64,
    entries: HashMap<HandleId, Entry<O>>,
    /// Files to delete when a released process exits.
    orphaned_files: HashMap<HandleId, PathBuf>,
}

impl<O> ProcessRegistry<O>
where
    O: Copy + PartialEq + fmt::Debug,
{
    /// Creates a registry launching through `runner` and reporting into `sink`.
    pub fn new(runner: Arc<dyn CommandRunner>, sink: ProcessEventSink) -> Self {
        Self {
            runner,
            sink,
            next_id: 1,
            entries: HashMap::new(),
            orphaned_files: HashMap::new(),
        }
    }

    /// Launches `command` on behalf of `owner`.
    ///
    /// On failure nothing is tracked.
    pub fn spawn(
        &mut self,
        command: &CommandLine,
        kind: OperationKind,
        owner: O,
    ) -> Result<HandleId, SpawnError> {
        let handle = HandleId(self.next_id);
        self.next_id += 1;

        // Registered before launch so that no event can precede the entry.
        self.entries.insert(handle, Entry { kind, owner });

        if let Err(e) = self.runner.launch(handle, command, self.sink.clone()) {
            self.entries.remove(&handle);
            return Err(e);
        }

        tracing::debug!(
            handle = %handle,
            kind = %kind,
            owner = ?owner,
            command = %command,
            "Launched process"
        );

        Ok(handle)
    }

    /// Resolves an event to its owner.
    ///
    /// Returns `None` for handles that are unknown or already released. An
    /// exit event releases its handle.
    pub fn route(&mut self, event: ProcessEvent) -> Option<Routed<O>> {
        let ProcessEvent { handle, payload } = event;

        let (kind, owner) = match &payload {
            ProcessPayload::Exited(_) => {
                let Some(entry) = self.entries.remove(&handle) else {
                    if let Some(path) = self.orphaned_files.remove(&handle) {
                        remove_orphaned_file(handle, &path);
                    }
                    return None;
                };
                (entry.kind, entry.owner)
            }
            ProcessPayload::Output(_) => {
                let entry = self.entries.get(&handle)?;
                (entry.kind, entry.owner)
            }
        };

        Some(Routed {
            handle,
            kind,
            owner,
            payload,
        })
    }

    /// Stops routing events for `handle`. The process keeps running.
    pub fn release(&mut self, handle: HandleId) -> bool {
        self.entries.remove(&handle).is_some()
    }

    /// Releases `handle` and deletes `file` once the process exits.
    ///
    /// Does nothing for a handle that is not tracked, as its exit has
    /// already been routed.
    pub fn release_with_file(&mut self, handle: HandleId, file: PathBuf) -> bool {
        if self.entries.remove(&handle).is_none() {
            return false;
        }
        self.orphaned_files.insert(handle, file);
        true
    }

    /// Released processes whose file still has to be deleted at exit.
    pub fn pending_file_cleanups(&self) -> usize {
        self.orphaned_files.len()
    }

    /// Releases every handle owned by `owner`, returning how many there were.
    pub fn release_owner(&mut self, owner: &O) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.owner != *owner);
        before - self.entries.len()
    }

    /// Releases everything. Files already handed to
    /// [`ProcessRegistry::release_with_file`] are still deleted at exit.
    pub fn release_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Whether events for `handle` are still routed.
    pub fn is_tracked(&self, handle: HandleId) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Operation performed by a tracked handle.
    pub fn kind_of(&self, handle: HandleId) -> Option<OperationKind> {
        self.entries.get(&handle).map(|entry| entry.kind)
    }

    /// Number of processes whose events are still routed.
    pub fn outstanding(&self) -> usize {
        self.entries.len()
    }
}

fn remove_orphaned_file(handle: HandleId, path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::trace!(handle = %handle, path = %path.display(), "Removed orphaned file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::debug!(
            handle = %handle,
            path = %path.display(),
            error = %e,
            "Failed to remove orphaned file"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::runner::testing::RecordingRunner;
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestOwner {
        A,
        B,
    }

    fn command(program: &str) -> CommandLine {
        CommandLine {
            program: program.to_string(),
            args: vec![],
        }
    }

    fn registry() -> (ProcessRegistry<TestOwner>, RecordingRunner) {
        let runner = RecordingRunner::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        (ProcessRegistry::new(Arc::new(runner.clone()), tx), runner)
    }

    #[test]
    fn test_spawn_assigns_distinct_handles() {
        let (mut registry, runner) = registry();

        let h1 = registry.spawn(&command("one"), OperationKind::Poll, TestOwner::A).unwrap();
        let h2 = registry.spawn(&command("two"), OperationKind::Kill, TestOwner::B).unwrap();

        assert_ne!(h1, h2);
        assert_eq!(registry.outstanding(), 2);
        assert_eq!(registry.kind_of(h2), Some(OperationKind::Kill));
        assert_eq!(runner.launch_count(), 2);
    }

    #[test]
    fn test_spawn_failure_tracks_nothing() {
        let (mut registry, runner) = registry();
        runner.fail_next(1);

        let result = registry.spawn(&command("x"), OperationKind::Poll, TestOwner::A);
        assert!(matches!(result, Err(SpawnError::Rejected(_))));
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn test_route_output_then_exit() {
        let (mut registry, _runner) = registry();
        let handle = registry
            .spawn(&command("x"), OperationKind::Poll, TestOwner::A)
            .unwrap();

        let routed = registry
            .route(ProcessEvent::output(handle, b"abc".to_vec()))
            .unwrap();
        assert_eq!(routed.owner, TestOwner::A);
        assert_eq!(routed.kind, OperationKind::Poll);
        assert!(registry.is_tracked(handle));

        let routed = registry.route(ProcessEvent::exited(handle, 0)).unwrap();
        assert_eq!(routed.payload, ProcessPayload::Exited(0));
        assert!(!registry.is_tracked(handle));

        // Exit is terminal.
        assert!(registry.route(ProcessEvent::exited(handle, 0)).is_none());
    }

    #[test]
    fn test_route_unknown_handle_is_dropped() {
        let (mut registry, _runner) = registry();
        assert!(registry
            .route(ProcessEvent::exited(HandleId::from_raw(99), 1))
            .is_none());
    }

    #[test]
    fn test_released_handle_events_are_dropped() {
        let (mut registry, _runner) = registry();
        let handle = registry
            .spawn(&command("x"), OperationKind::Attach, TestOwner::A)
            .unwrap();

        assert!(registry.release(handle));
        assert!(!registry.release(handle));
        assert!(registry
            .route(ProcessEvent::output(handle, b"late".to_vec()))
            .is_none());
        assert!(registry.route(ProcessEvent::exited(handle, 0)).is_none());
    }

    #[test]
    fn test_release_owner_only_touches_that_owner() {
        let (mut registry, _runner) = registry();
        let a1 = registry.spawn(&command("a1"), OperationKind::Screenshot, TestOwner::A).unwrap();
        let a2 = registry.spawn(&command("a2"), OperationKind::Attach, TestOwner::A).unwrap();
        let b1 = registry.spawn(&command("b1"), OperationKind::Poll, TestOwner::B).unwrap();

        assert_eq!(registry.release_owner(&TestOwner::A), 2);
        assert!(!registry.is_tracked(a1));
        assert!(!registry.is_tracked(a2));
        assert!(registry.is_tracked(b1));
        assert!(registry.route(ProcessEvent::exited(a1, 0)).is_none());
    }

    #[test]
    fn test_release_all() {
        let (mut registry, _runner) = registry();
        registry.spawn(&command("a"), OperationKind::Poll, TestOwner::A).unwrap();
        registry.spawn(&command("b"), OperationKind::Poll, TestOwner::B).unwrap();

        assert_eq!(registry.release_all(), 2);
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn test_released_file_is_deleted_at_exit() {
        let (mut registry, _runner) = registry();
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("shot.png");
        let handle = registry
            .spawn(&command("shot"), OperationKind::Screenshot, TestOwner::A)
            .unwrap();

        assert!(registry.release_with_file(handle, file.clone()));
        assert!(!registry.is_tracked(handle));
        assert_eq!(registry.pending_file_cleanups(), 1);

        // The process writes its file after the owner went away.
        fs::write(&file, b"img").unwrap();
        assert!(registry
            .route(ProcessEvent::output(handle, b"late".to_vec()))
            .is_none());
        assert!(file.exists());

        assert!(registry.route(ProcessEvent::exited(handle, 0)).is_none());
        assert!(!file.exists());
        assert_eq!(registry.pending_file_cleanups(), 0);
    }

    #[test]
    fn test_release_with_file_survives_release_all() {
        let (mut registry, _runner) = registry();
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("shot.png");
        let handle = registry
            .spawn(&command("shot"), OperationKind::Screenshot, TestOwner::A)
            .unwrap();

        registry.release_with_file(handle, file.clone());
        registry.release_all();
        fs::write(&file, b"img").unwrap();

        registry.route(ProcessEvent::exited(handle, 1));
        assert!(!file.exists());
    }

    #[test]
    fn test_release_with_file_ignores_finished_handle() {
        let (mut registry, _runner) = registry();
        let handle = registry
            .spawn(&command("shot"), OperationKind::Screenshot, TestOwner::A)
            .unwrap();
        registry.route(ProcessEvent::exited(handle, 0)).unwrap();

        assert!(!registry.release_with_file(handle, PathBuf::from("/nonexistent/shot.png")));
        assert_eq!(registry.pending_file_cleanups(), 0);
    }
}
