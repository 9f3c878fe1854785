//! Session preview captures.
//!
//! Every capture writes into a freshly allocated file in the preview
//! directory. A session keeps showing its last good preview until a newer
//! capture succeeds; the file of a failed capture is deleted when the next
//! capture starts.

use std::io;
use std::path::{Path, PathBuf};

use protocol::ProtocolError;
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::model::{Capture, Owner, SessionRef};
use super::{Engine, MonitorEvent};
use crate::process::{HandleId, OperationKind, SpawnError};

/// Prefix of every preview file.
pub const PREVIEW_PREFIX: &str = "xpra_shot_";

/// Suffix of every preview file.
pub const PREVIEW_SUFFIX: &str = ".png";

/// Errors that can occur while starting a capture.
#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("failed to allocate preview file in {dir}: {source}")]
    Allocate {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid screenshot command: {0}")]
    Command(#[from] ProtocolError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

impl Engine {
    /// Starts a preview capture for `target`.
    ///
    /// Returns `Ok(None)` when the session no longer exists or a capture is
    /// already running for it.
    pub fn capture_preview(
        &mut self,
        target: SessionRef,
    ) -> Result<Option<HandleId>, PreviewError> {
        let Some(session) = self
            .machines
            .get_mut(target.machine.0)
            .and_then(|machine| machine.resolve_mut(target))
        else {
            return Ok(None);
        };

        if let Some(capture) = &session.outstanding_screenshot {
            trace!(session_id = target.id, handle = %capture.handle, "Capture still running");
            return Ok(None);
        }

        if let Some(orphan) = session.orphaned_preview.take() {
            remove_preview_file(&orphan);
        }

        let path = allocate_preview_file(&self.settings.preview_dir)?;

        let command = match self
            .commands
            .screenshot(&session.machine_name, session.id, &path)
        {
            Ok(command) => command,
            Err(e) => {
                remove_preview_file(&path);
                return Err(e.into());
            }
        };

        let handle = match self.registry.spawn(
            &command,
            OperationKind::Screenshot,
            Owner::Session(target),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                remove_preview_file(&path);
                return Err(e.into());
            }
        };

        session.outstanding_screenshot = Some(Capture { handle, path });
        Ok(Some(handle))
    }

    /// Starts a capture, logging instead of returning failures.
    pub(crate) fn refresh_preview(&mut self, target: SessionRef) {
        if let Err(e) = self.capture_preview(target) {
            warn!(session_id = target.id, error = %e, "Failed to start preview capture");
        }
    }

    /// Handles the exit of a capture.
    pub(crate) fn on_capture_exit(&mut self, target: SessionRef, handle: HandleId, code: i32) {
        let Some(session) = self
            .machines
            .get_mut(target.machine.0)
            .and_then(|machine| machine.resolve_mut(target))
        else {
            return;
        };

        let capture = match session.outstanding_screenshot.take() {
            Some(capture) if capture.handle == handle => capture,
            other => {
                session.outstanding_screenshot = other;
                debug!(session_id = target.id, handle = %handle, "Exit of superseded capture");
                return;
            }
        };

        if code != 0 {
            debug!(
                machine = %session.machine_name,
                session_id = session.id,
                exit_code = code,
                "Preview capture failed, keeping previous preview"
            );
            if let Some(stale) = session.orphaned_preview.replace(capture.path) {
                remove_preview_file(&stale);
            }
            return;
        }

        if let Some(previous) = session.preview_path.replace(capture.path.clone()) {
            if previous != capture.path {
                remove_preview_file(&previous);
            }
        }
        session.preview_available = true;

        let event = MonitorEvent::PreviewUpdated {
            machine: session.machine_name.clone(),
            id: session.id,
            path: capture.path,
        };
        self.emit(event);
    }
}

/// Creates an empty, uniquely named preview file inside `dir`.
fn allocate_preview_file(dir: &Path) -> Result<PathBuf, PreviewError> {
    let allocate_error = |source| PreviewError::Allocate {
        dir: dir.to_path_buf(),
        source,
    };

    let file = tempfile::Builder::new()
        .prefix(PREVIEW_PREFIX)
        .suffix(PREVIEW_SUFFIX)
        .tempfile_in(dir)
        .map_err(allocate_error)?;

    let (_, path) = file.keep().map_err(|e| allocate_error(e.error))?;
    Ok(path)
}

/// Deletes a preview file. A file that is already gone is not an error.
pub(crate) fn remove_preview_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => trace!(path = %path.display(), "Removed preview file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "Failed to remove preview file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::harness;
    use crate::engine::timers::TimerKey;

    fn preview_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn test_capture_allocates_unique_file() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :17", 0);

        let session = h.engine.machine_by_name("M1").unwrap().session(17).unwrap();
        let path = session.outstanding_screenshot.as_ref().unwrap().path.clone();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();

        assert!(name.starts_with(PREVIEW_PREFIX));
        assert!(name.ends_with(PREVIEW_SUFFIX));
        assert!(path.starts_with(h.preview_dir.path()));
        assert!(path.exists());

        let (_, command) = h.runner.last_matching("xpra screenshot").unwrap();
        assert_eq!(
            command.args,
            vec![
                "screenshot".to_string(),
                path.display().to_string(),
                "ssh://M1/17".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_successful_capture_publishes_preview() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :17", 0);
        h.drain_events();

        let handle = h.capture_handle("M1", 17).unwrap();
        h.finish(handle, "", 0);

        let session = h.engine.machine_by_name("M1").unwrap().session(17).unwrap();
        assert!(session.preview_available());
        assert!(!session.capture_pending());
        let path = session.preview_path().unwrap().clone();

        assert_eq!(
            h.drain_events(),
            vec![MonitorEvent::PreviewUpdated {
                machine: "M1".to_string(),
                id: 17,
                path,
            }]
        );
    }

    #[tokio::test]
    async fn test_newer_capture_replaces_old_file() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :1", 0);
        let target = h.engine.find_session("M1", 1).unwrap();

        let first = h.capture_handle("M1", 1).unwrap();
        h.finish(first, "", 0);
        let old = h.engine.session(target).unwrap().preview_path().unwrap().clone();

        h.engine.handle_tick(TimerKey::Preview(target));
        let second = h.capture_handle("M1", 1).unwrap();
        h.finish(second, "", 0);
        let new = h.engine.session(target).unwrap().preview_path().unwrap().clone();

        assert_ne!(old, new);
        assert!(!old.exists());
        assert!(new.exists());
        assert_eq!(preview_files(h.preview_dir.path()), vec![new]);
    }

    #[tokio::test]
    async fn test_failed_capture_keeps_previous_preview() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :1", 0);
        let target = h.engine.find_session("M1", 1).unwrap();

        let first = h.capture_handle("M1", 1).unwrap();
        h.finish(first, "", 0);
        let good = h.engine.session(target).unwrap().preview_path().unwrap().clone();

        h.engine.handle_tick(TimerKey::Preview(target));
        let failed = h.capture_handle("M1", 1).unwrap();
        h.finish(failed, "", 1);

        let session = h.engine.session(target).unwrap();
        assert!(session.preview_available());
        assert_eq!(session.preview_path(), Some(&good));
        let orphan = session.orphaned_preview.clone().unwrap();
        assert!(orphan.exists());

        // The next attempt cleans up after the failed one.
        h.engine.handle_tick(TimerKey::Preview(target));
        assert!(!orphan.exists());
        assert!(good.exists());
    }

    #[tokio::test]
    async fn test_failed_first_capture_leaves_no_preview() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :1", 0);

        let handle = h.capture_handle("M1", 1).unwrap();
        h.finish(handle, "", 1);

        let session = h.engine.machine_by_name("M1").unwrap().session(1).unwrap();
        assert!(!session.preview_available());
        assert!(session.preview_path().is_none());
    }

    #[tokio::test]
    async fn test_capture_is_not_reentrant() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :1", 0);
        let target = h.engine.find_session("M1", 1).unwrap();
        let launches = h.runner.launch_count();

        assert_eq!(h.engine.capture_preview(target).unwrap(), None);
        assert_eq!(h.runner.launch_count(), launches);
    }

    #[tokio::test]
    async fn test_spawn_failure_removes_new_file() {
        let mut h = harness(&["M1"]);

        // Creation of session 3 triggers a capture that fails to launch.
        h.runner.fail_next(1);
        h.apply_list("M1", &[3]);

        assert!(h.capture_handle("M1", 3).is_none());
        assert!(preview_files(h.preview_dir.path()).is_empty());

        let target = h.engine.find_session("M1", 3).unwrap();
        assert!(h.engine.capture_preview(target).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_allocation_failure_is_reported() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :1", 0);
        let target = h.engine.find_session("M1", 1).unwrap();
        let handle = h.capture_handle("M1", 1).unwrap();
        h.finish(handle, "", 0);

        h.engine.settings.preview_dir = h.preview_dir.path().join("missing");
        let err = h.engine.capture_preview(target).unwrap_err();
        assert!(matches!(err, PreviewError::Allocate { .. }));
    }

    #[tokio::test]
    async fn test_late_capture_after_removal_is_ignored() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :17", 0);
        let handle = h.capture_handle("M1", 17).unwrap();

        h.poll("M1", "", 0);
        h.drain_events();

        h.finish(handle, "", 0);
        assert!(h.drain_events().is_empty());
        assert!(preview_files(h.preview_dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_late_capture_does_not_reach_new_incarnation() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :17", 0);
        let stale = h.capture_handle("M1", 17).unwrap();

        h.poll("M1", "", 0);
        h.poll("M1", "LIVE session at :17", 0);
        h.drain_events();

        h.finish(stale, "", 0);

        let session = h.engine.machine_by_name("M1").unwrap().session(17).unwrap();
        assert!(!session.preview_available());
        assert!(session.capture_pending());
        assert!(h.drain_events().is_empty());
    }

    #[test]
    fn test_remove_missing_file_is_quiet() {
        let dir = tempfile::TempDir::new().unwrap();
        remove_preview_file(&dir.path().join("nothing.png"));
    }
}
