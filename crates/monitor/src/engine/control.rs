//! Requests into a running engine.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::dispatch::{DispatchError, SessionAction};
use super::model::MachineSnapshot;
use super::Engine;
use crate::process::HandleId;

/// Capacity of the control channel.
pub const CONTROL_CHANNEL_CAPACITY: usize = 32;

/// A request handled on the engine task.
#[derive(Debug)]
pub enum ControlRequest {
    /// Run a session command.
    Session {
        action: SessionAction,
        machine: String,
        id: u32,
        reply: oneshot::Sender<Result<HandleId, DispatchError>>,
    },
    /// Poll one machine, or all of them, without waiting for the timer.
    PollNow {
        machine: Option<String>,
        reply: oneshot::Sender<Result<usize, DispatchError>>,
    },
    /// Report the current state.
    Snapshot {
        reply: oneshot::Sender<Vec<MachineSnapshot>>,
    },
}

/// Errors seen by a control client.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("monitor engine is not running")]
    EngineStopped,
}

/// Cloneable client side of the control channel.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
    /// Creates a handle and the receiver to pass to [`Engine::run`].
    pub fn channel() -> (Self, mpsc::Receiver<ControlRequest>) {
        let (tx, rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Runs `action` against a session and returns the launched handle.
    pub async fn dispatch(
        &self,
        action: SessionAction,
        machine: &str,
        id: u32,
    ) -> Result<HandleId, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlRequest::Session {
            action,
            machine: machine.to_string(),
            id,
            reply,
        })
        .await?;

        Ok(rx.await.map_err(|_| ControlError::EngineStopped)??)
    }

    /// Attaches a viewer to a session.
    pub async fn attach(&self, machine: &str, id: u32) -> Result<HandleId, ControlError> {
        self.dispatch(SessionAction::Attach, machine, id).await
    }

    /// Detaches viewers from a session.
    pub async fn detach(&self, machine: &str, id: u32) -> Result<HandleId, ControlError> {
        self.dispatch(SessionAction::Detach, machine, id).await
    }

    /// Terminates a session.
    pub async fn kill(&self, machine: &str, id: u32) -> Result<HandleId, ControlError> {
        self.dispatch(SessionAction::Kill, machine, id).await
    }

    /// Polls now. Returns how many polls were started.
    pub async fn poll_now(&self, machine: Option<&str>) -> Result<usize, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlRequest::PollNow {
            machine: machine.map(str::to_string),
            reply,
        })
        .await?;

        Ok(rx.await.map_err(|_| ControlError::EngineStopped)??)
    }

    /// Returns the state of every machine.
    pub async fn snapshot(&self) -> Result<Vec<MachineSnapshot>, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlRequest::Snapshot { reply }).await?;
        rx.await.map_err(|_| ControlError::EngineStopped)
    }

    async fn send(&self, request: ControlRequest) -> Result<(), ControlError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| ControlError::EngineStopped)
    }
}

impl Engine {
    /// Handles one control request and answers it.
    pub fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Session {
                action,
                machine,
                id,
                reply,
            } => {
                let result = self
                    .resolve_target(&machine, id)
                    .and_then(|target| self.dispatch(action, target));
                if reply.send(result).is_err() {
                    debug!(action = %action, "Control client went away");
                }
            }
            ControlRequest::PollNow { machine, reply } => {
                let result = self.poll_now(machine.as_deref());
                let _ = reply.send(result);
            }
            ControlRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn poll_now(&mut self, machine: Option<&str>) -> Result<usize, DispatchError> {
        let targets: Vec<_> = match machine {
            Some(name) => vec![self
                .machine_by_name(name)
                .ok_or_else(|| DispatchError::UnknownMachine(name.to_string()))?
                .id()],
            None => self.machines.iter().map(|machine| machine.id).collect(),
        };

        Ok(targets
            .into_iter()
            .filter(|&id| self.poll_machine(id))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::harness;

    #[tokio::test]
    async fn test_session_request_is_answered() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :17", 0);

        let (reply, rx) = oneshot::channel();
        h.engine.handle_control(ControlRequest::Session {
            action: SessionAction::Attach,
            machine: "M1".to_string(),
            id: 17,
            reply,
        });

        assert!(rx.await.unwrap().is_ok());
        let target = h.engine.find_session("M1", 17).unwrap();
        assert!(h.engine.session(target).unwrap().attach_pending());
    }

    #[tokio::test]
    async fn test_session_request_for_unknown_session() {
        let mut h = harness(&["M1"]);

        let (reply, rx) = oneshot::channel();
        h.engine.handle_control(ControlRequest::Session {
            action: SessionAction::Kill,
            machine: "M1".to_string(),
            id: 3,
            reply,
        });

        assert!(matches!(
            rx.await.unwrap(),
            Err(DispatchError::UnknownSession { id: 3, .. })
        ));
        assert_eq!(h.runner.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_poll_now() {
        let mut h = harness(&["M1", "M2"]);

        let (reply, rx) = oneshot::channel();
        h.engine.handle_control(ControlRequest::PollNow {
            machine: Some("M2".to_string()),
            reply,
        });
        assert_eq!(rx.await.unwrap().unwrap(), 1);

        // M2 is still polling, so only M1 starts.
        let (reply, rx) = oneshot::channel();
        h.engine.handle_control(ControlRequest::PollNow { machine: None, reply });
        assert_eq!(rx.await.unwrap().unwrap(), 1);

        let (reply, rx) = oneshot::channel();
        h.engine.handle_control(ControlRequest::PollNow {
            machine: Some("nope".to_string()),
            reply,
        });
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_snapshot_request() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :2 LIVE session at :1", 0);

        let (reply, rx) = oneshot::channel();
        h.engine.handle_control(ControlRequest::Snapshot { reply });

        let snapshot = rx.await.unwrap();
        assert_eq!(snapshot.len(), 1);
        let ids: Vec<u32> = snapshot[0].sessions.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_engine() {
        let (handle, rx) = ControlHandle::channel();
        drop(rx);

        assert!(matches!(
            handle.snapshot().await,
            Err(ControlError::EngineStopped)
        ));
        assert!(matches!(
            handle.attach("M1", 1).await,
            Err(ControlError::EngineStopped)
        ));
    }
}
