//! User-initiated session commands.
//!
//! Attach is tracked: while its process runs, the session reports an
//! attach in progress and a second attach is refused. Detach and kill are
//! fire-and-forget; their exit is only logged.

use std::fmt;
use std::str::FromStr;

use protocol::ProtocolError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::model::{Machine, Owner, Session, SessionRef};
use super::{Engine, MonitorEvent};
use crate::process::{HandleId, OperationKind, SpawnError};

/// Errors returned for a session command.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("unknown machine: {0}")]
    UnknownMachine(String),

    #[error("no session {id} on {machine}")]
    UnknownSession { machine: String, id: u32 },

    #[error("already attaching to session {id} on {machine}")]
    AttachPending { machine: String, id: u32 },

    #[error("invalid command: {0}")]
    Command(#[from] ProtocolError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

/// A command a user can issue against a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
    Attach,
    Detach,
    Kill,
}

impl SessionAction {
    /// Name used in logs and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionAction::Attach => "attach",
            SessionAction::Detach => "detach",
            SessionAction::Kill => "kill",
        }
    }

    fn operation(self) -> OperationKind {
        match self {
            SessionAction::Attach => OperationKind::Attach,
            SessionAction::Detach => OperationKind::Detach,
            SessionAction::Kill => OperationKind::Kill,
        }
    }
}

impl fmt::Display for SessionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "attach" => Ok(SessionAction::Attach),
            "detach" => Ok(SessionAction::Detach),
            "kill" | "stop" => Ok(SessionAction::Kill),
            other => Err(format!("unknown session action: {}", other)),
        }
    }
}

/// Finds the live session `target` refers to.
fn lookup(machines: &mut [Machine], target: SessionRef) -> Result<&mut Session, DispatchError> {
    let machine = machines
        .get_mut(target.machine.0)
        .ok_or_else(|| DispatchError::UnknownMachine(target.machine.to_string()))?;
    let name = machine.name.clone();

    machine
        .resolve_mut(target)
        .ok_or(DispatchError::UnknownSession {
            machine: name,
            id: target.id,
        })
}

impl Engine {
    /// Resolves `machine` and `id` to the session a command should act on.
    pub fn resolve_target(&self, machine: &str, id: u32) -> Result<SessionRef, DispatchError> {
        if self.machine_by_name(machine).is_none() {
            return Err(DispatchError::UnknownMachine(machine.to_string()));
        }
        self.find_session(machine, id)
            .ok_or_else(|| DispatchError::UnknownSession {
                machine: machine.to_string(),
                id,
            })
    }

    /// Runs `action` against `target`.
    pub fn dispatch(
        &mut self,
        action: SessionAction,
        target: SessionRef,
    ) -> Result<HandleId, DispatchError> {
        match action {
            SessionAction::Attach => self.attach(target),
            SessionAction::Detach => self.detach(target),
            SessionAction::Kill => self.kill(target),
        }
    }

    /// Opens an interactive viewer on the session.
    pub fn attach(&mut self, target: SessionRef) -> Result<HandleId, DispatchError> {
        let session = lookup(&mut self.machines, target)?;

        if session.outstanding_attach.is_some() {
            return Err(DispatchError::AttachPending {
                machine: session.machine_name.clone(),
                id: session.id,
            });
        }

        let command = self.commands.attach(&session.machine_name, session.id)?;
        let handle = self
            .registry
            .spawn(&command, OperationKind::Attach, Owner::Session(target))?;
        session.outstanding_attach = Some(handle);

        info!(machine = %session.machine_name, session_id = session.id, "Attaching");

        let event = MonitorEvent::AttachChanged {
            machine: session.machine_name.clone(),
            id: session.id,
            attach_pending: true,
        };
        self.emit(event);
        Ok(handle)
    }

    /// Asks the session to drop its viewers.
    ///
    /// The attach indicator is cleared right away; the pending attach
    /// process, if any, is no longer tracked.
    pub fn detach(&mut self, target: SessionRef) -> Result<HandleId, DispatchError> {
        let handle = self.fire_and_forget(SessionAction::Detach, target)?;

        let session = lookup(&mut self.machines, target)?;
        if let Some(attach) = session.outstanding_attach.take() {
            let event = MonitorEvent::AttachChanged {
                machine: session.machine_name.clone(),
                id: session.id,
                attach_pending: false,
            };
            self.registry.release(attach);
            self.emit(event);
        }

        Ok(handle)
    }

    /// Terminates the session on its machine.
    ///
    /// The session stays listed until a poll no longer reports it.
    pub fn kill(&mut self, target: SessionRef) -> Result<HandleId, DispatchError> {
        self.fire_and_forget(SessionAction::Kill, target)
    }

    fn fire_and_forget(
        &mut self,
        action: SessionAction,
        target: SessionRef,
    ) -> Result<HandleId, DispatchError> {
        let session = lookup(&mut self.machines, target)?;

        let command = match action {
            SessionAction::Detach => self.commands.detach(&session.machine_name, session.id)?,
            SessionAction::Kill => self.commands.kill(&session.machine_name, session.id)?,
            SessionAction::Attach => self.commands.attach(&session.machine_name, session.id)?,
        };

        let handle = self
            .registry
            .spawn(&command, action.operation(), Owner::Session(target))?;

        info!(
            machine = %session.machine_name,
            session_id = session.id,
            action = %action,
            "Session command sent"
        );
        Ok(handle)
    }

    /// Handles the exit of an attach. Any status ends it.
    pub(crate) fn on_attach_exit(&mut self, target: SessionRef, handle: HandleId, code: i32) {
        let Ok(session) = lookup(&mut self.machines, target) else {
            return;
        };
        if session.outstanding_attach != Some(handle) {
            return;
        }
        session.outstanding_attach = None;

        if code == 0 {
            info!(machine = %session.machine_name, session_id = session.id, "Viewer closed");
        } else {
            warn!(
                machine = %session.machine_name,
                session_id = session.id,
                exit_code = code,
                "Viewer exited with an error"
            );
        }

        let event = MonitorEvent::AttachChanged {
            machine: session.machine_name.clone(),
            id: session.id,
            attach_pending: false,
        };
        self.emit(event);
    }

    /// Logs the exit of a detach or kill.
    pub(crate) fn on_command_exit(&mut self, target: SessionRef, kind: OperationKind, code: i32) {
        if code == 0 {
            debug!(session_id = target.id, kind = %kind, "Session command finished");
        } else {
            warn!(session_id = target.id, kind = %kind, exit_code = code, "Session command failed");
        }
    }
}
