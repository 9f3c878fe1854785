//! The session monitoring engine.
//!
//! The engine owns every machine and session and is driven by a single
//! task. Three kinds of input reach it through channels: process events
//! from the runner, timer ticks, and control requests. Each input is
//! handled to completion before the next one is looked at, so no state is
//! shared and nothing is locked.
//!
//! ```text
//!   timer tick ──► poll_machine ──► registry.spawn(list)
//!                                        │
//!   process events ◄─────────────────────┘
//!        │ output: append to machine buffer
//!        │ exit 0: parse ──► reconcile ──► create/destroy sessions
//!        │                                   └─► capture_preview
//!        ▼
//!   changed(machine) ──► MonitorEvent broadcast
//! ```

pub mod control;
pub mod dispatch;
pub mod model;
pub mod poller;
pub mod preview;
pub mod reconcile;
pub mod timers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use protocol::{CommandSet, SessionListParser};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{Config, ConfigError};
use crate::process::{
    CommandRunner, OperationKind, ProcessEvent, ProcessPayload, ProcessRegistry, Routed,
};

pub use control::{ControlError, ControlHandle, ControlRequest};
pub use dispatch::{DispatchError, SessionAction};
pub use model::{
    Machine, MachineId, MachineSnapshot, Owner, Session, SessionRef, SessionSnapshot,
};
pub use preview::PreviewError;
pub use reconcile::{reconcile, ReconcileOutcome};
pub use timers::{TimerKey, Timers};

/// How long a stopping engine waits for running captures to exit.
const ORPHAN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A machine gained or lost sessions.
    SessionsChanged {
        machine: String,
        sessions: Vec<SessionSnapshot>,
    },
    /// A new preview image is available.
    PreviewUpdated {
        machine: String,
        id: u32,
        path: PathBuf,
    },
    /// An attach started or ended.
    AttachChanged {
        machine: String,
        id: u32,
        attach_pending: bool,
    },
    /// The list command failed; known sessions were left as they were.
    PollFailed {
        machine: String,
        exit_code: i32,
        consecutive_failures: u32,
    },
}

/// Timing and placement settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Time between two list commands on one machine.
    pub poll_interval: Duration,
    /// Time between two captures of one session.
    pub preview_interval: Duration,
    /// Directory preview files are allocated in.
    pub preview_dir: PathBuf,
}

impl EngineSettings {
    /// Takes the settings from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.machines.poll_interval(),
            preview_interval: config.machines.preview_interval(),
            preview_dir: config.monitor.preview_dir.clone(),
        }
    }
}

/// Receiving ends of the engine's internal channels.
pub struct EngineInbox {
    process_rx: mpsc::UnboundedReceiver<ProcessEvent>,
    tick_rx: mpsc::UnboundedReceiver<TimerKey>,
}

/// Owns all monitoring state.
pub struct Engine {
    settings: EngineSettings,
    commands: CommandSet,
    parser: SessionListParser,
    machines: Vec<Machine>,
    registry: ProcessRegistry<Owner>,
    timers: Timers,
    events: broadcast::Sender<MonitorEvent>,
    next_generation: u64,
}

impl Engine {
    /// Creates an engine for the machines listed in `config`.
    ///
    /// Nothing runs until [`Engine::start`] or [`Engine::run`] is called.
    pub fn new(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
        events: broadcast::Sender<MonitorEvent>,
    ) -> Result<(Self, EngineInbox), ConfigError> {
        config.validate()?;

        let (process_tx, process_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();

        let machines = config
            .machines
            .names
            .iter()
            .enumerate()
            .map(|(index, name)| Machine::new(MachineId(index), name))
            .collect();

        let engine = Self {
            settings: EngineSettings::from_config(config),
            commands: config.commands.clone(),
            parser: config.commands.parser()?,
            machines,
            registry: ProcessRegistry::new(runner, process_tx),
            timers: Timers::new(tick_tx, CancellationToken::new()),
            events,
            next_generation: 1,
        };

        Ok((engine, EngineInbox { process_rx, tick_rx }))
    }

    /// Returns the timing and placement settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Returns every machine in configured order.
    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    /// Looks up a machine by index.
    pub fn machine(&self, id: MachineId) -> Option<&Machine> {
        self.machines.get(id.0)
    }

    /// Looks up a machine by configured name.
    pub fn machine_by_name(&self, name: &str) -> Option<&Machine> {
        self.machines.iter().find(|machine| machine.name == name)
    }

    /// Resolves a machine name and session id to the current session.
    pub fn find_session(&self, machine: &str, id: u32) -> Option<SessionRef> {
        let machine = self.machine_by_name(machine)?;
        machine
            .session(id)
            .map(|session| session.session_ref(machine.id))
    }

    /// Resolves a session reference, if that incarnation still exists.
    pub fn session(&self, target: SessionRef) -> Option<&Session> {
        self.machine(target.machine)?.resolve(target)
    }

    /// Returns the state of every machine.
    pub fn snapshot(&self) -> Vec<MachineSnapshot> {
        self.machines.iter().map(Machine::snapshot).collect()
    }

    /// Number of processes whose results are still awaited.
    pub fn outstanding_processes(&self) -> usize {
        self.registry.outstanding()
    }

    /// Returns the running timers.
    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    /// Arms every poll timer and polls each machine once right away.
    pub fn start(&mut self) {
        let ids: Vec<MachineId> = self.machines.iter().map(|machine| machine.id).collect();

        if ids.is_empty() {
            warn!("No machines configured, nothing to monitor");
        }

        for id in ids {
            self.timers
                .arm(TimerKey::Poll(id), self.settings.poll_interval);
            self.poll_machine(id);
        }

        info!(
            machines = self.machines.len(),
            poll_interval = ?self.settings.poll_interval,
            preview_interval = ?self.settings.preview_interval,
            "Monitor engine started"
        );
    }

    /// Runs the engine until `shutdown` is cancelled.
    pub async fn run(
        mut self,
        mut inbox: EngineInbox,
        control_rx: mpsc::Receiver<ControlRequest>,
        shutdown: CancellationToken,
    ) {
        let mut control_rx = Some(control_rx);

        self.start();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Engine received shutdown signal");
                    break;
                }
                Some(event) = inbox.process_rx.recv() => self.handle_process_event(event),
                Some(key) = inbox.tick_rx.recv() => self.handle_tick(key),
                request = next_control(&mut control_rx) => {
                    match request {
                        Some(request) => self.handle_control(request),
                        None => debug!("Control channel closed"),
                    }
                }
            }
        }

        self.shutdown();
        self.drain_orphaned_captures(&mut inbox.process_rx).await;
    }

    /// Routes one process event to whoever is waiting for it.
    pub fn handle_process_event(&mut self, event: ProcessEvent) {
        let handle = event.handle;
        let Some(Routed {
            handle,
            kind,
            owner,
            payload,
        }) = self.registry.route(event)
        else {
            trace!(handle = %handle, "Dropping event for released process");
            return;
        };

        match (owner, payload) {
            (Owner::Machine(machine), ProcessPayload::Output(bytes)) => {
                self.on_poll_output(machine, handle, &bytes)
            }
            (Owner::Machine(machine), ProcessPayload::Exited(code)) => {
                self.on_poll_exit(machine, handle, code)
            }
            (Owner::Session(_), ProcessPayload::Output(bytes)) => {
                trace!(handle = %handle, kind = %kind, bytes = bytes.len(), "Ignoring output");
            }
            (Owner::Session(target), ProcessPayload::Exited(code)) => match kind {
                OperationKind::Screenshot => self.on_capture_exit(target, handle, code),
                OperationKind::Attach => self.on_attach_exit(target, handle, code),
                OperationKind::Detach | OperationKind::Kill => {
                    self.on_command_exit(target, kind, code)
                }
                OperationKind::Poll => {
                    warn!(handle = %handle, "Poll process owned by a session");
                }
            },
        }
    }

    /// Reacts to a timer tick.
    pub fn handle_tick(&mut self, key: TimerKey) {
        match key {
            TimerKey::Poll(machine) => {
                self.poll_machine(machine);
            }
            TimerKey::Preview(target) => {
                if self.session(target).is_some() {
                    self.refresh_preview(target);
                } else {
                    trace!(session_id = target.id, "Tick for removed session");
                }
            }
        }
    }

    /// Tears down a session that left its machine.
    ///
    /// Its timer stops, its processes stop being tracked (they are left to
    /// finish on their own) and its preview files are deleted. A capture
    /// still running may write its file again, so that file is deleted a
    /// second time when the capture exits.
    fn destroy_session(&mut self, machine: MachineId, session: Session) {
        let target = session.session_ref(machine);

        self.timers.disarm(TimerKey::Preview(target));
        if let Some(capture) = &session.outstanding_screenshot {
            self.registry
                .release_with_file(capture.handle, capture.path.clone());
        }
        let released = self.registry.release_owner(&Owner::Session(target));

        for path in session.owned_files() {
            preview::remove_preview_file(path);
        }

        debug!(
            machine = %session.machine_name,
            session_id = session.id,
            released,
            "Session destroyed"
        );
    }

    /// Stops all timers and forgets every in-flight process.
    pub fn shutdown(&mut self) {
        self.timers.shutdown();

        for index in 0..self.machines.len() {
            let machine = &mut self.machines[index];
            let id = machine.id;
            machine.outstanding_poll = None;
            machine.output_buffer.clear();
            let sessions = std::mem::take(&mut machine.sessions);
            for (_, session) in sessions {
                self.destroy_session(id, session);
            }
        }

        let in_flight = self.registry.release_all();
        info!(in_flight, "Monitor engine stopped");
    }

    /// Waits for disowned captures to exit so their files can be deleted.
    async fn drain_orphaned_captures(
        &mut self,
        process_rx: &mut mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        if self.registry.pending_file_cleanups() == 0 {
            return;
        }

        let registry = &mut self.registry;
        let drain = async {
            while registry.pending_file_cleanups() > 0 {
                match process_rx.recv().await {
                    Some(event) => {
                        registry.route(event);
                    }
                    None => break,
                }
            }
        };

        if tokio::time::timeout(ORPHAN_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(
                remaining = self.registry.pending_file_cleanups(),
                "Captures still running at shutdown, their previews may be left behind"
            );
        }
    }

    fn emit(&self, event: MonitorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Receives the next control request, or waits forever once the channel closed.
async fn next_control(
    rx: &mut Option<mpsc::Receiver<ControlRequest>>,
) -> Option<ControlRequest> {
    match rx {
        Some(inner) => {
            let request = inner.recv().await;
            if request.is_none() {
                *rx = None;
            }
            request
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers for driving an engine by hand.

    use super::*;
    use crate::process::runner::testing::RecordingRunner;
    use crate::process::HandleId;
    use tempfile::TempDir;

    pub struct Harness {
        pub engine: Engine,
        pub runner: RecordingRunner,
        pub events: broadcast::Receiver<MonitorEvent>,
        pub preview_dir: TempDir,
        _inbox: EngineInbox,
    }

    pub fn harness(machines: &[&str]) -> Harness {
        let preview_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.machines.names = machines.iter().map(|m| m.to_string()).collect();
        config.monitor.preview_dir = preview_dir.path().to_path_buf();

        let runner = RecordingRunner::new();
        let (tx, events) = broadcast::channel(64);
        let (engine, inbox) = Engine::new(&config, Arc::new(runner.clone()), tx).unwrap();

        Harness {
            engine,
            runner,
            events,
            preview_dir,
            _inbox: inbox,
        }
    }

    impl Harness {
        pub fn machine_id(&self, name: &str) -> MachineId {
            self.engine.machine_by_name(name).unwrap().id()
        }

        /// Starts a poll and completes it with `output` and `code`.
        pub fn poll(&mut self, name: &str, output: &str, code: i32) {
            let id = self.machine_id(name);
            assert!(self.engine.poll_machine(id), "poll did not start");
            self.poll_pending_exit(name, output, code);
        }

        /// Completes the poll already running for `name`.
        pub fn poll_pending_exit(&mut self, name: &str, output: &str, code: i32) {
            let id = self.machine_id(name);
            let handle = self.engine.machine(id).unwrap().outstanding_poll.unwrap();
            self.finish(handle, output, code);
        }

        pub fn apply_list(&mut self, name: &str, ids: &[u32]) -> bool {
            let id = self.machine_id(name);
            self.engine.apply_session_list(id, ids)
        }

        /// Handle of the capture currently running for a session.
        pub fn capture_handle(&self, name: &str, id: u32) -> Option<HandleId> {
            self.engine
                .machine_by_name(name)?
                .session(id)?
                .outstanding_screenshot
                .as_ref()
                .map(|capture| capture.handle)
        }

        /// Delivers output (if any) and the exit of `handle`.
        pub fn finish(&mut self, handle: HandleId, output: &str, code: i32) {
            if !output.is_empty() {
                self.engine
                    .handle_process_event(ProcessEvent::output(handle, output.as_bytes().to_vec()));
            }
            self.engine
                .handle_process_event(ProcessEvent::exited(handle, code));
        }

        pub fn session_ids(&self, name: &str) -> Vec<u32> {
            self.engine.machine_by_name(name).unwrap().session_ids()
        }

        pub fn drain_events(&mut self) -> Vec<MonitorEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        pub fn changed_events(&mut self) -> Vec<MonitorEvent> {
            self.drain_events()
                .into_iter()
                .filter(|event| matches!(event, MonitorEvent::SessionsChanged { .. }))
                .collect()
        }
    }
}
