//! Monitor orchestrator.
//!
//! This module provides the `MonitorOrchestrator` that prepares the preview
//! directory, builds the engine from the configuration and runs it on its
//! own task. Everything else talks to the engine through the control handle
//! and the event channels exposed here.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::engine::{ControlHandle, ControlRequest, Engine, MonitorEvent};
use crate::process::{CommandRunner, TokioRunner};

/// Capacity of the monitor event channel.
const MONITOR_EVENT_CAPACITY: usize = 256;

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Building the engine.
    Starting,
    /// Engine task is running.
    Running,
    /// Waiting for the engine task to finish.
    ShuttingDown,
}

/// Lifecycle events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The engine task ended abnormally.
    Error { message: String },
}

/// Runs the monitor engine and hands out ways to reach it.
pub struct MonitorOrchestrator {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    state: Arc<RwLock<OrchestratorState>>,
    control: ControlHandle,
    control_rx: Option<mpsc::Receiver<ControlRequest>>,
    monitor_tx: broadcast::Sender<MonitorEvent>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    shutdown_token: CancellationToken,
    engine_task: Option<JoinHandle<()>>,
}

impl MonitorOrchestrator {
    /// Creates an orchestrator launching real processes.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_runner(config, Arc::new(TokioRunner::new()))
    }

    /// Creates an orchestrator launching processes through `runner`.
    pub fn with_runner(config: Config, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let (control, control_rx) = ControlHandle::channel();
        let (monitor_tx, _) = broadcast::channel(MONITOR_EVENT_CAPACITY);
        let (event_tx, _) = broadcast::channel(16);

        Ok(Self {
            config,
            runner,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            control,
            control_rx: Some(control_rx),
            monitor_tx,
            event_tx,
            shutdown_token: CancellationToken::new(),
            engine_task: None,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Returns a receiver for session and preview updates.
    pub fn monitor_events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.monitor_tx.subscribe()
    }

    /// Returns a handle for sending commands to the engine.
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Returns the configuration the engine is built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts the engine task.
    ///
    /// An orchestrator can be started once.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        if let Err(e) = self.spawn_engine() {
            *self.state.write().await = OrchestratorState::Stopped;
            self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
            return Err(e);
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(
            machines = self.config.machines.names.len(),
            preview_dir = %self.config.monitor.preview_dir.display(),
            "Monitor orchestrator started"
        );
        Ok(())
    }

    /// Stops the engine and waits for it to clean up.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping monitor orchestrator...");
        self.shutdown_token.cancel();

        if let Some(task) = self.engine_task.take() {
            if let Err(e) = task.await {
                error!("Engine task failed: {}", e);
                self.emit_event(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Monitor orchestrator stopped");
        Ok(())
    }

    fn spawn_engine(&mut self) -> Result<()> {
        if self.control_rx.is_none() {
            anyhow::bail!("Orchestrator cannot be restarted");
        }

        let preview_dir = &self.config.monitor.preview_dir;
        std::fs::create_dir_all(preview_dir).with_context(|| {
            format!("Failed to create preview directory: {}", preview_dir.display())
        })?;

        let (engine, inbox) = Engine::new(
            &self.config,
            Arc::clone(&self.runner),
            self.monitor_tx.clone(),
        )
        .context("Failed to create monitor engine")?;

        let control_rx = self
            .control_rx
            .take()
            .context("Orchestrator cannot be restarted")?;
        let shutdown = self.shutdown_token.clone();
        self.engine_task = Some(tokio::spawn(engine.run(inbox, control_rx, shutdown)));
        debug!("Spawned engine task");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}
