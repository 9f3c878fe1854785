//! # Deskwatch Monitor Library
//!
//! This crate watches remote desktop sessions running on a set of machines
//! and lets a user attach to, detach from, or stop them.
//!
//! ## Overview
//!
//! - **Polling**: each machine's session list is fetched on a fixed interval
//! - **Reconciliation**: sessions appear and disappear as the lists change
//! - **Previews**: every session gets a periodically refreshed screenshot
//! - **Commands**: attach, detach and kill are dispatched on request
//!
//! All external work is done by launching commands; nothing blocks the
//! engine task while they run.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Monitor Orchestrator                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │                       Engine                          │    │
//! │  │  poller ─► reconcile ─► preview       dispatch        │    │
//! │  └──────────────────────────────────────────────────────┘    │
//! │        ▲ ticks              ▲ process events    ▲ control     │
//! │  ┌───────────┐      ┌──────────────────┐   ┌────────────┐    │
//! │  │  Timers   │      │ Process Registry │   │  Control   │    │
//! │  └───────────┘      │  + Command Runner│   │  Handle    │    │
//! │                     └──────────────────┘   └────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use monitor::{Config, MonitorOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = MonitorOrchestrator::new(config)?;
//!     let mut events = orchestrator.monitor_events();
//!     orchestrator.start().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`process`]: Command launching and process tracking
//! - [`engine`]: Machines, sessions and everything that changes them
//! - [`orchestrator`]: Runs the engine on its own task

pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod process;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};

pub use engine::{
    ControlError, ControlHandle, DispatchError, Engine, MachineSnapshot, MonitorEvent,
    PreviewError, SessionAction, SessionSnapshot,
};

pub use process::{run_once, CommandRunner, SpawnError, TokioRunner};

pub use orchestrator::{MonitorOrchestrator, OrchestratorEvent, OrchestratorState};
