//! External process management.
//!
//! Every command is launched by a [`CommandRunner`] and tracked by the
//! [`ProcessRegistry`], which tags it with an operation kind and an owner
//! and routes its output and exit events back to that owner.

pub mod registry;
pub mod runner;

pub use registry::{
    HandleId, OperationKind, ProcessEvent, ProcessPayload, ProcessRegistry, Routed,
};
pub use runner::{
    run_once, CommandRunner, ProcessEventSink, SpawnError, TokioRunner, SIGNALLED_EXIT_CODE,
};
