//! Session reconciliation.
//!
//! After a successful poll, the ids reported by the machine are compared
//! with the sessions already known for it. Every known session starts out
//! marked for removal; each reported id clears the mark on its session,
//! creating the session if it is new; whatever is still marked at the end
//! is removed. The marks live only for the duration of one call.

use std::collections::BTreeSet;

use super::model::{Machine, MachineId, Session, SessionRef};
use super::timers::TimerKey;
use super::{Engine, MonitorEvent};

/// What one reconciliation pass changed.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Sessions created in this pass, in the order their ids were first seen.
    pub created: Vec<SessionRef>,
    /// Sessions detached from the machine in this pass.
    pub removed: Vec<Session>,
}

impl ReconcileOutcome {
    /// True if the machine's session set changed.
    pub fn changed(&self) -> bool {
        !self.created.is_empty() || !self.removed.is_empty()
    }
}

/// Brings `machine`'s sessions in line with `ids`.
///
/// `next_generation` is advanced for every session created. Removed
/// sessions are handed back so that the caller can release what they own.
pub fn reconcile(machine: &mut Machine, ids: &[u32], next_generation: &mut u64) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();
    let mut pending_removal: BTreeSet<u32> = machine.sessions.keys().copied().collect();

    for &id in ids {
        if !machine.sessions.contains_key(&id) {
            let generation = *next_generation;
            *next_generation += 1;

            let session = Session::new(&machine.name, id, generation);
            outcome.created.push(session.session_ref(machine.id));
            machine.sessions.insert(id, session);

            tracing::info!(machine = %machine.name, session_id = id, "Session appeared");
        }
        pending_removal.remove(&id);
    }

    for id in pending_removal {
        if let Some(session) = machine.sessions.remove(&id) {
            tracing::info!(machine = %machine.name, session_id = id, "Session disappeared");
            outcome.removed.push(session);
        }
    }

    outcome
}

impl Engine {
    /// Applies a freshly parsed session list to a machine.
    ///
    /// New sessions get a preview timer and an immediate capture; removed
    /// sessions are torn down. Returns true if the session set changed.
    pub fn apply_session_list(&mut self, machine_id: MachineId, ids: &[u32]) -> bool {
        let Some(machine) = self.machines.get_mut(machine_id.0) else {
            return false;
        };

        let outcome = reconcile(machine, ids, &mut self.next_generation);
        if !outcome.changed() {
            return false;
        }

        for session in outcome.removed {
            self.destroy_session(machine_id, session);
        }

        for target in outcome.created {
            self.timers
                .arm(TimerKey::Preview(target), self.settings.preview_interval);
            self.refresh_preview(target);
        }

        if let Some(machine) = self.machines.get(machine_id.0) {
            self.emit(MonitorEvent::SessionsChanged {
                machine: machine.name.clone(),
                sessions: machine.session_snapshots(),
            });
        }

        true
    }
}
