//! Periodic session list polling.

use tracing::{debug, info, trace, warn};

use super::model::{MachineId, Owner};
use super::{Engine, MonitorEvent};
use crate::process::{HandleId, OperationKind};

impl Engine {
    /// Launches the list command for `machine_id`.
    ///
    /// Does nothing while a previous poll of the same machine is still
    /// running. Returns true if a poll was started.
    pub fn poll_machine(&mut self, machine_id: MachineId) -> bool {
        let Some(machine) = self.machines.get_mut(machine_id.0) else {
            return false;
        };

        if let Some(handle) = machine.outstanding_poll {
            trace!(machine = %machine.name, handle = %handle, "Poll still running, skipping");
            return false;
        }

        let command = match self.commands.list_sessions(&machine.name) {
            Ok(command) => command,
            Err(e) => {
                warn!(machine = %machine.name, error = %e, "Cannot build list command");
                return false;
            }
        };

        match self
            .registry
            .spawn(&command, OperationKind::Poll, Owner::Machine(machine_id))
        {
            Ok(handle) => {
                machine.output_buffer.clear();
                machine.outstanding_poll = Some(handle);
                true
            }
            Err(e) => {
                warn!(machine = %machine.name, error = %e, "Failed to start poll");
                false
            }
        }
    }

    /// Appends list output to the machine's buffer.
    pub(crate) fn on_poll_output(&mut self, machine_id: MachineId, handle: HandleId, bytes: &[u8]) {
        let Some(machine) = self.machines.get_mut(machine_id.0) else {
            return;
        };
        if machine.outstanding_poll == Some(handle) {
            machine.output_buffer.extend_from_slice(bytes);
        }
    }

    /// Finishes a poll: a clean exit replaces the machine's session set,
    /// anything else leaves it as it was.
    pub(crate) fn on_poll_exit(&mut self, machine_id: MachineId, handle: HandleId, code: i32) {
        let Some(machine) = self.machines.get_mut(machine_id.0) else {
            return;
        };
        if machine.outstanding_poll != Some(handle) {
            debug!(machine = %machine.name, handle = %handle, "Exit of superseded poll");
            return;
        }

        machine.outstanding_poll = None;
        let output = std::mem::take(&mut machine.output_buffer);

        if code != 0 {
            machine.consecutive_failures = machine.consecutive_failures.saturating_add(1);
            let failures = machine.consecutive_failures;
            let name = machine.name.clone();

            if failures == 1 {
                warn!(machine = %name, exit_code = code, "Session list failed");
            } else {
                debug!(machine = %name, exit_code = code, failures, "Session list still failing");
            }

            self.emit(MonitorEvent::PollFailed {
                machine: name,
                exit_code: code,
                consecutive_failures: failures,
            });
            return;
        }

        if machine.consecutive_failures > 0 {
            info!(
                machine = %machine.name,
                failures = machine.consecutive_failures,
                "Session list recovered"
            );
            machine.consecutive_failures = 0;
        }

        let ids = self.parser.parse(&output);
        trace!(machine = %machine.name, sessions = ids.len(), "Session list received");
        self.apply_session_list(machine_id, &ids);
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::test_support::harness;
    use crate::engine::MonitorEvent;
    use crate::process::ProcessEvent;

    #[tokio::test]
    async fn test_poll_is_not_reentrant() {
        let mut h = harness(&["M1"]);
        let m1 = h.machine_id("M1");

        assert!(h.engine.poll_machine(m1));
        let handle = h.engine.machine(m1).unwrap().outstanding_poll.unwrap();
        h.engine
            .handle_process_event(ProcessEvent::output(handle, b"LIVE session at :4".to_vec()));

        assert!(!h.engine.poll_machine(m1));
        assert_eq!(h.runner.launch_count(), 1);

        // The running poll and its partial output are untouched.
        let machine = h.engine.machine(m1).unwrap();
        assert_eq!(machine.outstanding_poll, Some(handle));
        assert_eq!(machine.output_buffer, b"LIVE session at :4".to_vec());
        assert!(machine.sessions.is_empty());
        assert_eq!(machine.consecutive_failures, 0);
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_poll_renders_list_command() {
        let mut h = harness(&["box-a"]);
        let id = h.machine_id("box-a");
        h.engine.poll_machine(id);

        let (_, command) = h.runner.launched().pop().unwrap();
        assert_eq!(command.program, "ssh");
        assert_eq!(command.args, vec!["box-a", "xpra", "list"]);
    }

    #[tokio::test]
    async fn test_poll_output_accumulates_across_chunks() {
        let mut h = harness(&["M1"]);
        let m1 = h.machine_id("M1");
        h.engine.poll_machine(m1);
        let handle = h.engine.machine(m1).unwrap().outstanding_poll.unwrap();

        // The marker is split between two chunks.
        h.engine
            .handle_process_event(ProcessEvent::output(handle, b"LIVE sess".to_vec()));
        h.engine
            .handle_process_event(ProcessEvent::output(handle, b"ion at :12\n".to_vec()));
        h.engine.handle_process_event(ProcessEvent::exited(handle, 0));

        assert_eq!(h.session_ids("M1"), vec![12]);
        assert!(!h.engine.machine(m1).unwrap().poll_pending());
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_sessions() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :17 LIVE session at :42", 0);
        h.drain_events();

        h.poll("M1", "ssh: connect to host M1: Connection refused", 255);

        assert_eq!(h.session_ids("M1"), vec![17, 42]);
        let events = h.drain_events();
        assert_eq!(
            events,
            vec![MonitorEvent::PollFailed {
                machine: "M1".to_string(),
                exit_code: 255,
                consecutive_failures: 1,
            }]
        );
    }

    #[tokio::test]
    async fn test_signalled_poll_counts_as_failure() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :5", 0);
        h.poll("M1", "", crate::process::SIGNALLED_EXIT_CODE);

        assert_eq!(h.session_ids("M1"), vec![5]);
    }

    #[tokio::test]
    async fn test_failure_counter_resets_on_success() {
        let mut h = harness(&["M1"]);
        let m1 = h.machine_id("M1");

        h.poll("M1", "", 1);
        h.poll("M1", "", 1);
        assert_eq!(h.engine.machine(m1).unwrap().consecutive_failures, 2);

        h.poll("M1", "", 0);
        assert_eq!(h.engine.machine(m1).unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_allows_next_tick() {
        let mut h = harness(&["M1"]);
        let m1 = h.machine_id("M1");

        h.runner.fail_next(1);
        assert!(!h.engine.poll_machine(m1));
        assert!(!h.engine.machine(m1).unwrap().poll_pending());

        assert!(h.engine.poll_machine(m1));
    }

    #[tokio::test]
    async fn test_output_starts_fresh_for_each_poll() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :1", 1);
        h.poll("M1", "LIVE session at :2", 0);

        assert_eq!(h.session_ids("M1"), vec![2]);
    }

    #[tokio::test]
    async fn test_machines_are_polled_independently() {
        let mut h = harness(&["M1", "M2"]);
        let m1 = h.machine_id("M1");
        let m2 = h.machine_id("M2");

        assert!(h.engine.poll_machine(m1));
        assert!(h.engine.poll_machine(m2));

        h.poll_pending_exit("M2", "LIVE session at :8", 0);
        assert_eq!(h.session_ids("M2"), vec![8]);
        assert!(h.session_ids("M1").is_empty());
        assert!(h.engine.machine(m1).unwrap().poll_pending());
    }

    #[tokio::test]
    async fn test_no_marker_means_no_sessions() {
        let mut h = harness(&["M1"]);
        h.poll("M1", "LIVE session at :3", 0);
        h.poll("M1", "Found 0 sessions\n", 0);

        assert!(h.session_ids("M1").is_empty());
    }
}
