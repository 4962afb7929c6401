//! Per-IP task lifecycle table.
//!
//! Reconciliation needs a race-free answer to "may I start a task for this
//! IP right now?". Each entry is either running or stopping; absence means
//! no task exists. A task may only be started when the entry is absent, so
//! a re-discovered device cannot gain a second task while the first is
//! still winding down. The only transition out of stopping is removal,
//! performed by the exiting task's completion callback.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Stopping,
}

struct Entry {
    state: TaskState,
    cancel: CancellationToken,
}

/// Mutex-guarded map of IP → task entry. The orchestrator is the only
/// writer apart from the completion callback each task fires on exit.
pub struct TaskTable {
    name: &'static str,
    inner: Mutex<HashMap<Ipv4Addr, Entry>>,
}

impl TaskTable {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Claim the slot for `ip`. Returns the new task's cancel token (a child
    /// of `parent`) if the slot was absent, or `None` while a task is
    /// running or still stopping.
    pub fn try_begin(&self, ip: Ipv4Addr, parent: &CancellationToken) -> Option<CancellationToken> {
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(&ip) {
            return None;
        }
        let cancel = parent.child_token();
        map.insert(
            ip,
            Entry {
                state: TaskState::Running,
                cancel: cancel.clone(),
            },
        );
        Some(cancel)
    }

    /// Transition a running task to stopping and cancel it. Idempotent:
    /// already-stopping and absent entries are untouched.
    pub fn request_stop(&self, ip: Ipv4Addr) {
        let mut map = self.inner.lock().unwrap();
        if let Some(entry) = map.get_mut(&ip) {
            if entry.state == TaskState::Running {
                entry.state = TaskState::Stopping;
                entry.cancel.cancel();
            }
        }
    }

    /// Completion callback: the task for `ip` has fully exited. Clears the
    /// slot whatever its state — a panicked task never saw `request_stop`
    /// but must still free the slot for the next reconcile cycle.
    pub fn finished(&self, ip: Ipv4Addr) {
        self.inner.lock().unwrap().remove(&ip);
    }

    pub fn state(&self, ip: Ipv4Addr) -> Option<TaskState> {
        self.inner.lock().unwrap().get(&ip).map(|e| e.state)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// IPs with a live (running) task, for reconciliation diffs. Entries in
    /// stopping state are deliberately excluded: their device may already be
    /// gone, and they need no further action.
    pub fn running_ips(&self) -> Vec<Ipv4Addr> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.state == TaskState::Running)
            .map(|(ip, _)| *ip)
            .collect()
    }

    /// Cancel every task, marking each running entry as stopping. Used once
    /// at shutdown.
    pub fn stop_all(&self) {
        let mut map = self.inner.lock().unwrap();
        for entry in map.values_mut() {
            if entry.state == TaskState::Running {
                entry.state = TaskState::Stopping;
            }
            entry.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(198, 51, 100, last)
    }

    #[test]
    fn begin_claims_slot_once() {
        let table = TaskTable::new("monitor");
        let root = CancellationToken::new();

        let first = table.try_begin(ip(5), &root);
        assert!(first.is_some());
        assert!(
            table.try_begin(ip(5), &root).is_none(),
            "second begin for a running ip must be refused"
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn no_start_while_stopping() {
        let table = TaskTable::new("monitor");
        let root = CancellationToken::new();

        let token = table.try_begin(ip(5), &root).unwrap();
        table.request_stop(ip(5));
        assert!(token.is_cancelled());
        assert_eq!(table.state(ip(5)), Some(TaskState::Stopping));

        // The prune-then-rediscover race: reconcile runs again before the
        // task has exited. It must not start a second task.
        assert!(table.try_begin(ip(5), &root).is_none());
        assert!(table.try_begin(ip(5), &root).is_none());

        // Once the first task's completion callback fires, a fresh start
        // is allowed.
        table.finished(ip(5));
        assert!(table.try_begin(ip(5), &root).is_some());
        assert_eq!(table.state(ip(5)), Some(TaskState::Running));
    }

    #[test]
    fn stopping_never_returns_to_running() {
        let table = TaskTable::new("monitor");
        let root = CancellationToken::new();

        table.try_begin(ip(5), &root).unwrap();
        table.request_stop(ip(5));
        // A second stop request is a no-op, not a state change.
        table.request_stop(ip(5));
        assert_eq!(table.state(ip(5)), Some(TaskState::Stopping));
    }

    #[test]
    fn running_ips_excludes_stopping_entries() {
        let table = TaskTable::new("monitor");
        let root = CancellationToken::new();

        table.try_begin(ip(1), &root).unwrap();
        table.try_begin(ip(2), &root).unwrap();
        table.request_stop(ip(1));

        let running = table.running_ips();
        assert_eq!(running, vec![ip(2)]);
        assert_eq!(table.len(), 2, "stopping entry still occupies its slot");
    }

    #[test]
    fn stop_all_cancels_every_token() {
        let table = TaskTable::new("monitor");
        let root = CancellationToken::new();

        let t1 = table.try_begin(ip(1), &root).unwrap();
        let t2 = table.try_begin(ip(2), &root).unwrap();
        table.stop_all();
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
        assert!(table.running_ips().is_empty());
    }

    #[test]
    fn tokens_inherit_parent_cancellation() {
        let table = TaskTable::new("monitor");
        let root = CancellationToken::new();

        let token = table.try_begin(ip(1), &root).unwrap();
        root.cancel();
        assert!(token.is_cancelled());
    }
}
