//! Persistence scheduling state.
//!
//! Tracks what still has to be written, whether a write is in flight, and
//! which delay the next write should wait for. The transitions are pure so
//! they can be tested without a runtime; the sync client owns the single
//! state value behind a mutex and drives timers around it.

use std::time::Duration;

use tabula_store::RecordsDiff;

/// Engine tunables. The defaults match interactive-editor behavior; tests
/// shrink the delays to keep runs fast.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period between a change and the write that persists it.
    pub debounce: Duration,
    /// Delay before retrying after a failed write.
    pub retry_delay: Duration,
    /// A newer-schema peer seen before this much uptime is treated as a
    /// restart loop and halts the session instead of requesting a reload.
    pub min_uptime_for_reload: Duration,
    /// Session snapshots kept per document; older ones are pruned at startup.
    pub session_retention: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            retry_delay: Duration::from_secs(10),
            min_uptime_for_reload: Duration::from_secs(5),
            session_retention: 10,
        }
    }
}

/// Lifecycle of a sync client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Normal operation: broadcasting, persisting.
    Running,
    /// A newer-schema peer owns the document now. Broadcasting and
    /// persistence are stopped so we cannot clobber newer state; the owner
    /// is expected to restart the session.
    AwaitingReload,
    /// Unresolvable schema mismatch. Everything is stopped; a blocking error
    /// has been surfaced.
    Halted,
}

/// One entry in the pending-write queue.
#[derive(Debug, Clone)]
pub enum PendingChange {
    /// Document-scope changes to fold into the next write.
    Diff(RecordsDiff),
    /// Session-scope state changed; the next write must refresh the session
    /// snapshot even though the document map is untouched.
    SessionOnly,
}

/// What the next storage write should do.
#[derive(Debug, Clone)]
pub enum WriteMode {
    /// Replace the stored record map with the full document state.
    Full,
    /// Apply the squashed queued diffs. May be empty when only session
    /// state changed.
    Incremental(RecordsDiff),
}

/// Mutable persistence state for one client.
///
/// Invariants:
/// - at most one write runs at a time (`is_persisting`)
/// - the queue is drained atomically when a write begins; changes arriving
///   during the write accumulate for the next one
/// - a failed write forces the next write to be full
#[derive(Debug, Default)]
pub struct PersistenceState {
    status: StatusField,
    pending: Vec<PendingChange>,
    is_persisting: bool,
    should_do_full_write: bool,
    last_write_failed: bool,
    timer_armed: bool,
}

// Default for ClientStatus would be misleading on its own; keep the field
// wrapper private to this module.
#[derive(Debug)]
struct StatusField(ClientStatus);

impl Default for StatusField {
    fn default() -> Self {
        Self(ClientStatus::Running)
    }
}

impl PersistenceState {
    /// Fresh state: running, nothing queued, first write is a full snapshot.
    pub fn new() -> Self {
        Self {
            should_do_full_write: true,
            ..Default::default()
        }
    }

    pub fn status(&self) -> ClientStatus {
        self.status.0
    }

    pub fn is_persisting(&self) -> bool {
        self.is_persisting
    }

    pub fn last_write_failed(&self) -> bool {
        self.last_write_failed
    }

    /// Anything waiting to reach storage?
    pub fn has_work(&self) -> bool {
        self.should_do_full_write || !self.pending.is_empty()
    }

    // ========================================================================
    // Queueing
    // ========================================================================

    pub fn enqueue_diff(&mut self, diff: RecordsDiff) {
        self.pending.push(PendingChange::Diff(diff));
    }

    pub fn enqueue_session_change(&mut self) {
        self.pending.push(PendingChange::SessionOnly);
    }

    /// Force the next write to replace the whole stored record map.
    pub fn request_full_write(&mut self) {
        self.should_do_full_write = true;
    }

    // ========================================================================
    // Write lifecycle
    // ========================================================================

    /// Try to start a write. Returns `None` when one is already in flight,
    /// the client is no longer running, or there is nothing to do.
    ///
    /// On `Some`, the queue has been drained and `is_persisting` is set;
    /// the caller must finish with [`finish_write`].
    ///
    /// [`finish_write`]: PersistenceState::finish_write
    pub fn begin_write(&mut self) -> Option<WriteMode> {
        if self.is_persisting || self.status.0 != ClientStatus::Running || !self.has_work() {
            return None;
        }
        self.is_persisting = true;
        let drained = std::mem::take(&mut self.pending);

        if self.should_do_full_write {
            // the full snapshot covers everything that was queued
            self.should_do_full_write = false;
            return Some(WriteMode::Full);
        }

        let diffs: Vec<&RecordsDiff> = drained
            .iter()
            .filter_map(|change| match change {
                PendingChange::Diff(diff) => Some(diff),
                PendingChange::SessionOnly => None,
            })
            .collect();
        Some(WriteMode::Incremental(RecordsDiff::squash(diffs)))
    }

    /// Record the outcome of the in-flight write. Failure flips the client
    /// into full-resync mode and selects the retry delay.
    pub fn finish_write(&mut self, success: bool) {
        self.is_persisting = false;
        if success {
            self.last_write_failed = false;
        } else {
            self.last_write_failed = true;
            self.should_do_full_write = true;
        }
    }

    // ========================================================================
    // Timer
    // ========================================================================

    /// Arm the debounce timer. Returns false when one is already pending.
    pub fn arm_timer(&mut self) -> bool {
        if self.timer_armed {
            return false;
        }
        self.timer_armed = true;
        true
    }

    pub fn timer_fired(&mut self) {
        self.timer_armed = false;
    }

    /// Delay the next armed timer should wait for.
    pub fn next_delay(&self, config: &SyncConfig) -> Duration {
        if self.last_write_failed {
            config.retry_delay
        } else {
            config.debounce
        }
    }

    // ========================================================================
    // Status transitions
    // ========================================================================

    /// Stop broadcasting and persisting because a newer-schema peer owns the
    /// document. Returns true only on the first call, so the reload signal
    /// fires exactly once.
    pub fn request_reload(&mut self) -> bool {
        if self.status.0 != ClientStatus::Running {
            return false;
        }
        self.status.0 = ClientStatus::AwaitingReload;
        true
    }

    /// Stop everything after an unresolvable schema mismatch. Returns true
    /// only on the transition out of `Running`.
    pub fn halt(&mut self) -> bool {
        if self.status.0 != ClientStatus::Running {
            return false;
        }
        self.status.0 = ClientStatus::Halted;
        true
    }
}
