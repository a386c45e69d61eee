//! Per-sync state machine.
//!
//! A sync runs at most one reconciliation pass or write-buffer flush at a
//! time. Requests that arrive while it is busy are remembered and replayed:
//! a pass request arms one retry timer, a flush request waits for the
//! running pass to finish.
//!
//! The machine is pure. [`SyncMachine::handle`] returns the action the
//! caller must perform, and the caller reports completion with another event.

/// Phase of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Nothing running, no retry armed.
    Idle,
    /// A reconciliation pass is running.
    Reconciling,
    /// The write buffer is being applied.
    Flushing,
    /// Nothing running, a deferred pass is waiting for its timer.
    Debounced,
}

impl SyncPhase {
    /// Returns true if a pass or flush is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncPhase::Reconciling | SyncPhase::Flushing)
    }

    /// Returns true if a pass may start right away.
    pub fn can_start_pass(&self) -> bool {
        matches!(self, SyncPhase::Idle)
    }
}

/// Something that happened to a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// A trigger, the client or a timer asked for a pass.
    PassRequested,
    /// The running pass ended, successfully or not.
    PassFinished,
    /// Client writes were buffered.
    FlushRequested,
    /// The write buffer is empty again.
    FlushFinished,
    /// The retry timer fired.
    RetryElapsed,
}

/// What the caller must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Run a reconciliation pass.
    StartPass,
    /// Apply the write buffer.
    StartFlush,
    /// Schedule a `RetryElapsed` event after the throttle.
    ArmRetry,
    /// Nothing to do.
    Nothing,
}

/// The state machine of one sync.
#[derive(Debug, Clone)]
pub struct SyncMachine {
    phase: SyncPhase,
    retry_armed: bool,
    flush_pending: bool,
}

impl SyncMachine {
    /// Creates an idle machine.
    pub fn new() -> Self {
        Self {
            phase: SyncPhase::Idle,
            retry_armed: false,
            flush_pending: false,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// True if a retry timer is armed.
    pub fn retry_armed(&self) -> bool {
        self.retry_armed
    }

    /// True if a flush waits for the running pass.
    pub fn flush_pending(&self) -> bool {
        self.flush_pending
    }

    /// Applies `event` and returns the action to perform.
    pub fn handle(&mut self, event: SyncEvent) -> SyncAction {
        use SyncAction::*;
        use SyncPhase::*;

        match (self.phase, event) {
            (Idle, SyncEvent::PassRequested) => {
                self.phase = Reconciling;
                StartPass
            }
            (Reconciling, SyncEvent::PassRequested) => self.arm_retry(),
            // The pass that follows every flush covers this request.
            (Flushing, SyncEvent::PassRequested) => Nothing,
            // The armed timer will run it.
            (Debounced, SyncEvent::PassRequested) => Nothing,

            (Reconciling, SyncEvent::PassFinished) => {
                if self.flush_pending {
                    self.flush_pending = false;
                    self.phase = Flushing;
                    StartFlush
                } else {
                    self.phase = if self.retry_armed { Debounced } else { Idle };
                    Nothing
                }
            }
            (_, SyncEvent::PassFinished) => Nothing,

            (Idle | Debounced, SyncEvent::FlushRequested) => {
                self.phase = Flushing;
                StartFlush
            }
            (Reconciling, SyncEvent::FlushRequested) => {
                self.flush_pending = true;
                Nothing
            }
            // The running flush drains the buffer until it is empty.
            (Flushing, SyncEvent::FlushRequested) => Nothing,

            (Flushing, SyncEvent::FlushFinished) => {
                self.phase = Reconciling;
                StartPass
            }
            (_, SyncEvent::FlushFinished) => Nothing,

            (_, SyncEvent::RetryElapsed) => {
                self.retry_armed = false;
                match self.phase {
                    Idle | Debounced => {
                        self.phase = Reconciling;
                        StartPass
                    }
                    Reconciling => self.arm_retry(),
                    Flushing => Nothing,
                }
            }
        }
    }

    fn arm_retry(&mut self) -> SyncAction {
        if self.retry_armed {
            SyncAction::Nothing
        } else {
            self.retry_armed = true;
            SyncAction::ArmRetry
        }
    }
}

impl Default for SyncMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_checks() {
        assert!(SyncPhase::Idle.can_start_pass());
        assert!(!SyncPhase::Debounced.can_start_pass());
        assert!(!SyncPhase::Reconciling.can_start_pass());

        assert!(SyncPhase::Reconciling.is_active());
        assert!(SyncPhase::Flushing.is_active());
        assert!(!SyncPhase::Idle.is_active());
        assert!(!SyncPhase::Debounced.is_active());
    }

    #[test]
    fn simple_pass() {
        let mut m = SyncMachine::new();
        assert_eq!(m.handle(SyncEvent::PassRequested), SyncAction::StartPass);
        assert_eq!(m.phase(), SyncPhase::Reconciling);
        assert_eq!(m.handle(SyncEvent::PassFinished), SyncAction::Nothing);
        assert_eq!(m.phase(), SyncPhase::Idle);
    }

    #[test]
    fn busy_requests_collapse_into_one_retry() {
        let mut m = SyncMachine::new();
        m.handle(SyncEvent::PassRequested);

        assert_eq!(m.handle(SyncEvent::PassRequested), SyncAction::ArmRetry);
        assert_eq!(m.handle(SyncEvent::PassRequested), SyncAction::Nothing);
        assert_eq!(m.handle(SyncEvent::PassRequested), SyncAction::Nothing);

        assert_eq!(m.handle(SyncEvent::PassFinished), SyncAction::Nothing);
        assert_eq!(m.phase(), SyncPhase::Debounced);
        assert_eq!(m.handle(SyncEvent::PassRequested), SyncAction::Nothing);

        assert_eq!(m.handle(SyncEvent::RetryElapsed), SyncAction::StartPass);
        assert_eq!(m.phase(), SyncPhase::Reconciling);
        assert!(!m.retry_armed());
    }

    #[test]
    fn retry_while_still_busy_rearms() {
        let mut m = SyncMachine::new();
        m.handle(SyncEvent::PassRequested);
        m.handle(SyncEvent::PassRequested);
        assert_eq!(m.handle(SyncEvent::RetryElapsed), SyncAction::ArmRetry);
        assert!(m.retry_armed());
    }

    #[test]
    fn flush_waits_for_running_pass() {
        let mut m = SyncMachine::new();
        m.handle(SyncEvent::PassRequested);
        assert_eq!(m.handle(SyncEvent::FlushRequested), SyncAction::Nothing);
        assert!(m.flush_pending());

        assert_eq!(m.handle(SyncEvent::PassFinished), SyncAction::StartFlush);
        assert_eq!(m.phase(), SyncPhase::Flushing);
        assert!(!m.flush_pending());

        // Requests during a flush are covered by the pass that follows it.
        assert_eq!(m.handle(SyncEvent::PassRequested), SyncAction::Nothing);
        assert_eq!(m.handle(SyncEvent::FlushRequested), SyncAction::Nothing);

        assert_eq!(m.handle(SyncEvent::FlushFinished), SyncAction::StartPass);
        assert_eq!(m.phase(), SyncPhase::Reconciling);
        assert_eq!(m.handle(SyncEvent::PassFinished), SyncAction::Nothing);
        assert_eq!(m.phase(), SyncPhase::Idle);
    }

    #[test]
    fn flush_from_idle_and_debounced() {
        let mut m = SyncMachine::new();
        assert_eq!(m.handle(SyncEvent::FlushRequested), SyncAction::StartFlush);

        let mut m = SyncMachine::new();
        m.handle(SyncEvent::PassRequested);
        m.handle(SyncEvent::PassRequested);
        m.handle(SyncEvent::PassFinished);
        assert_eq!(m.phase(), SyncPhase::Debounced);
        assert_eq!(m.handle(SyncEvent::FlushRequested), SyncAction::StartFlush);
        // The armed timer fires during the flush and is absorbed.
        assert_eq!(m.handle(SyncEvent::RetryElapsed), SyncAction::Nothing);
        assert_eq!(m.handle(SyncEvent::FlushFinished), SyncAction::StartPass);
    }

    #[test]
    fn stray_completions_are_ignored() {
        let mut m = SyncMachine::new();
        assert_eq!(m.handle(SyncEvent::PassFinished), SyncAction::Nothing);
        assert_eq!(m.handle(SyncEvent::FlushFinished), SyncAction::Nothing);
        assert_eq!(m.phase(), SyncPhase::Idle);
    }
}
