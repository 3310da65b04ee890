//! Preemption state machine
//!
//! Runs on the queue that owns a channel's preempting flag. When the head of
//! that queue has waited longer than `preempt_wait`, the machine raises the
//! flag so that streams of other channels yield dispatch turns. The flag is
//! held for at most `max_preempt_time` in total and dropped early once the
//! queue has caught up (empty, or head younger than `stop_preempt_threshold`).
//!
//! ```text
//!   Idle ──pending──▶ Waiting ──timer──▶ Checking ──old head──▶ Preempting
//!    ▲                                      │  └─young head: re-arm    │  ▲
//!    └──────── empty / caught up / budget spent ◀───────────────────────┘  │
//!                                                  descheduled ▼           │ rescheduled
//!                                          WouldPreemptDescheduled ────────┘
//! ```
//!
//! The machine is pure: it mirrors the timer as a deadline and the flag as a
//! bool, and every [`update`](PreemptionMachine::update) reports what the
//! caller has to do to the real timer and flag.

use gpuchan_core::PreemptionConfig;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Preemption states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PreemptionState {
    /// Nothing pending
    Idle,
    /// Messages pending, waiting `preempt_wait` before checking
    Waiting,
    /// Deciding whether the head is old enough to preempt
    Checking,
    /// Flag set, budget timer running
    Preempting,
    /// Would preempt but the stream is descheduled; flag clear, no timer
    WouldPreemptDescheduled,
}

impl fmt::Display for PreemptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Checking => "checking",
            Self::Preempting => "preempting",
            Self::WouldPreemptDescheduled => "would_preempt_descheduled",
        };
        f.write_str(name)
    }
}

/// Queue facts an update is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreemptionInputs {
    /// Current time
    pub now: Instant,
    /// Arrival time of the FIFO head, `None` when the FIFO is empty
    pub head_received: Option<Instant>,
    /// Whether the stream may currently run
    pub scheduled: bool,
}

/// What to do with the queue's timer after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// Leave the timer as it is
    Keep,
    /// (Re)start the timer to fire at the deadline
    Arm(Instant),
    /// Stop the timer
    Cancel,
}

/// Side effects of one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreemptionOutcome {
    /// Timer change
    pub timer: TimerCommand,
    /// New flag value, if it changed
    pub flag: Option<bool>,
}

impl PreemptionOutcome {
    /// An outcome with no side effects.
    pub const NONE: Self = Self { timer: TimerCommand::Keep, flag: None };

    #[must_use]
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

/// The per-queue preemption state machine.
#[derive(Debug, Clone)]
pub struct PreemptionMachine {
    config: PreemptionConfig,
    state: PreemptionState,
    timer_deadline: Option<Instant>,
    max_preemption_time: Duration,
    flag_set: bool,
}

impl PreemptionMachine {
    /// Create an idle machine.
    #[must_use]
    pub fn new(config: PreemptionConfig) -> Self {
        Self {
            state: PreemptionState::Idle,
            timer_deadline: None,
            max_preemption_time: config.max_preempt_time,
            flag_set: false,
            config,
        }
    }

    #[must_use]
    pub const fn state(&self) -> PreemptionState {
        self.state
    }

    /// Deadline of the running timer, `None` when no timer runs.
    #[must_use]
    pub const fn timer_deadline(&self) -> Option<Instant> {
        self.timer_deadline
    }

    /// Whether the machine holds the preempting flag.
    #[must_use]
    pub const fn flag_set(&self) -> bool {
        self.flag_set
    }

    /// Budget left for the current or next preemption.
    #[must_use]
    pub const fn remaining_budget(&self) -> Duration {
        self.max_preemption_time
    }

    /// Record that the running timer expired. Call before the update the
    /// expiry triggers.
    pub fn timer_fired(&mut self) {
        self.timer_deadline = None;
    }

    /// Advance the machine and report the resulting side effects.
    pub fn update(&mut self, inputs: PreemptionInputs) -> PreemptionOutcome {
        let timer_before = self.timer_deadline;
        let flag_before = self.flag_set;

        match self.state {
            PreemptionState::Idle => self.update_idle(inputs),
            PreemptionState::Waiting => self.update_waiting(inputs),
            PreemptionState::Checking => self.update_checking(inputs),
            PreemptionState::Preempting => self.update_preempting(inputs),
            PreemptionState::WouldPreemptDescheduled => {
                self.update_would_preempt_descheduled(inputs);
            },
        }

        let timer = match (timer_before, self.timer_deadline) {
            (before, after) if before == after => TimerCommand::Keep,
            (_, Some(deadline)) => TimerCommand::Arm(deadline),
            (Some(_), None) => TimerCommand::Cancel,
            (None, None) => TimerCommand::Keep,
        };
        let flag = (flag_before != self.flag_set).then_some(self.flag_set);
        PreemptionOutcome { timer, flag }
    }

    fn update_idle(&mut self, inputs: PreemptionInputs) {
        debug_assert!(self.timer_deadline.is_none());
        if inputs.head_received.is_some() {
            self.transition_to_waiting(inputs);
        }
    }

    fn update_waiting(&mut self, inputs: PreemptionInputs) {
        if self.timer_deadline.is_none() {
            self.transition_to_checking(inputs);
        }
    }

    fn update_checking(&mut self, inputs: PreemptionInputs) {
        let Some(head_received) = inputs.head_received else {
            self.transition_to_idle(inputs);
            return;
        };

        let elapsed = inputs.now.saturating_duration_since(head_received);
        if elapsed < self.config.preempt_wait {
            self.timer_deadline = Some(inputs.now + (self.config.preempt_wait - elapsed));
        } else {
            self.timer_deadline = None;
            if inputs.scheduled {
                self.transition_to_preempting(inputs);
            } else {
                self.transition_to_would_preempt_descheduled();
            }
        }
    }

    fn update_preempting(&mut self, inputs: PreemptionInputs) {
        debug_assert!(self.flag_set);
        match self.timer_deadline {
            None => self.transition_to_idle(inputs),
            Some(_) if self.should_transition_to_idle(inputs) => self.transition_to_idle(inputs),
            Some(deadline) if !inputs.scheduled => {
                self.max_preemption_time = deadline.saturating_duration_since(inputs.now);
                self.timer_deadline = None;
                self.transition_to_would_preempt_descheduled();
            },
            Some(_) => {},
        }
    }

    fn update_would_preempt_descheduled(&mut self, inputs: PreemptionInputs) {
        debug_assert!(self.timer_deadline.is_none());
        if self.should_transition_to_idle(inputs) {
            self.transition_to_idle(inputs);
        } else if inputs.scheduled {
            self.transition_to_preempting(inputs);
        }
    }

    fn should_transition_to_idle(&self, inputs: PreemptionInputs) -> bool {
        match inputs.head_received {
            None => true,
            Some(head_received) => {
                inputs.now.saturating_duration_since(head_received)
                    < self.config.stop_preempt_threshold
            },
        }
    }

    fn transition_to_idle(&mut self, inputs: PreemptionInputs) {
        self.state = PreemptionState::Idle;
        self.flag_set = false;
        self.max_preemption_time = self.config.max_preempt_time;
        self.timer_deadline = None;
        self.update_idle(inputs);
    }

    fn transition_to_waiting(&mut self, inputs: PreemptionInputs) {
        debug_assert_eq!(self.state, PreemptionState::Idle);
        self.state = PreemptionState::Waiting;
        self.timer_deadline = Some(inputs.now + self.config.preempt_wait);
    }

    fn transition_to_checking(&mut self, inputs: PreemptionInputs) {
        debug_assert_eq!(self.state, PreemptionState::Waiting);
        self.state = PreemptionState::Checking;
        self.max_preemption_time = self.config.max_preempt_time;
        self.update_checking(inputs);
    }

    fn transition_to_preempting(&mut self, inputs: PreemptionInputs) {
        debug_assert!(matches!(
            self.state,
            PreemptionState::Checking | PreemptionState::WouldPreemptDescheduled
        ));
        debug_assert!(inputs.scheduled);
        self.state = PreemptionState::Preempting;
        self.flag_set = true;
        self.timer_deadline = Some(inputs.now + self.max_preemption_time);
    }

    fn transition_to_would_preempt_descheduled(&mut self) {
        debug_assert!(matches!(
            self.state,
            PreemptionState::Checking | PreemptionState::Preempting
        ));
        self.state = PreemptionState::WouldPreemptDescheduled;
        self.flag_set = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(34);
    const BUDGET: Duration = Duration::from_millis(17);

    fn machine() -> PreemptionMachine {
        PreemptionMachine::new(PreemptionConfig::default())
    }

    fn inputs(now: Instant, head: Option<Instant>, scheduled: bool) -> PreemptionInputs {
        PreemptionInputs { now, head_received: head, scheduled }
    }

    /// Drive a machine from idle into `Preempting` with a head received at `t0`.
    fn preempting_at(t0: Instant) -> PreemptionMachine {
        let mut m = machine();
        m.update(inputs(t0, Some(t0), true));
        m.timer_fired();
        m.update(inputs(t0 + WAIT, Some(t0), true));
        assert_eq!(m.state(), PreemptionState::Preempting);
        m
    }

    #[test]
    fn test_idle_stays_idle_when_empty() {
        let mut m = machine();
        let outcome = m.update(inputs(Instant::now(), None, true));
        assert!(outcome.is_none());
        assert_eq!(m.state(), PreemptionState::Idle);
    }

    #[test]
    fn test_pending_message_arms_wait() {
        let t0 = Instant::now();
        let mut m = machine();
        let outcome = m.update(inputs(t0, Some(t0), true));
        assert_eq!(m.state(), PreemptionState::Waiting);
        assert_eq!(outcome.timer, TimerCommand::Arm(t0 + WAIT));
        assert_eq!(outcome.flag, None);

        // Further pushes while the timer runs change nothing.
        assert!(m.update(inputs(t0 + BUDGET, Some(t0), true)).is_none());
        assert_eq!(m.state(), PreemptionState::Waiting);
    }

    #[test]
    fn test_old_head_starts_preemption() {
        let t0 = Instant::now();
        let mut m = machine();
        m.update(inputs(t0, Some(t0), true));
        m.timer_fired();
        let outcome = m.update(inputs(t0 + WAIT, Some(t0), true));

        assert_eq!(m.state(), PreemptionState::Preempting);
        assert_eq!(outcome.flag, Some(true));
        assert_eq!(outcome.timer, TimerCommand::Arm(t0 + WAIT + BUDGET));
    }

    #[test]
    fn test_young_head_rearms_for_remainder() {
        let t0 = Instant::now();
        let mut m = machine();
        m.update(inputs(t0, Some(t0), true));
        m.timer_fired();

        // The first head was finished; the new head arrived 10ms ago.
        let now = t0 + WAIT;
        let head = now - Duration::from_millis(10);
        let outcome = m.update(inputs(now, Some(head), true));

        assert_eq!(m.state(), PreemptionState::Checking);
        assert_eq!(outcome.timer, TimerCommand::Arm(now + Duration::from_millis(24)));
        assert!(!m.flag_set());
    }

    #[test]
    fn test_checking_with_empty_fifo_returns_to_idle() {
        let t0 = Instant::now();
        let mut m = machine();
        m.update(inputs(t0, Some(t0), true));
        m.timer_fired();
        let outcome = m.update(inputs(t0 + WAIT, None, true));
        assert_eq!(m.state(), PreemptionState::Idle);
        assert!(outcome.is_none());
    }

    #[test]
    fn test_descheduled_old_head_would_preempt() {
        let t0 = Instant::now();
        let mut m = machine();
        m.update(inputs(t0, Some(t0), false));
        m.timer_fired();
        let outcome = m.update(inputs(t0 + WAIT, Some(t0), false));

        assert_eq!(m.state(), PreemptionState::WouldPreemptDescheduled);
        assert_eq!(outcome.flag, None);
        assert_eq!(m.timer_deadline(), None);

        // Rescheduling enters preemption with the full budget.
        let now = t0 + WAIT + Duration::from_millis(5);
        let outcome = m.update(inputs(now, Some(t0), true));
        assert_eq!(m.state(), PreemptionState::Preempting);
        assert_eq!(outcome.flag, Some(true));
        assert_eq!(outcome.timer, TimerCommand::Arm(now + BUDGET));
    }

    #[test]
    fn test_budget_expiry_ends_preemption() {
        let t0 = Instant::now();
        let mut m = preempting_at(t0);

        m.timer_fired();
        let now = t0 + WAIT + BUDGET;
        let outcome = m.update(inputs(now, Some(t0), true));

        // Back to idle, then straight into waiting because the head is still pending.
        assert_eq!(m.state(), PreemptionState::Waiting);
        assert_eq!(outcome.flag, Some(false));
        assert_eq!(outcome.timer, TimerCommand::Arm(now + WAIT));
        assert_eq!(m.remaining_budget(), BUDGET);
    }

    #[test]
    fn test_caught_up_queue_stops_preempting() {
        let t0 = Instant::now();
        let mut m = preempting_at(t0);

        let now = t0 + WAIT + Duration::from_millis(3);
        let outcome = m.update(inputs(now, None, true));
        assert_eq!(m.state(), PreemptionState::Idle);
        assert_eq!(outcome, PreemptionOutcome { timer: TimerCommand::Cancel, flag: Some(false) });
    }

    #[test]
    fn test_young_head_stops_preempting() {
        let t0 = Instant::now();
        let mut m = preempting_at(t0);

        let now = t0 + WAIT + Duration::from_millis(3);
        let head = now - Duration::from_millis(1);
        let outcome = m.update(inputs(now, Some(head), true));
        assert_eq!(m.state(), PreemptionState::Waiting);
        assert_eq!(outcome.flag, Some(false));
        assert_eq!(outcome.timer, TimerCommand::Arm(now + WAIT));
    }

    #[test]
    fn test_deschedule_saves_remaining_budget() {
        let t0 = Instant::now();
        let mut m = preempting_at(t0);

        let now = t0 + WAIT + Duration::from_millis(7);
        let outcome = m.update(inputs(now, Some(t0), false));
        assert_eq!(m.state(), PreemptionState::WouldPreemptDescheduled);
        assert_eq!(outcome, PreemptionOutcome { timer: TimerCommand::Cancel, flag: Some(false) });
        assert_eq!(m.remaining_budget(), Duration::from_millis(10));

        let later = now + Duration::from_millis(50);
        let outcome = m.update(inputs(later, Some(t0), true));
        assert_eq!(m.state(), PreemptionState::Preempting);
        assert_eq!(outcome.timer, TimerCommand::Arm(later + Duration::from_millis(10)));
    }

    #[test]
    fn test_idle_entry_is_idempotent() {
        let t0 = Instant::now();
        let mut m = preempting_at(t0);
        let now = t0 + WAIT + Duration::from_millis(1);

        m.update(inputs(now, None, true));
        let state = m.state();
        let second = m.update(inputs(now, None, true));
        assert_eq!(m.state(), state);
        assert!(second.is_none());
        assert!(!m.flag_set());
        assert_eq!(m.timer_deadline(), None);
    }
}
