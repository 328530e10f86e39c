use std::time::Duration;
use tokio::time::Instant;

pub const BURST_DURATION_UNITS: u64 = 5;
pub const BURST_TICK_UNITS: u64 = 1;
pub const BURST_FIRE_EVERY_UNITS: u64 = 5;
pub const LOOP_TICK_UNITS: u64 = 10;
/// Length of one loop window before it restarts itself.
pub const LOOP_WINDOW_UNITS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Stopped,
    Burst { elapsed_units: u64 },
    Loop { elapsed_units: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTick {
    pub phase: PollPhase,
    pub fire: bool,
}

/// Balance refresh timer: a short burst phase followed by an indefinite slow
/// loop, driven as one state machine with a single deadline.
#[derive(Debug, Clone)]
pub struct BalancePoller {
    unit: Duration,
    phase: PollPhase,
    deadline: Option<Instant>,
}

impl BalancePoller {
    pub fn new(unit: Duration) -> Self {
        Self {
            unit,
            phase: PollPhase::Stopped,
            deadline: None,
        }
    }

    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.phase != PollPhase::Stopped
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Enters the burst phase with its first tick due immediately.
    pub fn start(&mut self, now: Instant) {
        self.phase = PollPhase::Burst { elapsed_units: 0 };
        self.deadline = Some(now);
    }

    pub fn stop(&mut self) {
        self.phase = PollPhase::Stopped;
        self.deadline = None;
    }

    /// Advances one tick. The caller invokes this once the deadline passed.
    pub fn on_tick(&mut self, now: Instant) -> Option<PollTick> {
        let ticked = match self.phase {
            PollPhase::Stopped => return None,
            PollPhase::Burst { elapsed_units } if elapsed_units >= BURST_DURATION_UNITS => {
                PollPhase::Loop { elapsed_units: 0 }
            }
            PollPhase::Loop { elapsed_units } if elapsed_units >= LOOP_WINDOW_UNITS => {
                PollPhase::Loop { elapsed_units: 0 }
            }
            phase => phase,
        };

        let (fire, next_phase, step_units) = match ticked {
            PollPhase::Burst { elapsed_units } => (
                elapsed_units % BURST_FIRE_EVERY_UNITS == 0,
                PollPhase::Burst {
                    elapsed_units: elapsed_units + BURST_TICK_UNITS,
                },
                BURST_TICK_UNITS,
            ),
            PollPhase::Loop { elapsed_units } => (
                true,
                PollPhase::Loop {
                    elapsed_units: elapsed_units + LOOP_TICK_UNITS,
                },
                LOOP_TICK_UNITS,
            ),
            PollPhase::Stopped => return None,
        };

        self.phase = next_phase;
        self.deadline = Some(now + self.unit * step_units as u32);
        Some(PollTick {
            phase: ticked,
            fire,
        })
    }
}
