use std::time::Duration;

/// Time spent in `Finishing` before the indicator returns to `Asleep`.
pub const FINISHING_DELAY: Duration = Duration::from_millis(2_500);

/// Count pinned on `Sleeping`; far enough past the curve midpoint that the
/// progress reads as complete.
pub const FINISHED_COUNT: u32 = 999;

const PROGRESS_STEEPNESS: f64 = 0.8;
const PROGRESS_MIDPOINT: f64 = 3.0;

/// Phase of the agent "thinking" indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThinkingPhase {
    #[default]
    Asleep,
    Conscious,
    Finishing,
}

/// Input for the thinking indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThinkingEvent {
    Wakeup,
    Thinking,
    Sleeping,
    /// Timed transition out of `Finishing`, scheduled by the caller.
    Settle,
}

/// Rejection reason for an event the current phase does not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkingRejection {
    pub phase: ThinkingPhase,
    pub event: ThinkingEvent,
}

pub type ThinkingTransitionResult = Result<ThinkingState, ThinkingRejection>;

/// Thinking indicator state: phase plus the number of observed ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThinkingState {
    pub phase: ThinkingPhase,
    pub count: u32,
}

impl ThinkingState {
    pub const fn new() -> Self {
        Self {
            phase: ThinkingPhase::Asleep,
            count: 0,
        }
    }

    /// Applies one event deterministically, returning the next state.
    pub fn apply(&self, event: ThinkingEvent) -> ThinkingTransitionResult {
        match (self.phase, event) {
            (ThinkingPhase::Asleep, ThinkingEvent::Wakeup) => Ok(Self {
                phase: ThinkingPhase::Conscious,
                count: 0,
            }),
            (ThinkingPhase::Conscious, ThinkingEvent::Thinking) => Ok(Self {
                phase: ThinkingPhase::Conscious,
                count: self.count.saturating_add(1),
            }),
            (ThinkingPhase::Conscious, ThinkingEvent::Sleeping) => Ok(Self {
                phase: ThinkingPhase::Finishing,
                count: FINISHED_COUNT,
            }),
            (ThinkingPhase::Finishing, ThinkingEvent::Settle) => Ok(Self {
                phase: ThinkingPhase::Asleep,
                count: self.count,
            }),
            (phase, event) => Err(ThinkingRejection { phase, event }),
        }
    }

    /// Delay after which the caller should dispatch [`ThinkingEvent::Settle`].
    pub fn settle_after(&self) -> Option<Duration> {
        match self.phase {
            ThinkingPhase::Finishing => Some(FINISHING_DELAY),
            ThinkingPhase::Asleep | ThinkingPhase::Conscious => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase != ThinkingPhase::Asleep
    }

    pub fn progress(&self) -> f64 {
        progress(self.count)
    }
}

/// Logistic progress curve: slow start, fast middle, saturating near 1.
pub fn progress(count: u32) -> f64 {
    1.0 / (1.0 + (-PROGRESS_STEEPNESS * (f64::from(count) - PROGRESS_MIDPOINT)).exp())
}
