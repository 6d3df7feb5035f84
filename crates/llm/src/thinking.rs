use std::sync::Arc;

use strand_core::{ThinkingEvent, ThinkingState, ThinkingTransitionResult};
use tokio::sync::watch;

/// Shared thinking indicator. Applies events to a [`ThinkingState`] and
/// schedules the deferred settle once the agent reports it is done.
#[derive(Debug, Clone)]
pub struct ThinkingTracker {
    state: Arc<watch::Sender<ThinkingState>>,
}

impl Default for ThinkingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkingTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ThinkingState::new());
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> ThinkingState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ThinkingState> {
        self.state.subscribe()
    }

    /// Applies `event`; rejected events leave the state untouched.
    pub fn dispatch(&self, event: ThinkingEvent) -> ThinkingTransitionResult {
        let mut outcome = Ok(self.state());
        self.state.send_if_modified(|state| {
            outcome = state.apply(event);
            match outcome {
                Ok(next) => {
                    let changed = next != *state;
                    *state = next;
                    changed
                }
                Err(_) => false,
            }
        });

        match outcome {
            Ok(next) => {
                tracing::trace!(event = ?event, phase = ?next.phase, count = next.count, "thinking transition");
                if let Some(delay) = next.settle_after() {
                    self.schedule_settle(delay);
                }
            }
            Err(rejection) => {
                tracing::debug!(
                    phase = ?rejection.phase,
                    event = ?rejection.event,
                    "thinking event rejected"
                );
            }
        }

        outcome
    }

    fn schedule_settle(&self, delay: std::time::Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no tokio runtime; thinking settle left to the caller");
            return;
        };

        let tracker = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // A fresh wakeup may have replaced the finishing phase meanwhile.
            let _ = tracker.dispatch(ThinkingEvent::Settle);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strand_core::{FINISHED_COUNT, FINISHING_DELAY, ThinkingPhase};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn settles_to_asleep_after_finishing_delay() {
        let tracker = ThinkingTracker::new();
        let mut updates = tracker.subscribe();

        tracker.dispatch(ThinkingEvent::Wakeup).expect("wakeup");
        tracker.dispatch(ThinkingEvent::Thinking).expect("tick");
        assert_eq!(tracker.state().count, 1);

        let finishing = tracker.dispatch(ThinkingEvent::Sleeping).expect("sleeping");
        assert_eq!(finishing.phase, ThinkingPhase::Finishing);
        assert_eq!(finishing.count, FINISHED_COUNT);
        updates.borrow_and_update();

        tokio::time::sleep(FINISHING_DELAY - Duration::from_millis(1)).await;
        assert_eq!(tracker.state().phase, ThinkingPhase::Finishing);

        updates.changed().await.expect("settle update");
        assert_eq!(updates.borrow().phase, ThinkingPhase::Asleep);
        assert!(!tracker.state().is_active());
    }

    #[tokio::test]
    async fn rejected_events_do_not_notify() {
        let tracker = ThinkingTracker::new();
        let mut updates = tracker.subscribe();

        let rejection = tracker
            .dispatch(ThinkingEvent::Thinking)
            .expect_err("asleep rejects ticks");
        assert_eq!(rejection.phase, ThinkingPhase::Asleep);
        assert!(!updates.has_changed().expect("sender alive"));

        tracker.dispatch(ThinkingEvent::Wakeup).expect("wakeup");
        assert!(updates.has_changed().expect("sender alive"));
        assert_eq!(updates.borrow_and_update().phase, ThinkingPhase::Conscious);
    }

    #[test]
    fn dispatch_without_runtime_skips_settle_timer() {
        let tracker = ThinkingTracker::new();
        tracker.dispatch(ThinkingEvent::Wakeup).expect("wakeup");
        tracker.dispatch(ThinkingEvent::Sleeping).expect("sleeping");
        assert_eq!(tracker.state().phase, ThinkingPhase::Finishing);
    }
}
