use crate::market::types::ReconciliationState;
use tracing::debug;

/// Extra refresh cycles run after a trade to ride out settlement lag.
pub const MAX_RECONCILIATION_ATTEMPTS: u8 = 4;

#[derive(Debug, Default, Clone)]
pub struct ReconciliationController {
    state: ReconciliationState,
}

impl ReconciliationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ReconciliationState {
        self.state
    }

    pub fn on_trade_submitted(&mut self) {
        self.state = ReconciliationState {
            pending: true,
            attempts_remaining: MAX_RECONCILIATION_ATTEMPTS,
        };
        debug!(attempts = MAX_RECONCILIATION_ATTEMPTS, "trade submitted, reconciliation armed");
    }

    /// Returns true when one additional balance refresh should be triggered.
    pub fn on_refresh_completed(&mut self) -> bool {
        if !self.state.pending || self.state.attempts_remaining == 0 {
            self.state.pending = false;
            return false;
        }

        self.state.attempts_remaining -= 1;
        if self.state.attempts_remaining == 0 {
            self.state.pending = false;
        }
        debug!(
            attempts_remaining = self.state.attempts_remaining,
            "scheduling reconciliation refresh"
        );
        true
    }

    pub fn reset(&mut self) {
        self.state = ReconciliationState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_rest() {
        let controller = ReconciliationController::new();
        assert_eq!(
            controller.state(),
            ReconciliationState {
                pending: false,
                attempts_remaining: 0
            }
        );
    }

    #[test]
    fn each_completed_refresh_consumes_one_attempt() {
        let mut controller = ReconciliationController::new();
        controller.on_trade_submitted();

        assert!(controller.on_refresh_completed());
        assert_eq!(controller.state().attempts_remaining, 3);
        assert!(controller.state().pending);
    }

    #[test]
    fn never_schedules_more_than_four_extra_refreshes() {
        let mut controller = ReconciliationController::new();
        controller.on_trade_submitted();

        let scheduled = (0..10)
            .filter(|_| controller.on_refresh_completed())
            .count();
        assert_eq!(scheduled, 4);
        assert_eq!(
            controller.state(),
            ReconciliationState {
                pending: false,
                attempts_remaining: 0
            }
        );
    }

    #[test]
    fn resubmitting_rearms_the_full_budget() {
        let mut controller = ReconciliationController::new();
        controller.on_trade_submitted();
        controller.on_refresh_completed();
        controller.on_refresh_completed();
        controller.on_trade_submitted();

        assert_eq!(controller.state().attempts_remaining, MAX_RECONCILIATION_ATTEMPTS);
        assert!(!ReconciliationController::new().on_refresh_completed());
    }
}
