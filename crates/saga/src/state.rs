//! Saga state machine.

use serde::{Deserialize, Serialize};

/// A downstream service touched by the saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Booking,
    Inventory,
    Billing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Booking => "booking",
            Phase::Inventory => "inventory",
            Phase::Billing => "billing",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The state of a saga in its lifecycle.
///
/// Cancellation:
/// ```text
/// Start ──► CancellingBooking ──► CancellingInventory ──► Succeeded
///                 │                        │
///                 └────────────────────────┴──► Failed
/// ```
///
/// Reservation:
/// ```text
/// Start ──► Booking ──► ReservingInventory ──► Billing ──► Succeeded
///              │               │                  │
///              └───────────────┴──────────────────┴──► Cancelling… ──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaState {
    /// Nothing has run yet.
    #[default]
    Start,

    /// A forward step is in progress.
    Executing(Phase),

    /// A compensating step is in progress.
    Compensating(Phase),

    /// The saga reached its goal (terminal state).
    Succeeded,

    /// The saga gave up (terminal state).
    Failed,
}

impl SagaState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Succeeded | SagaState::Failed)
    }

    /// Returns true if the saga may move from this state to `next`.
    ///
    /// Compensation never goes back to forward execution, and terminal
    /// states are final.
    pub fn can_transition_to(&self, next: SagaState) -> bool {
        match (self, next) {
            (SagaState::Start, SagaState::Executing(_) | SagaState::Compensating(_)) => true,
            (
                SagaState::Executing(_),
                SagaState::Executing(_)
                | SagaState::Compensating(_)
                | SagaState::Succeeded
                | SagaState::Failed,
            ) => true,
            (
                SagaState::Compensating(_),
                SagaState::Compensating(_) | SagaState::Succeeded | SagaState::Failed,
            ) => true,
            // An aborted saga can fail from any non-terminal state.
            (SagaState::Start, SagaState::Failed) => true,
            // A resumed saga whose steps all finished before the restart.
            (SagaState::Start, SagaState::Succeeded) => true,
            _ => false,
        }
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Start => "Start",
            SagaState::Executing(Phase::Booking) => "Booking",
            SagaState::Executing(Phase::Inventory) => "ReservingInventory",
            SagaState::Executing(Phase::Billing) => "Billing",
            SagaState::Compensating(Phase::Booking) => "CancellingBooking",
            SagaState::Compensating(Phase::Inventory) => "CancellingInventory",
            SagaState::Compensating(Phase::Billing) => "RefundingBilling",
            SagaState::Succeeded => "Succeeded",
            SagaState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_start() {
        assert_eq!(SagaState::default(), SagaState::Start);
    }

    #[test]
    fn test_cancellation_path_is_allowed() {
        let path = [
            SagaState::Start,
            SagaState::Compensating(Phase::Booking),
            SagaState::Compensating(Phase::Inventory),
            SagaState::Succeeded,
        ];
        assert!(path.windows(2).all(|w| w[0].can_transition_to(w[1])));
        assert!(SagaState::Compensating(Phase::Booking).can_transition_to(SagaState::Failed));
    }

    #[test]
    fn test_reservation_path_is_allowed() {
        let path = [
            SagaState::Start,
            SagaState::Executing(Phase::Booking),
            SagaState::Executing(Phase::Inventory),
            SagaState::Compensating(Phase::Inventory),
            SagaState::Compensating(Phase::Booking),
            SagaState::Failed,
        ];
        assert!(path.windows(2).all(|w| w[0].can_transition_to(w[1])));
    }

    #[test]
    fn test_start_can_end_directly() {
        assert!(SagaState::Start.can_transition_to(SagaState::Succeeded));
        assert!(SagaState::Start.can_transition_to(SagaState::Failed));
    }

    #[test]
    fn test_compensation_never_resumes_forward_steps() {
        assert!(
            !SagaState::Compensating(Phase::Booking)
                .can_transition_to(SagaState::Executing(Phase::Inventory))
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SagaState::Start.is_terminal());
        assert!(!SagaState::Executing(Phase::Billing).is_terminal());
        assert!(!SagaState::Compensating(Phase::Inventory).is_terminal());
        assert!(SagaState::Succeeded.is_terminal());
        assert!(SagaState::Failed.is_terminal());

        for terminal in [SagaState::Succeeded, SagaState::Failed] {
            assert!(!terminal.can_transition_to(SagaState::Start));
            assert!(!terminal.can_transition_to(SagaState::Executing(Phase::Booking)));
            assert!(!terminal.can_transition_to(SagaState::Failed));
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(SagaState::Start.to_string(), "Start");
        assert_eq!(
            SagaState::Compensating(Phase::Booking).to_string(),
            "CancellingBooking"
        );
        assert_eq!(
            SagaState::Compensating(Phase::Inventory).to_string(),
            "CancellingInventory"
        );
        assert_eq!(
            SagaState::Executing(Phase::Inventory).to_string(),
            "ReservingInventory"
        );
        assert_eq!(SagaState::Succeeded.to_string(), "Succeeded");
        assert_eq!(SagaState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_serialization() {
        let state = SagaState::Compensating(Phase::Inventory);
        let json = serde_json::to_string(&state).unwrap();
        let deserialized: SagaState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, deserialized);
    }
}
