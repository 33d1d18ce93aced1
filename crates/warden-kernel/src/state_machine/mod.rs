use crate::error::StateMachineError;
use serde::{Deserialize, Serialize};

/// Per-command gateway state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    Created,
    RiskScored,
    PolicyChecked,
    AutoApproved,
    AwaitingConfirmation,
    Approved,
    Rejected,
    Previewed,
    Dispatched,
    Completed,
    Failed,
}

impl GatewayState {
    pub const ALL: [GatewayState; 11] = [
        GatewayState::Created,
        GatewayState::RiskScored,
        GatewayState::PolicyChecked,
        GatewayState::AutoApproved,
        GatewayState::AwaitingConfirmation,
        GatewayState::Approved,
        GatewayState::Rejected,
        GatewayState::Previewed,
        GatewayState::Dispatched,
        GatewayState::Completed,
        GatewayState::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        allowed_transitions(self).is_empty()
    }
}

/// Validates a gateway state transition.
///
/// Illegal transitions return an error; with the `strict-debug` feature they
/// panic instead so that tests surface them at the call site.
pub fn validate_transition(from: GatewayState, to: GatewayState) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal gateway transition attempted: {:?} -> {:?}", from, to);

        #[cfg(not(feature = "strict-debug"))]
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

pub fn allowed_transitions(from: GatewayState) -> Vec<GatewayState> {
    use GatewayState::*;
    match from {
        Created => vec![RiskScored, Rejected],
        RiskScored => vec![PolicyChecked, Rejected],
        // Dry-run of a command that needs confirmation previews without suspending.
        PolicyChecked => vec![AutoApproved, AwaitingConfirmation, Previewed, Rejected],
        AutoApproved => vec![Dispatched, Previewed],
        // Confirmation never times out into approval.
        AwaitingConfirmation => vec![Approved, Rejected],
        Approved => vec![Dispatched],
        Dispatched => vec![Completed, Failed],
        Rejected | Previewed | Completed | Failed => vec![],
    }
}

fn allowed(from: GatewayState, to: GatewayState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

/// Ordered history of the states a command has passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTrace {
    states: Vec<GatewayState>,
}

impl StateTrace {
    pub fn new() -> Self {
        Self {
            states: vec![GatewayState::Created],
        }
    }

    pub fn current(&self) -> GatewayState {
        *self.states.last().unwrap_or(&GatewayState::Created)
    }

    pub fn advance(&mut self, to: GatewayState) -> Result<(), StateMachineError> {
        validate_transition(self.current(), to)?;
        self.states.push(to);
        Ok(())
    }

    pub fn states(&self) -> &[GatewayState] {
        &self.states
    }
}

impl Default for StateTrace {
    fn default() -> Self {
        Self::new()
    }
}
