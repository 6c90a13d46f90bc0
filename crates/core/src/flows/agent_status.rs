use crate::domain::conversation::AgentStatus;
use crate::flows::FlowTransitionError;

/// Allowed agent status edges. Same-state transitions are accepted as no-ops.
pub fn validate_agent_transition(
    from: AgentStatus,
    to: AgentStatus,
) -> Result<(), FlowTransitionError> {
    use AgentStatus::{AwaitingApproval, Complete, Error, Idle, Paused, Running};

    let valid = match (from, to) {
        (from, to) if from == to => true,
        (Idle, Running) => true,
        (Running, Paused | AwaitingApproval | Complete | Error) => true,
        (Paused, Running) => true,
        (AwaitingApproval, Running | Error) => true,
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(FlowTransitionError::InvalidStatusTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::validate_agent_transition;
    use crate::domain::conversation::AgentStatus;

    const ALL: [AgentStatus; 6] = [
        AgentStatus::Idle,
        AgentStatus::Running,
        AgentStatus::Paused,
        AgentStatus::AwaitingApproval,
        AgentStatus::Complete,
        AgentStatus::Error,
    ];

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        for terminal in [AgentStatus::Complete, AgentStatus::Error] {
            for to in ALL.into_iter().filter(|to| *to != terminal) {
                assert!(
                    validate_agent_transition(terminal, to).is_err(),
                    "{terminal:?} -> {to:?} should be rejected"
                );
            }
        }
    }

    #[test]
    fn idle_cannot_reach_terminal_without_running() {
        assert!(validate_agent_transition(AgentStatus::Idle, AgentStatus::Complete).is_err());
        assert!(validate_agent_transition(AgentStatus::Idle, AgentStatus::Error).is_err());
        assert!(validate_agent_transition(AgentStatus::Idle, AgentStatus::Running).is_ok());
    }

    #[test]
    fn approval_resolves_to_running_or_error() {
        let from = AgentStatus::AwaitingApproval;
        assert!(validate_agent_transition(from, AgentStatus::Running).is_ok());
        assert!(validate_agent_transition(from, AgentStatus::Error).is_ok());
        assert!(validate_agent_transition(from, AgentStatus::Complete).is_err());
        assert!(validate_agent_transition(from, AgentStatus::Paused).is_err());
    }

    #[test]
    fn paused_only_resumes() {
        assert!(validate_agent_transition(AgentStatus::Paused, AgentStatus::Running).is_ok());
        assert!(validate_agent_transition(AgentStatus::Paused, AgentStatus::Complete).is_err());
    }
}
