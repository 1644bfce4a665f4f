use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a managed container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Requested,
    Creating,
    Running,
    Idle,
    Reaping,
    Removed,
    Failed,
}

impl ContainerState {
    /// Removed and Failed end the forward lifecycle
    pub fn is_terminal(self) -> bool {
        matches!(self, ContainerState::Removed | ContainerState::Failed)
    }

    /// States in which `acquire` hands back the existing handle
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ContainerState::Creating | ContainerState::Running | ContainerState::Idle
        )
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: ContainerState) -> bool {
        use ContainerState::*;

        if next == Failed {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Requested, Creating)
                | (Creating, Running)
                | (Running, Idle)
                | (Running, Reaping)
                | (Idle, Reaping)
                | (Reaping, Removed)
                // failed handles are force-removed by the next sweep
                | (Failed, Reaping)
        )
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Requested => "requested",
            ContainerState::Creating => "creating",
            ContainerState::Running => "running",
            ContainerState::Idle => "idle",
            ContainerState::Reaping => "reaping",
            ContainerState::Removed => "removed",
            ContainerState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path() {
        use ContainerState::*;
        let path = [Requested, Creating, Running, Idle, Reaping, Removed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_only() {
        use ContainerState::*;
        for state in [Requested, Creating, Running, Idle, Reaping] {
            assert!(state.can_transition_to(Failed));
        }
        assert!(!Removed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_no_backwards_transition() {
        assert!(!ContainerState::Idle.can_transition_to(ContainerState::Running));
        assert!(!ContainerState::Removed.can_transition_to(ContainerState::Creating));
    }

    #[test]
    fn test_display() {
        assert_eq!(ContainerState::Reaping.to_string(), "reaping");
    }
}
