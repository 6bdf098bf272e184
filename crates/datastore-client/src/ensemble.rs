//! Ensemble state and quorum arithmetic

use std::fmt;

/// Majority of `members`: `floor(n/2) + 1`
#[must_use]
pub fn quorum(members: usize) -> usize {
    members / 2 + 1
}

/// Observed state of the etcd ensemble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsembleState {
    /// No member container runs
    Empty,
    /// Members run but none answers yet
    Bootstrapping,
    /// Every listed member is healthy
    Healthy,
    /// Some members are unhealthy but quorum holds
    Degraded {
        /// Healthy members
        healthy: usize,
        /// Listed members
        total: usize,
    },
    /// Quorum is lost
    Lost {
        /// Healthy members
        healthy: usize,
        /// Listed members
        total: usize,
    },
}

impl EnsembleState {
    /// Whether writes (member changes, state puts) are possible
    #[must_use]
    pub fn has_quorum(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded { .. })
    }
}

impl fmt::Display for EnsembleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bootstrapping => f.write_str("Bootstrapping"),
            Self::Healthy => f.write_str("Healthy"),
            Self::Degraded { healthy, total } => write!(f, "Degraded({healthy}/{total}, quorum ok)"),
            Self::Lost { healthy, total } => write!(f, "Lost({healthy}/{total}, quorum lost)"),
        }
    }
}

/// Classify the ensemble
///
/// `running` is the number of etcd containers found running, `listed` the
/// member count from `MemberList` (`None` when no endpoint answered) and
/// `healthy` the number of members whose health endpoint reports healthy.
#[must_use]
pub fn assess(running: usize, listed: Option<usize>, healthy: usize) -> EnsembleState {
    let Some(total) = listed else {
        return if running == 0 {
            EnsembleState::Empty
        } else if healthy == 0 {
            EnsembleState::Bootstrapping
        } else {
            EnsembleState::Lost { healthy, total: running }
        };
    };
    if total == 0 && running == 0 {
        return EnsembleState::Empty;
    }
    let total = total.max(running);
    if healthy >= total {
        EnsembleState::Healthy
    } else if healthy >= quorum(total) {
        EnsembleState::Degraded { healthy, total }
    } else {
        EnsembleState::Lost { healthy, total }
    }
}

/// Whether removing one member keeps a working majority
///
/// Both the membership before and the membership after the removal must
/// have a healthy majority. Removing an unhealthy member does not reduce
/// the healthy count.
#[must_use]
pub fn removal_keeps_quorum(total: usize, healthy: usize, removing_healthy: bool) -> bool {
    if total <= 1 {
        return false;
    }
    let healthy_after = if removing_healthy { healthy.saturating_sub(1) } else { healthy };
    healthy >= quorum(total) && healthy_after >= quorum(total - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(5), 3);
    }

    #[test]
    fn test_assess_states() {
        assert_eq!(assess(0, None, 0), EnsembleState::Empty);
        assert_eq!(assess(3, None, 0), EnsembleState::Bootstrapping);
        assert_eq!(assess(3, Some(3), 3), EnsembleState::Healthy);
        assert_eq!(assess(3, Some(3), 2), EnsembleState::Degraded { healthy: 2, total: 3 });
        assert_eq!(assess(3, Some(3), 1), EnsembleState::Lost { healthy: 1, total: 3 });
        assert!(!assess(3, Some(3), 1).has_quorum());
    }

    #[test]
    fn test_removal_guard() {
        // 3 healthy -> 2 healthy members of 2
        assert!(removal_keeps_quorum(3, 3, true));
        // Shrinking a healthy pair to one member
        assert!(removal_keeps_quorum(2, 2, true));
        // 3 members with one down: removing a healthy one leaves 1 of 2
        assert!(!removal_keeps_quorum(3, 2, true));
        // ...but removing the dead one is fine
        assert!(removal_keeps_quorum(3, 2, false));
        assert!(!removal_keeps_quorum(1, 1, true));
    }
}
