//! Per-instance health reported to the surrounding agent.

use std::fmt;

/// Why an instance is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    ControlConnectionLost,
}

/// Health signal for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceHealth {
    Healthy,
    Degraded {
        failed_rules: usize,
        /// Guest agent unreachable for longer than the grace period.
        guest_unreachable: bool,
    },
    Unavailable {
        reason: UnavailableReason,
    },
}

impl InstanceHealth {
    pub fn evaluate(connection_available: bool, guest_unreachable: bool, failed_rules: usize) -> Self {
        if !connection_available {
            return Self::Unavailable {
                reason: UnavailableReason::ControlConnectionLost,
            };
        }
        if failed_rules > 0 || guest_unreachable {
            return Self::Degraded {
                failed_rules,
                guest_unreachable,
            };
        }
        Self::Healthy
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Short label for structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded { .. } => "degraded",
            Self::Unavailable { .. } => "unavailable",
        }
    }
}

impl fmt::Display for InstanceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded {
                failed_rules,
                guest_unreachable: false,
            } => write!(f, "degraded ({failed_rules} rules failed)"),
            Self::Degraded {
                failed_rules: 0,
                guest_unreachable: true,
            } => f.write_str("degraded (guest agent unreachable)"),
            Self::Degraded { failed_rules, .. } => {
                write!(f, "degraded ({failed_rules} rules failed, guest agent unreachable)")
            }
            Self::Unavailable {
                reason: UnavailableReason::ControlConnectionLost,
            } => f.write_str("unavailable (control connection lost)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_precedence() {
        assert_eq!(InstanceHealth::evaluate(true, false, 0), InstanceHealth::Healthy);
        assert_eq!(
            InstanceHealth::evaluate(false, true, 3).to_string(),
            "unavailable (control connection lost)"
        );
        assert_eq!(
            InstanceHealth::evaluate(true, false, 2).to_string(),
            "degraded (2 rules failed)"
        );
        assert_eq!(
            InstanceHealth::evaluate(true, true, 0).to_string(),
            "degraded (guest agent unreachable)"
        );
    }
}
