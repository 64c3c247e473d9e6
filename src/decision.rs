use serde::{Deserialize, Serialize};

/// Outcome of a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Deny,
}

/// Lifecycle of a confirmation request. Only `Pending` is mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Pending,
    Responded,
    Cancelled,
    TimedOut,
}

impl ConfirmationStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ConfirmationStatus::Pending)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Approve => write!(f, "approve"),
            Decision::Deny => write!(f, "deny"),
        }
    }
}

impl std::fmt::Display for ConfirmationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfirmationStatus::Pending => write!(f, "pending"),
            ConfirmationStatus::Responded => write!(f, "responded"),
            ConfirmationStatus::Cancelled => write!(f, "cancelled"),
            ConfirmationStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    /// Accepts the wire names plus the short forms hooks and humans use.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" | "allow" | "yes" | "y" | "ok" => Ok(Decision::Approve),
            "deny" | "no" | "n" | "reject" => Ok(Decision::Deny),
            _ => Err(format!("unknown decision: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Decision::Approve).unwrap(), "\"approve\"");
        assert_eq!(serde_json::to_string(&Decision::Deny).unwrap(), "\"deny\"");
    }

    #[test]
    fn timed_out_uses_snake_case() {
        let json = serde_json::to_string(&ConfirmationStatus::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
        assert_eq!(ConfirmationStatus::TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn decision_parses_aliases() {
        assert_eq!("OK".parse::<Decision>().unwrap(), Decision::Approve);
        assert_eq!(" n ".parse::<Decision>().unwrap(), Decision::Deny);
        assert!("maybe".parse::<Decision>().is_err());
    }
}
