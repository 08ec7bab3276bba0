//! Vulnerability severity lattice.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Vulnerability severity of a manifest, as reported by the scanner and
/// aggregated over submanifests.
///
/// Severities are ordered `Clean < Negligible < Low < Medium < High <
/// Critical < Unknown`. `Pending` sits outside the order: it marks a report
/// that is still being computed and absorbs everything it is merged with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Clean,
    Negligible,
    Low,
    Medium,
    High,
    Critical,
    Unknown,
    Pending,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Clean" => Some(Self::Clean),
            "Negligible" => Some(Self::Negligible),
            "Low" => Some(Self::Low),
            "Medium" => Some(Self::Medium),
            "High" => Some(Self::High),
            "Critical" => Some(Self::Critical),
            "Unknown" => Some(Self::Unknown),
            "Pending" => Some(Self::Pending),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "Clean",
            Self::Negligible => "Negligible",
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
            Self::Unknown => "Unknown",
            Self::Pending => "Pending",
        }
    }

    /// Merge two severities. Commutative, associative, idempotent; `Pending`
    /// absorbs, otherwise the higher severity wins.
    pub fn merge(self, other: Self) -> Self {
        if self == Self::Pending || other == Self::Pending {
            Self::Pending
        } else {
            self.max(other)
        }
    }

    /// Merge a whole collection. The merge of an empty set is `Clean`.
    pub fn merge_all(severities: impl IntoIterator<Item = Self>) -> Self {
        severities
            .into_iter()
            .fold(Self::Clean, |acc, s| acc.merge(s))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
