//! Synced ledger entities

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use super::LockState;

/// Business fields of a ledger record, keyed by field name.
pub type Fields = Map<String, Value>;

/// The three entity kinds mirrored into the spreadsheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    /// Booking request (one row per tour booking)
    Request,
    /// Operator cost line attached to a booking
    Operator,
    /// Revenue / payment received for a booking
    Revenue,
}

impl EntityKind {
    pub const ALL: [Self; 3] = [Self::Request, Self::Operator, Self::Revenue];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "Request",
            Self::Operator => "Operator",
            Self::Revenue => "Revenue",
        }
    }

    /// Backing table in the ledger database
    pub const fn table(self) -> &'static str {
        match self {
            Self::Request => "requests",
            Self::Operator => "operators",
            Self::Revenue => "revenues",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "request" => Ok(Self::Request),
            "operator" => Ok(Self::Operator),
            "revenue" => Ok(Self::Revenue),
            other => Err(format!("unknown entity type `{other}`")),
        }
    }
}

/// A stored ledger record of any kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: EntityKind,
    /// Business identifier (see `ids`)
    pub id: String,
    pub fields: Fields,
    pub lock: LockState,
    /// 1-based spreadsheet row, known after the first append
    pub sheet_row_index: Option<i64>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
}

impl EntityRecord {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn is_locked(&self) -> bool {
        !self.lock.is_editable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_parses_case_insensitively() {
        assert_eq!("revenue".parse::<EntityKind>(), Ok(EntityKind::Revenue));
        assert_eq!(" Request ".parse::<EntityKind>(), Ok(EntityKind::Request));
        assert!("booking".parse::<EntityKind>().is_err());
    }

    #[test]
    fn entity_kind_display_round_trips() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.to_string().parse::<EntityKind>(), Ok(kind));
        }
    }
}
