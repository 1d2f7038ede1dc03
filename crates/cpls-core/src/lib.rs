//! Core domain model shared by the CPLS pipeline crates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cpls-core";

/// One parsed tabular record: column name -> raw string value.
pub type Row = BTreeMap<String, String>;

/// Current name of the unique-identifier column used as the upsert key.
pub const LOCATION_ID_FIELD: &str = "CQC Location ID (for office use only)";

/// Older exports carried the identifier under this name; the reconciler
/// folds it into [`LOCATION_ID_FIELD`] before submission.
pub const LEGACY_LOCATION_ID_FIELD: &str = "CQC Location ID";

/// Identifier candidates in resolution order, current name first.
pub const LOCATION_ID_CANDIDATES: &[&str] = &[LOCATION_ID_FIELD, LEGACY_LOCATION_ID_FIELD];

pub const PROVIDER_ID_FIELD: &str = "CQC Provider ID";

/// Provider-id candidates in resolution order.
pub const PROVIDER_ID_CANDIDATES: &[&str] = &[PROVIDER_ID_FIELD, "Provider ID"];

pub const PROVIDER_NAME_FIELD: &str = "Provider Name";

/// Search-name candidates in resolution order.
pub const PROVIDER_NAME_CANDIDATES: &[&str] = &[PROVIDER_NAME_FIELD, "Name"];

/// Resolve the first candidate column holding a non-blank value, trimmed.
///
/// Shared by the enrichment pipeline, the remote index builder, and the
/// reconciler so legacy column aliases are handled in exactly one place.
pub fn resolve_field<'a>(row: &'a Row, candidates: &[&str]) -> Option<&'a str> {
    for key in candidates {
        if let Some(value) = row.get(*key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
    }
    None
}

/// Outcome of a single source download. Terminal: built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub ok: bool,
    pub message: String,
    pub bytes: u64,
    pub lines: u64,
    pub sha256: Option<String>,
}

impl FetchOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            bytes: 0,
            lines: 0,
            sha256: None,
        }
    }
}

/// Aggregate status of a run across its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Partial,
    Error,
}

impl RunStatus {
    /// Status when each source matters independently (download-only runs).
    pub fn aggregate(source_flags: &[bool]) -> Self {
        if source_flags.iter().all(|ok| *ok) {
            RunStatus::Ok
        } else if source_flags.iter().any(|ok| *ok) {
            RunStatus::Partial
        } else {
            RunStatus::Error
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Partial => "partial",
            RunStatus::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn resolve_field_prefers_earlier_candidates() {
        let row = row(&[
            (LOCATION_ID_FIELD, "1-111"),
            (LEGACY_LOCATION_ID_FIELD, "1-999"),
        ]);
        assert_eq!(resolve_field(&row, LOCATION_ID_CANDIDATES), Some("1-111"));
    }

    #[test]
    fn resolve_field_falls_back_past_blank_values() {
        let row = row(&[
            (LOCATION_ID_FIELD, "   "),
            (LEGACY_LOCATION_ID_FIELD, " 1-999 "),
        ]);
        assert_eq!(resolve_field(&row, LOCATION_ID_CANDIDATES), Some("1-999"));
    }

    #[test]
    fn resolve_field_returns_none_when_all_candidates_blank() {
        let row = row(&[(LOCATION_ID_FIELD, ""), ("Unrelated", "x")]);
        assert_eq!(resolve_field(&row, LOCATION_ID_CANDIDATES), None);
    }

    #[test]
    fn aggregate_status_covers_all_combinations() {
        assert_eq!(RunStatus::aggregate(&[true, true]), RunStatus::Ok);
        assert_eq!(RunStatus::aggregate(&[true, false]), RunStatus::Partial);
        assert_eq!(RunStatus::aggregate(&[false, false]), RunStatus::Error);
    }

    #[test]
    fn fetch_failure_carries_message_and_zero_counts() {
        let outcome = FetchOutcome::failure("boom");
        assert!(!outcome.ok);
        assert_eq!(outcome.message, "boom");
        assert_eq!(outcome.bytes, 0);
        assert_eq!(outcome.lines, 0);
        assert!(outcome.sha256.is_none());
    }
}
