//! Authenticity rule engine.
//!
//! Runs a fixed battery of heuristic checks over a batch's parsed event log
//! plus the scanned unit's identity. Deterministic for the same inputs,
//! read-only, and never fails, so callers always get a verdict they can
//! dereference.
//!
//! A `NOT_SAFE` verdict downgrades the scan regardless of signature
//! validity: cryptographic validity is necessary but not sufficient.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ledger::EventLogEntry;

/// Event discriminators the rule battery keys on.
const BATCH_CREATED: &str = "BATCH_CREATED";
const OWNERSHIP_TRANSFER: &str = "OWNERSHIP_TRANSFER";
const UNIT_DISPENSED: &str = "UNIT_DISPENSED";

/// Events that flag the batch or unit outright.
const FLAG_EVENTS: [&str; 4] = [
    "BATCH_FLAGGED",
    "UNIT_FLAGGED",
    "COUNTERFEIT_REPORT",
    "RECALL_ISSUED",
];

/// Verdict status for a scanned unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthenticityStatus {
    Safe,
    NotSafe,
}

impl AuthenticityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::NotSafe => "NOT_SAFE",
        }
    }
}

/// Result of the authenticity rule battery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticityVerdict {
    pub status: AuthenticityStatus,
    pub reasons: Vec<String>,
}

impl AuthenticityVerdict {
    pub fn is_not_safe(&self) -> bool {
        self.status == AuthenticityStatus::NotSafe
    }
}

/// Identity of the unit under verification, as stored by the platform.
#[derive(Debug, Clone, Copy)]
pub struct UnitIdentity<'a> {
    pub unit_id: &'a str,
    pub batch_id: &'a str,
    pub organization_id: &'a str,
    pub topic_id: &'a str,
}

/// Run every authenticity check over the event log.
///
/// Each rule appends a reason; any reason makes the verdict `NOT_SAFE`.
pub fn run_unit_authenticity_checks(
    events: &[EventLogEntry],
    identity: &UnitIdentity<'_>,
) -> AuthenticityVerdict {
    let mut reasons = Vec::new();

    // Rule 1: the batch must have a recorded creation event.
    let creations = events.iter().filter(|e| e.event == BATCH_CREATED).count();
    if creations == 0 {
        reasons.push(format!(
            "no batch creation event recorded on topic {}",
            identity.topic_id
        ));
    }

    // Rule 2: more than one creation event means the batch identity was
    // re-used (cloned packaging run).
    if creations > 1 {
        reasons.push(format!(
            "batch {} has {} creation events recorded",
            identity.batch_id, creations
        ));
    }

    // Rule 3: every entry that names a batch must name this batch.
    for e in events {
        if let Some(ref b) = e.batch_id {
            if b != identity.batch_id {
                reasons.push(format!(
                    "event log references foreign batch {} (expected {})",
                    b, identity.batch_id
                ));
                break;
            }
        }
    }

    // Rule 4: flag/recall/counterfeit events poison the whole batch.
    for e in events {
        if FLAG_EVENTS.contains(&e.event.as_str()) {
            let scope = e.unit_id.as_deref().unwrap_or("batch");
            reasons.push(format!("{} recorded against {}", e.event, scope));
        }
    }

    // Rule 5: a unit already dispensed to a patient should not be scanned
    // at point of sale again.
    if events
        .iter()
        .any(|e| e.event == UNIT_DISPENSED && e.unit_id.as_deref() == Some(identity.unit_id))
    {
        reasons.push(format!(
            "unit {} was already dispensed and re-entered circulation",
            identity.unit_id
        ));
    }

    // Rule 6: the last recorded ownership transfer must end at the
    // organization that owns the batch now. Only applies when transfers
    // exist at all.
    let last_transfer = events
        .iter()
        .filter(|e| e.event == OWNERSHIP_TRANSFER)
        .last();
    if let Some(t) = last_transfer {
        if let Some(ref org) = t.organization_id {
            if org != identity.organization_id {
                reasons.push(format!(
                    "last recorded transfer ends at organization {} but batch is owned by {}",
                    org, identity.organization_id
                ));
            }
        }
    }

    let status = if reasons.is_empty() {
        AuthenticityStatus::Safe
    } else {
        AuthenticityStatus::NotSafe
    };

    if status == AuthenticityStatus::NotSafe {
        info!(
            unit_id = identity.unit_id,
            batch_id = identity.batch_id,
            reasons = reasons.len(),
            "authenticity checks flagged unit"
        );
    }

    AuthenticityVerdict { status, reasons }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(event: &str) -> EventLogEntry {
        EventLogEntry {
            kind: crate::ledger::EVENT_LOG_TYPE.to_string(),
            event: event.to_string(),
            batch_id: None,
            unit_id: None,
            organization_id: None,
            timestamp: None,
            details: None,
        }
    }

    fn identity() -> UnitIdentity<'static> {
        UnitIdentity {
            unit_id: "unit-1",
            batch_id: "ABC-123",
            organization_id: "org-1",
            topic_id: "0.0.100",
        }
    }

    #[test]
    fn clean_history_is_safe() {
        let mut creation = entry("BATCH_CREATED");
        creation.batch_id = Some("ABC-123".into());
        let verdict = run_unit_authenticity_checks(&[creation], &identity());
        assert_eq!(verdict.status, AuthenticityStatus::Safe);
        assert!(verdict.reasons.is_empty());
    }

    #[test]
    fn missing_creation_event_is_not_safe() {
        let verdict = run_unit_authenticity_checks(&[], &identity());
        assert!(verdict.is_not_safe());
        assert!(verdict.reasons[0].contains("creation"));
    }

    #[test]
    fn duplicate_creation_is_not_safe() {
        let events = vec![entry("BATCH_CREATED"), entry("BATCH_CREATED")];
        let verdict = run_unit_authenticity_checks(&events, &identity());
        assert!(verdict.is_not_safe());
        assert!(verdict.reasons.iter().any(|r| r.contains("2 creation")));
    }

    #[test]
    fn foreign_batch_reference_is_not_safe() {
        let mut creation = entry("BATCH_CREATED");
        creation.batch_id = Some("XYZ-999".into());
        let verdict = run_unit_authenticity_checks(&[creation], &identity());
        assert!(verdict.is_not_safe());
        assert!(verdict.reasons.iter().any(|r| r.contains("foreign batch")));
    }

    #[test]
    fn flag_events_are_not_safe() {
        for flag in ["BATCH_FLAGGED", "UNIT_FLAGGED", "COUNTERFEIT_REPORT", "RECALL_ISSUED"] {
            let events = vec![entry("BATCH_CREATED"), entry(flag)];
            let verdict = run_unit_authenticity_checks(&events, &identity());
            assert!(verdict.is_not_safe(), "{flag} must flag the scan");
            assert!(verdict.reasons.iter().any(|r| r.contains(flag)));
        }
    }

    #[test]
    fn dispensed_unit_rescan_is_not_safe() {
        let mut dispensed = entry("UNIT_DISPENSED");
        dispensed.unit_id = Some("unit-1".into());
        let events = vec![entry("BATCH_CREATED"), dispensed];
        let verdict = run_unit_authenticity_checks(&events, &identity());
        assert!(verdict.is_not_safe());

        // A different unit being dispensed is fine.
        let mut other = entry("UNIT_DISPENSED");
        other.unit_id = Some("unit-2".into());
        let events = vec![entry("BATCH_CREATED"), other];
        let verdict = run_unit_authenticity_checks(&events, &identity());
        assert!(!verdict.is_not_safe());
    }

    #[test]
    fn transfer_chain_must_end_at_current_owner() {
        let mut t1 = entry("OWNERSHIP_TRANSFER");
        t1.organization_id = Some("org-2".into());
        let mut t2 = entry("OWNERSHIP_TRANSFER");
        t2.organization_id = Some("org-1".into());

        // Last transfer ends at org-1 (the owner): safe.
        let events = vec![entry("BATCH_CREATED"), t1.clone(), t2];
        let verdict = run_unit_authenticity_checks(&events, &identity());
        assert!(!verdict.is_not_safe());

        // Last transfer ends elsewhere: not safe.
        let events = vec![entry("BATCH_CREATED"), t1];
        let verdict = run_unit_authenticity_checks(&events, &identity());
        assert!(verdict.is_not_safe());
    }

    #[test]
    fn verdict_is_deterministic() {
        let events = vec![entry("BATCH_CREATED"), entry("BATCH_FLAGGED")];
        let a = run_unit_authenticity_checks(&events, &identity());
        let b = run_unit_authenticity_checks(&events, &identity());
        assert_eq!(a.status, b.status);
        assert_eq!(a.reasons, b.reasons);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let verdict = AuthenticityVerdict {
            status: AuthenticityStatus::NotSafe,
            reasons: vec!["x".into()],
        };
        let json = serde_json::to_string(&verdict).unwrap();
        assert!(json.contains("\"NOT_SAFE\""));
    }
}
