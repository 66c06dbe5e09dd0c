//! State transitions of the alert manager.
//!
//! Every change to an alert or an isolation action is expressed as an
//! [`AimEvent`]. The manager journals the event and then applies it, and
//! replay applies the same events in the same order, so the state after replay
//! is the state before shutdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tw_types::{
    Alert, IsolationAction, IsolationSource, Priority, ReleaseReason, WindowPredicate,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AimEvent {
    AlertRaised {
        alert: Alert,
    },
    /// A duplicate candidate folded into an open alert.
    AlertRepeated {
        alert_id: Uuid,
        seq: u64,
        at: DateTime<Utc>,
    },
    AlertAcked {
        alert_id: Uuid,
        assignee: String,
        at: DateTime<Utc>,
    },
    AlertResolved {
        alert_id: Uuid,
        notes: Option<String>,
        automatic: bool,
        at: DateTime<Utc>,
    },
    AlertEscalated {
        alert_id: Uuid,
        priority: Priority,
        at: DateTime<Utc>,
    },
    NotificationFailed {
        alert_id: Uuid,
        sink: String,
    },
    /// Still undelivered when the shutdown flush deadline passed.
    NotificationAbandoned {
        alert_id: Uuid,
        sink: String,
    },
    IsolationActivated {
        action: IsolationAction,
    },
    /// A later activation request for an already isolated target.
    IsolationDuplicate {
        action_id: Uuid,
        source: IsolationSource,
        rule_id: Option<String>,
        at: DateTime<Utc>,
    },
    /// A manual request took over an automatic or rule-triggered action.
    IsolationOverridden {
        action_id: Uuid,
        principal: String,
        reason: String,
        planned_release_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    IsolationRouted {
        action_id: Uuid,
        acked: bool,
    },
    ReleaseRequested {
        action_id: Uuid,
        predicate: WindowPredicate,
        deadline: DateTime<Utc>,
        automatic: bool,
        /// Records already satisfying the predicate when the request opened.
        satisfied: usize,
        principal: Option<String>,
        at: DateTime<Utc>,
    },
    /// Pending release went back to isolated.
    ReleaseReverted {
        action_id: Uuid,
        stalled: bool,
        at: DateTime<Utc>,
    },
    IsolationReleased {
        action_id: Uuid,
        reason: ReleaseReason,
        principal: Option<String>,
        at: DateTime<Utc>,
    },
}

impl AimEvent {
    pub fn is_isolation(&self) -> bool {
        matches!(
            self,
            AimEvent::IsolationActivated { .. }
                | AimEvent::IsolationDuplicate { .. }
                | AimEvent::IsolationOverridden { .. }
                | AimEvent::IsolationRouted { .. }
                | AimEvent::ReleaseRequested { .. }
                | AimEvent::ReleaseReverted { .. }
                | AimEvent::IsolationReleased { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            AimEvent::AlertRaised { .. } => "alert_raised",
            AimEvent::AlertRepeated { .. } => "alert_repeated",
            AimEvent::AlertAcked { .. } => "alert_acked",
            AimEvent::AlertResolved { .. } => "alert_resolved",
            AimEvent::AlertEscalated { .. } => "alert_escalated",
            AimEvent::NotificationFailed { .. } => "notification_failed",
            AimEvent::NotificationAbandoned { .. } => "notification_abandoned",
            AimEvent::IsolationActivated { .. } => "isolation_activated",
            AimEvent::IsolationDuplicate { .. } => "isolation_duplicate",
            AimEvent::IsolationOverridden { .. } => "isolation_overridden",
            AimEvent::IsolationRouted { .. } => "isolation_routed",
            AimEvent::ReleaseRequested { .. } => "release_requested",
            AimEvent::ReleaseReverted { .. } => "release_reverted",
            AimEvent::IsolationReleased { .. } => "isolation_released",
        }
    }
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub seq: u64,
    pub written_at: DateTime<Utc>,
    pub event: AimEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_types::{AlertPayload, CandidateAlert, Target};

    #[test]
    fn record_shape_is_tagged() {
        let alert = Alert::from_candidate(
            Uuid::new_v4(),
            CandidateAlert {
                rule_id: "var-limit".into(),
                target: Target::System,
                priority: Priority::High,
                triggered_seq: 4,
                triggered_at: Utc::now(),
                rule_set_version: 1,
                payload: AlertPayload::internal("x"),
            },
        );
        let record = JournalRecord {
            seq: 1,
            written_at: Utc::now(),
            event: AimEvent::AlertRaised { alert },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"]["event"], "alert_raised");
        assert!(json["event"]["alert"]["payload"]["value"].is_null());

        let back: JournalRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.seq, 1);
        assert_eq!(back.event.name(), "alert_raised");
        assert!(!back.event.is_isolation());
    }
}
