//! Alert lifecycle: deduplication, acknowledge, resolve and escalation.
//!
//! Decision methods take `&self` and return the event that the manager must
//! commit; only [`AlertBook::apply`] mutates.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

use tw_types::{
    AckState, Alert, AlertError, AlertFilter, AlertStats, CandidateAlert, Priority, Target,
};

use crate::events::AimEvent;

#[derive(Debug, Default)]
pub struct AlertBook {
    alerts: HashMap<Uuid, Alert>,
    // Insertion order, for listings
    order: Vec<Uuid>,
    // (rule_id, target key) -> unresolved alert
    open: HashMap<(String, String), Uuid>,
    // Resolved alerts in resolution order, oldest evicted first
    resolved: VecDeque<Uuid>,
    retain_resolved: usize,
    total_raised: u64,
    duplicates_folded: u64,
    escalations: u64,
    notification_failed: u64,
}

/// Resolved alerts kept when no retention is configured.
pub const DEFAULT_RETAINED_RESOLVED: usize = 10_000;

impl AlertBook {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_RESOLVED)
    }

    /// Keeps at most `resolved` resolved alerts; open alerts are never dropped.
    pub fn with_retention(resolved: usize) -> Self {
        Self {
            retain_resolved: resolved.max(1),
            ..Self::default()
        }
    }

    pub fn get(&self, alert_id: &Uuid) -> Option<&Alert> {
        self.alerts.get(alert_id)
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Alerts matching `filter`, oldest first.
    pub fn list(&self, filter: AlertFilter) -> Vec<Alert> {
        self.order
            .iter()
            .filter_map(|id| self.alerts.get(id))
            .filter(|a| filter.matches(a))
            .cloned()
            .collect()
    }

    pub fn open_for(&self, rule_id: &str, target: &Target) -> Option<&Alert> {
        self.open
            .get(&(rule_id.to_string(), target.key()))
            .and_then(|id| self.alerts.get(id))
    }

    /// A new alert, or a repeat folded into the open alert for the same
    /// `(rule_id, target)`.
    pub fn on_candidate(&self, candidate: CandidateAlert, alert_id: Uuid) -> AimEvent {
        match self.open.get(&candidate.dedup_key()) {
            Some(existing) => AimEvent::AlertRepeated {
                alert_id: *existing,
                seq: candidate.triggered_seq,
                at: candidate.triggered_at,
            },
            None => AimEvent::AlertRaised {
                alert: Alert::from_candidate(alert_id, candidate),
            },
        }
    }

    pub fn ack(&self, alert_id: Uuid, assignee: &str, now: DateTime<Utc>) -> Result<AimEvent, AlertError> {
        let alert = self.require(alert_id)?;
        if alert.ack_state != AckState::New {
            return Err(transition(alert, AckState::Acked));
        }
        Ok(AimEvent::AlertAcked {
            alert_id,
            assignee: assignee.to_string(),
            at: now.max(alert.triggered_at),
        })
    }

    pub fn resolve(
        &self,
        alert_id: Uuid,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<AimEvent, AlertError> {
        let alert = self.require(alert_id)?;
        if alert.ack_state == AckState::Resolved {
            return Err(transition(alert, AckState::Resolved));
        }
        let floor = alert.acked_at.unwrap_or(alert.triggered_at);
        Ok(AimEvent::AlertResolved {
            alert_id,
            notes,
            automatic: false,
            at: now.max(floor),
        })
    }

    /// Raises one level, or to `to` when given. The target level must be
    /// above the current one.
    pub fn escalate(
        &self,
        alert_id: Uuid,
        to: Option<Priority>,
        now: DateTime<Utc>,
    ) -> Result<AimEvent, AlertError> {
        let alert = self.require(alert_id)?;
        let priority = to.unwrap_or_else(|| alert.priority.raised());
        if !alert.is_open() || priority <= alert.priority {
            return Err(AlertError::InvalidTransition {
                alert_id,
                from: alert.priority.to_string(),
                to: priority.to_string(),
            });
        }
        Ok(AimEvent::AlertEscalated {
            alert_id,
            priority,
            at: now,
        })
    }

    /// Resolution of the open alert for a rule whose condition cleared.
    pub fn auto_resolve(&self, rule_id: &str, target: &Target, now: DateTime<Utc>) -> Option<AimEvent> {
        let alert = self.open_for(rule_id, target)?;
        let floor = alert.acked_at.unwrap_or(alert.triggered_at);
        Some(AimEvent::AlertResolved {
            alert_id: alert.alert_id,
            notes: Some("condition cleared".to_string()),
            automatic: true,
            at: now.max(floor),
        })
    }

    /// Alerts still `new` a full interval after they were raised or last
    /// escalated.
    pub fn due_escalations(&self, now: DateTime<Utc>, unacked_after_ms: u64) -> Vec<AimEvent> {
        let interval = Duration::milliseconds(unacked_after_ms.min(i64::MAX as u64) as i64);
        self.open
            .values()
            .filter_map(|id| self.alerts.get(id))
            .filter(|a| a.ack_state == AckState::New && a.priority < Priority::Emergency)
            .filter(|a| now - a.escalated_at.unwrap_or(a.triggered_at) >= interval)
            .map(|a| AimEvent::AlertEscalated {
                alert_id: a.alert_id,
                priority: a.priority.raised(),
                at: now,
            })
            .collect()
    }

    pub fn stats(&self) -> AlertStats {
        let mut by_priority: BTreeMap<String, u64> =
            Priority::ALL.iter().map(|p| (p.to_string(), 0)).collect();
        let mut by_state: BTreeMap<String, u64> = [AckState::New, AckState::Acked, AckState::Resolved]
            .iter()
            .map(|s| (s.to_string(), 0))
            .collect();
        for alert in self.alerts.values() {
            *by_priority.entry(alert.priority.to_string()).or_default() += 1;
            *by_state.entry(alert.ack_state.to_string()).or_default() += 1;
        }
        AlertStats {
            total_raised: self.total_raised,
            duplicates_folded: self.duplicates_folded,
            escalations: self.escalations,
            notification_failed: self.notification_failed,
            by_priority,
            by_state,
        }
    }

    /// Applies a committed alert event. Isolation events are ignored.
    pub fn apply(&mut self, event: &AimEvent) -> Result<(), String> {
        match event {
            AimEvent::AlertRaised { alert } => {
                if self.alerts.contains_key(&alert.alert_id) {
                    return Err(format!("alert {} raised twice", alert.alert_id));
                }
                if alert.is_open() {
                    self.open.insert(alert.dedup_key(), alert.alert_id);
                }
                self.order.push(alert.alert_id);
                self.alerts.insert(alert.alert_id, alert.clone());
                self.total_raised += 1;
            }
            AimEvent::AlertRepeated { alert_id, seq, at } => {
                let alert = self.require_mut(*alert_id)?;
                alert.hit_count += 1;
                alert.last_seen = alert.last_seen.max(*at);
                alert.last_seen_seq = alert.last_seen_seq.max(*seq);
                self.duplicates_folded += 1;
            }
            AimEvent::AlertAcked { alert_id, assignee, at } => {
                let alert = self.require_mut(*alert_id)?;
                if alert.ack_state != AckState::New {
                    return Err(format!("alert {} acked from {}", alert_id, alert.ack_state));
                }
                alert.ack_state = AckState::Acked;
                alert.assignee = Some(assignee.clone());
                alert.acked_at = Some(*at);
            }
            AimEvent::AlertResolved { alert_id, notes, at, .. } => {
                let alert = self.require_mut(*alert_id)?;
                if alert.ack_state == AckState::Resolved {
                    return Err(format!("alert {} resolved twice", alert_id));
                }
                alert.ack_state = AckState::Resolved;
                alert.resolved_at = Some(*at);
                alert.resolution_notes = notes.clone();
                let key = alert.dedup_key();
                if self.open.get(&key) == Some(alert_id) {
                    self.open.remove(&key);
                }
                self.resolved.push_back(*alert_id);
                self.evict_resolved();
            }
            AimEvent::AlertEscalated { alert_id, priority, at } => {
                let alert = self.require_mut(*alert_id)?;
                alert.priority = *priority;
                alert.escalation_count += 1;
                alert.escalated_at = Some(*at);
                self.escalations += 1;
            }
            AimEvent::NotificationFailed { alert_id, .. } => {
                // Delivery can outlive a resolved alert that was since evicted
                if let Some(alert) = self.alerts.get_mut(alert_id) {
                    if !alert.notification_failed {
                        alert.notification_failed = true;
                        self.notification_failed += 1;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn evict_resolved(&mut self) {
        let limit = self.retain_resolved.max(1);
        while self.resolved.len() > limit {
            if let Some(id) = self.resolved.pop_front() {
                self.alerts.remove(&id);
            }
        }
        if self.order.len() > 2 * self.alerts.len().max(16) {
            let alerts = &self.alerts;
            self.order.retain(|id| alerts.contains_key(id));
        }
    }

    fn require(&self, alert_id: Uuid) -> Result<&Alert, AlertError> {
        self.alerts.get(&alert_id).ok_or(AlertError::NotFound { alert_id })
    }

    fn require_mut(&mut self, alert_id: Uuid) -> Result<&mut Alert, String> {
        self.alerts
            .get_mut(&alert_id)
            .ok_or_else(|| format!("unknown alert {}", alert_id))
    }
}

fn transition(alert: &Alert, to: AckState) -> AlertError {
    AlertError::InvalidTransition {
        alert_id: alert.alert_id,
        from: alert.ack_state.to_string(),
        to: to.to_string(),
    }
}
