//! The alert & isolation manager.
//!
//! Owns the alert and isolation books, the journal, the notifier and the
//! order router. Every transition goes through [`AlertManager::process`]:
//! journal, apply, then side effects (notifications, router requests).
//! A journal failure switches the manager to safe mode.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tw_rules::Evaluation;
use tw_types::{
    internal_error, ActivationRequest, Alert, AlertFilter, AlertPayload, AlertStats,
    CandidateAlert, Clock, Counters, IsolationAction, JournalError, Priority, ReleaseRequest,
    Target, TwError, TwResult, RELEASE_STALLED_RULE, SYSTEM_UNSAFE_RULE,
};

use crate::alert_book::AlertBook;
use crate::events::{AimEvent, JournalRecord};
use crate::isolation_book::IsolationBook;
use crate::journal::{Journal, JournalWriter};
use crate::router::OrderRouter;
use crate::sinks::{DeliveryOutcome, FlushReport, Notifier};

/// Called once when the manager enters safe mode.
pub type FatalHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplaySummary {
    pub records: usize,
    pub last_seq: u64,
    pub open_alerts: usize,
    pub active_isolations: usize,
}

pub struct AlertManager {
    alerts: AlertBook,
    isolations: IsolationBook,
    journal: JournalWriter,
    notifier: Notifier,
    router: Box<dyn OrderRouter>,
    clock: Arc<dyn Clock>,
    counters: Counters,
    escalate_after_ms: u64,
    unsafe_reason: Option<String>,
    on_fatal: Option<FatalHook>,
    last_metrics_seq: u64,
}

impl AlertManager {
    pub fn new(
        isolations: IsolationBook,
        journal: Box<dyn Journal>,
        notifier: Notifier,
        router: Box<dyn OrderRouter>,
        clock: Arc<dyn Clock>,
        counters: Counters,
        escalate_after_ms: u64,
    ) -> Self {
        Self {
            alerts: AlertBook::new(),
            isolations,
            journal: JournalWriter::new(journal),
            notifier,
            router,
            clock,
            counters,
            escalate_after_ms,
            unsafe_reason: None,
            on_fatal: None,
            last_metrics_seq: 0,
        }
    }

    /// Caps the resolved alerts kept in memory. Set before replay so the
    /// replayed book is trimmed the same way as the live one.
    pub fn with_alert_retention(mut self, resolved: usize) -> Self {
        self.alerts = AlertBook::with_retention(resolved);
        self
    }

    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.on_fatal = Some(hook);
        self
    }

    pub fn unsafe_reason(&self) -> Option<&str> {
        self.unsafe_reason.as_deref()
    }

    // --- replay ---

    /// Rebuilds state from journal records. Must run before the first
    /// evaluation. Active isolations are re-requested from the router.
    pub fn replay(&mut self, records: Vec<JournalRecord>) -> Result<ReplaySummary, JournalError> {
        let mut last_seq = 0;
        let count = records.len();
        for record in records {
            if record.seq <= last_seq {
                return Err(JournalError::Inconsistent {
                    seq: record.seq,
                    message: format!("sequence does not follow {}", last_seq),
                });
            }
            self.apply(&record.event)
                .map_err(|e| JournalError::Inconsistent {
                    seq: record.seq,
                    message: e.to_string(),
                })?;
            last_seq = record.seq;
        }
        self.journal.resume_after(last_seq);

        for action in self.isolations.list(true) {
            if let Err(e) = self.router.request_isolation(
                action.action_id,
                action.method,
                &action.target,
                &action.reason,
            ) {
                warn!(action_id = %action.action_id, error = %e, "router did not take replayed isolation");
            }
        }

        let summary = ReplaySummary {
            records: count,
            last_seq,
            open_alerts: self.alerts.list(AlertFilter::Active).len(),
            active_isolations: self.isolations.active_count(),
        };
        info!(
            records = summary.records,
            last_seq,
            open_alerts = summary.open_alerts,
            active_isolations = summary.active_isolations,
            "journal replayed"
        );
        Ok(summary)
    }

    // --- pipeline input ---

    pub fn handle_evaluation(&mut self, evaluation: Evaluation) {
        let now = self.clock.now();
        self.last_metrics_seq = evaluation.metrics.seq;
        let raised: HashSet<(String, Target)> = evaluation
            .alerts
            .iter()
            .map(|c| (c.rule_id.clone(), c.target.clone()))
            .collect();

        for candidate in evaluation.alerts {
            let event = self.alerts.on_candidate(candidate, Uuid::new_v4());
            self.process_logged(event);
        }
        for candidate in &evaluation.isolations {
            let event = self.isolations.from_candidate(candidate, Uuid::new_v4(), now);
            self.process_logged(event);
        }
        for (rule_id, target) in &evaluation.cleared {
            if raised.contains(&(rule_id.clone(), target.clone())) {
                continue;
            }
            if let Some(event) = self.alerts.auto_resolve(rule_id, target, now) {
                self.process_logged(event);
            }
        }
        for event in self.isolations.on_metrics(&evaluation.metrics, now) {
            self.process_logged(event);
        }
        self.poll_notifications(now);
    }

    /// Time-driven work: auto-escalation, planned and stalled releases,
    /// notification retries.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        if self.escalate_after_ms > 0 {
            for event in self.alerts.due_escalations(now, self.escalate_after_ms) {
                self.process_logged(event);
            }
        }
        for event in self.isolations.due(now) {
            self.process_logged(event);
        }
        self.poll_notifications(now);
    }

    /// Internally generated alert, e.g. sustained backpressure.
    pub fn raise(&mut self, candidate: CandidateAlert) -> TwResult<Alert> {
        let event = self.alerts.on_candidate(candidate, Uuid::new_v4());
        let alert_id = match &event {
            AimEvent::AlertRaised { alert } => alert.alert_id,
            AimEvent::AlertRepeated { alert_id, .. } => *alert_id,
            _ => return Err(internal_error!("unexpected event {}", event.name())),
        };
        self.process(event)?;
        self.poll_notifications(self.clock.now());
        self.alert(alert_id)
    }

    // --- operator commands ---

    pub fn ack(&mut self, alert_id: Uuid, assignee: &str) -> TwResult<Alert> {
        self.ensure_safe()?;
        let event = self.alerts.ack(alert_id, assignee, self.clock.now())?;
        self.process(event)?;
        self.alert(alert_id)
    }

    pub fn resolve(&mut self, alert_id: Uuid, notes: Option<String>) -> TwResult<Alert> {
        self.ensure_safe()?;
        let event = self.alerts.resolve(alert_id, notes, self.clock.now())?;
        self.process(event)?;
        self.alert(alert_id)
    }

    pub fn escalate(&mut self, alert_id: Uuid, to: Option<Priority>) -> TwResult<Alert> {
        self.ensure_safe()?;
        let now = self.clock.now();
        let event = self.alerts.escalate(alert_id, to, now)?;
        self.process(event)?;
        self.poll_notifications(now);
        self.alert(alert_id)
    }

    pub fn activate(&mut self, request: &ActivationRequest) -> TwResult<IsolationAction> {
        self.ensure_safe()?;
        let event = self
            .isolations
            .manual_activate(request, Uuid::new_v4(), self.clock.now())?;
        let action_id = match &event {
            AimEvent::IsolationActivated { action } => action.action_id,
            AimEvent::IsolationOverridden { action_id, .. }
            | AimEvent::IsolationDuplicate { action_id, .. } => *action_id,
            _ => return Err(internal_error!("unexpected event {}", event.name())),
        };
        self.process(event)?;
        self.isolation(action_id)
    }

    pub fn request_release(&mut self, action_id: Uuid, request: &ReleaseRequest) -> TwResult<IsolationAction> {
        self.ensure_safe()?;
        let event = self
            .isolations
            .request_release(action_id, request, self.clock.now())?;
        self.process(event)?;
        self.isolation(action_id)
    }

    pub fn force_release(&mut self, action_id: Uuid, principal: &str) -> TwResult<IsolationAction> {
        self.ensure_safe()?;
        let event = self
            .isolations
            .force_release(action_id, principal, self.clock.now())?;
        self.process(event)?;
        self.isolation(action_id)
    }

    // --- queries ---

    pub fn alerts(&self, filter: AlertFilter) -> Vec<Alert> {
        self.alerts.list(filter)
    }

    pub fn get_alert(&self, alert_id: &Uuid) -> Option<Alert> {
        self.alerts.get(alert_id).cloned()
    }

    pub fn stats(&self) -> AlertStats {
        self.alerts.stats()
    }

    pub fn isolations(&self, active_only: bool) -> Vec<IsolationAction> {
        self.isolations.list(active_only)
    }

    pub fn get_isolation(&self, action_id: &Uuid) -> Option<IsolationAction> {
        self.isolations.get(action_id).cloned()
    }

    // --- shutdown ---

    /// Delivers what it can within `budget`; undelivered notifications are
    /// logged and journaled as abandoned.
    pub fn flush(&mut self, budget: Duration) -> FlushReport {
        let report = self.notifier.flush(budget);
        for outcome in &report.outcomes {
            if let DeliveryOutcome::Failed { alert_id, sink } = outcome {
                self.process_logged(AimEvent::NotificationFailed {
                    alert_id: *alert_id,
                    sink: sink.clone(),
                });
            }
        }
        for (alert_id, sink) in &report.abandoned {
            self.process_logged(AimEvent::NotificationAbandoned {
                alert_id: *alert_id,
                sink: sink.clone(),
            });
        }
        report
    }

    // --- internals ---

    fn process_logged(&mut self, event: AimEvent) {
        let name = event.name();
        if let Err(e) = self.process(event) {
            warn!(event = name, error = %e, "alert manager transition failed");
        }
    }

    /// Journal, apply, then run side effects.
    fn process(&mut self, event: AimEvent) -> TwResult<()> {
        let journaled = self.commit(&event);
        self.effects(&event);
        journaled
    }

    fn commit(&mut self, event: &AimEvent) -> TwResult<()> {
        let mut failure = None;
        if self.unsafe_reason.is_none() {
            if let Err(e) = self.journal.write(event) {
                failure = Some(format!("journal append failed: {}", e));
            }
        }
        // Applied even when not durable: safe mode keeps serving from memory
        self.apply(event)?;
        match failure {
            Some(reason) => {
                self.enter_safe_mode(&reason);
                Err(TwError::Unsafe(reason))
            }
            None => Ok(()),
        }
    }

    fn apply(&mut self, event: &AimEvent) -> TwResult<()> {
        let result = if event.is_isolation() {
            self.isolations.apply(event)
        } else {
            self.alerts.apply(event)
        };
        self.counters
            .isolations_active
            .set(self.isolations.active_count() as i64);
        result.map_err(|e| internal_error!("{}: {}", event.name(), e))
    }

    fn effects(&mut self, event: &AimEvent) {
        let now = self.clock.now();
        match event {
            AimEvent::AlertRaised { alert } => {
                self.counters.alerts_raised.inc();
                info!(
                    alert_id = %alert.alert_id,
                    rule_id = %alert.rule_id,
                    target = %alert.target,
                    priority = %alert.priority,
                    seq = alert.triggered_seq,
                    "alert raised"
                );
                self.notifier.dispatch(alert, now);
            }
            AimEvent::AlertRepeated { .. } => {
                self.counters.alerts_deduplicated.inc();
            }
            AimEvent::AlertEscalated { alert_id, priority, .. } => {
                info!(%alert_id, %priority, "alert escalated");
                if let Some(alert) = self.alerts.get(alert_id) {
                    let alert = alert.clone();
                    self.notifier.dispatch(&alert, now);
                }
            }
            AimEvent::IsolationActivated { action } => {
                warn!(
                    action_id = %action.action_id,
                    method = %action.method,
                    target = %action.target,
                    source = %action.source,
                    "isolation activated"
                );
                let acked = match self.router.request_isolation(
                    action.action_id,
                    action.method,
                    &action.target,
                    &action.reason,
                ) {
                    Ok(()) => true,
                    Err(e) => {
                        error!(action_id = %action.action_id, error = %e, "router did not take isolation request");
                        false
                    }
                };
                self.process_logged(AimEvent::IsolationRouted {
                    action_id: action.action_id,
                    acked,
                });
            }
            AimEvent::IsolationDuplicate { action_id, source, .. } => {
                debug!(%action_id, %source, "duplicate isolation request folded");
            }
            AimEvent::IsolationReleased { action_id, reason, .. } => {
                info!(%action_id, ?reason, "isolation released");
                if let Err(e) = self.router.request_release(*action_id) {
                    error!(%action_id, error = %e, "router did not take release request");
                }
            }
            AimEvent::ReleaseReverted { action_id, stalled: true, .. } => {
                if let Some(action) = self.isolations.get(action_id) {
                    let candidate = self.internal_candidate(
                        RELEASE_STALLED_RULE,
                        action.target.clone(),
                        Priority::High,
                        format!("release of {} on {} stalled", action.action_id, action.target),
                        now,
                    );
                    let event = self.alerts.on_candidate(candidate, Uuid::new_v4());
                    self.process_logged(event);
                }
            }
            _ => {}
        }
    }

    fn poll_notifications(&mut self, now: DateTime<Utc>) {
        for outcome in self.notifier.poll(now) {
            if let DeliveryOutcome::Failed { alert_id, sink } = outcome {
                self.process_logged(AimEvent::NotificationFailed { alert_id, sink });
            }
        }
    }

    fn enter_safe_mode(&mut self, reason: &str) {
        if self.unsafe_reason.is_some() {
            return;
        }
        self.unsafe_reason = Some(reason.to_string());
        error!(reason, "entering safe mode");
        let now = self.clock.now();

        let candidate = self.internal_candidate(
            SYSTEM_UNSAFE_RULE,
            Target::System,
            Priority::Emergency,
            reason.to_string(),
            now,
        );
        let event = self.alerts.on_candidate(candidate, Uuid::new_v4());
        self.process_logged(event);
        let event = self.isolations.system_halt(reason, Uuid::new_v4(), now);
        self.process_logged(event);
        self.poll_notifications(now);

        if let Some(hook) = &self.on_fatal {
            hook(reason);
        }
    }

    fn internal_candidate(
        &self,
        rule_id: &str,
        target: Target,
        priority: Priority,
        message: String,
        now: DateTime<Utc>,
    ) -> CandidateAlert {
        CandidateAlert {
            rule_id: rule_id.to_string(),
            target,
            priority,
            triggered_seq: self.last_metrics_seq,
            triggered_at: now,
            rule_set_version: 0,
            payload: AlertPayload::internal(message),
        }
    }

    fn ensure_safe(&self) -> TwResult<()> {
        match &self.unsafe_reason {
            Some(reason) => Err(TwError::Unsafe(reason.clone())),
            None => Ok(()),
        }
    }

    fn alert(&self, alert_id: Uuid) -> TwResult<Alert> {
        self.alerts
            .get(&alert_id)
            .cloned()
            .ok_or_else(|| internal_error!("alert {} vanished", alert_id))
    }

    fn isolation(&self, action_id: Uuid) -> TwResult<IsolationAction> {
        self.isolations
            .get(&action_id)
            .cloned()
            .ok_or_else(|| internal_error!("isolation {} vanished", action_id))
    }
}
