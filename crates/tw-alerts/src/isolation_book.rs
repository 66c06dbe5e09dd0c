//! Per-target isolation state machine.
//!
//! A target is `free` when it has no active action. An active action is
//! `isolated` or `pending_release`; a release of any kind frees the target.
//! Decision methods return events for the manager to commit; only
//! [`IsolationBook::apply`] changes journaled state. Streak counters for
//! window predicates are not journaled.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;
use uuid::Uuid;

use tw_rules::MetricPath;
use tw_types::{
    ActivationRequest, AutoIsolationRule, AutoReleaseConfig, IsolationAction, IsolationCandidate,
    IsolationError, IsolationMethod, IsolationSource, IsolationState, PendingRelease,
    ReleaseReason, ReleaseRequest, RiskMetrics, RuleError, Target, TwError, TwResult,
    WindowPredicate,
};

use crate::events::AimEvent;

/// Isolation settings from the start-up configuration.
#[derive(Debug, Clone, Default)]
pub struct IsolationPolicy {
    pub operators: Vec<String>,
    pub auto_isolation: Vec<AutoIsolationRule>,
    pub auto_release: Option<AutoReleaseConfig>,
    /// Pending-release ceiling when a release request names none.
    pub release_timeout_ms: u64,
}

/// Activation request after normalisation of its source.
#[derive(Debug, Clone)]
struct Request {
    method: IsolationMethod,
    target: Target,
    reason: String,
    source: IsolationSource,
    rule_id: Option<String>,
    authorized_by: Option<String>,
    hold_ms: Option<u64>,
    severity_score: f64,
}

#[derive(Debug)]
struct AutoIsolation {
    rule: AutoIsolationRule,
    path: MetricPath,
    streak: usize,
}

#[derive(Debug)]
struct AutoRelease {
    config: AutoReleaseConfig,
    path: MetricPath,
}

#[derive(Debug)]
pub struct IsolationBook {
    actions: HashMap<Uuid, IsolationAction>,
    order: Vec<Uuid>,
    // target key -> active action
    by_target: HashMap<String, Uuid>,
    // parsed predicate of each pending release
    pending_paths: HashMap<Uuid, MetricPath>,
    operators: HashSet<String>,
    auto_isolation: Vec<AutoIsolation>,
    auto_release: Option<AutoRelease>,
    release_timeout_ms: u64,
    // Released actions in release order, oldest evicted first
    released: VecDeque<Uuid>,
    retain_released: usize,
}

/// Released actions kept when no retention is configured.
pub const DEFAULT_RETAINED_RELEASED: usize = 10_000;

impl IsolationBook {
    pub fn new(policy: IsolationPolicy) -> Result<Self, RuleError> {
        let auto_isolation = policy
            .auto_isolation
            .into_iter()
            .map(|rule| {
                let path = parse_predicate(&rule.predicate)?;
                Ok(AutoIsolation { rule, path, streak: 0 })
            })
            .collect::<Result<Vec<_>, RuleError>>()?;
        let auto_release = match policy.auto_release {
            Some(config) => Some(AutoRelease {
                path: parse_predicate(&config.predicate)?,
                config,
            }),
            None => None,
        };
        Ok(Self {
            actions: HashMap::new(),
            order: Vec::new(),
            by_target: HashMap::new(),
            pending_paths: HashMap::new(),
            operators: policy.operators.into_iter().collect(),
            auto_isolation,
            auto_release,
            release_timeout_ms: policy.release_timeout_ms,
            released: VecDeque::new(),
            retain_released: DEFAULT_RETAINED_RELEASED,
        })
    }

    /// Keeps at most `released` released actions; active ones are never dropped.
    pub fn with_retention(mut self, released: usize) -> Self {
        self.retain_released = released.max(1);
        self
    }

    pub fn get(&self, action_id: &Uuid) -> Option<&IsolationAction> {
        self.actions.get(action_id)
    }

    /// Actions in activation order; only active ones when `active_only`.
    pub fn list(&self, active_only: bool) -> Vec<IsolationAction> {
        self.order
            .iter()
            .filter_map(|id| self.actions.get(id))
            .filter(|a| !active_only || a.active)
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.by_target.len()
    }

    pub fn state_of(&self, target: &Target) -> IsolationState {
        self.by_target
            .get(&target.key())
            .and_then(|id| self.actions.get(id))
            .map(|a| a.state)
            .unwrap_or(IsolationState::Free)
    }

    pub fn active_for(&self, target: &Target) -> Option<&IsolationAction> {
        self.by_target.get(&target.key()).and_then(|id| self.actions.get(id))
    }

    pub fn authorize(&self, principal: &str) -> Result<(), IsolationError> {
        if self.operators.contains(principal) {
            Ok(())
        } else {
            Err(IsolationError::Unauthorized {
                principal: principal.to_string(),
            })
        }
    }

    /// Operator activation. Overrides an automatic action on the same target.
    pub fn manual_activate(
        &self,
        req: &ActivationRequest,
        action_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AimEvent, IsolationError> {
        self.authorize(&req.principal)?;
        Ok(self.request(
            Request {
                method: req.method,
                target: req.target.clone(),
                reason: req.reason.clone(),
                source: IsolationSource::Manual,
                rule_id: None,
                authorized_by: Some(req.principal.clone()),
                hold_ms: req.hold_ms,
                severity_score: req.severity_score,
            },
            action_id,
            now,
        ))
    }

    pub fn from_candidate(
        &self,
        candidate: &IsolationCandidate,
        action_id: Uuid,
        now: DateTime<Utc>,
    ) -> AimEvent {
        self.request(
            Request {
                method: candidate.method,
                target: candidate.target.clone(),
                reason: candidate.reason.clone(),
                source: candidate.source,
                rule_id: Some(candidate.rule_id.clone()),
                authorized_by: None,
                hold_ms: candidate.hold_ms,
                severity_score: candidate.severity_score,
            },
            action_id,
            now,
        )
    }

    /// Safe-mode halt of all new orders on the system target.
    pub fn system_halt(&self, reason: &str, action_id: Uuid, now: DateTime<Utc>) -> AimEvent {
        self.request(
            Request {
                method: IsolationMethod::HaltAllOrders,
                target: Target::System,
                reason: reason.to_string(),
                source: IsolationSource::Auto,
                rule_id: Some(tw_types::SYSTEM_UNSAFE_RULE.to_string()),
                authorized_by: None,
                hold_ms: None,
                severity_score: 1.0,
            },
            action_id,
            now,
        )
    }

    // Earliest request wins; later ones are duplicates unless a manual
    // request meets a non-manual action.
    fn request(&self, req: Request, action_id: Uuid, now: DateTime<Utc>) -> AimEvent {
        let planned_release_at = req.hold_ms.map(|ms| now + millis(ms));
        if let Some(existing) = self.active_for(&req.target) {
            if req.source == IsolationSource::Manual && existing.source != IsolationSource::Manual {
                return AimEvent::IsolationOverridden {
                    action_id: existing.action_id,
                    principal: req.authorized_by.unwrap_or_default(),
                    reason: req.reason,
                    planned_release_at,
                    at: now,
                };
            }
            return AimEvent::IsolationDuplicate {
                action_id: existing.action_id,
                source: req.source,
                rule_id: req.rule_id,
                at: now,
            };
        }
        AimEvent::IsolationActivated {
            action: IsolationAction {
                action_id,
                method: req.method,
                target: req.target,
                reason: req.reason,
                source: req.source,
                rule_id: req.rule_id,
                authorized_by: req.authorized_by,
                severity_score: req.severity_score,
                activated_at: now,
                planned_release_at,
                active: true,
                state: IsolationState::Isolated,
                pending: None,
                released_at: None,
                release_reason: None,
                duplicate_requests: 0,
                router_acked: false,
            },
        }
    }

    /// Conditional release: the action goes to `pending_release` until the
    /// predicate holds for the requested number of consecutive records.
    pub fn request_release(
        &self,
        action_id: Uuid,
        req: &ReleaseRequest,
        now: DateTime<Utc>,
    ) -> TwResult<AimEvent> {
        self.authorize(&req.principal)?;
        parse_predicate(&req.predicate)?;
        let action = self.require(action_id)?;
        if !action.active || action.state != IsolationState::Isolated {
            return Err(TwError::Isolation(IsolationError::InvalidTransition {
                action_id,
                message: format!("release requested while {:?}", action.state),
            }));
        }
        let timeout = req.timeout_ms.unwrap_or(self.release_timeout_ms);
        Ok(AimEvent::ReleaseRequested {
            action_id,
            predicate: req.predicate.clone(),
            deadline: now + millis(timeout),
            automatic: false,
            satisfied: 0,
            principal: Some(req.principal.clone()),
            at: now,
        })
    }

    /// Unconditional release by an authorised principal.
    pub fn force_release(
        &self,
        action_id: Uuid,
        principal: &str,
        now: DateTime<Utc>,
    ) -> Result<AimEvent, IsolationError> {
        self.authorize(principal)?;
        let action = self.require(action_id)?;
        if !action.active {
            return Err(IsolationError::InvalidTransition {
                action_id,
                message: "action already released".to_string(),
            });
        }
        Ok(AimEvent::IsolationReleased {
            action_id,
            reason: ReleaseReason::Forced,
            principal: Some(principal.to_string()),
            at: now,
        })
    }

    /// Window-predicate evaluation for one metrics record: pending releases,
    /// auto-release entry and auto-isolation streaks.
    pub fn on_metrics(&mut self, metrics: &RiskMetrics, now: DateTime<Utc>) -> Vec<AimEvent> {
        let mut events = Vec::new();
        let mut released = HashSet::new();

        for id in &self.order {
            let Some(action) = self.actions.get_mut(id) else { continue };
            if action.state != IsolationState::PendingRelease {
                continue;
            }
            let Some(pending) = action.pending.as_mut() else { continue };
            let holds = match self.pending_paths.get(id) {
                Some(path) => all_hold(path, &pending.predicate, metrics),
                None => false,
            };
            if holds {
                pending.satisfied += 1;
                if pending.satisfied >= pending.predicate.consecutive {
                    released.insert(*id);
                    events.push(AimEvent::IsolationReleased {
                        action_id: *id,
                        reason: if pending.automatic {
                            ReleaseReason::AutoRelease
                        } else {
                            ReleaseReason::ConditionsMet
                        },
                        principal: None,
                        at: now,
                    });
                }
            } else {
                pending.satisfied = 0;
                if pending.automatic {
                    events.push(AimEvent::ReleaseReverted {
                        action_id: *id,
                        stalled: false,
                        at: now,
                    });
                }
            }
        }

        if let Some(auto) = &self.auto_release {
            let predicate = &auto.config.predicate;
            if all_hold(&auto.path, predicate, metrics) {
                for id in &self.order {
                    let Some(action) = self.actions.get(id) else { continue };
                    if !action.active
                        || action.state != IsolationState::Isolated
                        || action.source == IsolationSource::Manual
                    {
                        continue;
                    }
                    // The record that opens the window counts towards it
                    events.push(AimEvent::ReleaseRequested {
                        action_id: *id,
                        predicate: predicate.clone(),
                        deadline: now + millis(auto.config.pending_timeout_ms),
                        automatic: true,
                        satisfied: 1,
                        principal: None,
                        at: now,
                    });
                    if predicate.consecutive <= 1 {
                        released.insert(*id);
                        events.push(AimEvent::IsolationReleased {
                            action_id: *id,
                            reason: ReleaseReason::AutoRelease,
                            principal: None,
                            at: now,
                        });
                    }
                }
            }
        }

        let mut isolating = HashSet::new();
        let mut fired = Vec::new();
        for auto in &mut self.auto_isolation {
            if any_holds(&auto.path, &auto.rule.predicate, metrics) {
                auto.streak += 1;
            } else {
                auto.streak = 0;
            }
            if auto.streak >= auto.rule.predicate.consecutive {
                auto.streak = 0;
                fired.push(auto.rule.clone());
            }
        }
        for rule in fired {
            let key = rule.target.key();
            let freed = self
                .by_target
                .get(&key)
                .map(|id| released.contains(id))
                .unwrap_or(true);
            if !freed || !isolating.insert(key) {
                continue;
            }
            debug!(rule_id = %rule.rule_id, target = %rule.target, "auto-isolation predicate held");
            events.push(AimEvent::IsolationActivated {
                action: self.auto_action(&rule, metrics.seq, now),
            });
        }
        events
    }

    fn auto_action(&self, rule: &AutoIsolationRule, seq: u64, now: DateTime<Utc>) -> IsolationAction {
        IsolationAction {
            action_id: Uuid::new_v4(),
            method: rule.method,
            target: rule.target.clone(),
            reason: format!("{}: {} (seq {})", rule.rule_id, rule.predicate, seq),
            source: IsolationSource::Auto,
            rule_id: Some(rule.rule_id.clone()),
            authorized_by: None,
            severity_score: rule.severity_score,
            activated_at: now,
            planned_release_at: rule.hold_ms.map(|ms| now + millis(ms)),
            active: true,
            state: IsolationState::Isolated,
            pending: None,
            released_at: None,
            release_reason: None,
            duplicate_requests: 0,
            router_acked: false,
        }
    }

    /// Time-driven transitions: planned releases and stalled pending releases.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<AimEvent> {
        let mut events = Vec::new();
        for id in &self.order {
            let Some(action) = self.actions.get(id) else { continue };
            if !action.active {
                continue;
            }
            let planned = action.source != IsolationSource::Manual
                && action.planned_release_at.map(|t| t <= now).unwrap_or(false);
            if planned {
                events.push(AimEvent::IsolationReleased {
                    action_id: *id,
                    reason: ReleaseReason::PlannedRelease,
                    principal: None,
                    at: now,
                });
                continue;
            }
            if let Some(pending) = &action.pending {
                if pending.deadline <= now {
                    events.push(AimEvent::ReleaseReverted {
                        action_id: *id,
                        stalled: true,
                        at: now,
                    });
                }
            }
        }
        events
    }

    /// Applies a committed isolation event. Alert events are ignored.
    pub fn apply(&mut self, event: &AimEvent) -> Result<(), String> {
        match event {
            AimEvent::IsolationActivated { action } => {
                let key = action.target.key();
                if self.by_target.contains_key(&key) {
                    return Err(format!("target {} already isolated", key));
                }
                if self.actions.contains_key(&action.action_id) {
                    return Err(format!("action {} activated twice", action.action_id));
                }
                if action.active {
                    self.by_target.insert(key, action.action_id);
                }
                self.order.push(action.action_id);
                self.actions.insert(action.action_id, action.clone());
            }
            AimEvent::IsolationDuplicate { action_id, .. } => {
                self.require_mut(*action_id)?.duplicate_requests += 1;
            }
            AimEvent::IsolationOverridden {
                action_id,
                principal,
                reason,
                planned_release_at,
                ..
            } => {
                let action = self.require_active(*action_id)?;
                action.source = IsolationSource::Manual;
                action.authorized_by = Some(principal.clone());
                action.reason = reason.clone();
                action.planned_release_at = *planned_release_at;
                action.state = IsolationState::Isolated;
                action.pending = None;
                self.pending_paths.remove(action_id);
            }
            AimEvent::IsolationRouted { action_id, acked } => {
                self.require_mut(*action_id)?.router_acked = *acked;
            }
            AimEvent::ReleaseRequested {
                action_id,
                predicate,
                deadline,
                automatic,
                satisfied,
                at,
                ..
            } => {
                let path = parse_predicate(predicate).map_err(|e| e.to_string())?;
                let action = self.require_active(*action_id)?;
                if action.state != IsolationState::Isolated {
                    return Err(format!("action {} not isolated", action_id));
                }
                action.state = IsolationState::PendingRelease;
                action.pending = Some(PendingRelease {
                    predicate: predicate.clone(),
                    requested_at: *at,
                    deadline: *deadline,
                    satisfied: *satisfied,
                    automatic: *automatic,
                });
                self.pending_paths.insert(*action_id, path);
            }
            AimEvent::ReleaseReverted { action_id, .. } => {
                let action = self.require_active(*action_id)?;
                if action.state != IsolationState::PendingRelease {
                    return Err(format!("action {} not pending release", action_id));
                }
                action.state = IsolationState::Isolated;
                action.pending = None;
                self.pending_paths.remove(action_id);
            }
            AimEvent::IsolationReleased { action_id, reason, at, .. } => {
                let action = self.require_active(*action_id)?;
                action.active = false;
                action.state = IsolationState::Free;
                action.pending = None;
                action.released_at = Some(*at);
                action.release_reason = Some(*reason);
                let key = action.target.key();
                self.by_target.remove(&key);
                self.pending_paths.remove(action_id);
                self.released.push_back(*action_id);
                self.evict_released();
            }
            _ => {}
        }
        Ok(())
    }

    fn evict_released(&mut self) {
        while self.released.len() > self.retain_released {
            if let Some(id) = self.released.pop_front() {
                self.actions.remove(&id);
            }
        }
        if self.order.len() > 2 * self.actions.len().max(16) {
            let actions = &self.actions;
            self.order.retain(|id| actions.contains_key(id));
        }
    }

    fn require(&self, action_id: Uuid) -> Result<&IsolationAction, IsolationError> {
        self.actions
            .get(&action_id)
            .ok_or(IsolationError::NotFound { action_id })
    }

    fn require_mut(&mut self, action_id: Uuid) -> Result<&mut IsolationAction, String> {
        self.actions
            .get_mut(&action_id)
            .ok_or_else(|| format!("unknown isolation action {}", action_id))
    }

    fn require_active(&mut self, action_id: Uuid) -> Result<&mut IsolationAction, String> {
        let action = self.require_mut(action_id)?;
        if !action.active {
            return Err(format!("isolation action {} is not active", action_id));
        }
        Ok(action)
    }
}

fn parse_predicate(predicate: &WindowPredicate) -> Result<MetricPath, RuleError> {
    if predicate.consecutive == 0 || !predicate.threshold.is_finite() {
        return Err(RuleError::InvalidPath {
            path: predicate.metric_path.clone(),
            message: "predicate needs a finite threshold and consecutive >= 1".to_string(),
        });
    }
    MetricPath::parse(&predicate.metric_path)
}

// Release conditions must hold for every value a wildcard path yields.
fn all_hold(path: &MetricPath, predicate: &WindowPredicate, metrics: &RiskMetrics) -> bool {
    match path.resolve(metrics) {
        Some(values) if !values.is_empty() => values
            .iter()
            .all(|(_, v)| predicate.comparator.holds(*v, predicate.threshold)),
        _ => false,
    }
}

// Isolation triggers when any value breaches.
fn any_holds(path: &MetricPath, predicate: &WindowPredicate, metrics: &RiskMetrics) -> bool {
    match path.resolve(metrics) {
        Some(values) => values
            .iter()
            .any(|(_, v)| predicate.comparator.holds(*v, predicate.threshold)),
        None => false,
    }
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(i64::MAX as u64 / 2) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_types::Comparator;

    fn predicate(path: &str, cmp: Comparator, threshold: f64, n: usize) -> WindowPredicate {
        WindowPredicate {
            metric_path: path.to_string(),
            comparator: cmp,
            threshold,
            consecutive: n,
        }
    }

    fn policy() -> IsolationPolicy {
        IsolationPolicy {
            operators: vec!["ops".to_string()],
            auto_isolation: vec![],
            auto_release: Some(AutoReleaseConfig {
                predicate: predicate("var_1d", Comparator::Lt, 500.0, 60),
                pending_timeout_ms: 600_000,
            }),
            release_timeout_ms: 60_000,
        }
    }

    fn metrics(seq: u64, var_1d: f64) -> RiskMetrics {
        let mut m = RiskMetrics::empty(seq, Utc::now());
        m.var_1d = var_1d;
        m
    }

    fn candidate(target: Target) -> IsolationCandidate {
        IsolationCandidate {
            rule_id: "var-halt".into(),
            method: IsolationMethod::StrategySuspension,
            target,
            source: IsolationSource::Rule,
            reason: "var breach".into(),
            triggered_seq: 21,
            hold_ms: None,
            severity_score: 0.9,
        }
    }

    fn commit_all(book: &mut IsolationBook, events: Vec<AimEvent>) {
        for ev in events {
            book.apply(&ev).unwrap();
        }
    }

    fn activate(book: &mut IsolationBook, target: Target, now: DateTime<Utc>) -> Uuid {
        let ev = book.from_candidate(&candidate(target), Uuid::new_v4(), now);
        let AimEvent::IsolationActivated { action } = &ev else {
            panic!("expected activation, got {:?}", ev)
        };
        let id = action.action_id;
        book.apply(&ev).unwrap();
        id
    }

    #[test]
    fn auto_release_after_consecutive_records() {
        let t0 = Utc::now();
        let mut book = IsolationBook::new(policy()).unwrap();
        let s1 = Target::Strategy("s1".into());
        let id = activate(&mut book, s1.clone(), t0);
        assert_eq!(book.state_of(&s1), IsolationState::Isolated);

        // Still breached: nothing happens
        assert!(book.on_metrics(&metrics(22, 2_500.0), t0).is_empty());

        let mut released_at = None;
        for i in 0..60u64 {
            let events = book.on_metrics(&metrics(23 + i, 100.0), t0);
            if i == 0 {
                assert!(matches!(events[0], AimEvent::ReleaseRequested { automatic: true, .. }));
            }
            let done = events
                .iter()
                .any(|e| matches!(e, AimEvent::IsolationReleased { reason: ReleaseReason::AutoRelease, .. }));
            commit_all(&mut book, events);
            if i == 0 {
                assert_eq!(book.state_of(&s1), IsolationState::PendingRelease);
            }
            if done {
                released_at = Some(i);
            }
        }
        assert_eq!(released_at, Some(59));
        assert_eq!(book.state_of(&s1), IsolationState::Free);
        let action = book.get(&id).unwrap();
        assert!(!action.active);
        assert_eq!(action.release_reason, Some(ReleaseReason::AutoRelease));
    }

    #[test]
    fn automatic_pending_reverts_when_condition_fails() {
        let t0 = Utc::now();
        let mut book = IsolationBook::new(policy()).unwrap();
        let s1 = Target::Strategy("s1".into());
        activate(&mut book, s1.clone(), t0);
        let events = book.on_metrics(&metrics(1, 100.0), t0);
        commit_all(&mut book, events);
        assert_eq!(book.state_of(&s1), IsolationState::PendingRelease);
        let events = book.on_metrics(&metrics(2, 900.0), t0);
        assert!(matches!(events[0], AimEvent::ReleaseReverted { stalled: false, .. }));
        commit_all(&mut book, events);
        assert_eq!(book.state_of(&s1), IsolationState::Isolated);
    }

    #[test]
    fn manual_actions_are_not_auto_released() {
        let t0 = Utc::now();
        let mut book = IsolationBook::new(policy()).unwrap();
        let req = ActivationRequest {
            method: IsolationMethod::HaltAllOrders,
            target: Target::System,
            reason: "drill".into(),
            principal: "ops".into(),
            hold_ms: Some(1),
            severity_score: 1.0,
        };
        let ev = book.manual_activate(&req, Uuid::new_v4(), t0).unwrap();
        book.apply(&ev).unwrap();
        assert!(book.on_metrics(&metrics(1, 0.0), t0).is_empty());
        assert!(book.due(t0 + Duration::seconds(10)).is_empty());
    }

    #[test]
    fn earliest_activation_wins() {
        let t0 = Utc::now();
        let mut book = IsolationBook::new(policy()).unwrap();
        let s1 = Target::Strategy("s1".into());
        let first = activate(&mut book, s1.clone(), t0);
        let ev = book.from_candidate(&candidate(s1.clone()), Uuid::new_v4(), t0);
        assert!(matches!(ev, AimEvent::IsolationDuplicate { action_id, .. } if action_id == first));
        book.apply(&ev).unwrap();
        assert_eq!(book.list(true).len(), 1);
        assert_eq!(book.get(&first).unwrap().duplicate_requests, 1);
    }

    #[test]
    fn manual_overrides_automatic() {
        let t0 = Utc::now();
        let mut book = IsolationBook::new(policy()).unwrap();
        let s1 = Target::Strategy("s1".into());
        let id = activate(&mut book, s1.clone(), t0);
        let req = ActivationRequest {
            method: IsolationMethod::StrategySuspension,
            target: s1.clone(),
            reason: "hold until review".into(),
            principal: "ops".into(),
            hold_ms: None,
            severity_score: 1.0,
        };
        let ev = book.manual_activate(&req, Uuid::new_v4(), t0).unwrap();
        assert!(matches!(ev, AimEvent::IsolationOverridden { .. }));
        book.apply(&ev).unwrap();
        let action = book.get(&id).unwrap();
        assert_eq!(action.source, IsolationSource::Manual);
        assert_eq!(action.authorized_by.as_deref(), Some("ops"));
        // Auto-release no longer applies
        assert!(book.on_metrics(&metrics(1, 0.0), t0).is_empty());
    }

    #[test]
    fn forced_release_requires_operator() {
        let t0 = Utc::now();
        let mut book = IsolationBook::new(policy()).unwrap();
        let id = activate(&mut book, Target::System, t0);
        assert!(matches!(
            book.force_release(id, "intruder", t0),
            Err(IsolationError::Unauthorized { .. })
        ));
        let ev = book.force_release(id, "ops", t0).unwrap();
        book.apply(&ev).unwrap();
        assert_eq!(book.state_of(&Target::System), IsolationState::Free);
        assert!(book.force_release(id, "ops", t0).is_err());
        assert!(matches!(
            book.force_release(Uuid::new_v4(), "ops", t0),
            Err(IsolationError::NotFound { .. })
        ));
    }

    #[test]
    fn released_actions_beyond_retention_are_dropped() {
        let t0 = Utc::now();
        let mut book = IsolationBook::new(policy()).unwrap().with_retention(1);
        let first = activate(&mut book, Target::Strategy("s1".into()), t0);
        let second = activate(&mut book, Target::Strategy("s2".into()), t0);
        let active = activate(&mut book, Target::Strategy("s3".into()), t0);
        for id in [first, second] {
            let ev = book.force_release(id, "ops", t0).unwrap();
            book.apply(&ev).unwrap();
        }

        assert!(book.get(&first).is_none());
        assert_eq!(book.get(&second).map(|a| a.active), Some(false));
        assert_eq!(book.get(&active).map(|a| a.active), Some(true));
        assert_eq!(book.list(false).len(), 2);
        assert_eq!(book.active_count(), 1);
    }

    #[test]
    fn conditional_release_stalls_at_deadline() {
        let t0 = Utc::now();
        let mut book = IsolationBook::new(IsolationPolicy {
            operators: vec!["ops".into()],
            release_timeout_ms: 1_000,
            ..IsolationPolicy::default()
        })
        .unwrap();
        let s1 = Target::Strategy("s1".into());
        let id = activate(&mut book, s1.clone(), t0);
        let req = ReleaseRequest {
            principal: "ops".into(),
            predicate: predicate("leverage", Comparator::Lt, 2.0, 3),
            timeout_ms: None,
        };
        let ev = book.request_release(id, &req, t0).unwrap();
        book.apply(&ev).unwrap();
        assert!(book.request_release(id, &req, t0).is_err());

        // Conditions fail: the streak resets but the request stays pending
        let mut m = metrics(1, 0.0);
        m.leverage = 5.0;
        assert!(book.on_metrics(&m, t0).is_empty());
        assert_eq!(book.state_of(&s1), IsolationState::PendingRelease);

        assert!(book.due(t0 + Duration::milliseconds(999)).is_empty());
        let events = book.due(t0 + Duration::milliseconds(1_000));
        assert!(matches!(events[0], AimEvent::ReleaseReverted { stalled: true, .. }));
        commit_all(&mut book, events);
        assert_eq!(book.state_of(&s1), IsolationState::Isolated);
    }

    #[test]
    fn conditional_release_frees_when_conditions_hold() {
        let t0 = Utc::now();
        let mut book = IsolationBook::new(IsolationPolicy {
            operators: vec!["ops".into()],
            release_timeout_ms: 60_000,
            ..IsolationPolicy::default()
        })
        .unwrap();
        let id = activate(&mut book, Target::System, t0);
        let req = ReleaseRequest {
            principal: "ops".into(),
            predicate: predicate("leverage", Comparator::Lt, 2.0, 2),
            timeout_ms: None,
        };
        let ev = book.request_release(id, &req, t0).unwrap();
        book.apply(&ev).unwrap();
        let mut m = metrics(1, 0.0);
        m.leverage = 1.0;
        assert!(book.on_metrics(&m, t0).is_empty());
        let events = book.on_metrics(&m, t0);
        assert!(matches!(
            events[0],
            AimEvent::IsolationReleased { reason: ReleaseReason::ConditionsMet, .. }
        ));
    }

    #[test]
    fn planned_release_for_non_manual_actions() {
        let t0 = Utc::now();
        let mut book = IsolationBook::new(IsolationPolicy::default()).unwrap();
        let mut c = candidate(Target::System);
        c.hold_ms = Some(5_000);
        let ev = book.from_candidate(&c, Uuid::new_v4(), t0);
        book.apply(&ev).unwrap();
        assert!(book.due(t0 + Duration::milliseconds(4_999)).is_empty());
        let events = book.due(t0 + Duration::milliseconds(5_000));
        assert!(matches!(
            events[0],
            AimEvent::IsolationReleased { reason: ReleaseReason::PlannedRelease, .. }
        ));
    }

    #[test]
    fn auto_isolation_after_streak() {
        let t0 = Utc::now();
        let mut book = IsolationBook::new(IsolationPolicy {
            auto_isolation: vec![AutoIsolationRule {
                rule_id: "lev-halt".into(),
                predicate: predicate("leverage", Comparator::Gt, 4.0, 3),
                method: IsolationMethod::HaltAllOrders,
                target: Target::System,
                hold_ms: None,
                severity_score: 0.7,
            }],
            ..IsolationPolicy::default()
        })
        .unwrap();
        let mut high = metrics(1, 0.0);
        high.leverage = 5.0;
        let mut low = metrics(2, 0.0);
        low.leverage = 1.0;

        assert!(book.on_metrics(&high, t0).is_empty());
        assert!(book.on_metrics(&low, t0).is_empty());
        assert!(book.on_metrics(&high, t0).is_empty());
        assert!(book.on_metrics(&high, t0).is_empty());
        let events = book.on_metrics(&high, t0);
        assert_eq!(events.len(), 1);
        let AimEvent::IsolationActivated { action } = &events[0] else {
            panic!("expected activation")
        };
        assert_eq!(action.source, IsolationSource::Auto);
        assert_eq!(action.rule_id.as_deref(), Some("lev-halt"));
        commit_all(&mut book, events);

        // Already isolated: further streaks request nothing
        for _ in 0..3 {
            assert!(book.on_metrics(&high, t0).is_empty());
        }
    }

    #[test]
    fn bad_predicates_are_rejected() {
        let t0 = Utc::now();
        let mut book = IsolationBook::new(policy()).unwrap();
        let id = activate(&mut book, Target::System, t0);
        let req = ReleaseRequest {
            principal: "ops".into(),
            predicate: predicate("not_a_metric", Comparator::Lt, 1.0, 1),
            timeout_ms: None,
        };
        assert!(matches!(book.request_release(id, &req, t0), Err(TwError::Rule(_))));
        assert!(IsolationBook::new(IsolationPolicy {
            auto_release: Some(AutoReleaseConfig {
                predicate: predicate("var_1d", Comparator::Lt, 1.0, 0),
                pending_timeout_ms: 1,
            }),
            ..IsolationPolicy::default()
        })
        .is_err());
    }
}
