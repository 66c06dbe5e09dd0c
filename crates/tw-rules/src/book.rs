//! Versioned rule sets.
//!
//! The control plane validates a [`RuleSetSpec`] into an immutable
//! [`RuleSet`] and publishes it by swapping an `Arc`. The rule engine loads
//! the `Arc` once per metrics record, so a record is always evaluated against
//! exactly one version.

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use tw_types::{IsolationRule, Rule, RuleError, RulePatch, RuleSetSpec, Target};

use crate::path::{LevelMetric, MetricPath};

const CONFIDENCE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: Rule,
    pub path: MetricPath,
}

#[derive(Debug, Clone)]
pub struct CompiledIsolationRule {
    pub rule: IsolationRule,
    pub path: MetricPath,
}

impl CompiledIsolationRule {
    /// The rule's explicit target, else the one the path yields.
    pub fn target_for(&self, resolved: &Target) -> Target {
        self.rule.target.clone().unwrap_or_else(|| resolved.clone())
    }
}

/// An immutable, validated rule set.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub version: u64,
    pub spec: RuleSetSpec,
    pub rules: Vec<CompiledRule>,
    pub isolation_rules: Vec<CompiledIsolationRule>,
}

impl RuleSet {
    pub fn contains(&self, rule_id: &str) -> bool {
        self.rules.iter().any(|r| r.rule.rule_id == rule_id)
            || self.isolation_rules.iter().any(|r| r.rule.rule_id == rule_id)
    }
}

/// Confidence levels the metrics records carry; level paths must name one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathContext {
    pub var_confidences: Vec<f64>,
    pub es_confidences: Vec<f64>,
}

impl PathContext {
    fn check(&self, path: &MetricPath) -> Result<(), String> {
        let Some((metric, c)) = path.required_confidence() else {
            return Ok(());
        };
        let levels = match metric {
            LevelMetric::Var1d | LevelMetric::Var10d => &self.var_confidences,
            LevelMetric::ExpectedShortfall => &self.es_confidences,
        };
        if levels.iter().any(|l| (l - c).abs() < CONFIDENCE_EPSILON) {
            Ok(())
        } else {
            Err(format!("confidence {} is not configured", c))
        }
    }
}

/// Validates a spec. All problems are collected; any one rejects the whole
/// update.
pub fn compile(
    spec: &RuleSetSpec,
    ctx: &PathContext,
    version: u64,
) -> Result<RuleSet, RuleError> {
    let mut errors = Vec::new();
    let mut ids = HashSet::new();
    let mut rules = Vec::with_capacity(spec.rules.len());
    let mut isolation_rules = Vec::with_capacity(spec.isolation_rules.len());

    let mut check = |rule_id: &str, metric_path: &str, threshold: f64| -> Option<MetricPath> {
        if rule_id.is_empty() {
            errors.push("rule with empty rule_id".to_string());
            return None;
        }
        if !ids.insert(rule_id.to_string()) {
            errors.push(RuleError::DuplicateRuleId { rule_id: rule_id.to_string() }.to_string());
            return None;
        }
        if !threshold.is_finite() {
            errors.push(format!("{}: threshold must be finite", rule_id));
            return None;
        }
        match MetricPath::parse(metric_path) {
            Ok(path) => match ctx.check(&path) {
                Ok(()) => Some(path),
                Err(e) => {
                    errors.push(format!("{}: {}: {}", rule_id, metric_path, e));
                    None
                }
            },
            Err(e) => {
                errors.push(format!("{}: {}", rule_id, e));
                None
            }
        }
    };

    for rule in &spec.rules {
        if let Some(path) = check(&rule.rule_id, &rule.metric_path, rule.threshold) {
            rules.push(CompiledRule {
                rule: rule.clone(),
                path,
            });
        }
    }
    for rule in &spec.isolation_rules {
        if let Some(path) = check(&rule.rule_id, &rule.metric_path, rule.threshold) {
            isolation_rules.push(CompiledIsolationRule {
                rule: rule.clone(),
                path,
            });
        }
    }

    if !errors.is_empty() {
        return Err(RuleError::Rejected { errors });
    }
    Ok(RuleSet {
        version,
        spec: spec.clone(),
        rules,
        isolation_rules,
    })
}

/// Owner of the current rule set.
#[derive(Debug)]
pub struct RuleBook {
    current: RwLock<Arc<RuleSet>>,
    ctx: PathContext,
    // Serializes publishers so versions are assigned in order
    writer: Mutex<()>,
}

impl RuleBook {
    pub fn new(spec: &RuleSetSpec, ctx: PathContext) -> Result<Self, RuleError> {
        let set = compile(spec, &ctx, 1)?;
        Ok(Self {
            current: RwLock::new(Arc::new(set)),
            ctx,
            writer: Mutex::new(()),
        })
    }

    /// The current rule set; stays valid across later publications.
    pub fn load(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Replaces the whole rule set. Publishing a spec identical to the
    /// current one is a no-op and keeps the version.
    pub fn publish(&self, spec: RuleSetSpec) -> Result<u64, RuleError> {
        let _publisher = self.writer.lock();
        self.swap(spec)
    }

    /// Applies a runtime toggle to one rule and publishes the result.
    pub fn patch_rule(&self, rule_id: &str, patch: &RulePatch) -> Result<u64, RuleError> {
        let _publisher = self.writer.lock();
        let mut spec = self.load().spec.clone();
        let mut found = false;
        if let Some(rule) = spec.rules.iter_mut().find(|r| r.rule_id == rule_id) {
            found = true;
            if let Some(enabled) = patch.enabled {
                rule.enabled = enabled;
            }
            if let Some(threshold) = patch.threshold {
                rule.threshold = threshold;
            }
        }
        if let Some(rule) = spec.isolation_rules.iter_mut().find(|r| r.rule_id == rule_id) {
            found = true;
            if let Some(enabled) = patch.enabled {
                rule.enabled = enabled;
            }
            if let Some(threshold) = patch.threshold {
                rule.threshold = threshold;
            }
        }
        if !found {
            return Err(RuleError::NotFound {
                rule_id: rule_id.to_string(),
            });
        }
        self.swap(spec)
    }

    // Caller holds the publish lock.
    fn swap(&self, spec: RuleSetSpec) -> Result<u64, RuleError> {
        let current = self.load();
        if current.spec == spec {
            return Ok(current.version);
        }
        let next = compile(&spec, &self.ctx, current.version + 1)?;
        let version = next.version;
        *self.current.write() = Arc::new(next);
        info!(
            version,
            rules = spec.rules.len(),
            isolation_rules = spec.isolation_rules.len(),
            "rule set published"
        );
        Ok(version)
    }
}
