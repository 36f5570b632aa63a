//! The scoring evaluator.
//!
//! Walks the active snapshot in rule order against a pooled variable
//! snapshot. Two modes: without a domain config the first matching `deny`
//! rule decides (backward-compatible); with one, matched `deny` scores
//! accumulate and the domain threshold decides. Evaluation never mutates
//! the snapshot, and transform/regex failures collapse to "no match".

use super::model::{RuleAction, VariableType};
use super::operators;
use super::snapshot::SnapshotHolder;
use super::variables::SnapshotPool;
use hyper::HeaderMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

pub const DEFAULT_THRESHOLD: i32 = 5;

/// Domain-scoped evaluation settings derived from the domain config.
#[derive(Debug, Clone, Default)]
pub struct DomainEvalConfig {
    pub threshold: i32,
    /// Non-empty means: only these ids are evaluated.
    pub enabled_ids: HashSet<u32>,
    /// Consulted only when `enabled_ids` is empty.
    pub disabled_ids: HashSet<u32>,
}

impl DomainEvalConfig {
    pub fn new(threshold: i32) -> Self {
        Self {
            threshold,
            enabled_ids: HashSet::new(),
            disabled_ids: HashSet::new(),
        }
    }

    fn includes(&self, rule_id: u32) -> bool {
        if !self.enabled_ids.is_empty() {
            self.enabled_ids.contains(&rule_id)
        } else {
            !self.disabled_ids.contains(&rule_id)
        }
    }
}

/// One matched rule, reported with the original (untransformed) value.
#[derive(Debug, Clone)]
pub struct MatchedRule {
    pub id: u32,
    pub msg: String,
    pub score: i32,
    pub variable: &'static str,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct MatchSummary {
    pub id: u32,
    pub msg: String,
    pub variable: &'static str,
    pub value: String,
}

#[derive(Debug, Default)]
pub struct EvaluationResult {
    pub blocked: bool,
    pub observed: bool,
    pub total_score: i32,
    pub threshold: i32,
    pub matched_rules: Vec<MatchedRule>,
    pub first_match: Option<MatchSummary>,
    /// True when the decision came from score accumulation rather than
    /// first-deny short-circuit.
    pub scoring_mode: bool,
}

impl EvaluationResult {
    /// Rule id for block reporting: the first matched deny rule.
    pub fn block_rule(&self) -> Option<&MatchedRule> {
        self.matched_rules.first()
    }
}

/// Evaluates requests against the current rule snapshot.
pub struct Evaluator {
    holder: Arc<SnapshotHolder>,
    pool: Arc<SnapshotPool>,
}

impl Evaluator {
    pub fn new(holder: Arc<SnapshotHolder>, pool: Arc<SnapshotPool>) -> Self {
        Self { holder, pool }
    }

    /// Evaluate one request. `observe` selects observe mode (matches are
    /// reported but never block). The pooled variable snapshot is released
    /// on every path when the lease drops.
    pub fn evaluate(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &HeaderMap,
        body: &[u8],
        body_limit: usize,
        domain_cfg: Option<&DomainEvalConfig>,
        observe: bool,
    ) -> EvaluationResult {
        let started = Instant::now();
        let mut lease = self.pool.acquire();
        lease.populate(method, path_and_query, headers, body, body_limit);

        let snapshot = self.holder.current();
        let scoring = domain_cfg.is_some();

        let mut result = EvaluationResult {
            threshold: domain_cfg.map(|d| d.threshold).unwrap_or(DEFAULT_THRESHOLD),
            scoring_mode: scoring,
            ..Default::default()
        };

        let mut deny_matched = false;

        'rules: for rule in &snapshot.rules {
            if let Some(cfg) = domain_cfg {
                if !cfg.includes(rule.id) {
                    continue;
                }
            }

            for spec in &rule.variables {
                let matched_value = match (&spec.header_names, spec.var_type) {
                    (Some(names), VariableType::Headers) => lease
                        .get_values_for_headers(names)
                        .find(|v| operators::rule_matches(rule, v))
                        .cloned(),
                    _ => lease
                        .get_values(spec.var_type)
                        .iter()
                        .find(|v| operators::rule_matches(rule, v))
                        .cloned(),
                };

                if let Some(value) = matched_value {
                    let score = rule.effective_score();
                    if result.first_match.is_none() {
                        result.first_match = Some(MatchSummary {
                            id: rule.id,
                            msg: rule.msg.clone(),
                            variable: spec.var_type.as_str(),
                            value: value.clone(),
                        });
                    }
                    result.matched_rules.push(MatchedRule {
                        id: rule.id,
                        msg: rule.msg.clone(),
                        score,
                        variable: spec.var_type.as_str(),
                        value,
                    });

                    if rule.action == RuleAction::Deny {
                        deny_matched = true;
                        result.total_score += score;
                        // Backward-compatible mode: first deny decides.
                        if !scoring {
                            break 'rules;
                        }
                    }
                    // One match per rule: stop probing its other variables.
                    continue 'rules;
                }
            }
        }

        if scoring {
            if deny_matched && result.total_score >= result.threshold {
                if observe {
                    result.observed = true;
                } else {
                    result.blocked = true;
                }
            } else if !result.matched_rules.is_empty() {
                // Below threshold (or log-only matches): report, never block.
                result.observed = true;
            }
        } else if deny_matched {
            if observe {
                result.observed = true;
            } else {
                result.blocked = true;
            }
        } else if !result.matched_rules.is_empty() {
            result.observed = true;
        }

        crate::metrics::observe_rule_evaluation(started.elapsed().as_secs_f64());
        result
    }

    pub fn rules_loaded(&self) -> usize {
        self.holder.current().rule_count()
    }
}
