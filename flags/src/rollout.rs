use std::collections::HashMap;

use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::flag_definitions::{Flag, RuleOperator, TargetRule};

/// The decision for one (flag, user) pair. Ephemeral, never persisted.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct FlagEvaluation {
    pub key: String,
    pub enabled: bool,
    pub reason: String,
    pub version: i32,
}

/// Maps a seed to a stable percentile in [0, 100].
///
/// This is `int(sha1(seed).hexdigest()[:8], 16) % 101` and must stay
/// bit-compatible with that arithmetic: rollout decisions recorded by older
/// deployments depend on it. The first 8 hex characters of the digest are
/// the first 4 bytes, big-endian.
pub fn assign_percentile(seed: &str) -> u32 {
    let mut hasher = Sha1::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % 101
}

/// String form used for all rule comparisons. JSON strings compare without
/// their quotes; everything else uses its JSON rendering.
fn coerce_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Members of a rule value for `in`/`nin`. A scalar is treated as a
/// one-element set.
fn coerce_to_members(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items.iter().map(coerce_to_string).collect(),
        other => vec![coerce_to_string(other)],
    }
}

/// Evaluates an ordered rule list against a user's attribute bag with
/// short-circuit OR semantics: the first rule that matches wins. An empty
/// list places no restriction. A rule whose attribute is absent from the bag
/// is skipped; it can never match on its own.
pub fn match_target_groups(rules: &[TargetRule], attributes: &HashMap<String, String>) -> bool {
    if rules.is_empty() {
        return true;
    }

    for rule in rules {
        let Some(candidate) = attributes.get(&rule.attr) else {
            continue;
        };

        let is_match = match rule.op {
            RuleOperator::Eq => *candidate == coerce_to_string(&rule.value),
            RuleOperator::Ne => *candidate != coerce_to_string(&rule.value),
            RuleOperator::In => coerce_to_members(&rule.value).contains(candidate),
            RuleOperator::Nin => !coerce_to_members(&rule.value).contains(candidate),
            RuleOperator::Unknown => false,
        };

        if is_match {
            return true;
        }
    }

    false
}

/// Decides whether `flag` is on for `user_id`, in strict order: disabled
/// short-circuits everything, then targeting, then the rollout cohort.
///
/// The cohort check is `percentile <= rollout_percentage`, so a user whose
/// percentile is exactly 0 is inside a 0% rollout. Intentional: the boundary
/// is inclusive and the percentile range starts at 0.
pub fn evaluate_flag(
    flag: &Flag,
    user_id: &str,
    attributes: &HashMap<String, String>,
) -> FlagEvaluation {
    if !flag.enabled {
        return FlagEvaluation {
            key: flag.key.clone(),
            enabled: false,
            reason: "disabled".to_string(),
            version: flag.version,
        };
    }

    if !match_target_groups(&flag.target_groups, attributes) {
        return FlagEvaluation {
            key: flag.key.clone(),
            enabled: false,
            reason: "no-target-match".to_string(),
            version: flag.version,
        };
    }

    let percentile = assign_percentile(&format!("{}:{}", flag.key, user_id));
    if percentile as i32 <= flag.rollout_percentage {
        FlagEvaluation {
            key: flag.key.clone(),
            enabled: true,
            reason: format!("rollout-{}%", flag.rollout_percentage),
            version: flag.version,
        }
    } else {
        FlagEvaluation {
            key: flag.key.clone(),
            enabled: false,
            reason: format!("rollout-miss-{}%", flag.rollout_percentage),
            version: flag.version,
        }
    }
}
