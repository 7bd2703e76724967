use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::FlagError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum RuleOperator {
    #[serde(rename = "eq")]
    Eq,
    #[serde(rename = "ne")]
    Ne,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "nin")]
    Nin,
    // Operators we don't know about deserialize to this and never match,
    // so a newer writer can't make an older reader throw.
    #[serde(other, rename = "unknown")]
    Unknown,
}

/// A single attribute predicate. `value` is either a scalar or an array of
/// scalars; all comparisons are done on string-coerced values.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TargetRule {
    pub attr: String,
    pub op: RuleOperator,
    pub value: Value,
}

/// The authoritative flag snapshot, as stored and as cached.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Flag {
    pub key: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rollout_percentage: i32,
    #[serde(default)]
    pub target_groups: Vec<TargetRule>,
    pub version: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateFlagRequest {
    pub key: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rollout_percentage: i32,
    #[serde(default)]
    pub target_groups: Vec<TargetRule>,
}

impl CreateFlagRequest {
    pub fn validate(&self) -> Result<(), FlagError> {
        validate_rollout_percentage(self.rollout_percentage)
    }

    pub fn into_flag(self) -> Flag {
        Flag {
            key: self.key,
            description: self.description,
            enabled: self.enabled,
            rollout_percentage: self.rollout_percentage,
            target_groups: self.target_groups,
            version: 1,
        }
    }
}

/// Partial update. Unset fields keep their stored value; `version` always
/// bumps, even when the patch changes nothing.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpdateFlagRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub rollout_percentage: Option<i32>,
    #[serde(default)]
    pub target_groups: Option<Vec<TargetRule>>,
}

impl UpdateFlagRequest {
    pub fn validate(&self) -> Result<(), FlagError> {
        match self.rollout_percentage {
            Some(pct) => validate_rollout_percentage(pct),
            None => Ok(()),
        }
    }

    pub fn merge_into(&self, before: &Flag) -> Flag {
        Flag {
            key: before.key.clone(),
            description: self
                .description
                .clone()
                .or_else(|| before.description.clone()),
            enabled: self.enabled.unwrap_or(before.enabled),
            rollout_percentage: self
                .rollout_percentage
                .unwrap_or(before.rollout_percentage),
            target_groups: self
                .target_groups
                .clone()
                .unwrap_or_else(|| before.target_groups.clone()),
            version: before.version + 1,
        }
    }
}

fn validate_rollout_percentage(pct: i32) -> Result<(), FlagError> {
    if !(0..=100).contains(&pct) {
        return Err(FlagError::Validation(format!(
            "rollout_percentage must be between 0 and 100, got {}",
            pct
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_unknown_operator_deserializes_without_error() {
        let rule: TargetRule =
            serde_json::from_value(json!({"attr": "country", "op": "gt", "value": "10"}))
                .unwrap();
        assert_eq!(rule.op, RuleOperator::Unknown);
    }

    #[test]
    fn test_rollout_percentage_bounds_are_validated() {
        let request = CreateFlagRequest {
            key: "bad".to_string(),
            description: None,
            enabled: true,
            rollout_percentage: 101,
            target_groups: vec![],
        };
        match request.validate() {
            Err(FlagError::Validation(_)) => (),
            other => panic!("expected Validation error, got {:?}", other),
        }

        let patch = UpdateFlagRequest {
            rollout_percentage: Some(-1),
            ..Default::default()
        };
        assert!(patch.validate().is_err());
    }

    #[test]
    fn test_merge_keeps_unspecified_fields_and_bumps_version() {
        let before = Flag {
            key: "checkout".to_string(),
            description: Some("new checkout".to_string()),
            enabled: true,
            rollout_percentage: 25,
            target_groups: vec![],
            version: 3,
        };

        let patch = UpdateFlagRequest {
            rollout_percentage: Some(50),
            ..Default::default()
        };
        let after = patch.merge_into(&before);

        assert_eq!(after.rollout_percentage, 50);
        assert_eq!(after.description, before.description);
        assert!(after.enabled);
        assert_eq!(after.version, 4);
    }

    #[test]
    fn test_interleaved_updates_from_same_snapshot_last_writer_wins() {
        // Two writers read the same snapshot, merge independently, and
        // commit in turn. There is no compare-and-swap on version, so the
        // later commit wins wholesale: it writes the same version number and
        // silently discards the earlier writer's delta.
        let read_snapshot = Flag {
            key: "checkout".to_string(),
            description: None,
            enabled: true,
            rollout_percentage: 25,
            target_groups: vec![],
            version: 1,
        };

        let writer_a = UpdateFlagRequest {
            description: Some("from writer a".to_string()),
            ..Default::default()
        };
        let writer_b = UpdateFlagRequest {
            rollout_percentage: Some(75),
            ..Default::default()
        };

        let committed_first = writer_a.merge_into(&read_snapshot);
        let committed_last = writer_b.merge_into(&read_snapshot);

        assert_eq!(committed_first.version, 2);
        assert_eq!(committed_last.version, 2);

        // The surviving row has writer b's rollout but not writer a's
        // description: that delta is gone.
        assert_eq!(committed_last.rollout_percentage, 75);
        assert_eq!(committed_last.description, None);
    }

    #[test]
    fn test_empty_patch_still_bumps_version() {
        let before = Flag {
            key: "noop".to_string(),
            description: None,
            enabled: false,
            rollout_percentage: 0,
            target_groups: vec![],
            version: 1,
        };
        let after = UpdateFlagRequest::default().merge_into(&before);
        assert_eq!(after.version, 2);
        assert_eq!(after.enabled, before.enabled);
    }
}
