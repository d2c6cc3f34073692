//! Severity policies: the injected predicate deciding whether a parsed payload is critical.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::ConfigError;

/// Decides whether a payload is critical. `Some(reason)` means critical.
///
/// Implementations must be deterministic: the same payload always yields the same verdict.
pub trait SeverityPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, payload: &Map<String, Value>) -> Option<String>;
}

/// Identifier of a policy, as given by `SEVERITY_POLICY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeverityPolicyKind {
    Vitals,
    Threshold,
    RoutineOnly,
}

impl FromStr for SeverityPolicyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "vitals" => Ok(SeverityPolicyKind::Vitals),
            "threshold" => Ok(SeverityPolicyKind::Threshold),
            "routine-only" => Ok(SeverityPolicyKind::RoutineOnly),
            _ => Err(ConfigError::UnknownOption {
                option: "SEVERITY_POLICY",
                value: s.to_owned(),
            }),
        }
    }
}

/// Tunables shared by the built-in policies.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySettings {
    pub heart_rate_max: f64,
    pub heart_rate_min: f64,
    pub spo2_min: f64,
    pub field: String,
    pub threshold: f64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            heart_rate_max: 180.0,
            heart_rate_min: 40.0,
            spo2_min: 88.0,
            field: String::new(),
            threshold: 0.0,
        }
    }
}

pub fn build_policy(kind: SeverityPolicyKind, settings: &PolicySettings) -> Arc<dyn SeverityPolicy> {
    match kind {
        SeverityPolicyKind::Vitals => Arc::new(VitalsPolicy {
            heart_rate_max: settings.heart_rate_max,
            heart_rate_min: settings.heart_rate_min,
            spo2_min: settings.spo2_min,
        }),
        SeverityPolicyKind::Threshold => Arc::new(ThresholdPolicy {
            field: settings.field.clone(),
            threshold: settings.threshold,
        }),
        SeverityPolicyKind::RoutineOnly => Arc::new(RoutineOnlyPolicy),
    }
}

/// Look up a field at the top level, falling back to `readings` when the top-level
/// value is missing or of the wrong type.
fn reading<T>(
    payload: &Map<String, Value>,
    field: &str,
    extract: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    payload.get(field).and_then(&extract).or_else(|| {
        payload
            .get("readings")
            .and_then(Value::as_object)
            .and_then(|readings| readings.get(field))
            .and_then(&extract)
    })
}

/// Look up a dotted path such as `readings.temperature`.
fn path<'a>(payload: &'a Map<String, Value>, dotted: &str) -> Option<&'a Value> {
    let mut parts = dotted.split('.');
    let mut current = payload.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn flag(payload: &Map<String, Value>, field: &str) -> bool {
    reading(payload, field, Value::as_bool) == Some(true)
}

/// Wearable vitals: falls, panic button, heart rate band and blood oxygen floor.
#[derive(Debug, Clone)]
pub struct VitalsPolicy {
    pub heart_rate_max: f64,
    pub heart_rate_min: f64,
    pub spo2_min: f64,
}

impl SeverityPolicy for VitalsPolicy {
    fn name(&self) -> &'static str {
        "vitals"
    }

    fn evaluate(&self, payload: &Map<String, Value>) -> Option<String> {
        let mut reasons = Vec::new();

        if flag(payload, "fall_detected") {
            reasons.push("fall detected".to_owned());
        }
        if flag(payload, "panic_button") {
            reasons.push("panic button pressed".to_owned());
        }
        if let Some(heart_rate) = reading(payload, "heart_rate", Value::as_f64) {
            if heart_rate > self.heart_rate_max {
                reasons.push(format!(
                    "heart_rate {heart_rate} above {}",
                    self.heart_rate_max
                ));
            } else if heart_rate < self.heart_rate_min {
                reasons.push(format!(
                    "heart_rate {heart_rate} below {}",
                    self.heart_rate_min
                ));
            }
        }
        if let Some(spo2) = reading(payload, "spo2", Value::as_f64) {
            if spo2 < self.spo2_min {
                reasons.push(format!("spo2 {spo2} below {}", self.spo2_min));
            }
        }

        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("; "))
        }
    }
}

/// Critical when a single numeric field reaches a threshold.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    pub field: String,
    pub threshold: f64,
}

impl SeverityPolicy for ThresholdPolicy {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn evaluate(&self, payload: &Map<String, Value>) -> Option<String> {
        let value = path(payload, &self.field)?.as_f64()?;
        (value >= self.threshold).then(|| {
            format!(
                "{} {value} at or above {}",
                self.field, self.threshold
            )
        })
    }
}

/// Never critical. Disables alerting without touching the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct RoutineOnlyPolicy;

impl SeverityPolicy for RoutineOnlyPolicy {
    fn name(&self) -> &'static str {
        "routine-only"
    }

    fn evaluate(&self, _payload: &Map<String, Value>) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn vitals() -> VitalsPolicy {
        VitalsPolicy {
            heart_rate_max: 180.0,
            heart_rate_min: 40.0,
            spo2_min: 88.0,
        }
    }

    #[test]
    fn test_vitals_normal_readings_are_routine() {
        let payload = object(json!({"heart_rate": 72, "spo2": 98, "fall_detected": false}));
        assert_eq!(vitals().evaluate(&payload), None);
    }

    #[test]
    fn test_vitals_flags_falls_and_panic() {
        let payload = object(json!({"fall_detected": true}));
        assert_eq!(vitals().evaluate(&payload), Some("fall detected".to_owned()));

        let payload = object(json!({"readings": {"panic_button": true}}));
        assert_eq!(
            vitals().evaluate(&payload),
            Some("panic button pressed".to_owned())
        );
    }

    #[test]
    fn test_vitals_heart_rate_band() {
        let payload = object(json!({"heart_rate": 192}));
        assert_eq!(
            vitals().evaluate(&payload),
            Some("heart_rate 192 above 180".to_owned())
        );

        let payload = object(json!({"readings": {"heart_rate": 31.5}}));
        assert_eq!(
            vitals().evaluate(&payload),
            Some("heart_rate 31.5 below 40".to_owned())
        );

        // Boundaries are inclusive of the normal band
        let payload = object(json!({"heart_rate": 180}));
        assert_eq!(vitals().evaluate(&payload), None);
    }

    #[test]
    fn test_vitals_combines_reasons() {
        let payload = object(json!({"fall_detected": true, "spo2": 80}));
        assert_eq!(
            vitals().evaluate(&payload),
            Some("fall detected; spo2 80 below 88".to_owned())
        );
    }

    #[test]
    fn test_vitals_ignores_non_numeric_readings() {
        let payload = object(json!({"heart_rate": "fast", "spo2": null}));
        assert_eq!(vitals().evaluate(&payload), None);
    }

    #[test]
    fn test_vitals_falls_back_to_nested_reading_of_the_right_type() {
        let payload = object(json!({"heart_rate": "fast", "readings": {"heart_rate": 195}}));
        assert_eq!(
            vitals().evaluate(&payload),
            Some("heart_rate 195 above 180".to_owned())
        );

        let payload = object(json!({"fall_detected": "yes", "readings": {"fall_detected": true}}));
        assert_eq!(vitals().evaluate(&payload), Some("fall detected".to_owned()));
    }

    #[test]
    fn test_threshold_policy_uses_dotted_path() {
        let policy = ThresholdPolicy {
            field: "readings.temperature".to_owned(),
            threshold: 39.5,
        };

        let payload = object(json!({"readings": {"temperature": 40.1}}));
        assert_eq!(
            policy.evaluate(&payload),
            Some("readings.temperature 40.1 at or above 39.5".to_owned())
        );

        let payload = object(json!({"readings": {"temperature": 37.0}}));
        assert_eq!(policy.evaluate(&payload), None);

        let payload = object(json!({"temperature": 41}));
        assert_eq!(policy.evaluate(&payload), None);
    }

    #[test]
    fn test_routine_only_policy() {
        let payload = object(json!({"fall_detected": true}));
        assert_eq!(RoutineOnlyPolicy.evaluate(&payload), None);
    }

    #[test]
    fn test_policy_kind_from_str() {
        assert_eq!(
            "VITALS".parse::<SeverityPolicyKind>().unwrap(),
            SeverityPolicyKind::Vitals
        );
        assert_eq!(
            "routine-only".parse::<SeverityPolicyKind>().unwrap(),
            SeverityPolicyKind::RoutineOnly
        );
        assert!("magic".parse::<SeverityPolicyKind>().is_err());
    }

    #[test]
    fn test_build_policy_selects_implementation() {
        let settings = PolicySettings::default();
        assert_eq!(
            build_policy(SeverityPolicyKind::Vitals, &settings).name(),
            "vitals"
        );
        assert_eq!(
            build_policy(SeverityPolicyKind::RoutineOnly, &settings).name(),
            "routine-only"
        );
    }
}
