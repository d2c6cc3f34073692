//! Classifier - assigns a severity and a dedup key to every raw event.
//!
//! Classification is pure: the same `RawEvent` always produces the same
//! `ClassifiedEvent`. A payload that cannot be parsed is never an error, it is
//! classified `Routine` with the `malformed` flag set so it still gets persisted.

pub mod policy;

use std::sync::Arc;

use kit_common::{dedup_key, ClassifiedEvent, RawEvent, Severity};
use serde_json::Value;

use self::policy::SeverityPolicy;

#[derive(Clone)]
pub struct Classifier {
    policy: Arc<dyn SeverityPolicy>,
}

impl Classifier {
    pub fn new(policy: Arc<dyn SeverityPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn classify(&self, event: RawEvent) -> ClassifiedEvent {
        let dedup_key = dedup_key(&event.device_id, &event.event_id);

        let (severity, malformed, reason) = match serde_json::from_slice::<Value>(&event.payload)
        {
            Ok(Value::Object(payload)) => match self.policy.evaluate(&payload) {
                Some(reason) => (Severity::Critical, false, Some(reason)),
                None => (Severity::Routine, false, None),
            },
            _ => (Severity::Routine, true, None),
        };

        ClassifiedEvent {
            event,
            severity,
            dedup_key,
            malformed,
            reason,
        }
    }
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("policy", &self.policy.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};

    use super::policy::{build_policy, PolicySettings, SeverityPolicyKind};
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(build_policy(
            SeverityPolicyKind::Vitals,
            &PolicySettings::default(),
        ))
    }

    fn raw(payload: &'static [u8]) -> RawEvent {
        RawEvent {
            device_id: "kit-42".to_owned(),
            event_id: "e1".to_owned(),
            timestamp: Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap(),
            payload: Bytes::from_static(payload),
            partition: 0,
            partition_offset: 3,
        }
    }

    #[test]
    fn test_critical_payload() {
        let classified = classifier().classify(raw(br#"{"fall_detected": true}"#));

        assert_eq!(classified.severity, Severity::Critical);
        assert!(!classified.malformed);
        assert_eq!(classified.reason.as_deref(), Some("fall detected"));
        assert_eq!(classified.dedup_key, dedup_key("kit-42", "e1"));
    }

    #[test]
    fn test_routine_payload() {
        let classified = classifier().classify(raw(br#"{"heart_rate": 70}"#));

        assert_eq!(classified.severity, Severity::Routine);
        assert!(!classified.malformed);
        assert_eq!(classified.reason, None);
    }

    #[test]
    fn test_malformed_payloads_are_routine_and_flagged() {
        for payload in [
            &b"not json at all"[..],
            &b"{\"heart_rate\": "[..],
            &b"[1, 2, 3]"[..],
            &b"\"fall_detected\""[..],
            &[0xff, 0xfe, 0x00][..],
            &b""[..],
        ] {
            let mut event = raw(b"");
            event.payload = Bytes::copy_from_slice(payload);

            let classified = classifier().classify(event.clone());

            assert_eq!(classified.severity, Severity::Routine);
            assert!(classified.malformed, "payload {payload:?} should be malformed");
            assert_eq!(classified.event, event, "the raw event is carried unchanged");
        }
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = classifier();
        let event = raw(br#"{"heart_rate": 200, "spo2": 70}"#);

        let first = classifier.classify(event.clone());
        let second = classifier.classify(event);

        assert_eq!(first, second);
    }

    #[test]
    fn test_policy_swap_changes_only_severity() {
        let routine_only = Classifier::new(build_policy(
            SeverityPolicyKind::RoutineOnly,
            &PolicySettings::default(),
        ));
        let event = raw(br#"{"fall_detected": true}"#);

        let vitals = classifier().classify(event.clone());
        let disabled = routine_only.classify(event);

        assert_eq!(vitals.severity, Severity::Critical);
        assert_eq!(disabled.severity, Severity::Routine);
        assert_eq!(vitals.dedup_key, disabled.dedup_key);
    }
}
