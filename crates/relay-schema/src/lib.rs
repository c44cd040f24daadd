//! Named payload validators keyed by type string.
//!
//! The registry never transforms payloads; it only answers whether a
//! payload conforms to a registered schema version. Dispatch contract
//! validators (implementer/reviewer, v1) are registered by
//! [`register_dispatch_validators`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use relay_types::{ImplementerResult, ReviewerResult};

pub const IMPLEMENTER_RESULT_TYPE: &str = "dispatch.result.implementer";
pub const REVIEWER_RESULT_TYPE: &str = "dispatch.result.reviewer";
pub const DISPATCH_SCHEMA_VERSION: &str = "v1";

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("no validator registered for type \"{0}\"")]
    UnknownType(String),

    #[error("no validator registered for type \"{0}\" version \"{1}\"")]
    UnknownVersion(String, String),

    #[error("payload failed schema {schema_id} {schema_version}: {message}")]
    Invalid {
        schema_id: String,
        schema_version: String,
        message: String,
    },
}

pub type ValidatorFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
struct RegisteredValidator {
    schema_id: String,
    schema_version: String,
    validator: ValidatorFn,
}

/// Registry of validators by `(type, schemaId, schemaVersion)`. The latest
/// registration per type wins when no version is requested.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    by_type: HashMap<String, Vec<RegisteredValidator>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        schema_id: impl Into<String>,
        schema_version: impl Into<String>,
        validator: ValidatorFn,
    ) {
        self.by_type
            .entry(type_name.into())
            .or_default()
            .push(RegisteredValidator {
                schema_id: schema_id.into(),
                schema_version: schema_version.into(),
                validator,
            });
    }

    fn resolve(
        &self,
        type_name: &str,
        version: Option<&str>,
    ) -> Result<&RegisteredValidator, SchemaError> {
        let entries = self
            .by_type
            .get(type_name)
            .ok_or_else(|| SchemaError::UnknownType(type_name.to_string()))?;
        match version {
            None => entries
                .last()
                .ok_or_else(|| SchemaError::UnknownType(type_name.to_string())),
            Some(v) => entries
                .iter()
                .rev()
                .find(|e| e.schema_version == v)
                .ok_or_else(|| SchemaError::UnknownVersion(type_name.to_string(), v.to_string())),
        }
    }

    pub fn validate(&self, type_name: &str, payload: &Value, version: Option<&str>) -> bool {
        self.assert_valid(type_name, payload, version).is_ok()
    }

    pub fn assert_valid(
        &self,
        type_name: &str,
        payload: &Value,
        version: Option<&str>,
    ) -> Result<(), SchemaError> {
        let entry = self.resolve(type_name, version)?;
        (entry.validator)(payload).map_err(|message| SchemaError::Invalid {
            schema_id: entry.schema_id.clone(),
            schema_version: entry.schema_version.clone(),
            message,
        })
    }

    pub fn has_type(&self, type_name: &str) -> bool {
        self.by_type.contains_key(type_name)
    }
}

/// Register the strict v1 dispatch contract validators.
pub fn register_dispatch_validators(registry: &mut SchemaRegistry) {
    registry.register(
        IMPLEMENTER_RESULT_TYPE,
        "dispatch_result_implementer",
        DISPATCH_SCHEMA_VERSION,
        Arc::new(|payload: &Value| {
            serde_json::from_value::<ImplementerResult>(payload.clone())
                .map(|_| ())
                .map_err(|err| err.to_string())
        }),
    );
    registry.register(
        REVIEWER_RESULT_TYPE,
        "dispatch_result_reviewer",
        DISPATCH_SCHEMA_VERSION,
        Arc::new(|payload: &Value| {
            serde_json::from_value::<ReviewerResult>(payload.clone())
                .map(|_| ())
                .map_err(|err| err.to_string())
        }),
    );
}

/// A registry with the dispatch validators pre-registered.
pub fn default_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    register_dispatch_validators(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn implementer_payload() -> Value {
        json!({
            "task_id": "1",
            "status": "completed",
            "summary": "ok",
            "files_changed": ["src/x.rs"],
            "tests": [{"command": "cargo test", "passed": true}],
            "follow_up_actions": []
        })
    }

    #[test]
    fn implementer_payload_validates() {
        let registry = default_registry();
        assert!(registry.validate(IMPLEMENTER_RESULT_TYPE, &implementer_payload(), None));
        assert!(registry.validate(
            IMPLEMENTER_RESULT_TYPE,
            &implementer_payload(),
            Some("v1")
        ));
    }

    #[test]
    fn unknown_keys_fail_strict_validation() {
        let registry = default_registry();
        let mut payload = implementer_payload();
        payload["surprise"] = json!(true);
        let err = registry
            .assert_valid(IMPLEMENTER_RESULT_TYPE, &payload, None)
            .unwrap_err();
        match err {
            SchemaError::Invalid { schema_version, .. } => assert_eq!(schema_version, "v1"),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_field_fails() {
        let registry = default_registry();
        let mut payload = implementer_payload();
        payload.as_object_mut().unwrap().remove("tests");
        assert!(!registry.validate(IMPLEMENTER_RESULT_TYPE, &payload, None));
    }

    #[test]
    fn task_id_must_be_a_string() {
        let registry = default_registry();
        let mut payload = implementer_payload();
        payload["task_id"] = json!(7);
        assert!(!registry.validate(IMPLEMENTER_RESULT_TYPE, &payload, None));
    }

    #[test]
    fn reviewer_enums_are_closed_sets() {
        let registry = default_registry();
        let payload = json!({
            "task_id": "1",
            "assessment": "maybe",
            "strengths": [],
            "issues": [],
            "required_fixes": []
        });
        assert!(!registry.validate(REVIEWER_RESULT_TYPE, &payload, None));
    }

    #[test]
    fn unknown_type_and_version_are_reported() {
        let registry = default_registry();
        assert!(matches!(
            registry.assert_valid("mystery", &json!({}), None),
            Err(SchemaError::UnknownType(_))
        ));
        assert!(matches!(
            registry.assert_valid(IMPLEMENTER_RESULT_TYPE, &json!({}), Some("v9")),
            Err(SchemaError::UnknownVersion(_, _))
        ));
    }

    #[test]
    fn latest_registration_wins_without_version() {
        let mut registry = SchemaRegistry::new();
        registry.register(
            "t",
            "first",
            "v1",
            Arc::new(|_| Err("always invalid".to_string())),
        );
        registry.register("t", "second", "v2", Arc::new(|_| Ok(())));
        assert!(registry.validate("t", &json!({}), None));
        assert!(!registry.validate("t", &json!({}), Some("v1")));
    }
}
