use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structural shape an enqueued payload must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadSchema {
    /// Field definitions that comprise this payload's shape.
    pub fields: Vec<FieldDef>,
    /// Whether fields not listed in `fields` are accepted.
    pub allow_unknown: bool,
}

/// Single field definition within a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Name of the field as it appears in the JSON payload.
    pub name: String,
    /// Expected JSON type.
    pub kind: FieldKind,
    /// Whether the field must be present and non-null.
    pub required: bool,
}

/// JSON type expected for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Bool => "bool",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        }
    }
}

/// Result of validating a value against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// The value conforms to the schema.
    Valid,
    /// The value violates one or more schema constraints.
    Invalid {
        /// Human-readable descriptions of each validation failure.
        errors: Vec<String>,
    },
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

impl FieldDef {
    #[must_use]
    pub fn required(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
        }
    }

    #[must_use]
    pub fn optional(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
        }
    }
}

impl PayloadSchema {
    /// Strict schema: only the listed fields are allowed.
    #[must_use]
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self {
            fields,
            allow_unknown: false,
        }
    }

    /// Accepts any JSON object.
    #[must_use]
    pub fn any() -> Self {
        Self {
            fields: Vec::new(),
            allow_unknown: true,
        }
    }

    /// Allows fields not named in the schema.
    #[must_use]
    pub fn allowing_unknown(mut self) -> Self {
        self.allow_unknown = true;
        self
    }

    /// Validates `payload`, collecting every violation rather than stopping at the first.
    #[must_use]
    pub fn validate(&self, payload: &Value) -> ValidationResult {
        let Some(object) = payload.as_object() else {
            return ValidationResult::Invalid {
                errors: vec!["payload must be a JSON object".to_string()],
            };
        };

        let mut errors = Vec::new();

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        errors.push(format!("missing required field `{}`", field.name));
                    }
                }
                Some(value) if !field.kind.matches(value) => {
                    errors.push(format!(
                        "field `{}` must be of type {}",
                        field.name,
                        field.kind.as_str()
                    ));
                }
                Some(_) => {}
            }
        }

        if !self.allow_unknown {
            for key in object.keys() {
                if !self.fields.iter().any(|f| &f.name == key) {
                    errors.push(format!("unknown field `{key}`"));
                }
            }
        }

        if errors.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid { errors }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sms_schema() -> PayloadSchema {
        PayloadSchema::new(vec![
            FieldDef::required("phoneNumber", FieldKind::String),
            FieldDef::required("message", FieldKind::String),
        ])
    }

    #[test]
    fn conforming_payload_is_valid() {
        let result = sms_schema().validate(&json!({
            "phoneNumber": "+15551234567",
            "message": "Join my trip",
        }));
        assert!(result.is_valid());
    }

    #[test]
    fn non_object_is_invalid() {
        let result = sms_schema().validate(&json!("hello"));
        assert_eq!(
            result,
            ValidationResult::Invalid {
                errors: vec!["payload must be a JSON object".to_string()]
            }
        );
    }

    #[test]
    fn reports_every_violation() {
        let result = sms_schema().validate(&json!({
            "phoneNumber": 15551234567_u64,
            "extra": true,
        }));
        let ValidationResult::Invalid { errors } = result else {
            panic!("expected invalid");
        };
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("`phoneNumber` must be of type string")));
        assert!(errors.iter().any(|e| e.contains("missing required field `message`")));
        assert!(errors.iter().any(|e| e.contains("unknown field `extra`")));
    }

    #[test]
    fn null_required_field_counts_as_missing() {
        let result = sms_schema().validate(&json!({"phoneNumber": null, "message": "x"}));
        assert!(!result.is_valid());
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let schema = PayloadSchema::new(vec![
            FieldDef::required("tripId", FieldKind::String),
            FieldDef::optional("data", FieldKind::Object),
        ]);
        assert!(schema.validate(&json!({"tripId": "t1"})).is_valid());
        assert!(!schema.validate(&json!({"tripId": "t1", "data": [1]})).is_valid());
    }

    #[test]
    fn any_schema_accepts_objects_only() {
        let schema = PayloadSchema::any();
        assert!(schema.validate(&json!({})).is_valid());
        assert!(schema.validate(&json!({"nested": {"deep": [1, 2, 3]}})).is_valid());
        assert!(!schema.validate(&json!([1, 2])).is_valid());
    }
}
