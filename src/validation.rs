//! Input validation for authorization requests.

use crate::errors::AuthorizationError;
use crate::handlers::AuthorizeRequest;
use crate::model::{AttributeMap, AttributeValue};

const MAX_FIELD_LEN: usize = 256;
const MAX_ATTRIBUTES: usize = 256;
const MAX_SEQUENCE_LEN: usize = 1024;
const MAX_VALUE_LEN: usize = 4096;

/// Validate an authorization request before it reaches the engine.
/// `resource_type` and `action` must be non-empty; the subject may be
/// empty (anonymous).
pub fn validate_authorize_request(body: &AuthorizeRequest) -> Result<(), AuthorizationError> {
    validate_name_field(&body.action, || AuthorizationError::InvalidAction {
        reason: describe_field(&body.action),
    })?;
    validate_name_field(&body.resource_type, || {
        AuthorizationError::InvalidResourceType {
            reason: describe_field(&body.resource_type),
        }
    })?;

    if let Some(subject) = &body.subject {
        validate_attribute_map(subject, "subject")?;
    }
    validate_attribute_map(&body.context, "context")?;

    Ok(())
}

fn validate_name_field<E>(value: &str, err: impl Fn() -> E) -> Result<(), E> {
    let trimmed = value.trim();
    if trimmed.is_empty()
        || trimmed.len() > MAX_FIELD_LEN
        || trimmed.chars().any(char::is_control)
    {
        return Err(err());
    }
    Ok(())
}

fn describe_field(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        "(empty)".to_string()
    } else if trimmed.len() > MAX_FIELD_LEN {
        "too long".to_string()
    } else {
        "contains control characters".to_string()
    }
}

/// Attribute maps carry scalars or flat sequences of scalars, within
/// bounded sizes; anything deeper or larger is rejected up front.
pub fn validate_attribute_map(
    map: &AttributeMap,
    field: &str,
) -> Result<(), AuthorizationError> {
    if map.len() > MAX_ATTRIBUTES {
        return Err(AuthorizationError::InvalidAttributes {
            field: field.to_string(),
            reason: format!("more than {MAX_ATTRIBUTES} attributes"),
        });
    }
    for (key, value) in map {
        if key.is_empty() || key.len() > MAX_FIELD_LEN {
            return Err(AuthorizationError::InvalidAttributes {
                field: field.to_string(),
                reason: format!("attribute name '{key}' out of bounds"),
            });
        }
        if !value.is_flat() {
            return Err(AuthorizationError::InvalidAttributes {
                field: field.to_string(),
                reason: format!("attribute '{key}' nests sequences"),
            });
        }
        if let AttributeValue::List(items) = value {
            if items.len() > MAX_SEQUENCE_LEN {
                return Err(AuthorizationError::InvalidAttributes {
                    field: field.to_string(),
                    reason: format!("attribute '{key}' sequence too long"),
                });
            }
        }
        if text_too_long(value) {
            return Err(AuthorizationError::InvalidAttributes {
                field: field.to_string(),
                reason: format!("attribute '{key}' text value too long"),
            });
        }
    }
    Ok(())
}

fn text_too_long(value: &AttributeValue) -> bool {
    match value {
        AttributeValue::Text(s) => s.len() > MAX_VALUE_LEN,
        AttributeValue::List(items) => items.iter().any(text_too_long),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttributeValue;

    fn base_request() -> AuthorizeRequest {
        AuthorizeRequest {
            request_id: "r1".into(),
            subject_id: None,
            subject: Some(AttributeMap::new()),
            resource_type: "plans".into(),
            action: "read".into(),
            context: AttributeMap::new(),
        }
    }

    #[test]
    fn accepts_a_plain_request() {
        assert!(validate_authorize_request(&base_request()).is_ok());
    }

    #[test]
    fn rejects_empty_action_and_resource_type() {
        let mut req = base_request();
        req.action = "  ".into();
        assert!(matches!(
            validate_authorize_request(&req),
            Err(AuthorizationError::InvalidAction { .. })
        ));

        let mut req = base_request();
        req.resource_type = String::new();
        assert!(matches!(
            validate_authorize_request(&req),
            Err(AuthorizationError::InvalidResourceType { .. })
        ));
    }

    #[test]
    fn rejects_control_characters() {
        let mut req = base_request();
        req.action = "read\0".into();
        assert!(validate_authorize_request(&req).is_err());
    }

    #[test]
    fn rejects_nested_sequences_in_context() {
        let mut req = base_request();
        req.context.insert(
            "weird".into(),
            AttributeValue::List(vec![AttributeValue::List(vec![1i64.into()])]),
        );
        assert!(matches!(
            validate_authorize_request(&req),
            Err(AuthorizationError::InvalidAttributes { .. })
        ));
    }

    #[test]
    fn rejects_oversized_text_values() {
        let mut req = base_request();
        req.context
            .insert("blob".into(), AttributeValue::Text("x".repeat(5000)));
        assert!(matches!(
            validate_authorize_request(&req),
            Err(AuthorizationError::InvalidAttributes { .. })
        ));

        let mut req = base_request();
        req.context.insert(
            "blobs".into(),
            AttributeValue::List(vec![AttributeValue::Text("x".repeat(5000))]),
        );
        assert!(validate_authorize_request(&req).is_err());
    }

    #[test]
    fn anonymous_subject_is_fine() {
        let mut req = base_request();
        req.subject = None;
        assert!(validate_authorize_request(&req).is_ok());
    }
}
