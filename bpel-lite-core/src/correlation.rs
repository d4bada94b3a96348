//! Correlation-key computation: evaluates declared property aliases against
//! a message payload and collects the values into a persisted lookup token.
//!
//! The computation is pure and deterministic — identical payload and set
//! always yield an equal key.

use crate::error::{CorrelationError, EngineError, ProcessFault};
use crate::types::{CorrelationKey, CorrelationSetDef, OperationDef, ProcessDef, PropertyAliasDef};
use serde_json::Value;

/// Evaluate a property alias against a message payload, returning the
/// normalized string value of the property.
///
/// The alias location is a dot-path into the canonical JSON payload. If the
/// target is a composite node, the string values of all its children are
/// concatenated in document order; a scalar is taken verbatim.
pub fn extract_property(
    payload: &Value,
    alias: &PropertyAliasDef,
) -> Result<String, ProcessFault> {
    let mut node = payload;
    for seg in alias.location.split('.').filter(|s| !s.is_empty()) {
        node = match node {
            Value::Object(map) => map.get(seg).ok_or_else(|| {
                ProcessFault::SelectionFailure(format!(
                    "no node at `{seg}` in location `{}`",
                    alias.location
                ))
            })?,
            Value::Array(items) => {
                let idx: usize = seg.parse().map_err(|_| {
                    ProcessFault::SelectionFailure(format!(
                        "non-numeric index `{seg}` into array at `{}`",
                        alias.location
                    ))
                })?;
                items.get(idx).ok_or_else(|| {
                    ProcessFault::SelectionFailure(format!(
                        "index {idx} out of bounds in location `{}`",
                        alias.location
                    ))
                })?
            }
            _ => {
                return Err(ProcessFault::SelectionFailure(format!(
                    "location `{}` descends through a scalar at `{seg}`",
                    alias.location
                )))
            }
        };
    }
    stringify_node(node).ok_or_else(|| {
        ProcessFault::SelectionFailure(format!(
            "location `{}` selected an empty node",
            alias.location
        ))
    })
}

/// String value of a selected node: scalars verbatim, composites as the
/// concatenation of their children's string values in document order.
fn stringify_node(node: &Value) -> Option<String> {
    match node {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        Value::Array(items) => {
            let mut out = String::new();
            for item in items {
                out.push_str(&stringify_node(item).unwrap_or_default());
            }
            Some(out)
        }
        Value::Object(map) => {
            let mut out = String::new();
            for (_, v) in map {
                out.push_str(&stringify_node(v).unwrap_or_default());
            }
            Some(out)
        }
    }
}

/// Compute one correlation set's key for a message of the given type.
///
/// Property values are collected in declaration order. A missing alias is a
/// configuration defect and fails fast; an alias that cannot be satisfied
/// by this concrete message is a selection-failure fault.
pub fn compute_correlation_key(
    cset: &CorrelationSetDef,
    message_type: &str,
    payload: &Value,
) -> Result<CorrelationKey, CorrelationError> {
    let mut values = Vec::with_capacity(cset.properties.len());
    for property in &cset.properties {
        let alias = cset.alias(property, message_type).ok_or_else(|| {
            CorrelationError::Config(EngineError::MissingPropertyAlias {
                property: property.clone(),
                message_type: message_type.to_string(),
            })
        })?;
        let value = extract_property(payload, alias).map_err(CorrelationError::Fault)?;
        values.push(value);
    }
    Ok(CorrelationKey::new(cset.set_id, values))
}

/// Compute the full candidate key set for an inbound message: one key per
/// correlation set the operation participates in (declaration order),
/// followed by the opaque session key if the endpoint carries one.
pub fn compute_candidate_keys(
    process: &ProcessDef,
    operation: &OperationDef,
    payload: &Value,
    session_id: Option<&str>,
) -> Result<Vec<CorrelationKey>, CorrelationError> {
    let mut keys = Vec::new();
    for set_id in &operation.correlation_sets {
        let cset = process.correlation_set(*set_id).ok_or_else(|| {
            CorrelationError::Config(EngineError::Consistency(format!(
                "operation `{}` references undeclared correlation set {set_id}",
                operation.name
            )))
        })?;
        keys.push(compute_correlation_key(
            cset,
            &operation.input_message_type,
            payload,
        )?);
    }
    if let Some(sid) = session_id {
        keys.push(CorrelationKey::opaque(sid));
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OPAQUE_CORRELATION_SET;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn order_cset() -> CorrelationSetDef {
        let mut aliases = BTreeMap::new();
        aliases.insert(
            ("orderId".to_string(), "OrderMessage".to_string()),
            PropertyAliasDef {
                location: "order.id".to_string(),
            },
        );
        aliases.insert(
            ("customer".to_string(), "OrderMessage".to_string()),
            PropertyAliasDef {
                location: "order.customer".to_string(),
            },
        );
        CorrelationSetDef {
            set_id: 1,
            name: "orderCorr".to_string(),
            properties: vec!["orderId".to_string(), "customer".to_string()],
            aliases,
        }
    }

    #[test]
    fn key_computation_is_deterministic() {
        let cset = order_cset();
        let msg = json!({"order": {"id": "123", "customer": "acme"}});
        let k1 = compute_correlation_key(&cset, "OrderMessage", &msg).unwrap();
        let k2 = compute_correlation_key(&cset, "OrderMessage", &msg).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1.values, vec!["123".to_string(), "acme".to_string()]);
    }

    #[test]
    fn values_follow_declaration_order() {
        let cset = order_cset();
        let msg = json!({"order": {"customer": "acme", "id": "123"}});
        let key = compute_correlation_key(&cset, "OrderMessage", &msg).unwrap();
        // orderId declared first, regardless of payload field order
        assert_eq!(key.values[0], "123");
        assert_eq!(key.values[1], "acme");
    }

    #[test]
    fn missing_alias_is_a_config_defect() {
        let cset = order_cset();
        let msg = json!({"order": {"id": "123"}});
        let err = compute_correlation_key(&cset, "UnknownMessage", &msg).unwrap_err();
        assert!(matches!(
            err,
            CorrelationError::Config(EngineError::MissingPropertyAlias { .. })
        ));
    }

    #[test]
    fn absent_node_is_a_selection_failure() {
        let cset = order_cset();
        let msg = json!({"order": {"id": "123"}});
        let err = compute_correlation_key(&cset, "OrderMessage", &msg).unwrap_err();
        assert!(matches!(
            err,
            CorrelationError::Fault(ProcessFault::SelectionFailure(_))
        ));
    }

    #[test]
    fn composite_node_concatenates_children_in_order() {
        let alias = PropertyAliasDef {
            location: "parts".to_string(),
        };
        let msg = json!({"parts": ["A-", 17, "-Z"]});
        assert_eq!(extract_property(&msg, &alias).unwrap(), "A-17-Z");
    }

    #[test]
    fn scalar_node_is_taken_verbatim() {
        let alias = PropertyAliasDef {
            location: "order.id".to_string(),
        };
        let msg = json!({"order": {"id": "ord-77"}});
        assert_eq!(extract_property(&msg, &alias).unwrap(), "ord-77");
    }

    #[test]
    fn candidate_keys_append_opaque_session_key() {
        let mut csets = BTreeMap::new();
        csets.insert(1, order_cset());
        let process = ProcessDef {
            process_id: "p1".to_string(),
            lifecycle: crate::types::ProcessLifecycle::Active,
            partner_links: vec![],
            correlation_sets: csets,
        };
        let op = OperationDef {
            name: "submitOrder".to_string(),
            pattern: crate::types::MexPattern::RequestResponse,
            create_instance: false,
            correlation_sets: vec![1],
            input_message_type: "OrderMessage".to_string(),
        };
        let msg = json!({"order": {"id": "123", "customer": "acme"}});
        let keys = compute_candidate_keys(&process, &op, &msg, Some("sess-4")).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].set_id, 1);
        assert_eq!(keys[1].set_id, OPAQUE_CORRELATION_SET);
    }
}
