//! Condition evaluation over dotted paths into a JSON tree.
//!
//! Conditions are the trigger gate and the `condition` step's test. A
//! condition names a field path, an operator and a comparison value; all
//! conditions in a trigger must hold (AND) for the workflow to start.
//!
//! Type coercion follows the declared type. For the numeric operators a
//! non-numeric operand makes the condition **false**, never an error — a
//! misconfigured condition must not take down event processing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    In,
    NotIn,
}

/// Declared coercion for the comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoerceType {
    String,
    Number,
    Boolean,
}

/// One condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted path into the evaluated tree, with nested-object support.
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
    /// Optional declared type driving coercion.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<CoerceType>,
}

/// Walks a dotted path through nested objects. Array indices are accepted as
/// numeric segments.
pub fn lookup_path<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = tree;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Evaluates one condition against a tree. Missing fields are false for
/// every operator except `not_equals`, `not_contains` and `not_in`, which
/// hold vacuously.
pub fn evaluate_condition(condition: &Condition, tree: &Value) -> bool {
    let Some(actual) = lookup_path(tree, &condition.field) else {
        return matches!(
            condition.operator,
            Operator::NotEquals | Operator::NotContains | Operator::NotIn
        );
    };

    match condition.operator {
        Operator::Equals => coerced_eq(actual, &condition.value, condition.value_type),
        Operator::NotEquals => !coerced_eq(actual, &condition.value, condition.value_type),
        Operator::Contains => as_text(actual).contains(&as_text(&condition.value)),
        Operator::NotContains => !as_text(actual).contains(&as_text(&condition.value)),
        Operator::StartsWith => as_text(actual).starts_with(&as_text(&condition.value)),
        Operator::EndsWith => as_text(actual).ends_with(&as_text(&condition.value)),
        Operator::Regex => match regex::Regex::new(&as_text(&condition.value)) {
            Ok(re) => re.is_match(&as_text(actual)),
            Err(_) => false,
        },
        Operator::GreaterThan => numeric(actual, &condition.value, |a, b| a > b),
        Operator::LessThan => numeric(actual, &condition.value, |a, b| a < b),
        Operator::GreaterOrEqual => numeric(actual, &condition.value, |a, b| a >= b),
        Operator::LessOrEqual => numeric(actual, &condition.value, |a, b| a <= b),
        Operator::In => in_set(actual, &condition.value),
        Operator::NotIn => !in_set(actual, &condition.value),
    }
}

/// All-AND evaluation; an empty list holds.
pub fn evaluate_all(conditions: &[Condition], tree: &Value) -> bool {
    conditions.iter().all(|c| evaluate_condition(c, tree))
}

fn coerced_eq(actual: &Value, expected: &Value, coerce: Option<CoerceType>) -> bool {
    match coerce {
        Some(CoerceType::String) => as_text(actual) == as_text(expected),
        Some(CoerceType::Number) => match (as_number(actual), as_number(expected)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        Some(CoerceType::Boolean) => match (as_bool(actual), as_bool(expected)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        // Untyped: try strict equality first, then text comparison so that
        // "5" and 5 compare equal the way panel-authored conditions expect.
        None => actual == expected || as_text(actual) == as_text(expected),
    }
}

fn numeric(actual: &Value, expected: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn in_set(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Array(items) => items
            .iter()
            .any(|item| actual == item || as_text(actual) == as_text(item)),
        // A non-array "in" falls back to substring-of-text semantics.
        other => as_text(other).contains(&as_text(actual)),
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(field: &str, operator: Operator, value: Value) -> Condition {
        Condition {
            field: field.to_string(),
            operator,
            value,
            value_type: None,
        }
    }

    #[test]
    fn contains_matches_substrings() {
        let tree = json!({"message": "Hi, !help please"});
        assert!(evaluate_condition(
            &cond("message", Operator::Contains, json!("!help")),
            &tree
        ));
        assert!(!evaluate_condition(
            &cond("message", Operator::Contains, json!("!admin")),
            &tree
        ));
    }

    #[test]
    fn nested_paths_resolve() {
        let tree = json!({"player": {"scores": [10, 20], "name": "Alice"}});
        assert!(evaluate_condition(
            &cond("player.name", Operator::Equals, json!("Alice")),
            &tree
        ));
        assert!(evaluate_condition(
            &cond("player.scores.1", Operator::GreaterThan, json!(15)),
            &tree
        ));
    }

    #[test]
    fn numeric_operator_on_non_numeric_is_false_not_an_error() {
        let tree = json!({"damage": "lots"});
        assert!(!evaluate_condition(
            &cond("damage", Operator::GreaterThan, json!(10)),
            &tree
        ));
        let tree = json!({"damage": 50});
        assert!(!evaluate_condition(
            &cond("damage", Operator::LessThan, json!("many")),
            &tree
        ));
    }

    #[test]
    fn numeric_strings_coerce_for_comparisons() {
        let tree = json!({"damage": "120.5"});
        assert!(evaluate_condition(
            &cond("damage", Operator::GreaterOrEqual, json!(100)),
            &tree
        ));
    }

    #[test]
    fn starts_and_ends_with() {
        let tree = json!({"layer": "Narva_AAS_v1"});
        assert!(evaluate_condition(
            &cond("layer", Operator::StartsWith, json!("Narva")),
            &tree
        ));
        assert!(evaluate_condition(
            &cond("layer", Operator::EndsWith, json!("v1")),
            &tree
        ));
    }

    #[test]
    fn regex_operator() {
        let tree = json!({"message": "!warn Alice stop it"});
        assert!(evaluate_condition(
            &cond("message", Operator::Regex, json!(r"^!warn \w+")),
            &tree
        ));
        // An invalid pattern is false, not a crash.
        assert!(!evaluate_condition(
            &cond("message", Operator::Regex, json!("([")),
            &tree
        ));
    }

    #[test]
    fn in_and_not_in() {
        let tree = json!({"channel": "ChatAdmin"});
        assert!(evaluate_condition(
            &cond("channel", Operator::In, json!(["ChatAdmin", "ChatTeam"])),
            &tree
        ));
        assert!(evaluate_condition(
            &cond("channel", Operator::NotIn, json!(["ChatAll"])),
            &tree
        ));
    }

    #[test]
    fn missing_fields_hold_only_for_negative_operators() {
        let tree = json!({});
        assert!(!evaluate_condition(
            &cond("absent", Operator::Equals, json!(1)),
            &tree
        ));
        assert!(evaluate_condition(
            &cond("absent", Operator::NotEquals, json!(1)),
            &tree
        ));
        assert!(evaluate_condition(
            &cond("absent", Operator::NotIn, json!([1])),
            &tree
        ));
    }

    #[test]
    fn typed_boolean_equality() {
        let tree = json!({"teamkill": true});
        let condition = Condition {
            field: "teamkill".to_string(),
            operator: Operator::Equals,
            value: json!("true"),
            value_type: Some(CoerceType::Boolean),
        };
        assert!(evaluate_condition(&condition, &tree));
    }

    #[test]
    fn all_and_semantics() {
        let tree = json!({"message": "!help", "channel": "ChatAll"});
        let conditions = vec![
            cond("message", Operator::Contains, json!("!help")),
            cond("channel", Operator::Equals, json!("ChatAll")),
        ];
        assert!(evaluate_all(&conditions, &tree));
        let conditions_failing = vec![
            cond("message", Operator::Contains, json!("!help")),
            cond("channel", Operator::Equals, json!("ChatAdmin")),
        ];
        assert!(!evaluate_all(&conditions_failing, &tree));
        assert!(evaluate_all(&[], &tree));
    }
}
