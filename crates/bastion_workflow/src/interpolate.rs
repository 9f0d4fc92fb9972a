//! Just-in-time `${...}` interpolation of step configuration.
//!
//! String values may reference `${trigger_event.path}`, `${variables.name}`,
//! `${step_results.step_id.path}` and `${metadata.path}`. Interpolation runs
//! as a step is about to execute, so later steps observe earlier variable
//! mutations and step results.
//!
//! A string that consists of exactly one placeholder resolves to the typed
//! value (an array stays an array, a number stays a number); placeholders
//! embedded in longer text are stringified. Unresolvable references become
//! the empty string rather than erroring, matching how panel authors expect
//! missing optional fields to behave.

use crate::condition::lookup_path;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+(?:\.[A-Za-z0-9_\-]+)*)\}").unwrap());

/// The trees a placeholder can address.
#[derive(Debug, Clone, Copy)]
pub struct InterpolationContext<'a> {
    pub trigger_event: &'a Value,
    pub variables: &'a Value,
    pub step_results: &'a Value,
    pub metadata: &'a Value,
}

impl<'a> InterpolationContext<'a> {
    fn resolve(&self, reference: &str) -> Option<Value> {
        let (root, rest) = match reference.split_once('.') {
            Some((root, rest)) => (root, Some(rest)),
            None => (reference, None),
        };
        let tree = match root {
            "trigger_event" => self.trigger_event,
            "variables" => self.variables,
            "step_results" => self.step_results,
            "metadata" => self.metadata,
            _ => return None,
        };
        match rest {
            Some(path) => lookup_path(tree, path).cloned(),
            None => Some(tree.clone()),
        }
    }
}

/// Renders a resolved value into surrounding text. Integral numbers render
/// without a trailing `.0` so counters read naturally in messages.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Interpolates one string.
pub fn interpolate_string(input: &str, ctx: &InterpolationContext<'_>) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &regex::Captures<'_>| {
            ctx.resolve(&caps[1])
                .map(|v| value_to_string(&v))
                .unwrap_or_default()
        })
        .into_owned()
}

/// Interpolates a config tree in place, recursively.
///
/// Strings that are exactly one placeholder keep the referenced value's
/// type; everything else is textual substitution.
pub fn interpolate_value(input: &Value, ctx: &InterpolationContext<'_>) -> Value {
    match input {
        Value::String(s) => {
            if let Some(caps) = PLACEHOLDER.captures(s) {
                if caps
                    .get(0)
                    .map(|m| m.start() == 0 && m.end() == s.len())
                    .unwrap_or(false)
                {
                    return ctx.resolve(&caps[1]).unwrap_or(Value::Null);
                }
            }
            Value::String(interpolate_string(s, ctx))
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| interpolate_value(v, ctx)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(
        trigger: &'a Value,
        variables: &'a Value,
        results: &'a Value,
        metadata: &'a Value,
    ) -> InterpolationContext<'a> {
        InterpolationContext {
            trigger_event: trigger,
            variables,
            step_results: results,
            metadata,
        }
    }

    #[test]
    fn embedded_placeholders_stringify() {
        let trigger = json!({"player_name": "Alice"});
        let vars = json!({"count": 3});
        let results = json!({});
        let meta = json!({});
        let c = ctx(&trigger, &vars, &results, &meta);
        assert_eq!(
            interpolate_string("Welcome ${trigger_event.player_name}! Strikes: ${variables.count}", &c),
            "Welcome Alice! Strikes: 3"
        );
    }

    #[test]
    fn whole_string_placeholder_keeps_the_type() {
        let trigger = json!({"victims": ["a", "b"]});
        let vars = json!({});
        let results = json!({});
        let meta = json!({});
        let c = ctx(&trigger, &vars, &results, &meta);
        let resolved = interpolate_value(&json!("${trigger_event.victims}"), &c);
        assert_eq!(resolved, json!(["a", "b"]));
    }

    #[test]
    fn step_results_resolve_by_id_and_path() {
        let trigger = json!({});
        let vars = json!({});
        let results = json!({"fetch": {"status": 200, "body": {"ok": true}}});
        let meta = json!({});
        let c = ctx(&trigger, &vars, &results, &meta);
        assert_eq!(
            interpolate_string("code=${step_results.fetch.status}", &c),
            "code=200"
        );
        assert_eq!(
            interpolate_value(&json!("${step_results.fetch.body.ok}"), &c),
            json!(true)
        );
    }

    #[test]
    fn unresolvable_references_become_empty() {
        let trigger = json!({});
        let vars = json!({});
        let results = json!({});
        let meta = json!({});
        let c = ctx(&trigger, &vars, &results, &meta);
        assert_eq!(interpolate_string("x${variables.absent}y", &c), "xy");
        assert_eq!(interpolate_string("${nonsense.path}", &c), "");
    }

    #[test]
    fn nested_config_trees_interpolate_recursively() {
        let trigger = json!({"name": "Bob"});
        let vars = json!({"n": 2});
        let results = json!({});
        let meta = json!({});
        let c = ctx(&trigger, &vars, &results, &meta);
        let config = json!({
            "message": "hi ${trigger_event.name}",
            "nested": {"count": "${variables.n}"},
            "list": ["${trigger_event.name}", "literal"]
        });
        let out = interpolate_value(&config, &c);
        assert_eq!(out["message"], "hi Bob");
        assert_eq!(out["nested"]["count"], json!(2));
        assert_eq!(out["list"], json!(["Bob", "literal"]));
    }
}
