//! # Embedded Script Step
//!
//! A restricted, Lua-flavored scripting surface for workflow steps that need
//! more logic than declarative steps express. The language is deliberately
//! small:
//!
//! ```text
//! -- teamkill escalation
//! local count = get_variable("teamkill_count") + 1
//! set_variable("teamkill_count", count)
//! if count >= 3 then
//!     kick_player(trigger_event.attacker_name, "teamkilling")
//! else
//!     warn_player(trigger_event.attacker_name, "Teamkill warning " .. tostring(count))
//! end
//! result.count = count
//! ```
//!
//! Statements: `local` bindings, assignment, `if/else/end`, expression
//! statements. Expressions: literals, `..` concatenation, arithmetic,
//! comparisons, `and`/`or`/`not`, and calls from a **closed host
//! vocabulary** — logging, `get_variable`/`set_variable`, JSON
//! encode/decode, safe `get`/`tostring`, and the same restricted console
//! set offered to plugins (`rcon_execute`, `kick_player`, `ban_player`,
//! `warn_player`, `broadcast`, `chat_message`). There is no loop construct,
//! no function definition, no I/O beyond the host calls.
//!
//! Scripts observe read-only views of `trigger_event`, `metadata`,
//! `variables` and `step_results`, and write into a mutable `result` table
//! that becomes the step's result. A statement budget bounds runaway
//! scripts; the engine additionally applies a wall-clock cap.

mod interp;
mod lexer;
mod parser;

pub use interp::{run_script, ScriptHost, ScriptViews, DEFAULT_STATEMENT_BUDGET};
pub use parser::parse;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkflowError;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestHost {
        variables: Mutex<serde_json::Map<String, Value>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ScriptHost for TestHost {
        async fn log(&self, level: &str, message: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("log[{level}] {message}"));
        }

        fn get_variable(&self, name: &str) -> Value {
            self.variables
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or(Value::Null)
        }

        fn set_variable(&self, name: &str, value: Value) {
            self.variables.lock().unwrap().insert(name.to_string(), value);
        }

        async fn rcon_execute(&self, command: &str) -> Result<Value, WorkflowError> {
            self.calls.lock().unwrap().push(format!("rcon {command}"));
            Ok(json!("ok"))
        }

        async fn kick_player(&self, player: &str, reason: &str) -> Result<(), WorkflowError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("kick {player}: {reason}"));
            Ok(())
        }

        async fn ban_player(
            &self,
            player: &str,
            interval: &str,
            reason: &str,
        ) -> Result<(), WorkflowError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("ban {player} {interval}: {reason}"));
            Ok(())
        }

        async fn warn_player(&self, player: &str, message: &str) -> Result<(), WorkflowError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("warn {player}: {message}"));
            Ok(())
        }

        async fn broadcast(&self, message: &str) -> Result<(), WorkflowError> {
            self.calls.lock().unwrap().push(format!("broadcast {message}"));
            Ok(())
        }

        async fn chat_message(&self, player: &str, message: &str) -> Result<(), WorkflowError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("chat {player}: {message}"));
            Ok(())
        }
    }

    fn views<'a>(trigger: &'a Value, variables: &'a Value) -> ScriptViews<'a> {
        ScriptViews {
            trigger_event: trigger,
            metadata: &Value::Null,
            variables,
            step_results: &Value::Null,
        }
    }

    // Shared empty trees with 'static lifetime for simple tests.
    static NULL: Value = Value::Null;

    #[tokio::test]
    async fn arithmetic_locals_and_result_table() {
        let host = TestHost::default();
        let result = run_script(
            r#"
            -- simple math
            local a = 2 + 3 * 4
            local b = (2 + 3) * 4
            result.a = a
            result.b = b
            result.text = "n=" .. tostring(a)
            "#,
            views(&NULL, &NULL),
            &host,
            DEFAULT_STATEMENT_BUDGET,
        )
        .await
        .unwrap();
        assert_eq!(result["a"], json!(14.0));
        assert_eq!(result["b"], json!(20.0));
        assert_eq!(result["text"], json!("n=14"));
    }

    #[tokio::test]
    async fn context_views_are_readable() {
        let host = TestHost::default();
        let trigger = json!({"player_name": "Alice", "damage": 120.0});
        let variables = json!({"limit": 100});
        let result = run_script(
            r#"
            if trigger_event.damage > variables.limit then
                result.over = true
                result.who = trigger_event.player_name
            else
                result.over = false
            end
            "#,
            views(&trigger, &variables),
            &host,
            DEFAULT_STATEMENT_BUDGET,
        )
        .await
        .unwrap();
        assert_eq!(result["over"], json!(true));
        assert_eq!(result["who"], json!("Alice"));
    }

    #[tokio::test]
    async fn host_vocabulary_round_trips() {
        let host = TestHost::default();
        host.set_variable("count", json!(2));
        let trigger = json!({"attacker_name": "Bob"});
        let result = run_script(
            r#"
            local count = get_variable("count") + 1
            set_variable("count", count)
            if count >= 3 then
                kick_player(trigger_event.attacker_name, "enough")
            else
                warn_player(trigger_event.attacker_name, "strike " .. tostring(count))
            end
            log("info", "count now " .. tostring(count))
            result.count = count
            "#,
            views(&trigger, &NULL),
            &host,
            DEFAULT_STATEMENT_BUDGET,
        )
        .await
        .unwrap();
        assert_eq!(result["count"], json!(3.0));
        assert_eq!(host.get_variable("count"), json!(3.0));
        let calls = host.calls.lock().unwrap().clone();
        assert!(calls.contains(&"kick Bob: enough".to_string()));
    }

    #[tokio::test]
    async fn json_encode_decode_and_safe_get() {
        let host = TestHost::default();
        let result = run_script(
            r#"
            local decoded = json_decode("{\"a\": {\"b\": 7}}")
            result.b = get(decoded, "a.b")
            result.missing = get(decoded, "a.zzz")
            result.encoded = json_encode(decoded)
            "#,
            views(&NULL, &NULL),
            &host,
            DEFAULT_STATEMENT_BUDGET,
        )
        .await
        .unwrap();
        assert_eq!(result["b"], json!(7));
        assert_eq!(result["missing"], Value::Null);
        assert_eq!(result["encoded"], json!(r#"{"a":{"b":7}}"#));
    }

    #[tokio::test]
    async fn unknown_functions_are_rejected() {
        let host = TestHost::default();
        let err = run_script(
            "os_execute(\"rm -rf /\")",
            views(&NULL, &NULL),
            &host,
            DEFAULT_STATEMENT_BUDGET,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Script(_)));
        assert!(err.to_string().contains("os_execute"));
    }

    #[tokio::test]
    async fn statement_budget_stops_runaway_scripts() {
        let host = TestHost::default();
        // No loops exist, so exhaust the budget with sheer statement count.
        let body = "local x = 1\n".repeat(50);
        let err = run_script(&body, views(&NULL, &NULL), &host, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Script(_)));
    }

    #[tokio::test]
    async fn parse_errors_carry_line_information() {
        let host = TestHost::default();
        let err = run_script(
            "local = broken",
            views(&NULL, &NULL),
            &host,
            DEFAULT_STATEMENT_BUDGET,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[tokio::test]
    async fn truthiness_and_logic_operators() {
        let host = TestHost::default();
        let result = run_script(
            r#"
            result.a = nil == nil
            result.b = not nil
            result.c = false or "fallback"
            result.d = true and 5
            result.e = 1 ~= 2
            "#,
            views(&NULL, &NULL),
            &host,
            DEFAULT_STATEMENT_BUDGET,
        )
        .await
        .unwrap();
        assert_eq!(result["a"], json!(true));
        assert_eq!(result["b"], json!(true));
        assert_eq!(result["c"], json!("fallback"));
        assert_eq!(result["d"], json!(5.0));
        assert_eq!(result["e"], json!(true));
    }
}
