//! The script interpreter and its host-call boundary.

use super::parser::{parse, BinaryOp, Expr, Stmt, UnaryOp};
use crate::error::WorkflowError;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Default statement/expression budget per script run.
pub const DEFAULT_STATEMENT_BUDGET: u32 = 10_000;

/// Read-only context trees a script can address by name.
#[derive(Debug, Clone, Copy)]
pub struct ScriptViews<'a> {
    pub trigger_event: &'a Value,
    pub metadata: &'a Value,
    pub variables: &'a Value,
    pub step_results: &'a Value,
}

/// The closed vocabulary of host functions a script may call.
///
/// This is the entire outside world as seen from a script: logging,
/// workflow-variable access, and the restricted console set. Anything not
/// here does not exist.
#[async_trait::async_trait]
pub trait ScriptHost: Send + Sync {
    async fn log(&self, level: &str, message: &str);
    fn get_variable(&self, name: &str) -> Value;
    fn set_variable(&self, name: &str, value: Value);
    async fn rcon_execute(&self, command: &str) -> Result<Value, WorkflowError>;
    async fn kick_player(&self, player: &str, reason: &str) -> Result<(), WorkflowError>;
    async fn ban_player(
        &self,
        player: &str,
        interval: &str,
        reason: &str,
    ) -> Result<(), WorkflowError>;
    async fn warn_player(&self, player: &str, message: &str) -> Result<(), WorkflowError>;
    async fn broadcast(&self, message: &str) -> Result<(), WorkflowError>;
    async fn chat_message(&self, player: &str, message: &str) -> Result<(), WorkflowError>;
}

/// Parses and runs a script, returning the `result` table.
///
/// The statement budget bounds total work; the caller is expected to wrap
/// this future in a wall-clock timeout as well (the engine does).
pub async fn run_script(
    source: &str,
    views: ScriptViews<'_>,
    host: &dyn ScriptHost,
    budget: u32,
) -> Result<Map<String, Value>, WorkflowError> {
    let program = parse(source)?;
    let mut interp = Interpreter {
        views,
        host,
        locals: HashMap::new(),
        result: Map::new(),
        budget,
    };
    interp.run_block(&program).await?;
    Ok(interp.result)
}

struct Interpreter<'a> {
    views: ScriptViews<'a>,
    host: &'a dyn ScriptHost,
    locals: HashMap<String, Value>,
    result: Map<String, Value>,
    budget: u32,
}

impl<'a> Interpreter<'a> {
    fn spend(&mut self) -> Result<(), WorkflowError> {
        if self.budget == 0 {
            return Err(WorkflowError::Script(
                "statement budget exhausted".to_string(),
            ));
        }
        self.budget -= 1;
        Ok(())
    }

    fn run_block<'b>(&'b mut self, body: &'b [Stmt]) -> BoxFuture<'b, Result<(), WorkflowError>> {
        Box::pin(async move {
            for stmt in body {
                self.spend()?;
                match stmt {
                    Stmt::Local(name, expr) => {
                        let value = self.eval(expr).await?;
                        self.locals.insert(name.clone(), value);
                    }
                    Stmt::Assign(path, expr) => {
                        let value = self.eval(expr).await?;
                        self.assign(path, value)?;
                    }
                    Stmt::ExprStmt(expr) => {
                        self.eval(expr).await?;
                    }
                    Stmt::If {
                        cond,
                        then_body,
                        else_body,
                    } => {
                        let test = self.eval(cond).await?;
                        if truthy(&test) {
                            self.run_block(then_body).await?;
                        } else {
                            self.run_block(else_body).await?;
                        }
                    }
                }
            }
            Ok(())
        })
    }

    fn assign(&mut self, path: &[String], value: Value) -> Result<(), WorkflowError> {
        match path {
            [name] => {
                if self.locals.contains_key(name) {
                    self.locals.insert(name.clone(), value);
                    Ok(())
                } else {
                    Err(WorkflowError::Script(format!(
                        "assignment to undeclared name '{name}' (use 'local' or 'result.')"
                    )))
                }
            }
            [root, rest @ ..] if root == "result" && !rest.is_empty() => {
                let mut target = &mut self.result;
                for segment in &rest[..rest.len() - 1] {
                    let entry = target
                        .entry(segment.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    target = entry.as_object_mut().ok_or_else(|| {
                        WorkflowError::Script(format!(
                            "result.{segment} is not a table and cannot be indexed"
                        ))
                    })?;
                }
                let leaf = rest[rest.len() - 1].clone();
                target.insert(leaf, value);
                Ok(())
            }
            _ => Err(WorkflowError::Script(format!(
                "cannot assign to '{}'",
                path.join(".")
            ))),
        }
    }

    fn eval<'b>(&'b mut self, expr: &'b Expr) -> BoxFuture<'b, Result<Value, WorkflowError>> {
        Box::pin(async move {
            self.spend()?;
            match expr {
                Expr::Number(n) => Ok(Value::from(*n)),
                Expr::Str(s) => Ok(Value::String(s.clone())),
                Expr::Bool(b) => Ok(Value::Bool(*b)),
                Expr::Nil => Ok(Value::Null),
                Expr::Path(path) => Ok(self.resolve_path(path)),
                Expr::Unary(op, inner) => {
                    let value = self.eval(inner).await?;
                    match op {
                        UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                        UnaryOp::Neg => {
                            let n = number(&value).ok_or_else(|| {
                                WorkflowError::Script("cannot negate a non-number".to_string())
                            })?;
                            Ok(Value::from(-n))
                        }
                    }
                }
                Expr::Binary(op, left, right) => self.binary(*op, left, right).await,
                Expr::Call(name, args) => self.call(name, args).await,
            }
        })
    }

    fn resolve_path(&self, path: &[String]) -> Value {
        let Some((root, rest)) = path.split_first() else {
            return Value::Null;
        };
        let base: Option<&Value> = if let Some(local) = self.locals.get(root) {
            Some(local)
        } else {
            match root.as_str() {
                "result" => {
                    let snapshot = Value::Object(self.result.clone());
                    let mut current = &snapshot;
                    for segment in rest {
                        match current.get(segment) {
                            Some(next) => current = next,
                            None => return Value::Null,
                        }
                    }
                    return current.clone();
                }
                "trigger_event" => Some(self.views.trigger_event),
                "metadata" => Some(self.views.metadata),
                "variables" => Some(self.views.variables),
                "step_results" => Some(self.views.step_results),
                _ => None,
            }
        };
        let Some(mut current) = base else {
            return Value::Null;
        };
        for segment in rest {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Value::Null,
            }
        }
        current.clone()
    }

    async fn binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<Value, WorkflowError> {
        // Short-circuit logic first.
        match op {
            BinaryOp::And => {
                let l = self.eval(left).await?;
                if !truthy(&l) {
                    return Ok(l);
                }
                return self.eval(right).await;
            }
            BinaryOp::Or => {
                let l = self.eval(left).await?;
                if truthy(&l) {
                    return Ok(l);
                }
                return self.eval(right).await;
            }
            _ => {}
        }

        let l = self.eval(left).await?;
        let r = self.eval(right).await?;
        match op {
            BinaryOp::Concat => Ok(Value::String(format!("{}{}", text(&l), text(&r)))),
            BinaryOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
            BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(&l, &r))),
            BinaryOp::Less | BinaryOp::LessEq | BinaryOp::Greater | BinaryOp::GreaterEq => {
                let ordering = compare(&l, &r).ok_or_else(|| {
                    WorkflowError::Script("cannot compare these values".to_string())
                })?;
                Ok(Value::Bool(match op {
                    BinaryOp::Less => ordering.is_lt(),
                    BinaryOp::LessEq => ordering.is_le(),
                    BinaryOp::Greater => ordering.is_gt(),
                    _ => ordering.is_ge(),
                }))
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                let (a, b) = match (number(&l), number(&r)) {
                    (Some(a), Some(b)) => (a, b),
                    _ => {
                        return Err(WorkflowError::Script(
                            "arithmetic on non-numbers".to_string(),
                        ))
                    }
                };
                let out = match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    _ => a % b,
                };
                Ok(Value::from(out))
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    async fn call(&mut self, name: &str, args: &[Expr]) -> Result<Value, WorkflowError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg).await?);
        }
        let arg_text = |i: usize| values.get(i).map(text).unwrap_or_default();

        match name {
            "log" => {
                // log(message) or log(level, message)
                let (level, message) = if values.len() >= 2 {
                    (arg_text(0), arg_text(1))
                } else {
                    ("info".to_string(), arg_text(0))
                };
                self.host.log(&level, &message).await;
                Ok(Value::Null)
            }
            "get_variable" => Ok(self.host.get_variable(&arg_text(0))),
            "set_variable" => {
                let value = values.get(1).cloned().unwrap_or(Value::Null);
                self.host.set_variable(&arg_text(0), value);
                Ok(Value::Null)
            }
            "json_encode" => {
                let value = values.first().cloned().unwrap_or(Value::Null);
                serde_json::to_string(&value)
                    .map(Value::String)
                    .map_err(|e| WorkflowError::Script(format!("json_encode: {e}")))
            }
            "json_decode" => serde_json::from_str(&arg_text(0))
                .map_err(|e| WorkflowError::Script(format!("json_decode: {e}"))),
            "get" => {
                let value = values.first().cloned().unwrap_or(Value::Null);
                let path = arg_text(1);
                Ok(crate::condition::lookup_path(&value, &path)
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            "tostring" => Ok(Value::String(arg_text(0))),
            "rcon_execute" => self.host.rcon_execute(&arg_text(0)).await,
            "kick_player" => {
                self.host.kick_player(&arg_text(0), &arg_text(1)).await?;
                Ok(Value::Null)
            }
            "ban_player" => {
                self.host
                    .ban_player(&arg_text(0), &arg_text(1), &arg_text(2))
                    .await?;
                Ok(Value::Null)
            }
            "warn_player" => {
                self.host.warn_player(&arg_text(0), &arg_text(1)).await?;
                Ok(Value::Null)
            }
            "broadcast" => {
                self.host.broadcast(&arg_text(0)).await?;
                Ok(Value::Null)
            }
            "chat_message" => {
                self.host.chat_message(&arg_text(0), &arg_text(1)).await?;
                Ok(Value::Null)
            }
            other => Err(WorkflowError::Script(format!(
                "unknown function '{other}'"
            ))),
        }
    }
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "nil".to_string(),
        Value::Number(n) => {
            let f = n.as_f64().unwrap_or(0.0);
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", f as i64)
            } else {
                format!("{f}")
            }
        }
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    if l == r {
        return true;
    }
    match (number(l), number(r)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn compare(l: &Value, r: &Value) -> Option<std::cmp::Ordering> {
    match (l, r) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => {
            let (a, b) = (number(l)?, number(r)?);
            a.partial_cmp(&b)
        }
    }
}
