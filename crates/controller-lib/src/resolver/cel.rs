//! Common Expression Language resolver.
//!
//! Queries see the object bound to the identifier `o`. Every evaluation is
//! bounded twice: a static cost estimate over the parsed expression guards
//! against runaway queries before they run, and a wall-clock timeout races
//! the evaluation itself. The evaluator runs on its own thread and hands its
//! result back through a one-shot channel, so a timed-out query never leaks
//! into the caller.

use async_trait::async_trait;
use cel_interpreter::{Context, Program, Value as CelValue};
use cel_parser::{Expression, Member};
use tracing::{debug, warn};

use super::{sentinel, Bindings, Resolve, ResolverScope};
use crate::telemetry::CelOutcome;

pub struct CelResolver {
    scope: ResolverScope,
}

impl CelResolver {
    pub fn new(scope: ResolverScope) -> Self {
        Self { scope }
    }

    fn record(&self, outcome: CelOutcome) {
        if let Some(telemetry) = &self.scope.telemetry {
            telemetry.record_cel_evaluation(
                &self.scope.rmm_namespace,
                &self.scope.rmm_name,
                &self.scope.family,
                outcome,
            );
        }
    }
}

#[async_trait]
impl Resolve for CelResolver {
    async fn resolve(&self, expression: &str, object: &serde_json::Value) -> Bindings {
        // Static cost gate. One unit per expression node keeps the estimate
        // at or above the original's one-unit-per-call floor.
        match cel_parser::parse(expression) {
            Ok(parsed) => {
                let cost = estimate_cost(&parsed);
                if cost > self.scope.cel_cost_limit {
                    warn!(
                        query = expression,
                        cost,
                        limit = self.scope.cel_cost_limit,
                        "query exceeds the cost limit, ignoring resolution"
                    );
                    self.record(CelOutcome::Error);
                    return sentinel(expression);
                }
                debug!(query = expression, cost, "estimated query cost");
            }
            Err(err) => {
                debug!(query = expression, error = %err, "error parsing query, ignoring resolution");
                self.record(CelOutcome::Error);
                return sentinel(expression);
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        let query = expression.to_owned();
        let object = object.clone();
        std::thread::spawn(move || {
            let _ = tx.send(evaluate(&query, object));
        });

        let evaluated = match tokio::time::timeout(self.scope.cel_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => Err("evaluator terminated without a result".to_owned()),
            Err(_elapsed) => {
                warn!(
                    query = expression,
                    timeout = ?self.scope.cel_timeout,
                    "query timed out, ignoring resolution"
                );
                self.record(CelOutcome::Timeout);
                return sentinel(expression);
            }
        };

        match evaluated {
            Ok(value) => {
                let bindings = self.process_result(expression, value);
                self.record(CelOutcome::Success);
                bindings
            }
            Err(err) => {
                debug!(query = expression, error = %err, "ignoring resolution for query");
                self.record(CelOutcome::Error);
                sentinel(expression)
            }
        }
    }
}

impl CelResolver {
    fn process_result(&self, query: &str, value: CelValue) -> Bindings {
        match value {
            CelValue::Bool(_)
            | CelValue::Int(_)
            | CelValue::UInt(_)
            | CelValue::Float(_)
            | CelValue::String(_) => Bindings::from([(query.to_owned(), stringify(&value))]),
            CelValue::Null => Bindings::from([(query.to_owned(), "<nil>".to_owned())]),
            CelValue::Map(map) => {
                let mut out = Bindings::new();
                flatten_map(&map, &mut out);
                out
            }
            CelValue::List(items) => {
                // The last dotted component of the query names the list for
                // the `name#index` expansion convention.
                let parent = query.rsplit('.').next().unwrap_or(query);
                let mut out = Bindings::new();
                flatten_list(items.as_slice(), parent, &mut out);
                out
            }
            other => {
                debug!(query, output = ?other, "unsupported output type, ignoring resolution");
                sentinel(query)
            }
        }
    }
}

/// Compiles and runs a single query with the object bound to `o`.
fn evaluate(query: &str, object: serde_json::Value) -> Result<CelValue, String> {
    let program = Program::compile(query).map_err(|err| err.to_string())?;
    let value = cel_interpreter::to_value(object).map_err(|err| err.to_string())?;
    let mut context = Context::default();
    context.add_variable_from_value("o", value);

    program.execute(&context).map_err(|err| err.to_string())
}

fn stringify(value: &CelValue) -> String {
    match value {
        CelValue::Bool(b) => b.to_string(),
        CelValue::Int(i) => i.to_string(),
        CelValue::UInt(u) => u.to_string(),
        CelValue::Float(f) => f.to_string(),
        CelValue::String(s) => s.as_ref().clone(),
        CelValue::Null => "<nil>".to_owned(),
        other => format!("{other:?}"),
    }
}

fn is_scalar(value: &CelValue) -> bool {
    matches!(
        value,
        CelValue::Bool(_)
            | CelValue::Int(_)
            | CelValue::UInt(_)
            | CelValue::Float(_)
            | CelValue::String(_)
    )
}

/// Map entries flatten into their leaf keys; nested lists are indexed under
/// the key they hang off of.
fn flatten_map(map: &cel_interpreter::objects::Map, out: &mut Bindings) {
    for (key, value) in map.map.iter() {
        let key = match key {
            cel_interpreter::objects::Key::String(s) => s.as_ref().clone(),
            cel_interpreter::objects::Key::Int(i) => i.to_string(),
            cel_interpreter::objects::Key::Uint(u) => u.to_string(),
            cel_interpreter::objects::Key::Bool(b) => b.to_string(),
        };
        match value {
            v if is_scalar(v) => {
                out.insert(key, stringify(v));
            }
            CelValue::List(items) => flatten_list(items.as_slice(), &key, out),
            CelValue::Map(nested) => flatten_map(nested, out),
            other => {
                debug!(%key, value = ?other, "skipping composite map entry");
            }
        }
    }
}

fn flatten_list(items: &[CelValue], parent: &str, out: &mut Bindings) {
    for (index, value) in items.iter().enumerate() {
        match value {
            v if is_scalar(v) => {
                out.insert(format!("{parent}#{index}"), stringify(v));
            }
            CelValue::List(nested) => flatten_list(nested.as_slice(), parent, out),
            CelValue::Map(nested) => flatten_map(nested, out),
            other => {
                debug!(index, value = ?other, "skipping composite list element");
            }
        }
    }
}

/// Estimates the runtime cost of a parsed expression: one unit per node.
fn estimate_cost(expression: &Expression) -> u64 {
    1 + match expression {
        Expression::Arithmetic(lhs, _, rhs)
        | Expression::Relation(lhs, _, rhs)
        | Expression::Or(lhs, rhs)
        | Expression::And(lhs, rhs) => estimate_cost(lhs) + estimate_cost(rhs),
        Expression::Ternary(cond, left, right) => {
            estimate_cost(cond) + estimate_cost(left) + estimate_cost(right)
        }
        Expression::Unary(_, inner) => estimate_cost(inner),
        Expression::Member(inner, member) => estimate_cost(inner) + estimate_member_cost(member),
        Expression::FunctionCall(function, receiver, args) => {
            estimate_cost(function)
                + receiver.as_deref().map(estimate_cost).unwrap_or(0)
                + args.iter().map(estimate_cost).sum::<u64>()
        }
        Expression::List(items) => items.iter().map(estimate_cost).sum(),
        Expression::Map(entries) => entries
            .iter()
            .map(|(k, v)| estimate_cost(k) + estimate_cost(v))
            .sum(),
        Expression::Atom(_) | Expression::Ident(_) => 0,
    }
}

fn estimate_member_cost(member: &Member) -> u64 {
    match member {
        Member::Attribute(_) => 1,
        Member::Index(index) => 1 + estimate_cost(index),
        Member::Fields(fields) => {
            1 + fields
                .iter()
                .map(|(_, value)| estimate_cost(value))
                .sum::<u64>()
        }
    }
}
