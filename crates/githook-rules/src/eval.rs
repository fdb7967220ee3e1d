//! Null-safe evaluator over the normalized event JSON.

use serde_json::Value;

use crate::parser::{BinOp, Expr};

/// Result of evaluating a sub-expression.
///
/// `Null` doubles as "path missed": field access and indexing never
/// error, they produce `Null`, which every comparison handles totally.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Evaluated {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Json(Value),
}

impl Evaluated {
    fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n.as_f64().map_or(Self::Null, Self::Num),
            Value::String(s) => Self::Str(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    /// Truthiness for bare expressions: `null` false, numbers ≠ 0,
    /// strings non-empty, arrays/objects true.
    pub(crate) fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Num(n) => *n != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Json(_) => true,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Num(_) => "number",
            Self::Str(_) => "string",
            Self::Json(Value::Array(_)) => "array",
            Self::Json(_) => "object",
        }
    }
}

fn eq(lhs: &Evaluated, rhs: &Evaluated) -> bool {
    match (lhs, rhs) {
        (Evaluated::Null, Evaluated::Null) => true,
        (Evaluated::Bool(a), Evaluated::Bool(b)) => a == b,
        (Evaluated::Num(a), Evaluated::Num(b)) => a == b,
        (Evaluated::Str(a), Evaluated::Str(b)) => a == b,
        (Evaluated::Json(a), Evaluated::Json(b)) => a == b,
        _ => false,
    }
}

fn ordering(op: BinOp, lhs: &Evaluated, rhs: &Evaluated) -> Result<bool, String> {
    let cmp = match (lhs, rhs) {
        // Ordering against null is total and always false.
        (Evaluated::Null, _) | (_, Evaluated::Null) => return Ok(false),
        (Evaluated::Num(a), Evaluated::Num(b)) => a.partial_cmp(b),
        (Evaluated::Str(a), Evaluated::Str(b)) => Some(a.cmp(b)),
        _ => {
            return Err(format!(
                "cannot order {} against {}",
                lhs.type_name(),
                rhs.type_name()
            ));
        }
    };
    let Some(cmp) = cmp else {
        // NaN comparisons are false, not an error.
        return Ok(false);
    };
    Ok(match op {
        BinOp::Lt => cmp.is_lt(),
        BinOp::Le => cmp.is_le(),
        BinOp::Gt => cmp.is_gt(),
        BinOp::Ge => cmp.is_ge(),
        _ => unreachable!("ordering called with non-ordering op"),
    })
}

/// Evaluate `expr` against `event`.
pub(crate) fn evaluate(expr: &Expr, event: &Value) -> Result<Evaluated, String> {
    match expr {
        Expr::Str(s) => Ok(Evaluated::Str(s.clone())),
        Expr::Num(n) => Ok(Evaluated::Num(*n)),
        Expr::Bool(b) => Ok(Evaluated::Bool(*b)),
        Expr::Null => Ok(Evaluated::Null),
        Expr::Ident(name) => Ok(event
            .get(name)
            .map_or(Evaluated::Null, Evaluated::from_json)),
        Expr::Field(base, name) => {
            let base = evaluate(base, event)?;
            Ok(match base {
                Evaluated::Json(v) => v.get(name).map_or(Evaluated::Null, Evaluated::from_json),
                _ => Evaluated::Null,
            })
        }
        Expr::Index(base, index) => {
            let base = evaluate(base, event)?;
            Ok(match base {
                Evaluated::Json(v) => v.get(*index).map_or(Evaluated::Null, Evaluated::from_json),
                _ => Evaluated::Null,
            })
        }
        Expr::Not(inner) => Ok(Evaluated::Bool(!evaluate(inner, event)?.truthy())),
        Expr::Neg(inner) => match evaluate(inner, event)? {
            Evaluated::Num(n) => Ok(Evaluated::Num(-n)),
            Evaluated::Null => Ok(Evaluated::Null),
            other => Err(format!("cannot negate {}", other.type_name())),
        },
        Expr::Binary { op, lhs, rhs } => match op {
            BinOp::And => {
                // Short-circuit.
                if !evaluate(lhs, event)?.truthy() {
                    return Ok(Evaluated::Bool(false));
                }
                Ok(Evaluated::Bool(evaluate(rhs, event)?.truthy()))
            }
            BinOp::Or => {
                if evaluate(lhs, event)?.truthy() {
                    return Ok(Evaluated::Bool(true));
                }
                Ok(Evaluated::Bool(evaluate(rhs, event)?.truthy()))
            }
            BinOp::Eq => {
                let (l, r) = (evaluate(lhs, event)?, evaluate(rhs, event)?);
                Ok(Evaluated::Bool(eq(&l, &r)))
            }
            BinOp::Ne => {
                let (l, r) = (evaluate(lhs, event)?, evaluate(rhs, event)?);
                Ok(Evaluated::Bool(!eq(&l, &r)))
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let (l, r) = (evaluate(lhs, event)?, evaluate(rhs, event)?);
                ordering(*op, &l, &r).map(Evaluated::Bool)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use serde_json::json;

    fn eval(src: &str, event: &Value) -> Result<bool, String> {
        let expr = parser::parse(src).map_err(|e| e.to_string())?;
        evaluate(&expr, event).map(|v| v.truthy())
    }

    #[test]
    fn literal_comparisons() {
        let e = json!({});
        assert!(eval("1 < 2", &e).unwrap());
        assert!(eval("2 <= 2", &e).unwrap());
        assert!(eval("\"a\" < \"b\"", &e).unwrap());
        assert!(eval("\"x\" == 'x'", &e).unwrap());
        assert!(!eval("true == 1", &e).unwrap());
        assert!(eval("null == null", &e).unwrap());
    }

    #[test]
    fn field_access_and_missing_paths() {
        let e = json!({"pull_request": {"draft": false, "number": 7}});
        assert!(eval("pull_request.draft == false", &e).unwrap());
        assert!(eval("pull_request.number > 5", &e).unwrap());
        // Missing segments are null; null ordering is false.
        assert!(!eval("pull_request.missing.deeper > 5", &e).unwrap());
        assert!(eval("pull_request.missing == null", &e).unwrap());
        assert!(eval("nothing.at.all == null", &e).unwrap());
    }

    #[test]
    fn indexing() {
        let e = json!({"commits": [{"id": "a"}, {"id": "b"}]});
        assert!(eval("commits[0].id == \"a\"", &e).unwrap());
        assert!(eval("commits[1] != null", &e).unwrap());
        assert!(eval("commits[2] == null", &e).unwrap());
        // Indexing a non-array is null, not an error.
        assert!(eval("commits[0].id[3] == null", &e).unwrap());
    }

    #[test]
    fn short_circuit_skips_rhs_errors() {
        // The rhs would error (ordering bool vs string); && short-circuits.
        let e = json!({"flag": false, "obj": {}});
        assert!(!eval("flag && obj < \"x\"", &e).unwrap());
        assert!(eval("obj < \"x\"", &e).is_err());
    }

    #[test]
    fn truthiness() {
        let e = json!({"s": "x", "empty": "", "n": 0, "arr": [], "obj": {"k": 1}});
        assert!(eval("s", &e).unwrap());
        assert!(!eval("empty", &e).unwrap());
        assert!(!eval("n", &e).unwrap());
        assert!(eval("arr", &e).unwrap());
        assert!(eval("obj", &e).unwrap());
        assert!(!eval("missing", &e).unwrap());
        assert!(eval("!missing", &e).unwrap());
    }

    #[test]
    fn negation() {
        let e = json!({"n": 3});
        assert!(eval("-n < 0", &e).unwrap());
        assert!(eval("-missing == null", &e).unwrap());
        assert!(eval("-\"x\" == 1", &e).is_err());
    }
}
