//! Expression evaluation against a Crucible.
//!
//! Evaluation returns `Result<Value, Flow>`: ordinary failures are burns,
//! and a host callable may raise a signal mid-expression, which suspends the
//! current line.  Membership operators follow the found-value convention:
//! `x in y` yields `x` (or `none`), not a boolean, so scripts test the
//! result with truthiness.

use crate::ast::{BinOp, Expr, Fragment, Seg, UnaryOp};
use crate::crucible::Crucible;
use crate::error::Burn;
use crate::signal::Flow;
use crate::value::{Map, Value};

/// Everything an expression needs to evaluate.
pub(crate) struct EvalCtx<'a> {
    pub env: &'a mut Crucible,
    pub consts: &'a [Value],
}

pub(crate) fn eval(expr: &Expr, ctx: &mut EvalCtx<'_>) -> Result<Value, Flow> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),

        Expr::Const(index) => Ok(ctx
            .consts
            .get(*index)
            .cloned()
            .ok_or_else(|| Burn::fatal(format!("constant pool index {index} out of range")))?),

        Expr::Interp(fragments) => {
            let mut out = String::new();
            for fragment in fragments {
                match fragment {
                    Fragment::Lit(text) => out.push_str(text),
                    Fragment::Var(name) => {
                        let value = ctx
                            .env
                            .get(name)
                            .ok_or_else(|| Burn::fatal(format!("variable '{name}' not found")))?;
                        out.push_str(&value.coerce_str());
                    }
                }
            }
            Ok(Value::Str(out))
        }

        Expr::Path(segs) => eval_path(segs, ctx),

        Expr::Indirect(inner) => {
            let value = eval(inner, ctx)?;
            let name = indirect_name(&value)?;
            ctx.env
                .get(&name)
                .ok_or_else(|| Burn::fatal(format!("indirect target '{name}' not found")).into())
        }

        Expr::Unary(op, inner) => {
            let value = eval(inner, ctx)?;
            Ok(match op {
                UnaryOp::Not => Value::Bool(!value.truthy()),
                UnaryOp::Neg => match value.as_num() {
                    Some(n) => Value::Num(-n),
                    None => {
                        return Err(Burn::fatal(format!(
                            "cannot negate a {}",
                            value.type_name()
                        ))
                        .into())
                    }
                },
            })
        }

        Expr::Binary(op, lhs, rhs) => {
            // Short-circuit forms first.
            match op {
                BinOp::And => {
                    let left = eval(lhs, ctx)?;
                    if !left.truthy() {
                        return Ok(Value::Bool(false));
                    }
                    let right = eval(rhs, ctx)?;
                    return Ok(Value::Bool(right.truthy()));
                }
                BinOp::Or => {
                    // `or` yields the first truthy operand, not a boolean.
                    let left = eval(lhs, ctx)?;
                    if left.truthy() {
                        return Ok(left);
                    }
                    let right = eval(rhs, ctx)?;
                    if right.truthy() {
                        return Ok(right);
                    }
                    return Ok(Value::None);
                }
                _ => {}
            }
            let left = eval(lhs, ctx)?;
            let right = eval(rhs, ctx)?;
            eval_binop(*op, left, right)
        }

        Expr::Call { callee, args } => {
            let callable = match eval(callee, ctx)? {
                Value::Callable(callable) => callable,
                other => {
                    return Err(Burn::fatal(format!(
                        "cannot call a {}",
                        other.type_name()
                    ))
                    .into())
                }
            };
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval(arg, ctx)?);
            }
            callable.invoke(ctx.env, &evaluated)
        }

        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, ctx)?);
            }
            Ok(Value::List(out))
        }

        Expr::Table(pairs) => {
            let mut map = Map::new();
            for (key, value) in pairs {
                map.insert(key.clone(), eval(value, ctx)?);
            }
            Ok(Value::Map(map))
        }
    }
}

/// Resolve a dot chain.  The first segment must name a variable; later
/// segments index into the value, yielding `none` when absent.  A callable
/// encountered mid-chain terminates the chain.
fn eval_path(segs: &[Seg], ctx: &mut EvalCtx<'_>) -> Result<Value, Flow> {
    let first = match segs.first() {
        Some(Seg::Name(name)) => name,
        _ => return Err(Burn::fatal("empty path").into()),
    };
    let mut current = ctx
        .env
        .get(first)
        .ok_or_else(|| Burn::fatal(format!("variable '{first}' not found")))?;
    for seg in &segs[1..] {
        if matches!(current, Value::Callable(_)) {
            return Ok(current);
        }
        current = match (&current, seg) {
            (Value::Map(map), Seg::Name(name)) => map.get(name).cloned().unwrap_or(Value::None),
            (Value::Map(map), Seg::Index(index)) => map
                .get(&index.to_string())
                .cloned()
                .unwrap_or(Value::None),
            (Value::List(items), Seg::Index(index)) => {
                items.get(*index).cloned().unwrap_or(Value::None)
            }
            _ => Value::None,
        };
    }
    Ok(current)
}

/// The name an indirect's inner value resolves to.
pub(crate) fn indirect_name(value: &Value) -> Result<String, Burn> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        Value::Num(_) => Ok(value.coerce_str()),
        other => Err(Burn::fatal(format!(
            "indirect expects a string or number, got {}",
            other.type_name()
        ))),
    }
}

fn eval_binop(op: BinOp, left: Value, right: Value) -> Result<Value, Flow> {
    use std::cmp::Ordering;
    let type_err = |verb: &str, l: &Value, r: &Value| {
        Flow::from(Burn::fatal(format!(
            "cannot {verb} {} and {}",
            l.type_name(),
            r.type_name()
        )))
    };
    Ok(match op {
        BinOp::Add => match (&left, &right) {
            (Value::Num(a), Value::Num(b)) => Value::Num(a + b),
            (Value::Str(a), Value::Str(b)) => Value::Str(format!("{a}{b}")),
            (Value::List(a), Value::List(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Value::List(out)
            }
            _ => return Err(type_err("add", &left, &right)),
        },
        BinOp::Sub => num_op(&left, &right, |a, b| Ok(a - b))?,
        BinOp::Mul => num_op(&left, &right, |a, b| Ok(a * b))?,
        BinOp::Div => num_op(&left, &right, |a, b| {
            if b == 0.0 {
                Err(Burn::fatal("division by zero"))
            } else {
                Ok(a / b)
            }
        })?,
        BinOp::IntDiv => num_op(&left, &right, |a, b| {
            if b == 0.0 {
                Err(Burn::fatal("division by zero"))
            } else {
                Ok((a / b).floor())
            }
        })?,
        BinOp::Rem => num_op(&left, &right, |a, b| {
            if b == 0.0 {
                Err(Burn::fatal("modulo by zero"))
            } else {
                Ok(a - b * (a / b).floor())
            }
        })?,

        BinOp::Eq => Value::Bool(left == right),
        BinOp::Ne => Value::Bool(left != right),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (&left, &right) {
                (Value::Num(a), Value::Num(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                _ => return Err(type_err("compare", &left, &right)),
            };
            Value::Bool(match op {
                BinOp::Lt => ordering == Ordering::Less,
                BinOp::Le => ordering != Ordering::Greater,
                BinOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }

        BinOp::In => match &right {
            Value::List(items) => {
                if items.contains(&left) {
                    left
                } else {
                    Value::None
                }
            }
            Value::Map(map) => {
                if map.contains_key(&left.coerce_str()) {
                    left
                } else {
                    Value::None
                }
            }
            Value::Str(haystack) => {
                if haystack.contains(&left.coerce_str()) {
                    left
                } else {
                    Value::None
                }
            }
            _ => return Err(type_err("search", &left, &right)),
        },

        BinOp::At => match &right {
            Value::List(items) => match items.iter().position(|item| *item == left) {
                Some(index) => Value::Num(index as f64),
                None => Value::None,
            },
            Value::Map(map) => {
                let found = map.iter().find(|(_, value)| **value == left);
                match found {
                    Some((key, _)) => Value::Str(key.clone()),
                    None => Value::None,
                }
            }
            Value::Str(haystack) => match haystack.find(&left.coerce_str()) {
                Some(index) => Value::Num(haystack[..index].chars().count() as f64),
                None => Value::None,
            },
            _ => return Err(type_err("locate in", &left, &right)),
        },

        BinOp::From => match &right {
            Value::List(items) => match left.as_num() {
                Some(index) if index >= 0.0 => {
                    items.get(index as usize).cloned().unwrap_or(Value::None)
                }
                _ => Value::None,
            },
            Value::Map(map) => {
                let key = left.coerce_str();
                match map.get(&key) {
                    Some(value) => value.clone(),
                    // `_` acts as the catch-all entry when present.
                    None => map.get("_").cloned().unwrap_or(Value::None),
                }
            }
            Value::Str(text) => match left.as_num() {
                Some(index) if index >= 0.0 => text
                    .chars()
                    .nth(index as usize)
                    .map(|c| Value::Str(c.to_string()))
                    .unwrap_or(Value::None),
                _ => Value::None,
            },
            _ => return Err(type_err("index", &left, &right)),
        },

        BinOp::And | BinOp::Or => unreachable!("short-circuited above"),
    })
}

fn num_op(
    left: &Value,
    right: &Value,
    op: impl FnOnce(f64, f64) -> Result<f64, Burn>,
) -> Result<Value, Flow> {
    match (left.as_num(), right.as_num()) {
        (Some(a), Some(b)) => Ok(Value::Num(op(a, b)?)),
        _ => Err(Burn::fatal(format!(
            "arithmetic needs numbers, got {} and {}",
            left.type_name(),
            right.type_name()
        ))
        .into()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::Callable;

    fn eval_in(env: &mut Crucible, expr: &Expr) -> Result<Value, Flow> {
        let mut ctx = EvalCtx { env, consts: &[] };
        eval(expr, &mut ctx)
    }

    fn num(n: f64) -> Expr {
        Expr::Literal(Value::Num(n))
    }

    fn text(s: &str) -> Expr {
        Expr::Literal(Value::Str(s.into()))
    }

    fn name(n: &str) -> Expr {
        Expr::Path(vec![Seg::Name(n.into())])
    }

    fn bin(op: BinOp, l: Expr, r: Expr) -> Expr {
        Expr::Binary(op, Box::new(l), Box::new(r))
    }

    #[test]
    fn arithmetic() {
        let mut env = Crucible::new();
        assert_eq!(
            eval_in(&mut env, &bin(BinOp::Add, num(2.0), num(3.0))).unwrap(),
            Value::Num(5.0)
        );
        assert_eq!(
            eval_in(&mut env, &bin(BinOp::IntDiv, num(7.0), num(2.0))).unwrap(),
            Value::Num(3.0)
        );
        assert_eq!(
            eval_in(&mut env, &bin(BinOp::Rem, num(7.0), num(3.0))).unwrap(),
            Value::Num(1.0)
        );
    }

    #[test]
    fn division_by_zero_burns() {
        let mut env = Crucible::new();
        assert!(matches!(
            eval_in(&mut env, &bin(BinOp::Div, num(1.0), num(0.0))),
            Err(Flow::Burn(_))
        ));
    }

    #[test]
    fn string_concat_and_type_errors() {
        let mut env = Crucible::new();
        assert_eq!(
            eval_in(&mut env, &bin(BinOp::Add, text("ab"), text("cd"))).unwrap(),
            Value::Str("abcd".into())
        );
        assert!(eval_in(&mut env, &bin(BinOp::Add, text("ab"), num(1.0))).is_err());
    }

    #[test]
    fn or_yields_first_truthy_value() {
        let mut env = Crucible::new();
        assert_eq!(
            eval_in(&mut env, &bin(BinOp::Or, num(0.0), text("fallback"))).unwrap(),
            Value::Str("fallback".into())
        );
        assert_eq!(
            eval_in(&mut env, &bin(BinOp::Or, num(0.0), text(""))).unwrap(),
            Value::None
        );
    }

    #[test]
    fn membership_in_returns_found_value() {
        let mut env = Crucible::new();
        env.set(
            "colors",
            Value::List(vec![Value::Str("red".into()), Value::Str("blue".into())]),
        )
        .unwrap();
        assert_eq!(
            eval_in(&mut env, &bin(BinOp::In, text("red"), name("colors"))).unwrap(),
            Value::Str("red".into())
        );
        assert_eq!(
            eval_in(&mut env, &bin(BinOp::In, text("green"), name("colors"))).unwrap(),
            Value::None
        );
    }

    #[test]
    fn membership_at_returns_position() {
        let mut env = Crucible::new();
        env.set(
            "colors",
            Value::List(vec![Value::Str("red".into()), Value::Str("blue".into())]),
        )
        .unwrap();
        assert_eq!(
            eval_in(&mut env, &bin(BinOp::At, text("blue"), name("colors"))).unwrap(),
            Value::Num(1.0)
        );
    }

    #[test]
    fn membership_from_indexes() {
        let mut env = Crucible::new();
        let mut map = Map::new();
        map.insert("q", Value::Str("quit".into()));
        map.insert("_", Value::Str("invalid".into()));
        env.set("menu", Value::Map(map)).unwrap();
        assert_eq!(
            eval_in(&mut env, &bin(BinOp::From, text("q"), name("menu"))).unwrap(),
            Value::Str("quit".into())
        );
        // `_` is the catch-all.
        assert_eq!(
            eval_in(&mut env, &bin(BinOp::From, text("zzz"), name("menu"))).unwrap(),
            Value::Str("invalid".into())
        );
    }

    #[test]
    fn missing_variable_burns() {
        let mut env = Crucible::new();
        assert!(eval_in(&mut env, &name("ghost")).is_err());
    }

    #[test]
    fn dot_chain_missing_key_is_none() {
        let mut env = Crucible::new();
        env.set("player.hp", Value::Num(10.0)).unwrap();
        let expr = Expr::Path(vec![Seg::Name("player".into()), Seg::Name("mp".into())]);
        assert_eq!(eval_in(&mut env, &expr).unwrap(), Value::None);
    }

    #[test]
    fn dot_chain_terminates_at_callable() {
        let mut env = Crucible::new();
        let callable = Callable::new("f", |_, _| Ok(Value::Num(1.0)));
        env.set("lib.f", Value::Callable(callable.clone())).unwrap();
        let expr = Expr::Path(vec![
            Seg::Name("lib".into()),
            Seg::Name("f".into()),
            Seg::Name("beyond".into()),
        ]);
        assert_eq!(eval_in(&mut env, &expr).unwrap(), Value::Callable(callable));
    }

    #[test]
    fn indirect_double_lookup() {
        let mut env = Crucible::new();
        env.set("key", Value::Str("real".into())).unwrap();
        env.set("real", Value::Num(7.0)).unwrap();
        let expr = Expr::Indirect(Box::new(name("key")));
        assert_eq!(eval_in(&mut env, &expr).unwrap(), Value::Num(7.0));
    }

    #[test]
    fn indirect_missing_target_burns() {
        let mut env = Crucible::new();
        env.set("key", Value::Str("ghost".into())).unwrap();
        let expr = Expr::Indirect(Box::new(name("key")));
        assert!(eval_in(&mut env, &expr).is_err());
    }

    #[test]
    fn call_passes_env_and_args() {
        let mut env = Crucible::new();
        let callable = Callable::new("sum2", |_env, args: &[Value]| {
            let a = args[0].as_num().unwrap_or(0.0);
            let b = args[1].as_num().unwrap_or(0.0);
            Ok(Value::Num(a + b))
        });
        env.set("sum2", Value::Callable(callable)).unwrap();
        let expr = Expr::Call {
            callee: Box::new(name("sum2")),
            args: vec![num(2.0), num(5.0)],
        };
        assert_eq!(eval_in(&mut env, &expr).unwrap(), Value::Num(7.0));
    }

    #[test]
    fn call_on_non_callable_burns() {
        let mut env = Crucible::new();
        env.set("x", Value::Num(1.0)).unwrap();
        let expr = Expr::Call {
            callee: Box::new(name("x")),
            args: vec![],
        };
        assert!(eval_in(&mut env, &expr).is_err());
    }

    #[test]
    fn interpolation_renders_none_as_empty() {
        let mut env = Crucible::new();
        env.set("who", Value::None).unwrap();
        let expr = Expr::Interp(vec![
            Fragment::Lit("hi ".into()),
            Fragment::Var("who".into()),
            Fragment::Lit("!".into()),
        ]);
        assert_eq!(eval_in(&mut env, &expr).unwrap(), Value::Str("hi !".into()));
    }

    #[test]
    fn not_follows_truthiness() {
        let mut env = Crucible::new();
        let expr = Expr::Unary(UnaryOp::Not, Box::new(Expr::Literal(Value::List(vec![]))));
        assert_eq!(eval_in(&mut env, &expr).unwrap(), Value::Bool(true));
    }
}
