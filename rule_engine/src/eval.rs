// Expression evaluation against working-memory facts.

use std::cmp::Ordering;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::fact::Fact;
use crate::value::Value;

/// Evaluates `expr`. `this` is the fact under the enclosing pattern (absent
/// inside actions); `resolve` maps a binding name to its matched fact.
pub(crate) fn eval<'a>(
    expr: &Expr,
    this: Option<&'a Fact>,
    resolve: &dyn Fn(&str) -> Option<&'a Fact>,
) -> Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Field { name, .. } => match this {
            Some(fact) => Ok(fact.field_or_null(name)),
            None => Err(format!("field '{}' used outside a pattern", name)),
        },
        Expr::Var { name, .. } => Err(format!("binding ${} cannot be used as a value", name)),
        Expr::VarField { var, field, .. } => match resolve(var) {
            Some(fact) => Ok(fact.field_or_null(field)),
            None => Err(format!("binding ${} is not bound", var)),
        },
        Expr::Unary(UnaryOp::Not, inner) => match eval(inner, this, resolve)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(format!("'!' expects a boolean, found {}", other.type_name())),
        },
        Expr::Unary(UnaryOp::Neg, inner) => eval(inner, this, resolve)?.negate(),
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            if !truthy(eval(lhs, this, resolve)?, "&&")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(eval(rhs, this, resolve)?, "&&")?))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            if truthy(eval(lhs, this, resolve)?, "||")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(eval(rhs, this, resolve)?, "||")?))
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = eval(lhs, this, resolve)?;
            let r = eval(rhs, this, resolve)?;
            match op {
                BinaryOp::Eq => Ok(Value::Bool(l.loose_eq(&r))),
                BinaryOp::Ne => Ok(Value::Bool(!l.loose_eq(&r))),
                BinaryOp::Lt => Ok(Value::Bool(l.compare(&r) == Some(Ordering::Less))),
                BinaryOp::Le => Ok(Value::Bool(matches!(
                    l.compare(&r),
                    Some(Ordering::Less | Ordering::Equal)
                ))),
                BinaryOp::Gt => Ok(Value::Bool(l.compare(&r) == Some(Ordering::Greater))),
                BinaryOp::Ge => Ok(Value::Bool(matches!(
                    l.compare(&r),
                    Some(Ordering::Greater | Ordering::Equal)
                ))),
                BinaryOp::Add => l.add(&r),
                BinaryOp::Sub => l.sub(&r),
                BinaryOp::Mul => l.mul(&r),
                BinaryOp::Div => l.div(&r),
                BinaryOp::Rem => l.rem(&r),
                BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
            }
        }
    }
}

/// Evaluates a pattern constraint; it must produce a boolean.
pub(crate) fn satisfies<'a>(
    expr: &Expr,
    this: &'a Fact,
    resolve: &dyn Fn(&str) -> Option<&'a Fact>,
) -> Result<bool, String> {
    truthy(eval(expr, Some(this), resolve)?, "a constraint")
}

fn truthy(value: Value, context: &str) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(format!("{} expects a boolean, found {}", context, other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn constraint(src: &str) -> Expr {
        let (file, errors) = parse(&format!("rule r when T( {} ) then end", src));
        assert!(errors.is_empty(), "{:?}", errors);
        file.rules[0].patterns[0].constraints[0].clone()
    }

    fn no_bindings<'a>(_: &str) -> Option<&'a Fact> {
        None
    }

    #[test]
    fn test_field_comparison_with_promotion() {
        let order = Fact::new("Order").with_field("price", 10i64);
        assert!(satisfies(&constraint("price > 5.5"), &order, &no_bindings).unwrap());
        assert!(satisfies(&constraint("price == 10.0"), &order, &no_bindings).unwrap());
        assert!(!satisfies(&constraint("price < 3"), &order, &no_bindings).unwrap());
    }

    #[test]
    fn test_missing_field_compares_false() {
        let order = Fact::new("Order");
        assert!(!satisfies(&constraint("price > 5"), &order, &no_bindings).unwrap());
        assert!(satisfies(&constraint("price == null"), &order, &no_bindings).unwrap());
    }

    #[test]
    fn test_short_circuit_skips_type_errors() {
        let order = Fact::new("Order").with_field("open", false);
        assert!(!satisfies(&constraint("open && price / 0 > 1"), &order, &no_bindings).unwrap());
    }

    #[test]
    fn test_non_boolean_constraint_is_an_error() {
        let order = Fact::new("Order").with_field("price", 1i64);
        let err = satisfies(&constraint("price + 1"), &order, &no_bindings).unwrap_err();
        assert!(err.contains("expects a boolean"));
    }

    #[test]
    fn test_binding_field_lookup() {
        let customer = Fact::new("Customer").with_field("id", 7i64);
        let order = Fact::new("Order").with_field("customerId", 7i64);
        let resolve = |name: &str| if name == "c" { Some(&customer) } else { None };
        assert!(satisfies(&constraint("customerId == $c.id"), &order, &resolve).unwrap());
    }

    #[test]
    fn test_field_outside_pattern_is_an_error() {
        let expr = constraint("price");
        assert!(eval(&expr, None, &no_bindings).is_err());
    }
}
