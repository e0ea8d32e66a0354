//! Boolean/arithmetic expression model
//!
//! The AST the rule parser produces and the evaluator the engine runs
//! against the signal store. Evaluation is pure and total: unknown signals,
//! type mismatches, overflow and division by zero all yield `None`
//! ("undefined") instead of an error. An undefined result anywhere in an
//! expression makes the whole expression undefined.

pub mod parser;

use crate::store::SignalStore;
use crate::types::Value;
use std::collections::BTreeSet;

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Logical negation, boolean operand only
    Not,
    /// Arithmetic negation, numeric operand only
    Neg,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
    And,
    Or,
    Xor,
}

/// Expression AST node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant value
    Literal(Value),
    /// Reference to a signal by its full dotted name
    Signal(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Evaluate against the current signal state.
    ///
    /// Returns `None` ("undefined") when any referenced signal is unset or
    /// any operation is applied to operands it is not defined for.
    pub fn eval(&self, store: &SignalStore) -> Option<Value> {
        match self {
            Expr::Literal(v) => Some(v.clone()),
            Expr::Signal(name) => store.get(name).cloned(),
            Expr::Unary { op, operand } => apply_unary(*op, operand.eval(store)?),
            Expr::Binary { op, lhs, rhs } => {
                // no short-circuit: an undefined operand on either side makes
                // the whole expression undefined
                let l = lhs.eval(store)?;
                let r = rhs.eval(store)?;
                apply_binary(*op, l, r)
            }
        }
    }

    /// Collect the names of all signals this expression reads.
    ///
    /// The driver uses this to build the reverse index deciding which
    /// condition nodes must be re-evaluated when a signal changes.
    pub fn operands(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_operands(&mut out);
        out
    }

    fn collect_operands(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Signal(name) => {
                out.insert(name.clone());
            }
            Expr::Unary { operand, .. } => operand.collect_operands(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_operands(out);
                rhs.collect_operands(out);
            }
        }
    }
}

fn apply_unary(op: UnaryOp, v: Value) -> Option<Value> {
    match (op, v) {
        (UnaryOp::Not, Value::Boolean(b)) => Some(Value::Boolean(!b)),
        (UnaryOp::Neg, Value::Integer(i)) => i.checked_neg().map(Value::Integer),
        (UnaryOp::Neg, Value::Float(f)) => Some(Value::Float(-f)),
        _ => None,
    }
}

fn apply_binary(op: BinaryOp, lhs: Value, rhs: Value) -> Option<Value> {
    use BinaryOp::*;
    match op {
        Add | Sub | Mul | Div | Mod => arithmetic(op, lhs, rhs),
        Lt | Le | Ge | Gt => ordering(op, lhs, rhs),
        Eq | Ne => equality(op, lhs, rhs),
        And | Or | Xor => boolean(op, lhs, rhs),
    }
}

fn arithmetic(op: BinaryOp, lhs: Value, rhs: Value) -> Option<Value> {
    use BinaryOp::*;
    match (&lhs, &rhs) {
        // integer arithmetic stays integral; division truncates toward zero
        (Value::Integer(a), Value::Integer(b)) => match op {
            Add => a.checked_add(*b).map(Value::Integer),
            Sub => a.checked_sub(*b).map(Value::Integer),
            Mul => a.checked_mul(*b).map(Value::Integer),
            Div => a.checked_div(*b).map(Value::Integer),
            Mod => a.checked_rem(*b).map(Value::Integer),
            _ => None,
        },
        _ => {
            let a = lhs.as_f64()?;
            let b = rhs.as_f64()?;
            let result = match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Div if b != 0.0 => a / b,
                Mod if b != 0.0 => a % b,
                _ => return None,
            };
            Some(Value::Float(result))
        }
    }
}

fn ordering(op: BinaryOp, lhs: Value, rhs: Value) -> Option<Value> {
    // ordering is defined on numerics only; strings order is undefined
    let a = lhs.as_f64()?;
    let b = rhs.as_f64()?;
    let result = match op {
        BinaryOp::Lt => a < b,
        BinaryOp::Le => a <= b,
        BinaryOp::Ge => a >= b,
        BinaryOp::Gt => a > b,
        _ => return None,
    };
    Some(Value::Boolean(result))
}

fn equality(op: BinaryOp, lhs: Value, rhs: Value) -> Option<Value> {
    let equal = match (&lhs, &rhs) {
        (Value::Text(a), Value::Text(b)) => a == b,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        // numeric kinds compare after coercion to float
        _ => lhs.as_f64()? == rhs.as_f64()?,
    };
    match op {
        BinaryOp::Eq => Some(Value::Boolean(equal)),
        BinaryOp::Ne => Some(Value::Boolean(!equal)),
        _ => None,
    }
}

fn boolean(op: BinaryOp, lhs: Value, rhs: Value) -> Option<Value> {
    match (lhs, rhs) {
        (Value::Boolean(a), Value::Boolean(b)) => {
            let result = match op {
                BinaryOp::And => a && b,
                BinaryOp::Or => a || b,
                BinaryOp::Xor => a ^ b,
                _ => return None,
            };
            Some(Value::Boolean(result))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(pairs: &[(&str, Value)]) -> SignalStore {
        let mut store = SignalStore::new();
        for (name, value) in pairs {
            store.set(name, value.clone(), 0);
        }
        store
    }

    fn eval(text: &str, store: &SignalStore) -> Option<Value> {
        parser::parse(text).unwrap().eval(store)
    }

    #[test]
    fn test_integer_arithmetic() {
        let store = SignalStore::new();
        assert_eq!(eval("2 + 3 * 4", &store), Some(Value::Integer(14)));
        assert_eq!(eval("7 / 2", &store), Some(Value::Integer(3)));
        assert_eq!(eval("-7 / 2", &store), Some(Value::Integer(-3)));
        assert_eq!(eval("7 % 3", &store), Some(Value::Integer(1)));
    }

    #[test]
    fn test_division_by_zero_is_undefined() {
        let store = SignalStore::new();
        assert_eq!(eval("1 / 0", &store), None);
        assert_eq!(eval("1 % 0", &store), None);
        assert_eq!(eval("1.0 / 0.0", &store), None);
        // and the undefined result poisons the enclosing expression
        assert_eq!(eval("1 / 0 == 1 / 0", &store), None);
    }

    #[test]
    fn test_numeric_coercion() {
        let store = SignalStore::new();
        assert_eq!(eval("1 + 0.5", &store), Some(Value::Float(1.5)));
        assert_eq!(eval("2 == 2.0", &store), Some(Value::Boolean(true)));
        assert_eq!(eval("1 < 1.5", &store), Some(Value::Boolean(true)));
    }

    #[test]
    fn test_cross_kind_is_undefined() {
        let store = store_with(&[("gear", Value::Text("park".into()))]);
        assert_eq!(eval("gear == 1", &store), None);
        assert_eq!(eval("gear < 'reverse'", &store), None);
        assert_eq!(eval("gear && true", &store), None);
        assert_eq!(eval("-gear", &store), None);
    }

    #[test]
    fn test_string_equality() {
        let store = store_with(&[("gear", Value::Text("reverse".into()))]);
        assert_eq!(eval("gear == 'reverse'", &store), Some(Value::Boolean(true)));
        assert_eq!(eval("gear != 'park'", &store), Some(Value::Boolean(true)));
    }

    #[test]
    fn test_boolean_operators() {
        let store = store_with(&[
            ("a", Value::Boolean(true)),
            ("b", Value::Boolean(false)),
        ]);
        assert_eq!(eval("a && !b", &store), Some(Value::Boolean(true)));
        assert_eq!(eval("a ^^ b", &store), Some(Value::Boolean(true)));
        assert_eq!(eval("a ^^ a", &store), Some(Value::Boolean(false)));
        assert_eq!(eval("b || a", &store), Some(Value::Boolean(true)));
    }

    #[test]
    fn test_undefined_signal_poisons_and() {
        // no short-circuit: false && undefined is undefined, not false
        let store = store_with(&[("a", Value::Boolean(false))]);
        assert_eq!(eval("a && missing", &store), None);
    }

    #[test]
    fn test_operand_collection() {
        let expr = parser::parse("a.b + c * 2 > d || a.b == 1").unwrap();
        let names: Vec<String> = expr.operands().into_iter().collect();
        assert_eq!(names, vec!["a.b", "c", "d"]);
    }
}
