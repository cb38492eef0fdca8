//! Built-in `core` and `effect` operator namespaces.
//!
//! Arithmetic uses checked i64 operations; overflow is a `DomainError`
//! value and division or modulo by zero is `DivideByZero`. Every operator
//! returns an error value on a type-confused input instead of panicking.

use std::rc::Rc;

use crate::error::ErrorCode;
use crate::registry::{Operator, OperatorRegistry};
use crate::types::SpiralType;
use crate::value::Value;

fn type_error(op: &str, expected: &str, got: &Value) -> Value {
    Value::error_msg(
        ErrorCode::Type,
        format!("core:{op} expects {expected} arguments, got {}", got.type_name()),
    )
}

fn int2(op: &'static str, f: fn(i64, i64) -> Value) -> Operator {
    Operator {
        ns: "core".into(),
        name: op.into(),
        params: vec![SpiralType::Int, SpiralType::Int],
        returns: SpiralType::Int,
        pure: true,
        run: Rc::new(move |args| match (&args[0], &args[1]) {
            (Value::Int(a), Value::Int(b)) => f(*a, *b),
            (Value::Int(_), other) | (other, _) => type_error(op, "int", other),
        }),
    }
}

fn int_cmp(op: &'static str, f: fn(i64, i64) -> bool) -> Operator {
    Operator {
        ns: "core".into(),
        name: op.into(),
        params: vec![SpiralType::Int, SpiralType::Int],
        returns: SpiralType::Bool,
        pure: true,
        run: Rc::new(move |args| match (&args[0], &args[1]) {
            (Value::Int(a), Value::Int(b)) => Value::Bool(f(*a, *b)),
            (Value::Int(_), other) | (other, _) => type_error(op, "int", other),
        }),
    }
}

fn bool2(op: &'static str, f: fn(bool, bool) -> bool) -> Operator {
    Operator {
        ns: "core".into(),
        name: op.into(),
        params: vec![SpiralType::Bool, SpiralType::Bool],
        returns: SpiralType::Bool,
        pure: true,
        run: Rc::new(move |args| match (&args[0], &args[1]) {
            (Value::Bool(a), Value::Bool(b)) => Value::Bool(f(*a, *b)),
            (Value::Bool(_), other) | (other, _) => type_error(op, "bool", other),
        }),
    }
}

fn checked(op: &'static str, r: Option<i64>) -> Value {
    match r {
        Some(v) => Value::Int(v),
        None => Value::error_msg(ErrorCode::Domain, format!("core:{op}: integer overflow")),
    }
}

/// Builds the registry with the built-in `core` and `effect` namespaces.
pub fn registry() -> OperatorRegistry {
    let mut reg = OperatorRegistry::new();

    // -- arithmetic --
    reg.register(int2("add", |a, b| checked("add", a.checked_add(b))));
    reg.register(int2("sub", |a, b| checked("sub", a.checked_sub(b))));
    reg.register(int2("mul", |a, b| checked("mul", a.checked_mul(b))));
    reg.register(int2("div", |a, b| {
        if b == 0 {
            Value::error_msg(ErrorCode::DivideByZero, "core:div by zero")
        } else {
            checked("div", a.checked_div(b))
        }
    }));
    reg.register(int2("mod", |a, b| {
        if b == 0 {
            Value::error_msg(ErrorCode::DivideByZero, "core:mod by zero")
        } else {
            checked("mod", a.checked_rem(b))
        }
    }));
    reg.register(Operator {
        ns: "core".into(),
        name: "neg".into(),
        params: vec![SpiralType::Int],
        returns: SpiralType::Int,
        pure: true,
        run: Rc::new(|args| match &args[0] {
            Value::Int(a) => checked("neg", a.checked_neg()),
            other => type_error("neg", "int", other),
        }),
    });
    reg.register(Operator {
        ns: "core".into(),
        name: "abs".into(),
        params: vec![SpiralType::Int],
        returns: SpiralType::Int,
        pure: true,
        run: Rc::new(|args| match &args[0] {
            Value::Int(a) => checked("abs", a.checked_abs()),
            other => type_error("abs", "int", other),
        }),
    });

    // -- comparison --
    reg.register(int_cmp("eq", |a, b| a == b));
    reg.register(int_cmp("ne", |a, b| a != b));
    reg.register(int_cmp("lt", |a, b| a < b));
    reg.register(int_cmp("le", |a, b| a <= b));
    reg.register(int_cmp("gt", |a, b| a > b));
    reg.register(int_cmp("ge", |a, b| a >= b));

    // -- boolean algebra --
    reg.register(bool2("and", |a, b| a && b));
    reg.register(bool2("or", |a, b| a || b));
    reg.register(bool2("xor", |a, b| a ^ b));
    reg.register(Operator {
        ns: "core".into(),
        name: "not".into(),
        params: vec![SpiralType::Bool],
        returns: SpiralType::Bool,
        pure: true,
        run: Rc::new(|args| match &args[0] {
            Value::Bool(a) => Value::Bool(!a),
            other => type_error("not", "bool", other),
        }),
    });

    // -- strings --
    reg.register(Operator {
        ns: "core".into(),
        name: "concat".into(),
        params: vec![SpiralType::String, SpiralType::String],
        returns: SpiralType::String,
        pure: true,
        run: Rc::new(|args| match (&args[0], &args[1]) {
            (Value::Str(a), Value::Str(b)) => Value::Str(format!("{a}{b}")),
            (Value::Str(_), other) | (other, _) => type_error("concat", "string", other),
        }),
    });

    // -- effects --
    // `effect:log` accepts any value; the evaluator records it in the
    // effect log, so the implementation itself is a no-op returning void.
    reg.register(Operator {
        ns: "effect".into(),
        name: "log".into(),
        params: vec![SpiralType::opaque("any")],
        returns: SpiralType::Void,
        pure: false,
        run: Rc::new(|_args| Value::Void),
    });

    reg
}
