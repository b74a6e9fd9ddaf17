//! Expression evaluation
//!
//! Plan expressions are compiled once per execution, resolving function
//! names against the registry, and then evaluated against the current row
//! and the bind variables. Evaluation is pure.

use shardql_plan::{ArithOp, Expr, Row, Value, VarRef};
use shardql_registry::{FunctionRegistry, ScalarFunction};

use crate::bind::BindVariables;
use crate::error::{QueryError, Result};

#[derive(Debug, Clone)]
pub(crate) enum CompiledExpr {
    Const(Value),
    BindVar(VarRef),
    Field {
        input: Option<Box<CompiledExpr>>,
        name: String,
    },
    Arith {
        op: ArithOp,
        left: Box<CompiledExpr>,
        right: Box<CompiledExpr>,
    },
    Neg(Box<CompiledExpr>),
    Function {
        func: ScalarFunction,
        args: Vec<CompiledExpr>,
    },
}

impl CompiledExpr {
    pub fn compile(expr: &Expr, registry: &FunctionRegistry) -> Result<Self> {
        Ok(match expr {
            Expr::Const { value } => CompiledExpr::Const(value.clone()),
            Expr::BindVar { var } => CompiledExpr::BindVar(var.clone()),
            Expr::Field { input, name } => CompiledExpr::Field {
                input: match input {
                    Some(input) => Some(Box::new(Self::compile(input, registry)?)),
                    None => None,
                },
                name: name.clone(),
            },
            Expr::Arith { op, left, right } => CompiledExpr::Arith {
                op: *op,
                left: Box::new(Self::compile(left, registry)?),
                right: Box::new(Self::compile(right, registry)?),
            },
            Expr::Neg { operand } => CompiledExpr::Neg(Box::new(Self::compile(operand, registry)?)),
            Expr::Function { name, args } => CompiledExpr::Function {
                func: registry.scalar(name, args.len())?,
                args: args
                    .iter()
                    .map(|arg| Self::compile(arg, registry))
                    .collect::<Result<_>>()?,
            },
        })
    }

    pub fn eval(&self, row: &Row, bindings: &BindVariables) -> Result<Value> {
        match self {
            CompiledExpr::Const(value) => Ok(value.clone()),
            CompiledExpr::BindVar(var) => bindings.resolve(var).cloned(),
            CompiledExpr::Field { input: None, name } => Ok(row.get_or_null(name).clone()),
            CompiledExpr::Field {
                input: Some(input),
                name,
            } => Ok(field_step(input.eval(row, bindings)?, name)),
            CompiledExpr::Arith { op, left, right } => {
                arith(*op, left.eval(row, bindings)?, right.eval(row, bindings)?)
            }
            CompiledExpr::Neg(operand) => match operand.eval(row, bindings)? {
                Value::Null => Ok(Value::Null),
                Value::Int(i) => Ok(i
                    .checked_neg()
                    .map(Value::Int)
                    .unwrap_or_else(|| Value::Double(-(i as f64)))),
                Value::Double(d) => Ok(Value::Double(-d)),
                other => Err(QueryError::IllegalArgument(format!(
                    "cannot negate a {} value",
                    other.type_name()
                ))),
            },
            CompiledExpr::Function { func, args } => {
                let values = args
                    .iter()
                    .map(|arg| arg.eval(row, bindings))
                    .collect::<Result<Vec<_>>>()?;
                Ok(func.eval(&values)?)
            }
        }
    }
}

fn field_step(value: Value, name: &str) -> Value {
    match value {
        Value::Map(mut fields) => fields.remove(name).unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Map(mut fields) => fields.remove(name),
                    _ => None,
                })
                .collect(),
        ),
        _ => Value::Null,
    }
}

fn arith(op: ArithOp, left: Value, right: Value) -> Result<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }

    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            let checked = match op {
                ArithOp::Add => a.checked_add(b),
                ArithOp::Sub => a.checked_sub(b),
                ArithOp::Mul => a.checked_mul(b),
                ArithOp::Div => {
                    if b == 0 {
                        return Err(QueryError::IllegalArgument("division by zero".to_string()));
                    }
                    a.checked_div(b)
                }
            };
            // Overflow widens to double rather than failing the query.
            Ok(checked
                .map(Value::Int)
                .unwrap_or_else(|| Value::Double(float_op(op, a as f64, b as f64))))
        }
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Double(float_op(op, a, b))),
            _ => Err(QueryError::IllegalArgument(format!(
                "arithmetic on {} and {} values",
                left.type_name(),
                right.type_name()
            ))),
        },
    }
}

fn float_op(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
    }
}
