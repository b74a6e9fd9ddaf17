//! Built-in function registry
//!
//! Plans name functions by string. The engine resolves every name against
//! this registry when it instantiates a plan, so an unknown function is
//! reported before any row is produced.

use serde::{Deserialize, Serialize};
use shardql_plan::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function {func} expects {expected} argument(s), got {actual}")]
    ArityMismatch {
        func: String,
        expected: String,
        actual: usize,
    },

    #[error("Function {func} is not {expected}")]
    WrongKind { func: String, expected: &'static str },

    #[error("Invalid argument to {func}: {message}")]
    InvalidArgument { func: &'static str, message: String },
}

/// Row-level functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarFunction {
    Size,
    Length,
    Lower,
    Upper,
    Abs,
    Concat,
    Coalesce,
}

/// Functions folded over the rows of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Count,
    CountStar,
    Min,
    Max,
    Avg,
    Collect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "function", rename_all = "snake_case")]
pub enum FunctionKind {
    Scalar(ScalarFunction),
    Aggregate(AggregateFunction),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub name: String,
    pub min_args: usize,
    /// `None` for variadic functions
    pub max_args: Option<usize>,
    pub kind: FunctionKind,
}

impl FunctionSignature {
    fn accepts(&self, argc: usize) -> bool {
        argc >= self.min_args && self.max_args.map_or(true, |max| argc <= max)
    }

    fn arity(&self) -> String {
        match self.max_args {
            Some(max) if max == self.min_args => max.to_string(),
            Some(max) => format!("{}..={}", self.min_args, max),
            None => format!("at least {}", self.min_args),
        }
    }
}

pub struct FunctionRegistry {
    functions: HashMap<String, FunctionSignature>,
    version: String, // Semver for plan compatibility
}

impl FunctionRegistry {
    pub fn new(version: impl Into<String>) -> Self {
        let mut registry = Self {
            functions: HashMap::new(),
            version: version.into(),
        };
        registry.register_builtins();
        registry
    }

    fn register_builtins(&mut self) {
        for (name, func, min, max) in [
            ("size", ScalarFunction::Size, 1, Some(1)),
            ("length", ScalarFunction::Length, 1, Some(1)),
            ("lower", ScalarFunction::Lower, 1, Some(1)),
            ("upper", ScalarFunction::Upper, 1, Some(1)),
            ("abs", ScalarFunction::Abs, 1, Some(1)),
            ("concat", ScalarFunction::Concat, 1, None),
            ("coalesce", ScalarFunction::Coalesce, 1, None),
        ] {
            self.register(FunctionSignature {
                name: name.to_string(),
                min_args: min,
                max_args: max,
                kind: FunctionKind::Scalar(func),
            });
        }

        for (name, func, argc) in [
            ("sum", AggregateFunction::Sum, 1),
            ("count", AggregateFunction::Count, 1),
            ("count_star", AggregateFunction::CountStar, 0),
            ("min", AggregateFunction::Min, 1),
            ("max", AggregateFunction::Max, 1),
            ("avg", AggregateFunction::Avg, 1),
            ("collect", AggregateFunction::Collect, 1),
        ] {
            self.register(FunctionSignature {
                name: name.to_string(),
                min_args: argc,
                max_args: Some(argc),
                kind: FunctionKind::Aggregate(func),
            });
        }
    }

    pub fn register(&mut self, sig: FunctionSignature) {
        self.functions.insert(sig.name.to_lowercase(), sig);
    }

    /// Resolve a function by name (case-insensitive) and argument count.
    pub fn lookup(&self, name: &str, argc: usize) -> Result<&FunctionSignature, RegistryError> {
        let sig = self
            .functions
            .get(&name.to_lowercase())
            .ok_or_else(|| RegistryError::FunctionNotFound(name.to_string()))?;

        if !sig.accepts(argc) {
            return Err(RegistryError::ArityMismatch {
                func: sig.name.clone(),
                expected: sig.arity(),
                actual: argc,
            });
        }
        Ok(sig)
    }

    pub fn scalar(&self, name: &str, argc: usize) -> Result<ScalarFunction, RegistryError> {
        match self.lookup(name, argc)?.kind {
            FunctionKind::Scalar(func) => Ok(func),
            FunctionKind::Aggregate(_) => Err(RegistryError::WrongKind {
                func: name.to_string(),
                expected: "a scalar function",
            }),
        }
    }

    pub fn aggregate(&self, name: &str, argc: usize) -> Result<AggregateFunction, RegistryError> {
        match self.lookup(name, argc)?.kind {
            FunctionKind::Aggregate(func) => Ok(func),
            FunctionKind::Scalar(_) => Err(RegistryError::WrongKind {
                func: name.to_string(),
                expected: "an aggregate function",
            }),
        }
    }

    /// All registered signatures, sorted by name
    pub fn signatures(&self) -> Vec<&FunctionSignature> {
        let mut sigs: Vec<_> = self.functions.values().collect();
        sigs.sort_by(|a, b| a.name.cmp(&b.name));
        sigs
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new("0.1.0")
    }
}

impl ScalarFunction {
    pub fn name(self) -> &'static str {
        match self {
            ScalarFunction::Size => "size",
            ScalarFunction::Length => "length",
            ScalarFunction::Lower => "lower",
            ScalarFunction::Upper => "upper",
            ScalarFunction::Abs => "abs",
            ScalarFunction::Concat => "concat",
            ScalarFunction::Coalesce => "coalesce",
        }
    }

    /// Evaluate over already-evaluated arguments. Arity is checked at lookup;
    /// a direct call with the wrong number of arguments is `InvalidArgument`.
    pub fn eval(self, args: &[Value]) -> Result<Value, RegistryError> {
        let func = self.name();
        let invalid = |arg: &Value| RegistryError::InvalidArgument {
            func,
            message: format!("unexpected {} argument", arg.type_name()),
        };

        match self {
            ScalarFunction::Coalesce => Ok(args
                .iter()
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or(Value::Null)),
            ScalarFunction::Concat => {
                let mut out = String::new();
                for arg in args {
                    match arg {
                        Value::Null => {}
                        Value::String(s) => out.push_str(s),
                        Value::Int(i) => out.push_str(&i.to_string()),
                        Value::Double(d) => out.push_str(&d.to_string()),
                        Value::Bool(b) => out.push_str(&b.to_string()),
                        other => return Err(invalid(other)),
                    }
                }
                Ok(Value::String(out))
            }
            _ => {
                let [arg] = args else {
                    return Err(RegistryError::InvalidArgument {
                        func,
                        message: format!("expects 1 argument, got {}", args.len()),
                    });
                };
                if arg.is_null() {
                    return Ok(Value::Null);
                }
                match (self, arg) {
                    (ScalarFunction::Size, Value::Array(items)) => {
                        Ok(Value::Int(items.len() as i64))
                    }
                    (ScalarFunction::Size, Value::Map(fields)) => {
                        Ok(Value::Int(fields.len() as i64))
                    }
                    (ScalarFunction::Length, Value::String(s)) => {
                        Ok(Value::Int(s.chars().count() as i64))
                    }
                    (ScalarFunction::Lower, Value::String(s)) => {
                        Ok(Value::String(s.to_lowercase()))
                    }
                    (ScalarFunction::Upper, Value::String(s)) => {
                        Ok(Value::String(s.to_uppercase()))
                    }
                    (ScalarFunction::Abs, Value::Int(i)) => Ok(i
                        .checked_abs()
                        .map(Value::Int)
                        .unwrap_or_else(|| Value::Double((*i as f64).abs()))),
                    (ScalarFunction::Abs, Value::Double(d)) => Ok(Value::Double(d.abs())),
                    (_, other) => Err(invalid(other)),
                }
            }
        }
    }
}
