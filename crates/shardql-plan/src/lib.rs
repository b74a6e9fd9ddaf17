//! shardql query plans
//!
//! A query plan is produced by the server when a statement is prepared and is
//! executed on the client. The plan is data: a tree of [`PlanStep`]s whose
//! leaves fan out to shards and whose inner steps merge, group, deduplicate
//! and project the rows coming back. Plans are immutable once decoded and are
//! shared behind an `Arc` by every execution of the prepared statement.
//!
//! All types serialize deterministically, so a plan's [fingerprint](QueryPlan::fingerprint)
//! identifies it across processes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

mod row;
mod value;
pub use row::Row;
pub use value::Value;

/// The plan format this crate understands.
pub const PLAN_FORMAT_VERSION: u16 = 1;

/// Server-side identifier of a shard or partition.
pub type ShardId = u32;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Malformed plan: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Unsupported plan version {found}, expected {expected}")]
    UnsupportedVersion { found: u16, expected: u16 },

    #[error("Invalid plan: {0}")]
    Invalid(String),
}

/// Top-level query plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub version: u16,
    pub root: PlanStep,
}

impl QueryPlan {
    pub fn new(root: PlanStep) -> Self {
        Self {
            version: PLAN_FORMAT_VERSION,
            root,
        }
    }

    /// Decode and validate a plan received from the server.
    ///
    /// Unknown step or expression kinds fail here; they are never skipped.
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        let plan: QueryPlan = serde_json::from_str(json)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, PlanError> {
        let plan: QueryPlan = serde_json::from_slice(bytes)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("plan should always serialize")
    }

    /// SHA-256 over the canonical JSON encoding.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.to_json().as_bytes());
        hasher.finalize().into()
    }

    /// Hex form of [`QueryPlan::digest`].
    pub fn fingerprint(&self) -> String {
        self.digest().iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Step kinds in pre-order. A step's index in this list is its state slot.
    pub fn shape(&self) -> Vec<OperatorKind> {
        let mut shape = Vec::new();
        self.root.walk(&mut |step| shape.push(step.kind()));
        shape
    }

    /// Every bind variable referenced anywhere in the plan, in plan order.
    pub fn bind_references(&self) -> Vec<&VarRef> {
        let mut refs = Vec::new();
        collect_bind_refs(&self.root, &mut refs);
        refs
    }

    /// Structural checks a well-formed server plan always passes.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.version != PLAN_FORMAT_VERSION {
            return Err(PlanError::UnsupportedVersion {
                found: self.version,
                expected: PLAN_FORMAT_VERSION,
            });
        }
        self.root.validate()
    }
}

fn collect_bind_refs<'a>(step: &'a PlanStep, out: &mut Vec<&'a VarRef>) {
    for expr in step.exprs() {
        expr.walk(&mut |e| {
            if let Expr::BindVar { var } = e {
                out.push(var);
            }
        });
    }
    if let Some(input) = step.input() {
        collect_bind_refs(input, out);
    }
}

/// Operator kinds, one per [`PlanStep`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    Receive,
    Sort,
    GroupBy,
    Distinct,
    Project,
    Slice,
}

impl OperatorKind {
    pub fn name(self) -> &'static str {
        match self {
            OperatorKind::Receive => "receive",
            OperatorKind::Sort => "sort",
            OperatorKind::GroupBy => "group_by",
            OperatorKind::Distinct => "distinct",
            OperatorKind::Project => "project",
            OperatorKind::Slice => "slice",
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Plan steps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanStep {
    /// Fetch rows from every listed shard of a table.
    Receive {
        table: String,
        shards: Vec<ShardId>,
        /// Shards return rows sorted; drain them one request at a time and
        /// never interleave rows across shards.
        #[serde(default)]
        ordered: bool,
    },
    Sort {
        input: Box<PlanStep>,
        keys: Vec<SortSpec>,
        #[serde(default)]
        mode: SortMode,
    },
    /// Streaming aggregation over input sorted by `keys`.
    GroupBy {
        input: Box<PlanStep>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        keys: Vec<GroupKey>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        aggregates: Vec<AggCall>,
    },
    Distinct {
        input: Box<PlanStep>,
        /// Fields forming the duplicate-elimination key; empty means the whole row.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        keys: Vec<String>,
        #[serde(default)]
        strategy: DistinctStrategy,
    },
    Project {
        input: Box<PlanStep>,
        fields: Vec<ProjectField>,
    },
    /// OFFSET / LIMIT
    Slice {
        input: Box<PlanStep>,
        #[serde(skip_serializing_if = "Option::is_none")]
        offset: Option<Expr>,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<Expr>,
    },
}

impl PlanStep {
    pub fn kind(&self) -> OperatorKind {
        match self {
            PlanStep::Receive { .. } => OperatorKind::Receive,
            PlanStep::Sort { .. } => OperatorKind::Sort,
            PlanStep::GroupBy { .. } => OperatorKind::GroupBy,
            PlanStep::Distinct { .. } => OperatorKind::Distinct,
            PlanStep::Project { .. } => OperatorKind::Project,
            PlanStep::Slice { .. } => OperatorKind::Slice,
        }
    }

    pub fn input(&self) -> Option<&PlanStep> {
        match self {
            PlanStep::Receive { .. } => None,
            PlanStep::Sort { input, .. }
            | PlanStep::GroupBy { input, .. }
            | PlanStep::Distinct { input, .. }
            | PlanStep::Project { input, .. }
            | PlanStep::Slice { input, .. } => Some(input),
        }
    }

    /// Expressions owned directly by this step (not by its input).
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            PlanStep::GroupBy { aggregates, .. } => {
                aggregates.iter().flat_map(|a| a.args.iter()).collect()
            }
            PlanStep::Project { fields, .. } => fields.iter().map(|f| &f.expr).collect(),
            PlanStep::Slice { offset, limit, .. } => {
                offset.iter().chain(limit.iter()).collect()
            }
            PlanStep::Receive { .. } | PlanStep::Sort { .. } | PlanStep::Distinct { .. } => {
                Vec::new()
            }
        }
    }

    /// Visit this step and its inputs in pre-order.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a PlanStep)) {
        f(self);
        if let Some(input) = self.input() {
            input.walk(f);
        }
    }

    fn validate(&self) -> Result<(), PlanError> {
        match self {
            PlanStep::Receive { table, shards, .. } => {
                if table.is_empty() {
                    return Err(PlanError::Invalid("receive step has no table".to_string()));
                }
                if shards.is_empty() {
                    return Err(PlanError::Invalid(format!(
                        "receive step for table '{}' targets no shards",
                        table
                    )));
                }
                let mut seen = HashSet::new();
                if let Some(dup) = shards.iter().find(|s| !seen.insert(**s)) {
                    return Err(PlanError::Invalid(format!(
                        "receive step lists shard {} twice",
                        dup
                    )));
                }
            }
            PlanStep::Sort { input, keys, mode } => {
                if keys.is_empty() {
                    return Err(PlanError::Invalid("sort step has no keys".to_string()));
                }
                if *mode == SortMode::Merge
                    && !matches!(**input, PlanStep::Receive { ordered: true, .. })
                {
                    return Err(PlanError::Invalid(
                        "merge sort requires an ordered receive step as input".to_string(),
                    ));
                }
            }
            PlanStep::GroupBy {
                keys, aggregates, ..
            } => {
                let mut names: HashSet<&str> = keys.iter().map(|k| k.field.as_str()).collect();
                for agg in aggregates {
                    if !names.insert(agg.name.as_str()) {
                        return Err(PlanError::Invalid(format!(
                            "group by output field '{}' is defined twice",
                            agg.name
                        )));
                    }
                }
            }
            PlanStep::Project { fields, .. } => {
                if fields.is_empty() {
                    return Err(PlanError::Invalid("project step has no fields".to_string()));
                }
                let mut names = HashSet::new();
                if let Some(dup) = fields.iter().find(|f| !names.insert(f.name.as_str())) {
                    return Err(PlanError::Invalid(format!(
                        "project field '{}' is defined twice",
                        dup.name
                    )));
                }
            }
            PlanStep::Distinct { .. } | PlanStep::Slice { .. } => {}
        }

        match self.input() {
            Some(input) => input.validate(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    /// K-way merge of per-shard sorted streams from an ordered receive.
    Merge,
    /// Buffer the whole input, then sort it.
    #[default]
    Materialize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistinctStrategy {
    /// Input is sorted by the key: compare with the previous row only.
    Adjacent,
    /// Remember every key seen so far.
    #[default]
    Hashed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub desc: bool,
    #[serde(default)]
    pub nulls_first: bool,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            desc: false,
            nulls_first: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            desc: true,
            nulls_first: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKey {
    pub field: String,
    #[serde(default)]
    pub desc: bool,
    /// Must match the null placement of the sort feeding the group by
    #[serde(default)]
    pub nulls_first: bool,
}

impl GroupKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            desc: false,
            nulls_first: false,
        }
    }
}

/// Aggregate call producing output field `name`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggCall {
    pub name: String,
    pub func: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectField {
    pub name: String,
    pub expr: Expr,
}

/// Reference to a bind variable, by name or by 1-based position
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarRef {
    Position(u32),
    Name(String),
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarRef::Position(pos) => write!(f, "#{}", pos),
            VarRef::Name(name) => write!(f, "${}", name.trim_start_matches('$')),
        }
    }
}

/// Expression types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Const {
        value: Value,
    },
    BindVar {
        var: VarRef,
    },
    /// Field step: `name` looked up on `input`, or on the current row when
    /// there is no input.
    Field {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Box<Expr>>,
        name: String,
    },
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Neg {
        operand: Box<Expr>,
    },
    Function {
        name: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn field(name: impl Into<String>) -> Self {
        Expr::Field {
            input: None,
            name: name.into(),
        }
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Expr::Const {
            value: value.into(),
        }
    }

    pub fn bind(var: VarRef) -> Self {
        Expr::BindVar { var }
    }

    pub fn arith(op: ArithOp, left: Expr, right: Expr) -> Self {
        Expr::Arith {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            args,
        }
    }

    /// Visit this expression and its operands in pre-order.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Const { .. } | Expr::BindVar { .. } => {}
            Expr::Field { input, .. } => {
                if let Some(input) = input {
                    input.walk(f);
                }
            }
            Expr::Arith { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::Neg { operand } => operand.walk(f),
            Expr::Function { args, .. } => {
                for arg in args {
                    arg.walk(f);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> QueryPlan {
        QueryPlan::new(PlanStep::GroupBy {
            input: Box::new(PlanStep::Sort {
                input: Box::new(PlanStep::Receive {
                    table: "orders".to_string(),
                    shards: vec![1, 2, 3],
                    ordered: true,
                }),
                keys: vec![SortSpec::asc("region")],
                mode: SortMode::Merge,
            }),
            keys: vec![GroupKey::asc("region")],
            aggregates: vec![AggCall {
                name: "total".to_string(),
                func: "sum".to_string(),
                args: vec![Expr::arith(
                    ArithOp::Mul,
                    Expr::field("amount"),
                    Expr::bind(VarRef::Name("rate".to_string())),
                )],
            }],
        })
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let plan1 = sample_plan();
        let plan2 = plan1.clone();

        assert_eq!(plan1.fingerprint(), plan2.fingerprint());
        assert_eq!(plan1.fingerprint().len(), 64);
    }

    #[test]
    fn test_json_round_trip() {
        let plan = sample_plan();
        let json = plan.to_json();
        let parsed = QueryPlan::from_json(&json).unwrap();

        assert_eq!(plan.fingerprint(), parsed.fingerprint());
        assert_eq!(
            parsed.shape(),
            vec![OperatorKind::GroupBy, OperatorKind::Sort, OperatorKind::Receive]
        );
    }

    #[test]
    fn test_bind_references() {
        let plan = sample_plan();
        let refs = plan.bind_references();
        assert_eq!(refs, vec![&VarRef::Name("rate".to_string())]);
    }

    #[test]
    fn test_merge_requires_ordered_receive() {
        let plan = QueryPlan::new(PlanStep::Sort {
            input: Box::new(PlanStep::Receive {
                table: "t".to_string(),
                shards: vec![1],
                ordered: false,
            }),
            keys: vec![SortSpec::asc("k")],
            mode: SortMode::Merge,
        });
        assert!(matches!(plan.validate(), Err(PlanError::Invalid(_))));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut plan = sample_plan();
        plan.version = 7;
        assert!(matches!(
            QueryPlan::from_json(&plan.to_json()),
            Err(PlanError::UnsupportedVersion { found: 7, .. })
        ));
    }
}
