//! Plan operators
//!
//! An [`Operator`] tree is instantiated from a [`QueryPlan`] once per
//! execution. Operators carry only plan parameters; everything that changes
//! while rows flow lives in the [`OperatorState`] slot the operator owns in
//! the runtime context.
//!
//! # Lifecycle
//!
//! 1. `open` registers any buffered state (restored from a continuation
//!    token) with the memory tracker and checks step parameters.
//! 2. `next` yields a row, reports exhaustion, or reports that a receive
//!    step below needs a shard fetch before it can make progress. In the
//!    last case the operator's state is left so that calling `next` again
//!    after the fetch continues where it stopped.
//! 3. `close` releases every tracked byte and drops buffers.

use serde::{Deserialize, Serialize};
use shardql_plan::{Expr, OperatorKind, PlanStep, QueryPlan, Row};
use shardql_registry::FunctionRegistry;

use crate::context::RuntimeContext;
use crate::error::{QueryError, Result};
use crate::expr::CompiledExpr;

mod distinct;
mod group;
mod project;
mod receive;
mod sort;

pub(crate) use distinct::{DistinctOp, DistinctState};
pub(crate) use group::{GroupByOp, GroupState};
pub(crate) use project::{ProjectOp, SliceOp, SliceState};
pub(crate) use receive::{install_response, FetchTask, ReceiveOp, ReceiveState};
pub(crate) use sort::{SortOp, SortState};

/// Outcome of one `next` call
#[derive(Debug)]
pub(crate) enum Poll {
    Row(Row),
    Exhausted,
    /// A receive step below has queued shard fetches
    NeedInput,
}

/// Resumable per-operator state, one per plan step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum OperatorState {
    Receive(ReceiveState),
    Sort(SortState),
    GroupBy(GroupState),
    Distinct(DistinctState),
    Project,
    Slice(SliceState),
}

impl OperatorState {
    pub fn initial(step: &PlanStep) -> Self {
        match step {
            PlanStep::Receive { shards, .. } => OperatorState::Receive(ReceiveState::new(shards)),
            PlanStep::Sort { .. } => OperatorState::Sort(SortState::default()),
            PlanStep::GroupBy { .. } => OperatorState::GroupBy(GroupState::default()),
            PlanStep::Distinct { .. } => OperatorState::Distinct(DistinctState::default()),
            PlanStep::Project { .. } => OperatorState::Project,
            PlanStep::Slice { .. } => OperatorState::Slice(SliceState::default()),
        }
    }

    /// Fresh states for every step of `plan`, in slot order
    pub fn initial_states(plan: &QueryPlan) -> Vec<Self> {
        let mut states = Vec::new();
        plan.root.walk(&mut |step| states.push(Self::initial(step)));
        states
    }

    pub fn kind(&self) -> OperatorKind {
        match self {
            OperatorState::Receive(_) => OperatorKind::Receive,
            OperatorState::Sort(_) => OperatorKind::Sort,
            OperatorState::GroupBy(_) => OperatorKind::GroupBy,
            OperatorState::Distinct(_) => OperatorKind::Distinct,
            OperatorState::Project => OperatorKind::Project,
            OperatorState::Slice(_) => OperatorKind::Slice,
        }
    }

    /// Bytes this state holds against the memory tracker
    pub fn tracked_bytes(&self) -> u64 {
        match self {
            OperatorState::Receive(state) => state.tracked_bytes(),
            OperatorState::Sort(state) => state.bytes,
            OperatorState::GroupBy(state) => state.bytes,
            OperatorState::Distinct(state) => state.bytes,
            OperatorState::Project | OperatorState::Slice(_) => 0,
        }
    }

    /// Drop buffered data, returning the bytes that were tracked for it
    fn clear(&mut self) -> u64 {
        let bytes = self.tracked_bytes();
        match self {
            OperatorState::Receive(state) => state.clear(),
            OperatorState::Sort(state) => *state = SortState::default(),
            OperatorState::GroupBy(state) => *state = GroupState::default(),
            OperatorState::Distinct(state) => *state = DistinctState::default(),
            OperatorState::Project | OperatorState::Slice(_) => {}
        }
        bytes
    }
}

pub(crate) fn state_mismatch(pos: usize, expected: OperatorKind) -> QueryError {
    QueryError::IllegalState(format!(
        "operator state at position {} is not a {} state",
        pos, expected
    ))
}

/// Operator tree node, one variant per plan step kind
#[derive(Debug)]
pub(crate) enum Operator {
    Receive(ReceiveOp),
    Sort(SortOp),
    GroupBy(GroupByOp),
    Distinct(DistinctOp),
    Project(ProjectOp),
    Slice(SliceOp),
}

impl Operator {
    /// Instantiate the operator tree for `plan`, resolving every function
    pub fn build(plan: &QueryPlan, registry: &FunctionRegistry) -> Result<Self> {
        let mut next_pos = 0;
        Self::build_step(&plan.root, registry, &mut next_pos)
    }

    fn build_step(
        step: &PlanStep,
        registry: &FunctionRegistry,
        next_pos: &mut usize,
    ) -> Result<Self> {
        let pos = *next_pos;
        *next_pos += 1;

        let mut child = |input: &PlanStep| -> Result<Box<Operator>> {
            Ok(Box::new(Self::build_step(input, registry, next_pos)?))
        };

        Ok(match step {
            PlanStep::Receive {
                table,
                shards,
                ordered,
            } => Operator::Receive(ReceiveOp::new(pos, table.clone(), shards.len(), *ordered)),
            PlanStep::Sort { input, keys, mode } => {
                Operator::Sort(SortOp::new(pos, child(input)?, keys.clone(), *mode))
            }
            PlanStep::GroupBy {
                input,
                keys,
                aggregates,
            } => Operator::GroupBy(GroupByOp::new(
                pos,
                child(input)?,
                keys.clone(),
                aggregates,
                registry,
            )?),
            PlanStep::Distinct {
                input,
                keys,
                strategy,
            } => Operator::Distinct(DistinctOp::new(pos, child(input)?, keys.clone(), *strategy)),
            PlanStep::Project { input, fields } => {
                let input = child(input)?;
                let fields = fields
                    .iter()
                    .map(|f| Ok((f.name.clone(), CompiledExpr::compile(&f.expr, registry)?)))
                    .collect::<Result<Vec<_>>>()?;
                Operator::Project(ProjectOp::new(pos, input, fields))
            }
            PlanStep::Slice {
                input,
                offset,
                limit,
            } => {
                let input = child(input)?;
                let compile = |e: &Option<Expr>| -> Result<Option<CompiledExpr>> {
                    e.as_ref()
                        .map(|e| CompiledExpr::compile(e, registry))
                        .transpose()
                };
                Operator::Slice(SliceOp::new(pos, input, compile(offset)?, compile(limit)?))
            }
        })
    }

    pub fn pos(&self) -> usize {
        match self {
            Operator::Receive(op) => op.pos,
            Operator::Sort(op) => op.pos,
            Operator::GroupBy(op) => op.pos,
            Operator::Distinct(op) => op.pos,
            Operator::Project(op) => op.pos,
            Operator::Slice(op) => op.pos,
        }
    }

    pub fn kind(&self) -> OperatorKind {
        match self {
            Operator::Receive(_) => OperatorKind::Receive,
            Operator::Sort(_) => OperatorKind::Sort,
            Operator::GroupBy(_) => OperatorKind::GroupBy,
            Operator::Distinct(_) => OperatorKind::Distinct,
            Operator::Project(_) => OperatorKind::Project,
            Operator::Slice(_) => OperatorKind::Slice,
        }
    }

    pub fn input(&self) -> Option<&Operator> {
        match self {
            Operator::Receive(_) => None,
            Operator::Sort(op) => Some(&op.input),
            Operator::GroupBy(op) => Some(&op.input),
            Operator::Distinct(op) => Some(&op.input),
            Operator::Project(op) => Some(&op.input),
            Operator::Slice(op) => Some(&op.input),
        }
    }

    pub fn open(&self, ctx: &mut RuntimeContext) -> Result<()> {
        let pos = self.pos();
        let slot = ctx.slot(pos)?;
        if slot.state.kind() != self.kind() {
            return Err(state_mismatch(pos, self.kind()));
        }
        let restored = slot.state.tracked_bytes();
        if restored > 0 {
            slot.memory.reserve(restored, self.kind().name())?;
        }

        if let Operator::Slice(op) = self {
            op.bounds(ctx)?;
        }

        match self.input() {
            Some(input) => input.open(ctx),
            None => Ok(()),
        }
    }

    pub fn next(&self, ctx: &mut RuntimeContext) -> Result<Poll> {
        match self {
            Operator::Receive(op) => op.next(ctx),
            Operator::Sort(op) => op.next(ctx),
            Operator::GroupBy(op) => op.next(ctx),
            Operator::Distinct(op) => op.next(ctx),
            Operator::Project(op) => op.next(ctx),
            Operator::Slice(op) => op.next(ctx),
        }
    }

    /// Release this subtree's memory and drop its buffers
    pub fn close(&self, ctx: &mut RuntimeContext) {
        if let Ok(slot) = ctx.slot(self.pos()) {
            let bytes = slot.state.clear();
            slot.memory.release(bytes);
        }
        if let Some(input) = self.input() {
            input.close(ctx);
        }
    }

    /// Drain the shard fetches queued by receive steps in this subtree
    pub fn take_fetches(&self, ctx: &mut RuntimeContext, out: &mut Vec<FetchTask>) -> Result<()> {
        match self {
            Operator::Receive(op) => op.take_fetches(ctx, out),
            _ => match self.input() {
                Some(input) => input.take_fetches(ctx, out),
                None => Ok(()),
            },
        }
    }
}
