//! Row-at-a-time steps: Project (field steps and computed fields) and
//! Slice (offset and limit)

use serde::{Deserialize, Serialize};
use shardql_plan::{OperatorKind, Row, Value};

use super::{state_mismatch, Operator, OperatorState, Poll};
use crate::context::RuntimeContext;
use crate::error::{QueryError, Result};
use crate::expr::CompiledExpr;

#[derive(Debug)]
pub(crate) struct ProjectOp {
    pub pos: usize,
    pub input: Box<Operator>,
    pub fields: Vec<(String, CompiledExpr)>,
}

impl ProjectOp {
    pub fn new(pos: usize, input: Box<Operator>, fields: Vec<(String, CompiledExpr)>) -> Self {
        Self { pos, input, fields }
    }

    pub fn next(&self, ctx: &mut RuntimeContext) -> Result<Poll> {
        let row = match self.input.next(ctx)? {
            Poll::Row(row) => row,
            other => return Ok(other),
        };
        let mut out = Row::with_capacity(self.fields.len());
        for (name, expr) in &self.fields {
            out.insert(name.clone(), expr.eval(&row, &ctx.bindings)?);
        }
        Ok(Poll::Row(out))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SliceState {
    pub skipped: u64,
    pub emitted: u64,
}

#[derive(Debug)]
pub(crate) struct SliceOp {
    pub pos: usize,
    pub input: Box<Operator>,
    pub offset: Option<CompiledExpr>,
    pub limit: Option<CompiledExpr>,
}

impl SliceOp {
    pub fn new(
        pos: usize,
        input: Box<Operator>,
        offset: Option<CompiledExpr>,
        limit: Option<CompiledExpr>,
    ) -> Self {
        Self {
            pos,
            input,
            offset,
            limit,
        }
    }

    /// Evaluate offset and limit; both must be non-negative integers.
    pub fn bounds(&self, ctx: &RuntimeContext) -> Result<(u64, Option<u64>)> {
        let eval = |name: &str, expr: &Option<CompiledExpr>| -> Result<Option<u64>> {
            let Some(expr) = expr else {
                return Ok(None);
            };
            match expr.eval(&Row::new(), &ctx.bindings)?.normalized() {
                Value::Int(n) if n >= 0 => Ok(Some(n as u64)),
                other => Err(QueryError::IllegalArgument(format!(
                    "{} must be a non-negative integer, got {}",
                    name,
                    other.type_name()
                ))),
            }
        };
        Ok((eval("offset", &self.offset)?.unwrap_or(0), eval("limit", &self.limit)?))
    }

    pub fn next(&self, ctx: &mut RuntimeContext) -> Result<Poll> {
        let (offset, limit) = self.bounds(ctx)?;
        loop {
            {
                let slot = ctx.slot(self.pos)?;
                let OperatorState::Slice(state) = slot.state else {
                    return Err(state_mismatch(self.pos, OperatorKind::Slice));
                };
                if limit.is_some_and(|limit| state.emitted >= limit) {
                    return Ok(Poll::Exhausted);
                }
            }

            let row = match self.input.next(ctx)? {
                Poll::Row(row) => row,
                other => return Ok(other),
            };

            let slot = ctx.slot(self.pos)?;
            let OperatorState::Slice(state) = slot.state else {
                return Err(state_mismatch(self.pos, OperatorKind::Slice));
            };
            if state.skipped < offset {
                state.skipped += 1;
                continue;
            }
            state.emitted += 1;
            return Ok(Poll::Row(row));
        }
    }
}
