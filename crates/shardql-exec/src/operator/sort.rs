//! Sort: k-way merge over ordered shard streams, or full materialization

use serde::{Deserialize, Serialize};
use shardql_plan::{OperatorKind, Row, SortMode, SortSpec, Value};
use std::cmp::Ordering;
use std::collections::VecDeque;

use super::{state_mismatch, Operator, OperatorState, Poll};
use crate::context::RuntimeContext;
use crate::error::{QueryError, Result};

const MEMORY_CONTEXT: &str = "sort";

/// Compare two key values. Null placement follows `nulls_first` whatever
/// the direction.
pub(crate) fn compare_values(
    left: &Value,
    right: &Value,
    desc: bool,
    nulls_first: bool,
) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) if nulls_first => Ordering::Less,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) if nulls_first => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        _ if desc => right.total_cmp(left),
        _ => left.total_cmp(right),
    }
}

/// Compare two rows on `keys`
pub(crate) fn compare_rows(a: &Row, b: &Row, keys: &[SortSpec]) -> Ordering {
    for key in keys {
        let ord = compare_values(
            a.get_or_null(&key.field),
            b.get_or_null(&key.field),
            key.desc,
            key.nulls_first,
        );
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SortState {
    pub buffer: VecDeque<Row>,
    pub bytes: u64,
    /// Input fully consumed and buffer ordered
    pub sorted: bool,
}

#[derive(Debug)]
pub(crate) struct SortOp {
    pub pos: usize,
    pub input: Box<Operator>,
    pub keys: Vec<SortSpec>,
    pub mode: SortMode,
}

impl SortOp {
    pub fn new(pos: usize, input: Box<Operator>, keys: Vec<SortSpec>, mode: SortMode) -> Self {
        Self {
            pos,
            input,
            keys,
            mode,
        }
    }

    pub fn next(&self, ctx: &mut RuntimeContext) -> Result<Poll> {
        match self.mode {
            SortMode::Merge => match self.input.as_ref() {
                Operator::Receive(receive) => receive.next_merged(ctx, &self.keys),
                other => Err(QueryError::IllegalState(format!(
                    "merge sort over a {} step",
                    other.kind()
                ))),
            },
            SortMode::Materialize => self.next_materialized(ctx),
        }
    }

    fn next_materialized(&self, ctx: &mut RuntimeContext) -> Result<Poll> {
        loop {
            let slot = ctx.slot(self.pos)?;
            let OperatorState::Sort(state) = slot.state else {
                return Err(state_mismatch(self.pos, OperatorKind::Sort));
            };

            if state.sorted {
                return Ok(match state.buffer.pop_front() {
                    Some(row) => {
                        let size = row.size_estimate();
                        state.bytes = state.bytes.saturating_sub(size);
                        slot.memory.release(size);
                        Poll::Row(row)
                    }
                    None => Poll::Exhausted,
                });
            }

            match self.input.next(ctx)? {
                Poll::Row(row) => {
                    let slot = ctx.slot(self.pos)?;
                    let OperatorState::Sort(state) = slot.state else {
                        return Err(state_mismatch(self.pos, OperatorKind::Sort));
                    };
                    let size = row.size_estimate();
                    slot.memory.reserve(size, MEMORY_CONTEXT)?;
                    state.bytes += size;
                    state.buffer.push_back(row);
                }
                Poll::NeedInput => return Ok(Poll::NeedInput),
                Poll::Exhausted => {
                    let slot = ctx.slot(self.pos)?;
                    let OperatorState::Sort(state) = slot.state else {
                        return Err(state_mismatch(self.pos, OperatorKind::Sort));
                    };
                    // Stable, so equal keys keep arrival order.
                    state
                        .buffer
                        .make_contiguous()
                        .sort_by(|a, b| compare_rows(a, b, &self.keys));
                    state.sorted = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut rows: Vec<Row>, keys: &[SortSpec]) -> Vec<Value> {
        rows.sort_by(|a, b| compare_rows(a, b, keys));
        rows.into_iter().map(|r| r.get_or_null("k").clone()).collect()
    }

    #[test]
    fn test_nulls_last_by_default_in_both_directions() {
        let rows = vec![
            Row::new().with("k", 2),
            Row::new().with("k", Value::Null),
            Row::new().with("k", 1),
        ];
        assert_eq!(
            sorted(rows.clone(), &[SortSpec::asc("k")]),
            vec![Value::Int(1), Value::Int(2), Value::Null]
        );
        assert_eq!(
            sorted(rows, &[SortSpec::desc("k")]),
            vec![Value::Int(2), Value::Int(1), Value::Null]
        );
    }

    #[test]
    fn test_nulls_first() {
        let rows = vec![Row::new().with("k", 1), Row::new()];
        let key = SortSpec {
            nulls_first: true,
            ..SortSpec::asc("k")
        };
        assert_eq!(sorted(rows, &[key]), vec![Value::Null, Value::Int(1)]);
    }

    #[test]
    fn test_secondary_key_breaks_ties() {
        let a = Row::new().with("k", 1).with("t", "b");
        let b = Row::new().with("k", 1).with("t", "a");
        let keys = [SortSpec::asc("k"), SortSpec::asc("t")];
        assert_eq!(compare_rows(&a, &b, &keys), Ordering::Greater);
        assert_eq!(compare_rows(&a, &b, &keys[..1]), Ordering::Equal);
    }
}
