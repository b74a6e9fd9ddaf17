//! Distinct: duplicate elimination on a key list (the whole row when empty)

use serde::{Deserialize, Serialize};
use shardql_plan::{DistinctStrategy, OperatorKind, Row, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::{state_mismatch, Operator, OperatorState, Poll};
use crate::context::RuntimeContext;
use crate::error::{QueryError, Result};

const MEMORY_CONTEXT: &str = "distinct";
const KEY_OVERHEAD: u64 = 32;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct DistinctState {
    /// Key of the last emitted row (adjacent strategy)
    pub last: Option<Vec<Value>>,
    /// Canonical encodings of every key seen (hashed strategy)
    pub seen: BTreeSet<String>,
    pub bytes: u64,
}

#[derive(Debug)]
pub(crate) struct DistinctOp {
    pub pos: usize,
    pub input: Box<Operator>,
    pub keys: Vec<String>,
    pub strategy: DistinctStrategy,
}

impl DistinctOp {
    pub fn new(
        pos: usize,
        input: Box<Operator>,
        keys: Vec<String>,
        strategy: DistinctStrategy,
    ) -> Self {
        Self {
            pos,
            input,
            keys,
            strategy,
        }
    }

    /// The whole row is keyed as a map of field name to value, so field
    /// names count and field order does not.
    fn key_of(&self, row: &Row) -> Vec<Value> {
        if self.keys.is_empty() {
            let fields: BTreeMap<String, Value> = row
                .iter()
                .map(|(name, v)| (name.to_string(), v.normalized()))
                .collect();
            vec![Value::Map(fields)]
        } else {
            self.keys
                .iter()
                .map(|k| row.get_or_null(k).normalized())
                .collect()
        }
    }

    pub fn next(&self, ctx: &mut RuntimeContext) -> Result<Poll> {
        loop {
            let row = match self.input.next(ctx)? {
                Poll::Row(row) => row,
                other => return Ok(other),
            };
            let key = self.key_of(&row);

            let slot = ctx.slot(self.pos)?;
            let OperatorState::Distinct(state) = slot.state else {
                return Err(state_mismatch(self.pos, OperatorKind::Distinct));
            };

            match self.strategy {
                DistinctStrategy::Adjacent => {
                    if state.last.as_ref() == Some(&key) {
                        continue;
                    }
                    let size = key.iter().map(Value::size_estimate).sum::<u64>();
                    slot.memory.release(state.bytes);
                    state.bytes = 0;
                    slot.memory.reserve(size, MEMORY_CONTEXT)?;
                    state.bytes = size;
                    state.last = Some(key);
                }
                DistinctStrategy::Hashed => {
                    let encoded = serde_json::to_string(&key).map_err(|e| {
                        QueryError::IllegalState(format!("cannot encode distinct key: {}", e))
                    })?;
                    if state.seen.contains(&encoded) {
                        continue;
                    }
                    let size = encoded.len() as u64 + KEY_OVERHEAD;
                    slot.memory.reserve(size, MEMORY_CONTEXT)?;
                    state.bytes += size;
                    state.seen.insert(encoded);
                }
            }
            return Ok(Poll::Row(row));
        }
    }
}
