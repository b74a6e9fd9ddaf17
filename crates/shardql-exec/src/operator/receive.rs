//! Receive: per-shard cursors over the request executor

use serde::{Deserialize, Serialize};
use shardql_plan::{OperatorKind, Row, ShardId, SortSpec};
use std::cmp::Ordering;
use std::collections::VecDeque;

use super::sort::compare_rows;
use super::{state_mismatch, OperatorState, Poll};
use crate::context::RuntimeContext;
use crate::error::Result;
use crate::executor::{ShardRequest, ShardResponse};
use crate::memory::MemoryTracker;

const MEMORY_CONTEXT: &str = "receive";

/// Read position and buffered rows for one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ShardCursor {
    pub shard: ShardId,
    /// Server cursor for the next read; `None` before the first read
    pub continuation: Option<Vec<u8>>,
    pub buffer: VecDeque<Row>,
    pub buffered_bytes: u64,
    pub exhausted: bool,
}

impl ShardCursor {
    fn new(shard: ShardId) -> Self {
        Self {
            shard,
            continuation: None,
            buffer: VecDeque::new(),
            buffered_bytes: 0,
            exhausted: false,
        }
    }

    fn needs_fetch(&self) -> bool {
        self.buffer.is_empty() && !self.exhausted
    }

    fn is_drained(&self) -> bool {
        self.buffer.is_empty() && self.exhausted
    }

    fn pop(&mut self, memory: &mut MemoryTracker) -> Option<Row> {
        let row = self.buffer.pop_front()?;
        let size = row.size_estimate();
        self.buffered_bytes = self.buffered_bytes.saturating_sub(size);
        memory.release(size);
        Some(row)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ReceiveState {
    pub cursors: Vec<ShardCursor>,
    /// Cursor indexes waiting on a fetch; recomputed on resume
    #[serde(skip)]
    pub pending: Vec<usize>,
}

impl ReceiveState {
    pub fn new(shards: &[ShardId]) -> Self {
        Self {
            cursors: shards.iter().copied().map(ShardCursor::new).collect(),
            pending: Vec::new(),
        }
    }

    pub fn tracked_bytes(&self) -> u64 {
        self.cursors.iter().map(|c| c.buffered_bytes).sum()
    }

    pub fn clear(&mut self) {
        for cursor in &mut self.cursors {
            cursor.buffer.clear();
            cursor.buffered_bytes = 0;
        }
        self.pending.clear();
    }
}

/// A shard request queued by a receive step, tagged with where its
/// response goes
#[derive(Debug, Clone)]
pub(crate) struct FetchTask {
    pub pos: usize,
    pub cursor: usize,
    pub request: ShardRequest,
}

#[derive(Debug)]
pub(crate) struct ReceiveOp {
    pub pos: usize,
    pub table: String,
    pub shard_count: usize,
    pub ordered: bool,
}

impl ReceiveOp {
    pub fn new(pos: usize, table: String, shard_count: usize, ordered: bool) -> Self {
        Self {
            pos,
            table,
            shard_count,
            ordered,
        }
    }

    fn state<'a>(&self, state: &'a mut OperatorState) -> Result<&'a mut ReceiveState> {
        match state {
            OperatorState::Receive(state) if state.cursors.len() == self.shard_count => Ok(state),
            _ => Err(state_mismatch(self.pos, OperatorKind::Receive)),
        }
    }

    pub fn next(&self, ctx: &mut RuntimeContext) -> Result<Poll> {
        let max_fan_out = ctx.options.max_fan_out;
        let slot = ctx.slot(self.pos)?;
        let state = self.state(slot.state)?;

        if self.ordered {
            // Shards are drained one after another, in plan order.
            let Some(index) = state.cursors.iter().position(|c| !c.is_drained()) else {
                return Ok(Poll::Exhausted);
            };
            return match state.cursors[index].pop(slot.memory) {
                Some(row) => Ok(Poll::Row(row)),
                None => {
                    state.pending = vec![index];
                    Ok(Poll::NeedInput)
                }
            };
        }

        if let Some(cursor) = state.cursors.iter_mut().find(|c| !c.buffer.is_empty()) {
            if let Some(row) = cursor.pop(slot.memory) {
                return Ok(Poll::Row(row));
            }
        }

        state.pending = state
            .cursors
            .iter()
            .enumerate()
            .filter(|(_, c)| c.needs_fetch())
            .map(|(i, _)| i)
            .take(max_fan_out)
            .collect();
        if state.pending.is_empty() {
            Ok(Poll::Exhausted)
        } else {
            Ok(Poll::NeedInput)
        }
    }

    /// Merge the shards' sorted streams on `keys`.
    ///
    /// Every shard must have a buffered row (or be exhausted) before a row
    /// can be chosen. Equal keys go to the lowest shard ordinal.
    pub fn next_merged(&self, ctx: &mut RuntimeContext, keys: &[SortSpec]) -> Result<Poll> {
        let slot = ctx.slot(self.pos)?;
        let state = self.state(slot.state)?;

        state.pending = state
            .cursors
            .iter()
            .enumerate()
            .filter(|(_, c)| c.needs_fetch())
            .map(|(i, _)| i)
            .collect();
        if !state.pending.is_empty() {
            return Ok(Poll::NeedInput);
        }

        let mut best: Option<usize> = None;
        for (i, cursor) in state.cursors.iter().enumerate() {
            let Some(front) = cursor.buffer.front() else {
                continue;
            };
            let better = match best.and_then(|b| state.cursors[b].buffer.front()) {
                None => true,
                Some(current) => compare_rows(front, current, keys) == Ordering::Less,
            };
            if better {
                best = Some(i);
            }
        }

        match best.and_then(|i| state.cursors[i].pop(slot.memory)) {
            Some(row) => Ok(Poll::Row(row)),
            None => Ok(Poll::Exhausted),
        }
    }

    pub fn take_fetches(&self, ctx: &mut RuntimeContext, out: &mut Vec<FetchTask>) -> Result<()> {
        let options = ctx.options.clone();
        let slot = ctx.slot(self.pos)?;
        let state = self.state(slot.state)?;

        for index in std::mem::take(&mut state.pending) {
            let cursor = &state.cursors[index];
            out.push(FetchTask {
                pos: self.pos,
                cursor: index,
                request: ShardRequest {
                    table: self.table.clone(),
                    shard: cursor.shard,
                    continuation: cursor.continuation.clone(),
                    limit: options.limit,
                    max_read_kb: options.max_read_kb,
                    max_write_kb: options.max_write_kb,
                    consistency: options.consistency,
                },
            });
        }
        Ok(())
    }
}

/// Buffer a shard response into the cursor that requested it
pub(crate) fn install_response(
    ctx: &mut RuntimeContext,
    task: &FetchTask,
    response: ShardResponse,
) -> Result<()> {
    let slot = ctx.slot(task.pos)?;
    let OperatorState::Receive(state) = slot.state else {
        return Err(state_mismatch(task.pos, OperatorKind::Receive));
    };
    let cursor = state
        .cursors
        .get_mut(task.cursor)
        .ok_or_else(|| state_mismatch(task.pos, OperatorKind::Receive))?;

    let bytes: u64 = response.rows.iter().map(Row::size_estimate).sum();
    slot.memory.reserve(bytes, MEMORY_CONTEXT)?;

    cursor.buffered_bytes += bytes;
    cursor.buffer.extend(response.rows);
    cursor.exhausted = response.continuation.is_none();
    cursor.continuation = response.continuation;
    Ok(())
}
