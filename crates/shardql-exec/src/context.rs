//! Runtime context (RCB) for one query execution
//!
//! The context is the execution's whole resumable state: bind values, the
//! memory tracker, and one [`OperatorState`] per plan step indexed by the
//! step's pre-order position. Operators themselves hold only immutable plan
//! parameters, so serializing the context is enough to suspend an execution
//! between requests and resume it elsewhere.

use std::time::Duration;
use uuid::Uuid;

use crate::bind::BindVariables;
use crate::continuation::ContinuationToken;
use crate::error::{QueryError, Result};
use crate::memory::MemoryTracker;
use crate::operator::OperatorState;
use crate::options::ResolvedOptions;

pub struct RuntimeContext {
    pub(crate) execution_id: Uuid,
    pub(crate) bindings: BindVariables,
    pub(crate) memory: MemoryTracker,
    pub(crate) states: Vec<OperatorState>,
    pub(crate) options: ResolvedOptions,
    /// Time spent across every batch so far
    pub(crate) elapsed: Duration,
    /// Token handed out at the end of the last batch
    pub(crate) last_token: Option<ContinuationToken>,
}

/// Mutable view of one operator's slot plus the shared pieces it may need
pub(crate) struct Slot<'a> {
    pub state: &'a mut OperatorState,
    pub memory: &'a mut MemoryTracker,
    pub bindings: &'a BindVariables,
}

impl RuntimeContext {
    pub(crate) fn new(
        execution_id: Uuid,
        bindings: BindVariables,
        options: ResolvedOptions,
        states: Vec<OperatorState>,
        elapsed: Duration,
    ) -> Self {
        Self {
            execution_id,
            bindings,
            memory: MemoryTracker::with_limit_mb(options.max_memory_mb),
            states,
            options,
            elapsed,
            last_token: None,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn bindings(&self) -> &BindVariables {
        &self.bindings
    }

    pub fn memory(&self) -> &MemoryTracker {
        &self.memory
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn last_token(&self) -> Option<&ContinuationToken> {
        self.last_token.as_ref()
    }

    pub(crate) fn slot(&mut self, pos: usize) -> Result<Slot<'_>> {
        let RuntimeContext {
            states,
            memory,
            bindings,
            ..
        } = self;
        let state = states.get_mut(pos).ok_or_else(|| {
            QueryError::IllegalState(format!("no operator state at position {}", pos))
        })?;
        Ok(Slot {
            state,
            memory,
            bindings,
        })
    }

    /// Remaining time before the cumulative timeout, `None` when unbounded
    pub(crate) fn remaining(&self, in_batch: Duration) -> Option<Duration> {
        self.options
            .timeout
            .map(|timeout| timeout.saturating_sub(self.elapsed + in_batch))
    }
}
