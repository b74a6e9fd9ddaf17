//! GroupBy: streaming aggregation over input sorted on the group keys
//!
//! Only the current group is held. When the key changes the finished group
//! is emitted and a new one started with the row that changed it; a key
//! that sorts before the current one means the input was not sorted and
//! fails the query.

use serde::{Deserialize, Serialize};
use shardql_plan::{AggCall, GroupKey, OperatorKind, Row, Value};
use shardql_registry::{AggregateFunction, FunctionRegistry};
use std::cmp::Ordering;

use super::sort::compare_values;
use super::{state_mismatch, Operator, OperatorState, Poll};
use crate::bind::BindVariables;
use crate::context::RuntimeContext;
use crate::error::{QueryError, Result};
use crate::expr::CompiledExpr;
use crate::memory::MemoryTracker;

const MEMORY_CONTEXT: &str = "group_by";

/// Running value of one aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "agg", rename_all = "snake_case")]
pub(crate) enum AggState {
    Sum { total: Value },
    Count { count: i64 },
    Min { value: Value },
    Max { value: Value },
    Avg {
        #[serde(with = "running_sum")]
        sum: f64,
        count: i64,
    },
    Collect { items: Vec<Value> },
}

/// Avg's running sum goes through `Value` so NaN and the infinities
/// survive a token.
mod running_sum {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use shardql_plan::Value;

    pub fn serialize<S: Serializer>(sum: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        Value::Double(*sum).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let value = Value::deserialize(deserializer)?;
        value
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom(format!("avg sum is a {}", value.type_name())))
    }
}

impl AggState {
    fn new(func: AggregateFunction) -> Self {
        match func {
            AggregateFunction::Sum => AggState::Sum { total: Value::Null },
            AggregateFunction::Count | AggregateFunction::CountStar => AggState::Count { count: 0 },
            AggregateFunction::Min => AggState::Min { value: Value::Null },
            AggregateFunction::Max => AggState::Max { value: Value::Null },
            AggregateFunction::Avg => AggState::Avg { sum: 0.0, count: 0 },
            AggregateFunction::Collect => AggState::Collect { items: Vec::new() },
        }
    }

    /// Fold one input value. `None` is a `count_star` tick.
    fn update(&mut self, input: Option<Value>) -> Result<()> {
        let Some(value) = input else {
            if let AggState::Count { count } = self {
                *count += 1;
            }
            return Ok(());
        };
        if value.is_null() {
            return Ok(());
        }

        match self {
            AggState::Sum { total } => {
                *total = add(std::mem::replace(total, Value::Null), value)?;
            }
            AggState::Count { count } => *count += 1,
            AggState::Min { value: current } => {
                if current.is_null() || value.total_cmp(current) == Ordering::Less {
                    *current = value;
                }
            }
            AggState::Max { value: current } => {
                if current.is_null() || value.total_cmp(current) == Ordering::Greater {
                    *current = value;
                }
            }
            AggState::Avg { sum, count } => {
                let x = value.as_f64().ok_or_else(|| not_numeric("avg", &value))?;
                *sum += x;
                *count += 1;
            }
            AggState::Collect { items } => items.push(value),
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        match self {
            AggState::Sum { total } => total.clone(),
            AggState::Count { count } => Value::Int(*count),
            AggState::Min { value } | AggState::Max { value } => value.clone(),
            AggState::Avg { count: 0, .. } => Value::Null,
            AggState::Avg { sum, count } => Value::Double(sum / *count as f64),
            AggState::Collect { items } => Value::Array(items.clone()),
        }
    }

    fn size_estimate(&self) -> u64 {
        match self {
            AggState::Sum { total: value }
            | AggState::Min { value }
            | AggState::Max { value } => value.size_estimate(),
            AggState::Count { .. } | AggState::Avg { .. } => 16,
            AggState::Collect { items } => 16 + items.iter().map(Value::size_estimate).sum::<u64>(),
        }
    }
}

fn not_numeric(func: &str, value: &Value) -> QueryError {
    QueryError::IllegalArgument(format!("{} over a {} value", func, value.type_name()))
}

fn add(total: Value, value: Value) -> Result<Value> {
    match (total, value) {
        (Value::Null, v) if v.is_numeric() => Ok(v),
        (Value::Int(a), Value::Int(b)) => Ok(a
            .checked_add(b)
            .map(Value::Int)
            .unwrap_or(Value::Double(a as f64 + b as f64))),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Ok(Value::Double(x + y)),
            _ => Err(not_numeric("sum", if b.is_numeric() { &a } else { &b })),
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GroupAccumulator {
    pub key: Vec<Value>,
    pub aggs: Vec<AggState>,
}

impl GroupAccumulator {
    fn size_estimate(&self) -> u64 {
        self.key.iter().map(Value::size_estimate).sum::<u64>()
            + self.aggs.iter().map(AggState::size_estimate).sum::<u64>()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct GroupState {
    pub current: Option<GroupAccumulator>,
    pub bytes: u64,
    /// Input exhausted and the last group emitted
    pub done: bool,
    pub seen_input: bool,
}

#[derive(Debug)]
pub(crate) struct CompiledAgg {
    pub name: String,
    pub func: AggregateFunction,
    pub arg: Option<CompiledExpr>,
}

#[derive(Debug)]
pub(crate) struct GroupByOp {
    pub pos: usize,
    pub input: Box<Operator>,
    pub keys: Vec<GroupKey>,
    pub aggregates: Vec<CompiledAgg>,
}

impl GroupByOp {
    pub fn new(
        pos: usize,
        input: Box<Operator>,
        keys: Vec<GroupKey>,
        aggregates: &[AggCall],
        registry: &FunctionRegistry,
    ) -> Result<Self> {
        let aggregates = aggregates
            .iter()
            .map(|call| {
                Ok(CompiledAgg {
                    name: call.name.clone(),
                    func: registry.aggregate(&call.func, call.args.len())?,
                    arg: call
                        .args
                        .first()
                        .map(|arg| CompiledExpr::compile(arg, registry))
                        .transpose()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            pos,
            input,
            keys,
            aggregates,
        })
    }

    fn key_of(&self, row: &Row) -> Vec<Value> {
        self.keys
            .iter()
            .map(|k| row.get_or_null(&k.field).clone())
            .collect()
    }

    fn compare_keys(&self, a: &[Value], b: &[Value]) -> Ordering {
        for ((key, x), y) in self.keys.iter().zip(a).zip(b) {
            let ord = compare_values(x, y, key.desc, key.nulls_first);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    fn accumulate(
        &self,
        acc: &mut GroupAccumulator,
        row: &Row,
        bindings: &BindVariables,
    ) -> Result<()> {
        for (agg, state) in self.aggregates.iter().zip(acc.aggs.iter_mut()) {
            let input = match (&agg.arg, agg.func) {
                (_, AggregateFunction::CountStar) | (None, _) => None,
                (Some(arg), _) => Some(arg.eval(row, bindings)?),
            };
            state.update(input)?;
        }
        Ok(())
    }

    fn start_group(&self, key: Vec<Value>) -> GroupAccumulator {
        GroupAccumulator {
            key,
            aggs: self.aggregates.iter().map(|a| AggState::new(a.func)).collect(),
        }
    }

    fn output(&self, acc: &GroupAccumulator) -> Row {
        let mut row = Row::with_capacity(self.keys.len() + self.aggregates.len());
        for (key, value) in self.keys.iter().zip(&acc.key) {
            row.insert(key.field.clone(), value.clone());
        }
        for (agg, state) in self.aggregates.iter().zip(&acc.aggs) {
            row.insert(agg.name.clone(), state.finish());
        }
        row
    }

    pub fn next(&self, ctx: &mut RuntimeContext) -> Result<Poll> {
        loop {
            {
                let slot = ctx.slot(self.pos)?;
                let OperatorState::GroupBy(state) = slot.state else {
                    return Err(state_mismatch(self.pos, OperatorKind::GroupBy));
                };
                if state.done {
                    return Ok(Poll::Exhausted);
                }
            }

            let polled = self.input.next(ctx)?;
            let slot = ctx.slot(self.pos)?;
            let OperatorState::GroupBy(state) = slot.state else {
                return Err(state_mismatch(self.pos, OperatorKind::GroupBy));
            };

            match polled {
                Poll::NeedInput => return Ok(Poll::NeedInput),
                Poll::Exhausted => {
                    state.done = true;
                    let finished = match state.current.take() {
                        Some(acc) => Some(self.output(&acc)),
                        // A global aggregate yields one row even without input.
                        None if self.keys.is_empty() && !state.seen_input => {
                            Some(self.output(&self.start_group(Vec::new())))
                        }
                        None => None,
                    };
                    slot.memory.release(std::mem::take(&mut state.bytes));
                    return Ok(finished.map_or(Poll::Exhausted, Poll::Row));
                }
                Poll::Row(row) => {
                    state.seen_input = true;
                    let key = self.key_of(&row);

                    let mut emitted = None;
                    let mut acc = match state.current.take() {
                        None => self.start_group(key),
                        Some(acc) => match self.compare_keys(&key, &acc.key) {
                            Ordering::Equal => acc,
                            Ordering::Greater => {
                                emitted = Some(self.output(&acc));
                                self.start_group(key)
                            }
                            Ordering::Less => {
                                return Err(QueryError::IllegalState(format!(
                                    "group by input is not sorted on {}",
                                    self.keys
                                        .iter()
                                        .map(|k| k.field.as_str())
                                        .collect::<Vec<_>>()
                                        .join(", ")
                                )));
                            }
                        },
                    };

                    self.accumulate(&mut acc, &row, slot.bindings)?;
                    resize(slot.memory, &mut state.bytes, acc.size_estimate())?;
                    state.current = Some(acc);

                    if let Some(row) = emitted {
                        return Ok(Poll::Row(row));
                    }
                }
            }
        }
    }
}

/// Move the tracked size of the current group to `new_size`
fn resize(memory: &mut MemoryTracker, tracked: &mut u64, new_size: u64) -> Result<()> {
    if new_size > *tracked {
        memory.reserve(new_size - *tracked, MEMORY_CONTEXT)?;
    } else {
        memory.release(*tracked - new_size);
    }
    *tracked = new_size;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_widens_on_overflow() {
        let mut sum = AggState::new(AggregateFunction::Sum);
        sum.update(Some(Value::Int(i64::MAX))).unwrap();
        sum.update(Some(Value::Int(1))).unwrap();
        assert!(matches!(sum.finish(), Value::Double(_)));
    }

    #[test]
    fn test_sum_rejects_strings() {
        let mut sum = AggState::new(AggregateFunction::Sum);
        sum.update(Some(Value::Int(1))).unwrap();
        assert!(matches!(
            sum.update(Some(Value::from("x"))),
            Err(QueryError::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_count_skips_nulls_but_count_star_does_not() {
        let mut count = AggState::new(AggregateFunction::Count);
        count.update(Some(Value::Null)).unwrap();
        count.update(Some(Value::Int(3))).unwrap();
        assert_eq!(count.finish(), Value::Int(1));

        let mut star = AggState::new(AggregateFunction::CountStar);
        star.update(None).unwrap();
        star.update(None).unwrap();
        assert_eq!(star.finish(), Value::Int(2));
    }

    #[test]
    fn test_min_max_avg_collect() {
        let values = [Value::Int(4), Value::Null, Value::Double(1.5), Value::Int(9)];
        let mut min = AggState::new(AggregateFunction::Min);
        let mut max = AggState::new(AggregateFunction::Max);
        let mut avg = AggState::new(AggregateFunction::Avg);
        let mut collect = AggState::new(AggregateFunction::Collect);
        for v in values {
            for agg in [&mut min, &mut max, &mut avg, &mut collect] {
                agg.update(Some(v.clone())).unwrap();
            }
        }
        assert_eq!(min.finish(), Value::Double(1.5));
        assert_eq!(max.finish(), Value::Int(9));
        assert_eq!(avg.finish(), Value::Double(14.5 / 3.0));
        assert_eq!(
            collect.finish(),
            Value::Array(vec![Value::Int(4), Value::Double(1.5), Value::Int(9)])
        );
    }

    #[test]
    fn test_avg_of_nothing_is_null() {
        assert_eq!(AggState::new(AggregateFunction::Avg).finish(), Value::Null);
    }

    #[test]
    fn test_avg_state_keeps_infinite_sum() {
        let mut avg = AggState::new(AggregateFunction::Avg);
        avg.update(Some(Value::Double(f64::INFINITY))).unwrap();
        avg.update(Some(Value::Int(1))).unwrap();

        let json = serde_json::to_string(&avg).unwrap();
        let restored: AggState = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            restored,
            AggState::Avg { sum, count: 2 } if sum == f64::INFINITY
        ));
    }
}
