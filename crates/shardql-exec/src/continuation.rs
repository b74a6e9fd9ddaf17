//! Continuation tokens
//!
//! A token is the serialized runtime context of a suspended execution:
//!
//! ```text
//! byte 0        format version
//! bytes 1..33   plan digest
//! bytes 33..65  bind variable digest
//! bytes 65..    JSON body
//! ```
//!
//! The digests pin a token to the plan and bind values it was produced
//! with. Decoding a token and encoding the result again yields the same
//! bytes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use shardql_plan::{OperatorKind, QueryPlan};
use std::fmt;
use uuid::Uuid;

use crate::bind::BindVariables;
use crate::error::{QueryError, Result};
use crate::operator::OperatorState;

pub const TOKEN_FORMAT_VERSION: u8 = 1;

const DIGEST_LEN: usize = 32;
const PLAN_DIGEST: std::ops::Range<usize> = 1..1 + DIGEST_LEN;
const BIND_DIGEST: std::ops::Range<usize> = 1 + DIGEST_LEN..1 + 2 * DIGEST_LEN;
const HEADER_LEN: usize = 1 + 2 * DIGEST_LEN;

/// Opaque resume point handed to the caller between batches
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContinuationToken(Vec<u8>);

impl ContinuationToken {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// URL-safe base64 without padding
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_base64(text: &str) -> Result<Self> {
        URL_SAFE_NO_PAD
            .decode(text.trim())
            .map(Self)
            .map_err(|e| QueryError::IllegalArgument(format!("invalid continuation token: {}", e)))
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Everything a token carries besides its header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TokenBody {
    pub execution_id: Uuid,
    pub elapsed_ms: u64,
    pub shape: Vec<OperatorKind>,
    pub states: Vec<OperatorState>,
}

pub(crate) fn encode(
    plan: &QueryPlan,
    bindings: &BindVariables,
    body: &TokenBody,
) -> Result<ContinuationToken> {
    let json = serde_json::to_vec(body)
        .map_err(|e| QueryError::IllegalState(format!("cannot encode continuation: {}", e)))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + json.len());
    bytes.push(TOKEN_FORMAT_VERSION);
    bytes.extend_from_slice(&plan.digest());
    bytes.extend_from_slice(&bindings.digest()?);
    bytes.extend_from_slice(&json);
    Ok(ContinuationToken(bytes))
}

pub(crate) fn decode(
    token: &ContinuationToken,
    plan: &QueryPlan,
    bindings: &BindVariables,
) -> Result<TokenBody> {
    let bytes = token.as_bytes();
    if bytes.len() < HEADER_LEN {
        return Err(QueryError::IllegalArgument(format!(
            "continuation token is {} bytes, expected at least {}",
            bytes.len(),
            HEADER_LEN
        )));
    }
    if bytes[0] != TOKEN_FORMAT_VERSION {
        return Err(QueryError::BadProtocolMessage(format!(
            "unsupported continuation token version {}",
            bytes[0]
        )));
    }
    if bytes[PLAN_DIGEST] != plan.digest() {
        return Err(QueryError::BadProtocolMessage(
            "continuation token was produced by a different plan".to_string(),
        ));
    }
    if bytes[BIND_DIGEST] != bindings.digest()? {
        return Err(QueryError::IllegalArgument(
            "continuation token was produced with different bind variables".to_string(),
        ));
    }

    let body: TokenBody = serde_json::from_slice(&bytes[HEADER_LEN..])
        .map_err(|e| QueryError::BadProtocolMessage(format!("corrupt continuation token: {}", e)))?;

    let shape = plan.shape();
    if body.shape != shape || body.states.len() != shape.len() {
        return Err(QueryError::IllegalArgument(format!(
            "continuation token has {} operators, plan has {}",
            body.states.len(),
            shape.len()
        )));
    }
    if let Some((pos, state)) = body
        .states
        .iter()
        .enumerate()
        .find(|(pos, state)| state.kind() != shape[*pos])
    {
        return Err(QueryError::IllegalArgument(format!(
            "continuation token holds a {} state at position {} where the plan has {}",
            state.kind(),
            pos,
            shape[pos]
        )));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardql_plan::{PlanStep, SortMode, SortSpec};

    fn plan() -> QueryPlan {
        QueryPlan::new(PlanStep::Sort {
            input: Box::new(PlanStep::Receive {
                table: "t".to_string(),
                shards: vec![1, 2],
                ordered: true,
            }),
            keys: vec![SortSpec::asc("k")],
            mode: SortMode::Merge,
        })
    }

    fn body(plan: &QueryPlan) -> TokenBody {
        TokenBody {
            execution_id: Uuid::new_v4(),
            elapsed_ms: 17,
            shape: plan.shape(),
            states: OperatorState::initial_states(plan),
        }
    }

    #[test]
    fn test_decode_then_encode_is_byte_identical() {
        let plan = plan();
        let binds = BindVariables::new();
        let token = encode(&plan, &binds, &body(&plan)).unwrap();

        let decoded = decode(&token, &plan, &binds).unwrap();
        assert_eq!(decoded.elapsed_ms, 17);
        assert_eq!(encode(&plan, &binds, &decoded).unwrap(), token);
    }

    #[test]
    fn test_header_errors() {
        let plan = plan();
        let binds = BindVariables::new();
        let token = encode(&plan, &binds, &body(&plan)).unwrap();

        let short = ContinuationToken::from_bytes(vec![1u8; 10]);
        assert!(matches!(
            decode(&short, &plan, &binds),
            Err(QueryError::IllegalArgument(_))
        ));

        let mut bytes = token.clone().into_bytes();
        bytes[0] = 9;
        assert!(matches!(
            decode(&ContinuationToken::from_bytes(bytes), &plan, &binds),
            Err(QueryError::BadProtocolMessage(_))
        ));

        let mut other_binds = BindVariables::new();
        other_binds.bind("x", 1);
        assert!(matches!(
            decode(&token, &plan, &other_binds),
            Err(QueryError::IllegalArgument(_))
        ));

        let mut bytes = token.into_bytes();
        bytes.truncate(HEADER_LEN + 3);
        assert!(matches!(
            decode(&ContinuationToken::from_bytes(bytes), &plan, &binds),
            Err(QueryError::BadProtocolMessage(_))
        ));
    }

    #[test]
    fn test_state_kind_mismatch() {
        let plan = plan();
        let binds = BindVariables::new();
        let mut body = body(&plan);
        body.states.swap(0, 1);
        let token = encode(&plan, &binds, &body).unwrap();
        assert!(matches!(
            decode(&token, &plan, &binds),
            Err(QueryError::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_base64_text_form() {
        let token = ContinuationToken::from_bytes(vec![1, 2, 250, 251]);
        let text = token.to_base64();
        assert!(!text.contains('='));
        assert_eq!(ContinuationToken::from_base64(&text).unwrap(), token);
        assert!(matches!(
            ContinuationToken::from_base64("not base64!"),
            Err(QueryError::IllegalArgument(_))
        ));
    }
}
