//! Bind variable values supplied by the caller

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shardql_plan::{Value, VarRef};
use std::collections::BTreeMap;

use crate::error::{QueryError, Result};

/// Values bound to a prepared statement's external variables.
///
/// Names are stored without a leading `$`, so `$id` and `id` bind the same
/// variable. Positions are 1-based.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindVariables {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    named: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    positional: BTreeMap<u32, Value>,
}

impl BindVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.named
            .insert(name.trim_start_matches('$').to_string(), value.into());
        self
    }

    pub fn bind_position(&mut self, position: u32, value: impl Into<Value>) -> Result<&mut Self> {
        if position == 0 {
            return Err(QueryError::IllegalArgument(
                "bind variable positions start at 1".to_string(),
            ));
        }
        self.positional.insert(position, value.into());
        Ok(self)
    }

    pub fn get(&self, var: &VarRef) -> Option<&Value> {
        match var {
            VarRef::Name(name) => self.named.get(name.trim_start_matches('$')),
            VarRef::Position(pos) => self.positional.get(pos),
        }
    }

    pub fn resolve(&self, var: &VarRef) -> Result<&Value> {
        if matches!(var, VarRef::Position(0)) {
            return Err(QueryError::IllegalArgument(
                "bind variable positions start at 1".to_string(),
            ));
        }
        self.get(var).ok_or_else(|| {
            QueryError::IllegalArgument(format!("bind variable {} is not bound", var))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty() && self.positional.is_empty()
    }

    /// SHA-256 over the canonical encoding; ties continuation tokens to the
    /// values they were produced with.
    pub fn digest(&self) -> Result<[u8; 32]> {
        let json = serde_json::to_string(self).map_err(|e| {
            QueryError::IllegalState(format!("cannot encode bind variables: {}", e))
        })?;
        Ok(Sha256::digest(json.as_bytes()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_by_name_and_position() {
        let mut binds = BindVariables::new();
        binds.bind("$region", "EU");
        binds.bind_position(1, 42).unwrap();

        assert_eq!(
            binds.resolve(&VarRef::Name("region".into())).unwrap(),
            &Value::from("EU")
        );
        assert_eq!(binds.resolve(&VarRef::Position(1)).unwrap(), &Value::Int(42));
        assert!(matches!(
            binds.resolve(&VarRef::Position(2)),
            Err(QueryError::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_position_zero_rejected() {
        let mut binds = BindVariables::new();
        assert!(binds.bind_position(0, 1).is_err());
        assert!(binds.resolve(&VarRef::Position(0)).is_err());
    }

    #[test]
    fn test_digest_tracks_values() {
        let mut a = BindVariables::new();
        a.bind("x", 1);
        let mut b = BindVariables::new();
        b.bind("x", 2);

        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap(), a.clone().digest().unwrap());
    }
}
