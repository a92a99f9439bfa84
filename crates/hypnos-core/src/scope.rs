//! Consolidation scope.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// The slice of memory an operation works on: a namespace, optionally
/// narrowed to one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Scope {
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            session_id: None,
        }
    }

    pub fn session(namespace: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            session_id: Some(session_id.into()),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.namespace.trim().is_empty() {
            return Err(EngineError::validation("scope namespace must not be empty"));
        }
        if self.namespace.contains('/') {
            return Err(EngineError::validation("scope namespace must not contain '/'"));
        }
        if matches!(&self.session_id, Some(s) if s.trim().is_empty()) {
            return Err(EngineError::validation("scope session_id must not be empty"));
        }
        Ok(())
    }

    /// Key of the consolidation lease guarding this scope.
    pub fn lock_key(&self) -> String {
        match &self.session_id {
            Some(session) => format!("{}/{}", self.namespace, session),
            None => self.namespace.clone(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lock_key())
    }
}
