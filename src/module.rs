//! Module Definitions
//!
//! Artifacts in the code store are JSON documents naming a statically linked
//! implementation (`kind`) and its configuration (`params`). The coordinator resolves
//! job logic through a `JobFactoryRegistry`, workers resolve task functions through a
//! `TaskWorkerRegistry`; both are keyed by `kind`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

impl ModuleDefinition {
    pub fn new(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}
