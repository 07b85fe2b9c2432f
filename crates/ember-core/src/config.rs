use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Registry and autograd settings for a [`Context`](crate::Context).
///
/// Every field has a default, so a JSON document only needs the keys it
/// wants to override:
///
/// ```ignore
/// let cfg = EngineConfig::from_json(r#"{ "first_id": 100 }"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// First id handed out by the registry (default: 1).
    pub first_id: u64,
    /// Whether derived tensors without `keepgrads` drop their gradient once
    /// it has been propagated into their creators (default: true).
    /// Leaves always keep their gradient.
    pub release_intermediate_grads: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            first_id: 1,
            release_intermediate_grads: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json(src: &str) -> Result<Self> {
        Ok(serde_json::from_str(src)?)
    }

    pub fn with_first_id(mut self, first_id: u64) -> Self {
        self.first_id = first_id;
        self
    }

    pub fn with_release_intermediate_grads(mut self, release: bool) -> Self {
        self.release_intermediate_grads = release;
        self
    }
}
