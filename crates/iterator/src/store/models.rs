use serde::{Deserialize, Serialize};

use crate::Result;

/// The record tying a fingerprint to the module path its run operated on,
/// persisted after a Runner completes and consumed by the resolve path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedBinding {
    pub fingerprint: String,
    pub module: String,
    #[serde(default)]
    pub terraform_scheduling: String,
}

impl PersistedBinding {
    pub fn is_sawtooth(&self) -> bool {
        self.terraform_scheduling == "sawtooth"
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
