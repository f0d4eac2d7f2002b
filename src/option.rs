//! Script Filter Option

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptFilterOption {
    pub inline_code: String,
}
