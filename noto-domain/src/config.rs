//! Noto configuration and schema constants.

use serde::{Deserialize, Serialize};

use crate::error::{NotoError, Result};

/// The coin schema definition handed to the engine at configure time.
///
/// `owner` and `amount` are labelled so coin selection can query on them;
/// `salt` is the uniqueness nonce and stays unlabelled.
pub const NOTO_COIN_SCHEMA_JSON: &str = r#"{
    "name": "NotoCoin",
    "type": "tuple",
    "internalType": "struct NotoCoin",
    "components": [
        {"name": "salt", "type": "bytes32"},
        {"name": "owner", "type": "address", "indexed": true},
        {"name": "amount", "type": "uint256", "indexed": true}
    ]
}"#;

/// ABI of the events Noto's settlement contract emits.
pub const NOTO_EVENTS_ABI_JSON: &str = r#"[
    {
        "type": "event",
        "name": "NotoTransfer",
        "inputs": [
            {"name": "inputs", "type": "bytes32[]"},
            {"name": "outputs", "type": "bytes32[]"},
            {"name": "data", "type": "bytes"}
        ]
    }
]"#;

/// Key prefix for one-time-use submission keys.
pub const ONE_TIME_USE_PREFIX: &str = "oneuse/";

// ═══════════════════════════════════════════════════════════════════════════════
// CONTRACT CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-contract Noto configuration, captured as config bytes at deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotoConfig {
    /// Identity lookup of the notary for this token.
    pub notary: String,
    /// Whether holders may burn their coins.
    #[serde(default = "default_true")]
    pub allow_burn: bool,
    /// Whether only the notary may mint.
    #[serde(default = "default_true")]
    pub restrict_mint: bool,
}

const fn default_true() -> bool {
    true
}

impl NotoConfig {
    /// Parse from the JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| NotoError::ConfigInvalid(e.to_string()))?;
        if config.notary.is_empty() {
            return Err(NotoError::ConfigInvalid("notary must be set".into()));
        }
        Ok(config)
    }

    /// Parse from hex-encoded config bytes as carried on the wire.
    pub fn from_config_hex(config_hex: &str) -> Result<Self> {
        let raw = hex::decode(config_hex.trim_start_matches("0x"))
            .map_err(|e| NotoError::ConfigInvalid(format!("config bytes not hex: {e}")))?;
        let json = String::from_utf8(raw)
            .map_err(|e| NotoError::ConfigInvalid(format!("config bytes not utf-8: {e}")))?;
        Self::from_json(&json)
    }

    /// Render as the hex config bytes embedded in a deployment.
    #[must_use]
    pub fn to_config_hex(&self) -> String {
        // serde_json can only fail on non-string-keyed maps; this shape is fixed
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("0x{}", hex::encode(json.as_bytes()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
