//! ABI bindings and entry constants for the Noto settlement contract.
//!
//! The settlement contract only ever sees masked data: state IDs, a sender
//! signature, and an opaque `data` field carrying the private transaction ID
//! for completion tracking.

use alloy::sol;

sol! {
    /// Emitted by the settlement contract when a masked transfer lands.
    ///
    /// `inputs` are the spent state IDs, `outputs` the confirmed ones, and
    /// `data` carries the private transaction ID.
    #[derive(Debug, PartialEq, Eq)]
    event NotoTransfer(
        bytes32[] inputs,
        bytes32[] outputs,
        bytes data
    );
}

/// ABI entry of the settlement `transfer` function invoked at prepare time.
pub const TRANSFER_FN_ABI_JSON: &str = r#"{
    "type": "function",
    "name": "transfer",
    "inputs": [
        {"name": "txId", "type": "bytes32"},
        {"name": "inputs", "type": "bytes32[]"},
        {"name": "outputs", "type": "bytes32[]"},
        {"name": "signature", "type": "bytes"},
        {"name": "data", "type": "bytes"}
    ]
}"#;

/// ABI entry of the registry factory function invoked to deploy a token.
pub const DEPLOY_FN_ABI_JSON: &str = r#"{
    "type": "function",
    "name": "deployNoto",
    "inputs": [
        {"name": "txId", "type": "bytes32"},
        {"name": "notary", "type": "address"},
        {"name": "config", "type": "bytes"}
    ]
}"#;

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolEvent;

    #[test]
    fn event_signature_matches_published_abi() {
        // The events ABI handed to the engine and the sol! binding must
        // describe the same event
        assert_eq!(
            NotoTransfer::SIGNATURE,
            "NotoTransfer(bytes32[],bytes32[],bytes)"
        );
        let abi: serde_json::Value =
            serde_json::from_str(crate::config::NOTO_EVENTS_ABI_JSON).unwrap();
        assert_eq!(abi[0]["name"], "NotoTransfer");
        assert_eq!(abi[0]["inputs"][0]["type"], "bytes32[]");
    }

    #[test]
    fn function_entries_parse() {
        for entry in [TRANSFER_FN_ABI_JSON, DEPLOY_FN_ABI_JSON] {
            let parsed: serde_json::Value = serde_json::from_str(entry).unwrap();
            assert_eq!(parsed["type"], "function");
        }
    }
}
