//! Well-known algorithm, verifier-type and payload-type identifiers.
//!
//! These strings travel over the plugin wire protocol, so they are stable
//! constants rather than enums: domains may introduce identifiers this crate
//! has never heard of.

/// ECDSA over the secp256k1 curve.
pub const ECDSA_SECP256K1: &str = "ecdsa:secp256k1";

/// Verifier type: a 20-byte Ethereum address, `0x`-prefixed lowercase hex.
pub const VERIFIER_ETH_ADDRESS: &str = "eth_address";

/// Payload type: opaque bytes, signed as `keccak256(payload)`, signature
/// returned as 65 bytes `r ‖ s ‖ v`.
pub const PAYLOAD_OPAQUE_RSV: &str = "opaque:rsv";
