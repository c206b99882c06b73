//! The signing module port and its in-memory secp256k1 implementation.
//!
//! A signing module owns key material. The key manager never sees private
//! keys - it exchanges resolve/sign requests with the module and records only
//! handles and verifiers.

use alloy::primitives::{keccak256, Address, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;

use crate::algorithms;
use crate::error::{KeyError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// WIRE TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// One segment of a resolution path, with the index assigned by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPathSegment {
    /// Segment name.
    pub name: String,
    /// Monotone index within the parent folder.
    pub index: u64,
}

/// Request to resolve a key at a path for a set of algorithms.
#[derive(Debug, Clone)]
pub struct ResolveKeyRequest {
    /// Algorithms that need verifiers.
    pub algorithms: Vec<String>,
    /// Full path, folders first, key segment last.
    pub path: Vec<KeyPathSegment>,
}

/// One algorithm-specific identifier of a resolved key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIdentifier {
    /// The algorithm the verifier belongs to.
    pub algorithm: String,
    /// The verifier's type, e.g. an Ethereum address.
    pub verifier_type: String,
    /// The verifier value.
    pub verifier: String,
}

/// A resolved key.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    /// Opaque handle the module uses to find the key again.
    pub key_handle: String,
    /// Verifiers per requested algorithm.
    pub identifiers: Vec<KeyIdentifier>,
}

/// Request to sign a payload with a resolved key.
#[derive(Debug, Clone)]
pub struct SignRequest {
    /// Handle from a prior resolve.
    pub key_handle: String,
    /// Signing algorithm.
    pub algorithm: String,
    /// How the payload is to be interpreted.
    pub payload_type: String,
    /// The payload bytes.
    pub payload: Vec<u8>,
}

/// A produced signature.
#[derive(Debug, Clone)]
pub struct SignResponse {
    /// Signature bytes; layout is defined by the payload type.
    pub signature: Vec<u8>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Owns key material; resolves paths to handles and signs payloads.
#[async_trait]
pub trait SigningModule: Send + Sync + 'static {
    /// Resolve the key at `path`, establishing verifiers for the requested
    /// algorithms. Must be deterministic: the same path always yields the
    /// same handle.
    async fn resolve(&self, request: ResolveKeyRequest) -> Result<ResolvedKey>;

    /// Sign a payload with a previously resolved key.
    async fn sign(&self, request: SignRequest) -> Result<SignResponse>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-MEMORY MODULE
// ═══════════════════════════════════════════════════════════════════════════════

/// Deterministic in-memory secp256k1 signing module.
///
/// Every key is derived from the root seed by folding path segment names:
/// `seed' = keccak256(seed ‖ "/" ‖ name)`. The leaf seed is rehashed until it
/// is a valid curve scalar. The key handle is the joined path, which makes
/// handles stable and human-readable.
#[derive(Debug, Clone)]
pub struct InMemorySigningModule {
    seed: B256,
}

impl InMemorySigningModule {
    /// Create a module from a 32-byte root seed.
    #[must_use]
    pub const fn new(seed: B256) -> Self {
        Self { seed }
    }

    fn derive(&self, handle: &str) -> Result<PrivateKeySigner> {
        if handle.is_empty() {
            return Err(KeyError::IdentifierInvalid("empty key handle".into()));
        }
        let mut seed = self.seed;
        for segment in handle.split('/') {
            let mut preimage = Vec::with_capacity(33 + segment.len());
            preimage.extend_from_slice(seed.as_slice());
            preimage.push(b'/');
            preimage.extend_from_slice(segment.as_bytes());
            seed = keccak256(&preimage);
        }
        // Rehash until the bytes form a valid secp256k1 scalar. One round is
        // almost always enough; the loop is bounded for safety.
        for _ in 0..128 {
            if let Ok(signer) = PrivateKeySigner::from_bytes(&seed) {
                return Ok(signer);
            }
            seed = keccak256(seed.as_slice());
        }
        Err(KeyError::SigningFailed(format!(
            "could not derive scalar for {handle:?}"
        )))
    }
}

#[async_trait]
impl SigningModule for InMemorySigningModule {
    async fn resolve(&self, request: ResolveKeyRequest) -> Result<ResolvedKey> {
        if request.path.is_empty() {
            return Err(KeyError::IdentifierInvalid("empty resolution path".into()));
        }
        let key_handle = request
            .path
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join("/");
        let signer = self.derive(&key_handle)?;

        let mut identifiers = Vec::with_capacity(request.algorithms.len());
        for algorithm in &request.algorithms {
            if algorithm != algorithms::ECDSA_SECP256K1 {
                return Err(KeyError::AlgorithmUnsupported(algorithm.clone()));
            }
            identifiers.push(KeyIdentifier {
                algorithm: algorithm.clone(),
                verifier_type: algorithms::VERIFIER_ETH_ADDRESS.to_string(),
                verifier: format!("{:#x}", signer.address()),
            });
        }
        Ok(ResolvedKey {
            key_handle,
            identifiers,
        })
    }

    async fn sign(&self, request: SignRequest) -> Result<SignResponse> {
        if request.algorithm != algorithms::ECDSA_SECP256K1 {
            return Err(KeyError::AlgorithmUnsupported(request.algorithm));
        }
        if request.payload_type != algorithms::PAYLOAD_OPAQUE_RSV {
            return Err(KeyError::PayloadTypeUnsupported(request.payload_type));
        }
        let signer = self.derive(&request.key_handle)?;
        let digest = keccak256(&request.payload);
        let signature = signer
            .sign_hash_sync(&digest)
            .map_err(|e| KeyError::SigningFailed(e.to_string()))?;
        Ok(SignResponse {
            signature: signature.as_bytes().to_vec(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECOVERY
// ═══════════════════════════════════════════════════════════════════════════════

/// Recover the signing Ethereum address from an `opaque:rsv` signature.
///
/// The inverse of [`InMemorySigningModule::sign`]: the payload is digested
/// with keccak256 and the 65-byte `r ‖ s ‖ v` signature recovered against it.
pub fn recover_opaque_rsv(payload: &[u8], signature: &[u8]) -> Result<Address> {
    let signature = alloy::primitives::Signature::try_from(signature)
        .map_err(|e| KeyError::SignatureInvalid(e.to_string()))?;
    let digest = keccak256(payload);
    signature
        .recover_address_from_prehash(&digest)
        .map_err(|e| KeyError::SignatureInvalid(e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> InMemorySigningModule {
        InMemorySigningModule::new(B256::repeat_byte(0x5e))
    }

    fn path(names: &[&str]) -> Vec<KeyPathSegment> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| KeyPathSegment {
                name: (*name).to_string(),
                index: i as u64,
            })
            .collect()
    }

    #[tokio::test]
    async fn resolution_is_deterministic() {
        let module = module();
        let request = ResolveKeyRequest {
            algorithms: vec![crate::algorithms::ECDSA_SECP256K1.to_string()],
            path: path(&["treasury", "alice"]),
        };
        let first = module.resolve(request.clone()).await.unwrap();
        let second = module.resolve(request).await.unwrap();
        assert_eq!(first.key_handle, "treasury/alice");
        assert_eq!(first.key_handle, second.key_handle);
        assert_eq!(first.identifiers, second.identifiers);
    }

    #[tokio::test]
    async fn distinct_paths_get_distinct_keys() {
        let module = module();
        let a = module
            .resolve(ResolveKeyRequest {
                algorithms: vec![crate::algorithms::ECDSA_SECP256K1.to_string()],
                path: path(&["alice"]),
            })
            .await
            .unwrap();
        let b = module
            .resolve(ResolveKeyRequest {
                algorithms: vec![crate::algorithms::ECDSA_SECP256K1.to_string()],
                path: path(&["bob"]),
            })
            .await
            .unwrap();
        assert_ne!(a.identifiers[0].verifier, b.identifiers[0].verifier);
    }

    #[tokio::test]
    async fn sign_then_recover_yields_verifier() {
        let module = module();
        let resolved = module
            .resolve(ResolveKeyRequest {
                algorithms: vec![crate::algorithms::ECDSA_SECP256K1.to_string()],
                path: path(&["alice"]),
            })
            .await
            .unwrap();

        let payload = b"transfer 500 coins".to_vec();
        let response = module
            .sign(SignRequest {
                key_handle: resolved.key_handle.clone(),
                algorithm: crate::algorithms::ECDSA_SECP256K1.to_string(),
                payload_type: crate::algorithms::PAYLOAD_OPAQUE_RSV.to_string(),
                payload: payload.clone(),
            })
            .await
            .unwrap();
        assert_eq!(response.signature.len(), 65);

        let recovered = recover_opaque_rsv(&payload, &response.signature).unwrap();
        assert_eq!(format!("{recovered:#x}"), resolved.identifiers[0].verifier);
    }

    #[tokio::test]
    async fn unsupported_algorithm_is_rejected() {
        let module = module();
        let err = module
            .resolve(ResolveKeyRequest {
                algorithms: vec!["bls:12-381".to_string()],
                path: path(&["alice"]),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KeyError::AlgorithmUnsupported(_)));
    }
}
