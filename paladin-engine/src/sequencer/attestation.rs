//! Attestation gathering.
//!
//! For each SIGN request in the plan, every listed party's key is resolved
//! and the payload signed, in deterministic (request, party) order.
//! Duplicate results for the same `(name, verifier)` pair are idempotent;
//! conflicting payloads for the same pair are fatal.

use tracing::debug;

use paladin_keys::{KeyResolver, SignRequest};
use paladin_plugin::pb;

use crate::error::{EngineError, Result};

/// Collect outstanding signatures for a plan into `results`.
///
/// Returns `true` if any new result was added.
pub async fn gather_signatures(
    resolver: &dyn KeyResolver,
    plan: &[pb::AttestationRequest],
    results: &mut Vec<pb::AttestationResult>,
) -> Result<bool> {
    let mut changed = false;
    for request in plan {
        if request.attestation_type() != pb::AttestationType::Sign {
            continue;
        }
        for party in &request.parties {
            let (key_handle, verifier) =
                resolver.resolve_key(party, &request.algorithm).await?;

            if let Some(existing) = find_result(results, &request.name, &verifier) {
                // Re-entry with the same inputs is idempotent; a different
                // payload for the same (name, verifier) can only be a
                // conflicting duplicate from elsewhere.
                let response = resolver
                    .sign(SignRequest {
                        key_handle,
                        algorithm: request.algorithm.clone(),
                        payload_type: request.payload_type.clone(),
                        payload: request.payload.clone(),
                    })
                    .await?;
                if existing.payload != response.signature {
                    return Err(EngineError::AttestationConflict(request.name.clone()));
                }
                continue;
            }

            let response = resolver
                .sign(SignRequest {
                    key_handle,
                    algorithm: request.algorithm.clone(),
                    payload_type: request.payload_type.clone(),
                    payload: request.payload.clone(),
                })
                .await?;
            debug!(attestation = %request.name, party = %party, "signature collected");
            results.push(pb::AttestationResult {
                name: request.name.clone(),
                attestation_type: pb::AttestationType::Sign as i32,
                verifier: Some(pb::ResolvedVerifier {
                    lookup: party.clone(),
                    algorithm: request.algorithm.clone(),
                    verifier_type: request.verifier_type.clone(),
                    verifier,
                }),
                payload: response.signature,
            });
            changed = true;
        }
    }
    Ok(changed)
}

fn find_result<'a>(
    results: &'a [pb::AttestationResult],
    name: &str,
    verifier: &str,
) -> Option<&'a pb::AttestationResult> {
    results.iter().find(|r| {
        r.name == name
            && r.verifier
                .as_ref()
                .is_some_and(|v| v.verifier == verifier)
    })
}

/// Resolve the verifiers a domain named at init time.
pub async fn resolve_verifiers(
    resolver: &dyn KeyResolver,
    required: &[pb::ResolveVerifierRequest],
) -> Result<Vec<pb::ResolvedVerifier>> {
    let mut resolved = Vec::with_capacity(required.len());
    for request in required {
        let (_, verifier) = resolver.resolve_key(&request.lookup, &request.algorithm).await?;
        resolved.push(pb::ResolvedVerifier {
            lookup: request.lookup.clone(),
            algorithm: request.algorithm.clone(),
            verifier_type: request.verifier_type.clone(),
            verifier,
        });
    }
    Ok(resolved)
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;
    use paladin_keys::{algorithms, InMemorySigningModule, KeyManager};

    fn sign_request(name: &str, parties: &[&str]) -> pb::AttestationRequest {
        pb::AttestationRequest {
            name: name.into(),
            attestation_type: pb::AttestationType::Sign as i32,
            algorithm: algorithms::ECDSA_SECP256K1.into(),
            verifier_type: algorithms::VERIFIER_ETH_ADDRESS.into(),
            payload_type: algorithms::PAYLOAD_OPAQUE_RSV.into(),
            payload: b"payload".to_vec(),
            parties: parties.iter().map(ToString::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn gathering_is_idempotent() {
        let resolver = KeyManager::new(InMemorySigningModule::new(B256::repeat_byte(9)));
        let plan = vec![sign_request("sender", &["alice"])];
        let mut results = Vec::new();

        assert!(gather_signatures(&resolver, &plan, &mut results).await.unwrap());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].payload.len(), 65);

        // Second pass adds nothing and changes nothing
        assert!(!gather_signatures(&resolver, &plan, &mut results).await.unwrap());
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn conflicting_duplicate_is_fatal() {
        let resolver = KeyManager::new(InMemorySigningModule::new(B256::repeat_byte(9)));
        let plan = vec![sign_request("sender", &["alice"])];
        let mut results = Vec::new();
        gather_signatures(&resolver, &plan, &mut results).await.unwrap();

        // Corrupt the recorded signature; the next pass detects the clash
        results[0].payload[0] ^= 0xFF;
        let err = gather_signatures(&resolver, &plan, &mut results)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AttestationConflict(_)));
    }

    #[tokio::test]
    async fn endorse_requests_are_skipped() {
        let resolver = KeyManager::new(InMemorySigningModule::new(B256::repeat_byte(9)));
        let mut endorse = sign_request("notary", &["notary"]);
        endorse.attestation_type = pb::AttestationType::Endorse as i32;
        let mut results = Vec::new();
        assert!(!gather_signatures(&resolver, &[endorse], &mut results).await.unwrap());
        assert!(results.is_empty());
    }
}
