//! The key manager: hierarchical identifier resolution over a signing module.
//!
//! The manager records the folder/key tree it has resolved so far. Indexes
//! are handed out monotonically per folder and never reused; a key that
//! resolves again for a new algorithm keeps its index and handle and gains an
//! identifier.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{KeyError, Result};
use crate::signer::{
    KeyPathSegment, ResolveKeyRequest, SignRequest, SignResponse, SigningModule,
};

// ═══════════════════════════════════════════════════════════════════════════════
// TREE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct KeyFolder {
    /// Count of children (folders and keys) for index assignment.
    children: u64,
    keys: HashMap<String, KeyMapping>,
    folders: HashMap<String, KeyFolder>,
    /// Index of this folder within its parent.
    index: u64,
}

#[derive(Debug)]
struct KeyMapping {
    index: u64,
    key_handle: String,
    /// algorithm → verifier
    identifiers: HashMap<String, String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESOLVER PORT
// ═══════════════════════════════════════════════════════════════════════════════

/// The engine-facing contract: resolve identifiers, sign payloads.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// Resolve `identifier` for `algorithm`, returning `(key_handle, verifier)`.
    async fn resolve_key(&self, identifier: &str, algorithm: &str) -> Result<(String, String)>;

    /// Sign a payload with a previously resolved key.
    async fn sign(&self, request: SignRequest) -> Result<SignResponse>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// KEY MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

/// Hierarchical key manager over a [`SigningModule`].
#[derive(Debug)]
pub struct KeyManager<S> {
    signing: S,
    root: Mutex<KeyFolder>,
}

impl<S: SigningModule> KeyManager<S> {
    /// Create a manager over a signing module.
    pub fn new(signing: S) -> Self {
        Self {
            signing,
            root: Mutex::new(KeyFolder::default()),
        }
    }

    /// The wrapped signing module.
    pub fn signing_module(&self) -> &S {
        &self.signing
    }
}

#[async_trait]
impl<S: SigningModule> KeyResolver for KeyManager<S> {
    async fn resolve_key(&self, identifier: &str, algorithm: &str) -> Result<(String, String)> {
        let segments: Vec<&str> = identifier.split('/').collect();
        if identifier.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(KeyError::IdentifierInvalid(identifier.to_string()));
        }

        let mut root = self.root.lock().await;
        let mut resolve_path = Vec::with_capacity(segments.len());

        // Walk (and lazily create) the folder chain
        let mut loc = &mut *root;
        for &segment in &segments[..segments.len() - 1] {
            if !loc.folders.contains_key(segment) {
                let index = loc.children;
                loc.children += 1;
                loc.folders.insert(
                    segment.to_string(),
                    KeyFolder {
                        index,
                        ..KeyFolder::default()
                    },
                );
            }
            let Some(folder) = loc.folders.get_mut(segment) else {
                return Err(KeyError::IdentifierInvalid(identifier.to_string()));
            };
            resolve_path.push(KeyPathSegment {
                name: segment.to_string(),
                index: folder.index,
            });
            loc = folder;
        }

        let key_name = segments[segments.len() - 1];
        let needs_resolve = match loc.keys.get(key_name) {
            None => true,
            Some(key) => !key.identifiers.contains_key(algorithm),
        };

        if needs_resolve {
            let key_index = loc
                .keys
                .get(key_name)
                .map_or(loc.children, |k| k.index);
            let mut path = resolve_path.clone();
            path.push(KeyPathSegment {
                name: key_name.to_string(),
                index: key_index,
            });
            let resolved = self
                .signing
                .resolve(ResolveKeyRequest {
                    algorithms: vec![algorithm.to_string()],
                    path,
                })
                .await?;

            match loc.keys.get_mut(key_name) {
                None => {
                    debug!(identifier, handle = %resolved.key_handle, "new key resolved");
                    let mut identifiers = HashMap::new();
                    for id in &resolved.identifiers {
                        identifiers.insert(id.algorithm.clone(), id.verifier.clone());
                    }
                    loc.keys.insert(
                        key_name.to_string(),
                        KeyMapping {
                            index: key_index,
                            key_handle: resolved.key_handle,
                            identifiers,
                        },
                    );
                    loc.children += 1;
                }
                Some(key) => {
                    if resolved.key_handle != key.key_handle {
                        return Err(KeyError::HandleMismatch {
                            identifier: identifier.to_string(),
                            expected: key.key_handle.clone(),
                            received: resolved.key_handle,
                        });
                    }
                    for id in &resolved.identifiers {
                        key.identifiers
                            .insert(id.algorithm.clone(), id.verifier.clone());
                    }
                }
            }
        }

        let Some(key) = loc.keys.get(key_name) else {
            return Err(KeyError::VerifierUnavailable(algorithm.to_string()));
        };
        let verifier = key
            .identifiers
            .get(algorithm)
            .ok_or_else(|| KeyError::VerifierUnavailable(algorithm.to_string()))?;
        Ok((key.key_handle.clone(), verifier.clone()))
    }

    async fn sign(&self, request: SignRequest) -> Result<SignResponse> {
        self.signing.sign(request).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::ECDSA_SECP256K1;
    use crate::signer::{InMemorySigningModule, KeyIdentifier, ResolvedKey};
    use alloy::primitives::B256;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn manager() -> KeyManager<InMemorySigningModule> {
        KeyManager::new(InMemorySigningModule::new(B256::repeat_byte(0x01)))
    }

    #[tokio::test]
    async fn identical_identifiers_resolve_to_same_handle() {
        let km = manager();
        let (h1, v1) = km.resolve_key("treasury/alice", ECDSA_SECP256K1).await.unwrap();
        let (h2, v2) = km.resolve_key("treasury/alice", ECDSA_SECP256K1).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(v1, v2);
        assert_eq!(h1, "treasury/alice");
    }

    #[tokio::test]
    async fn nested_folders_are_created_lazily() {
        let km = manager();
        let (handle, _) = km.resolve_key("a/b/c", ECDSA_SECP256K1).await.unwrap();
        assert_eq!(handle, "a/b/c");

        // sibling under the same folder chain
        let (sibling, _) = km.resolve_key("a/b/d", ECDSA_SECP256K1).await.unwrap();
        assert_eq!(sibling, "a/b/d");
    }

    #[tokio::test]
    async fn empty_segments_are_rejected() {
        let km = manager();
        assert!(matches!(
            km.resolve_key("", ECDSA_SECP256K1).await,
            Err(KeyError::IdentifierInvalid(_))
        ));
        assert!(matches!(
            km.resolve_key("a//b", ECDSA_SECP256K1).await,
            Err(KeyError::IdentifierInvalid(_))
        ));
    }

    /// A signing module that returns a fresh handle on every resolve,
    /// simulating a corrupted backing store.
    #[derive(Debug, Default)]
    struct UnstableModule {
        counter: AtomicU64,
    }

    #[async_trait]
    impl SigningModule for UnstableModule {
        async fn resolve(&self, request: ResolveKeyRequest) -> Result<ResolvedKey> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(ResolvedKey {
                key_handle: format!("handle-{n}"),
                identifiers: request
                    .algorithms
                    .iter()
                    .map(|a| KeyIdentifier {
                        algorithm: a.clone(),
                        verifier_type: "test".into(),
                        verifier: format!("verifier-{n}"),
                    })
                    .collect(),
            })
        }

        async fn sign(&self, _request: SignRequest) -> Result<SignResponse> {
            Ok(SignResponse { signature: vec![] })
        }
    }

    #[tokio::test]
    async fn changed_handle_is_fatal() {
        let km = KeyManager::new(UnstableModule::default());
        km.resolve_key("alice", ECDSA_SECP256K1).await.unwrap();
        // Second resolve for a *different* algorithm re-contacts the module,
        // which now reports a different handle
        let err = km.resolve_key("alice", "other:algo").await.unwrap_err();
        assert!(matches!(err, KeyError::HandleMismatch { .. }));
    }
}
