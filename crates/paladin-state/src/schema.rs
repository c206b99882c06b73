//! Schema definitions, canonical signatures and content-addressed IDs.
//!
//! A schema describes one class of state record in a domain, shaped like an
//! ABI tuple parameter. Two properties drive everything else:
//!
//! - the **signature** is a deterministic canonical rendering of the
//!   definition, so semantically-equal schemas collapse to one row;
//! - the **ID** is `keccak256(signature)`, so the ID is stable across nodes
//!   without coordination.
//!
//! Fields marked `indexed` are the *labels*: the only fields a
//! [`crate::query::StateQuery`] may reference.

use alloy::primitives::{keccak256, B256};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};

// ═══════════════════════════════════════════════════════════════════════════════
// DEFINITION
// ═══════════════════════════════════════════════════════════════════════════════

/// One field of a schema definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Field name, unique within the schema.
    pub name: String,
    /// Solidity-style type string, e.g. `uint256`, `address`, `bytes32`.
    #[serde(rename = "type")]
    pub field_type: String,
    /// Whether the field is a queryable label.
    #[serde(default)]
    pub indexed: bool,
}

/// An ABI-parameter-shaped schema definition, as supplied by a domain in its
/// `ConfigureDomain` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDef {
    /// Type name of the state record, e.g. `NotoCoin`.
    pub name: String,
    /// Must be `tuple`.
    #[serde(rename = "type")]
    pub param_type: String,
    /// Optional language-level type, e.g. `struct NotoCoin`.
    #[serde(rename = "internalType", default, skip_serializing_if = "Option::is_none")]
    pub internal_type: Option<String>,
    /// The record's fields.
    #[serde(default)]
    pub components: Vec<SchemaField>,
}

impl SchemaDef {
    /// Parse a definition from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        let def: Self = serde_json::from_str(json)
            .map_err(|e| StateError::SchemaInvalid(format!("malformed definition: {e}")))?;
        def.validate()?;
        Ok(def)
    }

    /// Validate structural constraints before a signature can be built.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StateError::SchemaInvalid("empty type name".into()));
        }
        if self.param_type != "tuple" {
            return Err(StateError::SchemaInvalid(format!(
                "expected tuple parameter, got {:?}",
                self.param_type
            )));
        }
        if self.components.is_empty() {
            return Err(StateError::SchemaInvalid("no components".into()));
        }
        for field in &self.components {
            if field.name.is_empty() || field.field_type.is_empty() {
                return Err(StateError::SchemaInvalid(format!(
                    "component of {} missing name or type",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// The canonical signature of this definition.
    ///
    /// Format: `type=Name(type1 field1,type2 field2,...),labels=[a,b]`.
    /// Whitespace and field order are normative; two definitions with the
    /// same signature are the same schema.
    #[must_use]
    pub fn signature(&self) -> String {
        let fields = self
            .components
            .iter()
            .map(|f| format!("{} {}", f.field_type, f.name))
            .collect::<Vec<_>>()
            .join(",");
        let labels = self
            .components
            .iter()
            .filter(|f| f.indexed)
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        format!("type={}({fields}),labels=[{labels}]", self.name)
    }

    /// Names of the queryable (indexed) fields.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|f| f.indexed)
            .map(|f| f.name.as_str())
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDED SCHEMA
// ═══════════════════════════════════════════════════════════════════════════════

/// A schema as recorded in the store: definition plus derived identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Content-addressed ID: `keccak256(signature)`.
    pub id: B256,
    /// The domain the schema belongs to.
    pub domain: String,
    /// Canonical signature (unique per domain).
    pub signature: String,
    /// The parsed definition.
    pub definition: SchemaDef,
}

impl Schema {
    /// Build a schema from a validated definition.
    pub fn parse(domain: &str, definition: SchemaDef) -> Result<Self> {
        definition.validate()?;
        let signature = definition.signature();
        Ok(Self {
            id: keccak256(signature.as_bytes()),
            domain: domain.to_string(),
            signature,
            definition,
        })
    }

    /// The schema ID as a `0x`-prefixed hex string.
    #[must_use]
    pub fn id_string(&self) -> String {
        format!("0x{}", hex::encode(self.id))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn coin_def() -> SchemaDef {
        SchemaDef {
            name: "NotoCoin".into(),
            param_type: "tuple".into(),
            internal_type: Some("struct NotoCoin".into()),
            components: vec![
                SchemaField {
                    name: "salt".into(),
                    field_type: "bytes32".into(),
                    indexed: false,
                },
                SchemaField {
                    name: "owner".into(),
                    field_type: "address".into(),
                    indexed: true,
                },
                SchemaField {
                    name: "amount".into(),
                    field_type: "uint256".into(),
                    indexed: true,
                },
            ],
        }
    }

    #[test]
    fn signature_is_canonical() {
        let def = coin_def();
        assert_eq!(
            def.signature(),
            "type=NotoCoin(bytes32 salt,address owner,uint256 amount),labels=[owner,amount]"
        );
    }

    #[test]
    fn id_is_hash_of_signature() {
        let schema = Schema::parse("noto", coin_def()).unwrap();
        assert_eq!(schema.id, keccak256(schema.signature.as_bytes()));
        // internalType does not participate in identity
        let mut def2 = coin_def();
        def2.internal_type = None;
        let schema2 = Schema::parse("noto", def2).unwrap();
        assert_eq!(schema.id, schema2.id);
    }

    #[test]
    fn labels_are_indexed_fields() {
        assert_eq!(coin_def().labels(), vec!["owner", "amount"]);
    }

    #[test]
    fn rejects_non_tuple() {
        let mut def = coin_def();
        def.param_type = "uint256".into();
        assert!(matches!(
            Schema::parse("noto", def),
            Err(StateError::SchemaInvalid(_))
        ));
    }

    #[test]
    fn rejects_empty_components() {
        let mut def = coin_def();
        def.components.clear();
        assert!(Schema::parse("noto", def).is_err());
    }

    #[test]
    fn parses_json_definition() {
        let def = SchemaDef::from_json(
            r#"{
                "name": "NotoCoin",
                "type": "tuple",
                "components": [
                    {"name": "salt", "type": "bytes32"},
                    {"name": "owner", "type": "address", "indexed": true},
                    {"name": "amount", "type": "uint256", "indexed": true}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(def.labels(), vec!["owner", "amount"]);
    }
}
