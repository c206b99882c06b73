//! PostgreSQL backend using SQLx.
//!
//! The base `states` row is written exactly once; lifecycle facts (locks,
//! spends, confirmations, nullifiers) live in satellite tables keyed by the
//! state ID. Write batches apply inside one database transaction, so a batch
//! either lands completely or not at all.
//!
//! # Label queries
//!
//! Query filters compile to JSONB operators. Equality compares
//! case-insensitively as text; range filters cast the field to `numeric`, so
//! domains that want range queries over a label should store it as a decimal
//! string or JSON number (the in-memory backend additionally understands
//! `0x` hex, which has no direct `numeric` cast here).

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{FromRow, QueryBuilder, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{Result, StateError};
use crate::query::StateQuery;
use crate::schema::{Schema, SchemaDef};
use crate::state::{StateLock, StateRecord};

use super::{PrivateContractRecord, StateBackend, WriteBatch, WriteOp};

// ═══════════════════════════════════════════════════════════════════════════════
// POSTGRES BACKEND
// ═══════════════════════════════════════════════════════════════════════════════

/// PostgreSQL-based state backend.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Create a backend over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StateError::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROW MAPPING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, FromRow)]
struct StateRow {
    id: Vec<u8>,
    schema_id: Vec<u8>,
    domain: String,
    contract: Vec<u8>,
    data: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
    lock_tx: Option<Uuid>,
    lock_creating: Option<bool>,
    lock_spending: Option<bool>,
    confirmed: bool,
    spent: bool,
    nullifier: Option<Vec<u8>>,
}

impl TryFrom<StateRow> for StateRecord {
    type Error = StateError;

    fn try_from(row: StateRow) -> std::result::Result<Self, Self::Error> {
        Ok(StateRecord {
            id: bytes32(&row.id)?,
            schema_id: bytes32(&row.schema_id)?,
            domain: row.domain,
            contract: address(&row.contract)?,
            data: row.data,
            created_at: row.created_at,
            lock: row.lock_tx.map(|tx_id| StateLock {
                tx_id,
                creating: row.lock_creating.unwrap_or_default(),
                spending: row.lock_spending.unwrap_or_default(),
            }),
            confirmed: row.confirmed,
            spent: row.spent,
            nullifier: row.nullifier.as_deref().map(bytes32).transpose()?,
        })
    }
}

fn bytes32(raw: &[u8]) -> Result<B256> {
    B256::try_from(raw).map_err(|_| StateError::SchemaInvalid("malformed 32-byte ID in DB".into()))
}

fn address(raw: &[u8]) -> Result<Address> {
    Address::try_from(raw)
        .map_err(|_| StateError::SchemaInvalid("malformed address in DB".into()))
}

/// Columns and joins shared by every state read.
const STATE_SELECT: &str = r"
    SELECT s.id, s.schema_id, s.domain, s.contract, s.data, s.created_at,
           l.tx_id AS lock_tx, l.creating AS lock_creating, l.spending AS lock_spending,
           (c.state_id IS NOT NULL) AS confirmed,
           (sp.state_id IS NOT NULL) AS spent,
           n.nullifier AS nullifier
    FROM states s
    LEFT JOIN state_locks l
           ON l.domain = s.domain AND l.contract = s.contract AND l.state_id = s.id
    LEFT JOIN state_confirmed c
           ON c.domain = s.domain AND c.contract = s.contract AND c.state_id = s.id
    LEFT JOIN state_spent sp
           ON sp.domain = s.domain AND sp.contract = s.contract AND sp.state_id = s.id
    LEFT JOIN state_nullifiers n
           ON n.domain = s.domain AND n.contract = s.contract AND n.state_id = s.id
";

// ═══════════════════════════════════════════════════════════════════════════════
// BACKEND IMPLEMENTATION
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl StateBackend for PostgresBackend {
    #[instrument(skip_all, fields(count = schemas.len()))]
    async fn upsert_schemas(&self, schemas: &[Schema]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for schema in schemas {
            sqlx::query(
                r"
                INSERT INTO schemas (id, domain, signature, definition)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (domain, signature) DO NOTHING
                ",
            )
            .bind(schema.id.as_slice())
            .bind(&schema.domain)
            .bind(&schema.signature)
            .bind(serde_json::to_value(&schema.definition)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_schema(&self, domain: &str, id: B256) -> Result<Option<Schema>> {
        let row = sqlx::query(
            r"
            SELECT id, domain, signature, definition
            FROM schemas
            WHERE domain = $1 AND id = $2
            ",
        )
        .bind(domain)
        .bind(id.as_slice())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let definition: SchemaDef = serde_json::from_value(row.try_get("definition")?)?;
            Ok(Schema {
                id: bytes32(row.try_get::<Vec<u8>, _>("id")?.as_slice())?,
                domain: row.try_get("domain")?,
                signature: row.try_get("signature")?,
                definition,
            })
        })
        .transpose()
    }

    async fn get_states(
        &self,
        domain: &str,
        contract: Address,
        ids: &[B256],
    ) -> Result<Vec<StateRecord>> {
        let id_bytes: Vec<Vec<u8>> = ids.iter().map(|id| id.as_slice().to_vec()).collect();
        let rows = sqlx::query_as::<_, StateRow>(&format!(
            "{STATE_SELECT} WHERE s.domain = $1 AND s.contract = $2 AND s.id = ANY($3)"
        ))
        .bind(domain)
        .bind(contract.as_slice())
        .bind(&id_bytes)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self, query), fields(domain, schema = %schema_id))]
    async fn find_available_states(
        &self,
        domain: &str,
        contract: Address,
        schema_id: B256,
        query: &StateQuery,
        lock_holder: Option<Uuid>,
        use_nullifiers: bool,
    ) -> Result<Vec<StateRecord>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(STATE_SELECT);
        builder.push(" WHERE s.domain = ");
        builder.push_bind(domain.to_string());
        builder.push(" AND s.contract = ");
        builder.push_bind(contract.as_slice().to_vec());
        builder.push(" AND s.schema_id = ");
        builder.push_bind(schema_id.as_slice().to_vec());

        // Availability: confirmed, unspent, unlocked or locked to the holder
        builder.push(" AND c.state_id IS NOT NULL AND sp.state_id IS NULL");
        builder.push(" AND (l.state_id IS NULL OR l.tx_id = ");
        builder.push_bind(lock_holder);
        builder.push(")");
        if use_nullifiers {
            builder.push(" AND n.nullifier IS NOT NULL");
        }

        for filter in &query.eq {
            builder.push(" AND lower(s.data->>");
            builder.push_bind(filter.field.clone());
            builder.push(") = lower(");
            builder.push_bind(filter_text(&filter.value));
            builder.push(")");
        }
        for filter in &query.gt {
            builder.push(" AND (s.data->>");
            builder.push_bind(filter.field.clone());
            builder.push(")::numeric > (");
            builder.push_bind(filter_text(&filter.value));
            builder.push(")::numeric");
        }
        for filter in &query.lt {
            builder.push(" AND (s.data->>");
            builder.push_bind(filter.field.clone());
            builder.push(")::numeric < (");
            builder.push_bind(filter_text(&filter.value));
            builder.push(")::numeric");
        }

        builder.push(" ORDER BY ");
        for spec in &query.sort {
            let (field, descending) = spec
                .strip_prefix('-')
                .map_or((spec.as_str(), false), |f| (f, true));
            builder.push("(s.data->>");
            builder.push_bind(field.to_string());
            builder.push(")::numeric");
            builder.push(if descending { " DESC, " } else { " ASC, " });
        }
        builder.push("s.created_at ASC, s.id ASC");

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<StateRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        debug!(count = rows.len(), "available states fetched");
        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip_all, fields(domain = %batch.domain, ops = batch.ops.len()))]
    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let domain = &batch.domain;
        let contract = batch.contract.as_slice().to_vec();

        for op in &batch.ops {
            match op {
                WriteOp::InsertState(state) => {
                    sqlx::query(
                        r"
                        INSERT INTO states (id, domain, contract, schema_id, data, created_at)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        ON CONFLICT (domain, contract, id) DO NOTHING
                        ",
                    )
                    .bind(state.id.as_slice())
                    .bind(domain)
                    .bind(&contract)
                    .bind(state.schema_id.as_slice())
                    .bind(&state.data)
                    .bind(state.created_at)
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::Lock { state_id, lock } => {
                    sqlx::query(
                        r"
                        INSERT INTO state_locks (domain, contract, state_id, tx_id, creating, spending)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        ON CONFLICT (domain, contract, state_id) DO UPDATE
                            SET tx_id = EXCLUDED.tx_id,
                                creating = EXCLUDED.creating,
                                spending = EXCLUDED.spending
                        ",
                    )
                    .bind(domain)
                    .bind(&contract)
                    .bind(state_id.as_slice())
                    .bind(lock.tx_id)
                    .bind(lock.creating)
                    .bind(lock.spending)
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::MarkSpent { state_id, tx_id } => {
                    let inserted = sqlx::query(
                        r"
                        INSERT INTO state_spent (domain, contract, state_id, tx_id)
                        SELECT $1, $2, $3, $4
                        WHERE EXISTS (
                            SELECT 1 FROM states
                            WHERE domain = $1 AND contract = $2 AND id = $3
                        )
                        ON CONFLICT (domain, contract, state_id) DO NOTHING
                        ",
                    )
                    .bind(domain)
                    .bind(&contract)
                    .bind(state_id.as_slice())
                    .bind(tx_id)
                    .execute(&mut *tx)
                    .await?;
                    if inserted.rows_affected() == 1 {
                        sqlx::query(
                            r"
                            DELETE FROM state_locks
                            WHERE domain = $1 AND contract = $2 AND state_id = $3
                            ",
                        )
                        .bind(domain)
                        .bind(&contract)
                        .bind(state_id.as_slice())
                        .execute(&mut *tx)
                        .await?;
                    }
                }
                WriteOp::MarkConfirmed { state_id, tx_id } => {
                    sqlx::query(
                        r"
                        INSERT INTO state_confirmed (domain, contract, state_id, tx_id)
                        SELECT $1, $2, $3, $4
                        WHERE EXISTS (
                            SELECT 1 FROM states
                            WHERE domain = $1 AND contract = $2 AND id = $3
                        )
                        ON CONFLICT (domain, contract, state_id) DO NOTHING
                        ",
                    )
                    .bind(domain)
                    .bind(&contract)
                    .bind(state_id.as_slice())
                    .bind(tx_id)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query(
                        r"
                        DELETE FROM state_locks
                        WHERE domain = $1 AND contract = $2 AND state_id = $3
                              AND creating AND NOT spending
                        ",
                    )
                    .bind(domain)
                    .bind(&contract)
                    .bind(state_id.as_slice())
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::PutNullifier { state_id, nullifier } => {
                    sqlx::query(
                        r"
                        INSERT INTO state_nullifiers (domain, contract, state_id, nullifier)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (domain, contract, state_id) DO NOTHING
                        ",
                    )
                    .bind(domain)
                    .bind(&contract)
                    .bind(state_id.as_slice())
                    .bind(nullifier.as_slice())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_private_contract(&self, record: &PrivateContractRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO private_contracts (address, domain, config_bytes, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (address) DO NOTHING
            ",
        )
        .bind(record.address.as_slice())
        .bind(&record.domain)
        .bind(&record.config_bytes)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_private_contract(
        &self,
        address: Address,
    ) -> Result<Option<PrivateContractRecord>> {
        let row = sqlx::query(
            r"
            SELECT address, domain, config_bytes, created_at
            FROM private_contracts
            WHERE address = $1
            ",
        )
        .bind(address.as_slice())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(PrivateContractRecord {
                address: self::address(row.try_get::<Vec<u8>, _>("address")?.as_slice())?,
                domain: row.try_get("domain")?,
                config_bytes: row.try_get("config_bytes")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }
}

/// Render a filter operand as the text form bound into SQL.
fn filter_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
