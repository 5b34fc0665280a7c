//! PostgreSQL fleet store
//!
//! Rows keep their full value in a `data` JSONB column next to the columns
//! that are indexed or constrained. The identity ledger is a single row in
//! `identity_pool`; every mutating transaction locks it first, so writers
//! from any number of processes are serialized on it. Partial unique
//! indexes back the identity invariants at the database level as well.

use std::future::Future;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use berth_pool::{IdentityPool, PoolConfig, PoolUsage};
use berth_types::{
    FleetRecord, FleetStatus, OwnerId, PendingAllocation, PlanId, RecordId, RuntimeId, SessionId,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, trace, warn};

use crate::error::{StoreError, StoreResult};
use crate::state::FleetState;
use crate::traits::{ClaimOutcome, FleetStore, NewPending, RemovalOutcome, TransactionPolicy};

const POOL_ROW: &str = "default";

/// PostgreSQL-backed fleet store
#[derive(Debug, Clone)]
pub struct PostgresFleetStore {
    pool: PgPool,
    policy: TransactionPolicy,
}

impl PostgresFleetStore {
    /// Connect, create the schema and rebuild the identity ledger from the tables.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
        pool_config: PoolConfig,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(StdDuration::from_secs(connect_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self {
            pool,
            policy: TransactionPolicy::default(),
        };
        store.initialize_schema().await?;
        store.rebuild_ledger(pool_config).await?;
        Ok(store)
    }

    pub fn with_policy(mut self, policy: TransactionPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn initialize_schema(&self) -> StoreResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS identity_pool (
                id TEXT PRIMARY KEY,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pending_allocations (
                session_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                owner_id BIGINT NOT NULL,
                reserved_name TEXT NOT NULL,
                reserved_port INTEGER NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                consumed_at TIMESTAMPTZ
            );
            "#,
            r#"ALTER TABLE pending_allocations ADD COLUMN IF NOT EXISTS consumed_at TIMESTAMPTZ;"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS pending_open_name ON pending_allocations(reserved_name) WHERE state IN ('awaiting', 'provisioning');"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS pending_open_port ON pending_allocations(reserved_port) WHERE state IN ('awaiting', 'provisioning');"#,
            r#"CREATE INDEX IF NOT EXISTS pending_state_expires ON pending_allocations(state, expires_at);"#,
            r#"
            CREATE TABLE IF NOT EXISTS fleet_records (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                port INTEGER NOT NULL,
                status TEXT NOT NULL,
                owner_id BIGINT NOT NULL,
                session_id TEXT NOT NULL UNIQUE,
                runtime_id TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            "#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS fleet_records_live_name ON fleet_records(name) WHERE status <> 'removed';"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS fleet_records_live_port ON fleet_records(port) WHERE status <> 'removed';"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS fleet_records_live_runtime ON fleet_records(runtime_id) WHERE status <> 'removed';"#,
            r#"CREATE INDEX IF NOT EXISTS fleet_records_owner ON fleet_records(owner_id, created_at);"#,
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
        }

        Ok(())
    }

    /// Recompute the ledger from open allocations and live records.
    async fn rebuild_ledger(&self, config: PoolConfig) -> StoreResult<()> {
        let mut tx = self.begin().await?;

        sqlx::query(
            "INSERT INTO identity_pool (id, data, updated_at) VALUES ($1, 'null'::jsonb, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(POOL_ROW)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        sqlx::query("SELECT id FROM identity_pool WHERE id = $1 FOR UPDATE")
            .bind(POOL_ROW)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let open: Vec<PendingAllocation> = decode_all(
            sqlx::query(
                "SELECT data FROM pending_allocations WHERE state IN ('awaiting', 'provisioning')",
            )
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx)?,
        )?;
        let live: Vec<FleetRecord> = decode_all(
            sqlx::query("SELECT data FROM fleet_records WHERE status <> 'removed'")
                .fetch_all(&mut *tx)
                .await
                .map_err(map_sqlx)?,
        )?;

        let ledger = IdentityPool::restore(
            config,
            open.iter().map(|p| p.identity.clone()),
            live.iter().map(FleetRecord::identity),
        )?;
        let usage = ledger.usage();
        save_ledger(&mut tx, &ledger).await?;
        tx.commit().await.map_err(map_sqlx)?;

        info!(
            capacity = usage.capacity,
            reserved = usage.reserved,
            assigned = usage.assigned,
            "identity ledger rebuilt"
        );
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(map_sqlx)
    }

    async fn retrying<T, F, Fut>(&self, op: &'static str, mut attempt_once: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        for attempt in 1..=self.policy.max_attempts {
            match attempt_once().await {
                Err(StoreError::WriteConflict(reason)) => {
                    trace!(op, attempt, %reason, "write conflict, retrying");
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }

        warn!(op, attempts = self.policy.max_attempts, "transaction aborted");
        Err(StoreError::TransactionAborted {
            op,
            attempts: self.policy.max_attempts,
        })
    }

    /// Run `body` over the locked ledger and the rows named by `scope`, then
    /// write the touched rows and the ledger back in the same transaction.
    async fn mutate<T, F>(&self, scope: Scope<'_>, body: F) -> StoreResult<T>
    where
        F: FnOnce(&mut FleetState) -> StoreResult<T> + Send,
        T: Send,
    {
        let mut tx = self.begin().await?;
        let mut state = FleetState::from_pool(lock_ledger(&mut tx).await?);
        scope.load(&mut tx, &mut state).await?;

        let value = body(&mut state)?;

        save_ledger(&mut tx, &state.pool).await?;
        for pending in state.pending.values() {
            upsert_pending(&mut tx, pending).await?;
        }
        for record in state.records.values() {
            upsert_record(&mut tx, record).await?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(value)
    }
}

/// Rows a mutation needs in its working state.
#[derive(Debug, Clone, Copy)]
enum Scope<'a> {
    Session(&'a SessionId),
    /// The allocation plus the record it was promoted into, if any.
    SessionWithRecord(&'a SessionId),
    /// The allocation plus live records holding `runtime_id`.
    Promotion(&'a SessionId, &'a RuntimeId),
    Record(&'a RecordId),
    ExpiryCandidates(DateTime<Utc>),
}

impl Scope<'_> {
    async fn load(self, tx: &mut PgConnection, state: &mut FleetState) -> StoreResult<()> {
        match self {
            Scope::Session(session) => {
                load_pending(tx, state, session).await?;
            }
            Scope::SessionWithRecord(session) => {
                load_pending(tx, state, session).await?;
                let rows = sqlx::query("SELECT data FROM fleet_records WHERE session_id = $1")
                    .bind(session.as_str())
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                insert_records(state, rows)?;
            }
            Scope::Promotion(session, runtime_id) => {
                load_pending(tx, state, session).await?;
                let rows = sqlx::query(
                    "SELECT data FROM fleet_records WHERE runtime_id = $1 AND status <> 'removed'",
                )
                .bind(runtime_id.as_str())
                .fetch_all(&mut *tx)
                .await
                .map_err(map_sqlx)?;
                insert_records(state, rows)?;
            }
            Scope::Record(id) => {
                let rows = sqlx::query("SELECT data FROM fleet_records WHERE id = $1")
                    .bind(*id.as_uuid())
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                insert_records(state, rows)?;
            }
            Scope::ExpiryCandidates(now) => {
                let rows = sqlx::query(
                    "SELECT data FROM pending_allocations WHERE state IN ('awaiting', 'provisioning') AND expires_at <= $1",
                )
                .bind(now)
                .fetch_all(&mut *tx)
                .await
                .map_err(map_sqlx)?;
                for pending in decode_all::<PendingAllocation>(rows)? {
                    state.pending.insert(pending.session_id.clone(), pending);
                }
            }
        }
        Ok(())
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        // serialization_failure, deadlock_detected, unique_violation
        if matches!(db.code().as_deref(), Some("40001" | "40P01" | "23505")) {
            return StoreError::WriteConflict(db.message().to_string());
        }
    }
    StoreError::Query(err.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| StoreError::InvalidData(format!("json serialize error: {}", e)))
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value) -> StoreResult<T> {
    serde_json::from_value(value)
        .map_err(|e| StoreError::InvalidData(format!("json deserialize error: {}", e)))
}

fn decode<T: serde::de::DeserializeOwned>(row: &PgRow) -> StoreResult<T> {
    let data: Value = row
        .try_get("data")
        .map_err(|e| StoreError::Query(e.to_string()))?;
    from_json(data)
}

fn decode_all<T: serde::de::DeserializeOwned>(rows: Vec<PgRow>) -> StoreResult<Vec<T>> {
    rows.iter().map(decode).collect()
}

fn insert_records(state: &mut FleetState, rows: Vec<PgRow>) -> StoreResult<()> {
    for record in decode_all::<FleetRecord>(rows)? {
        state.records.insert(record.id, record);
    }
    Ok(())
}

async fn load_pending(
    tx: &mut PgConnection,
    state: &mut FleetState,
    session: &SessionId,
) -> StoreResult<()> {
    let row = sqlx::query("SELECT data FROM pending_allocations WHERE session_id = $1")
        .bind(session.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;
    if let Some(row) = row {
        let pending: PendingAllocation = decode(&row)?;
        state.pending.insert(pending.session_id.clone(), pending);
    }
    Ok(())
}

async fn lock_ledger(tx: &mut PgConnection) -> StoreResult<IdentityPool> {
    let row = sqlx::query("SELECT data FROM identity_pool WHERE id = $1 FOR UPDATE")
        .bind(POOL_ROW)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?
        .ok_or_else(|| StoreError::InvalidData("identity ledger row is missing".to_string()))?;
    decode(&row)
}

async fn save_ledger(tx: &mut PgConnection, ledger: &IdentityPool) -> StoreResult<()> {
    sqlx::query("UPDATE identity_pool SET data = $2, updated_at = $3 WHERE id = $1")
        .bind(POOL_ROW)
        .bind(to_json(ledger)?)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
    Ok(())
}

async fn upsert_pending(tx: &mut PgConnection, pending: &PendingAllocation) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO pending_allocations
            (session_id, state, owner_id, reserved_name, reserved_port, expires_at, data, created_at, consumed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (session_id) DO UPDATE SET
            state = EXCLUDED.state,
            data = EXCLUDED.data,
            consumed_at = EXCLUDED.consumed_at
        "#,
    )
    .bind(pending.session_id.as_str())
    .bind(pending.state.label())
    .bind(pending.owner_id.value())
    .bind(pending.identity.name.as_str())
    .bind(i32::from(pending.identity.port))
    .bind(pending.expires_at)
    .bind(to_json(pending)?)
    .bind(pending.created_at)
    .bind(pending.consumed_at())
    .execute(&mut *tx)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

async fn upsert_record(tx: &mut PgConnection, record: &FleetRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO fleet_records
            (id, name, port, status, owner_id, session_id, runtime_id, data, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            data = EXCLUDED.data,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(*record.id.as_uuid())
    .bind(record.name.as_str())
    .bind(i32::from(record.port))
    .bind(record.status.as_str())
    .bind(record.owner_id.value())
    .bind(record.session_id.as_str())
    .bind(record.runtime_id.as_str())
    .bind(to_json(record)?)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut *tx)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

#[async_trait]
impl FleetStore for PostgresFleetStore {
    async fn create_pending(&self, new: NewPending) -> StoreResult<PendingAllocation> {
        let new = &new;
        let allocation = self
            .retrying("create_pending", move || {
                self.mutate(Scope::Session(&new.session_id), move |state| {
                    state.create_pending(new)
                })
            })
            .await?;
        debug!(
            session = %allocation.session_id,
            identity = %allocation.identity,
            "allocation reserved"
        );
        Ok(allocation)
    }

    async fn get_pending(&self, session: &SessionId) -> StoreResult<Option<PendingAllocation>> {
        let row = sqlx::query("SELECT data FROM pending_allocations WHERE session_id = $1")
            .bind(session.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode).transpose()
    }

    async fn list_open_pending(&self) -> StoreResult<Vec<PendingAllocation>> {
        let rows = sqlx::query(
            "SELECT data FROM pending_allocations WHERE state IN ('awaiting', 'provisioning') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        decode_all(rows)
    }

    async fn claim_pending(
        &self,
        session: &SessionId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<ClaimOutcome> {
        self.retrying("claim_pending", move || {
            self.mutate(Scope::SessionWithRecord(session), move |state| {
                state.claim(session, now, lease)
            })
        })
        .await
    }

    async fn unclaim_pending(&self, session: &SessionId) -> StoreResult<()> {
        self.retrying("unclaim_pending", move || {
            self.mutate(Scope::Session(session), move |state| state.unclaim(session))
        })
        .await
    }

    async fn promote_pending_to_record(
        &self,
        session: &SessionId,
        runtime_id: RuntimeId,
        plan: PlanId,
        now: DateTime<Utc>,
    ) -> StoreResult<FleetRecord> {
        let (runtime_id, plan) = (&runtime_id, &plan);
        self.retrying("promote_pending_to_record", move || {
            self.mutate(Scope::Promotion(session, runtime_id), move |state| {
                state.promote(session, runtime_id, plan, now)
            })
        })
        .await
    }

    async fn fail_pending(
        &self,
        session: &SessionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<PendingAllocation> {
        self.retrying("fail_pending", move || {
            self.mutate(Scope::Session(session), move |state| {
                state.fail(session, reason, now)
            })
        })
        .await
    }

    async fn expire_pending(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Vec<PendingAllocation>> {
        self.retrying("expire_pending", move || {
            self.mutate(Scope::ExpiryCandidates(now), move |state| {
                state.expire(now, lease)
            })
        })
        .await
    }

    async fn get_by_id(&self, id: &RecordId) -> StoreResult<Option<FleetRecord>> {
        let row = sqlx::query("SELECT data FROM fleet_records WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode).transpose()
    }

    async fn get_by_name(&self, name: &str) -> StoreResult<Option<FleetRecord>> {
        let row = sqlx::query(
            "SELECT data FROM fleet_records WHERE name = $1 ORDER BY (status <> 'removed') DESC, updated_at DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(decode).transpose()
    }

    async fn get_by_session(&self, session: &SessionId) -> StoreResult<Option<FleetRecord>> {
        let row = sqlx::query("SELECT data FROM fleet_records WHERE session_id = $1")
            .bind(session.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode).transpose()
    }

    async fn list_by_owner(&self, owner: OwnerId) -> StoreResult<Vec<FleetRecord>> {
        let rows = sqlx::query(
            "SELECT data FROM fleet_records WHERE owner_id = $1 AND status <> 'removed' ORDER BY created_at, id",
        )
        .bind(owner.value())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        decode_all(rows)
    }

    async fn list_all(&self) -> StoreResult<Vec<FleetRecord>> {
        let rows = sqlx::query("SELECT data FROM fleet_records ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        decode_all(rows)
    }

    async fn update_status(
        &self,
        id: &RecordId,
        expected: FleetStatus,
        status: FleetStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<FleetRecord> {
        self.retrying("update_status", move || {
            self.mutate(Scope::Record(id), move |state| {
                state.update_status(id, expected, status, now)
            })
        })
        .await
    }

    async fn delete_or_mark_removed(
        &self,
        id: &RecordId,
        now: DateTime<Utc>,
    ) -> StoreResult<RemovalOutcome> {
        self.retrying("delete_or_mark_removed", move || {
            self.mutate(Scope::Record(id), move |state| state.mark_removed(id, now))
        })
        .await
    }

    async fn pool_usage(&self) -> StoreResult<PoolUsage> {
        let row = sqlx::query("SELECT data FROM identity_pool WHERE id = $1")
            .bind(POOL_ROW)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let ledger: IdentityPool = decode(&row)?;
        Ok(ledger.usage())
    }
}
