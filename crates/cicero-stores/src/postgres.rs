//! PostgreSQL storage backed by sqlx.
//!
//! Schema bootstrap happens on construction. The `inputs` column of the
//! `action` table is TEXT rather than JSONB: input declaration order is
//! semantically relevant and JSONB does not preserve key order.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction as SqlxTransaction};
use uuid::Uuid;

use cicero_core::store::{
    ActionStore, Database, FactStore, InvocationStore, RunStore, RunnerEventStore,
    StepInstanceStore, StorageTx, StoreError,
};
use cicero_core::types::{
    Action, ActionDefinition, Fact, InputDefinitions, Invocation, NewFact, Run, RunnerEvent,
    StepInstance,
};

/// PostgreSQL storage.
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect and bootstrap the schema.
    pub async fn new(connection_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(connection_url)
            .await
            .map_err(connection_error)?;
        let this = Self { pool };
        this.init_schema().await?;
        Ok(this)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS fact (
                id UUID PRIMARY KEY,
                run_id UUID NULL,
                created_at TIMESTAMPTZ NOT NULL,
                value JSONB NOT NULL,
                binary_hash TEXT NULL
            )",
            "CREATE INDEX IF NOT EXISTS fact_created_idx ON fact (created_at ASC, id ASC)",
            "CREATE INDEX IF NOT EXISTS fact_run_idx ON fact (run_id)",
            "CREATE TABLE IF NOT EXISTS fact_binary (
                hash TEXT PRIMARY KEY,
                data BYTEA NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS action (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                active BOOLEAN NOT NULL,
                meta JSONB NOT NULL,
                inputs TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS action_name_idx ON action (name, created_at DESC)",
            "CREATE SEQUENCE IF NOT EXISTS workflow_instance_seq",
            "CREATE TABLE IF NOT EXISTS invocation (
                id UUID PRIMARY KEY,
                action_id UUID NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                eval_stdout TEXT NULL,
                eval_stderr TEXT NULL,
                binding JSONB NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS invocation_action_idx ON invocation (action_id)",
            "CREATE TABLE IF NOT EXISTS step_instance (
                id UUID PRIMARY KEY,
                workflow_instance_id BIGINT NOT NULL,
                name TEXT NOT NULL,
                certs JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ NULL,
                UNIQUE (name, workflow_instance_id)
            )",
            "CREATE TABLE IF NOT EXISTS run (
                job_id UUID PRIMARY KEY,
                invocation_id UUID NOT NULL REFERENCES invocation (id),
                created_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ NULL,
                success JSONB NULL,
                failure JSONB NULL
            )",
            "CREATE TABLE IF NOT EXISTS nomad_event (
                uid BYTEA PRIMARY KEY,
                event_index BIGINT NOT NULL,
                payload JSONB NOT NULL,
                handled BOOLEAN NOT NULL
            )",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(connection_error)?;
        }
        Ok(())
    }
}

fn connection_error(e: sqlx::Error) -> StoreError {
    StoreError::Connection(e.to_string())
}

fn write_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::Conflict(db.to_string());
        }
    }
    StoreError::Connection(e.to_string())
}

fn decode_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn fact_from_row(row: &PgRow) -> Result<Fact, StoreError> {
    Ok(Fact {
        id: row.try_get("id").map_err(decode_error)?,
        run_id: row.try_get("run_id").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        value: row.try_get("value").map_err(decode_error)?,
        binary_hash: row.try_get("binary_hash").map_err(decode_error)?,
    })
}

fn action_from_row(row: &PgRow) -> Result<Action, StoreError> {
    let meta: Value = row.try_get("meta").map_err(decode_error)?;
    let meta = match meta {
        Value::Object(map) => map,
        other => return Err(decode_error(format!("action meta is not an object: {other}"))),
    };
    let inputs_raw: String = row.try_get("inputs").map_err(decode_error)?;
    let inputs: InputDefinitions = serde_json::from_str(&inputs_raw).map_err(decode_error)?;
    Ok(Action {
        id: row.try_get("id").map_err(decode_error)?,
        name: row.try_get("name").map_err(decode_error)?,
        source: row.try_get("source").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        active: row.try_get("active").map_err(decode_error)?,
        definition: ActionDefinition { meta, inputs },
    })
}

fn run_from_row(row: &PgRow) -> Result<Run, StoreError> {
    Ok(Run {
        job_id: row.try_get("job_id").map_err(decode_error)?,
        invocation_id: row.try_get("invocation_id").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        finished_at: row.try_get("finished_at").map_err(decode_error)?,
        success: row.try_get("success").map_err(decode_error)?,
        failure: row.try_get("failure").map_err(decode_error)?,
    })
}

fn step_from_row(row: &PgRow) -> Result<StepInstance, StoreError> {
    let workflow_instance_id: i64 = row.try_get("workflow_instance_id").map_err(decode_error)?;
    Ok(StepInstance {
        id: row.try_get("id").map_err(decode_error)?,
        workflow_instance_id: u64::try_from(workflow_instance_id).map_err(decode_error)?,
        name: row.try_get("name").map_err(decode_error)?,
        certs: row.try_get("certs").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        finished_at: row.try_get("finished_at").map_err(decode_error)?,
    })
}

fn invocation_from_row(row: &PgRow) -> Result<Invocation, StoreError> {
    Ok(Invocation {
        id: row.try_get("id").map_err(decode_error)?,
        action_id: row.try_get("action_id").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        eval_stdout: row.try_get("eval_stdout").map_err(decode_error)?,
        eval_stderr: row.try_get("eval_stderr").map_err(decode_error)?,
        binding: row.try_get("binding").map_err(decode_error)?,
    })
}

fn instance_id_to_db(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::Internal("instance id exceeds i64 range".to_string()))
}

#[async_trait]
impl FactStore for PostgresStorage {
    async fn insert(&self, fact: NewFact) -> Result<Fact, StoreError> {
        let mut tx = self.pool.begin().await.map_err(connection_error)?;

        let binary_hash = match fact.binary {
            Some(binary) => {
                let mut hasher = Sha256::new();
                hasher.update(&binary);
                let hash = format!("{:x}", hasher.finalize());
                sqlx::query("INSERT INTO fact_binary (hash, data) VALUES ($1, $2) ON CONFLICT (hash) DO NOTHING")
                    .bind(&hash)
                    .bind(binary.as_ref())
                    .execute(&mut *tx)
                    .await
                    .map_err(write_error)?;
                Some(hash)
            }
            None => None,
        };

        let stored = Fact {
            id: fact.id.unwrap_or_else(Uuid::new_v4),
            run_id: fact.run_id,
            created_at: Utc::now(),
            value: fact.value,
            binary_hash,
        };
        sqlx::query(
            "INSERT INTO fact (id, run_id, created_at, value, binary_hash)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(stored.id)
        .bind(stored.run_id)
        .bind(stored.created_at)
        .bind(&stored.value)
        .bind(&stored.binary_hash)
        .execute(&mut *tx)
        .await
        .map_err(write_error)?;

        tx.commit().await.map_err(connection_error)?;
        Ok(stored)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Fact>, StoreError> {
        let row = sqlx::query("SELECT * FROM fact WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(connection_error)?;
        row.as_ref().map(fact_from_row).transpose()
    }

    async fn get_by_run(&self, run_id: Uuid) -> Result<Vec<Fact>, StoreError> {
        let rows = sqlx::query("SELECT * FROM fact WHERE run_id = $1 ORDER BY created_at ASC")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(connection_error)?;
        rows.iter().map(fact_from_row).collect()
    }

    async fn scan(&self) -> Result<Vec<Fact>, StoreError> {
        let rows = sqlx::query("SELECT * FROM fact ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(connection_error)?;
        rows.iter().map(fact_from_row).collect()
    }

    async fn get_binary(&self, hash: &str) -> Result<Option<Bytes>, StoreError> {
        let row = sqlx::query("SELECT data FROM fact_binary WHERE hash = $1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(connection_error)?;
        row.map(|row| {
            row.try_get::<Vec<u8>, _>("data")
                .map(Bytes::from)
                .map_err(decode_error)
        })
        .transpose()
    }
}

#[async_trait]
impl ActionStore for PostgresStorage {
    async fn save(&self, action: &Action) -> Result<(), StoreError> {
        let inputs = serde_json::to_string(&action.definition.inputs).map_err(decode_error)?;
        sqlx::query(
            "INSERT INTO action (id, name, source, created_at, active, meta, inputs)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(action.id)
        .bind(&action.name)
        .bind(&action.source)
        .bind(action.created_at)
        .bind(action.active)
        .bind(Value::Object(action.definition.meta.clone()))
        .bind(inputs)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Action>, StoreError> {
        let row = sqlx::query("SELECT * FROM action WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(connection_error)?;
        row.as_ref().map(action_from_row).transpose()
    }

    async fn get_latest_by_name(&self, name: &str) -> Result<Option<Action>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM action WHERE name = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(connection_error)?;
        row.as_ref().map(action_from_row).transpose()
    }

    async fn list_active(&self) -> Result<Vec<Action>, StoreError> {
        let rows = sqlx::query("SELECT * FROM action WHERE active ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(connection_error)?;
        rows.iter().map(action_from_row).collect()
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE action SET active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(connection_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("action {id}")));
        }
        Ok(())
    }

    async fn next_instance_id(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT nextval('workflow_instance_seq') AS seq")
            .fetch_one(&self.pool)
            .await
            .map_err(connection_error)?;
        let seq: i64 = row.try_get("seq").map_err(decode_error)?;
        u64::try_from(seq).map_err(decode_error)
    }
}

#[async_trait]
impl RunStore for PostgresStorage {
    async fn get_by_job_id(&self, job_id: Uuid) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query("SELECT * FROM run WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(connection_error)?;
        row.as_ref().map(run_from_row).transpose()
    }
}

#[async_trait]
impl InvocationStore for PostgresStorage {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Invocation>, StoreError> {
        let row = sqlx::query("SELECT * FROM invocation WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(connection_error)?;
        row.as_ref().map(invocation_from_row).transpose()
    }

    async fn used_fact_ids(&self, action_id: Uuid, input: &str) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT binding -> $2 ->> 'fact_id' AS fact_id
             FROM invocation WHERE action_id = $1",
        )
        .bind(action_id)
        .bind(input)
        .fetch_all(&self.pool)
        .await
        .map_err(connection_error)?;

        let mut ids = Vec::new();
        for row in rows {
            let raw: Option<String> = row.try_get("fact_id").map_err(decode_error)?;
            if let Some(raw) = raw {
                ids.push(Uuid::parse_str(&raw).map_err(decode_error)?);
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl StepInstanceStore for PostgresStorage {
    async fn get_by_name_and_instance(
        &self,
        name: &str,
        workflow_instance_id: u64,
    ) -> Result<Option<StepInstance>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM step_instance WHERE name = $1 AND workflow_instance_id = $2 LIMIT 1",
        )
        .bind(name)
        .bind(instance_id_to_db(workflow_instance_id)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(connection_error)?;
        row.as_ref().map(step_from_row).transpose()
    }
}

#[async_trait]
impl RunnerEventStore for PostgresStorage {
    async fn last_index(&self) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT MAX(event_index) AS last FROM nomad_event")
            .fetch_one(&self.pool)
            .await
            .map_err(connection_error)?;
        let last: Option<i64> = row.try_get("last").map_err(decode_error)?;
        last.map(|index| u64::try_from(index).map_err(decode_error))
            .transpose()
    }

    async fn contains(&self, uid: &[u8; 16]) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM nomad_event WHERE uid = $1) AS found")
            .bind(uid.as_slice())
            .fetch_one(&self.pool)
            .await
            .map_err(connection_error)?;
        row.try_get("found").map_err(decode_error)
    }
}

#[async_trait]
impl Database for PostgresStorage {
    async fn begin(&self) -> Result<Box<dyn StorageTx>, StoreError> {
        let tx = self.pool.begin().await.map_err(connection_error)?;
        Ok(Box::new(PostgresTx { tx }))
    }
}

/// One open sqlx transaction.
struct PostgresTx {
    tx: SqlxTransaction<'static, Postgres>,
}

#[async_trait]
impl StorageTx for PostgresTx {
    async fn insert_invocation(&mut self, invocation: &Invocation) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO invocation (id, action_id, created_at, eval_stdout, eval_stderr, binding)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(invocation.id)
        .bind(invocation.action_id)
        .bind(invocation.created_at)
        .bind(&invocation.eval_stdout)
        .bind(&invocation.eval_stderr)
        .bind(&invocation.binding)
        .execute(&mut *self.tx)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn insert_step_instance(&mut self, step: &StepInstance) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO step_instance (id, workflow_instance_id, name, certs, created_at, finished_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(step.id)
        .bind(instance_id_to_db(step.workflow_instance_id)?)
        .bind(&step.name)
        .bind(&step.certs)
        .bind(step.created_at)
        .bind(step.finished_at)
        .execute(&mut *self.tx)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn finish_step_instance(
        &mut self,
        id: Uuid,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE step_instance SET finished_at = $2 WHERE id = $1")
            .bind(id)
            .bind(finished_at)
            .execute(&mut *self.tx)
            .await
            .map_err(write_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("step instance {id}")));
        }
        Ok(())
    }

    async fn insert_run(&mut self, run: &Run) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO run (job_id, invocation_id, created_at, finished_at, success, failure)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(run.job_id)
        .bind(run.invocation_id)
        .bind(run.created_at)
        .bind(run.finished_at)
        .bind(&run.success)
        .bind(&run.failure)
        .execute(&mut *self.tx)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn update_run(&mut self, run: &Run) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE run SET finished_at = $2, success = $3, failure = $4 WHERE job_id = $1",
        )
        .bind(run.job_id)
        .bind(run.finished_at)
        .bind(&run.success)
        .bind(&run.failure)
        .execute(&mut *self.tx)
        .await
        .map_err(write_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("run {}", run.job_id)));
        }
        Ok(())
    }

    async fn save_runner_event(&mut self, event: &RunnerEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO nomad_event (uid, event_index, payload, handled)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (uid) DO NOTHING",
        )
        .bind(event.uid.as_slice())
        .bind(instance_id_to_db(event.index)?)
        .bind(&event.payload)
        .bind(event.handled)
        .execute(&mut *self.tx)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }
}
