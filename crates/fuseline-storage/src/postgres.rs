//! PostgreSQL implementation of RuntimeStorage
//!
//! Four tables: `steps` (state, result, lease per step), `queue` (FIFO via a
//! `position` column), `inputs` (one JSONB payload per run) and
//! `fuseline_meta` (migration bookkeeping). Migrations are a monotone list
//! keyed by integer version; the adapter applies every version above the one
//! stored in `fuseline_meta` until it reaches [`Self::LATEST_VERSION`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuseline_core::Status;
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::{Lease, RuntimeStorage, StoreError};

const MIGRATIONS: &[(i32, &[&str])] = &[(
    1,
    &[
        r#"
        CREATE TABLE IF NOT EXISTS steps (
            workflow_id TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            step_name TEXT NOT NULL,
            state TEXT NOT NULL,
            result JSONB,
            worker_id TEXT,
            expires_at TIMESTAMPTZ,
            PRIMARY KEY (workflow_id, instance_id, step_name)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS queue (
            workflow_id TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            step_name TEXT NOT NULL,
            position BIGINT NOT NULL,
            PRIMARY KEY (workflow_id, instance_id, step_name)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS inputs (
            workflow_id TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            payload JSONB NOT NULL,
            PRIMARY KEY (workflow_id, instance_id)
        )
        "#,
    ],
)];

/// Runtime state in a PostgreSQL database with versioned migrations.
pub struct PostgresRuntimeStorage {
    pool: PgPool,
}

impl PostgresRuntimeStorage {
    pub const LATEST_VERSION: i32 = 1;

    /// Connect and bring the schema up to [`Self::LATEST_VERSION`].
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(dsn).await?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    /// Wrap an existing pool, still applying pending migrations.
    pub async fn with_pool(pool: PgPool) -> Result<Self, StoreError> {
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn stored_version(&self) -> Result<i32, StoreError> {
        sqlx::query("CREATE TABLE IF NOT EXISTS fuseline_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&self.pool)
            .await?;
        let row = sqlx::query("SELECT value FROM fuseline_meta WHERE key = 'version'")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let value: String = row.try_get("value")?;
                value
                    .parse()
                    .map_err(|_| StoreError::Serialization(format!("bad schema version: {value}")))
            }
            None => Ok(0),
        }
    }

    async fn set_version(&self, version: i32) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO fuseline_meta (key, value) VALUES ('version', $1)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(version.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let stored = self.stored_version().await?;
        for (version, statements) in MIGRATIONS {
            if *version <= stored {
                continue;
            }
            tracing::info!(version = *version, "applying storage migration");
            for statement in *statements {
                sqlx::query(statement).execute(&self.pool).await?;
            }
            self.set_version(*version).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeStorage for PostgresRuntimeStorage {
    async fn create_run(
        &self,
        workflow_id: &str,
        instance_id: &str,
        steps: &[String],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for step in steps {
            sqlx::query(
                "INSERT INTO steps (workflow_id, instance_id, step_name, state)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (workflow_id, instance_id, step_name)
                 DO UPDATE SET state = EXCLUDED.state, result = NULL,
                               worker_id = NULL, expires_at = NULL",
            )
            .bind(workflow_id)
            .bind(instance_id)
            .bind(step)
            .bind(Status::Pending.as_str())
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM queue WHERE workflow_id = $1 AND instance_id = $2")
            .bind(workflow_id)
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM inputs WHERE workflow_id = $1 AND instance_id = $2")
            .bind(workflow_id)
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn enqueue(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO queue (workflow_id, instance_id, step_name, position)
             VALUES ($1, $2, $3,
                     COALESCE((SELECT MAX(position) + 1 FROM queue
                               WHERE workflow_id = $1 AND instance_id = $2), 0))
             ON CONFLICT DO NOTHING",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue_front(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO queue (workflow_id, instance_id, step_name, position)
             VALUES ($1, $2, $3,
                     COALESCE((SELECT MIN(position) - 1 FROM queue
                               WHERE workflow_id = $1 AND instance_id = $2), 0))
             ON CONFLICT DO NOTHING",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_next(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT step_name FROM queue
             WHERE workflow_id = $1 AND instance_id = $2
             ORDER BY position
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await?;
        let step_name = match row {
            Some(row) => row.try_get::<String, _>("step_name")?,
            None => return Ok(None),
        };
        sqlx::query(
            "DELETE FROM queue
             WHERE workflow_id = $1 AND instance_id = $2 AND step_name = $3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(&step_name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(step_name))
    }

    async fn queue_size(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<usize, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM queue WHERE workflow_id = $1 AND instance_id = $2",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as usize)
    }

    async fn assign_step(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        worker_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE steps SET worker_id = $4, expires_at = $5
             WHERE workflow_id = $1 AND instance_id = $2 AND step_name = $3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .bind(worker_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_assignment(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE steps SET worker_id = NULL, expires_at = NULL
             WHERE workflow_id = $1 AND instance_id = $2 AND step_name = $3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_assignment(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Lease>, StoreError> {
        let row = sqlx::query(
            "SELECT worker_id, expires_at FROM steps
             WHERE workflow_id = $1 AND instance_id = $2 AND step_name = $3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let worker_id: Option<String> = row.try_get("worker_id")?;
        let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at")?;
        Ok(match (worker_id, expires_at) {
            (Some(worker_id), Some(expires_at)) => Some(Lease {
                worker_id,
                expires_at,
            }),
            _ => None,
        })
    }

    async fn expired_assignments(
        &self,
        workflow_id: &str,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT step_name FROM steps
             WHERE workflow_id = $1 AND instance_id = $2
               AND worker_id IS NOT NULL AND expires_at < $3
             ORDER BY step_name",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("step_name").map_err(Into::into))
            .collect()
    }

    async fn set_state(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        state: Status,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE steps SET state = $4
             WHERE workflow_id = $1 AND instance_id = $2 AND step_name = $3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_state(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Status>, StoreError> {
        let row = sqlx::query(
            "SELECT state FROM steps
             WHERE workflow_id = $1 AND instance_id = $2 AND step_name = $3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let state: String = row.try_get("state")?;
                Status::parse(&state)
                    .map(Some)
                    .ok_or_else(|| StoreError::Serialization(format!("bad step state: {state}")))
            }
            None => Ok(None),
        }
    }

    async fn list_states(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Vec<(String, Status)>, StoreError> {
        let rows = sqlx::query(
            "SELECT step_name, state FROM steps
             WHERE workflow_id = $1 AND instance_id = $2
             ORDER BY step_name",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let name: String = row.try_get("step_name")?;
                let state: String = row.try_get("state")?;
                let state = Status::parse(&state).ok_or_else(|| {
                    StoreError::Serialization(format!("bad step state: {state}"))
                })?;
                Ok((name, state))
            })
            .collect()
    }

    async fn set_inputs(
        &self,
        workflow_id: &str,
        instance_id: &str,
        inputs: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO inputs (workflow_id, instance_id, payload) VALUES ($1, $2, $3)
             ON CONFLICT (workflow_id, instance_id) DO UPDATE SET payload = EXCLUDED.payload",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(Value::Object(inputs.clone()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_inputs(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Map<String, Value>, StoreError> {
        let row = sqlx::query(
            "SELECT payload FROM inputs WHERE workflow_id = $1 AND instance_id = $2",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let payload: Value = row.try_get("payload")?;
                match payload {
                    Value::Object(map) => Ok(map),
                    other => Err(StoreError::Serialization(format!(
                        "inputs payload is not an object: {other}"
                    ))),
                }
            }
            None => Ok(Map::new()),
        }
    }

    async fn set_result(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        result: &Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE steps SET result = $4
             WHERE workflow_id = $1 AND instance_id = $2 AND step_name = $3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_result(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(
            "SELECT result FROM steps
             WHERE workflow_id = $1 AND instance_id = $2 AND step_name = $3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<Value>, _>("result")?),
            None => Ok(None),
        }
    }

    async fn finalize_run(&self, workflow_id: &str, instance_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM queue WHERE workflow_id = $1 AND instance_id = $2")
            .bind(workflow_id)
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE steps SET worker_id = NULL, expires_at = NULL
             WHERE workflow_id = $1 AND instance_id = $2",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn is_finished(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT NOT EXISTS(SELECT 1 FROM queue
                               WHERE workflow_id = $1 AND instance_id = $2)
                AND NOT EXISTS(SELECT 1 FROM steps
                               WHERE workflow_id = $1 AND instance_id = $2
                                 AND state IN ('PENDING', 'RUNNING')) AS finished",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("finished")?)
    }
}
