//! PostgreSQL implementation of the persistence boundary
//!
//! Production persistence with:
//! - Sequence assignment inside a transaction, with a bounded restart
//!   loop on `(workflow_id, event_seq)` conflicts
//! - Compare-and-set heartbeat and release on the lease row
//! - A token counter table so fencing tokens keep increasing across
//!   release/re-acquire cycles
//! - The step-completion commit (journal append + completion row) in one
//!   transaction

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use contd_core::{CompletedStep, Event, EventPayload, Lease, Snapshot, SnapshotState, StepAttempt};

use super::store::{
    AttemptOutcome, BlobStore, DurableStore, IdempotencyStore, JournalStore, LeaseStore,
    SnapshotStore, StoreError,
};

/// How many times a conflicted sequence assignment restarts before the
/// append fails cleanly
const MAX_SEQ_RETRIES: u32 = 5;

/// PostgreSQL store over a connection pool
///
/// # Example
///
/// ```ignore
/// use contd_durable::persistence::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/contd").await?;
/// let store = PostgresStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, StoreError> {
        self.pool.begin().await.map_err(db_error)
    }

    /// Insert an event at the next sequence inside `tx`. Returns the
    /// sealed event, or `None` when the sequence was taken concurrently
    /// and the caller should restart.
    async fn try_insert_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> Result<Option<Event>, StoreError> {
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(event_seq), 0) + 1 FROM contd_events WHERE workflow_id = $1",
        )
        .bind(&event.workflow_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_error)?;

        let sealed = event.clone().assign_seq(next);
        let payload = serde_json::to_value(&sealed.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO contd_events
                (workflow_id, event_seq, event_id, event_type, payload,
                 timestamp, schema_version, producer_version, checksum, org_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&sealed.workflow_id)
        .bind(sealed.event_seq)
        .bind(sealed.event_id)
        .bind(sealed.event_type().to_string())
        .bind(&payload)
        .bind(sealed.timestamp)
        .bind(sealed.schema_version as i32)
        .bind(&sealed.producer_version)
        .bind(&sealed.checksum)
        .bind(&sealed.org_id)
        .execute(&mut **tx)
        .await;

        match inserted {
            Ok(_) => Ok(Some(sealed)),
            Err(err) if is_unique_violation(&err, "contd_events_event_id_key") => {
                Err(StoreError::DuplicateEvent(sealed.event_id))
            }
            Err(err) if is_unique_violation(&err, "contd_events_pkey") => Ok(None),
            Err(err) => Err(db_error(err)),
        }
    }
}

#[async_trait]
impl JournalStore for PostgresStore {
    #[instrument(skip(self, event), fields(workflow_id = %event.workflow_id))]
    async fn append(&self, event: Event) -> Result<Event, StoreError> {
        for _ in 0..MAX_SEQ_RETRIES {
            let mut tx = self.begin().await?;
            match self.try_insert_event(&mut tx, &event).await? {
                Some(sealed) => {
                    tx.commit().await.map_err(db_error)?;
                    debug!(seq = sealed.event_seq, "event appended");
                    return Ok(sealed);
                }
                None => {
                    // Another appender won the sequence; restart.
                    tx.rollback().await.map_err(db_error)?;
                }
            }
        }
        Err(StoreError::SequenceConflict {
            workflow_id: event.workflow_id,
            seq: 0,
        })
    }

    async fn read_range(
        &self,
        workflow_id: &str,
        from_seq: i64,
        to_seq: i64,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, event_seq, event_id, payload, timestamp,
                   schema_version, producer_version, checksum, org_id
            FROM contd_events
            WHERE workflow_id = $1 AND event_seq >= $2 AND event_seq <= $3
            ORDER BY event_seq ASC
            "#,
        )
        .bind(workflow_id)
        .bind(from_seq)
        .bind(to_seq)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(event_from_row).collect()
    }

    async fn tail(&self, workflow_id: &str) -> Result<Option<(i64, Uuid)>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT event_seq, event_id
            FROM contd_events
            WHERE workflow_id = $1
            ORDER BY event_seq DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(|row| (row.get("event_seq"), row.get("event_id"))))
    }
}

#[async_trait]
impl SnapshotStore for PostgresStore {
    #[instrument(skip(self, snapshot), fields(snapshot_id = %snapshot.snapshot_id))]
    async fn put(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let (inline, external_ref) = match &snapshot.state {
            SnapshotState::Inline { state } => (
                Some(
                    serde_json::to_value(state)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                ),
                None,
            ),
            SnapshotState::External { reference } => (None, Some(reference.clone())),
        };

        sqlx::query(
            r#"
            INSERT INTO contd_snapshots
                (snapshot_id, workflow_id, org_id, step_number, last_event_seq,
                 state_inline, state_external_ref, state_checksum, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (snapshot_id) DO NOTHING
            "#,
        )
        .bind(snapshot.snapshot_id)
        .bind(&snapshot.workflow_id)
        .bind(&snapshot.org_id)
        .bind(snapshot.step_number as i64)
        .bind(snapshot.last_event_seq)
        .bind(&inline)
        .bind(&external_ref)
        .bind(&snapshot.state_checksum)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn get(&self, snapshot_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(SNAPSHOT_COLUMNS_WHERE_ID)
            .bind(snapshot_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn get_latest(
        &self,
        workflow_id: &str,
        max_seq: i64,
    ) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT snapshot_id, workflow_id, org_id, step_number, last_event_seq,
                   state_inline, state_external_ref, state_checksum, created_at
            FROM contd_snapshots
            WHERE workflow_id = $1 AND last_event_seq <= $2
            ORDER BY last_event_seq DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .bind(max_seq)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn list(&self, workflow_id: &str) -> Result<Vec<Snapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT snapshot_id, workflow_id, org_id, step_number, last_event_seq,
                   state_inline, state_external_ref, state_checksum, created_at
            FROM contd_snapshots
            WHERE workflow_id = $1
            ORDER BY last_event_seq DESC, created_at DESC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(snapshot_from_row).collect()
    }
}

#[async_trait]
impl LeaseStore for PostgresStore {
    #[instrument(skip(self))]
    async fn acquire(
        &self,
        workflow_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let mut tx = self.begin().await?;

        // The counter row serializes acquisitions per workflow and keeps
        // the token monotonic across release cycles.
        sqlx::query(
            "INSERT INTO contd_lease_tokens (workflow_id, last_token) VALUES ($1, 0)
             ON CONFLICT (workflow_id) DO NOTHING",
        )
        .bind(workflow_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let last_token: i64 = sqlx::query_scalar(
            "SELECT last_token FROM contd_lease_tokens WHERE workflow_id = $1 FOR UPDATE",
        )
        .bind(workflow_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        let now = Utc::now();
        let existing = sqlx::query(
            "SELECT owner_id, lease_expires_at FROM contd_workflow_leases WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        if let Some(row) = existing {
            let holder: String = row.get("owner_id");
            let expires_at: DateTime<Utc> = row.get("lease_expires_at");
            if expires_at > now && holder != owner_id {
                return Err(StoreError::LeaseHeld {
                    workflow_id: workflow_id.to_string(),
                    owner_id: holder,
                    expires_at,
                });
            }
        }

        let lease = Lease::granted(workflow_id, owner_id, last_token + 1, ttl, now);
        sqlx::query(
            r#"
            INSERT INTO contd_workflow_leases
                (workflow_id, owner_id, acquired_at, lease_expires_at, heartbeat_at, fencing_token)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (workflow_id) DO UPDATE SET
                owner_id = EXCLUDED.owner_id,
                acquired_at = EXCLUDED.acquired_at,
                lease_expires_at = EXCLUDED.lease_expires_at,
                heartbeat_at = EXCLUDED.heartbeat_at,
                fencing_token = EXCLUDED.fencing_token
            "#,
        )
        .bind(&lease.workflow_id)
        .bind(&lease.owner_id)
        .bind(lease.acquired_at)
        .bind(lease.lease_expires_at)
        .bind(lease.heartbeat_at)
        .bind(lease.fencing_token)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        sqlx::query("UPDATE contd_lease_tokens SET last_token = $2 WHERE workflow_id = $1")
            .bind(workflow_id)
            .bind(lease.fencing_token)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(lease)
    }

    async fn heartbeat(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError> {
        let now = Utc::now();
        let expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));

        let row = sqlx::query(
            r#"
            UPDATE contd_workflow_leases
            SET heartbeat_at = $4, lease_expires_at = $5
            WHERE workflow_id = $1 AND owner_id = $2 AND fencing_token = $3
            RETURNING workflow_id, owner_id, acquired_at, lease_expires_at, heartbeat_at, fencing_token
            "#,
        )
        .bind(&lease.workflow_id)
        .bind(&lease.owner_id)
        .bind(lease.fencing_token)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(row) => Ok(lease_from_row(&row)),
            None => Err(StoreError::LeaseMismatch(lease.workflow_id.clone())),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM contd_workflow_leases
             WHERE workflow_id = $1 AND owner_id = $2 AND fencing_token = $3",
        )
        .bind(&lease.workflow_id)
        .bind(&lease.owner_id)
        .bind(lease.fencing_token)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_lease(&self, workflow_id: &str) -> Result<Option<Lease>, StoreError> {
        let row = sqlx::query(
            "SELECT workflow_id, owner_id, acquired_at, lease_expires_at, heartbeat_at, fencing_token
             FROM contd_workflow_leases WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(|row| lease_from_row(&row)))
    }
}

#[async_trait]
impl IdempotencyStore for PostgresStore {
    async fn check_completed(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<CompletedStep>, StoreError> {
        let row = sqlx::query(
            "SELECT workflow_id, step_id, attempt_id, completed_at, result, result_checksum
             FROM contd_completed_steps WHERE workflow_id = $1 AND step_id = $2",
        )
        .bind(workflow_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(|row| completion_from_row(&row)))
    }

    #[instrument(skip(self))]
    async fn allocate_attempt(
        &self,
        workflow_id: &str,
        step_id: &str,
        fencing_token: i64,
    ) -> Result<AttemptOutcome, StoreError> {
        let mut tx = self.begin().await?;

        // Fencing check: the caller's token must still be the live lease.
        let current: Option<i64> = sqlx::query_scalar(
            "SELECT fencing_token FROM contd_workflow_leases WHERE workflow_id = $1 FOR UPDATE",
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;
        if current != Some(fencing_token) {
            return Err(StoreError::LeaseMismatch(workflow_id.to_string()));
        }

        let done = sqlx::query(
            "SELECT workflow_id, step_id, attempt_id, completed_at, result, result_checksum
             FROM contd_completed_steps WHERE workflow_id = $1 AND step_id = $2",
        )
        .bind(workflow_id)
        .bind(step_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;
        if let Some(row) = done {
            return Ok(AttemptOutcome::AlreadyCompleted(completion_from_row(&row)));
        }

        let attempt_id: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(attempt_id), 0) + 1 FROM contd_step_attempts
             WHERE workflow_id = $1 AND step_id = $2",
        )
        .bind(workflow_id)
        .bind(step_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        let attempt = StepAttempt {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            attempt_id: attempt_id as u32,
            started_at: Utc::now(),
            fencing_token,
        };
        sqlx::query(
            "INSERT INTO contd_step_attempts
                 (workflow_id, step_id, attempt_id, started_at, fencing_token)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&attempt.workflow_id)
        .bind(&attempt.step_id)
        .bind(attempt.attempt_id as i32)
        .bind(attempt.started_at)
        .bind(attempt.fencing_token)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(AttemptOutcome::Allocated(attempt))
    }

    async fn mark_completed(&self, completion: CompletedStep) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO contd_completed_steps
                (workflow_id, step_id, attempt_id, completed_at, result, result_checksum)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (workflow_id, step_id) DO NOTHING
            "#,
        )
        .bind(&completion.workflow_id)
        .bind(&completion.step_id)
        .bind(completion.attempt_id as i32)
        .bind(completion.completed_at)
        .bind(&completion.result)
        .bind(&completion.result_checksum)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if inserted.rows_affected() == 1 {
            return Ok(());
        }

        // The row exists; only the identical completion is acceptable.
        let existing = self
            .check_completed(&completion.workflow_id, &completion.step_id)
            .await?;
        match existing {
            Some(row)
                if row.attempt_id == completion.attempt_id
                    && row.result_checksum == completion.result_checksum =>
            {
                Ok(())
            }
            _ => Err(StoreError::AlreadyCompleted {
                workflow_id: completion.workflow_id,
                step_id: completion.step_id,
            }),
        }
    }

    async fn list_completions(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<CompletedStep>, StoreError> {
        let rows = sqlx::query(
            "SELECT workflow_id, step_id, attempt_id, completed_at, result, result_checksum
             FROM contd_completed_steps WHERE workflow_id = $1 ORDER BY completed_at ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.iter().map(completion_from_row).collect())
    }
}

#[async_trait]
impl BlobStore for PostgresStore {
    async fn put_blob(&self, reference: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO contd_blobs (reference, content) VALUES ($1, $2)
             ON CONFLICT (reference) DO UPDATE SET content = EXCLUDED.content",
        )
        .bind(reference)
        .bind(&bytes)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_blob(&self, reference: &str) -> Result<Vec<u8>, StoreError> {
        let row = sqlx::query("SELECT content FROM contd_blobs WHERE reference = $1")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(|row| row.get("content"))
            .ok_or_else(|| StoreError::BlobMissing(reference.to_string()))
    }
}

#[async_trait]
impl DurableStore for PostgresStore {
    #[instrument(skip(self, event, completion), fields(workflow_id = %event.workflow_id))]
    async fn append_with_completion(
        &self,
        event: Event,
        completion: CompletedStep,
        fencing_token: i64,
    ) -> Result<Event, StoreError> {
        for _ in 0..MAX_SEQ_RETRIES {
            let mut tx = self.begin().await?;

            // Fencing check inside the commit, mirroring allocate_attempt:
            // a stale owner must not land a completion under any ordering.
            let current: Option<i64> = sqlx::query_scalar(
                "SELECT fencing_token FROM contd_workflow_leases WHERE workflow_id = $1 FOR UPDATE",
            )
            .bind(&event.workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?;
            if current != Some(fencing_token) {
                return Err(StoreError::LeaseMismatch(event.workflow_id.clone()));
            }

            let Some(sealed) = self.try_insert_event(&mut tx, &event).await? else {
                tx.rollback().await.map_err(db_error)?;
                continue;
            };

            let inserted = sqlx::query(
                r#"
                INSERT INTO contd_completed_steps
                    (workflow_id, step_id, attempt_id, completed_at, result, result_checksum)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&completion.workflow_id)
            .bind(&completion.step_id)
            .bind(completion.attempt_id as i32)
            .bind(completion.completed_at)
            .bind(&completion.result)
            .bind(&completion.result_checksum)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {
                    tx.commit().await.map_err(db_error)?;
                    return Ok(sealed);
                }
                Err(err) if is_unique_violation(&err, "contd_completed_steps_pkey") => {
                    // Another attempt committed first; the journal insert
                    // rolls back with the transaction.
                    return Err(StoreError::AlreadyCompleted {
                        workflow_id: completion.workflow_id,
                        step_id: completion.step_id,
                    });
                }
                Err(err) => {
                    error!(error = %err, "completion commit failed");
                    return Err(db_error(err));
                }
            }
        }
        Err(StoreError::SequenceConflict {
            workflow_id: event.workflow_id,
            seq: 0,
        })
    }
}

const SNAPSHOT_COLUMNS_WHERE_ID: &str = r#"
    SELECT snapshot_id, workflow_id, org_id, step_number, last_event_seq,
           state_inline, state_external_ref, state_checksum, created_at
    FROM contd_snapshots
    WHERE snapshot_id = $1
"#;

fn db_error(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    err.as_database_error()
        .map(|db| {
            db.code().as_deref() == Some("23505")
                && db.constraint().map(|c| c == constraint).unwrap_or(true)
        })
        .unwrap_or(false)
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<Event, StoreError> {
    let payload: serde_json::Value = row.get("payload");
    let payload: EventPayload = serde_json::from_value(payload)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Event {
        event_id: row.get("event_id"),
        workflow_id: row.get("workflow_id"),
        org_id: row.get("org_id"),
        event_seq: row.get("event_seq"),
        payload,
        timestamp: row.get("timestamp"),
        schema_version: row.get::<i32, _>("schema_version") as u32,
        producer_version: row.get("producer_version"),
        checksum: row.get("checksum"),
    })
}

fn snapshot_from_row(row: &sqlx::postgres::PgRow) -> Result<Snapshot, StoreError> {
    let inline: Option<serde_json::Value> = row.get("state_inline");
    let external_ref: Option<String> = row.get("state_external_ref");

    let state = match (inline, external_ref) {
        (Some(value), _) => SnapshotState::Inline {
            state: serde_json::from_value(value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        },
        (None, Some(reference)) => SnapshotState::External { reference },
        (None, None) => {
            return Err(StoreError::Serialization(
                "snapshot row has neither inline state nor external ref".to_string(),
            ))
        }
    };

    Ok(Snapshot {
        snapshot_id: row.get("snapshot_id"),
        workflow_id: row.get("workflow_id"),
        org_id: row.get("org_id"),
        step_number: row.get::<i64, _>("step_number") as u64,
        last_event_seq: row.get("last_event_seq"),
        state,
        state_checksum: row.get("state_checksum"),
        created_at: row.get("created_at"),
    })
}

fn lease_from_row(row: &sqlx::postgres::PgRow) -> Lease {
    Lease {
        workflow_id: row.get("workflow_id"),
        owner_id: row.get("owner_id"),
        acquired_at: row.get("acquired_at"),
        lease_expires_at: row.get("lease_expires_at"),
        heartbeat_at: row.get("heartbeat_at"),
        fencing_token: row.get("fencing_token"),
    }
}

fn completion_from_row(row: &sqlx::postgres::PgRow) -> CompletedStep {
    CompletedStep {
        workflow_id: row.get("workflow_id"),
        step_id: row.get("step_id"),
        attempt_id: row.get::<i32, _>("attempt_id") as u32,
        completed_at: row.get("completed_at"),
        result: row.get("result"),
        result_checksum: row.get("result_checksum"),
    }
}
