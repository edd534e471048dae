//! SQLite database operations
//!
//! All database access goes through this module.
//! The store is the single source of truth for actors, relationships,
//! idempotency keys and queued deliveries; every state transition is a
//! single conditional statement so concurrent handlers never need an
//! application-level lock.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        Self::connect_with_pool_size(path, 8).await
    }

    /// Connect with an explicit connection limit.
    pub async fn connect_with_pool_size(
        path: &Path,
        max_connections: u32,
    ) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Get actor by canonical id
    pub async fn get_actor(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let row = sqlx::query_as::<_, ActorRow>("SELECT * FROM actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Actor::try_from).transpose()
    }

    /// Get a local actor by handle (`username@domain`)
    pub async fn get_local_actor_by_handle(&self, handle: &str) -> Result<Option<Actor>, AppError> {
        let row = sqlx::query_as::<_, ActorRow>(
            "SELECT * FROM actors WHERE is_local = 1 AND handle = ? COLLATE NOCASE",
        )
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Actor::try_from).transpose()
    }

    /// Get a cached remote actor by handle
    pub async fn get_remote_actor_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<Actor>, AppError> {
        let row = sqlx::query_as::<_, ActorRow>(
            "SELECT * FROM actors WHERE is_local = 0 AND handle = ? COLLATE NOCASE ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Actor::try_from).transpose()
    }

    /// Insert actor unless a row with the same id already exists.
    ///
    /// Returns `false` when another writer got there first; that is not an error.
    /// A clashing `compat_id` is redrawn, so the stored value may differ from
    /// `actor.compat_id`; re-read the row when it matters.
    pub async fn insert_actor(&self, actor: &Actor) -> Result<bool, AppError> {
        const COMPAT_ID_ATTEMPTS: usize = 4;

        let mut compat = actor.compat_id;
        for attempt in 1..=COMPAT_ID_ATTEMPTS {
            match self.insert_actor_row(actor, compat).await {
                Err(AppError::Database(sqlx::Error::Database(error)))
                    if error.is_unique_violation()
                        && error.message().contains("compat_id")
                        && attempt < COMPAT_ID_ATTEMPTS =>
                {
                    tracing::debug!(actor_id = %actor.id, compat, "compat_id collision; redrawing");
                    compat = compat_id();
                }
                other => return other,
            }
        }

        Err(AppError::Internal(anyhow::anyhow!(
            "no free compat_id for actor {}",
            actor.id
        )))
    }

    async fn insert_actor_row(&self, actor: &Actor, compat: i64) -> Result<bool, AppError> {
        let profile_json = serde_json::to_string(&actor.profile).map_err(|error| {
            AppError::Internal(anyhow::anyhow!("failed to serialize actor profile: {error}"))
        })?;
        let (wrapped_private_key, private_key_salt) = match &actor.key_material {
            Some(material) => (
                Some(material.wrapped_private_key.as_slice()),
                Some(material.salt.as_slice()),
            ),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO actors (
                id, kind, is_local, handle, public_key_pem, wrapped_private_key, private_key_salt,
                inbox, shared_inbox, outbox, followers, following, profile_json, compat_id,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.kind)
        .bind(actor.is_local)
        .bind(&actor.handle)
        .bind(&actor.public_key_pem)
        .bind(wrapped_private_key)
        .bind(private_key_salt)
        .bind(&actor.inbox)
        .bind(&actor.shared_inbox)
        .bind(&actor.outbox)
        .bind(&actor.followers)
        .bind(&actor.following)
        .bind(&profile_json)
        .bind(compat)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(actor_id = %actor.id, "Actor already stored; duplicate insert ignored");
        }

        Ok(result.rows_affected() > 0)
    }

    /// Overwrite the cached copy of a remote actor with freshly fetched fields.
    ///
    /// Local actors are never touched by this path.
    pub async fn refresh_remote_actor(&self, actor: &Actor) -> Result<(), AppError> {
        let profile_json = serde_json::to_string(&actor.profile).map_err(|error| {
            AppError::Internal(anyhow::anyhow!("failed to serialize actor profile: {error}"))
        })?;

        sqlx::query(
            r#"
            UPDATE actors
            SET kind = ?, handle = ?, public_key_pem = ?, inbox = ?, shared_inbox = ?,
                outbox = ?, followers = ?, following = ?, profile_json = ?, updated_at = ?
            WHERE id = ? AND is_local = 0
            "#,
        )
        .bind(&actor.kind)
        .bind(&actor.handle)
        .bind(&actor.public_key_pem)
        .bind(&actor.inbox)
        .bind(&actor.shared_inbox)
        .bind(&actor.outbox)
        .bind(&actor.followers)
        .bind(&actor.following)
        .bind(&profile_json)
        .bind(actor.updated_at)
        .bind(&actor.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Follow relationships
    // =========================================================================

    /// Insert a pending follow unless the pair already has a row.
    ///
    /// Returns the id of the row that exists after the statement, which is
    /// the pre-existing one on conflict.
    pub async fn insert_following(
        &self,
        id: &str,
        actor_id: &str,
        target_actor_id: &str,
        target_actor_acct: &str,
        created_at: DateTime<Utc>,
    ) -> Result<String, AppError> {
        // A concurrent delete can land between the insert and the lookup.
        for _ in 0..3 {
            let result = sqlx::query(
                r#"
                INSERT INTO actor_following (id, actor_id, target_actor_id, state, target_actor_acct, created_at)
                VALUES (?, ?, ?, 'pending', ?, ?)
                ON CONFLICT(actor_id, target_actor_id) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(actor_id)
            .bind(target_actor_id)
            .bind(target_actor_acct)
            .bind(created_at)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(id.to_string());
            }

            let existing = sqlx::query_scalar::<_, String>(
                "SELECT id FROM actor_following WHERE actor_id = ? AND target_actor_id = ?",
            )
            .bind(actor_id)
            .bind(target_actor_id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(existing_id) = existing {
                tracing::debug!(
                    actor_id,
                    target_actor_id,
                    relationship_id = %existing_id,
                    "Follow already recorded; keeping existing row"
                );
                return Ok(existing_id);
            }
        }

        Err(AppError::Internal(anyhow::anyhow!(
            "follow {actor_id} -> {target_actor_id} kept disappearing during insert"
        )))
    }

    /// Move a pending follow to accepted. Returns whether a row changed.
    pub async fn accept_following(
        &self,
        actor_id: &str,
        target_actor_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE actor_following SET state = 'accepted' WHERE actor_id = ? AND target_actor_id = ? AND state = 'pending'",
        )
        .bind(actor_id)
        .bind(target_actor_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete the follow row for a pair in any state. Returns whether a row existed.
    pub async fn delete_following(
        &self,
        actor_id: &str,
        target_actor_id: &str,
    ) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM actor_following WHERE actor_id = ? AND target_actor_id = ?")
                .bind(actor_id)
                .bind(target_actor_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get the relationship row for a pair, in any state
    pub async fn get_relationship(
        &self,
        actor_id: &str,
        target_actor_id: &str,
    ) -> Result<Option<Relationship>, AppError> {
        let row = sqlx::query_as::<_, RelationshipRow>(
            "SELECT * FROM actor_following WHERE actor_id = ? AND target_actor_id = ?",
        )
        .bind(actor_id)
        .bind(target_actor_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Relationship::try_from).transpose()
    }

    /// Ids of actors with an accepted follow of `target_actor_id`
    pub async fn get_accepted_follower_ids(
        &self,
        target_actor_id: &str,
    ) -> Result<Vec<String>, AppError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT actor_id FROM actor_following WHERE target_actor_id = ? AND state = 'accepted' ORDER BY created_at",
        )
        .bind(target_actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Ids of actors that `actor_id` follows with an accepted follow
    pub async fn get_accepted_following_ids(&self, actor_id: &str) -> Result<Vec<String>, AppError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT target_actor_id FROM actor_following WHERE actor_id = ? AND state = 'accepted' ORDER BY created_at",
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Handles of actors that `actor_id` follows with an accepted follow
    pub async fn get_accepted_following_accts(
        &self,
        actor_id: &str,
    ) -> Result<Vec<String>, AppError> {
        let accts = sqlx::query_scalar::<_, String>(
            "SELECT target_actor_acct FROM actor_following WHERE actor_id = ? AND state = 'accepted' ORDER BY created_at",
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(accts)
    }

    // =========================================================================
    // Idempotency keys
    // =========================================================================

    /// Record a key, replacing an expired record for it.
    ///
    /// Returns `false` if an unexpired record was already present.
    pub async fn insert_idempotency_key(
        &self,
        key: &str,
        object_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, object_id, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE
            SET object_id = excluded.object_id, expires_at = excluded.expires_at
            WHERE idempotency_keys.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(object_id)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a key record regardless of expiry
    pub async fn get_idempotency_record(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, AppError> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            "SELECT key, object_id, expires_at FROM idempotency_keys WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    #[cfg(test)]
    pub(crate) async fn set_idempotency_expiry_for_test(
        &self,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE idempotency_keys SET expires_at = ? WHERE key = ?")
            .bind(expires_at)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Delivery jobs
    // =========================================================================

    /// Persist one queued delivery message
    pub async fn insert_delivery_job(
        &self,
        id: &str,
        message_json: &str,
        now_ms: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_jobs (id, message_json, attempt, status, next_attempt_at_ms, created_at_ms)
            VALUES (?, ?, 0, 'queued', ?, ?)
            "#,
        )
        .bind(id)
        .bind(message_json)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Claim up to `limit` due jobs by leasing them until `lease_until_ms`.
    ///
    /// A job whose lease runs out without being settled becomes claimable
    /// again, which is what makes delivery at-least-once.
    pub async fn claim_delivery_jobs(
        &self,
        now_ms: i64,
        lease_until_ms: i64,
        limit: u32,
    ) -> Result<Vec<DeliveryJob>, AppError> {
        let jobs = sqlx::query_as::<_, DeliveryJob>(
            r#"
            UPDATE delivery_jobs
            SET locked_until_ms = ?
            WHERE id IN (
                SELECT id FROM delivery_jobs
                WHERE status = 'queued'
                  AND next_attempt_at_ms <= ?
                  AND (locked_until_ms IS NULL OR locked_until_ms <= ?)
                ORDER BY next_attempt_at_ms ASC
                LIMIT ?
            )
            RETURNING id, message_json, attempt
            "#,
        )
        .bind(lease_until_ms)
        .bind(now_ms)
        .bind(now_ms)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Mark a job delivered
    pub async fn mark_job_delivered(
        &self,
        id: &str,
        attempt: i64,
        now_ms: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'delivered', attempt = ?, locked_until_ms = NULL, last_error = NULL,
                settled_at_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(attempt)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Release a job for another attempt at `next_attempt_at_ms`
    pub async fn reschedule_job(
        &self,
        id: &str,
        attempt: i64,
        next_attempt_at_ms: i64,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET attempt = ?, next_attempt_at_ms = ?, locked_until_ms = NULL, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(attempt)
        .bind(next_attempt_at_ms)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Give up on a job
    pub async fn mark_job_dead(
        &self,
        id: &str,
        attempt: i64,
        error: &str,
        now_ms: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'dead', attempt = ?, locked_until_ms = NULL, last_error = ?,
                settled_at_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(attempt)
        .bind(error)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete delivered and dead jobs settled before `before_ms`
    pub async fn prune_settled_jobs(&self, before_ms: i64) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM delivery_jobs
            WHERE status IN ('delivered', 'dead')
              AND settled_at_ms IS NOT NULL
              AND settled_at_ms < ?
            "#,
        )
        .bind(before_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Count jobs in a status
    pub async fn count_delivery_jobs(&self, status: JobStatus) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM delivery_jobs WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Messages of queued jobs, oldest first
    pub async fn queued_delivery_messages(&self) -> Result<Vec<String>, AppError> {
        let messages = sqlx::query_scalar::<_, String>(
            "SELECT message_json FROM delivery_jobs WHERE status = 'queued' ORDER BY created_at_ms, id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }
}
