//! Idempotency keys
//!
//! Remembers which client-supplied keys (inbound activity ids among them)
//! were already processed. Records live for an hour; expiry is checked
//! when a key is read, never by a sweeper.

use chrono::{Duration, Utc};

use crate::data::Database;
use crate::error::AppError;

/// How long a processed key is remembered, in seconds
pub const IDEMPOTENCY_TTL_SECONDS: i64 = 3600;

/// Record `key` as processed, producing `object_id`
///
/// A key that is already recorded and unexpired is left untouched; the
/// duplicate is logged, not returned as an error. An expired record is
/// replaced.
pub async fn insert_key(db: &Database, key: &str, object_id: &str) -> Result<(), AppError> {
    let now = Utc::now();
    let expires_at = now + Duration::seconds(IDEMPOTENCY_TTL_SECONDS);
    if !db
        .insert_idempotency_key(key, object_id, expires_at, now)
        .await?
    {
        tracing::debug!(key, object_id, "Idempotency key already recorded");
    }
    Ok(())
}

/// Object id recorded for `key`, if it was seen and has not expired
pub async fn has_key(db: &Database, key: &str) -> Result<Option<String>, AppError> {
    let record = db.get_idempotency_record(key).await?;
    Ok(record
        .filter(|record| record.expires_at > Utc::now())
        .map(|record| record.object_id))
}
