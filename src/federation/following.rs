//! Follow relationship ledger
//!
//! `pending` on a follow request, `accepted` once the target agrees,
//! deleted on unfollow or rejection. Each pair has at most one row.

use chrono::Utc;

use crate::data::{Database, EntityId, Relationship};
use crate::error::AppError;

/// Record that `actor_id` asked to follow `target_actor_id`
///
/// Re-following returns the id of the existing row without touching it.
pub async fn add_following(
    db: &Database,
    actor_id: &str,
    target_actor_id: &str,
    target_actor_acct: &str,
) -> Result<String, AppError> {
    let id = db
        .insert_following(
            &EntityId::new().0,
            actor_id,
            target_actor_id,
            target_actor_acct,
            Utc::now(),
        )
        .await?;

    tracing::info!(actor_id, target_actor_id, relationship_id = %id, "Follow recorded");
    Ok(id)
}

/// Move a pending follow to accepted
///
/// Returns `false` when there is no pending row for the pair, which covers
/// both an unknown follow and one accepted earlier.
pub async fn accept_following(
    db: &Database,
    actor_id: &str,
    target_actor_id: &str,
) -> Result<bool, AppError> {
    let accepted = db.accept_following(actor_id, target_actor_id).await?;
    if accepted {
        tracing::info!(actor_id, target_actor_id, "Follow accepted");
    } else {
        tracing::debug!(actor_id, target_actor_id, "No pending follow to accept");
    }
    Ok(accepted)
}

/// Delete the relationship for the pair in any state
pub async fn remove_following(
    db: &Database,
    actor_id: &str,
    target_actor_id: &str,
) -> Result<(), AppError> {
    if db.delete_following(actor_id, target_actor_id).await? {
        tracing::info!(actor_id, target_actor_id, "Follow removed");
    }
    Ok(())
}

/// Actors with an accepted follow of `target_actor_id`
pub async fn get_followers(db: &Database, target_actor_id: &str) -> Result<Vec<String>, AppError> {
    db.get_accepted_follower_ids(target_actor_id).await
}

/// Actors `actor_id` follows (accepted only)
pub async fn get_following_id(db: &Database, actor_id: &str) -> Result<Vec<String>, AppError> {
    db.get_accepted_following_ids(actor_id).await
}

/// Handles of actors `actor_id` follows (accepted only)
pub async fn get_following_acct(db: &Database, actor_id: &str) -> Result<Vec<String>, AppError> {
    db.get_accepted_following_accts(actor_id).await
}

pub async fn get_relationship(
    db: &Database,
    actor_id: &str,
    target_actor_id: &str,
) -> Result<Option<Relationship>, AppError> {
    db.get_relationship(actor_id, target_actor_id).await
}
