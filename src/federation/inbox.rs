//! Inbound activity processing
//!
//! Authenticates a POSTed activity by its HTTP signature, drops replays by
//! activity id, and applies follow-graph changes to the ledger.

use chrono::Utc;
use http::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::actors::ActorDirectory;
use super::delivery::builder;
use super::following;
use super::queue::{DeliveryMessage, DeliveryQueue};
use super::signature::{
    check_freshness, digest_matches_body, key_id_matches_actor, parse_signature, verify,
};
use crate::data::{Actor, Database};
use crate::error::AppError;
use crate::service::idempotency;

/// Raw inbound request
#[derive(Debug, Clone, Copy)]
pub struct InboxRequest<'a> {
    pub method: &'a str,
    pub path_and_query: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

/// What happened to an authenticated activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    /// Applied to local state
    Processed,
    /// Activity id seen before; nothing done
    Duplicate,
    /// Valid but not something we act on
    Ignored,
}

/// Collaborators the inbox needs
pub struct Inbox<'a, Q> {
    pub db: &'a Database,
    pub directory: &'a ActorDirectory,
    pub queue: &'a Q,
    pub max_skew: Duration,
}

#[derive(Debug, Deserialize)]
struct InboundActivity {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    actor: Value,
    #[serde(default)]
    object: Value,
}

/// `id` of a value that is either a bare URL or an object
fn value_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(id) => Some(id),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

/// Idempotency key for an activity id as sent by `signer_id`
fn replay_key(signer_id: &str, activity_id: &str) -> String {
    format!("{} {}", signer_id, activity_id)
}

fn value_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

impl<Q: DeliveryQueue> Inbox<'_, Q> {
    /// Authenticate and apply one inbound activity
    ///
    /// # Errors
    /// - `Unauthorized` for unsigned requests or unresolvable signers
    /// - `InvalidSignature` for stale or non-verifying signatures
    /// - `Validation` for unreadable activities
    pub async fn process(&self, request: InboxRequest<'_>) -> Result<InboxOutcome, AppError> {
        // 1. Anonymous requests may not post
        let parsed = parse_signature(request.method, request.path_and_query, request.headers)?
            .ok_or(AppError::Unauthorized)?;

        // 2. Replay window
        check_freshness(&parsed, Utc::now(), self.max_skew)?;

        let activity: InboundActivity = serde_json::from_slice(request.body)
            .map_err(|e| AppError::Validation(format!("Invalid activity: {}", e)))?;
        let actor_id = value_id(&activity.actor)
            .ok_or_else(|| AppError::Validation("Activity has no actor".to_string()))?
            .to_string();

        if !key_id_matches_actor(&parsed.key_id, &actor_id) {
            tracing::warn!(
                key_id = %parsed.key_id,
                actor_id,
                "Signature key does not belong to activity actor"
            );
            return Err(AppError::Unauthorized);
        }

        if !digest_matches_body(&parsed, request.headers, request.body) {
            tracing::warn!(actor_id, "Digest does not match body");
            return Err(AppError::InvalidSignature);
        }

        // 3. Resolve the signer
        let signer = self
            .directory
            .get_and_cache(parsed.key_owner())
            .await?
            .ok_or_else(|| {
                tracing::warn!(key_id = %parsed.key_id, "Could not resolve signing actor");
                AppError::Unauthorized
            })?;

        // 4. Verify, refetching once in case the remote rotated its key
        if !verify(&parsed, &signer.public_key_pem) {
            let refreshed = if signer.is_local {
                None
            } else {
                self.directory.refetch(&signer.id).await?
            };
            let verified = refreshed
                .filter(|actor| actor.public_key_pem != signer.public_key_pem)
                .map(|actor| verify(&parsed, &actor.public_key_pem))
                .unwrap_or(false);
            if !verified {
                tracing::warn!(actor_id, "Signature verification failed");
                return Err(AppError::InvalidSignature);
            }
        }

        crate::metrics::ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind.as_str()])
            .inc();

        // 5. Replays are a no-op. Keys are per signer so one actor cannot
        // claim another's activity ids.
        let dedup_key = activity
            .id
            .as_deref()
            .map(|activity_id| replay_key(&signer.id, activity_id));
        if let (Some(key), Some(activity_id)) = (dedup_key.as_deref(), activity.id.as_deref()) {
            if idempotency::has_key(self.db, key).await?.is_some() {
                tracing::debug!(activity_id, signer = %signer.id, "Activity already processed");
                return Ok(InboxOutcome::Duplicate);
            }
        }

        // 6. Dispatch
        let outcome = match activity.kind.as_str() {
            "Follow" => self.handle_follow(&signer, &activity).await?,
            "Accept" => self.handle_accept(&signer, &activity).await?,
            "Reject" => self.handle_reject(&signer, &activity).await?,
            "Undo" => self.handle_undo(&signer, &activity).await?,
            other => {
                tracing::debug!(activity_type = other, actor_id, "Ignoring activity");
                InboxOutcome::Ignored
            }
        };

        if let (Some(key), Some(activity_id)) = (dedup_key.as_deref(), activity.id.as_deref()) {
            idempotency::insert_key(self.db, key, activity_id).await?;
        }

        Ok(outcome)
    }

    /// Local actor named by `id`, if it is one of ours
    async fn local_actor(&self, id: Option<&str>) -> Result<Option<Actor>, AppError> {
        let Some(id) = id else {
            return Ok(None);
        };
        Ok(self
            .directory
            .get_by_id(id)
            .await?
            .filter(|actor| actor.is_local))
    }

    /// Remote follows a local actor: record, auto-accept, answer with Accept
    async fn handle_follow(
        &self,
        follower: &Actor,
        activity: &InboundActivity,
    ) -> Result<InboxOutcome, AppError> {
        let Some(target) = self.local_actor(value_id(&activity.object)).await? else {
            tracing::debug!(follower = %follower.id, "Follow of unknown local actor");
            return Ok(InboxOutcome::Ignored);
        };

        following::add_following(self.db, &follower.id, &target.id, &target.handle).await?;
        following::accept_following(self.db, &follower.id, &target.id).await?;

        let original = serde_json::json!({
            "id": activity.id,
            "type": "Follow",
            "actor": follower.id,
            "object": target.id,
        });
        let accept = builder::accept(&builder::activity_id(&target.id), &target.id, original);
        self.queue
            .enqueue(DeliveryMessage::activity(&target, &follower.id, accept))
            .await?;

        Ok(InboxOutcome::Processed)
    }

    /// Local follower of the Follow wrapped in an Accept or Reject sent by `remote`
    async fn follower_of_answered_follow(
        &self,
        remote: &Actor,
        activity: &InboundActivity,
    ) -> Result<Option<Actor>, AppError> {
        let follow = &activity.object;
        if let Some(kind) = value_type(follow) {
            if kind != "Follow" {
                return Ok(None);
            }
        }

        if let Some(object) = follow.get("object").and_then(value_id) {
            if object != remote.id {
                tracing::warn!(remote = %remote.id, object, "Answer to a follow of someone else");
                return Ok(None);
            }
        }

        self.local_actor(follow.get("actor").and_then(value_id)).await
    }

    async fn handle_accept(
        &self,
        remote: &Actor,
        activity: &InboundActivity,
    ) -> Result<InboxOutcome, AppError> {
        let Some(local) = self.follower_of_answered_follow(remote, activity).await? else {
            return Ok(InboxOutcome::Ignored);
        };

        if following::accept_following(self.db, &local.id, &remote.id).await? {
            Ok(InboxOutcome::Processed)
        } else {
            Ok(InboxOutcome::Ignored)
        }
    }

    async fn handle_reject(
        &self,
        remote: &Actor,
        activity: &InboundActivity,
    ) -> Result<InboxOutcome, AppError> {
        let Some(local) = self.follower_of_answered_follow(remote, activity).await? else {
            return Ok(InboxOutcome::Ignored);
        };

        following::remove_following(self.db, &local.id, &remote.id).await?;
        Ok(InboxOutcome::Processed)
    }

    /// Only `Undo{Follow}` by the original follower is honoured
    async fn handle_undo(
        &self,
        remote: &Actor,
        activity: &InboundActivity,
    ) -> Result<InboxOutcome, AppError> {
        let undone = &activity.object;
        if value_type(undone) != Some("Follow") {
            return Ok(InboxOutcome::Ignored);
        }

        if undone.get("actor").and_then(value_id) != Some(remote.id.as_str()) {
            tracing::warn!(remote = %remote.id, "Undo of a follow made by someone else");
            return Ok(InboxOutcome::Ignored);
        }

        let Some(local) = self
            .local_actor(undone.get("object").and_then(value_id))
            .await?
        else {
            return Ok(InboxOutcome::Ignored);
        };

        following::remove_following(self.db, &remote.id, &local.id).await?;
        Ok(InboxOutcome::Processed)
    }
}
