//! Activity delivery
//!
//! Single signed deliveries to a remote inbox, and fan-out to followers
//! through the delivery queue. Fan-out never touches the network; the
//! queue consumer performs the actual POSTs.

use rsa::RsaPrivateKey;
use std::time::{Duration, Instant};

use super::following;
use super::queue::{DeliveryMessage, DeliveryQueue};
use super::signature::{OutgoingRequest, sign};
use crate::data::{Actor, Database};
use crate::error::AppError;

/// Sends signed activities to remote inboxes
#[derive(Clone)]
pub struct DeliveryDispatcher {
    http_client: reqwest::Client,
    timeout: Duration,
    allow_private_hosts: bool,
}

impl DeliveryDispatcher {
    /// Create new delivery service
    pub fn new(http_client: reqwest::Client, timeout: Duration, allow_private_hosts: bool) -> Self {
        Self {
            http_client,
            timeout,
            allow_private_hosts,
        }
    }

    /// Sign and POST `activity` to `to`'s inbox as `from`
    ///
    /// One attempt only. A transport failure or a non-2xx answer is an
    /// [`AppError::Delivery`]; retrying is the caller's business.
    pub async fn deliver_to_actor(
        &self,
        signing_key: &RsaPrivateKey,
        from: &Actor,
        to: &Actor,
        activity: &serde_json::Value,
    ) -> Result<(), AppError> {
        let inbox = to.inbox.clone();
        let failed = |reason: String| AppError::Delivery {
            inbox: inbox.clone(),
            reason,
        };

        // 1. Validate target
        let url = url::Url::parse(&to.inbox)
            .map_err(|e| failed(format!("invalid inbox URL: {}", e)))?;
        super::actors::ensure_remote_url_allowed(&url, self.allow_private_hosts)
            .await
            .map_err(|e| failed(e.to_string()))?;

        // 2. Serialize and sign
        let body = serde_json::to_vec(activity)
            .map_err(|e| failed(format!("failed to serialize activity: {}", e)))?;
        let signed = sign(
            OutgoingRequest::post_activity(url, body),
            signing_key,
            &from.key_id(),
        )?;

        // 3. POST to inbox with signed headers
        let started = Instant::now();
        let result = self
            .http_client
            .post(signed.url)
            .headers(signed.headers)
            .body(signed.body)
            .timeout(self.timeout)
            .send()
            .await;

        crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["deliver"])
            .observe(started.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                crate::metrics::FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["deliver", "error"])
                    .inc();
                crate::metrics::DELIVERIES_TOTAL
                    .with_label_values(&["failed"])
                    .inc();
                return Err(failed(error.to_string()));
            }
        };

        let status = response.status();
        crate::metrics::FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["deliver", status.as_str()])
            .inc();

        // 4. Handle response
        if !status.is_success() {
            crate::metrics::DELIVERIES_TOTAL
                .with_label_values(&["failed"])
                .inc();
            return Err(failed(format!("HTTP {}", status)));
        }

        crate::metrics::DELIVERIES_TOTAL
            .with_label_values(&["delivered"])
            .inc();
        tracing::info!(
            from = %from.id,
            to = %to.id,
            inbox = %to.inbox,
            "Delivered activity"
        );
        Ok(())
    }
}

/// Queue `activity` for every accepted follower of `from`
///
/// Returns the number of messages enqueued once they are all queued.
pub async fn deliver_followers<Q: DeliveryQueue>(
    db: &Database,
    queue: &Q,
    from: &Actor,
    activity: &serde_json::Value,
) -> Result<usize, AppError> {
    let followers = following::get_followers(db, &from.id).await?;

    for follower in &followers {
        queue
            .enqueue(DeliveryMessage::activity(from, follower, activity.clone()))
            .await?;
    }

    tracing::info!(
        actor_id = %from.id,
        followers = followers.len(),
        "Queued activity for followers"
    );

    Ok(followers.len())
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    /// Fresh activity id under the actor's URL
    pub fn activity_id(actor_id: &str) -> String {
        format!("{}/activities/{}", actor_id, ulid::Ulid::new())
    }

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Reject activity.
    pub fn reject(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Reject",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Undo activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (undoer)
    /// * `object` - Original activity being undone
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }
}
