//! Data models
//!
//! Rust structs representing database entities.
//! Row IDs are ULIDs; timestamps use chrono.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// Random bits below the timestamp in a compat id
const COMPAT_ID_RANDOM_BITS: u32 = 20;

/// Numeric id for clients that expect Mastodon-style snowflakes.
///
/// Millisecond timestamp in the high bits, 20 random bits below, so ids
/// sort by creation time. The store redraws on the rare collision.
pub fn compat_id() -> i64 {
    let ulid = ulid::Ulid::new();
    let millis = ulid.timestamp_ms() as i64;
    let entropy = (ulid.random() & ((1 << COMPAT_ID_RANDOM_BITS) - 1)) as i64;
    (millis << COMPAT_ID_RANDOM_BITS) | entropy
}

// =============================================================================
// Actor
// =============================================================================

/// Wrapped private signing key stored beside a local actor
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub wrapped_private_key: Vec<u8>,
    pub salt: Vec<u8>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("wrapped_private_key", &format_args!("{} bytes", self.wrapped_private_key.len()))
            .field("salt", &format_args!("{} bytes", self.salt.len()))
            .finish()
    }
}

/// Cached profile fields of an actor document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorProfile {
    pub preferred_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A federated identity, local or remote
///
/// Local actors always carry `key_material`; remote actors never do.
#[derive(Debug, Clone)]
pub struct Actor {
    /// Canonical actor URL
    pub id: String,
    /// ActivityStreams type (Person, Service, ...)
    pub kind: String,
    pub is_local: bool,
    /// `localPart@domain`
    pub handle: String,
    pub public_key_pem: String,
    pub key_material: Option<KeyMaterial>,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub outbox: Option<String>,
    pub followers: Option<String>,
    pub following: Option<String>,
    pub profile: ActorProfile,
    /// Numeric compatibility id
    pub compat_id: i64,
    pub created_at: DateTime<Utc>,
    /// Last time the record was written (registration or remote fetch)
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    /// Key id advertised in the actor document and used in signatures
    pub fn key_id(&self) -> String {
        crate::federation::key_id_for(&self.id)
    }
}

/// Raw `actors` row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActorRow {
    pub id: String,
    pub kind: String,
    pub is_local: bool,
    pub handle: String,
    pub public_key_pem: String,
    pub wrapped_private_key: Option<Vec<u8>>,
    pub private_key_salt: Option<Vec<u8>>,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub outbox: Option<String>,
    pub followers: Option<String>,
    pub following: Option<String>,
    pub profile_json: String,
    pub compat_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ActorRow> for Actor {
    type Error = AppError;

    /// A row that breaks the key invariant or carries an unreadable profile
    /// is corrupt; the caller cannot recover from it.
    fn try_from(row: ActorRow) -> Result<Self, Self::Error> {
        let key_material = match (row.is_local, row.wrapped_private_key, row.private_key_salt) {
            (true, Some(wrapped_private_key), Some(salt)) => Some(KeyMaterial {
                wrapped_private_key,
                salt,
            }),
            (false, None, None) => None,
            (is_local, _, _) => {
                return Err(AppError::Internal(anyhow::anyhow!(
                    "corrupt actor record {}: is_local={} does not match stored key material",
                    row.id,
                    is_local
                )));
            }
        };

        let profile: ActorProfile = serde_json::from_str(&row.profile_json).map_err(|error| {
            AppError::Internal(anyhow::anyhow!(
                "corrupt actor record {}: unreadable profile: {}",
                row.id,
                error
            ))
        })?;

        Ok(Actor {
            id: row.id,
            kind: row.kind,
            is_local: row.is_local,
            handle: row.handle,
            public_key_pem: row.public_key_pem,
            key_material,
            inbox: row.inbox,
            shared_inbox: row.shared_inbox,
            outbox: row.outbox,
            followers: row.followers,
            following: row.following,
            profile,
            compat_id: row.compat_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// =============================================================================
// Relationships
// =============================================================================

/// Follow relationship state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowState {
    Pending,
    Accepted,
}

impl FollowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            _ => None,
        }
    }
}

/// `actor_id` follows (or asked to follow) `target_actor_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub actor_id: String,
    pub target_actor_id: String,
    pub state: FollowState,
    pub target_actor_acct: String,
    pub created_at: DateTime<Utc>,
}

/// Raw `actor_following` row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RelationshipRow {
    pub id: String,
    pub actor_id: String,
    pub target_actor_id: String,
    pub state: String,
    pub target_actor_acct: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<RelationshipRow> for Relationship {
    type Error = AppError;

    fn try_from(row: RelationshipRow) -> Result<Self, Self::Error> {
        let state = FollowState::from_str(&row.state).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "corrupt relationship {}: unknown state {:?}",
                row.id,
                row.state
            ))
        })?;

        Ok(Relationship {
            id: row.id,
            actor_id: row.actor_id,
            target_actor_id: row.target_actor_id,
            state,
            target_actor_acct: row.target_actor_acct,
            created_at: row.created_at,
        })
    }
}

// =============================================================================
// Idempotency
// =============================================================================

/// Record of a processed client-supplied key
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub key: String,
    pub object_id: String,
    pub expires_at: DateTime<Utc>,
}

// =============================================================================
// Delivery queue
// =============================================================================

/// Delivery job status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Delivered,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Delivered => "delivered",
            Self::Dead => "dead",
        }
    }
}

/// A claimed delivery job
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeliveryJob {
    pub id: String,
    pub message_json: String,
    /// Attempts already made before this claim
    pub attempt: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_row() -> ActorRow {
        let now = Utc::now();
        ActorRow {
            id: "https://local.example/users/alice".to_string(),
            kind: "Person".to_string(),
            is_local: true,
            handle: "alice@local.example".to_string(),
            public_key_pem: "pem".to_string(),
            wrapped_private_key: Some(vec![1, 2, 3]),
            private_key_salt: Some(vec![0; 16]),
            inbox: "https://local.example/users/alice/inbox".to_string(),
            shared_inbox: None,
            outbox: None,
            followers: None,
            following: None,
            profile_json: r#"{"preferredUsername":"alice"}"#.to_string(),
            compat_id: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn local_row_converts_with_key_material() {
        let actor = Actor::try_from(local_row()).expect("valid row");
        assert!(actor.key_material.is_some());
        assert_eq!(actor.profile.preferred_username, "alice");
    }

    #[test]
    fn remote_row_with_private_key_is_rejected() {
        let mut row = local_row();
        row.is_local = false;
        assert!(matches!(Actor::try_from(row), Err(AppError::Internal(_))));
    }

    #[test]
    fn local_row_without_private_key_is_rejected() {
        let mut row = local_row();
        row.wrapped_private_key = None;
        row.private_key_salt = None;
        assert!(matches!(Actor::try_from(row), Err(AppError::Internal(_))));
    }

    #[test]
    fn malformed_profile_is_fatal() {
        let mut row = local_row();
        row.profile_json = "{not json".to_string();
        assert!(matches!(Actor::try_from(row), Err(AppError::Internal(_))));
    }

    #[test]
    fn compat_ids_increase_over_time() {
        let first = compat_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = compat_id();
        assert!(second > first);
    }

    #[test]
    fn compat_ids_within_a_millisecond_rarely_collide() {
        let ids: std::collections::HashSet<i64> = (0..1000).map(|_| compat_id()).collect();
        assert!(ids.len() >= 995, "{} distinct ids", ids.len());
        assert!(ids.iter().all(|id| *id > 0));
    }

    #[test]
    fn key_material_debug_hides_bytes() {
        let material = KeyMaterial {
            wrapped_private_key: vec![0xAB; 40],
            salt: vec![0xCD; 16],
        };
        let rendered = format!("{material:?}");
        assert!(rendered.contains("40 bytes"));
        assert!(!rendered.contains("171"));
    }
}
