//! Local account registration
//!
//! Creates local actors: generates and wraps the signing key, derives the
//! actor URLs from the server base URL, and persists the record.

use chrono::Utc;
use rsa::RsaPrivateKey;

use crate::config::{AccountsConfig, ServerConfig};
use crate::data::{Actor, ActorProfile, Database, KeyMaterial, compat_id};
use crate::error::AppError;
use crate::federation::{Kek, WrappedKey, generate_key_with_bits, wrap_private_key};

fn normalize_optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(str::to_string)
}

fn validate_username(username: &str) -> Result<(), AppError> {
    if username.is_empty() {
        return Err(AppError::Validation("username cannot be empty".to_string()));
    }

    if username.len() > 30 {
        return Err(AppError::Validation(
            "username must be at most 30 characters".to_string(),
        ));
    }

    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(AppError::Validation(
            "username may only contain letters, digits and underscores".to_string(),
        ));
    }

    Ok(())
}

/// Register a local actor with a freshly generated key of `key_bits`
///
/// # Errors
/// `Validation` for an invalid or already registered username
pub async fn create_local_actor(
    db: &Database,
    kek: &Kek,
    server: &ServerConfig,
    username: &str,
    display_name: Option<&str>,
    key_bits: usize,
) -> Result<Actor, AppError> {
    let username = username.trim();
    validate_username(username)?;

    // Fast-path guard before expensive key generation.
    ensure_username_available(db, server, username).await?;

    let wrapped = tokio::task::spawn_blocking({
        let kek = kek.clone();
        move || generate_key_with_bits(&kek, key_bits)
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))??;

    persist_local_actor(db, server, username, display_name, wrapped).await
}

/// Register a local actor with an existing private key
pub async fn create_local_actor_with_key(
    db: &Database,
    kek: &Kek,
    server: &ServerConfig,
    username: &str,
    display_name: Option<&str>,
    private_key: &RsaPrivateKey,
) -> Result<Actor, AppError> {
    let username = username.trim();
    validate_username(username)?;
    ensure_username_available(db, server, username).await?;

    let wrapped = tokio::task::spawn_blocking({
        let kek = kek.clone();
        let private_key = private_key.clone();
        move || wrap_private_key(&kek, &private_key)
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))??;

    persist_local_actor(db, server, username, display_name, wrapped).await
}

/// Create every configured bootstrap actor that does not exist yet
///
/// Existing actors are left alone, so this is safe to run on every start.
/// Returns the actors created by this call.
pub async fn ensure_local_actors(
    db: &Database,
    kek: &Kek,
    server: &ServerConfig,
    accounts: &AccountsConfig,
    key_bits: usize,
) -> Result<Vec<Actor>, AppError> {
    let mut created = Vec::new();

    for entry in &accounts.bootstrap {
        let username = entry.username.trim();
        let handle = format!("{}@{}", username, server.domain);
        if let Some(existing) = db.get_local_actor_by_handle(&handle).await? {
            tracing::info!(actor_id = %existing.id, "Local actor exists");
            continue;
        }

        tracing::info!(handle = %handle, "Creating configured local actor...");
        let actor = create_local_actor(
            db,
            kek,
            server,
            username,
            entry.display_name.as_deref(),
            key_bits,
        )
        .await?;
        created.push(actor);
    }

    Ok(created)
}

async fn ensure_username_available(
    db: &Database,
    server: &ServerConfig,
    username: &str,
) -> Result<(), AppError> {
    let handle = format!("{}@{}", username, server.domain);
    if db.get_local_actor_by_handle(&handle).await?.is_some() {
        return Err(AppError::Validation(format!(
            "username {} is already taken",
            username
        )));
    }
    Ok(())
}

async fn persist_local_actor(
    db: &Database,
    server: &ServerConfig,
    username: &str,
    display_name: Option<&str>,
    wrapped: WrappedKey,
) -> Result<Actor, AppError> {
    let base_url = server.base_url();
    let id = format!("{}/users/{}", base_url.trim_end_matches('/'), username);
    let now = Utc::now();

    let actor = Actor {
        inbox: format!("{}/inbox", id),
        outbox: Some(format!("{}/outbox", id)),
        followers: Some(format!("{}/followers", id)),
        following: Some(format!("{}/following", id)),
        shared_inbox: Some(format!("{}/inbox", base_url.trim_end_matches('/'))),
        kind: "Person".to_string(),
        is_local: true,
        handle: format!("{}@{}", username, server.domain),
        public_key_pem: wrapped.public_key_pem,
        key_material: Some(KeyMaterial {
            wrapped_private_key: wrapped.wrapped_private_key,
            salt: wrapped.salt,
        }),
        profile: ActorProfile {
            preferred_username: username.to_string(),
            name: normalize_optional_text(display_name),
            url: Some(id.clone()),
            ..ActorProfile::default()
        },
        compat_id: compat_id(),
        created_at: now,
        updated_at: now,
        id,
    };

    let inserted = match db.insert_actor(&actor).await {
        Ok(inserted) => inserted,
        Err(AppError::Database(sqlx::Error::Database(error))) if error.is_unique_violation() => {
            false
        }
        Err(error) => return Err(error),
    };

    if !inserted {
        return Err(AppError::Validation(format!(
            "username {} is already taken",
            username
        )));
    }

    tracing::info!(actor_id = %actor.id, handle = %actor.handle, "Local actor created");
    db.get_actor(&actor.id).await?.ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("local actor {} vanished after insert", actor.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootstrapActor;
    use crate::federation::unwrap_key;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn create_test_db() -> (Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("service-accounts.db");
        let db = Database::connect(&db_path).await.unwrap();
        (Arc::new(db), temp_dir)
    }

    fn server() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            domain: "local.example".to_string(),
            protocol: "https".to_string(),
        }
    }

    fn kek() -> Kek {
        Kek::new("k".repeat(32))
    }

    fn test_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap()
    }

    #[tokio::test]
    async fn create_local_actor_builds_urls_and_persists() {
        let (db, _temp_dir) = create_test_db().await;
        let key = test_key();

        let actor =
            create_local_actor_with_key(&db, &kek(), &server(), " alice ", Some(" Alice "), &key)
                .await
                .unwrap();

        assert_eq!(actor.id, "https://local.example/users/alice");
        assert_eq!(actor.inbox, "https://local.example/users/alice/inbox");
        assert_eq!(
            actor.outbox.as_deref(),
            Some("https://local.example/users/alice/outbox")
        );
        assert_eq!(
            actor.followers.as_deref(),
            Some("https://local.example/users/alice/followers")
        );
        assert_eq!(
            actor.following.as_deref(),
            Some("https://local.example/users/alice/following")
        );
        assert_eq!(actor.handle, "alice@local.example");
        assert_eq!(actor.profile.name.as_deref(), Some("Alice"));

        let stored = db.get_actor(&actor.id).await.unwrap().unwrap();
        assert!(stored.is_local);
        let material = stored.key_material.unwrap();
        let recovered = unwrap_key(&kek(), &material.wrapped_private_key, &material.salt).unwrap();
        assert_eq!(
            rsa::RsaPublicKey::from(&recovered)
                .to_public_key_pem(LineEnding::LF)
                .unwrap(),
            stored.public_key_pem
        );
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let (db, _temp_dir) = create_test_db().await;
        let key = test_key();

        create_local_actor_with_key(&db, &kek(), &server(), "alice", None, &key)
            .await
            .unwrap();
        let error = create_local_actor_with_key(&db, &kek(), &server(), "ALICE", None, &key)
            .await
            .unwrap_err();

        assert!(matches!(error, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn invalid_usernames_are_rejected() {
        let (db, _temp_dir) = create_test_db().await;
        let key = test_key();

        for username in ["", "   ", "has space", "sl/ash"] {
            let error = create_local_actor_with_key(&db, &kek(), &server(), username, None, &key)
                .await
                .unwrap_err();
            assert!(matches!(error, AppError::Validation(_)), "{username:?}");
        }
    }

    #[tokio::test]
    async fn small_generated_keys_are_refused() {
        let (db, _temp_dir) = create_test_db().await;
        let error = create_local_actor(&db, &kek(), &server(), "bob", None, 1024)
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::Validation(_)));
        assert!(db.get_local_actor_by_handle("bob@local.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn configured_actors_are_created_once() {
        let (db, _temp_dir) = create_test_db().await;
        let accounts = AccountsConfig {
            bootstrap: vec![BootstrapActor {
                username: "relay".to_string(),
                display_name: Some("Relay".to_string()),
            }],
        };

        let created = ensure_local_actors(&db, &kek(), &server(), &accounts, 2048)
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].handle, "relay@local.example");
        assert_eq!(created[0].profile.name.as_deref(), Some("Relay"));

        let again = ensure_local_actors(&db, &kek(), &server(), &accounts, 2048)
            .await
            .unwrap();
        assert!(again.is_empty());

        let stored = db
            .get_local_actor_by_handle("relay@local.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.public_key_pem, created[0].public_key_pem);
    }
}
