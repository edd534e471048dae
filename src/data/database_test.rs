//! Database tests

use super::*;
use chrono::Utc;
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

fn remote_actor(id: &str, handle: &str) -> Actor {
    let now = Utc::now();
    Actor {
        id: id.to_string(),
        kind: "Person".to_string(),
        is_local: false,
        handle: handle.to_string(),
        public_key_pem: "remote-pem".to_string(),
        key_material: None,
        inbox: format!("{}/inbox", id),
        shared_inbox: None,
        outbox: None,
        followers: None,
        following: None,
        profile: ActorProfile {
            preferred_username: handle.split('@').next().unwrap().to_string(),
            ..ActorProfile::default()
        },
        compat_id: compat_id(),
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
    // Connection successful if we get here without panicking
}

#[tokio::test]
async fn test_actor_insert_and_get() {
    let (db, _temp_dir) = create_test_db().await;
    let actor = remote_actor("https://remote.example/users/bob", "bob@remote.example");

    assert!(db.insert_actor(&actor).await.unwrap());

    let stored = db.get_actor(&actor.id).await.unwrap().unwrap();
    assert_eq!(stored.handle, "bob@remote.example");
    assert_eq!(stored.profile.preferred_username, "bob");
    assert!(!stored.is_local);

    let by_handle = db
        .get_remote_actor_by_handle("BOB@remote.example")
        .await
        .unwrap();
    assert_eq!(by_handle.map(|a| a.id), Some(actor.id.clone()));
}

#[tokio::test]
async fn test_duplicate_actor_insert_is_ignored() {
    let (db, _temp_dir) = create_test_db().await;
    let first = remote_actor("https://remote.example/users/bob", "bob@remote.example");
    let mut second = remote_actor("https://remote.example/users/bob", "bob@remote.example");
    second.public_key_pem = "other-pem".to_string();

    assert!(db.insert_actor(&first).await.unwrap());
    assert!(!db.insert_actor(&second).await.unwrap());

    let stored = db.get_actor(&first.id).await.unwrap().unwrap();
    assert_eq!(stored.public_key_pem, "remote-pem");
}

#[tokio::test]
async fn test_compat_id_collision_is_redrawn() {
    let (db, _temp_dir) = create_test_db().await;
    let mut bob = remote_actor("https://remote.example/users/bob", "bob@remote.example");
    let mut carol = remote_actor("https://remote.example/users/carol", "carol@remote.example");
    bob.compat_id = 42;
    carol.compat_id = 42;

    assert!(db.insert_actor(&bob).await.unwrap());
    assert!(db.insert_actor(&carol).await.unwrap());

    let stored = db.get_actor(&carol.id).await.unwrap().unwrap();
    assert_ne!(stored.compat_id, 42);
    assert_eq!(db.get_actor(&bob.id).await.unwrap().unwrap().compat_id, 42);
}

#[tokio::test]
async fn test_remote_actor_with_key_material_is_refused_by_store() {
    let (db, _temp_dir) = create_test_db().await;
    let mut actor = remote_actor("https://remote.example/users/bob", "bob@remote.example");
    actor.key_material = Some(KeyMaterial {
        wrapped_private_key: vec![1, 2, 3],
        salt: vec![0; 16],
    });

    assert!(db.insert_actor(&actor).await.is_err());
}

#[tokio::test]
async fn test_refresh_overwrites_remote_actor() {
    let (db, _temp_dir) = create_test_db().await;
    let mut actor = remote_actor("https://remote.example/users/bob", "bob@remote.example");
    db.insert_actor(&actor).await.unwrap();

    actor.public_key_pem = "rotated-pem".to_string();
    actor.updated_at = Utc::now();
    db.refresh_remote_actor(&actor).await.unwrap();

    let stored = db.get_actor(&actor.id).await.unwrap().unwrap();
    assert_eq!(stored.public_key_pem, "rotated-pem");
}

#[tokio::test]
async fn test_following_pair_is_unique() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();

    let first = db
        .insert_following("rel-1", "a", "b", "b@remote.example", now)
        .await
        .unwrap();
    let second = db
        .insert_following("rel-2", "a", "b", "b@remote.example", now)
        .await
        .unwrap();

    assert_eq!(first, "rel-1");
    assert_eq!(second, "rel-1");
}

#[tokio::test]
async fn test_accept_and_delete_following() {
    let (db, _temp_dir) = create_test_db().await;
    db.insert_following("rel-1", "a", "b", "b@remote.example", Utc::now())
        .await
        .unwrap();

    assert!(db.get_accepted_follower_ids("b").await.unwrap().is_empty());
    assert!(db.accept_following("a", "b").await.unwrap());
    assert!(!db.accept_following("a", "b").await.unwrap());
    assert_eq!(db.get_accepted_follower_ids("b").await.unwrap(), vec!["a"]);
    assert_eq!(
        db.get_accepted_following_accts("a").await.unwrap(),
        vec!["b@remote.example"]
    );

    assert!(db.delete_following("a", "b").await.unwrap());
    assert!(!db.delete_following("a", "b").await.unwrap());
}

#[tokio::test]
async fn test_idempotency_key_insert_is_first_writer_wins() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();
    let expires = now + chrono::Duration::hours(1);

    assert!(db.insert_idempotency_key("k", "o1", expires, now).await.unwrap());
    assert!(!db.insert_idempotency_key("k", "o2", expires, now).await.unwrap());

    let record = db.get_idempotency_record("k").await.unwrap().unwrap();
    assert_eq!(record.object_id, "o1");
}

#[tokio::test]
async fn test_expired_idempotency_key_is_replaced() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();

    assert!(
        db.insert_idempotency_key("k", "o1", now - chrono::Duration::seconds(5), now)
            .await
            .unwrap()
    );
    assert!(
        db.insert_idempotency_key("k", "o2", now + chrono::Duration::hours(1), now)
            .await
            .unwrap()
    );

    let record = db.get_idempotency_record("k").await.unwrap().unwrap();
    assert_eq!(record.object_id, "o2");
    assert!(record.expires_at > now);
}

#[tokio::test]
async fn test_delivery_job_lifecycle() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now().timestamp_millis();

    db.insert_delivery_job("job-1", "{}", now).await.unwrap();
    db.insert_delivery_job("job-2", "{}", now).await.unwrap();

    let claimed = db.claim_delivery_jobs(now, now + 60_000, 10).await.unwrap();
    assert_eq!(claimed.len(), 2);

    db.mark_job_delivered("job-1", 1, now).await.unwrap();
    db.reschedule_job("job-2", 1, now + 10_000, "HTTP 503")
        .await
        .unwrap();

    // Not due yet.
    assert!(db.claim_delivery_jobs(now, now + 60_000, 10).await.unwrap().is_empty());

    let later = db
        .claim_delivery_jobs(now + 10_000, now + 70_000, 10)
        .await
        .unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].attempt, 1);

    db.mark_job_dead("job-2", 2, "HTTP 410", now + 10_000)
        .await
        .unwrap();
    assert_eq!(db.count_delivery_jobs(JobStatus::Delivered).await.unwrap(), 1);
    assert_eq!(db.count_delivery_jobs(JobStatus::Dead).await.unwrap(), 1);
    assert_eq!(db.count_delivery_jobs(JobStatus::Queued).await.unwrap(), 0);
}

#[tokio::test]
async fn test_prune_removes_only_settled_jobs_past_retention() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now().timestamp_millis();
    for id in ["old-delivered", "old-dead", "fresh-delivered", "waiting"] {
        db.insert_delivery_job(id, "{}", now).await.unwrap();
    }
    db.mark_job_delivered("old-delivered", 1, now - 120_000)
        .await
        .unwrap();
    db.mark_job_dead("old-dead", 3, "HTTP 410", now - 120_000)
        .await
        .unwrap();
    db.mark_job_delivered("fresh-delivered", 1, now).await.unwrap();

    let pruned = db.prune_settled_jobs(now - 60_000).await.unwrap();

    assert_eq!(pruned, 2);
    assert_eq!(db.count_delivery_jobs(JobStatus::Delivered).await.unwrap(), 1);
    assert_eq!(db.count_delivery_jobs(JobStatus::Dead).await.unwrap(), 0);
    assert_eq!(db.count_delivery_jobs(JobStatus::Queued).await.unwrap(), 1);
}

#[tokio::test]
async fn test_claim_respects_limit() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now().timestamp_millis();
    for n in 0..5 {
        db.insert_delivery_job(&format!("job-{}", n), "{}", now)
            .await
            .unwrap();
    }

    assert_eq!(db.claim_delivery_jobs(now, now + 1000, 3).await.unwrap().len(), 3);
    assert_eq!(db.claim_delivery_jobs(now, now + 1000, 3).await.unwrap().len(), 2);
}
