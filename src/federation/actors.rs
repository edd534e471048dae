//! Actor directory
//!
//! Resolves handles and actor URLs to [`Actor`] records, fetching remote
//! actor documents on first use and caching them in the database.
//! Remote failures are soft: they are logged and surface as `None`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::webfinger;
use crate::data::{Actor, ActorProfile, Database, compat_id};
use crate::error::AppError;

const ACTIVITY_JSON: &str = "application/activity+json";

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve remote host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for remote host".to_string(),
        ));
    }

    Ok(())
}

/// Refuse outbound requests to non-HTTP(S) URLs and to loopback or
/// private destinations, including hosts that only resolve to them.
pub(crate) async fn ensure_remote_url_allowed(
    url: &url::Url,
    allow_private_hosts: bool,
) -> Result<(), AppError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    if allow_private_hosts {
        return Ok(());
    }

    if is_disallowed_host(host) {
        return Err(AppError::Forbidden);
    }

    let port = url
        .port_or_known_default()
        .ok_or_else(|| AppError::Validation("Missing port in URL".to_string()))?;
    validate_resolved_host_ips(host, port).await
}

/// Public key block of an actor document
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyDocument {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub owner: String,
    pub public_key_pem: String,
}

/// Shared endpoints advertised by an actor
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorEndpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<String>,
}

/// ActivityStreams actor document, as served and as fetched
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDocument {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub id: String,
    #[serde(rename = "type", default = "default_actor_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub inbox: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<ActorEndpoints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<serde_json::Value>,
    pub public_key: PublicKeyDocument,
}

fn default_actor_type() -> String {
    "Person".to_string()
}

/// `url` of a link or image value, which may be a string, an object or a list
fn link_href(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(href) => Some(href.clone()),
        serde_json::Value::Object(map) => map
            .get("url")
            .or_else(|| map.get("href"))
            .and_then(link_href),
        serde_json::Value::Array(items) => items.iter().find_map(link_href),
        _ => None,
    }
}

fn image_value(href: &Option<String>) -> Option<serde_json::Value> {
    href.as_ref()
        .map(|url| serde_json::json!({ "type": "Image", "url": url }))
}

impl ActorDocument {
    /// Document served for a local actor
    pub fn from_local(actor: &Actor) -> Self {
        Self {
            context: Some(serde_json::json!([
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ])),
            id: actor.id.clone(),
            kind: actor.kind.clone(),
            preferred_username: Some(actor.profile.preferred_username.clone()),
            name: actor.profile.name.clone(),
            summary: actor.profile.summary.clone(),
            inbox: actor.inbox.clone(),
            outbox: actor.outbox.clone(),
            followers: actor.followers.clone(),
            following: actor.following.clone(),
            endpoints: actor.shared_inbox.clone().map(|shared_inbox| ActorEndpoints {
                shared_inbox: Some(shared_inbox),
            }),
            icon: image_value(&actor.profile.icon_url),
            image: image_value(&actor.profile.image_url),
            url: actor.profile.url.clone().map(serde_json::Value::String),
            public_key: PublicKeyDocument {
                id: actor.key_id(),
                owner: actor.id.clone(),
                public_key_pem: actor.public_key_pem.clone(),
            },
        }
    }

    /// Check the document against the URL it was fetched from
    fn validate(&self, fetched_from: &url::Url) -> Result<(), String> {
        let id = url::Url::parse(&self.id).map_err(|e| format!("invalid id: {}", e))?;
        if id.host_str() != fetched_from.host_str()
            || id.port_or_known_default() != fetched_from.port_or_known_default()
        {
            return Err(format!(
                "id host {:?} does not match fetched host {:?}",
                id.host_str(),
                fetched_from.host_str()
            ));
        }

        url::Url::parse(&self.inbox).map_err(|e| format!("invalid inbox: {}", e))?;

        if self.public_key.public_key_pem.trim().is_empty() {
            return Err("empty publicKeyPem".to_string());
        }

        if !self.public_key.owner.is_empty() && self.public_key.owner != self.id {
            return Err("publicKey.owner does not match id".to_string());
        }

        Ok(())
    }

    fn handle(&self) -> String {
        let host = url::Url::parse(&self.id)
            .ok()
            .and_then(|url| {
                url.host_str().map(|host| match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                })
            })
            .unwrap_or_default();
        format!("{}@{}", self.username(), host)
    }

    fn username(&self) -> String {
        self.preferred_username.clone().unwrap_or_else(|| {
            self.id
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string()
        })
    }

    fn profile(&self) -> ActorProfile {
        ActorProfile {
            preferred_username: self.username(),
            name: self.name.clone(),
            summary: self.summary.clone(),
            icon_url: self.icon.as_ref().and_then(link_href),
            image_url: self.image.as_ref().and_then(link_href),
            url: self.url.as_ref().and_then(link_href),
        }
    }

    /// Remote actor record for this document
    fn into_remote_actor(self) -> Actor {
        let now = Utc::now();
        Actor {
            handle: self.handle(),
            profile: self.profile(),
            shared_inbox: self.endpoints.and_then(|endpoints| endpoints.shared_inbox),
            id: self.id,
            kind: self.kind,
            is_local: false,
            public_key_pem: self.public_key.public_key_pem,
            key_material: None,
            inbox: self.inbox,
            outbox: self.outbox,
            followers: self.followers,
            following: self.following,
            compat_id: compat_id(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lookup of local and remote actors
pub struct ActorDirectory {
    db: Arc<Database>,
    http_client: reqwest::Client,
    local_domain: String,
    refresh_after: Duration,
    allow_private_hosts: bool,
}

impl ActorDirectory {
    pub fn new(
        db: Arc<Database>,
        http_client: reqwest::Client,
        local_domain: impl Into<String>,
        refresh_after: Duration,
        allow_private_hosts: bool,
    ) -> Self {
        Self {
            db,
            http_client,
            local_domain: local_domain.into(),
            refresh_after,
            allow_private_hosts,
        }
    }

    /// Resolve `user@domain` (optionally `acct:`/`@` prefixed)
    ///
    /// Local handles are read from the store. Remote handles go through
    /// WebFinger discovery and then [`Self::get_and_cache`].
    pub async fn resolve_by_handle(&self, handle: &str) -> Result<Option<Actor>, AppError> {
        let Some((username, domain)) = webfinger::parse_acct(handle) else {
            tracing::warn!(handle, "Malformed actor handle");
            return Ok(None);
        };
        let normalized = format!("{}@{}", username, domain);

        if domain.eq_ignore_ascii_case(&self.local_domain) {
            return self.db.get_local_actor_by_handle(&normalized).await;
        }

        if let Some(cached) = self.db.get_remote_actor_by_handle(&normalized).await? {
            return self.get_and_cache(&cached.id).await;
        }

        let scheme = self.discovery_scheme(domain);
        let Some(discovery_url) = webfinger::webfinger_url(scheme, domain, &normalized) else {
            return Ok(None);
        };
        let allowed = ensure_remote_url_allowed(&discovery_url, self.allow_private_hosts).await;
        if let Err(error) = allowed {
            tracing::warn!(%error, handle, "Refusing WebFinger lookup");
            return Ok(None);
        }

        let Some(actor_url) =
            webfinger::resolve_acct_link(&self.http_client, discovery_url, &normalized).await
        else {
            crate::metrics::ACTOR_CACHE_TOTAL
                .with_label_values(&["unresolved"])
                .inc();
            return Ok(None);
        };

        self.get_and_cache(&actor_url).await
    }

    /// Cached actor for `actor_url`, fetching and persisting it on a miss
    ///
    /// A cached remote copy older than the refresh interval is refetched;
    /// if that fails the stale copy is returned.
    pub async fn get_and_cache(&self, actor_url: &str) -> Result<Option<Actor>, AppError> {
        let actor_url = actor_url.split('#').next().unwrap_or(actor_url);

        if let Some(cached) = self.db.get_actor(actor_url).await? {
            if cached.is_local || !self.is_stale(&cached) {
                crate::metrics::ACTOR_CACHE_TOTAL
                    .with_label_values(&["hit"])
                    .inc();
                return Ok(Some(cached));
            }

            return self.refresh(cached).await;
        }

        crate::metrics::ACTOR_CACHE_TOTAL
            .with_label_values(&["miss"])
            .inc();

        let Some(document) = self.fetch_document(actor_url).await else {
            return Ok(None);
        };

        let actor = document.into_remote_actor();
        if !self.db.insert_actor(&actor).await? {
            tracing::debug!(actor_id = %actor.id, "Actor cached concurrently; using stored copy");
        }

        self.db.get_actor(&actor.id).await
    }

    /// Refetch a remote actor regardless of cache age
    ///
    /// Used when a signature fails against the cached key, which happens
    /// after a remote key rotation.
    pub async fn refetch(&self, actor_url: &str) -> Result<Option<Actor>, AppError> {
        let actor_url = actor_url.split('#').next().unwrap_or(actor_url);
        match self.db.get_actor(actor_url).await? {
            Some(cached) if !cached.is_local => self.refresh(cached).await,
            Some(local) => Ok(Some(local)),
            None => self.get_and_cache(actor_url).await,
        }
    }

    /// Stored actor by canonical id, without network access
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Actor>, AppError> {
        self.db.get_actor(id).await
    }

    async fn refresh(&self, cached: Actor) -> Result<Option<Actor>, AppError> {
        let Some(document) = self.fetch_document(&cached.id).await else {
            crate::metrics::ACTOR_CACHE_TOTAL
                .with_label_values(&["stale"])
                .inc();
            tracing::warn!(actor_id = %cached.id, "Actor refresh failed; serving cached copy");
            return Ok(Some(cached));
        };

        if document.id != cached.id {
            tracing::warn!(
                actor_id = %cached.id,
                document_id = %document.id,
                "Refetched document has a different id; serving cached copy"
            );
            return Ok(Some(cached));
        }

        let mut refreshed = document.into_remote_actor();
        refreshed.compat_id = cached.compat_id;
        refreshed.created_at = cached.created_at;
        self.db.refresh_remote_actor(&refreshed).await?;

        crate::metrics::ACTOR_CACHE_TOTAL
            .with_label_values(&["refreshed"])
            .inc();
        tracing::debug!(actor_id = %refreshed.id, "Refreshed cached actor");

        self.db.get_actor(&refreshed.id).await
    }

    fn is_stale(&self, actor: &Actor) -> bool {
        let age = Utc::now()
            .signed_duration_since(actor.updated_at)
            .to_std()
            .unwrap_or_default();
        age > self.refresh_after
    }

    /// Development setups federate over plain HTTP on loopback addresses.
    fn discovery_scheme(&self, domain: &str) -> &'static str {
        let host = domain.rsplit_once(':').map(|(host, _)| host).unwrap_or(domain);
        if self.allow_private_hosts && is_disallowed_host(host) {
            "http"
        } else {
            "https"
        }
    }

    async fn fetch_document(&self, actor_url: &str) -> Option<ActorDocument> {
        let url = match url::Url::parse(actor_url) {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!(%error, actor_url, "Invalid actor URL");
                return None;
            }
        };

        if let Err(error) = ensure_remote_url_allowed(&url, self.allow_private_hosts).await {
            tracing::warn!(%error, actor_url, "Refusing to fetch actor");
            return None;
        }

        let started = Instant::now();
        let response = self
            .http_client
            .get(url.clone())
            .header("Accept", ACTIVITY_JSON)
            .send()
            .await;

        crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["fetch"])
            .observe(started.elapsed().as_secs_f64());

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                crate::metrics::FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["fetch", "error"])
                    .inc();
                tracing::warn!(%error, actor_url, "Actor fetch failed");
                return None;
            }
        };

        crate::metrics::FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["fetch", response.status().as_str()])
            .inc();

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), actor_url, "Actor fetch refused");
            return None;
        }

        let document = match response.json::<ActorDocument>().await {
            Ok(document) => document,
            Err(error) => {
                tracing::warn!(%error, actor_url, "Unreadable actor document");
                return None;
            }
        };

        if let Err(reason) = document.validate(&url) {
            tracing::warn!(actor_url, %reason, "Rejected actor document");
            return None;
        }

        Some(document)
    }
}
