//! WebFinger protocol implementation
//!
//! Used to discover ActivityPub actor URIs from addresses, and to answer
//! discovery queries for local actors.

use serde::{Deserialize, Serialize};

const ACTIVITY_JSON: &str = "application/activity+json";
const LD_JSON_PROFILE: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl WebFingerResponse {
    /// `href` of the `self` link that points at an ActivityStreams document
    pub fn actor_link(&self) -> Option<&str> {
        self.links
            .iter()
            .filter(|link| link.rel == "self")
            .find(|link| {
                link.link_type
                    .as_deref()
                    .map(|t| t == ACTIVITY_JSON || t == LD_JSON_PROFILE)
                    .unwrap_or(false)
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// Split `acct:user@domain`, `@user@domain` or `user@domain`
pub fn parse_acct(resource: &str) -> Option<(&str, &str)> {
    let acct = resource.strip_prefix("acct:").unwrap_or(resource);
    let acct = acct.strip_prefix('@').unwrap_or(acct);
    let (username, domain) = acct.split_once('@')?;

    if username.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }

    Some((username, domain))
}

/// Discovery URL for `acct` on `domain`
pub fn webfinger_url(scheme: &str, domain: &str, acct: &str) -> Option<url::Url> {
    let mut url = match url::Url::parse(&format!("{}://{}/.well-known/webfinger", scheme, domain))
    {
        Ok(url) => url,
        Err(error) => {
            tracing::warn!(%error, domain, "Invalid WebFinger domain");
            return None;
        }
    };
    url.query_pairs_mut()
        .append_pair("resource", &format!("acct:{}", acct));
    Some(url)
}

/// Look up the actor document URL for `acct` at `url`
///
/// The caller vets `url` before anything is sent. Any network, status or
/// parse failure is logged and yields `None`.
pub async fn resolve_acct_link(
    http_client: &reqwest::Client,
    url: url::Url,
    acct: &str,
) -> Option<String> {
    let response = match http_client
        .get(url)
        .header("Accept", "application/jrd+json, application/json")
        .send()
        .await
    {
        Ok(response) => response,
        Err(error) => {
            tracing::warn!(%error, acct, "WebFinger request failed");
            return None;
        }
    };

    if !response.status().is_success() {
        tracing::warn!(status = %response.status(), acct, "WebFinger lookup refused");
        return None;
    }

    match response.json::<WebFingerResponse>().await {
        Ok(jrd) => {
            let link = jrd.actor_link().map(str::to_string);
            if link.is_none() {
                tracing::warn!(acct, "WebFinger response has no ActivityPub self link");
            }
            link
        }
        Err(error) => {
            tracing::warn!(%error, acct, "Unreadable WebFinger response");
            None
        }
    }
}

/// Generate WebFinger response for a local account.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `actor_url` - Canonical actor id
///
/// # Returns
/// JRD response for the account
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    actor_url: &str,
) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_url.to_string()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_JSON.to_string()),
            href: Some(actor_url.to_string()),
            template: None,
        }],
    }
}
