//! HTTP Signatures for ActivityPub
//!
//! Outbound requests are signed over `(request-target) host content-type`
//! with RSASSA-PKCS1-v1_5/SHA-256 and carry a `created` parameter.
//! Inbound verification reconstructs whatever components the sender named,
//! so signatures from servers that also sign `date` or `digest` verify too.

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Algorithm label written on outbound signatures
pub const SIGNATURE_ALGORITHM: &str = "rsa-v1_5-sha256";

/// Components signed on every outbound request, in order
pub const SIGNED_COMPONENTS: [&str; 3] = ["(request-target)", "host", "content-type"];

const ACCEPTED_ALGORITHMS: [&str; 3] = ["rsa-v1_5-sha256", "rsa-sha256", "hs2019"];

/// Key id for an actor's main key
pub fn key_id_for(actor_id: &str) -> String {
    format!("{}#main-key", actor_id)
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// A request about to be signed
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub method: Method,
    pub url: url::Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl OutgoingRequest {
    /// `POST` of an ActivityStreams document
    pub fn post_activity(url: url::Url, body: Vec<u8>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/activity+json"),
        );
        Self {
            method: Method::POST,
            url,
            headers,
            body,
        }
    }
}

/// A request with its `Signature` header attached. Never persisted.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: Method,
    pub url: url::Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Sign `request` with the current time as `created`
pub fn sign(
    request: OutgoingRequest,
    signing_key: &RsaPrivateKey,
    key_id: &str,
) -> Result<SignedRequest, AppError> {
    sign_at(request, signing_key, key_id, Utc::now().timestamp())
}

/// Sign `request` with a fixed `created` timestamp
///
/// The body is carried through untouched.
pub fn sign_at(
    request: OutgoingRequest,
    signing_key: &RsaPrivateKey,
    key_id: &str,
    created: i64,
) -> Result<SignedRequest, AppError> {
    let OutgoingRequest {
        method,
        url,
        mut headers,
        body,
    } = request;

    let host = host_header_value(&url)?;
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .ok_or_else(|| AppError::Validation("Content-Type is required for signing".to_string()))?
        .to_str()
        .map_err(|_| AppError::Validation("Invalid Content-Type header".to_string()))?
        .to_string();

    let request_target = format!("{} {}", method.as_str().to_lowercase(), path_and_query(&url));
    let signing_string = [
        format!("(request-target): {}", request_target),
        format!("host: {}", host),
        format!("content-type: {}", content_type),
    ]
    .join("\n");

    let signer = SigningKey::<Sha256>::new(signing_key.clone());
    let signature = signer.sign(signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"{}\",created={},headers=\"{}\",signature=\"{}\"",
        key_id,
        SIGNATURE_ALGORITHM,
        created,
        SIGNED_COMPONENTS.join(" "),
        signature_b64
    );

    headers.insert(
        http::header::HOST,
        HeaderValue::from_str(&host)
            .map_err(|_| AppError::Validation("Invalid host in URL".to_string()))?,
    );
    headers.insert(
        HeaderName::from_static("signature"),
        HeaderValue::from_str(&signature_header)
            .map_err(|_| AppError::Validation("Invalid keyId".to_string()))?,
    );

    Ok(SignedRequest {
        method,
        url,
        headers,
        body,
    })
}

/// Host header as an HTTP client sends it: the port is only included
/// when it differs from the scheme default.
fn host_header_value(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn path_and_query(url: &url::Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Parsed and canonicalized inbound signature
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm label as sent
    pub algorithm: String,
    /// `created` parameter, unix seconds
    pub created: Option<i64>,
    /// `expires` parameter, unix seconds
    pub expires: Option<i64>,
    /// Signed component names, lowercased, in order
    pub headers: Vec<String>,
    /// Decoded signature bytes
    pub signature: Vec<u8>,
    /// `Date` header value, when it is among the signed components
    pub signed_date: Option<DateTime<Utc>>,
    /// String the sender signed, rebuilt from this request
    pub signing_string: String,
}

impl ParsedSignature {
    /// Actor id the key belongs to
    pub fn key_owner(&self) -> &str {
        self.key_id.split('#').next().unwrap_or(&self.key_id)
    }
}

/// Raw `Signature` header parameters
#[derive(Debug, Default)]
struct SignatureParams {
    key_id: Option<String>,
    algorithm: Option<String>,
    created: Option<i64>,
    expires: Option<i64>,
    headers: Option<Vec<String>>,
    signature: Option<String>,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",created=...,headers="...",signature="..."
/// ```
fn parse_signature_params(header: &str) -> Result<SignatureParams, AppError> {
    let mut params = SignatureParams::default();

    // Split by comma and parse key=value pairs
    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            // Remove quotes from value
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => params.key_id = Some(value.to_string()),
                "algorithm" => params.algorithm = Some(value.to_ascii_lowercase()),
                "created" => {
                    params.created = Some(value.parse().map_err(|_| {
                        AppError::Validation("Invalid created parameter".to_string())
                    })?)
                }
                "expires" => {
                    params.expires = Some(value.parse().map_err(|_| {
                        AppError::Validation("Invalid expires parameter".to_string())
                    })?)
                }
                "headers" => {
                    params.headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => params.signature = Some(value.to_string()),
                _ => {} // Ignore unknown fields
            }
        }
    }

    Ok(params)
}

/// Parse the `Signature` header of an inbound request
///
/// Returns `Ok(None)` when the request carries no signature at all; that is
/// an anonymous request, not an error. A present but malformed header, or
/// one naming a component the request lacks, is a validation error.
pub fn parse_signature(
    method: &str,
    path_and_query: &str,
    headers: &HeaderMap,
) -> Result<Option<ParsedSignature>, AppError> {
    let Some(raw) = headers.get("signature") else {
        return Ok(None);
    };
    let raw = raw
        .to_str()
        .map_err(|_| AppError::Validation("Invalid Signature header".to_string()))?;

    let params = parse_signature_params(raw)?;

    let key_id = params
        .key_id
        .ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?;
    let signed_headers = params
        .headers
        .filter(|names| !names.is_empty())
        .ok_or_else(|| AppError::Validation("Missing headers".to_string()))?;
    let signature = BASE64
        .decode(
            params
                .signature
                .ok_or_else(|| AppError::Validation("Missing signature".to_string()))?,
        )
        .map_err(|_| AppError::Validation("Invalid signature encoding".to_string()))?;

    let mut signing_parts = Vec::with_capacity(signed_headers.len());
    let mut signed_date = None;

    for name in &signed_headers {
        let value = match name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path_and_query),
            "(created)" => params
                .created
                .ok_or_else(|| AppError::Validation("Missing created parameter".to_string()))?
                .to_string(),
            "(expires)" => params
                .expires
                .ok_or_else(|| AppError::Validation("Missing expires parameter".to_string()))?
                .to_string(),
            header_name => {
                let value = header_values(headers, header_name)?;
                if header_name == "date" {
                    signed_date = DateTime::parse_from_rfc2822(&value)
                        .map(|date| date.with_timezone(&Utc))
                        .ok();
                }
                value
            }
        };
        signing_parts.push(format!("{}: {}", name, value));
    }

    Ok(Some(ParsedSignature {
        key_id,
        algorithm: params.algorithm.unwrap_or_else(|| "hs2019".to_string()),
        created: params.created,
        expires: params.expires,
        headers: signed_headers,
        signature,
        signed_date,
        signing_string: signing_parts.join("\n"),
    }))
}

fn header_values(headers: &HeaderMap, name: &str) -> Result<String, AppError> {
    let mut values = Vec::new();
    for value in headers.get_all(name) {
        let value = value
            .to_str()
            .map_err(|_| AppError::Validation(format!("Invalid {} header", name)))?;
        values.push(value.trim());
    }

    if values.is_empty() {
        return Err(AppError::Validation(format!("Missing {} header", name)));
    }

    Ok(values.join(", "))
}

/// Check `parsed` against `public_key_pem`
///
/// Any key other than the signer's, an unknown algorithm label or an
/// unreadable key yields `false`.
pub fn verify(parsed: &ParsedSignature, public_key_pem: &str) -> bool {
    let valid = verify_inner(parsed, public_key_pem);

    crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL
        .with_label_values(&[if valid { "valid" } else { "invalid" }])
        .inc();

    valid
}

fn verify_inner(parsed: &ParsedSignature, public_key_pem: &str) -> bool {
    if !ACCEPTED_ALGORITHMS.contains(&parsed.algorithm.as_str()) {
        tracing::debug!(algorithm = %parsed.algorithm, "Unsupported signature algorithm");
        return false;
    }

    let public_key = match RsaPublicKey::from_public_key_pem(public_key_pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_key_pem))
    {
        Ok(key) => key,
        Err(error) => {
            tracing::debug!(%error, key_id = %parsed.key_id, "Unreadable public key");
            return false;
        }
    };

    let Ok(signature) = Pkcs1v15Signature::try_from(parsed.signature.as_slice()) else {
        return false;
    };

    VerifyingKey::<Sha256>::new(public_key)
        .verify(parsed.signing_string.as_bytes(), &signature)
        .is_ok()
}

/// Reject signatures outside the accepted clock window
///
/// `created` is only covered by the signature when `(created)` is one of the
/// signed components; otherwise it is an unsigned parameter that anyone
/// replaying the request can rewrite. The timestamp is therefore taken from,
/// in order: a signed `(created)`, a signed `Date` header, a bare `created`.
/// A signature carrying none of these, or one past its `expires`, is refused.
pub fn check_freshness(
    parsed: &ParsedSignature,
    now: DateTime<Utc>,
    max_skew: Duration,
) -> Result<(), AppError> {
    let signed_created = parsed
        .headers
        .iter()
        .any(|name| name == "(created)")
        .then_some(parsed.created)
        .flatten();
    let timestamp = signed_created
        .or_else(|| parsed.signed_date.map(|date| date.timestamp()))
        .or(parsed.created)
        .ok_or_else(|| {
            tracing::debug!(key_id = %parsed.key_id, "Signature carries no timestamp");
            AppError::InvalidSignature
        })?;

    let skew = (now.timestamp() - timestamp).unsigned_abs();
    if skew > max_skew.as_secs() {
        tracing::debug!(key_id = %parsed.key_id, skew, "Signature outside clock window");
        return Err(AppError::InvalidSignature);
    }

    if let Some(expires) = parsed.expires {
        if expires < now.timestamp() {
            tracing::debug!(key_id = %parsed.key_id, "Signature expired");
            return Err(AppError::InvalidSignature);
        }
    }

    Ok(())
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// When the sender signed a `Digest` header, it must match the body.
pub fn digest_matches_body(parsed: &ParsedSignature, headers: &HeaderMap, body: &[u8]) -> bool {
    if !parsed.headers.iter().any(|name| name == "digest") {
        return true;
    }

    let expected = generate_digest(body);
    headers
        .get("digest")
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(&expected))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use std::sync::OnceLock;

    fn test_keypair() -> &'static (RsaPrivateKey, String) {
        static KEYPAIR: OnceLock<(RsaPrivateKey, String)> = OnceLock::new();
        KEYPAIR.get_or_init(|| {
            let private_key =
                RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("key generation");
            let public_key_pem = RsaPublicKey::from(&private_key)
                .to_public_key_pem(LineEnding::LF)
                .expect("public key pem");
            (private_key, public_key_pem)
        })
    }

    fn other_public_key_pem() -> String {
        let private_key =
            RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("key generation");
        RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .expect("public key pem")
    }

    const KEY_ID: &str = "https://local.example/users/alice#main-key";

    fn signed(url: &str, created: i64) -> SignedRequest {
        let (private_key, _) = test_keypair();
        let request = OutgoingRequest::post_activity(
            url::Url::parse(url).expect("url"),
            br#"{"type":"Follow"}"#.to_vec(),
        );
        sign_at(request, private_key, KEY_ID, created).expect("sign")
    }

    fn parse_signed(request: &SignedRequest) -> ParsedSignature {
        parse_signature(
            request.method.as_str(),
            &path_and_query(&request.url),
            &request.headers,
        )
        .expect("parse")
        .expect("signature present")
    }

    #[test]
    fn signed_request_verifies_against_signer_key() {
        let (_, public_key_pem) = test_keypair();
        let request = signed("https://remote.example/inbox?page=1", 1_700_000_000);
        let parsed = parse_signed(&request);

        assert_eq!(parsed.key_id, KEY_ID);
        assert_eq!(parsed.algorithm, SIGNATURE_ALGORITHM);
        assert_eq!(parsed.created, Some(1_700_000_000));
        assert_eq!(parsed.headers, SIGNED_COMPONENTS.to_vec());
        assert!(verify(&parsed, public_key_pem));
    }

    #[test]
    fn signature_header_has_expected_shape() {
        let request = signed("https://remote.example/inbox", 1_700_000_000);
        let header = request
            .headers
            .get("signature")
            .and_then(|v| v.to_str().ok())
            .expect("signature header");

        assert!(header.starts_with(&format!(
            "keyId=\"{}\",algorithm=\"rsa-v1_5-sha256\",created=1700000000,headers=\"(request-target) host content-type\",signature=\"",
            KEY_ID
        )));
        assert_eq!(request.body, br#"{"type":"Follow"}"#.to_vec());
    }

    #[test]
    fn canonical_string_lists_components_in_order() {
        let request = signed("https://remote.example/users/bob/inbox", 1);
        let parsed = parse_signed(&request);
        assert_eq!(
            parsed.signing_string,
            "(request-target): post /users/bob/inbox\nhost: remote.example\ncontent-type: application/activity+json"
        );
    }

    #[test]
    fn non_default_port_is_part_of_host() {
        let request = signed("http://127.0.0.1:8081/inbox", 1);
        assert_eq!(
            request.headers.get(http::header::HOST).expect("host"),
            "127.0.0.1:8081"
        );
    }

    #[test]
    fn other_key_does_not_verify() {
        let request = signed("https://remote.example/inbox", 1);
        let parsed = parse_signed(&request);
        assert!(!verify(&parsed, &other_public_key_pem()));
    }

    #[test]
    fn tampered_request_target_does_not_verify() {
        let (_, public_key_pem) = test_keypair();
        let request = signed("https://remote.example/inbox", 1);
        let parsed = parse_signature("POST", "/other-inbox", &request.headers)
            .expect("parse")
            .expect("present");
        assert!(!verify(&parsed, public_key_pem));
    }

    #[test]
    fn tampered_host_does_not_verify() {
        let (_, public_key_pem) = test_keypair();
        let mut request = signed("https://remote.example/inbox", 1);
        request
            .headers
            .insert(http::header::HOST, HeaderValue::from_static("evil.example"));
        let parsed = parse_signed(&request);
        assert!(!verify(&parsed, public_key_pem));
    }

    #[test]
    fn missing_signature_header_is_anonymous() {
        let headers = HeaderMap::new();
        let parsed = parse_signature("POST", "/inbox", &headers).expect("no error");
        assert!(parsed.is_none());
    }

    #[test]
    fn malformed_signature_header_is_an_error() {
        let mut headers = HeaderMap::new();
        headers.insert("signature", HeaderValue::from_static("algorithm=\"rsa-sha256\""));
        assert!(matches!(
            parse_signature("POST", "/inbox", &headers),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn named_but_absent_header_is_an_error() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "signature",
            HeaderValue::from_static(
                "keyId=\"https://remote.example/users/alice#main-key\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date\",signature=\"ZmFrZQ==\"",
            ),
        );
        headers.insert("host", HeaderValue::from_static("local.example"));

        match parse_signature("POST", "/inbox", &headers) {
            Err(AppError::Validation(msg)) => assert!(msg.contains("date")),
            other => panic!("expected missing date error, got: {other:?}"),
        }
    }

    #[test]
    fn date_and_digest_signatures_from_other_servers_verify() {
        let (private_key, public_key_pem) = test_keypair();
        let body = br#"{"type":"Undo"}"#;
        let date = "Tue, 07 Jun 2022 20:51:35 GMT";
        let digest = generate_digest(body);
        let signing_string = format!(
            "(request-target): post /users/alice/inbox\nhost: local.example\ndate: {}\ndigest: {}",
            date, digest
        );
        let signature = SigningKey::<Sha256>::new(private_key.clone())
            .sign(signing_string.as_bytes())
            .to_bytes();

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("local.example"));
        headers.insert("date", HeaderValue::from_static(date));
        headers.insert("digest", HeaderValue::from_str(&digest).expect("digest"));
        headers.insert(
            "signature",
            HeaderValue::from_str(&format!(
                "keyId=\"https://remote.example/users/bob#main-key\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date digest\",signature=\"{}\"",
                BASE64.encode(signature)
            ))
            .expect("signature"),
        );

        let parsed = parse_signature("POST", "/users/alice/inbox", &headers)
            .expect("parse")
            .expect("present");
        assert!(verify(&parsed, public_key_pem));
        assert!(parsed.signed_date.is_some());
        assert!(digest_matches_body(&parsed, &headers, body));
        assert!(!digest_matches_body(&parsed, &headers, b"{}"));
    }

    #[test]
    fn unknown_algorithm_does_not_verify() {
        let (_, public_key_pem) = test_keypair();
        let request = signed("https://remote.example/inbox", 1);
        let mut parsed = parse_signed(&request);
        parsed.algorithm = "ed25519".to_string();
        assert!(!verify(&parsed, public_key_pem));
    }

    #[test]
    fn freshness_window_is_enforced() {
        let now = Utc::now();
        let window = Duration::from_secs(300);

        let fresh = parse_signed(&signed("https://remote.example/inbox", now.timestamp() - 10));
        assert!(check_freshness(&fresh, now, window).is_ok());

        let stale = parse_signed(&signed("https://remote.example/inbox", now.timestamp() - 301));
        assert!(matches!(
            check_freshness(&stale, now, window),
            Err(AppError::InvalidSignature)
        ));

        let future = parse_signed(&signed("https://remote.example/inbox", now.timestamp() + 301));
        assert!(check_freshness(&future, now, window).is_err());
    }

    #[test]
    fn signature_without_timestamp_is_not_fresh() {
        let request = signed("https://remote.example/inbox", 1);
        let mut parsed = parse_signed(&request);
        parsed.created = None;
        assert!(check_freshness(&parsed, Utc::now(), Duration::from_secs(300)).is_err());
    }

    #[test]
    fn signed_date_outranks_unsigned_created() {
        let now = Utc::now();
        let window = Duration::from_secs(300);
        let mut parsed = parse_signed(&signed("https://remote.example/inbox", now.timestamp()));
        parsed.signed_date = Some(now - chrono::Duration::seconds(3600));

        // A fresh but unsigned `created` cannot revive an old signed Date
        assert!(check_freshness(&parsed, now, window).is_err());

        // Once `(created)` is signed it is authoritative
        parsed.headers.push("(created)".to_string());
        assert!(check_freshness(&parsed, now, window).is_ok());
    }

    #[test]
    fn key_id_matches_actor_accepts_same_actor() {
        assert!(key_id_matches_actor(
            "https://remote.example/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
    }

    #[test]
    fn key_id_matches_actor_rejects_different_actor() {
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
    }

    #[test]
    fn key_id_for_appends_main_key_fragment() {
        assert_eq!(
            key_id_for("https://local.example/users/alice"),
            "https://local.example/users/alice#main-key"
        );
    }
}
