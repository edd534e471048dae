//! ActivityPub federation module
//!
//! Handles:
//! - Actor keys (generation, at-rest wrapping)
//! - HTTP Signatures
//! - Actor discovery and caching (WebFinger, actor documents)
//! - Follow relationships
//! - Activity delivery and the delivery queue
//! - Inbox processing

mod actors;
mod delivery;
mod following;
mod inbox;
mod keys;
mod queue;
mod signature;
mod webfinger;

pub use actors::{ActorDirectory, ActorDocument, ActorEndpoints, PublicKeyDocument};
pub use delivery::{DeliveryDispatcher, builder, deliver_followers};
pub use following::{
    accept_following, add_following, get_followers, get_following_acct, get_following_id,
    get_relationship, remove_following,
};
pub use inbox::{Inbox, InboxOutcome, InboxRequest};
pub use keys::{
    Kek, MIN_RSA_BITS, WrappedKey, generate_key, generate_key_with_bits, unwrap_key,
    wrap_private_key,
};
pub use queue::{
    DeliveryMessage, DeliveryQueue, DeliveryWorker, JobOutcome, MessageKind, SigningRef,
    SqliteDeliveryQueue, next_backoff,
};
pub use signature::{
    OutgoingRequest, ParsedSignature, SIGNATURE_ALGORITHM, SIGNED_COMPONENTS, SignedRequest,
    check_freshness, digest_matches_body, generate_digest, key_id_for, key_id_matches_actor,
    parse_signature, sign, sign_at, verify,
};
pub use webfinger::{
    WebFingerLink, WebFingerResponse, generate_webfinger_response, parse_acct, resolve_acct_link,
    webfinger_url,
};
