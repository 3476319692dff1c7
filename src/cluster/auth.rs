//! Join authentication.
//!
//! A node proves it holds the cluster's shared secret by sending a [`JoinRequest`] whose
//! digest is `hex(HMAC-SHA256(secret, "timestamp|node_id|is_replica|tags"))`, with tags
//! joined by `,`. The accepting side recomputes the digest from its own copy of the secret
//! and compares in constant time.
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::protocol::JoinRequest;

type HmacSha256 = Hmac<Sha256>;

const DIGEST_HEX_LEN: usize = 64;
pub const MAX_NODE_ID_LEN: usize = 255;
const FIELD_SEPARATOR: char = '|';
const TAG_SEPARATOR: &str = ",";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("node id is empty")]
    EmptyNodeId,
    #[error("node id is longer than {MAX_NODE_ID_LEN} bytes")]
    NodeIdTooLong,
    #[error("'{0}' contains a reserved separator")]
    ReservedCharacter(String),
    #[error("join request carries no timestamp")]
    MissingTimestamp,
    #[error("digest is not a {DIGEST_HEX_LEN} character hex string")]
    MalformedDigest,
    #[error("digest does not match")]
    BadDigest,
    #[error("join request is {skew:?} away from local time")]
    Stale { skew: Duration },
    #[error("join request was expected, got {0}")]
    UnexpectedMessage(String),
    #[error("join rejected by validator")]
    Rejected,
}

/// Acceptance policy layered on top of the cryptographic check.
pub type JoinValidator = Arc<dyn Fn(&JoinRequest, Option<SocketAddr>) -> bool + Send + Sync>;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn signing_input(timestamp: u64, node_id: &str, is_replica: bool, tags: &[String]) -> String {
    format!(
        "{timestamp}{FIELD_SEPARATOR}{node_id}{FIELD_SEPARATOR}{is_replica}{FIELD_SEPARATOR}{}",
        tags.join(TAG_SEPARATOR)
    )
}

fn mac(secret: &[u8]) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts any key length")
}

/// Computes the hex digest for the given join fields.
pub fn digest(
    secret: &[u8],
    timestamp: u64,
    node_id: &str,
    is_replica: bool,
    tags: &[String],
) -> String {
    let mut mac = mac(secret);
    mac.update(signing_input(timestamp, node_id, is_replica, tags).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

impl JoinRequest {
    /// Builds a join request signed now.
    pub fn signed(secret: &[u8], node_id: &str, tags: &[String], is_replica: bool) -> Self {
        Self::signed_at(secret, node_id, tags, is_replica, now_millis())
    }

    pub fn signed_at(
        secret: &[u8],
        node_id: &str,
        tags: &[String],
        is_replica: bool,
        timestamp: u64,
    ) -> Self {
        Self {
            digest: digest(secret, timestamp, node_id, is_replica, tags),
            node_id: node_id.to_string(),
            tags: tags.to_vec(),
            timestamp,
            is_replica,
        }
    }

    /// Structural checks that need no secret.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.node_id.is_empty() {
            return Err(AuthError::EmptyNodeId);
        }
        if self.node_id.len() > MAX_NODE_ID_LEN {
            return Err(AuthError::NodeIdTooLong);
        }
        if self.node_id.contains(FIELD_SEPARATOR) {
            return Err(AuthError::ReservedCharacter(self.node_id.clone()));
        }
        if let Some(tag) = self
            .tags
            .iter()
            .find(|t| t.contains(FIELD_SEPARATOR) || t.contains(TAG_SEPARATOR))
        {
            return Err(AuthError::ReservedCharacter(tag.clone()));
        }
        if self.timestamp == 0 {
            return Err(AuthError::MissingTimestamp);
        }
        if self.digest.len() != DIGEST_HEX_LEN {
            return Err(AuthError::MalformedDigest);
        }
        Ok(())
    }

    /// Recomputes the digest with `secret` and compares it in constant time.
    pub fn verify(&self, secret: &[u8]) -> Result<(), AuthError> {
        let claimed = hex::decode(&self.digest).map_err(|_| AuthError::MalformedDigest)?;

        let mut mac = mac(secret);
        mac.update(
            signing_input(self.timestamp, &self.node_id, self.is_replica, &self.tags).as_bytes(),
        );
        mac.verify_slice(&claimed).map_err(|_| AuthError::BadDigest)
    }

    /// Rejects requests signed further than `max_skew` from local time.
    pub fn check_freshness(&self, max_skew: Duration) -> Result<(), AuthError> {
        let skew = Duration::from_millis(now_millis().abs_diff(self.timestamp));
        if skew > max_skew {
            return Err(AuthError::Stale { skew });
        }
        Ok(())
    }
}
