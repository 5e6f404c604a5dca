//! Token signing keys
//!
//! [`SigningKeyProvider`] is the seam between token issuance and key
//! material. [`HmacKeyProvider`] holds one active HS256 key plus a bounded
//! ring of retired keys that still verify, so rotation never invalidates
//! tokens that were valid a moment earlier.

use crate::constants::{MAX_RETIRED_KEYS, MIN_SIGNING_SECRET_LEN};
use crate::{AuthorityError, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

pub trait SigningKeyProvider: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    /// Key id and key used for new tokens
    fn signing_key(&self) -> (String, EncodingKey);

    /// Key for verifying a token; `None` kid means the active key
    fn verification_key(&self, kid: Option<&str>) -> Option<DecodingKey>;

    /// Make `secret` the active key and retire the current one
    fn rotate(&self, secret: &str) -> Result<String>;

    /// Active key id first, then retired ones newest first
    fn key_ids(&self) -> Vec<String>;
}

struct HmacKey {
    kid: String,
    secret: Vec<u8>,
}

impl HmacKey {
    fn new(secret: &str) -> Result<Self> {
        if secret.len() < MIN_SIGNING_SECRET_LEN {
            return Err(AuthorityError::config(format!(
                "signing secret must be at least {MIN_SIGNING_SECRET_LEN} bytes"
            )));
        }
        Ok(Self {
            kid: key_id(secret),
            secret: secret.as_bytes().to_vec(),
        })
    }
}

struct KeyRing {
    current: HmacKey,
    retired: VecDeque<HmacKey>,
}

pub struct HmacKeyProvider {
    ring: RwLock<KeyRing>,
}

impl HmacKeyProvider {
    pub fn new(secret: &str) -> Result<Self> {
        Self::from_secrets(secret, &[])
    }

    /// Active secret plus previously used secrets, most recent first
    pub fn from_secrets(current: &str, previous: &[String]) -> Result<Self> {
        let current = HmacKey::new(current)?;
        let mut retired = VecDeque::new();
        for secret in previous.iter().take(MAX_RETIRED_KEYS) {
            let key = HmacKey::new(secret)?;
            if key.kid != current.kid {
                retired.push_back(key);
            }
        }

        tracing::info!(
            kid = %current.kid,
            retired = retired.len(),
            "Signing keys loaded"
        );
        Ok(Self {
            ring: RwLock::new(KeyRing { current, retired }),
        })
    }

    /// Random key for development; tokens do not survive a restart
    pub fn ephemeral() -> Self {
        tracing::warn!(
            "No signing secret configured, using an ephemeral key. Tokens will not survive a restart"
        );
        let secret = super::generate_random_token();
        Self {
            ring: RwLock::new(KeyRing {
                current: HmacKey {
                    kid: key_id(&secret),
                    secret: secret.into_bytes(),
                },
                retired: VecDeque::new(),
            }),
        }
    }
}

impl SigningKeyProvider for HmacKeyProvider {
    fn algorithm(&self) -> Algorithm {
        Algorithm::HS256
    }

    fn signing_key(&self) -> (String, EncodingKey) {
        let ring = self.ring.read();
        (
            ring.current.kid.clone(),
            EncodingKey::from_secret(&ring.current.secret),
        )
    }

    fn verification_key(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let ring = self.ring.read();
        let key = match kid {
            None => Some(&ring.current),
            Some(kid) => std::iter::once(&ring.current)
                .chain(ring.retired.iter())
                .find(|k| k.kid == kid),
        };
        key.map(|k| DecodingKey::from_secret(&k.secret))
    }

    fn rotate(&self, secret: &str) -> Result<String> {
        let next = HmacKey::new(secret)?;
        let kid = next.kid.clone();

        let mut ring = self.ring.write();
        if ring.current.kid == kid {
            return Ok(kid);
        }
        ring.retired.retain(|k| k.kid != kid);
        let previous = std::mem::replace(&mut ring.current, next);
        ring.retired.push_front(previous);
        ring.retired.truncate(MAX_RETIRED_KEYS);

        tracing::info!(kid = %kid, "Rotated signing key");
        Ok(kid)
    }

    fn key_ids(&self) -> Vec<String> {
        let ring = self.ring.read();
        std::iter::once(&ring.current)
            .chain(ring.retired.iter())
            .map(|k| k.kid.clone())
            .collect()
    }
}

fn key_id(secret: &str) -> String {
    hex::encode(&Sha256::digest(secret.as_bytes())[..8])
}
