//! Static API credential store.
//!
//! Credentials are minted through the management surface and looked up on
//! every authenticated request, so the store keeps two consistent views: an
//! id-keyed map for management operations and a secret-keyed index for O(1)
//! authentication. Revocation tombstones the entry (`active = false`) rather
//! than deleting it, so historic ids stay resolvable for audit.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use rand::RngCore;
use serde::Serialize;

/// Prefix for issued secrets: `gw_live_` followed by 32 lowercase hex chars.
const SECRET_PREFIX: &str = "gw_live_";

/// A long-lived static credential bound to a tier.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    pub secret: String,
    pub name: String,
    pub tier: String,
    pub created_at: i64,
    pub active: bool,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Credential>,
    /// secret -> id. Entries are never removed; `authenticate` checks the
    /// `active` flag so a revoked secret stops resolving immediately.
    by_secret: HashMap<String, String>,
}

/// Thread-safe credential registry.
#[derive(Default)]
pub struct CredentialStore {
    inner: Mutex<Inner>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new credential: id `key_NNN` (zero-padded), secret
    /// `gw_live_<32 hex>`.
    pub fn create(&self, name: &str, tier: &str) -> Credential {
        let mut inner = self.lock();
        let id = format!("key_{:03}", inner.by_id.len() + 1);
        let credential = Credential {
            id: id.clone(),
            secret: generate_secret(),
            name: name.to_string(),
            tier: tier.to_string(),
            created_at: Utc::now().timestamp_millis(),
            active: true,
        };
        inner
            .by_secret
            .insert(credential.secret.clone(), id.clone());
        inner.by_id.insert(id, credential.clone());
        credential
    }

    /// Resolve a presented secret to its credential. Only active credentials
    /// authenticate.
    pub fn authenticate(&self, secret: &str) -> Option<Credential> {
        let inner = self.lock();
        let id = inner.by_secret.get(secret)?;
        inner.by_id.get(id).filter(|c| c.active).cloned()
    }

    /// Tombstone a credential. Returns false when the id is unknown.
    pub fn revoke(&self, id: &str) -> bool {
        let mut inner = self.lock();
        match inner.by_id.get_mut(id) {
            Some(credential) => {
                credential.active = false;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Credential> {
        self.lock().by_id.get(id).cloned()
    }

    /// Count of credentials that can still authenticate.
    pub fn active_count(&self) -> usize {
        self.lock().by_id.values().filter(|c| c.active).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    format!("{SECRET_PREFIX}{}", hex::encode(bytes))
}
