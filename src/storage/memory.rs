//! In-memory storage implementation
//!
//! Fast, non-persistent storage for development and testing.
//! Uses DashMap for lock-free concurrent access.
//!
//! **WARNING:** MemoryStorage is NOT recommended for production use:
//! - Data is lost on process restart
//! - Does not coordinate state across multiple process instances
//!
//! For production deployments, use SqliteStorage.

use super::*;
use crate::constants::ALL_TOKENS;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

type SessionKey = (String, String);
type BlacklistKey = (String, String);

/// In-memory storage implementation
#[derive(Clone)]
pub struct MemoryStorage {
    clients: Arc<DashMap<String, Client>>,
    codes: Arc<DashMap<String, AuthorizationCode>>,
    sessions: Arc<DashMap<String, Session>>,
    // (user_id, client_id) -> session id
    session_index: Arc<DashMap<SessionKey, String>>,
    blacklist: Arc<DashMap<BlacklistKey, BlacklistEntry>>,
    users: Arc<DashMap<String, UserProfile>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage
    pub fn new() -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
            codes: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
            session_index: Arc::new(DashMap::new()),
            blacklist: Arc::new(DashMap::new()),
            users: Arc::new(DashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientStorage for MemoryStorage {
    async fn save_client(&self, client: &Client) -> Result<()> {
        self.clients.insert(client.id.clone(), client.clone());
        Ok(())
    }

    async fn get_client(&self, id: &str) -> Result<Option<Client>> {
        Ok(self.clients.get(id).map(|c| c.clone()))
    }

    async fn list_clients(&self) -> Result<Vec<Client>> {
        let mut clients: Vec<Client> = self.clients.iter().map(|c| c.value().clone()).collect();
        clients.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(clients)
    }
}

#[async_trait]
impl AuthCodeStorage for MemoryStorage {
    async fn save_authorization_code(&self, code: &AuthorizationCode) -> Result<()> {
        self.codes.insert(code.code_hash.clone(), code.clone());
        Ok(())
    }

    async fn take_authorization_code(
        &self,
        code_hash: &str,
        client_id: &str,
    ) -> Result<Option<AuthorizationCode>> {
        // remove_if holds the shard lock across check and removal
        Ok(self
            .codes
            .remove_if(code_hash, |_, code| code.client_id == client_id)
            .map(|(_, code)| code))
    }

    async fn delete_expired_authorization_codes(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0;
        self.codes.retain(|_, code| {
            let keep = !code.is_expired_at(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn upsert_session(&self, session: &Session) -> Result<Session> {
        let key = (session.user_id.clone(), session.client_id.clone());

        // Lock order is always session_index -> sessions
        match self.session_index.entry(key) {
            Entry::Occupied(mut slot) => {
                if let Some(mut existing) = self.sessions.get_mut(slot.get()) {
                    existing.scopes = session.scopes.clone();
                    existing.nonce = session.nonce.clone();
                    existing.auth_time = session.auth_time;
                    existing.claims = session.claims.clone();
                    existing.access_jti = session.access_jti.clone();
                    existing.refresh_jti = session.refresh_jti.clone();
                    existing.expires_at = session.expires_at;
                    return Ok(existing.clone());
                }
                // Index pointed at a session deleted concurrently
                self.sessions.insert(session.id.clone(), session.clone());
                slot.insert(session.id.clone());
                Ok(session.clone())
            }
            Entry::Vacant(slot) => {
                self.sessions.insert(session.id.clone(), session.clone());
                slot.insert(session.id.clone());
                Ok(session.clone())
            }
        }
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    async fn list_sessions(&self, user_id: &str, client_id: Option<&str>) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && client_id.is_none_or(|c| s.client_id == c))
            .map(|s| s.value().clone())
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn delete_session(&self, id: &str) -> Result<bool> {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                self.session_index
                    .remove_if(&(session.user_id, session.client_id), |_, v| v == id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn extend_session(
        &self,
        id: &str,
        additional: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self.sessions.get_mut(id).map(|mut s| {
            s.expires_at += additional;
            s.expires_at
        }))
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        // Collect first so no sessions shard is held while touching the index
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.is_expired_at(now))
            .map(|s| s.id.clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            if let Some((_, session)) = self.sessions.remove_if(&id, |_, s| s.is_expired_at(now)) {
                self.session_index
                    .remove_if(&(session.user_id, session.client_id), |_, v| v == &id);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl BlacklistStorage for MemoryStorage {
    async fn save_blacklist_entry(&self, entry: &BlacklistEntry) -> Result<()> {
        let key = (entry.jti.clone(), entry.user_id.clone());
        self.blacklist
            .entry(key)
            .and_modify(|existing| {
                existing.reason = entry.reason;
                existing.created_at = existing.created_at.max(entry.created_at);
                existing.expires_at = existing.expires_at.max(entry.expires_at);
            })
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn insert_blacklist_entry_if_absent(&self, entry: &BlacklistEntry) -> Result<bool> {
        let key = (entry.jti.clone(), entry.user_id.clone());
        match self.blacklist.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(true)
            }
        }
    }

    async fn is_blacklisted(
        &self,
        jti: &str,
        user_id: &str,
        issued_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let exact = self
            .blacklist
            .get(&(jti.to_string(), user_id.to_string()))
            .is_some_and(|e| e.blocks(jti, issued_at, now));
        if exact {
            return Ok(true);
        }

        Ok(self
            .blacklist
            .get(&(ALL_TOKENS.to_string(), user_id.to_string()))
            .is_some_and(|e| e.blocks(jti, issued_at, now)))
    }

    async fn list_blacklist_entries(&self, user_id: &str) -> Result<Vec<BlacklistEntry>> {
        let mut entries: Vec<BlacklistEntry> = self
            .blacklist
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }

    async fn delete_expired_blacklist_entries(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0;
        self.blacklist.retain(|_, entry| {
            let keep = now < entry.expires_at;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

#[async_trait]
impl UserStorage for MemoryStorage {
    async fn save_user_profile(&self, profile: &UserProfile) -> Result<()> {
        self.users.insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    async fn get_user_profile(&self, id: &str) -> Result<Option<UserProfile>> {
        Ok(self.users.get(id).map(|u| u.clone()))
    }
}
